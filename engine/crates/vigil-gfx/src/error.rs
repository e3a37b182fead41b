//! GFX 层的错误类型
//!
//! 三类错误：
//! - 创建失败：`Type::create` 返回 `Err`，`Type::from` 打印日志并返回 null handle
//! - 录制误用：在非 Recording 状态下录制命令、传入 null handle
//! - 提交失败 / 设备丢失：`submit` / `present` 返回 `Err`

use std::time::Duration;

use ash::vk;
use thiserror::Error;

use crate::commands::command_buffer::CommandBufferState;
use crate::resources::resource::ResourceKind;

#[derive(Error, Debug)]
pub enum GfxError {
    /// 原生 API 调用失败
    #[error("vulkan call failed: {0}")]
    Vulkan(vk::Result),

    /// 无法加载 vulkan 动态库
    #[error("failed to load vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("no suitable physical device: {0}")]
    NoSuitableDevice(String),

    #[error("surface is not supported: {0}")]
    SurfaceUnsupported(String),

    /// 命令缓冲状态不满足操作的前置条件，状态保持不变
    #[error("command buffer `{name}` is {actual:?}, expected {expected}")]
    InvalidCommandBufferState {
        name: String,
        expected: &'static str,
        actual: CommandBufferState,
    },

    #[error("null {0:?} handle")]
    NullResource(ResourceKind),

    #[error("invalid shader code: {0}")]
    InvalidShaderCode(String),

    /// host 端 signal 的值必须严格递增
    #[error("timeline value {requested} must be greater than current value {current}")]
    InvalidTimelineValue { current: u64, requested: u64 },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// 设备丢失是致命错误，之后所有的提交都会失败
    #[error("device lost")]
    DeviceLost,

    /// surface 的尺寸发生了变化，需要重新创建 swapchain
    #[error("swapchain is out of date")]
    OutOfDate,

    #[error("buffer `{name}` access out of range: offset {offset} + size {size} > {capacity}")]
    OutOfRange {
        name: String,
        offset: u64,
        size: u64,
        capacity: u64,
    },

    #[error("buffer `{0}` is not host visible")]
    NotHostVisible(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GfxResult<T> = Result<T, GfxError>;

impl From<vk::Result> for GfxError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => GfxError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => GfxError::OutOfDate,
            other => GfxError::Vulkan(other),
        }
    }
}

impl GfxError {
    #[inline]
    pub fn is_device_lost(&self) -> bool {
        matches!(self, GfxError::DeviceLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_result_mapping() {
        assert!(GfxError::from(vk::Result::ERROR_DEVICE_LOST).is_device_lost());
        assert!(matches!(GfxError::from(vk::Result::ERROR_OUT_OF_DATE_KHR), GfxError::OutOfDate));
        assert!(matches!(
            GfxError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GfxError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
    }
}
