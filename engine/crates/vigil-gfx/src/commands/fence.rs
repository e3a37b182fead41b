use std::time::Duration;

use ash::vk;

use crate::backend::{self, GfxBackend};
use crate::error::{GfxError, GfxResult};
use crate::foundation::device::Device;
use crate::resources::arena::{ResourceArena, ResourceArenas};
use crate::resources::resource::{DeviceResource, RefCountedDeviceResource, Resource, ResourceKind};

pub struct FenceInfo {
    pub name: String,
    pub initial_value: u64,
}

impl FenceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_value: 0,
        }
    }

    /// builder
    #[inline]
    pub fn initial_value(mut self, value: u64) -> Self {
        self.initial_value = value;
        self
    }
}

/// timeline semaphore 的封装
///
/// 计数只增不减，用于：
/// - device 的 GPU timeline
/// - 命令缓冲的完成状态
/// - swapchain 的帧节奏
pub struct Fence {
    base: RefCountedDeviceResource,
    handle: vk::Semaphore,
    name: String,
}

impl DeviceResource for Fence {
    const KIND: ResourceKind = ResourceKind::Fence;

    fn base(&self) -> &RefCountedDeviceResource {
        &self.base
    }

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self> {
        &arenas.fences
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn destroy_native(&self, backend: &dyn GfxBackend) {
        backend.destroy_semaphore(self.handle);
    }
}

// 创建
impl Fence {
    pub fn create(device: &Device, info: FenceInfo) -> GfxResult<Resource<Self>> {
        let handle = device.backend().create_timeline_semaphore(&info.name, info.initial_value)?;
        Ok(device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle,
            name: info.name,
        }))
    }

    /// 创建失败时返回 null handle
    pub fn from(device: &Device, info: FenceInfo) -> Resource<Self> {
        let name = info.name.clone();
        Self::create(device, info).unwrap_or_else(|e| {
            log::error!("failed to create fence `{}`: {}", name, e);
            Resource::null()
        })
    }
}

// getters
impl Fence {
    #[inline]
    pub fn native(&self) -> vk::Semaphore {
        self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// tools
impl Fence {
    /// 当前的计数
    #[inline]
    pub fn value(&self) -> GfxResult<u64> {
        self.base.backend().timeline_value(self.handle)
    }

    /// 在 host 端将计数设置为 `value`，`value` 必须大于当前的计数
    pub fn signal(&self, value: u64) -> GfxResult<()> {
        let current = self.value()?;
        if value <= current {
            return Err(GfxError::InvalidTimelineValue {
                current,
                requested: value,
            });
        }
        self.base.device().check(self.base.backend().signal_timeline(self.handle, value))
    }

    /// 在 host 端将计数加 1，返回新的计数
    pub fn signal_next(&self) -> GfxResult<u64> {
        let value = self.value()? + 1;
        self.signal(value)?;
        Ok(value)
    }

    /// 阻塞直到计数达到 `value`，超时返回 `Ok(false)`
    pub fn wait_for_value(&self, value: u64, timeout: Duration) -> GfxResult<bool> {
        let _span = tracy_client::span!("Fence::wait_for_value");
        self.base
            .device()
            .check(self.base.backend().wait_timeline(self.handle, value, backend::timeout_ns(timeout)))
    }
}
