//! GFX 层的配置
//!
//! 可以直接使用 [`GfxConfig::default`]，也可以从 toml 读取：
//! ```toml
//! app_name = "sandbox"
//! max_frames_in_flight = 2
//! present_mode = "mailbox"
//! ```

use std::path::Path;
use std::time::Duration;

use ash::vk;
use serde::Deserialize;

use crate::error::{GfxError, GfxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentMode {
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

impl PresentMode {
    #[inline]
    pub fn vk_present_mode(self) -> vk::PresentModeKHR {
        match self {
            PresentMode::Fifo => vk::PresentModeKHR::FIFO,
            PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GfxConfig {
    pub app_name: String,

    /// CPU 最多领先 GPU 的帧数
    pub max_frames_in_flight: u32,

    /// zombie 队列长度超过该值时输出警告，通常意味着 GPU 不再推进
    pub zombie_warn_threshold: usize,

    /// one time submit（例如上传数据）等待 GPU 完成的超时时间
    pub one_time_submit_timeout_ms: u64,

    /// 是否开启 validation layer
    pub enable_validation: bool,

    pub present_mode: PresentMode,

    /// 优先使用独立显卡
    pub prefer_discrete_gpu: bool,
}

impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            app_name: "vigil".to_string(),
            max_frames_in_flight: 3,
            zombie_warn_threshold: 4096,
            one_time_submit_timeout_ms: 5000,
            enable_validation: cfg!(debug_assertions),
            present_mode: PresentMode::Fifo,
            prefer_discrete_gpu: true,
        }
    }
}

impl GfxConfig {
    pub fn from_toml_str(text: &str) -> GfxResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| GfxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> GfxResult<Self> {
        let path = path.as_ref();
        log::info!("loading gfx config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> GfxResult<()> {
        if self.max_frames_in_flight == 0 {
            return Err(GfxError::Config("max_frames_in_flight must be at least 1".to_string()));
        }
        if self.zombie_warn_threshold == 0 {
            return Err(GfxError::Config("zombie_warn_threshold must be at least 1".to_string()));
        }
        Ok(())
    }

    #[inline]
    pub fn one_time_submit_timeout(&self) -> Duration {
        Duration::from_millis(self.one_time_submit_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = GfxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_frames_in_flight, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = GfxConfig::from_toml_str(
            r#"
            app_name = "sandbox"
            max_frames_in_flight = 2
            present_mode = "mailbox"
            "#,
        )
        .unwrap();

        assert_eq!(config.app_name, "sandbox");
        assert_eq!(config.max_frames_in_flight, 2);
        assert_eq!(config.present_mode, PresentMode::Mailbox);
        assert_eq!(config.zombie_warn_threshold, GfxConfig::default().zombie_warn_threshold);
    }

    #[test]
    fn test_zero_frames_in_flight_rejected() {
        let err = GfxConfig::from_toml_str("max_frames_in_flight = 0").unwrap_err();
        assert!(matches!(err, GfxError::Config(_)));
    }

    #[test]
    fn test_unknown_present_mode_rejected() {
        assert!(GfxConfig::from_toml_str("present_mode = \"vsync\"").is_err());
    }
}
