//! Vigil GFX：GPU 资源生命周期与命令提交
//!
//! 所有 GPU 对象都通过 `Type::from(&device, info)` 创建，返回引用计数的 [`Resource<T>`]。
//! 最后一个 handle 被 drop 时对象不会立刻销毁，而是带着当时的 CPU timeline 进入 zombie 队列，
//! 等 GPU timeline 追上之后，在 [`Device::clear_garbage`] 中真正销毁。
//!
//! 原生 API 通过 [`GfxBackend`] 隔离：
//! - [`VulkanBackend`]：基于 ash / vk-mem 的实现
//! - [`HeadlessBackend`]：纯软件模拟的 GPU，用于测试以及没有显卡的环境
//!
//! # 使用示例
//! ```ignore
//! let device = Device::new_headless(GfxConfig::default(), HeadlessBackend::new())?;
//! let pool = CommandPool::from(&device, CommandPoolInfo::new("frame"));
//! let cmd = CommandBuffer::from(&device, CommandBufferInfo::new(&pool, "main"));
//!
//! cmd.begin()?;
//! cmd.dispatch([8, 8, 1])?;
//! cmd.end()?;
//! device.submit(&SubmitInfo::new(&[&cmd]))?;
//!
//! // 每帧调用一次
//! device.clear_garbage();
//! ```
//!
//! [`Resource<T>`]: resources::resource::Resource
//! [`Device::clear_garbage`]: foundation::device::Device::clear_garbage
//! [`GfxBackend`]: backend::GfxBackend
//! [`VulkanBackend`]: backend::vulkan::VulkanBackend
//! [`HeadlessBackend`]: backend::headless::HeadlessBackend

pub mod backend;
pub mod basic;
pub mod commands;
pub mod config;
pub mod error;
pub mod foundation;
pub mod pipelines;
pub mod resources;
pub mod swapchain;

pub use ash::vk;
