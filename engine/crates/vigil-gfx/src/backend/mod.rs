//! 原生图形 API 的隔离层
//!
//! 上层（资源、命令缓冲、Device、Swapchain）只和 [`GfxBackend`] 打交道。
//! 两个后端共享 ash 的 `vk::*` handle 类型作为不透明的句柄：
//! - [`vulkan::VulkanBackend`]：真正的 Vulkan 实现
//! - [`headless::HeadlessBackend`]：软件模拟的 GPU，句柄由计数器生成

pub mod headless;
pub mod vulkan;

use std::ffi::CStr;
use std::ptr::NonNull;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::commands::barrier::{BufferBarrier, ImageBarrier, MemoryBarrier};
use crate::error::GfxResult;
use crate::pipelines::pipeline::GraphicsState;
use crate::resources::buffer::MemoryLocation;
use crate::resources::sampler::SamplerInfo;

/// host 可见内存的映射地址，在 buffer 的整个生命周期内保持不变
#[derive(Debug, Clone, Copy)]
pub struct MappedPtr(NonNull<u8>);

// 映射地址只在 buffer 存活期间使用，读写由 Buffer 负责边界检查
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

impl MappedPtr {
    #[inline]
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }
}

pub struct NativeBufferDesc<'a> {
    pub name: &'a str,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

#[derive(Debug, Clone, Copy)]
pub struct NativeBuffer {
    pub handle: vk::Buffer,
    /// 只有 host 可见的 buffer 才会被映射
    pub mapped: Option<MappedPtr>,
    /// 只有 usage 包含 SHADER_DEVICE_ADDRESS 时才有值
    pub device_address: Option<vk::DeviceAddress>,
}

pub struct NativeImageDesc<'a> {
    pub name: &'a str,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct NativeImage {
    pub handle: vk::Image,
    /// 默认的 image view，覆盖所有的 mip 和 layer
    pub view: vk::ImageView,
}

pub struct NativeImageViewDesc<'a> {
    pub name: &'a str,
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
}

pub struct NativeShaderStage<'a> {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry_point: &'a CStr,
}

pub struct NativePipelineDesc<'a> {
    pub name: &'a str,
    pub bind_point: vk::PipelineBindPoint,
    pub stages: &'a [NativeShaderStage<'a>],
    pub push_constant_ranges: &'a [vk::PushConstantRange],
    /// compute pipeline 时为 None
    pub graphics: Option<&'a GraphicsState>,
}

#[derive(Debug, Clone, Copy)]
pub struct NativePipeline {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

pub struct NativeSwapchainDesc<'a> {
    pub name: &'a str,
    pub surface: vk::SurfaceKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    /// 重建时传入旧的 swapchain，没有则为 null
    pub old_swapchain: vk::SwapchainKHR,
}

#[derive(Debug, Clone)]
pub struct NativeSwapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

/// 提交时等待或者 signal 的一个 semaphore
///
/// binary semaphore 的 value 为 0
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreSubmit {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

impl SemaphoreSubmit {
    #[inline]
    pub fn timeline(semaphore: vk::Semaphore, value: u64, stage: vk::PipelineStageFlags2) -> Self {
        Self { semaphore, value, stage }
    }

    #[inline]
    pub fn binary(semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2) -> Self {
        Self {
            semaphore,
            value: 0,
            stage,
        }
    }
}

/// 一次原生的 queue submit
pub struct NativeSubmit<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub waits: &'a [SemaphoreSubmit],
    pub signals: &'a [SemaphoreSubmit],
}

#[derive(Debug, Clone, Copy)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn vk_clear_value(self) -> vk::ClearValue {
        match self {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NativeAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: ClearValue,
}

/// 录制到命令缓冲中的一条原生命令
///
/// 命令缓冲的状态机以及 barrier 合批都在上层完成，这里只负责翻译
#[derive(Debug)]
pub enum NativeCommand<'a> {
    PipelineBarrier {
        memory: &'a [MemoryBarrier],
        buffer: &'a [BufferBarrier],
        image: &'a [ImageBarrier],
    },
    BeginRendering {
        area: vk::Rect2D,
        color_attachments: &'a [NativeAttachment],
        depth_attachment: Option<NativeAttachment>,
    },
    EndRendering,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &'a [u8],
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: &'a [vk::Buffer],
        offsets: &'a [vk::DeviceSize],
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        group_count: [u32; 3],
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &'a [vk::BufferCopy],
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &'a [vk::BufferImageCopy],
    },
    BeginLabel {
        name: &'a str,
        color: [f32; 4],
    },
    EndLabel,
}

/// 原生图形 API 的抽象
///
/// 所有的 `destroy_*` 只会在 zombie 被回收（或者 Device 销毁）时调用一次
pub trait GfxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    // buffer & image
    fn create_buffer(&self, desc: &NativeBufferDesc) -> GfxResult<NativeBuffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// 将 host 写入的数据对 GPU 可见
    fn flush_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()>;
    /// 将 GPU 写入的数据对 host 可见
    fn invalidate_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()>;

    fn create_image(&self, desc: &NativeImageDesc) -> GfxResult<NativeImage>;
    /// 同时销毁 image 的默认 view
    fn destroy_image(&self, image: NativeImage);
    fn create_image_view(&self, desc: &NativeImageViewDesc) -> GfxResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_sampler(&self, info: &SamplerInfo) -> GfxResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // shader & pipeline
    fn create_shader_module(&self, name: &str, code: &[u32]) -> GfxResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_pipeline(&self, desc: &NativePipelineDesc) -> GfxResult<NativePipeline>;
    fn destroy_pipeline(&self, pipeline: NativePipeline);

    // command
    fn create_command_pool(&self, name: &str) -> GfxResult<vk::CommandPool>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool, name: &str) -> GfxResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()>;
    fn record(&self, command_buffer: vk::CommandBuffer, command: &NativeCommand);

    // sync
    fn create_timeline_semaphore(&self, name: &str, initial_value: u64) -> GfxResult<vk::Semaphore>;
    fn create_binary_semaphore(&self, name: &str) -> GfxResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn timeline_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64>;
    /// host 端 signal
    fn signal_timeline(&self, semaphore: vk::Semaphore, value: u64) -> GfxResult<()>;
    /// 超时返回 `Ok(false)`
    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> GfxResult<bool>;

    // queue
    fn submit(&self, submit: &NativeSubmit) -> GfxResult<()>;
    fn wait_idle(&self) -> GfxResult<()>;

    // presentation
    /// headless 后端不需要 window
    fn create_surface(&self, window: Option<(RawDisplayHandle, RawWindowHandle)>) -> GfxResult<vk::SurfaceKHR>;
    fn destroy_surface(&self, surface: vk::SurfaceKHR);
    fn create_swapchain(&self, desc: &NativeSwapchainDesc) -> GfxResult<NativeSwapchain>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// 与 `vkAcquireNextImageKHR` 一致：返回 (image index, suboptimal)
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool), vk::Result>;
    /// 与 `vkQueuePresentKHR` 一致：返回 suboptimal
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool, vk::Result>;
}

/// `Duration` 转换为原生 API 使用的纳秒
#[inline]
pub fn timeout_ns(timeout: std::time::Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}
