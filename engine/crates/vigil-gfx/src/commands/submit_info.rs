use ash::vk;

use crate::commands::command_buffer::CommandBuffer;
use crate::commands::fence::Fence;
use crate::commands::semaphore::Semaphore;
use crate::resources::resource::Resource;
use crate::swapchain::render_swapchain::Swapchain;

/// 一次提交的内容
///
/// ```ignore
/// let info = SubmitInfo::new(&[&cmd])
///     .wait_fence(&upload_done, 3, vk::PipelineStageFlags2::TRANSFER)
///     .signal_semaphore(&render_done, vk::PipelineStageFlags2::ALL_COMMANDS);
/// device.submit(&info)?;
/// ```
#[derive(Default)]
pub struct SubmitInfo<'a> {
    pub(crate) command_buffers: Vec<&'a Resource<CommandBuffer>>,
    pub(crate) wait_fences: Vec<(&'a Resource<Fence>, u64, vk::PipelineStageFlags2)>,
    pub(crate) wait_semaphores: Vec<(&'a Resource<Semaphore>, vk::PipelineStageFlags2)>,
    pub(crate) signal_fences: Vec<(&'a Resource<Fence>, u64, vk::PipelineStageFlags2)>,
    pub(crate) signal_semaphores: Vec<(&'a Resource<Semaphore>, vk::PipelineStageFlags2)>,
}

impl<'a> SubmitInfo<'a> {
    pub fn new(command_buffers: &[&'a Resource<CommandBuffer>]) -> Self {
        Self {
            command_buffers: command_buffers.to_vec(),
            ..Default::default()
        }
    }

    /// builder
    #[inline]
    pub fn command_buffer(mut self, command_buffer: &'a Resource<CommandBuffer>) -> Self {
        self.command_buffers.push(command_buffer);
        self
    }

    /// builder
    #[inline]
    pub fn wait_fence(mut self, fence: &'a Resource<Fence>, value: u64, stage: vk::PipelineStageFlags2) -> Self {
        self.wait_fences.push((fence, value, stage));
        self
    }

    /// builder
    #[inline]
    pub fn wait_semaphore(mut self, semaphore: &'a Resource<Semaphore>, stage: vk::PipelineStageFlags2) -> Self {
        self.wait_semaphores.push((semaphore, stage));
        self
    }

    /// builder
    #[inline]
    pub fn signal_fence(mut self, fence: &'a Resource<Fence>, value: u64, stage: vk::PipelineStageFlags2) -> Self {
        self.signal_fences.push((fence, value, stage));
        self
    }

    /// builder
    #[inline]
    pub fn signal_semaphore(mut self, semaphore: &'a Resource<Semaphore>, stage: vk::PipelineStageFlags2) -> Self {
        self.signal_semaphores.push((semaphore, stage));
        self
    }
}

/// 一帧的 present
///
/// acquire / present semaphore 以及 swapchain 的 frame fence 由 Device 自动添加
pub struct PresentInfo<'a> {
    pub(crate) swapchain: &'a Resource<Swapchain>,
    pub(crate) command_buffers: Vec<&'a Resource<CommandBuffer>>,
    pub(crate) wait_fences: Vec<(&'a Resource<Fence>, u64, vk::PipelineStageFlags2)>,
}

impl<'a> PresentInfo<'a> {
    pub fn new(swapchain: &'a Resource<Swapchain>) -> Self {
        Self {
            swapchain,
            command_buffers: Vec::new(),
            wait_fences: Vec::new(),
        }
    }

    /// builder
    #[inline]
    pub fn command_buffer(mut self, command_buffer: &'a Resource<CommandBuffer>) -> Self {
        self.command_buffers.push(command_buffer);
        self
    }

    /// builder
    #[inline]
    pub fn wait_fence(mut self, fence: &'a Resource<Fence>, value: u64, stage: vk::PipelineStageFlags2) -> Self {
        self.wait_fences.push((fence, value, stage));
        self
    }
}
