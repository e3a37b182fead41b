//! 命令缓冲的录制状态机
//!
//! ```text
//! Initial --begin--> Recording --end--> Executable --submit--> Pending
//!    ^                                      |  ^                   |
//!    +--------------reset-------------------+  +---完成（惰性检查）--+
//! ```
//!
//! - 录制的 barrier 先放入批次中，批次满了、或者遇到 draw / dispatch / copy / rendering 命令时
//!   合并为一次 pipeline barrier
//! - 录制命令时使用的资源会被命令缓冲持有，直到 reset

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ash::vk;
use itertools::Itertools;

use crate::backend::{GfxBackend, NativeCommand};
use crate::commands::barrier::{BufferBarrier, ImageBarrier, MemoryBarrier};
use crate::commands::command_pool::CommandPool;
use crate::commands::fence::{Fence, FenceInfo};
use crate::error::{GfxError, GfxResult};
use crate::foundation::device::Device;
use crate::pipelines::pipeline::Pipeline;
use crate::pipelines::rendering_info::RenderingInfo;
use crate::resources::arena::{ResourceArena, ResourceArenas};
use crate::resources::buffer::Buffer;
use crate::resources::image::Image;
use crate::resources::resource::{DeviceResource, RefCountedDeviceResource, Resource, ResourceKey, ResourceKind};

/// 每种 barrier 批次的容量
pub const MAX_COMMAND_BUFFER_BARRIER_COUNT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    /// 已经提交，GPU 还没有执行完成
    Pending,
    /// 录制过程中原生调用失败，只能 reset
    Invalid,
}

pub struct CommandBufferInfo {
    pub name: String,
    pub pool: Resource<CommandPool>,
}

impl CommandBufferInfo {
    pub fn new(pool: &Resource<CommandPool>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: pool.clone(),
        }
    }
}

struct BarrierBatch {
    memory: Vec<MemoryBarrier>,
    buffer: Vec<BufferBarrier>,
    image: Vec<ImageBarrier>,
}

impl Default for BarrierBatch {
    fn default() -> Self {
        Self {
            memory: Vec::with_capacity(MAX_COMMAND_BUFFER_BARRIER_COUNT),
            buffer: Vec::with_capacity(MAX_COMMAND_BUFFER_BARRIER_COUNT),
            image: Vec::with_capacity(MAX_COMMAND_BUFFER_BARRIER_COUNT),
        }
    }
}

impl BarrierBatch {
    #[inline]
    fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffer.is_empty() && self.image.is_empty()
    }

    #[inline]
    fn clear(&mut self) {
        self.memory.clear();
        self.buffer.clear();
        self.image.clear();
    }
}

/// 录制过程中可变的部分
struct Recorder {
    state: CommandBufferState,

    /// begin 时加 1，completion fence 达到该值说明这次录制的内容已经执行完成
    recording_timeline: u64,
    /// 这次录制的内容是否已经提交过，重复提交需要使用新的 timeline 值
    submitted: bool,

    barriers: BarrierBatch,
    /// 只用于保持引用计数，reset 时释放
    retained: HashMap<(ResourceKind, ResourceKey), Box<dyn Any + Send + Sync>>,

    /// 当前绑定的 pipeline，用于 push constants
    bound_layout: Option<(vk::PipelineLayout, vk::ShaderStageFlags)>,
    rendering: bool,
    label_depth: u32,
}

impl Recorder {
    fn new() -> Self {
        Self {
            state: CommandBufferState::Initial,
            recording_timeline: 0,
            submitted: false,
            barriers: BarrierBatch::default(),
            retained: HashMap::new(),
            bound_layout: None,
            rendering: false,
            label_depth: 0,
        }
    }

    /// 清空录制的内容，释放持有的资源
    fn clear(&mut self) {
        self.barriers.clear();
        self.retained.clear();
        self.bound_layout = None;
        self.rendering = false;
        self.label_depth = 0;
    }

    fn retain<T: DeviceResource>(&mut self, resource: &Resource<T>) {
        self.retained.entry((T::KIND, resource.key())).or_insert_with(|| Box::new(resource.clone()));
    }
}

/// 命令缓冲
///
/// 所有的录制函数在状态不是 Recording、或者传入 null handle 时返回错误，并且不会录制任何内容
///
/// # 使用示例
/// ```ignore
/// let cmd = CommandBuffer::from(&device, CommandBufferInfo::new(&pool, "my-pass"));
/// cmd.begin()?;
/// cmd.image_barrier(&image, ImageBarrier::new().layout_transfer(old, new))?;
/// cmd.begin_rendering(&rendering_info)?;
/// cmd.draw(3, 1, 0, 0)?;
/// cmd.end_rendering()?;
/// cmd.end()?;
/// ```
pub struct CommandBuffer {
    base: RefCountedDeviceResource,
    handle: vk::CommandBuffer,
    name: String,

    pool: Resource<CommandPool>,
    completion: Resource<Fence>,

    recorder: Mutex<Recorder>,
}

impl DeviceResource for CommandBuffer {
    const KIND: ResourceKind = ResourceKind::CommandBuffer;

    fn base(&self) -> &RefCountedDeviceResource {
        &self.base
    }

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self> {
        &arenas.command_buffers
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn destroy_native(&self, backend: &dyn GfxBackend) {
        if let Some(pool) = self.pool.get() {
            backend.free_command_buffer(pool.native(), self.handle);
        }
    }
}

// new & init
impl CommandBuffer {
    pub fn create(device: &Device, info: CommandBufferInfo) -> GfxResult<Resource<Self>> {
        let pool = info.pool.try_get()?;
        let backend = device.backend();
        let handle = backend.allocate_command_buffer(pool.native(), &info.name)?;

        let completion = match Fence::create(device, FenceInfo::new(format!("{}-completion", info.name))) {
            Ok(fence) => fence,
            Err(e) => {
                backend.free_command_buffer(pool.native(), handle);
                return Err(e);
            }
        };

        let cmd = device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle,
            name: info.name,
            pool: info.pool.clone(),
            completion,
            recorder: Mutex::new(Recorder::new()),
        });
        if let Some(weak) = cmd.downgrade() {
            pool.register(weak);
        }
        Ok(cmd)
    }

    /// 创建失败时返回 null handle
    pub fn from(device: &Device, info: CommandBufferInfo) -> Resource<Self> {
        let name = info.name.clone();
        Self::create(device, info).unwrap_or_else(|e| {
            log::error!("failed to create command buffer `{}`: {}", name, e);
            Resource::null()
        })
    }
}

// getters
impl CommandBuffer {
    #[inline]
    pub fn native(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn pool(&self) -> &Resource<CommandPool> {
        &self.pool
    }

    #[inline]
    pub fn completion_fence(&self) -> &Fence {
        &self.completion
    }

    /// 会先检查是否已经执行完成
    pub fn state(&self) -> CommandBufferState {
        let mut recorder = self.lock();
        self.refresh(&mut recorder);
        recorder.state
    }

    #[inline]
    pub fn recording_timeline(&self) -> u64 {
        self.lock().recording_timeline
    }

    /// 持有的资源数量
    #[inline]
    pub fn retained_count(&self) -> usize {
        self.lock().retained.len()
    }

    /// 批次中还没有 flush 的 barrier 数量
    pub fn pending_barrier_count(&self) -> usize {
        let recorder = self.lock();
        recorder.barriers.memory.len() + recorder.barriers.buffer.len() + recorder.barriers.image.len()
    }
}

// 状态机
impl CommandBuffer {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_error(&self, expected: &'static str, actual: CommandBufferState) -> GfxError {
        GfxError::InvalidCommandBufferState {
            name: self.name.clone(),
            expected,
            actual,
        }
    }

    /// Pending 的命令缓冲执行完成之后变为 Executable
    fn refresh(&self, recorder: &mut Recorder) {
        if recorder.state != CommandBufferState::Pending {
            return;
        }
        match self.completion.value() {
            Ok(value) if value >= recorder.recording_timeline => recorder.state = CommandBufferState::Executable,
            Ok(_) => {}
            Err(e) => log::error!("failed to query completion of `{}`: {}", self.name, e),
        }
    }

    /// 只有 Recording 状态才能录制命令
    fn recording(&self) -> GfxResult<MutexGuard<'_, Recorder>> {
        let recorder = self.lock();
        if recorder.state != CommandBufferState::Recording {
            return Err(self.state_error("Recording", recorder.state));
        }
        Ok(recorder)
    }

    /// 提交的内容是否已经执行完成（不是 Pending）
    pub fn is_completed(&self) -> bool {
        self.state() != CommandBufferState::Pending
    }

    /// 阻塞直到提交的内容执行完成，超时返回 `Ok(false)`
    pub fn wait_until_completed(&self, timeout: Duration) -> GfxResult<bool> {
        let target = {
            let recorder = self.lock();
            if recorder.state != CommandBufferState::Pending {
                return Ok(true);
            }
            recorder.recording_timeline
        };
        self.completion.wait_for_value(target, timeout)
    }

    /// 开始录制，只能从 Initial 状态开始
    pub fn begin(&self) -> GfxResult<()> {
        let mut recorder = self.lock();
        if recorder.state != CommandBufferState::Initial {
            return Err(self.state_error("Initial", recorder.state));
        }

        self.base.backend().begin_command_buffer(self.handle)?;
        recorder.recording_timeline += 1;
        recorder.submitted = false;
        recorder.state = CommandBufferState::Recording;
        Ok(())
    }

    /// 结束录制，会先 flush 所有的 barrier
    pub fn end(&self) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        if recorder.rendering {
            return Err(GfxError::InvalidArgument(format!("`{}` ends inside a rendering scope", self.name)));
        }
        if recorder.label_depth != 0 {
            log::warn!("`{}` ends with {} unclosed debug labels", self.name, recorder.label_depth);
        }

        self.flush_locked(&mut recorder);
        if let Err(e) = self.base.backend().end_command_buffer(self.handle) {
            recorder.state = CommandBufferState::Invalid;
            return Err(e);
        }
        recorder.state = CommandBufferState::Executable;
        Ok(())
    }

    /// 回到 Initial 状态，释放持有的资源
    ///
    /// 只能从 Executable（已经执行完成）或者 Invalid 状态 reset
    pub fn reset(&self) -> GfxResult<()> {
        let mut recorder = self.lock();
        self.refresh(&mut recorder);
        if !matches!(recorder.state, CommandBufferState::Executable | CommandBufferState::Invalid) {
            return Err(self.state_error("Executable or Invalid", recorder.state));
        }

        self.base.backend().reset_command_buffer(self.handle)?;
        recorder.clear();
        recorder.state = CommandBufferState::Initial;
        Ok(())
    }

    /// 提交时 completion fence 需要达到的值，只有 Executable 状态才能提交
    pub(crate) fn submit_target(&self) -> GfxResult<u64> {
        let mut recorder = self.lock();
        self.refresh(&mut recorder);
        if recorder.state != CommandBufferState::Executable {
            return Err(self.state_error("Executable", recorder.state));
        }
        Ok(if recorder.submitted { recorder.recording_timeline + 1 } else { recorder.recording_timeline })
    }

    pub(crate) fn mark_pending(&self, target: u64) {
        let mut recorder = self.lock();
        recorder.recording_timeline = target;
        recorder.submitted = true;
        recorder.state = CommandBufferState::Pending;
    }

    pub(crate) fn ensure_not_pending(&self) -> GfxResult<()> {
        let mut recorder = self.lock();
        self.refresh(&mut recorder);
        if recorder.state == CommandBufferState::Pending {
            return Err(self.state_error("not Pending", recorder.state));
        }
        Ok(())
    }

    /// command pool 被 reset 之后，所有的命令缓冲回到 Initial
    pub(crate) fn on_pool_reset(&self) {
        let mut recorder = self.lock();
        recorder.clear();
        recorder.state = CommandBufferState::Initial;
    }
}

// barrier
impl CommandBuffer {
    fn flush_locked(&self, recorder: &mut Recorder) {
        if recorder.barriers.is_empty() {
            return;
        }
        let barriers = &recorder.barriers;
        self.base.backend().record(
            self.handle,
            &NativeCommand::PipelineBarrier {
                memory: &barriers.memory,
                buffer: &barriers.buffer,
                image: &barriers.image,
            },
        );
        recorder.barriers.clear();
    }

    /// 批次满了之后先 flush
    fn reserve_barrier(&self, recorder: &mut Recorder, len: usize) {
        if len >= MAX_COMMAND_BUFFER_BARRIER_COUNT {
            self.flush_locked(recorder);
        }
    }

    /// 将批次中所有的 barrier 合并为一次 pipeline barrier
    pub fn flush_barriers(&self) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        self.flush_locked(&mut recorder);
        Ok(())
    }

    pub fn memory_barrier(&self, barrier: MemoryBarrier) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        let len = recorder.barriers.memory.len();
        self.reserve_barrier(&mut recorder, len);
        recorder.barriers.memory.push(barrier);
        Ok(())
    }

    pub fn buffer_barrier(&self, buffer: &Resource<Buffer>, barrier: BufferBarrier) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        let native = buffer.try_get()?.native();

        let len = recorder.barriers.buffer.len();
        self.reserve_barrier(&mut recorder, len);
        recorder.barriers.buffer.push(BufferBarrier {
            buffer: native,
            ..barrier
        });
        recorder.retain(buffer);
        Ok(())
    }

    /// barrier 没有指定 aspect 时使用 image 的 aspect
    pub fn image_barrier(&self, image: &Resource<Image>, barrier: ImageBarrier) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        let target = image.try_get()?;

        let mut barrier = ImageBarrier {
            image: target.native(),
            ..barrier
        };
        if barrier.subresource_range.aspect_mask.is_empty() {
            barrier.subresource_range.aspect_mask = target.aspect();
        }

        let len = recorder.barriers.image.len();
        self.reserve_barrier(&mut recorder, len);
        recorder.barriers.image.push(barrier);
        recorder.retain(image);
        Ok(())
    }
}

// 数据传输类型
impl CommandBuffer {
    /// - command type: action
    /// - 支持的 queue：transfer，graphics，compute
    pub fn copy_buffer(&self, src: &Resource<Buffer>, dst: &Resource<Buffer>, regions: &[vk::BufferCopy]) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        let (src_buffer, dst_buffer) = (src.try_get()?, dst.try_get()?);
        for region in regions {
            src_buffer.check_range(region.src_offset, region.size)?;
            dst_buffer.check_range(region.dst_offset, region.size)?;
        }

        self.flush_locked(&mut recorder);
        self.base.backend().record(
            self.handle,
            &NativeCommand::CopyBuffer {
                src: src_buffer.native(),
                dst: dst_buffer.native(),
                regions,
            },
        );
        recorder.retain(src);
        recorder.retain(dst);
        Ok(())
    }

    /// - command type: action
    /// - 支持的 queue：transfer，graphics，compute
    pub fn copy_buffer_to_image(
        &self,
        src: &Resource<Buffer>,
        dst: &Resource<Image>,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        let (src_buffer, dst_image) = (src.try_get()?, dst.try_get()?);

        self.flush_locked(&mut recorder);
        self.base.backend().record(
            self.handle,
            &NativeCommand::CopyBufferToImage {
                src: src_buffer.native(),
                dst: dst_image.native(),
                layout,
                regions,
            },
        );
        recorder.retain(src);
        recorder.retain(dst);
        Ok(())
    }
}

// 绘制类型的命令
impl CommandBuffer {
    /// - command type: action, state
    /// - supported queue types: graphics
    pub fn begin_rendering(&self, info: &RenderingInfo) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        if recorder.rendering {
            return Err(GfxError::InvalidArgument(format!("`{}` is already inside a rendering scope", self.name)));
        }
        let color_attachments = info.color_attachments.iter().map(|a| a.native()).collect::<GfxResult<Vec<_>>>()?;
        let depth_attachment = info.depth_attachment.as_ref().map(|a| a.native()).transpose()?;

        self.flush_locked(&mut recorder);
        self.base.backend().record(
            self.handle,
            &NativeCommand::BeginRendering {
                area: info.area,
                color_attachments: &color_attachments,
                depth_attachment,
            },
        );
        for attachment in info.color_attachments.iter().chain(&info.depth_attachment) {
            recorder.retain(&attachment.image);
        }
        recorder.rendering = true;
        Ok(())
    }

    /// - command type: action, state
    /// - supported queue types: graphics
    pub fn end_rendering(&self) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        if !recorder.rendering {
            return Err(GfxError::InvalidArgument(format!("`{}` is not inside a rendering scope", self.name)));
        }

        self.flush_locked(&mut recorder);
        self.base.backend().record(self.handle, &NativeCommand::EndRendering);
        recorder.rendering = false;
        Ok(())
    }

    /// - command type: state
    pub fn bind_pipeline(&self, pipeline: &Resource<Pipeline>) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        let target = pipeline.try_get()?;

        self.base.backend().record(
            self.handle,
            &NativeCommand::BindPipeline {
                bind_point: target.bind_point(),
                pipeline: target.native(),
            },
        );
        recorder.bound_layout = Some((target.layout(), target.push_constant_stages()));
        recorder.retain(pipeline);
        Ok(())
    }

    /// 使用当前绑定的 pipeline 的 layout
    ///
    /// - command type: state
    pub fn push_constants(&self, offset: u32, data: &[u8]) -> GfxResult<()> {
        let recorder = self.recording()?;
        let Some((layout, stages)) = recorder.bound_layout else {
            return Err(GfxError::InvalidArgument(format!("`{}` pushes constants without a pipeline", self.name)));
        };

        self.base.backend().record(
            self.handle,
            &NativeCommand::PushConstants {
                layout,
                stages,
                offset,
                data,
            },
        );
        Ok(())
    }

    #[inline]
    pub fn push_constants_pod<T: bytemuck::Pod>(&self, offset: u32, value: &T) -> GfxResult<()> {
        self.push_constants(offset, bytemuck::bytes_of(value))
    }

    /// - command type: state
    pub fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[(&Resource<Buffer>, vk::DeviceSize)]) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        let natives = buffers.iter().map(|(buffer, _)| buffer.try_get().map(Buffer::native)).collect::<GfxResult<Vec<_>>>()?;
        let offsets = buffers.iter().map(|(_, offset)| *offset).collect_vec();

        self.base.backend().record(
            self.handle,
            &NativeCommand::BindVertexBuffers {
                first_binding,
                buffers: &natives,
                offsets: &offsets,
            },
        );
        for (buffer, _) in buffers {
            recorder.retain(*buffer);
        }
        Ok(())
    }

    /// - command type: state
    pub fn bind_index_buffer(&self, buffer: &Resource<Buffer>, offset: vk::DeviceSize, index_type: vk::IndexType) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        let native = buffer.try_get()?.native();

        self.base.backend().record(
            self.handle,
            &NativeCommand::BindIndexBuffer {
                buffer: native,
                offset,
                index_type,
            },
        );
        recorder.retain(buffer);
        Ok(())
    }

    /// - command type: state
    pub fn set_viewport(&self, viewport: vk::Viewport) -> GfxResult<()> {
        let _recorder = self.recording()?;
        self.base.backend().record(self.handle, &NativeCommand::SetViewport(viewport));
        Ok(())
    }

    /// - command type: state
    pub fn set_scissor(&self, scissor: vk::Rect2D) -> GfxResult<()> {
        let _recorder = self.recording()?;
        self.base.backend().record(self.handle, &NativeCommand::SetScissor(scissor));
        Ok(())
    }

    /// - command type: action
    /// - supported queue types: graphics
    ///
    /// 不使用 index buffer 的绘制
    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        self.flush_locked(&mut recorder);
        self.base.backend().record(
            self.handle,
            &NativeCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            },
        );
        Ok(())
    }

    /// - command type: action
    /// - supported queue types: graphics
    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        self.flush_locked(&mut recorder);
        self.base.backend().record(
            self.handle,
            &NativeCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            },
        );
        Ok(())
    }

    /// - command type: action
    /// - supported queue types: compute
    pub fn dispatch(&self, group_count: [u32; 3]) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        self.flush_locked(&mut recorder);
        self.base.backend().record(self.handle, &NativeCommand::Dispatch { group_count });
        Ok(())
    }
}

// debug label
impl CommandBuffer {
    pub fn begin_label(&self, name: &str, color: [f32; 4]) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        self.base.backend().record(self.handle, &NativeCommand::BeginLabel { name, color });
        recorder.label_depth += 1;
        Ok(())
    }

    pub fn end_label(&self) -> GfxResult<()> {
        let mut recorder = self.recording()?;
        if recorder.label_depth == 0 {
            return Err(GfxError::InvalidArgument(format!("`{}` ends a label that was never begun", self.name)));
        }
        self.base.backend().record(self.handle, &NativeCommand::EndLabel);
        recorder.label_depth -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, NativeObjectKind, RecordedCommand};
    use crate::basic::color::LabelColor;
    use crate::commands::barrier::BarrierMask;
    use crate::commands::command_pool::CommandPoolInfo;
    use crate::commands::submit_info::SubmitInfo;
    use crate::config::GfxConfig;
    use crate::pipelines::rendering_info::RenderingAttachment;
    use crate::resources::buffer::{BufferInfo, MemoryLocation};
    use crate::resources::image::ImageInfo;

    struct Fixture {
        device: Device,
        backend: HeadlessBackend,
        pool: Resource<CommandPool>,
    }

    impl Fixture {
        fn new() -> Self {
            vigil_crate_tools::init_log::init_test_log();
            let backend = HeadlessBackend::new();
            let device = Device::new_headless(GfxConfig::default(), backend.clone()).unwrap();
            let pool = CommandPool::from(&device, CommandPoolInfo::new("pool"));
            Self { device, backend, pool }
        }

        fn cmd(&self, name: &str) -> Resource<CommandBuffer> {
            CommandBuffer::from(&self.device, CommandBufferInfo::new(&self.pool, name))
        }

        fn image(&self, name: &str) -> Resource<Image> {
            Image::from(
                &self.device,
                ImageInfo::new_2d(
                    name,
                    vk::Format::R8G8B8A8_UNORM,
                    vk::Extent2D { width: 4, height: 4 },
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                ),
            )
        }

        fn buffer(&self, name: &str, usage: vk::BufferUsageFlags) -> Resource<Buffer> {
            Buffer::from(&self.device, BufferInfo::new(name, 256, usage, MemoryLocation::GpuOnly))
        }

        fn recorded(&self, cmd: &Resource<CommandBuffer>) -> Vec<RecordedCommand> {
            self.backend.recorded_commands(cmd.native())
        }
    }

    fn barrier_sizes(commands: &[RecordedCommand]) -> Vec<(usize, usize, usize)> {
        commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::PipelineBarrier { memory, buffer, image } => Some((*memory, *buffer, *image)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_begin_twice_fails_and_keeps_recording() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");

        cmd.begin().unwrap();
        let err = cmd.begin().unwrap_err();
        assert!(matches!(
            err,
            GfxError::InvalidCommandBufferState {
                actual: CommandBufferState::Recording,
                ..
            }
        ));
        assert_eq!(cmd.state(), CommandBufferState::Recording);
    }

    #[test]
    fn test_begin_requires_reset_after_completion() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");

        cmd.begin().unwrap();
        cmd.end().unwrap();
        assert!(cmd.begin().is_err());

        fx.device.submit(&SubmitInfo::new(&[&cmd])).unwrap();
        assert!(cmd.begin().is_err());
        assert_eq!(cmd.state(), CommandBufferState::Executable);
        assert!(cmd.begin().is_err());

        cmd.reset().unwrap();
        cmd.begin().unwrap();
        assert_eq!(cmd.recording_timeline(), 2);
    }

    #[test]
    fn test_forty_image_barriers_flush_as_32_then_8() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");
        let image = fx.image("image");

        cmd.begin().unwrap();
        for _ in 0..40 {
            cmd.image_barrier(
                &image,
                ImageBarrier::new()
                    .layout_transfer(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL)
                    .mask(BarrierMask::FULL),
            )
            .unwrap();
        }
        assert_eq!(cmd.pending_barrier_count(), 8);
        cmd.end().unwrap();

        assert_eq!(barrier_sizes(&fx.recorded(&cmd)), vec![(0, 0, 32), (0, 0, 8)]);
        // 同一个 image 只持有一次
        assert_eq!(cmd.retained_count(), 1);
    }

    #[test]
    fn test_full_batch_flushes_all_kinds_together() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");
        let buffer = fx.buffer("buffer", vk::BufferUsageFlags::STORAGE_BUFFER);

        cmd.begin().unwrap();
        cmd.memory_barrier(MemoryBarrier::new(BarrierMask::FULL)).unwrap();
        for _ in 0..33 {
            cmd.buffer_barrier(&buffer, BufferBarrier::new().mask(BarrierMask::FULL)).unwrap();
        }
        cmd.end().unwrap();

        assert_eq!(barrier_sizes(&fx.recorded(&cmd)), vec![(1, 32, 0), (0, 1, 0)]);
    }

    #[test]
    fn test_actions_are_preceded_by_barrier_flush() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");
        let image = fx.image("color");
        let src = fx.buffer("src", vk::BufferUsageFlags::TRANSFER_SRC);
        let dst = fx.buffer("dst", vk::BufferUsageFlags::TRANSFER_DST);

        cmd.begin().unwrap();
        cmd.image_barrier(
            &image,
            ImageBarrier::new().layout_transfer(vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
        )
        .unwrap();
        cmd.begin_rendering(
            &RenderingInfo::new(vk::Extent2D { width: 4, height: 4 }).color_attachment(RenderingAttachment::color(&image)),
        )
        .unwrap();
        cmd.draw(3, 1, 0, 0).unwrap();
        cmd.end_rendering().unwrap();
        cmd.memory_barrier(MemoryBarrier::new(BarrierMask::FULL)).unwrap();
        cmd.memory_barrier(MemoryBarrier::new(BarrierMask::FULL)).unwrap();
        cmd.dispatch([1, 1, 1]).unwrap();
        cmd.buffer_barrier(&src, BufferBarrier::new()).unwrap();
        cmd.copy_buffer(&src, &dst, &[vk::BufferCopy::default().size(16)]).unwrap();
        cmd.end().unwrap();

        let commands = fx.recorded(&cmd);
        assert!(matches!(commands[0], RecordedCommand::PipelineBarrier { image: 1, .. }));
        assert!(matches!(commands[1], RecordedCommand::BeginRendering { color_attachments: 1, depth: false }));
        assert!(matches!(commands[2], RecordedCommand::Draw { vertex_count: 3, .. }));
        assert!(matches!(commands[3], RecordedCommand::EndRendering));
        assert!(matches!(commands[4], RecordedCommand::PipelineBarrier { memory: 2, .. }));
        assert!(matches!(commands[5], RecordedCommand::Dispatch([1, 1, 1])));
        assert!(matches!(commands[6], RecordedCommand::PipelineBarrier { buffer: 1, .. }));
        assert!(matches!(commands[7], RecordedCommand::CopyBuffer { .. }));
        assert_eq!(commands.len(), 8);
    }

    #[test]
    fn test_barrier_sensitive_commands_never_follow_unflushed_barriers() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");
        let buffer = fx.buffer("buffer", vk::BufferUsageFlags::STORAGE_BUFFER);

        cmd.begin().unwrap();
        // 伪随机的录制序列
        let mut seed = 0x2545_f491_u32;
        let mut recorded_barriers = 0usize;
        for _ in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            match seed % 4 {
                0 => {
                    cmd.memory_barrier(MemoryBarrier::new(BarrierMask::FULL)).unwrap();
                    recorded_barriers += 1;
                }
                1 => {
                    cmd.buffer_barrier(&buffer, BufferBarrier::new()).unwrap();
                    recorded_barriers += 1;
                }
                2 => cmd.dispatch([1, 1, 1]).unwrap(),
                _ => cmd.draw(3, 1, 0, 0).unwrap(),
            }
        }
        cmd.end().unwrap();

        let commands = fx.recorded(&cmd);
        let mut flushed = 0;
        let mut replayed = 0;
        seed = 0x2545_f491;
        let mut cursor = 0;
        for _ in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 4 < 2 {
                replayed += 1;
                continue;
            }
            // 下一条 action 之前，之前录制的 barrier 必须已经全部 flush
            while !commands[cursor].is_barrier_sensitive() {
                if let RecordedCommand::PipelineBarrier { memory, buffer, image } = commands[cursor] {
                    flushed += memory + buffer + image;
                }
                cursor += 1;
            }
            assert_eq!(flushed, replayed);
            cursor += 1;
        }
        let total = barrier_sizes(&commands).iter().map(|(m, b, i)| m + b + i).sum::<usize>();
        assert_eq!(total, recorded_barriers);
    }

    #[test]
    fn test_recording_outside_recording_state_fails() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");

        assert!(cmd.dispatch([1, 1, 1]).is_err());
        assert!(cmd.memory_barrier(MemoryBarrier::default()).is_err());
        assert!(cmd.end().is_err());
        assert!(cmd.reset().is_err());
        assert!(fx.recorded(&cmd).is_empty());
        assert_eq!(cmd.state(), CommandBufferState::Initial);
    }

    #[test]
    fn test_null_resource_is_rejected() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");
        let real = fx.buffer("real", vk::BufferUsageFlags::TRANSFER_DST);

        cmd.begin().unwrap();
        let err = cmd.copy_buffer(&Resource::null(), &real, &[vk::BufferCopy::default().size(4)]).unwrap_err();
        assert!(matches!(err, GfxError::NullResource(ResourceKind::Buffer)));
        assert!(fx.recorded(&cmd).is_empty());
        assert_eq!(cmd.retained_count(), 0);
    }

    #[test]
    fn test_copy_out_of_range_is_rejected() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");
        let src = fx.buffer("src", vk::BufferUsageFlags::TRANSFER_SRC);
        let dst = fx.buffer("dst", vk::BufferUsageFlags::TRANSFER_DST);

        cmd.begin().unwrap();
        let region = vk::BufferCopy::default().src_offset(250).size(16);
        assert!(matches!(cmd.copy_buffer(&src, &dst, &[region]), Err(GfxError::OutOfRange { .. })));
    }

    #[test]
    fn test_completion_is_checked_lazily() {
        let fx = Fixture::new();
        fx.backend.set_deferred(true);
        let cmd = fx.cmd("cmd");

        cmd.begin().unwrap();
        cmd.dispatch([8, 8, 1]).unwrap();
        cmd.end().unwrap();
        fx.device.submit(&SubmitInfo::new(&[&cmd])).unwrap();

        assert_eq!(cmd.state(), CommandBufferState::Pending);
        assert!(!cmd.is_completed());
        assert!(cmd.reset().is_err());
        assert!(!cmd.wait_until_completed(Duration::from_millis(1)).unwrap());

        fx.backend.retire_all();
        assert!(cmd.is_completed());
        assert_eq!(cmd.state(), CommandBufferState::Executable);
        cmd.reset().unwrap();
        assert_eq!(cmd.state(), CommandBufferState::Initial);
    }

    #[test]
    fn test_resubmission_uses_new_completion_value() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");

        cmd.begin().unwrap();
        cmd.end().unwrap();
        fx.device.submit(&SubmitInfo::new(&[&cmd])).unwrap();
        assert_eq!(cmd.completion_fence().value().unwrap(), 1);

        fx.device.submit(&SubmitInfo::new(&[&cmd])).unwrap();
        assert_eq!(cmd.recording_timeline(), 2);
        assert_eq!(cmd.completion_fence().value().unwrap(), 2);
        assert!(cmd.is_completed());
    }

    #[test]
    fn test_retained_resource_outlives_dropped_handle() {
        let fx = Fixture::new();
        fx.backend.set_deferred(true);
        let cmd = fx.cmd("cmd");
        let buffer = fx.buffer("transient", vk::BufferUsageFlags::STORAGE_BUFFER);

        cmd.begin().unwrap();
        cmd.buffer_barrier(&buffer, BufferBarrier::new()).unwrap();
        cmd.end().unwrap();
        drop(buffer);

        fx.device.submit(&SubmitInfo::new(&[&cmd])).unwrap();
        fx.device.clear_garbage();
        assert_eq!(fx.backend.live_count(NativeObjectKind::Buffer), 1);

        fx.backend.retire_all();
        fx.device.clear_garbage();
        assert_eq!(fx.backend.live_count(NativeObjectKind::Buffer), 1);

        // reset 之后不再持有
        cmd.reset().unwrap();
        fx.device.clear_garbage();
        assert_eq!(fx.backend.live_count(NativeObjectKind::Buffer), 0);
    }

    #[test]
    fn test_pool_reset() {
        let fx = Fixture::new();
        fx.backend.set_deferred(true);
        let a = fx.cmd("a");
        let b = fx.cmd("b");

        for cmd in [&a, &b] {
            cmd.begin().unwrap();
            cmd.dispatch([1, 1, 1]).unwrap();
            cmd.end().unwrap();
        }
        fx.device.submit(&SubmitInfo::new(&[&a])).unwrap();

        // a 仍在执行，不能 reset
        assert!(fx.pool.reset().is_err());
        assert_eq!(b.state(), CommandBufferState::Executable);

        fx.backend.retire_all();
        fx.pool.reset().unwrap();
        assert_eq!(a.state(), CommandBufferState::Initial);
        assert_eq!(b.state(), CommandBufferState::Initial);
        assert!(fx.recorded(&b).is_empty());
    }

    #[test]
    fn test_labels_must_balance() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");

        cmd.begin().unwrap();
        assert!(cmd.end_label().is_err());
        cmd.begin_label("pass", LabelColor::COLOR_PASS).unwrap();
        cmd.end_label().unwrap();
        cmd.end().unwrap();

        let commands = fx.recorded(&cmd);
        assert!(matches!(&commands[0], RecordedCommand::BeginLabel(name) if name == "pass"));
        assert!(matches!(commands[1], RecordedCommand::EndLabel));
    }

    #[test]
    fn test_push_constants_need_bound_pipeline() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");

        cmd.begin().unwrap();
        assert!(cmd.push_constants_pod(0, &[1.0f32, 2.0]).is_err());
    }

    #[test]
    fn test_rendering_scope_is_checked() {
        let fx = Fixture::new();
        let cmd = fx.cmd("cmd");
        let image = fx.image("color");
        let info =
            RenderingInfo::new(vk::Extent2D { width: 4, height: 4 }).color_attachment(RenderingAttachment::color(&image));

        cmd.begin().unwrap();
        assert!(cmd.end_rendering().is_err());
        cmd.begin_rendering(&info).unwrap();
        assert!(cmd.begin_rendering(&info).is_err());
        assert!(cmd.end().is_err());
        cmd.end_rendering().unwrap();
        cmd.end().unwrap();
    }
}
