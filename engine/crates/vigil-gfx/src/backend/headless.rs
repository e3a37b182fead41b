//! 软件模拟的 GPU
//!
//! - 句柄由递增的计数器生成，记录所有存活的原生对象，重复销毁会被计数
//! - queue 按照提交顺序执行，只有 wait 条件满足时才会执行队首的提交
//! - 默认立即执行；开启 deferred 之后需要手动 `retire_next` / `retire_all` 推进 GPU
//! - copy buffer 会真正拷贝数据，其余命令只做记录
//!
//! `HeadlessBackend` 可以 clone，测试中保留一份用于检查内部状态

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::backend::{
    GfxBackend, MappedPtr, NativeBuffer, NativeBufferDesc, NativeCommand, NativeImage, NativeImageDesc,
    NativeImageViewDesc, NativePipeline, NativePipelineDesc, NativeSubmit, NativeSwapchain, NativeSwapchainDesc,
    SemaphoreSubmit,
};
use crate::error::{GfxError, GfxResult};
use crate::resources::sampler::SamplerInfo;

const BACKEND_NAME: &str = "headless";
const SWAPCHAIN_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeObjectKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    ShaderModule,
    Pipeline,
    PipelineLayout,
    CommandPool,
    CommandBuffer,
    Semaphore,
    Swapchain,
    Surface,
}

/// 录制下来的命令，用于测试中检查命令缓冲的内容
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    PipelineBarrier { memory: usize, buffer: usize, image: usize },
    BeginRendering { color_attachments: usize, depth: bool },
    EndRendering,
    BindPipeline(vk::Pipeline),
    PushConstants { offset: u32, size: usize },
    BindVertexBuffers { first_binding: u32, count: usize },
    BindIndexBuffer(vk::Buffer),
    SetViewport,
    SetScissor,
    Draw { vertex_count: u32, instance_count: u32 },
    DrawIndexed { index_count: u32, instance_count: u32 },
    Dispatch([u32; 3]),
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, regions: Vec<vk::BufferCopy> },
    CopyBufferToImage { src: vk::Buffer, dst: vk::Image, layout: vk::ImageLayout },
    BeginLabel(String),
    EndLabel,
}

impl RecordedCommand {
    /// draw / dispatch / copy / rendering 这些需要先 flush barrier 的命令
    pub fn is_barrier_sensitive(&self) -> bool {
        matches!(
            self,
            RecordedCommand::BeginRendering { .. }
                | RecordedCommand::EndRendering
                | RecordedCommand::Draw { .. }
                | RecordedCommand::DrawIndexed { .. }
                | RecordedCommand::Dispatch(_)
                | RecordedCommand::CopyBuffer { .. }
                | RecordedCommand::CopyBufferToImage { .. }
        )
    }

    fn from_native(command: &NativeCommand) -> Self {
        match *command {
            NativeCommand::PipelineBarrier { memory, buffer, image } => RecordedCommand::PipelineBarrier {
                memory: memory.len(),
                buffer: buffer.len(),
                image: image.len(),
            },
            NativeCommand::BeginRendering {
                color_attachments,
                depth_attachment,
                ..
            } => RecordedCommand::BeginRendering {
                color_attachments: color_attachments.len(),
                depth: depth_attachment.is_some(),
            },
            NativeCommand::EndRendering => RecordedCommand::EndRendering,
            NativeCommand::BindPipeline { pipeline, .. } => RecordedCommand::BindPipeline(pipeline),
            NativeCommand::PushConstants { offset, data, .. } => RecordedCommand::PushConstants {
                offset,
                size: data.len(),
            },
            NativeCommand::BindVertexBuffers {
                first_binding, buffers, ..
            } => RecordedCommand::BindVertexBuffers {
                first_binding,
                count: buffers.len(),
            },
            NativeCommand::BindIndexBuffer { buffer, .. } => RecordedCommand::BindIndexBuffer(buffer),
            NativeCommand::SetViewport(_) => RecordedCommand::SetViewport,
            NativeCommand::SetScissor(_) => RecordedCommand::SetScissor,
            NativeCommand::Draw {
                vertex_count,
                instance_count,
                ..
            } => RecordedCommand::Draw {
                vertex_count,
                instance_count,
            },
            NativeCommand::DrawIndexed {
                index_count,
                instance_count,
                ..
            } => RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            },
            NativeCommand::Dispatch { group_count } => RecordedCommand::Dispatch(group_count),
            NativeCommand::CopyBuffer { src, dst, regions } => RecordedCommand::CopyBuffer {
                src,
                dst,
                regions: regions.to_vec(),
            },
            NativeCommand::CopyBufferToImage { src, dst, layout, .. } => {
                RecordedCommand::CopyBufferToImage { src, dst, layout }
            }
            NativeCommand::BeginLabel { name, .. } => RecordedCommand::BeginLabel(name.to_string()),
            NativeCommand::EndLabel => RecordedCommand::EndLabel,
        }
    }
}

struct HeadlessBuffer {
    storage: Box<[u8]>,
}

struct HeadlessSwapchain {
    images: Vec<vk::Image>,
    next_image: u32,
}

struct PendingSubmit {
    command_buffers: Vec<vk::CommandBuffer>,
    waits: Vec<SemaphoreSubmit>,
    signals: Vec<SemaphoreSubmit>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    live: HashMap<u64, NativeObjectKind>,
    destroy_log: Vec<(NativeObjectKind, u64)>,
    double_destroy_count: usize,

    buffers: HashMap<vk::Buffer, HeadlessBuffer>,
    timelines: HashMap<vk::Semaphore, u64>,
    binaries: HashMap<vk::Semaphore, bool>,
    recorded: HashMap<vk::CommandBuffer, Vec<RecordedCommand>>,
    pool_buffers: HashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    swapchains: HashMap<vk::SwapchainKHR, HeadlessSwapchain>,

    queue: VecDeque<PendingSubmit>,
    deferred: bool,
    submit_count: usize,
    executed_count: usize,

    scripted_acquire: VecDeque<Result<(u32, bool), vk::Result>>,
    scripted_present: VecDeque<Result<bool, vk::Result>>,
    scripted_submit: VecDeque<Result<(), vk::Result>>,
    presents: Vec<(vk::SwapchainKHR, u32)>,

    device_lost: bool,
    fail_next_allocation: bool,
}

// 对象的生命周期
impl State {
    fn alloc_handle(&mut self, kind: NativeObjectKind) -> u64 {
        self.next_handle += 1;
        self.live.insert(self.next_handle, kind);
        self.next_handle
    }

    fn release_handle(&mut self, kind: NativeObjectKind, raw: u64) {
        match self.live.remove(&raw) {
            Some(live_kind) if live_kind == kind => self.destroy_log.push((kind, raw)),
            Some(live_kind) => {
                log::error!("headless: destroying {:?} {:#x} as {:?}", live_kind, raw, kind);
                self.live.insert(raw, live_kind);
                self.double_destroy_count += 1;
            }
            None => {
                log::error!("headless: {:?} {:#x} destroyed twice or never created", kind, raw);
                self.double_destroy_count += 1;
            }
        }
    }

    fn take_allocation_failure(&mut self) -> GfxResult<()> {
        if std::mem::take(&mut self.fail_next_allocation) {
            return Err(GfxError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        Ok(())
    }
}

// queue 的执行
impl State {
    fn is_signaled(&self, wait: &SemaphoreSubmit) -> bool {
        if let Some(signaled) = self.binaries.get(&wait.semaphore) {
            return *signaled;
        }
        self.timelines.get(&wait.semaphore).is_some_and(|value| *value >= wait.value)
    }

    fn front_ready(&self) -> bool {
        self.queue.front().is_some_and(|submit| submit.waits.iter().all(|wait| self.is_signaled(wait)))
    }

    /// 执行队首的提交，返回是否执行
    fn execute_front(&mut self) -> bool {
        if !self.front_ready() {
            return false;
        }
        let Some(submit) = self.queue.pop_front() else {
            return false;
        };

        for command_buffer in &submit.command_buffers {
            let commands = self.recorded.get(command_buffer).cloned().unwrap_or_default();
            for command in &commands {
                if let RecordedCommand::CopyBuffer { src, dst, regions } = command {
                    self.copy_buffer(*src, *dst, regions);
                }
            }
        }

        for wait in &submit.waits {
            if let Some(signaled) = self.binaries.get_mut(&wait.semaphore) {
                *signaled = false;
            }
        }
        for signal in &submit.signals {
            if let Some(signaled) = self.binaries.get_mut(&signal.semaphore) {
                *signaled = true;
            } else if let Some(value) = self.timelines.get_mut(&signal.semaphore) {
                *value = (*value).max(signal.value);
            } else {
                log::error!("headless: signal unknown semaphore {:?}", signal.semaphore);
            }
        }

        self.executed_count += 1;
        true
    }

    fn pump(&mut self) {
        if self.deferred {
            return;
        }
        while self.execute_front() {}
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        for region in regions {
            let src_range = region.src_offset as usize..(region.src_offset + region.size) as usize;
            let dst_range = region.dst_offset as usize..(region.dst_offset + region.size) as usize;

            let Some(bytes) = self.buffers.get(&src).and_then(|b| b.storage.get(src_range)).map(<[u8]>::to_vec) else {
                log::error!("headless: copy region {:?} out of range of {:?}", region, src);
                continue;
            };
            match self.buffers.get_mut(&dst).and_then(|b| b.storage.get_mut(dst_range)) {
                Some(target) => target.copy_from_slice(&bytes),
                None => log::error!("headless: copy region {:?} out of range of {:?}", region, dst),
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    /// queue 推进或者 timeline 被 signal 时通知
    progress: Condvar,
}

#[derive(Clone)]
pub struct HeadlessBackend {
    shared: Arc<Shared>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                progress: Condvar::new(),
            }),
        }
    }

    #[inline]
    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// 测试中模拟 GPU 的行为
impl HeadlessBackend {
    /// deferred 模式下，提交不会自动执行
    pub fn set_deferred(&self, deferred: bool) {
        let mut state = self.state();
        state.deferred = deferred;
        state.pump();
        drop(state);
        self.shared.progress.notify_all();
    }

    /// 执行队首的提交；wait 条件不满足或者队列为空时返回 false
    pub fn retire_next(&self) -> bool {
        let executed = self.state().execute_front();
        if executed {
            self.shared.progress.notify_all();
        }
        executed
    }

    /// 尽可能地执行所有的提交，返回执行的数量
    pub fn retire_all(&self) -> usize {
        let mut state = self.state();
        let mut count = 0;
        while state.execute_front() {
            count += 1;
        }
        drop(state);
        self.shared.progress.notify_all();
        count
    }

    pub fn set_device_lost(&self) {
        self.state().device_lost = true;
        self.shared.progress.notify_all();
    }

    /// 下一次 buffer / image 的创建会失败
    pub fn fail_next_allocation(&self) {
        self.state().fail_next_allocation = true;
    }

    pub fn script_acquire(&self, result: Result<(u32, bool), vk::Result>) {
        self.state().scripted_acquire.push_back(result);
    }

    pub fn script_present(&self, result: Result<bool, vk::Result>) {
        self.state().scripted_present.push_back(result);
    }

    /// 失败的提交不会进入队列
    pub fn script_submit(&self, result: Result<(), vk::Result>) {
        self.state().scripted_submit.push_back(result);
    }
}

// 检查内部状态
impl HeadlessBackend {
    pub fn live_count(&self, kind: NativeObjectKind) -> usize {
        self.state().live.values().filter(|k| **k == kind).count()
    }

    pub fn total_live_count(&self) -> usize {
        self.state().live.len()
    }

    pub fn destroyed_count(&self, kind: NativeObjectKind) -> usize {
        self.state().destroy_log.iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn is_destroyed(&self, raw: u64) -> bool {
        self.state().destroy_log.iter().any(|(_, r)| *r == raw)
    }

    pub fn double_destroy_count(&self) -> usize {
        self.state().double_destroy_count
    }

    pub fn recorded_commands(&self, command_buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.state().recorded.get(&command_buffer).cloned().unwrap_or_default()
    }

    pub fn submit_count(&self) -> usize {
        self.state().submit_count
    }

    pub fn executed_count(&self) -> usize {
        self.state().executed_count
    }

    pub fn pending_submit_count(&self) -> usize {
        self.state().queue.len()
    }

    pub fn presents(&self) -> Vec<(vk::SwapchainKHR, u32)> {
        self.state().presents.clone()
    }

    pub fn is_binary_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.state().binaries.get(&semaphore).copied().unwrap_or(false)
    }

    /// 读取任意 buffer 的内容（包括 GPU only 的 buffer）
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state().buffers.get(&buffer).map(|b| b.storage.to_vec())
    }
}

impl GfxBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn create_buffer(&self, desc: &NativeBufferDesc) -> GfxResult<NativeBuffer> {
        let mut state = self.state();
        state.take_allocation_failure()?;

        let raw = state.alloc_handle(NativeObjectKind::Buffer);
        let handle = vk::Buffer::from_raw(raw);
        let mut storage = vec![0u8; desc.size as usize].into_boxed_slice();
        let mapped = if desc.location.is_host_visible() { MappedPtr::new(storage.as_mut_ptr()) } else { None };
        let device_address = desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS).then_some(raw << 32);
        state.buffers.insert(handle, HeadlessBuffer { storage });

        log::trace!("headless: create buffer {} ({:#x})", desc.name, raw);
        Ok(NativeBuffer {
            handle,
            mapped,
            device_address,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state();
        state.release_handle(NativeObjectKind::Buffer, buffer.as_raw());
        state.buffers.remove(&buffer);
    }

    fn flush_buffer(&self, _buffer: vk::Buffer, _offset: vk::DeviceSize, _size: vk::DeviceSize) -> GfxResult<()> {
        Ok(())
    }

    fn invalidate_buffer(&self, _buffer: vk::Buffer, _offset: vk::DeviceSize, _size: vk::DeviceSize) -> GfxResult<()> {
        Ok(())
    }

    fn create_image(&self, desc: &NativeImageDesc) -> GfxResult<NativeImage> {
        let mut state = self.state();
        state.take_allocation_failure()?;

        let image = vk::Image::from_raw(state.alloc_handle(NativeObjectKind::Image));
        let view = vk::ImageView::from_raw(state.alloc_handle(NativeObjectKind::ImageView));
        log::trace!("headless: create image {} ({:?})", desc.name, image);
        Ok(NativeImage { handle: image, view })
    }

    fn destroy_image(&self, image: NativeImage) {
        let mut state = self.state();
        state.release_handle(NativeObjectKind::ImageView, image.view.as_raw());
        state.release_handle(NativeObjectKind::Image, image.handle.as_raw());
    }

    fn create_image_view(&self, _desc: &NativeImageViewDesc) -> GfxResult<vk::ImageView> {
        Ok(vk::ImageView::from_raw(self.state().alloc_handle(NativeObjectKind::ImageView)))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state().release_handle(NativeObjectKind::ImageView, view.as_raw());
    }

    fn create_sampler(&self, _info: &SamplerInfo) -> GfxResult<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.state().alloc_handle(NativeObjectKind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state().release_handle(NativeObjectKind::Sampler, sampler.as_raw());
    }

    fn create_shader_module(&self, _name: &str, _code: &[u32]) -> GfxResult<vk::ShaderModule> {
        Ok(vk::ShaderModule::from_raw(self.state().alloc_handle(NativeObjectKind::ShaderModule)))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state().release_handle(NativeObjectKind::ShaderModule, module.as_raw());
    }

    fn create_pipeline(&self, desc: &NativePipelineDesc) -> GfxResult<NativePipeline> {
        let mut state = self.state();
        for stage in desc.stages {
            if state.live.get(&stage.module.as_raw()) != Some(&NativeObjectKind::ShaderModule) {
                return Err(GfxError::InvalidArgument(format!(
                    "pipeline `{}` uses a destroyed shader module",
                    desc.name
                )));
            }
        }
        let layout = vk::PipelineLayout::from_raw(state.alloc_handle(NativeObjectKind::PipelineLayout));
        let handle = vk::Pipeline::from_raw(state.alloc_handle(NativeObjectKind::Pipeline));
        Ok(NativePipeline { handle, layout })
    }

    fn destroy_pipeline(&self, pipeline: NativePipeline) {
        let mut state = self.state();
        state.release_handle(NativeObjectKind::Pipeline, pipeline.handle.as_raw());
        state.release_handle(NativeObjectKind::PipelineLayout, pipeline.layout.as_raw());
    }

    fn create_command_pool(&self, _name: &str) -> GfxResult<vk::CommandPool> {
        let mut state = self.state();
        let pool = vk::CommandPool::from_raw(state.alloc_handle(NativeObjectKind::CommandPool));
        state.pool_buffers.insert(pool, Vec::new());
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()> {
        let mut state = self.state();
        let buffers = state.pool_buffers.get(&pool).cloned().unwrap_or_default();
        for command_buffer in buffers {
            if let Some(commands) = state.recorded.get_mut(&command_buffer) {
                commands.clear();
            }
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        state.release_handle(NativeObjectKind::CommandPool, pool.as_raw());
        if let Some(buffers) = state.pool_buffers.remove(&pool) {
            if !buffers.is_empty() {
                log::warn!("headless: command pool {:?} destroyed with {} live buffers", pool, buffers.len());
            }
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, _name: &str) -> GfxResult<vk::CommandBuffer> {
        let mut state = self.state();
        if !state.pool_buffers.contains_key(&pool) {
            return Err(GfxError::InvalidArgument(format!("unknown command pool {:?}", pool)));
        }
        let command_buffer = vk::CommandBuffer::from_raw(state.alloc_handle(NativeObjectKind::CommandBuffer));
        state.recorded.insert(command_buffer, Vec::new());
        if let Some(buffers) = state.pool_buffers.get_mut(&pool) {
            buffers.push(command_buffer);
        }
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state();
        state.release_handle(NativeObjectKind::CommandBuffer, command_buffer.as_raw());
        state.recorded.remove(&command_buffer);
        if let Some(buffers) = state.pool_buffers.get_mut(&pool) {
            buffers.retain(|cb| *cb != command_buffer);
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        let mut state = self.state();
        match state.recorded.get_mut(&command_buffer) {
            Some(commands) => {
                commands.clear();
                Ok(())
            }
            None => Err(GfxError::InvalidArgument(format!("unknown command buffer {:?}", command_buffer))),
        }
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        if let Some(commands) = self.state().recorded.get_mut(&command_buffer) {
            commands.clear();
        }
        Ok(())
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &NativeCommand) {
        let recorded = RecordedCommand::from_native(command);
        match self.state().recorded.get_mut(&command_buffer) {
            Some(commands) => commands.push(recorded),
            None => log::error!("headless: record into unknown command buffer {:?}", command_buffer),
        }
    }

    fn create_timeline_semaphore(&self, _name: &str, initial_value: u64) -> GfxResult<vk::Semaphore> {
        let mut state = self.state();
        let semaphore = vk::Semaphore::from_raw(state.alloc_handle(NativeObjectKind::Semaphore));
        state.timelines.insert(semaphore, initial_value);
        Ok(semaphore)
    }

    fn create_binary_semaphore(&self, _name: &str) -> GfxResult<vk::Semaphore> {
        let mut state = self.state();
        let semaphore = vk::Semaphore::from_raw(state.alloc_handle(NativeObjectKind::Semaphore));
        state.binaries.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state();
        state.release_handle(NativeObjectKind::Semaphore, semaphore.as_raw());
        state.timelines.remove(&semaphore);
        state.binaries.remove(&semaphore);
    }

    fn timeline_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64> {
        self.state()
            .timelines
            .get(&semaphore)
            .copied()
            .ok_or_else(|| GfxError::InvalidArgument(format!("{:?} is not a timeline semaphore", semaphore)))
    }

    fn signal_timeline(&self, semaphore: vk::Semaphore, value: u64) -> GfxResult<()> {
        let mut state = self.state();
        let Some(current) = state.timelines.get_mut(&semaphore) else {
            return Err(GfxError::InvalidArgument(format!("{:?} is not a timeline semaphore", semaphore)));
        };
        if value <= *current {
            return Err(GfxError::InvalidTimelineValue {
                current: *current,
                requested: value,
            });
        }
        *current = value;
        state.pump();
        drop(state);
        self.shared.progress.notify_all();
        Ok(())
    }

    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> GfxResult<bool> {
        let reached = |state: &State| state.device_lost || state.timelines.get(&semaphore).is_none_or(|v| *v >= value);

        let state = self.state();
        if !state.timelines.contains_key(&semaphore) {
            return Err(GfxError::InvalidArgument(format!("{:?} is not a timeline semaphore", semaphore)));
        }
        let state = if timeout_ns == u64::MAX {
            self.shared
                .progress
                .wait_while(state, |state| !reached(state))
                .unwrap_or_else(PoisonError::into_inner)
        } else {
            self.shared
                .progress
                .wait_timeout_while(state, Duration::from_nanos(timeout_ns), |state| !reached(state))
                .unwrap_or_else(PoisonError::into_inner)
                .0
        };

        if state.device_lost {
            return Err(GfxError::DeviceLost);
        }
        Ok(state.timelines.get(&semaphore).is_some_and(|v| *v >= value))
    }

    fn submit(&self, submit: &NativeSubmit) -> GfxResult<()> {
        let mut state = self.state();
        if state.device_lost {
            return Err(GfxError::DeviceLost);
        }
        if let Some(Err(e)) = state.scripted_submit.pop_front() {
            return Err(e.into());
        }
        state.queue.push_back(PendingSubmit {
            command_buffers: submit.command_buffers.to_vec(),
            waits: submit.waits.to_vec(),
            signals: submit.signals.to_vec(),
        });
        state.submit_count += 1;
        state.pump();
        drop(state);
        self.shared.progress.notify_all();
        Ok(())
    }

    fn wait_idle(&self) -> GfxResult<()> {
        let mut state = self.state();
        if state.device_lost {
            return Err(GfxError::DeviceLost);
        }
        while state.execute_front() {}
        let stalled = state.queue.len();
        drop(state);
        self.shared.progress.notify_all();

        if stalled > 0 {
            return Err(GfxError::InvalidArgument(format!(
                "{} submissions wait on semaphores that are never signaled",
                stalled
            )));
        }
        Ok(())
    }

    fn create_surface(&self, _window: Option<(RawDisplayHandle, RawWindowHandle)>) -> GfxResult<vk::SurfaceKHR> {
        Ok(vk::SurfaceKHR::from_raw(self.state().alloc_handle(NativeObjectKind::Surface)))
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.state().release_handle(NativeObjectKind::Surface, surface.as_raw());
    }

    fn create_swapchain(&self, desc: &NativeSwapchainDesc) -> GfxResult<NativeSwapchain> {
        let mut state = self.state();
        if state.live.get(&desc.surface.as_raw()) != Some(&NativeObjectKind::Surface) {
            return Err(GfxError::SurfaceUnsupported(format!("unknown surface {:?}", desc.surface)));
        }

        let handle = vk::SwapchainKHR::from_raw(state.alloc_handle(NativeObjectKind::Swapchain));
        // swapchain 的 image 属于 swapchain 本身，不单独记录
        let image_count = desc.min_image_count.max(2);
        let images = (0..image_count)
            .map(|_| {
                state.next_handle += 1;
                vk::Image::from_raw(state.next_handle)
            })
            .collect::<Vec<_>>();
        state.swapchains.insert(
            handle,
            HeadlessSwapchain {
                images: images.clone(),
                next_image: 0,
            },
        );

        Ok(NativeSwapchain {
            handle,
            images,
            format: SWAPCHAIN_FORMAT,
            extent: desc.extent,
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state();
        state.release_handle(NativeObjectKind::Swapchain, swapchain.as_raw());
        state.swapchains.remove(&swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> Result<(u32, bool), vk::Result> {
        let mut state = self.state();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }

        let result = match state.scripted_acquire.pop_front() {
            Some(result) => result,
            None => {
                let Some(chain) = state.swapchains.get_mut(&swapchain) else {
                    return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
                };
                let index = chain.next_image;
                chain.next_image = (index + 1) % chain.images.len() as u32;
                Ok((index, false))
            }
        };

        if result.is_ok() {
            if let Some(signaled) = state.binaries.get_mut(&semaphore) {
                *signaled = true;
            }
        }
        result
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool, vk::Result> {
        let mut state = self.state();
        if state.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        for semaphore in wait_semaphores {
            if let Some(signaled) = state.binaries.get_mut(semaphore) {
                *signaled = false;
            }
        }
        state.presents.push((swapchain, image_index));
        state.scripted_present.pop_front().unwrap_or(Ok(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline(backend: &HeadlessBackend) -> vk::Semaphore {
        backend.create_timeline_semaphore("timeline", 0).unwrap()
    }

    #[test]
    fn test_immediate_submit_signals_timeline() {
        let backend = HeadlessBackend::new();
        let semaphore = timeline(&backend);

        let signals = [SemaphoreSubmit::timeline(semaphore, 3, vk::PipelineStageFlags2::ALL_COMMANDS)];
        backend
            .submit(&NativeSubmit {
                command_buffers: &[],
                waits: &[],
                signals: &signals,
            })
            .unwrap();

        assert_eq!(backend.timeline_value(semaphore).unwrap(), 3);
        assert_eq!(backend.pending_submit_count(), 0);
    }

    #[test]
    fn test_deferred_submit_waits_for_retire() {
        let backend = HeadlessBackend::new();
        backend.set_deferred(true);
        let semaphore = timeline(&backend);

        let signals = [SemaphoreSubmit::timeline(semaphore, 1, vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = NativeSubmit {
            command_buffers: &[],
            waits: &[],
            signals: &signals,
        };
        backend.submit(&submit).unwrap();
        assert_eq!(backend.timeline_value(semaphore).unwrap(), 0);
        assert!(!backend.wait_timeline(semaphore, 1, 1_000_000).unwrap());

        assert!(backend.retire_next());
        assert_eq!(backend.timeline_value(semaphore).unwrap(), 1);
        assert!(backend.wait_timeline(semaphore, 1, 0).unwrap());
    }

    #[test]
    fn test_submit_blocks_on_unsignaled_wait() {
        let backend = HeadlessBackend::new();
        let gate = timeline(&backend);
        let done = timeline(&backend);

        let waits = [SemaphoreSubmit::timeline(gate, 5, vk::PipelineStageFlags2::ALL_COMMANDS)];
        let signals = [SemaphoreSubmit::timeline(done, 1, vk::PipelineStageFlags2::ALL_COMMANDS)];
        backend
            .submit(&NativeSubmit {
                command_buffers: &[],
                waits: &waits,
                signals: &signals,
            })
            .unwrap();
        assert_eq!(backend.pending_submit_count(), 1);

        backend.signal_timeline(gate, 5).unwrap();
        assert_eq!(backend.pending_submit_count(), 0);
        assert_eq!(backend.timeline_value(done).unwrap(), 1);
    }

    #[test]
    fn test_host_signal_must_increase() {
        let backend = HeadlessBackend::new();
        let semaphore = timeline(&backend);
        backend.signal_timeline(semaphore, 2).unwrap();

        let err = backend.signal_timeline(semaphore, 2).unwrap_err();
        assert!(matches!(err, GfxError::InvalidTimelineValue { current: 2, requested: 2 }));
    }

    #[test]
    fn test_double_destroy_is_counted() {
        let backend = HeadlessBackend::new();
        let sampler = backend.create_sampler(&SamplerInfo::new("s")).unwrap();

        backend.destroy_sampler(sampler);
        assert_eq!(backend.double_destroy_count(), 0);
        backend.destroy_sampler(sampler);
        assert_eq!(backend.double_destroy_count(), 1);
    }

    #[test]
    fn test_copy_buffer_moves_bytes() {
        let backend = HeadlessBackend::new();
        let src = backend
            .create_buffer(&NativeBufferDesc {
                name: "src",
                size: 8,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: crate::resources::buffer::MemoryLocation::CpuToGpu,
            })
            .unwrap();
        let dst = backend
            .create_buffer(&NativeBufferDesc {
                name: "dst",
                size: 8,
                usage: vk::BufferUsageFlags::TRANSFER_DST,
                location: crate::resources::buffer::MemoryLocation::GpuOnly,
            })
            .unwrap();
        assert!(dst.mapped.is_none());

        let mapped = src.mapped.unwrap();
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), mapped.as_ptr(), 4) };

        let pool = backend.create_command_pool("pool").unwrap();
        let cmd = backend.allocate_command_buffer(pool, "cmd").unwrap();
        backend.begin_command_buffer(cmd).unwrap();
        let regions = [vk::BufferCopy {
            src_offset: 0,
            dst_offset: 4,
            size: 4,
        }];
        backend.record(
            cmd,
            &NativeCommand::CopyBuffer {
                src: src.handle,
                dst: dst.handle,
                regions: &regions,
            },
        );
        backend.end_command_buffer(cmd).unwrap();
        backend
            .submit(&NativeSubmit {
                command_buffers: &[cmd],
                waits: &[],
                signals: &[],
            })
            .unwrap();

        assert_eq!(backend.buffer_contents(dst.handle).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_swapchain_acquire_round_robin() {
        let backend = HeadlessBackend::new();
        let surface = backend.create_surface(None).unwrap();
        let swapchain = backend
            .create_swapchain(&NativeSwapchainDesc {
                name: "swapchain",
                surface,
                extent: vk::Extent2D { width: 4, height: 4 },
                min_image_count: 2,
                present_mode: vk::PresentModeKHR::FIFO,
                old_swapchain: vk::SwapchainKHR::null(),
            })
            .unwrap();
        let semaphore = backend.create_binary_semaphore("acquire").unwrap();

        assert_eq!(backend.acquire_next_image(swapchain.handle, semaphore, 0), Ok((0, false)));
        assert!(backend.is_binary_signaled(semaphore));
        assert_eq!(backend.acquire_next_image(swapchain.handle, semaphore, 0), Ok((1, false)));
        assert_eq!(backend.acquire_next_image(swapchain.handle, semaphore, 0), Ok((0, false)));

        backend.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert_eq!(
            backend.acquire_next_image(swapchain.handle, semaphore, 0),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );
    }
}
