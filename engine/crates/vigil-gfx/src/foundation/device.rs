//! Device：资源的 arena、CPU / GPU timeline、zombie 队列以及提交
//!
//! # Timeline
//! - CPU timeline：每次 [`Device::submit`] 加 1
//! - GPU timeline：一个 timeline [`Fence`]，每次提交都会在同一个 batch 中 signal 到新的 CPU timeline
//!
//! 对象被释放时记录当时的 CPU timeline，GPU timeline 追上之后说明所有可能引用它的工作都已经完成。
//!
//! # 线程
//! `Device` 是 `Send` 但不是 `Sync`：`submit` / `present` / `clear_garbage` 复用内部的 scratch，
//! 多线程提交需要调用方自己加锁。`Resource<T>` 可以在任意线程 drop。

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ash::vk;
use itertools::Itertools;
use raw_window_handle::RawDisplayHandle;

use crate::backend::headless::HeadlessBackend;
use crate::backend::vulkan::VulkanBackend;
use crate::backend::{GfxBackend, NativeSubmit, SemaphoreSubmit};
use crate::basic::color::LabelColor;
use crate::commands::command_buffer::{CommandBuffer, CommandBufferInfo};
use crate::commands::command_pool::{CommandPool, CommandPoolInfo};
use crate::commands::fence::{Fence, FenceInfo};
use crate::commands::semaphore::Semaphore;
use crate::commands::submit_info::{PresentInfo, SubmitInfo};
use crate::config::GfxConfig;
use crate::error::{GfxError, GfxResult};
use crate::foundation::zombie::{self, ZombieEntry, ZombieQueue, ZombieSender};
use crate::pipelines::pipeline::Pipeline;
use crate::pipelines::shader::Shader;
use crate::resources::arena::ResourceArenas;
use crate::resources::buffer::Buffer;
use crate::resources::image::Image;
use crate::resources::resource::{DeviceResource, Resource, ResourceKey, ResourceKind};
use crate::resources::sampler::Sampler;
use crate::swapchain::render_swapchain::{Swapchain, SwapchainStatus};

/// 所有 GPU 对象共享的 device 状态
///
/// 不持有 arena，因此对象通过 `Arc<DeviceShared>` 引用 device 不会形成循环
pub struct DeviceShared {
    backend: Box<dyn GfxBackend>,
    config: GfxConfig,
    cpu_timeline: AtomicU64,
    lost: AtomicBool,
    zombies: ZombieSender,
}

impl DeviceShared {
    #[inline]
    pub fn backend(&self) -> &dyn GfxBackend {
        self.backend.as_ref()
    }

    #[inline]
    pub fn config(&self) -> &GfxConfig {
        &self.config
    }

    #[inline]
    pub fn cpu_timeline(&self) -> u64 {
        self.cpu_timeline.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn post_zombie(&self, kind: ResourceKind, key: ResourceKey) {
        self.zombies.post(ZombieEntry {
            timeline: self.cpu_timeline(),
            key,
            kind,
        });
    }

    /// 设备丢失之后不再恢复，之后所有的提交都会失败
    pub(crate) fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            log::error!("device lost on {} backend, all further submissions will fail", self.backend.name());
        }
    }

    #[inline]
    pub(crate) fn ensure_not_lost(&self) -> GfxResult<()> {
        if self.is_lost() {
            return Err(GfxError::DeviceLost);
        }
        Ok(())
    }

    /// 检查错误是否为设备丢失，并原样返回
    pub(crate) fn check<T>(&self, result: GfxResult<T>) -> GfxResult<T> {
        if let Err(e) = &result {
            if e.is_device_lost() {
                self.mark_lost();
            }
        }
        result
    }
}

#[derive(Default)]
struct SubmitScratch {
    command_buffers: Vec<vk::CommandBuffer>,
    targets: Vec<u64>,
    waits: Vec<SemaphoreSubmit>,
    signals: Vec<SemaphoreSubmit>,
}

impl SubmitScratch {
    fn clear(&mut self) {
        self.command_buffers.clear();
        self.targets.clear();
        self.waits.clear();
        self.signals.clear();
    }
}

pub struct Device {
    shared: Arc<DeviceShared>,
    arenas: ResourceArenas,

    /// 每次提交都会 signal 到最新的 CPU timeline
    gpu_timeline: Resource<Fence>,

    zombies: RefCell<ZombieQueue>,
    scratch: RefCell<SubmitScratch>,
}

// 创建
impl Device {
    /// 使用软件模拟的 GPU，保留 `backend` 的 clone 可以在外部推进 GPU
    pub fn new_headless(config: GfxConfig, backend: HeadlessBackend) -> GfxResult<Self> {
        Self::with_backend(config, Box::new(backend))
    }

    /// 创建 Vulkan device
    ///
    /// 需要 present 时传入 display handle，用于开启对应的 surface extension
    pub fn new_vulkan(config: GfxConfig, display: Option<RawDisplayHandle>) -> GfxResult<Self> {
        config.validate()?;
        let backend = VulkanBackend::new(&config, display)?;
        Self::with_backend(config, Box::new(backend))
    }

    pub fn with_backend(config: GfxConfig, backend: Box<dyn GfxBackend>) -> GfxResult<Self> {
        let _span = tracy_client::span!("Device::new");
        config.validate()?;

        let (sender, queue) = zombie::mailbox(config.zombie_warn_threshold);
        log::info!(
            "creating device on {} backend, max frames in flight: {}",
            backend.name(),
            config.max_frames_in_flight
        );

        let mut device = Self {
            shared: Arc::new(DeviceShared {
                backend,
                config,
                cpu_timeline: AtomicU64::new(0),
                lost: AtomicBool::new(false),
                zombies: sender,
            }),
            arenas: ResourceArenas::default(),
            gpu_timeline: Resource::null(),
            zombies: RefCell::new(queue),
            scratch: RefCell::new(SubmitScratch::default()),
        };
        device.gpu_timeline = Fence::create(&device, FenceInfo::new("device-gpu-timeline"))?;
        Ok(device)
    }
}

// getters
impl Device {
    #[inline]
    pub(crate) fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    #[inline]
    pub fn backend(&self) -> &dyn GfxBackend {
        self.shared.backend()
    }

    #[inline]
    pub fn config(&self) -> &GfxConfig {
        self.shared.config()
    }

    #[inline]
    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    /// 已经提交的次数
    #[inline]
    pub fn cpu_timeline(&self) -> u64 {
        self.shared.cpu_timeline()
    }

    /// GPU 已经完成的提交次数
    ///
    /// 读取失败时返回 0，此时不会回收任何 zombie
    pub fn gpu_timeline(&self) -> u64 {
        match self.gpu_timeline.try_get().and_then(Fence::value) {
            Ok(value) => value,
            Err(e) => {
                log::error!("failed to read the gpu timeline: {}", e);
                0
            }
        }
    }

    #[inline]
    pub fn gpu_timeline_fence(&self) -> &Resource<Fence> {
        &self.gpu_timeline
    }

    /// arena 中的对象数量（包括还没有回收的 zombie）
    #[inline]
    pub fn live_resource_count(&self) -> usize {
        self.arenas.total_len()
    }

    pub fn pending_zombie_count(&self) -> usize {
        let mut zombies = self.zombies.borrow_mut();
        zombies.collect();
        zombies.len()
    }
}

// 资源
impl Device {
    /// 将新创建的对象放入 arena，返回第一个 handle
    pub(crate) fn emplace<T: DeviceResource>(&self, value: T) -> Resource<T> {
        let (key, inner) = T::arena(&self.arenas).emplace(value);
        Resource::adopt(key, inner)
    }

    /// 通过 key 重新得到 handle
    ///
    /// 已经被释放（计数为 0）或者 slot 已经被复用的 key 返回 None
    pub fn lookup<T: DeviceResource>(&self, key: ResourceKey) -> Option<Resource<T>> {
        let inner = T::arena(&self.arenas).at(key)?;
        Resource::resurrect(key, inner)
    }

    /// 回收所有 GPU 已经不再使用的 zombie，返回销毁的对象数量
    ///
    /// 每帧调用一次。重复调用不会重复销毁。
    pub fn clear_garbage(&self) -> usize {
        let _span = tracy_client::span!("Device::clear_garbage");
        let gpu_timeline = self.gpu_timeline();

        let mut destroyed = 0;
        // 被销毁的对象可能持有其他 handle，会产生新的 zombie
        loop {
            let retired = {
                let mut zombies = self.zombies.borrow_mut();
                zombies.collect();
                zombies.take_retired(gpu_timeline)
            };
            if retired.is_empty() {
                break;
            }
            destroyed += retired.into_iter().filter(|entry| self.retire(entry)).count();
        }

        self.zombies.borrow_mut().check_stall(gpu_timeline);
        if destroyed > 0 {
            log::debug!("clear garbage: {} objects destroyed at gpu timeline {}", destroyed, gpu_timeline);
        }
        destroyed
    }

    fn retire(&self, entry: &ZombieEntry) -> bool {
        match entry.kind {
            ResourceKind::Buffer => self.retire_resource::<Buffer>(entry.key),
            ResourceKind::Image => self.retire_resource::<Image>(entry.key),
            ResourceKind::Sampler => self.retire_resource::<Sampler>(entry.key),
            ResourceKind::Shader => self.retire_resource::<Shader>(entry.key),
            ResourceKind::Pipeline => self.retire_resource::<Pipeline>(entry.key),
            ResourceKind::Swapchain => self.retire_resource::<Swapchain>(entry.key),
            ResourceKind::CommandPool => self.retire_resource::<CommandPool>(entry.key),
            ResourceKind::CommandBuffer => self.retire_resource::<CommandBuffer>(entry.key),
            ResourceKind::Semaphore => self.retire_resource::<Semaphore>(entry.key),
            ResourceKind::Fence => self.retire_resource::<Fence>(entry.key),
        }
    }

    fn retire_resource<T: DeviceResource>(&self, key: ResourceKey) -> bool {
        // 离开 arena 的锁之后再销毁
        let Some(object) = T::arena(&self.arenas).erase(key) else {
            log::error!("{:?} {:?} is retired twice", T::KIND, key);
            return false;
        };
        debug_assert_eq!(object.base().ref_count(), 0);

        log::trace!("destroy {:?} `{}`", T::KIND, object.debug_name());
        object.destroy_native(self.backend());
        true
    }
}

// 提交
impl Device {
    /// 提交命令缓冲，返回这次提交对应的 CPU timeline
    ///
    /// - 所有的命令缓冲都必须处于 Executable 状态，否则不会提交任何内容
    /// - 每个命令缓冲的 completion fence 会被 signal 到其 recording timeline
    /// - device 的 GPU timeline 会被 signal 到返回值
    /// - 提交失败时命令缓冲保持 Executable，跳过的 timeline 值由之后的提交覆盖
    pub fn submit(&self, info: &SubmitInfo) -> GfxResult<u64> {
        let _span = tracy_client::span!("Device::submit");
        self.shared.ensure_not_lost()?;

        if !info.command_buffers.iter().map(|cmd| cmd.key()).all_unique() {
            return Err(GfxError::InvalidArgument("a command buffer is submitted twice in one batch".to_string()));
        }

        let mut scratch = self.scratch.borrow_mut();
        scratch.clear();

        for cmd in &info.command_buffers {
            let cmd = cmd.try_get()?;
            let target = cmd.submit_target()?;
            scratch.command_buffers.push(cmd.native());
            scratch.targets.push(target);
            scratch.signals.push(SemaphoreSubmit::timeline(
                cmd.completion_fence().native(),
                target,
                vk::PipelineStageFlags2::ALL_COMMANDS,
            ));
        }
        for (fence, value, stage) in &info.wait_fences {
            scratch.waits.push(SemaphoreSubmit::timeline(fence.try_get()?.native(), *value, *stage));
        }
        for (semaphore, stage) in &info.wait_semaphores {
            scratch.waits.push(SemaphoreSubmit::binary(semaphore.try_get()?.native(), *stage));
        }
        for (fence, value, stage) in &info.signal_fences {
            scratch.signals.push(SemaphoreSubmit::timeline(fence.try_get()?.native(), *value, *stage));
        }
        for (semaphore, stage) in &info.signal_semaphores {
            scratch.signals.push(SemaphoreSubmit::binary(semaphore.try_get()?.native(), *stage));
        }

        let gpu_timeline = self.gpu_timeline.try_get()?.native();
        let value = self.shared.cpu_timeline.fetch_add(1, Ordering::AcqRel) + 1;
        scratch.signals.push(SemaphoreSubmit::timeline(gpu_timeline, value, vk::PipelineStageFlags2::ALL_COMMANDS));

        let scratch = &*scratch;
        self.shared.check(self.backend().submit(&NativeSubmit {
            command_buffers: &scratch.command_buffers,
            waits: &scratch.waits,
            signals: &scratch.signals,
        }))?;

        for (cmd, target) in info.command_buffers.iter().zip(&scratch.targets) {
            if let Some(cmd) = cmd.get() {
                cmd.mark_pending(*target);
            }
        }
        Ok(value)
    }

    /// 提交这一帧的命令缓冲并 present
    ///
    /// 等待 acquire semaphore，signal present semaphore 以及 swapchain 的 frame fence
    pub fn present(&self, info: &PresentInfo) -> GfxResult<SwapchainStatus> {
        let _span = tracy_client::span!("Device::present");
        self.shared.ensure_not_lost()?;

        let swapchain = info.swapchain.try_get()?;
        let frame = swapchain.presentable_frame()?;

        let mut submit = SubmitInfo::new(&info.command_buffers)
            .wait_semaphore(&frame.acquire_semaphore, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .signal_semaphore(&frame.present_semaphore, vk::PipelineStageFlags2::ALL_COMMANDS)
            .signal_fence(&frame.frame_fence, frame.frame_value, vk::PipelineStageFlags2::ALL_COMMANDS);
        for (fence, value, stage) in &info.wait_fences {
            submit = submit.wait_fence(fence, *value, *stage);
        }
        self.submit(&submit)?;

        let result = self.backend().queue_present(
            swapchain.native(),
            frame.image_index,
            &[frame.present_semaphore.try_get()?.native()],
        );
        let status = swapchain.finish_present(result);
        if result == Err(vk::Result::ERROR_DEVICE_LOST) {
            self.shared.mark_lost();
            return Err(GfxError::DeviceLost);
        }
        Ok(status)
    }

    /// 阻塞直到 GPU 完成所有的工作
    pub fn wait_idle(&self) -> GfxResult<()> {
        let _span = tracy_client::span!("Device::wait_idle");
        self.shared.check(self.backend().wait_idle())
    }

    /// 录制、提交并等待一个临时的命令缓冲，用于上传数据等一次性的工作
    pub fn one_time_exec<R>(
        &self,
        name: &str,
        record: impl FnOnce(&Resource<CommandBuffer>) -> GfxResult<R>,
    ) -> GfxResult<R> {
        let _span = tracy_client::span!("Device::one_time_exec");

        let pool = CommandPool::create(self, CommandPoolInfo::new(format!("{name}-pool")))?;
        let cmd = CommandBuffer::create(self, CommandBufferInfo::new(&pool, name))?;

        cmd.begin()?;
        cmd.begin_label(name, LabelColor::COLOR_UPLOAD)?;
        let result = record(&cmd)?;
        cmd.end_label()?;
        cmd.end()?;

        let value = self.submit(&SubmitInfo::new(&[&cmd]))?;
        let timeout = self.config().one_time_submit_timeout();
        if !self.gpu_timeline.try_get()?.wait_for_value(value, timeout)? {
            return Err(GfxError::Timeout(timeout));
        }
        Ok(result)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _span = tracy_client::span!("Device::drop");
        if let Err(e) = self.wait_idle() {
            log::error!("failed to wait idle before destroying the device: {}", e);
        }

        // GPU 已经 idle，所有 zombie 都可以直接回收
        self.gpu_timeline = Resource::null();
        loop {
            let zombies = self.zombies.get_mut().take_all();
            if zombies.is_empty() {
                break;
            }
            for entry in &zombies {
                self.retire(entry);
            }
        }

        let leaked = self.arenas.total_len();
        if leaked > 0 {
            log::error!("{} resources are still referenced when the device is destroyed, they are leaked", leaked);
        }
        log::info!("device destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::headless::NativeObjectKind;
    use crate::commands::command_buffer::CommandBufferState;
    use crate::resources::buffer::{BufferInfo, MemoryLocation};
    use crate::resources::sampler::SamplerInfo;

    fn device() -> (Device, HeadlessBackend) {
        vigil_crate_tools::init_log::init_test_log();
        let backend = HeadlessBackend::new();
        let device = Device::new_headless(GfxConfig::default(), backend.clone()).unwrap();
        (device, backend)
    }

    fn command_buffer(device: &Device, name: &str) -> Resource<CommandBuffer> {
        let pool = CommandPool::from(device, CommandPoolInfo::new(format!("{name}-pool")));
        CommandBuffer::from(device, CommandBufferInfo::new(&pool, name))
    }

    #[test]
    fn test_empty_submit_advances_timelines_by_one() {
        let (device, _backend) = device();
        assert_eq!(device.cpu_timeline(), 0);

        let value = device.submit(&SubmitInfo::default()).unwrap();
        assert_eq!(value, 1);
        assert_eq!(device.cpu_timeline(), 1);
        assert_eq!(device.gpu_timeline(), 1);
    }

    #[test]
    fn test_buffer_survives_until_gpu_timeline_passes_release() {
        let (device, backend) = device();
        backend.set_deferred(true);

        let buffer = Buffer::from(
            &device,
            BufferInfo::new("vertices", 64, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::GpuOnly),
        );
        let target = Buffer::from(
            &device,
            BufferInfo::new("target", 64, vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuOnly),
        );
        let cmd = command_buffer(&device, "copy");
        cmd.begin().unwrap();
        cmd.copy_buffer(&buffer, &target, &[vk::BufferCopy::default().size(64)]).unwrap();
        cmd.end().unwrap();
        let release = device.submit(&SubmitInfo::new(&[&cmd])).unwrap();

        drop(buffer);
        drop(cmd);
        device.clear_garbage();
        assert_eq!(backend.live_count(NativeObjectKind::Buffer), 2);

        assert_eq!(backend.retire_all(), 1);
        assert!(device.gpu_timeline() >= release);
        device.clear_garbage();
        assert_eq!(backend.live_count(NativeObjectKind::Buffer), 1);
        assert_eq!(backend.double_destroy_count(), 0);
    }

    #[test]
    fn test_zombie_waits_for_its_release_timeline() {
        let (device, backend) = device();
        backend.set_deferred(true);

        let sampler = Sampler::from(&device, SamplerInfo::new("sampler"));
        device.submit(&SubmitInfo::default()).unwrap();
        drop(sampler);

        // 释放时 CPU timeline 为 1，GPU timeline 仍为 0
        assert_eq!(device.clear_garbage(), 0);
        assert_eq!(device.pending_zombie_count(), 1);

        backend.retire_next();
        assert_eq!(device.clear_garbage(), 1);
        assert_eq!(device.pending_zombie_count(), 0);
    }

    #[test]
    fn test_clear_garbage_is_idempotent() {
        let (device, backend) = device();
        for i in 0..3 {
            drop(Sampler::from(&device, SamplerInfo::new(format!("s{i}"))));
        }

        assert_eq!(device.clear_garbage(), 3);
        assert_eq!(device.clear_garbage(), 0);
        assert_eq!(device.clear_garbage(), 0);
        assert_eq!(backend.destroyed_count(NativeObjectKind::Sampler), 3);
        assert_eq!(backend.double_destroy_count(), 0);
    }

    #[test]
    fn test_destroyed_exactly_once_under_random_clone_drop() {
        let (device, backend) = device();
        backend.set_deferred(true);

        let mut handles = vec![Sampler::from(&device, SamplerInfo::new("shared"))];
        for step in 0..64usize {
            match step % 5 {
                0 | 1 | 2 => handles.push(handles[step % handles.len()].clone()),
                3 => {
                    device.submit(&SubmitInfo::default()).unwrap();
                }
                _ => {
                    if handles.len() > 1 {
                        handles.swap_remove(step % handles.len());
                    }
                }
            }
            device.clear_garbage();
            assert_eq!(backend.live_count(NativeObjectKind::Sampler), 1);
        }

        handles.clear();
        let release = device.cpu_timeline();
        device.clear_garbage();
        assert_eq!(backend.live_count(NativeObjectKind::Sampler), 1);

        backend.retire_all();
        assert!(device.gpu_timeline() >= release);
        device.clear_garbage();
        device.clear_garbage();
        assert_eq!(backend.destroyed_count(NativeObjectKind::Sampler), 1);
        assert_eq!(backend.double_destroy_count(), 0);
    }

    #[test]
    fn test_submit_rejects_non_executable_buffer() {
        let (device, backend) = device();
        let cmd = command_buffer(&device, "initial");

        let err = device.submit(&SubmitInfo::new(&[&cmd])).unwrap_err();
        assert!(matches!(err, GfxError::InvalidCommandBufferState { .. }));
        assert_eq!(device.cpu_timeline(), 0);
        assert_eq!(backend.submit_count(), 0);
    }

    #[test]
    fn test_submit_rejects_duplicate_buffer() {
        let (device, _backend) = device();
        let cmd = command_buffer(&device, "dup");
        cmd.begin().unwrap();
        cmd.end().unwrap();

        assert!(device.submit(&SubmitInfo::new(&[&cmd, &cmd])).is_err());
        assert_eq!(device.cpu_timeline(), 0);
    }

    #[test]
    fn test_failed_submit_is_covered_by_next_submit() {
        let (device, backend) = device();
        let cmd = command_buffer(&device, "retry");
        cmd.begin().unwrap();
        cmd.end().unwrap();

        backend.script_submit(Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        let err = device.submit(&SubmitInfo::new(&[&cmd])).unwrap_err();
        assert!(matches!(err, GfxError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)));
        assert!(!device.is_lost());
        assert_eq!(cmd.state(), CommandBufferState::Executable);
        assert_eq!(device.cpu_timeline(), 1);
        assert_eq!(device.gpu_timeline(), 0);

        // 释放时的 timeline 值没有被 signal
        drop(Sampler::from(&device, SamplerInfo::new("sampler")));
        assert_eq!(device.clear_garbage(), 0);
        assert_eq!(device.pending_zombie_count(), 1);

        assert_eq!(device.submit(&SubmitInfo::new(&[&cmd])).unwrap(), 2);
        device.wait_idle().unwrap();
        assert_eq!(device.gpu_timeline(), 2);
        assert!(cmd.is_completed());
        assert_eq!(device.clear_garbage(), 1);
        assert_eq!(device.pending_zombie_count(), 0);
        assert_eq!(backend.submit_count(), 1);
        assert_eq!(backend.double_destroy_count(), 0);
    }

    #[test]
    fn test_device_lost_is_latched() {
        let (device, backend) = device();
        backend.set_device_lost();

        assert!(matches!(device.submit(&SubmitInfo::default()), Err(GfxError::DeviceLost)));
        assert!(device.is_lost());
        assert!(matches!(device.submit(&SubmitInfo::default()), Err(GfxError::DeviceLost)));
    }

    #[test]
    fn test_submit_waits_on_caller_fence() {
        let (device, backend) = device();
        let gate = Fence::from(&device, FenceInfo::new("gate"));
        let done = Fence::from(&device, FenceInfo::new("done"));

        device
            .submit(
                &SubmitInfo::default()
                    .wait_fence(&gate, 1, vk::PipelineStageFlags2::ALL_COMMANDS)
                    .signal_fence(&done, 7, vk::PipelineStageFlags2::ALL_COMMANDS),
            )
            .unwrap();
        assert_eq!(backend.pending_submit_count(), 1);
        assert_eq!(device.gpu_timeline(), 0);

        gate.signal(1).unwrap();
        assert_eq!(done.value().unwrap(), 7);
        assert_eq!(device.gpu_timeline(), 1);
    }

    #[test]
    fn test_one_time_exec_waits_for_completion() {
        let (device, backend) = device();
        device.one_time_exec("noop", |cmd| cmd.dispatch([1, 1, 1])).unwrap();
        assert_eq!(device.gpu_timeline(), 1);
        assert_eq!(backend.executed_count(), 1);
    }

    #[test]
    fn test_one_time_exec_times_out_when_gpu_stalls() {
        let backend = HeadlessBackend::new();
        let config = GfxConfig {
            one_time_submit_timeout_ms: 10,
            ..GfxConfig::default()
        };
        let device = Device::new_headless(config, backend.clone()).unwrap();
        backend.set_deferred(true);

        let err = device.one_time_exec("stalled", |_| Ok(())).unwrap_err();
        assert!(matches!(err, GfxError::Timeout(timeout) if timeout == Duration::from_millis(10)));
        backend.retire_all();
    }

    #[test]
    fn test_drop_device_destroys_everything() {
        let backend = HeadlessBackend::new();
        {
            let device = Device::new_headless(GfxConfig::default(), backend.clone()).unwrap();
            backend.set_deferred(true);
            let _buffer = Buffer::from(
                &device,
                BufferInfo::new("buffer", 16, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryLocation::CpuToGpu),
            );
            let cmd = command_buffer(&device, "cmd");
            cmd.begin().unwrap();
            cmd.end().unwrap();
            device.submit(&SubmitInfo::new(&[&cmd])).unwrap();
            drop(cmd);
            drop(_buffer);
        }
        assert_eq!(backend.total_live_count(), 0);
        assert_eq!(backend.double_destroy_count(), 0);
    }
}
