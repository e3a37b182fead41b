//! 带有帧节奏控制的 swapchain
//!
//! 使用两个计数控制 CPU 最多领先 GPU `max_frames_in_flight` 帧：
//! - `cpu_elapsed_frames`：成功 acquire 的帧数
//! - `gpu_elapsed_frames`：timeline fence，每一帧 present 时由 GPU signal 为当时的 `cpu_elapsed_frames`，
//!   重建时还没有 present 的帧由一个空的提交 signal
//!
//! acquire 之前会等待 `gpu_elapsed_frames >= cpu_elapsed_frames + 1 - max_frames_in_flight`，
//! 因此返回 image 时总是满足 `gpu_elapsed_frames >= cpu_elapsed_frames - max_frames_in_flight`。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ash::vk;
use itertools::Itertools;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::backend::{self, GfxBackend, NativeImageViewDesc, NativeSwapchain, NativeSwapchainDesc};
use crate::commands::fence::{Fence, FenceInfo};
use crate::commands::semaphore::Semaphore;
use crate::commands::submit_info::SubmitInfo;
use crate::config::PresentMode;
use crate::error::{GfxError, GfxResult};
use crate::foundation::device::Device;
use crate::resources::arena::{ResourceArena, ResourceArenas};
use crate::resources::image::Image;
use crate::resources::resource::{DeviceResource, RefCountedDeviceResource, Resource, ResourceKind};

/// 最近一次 acquire / present 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Ok,
    /// 没有可用的 image（timeout 为 0 时）
    NotReady,
    /// 等待 GPU 或者等待 image 超时
    TimedOut,
    /// 可以继续使用，但是最好重建
    Suboptimal,
    /// 需要重建 swapchain（例如 out of date）
    Error,
}

impl SwapchainStatus {
    /// 是否得到了可以渲染的 image
    #[inline]
    pub fn has_image(self) -> bool {
        matches!(self, SwapchainStatus::Ok | SwapchainStatus::Suboptimal)
    }

    /// 是否需要重建 swapchain
    #[inline]
    pub fn needs_recreate(self) -> bool {
        matches!(self, SwapchainStatus::Suboptimal | SwapchainStatus::Error)
    }
}

pub struct SwapchainInfo {
    pub name: String,
    /// 窗口的物理尺寸，最终尺寸由 surface 决定
    pub extent: vk::Extent2D,
    pub image_count: u32,
    /// None 表示使用 [`GfxConfig`](crate::config::GfxConfig) 中的设置
    pub present_mode: Option<PresentMode>,
    /// headless backend 不需要窗口
    pub window: Option<(RawDisplayHandle, RawWindowHandle)>,
    /// 重建时传入旧的 swapchain，会复用 surface 以及帧计数
    pub old_swapchain: Option<Resource<Swapchain>>,
}

impl SwapchainInfo {
    pub fn new(name: impl Into<String>, extent: vk::Extent2D) -> Self {
        Self {
            name: name.into(),
            extent,
            image_count: 3,
            present_mode: None,
            window: None,
            old_swapchain: None,
        }
    }

    /// builder
    #[inline]
    pub fn window(mut self, display: RawDisplayHandle, window: RawWindowHandle) -> Self {
        self.window = Some((display, window));
        self
    }

    /// builder
    #[inline]
    pub fn image_count(mut self, image_count: u32) -> Self {
        self.image_count = image_count;
        self
    }

    /// builder
    #[inline]
    pub fn present_mode(mut self, present_mode: PresentMode) -> Self {
        self.present_mode = Some(present_mode);
        self
    }

    /// builder
    #[inline]
    pub fn old_swapchain(mut self, old_swapchain: &Resource<Swapchain>) -> Self {
        self.old_swapchain = Some(old_swapchain.clone());
        self
    }
}

/// acquire 的结果，只有 status 为 Ok / Suboptimal 时 image 才有效
pub struct SwapchainAcquire {
    pub status: SwapchainStatus,
    pub image_index: Option<u32>,
    pub image: Resource<Image>,
}

impl SwapchainAcquire {
    fn empty(status: SwapchainStatus) -> Self {
        Self {
            status,
            image_index: None,
            image: Resource::null(),
        }
    }
}

/// present 一帧需要的同步对象
pub(crate) struct PresentableFrame {
    pub acquire_semaphore: Resource<Semaphore>,
    pub present_semaphore: Resource<Semaphore>,
    pub frame_fence: Resource<Fence>,
    pub frame_value: u64,
    pub image_index: u32,
}

struct FrameState {
    cpu_elapsed_frames: u64,
    current_frame_index: usize,
    /// 已经 acquire 但还没有 present 的 (frame index, image index)
    acquired: Option<(usize, u32)>,
    status: SwapchainStatus,
}

pub struct Swapchain {
    base: RefCountedDeviceResource,
    handle: vk::SwapchainKHR,
    /// 重建的 swapchain 之间共享同一个 surface，最后一个 swapchain 销毁时销毁 surface
    surface: Arc<vk::SurfaceKHR>,

    images: Vec<Resource<Image>>,
    /// swapchain image 的 view 由 swapchain 管理
    views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,

    /// 每个 frame in flight 一个
    acquire_semaphores: Vec<Resource<Semaphore>>,
    /// 每个 image 一个，image 再次被 acquire 时上一次的 present 一定已经完成
    present_semaphores: Vec<Resource<Semaphore>>,
    gpu_elapsed_frames: Resource<Fence>,
    max_frames_in_flight: u64,

    frame: Mutex<FrameState>,
    name: String,
}

impl DeviceResource for Swapchain {
    const KIND: ResourceKind = ResourceKind::Swapchain;

    fn base(&self) -> &RefCountedDeviceResource {
        &self.base
    }

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self> {
        &arenas.swapchains
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn destroy_native(&self, backend: &dyn GfxBackend) {
        for view in &self.views {
            backend.destroy_image_view(*view);
        }
        backend.destroy_swapchain(self.handle);
        if Arc::strong_count(&self.surface) == 1 {
            backend.destroy_surface(*self.surface);
        }
    }
}

// new & init
impl Swapchain {
    pub fn create(device: &Device, info: SwapchainInfo) -> GfxResult<Resource<Self>> {
        let _span = tracy_client::span!("Swapchain::create");
        let backend = device.backend();
        let max_frames_in_flight = device.config().max_frames_in_flight.max(1);
        let present_mode = info.present_mode.unwrap_or(device.config().present_mode);

        let (surface, cpu_elapsed_frames, gpu_elapsed_frames, old_handle) = match &info.old_swapchain {
            Some(old) => {
                let old = old.try_get()?;
                old.release_unpresented_frame(device)?;
                (old.surface.clone(), old.cpu_frame_count(), old.gpu_elapsed_frames.clone(), old.handle)
            }
            None => {
                let fence = Fence::create(device, FenceInfo::new(format!("{}-gpu-elapsed-frames", info.name)))?;
                let surface = backend.create_surface(info.window)?;
                (Arc::new(surface), 0, fence, vk::SwapchainKHR::null())
            }
        };
        let release_surface = |backend: &dyn GfxBackend| {
            if Arc::strong_count(&surface) == 1 {
                backend.destroy_surface(*surface);
            }
        };

        let native = match backend.create_swapchain(&NativeSwapchainDesc {
            name: &info.name,
            surface: *surface,
            extent: info.extent,
            min_image_count: info.image_count.max(max_frames_in_flight),
            present_mode: present_mode.vk_present_mode(),
            old_swapchain: old_handle,
        }) {
            Ok(native) => native,
            Err(e) => {
                release_surface(backend);
                return Err(e);
            }
        };

        let mut views = Vec::with_capacity(native.images.len());
        let synchronization = Self::create_views(backend, &info.name, &native, &mut views)
            .and_then(|()| Self::create_semaphores(device, &info.name, max_frames_in_flight, native.images.len()));
        let (acquire_semaphores, present_semaphores) = match synchronization {
            Ok(semaphores) => semaphores,
            Err(e) => {
                // 已经创建的 semaphore 随 handle 一起进入 zombie 队列
                views.iter().for_each(|view| backend.destroy_image_view(*view));
                backend.destroy_swapchain(native.handle);
                release_surface(backend);
                return Err(e);
            }
        };

        let images = native
            .images
            .iter()
            .zip(&views)
            .enumerate()
            .map(|(i, (image, view))| {
                Image::from_external(
                    device,
                    *image,
                    *view,
                    native.format,
                    native.extent,
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
                    format!("{}-image-{}", info.name, i),
                )
            })
            .collect_vec();

        log::info!(
            "create swapchain `{}`: {}x{}, {} images, {:?}, {} frames in flight",
            info.name,
            native.extent.width,
            native.extent.height,
            images.len(),
            native.format,
            max_frames_in_flight
        );
        Ok(device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle: native.handle,
            surface,
            images,
            views,
            format: native.format,
            extent: native.extent,
            acquire_semaphores,
            present_semaphores,
            gpu_elapsed_frames,
            max_frames_in_flight: max_frames_in_flight as u64,
            frame: Mutex::new(FrameState {
                cpu_elapsed_frames,
                current_frame_index: 0,
                acquired: None,
                status: SwapchainStatus::Ok,
            }),
            name: info.name,
        }))
    }

    fn create_views(
        backend: &dyn GfxBackend,
        name: &str,
        native: &NativeSwapchain,
        views: &mut Vec<vk::ImageView>,
    ) -> GfxResult<()> {
        for (i, image) in native.images.iter().enumerate() {
            views.push(backend.create_image_view(&NativeImageViewDesc {
                name: &format!("{}-image-{}", name, i),
                image: *image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: native.format,
                aspect: vk::ImageAspectFlags::COLOR,
                mip_levels: 1,
                array_layers: 1,
            })?);
        }
        Ok(())
    }

    fn create_semaphores(
        device: &Device,
        name: &str,
        frames_in_flight: u32,
        image_count: usize,
    ) -> GfxResult<(Vec<Resource<Semaphore>>, Vec<Resource<Semaphore>>)> {
        let acquire_semaphores = (0..frames_in_flight)
            .map(|i| Semaphore::create(device, format!("{}-acquire-{}", name, i)))
            .collect::<GfxResult<Vec<_>>>()?;
        let present_semaphores = (0..image_count)
            .map(|i| Semaphore::create(device, format!("{}-present-{}", name, i)))
            .collect::<GfxResult<Vec<_>>>()?;
        Ok((acquire_semaphores, present_semaphores))
    }

    /// 创建失败时返回 null handle
    pub fn from(device: &Device, info: SwapchainInfo) -> Resource<Self> {
        let name = info.name.clone();
        Self::create(device, info).unwrap_or_else(|e| {
            log::error!("failed to create swapchain `{}`: {}", name, e);
            Resource::null()
        })
    }
}
// getters
impl Swapchain {
    #[inline]
    pub fn native(&self) -> vk::SwapchainKHR {
        self.handle
    }

    #[inline]
    pub fn images(&self) -> &[Resource<Image>] {
        &self.images
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn max_frames_in_flight(&self) -> u64 {
        self.max_frames_in_flight
    }

    /// 成功 acquire 的帧数
    #[inline]
    pub fn cpu_frame_count(&self) -> u64 {
        self.lock().cpu_elapsed_frames
    }

    /// GPU 已经完成的帧数
    #[inline]
    pub fn gpu_frame_count(&self) -> GfxResult<u64> {
        self.gpu_elapsed_frames.value()
    }

    #[inline]
    pub fn current_frame_index(&self) -> usize {
        self.lock().current_frame_index
    }

    #[inline]
    pub fn status(&self) -> SwapchainStatus {
        self.lock().status
    }
}

// update
impl Swapchain {
    #[inline]
    fn lock(&self) -> MutexGuard<'_, FrameState> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 等待 GPU 追上之后 acquire 下一个 image
    ///
    /// - 等待 GPU 超时返回 `TimedOut`，帧计数不变
    /// - 只有 status 为 Ok / Suboptimal 时才会增加 CPU 帧计数
    /// - 设备丢失时返回 `Err(DeviceLost)`
    pub fn acquire_next_image(&self, timeout: Duration) -> GfxResult<SwapchainAcquire> {
        let _span = tracy_client::span!("Swapchain::acquire_next_image");
        let device = self.base.device();
        device.ensure_not_lost()?;

        let mut frame = self.lock();
        if frame.acquired.is_some() {
            return Err(GfxError::InvalidArgument(format!("swapchain `{}` acquires twice without present", self.name)));
        }

        // 1. 限制 CPU 最多领先 GPU max_frames_in_flight 帧
        let cpu_frames = frame.cpu_elapsed_frames;
        if cpu_frames + 1 > self.max_frames_in_flight {
            let target = cpu_frames + 1 - self.max_frames_in_flight;
            if !self.gpu_elapsed_frames.wait_for_value(target, timeout)? {
                log::debug!("swapchain `{}` timed out waiting for gpu frame {}", self.name, target);
                frame.status = SwapchainStatus::TimedOut;
                return Ok(SwapchainAcquire::empty(SwapchainStatus::TimedOut));
            }
        }

        // 2. frame in flight 的 ring index
        let frame_index = (cpu_frames % self.max_frames_in_flight) as usize;
        frame.current_frame_index = frame_index;

        // 3. 4.
        let result = self.base.backend().acquire_next_image(
            self.handle,
            self.acquire_semaphores[frame_index].native(),
            backend::timeout_ns(timeout),
        );
        let (status, image_index) = match result {
            Ok((image_index, false)) => (SwapchainStatus::Ok, Some(image_index)),
            Ok((image_index, true)) => {
                log::warn!("swapchain `{}` acquire image index {} is not optimal", self.name, image_index);
                (SwapchainStatus::Suboptimal, Some(image_index))
            }
            Err(vk::Result::NOT_READY) => (SwapchainStatus::NotReady, None),
            Err(vk::Result::TIMEOUT) => (SwapchainStatus::TimedOut, None),
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                device.mark_lost();
                return Err(GfxError::DeviceLost);
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("swapchain `{}` is out of date when acquire next image", self.name);
                (SwapchainStatus::Error, None)
            }
            Err(e) => {
                log::error!("failed to acquire next image of swapchain `{}`: {:?}", self.name, e);
                (SwapchainStatus::Error, None)
            }
        };
        frame.status = status;

        // 5.
        let Some(image_index) = image_index else {
            return Ok(SwapchainAcquire::empty(status));
        };
        let Some(image) = self.images.get(image_index as usize) else {
            log::error!("swapchain `{}` acquired an unknown image index {}", self.name, image_index);
            frame.status = SwapchainStatus::Error;
            return Ok(SwapchainAcquire::empty(SwapchainStatus::Error));
        };
        frame.cpu_elapsed_frames += 1;
        frame.acquired = Some((frame_index, image_index));
        Ok(SwapchainAcquire {
            status,
            image_index: Some(image_index),
            image: image.clone(),
        })
    }

    /// 重建之前 acquire 但没有 present 的帧
    ///
    /// 提交一个空的 batch 等待这一帧的 acquire semaphore，并将 `gpu_elapsed_frames` signal 到这一帧，
    /// 否则新的 swapchain 继承的 CPU 帧计数永远等不到 GPU
    fn release_unpresented_frame(&self, device: &Device) -> GfxResult<()> {
        let mut frame = self.lock();
        let Some((frame_index, image_index)) = frame.acquired else {
            return Ok(());
        };

        log::info!(
            "swapchain `{}` releases image {} of frame {} without present",
            self.name,
            image_index,
            frame.cpu_elapsed_frames
        );
        device.submit(
            &SubmitInfo::default()
                .wait_semaphore(&self.acquire_semaphores[frame_index], vk::PipelineStageFlags2::ALL_COMMANDS)
                .signal_fence(&self.gpu_elapsed_frames, frame.cpu_elapsed_frames, vk::PipelineStageFlags2::ALL_COMMANDS),
        )?;
        frame.acquired = None;
        Ok(())
    }

    /// 当前 acquire 的 image 在 present 时需要的同步对象
    pub(crate) fn presentable_frame(&self) -> GfxResult<PresentableFrame> {
        let frame = self.lock();
        let Some((frame_index, image_index)) = frame.acquired else {
            return Err(GfxError::InvalidArgument(format!("swapchain `{}` presents without an acquired image", self.name)));
        };
        Ok(PresentableFrame {
            acquire_semaphore: self.acquire_semaphores[frame_index].clone(),
            present_semaphore: self.present_semaphores[image_index as usize].clone(),
            frame_fence: self.gpu_elapsed_frames.clone(),
            frame_value: frame.cpu_elapsed_frames,
            image_index,
        })
    }

    /// present 之后更新状态，无论结果如何 acquire 的 image 都已经交还给 swapchain
    pub(crate) fn finish_present(&self, result: Result<bool, vk::Result>) -> SwapchainStatus {
        let mut frame = self.lock();
        frame.acquired = None;
        frame.status = match result {
            Ok(false) => SwapchainStatus::Ok,
            Ok(true) => {
                log::warn!("swapchain `{}` present is not optimal", self.name);
                SwapchainStatus::Suboptimal
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::warn!("swapchain `{}` is out of date when present image", self.name);
                SwapchainStatus::Error
            }
            Err(e) => {
                log::error!("failed to present swapchain `{}`: {:?}", self.name, e);
                SwapchainStatus::Error
            }
        };
        frame.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, NativeObjectKind};
    use crate::commands::command_buffer::{CommandBuffer, CommandBufferInfo};
    use crate::commands::command_pool::{CommandPool, CommandPoolInfo};
    use crate::commands::submit_info::PresentInfo;
    use crate::config::GfxConfig;
    use crate::pipelines::rendering_info::{RenderingAttachment, RenderingInfo};

    const EXTENT: vk::Extent2D = vk::Extent2D { width: 8, height: 8 };
    const SHORT: Duration = Duration::from_millis(5);

    fn device(max_frames_in_flight: u32) -> (Device, HeadlessBackend) {
        let backend = HeadlessBackend::new();
        vigil_crate_tools::init_log::init_test_log();
        let config = GfxConfig {
            max_frames_in_flight,
            ..GfxConfig::default()
        };
        let device = Device::new_headless(config, backend.clone()).unwrap();
        (device, backend)
    }

    #[test]
    fn test_third_acquire_waits_for_gpu() {
        let (device, backend) = device(2);
        backend.set_deferred(true);
        let swapchain = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT).image_count(3));

        for _ in 0..2 {
            let acquire = swapchain.acquire_next_image(SHORT).unwrap();
            assert_eq!(acquire.status, SwapchainStatus::Ok);
            assert!(acquire.image.valid());
            device.present(&PresentInfo::new(&swapchain)).unwrap();
        }

        // GPU 还没有完成任何一帧
        let acquire = swapchain.acquire_next_image(SHORT).unwrap();
        assert_eq!(acquire.status, SwapchainStatus::TimedOut);
        assert!(!acquire.image.valid());
        assert_eq!(swapchain.cpu_frame_count(), 2);

        backend.retire_next();
        let acquire = swapchain.acquire_next_image(SHORT).unwrap();
        assert_eq!(acquire.status, SwapchainStatus::Ok);
        assert_eq!(swapchain.cpu_frame_count(), 3);
        assert_eq!(swapchain.current_frame_index(), 0);
    }

    #[test]
    fn test_cpu_never_runs_ahead_of_gpu() {
        let (device, backend) = device(3);
        backend.set_deferred(true);
        let swapchain = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT));

        let mut seed = 0x9e37_79b9_u32;
        for _ in 0..100 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 {
                backend.retire_next();
            }

            let acquire = swapchain.acquire_next_image(Duration::ZERO).unwrap();
            if acquire.status.has_image() {
                let gpu = swapchain.gpu_frame_count().unwrap();
                let cpu = swapchain.cpu_frame_count();
                assert!(gpu + swapchain.max_frames_in_flight() >= cpu);
                device.present(&PresentInfo::new(&swapchain)).unwrap();
            } else {
                assert_eq!(acquire.status, SwapchainStatus::TimedOut);
            }
        }
    }

    #[test]
    fn test_recreate_after_unpresented_acquire() {
        let (device, backend) = device(2);
        let first = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT));

        backend.script_acquire(Ok((0, true)));
        let acquire = first.acquire_next_image(SHORT).unwrap();
        assert!(acquire.status.needs_recreate());
        drop(acquire);
        let second = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT).old_swapchain(&first));
        assert!(second.valid());
        assert!(!backend.is_binary_signaled(first.acquire_semaphores[0].native()));

        backend.script_acquire(Ok((0, true)));
        assert_eq!(second.acquire_next_image(SHORT).unwrap().status, SwapchainStatus::Suboptimal);
        let third = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT).old_swapchain(&second));
        assert!(third.valid());

        backend.retire_all();
        device.wait_idle().unwrap();
        assert_eq!(third.cpu_frame_count(), 2);
        assert_eq!(third.gpu_frame_count().unwrap(), 2);

        for _ in 0..5 {
            let acquire = third.acquire_next_image(SHORT).unwrap();
            assert_eq!(acquire.status, SwapchainStatus::Ok);
            device.present(&PresentInfo::new(&third)).unwrap();
        }
        assert_eq!(third.cpu_frame_count(), 7);
        assert_eq!(third.gpu_frame_count().unwrap(), 7);
    }

    #[test]
    fn test_pacing_holds_across_recreate() {
        let (device, backend) = device(2);
        backend.set_deferred(true);
        let mut swapchain = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT));

        let mut seed = 0x2545_f491_u32;
        let mut recreated = 0;
        for _ in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 {
                backend.retire_next();
            }
            if seed % 7 == 0 {
                backend.script_acquire(Ok((0, true)));
            }

            let acquire = swapchain.acquire_next_image(Duration::ZERO).unwrap();
            if acquire.status.has_image() {
                let gpu = swapchain.gpu_frame_count().unwrap();
                assert!(gpu + swapchain.max_frames_in_flight() >= swapchain.cpu_frame_count());
            }
            match acquire.status {
                SwapchainStatus::Ok => {
                    device.present(&PresentInfo::new(&swapchain)).unwrap();
                }
                SwapchainStatus::Suboptimal => {
                    drop(acquire);
                    swapchain = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT).old_swapchain(&swapchain));
                    assert!(swapchain.valid());
                    recreated += 1;
                }
                status => assert_eq!(status, SwapchainStatus::TimedOut),
            }
        }
        assert!(recreated > 0);

        backend.retire_all();
        device.wait_idle().unwrap();
        assert_eq!(swapchain.gpu_frame_count().unwrap(), swapchain.cpu_frame_count());
        assert!(swapchain.acquire_next_image(SHORT).unwrap().status.has_image());
    }

    #[test]
    fn test_present_signals_frame_fence() {
        let (device, backend) = device(2);
        let swapchain = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT));
        let pool = CommandPool::from(&device, CommandPoolInfo::new("frame"));
        let cmd = CommandBuffer::from(&device, CommandBufferInfo::new(&pool, "frame-0"));

        let acquire = swapchain.acquire_next_image(SHORT).unwrap();
        cmd.begin().unwrap();
        cmd.begin_rendering(&RenderingInfo::new(EXTENT).color_attachment(RenderingAttachment::color(&acquire.image)))
            .unwrap();
        cmd.end_rendering().unwrap();
        cmd.end().unwrap();

        let status = device.present(&PresentInfo::new(&swapchain).command_buffer(&cmd)).unwrap();
        assert_eq!(status, SwapchainStatus::Ok);
        assert_eq!(backend.presents(), vec![(swapchain.native(), 0)]);
        assert_eq!(swapchain.gpu_frame_count().unwrap(), 1);
        assert_eq!(device.gpu_timeline(), device.cpu_timeline());
    }

    #[test]
    fn test_present_without_acquire_fails() {
        let (device, backend) = device(2);
        let swapchain = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT));

        assert!(device.present(&PresentInfo::new(&swapchain)).is_err());
        assert_eq!(backend.submit_count(), 0);
    }

    #[test]
    fn test_acquire_result_mapping() {
        let (device, backend) = device(2);
        let swapchain = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT));

        backend.script_acquire(Err(vk::Result::NOT_READY));
        assert_eq!(swapchain.acquire_next_image(SHORT).unwrap().status, SwapchainStatus::NotReady);
        backend.script_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        let acquire = swapchain.acquire_next_image(SHORT).unwrap();
        assert_eq!(acquire.status, SwapchainStatus::Error);
        assert!(acquire.status.needs_recreate());
        assert_eq!(swapchain.cpu_frame_count(), 0);

        backend.script_acquire(Ok((1, true)));
        let acquire = swapchain.acquire_next_image(SHORT).unwrap();
        assert_eq!(acquire.status, SwapchainStatus::Suboptimal);
        assert_eq!(acquire.image_index, Some(1));
        assert_eq!(swapchain.cpu_frame_count(), 1);

        backend.script_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert_eq!(device.present(&PresentInfo::new(&swapchain)).unwrap(), SwapchainStatus::Error);
        assert_eq!(swapchain.status(), SwapchainStatus::Error);
    }

    #[test]
    fn test_device_lost_during_acquire() {
        let (device, backend) = device(2);
        let swapchain = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT));

        backend.script_acquire(Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(swapchain.acquire_next_image(SHORT), Err(GfxError::DeviceLost)));
        assert!(device.is_lost());
        assert!(matches!(swapchain.acquire_next_image(SHORT), Err(GfxError::DeviceLost)));
    }

    #[test]
    fn test_recreate_keeps_surface_and_frame_count() {
        let (device, backend) = device(2);
        let old = Swapchain::from(&device, SwapchainInfo::new("main", EXTENT));
        old.acquire_next_image(SHORT).unwrap();
        device.present(&PresentInfo::new(&old)).unwrap();

        let new = Swapchain::from(
            &device,
            SwapchainInfo::new("main", vk::Extent2D { width: 16, height: 16 }).old_swapchain(&old),
        );
        assert_eq!(new.cpu_frame_count(), 1);
        assert_eq!(new.extent().width, 16);

        drop(old);
        device.clear_garbage();
        assert_eq!(backend.live_count(NativeObjectKind::Swapchain), 1);
        assert_eq!(backend.live_count(NativeObjectKind::Surface), 1);

        let acquire = new.acquire_next_image(SHORT).unwrap();
        assert_eq!(acquire.status, SwapchainStatus::Ok);
        device.present(&PresentInfo::new(&new)).unwrap();
        assert_eq!(new.gpu_frame_count().unwrap(), 2);

        drop(acquire);
        drop(new);
        device.clear_garbage();
        assert_eq!(backend.live_count(NativeObjectKind::Swapchain), 0);
        assert_eq!(backend.live_count(NativeObjectKind::Surface), 0);
        assert_eq!(backend.live_count(NativeObjectKind::ImageView), 0);
    }
}
