//! 基于 ash / vk-mem 的 Vulkan 后端
//!
//! - 只使用一个同时支持 graphics / compute / transfer 的 queue
//! - buffer 和 image 的内存由 vma 分配
//! - 创建时传入 display handle 才会开启 swapchain 相关的 extension

mod allocator;
mod commands;
mod instance;
mod physical_device;
mod pipeline;
mod presentation;

use std::ffi::CString;
use std::sync::{Mutex, MutexGuard};

use ash::vk;
use itertools::Itertools;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::backend::{
    GfxBackend, NativeBuffer, NativeBufferDesc, NativeCommand, NativeImage, NativeImageDesc, NativeImageViewDesc,
    NativePipeline, NativePipelineDesc, NativeSubmit, NativeSwapchain, NativeSwapchainDesc,
};
use crate::config::GfxConfig;
use crate::error::{GfxError, GfxResult};
use crate::resources::sampler::SamplerInfo;
use allocator::MemAllocator;
use instance::VulkanInstance;
use physical_device::PhysicalDevice;

const BACKEND_NAME: &str = "vulkan";

pub struct VulkanBackend {
    instance: VulkanInstance,
    pdevice: PhysicalDevice,
    device: ash::Device,
    /// queue 的访问需要外部同步
    queue: Mutex<vk::Queue>,
    allocator: MemAllocator,

    surface_loader: ash::khr::surface::Instance,
    /// 只有创建时传入了 display handle 才有值
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
}

// 构造与销毁
impl VulkanBackend {
    /// - `display`：需要呈现到窗口时传入，用于开启 surface / swapchain extension
    pub fn new(config: &GfxConfig, display: Option<RawDisplayHandle>) -> GfxResult<Self> {
        let _span = tracy_client::span!("VulkanBackend::new");

        let mut instance = VulkanInstance::new(config, display)?;
        let need_swapchain = display.is_some();

        let pdevice = match PhysicalDevice::select(&instance.instance, config, need_swapchain) {
            Ok(pdevice) => pdevice,
            Err(e) => {
                instance.destroy();
                return Err(e);
            }
        };

        let device = match Self::create_device(&instance.instance, &pdevice, need_swapchain) {
            Ok(device) => device,
            Err(e) => {
                instance.destroy();
                return Err(e);
            }
        };

        let allocator = match MemAllocator::new(&instance.instance, pdevice.handle, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                instance.destroy();
                return Err(e);
            }
        };

        let queue = unsafe { device.get_device_queue(pdevice.queue_family_index, 0) };
        let surface_loader = ash::khr::surface::Instance::new(&instance.entry, &instance.instance);
        let swapchain_loader = need_swapchain.then(|| ash::khr::swapchain::Device::new(&instance.instance, &device));
        let debug_utils = instance
            .debug_utils_enabled
            .then(|| ash::ext::debug_utils::Device::new(&instance.instance, &device));

        Ok(Self {
            instance,
            pdevice,
            device,
            queue: Mutex::new(queue),
            allocator,
            surface_loader,
            swapchain_loader,
            debug_utils,
        })
    }

    fn create_device(
        instance: &ash::Instance,
        pdevice: &PhysicalDevice,
        need_swapchain: bool,
    ) -> GfxResult<ash::Device> {
        let device_exts = PhysicalDevice::required_exts(need_swapchain).iter().map(|e| e.as_ptr()).collect_vec();
        log::info!(
            "device exts: {}",
            PhysicalDevice::required_exts(need_swapchain).iter().map(|e| format!("\n\t{e:?}")).join("")
        );

        let queue_priorities = [1.0];
        let queue_ci = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(pdevice.queue_family_index)
            .queue_priorities(&queue_priorities);

        let mut features12 =
            vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true).buffer_device_address(true);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true).dynamic_rendering(true);

        let device_ci = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_ci))
            .enabled_extension_names(&device_exts)
            .push_next(&mut features12)
            .push_next(&mut features13);

        Ok(unsafe { instance.create_device(pdevice.handle, &device_ci, None)? })
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let _span = tracy_client::span!("VulkanBackend::drop");
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("failed to wait device idle before destroy: {:?}", e);
            }
        }
        self.allocator.destroy();
        log::info!("destroying device");
        unsafe { self.device.destroy_device(None) };
        self.instance.destroy();
    }
}

// 辅助函数
impl VulkanBackend {
    #[inline]
    fn queue(&self) -> MutexGuard<'_, vk::Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn physical_device_properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.pdevice.properties
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.pdevice.queue_family_index
    }

    /// 只有开启 debug utils 时才生效
    fn set_debug_name(&self, handle: impl vk::Handle, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_handle(handle).object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&name_info) } {
            log::warn!("failed to set debug name {:?}: {:?}", name, e);
        }
    }

    fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device, vk::Result> {
        self.swapchain_loader.as_ref().ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)
    }

    fn default_view_type(image_type: vk::ImageType, array_layers: u32) -> vk::ImageViewType {
        match (image_type, array_layers) {
            (vk::ImageType::TYPE_1D, 1) => vk::ImageViewType::TYPE_1D,
            (vk::ImageType::TYPE_1D, _) => vk::ImageViewType::TYPE_1D_ARRAY,
            (vk::ImageType::TYPE_3D, _) => vk::ImageViewType::TYPE_3D,
            (_, 1) => vk::ImageViewType::TYPE_2D,
            _ => vk::ImageViewType::TYPE_2D_ARRAY,
        }
    }
}

impl GfxBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn create_buffer(&self, desc: &NativeBufferDesc) -> GfxResult<NativeBuffer> {
        let buffer_ci = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let (handle, mapped) = self.allocator.create_buffer(&buffer_ci, desc.location)?;

        let device_address = desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS).then(|| unsafe {
            self.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(handle))
        });

        self.set_debug_name(handle, &format!("Buffer::{}", desc.name));
        Ok(NativeBuffer {
            handle,
            mapped,
            device_address,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.allocator.destroy_buffer(buffer);
    }

    fn flush_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        self.allocator.flush_buffer(buffer, offset, size)
    }

    fn invalidate_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        self.allocator.invalidate_buffer(buffer, offset, size)
    }

    fn create_image(&self, desc: &NativeImageDesc) -> GfxResult<NativeImage> {
        let image_ci = vk::ImageCreateInfo::default()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = self.allocator.create_image(&image_ci)?;
        self.set_debug_name(handle, &format!("Image::{}", desc.name));

        let view = self.create_image_view(&NativeImageViewDesc {
            name: desc.name,
            image: handle,
            view_type: Self::default_view_type(desc.image_type, desc.array_layers),
            format: desc.format,
            aspect: desc.aspect,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
        });
        match view {
            Ok(view) => Ok(NativeImage { handle, view }),
            Err(e) => {
                self.allocator.destroy_image(handle);
                Err(e)
            }
        }
    }

    fn destroy_image(&self, image: NativeImage) {
        self.destroy_image_view(image.view);
        self.allocator.destroy_image(image.handle);
    }

    fn create_image_view(&self, desc: &NativeImageViewDesc) -> GfxResult<vk::ImageView> {
        let view_ci = vk::ImageViewCreateInfo::default()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: desc.mip_levels,
                base_array_layer: 0,
                layer_count: desc.array_layers,
            });
        let view = unsafe { self.device.create_image_view(&view_ci, None)? };
        self.set_debug_name(view, &format!("ImageView::{}", desc.name));
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&self, info: &SamplerInfo) -> GfxResult<vk::Sampler> {
        let sampler = unsafe { self.device.create_sampler(&info.to_vk(), None)? };
        self.set_debug_name(sampler, &format!("Sampler::{}", info.name));
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_shader_module(&self, name: &str, code: &[u32]) -> GfxResult<vk::ShaderModule> {
        let module_ci = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { self.device.create_shader_module(&module_ci, None)? };
        self.set_debug_name(module, &format!("ShaderModule::{name}"));
        Ok(module)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline(&self, desc: &NativePipelineDesc) -> GfxResult<NativePipeline> {
        let (handle, layout) = pipeline::create_pipeline(&self.device, desc)?;
        self.set_debug_name(handle, &format!("Pipeline::{}", desc.name));
        self.set_debug_name(layout, &format!("PipelineLayout::{}", desc.name));
        Ok(NativePipeline { handle, layout })
    }

    fn destroy_pipeline(&self, pipeline: NativePipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline.handle, None);
            self.device.destroy_pipeline_layout(pipeline.layout, None);
        }
    }

    fn create_command_pool(&self, name: &str) -> GfxResult<vk::CommandPool> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.pdevice.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { self.device.create_command_pool(&pool_ci, None)? };
        self.set_debug_name(pool, &format!("CommandPool::{name}"));
        Ok(pool)
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GfxResult<()> {
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty())? };
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, name: &str) -> GfxResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info)? }
            .into_iter()
            .next()
            .ok_or(GfxError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        self.set_debug_name(command_buffer, &format!("CommandBuffer::{name}"));
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        // 同一份录制内容允许多次提交，因此不使用 ONE_TIME_SUBMIT
        unsafe { self.device.begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default())? };
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer)? };
        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GfxResult<()> {
        unsafe { self.device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())? };
        Ok(())
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &NativeCommand) {
        commands::record(&self.device, self.debug_utils.as_ref(), command_buffer, command);
    }

    fn create_timeline_semaphore(&self, name: &str, initial_value: u64) -> GfxResult<vk::Semaphore> {
        let mut timeline_ci = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_ci);
        let semaphore = unsafe { self.device.create_semaphore(&semaphore_ci, None)? };
        self.set_debug_name(semaphore, &format!("Fence::{name}"));
        Ok(semaphore)
    }

    fn create_binary_semaphore(&self, name: &str) -> GfxResult<vk::Semaphore> {
        let semaphore = unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
        self.set_debug_name(semaphore, &format!("Semaphore::{name}"));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn timeline_value(&self, semaphore: vk::Semaphore) -> GfxResult<u64> {
        Ok(unsafe { self.device.get_semaphore_counter_value(semaphore)? })
    }

    fn signal_timeline(&self, semaphore: vk::Semaphore, value: u64) -> GfxResult<()> {
        let signal_info = vk::SemaphoreSignalInfo::default().semaphore(semaphore).value(value);
        unsafe { self.device.signal_semaphore(&signal_info)? };
        Ok(())
    }

    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> GfxResult<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default().semaphores(&semaphores).values(&values);
        match unsafe { self.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn submit(&self, submit: &NativeSubmit) -> GfxResult<()> {
        let _span = tracy_client::span!("VulkanBackend::submit");

        let command_buffer_infos = submit
            .command_buffers
            .iter()
            .map(|cb| vk::CommandBufferSubmitInfo::default().command_buffer(*cb))
            .collect_vec();
        let to_vk = |s: &crate::backend::SemaphoreSubmit| {
            vk::SemaphoreSubmitInfo::default().semaphore(s.semaphore).value(s.value).stage_mask(s.stage)
        };
        let wait_infos = submit.waits.iter().map(to_vk).collect_vec();
        let signal_infos = submit.signals.iter().map(to_vk).collect_vec();

        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&command_buffer_infos)
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos);

        let queue = self.queue();
        unsafe { self.device.queue_submit2(*queue, std::slice::from_ref(&submit_info), vk::Fence::null())? };
        Ok(())
    }

    fn wait_idle(&self) -> GfxResult<()> {
        let queue = self.queue();
        unsafe { self.device.queue_wait_idle(*queue)? };
        Ok(())
    }

    fn create_surface(&self, window: Option<(RawDisplayHandle, RawWindowHandle)>) -> GfxResult<vk::SurfaceKHR> {
        let Some((display, window)) = window else {
            return Err(GfxError::SurfaceUnsupported("vulkan backend needs a window to create surface".to_string()));
        };
        if self.swapchain_loader.is_none() {
            return Err(GfxError::SurfaceUnsupported(
                "device is created without display handle, swapchain is disabled".to_string(),
            ));
        }

        let surface = unsafe {
            ash_window::create_surface(&self.instance.entry, &self.instance.instance, display, window, None)?
        };

        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.pdevice.handle,
                self.pdevice.queue_family_index,
                surface,
            )
        };
        match supported {
            Ok(true) => Ok(surface),
            Ok(false) => {
                self.destroy_surface(surface);
                Err(GfxError::SurfaceUnsupported(format!(
                    "queue family {} can not present to the surface",
                    self.pdevice.queue_family_index
                )))
            }
            Err(e) => {
                self.destroy_surface(surface);
                Err(e.into())
            }
        }
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }

    fn create_swapchain(&self, desc: &NativeSwapchainDesc) -> GfxResult<NativeSwapchain> {
        let swapchain_loader = self.swapchain_loader()?;
        let swapchain = presentation::create_swapchain(&self.surface_loader, swapchain_loader, self.pdevice.handle, desc)?;
        self.set_debug_name(swapchain.handle, &format!("Swapchain::{}", desc.name));
        for (idx, image) in swapchain.images.iter().enumerate() {
            self.set_debug_name(*image, &format!("Image::{}-{}", desc.name, idx));
        }
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Ok(loader) = self.swapchain_loader() {
            unsafe { loader.destroy_swapchain(swapchain, None) };
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<(u32, bool), vk::Result> {
        let loader = self.swapchain_loader()?;
        unsafe { loader.acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null()) }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool, vk::Result> {
        let loader = self.swapchain_loader()?;
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.queue();
        unsafe { loader.queue_present(*queue, &present_info) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_view_type() {
        assert_eq!(VulkanBackend::default_view_type(vk::ImageType::TYPE_1D, 1), vk::ImageViewType::TYPE_1D);
        assert_eq!(VulkanBackend::default_view_type(vk::ImageType::TYPE_1D, 4), vk::ImageViewType::TYPE_1D_ARRAY);
        assert_eq!(VulkanBackend::default_view_type(vk::ImageType::TYPE_2D, 1), vk::ImageViewType::TYPE_2D);
        assert_eq!(VulkanBackend::default_view_type(vk::ImageType::TYPE_2D, 6), vk::ImageViewType::TYPE_2D_ARRAY);
        assert_eq!(VulkanBackend::default_view_type(vk::ImageType::TYPE_3D, 1), vk::ImageViewType::TYPE_3D);
    }
}
