use ash::vk;

use crate::backend::{NativeSwapchain, NativeSwapchainDesc};
use crate::error::{GfxError, GfxResult};

/// surface 的 current extent 为 0xFFFFFFFF 时由 swapchain 决定尺寸，此时使用窗口尺寸
pub(crate) fn calculate_swapchain_extent(
    surface_capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    let surface_extent = surface_capabilities.current_extent;
    if surface_extent.width == 0xFFFFFFFF || surface_extent.height == 0xFFFFFFFF {
        let width = window_extent
            .width
            .clamp(surface_capabilities.min_image_extent.width, surface_capabilities.max_image_extent.width);
        let height = window_extent
            .height
            .clamp(surface_capabilities.min_image_extent.height, surface_capabilities.max_image_extent.height);
        vk::Extent2D { width, height }
    } else {
        surface_extent
    }
}

/// 优先使用 B8G8R8A8 + SRGB_NONLINEAR
pub(crate) fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    const PREFERRED: [vk::Format; 2] = [vk::Format::B8G8R8A8_UNORM, vk::Format::B8G8R8A8_SRGB];
    PREFERRED
        .iter()
        .find_map(|format| {
            formats
                .iter()
                .find(|f| f.format == *format && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
                .copied()
        })
        .or_else(|| formats.first().copied())
}

/// 不支持时退回 FIFO，FIFO 是所有实现都必须支持的
pub(crate) fn choose_present_mode(supported: &[vk::PresentModeKHR], requested: vk::PresentModeKHR) -> vk::PresentModeKHR {
    if supported.contains(&requested) {
        requested
    } else {
        log::warn!("present mode {:?} is not supported, fallback to FIFO", requested);
        vk::PresentModeKHR::FIFO
    }
}

/// image 数量不能小于 min，max 为 0 表示没有上限
pub(crate) fn clamp_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

pub(crate) fn create_swapchain(
    surface_loader: &ash::khr::surface::Instance,
    swapchain_loader: &ash::khr::swapchain::Device,
    pdevice: vk::PhysicalDevice,
    desc: &NativeSwapchainDesc,
) -> GfxResult<NativeSwapchain> {
    let (capabilities, formats, present_modes) = unsafe {
        (
            surface_loader.get_physical_device_surface_capabilities(pdevice, desc.surface)?,
            surface_loader.get_physical_device_surface_formats(pdevice, desc.surface)?,
            surface_loader.get_physical_device_surface_present_modes(pdevice, desc.surface)?,
        )
    };

    let surface_format = choose_surface_format(&formats)
        .ok_or_else(|| GfxError::SurfaceUnsupported(format!("swapchain `{}`: no surface format", desc.name)))?;
    let present_mode = choose_present_mode(&present_modes, desc.present_mode);
    let extent = calculate_swapchain_extent(&capabilities, desc.extent);
    // 窗口最小化时无法创建 swapchain
    if extent.width == 0 || extent.height == 0 {
        return Err(GfxError::OutOfDate);
    }
    let image_count = clamp_image_count(&capabilities, desc.min_image_count);

    log::info!(
        "create swapchain `{}`:
        surface current extent: {}x{}, min extent: {}x{}, max extent: {}x{}
        window extent: {}x{}
        final swapchain extent: {}x{}, image count: {}, format: {:?}, present mode: {:?}",
        desc.name,
        capabilities.current_extent.width,
        capabilities.current_extent.height,
        capabilities.min_image_extent.width,
        capabilities.min_image_extent.height,
        capabilities.max_image_extent.width,
        capabilities.max_image_extent.height,
        desc.extent.width,
        desc.extent.height,
        extent.width,
        extent.height,
        image_count,
        surface_format.format,
        present_mode,
    );

    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(desc.surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(desc.old_swapchain);

    let handle = unsafe { swapchain_loader.create_swapchain(&create_info, None)? };
    let images = match unsafe { swapchain_loader.get_swapchain_images(handle) } {
        Ok(images) => images,
        Err(e) => {
            unsafe { swapchain_loader.destroy_swapchain(handle, None) };
            return Err(e.into());
        }
    };

    Ok(NativeSwapchain {
        handle,
        images,
        format: surface_format.format,
        extent,
    })
}
