use ash::vk;

use crate::backend::{GfxBackend, NativeImage, NativeImageDesc};
use crate::commands::barrier::{BarrierMask, ImageBarrier};
use crate::error::{GfxError, GfxResult};
use crate::foundation::device::Device;
use crate::resources::arena::{ResourceArena, ResourceArenas};
use crate::resources::buffer::{Buffer, BufferInfo};
use crate::resources::resource::{DeviceResource, RefCountedDeviceResource, Resource, ResourceKind};

/// Vulkan 格式相关的工具
pub struct FormatUtils;
impl FormatUtils {
    /// 每个像素需要的字节数，压缩格式以及不常用的格式返回 None
    pub fn pixel_size_in_bytes(format: vk::Format) -> Option<usize> {
        // 根据 vulkan specification 得到的 format 顺序
        const BYTE_1_FORMAT: [(vk::Format, vk::Format); 1] = [(vk::Format::R8_UNORM, vk::Format::R8G8_UNORM)];
        const BYTE_2_FORMAT: [(vk::Format, vk::Format); 2] = [
            (vk::Format::R8G8_UNORM, vk::Format::R8G8B8_UNORM),
            (vk::Format::R16_UNORM, vk::Format::R16G16_UNORM),
        ];
        const BYTE_3_FORMAT: [(vk::Format, vk::Format); 1] = [(vk::Format::R8G8B8_UNORM, vk::Format::R8G8B8A8_UNORM)];
        const BYTE_4_FORMAT: [(vk::Format, vk::Format); 3] = [
            (vk::Format::R8G8B8A8_UNORM, vk::Format::A2R10G10B10_UNORM_PACK32),
            (vk::Format::R16G16_UNORM, vk::Format::R16G16B16_UNORM),
            (vk::Format::R32_UINT, vk::Format::R32G32_UINT),
        ];
        const BYTE_8_FORMAT: [(vk::Format, vk::Format); 2] = [
            (vk::Format::R16G16B16A16_UNORM, vk::Format::R32_UINT),
            (vk::Format::R32G32_UINT, vk::Format::R32G32B32_UINT),
        ];
        const BYTE_16_FORMAT: [(vk::Format, vk::Format); 1] =
            [(vk::Format::R32G32B32A32_UINT, vk::Format::R64_UINT)];

        let is_in_format_region = |format: vk::Format, regions: &[(vk::Format, vk::Format)]| {
            let n = format.as_raw();
            regions.iter().any(|(begin, end)| begin.as_raw() <= n && n < end.as_raw())
        };

        match format {
            f if is_in_format_region(f, &BYTE_1_FORMAT) => Some(1),
            f if is_in_format_region(f, &BYTE_2_FORMAT) => Some(2),
            f if is_in_format_region(f, &BYTE_3_FORMAT) => Some(3),
            f if is_in_format_region(f, &BYTE_4_FORMAT) => Some(4),
            f if is_in_format_region(f, &BYTE_8_FORMAT) => Some(8),
            f if is_in_format_region(f, &BYTE_16_FORMAT) => Some(16),
            vk::Format::D16_UNORM => Some(2),
            vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => Some(4),
            _ => None,
        }
    }

    /// 根据 format 推断 image 的 aspect
    pub fn aspect(format: vk::Format) -> vk::ImageAspectFlags {
        match format {
            vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
                vk::ImageAspectFlags::DEPTH
            }
            vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
            vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            }
            _ => vk::ImageAspectFlags::COLOR,
        }
    }
}

pub struct ImageInfo<'a> {
    pub name: String,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    /// mip 0 所有 layer 的数据，紧密排列
    pub data: Option<&'a [u8]>,
}

impl<'a> ImageInfo<'a> {
    pub fn new(
        name: impl Into<String>,
        image_type: vk::ImageType,
        format: vk::Format,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self {
            name: name.into(),
            image_type,
            format,
            extent,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            usage,
            data: None,
        }
    }

    #[inline]
    pub fn new_1d(name: impl Into<String>, format: vk::Format, width: u32, usage: vk::ImageUsageFlags) -> Self {
        let extent = vk::Extent3D {
            width,
            height: 1,
            depth: 1,
        };
        Self::new(name, vk::ImageType::TYPE_1D, format, extent, usage)
    }

    #[inline]
    pub fn new_2d(
        name: impl Into<String>,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self::new(name, vk::ImageType::TYPE_2D, format, extent.into(), usage)
    }

    #[inline]
    pub fn new_3d(
        name: impl Into<String>,
        format: vk::Format,
        extent: vk::Extent3D,
        usage: vk::ImageUsageFlags,
    ) -> Self {
        Self::new(name, vk::ImageType::TYPE_3D, format, extent, usage)
    }

    /// builder
    #[inline]
    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// builder
    #[inline]
    pub fn array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    /// builder
    #[inline]
    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    /// builder
    #[inline]
    pub fn data(mut self, data: &'a [u8]) -> Self {
        self.data = Some(data);
        self
    }
}

/// Image 来源
enum ImageSource {
    /// 由 backend 分配内存，默认 view 也由 image 管理
    Allocated,
    /// 外部 Image（例如 Swapchain Image），image 和 view 都由所有者销毁
    External,
}

pub struct Image {
    base: RefCountedDeviceResource,
    handle: vk::Image,
    view: vk::ImageView,
    source: ImageSource,

    extent: vk::Extent3D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
    array_layers: u32,

    name: String,
}

impl DeviceResource for Image {
    const KIND: ResourceKind = ResourceKind::Image;

    fn base(&self) -> &RefCountedDeviceResource {
        &self.base
    }

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self> {
        &arenas.images
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn destroy_native(&self, backend: &dyn GfxBackend) {
        match self.source {
            ImageSource::External => (),
            ImageSource::Allocated => backend.destroy_image(NativeImage {
                handle: self.handle,
                view: self.view,
            }),
        }
    }
}

// new & init
impl Image {
    /// 带有初始数据时会通过 staging buffer 上传，上传之后 layout 为 SHADER_READ_ONLY_OPTIMAL
    pub fn create(device: &Device, info: ImageInfo) -> GfxResult<Resource<Self>> {
        let _span = tracy_client::span!("Image::create");
        let extent = info.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 || info.mip_levels == 0 || info.array_layers == 0
        {
            return Err(GfxError::InvalidArgument(format!("image `{}` has an empty extent", info.name)));
        }

        let mut usage = info.usage;
        if let Some(data) = info.data {
            let expected = Self::upload_size(info.format, extent, info.array_layers)
                .ok_or_else(|| GfxError::InvalidArgument(format!("cannot upload to image format {:?}", info.format)))?;
            if data.len() != expected {
                return Err(GfxError::InvalidArgument(format!(
                    "image `{}` expects {} bytes of data, got {}",
                    info.name,
                    expected,
                    data.len()
                )));
            }
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }

        let aspect = FormatUtils::aspect(info.format);
        let native = device.backend().create_image(&NativeImageDesc {
            name: &info.name,
            image_type: info.image_type,
            format: info.format,
            extent,
            mip_levels: info.mip_levels,
            array_layers: info.array_layers,
            samples: info.samples,
            usage,
            aspect,
        })?;

        let image = device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle: native.handle,
            view: native.view,
            source: ImageSource::Allocated,
            extent,
            format: info.format,
            usage,
            aspect,
            mip_levels: info.mip_levels,
            array_layers: info.array_layers,
            name: info.name,
        });

        if let Some(data) = info.data {
            Self::upload(device, &image, data)?;
        }
        Ok(image)
    }

    /// 创建失败时返回 null handle
    pub fn from(device: &Device, info: ImageInfo) -> Resource<Self> {
        let name = info.name.clone();
        Self::create(device, info).unwrap_or_else(|e| {
            log::error!("failed to create image `{}`: {}", name, e);
            Resource::null()
        })
    }

    /// 包装一个外部的 image，销毁时不会释放原生对象
    pub(crate) fn from_external(
        device: &Device,
        handle: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        name: String,
    ) -> Resource<Self> {
        device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle,
            view,
            source: ImageSource::External,
            extent: extent.into(),
            format,
            usage,
            aspect: FormatUtils::aspect(format),
            mip_levels: 1,
            array_layers: 1,
            name,
        })
    }

    fn upload_size(format: vk::Format, extent: vk::Extent3D, array_layers: u32) -> Option<usize> {
        let pixel_size = FormatUtils::pixel_size_in_bytes(format)?;
        let texels = extent.width as usize * extent.height as usize * extent.depth as usize;
        Some(pixel_size * texels * array_layers as usize)
    }
}

// getter
impl Image {
    #[inline]
    pub fn native(&self) -> vk::Image {
        self.handle
    }

    /// 默认的 view，覆盖所有的 mip 和 layer
    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    #[inline]
    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self.source, ImageSource::External)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// tools
impl Image {
    /// # 实现步骤
    /// 1. 创建一个 staging buffer，将数据复制到 staging buffer
    /// 2. 进行图像布局转换
    /// 3. 将 staging buffer 的数据复制到图像的 mip 0
    /// 4. 进行图像布局转换，让 shader 可读
    ///
    /// 同步等待传输完成
    pub fn upload(device: &Device, image: &Resource<Image>, data: &[u8]) -> GfxResult<()> {
        let target = image.try_get()?;
        let stage = Buffer::create(
            device,
            BufferInfo::new_stage(format!("{}-stage-buffer", target.name), data.len() as vk::DeviceSize).data(data),
        )?;

        device.one_time_exec(&format!("{}-transfer-data", target.name), |cmd| {
            cmd.image_barrier(
                image,
                ImageBarrier::new()
                    .src_mask(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::empty())
                    .dst_mask(vk::PipelineStageFlags2::TRANSFER, vk::AccessFlags2::TRANSFER_WRITE)
                    .layout_transfer(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            )?;

            let region = vk::BufferImageCopy::default()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(target.extent)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: target.aspect,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: target.array_layers,
                });
            cmd.copy_buffer_to_image(&stage, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region])?;

            cmd.image_barrier(
                image,
                ImageBarrier::new()
                    .mask(BarrierMask::TRANSFER_TO_SHADER_READ)
                    .layout_transfer(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, NativeObjectKind};
    use crate::config::GfxConfig;

    fn device() -> (Device, HeadlessBackend) {
        vigil_crate_tools::init_log::init_test_log();
        let backend = HeadlessBackend::new();
        let device = Device::new_headless(GfxConfig::default(), backend.clone()).unwrap();
        (device, backend)
    }

    #[test]
    fn test_aspect_from_format() {
        assert_eq!(FormatUtils::aspect(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
        assert_eq!(FormatUtils::aspect(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            FormatUtils::aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn test_pixel_size() {
        assert_eq!(FormatUtils::pixel_size_in_bytes(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(FormatUtils::pixel_size_in_bytes(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(FormatUtils::pixel_size_in_bytes(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(FormatUtils::pixel_size_in_bytes(vk::Format::BC7_UNORM_BLOCK), None);
    }

    #[test]
    fn test_create_and_destroy() {
        let (device, backend) = device();
        let depth = Image::from(
            &device,
            ImageInfo::new_2d(
                "depth",
                vk::Format::D32_SFLOAT,
                vk::Extent2D { width: 8, height: 8 },
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ),
        );
        assert_eq!(depth.aspect(), vk::ImageAspectFlags::DEPTH);
        assert_eq!(backend.live_count(NativeObjectKind::Image), 1);
        assert_eq!(backend.live_count(NativeObjectKind::ImageView), 1);

        drop(depth);
        device.clear_garbage();
        assert_eq!(backend.live_count(NativeObjectKind::Image), 0);
        assert_eq!(backend.live_count(NativeObjectKind::ImageView), 0);
    }

    #[test]
    fn test_upload_through_stage_buffer() {
        let (device, backend) = device();
        let pixels = vec![0xffu8; 4 * 4 * 4];
        let texture = Image::from(
            &device,
            ImageInfo::new_2d(
                "texture",
                vk::Format::R8G8B8A8_UNORM,
                vk::Extent2D { width: 4, height: 4 },
                vk::ImageUsageFlags::SAMPLED,
            )
            .data(&pixels),
        );

        assert!(texture.valid());
        assert!(texture.usage().contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert_eq!(backend.submit_count(), 1);

        device.clear_garbage();
        assert_eq!(backend.live_count(NativeObjectKind::Buffer), 0);
        assert_eq!(backend.live_count(NativeObjectKind::CommandBuffer), 0);
    }

    #[test]
    fn test_upload_with_wrong_size_fails() {
        let (device, backend) = device();
        let pixels = [0u8; 7];
        let texture = Image::from(
            &device,
            ImageInfo::new_2d(
                "texture",
                vk::Format::R8G8B8A8_UNORM,
                vk::Extent2D { width: 4, height: 4 },
                vk::ImageUsageFlags::SAMPLED,
            )
            .data(&pixels),
        );

        assert!(!texture.valid());
        assert_eq!(backend.live_count(NativeObjectKind::Image), 0);
    }

    #[test]
    fn test_external_image_is_not_destroyed() {
        let (device, backend) = device();
        let image = Image::from_external(
            &device,
            vk::Image::null(),
            vk::ImageView::null(),
            vk::Format::B8G8R8A8_UNORM,
            vk::Extent2D { width: 2, height: 2 },
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
            "external".to_string(),
        );
        assert!(image.is_external());

        drop(image);
        assert_eq!(device.clear_garbage(), 1);
        assert_eq!(backend.total_live_count(), backend.live_count(NativeObjectKind::Semaphore));
    }
}
