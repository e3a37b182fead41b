use ash::vk;

use crate::backend::GfxBackend;
use crate::error::GfxResult;
use crate::foundation::device::Device;
use crate::resources::arena::{ResourceArena, ResourceArenas};
use crate::resources::resource::{DeviceResource, RefCountedDeviceResource, Resource, ResourceKind};

/// sampler 的描述，默认为线性过滤、repeat
#[derive(Clone, Debug)]
pub struct SamplerInfo {
    pub name: String,
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    /// 0 表示不开启各向异性过滤
    pub max_anisotropy: u32,
    pub compare_op: Option<vk::CompareOp>,
}

impl SamplerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            max_anisotropy: 0,
            compare_op: None,
        }
    }

    /// builder
    #[inline]
    pub fn filter(mut self, mag_filter: vk::Filter, min_filter: vk::Filter) -> Self {
        self.mag_filter = mag_filter;
        self.min_filter = min_filter;
        self
    }

    /// builder
    #[inline]
    pub fn mipmap_mode(mut self, mipmap_mode: vk::SamplerMipmapMode) -> Self {
        self.mipmap_mode = mipmap_mode;
        self
    }

    /// builder，三个方向使用相同的 address mode
    #[inline]
    pub fn address_mode(mut self, mode: vk::SamplerAddressMode) -> Self {
        self.address_mode_u = mode;
        self.address_mode_v = mode;
        self.address_mode_w = mode;
        self
    }

    /// builder
    #[inline]
    pub fn anisotropy(mut self, max_anisotropy: u32) -> Self {
        self.max_anisotropy = max_anisotropy;
        self
    }

    /// builder
    #[inline]
    pub fn compare_op(mut self, compare_op: vk::CompareOp) -> Self {
        self.compare_op = Some(compare_op);
        self
    }

    pub fn to_vk(&self) -> vk::SamplerCreateInfo<'static> {
        let mut create_info = vk::SamplerCreateInfo::default()
            .mag_filter(self.mag_filter)
            .min_filter(self.min_filter)
            .address_mode_u(self.address_mode_u)
            .address_mode_v(self.address_mode_v)
            .address_mode_w(self.address_mode_w)
            .mipmap_mode(self.mipmap_mode)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

        if self.max_anisotropy > 0 {
            create_info = create_info.anisotropy_enable(true).max_anisotropy(self.max_anisotropy as f32);
        }
        if let Some(compare_op) = self.compare_op {
            create_info = create_info.compare_enable(true).compare_op(compare_op);
        }
        create_info
    }
}

pub struct Sampler {
    base: RefCountedDeviceResource,
    handle: vk::Sampler,
    name: String,
}

impl DeviceResource for Sampler {
    const KIND: ResourceKind = ResourceKind::Sampler;

    fn base(&self) -> &RefCountedDeviceResource {
        &self.base
    }

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self> {
        &arenas.samplers
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn destroy_native(&self, backend: &dyn GfxBackend) {
        backend.destroy_sampler(self.handle);
    }
}

impl Sampler {
    pub fn create(device: &Device, info: SamplerInfo) -> GfxResult<Resource<Self>> {
        let handle = device.backend().create_sampler(&info)?;
        Ok(device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle,
            name: info.name,
        }))
    }

    /// 创建失败时返回 null handle
    pub fn from(device: &Device, info: SamplerInfo) -> Resource<Self> {
        let name = info.name.clone();
        Self::create(device, info).unwrap_or_else(|e| {
            log::error!("failed to create sampler `{}`: {}", name, e);
            Resource::null()
        })
    }

    #[inline]
    pub fn native(&self) -> vk::Sampler {
        self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}
