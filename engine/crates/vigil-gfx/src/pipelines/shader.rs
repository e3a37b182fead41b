use std::ffi::{CStr, CString};

use ash::vk;

use crate::backend::GfxBackend;
use crate::error::{GfxError, GfxResult};
use crate::foundation::device::Device;
use crate::resources::arena::{ResourceArena, ResourceArenas};
use crate::resources::resource::{DeviceResource, RefCountedDeviceResource, Resource, ResourceKind};

const SPIRV_MAGIC: u32 = 0x0723_0203;

pub struct ShaderInfo<'a> {
    pub name: String,
    /// SPIR-V 字节码
    pub code: &'a [u8],
    pub stage: vk::ShaderStageFlags,
    pub entry_point: CString,
}

impl<'a> ShaderInfo<'a> {
    /// 入口函数默认为 `main`
    pub fn new(name: impl Into<String>, code: &'a [u8], stage: vk::ShaderStageFlags) -> Self {
        Self {
            name: name.into(),
            code,
            stage,
            entry_point: c"main".to_owned(),
        }
    }

    /// builder
    #[inline]
    pub fn entry_point(mut self, entry_point: &CStr) -> Self {
        self.entry_point = entry_point.to_owned();
        self
    }
}

/// 将 SPIR-V 字节码转换为 u32 数组
///
/// 字节码不能为空，长度必须是 4 的倍数，并且以 SPIR-V 的 magic number 开头。
/// 大端序的字节码会被转换为小端序。
pub fn parse_spirv(code: &[u8]) -> GfxResult<Vec<u32>> {
    if code.is_empty() {
        return Err(GfxError::InvalidShaderCode("empty code".to_string()));
    }
    if code.len() % 4 != 0 {
        return Err(GfxError::InvalidShaderCode(format!("code size {} is not a multiple of 4", code.len())));
    }

    let mut words = code.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect::<Vec<_>>();
    match words[0] {
        SPIRV_MAGIC => {}
        magic if magic.swap_bytes() == SPIRV_MAGIC => words.iter_mut().for_each(|w| *w = w.swap_bytes()),
        magic => return Err(GfxError::InvalidShaderCode(format!("bad magic number {:#010x}", magic))),
    }
    Ok(words)
}

pub struct Shader {
    base: RefCountedDeviceResource,
    handle: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    entry_point: CString,
    name: String,
}

impl DeviceResource for Shader {
    const KIND: ResourceKind = ResourceKind::Shader;

    fn base(&self) -> &RefCountedDeviceResource {
        &self.base
    }

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self> {
        &arenas.shaders
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn destroy_native(&self, backend: &dyn GfxBackend) {
        backend.destroy_shader_module(self.handle);
    }
}

impl Shader {
    pub fn create(device: &Device, info: ShaderInfo) -> GfxResult<Resource<Self>> {
        let words = parse_spirv(info.code)?;
        let handle = device.backend().create_shader_module(&info.name, &words)?;
        Ok(device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle,
            stage: info.stage,
            entry_point: info.entry_point,
            name: info.name,
        }))
    }

    /// 创建失败时返回 null handle
    pub fn from(device: &Device, info: ShaderInfo) -> Resource<Self> {
        let name = info.name.clone();
        Self::create(device, info).unwrap_or_else(|e| {
            log::error!("failed to create shader `{}`: {}", name, e);
            Resource::null()
        })
    }

    #[inline]
    pub fn native(&self) -> vk::ShaderModule {
        self.handle
    }

    #[inline]
    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    #[inline]
    pub fn entry_point(&self) -> &CStr {
        &self.entry_point
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}
