use ash::vk;

use crate::backend::GfxBackend;
use crate::error::GfxResult;
use crate::foundation::device::Device;
use crate::resources::arena::{ResourceArena, ResourceArenas};
use crate::resources::resource::{DeviceResource, RefCountedDeviceResource, Resource, ResourceKind};

/// binary semaphore，只用于 GPU 与 GPU 之间的同步（例如 swapchain 的 acquire / present）
///
/// CPU 与 GPU 之间的同步使用 timeline 的 [`Fence`](crate::commands::fence::Fence)
pub struct Semaphore {
    base: RefCountedDeviceResource,
    handle: vk::Semaphore,
    name: String,
}

impl DeviceResource for Semaphore {
    const KIND: ResourceKind = ResourceKind::Semaphore;

    fn base(&self) -> &RefCountedDeviceResource {
        &self.base
    }

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self> {
        &arenas.semaphores
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn destroy_native(&self, backend: &dyn GfxBackend) {
        backend.destroy_semaphore(self.handle);
    }
}

impl Semaphore {
    pub fn create(device: &Device, name: impl Into<String>) -> GfxResult<Resource<Self>> {
        let name = name.into();
        let handle = device.backend().create_binary_semaphore(&name)?;
        Ok(device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle,
            name,
        }))
    }

    /// 创建失败时返回 null handle
    pub fn from(device: &Device, name: impl Into<String>) -> Resource<Self> {
        let name = name.into();
        Self::create(device, name.as_str()).unwrap_or_else(|e| {
            log::error!("failed to create semaphore `{}`: {}", name, e);
            Resource::null()
        })
    }

    #[inline]
    pub fn native(&self) -> vk::Semaphore {
        self.handle
    }
}
