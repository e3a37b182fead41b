use std::sync::{Arc, Mutex, PoisonError, Weak};

use ash::vk;

use crate::backend::GfxBackend;
use crate::commands::command_buffer::CommandBuffer;
use crate::error::GfxResult;
use crate::foundation::device::Device;
use crate::resources::arena::{ResourceArena, ResourceArenas};
use crate::resources::resource::{DeviceResource, RefCountedDeviceResource, Resource, ResourceKind};

pub struct CommandPoolInfo {
    pub name: String,
}

impl CommandPoolInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// 命令缓冲的分配池，只使用 graphics queue family
///
/// 每个从池中分配的命令缓冲都持有池的 handle，因此池总是最后被销毁
pub struct CommandPool {
    base: RefCountedDeviceResource,
    handle: vk::CommandPool,
    name: String,

    /// 从该池分配的命令缓冲，用于 reset 整个池
    buffers: Mutex<Vec<Weak<CommandBuffer>>>,
}

impl DeviceResource for CommandPool {
    const KIND: ResourceKind = ResourceKind::CommandPool;

    fn base(&self) -> &RefCountedDeviceResource {
        &self.base
    }

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self> {
        &arenas.command_pools
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn destroy_native(&self, backend: &dyn GfxBackend) {
        backend.destroy_command_pool(self.handle);
    }
}

// 创建
impl CommandPool {
    pub fn create(device: &Device, info: CommandPoolInfo) -> GfxResult<Resource<Self>> {
        let handle = device.backend().create_command_pool(&info.name)?;
        Ok(device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle,
            name: info.name,
            buffers: Mutex::new(Vec::new()),
        }))
    }

    /// 创建失败时返回 null handle
    pub fn from(device: &Device, info: CommandPoolInfo) -> Resource<Self> {
        let name = info.name.clone();
        Self::create(device, info).unwrap_or_else(|e| {
            log::error!("failed to create command pool `{}`: {}", name, e);
            Resource::null()
        })
    }
}

// getters
impl CommandPool {
    #[inline]
    pub fn native(&self) -> vk::CommandPool {
        self.handle
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// tools
impl CommandPool {
    pub(crate) fn register(&self, command_buffer: Weak<CommandBuffer>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.retain(|cb| cb.strong_count() > 0);
        buffers.push(command_buffer);
    }

    fn live_buffers(&self) -> Vec<Arc<CommandBuffer>> {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.retain(|cb| cb.strong_count() > 0);
        buffers.iter().filter_map(Weak::upgrade).collect()
    }

    /// 将池中所有的命令缓冲重置为 Initial
    ///
    /// 只要有一个命令缓冲仍在 GPU 上执行，就不会重置任何内容
    pub fn reset(&self) -> GfxResult<()> {
        let buffers = self.live_buffers();
        for cmd in &buffers {
            cmd.ensure_not_pending()?;
        }

        self.base.backend().reset_command_pool(self.handle)?;
        for cmd in &buffers {
            cmd.on_pool_reset();
        }
        log::trace!("command pool `{}` reset {} command buffers", self.name, buffers.len());
        Ok(())
    }
}
