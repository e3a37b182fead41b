use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slotmap::SlotMap;

use crate::commands::command_buffer::CommandBuffer;
use crate::commands::command_pool::CommandPool;
use crate::commands::fence::Fence;
use crate::commands::semaphore::Semaphore;
use crate::pipelines::pipeline::Pipeline;
use crate::pipelines::shader::Shader;
use crate::resources::buffer::Buffer;
use crate::resources::image::Image;
use crate::resources::resource::ResourceKey;
use crate::resources::sampler::Sampler;
use crate::swapchain::render_swapchain::Swapchain;

/// 同一类型对象的存储池
///
/// key 带有 generation，slot 被复用之后旧的 key 不会再命中
pub struct ResourceArena<T> {
    slots: Mutex<SlotMap<ResourceKey, Arc<T>>>,
}

impl<T> Default for ResourceArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(SlotMap::with_key()),
        }
    }

    #[inline]
    fn slots(&self) -> MutexGuard<'_, SlotMap<ResourceKey, Arc<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 优先复用空闲的 slot
    pub fn emplace(&self, value: T) -> (ResourceKey, Arc<T>) {
        let value = Arc::new(value);
        let key = self.slots().insert(value.clone());
        (key, value)
    }

    /// 过期的 key 返回 None
    pub fn erase(&self, key: ResourceKey) -> Option<Arc<T>> {
        self.slots().remove(key)
    }

    pub fn at(&self, key: ResourceKey) -> Option<Arc<T>> {
        self.slots().get(key).cloned()
    }

    #[inline]
    pub fn contains(&self, key: ResourceKey) -> bool {
        self.slots().contains_key(key)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// 取出所有的对象，只在 Device 销毁时使用
    pub fn drain(&self) -> Vec<(ResourceKey, Arc<T>)> {
        self.slots().drain().collect()
    }
}

/// 每种 GPU 对象一个 arena
#[derive(Default)]
pub struct ResourceArenas {
    pub(crate) buffers: ResourceArena<Buffer>,
    pub(crate) images: ResourceArena<Image>,
    pub(crate) samplers: ResourceArena<Sampler>,
    pub(crate) shaders: ResourceArena<Shader>,
    pub(crate) pipelines: ResourceArena<Pipeline>,
    pub(crate) swapchains: ResourceArena<Swapchain>,
    pub(crate) command_pools: ResourceArena<CommandPool>,
    pub(crate) command_buffers: ResourceArena<CommandBuffer>,
    pub(crate) semaphores: ResourceArena<Semaphore>,
    pub(crate) fences: ResourceArena<Fence>,
}

impl ResourceArenas {
    pub fn total_len(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.samplers.len()
            + self.shaders.len()
            + self.pipelines.len()
            + self.swapchains.len()
            + self.command_pools.len()
            + self.command_buffers.len()
            + self.semaphores.len()
            + self.fences.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emplace_and_at() {
        let arena = ResourceArena::new();
        let (key, value) = arena.emplace(42u32);

        assert_eq!(*value, 42);
        assert_eq!(arena.at(key).as_deref(), Some(&42));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_erase_twice_returns_none() {
        let arena = ResourceArena::new();
        let (key, _) = arena.emplace("a");

        assert!(arena.erase(key).is_some());
        assert!(arena.erase(key).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_stale_key_after_slot_reuse() {
        let arena = ResourceArena::new();
        let (old_key, _) = arena.emplace(1);
        arena.erase(old_key);

        let (new_key, _) = arena.emplace(2);
        assert_ne!(old_key, new_key);
        assert!(arena.at(old_key).is_none());
        assert!(arena.erase(old_key).is_none());
        assert_eq!(arena.at(new_key).as_deref(), Some(&2));
    }

    #[test]
    fn test_drain() {
        let arena = ResourceArena::new();
        for i in 0..5 {
            arena.emplace(i);
        }
        let mut values = arena.drain().into_iter().map(|(_, v)| *v).collect::<Vec<_>>();
        values.sort();

        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert!(arena.is_empty());
    }
}
