//! 引用计数的资源句柄
//!
//! 每个 GPU 对象内部都嵌入一个 [`RefCountedDeviceResource`]，[`Resource<T>`] 的 clone / drop
//! 会原子地修改这个计数。计数归零时对象不会立刻销毁，而是进入 Device 的 zombie 队列。

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU32, Ordering, fence};

use slotmap::Key;

use crate::backend::GfxBackend;
use crate::error::{GfxError, GfxResult};
use crate::foundation::device::{Device, DeviceShared};
use crate::resources::arena::{ResourceArena, ResourceArenas};

slotmap::new_key_type! {
    /// arena 中的 (index, generation)
    pub struct ResourceKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
    Sampler,
    Shader,
    Pipeline,
    Swapchain,
    CommandPool,
    CommandBuffer,
    Semaphore,
    Fence,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 10] = [
        ResourceKind::Buffer,
        ResourceKind::Image,
        ResourceKind::Sampler,
        ResourceKind::Shader,
        ResourceKind::Pipeline,
        ResourceKind::Swapchain,
        ResourceKind::CommandPool,
        ResourceKind::CommandBuffer,
        ResourceKind::Semaphore,
        ResourceKind::Fence,
    ];
}

/// 所有 GPU 对象共有的部分：引用计数以及所属的 device
pub struct RefCountedDeviceResource {
    ref_count: AtomicU32,
    device: Arc<DeviceShared>,
}

impl RefCountedDeviceResource {
    /// 创建时计数为 1，对应 factory 返回的那个 handle
    pub(crate) fn new(device: &Device) -> Self {
        Self {
            ref_count: AtomicU32::new(1),
            device: device.shared().clone(),
        }
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn device(&self) -> &DeviceShared {
        &self.device
    }

    #[inline]
    pub(crate) fn backend(&self) -> &dyn GfxBackend {
        self.device.backend()
    }

    #[inline]
    fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 只有计数不为 0 时才增加，用于从 key 重新得到 handle
    fn try_retain(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.ref_count.compare_exchange_weak(current, current + 1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// 返回是否释放了最后一个引用
    fn release(&self) -> bool {
        if self.ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return false;
        }
        fence(Ordering::Acquire);
        true
    }
}

/// 由 Device 管理生命周期的 GPU 对象
pub trait DeviceResource: Send + Sync + Sized + 'static {
    const KIND: ResourceKind;

    fn base(&self) -> &RefCountedDeviceResource;

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self>;

    fn debug_name(&self) -> &str;

    /// 销毁原生对象
    ///
    /// 只会在 zombie 被回收时调用一次，此时 GPU 已经不再使用该对象
    fn destroy_native(&self, backend: &dyn GfxBackend);
}

/// 引用计数的资源句柄
///
/// - `Clone` 增加计数，`Drop` 减少计数
/// - 最后一个 handle 被 drop 时，对象带着当前的 CPU timeline 进入 zombie 队列
/// - 创建失败时 factory 返回 null handle，使用前需要检查 [`Resource::valid`]
pub struct Resource<T: DeviceResource> {
    key: ResourceKey,
    inner: Option<Arc<T>>,
}

impl<T: DeviceResource> Resource<T> {
    pub fn null() -> Self {
        Self {
            key: ResourceKey::null(),
            inner: None,
        }
    }

    /// 接管对象中已经计入的那一个引用
    #[inline]
    pub(crate) fn adopt(key: ResourceKey, inner: Arc<T>) -> Self {
        Self {
            key,
            inner: Some(inner),
        }
    }

    /// 从 arena 中的对象得到一个新的 handle，计数为 0 的对象不会被复活
    pub(crate) fn resurrect(key: ResourceKey, inner: Arc<T>) -> Option<Self> {
        inner.base().try_retain().then(|| Self::adopt(key, inner))
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.inner.is_some()
    }

    #[inline]
    pub fn key(&self) -> ResourceKey {
        self.key
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        self.inner.as_deref()
    }

    /// null handle 返回 [`GfxError::NullResource`]
    #[inline]
    pub fn try_get(&self) -> GfxResult<&T> {
        self.inner.as_deref().ok_or(GfxError::NullResource(T::KIND))
    }

    /// null handle 返回 0
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.inner.as_ref().map_or(0, |inner| inner.base().ref_count())
    }

    /// 不计入引用计数的弱引用
    #[inline]
    pub(crate) fn downgrade(&self) -> Option<Weak<T>> {
        self.inner.as_ref().map(Arc::downgrade)
    }

    /// 两个 handle 是否指向同一个对象
    #[inline]
    pub fn same_as(&self, other: &Self) -> bool {
        self.valid() && self.key == other.key
    }
}

impl<T: DeviceResource> Default for Resource<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: DeviceResource> Clone for Resource<T> {
    fn clone(&self) -> Self {
        if let Some(inner) = &self.inner {
            inner.base().retain();
        }
        Self {
            key: self.key,
            inner: self.inner.clone(),
        }
    }
}

impl<T: DeviceResource> Drop for Resource<T> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if inner.base().release() {
            inner.base().device().post_zombie(T::KIND, self.key);
        }
    }
}

/// # Panics
/// null handle 解引用会 panic，不确定时使用 [`Resource::get`]
impl<T: DeviceResource> Deref for Resource<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        match self.inner.as_deref() {
            Some(inner) => inner,
            None => panic!("dereferencing a null {:?} handle", T::KIND),
        }
    }
}

impl<T: DeviceResource> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("Resource")
                .field("kind", &T::KIND)
                .field("key", &self.key)
                .field("name", &inner.debug_name())
                .field("ref_count", &inner.base().ref_count())
                .finish(),
            None => write!(f, "Resource({:?}, null)", T::KIND),
        }
    }
}
