use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::Mutex;

use ash::vk;
use vk_mem::{Alloc, Allocation};

use crate::backend::MappedPtr;
use crate::error::{GfxError, GfxResult};
use crate::resources::buffer::MemoryLocation;

struct BufferAllocation {
    allocation: Allocation,
    mapped: bool,
}

/// vma 以及每个 buffer / image 对应的 allocation
///
/// 上层只持有原生 handle，allocation 通过 handle 在这里查找
pub(crate) struct MemAllocator {
    /// 必须在 device 之前销毁
    inner: ManuallyDrop<vk_mem::Allocator>,
    buffers: Mutex<HashMap<vk::Buffer, BufferAllocation>>,
    images: Mutex<HashMap<vk::Image, Allocation>>,
}

impl MemAllocator {
    /// vma 需要引用 Instance 以及 Device，因此需要在它们之后创建、之前销毁
    pub(crate) fn new(instance: &ash::Instance, pdevice: vk::PhysicalDevice, device: &ash::Device) -> GfxResult<Self> {
        let mut vma_ci = vk_mem::AllocatorCreateInfo::new(instance, device, pdevice);
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;
        vma_ci.flags = vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS;

        let vma = unsafe { vk_mem::Allocator::new(vma_ci)? };

        Ok(Self {
            inner: ManuallyDrop::new(vma),
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
        })
    }

    fn alloc_ci(location: MemoryLocation) -> vk_mem::AllocationCreateInfo {
        let flags = match location {
            MemoryLocation::GpuOnly => vk_mem::AllocationCreateFlags::empty(),
            MemoryLocation::CpuToGpu => vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            MemoryLocation::GpuToCpu => vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
        };
        vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            flags,
            ..Default::default()
        }
    }

    /// host 可见的 buffer 会被持久映射
    pub(crate) fn create_buffer(
        &self,
        buffer_ci: &vk::BufferCreateInfo,
        location: MemoryLocation,
    ) -> GfxResult<(vk::Buffer, Option<MappedPtr>)> {
        let (buffer, mut allocation) = unsafe { self.inner.create_buffer(buffer_ci, &Self::alloc_ci(location))? };

        let mut mapped = None;
        if location.is_host_visible() {
            match unsafe { self.inner.map_memory(&mut allocation) } {
                Ok(ptr) => mapped = MappedPtr::new(ptr),
                Err(e) => {
                    unsafe { self.inner.destroy_buffer(buffer, &mut allocation) };
                    return Err(e.into());
                }
            }
        }

        self.buffers.lock().unwrap_or_else(|e| e.into_inner()).insert(
            buffer,
            BufferAllocation {
                allocation,
                mapped: mapped.is_some(),
            },
        );
        Ok((buffer, mapped))
    }

    pub(crate) fn destroy_buffer(&self, buffer: vk::Buffer) {
        let Some(mut entry) = self.buffers.lock().unwrap_or_else(|e| e.into_inner()).remove(&buffer) else {
            log::error!("buffer {:?} is not allocated by vma", buffer);
            return;
        };
        unsafe {
            if entry.mapped {
                self.inner.unmap_memory(&mut entry.allocation);
            }
            self.inner.destroy_buffer(buffer, &mut entry.allocation);
        }
    }

    pub(crate) fn flush_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = buffers
            .get(&buffer)
            .ok_or_else(|| GfxError::InvalidArgument(format!("buffer {buffer:?} is not allocated by vma")))?;
        self.inner.flush_allocation(&entry.allocation, offset, size)?;
        Ok(())
    }

    pub(crate) fn invalidate_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> GfxResult<()> {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = buffers
            .get(&buffer)
            .ok_or_else(|| GfxError::InvalidArgument(format!("buffer {buffer:?} is not allocated by vma")))?;
        self.inner.invalidate_allocation(&entry.allocation, offset, size)?;
        Ok(())
    }

    pub(crate) fn create_image(&self, image_ci: &vk::ImageCreateInfo) -> GfxResult<vk::Image> {
        let (image, allocation) = unsafe { self.inner.create_image(image_ci, &Self::alloc_ci(MemoryLocation::GpuOnly))? };
        self.images.lock().unwrap_or_else(|e| e.into_inner()).insert(image, allocation);
        Ok(image)
    }

    pub(crate) fn destroy_image(&self, image: vk::Image) {
        let Some(mut allocation) = self.images.lock().unwrap_or_else(|e| e.into_inner()).remove(&image) else {
            log::error!("image {:?} is not allocated by vma", image);
            return;
        };
        unsafe { self.inner.destroy_image(image, &mut allocation) };
    }

    /// 需要在 device 销毁之前调用，之后不能再使用
    pub(crate) fn destroy(&mut self) {
        let leaked_buffers = self.buffers.get_mut().map(|m| m.len()).unwrap_or_default();
        let leaked_images = self.images.get_mut().map(|m| m.len()).unwrap_or_default();
        if leaked_buffers + leaked_images > 0 {
            log::warn!("vma destroyed with {} buffers and {} images alive", leaked_buffers, leaked_images);
        }
        log::info!("destroying vma");
        unsafe { ManuallyDrop::drop(&mut self.inner) };
    }
}
