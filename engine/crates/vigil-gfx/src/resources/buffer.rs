use std::ptr;

use ash::vk;

use crate::backend::{GfxBackend, MappedPtr, NativeBufferDesc};
use crate::error::{GfxError, GfxResult};
use crate::foundation::device::Device;
use crate::resources::arena::{ResourceArena, ResourceArenas};
use crate::resources::resource::{DeviceResource, RefCountedDeviceResource, Resource, ResourceKind};

/// buffer 所在的内存
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryLocation {
    /// 只有 GPU 可以访问，初始数据通过 staging buffer 上传
    #[default]
    GpuOnly,
    /// host 顺序写入，GPU 读取，持久映射
    CpuToGpu,
    /// GPU 写入，host 随机读取，持久映射
    GpuToCpu,
}

impl MemoryLocation {
    #[inline]
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryLocation::GpuOnly)
    }
}

pub struct BufferInfo<'a> {
    pub name: String,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// 初始数据，长度不能超过 size
    pub data: Option<&'a [u8]>,
}

impl<'a> BufferInfo<'a> {
    pub fn new(
        name: impl Into<String>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            usage,
            location,
            data: None,
        }
    }

    /// 用于 staging 的 buffer，host 可写
    #[inline]
    pub fn new_stage(name: impl Into<String>, size: vk::DeviceSize) -> Self {
        Self::new(name, size, vk::BufferUsageFlags::TRANSFER_SRC, MemoryLocation::CpuToGpu)
    }

    /// builder
    #[inline]
    pub fn data(mut self, data: &'a [u8]) -> Self {
        self.data = Some(data);
        self
    }
}

pub struct Buffer {
    base: RefCountedDeviceResource,
    handle: vk::Buffer,

    mapped: Option<MappedPtr>,
    device_address: Option<vk::DeviceAddress>,

    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,

    name: String,
}

impl DeviceResource for Buffer {
    const KIND: ResourceKind = ResourceKind::Buffer;

    fn base(&self) -> &RefCountedDeviceResource {
        &self.base
    }

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self> {
        &arenas.buffers
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn destroy_native(&self, backend: &dyn GfxBackend) {
        backend.destroy_buffer(self.handle);
    }
}

// new & init
impl Buffer {
    /// - host 可见的 buffer 直接通过映射的内存写入初始数据
    /// - GPU only 的 buffer 通过 staging buffer 以及一次 one time submit 上传初始数据，会阻塞
    pub fn create(device: &Device, info: BufferInfo) -> GfxResult<Resource<Self>> {
        let _span = tracy_client::span!("Buffer::create");
        if info.size == 0 {
            return Err(GfxError::InvalidArgument(format!("buffer `{}` has zero size", info.name)));
        }

        let mut usage = info.usage;
        if let Some(data) = info.data {
            if data.len() as vk::DeviceSize > info.size {
                return Err(GfxError::OutOfRange {
                    name: info.name,
                    offset: 0,
                    size: data.len() as u64,
                    capacity: info.size,
                });
            }
            if !info.location.is_host_visible() {
                usage |= vk::BufferUsageFlags::TRANSFER_DST;
            }
        }

        let native = device.backend().create_buffer(&NativeBufferDesc {
            name: &info.name,
            size: info.size,
            usage,
            location: info.location,
        })?;
        let buffer = device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle: native.handle,
            mapped: native.mapped,
            device_address: native.device_address,
            size: info.size,
            usage,
            location: info.location,
            name: info.name,
        });

        if let Some(data) = info.data.filter(|data| !data.is_empty()) {
            if buffer.location.is_host_visible() {
                buffer.write_bytes(0, data)?;
            } else {
                Self::upload(device, &buffer, 0, data)?;
            }
        }
        Ok(buffer)
    }

    /// 创建失败时返回 null handle
    pub fn from(device: &Device, info: BufferInfo) -> Resource<Self> {
        let name = info.name.clone();
        Self::create(device, info).unwrap_or_else(|e| {
            log::error!("failed to create buffer `{}`: {}", name, e);
            Resource::null()
        })
    }
}

// getters
impl Buffer {
    #[inline]
    pub fn native(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    #[inline]
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    /// 只有 usage 包含 SHADER_DEVICE_ADDRESS 时才有值
    #[inline]
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// tools
impl Buffer {
    pub(crate) fn check_range(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(GfxError::OutOfRange {
                name: self.name.clone(),
                offset,
                size,
                capacity: self.size,
            }),
        }
    }

    fn mapped_ptr(&self) -> GfxResult<*mut u8> {
        self.mapped.map(MappedPtr::as_ptr).ok_or_else(|| GfxError::NotHostVisible(self.name.clone()))
    }

    /// 通过映射的内存写入数据，写入之后会 flush
    ///
    /// 调用者需要保证 GPU 此时没有在访问这段内存
    pub fn write_bytes(&self, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let ptr = self.mapped_ptr()?;
        let size = data.len() as vk::DeviceSize;
        self.check_range(offset, size)?;

        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }
        self.base.backend().flush_buffer(self.handle, offset, size)
    }

    #[inline]
    pub fn write_pod<T: bytemuck::Pod>(&self, offset: vk::DeviceSize, values: &[T]) -> GfxResult<()> {
        self.write_bytes(offset, bytemuck::cast_slice(values))
    }

    /// 通过映射的内存读取数据，读取之前会 invalidate
    pub fn read_bytes(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> GfxResult<Vec<u8>> {
        let ptr = self.mapped_ptr()?;
        self.check_range(offset, size)?;
        self.base.backend().invalidate_buffer(self.handle, offset, size)?;

        let mut bytes = vec![0u8; size as usize];
        unsafe {
            ptr::copy_nonoverlapping(ptr.add(offset as usize), bytes.as_mut_ptr(), bytes.len());
        }
        Ok(bytes)
    }

    /// 创建一个临时的 stage buffer，先将数据放入 stage buffer，再 transfer 到 `dst`
    ///
    /// 同步等待传输完成，stage buffer 在之后的 `clear_garbage` 中回收
    ///
    /// # Note
    /// * 避免使用这个将 *小块* 数据从内存传到 GPU，推荐使用 cmd transfer
    pub fn upload(device: &Device, dst: &Resource<Buffer>, offset: vk::DeviceSize, data: &[u8]) -> GfxResult<()> {
        let target = dst.try_get()?;
        let size = data.len() as vk::DeviceSize;
        target.check_range(offset, size)?;

        let stage = Self::create(device, BufferInfo::new_stage(format!("{}-stage-buffer", target.name), size).data(data))?;
        device.one_time_exec(&format!("{}-transfer-data", target.name), |cmd| {
            cmd.copy_buffer(&stage, dst, &[vk::BufferCopy::default().dst_offset(offset).size(size)])
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
    fn test_mapped_write_and_read() {
        let (device, _backend) = device();
        let buffer = Buffer::from(
            &device,
            BufferInfo::new("readback", 64, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryLocation::GpuToCpu),
        );

        buffer.write_pod(16, &[1u32, 2, 3]).unwrap();
        let bytes = buffer.read_bytes(16, 12).unwrap();
        assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&[1, 2, 3]));
    }

    #[test]
    fn test_gpu_only_buffer_is_not_mapped() {
        let (device, _backend) = device();
        let buffer = Buffer::from(
            &device,
            BufferInfo::new("vertex", 64, vk::BufferUsageFlags::VERTEX_BUFFER, MemoryLocation::GpuOnly),
        );

        assert!(matches!(buffer.write_bytes(0, &[0; 4]), Err(GfxError::NotHostVisible(_))));
        assert!(matches!(buffer.read_bytes(0, 4), Err(GfxError::NotHostVisible(_))));
    }

    #[test]
    fn test_access_out_of_range() {
        let (device, _backend) = device();
        let buffer = Buffer::from(&device, BufferInfo::new_stage("stage", 16));

        assert!(matches!(buffer.write_bytes(12, &[0; 8]), Err(GfxError::OutOfRange { .. })));
        assert!(matches!(buffer.read_bytes(u64::MAX, 2), Err(GfxError::OutOfRange { .. })));
    }

    #[test]
    fn test_initial_data_is_uploaded_through_stage_buffer() {
        let (device, backend) = device();
        let data = (0..32u8).collect::<Vec<_>>();
        let buffer = Buffer::from(
            &device,
            BufferInfo::new("index", 64, vk::BufferUsageFlags::INDEX_BUFFER, MemoryLocation::GpuOnly).data(&data),
        );

        assert!(buffer.usage().contains(vk::BufferUsageFlags::TRANSFER_DST));
        let contents = backend.buffer_contents(buffer.native()).unwrap();
        assert_eq!(&contents[..32], &data[..]);
        assert!(contents[32..].iter().all(|b| *b == 0));

        // stage buffer 以及临时的命令缓冲在 GPU 完成之后回收
        device.clear_garbage();
        assert_eq!(backend.live_count(NativeObjectKind::Buffer), 1);
    }

    #[test]
    fn test_invalid_info_returns_null() {
        let (device, backend) = device();

        let empty = Buffer::from(&device, BufferInfo::new_stage("empty", 0));
        assert!(!empty.valid());

        let too_much = [0u8; 8];
        let small = Buffer::from(&device, BufferInfo::new_stage("small", 4).data(&too_much));
        assert!(!small.valid());
        assert_eq!(backend.live_count(NativeObjectKind::Buffer), 0);
    }

    #[test]
    fn test_device_address() {
        let (device, _backend) = device();
        let plain = Buffer::from(&device, BufferInfo::new_stage("plain", 4));
        let addressed = Buffer::from(
            &device,
            BufferInfo::new(
                "addressed",
                4,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
            ),
        );

        assert!(plain.device_address().is_none());
        assert!(addressed.device_address().is_some());
    }
}
