//! barrier 的描述
//!
//! 只包含原生 handle 和 flag，可以在线程间传递；录制时由后端转换为 `vk::*MemoryBarrier2`

use ash::vk;

/// barrier 使用的 src 和 dst 访问 mask
#[derive(Debug, Copy, Clone, Default)]
pub struct BarrierMask {
    pub src_stage: vk::PipelineStageFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl BarrierMask {
    /// transfer 写入之后在 shader 中读取
    pub const TRANSFER_TO_SHADER_READ: Self = Self {
        src_stage: vk::PipelineStageFlags2::TRANSFER,
        dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        src_access: vk::AccessFlags2::TRANSFER_WRITE,
        dst_access: vk::AccessFlags2::SHADER_READ,
    };

    /// 所有的写入对之后的所有读写可见，代价最高
    pub const FULL: Self = Self {
        src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        src_access: vk::AccessFlags2::MEMORY_WRITE,
        dst_access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
    };
}

#[derive(Debug, Copy, Clone, Default)]
pub struct MemoryBarrier {
    pub mask: BarrierMask,
}

impl MemoryBarrier {
    pub fn new(mask: BarrierMask) -> Self {
        Self { mask }
    }

    pub fn to_vk(&self) -> vk::MemoryBarrier2<'static> {
        vk::MemoryBarrier2::default()
            .src_stage_mask(self.mask.src_stage)
            .src_access_mask(self.mask.src_access)
            .dst_stage_mask(self.mask.dst_stage)
            .dst_access_mask(self.mask.dst_access)
    }
}

/// 便捷创建 image memory barrier 的结构体
///
/// image handle 以及默认的 aspect 在录制时由命令缓冲填入
#[derive(Debug, Copy, Clone)]
pub struct ImageBarrier {
    pub(crate) image: vk::Image,
    pub mask: BarrierMask,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub subresource_range: vk::ImageSubresourceRange,
}

impl Default for ImageBarrier {
    fn default() -> Self {
        Self {
            image: vk::Image::null(),
            mask: BarrierMask::default(),
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::empty(),
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            },
        }
    }
}

impl ImageBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// builder
    #[inline]
    pub fn layout_transfer(mut self, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        self.old_layout = old_layout;
        self.new_layout = new_layout;
        self
    }

    /// builder
    #[inline]
    pub fn queue_family_transfer(mut self, src_queue_family_index: u32, dst_queue_family_index: u32) -> Self {
        self.src_queue_family_index = src_queue_family_index;
        self.dst_queue_family_index = dst_queue_family_index;
        self
    }

    /// builder
    #[inline]
    pub fn src_mask(mut self, src_stage: vk::PipelineStageFlags2, src_access: vk::AccessFlags2) -> Self {
        self.mask.src_stage = src_stage;
        self.mask.src_access = src_access;
        self
    }

    /// builder
    #[inline]
    pub fn dst_mask(mut self, dst_stage: vk::PipelineStageFlags2, dst_access: vk::AccessFlags2) -> Self {
        self.mask.dst_stage = dst_stage;
        self.mask.dst_access = dst_access;
        self
    }

    /// builder
    #[inline]
    pub fn mask(mut self, mask: BarrierMask) -> Self {
        self.mask = mask;
        self
    }

    /// builder
    /// 不设置时使用 image 的 aspect
    #[inline]
    pub fn image_aspect_flag(mut self, aspect_mask: vk::ImageAspectFlags) -> Self {
        self.subresource_range.aspect_mask = aspect_mask;
        self
    }

    /// builder
    #[inline]
    pub fn mip_range(mut self, base_mip_level: u32, level_count: u32) -> Self {
        self.subresource_range.base_mip_level = base_mip_level;
        self.subresource_range.level_count = level_count;
        self
    }

    /// builder
    #[inline]
    pub fn layer_range(mut self, base_array_layer: u32, layer_count: u32) -> Self {
        self.subresource_range.base_array_layer = base_array_layer;
        self.subresource_range.layer_count = layer_count;
        self
    }

    pub fn to_vk(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .image(self.image)
            .src_stage_mask(self.mask.src_stage)
            .src_access_mask(self.mask.src_access)
            .dst_stage_mask(self.mask.dst_stage)
            .dst_access_mask(self.mask.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(self.src_queue_family_index)
            .dst_queue_family_index(self.dst_queue_family_index)
            .subresource_range(self.subresource_range)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct BufferBarrier {
    pub(crate) buffer: vk::Buffer,
    pub mask: BarrierMask,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl Default for BufferBarrier {
    fn default() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            mask: BarrierMask::default(),
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            offset: 0,
            size: vk::WHOLE_SIZE,
        }
    }
}

impl BufferBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// builder
    #[inline]
    pub fn queue_family_transfer(mut self, src_queue_family_index: u32, dst_queue_family_index: u32) -> Self {
        self.src_queue_family_index = src_queue_family_index;
        self.dst_queue_family_index = dst_queue_family_index;
        self
    }

    /// builder
    #[inline]
    pub fn src_mask(mut self, src_stage: vk::PipelineStageFlags2, src_access: vk::AccessFlags2) -> Self {
        self.mask.src_stage = src_stage;
        self.mask.src_access = src_access;
        self
    }

    /// builder
    #[inline]
    pub fn dst_mask(mut self, dst_stage: vk::PipelineStageFlags2, dst_access: vk::AccessFlags2) -> Self {
        self.mask.dst_stage = dst_stage;
        self.mask.dst_access = dst_access;
        self
    }

    /// builder
    #[inline]
    pub fn mask(mut self, mask: BarrierMask) -> Self {
        self.mask = mask;
        self
    }

    /// builder
    #[inline]
    pub fn range(mut self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        self.offset = offset;
        self.size = size;
        self
    }

    pub fn to_vk(&self) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .buffer(self.buffer)
            .src_stage_mask(self.mask.src_stage)
            .src_access_mask(self.mask.src_access)
            .dst_stage_mask(self.mask.dst_stage)
            .dst_access_mask(self.mask.dst_access)
            .src_queue_family_index(self.src_queue_family_index)
            .dst_queue_family_index(self.dst_queue_family_index)
            .offset(self.offset)
            .size(self.size)
    }
}
