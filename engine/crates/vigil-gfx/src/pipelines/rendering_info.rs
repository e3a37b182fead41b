use ash::vk;

use crate::backend::{ClearValue, NativeAttachment};
use crate::error::GfxResult;
use crate::resources::image::Image;
use crate::resources::resource::Resource;

/// dynamic rendering 的一个 attachment，使用 image 的默认 view
#[derive(Clone)]
pub struct RenderingAttachment {
    pub image: Resource<Image>,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: ClearValue,
}

impl RenderingAttachment {
    pub fn color(image: &Resource<Image>) -> Self {
        Self {
            image: image.clone(),
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: ClearValue::Color([0.0, 0.0, 0.0, 1.0]),
        }
    }

    pub fn depth(image: &Resource<Image>) -> Self {
        Self {
            image: image.clone(),
            layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            clear_value: ClearValue::DepthStencil { depth: 1.0, stencil: 0 },
        }
    }

    /// builder
    #[inline]
    pub fn load_op(mut self, load_op: vk::AttachmentLoadOp) -> Self {
        self.load_op = load_op;
        self
    }

    /// builder
    #[inline]
    pub fn store_op(mut self, store_op: vk::AttachmentStoreOp) -> Self {
        self.store_op = store_op;
        self
    }

    /// builder
    #[inline]
    pub fn clear_value(mut self, clear_value: ClearValue) -> Self {
        self.clear_value = clear_value;
        self
    }

    pub(crate) fn native(&self) -> GfxResult<NativeAttachment> {
        Ok(NativeAttachment {
            view: self.image.try_get()?.view(),
            layout: self.layout,
            load_op: self.load_op,
            store_op: self.store_op,
            clear_value: self.clear_value,
        })
    }
}

pub struct RenderingInfo {
    pub area: vk::Rect2D,
    pub color_attachments: Vec<RenderingAttachment>,
    pub depth_attachment: Option<RenderingAttachment>,
}

impl RenderingInfo {
    pub fn new(extent: vk::Extent2D) -> Self {
        Self {
            area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            color_attachments: Vec::new(),
            depth_attachment: None,
        }
    }

    /// builder
    #[inline]
    pub fn color_attachment(mut self, attachment: RenderingAttachment) -> Self {
        self.color_attachments.push(attachment);
        self
    }

    /// builder
    #[inline]
    pub fn depth_attachment(mut self, attachment: RenderingAttachment) -> Self {
        self.depth_attachment = Some(attachment);
        self
    }
}
