use std::ffi::CString;

use ash::vk;
use itertools::Itertools;

use crate::backend::{NativeAttachment, NativeCommand};

fn attachment_info(attachment: &NativeAttachment) -> vk::RenderingAttachmentInfo<'static> {
    vk::RenderingAttachmentInfo::default()
        .image_view(attachment.view)
        .image_layout(attachment.layout)
        .load_op(attachment.load_op)
        .store_op(attachment.store_op)
        .clear_value(attachment.clear_value.vk_clear_value())
}

/// label 名称中不能有 `\0`
fn label_name(name: &str) -> CString {
    CString::new(name.replace('\0', "")).unwrap_or_default()
}

/// 将一条命令翻译为 `vkCmd*`
///
/// 状态检查、barrier 合批都已经在上层完成
pub(crate) fn record(
    device: &ash::Device,
    debug_utils: Option<&ash::ext::debug_utils::Device>,
    command_buffer: vk::CommandBuffer,
    command: &NativeCommand,
) {
    unsafe {
        match *command {
            NativeCommand::PipelineBarrier { memory, buffer, image } => {
                let memory_barriers = memory.iter().map(|b| b.to_vk()).collect_vec();
                let buffer_barriers = buffer.iter().map(|b| b.to_vk()).collect_vec();
                let image_barriers = image.iter().map(|b| b.to_vk()).collect_vec();
                let dependency_info = vk::DependencyInfo::default()
                    .memory_barriers(&memory_barriers)
                    .buffer_memory_barriers(&buffer_barriers)
                    .image_memory_barriers(&image_barriers);
                device.cmd_pipeline_barrier2(command_buffer, &dependency_info);
            }
            NativeCommand::BeginRendering {
                area,
                color_attachments,
                depth_attachment,
            } => {
                let colors = color_attachments.iter().map(attachment_info).collect_vec();
                let depth = depth_attachment.as_ref().map(attachment_info);
                let mut rendering_info =
                    vk::RenderingInfo::default().render_area(area).layer_count(1).color_attachments(&colors);
                if let Some(depth) = depth.as_ref() {
                    rendering_info = rendering_info.depth_attachment(depth);
                }
                device.cmd_begin_rendering(command_buffer, &rendering_info);
            }
            NativeCommand::EndRendering => device.cmd_end_rendering(command_buffer),
            NativeCommand::BindPipeline { bind_point, pipeline } => {
                device.cmd_bind_pipeline(command_buffer, bind_point, pipeline);
            }
            NativeCommand::PushConstants {
                layout,
                stages,
                offset,
                data,
            } => device.cmd_push_constants(command_buffer, layout, stages, offset, data),
            NativeCommand::BindVertexBuffers {
                first_binding,
                buffers,
                offsets,
            } => device.cmd_bind_vertex_buffers(command_buffer, first_binding, buffers, offsets),
            NativeCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => device.cmd_bind_index_buffer(command_buffer, buffer, offset, index_type),
            NativeCommand::SetViewport(viewport) => device.cmd_set_viewport(command_buffer, 0, &[viewport]),
            NativeCommand::SetScissor(scissor) => device.cmd_set_scissor(command_buffer, 0, &[scissor]),
            NativeCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => device.cmd_draw(command_buffer, vertex_count, instance_count, first_vertex, first_instance),
            NativeCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => device.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            ),
            NativeCommand::Dispatch { group_count } => {
                device.cmd_dispatch(command_buffer, group_count[0], group_count[1], group_count[2]);
            }
            NativeCommand::CopyBuffer { src, dst, regions } => device.cmd_copy_buffer(command_buffer, src, dst, regions),
            NativeCommand::CopyBufferToImage {
                src,
                dst,
                layout,
                regions,
            } => device.cmd_copy_buffer_to_image(command_buffer, src, dst, layout, regions),
            NativeCommand::BeginLabel { name, color } => {
                if let Some(debug_utils) = debug_utils {
                    let name = label_name(name);
                    let label = vk::DebugUtilsLabelEXT::default().label_name(&name).color(color);
                    debug_utils.cmd_begin_debug_utils_label(command_buffer, &label);
                }
            }
            NativeCommand::EndLabel => {
                if let Some(debug_utils) = debug_utils {
                    debug_utils.cmd_end_debug_utils_label(command_buffer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_name_strips_nul() {
        assert_eq!(label_name("a\0b").as_bytes(), b"ab");
        assert_eq!(label_name("frame").as_bytes(), b"frame");
    }
}
