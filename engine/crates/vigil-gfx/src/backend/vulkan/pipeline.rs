use ash::vk;
use itertools::Itertools;

use crate::backend::NativePipelineDesc;
use crate::error::{GfxError, GfxResult};
use crate::pipelines::pipeline::GraphicsState;

/// 创建 pipeline layout 以及 pipeline；pipeline 创建失败时 layout 也会被销毁
pub(crate) fn create_pipeline(
    device: &ash::Device,
    desc: &NativePipelineDesc,
) -> GfxResult<(vk::Pipeline, vk::PipelineLayout)> {
    let layout_ci = vk::PipelineLayoutCreateInfo::default().push_constant_ranges(desc.push_constant_ranges);
    let layout = unsafe { device.create_pipeline_layout(&layout_ci, None)? };

    let stages = desc
        .stages
        .iter()
        .map(|stage| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(stage.stage)
                .module(stage.module)
                .name(stage.entry_point)
        })
        .collect_vec();

    let result = match (desc.bind_point, desc.graphics) {
        (vk::PipelineBindPoint::COMPUTE, _) => match stages.as_slice() {
            [stage] => create_compute(device, *stage, layout),
            _ => Err(GfxError::InvalidArgument(format!(
                "compute pipeline `{}` needs exactly one stage",
                desc.name
            ))),
        },
        (vk::PipelineBindPoint::GRAPHICS, Some(state)) => create_graphics(device, &stages, state, layout),
        (bind_point, _) => Err(GfxError::InvalidArgument(format!(
            "pipeline `{}`: unsupported bind point {:?}",
            desc.name, bind_point
        ))),
    };

    match result {
        Ok(pipeline) => Ok((pipeline, layout)),
        Err(e) => {
            unsafe { device.destroy_pipeline_layout(layout, None) };
            Err(e)
        }
    }
}

fn create_compute(
    device: &ash::Device,
    stage: vk::PipelineShaderStageCreateInfo,
    layout: vk::PipelineLayout,
) -> GfxResult<vk::Pipeline> {
    let pipeline_ci = vk::ComputePipelineCreateInfo::default().stage(stage).layout(layout);
    let pipelines = unsafe {
        device
            .create_compute_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&pipeline_ci), None)
            .map_err(|(_, e)| e)?
    };
    Ok(pipelines[0])
}

fn create_graphics(
    device: &ash::Device,
    stages: &[vk::PipelineShaderStageCreateInfo],
    state: &GraphicsState,
    layout: vk::PipelineLayout,
) -> GfxResult<vk::Pipeline> {
    // dynamic render 需要的 framebuffer 信息
    let mut rendering_ci = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&state.color_formats)
        .depth_attachment_format(state.depth_format);

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&state.vertex_bindings)
        .vertex_attribute_descriptions(&state.vertex_attributes);
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default().topology(state.topology);

    // viewport 和 scissor 都是 dynamic 的，这里只需要数量
    let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(state.cull_mode)
        .front_face(state.front_face)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(state.samples);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(state.depth_test)
        .depth_write_enable(state.depth_test)
        .depth_compare_op(vk::CompareOp::LESS);

    let blend_attachments = state
        .color_formats
        .iter()
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::default()
                .blend_enable(false)
                .color_write_mask(vk::ColorComponentFlags::RGBA)
        })
        .collect_vec();
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let pipeline_ci = vk::GraphicsPipelineCreateInfo::default()
        .stages(stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_ci);

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&pipeline_ci), None)
            .map_err(|(_, e)| e)?
    };
    Ok(pipelines[0])
}
