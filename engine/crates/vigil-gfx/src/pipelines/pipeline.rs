//! compute / graphics pipeline
//!
//! graphics pipeline 使用 dynamic rendering，viewport 和 scissor 为动态状态。
//! 只覆盖常用的固定管线状态，不追求完整的 pipeline state 描述。

use ash::vk;
use itertools::Itertools;

use crate::backend::{GfxBackend, NativePipeline, NativePipelineDesc, NativeShaderStage};
use crate::error::{GfxError, GfxResult};
use crate::foundation::device::Device;
use crate::pipelines::shader::Shader;
use crate::resources::arena::{ResourceArena, ResourceArenas};
use crate::resources::resource::{DeviceResource, RefCountedDeviceResource, Resource, ResourceKind};

/// graphics pipeline 的固定管线状态
#[derive(Debug, Clone)]
pub struct GraphicsState {
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub samples: vk::SampleCountFlags,

    /// dynamic render 需要的 framebuffer 信息
    pub color_formats: Vec<vk::Format>,
    /// UNDEFINED 表示不使用 depth attachment
    pub depth_format: vk::Format,
    pub depth_test: bool,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            vertex_bindings: vec![],
            vertex_attributes: vec![],
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            // 按照 OpenGL 的传统，将 CCW 视为 front face
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            samples: vk::SampleCountFlags::TYPE_1,
            color_formats: vec![],
            depth_format: vk::Format::UNDEFINED,
            depth_test: false,
        }
    }
}

impl GraphicsState {
    /// builder
    #[inline]
    pub fn attach_info(mut self, color_formats: Vec<vk::Format>, depth_format: Option<vk::Format>) -> Self {
        self.color_formats = color_formats;
        self.depth_format = depth_format.unwrap_or(vk::Format::UNDEFINED);
        self.depth_test = depth_format.is_some();
        self
    }

    /// builder
    #[inline]
    pub fn vertex_input(
        mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> Self {
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
        self
    }

    /// builder
    #[inline]
    pub fn rasterization(mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> Self {
        self.cull_mode = cull_mode;
        self.front_face = front_face;
        self
    }

    /// builder
    #[inline]
    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }
}

pub struct ComputePipelineInfo {
    pub name: String,
    pub shader: Resource<Shader>,
    /// push constant 的字节数，0 表示不使用
    pub push_constant_size: u32,
}

impl ComputePipelineInfo {
    pub fn new(name: impl Into<String>, shader: &Resource<Shader>) -> Self {
        Self {
            name: name.into(),
            shader: shader.clone(),
            push_constant_size: 0,
        }
    }

    /// builder
    #[inline]
    pub fn push_constant_size(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }
}

pub struct GraphicsPipelineInfo {
    pub name: String,
    pub vertex: Resource<Shader>,
    pub fragment: Resource<Shader>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
    pub state: GraphicsState,
}

impl GraphicsPipelineInfo {
    pub fn new(name: impl Into<String>, vertex: &Resource<Shader>, fragment: &Resource<Shader>) -> Self {
        Self {
            name: name.into(),
            vertex: vertex.clone(),
            fragment: fragment.clone(),
            push_constant_ranges: vec![],
            state: GraphicsState::default(),
        }
    }

    /// builder
    #[inline]
    pub fn push_constant_ranges(mut self, ranges: Vec<vk::PushConstantRange>) -> Self {
        self.push_constant_ranges = ranges;
        self
    }

    /// builder
    #[inline]
    pub fn state(mut self, state: GraphicsState) -> Self {
        self.state = state;
        self
    }
}

pub enum PipelineInfo {
    Compute(ComputePipelineInfo),
    Graphics(GraphicsPipelineInfo),
}

impl PipelineInfo {
    #[inline]
    pub fn name(&self) -> &str {
        match self {
            PipelineInfo::Compute(info) => &info.name,
            PipelineInfo::Graphics(info) => &info.name,
        }
    }
}

impl From<ComputePipelineInfo> for PipelineInfo {
    fn from(info: ComputePipelineInfo) -> Self {
        PipelineInfo::Compute(info)
    }
}

impl From<GraphicsPipelineInfo> for PipelineInfo {
    fn from(info: GraphicsPipelineInfo) -> Self {
        PipelineInfo::Graphics(info)
    }
}

pub struct Pipeline {
    base: RefCountedDeviceResource,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    push_constant_stages: vk::ShaderStageFlags,
    name: String,
}

impl DeviceResource for Pipeline {
    const KIND: ResourceKind = ResourceKind::Pipeline;

    fn base(&self) -> &RefCountedDeviceResource {
        &self.base
    }

    fn arena(arenas: &ResourceArenas) -> &ResourceArena<Self> {
        &arenas.pipelines
    }

    fn debug_name(&self) -> &str {
        &self.name
    }

    fn destroy_native(&self, backend: &dyn GfxBackend) {
        backend.destroy_pipeline(NativePipeline {
            handle: self.handle,
            layout: self.layout,
        });
    }
}

// new & init
impl Pipeline {
    pub fn create(device: &Device, info: impl Into<PipelineInfo>) -> GfxResult<Resource<Self>> {
        let _span = tracy_client::span!("Pipeline::create");
        let info = info.into();
        let (native, bind_point, push_constant_stages, name) = match info {
            PipelineInfo::Compute(info) => {
                let shader = info.shader.try_get()?;
                if shader.stage() != vk::ShaderStageFlags::COMPUTE {
                    return Err(GfxError::InvalidArgument(format!(
                        "compute pipeline `{}` uses a {:?} shader",
                        info.name,
                        shader.stage()
                    )));
                }

                let push_constant_ranges = (info.push_constant_size > 0)
                    .then(|| {
                        vk::PushConstantRange::default()
                            .stage_flags(vk::ShaderStageFlags::COMPUTE)
                            .offset(0)
                            .size(info.push_constant_size)
                    })
                    .into_iter()
                    .collect_vec();
                let stages = [NativeShaderStage {
                    stage: vk::ShaderStageFlags::COMPUTE,
                    module: shader.native(),
                    entry_point: shader.entry_point(),
                }];
                let native = device.backend().create_pipeline(&NativePipelineDesc {
                    name: &info.name,
                    bind_point: vk::PipelineBindPoint::COMPUTE,
                    stages: &stages,
                    push_constant_ranges: &push_constant_ranges,
                    graphics: None,
                })?;
                let push_stages =
                    if push_constant_ranges.is_empty() { vk::ShaderStageFlags::empty() } else { vk::ShaderStageFlags::COMPUTE };
                (native, vk::PipelineBindPoint::COMPUTE, push_stages, info.name)
            }
            PipelineInfo::Graphics(info) => {
                let (vertex, fragment) = (info.vertex.try_get()?, info.fragment.try_get()?);
                let stages = [
                    NativeShaderStage {
                        stage: vk::ShaderStageFlags::VERTEX,
                        module: vertex.native(),
                        entry_point: vertex.entry_point(),
                    },
                    NativeShaderStage {
                        stage: vk::ShaderStageFlags::FRAGMENT,
                        module: fragment.native(),
                        entry_point: fragment.entry_point(),
                    },
                ];
                let native = device.backend().create_pipeline(&NativePipelineDesc {
                    name: &info.name,
                    bind_point: vk::PipelineBindPoint::GRAPHICS,
                    stages: &stages,
                    push_constant_ranges: &info.push_constant_ranges,
                    graphics: Some(&info.state),
                })?;
                let push_stages = info
                    .push_constant_ranges
                    .iter()
                    .fold(vk::ShaderStageFlags::empty(), |stages, range| stages | range.stage_flags);
                (native, vk::PipelineBindPoint::GRAPHICS, push_stages, info.name)
            }
        };

        Ok(device.emplace(Self {
            base: RefCountedDeviceResource::new(device),
            handle: native.handle,
            layout: native.layout,
            bind_point,
            push_constant_stages,
            name,
        }))
    }

    /// 创建失败时返回 null handle
    pub fn from(device: &Device, info: impl Into<PipelineInfo>) -> Resource<Self> {
        let info = info.into();
        let name = info.name().to_string();
        Self::create(device, info).unwrap_or_else(|e| {
            log::error!("failed to create pipeline `{}`: {}", name, e);
            Resource::null()
        })
    }
}

// getters
impl Pipeline {
    #[inline]
    pub fn native(&self) -> vk::Pipeline {
        self.handle
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    /// push constant 覆盖的所有 stage
    #[inline]
    pub fn push_constant_stages(&self) -> vk::ShaderStageFlags {
        self.push_constant_stages
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, NativeObjectKind, RecordedCommand};
    use crate::commands::command_buffer::{CommandBuffer, CommandBufferInfo};
    use crate::commands::command_pool::{CommandPool, CommandPoolInfo};
    use crate::config::GfxConfig;
    use crate::pipelines::shader::ShaderInfo;
    use crate::pipelines::shader::tests::spirv_header;

    fn device() -> (Device, HeadlessBackend) {
        vigil_crate_tools::init_log::init_test_log();
        let backend = HeadlessBackend::new();
        let device = Device::new_headless(GfxConfig::default(), backend.clone()).unwrap();
        (device, backend)
    }

    #[test]
    fn test_compute_pipeline_with_push_constants() {
        let (device, backend) = device();
        let code = spirv_header();
        let shader = Shader::from(&device, ShaderInfo::new("cs", &code, vk::ShaderStageFlags::COMPUTE));
        let pipeline = Pipeline::from(&device, ComputePipelineInfo::new("blur", &shader).push_constant_size(16));
        assert!(pipeline.valid());
        assert_eq!(pipeline.bind_point(), vk::PipelineBindPoint::COMPUTE);
        assert_eq!(pipeline.push_constant_stages(), vk::ShaderStageFlags::COMPUTE);

        // shader 可以在 pipeline 创建之后释放
        drop(shader);
        device.clear_garbage();
        assert_eq!(backend.live_count(NativeObjectKind::ShaderModule), 0);

        let pool = CommandPool::from(&device, CommandPoolInfo::new("pool"));
        let cmd = CommandBuffer::from(&device, CommandBufferInfo::new(&pool, "cmd"));
        cmd.begin().unwrap();
        cmd.bind_pipeline(&pipeline).unwrap();
        cmd.push_constants_pod(0, &[0.5f32; 4]).unwrap();
        cmd.dispatch([4, 4, 1]).unwrap();
        cmd.end().unwrap();

        let commands = backend.recorded_commands(cmd.native());
        assert!(matches!(commands[0], RecordedCommand::BindPipeline(p) if p == pipeline.native()));
        assert!(matches!(commands[1], RecordedCommand::PushConstants { offset: 0, size: 16 }));
        assert_eq!(cmd.retained_count(), 1);
    }

    #[test]
    fn test_stage_mismatch_is_rejected() {
        let (device, backend) = device();
        let code = spirv_header();
        let vs = Shader::from(&device, ShaderInfo::new("vs", &code, vk::ShaderStageFlags::VERTEX));

        let pipeline = Pipeline::from(&device, ComputePipelineInfo::new("wrong", &vs));
        assert!(!pipeline.valid());
        assert_eq!(backend.live_count(NativeObjectKind::Pipeline), 0);
    }

    #[test]
    fn test_graphics_pipeline() {
        let (device, backend) = device();
        let code = spirv_header();
        let vs = Shader::from(&device, ShaderInfo::new("vs", &code, vk::ShaderStageFlags::VERTEX));
        let fs = Shader::from(&device, ShaderInfo::new("fs", &code, vk::ShaderStageFlags::FRAGMENT));

        let pipeline = Pipeline::from(
            &device,
            GraphicsPipelineInfo::new("triangle", &vs, &fs)
                .push_constant_ranges(vec![
                    vk::PushConstantRange::default().stage_flags(vk::ShaderStageFlags::VERTEX).size(64),
                    vk::PushConstantRange::default().stage_flags(vk::ShaderStageFlags::FRAGMENT).offset(64).size(16),
                ])
                .state(GraphicsState::default().attach_info(vec![vk::Format::B8G8R8A8_UNORM], Some(vk::Format::D32_SFLOAT))),
        );
        assert_eq!(pipeline.bind_point(), vk::PipelineBindPoint::GRAPHICS);
        assert_eq!(pipeline.push_constant_stages(), vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);

        drop(pipeline);
        device.clear_garbage();
        assert_eq!(backend.live_count(NativeObjectKind::Pipeline), 0);
        assert_eq!(backend.live_count(NativeObjectKind::PipelineLayout), 0);
    }
}
