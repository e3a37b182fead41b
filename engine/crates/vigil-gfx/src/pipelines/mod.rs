pub mod pipeline;
pub mod rendering_info;
pub mod shader;
