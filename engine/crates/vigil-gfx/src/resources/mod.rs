pub mod arena;
pub mod buffer;
pub mod image;
pub mod resource;
pub mod sampler;
