pub mod device;
pub mod zombie;
