/// 数据模型

pub mod disk;
pub mod nic;
pub mod request;
pub mod switch;
pub mod vm;
pub mod vm_config;
