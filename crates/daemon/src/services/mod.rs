pub mod disk_service;
pub mod nic_service;
pub mod request_service;
pub mod switch_service;
pub mod vm_service;

pub use disk_service::DiskService;
pub use nic_service::NicService;
pub use request_service::RequestService;
pub use switch_service::SwitchService;
pub use vm_service::VmService;
