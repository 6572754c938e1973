/// Easy VM - 公共库
///
/// 提供 Host 和 Daemon 共享的类型、错误处理、校验工具函数等

pub mod errors;
pub mod models;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use models::constants;
pub use models::{DiskEmulation, NicDevType, NicEmulation, RequestKind, SwitchType, VmStatus};
