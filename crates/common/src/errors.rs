use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 资源冲突：已有未完成请求、上联/成员接口被占用、交换机仍被引用
    #[error("资源冲突: {0}")]
    Conflict(String),

    /// 非法的虚拟机状态迁移
    #[error("状态冲突: {0}")]
    InvalidState(String),

    /// 外部命令执行失败
    #[error("命令执行失败: {program} {args}: {message}")]
    Command {
        program: String,
        args: String,
        message: String,
    },

    #[error("虚拟化错误: {0}")]
    Hypervisor(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 是否属于同步拒绝类错误（校验 / 冲突），这类错误不会产生副作用
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::NotFound(_)
                | Error::AlreadyExists(_)
                | Error::Conflict(_)
                | Error::InvalidState(_)
        )
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(Error::InvalidState("running".to_string()).is_rejection());
        assert!(Error::Conflict("pending".to_string()).is_rejection());
        assert!(!Error::Hypervisor("spawn".to_string()).is_rejection());
        assert!(!Error::Command {
            program: "ifconfig".to_string(),
            args: "bridge0 destroy".to_string(),
            message: "busy".to_string(),
        }
        .is_rejection());
    }
}
