/// 交换机后端抽象层
///
/// if_bridge 和 netgraph 两种后端满足同一组能力，由 [`super::SwitchEngine`] 按交换机类型选择

use async_trait::async_trait;
use common::{Result, SwitchType};

/// 交换机后端 Trait
#[async_trait]
pub trait SwitchBackend: Send + Sync + 'static {
    /// 后端类型
    fn switch_type(&self) -> SwitchType;

    /// 列出内核中所有该类型的网桥 / 节点
    async fn list(&self) -> Result<Vec<String>>;

    /// 网桥是否存在于内核
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|n| n == name))
    }

    /// 创建网桥
    async fn create(&self, name: &str) -> Result<()>;

    /// 销毁网桥，尽力移除所有成员后再销毁本体
    async fn destroy(&self, name: &str) -> Result<()>;

    /// 列出网桥的成员（if_bridge 的 member，netgraph 的对端节点名）
    async fn members(&self, name: &str) -> Result<Vec<String>>;

    /// 添加成员
    async fn add_member(&self, name: &str, member: &str) -> Result<()>;

    /// 移除成员
    async fn remove_member(&self, name: &str, member: &str) -> Result<()>;

    /// 下一个空闲的 `linkN` 钩子，跳过 `reserved` 中已预留的钩子；
    /// 没有钩子概念的后端返回 None
    async fn next_link(&self, name: &str, reserved: &[String]) -> Result<Option<String>>;

    /// 分配一个临时（dummy）网桥名；编号空间耗尽时返回 None
    async fn allocate_dummy(&self) -> Result<Option<String>>;
}
