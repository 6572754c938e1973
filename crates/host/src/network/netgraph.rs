/// netgraph 网桥实现
///
/// netgraph 的网桥是一个 ng_bridge 节点，成员通过编号钩子 (`linkN`) 连接，
/// 节点本身没有接口身份
///
/// 创建流程（借助临时 if_bridge 作为锚点）：
/// 1. 分配并创建临时网桥 bridgeN
/// 2. `ngctl mkpeer bridgeN: bridge lower link0` 在锚点的 ng_ether 节点上挂出新网桥节点
/// 3. `ngctl name bridgeN:lower bnetM` 为新节点命名
/// 4. `ngctl msg bnetM: setpersistent`，没有任何连接时节点也不会被回收
/// 5. 销毁临时网桥，ng_bridge 节点保留

use async_trait::async_trait;
use common::{Error, Result, SwitchType};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, NGCTL};
use crate::network::backend::SwitchBackend;
use crate::network::bridge::IfBridge;
use crate::network::lowest_free_link;

/// `ngctl list` 中的一个节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NgNode {
    pub name: String,
    pub node_type: String,
}

/// `ngctl show` 中的一条钩子连接
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NgHook {
    pub local_hook: String,
    pub peer_name: String,
    pub peer_type: String,
    pub peer_hook: String,
}

#[derive(Clone)]
pub struct NgBridge {
    runner: Arc<dyn CommandRunner>,
    /// 用于分配和创建锚点网桥
    anchor: IfBridge,
}

impl NgBridge {
    pub fn new(runner: Arc<dyn CommandRunner>, anchor: IfBridge) -> Self {
        Self { runner, anchor }
    }

    /// 列出所有 netgraph 节点
    pub async fn nodes(&self) -> Result<Vec<NgNode>> {
        let stdout = self.runner.run_ok(NGCTL, &["list"]).await?;
        Ok(parse_ngctl_list(&stdout))
    }

    /// 列出节点的所有钩子连接
    pub async fn hooks(&self, name: &str) -> Result<Vec<NgHook>> {
        let path = format!("{}:", name);
        let stdout = self.runner.run_ok(NGCTL, &["show", &path]).await?;
        Ok(parse_ngctl_show(&stdout))
    }

    /// 断开网桥上的指定钩子
    pub async fn remove_hook(&self, name: &str, hook: &str) -> Result<()> {
        let path = format!("{}:", name);
        self.runner.run_ok(NGCTL, &["rmhook", &path, hook]).await?;
        Ok(())
    }

    /// 连接 `src:` 的 `src_hook` 到 `dst:` 的 `dst_hook`
    pub async fn connect(&self, src: &str, dst: &str, src_hook: &str, dst_hook: &str) -> Result<()> {
        let src_path = format!("{}:", src);
        let dst_path = format!("{}:", dst);
        self.runner
            .run_ok(NGCTL, &["connect", &src_path, &dst_path, src_hook, dst_hook])
            .await?;
        Ok(())
    }

    /// 向节点发送控制消息
    pub async fn msg(&self, name: &str, message: &[&str]) -> Result<()> {
        let path = format!("{}:", name);
        let mut args = vec!["msg", path.as_str()];
        args.extend_from_slice(message);
        self.runner.run_ok(NGCTL, &args).await?;
        Ok(())
    }

    /// 关闭节点
    pub async fn shutdown(&self, name: &str) -> Result<()> {
        let path = format!("{}:", name);
        self.runner.run_ok(NGCTL, &["shutdown", &path]).await?;
        Ok(())
    }

    /// 在 `name:` 的 `hook` 上创建一个 `node_type` 类型的新节点
    pub async fn mkpeer(&self, name: &str, node_type: &str, hook: &str, peer_hook: &str) -> Result<()> {
        let path = format!("{}:", name);
        self.runner
            .run_ok(NGCTL, &["mkpeer", &path, node_type, hook, peer_hook])
            .await?;
        Ok(())
    }

    /// 为路径指向的节点命名，例如 `bridge5:lower`
    pub async fn name_node(&self, path: &str, name: &str) -> Result<()> {
        self.runner.run_ok(NGCTL, &["name", path, name]).await?;
        Ok(())
    }

    /// 在锚点上创建、命名并持久化网桥节点
    async fn bootstrap(&self, anchor: &str, name: &str) -> Result<()> {
        self.mkpeer(anchor, "bridge", "lower", "link0").await?;
        self.name_node(&format!("{}:lower", anchor), name).await?;
        self.msg(name, &["setpersistent"]).await
    }
}

#[async_trait]
impl SwitchBackend for NgBridge {
    fn switch_type(&self) -> SwitchType {
        SwitchType::Ng
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .nodes()
            .await?
            .into_iter()
            .filter(|node| node.node_type == "bridge" && node.name != "<unnamed>")
            .map(|node| node.name)
            .collect())
    }

    async fn create(&self, name: &str) -> Result<()> {
        info!("创建 netgraph 网桥: {}", name);

        let anchor = self
            .anchor
            .allocate_dummy()
            .await?
            .ok_or_else(|| Error::Network("没有可用的临时网桥名".to_string()))?;
        debug!("使用临时网桥 {} 作为 {} 的锚点", anchor, name);

        // 锚点带守护进程组标签，崩溃遗留时可被启动对账回收
        let anchor = self
            .anchor
            .create_tagged(&anchor, &format!("easyvm anchor {}", name))
            .await
            .map_err(|e| Error::Network(format!("创建临时网桥 {} 失败: {}", anchor, e)))?;

        let bootstrap = self.bootstrap(&anchor, name).await;

        // 无论引导是否成功都要销毁锚点，持久化的节点不受影响
        if let Err(e) = self.anchor.destroy_interface(&anchor).await {
            warn!("销毁临时网桥 {} 失败: {}", anchor, e);
        }

        if let Err(e) = bootstrap {
            if let Err(cleanup) = self.shutdown(name).await {
                debug!("清理未完成的网桥节点 {} 失败: {}", name, cleanup);
            }
            return Err(Error::Network(format!("创建 netgraph 网桥 {} 失败: {}", name, e)));
        }

        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        info!("销毁 netgraph 网桥: {}", name);

        match self.hooks(name).await {
            Ok(hooks) => {
                for hook in hooks {
                    if let Err(e) = self.remove_hook(name, &hook.local_hook).await {
                        warn!("断开 {} 的钩子 {} 失败: {}", name, hook.local_hook, e);
                    }
                }
            }
            Err(e) => warn!("读取网桥 {} 钩子失败: {}", name, e),
        }

        self.shutdown(name)
            .await
            .map_err(|e| Error::Network(format!("关闭 netgraph 网桥 {} 失败: {}", name, e)))
    }

    async fn members(&self, name: &str) -> Result<Vec<String>> {
        let mut peers: Vec<String> = Vec::new();
        for hook in self.hooks(name).await? {
            if !peers.contains(&hook.peer_name) {
                peers.push(hook.peer_name);
            }
        }
        Ok(peers)
    }

    /// 以上联方式连接一个 ng_ether 节点：lower 和 upper 各占一个钩子
    async fn add_member(&self, name: &str, member: &str) -> Result<()> {
        info!("将 {} 连接到 netgraph 网桥 {}", member, name);

        let mut hooks: Vec<String> = self
            .hooks(name)
            .await?
            .into_iter()
            .map(|h| h.local_hook)
            .collect();

        let lower_link = lowest_free_link(&hooks)
            .ok_or_else(|| Error::Network(format!("网桥 {} 没有空闲钩子", name)))?;
        hooks.push(lower_link.clone());
        let upper_link = lowest_free_link(&hooks)
            .ok_or_else(|| Error::Network(format!("网桥 {} 没有空闲钩子", name)))?;

        self.connect(member, name, "lower", &lower_link).await?;
        if let Err(e) = self.connect(member, name, "upper", &upper_link).await {
            if let Err(cleanup) = self.remove_hook(name, &lower_link).await {
                warn!("回滚钩子 {} 失败: {}", lower_link, cleanup);
            }
            return Err(e);
        }

        // 上联接口需要混杂模式，且不改写源 MAC
        self.msg(member, &["setpromisc", "1"]).await?;
        self.msg(member, &["setautosrc", "0"]).await?;
        Ok(())
    }

    async fn remove_member(&self, name: &str, member: &str) -> Result<()> {
        info!("从 netgraph 网桥 {} 断开 {}", name, member);

        let hooks = self.hooks(name).await?;
        let mut last_error = None;
        for hook in hooks.iter().filter(|h| h.peer_name == member) {
            if let Err(e) = self.remove_hook(name, &hook.local_hook).await {
                warn!("断开钩子 {} 失败: {}", hook.local_hook, e);
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn next_link(&self, name: &str, reserved: &[String]) -> Result<Option<String>> {
        let mut hooks: Vec<String> = self
            .hooks(name)
            .await?
            .into_iter()
            .map(|h| h.local_hook)
            .collect();
        hooks.extend(reserved.iter().cloned());
        Ok(lowest_free_link(&hooks))
    }

    async fn allocate_dummy(&self) -> Result<Option<String>> {
        self.anchor.allocate_dummy().await
    }
}

/// 解析 `ngctl list` 输出
///
/// ```text
/// There are 3 total nodes:
///   Name: em0             Type: ether           ID: 00000001   Num hooks: 0
///   Name: bnet0           Type: bridge          ID: 0000000a   Num hooks: 2
/// ```
pub fn parse_ngctl_list(stdout: &str) -> Vec<NgNode> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let name_pos = fields.iter().position(|f| *f == "Name:")?;
            let type_pos = fields.iter().position(|f| *f == "Type:")?;
            Some(NgNode {
                name: fields.get(name_pos + 1)?.to_string(),
                node_type: fields.get(type_pos + 1)?.to_string(),
            })
        })
        .collect()
}

/// 解析 `ngctl show <node>:` 输出中的钩子表
///
/// ```text
///   Name: bnet0           Type: bridge          ID: 0000000a   Num hooks: 2
///   Local hook      Peer name       Peer type    Peer ID         Peer hook
///   ----------      ---------       ---------    -------         ---------
///   link1           em0             ether        00000001        upper
///   link0           em0             ether        00000001        lower
/// ```
pub fn parse_ngctl_show(stdout: &str) -> Vec<NgHook> {
    stdout
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("----------"))
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 5 {
                return None;
            }
            Some(NgHook {
                local_hook: fields[0].to_string(),
                peer_name: fields[1].to_string(),
                peer_type: fields[2].to_string(),
                peer_hook: fields[4].to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::fake::FakeKernel;

    const LIST_OUTPUT: &str = "There are 4 total nodes:
  Name: em0             Type: ether           ID: 00000001   Num hooks: 2
  Name: ngctl4242       Type: socket          ID: 0000000c   Num hooks: 0
  Name: bnet0           Type: bridge          ID: 0000000a   Num hooks: 2
  Name: <unnamed>       Type: bridge          ID: 0000000b   Num hooks: 1
";

    const SHOW_OUTPUT: &str = "  Name: bnet0           Type: bridge          ID: 0000000a   Num hooks: 2
  Local hook      Peer name       Peer type    Peer ID         Peer hook
  ----------      ---------       ---------    -------         ---------
  link1           em0             ether        00000001        upper
  link0           em0             ether        00000001        lower
";

    #[test]
    fn test_parse_ngctl_list() {
        let nodes = parse_ngctl_list(LIST_OUTPUT);
        assert_eq!(nodes.len(), 4);
        assert_eq!(
            nodes[2],
            NgNode {
                name: "bnet0".to_string(),
                node_type: "bridge".to_string()
            }
        );
    }

    #[test]
    fn test_parse_ngctl_show() {
        let hooks = parse_ngctl_show(SHOW_OUTPUT);
        assert_eq!(hooks.len(), 2);
        assert_eq!(hooks[0].local_hook, "link1");
        assert_eq!(hooks[0].peer_name, "em0");
        assert_eq!(hooks[0].peer_hook, "upper");
        assert!(parse_ngctl_show("  Name: bnet1  Type: bridge  ID: 0000000d   Num hooks: 0\n").is_empty());
    }

    fn backend(kernel: &Arc<FakeKernel>) -> NgBridge {
        let runner: Arc<dyn CommandRunner> = kernel.clone();
        NgBridge::new(runner.clone(), IfBridge::new(runner, "easyvm"))
    }

    #[tokio::test]
    async fn test_bootstrap_leaves_persistent_node_and_no_anchor() {
        let kernel = Arc::new(FakeKernel::new());
        let ng = backend(&kernel);

        ng.create("bnet0").await.unwrap();

        assert_eq!(ng.list().await.unwrap(), vec!["bnet0"]);
        assert!(kernel.ng_node_persistent("bnet0"));
        // 锚点网桥已被销毁
        assert!(!kernel.has_interface("bridge32767"));
        assert!(ng.hooks("bnet0").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leaked_anchor_carries_daemon_group() {
        let kernel = Arc::new(FakeKernel::new());
        let ng = backend(&kernel);
        kernel.fail_on("bridge32767 destroy");

        ng.create("bnet0").await.unwrap();

        assert!(kernel.ng_node_persistent("bnet0"));
        assert!(kernel.has_interface("bridge32767"));
        assert!(kernel
            .interface_groups("bridge32767")
            .contains(&"easyvm".to_string()));
    }

    #[tokio::test]
    async fn test_uplink_hooks_and_next_link() {
        let kernel = Arc::new(FakeKernel::new());
        let ng = backend(&kernel);
        ng.create("bnet0").await.unwrap();

        ng.add_member("bnet0", "em0").await.unwrap();
        assert_eq!(ng.members("bnet0").await.unwrap(), vec!["em0"]);
        assert_eq!(ng.next_link("bnet0", &[]).await.unwrap().as_deref(), Some("link2"));

        ng.remove_member("bnet0", "em0").await.unwrap();
        assert!(ng.members("bnet0").await.unwrap().is_empty());
        assert_eq!(ng.next_link("bnet0", &["link0".to_string()]).await.unwrap().as_deref(), Some("link1"));
    }

    #[tokio::test]
    async fn test_destroy_removes_node() {
        let kernel = Arc::new(FakeKernel::new());
        let ng = backend(&kernel);
        ng.create("bnet3").await.unwrap();
        ng.add_member("bnet3", "em1").await.unwrap();

        ng.destroy("bnet3").await.unwrap();
        assert!(!ng.exists("bnet3").await.unwrap());
        assert!(kernel.has_interface("em1"));
    }
}
