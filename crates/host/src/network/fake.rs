/// 内存中的假内核
///
/// 模拟 `ifconfig` / `ngctl` / `bhyvectl` / `rctl` 中交换机引擎用到的子集，
/// 输出格式与 FreeBSD 保持一致，并记录收到的每一条命令

use async_trait::async_trait;
use common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::command::{CommandOutput, CommandRunner};

#[derive(Debug, Default)]
struct FakeIface {
    groups: Vec<String>,
    members: Vec<String>,
}

#[derive(Debug)]
struct FakeNode {
    name: Option<String>,
    node_type: String,
    persistent: bool,
    /// local hook -> (peer node id, peer hook)
    hooks: BTreeMap<String, (u32, String)>,
}

#[derive(Debug, Default)]
struct FakeState {
    interfaces: BTreeMap<String, FakeIface>,
    nodes: BTreeMap<u32, FakeNode>,
    next_node_id: u32,
    log: Vec<String>,
    fail_patterns: Vec<String>,
}

type Outcome = std::result::Result<String, String>;

pub struct FakeKernel {
    state: Mutex<FakeState>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// 带两块物理网卡 em0 / em1 和回环 lo0 的宿主机
    pub fn new() -> Self {
        let kernel = Self {
            state: Mutex::new(FakeState {
                next_node_id: 1,
                ..Default::default()
            }),
        };
        kernel.add_interface("lo0");
        kernel.add_interface("em0");
        kernel.add_interface("em1");
        kernel
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 直接向内核加入一个接口（不经过命令，不记录日志）
    pub fn add_interface(&self, name: &str) {
        let mut state = self.lock();
        state.insert_interface(name, &[]);
    }

    pub fn has_interface(&self, name: &str) -> bool {
        self.lock().interfaces.contains_key(name)
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.lock().interfaces.keys().cloned().collect()
    }

    pub fn interface_groups(&self, name: &str) -> Vec<String> {
        self.lock()
            .interfaces
            .get(name)
            .map(|i| i.groups.clone())
            .unwrap_or_default()
    }

    pub fn bridge_members(&self, name: &str) -> Vec<String> {
        self.lock()
            .interfaces
            .get(name)
            .map(|i| i.members.clone())
            .unwrap_or_default()
    }

    pub fn ng_node_exists(&self, name: &str) -> bool {
        self.lock().node_by_name(name).is_some()
    }

    pub fn ng_node_persistent(&self, name: &str) -> bool {
        let state = self.lock();
        state
            .node_by_name(name)
            .and_then(|id| state.nodes.get(&id))
            .map(|n| n.persistent)
            .unwrap_or(false)
    }

    /// 节点的钩子及对端节点名
    pub fn ng_hooks(&self, name: &str) -> Vec<(String, String)> {
        let state = self.lock();
        let Some(node) = state.node_by_name(name).and_then(|id| state.nodes.get(&id)) else {
            return Vec::new();
        };
        node.hooks
            .iter()
            .map(|(hook, (peer, _))| (hook.clone(), state.display_name(*peer)))
            .collect()
    }

    /// 收到的全部命令（`程序名 参数...`）
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// 会改变内核状态的命令
    pub fn mutating_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| !is_read_only(c))
            .collect()
    }

    pub fn clear_commands(&self) {
        self.lock().log.clear();
    }

    /// 包含该片段的命令将以非零退出码失败
    pub fn fail_on(&self, pattern: &str) {
        self.lock().fail_patterns.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().fail_patterns.clear();
    }
}

#[async_trait]
impl CommandRunner for FakeKernel {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let tool = program.rsplit('/').next().unwrap_or(program);
        let line = std::iter::once(tool)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        let mut state = self.lock();
        state.log.push(line.clone());

        if state.fail_patterns.iter().any(|p| line.contains(p.as_str())) {
            return Ok(failure("injected failure"));
        }

        let outcome = match tool {
            "ifconfig" => state.ifconfig(args),
            "ngctl" => state.ngctl(args),
            "bhyvectl" | "rctl" => Ok(String::new()),
            _ => {
                return Err(Error::Command {
                    program: program.to_string(),
                    args: args.join(" "),
                    message: "No such file or directory".to_string(),
                })
            }
        };

        Ok(match outcome {
            Ok(stdout) => CommandOutput {
                status: 0,
                stdout,
                stderr: String::new(),
            },
            Err(stderr) => failure(&stderr),
        })
    }
}

fn failure(stderr: &str) -> CommandOutput {
    CommandOutput {
        status: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn is_read_only(command: &str) -> bool {
    let fields: Vec<&str> = command.split_whitespace().collect();
    match fields.as_slice() {
        ["ifconfig", "-l"] | ["ifconfig", "-g", _] | ["ifconfig", _] => true,
        ["ngctl", "list"] | ["ngctl", "show", _] => true,
        _ => false,
    }
}

/// 根据接口名前缀推导的默认接口组
fn base_group(name: &str) -> Option<&'static str> {
    if name.starts_with("bridge") {
        Some("bridge")
    } else if name.starts_with("tap") || name.starts_with("vmnet") {
        Some("tap")
    } else if name.starts_with("epair") {
        Some("epair")
    } else if name.starts_with("lo") {
        Some("lo")
    } else {
        None
    }
}

fn is_creatable(name: &str) -> bool {
    ["bridge", "tap", "vmnet", "epair"].iter().any(|prefix| {
        name.strip_prefix(prefix)
            .map(|unit| !unit.is_empty() && unit.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    })
}

/// epairNa / epairNb 的共同前缀
fn epair_base(name: &str) -> Option<&str> {
    if name.starts_with("epair") && (name.ends_with('a') || name.ends_with('b')) {
        Some(&name[..name.len() - 1])
    } else {
        None
    }
}

impl FakeState {
    fn insert_interface(&mut self, name: &str, extra_groups: &[String]) {
        let mut groups: Vec<String> = base_group(name).map(str::to_string).into_iter().collect();
        groups.extend(extra_groups.iter().cloned());
        self.interfaces.insert(
            name.to_string(),
            FakeIface {
                groups,
                members: Vec::new(),
            },
        );
        // 除回环外所有接口都会挂载 ng_ether 节点
        if !name.starts_with("lo") {
            self.add_node(Some(name.to_string()), "ether", true);
        }
    }

    fn add_node(&mut self, name: Option<String>, node_type: &str, persistent: bool) -> u32 {
        let id = self.next_node_id;
        self.next_node_id += 1;
        self.nodes.insert(
            id,
            FakeNode {
                name,
                node_type: node_type.to_string(),
                persistent,
                hooks: BTreeMap::new(),
            },
        );
        id
    }

    fn node_by_name(&self, name: &str) -> Option<u32> {
        self.nodes
            .iter()
            .find(|(_, n)| n.name.as_deref() == Some(name))
            .map(|(id, _)| *id)
    }

    fn display_name(&self, id: u32) -> String {
        self.nodes
            .get(&id)
            .and_then(|n| n.name.clone())
            .unwrap_or_else(|| "<unnamed>".to_string())
    }

    // ==================== ifconfig ====================

    fn ifconfig(&mut self, args: &[&str]) -> Outcome {
        match args {
            ["-l"] => Ok(format!(
                "{}\n",
                self.interfaces.keys().cloned().collect::<Vec<_>>().join(" ")
            )),
            ["-g", group] => {
                let names: Vec<String> = self
                    .interfaces
                    .iter()
                    .filter(|(_, i)| i.groups.iter().any(|g| g == group))
                    .map(|(n, _)| n.clone())
                    .collect();
                Ok(names.iter().map(|n| format!("{}\n", n)).collect())
            }
            [name] => self.show_interface(name),
            [name, "create", rest @ ..] => self.create_interface(name, rest),
            [name, "destroy"] => self.destroy_interface(name),
            [bridge, "addm", member] => self.add_member(bridge, member),
            [bridge, "deletem", member] => self.delete_member(bridge, member),
            [name, ..] => {
                if self.interfaces.contains_key(*name) {
                    Ok(String::new())
                } else {
                    Err(format!("ifconfig: interface {} does not exist", name))
                }
            }
            [] => Err("usage: ifconfig".to_string()),
        }
    }

    fn show_interface(&self, name: &str) -> Outcome {
        let iface = self
            .interfaces
            .get(name)
            .ok_or_else(|| format!("ifconfig: interface {} does not exist", name))?;
        let mut out = format!(
            "{}: flags=8843<UP,BROADCAST,RUNNING,SIMPLEX,MULTICAST> metric 0 mtu 1500\n",
            name
        );
        for member in &iface.members {
            out.push_str(&format!(
                "\tmember: {} flags=143<LEARNING,DISCOVER,AUTOEDGE,AUTOPTP>\n",
                member
            ));
        }
        out.push_str(&format!("\tgroups: {}\n", iface.groups.join(" ")));
        Ok(out)
    }

    fn create_interface(&mut self, name: &str, rest: &[&str]) -> Outcome {
        if !is_creatable(name) {
            return Err(format!("ifconfig: SIOCIFCREATE2 ({}): Invalid argument", name));
        }

        let mut extra_groups = Vec::new();
        let mut iter = rest.iter();
        while let Some(arg) = iter.next() {
            match *arg {
                "group" => {
                    if let Some(g) = iter.next() {
                        extra_groups.push(g.to_string());
                    }
                }
                "description" => {
                    iter.next();
                }
                _ => {}
            }
        }

        if name.starts_with("epair") {
            let a = format!("{}a", name);
            let b = format!("{}b", name);
            if self.interfaces.contains_key(&a) || self.interfaces.contains_key(&b) {
                return Err(format!("ifconfig: SIOCIFCREATE2 ({}): File exists", name));
            }
            self.insert_interface(&a, &extra_groups);
            self.insert_interface(&b, &extra_groups);
            return Ok(format!("{}\n", a));
        }

        if self.interfaces.contains_key(name) {
            return Err(format!("ifconfig: SIOCIFCREATE2 ({}): File exists", name));
        }
        self.insert_interface(name, &extra_groups);
        Ok(format!("{}\n", name))
    }

    fn destroy_interface(&mut self, name: &str) -> Outcome {
        if !self.interfaces.contains_key(name) {
            return Err(format!("ifconfig: interface {} does not exist", name));
        }

        let victims: Vec<String> = match epair_base(name) {
            Some(base) => vec![format!("{}a", base), format!("{}b", base)],
            None => vec![name.to_string()],
        };

        for victim in victims {
            self.interfaces.remove(&victim);
            for iface in self.interfaces.values_mut() {
                iface.members.retain(|m| m != &victim);
            }
            if let Some(id) = self.node_by_name(&victim) {
                self.remove_node(id);
            }
        }
        Ok(String::new())
    }

    fn add_member(&mut self, bridge: &str, member: &str) -> Outcome {
        if !self.interfaces.contains_key(member) {
            return Err(format!("ifconfig: interface {} does not exist", member));
        }
        if self.interfaces.values().any(|i| i.members.iter().any(|m| m == member)) {
            return Err(format!("ifconfig: BRDGADD {}: File exists", member));
        }
        let iface = self
            .interfaces
            .get_mut(bridge)
            .filter(|i| i.groups.iter().any(|g| g == "bridge"))
            .ok_or_else(|| format!("ifconfig: interface {} does not exist", bridge))?;
        iface.members.push(member.to_string());
        Ok(String::new())
    }

    fn delete_member(&mut self, bridge: &str, member: &str) -> Outcome {
        let iface = self
            .interfaces
            .get_mut(bridge)
            .ok_or_else(|| format!("ifconfig: interface {} does not exist", bridge))?;
        let before = iface.members.len();
        iface.members.retain(|m| m != member);
        if iface.members.len() == before {
            return Err(format!("ifconfig: BRDGDEL {}: Invalid argument", member));
        }
        Ok(String::new())
    }

    // ==================== ngctl ====================

    fn ngctl(&mut self, args: &[&str]) -> Outcome {
        match args {
            ["list"] => Ok(self.list_nodes()),
            ["show", path] => {
                let id = self.resolve(path)?;
                Ok(self.show_node(id))
            }
            ["mkpeer", path, node_type, hook, peer_hook] => {
                let id = self.resolve(path)?;
                self.ensure_hook_free(id, hook)?;
                let new_id = self.add_node(None, node_type, false);
                self.link(id, hook, new_id, peer_hook);
                Ok(String::new())
            }
            ["name", path, new_name] => {
                if self.node_by_name(new_name).is_some() {
                    return Err("ngctl: name: File exists".to_string());
                }
                let id = self.resolve(path)?;
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.name = Some(new_name.to_string());
                }
                Ok(String::new())
            }
            ["msg", path, message, ..] => {
                let id = self.resolve(path)?;
                if *message == "setpersistent" {
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.persistent = true;
                    }
                }
                Ok(String::new())
            }
            ["connect", src, dst, src_hook, dst_hook] => {
                let src_id = self.resolve(src)?;
                let dst_id = self.resolve(dst)?;
                self.ensure_hook_free(src_id, src_hook)?;
                self.ensure_hook_free(dst_id, dst_hook)?;
                self.link(src_id, src_hook, dst_id, dst_hook);
                Ok(String::new())
            }
            ["rmhook", path, hook] => {
                let id = self.resolve(path)?;
                self.unlink(id, hook)?;
                self.collect_garbage();
                Ok(String::new())
            }
            ["shutdown", path] => {
                let id = self.resolve(path)?;
                let is_ether = self.nodes.get(&id).map(|n| n.node_type == "ether").unwrap_or(false);
                if is_ether {
                    let hooks: Vec<String> = self
                        .nodes
                        .get(&id)
                        .map(|n| n.hooks.keys().cloned().collect())
                        .unwrap_or_default();
                    for hook in hooks {
                        let _ = self.unlink(id, &hook);
                    }
                    self.collect_garbage();
                } else {
                    self.remove_node(id);
                }
                Ok(String::new())
            }
            _ => Err(format!("ngctl: unsupported command: {}", args.join(" "))),
        }
    }

    fn list_nodes(&self) -> String {
        let mut out = format!("There are {} total nodes:\n", self.nodes.len());
        for (id, node) in &self.nodes {
            out.push_str(&format!(
                "  Name: {:<15} Type: {:<15} ID: {:08x}   Num hooks: {}\n",
                self.display_name(*id),
                node.node_type,
                id,
                node.hooks.len()
            ));
        }
        out
    }

    fn show_node(&self, id: u32) -> String {
        let node = &self.nodes[&id];
        let mut out = format!(
            "  Name: {:<15} Type: {:<15} ID: {:08x}   Num hooks: {}\n",
            self.display_name(id),
            node.node_type,
            id,
            node.hooks.len()
        );
        if node.hooks.is_empty() {
            return out;
        }
        out.push_str("  Local hook      Peer name       Peer type    Peer ID         Peer hook\n");
        out.push_str("  ----------      ---------       ---------    -------         ---------\n");
        for (hook, (peer, peer_hook)) in node.hooks.iter().rev() {
            let peer_type = self.nodes.get(peer).map(|n| n.node_type.as_str()).unwrap_or("?");
            out.push_str(&format!(
                "  {:<15} {:<15} {:<12} {:08x}        {}\n",
                hook,
                self.display_name(*peer),
                peer_type,
                peer,
                peer_hook
            ));
        }
        out
    }

    /// 解析 `name:`、`[id]:` 以及 `name:hook` 形式的路径
    fn resolve(&self, path: &str) -> std::result::Result<u32, String> {
        let not_found = || format!("ngctl: {}: No such file or directory", path);
        let (node_part, hook_part) = path.split_once(':').ok_or_else(not_found)?;

        let found = match node_part.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            Some(hex) => u32::from_str_radix(hex, 16)
                .ok()
                .filter(|id| self.nodes.contains_key(id)),
            None => self.node_by_name(node_part),
        };
        let id = found.ok_or_else(not_found)?;

        if hook_part.is_empty() {
            return Ok(id);
        }
        self.nodes[&id]
            .hooks
            .get(hook_part)
            .map(|(peer, _)| *peer)
            .ok_or_else(not_found)
    }

    fn ensure_hook_free(&self, id: u32, hook: &str) -> std::result::Result<(), String> {
        if self.nodes[&id].hooks.contains_key(hook) {
            return Err(format!("ngctl: hook {} already connected: File exists", hook));
        }
        Ok(())
    }

    fn link(&mut self, a: u32, a_hook: &str, b: u32, b_hook: &str) {
        if let Some(node) = self.nodes.get_mut(&a) {
            node.hooks.insert(a_hook.to_string(), (b, b_hook.to_string()));
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            node.hooks.insert(b_hook.to_string(), (a, a_hook.to_string()));
        }
    }

    fn unlink(&mut self, id: u32, hook: &str) -> std::result::Result<(), String> {
        let (peer, peer_hook) = self
            .nodes
            .get_mut(&id)
            .and_then(|n| n.hooks.remove(hook))
            .ok_or_else(|| format!("ngctl: rmhook {}: No such file or directory", hook))?;
        if let Some(node) = self.nodes.get_mut(&peer) {
            node.hooks.remove(&peer_hook);
        }
        Ok(())
    }

    fn remove_node(&mut self, id: u32) {
        if let Some(node) = self.nodes.remove(&id) {
            for (peer, peer_hook) in node.hooks.values() {
                if let Some(peer_node) = self.nodes.get_mut(peer) {
                    peer_node.hooks.remove(peer_hook);
                }
            }
        }
        self.collect_garbage();
    }

    /// 没有钩子的非持久节点自动关闭
    fn collect_garbage(&mut self) {
        self.nodes
            .retain(|_, n| n.persistent || n.node_type == "ether" || !n.hooks.is_empty());
    }
}
