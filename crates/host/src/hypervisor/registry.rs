/// 监管任务注册表
///
/// 以虚拟机 ID 为键保存运行中虚拟机的监管句柄，由虚拟机控制器持有。
/// 另外为每台虚拟机提供一把操作锁，启动流程和进程事件处理在同一把锁下串行执行

use common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};

use crate::hypervisor::supervisor::SupervisorHandle;

#[derive(Clone, Default)]
pub struct SupervisorRegistry {
    inner: Arc<RwLock<HashMap<String, SupervisorHandle>>>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SupervisorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取虚拟机操作锁
    pub async fn guard(&self, vm_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(vm_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// 虚拟机删除后释放其操作锁
    pub async fn forget(&self, vm_id: &str) {
        self.locks.lock().await.remove(vm_id);
    }

    /// 注册句柄；同一虚拟机已有仍在运行的监管任务时拒绝
    pub async fn insert(&self, handle: SupervisorHandle) -> Result<()> {
        let mut map = self.inner.write().await;
        if let Some(existing) = map.get(handle.vm_id()) {
            if !existing.is_finished() {
                return Err(Error::AlreadyExists(format!(
                    "虚拟机 {} 已有监管任务",
                    handle.vm_id()
                )));
            }
        }
        map.insert(handle.vm_id().to_string(), handle);
        Ok(())
    }

    pub async fn remove(&self, vm_id: &str) -> Option<SupervisorHandle> {
        self.inner.write().await.remove(vm_id)
    }

    /// 是否有仍在运行的监管任务
    pub async fn is_active(&self, vm_id: &str) -> bool {
        self.inner
            .read()
            .await
            .get(vm_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub async fn pid(&self, vm_id: &str) -> Option<u32> {
        self.inner.read().await.get(vm_id).map(|h| h.pid())
    }

    pub async fn vm_ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    /// 守护进程退出时停止所有虚拟机进程
    pub async fn stop_all(&self, timeout: Duration) {
        let handles: Vec<SupervisorHandle> = self.inner.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let vm_id = handle.vm_id().to_string();
            match handle.stop(timeout).await {
                Ok(outcome) => info!("虚拟机 {} 已停止: {:?}", vm_id, outcome),
                Err(e) => warn!("停止虚拟机 {} 失败: {}", vm_id, e),
            }
        }
    }
}
