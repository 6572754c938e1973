/// 虚拟交换机
///
/// 支持 if_bridge 和 netgraph (ng_bridge) 两种互斥后端，
/// 所有变更前都重新读取内核实时状态，不依赖缓存或数据库

pub mod backend;
pub mod bridge;
pub mod engine;
pub mod netgraph;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use backend::SwitchBackend;
pub use bridge::IfBridge;
pub use engine::{RateLimitLink, SwitchEngine};
pub use netgraph::NgBridge;

use common::models::constants::MAX_UNIT;

/// 从最大编号向下线性探测第一个未被占用的 `<prefix><N>`
///
/// `taken` 判断某个候选名是否已存在于内核实时列表中；编号空间耗尽时返回 None
pub fn find_free_unit_desc<F>(prefix: &str, taken: F) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    (0..=MAX_UNIT)
        .rev()
        .map(|unit| format!("{}{}", prefix, unit))
        .find(|candidate| !taken(candidate))
}

/// 从 0 开始向上探测第一个未被占用的 `<prefix><N>`
pub fn find_free_unit_asc<F>(prefix: &str, taken: F) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    (0..=MAX_UNIT)
        .map(|unit| format!("{}{}", prefix, unit))
        .find(|candidate| !taken(candidate))
}

/// 在一组钩子名中找出最小的未使用 `linkN`
pub fn lowest_free_link<S: AsRef<str>>(hooks: &[S]) -> Option<String> {
    (0..=MAX_UNIT)
        .map(|n| format!("link{}", n))
        .find(|candidate| !hooks.iter().any(|h| h.as_ref() == candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_find_free_unit_desc_fully_occupied_high_range() {
        // bridge32767 到 bridge16385 全部被占用
        let taken: HashSet<String> = (16385..=MAX_UNIT).map(|n| format!("bridge{}", n)).collect();
        let found = find_free_unit_desc("bridge", |n| taken.contains(n));
        assert_eq!(found.as_deref(), Some("bridge16384"));
    }

    #[test]
    fn test_find_free_unit_desc_tolerates_gaps() {
        let taken: HashSet<&str> = ["bridge32767", "bridge32765"].into_iter().collect();
        let found = find_free_unit_desc("bridge", |n| taken.contains(n));
        assert_eq!(found.as_deref(), Some("bridge32766"));
    }

    #[test]
    fn test_find_free_unit_desc_exhausted() {
        assert_eq!(find_free_unit_desc("bridge", |_| true), None);
    }

    #[test]
    fn test_find_free_unit_asc() {
        let taken: HashSet<&str> = ["tap0", "tap1", "tap3"].into_iter().collect();
        assert_eq!(
            find_free_unit_asc("tap", |n| taken.contains(n)).as_deref(),
            Some("tap2")
        );
    }

    #[test]
    fn test_lowest_free_link() {
        assert_eq!(lowest_free_link::<&str>(&[]).as_deref(), Some("link0"));
        assert_eq!(
            lowest_free_link(&["link0", "link1", "link3"]).as_deref(),
            Some("link2")
        );
        assert_eq!(lowest_free_link(&["link1"]).as_deref(), Some("link0"));
    }
}
