//! 基础列表 × 覆盖层 → 渲染列表
//!
//! 纯函数，不依赖推送通道或缓存，可以单独测试。
//!
//! 规则：
//! - 按 `sort_key` 降序
//! - 同排序键时 Live 在前；Live 之间后到的在前；Persisted 之间保持基础列表顺序
//! - 按 id 去重，Persisted 永远胜出

use std::cmp::Ordering;
use std::collections::HashSet;

use super::item::{FeedItem, Origin};
use crate::config::ReconcilePolicy;

fn origin_rank(origin: Origin) -> u8 {
    match origin {
        Origin::Live => 0,
        Origin::Persisted => 1,
    }
}

/// 渲染顺序比较器
pub fn render_order(a: &FeedItem, b: &FeedItem) -> Ordering {
    b.sort_key
        .cmp(&a.sort_key)
        .then_with(|| origin_rank(a.origin).cmp(&origin_rank(b.origin)))
        .then_with(|| match (a.origin, b.origin) {
            (Origin::Live, Origin::Live) => b.arrival.cmp(&a.arrival),
            _ => Ordering::Equal,
        })
}

/// 合并基础列表和覆盖层
pub fn merge(base: &[FeedItem], overlay: &[FeedItem]) -> Vec<FeedItem> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(base.len() + overlay.len());
    let mut output = Vec::with_capacity(base.len() + overlay.len());

    for item in base {
        if seen.insert(item.id.as_str()) {
            output.push(item.clone());
        }
    }
    for item in overlay {
        if seen.insert(item.id.as_str()) {
            output.push(item.clone());
        }
    }

    // sort_by 是稳定排序，Persisted 同键条目保持原顺序
    output.sort_by(render_order);
    output
}

/// 覆盖层对账
///
/// `refetch` 为 true 表示基础列表之前已经同步过，这次是后续的成功刷新：
/// 此时未被确认的条目也不再保留（本地 id 的条目永远无法被确认）。
/// 首次拉取只按 id 确认，拉取期间到达的推送不会丢。
///
/// 覆盖层需要替换时返回新覆盖层，否则返回 None。
pub fn reconcile_overlay(
    base: &[FeedItem],
    overlay: &[FeedItem],
    policy: ReconcilePolicy,
    refetch: bool,
) -> Option<Vec<FeedItem>> {
    if overlay.is_empty() {
        return None;
    }
    let base_ids: HashSet<&str> = base.iter().map(|item| item.id.as_str()).collect();

    match policy {
        ReconcilePolicy::ClearOnConfirm => {
            let confirmed = overlay.iter().any(|item| base_ids.contains(item.id.as_str()));
            (refetch || confirmed).then(Vec::new)
        }
        ReconcilePolicy::PruneConfirmed => {
            let kept: Vec<FeedItem> = overlay
                .iter()
                .filter(|item| !base_ids.contains(item.id.as_str()))
                .filter(|item| !(refetch && item.has_local_id()))
                .cloned()
                .collect();
            (kept.len() != overlay.len()).then_some(kept)
        }
    }
}
