use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::item::{FeedItem, ScopeKey};

/// 覆盖层写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayInsert {
    Added,
    /// 同 id 已在覆盖层中（推送至少一次投递导致的重复）
    Duplicate,
}

/// 覆盖层集合：作用域 → 尚未被基础列表确认的 Live 条目（按到达顺序）
///
/// 有两个上限：每个作用域最多 `capacity` 条（先淘汰最早到达的），
/// 以及条目最长保留 `ttl`（以 sort_key 即本地接收时间计算），
/// 都在下一次写入时生效。
#[derive(Debug)]
pub struct OverlaySet {
    scopes: HashMap<ScopeKey, Vec<FeedItem>>,
    capacity: usize,
    ttl: Duration,
    next_arrival: u64,
    evicted_total: u64,
}

impl OverlaySet {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            scopes: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
            next_arrival: 0,
            evicted_total: 0,
        }
    }

    /// 分配下一个到达序号（全局递增）
    pub fn next_arrival(&mut self) -> u64 {
        self.next_arrival += 1;
        self.next_arrival
    }

    /// 当前作用域的覆盖层
    pub fn items(&self, scope: &ScopeKey) -> &[FeedItem] {
        self.scopes.get(scope).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn len(&self, scope: &ScopeKey) -> usize {
        self.items(scope).len()
    }

    pub fn contains(&self, scope: &ScopeKey, id: &str) -> bool {
        self.items(scope).iter().any(|item| item.id == id)
    }

    /// 追加一条 Live 条目，返回写入结果和本次淘汰条数
    pub fn insert(&mut self, scope: &ScopeKey, item: FeedItem, now_millis: u64) -> (OverlayInsert, usize) {
        if self.contains(scope, &item.id) {
            debug!("🔄 覆盖层重复推送: scope={}, id={}", scope, item.id);
            return (OverlayInsert::Duplicate, 0);
        }

        let ttl_ms = self.ttl.as_millis() as u64;
        let capacity = self.capacity;
        let entries = self.scopes.entry(scope.clone()).or_default();
        entries.push(item);

        let before = entries.len();
        if ttl_ms > 0 {
            entries.retain(|existing| existing.sort_key.saturating_add(ttl_ms) >= now_millis);
        }
        if entries.len() > capacity {
            let overflow = entries.len() - capacity;
            entries.drain(..overflow);
        }
        let evicted = before - entries.len();

        if evicted > 0 {
            self.evicted_total += evicted as u64;
            info!(
                "🧹 覆盖层淘汰: scope={}, 移除 {} 条, 剩余 {} 条",
                scope,
                evicted,
                entries.len()
            );
        }
        (OverlayInsert::Added, evicted)
    }

    /// 整体替换作用域的覆盖层（对账结果）
    pub fn replace(&mut self, scope: &ScopeKey, items: Vec<FeedItem>) {
        if items.is_empty() {
            self.scopes.remove(scope);
        } else {
            self.scopes.insert(scope.clone(), items);
        }
    }

    /// 丢弃作用域的覆盖层（拆除）
    pub fn discard(&mut self, scope: &ScopeKey) -> usize {
        self.scopes.remove(scope).map(|v| v.len()).unwrap_or(0)
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }
}
