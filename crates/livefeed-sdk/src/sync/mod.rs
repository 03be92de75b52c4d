/// 实时列表同步模块
///
/// 职责：
/// - 挂载作用域：订阅推送、触发首次拉取
/// - 推送事件写入覆盖层，立即输出新的渲染列表
/// - 基础列表刷新后对账覆盖层
/// - 拆除守卫：作用域切换/卸载后，迟到的推送和拉取结果都是空操作

pub mod synchronizer;

pub use synchronizer::LiveFeedSynchronizer;
pub(crate) use synchronizer::SyncHandle;

use serde::{Deserialize, Serialize};

use crate::feed::{FeedItem, ScopeKey};

/// 作用域同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// 未挂载，或作用域被禁用
    Uninitialized,
    /// 已订阅推送，首次拉取尚未完成
    Subscribing,
    /// 首次拉取已完成（成功或失败）
    Synced,
    /// 已拆除
    TornDown,
}

impl SyncPhase {
    /// 是否接收推送和拉取结果
    pub fn is_active(&self) -> bool {
        matches!(self, SyncPhase::Subscribing | SyncPhase::Synced)
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::Uninitialized => write!(f, "未挂载"),
            SyncPhase::Subscribing => write!(f, "订阅中"),
            SyncPhase::Synced => write!(f, "已同步"),
            SyncPhase::TornDown => write!(f, "已拆除"),
        }
    }
}

/// 渲染列表快照（每次输出一份完整的新列表）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub scope: ScopeKey,
    pub phase: SyncPhase,
    /// 按 sort_key 降序，id 唯一
    pub items: Vec<FeedItem>,
    /// 覆盖层中尚未确认的 Live 条目数
    pub overlay_len: usize,
    /// 最近一次拉取错误（成功后清空）
    pub fetch_error: Option<String>,
    /// 推送通道连接错误（仅缓存模式）
    pub connection_error: Option<String>,
    /// 单调递增的输出序号
    pub revision: u64,
    pub emitted_at: u64,
}

impl FeedSnapshot {
    /// 空快照
    pub fn empty(scope: ScopeKey) -> Self {
        Self {
            scope,
            phase: SyncPhase::Uninitialized,
            items: Vec::new(),
            overlay_len: 0,
            fetch_error: None,
            connection_error: None,
            revision: 0,
            emitted_at: 0,
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.id.as_str()).collect()
    }

    pub fn live_count(&self) -> usize {
        self.items.iter().filter(|item| item.is_live()).count()
    }
}

/// 同步器统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub mounts: u64,
    /// 收到的推送事件（含被忽略的）
    pub pushes_received: u64,
    /// 无法解析或属于其他作用域的推送
    pub pushes_ignored: u64,
    /// 重复推送（id 已在覆盖层或基础列表中）
    pub duplicates_dropped: u64,
    /// 输出的渲染列表数
    pub emissions: u64,
    /// 覆盖层容量/过期淘汰数
    pub overlay_evictions: u64,
    /// 因作用域已切换而丢弃的拉取结果
    pub late_results_discarded: u64,
}
