//! 事件系统模块 - 同步器向视图层发布的事件
//!
//! 功能包括：
//! - 渲染列表更新事件（每个推送事件、每次基础列表变化各一条）
//! - 作用域阶段变化事件
//! - 拉取失败、发送成功/失败事件
//! - 事件广播和订阅机制（broadcast + 同步监听器）

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::feed::ScopeKey;
use crate::sync::{FeedSnapshot, SyncPhase};
use crate::utils::now_millis;

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FeedEvent {
    /// 渲染列表更新
    SnapshotUpdated(FeedSnapshot),
    /// 作用域阶段变化
    PhaseChanged {
        scope: ScopeKey,
        old_phase: SyncPhase,
        new_phase: SyncPhase,
        timestamp: u64,
    },
    /// 基础列表拉取失败
    FetchFailed {
        scope: ScopeKey,
        error: String,
        timestamp: u64,
    },
    /// 消息发送成功（服务端已分配 id）
    MessageSent {
        scope: ScopeKey,
        message_id: String,
        timestamp: u64,
    },
    /// 消息发送失败
    MessageSendFailed {
        scope: ScopeKey,
        error: String,
        timestamp: u64,
    },
}

impl FeedEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            FeedEvent::SnapshotUpdated(_) => "snapshot_updated",
            FeedEvent::PhaseChanged { .. } => "phase_changed",
            FeedEvent::FetchFailed { .. } => "fetch_failed",
            FeedEvent::MessageSent { .. } => "message_sent",
            FeedEvent::MessageSendFailed { .. } => "message_send_failed",
        }
    }

    /// 获取事件关联的作用域
    pub fn scope(&self) -> &ScopeKey {
        match self {
            FeedEvent::SnapshotUpdated(snapshot) => &snapshot.scope,
            FeedEvent::PhaseChanged { scope, .. }
            | FeedEvent::FetchFailed { scope, .. }
            | FeedEvent::MessageSent { scope, .. }
            | FeedEvent::MessageSendFailed { scope, .. } => scope,
        }
    }

    /// 获取事件时间戳
    pub fn timestamp(&self) -> u64 {
        match self {
            FeedEvent::SnapshotUpdated(snapshot) => snapshot.emitted_at,
            FeedEvent::PhaseChanged { timestamp, .. }
            | FeedEvent::FetchFailed { timestamp, .. }
            | FeedEvent::MessageSent { timestamp, .. }
            | FeedEvent::MessageSendFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 作用域过滤器
    pub scopes: Option<Vec<ScopeKey>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<ScopeKey>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &FeedEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let Some(ref scopes) = self.scopes {
            if !scopes.contains(event.scope()) {
                return false;
            }
        }
        true
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&FeedEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<u64>,
}

/// 事件管理器
///
/// `emit` 是同步的：推送处理器里调用时不会挂起，监听器按注册顺序立即执行。
pub struct EventManager {
    sender: broadcast::Sender<FeedEvent>,
    listeners: RwLock<HashMap<String, Vec<EventListener>>>,
    stats: RwLock<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: FeedEvent) {
        debug!("Emitting event: {} scope={}", event.event_type(), event.scope());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 先拷贝监听器，监听器内部可以再注册/清空监听器
        let targets: Vec<EventListener> = {
            let listeners = self.listeners.read();
            listeners
                .get(event.event_type())
                .into_iter()
                .chain(listeners.get("*"))
                .flat_map(|v| v.iter().cloned())
                .collect()
        };

        // 无订阅者时 send 会失败，属正常场景（无 UI 客户端）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        for listener in targets {
            listener(&event);
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器（"*" 表示所有事件）
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        let count = {
            let mut listeners = self.listeners.write();
            listeners
                .entry(event_type.to_string())
                .or_default()
                .push(Arc::new(listener));
            listeners.values().map(|v| v.len()).sum()
        };
        self.stats.write().listener_count = count;
        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 带过滤的事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<FeedEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<FeedEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<FeedEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件构建器辅助函数
pub mod event_builders {
    use super::*;

    pub fn phase_changed(scope: ScopeKey, old_phase: SyncPhase, new_phase: SyncPhase) -> FeedEvent {
        FeedEvent::PhaseChanged {
            scope,
            old_phase,
            new_phase,
            timestamp: now_millis(),
        }
    }

    pub fn fetch_failed(scope: ScopeKey, error: String) -> FeedEvent {
        FeedEvent::FetchFailed {
            scope,
            error,
            timestamp: now_millis(),
        }
    }

    pub fn message_sent(scope: ScopeKey, message_id: String) -> FeedEvent {
        FeedEvent::MessageSent {
            scope,
            message_id,
            timestamp: now_millis(),
        }
    }

    pub fn message_send_failed(scope: ScopeKey, error: String) -> FeedEvent {
        FeedEvent::MessageSendFailed {
            scope,
            error,
            timestamp: now_millis(),
        }
    }
}
