//! 实时列表同步器
//!
//! 把推送事件合并进缓存支撑的有序列表：
//!
//! ```text
//! mount(scope) ──► Subscribing ──(首次拉取完成)──► Synced ──► unmount/切换 ──► TornDown
//!                      │                             │
//!                 推送 → 覆盖层                 缓存更新 → 对账覆盖层
//!                      └────────── 每次都输出一份完整的渲染列表 ──────────┘
//! ```
//!
//! 所有状态在一把 `parking_lot::Mutex` 下修改，推送处理和缓存更新互相原子。
//! 推送处理器是同步闭包，不会挂起。

use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{FeedSnapshot, SyncPhase, SyncStats};
use crate::api::FeedStore;
use crate::config::{LiveFeedConfig, ReconcilePolicy};
use crate::error::{LiveFeedError, Result};
use crate::events::{event_builders, EventManager, FeedEvent};
use crate::feed::{merge, reconcile_overlay, FeedItem, FeedRecord, OverlayInsert, OverlaySet, PushMessage, ScopeKey};
use crate::push::{HandlerId, PushChannel, PushEnvelope};
use crate::query::{QueryKey, QueryState, QueryUpdate};
use crate::utils::{now_millis, FeedClock, SystemClock};

struct SyncState {
    scope: ScopeKey,
    phase: SyncPhase,
    /// 当前挂载的拆除守卫，处理器创建时捕获
    guard: Arc<AtomicBool>,
    handler: Option<HandlerId>,
    base: Vec<FeedItem>,
    /// 已应用的缓存数据版本
    base_version: u64,
    overlay: OverlaySet,
    fetch_error: Option<String>,
    connection_error: Option<String>,
    revision: u64,
    last: FeedSnapshot,
    stats: SyncStats,
}

struct SyncCore {
    resource: String,
    policy: ReconcilePolicy,
    clock: Arc<dyn FeedClock>,
    events: Arc<EventManager>,
    state: Mutex<SyncState>,
    /// 串行化"修改状态 + 发布事件"，事件顺序与状态顺序一致；
    /// 可重入，监听器里可以再调用 unmount
    emit_lock: ReentrantMutex<()>,
    push: Arc<PushChannel>,
    listener: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl SyncCore {
    fn key_for(&self, scope: &ScopeKey) -> QueryKey {
        QueryKey::new(self.resource.clone(), scope.clone())
    }

    fn publish(&self, events: Vec<FeedEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn set_phase(&self, state: &mut SyncState, new_phase: SyncPhase) -> Option<FeedEvent> {
        let old_phase = state.phase;
        if old_phase == new_phase {
            return None;
        }
        state.phase = new_phase;
        info!("🔄 作用域阶段变化: {} {} → {}", state.scope, old_phase, new_phase);
        Some(event_builders::phase_changed(state.scope.clone(), old_phase, new_phase))
    }

    /// 重新计算渲染列表（仅在推送和基础列表变化时调用）
    fn render(&self, state: &mut SyncState) -> FeedSnapshot {
        state.revision += 1;
        state.stats.emissions += 1;
        let overlay = state.overlay.items(&state.scope);
        let snapshot = FeedSnapshot {
            scope: state.scope.clone(),
            phase: state.phase,
            items: merge(&state.base, overlay),
            overlay_len: overlay.len(),
            fetch_error: state.fetch_error.clone(),
            connection_error: state.connection_error.clone(),
            revision: state.revision,
            emitted_at: now_millis(),
        };
        state.last = snapshot.clone();
        snapshot
    }

    fn handle_push(&self, guard: &AtomicBool, envelope: &PushEnvelope) {
        let _emit = self.emit_lock.lock();
        let snapshot = {
            let mut state = self.state.lock();
            if guard.load(Ordering::SeqCst) {
                debug!("作用域已拆除，忽略迟到的推送");
                return;
            }
            state.stats.pushes_received += 1;

            let message: PushMessage = match serde_json::from_value(envelope.payload.clone()) {
                Ok(message) => message,
                Err(e) => {
                    warn!("⚠️ 无法解析推送负载，忽略: {}", e);
                    state.stats.pushes_ignored += 1;
                    return;
                }
            };
            if !message.belongs_to(&state.scope) {
                debug!("推送属于其他作用域 {:?}，忽略", message.channel_id);
                state.stats.pushes_ignored += 1;
                return;
            }

            let id = message.resolve_id();
            let scope = state.scope.clone();
            if state.base.iter().any(|item| item.id == id) {
                debug!("🔄 推送已在基础列表中: scope={}, id={}", scope, id);
                state.stats.duplicates_dropped += 1;
            } else {
                let sort_key = self.clock.now_millis();
                let arrival = state.overlay.next_arrival();
                let payload = message.into_payload();
                debug!("📨 推送写入覆盖层: scope={}, id={}, {}", scope, id, payload.summary());
                let item = FeedItem::live(id, payload, sort_key, arrival);
                let (outcome, evicted) = state.overlay.insert(&scope, item, sort_key);
                if outcome == OverlayInsert::Duplicate {
                    state.stats.duplicates_dropped += 1;
                }
                state.stats.overlay_evictions += evicted as u64;
            }
            self.render(&mut state)
        };
        self.events.emit(FeedEvent::SnapshotUpdated(snapshot));
    }

    fn apply_update(&self, update: QueryUpdate<Vec<FeedRecord>>) {
        if update.key.resource != self.resource {
            return;
        }
        let _emit = self.emit_lock.lock();
        let events = {
            let mut state = self.state.lock();
            if !state.phase.is_active() || update.key.scope != state.scope {
                debug!("丢弃非当前作用域的拉取结果: {}", update.key);
                state.stats.late_results_discarded += 1;
                return;
            }
            self.apply_state(&mut state, &update.state)
        };
        self.publish(events);
    }

    /// 广播积压时按缓存当前值重新同步
    fn resync(&self, store: &FeedStore) {
        let _emit = self.emit_lock.lock();
        let events = {
            let mut state = self.state.lock();
            if !state.phase.is_active() {
                return;
            }
            let key = self.key_for(&state.scope);
            match store.get(&key) {
                Some(query) => self.apply_state(&mut state, &query),
                None => Vec::new(),
            }
        };
        self.publish(events);
    }

    /// 应用一次已完成的拉取：替换基础列表、对账覆盖层、进入 Synced
    fn apply_state(&self, state: &mut SyncState, query: &QueryState<Vec<FeedRecord>>) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        if !query.is_settled() {
            return events;
        }

        if let Some(data) = &query.data {
            if query.data_version > state.base_version {
                // 已经 Synced 说明这是一次后续的成功刷新
                let refetch = state.phase == SyncPhase::Synced;
                state.base = data.iter().map(FeedItem::persisted).collect();
                state.base_version = query.data_version;
                let scope = state.scope.clone();
                if let Some(next) = reconcile_overlay(&state.base, state.overlay.items(&scope), self.policy, refetch) {
                    debug!(
                        "✅ 基础列表已刷新，对账覆盖层: scope={}, {} → {} 条",
                        scope,
                        state.overlay.len(&scope),
                        next.len()
                    );
                    state.overlay.replace(&scope, next);
                }
            }
        }

        state.fetch_error = query.error.as_ref().map(|e| e.to_string());
        if let Some(phase_event) = self.set_phase(state, SyncPhase::Synced) {
            events.push(phase_event);
        }
        if let Some(error) = &state.fetch_error {
            warn!("⚠️ 基础列表拉取失败，保留当前列表: scope={}, {}", state.scope, error);
            events.push(event_builders::fetch_failed(state.scope.clone(), error.clone()));
        }
        events.push(FeedEvent::SnapshotUpdated(self.render(state)));
        events
    }

    /// 拆除当前作用域：注销处理器、丢弃覆盖层，之后的迟到事件都是空操作
    fn teardown(&self) -> bool {
        let _emit = self.emit_lock.lock();
        let (handler, events) = {
            let mut state = self.state.lock();
            if !state.phase.is_active() {
                return false;
            }
            state.guard.store(true, Ordering::SeqCst);
            let handler = state.handler.take();
            let scope = state.scope.clone();
            let discarded = state.overlay.discard(&scope);
            state.base.clear();
            state.base_version = 0;
            let events: Vec<FeedEvent> = self.set_phase(&mut state, SyncPhase::TornDown).into_iter().collect();
            state.last = FeedSnapshot {
                phase: SyncPhase::TornDown,
                revision: state.revision,
                ..FeedSnapshot::empty(scope.clone())
            };
            info!("🧹 拆除作用域: {}, 丢弃覆盖层 {} 条", scope, discarded);
            (handler, events)
        };
        if let Some(id) = handler {
            self.push.off(id);
        }
        self.publish(events);
        true
    }

    /// 最终拆除（幂等），返回这次调用是否真正执行了销毁
    fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.release();
        info!("同步器已销毁");
        true
    }

    /// 拆除作用域并停止缓存监听任务
    fn release(&self) {
        self.teardown();
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }
}

/// 实时列表同步器
///
/// 同一时刻只挂载一个作用域；切换作用域会先拆除旧作用域。
/// `dispose` 之后的任何调用都返回 `LiveFeedError::Disposed`。
pub struct LiveFeedSynchronizer {
    core: Arc<SyncCore>,
    store: FeedStore,
    push_event_name: String,
    /// 串行化 mount
    mount_lock: tokio::sync::Mutex<()>,
}

/// 同步器的弱引用，SDK 关闭时用来销毁仍然存活的同步器
#[derive(Clone)]
pub(crate) struct SyncHandle(Weak<SyncCore>);

impl SyncHandle {
    /// 同步器已经释放或已销毁时返回 false
    pub(crate) fn dispose(&self) -> bool {
        match self.0.upgrade() {
            Some(core) => core.dispose(),
            None => false,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0
            .upgrade()
            .map(|core| !core.disposed.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

impl LiveFeedSynchronizer {
    pub fn new(
        config: &LiveFeedConfig,
        store: FeedStore,
        push: Arc<PushChannel>,
        events: Arc<EventManager>,
    ) -> Self {
        Self::with_clock(config, store, push, events, Arc::new(SystemClock::new()))
    }

    /// 指定排序键时钟（测试使用 `ManualClock`）
    pub fn with_clock(
        config: &LiveFeedConfig,
        store: FeedStore,
        push: Arc<PushChannel>,
        events: Arc<EventManager>,
        clock: Arc<dyn FeedClock>,
    ) -> Self {
        let state = SyncState {
            scope: ScopeKey::disabled(),
            phase: SyncPhase::Uninitialized,
            guard: Arc::new(AtomicBool::new(true)),
            handler: None,
            base: Vec::new(),
            base_version: 0,
            overlay: OverlaySet::new(config.overlay_capacity, config.overlay_ttl()),
            fetch_error: None,
            connection_error: None,
            revision: 0,
            last: FeedSnapshot::empty(ScopeKey::disabled()),
            stats: SyncStats::default(),
        };
        Self {
            core: Arc::new(SyncCore {
                resource: config.resource_name.clone(),
                policy: config.reconcile_policy,
                clock,
                events,
                state: Mutex::new(state),
                emit_lock: ReentrantMutex::new(()),
                push,
                listener: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
            store,
            push_event_name: config.push_event_name.clone(),
            mount_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 挂载作用域
    ///
    /// 拆除旧作用域，连接推送通道（失败时降级为仅缓存），注册推送处理器，
    /// 然后触发拉取。返回挂载后的第一份渲染列表。
    pub async fn mount<S: Into<ScopeKey>>(&self, scope: S) -> Result<FeedSnapshot> {
        self.ensure_active()?;
        let scope = scope.into();
        let _mounting = self.mount_lock.lock().await;
        self.ensure_active()?;

        self.core.teardown();

        if scope.is_disabled() {
            debug!("作用域为空，不订阅也不拉取");
            let mut state = self.core.state.lock();
            state.scope = scope.clone();
            state.phase = SyncPhase::Uninitialized;
            state.last = FeedSnapshot {
                revision: state.revision,
                ..FeedSnapshot::empty(scope)
            };
            return Ok(state.last.clone());
        }

        self.ensure_listener();
        let guard = Arc::new(AtomicBool::new(false));
        let handler = self.register_handler(guard.clone());
        {
            let _emit = self.core.emit_lock.lock();
            let events: Vec<FeedEvent> = {
                let mut state = self.core.state.lock();
                state.scope = scope.clone();
                state.guard = guard.clone();
                state.handler = Some(handler);
                state.base.clear();
                state.base_version = 0;
                state.fetch_error = None;
                state.connection_error = None;
                state.stats.mounts += 1;
                self.core.set_phase(&mut state, SyncPhase::Subscribing).into_iter().collect()
            };
            self.core.publish(events);
        }
        info!("📡 挂载作用域: {}", scope);

        let connection_error = match self.core.push.connect().await {
            Ok(()) => None,
            Err(e) => {
                warn!("⚠️ 推送通道不可用，降级为仅缓存模式: {}", e);
                Some(e.to_string())
            }
        };

        if self.is_disposed() {
            debug!("挂载期间同步器已被销毁: {}", scope);
            self.core.release();
            return Err(LiveFeedError::Disposed);
        }
        if guard.load(Ordering::SeqCst) {
            debug!("挂载期间作用域已被拆除: {}", scope);
            return Ok(self.core.state.lock().last.clone());
        }

        let query = self.store.fetch(&self.core.key_for(&scope));

        let _emit = self.core.emit_lock.lock();
        let (events, snapshot) = {
            let mut state = self.core.state.lock();
            if guard.load(Ordering::SeqCst) {
                return Ok(state.last.clone());
            }
            state.connection_error = connection_error;
            // 缓存里已有结果时直接进入 Synced
            let mut events = self.core.apply_state(&mut state, &query);
            if events.is_empty() {
                events.push(FeedEvent::SnapshotUpdated(self.core.render(&mut state)));
            }
            (events, state.last.clone())
        };
        self.core.publish(events);
        Ok(snapshot)
    }

    /// 卸载当前作用域
    pub fn unmount(&self) -> Result<()> {
        self.ensure_active()?;
        self.core.teardown();
        Ok(())
    }

    /// 手动刷新当前作用域（推送通道断开时也可用）
    pub fn refresh(&self) -> Result<()> {
        self.ensure_active()?;
        let key = {
            let state = self.core.state.lock();
            state.phase.is_active().then(|| self.core.key_for(&state.scope))
        };
        match key {
            Some(key) => {
                debug!("🔄 手动刷新: {}", key);
                self.store.invalidate(&key);
            }
            None => debug!("没有已挂载的作用域，忽略刷新"),
        }
        Ok(())
    }

    /// 最近一次输出的渲染列表
    pub fn snapshot(&self) -> Result<FeedSnapshot> {
        self.ensure_active()?;
        Ok(self.core.state.lock().last.clone())
    }

    pub fn current_scope(&self) -> Result<ScopeKey> {
        self.ensure_active()?;
        Ok(self.core.state.lock().scope.clone())
    }

    pub fn stats(&self) -> SyncStats {
        self.core.state.lock().stats.clone()
    }

    pub fn store(&self) -> &FeedStore {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.core.events
    }

    /// 最终拆除（幂等）
    pub fn dispose(&self) {
        self.core.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn handle(&self) -> SyncHandle {
        SyncHandle(Arc::downgrade(&self.core))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(LiveFeedError::Disposed);
        }
        Ok(())
    }

    fn register_handler(&self, guard: Arc<AtomicBool>) -> HandlerId {
        let core: Weak<SyncCore> = Arc::downgrade(&self.core);
        self.core.push.on(&self.push_event_name, move |envelope| {
            if let Some(core) = core.upgrade() {
                core.handle_push(&guard, envelope);
            }
        })
    }

    /// 启动缓存更新监听任务（整个同步器生命周期只需要一个）
    fn ensure_listener(&self) {
        let mut listener = self.core.listener.lock();
        if listener.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return;
        }

        // 先订阅再拉取，不会漏掉首次拉取的结果
        let mut receiver = self.store.subscribe();
        let weak_core: Weak<SyncCore> = Arc::downgrade(&self.core);
        let store = self.store.clone();
        *listener = Some(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(update) => {
                        let Some(core) = weak_core.upgrade() else {
                            break;
                        };
                        core.apply_update(update);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let Some(core) = weak_core.upgrade() else {
                            break;
                        };
                        warn!("⚠️ 缓存更新积压，跳过 {} 条，按当前缓存重新同步", skipped);
                        core.resync(&store);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("缓存更新监听任务退出");
        }));
    }
}

impl Drop for LiveFeedSynchronizer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_helpers::FakeFeedApi;
    use crate::api::HistoryFetcher;
    use crate::feed::Origin;
    use crate::push::LocalPushTransport;
    use crate::query::QueryStore;
    use crate::utils::ManualClock;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        api: Arc<FakeFeedApi>,
        transport: Arc<LocalPushTransport>,
        push: Arc<PushChannel>,
        events: Arc<EventManager>,
        store: FeedStore,
        clock: ManualClock,
        sync: LiveFeedSynchronizer,
    }

    fn harness_with(config: LiveFeedConfig) -> Harness {
        let api = FakeFeedApi::new();
        let store: FeedStore = QueryStore::new(Arc::new(HistoryFetcher::new(api.clone(), 50)), 64);
        let transport = LocalPushTransport::new(16);
        let push = PushChannel::new(transport.clone());
        let events = Arc::new(EventManager::new(256));
        let clock = ManualClock::new(1_000);
        let sync = LiveFeedSynchronizer::with_clock(
            &config,
            store.clone(),
            push.clone(),
            events.clone(),
            Arc::new(clock.clone()),
        );
        Harness {
            api,
            transport,
            push,
            events,
            store,
            clock,
            sync,
        }
    }

    fn harness() -> Harness {
        harness_with(LiveFeedConfig::default())
    }

    fn record(id: &str, ts: u64) -> FeedRecord {
        FeedRecord::new(id, "u1", format!("content {}", id), ts)
    }

    fn push_message(h: &Harness, payload: Value) -> usize {
        h.push.dispatch(&PushEnvelope::new("ReceiveMessage", payload))
    }

    async fn wait_snapshot<F>(rx: &mut broadcast::Receiver<FeedEvent>, predicate: F) -> FeedSnapshot
    where
        F: Fn(&FeedSnapshot) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                if let FeedEvent::SnapshotUpdated(snapshot) = rx.recv().await.unwrap() {
                    if predicate(&snapshot) {
                        return snapshot;
                    }
                }
            }
        })
        .await
        .unwrap()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_push_before_initial_fetch_is_kept() {
        let h = harness();
        let gate = h.api.gate("c1");
        let mut rx = h.events.subscribe();

        let mounted = h.sync.mount("c1").await.unwrap();
        assert_eq!(mounted.phase, SyncPhase::Subscribing);
        assert!(mounted.items.is_empty());

        assert_eq!(push_message(&h, json!({ "id": "m1", "senderId": "u1", "content": "hi" })), 1);
        let during = h.sync.snapshot().unwrap();
        assert_eq!(during.phase, SyncPhase::Subscribing);
        assert_eq!(during.ids(), vec!["m1"]);

        gate.add_permits(1);
        let synced = wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;
        assert_eq!(synced.ids(), vec!["m1"]);
        assert_eq!(synced.items[0].origin, Origin::Live);
        assert_eq!(synced.overlay_len, 1);
        assert!(synced.fetch_error.is_none());
    }

    #[tokio::test]
    async fn test_refetch_confirms_live_item() {
        let h = harness();
        let gate = h.api.gate("c1");
        let mut rx = h.events.subscribe();

        h.sync.mount("c1").await.unwrap();
        push_message(&h, json!({ "id": "m1", "senderId": "u1", "content": "hi" }));
        h.api.push_history("c1", Ok(vec![record("m1", 500)]));
        gate.add_permits(1);

        let synced = wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;
        assert_eq!(synced.ids(), vec!["m1"]);
        assert_eq!(synced.items[0].origin, Origin::Persisted);
        assert_eq!(synced.items[0].sort_key, 500);
        assert_eq!(synced.overlay_len, 0);
    }

    #[tokio::test]
    async fn test_refetch_clears_push_without_id() {
        let h = harness();
        let mut rx = h.events.subscribe();

        h.sync.mount("c1").await.unwrap();
        wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;

        push_message(&h, json!({ "senderId": "u1", "content": "hi" }));
        assert_eq!(h.sync.snapshot().unwrap().overlay_len, 1);

        h.api.push_history("c1", Ok(vec![record("srv-1", 1_500)]));
        h.sync.refresh().unwrap();
        let refreshed = wait_snapshot(&mut rx, |s| s.ids().contains(&"srv-1")).await;
        assert_eq!(refreshed.ids(), vec!["srv-1"]);
        assert_eq!(refreshed.items[0].origin, Origin::Persisted);
        assert_eq!(refreshed.overlay_len, 0);
        assert_eq!(refreshed.live_count(), 0);
    }

    #[tokio::test]
    async fn test_prune_policy_drops_local_ids_on_refetch() {
        let config = LiveFeedConfig::builder()
            .reconcile_policy(ReconcilePolicy::PruneConfirmed)
            .build();
        let h = harness_with(config);
        let mut rx = h.events.subscribe();

        h.sync.mount("c1").await.unwrap();
        wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;

        push_message(&h, json!({ "senderId": "u1", "content": "no id" }));
        h.clock.advance(10);
        push_message(&h, json!({ "id": "m2", "senderId": "u2", "content": "pending" }));

        h.api.push_history("c1", Ok(vec![record("srv-1", 900)]));
        h.sync.refresh().unwrap();
        let refreshed = wait_snapshot(&mut rx, |s| s.ids().contains(&"srv-1")).await;
        assert_eq!(refreshed.ids(), vec!["m2", "srv-1"]);
        assert_eq!(refreshed.overlay_len, 1);
    }

    #[tokio::test]
    async fn test_prune_policy_keeps_unconfirmed_items() {
        let config = LiveFeedConfig::builder()
            .reconcile_policy(ReconcilePolicy::PruneConfirmed)
            .build();
        let h = harness_with(config);
        let gate = h.api.gate("c1");
        let mut rx = h.events.subscribe();

        h.sync.mount("c1").await.unwrap();
        push_message(&h, json!({ "id": "m1", "senderId": "u1", "content": "a" }));
        push_message(&h, json!({ "id": "m2", "senderId": "u1", "content": "b" }));
        h.api.push_history("c1", Ok(vec![record("m1", 500)]));
        gate.add_permits(1);

        let synced = wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;
        assert_eq!(synced.overlay_len, 1);
        assert_eq!(synced.ids(), vec!["m2", "m1"]);
        assert_eq!(synced.live_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_pushes_collapse() {
        let h = harness();
        let _gate = h.api.gate("c1");
        let mut rx = h.events.subscribe();

        h.sync.mount("c1").await.unwrap();
        let payload = json!({ "id": "m1", "senderId": "u1", "content": "hi" });
        push_message(&h, payload.clone());
        push_message(&h, payload);

        let snapshot = h.sync.snapshot().unwrap();
        assert_eq!(snapshot.ids(), vec!["m1"]);
        let stats = h.sync.stats();
        assert_eq!(stats.pushes_received, 2);
        assert_eq!(stats.duplicates_dropped, 1);
        // 挂载一次 + 每个推送一次
        assert_eq!(stats.emissions, 3);

        let first = wait_snapshot(&mut rx, |s| s.revision == 2).await;
        let second = wait_snapshot(&mut rx, |s| s.revision == 3).await;
        assert_eq!(first.items, second.items);
    }

    #[tokio::test]
    async fn test_push_for_persisted_id_is_dropped() {
        let h = harness();
        h.api.push_history("c1", Ok(vec![record("m1", 500)]));
        let mut rx = h.events.subscribe();

        h.sync.mount("c1").await.unwrap();
        wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;

        push_message(&h, json!({ "id": "m1", "senderId": "u1", "content": "again" }));
        let snapshot = h.sync.snapshot().unwrap();
        assert_eq!(snapshot.ids(), vec!["m1"]);
        assert_eq!(snapshot.items[0].origin, Origin::Persisted);
        assert_eq!(snapshot.overlay_len, 0);
        assert_eq!(h.sync.stats().duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn test_render_order() {
        let h = harness();
        h.api.push_history(
            "c1",
            Ok(vec![record("p2", 2_000), record("p3", 1_000), record("p1", 500)]),
        );
        let mut rx = h.events.subscribe();

        h.sync.mount("c1").await.unwrap();
        wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;

        push_message(&h, json!({ "id": "l1", "senderId": "u2", "content": "x" }));
        push_message(&h, json!({ "id": "l2", "senderId": "u2", "content": "y" }));
        h.clock.advance(5_000);
        push_message(&h, json!({ "id": "l3", "senderId": "u2", "content": "z" }));

        let snapshot = h.sync.snapshot().unwrap();
        assert_eq!(snapshot.ids(), vec!["l3", "p2", "l2", "l1", "p3", "p1"]);
        assert!(snapshot.items.windows(2).all(|w| w[0].sort_key >= w[1].sort_key));
    }

    #[tokio::test]
    async fn test_push_without_id_or_for_other_scope() {
        let h = harness();
        let _gate = h.api.gate("c1");
        h.sync.mount("c1").await.unwrap();

        push_message(&h, json!({ "senderId": "u1", "content": "no id" }));
        push_message(&h, json!({ "id": "x", "senderId": "u1", "content": "elsewhere", "channelId": "c9" }));
        push_message(&h, json!({ "unexpected": true }));

        let snapshot = h.sync.snapshot().unwrap();
        assert_eq!(snapshot.items.len(), 1);
        assert!(snapshot.items[0].id.starts_with("live-"));
        let stats = h.sync.stats();
        assert_eq!(stats.pushes_received, 3);
        assert_eq!(stats.pushes_ignored, 2);
        assert_eq!(stats.emissions, 2);
    }

    #[tokio::test]
    async fn test_unmount_silences_late_results() {
        let h = harness();
        let gate = h.api.gate("c1");
        h.api.push_history("c1", Ok(vec![record("m1", 100)]));

        h.sync.mount("c1").await.unwrap();
        push_message(&h, json!({ "id": "l1", "senderId": "u1", "content": "hi" }));
        h.sync.unmount().unwrap();

        assert_eq!(h.push.handler_count("ReceiveMessage"), 0);
        let torn_down = h.sync.snapshot().unwrap();
        assert_eq!(torn_down.phase, SyncPhase::TornDown);
        assert!(torn_down.items.is_empty());

        let emissions = h.sync.stats().emissions;
        let mut updates = h.store.subscribe();
        gate.add_permits(1);
        timeout(Duration::from_secs(2), updates.recv()).await.unwrap().unwrap();
        settle().await;

        assert_eq!(push_message(&h, json!({ "id": "l2", "senderId": "u1", "content": "late" })), 0);
        assert_eq!(h.sync.stats().emissions, emissions);
        assert_eq!(h.sync.stats().late_results_discarded, 1);
        assert_eq!(h.sync.snapshot().unwrap().phase, SyncPhase::TornDown);
    }

    #[tokio::test]
    async fn test_scope_switch_discards_old_fetch() {
        let h = harness();
        let gate = h.api.gate("c1");
        h.api.push_history("c1", Ok(vec![record("old", 100)]));
        h.api.push_history("c2", Ok(vec![record("m2", 200)]));
        let mut rx = h.events.subscribe();
        let mut updates = h.store.subscribe();

        h.sync.mount("c1").await.unwrap();
        h.sync.mount("c2").await.unwrap();
        let synced = wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;
        assert_eq!(synced.scope.as_str(), "c2");
        assert_eq!(synced.ids(), vec!["m2"]);

        gate.add_permits(1);
        loop {
            let update = timeout(Duration::from_secs(2), updates.recv()).await.unwrap().unwrap();
            if update.key.scope.as_str() == "c1" {
                break;
            }
        }
        settle().await;

        let current = h.sync.snapshot().unwrap();
        assert_eq!(current.scope.as_str(), "c2");
        assert_eq!(current.ids(), vec!["m2"]);
        assert_eq!(h.sync.stats().late_results_discarded, 1);
        assert_eq!(h.push.handler_count("ReceiveMessage"), 1);
    }

    #[tokio::test]
    async fn test_initial_fetch_failure_keeps_overlay() {
        let h = harness();
        let gate = h.api.gate("c1");
        h.api.push_history("c1", Err(LiveFeedError::Connection("offline".into())));
        let mut rx = h.events.subscribe();

        h.sync.mount("c1").await.unwrap();
        push_message(&h, json!({ "id": "m1", "senderId": "u1", "content": "hi" }));
        gate.add_permits(1);

        let synced = wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;
        assert_eq!(synced.ids(), vec!["m1"]);
        assert!(synced.fetch_error.as_deref().unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_base() {
        let h = harness();
        h.api.push_history("c1", Ok(vec![record("m1", 100)]));
        h.api.push_history("c1", Err(LiveFeedError::Timeout("slow".into())));
        let mut rx = h.events.subscribe();
        let mut failures = h
            .events
            .subscribe_filtered(crate::events::EventFilter::new().with_event_types(vec!["fetch_failed".into()]));

        h.sync.mount("c1").await.unwrap();
        wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;

        h.sync.refresh().unwrap();
        let failed = wait_snapshot(&mut rx, |s| s.fetch_error.is_some()).await;
        assert_eq!(failed.ids(), vec!["m1"]);
        assert_eq!(failed.items[0].origin, Origin::Persisted);

        let event = timeout(Duration::from_secs(2), failures.recv()).await.unwrap().unwrap();
        assert_eq!(event.scope().as_str(), "c1");
    }

    #[tokio::test]
    async fn test_connection_failure_degrades_to_cache_only() {
        let h = harness();
        h.transport.fail_next_opens(1);
        h.api.push_history("c1", Ok(vec![record("m1", 100)]));
        let mut rx = h.events.subscribe();

        let mounted = h.sync.mount("c1").await.unwrap();
        assert!(mounted.connection_error.is_some());

        let synced = wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;
        assert_eq!(synced.ids(), vec!["m1"]);
        assert!(synced.connection_error.is_some());

        // 手动刷新仍然可用
        h.sync.refresh().unwrap();
        settle().await;
        assert_eq!(h.api.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_disabled_scope_stays_idle() {
        let h = harness();
        let snapshot = h.sync.mount("").await.unwrap();
        assert_eq!(snapshot.phase, SyncPhase::Uninitialized);
        settle().await;

        assert_eq!(h.api.fetch_count(), 0);
        assert_eq!(h.push.handler_count("ReceiveMessage"), 0);
        assert_eq!(h.transport.open_count(), 0);
        h.sync.refresh().unwrap();
        settle().await;
        assert_eq!(h.api.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_cached_scope_mounts_synced() {
        let h = harness();
        h.api.push_history("c1", Ok(vec![record("m1", 100)]));
        let mut rx = h.events.subscribe();

        h.sync.mount("c1").await.unwrap();
        wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;
        h.sync.mount("c2").await.unwrap();

        let again = h.sync.mount("c1").await.unwrap();
        assert_eq!(again.phase, SyncPhase::Synced);
        assert_eq!(again.ids(), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_overlay_capacity_evicts() {
        let config = LiveFeedConfig::builder().overlay_capacity(2).build();
        let h = harness_with(config);
        let _gate = h.api.gate("c1");
        h.sync.mount("c1").await.unwrap();

        for id in ["a", "b", "c"] {
            h.clock.advance(1);
            push_message(&h, json!({ "id": id, "senderId": "u1", "content": id }));
        }

        let snapshot = h.sync.snapshot().unwrap();
        assert_eq!(snapshot.ids(), vec!["c", "b"]);
        assert_eq!(snapshot.overlay_len, 2);
        assert_eq!(h.sync.stats().overlay_evictions, 1);
    }

    #[tokio::test]
    async fn test_pushes_arrive_through_transport() {
        let h = harness();
        let _gate = h.api.gate("c1");
        let mut rx = h.events.subscribe();
        h.sync.mount("c1").await.unwrap();

        h.transport
            .inject(PushEnvelope::new(
                "ReceiveMessage",
                json!({ "id": "m1", "senderId": "u1", "content": "over the wire" }),
            ))
            .await
            .unwrap();

        let snapshot = wait_snapshot(&mut rx, |s| !s.items.is_empty()).await;
        assert_eq!(snapshot.ids(), vec!["m1"]);
        assert_eq!(snapshot.items[0].payload.content, "over the wire");
    }

    #[tokio::test]
    async fn test_use_after_dispose() {
        let h = harness();
        h.sync.mount("c1").await.unwrap();
        h.sync.dispose();
        h.sync.dispose();

        assert_eq!(h.push.handler_count("ReceiveMessage"), 0);
        assert_eq!(h.sync.mount("c2").await.unwrap_err(), LiveFeedError::Disposed);
        assert_eq!(h.sync.snapshot().unwrap_err(), LiveFeedError::Disposed);
        assert_eq!(h.sync.unmount().unwrap_err(), LiveFeedError::Disposed);
        assert_eq!(h.sync.refresh().unwrap_err(), LiveFeedError::Disposed);
    }
}
