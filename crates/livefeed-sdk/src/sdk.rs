//! LiveFeed SDK 入口
//!
//! 组装进程级共享的组件：
//!
//! ```text
//! LiveFeedSdk
//! ├── FeedStore (QueryStore<Vec<FeedRecord>>)   ← HistoryFetcher ← FeedApi
//! ├── Arc<PushChannel>                          ← PushTransport
//! ├── Arc<EventManager>
//! └── MutationDispatcher
//! ```
//!
//! 每个视图通过 `synchronizer()` 拿到自己的同步器，共享同一份缓存和推送连接。
//! SDK 只持有同步器的弱引用；`shutdown` 时销毁仍然存活的同步器。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::api::{FeedApi, FeedStore, HistoryFetcher, HttpFeedApi};
use crate::config::LiveFeedConfig;
use crate::error::{LiveFeedError, Result};
use crate::events::{EventManager, FeedEvent};
use crate::feed::ScopeKey;
use crate::mutation::{MessageDraft, MutationDispatcher, SendReceipt};
use crate::push::{PushChannel, PushTransport};
use crate::query::QueryStore;
use crate::sync::{LiveFeedSynchronizer, SyncHandle};
use crate::version::SDK_VERSION;

pub struct LiveFeedSdk {
    config: LiveFeedConfig,
    store: FeedStore,
    push: Arc<PushChannel>,
    events: Arc<EventManager>,
    dispatcher: MutationDispatcher,
    synchronizers: Mutex<Vec<SyncHandle>>,
    shutting_down: AtomicBool,
}

impl LiveFeedSdk {
    /// 初始化 SDK
    pub fn initialize(
        config: LiveFeedConfig,
        api: Arc<dyn FeedApi>,
        transport: Arc<dyn PushTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        info!("正在初始化 LiveFeedSdk v{}...", SDK_VERSION);

        let fetcher = Arc::new(HistoryFetcher::new(api.clone(), config.history_page_size));
        let store: FeedStore = QueryStore::new(fetcher, config.query_buffer_size);
        let push = PushChannel::new(transport);
        let events = Arc::new(EventManager::new(config.event_buffer_size));
        let dispatcher = MutationDispatcher::new(&config, api, store.clone(), events.clone());

        info!(
            "✅ LiveFeedSdk 初始化完成 (resource={}, push_event={})",
            config.resource_name, config.push_event_name
        );
        Ok(Arc::new(Self {
            config,
            store,
            push,
            events,
            dispatcher,
            synchronizers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// 使用 HTTP 接口初始化（要求配置 api_base_url）
    pub fn initialize_http(config: LiveFeedConfig, transport: Arc<dyn PushTransport>) -> Result<Arc<Self>> {
        let api = Arc::new(HttpFeedApi::from_config(&config)?);
        Self::initialize(config, api, transport)
    }

    /// 为一个视图创建同步器
    pub fn synchronizer(&self) -> Result<LiveFeedSynchronizer> {
        self.ensure_running()?;
        let synchronizer = LiveFeedSynchronizer::new(
            &self.config,
            self.store.clone(),
            self.push.clone(),
            self.events.clone(),
        );
        let mut synchronizers = self.synchronizers.lock();
        synchronizers.retain(SyncHandle::is_alive);
        synchronizers.push(synchronizer.handle());
        Ok(synchronizer)
    }

    /// 仍然存活（未释放且未销毁）的同步器数量
    pub fn active_synchronizers(&self) -> usize {
        self.synchronizers.lock().iter().filter(|handle| handle.is_alive()).count()
    }

    /// 发送消息
    pub async fn send_message(&self, scope: &ScopeKey, content: &str) -> Result<SendReceipt> {
        self.ensure_running()?;
        self.dispatcher.send(scope, content).await
    }

    /// 发送草稿
    pub async fn send_draft(&self, draft: &mut MessageDraft) -> Result<SendReceipt> {
        self.ensure_running()?;
        self.dispatcher.send_draft(draft).await
    }

    /// 订阅视图事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &LiveFeedConfig {
        &self.config
    }

    pub fn store(&self) -> &FeedStore {
        &self.store
    }

    pub fn push_channel(&self) -> &Arc<PushChannel> {
        &self.push
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn dispatcher(&self) -> &MutationDispatcher {
        &self.dispatcher
    }

    /// 关闭 SDK：销毁所有仍然存活的同步器（注销它们的推送处理器），
    /// 再断开推送连接。之后 SDK 和这些同步器的调用都返回 `Disposed`
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭 LiveFeedSdk...");
        let handles = std::mem::take(&mut *self.synchronizers.lock());
        let disposed = handles.iter().filter(|handle| handle.dispose()).count();
        if disposed > 0 {
            info!("已销毁 {} 个同步器", disposed);
        }
        self.push.disconnect().await;
        info!("LiveFeedSdk 关闭完成");
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(LiveFeedError::Disposed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_helpers::FakeFeedApi;
    use crate::feed::{FeedRecord, Origin};
    use crate::push::{ConnectionStatus, LocalPushTransport, PushEnvelope};
    use crate::sync::{FeedSnapshot, SyncPhase};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

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

    #[tokio::test]
    async fn test_send_then_push_then_confirm() {
        let api = FakeFeedApi::new();
        let transport = LocalPushTransport::new(16);
        let sdk = LiveFeedSdk::initialize(LiveFeedConfig::default(), api.clone(), transport.clone()).unwrap();
        let mut rx = sdk.subscribe_events();

        let view = sdk.synchronizer().unwrap();
        view.mount("c1").await.unwrap();
        wait_snapshot(&mut rx, |s| s.phase == SyncPhase::Synced).await;
        assert_eq!(sdk.push_channel().status(), ConnectionStatus::Connected);

        // 服务端分配 srv-1，先经由推送到达，再经由刷新确认
        let receipt = sdk.send_message(&ScopeKey::new("c1"), "hello").await.unwrap();
        assert_eq!(receipt.id, "srv-1");
        transport
            .inject(PushEnvelope::new(
                "ReceiveMessage",
                json!({ "id": "srv-1", "senderId": "me", "content": "hello", "channelId": "c1" }),
            ))
            .await
            .unwrap();
        api.push_history("c1", Ok(vec![FeedRecord::new("srv-1", "me", "hello", 5_000)]));
        view.refresh().unwrap();

        let confirmed = wait_snapshot(&mut rx, |s| {
            s.items.iter().any(|item| item.id == "srv-1" && item.origin == Origin::Persisted)
        })
        .await;
        assert_eq!(confirmed.ids(), vec!["srv-1"]);
        assert_eq!(confirmed.overlay_len, 0);
    }

    #[tokio::test]
    async fn test_views_share_push_connection() {
        let api = FakeFeedApi::new();
        let transport = LocalPushTransport::new(16);
        let sdk = LiveFeedSdk::initialize(LiveFeedConfig::default(), api, transport.clone()).unwrap();

        let a = sdk.synchronizer().unwrap();
        let b = sdk.synchronizer().unwrap();
        a.mount("c1").await.unwrap();
        b.mount("c2").await.unwrap();

        assert_eq!(transport.open_count(), 1);
        assert_eq!(sdk.push_channel().handler_count("ReceiveMessage"), 2);
        drop(a);
        assert_eq!(sdk.push_channel().handler_count("ReceiveMessage"), 1);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let sdk = LiveFeedSdk::initialize(
            LiveFeedConfig::default(),
            FakeFeedApi::new(),
            LocalPushTransport::new(4),
        )
        .unwrap();
        sdk.shutdown().await.unwrap();
        sdk.shutdown().await.unwrap();

        assert!(sdk.is_shutdown());
        assert!(matches!(sdk.synchronizer(), Err(LiveFeedError::Disposed)));
        assert_eq!(
            sdk.send_message(&ScopeKey::new("c1"), "hi").await.unwrap_err(),
            LiveFeedError::Disposed
        );
    }

    #[tokio::test]
    async fn test_shutdown_disposes_live_synchronizers() {
        let sdk = LiveFeedSdk::initialize(
            LiveFeedConfig::default(),
            FakeFeedApi::new(),
            LocalPushTransport::new(4),
        )
        .unwrap();
        let a = sdk.synchronizer().unwrap();
        let b = sdk.synchronizer().unwrap();
        a.mount("c1").await.unwrap();
        b.mount("c2").await.unwrap();
        drop(sdk.synchronizer().unwrap());
        assert_eq!(sdk.active_synchronizers(), 2);
        assert_eq!(sdk.push_channel().handler_count("ReceiveMessage"), 2);

        sdk.shutdown().await.unwrap();

        assert_eq!(sdk.push_channel().handler_count("ReceiveMessage"), 0);
        assert_eq!(sdk.active_synchronizers(), 0);
        assert!(a.is_disposed());
        assert!(b.is_disposed());
        assert_eq!(a.snapshot().unwrap_err(), LiveFeedError::Disposed);
        assert_eq!(b.mount("c3").await.unwrap_err(), LiveFeedError::Disposed);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = LiveFeedConfig::builder().overlay_capacity(0).build();
        let result = LiveFeedSdk::initialize(config, FakeFeedApi::new(), LocalPushTransport::new(4));
        assert!(matches!(result, Err(LiveFeedError::Config(_))));
        assert!(matches!(
            LiveFeedSdk::initialize_http(LiveFeedConfig::default(), LocalPushTransport::new(4)),
            Err(LiveFeedError::Config(_))
        ));
    }
}
