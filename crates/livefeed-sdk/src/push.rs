//! 推送通道
//!
//! 进程内共享的长连接封装，对外只有窄契约：
//! - `connect()`：幂等；并发调用时后来者等待第一个调用的结果
//! - `on(event, handler)` / `off(id)`：同一事件名的处理器按订阅顺序调用，`off` 幂等
//! - 投递语义：至少一次，不同事件名之间无序，上层自行去重
//!
//! 重连/重试策略不在本模块范围内，连接断开后由调用方再次 `connect()`。

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{LiveFeedError, Result};
use crate::utils::now_millis;

/// 推送事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub event: String,
    pub payload: serde_json::Value,
}

impl PushEnvelope {
    pub fn new<S: Into<String>>(event: S, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// 底层连接（WebSocket / SignalR 等由宿主实现）
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// 建立连接，返回事件接收端；接收端关闭表示连接断开
    async fn open(&self) -> Result<mpsc::Receiver<PushEnvelope>>;

    /// 关闭连接
    async fn close(&self);
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 连接失败
    Failed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "未连接"),
            ConnectionStatus::Connecting => write!(f, "连接中"),
            ConnectionStatus::Connected => write!(f, "已连接"),
            ConnectionStatus::Failed => write!(f, "连接失败"),
        }
    }
}

/// 连接状态变化事件
#[derive(Debug, Clone)]
pub struct ConnectionStatusEvent {
    pub old_status: ConnectionStatus,
    pub new_status: ConnectionStatus,
    pub timestamp: u64,
}

/// 处理器标识，`off` 时使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// 推送处理器：同步执行，不允许挂起
pub type PushHandler = Arc<dyn Fn(&PushEnvelope) + Send + Sync>;

struct HandlerEntry {
    id: HandlerId,
    event: String,
    handler: PushHandler,
}

/// 推送通道（进程级共享，使用 `Arc<PushChannel>` 传递）
pub struct PushChannel {
    transport: Arc<dyn PushTransport>,
    /// 串行化 connect，后来者在这里等待
    connect_lock: tokio::sync::Mutex<()>,
    handlers: RwLock<Vec<HandlerEntry>>,
    next_handler_id: AtomicU64,
    status: RwLock<ConnectionStatus>,
    status_sender: broadcast::Sender<ConnectionStatusEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PushChannel {
    pub fn new(transport: Arc<dyn PushTransport>) -> Arc<Self> {
        let (status_sender, _) = broadcast::channel(16);
        Arc::new(Self {
            transport,
            connect_lock: tokio::sync::Mutex::new(()),
            handlers: RwLock::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            status: RwLock::new(ConnectionStatus::Disconnected),
            status_sender,
            pump: Mutex::new(None),
        })
    }

    /// 建立连接（幂等）
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        // 等锁期间可能已被前一个调用者连上
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        self.set_status(ConnectionStatus::Connecting);
        match self.transport.open().await {
            Ok(receiver) => {
                let pump = self.spawn_pump(receiver);
                if let Some(old) = self.pump.lock().replace(pump) {
                    old.abort();
                }
                self.set_status(ConnectionStatus::Connected);
                info!("✅ 推送通道已连接");
                Ok(())
            }
            Err(e) => {
                self.set_status(ConnectionStatus::Failed);
                warn!("⚠️ 推送通道连接失败: {}", e);
                Err(match e {
                    LiveFeedError::Connection(_) => e,
                    other => LiveFeedError::Connection(other.to_string()),
                })
            }
        }
    }

    /// 主动断开
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.transport.close().await;
        self.set_status(ConnectionStatus::Disconnected);
        info!("推送通道已断开");
    }

    /// 订阅事件
    pub fn on<F>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(&PushEnvelope) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::SeqCst));
        let mut handlers = self.handlers.write();
        handlers.push(HandlerEntry {
            id,
            event: event.to_string(),
            handler: Arc::new(handler),
        });
        debug!("注册推送处理器: event={}, id={:?}, 共 {} 个", event, id, handlers.len());
        id
    }

    /// 取消订阅（幂等），返回是否真的移除了处理器
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|entry| entry.id != id);
        let removed = handlers.len() != before;
        if removed {
            debug!("移除推送处理器: id={:?}", id);
        }
        removed
    }

    /// 把一个事件分发给订阅者（按订阅顺序同步调用）
    ///
    /// 泵任务收到事件时调用；宿主自己持有连接时也可以直接调用。
    pub fn dispatch(&self, envelope: &PushEnvelope) -> usize {
        // 先拷贝出处理器再调用，处理器里可以安全地 on/off
        let targets: Vec<PushHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|entry| entry.event == envelope.event)
            .map(|entry| entry.handler.clone())
            .collect();

        for handler in &targets {
            handler(envelope);
        }
        if targets.is_empty() {
            debug!("推送事件无订阅者: {}", envelope.event);
        }
        targets.len()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.read().iter().filter(|entry| entry.event == event).count()
    }

    /// 订阅连接状态变化
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatusEvent> {
        self.status_sender.subscribe()
    }

    fn set_status(&self, new_status: ConnectionStatus) {
        let old_status = {
            let mut status = self.status.write();
            std::mem::replace(&mut *status, new_status)
        };
        if old_status == new_status {
            return;
        }
        let _ = self.status_sender.send(ConnectionStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        });
    }

    fn spawn_pump(self: &Arc<Self>, mut receiver: mpsc::Receiver<PushEnvelope>) -> JoinHandle<()> {
        let channel: Weak<PushChannel> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                match channel.upgrade() {
                    Some(channel) => {
                        channel.dispatch(&envelope);
                    }
                    None => return,
                }
            }
            if let Some(channel) = channel.upgrade() {
                warn!("⚠️ 推送连接已断开");
                channel.set_status(ConnectionStatus::Disconnected);
            }
        })
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// 进程内推送传输
///
/// 用于测试，以及宿主已有连接、只需要把事件注入 SDK 的场景。
pub struct LocalPushTransport {
    sender: Mutex<Option<mpsc::Sender<PushEnvelope>>>,
    capacity: usize,
    opens: AtomicUsize,
    failures_remaining: AtomicUsize,
}

impl LocalPushTransport {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            sender: Mutex::new(None),
            capacity: capacity.max(1),
            opens: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
        })
    }

    /// 让接下来的 `count` 次 open 失败
    pub fn fail_next_opens(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// 成功 open 的次数
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// 注入一个事件
    pub async fn inject(&self, envelope: PushEnvelope) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| LiveFeedError::Connection("本地推送通道未打开".to_string()))?;
        sender
            .send(envelope)
            .await
            .map_err(|_| LiveFeedError::Connection("本地推送通道已关闭".to_string()))
    }
}

#[async_trait]
impl PushTransport for LocalPushTransport {
    async fn open(&self) -> Result<mpsc::Receiver<PushEnvelope>> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LiveFeedError::Connection("模拟连接失败".to_string()));
        }

        // 模拟握手耗时，让并发 connect 真的发生竞争
        tokio::task::yield_now().await;
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.sender.lock() = Some(tx);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn close(&self) {
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_connect_opens_once() {
        let transport = LocalPushTransport::new(16);
        let channel = PushChannel::new(transport.clone());

        let results = futures::future::join_all((0..5).map(|_| {
            let channel = channel.clone();
            async move { channel.connect().await }
        }))
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(transport.open_count(), 1);
        assert_eq!(channel.status(), ConnectionStatus::Connected);

        channel.connect().await.unwrap();
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_can_retry() {
        let transport = LocalPushTransport::new(16);
        transport.fail_next_opens(1);
        let channel = PushChannel::new(transport.clone());
        let mut status_rx = channel.subscribe_status();

        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, LiveFeedError::Connection(_)));
        assert_eq!(channel.status(), ConnectionStatus::Failed);

        channel.connect().await.unwrap();
        assert_eq!(channel.status(), ConnectionStatus::Connected);

        let first = status_rx.recv().await.unwrap();
        assert_eq!(first.new_status, ConnectionStatus::Connecting);
        let second = status_rx.recv().await.unwrap();
        assert_eq!(second.new_status, ConnectionStatus::Failed);
    }

    #[tokio::test]
    async fn test_handlers_run_in_subscription_order() {
        let channel = PushChannel::new(LocalPushTransport::new(16));
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            channel.on("ReceiveMessage", move |_env| order.lock().push(tag));
        }
        let other = order.clone();
        channel.on("Other", move |_env| other.lock().push("other"));

        let delivered = channel.dispatch(&PushEnvelope::new("ReceiveMessage", json!({})));
        assert_eq!(delivered, 3);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_off_is_idempotent() {
        let channel = PushChannel::new(LocalPushTransport::new(16));
        let id = channel.on("ReceiveMessage", |_env| {});
        assert_eq!(channel.handler_count("ReceiveMessage"), 1);

        assert!(channel.off(id));
        assert!(!channel.off(id));
        assert_eq!(channel.handler_count("ReceiveMessage"), 0);
        assert_eq!(channel.dispatch(&PushEnvelope::new("ReceiveMessage", json!({}))), 0);
    }

    #[tokio::test]
    async fn test_pump_delivers_injected_events() {
        let transport = LocalPushTransport::new(16);
        let channel = PushChannel::new(transport.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on("ReceiveMessage", move |env| {
            let _ = tx.send(env.payload.clone());
        });

        channel.connect().await.unwrap();
        transport
            .inject(PushEnvelope::new("ReceiveMessage", json!({ "senderId": "u1", "content": "hi" })))
            .await
            .unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["content"], "hi");

        channel.disconnect().await;
        assert_eq!(channel.status(), ConnectionStatus::Disconnected);
        assert!(transport.inject(PushEnvelope::new("ReceiveMessage", json!({}))).await.is_err());
    }
}
