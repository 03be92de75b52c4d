//! LiveFeed SDK - 实时消息列表同步
//!
//! 把"缓存拉取的历史消息"和"推送到达的新消息"合并成一份有序、去重的渲染列表：
//! - 📥 缓存查询：按作用域缓存历史，失效后后台刷新，多次失效自动合并
//! - 📡 推送通道：进程级共享连接，幂等 connect，按订阅顺序分发事件
//! - 🔄 同步器：推送先进入覆盖层，刷新后与基础列表对账；作用域切换后迟到结果一律丢弃
//! - ✉️ 写操作：发送成功只触发失效，从不乐观插入；带客户端限流
//! - ⚙️ 事件系统：每次列表变化输出一份完整快照
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use livefeed_sdk::{LiveFeedConfig, LiveFeedSdk, LocalPushTransport, ScopeKey};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LiveFeedConfig::builder()
//!         .api_base_url("https://api.example.com/api")
//!         .build();
//!     livefeed_sdk::logging::init(&config.log_level);
//!
//!     // 宿主把自己的 WebSocket/SignalR 事件注入到本地传输
//!     let transport = LocalPushTransport::new(256);
//!     let sdk = LiveFeedSdk::initialize_http(config, transport)?;
//!
//!     let view = sdk.synchronizer()?;
//!     let mut events = sdk.subscribe_events();
//!     view.mount("channel-1").await?;
//!
//!     sdk.send_message(&ScopeKey::new("channel-1"), "Hello, World!").await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{}: {}", event.event_type(), event.scope());
//!     }
//!
//!     view.dispose();
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod feed;
pub mod logging;
pub mod message_type;
pub mod mutation;
pub mod push;
pub mod query;
pub mod rate_limiter;
pub mod sdk;
pub mod sync;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use api::{FeedApi, FeedStore, HistoryFetcher, HttpFeedApi};
pub use config::{HttpClientConfig, LiveFeedConfig, LiveFeedConfigBuilder, ReconcilePolicy, SendRateConfig};
pub use error::{LiveFeedError, Result};
pub use events::{EventFilter, EventManager, FeedEvent, FilteredEventReceiver};
pub use feed::{FeedItem, FeedPayload, FeedRecord, Origin, PushMessage, ScopeKey};
pub use message_type::ChatMessageType;
pub use mutation::{MessageDraft, MutationDispatcher, SendReceipt};
pub use push::{
    ConnectionStatus, ConnectionStatusEvent, HandlerId, LocalPushTransport, PushChannel, PushEnvelope,
    PushTransport,
};
pub use query::{QueryFetcher, QueryKey, QueryState, QueryStore, QueryStoreStats, QueryUpdate};
pub use sdk::LiveFeedSdk;
pub use sync::{FeedSnapshot, LiveFeedSynchronizer, SyncPhase, SyncStats};
pub use utils::{FeedClock, ManualClock, SystemClock};
pub use version::SDK_VERSION;
