//! 实时列表同步演示
//!
//! 用内存里的消息接口和本地推送传输，走一遍完整流程：
//! 挂载 → 推送到达 → 发送 → 刷新对账 → 切换作用域

use async_trait::async_trait;
use livefeed_sdk::{
    FeedApi, FeedEvent, FeedRecord, LiveFeedConfig, LiveFeedSdk, LocalPushTransport, PushEnvelope, Result,
    ScopeKey,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

/// 内存消息接口：发送的消息立刻出现在历史里
#[derive(Default)]
struct InMemoryApi {
    messages: Mutex<HashMap<String, Vec<FeedRecord>>>,
    next_id: Mutex<u64>,
}

#[async_trait]
impl FeedApi for InMemoryApi {
    async fn fetch_history(&self, scope: &ScopeKey, limit: u32, offset: u32) -> Result<Vec<FeedRecord>> {
        let messages = self.messages.lock();
        let mut records = messages.get(scope.as_str()).cloned().unwrap_or_default();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn send_message(&self, scope: &ScopeKey, content: &str) -> Result<String> {
        let id = {
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            format!("srv-{}", *next_id)
        };
        let record = FeedRecord::new(id.clone(), "me", content, chrono::Utc::now().timestamp_millis() as u64);
        self.messages
            .lock()
            .entry(scope.as_str().to_string())
            .or_default()
            .push(record);
        Ok(id)
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = LiveFeedConfig::default();
    livefeed_sdk::logging::init(&config.log_level);

    println!("\n==============================================");
    println!("📡 实时列表同步演示");
    println!("==============================================\n");

    let api = std::sync::Arc::new(InMemoryApi::default());
    let transport = LocalPushTransport::new(64);
    let sdk = LiveFeedSdk::initialize(config, api, transport.clone())?;

    let mut events = sdk.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let FeedEvent::SnapshotUpdated(snapshot) = event {
                println!(
                    "  [#{}] {} {} → {:?} (覆盖层 {} 条)",
                    snapshot.revision,
                    snapshot.scope,
                    snapshot.phase,
                    snapshot.ids(),
                    snapshot.overlay_len
                );
            }
        }
    });

    let view = sdk.synchronizer()?;
    println!("场景 1: 挂载 channel-1");
    view.mount("channel-1").await?;
    sleep(Duration::from_millis(50)).await;

    println!("\n场景 2: 别人发来一条推送");
    transport
        .inject(PushEnvelope::new(
            "ReceiveMessage",
            json!({ "id": "peer-1", "senderId": "alice", "content": "hi!", "channelId": "channel-1" }),
        ))
        .await?;
    sleep(Duration::from_millis(50)).await;

    println!("\n场景 3: 自己发送一条消息（成功后刷新）");
    let receipt = sdk
        .send_message(&ScopeKey::new("channel-1"), "hello alice")
        .await?;
    println!("  服务端 id: {}", receipt.id);
    sleep(Duration::from_millis(50)).await;

    println!("\n场景 4: 切换到 channel-2，channel-1 的覆盖层被丢弃");
    view.mount("channel-2").await?;
    sleep(Duration::from_millis(50)).await;

    println!("\n📊 同步器统计: {:?}", view.stats());
    view.dispose();
    sdk.shutdown().await?;

    println!("\n==============================================");
    println!("✅ 演示完成");
    println!("==============================================\n");
    Ok(())
}
