//! 写操作分发
//!
//! 发送成功后只做一件事：让作用域的缓存失效。新消息经由后台刷新
//! 进入基础列表，或者先经由推送进入覆盖层；这里从不乐观插入条目。
//! 发送失败不修改任何状态，草稿保持原样以便重试。

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{FeedApi, FeedStore};
use crate::config::LiveFeedConfig;
use crate::error::{LiveFeedError, Result};
use crate::events::{event_builders, EventManager};
use crate::feed::ScopeKey;
use crate::query::QueryKey;
use crate::rate_limiter::{SendRateLimiter, SendRateLimiterStats, DEFAULT_SERVER_BACKOFF};
use crate::utils::now_millis;

/// 发送回执
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// 服务端分配的 id
    pub id: String,
    pub scope: ScopeKey,
    pub sent_at: u64,
}

/// 视图层的输入草稿
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub scope: ScopeKey,
    pub text: String,
}

impl MessageDraft {
    pub fn new<S: Into<ScopeKey>>(scope: S) -> Self {
        Self {
            scope: scope.into(),
            text: String::new(),
        }
    }

    pub fn set_text<T: Into<String>>(&mut self, text: T) {
        self.text = text.into();
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }
}

/// 写操作分发器
pub struct MutationDispatcher {
    api: Arc<dyn FeedApi>,
    store: FeedStore,
    resource: String,
    limiter: SendRateLimiter,
    events: Arc<EventManager>,
}

impl MutationDispatcher {
    pub fn new(config: &LiveFeedConfig, api: Arc<dyn FeedApi>, store: FeedStore, events: Arc<EventManager>) -> Self {
        Self {
            api,
            store,
            resource: config.resource_name.clone(),
            limiter: SendRateLimiter::new(config.send_rate.clone()),
            events,
        }
    }

    /// 发送消息
    ///
    /// 前置条件：内容非空白，作用域已启用且成功拉取过。
    /// 成功后让作用域缓存失效；失败返回写错误，不触发失效。
    pub async fn send(&self, scope: &ScopeKey, content: &str) -> Result<SendReceipt> {
        if content.trim().is_empty() {
            return Err(LiveFeedError::InvalidArgument("消息内容不能为空".to_string()));
        }
        if scope.is_disabled() {
            return Err(LiveFeedError::InvalidArgument("作用域未启用".to_string()));
        }
        let key = QueryKey::new(self.resource.clone(), scope.clone());
        if !self.store.has_fetched(&key) {
            return Err(LiveFeedError::InvalidArgument(format!("作用域尚未加载: {}", scope)));
        }

        // 许可在 future 被丢弃时同样释放，取消的发送不会卡住重试
        let permit = self.limiter.check_send(scope, content)?;
        debug!("📤 发送消息: scope={}, {} 字符", scope, content.chars().count());
        let result = self.api.send_message(scope, content).await;
        drop(permit);

        match result {
            Ok(id) => {
                info!("✅ 消息已发送: scope={}, id={}", scope, id);
                self.store.invalidate(&key);
                self.events.emit(event_builders::message_sent(scope.clone(), id.clone()));
                Ok(SendReceipt {
                    id,
                    scope: scope.clone(),
                    sent_at: now_millis(),
                })
            }
            Err(e) => {
                if let LiveFeedError::Http { status: 429, .. } = e {
                    self.limiter.record_server_throttle(DEFAULT_SERVER_BACKOFF);
                }
                let error = e.into_write();
                warn!("⚠️ 消息发送失败: scope={}, {}", scope, error);
                self.events
                    .emit(event_builders::message_send_failed(scope.clone(), error.to_string()));
                Err(error)
            }
        }
    }

    /// 发送草稿：成功后清空草稿，失败时草稿保持不变
    pub async fn send_draft(&self, draft: &mut MessageDraft) -> Result<SendReceipt> {
        let receipt = self.send(&draft.scope, &draft.text).await?;
        draft.clear();
        Ok(receipt)
    }

    pub fn limiter_stats(&self) -> SendRateLimiterStats {
        self.limiter.stats()
    }
}
