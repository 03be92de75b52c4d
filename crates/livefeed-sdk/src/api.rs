//! 远端消息接口
//!
//! - `FeedApi`：历史拉取 + 发送的请求/响应契约
//! - `HttpFeedApi`：基于 reqwest 的 JSON 实现
//! - `HistoryFetcher`：把 `FeedApi` 适配成缓存层的 `QueryFetcher`

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::{HttpClientConfig, LiveFeedConfig};
use crate::error::{LiveFeedError, Result};
use crate::feed::{FeedRecord, ScopeKey};
use crate::query::{QueryFetcher, QueryKey, QueryStore};
use crate::version::user_agent;

/// 消息接口契约
#[async_trait]
pub trait FeedApi: Send + Sync {
    /// 拉取作用域的历史消息（一页）
    async fn fetch_history(&self, scope: &ScopeKey, limit: u32, offset: u32) -> Result<Vec<FeedRecord>>;

    /// 发送消息，返回服务端分配的 id
    async fn send_message(&self, scope: &ScopeKey, content: &str) -> Result<String>;
}

/// 历史接口响应：裸数组，或 `{ "result": [...] }` 包装
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    Wrapped { result: Vec<FeedRecord> },
    Bare(Vec<FeedRecord>),
}

impl HistoryResponse {
    fn into_records(self) -> Vec<FeedRecord> {
        match self {
            HistoryResponse::Wrapped { result } => result,
            HistoryResponse::Bare(records) => records,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

/// 发送接口响应：`{ "id": ... }`，或 `{ "result": { "id": ... } }` 包装
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SendResponse {
    Wrapped { result: SentMessage },
    Bare(SentMessage),
}

impl SendResponse {
    fn into_id(self) -> String {
        match self {
            SendResponse::Wrapped { result } => result.id,
            SendResponse::Bare(sent) => sent.id,
        }
    }
}

/// HTTP JSON 实现
pub struct HttpFeedApi {
    client: Client,
    base_url: Url,
}

impl HttpFeedApi {
    /// 创建新的 HTTP 客户端
    pub fn new(base_url: &str, config: &HttpClientConfig) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| LiveFeedError::Config(format!("无效的 api_base_url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(LiveFeedError::Config(format!("api_base_url 不能作为基础地址: {}", base_url)));
        }

        let mut builder = Client::builder().user_agent(user_agent());
        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| LiveFeedError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ HTTP 客户端已创建 (base_url: {})", base_url);
        Ok(Self { client, base_url })
    }

    /// 从 SDK 配置创建（要求已配置 api_base_url）
    pub fn from_config(config: &LiveFeedConfig) -> Result<Self> {
        let base_url = config
            .api_base_url
            .as_deref()
            .ok_or_else(|| LiveFeedError::Config("未配置 api_base_url".to_string()))?;
        Self::new(base_url, &config.http)
    }

    /// `{base}/chat/{scope}/messages`，作用域按路径段转义
    pub fn messages_url(&self, scope: &ScopeKey) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| LiveFeedError::Config(format!("api_base_url 不能作为基础地址: {}", self.base_url)))?
            .pop_if_empty()
            .extend(["chat", scope.as_str(), "messages"]);
        Ok(url)
    }

    /// 检查响应状态，非 2xx 转为 `Http` 错误
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_else(|_| "无法读取错误信息".to_string());
        error!("❌ 请求失败，HTTP 状态码: {}, 错误: {}", status, message);
        Err(LiveFeedError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl FeedApi for HttpFeedApi {
    async fn fetch_history(&self, scope: &ScopeKey, limit: u32, offset: u32) -> Result<Vec<FeedRecord>> {
        let url = self.messages_url(scope)?;
        debug!("📥 拉取历史消息: {} limit={} offset={}", url, limit, offset);

        let response = self
            .client
            .get(url)
            .query(&[("limit", limit), ("offset", offset)])
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let body = response.text().await?;
        let records = serde_json::from_str::<HistoryResponse>(&body)?.into_records();

        debug!("历史消息拉取完成: scope={}, {} 条", scope, records.len());
        Ok(records)
    }

    async fn send_message(&self, scope: &ScopeKey, content: &str) -> Result<String> {
        let url = self.messages_url(scope)?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let body = response.text().await?;
        let id = serde_json::from_str::<SendResponse>(&body)?.into_id();

        info!("✅ 消息发送成功: scope={}, id={}", scope, id);
        Ok(id)
    }
}

/// 历史消息缓存（同步器和发送器共享同一份）
pub type FeedStore = QueryStore<Vec<FeedRecord>>;

/// 历史拉取器：缓存键的作用域 → 第一页历史
pub struct HistoryFetcher {
    api: Arc<dyn FeedApi>,
    page_size: u32,
}

impl HistoryFetcher {
    pub fn new(api: Arc<dyn FeedApi>, page_size: u32) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl QueryFetcher<Vec<FeedRecord>> for HistoryFetcher {
    async fn fetch(&self, key: &QueryKey) -> Result<Vec<FeedRecord>> {
        self.api.fetch_history(&key.scope, self.page_size, 0).await
    }
}
