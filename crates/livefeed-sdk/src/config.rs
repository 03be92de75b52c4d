//! SDK 配置
//!
//! 配置可以通过构建器组装，也可以从 JSON 文件加载。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{LiveFeedError, Result};

/// 覆盖层对账策略
///
/// 基础列表刷新后，只要有 Live 条目在新列表中被确认，覆盖层就会被整体替换：
/// - `ClearOnConfirm`：替换为空覆盖层
/// - `PruneConfirmed`：替换为仅包含未确认条目的新覆盖层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    #[default]
    ClearOnConfirm,
    PruneConfirmed,
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(30),
        }
    }
}

/// 发送限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRateConfig {
    /// 每秒允许发送条数
    pub per_second: f64,
    /// 突发容量
    pub burst: f64,
}

impl Default for SendRateConfig {
    fn default() -> Self {
        Self {
            per_second: 10.0, // 正常打字速度
            burst: 20.0,
        }
    }
}

/// LiveFeed SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveFeedConfig {
    /// 远端 API 基础地址，例如 https://api.example.com/api
    pub api_base_url: Option<String>,
    /// HTTP 客户端配置
    pub http: HttpClientConfig,
    /// 缓存键里的资源名
    pub resource_name: String,
    /// 订阅的推送事件名
    pub push_event_name: String,
    /// 历史消息单页大小
    pub history_page_size: u32,
    /// 单个作用域覆盖层的最大条目数
    pub overlay_capacity: usize,
    /// 覆盖层条目最长保留时间（秒）
    pub overlay_ttl_secs: u64,
    /// 覆盖层对账策略
    pub reconcile_policy: ReconcilePolicy,
    /// 视图事件缓冲区大小
    pub event_buffer_size: usize,
    /// 缓存更新广播缓冲区大小
    pub query_buffer_size: usize,
    /// 发送限流
    pub send_rate: SendRateConfig,
    /// 日志级别（trace/debug/info/warn/error）
    pub log_level: String,
}

impl Default for LiveFeedConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            http: HttpClientConfig::default(),
            resource_name: "messages".to_string(),
            push_event_name: "ReceiveMessage".to_string(),
            history_page_size: 50,
            overlay_capacity: 500,
            overlay_ttl_secs: 600,
            reconcile_policy: ReconcilePolicy::default(),
            event_buffer_size: 1000,
            query_buffer_size: 256,
            send_rate: SendRateConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl LiveFeedConfig {
    pub fn builder() -> LiveFeedConfigBuilder {
        LiveFeedConfigBuilder::new()
    }

    /// 从 JSON 字符串加载（缺省字段使用默认值）
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: LiveFeedConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LiveFeedError::Config(format!("读取配置文件失败 {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.resource_name.trim().is_empty() {
            return Err(LiveFeedError::Config("resource_name 不能为空".to_string()));
        }
        if self.push_event_name.trim().is_empty() {
            return Err(LiveFeedError::Config("push_event_name 不能为空".to_string()));
        }
        if self.history_page_size == 0 {
            return Err(LiveFeedError::Config("history_page_size 必须大于 0".to_string()));
        }
        if self.overlay_capacity == 0 {
            return Err(LiveFeedError::Config("overlay_capacity 必须大于 0".to_string()));
        }
        if self.event_buffer_size == 0 || self.query_buffer_size == 0 {
            return Err(LiveFeedError::Config("广播缓冲区大小必须大于 0".to_string()));
        }
        if !(self.send_rate.per_second > 0.0) || self.send_rate.burst < 1.0 {
            return Err(LiveFeedError::Config(format!(
                "发送限流配置无效: per_second={}, burst={}",
                self.send_rate.per_second, self.send_rate.burst
            )));
        }
        if let Some(url) = &self.api_base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(LiveFeedError::Config(format!("api_base_url 必须是 http(s) 地址: {}", url)));
            }
        }
        Ok(())
    }

    pub fn overlay_ttl(&self) -> Duration {
        Duration::from_secs(self.overlay_ttl_secs)
    }
}

/// 配置构建器
pub struct LiveFeedConfigBuilder {
    config: LiveFeedConfig,
}

impl LiveFeedConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: LiveFeedConfig::default(),
        }
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        let url: String = url.into();
        self.config.api_base_url = Some(url.trim_end_matches('/').to_string());
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http = config;
        self
    }

    pub fn resource_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.resource_name = name.into();
        self
    }

    pub fn push_event_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.push_event_name = name.into();
        self
    }

    pub fn history_page_size(mut self, size: u32) -> Self {
        self.config.history_page_size = size;
        self
    }

    pub fn overlay_capacity(mut self, capacity: usize) -> Self {
        self.config.overlay_capacity = capacity;
        self
    }

    pub fn overlay_ttl_secs(mut self, secs: u64) -> Self {
        self.config.overlay_ttl_secs = secs;
        self
    }

    pub fn reconcile_policy(mut self, policy: ReconcilePolicy) -> Self {
        self.config.reconcile_policy = policy;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn query_buffer_size(mut self, size: usize) -> Self {
        self.config.query_buffer_size = size;
        self
    }

    pub fn send_rate(mut self, per_second: f64, burst: f64) -> Self {
        self.config.send_rate = SendRateConfig { per_second, burst };
        self
    }

    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn build(self) -> LiveFeedConfig {
        self.config
    }
}

impl Default for LiveFeedConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
