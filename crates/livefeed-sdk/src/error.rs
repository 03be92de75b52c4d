use thiserror::Error;

/// LiveFeed SDK 错误类型
///
/// `Connection` / `Fetch` / `Write` 三类都是局部可恢复错误，
/// 只有 `Disposed`（销毁后继续使用同步器）属于调用方契约违规。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiveFeedError {
    /// 推送通道不可用（降级为仅缓存模式）
    #[error("Connection error: {0}")]
    Connection(String),
    /// 基础列表拉取失败
    #[error("Fetch error: {0}")]
    Fetch(String),
    /// 写操作失败（不修改任何状态）
    #[error("Write error: {0}")]
    Write(String),
    /// 客户端发送限流
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// HTTP 非 2xx 响应
    #[error("HTTP error [{status}]: {message}")]
    Http { status: u16, message: String },
    #[error("JSON error: {0}")]
    Json(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    /// 同步器已销毁
    #[error("Synchronizer already disposed")]
    Disposed,
}

impl From<serde_json::Error> for LiveFeedError {
    fn from(error: serde_json::Error) -> Self {
        LiveFeedError::Json(error.to_string())
    }
}

impl From<std::io::Error> for LiveFeedError {
    fn from(error: std::io::Error) -> Self {
        LiveFeedError::Config(error.to_string())
    }
}

impl From<reqwest::Error> for LiveFeedError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return LiveFeedError::Timeout(error.to_string());
        }
        match error.status() {
            Some(status) => LiveFeedError::Http {
                status: status.as_u16(),
                message: error.to_string(),
            },
            None => LiveFeedError::Connection(error.to_string()),
        }
    }
}

impl LiveFeedError {
    /// 是否为可恢复错误（除 `Disposed` 外全部可恢复）
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, LiveFeedError::Disposed)
    }

    /// 是否属于写操作失败（包括限流）
    pub fn is_write_error(&self) -> bool {
        matches!(self, LiveFeedError::Write(_) | LiveFeedError::RateLimited { .. })
    }

    /// 把任意错误归类为拉取错误（用于基础列表刷新失败）
    pub fn into_fetch(self) -> Self {
        match self {
            LiveFeedError::Fetch(_) | LiveFeedError::Disposed => self,
            other => LiveFeedError::Fetch(other.to_string()),
        }
    }

    /// 把任意错误归类为写错误（限流保持原样，便于调用方读取等待时间）
    pub fn into_write(self) -> Self {
        match self {
            LiveFeedError::Write(_) | LiveFeedError::RateLimited { .. } | LiveFeedError::Disposed => self,
            other => LiveFeedError::Write(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LiveFeedError>;
