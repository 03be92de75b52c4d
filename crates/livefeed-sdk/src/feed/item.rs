//! 列表条目数据模型

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message_type::{default_message_type, message_type_placeholder, ChatMessageType};
use crate::utils::deserialize_timestamp;

/// 作用域键（会话/频道标识）
///
/// 空字符串（或全空白）表示"禁用"：不拉取、不订阅。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    /// 禁用的作用域
    pub fn disabled() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_disabled(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_disabled() {
            write!(f, "<disabled>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<&str> for ScopeKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ScopeKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Option<&str>> for ScopeKey {
    fn from(value: Option<&str>) -> Self {
        value.map(ScopeKey::new).unwrap_or_else(ScopeKey::disabled)
    }
}

/// 条目来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// 来自缓存拉取结果
    Persisted,
    /// 来自推送，尚未被拉取结果确认
    Live,
}

/// 条目内容（同步器从不解析）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedPayload {
    pub sender_id: String,
    pub content: String,
    pub kind: ChatMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl FeedPayload {
    pub fn text<S: Into<String>, C: Into<String>>(sender_id: S, content: C) -> Self {
        Self {
            sender_id: sender_id.into(),
            content: content.into(),
            kind: default_message_type(),
            metadata: None,
        }
    }

    /// 日志摘要：只输出发送者和类型占位符，不输出正文
    pub fn summary(&self) -> String {
        format!("{} {}", self.sender_id, message_type_placeholder(&self.kind))
    }
}

/// 本地 id 前缀
pub const LOCAL_ID_PREFIX: &str = "live-";

/// 列表中的一条内容
///
/// 条目创建后不可变；Live 条目被同 id 的 Persisted 条目取代时是整体替换。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    pub origin: Origin,
    /// 排序键（毫秒）：Persisted 使用服务端时间，Live 使用本地接收时间
    pub sort_key: u64,
    /// 本地到达序号，仅对 Live 条目有意义，用于同排序键时"后到先显示"
    pub arrival: u64,
    pub payload: FeedPayload,
}

impl FeedItem {
    pub fn persisted(record: &FeedRecord) -> Self {
        Self {
            id: record.id.clone(),
            origin: Origin::Persisted,
            sort_key: record.timestamp,
            arrival: 0,
            payload: FeedPayload {
                sender_id: record.sender_id.clone(),
                content: record.content.clone(),
                kind: record.kind.clone(),
                metadata: record.metadata.clone(),
            },
        }
    }

    pub fn live(id: String, payload: FeedPayload, sort_key: u64, arrival: u64) -> Self {
        Self {
            id,
            origin: Origin::Live,
            sort_key,
            arrival,
            payload,
        }
    }

    pub fn is_live(&self) -> bool {
        self.origin == Origin::Live
    }

    /// 推送缺少 id 时分配的本地 id，永远不会被基础列表确认
    pub fn has_local_id(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

/// 服务端持久化消息（历史接口返回的线格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub id: String,
    #[serde(alias = "sender_id")]
    pub sender_id: String,
    pub content: String,
    #[serde(default = "default_message_type", alias = "messageType")]
    pub kind: ChatMessageType,
    /// UNIX 时间戳（毫秒，UTC），兼容 RFC 3339 字符串
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl FeedRecord {
    pub fn new<I: Into<String>, S: Into<String>, C: Into<String>>(
        id: I,
        sender_id: S,
        content: C,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            kind: default_message_type(),
            timestamp,
            metadata: None,
        }
    }
}

/// 推送消息负载
///
/// 最小形态为 `{ "senderId": ..., "content": ... }`，没有可信的服务端时间。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub sender_id: String,
    pub content: String,
    /// 所属频道；缺省表示发给当前订阅者的作用域
    #[serde(default, alias = "sessionId")]
    pub channel_id: Option<String>,
    #[serde(default = "default_message_type", alias = "messageType")]
    pub kind: ChatMessageType,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl PushMessage {
    /// 是否属于指定作用域（未携带频道时视为属于）
    pub fn belongs_to(&self, scope: &ScopeKey) -> bool {
        match &self.channel_id {
            Some(channel) => channel == scope.as_str(),
            None => true,
        }
    }

    /// 推送里的 id；缺失时分配本地 id（不会与服务端 id 冲突）
    pub fn resolve_id(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4()),
        }
    }

    pub fn into_payload(self) -> FeedPayload {
        FeedPayload {
            sender_id: self.sender_id,
            content: self.content,
            kind: self.kind,
            metadata: self.metadata,
        }
    }
}
