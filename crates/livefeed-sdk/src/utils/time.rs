//! 时间处理工具模块
//!
//! - 所有时间统一使用 UTC 毫秒时间戳
//! - 推送消息没有可信的服务端时间，排序键使用本地单调时钟生成
//! - 服务端历史消息的时间字段同时兼容数字和 RFC 3339 字符串

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// 排序键时钟
///
/// 实现必须单调不减：同一实例连续两次调用，后一次的值不小于前一次。
pub trait FeedClock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// 系统时钟（墙上时间 + 单调保护）
///
/// 系统时间被回拨时继续返回上一次的值，保证排序键不会倒退。
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeedClock for SystemClock {
    fn now_millis(&self) -> u64 {
        let wall = now_millis();
        let previous = self.last.fetch_max(wall, Ordering::SeqCst);
        previous.max(wall)
    }
}

/// 手动时钟，测试和回放场景使用
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    pub fn set(&self, millis: u64) {
        self.now.fetch_max(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl FeedClock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// 反序列化时间戳（支持 ISO 8601 字符串或数字时间戳，单位毫秒）
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a timestamp (u64 milliseconds) or ISO 8601 string")
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(E::custom(format!("timestamp cannot be negative: {}", value)));
            }
            Ok(value as u64)
        }

        fn visit_f64<E>(self, value: f64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0.0 || !value.is_finite() {
                return Err(E::custom(format!("invalid timestamp: {}", value)));
            }
            Ok(value as u64)
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            match chrono::DateTime::parse_from_rfc3339(value) {
                Ok(dt) => {
                    let millis = dt.timestamp_millis();
                    if millis < 0 {
                        return Err(E::custom(format!("timestamp before epoch: {}", value)));
                    }
                    Ok(millis as u64)
                }
                Err(_) => value
                    .parse::<u64>()
                    .map_err(|_| E::custom(format!("invalid timestamp format: {}", value))),
            }
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}
