//! 通用工具

pub mod time;

pub use time::{deserialize_timestamp, now_millis, FeedClock, ManualClock, SystemClock};
