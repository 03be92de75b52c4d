//! 日志初始化
//!
//! SDK 内部只使用 `tracing` 宏；是否安装订阅者由宿主决定。
//! 宿主没有自己的订阅者时，可以调用 [`init`] 安装一个 fmt 订阅者。

use tracing::Level;

/// 解析日志级别字符串，无法识别时回退到 INFO
pub fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// 安装全局 fmt 订阅者
///
/// 重复调用或宿主已安装订阅者时返回 false，不会 panic。
pub fn init(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(true)
        .try_init()
        .is_ok()
}
