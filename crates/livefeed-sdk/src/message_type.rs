//! 消息类型定义
//!
//! 消息类型就是字符串，服务端可以随时扩展；SDK 只认识下面几种常见类型，
//! 未知类型原样透传，仅在日志摘要里显示为占位符。

/// 消息类型就是字符串，支持无限扩展
pub type ChatMessageType = String;

/// 已知消息类型常量
pub mod message_types {
    /// 文本消息
    pub const TEXT: &str = "text";
    /// 图片消息
    pub const IMAGE: &str = "image";
    /// 文件消息
    pub const FILE: &str = "file";
    /// 语音消息
    pub const AUDIO: &str = "audio";
    /// 视频消息
    pub const VIDEO: &str = "video";
    /// 系统消息
    pub const SYSTEM: &str = "system";
}

/// 默认消息类型（serde default 使用）
pub fn default_message_type() -> ChatMessageType {
    message_types::TEXT.to_string()
}

/// 判断是否是已知的消息类型
pub fn is_known_message_type(msg_type: &str) -> bool {
    matches!(
        msg_type,
        message_types::TEXT
            | message_types::IMAGE
            | message_types::FILE
            | message_types::AUDIO
            | message_types::VIDEO
            | message_types::SYSTEM
    )
}

/// 消息摘要占位符（日志和通知预览使用，不解析内容本身）
pub fn message_type_placeholder(msg_type: &str) -> &'static str {
    match msg_type {
        message_types::TEXT => "[文本]",
        message_types::IMAGE => "[图片]",
        message_types::FILE => "[文件]",
        message_types::AUDIO => "[语音]",
        message_types::VIDEO => "[视频]",
        message_types::SYSTEM => "[系统消息]",
        _ => "【未知消息类型】",
    }
}
