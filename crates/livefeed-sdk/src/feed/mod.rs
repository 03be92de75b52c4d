//! 列表数据模型与合并规则
//!
//! - `item`：条目、作用域键、线格式
//! - `merge`：基础列表 × 覆盖层 → 渲染列表（纯函数）
//! - `overlay`：有界覆盖层集合

pub mod item;
pub mod merge;
pub mod overlay;

pub use item::{FeedItem, FeedPayload, FeedRecord, Origin, PushMessage, ScopeKey};
pub use merge::{merge, reconcile_overlay, render_order};
pub use overlay::{OverlayInsert, OverlaySet};
