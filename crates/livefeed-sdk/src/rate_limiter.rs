//! 客户端发送限流模块
//!
//! 发送是写操作，本模块在请求发出前拦截：
//!
//! 1. **发送频率限制** - 每个作用域一个令牌桶，防止疯狂发送
//! 2. **重复提交拦截** - 相同作用域 + 相同内容的发送未返回时，不允许再次提交；
//!    登记随 `SendPermit` 释放，发送被取消（future 被丢弃）时同样释放
//! 3. **服务端限流退避** - 收到 429 后在退避期内直接拒绝
//!
//! | 参数 | 默认值 | 说明 |
//! |------|--------|------|
//! | per_second | 10 条/秒 | 正常打字速度 |
//! | burst | 20 条 | 允许短时间突发 |
//! | 服务端退避 | 1 秒 | 429 未给出 Retry-After 时使用 |

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SendRateConfig;
use crate::error::{LiveFeedError, Result};
use crate::feed::ScopeKey;

/// 服务端 429 未给出等待时间时的默认退避
pub const DEFAULT_SERVER_BACKOFF: Duration = Duration::from_secs(1);

/// 令牌桶
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// 每秒补充的令牌数
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// 初始满令牌
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// 尝试消耗一个令牌，失败时返回需要等待的时间
    pub fn try_acquire(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(deficit / self.refill_rate))
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn available_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// 进行中的发送标识（作用域 + 内容哈希）
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct SendKey {
    pub scope: ScopeKey,
    content_hash: u64,
}

impl SendKey {
    pub fn new(scope: &ScopeKey, content: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        Self {
            scope: scope.clone(),
            content_hash: hasher.finish(),
        }
    }
}

/// 发送许可：持有期间 (作用域, 内容) 视为进行中，drop 时释放
#[derive(Debug)]
pub struct SendPermit<'a> {
    limiter: &'a SendRateLimiter,
    key: SendKey,
}

impl SendPermit<'_> {
    pub fn key(&self) -> &SendKey {
        &self.key
    }
}

impl Drop for SendPermit<'_> {
    fn drop(&mut self) {
        self.limiter.pending.write().remove(&self.key);
    }
}

/// 限流统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRateLimiterStats {
    pub admitted: u64,
    pub rate_limited: u64,
    pub duplicate_blocked: u64,
    pub server_throttled: u64,
}

/// 发送限流器
#[derive(Debug)]
pub struct SendRateLimiter {
    config: SendRateConfig,
    buckets: RwLock<HashMap<ScopeKey, TokenBucket>>,
    pending: RwLock<HashMap<SendKey, Instant>>,
    backoff_until: RwLock<Option<Instant>>,
    stats: RwLock<SendRateLimiterStats>,
}

impl SendRateLimiter {
    pub fn new(config: SendRateConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            backoff_until: RwLock::new(None),
            stats: RwLock::new(SendRateLimiterStats::default()),
        }
    }

    /// 检查是否允许发送；允许时登记为进行中，直到返回的许可被 drop
    pub fn check_send(&self, scope: &ScopeKey, content: &str) -> Result<SendPermit<'_>> {
        // 1. 服务端退避
        if let Some(until) = *self.backoff_until.read() {
            let now = Instant::now();
            if now < until {
                let wait = until - now;
                self.stats.write().server_throttled += 1;
                debug!("服务端限流退避中，还需等待 {}ms", wait.as_millis());
                return Err(LiveFeedError::RateLimited {
                    retry_after_ms: wait.as_millis() as u64,
                });
            }
        }

        // 2. 重复提交
        let key = SendKey::new(scope, content);
        if let Some(started) = self.pending.read().get(&key) {
            self.stats.write().duplicate_blocked += 1;
            warn!(
                "检测到重复发送: scope={}, 已等待 {}ms",
                scope,
                started.elapsed().as_millis()
            );
            return Err(LiveFeedError::Write("相同内容的消息正在发送中".to_string()));
        }

        // 3. 令牌桶
        let acquired = {
            let mut buckets = self.buckets.write();
            buckets
                .entry(scope.clone())
                .or_insert_with(|| TokenBucket::new(self.config.burst, self.config.per_second))
                .try_acquire()
        };
        if let Err(wait) = acquired {
            self.stats.write().rate_limited += 1;
            warn!("消息发送超限: scope={}, 需要等待 {}ms", scope, wait.as_millis());
            return Err(LiveFeedError::RateLimited {
                retry_after_ms: wait.as_millis().max(1) as u64,
            });
        }

        self.pending.write().insert(key.clone(), Instant::now());
        self.stats.write().admitted += 1;
        Ok(SendPermit { limiter: self, key })
    }

    /// 记录服务端限流，退避期内拒绝所有发送
    pub fn record_server_throttle(&self, retry_after: Duration) {
        info!("收到服务端限流响应，退避 {}ms", retry_after.as_millis());
        *self.backoff_until.write() = Some(Instant::now() + retry_after);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    pub fn stats(&self) -> SendRateLimiterStats {
        self.stats.read().clone()
    }
}
