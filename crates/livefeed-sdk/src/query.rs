//! 缓存查询层
//!
//! 按 `(资源名, 作用域)` 缓存异步拉取结果：
//! - `fetch`：立即返回当前值，缺失或已失效时在后台刷新，从不阻塞调用方
//! - `invalidate`：标记失效并安排后台刷新；刷新开始前的多次失效合并为一次，
//!   刷新进行中再次失效只会追加一次后续刷新
//! - 每次刷新完成发布一条 `QueryUpdate`，订阅者一次性看到完整的新状态
//!
//! 刷新失败保留上一次的数据，仅设置 error。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{LiveFeedError, Result};
use crate::feed::ScopeKey;
use crate::utils::now_millis;

/// 缓存键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub resource: String,
    pub scope: ScopeKey,
}

impl QueryKey {
    pub fn new<R: Into<String>, S: Into<ScopeKey>>(resource: R, scope: S) -> Self {
        Self {
            resource: resource.into(),
            scope: scope.into(),
        }
    }

    /// 作用域为空时禁用
    pub fn is_disabled(&self) -> bool {
        self.scope.is_disabled()
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.scope)
    }
}

/// 拉取器（远端 API 的请求/响应契约）
#[async_trait]
pub trait QueryFetcher<T>: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<T>;
}

/// 缓存状态快照
#[derive(Debug)]
pub struct QueryState<T> {
    /// 最近一次成功拉取的数据
    pub data: Option<Arc<T>>,
    /// 是否有刷新在排队或进行中
    pub is_loading: bool,
    /// 最近一次刷新的错误（成功后清空）
    pub error: Option<LiveFeedError>,
    /// 数据版本号，每次成功拉取 +1
    pub data_version: u64,
    /// 最近一次刷新完成时间（UTC 毫秒）
    pub updated_at: Option<u64>,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            is_loading: self.is_loading,
            error: self.error.clone(),
            data_version: self.data_version,
            updated_at: self.updated_at,
        }
    }
}

impl<T> QueryState<T> {
    /// 空闲空状态（禁用的键也返回它）
    pub fn idle() -> Self {
        Self {
            data: None,
            is_loading: false,
            error: None,
            data_version: 0,
            updated_at: None,
        }
    }

    /// 至少完成过一次刷新（成功或失败）
    pub fn is_settled(&self) -> bool {
        self.updated_at.is_some()
    }
}

/// 刷新完成通知
#[derive(Debug)]
pub struct QueryUpdate<T> {
    pub key: QueryKey,
    pub state: QueryState<T>,
}

impl<T> Clone for QueryUpdate<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            state: self.state.clone(),
        }
    }
}

/// 缓存统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStoreStats {
    pub entries: usize,
    /// 实际发起的拉取次数
    pub fetches: u64,
    /// 被合并掉的失效请求数
    pub coalesced: u64,
    /// 失败的拉取次数
    pub failures: u64,
}

struct QueryEntry<T> {
    state: QueryState<T>,
    stale: bool,
    /// 已安排但尚未开始的刷新
    pending: bool,
    /// 刷新任务正在运行
    fetching: bool,
    has_fetched: bool,
    /// 条目代次；remove 后重建的条目代次不同，旧刷新任务据此退出
    generation: u64,
}

impl<T> QueryEntry<T> {
    fn new(generation: u64) -> Self {
        Self {
            state: QueryState::idle(),
            stale: true,
            pending: false,
            fetching: false,
            has_fetched: false,
            generation,
        }
    }
}

struct StoreInner<T> {
    entries: Mutex<HashMap<QueryKey, QueryEntry<T>>>,
    fetcher: Arc<dyn QueryFetcher<T>>,
    updates: broadcast::Sender<QueryUpdate<T>>,
    stats: Mutex<QueryStoreStats>,
    next_generation: AtomicU64,
}

impl<T> StoreInner<T> {
    fn new_entry(&self) -> QueryEntry<T> {
        QueryEntry::new(self.next_generation.fetch_add(1, Ordering::Relaxed))
    }
}

/// 缓存查询存储（可廉价克隆，克隆共享同一份缓存）
///
/// `fetch` / `invalidate` 会 `tokio::spawn` 后台刷新，必须在 tokio 运行时内调用。
pub struct QueryStore<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for QueryStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> QueryStore<T> {
    pub fn new(fetcher: Arc<dyn QueryFetcher<T>>, buffer_size: usize) -> Self {
        let (updates, _) = broadcast::channel(buffer_size.max(1));
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(HashMap::new()),
                fetcher,
                updates,
                stats: Mutex::new(QueryStoreStats::default()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// 读取缓存；缺失或已失效时安排后台刷新
    pub fn fetch(&self, key: &QueryKey) -> QueryState<T> {
        if key.is_disabled() {
            return QueryState::idle();
        }

        let (state, spawn) = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| self.inner.new_entry());
            let spawn = entry.stale && self.schedule(key, entry);
            (entry.state.clone(), spawn.then_some(entry.generation))
        };

        if let Some(generation) = spawn {
            self.spawn_refetch(key.clone(), generation);
        }
        state
    }

    /// 标记失效并安排后台刷新
    pub fn invalidate(&self, key: &QueryKey) {
        if key.is_disabled() {
            return;
        }

        let spawn = {
            let mut entries = self.inner.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| self.inner.new_entry());
            entry.stale = true;
            self.schedule(key, entry).then_some(entry.generation)
        };

        if let Some(generation) = spawn {
            self.spawn_refetch(key.clone(), generation);
        }
    }

    /// 当前缓存值，不触发刷新
    pub fn get(&self, key: &QueryKey) -> Option<QueryState<T>> {
        self.inner.entries.lock().get(key).map(|entry| entry.state.clone())
    }

    /// 该键是否成功拉取过
    pub fn has_fetched(&self, key: &QueryKey) -> bool {
        self.inner
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.has_fetched)
            .unwrap_or(false)
    }

    /// 移除缓存；进行中的刷新结果会被丢弃
    pub fn remove(&self, key: &QueryKey) -> bool {
        self.inner.entries.lock().remove(key).is_some()
    }

    /// 订阅刷新完成通知
    pub fn subscribe(&self) -> broadcast::Receiver<QueryUpdate<T>> {
        self.inner.updates.subscribe()
    }

    pub fn stats(&self) -> QueryStoreStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.entries = self.inner.entries.lock().len();
        stats
    }

    /// 安排一次刷新（需已持有锁），返回是否需要启动刷新任务
    fn schedule(&self, key: &QueryKey, entry: &mut QueryEntry<T>) -> bool {
        if entry.pending {
            self.inner.stats.lock().coalesced += 1;
            debug!("🔄 刷新已在排队，合并失效请求: {}", key);
            return false;
        }
        entry.pending = true;
        entry.state.is_loading = true;
        !entry.fetching
    }

    fn spawn_refetch(&self, key: QueryKey, generation: u64) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_refetch(inner, key, generation).await;
        });
    }
}

/// 刷新循环：每轮消费一次 pending，直到没有新的失效为止
///
/// 只服务启动时那一代条目；条目被移除或重建后立即退出。
async fn run_refetch<T: Send + Sync + 'static>(inner: Arc<StoreInner<T>>, key: QueryKey, generation: u64) {
    loop {
        {
            let mut entries = inner.entries.lock();
            let Some(entry) = entries.get_mut(&key).filter(|entry| entry.generation == generation) else {
                return;
            };
            if !entry.pending {
                entry.fetching = false;
                return;
            }
            entry.pending = false;
            entry.fetching = true;
            entry.stale = false;
        }

        inner.stats.lock().fetches += 1;
        debug!("📥 开始拉取: {}", key);
        let result = inner.fetcher.fetch(&key).await;

        let update = {
            let mut entries = inner.entries.lock();
            let Some(entry) = entries.get_mut(&key).filter(|entry| entry.generation == generation) else {
                debug!("缓存键已移除或重建，丢弃拉取结果: {}", key);
                return;
            };
            match result {
                Ok(value) => {
                    entry.state.data = Some(Arc::new(value));
                    entry.state.data_version += 1;
                    entry.state.error = None;
                    entry.has_fetched = true;
                }
                Err(e) => {
                    let error = e.into_fetch();
                    warn!("⚠️ 拉取失败，保留旧数据: {} ({})", key, error);
                    inner.stats.lock().failures += 1;
                    entry.state.error = Some(error);
                    entry.stale = true;
                }
            }
            entry.state.is_loading = entry.pending;
            entry.state.updated_at = Some(now_millis());
            QueryUpdate {
                key: key.clone(),
                state: entry.state.clone(),
            }
        };

        if inner.updates.send(update).is_err() {
            debug!("没有缓存订阅者: {}", key);
        }
    }
}
