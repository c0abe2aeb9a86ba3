//! 后备存储分配器。
//!
//! # 模块定位（Why）
//! - 缓冲内容保存在一块连续字节数组中：初始阶段使用嵌入在缓冲内部的内联数组，
//!   写满后按“翻倍，不足则精确补齐”的策略切换到堆上的 [`BytesMut`]；
//! - 所有尺寸计算都使用 checked 算术，溢出或超出上限时返回
//!   [`BuffError::AllocationTooLarge`]，并保证缓冲状态不变。
//!
//! # 生命周期（How）
//! - 任一时刻每个缓冲只有一块“当前”存储；新存储安装与旧存储释放发生在同一次调用里，
//!   不存在两块存储同时被视为当前存储的窗口；
//! - 被替换的堆存储交给 [`StoreRecycler::reclaim`]，由回收器决定丢弃或统计；
//! - 内联存储从不释放，也不会上报给回收器。
//!
//! # 契约说明（What）
//! - [`BackingStore::ensure_capacity`] 至多执行一次分配与一次拷贝；
//! - 返回的可写窗口长度恰好等于请求的 `additional`，调用方不得越界写入。

use alloc::{sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::{
    config::{ALLOCATION_CEILING, BuffConfig, ConfigError, check_max_capacity},
    error::{BuffError, Result},
};

/// 内联存储容量，也是新缓冲的初始容量。
pub const INITIAL_CAPACITY: usize = 1024;

/// 计算扩容目标。
///
/// # 执行步骤（How）
/// 1. 剩余空间足够时返回 `Ok(None)`，表示无需扩容；
/// 2. 候选容量取 `capacity * 2`；乘法溢出或翻倍后仍放不下时，改为 `used + additional`；
/// 3. `used + additional` 溢出时返回 `AllocationTooLarge`；
/// 4. 候选容量超过 `limit` 时截断到 `limit`；截断后仍放不下则返回 `AllocationTooLarge`。
///
/// # 前置条件
/// - `used <= capacity`。
pub fn plan_growth(
    capacity: usize,
    used: usize,
    additional: usize,
    limit: usize,
) -> Result<Option<usize>> {
    debug_assert!(used <= capacity, "used_length 不得超过容量");
    if capacity - used >= additional {
        return Ok(None);
    }

    let too_large = || BuffError::AllocationTooLarge {
        used,
        additional,
        limit,
    };

    let candidate = match capacity.checked_mul(2) {
        Some(doubled) if doubled - used >= additional => doubled,
        _ => used.checked_add(additional).ok_or_else(too_large)?,
    };

    if candidate <= limit {
        return Ok(Some(candidate));
    }
    if limit.checked_sub(used).is_some_and(|free| free >= additional) {
        Ok(Some(limit))
    } else {
        Err(too_large())
    }
}

/// 存储回收钩子。
///
/// # 契约定义（What）
/// - `record_allocation`：新堆存储创建后调用一次，`capacity` 为其声明容量；
/// - `reclaim`：堆存储被替换、重置或随缓冲销毁时调用一次；
/// - 实现必须线程安全且不得 panic，`reclaim` 可能在 `Drop` 路径上执行。
pub trait StoreRecycler: Send + Sync + 'static {
    fn record_allocation(&self, capacity: usize) {
        let _ = capacity;
    }

    fn reclaim(&self, reclaimed: ReclaimedStore);
}

/// 一次回收动作携带的上下文。
#[derive(Debug)]
pub struct ReclaimedStore {
    capacity: usize,
    store: BytesMut,
}

impl ReclaimedStore {
    fn new(capacity: usize, store: BytesMut) -> Self {
        Self { capacity, store }
    }

    /// 被回收存储的声明容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 取回底层字节块。
    pub fn into_bytes(self) -> BytesMut {
        self.store
    }
}

/// 直接丢弃被回收存储的回收器，供独立创建的缓冲使用。
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedRecycler;

impl StoreRecycler for DetachedRecycler {
    fn reclaim(&self, reclaimed: ReclaimedStore) {
        drop(reclaimed);
    }
}

/// 记录堆存储分配与回收的统计型回收器。
///
/// 模块级的所有缓冲共享一个 `StoreLedger`，[`StoreLedger::snapshot`] 读取的是近似一致的快照，
/// 各计数器之间不做跨字段原子性保证。
#[derive(Debug, Default)]
pub struct StoreLedger {
    allocated_stores: AtomicU64,
    released_stores: AtomicU64,
    allocated_bytes: AtomicU64,
    live_bytes: AtomicUsize,
    peak_store: AtomicUsize,
}

impl StoreLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreStats {
        StoreStats {
            allocated_stores: self.allocated_stores.load(Ordering::Relaxed),
            released_stores: self.released_stores.load(Ordering::Relaxed),
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_store: self.peak_store.load(Ordering::Relaxed),
        }
    }
}

impl StoreRecycler for StoreLedger {
    fn record_allocation(&self, capacity: usize) {
        self.allocated_stores.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes
            .fetch_add(capacity as u64, Ordering::Relaxed);
        self.live_bytes.fetch_add(capacity, Ordering::Relaxed);
        self.peak_store.fetch_max(capacity, Ordering::Relaxed);
    }

    fn reclaim(&self, reclaimed: ReclaimedStore) {
        self.released_stores.fetch_add(1, Ordering::Relaxed);
        let capacity = reclaimed.capacity();
        let _ = self
            .live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(capacity))
            });
    }
}

/// 存储统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// 累计创建的堆存储数量。
    pub allocated_stores: u64,
    /// 累计回收的堆存储数量。
    pub released_stores: u64,
    /// 累计分配的堆存储字节数。
    pub allocated_bytes: u64,
    /// 当前仍被缓冲持有的堆存储字节数。
    pub live_bytes: usize,
    /// 单块堆存储的历史最大容量。
    pub peak_store: usize,
}

impl StoreStats {
    /// 当前仍存活的堆存储数量。
    pub fn live_stores(&self) -> u64 {
        self.allocated_stores.saturating_sub(self.released_stores)
    }
}

/// 新缓冲的分配环境：回收器与容量上限。
#[derive(Clone)]
pub struct StoreContext {
    recycler: Arc<dyn StoreRecycler>,
    limit: usize,
}

impl StoreContext {
    /// 构造分配环境。`limit` 必须落在 `[INITIAL_CAPACITY, ALLOCATION_CEILING]` 内，否则返回
    /// [`ConfigError::MaxCapacityOutOfRange`]。
    pub fn new(recycler: Arc<dyn StoreRecycler>, limit: usize) -> Result<Self, ConfigError> {
        check_max_capacity(limit)?;
        Ok(Self { recycler, limit })
    }

    /// 依据配置构造分配环境。
    pub fn from_config(
        config: &BuffConfig,
        recycler: Arc<dyn StoreRecycler>,
    ) -> Result<Self, ConfigError> {
        Self::new(recycler, config.max_capacity)
    }

    /// 替换回收器，保留容量上限。
    #[must_use]
    pub fn with_recycler(mut self, recycler: Arc<dyn StoreRecycler>) -> Self {
        self.recycler = recycler;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for StoreContext {
    fn default() -> Self {
        Self {
            recycler: Arc::new(DetachedRecycler),
            limit: ALLOCATION_CEILING,
        }
    }
}

impl fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreContext")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

/// 单个缓冲的后备存储。
///
/// `heap` 为 `None` 时当前存储是内联数组，容量为 [`INITIAL_CAPACITY`]；
/// 否则当前存储是 `heap`，其长度即声明容量。
pub struct BackingStore {
    inline: [u8; INITIAL_CAPACITY],
    heap: Option<BytesMut>,
    context: StoreContext,
}

impl BackingStore {
    pub fn new(context: StoreContext) -> Self {
        Self {
            inline: [0; INITIAL_CAPACITY],
            heap: None,
            context,
        }
    }

    pub fn capacity(&self) -> usize {
        self.heap.as_ref().map_or(INITIAL_CAPACITY, BytesMut::len)
    }

    pub fn is_inline(&self) -> bool {
        self.heap.is_none()
    }

    pub fn context(&self) -> &StoreContext {
        &self.context
    }

    /// 当前存储的前 `used` 字节。
    pub fn filled(&self, used: usize) -> &[u8] {
        &self.current()[..used]
    }

    /// 确保从 `used` 起至少有 `additional` 字节可写，返回恰好 `additional` 字节的窗口。
    ///
    /// 失败时存储保持原样。
    pub fn ensure_capacity(&mut self, used: usize, additional: usize) -> Result<&mut [u8]> {
        let capacity = self.capacity();
        if let Some(candidate) = plan_growth(capacity, used, additional, self.context.limit)? {
            let mut grown = allocate_zeroed(candidate).ok_or(BuffError::AllocationTooLarge {
                used,
                additional,
                limit: self.context.limit,
            })?;
            grown[..used].copy_from_slice(&self.current()[..used]);
            self.context.recycler.record_allocation(candidate);
            let previous = self.heap.replace(grown);
            debug!(
                from = capacity,
                to = candidate,
                used,
                additional,
                "bufflib store grown"
            );
            if let Some(previous) = previous {
                self.reclaim(previous);
            }
        }
        Ok(&mut self.current_mut()[used..used + additional])
    }

    /// 释放堆存储并回到内联存储。内联状态下调用无副作用。
    pub fn release(&mut self) {
        if let Some(previous) = self.heap.take() {
            self.reclaim(previous);
        }
    }

    fn reclaim(&self, store: BytesMut) {
        let capacity = store.len();
        trace!(capacity, "bufflib store released");
        self.context
            .recycler
            .reclaim(ReclaimedStore::new(capacity, store));
    }

    fn current(&self) -> &[u8] {
        match &self.heap {
            Some(heap) => &heap[..],
            None => &self.inline[..],
        }
    }

    fn current_mut(&mut self) -> &mut [u8] {
        match &mut self.heap {
            Some(heap) => &mut heap[..],
            None => &mut self.inline[..],
        }
    }
}

/// 申请 `len` 字节的清零存储；分配器拒绝时返回 `None`，不会终止进程。
fn allocate_zeroed(len: usize) -> Option<BytesMut> {
    let mut raw: Vec<u8> = Vec::new();
    raw.try_reserve_exact(len).ok()?;
    raw.resize(len, 0);
    Some(BytesMut::from(bytes::Bytes::from(raw)))
}

impl Drop for BackingStore {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingStore")
            .field("capacity", &self.capacity())
            .field("inline", &self.is_inline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn fits_without_growth() {
        assert_eq!(plan_growth(1024, 1000, 24, usize::MAX).expect("无需扩容"), None);
        assert_eq!(plan_growth(1024, 0, 0, usize::MAX).expect("零长度"), None);
    }

    #[test]
    fn doubles_when_doubling_suffices() {
        assert_eq!(
            plan_growth(1024, 1000, 100, usize::MAX).expect("翻倍扩容"),
            Some(2048)
        );
    }

    #[test]
    fn grows_exactly_when_doubling_is_insufficient() {
        let ten_mib = 10 * 1024 * 1024;
        assert_eq!(
            plan_growth(1024, 3, ten_mib, usize::MAX).expect("精确扩容"),
            Some(3 + ten_mib)
        );
    }

    #[test]
    fn overflow_is_reported_not_wrapped() {
        let err = plan_growth(1024, 10, usize::MAX, usize::MAX).expect_err("加法溢出");
        assert_eq!(
            err,
            BuffError::AllocationTooLarge {
                used: 10,
                additional: usize::MAX,
                limit: usize::MAX,
            }
        );

        // 翻倍溢出但精确需求可表示时，退回精确扩容。
        let huge = usize::MAX / 2 + 1;
        assert_eq!(
            plan_growth(huge, huge, 1, usize::MAX).expect("精确扩容"),
            Some(huge + 1)
        );
    }

    #[test]
    fn limit_clamps_and_rejects() {
        assert_eq!(plan_growth(2048, 2000, 100, 3000).expect("截断到上限"), Some(3000));
        assert!(plan_growth(2048, 2000, 1001, 3000).is_err());
    }

    #[test]
    fn inline_store_is_never_reported() {
        let ledger = Arc::new(StoreLedger::new());
        let context = StoreContext::new(ledger.clone(), ALLOCATION_CEILING).expect("上限合法");
        let mut store = BackingStore::new(context);
        store
            .ensure_capacity(0, INITIAL_CAPACITY)
            .expect("内联容量内写入")
            .fill(b'x');
        store.release();
        drop(store);
        assert_eq!(ledger.snapshot(), StoreStats::default());
    }

    #[test]
    fn replacement_releases_previous_heap_store() {
        let ledger = Arc::new(StoreLedger::new());
        let context = StoreContext::new(ledger.clone(), ALLOCATION_CEILING).expect("上限合法");
        let mut store = BackingStore::new(context);
        store.ensure_capacity(0, INITIAL_CAPACITY + 1).expect("首次扩容");
        let first = ledger.snapshot();
        assert_eq!(first.allocated_stores, 1);
        assert_eq!(first.live_stores(), 1);
        assert_eq!(first.live_bytes, INITIAL_CAPACITY * 2);

        store
            .ensure_capacity(INITIAL_CAPACITY * 2, 1)
            .expect("二次扩容");
        let second = ledger.snapshot();
        assert_eq!(second.allocated_stores, 2);
        assert_eq!(second.released_stores, 1);
        assert_eq!(second.live_stores(), 1);
        assert_eq!(second.live_bytes, INITIAL_CAPACITY * 4);

        drop(store);
        let after = ledger.snapshot();
        assert_eq!(after.live_stores(), 0);
        assert_eq!(after.live_bytes, 0);
    }

    #[test]
    fn failed_growth_leaves_store_untouched() {
        let ledger = Arc::new(StoreLedger::new());
        let context = StoreContext::new(ledger.clone(), 4096).expect("上限合法");
        let mut store = BackingStore::new(context);
        store.ensure_capacity(0, 3).expect("写入前缀").copy_from_slice(b"abc");
        assert!(store.ensure_capacity(3, 5000).is_err());
        assert!(store.is_inline());
        assert_eq!(store.capacity(), INITIAL_CAPACITY);
        assert_eq!(store.filled(3), b"abc");
        assert_eq!(ledger.snapshot().allocated_stores, 0);
    }

    #[test]
    fn refused_allocation_is_reported_not_aborted() {
        let ledger = Arc::new(StoreLedger::new());
        let context = StoreContext::new(ledger.clone(), ALLOCATION_CEILING).expect("上限合法");
        let mut store = BackingStore::new(context);
        store.ensure_capacity(0, 4).expect("写入前缀").copy_from_slice(b"keep");

        let err = store
            .ensure_capacity(4, 1usize << 62)
            .expect_err("分配器无法满足");
        assert_eq!(
            err,
            BuffError::AllocationTooLarge {
                used: 4,
                additional: 1 << 62,
                limit: ALLOCATION_CEILING,
            }
        );
        assert!(store.is_inline());
        assert_eq!(store.capacity(), INITIAL_CAPACITY);
        assert_eq!(store.filled(4), b"keep");
        assert_eq!(ledger.snapshot(), StoreStats::default());
    }

    #[test]
    #[traced_test]
    fn growth_is_logged() {
        let mut store = BackingStore::new(StoreContext::default());
        store.ensure_capacity(0, INITIAL_CAPACITY * 3).expect("扩容");
        assert!(logs_contain("bufflib store grown"));
    }
}
