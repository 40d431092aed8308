//! 池化的分段分配器。
//!
//! 频繁编码时分段区域尺寸高度重复，池以自由链表复用它们；结果缓冲经
//! [`SegmentAllocator::recycler`] 持有池的归还句柄，`Drop` 时自动回到池中。

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use spin::Mutex;

use crate::{
    alloc::{SegmentAllocator, try_allocate},
    error::AllocError,
};

/// 池保留空闲区域数量的默认上限。
pub const DEFAULT_MAX_FREE_REGIONS: usize = 64;

/// `SegmentPool` 是基于自由链表（Free List）的 [`SegmentAllocator`]，
/// 在频繁序列化的场景下复用分段区域，减少堆分配次数。
///
/// # 模块角色（Why）
/// - Packer 每次溢出都会申请新的活动分段，`finish` 后再全部归还；
///   对于持续编码请求的客户端，这些区域的尺寸高度重复，适合池化；
/// - 编码结果 [`Buffer`](crate::Buffer) 在 `Drop` 时（包括经 `into_bytes` 转出的 `Bytes` 被释放时）
///   把区域还回池中；经 `into_vec` 永久取走的区域只结束租约，不再计入 `allocated_bytes`。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<Vec<u8>>>` 作为自由链表，租借时优先复用容量足够的区域；
/// - `PoolMetrics` 通过原子计数跟踪 `allocated_bytes`、`available_bytes`、`active_leases` 等指标，
///   支撑 [`statistics`](Self::statistics) 快照；
/// - 自由链表长度超过 `max_free_regions` 时，归还的区域直接丢弃，避免峰值后长期占用内存。
///
/// # 契约说明（What）
/// - **线程安全**：所有共享状态均由 `spin::Mutex` 与原子计数保护，满足 `Send + Sync`；
/// - **后置条件**：`allocate(n)` 返回的区域 `len() == 0` 且 `capacity() >= n`；
/// - **失败语义**：新分配失败时累加 `failed_acquisitions` 并返回 [`AllocError`]；
/// - **归还约束**：`reclaim` 只接受本池发放的区域，外来区域应直接丢弃。
///
/// # 设计权衡（Trade-offs）
/// - 使用自旋锁（`spin::Mutex`）而非 `std::sync::Mutex`：临界区只有一次线性查找与 `swap_remove`；
/// - 复用区域可能比请求更大，Packer 只按请求容量写入，多余部分不参与分段计算。
#[derive(Clone)]
pub struct SegmentPool {
    inner: Arc<PoolInner>,
}

impl Default for SegmentPool {
    fn default() -> Self {
        Self::with_max_free_regions(DEFAULT_MAX_FREE_REGIONS)
    }
}

impl SegmentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定自由链表最多保留的区域数量。
    pub fn with_max_free_regions(max_free_regions: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(max_free_regions)),
        }
    }

    /// 清空自由链表，返回释放的字节容量。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_list()
    }

    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

impl SegmentAllocator for SegmentPool {
    fn allocate(&self, capacity: usize) -> Result<Vec<u8>, AllocError> {
        self.inner.acquire_region(capacity)
    }

    fn reclaim(&self, region: Vec<u8>) {
        self.inner.reclaim_region(region)
    }

    fn detach(&self, capacity: usize) {
        self.inner.detach_region(capacity)
    }

    fn recycler(&self) -> Option<Arc<dyn SegmentAllocator>> {
        Some(Arc::clone(&self.inner) as Arc<dyn SegmentAllocator>)
    }
}

impl SegmentAllocator for PoolInner {
    fn allocate(&self, capacity: usize) -> Result<Vec<u8>, AllocError> {
        self.acquire_region(capacity)
    }

    fn reclaim(&self, region: Vec<u8>) {
        self.reclaim_region(region)
    }

    fn detach(&self, capacity: usize) {
        self.detach_region(capacity)
    }
}

/// 池统计快照。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// 池累计向堆申请、尚未释放的字节数。
    pub allocated_bytes: usize,
    /// 自由链表中可立即复用的字节数。
    pub available_bytes: usize,
    /// 尚未归还的租借数量。
    pub active_leases: usize,
    /// 复用自由链表命中的次数。
    pub reused_regions: u64,
    /// 新分配失败的次数。
    pub failed_acquisitions: u64,
    /// 自由链表当前长度。
    pub free_regions: usize,
}

struct PoolInner {
    free_list: Mutex<Vec<Vec<u8>>>,
    max_free_regions: usize,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn new(max_free_regions: usize) -> Self {
        Self {
            free_list: Mutex::new(Vec::new()),
            max_free_regions,
            metrics: PoolMetrics::default(),
        }
    }

    /// 从自由链表或堆上获取一个满足容量的区域。
    fn acquire_region(&self, min_capacity: usize) -> Result<Vec<u8>, AllocError> {
        let reused = {
            let mut list = self.free_list.lock();
            list.iter()
                .position(|region| region.capacity() >= min_capacity)
                .map(|index| list.swap_remove(index))
        };

        let region = match reused {
            Some(region) => {
                self.metrics.decrease_available(region.capacity());
                self.metrics.reused.fetch_add(1, Ordering::Relaxed);
                region
            }
            None => match try_allocate(min_capacity) {
                Ok(region) => {
                    self.metrics.increase_on_new_allocation(region.capacity());
                    region
                }
                Err(err) => {
                    self.metrics
                        .failed_acquisitions
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            },
        };
        self.metrics.increase_active_leases();
        Ok(region)
    }

    fn reclaim_region(&self, mut region: Vec<u8>) {
        self.metrics.decrease_active_leases();
        let capacity = region.capacity();
        region.clear();
        let mut list = self.free_list.lock();
        if list.len() < self.max_free_regions {
            list.push(region);
            self.metrics.increase_available(capacity);
        } else {
            drop(list);
            self.metrics.decrease_on_loss(capacity);
        }
    }

    /// 区域被调用方永久取走：结束租约，并把容量从池的持有量中扣除。
    fn detach_region(&self, capacity: usize) {
        self.metrics.decrease_active_leases();
        self.metrics.decrease_on_loss(capacity);
    }

    fn shrink_free_list(&self) -> usize {
        let mut list = self.free_list.lock();
        let reclaimed: usize = list.iter().map(Vec::capacity).sum();
        list.clear();
        self.metrics.decrease_on_shrink(reclaimed);
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        let free_regions = self.free_list.lock().len();
        PoolStats {
            allocated_bytes: self.metrics.allocated_bytes.load(Ordering::Relaxed),
            available_bytes: self.metrics.available_bytes.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Relaxed),
            reused_regions: self.metrics.reused.load(Ordering::Relaxed),
            failed_acquisitions: self.metrics.failed_acquisitions.load(Ordering::Relaxed),
            free_regions,
        }
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_leases: AtomicUsize,
    reused: AtomicU64,
    failed_acquisitions: AtomicU64,
}

impl PoolMetrics {
    fn increase_on_new_allocation(&self, capacity: usize) {
        self.allocated_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn increase_available(&self, capacity: usize) {
        self.available_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn decrease_available(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
    }

    fn decrease_on_loss(&self, capacity: usize) {
        saturating_sub(&self.allocated_bytes, capacity);
    }

    fn decrease_on_shrink(&self, capacity: usize) {
        self.decrease_available(capacity);
        self.decrease_on_loss(capacity);
    }

    fn increase_active_leases(&self) {
        self.active_leases.fetch_add(1, Ordering::Relaxed);
    }

    fn decrease_active_leases(&self) {
        saturating_sub(&self.active_leases, 1);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}
