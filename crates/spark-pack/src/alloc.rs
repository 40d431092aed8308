//! 分段区域的申请与归还入口。
//!
//! # 模块定位（Why）
//! - Packer 只关心“要一块空区域”和“还回一块区域”，具体走堆还是走池由宿主决定；
//! - 编码结果离开 Packer 之后仍可能属于某个池，[`SegmentAllocator::recycler`]
//!   让结果缓冲在 `Drop` 时找到归还对象，池的租约统计因此保持准确。

use std::sync::Arc;

use crate::error::AllocError;

/// `SegmentAllocator` 描述 Packer 获取与归还字节区域的入口。
///
/// # 设计初衷（Why）
/// - Packer 在溢出时需要新的活动分段，在 `finish`/`abort_cleanup` 时需要归还全部分段；
///   将这两个动作抽象为 trait，宿主可以选择直接走堆（[`HeapAllocator`]）
///   或复用池化区域（[`SegmentPool`](crate::SegmentPool)）。
/// - 归还入口让测试可以精确观察“每个分段恰好归还一次”，错误路径上的泄漏无处藏身。
///
/// # 契约定义（What）
/// - `allocate(capacity)`：返回 `len() == 0` 且 `capacity() >= capacity` 的空区域；
///   内存不足时返回 [`AllocError`]，**不得** panic 或中止进程；
/// - `reclaim(region)`：区域的所有权交还分配器，实现可以丢弃或缓存；
///   只能交还由同一分配器发放的区域；
/// - `detach(capacity)`：由本分配器发放、容量为 `capacity` 的区域永久离开（例如转为 `Vec` 交给调用方），
///   不再归还，实现据此结束租约；
/// - `recycler()`：返回可被结果缓冲长期持有的归还句柄；`None` 表示结果缓冲直接随 `Drop` 释放；
/// - **线程安全**：实现需满足 `Send + Sync`，同一分配器可被多个 Serializer 共享。
pub trait SegmentAllocator: Send + Sync {
    fn allocate(&self, capacity: usize) -> Result<Vec<u8>, AllocError>;

    fn reclaim(&self, region: Vec<u8>);

    fn detach(&self, capacity: usize) {
        let _ = capacity;
    }

    fn recycler(&self) -> Option<Arc<dyn SegmentAllocator>> {
        None
    }
}

impl<A: SegmentAllocator + ?Sized> SegmentAllocator for &A {
    fn allocate(&self, capacity: usize) -> Result<Vec<u8>, AllocError> {
        (**self).allocate(capacity)
    }

    fn reclaim(&self, region: Vec<u8>) {
        (**self).reclaim(region)
    }

    fn detach(&self, capacity: usize) {
        (**self).detach(capacity)
    }

    fn recycler(&self) -> Option<Arc<dyn SegmentAllocator>> {
        (**self).recycler()
    }
}

/// 以 `Arc` 共享的分配器本身即可作为归还句柄。
impl<A: SegmentAllocator + 'static> SegmentAllocator for Arc<A> {
    fn allocate(&self, capacity: usize) -> Result<Vec<u8>, AllocError> {
        (**self).allocate(capacity)
    }

    fn reclaim(&self, region: Vec<u8>) {
        (**self).reclaim(region)
    }

    fn detach(&self, capacity: usize) {
        (**self).detach(capacity)
    }

    fn recycler(&self) -> Option<Arc<dyn SegmentAllocator>> {
        Some(Arc::clone(self) as Arc<dyn SegmentAllocator>)
    }
}

/// 直接在全局堆上分配的默认实现。
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocator;

impl SegmentAllocator for HeapAllocator {
    fn allocate(&self, capacity: usize) -> Result<Vec<u8>, AllocError> {
        try_allocate(capacity)
    }

    fn reclaim(&self, region: Vec<u8>) {
        drop(region);
    }
}

/// 以 `try_reserve_exact` 分配空区域，把内存耗尽转为错误值。
pub(crate) fn try_allocate(capacity: usize) -> Result<Vec<u8>, AllocError> {
    let mut region = Vec::new();
    region
        .try_reserve_exact(capacity)
        .map_err(|_| AllocError::OutOfMemory {
            requested: capacity,
        })?;
    Ok(region)
}
