//! 引用计数内存块。
//!
//! # 模块定位（Why）
//! - 多个持有者共享同一块堆内存（例如同一份编码结果被多个请求重试复用），
//!   由最后一个释放者负责回收，且回收恰好发生一次；
//! - 与 `Arc` 不同，释放动作是显式的：调用方可以选择在计数归零时不立即回收，
//!   之后再通过 [`RcBlock::force_free`] 手动释放，并由断言捕获“释放仍被持有的块”这类缺陷。
//!
//! # 设计概要（How）
//! - 计数器与负载放在同一个堆结构 `RcInner` 中，句柄只暴露负载访问器，
//!   不存在从负载指针回退到头部的指针运算；
//! - 每个非孤儿句柄恰好代表一次预约（reservation），因此计数始终等于存活句柄数；
//! - 所有计数变更都是单条原子 RMW，归零判定直接使用 `fetch_sub` 的返回值，
//!   与并发 `reserve` 之间不存在“读-比较-写”窗口。
//!
//! # 契约说明（What）
//! - `allocate` 返回计数为 1、负载全零的块；
//! - 编程错误（预约已归零的块、过度释放、强制释放仍被持有的块）记录 `error` 事件后 panic；
//! - 丢弃句柄等价于 `release(true)`。

use std::{fmt, marker::PhantomData, mem::ManuallyDrop, ptr::NonNull};

#[cfg(not(any(loom, spark_loom)))]
use std::sync::atomic::{AtomicUsize, Ordering, fence};

#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicUsize, Ordering, fence};

use crate::error::{AllocError, codes};

/// 计数上限，超过后视为泄漏式预约（与 `Arc` 的防溢出策略一致）。
const MAX_COUNT: usize = isize::MAX as usize;

struct RcInner {
    count: AtomicUsize,
    payload: Vec<u8>,
}

/// 一次 [`RcBlock::release`] 的结果。
#[derive(Debug)]
pub enum Released {
    /// 仍有其他持有者，携带释放后的计数。
    Shared(usize),
    /// 本次释放使计数归零，且块已被回收。
    Freed,
    /// 本次释放使计数归零，但调用方关闭了自动回收；
    /// 返回的孤儿句柄计数为 0，需交给 [`RcBlock::force_free`] 或直接丢弃。
    Orphaned(RcBlock),
}

impl Released {
    /// 释放后的计数，归零的两种情形均返回 0。
    pub fn count(&self) -> usize {
        match self {
            Released::Shared(count) => *count,
            Released::Freed | Released::Orphaned(_) => 0,
        }
    }

    /// 调用方是否为最后一个持有者。
    pub fn was_last(&self) -> bool {
        self.count() == 0
    }
}

/// 引用计数内存块句柄。
///
/// # 契约说明（What）
/// - **前置条件**：句柄之间只能通过 [`reserve`](Self::reserve) 复制，类型本身不实现 `Clone`；
/// - **后置条件**：最后一个持有者释放后负载被回收，恰好一次；
/// - **并发**：句柄满足 `Send + Sync`，计数操作均为原子操作；负载的可变访问仅在独占时开放。
pub struct RcBlock {
    inner: NonNull<RcInner>,
    _marker: PhantomData<RcInner>,
}

// SAFETY: 计数通过原子操作维护；负载的可变访问 `get_mut` 要求 `&mut self` 且计数不超过 1，
// 与 `Arc<Vec<u8>>` 的共享规则一致。
unsafe impl Send for RcBlock {}
unsafe impl Sync for RcBlock {}

impl RcBlock {
    /// 分配 `size` 字节的全零负载，初始计数为 1。
    ///
    /// 内存不足时返回 [`AllocError::OutOfMemory`]，不会中止进程。
    pub fn allocate(size: usize) -> Result<Self, AllocError> {
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(size)
            .map_err(|_| AllocError::OutOfMemory { requested: size })?;
        payload.resize(size, 0);
        let inner = Box::new(RcInner {
            count: AtomicUsize::new(1),
            payload,
        });
        Ok(Self {
            inner: NonNull::from(Box::leak(inner)),
            _marker: PhantomData,
        })
    }

    fn inner(&self) -> &RcInner {
        // SAFETY: `inner` 在最后一个句柄回收之前始终有效，而回收只发生在消耗句柄的路径上。
        unsafe { self.inner.as_ref() }
    }

    /// 增加一次预约，返回新持有者的句柄以及预约前的计数。
    ///
    /// 对计数已归零的孤儿句柄调用属于编程错误，会 panic。
    pub fn reserve(&self) -> (RcBlock, usize) {
        let previous = self.inner().count.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            fatal("reserve on a block whose count already reached zero");
        }
        if previous >= MAX_COUNT {
            fatal("reservation count overflow");
        }
        let block = RcBlock {
            inner: self.inner,
            _marker: PhantomData,
        };
        (block, previous)
    }

    /// 释放本句柄代表的预约。
    ///
    /// - 计数仍大于 0：返回 [`Released::Shared`]；
    /// - 计数归零且 `auto_free`：回收负载并返回 [`Released::Freed`]；
    /// - 计数归零且未要求自动回收：返回 [`Released::Orphaned`]。
    pub fn release(self, auto_free: bool) -> Released {
        // 只有孤儿句柄能观察到 0，而孤儿句柄是唯一存活的句柄，此处读取不存在竞争。
        if self.count() == 0 {
            fatal("release on a block whose count already reached zero");
        }
        let this = ManuallyDrop::new(self);
        let previous = this.inner().count.fetch_sub(1, Ordering::Release);
        let remaining = previous - 1;
        if remaining > 0 {
            return Released::Shared(remaining);
        }
        fence(Ordering::Acquire);
        if auto_free {
            // SAFETY: 计数由本线程从 1 降为 0，不存在其他句柄。
            unsafe { Self::dealloc(this.inner) };
            Released::Freed
        } else {
            Released::Orphaned(ManuallyDrop::into_inner(this))
        }
    }

    /// 读取当前计数，仅用于诊断。
    pub fn count(&self) -> usize {
        self.inner().count.load(Ordering::Acquire)
    }

    /// 回收计数已归零的块。
    ///
    /// 计数非零意味着仍有持有者，继续回收会造成悬垂引用，因此直接 panic。
    pub fn force_free(self) {
        let count = self.count();
        if count != 0 {
            fatal_with_count("attempt to free a reserved block", count);
        }
        let this = ManuallyDrop::new(self);
        // SAFETY: 计数为 0 的句柄是唯一句柄。
        unsafe { Self::dealloc(this.inner) };
    }

    pub fn len(&self) -> usize {
        self.inner().payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner().payload
    }

    /// 仅在调用方是唯一持有者时返回可变负载。
    pub fn get_mut(&mut self) -> Option<&mut [u8]> {
        if self.count() > 1 {
            return None;
        }
        // SAFETY: 计数不超过 1 且持有 `&mut self`，不存在其他可访问负载的句柄。
        Some(unsafe { (*self.inner.as_ptr()).payload.as_mut_slice() })
    }

    /// 两个句柄是否指向同一块内存。
    pub fn ptr_eq(a: &RcBlock, b: &RcBlock) -> bool {
        a.inner == b.inner
    }

    unsafe fn dealloc(inner: NonNull<RcInner>) {
        // SAFETY: 由调用方保证 `inner` 来自 `Box::leak` 且此后不再被访问。
        drop(unsafe { Box::from_raw(inner.as_ptr()) });
    }
}

impl Drop for RcBlock {
    fn drop(&mut self) {
        let inner = self.inner();
        if inner.count.load(Ordering::Acquire) == 0 {
            // 孤儿句柄：计数已归零，直接回收。
            // SAFETY: 孤儿句柄是唯一句柄。
            unsafe { Self::dealloc(self.inner) };
            return;
        }
        if inner.count.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            // SAFETY: 计数由本线程从 1 降为 0。
            unsafe { Self::dealloc(self.inner) };
        }
    }
}

impl fmt::Debug for RcBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RcBlock")
            .field("count", &self.count())
            .field("len", &self.len())
            .finish()
    }
}

impl AsRef<[u8]> for RcBlock {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cold]
#[track_caller]
fn fatal(reason: &'static str) -> ! {
    tracing::error!(code = codes::RC_MISUSE, reason, "reference-counted block misuse");
    panic!("{reason}");
}

#[cold]
#[track_caller]
fn fatal_with_count(reason: &'static str, count: usize) -> ! {
    tracing::error!(
        code = codes::RC_MISUSE,
        reason,
        count,
        "reference-counted block misuse"
    );
    panic!("{reason} (count = {count})");
}
