//! 编码结果的交接缓冲。
//!
//! # 模块定位（Why）
//! - Serializer 成功后把连续字节交给调用方，调用方可能直接发送、转成 [`Bytes`] 交给传输层，
//!   或者原样丢弃；
//! - 结果区域可能来自池，交接之后池仍需知道它何时结束，否则租约统计只增不减。
//!
//! # 设计概要（How）
//! - `Buffer` 可选地持有来源分配器的归还句柄（`home`），`Drop` 时把区域还回去；
//! - `into_bytes` 以 `Bytes::from_owner` 包裹整个 `Buffer`，最后一个 `Bytes` 视图释放时同样触发归还；
//! - `into_vec` 永久取走区域，并通知来源分配器结束租约。

use std::{fmt, mem, ops::Deref, sync::Arc};

use bytes::Bytes;

use crate::alloc::SegmentAllocator;

/// 编码结果的交接格式：`{data, size, capacity}`。
///
/// # 契约说明（What）
/// - `size()` 为有效字节数，`capacity()` 为底层区域的容量，始终满足 `size <= capacity`；
/// - 空缓冲允许 `capacity == 0`，此时不持有任何堆内存；
/// - 所有权在 [`Serializer::serialize`](crate::Serializer::serialize) 成功后移交调用方；
///   由池发放的区域在 `Drop` 时自动归还，调用方无需显式调用
///   [`Serializer::recycle`](crate::Serializer::recycle)；
/// - 从 `Vec<u8>`/`&[u8]` 构造以及 `clone` 得到的缓冲不属于任何分配器，`Drop` 时直接释放。
#[derive(Default)]
pub struct Buffer {
    data: Vec<u8>,
    home: Option<Arc<dyn SegmentAllocator>>,
}

impl Buffer {
    /// 不持有内存的空缓冲。
    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            home: None,
        }
    }

    /// 由分配器发放的区域；`home` 为 `None` 时等同于外来区域。
    pub(crate) fn leased(data: Vec<u8>, home: Option<Arc<dyn SegmentAllocator>>) -> Self {
        Self { data, home }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 是否会在 `Drop` 时把区域还给来源分配器。
    pub fn is_leased(&self) -> bool {
        self.home.is_some()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 永久取走底层区域；来源分配器随即结束该租约。
    pub fn into_vec(mut self) -> Vec<u8> {
        let data = mem::take(&mut self.data);
        if let Some(home) = self.home.take() {
            home.detach(data.capacity());
        }
        data
    }

    /// 零拷贝转换为只读 [`Bytes`]。
    ///
    /// 租借的区域随 `Bytes` 一起存活，最后一个视图释放时归还来源分配器。
    pub fn into_bytes(mut self) -> Bytes {
        if self.home.is_some() {
            Bytes::from_owner(self)
        } else {
            Bytes::from(mem::take(&mut self.data))
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            home.reclaim(mem::take(&mut self.data));
        }
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        Self::from(self.as_slice())
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .field("leased", &self.is_leased())
            .finish()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data, home: None }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self::from(data.to_vec())
    }
}

impl From<Buffer> for Bytes {
    fn from(buffer: Buffer) -> Self {
        buffer.into_bytes()
    }
}
