//! 分段链式写入器。
//!
//! # 模块定位（Why）
//! - 编码嵌套集合时输出长度事先未知，且可能很大；若每次溢出都扩容并复制整块缓冲，
//!   总成本随增长次数线性累加；
//! - Packer 在溢出时只把已写满的活动区域“挂”到链尾（所有权转移，不复制），
//!   唯一的一次整体复制推迟到 [`Packer::finish`]，按最终总长度付出一次。
//!
//! # 结构与不变量（How）
//! - `active`：当前写入区域，`active.len()` 即写入偏移 `offset`，`capacity` 为该区域的逻辑容量；
//! - `chain`：已封闭的分段，按写入先后排列（头部最旧）；
//! - 逻辑输出流恒等于 `chain` 各分段依次拼接，再接 `active[..offset]`。
//!
//! # 契约说明（What）
//! - 所有区域都来自注入的 [`SegmentAllocator`]，并在 `finish`、`abort_cleanup` 或 `Drop`
//!   时恰好归还一次；`finish` 的结果区域交给调用方，若分配器提供
//!   [`recycler`](SegmentAllocator::recycler)，则由结果缓冲在 `Drop` 时归还；
//! - 测量模式（[`Packer::measuring`]）不分配任何内存，只累计写入长度。

use std::mem;

use tracing::{debug, trace, warn};

use crate::{
    alloc::SegmentAllocator,
    buffer::Buffer,
    config::PackerConfig,
    error::{AllocError, SerializeError},
};

/// 已写满并封闭的分段。
struct Segment {
    bytes: Vec<u8>,
}

impl Segment {
    fn len(&self) -> usize {
        self.bytes.len()
    }
}

pub struct Packer<'a> {
    allocator: Option<&'a dyn SegmentAllocator>,
    active: Vec<u8>,
    capacity: usize,
    segment_capacity: usize,
    chain: Vec<Segment>,
    measured: usize,
}

impl<'a> Packer<'a> {
    /// 以 `initial_capacity` 创建首个活动区域，后续分段沿用同一容量。
    ///
    /// `initial_capacity` 为 0 时按 1 处理，保证溢出循环总能前进。
    pub fn new(
        allocator: &'a dyn SegmentAllocator,
        initial_capacity: usize,
    ) -> Result<Self, AllocError> {
        let capacity = initial_capacity.max(1);
        Self::create(allocator, capacity, capacity)
    }

    /// 按配置创建 Packer；配置应已通过 [`PackerConfig::validate`]。
    pub fn with_config(
        allocator: &'a dyn SegmentAllocator,
        config: &PackerConfig,
    ) -> Result<Self, AllocError> {
        Self::create(
            allocator,
            config.initial_capacity.max(1),
            config.effective_segment_capacity().max(1),
        )
    }

    fn create(
        allocator: &'a dyn SegmentAllocator,
        capacity: usize,
        segment_capacity: usize,
    ) -> Result<Self, AllocError> {
        let active = allocator.allocate(capacity)?;
        Ok(Self {
            allocator: Some(allocator),
            active,
            capacity,
            segment_capacity,
            chain: Vec::new(),
            measured: 0,
        })
    }

    /// 只计算编码长度、不持有任何内存的 Packer。
    pub fn measuring() -> Self {
        Self {
            allocator: None,
            active: Vec::new(),
            capacity: 0,
            segment_capacity: 0,
            chain: Vec::new(),
            measured: 0,
        }
    }

    pub fn is_measuring(&self) -> bool {
        self.allocator.is_none()
    }

    /// 目前为止写入的总字节数。
    pub fn len(&self) -> usize {
        match self.allocator {
            Some(_) => self.chain.iter().map(Segment::len).sum::<usize>() + self.active.len(),
            None => self.measured,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已封闭的分段数量。
    pub fn segment_count(&self) -> usize {
        self.chain.len()
    }

    /// 追加字节；活动区域写满时封闭为新的链尾分段并申请新区域，直到全部写完。
    ///
    /// 分配失败时已写入的部分保持不变，调用方应随后调用 [`abort_cleanup`](Self::abort_cleanup)
    /// 或直接丢弃 Packer。
    pub fn write(&mut self, mut src: &[u8]) -> Result<(), SerializeError> {
        let Some(allocator) = self.allocator else {
            self.measured += src.len();
            return Ok(());
        };
        while !src.is_empty() {
            let room = self.capacity - self.active.len();
            if room == 0 {
                self.rotate(allocator)?;
                continue;
            }
            let (head, tail) = src.split_at(room.min(src.len()));
            self.active.extend_from_slice(head);
            src = tail;
        }
        Ok(())
    }

    /// 先申请新区域，成功后再把写满的活动区域移入链尾，失败时状态不变。
    fn rotate(&mut self, allocator: &dyn SegmentAllocator) -> Result<(), AllocError> {
        let fresh = allocator.allocate(self.segment_capacity)?;
        let filled = mem::replace(&mut self.active, fresh);
        debug_assert_eq!(filled.len(), self.capacity, "only a full region is rotated");
        self.capacity = self.segment_capacity;
        self.chain.push(Segment { bytes: filled });
        trace!(segments = self.chain.len(), "packer segment closed");
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), SerializeError> {
        self.write(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), SerializeError> {
        self.write(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), SerializeError> {
        self.write(&value.to_be_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), SerializeError> {
        self.write(&value.to_be_bytes())
    }

    pub fn write_i8(&mut self, value: i8) -> Result<(), SerializeError> {
        self.write(&value.to_be_bytes())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<(), SerializeError> {
        self.write(&value.to_be_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), SerializeError> {
        self.write(&value.to_be_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<(), SerializeError> {
        self.write(&value.to_be_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<(), SerializeError> {
        self.write(&value.to_be_bytes())
    }

    /// 产出连续缓冲。
    ///
    /// - 链为空：活动区域直接作为结果（`size = offset`），不发生复制；
    /// - 链非空：申请一块恰好容纳全部字节的目标区域，按链序复制各分段再复制活动区域，
    ///   随后归还所有分段与活动区域。
    ///
    /// 目标区域分配失败时，全部分段在 Packer 丢弃时归还。
    pub fn finish(mut self) -> Result<Buffer, SerializeError> {
        let Some(allocator) = self.allocator else {
            return Err(SerializeError::MeasuringOnly);
        };
        if self.chain.is_empty() {
            return Ok(Buffer::leased(
                mem::take(&mut self.active),
                allocator.recycler(),
            ));
        }

        let total = self.len();
        let mut target = allocator.allocate(total)?;
        let segments = self.chain.len();
        for segment in self.chain.drain(..) {
            target.extend_from_slice(&segment.bytes);
            allocator.reclaim(segment.bytes);
        }
        target.extend_from_slice(&self.active);
        allocator.reclaim(mem::take(&mut self.active));
        debug!(segments, total, "packer consolidated segment chain");
        Ok(Buffer::leased(target, allocator.recycler()))
    }

    /// 归还所有分段与活动区域，用于编码失败后的清理。
    pub fn abort_cleanup(mut self) {
        let segments = self.chain.len();
        let written = self.len();
        self.release_regions();
        debug!(segments, written, "packer regions released after abort");
    }

    fn release_regions(&mut self) {
        let Some(allocator) = self.allocator else {
            return;
        };
        for segment in self.chain.drain(..) {
            allocator.reclaim(segment.bytes);
        }
        let active = mem::take(&mut self.active);
        if active.capacity() > 0 {
            allocator.reclaim(active);
        }
    }
}

impl Drop for Packer<'_> {
    fn drop(&mut self) {
        if !self.chain.is_empty() {
            warn!(
                segments = self.chain.len(),
                "packer dropped with pending segments"
            );
        }
        self.release_regions();
    }
}
