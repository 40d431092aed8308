//! 借用式读取游标。
//!
//! 反序列化只需向前读取，Unpacker 借用调用方的字节切片并维护一个偏移量；
//! 截断时返回带位置的错误而不移动游标，嵌套深度由 [`Unpacker::descend`] 计数。

use bytes::Buf;

use crate::{config::DEFAULT_MAX_DEPTH, error::DeserializeError};

/// 单向游标读取器。
///
/// # 契约说明（What）
/// - 只借用源缓冲，不复制也不取得所有权，生命周期受 `'a` 约束；
/// - 始终满足 `0 <= position() <= source.len()`，越界读取返回
///   [`DeserializeError::Truncated`] 且不移动游标；
/// - [`descend`](Self::descend) 为递归下降的值树协作者提供嵌套深度计数。
#[derive(Clone, Debug)]
pub struct Unpacker<'a> {
    source: &'a [u8],
    offset: usize,
    depth: usize,
    max_depth: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(source: &'a [u8]) -> Self {
        Self {
            source,
            offset: 0,
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// 当前读取偏移。
    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining_len() == 0
    }

    /// 尚未读取的字节数。
    pub fn remaining_len(&self) -> usize {
        self.source.len() - self.offset
    }

    /// 查看下一个字节但不消费。
    pub fn peek(&self) -> Option<u8> {
        self.source.get(self.offset).copied()
    }

    /// 读取接下来的 `n` 字节并推进游标。
    pub fn read(&mut self, n: usize) -> Result<&'a [u8], DeserializeError> {
        let remaining = self.remaining_len();
        if n > remaining {
            return Err(DeserializeError::Truncated {
                offset: self.offset,
                needed: n,
                remaining,
            });
        }
        let source: &'a [u8] = self.source;
        let bytes = &source[self.offset..self.offset + n];
        self.offset += n;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DeserializeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DeserializeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DeserializeError> {
        self.read_array().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, DeserializeError> {
        self.read_array().map(u32::from_be_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, DeserializeError> {
        self.read_array().map(u64::from_be_bytes)
    }

    pub fn read_i8(&mut self) -> Result<i8, DeserializeError> {
        self.read_array().map(i8::from_be_bytes)
    }

    pub fn read_i16(&mut self) -> Result<i16, DeserializeError> {
        self.read_array().map(i16::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32, DeserializeError> {
        self.read_array().map(i32::from_be_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64, DeserializeError> {
        self.read_array().map(i64::from_be_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32, DeserializeError> {
        self.read_array().map(f32::from_be_bytes)
    }

    pub fn read_f64(&mut self) -> Result<f64, DeserializeError> {
        self.read_array().map(f64::from_be_bytes)
    }

    /// 进入一层嵌套结构执行 `f`，超过深度上限时返回 [`DeserializeError::DepthExceeded`]。
    pub fn descend<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, DeserializeError>,
    ) -> Result<T, DeserializeError> {
        if self.depth >= self.max_depth {
            return Err(DeserializeError::DepthExceeded {
                limit: self.max_depth,
            });
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }
}

impl Buf for Unpacker<'_> {
    fn remaining(&self) -> usize {
        self.remaining_len()
    }

    fn chunk(&self) -> &[u8] {
        &self.source[self.offset..]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining_len(),
            "cannot advance past the end of the buffer"
        );
        self.offset += cnt;
    }
}
