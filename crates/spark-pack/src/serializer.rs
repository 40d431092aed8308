//! Serializer façade：编排 Packer/Unpacker 与值树协作者，负责错误路径上的清理。
//!
//! # 状态机（What）
//! - 序列化：`Idle → Packing → {Finished | Failed}`。`Failed` 时先执行
//!   [`Packer::abort_cleanup`] 再返回错误，调用方的目标缓冲保持原样；
//! - 反序列化：`Idle → Reading → {Done | Failed}`。`Failed` 时不返回任何部分值，
//!   已构造的子结构由协作者在返回错误前自行丢弃。
//!
//! 每次调用彼此独立，Serializer 本身不保存跨调用状态，可在线程间共享。

use tracing::{debug, trace, warn};

use crate::{
    alloc::{HeapAllocator, SegmentAllocator},
    buffer::Buffer,
    config::SerializerConfig,
    error::{ConfigError, DeserializeError, SerializeError},
    packer::Packer,
    unpacker::Unpacker,
    value::Value,
};

/// 值树协作者的编码入口。
pub trait Pack {
    fn pack(&self, packer: &mut Packer<'_>) -> Result<(), SerializeError>;
}

/// 值树协作者的解码入口。
pub trait Unpack: Sized {
    fn unpack(unpacker: &mut Unpacker<'_>) -> Result<Self, DeserializeError>;
}

impl<T: Pack + ?Sized> Pack for &T {
    fn pack(&self, packer: &mut Packer<'_>) -> Result<(), SerializeError> {
        (**self).pack(packer)
    }
}

impl<T: Pack + ?Sized> Pack for Box<T> {
    fn pack(&self, packer: &mut Packer<'_>) -> Result<(), SerializeError> {
        (**self).pack(packer)
    }
}

/// 面向 [`Value`] 的对象安全编解码接口，便于以 `dyn ValueCodec` 形式注入客户端。
pub trait ValueCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn serialize_value(&self, value: &Value) -> Result<Buffer, SerializeError>;

    fn deserialize_value(&self, bytes: &[u8]) -> Result<Value, DeserializeError>;
}

/// 序列化 façade。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方只面对 `serialize`/`deserialize` 两个入口，
///   分段链的构建、合并与失败清理全部封装在内部；
/// - **逻辑 (How)**：每次序列化创建一个独占的 [`Packer`]，交给协作者写入；
///   成功则 `finish` 合并分段，失败则 `abort_cleanup` 归还所有分段；
/// - **契约 (What)**：配置在构造时校验；分配器 `A` 可以是 [`HeapAllocator`]、
///   [`SegmentPool`](crate::SegmentPool) 或任意自定义实现。
#[derive(Clone, Debug)]
pub struct Serializer<A = HeapAllocator> {
    allocator: A,
    config: SerializerConfig,
}

impl Default for Serializer<HeapAllocator> {
    fn default() -> Self {
        Self {
            allocator: HeapAllocator,
            config: SerializerConfig::default(),
        }
    }
}

impl Serializer<HeapAllocator> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<A: SegmentAllocator> Serializer<A> {
    pub fn with_allocator(allocator: A, config: SerializerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { allocator, config })
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn config(&self) -> &SerializerConfig {
        &self.config
    }

    /// 编码 `value`，成功时返回连续缓冲并移交所有权。
    pub fn serialize<V: Pack + ?Sized>(&self, value: &V) -> Result<Buffer, SerializeError> {
        let mut packer = Packer::with_config(&self.allocator, &self.config.packer)?;
        match value.pack(&mut packer) {
            Ok(()) => {
                let segments = packer.segment_count();
                let buffer = packer.finish()?;
                debug!(size = buffer.size(), segments, "value serialized");
                Ok(buffer)
            }
            Err(err) => {
                warn!(
                    code = err.code(),
                    written = packer.len(),
                    segments = packer.segment_count(),
                    error = %err,
                    "serialization aborted"
                );
                packer.abort_cleanup();
                Err(err)
            }
        }
    }

    /// 编码到 `dst`；仅在成功时覆盖 `dst`，失败时 `dst` 保持调用前的内容。
    pub fn serialize_into<V: Pack + ?Sized>(
        &self,
        value: &V,
        dst: &mut Buffer,
    ) -> Result<(), SerializeError> {
        *dst = self.serialize(value)?;
        Ok(())
    }

    /// 计算 `value` 的编码长度，不分配任何缓冲。
    pub fn serialized_size<V: Pack + ?Sized>(&self, value: &V) -> Result<usize, SerializeError> {
        let mut packer = Packer::measuring();
        value.pack(&mut packer)?;
        Ok(packer.len())
    }

    /// 从 `bytes` 开头解码一个值，允许尾部残留字节。
    pub fn deserialize<V: Unpack>(&self, bytes: &[u8]) -> Result<V, DeserializeError> {
        let mut unpacker = Unpacker::new(bytes).with_max_depth(self.config.max_depth);
        V::unpack(&mut unpacker).inspect_err(|err| {
            debug!(
                code = err.code(),
                position = unpacker.position(),
                error = %err,
                "deserialization failed"
            );
        })
    }

    /// 与 [`deserialize`](Self::deserialize) 相同，但要求恰好消费全部字节。
    pub fn deserialize_exact<V: Unpack>(&self, bytes: &[u8]) -> Result<V, DeserializeError> {
        let mut unpacker = Unpacker::new(bytes).with_max_depth(self.config.max_depth);
        let value = V::unpack(&mut unpacker)?;
        match unpacker.remaining_len() {
            0 => Ok(value),
            remaining => Err(DeserializeError::TrailingBytes { remaining }),
        }
    }

    /// 交还不再使用的结果缓冲。
    ///
    /// 租借的缓冲回到发放它的分配器；外来缓冲（由 `Vec`/切片构造或克隆得到）
    /// 不会混入分配器，直接释放。
    pub fn recycle(&self, buffer: Buffer) {
        if !buffer.is_leased() {
            trace!(
                capacity = buffer.capacity(),
                "foreign buffer dropped instead of recycled"
            );
        }
        drop(buffer);
    }
}

impl<A: SegmentAllocator> ValueCodec for Serializer<A> {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn serialize_value(&self, value: &Value) -> Result<Buffer, SerializeError> {
        self.serialize(value)
    }

    fn deserialize_value(&self, bytes: &[u8]) -> Result<Value, DeserializeError> {
        self.deserialize(bytes)
    }
}
