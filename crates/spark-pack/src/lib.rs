//! `spark-pack` 提供数据库客户端底层的两类原语：引用计数内存块与分段链式序列化编解码器。
//!
//! # 模块定位（Why）
//! - 客户端需要在多个持有者之间共享同一块内存（如重试中复用的请求体），
//!   [`RcBlock`] 以显式的预约/释放协议保证“最后一个释放者恰好回收一次”；
//! - 嵌套集合的编码结果可能很大，[`Packer`] 以“写满即挂链”的方式增长，
//!   把唯一一次整体复制推迟到 [`Packer::finish`]。
//!
//! # 设计概要（How）
//! - `rc`：计数器与负载同处一个堆结构，句柄仅暴露负载访问器；
//! - `alloc`/`pool`：[`SegmentAllocator`] 将分段的申请与归还显式化，
//!   [`SegmentPool`] 以自由链表复用分段区域；
//! - `packer`/`unpacker`：写入端分段链 + 读取端单向游标；
//! - `serializer`：façade，编排值树协作者（[`Pack`]/[`Unpack`]）并负责失败清理；
//! - `value`/`msgpack`：参考值树及其 MessagePack 子集编码。
//!
//! # 命名约定（Consistency）
//! - 错误码统一使用 `spark.pack.*` 前缀，详见 [`error::codes`]；
//! - 日志通过 `tracing` 门面输出，本 crate 从不安装 Subscriber。

pub mod alloc;
pub mod buffer;
pub mod config;
pub mod error;
pub mod msgpack;
pub mod packer;
pub mod pool;
pub mod rc;
pub mod serializer;
pub mod unpacker;
pub mod value;

pub use alloc::{HeapAllocator, SegmentAllocator};
pub use buffer::Buffer;
pub use config::{PackerConfig, SerializerConfig};
pub use error::{AllocError, ConfigError, DeserializeError, SerializeError};
pub use packer::Packer;
pub use pool::{PoolStats, SegmentPool};
pub use rc::{RcBlock, Released};
pub use serializer::{Pack, Serializer, Unpack, ValueCodec};
pub use unpacker::Unpacker;
pub use value::Value;
