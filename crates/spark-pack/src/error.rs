//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义分配、序列化、反序列化与配置四条路径上的可恢复错误；
//! - 为每个变体提供稳定错误码（`spark.pack.*`），便于上层客户端统一映射与告警。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，兼容 `std::error::Error`；
//! - 引用计数误用（过度释放、释放仍被持有的块）属于编程错误，**不**进入本模块，
//!   而是在 `rc` 模块内以 panic 终止；
//! - `is_recoverable` 为调用方提供是否值得重试的粗粒度信号。

use std::borrow::Cow;

use thiserror::Error;

/// 稳定错误码常量，与 `spark.transport.*` 的命名方式保持一致。
pub mod codes {
    pub const OUT_OF_MEMORY: &str = "spark.pack.out_of_memory";
    pub const ENCODE: &str = "spark.pack.encode_failed";
    pub const MEASURING_ONLY: &str = "spark.pack.measuring_only";
    pub const TRUNCATED: &str = "spark.pack.truncated";
    pub const DECODE: &str = "spark.pack.decode_failed";
    pub const DEPTH_EXCEEDED: &str = "spark.pack.depth_exceeded";
    pub const TRAILING_BYTES: &str = "spark.pack.trailing_bytes";
    pub const INVALID_CONFIG: &str = "spark.pack.invalid_config";
    pub const RC_MISUSE: &str = "spark.pack.rc.misuse";
}

/// 堆分配失败。
///
/// 所有分配路径都经由 `Vec::try_reserve_exact`，因此内存耗尽以错误值返回而非中止进程。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum AllocError {
    /// 申请 `requested` 字节失败。
    #[error("out of memory while allocating {requested} bytes")]
    OutOfMemory { requested: usize },
}

impl AllocError {
    pub fn code(&self) -> &'static str {
        codes::OUT_OF_MEMORY
    }

    /// 返回失败时请求的字节数。
    pub fn requested(&self) -> usize {
        match self {
            AllocError::OutOfMemory { requested } => *requested,
        }
    }
}

/// 序列化路径（Packer 与值树协作者）上的错误。
///
/// # 教案式说明
/// - **意图 (Why)**：序列化失败时调用方只需要知道“没有产出缓冲”以及失败原因，
///   分段回收已在 façade 内部完成。
/// - **契约 (What)**：
///   - `Alloc`：任意一步分配失败，已构建的分段全部归还分配器；
///   - `Encode`：值树协作者声明无法编码某个值；
///   - `MeasuringOnly`：在测量模式的 Packer 上调用了 `finish`。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum SerializeError {
    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("cannot encode value: {reason}")]
    Encode { reason: Cow<'static, str> },

    #[error("measuring packer cannot produce a buffer")]
    MeasuringOnly,
}

impl SerializeError {
    /// 构造编码失败错误，供值树协作者使用。
    pub fn encode(reason: impl Into<Cow<'static, str>>) -> Self {
        SerializeError::Encode {
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SerializeError::Alloc(err) => err.code(),
            SerializeError::Encode { .. } => codes::ENCODE,
            SerializeError::MeasuringOnly => codes::MEASURING_ONLY,
        }
    }

    /// 内存耗尽可能是瞬时压力，值得调用方稍后重试；其余错误对同一输入必然复现。
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SerializeError::Alloc(_))
    }
}

/// 反序列化路径（Unpacker 与值树协作者）上的错误。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum DeserializeError {
    /// 读取 `needed` 字节时只剩 `remaining` 字节。
    #[error("buffer truncated at offset {offset}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("cannot decode value at offset {offset}: {reason}")]
    Decode {
        offset: usize,
        reason: Cow<'static, str>,
    },

    /// 嵌套层级超过 `limit`，用于阻断恶意输入导致的栈溢出。
    #[error("nesting depth exceeds limit of {limit}")]
    DepthExceeded { limit: usize },

    #[error("{remaining} trailing bytes after decoded value")]
    TrailingBytes { remaining: usize },
}

impl DeserializeError {
    /// 构造解码失败错误，供值树协作者使用。
    pub fn decode(offset: usize, reason: impl Into<Cow<'static, str>>) -> Self {
        DeserializeError::Decode {
            offset,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            DeserializeError::Truncated { .. } => codes::TRUNCATED,
            DeserializeError::Decode { .. } => codes::DECODE,
            DeserializeError::DepthExceeded { .. } => codes::DEPTH_EXCEEDED,
            DeserializeError::TrailingBytes { .. } => codes::TRAILING_BYTES,
        }
    }

    /// 截断的输入在收到更多字节后可能成功；格式错误则不可恢复。
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeserializeError::Truncated { .. })
    }
}

/// 配置校验失败。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ConfigError {
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        codes::INVALID_CONFIG
    }
}
