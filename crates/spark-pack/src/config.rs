//! Packer 与 Serializer 的配置。
//!
//! 默认值沿用客户端历史取值：首个分段 8 KiB，后续分段与首段等长；
//! 反序列化嵌套深度上限 256 层。

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 首个活动分段的默认容量。
pub const DEFAULT_INITIAL_CAPACITY: usize = 8 * 1024;

/// 反序列化时允许的默认最大嵌套深度。
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Packer 分段策略。
///
/// # 契约说明（What）
/// - `initial_capacity`：首个活动分段的容量，必须大于 0；
/// - `segment_capacity`：溢出后新分配的活动分段容量，`None` 表示与首段相同；
///   若显式给出则同样必须大于 0。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PackerConfig {
    pub initial_capacity: usize,
    pub segment_capacity: Option<usize>,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            segment_capacity: None,
        }
    }
}

impl PackerConfig {
    pub fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    pub fn with_segment_capacity(mut self, capacity: usize) -> Self {
        self.segment_capacity = Some(capacity);
        self
    }

    /// 溢出后新分段实际使用的容量。
    pub fn effective_segment_capacity(&self) -> usize {
        self.segment_capacity.unwrap_or(self.initial_capacity)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "initial_capacity",
            });
        }
        if self.segment_capacity == Some(0) {
            return Err(ConfigError::Zero {
                field: "segment_capacity",
            });
        }
        Ok(())
    }
}

/// Serializer façade 的整体配置。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct SerializerConfig {
    pub packer: PackerConfig,
    pub max_depth: usize,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            packer: PackerConfig::default(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl SerializerConfig {
    pub fn with_packer(mut self, packer: PackerConfig) -> Self {
        self.packer = packer;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.packer.validate()?;
        if self.max_depth == 0 {
            return Err(ConfigError::Zero { field: "max_depth" });
        }
        Ok(())
    }
}
