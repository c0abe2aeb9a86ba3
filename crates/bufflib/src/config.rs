//! 模块级配置。
//!
//! # 契约说明（What）
//! - [`BuffConfig`] 在 [`crate::BuffLib::open_with`] 时读取一次，之后不可变；
//! - 支持从 TOML 文本加载，未出现的字段取默认值，未知字段直接拒绝；
//! - `max_capacity` 是单个缓冲允许的最大字节数，默认等于 Rust 单次分配的理论上限 `isize::MAX`。

use serde::Deserialize;
use thiserror::Error;

use crate::store::INITIAL_CAPACITY;

/// Rust 单次堆分配允许的最大字节数。
pub const ALLOCATION_CEILING: usize = isize::MAX as usize;

/// 缓冲库配置。
///
/// ```rust
/// use bufflib::BuffConfig;
///
/// let config = BuffConfig::from_toml_str("max_capacity = 65536\neager_delegation = false")
///     .expect("配置应能解析");
/// assert_eq!(config.max_capacity, 65536);
/// assert!(!config.eager_delegation);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuffConfig {
    /// 单个缓冲允许的最大容量（字节）。扩容目标超过该值时会被截断到上限；
    /// 若截断后仍放不下请求，则返回 `AllocationTooLarge`。
    pub max_capacity: usize,
    /// 是否在打开模块时预先为 string 库中的全部函数安装 `s_` 前缀适配器。
    pub eager_delegation: bool,
}

impl Default for BuffConfig {
    fn default() -> Self {
        Self {
            max_capacity: ALLOCATION_CEILING,
            eager_delegation: true,
        }
    }
}

impl BuffConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: BuffConfig = toml::from_str(source)?;
        config.validate()
    }

    /// 校验字段取值范围。
    ///
    /// - `max_capacity` 不得小于内联初始容量，也不得超过 [`ALLOCATION_CEILING`]。
    pub fn validate(self) -> Result<Self, ConfigError> {
        check_max_capacity(self.max_capacity)?;
        Ok(self)
    }

    /// 覆盖容量上限。
    #[must_use]
    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// 覆盖预装委派开关。
    #[must_use]
    pub fn with_eager_delegation(mut self, eager: bool) -> Self {
        self.eager_delegation = eager;
        self
    }
}

/// 配置加载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 语法或字段类型错误。
    #[error("failed to parse bufflib config: {0}")]
    Parse(#[from] toml::de::Error),

    /// `max_capacity` 超出允许区间。
    #[error("max_capacity {max_capacity} is outside [{minimum}, {maximum}]")]
    MaxCapacityOutOfRange {
        max_capacity: usize,
        minimum: usize,
        maximum: usize,
    },
}

/// 容量上限必须落在 `[INITIAL_CAPACITY, ALLOCATION_CEILING]` 内。
pub(crate) fn check_max_capacity(max_capacity: usize) -> Result<(), ConfigError> {
    if (INITIAL_CAPACITY..=ALLOCATION_CEILING).contains(&max_capacity) {
        Ok(())
    } else {
        Err(ConfigError::MaxCapacityOutOfRange {
            max_capacity,
            minimum: INITIAL_CAPACITY,
            maximum: ALLOCATION_CEILING,
        })
    }
}
