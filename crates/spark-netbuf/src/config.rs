//! 构造期配置。
//!
//! `NetBufConfig` 描述一棵树的形状 `(chunk_size, l0_size, height)` 与默认分配器的额度，
//! 可以在代码中以 `with_*` 链式构造，也可以从 TOML 片段加载：
//!
//! ```toml
//! chunk_size = 8192
//! l0_size = 8
//! height = 3
//! chunk_limit = 4096
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    allocator::FreeListAllocator,
    error::ConfigError,
    geometry::Geometry,
};

pub const DEFAULT_CHUNK_SIZE: usize = 8192;
pub const DEFAULT_L0_SIZE: usize = 8;
pub const DEFAULT_HEIGHT: usize = 3;

/// 分块树配置。
///
/// # 契约说明（What）
/// - 字段本身不做校验，[`NetBufConfig::validate`] 是唯一的校验入口；
/// - 缺省字段取默认值：`chunk_size = 8192`、`l0_size = 8`、`height = 3`、不限额度。
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetBufConfig {
    pub chunk_size: usize,
    pub l0_size: usize,
    pub height: usize,
    /// 默认分配器最多向堆预留的块数，`None` 表示不限。
    pub chunk_limit: Option<usize>,
}

impl Default for NetBufConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            l0_size: DEFAULT_L0_SIZE,
            height: DEFAULT_HEIGHT,
            chunk_limit: None,
        }
    }
}

impl NetBufConfig {
    pub fn new(chunk_size: usize, l0_size: usize, height: usize) -> Self {
        Self {
            chunk_size,
            l0_size,
            height,
            chunk_limit: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_l0_size(mut self, l0_size: usize) -> Self {
        self.l0_size = l0_size;
        self
    }

    pub fn with_height(mut self, height: usize) -> Self {
        self.height = height;
        self
    }

    pub fn with_chunk_limit(mut self, chunk_limit: usize) -> Self {
        self.chunk_limit = Some(chunk_limit);
        self
    }

    /// 从 TOML 文本解析配置，解析成功后立即校验。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置并返回推导出的 [`Geometry`]。
    pub fn validate(&self) -> Result<Geometry, ConfigError> {
        if self.chunk_limit == Some(0) {
            return Err(ConfigError::ZeroChunkLimit);
        }
        Geometry::new(self.chunk_size, self.l0_size, self.height)
    }

    /// 构造与本配置块大小一致的默认分配器，可在多棵树之间共享。
    pub fn build_allocator(&self) -> Result<Arc<FreeListAllocator>, ConfigError> {
        self.validate()?;
        let allocator = match self.chunk_limit {
            Some(limit) => FreeListAllocator::with_limit(self.chunk_size, limit)?,
            None => FreeListAllocator::new(self.chunk_size)?,
        };
        Ok(Arc::new(allocator))
    }
}
