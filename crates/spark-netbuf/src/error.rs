//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义分块树缓冲对外暴露的全部错误语义：配置校验、容量越界、分配器枯竭与调用契约违例；
//! - 每个变体都携带稳定错误码（`netbuf.*`），与框架其它 crate 的错误码命名保持一致，便于告警聚合。
//!
//! ## 设计要求（What）
//! - 可恢复错误全部通过 [`NetBufError`] 返回，增长/收缩失败时保证不发生部分提交；
//! - 内部不变量被破坏属于不可恢复故障，统一经由 [`invariant_violation`] 记录日志后 `panic`，
//!   禁止带着损坏的树结构继续运行。

use thiserror::Error;

/// 构造期配置校验失败。
///
/// - **契约 (What)**：任何一个变体出现时，都不会产生可用的 [`NetBuffer`](crate::NetBuffer) 实例；
/// - **执行 (How)**：由 [`NetBufConfig::validate`](crate::NetBufConfig::validate) 按字段顺序逐项检查，
///   返回遇到的第一个问题。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// 字段取值不是 2 的幂。
    #[error("`{field}` must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: usize },

    /// `chunk_size` 不足以容纳两个节点槽位。
    #[error("chunk_size {chunk_size} cannot hold two node slots (minimum {minimum})")]
    ChunkTooSmall { chunk_size: usize, minimum: usize },

    /// `chunk_size` 超出 32 位计数范围。
    #[error("chunk_size {chunk_size} exceeds the supported maximum {maximum}")]
    ChunkTooLarge { chunk_size: usize, maximum: usize },

    /// 根数组槽位数少于 2。
    #[error("l0_size must be at least 2, got {l0_size}")]
    RootTooSmall { l0_size: usize },

    /// 树高少于 2。
    #[error("height must be at least 2, got {height}")]
    HeightTooSmall { height: usize },

    /// `CAPACITY` 无法用 `usize` 表示。
    #[error(
        "capacity of chunk_size={chunk_size}, l0_size={l0_size}, height={height} overflows usize"
    )]
    CapacityOverflow {
        chunk_size: usize,
        l0_size: usize,
        height: usize,
    },

    /// 绑定的分配器块大小与配置不一致。
    #[error("allocator hands out {actual}-byte chunks but the tree expects {expected}")]
    ChunkSizeMismatch { expected: usize, actual: usize },

    /// `chunk_limit` 被显式设置为 0。
    #[error("chunk_limit must be positive when set")]
    ZeroChunkLimit,

    /// TOML 文本无法解析为配置。
    #[error("failed to parse netbuf configuration: {0}")]
    Parse(String),
}

impl ConfigError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::NotPowerOfTwo { .. } => "netbuf.config.not_power_of_two",
            ConfigError::ChunkTooSmall { .. } => "netbuf.config.chunk_too_small",
            ConfigError::ChunkTooLarge { .. } => "netbuf.config.chunk_too_large",
            ConfigError::RootTooSmall { .. } => "netbuf.config.root_too_small",
            ConfigError::HeightTooSmall { .. } => "netbuf.config.height_too_small",
            ConfigError::CapacityOverflow { .. } => "netbuf.config.capacity_overflow",
            ConfigError::ChunkSizeMismatch { .. } => "netbuf.config.chunk_size_mismatch",
            ConfigError::ZeroChunkLimit => "netbuf.config.zero_chunk_limit",
            ConfigError::Parse(_) => "netbuf.config.parse",
        }
    }
}

/// 分块树缓冲的运行期错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方需要区分“换更大配置/先消费数据再重试”的容量问题、
///   “内存来源枯竭”的分配问题，以及自身用错接口的契约问题；
/// - **契约 (What)**：
///   - `CapacityExceeded` 与 `AllocationFailure` 返回时，`end` 与树形状均保持调用前的状态；
///   - `ContractViolation` 表示调用方越界或重复释放，已被检查拦截，出错的那一步未做任何修改；
///     除 `free` 外的操作整体保持调用前状态，`free` 跨多个叶子时此前各段的递减仍然生效；
///   - 所有变体均满足 `Send + Sync + 'static`，可跨线程传播。
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NetBufError {
    /// 构造期配置错误。
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 增长后的逻辑区间将超过树容量。
    #[error(
        "growing by {requested} bytes exceeds capacity: {available} bytes left of {capacity}"
    )]
    CapacityExceeded {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    /// 分配器无法再提供新的块。
    #[error("chunk allocator exhausted after reserving {reserved} chunks of {chunk_size} bytes")]
    AllocationFailure { chunk_size: usize, reserved: usize },

    /// 调用方违反接口契约（越界访问、收缩越过 `begin`、重复释放等）。
    #[error("contract violation in `{operation}`: {detail}")]
    ContractViolation {
        operation: &'static str,
        detail: String,
    },
}

impl NetBufError {
    /// 返回稳定错误码，配置错误沿用 [`ConfigError::code`]。
    pub fn code(&self) -> &'static str {
        match self {
            NetBufError::Config(err) => err.code(),
            NetBufError::CapacityExceeded { .. } => "netbuf.capacity_exceeded",
            NetBufError::AllocationFailure { .. } => "netbuf.allocation_failure",
            NetBufError::ContractViolation { .. } => "netbuf.contract_violation",
        }
    }

    pub(crate) fn contract(operation: &'static str, detail: impl Into<String>) -> Self {
        NetBufError::ContractViolation {
            operation,
            detail: detail.into(),
        }
    }
}

/// 内部不变量被破坏：记录 `error` 级日志后终止当前线程。
///
/// - **契约 (What)**：只在“本应存在的节点缺失”或“本应为空的槽位被占用”时调用；
///   继续执行会让后续增长覆盖活跃节点或重复归还块，因此不提供恢复路径。
#[cold]
#[track_caller]
pub(crate) fn invariant_violation(operation: &'static str, detail: &str) -> ! {
    tracing::error!(operation, detail, "netbuf.invariant_violation");
    panic!("netbuf invariant violated in `{operation}`: {detail}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = NetBufError::CapacityExceeded {
            requested: 10,
            available: 4,
            capacity: 8,
        };
        assert_eq!(err.code(), "netbuf.capacity_exceeded");

        let config: NetBufError = ConfigError::HeightTooSmall { height: 1 }.into();
        assert_eq!(config.code(), "netbuf.config.height_too_small");
        assert_eq!(config.to_string(), "height must be at least 2, got 1");
    }

    #[test]
    #[should_panic(expected = "netbuf invariant violated in `unalloc`")]
    fn invariant_violation_panics() {
        invariant_violation("unalloc", "interior node missing");
    }
}
