//! 地址分解：把逻辑字节位置映射为“根索引 → 中间层索引 → 块内偏移”的路径。
//!
//! # 设计概要（How）
//! - 所有尺寸均为 2 的幂，分解只涉及移位与掩码，等价于一个混合进制计数器：
//!   最低位是块内偏移（基数 `chunk_size`），其上是 `height - 2` 个中间层（基数 `middle_size`），
//!   最高位是根索引（基数 `l0_size`，按环回绕）；
//! - 位置每增加 `chunk_size`，恰好有一个路径分量加一，并在溢出时向更高层进位。
//!
//! # 术语（What）
//! - **depth**：槽位所在深度。根数组的槽位为 depth 0，第 `d` 层中间节点内的槽位为 depth `d`；
//!   depth `height - 2` 的槽位直接指向叶子块；
//! - **level**：节点层级，中间节点位于 level `1..=height-2`，叶子位于 level `height - 1`。

use crate::error::ConfigError;

/// 节点槽位字节数：中间节点把子节点引用按 8 字节小端整数存放在自身块内。
pub const SLOT_SIZE: usize = 8;

/// 允许的最大块大小（2^31），保证存活字节计数与块内偏移落在 32 位以内。
pub const MAX_CHUNK_SIZE: usize = 1 << 31;

/// 一组合法配置推导出的全部常量。
///
/// # 契约说明（What）
/// - 只能通过 [`Geometry::new`]（或 [`NetBufConfig::validate`](crate::NetBufConfig::validate)）构造，
///   构造成功即代表配置合法且 `capacity` 可用 `usize` 表示；
/// - 实例不可变，可自由复制并在多棵树之间共享。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    chunk_size: usize,
    l0_size: usize,
    height: usize,
    middle_size: usize,
    chunk_shift: u32,
    middle_shift: u32,
    root_shift: u32,
    subtree_cardinality: usize,
    capacity: usize,
}

impl Geometry {
    /// 校验 `(chunk_size, l0_size, height)` 并推导派生常量。
    pub fn new(chunk_size: usize, l0_size: usize, height: usize) -> Result<Self, ConfigError> {
        if !chunk_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "chunk_size",
                value: chunk_size,
            });
        }
        if chunk_size < 2 * SLOT_SIZE {
            return Err(ConfigError::ChunkTooSmall {
                chunk_size,
                minimum: 2 * SLOT_SIZE,
            });
        }
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ChunkTooLarge {
                chunk_size,
                maximum: MAX_CHUNK_SIZE,
            });
        }
        if !l0_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "l0_size",
                value: l0_size,
            });
        }
        if l0_size < 2 {
            return Err(ConfigError::RootTooSmall { l0_size });
        }
        if height < 2 {
            return Err(ConfigError::HeightTooSmall { height });
        }

        let middle_size = chunk_size / SLOT_SIZE;
        let overflow = || ConfigError::CapacityOverflow {
            chunk_size,
            l0_size,
            height,
        };
        let middle_levels = u32::try_from(height - 2).map_err(|_| overflow())?;
        let subtree_cardinality = middle_size
            .checked_pow(middle_levels)
            .and_then(|fanout| fanout.checked_mul(chunk_size))
            .ok_or_else(overflow)?;
        let capacity = subtree_cardinality
            .checked_mul(l0_size)
            .ok_or_else(overflow)?;

        let chunk_shift = chunk_size.trailing_zeros();
        let middle_shift = middle_size.trailing_zeros();
        Ok(Self {
            chunk_size,
            l0_size,
            height,
            middle_size,
            chunk_shift,
            middle_shift,
            root_shift: chunk_shift + middle_levels * middle_shift,
            subtree_cardinality,
            capacity,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn l0_size(&self) -> usize {
        self.l0_size
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// 每个中间节点的槽位数：`chunk_size / SLOT_SIZE`。
    pub fn middle_size(&self) -> usize {
        self.middle_size
    }

    /// 单个根槽位下可达的逻辑字节数。
    pub fn subtree_cardinality(&self) -> usize {
        self.subtree_cardinality
    }

    /// 整棵树可达的逻辑字节数。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 根数组索引。
    #[inline]
    pub fn root_index(&self, pos: usize) -> usize {
        (pos >> self.root_shift) & (self.l0_size - 1)
    }

    /// 第 `level` 层中间节点内的槽位索引，`level ∈ 1..=height-2`。
    #[inline]
    pub fn mid_index(&self, pos: usize, level: usize) -> usize {
        debug_assert!(level >= 1 && level + 1 < self.height, "level {level} out of range");
        let shift = self.chunk_shift + (self.height - 2 - level) as u32 * self.middle_shift;
        (pos >> shift) & (self.middle_size - 1)
    }

    /// 叶子块内的字节偏移。
    #[inline]
    pub fn chunk_offset(&self, pos: usize) -> usize {
        pos & (self.chunk_size - 1)
    }

    /// depth `depth` 的槽位索引：depth 0 为根索引，其余为对应层级的中间索引。
    #[inline]
    pub fn index_at_depth(&self, pos: usize, depth: usize) -> usize {
        if depth == 0 {
            self.root_index(pos)
        } else {
            self.mid_index(pos, depth)
        }
    }

    /// depth `depth` 的单个槽位覆盖的逻辑字节数，`depth ∈ 0..=height-2`。
    #[inline]
    pub fn span(&self, depth: usize) -> usize {
        debug_assert!(depth + 2 <= self.height, "depth {depth} out of range");
        1usize << (self.chunk_shift + (self.height - 2 - depth) as u32 * self.middle_shift)
    }

    #[inline]
    pub fn align_down_chunk(&self, pos: usize) -> usize {
        pos & !(self.chunk_size - 1)
    }

    /// 向上对齐到块边界；调用方保证结果不溢出。
    #[inline]
    pub fn align_up_chunk(&self, pos: usize) -> usize {
        (pos + self.chunk_size - 1) & !(self.chunk_size - 1)
    }

    #[inline]
    pub fn align_down_subtree(&self, pos: usize) -> usize {
        pos & !(self.subtree_cardinality - 1)
    }

    /// 完整路径：`[root, mid_1, ..., mid_{height-2}, chunk_offset]`。
    pub fn path(&self, pos: usize) -> Vec<usize> {
        let mut path = Vec::with_capacity(self.height);
        path.push(self.root_index(pos));
        path.extend((1..self.height - 1).map(|level| self.mid_index(pos, level)));
        path.push(self.chunk_offset(pos));
        path
    }

    /// 把 `[pos, pos + len)` 拆成逐块的片段。
    pub fn segments(&self, pos: usize, len: usize) -> Segments {
        Segments {
            chunk_size: self.chunk_size,
            pos,
            remaining: len,
        }
    }
}

/// 落在单个叶子块内的一段逻辑区间。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment {
    /// 片段起点的逻辑位置。
    pub pos: usize,
    /// 片段起点在块内的偏移。
    pub offset: usize,
    /// 片段长度，恒为 `min(剩余长度, chunk_size - offset)`。
    pub len: usize,
}

/// [`Geometry::segments`] 返回的迭代器。
#[derive(Clone, Debug)]
pub struct Segments {
    chunk_size: usize,
    pos: usize,
    remaining: usize,
}

impl Iterator for Segments {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if self.remaining == 0 {
            return None;
        }
        let offset = self.pos & (self.chunk_size - 1);
        let len = self.remaining.min(self.chunk_size - offset);
        let segment = Segment {
            pos: self.pos,
            offset,
            len,
        };
        self.pos += len;
        self.remaining -= len;
        Some(segment)
    }
}
