use std::{fmt, ops, sync::Arc};

use crate::{
    error::{ConfigError, NetBufError},
    sync::{AtomicU64, AtomicUsize, Mutex, Ordering},
};

/// 自由链表枯竭时单次补充的块数上限。
pub const CHUNK_BATCH: usize = 16;

/// 固定大小的原始字节块，树中的叶子数据与中间节点都占用一个块。
///
/// # 契约说明（What）
/// - 长度恒等于产出它的分配器的 [`ChunkAllocator::chunk_size`]；
/// - 内容不保证清零：复用块会保留上一次使用留下的字节，需要干净内容的调用方自行清零。
pub struct Chunk {
    bytes: Box<[u8]>,
}

impl Chunk {
    /// 从堆上预留一个块，预留失败时返回 `None` 而不是中止进程。
    fn reserve(chunk_size: usize) -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(chunk_size).ok()?;
        bytes.resize(chunk_size, 0);
        Some(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl ops::Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl ops::DerefMut for Chunk {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("len", &self.len()).finish()
    }
}

/// 分配器统计快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChunkStats {
    /// 每个块的字节数。
    pub chunk_size: usize,
    /// 累计向堆预留的块数（只增不减）。
    pub reserved_chunks: usize,
    /// 当前被借出、尚未归还的块数。
    pub outstanding_chunks: usize,
    /// 当前停留在自由链表上的块数。
    pub free_chunks: usize,
    /// 因枯竭而失败的分配次数。
    pub failed_allocations: u64,
}

/// 固定块大小分配器契约。
///
/// # 设计初衷（Why）
/// - 分块树的每个节点（叶子数据块或中间索引块）都是 `chunk_size` 字节，分配器只需要处理单一尺寸；
/// - 树通过 `Arc<dyn ChunkAllocator>` 显式持有分配器句柄，同一块大小的多棵树可以共享一个实例。
///
/// # 契约定义（What）
/// - `allocate` 返回的块长度必须等于 `chunk_size()`；枯竭时返回
///   [`NetBufError::AllocationFailure`]，不得 panic；
/// - `release` 只接收本分配器产出的块；实现必须线程安全，且调用过程中不得 panic；
/// - 任何包装实现（例如 [`TracingAllocator`](crate::TracingAllocator)）都不得改变上述语义。
pub trait ChunkAllocator: Send + Sync + 'static {
    /// 每个块的字节数。
    fn chunk_size(&self) -> usize;

    /// 借出一个块。
    fn allocate(&self) -> Result<Chunk, NetBufError>;

    /// 归还一个块。
    fn release(&self, chunk: Chunk);

    /// 读取统计快照。
    fn stats(&self) -> ChunkStats;
}

/// `FreeListAllocator` 提供基于自由链表（Free List）的固定块分配器，
/// 面向**高频借还、尺寸统一**的节点分配场景。
///
/// # 模块角色（Why）
/// - 作为分块树默认的块来源，借还路径只做一次链表弹出/压入；
/// - 块一旦从堆上预留便不再归还给堆，分配器只增长，内存峰值由使用峰值决定。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<Chunk>>` 作为自由链表，`allocate` 从尾部弹出，`release` 压回尾部；
/// - 链表为空时补充至多 [`CHUNK_BATCH`] 个块（受 `chunk_limit` 约束时按剩余额度截断），
///   每个块是一次独立的堆分配，经 `try_reserve_exact` 让堆不足表现为 `AllocationFailure` 而非进程中止；
///   中途失败时已得到的块保留在链表中；
/// - `AllocatorMetrics` 通过原子计数跟踪预留、借出与失败次数，支撑 [`ChunkStats`] 快照。
///
/// # 契约说明（What）
/// - **线程安全**：共享状态由自旋锁与原子计数保护，满足 `Send + Sync + 'static`；
/// - **额度**：设置 `chunk_limit` 后，累计预留块数永远不会超过该值，超出的请求返回
///   [`NetBufError::AllocationFailure`]。
pub struct FreeListAllocator {
    chunk_size: usize,
    chunk_limit: Option<usize>,
    free_list: Mutex<Vec<Chunk>>,
    metrics: AllocatorMetrics,
}

impl FreeListAllocator {
    /// 创建不限额度的分配器。
    pub fn new(chunk_size: usize) -> Result<Self, ConfigError> {
        Self::build(chunk_size, None)
    }

    /// 创建最多预留 `chunk_limit` 个块的分配器。
    pub fn with_limit(chunk_size: usize, chunk_limit: usize) -> Result<Self, ConfigError> {
        Self::build(chunk_size, Some(chunk_limit))
    }

    /// 创建并包装为可共享句柄。
    pub fn shared(chunk_size: usize) -> Result<Arc<Self>, ConfigError> {
        Self::new(chunk_size).map(Arc::new)
    }

    fn build(chunk_size: usize, chunk_limit: Option<usize>) -> Result<Self, ConfigError> {
        if !chunk_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "chunk_size",
                value: chunk_size,
            });
        }
        if chunk_limit == Some(0) {
            return Err(ConfigError::ZeroChunkLimit);
        }
        Ok(Self {
            chunk_size,
            chunk_limit,
            free_list: Mutex::new(Vec::new()),
            metrics: AllocatorMetrics::new(),
        })
    }

    /// 额度上限，`None` 表示不限。
    pub fn chunk_limit(&self) -> Option<usize> {
        self.chunk_limit
    }

    /// 逐块向堆预留至多 [`CHUNK_BATCH`] 个块并挂入自由链表，返回实际预留的块数。
    ///
    /// 调用方必须持有自由链表的锁（由参数 `list` 体现）。
    fn fill(&self, list: &mut Vec<Chunk>) -> usize {
        let reserved = self.metrics.reserved_chunks.load(Ordering::Relaxed);
        let batch = match self.chunk_limit {
            Some(limit) => CHUNK_BATCH.min(limit.saturating_sub(reserved)),
            None => CHUNK_BATCH,
        };
        if batch == 0 || list.try_reserve(batch).is_err() {
            return 0;
        }
        let mut filled = 0;
        while filled < batch {
            match Chunk::reserve(self.chunk_size) {
                Some(chunk) => list.push(chunk),
                None => break,
            }
            filled += 1;
        }
        self.metrics
            .reserved_chunks
            .fetch_add(filled, Ordering::Relaxed);
        tracing::trace!(
            chunk_size = self.chunk_size,
            filled,
            reserved = reserved + filled,
            "netbuf.allocator.fill"
        );
        filled
    }
}

impl ChunkAllocator for FreeListAllocator {
    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn allocate(&self) -> Result<Chunk, NetBufError> {
        let mut list = self.free_list.lock();
        if list.is_empty() && self.fill(&mut list) == 0 {
            drop(list);
            self.metrics
                .failed_allocations
                .fetch_add(1, Ordering::Relaxed);
            return Err(NetBufError::AllocationFailure {
                chunk_size: self.chunk_size,
                reserved: self.metrics.reserved_chunks.load(Ordering::Relaxed),
            });
        }
        match list.pop() {
            Some(chunk) => {
                self.metrics.outstanding_chunks.fetch_add(1, Ordering::Relaxed);
                Ok(chunk)
            }
            // fill 成功后链表非空。
            None => Err(NetBufError::AllocationFailure {
                chunk_size: self.chunk_size,
                reserved: self.metrics.reserved_chunks.load(Ordering::Relaxed),
            }),
        }
    }

    fn release(&self, chunk: Chunk) {
        debug_assert_eq!(chunk.len(), self.chunk_size, "foreign chunk released");
        self.free_list.lock().push(chunk);
        saturating_sub(&self.metrics.outstanding_chunks, 1);
    }

    fn stats(&self) -> ChunkStats {
        let free_chunks = self.free_list.lock().len();
        ChunkStats {
            chunk_size: self.chunk_size,
            reserved_chunks: self.metrics.reserved_chunks.load(Ordering::Relaxed),
            outstanding_chunks: self.metrics.outstanding_chunks.load(Ordering::Relaxed),
            free_chunks,
            failed_allocations: self.metrics.failed_allocations.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for FreeListAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeListAllocator")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_limit", &self.chunk_limit)
            .field("stats", &self.stats())
            .finish()
    }
}

struct AllocatorMetrics {
    reserved_chunks: AtomicUsize,
    outstanding_chunks: AtomicUsize,
    failed_allocations: AtomicU64,
}

impl AllocatorMetrics {
    fn new() -> Self {
        Self {
            reserved_chunks: AtomicUsize::new(0),
            outstanding_chunks: AtomicUsize::new(0),
            failed_allocations: AtomicU64::new(0),
        }
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_allocation_reserves_a_batch() {
        let allocator = FreeListAllocator::new(64).expect("合法块大小");
        let chunk = allocator.allocate().expect("首次分配");
        assert_eq!(chunk.len(), 64);

        let stats = allocator.stats();
        assert_eq!(stats.reserved_chunks, CHUNK_BATCH);
        assert_eq!(stats.outstanding_chunks, 1);
        assert_eq!(stats.free_chunks, CHUNK_BATCH - 1);
    }

    #[test]
    fn released_chunks_are_reused_before_reserving_more() {
        let allocator = FreeListAllocator::new(64).expect("合法块大小");
        let chunks: Vec<_> = (0..CHUNK_BATCH)
            .map(|_| allocator.allocate().expect("批内分配"))
            .collect();
        for chunk in chunks {
            allocator.release(chunk);
        }
        let _again = allocator.allocate().expect("复用分配");
        let stats = allocator.stats();
        assert_eq!(stats.reserved_chunks, CHUNK_BATCH, "不应再次向堆预留");
        assert_eq!(stats.outstanding_chunks, 1);
    }

    #[test]
    fn limit_truncates_batches_and_fails_when_exhausted() {
        let allocator = FreeListAllocator::with_limit(64, 3).expect("合法额度");
        let held: Vec<_> = (0..3).map(|_| allocator.allocate().expect("额度内")).collect();
        assert_eq!(allocator.stats().reserved_chunks, 3);

        let err = allocator.allocate().expect_err("额度耗尽");
        assert_eq!(err.code(), "netbuf.allocation_failure");
        assert_eq!(allocator.stats().failed_allocations, 1);

        drop(held);
        // 块被丢弃而非归还：借出计数保持，额度也不会回升。
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(FreeListAllocator::new(100).is_err());
        assert_eq!(
            FreeListAllocator::with_limit(64, 0).err(),
            Some(ConfigError::ZeroChunkLimit)
        );
    }
}
