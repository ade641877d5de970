//! 并发 `free` 验证：多个线程对同一叶子的不相交子区间并发释放，块恰好归还一次。
//!
//! # 测试意图（Why）
//! - `free` 只需要 `&NetBuffer`，依赖原子递减与归零检测来决定谁归还块；
//!   若两个线程都观察到归零，块会被重复压入自由链表，后续两棵树可能共用同一块内存。
//!
//! # 检测手段（How）
//! - 用计数分配器包装默认分配器，记录 `release` 调用次数；
//! - 每轮增长一个叶子，用 `thread::scope` 让多个线程各自释放一段，再核对释放次数；
//!   随后前移 `begin`，下一轮沿根数组环绕复用槽位。

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use spark_netbuf::{
    Chunk, ChunkAllocator, ChunkStats, FreeListAllocator, NetBufConfig, NetBufError, NetBuffer,
};

/// 记录 `release` 次数的分配器装饰器。
struct CountingAllocator {
    inner: FreeListAllocator,
    releases: AtomicUsize,
}

impl ChunkAllocator for CountingAllocator {
    fn chunk_size(&self) -> usize {
        self.inner.chunk_size()
    }

    fn allocate(&self) -> Result<Chunk, NetBufError> {
        self.inner.allocate()
    }

    fn release(&self, chunk: Chunk) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(chunk);
    }

    fn stats(&self) -> ChunkStats {
        self.inner.stats()
    }
}

#[test]
fn disjoint_frees_on_one_leaf_release_it_once() {
    const THREADS: usize = 8;
    let config = NetBufConfig::new(1024, 4, 2);
    let allocator = Arc::new(CountingAllocator {
        inner: FreeListAllocator::new(1024).expect("合法块大小"),
        releases: AtomicUsize::new(0),
    });
    let mut buffer = NetBuffer::new(&config, allocator.clone()).expect("构造树");

    for round in 0..200 {
        let base = buffer.alloc(1024).expect("增长一个叶子");
        let share = 1024 / THREADS;
        let before = allocator.releases.load(Ordering::SeqCst);

        thread::scope(|scope| {
            for worker in 0..THREADS {
                let buffer = &buffer;
                scope.spawn(move || {
                    buffer
                        .free(base + worker * share, share)
                        .expect("并发释放不相交子区间");
                });
            }
        });

        assert_eq!(
            allocator.releases.load(Ordering::SeqCst) - before,
            1,
            "第 {round} 轮叶子应恰好归还一次"
        );
        assert_eq!(buffer.stats().drained_leaves, 1);
        // 前移 begin 回收排空的叶子，下一轮沿根数组环绕增长。
        buffer.advance_begin(base + 1024).expect("前移 begin");
        assert_eq!(buffer.stats().drained_leaves, 0);
    }
    assert_eq!(allocator.releases.load(Ordering::SeqCst), 200);
    assert_eq!(allocator.stats().outstanding_chunks, 0);
}

/// 跨多个叶子的并发释放：每个叶子都恰好归还一次，中间节点保持不动。
#[test]
fn overlapping_leaf_spans_release_every_leaf_once() {
    let config = NetBufConfig::new(256, 4, 3);
    let allocator = Arc::new(CountingAllocator {
        inner: FreeListAllocator::new(256).expect("合法块大小"),
        releases: AtomicUsize::new(0),
    });
    let mut buffer = NetBuffer::new(&config, allocator.clone()).expect("构造树");
    buffer.alloc(256 * 16).expect("十六个叶子");

    // 每个线程释放一段跨越叶子边界的 100 字节窗口，窗口之间互不重叠且覆盖整个区间。
    let windows: Vec<(usize, usize)> = (0..256 * 16usize)
        .step_by(100)
        .map(|start| (start, 100usize.min(256 * 16 - start)))
        .collect();
    thread::scope(|scope| {
        for chunk in windows.chunks(windows.len().div_ceil(4)) {
            let buffer = &buffer;
            scope.spawn(move || {
                for &(start, len) in chunk {
                    buffer.free(start, len).expect("释放窗口");
                }
            });
        }
    });

    assert_eq!(allocator.releases.load(Ordering::SeqCst), 16);
    let stats = buffer.stats();
    assert_eq!(stats.leaf_nodes, 0);
    assert_eq!(stats.drained_leaves, 16);
    assert_eq!(stats.interior_nodes, 1, "free 不回收中间节点");
}
