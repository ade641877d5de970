//! 分配器观测包装层。

use std::{thread, time::Duration};

use crate::{
    allocator::{Chunk, ChunkAllocator, ChunkStats},
    error::NetBufError,
};

/// 为任意 [`ChunkAllocator`] 附加 `tracing` 事件与可选人工延迟的装饰器。
///
/// # 教案式说明
/// - **意图 (Why)**：压测时需要看到每一次块借还以及它们在时间轴上的位置，而不改动分配器本身；
/// - **逻辑 (How)**：`allocate`/`release` 前后各发出一条 `trace` 事件，失败路径发出 `debug` 事件；
///   配置了 `delay` 时在转发前休眠，用于模拟慢速内存来源；
/// - **契约 (What)**：返回值、错误与统计全部透传自内层分配器，语义与内层完全一致。
#[derive(Debug)]
pub struct TracingAllocator<A> {
    inner: A,
    label: &'static str,
    delay: Option<Duration>,
}

impl<A: ChunkAllocator> TracingAllocator<A> {
    pub fn new(inner: A, label: &'static str) -> Self {
        Self {
            inner,
            label,
            delay: None,
        }
    }

    /// 每次借还前人为插入的延迟。
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    fn pause(&self) {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
    }
}

impl<A: ChunkAllocator> ChunkAllocator for TracingAllocator<A> {
    fn chunk_size(&self) -> usize {
        self.inner.chunk_size()
    }

    fn allocate(&self) -> Result<Chunk, NetBufError> {
        tracing::trace!(label = self.label, "netbuf.chunk.allocate.begin");
        self.pause();
        match self.inner.allocate() {
            Ok(chunk) => {
                tracing::trace!(
                    label = self.label,
                    chunk_size = chunk.len(),
                    "netbuf.chunk.allocate.end"
                );
                Ok(chunk)
            }
            Err(err) => {
                tracing::debug!(label = self.label, code = err.code(), %err, "netbuf.chunk.allocate.failed");
                Err(err)
            }
        }
    }

    fn release(&self, chunk: Chunk) {
        tracing::trace!(label = self.label, chunk_size = chunk.len(), "netbuf.chunk.release.begin");
        self.pause();
        self.inner.release(chunk);
        tracing::trace!(label = self.label, "netbuf.chunk.release.end");
    }

    fn stats(&self) -> ChunkStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FreeListAllocator;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn forwards_and_logs_every_call() {
        let allocator = TracingAllocator::new(
            FreeListAllocator::new(64).expect("合法块大小"),
            "unit",
        );
        let chunk = allocator.allocate().expect("分配");
        assert_eq!(allocator.stats().outstanding_chunks, 1);
        allocator.release(chunk);
        assert_eq!(allocator.stats().outstanding_chunks, 0);

        assert!(logs_contain("netbuf.chunk.allocate.end"));
        assert!(logs_contain("netbuf.chunk.release.end"));
    }

    #[traced_test]
    #[test]
    fn failures_pass_through_unchanged() {
        let allocator = TracingAllocator::new(
            FreeListAllocator::with_limit(64, 1).expect("合法额度"),
            "limited",
        )
        .with_delay(Duration::from_millis(1));
        let _held = allocator.allocate().expect("额度内");
        let err = allocator.allocate().expect_err("额度耗尽");
        assert_eq!(err.code(), "netbuf.allocation_failure");
        assert!(logs_contain("netbuf.chunk.allocate.failed"));
    }
}
