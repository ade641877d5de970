//! 同步原语切换层。
//!
//! 常规构建使用 `std` 原子与 `spin::Mutex`；启用 `--cfg loom`（或 `spark_loom`）并打开
//! `loom-model` 特性时切换到 loom 提供的实现，以便模型检查器枚举 `free` 的并发交错。
//! 对外仅暴露 `lock()` 这一种加锁方式，两种实现的调用点保持一致。

#[cfg(not(any(loom, spark_loom)))]
pub(crate) use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
#[cfg(any(loom, spark_loom))]
pub(crate) use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(not(any(loom, spark_loom)))]
pub(crate) struct Mutex<T> {
    inner: spin::Mutex<T>,
}

#[cfg(not(any(loom, spark_loom)))]
impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, T> {
        self.inner.lock()
    }
}

#[cfg(any(loom, spark_loom))]
pub(crate) struct Mutex<T> {
    inner: loom::sync::Mutex<T>,
}

#[cfg(any(loom, spark_loom))]
impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: loom::sync::Mutex::new(value),
        }
    }

    pub(crate) fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
        // loom 的 Mutex 不会中毒：持锁线程 panic 时模型直接失败。
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
