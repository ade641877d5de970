//! `spark-netbuf` 提供面向网络 I/O 路径的稀疏分块树形逻辑缓冲。
//!
//! # 模块定位（Why）
//! - 收发路径需要一段只在尾部增长、在头部被消费的逻辑字节区间，并要求任意位置可随机读写；
//! - 连续的 `BytesMut` 在增长时会搬移数据，且按峰值预留内存；分块树只为实际使用的块付费，
//!   已写入的数据在增长过程中地址不变。
//!
//! # 设计概要（How）
//! - `geometry`：把逻辑位置分解为“根索引 → 中间层索引 → 块内偏移”，全部为移位与掩码运算；
//! - `allocator`：`ChunkAllocator` 契约与默认的 `FreeListAllocator`（`spin::Mutex` 自由链表、批量预留）；
//! - `tree`：`NetBuffer` 本体，负责增长、收缩、部分释放、环形前移与随机访问；
//! - `config`：基于 `serde`/`toml` 的构造期配置与校验；
//! - `instrument`：`TracingAllocator` 装饰器，为任意分配器附加 `tracing` 事件；
//! - `error`：带稳定错误码的 `NetBufError`/`ConfigError`。
//!
//! # 使用示例
//! ```
//! use spark_netbuf::{NetBufConfig, NetBuffer};
//!
//! let config = NetBufConfig::new(128, 4, 3);
//! let mut buffer = NetBuffer::from_config(&config)?;
//! let pos = buffer.alloc(300)?;
//! buffer.write(pos, b"spark")?;
//! assert_eq!(buffer.read_array::<5>(pos)?, *b"spark");
//! buffer.unalloc(300)?;
//! assert_eq!(buffer.stats().chunks(), 0);
//! # Ok::<(), spark_netbuf::NetBufError>(())
//! ```
//!
//! # 并发约定（What）
//! - 增长、收缩、前移与写入需要 `&mut NetBuffer`；
//! - `free` 与读取只需要 `&NetBuffer`，`NetBuffer` 满足 `Send + Sync`，可经由 `Arc` 或作用域线程并发释放；
//! - 启用 `--cfg spark_loom` 与 `loom-model` 特性时，内部同步原语切换为 loom 实现。

mod allocator;
mod config;
mod error;
mod geometry;
mod instrument;
mod sync;
mod tree;

pub use allocator::{CHUNK_BATCH, Chunk, ChunkAllocator, ChunkStats, FreeListAllocator};
pub use config::{DEFAULT_CHUNK_SIZE, DEFAULT_HEIGHT, DEFAULT_L0_SIZE, NetBufConfig};
pub use error::{ConfigError, NetBufError};
pub use geometry::{Geometry, MAX_CHUNK_SIZE, SLOT_SIZE, Segment, Segments};
pub use instrument::TracingAllocator;
pub use tree::{NetBuffer, NodeId, NodeKind, ShapeNode, TreeShape, TreeStats};
