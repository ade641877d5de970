use std::{fmt, sync::Arc};

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    allocator::{Chunk, ChunkAllocator},
    config::NetBufConfig,
    error::{ConfigError, NetBufError, invariant_violation},
    geometry::{Geometry, SLOT_SIZE},
    sync::{AtomicUsize, Mutex, Ordering},
};

/// 节点在树内节点表中的稳定编号。
///
/// 中间节点把子节点编号以 `id + 1` 的形式写入自身块内的 8 字节槽位，0 表示空槽。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }

    fn encode(slot: Option<NodeId>) -> u64 {
        slot.map_or(0, |id| id.0 as u64 + 1)
    }

    fn decode(raw: u64) -> Option<NodeId> {
        raw.checked_sub(1).map(|index| NodeId(index as usize))
    }
}

/// 节点角色，由所在层级决定：level `height - 1` 为叶子，其余为中间节点。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeKind {
    Interior,
    Leaf,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EntryState {
    Vacant,
    Occupied(NodeKind),
}

/// 节点表中的一项。
///
/// - `live`：叶子的存活字节计数；中间节点创建时写入 `middle_size`，此后不再使用；
/// - `chunk`：节点占用的块。叶子被 `free` 排空后为 `None`，编号保留到收缩或环回收时才回收。
struct NodeEntry {
    state: EntryState,
    live: AtomicUsize,
    chunk: Mutex<Option<Chunk>>,
}

impl NodeEntry {
    fn vacant() -> Self {
        Self {
            state: EntryState::Vacant,
            live: AtomicUsize::new(0),
            chunk: Mutex::new(None),
        }
    }
}

/// 槽位所在位置：根数组或某个中间节点块内。
#[derive(Clone, Copy, Debug)]
enum SlotLoc {
    Root(usize),
    Child { parent: NodeId, index: usize },
}

/// 一次 `alloc` 调用对树的修改，用于失败时的补偿释放。
#[derive(Clone, Copy, Debug)]
enum Undo {
    /// 新建节点并写入槽位。
    Created { loc: SlotLoc, id: NodeId },
    /// 为尾部已排空的叶子重新挂上块。
    Refilled { id: NodeId },
}

/// 树的节点统计。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TreeStats {
    pub begin: usize,
    pub end: usize,
    pub interior_nodes: usize,
    /// 仍持有块的叶子数。
    pub leaf_nodes: usize,
    /// 已被 `free` 排空、等待收缩回收编号的叶子数。
    pub drained_leaves: usize,
    /// 所有叶子存活字节计数之和。
    pub live_bytes: usize,
}

impl TreeStats {
    /// 当前占用的块数（中间节点 + 持有块的叶子）。
    pub fn chunks(&self) -> usize {
        self.interior_nodes + self.leaf_nodes
    }
}

/// 形状快照中的单个节点。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ShapeNode {
    /// 从根数组开始的槽位索引序列。
    pub path: Vec<usize>,
    pub id: NodeId,
    pub kind: NodeKind,
    pub live: usize,
    pub materialized: bool,
}

/// 整棵树的结构快照，按深度优先、槽位升序排列。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeShape {
    pub begin: usize,
    pub end: usize,
    pub nodes: Vec<ShapeNode>,
}

/// `NetBuffer`：以固定深度分块树承载的稀疏逻辑字节缓冲。
///
/// # 设计背景（Why）
/// - 网络收发路径需要一段随时增长、收缩并可随机访问的逻辑区间 `[begin, end)`，
///   但不能为最坏情况预留一整块连续内存，也不能在增长时搬移已有数据；
/// - 树的每个节点都是一个 `chunk_size` 字节的块：叶子块保存数据，中间块保存子节点槽位，
///   内存占用只随实际使用的块数增长。
///
/// # 逻辑解析（How）
/// - 根数组有 `l0_size` 个槽位，按逻辑位置取模形成环；每个根槽位下是一棵覆盖
///   `subtree_cardinality` 字节的子树；
/// - [`alloc`](Self::alloc) 以块为单位向尾部增长，在子树起点处创建中间节点，尾部叶子已被排空时先为它补回块，
///   并把本次的全部修改记入日志；
///   任何一次块分配失败都会按日志逆序补偿释放，保证“全部成功或完全不变”；
/// - [`unalloc`](Self::unalloc) 从尾部逐块拆除，在拆到子树起点时一并回收覆盖它的中间节点；
/// - [`free`](Self::free) 只通过 `&self` 原子递减叶子的存活字节计数，恰好一个调用方观察到归零并归还块；
/// - [`advance_begin`](Self::advance_begin) 前移 `begin`，整棵落在对齐起点之下的子树被回收，
///   环绕增长时对应根槽位一定为空。
///
/// # 契约说明（What）
/// - `begin ≤ end`，且 `end - align_down(begin, subtree_cardinality) ≤ capacity`；
/// - `alloc`/`unalloc`/`advance_begin`/写入需要独占引用；`free` 与读取可以并发；
/// - 节点缺失或槽位被意外占用属于内部不变量破坏，直接 panic；
/// - 实例销毁时把仍持有的全部块归还给分配器。
pub struct NetBuffer {
    geometry: Geometry,
    allocator: Arc<dyn ChunkAllocator>,
    begin: usize,
    end: usize,
    roots: Box<[Option<NodeId>]>,
    nodes: Vec<NodeEntry>,
    vacant: Vec<NodeId>,
}

impl NetBuffer {
    /// 校验配置并绑定分配器。
    pub fn new(
        config: &NetBufConfig,
        allocator: Arc<dyn ChunkAllocator>,
    ) -> Result<Self, NetBufError> {
        let geometry = config.validate()?;
        Self::with_geometry(geometry, allocator)
    }

    /// 使用配置构造默认的自由链表分配器并创建树。
    pub fn from_config(config: &NetBufConfig) -> Result<Self, NetBufError> {
        let allocator = config.build_allocator()?;
        Self::new(config, allocator)
    }

    pub fn with_geometry(
        geometry: Geometry,
        allocator: Arc<dyn ChunkAllocator>,
    ) -> Result<Self, NetBufError> {
        if allocator.chunk_size() != geometry.chunk_size() {
            return Err(ConfigError::ChunkSizeMismatch {
                expected: geometry.chunk_size(),
                actual: allocator.chunk_size(),
            }
            .into());
        }
        Ok(Self {
            geometry,
            allocator,
            begin: 0,
            end: 0,
            roots: vec![None; geometry.l0_size()].into_boxed_slice(),
            nodes: Vec::new(),
            vacant: Vec::new(),
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn allocator(&self) -> &Arc<dyn ChunkAllocator> {
        &self.allocator
    }

    /// 最早的有效逻辑位置。
    pub fn begin(&self) -> usize {
        self.begin
    }

    /// 最新逻辑位置之后一位，即追加游标。
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// 在不违反容量约束的前提下还能追加的字节数。
    pub fn available(&self) -> usize {
        let reserved_begin = self.geometry.align_down_subtree(self.begin);
        self.geometry.capacity() - (self.end - reserved_begin)
    }

    /// 向尾部追加 `count` 字节，返回新区间的起始逻辑位置（即调用前的 `end`）。
    ///
    /// # 契约说明（What）
    /// - 超出容量时返回 [`NetBufError::CapacityExceeded`]，不做任何修改；
    /// - 分配器枯竭时返回 [`NetBufError::AllocationFailure`]，本次新建的节点已全部归还，
    ///   `end` 与树形状与调用前一致；
    /// - `alloc(0)` 直接返回当前 `end`；
    /// - `end` 落在一个已被 `free` 排空的叶子内部时（先释放再收缩），增长会为该叶子重新挂上块，
    ///   `end` 之前的字节仍计为已释放，新的存活计数为 `chunk_size - chunk_offset(end)`。
    pub fn alloc(&mut self, count: usize) -> Result<usize, NetBufError> {
        let chunk_size = self.geometry.chunk_size();
        let capacity = self.geometry.capacity();
        let available = self.available();
        let new_end = self
            .end
            .checked_add(count)
            .filter(|end| count <= available && end.checked_add(chunk_size).is_some());
        let Some(new_end) = new_end else {
            tracing::debug!(
                requested = count,
                available,
                capacity,
                "netbuf.alloc.capacity_exceeded"
            );
            return Err(NetBufError::CapacityExceeded {
                requested: count,
                available,
                capacity,
            });
        };

        let mut cursor = self.geometry.align_up_chunk(self.end);
        let mut journal = Vec::new();
        let mut step = if count > 0 && cursor != self.end {
            self.refill_tail(&mut journal)
        } else {
            Ok(())
        };
        while step.is_ok() && cursor < new_end {
            step = self.materialize(cursor, &mut journal);
            if step.is_ok() {
                cursor += chunk_size;
            }
        }
        if let Err(err) = step {
            tracing::debug!(
                end = self.end,
                requested = count,
                failed_at = cursor,
                created = journal.len(),
                code = err.code(),
                "netbuf.alloc.rollback"
            );
            self.rollback(journal);
            return Err(err);
        }

        let previous = self.end;
        self.end = new_end;
        tracing::debug!(
            from = previous,
            to = new_end,
            created = journal.len(),
            "netbuf.alloc"
        );
        Ok(previous)
    }

    /// 从尾部移除 `count` 字节。
    ///
    /// - 收缩后 `end` 不得低于 `begin`，否则返回 [`NetBufError::ContractViolation`] 且不做修改；
    /// - 已被 `free` 排空的叶子只回收节点编号，不会再次归还块。
    pub fn unalloc(&mut self, count: usize) -> Result<(), NetBufError> {
        let live = self.end - self.begin;
        if count > live {
            return Err(NetBufError::contract(
                "unalloc",
                format!(
                    "cannot remove {count} bytes: only {live} bytes lie between begin {} and end {}",
                    self.begin, self.end
                ),
            ));
        }

        let chunk_size = self.geometry.chunk_size();
        let new_end = self.end - count;
        let floor = self.geometry.align_up_chunk(new_end);
        let mut cursor = self.geometry.align_up_chunk(self.end);
        let mut subtree_roots = Vec::with_capacity(self.geometry.height());
        let mut removed = 0usize;
        let mut drained = 0usize;
        while cursor > floor {
            cursor -= chunk_size;
            if !self.dismantle(cursor, &mut subtree_roots) {
                drained += 1;
            }
            removed += 1;
        }

        tracing::debug!(
            from = self.end,
            to = new_end,
            removed,
            drained,
            "netbuf.unalloc"
        );
        self.end = new_end;
        Ok(())
    }

    /// 把 `begin` 前移到 `pos`。
    ///
    /// 整棵落在 `align_down(pos, subtree_cardinality)` 之下的子树会被整体回收，
    /// 包括其中尚未被 `free` 排空的叶子。
    pub fn advance_begin(&mut self, pos: usize) -> Result<(), NetBufError> {
        if pos < self.begin {
            return Err(NetBufError::contract(
                "advance_begin",
                format!("begin cannot move backwards from {} to {pos}", self.begin),
            ));
        }
        if pos > self.end {
            return Err(NetBufError::contract(
                "advance_begin",
                format!("begin {pos} would pass end {}", self.end),
            ));
        }

        let subtree = self.geometry.subtree_cardinality();
        let mut start = self.geometry.align_down_subtree(self.begin);
        let floor = self.geometry.align_down_subtree(pos);
        self.begin = pos;
        while start < floor {
            let root = self.geometry.root_index(start);
            let Some(id) = self.roots[root].take() else {
                invariant_violation("advance_begin", "consumed subtree has no root node");
            };
            let (interiors, leaves) = self.release_subtree(id, 1);
            tracing::debug!(start, root, interiors, leaves, "netbuf.subtree.reclaimed");
            start += subtree;
        }
        Ok(())
    }

    /// 释放逻辑区间 `[pos, pos + size)` 的引用计数。
    ///
    /// # 契约说明（What）
    /// - 区间必须落在 `[align_down(begin, subtree_cardinality), end)` 内；`size == 0` 为空操作；
    /// - 每个被覆盖的叶子按重叠字节数原子递减，归零的叶子立即把块归还给分配器；
    /// - 对同一叶子的并发调用中恰好一个观察到归零；
    /// - 释放量超过叶子剩余存活字节时返回 [`NetBufError::ContractViolation`]，该叶子不受影响，
    ///   此前已处理的叶子保持已释放状态；
    /// - 只处理叶子，中间节点由收缩或 `advance_begin` 回收。
    pub fn free(&self, pos: usize, size: usize) -> Result<(), NetBufError> {
        if size == 0 {
            return Ok(());
        }
        let floor = self.geometry.align_down_subtree(self.begin);
        let in_range = pos >= floor && pos.checked_add(size).is_some_and(|stop| stop <= self.end);
        if !in_range {
            return Err(NetBufError::contract(
                "free",
                format!(
                    "range {pos}+{size} is outside the materialized span [{floor}, {})",
                    self.end
                ),
            ));
        }

        for segment in self.geometry.segments(pos, size) {
            let leaf = self.locate_leaf(segment.pos, "free")?;
            let entry = &self.nodes[leaf.0];
            let previous = entry
                .live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                    live.checked_sub(segment.len)
                })
                .map_err(|live| {
                    NetBufError::contract(
                        "free",
                        format!(
                            "releasing {} bytes at {} but the leaf has only {live} live bytes",
                            segment.len, segment.pos
                        ),
                    )
                })?;
            if previous == segment.len {
                let Some(chunk) = entry.chunk.lock().take() else {
                    invariant_violation("free", "leaf crossed zero twice");
                };
                self.allocator.release(chunk);
                tracing::trace!(pos = segment.pos, leaf = leaf.0, "netbuf.free.leaf_released");
            }
        }
        Ok(())
    }

    pub fn get_byte(&self, pos: usize) -> Result<u8, NetBufError> {
        let [byte] = self.read_array::<1>(pos)?;
        Ok(byte)
    }

    pub fn set_byte(&mut self, pos: usize, value: u8) -> Result<(), NetBufError> {
        self.write(pos, &[value])
    }

    /// 把 `[pos, pos + dst.len())` 复制到 `dst`，跨块时逐块复制。
    pub fn read(&self, pos: usize, dst: &mut [u8]) -> Result<(), NetBufError> {
        self.check_access("read", pos, dst.len())?;
        let mut copied = 0;
        for segment in self.geometry.segments(pos, dst.len()) {
            let target = &mut dst[copied..copied + segment.len];
            self.with_leaf("read", segment.pos, |chunk| {
                target.copy_from_slice(&chunk[segment.offset..segment.offset + segment.len]);
            })?;
            copied += segment.len;
        }
        Ok(())
    }

    /// 从 `src` 写入 `[pos, pos + src.len())`，跨块时逐块复制。
    pub fn write(&mut self, pos: usize, src: &[u8]) -> Result<(), NetBufError> {
        self.check_access("write", pos, src.len())?;
        let mut copied = 0;
        for segment in self.geometry.segments(pos, src.len()) {
            let source = &src[copied..copied + segment.len];
            self.with_leaf("write", segment.pos, |chunk| {
                chunk[segment.offset..segment.offset + segment.len].copy_from_slice(source);
            })?;
            copied += segment.len;
        }
        Ok(())
    }

    /// 读取定长数组，例如协议头中的整数字段。
    pub fn read_array<const N: usize>(&self, pos: usize) -> Result<[u8; N], NetBufError> {
        let mut out = [0u8; N];
        self.read(pos, &mut out)?;
        Ok(out)
    }

    pub fn write_array<const N: usize>(
        &mut self,
        pos: usize,
        value: [u8; N],
    ) -> Result<(), NetBufError> {
        self.write(pos, &value)
    }

    /// 把 `[pos, pos + len)` 复制为独立的 [`Bytes`]。
    pub fn read_bytes(&self, pos: usize, len: usize) -> Result<Bytes, NetBufError> {
        let mut out = BytesMut::zeroed(len);
        self.read(pos, &mut out)?;
        Ok(out.freeze())
    }

    /// 把 `buf` 的剩余内容写入 `pos` 起始的区间，返回写入字节数。
    pub fn write_buf<B: Buf>(&mut self, pos: usize, mut buf: B) -> Result<usize, NetBufError> {
        let total = buf.remaining();
        self.check_access("write_buf", pos, total)?;
        let mut cursor = pos;
        while buf.has_remaining() {
            let piece = buf.chunk();
            let len = piece.len();
            self.write(cursor, piece)?;
            buf.advance(len);
            cursor += len;
        }
        Ok(total)
    }

    /// 遍历节点表统计节点数量，开销与节点数成正比。
    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats {
            begin: self.begin,
            end: self.end,
            ..TreeStats::default()
        };
        for entry in &self.nodes {
            match entry.state {
                EntryState::Vacant => {}
                EntryState::Occupied(NodeKind::Interior) => stats.interior_nodes += 1,
                EntryState::Occupied(NodeKind::Leaf) => {
                    stats.live_bytes += entry.live.load(Ordering::Acquire);
                    if entry.chunk.lock().is_some() {
                        stats.leaf_nodes += 1;
                    } else {
                        stats.drained_leaves += 1;
                    }
                }
            }
        }
        stats
    }

    /// 生成结构快照，用于比较两次观测之间树形状是否一致。
    pub fn snapshot(&self) -> TreeShape {
        let mut nodes = Vec::new();
        for (root, slot) in self.roots.iter().enumerate() {
            if let Some(id) = slot {
                self.collect_shape(*id, 1, vec![root], &mut nodes);
            }
        }
        TreeShape {
            begin: self.begin,
            end: self.end,
            nodes,
        }
    }

    fn collect_shape(&self, id: NodeId, level: usize, path: Vec<usize>, out: &mut Vec<ShapeNode>) {
        let entry = &self.nodes[id.0];
        let kind = self.kind_at(level);
        let children = match kind {
            NodeKind::Interior => self.children(id),
            NodeKind::Leaf => Vec::new(),
        };
        out.push(ShapeNode {
            path: path.clone(),
            id,
            kind,
            live: entry.live.load(Ordering::Acquire),
            materialized: entry.chunk.lock().is_some(),
        });
        for (index, child) in children {
            let mut child_path = path.clone();
            child_path.push(index);
            self.collect_shape(child, level + 1, child_path, out);
        }
    }

    fn kind_at(&self, level: usize) -> NodeKind {
        if level + 1 < self.geometry.height() {
            NodeKind::Interior
        } else {
            NodeKind::Leaf
        }
    }

    /// 为块单元 `pos` 建立完整路径：子树起点处新建中间节点，最后新建叶子。
    fn materialize(&mut self, pos: usize, journal: &mut Vec<Undo>) -> Result<(), NetBufError> {
        let mut loc = SlotLoc::Root(self.geometry.root_index(pos));
        for depth in 0..self.geometry.height() - 2 {
            let existing = self.read_slot(loc);
            let at_subtree_start = pos & (self.geometry.span(depth) - 1) == 0;
            let child = match (existing, at_subtree_start) {
                (None, true) => {
                    let id = self.create_node(NodeKind::Interior)?;
                    self.write_slot(loc, Some(id));
                    journal.push(Undo::Created { loc, id });
                    id
                }
                (Some(id), false) => id,
                (Some(_), true) => {
                    invariant_violation("alloc", "interior slot occupied at a subtree start")
                }
                (None, false) => {
                    invariant_violation("alloc", "interior node missing inside a grown subtree")
                }
            };
            loc = SlotLoc::Child {
                parent: child,
                index: self.geometry.mid_index(pos, depth + 1),
            };
        }

        if self.read_slot(loc).is_some() {
            invariant_violation("alloc", "leaf slot already occupied");
        }
        let id = self.create_node(NodeKind::Leaf)?;
        self.write_slot(loc, Some(id));
        journal.push(Undo::Created { loc, id });
        Ok(())
    }

    /// `end` 未对齐且所在叶子已被排空时，为它重新借一个块。
    fn refill_tail(&mut self, journal: &mut Vec<Undo>) -> Result<(), NetBufError> {
        let unit = self.geometry.align_down_chunk(self.end);
        let Ok(leaf) = self.locate_leaf(unit, "alloc") else {
            invariant_violation("alloc", "tail leaf missing below end");
        };
        if self.nodes[leaf.0].chunk.lock().is_some() {
            return Ok(());
        }
        let chunk = self.allocator.allocate()?;
        let entry = &self.nodes[leaf.0];
        let released = self.geometry.chunk_offset(self.end);
        entry
            .live
            .store(self.geometry.chunk_size() - released, Ordering::Release);
        *entry.chunk.lock() = Some(chunk);
        journal.push(Undo::Refilled { id: leaf });
        tracing::trace!(pos = unit, leaf = leaf.0, released, "netbuf.alloc.tail_refilled");
        Ok(())
    }

    /// 按记录逆序撤销本次 `alloc` 对树的修改。
    fn rollback(&mut self, journal: Vec<Undo>) {
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Created { loc, id } => {
                    self.write_slot(loc, None);
                    if !self.retire(id) {
                        invariant_violation(
                            "alloc.rollback",
                            "node created by this call lost its chunk",
                        );
                    }
                }
                Undo::Refilled { id } => {
                    let entry = &self.nodes[id.0];
                    let Some(chunk) = entry.chunk.lock().take() else {
                        invariant_violation("alloc.rollback", "refilled leaf lost its chunk");
                    };
                    entry.live.store(0, Ordering::Release);
                    self.allocator.release(chunk);
                }
            }
        }
    }

    /// 拆除以 `pos` 开始的块单元；返回叶子在拆除前是否仍持有块。
    fn dismantle(&mut self, pos: usize, subtree_roots: &mut Vec<(SlotLoc, NodeId)>) -> bool {
        subtree_roots.clear();
        let mut loc = SlotLoc::Root(self.geometry.root_index(pos));
        for depth in 0..self.geometry.height() - 2 {
            let Some(child) = self.read_slot(loc) else {
                invariant_violation("unalloc", "interior node missing on the tail path");
            };
            if pos & (self.geometry.span(depth) - 1) == 0 {
                subtree_roots.push((loc, child));
            }
            loc = SlotLoc::Child {
                parent: child,
                index: self.geometry.mid_index(pos, depth + 1),
            };
        }

        let Some(leaf) = self.read_slot(loc) else {
            invariant_violation("unalloc", "leaf node missing on the tail path");
        };
        self.write_slot(loc, None);
        let had_chunk = self.retire(leaf);

        while let Some((loc, interior)) = subtree_roots.pop() {
            self.write_slot(loc, None);
            if !self.retire(interior) {
                invariant_violation("unalloc", "interior node without a chunk");
            }
        }
        had_chunk
    }

    /// 递归回收整棵子树，返回 `(中间节点数, 持有块的叶子数)`。
    fn release_subtree(&mut self, id: NodeId, level: usize) -> (usize, usize) {
        match self.kind_at(level) {
            NodeKind::Leaf => (0, usize::from(self.retire(id))),
            NodeKind::Interior => {
                let mut released = (1, 0);
                for (_, child) in self.children(id) {
                    let (interiors, leaves) = self.release_subtree(child, level + 1);
                    released.0 += interiors;
                    released.1 += leaves;
                }
                if !self.retire(id) {
                    invariant_violation("advance_begin", "interior node without a chunk");
                }
                released
            }
        }
    }

    fn check_access(&self, operation: &'static str, pos: usize, len: usize) -> Result<(), NetBufError> {
        let inside = pos >= self.begin && pos.checked_add(len).is_some_and(|stop| stop <= self.end);
        if inside {
            Ok(())
        } else {
            Err(NetBufError::contract(
                operation,
                format!(
                    "range {pos}+{len} is outside [{}, {})",
                    self.begin, self.end
                ),
            ))
        }
    }

    /// 沿路径找到覆盖 `pos` 的叶子编号。
    fn locate_leaf(&self, pos: usize, operation: &'static str) -> Result<NodeId, NetBufError> {
        let mut loc = SlotLoc::Root(self.geometry.root_index(pos));
        for depth in 0..self.geometry.height() - 1 {
            let Some(id) = self.read_slot(loc) else {
                return Err(NetBufError::contract(
                    operation,
                    format!("position {pos} is not materialized"),
                ));
            };
            if depth + 2 == self.geometry.height() {
                return Ok(id);
            }
            loc = SlotLoc::Child {
                parent: id,
                index: self.geometry.mid_index(pos, depth + 1),
            };
        }
        // height ≥ 2，循环至少执行一次并在最后一层返回。
        Err(NetBufError::contract(
            operation,
            format!("position {pos} is not materialized"),
        ))
    }

    fn with_leaf<R>(
        &self,
        operation: &'static str,
        pos: usize,
        access: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, NetBufError> {
        let leaf = self.locate_leaf(pos, operation)?;
        let mut guard = self.nodes[leaf.0].chunk.lock();
        match guard.as_mut() {
            Some(chunk) => Ok(access(&mut chunk[..])),
            None => Err(NetBufError::contract(
                operation,
                format!("position {pos} lies in a leaf already released by free"),
            )),
        }
    }

    fn read_slot(&self, loc: SlotLoc) -> Option<NodeId> {
        match loc {
            SlotLoc::Root(index) => self.roots[index],
            SlotLoc::Child { parent, index } => {
                let guard = self.nodes[parent.0].chunk.lock();
                let Some(chunk) = guard.as_ref() else {
                    invariant_violation("walk", "interior node without a chunk");
                };
                NodeId::decode(read_slot_word(chunk, index))
            }
        }
    }

    fn write_slot(&mut self, loc: SlotLoc, value: Option<NodeId>) {
        match loc {
            SlotLoc::Root(index) => self.roots[index] = value,
            SlotLoc::Child { parent, index } => {
                let mut guard = self.nodes[parent.0].chunk.lock();
                let Some(chunk) = guard.as_mut() else {
                    invariant_violation("walk", "interior node without a chunk");
                };
                let start = index * SLOT_SIZE;
                chunk[start..start + SLOT_SIZE].copy_from_slice(&NodeId::encode(value).to_le_bytes());
            }
        }
    }

    /// 读取中间节点的全部非空子槽位。
    fn children(&self, id: NodeId) -> Vec<(usize, NodeId)> {
        let guard = self.nodes[id.0].chunk.lock();
        let Some(chunk) = guard.as_ref() else {
            invariant_violation("walk", "interior node without a chunk");
        };
        (0..self.geometry.middle_size())
            .filter_map(|index| NodeId::decode(read_slot_word(chunk, index)).map(|id| (index, id)))
            .collect()
    }

    fn create_node(&mut self, kind: NodeKind) -> Result<NodeId, NetBufError> {
        let mut chunk = self.allocator.allocate()?;
        let live = match kind {
            NodeKind::Interior => {
                chunk.fill(0);
                self.geometry.middle_size()
            }
            NodeKind::Leaf => self.geometry.chunk_size(),
        };
        let entry = NodeEntry {
            state: EntryState::Occupied(kind),
            live: AtomicUsize::new(live),
            chunk: Mutex::new(Some(chunk)),
        };
        let id = match self.vacant.pop() {
            Some(id) => {
                self.nodes[id.0] = entry;
                id
            }
            None => {
                self.nodes.push(entry);
                NodeId(self.nodes.len() - 1)
            }
        };
        Ok(id)
    }

    /// 回收节点编号并归还其块；返回节点在回收前是否仍持有块。
    fn retire(&mut self, id: NodeId) -> bool {
        let chunk = self.nodes[id.0].chunk.lock().take();
        self.nodes[id.0] = NodeEntry::vacant();
        self.vacant.push(id);
        match chunk {
            Some(chunk) => {
                self.allocator.release(chunk);
                true
            }
            None => false,
        }
    }
}

fn read_slot_word(chunk: &[u8], index: usize) -> u64 {
    let start = index * SLOT_SIZE;
    let mut raw = [0u8; SLOT_SIZE];
    raw.copy_from_slice(&chunk[start..start + SLOT_SIZE]);
    u64::from_le_bytes(raw)
}

impl Drop for NetBuffer {
    fn drop(&mut self) {
        let mut released = 0usize;
        for entry in &self.nodes {
            if let Some(chunk) = entry.chunk.lock().take() {
                self.allocator.release(chunk);
                released += 1;
            }
        }
        tracing::trace!(released, "netbuf.drop");
    }
}

impl fmt::Debug for NetBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetBuffer")
            .field("geometry", &self.geometry)
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("nodes", &self.nodes.len())
            .field("vacant", &self.vacant.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FreeListAllocator;

    fn scenario_tree() -> (NetBuffer, Arc<FreeListAllocator>) {
        let config = NetBufConfig::new(128, 4, 3);
        let allocator = config.build_allocator().expect("构造分配器");
        let tree = NetBuffer::new(&config, allocator.clone()).expect("构造树");
        (tree, allocator)
    }

    #[test]
    fn growth_creates_interior_nodes_at_subtree_starts() {
        let (mut tree, _allocator) = scenario_tree();
        assert_eq!(tree.alloc(2048 + 1).expect("增长"), 0);
        let stats = tree.stats();
        assert_eq!(stats.interior_nodes, 2);
        assert_eq!(stats.leaf_nodes, 17);
        assert_eq!(stats.live_bytes, 17 * 128);
    }

    #[test]
    fn partial_chunks_are_reused_by_the_next_growth() {
        let (mut tree, _allocator) = scenario_tree();
        tree.alloc(10).expect("增长");
        assert_eq!(tree.alloc(100).expect("块内增长"), 10);
        assert_eq!(tree.stats().leaf_nodes, 1);
        assert_eq!(tree.alloc(20).expect("跨块增长"), 110);
        assert_eq!(tree.stats().leaf_nodes, 2);
    }

    #[test]
    fn shrink_keeps_the_chunk_holding_the_new_tail() {
        let (mut tree, _allocator) = scenario_tree();
        tree.alloc(300).expect("增长");
        tree.unalloc(100).expect("收缩");
        assert_eq!(tree.end(), 200);
        assert_eq!(tree.stats().leaf_nodes, 2);
        tree.unalloc(72).expect("收缩到块边界");
        assert_eq!(tree.stats().leaf_nodes, 1);
    }

    #[test]
    fn unalloc_below_begin_is_rejected() {
        let (mut tree, _allocator) = scenario_tree();
        tree.alloc(256).expect("增长");
        tree.advance_begin(100).expect("前移 begin");
        let err = tree.unalloc(200).expect_err("越过 begin");
        assert_eq!(err.code(), "netbuf.contract_violation");
        assert_eq!(tree.end(), 256);
    }

    #[test]
    fn node_ids_are_recycled() {
        let (mut tree, _allocator) = scenario_tree();
        tree.alloc(1024).expect("增长");
        tree.unalloc(1024).expect("收缩");
        tree.alloc(1024).expect("再次增长");
        assert_eq!(tree.nodes.len(), 9, "编号表不应继续增长");
    }

    #[test]
    fn slot_words_round_trip_through_interior_chunks() {
        let mut chunk = vec![0u8; 32];
        chunk[8..16].copy_from_slice(&NodeId::encode(Some(NodeId(41))).to_le_bytes());
        assert_eq!(NodeId::decode(read_slot_word(&chunk, 1)), Some(NodeId(41)));
        assert_eq!(NodeId::decode(read_slot_word(&chunk, 0)), None);
    }

    #[test]
    fn buffer_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NetBuffer>();
    }

    #[test]
    fn mismatched_allocator_is_rejected() {
        let config = NetBufConfig::new(128, 4, 3);
        let allocator = FreeListAllocator::shared(256).expect("分配器");
        let err = NetBuffer::new(&config, allocator).expect_err("块大小不一致");
        assert_eq!(err.code(), "netbuf.config.chunk_size_mismatch");
    }
}
