#![no_main]

use std::collections::BTreeMap;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spark_netbuf::{ChunkAllocator, Geometry, NetBufConfig, NetBuffer};

/// Fuzz 输入：一个小型配置与一串缓冲操作。
///
/// - **Why**：增长、收缩、释放与前移交错时最容易出现节点泄漏、重复归还或路径错位，
///   随机操作流比手写场景更容易撞上环绕与子树边界的组合；
/// - **How**：每个操作先在影子模型上推演预期结果，再调用真实缓冲并比对；
/// - **What**：结果、`begin`/`end` 与已知字节必须与模型一致；结束时销毁缓冲，分配器借出计数必须归零。
#[derive(Debug, Arbitrary)]
struct NetbufCase {
    chunk_shift: u8,
    l0_shift: u8,
    height: u8,
    chunk_limit: Option<u8>,
    ops: Vec<NetbufOp>,
}

#[derive(Debug, Arbitrary)]
enum NetbufOp {
    Alloc { count: u16 },
    Unalloc { count: u16 },
    Advance { by: u16 },
    Free { at: u16, len: u16 },
    Write { at: u16, fill: u8, len: u8 },
    Read { at: u16, len: u8 },
}

/// 影子模型。
///
/// - `bytes`：`[begin, end)` 的内容，`None` 表示复用块留下的未定义字节；
/// - `leaves`：每个叶子起点到其存活字节计数的映射，与树内计数逐一对应。
struct Model {
    geometry: Geometry,
    begin: usize,
    bytes: Vec<Option<u8>>,
    leaves: BTreeMap<usize, usize>,
}

impl Model {
    fn end(&self) -> usize {
        self.begin + self.bytes.len()
    }

    fn grow(&mut self, count: usize) {
        let chunk = self.geometry.chunk_size();
        let new_end = self.end() + count;
        let tail = self.geometry.align_down_chunk(self.end());
        let offset = self.geometry.chunk_offset(self.end());
        if count > 0 && offset != 0 && self.leaves.get(&tail) == Some(&0) {
            // 排空的尾部叶子换上新块：`end` 之前的字节仍算已释放，内容变为未定义。
            self.leaves.insert(tail, chunk - offset);
            let stale = tail.max(self.begin) - self.begin;
            self.bytes[stale..].fill(None);
        }
        let mut unit = self.geometry.align_up_chunk(self.end());
        while unit < new_end {
            self.leaves.insert(unit, chunk);
            unit += chunk;
        }
        self.bytes.resize(self.bytes.len() + count, None);
    }

    fn shrink(&mut self, count: usize) {
        let len = self.bytes.len() - count;
        self.bytes.truncate(len);
        let floor = self.geometry.align_up_chunk(self.end());
        self.leaves.retain(|unit, _| *unit < floor);
    }

    fn advance(&mut self, by: usize) {
        self.bytes.drain(..by);
        self.begin += by;
        let floor = self.geometry.align_down_subtree(self.begin);
        self.leaves.retain(|unit, _| *unit >= floor);
    }

    /// 逐块扣减；返回是否全部成功。失败块之前的扣减保持生效，与树的行为一致。
    fn free(&mut self, pos: usize, len: usize) -> bool {
        for segment in self.geometry.segments(pos, len) {
            let unit = self.geometry.align_down_chunk(segment.pos);
            let Some(live) = self.leaves.get_mut(&unit) else {
                return false;
            };
            if *live < segment.len {
                return false;
            }
            *live -= segment.len;
        }
        true
    }

    fn touches_drained(&self, pos: usize, len: usize) -> bool {
        self.geometry.segments(pos, len).any(|segment| {
            let unit = self.geometry.align_down_chunk(segment.pos);
            self.leaves.get(&unit) == Some(&0)
        })
    }
}

fuzz_target!(|case: NetbufCase| {
    let config = NetBufConfig::new(
        1 << (4 + case.chunk_shift % 4),
        1 << (1 + case.l0_shift % 3),
        2 + usize::from(case.height % 2),
    );
    let config = match case.chunk_limit {
        Some(limit) => config.with_chunk_limit(usize::from(limit) + 1),
        None => config,
    };
    let allocator = config.build_allocator().expect("valid config");
    let mut buffer = NetBuffer::new(&config, allocator.clone()).expect("valid tree");
    let mut model = Model {
        geometry: *buffer.geometry(),
        begin: 0,
        bytes: Vec::new(),
        leaves: BTreeMap::new(),
    };

    for op in case.ops {
        match op {
            NetbufOp::Alloc { count } => {
                let count = usize::from(count);
                match buffer.alloc(count) {
                    Ok(pos) => {
                        assert_eq!(pos, model.end());
                        model.grow(count);
                    }
                    Err(err) => {
                        let floor = model.geometry.align_down_subtree(model.begin);
                        let over = model.end() + count - floor > model.geometry.capacity();
                        assert!(over || err.code() == "netbuf.allocation_failure");
                    }
                }
            }
            NetbufOp::Unalloc { count } => {
                let count = usize::from(count);
                let result = buffer.unalloc(count);
                if count <= model.bytes.len() {
                    result.expect("shrink within [begin, end)");
                    model.shrink(count);
                } else {
                    assert!(result.is_err());
                }
            }
            NetbufOp::Advance { by } => {
                let by = usize::from(by).min(model.bytes.len());
                buffer
                    .advance_begin(model.begin + by)
                    .expect("advance within [begin, end]");
                model.advance(by);
            }
            NetbufOp::Free { at, len } => {
                if model.bytes.is_empty() {
                    continue;
                }
                let at = usize::from(at) % model.bytes.len();
                let len = usize::from(len).min(model.bytes.len() - at);
                let pos = model.begin + at;
                let expected = model.free(pos, len);
                assert_eq!(buffer.free(pos, len).is_ok(), expected);
            }
            NetbufOp::Write { at, fill, len } => {
                if model.bytes.is_empty() {
                    continue;
                }
                let at = usize::from(at) % model.bytes.len();
                let len = usize::from(len).min(model.bytes.len() - at);
                let pos = model.begin + at;
                let drained = model.touches_drained(pos, len);
                let result = buffer.write(pos, &vec![fill; len]);
                assert_eq!(result.is_err(), drained);
                if !drained {
                    model.bytes[at..at + len].fill(Some(fill));
                }
            }
            NetbufOp::Read { at, len } => {
                if model.bytes.is_empty() {
                    continue;
                }
                let at = usize::from(at) % model.bytes.len();
                let len = usize::from(len).min(model.bytes.len() - at);
                let pos = model.begin + at;
                let mut out = vec![0u8; len];
                let drained = model.touches_drained(pos, len);
                let result = buffer.read(pos, &mut out);
                assert_eq!(result.is_err(), drained);
                if !drained {
                    for (actual, expected) in out.iter().zip(&model.bytes[at..at + len]) {
                        if let Some(expected) = expected {
                            assert_eq!(actual, expected);
                        }
                    }
                }
            }
        }
        assert_eq!(buffer.begin(), model.begin);
        assert_eq!(buffer.end(), model.end());
        assert_eq!(buffer.stats().live_bytes, model.leaves.values().sum::<usize>());
    }

    drop(buffer);
    assert_eq!(allocator.stats().outstanding_chunks, 0);
});
