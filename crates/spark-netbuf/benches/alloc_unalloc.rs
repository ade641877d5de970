use criterion::{Criterion, black_box};
use spark_netbuf::{NetBufConfig, NetBuffer};
use std::{env, time::Duration};

const BURST: usize = 64 * 1024;

/// 增长/收缩往返基准：每轮增长 64 KiB 再收缩 64 KiB - 1，尾部逐轮前进一个字节。
///
/// # 设计背景（Why）
/// - 网络收包路径的典型节奏是“预留一个突发窗口，按实际读到的字节回退”，
///   该基准衡量默认配置下块借还与路径建立的开销。
///
/// # 逻辑解析（How）
/// - 使用默认配置 `(8192, 8, 3)`，首轮之后所有块都来自分配器的自由链表；
/// - 剩余额度不足一个突发窗口时整体收缩并前移 `begin`，保证循环不会撞上容量上限。
fn bench_alloc_unalloc(c: &mut Criterion) {
    let mut buffer = NetBuffer::from_config(&NetBufConfig::default()).expect("默认配置合法");
    c.bench_function("netbuf_alloc_unalloc_64k", |b| {
        b.iter(|| {
            if buffer.available() < BURST {
                let len = buffer.len();
                buffer.unalloc(len).expect("整体收缩");
                buffer.advance_begin(buffer.end()).expect("前移 begin");
            }
            let pos = buffer.alloc(black_box(BURST)).expect("增长");
            buffer.unalloc(BURST - 1).expect("收缩");
            black_box(pos)
        });
    });
}

/// 随机访问基准：在跨块边界的位置写入并读回 1 KiB。
fn bench_random_access(c: &mut Criterion) {
    let mut buffer = NetBuffer::from_config(&NetBufConfig::default()).expect("默认配置合法");
    buffer.alloc(4 * BURST).expect("预先增长");
    let payload = vec![0x5Au8; 1024];
    let mut sink = vec![0u8; 1024];
    c.bench_function("netbuf_write_read_1k", |b| {
        b.iter(|| {
            buffer.write(black_box(8192 - 512), &payload).expect("写入");
            buffer.read(black_box(8192 - 512), &mut sink).expect("读取");
            black_box(sink[1023])
        });
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_alloc_unalloc(&mut criterion);
    bench_random_access(&mut criterion);
    criterion.final_summary();
}
