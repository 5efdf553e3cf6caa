use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use fshandle::blockdev::MemoryBlockDevice;
use fshandle::{CloneFlags, Geometry, HandleArena, HandleId, IoChannel, OpenParams};

fn open_root(arena: &HandleArena, blocks: u32) -> HandleId {
    let io = IoChannel::new("bench", Arc::new(MemoryBlockDevice::new(64, 1024)));
    let raw = Geometry::small(blocks, 4096).to_bytes();
    let root = arena.open(io, OpenParams::new("bench", &raw)).unwrap();
    arena
        .with_handle_mut(root, |h| {
            let map = h.ensure_block_map().unwrap();
            for b in (1..blocks as u64).step_by(7) {
                map.mark(b).unwrap();
            }
            let bad = h.ensure_badblocks().unwrap();
            for b in 0..64 {
                bad.add(b * 31).unwrap();
            }
        })
        .unwrap();
    root
}

fn benchmark_clone_release(c: &mut Criterion) {
    let arena = HandleArena::default();
    let root = open_root(&arena, 131_072);

    c.bench_function("clone_release_all_flags_128k", |b| {
        b.iter(|| {
            let child = arena.clone_handle(root, CloneFlags::all()).unwrap();
            arena
                .with_handle_mut(child, |h| {
                    h.ensure_block_map().unwrap().mark(black_box(12_345)).unwrap();
                })
                .unwrap();
            arena.release(child).unwrap();
        });
    });

    c.bench_function("clone_release_no_flags", |b| {
        b.iter(|| {
            let child = arena.clone_handle(root, CloneFlags::empty()).unwrap();
            arena.release(black_box(child)).unwrap();
        });
    });
}

fn benchmark_duplicate(c: &mut Criterion) {
    let arena = HandleArena::default();
    let root = open_root(&arena, 131_072);

    c.bench_function("duplicate_release_128k", |b| {
        b.iter(|| {
            let dup = arena.duplicate(root).unwrap();
            arena.release(black_box(dup)).unwrap();
        });
    });
}

criterion_group!(benches, benchmark_clone_release, benchmark_duplicate);
criterion_main!(benches);
