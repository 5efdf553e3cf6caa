use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fshandle::blockdev::MemoryBlockDevice;
use fshandle::{CloneFlags, Geometry, HandleArena, HandleId, IoChannel, OpenParams};

const BLOCKS: u32 = 16384;
const INODES: u32 = 2048;

fn open_volume() -> (Arc<HandleArena>, HandleId, IoChannel) {
    env_logger::builder().is_test(true).try_init().ok();
    let arena = Arc::new(HandleArena::default());
    let io = IoChannel::new("parallel", Arc::new(MemoryBlockDevice::new(256, 1024)));
    let raw = Geometry::small(BLOCKS, INODES).to_bytes();
    let root = arena.open(io.clone(), OpenParams::new("parallel", &raw)).unwrap();
    arena
        .with_handle_mut(root, |h| {
            h.ensure_badblocks().unwrap();
            h.ensure_dblist().unwrap();
        })
        .unwrap();
    (arena, root, io)
}

#[test]
fn test_workers_merge_union_of_their_marks() {
    let (arena, root, io) = open_volume();
    let workers = 8;

    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let arena = Arc::clone(&arena);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(w as u64);
                let mut blocks = BTreeSet::new();
                let mut inodes = BTreeSet::new();
                let child = arena.clone_handle(root, CloneFlags::all()).unwrap();
                arena
                    .with_handle_mut(child, |h| {
                        for _ in 0..200 {
                            let b = rng.gen_range(1..BLOCKS as u64);
                            h.ensure_block_map().unwrap().mark(b).unwrap();
                            blocks.insert(b);
                            let i = rng.gen_range(1..=INODES as u64);
                            h.ensure_inode_map().unwrap().mark(i).unwrap();
                            inodes.insert(i);
                        }
                        h.ensure_badblocks().unwrap().add(1000 + w as u64).unwrap();
                        h.ensure_dblist().unwrap().add(w as u32 + 2, 5000 + w as u64, 0).unwrap();
                    })
                    .unwrap();
                arena.release(child).unwrap();
                (blocks, inodes)
            })
        })
        .collect();

    let mut expected_blocks = BTreeSet::new();
    let mut expected_inodes = BTreeSet::new();
    for handle in handles {
        let (blocks, inodes) = handle.join().unwrap();
        expected_blocks.extend(blocks);
        expected_inodes.extend(inodes);
    }

    assert_eq!(arena.len(), 1);
    assert_eq!(arena.outstanding_children(root).unwrap(), 0);
    assert_eq!(io.ref_count(), 2);

    arena
        .with_handle(root, |h| {
            let blocks: BTreeSet<u64> = h.block_map().as_ref().unwrap().iter_set().collect();
            let inodes: BTreeSet<u64> = h.inode_map().as_ref().unwrap().iter_set().collect();
            assert_eq!(blocks, expected_blocks);
            assert_eq!(inodes, expected_inodes);

            let bad: Vec<u64> = h.badblocks().as_ref().unwrap().iter().collect();
            assert_eq!(bad, (1000..1000 + workers as u64).collect::<Vec<_>>());
            assert_eq!(h.dblist().as_ref().unwrap().len(), workers);
        })
        .unwrap();
}

#[test]
fn test_nested_clones_across_threads() {
    let (arena, root, _io) = open_volume();
    let parent = arena.clone_handle(root, CloneFlags::BLOCK_BITMAP).unwrap();

    let children: Vec<HandleId> = (0..4)
        .map(|_| arena.clone_handle(parent, CloneFlags::BLOCK_BITMAP).unwrap())
        .collect();
    assert_eq!(arena.outstanding_children(parent).unwrap(), 4);

    // Refused while the workers hold clones
    arena.release(parent).unwrap();
    assert!(arena.contains(parent));

    let handles: Vec<_> = children
        .into_iter()
        .zip(100u64..)
        .map(|(child, bit)| {
            let arena = Arc::clone(&arena);
            thread::spawn(move || {
                arena
                    .with_handle_mut(child, |h| {
                        h.ensure_block_map().unwrap().mark(bit).unwrap();
                    })
                    .unwrap();
                arena.release(child).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(arena.outstanding_children(parent).unwrap(), 0);
    arena.release(parent).unwrap();
    assert!(!arena.contains(parent));
    let blocks: Vec<u64> = arena
        .with_handle(root, |h| h.block_map().as_ref().unwrap().iter_set().collect())
        .unwrap();
    assert_eq!(blocks, vec![100, 101, 102, 103]);
}
