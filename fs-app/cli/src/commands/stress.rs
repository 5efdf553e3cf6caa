//! Stress command: fan a volume handle out to worker clones and merge them back

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{debug, info};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use fshandle::blockdev::{BlockDevice, FileBackedBlockDevice, MemoryBlockDevice};
use fshandle::superblock::{read_superblock, write_superblock};
use fshandle::{CloneFlags, Geometry, HandleArena, HandleId, IoChannel, LifecycleConfig, OpenParams};

/// Block size of synthesised volumes
const VOLUME_BLOCK_SIZE: usize = 1024;

/// Clone a volume handle across worker threads and verify the merged result
#[derive(Parser, Debug)]
#[command(about = "Clone a volume handle across workers and verify the merge")]
pub struct StressArgs {
    /// Number of worker clones
    #[arg(short, long, default_value_t = 4)]
    pub workers: usize,

    /// Blocks and inodes each worker marks
    #[arg(short, long, default_value_t = 1000)]
    pub marks: u64,

    /// Substructures each clone owns: any of block, inode, dir, bad, or "all"
    #[arg(short, long, default_value = "all", value_parser = parse_clone_flags)]
    pub flags: CloneFlags,

    /// JSON lifecycle configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Image file to use instead of an in-memory volume; created if missing
    #[arg(short, long)]
    pub image: Option<PathBuf>,

    /// Blocks in a synthesised volume
    #[arg(long, default_value_t = 65536)]
    pub blocks: u32,

    /// Inodes in a synthesised volume
    #[arg(long, default_value_t = 16384)]
    pub inodes: u32,
}

fn parse_clone_flags(s: &str) -> std::result::Result<CloneFlags, String> {
    let mut flags = CloneFlags::empty();
    for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        flags |= match name {
            "all" => CloneFlags::all(),
            "none" => CloneFlags::empty(),
            "block" => CloneFlags::BLOCK_BITMAP,
            "inode" => CloneFlags::INODE_BITMAP,
            "dir" => CloneFlags::DIR_BLOCKS,
            "bad" => CloneFlags::BAD_BLOCKS,
            other => return Err(format!("unknown clone flag '{}'", other)),
        };
    }
    Ok(flags)
}

/// What one worker marked in its clone
#[derive(Debug, Default)]
struct WorkerReport {
    blocks: BTreeSet<u64>,
    inodes: BTreeSet<u64>,
    bad_blocks: BTreeSet<u64>,
    dir_blocks: usize,
}

pub async fn run(args: StressArgs) -> Result<()> {
    if args.workers == 0 {
        bail!("--workers must be at least 1");
    }

    let config = match &args.config {
        Some(path) => LifecycleConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => LifecycleConfig::default(),
    };

    let (io, device_name) = open_volume(&args).await?;
    let raw = read_superblock(&io)
        .await
        .context("Failed to read superblock")?;

    let arena = Arc::new(HandleArena::new(config));
    let mut params = OpenParams::new(&device_name, &raw);
    params.keep_original_superblock = true;
    let root = arena.open(io.clone(), params)?;
    arena.with_handle_mut(root, |h| -> fshandle::Result<()> {
        h.ensure_badblocks()?;
        h.ensure_dblist()?;
        Ok(())
    })??;

    let (first_block, last_block, last_inode) = arena.with_handle(root, |h| {
        let sb = h.superblock().read();
        (
            sb.first_data_block() as u64,
            sb.blocks_count() as u64 - 1,
            sb.inodes_count() as u64,
        )
    })?;
    // Each worker records one distinct bad block counted down from the end
    let data_blocks = last_block - first_block + 1;
    if args.workers as u64 > data_blocks {
        arena.release(root)?;
        bail!(
            "--workers {} exceeds the {} data blocks of {}",
            args.workers,
            data_blocks,
            device_name
        );
    }

    info!(
        "Stressing {} with {} worker(s), {} mark(s) each, flags {:?}",
        device_name, args.workers, args.marks, args.flags
    );
    let start = Instant::now();

    let tasks = (0..args.workers).map(|worker| {
        let arena = Arc::clone(&arena);
        let flags = args.flags;
        let marks = args.marks;
        tokio::task::spawn_blocking(move || {
            run_worker(&arena, root, flags, worker as u64, marks, (first_block, last_block), last_inode)
        })
    });
    let reports = futures::future::try_join_all(tasks)
        .await?
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    let elapsed = start.elapsed();
    verify(&arena, root, args.flags, &reports)?;

    let (blocks, inodes, bad, dirs) = arena.with_handle(root, |h| {
        (
            h.block_map().as_ref().map_or(0, |m| m.count_set()),
            h.inode_map().as_ref().map_or(0, |m| m.count_set()),
            h.badblocks().as_ref().map_or(0, |l| l.len()),
            h.dblist().as_ref().map_or(0, |l| l.len()),
        )
    })?;

    println!("Workers:           {}", args.workers);
    println!("Elapsed:           {:.2?}", elapsed);
    println!("Blocks in use:     {}", blocks);
    println!("Inodes in use:     {}", inodes);
    println!("Bad blocks:        {}", bad);
    println!("Directory blocks:  {}", dirs);
    println!("Peak memory:       {} bytes", arena.memory().peak_bytes());
    println!("Merged result verified");

    arena.release(root)?;
    if arena.memory().live_bytes() != 0 {
        bail!("{} bytes still allocated after release", arena.memory().live_bytes());
    }
    io.sync().await?;
    Ok(())
}

async fn open_volume(args: &StressArgs) -> Result<(IoChannel, String)> {
    let geometry = Geometry::small(args.blocks, args.inodes);
    // Large enough to hold the primary superblock
    let device_bytes = (geometry.blocks_count as u64 * VOLUME_BLOCK_SIZE as u64)
        .max(4 * VOLUME_BLOCK_SIZE as u64);

    match &args.image {
        Some(path) => {
            let fresh = !path.exists();
            let device = if fresh {
                info!("Creating image {}", path.display());
                FileBackedBlockDevice::create(path, device_bytes, VOLUME_BLOCK_SIZE).await?
            } else {
                FileBackedBlockDevice::open(path, VOLUME_BLOCK_SIZE, false).await?
            };
            let name = path.display().to_string();
            let io = IoChannel::new(name.clone(), Arc::new(device) as Arc<dyn BlockDevice>);
            if fresh {
                write_superblock(&io, &geometry.to_bytes()).await?;
            }
            Ok((io, name))
        }
        None => {
            let blocks = device_bytes / VOLUME_BLOCK_SIZE as u64;
            let device = MemoryBlockDevice::new(blocks, VOLUME_BLOCK_SIZE);
            let io = IoChannel::new("memory", Arc::new(device) as Arc<dyn BlockDevice>);
            write_superblock(&io, &geometry.to_bytes()).await?;
            Ok((io, "memory".to_string()))
        }
    }
}

/// Spread `marks` numbers over `[first, last]`: a stride private to this
/// worker plus every eighth mark on a range every worker touches
fn pattern(worker: u64, marks: u64, first: u64, last: u64) -> impl Iterator<Item = u64> {
    let span = last - first + 1;
    (0..marks).map(move |i| {
        let offset = if i % 8 == 0 {
            i % span
        } else {
            (worker * 7919 + i * 104_729) % span
        };
        first + offset
    })
}

fn run_worker(
    arena: &HandleArena,
    root: HandleId,
    flags: CloneFlags,
    worker: u64,
    marks: u64,
    (first_block, last_block): (u64, u64),
    last_inode: u64,
) -> Result<WorkerReport> {
    let child = arena.clone_handle(root, flags)?;
    debug!("worker {} got clone {}", worker, child);

    let report = arena.with_handle_mut(child, |h| -> fshandle::Result<WorkerReport> {
        let mut report = WorkerReport::default();
        if !h.block_map().is_deferred() {
            let map = h.ensure_block_map()?;
            for block in pattern(worker, marks, first_block, last_block) {
                map.mark(block)?;
                report.blocks.insert(block);
            }
        }
        if !h.inode_map().is_deferred() {
            let map = h.ensure_inode_map()?;
            for ino in pattern(worker, marks, 1, last_inode) {
                map.mark(ino)?;
                report.inodes.insert(ino);
            }
        }
        if !h.badblocks().is_deferred() {
            let bad = last_block - worker;
            h.ensure_badblocks()?.add(bad)?;
            report.bad_blocks.insert(bad);
        }
        if !h.dblist().is_deferred() {
            let list = h.ensure_dblist()?;
            for (i, block) in pattern(worker, marks / 16 + 1, first_block, last_block).enumerate() {
                list.add(worker as u32 + 2, block, i as i64)?;
            }
            report.dir_blocks = list.len();
        }
        Ok(report)
    })??;

    arena.release(child)?;
    Ok(report)
}

fn verify(arena: &HandleArena, root: HandleId, flags: CloneFlags, reports: &[WorkerReport]) -> Result<()> {
    let union = |pick: fn(&WorkerReport) -> &BTreeSet<u64>| -> BTreeSet<u64> {
        reports.iter().flat_map(|r| pick(r).iter().copied()).collect()
    };

    arena.with_handle(root, |h| -> Result<()> {
        if flags.contains(CloneFlags::BLOCK_BITMAP) {
            let merged: BTreeSet<u64> = h
                .block_map()
                .as_ref()
                .ok_or_else(|| anyhow!("root lost its block bitmap"))?
                .iter_set()
                .collect();
            if merged != union(|r| &r.blocks) {
                bail!("merged block bitmap does not match the union of worker marks");
            }
        }
        if flags.contains(CloneFlags::INODE_BITMAP) {
            let merged: BTreeSet<u64> = h
                .inode_map()
                .as_ref()
                .ok_or_else(|| anyhow!("root lost its inode bitmap"))?
                .iter_set()
                .collect();
            if merged != union(|r| &r.inodes) {
                bail!("merged inode bitmap does not match the union of worker marks");
            }
        }
        if flags.contains(CloneFlags::BAD_BLOCKS) {
            let merged: BTreeSet<u64> = h
                .badblocks()
                .as_ref()
                .ok_or_else(|| anyhow!("root lost its bad-block list"))?
                .iter()
                .collect();
            if merged != union(|r| &r.bad_blocks) {
                bail!("merged bad-block list does not match the union of worker lists");
            }
        }
        if flags.contains(CloneFlags::DIR_BLOCKS) {
            let merged = h.dblist().as_ref().map_or(0, |l| l.len());
            let expected: usize = reports.iter().map(|r| r.dir_blocks).sum();
            if merged != expected {
                bail!("merged directory-block list has {} entries, expected {}", merged, expected);
            }
        }
        Ok(())
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_clone_flags() {
        assert_eq!(parse_clone_flags("all").unwrap(), CloneFlags::all());
        assert_eq!(
            parse_clone_flags("block, inode").unwrap(),
            CloneFlags::BLOCK_BITMAP | CloneFlags::INODE_BITMAP
        );
        assert_eq!(parse_clone_flags("none").unwrap(), CloneFlags::empty());
        assert!(parse_clone_flags("journal").is_err());
    }

    #[test]
    fn test_pattern_stays_in_range() {
        for worker in 0..4 {
            assert!(pattern(worker, 500, 1, 1000).all(|n| (1..=1000).contains(&n)));
        }
    }

    #[tokio::test]
    async fn test_stress_on_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let args = StressArgs {
            workers: 3,
            marks: 200,
            flags: CloneFlags::all(),
            config: None,
            image: Some(dir.path().join("volume.img")),
            blocks: 4096,
            inodes: 512,
        };
        run(args).await.unwrap();
    }

    #[tokio::test]
    async fn test_more_workers_than_data_blocks_is_rejected() {
        let args = StressArgs {
            workers: 4,
            marks: 10,
            flags: CloneFlags::all(),
            config: None,
            image: None,
            blocks: 3,
            inodes: 16,
        };
        let err = run(args).await.unwrap_err();
        assert!(err.to_string().contains("exceeds the 2 data blocks"), "{err}");
    }

    #[tokio::test]
    async fn test_one_worker_per_data_block() {
        let args = StressArgs {
            workers: 2,
            marks: 10,
            flags: CloneFlags::all(),
            config: None,
            image: None,
            blocks: 3,
            inodes: 16,
        };
        run(args).await.unwrap();
    }

    #[tokio::test]
    async fn test_stress_in_memory_partial_flags() {
        let args = StressArgs {
            workers: 2,
            marks: 50,
            flags: CloneFlags::BLOCK_BITMAP | CloneFlags::DIR_BLOCKS,
            config: None,
            image: None,
            blocks: 2048,
            inodes: 256,
        };
        run(args).await.unwrap();
    }
}
