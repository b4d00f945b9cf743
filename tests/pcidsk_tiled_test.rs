//! End-to-end tests of tiled PCIDSK files on disk and in memory

use rasterblock::{
    AccessMode, DataType, HandleRegistry, IOManager, MemoryIOManager, PcidskCreateOptions,
    PcidskFile,
};
use std::sync::Arc;
use tempfile::TempDir;

const SIZE: usize = 256;
const TILE: usize = 128;

fn options() -> PcidskCreateOptions {
    "TILED128 RLE".parse().unwrap()
}

/// 256x256 8-bit RLE file, one tile written, reopened from disk
#[test]
fn test_tiled128_rle_round_trip_on_disk() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("scene.pix");
    let name = path.to_str().unwrap();
    let registry = HandleRegistry::local();

    let file = PcidskFile::create(&registry, name, SIZE, SIZE, &[DataType::U8], &options()).unwrap();
    let channel = file.channel(0).unwrap();
    assert_eq!(channel.layout().block_count(), 4);
    channel.write_block(0, &vec![7u8; TILE * TILE]).unwrap();
    file.close().unwrap();

    let file = PcidskFile::open(&registry, name, AccessMode::ReadOnly).unwrap();
    assert_eq!((file.width(), file.height()), (SIZE, SIZE));
    let channel = file.channel(0).unwrap();
    let mut out = vec![0u8; TILE * TILE];
    channel.read_block(0, &mut out, None).unwrap();
    assert!(out.iter().all(|&v| v == 7));

    out.fill(9);
    channel.read_block(3, &mut out, None).unwrap();
    assert!(out.iter().all(|&v| v == 0));

    // Read-only files reject writes
    assert!(channel.write_block(3, &out).is_err());
}

#[test]
fn test_hole_read_does_no_io() {
    let manager = Arc::new(MemoryIOManager::new());
    let registry = HandleRegistry::new(Arc::clone(&manager) as Arc<dyn IOManager>);
    let file = PcidskFile::create(&registry, "holes.pix", SIZE, SIZE, &[DataType::U8], &options())
        .unwrap();
    let channel = file.channel(0).unwrap();
    channel.write_block(0, &vec![7u8; TILE * TILE]).unwrap();

    let stats = manager.stats();
    let reads = stats.reads();
    let mut out = vec![1u8; TILE * TILE];
    channel.read_block(3, &mut out, None).unwrap();
    assert!(out.iter().all(|&v| v == 0));
    assert_eq!(stats.reads(), reads);
}

#[test]
fn test_many_tiles_keep_free_list_consistent() {
    let manager = Arc::new(MemoryIOManager::new());
    let registry = HandleRegistry::new(Arc::clone(&manager) as Arc<dyn IOManager>);
    let options: PcidskCreateOptions = "TILED32".parse().unwrap();
    let file = PcidskFile::create(
        &registry,
        "grow.pix",
        320,
        320,
        &[DataType::U8, DataType::U16],
        &options,
    )
    .unwrap();

    for block in 0..100 {
        let byte = (block % 250) as u8 + 1;
        file.channel(0)
            .unwrap()
            .write_block(block, &vec![byte; 32 * 32])
            .unwrap();
        file.channel(1)
            .unwrap()
            .write_block(block, &vec![byte; 32 * 32 * 2])
            .unwrap();
    }
    file.synchronize().unwrap();
    file.check_free_list().unwrap();
    let stats = file.block_map_stats().unwrap().unwrap();
    assert!(stats.owned_blocks > 0);
    file.close().unwrap();

    let file = PcidskFile::open(&registry, "grow.pix", AccessMode::ReadOnly).unwrap();
    let mut out = vec![0u8; 32 * 32 * 2];
    file.channel(1).unwrap().read_block(57, &mut out, None).unwrap();
    assert!(out.iter().all(|&v| v == 58));
}
