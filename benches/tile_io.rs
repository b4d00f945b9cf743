//! Tile I/O benchmarks
//!
//! - `pcidsk_tile_write`: writes every tile of a tiled PCIDSK channel,
//!   uncompressed and RLE
//! - `pcidsk_tile_read`: reads back written tiles and holes
//! - `gtiff_strile_write`: writes every tile of a GeoTIFF, with and without
//!   the background compression pool
//!
//! All files live in memory so the numbers reflect the engines, not the disk.
//!
//! ```bash
//! cargo bench --bench tile_io
//! ```

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rasterblock::{
    CompressionMethod, DataType, GTiffConfig, GTiffCreateOptions, GTiffDataset, HandleRegistry,
    IOManager, LayerId, MemoryIOManager, PcidskCreateOptions, PcidskFile,
};
use std::hint::black_box;
use std::sync::Arc;

const SIZE: usize = 1024;
const TILE: usize = 128;

fn memory_registry() -> HandleRegistry {
    let manager: Arc<dyn IOManager> = Arc::new(MemoryIOManager::new());
    HandleRegistry::new(manager)
}

/// Smooth gradient tile so RLE has runs to find
fn tile_data(seed: usize) -> Vec<u8> {
    (0..TILE * TILE).map(|i| ((i / 16 + seed) % 251) as u8).collect()
}

fn bench_pcidsk_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("pcidsk_tile_write");
    let tiles = (SIZE / TILE) * (SIZE / TILE);
    group.throughput(Throughput::Bytes((tiles * TILE * TILE) as u64));

    for options in ["TILED128", "TILED128 RLE"] {
        group.bench_with_input(BenchmarkId::from_parameter(options), &options, |b, options| {
            let options: PcidskCreateOptions = options.parse().unwrap();
            b.iter(|| {
                let registry = memory_registry();
                let file =
                    PcidskFile::create(&registry, "bench.pix", SIZE, SIZE, &[DataType::U8], &options)
                        .unwrap();
                let channel = file.channel(0).unwrap();
                for block in 0..tiles {
                    channel.write_block(block, &tile_data(block)).unwrap();
                }
                file.close().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_pcidsk_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("pcidsk_tile_read");
    let registry = memory_registry();
    let options: PcidskCreateOptions = "TILED128 RLE".parse().unwrap();
    let file =
        PcidskFile::create(&registry, "read.pix", SIZE, SIZE, &[DataType::U8], &options).unwrap();
    let channel = file.channel(0).unwrap();
    let tiles = channel.layout().block_count();
    // Even tiles written, odd tiles left as holes
    for block in (0..tiles).step_by(2) {
        channel.write_block(block, &tile_data(block)).unwrap();
    }
    file.synchronize().unwrap();

    let mut out = vec![0u8; TILE * TILE];
    group.bench_function("written", |b| {
        b.iter(|| {
            for block in (0..tiles).step_by(2) {
                channel.read_block(block, &mut out, None).unwrap();
            }
            black_box(&out);
        });
    });
    group.bench_function("holes", |b| {
        b.iter(|| {
            for block in (1..tiles).step_by(2) {
                channel.read_block(block, &mut out, None).unwrap();
            }
            black_box(&out);
        });
    });
    group.finish();
}

fn bench_gtiff_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("gtiff_strile_write");
    let tiles = (SIZE / TILE) * (SIZE / TILE);
    group.throughput(Throughput::Bytes((tiles * TILE * TILE) as u64));

    for threads in [0usize, 4] {
        group.bench_with_input(BenchmarkId::new("deflate_threads", threads), &threads, |b, &threads| {
            let config = GTiffConfig {
                num_threads: threads,
                ..GTiffConfig::default()
            };
            let options = GTiffCreateOptions {
                compression: CompressionMethod::Deflate,
                ..GTiffCreateOptions::tiled(TILE, TILE)
            };
            b.iter(|| {
                let registry = memory_registry();
                let ds = GTiffDataset::create(
                    &registry,
                    "bench.tif",
                    SIZE,
                    SIZE,
                    1,
                    DataType::U8,
                    options,
                    config.clone(),
                )
                .unwrap();
                for block in 0..tiles {
                    ds.write_block(LayerId::MAIN, 0, block, &tile_data(block)).unwrap();
                }
                ds.close().unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pcidsk_write, bench_pcidsk_read, bench_gtiff_write);
criterion_main!(benches);
