//! GeoTIFF strile availability and layer discovery

use rasterblock::{
    AccessMode, CompressionMethod, DataType, GTiffConfig, GTiffCreateOptions, GTiffDataset,
    HandleRegistry, LayerId, LayerKind,
};
use tempfile::TempDir;

fn strip_dataset(registry: &HandleRegistry, name: &str) -> GTiffDataset {
    GTiffDataset::create(
        registry,
        name,
        100,
        64,
        1,
        DataType::U8,
        GTiffCreateOptions::strips(16),
        GTiffConfig::default(),
    )
    .unwrap()
}

#[test]
fn test_fresh_strips_become_available_when_written() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("strips.tif");
    let name = path.to_str().unwrap();
    let registry = HandleRegistry::local();

    let ds = strip_dataset(&registry, name);
    let layout = ds.layout(LayerId::MAIN).unwrap();
    assert_eq!(layout.block_count(), 4);
    for block in 0..4 {
        assert_eq!(ds.is_block_available(block).unwrap(), None);
    }

    ds.write_block(LayerId::MAIN, 0, 0, &vec![42u8; 100 * 16])
        .unwrap();
    let location = ds.is_block_available(0).unwrap().unwrap();
    assert_ne!(location.offset, 0);
    assert_eq!(location.byte_count, 1600);
    assert_eq!(ds.is_block_available(1).unwrap(), None);
    ds.close().unwrap();

    // Read-only lookups go through deferred strile values and the cache
    let ds = GTiffDataset::open(&registry, name, AccessMode::ReadOnly, GTiffConfig::default())
        .unwrap();
    assert_eq!(ds.is_block_available(0).unwrap(), Some(location));
    assert_eq!(ds.is_block_available(0).unwrap(), Some(location));
    let (hits, misses) = ds.strile_cache_counters(LayerId::MAIN).unwrap();
    assert_eq!((hits, misses), (1, 1));
    assert_eq!(ds.is_block_available(3).unwrap(), None);

    let mut out = vec![0u8; 1600];
    ds.read_block(LayerId::MAIN, 0, 0, &mut out).unwrap();
    assert!(out.iter().all(|&v| v == 42));
}

#[test]
fn test_update_mode_rewrite_and_pages() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("pages.tif");
    let name = path.to_str().unwrap();
    let registry = HandleRegistry::local();

    let options = GTiffCreateOptions {
        compression: CompressionMethod::Deflate,
        ..GTiffCreateOptions::tiled(32, 32)
    };
    let ds = GTiffDataset::create(
        &registry,
        name,
        64,
        64,
        1,
        DataType::F32,
        options,
        GTiffConfig::default(),
    )
    .unwrap();
    let tile: Vec<u8> = (0..32 * 32).flat_map(|i| (i as f32 * 0.5).to_ne_bytes()).collect();
    ds.write_block(LayerId::MAIN, 0, 2, &tile).unwrap();
    ds.create_overview(2).unwrap();
    ds.close().unwrap();

    let ds = GTiffDataset::open(&registry, name, AccessMode::Update, GTiffConfig::default())
        .unwrap();
    assert_eq!(ds.overview_count().unwrap(), 1);
    let overview = ds.overview(0).unwrap();
    assert_eq!(
        ds.layer_kind(overview).unwrap(),
        LayerKind::Overview { level: 0 }
    );
    ds.write_block(overview, 0, 0, &tile).unwrap();
    ds.flush_cache().unwrap();
    assert!(ds.is_strile_available(overview, 0).unwrap().is_some());

    let mut out = vec![0u8; tile.len()];
    ds.read_block(LayerId::MAIN, 0, 2, &mut out).unwrap();
    assert_eq!(out, tile);
    ds.close().unwrap();

    let ds = GTiffDataset::open(&registry, name, AccessMode::ReadOnly, GTiffConfig::default())
        .unwrap();
    let overview = ds.overview(0).unwrap();
    let mut out = vec![0u8; tile.len()];
    ds.read_block(overview, 0, 0, &mut out).unwrap();
    assert_eq!(out, tile);
    // A single-image file lists no subdatasets
    assert!(ds.subdatasets().unwrap().is_empty());
}

#[test]
fn test_missing_page_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("one.tif");
    let name = path.to_str().unwrap();
    let registry = HandleRegistry::local();
    strip_dataset(&registry, name).close().unwrap();

    let first = format!("GTIFF_DIR:1:{}", name);
    assert!(GTiffDataset::open(&registry, &first, AccessMode::ReadOnly, GTiffConfig::default()).is_ok());
    let second = format!("GTIFF_DIR:2:{}", name);
    let err = GTiffDataset::open(&registry, &second, AccessMode::ReadOnly, GTiffConfig::default())
        .err()
        .unwrap();
    assert!(matches!(err, rasterblock::RasterError::NotFound(_)));
}

#[test]
fn test_every_listed_page_opens_itself() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("multi.tif");
    let name = path.to_str().unwrap();
    let registry = HandleRegistry::local();

    let ds = GTiffDataset::create(
        &registry,
        name,
        64,
        64,
        1,
        DataType::U8,
        GTiffCreateOptions::tiled(16, 16),
        GTiffConfig::default(),
    )
    .unwrap();
    let overview = ds.create_overview(2).unwrap();
    ds.create_mask(LayerId::MAIN).unwrap();
    ds.create_mask(overview).unwrap();
    ds.create_page(10, 10).unwrap();
    ds.create_page(40, 24).unwrap();
    ds.close().unwrap();

    let ds = GTiffDataset::open(&registry, name, AccessMode::ReadOnly, GTiffConfig::default())
        .unwrap();
    let pages = ds.subdatasets().unwrap();
    assert_eq!(
        pages,
        vec![
            format!("GTIFF_DIR:1:{}", name),
            format!("GTIFF_DIR:5:{}", name),
            format!("GTIFF_DIR:6:{}", name),
        ]
    );
    assert_eq!(ds.overview_count().unwrap(), 1);

    for (page, expected) in pages.iter().zip([(64, 64), (10, 10), (40, 24)]) {
        let ds = GTiffDataset::open(&registry, page, AccessMode::ReadOnly, GTiffConfig::default())
            .unwrap();
        let layout = ds.layout(LayerId::MAIN).unwrap();
        assert_eq!((layout.width, layout.height), expected, "{}", page);
        assert_eq!(ds.layer_kind(LayerId::MAIN).unwrap(), LayerKind::Main);
    }
}
