//! Async window access over both containers

use rasterblock::{
    AccessMode, ContainerFormat, DataType, GTiffConfig, GTiffCreateOptions, GTiffDataset,
    HandleRegistry, PcidskCreateOptions, PcidskFile, RasterAccess, RasterError,
};
use tempfile::TempDir;

#[tokio::test]
async fn test_open_sniffs_pcidsk() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bands.pix");
    let registry = HandleRegistry::local();
    let options: PcidskCreateOptions = "BAND".parse().unwrap();
    PcidskFile::create(
        &registry,
        path.to_str().unwrap(),
        50,
        30,
        &[DataType::U16, DataType::U16],
        &options,
    )
    .unwrap()
    .close()
    .unwrap();

    let url = format!("file://{}", path.display());
    let raster = RasterAccess::open(url, AccessMode::Update).await.unwrap();
    assert_eq!(raster.source().format(), "PCIDSK");
    assert_eq!(raster.band_count(), 2);

    let values: Vec<u8> = (0..10 * 5u16).flat_map(|v| (v + 1000).to_ne_bytes()).collect();
    raster.write_window(1, 20, 12, 10, 5, &values).await.unwrap();
    raster.flush().await.unwrap();

    let back = raster.read_window(1, 20, 12, 10, 5).await.unwrap();
    assert_eq!(&back[..], &values[..]);
    let other = raster.read_window(0, 20, 12, 10, 5).await.unwrap();
    assert!(other.iter().all(|&b| b == 0));

    let stats = raster.stats().unwrap();
    assert_eq!((stats.width, stats.height, stats.bands), (50, 30, 2));
    assert_eq!(stats.uncompressed_size, 50 * 30 * 2 * 2);
}

#[tokio::test]
async fn test_open_sniffs_gtiff_and_reads_across_tiles() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("tiles.tif");
    let name = path.to_str().unwrap().to_string();
    let registry = HandleRegistry::local();
    GTiffDataset::create(
        &registry,
        &name,
        48,
        48,
        1,
        DataType::U8,
        GTiffCreateOptions::tiled(16, 16),
        GTiffConfig::default(),
    )
    .unwrap()
    .close()
    .unwrap();

    let raster = RasterAccess::open(name.clone(), AccessMode::Update).await.unwrap();
    assert_eq!(raster.source().format(), "GTiff");
    assert_eq!(raster.layout(0).unwrap().block_count(), 9);

    // Covers the middle tile fully and its eight neighbours partly
    let data: Vec<u8> = (0..40 * 40).map(|i| (i % 255) as u8).collect();
    raster.write_window(0, 4, 4, 40, 40, &data).await.unwrap();
    let back = raster.read_window(0, 4, 4, 40, 40).await.unwrap();
    assert_eq!(&back[..], &data[..]);

    let corner = raster.read_window(0, 0, 0, 4, 4).await.unwrap();
    assert!(corner.iter().all(|&v| v == 0));
    raster.flush().await.unwrap();
}

#[tokio::test]
async fn test_unknown_content_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("notes.txt");
    std::fs::write(&path, b"just some text").unwrap();

    let result = RasterAccess::open(path.to_str().unwrap(), AccessMode::ReadOnly).await;
    assert!(result.err().unwrap().is_corruption());
    assert_eq!(ContainerFormat::sniff(b"just"), None);

    let missing = temp_dir.path().join("missing.pix");
    let result = RasterAccess::open(missing.to_str().unwrap(), AccessMode::ReadOnly).await;
    assert!(matches!(result, Err(RasterError::NotFound(_))));
}
