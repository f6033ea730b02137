//! A downstream consumer sees only serialized documents and resolves frames lazily.

use basler_daq::{
    core::{Dtype, FrameShape},
    data::{Compression, FrameStore, StoreOptions},
    experiment::AssetDocument,
    handler::{AssetHandler, FrameFileHandler, HandlerRegistry, ResourceTable},
    instrument::{CameraSettings, MockCamera, PixelFormat},
    CameraDetector, DaqError, DetectorConfig,
};
use tempfile::TempDir;

async fn acquire_json_lines(
    dir: &TempDir,
    settings: CameraSettings,
    compression: Compression,
) -> Vec<String> {
    let mut config = DetectorConfig::new(dir.path());
    config.store_options = StoreOptions::with_compression(compression);
    let camera = MockCamera::new(32, 24).with_seed(3);
    let mut detector = CameraDetector::new("cam", camera, config).with_settings(settings);

    detector.stage().await.unwrap();
    for _ in 0..4 {
        detector.trigger().await.unwrap();
    }
    detector.unstage().await.unwrap();
    detector
        .collect_documents()
        .iter()
        .map(|doc| serde_json::to_string(doc).unwrap())
        .collect()
}

#[tokio::test]
async fn test_consumer_resolves_from_json_lines() {
    let dir = TempDir::new().unwrap();
    let settings = CameraSettings {
        pixel_format: PixelFormat::Mono12,
        ..CameraSettings::default()
    };
    let lines = acquire_json_lines(&dir, settings, Compression::Lz4).await;
    assert_eq!(lines.len(), 5);

    let docs: Vec<AssetDocument> = lines
        .iter()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let mut table = ResourceTable::new(HandlerRegistry::with_defaults());
    table.ingest_all(&docs).unwrap();

    let resource = docs[0].as_resource().unwrap();
    let mut store = FrameStore::open(resource.full_path()).unwrap();
    assert_eq!(store.dtype(), Dtype::U16);
    assert_eq!(store.compression(), Compression::Lz4);

    for doc in &docs[1..] {
        let datum = doc.as_datum().unwrap();
        let frame = table.resolve(&datum.reference()).unwrap();
        assert_eq!(frame.shape(), FrameShape::new(24, 32));
        assert_eq!(frame, store.read(datum.frame_index).unwrap());
    }
}

#[tokio::test]
async fn test_uncompressed_sessions_resolve_identically() {
    let dir = TempDir::new().unwrap();
    let lines = acquire_json_lines(&dir, CameraSettings::default(), Compression::None).await;
    let docs: Vec<AssetDocument> = lines
        .iter()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    let resource = docs[0].as_resource().unwrap();
    let handler = FrameFileHandler::new(resource);
    let frame = handler.resolve(3).unwrap();
    assert_eq!(frame.dtype(), Dtype::U8);

    match handler.resolve(4) {
        Err(DaqError::Resolve { source, .. }) => {
            assert!(matches!(*source, DaqError::Index { index: 4, len: 4 }))
        }
        other => panic!("expected resolve failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_moved_file_fails_to_resolve() {
    let dir = TempDir::new().unwrap();
    let lines = acquire_json_lines(&dir, CameraSettings::default(), Compression::Lz4).await;
    let docs: Vec<AssetDocument> = lines
        .iter()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let resource = docs[0].as_resource().unwrap();
    std::fs::remove_file(resource.full_path()).unwrap();

    let mut table = ResourceTable::new(HandlerRegistry::with_defaults());
    table.ingest_all(&docs).unwrap();
    let datum = docs[1].as_datum().unwrap();
    assert!(matches!(
        table.resolve_datum(&datum.datum_id),
        Err(DaqError::Resolve { .. })
    ));
}

#[cfg(feature = "storage_hdf5")]
#[tokio::test]
async fn test_hdf5_session_resolves_through_registry() {
    use basler_daq::data::StorageFormat;

    let dir = TempDir::new().unwrap();
    let mut config = DetectorConfig::new(dir.path());
    config.store_options = StoreOptions::hdf5();
    let camera = MockCamera::new(32, 24).with_seed(5).recording();
    let mut detector = CameraDetector::new("cam", camera, config);

    detector.stage().await.unwrap();
    for _ in 0..3 {
        detector.trigger().await.unwrap();
    }
    let summary = detector.unstage().await.unwrap();
    assert_eq!(summary.path.extension().unwrap(), "h5");

    let docs = detector.collect_documents();
    let store = FrameStore::open(&summary.path).unwrap();
    assert_eq!(store.format(), StorageFormat::Hdf5);
    assert_eq!(store.len(), 3);

    let mut table = ResourceTable::new(HandlerRegistry::with_defaults());
    table.ingest_all(&docs).unwrap();
    for (doc, expected) in docs[1..].iter().zip(detector.camera().history()) {
        let datum = doc.as_datum().unwrap();
        assert_eq!(&table.resolve_datum(&datum.datum_id).unwrap(), expected);
    }
}
