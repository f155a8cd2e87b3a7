use hostembed_core::{
    checkpoint::{read_manifest, MANIFEST_FILE, WEIGHTS_FILE},
    load_tables, Coordinator, DType, DeviceConfig, EmbeddingError, HostChannel, HostStore,
    IndexBatch, Initializer, LookupOptions, OptimizerSpec, PartitionStrategy, TableDescriptor,
    Tensor,
};
use ndarray::array;
use std::fs;

fn trained_store() -> HostStore {
    let mut store = HostStore::new(2);
    let words = TableDescriptor {
        name: "words".to_string(),
        rows: 6,
        width: 2,
        dtype: DType::F32,
        partition_strategy: PartitionStrategy::Token,
        optimizer: Some(OptimizerSpec::sgd(0.1).unwrap()),
    };
    store
        .register(
            &words,
            &Initializer::Values {
                values: (0..12).map(|v| v as f32).collect(),
            },
        )
        .unwrap();
    let grads = array![[1.0f32, 2.0]];
    store.accumulate(&words, &[5], grads.view()).unwrap();

    let chars = TableDescriptor {
        name: "chars".to_string(),
        rows: 4,
        width: 3,
        dtype: DType::F16,
        partition_strategy: PartitionStrategy::Encoding,
        optimizer: None,
    };
    store
        .register(&chars, &Initializer::Constant { value: -2.0 })
        .unwrap();
    store
}

#[test]
fn test_checkpoint_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = trained_store();

    let manifest = store.save(dir.path()).unwrap();
    assert_eq!(manifest.tables.len(), 2);
    assert_eq!(read_manifest(dir.path()).unwrap(), manifest);

    let restored = HostStore::restore(dir.path(), 2).unwrap();
    for descriptor in store.descriptors() {
        assert_eq!(restored.descriptor(&descriptor.name).unwrap(), descriptor);
        assert_eq!(
            restored.table(&descriptor.name).unwrap(),
            store.table(&descriptor.name).unwrap()
        );
    }
    // 10 - 0.1 * 1, 11 - 0.1 * 2
    let words = restored.table("words").unwrap();
    assert!((words.view()[[5, 0]] - 9.9).abs() < 1e-5);
    assert!((words.view()[[5, 1]] - 10.8).abs() < 1e-5);
}

#[test]
fn test_restored_tables_serve_lookups() {
    let dir = tempfile::tempdir().unwrap();
    trained_store().save(dir.path()).unwrap();

    let mut store = HostStore::restore(dir.path(), 2).unwrap();
    let descriptor = store.descriptor("chars").unwrap().clone();
    let rows = store.lookup(&descriptor, &[0, 3]).unwrap();
    assert!(rows.iter().all(|&v| v == -2.0));
}

#[test]
fn test_corrupted_weights_are_detected() {
    let dir = tempfile::tempdir().unwrap();
    trained_store().save(dir.path()).unwrap();

    let weights_path = dir.path().join(WEIGHTS_FILE);
    let mut bytes = fs::read(&weights_path).unwrap();
    bytes[0] ^= 0xff;
    fs::write(&weights_path, bytes).unwrap();

    let err = load_tables(dir.path()).unwrap_err();
    assert_eq!(err.code(), "E_CHECKPOINT_CORRUPT");
    assert!(err.diagnostic().field("expected_sha256").is_some());
}

#[test]
fn test_unknown_checkpoint_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    trained_store().save(dir.path()).unwrap();

    let manifest_path = dir.path().join(MANIFEST_FILE);
    let text = fs::read_to_string(&manifest_path).unwrap();
    fs::write(&manifest_path, text.replace("\"version\": \"1\"", "\"version\": \"99\"")).unwrap();

    let err = load_tables(dir.path()).unwrap_err();
    assert_eq!(err.code(), "E_CHECKPOINT");
}

#[test]
fn test_edited_manifest_is_rejected_without_panicking() {
    let dir = tempfile::tempdir().unwrap();
    trained_store().save(dir.path()).unwrap();
    let manifest_path = dir.path().join(MANIFEST_FILE);
    let original = fs::read_to_string(&manifest_path).unwrap();
    assert!(original.contains("\"offset\": 0"));
    assert!(original.contains("\"learning_rate\": 0.1"));

    let huge_offset = original.replacen("\"offset\": 0", "\"offset\": 18446744073709551615", 1);
    fs::write(&manifest_path, huge_offset).unwrap();
    assert_eq!(load_tables(dir.path()).unwrap_err().code(), "E_CHECKPOINT");

    let huge_rows = original.replacen("\"rows\": 6", "\"rows\": 9223372036854775807", 1);
    fs::write(&manifest_path, huge_rows).unwrap();
    assert_eq!(load_tables(dir.path()).unwrap_err().code(), "E_CHECKPOINT");

    let negative_rate = original.replace("\"learning_rate\": 0.1", "\"learning_rate\": -0.1");
    fs::write(&manifest_path, negative_rate).unwrap();
    let err = HostStore::restore(dir.path(), 2).unwrap_err();
    assert_eq!(err.code(), "E_CHECKPOINT");
    assert!(err.to_string().contains("learning rate"), "{}", err);
}

#[test]
fn test_missing_checkpoint_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_tables(&dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, EmbeddingError::Io { .. }));
}

#[test]
fn test_coordinator_session_can_be_checkpointed() {
    let dir = tempfile::tempdir().unwrap();
    let mut coord = Coordinator::new(HostStore::default());
    let handle = coord
        .create_host_embedding(
            "emb",
            &[4, 2],
            "f32",
            PartitionStrategy::Token,
            Some(OptimizerSpec::sgd(1.0).unwrap()),
            None,
        )
        .unwrap();
    let ids = IndexBatch::flat(vec![1]);
    coord.lookup(&handle, &ids, &LookupOptions::default()).unwrap();
    let grad = Tensor::from_vec(&[1, 2], vec![0.5, -0.5]).unwrap();
    coord
        .apply_gradients(&handle, &ids, &grad, &LookupOptions::default())
        .unwrap();

    coord.channel().save(dir.path()).unwrap();
    let tables = load_tables(dir.path()).unwrap();

    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].1.view().row(1).to_vec(), vec![-0.5, 0.5]);
}

#[test]
fn test_config_defaults_and_loading() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.json");
    fs::write(&path, r#"{"replicas": 4, "max_shard_rows": 3}"#).unwrap();

    let config = DeviceConfig::load(&path).unwrap();
    assert_eq!(config.replicas, 4);
    assert_eq!(config.default_serialization_factor, 1);
    assert!(config.clip_indices);
    assert_eq!(config.max_shard_rows, Some(3));

    assert_eq!(DeviceConfig::load_or_default(None).unwrap(), DeviceConfig::default());
}

#[test]
fn test_config_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("device.json");

    fs::write(&path, r#"{"replicas": 0}"#).unwrap();
    assert_eq!(DeviceConfig::load(&path).unwrap_err().code(), "E_ARGUMENT");

    fs::write(&path, r#"{"replica_count": 2}"#).unwrap();
    assert_eq!(DeviceConfig::load(&path).unwrap_err().code(), "E_ARGUMENT");

    let err = DeviceConfig::load(&dir.path().join("missing.json")).unwrap_err();
    assert_eq!(err.code(), "E_IO");
}

#[test]
fn test_pick_serialization_factor() {
    let default = DeviceConfig::default();
    assert_eq!(default.pick_serialization_factor(12).unwrap(), 1);

    let bounded = DeviceConfig {
        max_shard_rows: Some(5),
        ..DeviceConfig::default()
    };
    // 12 rows: factor 3 gives shards of 4
    assert_eq!(bounded.pick_serialization_factor(12).unwrap(), 3);
    // 7 is prime: only factor 7 fits
    assert_eq!(bounded.pick_serialization_factor(7).unwrap(), 7);

    let tight = DeviceConfig {
        default_serialization_factor: 4,
        max_shard_rows: Some(100),
        ..DeviceConfig::default()
    };
    assert_eq!(tight.pick_serialization_factor(8).unwrap(), 4);
    assert!(tight.pick_serialization_factor(3).is_err());
}
