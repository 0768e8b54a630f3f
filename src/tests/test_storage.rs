use crate::storage::{
    MemoryStore, ProjectionRecord, RecordKey, RecordStore, SketchRecord, Stage, StorageError,
};

#[test]
fn keys_name_records() {
    let key = RecordKey::new("241016120000", Stage::Merged, 3);
    assert_eq!(key.name(), "241016120000_merged_3");
    assert_eq!(key.to_string(), key.name());
    assert_ne!(key, RecordKey::new("241016120000", Stage::Local, 3));
}

#[test]
fn memory_store_roundtrip() {
    let store = MemoryStore::new();
    let key = RecordKey::new("r", Stage::Local, 0);
    let record = SketchRecord {
        sketch: vec![vec![1.0, 2.0], vec![0.0, 0.5]],
        n_features: 2,
        rows_incorporated: 9,
        tracked_index_ranges: vec![(0, 9)],
    };
    store.put_sketch(&key, &record).unwrap();
    assert_eq!(store.get_sketch(&key).unwrap(), record);
    assert_eq!(record.ell(), 2);
    assert_eq!(store.sketch_count(), 1);

    let pkey = RecordKey::new("r", Stage::Projected, 0);
    let projection = ProjectionRecord {
        row_indices: vec![4],
        projected_coordinates: vec![vec![0.1]],
        n_components: 1,
        thumbnails: None,
    };
    store.put_projection(&pkey, &projection).unwrap();
    assert_eq!(store.get_projection(&pkey).unwrap(), projection);
    assert_eq!(store.projection_count(), 1);
}

#[test]
fn memory_store_missing_key() {
    let store = MemoryStore::new();
    let key = RecordKey::new("r", Stage::Merged, 1);
    assert_eq!(
        store.get_sketch(&key).unwrap_err(),
        StorageError::NotFound("r_merged_1".to_string())
    );
    assert!(store.get_projection(&key).is_err());
}

#[test]
fn memory_store_concurrent_writers() {
    use rayon::prelude::*;

    let store = MemoryStore::new();
    (0..16usize).into_par_iter().for_each(|rank| {
        let record = SketchRecord {
            sketch: vec![vec![rank as f64, 1.0]],
            n_features: 2,
            rows_incorporated: rank,
            tracked_index_ranges: vec![(0, rank)],
        };
        store
            .put_sketch(&RecordKey::new("r", Stage::Local, rank), &record)
            .unwrap();
    });

    assert_eq!(store.sketch_count(), 16);
    let seven = store.get_sketch(&RecordKey::new("r", Stage::Local, 7)).unwrap();
    assert_eq!(seven.rows_incorporated, 7);
    assert_eq!(seven.sketch, vec![vec![7.0, 1.0]]);
}
