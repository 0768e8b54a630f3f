use arrow::{
    array::{Array, ArrayRef, Float64Array, RecordBatch, StringArray, UInt64Array},
    datatypes::{DataType, Field, Schema},
};
use log::{debug, info};
use parquet::{
    arrow::{ArrowWriter, arrow_reader::ParquetRecordBatchReaderBuilder},
    basic::Compression,
    file::properties::WriterProperties,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    builder::ConfigValue,
    storage::{ProjectionRecord, RecordKey, RecordStore, SketchRecord, Stage, StorageError},
};

// ============================================================================
// Metadata sidecar
// ============================================================================

/// JSON sidecar written next to every record's Parquet file(s).
///
/// Matrix dimensions live here rather than in the Parquet columns so that
/// zero-row records round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub name_id: String,
    pub timestamp: String,
    pub stage: Stage,
    pub rank: usize,

    pub n_rows: usize,
    pub n_cols: usize,

    /// Sketch records only
    pub rows_incorporated: Option<usize>,
    pub tracked_index_ranges: Option<Vec<(usize, usize)>>,

    /// Projection records only
    pub thumbnail_cols: Option<usize>,

    /// Run configuration (typed values)
    pub config: HashMap<String, ConfigValue>,
}

impl RecordMetadata {
    pub fn new(key: &RecordKey, n_rows: usize, n_cols: usize) -> Self {
        Self {
            name_id: key.name(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            stage: key.stage,
            rank: key.rank,
            n_rows,
            n_cols,
            rows_incorporated: None,
            tracked_index_ranges: None,
            thumbnail_cols: None,
            config: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: HashMap<String, ConfigValue>) -> Self {
        self.config = config;
        self
    }

    /// Get a typed config value
    pub fn get_config<'a>(&'a self, key: &str) -> Option<&'a ConfigValue> {
        self.config.get(key)
    }
}

pub fn save_metadata(metadata: &RecordMetadata, path: impl AsRef<Path>) -> Result<(), StorageError> {
    let metadata_path = path
        .as_ref()
        .join(format!("{}_metadata.json", metadata.name_id));

    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| StorageError::Serde(format!("Failed to serialize metadata: {}", e)))?;

    std::fs::write(&metadata_path, json)
        .map_err(|e| StorageError::Io(format!("Failed to write metadata: {}", e)))?;

    Ok(())
}

pub fn load_metadata(path: impl AsRef<Path>, name_id: &str) -> Result<RecordMetadata, StorageError> {
    let metadata_path = path.as_ref().join(format!("{}_metadata.json", name_id));
    if !metadata_path.exists() {
        return Err(StorageError::NotFound(name_id.to_string()));
    }

    debug!("loading metadata from {:?}", metadata_path);
    let json = std::fs::read_to_string(&metadata_path)
        .map_err(|e| StorageError::Io(format!("Failed to read metadata: {}", e)))?;

    serde_json::from_str(&json)
        .map_err(|e| StorageError::Serde(format!("Failed to parse metadata: {}", e)))
}

// ============================================================================
// Row-major matrix storage
// ============================================================================

/// Save `rows` (each of width `n_cols`) as `{name_id}.parquet` with Snappy
/// compression: a `name_id` column, an optional `row_index` column and one
/// `col_{j}` Float64 column per matrix column.
pub fn save_rows(
    rows: &[Vec<f64>],
    n_cols: usize,
    row_index: Option<&[usize]>,
    path: impl AsRef<Path>,
    name_id: &str,
) -> Result<(), StorageError> {
    let n_rows = rows.len();
    if let Some(bad) = rows.iter().find(|r| r.len() != n_cols) {
        return Err(StorageError::Invalid(format!(
            "row of width {} in a {}-column matrix",
            bad.len(),
            n_cols
        )));
    }

    let mut fields = vec![Field::new("name_id", DataType::Utf8, false)];
    let mut columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from(vec![name_id; n_rows]))];

    if let Some(index) = row_index {
        if index.len() != n_rows {
            return Err(StorageError::Invalid(format!(
                "{} row indices for {} rows",
                index.len(),
                n_rows
            )));
        }
        fields.push(Field::new("row_index", DataType::UInt64, false));
        columns.push(Arc::new(UInt64Array::from(
            index.iter().map(|&i| i as u64).collect::<Vec<u64>>(),
        )));
    }

    for j in 0..n_cols {
        fields.push(Field::new(format!("col_{}", j), DataType::Float64, false));
        let col: Vec<f64> = rows.iter().map(|r| r[j]).collect();
        columns.push(Arc::new(Float64Array::from(col)));
    }

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| StorageError::Arrow(e.to_string()))?;

    let file_path = path.as_ref().join(format!("{}.parquet", name_id));
    let file = File::create(&file_path).map_err(|e| StorageError::Io(e.to_string()))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut writer = ArrowWriter::try_new(file, schema, Some(props))
        .map_err(|e| StorageError::Parquet(e.to_string()))?;
    writer
        .write(&batch)
        .map_err(|e| StorageError::Parquet(e.to_string()))?;
    writer
        .close()
        .map_err(|e| StorageError::Parquet(e.to_string()))?;

    debug!("Saved {}x{} rows to {:?}", n_rows, n_cols, file_path);
    Ok(())
}

/// Load rows written by [`save_rows`]. Returns the rows and, when present,
/// the `row_index` column.
pub fn load_rows(
    path: impl AsRef<Path>,
    n_cols: usize,
) -> Result<(Vec<Vec<f64>>, Option<Vec<usize>>), StorageError> {
    let file = File::open(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| StorageError::Parquet(e.to_string()))?
        .build()
        .map_err(|e| StorageError::Parquet(e.to_string()))?;

    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut index: Option<Vec<usize>> = None;

    for batch_result in reader {
        let batch = batch_result.map_err(|e| StorageError::Parquet(e.to_string()))?;
        let batch_rows = batch.num_rows();

        if let Some(col) = batch.column_by_name("row_index") {
            let col = col
                .as_any()
                .downcast_ref::<UInt64Array>()
                .ok_or_else(|| StorageError::Invalid("row_index column has wrong type".to_string()))?;
            index
                .get_or_insert_with(Vec::new)
                .extend(col.values().iter().map(|&i| i as usize));
        }

        let cols = (0..n_cols)
            .map(|j| {
                let name = format!("col_{}", j);
                batch
                    .column_by_name(&name)
                    .and_then(|c| c.as_any().downcast_ref::<Float64Array>())
                    .ok_or_else(|| StorageError::Invalid(format!("Column {} missing", name)))
            })
            .collect::<Result<Vec<&Float64Array>, StorageError>>()?;

        for i in 0..batch_rows {
            rows.push(cols.iter().map(|c| c.value(i)).collect());
        }
    }

    Ok((rows, index))
}

// ============================================================================
// Store
// ============================================================================

/// Directory-backed [`RecordStore`].
///
/// Files per record, named after [`RecordKey::name`]:
/// - `{name}.parquet`: sketch rows or projected coordinates (+ `row_index`)
/// - `{name}_thumbnails.parquet`: projection thumbnails, if any
/// - `{name}_metadata.json`: dimensions, bookkeeping and run configuration
#[derive(Debug, Clone)]
pub struct ParquetStore {
    root: PathBuf,
    config: HashMap<String, ConfigValue>,
}

impl ParquetStore {
    /// Create the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| StorageError::Io(e.to_string()))?;
        info!("ParquetStore at {}", root.display());
        Ok(Self {
            root,
            config: HashMap::new(),
        })
    }

    /// Attach the run configuration to every metadata sidecar.
    pub fn with_config(mut self, config: HashMap<String, ConfigValue>) -> Self {
        self.config = config;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self, key: &RecordKey) -> Result<RecordMetadata, StorageError> {
        load_metadata(&self.root, &key.name())
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.parquet", name))
    }
}

impl RecordStore for ParquetStore {
    fn put_sketch(&self, key: &RecordKey, record: &SketchRecord) -> Result<(), StorageError> {
        let name = key.name();
        save_rows(&record.sketch, record.n_features, None, &self.root, &name)?;

        let mut metadata = RecordMetadata::new(key, record.sketch.len(), record.n_features)
            .with_config(self.config.clone());
        metadata.rows_incorporated = Some(record.rows_incorporated);
        metadata.tracked_index_ranges = Some(record.tracked_index_ranges.clone());
        save_metadata(&metadata, &self.root)?;

        info!(
            "Saved sketch {} ({}x{}, {} rows incorporated)",
            name,
            record.sketch.len(),
            record.n_features,
            record.rows_incorporated
        );
        Ok(())
    }

    fn get_sketch(&self, key: &RecordKey) -> Result<SketchRecord, StorageError> {
        let name = key.name();
        let metadata = load_metadata(&self.root, &name)?;
        let (sketch, _) = load_rows(self.data_path(&name), metadata.n_cols)?;

        if sketch.len() != metadata.n_rows {
            return Err(StorageError::Invalid(format!(
                "{} contained {} rows, but metadata claimed {}",
                name,
                sketch.len(),
                metadata.n_rows
            )));
        }

        Ok(SketchRecord {
            sketch,
            n_features: metadata.n_cols,
            rows_incorporated: metadata.rows_incorporated.unwrap_or(0),
            tracked_index_ranges: metadata.tracked_index_ranges.unwrap_or_default(),
        })
    }

    fn put_projection(&self, key: &RecordKey, record: &ProjectionRecord) -> Result<(), StorageError> {
        let name = key.name();
        save_rows(
            &record.projected_coordinates,
            record.n_components,
            Some(&record.row_indices),
            &self.root,
            &name,
        )?;

        let mut metadata = RecordMetadata::new(key, record.len(), record.n_components)
            .with_config(self.config.clone());

        if let Some(thumbnails) = &record.thumbnails {
            let width = thumbnails.first().map_or(0, |t| t.len());
            save_rows(thumbnails, width, None, &self.root, &format!("{}_thumbnails", name))?;
            metadata.thumbnail_cols = Some(width);
        }
        save_metadata(&metadata, &self.root)?;

        info!(
            "Saved projection {} ({} rows, {} components)",
            name,
            record.len(),
            record.n_components
        );
        Ok(())
    }

    fn get_projection(&self, key: &RecordKey) -> Result<ProjectionRecord, StorageError> {
        let name = key.name();
        let metadata = load_metadata(&self.root, &name)?;
        let (coords, index) = load_rows(self.data_path(&name), metadata.n_cols)?;

        let thumbnails = match metadata.thumbnail_cols {
            Some(width) => {
                let (t, _) = load_rows(self.data_path(&format!("{}_thumbnails", name)), width)?;
                Some(t)
            }
            None => None,
        };

        Ok(ProjectionRecord {
            row_indices: index.unwrap_or_default(),
            projected_coordinates: coords,
            n_components: metadata.n_cols,
            thumbnails,
        })
    }
}
