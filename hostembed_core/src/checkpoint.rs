//! Checkpoints for host tables.
//!
//! Layout of a checkpoint directory:
//! - `tables.json`: manifest (format version, weights digest, one record per table)
//! - `weights.bin`: every table's values as little-endian f32, row-major,
//!   concatenated in manifest order

use crate::error::{EmbeddingError, Result};
use crate::host::TableDescriptor;
use crate::table::EmbeddingTable;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

pub const CHECKPOINT_VERSION: &str = "1";
pub const MANIFEST_FILE: &str = "tables.json";
pub const WEIGHTS_FILE: &str = "weights.bin";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub descriptor: TableDescriptor,
    /// Offset into `weights.bin`, in f32 elements.
    pub offset: usize,
    pub len: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub weights_sha256: String,
    pub tables: Vec<TableRecord>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Digest of a table's values, as reported by the daemon.
pub fn table_digest(table: &EmbeddingTable) -> String {
    let mut hasher = Sha256::new();
    for value in table.view().iter() {
        hasher.update(value.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn checkpoint_error(path: &Path, message: impl Into<String>) -> EmbeddingError {
    EmbeddingError::Checkpoint {
        path: path.display().to_string(),
        message: message.into(),
    }
}

/// Writes `tables` (with the descriptors they were registered under) to `dir`.
pub fn save_tables<'a, I>(dir: &Path, tables: I) -> Result<Manifest>
where
    I: IntoIterator<Item = (&'a TableDescriptor, &'a EmbeddingTable)>,
{
    fs::create_dir_all(dir).map_err(|e| EmbeddingError::io(dir, e))?;

    let mut weights = Vec::new();
    let mut records = Vec::new();
    let mut offset = 0;
    for (descriptor, table) in tables {
        if table.shape() != descriptor.shape() {
            return Err(EmbeddingError::shape(
                &table.shape(),
                format!("table '{}' does not match its descriptor", descriptor.name),
            ));
        }
        let len = table.rows() * table.width();
        for value in table.view().iter() {
            weights.extend_from_slice(&value.to_le_bytes());
        }
        records.push(TableRecord {
            descriptor: descriptor.clone(),
            offset,
            len,
        });
        offset += len;
    }

    let manifest = Manifest {
        version: CHECKPOINT_VERSION.to_string(),
        weights_sha256: sha256_hex(&weights),
        tables: records,
    };

    let weights_path = dir.join(WEIGHTS_FILE);
    fs::write(&weights_path, &weights).map_err(|e| EmbeddingError::io(&weights_path, e))?;
    let manifest_path = dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| checkpoint_error(&manifest_path, e.to_string()))?;
    fs::write(&manifest_path, json).map_err(|e| EmbeddingError::io(&manifest_path, e))?;

    tracing::info!(
        dir = %dir.display(),
        tables = manifest.tables.len(),
        bytes = weights.len(),
        "saved checkpoint"
    );
    Ok(manifest)
}

pub fn read_manifest(dir: &Path) -> Result<Manifest> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let text =
        fs::read_to_string(&manifest_path).map_err(|e| EmbeddingError::io(&manifest_path, e))?;
    let manifest: Manifest =
        serde_json::from_str(&text).map_err(|e| checkpoint_error(&manifest_path, e.to_string()))?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(checkpoint_error(
            &manifest_path,
            format!(
                "unsupported checkpoint version '{}' (expected '{}')",
                manifest.version, CHECKPOINT_VERSION
            ),
        ));
    }
    Ok(manifest)
}

/// Reads a checkpoint back, verifying version, digest and sizes.
pub fn load_tables(dir: &Path) -> Result<Vec<(TableDescriptor, EmbeddingTable)>> {
    let manifest = read_manifest(dir)?;
    let weights_path = dir.join(WEIGHTS_FILE);
    let bytes = fs::read(&weights_path).map_err(|e| EmbeddingError::io(&weights_path, e))?;

    let actual = sha256_hex(&bytes);
    if actual != manifest.weights_sha256 {
        return Err(EmbeddingError::CheckpointCorrupt {
            path: weights_path.display().to_string(),
            expected: manifest.weights_sha256,
            actual,
        });
    }
    if bytes.len() % 4 != 0 {
        return Err(checkpoint_error(&weights_path, "weights are not a whole number of f32 values"));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut tables = Vec::with_capacity(manifest.tables.len());
    for record in manifest.tables {
        let descriptor = record.descriptor;
        let expected_len = descriptor.rows.checked_mul(descriptor.width);
        let end = match record.offset.checked_add(record.len) {
            Some(end) if expected_len == Some(record.len) && end <= values.len() => end,
            _ => {
                return Err(checkpoint_error(
                    &weights_path,
                    format!(
                        "record for '{}' ({} values at offset {}) does not fit {} values",
                        descriptor.name,
                        record.len,
                        record.offset,
                        values.len()
                    ),
                ))
            }
        };
        if let Some(optimizer) = &descriptor.optimizer {
            optimizer.validate().map_err(|e| {
                checkpoint_error(
                    &dir.join(MANIFEST_FILE),
                    format!("table '{}': {}", descriptor.name, e),
                )
            })?;
        }
        let matrix = Array2::from_shape_vec(
            (descriptor.rows, descriptor.width),
            values[record.offset..end].to_vec(),
        )
        .map_err(|e| checkpoint_error(&weights_path, e.to_string()))?;
        let table = EmbeddingTable::from_matrix(&descriptor.name, descriptor.dtype, matrix)?;
        tables.push((descriptor, table));
    }

    tracing::info!(dir = %dir.display(), tables = tables.len(), "loaded checkpoint");
    Ok(tables)
}
