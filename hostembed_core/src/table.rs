//! Table store: embedding matrices keyed by name.
//!
//! A table is a dense `[rows, width]` matrix whose row `i` is the encoding of
//! token `i`. The store exclusively owns every matrix registered with it;
//! everything else refers to tables by name or borrows shard views.

use crate::error::{EmbeddingError, Result};
use crate::rng::SeededRng;
use crate::tensor::DType;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a new table's values are produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    Zeros,
    Constant { value: f32 },
    Normal { mean: f32, std: f32, seed: u64 },
    Uniform { low: f32, high: f32, seed: u64 },
    Values { values: Vec<f32> },
}

impl Default for Initializer {
    fn default() -> Self {
        Initializer::Zeros
    }
}

impl Initializer {
    fn materialize(&self, rows: usize, width: usize) -> Result<Array2<f32>> {
        let len = rows * width;
        let values = match self {
            Initializer::Zeros => return Ok(Array2::zeros((rows, width))),
            Initializer::Constant { value } => vec![*value; len],
            Initializer::Normal { mean, std, seed } => {
                let mut rng = SeededRng::new(*seed);
                (0..len).map(|_| rng.normal(*mean, *std)).collect()
            }
            Initializer::Uniform { low, high, seed } => {
                if !(low < high) {
                    return Err(EmbeddingError::argument(
                        "initializer",
                        format!("uniform bounds must satisfy low < high, got [{}, {})", low, high),
                    ));
                }
                let mut rng = SeededRng::new(*seed);
                (0..len).map(|_| rng.gen_range(*low, *high)).collect()
            }
            Initializer::Values { values } => {
                if values.len() != len {
                    return Err(EmbeddingError::shape(
                        &[rows, width],
                        format!(
                            "initializer provides {} values, table needs {}",
                            values.len(),
                            len
                        ),
                    ));
                }
                values.clone()
            }
        };
        Array2::from_shape_vec((rows, width), values)
            .map_err(|e| EmbeddingError::shape(&[rows, width], e.to_string()))
    }
}

/// Validates a requested table shape, returning `(rows, width)`.
pub fn validate_shape(shape: &[usize]) -> Result<(usize, usize)> {
    if shape.len() != 2 {
        return Err(EmbeddingError::shape(
            shape,
            format!("embedding tables must be rank 2 [rows, width], got rank {}", shape.len()),
        ));
    }
    if shape[0] == 0 || shape[1] == 0 {
        return Err(EmbeddingError::shape(shape, "table dimensions must be non-zero"));
    }
    // ndarray caps an array at isize::MAX bytes
    let max_elements = isize::MAX as usize / std::mem::size_of::<f32>();
    match shape[0].checked_mul(shape[1]) {
        Some(elements) if elements <= max_elements => Ok((shape[0], shape[1])),
        _ => Err(EmbeddingError::shape(shape, "element count overflows")),
    }
}

/// Named `[rows, width]` embedding matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingTable {
    name: String,
    dtype: DType,
    values: Array2<f32>,
}

impl EmbeddingTable {
    pub fn new(
        name: &str,
        shape: &[usize],
        dtype: &str,
        initializer: &Initializer,
    ) -> Result<Self> {
        let (rows, width) = validate_shape(shape)?;
        let dtype: DType = dtype.parse()?;
        let values = initializer.materialize(rows, width)?;
        Ok(Self {
            name: name.to_string(),
            dtype,
            values,
        })
    }

    /// Wraps an existing matrix.
    pub fn from_matrix(name: &str, dtype: DType, values: Array2<f32>) -> Result<Self> {
        validate_shape(values.shape())?;
        Ok(Self {
            name: name.to_string(),
            dtype,
            values,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows(), self.width()]
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.values.view()
    }

    pub fn values_mut(&mut self) -> &mut Array2<f32> {
        &mut self.values
    }

    pub fn into_values(self) -> Array2<f32> {
        self.values
    }

    /// Compact `name[rows, width]:dtype` form used in conflict reports.
    pub fn signature(&self) -> String {
        format!("{}[{}, {}]:{}", self.name, self.rows(), self.width(), self.dtype)
    }
}

/// Owner of named tables.
#[derive(Debug, Default)]
pub struct TableStore {
    tables: BTreeMap<String, EmbeddingTable>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a table. Re-registering an identical shape and dtype keeps the
    /// existing values; any other difference is a conflict.
    pub fn register(&mut self, table: EmbeddingTable) -> Result<&EmbeddingTable> {
        let name = table.name().to_string();
        if let Some(existing) = self.tables.get(&name) {
            if existing.shape() != table.shape() || existing.dtype() != table.dtype() {
                return Err(EmbeddingError::Conflict {
                    name: table.name().to_string(),
                    existing: existing.signature(),
                    requested: table.signature(),
                });
            }
            tracing::debug!(name = table.name(), "table already registered");
        } else {
            tracing::info!(
                name = table.name(),
                rows = table.rows(),
                width = table.width(),
                dtype = %table.dtype(),
                "registered table"
            );
            self.tables.insert(name.clone(), table);
        }
        self.get(&name)
    }

    pub fn get(&self, name: &str) -> Result<&EmbeddingTable> {
        self.tables
            .get(name)
            .ok_or_else(|| EmbeddingError::not_found(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut EmbeddingTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| EmbeddingError::not_found(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<EmbeddingTable> {
        self.tables.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = &EmbeddingTable> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
