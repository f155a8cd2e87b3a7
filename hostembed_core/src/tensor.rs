use crate::error::{EmbeddingError, Result};
use ndarray::{Array2, ArrayD, ArrayView2, Ix2, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dense f32 tensor used for gathered rows, gradients and tables.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub data: ArrayD<f32>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            data: ArrayD::<f32>::zeros(IxDyn(shape)),
        }
    }

    pub fn from_vec(shape: &[usize], values: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(EmbeddingError::shape(
                shape,
                format!("{} values do not fill {} elements", values.len(), expected),
            ));
        }
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| EmbeddingError::shape(shape, e.to_string()))?;
        Ok(Self { data })
    }

    pub fn from_rows(rows: Array2<f32>) -> Self {
        Self {
            data: rows.into_dyn(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    /// Views the tensor as `[product(leading dims), last dim]`.
    pub fn rows_view(&self) -> Result<ArrayView2<'_, f32>> {
        let shape = self.shape();
        let width = *shape
            .last()
            .ok_or_else(|| EmbeddingError::shape(shape, "tensor has no trailing axis"))?;
        let leading: usize = shape[..shape.len() - 1].iter().product();
        self.data
            .view()
            .into_shape((leading, width))
            .map_err(|e| EmbeddingError::shape(shape, e.to_string()))
    }

    /// Returns the tensor as an owned 2-D matrix, failing for other ranks.
    pub fn into_matrix(self) -> Result<Array2<f32>> {
        let shape = self.shape().to_vec();
        self.data
            .into_dimensionality::<Ix2>()
            .map_err(|_| EmbeddingError::shape(&shape, "expected a rank-2 tensor"))
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }
}

/// Scalar element type a table is declared with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
        }
    }
}

impl FromStr for DType {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "f16" | "float16" | "half" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            "f32" | "float32" | "float" => Ok(DType::F32),
            "f64" | "float64" | "double" => Ok(DType::F64),
            "i32" | "int32" => Ok(DType::I32),
            "i64" | "int64" => Ok(DType::I64),
            _ => Err(EmbeddingError::DType {
                dtype: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to ids outside `[0, rows)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexPolicy {
    Clip,
    Reject,
}

impl IndexPolicy {
    pub fn from_clip(clip_indices: bool) -> Self {
        if clip_indices {
            IndexPolicy::Clip
        } else {
            IndexPolicy::Reject
        }
    }
}

/// N-dimensional batch of row ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexBatch {
    pub data: Vec<i64>,
    pub shape: Vec<usize>,
}

impl IndexBatch {
    pub fn new(shape: &[usize], data: Vec<i64>) -> Result<Self> {
        let expected_len: usize = shape.iter().product();
        if data.len() != expected_len {
            return Err(EmbeddingError::shape(
                shape,
                format!("index batch holds {} ids", data.len()),
            ));
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
        })
    }

    /// Rank-1 batch over the given ids.
    pub fn flat(ids: Vec<i64>) -> Self {
        Self {
            shape: vec![ids.len()],
            data: ids,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_ids(&self) -> usize {
        self.data.len()
    }

    /// Shape of a lookup result for a table of the given width.
    pub fn output_shape(&self, width: usize) -> Vec<usize> {
        let mut shape = self.shape.clone();
        shape.push(width);
        shape
    }

    /// Flattens the batch into row numbers valid for a table with `rows` rows.
    pub fn resolve(&self, rows: usize, policy: IndexPolicy) -> Result<Vec<usize>> {
        let last = rows as i64 - 1;
        let mut clipped = 0usize;
        let resolved = self
            .data
            .iter()
            .map(|&id| {
                if (0..=last).contains(&id) {
                    return Ok(id as usize);
                }
                match policy {
                    IndexPolicy::Clip => {
                        clipped += 1;
                        Ok(id.clamp(0, last.max(0)) as usize)
                    }
                    IndexPolicy::Reject => Err(EmbeddingError::IndexOutOfRange { index: id, rows }),
                }
            })
            .collect::<Result<Vec<usize>>>()?;
        if clipped > 0 {
            tracing::warn!(clipped, rows, "clipped out-of-range ids");
        }
        Ok(resolved)
    }
}
