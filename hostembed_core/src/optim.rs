use crate::error::{EmbeddingError, Result};
use crate::kernels::scatter_add_rows;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptimizerKind {
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SGD" => Ok(OptimizerKind::Sgd),
            _ => Err(EmbeddingError::UnsupportedOptimizer {
                kind: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => f.write_str("SGD"),
        }
    }
}

/// How a host-resident table is updated from gradients computed elsewhere.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSpec {
    kind: OptimizerKind,
    learning_rate: f32,
}

impl OptimizerSpec {
    pub fn new(kind: &str, learning_rate: f32) -> Result<Self> {
        let spec = Self {
            kind: kind.parse()?,
            learning_rate,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Checks the learning rate; specs read back from disk skip [`Self::new`].
    pub fn validate(&self) -> Result<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(EmbeddingError::argument(
                "learning_rate",
                format!("learning rate must be finite and positive, got {}", self.learning_rate),
            ));
        }
        Ok(())
    }

    pub fn sgd(learning_rate: f32) -> Result<Self> {
        Self::new("SGD", learning_rate)
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Applies the update rule for `grads` (one row per id) to `table`.
    pub fn apply_rows(&self, table: &mut Array2<f32>, ids: &[i64], grads: ArrayView2<'_, f32>) {
        match self.kind {
            // row -= lr * grad_row, once per occurrence
            OptimizerKind::Sgd => scatter_add_rows(table, ids, grads, -self.learning_rate),
        }
    }

    /// Applies the update rule for a dense table-shaped gradient.
    pub fn apply_dense(&self, table: &mut Array2<f32>, grad: &Array2<f32>) -> Result<()> {
        if table.shape() != grad.shape() {
            return Err(EmbeddingError::shape(
                grad.shape(),
                format!("gradient does not match table shape {:?}", table.shape()),
            ));
        }
        match self.kind {
            OptimizerKind::Sgd => table.scaled_add(-self.learning_rate, grad),
        }
        Ok(())
    }
}
