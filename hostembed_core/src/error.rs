// Error taxonomy for table, lookup and gradient operations
use crate::diagnostic::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EmbeddingError>;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum EmbeddingError {
    #[error("invalid argument '{name}': {message}")]
    Argument { name: String, message: String },

    #[error("serialization factor {factor} does not divide the table row count {rows}")]
    Divisibility { rows: usize, factor: usize },

    #[error("malformed shape {shape:?}: {message}")]
    Shape { shape: Vec<usize>, message: String },

    #[error("unsupported dtype '{dtype}'")]
    DType { dtype: String },

    #[error("table '{name}' is registered as {existing}, cannot re-register as {requested}")]
    Conflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("no table named '{name}' is registered")]
    NotFound { name: String },

    #[error("unsupported optimizer '{kind}' (only SGD is available)")]
    UnsupportedOptimizer { kind: String },

    #[error("index {index} out of range for table with {rows} rows")]
    IndexOutOfRange { index: i64, rows: usize },

    #[error("host transfer for table '{name}' failed: {message}")]
    Transfer { name: String, message: String },

    #[error("checkpoint error at '{path}': {message}")]
    Checkpoint { path: String, message: String },

    #[error("checkpoint '{path}' is corrupt: weights digest {actual}, manifest {expected}")]
    CheckpointCorrupt {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error at '{path}': {message}")]
    Io { path: String, message: String },
}

impl EmbeddingError {
    pub fn argument(name: &str, message: impl Into<String>) -> Self {
        EmbeddingError::Argument {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn shape(shape: &[usize], message: impl Into<String>) -> Self {
        EmbeddingError::Shape {
            shape: shape.to_vec(),
            message: message.into(),
        }
    }

    pub fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        EmbeddingError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    pub fn not_found(name: &str) -> Self {
        EmbeddingError::NotFound {
            name: name.to_string(),
        }
    }

    /// Stable code shared by the CLI, the daemon and the diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            EmbeddingError::Argument { .. } => "E_ARGUMENT",
            EmbeddingError::Divisibility { .. } => "E_DIVISIBILITY",
            EmbeddingError::Shape { .. } => "E_SHAPE",
            EmbeddingError::DType { .. } => "E_DTYPE",
            EmbeddingError::Conflict { .. } => "E_CONFLICT",
            EmbeddingError::NotFound { .. } => "E_NOT_FOUND",
            EmbeddingError::UnsupportedOptimizer { .. } => "E_UNSUPPORTED_OPTIMIZER",
            EmbeddingError::IndexOutOfRange { .. } => "E_INDEX_OUT_OF_RANGE",
            EmbeddingError::Transfer { .. } => "E_HOST_TRANSFER",
            EmbeddingError::Checkpoint { .. } => "E_CHECKPOINT",
            EmbeddingError::CheckpointCorrupt { .. } => "E_CHECKPOINT_CORRUPT",
            EmbeddingError::Io { .. } => "E_IO",
        }
    }

    pub fn diagnostic(&self) -> Diagnostic {
        let code = self.code();
        match self {
            EmbeddingError::Argument { name, message } => {
                Diagnostic::new(code, "Invalid argument".to_string())
                    .with_field("argument", name)
                    .with_field("message", message)
            }
            EmbeddingError::Divisibility { rows, factor } => Diagnostic::new(
                code,
                "Serialization factor does not divide the table".to_string(),
            )
            .with_field("rows", rows)
            .with_field("serialization_factor", factor)
            .with_hint(format!(
                "Pick a serialization factor that divides {} (for example 1).",
                rows
            )),
            EmbeddingError::Shape { shape, message } => {
                Diagnostic::new(code, "Malformed shape".to_string())
                    .with_field("shape", format!("{:?}", shape))
                    .with_field("message", message)
            }
            EmbeddingError::DType { dtype } => {
                Diagnostic::new(code, "Unsupported dtype".to_string())
                    .with_field("dtype", dtype)
                    .with_hint(
                        "Use a fixed-width numeric dtype: f16, bf16, f32, f64, i32 or i64."
                            .to_string(),
                    )
            }
            EmbeddingError::Conflict {
                name,
                existing,
                requested,
            } => Diagnostic::new(code, "Table registration conflict".to_string())
                .with_field("name", name)
                .with_field("existing", existing)
                .with_field("requested", requested)
                .with_hint(format!(
                    "Table '{}' must keep its shape, dtype and strategy on every registration.",
                    name
                )),
            EmbeddingError::NotFound { name } => {
                Diagnostic::new(code, "Table not registered".to_string())
                    .with_field("name", name)
                    .with_hint("Create the table before looking it up.".to_string())
            }
            EmbeddingError::UnsupportedOptimizer { kind } => {
                Diagnostic::new(code, "Unsupported optimizer".to_string())
                    .with_field("optimizer", kind)
                    .with_hint("Host embeddings only support SGD.".to_string())
            }
            EmbeddingError::IndexOutOfRange { index, rows } => {
                Diagnostic::new(code, "Index out of range".to_string())
                    .with_field("index", index)
                    .with_field("rows", rows)
                    .with_hint("Enable index clipping or fix the index batch.".to_string())
            }
            EmbeddingError::Transfer { name, message } => {
                Diagnostic::new(code, "Host transfer failed".to_string())
                    .with_field("name", name)
                    .with_field("message", message)
            }
            EmbeddingError::Checkpoint { path, message } => {
                Diagnostic::new(code, "Checkpoint error".to_string())
                    .with_field("path", path)
                    .with_field("message", message)
            }
            EmbeddingError::CheckpointCorrupt {
                path,
                expected,
                actual,
            } => Diagnostic::new(code, "Checkpoint weights are corrupt".to_string())
                .with_field("path", path)
                .with_field("expected_sha256", expected)
                .with_field("actual_sha256", actual)
                .with_hint(
                    "Re-save the checkpoint; weights.bin was modified after it was written."
                        .to_string(),
                ),
            EmbeddingError::Io { path, message } => Diagnostic::new(code, "I/O error".to_string())
                .with_field("path", path)
                .with_field("message", message),
        }
    }
}
