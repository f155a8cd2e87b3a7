// Wire format: one JSON object per line in, one tagged line out
use hostembed_core::{Initializer, TableDescriptor};
use serde::{Deserialize, Serialize};

fn default_dtype() -> String {
    "f32".to_string()
}

fn default_strategy() -> String {
    "TOKEN".to_string()
}

#[derive(Debug, Deserialize)]
pub struct OptimizerRequest {
    pub kind: String,
    pub learning_rate: f32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Register {
        name: String,
        shape: Vec<usize>,
        #[serde(default = "default_dtype")]
        dtype: String,
        #[serde(default = "default_strategy")]
        partition_strategy: String,
        #[serde(default)]
        optimizer: Option<OptimizerRequest>,
        #[serde(default)]
        initializer: Option<Initializer>,
    },
    Lookup {
        name: String,
        ids: Vec<i64>,
        /// Shape of the id batch; flat when absent.
        #[serde(default)]
        shape: Option<Vec<usize>>,
        #[serde(default)]
        clip_indices: Option<bool>,
    },
    Accumulate {
        name: String,
        ids: Vec<i64>,
        grads: Vec<Vec<f32>>,
        #[serde(default)]
        clip_indices: Option<bool>,
    },
    Describe {
        #[serde(default)]
        name: Option<String>,
    },
    Save {
        dir: String,
    },
    Shutdown,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Register {
        table: TableDescriptor,
    },
    Lookup {
        name: String,
        shape: Vec<usize>,
        values: Vec<f32>,
        sha256: String,
    },
    Accumulate {
        name: String,
        rows_updated: usize,
        sha256: String,
    },
    Describe {
        tables: Vec<TableDescriptor>,
    },
    Save {
        dir: String,
        tables: usize,
        weights_sha256: String,
    },
    Shutdown,
}

#[derive(Debug, Serialize)]
pub struct ErrorLine<'a> {
    pub code: &'a str,
    pub message: String,
}

pub fn ok_line(response: &Response) -> String {
    match serde_json::to_string(response) {
        Ok(json) => format!("OK {}", json),
        Err(e) => error_line("E_INTERNAL", format!("failed to encode response: {}", e)),
    }
}

pub fn error_line(code: &str, message: String) -> String {
    let line = ErrorLine { code, message };
    match serde_json::to_string(&line) {
        Ok(json) => format!("ERROR {}", json),
        Err(_) => format!("ERROR {{\"code\":\"{}\"}}", code),
    }
}
