//! Row-block serialization and replica distribution of tables.

use crate::error::{EmbeddingError, Result};
use ndarray::{s, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// Axis a host-resident table is split along when distributed over replicas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionStrategy {
    /// Each replica owns a contiguous block of rows.
    Token,
    /// Each replica owns a contiguous block of columns of every row.
    Encoding,
}

impl Default for PartitionStrategy {
    fn default() -> Self {
        PartitionStrategy::Token
    }
}

impl PartitionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            PartitionStrategy::Token => "TOKEN",
            PartitionStrategy::Encoding => "ENCODING",
        }
    }

    fn axis(self) -> Axis {
        match self {
            PartitionStrategy::Token => Axis(0),
            PartitionStrategy::Encoding => Axis(1),
        }
    }
}

impl FromStr for PartitionStrategy {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TOKEN" => Ok(PartitionStrategy::Token),
            "ENCODING" => Ok(PartitionStrategy::Encoding),
            _ => Err(EmbeddingError::argument(
                "partition_strategy",
                format!("unknown partition strategy '{}' (expected TOKEN or ENCODING)", s),
            )),
        }
    }
}

impl fmt::Display for PartitionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view over rows `[min_row, max_row)` of a table.
#[derive(Clone, Debug)]
pub struct Shard<'a> {
    pub index: usize,
    pub min_row: usize,
    pub max_row: usize,
    pub rows: ArrayView2<'a, f32>,
}

impl Shard<'_> {
    pub fn len(&self) -> usize {
        self.max_row - self.min_row
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: usize) -> bool {
        (self.min_row..self.max_row).contains(&id)
    }
}

/// Checks a serialization factor against a row count and returns the shard size.
pub fn shard_rows(rows: usize, factor: usize) -> Result<usize> {
    if factor < 1 {
        return Err(EmbeddingError::argument(
            "serialization_factor",
            format!("serialization factor has to be at least 1, but was {}", factor),
        ));
    }
    if rows % factor != 0 {
        return Err(EmbeddingError::Divisibility { rows, factor });
    }
    Ok(rows / factor)
}

/// Row bounds `[min_row, max_row)` of each of the `factor` blocks.
pub fn shard_ranges(rows: usize, factor: usize) -> Result<Vec<Range<usize>>> {
    let split_size = shard_rows(rows, factor)?;
    Ok((0..factor)
        .map(|i| i * split_size..(i + 1) * split_size)
        .collect())
}

/// Splits a table into `factor` equally sized row blocks.
pub fn split(table: ArrayView2<'_, f32>, factor: usize) -> Result<Vec<Shard<'_>>> {
    Ok(shard_ranges(table.nrows(), factor)?
        .into_iter()
        .enumerate()
        .map(|(index, range)| Shard {
            index,
            min_row: range.start,
            max_row: range.end,
            rows: table.slice_move(s![range.start..range.end, ..]),
        })
        .collect())
}

/// Contiguous range of the split axis owned by one replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaRange {
    pub replica: usize,
    pub start: usize,
    pub end: usize,
}

/// Computes replica ownership along `len` entries using ceiling division, so
/// only the final replica can be short.
pub fn replica_ranges(len: usize, replicas: usize) -> Result<Vec<ReplicaRange>> {
    if replicas < 1 || replicas > len {
        return Err(EmbeddingError::argument(
            "replicas",
            format!("cannot distribute {} entries over {} replicas", len, replicas),
        ));
    }
    let per_replica = ceil_div(len, replicas);
    let ranges: Vec<ReplicaRange> = (0..replicas)
        .map(|replica| {
            let start = replica.saturating_mul(per_replica).min(len);
            let end = (replica + 1).saturating_mul(per_replica).min(len);
            ReplicaRange {
                replica,
                start,
                end,
            }
        })
        .collect();
    if ranges.iter().any(|r| r.start == r.end) {
        return Err(EmbeddingError::argument(
            "replicas",
            format!(
                "distributing {} entries over {} replicas leaves a replica empty",
                len, replicas
            ),
        ));
    }
    Ok(ranges)
}

/// Views of the table each replica holds under the given strategy.
pub fn distribute(
    table: ArrayView2<'_, f32>,
    strategy: PartitionStrategy,
    replicas: usize,
) -> Result<Vec<ArrayView2<'_, f32>>> {
    let axis = strategy.axis();
    let ranges = replica_ranges(table.len_of(axis), replicas)?;
    Ok(ranges
        .into_iter()
        .map(|r| match strategy {
            PartitionStrategy::Token => table.slice_move(s![r.start..r.end, ..]),
            PartitionStrategy::Encoding => table.slice_move(s![.., r.start..r.end]),
        })
        .collect())
}

/// Replica and local row that own token `id` under TOKEN distribution.
pub fn route_token(id: usize, rows: usize, replicas: usize) -> (usize, usize) {
    let per_replica = ceil_div(rows, replicas);
    (id / per_replica, id % per_replica)
}

fn ceil_div(len: usize, parts: usize) -> usize {
    len / parts + usize::from(len % parts != 0)
}
