//! Lookup engine: resolves ids into table rows.
//!
//! Each lookup mode is a [`LookupNode`] pairing its forward rule with its
//! backward rule:
//!
//! * [`DirectGather`]: one gather over the whole table.
//! * [`SerializedGather`]: the table is split into `factor` row blocks; each
//!   block gathers with ids shifted to its origin, rows from other blocks are
//!   masked to zero, and the masked outputs are summed. Only one block is
//!   gathered at a time.
//! * [`HostLookup`]: the ids travel to the host, which answers with rows.

use crate::error::{EmbeddingError, Result};
use crate::forward;
use crate::gradient::{host_accumulate, scatter_add_gradient, upstream_rows};
use crate::host::{HostChannel, TableDescriptor};
use crate::ir::{Graph, NodeId, Op};
use crate::kernels::GraphInputs;
use crate::partition;
use crate::table::EmbeddingTable;
use crate::tensor::{IndexBatch, IndexPolicy, Tensor};
use ndarray::ArrayView2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupMode {
    Direct,
    Serialized { factor: usize },
    Host,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookupOptions {
    pub serialization_factor: usize,
    pub clip_indices: bool,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            serialization_factor: 1,
            clip_indices: true,
        }
    }
}

impl LookupOptions {
    pub fn serialized(factor: usize) -> Self {
        Self {
            serialization_factor: factor,
            ..Self::default()
        }
    }

    pub fn index_policy(&self) -> IndexPolicy {
        IndexPolicy::from_clip(self.clip_indices)
    }
}

/// A lookup as a dataflow node: forward produces rows, backward consumes the
/// upstream gradient of those rows.
pub trait LookupNode {
    fn mode(&self) -> LookupMode;

    /// `ids` are already resolved into `[0, rows)`; `out_shape` is the
    /// caller's view of the result (`ids.shape ++ [width]`).
    fn forward(&mut self, ids: &[i64], out_shape: &[usize]) -> Result<Tensor>;

    /// Returns the table-shaped gradient, or `None` when the gradient was
    /// handed to the host instead.
    fn backward(&mut self, ids: &[i64], upstream: &Tensor) -> Result<Option<Tensor>>;
}

/// Lowered form of a device lookup.
#[derive(Clone, Debug)]
pub struct LoweredLookup {
    pub graph: Graph,
    pub table: NodeId,
    pub output: NodeId,
}

pub struct DirectGather<'a> {
    table: ArrayView2<'a, f32>,
}

impl<'a> DirectGather<'a> {
    pub fn new(table: ArrayView2<'a, f32>) -> Self {
        Self { table }
    }

    pub fn lower(out_shape: &[usize]) -> LoweredLookup {
        let mut graph = Graph::new();
        let table = graph.table_node();
        let ids = graph.ids_node();
        let gathered = graph.add_node(Op::Gather, vec![table, ids]);
        let output = graph.add_node(
            Op::Reshape {
                shape: out_shape.to_vec(),
            },
            vec![gathered],
        );
        LoweredLookup {
            graph,
            table,
            output,
        }
    }
}

impl LookupNode for DirectGather<'_> {
    fn mode(&self) -> LookupMode {
        LookupMode::Direct
    }

    fn forward(&mut self, ids: &[i64], out_shape: &[usize]) -> Result<Tensor> {
        run_lowered(&Self::lower(out_shape), self.table, ids)
    }

    fn backward(&mut self, ids: &[i64], upstream: &Tensor) -> Result<Option<Tensor>> {
        device_backward(self.table, ids, upstream)
    }
}

pub struct SerializedGather<'a> {
    table: ArrayView2<'a, f32>,
    factor: usize,
}

impl<'a> SerializedGather<'a> {
    pub fn new(table: ArrayView2<'a, f32>, factor: usize) -> Result<Self> {
        partition::shard_rows(table.nrows(), factor)?;
        Ok(Self { table, factor })
    }

    /// Builds slice -> shift -> gather -> mask per block, chained with adds.
    pub fn lower(rows: usize, factor: usize, out_shape: &[usize]) -> Result<LoweredLookup> {
        let bounds = partition::shard_ranges(rows, factor)?;
        let mut graph = Graph::new();
        let table = graph.table_node();
        let ids = graph.ids_node();

        let mut sum: Option<NodeId> = None;
        for range in bounds {
            let (min_idx, max_idx) = (range.start, range.end);
            let sliced = graph.add_node(
                Op::SliceRows {
                    start: min_idx,
                    len: max_idx - min_idx,
                },
                vec![table],
            );
            let adjusted = graph.add_node(
                Op::OffsetIds {
                    offset: min_idx as i64,
                },
                vec![ids],
            );
            let gathered = graph.add_node(Op::Gather, vec![sliced, adjusted]);
            let masked = graph.add_node(
                Op::MaskRange {
                    min: min_idx as i64,
                    max: max_idx as i64,
                },
                vec![gathered, ids],
            );
            sum = Some(match sum {
                None => masked,
                Some(prev) => graph.add_node(Op::Add, vec![prev, masked]),
            });
        }

        let summed = sum.ok_or_else(|| {
            EmbeddingError::argument("serialization_factor", "no shards were produced")
        })?;
        let output = graph.add_node(
            Op::Reshape {
                shape: out_shape.to_vec(),
            },
            vec![summed],
        );
        Ok(LoweredLookup {
            graph,
            table,
            output,
        })
    }
}

impl LookupNode for SerializedGather<'_> {
    fn mode(&self) -> LookupMode {
        LookupMode::Serialized {
            factor: self.factor,
        }
    }

    fn forward(&mut self, ids: &[i64], out_shape: &[usize]) -> Result<Tensor> {
        let lowered = Self::lower(self.table.nrows(), self.factor, out_shape)?;
        run_lowered(&lowered, self.table, ids)
    }

    fn backward(&mut self, ids: &[i64], upstream: &Tensor) -> Result<Option<Tensor>> {
        device_backward(self.table, ids, upstream)
    }
}

fn run_lowered(
    lowered: &LoweredLookup,
    table: ArrayView2<'_, f32>,
    ids: &[i64],
) -> Result<Tensor> {
    // Reborrow so the view and the ids share one lifetime.
    let inputs = GraphInputs {
        table: table.view(),
        ids,
    };
    let value = forward::evaluate(&lowered.graph, &inputs, lowered.output)?;
    Ok(Tensor {
        data: value.into_owned()?,
    })
}

fn device_backward(
    table: ArrayView2<'_, f32>,
    ids: &[i64],
    upstream: &Tensor,
) -> Result<Option<Tensor>> {
    let rows = upstream_rows(upstream, ids.len(), table.ncols())?;
    let grad = scatter_add_gradient([table.nrows(), table.ncols()], ids, rows, 1.0)?;
    Ok(Some(Tensor::from_rows(grad)))
}

/// Lookup served by a host channel.
pub struct HostLookup<'c> {
    channel: &'c mut dyn HostChannel,
    descriptor: TableDescriptor,
}

impl<'c> HostLookup<'c> {
    pub fn new(channel: &'c mut dyn HostChannel, descriptor: TableDescriptor) -> Self {
        Self {
            channel,
            descriptor,
        }
    }
}

impl LookupNode for HostLookup<'_> {
    fn mode(&self) -> LookupMode {
        LookupMode::Host
    }

    fn forward(&mut self, ids: &[i64], out_shape: &[usize]) -> Result<Tensor> {
        let rows = self.channel.lookup(&self.descriptor, ids)?;
        if rows.nrows() != ids.len() || rows.ncols() != self.descriptor.width {
            return Err(EmbeddingError::Transfer {
                name: self.descriptor.name.clone(),
                message: format!(
                    "host answered with {:?} rows for {} ids",
                    rows.shape(),
                    ids.len()
                ),
            });
        }
        let values = rows.as_standard_layout().iter().copied().collect();
        Tensor::from_vec(out_shape, values)
    }

    fn backward(&mut self, ids: &[i64], upstream: &Tensor) -> Result<Option<Tensor>> {
        host_accumulate(self.channel, &self.descriptor, ids, upstream)?;
        Ok(None)
    }
}

/// Picks the device lookup node for a serialization factor.
pub fn device_node<'a>(
    table: ArrayView2<'a, f32>,
    factor: usize,
) -> Result<Box<dyn LookupNode + 'a>> {
    partition::shard_rows(table.nrows(), factor)?;
    if factor == 1 {
        Ok(Box::new(DirectGather::new(table)))
    } else {
        Ok(Box::new(SerializedGather::new(table, factor)?))
    }
}

/// Flattens and range-checks ids, returning them with the output shape.
pub fn prepare_ids(
    ids: &IndexBatch,
    rows: usize,
    width: usize,
    policy: IndexPolicy,
) -> Result<(Vec<i64>, Vec<usize>)> {
    let resolved = ids
        .resolve(rows, policy)?
        .into_iter()
        .map(|id| id as i64)
        .collect();
    Ok((resolved, ids.output_shape(width)))
}

/// Looks up `ids` in a device-resident table. The result has shape
/// `ids.shape ++ [width]`.
pub fn lookup(table: &EmbeddingTable, ids: &IndexBatch, options: &LookupOptions) -> Result<Tensor> {
    let mut node = device_node(table.view(), options.serialization_factor)?;
    let (flat, out_shape) = prepare_ids(ids, table.rows(), table.width(), options.index_policy())?;
    tracing::debug!(
        table = table.name(),
        mode = ?node.mode(),
        rows = table.rows(),
        num_ids = flat.len(),
        "device lookup"
    );
    node.forward(&flat, &out_shape)
}

/// Table-shaped gradient of [`lookup`] for the given upstream gradient.
pub fn lookup_gradient(
    table: &EmbeddingTable,
    ids: &IndexBatch,
    upstream: &Tensor,
    options: &LookupOptions,
) -> Result<Tensor> {
    let mut node = device_node(table.view(), options.serialization_factor)?;
    let (flat, _) = prepare_ids(ids, table.rows(), table.width(), options.index_policy())?;
    node.backward(&flat, upstream)?.ok_or_else(|| {
        EmbeddingError::argument("lookup", "device lookup produced no gradient")
    })
}
