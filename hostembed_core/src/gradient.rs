//! Gradient rules for embedding lookups.
//!
//! Whatever the serialization factor of the forward pass, the gradient of a
//! lookup is one scatter-add of the upstream rows into a zero table: the
//! masks guarantee each id's contribution came from exactly one shard.

use crate::error::{EmbeddingError, Result};
use crate::forward;
use crate::host::{HostChannel, TableDescriptor};
use crate::ir::{Graph, NodeId, Op};
use crate::kernels::GraphInputs;
use crate::tensor::Tensor;
use ndarray::{Array2, ArrayView2, Ix2};

/// Views `upstream` as `[num_ids, width]`, checking it matches the lookup output.
pub fn upstream_rows<'u>(
    upstream: &'u Tensor,
    num_ids: usize,
    width: usize,
) -> Result<ArrayView2<'u, f32>> {
    let rows = upstream.rows_view()?;
    if rows.nrows() != num_ids || rows.ncols() != width {
        return Err(EmbeddingError::shape(
            upstream.shape(),
            format!(
                "upstream gradient must hold {} rows of width {}",
                num_ids, width
            ),
        ));
    }
    Ok(rows)
}

/// Table-shaped gradient: zeros with `scale * upstream[i]` added at `ids[i]`.
/// Duplicate ids accumulate.
pub fn scatter_add_gradient(
    table_shape: [usize; 2],
    ids: &[i64],
    upstream: ArrayView2<'_, f32>,
    scale: f32,
) -> Result<Array2<f32>> {
    let [rows, width] = table_shape;
    if upstream.nrows() != ids.len() || upstream.ncols() != width {
        return Err(EmbeddingError::shape(
            upstream.shape(),
            format!("expected [{}, {}] upstream rows", ids.len(), width),
        ));
    }
    if let Some(&index) = ids.iter().find(|&&id| id < 0 || id as usize >= rows) {
        return Err(EmbeddingError::IndexOutOfRange { index, rows });
    }
    let (graph, output) = scatter_add_graph(rows, scale);
    // The graph's float input is the upstream rows, not a table.
    let inputs = GraphInputs {
        table: upstream.view(),
        ids,
    };
    let grad = forward::evaluate(&graph, &inputs, output)?.into_owned()?;
    let shape = grad.shape().to_vec();
    grad.into_dimensionality::<Ix2>()
        .map_err(|_| EmbeddingError::shape(&shape, "scatter-add produced a non-matrix gradient"))
}

/// `zeros([rows, width])` plus `scale * updates` at `ids`, as a graph over
/// (updates, ids).
pub fn scatter_add_graph(rows: usize, scale: f32) -> (Graph, NodeId) {
    let mut graph = Graph::new();
    let updates = graph.table_node();
    let ids = graph.ids_node();
    let output = graph.add_node(Op::ScatterAdd { rows, scale }, vec![updates, ids]);
    (graph, output)
}

/// Hands the upstream rows to the host, which applies the table's optimizer.
pub fn host_accumulate(
    channel: &mut dyn HostChannel,
    descriptor: &TableDescriptor,
    ids: &[i64],
    upstream: &Tensor,
) -> Result<()> {
    if !descriptor.is_trainable() {
        return Err(EmbeddingError::argument(
            "optimizer_spec",
            format!("table '{}' has no optimizer spec and cannot be trained", descriptor.name),
        ));
    }
    let rows = upstream_rows(upstream, ids.len(), descriptor.width)?;
    channel.accumulate(descriptor, ids, rows)
}
