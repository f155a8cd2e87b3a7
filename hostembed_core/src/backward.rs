use crate::error::{EmbeddingError, Result};
use crate::ir::{Graph, NodeId, Op, Value};
use crate::kernels::{gather_rows, mask_rows, scatter_add_rows};
use crate::tensor::Tensor;
use ndarray::{s, Array2, ArrayD, Ix2, IxDyn};

fn matrix(grad: &ArrayD<f32>, what: &str) -> Result<Array2<f32>> {
    let shape = grad.shape().to_vec();
    grad.clone()
        .into_dimensionality::<Ix2>()
        .map_err(|_| EmbeddingError::shape(&shape, format!("{} gradient must be 2D", what)))
}

fn accumulate(grads: &mut [Option<Tensor>], node_id: NodeId, grad: ArrayD<f32>) {
    match grads[node_id].take() {
        None => grads[node_id] = Some(Tensor { data: grad }),
        Some(existing) => {
            grads[node_id] = Some(Tensor {
                data: &existing.data + &grad,
            })
        }
    }
}

/// Differentiates `output` with respect to every float node, seeded with
/// `upstream`. Id nodes never receive gradients.
pub fn execute_backward(
    graph: &Graph,
    activations: &[Value<'_>],
    output: NodeId,
    upstream: &Tensor,
) -> Result<Vec<Option<Tensor>>> {
    let mut grads: Vec<Option<Tensor>> = vec![None; graph.nodes.len()];
    let out_shape = activations[output].floats()?.shape().to_vec();
    if upstream.shape() != out_shape.as_slice() {
        return Err(EmbeddingError::shape(
            upstream.shape(),
            format!("upstream gradient must match output shape {:?}", out_shape),
        ));
    }
    grads[output] = Some(upstream.clone());

    // Traverse graph in reverse order
    for node_id in (0..=output).rev() {
        let grad_out = match &grads[node_id] {
            Some(g) => g.clone(),
            None => continue,
        };
        let node = &graph.nodes[node_id];

        match &node.op {
            Op::Table | Op::Ids | Op::OffsetIds { .. } => {}
            Op::SliceRows { start, len } => {
                let source_shape = activations[node.inputs[0]].floats()?.shape().to_vec();
                let g = matrix(&grad_out.data, "slice_rows")?;
                let mut grad_in = Array2::<f32>::zeros((source_shape[0], source_shape[1]));
                grad_in
                    .slice_mut(s![*start..*start + *len, ..])
                    .assign(&g);
                accumulate(&mut grads, node.inputs[0], grad_in.into_dyn());
            }
            Op::Gather => {
                let source_shape = activations[node.inputs[0]].floats()?.shape().to_vec();
                let ids = activations[node.inputs[1]].ids()?;
                let g = matrix(&grad_out.data, "gather")?;
                let mut grad_in = Array2::<f32>::zeros((source_shape[0], source_shape[1]));
                scatter_add_rows(&mut grad_in, ids, g.view(), 1.0);
                accumulate(&mut grads, node.inputs[0], grad_in.into_dyn());
            }
            Op::MaskRange { min, max } => {
                let ids = activations[node.inputs[1]].ids()?;
                let mut g = matrix(&grad_out.data, "mask_range")?;
                mask_rows(&mut g, ids, *min, *max);
                accumulate(&mut grads, node.inputs[0], g.into_dyn());
            }
            Op::Add => {
                accumulate(&mut grads, node.inputs[0], grad_out.data.clone());
                accumulate(&mut grads, node.inputs[1], grad_out.data);
            }
            Op::ScatterAdd { scale, .. } => {
                let ids = activations[node.inputs[1]].ids()?;
                let g = matrix(&grad_out.data, "scatter_add")?;
                let grad_in = gather_rows(g.view(), ids) * *scale;
                accumulate(&mut grads, node.inputs[0], grad_in.into_dyn());
            }
            Op::Reshape { .. } => {
                let source_shape = activations[node.inputs[0]].floats()?.shape().to_vec();
                let grad_in = grad_out
                    .data
                    .as_standard_layout()
                    .into_owned()
                    .into_shape(IxDyn(&source_shape))
                    .map_err(|e| EmbeddingError::shape(&source_shape, e.to_string()))?;
                accumulate(&mut grads, node.inputs[0], grad_in);
            }
        }
    }

    Ok(grads)
}
