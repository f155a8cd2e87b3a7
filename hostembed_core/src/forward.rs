use crate::error::{EmbeddingError, Result};
use crate::ir::{Graph, NodeId, Value};
use crate::kernels::{self, GraphInputs};

/// Runs every node and keeps all activations (the backward pass needs them).
pub fn execute_forward<'a>(graph: &Graph, inputs: &GraphInputs<'a>) -> Result<Vec<Value<'a>>> {
    let mut activations: Vec<Value<'a>> = Vec::with_capacity(graph.nodes.len());

    for node in &graph.nodes {
        let input_vals: Vec<&Value<'a>> = node.inputs.iter().map(|&id| &activations[id]).collect();
        let output = kernels::execute_op_forward(&node.op, &input_vals, inputs)?;
        activations.push(output);
    }

    Ok(activations)
}

/// Runs the graph up to `output`, releasing each intermediate after its last
/// reader so at most one shard's worth of gathered rows is live besides the
/// running sum.
pub fn evaluate<'a>(graph: &Graph, inputs: &GraphInputs<'a>, output: NodeId) -> Result<Value<'a>> {
    if output >= graph.nodes.len() {
        return Err(EmbeddingError::argument(
            "output",
            format!("node {} does not exist in a graph of {} nodes", output, graph.nodes.len()),
        ));
    }
    let last_uses = graph.last_uses();
    let mut live: Vec<Option<Value<'a>>> = vec![None; graph.nodes.len()];

    for (node_id, node) in graph.nodes.iter().enumerate().take(output + 1) {
        let output_value = {
            let input_vals = node
                .inputs
                .iter()
                .map(|&id| {
                    live[id].as_ref().ok_or_else(|| {
                        EmbeddingError::argument("graph", format!("node {} was released early", id))
                    })
                })
                .collect::<Result<Vec<&Value<'a>>>>()?;
            kernels::execute_op_forward(&node.op, &input_vals, inputs)?
        };
        live[node_id] = Some(output_value);

        for &input in &node.inputs {
            if last_uses[input] == Some(node_id) && input != output {
                live[input] = None;
            }
        }
    }

    live[output]
        .take()
        .ok_or_else(|| {
            EmbeddingError::argument("output", format!("node {} produced no value", output))
        })
}
