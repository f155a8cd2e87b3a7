use crate::backward::execute_backward;
use crate::error::{EmbeddingError, Result};
use crate::forward::execute_forward;
use crate::gradient::scatter_add_gradient;
use crate::kernels::GraphInputs;
use crate::lookup::{lookup, LookupOptions, SerializedGather};
use crate::rng::SeededRng;
use crate::table::{EmbeddingTable, Initializer};
use crate::tensor::{IndexBatch, Tensor};
use ndarray::Array2;

#[derive(Clone, Debug, PartialEq)]
pub struct GradcheckReport {
    pub checked: usize,
    /// Largest |numerical - scatter-add| over all table elements.
    pub max_numeric_error: f32,
    /// Largest |graph autodiff - scatter-add| over all table elements.
    pub max_autodiff_error: f32,
    pub passed: bool,
}

fn weighted_sum(out: &Tensor, weights: &Array2<f32>) -> Result<f32> {
    let rows = out.rows_view()?;
    Ok((&rows * weights).sum())
}

/// Checks the scatter-add gradient of a serialized lookup against central
/// differences of `sum(lookup(T, ids) * W)` and against the gradient the
/// graph executor derives from the lowered lookup.
pub fn gradcheck_serialized_lookup(
    rows: usize,
    width: usize,
    factor: usize,
    ids: &[i64],
) -> Result<GradcheckReport> {
    const EPS: f32 = 1e-2;
    const TOL: f32 = 1e-2;

    if ids.is_empty() {
        return Err(EmbeddingError::argument("ids", "gradcheck needs at least one id"));
    }
    let table = EmbeddingTable::new(
        "gradcheck",
        &[rows, width],
        "f32",
        &Initializer::Uniform {
            low: -1.0,
            high: 1.0,
            seed: 7,
        },
    )?;
    let batch = IndexBatch::flat(ids.to_vec());
    let options = LookupOptions {
        serialization_factor: factor,
        clip_indices: false,
    };

    let mut rng = SeededRng::new(11);
    let weights = Array2::from_shape_fn((ids.len(), width), |_| rng.gen_range(-1.0, 1.0));
    let upstream = Tensor::from_rows(weights.clone());

    let analytic = scatter_add_gradient([rows, width], ids, weights.view(), 1.0)?;

    // Gradient the executor derives from the lowered graph
    let lowered = SerializedGather::lower(rows, factor, &[ids.len(), width])?;
    let inputs = GraphInputs {
        table: table.view(),
        ids,
    };
    let activations = execute_forward(&lowered.graph, &inputs)?;
    let grads = execute_backward(&lowered.graph, &activations, lowered.output, &upstream)?;
    let autodiff = match grads[lowered.table].clone() {
        Some(grad) => grad.into_matrix()?,
        None => Array2::zeros((rows, width)),
    };
    let max_autodiff_error = (&autodiff - &analytic)
        .iter()
        .fold(0.0f32, |acc, d| acc.max(d.abs()));

    let mut max_numeric_error = 0.0f32;
    for r in 0..rows {
        for c in 0..width {
            let mut plus = table.clone();
            plus.values_mut()[[r, c]] += EPS;
            let mut minus = table.clone();
            minus.values_mut()[[r, c]] -= EPS;

            let loss_plus = weighted_sum(&lookup(&plus, &batch, &options)?, &weights)?;
            let loss_minus = weighted_sum(&lookup(&minus, &batch, &options)?, &weights)?;
            let numerical = (loss_plus - loss_minus) / (2.0 * EPS);

            let diff = (numerical - analytic[[r, c]]).abs();
            if diff > TOL {
                tracing::warn!(
                    row = r,
                    col = c,
                    numerical,
                    analytic = analytic[[r, c]],
                    "gradient mismatch"
                );
            }
            max_numeric_error = max_numeric_error.max(diff);
        }
    }

    Ok(GradcheckReport {
        checked: rows * width,
        max_numeric_error,
        max_autodiff_error,
        passed: max_numeric_error <= TOL && max_autodiff_error <= TOL,
    })
}
