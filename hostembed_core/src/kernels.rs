// Op kernels for the reference executor.
// Both the full-activation executor and the streaming evaluator dispatch here.

use crate::error::{EmbeddingError, Result};
use crate::ir::{Op, Value};
use ndarray::{s, Array2, ArrayView2, ArrayViewD, Ix2, IxDyn};

/// External values a graph is evaluated against.
#[derive(Clone, Copy, Debug)]
pub struct GraphInputs<'a> {
    pub table: ArrayView2<'a, f32>,
    pub ids: &'a [i64],
}

fn as_matrix<'v>(op: &Op, value: ArrayViewD<'v, f32>) -> Result<ArrayView2<'v, f32>> {
    let shape = value.shape().to_vec();
    value.into_dimensionality::<Ix2>().map_err(|_| {
        EmbeddingError::shape(&shape, format!("{} expects a rank-2 input", op.name()))
    })
}

/// Reads rows of `source` at `ids`; ids outside the block produce zero rows.
pub fn gather_rows(source: ArrayView2<'_, f32>, ids: &[i64]) -> Array2<f32> {
    let rows = source.nrows() as i64;
    let mut out = Array2::<f32>::zeros((ids.len(), source.ncols()));
    for (mut dst, &id) in out.outer_iter_mut().zip(ids) {
        if (0..rows).contains(&id) {
            dst.assign(&source.row(id as usize));
        }
    }
    out
}

/// Adds `scale * updates[i]` into `target[ids[i]]`, accumulating duplicates.
pub fn scatter_add_rows(
    target: &mut Array2<f32>,
    ids: &[i64],
    updates: ArrayView2<'_, f32>,
    scale: f32,
) {
    let rows = target.nrows() as i64;
    for (update, &id) in updates.outer_iter().zip(ids) {
        if (0..rows).contains(&id) {
            target
                .row_mut(id as usize)
                .scaled_add(scale, &update);
        }
    }
}

/// Zeroes every row whose id falls outside `[min, max)`.
pub fn mask_rows(values: &mut Array2<f32>, ids: &[i64], min: i64, max: i64) {
    for (mut row, &id) in values.outer_iter_mut().zip(ids) {
        if !(min..max).contains(&id) {
            row.fill(0.0);
        }
    }
}

/// Execute a single op forward pass.
pub fn execute_op_forward<'a>(
    op: &Op,
    input_values: &[&Value<'a>],
    inputs: &GraphInputs<'a>,
) -> Result<Value<'a>> {
    match op {
        Op::Table => Ok(Value::View(inputs.table.into_dyn())),
        Op::Ids => Ok(Value::Ids(inputs.ids.to_vec())),
        Op::SliceRows { start, len } => {
            let source = input_values[0];
            let end = start + len;
            match source {
                // Slicing a borrowed table stays a borrow: no shard is ever copied.
                Value::View(view) => {
                    let matrix = as_matrix(op, view.clone())?;
                    check_slice(matrix.nrows(), *start, end)?;
                    Ok(Value::View(matrix.slice_move(s![*start..end, ..]).into_dyn()))
                }
                other => {
                    let floats = other.floats()?;
                    let matrix = as_matrix(op, floats)?;
                    check_slice(matrix.nrows(), *start, end)?;
                    Ok(Value::Owned(
                        matrix.slice(s![*start..end, ..]).to_owned().into_dyn(),
                    ))
                }
            }
        }
        Op::OffsetIds { offset } => {
            let ids = input_values[0].ids()?;
            Ok(Value::Ids(ids.iter().map(|id| id - offset).collect()))
        }
        Op::Gather => {
            let source = input_values[0].floats()?;
            let ids = input_values[1].ids()?;
            let matrix = as_matrix(op, source)?;
            Ok(Value::Owned(gather_rows(matrix, ids).into_dyn()))
        }
        Op::MaskRange { min, max } => {
            let ids = input_values[1].ids()?;
            let mut values = as_matrix(op, input_values[0].floats()?)?.to_owned();
            check_rows(op, values.nrows(), ids.len())?;
            mask_rows(&mut values, ids, *min, *max);
            Ok(Value::Owned(values.into_dyn()))
        }
        Op::Add => {
            let a = input_values[0].floats()?;
            let b = input_values[1].floats()?;
            if a.shape() != b.shape() {
                return Err(EmbeddingError::shape(
                    b.shape(),
                    format!("add operands differ: {:?} vs {:?}", a.shape(), b.shape()),
                ));
            }
            Ok(Value::Owned(&a + &b))
        }
        Op::ScatterAdd { rows, scale } => {
            let updates = as_matrix(op, input_values[0].floats()?)?;
            let ids = input_values[1].ids()?;
            check_rows(op, updates.nrows(), ids.len())?;
            let mut target = Array2::<f32>::zeros((*rows, updates.ncols()));
            scatter_add_rows(&mut target, ids, updates, *scale);
            Ok(Value::Owned(target.into_dyn()))
        }
        Op::Reshape { shape } => {
            let source = input_values[0].floats()?;
            let expected: usize = shape.iter().product();
            if expected != source.len() {
                return Err(EmbeddingError::shape(
                    shape,
                    format!("cannot reshape {} elements", source.len()),
                ));
            }
            let reshaped = source
                .as_standard_layout()
                .into_owned()
                .into_shape(IxDyn(shape))
                .map_err(|e| EmbeddingError::shape(shape, e.to_string()))?;
            Ok(Value::Owned(reshaped))
        }
    }
}

fn check_slice(rows: usize, start: usize, end: usize) -> Result<()> {
    if end > rows {
        return Err(EmbeddingError::argument(
            "slice_rows",
            format!("rows [{}, {}) exceed {} rows", start, end, rows),
        ));
    }
    Ok(())
}

fn check_rows(op: &Op, rows: usize, ids: usize) -> Result<()> {
    if rows != ids {
        return Err(EmbeddingError::shape(
            &[rows],
            format!("{} got {} rows for {} ids", op.name(), rows, ids),
        ));
    }
    Ok(())
}

