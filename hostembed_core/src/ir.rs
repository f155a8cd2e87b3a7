use crate::error::{EmbeddingError, Result};
use ndarray::{ArrayD, ArrayViewD};

pub type NodeId = usize;

#[derive(Clone, Debug)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<NodeId>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Graph input: the [rows, width] table.
    Table,
    /// Graph input: flat ids [num_ids].
    Ids,
    /// Row block of a 2D input, borrowed when possible.
    SliceRows { start: usize, len: usize },
    OffsetIds { offset: i64 }, // ids - offset
    /// [rows, ids] -> [num_ids, width]; ids outside the block read as zero.
    Gather,
    /// [values, ids] -> values with rows whose id is outside [min, max) zeroed.
    MaskRange { min: i64, max: i64 },
    Add,
    /// [updates, ids] -> zeros([rows, width]) + scale * updates at ids.
    ScatterAdd { rows: usize, scale: f32 },
    Reshape { shape: Vec<usize> },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Table => "table",
            Op::Ids => "ids",
            Op::SliceRows { .. } => "slice_rows",
            Op::OffsetIds { .. } => "offset_ids",
            Op::Gather => "gather",
            Op::MaskRange { .. } => "mask_range",
            Op::Add => "add",
            Op::ScatterAdd { .. } => "scatter_add",
            Op::Reshape { .. } => "reshape",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Op::Table | Op::Ids => 0,
            Op::SliceRows { .. } | Op::OffsetIds { .. } | Op::Reshape { .. } => 1,
            Op::Gather | Op::MaskRange { .. } | Op::Add | Op::ScatterAdd { .. } => 2,
        }
    }
}

/// Value flowing along a graph edge.
#[derive(Clone, Debug)]
pub enum Value<'a> {
    View(ArrayViewD<'a, f32>),
    Owned(ArrayD<f32>),
    Ids(Vec<i64>),
}

impl<'a> Value<'a> {
    pub fn floats(&self) -> Result<ArrayViewD<'_, f32>> {
        match self {
            Value::View(v) => Ok(v.view()),
            Value::Owned(a) => Ok(a.view()),
            Value::Ids(_) => Err(EmbeddingError::argument(
                "value",
                "expected a float tensor, found ids",
            )),
        }
    }

    pub fn ids(&self) -> Result<&[i64]> {
        match self {
            Value::Ids(ids) => Ok(ids),
            _ => Err(EmbeddingError::argument(
                "value",
                "expected ids, found a float tensor",
            )),
        }
    }

    pub fn into_owned(self) -> Result<ArrayD<f32>> {
        match self {
            Value::View(v) => Ok(v.to_owned()),
            Value::Owned(a) => Ok(a),
            Value::Ids(_) => Err(EmbeddingError::argument(
                "value",
                "expected a float tensor, found ids",
            )),
        }
    }

    pub fn is_borrowed(&self) -> bool {
        matches!(self, Value::View(_))
    }
}

#[derive(Clone, Debug, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, op: Op, inputs: Vec<NodeId>) -> NodeId {
        assert_eq!(
            inputs.len(),
            op.arity(),
            "{} takes {} inputs",
            op.name(),
            op.arity()
        );
        assert!(
            inputs.iter().all(|&id| id < self.nodes.len()),
            "{} refers to a node that does not exist yet",
            op.name()
        );
        let id = self.nodes.len();
        self.nodes.push(Node { op, inputs });
        id
    }

    pub fn table_node(&mut self) -> NodeId {
        self.add_node(Op::Table, vec![])
    }

    pub fn ids_node(&mut self) -> NodeId {
        self.add_node(Op::Ids, vec![])
    }

    /// Index of the last node reading each node's value, if any.
    pub fn last_uses(&self) -> Vec<Option<NodeId>> {
        let mut last = vec![None; self.nodes.len()];
        for (node_id, node) in self.nodes.iter().enumerate() {
            for &input in &node.inputs {
                last[input] = Some(node_id);
            }
        }
        last
    }

    pub fn count_ops(&self, name: &str) -> usize {
        self.nodes.iter().filter(|n| n.op.name() == name).count()
    }
}
