use hostembed_core::{
    evaluate, execute_forward,
    kernels::GraphInputs,
    lookup::{device_node, LookupMode, LookupNode},
    lookup, split, DirectGather, EmbeddingError, EmbeddingTable, IndexBatch, Initializer,
    LookupOptions, Op, SerializedGather,
};

/// Table whose element [r, c] is `r * 10 + c`.
fn numbered_table(rows: usize, width: usize) -> EmbeddingTable {
    let values = (0..rows)
        .flat_map(|r| (0..width).map(move |c| (r * 10 + c) as f32))
        .collect();
    EmbeddingTable::new("numbered", &[rows, width], "f32", &Initializer::Values { values }).unwrap()
}

#[test]
fn test_concrete_serialized_scenario() {
    // R=8, E=2, f=2, row i filled with i
    let values = (0..8).flat_map(|r| vec![r as f32; 2]).collect();
    let table = EmbeddingTable::new("t", &[8, 2], "f32", &Initializer::Values { values }).unwrap();
    let ids = IndexBatch::flat(vec![0, 5, 7]);

    let out = lookup(&table, &ids, &LookupOptions::serialized(2)).unwrap();

    assert_eq!(out.shape(), &[3, 2]);
    assert_eq!(out.to_vec(), vec![0.0, 0.0, 5.0, 5.0, 7.0, 7.0]);
}

#[test]
fn test_serialized_matches_direct_for_every_divisor() {
    let table = numbered_table(12, 3);
    let ids = IndexBatch::flat(vec![11, 0, 3, 3, 7, 6, 5, 11, 1]);
    let direct = lookup(&table, &ids, &LookupOptions::default()).unwrap();

    for factor in [1, 2, 3, 4, 6, 12] {
        let serialized = lookup(&table, &ids, &LookupOptions::serialized(factor)).unwrap();
        assert_eq!(serialized, direct, "factor {} disagrees with direct gather", factor);
    }
}

#[test]
fn test_output_shape_is_ids_shape_plus_width() {
    let table = numbered_table(8, 4);
    let ids = IndexBatch::new(&[2, 3], vec![0, 1, 2, 5, 6, 7]).unwrap();

    let out = lookup(&table, &ids, &LookupOptions::serialized(4)).unwrap();

    assert_eq!(out.shape(), &[2, 3, 4]);
    // [1, 0] is id 5
    assert_eq!(out.data[[1, 0, 0]], 50.0);
    assert_eq!(out.data[[1, 0, 3]], 53.0);
}

#[test]
fn test_repeated_ids_return_repeated_rows() {
    let table = numbered_table(4, 2);
    let ids = IndexBatch::flat(vec![2, 2, 2]);

    let out = lookup(&table, &ids, &LookupOptions::serialized(2)).unwrap();

    assert_eq!(out.to_vec(), vec![20.0, 21.0, 20.0, 21.0, 20.0, 21.0]);
}

#[test]
fn test_indivisible_factor_is_rejected() {
    let table = numbered_table(10, 2);
    let ids = IndexBatch::flat(vec![0]);

    let err = lookup(&table, &ids, &LookupOptions::serialized(3)).unwrap_err();

    assert_eq!(err, EmbeddingError::Divisibility { rows: 10, factor: 3 });
    let diag = err.diagnostic();
    assert_eq!(diag.code, "E_DIVISIBILITY");
    assert_eq!(diag.field("rows"), Some("10"));
    assert_eq!(diag.field("serialization_factor"), Some("3"));
}

#[test]
fn test_zero_factor_is_an_argument_error() {
    let table = numbered_table(4, 2);
    let err = lookup(&table, &IndexBatch::flat(vec![0]), &LookupOptions::serialized(0))
        .unwrap_err();
    assert_eq!(err.code(), "E_ARGUMENT");
}

#[test]
fn test_clipping_maps_out_of_range_ids_to_bounds() {
    let table = numbered_table(8, 2);
    let options = LookupOptions::serialized(2);
    let clipped = lookup(&table, &IndexBatch::flat(vec![8, -1, 100]), &options).unwrap();
    let bounds = lookup(&table, &IndexBatch::flat(vec![7, 0, 7]), &options).unwrap();
    assert_eq!(clipped, bounds);
}

#[test]
fn test_clipping_is_idempotent() {
    let ids = IndexBatch::flat(vec![-5, 0, 3, 8, 42]);
    let once = ids.resolve(8, hostembed_core::IndexPolicy::Clip).unwrap();
    let again = IndexBatch::flat(once.iter().map(|&id| id as i64).collect())
        .resolve(8, hostembed_core::IndexPolicy::Clip)
        .unwrap();
    assert_eq!(once, vec![0, 0, 3, 7, 7]);
    assert_eq!(once, again);
}

#[test]
fn test_out_of_range_without_clipping_is_rejected() {
    let table = numbered_table(8, 2);
    let options = LookupOptions {
        serialization_factor: 2,
        clip_indices: false,
    };

    let err = lookup(&table, &IndexBatch::flat(vec![1, 8]), &options).unwrap_err();

    assert_eq!(err, EmbeddingError::IndexOutOfRange { index: 8, rows: 8 });
    assert_eq!(err.code(), "E_INDEX_OUT_OF_RANGE");
}

#[test]
fn test_device_node_picks_mode_from_factor() {
    let table = numbered_table(8, 2);
    assert_eq!(device_node(table.view(), 1).unwrap().mode(), LookupMode::Direct);
    assert_eq!(
        device_node(table.view(), 4).unwrap().mode(),
        LookupMode::Serialized { factor: 4 }
    );
}

#[test]
fn test_serialized_lowering_has_one_gather_and_mask_per_shard() {
    let lowered = SerializedGather::lower(8, 4, &[3, 2]).unwrap();
    let graph = &lowered.graph;

    assert_eq!(graph.count_ops("slice_rows"), 4);
    assert_eq!(graph.count_ops("offset_ids"), 4);
    assert_eq!(graph.count_ops("gather"), 4);
    assert_eq!(graph.count_ops("mask_range"), 4);
    assert_eq!(graph.count_ops("add"), 3);
    assert_eq!(graph.count_ops("reshape"), 1);

    let direct = DirectGather::lower(&[3, 2]);
    assert_eq!(direct.graph.count_ops("gather"), 1);
    assert_eq!(direct.graph.count_ops("slice_rows"), 0);
}

#[test]
fn test_shards_are_borrowed_views_of_the_table() {
    let table = numbered_table(8, 2);
    let ids = [1i64, 6];
    let lowered = SerializedGather::lower(8, 2, &[2, 2]).unwrap();
    let inputs = GraphInputs {
        table: table.view(),
        ids: &ids,
    };

    let activations = execute_forward(&lowered.graph, &inputs).unwrap();

    for (node, value) in lowered.graph.nodes.iter().zip(&activations) {
        if node.op.name() == "slice_rows" {
            assert!(value.is_borrowed(), "shard was copied");
            assert_eq!(value.floats().unwrap().shape(), &[4, 2]);
        }
    }
}

#[test]
fn test_streaming_evaluation_matches_full_execution() {
    let table = numbered_table(12, 2);
    let ids = [0i64, 11, 4, 4, 9];
    let lowered = SerializedGather::lower(12, 3, &[5, 2]).unwrap();
    let inputs = GraphInputs {
        table: table.view(),
        ids: &ids,
    };

    let all = execute_forward(&lowered.graph, &inputs).unwrap();
    let streamed = evaluate(&lowered.graph, &inputs, lowered.output).unwrap();

    assert_eq!(
        all[lowered.output].floats().unwrap(),
        streamed.floats().unwrap()
    );
}

#[test]
fn test_lowering_slices_match_partition_shards() {
    let table = numbered_table(12, 2);
    let lowered = SerializedGather::lower(12, 4, &[1, 2]).unwrap();

    let slices: Vec<(usize, usize)> = lowered
        .graph
        .nodes
        .iter()
        .filter_map(|node| match node.op {
            Op::SliceRows { start, len } => Some((start, start + len)),
            _ => None,
        })
        .collect();
    let masks: Vec<(i64, i64)> = lowered
        .graph
        .nodes
        .iter()
        .filter_map(|node| match node.op {
            Op::MaskRange { min, max } => Some((min, max)),
            _ => None,
        })
        .collect();
    let shards: Vec<(usize, usize)> = split(table.view(), 4)
        .unwrap()
        .iter()
        .map(|shard| (shard.min_row, shard.max_row))
        .collect();

    assert_eq!(shards, vec![(0, 3), (3, 6), (6, 9), (9, 12)]);
    assert_eq!(slices, shards);
    let mask_bounds: Vec<(usize, usize)> = masks
        .iter()
        .map(|&(min, max)| (min as usize, max as usize))
        .collect();
    assert_eq!(mask_bounds, shards);
}
