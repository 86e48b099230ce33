//! Tiling and fusion: build a loop nest around a fusion cluster.
//!
//! Given a tileable op, a per-dimension tile descriptor, and the fusability
//! predicate, `tile_and_fuse` creates a `Loop` op covering the op's iteration
//! space and clones the op's backward fusion cluster into the loop body in
//! tile-local form. External inputs of the cluster become loop operands,
//! visible inside the body as `TileArg` ops.
//!
//! Nothing pre-existing is modified here: the cluster originals stay in
//! place, and the caller decides (through its transaction) when the loop
//! replaces them.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use tessera_core::{
    FuncGraph, LoopInfo, LoopKind, LoopRange, OpId, OpKind, OpNode, Shape,
};

use crate::error::{RewriteError, RewriteResult};
use crate::fusion::{collect_cluster, FuseFilter};
use crate::rewrite::RewriteTx;

/// Tile-size policy for CPU map lowering: tile every dimension by 1 except
/// the innermost, which receives the configured size. Rank 0 yields an empty
/// descriptor.
pub fn inner_dim_tile_sizes(rank: usize, inner_dim_tile_size: NonZeroUsize) -> Vec<usize> {
    let mut sizes = vec![1; rank];
    if let Some(last) = sizes.last_mut() {
        *last = inner_dim_tile_size.get();
    }
    sizes
}

/// A loop nest built by `tile_and_fuse`, plus the provenance the peeler
/// needs to re-emit the same cluster over other iteration ranges.
#[derive(Debug)]
pub struct TilingResult {
    /// The generated loop op.
    pub loop_op: OpId,
    /// The fusion cluster that was cloned into the loop body, producers
    /// first, root last. Still present in the graph.
    pub cluster: Vec<OpId>,
    /// Operands of the cluster that come from outside it, in first-use
    /// order. These are the loop's inputs.
    pub inputs: Vec<OpId>,
    /// The cluster root whose iteration space the loop covers.
    pub root: OpId,
}

/// Tile `op` with the given per-dimension tile sizes and fuse its backward
/// cluster into the generated loop body.
///
/// Fails with a tiling error when the op kind or descriptor is unsupported;
/// in that case the graph has not been touched by this call.
pub fn tile_and_fuse(
    graph: &mut FuncGraph,
    tx: &mut RewriteTx,
    op: OpId,
    tile_sizes: &[usize],
    filter: FuseFilter,
) -> RewriteResult<TilingResult> {
    let node = graph.op(op)?;

    if !is_tileable(&node.kind) {
        return Err(RewriteError::tiling_failure(format!(
            "op kind {:?} does not support tiling",
            node.kind
        )));
    }

    let rank = node.shape.rank();
    if rank == 0 {
        return Err(RewriteError::tiling_failure("zero-rank op has no iteration space"));
    }
    if tile_sizes.len() != rank {
        return Err(RewriteError::tiling_failure(format!(
            "tile descriptor has {} entries for a rank-{} op",
            tile_sizes.len(),
            rank
        )));
    }
    if tile_sizes.iter().any(|&t| t == 0) {
        return Err(RewriteError::tiling_failure("tile sizes must be positive"));
    }

    let ranges: Vec<LoopRange> = node
        .shape
        .dims()
        .iter()
        .zip(tile_sizes)
        .map(|(&extent, &step)| LoopRange { start: 0, end: extent, step })
        .collect();

    let cluster = collect_cluster(graph, op, filter);
    let inputs = external_inputs(graph, &cluster)?;

    let loop_op = emit_tiled_loop(
        graph,
        tx,
        &cluster,
        &inputs,
        op,
        ranges,
        LoopKind::Main,
        None,
        op,
    )?;

    Ok(TilingResult { loop_op, cluster, inputs, root: op })
}

/// Op kinds the tiling utility can build a loop nest for.
pub(crate) fn is_tileable(kind: &OpKind) -> bool {
    matches!(kind, OpKind::Map(_) | OpKind::Fill(_) | OpKind::Broadcast)
}

/// Operands referenced by the cluster but produced outside it, deduplicated
/// in first-use order.
fn external_inputs(graph: &FuncGraph, cluster: &[OpId]) -> RewriteResult<Vec<OpId>> {
    let mut inputs = Vec::new();
    for &member in cluster {
        for &operand in &graph.op(member)?.operands {
            if !cluster.contains(&operand) && !inputs.contains(&operand) {
                inputs.push(operand);
            }
        }
    }
    Ok(inputs)
}

/// Shape of one tile of an op inside a loop nest with the given steps.
///
/// Dimensions align to loop dimensions from the right (the broadcast
/// convention); unit dimensions stay unit, and every other dimension shrinks
/// to its loop step, capped at the original extent.
pub(crate) fn tile_local_shape(shape: &Shape, steps: &[usize]) -> Shape {
    let r = steps.len();
    let m = shape.rank();

    let dims = shape
        .dims()
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            if d == 1 {
                return 1;
            }
            let loop_dim = if m <= r {
                Some(i + (r - m))
            } else {
                i.checked_sub(m - r)
            };
            match loop_dim {
                Some(j) if j < r => d.min(steps[j]),
                _ => d,
            }
        })
        .collect();
    Shape::new(dims)
}

/// Build one `Loop` op over `ranges`, with the cluster cloned into a fresh
/// body region in tile-local form.
///
/// The loop is inserted right after `anchor` in `anchor`'s region. `init`
/// chains peeled loops: when present it becomes the loop's trailing operand.
#[allow(clippy::too_many_arguments)]
pub(crate) fn emit_tiled_loop(
    graph: &mut FuncGraph,
    tx: &mut RewriteTx,
    cluster: &[OpId],
    inputs: &[OpId],
    root: OpId,
    ranges: Vec<LoopRange>,
    kind: LoopKind,
    init: Option<OpId>,
    anchor: OpId,
) -> RewriteResult<OpId> {
    let steps: Vec<usize> = ranges.iter().map(|r| r.step).collect();
    let body = tx.create_region(graph, None);

    // Tile-local views of the loop inputs.
    let mut tile_args = HashMap::new();
    for (index, &input) in inputs.iter().enumerate() {
        let input_node = graph.op(input)?;
        let arg = OpNode::new(
            OpKind::TileArg { input: index },
            vec![],
            tile_local_shape(&input_node.shape, &steps),
            input_node.dtype,
        );
        let arg_id = tx.create_op(graph, body, arg)?;
        tile_args.insert(input, arg_id);
    }

    // Clone the cluster, producers first, rewriting operands to the
    // tile-local copies.
    let mut clones: HashMap<OpId, OpId> = HashMap::new();
    for &member in cluster {
        let member_node = graph.op(member)?;
        let operands: Vec<OpId> = member_node
            .operands
            .iter()
            .map(|operand| {
                clones
                    .get(operand)
                    .or_else(|| tile_args.get(operand))
                    .copied()
                    .ok_or_else(|| {
                        tessera_core::Error::InvalidGraph(format!(
                            "cluster operand {:?} is neither a clone nor a loop input",
                            operand
                        ))
                    })
            })
            .collect::<Result<_, _>>()?;

        let clone = OpNode::new(
            member_node.kind.clone(),
            operands,
            tile_local_shape(&member_node.shape, &steps),
            member_node.dtype,
        )
        .with_name(member_node.name.clone());
        let clone_id = tx.create_op(graph, body, clone)?;
        clones.insert(member, clone_id);
    }

    let body_result = clones.get(&root).copied();

    let root_node = graph.op(root)?;
    let shape = root_node.shape.clone();
    let dtype = root_node.dtype;

    let mut operands: Vec<OpId> = inputs.to_vec();
    if let Some(init) = init {
        operands.push(init);
    }

    let info = LoopInfo {
        ranges,
        kind,
        perfectly_tiled: false,
        body,
        body_result,
        num_inputs: inputs.len(),
    };
    let loop_op = tx.create_op_after(
        graph,
        anchor,
        OpNode::new(OpKind::Loop(info), operands, shape, dtype),
    )?;
    graph.set_region_parent(body, loop_op)?;

    Ok(loop_op)
}
