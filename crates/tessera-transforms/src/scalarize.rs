//! Remainder scalarization: re-tile everything inside remainder regions to
//! single-element granularity.
//!
//! Remainder loops cover partial tiles, so their bodies cannot take the
//! vectorized code path. Re-applying the tiler with an all-ones descriptor
//! turns each remainder body into a nest of unit-step loops whose innermost
//! ops touch one element at a time; lowering needs no vector-width
//! assumptions for them. The main loop is never touched here.

use tessera_core::{FuncGraph, OpId, RegionId};

use crate::error::RewriteResult;
use crate::fusion::FuseFilter;
use crate::peeling::PeeledLoops;
use crate::rewrite::RewriteTx;
use crate::tiling::{is_tileable, tile_and_fuse};

/// Scalarize the bodies of all remainder loops in `peeled`.
///
/// A tiling failure on a remainder op propagates to the caller, which aborts
/// the whole match.
pub fn scalarize_remainders(
    graph: &mut FuncGraph,
    tx: &mut RewriteTx,
    peeled: &PeeledLoops,
    filter: FuseFilter,
) -> RewriteResult<()> {
    for &remainder in &peeled.remainders {
        let body = graph
            .op(remainder)?
            .as_loop()
            .ok_or_else(|| {
                tessera_core::Error::InvalidGraph(format!("op {:?} is not a loop", remainder))
            })?
            .body;
        scalarize_region(graph, tx, body, remainder, filter)?;
    }
    Ok(())
}

/// Re-tile ops in `region` with all-ones descriptors until none remains that
/// covers more than one element.
fn scalarize_region(
    graph: &mut FuncGraph,
    tx: &mut RewriteTx,
    region: RegionId,
    owner: OpId,
    filter: FuseFilter,
) -> RewriteResult<()> {
    loop {
        // The deepest scalarizable op first, so a whole chain collapses into
        // one unit-step nest instead of one nest per chain member.
        let candidate = graph
            .region_ops(region)?
            .iter()
            .rev()
            .copied()
            .find(|&op| is_scalarizable(graph, op));

        let Some(op) = candidate else { break };

        let rank = graph.op(op)?.shape.rank();
        let ones = vec![1; rank];
        let tiling = tile_and_fuse(graph, tx, op, &ones, filter)?;

        // Everything here is transaction-local, so the rewiring is applied
        // immediately rather than staged.
        graph.replace_all_uses(op, tiling.loop_op)?;
        let owner_node = graph.op_mut(owner)?;
        if let Some(info) = owner_node.as_loop_mut() {
            if info.body_result == Some(op) {
                info.body_result = Some(tiling.loop_op);
            }
        }
        for &member in tiling.cluster.iter().rev() {
            tx.remove_created_op(graph, member)?;
        }

        tracing::trace!(op = ?op, nest = ?tiling.loop_op, "scalarized remainder op");
    }
    Ok(())
}

/// True for ops that still need scalarizing: tileable, with an iteration
/// space larger than a single element.
fn is_scalarizable(graph: &FuncGraph, op: OpId) -> bool {
    let Ok(node) = graph.op(op) else {
        return false;
    };
    is_tileable(&node.kind) && node.shape.rank() > 0 && !node.shape.is_all_unit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::is_fusable;
    use crate::peeling::peel_loop_nest;
    use crate::tiling::tile_and_fuse;
    use tessera_core::{DataType, GraphBuilder, LoopRange, MapKind, OpKind};

    #[test]
    fn test_remainder_body_becomes_unit_steps() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![1003], DataType::F32).unwrap();
        let y = b.input("y", vec![1003], DataType::F32).unwrap();
        let add = b.map(MapKind::Add, &[x, y]).unwrap();
        let relu = b.map(MapKind::Relu, &[add]).unwrap();
        b.output(relu).unwrap();
        let mut graph = b.finish();

        let mut tx = RewriteTx::new();
        let tiling = tile_and_fuse(&mut graph, &mut tx, relu, &[8], &is_fusable).unwrap();
        let peeled = peel_loop_nest(&mut graph, &mut tx, &tiling).unwrap();
        scalarize_remainders(&mut graph, &mut tx, &peeled, &is_fusable).unwrap();

        let rem = graph.op(peeled.remainders[0]).unwrap().as_loop().unwrap().clone();
        let body_ops = graph.region_ops(rem.body).unwrap().to_vec();

        // Two tile args plus one nested unit-step loop; the cloned add/relu
        // were folded into the nest.
        assert_eq!(body_ops.len(), 3);
        let nested = rem.body_result.unwrap();
        let nested_node = graph.op(nested).unwrap();
        let nested_info = nested_node.as_loop().unwrap();
        assert_eq!(nested_info.ranges, vec![LoopRange { start: 0, end: 3, step: 1 }]);
        assert_eq!(nested_info.ranges[0].trip_count(), 3);

        // Every op inside the nested body touches a single element.
        for &op in graph.region_ops(nested_info.body).unwrap() {
            assert!(graph.op(op).unwrap().shape.is_all_unit());
        }

        // Nothing left in the remainder body still needs scalarizing.
        for &op in &body_ops {
            assert!(!is_scalarizable(&graph, op));
        }
    }

    #[test]
    fn test_main_loop_is_untouched() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![1003], DataType::F32).unwrap();
        let neg = b.map(MapKind::Neg, &[x]).unwrap();
        b.output(neg).unwrap();
        let mut graph = b.finish();

        let mut tx = RewriteTx::new();
        let tiling = tile_and_fuse(&mut graph, &mut tx, neg, &[8], &is_fusable).unwrap();
        let peeled = peel_loop_nest(&mut graph, &mut tx, &tiling).unwrap();

        let main_body = graph.op(peeled.main).unwrap().as_loop().unwrap().body;
        let before = graph.region_ops(main_body).unwrap().to_vec();

        scalarize_remainders(&mut graph, &mut tx, &peeled, &is_fusable).unwrap();

        let after = graph.region_ops(main_body).unwrap().to_vec();
        assert_eq!(before, after);
        // Main body ops keep their full 8-element tile shapes.
        for &op in &after {
            if !matches!(graph.op(op).unwrap().kind, OpKind::TileArg { .. }) {
                assert_eq!(graph.op(op).unwrap().shape.dims(), &[8]);
            }
        }
    }

    #[test]
    fn test_scalarize_divisible_case_is_noop() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![64], DataType::F32).unwrap();
        let neg = b.map(MapKind::Neg, &[x]).unwrap();
        b.output(neg).unwrap();
        let mut graph = b.finish();

        let mut tx = RewriteTx::new();
        let tiling = tile_and_fuse(&mut graph, &mut tx, neg, &[8], &is_fusable).unwrap();
        let peeled = peel_loop_nest(&mut graph, &mut tx, &tiling).unwrap();
        let count_before = graph.op_count();

        scalarize_remainders(&mut graph, &mut tx, &peeled, &is_fusable).unwrap();
        assert_eq!(graph.op_count(), count_before);
    }
}
