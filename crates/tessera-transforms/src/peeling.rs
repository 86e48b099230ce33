//! Loop peeling: split a tiled loop nest into a perfectly-tiled main loop
//! and per-dimension remainder loops.
//!
//! For a loop over extents `N_d` with steps `t_d`, let `M_d = floor(N_d /
//! t_d) * t_d`. The main loop covers `[0, M_d)` in every dimension and is
//! marked perfectly tiled. For each ragged dimension `d` (where `M_d < N_d`)
//! one remainder loop covers
//!
//! ```text
//!   [0, M_e)   for e < d      (the already-peeled portion)
//!   [M_d, N_d) for dimension d (the tail, one partial tile)
//!   [0, N_e)   for e > d      (the full extent)
//! ```
//!
//! These regions are pairwise disjoint and their union is exactly the
//! original iteration domain, so every element is visited exactly once.
//! Remainder loops chain through init operands; the last loop in the chain
//! carries the complete result.

use tessera_core::{FuncGraph, LoopKind, LoopRange, OpId, Result};

use crate::error::RewriteResult;
use crate::rewrite::RewriteTx;
use crate::tiling::{emit_tiled_loop, TilingResult};

/// The loops produced by peeling one tiled loop nest.
#[derive(Debug)]
pub struct PeeledLoops {
    /// The perfectly-tiled main loop.
    pub main: OpId,
    /// One remainder loop per ragged dimension, in dimension order.
    pub remainders: Vec<OpId>,
    /// The op carrying the complete result: the last remainder loop, or the
    /// main loop when nothing was peeled.
    pub result: OpId,
}

/// Peel every ragged dimension of the loop in `tiling`.
///
/// The loop itself becomes the main loop (its ranges are clipped to full
/// tiles and it is marked perfectly tiled); remainder loops are emitted
/// after it from the same fusion cluster.
pub fn peel_loop_nest(
    graph: &mut FuncGraph,
    tx: &mut RewriteTx,
    tiling: &TilingResult,
) -> RewriteResult<PeeledLoops> {
    let ranges = loop_ranges(graph, tiling.loop_op)?;

    let main_ends: Vec<usize> = ranges
        .iter()
        .map(|r| r.start + ((r.end - r.start) / r.step) * r.step)
        .collect();

    // Clip the main loop to its perfectly-tiled portion.
    {
        let node = graph.op_mut(tiling.loop_op)?;
        let info = node.as_loop_mut().ok_or_else(|| {
            tessera_core::Error::InvalidGraph(format!("op {:?} is not a loop", tiling.loop_op))
        })?;
        for (range, &end) in info.ranges.iter_mut().zip(&main_ends) {
            range.end = end;
        }
        info.perfectly_tiled = true;
        info.kind = LoopKind::Main;
    }

    let mut remainders = Vec::new();
    let mut prev = tiling.loop_op;

    for (dim, range) in ranges.iter().enumerate() {
        if main_ends[dim] == range.end {
            continue;
        }

        let remainder_ranges: Vec<LoopRange> = ranges
            .iter()
            .enumerate()
            .map(|(e, r)| {
                if e < dim {
                    LoopRange { start: r.start, end: main_ends[e], step: r.step }
                } else if e == dim {
                    let tail = r.end - main_ends[e];
                    LoopRange { start: main_ends[e], end: r.end, step: tail }
                } else {
                    *r
                }
            })
            .collect();

        let remainder = emit_tiled_loop(
            graph,
            tx,
            &tiling.cluster,
            &tiling.inputs,
            tiling.root,
            remainder_ranges,
            LoopKind::Remainder { dim },
            Some(prev),
            prev,
        )?;
        remainders.push(remainder);
        prev = remainder;
    }

    tracing::trace!(
        loop_op = ?tiling.loop_op,
        num_remainders = remainders.len(),
        "peeled loop nest"
    );

    Ok(PeeledLoops { main: tiling.loop_op, remainders, result: prev })
}

fn loop_ranges(graph: &FuncGraph, loop_op: OpId) -> Result<Vec<LoopRange>> {
    let node = graph.op(loop_op)?;
    let info = node.as_loop().ok_or_else(|| {
        tessera_core::Error::InvalidGraph(format!("op {:?} is not a loop", loop_op))
    })?;
    Ok(info.ranges.clone())
}
