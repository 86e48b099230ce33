//! Tile-and-fuse pass for elementwise map ops on CPU.
//!
//! For every map op in the function body, the pass selects the deepest
//! single-use fusion root downstream of it, tiles the root's iteration space
//! (tile size 1 everywhere except the innermost dimension), fuses the root's
//! backward cluster into the loop body, peels ragged dimensions into
//! remainder loops, and scalarizes the remainder bodies. Each match is one
//! atomic rewrite: on any failure the graph is left exactly as it was.

use std::num::NonZeroUsize;

use tessera_core::{FuncGraph, OpId, Pass, Result};

use crate::error::RewriteError;
use crate::fusion::{find_fusion_root, is_fusable};
use crate::peeling::peel_loop_nest;
use crate::rewrite::{rewrite_to_fixpoint, LabelSet, RewriteTx, DEFAULT_REWRITE_BUDGET};
use crate::scalarize::scalarize_remainders;
use crate::tiling::{inner_dim_tile_sizes, tile_and_fuse};

/// Pass that rewrites map ops into tiled, peeled, and scalarized loop nests.
pub struct TileAndFuseMapsPass {
    /// Tile size of the innermost loop dimension; all outer dimensions are
    /// tiled by 1.
    inner_dim_tile_size: NonZeroUsize,

    /// Budget for rule applications before the pass gives up on reaching a
    /// fixpoint.
    budget: usize,
}

impl TileAndFuseMapsPass {
    /// Create the pass with the configured innermost-dimension tile size.
    pub fn new(inner_dim_tile_size: NonZeroUsize) -> Self {
        Self { inner_dim_tile_size, budget: DEFAULT_REWRITE_BUDGET }
    }

    /// Override the rewrite budget (mainly for tests).
    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    /// Try to rewrite one candidate map op.
    fn match_and_rewrite(
        &self,
        graph: &mut FuncGraph,
        op: OpId,
        labels: &mut LabelSet,
    ) -> std::result::Result<(), RewriteError> {
        if labels.contains(op) {
            return Err(RewriteError::match_failure("already processed"));
        }

        // A map sitting inside a generated loop body has already been tiled
        // by this pass (or a prior tiling pass).
        if graph.parent_op(op)?.is_some() {
            return Err(RewriteError::match_failure(
                "already nested inside a generated loop",
            ));
        }

        // Look for a deeper map this op can be fused into.
        let root = find_fusion_root(graph, op, &is_fusable);
        if labels.contains(root) {
            return Err(RewriteError::match_failure("fusion root already processed"));
        }

        let rank = graph.op(root)?.loop_rank();
        if rank == 0 {
            // Scalar map: an empty tile descriptor, nothing to tile. Mark it
            // so the fixpoint loop stops offering it.
            labels.mark(root);
            return Err(RewriteError::match_failure("zero-rank map, tiling is a no-op"));
        }

        let tile_sizes = inner_dim_tile_sizes(rank, self.inner_dim_tile_size);

        let mut tx = RewriteTx::new();
        match Self::rewrite_cluster(graph, &mut tx, root, &tile_sizes) {
            Ok(()) => {
                tx.commit(graph)?;
                labels.mark(root);
                tracing::debug!(root = ?root, rank, "tiled and fused map cluster");
                Ok(())
            }
            Err(err) => {
                tx.abort(graph)?;
                Err(err)
            }
        }
    }

    /// The tile → peel → scalarize pipeline for one fusion root. Stages the
    /// visible edits on the transaction; the caller commits or aborts.
    fn rewrite_cluster(
        graph: &mut FuncGraph,
        tx: &mut RewriteTx,
        root: OpId,
        tile_sizes: &[usize],
    ) -> std::result::Result<(), RewriteError> {
        let tiling = tile_and_fuse(graph, tx, root, tile_sizes, &is_fusable)?;
        let peeled = peel_loop_nest(graph, tx, &tiling)?;
        scalarize_remainders(graph, tx, &peeled, &is_fusable)?;

        tx.stage_replace_uses(root, peeled.result);
        // Erase the fused originals, consumers before producers.
        for &member in tiling.cluster.iter().rev() {
            tx.stage_erase(member);
        }
        Ok(())
    }
}

impl Pass for TileAndFuseMapsPass {
    fn name(&self) -> &str {
        "tile_and_fuse_maps"
    }

    #[tracing::instrument(skip_all, fields(tile_size = self.inner_dim_tile_size.get()))]
    fn run(&self, graph: &mut FuncGraph) -> Result<bool> {
        let mut labels = LabelSet::new();

        let applied = rewrite_to_fixpoint(graph, self.budget, |graph, op| {
            self.match_and_rewrite(graph, op, &mut labels)
        })?;

        // The labels are pass-local; strip them all before returning so no
        // trace of the marking mechanism survives the pass.
        labels.clear();

        tracing::debug!(applied, "tile_and_fuse_maps finished");
        Ok(applied > 0)
    }
}
