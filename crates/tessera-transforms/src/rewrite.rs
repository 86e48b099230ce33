//! Rewrite transactions and the greedy fixpoint driver.
//!
//! Every match-and-rewrite attempt runs inside a [`RewriteTx`]. Ops and
//! regions created during the attempt are unreachable from the committed
//! graph (nothing outside the transaction references them), so they can be
//! materialized eagerly; the two externally visible edits — rewiring the
//! rewritten op's uses and erasing the replaced cluster — are staged and
//! applied only by [`RewriteTx::commit`]. Aborting deletes everything the
//! transaction created, leaving the graph exactly as it was.

use std::collections::HashSet;

use tessera_core::{Error, FuncGraph, OpId, OpKind, OpNode, RegionId, Result};

use crate::error::RewriteError;

/// Default budget for rule applications within one pass invocation.
///
/// Hitting the budget means the idempotency guard failed to prevent
/// reprocessing and the pass is looping; that is reported as a pass failure,
/// never silently truncated.
pub const DEFAULT_REWRITE_BUDGET: usize = 4096;

// ──────────────────────────────── RewriteTx ──────────────────────────────

/// One in-flight rewrite of a single fusion-root match.
#[derive(Debug, Default)]
pub struct RewriteTx {
    created_ops: Vec<OpId>,
    created_regions: Vec<RegionId>,
    staged_replacements: Vec<(OpId, OpId)>,
    staged_erasures: Vec<OpId>,
}

impl RewriteTx {
    /// Start an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an op at the end of a region, recording it for rollback.
    pub fn create_op(
        &mut self,
        graph: &mut FuncGraph,
        region: RegionId,
        node: OpNode,
    ) -> Result<OpId> {
        let id = graph.add_op(region, node)?;
        self.created_ops.push(id);
        Ok(id)
    }

    /// Create an op right after `anchor` in `anchor`'s region, recording it
    /// for rollback.
    pub fn create_op_after(
        &mut self,
        graph: &mut FuncGraph,
        anchor: OpId,
        node: OpNode,
    ) -> Result<OpId> {
        let id = graph.insert_op_after(anchor, node)?;
        self.created_ops.push(id);
        Ok(id)
    }

    /// Create a region, recording it for rollback.
    pub fn create_region(&mut self, graph: &mut FuncGraph, parent: Option<OpId>) -> RegionId {
        let id = graph.add_region(parent);
        self.created_regions.push(id);
        id
    }

    /// Remove a transaction-created op immediately (used when a later
    /// pipeline stage replaces ops an earlier stage created). The op stays
    /// recorded; rollback skips ops that are already gone.
    pub fn remove_created_op(&mut self, graph: &mut FuncGraph, op: OpId) -> Result<()> {
        graph.remove_op(op)
    }

    /// Stage "all uses of `old` become uses of `new`" for commit time.
    pub fn stage_replace_uses(&mut self, old: OpId, new: OpId) {
        self.staged_replacements.push((old, new));
    }

    /// Stage the erasure of a pre-existing op for commit time. Erasures are
    /// applied in the order staged; callers stage consumers before their
    /// producers.
    pub fn stage_erase(&mut self, op: OpId) {
        self.staged_erasures.push(op);
    }

    /// Apply the staged edits. After this the rewrite is visible.
    pub fn commit(self, graph: &mut FuncGraph) -> Result<()> {
        for (old, new) in self.staged_replacements {
            graph.replace_all_uses(old, new)?;
        }
        for op in self.staged_erasures {
            graph.remove_op(op)?;
        }
        Ok(())
    }

    /// Discard the transaction: delete every created op and region, in
    /// reverse creation order so consumers go before their producers.
    ///
    /// The staged (never applied) replacements and erasures are simply
    /// dropped. Teardown of transaction-local state cannot fail unless the
    /// graph was corrupted outside the transaction; that surfaces as an
    /// error to fail the pass.
    pub fn abort(self, graph: &mut FuncGraph) -> Result<()> {
        for &op in self.created_ops.iter().rev() {
            if graph.contains(op) {
                graph.remove_op(op)?;
            }
        }
        for &region in self.created_regions.iter().rev() {
            graph.remove_region(region)?;
        }
        Ok(())
    }
}

// ──────────────────────────────── Driver ─────────────────────────────────

/// Side set of op labels, local to one pass invocation.
///
/// The pass-scoped replacement for storing transient flags on the permanent
/// op type: fusion roots are marked processed here so the fixpoint loop does
/// not reprocess them, and the whole set is discarded before the pass
/// returns.
#[derive(Debug, Default)]
pub struct LabelSet(HashSet<OpId>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, op: OpId) {
        self.0.insert(op);
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.0.contains(&op)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Repeatedly offer every live map op to `rule` until a full sweep applies
/// nothing (fixpoint), then return how many rewrites were applied.
///
/// Match and tiling failures are logged and skipped; graph errors abort.
/// Exceeding `budget` applications is a pass failure: the rule kept matching
/// ops it had already rewritten.
pub fn rewrite_to_fixpoint<F>(graph: &mut FuncGraph, budget: usize, mut rule: F) -> Result<usize>
where
    F: FnMut(&mut FuncGraph, OpId) -> std::result::Result<(), RewriteError>,
{
    let mut applied = 0usize;

    loop {
        let candidates: Vec<OpId> = graph
            .ops()
            .filter(|(_, node)| node.is_map())
            .map(|(id, _)| id)
            .collect();

        let mut changed = false;
        for op in candidates {
            // A previous rewrite in this sweep may have erased the candidate.
            if !graph.contains(op) {
                continue;
            }

            match rule(graph, op) {
                Ok(()) => {
                    applied += 1;
                    changed = true;
                    if applied > budget {
                        return Err(Error::PassFailed(format!(
                            "rewrite budget of {} applications exhausted before fixpoint",
                            budget
                        )));
                    }
                }
                Err(RewriteError::Match(reason)) => {
                    tracing::trace!(op = ?op, %reason, "candidate did not match");
                }
                Err(RewriteError::Tiling(reason)) => {
                    tracing::debug!(op = ?op, %reason, "tiling declined, match abandoned");
                }
                Err(RewriteError::Graph(err)) => return Err(err),
            }
        }

        if !changed {
            break;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{DataType, GraphBuilder, MapKind, Shape};

    #[test]
    fn test_abort_restores_graph() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![8], DataType::F32).unwrap();
        let neg = b.map(MapKind::Neg, &[x]).unwrap();
        b.output(neg).unwrap();
        let mut graph = b.finish();

        let before = graph.op_count();
        let mut tx = RewriteTx::new();
        let region = tx.create_region(&mut graph, None);
        let arg = tx
            .create_op(
                &mut graph,
                region,
                OpNode::new(
                    OpKind::TileArg { input: 0 },
                    vec![],
                    Shape::new(vec![1]),
                    DataType::F32,
                ),
            )
            .unwrap();
        let _clone = tx
            .create_op(
                &mut graph,
                region,
                OpNode::new(
                    OpKind::Map(MapKind::Neg),
                    vec![arg],
                    Shape::new(vec![1]),
                    DataType::F32,
                ),
            )
            .unwrap();
        tx.stage_replace_uses(neg, x);
        tx.stage_erase(neg);

        tx.abort(&mut graph).unwrap();

        assert_eq!(graph.op_count(), before);
        assert!(graph.contains(neg));
        assert_eq!(graph.outputs, vec![neg]);
    }

    #[test]
    fn test_commit_applies_staged_edits() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![8], DataType::F32).unwrap();
        let neg = b.map(MapKind::Neg, &[x]).unwrap();
        b.output(neg).unwrap();
        let mut graph = b.finish();

        let mut tx = RewriteTx::new();
        let abs = tx
            .create_op_after(
                &mut graph,
                neg,
                OpNode::new(OpKind::Map(MapKind::Abs), vec![x], Shape::new(vec![8]), DataType::F32),
            )
            .unwrap();
        tx.stage_replace_uses(neg, abs);
        tx.stage_erase(neg);
        tx.commit(&mut graph).unwrap();

        assert!(!graph.contains(neg));
        assert_eq!(graph.outputs, vec![abs]);
    }

    #[test]
    fn test_driver_reaches_fixpoint() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![8], DataType::F32).unwrap();
        let neg = b.map(MapKind::Neg, &[x]).unwrap();
        b.output(neg).unwrap();
        let mut graph = b.finish();

        let mut labels = LabelSet::new();
        let applied = rewrite_to_fixpoint(&mut graph, 16, |_, op| {
            if labels.contains(op) {
                return Err(RewriteError::match_failure("already processed"));
            }
            labels.mark(op);
            Ok(())
        })
        .unwrap();

        assert_eq!(applied, 1);
    }

    #[test]
    fn test_driver_budget_exhaustion_is_fatal() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![8], DataType::F32).unwrap();
        let neg = b.map(MapKind::Neg, &[x]).unwrap();
        b.output(neg).unwrap();
        let mut graph = b.finish();

        // A rule that always claims success never reaches a fixpoint.
        let result = rewrite_to_fixpoint(&mut graph, 4, |_, _| Ok(()));
        assert!(matches!(result, Err(Error::PassFailed(_))));
    }
}
