//! Intermediate representation for one function body.
//!
//! The IR is a region-structured dataflow graph:
//! - **Ops** (`OpNode`) are computation steps (maps, broadcasts, fills,
//!   reshapes, reductions, generated loops).
//! - **Operands** are ordered references to other ops; every op produces
//!   exactly one result.
//! - **Regions** group ops into bodies. The function owns a root region, and
//!   every generated `Loop` op owns one body region. Operand references never
//!   cross region boundaries except for a loop's own operands, which live in
//!   the loop's enclosing region.
//!
//! Ops live in a `petgraph::StableGraph` arena so op ids stay valid while
//! passes add and remove ops around them. petgraph edges mirror the operand
//! lists (one edge per operand reference, weighted with the operand index)
//! and exist for use/user queries.

use crate::types::{DataType, Shape};
use crate::{Error, Result};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;

/// Type alias for op identifiers (backed by petgraph NodeIndex).
pub type OpId = NodeIndex;

/// Unique identifier for a region.
///
/// This is an index into `FuncGraph::regions` and remains valid across graph
/// mutations; removed regions leave a tombstone slot behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(usize);

impl RegionId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0
    }
}

// ──────────────────────────────── OpKind ─────────────────────────────────

/// Elementwise operator applied by a map op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Neg,
    Abs,
    Exp,
    Relu,
}

impl MapKind {
    /// Number of operands the operator consumes.
    pub fn arity(&self) -> usize {
        match self {
            MapKind::Add
            | MapKind::Sub
            | MapKind::Mul
            | MapKind::Div
            | MapKind::Min
            | MapKind::Max => 2,
            MapKind::Neg | MapKind::Abs | MapKind::Exp | MapKind::Relu => 1,
        }
    }
}

/// Half-open iteration range of one loop dimension, visited in steps of
/// `step` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRange {
    pub start: usize,
    pub end: usize,
    pub step: usize,
}

impl LoopRange {
    /// Number of tiles the range is visited in. The last tile may be partial
    /// when `end - start` is not divisible by `step`.
    pub fn trip_count(&self) -> usize {
        (self.end - self.start).div_ceil(self.step)
    }

    /// Number of iteration elements covered by the range.
    pub fn num_elements(&self) -> usize {
        self.end - self.start
    }

    /// True if every tile is full-sized.
    pub fn is_perfect(&self) -> bool {
        (self.end - self.start) % self.step == 0
    }
}

/// Which part of a peeled iteration domain a loop covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// The perfectly-tiled portion of the domain.
    Main,
    /// The leftover boundary elements of one dimension.
    Remainder { dim: usize },
}

/// Metadata of a generated tiled loop nest.
///
/// A loop's operands are its `num_inputs` external inputs, optionally
/// followed by the preceding loop in a peeled chain (the init operand). The
/// body region holds one `TileArg` per input followed by the fused cluster
/// in tile-local form; `body_result` names the op whose tiles assemble the
/// loop's result.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopInfo {
    /// Iteration range per dimension of the original iteration space.
    pub ranges: Vec<LoopRange>,
    /// Which part of a peeled domain this loop covers.
    pub kind: LoopKind,
    /// Set once peeling has guaranteed that every tile is full-sized.
    /// Lowering picks the vectorized code path for marked loops.
    pub perfectly_tiled: bool,
    /// The body region owned by this loop.
    pub body: RegionId,
    /// The op inside the body whose result is written back per tile.
    pub body_result: Option<OpId>,
    /// How many leading operands are loop inputs; one trailing operand after
    /// these, if present, is the init operand of a peeled chain.
    pub num_inputs: usize,
}

impl LoopInfo {
    /// Per-dimension step sizes.
    pub fn steps(&self) -> Vec<usize> {
        self.ranges.iter().map(|r| r.step).collect()
    }

    /// True if every range visits only full tiles.
    pub fn is_perfect(&self) -> bool {
        self.ranges.iter().all(LoopRange::is_perfect)
    }

    /// Total number of iteration elements the loop visits.
    pub fn num_elements(&self) -> usize {
        self.ranges.iter().map(LoopRange::num_elements).product()
    }
}

/// Operator kind. A closed set: passes match on the tag rather than going
/// through dynamic dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Function input; no operands.
    Input,
    /// Elementwise map over all operands.
    Map(MapKind),
    /// Broadcast the operand to the result shape (numpy-style, dimensions
    /// aligned from the right).
    Broadcast,
    /// Fill the result with a constant; no operands.
    Fill(f64),
    /// Reinterpret the operand with the result shape; element count is
    /// preserved.
    Reshape,
    /// Sum-reduction over one axis. Representative of the op kinds the
    /// tiling transforms leave alone.
    Reduce { axis: usize },
    /// Generated tiled loop nest; owns a body region.
    Loop(LoopInfo),
    /// Body-region argument: the tile-local view of loop input `input`.
    TileArg { input: usize },
}

// ──────────────────────────────── OpNode ─────────────────────────────────

/// An op in the function graph.
#[derive(Debug, Clone)]
pub struct OpNode {
    /// Op name (may be empty; used for diagnostics).
    pub name: String,

    /// Operator kind.
    pub kind: OpKind,

    /// Ordered operand references.
    pub operands: Vec<OpId>,

    /// Result shape.
    pub shape: Shape,

    /// Result element type.
    pub dtype: DataType,

    /// The region this op lives in. Maintained by `FuncGraph`.
    region: RegionId,
}

impl OpNode {
    /// Create a new op.
    pub fn new(kind: OpKind, operands: Vec<OpId>, shape: Shape, dtype: DataType) -> Self {
        Self { name: String::new(), kind, operands, shape, dtype, region: RegionId(0) }
    }

    /// Attach a diagnostic name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The region this op lives in.
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// True for elementwise map ops.
    pub fn is_map(&self) -> bool {
        matches!(self.kind, OpKind::Map(_))
    }

    /// Loop nest rank of a map-like op: the rank of its iteration space.
    pub fn loop_rank(&self) -> usize {
        self.shape.rank()
    }

    /// Loop metadata, if this op is a generated loop.
    pub fn as_loop(&self) -> Option<&LoopInfo> {
        match &self.kind {
            OpKind::Loop(info) => Some(info),
            _ => None,
        }
    }

    /// Mutable loop metadata, if this op is a generated loop.
    pub fn as_loop_mut(&mut self) -> Option<&mut LoopInfo> {
        match &mut self.kind {
            OpKind::Loop(info) => Some(info),
            _ => None,
        }
    }
}

/// One region: an ordered list of ops, optionally owned by a loop op.
///
/// The op list is kept in def-before-use order; all mutation goes through
/// `FuncGraph`, which preserves the ordering.
#[derive(Debug, Default)]
struct RegionData {
    ops: Vec<OpId>,
    parent: Option<OpId>,
}

// ──────────────────────────────── FuncGraph ──────────────────────────────

/// Dataflow graph of one function body.
///
/// Owns every op and region. The function's results are the ops listed in
/// `outputs`; listing an op there counts as one use of it.
pub struct FuncGraph {
    /// Op arena plus use/def edges. Edge weights are operand indices.
    graph: StableGraph<OpNode, usize>,

    /// Region table; removed regions leave `None` tombstones.
    regions: Vec<Option<RegionData>>,

    /// The function body region.
    root: RegionId,

    /// Ops whose results the function returns.
    pub outputs: Vec<OpId>,
}

impl FuncGraph {
    /// Create an empty function graph with a root region.
    pub fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            regions: vec![Some(RegionData::default())],
            root: RegionId(0),
            outputs: Vec::new(),
        }
    }

    /// The function body region.
    pub fn root_region(&self) -> RegionId {
        self.root
    }

    // ── Op access ──

    /// Get an immutable reference to an op.
    pub fn op(&self, id: OpId) -> Result<&OpNode> {
        self.graph
            .node_weight(id)
            .ok_or_else(|| Error::InvalidGraph(format!("op {:?} not found", id)))
    }

    /// Get a mutable reference to an op.
    pub fn op_mut(&mut self, id: OpId) -> Result<&mut OpNode> {
        self.graph
            .node_weight_mut(id)
            .ok_or_else(|| Error::InvalidGraph(format!("op {:?} not found", id)))
    }

    /// Check whether an op is still present.
    pub fn contains(&self, id: OpId) -> bool {
        self.graph.node_weight(id).is_some()
    }

    /// Iterate over all live ops in all regions.
    pub fn ops(&self) -> impl Iterator<Item = (OpId, &OpNode)> {
        self.graph
            .node_indices()
            .filter_map(|id| self.graph.node_weight(id).map(|op| (id, op)))
    }

    /// Number of live ops across all regions.
    pub fn op_count(&self) -> usize {
        self.graph.node_count()
    }

    // ── Use/user queries ──

    /// Ops consuming this op's result, deduplicated.
    pub fn users(&self, id: OpId) -> Vec<OpId> {
        let mut users = Vec::new();
        for user in self.graph.neighbors_directed(id, Direction::Outgoing) {
            if !users.contains(&user) {
                users.push(user);
            }
        }
        users
    }

    /// Number of uses of this op's result: operand references plus function
    /// output positions.
    pub fn use_count(&self, id: OpId) -> usize {
        let operand_uses = self.graph.edges_directed(id, Direction::Outgoing).count();
        let output_uses = self.outputs.iter().filter(|&&o| o == id).count();
        operand_uses + output_uses
    }

    // ── Graph mutation ──

    /// Append an op to the end of a region.
    pub fn add_op(&mut self, region: RegionId, node: OpNode) -> Result<OpId> {
        let pos = self.region_data(region)?.ops.len();
        self.install_op(region, pos, node)
    }

    /// Insert an op into `anchor`'s region immediately after `anchor`,
    /// preserving def-before-use order for `anchor`'s later consumers.
    pub fn insert_op_after(&mut self, anchor: OpId, node: OpNode) -> Result<OpId> {
        let region = self.op(anchor)?.region;
        let pos = self
            .region_data(region)?
            .ops
            .iter()
            .position(|&o| o == anchor)
            .ok_or_else(|| {
                Error::InvalidGraph(format!("op {:?} missing from region {:?}", anchor, region))
            })?;
        self.install_op(region, pos + 1, node)
    }

    fn install_op(&mut self, region: RegionId, pos: usize, mut node: OpNode) -> Result<OpId> {
        for &operand in &node.operands {
            if !self.contains(operand) {
                return Err(Error::InvalidGraph(format!(
                    "operand {:?} of new op does not exist",
                    operand
                )));
            }
        }

        node.region = region;
        let operands = node.operands.clone();
        let id = self.graph.add_node(node);

        for (idx, operand) in operands.into_iter().enumerate() {
            self.graph.add_edge(operand, id, idx);
        }

        self.region_data_mut(region)?.ops.insert(pos, id);
        Ok(id)
    }

    /// Remove an op. The op must be unused; its operand edges are dropped.
    ///
    /// Body regions of removed loops are not torn down here; callers remove
    /// region contents explicitly before removing the loop op.
    pub fn remove_op(&mut self, id: OpId) -> Result<()> {
        if self.use_count(id) != 0 {
            return Err(Error::InvalidGraph(format!(
                "cannot remove op {:?}: result still has {} uses",
                id,
                self.use_count(id)
            )));
        }

        let region = self.op(id)?.region;
        self.region_data_mut(region)?.ops.retain(|&o| o != id);
        self.graph.remove_node(id);
        Ok(())
    }

    /// Rewrite every use of `old` (operand references and function output
    /// positions) to refer to `new`.
    ///
    /// Loop `body_result` fields are bookkeeping, not uses; callers that
    /// replace a body result update the owning loop themselves.
    pub fn replace_all_uses(&mut self, old: OpId, new: OpId) -> Result<()> {
        if !self.contains(new) {
            return Err(Error::InvalidGraph(format!(
                "replacement op {:?} does not exist",
                new
            )));
        }

        let uses: Vec<(OpId, usize)> = self
            .graph
            .edges_directed(old, Direction::Outgoing)
            .map(|e| (e.target(), *e.weight()))
            .collect();

        for (user, operand_idx) in uses {
            let user_node = self.op_mut(user)?;
            user_node.operands[operand_idx] = new;
        }

        // Rebuild the edges: drop old→user, add new→user.
        while let Some(edge) = self
            .graph
            .edges_directed(old, Direction::Outgoing)
            .next()
            .map(|e| (e.id(), e.target(), *e.weight()))
        {
            let (edge_id, user, operand_idx) = edge;
            self.graph.remove_edge(edge_id);
            self.graph.add_edge(new, user, operand_idx);
        }

        for output in &mut self.outputs {
            if *output == old {
                *output = new;
            }
        }

        Ok(())
    }

    // ── Regions ──

    /// Create a new empty region.
    pub fn add_region(&mut self, parent: Option<OpId>) -> RegionId {
        let id = RegionId(self.regions.len());
        self.regions.push(Some(RegionData { ops: Vec::new(), parent }));
        id
    }

    /// Attach a region to the loop op that owns it.
    pub fn set_region_parent(&mut self, region: RegionId, parent: OpId) -> Result<()> {
        self.region_data_mut(region)?.parent = Some(parent);
        Ok(())
    }

    /// Remove an empty region.
    pub fn remove_region(&mut self, region: RegionId) -> Result<()> {
        if region == self.root {
            return Err(Error::InvalidGraph("cannot remove the root region".to_string()));
        }
        let data = self.region_data(region)?;
        if !data.ops.is_empty() {
            return Err(Error::InvalidGraph(format!(
                "cannot remove region {:?}: still holds {} ops",
                region,
                data.ops.len()
            )));
        }
        self.regions[region.0] = None;
        Ok(())
    }

    /// Ops of a region in def-before-use order.
    pub fn region_ops(&self, region: RegionId) -> Result<&[OpId]> {
        Ok(&self.region_data(region)?.ops)
    }

    /// The loop op owning a region, or `None` for the root region.
    pub fn region_parent(&self, region: RegionId) -> Result<Option<OpId>> {
        Ok(self.region_data(region)?.parent)
    }

    /// The control construct immediately enclosing an op: the loop op owning
    /// its region, or `None` if the op sits in the function body.
    pub fn parent_op(&self, id: OpId) -> Result<Option<OpId>> {
        let region = self.op(id)?.region;
        self.region_parent(region)
    }

    /// Position of an op within its region's op list.
    pub fn position_in_region(&self, id: OpId) -> Result<usize> {
        let region = self.op(id)?.region;
        self.region_data(region)?
            .ops
            .iter()
            .position(|&o| o == id)
            .ok_or_else(|| {
                Error::InvalidGraph(format!("op {:?} missing from region {:?}", id, region))
            })
    }

    fn region_data(&self, region: RegionId) -> Result<&RegionData> {
        self.regions
            .get(region.0)
            .and_then(|r| r.as_ref())
            .ok_or_else(|| Error::InvalidGraph(format!("region {:?} not found", region)))
    }

    fn region_data_mut(&mut self, region: RegionId) -> Result<&mut RegionData> {
        self.regions
            .get_mut(region.0)
            .and_then(|r| r.as_mut())
            .ok_or_else(|| Error::InvalidGraph(format!("region {:?} not found", region)))
    }
}

impl Default for FuncGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(graph: &mut FuncGraph, dims: Vec<usize>) -> OpId {
        let region = graph.root_region();
        graph
            .add_op(region, OpNode::new(OpKind::Input, vec![], Shape::new(dims), DataType::F32))
            .unwrap()
    }

    #[test]
    fn test_empty_graph() {
        let graph = FuncGraph::new();
        assert_eq!(graph.op_count(), 0);
        assert_eq!(graph.region_ops(graph.root_region()).unwrap().len(), 0);
    }

    #[test]
    fn test_add_and_query() {
        let mut graph = FuncGraph::new();
        let region = graph.root_region();

        let a = input(&mut graph, vec![4]);
        let b = input(&mut graph, vec![4]);
        let add = graph
            .add_op(
                region,
                OpNode::new(
                    OpKind::Map(MapKind::Add),
                    vec![a, b],
                    Shape::new(vec![4]),
                    DataType::F32,
                ),
            )
            .unwrap();

        assert_eq!(graph.op_count(), 3);
        assert_eq!(graph.users(a), vec![add]);
        assert_eq!(graph.use_count(a), 1);
        assert_eq!(graph.use_count(add), 0);
        assert_eq!(graph.region_ops(region).unwrap(), &[a, b, add]);
        assert!(graph.parent_op(add).unwrap().is_none());
    }

    #[test]
    fn test_output_counts_as_use() {
        let mut graph = FuncGraph::new();
        let a = input(&mut graph, vec![4]);
        assert_eq!(graph.use_count(a), 0);
        graph.outputs.push(a);
        assert_eq!(graph.use_count(a), 1);
        assert!(graph.users(a).is_empty());
    }

    #[test]
    fn test_remove_op_rejects_used() {
        let mut graph = FuncGraph::new();
        let region = graph.root_region();
        let a = input(&mut graph, vec![4]);
        let neg = graph
            .add_op(
                region,
                OpNode::new(OpKind::Map(MapKind::Neg), vec![a], Shape::new(vec![4]), DataType::F32),
            )
            .unwrap();

        assert!(graph.remove_op(a).is_err());
        graph.remove_op(neg).unwrap();
        graph.remove_op(a).unwrap();
        assert_eq!(graph.op_count(), 0);
    }

    #[test]
    fn test_replace_all_uses() {
        let mut graph = FuncGraph::new();
        let region = graph.root_region();
        let a = input(&mut graph, vec![4]);
        let b = input(&mut graph, vec![4]);
        let neg = graph
            .add_op(
                region,
                OpNode::new(OpKind::Map(MapKind::Neg), vec![a], Shape::new(vec![4]), DataType::F32),
            )
            .unwrap();
        graph.outputs.push(a);

        graph.replace_all_uses(a, b).unwrap();

        assert_eq!(graph.op(neg).unwrap().operands, vec![b]);
        assert_eq!(graph.outputs, vec![b]);
        assert_eq!(graph.use_count(a), 0);
        assert_eq!(graph.use_count(b), 2);
    }

    #[test]
    fn test_insert_op_after() {
        let mut graph = FuncGraph::new();
        let region = graph.root_region();
        let a = input(&mut graph, vec![4]);
        let b = input(&mut graph, vec![4]);

        let neg = graph
            .insert_op_after(
                a,
                OpNode::new(OpKind::Map(MapKind::Neg), vec![a], Shape::new(vec![4]), DataType::F32),
            )
            .unwrap();

        assert_eq!(graph.region_ops(region).unwrap(), &[a, neg, b]);
    }

    #[test]
    fn test_stable_ids_across_removal() {
        let mut graph = FuncGraph::new();
        let a = input(&mut graph, vec![2]);
        let b = input(&mut graph, vec![2]);
        let c = input(&mut graph, vec![2]);

        graph.remove_op(b).unwrap();

        assert!(graph.op(a).is_ok());
        assert!(graph.op(c).is_ok());
        assert!(!graph.contains(b));
    }

    #[test]
    fn test_regions_and_parents() {
        let mut graph = FuncGraph::new();
        let a = input(&mut graph, vec![8]);

        let body = graph.add_region(None);
        let arg = graph
            .add_op(
                body,
                OpNode::new(
                    OpKind::TileArg { input: 0 },
                    vec![],
                    Shape::new(vec![4]),
                    DataType::F32,
                ),
            )
            .unwrap();

        let info = LoopInfo {
            ranges: vec![LoopRange { start: 0, end: 8, step: 4 }],
            kind: LoopKind::Main,
            perfectly_tiled: false,
            body,
            body_result: Some(arg),
            num_inputs: 1,
        };
        let loop_op = graph
            .add_op(
                graph.root_region(),
                OpNode::new(OpKind::Loop(info), vec![a], Shape::new(vec![8]), DataType::F32),
            )
            .unwrap();
        graph.set_region_parent(body, loop_op).unwrap();

        assert_eq!(graph.parent_op(arg).unwrap(), Some(loop_op));
        assert_eq!(graph.parent_op(loop_op).unwrap(), None);
        assert!(graph.remove_region(body).is_err());
    }

    #[test]
    fn test_loop_range_trip_counts() {
        let perfect = LoopRange { start: 0, end: 1024, step: 8 };
        assert_eq!(perfect.trip_count(), 128);
        assert!(perfect.is_perfect());

        let ragged = LoopRange { start: 0, end: 1003, step: 8 };
        assert_eq!(ragged.trip_count(), 126);
        assert!(!ragged.is_perfect());

        let tail = LoopRange { start: 1000, end: 1003, step: 3 };
        assert_eq!(tail.trip_count(), 1);
        assert_eq!(tail.num_elements(), 3);
    }
}
