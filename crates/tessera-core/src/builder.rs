//! Convenience builder for assembling function graphs.
//!
//! Ops are appended to the function body in program order, which keeps the
//! root region's op list in def-before-use order. Shape rules are validated
//! on the way in so passes can rely on a well-formed graph.

use crate::ir::{FuncGraph, MapKind, OpId, OpKind, OpNode};
use crate::types::{DataType, Shape};
use crate::{Error, Result};

/// Builder for a function body graph.
pub struct GraphBuilder {
    graph: FuncGraph,
}

impl GraphBuilder {
    /// Start a new function body.
    pub fn new() -> Self {
        Self { graph: FuncGraph::new() }
    }

    /// Add a function input.
    pub fn input(&mut self, name: &str, shape: impl Into<Shape>, dtype: DataType) -> Result<OpId> {
        let node = OpNode::new(OpKind::Input, vec![], shape.into(), dtype).with_name(name);
        self.graph.add_op(self.graph.root_region(), node)
    }

    /// Add an elementwise map op. All operands must share one shape, which
    /// becomes the result shape.
    pub fn map(&mut self, kind: MapKind, operands: &[OpId]) -> Result<OpId> {
        if operands.len() != kind.arity() {
            return Err(Error::InvalidGraph(format!(
                "map {:?} expects {} operands, got {}",
                kind,
                kind.arity(),
                operands.len()
            )));
        }

        let first = self.graph.op(operands[0])?;
        let shape = first.shape.clone();
        let dtype = first.dtype;
        for &operand in &operands[1..] {
            let op = self.graph.op(operand)?;
            if op.shape != shape {
                return Err(Error::InvalidGraph(format!(
                    "map {:?} operand shapes differ: {} vs {}",
                    kind, shape, op.shape
                )));
            }
        }

        let node = OpNode::new(OpKind::Map(kind), operands.to_vec(), shape, dtype);
        self.graph.add_op(self.graph.root_region(), node)
    }

    /// Broadcast an operand to a larger shape (dimensions aligned from the
    /// right).
    pub fn broadcast(&mut self, operand: OpId, shape: impl Into<Shape>) -> Result<OpId> {
        let shape = shape.into();
        let src = self.graph.op(operand)?;
        if src.shape.rank() > shape.rank() {
            return Err(Error::InvalidGraph(format!(
                "broadcast cannot reduce rank: {} to {}",
                src.shape, shape
            )));
        }
        let dtype = src.dtype;
        let node = OpNode::new(OpKind::Broadcast, vec![operand], shape, dtype);
        self.graph.add_op(self.graph.root_region(), node)
    }

    /// Fill a tensor with a constant.
    pub fn fill(&mut self, value: f64, shape: impl Into<Shape>, dtype: DataType) -> Result<OpId> {
        let node = OpNode::new(OpKind::Fill(value), vec![], shape.into(), dtype);
        self.graph.add_op(self.graph.root_region(), node)
    }

    /// Reinterpret an operand with a new shape of equal element count.
    pub fn reshape(&mut self, operand: OpId, shape: impl Into<Shape>) -> Result<OpId> {
        let shape = shape.into();
        let src = self.graph.op(operand)?;
        if src.shape.num_elements() != shape.num_elements() {
            return Err(Error::InvalidGraph(format!(
                "reshape changes element count: {} to {}",
                src.shape, shape
            )));
        }
        let dtype = src.dtype;
        let node = OpNode::new(OpKind::Reshape, vec![operand], shape, dtype);
        self.graph.add_op(self.graph.root_region(), node)
    }

    /// Sum-reduce one axis of an operand.
    pub fn reduce(&mut self, operand: OpId, axis: usize) -> Result<OpId> {
        let src = self.graph.op(operand)?;
        if axis >= src.shape.rank() {
            return Err(Error::InvalidGraph(format!(
                "reduce axis {} out of range for {}",
                axis, src.shape
            )));
        }
        let dims: Vec<usize> = src
            .shape
            .dims()
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| (i != axis).then_some(d))
            .collect();
        let dtype = src.dtype;
        let node = OpNode::new(OpKind::Reduce { axis }, vec![operand], Shape::new(dims), dtype);
        self.graph.add_op(self.graph.root_region(), node)
    }

    /// Mark an op as a function output.
    pub fn output(&mut self, op: OpId) -> Result<()> {
        if !self.graph.contains(op) {
            return Err(Error::InvalidGraph(format!("output op {:?} does not exist", op)));
        }
        self.graph.outputs.push(op);
        Ok(())
    }

    /// Finish building and return the graph.
    pub fn finish(self) -> FuncGraph {
        self.graph
    }

    /// Access the graph under construction.
    pub fn graph(&self) -> &FuncGraph {
        &self.graph
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}
