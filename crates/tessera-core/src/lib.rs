//! Core intermediate representation and pass infrastructure for Tessera.
//!
//! This crate provides the foundational abstractions the transform crates
//! build on:
//! - Region-structured dataflow IR (`FuncGraph`, `OpNode`, `OpKind`)
//! - Graph builder for constructing function bodies (`GraphBuilder`)
//! - The `Pass` trait for function-level transformations
//! - Shape and element-type definitions

pub mod builder;
pub mod ir;
pub mod pass;
pub mod types;

// Re-export commonly used types
pub use builder::GraphBuilder;
pub use ir::{
    FuncGraph, LoopInfo, LoopKind, LoopRange, MapKind, OpId, OpKind, OpNode, RegionId,
};
pub use pass::Pass;
pub use types::{DataType, Shape};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for tessera-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Pass failed: {0}")]
    PassFailed(String),
}
