//! Graph transformations for Tessera.
//!
//! This crate rewrites `tessera-core` function graphs ahead of lowering. Its
//! centerpiece is [`TileAndFuseMapsPass`], which turns chains of elementwise
//! map ops into tiled loop nests:
//!
//! 1. **Fusion root selection** - walk single-use map chains downstream and
//!    tile the deepest map, fusing everything above it into the loop body.
//! 2. **Tiling** - tile sizes are 1 for every dimension except the innermost,
//!    which receives the configured size.
//! 3. **Peeling** - split ragged dimensions off into remainder loops so the
//!    main loop only ever sees full tiles.
//! 4. **Scalarization** - re-tile remainder bodies down to single elements.
//!
//! Each rewrite is atomic: a failed match leaves the graph untouched.
//!
//! # Example
//!
//! ```
//! use std::num::NonZeroUsize;
//! use tessera_core::{DataType, GraphBuilder, MapKind};
//! use tessera_transforms::{Pipeline, TileAndFuseMapsPass};
//!
//! # fn main() -> tessera_core::Result<()> {
//! let mut b = GraphBuilder::new();
//! let x = b.input("x", vec![1024], DataType::F32)?;
//! let y = b.input("y", vec![1024], DataType::F32)?;
//! let add = b.map(MapKind::Add, &[x, y])?;
//! let relu = b.map(MapKind::Relu, &[add])?;
//! b.output(relu)?;
//! let mut graph = b.finish();
//!
//! let tile = NonZeroUsize::new(8).unwrap();
//! let mut pipeline = Pipeline::new();
//! pipeline.add_pass(TileAndFuseMapsPass::new(tile));
//! let changed = pipeline.run(&mut graph)?;
//! assert!(changed);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod fusion;
pub mod passes;
pub mod peeling;
pub mod rewrite;
pub mod scalarize;
pub mod tiling;

pub use error::{RewriteError, RewriteResult};
pub use fusion::{find_fusion_root, is_fusable, FuseFilter};
pub use passes::TileAndFuseMapsPass;
pub use peeling::{peel_loop_nest, PeeledLoops};
pub use rewrite::{rewrite_to_fixpoint, LabelSet, RewriteTx, DEFAULT_REWRITE_BUDGET};
pub use scalarize::scalarize_remainders;
pub use tiling::{inner_dim_tile_sizes, tile_and_fuse, TilingResult};

use tessera_core::{FuncGraph, Pass, Result};

/// Transformation pipeline with pluggable passes.
///
/// Passes run in registration order; each receives the graph the previous
/// pass left behind.
#[derive(Default)]
pub struct Pipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pass to the end of the pipeline. Returns a mutable reference to
    /// self for method chaining.
    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Run all passes in order. Returns whether any pass changed the graph.
    #[tracing::instrument(skip_all, fields(num_passes = self.passes.len()))]
    pub fn run(&self, graph: &mut FuncGraph) -> Result<bool> {
        let mut changed = false;
        for pass in &self.passes {
            let _span = tracing::debug_span!("pass", name = pass.name()).entered();
            changed |= pass.run(graph)?;
        }
        Ok(changed)
    }
}
