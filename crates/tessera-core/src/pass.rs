//! Transformation pass trait.

use crate::ir::FuncGraph;
use crate::Result;

/// Trait for function-level transformation passes.
///
/// A pass rewrites one function body in place. Failure is fatal for that
/// function only; the caller decides how to proceed with other functions in
/// the same compilation.
///
/// # Return Value
///
/// `run()` returns `Ok(true)` if the pass changed the graph and `Ok(false)`
/// if the graph was already in the pass's fixpoint form. This lets a pipeline
/// detect convergence without diffing graphs.
pub trait Pass {
    /// Pass name, used for logging and diagnostics.
    fn name(&self) -> &str;

    /// Run the pass on the given function graph.
    fn run(&self, graph: &mut FuncGraph) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoOpPass;

    impl Pass for NoOpPass {
        fn name(&self) -> &str {
            "noop"
        }

        fn run(&self, _graph: &mut FuncGraph) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_pass_trait_object() {
        let pass: Box<dyn Pass> = Box::new(NoOpPass);
        let mut graph = FuncGraph::new();
        assert_eq!(pass.name(), "noop");
        assert!(!pass.run(&mut graph).unwrap());
    }
}
