//! Fusability predicate and fusion-cluster selection.
//!
//! A fusion cluster is a chain of single-use elementwise-like ops that can be
//! evaluated inside one loop body without materializing intermediates. The
//! predicate decides which op kinds may join a cluster; the selector walks
//! forward from a candidate map to the deepest map the cluster can be rooted
//! at.

use tessera_core::{FuncGraph, OpId, OpKind, Shape};

/// Predicate deciding whether an op may join a fusion cluster.
pub type FuseFilter<'a> = &'a dyn Fn(&FuncGraph, OpId) -> bool;

/// True if a reshape only inserts or removes unit dimensions, leaving the
/// order of the remaining dimensions (and therefore the element layout)
/// untouched.
pub fn is_degenerate_reshape(from: &Shape, to: &Shape) -> bool {
    let significant = |s: &Shape| -> Vec<usize> {
        s.dims().iter().copied().filter(|&d| d != 1).collect()
    };
    significant(from) == significant(to)
}

/// The fusability predicate: true iff the op is a broadcast, a fill, a map,
/// or a degenerate reshape.
///
/// Any other kind terminates a fusion chain. In particular a reshape that
/// actually rearranges data is simply not fusable; it is a chain terminator,
/// not an error.
pub fn is_fusable(graph: &FuncGraph, op: OpId) -> bool {
    let Ok(node) = graph.op(op) else {
        return false;
    };
    match &node.kind {
        OpKind::Map(_) | OpKind::Broadcast | OpKind::Fill(_) => true,
        OpKind::Reshape => {
            let Ok(src) = graph.op(node.operands[0]) else {
                return false;
            };
            is_degenerate_reshape(&src.shape, &node.shape)
        }
        _ => false,
    }
}

/// Find the root of the fusion cluster reachable from `op`.
///
/// Walks the single-use successor chain while the filter accepts the current
/// op, and remembers the last map seen along the way. Fan-out greater than
/// one stops the walk at the current op, with no lookahead past the fan-out
/// point.
pub fn find_fusion_root(graph: &FuncGraph, op: OpId, filter: FuseFilter) -> OpId {
    let mut root = op;

    let mut cur = op;
    while filter(graph, cur) {
        if graph.use_count(cur) != 1 {
            break;
        }
        let users = graph.users(cur);
        let Some(&user) = users.first() else {
            // Sole use is a function output; there is no op to advance to.
            break;
        };
        cur = user;

        if graph.op(cur).map(|n| n.is_map()).unwrap_or(false) {
            root = cur;
        }
    }
    root
}

/// Collect the backward fusion cluster of `root`: the root plus every
/// transitive producer that passes the filter and has exactly one use.
///
/// The returned ops are ordered by their position in the root's region, so
/// producers come before consumers.
pub fn collect_cluster(graph: &FuncGraph, root: OpId, filter: FuseFilter) -> Vec<OpId> {
    let root_region = match graph.op(root) {
        Ok(node) => node.region(),
        Err(_) => return vec![root],
    };

    let mut cluster = vec![root];
    let mut stack = vec![root];
    while let Some(op) = stack.pop() {
        let Ok(node) = graph.op(op) else { continue };
        for &operand in &node.operands {
            if cluster.contains(&operand) {
                continue;
            }
            let Ok(producer) = graph.op(operand) else { continue };
            if producer.region() != root_region {
                continue;
            }
            if filter(graph, operand) && graph.use_count(operand) == 1 {
                cluster.push(operand);
                stack.push(operand);
            }
        }
    }

    cluster.sort_by_key(|&op| graph.position_in_region(op).unwrap_or(usize::MAX));
    cluster
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{DataType, GraphBuilder, MapKind};

    #[test]
    fn test_degenerate_reshape() {
        let s = |dims: &[usize]| Shape::from(dims);
        assert!(is_degenerate_reshape(&s(&[4, 8]), &s(&[1, 4, 8])));
        assert!(is_degenerate_reshape(&s(&[1, 4, 1, 8]), &s(&[4, 8])));
        assert!(is_degenerate_reshape(&s(&[4]), &s(&[4, 1])));
        assert!(!is_degenerate_reshape(&s(&[4, 8]), &s(&[8, 4])));
        assert!(!is_degenerate_reshape(&s(&[4, 8]), &s(&[32])));
    }

    #[test]
    fn test_fusable_kinds() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![4, 8], DataType::F32).unwrap();
        let y = b.input("y", vec![4, 8], DataType::F32).unwrap();
        let add = b.map(MapKind::Add, &[x, y]).unwrap();
        let fill = b.fill(0.0, vec![4, 8], DataType::F32).unwrap();
        let expand = b.reshape(add, vec![1, 4, 8]).unwrap();
        let transposed = b.reshape(fill, vec![8, 4]).unwrap();
        let sum = b.reduce(x, 1).unwrap();
        let graph = b.finish();

        assert!(is_fusable(&graph, add));
        assert!(is_fusable(&graph, fill));
        assert!(is_fusable(&graph, expand));
        assert!(!is_fusable(&graph, transposed));
        assert!(!is_fusable(&graph, sum));
        assert!(!is_fusable(&graph, x));
    }

    #[test]
    fn test_root_is_deepest_map() {
        // add -> expand(reshape) -> relu: the walk crosses the degenerate
        // reshape and roots at relu.
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![4, 8], DataType::F32).unwrap();
        let y = b.input("y", vec![4, 8], DataType::F32).unwrap();
        let add = b.map(MapKind::Add, &[x, y]).unwrap();
        let expand = b.reshape(add, vec![1, 4, 8]).unwrap();
        let relu = b.map(MapKind::Relu, &[expand]).unwrap();
        b.output(relu).unwrap();
        let graph = b.finish();

        assert_eq!(find_fusion_root(&graph, add, &is_fusable), relu);
    }

    #[test]
    fn test_fan_out_stops_walk() {
        // add has two users; it becomes its own root even though relu would
        // be fusable.
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![16], DataType::F32).unwrap();
        let y = b.input("y", vec![16], DataType::F32).unwrap();
        let add = b.map(MapKind::Add, &[x, y]).unwrap();
        let relu = b.map(MapKind::Relu, &[add]).unwrap();
        let neg = b.map(MapKind::Neg, &[add]).unwrap();
        b.output(relu).unwrap();
        b.output(neg).unwrap();
        let graph = b.finish();

        assert_eq!(find_fusion_root(&graph, add, &is_fusable), add);
    }

    #[test]
    fn test_non_fusable_user_stops_walk() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![4, 8], DataType::F32).unwrap();
        let neg = b.map(MapKind::Neg, &[x]).unwrap();
        let sum = b.reduce(neg, 1).unwrap();
        b.output(sum).unwrap();
        let graph = b.finish();

        // neg is fusable and single-use, but its user is a reduction: the
        // walk advances to the reduction, which fails the filter without
        // becoming the root.
        assert_eq!(find_fusion_root(&graph, neg, &is_fusable), neg);
    }

    #[test]
    fn test_cluster_excludes_multi_use_producer() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![16], DataType::F32).unwrap();
        let neg = b.map(MapKind::Neg, &[x]).unwrap();
        let relu = b.map(MapKind::Relu, &[neg]).unwrap();
        let abs = b.map(MapKind::Abs, &[neg]).unwrap();
        b.output(relu).unwrap();
        b.output(abs).unwrap();
        let graph = b.finish();

        // neg has fan-out 2, so the cluster rooted at relu is relu alone.
        assert_eq!(collect_cluster(&graph, relu, &is_fusable), vec![relu]);
    }

    #[test]
    fn test_cluster_orders_producers_first() {
        let mut b = GraphBuilder::new();
        let x = b.input("x", vec![16], DataType::F32).unwrap();
        let y = b.input("y", vec![16], DataType::F32).unwrap();
        let add = b.map(MapKind::Add, &[x, y]).unwrap();
        let relu = b.map(MapKind::Relu, &[add]).unwrap();
        b.output(relu).unwrap();
        let graph = b.finish();

        assert_eq!(collect_cluster(&graph, relu, &is_fusable), vec![add, relu]);
    }
}
