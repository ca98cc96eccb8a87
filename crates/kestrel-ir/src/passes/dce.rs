// Dead code elimination
//
// Walks every block backwards. A node is dead when none of its outputs is
// used and neither it nor anything nested in it has side effects. Control
// nodes are also slimmed: unused If outputs, Loop-carried values that
// neither the loop result nor the body reads, and captures no block reads
// are removed. Runs to a fixed point.

use crate::graph::{BlockId, Graph, NodeId, NodeKind, Use};

/// Remove dead nodes, outputs and captures. Returns the number of removals.
pub fn eliminate_dead_code(graph: &mut Graph) -> usize {
    let mut total = 0;
    loop {
        let removed = sweep_block(graph, graph.top());
        if removed == 0 {
            return total;
        }
        total += removed;
    }
}

/// Whether `node` or any node nested in it has side effects.
pub fn has_effects(graph: &Graph, node: NodeId) -> bool {
    let n = graph.node(node);
    n.kind.has_side_effects()
        || n.blocks
            .iter()
            .any(|&b| graph.block(b).nodes.iter().any(|&m| has_effects(graph, m)))
}

fn sweep_block(graph: &mut Graph, block: BlockId) -> usize {
    let mut removed = 0;
    for node in graph.block(block).nodes.clone().into_iter().rev() {
        if !graph.node(node).alive {
            continue;
        }
        removed += prune_outputs(graph, node);
        for b in graph.node(node).blocks.clone() {
            removed += sweep_block(graph, b);
        }
        removed += prune_captures(graph, node);
        let unused = graph.node(node).outputs.iter().all(|&o| !graph.has_uses(o));
        if unused && !has_effects(graph, node) && graph.erase_node(node) {
            removed += 1;
        }
    }
    removed
}

fn prune_outputs(graph: &mut Graph, node: NodeId) -> usize {
    let mut removed = 0;
    let is_loop = match graph.node(node).kind {
        NodeKind::If => false,
        NodeKind::Loop => true,
        _ => return 0,
    };
    match is_loop {
        false => {
            let blocks = graph.node(node).blocks.clone();
            for i in (0..graph.node(node).outputs.len()).rev() {
                if graph.has_uses(graph.node(node).outputs[i]) {
                    continue;
                }
                for &b in &blocks {
                    graph.remove_block_return(b, i);
                }
                graph.remove_node_output(node, i);
                removed += 1;
            }
        }
        true => {
            let body = graph.node(node).blocks[0];
            for j in (0..graph.node(node).outputs.len()).rev() {
                if graph.has_uses(graph.node(node).outputs[j]) {
                    continue;
                }
                let param = graph.block(body).params[1 + j];
                let only_fed_back = graph
                    .uses(param)
                    .iter()
                    .all(|u| *u == Use::Return { block: body, index: 1 + j });
                if !only_fed_back {
                    continue;
                }
                graph.remove_block_return(body, 1 + j);
                graph.remove_block_param(body, 1 + j);
                graph.remove_node_input(node, 2 + j);
                graph.remove_node_output(node, j);
                removed += 1;
            }
        }
    }
    removed
}

/// Offsets of the first capture among node inputs and block params.
fn capture_offsets(graph: &Graph, node: NodeId) -> Option<(usize, usize)> {
    let n = graph.node(node);
    match n.kind {
        NodeKind::If => Some((1, 0)),
        NodeKind::Loop => Some((2 + n.outputs.len(), 1 + n.outputs.len())),
        NodeKind::Fork | NodeKind::FusionGroup => Some((0, 0)),
        _ => None,
    }
}

fn prune_captures(graph: &mut Graph, node: NodeId) -> usize {
    let Some((input_off, param_off)) = capture_offsets(graph, node) else {
        return 0;
    };
    let blocks = graph.node(node).blocks.clone();
    let count = graph.node(node).inputs.len().saturating_sub(input_off);
    let mut removed = 0;
    for i in (0..count).rev() {
        let unused = blocks.iter().all(|&b| {
            graph
                .block(b)
                .params
                .get(param_off + i)
                .is_some_and(|&p| !graph.has_uses(p))
        });
        if !unused {
            continue;
        }
        for &b in &blocks {
            graph.remove_block_param(b, param_off + i);
        }
        graph.remove_node_input(node, input_off + i);
        removed += 1;
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Constant, InsertPoint};
    use crate::types::Type;

    #[test]
    fn test_removes_unused_pure_nodes() {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), Some("x"));
        let top = g.top();
        let a = g.insert_op(InsertPoint::End(top), "relu", &[x], &[]).unwrap();
        let b = g.insert_op(InsertPoint::End(top), "exp", &[x], &[]).unwrap();
        let out = g.node(b).outputs[0];
        g.set_outputs(&[out]);
        assert_eq!(eliminate_dead_code(&mut g), 1);
        assert!(!g.node(a).alive);
        assert_eq!(g.block(top).nodes, vec![b]);
    }

    #[test]
    fn test_keeps_side_effects() {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), Some("x"));
        let top = g.top();
        let n = g.insert_op(InsertPoint::End(top), "relu_", &[x], &[]).unwrap();
        g.set_outputs(&[x]);
        assert_eq!(eliminate_dead_code(&mut g), 0);
        assert!(g.node(n).alive);
    }

    #[test]
    fn test_prunes_unused_if_output() {
        let mut g = Graph::new();
        let c = g.add_input(Type::Bool, Some("c"));
        let top = g.top();
        let node = g.insert(InsertPoint::End(top), NodeKind::If, &[c], vec![]);
        let t = g.add_block(node);
        let e = g.add_block(node);
        let one = g.insert_constant(InsertPoint::End(t), Constant::Int(1));
        let two = g.insert_constant(InsertPoint::End(e), Constant::Int(2));
        g.add_block_return(t, one);
        g.add_block_return(e, two);
        g.add_node_output(node, Type::Int);
        let none = g.insert_constant(InsertPoint::End(top), Constant::None);
        g.set_outputs(&[none]);
        eliminate_dead_code(&mut g);
        assert!(!g.node(node).alive);
    }
}
