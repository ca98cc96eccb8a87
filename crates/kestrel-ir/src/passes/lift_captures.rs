// Capture lifting
//
// While emitting, nested blocks refer to values of enclosing blocks
// directly. This pass rewrites every such reference into an explicit
// capture:
//
//   %y = If(%c)                      %y = If(%c, %x)
//     block0():                        block0(%x.1):
//       %a = relu(%x)          ─►        %a = relu(%x.1)
//
// Blocks are processed innermost first, so a value needed two levels down
// is threaded through each intermediate node.

use std::collections::HashSet;

use crate::graph::{BlockId, Graph, NodeId, ValueId};

/// Lift all free values of nested blocks into node inputs. Returns the number
/// of captures created.
pub fn lift_captures(graph: &mut Graph) -> usize {
    lift_block(graph, graph.top())
}

fn lift_block(graph: &mut Graph, block: BlockId) -> usize {
    let mut count = 0;
    for node in graph.block(block).nodes.clone() {
        let blocks = graph.node(node).blocks.clone();
        if blocks.is_empty() {
            continue;
        }
        for &b in &blocks {
            count += lift_block(graph, b);
        }
        count += lift_node(graph, node, &blocks);
    }
    count
}

/// Values used directly inside `block` but defined outside it, in first-use
/// order.
fn free_values(graph: &Graph, block: BlockId) -> Vec<ValueId> {
    let b = graph.block(block);
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let used = b
        .nodes
        .iter()
        .flat_map(|&n| graph.node(n).inputs.iter().copied())
        .chain(b.returns.iter().copied());
    for v in used {
        if graph.defining_block(v) != block && seen.insert(v) {
            out.push(v);
        }
    }
    out
}

fn lift_node(graph: &mut Graph, node: NodeId, blocks: &[BlockId]) -> usize {
    let mut captures = Vec::new();
    let mut seen = HashSet::new();
    for &b in blocks {
        for v in free_values(graph, b) {
            if seen.insert(v) {
                captures.push(v);
            }
        }
    }
    for &v in &captures {
        graph.add_node_input(node, v);
        let ty = graph.value_type(v).clone();
        let name = graph.value(v).debug_name.clone();
        for &b in blocks {
            let p = graph.add_block_param(b, ty.clone());
            if let Some(name) = &name {
                graph.set_debug_name(p, name.clone());
            }
            graph.replace_uses_in_block(v, p, b);
        }
    }
    captures.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{InsertPoint, NodeKind};
    use crate::types::Type;

    #[test]
    fn test_if_branch_captures_outer_value() {
        let mut g = Graph::new();
        let c = g.add_input(Type::Bool, Some("c"));
        let x = g.add_input(Type::tensor(), Some("x"));
        let top = g.top();
        let node = g.insert(InsertPoint::End(top), NodeKind::If, &[c], vec![]);
        let then_b = g.add_block(node);
        let else_b = g.add_block(node);
        let r = g.insert_op(InsertPoint::End(then_b), "relu", &[x], &[]).unwrap();
        let r = g.node(r).outputs[0];
        g.add_block_return(then_b, r);
        g.add_block_return(else_b, x);
        let out = g.add_node_output(node, Type::tensor());
        g.set_outputs(&[out]);

        assert_eq!(lift_captures(&mut g), 1);
        assert_eq!(g.node(node).inputs, vec![c, x]);
        let p_then = g.block(then_b).params[0];
        let p_else = g.block(else_b).params[0];
        assert_eq!(g.block(else_b).returns, vec![p_else]);
        let relu = g.block(then_b).nodes[0];
        assert_eq!(g.node(relu).inputs, vec![p_then]);
        assert!(g.uses(x).len() == 1);
    }
}
