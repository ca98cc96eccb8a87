// Common subexpression elimination
//
// Within a block, two pure nodes with the same operator and the same inputs
// compute the same value; the later one is replaced by the earlier one.
// Each block is its own scope: nested blocks only see their captures, so
// values are never shared across block boundaries.
//
// Tensor-producing nodes are only merged when nothing in the graph writes a
// tensor in place, since two equal-looking results may be distinct buffers
// that are later mutated separately.

use std::collections::HashMap;

use crate::graph::{BlockId, Graph, NodeId, NodeKind, ValueId};

type Key = (String, Vec<ValueId>);

/// Merge identical pure computations. Returns the number of nodes removed.
pub fn eliminate_common_subexprs(graph: &mut Graph) -> usize {
    let mutation_free = !graph.walk(graph.top()).iter().any(|&n| {
        matches!(&graph.node(n).kind, NodeKind::Op(s) if s.flags.mutates.is_some())
    });
    let removed = cse_block(graph, graph.top(), mutation_free);
    if removed > 0 {
        log::trace!("cse: {removed} node(s) merged");
    }
    removed
}

fn key_of(graph: &Graph, node: NodeId, mutation_free: bool) -> Option<Key> {
    let n = graph.node(node);
    if !n.blocks.is_empty() || n.outputs.len() != 1 {
        return None;
    }
    let produces_tensor = graph.value_type(n.outputs[0]).contains_tensor();
    if produces_tensor && !mutation_free {
        return None;
    }
    let tag = match &n.kind {
        NodeKind::Constant(c) if !produces_tensor => {
            format!("const:{}:{c}", graph.value_type(n.outputs[0]))
        }
        NodeKind::Op(schema) if schema.flags.pure => schema.qualified_name(),
        NodeKind::TupleIndex { index } => format!("TupleIndex:{index}"),
        NodeKind::TupleConstruct | NodeKind::IsNone | NodeKind::UnwrapOptional => n.kind.name(),
        _ => return None,
    };
    Some((tag, n.inputs.clone()))
}

fn cse_block(graph: &mut Graph, block: BlockId, mutation_free: bool) -> usize {
    let mut seen: HashMap<Key, ValueId> = HashMap::new();
    let mut removed = 0;
    for node in graph.block(block).nodes.clone() {
        if !graph.node(node).alive {
            continue;
        }
        for b in graph.node(node).blocks.clone() {
            removed += cse_block(graph, b, mutation_free);
        }
        let Some(key) = key_of(graph, node, mutation_free) else {
            continue;
        };
        let out = graph.node(node).outputs[0];
        match seen.get(&key) {
            Some(&prev) if graph.value_type(prev) == graph.value_type(out) => {
                graph.replace_all_uses_with(out, prev);
                graph.erase_node(node);
                removed += 1;
            }
            Some(_) => {}
            None => {
                seen.insert(key, out);
            }
        }
    }
    removed
}
