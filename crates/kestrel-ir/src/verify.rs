// Graph verifier
//
// Checks the invariants every pass relies on:
//
//   - a node input is a parameter of the node's own block or an output of an
//     earlier node of that block (no implicit capture across blocks)
//   - use lists match the inputs and returns that refer to each value
//   - If / Loop / Fork / FusionGroup follow their block conventions
//   - operator inputs are accepted by the operator schema, and values
//     flowing out of blocks fit the types they flow into

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::graph::{BlockId, Graph, NodeId, NodeKind, Use, ValueId};
use crate::schema::accepts;
use crate::types::Type;

/// Verify `graph`, failing with a description of the first violation.
pub fn verify(graph: &Graph) -> Result<()> {
    verify_block(graph, graph.top())
}

fn fail(msg: String) -> Result<()> {
    Err(Error::msg(format!("graph verification failed: {msg}")))
}

fn verify_block(graph: &Graph, block: BlockId) -> Result<()> {
    let b = graph.block(block);
    let mut scope: HashSet<ValueId> = b.params.iter().copied().collect();
    for &node in &b.nodes {
        let n = graph.node(node);
        if !n.alive {
            return fail(format!("dead node {node} is still listed in {block}"));
        }
        if n.owner != block {
            return fail(format!("node {node} is listed in {block} but owned by {}", n.owner));
        }
        for (index, &v) in n.inputs.iter().enumerate() {
            if !scope.contains(&v) {
                return fail(format!(
                    "input {index} of {node} ({}) uses {v}, which is not visible in {block}",
                    n.kind.name()
                ));
            }
            if !graph.uses(v).contains(&Use::Node { node, index }) {
                return fail(format!("use of {v} by {node} is not recorded"));
            }
        }
        verify_structure(graph, node)?;
        for &sub in &n.blocks {
            verify_block(graph, sub)?;
        }
        scope.extend(n.outputs.iter().copied());
    }
    for (index, &v) in b.returns.iter().enumerate() {
        if !scope.contains(&v) {
            return fail(format!("{block} returns {v}, which is not visible there"));
        }
        if !graph.uses(v).contains(&Use::Return { block, index }) {
            return fail(format!("return of {v} from {block} is not recorded"));
        }
    }
    for v in b.params.iter().chain(b.nodes.iter().flat_map(|&n| &graph.node(n).outputs)) {
        for u in graph.uses(*v) {
            let consistent = match *u {
                Use::Node { node, index } => {
                    graph.node(node).alive && graph.node(node).inputs.get(index) == Some(v)
                }
                Use::Return { block, index } => graph.block(block).returns.get(index) == Some(v),
            };
            if !consistent {
                return fail(format!("stale use {u:?} recorded on {v}"));
            }
        }
    }
    Ok(())
}

fn fits(graph: &Graph, from: ValueId, to: &Type) -> bool {
    graph.value_type(from).is_subtype_of(to)
}

fn verify_structure(graph: &Graph, node: NodeId) -> Result<()> {
    let n = graph.node(node);
    let block_count = match n.kind {
        NodeKind::If => 2,
        NodeKind::Loop | NodeKind::Fork | NodeKind::FusionGroup => 1,
        _ => 0,
    };
    if n.blocks.len() != block_count {
        return fail(format!(
            "{node} ({}) owns {} block(s), expected {block_count}",
            n.kind.name(),
            n.blocks.len()
        ));
    }
    match &n.kind {
        NodeKind::Op(schema) => {
            if n.inputs.len() != schema.arguments.len() {
                return fail(format!(
                    "{node} ({}) has {} input(s) but the schema takes {}",
                    schema.qualified_name(),
                    n.inputs.len(),
                    schema.arguments.len()
                ));
            }
            for (arg, &v) in schema.arguments.iter().zip(&n.inputs) {
                if !accepts(&arg.ty, graph.value_type(v)) {
                    return fail(format!(
                        "{node} ({}) argument '{}' expects {} but got {}",
                        schema.qualified_name(),
                        arg.name,
                        arg.ty,
                        graph.value_type(v)
                    ));
                }
            }
        }
        NodeKind::If => {
            if n.inputs.is_empty() || *graph.value_type(n.inputs[0]) != Type::Bool {
                return fail(format!("{node} (If) needs a bool condition"));
            }
            for &b in &n.blocks {
                let block = graph.block(b);
                if block.params.len() != n.inputs.len() - 1 || block.returns.len() != n.outputs.len() {
                    return fail(format!("{node} (If) block {b} does not match the node arity"));
                }
                for (&r, &o) in block.returns.iter().zip(&n.outputs) {
                    if !fits(graph, r, graph.value_type(o)) {
                        return fail(format!("{node} (If) branch result {r} does not fit output {o}"));
                    }
                }
            }
        }
        NodeKind::Loop => {
            let carried = n.outputs.len();
            let body = graph.block(n.blocks[0]);
            if n.inputs.len() < 2 + carried
                || body.params.len() != n.inputs.len() - 1
                || body.returns.len() != 1 + carried
            {
                return fail(format!("{node} (Loop) does not match the loop conventions"));
            }
            for j in 0..carried {
                let out_ty = graph.value_type(n.outputs[j]);
                if !fits(graph, n.inputs[2 + j], out_ty) || !fits(graph, body.returns[1 + j], out_ty) {
                    return fail(format!("{node} (Loop) carried value {j} changes type"));
                }
            }
        }
        NodeKind::Fork => {
            let body = graph.block(n.blocks[0]);
            let ok = body.params.len() == n.inputs.len()
                && body.returns.len() == 1
                && n.outputs.len() == 1
                && matches!(graph.value_type(n.outputs[0]), Type::Future(_));
            if !ok {
                return fail(format!("{node} (Fork) does not match the fork conventions"));
            }
        }
        NodeKind::FusionGroup => {
            let body = graph.block(n.blocks[0]);
            if body.params.len() != n.inputs.len() || body.returns.len() != n.outputs.len() {
                return fail(format!("{node} (FusionGroup) does not match its body"));
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InsertPoint;

    #[test]
    fn test_accepts_well_formed_graph() {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), Some("x"));
        let top = g.top();
        let n = g.insert_op(InsertPoint::End(top), "relu", &[x], &[]).unwrap();
        let out = g.node(n).outputs[0];
        g.set_outputs(&[out]);
        assert!(verify(&g).is_ok());
    }

    #[test]
    fn test_rejects_implicit_capture() {
        let mut g = Graph::new();
        let c = g.add_input(Type::Bool, Some("c"));
        let x = g.add_input(Type::tensor(), Some("x"));
        let top = g.top();
        let node = g.insert(InsertPoint::End(top), NodeKind::If, &[c], vec![]);
        let t = g.add_block(node);
        let e = g.add_block(node);
        let r = g.insert_op(InsertPoint::End(t), "relu", &[x], &[]).unwrap();
        let r = g.node(r).outputs[0];
        g.add_block_return(t, r);
        g.add_block_return(e, x);
        let out = g.add_node_output(node, Type::tensor());
        g.set_outputs(&[out]);
        let err = verify(&g).unwrap_err();
        assert!(err.to_string().contains("not visible"));
    }
}
