// Inlining: replace calls by the body of the callee
//
//   %r = CallFunction[name="helper"](%a, %b)
//
// becomes a copy of helper's graph, with its inputs bound to %a, %b and %r
// redirected to what the copy returns. Methods are found through the class
// of the receiver (`Class.method`). Calls introduced by an inlined body are
// inlined in the next round.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::graph::{Graph, InsertPoint, NodeId, NodeKind};

/// Bound on inlining rounds; deeper call chains are reported as recursion.
const MAX_ROUNDS: usize = 64;

/// Inline every call whose callee `lookup` can provide. Returns the number
/// of call sites inlined.
pub fn inline_calls(graph: &mut Graph, lookup: &dyn Fn(&str) -> Option<Arc<Graph>>) -> Result<usize> {
    let mut total = 0;
    for _ in 0..MAX_ROUNDS {
        let mut inlined = 0;
        for node in graph.walk(graph.top()) {
            if !graph.node(node).alive {
                continue;
            }
            let Some(callee) = callee_name(graph, node) else {
                continue;
            };
            let Some(body) = lookup(&callee) else {
                continue;
            };
            inline_one(graph, node, &body)?;
            log::trace!("inlined call to '{callee}'");
            inlined += 1;
        }
        if inlined == 0 {
            return Ok(total);
        }
        total += inlined;
    }
    Err(Error::msg(format!(
        "inlining did not terminate after {MAX_ROUNDS} rounds; recursive calls cannot be inlined"
    )))
}

/// Qualified name of the function a call node invokes.
fn callee_name(graph: &Graph, node: NodeId) -> Option<String> {
    let n = graph.node(node);
    match &n.kind {
        NodeKind::CallFunction { name } => Some(name.clone()),
        NodeKind::CallMethod { name } => {
            let receiver = *n.inputs.first()?;
            let class = graph.value_type(receiver).as_class()?;
            Some(class.method_qualname(name))
        }
        _ => None,
    }
}

fn inline_one(graph: &mut Graph, call: NodeId, body: &Graph) -> Result<()> {
    let args = graph.node(call).inputs.clone();
    if args.len() != body.inputs().len() {
        return Err(Error::msg(format!(
            "call passes {} argument(s) but the callee takes {}",
            args.len(),
            body.inputs().len()
        )));
    }
    let mut env: HashMap<_, _> = body.inputs().iter().copied().zip(args).collect();
    let rets = graph.copy_block_body(body, body.top(), InsertPoint::Before(call), &mut env)?;
    let outs = graph.node(call).outputs.clone();
    for (o, r) in outs.into_iter().zip(rets) {
        graph.replace_all_uses_with(o, r);
    }
    graph.erase_node(call);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn helper() -> Arc<Graph> {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), Some("x"));
        let top = g.top();
        let n = g.insert_op(InsertPoint::End(top), "relu", &[x], &[]).unwrap();
        let out = g.node(n).outputs[0];
        g.set_outputs(&[out]);
        Arc::new(g)
    }

    #[test]
    fn test_inlines_function_call() {
        let mut g = Graph::new();
        let a = g.add_input(Type::tensor(), Some("a"));
        let top = g.top();
        let call = g.insert(
            InsertPoint::End(top),
            NodeKind::CallFunction { name: "helper".into() },
            &[a],
            vec![Type::tensor()],
        );
        let out = g.node(call).outputs[0];
        g.set_outputs(&[out]);

        let body = helper();
        let n = inline_calls(&mut g, &|name| (name == "helper").then(|| body.clone())).unwrap();
        assert_eq!(n, 1);
        assert!(!g.node(call).alive);
        let relu = g.block(top).nodes[0];
        assert_eq!(g.node(relu).kind.name(), "relu");
        assert_eq!(g.node(relu).inputs, vec![a]);
        assert_eq!(g.outputs(), g.node(relu).outputs.as_slice());
    }

    #[test]
    fn test_unknown_callee_is_left_alone() {
        let mut g = Graph::new();
        let a = g.add_input(Type::tensor(), Some("a"));
        let top = g.top();
        let call = g.insert(
            InsertPoint::End(top),
            NodeKind::CallFunction { name: "other".into() },
            &[a],
            vec![Type::tensor()],
        );
        let out = g.node(call).outputs[0];
        g.set_outputs(&[out]);
        assert_eq!(inline_calls(&mut g, &|_| None).unwrap(), 0);
        assert!(g.node(call).alive);
    }
}
