// Constant propagation
//
// Evaluates pure operators whose inputs are all constants and simplifies
// control flow with constant conditions:
//
//   add.int(2, 3)              ─►  5
//   If(True) { A } else { B }  ─►  A spliced in place
//   Loop(0, ...) / Loop(_, False, ...)  ─►  carried inputs
//   IsNone(%x : Tensor)        ─►  False
//
// Which operators may be evaluated is decided by a ConstantFolder. The
// default ScalarFolder handles int / float / bool / str operators; tensor
// operators are never folded at compile time.

use crate::graph::{Constant, Graph, InsertPoint, NodeId, NodeKind};
use crate::scalar::eval_scalar;
use crate::schema::FunctionSchema;
use crate::types::Type;

/// Decides whether an operator application on constants is evaluated.
pub trait ConstantFolder {
    fn fold(&self, schema: &FunctionSchema, inputs: &[Constant]) -> Option<Constant>;
}

/// Folds scalar operators with the runtime's scalar semantics. Operators
/// that would fail at run time (division by zero, overflow) are left alone
/// so the error surfaces when the program runs.
pub struct ScalarFolder;

impl ConstantFolder for ScalarFolder {
    fn fold(&self, schema: &FunctionSchema, inputs: &[Constant]) -> Option<Constant> {
        let c = eval_scalar(&schema.name, inputs)?.ok()?;
        match (&schema.returns, c) {
            (Type::Float, Constant::Int(n)) => Some(Constant::Float(n as f64)),
            (ret, c) if c.type_of().is_subtype_of(ret) => Some(c),
            _ => None,
        }
    }
}

/// Propagate constants with the [`ScalarFolder`].
pub fn propagate_constants(graph: &mut Graph) -> usize {
    propagate_constants_with(graph, &ScalarFolder)
}

pub fn propagate_constants_with(graph: &mut Graph, folder: &dyn ConstantFolder) -> usize {
    let mut changed = 0;
    for node in graph.walk(graph.top()) {
        if !graph.node(node).alive {
            continue;
        }
        let done = match &graph.node(node).kind {
            NodeKind::Op(schema) if schema.flags.pure => {
                let schema = schema.clone();
                fold_op(graph, node, &schema, folder)
            }
            NodeKind::If => fold_if(graph, node),
            NodeKind::Loop => fold_loop(graph, node),
            NodeKind::IsNone => fold_is_none(graph, node),
            _ => false,
        };
        if done {
            changed += 1;
        }
    }
    if changed > 0 {
        log::trace!("constant propagation: {changed} node(s) folded");
    }
    changed
}

fn replace_with_constant(graph: &mut Graph, node: NodeId, c: Constant) {
    let out = graph.node(node).outputs[0];
    let ty = graph.value_type(out).clone();
    let natural = c.type_of();
    let ty = if natural.is_subtype_of(&ty) { natural } else { ty };
    let v = graph.insert_constant_typed(InsertPoint::Before(node), c, ty);
    graph.replace_all_uses_with(out, v);
    graph.erase_node(node);
}

fn fold_op(graph: &mut Graph, node: NodeId, schema: &FunctionSchema, folder: &dyn ConstantFolder) -> bool {
    if graph.node(node).outputs.len() != 1 {
        return false;
    }
    let inputs: Option<Vec<Constant>> = graph
        .node(node)
        .inputs
        .iter()
        .map(|&v| graph.constant_of(v).cloned())
        .collect();
    let Some(c) = inputs.and_then(|inputs| folder.fold(schema, &inputs)) else {
        return false;
    };
    replace_with_constant(graph, node, c);
    true
}

fn fold_if(graph: &mut Graph, node: NodeId) -> bool {
    let cond = graph.node(node).inputs[0];
    let Some(taken) = graph.constant_of(cond).and_then(Constant::as_bool) else {
        return false;
    };
    let captures = graph.node(node).inputs[1..].to_vec();
    let rets = graph.inline_block_before(node, usize::from(!taken), &captures);
    for (o, r) in graph.node(node).outputs.clone().into_iter().zip(rets) {
        graph.replace_all_uses_with(o, r);
    }
    graph.erase_node(node);
    true
}

fn fold_loop(graph: &mut Graph, node: NodeId) -> bool {
    let n = graph.node(node);
    let never_runs = graph.constant_of(n.inputs[0]).and_then(Constant::as_int) == Some(0)
        || graph.constant_of(n.inputs[1]).and_then(Constant::as_bool) == Some(false);
    if !never_runs {
        return false;
    }
    let carried = n.inputs[2..2 + n.outputs.len()].to_vec();
    for (o, init) in graph.node(node).outputs.clone().into_iter().zip(carried) {
        graph.replace_all_uses_with(o, init);
    }
    graph.erase_node(node);
    true
}

fn fold_is_none(graph: &mut Graph, node: NodeId) -> bool {
    let v = graph.node(node).inputs[0];
    let answer = match graph.constant_of(v) {
        Some(c) => c.is_none(),
        None if !graph.value_type(v).may_be_none() => false,
        None => return false,
    };
    replace_with_constant(graph, node, Constant::Bool(answer));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folds_integer_arithmetic() {
        let mut g = Graph::new();
        let top = g.top();
        let a = g.insert_constant(InsertPoint::End(top), Constant::Int(2));
        let b = g.insert_constant(InsertPoint::End(top), Constant::Int(3));
        let n = g.insert_op(InsertPoint::End(top), "mul", &[a, b], &[]).unwrap();
        let out = g.node(n).outputs[0];
        g.set_outputs(&[out]);
        assert_eq!(propagate_constants(&mut g), 1);
        let result = g.outputs()[0];
        assert_eq!(g.constant_of(result).and_then(Constant::as_int), Some(6));
    }

    #[test]
    fn test_division_by_zero_is_not_folded() {
        let mut g = Graph::new();
        let top = g.top();
        let a = g.insert_constant(InsertPoint::End(top), Constant::Int(1));
        let b = g.insert_constant(InsertPoint::End(top), Constant::Int(0));
        let n = g.insert_op(InsertPoint::End(top), "floordiv", &[a, b], &[]).unwrap();
        let out = g.node(n).outputs[0];
        g.set_outputs(&[out]);
        assert_eq!(propagate_constants(&mut g), 0);
    }

    #[test]
    fn test_constant_branch_is_inlined() {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), Some("x"));
        let top = g.top();
        let c = g.insert_constant(InsertPoint::End(top), Constant::Bool(false));
        let node = g.insert(InsertPoint::End(top), NodeKind::If, &[c, x], vec![]);
        let t = g.add_block(node);
        let e = g.add_block(node);
        let pt = g.add_block_param(t, Type::tensor());
        let pe = g.add_block_param(e, Type::tensor());
        let r = g.insert_op(InsertPoint::End(t), "relu", &[pt], &[]).unwrap();
        let r = g.node(r).outputs[0];
        let s = g.insert_op(InsertPoint::End(e), "exp", &[pe], &[]).unwrap();
        let s_out = g.node(s).outputs[0];
        g.add_block_return(t, r);
        g.add_block_return(e, s_out);
        let out = g.add_node_output(node, Type::tensor());
        g.set_outputs(&[out]);

        assert_eq!(propagate_constants(&mut g), 1);
        assert!(!g.node(node).alive);
        assert_eq!(g.outputs(), &[s_out]);
        assert_eq!(g.node(s).inputs, vec![x]);
        assert_eq!(g.node(s).owner, top);
    }
}
