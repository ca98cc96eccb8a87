// Peephole: local rewrites on containers, optionals and tensor metadata
//
//   TupleIndex[i](TupleConstruct(a, b, ..))   ─►  input i
//   TupleUnpack(TupleConstruct(a, b, ..))     ─►  a, b, ..
//   ListIndex(ListConstruct(..), k)           ─►  element k   (k constant, in range)
//   len(ListConstruct(a, b, ..))              ─►  n
//   __not__(__not__(x))                       ─►  x
//   UnwrapOptional(x : T)                     ─►  x           (T not optional)
//   dim(x) / size(x) / numel(x)               ─►  constants   (known from the type)

use crate::graph::{Constant, Graph, InsertPoint, NodeId, NodeKind, ValueId};

/// Apply local rewrites everywhere. Returns the number of nodes replaced.
pub fn peephole(graph: &mut Graph) -> usize {
    let mut changed = 0;
    for node in graph.walk(graph.top()) {
        if !graph.node(node).alive {
            continue;
        }
        if let Some(replacement) = rewrite(graph, node) {
            let outs = graph.node(node).outputs.clone();
            for (o, r) in outs.into_iter().zip(replacement) {
                graph.replace_all_uses_with(o, r);
            }
            graph.erase_node(node);
            changed += 1;
        }
    }
    if changed > 0 {
        log::trace!("peephole: {changed} rewrite(s)");
    }
    changed
}

fn producer_kind(graph: &Graph, v: ValueId) -> Option<(&NodeKind, NodeId)> {
    let p = graph.producer(v)?;
    Some((&graph.node(p).kind, p))
}

/// Values replacing each output of `node`, if a rewrite applies.
fn rewrite(graph: &mut Graph, node: NodeId) -> Option<Vec<ValueId>> {
    let n = graph.node(node);
    let first = n.inputs.first().copied();
    match &n.kind {
        NodeKind::TupleIndex { index } => {
            let index = *index;
            let (kind, p) = producer_kind(graph, first?)?;
            match kind {
                NodeKind::TupleConstruct | NodeKind::NamedTupleConstruct => {
                    graph.node(p).inputs.get(index).map(|&v| vec![v])
                }
                _ => None,
            }
        }
        NodeKind::TupleUnpack => {
            let (kind, p) = producer_kind(graph, first?)?;
            let items = &graph.node(p).inputs;
            let fits = matches!(kind, NodeKind::TupleConstruct | NodeKind::NamedTupleConstruct)
                && items.len() == n.outputs.len();
            fits.then(|| items.clone())
        }
        NodeKind::ListIndex => {
            let (kind, p) = producer_kind(graph, first?)?;
            if !matches!(kind, NodeKind::ListConstruct) {
                return None;
            }
            let items = &graph.node(p).inputs;
            let k = graph.constant_of(n.inputs[1])?.as_int()?;
            let k = if k < 0 { k + items.len() as i64 } else { k };
            let k = usize::try_from(k).ok()?;
            items.get(k).map(|&v| vec![v])
        }
        NodeKind::UnwrapOptional => {
            let v = first?;
            (!graph.value_type(v).may_be_none()).then(|| vec![v])
        }
        NodeKind::Op(schema) => {
            let qualified = schema.qualified_name();
            rewrite_op(graph, node, &qualified)
        }
        _ => None,
    }
}

fn rewrite_op(graph: &mut Graph, node: NodeId, op: &str) -> Option<Vec<ValueId>> {
    let x = *graph.node(node).inputs.first()?;
    let folded = match op {
        "__not__" => {
            let inner = graph.node(graph.producer(x)?);
            return inner
                .kind
                .as_op()
                .filter(|s| s.name == "__not__")
                .map(|_| vec![inner.inputs[0]]);
        }
        "len.t" => {
            let (kind, p) = producer_kind(graph, x)?;
            if !matches!(kind, NodeKind::ListConstruct) {
                return None;
            }
            Constant::Int(graph.node(p).inputs.len() as i64)
        }
        "dim" => Constant::Int(graph.value_type(x).as_tensor()?.rank()? as i64),
        "size" => {
            let sizes = graph.value_type(x).as_tensor()?.concrete_sizes()?;
            Constant::IntList(sizes.into_iter().map(|d| d as i64).collect())
        }
        "numel" => {
            let sizes = graph.value_type(x).as_tensor()?.concrete_sizes()?;
            Constant::Int(sizes.iter().product::<usize>() as i64)
        }
        "size.int" => {
            let t = graph.value_type(x).as_tensor()?;
            let sizes = t.sizes.as_ref()?;
            let d = graph.constant_of(graph.node(node).inputs[1])?.as_int()?;
            let d = if d < 0 { d + sizes.len() as i64 } else { d };
            let size = (*sizes.get(usize::try_from(d).ok()?)?)?;
            Constant::Int(size as i64)
        }
        _ => return None,
    };
    Some(vec![graph.insert_constant(InsertPoint::Before(node), folded)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TensorType, Type};

    #[test]
    fn test_tuple_index_of_construct() {
        let mut g = Graph::new();
        let a = g.add_input(Type::Int, Some("a"));
        let b = g.add_input(Type::Str, Some("b"));
        let top = g.top();
        let t = g.insert(
            InsertPoint::End(top),
            NodeKind::TupleConstruct,
            &[a, b],
            vec![Type::Tuple(vec![Type::Int, Type::Str])],
        );
        let tv = g.node(t).outputs[0];
        let i = g.insert(InsertPoint::End(top), NodeKind::TupleIndex { index: 1 }, &[tv], vec![Type::Str]);
        let iv = g.node(i).outputs[0];
        g.set_outputs(&[iv]);
        assert_eq!(peephole(&mut g), 1);
        assert_eq!(g.outputs(), &[b]);
    }

    #[test]
    fn test_double_negation() {
        let mut g = Graph::new();
        let c = g.add_input(Type::Bool, Some("c"));
        let top = g.top();
        let n1 = g.insert_op(InsertPoint::End(top), "__not__", &[c], &[]).unwrap();
        let v1 = g.node(n1).outputs[0];
        let n2 = g.insert_op(InsertPoint::End(top), "__not__", &[v1], &[]).unwrap();
        let v2 = g.node(n2).outputs[0];
        g.set_outputs(&[v2]);
        assert_eq!(peephole(&mut g), 1);
        assert_eq!(g.outputs(), &[c]);
    }

    #[test]
    fn test_known_sizes_fold() {
        let mut g = Graph::new();
        let ty = Type::Tensor(TensorType {
            sizes: Some(vec![Some(2), Some(3)]),
            ..TensorType::default()
        });
        let x = g.add_input(ty, Some("x"));
        let top = g.top();
        let n = g.insert_op(InsertPoint::End(top), "numel", &[x], &[]).unwrap();
        let v = g.node(n).outputs[0];
        g.set_outputs(&[v]);
        assert_eq!(peephole(&mut g), 1);
        let out = g.outputs()[0];
        assert_eq!(g.constant_of(out).and_then(Constant::as_int), Some(6));
    }

    #[test]
    fn test_unwrap_of_non_optional_is_identity() {
        let mut g = Graph::new();
        let x = g.add_input(Type::Int, Some("x"));
        let top = g.top();
        let n = g.insert(InsertPoint::End(top), NodeKind::UnwrapOptional, &[x], vec![Type::Int]);
        let v = g.node(n).outputs[0];
        g.set_outputs(&[v]);
        assert_eq!(peephole(&mut g), 1);
        assert_eq!(g.outputs(), &[x]);
    }
}
