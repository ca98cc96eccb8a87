// Shape analysis: refine tensor types from a concrete input signature
//
// Given the observed types of the graph inputs (dtype, sizes, device), types
// are pushed forward through the operators whose result shape is a function
// of their input shapes:
//
//   pointwise (binary)   broadcast(lhs, rhs), promoted dtype
//   pointwise (unary)    same sizes; transcendental ops produce floats
//   comparisons          broadcast sizes, bool dtype
//   matmul               [m, k] x [k, n] -> [m, n]
//   sum / mean / max     rank 0
//   clone / detach / t   same, or transposed
//
// If outputs merge the refinements of both branches. Loop-carried values
// are left as they are (they may change shape across iterations); loop
// captures are refined. Refinement only narrows types, so a graph that was
// well typed stays well typed.

use kestrel_core::{DType, Shape};

use crate::graph::{BlockId, Graph, NodeId, NodeKind, ValueId};
use crate::types::{TensorType, Type};

/// Refine value types of `graph` for inputs of the given types. Returns the
/// number of values whose type was narrowed.
pub fn propagate_shapes(graph: &mut Graph, input_types: &[Type]) -> usize {
    let mut refined = 0;
    for (v, ty) in graph.inputs().to_vec().into_iter().zip(input_types) {
        if narrow(graph, v, ty.clone()) {
            refined += 1;
        }
    }
    refined += propagate_block(graph, graph.top());
    if refined > 0 {
        log::trace!("shape analysis: {refined} value(s) refined");
    }
    refined
}

fn narrow(graph: &mut Graph, v: ValueId, ty: Type) -> bool {
    if &ty == graph.value_type(v) || !ty.is_subtype_of(graph.value_type(v)) {
        return false;
    }
    graph.set_type(v, ty).is_ok()
}

fn propagate_block(graph: &mut Graph, block: BlockId) -> usize {
    let mut refined = 0;
    for node in graph.block(block).nodes.clone() {
        refined += propagate_node(graph, node);
    }
    refined
}

fn propagate_node(graph: &mut Graph, node: NodeId) -> usize {
    let mut refined = 0;
    let n = graph.node(node).clone();
    match &n.kind {
        NodeKind::If => {
            for &b in &n.blocks {
                refined += refine_params(graph, b, &n.inputs[1..], 0);
                refined += propagate_block(graph, b);
            }
            for (i, &o) in n.outputs.iter().enumerate() {
                let merged = n
                    .blocks
                    .iter()
                    .map(|&b| graph.value_type(graph.block(b).returns[i]).as_tensor().cloned())
                    .reduce(|a, b| Some(a?.merge(&b?)));
                if let Some(Some(t)) = merged {
                    refined += usize::from(narrow(graph, o, Type::Tensor(t)));
                }
            }
        }
        NodeKind::Loop => {
            let carried = n.outputs.len();
            let body = n.blocks[0];
            refined += refine_params(graph, body, &n.inputs[2 + carried..], 1 + carried);
            refined += propagate_block(graph, body);
        }
        NodeKind::Fork | NodeKind::FusionGroup => {
            for &b in &n.blocks {
                refined += refine_params(graph, b, &n.inputs, 0);
                refined += propagate_block(graph, b);
            }
        }
        NodeKind::Op(schema) if n.outputs.len() == 1 => {
            let inputs: Vec<Type> = n.inputs.iter().map(|&v| graph.value_type(v).clone()).collect();
            if let Some(t) = infer_op(&schema.name, schema.flags.pointwise, &inputs) {
                refined += usize::from(narrow(graph, n.outputs[0], Type::Tensor(t)));
            }
        }
        _ => {}
    }
    refined
}

/// Give block params starting at `offset` the types of the node inputs that
/// feed them.
fn refine_params(graph: &mut Graph, block: BlockId, feeding: &[ValueId], offset: usize) -> usize {
    let params = graph.block(block).params.clone();
    let mut refined = 0;
    for (&p, &v) in params.iter().skip(offset).zip(feeding) {
        let ty = graph.value_type(v).clone();
        refined += usize::from(narrow(graph, p, ty));
    }
    refined
}

const TO_FLOAT: &[&str] = &["exp", "log", "sqrt", "sigmoid", "tanh", "gelu", "elu", "div"];
const COMPARISONS: &[&str] = &["eq", "ne", "lt", "le", "gt", "ge"];

fn infer_op(name: &str, pointwise: bool, inputs: &[Type]) -> Option<TensorType> {
    let first = inputs.first()?.as_tensor()?;
    if pointwise {
        let mut out = first.clone();
        out.requires_grad = None;
        if let Some(other) = inputs.get(1) {
            match other {
                Type::Tensor(rhs) => {
                    out.sizes = broadcast(first, rhs);
                    out.dtype = first.dtype.zip(rhs.dtype).map(|(a, b)| a.promote(b));
                    if out.device != rhs.device {
                        out.device = None;
                    }
                }
                Type::Float => out.dtype = first.dtype.map(DType::to_float),
                Type::Int | Type::Bool => {}
                _ => out.dtype = None,
            }
        }
        if COMPARISONS.contains(&name) {
            out.dtype = Some(DType::Bool);
        } else if TO_FLOAT.contains(&name) {
            out.dtype = out.dtype.map(DType::to_float);
        }
        return Some(out);
    }
    match name {
        "clone" => Some(TensorType { requires_grad: None, ..first.clone() }),
        "detach" => Some(TensorType { requires_grad: Some(false), ..first.clone() }),
        "t" => {
            let mut out = first.clone();
            out.requires_grad = None;
            if let Some(sizes) = out.sizes.as_mut() {
                sizes.reverse();
            }
            Some(out)
        }
        "sum" | "max" | "mean" if inputs.len() == 1 => {
            let dtype = match name {
                "mean" => first.dtype.map(DType::to_float),
                _ => first.dtype,
            };
            Some(TensorType {
                dtype,
                sizes: Some(Vec::new()),
                device: first.device,
                requires_grad: None,
            })
        }
        "matmul" => {
            let rhs = inputs.get(1)?.as_tensor()?;
            let (a, b) = (first.sizes.as_ref()?, rhs.sizes.as_ref()?);
            let sizes = match (a.as_slice(), b.as_slice()) {
                ([m, _], [_, n]) => vec![*m, *n],
                ([m, _], [_]) => vec![*m],
                _ => return None,
            };
            Some(TensorType {
                dtype: first.dtype.zip(rhs.dtype).map(|(a, b)| a.promote(b)),
                sizes: Some(sizes),
                device: first.device,
                requires_grad: None,
            })
        }
        _ => None,
    }
}

/// Broadcast sizes when both operands are fully known.
fn broadcast(lhs: &TensorType, rhs: &TensorType) -> Option<Vec<Option<usize>>> {
    let l = Shape::new(lhs.concrete_sizes()?);
    let r = Shape::new(rhs.concrete_sizes()?);
    let out = Shape::broadcast_shape(&l, &r).ok()?;
    Some(out.dims().iter().map(|&d| Some(d)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InsertPoint;

    fn sized(dtype: DType, sizes: &[usize]) -> Type {
        Type::Tensor(TensorType {
            dtype: Some(dtype),
            sizes: Some(sizes.iter().map(|&d| Some(d)).collect()),
            device: None,
            requires_grad: None,
        })
    }

    #[test]
    fn test_broadcast_and_promote() {
        let mut g = Graph::new();
        let a = g.add_input(Type::tensor(), Some("a"));
        let b = g.add_input(Type::tensor(), Some("b"));
        let top = g.top();
        let n = g.insert_op(InsertPoint::End(top), "add", &[a, b], &[]).unwrap();
        let out = g.node(n).outputs[0];
        g.set_outputs(&[out]);

        let refined = propagate_shapes(&mut g, &[sized(DType::I64, &[2, 1]), sized(DType::F32, &[3])]);
        assert_eq!(refined, 3);
        let t = g.value_type(out).as_tensor().unwrap();
        assert_eq!(t.concrete_sizes(), Some(vec![2, 3]));
        assert_eq!(t.dtype, Some(DType::F32));
    }

    #[test]
    fn test_matmul_and_reduction() {
        let mut g = Graph::new();
        let a = g.add_input(Type::tensor(), Some("a"));
        let b = g.add_input(Type::tensor(), Some("b"));
        let top = g.top();
        let mm = g.insert_op(InsertPoint::End(top), "matmul", &[a, b], &[]).unwrap();
        let mv = g.node(mm).outputs[0];
        let s = g.insert_op(InsertPoint::End(top), "sum", &[mv], &[]).unwrap();
        let sv = g.node(s).outputs[0];
        g.set_outputs(&[sv]);

        propagate_shapes(&mut g, &[sized(DType::F32, &[2, 4]), sized(DType::F32, &[4, 5])]);
        assert_eq!(g.value_type(mv).as_tensor().unwrap().concrete_sizes(), Some(vec![2, 5]));
        assert_eq!(g.value_type(sv).as_tensor().unwrap().rank(), Some(0));
    }

    #[test]
    fn test_comparison_yields_bool() {
        let mut g = Graph::new();
        let a = g.add_input(Type::tensor(), Some("a"));
        let top = g.top();
        let two = g.insert_constant(InsertPoint::End(top), crate::graph::Constant::Int(2));
        let n = g.insert_op(InsertPoint::End(top), "gt", &[a, two], &[]).unwrap();
        let out = g.node(n).outputs[0];
        g.set_outputs(&[out]);
        propagate_shapes(&mut g, &[sized(DType::F32, &[3])]);
        assert_eq!(g.value_type(out).as_tensor().unwrap().dtype, Some(DType::Bool));
    }
}
