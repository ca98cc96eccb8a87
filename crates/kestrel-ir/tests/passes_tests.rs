// Integration tests for graph passes on compiled functions

use std::collections::BTreeSet;
use std::sync::Arc;

use kestrel_core::DType;
use kestrel_ir::passes::{self, PointwiseFusion};
use kestrel_ir::{CompilationUnit, Graph, NodeKind, TensorType, Type};

fn compile(source: &str) -> CompilationUnit {
    let mut unit = CompilationUnit::new();
    unit.define(source).unwrap();
    unit
}

fn graph_of(unit: &CompilationUnit, name: &str) -> Graph {
    (*unit.find_function(name).unwrap().graph).clone()
}

fn count(graph: &Graph, pred: impl Fn(&NodeKind) -> bool) -> usize {
    graph
        .walk(graph.top())
        .iter()
        .filter(|&&n| pred(&graph.node(n).kind))
        .count()
}

fn refined(dtype: DType, sizes: &[usize]) -> Type {
    Type::Tensor(TensorType {
        dtype: Some(dtype),
        sizes: Some(sizes.iter().map(|&s| Some(s)).collect()),
        device: None,
        requires_grad: None,
    })
}

// Inlining

#[test]
fn test_inline_nested_calls() {
    let unit = compile(
        r#"
        def inner(x: Tensor) -> Tensor { return x.relu(); }
        def middle(x: Tensor) -> Tensor { return inner(x) + 1; }
        def outer(x: Tensor) -> Tensor { return middle(x) * 2; }
        "#,
    );
    let mut g = graph_of(&unit, "outer");
    let lookup = |name: &str| unit.find_function(name).map(|f| f.graph.clone());
    let inlined = passes::inline_calls(&mut g, &lookup).unwrap();
    assert_eq!(inlined, 2);
    assert_eq!(count(&g, |k| matches!(k, NodeKind::CallFunction { .. })), 0);
    kestrel_ir::verify(&g).unwrap();
}

#[test]
fn test_inline_method_through_receiver_class() {
    let unit = compile(
        r#"
        class Block {
            param w: Tensor;
            def scale(self, x: Tensor) -> Tensor { return x * self.w; }
            def forward(self, x: Tensor) -> Tensor { return self.scale(x) + 1; }
        }
        "#,
    );
    let mut g = graph_of(&unit, "Block.forward");
    let lookup = |name: &str| unit.find_function(name).map(|f| f.graph.clone());
    assert_eq!(passes::inline_calls(&mut g, &lookup).unwrap(), 1);
    assert_eq!(count(&g, |k| matches!(k, NodeKind::CallMethod { .. })), 0);
    assert_eq!(count(&g, |k| matches!(k, NodeKind::GetAttr { .. })), 1);
}

// Cleanup pipeline

#[test]
fn test_optimize_takes_constant_branch() {
    let unit = compile(
        r#"
        def f(x: Tensor) -> Tensor {
            flag = True;
            if flag { return x + 1; } else { return x - 1; }
        }
        "#,
    );
    let mut g = graph_of(&unit, "f");
    passes::optimize_graph(&mut g);
    assert_eq!(count(&g, |k| matches!(k, NodeKind::If)), 0);
    let ops: Vec<String> = g
        .walk(g.top())
        .iter()
        .filter_map(|&n| g.node(n).kind.as_op().map(|s| s.name.clone()))
        .collect();
    assert_eq!(ops, vec!["add"]);
    kestrel_ir::verify(&g).unwrap();
}

#[test]
fn test_cse_merges_repeated_expressions() {
    let unit = compile(
        r#"
        def f(x: Tensor) -> Tensor {
            a = x.relu() * 2;
            b = x.relu() * 2;
            return a + b;
        }
        "#,
    );
    let mut g = graph_of(&unit, "f");
    passes::optimize_graph(&mut g);
    let relus = count(&g, |k| k.as_op().is_some_and(|s| s.name == "relu"));
    assert_eq!(relus, 1);
}

#[test]
fn test_in_place_ops_are_kept() {
    let unit = compile(
        r#"
        def f(x: Tensor) -> Tensor {
            y = x.relu_();
            return x;
        }
        "#,
    );
    let mut g = graph_of(&unit, "f");
    passes::optimize_graph(&mut g);
    assert_eq!(count(&g, |k| k.as_op().is_some_and(|s| s.name == "relu_")), 1);
}

// Shapes and fusion

#[test]
fn test_shapes_flow_through_pointwise_and_matmul() {
    let unit = compile(
        r#"
        def f(a: Tensor, b: Tensor) -> Tensor {
            return (a.matmul(b) + 1).relu();
        }
        "#,
    );
    let mut g = graph_of(&unit, "f");
    passes::propagate_shapes(&mut g, &[refined(DType::F32, &[2, 3]), refined(DType::F32, &[3, 4])]);
    let out = g.value_type(g.outputs()[0]).as_tensor().unwrap().clone();
    assert_eq!(out.concrete_sizes(), Some(vec![2, 4]));
    assert_eq!(out.dtype, Some(DType::F32));
}

#[test]
fn test_fusion_groups_pointwise_chain() {
    let unit = compile(
        r#"
        def f(x: Tensor, y: Tensor) -> Tensor {
            return ((x * y) + 1).sigmoid();
        }
        "#,
    );
    let mut g = graph_of(&unit, "f");
    let groups = passes::fuse_pointwise(&mut g, &PointwiseFusion::default());
    assert_eq!(groups, 1);
    assert_eq!(count(&g, |k| matches!(k, NodeKind::FusionGroup)), 1);
    let top_ops = g
        .block(g.top())
        .nodes
        .iter()
        .filter(|&&n| g.node(n).kind.as_op().is_some())
        .count();
    assert_eq!(top_ops, 0);
    kestrel_ir::verify(&g).unwrap();
}

#[test]
fn test_shape_bound_fusion_needs_known_sizes() {
    let unit = compile("def f(x: Tensor) -> Tensor { return (x + 1).relu(); }");
    let policy = PointwiseFusion {
        require_complete_shapes: true,
        ..PointwiseFusion::default()
    };
    let mut unknown = graph_of(&unit, "f");
    assert_eq!(passes::fuse_pointwise(&mut unknown, &policy), 0);

    let mut known = graph_of(&unit, "f");
    passes::propagate_shapes(&mut known, &[refined(DType::F32, &[4])]);
    assert_eq!(passes::fuse_pointwise(&mut known, &policy), 1);
}

// Alias analysis

#[test]
fn test_mutated_attributes_of_method() {
    let unit = compile(
        r#"
        class Counter {
            buffer steps: Tensor;
            param weight: Tensor;
            def forward(self, x: Tensor) -> Tensor {
                self.steps.add_(1);
                return x * self.weight;
            }
        }
        "#,
    );
    let g = graph_of(&unit, "Counter.forward");
    let written = passes::mutated_attributes(&g, g.inputs()[0]);
    assert_eq!(written, BTreeSet::from([vec!["steps".to_string()]]));
}

#[test]
fn test_lookup_unknown_callee_leaves_call() {
    let unit = compile(
        r#"
        def helper(x: Tensor) -> Tensor { return x; }
        def f(x: Tensor) -> Tensor { return helper(x); }
        "#,
    );
    let mut g = graph_of(&unit, "f");
    let none = |_: &str| -> Option<Arc<Graph>> { None };
    assert_eq!(passes::inline_calls(&mut g, &none).unwrap(), 0);
    assert_eq!(count(&g, |k| matches!(k, NodeKind::CallFunction { .. })), 1);
}
