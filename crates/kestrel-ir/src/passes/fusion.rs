// Fusion: group runs of pointwise tensor operators into FusionGroup nodes
//
//   %a = mul(%x, %y)                %r = FusionGroup(%x, %y, %z)
//   %b = add(%a, %z)        ─►        block0(%x.1, %y.1, %z.1):
//   %r = relu(%b)                       %a = mul(%x.1, %y.1)
//                                       %b = add(%a, %z.1)
//                                       %r.1 = relu(%b)
//                                       -> (%r.1)
//
// A run is a maximal sequence of adjacent nodes that the policy accepts,
// optionally interleaved with scalar constants they consume. Runs with fewer
// fusable operators than the policy's minimum are left alone. Every value a
// run produces that is used after it becomes an output of the group.
//
// The executor turns each group into one compiled kernel.

use std::collections::HashSet;

use crate::graph::{BlockId, Graph, InsertPoint, NodeId, NodeKind, Use, ValueId};

/// Which nodes a fuser backend may put into a group.
pub trait FusionPolicy {
    fn can_fuse(&self, graph: &Graph, node: NodeId) -> bool;

    /// Smallest number of operators worth a group.
    fn min_group_size(&self) -> usize {
        2
    }

    fn name(&self) -> &str;
}

/// Fuses pure pointwise operators on tensors.
#[derive(Debug, Clone)]
pub struct PointwiseFusion {
    pub min_group_size: usize,
    /// Only fuse operators whose result sizes are fully known (the
    /// tensor-expression backend generates kernels for fixed shapes).
    pub require_complete_shapes: bool,
    pub label: String,
}

impl Default for PointwiseFusion {
    fn default() -> Self {
        PointwiseFusion {
            min_group_size: 2,
            require_complete_shapes: false,
            label: "pointwise".into(),
        }
    }
}

impl FusionPolicy for PointwiseFusion {
    fn can_fuse(&self, graph: &Graph, node: NodeId) -> bool {
        let n = graph.node(node);
        let NodeKind::Op(schema) = &n.kind else {
            return false;
        };
        if !(schema.flags.pure && schema.flags.pointwise) || n.outputs.len() != 1 {
            return false;
        }
        let Some(out) = graph.value_type(n.outputs[0]).as_tensor() else {
            return false;
        };
        if self.require_complete_shapes && out.concrete_sizes().is_none() {
            return false;
        }
        n.inputs.iter().all(|&v| {
            let ty = graph.value_type(v);
            ty.is_tensor() || !ty.contains_tensor()
        })
    }

    fn min_group_size(&self) -> usize {
        self.min_group_size
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Fuse every eligible run in the graph. Returns the number of groups made.
pub fn fuse_pointwise(graph: &mut Graph, policy: &dyn FusionPolicy) -> usize {
    let groups = fuse_block(graph, graph.top(), policy);
    if groups > 0 {
        log::debug!("fusion ({}): {groups} group(s) formed", policy.name());
    }
    groups
}

fn fuse_block(graph: &mut Graph, block: BlockId, policy: &dyn FusionPolicy) -> usize {
    let mut groups = 0;
    for node in graph.block(block).nodes.clone() {
        if matches!(graph.node(node).kind, NodeKind::FusionGroup) {
            continue;
        }
        for b in graph.node(node).blocks.clone() {
            groups += fuse_block(graph, b, policy);
        }
    }

    let mut run: Vec<NodeId> = Vec::new();
    let mut runs = Vec::new();
    for node in graph.block(block).nodes.clone() {
        if policy.can_fuse(graph, node) || is_scalar_constant(graph, node) {
            run.push(node);
        } else {
            runs.push(std::mem::take(&mut run));
        }
    }
    runs.push(run);

    for run in runs {
        let fusable = run.iter().filter(|&&n| policy.can_fuse(graph, n)).count();
        if fusable < policy.min_group_size().max(1) {
            continue;
        }
        let run = settle_constants(graph, run);
        if make_group(graph, &run) {
            groups += 1;
        }
    }
    groups
}

fn is_scalar_constant(graph: &Graph, node: NodeId) -> bool {
    let n = graph.node(node);
    matches!(n.kind, NodeKind::Constant(_)) && !graph.value_type(n.outputs[0]).contains_tensor()
}

/// Keep only the constants of a run that nothing outside it reads; the
/// others are hoisted in front of the run and passed in as group inputs.
fn settle_constants(graph: &mut Graph, run: Vec<NodeId>) -> Vec<NodeId> {
    let members: HashSet<NodeId> = run.iter().copied().collect();
    let (kept, hoisted): (Vec<NodeId>, Vec<NodeId>) = run.into_iter().partition(|&n| {
        !is_scalar_constant(graph, n)
            || graph.uses(graph.node(n).outputs[0]).iter().all(|u| {
                matches!(u, Use::Node { node, .. } if members.contains(node))
            })
    });
    if let Some(&anchor) = kept.iter().find(|&&n| !is_scalar_constant(graph, n)) {
        for c in hoisted {
            graph.move_before(c, anchor);
        }
    }
    kept
}

/// Replace `run` by a FusionGroup. Returns false if the run computes nothing
/// that is used afterwards.
fn make_group(graph: &mut Graph, run: &[NodeId]) -> bool {
    let members: HashSet<NodeId> = run.iter().copied().collect();
    let is_member_use = |u: &Use| matches!(u, Use::Node { node, .. } if members.contains(node));

    let mut external: Vec<ValueId> = Vec::new();
    let mut produced: Vec<ValueId> = Vec::new();
    for &n in run {
        for &v in &graph.node(n).inputs {
            let inside = graph.producer(v).is_some_and(|p| members.contains(&p));
            if !inside && !external.contains(&v) {
                external.push(v);
            }
        }
        for &o in &graph.node(n).outputs {
            if graph.uses(o).iter().any(|u| !is_member_use(u)) {
                produced.push(o);
            }
        }
    }
    if produced.is_empty() {
        return false;
    }

    let Some(&anchor) = run.iter().find(|&&n| !is_scalar_constant(graph, n)) else {
        return false;
    };
    let types: Vec<_> = produced.iter().map(|&v| graph.value_type(v).clone()).collect();
    let group = graph.insert(InsertPoint::Before(anchor), NodeKind::FusionGroup, &external, types);
    let body = graph.add_block(group);
    for &v in &external {
        let p = graph.add_block_param(body, graph.value_type(v).clone());
        if let Some(name) = graph.value(v).debug_name.clone() {
            graph.set_debug_name(p, name);
        }
        for &n in run {
            let inputs = graph.node(n).inputs.clone();
            for (i, input) in inputs.into_iter().enumerate() {
                if input == v {
                    graph.replace_input(n, i, p);
                }
            }
        }
    }

    let outputs = graph.node(group).outputs.clone();
    for (&inner, &outer) in produced.iter().zip(&outputs) {
        for u in graph.uses(inner).to_vec() {
            match u {
                Use::Node { node, index } if !members.contains(&node) => {
                    graph.replace_input(node, index, outer)
                }
                Use::Return { block, index } => graph.replace_return(block, index, outer),
                Use::Node { .. } => {}
            }
        }
        if let Some(name) = graph.value(inner).debug_name.clone() {
            graph.set_debug_name(outer, name);
        }
    }
    for &n in run {
        graph.move_to_end(n, body);
    }
    for &inner in &produced {
        graph.add_block_return(body, inner);
    }
    true
}
