// Alias analysis: which module attributes may a method write?
//
// Values are tagged with the attribute locations they may refer to, starting
// from the module argument (the empty path):
//
//   %self                  {[]}
//   %w = GetAttr[w](%self) {[w]}
//   %v = view(%w, ..)      {[w]}          (views alias their input)
//   relu_(%v)              writes [w]
//   SetAttr[b](%self, ..)  writes [b]
//
// Locations flow through containers, control-flow block parameters and
// outputs, Fork/Wait, and loop-carried values (iterated to a fixed point).
// A located value handed to a call that was not inlined is assumed written.
// A written path covers everything below it; the empty path means the whole
// module may change.

use std::collections::{BTreeSet, HashMap};

use crate::graph::{Graph, NodeKind, ValueId};

/// Attribute path from the analysed module, e.g. `["sub", "weight"]`.
pub type AttributePath = Vec<String>;

type Locations = HashMap<ValueId, BTreeSet<AttributePath>>;

/// Attribute paths under `root` that `graph` may write.
pub fn mutated_attributes(graph: &Graph, root: ValueId) -> BTreeSet<AttributePath> {
    let mut locs: Locations = HashMap::new();
    locs.entry(root).or_default().insert(Vec::new());
    while propagate(graph, &mut locs) {}

    let mut written = BTreeSet::new();
    let write_all = |v: ValueId, suffix: Option<&str>, written: &mut BTreeSet<AttributePath>| {
        for path in locs.get(&v).into_iter().flatten() {
            let mut p = path.clone();
            if let Some(s) = suffix {
                p.push(s.to_string());
            }
            written.insert(p);
        }
    };
    for node in graph.walk(graph.top()) {
        let n = graph.node(node);
        match &n.kind {
            NodeKind::SetAttr { name } => {
                write_all(n.inputs[0], Some(name), &mut written);
                // Storing an attribute into another slot makes it reachable
                // from a mutable place.
                write_all(n.inputs[1], None, &mut written);
            }
            NodeKind::Op(schema) => {
                if let Some(i) = schema.flags.mutates {
                    if let Some(&v) = n.inputs.get(i) {
                        write_all(v, None, &mut written);
                    }
                }
            }
            NodeKind::CallFunction { .. } | NodeKind::CallMethod { .. } => {
                for &v in &n.inputs {
                    write_all(v, None, &mut written);
                }
            }
            _ => {}
        }
    }
    log::trace!("alias analysis: {} mutated attribute path(s)", written.len());
    written
}

/// One propagation sweep. Returns whether any location set grew.
fn propagate(graph: &Graph, locs: &mut Locations) -> bool {
    let mut changed = false;
    let mut flow = |from: ValueId, to: ValueId, suffix: Option<&str>, locs: &mut Locations| {
        let Some(paths) = locs.get(&from).cloned() else {
            return;
        };
        let entry = locs.entry(to).or_default();
        for mut p in paths {
            if let Some(s) = suffix {
                p.push(s.to_string());
            }
            changed |= entry.insert(p);
        }
    };

    for node in graph.walk(graph.top()) {
        let n = graph.node(node);
        match &n.kind {
            NodeKind::GetAttr { name } => flow(n.inputs[0], n.outputs[0], Some(name), locs),
            NodeKind::Op(schema) => {
                if let Some(i) = schema.flags.aliases {
                    if let (Some(&src), Some(&out)) = (n.inputs.get(i), n.outputs.first()) {
                        flow(src, out, None, locs);
                    }
                }
            }
            NodeKind::TupleConstruct | NodeKind::ListConstruct | NodeKind::NamedTupleConstruct => {
                for &v in &n.inputs {
                    flow(v, n.outputs[0], None, locs);
                }
            }
            NodeKind::TupleIndex { .. }
            | NodeKind::TupleUnpack
            | NodeKind::ListIndex
            | NodeKind::ListUnpack
            | NodeKind::UnwrapOptional
            | NodeKind::Wait => {
                for &o in &n.outputs {
                    flow(n.inputs[0], o, None, locs);
                }
            }
            NodeKind::If => {
                for &b in &n.blocks {
                    let block = graph.block(b);
                    for (&v, &p) in n.inputs[1..].iter().zip(&block.params) {
                        flow(v, p, None, locs);
                    }
                    for (&r, &o) in block.returns.iter().zip(&n.outputs) {
                        flow(r, o, None, locs);
                    }
                }
            }
            NodeKind::Loop => {
                let body = graph.block(n.blocks[0]);
                let carried = n.outputs.len();
                for (&v, &p) in n.inputs[2..].iter().zip(&body.params[1..]) {
                    flow(v, p, None, locs);
                }
                for j in 0..carried {
                    flow(body.returns[1 + j], body.params[1 + j], None, locs);
                    flow(body.returns[1 + j], n.outputs[j], None, locs);
                    flow(n.inputs[2 + j], n.outputs[j], None, locs);
                }
            }
            NodeKind::Fork | NodeKind::FusionGroup => {
                for &b in &n.blocks {
                    let block = graph.block(b);
                    for (&v, &p) in n.inputs.iter().zip(&block.params) {
                        flow(v, p, None, locs);
                    }
                    for (&r, &o) in block.returns.iter().zip(&n.outputs) {
                        flow(r, o, None, locs);
                    }
                }
            }
            _ => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InsertPoint;
    use crate::types::{AttributeKind, ClassAttribute, ClassType, Type};
    use std::sync::Arc;

    fn module_type() -> Type {
        let mut class = ClassType::new("M");
        for name in ["a", "b"] {
            class.attributes.push(ClassAttribute {
                name: name.into(),
                ty: Type::tensor(),
                kind: AttributeKind::Buffer,
            });
        }
        Type::Class(Arc::new(class))
    }

    #[test]
    fn test_in_place_write_through_view() {
        let mut g = Graph::new();
        let s = g.add_input(module_type(), Some("self"));
        let top = g.top();
        let get = g.insert(InsertPoint::End(top), NodeKind::GetAttr { name: "a".into() }, &[s], vec![Type::tensor()]);
        let a = g.node(get).outputs[0];
        let get_b = g.insert(InsertPoint::End(top), NodeKind::GetAttr { name: "b".into() }, &[s], vec![Type::tensor()]);
        let b = g.node(get_b).outputs[0];
        let view = g.insert_op(InsertPoint::End(top), "detach", &[a], &[]).unwrap();
        let v = g.node(view).outputs[0];
        g.insert_op(InsertPoint::End(top), "relu_", &[v], &[]).unwrap();
        g.set_outputs(&[b]);

        let written = mutated_attributes(&g, s);
        assert_eq!(written, BTreeSet::from([vec!["a".to_string()]]));
    }

    #[test]
    fn test_set_attr_is_a_write() {
        let mut g = Graph::new();
        let s = g.add_input(module_type(), Some("self"));
        let x = g.add_input(Type::tensor(), Some("x"));
        let top = g.top();
        g.insert(InsertPoint::End(top), NodeKind::SetAttr { name: "b".into() }, &[s, x], vec![]);
        g.set_outputs(&[x]);
        let written = mutated_attributes(&g, s);
        assert_eq!(written, BTreeSet::from([vec!["b".to_string()]]));
    }

    #[test]
    fn test_reads_are_not_writes() {
        let mut g = Graph::new();
        let s = g.add_input(module_type(), Some("self"));
        let top = g.top();
        let get = g.insert(InsertPoint::End(top), NodeKind::GetAttr { name: "a".into() }, &[s], vec![Type::tensor()]);
        let a = g.node(get).outputs[0];
        let r = g.insert_op(InsertPoint::End(top), "relu", &[a], &[]).unwrap();
        let out = g.node(r).outputs[0];
        g.set_outputs(&[out]);
        assert!(mutated_attributes(&g, s).is_empty());
    }
}
