// Freezing: fold unmutated module state into the code
//
//   module (eval mode)
//     │ clone forward and preserved methods, inline every call
//     ▼
//   alias analysis ─► attribute paths any method may write
//     │                (expanded over submodules reachable by several paths)
//     ▼
//   GetAttr of an attribute nobody writes ─► Constant
//     │
//     ▼
//   cleanup passes, then a new class per kept object holding only the
//   attributes the frozen code still reads or writes
//
// The input module is left untouched: folded tensors and kept state are
// deep copies, and the result lives in a fresh unit.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use kestrel_ir::passes::{inline_calls, mutated_attributes, optimize_graph, AttributePath};
use kestrel_ir::types::ClassAttribute;
use kestrel_ir::{
    verify, ClassType, CompilationUnit, Function, Graph, InsertPoint, NodeKind, Type, ValueId,
};

use crate::error::{Error, Result};
use crate::module::{Module, ScriptUnit};
use crate::value::{IValue, Object};

/// Freeze `module`. `forward` is always kept; every name in
/// `preserved_attrs` is kept too, as a method if the class has one by that
/// name and as a (possibly dotted) attribute path otherwise.
pub fn freeze(module: &Module, preserved_attrs: &[&str]) -> Result<Module> {
    if module.is_training() {
        return Err(Error::runtime(
            "Freezing is currently only implemented for modules in eval mode. \
             Please call .eval() on your module before freezing.",
        ));
    }
    let root_class = module.class().clone();
    let unit = module.unit().unit();

    let mut methods = vec!["forward".to_string()];
    let mut preserved: Vec<AttributePath> = Vec::new();
    for &name in preserved_attrs {
        if root_class.has_method(name) {
            if !methods.iter().any(|m| m == name) {
                methods.push(name.to_string());
            }
        } else {
            let path: AttributePath = name.split('.').map(str::to_string).collect();
            resolve(module.object(), &path)?;
            preserved.push(path);
        }
    }

    // Inline and clean up every preserved method.
    let lookup = |name: &str| unit.find_function(name).map(|f| f.graph.clone());
    let mut graphs: Vec<(Arc<Function>, Graph)> = Vec::new();
    for name in &methods {
        let function = unit.find_method(&root_class, name).ok_or_else(|| {
            Error::attribute(format!(
                "'{}' object has no attribute '{name}'",
                root_class.name
            ))
        })?;
        let mut graph = (*function.graph).clone();
        inline_calls(&mut graph, &lookup)?;
        optimize_graph(&mut graph);
        graphs.push((function, graph));
    }

    // Which paths are written, directly or through an alias.
    let aliases = ObjectPaths::collect(module.object())?;
    let mut mutated: BTreeSet<AttributePath> = BTreeSet::new();
    for (_, graph) in &graphs {
        if let Some(&root) = graph.inputs().first() {
            mutated.extend(mutated_attributes(graph, root));
        }
    }
    aliases.expand(&mut mutated);
    log::debug!(
        "freeze {}: {} mutated attribute path(s) {:?}",
        root_class.name,
        mutated.len(),
        mutated
    );

    let is_kept = |path: &[String]| {
        mutated.iter().any(|m| path.starts_with(m)) || preserved.iter().any(|p| path.starts_with(p))
    };

    // Fold reads of unmutated attributes.
    let mut folded = 0;
    for (_, graph) in &mut graphs {
        let paths = attribute_paths(graph);
        for node in graph.walk(graph.top()) {
            let n = graph.node(node);
            let NodeKind::GetAttr { .. } = n.kind else {
                continue;
            };
            let out = n.outputs[0];
            let Some(path) = paths.get(&out) else {
                continue;
            };
            if is_kept(path) {
                continue;
            }
            let Some(constant) = frozen_copy(&resolve(module.object(), path)?)?.to_constant() else {
                continue;
            };
            let ty = graph.value_type(out).clone();
            let c = graph.insert_constant_typed(InsertPoint::Before(node), constant, ty);
            graph.replace_all_uses_with(out, c);
            graph.erase_node(node);
            folded += 1;
        }
        optimize_graph(graph);
    }

    // Attributes the frozen code still touches.
    let mut keep: HashSet<AttributePath> = HashSet::new();
    for (_, graph) in &graphs {
        let paths = attribute_paths(graph);
        for node in graph.walk(graph.top()) {
            let n = graph.node(node);
            let path = match &n.kind {
                NodeKind::GetAttr { .. } => paths.get(&n.outputs[0]).cloned(),
                NodeKind::SetAttr { name } => paths.get(&n.inputs[0]).map(|p| {
                    let mut p = p.clone();
                    p.push(name.clone());
                    p
                }),
                _ => None,
            };
            if let Some(path) = path {
                add_with_prefixes(&mut keep, &path);
            }
        }
    }
    for path in &preserved {
        add_with_prefixes(&mut keep, path);
    }

    let mut rebuild = Rebuild {
        keep: &keep,
        aliases: &aliases,
        root_methods: methods.clone(),
        objects: HashMap::new(),
        classes: HashMap::new(),
        class_at: HashMap::new(),
        names: HashMap::new(),
    };
    let frozen_root = rebuild.object(module.object(), &Vec::new())?;
    let new_root_class = frozen_root.class().clone();
    log::debug!(
        "freeze {}: {folded} read(s) folded, {} of {} root attribute(s) kept",
        root_class.name,
        new_root_class.attributes.len(),
        root_class.attributes.len()
    );

    // Assemble the new unit.
    let mut cu = CompilationUnit::new();
    for (_, ty) in unit.types() {
        if let Type::NamedTuple(nt) = ty {
            cu.add_named_tuple(nt)?;
        }
    }
    let mut classes: Vec<&Arc<ClassType>> = rebuild.classes.values().collect();
    classes.sort_by(|a, b| a.name.cmp(&b.name));
    for class in classes {
        cu.add_class(class.clone())?;
    }
    for (function, mut graph) in graphs {
        let paths = attribute_paths(&graph);
        let stale: Vec<(ValueId, Arc<ClassType>)> = paths
            .iter()
            .filter(|(v, _)| matches!(graph.value_type(**v), Type::Class(_)))
            .filter_map(|(v, p)| rebuild.class_at.get(p).map(|c| (*v, c.clone())))
            .collect();
        for (v, class) in stale {
            graph.set_type_unchecked(v, Type::Class(class));
        }
        let graph = graph.compacted()?;
        verify(&graph)?;

        let mut schema = function.schema.clone();
        if let Some(arg) = schema.arguments.first_mut() {
            arg.ty = Type::Class(new_root_class.clone());
        }
        cu.add_function(Function {
            name: new_root_class.method_qualname(function.basename()),
            schema,
            graph: Arc::new(graph),
            owner: Some(new_root_class.clone()),
        })?;
    }

    let frozen_unit = match module.unit().config() {
        Some(config) => ScriptUnit::with_config(cu, config.clone()),
        None => ScriptUnit::from_unit(cu),
    };
    Ok(Module::from_object(frozen_unit, frozen_root))
}

fn add_with_prefixes(keep: &mut HashSet<AttributePath>, path: &[String]) {
    for k in 1..=path.len() {
        keep.insert(path[..k].to_vec());
    }
}

/// Value at `path` below `root`.
fn resolve(root: &Object, path: &[String]) -> Result<IValue> {
    let mut current = IValue::Object(root.clone());
    for name in path {
        current = match current {
            IValue::Object(o) => o.get(name)?,
            other => {
                return Err(Error::attribute(format!(
                    "cannot read '{name}' of {}",
                    other.type_of()
                )))
            }
        };
    }
    Ok(current)
}

/// Copy of a non-object value that shares nothing with the source.
fn frozen_copy(value: &IValue) -> Result<IValue> {
    Ok(match value {
        IValue::Tensor(t) => IValue::Tensor(t.deep_clone().map_err(|e| Error::op("freeze", e))?),
        IValue::List(items) => IValue::List(items.iter().map(frozen_copy).collect::<Result<_>>()?),
        IValue::Tuple(items) => IValue::Tuple(items.iter().map(frozen_copy).collect::<Result<_>>()?),
        IValue::NamedTuple(nt, items) => {
            IValue::NamedTuple(nt.clone(), items.iter().map(frozen_copy).collect::<Result<_>>()?)
        }
        other => other.clone(),
    })
}

/// Attribute path of every value that refers to module state: graph input
/// 0 is the module, GetAttr extends a path, and paths flow into nested
/// blocks through their captures.
fn attribute_paths(graph: &Graph) -> HashMap<ValueId, AttributePath> {
    let mut paths = HashMap::new();
    let Some(&root) = graph.inputs().first() else {
        return paths;
    };
    paths.insert(root, Vec::new());
    loop {
        let mut changed = false;
        for node in graph.walk(graph.top()) {
            let n = graph.node(node);
            let mut link = |from: ValueId, to: ValueId, suffix: Option<&str>| {
                if paths.contains_key(&to) {
                    return;
                }
                if let Some(p) = paths.get(&from) {
                    let mut p = p.clone();
                    p.extend(suffix.map(str::to_string));
                    paths.insert(to, p);
                    changed = true;
                }
            };
            match &n.kind {
                NodeKind::GetAttr { name } => link(n.inputs[0], n.outputs[0], Some(name)),
                NodeKind::If => {
                    for &b in &n.blocks {
                        for (&v, &p) in n.inputs[1..].iter().zip(&graph.block(b).params) {
                            link(v, p, None);
                        }
                    }
                }
                NodeKind::Loop => {
                    let carried = n.outputs.len();
                    let body = graph.block(n.blocks[0]);
                    for (&v, &p) in n.inputs[2 + carried..].iter().zip(&body.params[1 + carried..]) {
                        link(v, p, None);
                    }
                }
                NodeKind::Fork | NodeKind::FusionGroup => {
                    for &b in &n.blocks {
                        for (&v, &p) in n.inputs.iter().zip(&graph.block(b).params) {
                            link(v, p, None);
                        }
                    }
                }
                _ => {}
            }
        }
        if !changed {
            return paths;
        }
    }
}

/// Every path under the root at which each object can be reached.
struct ObjectPaths {
    by_object: HashMap<usize, Vec<AttributePath>>,
    by_path: HashMap<AttributePath, usize>,
}

impl ObjectPaths {
    fn collect(root: &Object) -> Result<Self> {
        let mut paths = ObjectPaths {
            by_object: HashMap::new(),
            by_path: HashMap::new(),
        };
        paths.visit(root, Vec::new())?;
        Ok(paths)
    }

    fn visit(&mut self, object: &Object, path: AttributePath) -> Result<()> {
        let seen = self.by_object.contains_key(&object.id());
        self.by_object.entry(object.id()).or_default().push(path.clone());
        self.by_path.insert(path.clone(), object.id());
        if seen {
            return Ok(());
        }
        for (attr, value) in object.class().attributes.iter().zip(object.slots()?) {
            if let IValue::Object(child) = value {
                let mut p = path.clone();
                p.push(attr.name.clone());
                self.visit(&child, p)?;
            }
        }
        Ok(())
    }

    /// Add the alias paths of every written path: a write below one path of
    /// a shared submodule is a write below all of its paths.
    fn expand(&self, written: &mut BTreeSet<AttributePath>) {
        loop {
            let mut added = Vec::new();
            for path in written.iter() {
                for k in 0..=path.len() {
                    let Some(id) = self.by_path.get(&path[..k]) else {
                        continue;
                    };
                    for alias in &self.by_object[id] {
                        let mut p = alias.clone();
                        p.extend_from_slice(&path[k..]);
                        if !written.contains(&p) {
                            added.push(p);
                        }
                    }
                }
            }
            if added.is_empty() {
                return;
            }
            written.extend(added);
        }
    }

    fn aliases_of(&self, object: &Object) -> &[AttributePath] {
        self.by_object
            .get(&object.id())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Builds the frozen object tree. Shared submodules stay shared.
struct Rebuild<'a> {
    keep: &'a HashSet<AttributePath>,
    aliases: &'a ObjectPaths,
    root_methods: Vec<String>,
    objects: HashMap<usize, Object>,
    classes: HashMap<String, Arc<ClassType>>,
    class_at: HashMap<AttributePath, Arc<ClassType>>,
    /// Per source class name, how many frozen classes were made from it.
    names: HashMap<String, usize>,
}

impl Rebuild<'_> {
    fn object(&mut self, object: &Object, path: &AttributePath) -> Result<Object> {
        if let Some(done) = self.objects.get(&object.id()) {
            self.class_at.insert(path.clone(), done.class().clone());
            return Ok(done.clone());
        }
        let source = object.class().clone();
        let mut attributes = Vec::new();
        let mut slots = Vec::new();
        for (attr, value) in source.attributes.iter().zip(object.slots()?) {
            let kept = std::iter::once(path)
                .chain(self.aliases.aliases_of(object))
                .any(|p| {
                    let mut p = p.clone();
                    p.push(attr.name.clone());
                    self.keep.contains(&p)
                });
            if !kept {
                continue;
            }
            let mut child_path = path.clone();
            child_path.push(attr.name.clone());
            let (ty, value) = match value {
                IValue::Object(child) => {
                    let child = self.object(&child, &child_path)?;
                    (Type::Class(child.class().clone()), IValue::Object(child))
                }
                other => (attr.ty.clone(), frozen_copy(&other)?),
            };
            attributes.push(ClassAttribute {
                name: attr.name.clone(),
                ty,
                kind: attr.kind,
            });
            slots.push(value);
        }

        let count = self.names.entry(source.name.clone()).or_insert(0);
        let name = if *count == 0 {
            source.name.clone()
        } else {
            format!("{}_{}", source.name, count)
        };
        *count += 1;
        let class = Arc::new(ClassType {
            name: name.clone(),
            attributes,
            methods: if path.is_empty() {
                self.root_methods.clone()
            } else {
                Vec::new()
            },
        });
        self.classes.insert(name, class.clone());
        self.class_at.insert(path.clone(), class.clone());

        let frozen = Object::with_slots(class, slots);
        self.objects.insert(object.id(), frozen.clone());
        Ok(frozen)
    }
}
