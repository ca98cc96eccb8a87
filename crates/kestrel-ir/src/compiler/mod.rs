// Compiler: the compilation unit
//
// A CompilationUnit is a namespace of compiled functions, methods, classes
// and named tuples. `define` parses source text and compiles every item in
// it:
//
//   source ─► parse ─► types (namedtuple, class) ─► functions and methods
//                                                   │
//                                      emit ─► lift captures ─► dce ─► verify
//
// Items are committed one at a time. A failing item stops the define call
// but everything committed before it stays. Functions may call functions
// defined later in the same source: callees are compiled on demand.
//
// Free names that are neither local, defined in the unit, nor builtin are
// looked up through a Resolver supplied by the caller.

mod emitter;

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{AttrDeclKind, ClassDef, Item, NamedTupleDef};
use crate::error::{Error, ErrorKind, Result};
use crate::graph::{Constant, Graph};
use crate::passes;
use crate::schema::FunctionSchema;
use crate::types::{AttributeKind, ClassAttribute, ClassType, NamedTupleType, Type};
use crate::verify::verify;

/// What a free name resolves to.
#[derive(Debug, Clone)]
pub enum Resolved {
    /// A global constant, embedded into the graph.
    Constant(Constant),
    /// Another function of the unit, by qualified name.
    Function(String),
    /// A class or named-tuple type.
    Type(Type),
}

/// Name resolution callback.
pub trait Resolver {
    fn resolve(&self, name: &str) -> Option<Resolved>;
}

impl<F> Resolver for F
where
    F: Fn(&str) -> Option<Resolved>,
{
    fn resolve(&self, name: &str) -> Option<Resolved> {
        self(name)
    }
}

/// Resolver that knows no names.
pub struct NoResolver;

impl Resolver for NoResolver {
    fn resolve(&self, _name: &str) -> Option<Resolved> {
        None
    }
}

/// A compiled function or method.
#[derive(Debug, Clone)]
pub struct Function {
    /// Qualified name: `f` or `Class.method`.
    pub name: String,
    pub schema: FunctionSchema,
    pub graph: Arc<Graph>,
    /// Class owning a method.
    pub owner: Option<Arc<ClassType>>,
}

impl Function {
    pub fn is_method(&self) -> bool {
        self.owner.is_some()
    }

    /// Unqualified name.
    pub fn basename(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn return_type(&self) -> &Type {
        &self.schema.returns
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompilationUnit {
    functions: Vec<Arc<Function>>,
    index: HashMap<String, usize>,
    types: HashMap<String, Type>,
}

impl CompilationUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `source` without a resolver. Returns the qualified names
    /// defined.
    pub fn define(&mut self, source: &str) -> Result<Vec<String>> {
        self.define_with(source, &NoResolver)
    }

    /// Compile `source`, resolving free names through `resolver`.
    pub fn define_with(&mut self, source: &str, resolver: &dyn Resolver) -> Result<Vec<String>> {
        let file = crate::parser::parse(source)?;
        let mut defined = Vec::new();

        for item in &file.items {
            if let Item::NamedTuple(nt) = item {
                let ty = self.build_named_tuple(nt, resolver).map_err(|e| e.with_source(source))?;
                self.add_type(&nt.name, ty).map_err(|e| e.with_source(source))?;
                defined.push(nt.name.clone());
            }
        }

        let mut pending = Vec::new();
        for item in &file.items {
            match item {
                Item::Class(class) => {
                    let ty = self.build_class(class, resolver).map_err(|e| e.with_source(source))?;
                    self.add_type(&class.name, Type::Class(ty.clone()))
                        .map_err(|e| e.with_source(source))?;
                    defined.push(class.name.clone());
                    for m in &class.methods {
                        pending.push((ty.method_qualname(&m.name), m.clone(), Some(ty.clone())));
                    }
                }
                Item::Def(def) => pending.push((def.name.clone(), def.clone(), None)),
                Item::NamedTuple(_) => {}
            }
        }

        for (name, _, _) in &pending {
            if self.index.contains_key(name) {
                return Err(Error::without_span(ErrorKind::Duplicate(name.clone())));
            }
        }

        let mut ctx = emitter::DefineContext::new(self, resolver, source, &pending);
        for (name, _, _) in &pending {
            ctx.ensure_compiled(name)?;
            defined.push(name.clone());
        }
        log::debug!("defined {} item(s): {}", defined.len(), defined.join(", "));
        Ok(defined)
    }

    fn build_named_tuple(&self, nt: &NamedTupleDef, resolver: &dyn Resolver) -> Result<Type> {
        let lookup = |n: &str| self.lookup_type(n, resolver);
        let fields = nt
            .fields
            .iter()
            .map(|(name, ty)| Ok((name.clone(), Type::from_type_expr(ty, &lookup)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Type::NamedTuple(Arc::new(NamedTupleType {
            name: nt.name.clone(),
            fields,
        })))
    }

    fn build_class(&self, class: &ClassDef, resolver: &dyn Resolver) -> Result<Arc<ClassType>> {
        let lookup = |n: &str| self.lookup_type(n, resolver);
        let mut ty = ClassType::new(&class.name);
        for decl in &class.attrs {
            let attr_ty = Type::from_type_expr(&decl.ty, &lookup)?;
            let kind = match decl.kind {
                AttrDeclKind::Parameter | AttrDeclKind::Buffer if !attr_ty.is_tensor() => {
                    return Err(Error::type_error(
                        format!(
                            "parameter or buffer '{}' must be a Tensor, not {attr_ty}",
                            decl.name
                        ),
                        decl.span,
                    ))
                }
                AttrDeclKind::Parameter => AttributeKind::Parameter,
                AttrDeclKind::Buffer => AttributeKind::Buffer,
                AttrDeclKind::Attribute if matches!(attr_ty, Type::Class(_)) => AttributeKind::Module,
                AttrDeclKind::Attribute => AttributeKind::Attribute,
            };
            if ty.attribute_index(&decl.name).is_some() {
                return Err(Error::new(ErrorKind::Duplicate(decl.name.clone()), decl.span));
            }
            ty.attributes.push(ClassAttribute {
                name: decl.name.clone(),
                ty: attr_ty,
                kind,
            });
        }
        if ty.attribute_index("training").is_none() {
            ty.attributes.push(ClassAttribute {
                name: "training".into(),
                ty: Type::Bool,
                kind: AttributeKind::Attribute,
            });
        }
        ty.methods = class.methods.iter().map(|m| m.name.clone()).collect();
        Ok(Arc::new(ty))
    }

    fn lookup_type(&self, name: &str, resolver: &dyn Resolver) -> Option<Type> {
        self.types.get(name).cloned().or_else(|| match resolver.resolve(name) {
            Some(Resolved::Type(t)) => Some(t),
            _ => None,
        })
    }

    fn add_type(&mut self, name: &str, ty: Type) -> Result<()> {
        if self.types.contains_key(name) {
            return Err(Error::without_span(ErrorKind::Duplicate(name.to_string())));
        }
        self.types.insert(name.to_string(), ty);
        Ok(())
    }

    // Queries

    pub fn find_function(&self, name: &str) -> Option<Arc<Function>> {
        self.index.get(name).map(|&i| self.functions[i].clone())
    }

    /// Method `name` of class `class`.
    pub fn find_method(&self, class: &ClassType, name: &str) -> Option<Arc<Function>> {
        self.find_function(&class.method_qualname(name))
    }

    pub fn find_type(&self, name: &str) -> Option<Type> {
        self.types.get(name).cloned()
    }

    pub fn find_class(&self, name: &str) -> Option<Arc<ClassType>> {
        match self.types.get(name) {
            Some(Type::Class(c)) => Some(c.clone()),
            _ => None,
        }
    }

    /// Functions in definition order.
    pub fn functions(&self) -> impl Iterator<Item = &Arc<Function>> {
        self.functions.iter()
    }

    /// Class and named-tuple types, sorted by name.
    pub fn types(&self) -> Vec<(String, Type)> {
        let mut out: Vec<(String, Type)> =
            self.types.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    // Registration (tracer, deserializer, freezing)

    /// Add an already compiled function.
    pub fn add_function(&mut self, function: Function) -> Result<Arc<Function>> {
        if self.index.contains_key(&function.name) {
            return Err(Error::without_span(ErrorKind::Duplicate(function.name)));
        }
        let function = Arc::new(function);
        self.index.insert(function.name.clone(), self.functions.len());
        self.functions.push(function.clone());
        Ok(function)
    }

    /// Add or overwrite a function.
    pub fn replace_function(&mut self, function: Function) -> Arc<Function> {
        let function = Arc::new(function);
        match self.index.get(&function.name) {
            Some(&i) => self.functions[i] = function.clone(),
            None => {
                self.index.insert(function.name.clone(), self.functions.len());
                self.functions.push(function.clone());
            }
        }
        function
    }

    pub fn add_class(&mut self, class: Arc<ClassType>) -> Result<()> {
        let name = class.name.clone();
        self.add_type(&name, Type::Class(class))
    }

    /// Add or overwrite a class or named-tuple type.
    pub fn replace_type(&mut self, name: &str, ty: Type) {
        self.types.insert(name.to_string(), ty);
    }

    pub fn add_named_tuple(&mut self, nt: Arc<NamedTupleType>) -> Result<()> {
        let name = nt.name.clone();
        self.add_type(&name, Type::NamedTuple(nt))
    }
}

/// Post-emission cleanup shared by every compiled graph.
fn finish_graph(mut graph: Graph) -> Result<Graph> {
    passes::lift_captures(&mut graph);
    passes::eliminate_dead_code(&mut graph);
    let graph = graph.compacted()?;
    verify(&graph)?;
    Ok(graph)
}

/// Build a function schema from compiled parameter info.
fn function_schema(
    name: &str,
    params: Vec<(String, Type, Option<Constant>)>,
    returns: Type,
) -> FunctionSchema {
    let arguments = params
        .into_iter()
        .map(|(name, ty, default)| crate::schema::Argument {
            name,
            ty,
            default,
            kwarg_only: false,
        })
        .collect();
    FunctionSchema::new(name, arguments, returns)
}
