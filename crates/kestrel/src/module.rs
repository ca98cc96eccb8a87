// Script units, functions and modules
//
// ScriptUnit is the runtime side of a CompilationUnit: the compiled code
// plus one GraphExecutor per function, created on first call. Everything
// that runs code holds an Arc to its unit, so a function handle, a module
// and a forked task all keep the code they need alive.
//
//   ScriptUnit ──► CompilationUnit (functions, classes, named tuples)
//       │
//       └──► executors: "f" ─► GraphExecutor, "Net.forward" ─► GraphExecutor
//
// A Module is an Object whose class was compiled in the unit. Attribute
// reads and writes go through the shared slots of the object, so compiled
// methods and host code see the same state.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use kestrel_core::Tensor;
use kestrel_ir::{
    AttributeKind, ClassType, CompilationUnit, Function, FunctionSchema, Graph, NoResolver,
    NodeKind, Resolver, Type,
};

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::executor::GraphExecutor;
use crate::fork::Invocable;
use crate::value::{bind_arguments, IValue, Object};

// ScriptUnit

/// Compiled code ready to run.
pub struct ScriptUnit {
    unit: Arc<CompilationUnit>,
    config: Option<ExecutorConfig>,
    executors: Mutex<HashMap<String, Arc<GraphExecutor>>>,
}

impl fmt::Debug for ScriptUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.unit.functions().map(|f| f.name.as_str()).collect();
        f.debug_struct("ScriptUnit")
            .field("functions", &names)
            .field("config", &self.config)
            .finish()
    }
}

impl ScriptUnit {
    /// Compile `source` into a new unit.
    ///
    /// ```
    /// use kestrel::{IValue, ScriptUnit};
    ///
    /// let unit = ScriptUnit::compile("def inc(x: int) -> int { return x + 1; }").unwrap();
    /// let inc = unit.get_function("inc").unwrap();
    /// assert_eq!(inc.call(vec![IValue::Int(41)]).unwrap().as_int(), Some(42));
    /// ```
    pub fn compile(source: &str) -> Result<Arc<ScriptUnit>> {
        Self::compile_with(source, &NoResolver)
    }

    /// Compile `source`, resolving free names through `resolver`.
    pub fn compile_with(source: &str, resolver: &dyn Resolver) -> Result<Arc<ScriptUnit>> {
        let mut unit = CompilationUnit::new();
        unit.define_with(source, resolver)?;
        Ok(Self::from_unit(unit))
    }

    /// Executors read the global flags on every call.
    pub fn from_unit(unit: CompilationUnit) -> Arc<ScriptUnit> {
        Self::build(unit, None)
    }

    /// Every executor of the unit uses `config`.
    pub fn with_config(unit: CompilationUnit, config: ExecutorConfig) -> Arc<ScriptUnit> {
        Self::build(unit, Some(config))
    }

    fn build(unit: CompilationUnit, config: Option<ExecutorConfig>) -> Arc<ScriptUnit> {
        Arc::new(ScriptUnit {
            unit: Arc::new(unit),
            config,
            executors: Mutex::new(HashMap::new()),
        })
    }

    pub fn unit(&self) -> &CompilationUnit {
        &self.unit
    }

    pub fn config(&self) -> Option<&ExecutorConfig> {
        self.config.as_ref()
    }

    pub fn find_function(&self, name: &str) -> Option<Arc<Function>> {
        self.unit.find_function(name)
    }

    pub fn get_function(self: &Arc<Self>, name: &str) -> Result<ScriptFunction> {
        let function = self.find_function(name).ok_or_else(|| {
            Error::attribute(format!("'CompilationUnit' has no attribute '{name}'"))
        })?;
        Ok(ScriptFunction {
            unit: self.clone(),
            function,
        })
    }

    /// Executor of function `name`, created on first use.
    pub fn executor(&self, name: &str) -> Result<Arc<GraphExecutor>> {
        let mut executors = self
            .executors
            .lock()
            .map_err(|_| Error::runtime("executor table lock poisoned"))?;
        if let Some(e) = executors.get(name) {
            return Ok(e.clone());
        }
        let function = self.find_function(name).ok_or_else(|| {
            Error::attribute(format!("'CompilationUnit' has no attribute '{name}'"))
        })?;
        let executor = Arc::new(GraphExecutor::new(function, self.config.clone()));
        executors.insert(name.to_string(), executor.clone());
        Ok(executor)
    }

    /// Call function `name` with positional arguments.
    pub(crate) fn run_function(self: &Arc<Self>, name: &str, args: Vec<IValue>) -> Result<IValue> {
        let executor = self.executor(name)?;
        let bound = bind(&executor.function().schema, args, Vec::new())?;
        executor.run(self, bound)
    }

    /// A fresh instance of class `class_name`.
    pub fn create_module(self: &Arc<Self>, class_name: &str) -> Result<Module> {
        let class = self
            .unit
            .find_class(class_name)
            .ok_or_else(|| Error::attribute(format!("unknown class '{class_name}'")))?;
        Ok(Module::new(self.clone(), class))
    }
}

fn bind(schema: &FunctionSchema, args: Vec<IValue>, kwargs: Vec<(String, IValue)>) -> Result<Vec<IValue>> {
    bind_arguments(schema, args, kwargs).map_err(|failure| {
        Error::ValueType(format!("{}(): {failure}", schema.name))
    })
}

// ScriptFunction

/// Handle to a compiled free function.
#[derive(Clone)]
pub struct ScriptFunction {
    unit: Arc<ScriptUnit>,
    function: Arc<Function>,
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptFunction({})", self.function.schema)
    }
}

impl ScriptFunction {
    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn schema(&self) -> &FunctionSchema {
        &self.function.schema
    }

    pub fn graph(&self) -> &Graph {
        &self.function.graph
    }

    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }

    pub fn unit(&self) -> &Arc<ScriptUnit> {
        &self.unit
    }

    pub fn executor(&self) -> Result<Arc<GraphExecutor>> {
        self.unit.executor(&self.function.name)
    }

    pub fn call(&self, args: Vec<IValue>) -> Result<IValue> {
        self.call_with(args, Vec::new())
    }

    /// Call with keyword arguments. Arguments that do not fit the signature
    /// fail with a `ValueType` error before anything runs.
    pub fn call_with(&self, args: Vec<IValue>, kwargs: Vec<(String, IValue)>) -> Result<IValue> {
        let bound = bind(&self.function.schema, args, kwargs)?;
        self.executor()?.run(&self.unit, bound)
    }
}

impl Invocable for ScriptFunction {
    fn name(&self) -> String {
        self.function.name.clone()
    }

    fn invoke(&self, args: Vec<IValue>) -> Result<IValue> {
        self.call(args)
    }
}

// Module

/// An instance of a compiled class.
#[derive(Clone)]
pub struct Module {
    object: Object,
    unit: Arc<ScriptUnit>,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("class", &self.object.class().name)
            .field("attributes", &self.attribute_names())
            .finish()
    }
}

impl Module {
    /// A new instance in training mode. Submodule attributes get fresh
    /// instances of their classes; all other attributes start as None.
    pub fn new(unit: Arc<ScriptUnit>, class: Arc<ClassType>) -> Module {
        let slots = class
            .attributes
            .iter()
            .map(|a| match (&a.kind, &a.ty) {
                (AttributeKind::Module, Type::Class(c)) => {
                    IValue::Object(Module::new(unit.clone(), c.clone()).object)
                }
                _ if a.name == "training" => IValue::Bool(true),
                _ => IValue::None,
            })
            .collect();
        Module {
            object: Object::with_slots(class, slots),
            unit,
        }
    }

    /// Wrap an existing object of a class compiled in `unit`.
    pub fn from_object(unit: Arc<ScriptUnit>, object: Object) -> Module {
        Module { object, unit }
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    pub fn class(&self) -> &Arc<ClassType> {
        self.object.class()
    }

    pub fn unit(&self) -> &Arc<ScriptUnit> {
        &self.unit
    }

    // Attributes

    pub fn has_attr(&self, name: &str) -> bool {
        self.class().attribute_index(name).is_some()
    }

    pub fn attr(&self, name: &str) -> Result<IValue> {
        self.object.get(name)
    }

    /// Set attribute `name`. The value must fit the declared type;
    /// parameters are marked as requiring grad.
    pub fn set_attr(&self, name: &str, value: IValue) -> Result<()> {
        let class = self.class();
        let attr = class.attribute(name).ok_or_else(|| {
            Error::attribute(format!("'{}' object has no attribute '{name}'", class.name))
        })?;
        let found = value.type_of();
        let value = value.coerce(&attr.ty).ok_or_else(|| {
            Error::Type(format!(
                "attribute '{name}' of '{}' must be {}, but found {found}",
                class.name, attr.ty
            ))
        })?;
        let value = match (attr.kind, value) {
            (AttributeKind::Parameter, IValue::Tensor(t)) if !t.requires_grad() => {
                IValue::Tensor(t.set_requires_grad(true))
            }
            (_, v) => v,
        };
        self.object.set(name, value)
    }

    /// Attribute names in slot order.
    pub fn attribute_names(&self) -> Vec<String> {
        self.class().attributes.iter().map(|a| a.name.clone()).collect()
    }

    pub fn submodule(&self, name: &str) -> Result<Module> {
        match self.attr(name)? {
            IValue::Object(object) => Ok(Module::from_object(self.unit.clone(), object)),
            other => Err(Error::attribute(format!(
                "attribute '{name}' is not a module, found {}",
                other.type_of()
            ))),
        }
    }

    pub fn set_submodule(&self, name: &str, module: &Module) -> Result<()> {
        self.set_attr(name, IValue::Object(module.object.clone()))
    }

    /// Direct submodules with their attribute names.
    pub fn children(&self) -> Result<Vec<(String, Module)>> {
        let mut out = Vec::new();
        for (attr, value) in self.class().attributes.iter().zip(self.object.slots()?) {
            if let IValue::Object(object) = value {
                out.push((attr.name.clone(), Module::from_object(self.unit.clone(), object)));
            }
        }
        Ok(out)
    }

    /// Parameters of this module and its submodules, with dotted names.
    pub fn parameters(&self) -> Result<Vec<(String, Tensor)>> {
        self.tensors_of(AttributeKind::Parameter, "")
    }

    pub fn buffers(&self) -> Result<Vec<(String, Tensor)>> {
        self.tensors_of(AttributeKind::Buffer, "")
    }

    fn tensors_of(&self, kind: AttributeKind, prefix: &str) -> Result<Vec<(String, Tensor)>> {
        let mut out = Vec::new();
        for (attr, value) in self.class().attributes.iter().zip(self.object.slots()?) {
            let path = format!("{prefix}{}", attr.name);
            match value {
                IValue::Tensor(t) if attr.kind == kind => out.push((path, t)),
                IValue::Object(object) => {
                    let child = Module::from_object(self.unit.clone(), object);
                    out.extend(child.tensors_of(kind, &format!("{path}."))?);
                }
                _ => {}
            }
        }
        Ok(out)
    }

    // Modes

    /// Set training mode on this module and every submodule.
    pub fn train(&self, mode: bool) -> Result<()> {
        if self.has_attr("training") {
            self.object.set("training", IValue::Bool(mode))?;
        }
        for (_, child) in self.children()? {
            child.train(mode)?;
        }
        Ok(())
    }

    pub fn eval(&self) -> Result<()> {
        self.train(false)
    }

    pub fn is_training(&self) -> bool {
        matches!(self.attr("training"), Ok(IValue::Bool(true)))
    }

    // Methods

    /// Method names of the class.
    pub fn methods(&self) -> Vec<String> {
        self.class().methods.clone()
    }

    pub fn method(&self, name: &str) -> Result<Method> {
        if !self.class().has_method(name) {
            return Err(Error::attribute(format!(
                "'{}' object has no attribute '{name}'",
                self.class().name
            )));
        }
        Ok(Method {
            module: self.clone(),
            name: name.to_string(),
        })
    }

    pub fn run_method(&self, name: &str, args: Vec<IValue>) -> Result<IValue> {
        self.run_method_with(name, args, Vec::new())
    }

    pub fn run_method_with(
        &self,
        name: &str,
        args: Vec<IValue>,
        kwargs: Vec<(String, IValue)>,
    ) -> Result<IValue> {
        let qualname = self.class().method_qualname(name);
        let executor = self.unit.executor(&qualname).map_err(|_| {
            Error::attribute(format!(
                "'{}' object has no attribute '{name}'",
                self.class().name
            ))
        })?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(IValue::Object(self.object.clone()));
        full.extend(args);
        let bound = bind(&executor.function().schema, full, kwargs)?;
        executor.run(&self.unit, bound)
    }

    pub fn forward(&self, args: Vec<IValue>) -> Result<IValue> {
        self.run_method("forward", args)
    }
}

/// A method bound to its module.
#[derive(Debug, Clone)]
pub struct Method {
    module: Module,
    name: String,
}

impl Method {
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn graph(&self) -> Result<Arc<Graph>> {
        let qualname = self.module.class().method_qualname(&self.name);
        self.module
            .unit
            .find_function(&qualname)
            .map(|f| f.graph.clone())
            .ok_or_else(|| Error::attribute(format!("no compiled method '{qualname}'")))
    }

    pub fn call(&self, args: Vec<IValue>) -> Result<IValue> {
        self.module.run_method(&self.name, args)
    }
}

impl Invocable for Method {
    fn name(&self) -> String {
        self.module.class().method_qualname(&self.name)
    }

    fn invoke(&self, args: Vec<IValue>) -> Result<IValue> {
        self.call(args)
    }
}

/// Operator names used by the methods of `module`, its submodules and
/// every function they call, sorted and de-duplicated.
pub fn export_opnames(module: &Module) -> Result<Vec<String>> {
    let unit = module.unit.unit();
    let mut pending: Vec<String> = Vec::new();
    let mut classes = vec![module.class().clone()];
    let mut seen_classes = HashSet::new();
    while let Some(class) = classes.pop() {
        if !seen_classes.insert(class.name.clone()) {
            continue;
        }
        pending.extend(class.methods.iter().map(|m| class.method_qualname(m)));
        for attr in &class.attributes {
            if let Type::Class(c) = &attr.ty {
                classes.push(c.clone());
            }
        }
    }

    let mut names = BTreeSet::new();
    let mut visited = HashSet::new();
    while let Some(qualname) = pending.pop() {
        if !visited.insert(qualname.clone()) {
            continue;
        }
        let Some(function) = unit.find_function(&qualname) else {
            continue;
        };
        let graph = &function.graph;
        for node in graph.walk(graph.top()) {
            let n = graph.node(node);
            match &n.kind {
                NodeKind::Op(schema) => {
                    names.insert(schema.qualified_name());
                }
                NodeKind::CallFunction { name } => pending.push(name.clone()),
                NodeKind::CallMethod { name } => {
                    if let Some(class) = n
                        .inputs
                        .first()
                        .and_then(|&v| graph.value_type(v).as_class().cloned())
                    {
                        pending.push(class.method_qualname(name));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(names.into_iter().collect())
}
