// Interpreter: executes graph blocks node by node
//
// Values live in a per-block environment. Nested blocks see their
// parameters first and fall back to the enclosing environments, so graphs
// with lifted captures and graphs still referring to outer values both
// run. Control flow follows the block conventions of the IR:
//
//   If    inputs [cond, captures...]       blocks [then, else]
//   Loop  inputs [max_trip, cond, carried..., captures...]
//         body params [iter, carried..., captures...]
//         body returns [next_cond, carried...]
//   Fork  inputs = captures = body params, body returns [value]
//
// Fork bodies go to the worker pool when the frame has one; without a pool
// (tracing) they run inline.

use std::collections::HashMap;
use std::sync::Arc;

use kestrel_ir::{BlockId, Graph, NodeId, NodeKind, Type, ValueId};

use crate::autograd::{needs_grad, AutogradHook};
use crate::error::{Error, Result};
use crate::executor::fused_kernel::KernelTable;
use crate::fork::{self, TaskPool};
use crate::module::ScriptUnit;
use crate::ops;
use crate::value::IValue;

/// What running code needs besides the graph itself.
#[derive(Clone)]
pub(crate) struct ExecContext {
    pub unit: Arc<ScriptUnit>,
    pub pool: Option<Arc<TaskPool>>,
    pub autograd: Arc<dyn AutogradHook>,
}

/// A graph ready to run in a context. Cheap to clone; forked tasks take a
/// clone to the worker.
#[derive(Clone)]
pub(crate) struct Frame {
    graph: Arc<Graph>,
    kernels: Option<Arc<KernelTable>>,
    ctx: ExecContext,
}

struct Env<'a> {
    values: HashMap<ValueId, IValue>,
    parent: Option<&'a Env<'a>>,
}

impl<'a> Env<'a> {
    fn new(parent: Option<&'a Env<'a>>) -> Self {
        Env {
            values: HashMap::new(),
            parent,
        }
    }

    fn get(&self, v: ValueId) -> Result<IValue> {
        let mut env = Some(self);
        while let Some(e) = env {
            if let Some(value) = e.values.get(&v) {
                return Ok(value.clone());
            }
            env = e.parent;
        }
        Err(Error::runtime(format!("interpreter: value {v} is not defined")))
    }

    fn set(&mut self, v: ValueId, value: IValue) {
        self.values.insert(v, value);
    }
}

fn bool_of(v: &IValue, what: &str) -> Result<bool> {
    v.as_bool()
        .ok_or_else(|| Error::runtime(format!("{what} must be a bool, found {}", v.type_of())))
}

fn int_of(v: &IValue, what: &str) -> Result<i64> {
    v.as_int()
        .ok_or_else(|| Error::runtime(format!("{what} must be an int, found {}", v.type_of())))
}

impl Frame {
    pub fn new(graph: Arc<Graph>, kernels: Option<Arc<KernelTable>>, ctx: ExecContext) -> Self {
        Frame {
            graph,
            kernels,
            ctx,
        }
    }

    /// Run the whole graph. A single output is returned as is; several are
    /// packed into a tuple.
    pub fn run(&self, args: Vec<IValue>) -> Result<IValue> {
        let mut outputs = self.run_block(self.graph.top(), args, None)?;
        Ok(match outputs.len() {
            0 => IValue::None,
            1 => outputs.remove(0),
            _ => IValue::Tuple(outputs),
        })
    }

    fn run_block(&self, block: BlockId, params: Vec<IValue>, parent: Option<&Env<'_>>) -> Result<Vec<IValue>> {
        let b = self.graph.block(block);
        if params.len() != b.params.len() {
            return Err(Error::runtime(format!(
                "block expects {} values, got {}",
                b.params.len(),
                params.len()
            )));
        }
        let mut env = Env::new(parent);
        for (&p, v) in b.params.iter().zip(params) {
            env.set(p, v);
        }
        for &node in &b.nodes {
            self.run_node(node, &mut env)?;
        }
        b.returns.iter().map(|&v| env.get(v)).collect()
    }

    fn run_node(&self, id: NodeId, env: &mut Env<'_>) -> Result<()> {
        let node = self.graph.node(id);
        let inputs = node
            .inputs
            .iter()
            .map(|&v| env.get(v))
            .collect::<Result<Vec<_>>>()?;

        let outputs: Vec<IValue> = match &node.kind {
            NodeKind::Constant(c) => vec![IValue::from_constant(c)],
            NodeKind::Op(schema) => {
                let recorded = needs_grad(&inputs).then(|| inputs.clone());
                let out = ops::dispatch(schema, inputs)?;
                if let Some(recorded) = recorded {
                    self.ctx.autograd.record(schema, &recorded, &out);
                }
                vec![out]
            }
            NodeKind::If => {
                let cond = bool_of(&inputs[0], "if condition")?;
                let block = node.blocks[if cond { 0 } else { 1 }];
                self.run_block(block, inputs[1..].to_vec(), Some(&*env))?
            }
            NodeKind::Loop => self.run_loop(id, &inputs, env)?,
            NodeKind::CallFunction { name } => vec![self.ctx.unit.run_function(name, inputs)?],
            NodeKind::CallMethod { name } => {
                let object = inputs
                    .first()
                    .and_then(IValue::as_object)
                    .ok_or_else(|| Error::runtime(format!("method '{name}' called on a non-object")))?;
                let qualname = object.class().method_qualname(name);
                vec![self.ctx.unit.run_function(&qualname, inputs)?]
            }
            NodeKind::GetAttr { name } => {
                let object = inputs[0]
                    .as_object()
                    .ok_or_else(|| Error::attribute(format!("cannot read '{name}' of a non-object")))?;
                vec![object.get(name)?]
            }
            NodeKind::SetAttr { name } => {
                let object = inputs[0]
                    .as_object()
                    .ok_or_else(|| Error::attribute(format!("cannot set '{name}' of a non-object")))?;
                object.set(name, inputs[1].clone())?;
                vec![]
            }
            NodeKind::TupleConstruct => vec![IValue::Tuple(inputs)],
            NodeKind::TupleIndex { index } => {
                let items = inputs[0]
                    .as_tuple()
                    .ok_or_else(|| Error::runtime("TupleIndex on a non-tuple"))?;
                let item = items
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| Error::runtime("tuple index out of range"))?;
                vec![item]
            }
            NodeKind::TupleUnpack => {
                let items = inputs[0]
                    .as_tuple()
                    .ok_or_else(|| Error::runtime("cannot unpack a non-tuple"))?;
                items.to_vec()
            }
            NodeKind::ListConstruct => vec![IValue::List(inputs)],
            NodeKind::ListUnpack => {
                let items = inputs[0]
                    .as_list()
                    .ok_or_else(|| Error::runtime("cannot unpack a non-list"))?;
                if items.len() != node.outputs.len() {
                    return Err(Error::runtime(format!(
                        "cannot unpack a list of {} elements into {} values",
                        items.len(),
                        node.outputs.len()
                    )));
                }
                items.to_vec()
            }
            NodeKind::ListIndex => {
                let items = inputs[0]
                    .as_list()
                    .ok_or_else(|| Error::runtime("cannot index a non-list"))?;
                let index = int_of(&inputs[1], "list index")?;
                let len = items.len() as i64;
                let i = if index < 0 { index + len } else { index };
                if i < 0 || i >= len {
                    return Err(Error::runtime(format!("list index {index} out of range")));
                }
                vec![items[i as usize].clone()]
            }
            NodeKind::NamedTupleConstruct => match self.graph.value_type(node.outputs[0]) {
                Type::NamedTuple(nt) => vec![IValue::NamedTuple(nt.clone(), inputs)],
                other => {
                    return Err(Error::runtime(format!(
                        "NamedTupleConstruct produces {other}"
                    )))
                }
            },
            NodeKind::Fork => vec![IValue::Future(self.run_fork(node.blocks[0], inputs))],
            NodeKind::Wait => {
                let future = inputs[0]
                    .as_future()
                    .ok_or_else(|| Error::runtime("wait() on a value that is not a Future"))?;
                vec![fork::wait(future)?]
            }
            NodeKind::Uninitialized => vec![IValue::None],
            NodeKind::RaiseException => {
                let msg = inputs
                    .first()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .unwrap_or_else(|| "Exception".into());
                return Err(Error::Runtime(msg));
            }
            NodeKind::Print => {
                let parts: Vec<String> = inputs.iter().map(ToString::to_string).collect();
                println!("{}", parts.join(" "));
                vec![]
            }
            NodeKind::UnwrapOptional => {
                if inputs[0].is_none() {
                    return Err(Error::runtime("Unwrapping null optional"));
                }
                inputs
            }
            NodeKind::IsNone => vec![IValue::Bool(inputs[0].is_none())],
            NodeKind::FusionGroup => {
                let kernel = self
                    .kernels
                    .as_ref()
                    .and_then(|table| table.get(&self.graph, id));
                match kernel {
                    Some(kernel) => kernel.run(&inputs)?,
                    None => self.run_block(node.blocks[0], inputs, Some(&*env))?,
                }
            }
        };

        if outputs.len() != node.outputs.len() {
            return Err(Error::runtime(format!(
                "{} produced {} values, expected {}",
                node.kind.name(),
                outputs.len(),
                node.outputs.len()
            )));
        }
        for (&v, value) in node.outputs.iter().zip(outputs) {
            env.set(v, value);
        }
        Ok(())
    }

    fn run_loop(&self, id: NodeId, inputs: &[IValue], env: &Env<'_>) -> Result<Vec<IValue>> {
        let node = self.graph.node(id);
        let body = node.blocks[0];
        let n_carried = node.outputs.len();
        let max_trip = int_of(&inputs[0], "loop trip count")?;
        let mut cond = bool_of(&inputs[1], "loop condition")?;
        let mut carried = inputs[2..2 + n_carried].to_vec();
        let captures = &inputs[2 + n_carried..];
        let mut iter = 0i64;
        while cond && iter < max_trip {
            let mut params = Vec::with_capacity(1 + carried.len() + captures.len());
            params.push(IValue::Int(iter));
            params.extend(carried);
            params.extend_from_slice(captures);
            let mut rets = self.run_block(body, params, Some(env))?;
            if rets.len() != n_carried + 1 {
                return Err(Error::runtime("loop body returned the wrong number of values"));
            }
            carried = rets.split_off(1);
            cond = bool_of(&rets[0], "loop condition")?;
            iter += 1;
        }
        Ok(carried)
    }

    fn run_fork(&self, body: BlockId, captures: Vec<IValue>) -> crate::fork::Future {
        let first = |mut rets: Vec<IValue>| -> Result<IValue> {
            if rets.is_empty() {
                Ok(IValue::None)
            } else {
                Ok(rets.remove(0))
            }
        };
        match &self.ctx.pool {
            Some(pool) => {
                let frame = self.clone();
                log::trace!("fork: task queued on the worker pool");
                pool.spawn(Box::new(move || {
                    frame.run_block(body, captures, None).and_then(first)
                }))
            }
            None => fork::run_inline(|| self.run_block(body, captures, None).and_then(first)),
        }
    }
}
