// Tracer: record eager execution into a graph
//
// `trace` runs a host closure on example tensors while every operator it
// executes is appended to a fresh graph:
//
//   example tensors ─► graph inputs x0, x1, ...
//   each dispatched op ─► Op node, its output tensor remembered by id
//   fork(...) ─► Fork node whose body holds the ops the task ran
//   wait(...) ─► Wait node on the recorded Fork output
//
// Tensors the closure did not get from an input or an op (captured
// weights, freshly built literals) become constants. Non-tensor values
// produced by ops are not tracked, so anything computed from them is baked
// in as a constant as well. In-place ops rebind their tensor to the new
// output, which keeps later reads ordered after the write.
//
// State is per thread; tracing is not reentrant.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use kestrel_core::{Tensor, TensorId};
use kestrel_ir::passes::{eliminate_dead_code, lift_captures};
use kestrel_ir::schema::Argument;
use kestrel_ir::{
    verify, BlockId, CompilationUnit, Constant, Function, FunctionSchema, Graph, InsertPoint,
    NodeKind, Type, ValueId,
};

use crate::error::{Error, Result};
use crate::fork::Future;
use crate::module::{ScriptFunction, ScriptUnit};
use crate::value::IValue;

struct TracingState {
    graph: Graph,
    /// Innermost block last.
    scopes: Vec<BlockId>,
    tensors: HashMap<TensorId, ValueId>,
    futures: HashMap<usize, ValueId>,
    /// First error raised by a forked task while tracing.
    failed: Option<Error>,
}

thread_local! {
    static STATE: RefCell<Option<TracingState>> = const { RefCell::new(None) };
}

/// Whether the current thread is inside [`trace`].
pub fn is_tracing() -> bool {
    STATE.with(|s| s.borrow().is_some())
}

/// Clears the tracing state when the traced closure returns or unwinds.
struct StateGuard;

impl Drop for StateGuard {
    fn drop(&mut self) {
        STATE.with(|s| s.borrow_mut().take());
    }
}

impl TracingState {
    fn scope(&self) -> BlockId {
        self.scopes.last().copied().unwrap_or_else(|| self.graph.top())
    }

    fn at(&self) -> InsertPoint {
        InsertPoint::End(self.scope())
    }

    /// Graph value for a tensor, if it was produced in a visible scope.
    fn lookup(&self, t: &Tensor) -> Option<ValueId> {
        let v = *self.tensors.get(&t.id())?;
        let def = self.graph.defining_block(v);
        self.graph.block_within(self.scope(), def).then_some(v)
    }

    /// Graph value standing for `value`, creating constants for anything
    /// that was not recorded.
    fn value_for(&mut self, value: &IValue, expected: &Type) -> Result<ValueId> {
        let at = self.at();
        match value {
            IValue::Tensor(t) => match self.lookup(t) {
                Some(v) => Ok(v),
                None => {
                    log::debug!("trace: tensor {:?} captured as a constant", t.id());
                    Ok(self.graph.insert_constant(at, Constant::Tensor(t.clone())))
                }
            },
            IValue::None => Ok(self
                .graph
                .insert_constant_typed(at, Constant::None, expected.clone())),
            IValue::Future(f) => self.futures.get(&f.id()).copied().ok_or_else(|| {
                Error::runtime("cannot trace a Future that was not created by fork() in this trace")
            }),
            IValue::List(items) if !value.tensors().is_empty() => {
                let elem = expected.element_type().cloned().unwrap_or_else(Type::tensor);
                let vals = items
                    .iter()
                    .map(|v| self.value_for(v, &elem))
                    .collect::<Result<Vec<_>>>()?;
                let ty = Type::list(elem);
                let node = self.graph.insert(at, NodeKind::ListConstruct, &vals, vec![ty]);
                Ok(self.graph.node(node).outputs[0])
            }
            IValue::Tuple(items) if !value.tensors().is_empty() => {
                let expected = expected.tuple_elements().unwrap_or_default();
                let vals = items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| self.value_for(v, expected.get(i).unwrap_or(&Type::Any)))
                    .collect::<Result<Vec<_>>>()?;
                let ty = Type::Tuple(vals.iter().map(|&v| self.graph.value_type(v).clone()).collect());
                let node = self.graph.insert(at, NodeKind::TupleConstruct, &vals, vec![ty]);
                Ok(self.graph.node(node).outputs[0])
            }
            other => match other.to_constant() {
                Some(c) => Ok(self.graph.insert_constant(at, c)),
                None => Err(Error::runtime(format!(
                    "cannot record a value of type {} in a trace",
                    other.type_of()
                ))),
            },
        }
    }

    fn bind_output(&mut self, value: &IValue, v: ValueId) {
        if let IValue::Tensor(t) = value {
            self.tensors.insert(t.id(), v);
        }
    }
}

fn with_state<R>(f: impl FnOnce(&mut TracingState) -> R) -> Option<R> {
    STATE.with(|s| s.borrow_mut().as_mut().map(f))
}

/// Append an executed operator to the trace.
pub(crate) fn record_op(schema: &Arc<FunctionSchema>, args: &[IValue], output: &IValue) -> Result<()> {
    with_state(|state| {
        let inputs = args
            .iter()
            .zip(&schema.arguments)
            .map(|(v, param)| state.value_for(v, &param.ty))
            .collect::<Result<Vec<_>>>()?;
        let at = state.at();
        let node = state
            .graph
            .insert(at, NodeKind::Op(schema.clone()), &inputs, vec![schema.returns.clone()]);
        let out = state.graph.node(node).outputs[0];
        state.bind_output(output, out);
        Ok(())
    })
    .unwrap_or(Ok(()))
}

/// Run a fork body inline and record it as a Fork node.
pub(crate) fn record_fork(body: impl FnOnce() -> Result<IValue>) -> Future {
    let fork = with_state(|state| {
        let at = state.at();
        let node = state.graph.insert(at, NodeKind::Fork, &[], vec![]);
        let block = state.graph.add_block(node);
        state.scopes.push(block);
        (node, block)
    });
    let Some((node, block)) = fork else {
        return Future::from_result(body());
    };
    let result = body();
    let recorded = with_state(|state| -> Result<(ValueId, IValue)> {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                state.scopes.pop();
                state.failed.get_or_insert(e.clone());
                return Err(e);
            }
        };
        let ret = state.value_for(&value, &Type::Any);
        state.scopes.pop();
        let ret = ret?;
        state.graph.add_block_return(block, ret);
        let ty = Type::future(state.graph.value_type(ret).clone());
        Ok((state.graph.add_node_output(node, ty), value))
    });
    match recorded {
        Some(Ok((out, value))) => {
            let future = Future::completed(value);
            with_state(|state| state.futures.insert(future.id(), out));
            future
        }
        Some(Err(e)) => Future::failed(e),
        None => Future::failed(Error::runtime("tracing state lost inside fork")),
    }
}

/// Record the `wait` on a traced future.
pub(crate) fn record_wait(future: &Future, value: &IValue) -> Result<()> {
    with_state(|state| {
        let Some(&fut) = state.futures.get(&future.id()) else {
            return Ok(());
        };
        let ty = match state.graph.value_type(fut) {
            Type::Future(inner) => (**inner).clone(),
            _ => value.type_of(),
        };
        let at = state.at();
        let node = state.graph.insert(at, NodeKind::Wait, &[fut], vec![ty]);
        let out = state.graph.node(node).outputs[0];
        state.bind_output(value, out);
        Ok(())
    })
    .unwrap_or(Ok(()))
}

/// Trace `f` on `example_inputs` and compile the recorded graph into a
/// function called `name`.
///
/// ```ignore
/// let traced = kestrel::trace("double", &[x], |inputs| {
///     kestrel::ops::call("mul", vec![inputs[0].clone(), 2i64.into()], vec![])
/// })?;
/// ```
pub fn trace<F>(name: &str, example_inputs: &[Tensor], f: F) -> Result<ScriptFunction>
where
    F: FnOnce(&[IValue]) -> Result<IValue>,
{
    if is_tracing() {
        return Err(Error::runtime("trace() cannot be called while already tracing"));
    }
    let mut graph = Graph::new();
    let mut tensors = HashMap::new();
    let mut arguments = Vec::with_capacity(example_inputs.len());
    for (i, t) in example_inputs.iter().enumerate() {
        let arg_name = format!("x{i}");
        let v = graph.add_input(Type::tensor(), Some(&arg_name));
        tensors.insert(t.id(), v);
        arguments.push(Argument {
            name: arg_name,
            ty: Type::tensor(),
            default: None,
            kwarg_only: false,
        });
    }
    let top = graph.top();
    STATE.with(|s| {
        *s.borrow_mut() = Some(TracingState {
            graph,
            scopes: vec![top],
            tensors,
            futures: HashMap::new(),
            failed: None,
        })
    });
    let _guard = StateGuard;

    let inputs: Vec<IValue> = example_inputs.iter().cloned().map(IValue::Tensor).collect();
    let result = f(&inputs)?;

    let state = STATE
        .with(|s| s.borrow_mut().take())
        .ok_or_else(|| Error::runtime("tracing state lost"))?;
    finish(name, state, &result, arguments)
}

fn finish(
    name: &str,
    mut state: TracingState,
    result: &IValue,
    arguments: Vec<Argument>,
) -> Result<ScriptFunction> {
    if let Some(e) = state.failed.take() {
        return Err(e);
    }
    state.scopes.truncate(1);
    let out = state.value_for(result, &Type::Any)?;
    let returns = state.graph.value_type(out).clone();
    let mut graph = state.graph;
    graph.set_outputs(&[out]);
    lift_captures(&mut graph);
    eliminate_dead_code(&mut graph);
    let graph = graph.compacted()?;
    verify(&graph)?;
    log::debug!("traced '{name}': {} node(s)", graph.node_count());

    let mut unit = CompilationUnit::new();
    unit.add_function(Function {
        name: name.to_string(),
        schema: FunctionSchema::new(name, arguments, returns),
        graph: Arc::new(graph),
        owner: None,
    })?;
    ScriptUnit::from_unit(unit).get_function(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::call;
    use kestrel_core::DType;

    #[test]
    fn test_trace_records_ops() {
        let x = Tensor::from_vec(vec![1.0, -2.0], 2, DType::F32).unwrap();
        let f = trace("f", &[x.clone()], |inputs| {
            let y = call("mul", vec![inputs[0].clone(), IValue::Int(2)], vec![])?;
            call("relu", vec![y], vec![])
        })
        .unwrap();
        assert!(!is_tracing());
        let ops: Vec<String> = f
            .graph()
            .walk(f.graph().top())
            .into_iter()
            .filter_map(|n| f.graph().node(n).kind.as_op().map(|s| s.qualified_name()))
            .collect();
        assert_eq!(ops, vec!["mul.Scalar", "relu"]);

        let z = Tensor::from_vec(vec![-3.0, 4.0], 2, DType::F32).unwrap();
        let r = f.call(vec![z.into()]).unwrap();
        assert_eq!(r.as_tensor().unwrap().to_vec().unwrap(), vec![0.0, 8.0]);
    }

    #[test]
    fn test_nested_trace_is_rejected() {
        let x = Tensor::ones(1, DType::F32);
        let err = trace("outer", &[x.clone()], |inputs| {
            trace("inner", &[x.clone()], |i| Ok(i[0].clone()))?;
            Ok(inputs[0].clone())
        })
        .unwrap_err();
        assert!(err.to_string().contains("already tracing"));
        assert!(!is_tracing());
    }

    #[test]
    fn test_state_cleared_after_error() {
        let x = Tensor::ones(1, DType::F32);
        let r = trace("bad", &[x], |_| Err(Error::runtime("stop")));
        assert!(r.is_err());
        assert!(!is_tracing());
    }
}
