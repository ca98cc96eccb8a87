// Gradient recording hook
//
// Differentiation is not part of this runtime. Operators that see an input
// with `requires_grad` set report themselves to the hook installed in the
// executor configuration, which is where an external autograd engine plugs
// in. The default hook drops everything.

use std::fmt;
use std::sync::{Arc, Mutex};

use kestrel_ir::FunctionSchema;

use crate::value::IValue;

/// Receives every operator executed on gradient-requiring inputs.
pub trait AutogradHook: Send + Sync {
    fn record(&self, op: &FunctionSchema, inputs: &[IValue], output: &IValue);
}

/// Hook that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGrad;

impl AutogradHook for NoGrad {
    fn record(&self, _op: &FunctionSchema, _inputs: &[IValue], _output: &IValue) {}
}

/// Hook that keeps the qualified names of recorded operators, in order.
#[derive(Default)]
pub struct RecordingHook {
    ops: Mutex<Vec<String>>,
}

impl fmt::Debug for RecordingHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordingHook({} ops)", self.recorded().len())
    }
}

impl RecordingHook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn recorded(&self) -> Vec<String> {
        self.ops.lock().map(|ops| ops.clone()).unwrap_or_default()
    }
}

impl AutogradHook for RecordingHook {
    fn record(&self, op: &FunctionSchema, _inputs: &[IValue], _output: &IValue) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(op.qualified_name());
        }
    }
}

/// Whether any tensor among `inputs` requires a gradient.
pub(crate) fn needs_grad(inputs: &[IValue]) -> bool {
    inputs
        .iter()
        .any(|v| v.tensors().iter().any(|t| t.requires_grad()))
}
