// Fused kernels: FusionGroup bodies compiled into instruction tapes
//
// The fusion pass leaves each group as a block of pointwise operators and
// scalar constants. Interpreting that block walks the graph, hashes values
// into an environment and goes through the tracer hook per node. A fused
// kernel does that work once:
//
//   - Instruction tape in body order (flat Vec<Instruction>, no lookups)
//   - Pre-dispatched unary and binary ops; other operators keep their
//     schema and call the kernel table directly
//   - Memory plan: liveness analysis, slot reuse, early frees
//
// Each instruction runs the same kernel the interpreter would, so a fused
// group produces exactly the values of its unfused body.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use kestrel_core::{Scalar, Tensor};
use kestrel_ir::passes::{FusionPolicy, PointwiseFusion};
use kestrel_ir::{FunctionSchema, Graph, NodeId, NodeKind, ValueId};

use crate::error::{Error, Result};
use crate::ops::{run_op, scalar_tensor};
use crate::value::IValue;

// Instructions

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryInstr {
    Neg,
    Relu,
    Sigmoid,
    Tanh,
    Exp,
    Log,
    Sqrt,
    Abs,
    Gelu,
}

impl UnaryInstr {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "neg" => UnaryInstr::Neg,
            "relu" => UnaryInstr::Relu,
            "sigmoid" => UnaryInstr::Sigmoid,
            "tanh" => UnaryInstr::Tanh,
            "exp" => UnaryInstr::Exp,
            "log" => UnaryInstr::Log,
            "sqrt" => UnaryInstr::Sqrt,
            "abs" => UnaryInstr::Abs,
            "gelu" => UnaryInstr::Gelu,
            _ => return None,
        })
    }

    fn apply(self, t: &Tensor) -> kestrel_core::Result<Tensor> {
        match self {
            UnaryInstr::Neg => t.neg(),
            UnaryInstr::Relu => t.relu(),
            UnaryInstr::Sigmoid => t.sigmoid(),
            UnaryInstr::Tanh => t.tanh(),
            UnaryInstr::Exp => t.exp(),
            UnaryInstr::Log => t.log(),
            UnaryInstr::Sqrt => t.sqrt(),
            UnaryInstr::Abs => t.abs(),
            UnaryInstr::Gelu => t.gelu(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryInstr {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Remainder,
    Maximum,
    Minimum,
}

impl BinaryInstr {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "add" => BinaryInstr::Add,
            "sub" => BinaryInstr::Sub,
            "mul" => BinaryInstr::Mul,
            "div" => BinaryInstr::Div,
            "floordiv" => BinaryInstr::FloorDiv,
            "remainder" => BinaryInstr::Remainder,
            "maximum" => BinaryInstr::Maximum,
            "minimum" => BinaryInstr::Minimum,
            _ => return None,
        })
    }

    fn apply_scalar(self, a: &Tensor, s: Scalar) -> kestrel_core::Result<Tensor> {
        match self {
            BinaryInstr::Add => a.add_scalar(s),
            BinaryInstr::Sub => a.sub_scalar(s),
            BinaryInstr::Mul => a.mul_scalar(s),
            BinaryInstr::Div => a.div_scalar(s),
            _ => self.apply(a, &scalar_tensor(s, a.dtype())),
        }
    }

    fn apply(self, a: &Tensor, b: &Tensor) -> kestrel_core::Result<Tensor> {
        match self {
            BinaryInstr::Add => a.add(b),
            BinaryInstr::Sub => a.sub(b),
            BinaryInstr::Mul => a.mul(b),
            BinaryInstr::Div => a.div(b),
            BinaryInstr::FloorDiv => a.floor_div(b),
            BinaryInstr::Remainder => a.remainder(b),
            BinaryInstr::Maximum => a.maximum(b),
            BinaryInstr::Minimum => a.minimum(b),
        }
    }
}

/// One step of a fused kernel. Slots are indices into the kernel's
/// register file.
#[derive(Debug, Clone)]
pub enum Instruction {
    LoadInput {
        index: usize,
        dst: usize,
    },
    LoadConst {
        value: IValue,
        dst: usize,
    },
    Unary {
        op: UnaryInstr,
        src: usize,
        dst: usize,
        schema: Arc<FunctionSchema>,
    },
    Binary {
        op: BinaryInstr,
        lhs: usize,
        rhs: usize,
        dst: usize,
        schema: Arc<FunctionSchema>,
    },
    /// Any other pointwise operator, run through its kernel.
    Call {
        schema: Arc<FunctionSchema>,
        args: Vec<usize>,
        dst: usize,
    },
    Free {
        slot: usize,
    },
}

// Memory plan

/// When a value is produced and last read, in instruction order of the
/// fused body.
#[derive(Debug, Clone)]
pub struct ValueLifetime {
    pub value: ValueId,
    pub slot: usize,
    pub produced_at: usize,
    pub last_used_at: usize,
    pub is_output: bool,
    pub is_external: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPlan {
    pub num_slots: usize,
    pub lifetimes: Vec<ValueLifetime>,
    /// (slot, body position after which it is freed)
    pub free_points: Vec<(usize, usize)>,
    pub reuse_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CompileStats {
    pub num_instructions: usize,
    pub num_source_nodes: usize,
    pub num_slots: usize,
    pub num_reused: usize,
    pub num_frees: usize,
    pub num_dispatched: usize,
    pub compile_time_us: u64,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FusedKernel: {} instructions ({} source nodes), {} slots ({} reused), {} frees, {} pre-dispatched, compiled in {}μs",
            self.num_instructions,
            self.num_source_nodes,
            self.num_slots,
            self.num_reused,
            self.num_frees,
            self.num_dispatched,
            self.compile_time_us,
        )
    }
}

// Kernel

/// A compiled FusionGroup.
#[derive(Debug)]
pub struct FusedKernel {
    pub instructions: Vec<Instruction>,
    pub memory_plan: MemoryPlan,
    pub num_inputs: usize,
    pub output_slots: Vec<usize>,
    pub stats: CompileStats,
}

/// Slot allocator that hands freed slots back out.
#[derive(Default)]
struct Slots {
    next: usize,
    free: Vec<usize>,
    reused: usize,
}

impl Slots {
    fn alloc(&mut self) -> usize {
        match self.free.pop() {
            Some(s) => {
                self.reused += 1;
                s
            }
            None => {
                self.next += 1;
                self.next - 1
            }
        }
    }
}

/// Compile the body of FusionGroup `group` in `graph`.
pub fn compile_group(graph: &Graph, group: NodeId) -> Result<FusedKernel> {
    let start = Instant::now();
    let node = graph.node(group);
    let Some(&body_id) = node.blocks.first() else {
        return Err(Error::runtime("FusionGroup without a body"));
    };
    let body = graph.block(body_id);

    let outputs: HashSet<ValueId> = body.returns.iter().copied().collect();
    let external: HashSet<ValueId> = body.params.iter().copied().collect();

    // Last body position reading each value.
    let mut last_use: HashMap<ValueId, usize> = HashMap::new();
    for (pos, &n) in body.nodes.iter().enumerate() {
        for &v in &graph.node(n).inputs {
            last_use.insert(v, pos);
        }
    }

    let mut slots = Slots::default();
    let mut slot_of: HashMap<ValueId, usize> = HashMap::new();
    let mut produced_at: HashMap<ValueId, usize> = HashMap::new();
    let mut instructions = Vec::with_capacity(body.nodes.len() + body.params.len());
    let mut free_points = Vec::new();
    let mut dispatched = 0;

    for (index, &p) in body.params.iter().enumerate() {
        let dst = slots.alloc();
        slot_of.insert(p, dst);
        produced_at.insert(p, 0);
        instructions.push(Instruction::LoadInput { index, dst });
    }

    let slot = |slot_of: &HashMap<ValueId, usize>, v: ValueId| -> Result<usize> {
        slot_of
            .get(&v)
            .copied()
            .ok_or_else(|| Error::runtime(format!("fused kernel: value {v} read before it is produced")))
    };

    for (pos, &n) in body.nodes.iter().enumerate() {
        let node = graph.node(n);
        let [out] = node.outputs.as_slice() else {
            return Err(Error::runtime(format!(
                "fused kernel: node {} has {} outputs",
                node.kind.name(),
                node.outputs.len()
            )));
        };
        let dst = slots.alloc();
        let instr = match &node.kind {
            NodeKind::Constant(c) => Instruction::LoadConst {
                value: IValue::from_constant(c),
                dst,
            },
            NodeKind::Op(schema) => {
                let args = node
                    .inputs
                    .iter()
                    .map(|&v| slot(&slot_of, v))
                    .collect::<Result<Vec<_>>>()?;
                let unary = UnaryInstr::from_name(&schema.name).filter(|_| args.len() == 1);
                let binary = BinaryInstr::from_name(&schema.name).filter(|_| args.len() == 2);
                match (unary, binary) {
                    (Some(op), _) => {
                        dispatched += 1;
                        Instruction::Unary {
                            op,
                            src: args[0],
                            dst,
                            schema: schema.clone(),
                        }
                    }
                    (_, Some(op)) => {
                        dispatched += 1;
                        Instruction::Binary {
                            op,
                            lhs: args[0],
                            rhs: args[1],
                            dst,
                            schema: schema.clone(),
                        }
                    }
                    _ => Instruction::Call {
                        schema: schema.clone(),
                        args,
                        dst,
                    },
                }
            }
            other => {
                return Err(Error::runtime(format!(
                    "fused kernel: cannot compile {} node",
                    other.name()
                )))
            }
        };
        instructions.push(instr);
        slot_of.insert(*out, dst);
        produced_at.insert(*out, pos);

        // Release inputs whose last reader was this node.
        let mut released = HashSet::new();
        for &v in &node.inputs {
            if last_use.get(&v) == Some(&pos)
                && !outputs.contains(&v)
                && !external.contains(&v)
                && released.insert(v)
            {
                let s = slot(&slot_of, v)?;
                instructions.push(Instruction::Free { slot: s });
                free_points.push((s, pos));
                slots.free.push(s);
            }
        }
    }

    let output_slots = body
        .returns
        .iter()
        .map(|&v| slot(&slot_of, v))
        .collect::<Result<Vec<_>>>()?;

    let mut lifetimes: Vec<ValueLifetime> = slot_of
        .iter()
        .map(|(&value, &slot)| {
            let produced = produced_at.get(&value).copied().unwrap_or(0);
            ValueLifetime {
                value,
                slot,
                produced_at: produced,
                last_used_at: last_use.get(&value).copied().unwrap_or(produced),
                is_output: outputs.contains(&value),
                is_external: external.contains(&value),
            }
        })
        .collect();
    lifetimes.sort_by_key(|l| l.value);

    let num_frees = free_points.len();
    let memory_plan = MemoryPlan {
        num_slots: slots.next,
        lifetimes,
        free_points,
        reuse_count: slots.reused,
    };
    let stats = CompileStats {
        num_instructions: instructions.len(),
        num_source_nodes: body.nodes.len(),
        num_slots: slots.next,
        num_reused: slots.reused,
        num_frees,
        num_dispatched: dispatched,
        compile_time_us: start.elapsed().as_micros() as u64,
    };
    log::debug!("{stats}");

    Ok(FusedKernel {
        instructions,
        memory_plan,
        num_inputs: body.params.len(),
        output_slots,
        stats,
    })
}

fn get_slot(slots: &[Option<IValue>], idx: usize) -> Result<&IValue> {
    slots
        .get(idx)
        .and_then(Option::as_ref)
        .ok_or_else(|| Error::runtime(format!("fused kernel: slot {idx} is empty")))
}

fn tensor_in<'a>(slots: &'a [Option<IValue>], idx: usize, schema: &FunctionSchema) -> Result<&'a Tensor> {
    get_slot(slots, idx)?.as_tensor().ok_or_else(|| {
        Error::runtime(format!(
            "fused kernel: {} expects a tensor operand",
            schema.qualified_name()
        ))
    })
}

fn scalar_of(v: &IValue) -> Option<Scalar> {
    match v {
        IValue::Int(n) => Some(Scalar::Int(*n)),
        IValue::Float(x) => Some(Scalar::Float(*x)),
        IValue::Bool(b) => Some(Scalar::Bool(*b)),
        _ => None,
    }
}

impl FusedKernel {
    /// Execute on the group's inputs and return its outputs.
    pub fn run(&self, inputs: &[IValue]) -> Result<Vec<IValue>> {
        if inputs.len() != self.num_inputs {
            return Err(Error::runtime(format!(
                "fused kernel expects {} inputs, got {}",
                self.num_inputs,
                inputs.len()
            )));
        }
        let mut slots: Vec<Option<IValue>> = vec![None; self.memory_plan.num_slots];
        for instr in &self.instructions {
            match instr {
                Instruction::LoadInput { index, dst } => {
                    slots[*dst] = Some(inputs[*index].clone());
                }
                Instruction::LoadConst { value, dst } => {
                    slots[*dst] = Some(value.clone());
                }
                Instruction::Unary {
                    op,
                    src,
                    dst,
                    schema,
                } => {
                    let t = tensor_in(&slots, *src, schema)?;
                    let out = op
                        .apply(t)
                        .map_err(|e| Error::op(schema.qualified_name(), e))?;
                    slots[*dst] = Some(IValue::Tensor(out));
                }
                Instruction::Binary {
                    op,
                    lhs,
                    rhs,
                    dst,
                    schema,
                } => {
                    let a = tensor_in(&slots, *lhs, schema)?;
                    let out = match get_slot(&slots, *rhs)? {
                        IValue::Tensor(b) => op.apply(a, b),
                        other => match scalar_of(other) {
                            Some(s) => op.apply_scalar(a, s),
                            None => {
                                return Err(Error::runtime(format!(
                                    "fused kernel: bad operand {} for {}",
                                    other.type_of(),
                                    schema.qualified_name()
                                )))
                            }
                        },
                    }
                    .map_err(|e| Error::op(schema.qualified_name(), e))?;
                    slots[*dst] = Some(IValue::Tensor(out));
                }
                Instruction::Call { schema, args, dst } => {
                    let args = args
                        .iter()
                        .map(|&s| get_slot(&slots, s).cloned())
                        .collect::<Result<Vec<_>>>()?;
                    slots[*dst] = Some(run_op(schema, &args)?);
                }
                Instruction::Free { slot } => {
                    slots[*slot] = None;
                }
            }
        }
        self.output_slots
            .iter()
            .map(|&s| get_slot(&slots, s).cloned())
            .collect()
    }
}

// Kernel cache per execution plan

/// Lazily compiled kernels for the FusionGroups of one plan. A group whose
/// body cannot be compiled is remembered and interpreted instead.
#[derive(Debug, Default)]
pub struct KernelTable {
    kernels: Mutex<HashMap<NodeId, Option<Arc<FusedKernel>>>>,
    compiled: AtomicUsize,
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel for `group`, compiling it on first use.
    pub fn get(&self, graph: &Graph, group: NodeId) -> Option<Arc<FusedKernel>> {
        let mut kernels = self.kernels.lock().ok()?;
        if let Some(k) = kernels.get(&group) {
            return k.clone();
        }
        let kernel = match compile_group(graph, group) {
            Ok(k) => {
                self.compiled.fetch_add(1, Ordering::Relaxed);
                Some(Arc::new(k))
            }
            Err(e) => {
                log::debug!("fusion group {:?} left to the interpreter: {e}", group);
                None
            }
        };
        kernels.insert(group, kernel.clone());
        kernel
    }

    /// Number of kernels compiled so far.
    pub fn compiled(&self) -> usize {
        self.compiled.load(Ordering::Relaxed)
    }
}

// Device fuser policy

/// Pointwise fusion restricted to tensors known to live on an accelerator.
#[derive(Debug, Clone)]
pub struct DeviceFusion {
    pub inner: PointwiseFusion,
}

impl DeviceFusion {
    pub fn new(min_group_size: usize) -> Self {
        DeviceFusion {
            inner: PointwiseFusion {
                min_group_size,
                require_complete_shapes: false,
                label: "device".into(),
            },
        }
    }
}

impl FusionPolicy for DeviceFusion {
    fn can_fuse(&self, graph: &Graph, node: NodeId) -> bool {
        if !self.inner.can_fuse(graph, node) {
            return false;
        }
        graph.node(node).outputs.iter().all(|&o| {
            graph
                .value_type(o)
                .as_tensor()
                .and_then(|t| t.device)
                .is_some_and(|d| d.is_accelerator())
        })
    }

    fn min_group_size(&self) -> usize {
        self.inner.min_group_size
    }

    fn name(&self) -> &str {
        &self.inner.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::DType;
    use kestrel_ir::passes::fuse_pointwise;
    use kestrel_ir::{InsertPoint, Type};

    /// relu(x * 2 + y) as one fused group.
    fn fused_graph() -> (Graph, NodeId) {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), Some("x"));
        let y = g.add_input(Type::tensor(), Some("y"));
        let top = g.top();
        let two = g.insert_constant(InsertPoint::End(top), kestrel_ir::Constant::Int(2));
        let m = g.insert_op(InsertPoint::End(top), "mul", &[x, two], &[]).unwrap();
        let m = g.node(m).outputs[0];
        let a = g.insert_op(InsertPoint::End(top), "add", &[m, y], &[]).unwrap();
        let a = g.node(a).outputs[0];
        let r = g.insert_op(InsertPoint::End(top), "relu", &[a], &[]).unwrap();
        let r = g.node(r).outputs[0];
        g.set_outputs(&[r]);
        assert_eq!(fuse_pointwise(&mut g, &PointwiseFusion::default()), 1);
        let group = g
            .walk(top)
            .into_iter()
            .find(|&n| matches!(g.node(n).kind, NodeKind::FusionGroup))
            .unwrap();
        (g, group)
    }

    #[test]
    fn test_fused_kernel_matches_eager() {
        let (g, group) = fused_graph();
        let kernel = compile_group(&g, group).unwrap();
        assert!(kernel.stats.num_frees > 0);
        let x = Tensor::from_vec(vec![1.0, -2.0, 3.0], 3, DType::F32).unwrap();
        let y = Tensor::from_vec(vec![0.5, 0.5, -10.0], 3, DType::F32).unwrap();

        let inputs: Vec<IValue> = g
            .node(group)
            .inputs
            .iter()
            .map(|&v| match g.value(v).debug_name.as_deref() {
                Some("x") => IValue::Tensor(x.clone()),
                Some("y") => IValue::Tensor(y.clone()),
                _ => IValue::from_constant(g.constant_of(v).unwrap()),
            })
            .collect();
        let out = kernel.run(&inputs).unwrap();
        let expected = x.mul_scalar(Scalar::Int(2)).unwrap().add(&y).unwrap().relu().unwrap();
        assert!(out[0].as_tensor().unwrap().equal(&expected));
    }

    #[test]
    fn test_stats_display() {
        let (g, group) = fused_graph();
        let kernel = compile_group(&g, group).unwrap();
        let s = kernel.stats.to_string();
        assert!(s.starts_with("FusedKernel: "));
        assert!(s.contains("pre-dispatched"));
    }

    #[test]
    fn test_kernel_table_compiles_once() {
        let (g, group) = fused_graph();
        let table = KernelTable::new();
        assert!(table.get(&g, group).is_some());
        assert!(table.get(&g, group).is_some());
        assert_eq!(table.compiled(), 1);
    }

    #[test]
    fn test_device_policy_needs_accelerator_types() {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), None);
        let top = g.top();
        let a = g.insert_op(InsertPoint::End(top), "relu", &[x], &[]).unwrap();
        let a = g.node(a).outputs[0];
        let b = g.insert_op(InsertPoint::End(top), "exp", &[a], &[]).unwrap();
        let b = g.node(b).outputs[0];
        g.set_outputs(&[b]);
        assert_eq!(fuse_pointwise(&mut g, &DeviceFusion::new(2)), 0);
    }
}
