// Optimizing executor
//
// spec            argument profiles that key the plan cache
// graph_executor  profiling, specialization and the plan cache
// fused_kernel    compiles fusion groups into instruction streams

pub mod fused_kernel;
mod graph_executor;
pub mod spec;

pub use fused_kernel::{CompileStats, FusedKernel};
pub use graph_executor::{ExecutionPlan, ExecutorStats, GraphExecutor};
pub use spec::{ArgKind, ArgumentSpec};
