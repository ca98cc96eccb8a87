//! # Kestrel
//!
//! A compiled script runtime: typed graphs, a specializing executor,
//! fork/wait tasks, tracing, module freezing and portable archives.
//!
//! ## Usage
//!
//! ```rust
//! use kestrel::{IValue, ScriptUnit};
//!
//! let unit = ScriptUnit::compile(
//!     "def scale(x: int, k: int = 2) -> int { return x * k; }",
//! ).unwrap();
//! let scale = unit.get_function("scale").unwrap();
//! assert_eq!(scale.call(vec![IValue::Int(21)]).unwrap().as_int(), Some(42));
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `kestrel-core` | Tensor, Shape, Layout, DType, Device |
//! | `kestrel-ir` | Types, Graph IR, operator schemas, script compiler, passes |
//! | `kestrel` | Runtime values, interpreter, executor, tasks, modules, archives |
//!
//! ## Modules
//!
//! - [`module`] — ScriptUnit, ScriptFunction, Module, Method
//! - [`executor`] — profiling executor, plan cache, fused kernels
//! - [`fork`] — Future, worker pool, `fork` / `wait`
//! - [`tracer`] — record a host closure into a graph
//! - [`freeze`] — inline module state into method graphs
//! - [`serialize`] — save / load archives with upgraders
//! - [`config`] — executor configuration and scoped global flags
//! - [`profiler`] — timing of plan synthesis and kernel compilation

pub mod autograd;
pub mod config;
pub mod error;
pub mod executor;
pub mod fork;
pub mod freeze;
pub(crate) mod interpreter;
pub mod module;
pub mod ops;
pub mod profiler;
pub mod serialize;
pub mod tracer;
pub mod value;

/// Re-export the tensor crate.
pub use kestrel_core as core;

/// Re-export the IR crate.
pub use kestrel_ir as ir;

pub use kestrel_core::{DType, Device, Tensor};

pub use autograd::{AutogradHook, NoGrad};
pub use config::{ExecutorConfig, FuserGuard, FuserKind, OptimizedExecutionGuard};
pub use error::{Error, Result};
pub use executor::{ExecutorStats, GraphExecutor};
pub use fork::{fork, wait, Future, Invocable};
pub use freeze::freeze;
pub use module::{export_opnames, Method, Module, ScriptFunction, ScriptUnit};
pub use serialize::{load, save, ExtraFiles, Loaded, MapLocation};
pub use tracer::trace;
pub use value::{IValue, Object};
