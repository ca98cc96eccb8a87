// Executor configuration and process-wide execution flags
//
// Executors read their settings from an `ExecutorConfig`. One built
// explicitly is used as is; executors without one snapshot the global
// flags on every call through `ExecutorConfig::from_globals`.
//
// The global flags are atomics. Scoped overrides are guards that restore
// the previous value in `Drop`, so the old value comes back on normal exit,
// on `?` returns and while unwinding from a panic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::autograd::{AutogradHook, NoGrad};
use crate::error::{Error, Result};

/// Fuser backend used when building specialized plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FuserKind {
    /// Whole-graph pointwise fuser.
    #[default]
    Legacy,
    /// Tensor-expression fuser: fuses only fully shaped operators.
    TensorExpr,
    /// Device fuser: fuses only operators on accelerator tensors.
    Device,
    /// No fusion.
    None,
}

impl FuserKind {
    /// Parse `"fuser0"`, `"fuser1"`, `"fuser2"` or `"none"`.
    pub fn from_name(name: &str) -> Result<FuserKind> {
        match name {
            "fuser0" => Ok(FuserKind::Legacy),
            "fuser1" => Ok(FuserKind::TensorExpr),
            "fuser2" => Ok(FuserKind::Device),
            "none" => Ok(FuserKind::None),
            other => Err(Error::runtime(format!("unrecognized fuser option: '{other}'"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FuserKind::Legacy => "fuser0",
            FuserKind::TensorExpr => "fuser1",
            FuserKind::Device => "fuser2",
            FuserKind::None => "none",
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            FuserKind::Legacy => 0,
            FuserKind::TensorExpr => 1,
            FuserKind::Device => 2,
            FuserKind::None => 3,
        }
    }

    fn from_bits(bits: u8) -> FuserKind {
        match bits {
            1 => FuserKind::TensorExpr,
            2 => FuserKind::Device,
            3 => FuserKind::None,
            _ => FuserKind::Legacy,
        }
    }
}

impl fmt::Display for FuserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Global flags

static OPTIMIZE: AtomicBool = AtomicBool::new(true);
static FUSER: AtomicU8 = AtomicU8::new(0);
static PROFILING_MODE: AtomicBool = AtomicBool::new(true);

/// Whether specialization and fusion are enabled globally.
pub fn optimized_execution() -> bool {
    OPTIMIZE.load(Ordering::SeqCst)
}

/// Set the global optimize flag; returns the previous value.
pub fn set_optimized_execution(enabled: bool) -> bool {
    OPTIMIZE.swap(enabled, Ordering::SeqCst)
}

pub fn fuser() -> FuserKind {
    FuserKind::from_bits(FUSER.load(Ordering::SeqCst))
}

/// Select the global fuser; returns the previous one.
pub fn set_fuser(kind: FuserKind) -> FuserKind {
    FuserKind::from_bits(FUSER.swap(kind.to_bits(), Ordering::SeqCst))
}

/// Whether executors profile before committing to a plan.
pub fn profiling_mode() -> bool {
    PROFILING_MODE.load(Ordering::SeqCst)
}

pub fn set_profiling_mode(enabled: bool) -> bool {
    PROFILING_MODE.swap(enabled, Ordering::SeqCst)
}

/// Restores the optimize flag when dropped.
#[must_use = "the previous value is restored when the guard is dropped"]
#[derive(Debug)]
pub struct OptimizedExecutionGuard {
    previous: bool,
}

impl OptimizedExecutionGuard {
    pub fn new(enabled: bool) -> Self {
        let previous = set_optimized_execution(enabled);
        log::debug!("optimized execution set to {enabled} (was {previous})");
        OptimizedExecutionGuard { previous }
    }
}

impl Drop for OptimizedExecutionGuard {
    fn drop(&mut self) {
        set_optimized_execution(self.previous);
    }
}

/// Restores the fuser selection (and profiling mode) when dropped.
#[must_use = "the previous fuser is restored when the guard is dropped"]
#[derive(Debug)]
pub struct FuserGuard {
    previous: FuserKind,
    previous_profiling: bool,
}

impl FuserGuard {
    pub fn new(kind: FuserKind) -> Self {
        let previous_profiling = if kind == FuserKind::TensorExpr {
            set_profiling_mode(true)
        } else {
            profiling_mode()
        };
        let previous = set_fuser(kind);
        log::debug!("fuser set to {kind} (was {previous})");
        FuserGuard {
            previous,
            previous_profiling,
        }
    }

    /// Guard selecting the fuser called `name`.
    pub fn by_name(name: &str) -> Result<Self> {
        Ok(Self::new(FuserKind::from_name(name)?))
    }
}

impl Drop for FuserGuard {
    fn drop(&mut self) {
        set_fuser(self.previous);
        set_profiling_mode(self.previous_profiling);
    }
}

/// Run `f` with the optimize flag set to `enabled`.
pub fn with_optimized_execution<R>(enabled: bool, f: impl FnOnce() -> R) -> R {
    let _guard = OptimizedExecutionGuard::new(enabled);
    f()
}

/// Run `f` with fuser `name` selected.
pub fn with_fuser<R>(name: &str, f: impl FnOnce() -> R) -> Result<R> {
    let _guard = FuserGuard::by_name(name)?;
    Ok(f())
}

// ExecutorConfig

/// Number of profiling runs before a plan is built.
pub const DEFAULT_PROFILING_RUNS: usize = 1;

/// Settings of a graph executor.
#[derive(Clone)]
pub struct ExecutorConfig {
    /// Build specialized plans; interpret the base graph otherwise.
    pub optimize: bool,
    pub fuser: FuserKind,
    /// Executions per input profile that run unoptimized first.
    pub profiling_runs: usize,
    /// Size of the worker pool running forked tasks.
    pub num_workers: usize,
    pub min_fusion_group_size: usize,
    pub autograd: Arc<dyn AutogradHook>,
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("optimize", &self.optimize)
            .field("fuser", &self.fuser)
            .field("profiling_runs", &self.profiling_runs)
            .field("num_workers", &self.num_workers)
            .field("min_fusion_group_size", &self.min_fusion_group_size)
            .finish_non_exhaustive()
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            optimize: true,
            fuser: FuserKind::Legacy,
            profiling_runs: DEFAULT_PROFILING_RUNS,
            num_workers: default_workers(),
            min_fusion_group_size: 2,
            autograd: Arc::new(NoGrad),
        }
    }
}

impl ExecutorConfig {
    /// Snapshot of the process-wide flags.
    pub fn from_globals() -> Self {
        Self {
            optimize: optimized_execution(),
            fuser: fuser(),
            profiling_runs: if profiling_mode() { DEFAULT_PROFILING_RUNS } else { 0 },
            ..Self::default()
        }
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn with_fuser(mut self, fuser: FuserKind) -> Self {
        self.fuser = fuser;
        self
    }

    pub fn with_profiling_runs(mut self, runs: usize) -> Self {
        self.profiling_runs = runs;
        self
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n.max(1);
        self
    }

    pub fn with_min_fusion_group_size(mut self, n: usize) -> Self {
        self.min_fusion_group_size = n.max(1);
        self
    }

    pub fn with_autograd(mut self, hook: Arc<dyn AutogradHook>) -> Self {
        self.autograd = hook;
        self
    }
}
