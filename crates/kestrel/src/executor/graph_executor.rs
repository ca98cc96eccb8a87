// Graph executor: profile, specialize, cache, run
//
// Every call is fingerprinted by its argument profile. Per fingerprint:
//
//   runs 1..=N        interpret the base graph (profiling runs)
//   run N+1           synthesize a specialized plan:
//                       clone ─► inline calls ─► shape propagation
//                       ─► cleanup passes ─► fusion ─► verify
//   later runs        cache hit, run the plan; fused kernels are compiled
//                     the first time each group executes
//
// With optimization disabled the base graph is interpreted directly.
// While tracing, the base graph is interpreted inline so the tracer sees
// every operator.
//
// The plan cache is shared by all callers. Two threads may race to build
// the same plan; the first insertion wins and the other plan is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use kestrel_ir::passes::{
    fuse_pointwise, inline_calls, optimize_graph, propagate_shapes, FusionPolicy, PointwiseFusion,
};
use kestrel_ir::{verify, Function, Graph, Type};

use crate::config::{ExecutorConfig, FuserKind};
use crate::error::{Error, Result};
use crate::fork::TaskPool;
use crate::interpreter::{ExecContext, Frame};
use crate::module::ScriptUnit;
use crate::profiler::{ProfileReport, Profiler};
use crate::tracer;
use crate::value::IValue;

use super::fused_kernel::{DeviceFusion, KernelTable};
use super::spec::ArgumentSpec;

/// A graph specialized for one argument profile and fuser.
#[derive(Debug)]
pub struct ExecutionPlan {
    pub graph: Arc<Graph>,
    pub spec: ArgumentSpec,
    pub fuser: FuserKind,
    pub fused_groups: usize,
    kernels: Arc<KernelTable>,
}

impl ExecutionPlan {
    /// Fused kernels compiled so far for this plan.
    pub fn kernels_compiled(&self) -> usize {
        self.kernels.compiled()
    }
}

/// Counters of one executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub runs: usize,
    pub profiling_runs: usize,
    /// Runs that interpreted the base graph because optimization was off.
    pub fallback_runs: usize,
    pub plans_built: usize,
    pub cache_hits: usize,
    pub fused_groups: usize,
    pub kernels_compiled: usize,
}

impl fmt::Display for ExecutorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GraphExecutor: {} runs ({} profiling, {} unoptimized), {} plans built, {} cache hits, {} fused groups, {} kernels compiled",
            self.runs,
            self.profiling_runs,
            self.fallback_runs,
            self.plans_built,
            self.cache_hits,
            self.fused_groups,
            self.kernels_compiled,
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    runs: AtomicUsize,
    profiling_runs: AtomicUsize,
    fallback_runs: AtomicUsize,
    plans_built: AtomicUsize,
    cache_hits: AtomicUsize,
}

type PlanKey = (ArgumentSpec, FuserKind);

/// Executes one compiled function.
pub struct GraphExecutor {
    function: Arc<Function>,
    config: Option<ExecutorConfig>,
    plans: Mutex<HashMap<PlanKey, Arc<ExecutionPlan>>>,
    profile_counts: Mutex<HashMap<PlanKey, usize>>,
    counters: Counters,
    profiler: Mutex<Profiler>,
}

impl fmt::Debug for GraphExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphExecutor")
            .field("function", &self.function.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn poisoned() -> Error {
    Error::runtime("executor lock poisoned")
}

impl GraphExecutor {
    /// Executor for `function`. Without a config, the global flags are read
    /// on every call.
    pub fn new(function: Arc<Function>, config: Option<ExecutorConfig>) -> Self {
        GraphExecutor {
            function,
            config,
            plans: Mutex::new(HashMap::new()),
            profile_counts: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            profiler: Mutex::new(Profiler::new()),
        }
    }

    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }

    /// Settings in effect for the next call.
    pub fn config(&self) -> ExecutorConfig {
        self.config.clone().unwrap_or_else(ExecutorConfig::from_globals)
    }

    /// Run on arguments already bound to the function's schema.
    pub(crate) fn run(&self, unit: &Arc<ScriptUnit>, args: Vec<IValue>) -> Result<IValue> {
        let config = self.config();
        self.counters.runs.fetch_add(1, Ordering::Relaxed);

        if tracer::is_tracing() {
            return self.interpret(unit, &config, None, args);
        }
        let pool = Some(TaskPool::shared(config.num_workers)?);
        if !config.optimize {
            self.counters.fallback_runs.fetch_add(1, Ordering::Relaxed);
            return self.interpret(unit, &config, pool, args);
        }

        let key = (ArgumentSpec::new(&args), config.fuser);
        let cached = self.plans.lock().map_err(|_| poisoned())?.get(&key).cloned();
        let plan = match cached {
            Some(plan) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                plan
            }
            None => {
                let seen = {
                    let mut counts = self.profile_counts.lock().map_err(|_| poisoned())?;
                    let seen = counts.entry(key.clone()).or_insert(0);
                    *seen += 1;
                    *seen
                };
                if seen <= config.profiling_runs {
                    self.counters.profiling_runs.fetch_add(1, Ordering::Relaxed);
                    log::trace!(
                        "{}: profiling run {seen}/{} for {}",
                        self.function.name,
                        config.profiling_runs,
                        key.0
                    );
                    return self.interpret(unit, &config, pool, args);
                }
                let plan = Arc::new(self.build_plan(unit, &key.0, &config)?);
                let mut plans = self.plans.lock().map_err(|_| poisoned())?;
                plans.entry(key).or_insert(plan).clone()
            }
        };

        let ctx = ExecContext {
            unit: unit.clone(),
            pool,
            autograd: config.autograd.clone(),
        };
        Frame::new(plan.graph.clone(), Some(plan.kernels.clone()), ctx).run(args)
    }

    fn interpret(
        &self,
        unit: &Arc<ScriptUnit>,
        config: &ExecutorConfig,
        pool: Option<Arc<TaskPool>>,
        args: Vec<IValue>,
    ) -> Result<IValue> {
        let ctx = ExecContext {
            unit: unit.clone(),
            pool,
            autograd: config.autograd.clone(),
        };
        Frame::new(self.function.graph.clone(), None, ctx).run(args)
    }

    fn build_plan(
        &self,
        unit: &ScriptUnit,
        spec: &ArgumentSpec,
        config: &ExecutorConfig,
    ) -> Result<ExecutionPlan> {
        let start = Instant::now();
        let mut prof = self.profiler.lock().map_err(|_| poisoned())?;
        let mut graph = (*self.function.graph).clone();

        let cu = unit.unit();
        let lookup = |name: &str| cu.find_function(name).map(|f| f.graph.clone());
        let mut inlined = graph.clone();
        match prof.measure("inline", "pass", || inline_calls(&mut inlined, &lookup)) {
            Ok(_) => graph = inlined,
            Err(e) => log::warn!("{}: calls left in place: {e}", self.function.name),
        }

        let declared: Vec<Type> = self
            .function
            .schema
            .arguments
            .iter()
            .map(|a| a.ty.clone())
            .collect();
        let input_types = spec.to_types(&declared);
        prof.measure("shape propagation", "pass", || {
            propagate_shapes(&mut graph, &input_types)
        });
        prof.measure("optimize", "pass", || optimize_graph(&mut graph));

        let fused_groups = if config.fuser == FuserKind::None {
            0
        } else if spec.any_requires_grad() {
            log::debug!("{}: fusion skipped, an input requires grad", self.function.name);
            0
        } else {
            let policy: Box<dyn FusionPolicy> = match config.fuser {
                FuserKind::Device => Box::new(DeviceFusion::new(config.min_fusion_group_size)),
                kind => Box::new(PointwiseFusion {
                    min_group_size: config.min_fusion_group_size,
                    require_complete_shapes: kind == FuserKind::TensorExpr,
                    label: kind.name().to_string(),
                }),
            };
            prof.measure("fusion", "pass", || fuse_pointwise(&mut graph, policy.as_ref()))
        };

        let graph = match verify(&graph) {
            Ok(()) => graph,
            Err(e) => {
                log::warn!(
                    "{}: specialized graph failed verification, using the base graph: {e}",
                    self.function.name
                );
                (*self.function.graph).clone()
            }
        };
        prof.end_event(start, "build plan", "plan");
        drop(prof);

        self.counters.plans_built.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "{}: specialized for {spec} with {} ({fused_groups} fused group(s))",
            self.function.name,
            config.fuser
        );
        Ok(ExecutionPlan {
            graph: Arc::new(graph),
            spec: spec.clone(),
            fuser: config.fuser,
            fused_groups,
            kernels: Arc::new(KernelTable::new()),
        })
    }

    /// Cached plans, in no particular order.
    pub fn plans(&self) -> Vec<Arc<ExecutionPlan>> {
        self.plans
            .lock()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all cached plans and profiling counts.
    pub fn reset_cache(&self) {
        if let Ok(mut plans) = self.plans.lock() {
            plans.clear();
        }
        if let Ok(mut counts) = self.profile_counts.lock() {
            counts.clear();
        }
        log::debug!("{}: plan cache cleared", self.function.name);
    }

    pub fn stats(&self) -> ExecutorStats {
        let plans = self.plans();
        ExecutorStats {
            runs: self.counters.runs.load(Ordering::Relaxed),
            profiling_runs: self.counters.profiling_runs.load(Ordering::Relaxed),
            fallback_runs: self.counters.fallback_runs.load(Ordering::Relaxed),
            plans_built: self.counters.plans_built.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            fused_groups: plans.iter().map(|p| p.fused_groups).sum(),
            kernels_compiled: plans.iter().map(|p| p.kernels_compiled()).sum(),
        }
    }

    /// Timing of plan synthesis so far.
    pub fn profile_report(&self) -> ProfileReport {
        self.profiler
            .lock()
            .map(|p| p.report())
            .unwrap_or_else(|_| Profiler::new().report())
    }
}
