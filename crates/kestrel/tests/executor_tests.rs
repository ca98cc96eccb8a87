// Executor tests — profiling, plan cache, fusion and argument checking

use std::sync::Arc;

use kestrel::autograd::RecordingHook;
use kestrel::config::{self, FuserGuard, FuserKind, OptimizedExecutionGuard};
use kestrel::ir::CompilationUnit;
use kestrel::{ops, DType, Error, ExecutorConfig, IValue, ScriptUnit, Tensor};

// Helpers

fn unit_with(src: &str, config: ExecutorConfig) -> Arc<ScriptUnit> {
    let mut cu = CompilationUnit::new();
    cu.define(src).expect("failed to compile");
    ScriptUnit::with_config(cu, config)
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "mismatch at {i}: {x} vs {y} (tol={tol})");
    }
}

fn values(v: &IValue) -> Vec<f64> {
    v.as_tensor().expect("expected a tensor").to_vec().unwrap()
}

const OPTIONAL_INTLIST: &str = r#"
    def opt(x: Tensor, incr: Optional[List[int]] = None) -> Tensor {
        return _test_optional_intlist(x, incr);
    }
"#;

fn configs() -> Vec<ExecutorConfig> {
    vec![
        ExecutorConfig::default().with_optimize(false),
        ExecutorConfig::default().with_profiling_runs(0),
        ExecutorConfig::default().with_fuser(FuserKind::TensorExpr),
        ExecutorConfig::default().with_fuser(FuserKind::None),
    ]
}

// Alias semantics of the optional override

#[test]
fn test_optional_intlist_alias_and_copy() {
    for config in configs() {
        let unit = unit_with(OPTIONAL_INTLIST, config.clone());
        let opt = unit.get_function("opt").unwrap();
        // Several calls so profiling runs and planned runs both happen.
        for _ in 0..3 {
            let x = Tensor::from_vec(vec![1.0, 2.0], 2, DType::I64).unwrap();
            let aliased = opt.call(vec![x.clone().into()]).unwrap();
            x.set_item(&[0], 3.0).unwrap();
            assert_eq!(values(&aliased), vec![3.0, 2.0], "{config:?}");

            let fresh = opt
                .call(vec![x.clone().into(), vec![5i64, 4].into()])
                .unwrap();
            assert_eq!(values(&fresh), vec![8.0, 6.0], "{config:?}");
            x.set_item(&[1], 100.0).unwrap();
            assert_eq!(values(&fresh), vec![8.0, 6.0], "{config:?}");
        }
    }
}

#[test]
fn test_optional_intlist_eager() {
    let x = Tensor::from_vec(vec![1.0, 2.0], 2, DType::I64).unwrap();
    let aliased = ops::call("_test_optional_intlist", vec![x.clone().into(), IValue::None], vec![])
        .unwrap();
    assert!(aliased.as_tensor().unwrap().shares_storage(&x));
    x.set_item(&[0], 3.0).unwrap();
    assert_eq!(values(&aliased), vec![3.0, 2.0]);

    let fresh = ops::call(
        "_test_optional_intlist",
        vec![x.clone().into()],
        vec![("incr".to_string(), vec![5i64, 4].into())],
    )
    .unwrap();
    assert_eq!(values(&fresh), vec![8.0, 6.0]);
    assert!(!fresh.as_tensor().unwrap().shares_storage(&x));
}

// Type rejection

#[test]
fn test_float_list_rejected_eager_and_compiled() {
    let x = Tensor::from_vec(vec![1.0, 2.0], 2, DType::I64).unwrap();

    let eager = ops::call(
        "_test_optional_intlist",
        vec![x.clone().into(), vec![1.5f64, 2.0].into()],
        vec![],
    )
    .unwrap_err();
    assert!(matches!(eager, Error::Type(_)), "{eager:?}");
    assert!(eager.to_string().contains("must be"), "{eager}");

    let unit = unit_with(OPTIONAL_INTLIST, ExecutorConfig::default());
    let opt = unit.get_function("opt").unwrap();
    let compiled = opt
        .call(vec![x.clone().into(), vec![1.5f64, 2.0].into()])
        .unwrap_err();
    assert!(matches!(compiled, Error::ValueType(_)), "{compiled:?}");
    assert!(compiled.to_string().contains("incr"), "{compiled}");
}

#[test]
fn test_tensor_for_list_rejected() {
    let x = Tensor::from_vec(vec![1.0, 2.0], 2, DType::I64).unwrap();
    let eager = ops::call(
        "_test_optional_intlist",
        vec![x.clone().into(), x.clone().into()],
        vec![],
    )
    .unwrap_err();
    assert!(matches!(eager, Error::Type(_)));

    let unit = unit_with(OPTIONAL_INTLIST, ExecutorConfig::default());
    let compiled = unit
        .get_function("opt")
        .unwrap()
        .call(vec![x.clone().into(), x.into()])
        .unwrap_err();
    assert!(matches!(compiled, Error::ValueType(_)));
}

#[test]
fn test_missing_argument_and_unknown_keyword() {
    let unit = unit_with(OPTIONAL_INTLIST, ExecutorConfig::default());
    let opt = unit.get_function("opt").unwrap();
    assert!(matches!(opt.call(vec![]), Err(Error::ValueType(_))));
    let x = Tensor::zeros(2, DType::I64);
    let err = opt
        .call_with(vec![x.into()], vec![("step".to_string(), IValue::Int(1))])
        .unwrap_err();
    assert!(err.to_string().contains("step"), "{err}");
}

// Profiling and the plan cache

const CHAIN: &str = r#"
    def chain(x: Tensor) -> Tensor {
        y = x * 2.0;
        z = y + 1.0;
        return z.relu();
    }
"#;

#[test]
fn test_plan_built_after_profiling_runs() {
    let unit = unit_with(CHAIN, ExecutorConfig::default().with_profiling_runs(2));
    let chain = unit.get_function("chain").unwrap();
    let x = Tensor::from_vec(vec![-1.0, 0.5, 2.0], 3, DType::F32).unwrap();

    for _ in 0..2 {
        chain.call(vec![x.clone().into()]).unwrap();
    }
    let stats = chain.executor().unwrap().stats();
    assert_eq!(stats.profiling_runs, 2);
    assert_eq!(stats.plans_built, 0);

    let r = chain.call(vec![x.clone().into()]).unwrap();
    assert_close(&values(&r), &[0.0, 2.0, 5.0], 1e-6);
    chain.call(vec![x.clone().into()]).unwrap();

    let stats = chain.executor().unwrap().stats();
    assert_eq!(stats.runs, 4);
    assert_eq!(stats.plans_built, 1);
    assert_eq!(stats.cache_hits, 1);
}

#[test]
fn test_new_shape_gets_its_own_plan() {
    let unit = unit_with(CHAIN, ExecutorConfig::default().with_profiling_runs(0));
    let chain = unit.get_function("chain").unwrap();
    chain.call(vec![Tensor::ones(3, DType::F32).into()]).unwrap();
    chain.call(vec![Tensor::ones((2, 2), DType::F32).into()]).unwrap();
    chain.call(vec![Tensor::ones(3, DType::F32).into()]).unwrap();

    let exec = chain.executor().unwrap();
    assert_eq!(exec.plans().len(), 2);
    assert_eq!(exec.stats().cache_hits, 1);

    exec.reset_cache();
    assert!(exec.plans().is_empty());
    chain.call(vec![Tensor::ones(3, DType::F32).into()]).unwrap();
    assert_eq!(exec.stats().plans_built, 3);
}

#[test]
fn test_pointwise_chain_is_fused() {
    let unit = unit_with(
        CHAIN,
        ExecutorConfig::default()
            .with_profiling_runs(0)
            .with_fuser(FuserKind::Legacy),
    );
    let chain = unit.get_function("chain").unwrap();
    let x = Tensor::from_vec(vec![-3.0, 1.0], 2, DType::F32).unwrap();
    let r = chain.call(vec![x.into()]).unwrap();
    assert_close(&values(&r), &[0.0, 3.0], 1e-6);

    let exec = chain.executor().unwrap();
    let stats = exec.stats();
    assert!(stats.fused_groups >= 1, "{stats}");
    assert!(stats.kernels_compiled >= 1, "{stats}");
    let plan = &exec.plans()[0];
    assert!(plan.graph.to_string().contains("FusionGroup"));
    assert!(exec.profile_report().to_string().contains("fusion"));
}

#[test]
fn test_fusion_skipped_when_input_requires_grad() {
    let unit = unit_with(CHAIN, ExecutorConfig::default().with_profiling_runs(0));
    let chain = unit.get_function("chain").unwrap();
    let x = Tensor::ones(2, DType::F32).set_requires_grad(true);
    chain.call(vec![x.into()]).unwrap();
    assert_eq!(chain.executor().unwrap().stats().fused_groups, 0);
}

#[test]
fn test_autograd_hook_sees_ops_on_grad_inputs() {
    let hook = RecordingHook::new();
    let config = ExecutorConfig::default()
        .with_optimize(false)
        .with_autograd(hook.clone());
    let unit = unit_with(CHAIN, config);
    let chain = unit.get_function("chain").unwrap();

    chain.call(vec![Tensor::ones(2, DType::F32).into()]).unwrap();
    assert!(hook.recorded().is_empty());

    let x = Tensor::ones(2, DType::F32).set_requires_grad(true);
    chain.call(vec![x.into()]).unwrap();
    // Only the op reading `x` directly sees a grad-requiring input.
    assert_eq!(hook.recorded(), vec!["mul.Scalar".to_string()]);
}

#[test]
fn test_results_match_across_fusers() {
    let src = r#"
        def f(x: Tensor, y: Tensor, n: int) -> Tensor {
            acc = x;
            for i in range(n) {
                acc = (acc * y + 0.5).tanh() - x.sigmoid();
            }
            return acc;
        }
    "#;
    let x = Tensor::from_vec(vec![0.1, -0.2, 0.3, 0.9], (2, 2), DType::F64).unwrap();
    let y = Tensor::from_vec(vec![1.5, 0.5, -1.0, 2.0], (2, 2), DType::F64).unwrap();
    let args = || vec![x.clone().into(), y.clone().into(), IValue::Int(3)];

    let reference = {
        let unit = unit_with(src, ExecutorConfig::default().with_optimize(false));
        values(&unit.get_function("f").unwrap().call(args()).unwrap())
    };
    for kind in [FuserKind::Legacy, FuserKind::TensorExpr, FuserKind::Device, FuserKind::None] {
        let unit = unit_with(
            src,
            ExecutorConfig::default().with_profiling_runs(0).with_fuser(kind),
        );
        let f = unit.get_function("f").unwrap();
        for _ in 0..2 {
            assert_close(&values(&f.call(args()).unwrap()), &reference, 1e-12);
        }
    }
}

#[test]
fn test_range_near_integer_limit() {
    let src = r#"
        def first_step(n: int) -> int {
            c = 0;
            for i in range(0, n, 2) {
                c = c + 1;
                break;
            }
            return c;
        }
        def span(lo: int, hi: int) -> int {
            c = 0;
            for i in range(lo, hi) {
                c = c + 1;
            }
            return c;
        }
    "#;
    for config in [
        ExecutorConfig::default().with_optimize(false),
        ExecutorConfig::default().with_profiling_runs(0),
    ] {
        let unit = unit_with(src, config);
        let f = unit.get_function("first_step").unwrap();
        assert_eq!(f.call(vec![IValue::Int(i64::MAX)]).unwrap().as_int(), Some(1));

        let span = unit.get_function("span").unwrap();
        let err = span
            .call(vec![IValue::Int(i64::MIN), IValue::Int(i64::MAX)])
            .unwrap_err();
        assert!(err.to_string().contains("overflow"), "{err}");
    }
}

#[test]
fn test_item_arithmetic_runs() {
    let src = r#"
        def shifted(x: Tensor) -> float { return float(x.sum().item() + 1.0); }
        def positive(x: Tensor) -> bool { v = x.sum().item(); return v > 0.0; }
        def whole(x: Tensor) -> int { return int(-x.max().item()); }
    "#;
    for config in configs() {
        let unit = unit_with(src, config.clone());
        let shifted = unit.get_function("shifted").unwrap();
        let positive = unit.get_function("positive").unwrap();
        let whole = unit.get_function("whole").unwrap();
        for _ in 0..3 {
            let x = Tensor::from_vec(vec![1.0, 2.5], 2, DType::F64).unwrap();
            assert_eq!(shifted.call(vec![x.clone().into()]).unwrap().as_float(), Some(4.5), "{config:?}");
            assert_eq!(positive.call(vec![x.clone().into()]).unwrap().as_bool(), Some(true));
            assert_eq!(whole.call(vec![x.into()]).unwrap().as_int(), Some(-2));
        }
    }
}

#[test]
fn test_optional_unwrap() {
    let src = r#"
        def checked(x: Optional[Tensor]) -> Tensor {
            assert x is not None, "need x";
            return x.relu();
        }
        def forced(x: Optional[Tensor]) -> Tensor { return unwrap_optional(x) * 2.0; }
    "#;
    for config in configs() {
        let unit = unit_with(src, config.clone());
        let checked = unit.get_function("checked").unwrap();
        let forced = unit.get_function("forced").unwrap();
        for _ in 0..3 {
            let x = Tensor::from_vec(vec![-1.0, 2.0], 2, DType::F64).unwrap();
            assert_eq!(values(&checked.call(vec![x.clone().into()]).unwrap()), vec![0.0, 2.0]);
            assert_eq!(values(&forced.call(vec![x.into()]).unwrap()), vec![-2.0, 4.0]);

            let err = checked.call(vec![IValue::None]).unwrap_err();
            assert!(matches!(err, Error::Runtime(_)), "{err:?}");
            assert!(err.to_string().contains("need x"), "{err}");

            let err = forced.call(vec![IValue::None]).unwrap_err();
            assert!(matches!(err, Error::Runtime(_)), "{config:?}: {err:?}");
            assert!(err.to_string().contains("Unwrapping null optional"), "{err}");
        }
    }
}

#[test]
fn test_function_that_always_raises() {
    let src = r#"def fail(x: Tensor) -> Tensor { raise "boom"; }"#;
    for config in configs() {
        let unit = unit_with(src, config);
        let fail = unit.get_function("fail").unwrap();
        for _ in 0..3 {
            let err = fail.call(vec![Tensor::ones(2, DType::F32).into()]).unwrap_err();
            assert!(matches!(err, Error::Runtime(_)), "{err:?}");
            assert!(err.to_string().contains("boom"), "{err}");
        }
    }
}

#[test]
fn test_kernel_error_propagates_unchanged() {
    let src = "def mm(a: Tensor, b: Tensor) -> Tensor { return a.matmul(b); }";
    let unit = unit_with(src, ExecutorConfig::default().with_profiling_runs(0));
    let mm = unit.get_function("mm").unwrap();
    let a = Tensor::ones((2, 3), DType::F32);
    let b = Tensor::ones((2, 3), DType::F32);
    for _ in 0..2 {
        let err = mm.call(vec![a.clone().into(), b.clone().into()]).unwrap_err();
        assert!(matches!(err, Error::OperatorExecution { .. }), "{err:?}");
        assert!(err.to_string().contains("matmul"), "{err}");
    }
}

// Global flags

#[test]
fn test_global_flags_and_scoped_restoration() {
    // One test owns the process-wide flags so no other test races on them.
    let unit = ScriptUnit::compile(CHAIN).unwrap();
    let chain = unit.get_function("chain").unwrap();
    let x = Tensor::ones(2, DType::F32);

    let before_opt = config::optimized_execution();
    let before_fuser = config::fuser();
    {
        let _off = OptimizedExecutionGuard::new(false);
        chain.call(vec![x.clone().into()]).unwrap();
        assert_eq!(chain.executor().unwrap().stats().fallback_runs, 1);
    }
    assert_eq!(config::optimized_execution(), before_opt);

    let r: kestrel::Result<()> = (|| {
        let _guard = FuserGuard::by_name("fuser1")?;
        assert_eq!(config::fuser(), FuserKind::TensorExpr);
        assert!(config::profiling_mode());
        Err(Error::runtime("leaving the scope early"))
    })();
    assert!(r.is_err());
    assert_eq!(config::fuser(), before_fuser);

    let panicked = std::panic::catch_unwind(|| {
        config::with_optimized_execution(!before_opt, || panic!("inside the scope"))
    });
    assert!(panicked.is_err());
    assert_eq!(config::optimized_execution(), before_opt);

    assert!(config::with_fuser("fuser7", || ()).is_err());
    assert_eq!(config::fuser(), before_fuser);

    // An explicit config ignores the globals.
    let explicit = unit_with(CHAIN, ExecutorConfig::default().with_optimize(true));
    let f = explicit.get_function("chain").unwrap();
    {
        let _off = OptimizedExecutionGuard::new(false);
        f.call(vec![x.clone().into()]).unwrap();
    }
    assert_eq!(f.executor().unwrap().stats().fallback_runs, 0);
}
