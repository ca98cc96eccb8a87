// Fork / wait tests — compiled tasks, eager tasks and deferred errors

use std::sync::Arc;

use kestrel::ir::CompilationUnit;
use kestrel::{fork, wait, DType, Error, ExecutorConfig, IValue, ScriptUnit, Tensor};

fn unit_with(src: &str, config: ExecutorConfig) -> Arc<ScriptUnit> {
    let mut cu = CompilationUnit::new();
    cu.define(src).expect("failed to compile");
    ScriptUnit::with_config(cu, config)
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "mismatch at {i}: {x} vs {y} (tol={tol})");
    }
}

const SRC: &str = r#"
    def work(x: Tensor, k: float) -> Tensor {
        y = x;
        for i in range(10) {
            y = (y * k).tanh() + x;
        }
        return y;
    }

    def direct(x: Tensor) -> Tensor {
        return work(x, 0.5);
    }

    def forked(x: Tensor) -> Tensor {
        a = fork(work, x, 0.5);
        b = fork(work, x, k=0.25);
        return wait(a) + wait(b) - work(x, 0.25);
    }

    def fan_out(x: Tensor) -> Tensor {
        futures = [
            fork(work, x, 0.5), fork(work, x, 0.5), fork(work, x, 0.5), fork(work, x, 0.5),
            fork(work, x, 0.5), fork(work, x, 0.5), fork(work, x, 0.5), fork(work, x, 0.5)
        ];
        total = x * 0.0;
        for f in futures {
            total = total + wait(f);
        }
        return total;
    }

    def fails(x: Tensor, n: int) -> Tensor {
        if n > 0 {
            raise "task failed";
        }
        return x;
    }

    def forks_failure(x: Tensor, check: bool) -> Tensor {
        f = fork(fails, x, 1);
        if check {
            return wait(f);
        }
        return x;
    }
"#;

fn input() -> Tensor {
    Tensor::from_vec(vec![0.1, -0.4, 0.7, 1.2, -2.0, 0.0], (2, 3), DType::F64).unwrap()
}

#[test]
fn test_wait_fork_equals_direct_call() {
    for config in [
        ExecutorConfig::default().with_optimize(false).with_num_workers(2),
        ExecutorConfig::default().with_profiling_runs(0).with_num_workers(4),
    ] {
        let unit = unit_with(SRC, config);
        let direct = unit.get_function("direct").unwrap();
        let forked = unit.get_function("forked").unwrap();
        let expected = direct.call(vec![input().into()]).unwrap();
        let expected = expected.as_tensor().unwrap().to_vec().unwrap();
        for _ in 0..5 {
            let got = forked.call(vec![input().into()]).unwrap();
            assert_close(&got.as_tensor().unwrap().to_vec().unwrap(), &expected, 1e-12);
        }
    }
}

#[test]
fn test_many_tasks_in_flight() {
    let unit = unit_with(SRC, ExecutorConfig::default().with_num_workers(2));
    let single = unit
        .get_function("work")
        .unwrap()
        .call(vec![input().into(), IValue::Float(0.5)])
        .unwrap();
    let single = single.as_tensor().unwrap().to_vec().unwrap();
    let total = unit
        .get_function("fan_out")
        .unwrap()
        .call(vec![input().into()])
        .unwrap();
    let expected: Vec<f64> = single.iter().map(|v| v * 8.0).collect();
    assert_close(&total.as_tensor().unwrap().to_vec().unwrap(), &expected, 1e-9);
}

#[test]
fn test_task_error_surfaces_at_wait() {
    let unit = unit_with(SRC, ExecutorConfig::default().with_num_workers(2));
    let f = unit.get_function("forks_failure").unwrap();

    // Never waited: the failure stays inside the future.
    let r = f.call(vec![input().into(), IValue::Bool(false)]).unwrap();
    assert_eq!(r.as_tensor().unwrap().dims(), &[2, 3]);

    let err = f.call(vec![input().into(), IValue::Bool(true)]).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)), "{err:?}");
    assert!(err.to_string().contains("task failed"), "{err}");
}

#[test]
fn test_eager_fork_of_function_and_method() {
    let src = r#"
        class Scale {
            factor: float;
            def forward(self, x: Tensor) -> Tensor { return x * self.factor; }
        }
        def add_one(x: Tensor) -> Tensor { return x + 1.0; }
    "#;
    let unit = ScriptUnit::compile(src).unwrap();
    let x = Tensor::from_vec(vec![1.0, 2.0], 2, DType::F32).unwrap();

    let add_one = unit.get_function("add_one").unwrap();
    let fut = fork(&add_one, vec![x.clone().into()]);
    assert!(fut.is_done());
    let r = wait(&fut).unwrap();
    assert_eq!(r.as_tensor().unwrap().to_vec().unwrap(), vec![2.0, 3.0]);

    let module = unit.create_module("Scale").unwrap();
    module.set_attr("factor", IValue::Float(3.0)).unwrap();
    let forward = module.method("forward").unwrap();
    let r = wait(&fork(&forward, vec![x.into()])).unwrap();
    assert_eq!(r.as_tensor().unwrap().to_vec().unwrap(), vec![3.0, 6.0]);
}

#[test]
fn test_eager_fork_error_is_deferred() {
    let unit = ScriptUnit::compile(SRC).unwrap();
    let fails = unit.get_function("fails").unwrap();
    let fut = fork(&fails, vec![input().into(), IValue::Int(1)]);
    let err = wait(&fut).unwrap_err();
    assert!(err.to_string().contains("task failed"));
    // Waiting again reports the same failure.
    assert!(wait(&fut).is_err());
}
