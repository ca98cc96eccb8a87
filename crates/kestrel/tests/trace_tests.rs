// Tracer tests — recording eager calls, captured tensors and forks

use kestrel::ops::call;
use kestrel::{fork, trace, wait, DType, IValue, ScriptUnit, Tensor};

fn node_names(f: &kestrel::ScriptFunction) -> Vec<String> {
    let g = f.graph();
    g.walk(g.top()).into_iter().map(|n| g.node(n).kind.name()).collect()
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "mismatch at {i}: {x} vs {y} (tol={tol})");
    }
}

#[test]
fn test_captured_weight_becomes_constant() {
    let w = Tensor::from_vec(vec![2.0, -1.0], 2, DType::F32).unwrap();
    let x = Tensor::from_vec(vec![1.0, 1.0], 2, DType::F32).unwrap();
    let traced = trace("scale", &[x], |inputs| {
        let y = call("mul", vec![inputs[0].clone(), w.clone().into()], vec![])?;
        call("add", vec![y, IValue::Float(0.5)], vec![])
    })
    .unwrap();

    let names = node_names(&traced);
    assert!(names.iter().any(|n| n == "Constant"));
    assert!(names.iter().any(|n| n == "mul.Tensor"));
    assert!(names.iter().any(|n| n == "add.Scalar"));

    let z = Tensor::from_vec(vec![3.0, 4.0], 2, DType::F32).unwrap();
    let r = traced.call(vec![z.into()]).unwrap();
    assert_close(&r.as_tensor().unwrap().to_vec().unwrap(), &[6.5, -3.5], 1e-6);
}

#[test]
fn test_compiled_calls_are_recorded_inline() {
    let unit = ScriptUnit::compile(
        r#"
        def act(x: Tensor) -> Tensor { return x.sigmoid() * 2.0; }
        "#,
    )
    .unwrap();
    let act = unit.get_function("act").unwrap();
    let x = Tensor::from_vec(vec![0.0, 1.0, -1.0], 3, DType::F64).unwrap();
    let traced = trace("outer", &[x.clone()], |inputs| {
        let y = act.call(vec![inputs[0].clone()])?;
        call("neg", vec![y], vec![])
    })
    .unwrap();
    let names = node_names(&traced);
    assert!(!names.iter().any(|n| n == "CallFunction"));
    assert!(names.iter().any(|n| n == "sigmoid"));

    let expected = act.call(vec![x.clone().into()]).unwrap();
    let expected: Vec<f64> = expected.as_tensor().unwrap().to_vec().unwrap().iter().map(|v| -v).collect();
    let got = traced.call(vec![x.into()]).unwrap();
    assert_close(&got.as_tensor().unwrap().to_vec().unwrap(), &expected, 0.0);
}

#[test]
fn test_untaken_branch_is_not_recorded() {
    let unit = ScriptUnit::compile(
        r#"
        def pick(x: Tensor) -> Tensor {
            if bool(x.sum() > 0.0) { return x * 2.0; }
            return x.neg();
        }
        "#,
    )
    .unwrap();
    let pick = unit.get_function("pick").unwrap();
    let positive = Tensor::from_vec(vec![1.0, 2.0], 2, DType::F64).unwrap();
    let traced = trace("picked", &[positive.clone()], |inputs| pick.call(vec![inputs[0].clone()])).unwrap();

    let names = node_names(&traced);
    assert!(!names.iter().any(|n| n == "If"), "{names:?}");
    assert!(!names.iter().any(|n| n == "neg"), "{names:?}");
    assert!(names.iter().any(|n| n == "mul.Scalar"), "{names:?}");

    // Negative input still takes the recorded path.
    let negative = Tensor::from_vec(vec![-1.0, -2.0], 2, DType::F64).unwrap();
    let got = traced.call(vec![negative.clone().into()]).unwrap();
    assert_close(&got.as_tensor().unwrap().to_vec().unwrap(), &[-2.0, -4.0], 0.0);
    let compiled = pick.call(vec![negative.into()]).unwrap();
    assert_close(&compiled.as_tensor().unwrap().to_vec().unwrap(), &[1.0, 2.0], 0.0);
}

#[test]
fn test_fork_and_wait_are_recorded() {
    let unit = ScriptUnit::compile(
        r#"
        def branch(x: Tensor, k: float) -> Tensor { return (x * k).tanh(); }
        "#,
    )
    .unwrap();
    let branch = unit.get_function("branch").unwrap();
    let x = Tensor::from_vec(vec![0.3, -0.6], 2, DType::F64).unwrap();
    let traced = trace("forked", &[x.clone()], |inputs| {
        let a = fork(&branch, vec![inputs[0].clone(), IValue::Float(2.0)]);
        let b = fork(&branch, vec![inputs[0].clone(), IValue::Float(3.0)]);
        call("add", vec![wait(&a)?, wait(&b)?], vec![])
    })
    .unwrap();

    let names = node_names(&traced);
    assert_eq!(names.iter().filter(|n| *n == "Fork").count(), 2);
    assert_eq!(names.iter().filter(|n| *n == "Wait").count(), 2);

    let z = Tensor::from_vec(vec![0.1, 0.2], 2, DType::F64).unwrap();
    let got = traced.call(vec![z.into()]).unwrap();
    let expected: Vec<f64> = [0.1f64, 0.2]
        .iter()
        .map(|v| (v * 2.0).tanh() + (v * 3.0).tanh())
        .collect();
    assert_close(&got.as_tensor().unwrap().to_vec().unwrap(), &expected, 1e-12);
}

#[test]
fn test_failed_fork_aborts_trace() {
    let unit = ScriptUnit::compile(
        r#"
        def bad(x: Tensor, n: int) -> Tensor {
            if n > 0 { raise "bad task"; }
            return x;
        }
        "#,
    )
    .unwrap();
    let bad = unit.get_function("bad").unwrap();
    let x = Tensor::ones(2, DType::F32);
    let err = trace("swallowed", &[x], |inputs| {
        let f = fork(&bad, vec![inputs[0].clone(), IValue::Int(1)]);
        // The closure ignores the failure; the trace must not.
        let _ = wait(&f);
        Ok(inputs[0].clone())
    })
    .unwrap_err();
    assert!(err.to_string().contains("bad task"), "{err}");
    assert!(!kestrel::tracer::is_tracing());
}

#[test]
fn test_traced_function_has_tensor_signature() {
    let x = Tensor::ones((2, 2), DType::F32);
    let y = Tensor::ones((2, 2), DType::F32);
    let traced = trace("pair", &[x, y], |inputs| {
        call("sub", vec![inputs[0].clone(), inputs[1].clone()], vec![])
    })
    .unwrap();
    let schema = traced.schema();
    assert_eq!(schema.arguments.len(), 2);
    assert!(schema.arguments.iter().all(|a| a.ty.is_tensor()));
    assert!(traced.call(vec![IValue::Int(1), IValue::Int(2)]).is_err());
}
