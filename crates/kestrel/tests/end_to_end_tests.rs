// End-to-end tests — compile, run, freeze, save and load a small model

use kestrel::ir::CompilationUnit;
use kestrel::serialize::{self, ExtraFiles, MapLocation};
use kestrel::{export_opnames, freeze, DType, Error, ExecutorConfig, IValue, ScriptUnit, Tensor};

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "mismatch at {i}: {x} vs {y} (tol={tol})");
    }
}

const MLP: &str = r#"
    class Dense {
        param weight: Tensor;
        param bias: Tensor;
        def forward(self, x: Tensor) -> Tensor { return x.matmul(self.weight) + self.bias; }
    }

    class Mlp {
        hidden: Dense;
        out: Dense;
        depth: int;
        def forward(self, x: Tensor) -> Tensor {
            h = self.hidden(x);
            for i in range(self.depth) {
                h = h.relu() * 0.5 + h.sigmoid();
            }
            if self.training {
                h = h * 1.0;
            }
            return self.out(h).tanh();
        }
        def both(self, x: Tensor) -> Tuple[Tensor, Tensor] {
            a = fork(self.forward, x);
            b = self.forward(x * 2.0);
            return (wait(a), b);
        }
    }
"#;

fn dense(unit: &std::sync::Arc<ScriptUnit>, rows: usize, cols: usize, seed: u64) -> kestrel::Module {
    let m = unit.create_module("Dense").unwrap();
    m.set_attr("weight", Tensor::rand_seeded((rows, cols), DType::F64, seed).into())
        .unwrap();
    m.set_attr("bias", Tensor::rand_seeded(cols, DType::F64, seed + 1).into())
        .unwrap();
    m
}

fn mlp(unit: &std::sync::Arc<ScriptUnit>) -> kestrel::Module {
    let m = unit.create_module("Mlp").unwrap();
    m.set_submodule("hidden", &dense(unit, 4, 8, 1)).unwrap();
    m.set_submodule("out", &dense(unit, 8, 3, 7)).unwrap();
    m.set_attr("depth", IValue::Int(3)).unwrap();
    m
}

fn tensor_out(v: &IValue) -> Vec<f64> {
    v.as_tensor().unwrap().to_vec().unwrap()
}

#[test]
fn test_compile_run_freeze_save_load() {
    let mut cu = CompilationUnit::new();
    cu.define(MLP).unwrap();
    let unit = ScriptUnit::with_config(cu, ExecutorConfig::default().with_profiling_runs(1));
    let model = mlp(&unit);
    model.eval().unwrap();
    assert!(!model.submodule("hidden").unwrap().is_training());

    let x = Tensor::rand_seeded((2, 4), DType::F64, 42);
    let reference = tensor_out(&model.forward(vec![x.clone().into()]).unwrap());
    // Profiling run, plan build, cached plan: all agree.
    for _ in 0..3 {
        let r = tensor_out(&model.forward(vec![x.clone().into()]).unwrap());
        assert_close(&r, &reference, 1e-12);
    }

    let both = model.run_method("both", vec![x.clone().into()]).unwrap();
    let items = both.as_tuple().unwrap();
    assert_close(&tensor_out(&items[0]), &reference, 1e-12);

    let frozen = freeze(&model, &[]).unwrap();
    assert!(frozen.attribute_names().is_empty());
    assert_close(
        &tensor_out(&frozen.forward(vec![x.clone().into()]).unwrap()),
        &reference,
        1e-12,
    );

    let mut extra = ExtraFiles::new();
    extra.insert("producer".to_string(), b"end_to_end".to_vec());
    for m in [&model, &frozen] {
        let bytes = serialize::save_to_bytes(m, &extra).unwrap();
        let loaded = serialize::load_from_bytes(&bytes, MapLocation::Keep).unwrap();
        assert_eq!(loaded.extra_files, extra);
        let r = tensor_out(&loaded.module.forward(vec![x.clone().into()]).unwrap());
        assert_close(&r, &tensor_out(&m.forward(vec![x.clone().into()]).unwrap()), 1e-12);
    }
}

#[test]
fn test_training_flag_changes_nothing_numerically() {
    let unit = ScriptUnit::compile(MLP).unwrap();
    let model = mlp(&unit);
    let x = Tensor::rand_seeded((1, 4), DType::F64, 3);
    let train = tensor_out(&model.forward(vec![x.clone().into()]).unwrap());
    model.eval().unwrap();
    let eval = tensor_out(&model.forward(vec![x.clone().into()]).unwrap());
    assert_close(&train, &eval, 1e-12);
    model.train(true).unwrap();
    assert!(model.submodule("out").unwrap().is_training());
}

#[test]
fn test_export_opnames() {
    let unit = ScriptUnit::compile(MLP).unwrap();
    let names = export_opnames(&mlp(&unit)).unwrap();
    for op in ["matmul", "add.Tensor", "relu", "sigmoid", "tanh", "mul.Scalar"] {
        assert!(names.iter().any(|n| n == op), "{op} missing from {names:?}");
    }
    let mut sorted = names.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, names);
}

#[test]
fn test_unit_lookups() {
    let unit = ScriptUnit::compile("def id(x: int) -> int { return x; }").unwrap();
    assert!(unit.find_function("id").is_some());
    let err = unit.get_function("nope").unwrap_err();
    assert!(matches!(err, Error::Attribute(_)));
    assert_eq!(err.to_string(), "'CompilationUnit' has no attribute 'nope'");

    assert!(unit.create_module("Missing").is_err());
}

#[test]
fn test_failed_definition_leaves_unit_intact() {
    let mut cu = CompilationUnit::new();
    cu.define("def ok(x: int) -> int { return x * 2; }").unwrap();
    let err = cu
        .define("def broken(x: int) -> int { return x + undefined_name; }")
        .unwrap_err();
    assert!(err.to_string().contains("undefined_name"), "{err}");
    assert!(cu.find_function("broken").is_none());

    let unit = ScriptUnit::from_unit(cu);
    let ok = unit.get_function("ok").unwrap();
    assert_eq!(ok.call(vec![IValue::Int(21)]).unwrap().as_int(), Some(42));
}

#[test]
fn test_module_attribute_type_is_checked() {
    let unit = ScriptUnit::compile(MLP).unwrap();
    let model = mlp(&unit);
    let err = model.set_attr("depth", IValue::Float(2.5)).unwrap_err();
    assert!(matches!(err, Error::Type(_)), "{err:?}");
    assert!(err.to_string().contains("depth"));
    let err = model.run_method("missing", vec![]).unwrap_err();
    assert!(matches!(err, Error::Attribute(_)));
}
