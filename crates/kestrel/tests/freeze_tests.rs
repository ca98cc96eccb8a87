// Freezing tests — folding unmutated state and keeping mutated state live

use std::sync::Arc;

use kestrel::{freeze, DType, Error, IValue, Module, ScriptUnit, Tensor};

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "mismatch at {i}: {x} vs {y} (tol={tol})");
    }
}

fn tensor(v: &[f64]) -> Tensor {
    Tensor::from_vec(v.to_vec(), v.len(), DType::F64).unwrap()
}

fn out(m: &Module, x: &Tensor) -> Vec<f64> {
    m.forward(vec![x.clone().into()])
        .unwrap()
        .as_tensor()
        .unwrap()
        .to_vec()
        .unwrap()
}

const SRC: &str = r#"
    class Affine {
        param weight: Tensor;
        param bias: Tensor;
        def forward(self, x: Tensor) -> Tensor { return x * self.weight + self.bias; }
    }

    class Net {
        first: Affine;
        second: Affine;
        scale: float;
        buffer seen: Tensor;
        calls: int;
        def forward(self, x: Tensor) -> Tensor {
            self.seen.add_(x);
            self.calls = self.calls + 1;
            return self.second(self.first(x)).relu() * self.scale;
        }
        def peek(self) -> Tensor { return self.seen; }
    }

    class Plain {
        inner: Affine;
        def forward(self, x: Tensor) -> Tensor { return self.inner(x).tanh(); }
    }
"#;

fn affine(unit: &Arc<ScriptUnit>, w: &[f64], b: &[f64]) -> Module {
    let m = unit.create_module("Affine").unwrap();
    m.set_attr("weight", tensor(w).into()).unwrap();
    m.set_attr("bias", tensor(b).into()).unwrap();
    m
}

fn net(unit: &Arc<ScriptUnit>) -> Module {
    let m = unit.create_module("Net").unwrap();
    m.set_submodule("first", &affine(unit, &[1.0, -2.0], &[0.5, 0.5])).unwrap();
    m.set_submodule("second", &affine(unit, &[3.0, 1.0], &[-1.0, 0.0])).unwrap();
    m.set_attr("scale", IValue::Float(0.5)).unwrap();
    m.set_attr("seen", tensor(&[0.0, 0.0]).into()).unwrap();
    m.set_attr("calls", IValue::Int(0)).unwrap();
    m
}

#[test]
fn test_training_module_cannot_be_frozen() {
    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = net(&unit);
    let err = freeze(&m, &[]).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    assert!(err.to_string().contains("eval mode"), "{err}");
}

#[test]
fn test_unmutated_state_is_folded() {
    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = unit.create_module("Plain").unwrap();
    m.set_submodule("inner", &affine(&unit, &[0.5, 2.0], &[0.1, -0.1])).unwrap();
    m.eval().unwrap();

    let x = tensor(&[1.0, -1.0]);
    let expected = out(&m, &x);
    let frozen = freeze(&m, &[]).unwrap();

    assert!(!frozen.has_attr("inner"));
    assert!(frozen.parameters().unwrap().is_empty());
    assert_close(&out(&frozen, &x), &expected, 0.0);

    // The frozen graph reads no attributes at all.
    let graph = frozen.method("forward").unwrap().graph().unwrap();
    assert!(!graph.to_string().contains("GetAttr"));

    // Later changes to the source module do not leak into the frozen one.
    m.submodule("inner")
        .unwrap()
        .set_attr("weight", tensor(&[9.0, 9.0]).into())
        .unwrap();
    assert_close(&out(&frozen, &x), &expected, 0.0);
}

#[test]
fn test_mutated_state_stays_live() {
    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = net(&unit);
    m.eval().unwrap();
    let frozen = freeze(&m, &[]).unwrap();

    assert!(frozen.has_attr("seen"));
    assert!(frozen.has_attr("calls"));
    assert!(!frozen.has_attr("first"));
    assert!(!frozen.has_attr("second"));
    assert!(!frozen.has_attr("scale"));

    let x = tensor(&[1.0, 2.0]);
    let reference = out(&m, &x);
    for _ in 0..4 {
        assert_close(&out(&frozen, &x), &reference, 0.0);
    }
    // Four calls on the frozen module, none more on the source.
    assert_eq!(frozen.attr("calls").unwrap().as_int(), Some(4));
    let seen = frozen.attr("seen").unwrap();
    assert_eq!(seen.as_tensor().unwrap().to_vec().unwrap(), vec![4.0, 8.0]);
    assert_eq!(m.attr("calls").unwrap().as_int(), Some(1));

    // Still settable from host code.
    frozen.set_attr("calls", IValue::Int(100)).unwrap();
    out(&frozen, &x);
    assert_eq!(frozen.attr("calls").unwrap().as_int(), Some(101));
}

#[test]
fn test_preserved_method_and_attribute() {
    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = net(&unit);
    m.eval().unwrap();
    let frozen = freeze(&m, &["peek", "scale"]).unwrap();

    assert!(frozen.methods().iter().any(|n| n == "peek"));
    assert!(frozen.has_attr("scale"));
    frozen.set_attr("scale", IValue::Float(2.0)).unwrap();

    let x = tensor(&[1.0, 2.0]);
    let doubled = out(&frozen, &x);
    let base = out(&m, &x);
    let base: Vec<f64> = base.iter().map(|v| v * 4.0).collect();
    assert_close(&doubled, &base, 1e-12);

    let peek = frozen.run_method("peek", vec![]).unwrap();
    assert_eq!(peek.as_tensor().unwrap().to_vec().unwrap(), vec![1.0, 2.0]);
}

#[test]
fn test_unknown_preserved_name_fails() {
    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = net(&unit);
    m.eval().unwrap();
    let err = freeze(&m, &["missing"]).unwrap_err();
    assert!(err.to_string().contains("missing"), "{err}");
}

#[test]
fn test_shared_submodule_mutated_through_one_path() {
    let src = r#"
        class Counter {
            buffer hits: Tensor;
            def forward(self, x: Tensor) -> Tensor { self.hits.add_(1.0); return x; }
        }
        class Reader {
            counter: Counter;
            def forward(self, x: Tensor) -> Tensor { return x + self.counter.hits; }
        }
        class Top {
            writer: Counter;
            reader: Reader;
            def forward(self, x: Tensor) -> Tensor {
                return self.reader(self.writer(x));
            }
        }
    "#;
    let unit = ScriptUnit::compile(src).unwrap();
    let counter = unit.create_module("Counter").unwrap();
    counter.set_attr("hits", tensor(&[0.0]).into()).unwrap();
    let reader = unit.create_module("Reader").unwrap();
    reader.set_submodule("counter", &counter).unwrap();
    let top = unit.create_module("Top").unwrap();
    top.set_submodule("writer", &counter).unwrap();
    top.set_submodule("reader", &reader).unwrap();
    top.eval().unwrap();

    let frozen = freeze(&top, &[]).unwrap();
    let x = tensor(&[10.0]);
    // The reader sees every write made through the writer path.
    assert_eq!(out(&frozen, &x), vec![11.0]);
    assert_eq!(out(&frozen, &x), vec![12.0]);
    assert_eq!(out(&frozen, &x), vec![13.0]);
}
