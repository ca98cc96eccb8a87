// Archive tests — round trips, extra files, versions and device mapping

use std::sync::Arc;

use kestrel::core::set_accelerator_count;
use kestrel::serialize::{self, ExtraFiles, MapLocation, PRODUCED_VERSION};
use kestrel::{freeze, DType, Device, Error, IValue, Module, ScriptUnit, Tensor};

const SRC: &str = r#"
    namedtuple Stats { total: Tensor, count: int }

    class Linear {
        param weight: Tensor;
        param bias: Tensor;
        def forward(self, x: Tensor) -> Tensor { return x.matmul(self.weight) + self.bias; }
    }

    class Model {
        layer: Linear;
        buffer steps: Tensor;
        alpha: float;
        name: str;
        sizes: List[int];
        def forward(self, x: Tensor) -> Tensor {
            self.steps.add_(1);
            h = self.layer(x).elu(self.alpha);
            return (h * h).sigmoid() / 3.0;
        }
        def stats(self, x: Tensor) -> Stats {
            return Stats(self.forward(x).sum(), len(self.sizes));
        }
    }

    def helper(x: Tensor) -> Tensor { return x.tanh(); }
"#;

fn model(unit: &Arc<ScriptUnit>) -> Module {
    let layer = unit.create_module("Linear").unwrap();
    let w = Tensor::from_vec(vec![0.25, -1.5, 0.75, 2.0, -0.125, 0.5], (3, 2), DType::F32).unwrap();
    let b = Tensor::from_vec(vec![0.1, -0.2], 2, DType::F32).unwrap();
    layer.set_attr("weight", w.into()).unwrap();
    layer.set_attr("bias", b.into()).unwrap();

    let m = unit.create_module("Model").unwrap();
    m.set_submodule("layer", &layer).unwrap();
    m.set_attr("steps", Tensor::zeros(1, DType::I64).into()).unwrap();
    m.set_attr("alpha", IValue::Float(0.3)).unwrap();
    m.set_attr("name", IValue::from("demo")).unwrap();
    m.set_attr("sizes", vec![3i64, 2].into()).unwrap();
    m
}

fn input() -> Tensor {
    Tensor::from_vec(vec![0.3, -1.1, 2.4, 0.0, 1.7, -0.6], (2, 3), DType::F32).unwrap()
}

fn forward(m: &Module) -> Vec<f64> {
    m.forward(vec![input().into()])
        .unwrap()
        .as_tensor()
        .unwrap()
        .to_vec()
        .unwrap()
}

fn extra() -> ExtraFiles {
    let mut extra = ExtraFiles::new();
    extra.insert("meta.json".to_string(), br#"{"epoch": 3}"#.to_vec());
    extra.insert("blob.bin".to_string(), vec![0, 255, 10, 13, 0]);
    extra.insert("empty".to_string(), Vec::new());
    extra
}

#[test]
fn test_round_trip_is_bit_identical() {
    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = model(&unit);
    let bytes = serialize::save_to_bytes(&m, &extra()).unwrap();
    let loaded = serialize::load_from_bytes(&bytes, MapLocation::Keep).unwrap();

    assert_eq!(loaded.extra_files, extra());
    // Buffers come back with the state they were saved with.
    let steps = loaded.module.attr("steps").unwrap();
    assert_eq!(steps.as_tensor().unwrap().to_vec().unwrap(), vec![0.0]);
    assert_eq!(steps.as_tensor().unwrap().dtype(), DType::I64);

    assert_eq!(forward(&loaded.module), forward(&m));

    let stats = loaded.module.run_method("stats", vec![input().into()]).unwrap();
    let IValue::NamedTuple(nt, items) = &stats else {
        panic!("expected a named tuple, got {stats:?}");
    };
    assert_eq!(nt.name, "Stats");
    assert_eq!(items[1].as_int(), Some(2));

    let params = loaded.module.parameters().unwrap();
    let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["layer.weight", "layer.bias"]);
    assert!(params.iter().all(|(_, t)| t.requires_grad()));
    assert_eq!(params[0].1.dtype(), DType::F32);
    assert_eq!(loaded.module.attr("name").unwrap().as_str(), Some("demo"));

    // Free functions travel with the unit.
    let helper = loaded.module.unit().get_function("helper").unwrap();
    let r = helper.call(vec![input().into()]).unwrap();
    let expected = unit.get_function("helper").unwrap().call(vec![input().into()]).unwrap();
    assert_eq!(
        r.as_tensor().unwrap().to_vec().unwrap(),
        expected.as_tensor().unwrap().to_vec().unwrap()
    );
}

#[test]
fn test_saving_twice_gives_identical_bytes() {
    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = model(&unit);
    let a = serialize::save_to_bytes(&m, &extra()).unwrap();
    let b = serialize::save_to_bytes(&m, &extra()).unwrap();
    assert_eq!(a, b);

    let loaded = serialize::load_from_bytes(&a, MapLocation::Keep).unwrap();
    let c = serialize::save_to_bytes(&loaded.module, &loaded.extra_files).unwrap();
    let again = serialize::load_from_bytes(&c, MapLocation::Keep).unwrap();
    assert_eq!(forward(&again.module), forward(&m));
}

#[test]
fn test_shared_tensor_stays_shared() {
    let src = r#"
        class Tied {
            a: Tensor;
            b: Tensor;
            def forward(self, x: Tensor) -> Tensor { return x + self.a - self.b; }
        }
    "#;
    let unit = ScriptUnit::compile(src).unwrap();
    let m = unit.create_module("Tied").unwrap();
    let t = Tensor::ones(2, DType::F32);
    m.set_attr("a", t.clone().into()).unwrap();
    m.set_attr("b", t.into()).unwrap();

    let bytes = serialize::save_to_bytes(&m, &ExtraFiles::new()).unwrap();
    let loaded = serialize::load_from_bytes(&bytes, MapLocation::Keep).unwrap().module;
    let a = loaded.attr("a").unwrap();
    let b = loaded.attr("b").unwrap();
    assert!(a.as_tensor().unwrap().shares_storage(b.as_tensor().unwrap()));
}

#[test]
fn test_frozen_module_round_trip() {
    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = model(&unit);
    m.eval().unwrap();
    let frozen = freeze(&m, &[]).unwrap();
    assert!(frozen.has_attr("steps"));
    assert!(!frozen.has_attr("layer"));

    let bytes = serialize::save_to_bytes(&frozen, &ExtraFiles::new()).unwrap();
    let loaded = serialize::load_from_bytes(&bytes, MapLocation::Keep).unwrap().module;
    assert_eq!(forward(&loaded), forward(&frozen));
    assert!(!loaded.has_attr("layer"));
    let steps = loaded.attr("steps").unwrap();
    assert_eq!(steps.as_tensor().unwrap().to_vec().unwrap(), vec![1.0]);
}

#[test]
fn test_file_round_trip_and_bad_paths() {
    let dir = std::env::temp_dir().join(format!("kestrel-serialize-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("model.kst");

    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = model(&unit);
    serialize::save(&m, &path, &extra()).unwrap();
    let loaded = kestrel::load(&path, MapLocation::parse("cpu").unwrap()).unwrap();
    assert_eq!(loaded.extra_files, extra());
    assert_eq!(forward(&loaded.module), forward(&m));

    let missing = kestrel::load(dir.join("nope.kst"), MapLocation::Keep).unwrap_err();
    assert!(matches!(missing, Error::Runtime(_)), "{missing:?}");
    assert!(missing.to_string().contains("does not exist"));

    let is_dir = kestrel::load(&dir, MapLocation::Keep).unwrap_err();
    assert!(matches!(is_dir, Error::Runtime(_)), "{is_dir:?}");
    assert!(is_dir.to_string().contains("directory"));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_not_an_archive() {
    let err = serialize::load_from_bytes(b"definitely not an archive", MapLocation::Keep).unwrap_err();
    assert!(err.to_string().contains("not a kestrel archive"), "{err}");
}

#[test]
fn test_corrupt_record_length_is_an_error() {
    let mut bytes = b"KSTR".to_vec();
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&7u32.to_le_bytes());
    bytes.extend_from_slice(b"version");
    bytes.extend_from_slice(&u64::MAX.to_le_bytes());
    let err = serialize::load_from_bytes(&bytes, MapLocation::Keep).unwrap_err();
    assert!(matches!(err, Error::Io(_)), "{err:?}");
}

// Versions

#[test]
fn test_newer_archive_is_refused() {
    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = model(&unit);
    let mut bytes = Vec::new();
    serialize::save_to_writer_as(&m, &mut bytes, &ExtraFiles::new(), PRODUCED_VERSION + 1).unwrap();
    let err = serialize::load_from_bytes(&bytes, MapLocation::Keep).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    assert!(err.to_string().contains("newer"), "{err}");
}

#[test]
fn test_old_archive_gets_legacy_division() {
    let src = r#"
        class Divide {
            def forward(self, x: Tensor, y: Tensor) -> Tensor { return x / y; }
        }
    "#;
    let unit = ScriptUnit::compile(src).unwrap();
    let m = unit.create_module("Divide").unwrap();
    let x = Tensor::from_vec(vec![7.0, -7.0, 6.0], 3, DType::I64).unwrap();
    let y = Tensor::from_vec(vec![2.0, 2.0, 4.0], 3, DType::I64).unwrap();
    let run = |m: &Module| {
        m.forward(vec![x.clone().into(), y.clone().into()])
            .unwrap()
            .as_tensor()
            .unwrap()
            .to_vec()
            .unwrap()
    };

    let mut old = Vec::new();
    serialize::save_to_writer_as(&m, &mut old, &ExtraFiles::new(), 3).unwrap();
    let legacy = serialize::load_from_bytes(&old, MapLocation::Keep).unwrap().module;
    assert_eq!(run(&legacy), vec![3.0, -4.0, 1.0]);

    let mut current = Vec::new();
    serialize::save_to_writer(&m, &mut current, &ExtraFiles::new()).unwrap();
    let modern = serialize::load_from_bytes(&current, MapLocation::Keep).unwrap().module;
    assert_eq!(run(&modern), vec![3.5, -3.5, 1.5]);
    assert_eq!(run(&modern), run(&m));

    // Floating inputs divide the same way under both versions.
    let xf = Tensor::from_vec(vec![7.0, -7.0], 2, DType::F64).unwrap();
    let yf = Tensor::from_vec(vec![2.0, 2.0], 2, DType::F64).unwrap();
    let r = legacy.forward(vec![xf.into(), yf.into()]).unwrap();
    assert_eq!(r.as_tensor().unwrap().to_vec().unwrap(), vec![3.5, -3.5]);
}

// Device mapping

#[test]
fn test_map_location() {
    // Accelerator availability is process-wide; everything that depends on
    // it lives in this one test.
    let unit = ScriptUnit::compile(SRC).unwrap();
    let m = model(&unit);
    let bytes = serialize::save_to_bytes(&m, &ExtraFiles::new()).unwrap();

    let previous = set_accelerator_count(0);
    let err = serialize::load_from_bytes(&bytes, Device::Cuda(0)).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)), "{err:?}");
    assert!(err.to_string().contains("could not map tensor to cuda:0"), "{err}");

    set_accelerator_count(2);
    let on_gpu = serialize::load_from_bytes(&bytes, MapLocation::parse("cuda:1").unwrap())
        .unwrap()
        .module;
    let params = on_gpu.parameters().unwrap();
    assert!(params.iter().all(|(_, t)| t.device() == Device::Cuda(1)));
    assert!(params.iter().all(|(_, t)| t.requires_grad()));

    // Archives remember the device; a remap moves them back.
    let gpu_bytes = serialize::save_to_bytes(&on_gpu, &ExtraFiles::new()).unwrap();
    let kept = serialize::load_from_bytes(&gpu_bytes, MapLocation::Keep).unwrap().module;
    assert!(kept.parameters().unwrap().iter().all(|(_, t)| t.device() == Device::Cuda(1)));
    let back = serialize::load_from_bytes(
        &gpu_bytes,
        MapLocation::remap(|d| if d.is_accelerator() { Device::Cpu } else { d }),
    )
    .unwrap()
    .module;
    assert!(back.parameters().unwrap().iter().all(|(_, t)| t.device() == Device::Cpu));
    assert_eq!(forward(&back), forward(&m));

    set_accelerator_count(previous);

    assert!(MapLocation::parse("tpu").is_err());
}
