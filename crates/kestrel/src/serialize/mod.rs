//! Saving and loading compiled modules.
//!
//! An archive holds everything needed to run a module in another process:
//! the compilation unit (type definitions and every function graph), a
//! deduplicated constant table, the module's object state, tensor storage
//! and an opaque map of extra files supplied by the caller.
//!
//! ```no_run
//! use kestrel::serialize::{self, ExtraFiles, MapLocation};
//! # fn demo(module: &kestrel::Module) -> kestrel::Result<()> {
//! let mut extra = ExtraFiles::new();
//! extra.insert("meta.txt".to_string(), b"trained on shard 3".to_vec());
//! serialize::save(module, "model.kst", &extra)?;
//!
//! let loaded = serialize::load("model.kst", MapLocation::parse("cpu")?)?;
//! assert_eq!(loaded.extra_files["meta.txt"], b"trained on shard 3");
//! # Ok(())
//! # }
//! ```
//!
//! Archives record the version that wrote them. Loading an older archive
//! applies the operator upgraders; loading a newer one is refused.

mod container;
mod records;
pub mod upgraders;

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use kestrel_core::{Device, Tensor};
use kestrel_ir::CompilationUnit;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::module::{Module, ScriptUnit};
use container::Container;
use records::{ConstantRecord, Decoder, Encoder, ObjectRecord, TensorRecord, UnitRecord};

/// Archive version written by this runtime.
pub const PRODUCED_VERSION: u64 = 5;

/// Oldest archive version this runtime can read.
pub const MIN_SUPPORTED_VERSION: u64 = 1;

/// Caller-supplied files stored next to the module, returned unchanged.
pub type ExtraFiles = BTreeMap<String, Vec<u8>>;

const VERSION: &str = "version";
const UNIT: &str = "unit.json";
const CONSTANTS: &str = "constants.json";
const TENSORS: &str = "tensors.json";
const OBJECTS: &str = "objects.json";
const EXTRA_PREFIX: &str = "extra/";

/// Where loaded tensors are placed.
#[derive(Clone, Default)]
pub enum MapLocation {
    /// The device each tensor was saved from.
    #[default]
    Keep,
    /// Every tensor on one device.
    Device(Device),
    /// Saved device to target device.
    Remap(Arc<dyn Fn(Device) -> Device + Send + Sync>),
}

impl MapLocation {
    /// Parse a device string such as `"cpu"` or `"cuda:1"`.
    pub fn parse(device: &str) -> Result<Self> {
        device
            .parse::<Device>()
            .map(MapLocation::Device)
            .map_err(|e| Error::runtime(format!("invalid map_location '{device}': {e}")))
    }

    pub fn remap(f: impl Fn(Device) -> Device + Send + Sync + 'static) -> Self {
        MapLocation::Remap(Arc::new(f))
    }

    fn target(&self, saved: Device) -> Device {
        match self {
            MapLocation::Keep => saved,
            MapLocation::Device(d) => *d,
            MapLocation::Remap(f) => f(saved),
        }
    }
}

impl From<Device> for MapLocation {
    fn from(device: Device) -> Self {
        MapLocation::Device(device)
    }
}

impl fmt::Debug for MapLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapLocation::Keep => write!(f, "Keep"),
            MapLocation::Device(d) => write!(f, "Device({d})"),
            MapLocation::Remap(_) => write!(f, "Remap(..)"),
        }
    }
}

/// A module read back from an archive, with its extra files.
#[derive(Debug)]
pub struct Loaded {
    pub module: Module,
    pub extra_files: ExtraFiles,
}

// Save

pub fn save(module: &Module, path: impl AsRef<Path>, extra_files: &ExtraFiles) -> Result<()> {
    let path = path.as_ref();
    let mut w = BufWriter::new(File::create(path)?);
    save_to_writer(module, &mut w, extra_files)?;
    w.flush()?;
    log::info!("saved module '{}' to {}", module.class().name, path.display());
    Ok(())
}

pub fn save_to_writer(module: &Module, w: &mut impl Write, extra_files: &ExtraFiles) -> Result<()> {
    save_to_writer_as(module, w, extra_files, PRODUCED_VERSION)
}

pub fn save_to_bytes(module: &Module, extra_files: &ExtraFiles) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    save_to_writer(module, &mut bytes, extra_files)?;
    Ok(bytes)
}

/// Write an archive tagged with an explicit `version`. The contents are
/// always in the current encoding; only the recorded version differs.
pub fn save_to_writer_as(
    module: &Module,
    w: &mut impl Write,
    extra_files: &ExtraFiles,
    version: u64,
) -> Result<()> {
    let unit = module.unit().unit();
    let mut enc = Encoder::new();

    let types = Encoder::type_defs(unit);
    let mut functions: Vec<_> = unit.functions().collect();
    functions.sort_by(|a, b| a.name.cmp(&b.name));
    let functions = functions.into_iter().map(|f| enc.function(f)).collect();
    let root = enc.object(module.object())?;
    debug_assert_eq!(root, 0);

    let mut c = Container::new();
    c.put(VERSION, version.to_string().into_bytes());
    c.put(UNIT, to_json(&UnitRecord { types, functions })?);
    c.put(CONSTANTS, to_json(&enc.constant_records)?);
    c.put(OBJECTS, to_json(&enc.object_records)?);

    let mut tensors = Vec::with_capacity(enc.tensors.len());
    for (i, t) in enc.tensors.iter().enumerate() {
        let data = format!("data/{i}");
        let values = t.to_vec().map_err(|e| Error::op("to_vec", e))?;
        c.put(data.clone(), t.dtype().encode(&values));
        tensors.push(TensorRecord {
            dtype: t.dtype().name().to_string(),
            sizes: t.dims().to_vec(),
            device: t.device().to_string(),
            requires_grad: t.requires_grad(),
            data,
        });
    }
    c.put(TENSORS, to_json(&tensors)?);

    for (name, bytes) in extra_files {
        c.put(format!("{EXTRA_PREFIX}{name}"), bytes.clone());
    }

    log::debug!(
        "archive v{version}: {} functions, {} constants, {} tensors, {} objects, {} extra files",
        unit.functions().count(),
        enc.constant_records.len(),
        tensors.len(),
        enc.object_records.len(),
        extra_files.len()
    );
    c.write_to(w)
}

// Load

pub fn load(path: impl AsRef<Path>, map_location: impl Into<MapLocation>) -> Result<Loaded> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::runtime(format!(
            "cannot load archive: {} does not exist",
            path.display()
        )));
    }
    if path.is_dir() {
        return Err(Error::runtime(format!(
            "cannot load archive: {} is a directory",
            path.display()
        )));
    }
    let mut r = BufReader::new(File::open(path)?);
    let loaded = load_from_reader(&mut r, map_location)?;
    log::info!("loaded module '{}' from {}", loaded.module.class().name, path.display());
    Ok(loaded)
}

pub fn load_from_bytes(bytes: &[u8], map_location: impl Into<MapLocation>) -> Result<Loaded> {
    load_from_reader(&mut &bytes[..], map_location)
}

pub fn load_from_reader(r: &mut impl Read, map_location: impl Into<MapLocation>) -> Result<Loaded> {
    let map_location = map_location.into();
    let c = Container::read_from(r)?;

    let version = archive_version(&c)?;
    let tensors = read_tensors(&c, &map_location)?;
    let mut dec = Decoder::new(version, tensors);

    let unit_record: UnitRecord = from_json(c.require(UNIT)?, UNIT)?;
    let constants: Vec<ConstantRecord> = from_json(c.require(CONSTANTS)?, CONSTANTS)?;
    let objects: Vec<ObjectRecord> = from_json(c.require(OBJECTS)?, OBJECTS)?;

    let mut unit = CompilationUnit::new();
    dec.define_types(&unit_record.types, &mut unit)?;
    dec.set_constants(&constants)?;
    for record in &unit_record.functions {
        unit.add_function(dec.function(record)?)?;
    }

    let objects = dec.objects(&objects)?;
    let root = objects
        .into_iter()
        .next()
        .ok_or_else(|| Error::runtime("archive holds no module object"))?;

    let extra_files = c
        .with_prefix(EXTRA_PREFIX)
        .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
        .collect();

    log::debug!(
        "loaded archive v{version} with {} records, root class '{}'",
        c.len(),
        root.class().name
    );
    let unit = ScriptUnit::from_unit(unit);
    Ok(Loaded {
        module: Module::from_object(unit, root),
        extra_files,
    })
}

fn archive_version(c: &Container) -> Result<u64> {
    let raw = c.require(VERSION)?;
    let version = std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| Error::runtime("archive version record is not a number"))?;
    if version > PRODUCED_VERSION {
        return Err(Error::runtime(format!(
            "archive version {version} is newer than the newest supported version \
             {PRODUCED_VERSION}; upgrade the runtime to load it"
        )));
    }
    if version < MIN_SUPPORTED_VERSION {
        return Err(Error::runtime(format!(
            "archive version {version} is older than the oldest supported version \
             {MIN_SUPPORTED_VERSION}"
        )));
    }
    Ok(version)
}

/// Materialize tensors on the CPU, then move each to its target device.
fn read_tensors(c: &Container, map_location: &MapLocation) -> Result<Vec<Tensor>> {
    let records: Vec<TensorRecord> = from_json(c.require(TENSORS)?, TENSORS)?;
    records
        .iter()
        .map(|r| {
            let dtype = records::parse_dtype(&r.dtype)?;
            let saved = records::parse_device(&r.device)?;
            let values = dtype.decode(c.require(&r.data)?).map_err(|e| {
                Error::runtime(format!("archive record '{}' is corrupt: {e}", r.data))
            })?;
            let t = Tensor::from_vec(values, r.sizes.clone(), dtype)
                .map_err(|e| Error::runtime(format!("archive record '{}': {e}", r.data)))?;
            let t = if r.requires_grad { t.set_requires_grad(true) } else { t };
            let target = map_location.target(saved);
            t.to_device(target)
                .map_err(|e| Error::runtime(format!("could not map tensor to {target}: {e}")))
        })
        .collect()
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::runtime(format!("archive encoding failed: {e}")))
}

fn from_json<T: DeserializeOwned>(bytes: &[u8], record: &str) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::runtime(format!("archive record '{record}' is malformed: {e}")))
}
