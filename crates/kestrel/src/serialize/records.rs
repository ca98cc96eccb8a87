// Archive records: serde mirrors of types, constants, graphs and objects
//
// Graphs are stored block by block. Every value is numbered by its id in
// the saved graph; inputs refer to those numbers. Constant nodes and
// argument defaults refer to the constant table, tensors in the constant
// table and in object slots refer to the tensor table, and each tensor's
// elements live in their own `data/N` record.
//
// Class and named-tuple types are stored once in the unit record, in an
// order where every type follows the types it mentions. Everything else
// refers to them by name.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use kestrel_core::{DType, Device, Tensor};
use kestrel_ir::schema::Argument;
use kestrel_ir::types::ClassAttribute;
use kestrel_ir::{
    AttributeKind, BlockId, ClassType, CompilationUnit, Constant, Function, FunctionSchema, Graph,
    InsertPoint, NamedTupleType, NodeKind, OperatorRegistry, TensorType, Type, ValueId,
};
use serde::{Deserialize, Serialize};

use super::upgraders::upgrade;
use crate::error::{Error, Result};
use crate::value::{IValue, Object};

// Records

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum TypeRecord {
    Tensor {
        dtype: Option<String>,
        sizes: Option<Vec<Option<usize>>>,
        device: Option<String>,
        requires_grad: Option<bool>,
    },
    Int,
    Float,
    Bool,
    Str,
    None,
    Number,
    Device,
    Any,
    Optional { inner: Box<TypeRecord> },
    List { elem: Box<TypeRecord> },
    Tuple { elems: Vec<TypeRecord> },
    NamedTuple { name: String },
    Future { inner: Box<TypeRecord> },
    Class { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AttributeRecord {
    name: String,
    ty: TypeRecord,
    kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum TypeDefRecord {
    NamedTuple {
        name: String,
        fields: Vec<(String, TypeRecord)>,
    },
    Class {
        name: String,
        attributes: Vec<AttributeRecord>,
        methods: Vec<String>,
    },
}

/// Floats are stored as their bit patterns so they come back identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub(crate) enum ConstantRecord {
    None,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<u64>),
    BoolList(Vec<bool>),
    Tensor(usize),
    Tuple(Vec<ConstantRecord>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TensorRecord {
    pub dtype: String,
    pub sizes: Vec<usize>,
    pub device: String,
    pub requires_grad: bool,
    /// Name of the record holding the element bytes.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ValueDefRecord {
    id: usize,
    ty: TypeRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum NodeKindRecord {
    Constant { index: usize },
    Op { op: String },
    If,
    Loop,
    CallFunction { name: String },
    CallMethod { name: String },
    GetAttr { name: String },
    SetAttr { name: String },
    TupleConstruct,
    TupleIndex { index: usize },
    TupleUnpack,
    ListConstruct,
    ListUnpack,
    ListIndex,
    NamedTupleConstruct,
    Fork,
    Wait,
    Uninitialized,
    RaiseException,
    Print,
    UnwrapOptional,
    IsNone,
    FusionGroup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NodeRecord {
    kind: NodeKindRecord,
    inputs: Vec<usize>,
    outputs: Vec<ValueDefRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    blocks: Vec<BlockRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BlockRecord {
    params: Vec<ValueDefRecord>,
    nodes: Vec<NodeRecord>,
    returns: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ArgumentRecord {
    name: String,
    ty: TypeRecord,
    /// Index into the constant table.
    default: Option<usize>,
    kwarg_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionRecord {
    name: String,
    schema_name: String,
    overload: String,
    arguments: Vec<ArgumentRecord>,
    returns: TypeRecord,
    owner: Option<String>,
    graph: BlockRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct UnitRecord {
    pub types: Vec<TypeDefRecord>,
    pub functions: Vec<FunctionRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub(crate) enum IValueRecord {
    None,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Device(String),
    Tensor(usize),
    List(Vec<IValueRecord>),
    Tuple(Vec<IValueRecord>),
    NamedTuple(String, Vec<IValueRecord>),
    Object(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ObjectRecord {
    pub class: String,
    pub slots: Vec<IValueRecord>,
}

fn kind_name(kind: AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Parameter => "parameter",
        AttributeKind::Buffer => "buffer",
        AttributeKind::Attribute => "attribute",
        AttributeKind::Module => "module",
    }
}

fn kind_from_name(name: &str) -> Result<AttributeKind> {
    match name {
        "parameter" => Ok(AttributeKind::Parameter),
        "buffer" => Ok(AttributeKind::Buffer),
        "attribute" => Ok(AttributeKind::Attribute),
        "module" => Ok(AttributeKind::Module),
        other => Err(Error::runtime(format!("unknown attribute kind '{other}' in archive"))),
    }
}

// Encoding

/// Collects tables while records are produced.
#[derive(Default)]
pub(crate) struct Encoder {
    constants: Vec<Constant>,
    pub constant_records: Vec<ConstantRecord>,
    pub tensors: Vec<Tensor>,
    objects: Vec<Object>,
    pub object_records: Vec<ObjectRecord>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn tensor(&mut self, t: &Tensor) -> usize {
        if let Some(i) = self.tensors.iter().position(|x| x.same_handle(t)) {
            return i;
        }
        self.tensors.push(t.clone());
        self.tensors.len() - 1
    }

    fn constant(&mut self, c: &Constant) -> usize {
        if let Some(i) = self.constants.iter().position(|x| x.same_as(c)) {
            return i;
        }
        let record = self.constant_record(c);
        self.constants.push(c.clone());
        self.constant_records.push(record);
        self.constants.len() - 1
    }

    fn constant_record(&mut self, c: &Constant) -> ConstantRecord {
        match c {
            Constant::None => ConstantRecord::None,
            Constant::Bool(b) => ConstantRecord::Bool(*b),
            Constant::Int(n) => ConstantRecord::Int(*n),
            Constant::Float(v) => ConstantRecord::Float(v.to_bits()),
            Constant::Str(s) => ConstantRecord::Str(s.clone()),
            Constant::IntList(v) => ConstantRecord::IntList(v.clone()),
            Constant::FloatList(v) => ConstantRecord::FloatList(v.iter().map(|x| x.to_bits()).collect()),
            Constant::BoolList(v) => ConstantRecord::BoolList(v.clone()),
            Constant::Tensor(t) => ConstantRecord::Tensor(self.tensor(t)),
            Constant::Tuple(items) => {
                ConstantRecord::Tuple(items.iter().map(|c| self.constant_record(c)).collect())
            }
        }
    }

    pub fn ty(ty: &Type) -> TypeRecord {
        match ty {
            Type::Tensor(t) => TypeRecord::Tensor {
                dtype: t.dtype.map(|d| d.name().to_string()),
                sizes: t.sizes.clone(),
                device: t.device.map(|d| d.to_string()),
                requires_grad: t.requires_grad,
            },
            Type::Int => TypeRecord::Int,
            Type::Float => TypeRecord::Float,
            Type::Bool => TypeRecord::Bool,
            Type::Str => TypeRecord::Str,
            Type::NoneType => TypeRecord::None,
            Type::Number => TypeRecord::Number,
            Type::Device => TypeRecord::Device,
            Type::Any => TypeRecord::Any,
            Type::Optional(inner) => TypeRecord::Optional {
                inner: Box::new(Self::ty(inner)),
            },
            Type::List(elem) => TypeRecord::List {
                elem: Box::new(Self::ty(elem)),
            },
            Type::Tuple(elems) => TypeRecord::Tuple {
                elems: elems.iter().map(Self::ty).collect(),
            },
            Type::NamedTuple(nt) => TypeRecord::NamedTuple {
                name: nt.name.clone(),
            },
            Type::Future(inner) => TypeRecord::Future {
                inner: Box::new(Self::ty(inner)),
            },
            Type::Class(c) => TypeRecord::Class {
                name: c.name.clone(),
            },
        }
    }

    /// Type definitions of `unit`, each after the types it mentions.
    pub fn type_defs(unit: &CompilationUnit) -> Vec<TypeDefRecord> {
        fn mentioned(ty: &Type, out: &mut Vec<Type>) {
            match ty {
                Type::Optional(t) | Type::List(t) | Type::Future(t) => mentioned(t, out),
                Type::Tuple(items) => items.iter().for_each(|t| mentioned(t, out)),
                Type::NamedTuple(_) | Type::Class(_) => out.push(ty.clone()),
                _ => {}
            }
        }
        fn visit(ty: &Type, done: &mut HashSet<String>, out: &mut Vec<TypeDefRecord>) {
            let (name, deps) = match ty {
                Type::NamedTuple(nt) => {
                    let mut deps = Vec::new();
                    nt.fields.iter().for_each(|(_, t)| mentioned(t, &mut deps));
                    (nt.name.clone(), deps)
                }
                Type::Class(c) => {
                    let mut deps = Vec::new();
                    c.attributes.iter().for_each(|a| mentioned(&a.ty, &mut deps));
                    (c.name.clone(), deps)
                }
                _ => return,
            };
            if !done.insert(name) {
                return;
            }
            for dep in &deps {
                visit(dep, done, out);
            }
            out.push(match ty {
                Type::NamedTuple(nt) => TypeDefRecord::NamedTuple {
                    name: nt.name.clone(),
                    fields: nt.fields.iter().map(|(n, t)| (n.clone(), Encoder::ty(t))).collect(),
                },
                Type::Class(c) => TypeDefRecord::Class {
                    name: c.name.clone(),
                    attributes: c
                        .attributes
                        .iter()
                        .map(|a| AttributeRecord {
                            name: a.name.clone(),
                            ty: Encoder::ty(&a.ty),
                            kind: kind_name(a.kind).to_string(),
                        })
                        .collect(),
                    methods: c.methods.clone(),
                },
                _ => return,
            });
        }

        let mut done = HashSet::new();
        let mut out = Vec::new();
        for (_, ty) in unit.types() {
            visit(&ty, &mut done, &mut out);
        }
        out
    }

    pub fn function(&mut self, f: &Function) -> FunctionRecord {
        let arguments = f
            .schema
            .arguments
            .iter()
            .map(|a| ArgumentRecord {
                name: a.name.clone(),
                ty: Self::ty(&a.ty),
                default: a.default.as_ref().map(|c| self.constant(c)),
                kwarg_only: a.kwarg_only,
            })
            .collect();
        FunctionRecord {
            name: f.name.clone(),
            schema_name: f.schema.name.clone(),
            overload: f.schema.overload.clone(),
            arguments,
            returns: Self::ty(&f.schema.returns),
            owner: f.owner.as_ref().map(|c| c.name.clone()),
            graph: self.block(&f.graph, f.graph.top()),
        }
    }

    fn value_def(graph: &Graph, v: ValueId) -> ValueDefRecord {
        let value = graph.value(v);
        ValueDefRecord {
            id: v.0,
            ty: Self::ty(&value.ty),
            name: value.debug_name.clone(),
        }
    }

    fn block(&mut self, graph: &Graph, block: BlockId) -> BlockRecord {
        let b = graph.block(block);
        let nodes = b
            .nodes
            .iter()
            .map(|&node| {
                let n = graph.node(node);
                NodeRecord {
                    kind: self.node_kind(&n.kind),
                    inputs: n.inputs.iter().map(|v| v.0).collect(),
                    outputs: n.outputs.iter().map(|&v| Self::value_def(graph, v)).collect(),
                    blocks: n.blocks.iter().map(|&sub| self.block(graph, sub)).collect(),
                }
            })
            .collect();
        BlockRecord {
            params: b.params.iter().map(|&v| Self::value_def(graph, v)).collect(),
            nodes,
            returns: b.returns.iter().map(|v| v.0).collect(),
        }
    }

    fn node_kind(&mut self, kind: &NodeKind) -> NodeKindRecord {
        match kind {
            NodeKind::Constant(c) => NodeKindRecord::Constant {
                index: self.constant(c),
            },
            NodeKind::Op(schema) => NodeKindRecord::Op {
                op: schema.qualified_name(),
            },
            NodeKind::If => NodeKindRecord::If,
            NodeKind::Loop => NodeKindRecord::Loop,
            NodeKind::CallFunction { name } => NodeKindRecord::CallFunction { name: name.clone() },
            NodeKind::CallMethod { name } => NodeKindRecord::CallMethod { name: name.clone() },
            NodeKind::GetAttr { name } => NodeKindRecord::GetAttr { name: name.clone() },
            NodeKind::SetAttr { name } => NodeKindRecord::SetAttr { name: name.clone() },
            NodeKind::TupleConstruct => NodeKindRecord::TupleConstruct,
            NodeKind::TupleIndex { index } => NodeKindRecord::TupleIndex { index: *index },
            NodeKind::TupleUnpack => NodeKindRecord::TupleUnpack,
            NodeKind::ListConstruct => NodeKindRecord::ListConstruct,
            NodeKind::ListUnpack => NodeKindRecord::ListUnpack,
            NodeKind::ListIndex => NodeKindRecord::ListIndex,
            NodeKind::NamedTupleConstruct => NodeKindRecord::NamedTupleConstruct,
            NodeKind::Fork => NodeKindRecord::Fork,
            NodeKind::Wait => NodeKindRecord::Wait,
            NodeKind::Uninitialized => NodeKindRecord::Uninitialized,
            NodeKind::RaiseException => NodeKindRecord::RaiseException,
            NodeKind::Print => NodeKindRecord::Print,
            NodeKind::UnwrapOptional => NodeKindRecord::UnwrapOptional,
            NodeKind::IsNone => NodeKindRecord::IsNone,
            NodeKind::FusionGroup => NodeKindRecord::FusionGroup,
        }
    }

    /// Record `object` and everything it reaches. Returns its index.
    pub fn object(&mut self, object: &Object) -> Result<usize> {
        if let Some(i) = self.objects.iter().position(|o| o.same_object(object)) {
            return Ok(i);
        }
        let index = self.objects.len();
        self.objects.push(object.clone());
        self.object_records.push(ObjectRecord {
            class: object.class().name.clone(),
            slots: Vec::new(),
        });
        let slots = object
            .slots()?
            .iter()
            .map(|v| self.value(v))
            .collect::<Result<Vec<_>>>()?;
        self.object_records[index].slots = slots;
        Ok(index)
    }

    fn value(&mut self, v: &IValue) -> Result<IValueRecord> {
        Ok(match v {
            IValue::None => IValueRecord::None,
            IValue::Bool(b) => IValueRecord::Bool(*b),
            IValue::Int(n) => IValueRecord::Int(*n),
            IValue::Float(x) => IValueRecord::Float(x.to_bits()),
            IValue::Str(s) => IValueRecord::Str(s.clone()),
            IValue::Device(d) => IValueRecord::Device(d.to_string()),
            IValue::Tensor(t) => IValueRecord::Tensor(self.tensor(t)),
            IValue::List(items) => {
                IValueRecord::List(items.iter().map(|x| self.value(x)).collect::<Result<_>>()?)
            }
            IValue::Tuple(items) => {
                IValueRecord::Tuple(items.iter().map(|x| self.value(x)).collect::<Result<_>>()?)
            }
            IValue::NamedTuple(nt, items) => IValueRecord::NamedTuple(
                nt.name.clone(),
                items.iter().map(|x| self.value(x)).collect::<Result<_>>()?,
            ),
            IValue::Object(o) => IValueRecord::Object(self.object(o)?),
            IValue::Future(_) => {
                return Err(Error::runtime("cannot save a Future held in module state"))
            }
        })
    }
}

// Decoding

/// Rebuilds runtime structures from records of an archive of `version`.
pub(crate) struct Decoder {
    version: u64,
    types: HashMap<String, Type>,
    tensors: Vec<Tensor>,
    constants: Vec<Constant>,
}

impl Decoder {
    pub fn new(version: u64, tensors: Vec<Tensor>) -> Self {
        Decoder {
            version,
            types: HashMap::new(),
            tensors,
            constants: Vec::new(),
        }
    }

    pub fn ty(&self, record: &TypeRecord) -> Result<Type> {
        Ok(match record {
            TypeRecord::Tensor {
                dtype,
                sizes,
                device,
                requires_grad,
            } => Type::Tensor(TensorType {
                dtype: dtype.as_deref().map(parse_dtype).transpose()?,
                sizes: sizes.clone(),
                device: device.as_deref().map(parse_device).transpose()?,
                requires_grad: *requires_grad,
            }),
            TypeRecord::Int => Type::Int,
            TypeRecord::Float => Type::Float,
            TypeRecord::Bool => Type::Bool,
            TypeRecord::Str => Type::Str,
            TypeRecord::None => Type::NoneType,
            TypeRecord::Number => Type::Number,
            TypeRecord::Device => Type::Device,
            TypeRecord::Any => Type::Any,
            TypeRecord::Optional { inner } => Type::optional(self.ty(inner)?),
            TypeRecord::List { elem } => Type::list(self.ty(elem)?),
            TypeRecord::Tuple { elems } => {
                Type::Tuple(elems.iter().map(|t| self.ty(t)).collect::<Result<_>>()?)
            }
            TypeRecord::Future { inner } => Type::future(self.ty(inner)?),
            TypeRecord::NamedTuple { name } | TypeRecord::Class { name } => self
                .types
                .get(name)
                .cloned()
                .ok_or_else(|| Error::runtime(format!("archive refers to unknown type '{name}'")))?,
        })
    }

    /// Define the archived types in `unit`.
    pub fn define_types(&mut self, defs: &[TypeDefRecord], unit: &mut CompilationUnit) -> Result<()> {
        for def in defs {
            match def {
                TypeDefRecord::NamedTuple { name, fields } => {
                    let fields = fields
                        .iter()
                        .map(|(n, t)| Ok((n.clone(), self.ty(t)?)))
                        .collect::<Result<Vec<_>>>()?;
                    let nt = Arc::new(NamedTupleType {
                        name: name.clone(),
                        fields,
                    });
                    unit.add_named_tuple(nt.clone())?;
                    self.types.insert(name.clone(), Type::NamedTuple(nt));
                }
                TypeDefRecord::Class {
                    name,
                    attributes,
                    methods,
                } => {
                    let attributes = attributes
                        .iter()
                        .map(|a| {
                            Ok(ClassAttribute {
                                name: a.name.clone(),
                                ty: self.ty(&a.ty)?,
                                kind: kind_from_name(&a.kind)?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let class = Arc::new(ClassType {
                        name: name.clone(),
                        attributes,
                        methods: methods.clone(),
                    });
                    unit.add_class(class.clone())?;
                    self.types.insert(name.clone(), Type::Class(class));
                }
            }
        }
        Ok(())
    }

    pub fn set_constants(&mut self, records: &[ConstantRecord]) -> Result<()> {
        self.constants = records
            .iter()
            .map(|r| self.constant(r))
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn tensor(&self, index: usize) -> Result<Tensor> {
        self.tensors
            .get(index)
            .cloned()
            .ok_or_else(|| Error::runtime(format!("archive tensor {index} is missing")))
    }

    fn constant(&self, record: &ConstantRecord) -> Result<Constant> {
        Ok(match record {
            ConstantRecord::None => Constant::None,
            ConstantRecord::Bool(b) => Constant::Bool(*b),
            ConstantRecord::Int(n) => Constant::Int(*n),
            ConstantRecord::Float(bits) => Constant::Float(f64::from_bits(*bits)),
            ConstantRecord::Str(s) => Constant::Str(s.clone()),
            ConstantRecord::IntList(v) => Constant::IntList(v.clone()),
            ConstantRecord::FloatList(v) => Constant::FloatList(v.iter().map(|b| f64::from_bits(*b)).collect()),
            ConstantRecord::BoolList(v) => Constant::BoolList(v.clone()),
            ConstantRecord::Tensor(i) => Constant::Tensor(self.tensor(*i)?),
            ConstantRecord::Tuple(items) => {
                Constant::Tuple(items.iter().map(|c| self.constant(c)).collect::<Result<_>>()?)
            }
        })
    }

    fn constant_at(&self, index: usize) -> Result<Constant> {
        self.constants
            .get(index)
            .cloned()
            .ok_or_else(|| Error::runtime(format!("archive constant {index} is missing")))
    }

    pub fn function(&self, record: &FunctionRecord) -> Result<Function> {
        let arguments = record
            .arguments
            .iter()
            .map(|a| {
                Ok(Argument {
                    name: a.name.clone(),
                    ty: self.ty(&a.ty)?,
                    default: a.default.map(|i| self.constant_at(i)).transpose()?,
                    kwarg_only: a.kwarg_only,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut schema =
            FunctionSchema::new(record.schema_name.clone(), arguments, self.ty(&record.returns)?);
        schema.overload = record.overload.clone();
        let owner = match &record.owner {
            Some(name) => match self.types.get(name) {
                Some(Type::Class(c)) => Some(c.clone()),
                _ => return Err(Error::runtime(format!("archive refers to unknown class '{name}'"))),
            },
            None => None,
        };

        let mut graph = Graph::new();
        let mut values = HashMap::new();
        for p in &record.graph.params {
            let v = graph.add_input(self.ty(&p.ty)?, p.name.as_deref());
            values.insert(p.id, v);
        }
        let top = graph.top();
        self.fill_block(&mut graph, top, &record.graph, &mut values)?;
        kestrel_ir::verify(&graph)?;
        Ok(Function {
            name: record.name.clone(),
            schema,
            graph: Arc::new(graph),
            owner,
        })
    }

    fn fill_block(
        &self,
        graph: &mut Graph,
        block: BlockId,
        record: &BlockRecord,
        values: &mut HashMap<usize, ValueId>,
    ) -> Result<()> {
        let lookup = |values: &HashMap<usize, ValueId>, id: usize| {
            values
                .get(&id)
                .copied()
                .ok_or_else(|| Error::runtime(format!("archive graph uses undefined value {id}")))
        };
        for node in &record.nodes {
            let inputs = node
                .inputs
                .iter()
                .map(|&i| lookup(values, i))
                .collect::<Result<Vec<_>>>()?;
            let types = node
                .outputs
                .iter()
                .map(|o| self.ty(&o.ty))
                .collect::<Result<Vec<_>>>()?;
            let kind = self.node_kind(&node.kind)?;
            let id = graph.insert(InsertPoint::End(block), kind, &inputs, types);
            let outputs = graph.node(id).outputs.clone();
            for (o, &v) in node.outputs.iter().zip(&outputs) {
                if let Some(name) = &o.name {
                    graph.set_debug_name(v, name.clone());
                }
                values.insert(o.id, v);
            }
            for sub in &node.blocks {
                let b = graph.add_block(id);
                for p in &sub.params {
                    let v = graph.add_block_param(b, self.ty(&p.ty)?);
                    if let Some(name) = &p.name {
                        graph.set_debug_name(v, name.clone());
                    }
                    values.insert(p.id, v);
                }
                self.fill_block(graph, b, sub, values)?;
            }
        }
        let returns = record
            .returns
            .iter()
            .map(|&i| lookup(values, i))
            .collect::<Result<Vec<_>>>()?;
        graph.set_block_returns(block, &returns);
        Ok(())
    }

    fn node_kind(&self, record: &NodeKindRecord) -> Result<NodeKind> {
        Ok(match record {
            NodeKindRecord::Constant { index } => NodeKind::Constant(self.constant_at(*index)?),
            NodeKindRecord::Op { op } => {
                let name = upgrade(op, self.version);
                if name != op {
                    log::debug!("archive v{}: '{op}' upgraded to '{name}'", self.version);
                }
                let schema = OperatorRegistry::builtin().find(name).ok_or_else(|| {
                    Error::runtime(format!("archive uses unknown operator '{name}'"))
                })?;
                NodeKind::Op(schema)
            }
            NodeKindRecord::If => NodeKind::If,
            NodeKindRecord::Loop => NodeKind::Loop,
            NodeKindRecord::CallFunction { name } => NodeKind::CallFunction { name: name.clone() },
            NodeKindRecord::CallMethod { name } => NodeKind::CallMethod { name: name.clone() },
            NodeKindRecord::GetAttr { name } => NodeKind::GetAttr { name: name.clone() },
            NodeKindRecord::SetAttr { name } => NodeKind::SetAttr { name: name.clone() },
            NodeKindRecord::TupleConstruct => NodeKind::TupleConstruct,
            NodeKindRecord::TupleIndex { index } => NodeKind::TupleIndex { index: *index },
            NodeKindRecord::TupleUnpack => NodeKind::TupleUnpack,
            NodeKindRecord::ListConstruct => NodeKind::ListConstruct,
            NodeKindRecord::ListUnpack => NodeKind::ListUnpack,
            NodeKindRecord::ListIndex => NodeKind::ListIndex,
            NodeKindRecord::NamedTupleConstruct => NodeKind::NamedTupleConstruct,
            NodeKindRecord::Fork => NodeKind::Fork,
            NodeKindRecord::Wait => NodeKind::Wait,
            NodeKindRecord::Uninitialized => NodeKind::Uninitialized,
            NodeKindRecord::RaiseException => NodeKind::RaiseException,
            NodeKindRecord::Print => NodeKind::Print,
            NodeKindRecord::UnwrapOptional => NodeKind::UnwrapOptional,
            NodeKindRecord::IsNone => NodeKind::IsNone,
            NodeKindRecord::FusionGroup => NodeKind::FusionGroup,
        })
    }

    /// Rebuild the object table. Objects are created first and filled
    /// afterwards so references between them resolve in any order.
    pub fn objects(&self, records: &[ObjectRecord]) -> Result<Vec<Object>> {
        let objects = records
            .iter()
            .map(|r| match self.types.get(&r.class) {
                Some(Type::Class(c)) => Ok(Object::new(c.clone())),
                _ => Err(Error::runtime(format!(
                    "archive object has unknown class '{}'",
                    r.class
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        for (object, record) in objects.iter().zip(records) {
            let names: Vec<String> = object.class().attributes.iter().map(|a| a.name.clone()).collect();
            if names.len() != record.slots.len() {
                return Err(Error::runtime(format!(
                    "archive object of class '{}' has {} slots, expected {}",
                    record.class,
                    record.slots.len(),
                    names.len()
                )));
            }
            for (name, slot) in names.iter().zip(&record.slots) {
                object.set(name, self.value(slot, &objects)?)?;
            }
        }
        Ok(objects)
    }

    fn value(&self, record: &IValueRecord, objects: &[Object]) -> Result<IValue> {
        Ok(match record {
            IValueRecord::None => IValue::None,
            IValueRecord::Bool(b) => IValue::Bool(*b),
            IValueRecord::Int(n) => IValue::Int(*n),
            IValueRecord::Float(bits) => IValue::Float(f64::from_bits(*bits)),
            IValueRecord::Str(s) => IValue::Str(s.clone()),
            IValueRecord::Device(d) => IValue::Device(parse_device(d)?),
            IValueRecord::Tensor(i) => IValue::Tensor(self.tensor(*i)?),
            IValueRecord::List(items) => IValue::List(
                items.iter().map(|x| self.value(x, objects)).collect::<Result<_>>()?,
            ),
            IValueRecord::Tuple(items) => IValue::Tuple(
                items.iter().map(|x| self.value(x, objects)).collect::<Result<_>>()?,
            ),
            IValueRecord::NamedTuple(name, items) => match self.types.get(name) {
                Some(Type::NamedTuple(nt)) => IValue::NamedTuple(
                    nt.clone(),
                    items.iter().map(|x| self.value(x, objects)).collect::<Result<_>>()?,
                ),
                _ => return Err(Error::runtime(format!("archive refers to unknown type '{name}'"))),
            },
            IValueRecord::Object(i) => IValue::Object(
                objects
                    .get(*i)
                    .cloned()
                    .ok_or_else(|| Error::runtime(format!("archive object {i} is missing")))?,
            ),
        })
    }
}

pub(crate) fn parse_dtype(name: &str) -> Result<DType> {
    DType::from_str(name).map_err(|e| Error::runtime(format!("archive: {e}")))
}

pub(crate) fn parse_device(name: &str) -> Result<Device> {
    Device::from_str(name).map_err(|e| Error::runtime(format!("archive: {e}")))
}
