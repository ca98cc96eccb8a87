// Graph IR: typed dataflow graph of operator nodes
//
// A Graph is an arena of Nodes, Values and Blocks addressed by index:
//
//   Graph
//   ├── blocks[0]                 top-level block
//   │     params  = graph inputs
//   │     nodes   = ordered node list
//   │     returns = graph outputs
//   └── nodes that own sub-blocks (If, Loop, Fork, FusionGroup)
//         └── blocks[k] with their own params / nodes / returns
//
// Every Value is defined exactly once: either as an output of a node or as a
// parameter of a block. Each Value records its uses, so replacing or erasing
// keeps consumer lists consistent.
//
// Sub-block conventions (after capture lifting):
//
//   If     inputs  [cond, captures...]
//          blocks  [then, else]   params [captures...]   returns [outputs...]
//   Loop   inputs  [max_trip, init_cond, carried..., captures...]
//          body    params [iter, carried..., captures...]
//                  returns [next_cond, carried...]
//          outputs one per carried value
//   Fork   inputs  [captures...]   body params [captures...]   returns [value]
//          output  Future[value type]
//   FusionGroup inputs [ext...]    body params [ext...]       returns [outputs...]
//
// Nested blocks never reference values of enclosing blocks directly: free
// values are captured as additional node inputs (see passes::lift_captures).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use kestrel_core::Tensor;

use crate::error::{Error, ErrorKind, Result};
use crate::schema::{Binding, FunctionSchema, OperatorRegistry};
use crate::types::Type;

// Identifiers

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

// Constants

/// A literal embedded in the graph.
#[derive(Debug, Clone)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    BoolList(Vec<bool>),
    Tensor(Tensor),
    Tuple(Vec<Constant>),
}

impl Constant {
    /// Natural type of the literal.
    pub fn type_of(&self) -> Type {
        match self {
            Constant::None => Type::NoneType,
            Constant::Bool(_) => Type::Bool,
            Constant::Int(_) => Type::Int,
            Constant::Float(_) => Type::Float,
            Constant::Str(_) => Type::Str,
            Constant::IntList(_) => Type::list(Type::Int),
            Constant::FloatList(_) => Type::list(Type::Float),
            Constant::BoolList(_) => Type::list(Type::Bool),
            Constant::Tensor(_) => Type::tensor(),
            Constant::Tuple(items) => Type::Tuple(items.iter().map(Constant::type_of).collect()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Constant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Constant::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Constant::Float(v) => Some(*v),
            Constant::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Constant::None)
    }

    /// Structural equality. Tensors compare by handle so two distinct
    /// tensors with equal contents are never merged.
    pub fn same_as(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::None, Constant::None) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::IntList(a), Constant::IntList(b)) => a == b,
            (Constant::FloatList(a), Constant::FloatList(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Constant::BoolList(a), Constant::BoolList(b)) => a == b,
            (Constant::Tensor(a), Constant::Tensor(b)) => a.same_handle(b),
            (Constant::Tuple(a), Constant::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
            let parts: Vec<String> = items.iter().map(|x| x.to_string()).collect();
            write!(f, "[{}]", parts.join(", "))
        }
        match self {
            Constant::None => write!(f, "None"),
            Constant::Bool(b) => write!(f, "{}", if *b { "True" } else { "False" }),
            Constant::Int(n) => write!(f, "{n}"),
            Constant::Float(v) => write!(f, "{v:?}"),
            Constant::Str(s) => write!(f, "{s:?}"),
            Constant::IntList(v) => list(f, v),
            Constant::FloatList(v) => {
                let parts: Vec<String> = v.iter().map(|x| format!("{x:?}")).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            Constant::BoolList(v) => list(f, v),
            Constant::Tensor(t) => write!(f, "<Tensor {} {}>", t.dtype(), t.shape()),
            Constant::Tuple(items) => list(f, items),
        }
    }
}

// Nodes

/// What a node does.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Constant(Constant),
    /// Operator from the schema registry.
    Op(Arc<FunctionSchema>),
    If,
    Loop,
    /// Call of a free function in the compilation unit.
    CallFunction { name: String },
    /// Call of a method on inputs[0].
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
    /// Placeholder for a value on a path that never produces it.
    Uninitialized,
    RaiseException,
    Print,
    UnwrapOptional,
    IsNone,
    FusionGroup,
}

impl NodeKind {
    pub fn name(&self) -> String {
        match self {
            NodeKind::Constant(_) => "Constant".into(),
            NodeKind::Op(schema) => schema.qualified_name(),
            NodeKind::If => "If".into(),
            NodeKind::Loop => "Loop".into(),
            NodeKind::CallFunction { .. } => "CallFunction".into(),
            NodeKind::CallMethod { .. } => "CallMethod".into(),
            NodeKind::GetAttr { .. } => "GetAttr".into(),
            NodeKind::SetAttr { .. } => "SetAttr".into(),
            NodeKind::TupleConstruct => "TupleConstruct".into(),
            NodeKind::TupleIndex { .. } => "TupleIndex".into(),
            NodeKind::TupleUnpack => "TupleUnpack".into(),
            NodeKind::ListConstruct => "ListConstruct".into(),
            NodeKind::ListUnpack => "ListUnpack".into(),
            NodeKind::ListIndex => "ListIndex".into(),
            NodeKind::NamedTupleConstruct => "NamedTupleConstruct".into(),
            NodeKind::Fork => "Fork".into(),
            NodeKind::Wait => "Wait".into(),
            NodeKind::Uninitialized => "Uninitialized".into(),
            NodeKind::RaiseException => "RaiseException".into(),
            NodeKind::Print => "Print".into(),
            NodeKind::UnwrapOptional => "UnwrapOptional".into(),
            NodeKind::IsNone => "IsNone".into(),
            NodeKind::FusionGroup => "FusionGroup".into(),
        }
    }

    pub fn as_op(&self) -> Option<&Arc<FunctionSchema>> {
        match self {
            NodeKind::Op(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            NodeKind::Constant(c) => Some(c),
            _ => None,
        }
    }

    /// Whether the node may be observed beyond its outputs: raising,
    /// printing, writing state, calling out.
    pub fn has_side_effects(&self) -> bool {
        match self {
            NodeKind::Op(schema) => !schema.flags.pure,
            NodeKind::SetAttr { .. }
            | NodeKind::RaiseException
            | NodeKind::Print
            | NodeKind::CallFunction { .. }
            | NodeKind::CallMethod { .. }
            | NodeKind::Fork
            | NodeKind::Wait => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub blocks: Vec<BlockId>,
    pub owner: BlockId,
    pub alive: bool,
}

/// Where a value is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Use {
    Node { node: NodeId, index: usize },
    Return { block: BlockId, index: usize },
}

/// Where a value is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    Node { node: NodeId, offset: usize },
    Param { block: BlockId, offset: usize },
}

#[derive(Debug, Clone)]
pub struct Value {
    pub ty: Type,
    pub def: ValueDef,
    pub uses: Vec<Use>,
    pub debug_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub params: Vec<ValueId>,
    pub nodes: Vec<NodeId>,
    pub returns: Vec<ValueId>,
    pub owner: Option<NodeId>,
}

/// Insertion position for new nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    End(BlockId),
    Before(NodeId),
}

// Graph

#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    values: Vec<Value>,
    blocks: Vec<Block>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            nodes: Vec::new(),
            values: Vec::new(),
            blocks: vec![Block {
                params: Vec::new(),
                nodes: Vec::new(),
                returns: Vec::new(),
                owner: None,
            }],
        }
    }

    /// The top-level block.
    pub fn top(&self) -> BlockId {
        BlockId(0)
    }

    // Accessors

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub fn value_type(&self, id: ValueId) -> &Type {
        &self.values[id.0].ty
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.blocks[0].params
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.blocks[0].returns
    }

    pub fn uses(&self, v: ValueId) -> &[Use] {
        &self.values[v.0].uses
    }

    pub fn has_uses(&self, v: ValueId) -> bool {
        !self.values[v.0].uses.is_empty()
    }

    /// The node producing `v`, if it is not a block parameter.
    pub fn producer(&self, v: ValueId) -> Option<NodeId> {
        match self.values[v.0].def {
            ValueDef::Node { node, .. } => Some(node),
            ValueDef::Param { .. } => None,
        }
    }

    /// The block in which `v` is defined.
    pub fn defining_block(&self, v: ValueId) -> BlockId {
        match self.values[v.0].def {
            ValueDef::Node { node, .. } => self.nodes[node.0].owner,
            ValueDef::Param { block, .. } => block,
        }
    }

    /// Literal value of `v` if it comes from a Constant node.
    pub fn constant_of(&self, v: ValueId) -> Option<&Constant> {
        let node = self.producer(v)?;
        self.nodes[node.0].kind.as_constant()
    }

    pub fn set_debug_name(&mut self, v: ValueId, name: impl Into<String>) {
        self.values[v.0].debug_name = Some(name.into());
    }

    /// Number of live nodes, including nested ones.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.alive).count()
    }

    /// All live nodes under `block` in pre-order, descending into sub-blocks.
    pub fn walk(&self, block: BlockId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.walk_into(block, &mut out);
        out
    }

    fn walk_into(&self, block: BlockId, out: &mut Vec<NodeId>) {
        for &n in &self.blocks[block.0].nodes {
            out.push(n);
            for &b in &self.nodes[n.0].blocks {
                self.walk_into(b, out);
            }
        }
    }

    /// Whether `block` is `ancestor` or nested inside it.
    pub fn block_within(&self, mut block: BlockId, ancestor: BlockId) -> bool {
        loop {
            if block == ancestor {
                return true;
            }
            match self.blocks[block.0].owner {
                Some(node) => block = self.nodes[node.0].owner,
                None => return false,
            }
        }
    }

    // Construction

    fn new_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(Value {
            ty,
            def,
            uses: Vec::new(),
            debug_name: None,
        });
        id
    }

    /// Append a graph input.
    pub fn add_input(&mut self, ty: Type, name: Option<&str>) -> ValueId {
        let v = self.add_block_param(BlockId(0), ty);
        if let Some(name) = name {
            self.set_debug_name(v, name);
        }
        v
    }

    pub fn add_block_param(&mut self, block: BlockId, ty: Type) -> ValueId {
        let offset = self.blocks[block.0].params.len();
        let v = self.new_value(ty, ValueDef::Param { block, offset });
        self.blocks[block.0].params.push(v);
        v
    }

    /// Remove an unused block parameter.
    pub fn remove_block_param(&mut self, block: BlockId, offset: usize) -> bool {
        let v = self.blocks[block.0].params[offset];
        if self.has_uses(v) {
            return false;
        }
        self.blocks[block.0].params.remove(offset);
        for (i, &p) in self.blocks[block.0].params.clone().iter().enumerate().skip(offset) {
            self.values[p.0].def = ValueDef::Param { block, offset: i };
        }
        true
    }

    pub fn add_block_return(&mut self, block: BlockId, v: ValueId) {
        let index = self.blocks[block.0].returns.len();
        self.blocks[block.0].returns.push(v);
        self.values[v.0].uses.push(Use::Return { block, index });
    }

    pub fn set_block_returns(&mut self, block: BlockId, vals: &[ValueId]) {
        let old = std::mem::take(&mut self.blocks[block.0].returns);
        for (index, v) in old.into_iter().enumerate() {
            self.remove_use(v, Use::Return { block, index });
        }
        for &v in vals {
            self.add_block_return(block, v);
        }
    }

    /// Set the graph outputs.
    pub fn set_outputs(&mut self, vals: &[ValueId]) {
        self.set_block_returns(BlockId(0), vals);
    }

    /// Create a node with fresh outputs of the given types at `at`.
    pub fn insert(
        &mut self,
        at: InsertPoint,
        kind: NodeKind,
        inputs: &[ValueId],
        output_types: Vec<Type>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let owner = match at {
            InsertPoint::End(b) => b,
            InsertPoint::Before(n) => self.nodes[n.0].owner,
        };
        self.nodes.push(Node {
            kind,
            inputs: inputs.to_vec(),
            outputs: Vec::new(),
            blocks: Vec::new(),
            owner,
            alive: true,
        });
        for (index, &v) in inputs.iter().enumerate() {
            self.values[v.0].uses.push(Use::Node { node: id, index });
        }
        for (offset, ty) in output_types.into_iter().enumerate() {
            let v = self.new_value(ty, ValueDef::Node { node: id, offset });
            self.nodes[id.0].outputs.push(v);
        }
        match at {
            InsertPoint::End(b) => self.blocks[b.0].nodes.push(id),
            InsertPoint::Before(anchor) => {
                let list = &mut self.blocks[owner.0].nodes;
                let pos = list.iter().position(|&n| n == anchor).unwrap_or(list.len());
                list.insert(pos, id);
            }
        }
        id
    }

    /// Insert a constant and return its value.
    pub fn insert_constant(&mut self, at: InsertPoint, c: Constant) -> ValueId {
        let ty = c.type_of();
        self.insert_constant_typed(at, c, ty)
    }

    /// Insert a constant with an explicit (super)type, e.g. a None typed
    /// `Optional[List[int]]`.
    pub fn insert_constant_typed(&mut self, at: InsertPoint, c: Constant, ty: Type) -> ValueId {
        let node = self.insert(at, NodeKind::Constant(c), &[], vec![ty]);
        self.nodes[node.0].outputs[0]
    }

    /// Insert an operator node after matching `args` against the overloads of
    /// `op`. Omitted arguments are filled from schema defaults; a `None`
    /// passed for an `Optional[T]` parameter becomes a None constant of type
    /// `Optional[T]`. Fails with a schema-match error listing the candidates.
    pub fn insert_op(
        &mut self,
        at: InsertPoint,
        op: &str,
        args: &[ValueId],
        kwargs: &[(String, ValueId)],
    ) -> Result<NodeId> {
        let registry = OperatorRegistry::builtin();
        let candidates = registry.overloads(op);
        if candidates.is_empty() {
            return Err(Error::without_span(ErrorKind::UndefinedName(op.to_string())));
        }
        let arg_types: Vec<Type> = args.iter().map(|&v| self.value_type(v).clone()).collect();
        let kwarg_types: Vec<(String, Type)> = kwargs
            .iter()
            .map(|(n, v)| (n.clone(), self.value_type(*v).clone()))
            .collect();
        let mut reasons = Vec::new();
        for schema in candidates {
            match schema.bind(&arg_types, &kwarg_types) {
                Ok(bindings) => {
                    let inputs = self.materialize_bindings(at, schema, &bindings, args, kwargs);
                    let node = self.insert(
                        at,
                        NodeKind::Op(schema.clone()),
                        &inputs,
                        vec![schema.returns.clone()],
                    );
                    return Ok(node);
                }
                Err(reason) => reasons.push(format!("{schema}:\n  {reason}")),
            }
        }
        Err(Error::without_span(ErrorKind::SchemaMatch {
            op: op.to_string(),
            candidates: reasons,
        }))
    }

    /// Turn matched bindings into node inputs, inserting constants for
    /// defaults and typed Nones.
    pub fn materialize_bindings(
        &mut self,
        at: InsertPoint,
        schema: &FunctionSchema,
        bindings: &[Binding],
        args: &[ValueId],
        kwargs: &[(String, ValueId)],
    ) -> Vec<ValueId> {
        let mut inputs = Vec::with_capacity(bindings.len());
        for (param, binding) in schema.arguments.iter().zip(bindings) {
            let v = match binding {
                Binding::Positional(i) => args[*i],
                Binding::Keyword(i) => kwargs[*i].1,
                Binding::Default(c) => {
                    self.insert_constant_typed(at, c.clone(), param.ty.clone())
                }
            };
            let v = if param.ty.is_optional() && *self.value_type(v) == Type::NoneType {
                self.insert_constant_typed(at, Constant::None, param.ty.clone())
            } else {
                v
            };
            inputs.push(v);
        }
        inputs
    }

    /// Create a sub-block owned by `node`.
    pub fn add_block(&mut self, node: NodeId) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block {
            params: Vec::new(),
            nodes: Vec::new(),
            returns: Vec::new(),
            owner: Some(node),
        });
        self.nodes[node.0].blocks.push(id);
        id
    }

    pub fn add_node_input(&mut self, node: NodeId, v: ValueId) {
        let index = self.nodes[node.0].inputs.len();
        self.nodes[node.0].inputs.push(v);
        self.values[v.0].uses.push(Use::Node { node, index });
    }

    pub fn add_node_output(&mut self, node: NodeId, ty: Type) -> ValueId {
        let offset = self.nodes[node.0].outputs.len();
        let v = self.new_value(ty, ValueDef::Node { node, offset });
        self.nodes[node.0].outputs.push(v);
        v
    }

    // Mutation

    fn remove_use(&mut self, v: ValueId, u: Use) {
        let uses = &mut self.values[v.0].uses;
        if let Some(pos) = uses.iter().position(|x| *x == u) {
            uses.swap_remove(pos);
        }
    }

    pub fn replace_input(&mut self, node: NodeId, index: usize, new: ValueId) {
        let old = self.nodes[node.0].inputs[index];
        if old == new {
            return;
        }
        self.remove_use(old, Use::Node { node, index });
        self.nodes[node.0].inputs[index] = new;
        self.values[new.0].uses.push(Use::Node { node, index });
    }

    pub fn replace_return(&mut self, block: BlockId, index: usize, new: ValueId) {
        let old = self.blocks[block.0].returns[index];
        if old == new {
            return;
        }
        self.remove_use(old, Use::Return { block, index });
        self.blocks[block.0].returns[index] = new;
        self.values[new.0].uses.push(Use::Return { block, index });
    }

    /// Redirect every use of `old` to `new`.
    pub fn replace_all_uses_with(&mut self, old: ValueId, new: ValueId) {
        if old == new {
            return;
        }
        let uses = std::mem::take(&mut self.values[old.0].uses);
        for u in uses {
            match u {
                Use::Node { node, index } => self.nodes[node.0].inputs[index] = new,
                Use::Return { block, index } => self.blocks[block.0].returns[index] = new,
            }
            self.values[new.0].uses.push(u);
        }
    }

    /// Redirect the uses of `old` that sit inside `block` (not nested blocks).
    pub fn replace_uses_in_block(&mut self, old: ValueId, new: ValueId, block: BlockId) {
        let uses = self.values[old.0].uses.clone();
        for u in uses {
            match u {
                Use::Node { node, index } if self.nodes[node.0].owner == block => {
                    self.replace_input(node, index, new)
                }
                Use::Return { block: b, index } if b == block => self.replace_return(b, index, new),
                _ => {}
            }
        }
    }

    /// Narrow the type of a value. Widening is rejected.
    pub fn set_type(&mut self, v: ValueId, ty: Type) -> Result<()> {
        let old = &self.values[v.0].ty;
        if !ty.is_subtype_of(old) {
            return Err(Error::msg(format!(
                "cannot widen type of {v} from {old} to {ty}"
            )));
        }
        self.values[v.0].ty = ty;
        Ok(())
    }

    /// Rebind a value type without the narrowing check. Used when a class
    /// type is replaced by a structurally reduced copy of itself.
    pub fn set_type_unchecked(&mut self, v: ValueId, ty: Type) {
        self.values[v.0].ty = ty;
    }

    /// Replace a node's kind in place (same inputs and outputs).
    pub fn set_kind(&mut self, node: NodeId, kind: NodeKind) {
        self.nodes[node.0].kind = kind;
    }

    /// Remove a node whose outputs are unused. Sub-blocks are destroyed with
    /// it. Returns false if an output still has uses.
    pub fn erase_node(&mut self, node: NodeId) -> bool {
        if !self.nodes[node.0].alive {
            return true;
        }
        if self.nodes[node.0].outputs.iter().any(|&o| self.has_uses(o)) {
            return false;
        }
        self.destroy(node);
        true
    }

    fn destroy(&mut self, node: NodeId) {
        for b in self.nodes[node.0].blocks.clone() {
            self.set_block_returns(b, &[]);
            for n in self.blocks[b.0].nodes.clone().into_iter().rev() {
                self.destroy(n);
            }
            self.blocks[b.0].nodes.clear();
        }
        let inputs = std::mem::take(&mut self.nodes[node.0].inputs);
        for (index, v) in inputs.into_iter().enumerate() {
            self.remove_use(v, Use::Node { node, index });
        }
        let owner = self.nodes[node.0].owner;
        self.blocks[owner.0].nodes.retain(|&n| n != node);
        self.nodes[node.0].alive = false;
    }

    /// Remove input `index` of a node, shifting later inputs down.
    pub fn remove_node_input(&mut self, node: NodeId, index: usize) {
        let inputs = self.nodes[node.0].inputs.clone();
        for (i, &v) in inputs.iter().enumerate().skip(index) {
            self.remove_use(v, Use::Node { node, index: i });
        }
        self.nodes[node.0].inputs.remove(index);
        for (i, &v) in inputs.iter().enumerate().skip(index + 1) {
            self.values[v.0].uses.push(Use::Node { node, index: i - 1 });
        }
    }

    /// Remove an unused output of a node.
    pub fn remove_node_output(&mut self, node: NodeId, offset: usize) -> bool {
        let v = self.nodes[node.0].outputs[offset];
        if self.has_uses(v) {
            return false;
        }
        self.nodes[node.0].outputs.remove(offset);
        for (i, &o) in self.nodes[node.0].outputs.clone().iter().enumerate().skip(offset) {
            self.values[o.0].def = ValueDef::Node { node, offset: i };
        }
        true
    }

    /// Remove return `index` of a block.
    pub fn remove_block_return(&mut self, block: BlockId, index: usize) {
        let mut rets = self.blocks[block.0].returns.clone();
        rets.remove(index);
        self.set_block_returns(block, &rets);
    }

    /// Move `node` so that it sits right before `anchor`, possibly in another
    /// block.
    pub fn move_before(&mut self, node: NodeId, anchor: NodeId) {
        let old = self.nodes[node.0].owner;
        self.blocks[old.0].nodes.retain(|&n| n != node);
        let owner = self.nodes[anchor.0].owner;
        let list = &mut self.blocks[owner.0].nodes;
        let pos = list.iter().position(|&n| n == anchor).unwrap_or(list.len());
        list.insert(pos, node);
        self.nodes[node.0].owner = owner;
    }

    /// Move `node` to the end of `block`.
    pub fn move_to_end(&mut self, node: NodeId, block: BlockId) {
        let old = self.nodes[node.0].owner;
        self.blocks[old.0].nodes.retain(|&n| n != node);
        self.blocks[block.0].nodes.push(node);
        self.nodes[node.0].owner = block;
    }

    /// Splice the contents of sub-block `which` of `node` in front of `node`.
    /// Block parameters are replaced by `param_values`; returns the values the
    /// block returned. The node itself is left in place.
    pub fn inline_block_before(
        &mut self,
        node: NodeId,
        which: usize,
        param_values: &[ValueId],
    ) -> Vec<ValueId> {
        let block = self.nodes[node.0].blocks[which];
        for (i, &p) in self.blocks[block.0].params.clone().iter().enumerate() {
            if let Some(&v) = param_values.get(i) {
                self.replace_all_uses_with(p, v);
            }
        }
        for n in self.blocks[block.0].nodes.clone() {
            self.move_before(n, node);
        }
        let rets = self.blocks[block.0].returns.clone();
        self.set_block_returns(block, &[]);
        rets
    }

    /// Copy one node (with its sub-blocks) from `src` into this graph.
    /// `env` maps source values to values of this graph and receives the
    /// outputs of the copy.
    pub fn copy_node_from(
        &mut self,
        src: &Graph,
        node: NodeId,
        at: InsertPoint,
        env: &mut HashMap<ValueId, ValueId>,
    ) -> Result<NodeId> {
        let n = src.node(node);
        let inputs = n
            .inputs
            .iter()
            .map(|v| {
                env.get(v)
                    .copied()
                    .ok_or_else(|| Error::msg(format!("value {v} is not mapped while copying")))
            })
            .collect::<Result<Vec<_>>>()?;
        let types = n.outputs.iter().map(|&o| src.value_type(o).clone()).collect();
        let copy = self.insert(at, n.kind.clone(), &inputs, types);
        for (&o, &c) in n.outputs.iter().zip(&self.nodes[copy.0].outputs.clone()) {
            env.insert(o, c);
            if let Some(name) = &src.value(o).debug_name {
                self.values[c.0].debug_name = Some(name.clone());
            }
        }
        for &b in &n.blocks {
            let nb = self.add_block(copy);
            for &p in &src.block(b).params {
                let np = self.add_block_param(nb, src.value_type(p).clone());
                env.insert(p, np);
            }
            let rets = self.copy_block_body(src, b, InsertPoint::End(nb), env)?;
            for r in rets {
                self.add_block_return(nb, r);
            }
        }
        Ok(copy)
    }

    /// Copy every node of `block` from `src` at `at`, returning the mapped
    /// block returns. Block parameters must already be mapped in `env`.
    pub fn copy_block_body(
        &mut self,
        src: &Graph,
        block: BlockId,
        at: InsertPoint,
        env: &mut HashMap<ValueId, ValueId>,
    ) -> Result<Vec<ValueId>> {
        for &n in &src.block(block).nodes {
            self.copy_node_from(src, n, at, env)?;
        }
        src.block(block)
            .returns
            .iter()
            .map(|r| {
                env.get(r)
                    .copied()
                    .ok_or_else(|| Error::msg(format!("return value {r} is not mapped")))
            })
            .collect()
    }

    /// Drop dead nodes and values, renumbering everything densely.
    pub fn compacted(&self) -> Result<Graph> {
        let mut out = Graph::new();
        let mut env = HashMap::new();
        for &p in self.inputs() {
            let v = out.add_input(self.value_type(p).clone(), self.value(p).debug_name.as_deref());
            env.insert(p, v);
        }
        let rets = out.copy_block_body(self, self.top(), InsertPoint::End(out.top()), &mut env)?;
        out.set_outputs(&rets);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_tracks_uses() {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), Some("x"));
        let top = g.top();
        let n = g.insert_op(InsertPoint::End(top), "relu", &[x], &[]).unwrap();
        let y = g.node(n).outputs[0];
        g.set_outputs(&[y]);
        assert_eq!(g.uses(x).len(), 1);
        assert_eq!(g.uses(y), &[Use::Return { block: top, index: 0 }]);
    }

    #[test]
    fn test_insert_op_rejects_bad_types() {
        let mut g = Graph::new();
        let x = g.add_input(Type::Str, None);
        let top = g.top();
        let err = g.insert_op(InsertPoint::End(top), "relu", &[x], &[]).unwrap_err();
        let ErrorKind::SchemaMatch { op, candidates } = &err.kind else {
            panic!("expected schema match error, got {err}");
        };
        assert_eq!(op, "relu");
        assert!(candidates[0].contains("instead found type 'str'"));
    }

    #[test]
    fn test_insert_op_fills_defaults() {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), None);
        let top = g.top();
        let n = g.insert_op(InsertPoint::End(top), "elu", &[x], &[]).unwrap();
        assert_eq!(g.node(n).inputs.len(), 2);
        let alpha = g.constant_of(g.node(n).inputs[1]).unwrap();
        assert_eq!(alpha.as_float(), Some(1.0));
    }

    #[test]
    fn test_none_for_optional_list_is_typed() {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), None);
        let top = g.top();
        let none = g.insert_constant(InsertPoint::End(top), Constant::None);
        let n = g
            .insert_op(InsertPoint::End(top), "_test_optional_intlist", &[x, none], &[])
            .unwrap();
        let arg = g.node(n).inputs[1];
        assert_eq!(g.value_type(arg).to_string(), "Optional[List[int]]");
        assert!(g.constant_of(arg).unwrap().is_none());
    }

    #[test]
    fn test_replace_all_uses_and_erase() {
        let mut g = Graph::new();
        let x = g.add_input(Type::tensor(), None);
        let top = g.top();
        let a = g.insert_op(InsertPoint::End(top), "relu", &[x], &[]).unwrap();
        let av = g.node(a).outputs[0];
        g.set_outputs(&[av]);
        assert!(!g.erase_node(a));
        g.replace_all_uses_with(av, x);
        assert!(g.erase_node(a));
        assert_eq!(g.outputs(), &[x]);
        assert_eq!(g.node_count(), 0);
    }

    #[test]
    fn test_set_type_only_narrows() {
        let mut g = Graph::new();
        let x = g.add_input(Type::optional(Type::Int), None);
        assert!(g.set_type(x, Type::Int).is_ok());
        assert!(g.set_type(x, Type::Any).is_err());
    }

    #[test]
    fn test_insert_before_keeps_order() {
        let mut g = Graph::new();
        let top = g.top();
        let a = g.insert_constant(InsertPoint::End(top), Constant::Int(1));
        let an = g.producer(a).unwrap();
        let b = g.insert_constant(InsertPoint::Before(an), Constant::Int(2));
        let bn = g.producer(b).unwrap();
        assert_eq!(g.block(top).nodes, vec![bn, an]);
    }
}
