// Emitter: lowers one function definition into a Graph
//
// Straight-line code becomes nodes in the current block; variables live in
// an SSA environment (name -> value). Control flow becomes structured nodes:
//
//   if c { A } else { B }      If(c) with two blocks; every variable assigned
//                              in A or B becomes an If output whose type is
//                              the unification of both branches
//   while c { A }              Loop(max, c, carried...); variables assigned in
//   for i in range(n) { A }    the body that exist before the loop are carried
//   for x in xs { A }
//
// Early exits have no jumps in the IR. `return`, `break` and `continue` set
// exit flags held in ordinary variables:
//
//   $returned  $ret            function return flag and value
//   $brokeN    $contN          break / continue flags of loop depth N
//
// and every statement that follows a possible exit is guarded by
// `if not (flags...) { rest }`. Conditions known at compile time (constant
// flags, `is None` on non-optional types) compile only the taken branch, so
// functions without early exits produce no guards at all.
//
// Blocks capture outer values implicitly while emitting; the lift_captures
// pass turns them into explicit node inputs afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::*;
use crate::error::{Error, ErrorKind, Result};
use crate::graph::{BlockId, Constant, Graph, InsertPoint, NodeKind, ValueId};
use crate::schema::{accepts, OperatorRegistry};
use crate::token::Span;
use crate::types::{ClassType, Type};

use super::{finish_graph, function_schema, CompilationUnit, Function, Resolved, Resolver};

pub(super) type PendingDef = (String, FunctionDef, Option<Arc<ClassType>>);

const RETURNED: &str = "$returned";
const RET: &str = "$ret";

fn broke_flag(depth: usize) -> String {
    format!("$broke{depth}")
}

fn cont_flag(depth: usize) -> String {
    format!("$cont{depth}")
}

/// Control-flow outcome of a statement sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    /// Exit flags may be set.
    MayExit,
    /// Exit flags are definitely set.
    Exits,
    /// Always raises.
    Raises,
}

fn combine(a: Flow, b: Flow) -> Flow {
    match (a, b) {
        (Flow::Raises, x) | (x, Flow::Raises) => x,
        (Flow::Exits, Flow::Exits) => Flow::Exits,
        (Flow::Normal, Flow::Normal) => Flow::Normal,
        _ => Flow::MayExit,
    }
}

// Pre-scans

fn push_unique(out: &mut Vec<String>, name: String) {
    if !out.contains(&name) {
        out.push(name);
    }
}

fn target_names(target: &AssignTarget, out: &mut Vec<String>) {
    match target {
        AssignTarget::Name(n, _) => push_unique(out, n.clone()),
        AssignTarget::Tuple(items, _) => items.iter().for_each(|t| target_names(t, out)),
        AssignTarget::Attr { .. } => {}
    }
}

/// Names (including exit flags) a statement list may assign.
fn assigned_names(stmts: &[Stmt], depth: usize, out: &mut Vec<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { target, .. } | Stmt::AugAssign { target, .. } => target_names(target, out),
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                assigned_names(then_body, depth, out);
                assigned_names(else_body, depth, out);
            }
            Stmt::While { body, .. } | Stmt::For { body, .. } => {
                assigned_names(body, depth + 1, out)
            }
            Stmt::Return(..) => {
                push_unique(out, RETURNED.into());
                push_unique(out, RET.into());
            }
            Stmt::Break(_) => push_unique(out, broke_flag(depth)),
            Stmt::Continue(_) => push_unique(out, cont_flag(depth)),
            _ => {}
        }
    }
}

fn returns_inside_loop(stmts: &[Stmt], in_loop: bool) -> bool {
    stmts.iter().any(|s| match s {
        Stmt::Return(..) => in_loop,
        Stmt::If {
            then_body,
            else_body,
            ..
        } => returns_inside_loop(then_body, in_loop) || returns_inside_loop(else_body, in_loop),
        Stmt::While { body, .. } | Stmt::For { body, .. } => returns_inside_loop(body, true),
        _ => false,
    })
}

/// Evaluate a literal expression (parameter defaults).
pub(crate) fn const_eval(expr: &Expr) -> Option<Constant> {
    match expr {
        Expr::Int(n, _) => Some(Constant::Int(*n)),
        Expr::Float(v, _) => Some(Constant::Float(*v)),
        Expr::Bool(b, _) => Some(Constant::Bool(*b)),
        Expr::Str(s, _) => Some(Constant::Str(s.clone())),
        Expr::None(_) => Some(Constant::None),
        Expr::Tuple(items, _) => items
            .iter()
            .map(const_eval)
            .collect::<Option<Vec<_>>>()
            .map(Constant::Tuple),
        Expr::List(items, _) => {
            let consts = items.iter().map(const_eval).collect::<Option<Vec<_>>>()?;
            if consts.iter().all(|c| matches!(c, Constant::Int(_))) {
                Some(Constant::IntList(consts.iter().filter_map(Constant::as_int).collect()))
            } else if consts.iter().all(|c| matches!(c, Constant::Bool(_))) {
                Some(Constant::BoolList(consts.iter().filter_map(Constant::as_bool).collect()))
            } else if consts.iter().all(|c| c.as_float().is_some()) {
                Some(Constant::FloatList(consts.iter().filter_map(Constant::as_float).collect()))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn spanned(mut e: Error, span: Span) -> Error {
    if e.span.is_none() {
        e.span = Some(span);
    }
    e
}

// Define context

pub(super) struct DefineContext<'a> {
    unit: &'a mut CompilationUnit,
    resolver: &'a dyn Resolver,
    source: &'a str,
    pending: &'a [PendingDef],
    in_progress: Vec<String>,
}

impl<'a> DefineContext<'a> {
    pub(super) fn new(
        unit: &'a mut CompilationUnit,
        resolver: &'a dyn Resolver,
        source: &'a str,
        pending: &'a [PendingDef],
    ) -> Self {
        DefineContext {
            unit,
            resolver,
            source,
            pending,
            in_progress: Vec::new(),
        }
    }

    /// Compile `name` unless it is already in the unit.
    pub(super) fn ensure_compiled(&mut self, name: &str) -> Result<Arc<Function>> {
        if let Some(f) = self.unit.find_function(name) {
            return Ok(f);
        }
        let pending: &'a [PendingDef] = self.pending;
        let Some((_, def, owner)) = pending.iter().find(|(n, _, _)| n == name) else {
            return Err(Error::without_span(ErrorKind::UndefinedName(name.to_string())));
        };
        if self.in_progress.iter().any(|n| n == name) {
            return Err(Error::new(
                ErrorKind::Unsupported(format!("recursive call to '{name}'")),
                def.span,
            ));
        }
        self.in_progress.push(name.to_string());
        let result = FunctionEmitter::new(self, name, def, owner.clone()).emit();
        self.in_progress.pop();
        let function = result.map_err(|e| e.with_source(self.source))?;
        log::debug!(
            "compiled '{}' ({} nodes)",
            function.name,
            function.graph.node_count()
        );
        self.unit.add_function(function)
    }

    /// Qualified name of a callable free function named `name`.
    fn function_name(&self, name: &str) -> Option<String> {
        if self.unit.find_function(name).is_some() || self.pending.iter().any(|(n, _, _)| n == name)
        {
            return Some(name.to_string());
        }
        match self.resolver.resolve(name) {
            Some(Resolved::Function(q)) => Some(q),
            _ => None,
        }
    }

    fn lookup_type(&self, name: &str) -> Option<Type> {
        self.unit.find_type(name).or_else(|| match self.resolver.resolve(name) {
            Some(Resolved::Type(t)) => Some(t),
            _ => None,
        })
    }
}

// Function emitter

#[derive(Clone, Copy)]
enum LoopKind<'e> {
    While(&'e Expr),
    Range {
        lo: ValueId,
        step: ValueId,
    },
    Sequence {
        seq: ValueId,
    },
}

/// Branch refinement from `x is None` / `x is not None`.
struct Refinement {
    name: String,
    none_in_then: bool,
}

struct FunctionEmitter<'c, 'a> {
    ctx: &'c mut DefineContext<'a>,
    name: String,
    def: &'a FunctionDef,
    owner: Option<Arc<ClassType>>,
    graph: Graph,
    block: BlockId,
    env: HashMap<String, ValueId>,
    declared: HashMap<String, Type>,
    loop_depth: usize,
    return_type: Option<Type>,
}

impl<'c, 'a> FunctionEmitter<'c, 'a> {
    fn new(
        ctx: &'c mut DefineContext<'a>,
        name: &str,
        def: &'a FunctionDef,
        owner: Option<Arc<ClassType>>,
    ) -> Self {
        let graph = Graph::new();
        let block = graph.top();
        FunctionEmitter {
            ctx,
            name: name.to_string(),
            def,
            owner,
            graph,
            block,
            env: HashMap::new(),
            declared: HashMap::new(),
            loop_depth: 0,
            return_type: None,
        }
    }

    fn emit(mut self) -> Result<Function> {
        let def = self.def;
        let mut params = Vec::new();
        for (i, p) in def.params.iter().enumerate() {
            let mut ty = if i == 0 && self.owner.is_some() {
                if p.name != "self" {
                    return Err(Error::type_error(
                        "the first parameter of a method must be 'self'",
                        p.span,
                    ));
                }
                Type::Class(self.owner.clone().ok_or_else(|| Error::msg("missing owner"))?)
            } else if let Some(te) = &p.ty {
                self.resolve_type(te)?
            } else {
                Type::tensor()
            };
            let default = match &p.default {
                Some(e) => Some(const_eval(e).ok_or_else(|| {
                    Error::type_error(
                        format!("default value of parameter '{}' must be a literal", p.name),
                        e.span(),
                    )
                })?),
                None => None,
            };
            if let Some(d) = &default {
                if d.is_none() && !ty.may_be_none() {
                    ty = Type::optional(ty);
                }
                if !accepts(&ty, &d.type_of()) {
                    return Err(Error::type_error(
                        format!(
                            "default value of parameter '{}' has type {} but the parameter is {}",
                            p.name,
                            d.type_of(),
                            ty
                        ),
                        p.span,
                    ));
                }
            }
            let v = self.graph.add_input(ty.clone(), Some(&p.name));
            self.env.insert(p.name.clone(), v);
            if p.ty.is_some() {
                self.declared.insert(p.name.clone(), ty.clone());
            }
            params.push((p.name.clone(), ty, default));
        }
        if self.owner.is_some() && def.params.is_empty() {
            return Err(Error::type_error(
                "the first parameter of a method must be 'self'",
                def.span,
            ));
        }

        self.return_type = match &def.ret {
            Some(te) => Some(self.resolve_type(te)?),
            None => None,
        };
        let f = self.constant(Constant::Bool(false));
        self.env.insert(RETURNED.into(), f);
        if returns_inside_loop(&def.body, false) {
            let Some(rt) = self.return_type.clone() else {
                return Err(Error::type_error(
                    format!(
                        "'{}' returns from inside a loop and must declare its return type",
                        self.name
                    ),
                    def.span,
                ));
            };
            let u = self.uninitialized(rt);
            self.env.insert(RET.into(), u);
        }

        let flow = self.emit_block(&def.body)?;
        let out = self.final_return_value(flow, def.span)?;
        self.graph.set_outputs(&[out]);
        let ret_ty = match &self.return_type {
            Some(t) => t.clone(),
            None => self.graph.value_type(out).clone(),
        };
        let graph = finish_graph(self.graph)?;
        Ok(Function {
            schema: function_schema(&self.name, params, ret_ty),
            name: self.name,
            graph: Arc::new(graph),
            owner: self.owner,
        })
    }

    fn final_return_value(&mut self, flow: Flow, span: Span) -> Result<ValueId> {
        if let Some(&ret) = self.env.get(RET) {
            return Ok(ret);
        }
        if let Some(rt) = &self.return_type {
            if flow == Flow::Raises {
                // The body never completes; the output is never read.
                let rt = rt.clone();
                return Ok(self.uninitialized(rt));
            }
            if !Type::NoneType.is_subtype_of(rt) {
                return Err(Error::type_error(
                    format!("'{}' is declared to return {rt} but does not return a value", self.name),
                    span,
                ));
            }
        }
        Ok(self.constant(Constant::None))
    }

    // Small helpers

    fn at(&self) -> InsertPoint {
        InsertPoint::End(self.block)
    }

    fn ty(&self, v: ValueId) -> Type {
        self.graph.value_type(v).clone()
    }

    fn constant(&mut self, c: Constant) -> ValueId {
        let at = self.at();
        self.graph.insert_constant(at, c)
    }

    fn constant_typed(&mut self, c: Constant, ty: Type) -> ValueId {
        let at = self.at();
        self.graph.insert_constant_typed(at, c, ty)
    }

    fn const_bool(&self, v: ValueId) -> Option<bool> {
        self.graph.constant_of(v).and_then(Constant::as_bool)
    }

    fn uninitialized(&mut self, ty: Type) -> ValueId {
        let at = self.at();
        let n = self.graph.insert(at, NodeKind::Uninitialized, &[], vec![ty]);
        self.graph.node(n).outputs[0]
    }

    fn node1(&mut self, kind: NodeKind, inputs: &[ValueId], ty: Type) -> ValueId {
        let at = self.at();
        let n = self.graph.insert(at, kind, inputs, vec![ty]);
        self.graph.node(n).outputs[0]
    }

    fn op(&mut self, name: &str, args: &[ValueId], span: Span) -> Result<ValueId> {
        self.op_kw(name, args, &[], span)
    }

    fn op_kw(
        &mut self,
        name: &str,
        args: &[ValueId],
        kwargs: &[(String, ValueId)],
        span: Span,
    ) -> Result<ValueId> {
        let at = self.at();
        let n = self
            .graph
            .insert_op(at, name, args, kwargs)
            .map_err(|e| spanned(e, span))?;
        Ok(self.graph.node(n).outputs[0])
    }

    fn resolve_type(&self, te: &TypeExpr) -> Result<Type> {
        Type::from_type_expr(te, &|n| self.ctx.lookup_type(n))
    }

    /// Convert `v` to `expected` (int to float is the only conversion).
    fn coerce(
        &mut self,
        v: ValueId,
        expected: &Type,
        span: Span,
        describe: impl FnOnce(&Type) -> String,
    ) -> Result<ValueId> {
        let found = self.ty(v);
        if found.is_subtype_of(expected) {
            return Ok(v);
        }
        if matches!((expected.unwrap_optional(), &found), (Type::Float, Type::Int)) {
            return self.op("Float", &[v], span);
        }
        Err(Error::type_error(describe(&found), span))
    }

    fn and_values(&mut self, a: ValueId, b: ValueId, span: Span) -> Result<ValueId> {
        match (self.const_bool(a), self.const_bool(b)) {
            (Some(false), _) => Ok(a),
            (Some(true), _) => Ok(b),
            (_, Some(true)) => Ok(a),
            (_, Some(false)) => Ok(b),
            _ => self.op("__and__", &[a, b], span),
        }
    }

    fn not_value(&mut self, v: ValueId, span: Span) -> Result<ValueId> {
        match self.const_bool(v) {
            Some(b) => Ok(self.constant(Constant::Bool(!b))),
            None => self.op("__not__", &[v], span),
        }
    }

    // Statements

    fn emit_block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        for (i, stmt) in stmts.iter().enumerate() {
            match self.emit_stmt(stmt)? {
                Flow::Normal => {}
                f @ (Flow::Exits | Flow::Raises) => return Ok(f),
                Flow::MayExit => {
                    let rest = &stmts[i + 1..];
                    if rest.is_empty() {
                        return Ok(Flow::MayExit);
                    }
                    let guard = self.emit_not_exited(stmt.span())?;
                    let mut names = Vec::new();
                    assigned_names(rest, self.loop_depth, &mut names);
                    let flow = self.emit_if_with(
                        guard,
                        &names,
                        |em| em.emit_block(rest),
                        |_| Ok(Flow::Normal),
                        stmt.span(),
                    )?;
                    return Ok(combine(Flow::MayExit, flow));
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn exit_flags(&self) -> Vec<String> {
        let mut flags = vec![RETURNED.to_string()];
        if self.loop_depth > 0 {
            flags.push(broke_flag(self.loop_depth));
            flags.push(cont_flag(self.loop_depth));
        }
        flags
    }

    fn emit_not_exited(&mut self, span: Span) -> Result<ValueId> {
        let mut dynamic = Vec::new();
        for flag in self.exit_flags() {
            let Some(&v) = self.env.get(&flag) else {
                continue;
            };
            match self.const_bool(v) {
                Some(true) => return Ok(self.constant(Constant::Bool(false))),
                Some(false) => {}
                None => dynamic.push(v),
            }
        }
        let Some((&first, rest)) = dynamic.split_first() else {
            return Ok(self.constant(Constant::Bool(true)));
        };
        let mut any = first;
        for &v in rest {
            any = self.op("__or__", &[any, v], span)?;
        }
        self.op("__not__", &[any], span)
    }

    fn emit_stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
        match stmt {
            Stmt::Expr(e) => {
                self.emit_expr(e, None)?;
                Ok(Flow::Normal)
            }
            Stmt::Pass(_) => Ok(Flow::Normal),
            Stmt::Assign {
                target,
                ann,
                value,
                span,
            } => {
                let hint = match ann {
                    Some(te) => Some(self.resolve_type(te)?),
                    None => None,
                };
                let v = self.emit_expr(value, hint.as_ref())?;
                if let (Some(ty), AssignTarget::Name(name, _)) = (&hint, target) {
                    self.declared.insert(name.clone(), ty.clone());
                }
                self.assign(target, v, *span)?;
                Ok(Flow::Normal)
            }
            Stmt::AugAssign {
                target,
                op,
                value,
                span,
            } => {
                self.emit_aug_assign(target, *op, value, *span)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
                span,
            } => self.emit_if_stmt(cond, then_body, else_body, *span),
            Stmt::While { cond, body, span } => self.emit_loop(LoopKind::While(cond), None, body, *span),
            Stmt::For {
                target,
                iter,
                body,
                span,
            } => self.emit_for(target, iter, body, *span),
            Stmt::Return(value, span) => self.emit_return(value.as_ref(), *span),
            Stmt::Break(span) => {
                if self.loop_depth == 0 {
                    return Err(Error::type_error("'break' outside loop", *span));
                }
                let t = self.constant(Constant::Bool(true));
                self.env.insert(broke_flag(self.loop_depth), t);
                Ok(Flow::Exits)
            }
            Stmt::Continue(span) => {
                if self.loop_depth == 0 {
                    return Err(Error::type_error("'continue' not properly in loop", *span));
                }
                let t = self.constant(Constant::Bool(true));
                self.env.insert(cont_flag(self.loop_depth), t);
                Ok(Flow::Exits)
            }
            Stmt::Raise(value, span) => {
                self.emit_raise(value.as_ref(), "Exception", *span)?;
                Ok(Flow::Raises)
            }
            Stmt::Assert { cond, msg, span } => {
                let refinement = self.refinement_of(cond);
                let c = self.emit_cond(cond)?;
                let failed = self.not_value(c, *span)?;
                self.emit_if_with(
                    failed,
                    &[],
                    |em| {
                        em.emit_raise(msg.as_ref(), "AssertionError", *span)?;
                        Ok(Flow::Raises)
                    },
                    |_| Ok(Flow::Normal),
                    *span,
                )?;
                // Past the assert the condition holds.
                self.apply_refinement(&refinement, true);
                Ok(Flow::Normal)
            }
        }
    }

    fn emit_raise(&mut self, value: Option<&Expr>, default: &str, span: Span) -> Result<()> {
        let msg = match value {
            Some(e) => {
                let v = self.emit_expr(e, None)?;
                if self.ty(v) == Type::Str {
                    v
                } else {
                    self.op("str", &[v], span)?
                }
            }
            None => self.constant(Constant::Str(default.to_string())),
        };
        let at = self.at();
        self.graph.insert(at, NodeKind::RaiseException, &[msg], vec![]);
        Ok(())
    }

    fn emit_return(&mut self, value: Option<&Expr>, span: Span) -> Result<Flow> {
        let rt = self.return_type.clone();
        let v = match value {
            Some(e) => self.emit_expr(e, rt.as_ref())?,
            None => self.constant(Constant::None),
        };
        let v = match &rt {
            Some(rt) => self.coerce(v, rt, span, |found| {
                format!(
                    "Return value was annotated as having type {rt} but is actually of type {found}"
                )
            })?,
            None => v,
        };
        self.env.insert(RET.into(), v);
        let t = self.constant(Constant::Bool(true));
        self.env.insert(RETURNED.into(), t);
        Ok(Flow::Exits)
    }

    fn assign(&mut self, target: &AssignTarget, v: ValueId, span: Span) -> Result<()> {
        match target {
            AssignTarget::Name(name, _) => {
                let v = match self.declared.get(name).cloned() {
                    Some(ty) => self.coerce(v, &ty, span, |found| {
                        format!(
                            "Variable '{name}' is annotated with type {ty} but is being assigned to a value of type {found}"
                        )
                    })?,
                    None => v,
                };
                if self.graph.value(v).debug_name.is_none() {
                    self.graph.set_debug_name(v, name.clone());
                }
                self.env.insert(name.clone(), v);
                Ok(())
            }
            AssignTarget::Attr { object, name, span } => {
                let obj = self.emit_expr(object, None)?;
                self.set_attr(obj, name, v, *span)
            }
            AssignTarget::Tuple(targets, tspan) => {
                let ty = self.ty(v);
                let Some(elems) = ty.tuple_elements() else {
                    return Err(Error::type_error(
                        format!("cannot unpack a value of type {ty}"),
                        *tspan,
                    ));
                };
                if elems.len() != targets.len() {
                    return Err(Error::type_error(
                        format!(
                            "cannot unpack a tuple of {} elements into {} targets",
                            elems.len(),
                            targets.len()
                        ),
                        *tspan,
                    ));
                }
                let at = self.at();
                let n = self.graph.insert(at, NodeKind::TupleUnpack, &[v], elems);
                let outs = self.graph.node(n).outputs.clone();
                for (t, o) in targets.iter().zip(outs) {
                    self.assign(t, o, span)?;
                }
                Ok(())
            }
        }
    }

    fn class_of(&self, obj: ValueId, span: Span) -> Result<Arc<ClassType>> {
        match self.graph.value_type(obj) {
            Type::Class(c) => Ok(c.clone()),
            other => Err(Error::type_error(
                format!("'{other}' object has no attributes"),
                span,
            )),
        }
    }

    fn get_attr(&mut self, obj: ValueId, name: &str, span: Span) -> Result<ValueId> {
        let class = self.class_of(obj, span)?;
        let Some(attr) = class.attribute(name) else {
            let what = if class.has_method(name) {
                format!("method '{name}' of '{}' can only be called", class.name)
            } else {
                format!("Module '{}' has no attribute '{name}'", class.name)
            };
            return Err(Error::type_error(what, span));
        };
        Ok(self.node1(
            NodeKind::GetAttr {
                name: name.to_string(),
            },
            &[obj],
            attr.ty.clone(),
        ))
    }

    fn set_attr(&mut self, obj: ValueId, name: &str, v: ValueId, span: Span) -> Result<()> {
        let class = self.class_of(obj, span)?;
        let Some(attr) = class.attribute(name) else {
            return Err(Error::type_error(
                format!("Module '{}' has no attribute '{name}'", class.name),
                span,
            ));
        };
        let ty = attr.ty.clone();
        let v = self.coerce(v, &ty, span, |found| {
            format!(
                "Attribute '{name}' of '{}' has type {ty} but is being assigned a value of type {found}",
                class.name
            )
        })?;
        let at = self.at();
        self.graph.insert(
            at,
            NodeKind::SetAttr {
                name: name.to_string(),
            },
            &[obj, v],
            vec![],
        );
        Ok(())
    }

    fn emit_aug_assign(&mut self, target: &AssignTarget, op: BinOp, value: &Expr, span: Span) -> Result<()> {
        match target {
            AssignTarget::Name(name, nspan) => {
                let Some(&cur) = self.env.get(name) else {
                    return Err(Error::new(ErrorKind::UndefinedName(name.clone()), *nspan));
                };
                let rhs = self.emit_expr(value, None)?;
                let res = self.emit_binop(op, cur, rhs, span)?;
                self.assign(target, res, span)
            }
            AssignTarget::Attr { object, name, span } => {
                let obj = self.emit_expr(object, None)?;
                let cur = self.get_attr(obj, name, *span)?;
                let rhs = self.emit_expr(value, None)?;
                let res = self.emit_binop(op, cur, rhs, *span)?;
                self.set_attr(obj, name, res, *span)
            }
            AssignTarget::Tuple(_, tspan) => Err(Error::type_error(
                "augmented assignment to a tuple is not allowed",
                *tspan,
            )),
        }
    }

    // Conditionals

    fn refinement_of(&self, cond: &Expr) -> Option<Refinement> {
        let Expr::IsNone {
            operand, negated, ..
        } = cond
        else {
            return None;
        };
        let Expr::Name(name, _) = operand.as_ref() else {
            return None;
        };
        let v = *self.env.get(name)?;
        if !self.graph.value_type(v).is_optional() {
            return None;
        }
        Some(Refinement {
            name: name.clone(),
            none_in_then: !negated,
        })
    }

    fn apply_refinement(&mut self, refinement: &Option<Refinement>, in_then: bool) {
        let Some(r) = refinement else {
            return;
        };
        if r.none_in_then == in_then {
            return;
        }
        let Some(&v) = self.env.get(&r.name) else {
            return;
        };
        let inner = self.ty(v).unwrap_optional().clone();
        let u = self.node1(NodeKind::UnwrapOptional, &[v], inner);
        self.env.insert(r.name.clone(), u);
    }

    fn emit_if_stmt(
        &mut self,
        cond: &Expr,
        then_body: &[Stmt],
        else_body: &[Stmt],
        span: Span,
    ) -> Result<Flow> {
        let mut names = Vec::new();
        assigned_names(then_body, self.loop_depth, &mut names);
        assigned_names(else_body, self.loop_depth, &mut names);
        let refinement = self.refinement_of(cond);
        let c = self.emit_cond(cond)?;
        let (r1, r2) = (&refinement, &refinement);
        self.emit_if_with(
            c,
            &names,
            |em| {
                em.apply_refinement(r1, true);
                em.emit_block(then_body)
            },
            |em| {
                em.apply_refinement(r2, false);
                em.emit_block(else_body)
            },
            span,
        )
    }

    /// Emit an If node whose branches are produced by closures, merging the
    /// variables in `names`.
    fn emit_if_with(
        &mut self,
        cond: ValueId,
        names: &[String],
        then_f: impl FnOnce(&mut Self) -> Result<Flow>,
        else_f: impl FnOnce(&mut Self) -> Result<Flow>,
        span: Span,
    ) -> Result<Flow> {
        if let Some(taken) = self.const_bool(cond) {
            return if taken { then_f(self) } else { else_f(self) };
        }
        let pre_env = self.env.clone();
        let at = self.at();
        let node = self.graph.insert(at, NodeKind::If, &[cond], vec![]);
        let then_block = self.graph.add_block(node);
        let else_block = self.graph.add_block(node);
        let outer = self.block;

        self.block = then_block;
        let tflow = then_f(self)?;
        let then_env = std::mem::replace(&mut self.env, pre_env.clone());
        self.block = else_block;
        let eflow = else_f(self)?;
        let else_env = std::mem::replace(&mut self.env, pre_env);
        self.block = outer;

        if tflow == Flow::Raises && eflow == Flow::Raises {
            return Ok(Flow::Raises);
        }
        for name in names {
            let tv = then_env.get(name).copied();
            let ev = else_env.get(name).copied();
            if tv == ev {
                continue;
            }
            let ty = match (tflow, eflow, tv, ev) {
                (Flow::Raises, _, _, Some(e)) => self.ty(e),
                (_, Flow::Raises, Some(t), _) => self.ty(t),
                (Flow::Raises, _, _, None) | (_, Flow::Raises, None, _) => continue,
                (_, _, Some(t), Some(e)) => {
                    let (a, b) = (self.ty(t), self.ty(e));
                    Type::unify(&a, &b).ok_or_else(|| {
                        let what = if name == RET {
                            "return statements".to_string()
                        } else {
                            format!("variable '{name}'")
                        };
                        Error::type_error(
                            format!(
                                "{what} has type {a} in the true branch and type {b} in the false branch"
                            ),
                            span,
                        )
                    })?
                }
                (_, _, Some(t), None) => self.ty(t),
                (_, _, None, Some(e)) => self.ty(e),
                (_, _, None, None) => continue,
            };
            let ty = self.declared.get(name).cloned().unwrap_or(ty);
            let tr = self.branch_value(then_block, tv, tflow == Flow::Raises, &ty, name, span)?;
            let er = self.branch_value(else_block, ev, eflow == Flow::Raises, &ty, name, span)?;
            self.graph.add_block_return(then_block, tr);
            self.graph.add_block_return(else_block, er);
            let out = self.graph.add_node_output(node, ty);
            if !name.starts_with('$') {
                self.graph.set_debug_name(out, name.clone());
            }
            self.env.insert(name.clone(), out);
        }
        Ok(combine(tflow, eflow))
    }

    fn branch_value(
        &mut self,
        block: BlockId,
        v: Option<ValueId>,
        raises: bool,
        ty: &Type,
        name: &str,
        span: Span,
    ) -> Result<ValueId> {
        let outer = self.block;
        self.block = block;
        let result = match v {
            Some(v) if !raises => self.coerce(v, ty, span, |found| {
                format!("variable '{name}' has type {found} in one branch but {ty} is required")
            }),
            _ => Ok(self.uninitialized(ty.clone())),
        };
        self.block = outer;
        result
    }

    /// If-expression producing one value.
    fn emit_if_value(
        &mut self,
        cond: ValueId,
        then_f: impl FnOnce(&mut Self) -> Result<ValueId>,
        else_f: impl FnOnce(&mut Self) -> Result<ValueId>,
        span: Span,
    ) -> Result<ValueId> {
        if let Some(taken) = self.const_bool(cond) {
            return if taken { then_f(self) } else { else_f(self) };
        }
        let pre_env = self.env.clone();
        let at = self.at();
        let node = self.graph.insert(at, NodeKind::If, &[cond], vec![]);
        let then_block = self.graph.add_block(node);
        let else_block = self.graph.add_block(node);
        let outer = self.block;
        self.block = then_block;
        let t = then_f(self)?;
        self.env = pre_env.clone();
        self.block = else_block;
        let e = else_f(self)?;
        self.env = pre_env;
        self.block = outer;
        let (a, b) = (self.ty(t), self.ty(e));
        let ty = Type::unify(&a, &b).ok_or_else(|| {
            Error::type_error(
                format!("if-expression branches have incompatible types {a} and {b}"),
                span,
            )
        })?;
        self.graph.add_block_return(then_block, t);
        self.graph.add_block_return(else_block, e);
        Ok(self.graph.add_node_output(node, ty))
    }

    /// Boolean value of a condition expression.
    fn emit_cond(&mut self, cond: &Expr) -> Result<ValueId> {
        let v = self.emit_expr(cond, None)?;
        self.truth_value(v, cond.span())
    }

    fn truth_value(&mut self, v: ValueId, span: Span) -> Result<ValueId> {
        match self.ty(v) {
            Type::Bool => Ok(v),
            Type::Tensor(_) | Type::Int | Type::Float | Type::Number => self.op("Bool", &[v], span),
            other => Err(Error::type_error(
                format!("expected a bool expression for condition but found {other}"),
                span,
            )),
        }
    }

    // Loops

    fn emit_for(&mut self, target: &AssignTarget, iter: &Expr, body: &[Stmt], span: Span) -> Result<Flow> {
        if let Expr::Call { func, args, kwargs, span: cspan } = iter {
            if matches!(func.as_ref(), Expr::Name(n, _) if n == "range" && !self.env.contains_key(n)) {
                if !kwargs.is_empty() || args.is_empty() || args.len() > 3 {
                    return Err(Error::type_error("range() takes 1 to 3 integer arguments", *cspan));
                }
                let mut vals = Vec::new();
                for a in args {
                    let v = self.emit_expr(a, Some(&Type::Int))?;
                    if self.ty(v) != Type::Int {
                        return Err(Error::type_error(
                            format!("range() arguments must be int, not {}", self.ty(v)),
                            a.span(),
                        ));
                    }
                    vals.push(v);
                }
                let (lo, hi, step) = match *vals.as_slice() {
                    [hi] => (self.constant(Constant::Int(0)), hi, self.constant(Constant::Int(1))),
                    [lo, hi] => (lo, hi, self.constant(Constant::Int(1))),
                    [lo, hi, step] => (lo, hi, step),
                    _ => return Err(Error::type_error("range() takes 1 to 3 integer arguments", *cspan)),
                };
                if self.graph.constant_of(step).and_then(Constant::as_int) == Some(0) {
                    return Err(Error::type_error("range() arg 3 must not be zero", *cspan));
                }
                let n = self.op("__range_length", &[lo, hi, step], *cspan)?;
                return self.emit_loop(LoopKind::Range { lo, step }, Some((target, n)), body, span);
            }
        }
        let seq = self.emit_expr(iter, None)?;
        let n = match self.ty(seq) {
            Type::List(_) | Type::Tensor(_) => self.op("len", &[seq], iter.span())?,
            other => {
                return Err(Error::type_error(
                    format!("'{other}' object is not iterable in a for loop"),
                    iter.span(),
                ))
            }
        };
        self.emit_loop(LoopKind::Sequence { seq }, Some((target, n)), body, span)
    }

    fn emit_loop(
        &mut self,
        kind: LoopKind<'_>,
        target: Option<(&AssignTarget, ValueId)>,
        body: &[Stmt],
        span: Span,
    ) -> Result<Flow> {
        let (max_trip, init_cond) = match (&kind, target) {
            (LoopKind::While(cond), _) => {
                let c = self.emit_cond(cond)?;
                (self.constant(Constant::Int(i64::MAX)), c)
            }
            (_, Some((_, n))) => (n, self.constant(Constant::Bool(true))),
            (_, None) => return Err(Error::msg("for loop without a trip count")),
        };
        if self.const_bool(init_cond) == Some(false) {
            return Ok(Flow::Normal);
        }

        self.loop_depth += 1;
        let depth = self.loop_depth;
        let mut assigned = Vec::new();
        assigned_names(body, depth, &mut assigned);
        let has_break = assigned.contains(&broke_flag(depth));
        let has_continue = assigned.contains(&cont_flag(depth));
        let has_return = assigned.iter().any(|n| n == RETURNED);
        if has_break {
            let f = self.constant(Constant::Bool(false));
            self.env.insert(broke_flag(depth), f);
        }
        let loop_var = match target {
            Some((AssignTarget::Name(n, _), _)) => Some(n.clone()),
            _ => None,
        };
        let carried: Vec<String> = assigned
            .into_iter()
            .filter(|n| self.env.contains_key(n) && Some(n) != loop_var.as_ref())
            .collect();

        let mut inputs = vec![max_trip, init_cond];
        let mut carried_types = Vec::new();
        for name in &carried {
            let v = self.env[name];
            let ty = self.declared.get(name).cloned().unwrap_or_else(|| self.ty(v));
            inputs.push(v);
            carried_types.push(ty);
        }
        let at = self.at();
        let node = self.graph.insert(at, NodeKind::Loop, &inputs, vec![]);
        let body_block = self.graph.add_block(node);
        let iter = self.graph.add_block_param(body_block, Type::Int);

        let saved_env = self.env.clone();
        let outer = self.block;
        for (name, ty) in carried.iter().zip(&carried_types) {
            let p = self.graph.add_block_param(body_block, ty.clone());
            if !name.starts_with('$') {
                self.graph.set_debug_name(p, name.clone());
            }
            self.env.insert(name.clone(), p);
        }
        self.block = body_block;

        if let Some((t, _)) = target {
            let elem = match kind {
                LoopKind::Range { lo, step } => self.op("__derive_index", &[iter, lo, step], span)?,
                LoopKind::Sequence { seq } => match self.ty(seq) {
                    Type::List(e) => self.node1(NodeKind::ListIndex, &[seq, iter], *e),
                    _ => {
                        let zero = self.constant(Constant::Int(0));
                        self.op("select", &[seq, zero, iter], span)?
                    }
                },
                LoopKind::While(_) => iter,
            };
            self.assign(t, elem, span)?;
        }
        if has_continue {
            let f = self.constant(Constant::Bool(false));
            self.env.insert(cont_flag(depth), f);
        }

        self.emit_block(body)?;

        let mut next = match kind {
            LoopKind::While(cond) => self.emit_cond(cond)?,
            _ => self.constant(Constant::Bool(true)),
        };
        if has_break {
            let broke = self.env[&broke_flag(depth)];
            let not_broke = self.not_value(broke, span)?;
            next = self.and_values(next, not_broke, span)?;
        }
        if has_return {
            let returned = self.env[RETURNED];
            let not_returned = self.not_value(returned, span)?;
            next = self.and_values(next, not_returned, span)?;
        }
        self.graph.add_block_return(body_block, next);
        for (name, ty) in carried.iter().zip(&carried_types) {
            let v = self.env[name];
            let v = self.coerce(v, ty, span, |found| {
                format!(
                    "Variable '{name}' previously had type {ty} but is now being assigned to a value of type {found}"
                )
            })?;
            self.graph.add_block_return(body_block, v);
        }

        self.block = outer;
        self.env = saved_env;
        for (name, ty) in carried.iter().zip(carried_types) {
            let out = self.graph.add_node_output(node, ty);
            if !name.starts_with('$') {
                self.graph.set_debug_name(out, name.clone());
            }
            self.env.insert(name.clone(), out);
        }
        self.env.remove(&broke_flag(depth));
        self.loop_depth -= 1;
        Ok(if has_return { Flow::MayExit } else { Flow::Normal })
    }

    // Expressions

    fn emit_expr(&mut self, expr: &Expr, hint: Option<&Type>) -> Result<ValueId> {
        match expr {
            Expr::Int(n, _) => Ok(match hint.map(Type::unwrap_optional) {
                Some(Type::Float) => self.constant(Constant::Float(*n as f64)),
                _ => self.constant(Constant::Int(*n)),
            }),
            Expr::Float(v, _) => Ok(self.constant(Constant::Float(*v))),
            Expr::Bool(b, _) => Ok(self.constant(Constant::Bool(*b))),
            Expr::Str(s, _) => Ok(self.constant(Constant::Str(s.clone()))),
            Expr::None(_) => Ok(match hint {
                Some(t) if t.is_optional() => self.constant_typed(Constant::None, t.clone()),
                _ => self.constant(Constant::None),
            }),
            Expr::Name(name, span) => self.emit_name(name, *span),
            Expr::List(items, span) => self.emit_list(items, hint, *span),
            Expr::Tuple(items, _) => {
                let hints = hint.and_then(Type::tuple_elements);
                let mut vals = Vec::new();
                for (i, e) in items.iter().enumerate() {
                    let h = hints.as_ref().and_then(|h| h.get(i));
                    vals.push(self.emit_expr(e, h)?);
                }
                let ty = Type::Tuple(vals.iter().map(|&v| self.ty(v)).collect());
                Ok(self.node1(NodeKind::TupleConstruct, &vals, ty))
            }
            Expr::Binary {
                left,
                op: BinOp::And,
                right,
                span,
            } => {
                let l = self.emit_cond(left)?;
                self.emit_if_value(
                    l,
                    |em| em.emit_cond(right),
                    |em| Ok(em.constant(Constant::Bool(false))),
                    *span,
                )
            }
            Expr::Binary {
                left,
                op: BinOp::Or,
                right,
                span,
            } => {
                let l = self.emit_cond(left)?;
                self.emit_if_value(
                    l,
                    |em| Ok(em.constant(Constant::Bool(true))),
                    |em| em.emit_cond(right),
                    *span,
                )
            }
            Expr::Binary {
                left,
                op,
                right,
                span,
            } => {
                let l = self.emit_expr(left, None)?;
                let r = self.emit_expr(right, None)?;
                self.emit_binop(*op, l, r, *span)
            }
            Expr::Unary {
                op: UnaryOp::Neg,
                operand,
                span,
            } => {
                let v = self.emit_expr(operand, None)?;
                self.op("neg", &[v], *span)
            }
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
                span,
            } => {
                let v = self.emit_cond(operand)?;
                self.not_value(v, *span)
            }
            Expr::IsNone {
                operand,
                negated,
                span,
            } => {
                let v = self.emit_expr(operand, None)?;
                let is_none = match self.ty(v) {
                    Type::NoneType => self.constant(Constant::Bool(true)),
                    t if t.may_be_none() => self.node1(NodeKind::IsNone, &[v], Type::Bool),
                    _ => self.constant(Constant::Bool(false)),
                };
                if *negated {
                    self.not_value(is_none, *span)
                } else {
                    Ok(is_none)
                }
            }
            Expr::IfExp {
                cond,
                then,
                orelse,
                span,
            } => {
                let refinement = self.refinement_of(cond);
                let c = self.emit_cond(cond)?;
                let (r1, r2) = (&refinement, &refinement);
                self.emit_if_value(
                    c,
                    |em| {
                        em.apply_refinement(r1, true);
                        em.emit_expr(then, hint)
                    },
                    |em| {
                        em.apply_refinement(r2, false);
                        em.emit_expr(orelse, hint)
                    },
                    *span,
                )
            }
            Expr::Attribute { object, name, span } => {
                let obj = self.emit_expr(object, None)?;
                self.emit_attribute(obj, name, *span)
            }
            Expr::Call {
                func,
                args,
                kwargs,
                span,
            } => self.emit_call(func, args, kwargs, *span),
            Expr::Subscript {
                object,
                index,
                span,
            } => self.emit_subscript(object, index, *span),
        }
    }

    fn emit_name(&mut self, name: &str, span: Span) -> Result<ValueId> {
        if let Some(&v) = self.env.get(name) {
            return Ok(v);
        }
        match self.ctx.resolver.resolve(name) {
            Some(Resolved::Constant(c)) => Ok(self.constant(c)),
            Some(_) => Err(Error::type_error(
                format!("'{name}' cannot be used as a value"),
                span,
            )),
            None => Err(Error::new(ErrorKind::UndefinedName(name.to_string()), span)),
        }
    }

    fn emit_list(&mut self, items: &[Expr], hint: Option<&Type>, span: Span) -> Result<ValueId> {
        let elem_hint = hint.and_then(|h| h.unwrap_optional().element_type()).cloned();
        let mut vals = Vec::new();
        for e in items {
            vals.push(self.emit_expr(e, elem_hint.as_ref())?);
        }
        let elem = match &elem_hint {
            Some(h) => {
                let mut converted = Vec::new();
                for (&v, e) in vals.iter().zip(items) {
                    converted.push(self.coerce(v, h, e.span(), |found| {
                        format!("list element of type {found} does not match {h}")
                    })?);
                }
                vals = converted;
                h.clone()
            }
            None if vals.is_empty() => Type::tensor(),
            None => {
                let types: Vec<Type> = vals.iter().map(|&v| self.ty(v)).collect();
                let unified = Type::unify_all(types.iter()).ok_or_else(|| {
                    Error::type_error(
                        format!(
                            "Lists must contain only a single type, found {}",
                            types.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" and ")
                        ),
                        span,
                    )
                })?;
                if unified == Type::Number {
                    let mut converted = Vec::new();
                    for &v in &vals {
                        converted.push(self.coerce(v, &Type::Float, span, |f| f.to_string())?);
                    }
                    vals = converted;
                    Type::Float
                } else {
                    unified
                }
            }
        };
        Ok(self.node1(NodeKind::ListConstruct, &vals, Type::list(elem)))
    }

    fn emit_binop(&mut self, op: BinOp, l: ValueId, r: ValueId, span: Span) -> Result<ValueId> {
        let (lt, rt) = (self.ty(l), self.ty(r));
        let scalar_left = matches!(lt, Type::Int | Type::Float | Type::Number | Type::Bool);
        if scalar_left && rt.is_tensor() {
            return match op {
                BinOp::Add | BinOp::Mul | BinOp::Eq | BinOp::Ne => self.op(op.op_name(), &[r, l], span),
                BinOp::Sub => self.op("rsub", &[r, l], span),
                BinOp::Lt => self.op("gt", &[r, l], span),
                BinOp::Gt => self.op("lt", &[r, l], span),
                BinOp::Le => self.op("ge", &[r, l], span),
                BinOp::Ge => self.op("le", &[r, l], span),
                _ => {
                    let lt = self.op("scalar_tensor", &[l], span)?;
                    self.op(op.op_name(), &[lt, r], span)
                }
            };
        }
        self.op(op.op_name(), &[l, r], span)
    }

    fn emit_attribute(&mut self, obj: ValueId, name: &str, span: Span) -> Result<ValueId> {
        match self.ty(obj) {
            Type::Class(_) => self.get_attr(obj, name, span),
            Type::NamedTuple(nt) => {
                let Some(index) = nt.field_index(name) else {
                    return Err(Error::type_error(
                        format!("'{}' has no field '{name}'", nt.name),
                        span,
                    ));
                };
                let ty = nt.fields[index].1.clone();
                Ok(self.node1(NodeKind::TupleIndex { index }, &[obj], ty))
            }
            Type::Tensor(_) if name == "shape" => self.op("size", &[obj], span),
            other => Err(Error::type_error(
                format!("'{other}' object has no attribute '{name}'"),
                span,
            )),
        }
    }

    fn emit_subscript(&mut self, object: &Expr, index: &Expr, span: Span) -> Result<ValueId> {
        let obj = self.emit_expr(object, None)?;
        match self.ty(obj) {
            Type::List(elem) => {
                let i = self.emit_expr(index, Some(&Type::Int))?;
                if self.ty(i) != Type::Int {
                    return Err(Error::type_error("list indices must be integers", index.span()));
                }
                Ok(self.node1(NodeKind::ListIndex, &[obj, i], *elem))
            }
            t @ (Type::Tuple(_) | Type::NamedTuple(_)) => {
                let elems = t.tuple_elements().unwrap_or_default();
                let Expr::Int(i, _) = index else {
                    return Err(Error::type_error(
                        "tuple indices must be integer literals",
                        index.span(),
                    ));
                };
                let len = elems.len() as i64;
                let idx = if *i < 0 { *i + len } else { *i };
                if idx < 0 || idx >= len {
                    return Err(Error::type_error(
                        format!("tuple index {i} out of range for a tuple of {len} elements"),
                        span,
                    ));
                }
                let ty = elems[idx as usize].clone();
                Ok(self.node1(NodeKind::TupleIndex { index: idx as usize }, &[obj], ty))
            }
            Type::Tensor(_) => {
                let i = self.emit_expr(index, None)?;
                let zero = self.constant(Constant::Int(0));
                self.op("select", &[obj, zero, i], span)
            }
            other => Err(Error::type_error(
                format!("'{other}' object is not subscriptable"),
                span,
            )),
        }
    }

    // Calls

    fn emit_args(
        &mut self,
        args: &[Expr],
        kwargs: &[Keyword],
        hints: &dyn Fn(usize, Option<&str>) -> Option<Type>,
    ) -> Result<(Vec<ValueId>, Vec<(String, ValueId)>)> {
        let mut vals = Vec::new();
        for (i, a) in args.iter().enumerate() {
            let h = hints(i, None);
            vals.push(self.emit_expr(a, h.as_ref())?);
        }
        let mut kw = Vec::new();
        for k in kwargs {
            let h = hints(0, Some(&k.name));
            kw.push((k.name.clone(), self.emit_expr(&k.value, h.as_ref())?));
        }
        Ok((vals, kw))
    }

    /// Parameter type hint shared by every overload of an operator.
    fn op_hint(op: &str, offset: usize) -> impl Fn(usize, Option<&str>) -> Option<Type> + '_ {
        move |i, kw| {
            let overloads = OperatorRegistry::builtin().overloads(op);
            let mut found: Option<Type> = None;
            for s in overloads {
                let arg = match kw {
                    Some(k) => s.arguments.iter().find(|a| a.name == k),
                    None => s.arguments.get(i + offset),
                };
                let t = arg.map(|a| a.ty.clone())?;
                match &found {
                    Some(f) if *f != t => return None,
                    _ => found = Some(t),
                }
            }
            found
        }
    }

    fn emit_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        kwargs: &[Keyword],
        span: Span,
    ) -> Result<ValueId> {
        match func {
            Expr::Name(name, _) if !self.env.contains_key(name) => {
                self.emit_named_call(name, args, kwargs, span)
            }
            Expr::Attribute { object, name, .. } => {
                let obj = self.emit_expr(object, None)?;
                self.emit_method_call(obj, name, args, kwargs, span)
            }
            other => {
                let callee = self.emit_expr(other, None)?;
                self.emit_method_call(callee, "forward", args, kwargs, span)
            }
        }
    }

    fn emit_named_call(
        &mut self,
        name: &str,
        args: &[Expr],
        kwargs: &[Keyword],
        span: Span,
    ) -> Result<ValueId> {
        match name {
            "len" | "str" => {
                let (vals, _) = self.emit_args(args, &[], &|_, _| None)?;
                self.op(name, &vals, span)
            }
            "float" | "int" | "bool" => {
                let (target, op) = match name {
                    "float" => (Type::Float, "Float"),
                    "int" => (Type::Int, "Int"),
                    _ => (Type::Bool, "Bool"),
                };
                let (vals, _) = self.emit_args(args, &[], &|_, _| None)?;
                if vals.len() == 1 && self.ty(vals[0]) == target {
                    return Ok(vals[0]);
                }
                self.op(op, &vals, span)
            }
            "print" => {
                let (vals, _) = self.emit_args(args, &[], &|_, _| None)?;
                let at = self.at();
                self.graph.insert(at, NodeKind::Print, &vals, vec![]);
                Ok(self.constant(Constant::None))
            }
            "range" => Err(Error::type_error(
                "range() can only be used as the iterable of a for loop",
                span,
            )),
            "fork" => self.emit_fork(args, kwargs, span),
            "wait" => {
                let (vals, _) = self.emit_args(args, &[], &|_, _| None)?;
                let [fut] = vals.as_slice() else {
                    return Err(Error::type_error("wait() takes exactly one argument", span));
                };
                match self.ty(*fut) {
                    Type::Future(inner) => Ok(self.node1(NodeKind::Wait, &[*fut], *inner)),
                    other => Err(Error::type_error(
                        format!("wait() expects a Future but found {other}"),
                        span,
                    )),
                }
            }
            "unwrap_optional" => {
                let (vals, _) = self.emit_args(args, &[], &|_, _| None)?;
                let [v] = vals.as_slice() else {
                    return Err(Error::type_error(
                        "unwrap_optional() takes exactly one argument",
                        span,
                    ));
                };
                match self.ty(*v) {
                    Type::Optional(inner) => {
                        Ok(self.node1(NodeKind::UnwrapOptional, &[*v], *inner))
                    }
                    Type::NoneType => Err(Error::type_error(
                        "unwrap_optional() cannot be applied to None",
                        span,
                    )),
                    _ => Ok(*v),
                }
            }
            "annotate" => {
                let [ty_expr, value] = args else {
                    return Err(Error::type_error("annotate() takes a type and a value", span));
                };
                let te = expr_to_type(ty_expr)?;
                let ty = self.resolve_type(&te)?;
                let v = self.emit_expr(value, Some(&ty))?;
                self.coerce(v, &ty, span, |found| {
                    format!("annotate() expected a value of type {ty} but found {found}")
                })
            }
            _ => {
                if let Some(ty) = self.ctx.lookup_type(name) {
                    return self.emit_constructor(ty, args, kwargs, span);
                }
                if let Some(q) = self.ctx.function_name(name) {
                    let f = self.ctx.ensure_compiled(&q).map_err(|e| spanned(e, span))?;
                    let schema = f.schema.clone();
                    let (vals, kw) = self.emit_args(args, kwargs, &|i, k| match k {
                        Some(k) => schema.arguments.iter().find(|a| a.name == k).map(|a| a.ty.clone()),
                        None => schema.arguments.get(i).map(|a| a.ty.clone()),
                    })?;
                    return self.call_function(&f, vals, kw, span);
                }
                if OperatorRegistry::builtin().contains(name) {
                    let (vals, kw) = self.emit_args(args, kwargs, &Self::op_hint(name, 0))?;
                    return self.op_kw(name, &vals, &kw, span);
                }
                Err(Error::new(ErrorKind::UndefinedName(name.to_string()), span))
            }
        }
    }

    fn emit_constructor(
        &mut self,
        ty: Type,
        args: &[Expr],
        kwargs: &[Keyword],
        span: Span,
    ) -> Result<ValueId> {
        let Type::NamedTuple(nt) = &ty else {
            return Err(Error::type_error(
                format!("cannot construct '{ty}' in compiled code"),
                span,
            ));
        };
        if !kwargs.is_empty() || args.len() != nt.fields.len() {
            return Err(Error::type_error(
                format!(
                    "'{}' takes {} positional argument(s) but {} were given",
                    nt.name,
                    nt.fields.len(),
                    args.len()
                ),
                span,
            ));
        }
        let mut vals = Vec::new();
        for (e, (field, fty)) in args.iter().zip(&nt.fields) {
            let v = self.emit_expr(e, Some(fty))?;
            vals.push(self.coerce(v, fty, e.span(), |found| {
                format!(
                    "Expected a value of type '{fty}' for field '{field}' but instead found type '{found}'."
                )
            })?);
        }
        Ok(self.node1(NodeKind::NamedTupleConstruct, &vals, ty.clone()))
    }

    fn emit_method_call(
        &mut self,
        obj: ValueId,
        name: &str,
        args: &[Expr],
        kwargs: &[Keyword],
        span: Span,
    ) -> Result<ValueId> {
        match self.ty(obj) {
            Type::Class(class) => {
                if class.has_method(name) {
                    let f = self
                        .ctx
                        .ensure_compiled(&class.method_qualname(name))
                        .map_err(|e| spanned(e, span))?;
                    let schema = f.schema.clone();
                    let (vals, kw) = self.emit_args(args, kwargs, &|i, k| match k {
                        Some(k) => schema.arguments.iter().find(|a| a.name == k).map(|a| a.ty.clone()),
                        None => schema.arguments.get(i + 1).map(|a| a.ty.clone()),
                    })?;
                    let mut all = vec![obj];
                    all.extend(vals);
                    return self.call_function(&f, all, kw, span);
                }
                if let Some(attr) = class.attribute(name) {
                    if matches!(attr.ty, Type::Class(_)) {
                        let sub = self.get_attr(obj, name, span)?;
                        return self.emit_method_call(sub, "forward", args, kwargs, span);
                    }
                }
                Err(Error::type_error(
                    format!("Module '{}' has no method '{name}'", class.name),
                    span,
                ))
            }
            Type::Tensor(_) => {
                if !OperatorRegistry::builtin().contains(name) {
                    return Err(Error::type_error(
                        format!("'Tensor' object has no method '{name}'"),
                        span,
                    ));
                }
                let (vals, kw) = self.emit_args(args, kwargs, &Self::op_hint(name, 1))?;
                let mut all = vec![obj];
                all.extend(vals);
                self.op_kw(name, &all, &kw, span)
            }
            Type::Future(inner) if name == "wait" && args.is_empty() => {
                Ok(self.node1(NodeKind::Wait, &[obj], *inner))
            }
            other => Err(Error::type_error(
                format!("'{other}' object has no method '{name}'"),
                span,
            )),
        }
    }

    /// Bind already emitted values against a compiled function and emit the
    /// call. Methods receive the object as the first value.
    fn call_function(
        &mut self,
        f: &Function,
        args: Vec<ValueId>,
        kwargs: Vec<(String, ValueId)>,
        span: Span,
    ) -> Result<ValueId> {
        let arg_types: Vec<Type> = args.iter().map(|&v| self.ty(v)).collect();
        let kw_types: Vec<(String, Type)> = kwargs.iter().map(|(n, v)| (n.clone(), self.ty(*v))).collect();
        let bindings = f.schema.bind(&arg_types, &kw_types).map_err(|reason| {
            Error::new(
                ErrorKind::SchemaMatch {
                    op: f.name.clone(),
                    candidates: vec![format!("{}:\n  {reason}", f.schema)],
                },
                span,
            )
        })?;
        let at = self.at();
        let inputs = self
            .graph
            .materialize_bindings(at, &f.schema, &bindings, &args, &kwargs);
        let kind = if f.is_method() {
            NodeKind::CallMethod {
                name: f.basename().to_string(),
            }
        } else {
            NodeKind::CallFunction {
                name: f.name.clone(),
            }
        };
        Ok(self.node1(kind, &inputs, f.return_type().clone()))
    }

    /// `fork(callable, args...)`. Arguments are evaluated by the caller; the
    /// call itself runs inside the Fork block.
    fn emit_fork(&mut self, args: &[Expr], kwargs: &[Keyword], span: Span) -> Result<ValueId> {
        let Some((callee, rest)) = args.split_first() else {
            return Err(Error::type_error("fork() expects a callable", span));
        };
        let (function, receiver) = match callee {
            Expr::Name(name, nspan) if !self.env.contains_key(name) => {
                let Some(q) = self.ctx.function_name(name) else {
                    return Err(Error::new(ErrorKind::UndefinedName(name.clone()), *nspan));
                };
                (self.ctx.ensure_compiled(&q).map_err(|e| spanned(e, span))?, None)
            }
            other => {
                let (obj, method) = match other {
                    Expr::Attribute { object, name, span } => {
                        let obj = self.emit_expr(object, None)?;
                        let class = self.class_of(obj, *span)?;
                        if class.has_method(name) {
                            (obj, name.clone())
                        } else {
                            (self.get_attr(obj, name, *span)?, "forward".to_string())
                        }
                    }
                    e => (self.emit_expr(e, None)?, "forward".to_string()),
                };
                let class = self.class_of(obj, span)?;
                if !class.has_method(&method) {
                    return Err(Error::type_error(
                        format!("Module '{}' has no method '{method}'", class.name),
                        span,
                    ));
                }
                let f = self
                    .ctx
                    .ensure_compiled(&class.method_qualname(&method))
                    .map_err(|e| spanned(e, span))?;
                (f, Some(obj))
            }
        };
        let offset = usize::from(receiver.is_some());
        let schema = function.schema.clone();
        let (vals, kw) = self.emit_args(rest, kwargs, &|i, k| match k {
            Some(k) => schema.arguments.iter().find(|a| a.name == k).map(|a| a.ty.clone()),
            None => schema.arguments.get(i + offset).map(|a| a.ty.clone()),
        })?;
        let mut all: Vec<ValueId> = receiver.into_iter().collect();
        all.extend(vals);

        let at = self.at();
        let node = self.graph.insert(at, NodeKind::Fork, &[], vec![]);
        let body = self.graph.add_block(node);
        let outer = self.block;
        self.block = body;
        let result = self.call_function(&function, all, kw, span);
        self.block = outer;
        let result = result?;
        self.graph.add_block_return(body, result);
        let ty = Type::future(function.return_type().clone());
        Ok(self.graph.add_node_output(node, ty))
    }
}

/// Read a type written in expression position, e.g. `List[int]`.
fn expr_to_type(e: &Expr) -> Result<TypeExpr> {
    match e {
        Expr::Name(n, span) => Ok(TypeExpr {
            name: n.clone(),
            args: Vec::new(),
            span: *span,
        }),
        Expr::None(span) => Ok(TypeExpr {
            name: "None".into(),
            args: Vec::new(),
            span: *span,
        }),
        Expr::Subscript {
            object,
            index,
            span,
        } => {
            let Expr::Name(n, _) = object.as_ref() else {
                return Err(Error::type_error("expected a type", *span));
            };
            let args = match index.as_ref() {
                Expr::Tuple(items, _) => items.iter().map(expr_to_type).collect::<Result<_>>()?,
                other => vec![expr_to_type(other)?],
            };
            Ok(TypeExpr {
                name: n.clone(),
                args,
                span: *span,
            })
        }
        other => Err(Error::type_error("expected a type", other.span())),
    }
}
