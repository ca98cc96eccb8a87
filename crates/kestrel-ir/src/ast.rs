// AST: syntax tree of the script language
//
// The parser produces a `SourceFile` made of three kinds of items:
//
//   def f(x: Tensor, n: int = 1) -> Tensor { ... }       function
//   class Linear { param weight: Tensor; def forward(self, x) { ... } }
//   namedtuple Pair { first: Tensor, second: int }
//
// Statements and expressions keep their Span so the compiler can point at
// the offending source when type checking fails.

use crate::token::Span;

/// A parsed source text.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Def(FunctionDef),
    Class(ClassDef),
    NamedTuple(NamedTupleDef),
}

impl Item {
    pub fn name(&self) -> &str {
        match self {
            Item::Def(d) => &d.name,
            Item::Class(c) => &c.name,
            Item::NamedTuple(n) => &n.name,
        }
    }

    pub fn span(&self) -> Span {
        match self {
            Item::Def(d) => d.span,
            Item::Class(c) => c.span,
            Item::NamedTuple(n) => n.span,
        }
    }
}

/// Syntactic type annotation: `Tensor`, `List[int]`, `Optional[Tuple[int, float]]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub name: String,
    pub args: Vec<TypeExpr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub default: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// Declared storage class of a class attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrDeclKind {
    /// `param weight: Tensor;` trainable tensor.
    Parameter,
    /// `buffer running_mean: Tensor;` non-trainable tensor state.
    Buffer,
    /// `name: Type;` plain attribute or submodule.
    Attribute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttrDecl {
    pub name: String,
    pub ty: TypeExpr,
    pub kind: AttrDeclKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub name: String,
    pub attrs: Vec<AttrDecl>,
    pub methods: Vec<FunctionDef>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedTupleDef {
    pub name: String,
    pub fields: Vec<(String, TypeExpr)>,
    pub span: Span,
}

// Statements

#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Name(String, Span),
    Attr {
        object: Box<Expr>,
        name: String,
        span: Span,
    },
    Tuple(Vec<AssignTarget>, Span),
}

impl AssignTarget {
    pub fn span(&self) -> Span {
        match self {
            AssignTarget::Name(_, s) | AssignTarget::Tuple(_, s) => *s,
            AssignTarget::Attr { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign {
        target: AssignTarget,
        ann: Option<TypeExpr>,
        value: Expr,
        span: Span,
    },
    AugAssign {
        target: AssignTarget,
        op: BinOp,
        value: Expr,
        span: Span,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        span: Span,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    For {
        target: AssignTarget,
        iter: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    Return(Option<Expr>, Span),
    Break(Span),
    Continue(Span),
    Pass(Span),
    Raise(Option<Expr>, Span),
    Assert {
        cond: Expr,
        msg: Option<Expr>,
        span: Span,
    },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Expr(e) => e.span(),
            Stmt::Assign { span, .. }
            | Stmt::AugAssign { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Assert { span, .. } => *span,
            Stmt::Return(_, s)
            | Stmt::Break(s)
            | Stmt::Continue(s)
            | Stmt::Pass(s)
            | Stmt::Raise(_, s) => *s,
        }
    }
}

// Expressions

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Operator name in the builtin registry.
    pub fn op_name(&self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::FloorDiv => "floordiv",
            BinOp::Mod => "remainder",
            BinOp::Pow => "pow",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Lt => "lt",
            BinOp::Gt => "gt",
            BinOp::Le => "le",
            BinOp::Ge => "ge",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64, Span),
    Float(f64, Span),
    Bool(bool, Span),
    Str(String, Span),
    None(Span),
    Name(String, Span),
    List(Vec<Expr>, Span),
    Tuple(Vec<Expr>, Span),
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    /// `x is None` / `x is not None`.
    IsNone {
        operand: Box<Expr>,
        negated: bool,
        span: Span,
    },
    /// `a if cond else b`.
    IfExp {
        cond: Box<Expr>,
        then: Box<Expr>,
        orelse: Box<Expr>,
        span: Span,
    },
    Attribute {
        object: Box<Expr>,
        name: String,
        span: Span,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<Keyword>,
        span: Span,
    },
    Subscript {
        object: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Int(_, s)
            | Expr::Float(_, s)
            | Expr::Bool(_, s)
            | Expr::Str(_, s)
            | Expr::None(s)
            | Expr::Name(_, s)
            | Expr::List(_, s)
            | Expr::Tuple(_, s) => *s,
            Expr::Binary { span, .. }
            | Expr::Unary { span, .. }
            | Expr::IsNone { span, .. }
            | Expr::IfExp { span, .. }
            | Expr::Attribute { span, .. }
            | Expr::Call { span, .. }
            | Expr::Subscript { span, .. } => *span,
        }
    }
}
