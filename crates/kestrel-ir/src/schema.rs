// Schema: operator signatures and the builtin operator registry
//
// Operators are declared with a compact signature string:
//
//   add.Tensor(Tensor self, Tensor other) -> Tensor
//   elu(Tensor self, float alpha=1.0) -> Tensor
//   sum.dim(Tensor self, int dim, bool keepdim=False) -> Tensor
//   _test_optional_intlist(Tensor values, int[]? incr) -> Tensor
//
// Argument types: Tensor int float bool str Scalar Any, with `[]` for lists
// and a trailing `?` for Optional. `Scalar` is the `number` type. A `*` in
// the argument list makes the following arguments keyword-only.
//
// Every operator carries flags consumed by the optimisation passes:
//
//   pure       no observable side effects; eligible for CSE and DCE
//   pointwise  elementwise on tensors; eligible for fusion
//   mutates    index of an argument written in place
//   aliases    index of an argument the output may share storage with
//
// Binding follows the call rules of the script language: positional
// arguments first, then keywords, then defaults. An `int` may be passed where
// a `float` is expected; nothing else is converted.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, ErrorKind, Result};
use crate::graph::Constant;
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};
use crate::types::Type;

#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    pub ty: Type,
    pub default: Option<Constant>,
    pub kwarg_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpFlags {
    pub pure: bool,
    pub pointwise: bool,
    pub mutates: Option<usize>,
    pub aliases: Option<usize>,
}

/// Signature of an operator or compiled function.
#[derive(Debug, Clone)]
pub struct FunctionSchema {
    pub name: String,
    pub overload: String,
    pub arguments: Vec<Argument>,
    pub returns: Type,
    pub flags: OpFlags,
}

/// How one schema argument is supplied by a call.
#[derive(Debug, Clone)]
pub enum Binding {
    Positional(usize),
    Keyword(usize),
    Default(Constant),
}

/// Why a call does not fit a schema.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchFailure {
    ArgumentType {
        name: String,
        expected: Type,
        found: Type,
    },
    TooManyArguments {
        expected: usize,
        found: usize,
    },
    MissingArgument(String),
    UnknownKeyword(String),
    DuplicateArgument(String),
}

impl fmt::Display for MatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchFailure::ArgumentType {
                name,
                expected,
                found,
            } => write!(
                f,
                "Expected a value of type '{expected}' for argument '{name}' but instead found type '{found}'."
            ),
            MatchFailure::TooManyArguments { expected, found } => write!(
                f,
                "Expected at most {expected} positional argument(s) but found {found}."
            ),
            MatchFailure::MissingArgument(name) => {
                write!(f, "Argument '{name}' not provided.")
            }
            MatchFailure::UnknownKeyword(name) => write!(f, "Keyword argument '{name}' unknown."),
            MatchFailure::DuplicateArgument(name) => {
                write!(f, "Argument '{name}' specified twice.")
            }
        }
    }
}

/// Whether a value of type `found` may be passed for a parameter of type
/// `expected`.
pub fn accepts(expected: &Type, found: &Type) -> bool {
    if found.is_subtype_of(expected) {
        return true;
    }
    matches!((expected.unwrap_optional(), found), (Type::Float, Type::Int))
}

impl FunctionSchema {
    pub fn new(name: impl Into<String>, arguments: Vec<Argument>, returns: Type) -> Self {
        FunctionSchema {
            name: name.into(),
            overload: String::new(),
            arguments,
            returns,
            flags: OpFlags::default(),
        }
    }

    /// `name` or `name.overload`.
    pub fn qualified_name(&self) -> String {
        if self.overload.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, self.overload)
        }
    }

    pub fn argument_index(&self, name: &str) -> Option<usize> {
        self.arguments.iter().position(|a| a.name == name)
    }

    /// Match argument types against this schema.
    pub fn bind(
        &self,
        args: &[Type],
        kwargs: &[(String, Type)],
    ) -> std::result::Result<Vec<Binding>, MatchFailure> {
        let positional = self.arguments.iter().filter(|a| !a.kwarg_only).count();
        if args.len() > positional {
            return Err(MatchFailure::TooManyArguments {
                expected: positional,
                found: args.len(),
            });
        }
        let mut bindings = Vec::with_capacity(self.arguments.len());
        for (i, param) in self.arguments.iter().enumerate() {
            let kw = kwargs.iter().position(|(n, _)| *n == param.name);
            let binding = if i < args.len() {
                if kw.is_some() {
                    return Err(MatchFailure::DuplicateArgument(param.name.clone()));
                }
                check(param, &args[i])?;
                Binding::Positional(i)
            } else if let Some(k) = kw {
                check(param, &kwargs[k].1)?;
                Binding::Keyword(k)
            } else if let Some(d) = &param.default {
                Binding::Default(d.clone())
            } else {
                return Err(MatchFailure::MissingArgument(param.name.clone()));
            };
            bindings.push(binding);
        }
        if let Some((name, _)) = kwargs.iter().find(|(n, _)| self.argument_index(n).is_none()) {
            return Err(MatchFailure::UnknownKeyword(name.clone()));
        }
        Ok(bindings)
    }

    /// Parse a signature string.
    pub fn parse(text: &str) -> Result<FunctionSchema> {
        let tokens = Lexer::new(text).tokenize()?;
        SchemaParser { tokens, pos: 0 }.parse()
    }
}

fn check(param: &Argument, found: &Type) -> std::result::Result<(), MatchFailure> {
    if accepts(&param.ty, found) {
        Ok(())
    } else {
        Err(MatchFailure::ArgumentType {
            name: param.name.clone(),
            expected: param.ty.clone(),
            found: found.clone(),
        })
    }
}

/// Schema spelling of a type: `int[]`, `Tensor?`, `Scalar`.
fn schema_type_name(ty: &Type) -> String {
    match ty {
        Type::Number => "Scalar".into(),
        Type::List(e) => format!("{}[]", schema_type_name(e)),
        Type::Optional(e) => format!("{}?", schema_type_name(e)),
        other => other.to_string(),
    }
}

impl fmt::Display for FunctionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.qualified_name())?;
        let mut kw_marked = false;
        for (i, a) in self.arguments.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if a.kwarg_only && !kw_marked {
                write!(f, "*, ")?;
                kw_marked = true;
            }
            write!(f, "{} {}", schema_type_name(&a.ty), a.name)?;
            if let Some(d) = &a.default {
                write!(f, "={d}")?;
            }
        }
        write!(f, ") -> {}", schema_type_name(&self.returns))
    }
}

struct SchemaParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl SchemaParser {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn next(&mut self) -> TokenKind {
        let k = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        k
    }

    fn expect(&mut self, kind: TokenKind) -> Result<()> {
        let got = self.next();
        if std::mem::discriminant(&got) == std::mem::discriminant(&kind) {
            Ok(())
        } else {
            Err(Error::without_span(ErrorKind::UnexpectedToken {
                expected: kind.to_string(),
                got: got.to_string(),
            }))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            TokenKind::Ident(s) => Ok(s),
            TokenKind::None => Ok("None".into()),
            other => Err(Error::without_span(ErrorKind::UnexpectedToken {
                expected: "an identifier".into(),
                got: other.to_string(),
            })),
        }
    }

    fn parse(mut self) -> Result<FunctionSchema> {
        let name = self.ident()?;
        let overload = if *self.peek() == TokenKind::Dot {
            self.next();
            self.ident()?
        } else {
            String::new()
        };
        self.expect(TokenKind::LParen)?;
        let mut arguments = Vec::new();
        let mut kwarg_only = false;
        while *self.peek() != TokenKind::RParen {
            if *self.peek() == TokenKind::Star {
                self.next();
                kwarg_only = true;
            } else {
                let ty = self.parse_type()?;
                let arg_name = self.ident()?;
                let default = if *self.peek() == TokenKind::Eq {
                    self.next();
                    Some(self.parse_default()?)
                } else {
                    None
                };
                arguments.push(Argument {
                    name: arg_name,
                    ty,
                    default,
                    kwarg_only,
                });
            }
            if *self.peek() != TokenKind::RParen {
                self.expect(TokenKind::Comma)?;
            }
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Arrow)?;
        let returns = self.parse_type()?;
        Ok(FunctionSchema {
            name,
            overload,
            arguments,
            returns,
            flags: OpFlags::default(),
        })
    }

    fn parse_type(&mut self) -> Result<Type> {
        let name = self.ident()?;
        let mut ty = match name.as_str() {
            "Scalar" => Type::Number,
            other => Type::parse_builtin(other)?,
        };
        loop {
            match self.peek() {
                TokenKind::LBracket => {
                    self.next();
                    self.expect(TokenKind::RBracket)?;
                    ty = Type::list(ty);
                }
                TokenKind::Question => {
                    self.next();
                    ty = Type::optional(ty);
                }
                _ => return Ok(ty),
            }
        }
    }

    fn parse_default(&mut self) -> Result<Constant> {
        let negative = if *self.peek() == TokenKind::Minus {
            self.next();
            true
        } else {
            false
        };
        let sign = if negative { -1.0 } else { 1.0 };
        match self.next() {
            TokenKind::IntLit(n) => Ok(Constant::Int(if negative { -n } else { n })),
            TokenKind::FloatLit(v) => Ok(Constant::Float(sign * v)),
            TokenKind::True => Ok(Constant::Bool(true)),
            TokenKind::False => Ok(Constant::Bool(false)),
            TokenKind::None => Ok(Constant::None),
            TokenKind::StringLit(s) => Ok(Constant::Str(s)),
            TokenKind::LBracket => {
                let mut items = Vec::new();
                while *self.peek() != TokenKind::RBracket {
                    match self.next() {
                        TokenKind::IntLit(n) => items.push(n),
                        other => {
                            return Err(Error::without_span(ErrorKind::UnexpectedToken {
                                expected: "an integer".into(),
                                got: other.to_string(),
                            }))
                        }
                    }
                    if *self.peek() == TokenKind::Comma {
                        self.next();
                    }
                }
                self.next();
                Ok(Constant::IntList(items))
            }
            other => Err(Error::without_span(ErrorKind::UnexpectedToken {
                expected: "a default value".into(),
                got: other.to_string(),
            })),
        }
    }
}

// Registry

/// Read-only table of operator schemas, grouped by name in overload order.
#[derive(Debug, Default)]
pub struct OperatorRegistry {
    by_name: HashMap<String, Vec<Arc<FunctionSchema>>>,
    by_qualified: HashMap<String, Arc<FunctionSchema>>,
}

impl OperatorRegistry {
    /// The process-wide builtin operator set.
    pub fn builtin() -> &'static OperatorRegistry {
        static REGISTRY: OnceLock<OperatorRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            let mut reg = OperatorRegistry::default();
            for (sig, flags) in builtin_signatures() {
                match FunctionSchema::parse(&sig) {
                    Ok(mut schema) => {
                        schema.flags = flags;
                        reg.register(schema);
                    }
                    Err(e) => log::error!("invalid builtin schema '{sig}': {e}"),
                }
            }
            reg
        })
    }

    pub fn register(&mut self, schema: FunctionSchema) {
        let schema = Arc::new(schema);
        self.by_qualified
            .insert(schema.qualified_name(), schema.clone());
        self.by_name
            .entry(schema.name.clone())
            .or_default()
            .push(schema);
    }

    /// Overloads of `name`, in declaration order.
    pub fn overloads(&self, name: &str) -> &[Arc<FunctionSchema>] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Exact lookup by `name.overload`.
    pub fn find(&self, qualified: &str) -> Option<Arc<FunctionSchema>> {
        self.by_qualified.get(qualified).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.by_qualified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_qualified.is_empty()
    }

    /// Every qualified operator name, sorted.
    pub fn qualified_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_qualified.keys().cloned().collect();
        names.sort();
        names
    }
}

const PURE: OpFlags = OpFlags {
    pure: true,
    pointwise: false,
    mutates: None,
    aliases: None,
};

const POINTWISE: OpFlags = OpFlags {
    pure: true,
    pointwise: true,
    mutates: None,
    aliases: None,
};

const VIEW: OpFlags = OpFlags {
    pure: true,
    pointwise: false,
    mutates: None,
    aliases: Some(0),
};

const INPLACE: OpFlags = OpFlags {
    pure: false,
    pointwise: false,
    mutates: Some(0),
    aliases: Some(0),
};

const EFFECT: OpFlags = OpFlags {
    pure: false,
    pointwise: false,
    mutates: None,
    aliases: None,
};

fn builtin_signatures() -> Vec<(String, OpFlags)> {
    let sigs: Vec<(&str, OpFlags)> = vec![
        // Arithmetic
        ("add.Tensor(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("add.Scalar(Tensor self, Scalar other) -> Tensor", POINTWISE),
        ("add.int(int a, int b) -> int", PURE),
        ("add.float(float a, float b) -> float", PURE),
        ("add.str(str a, str b) -> str", PURE),
        ("sub.Tensor(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("sub.Scalar(Tensor self, Scalar other) -> Tensor", POINTWISE),
        ("sub.int(int a, int b) -> int", PURE),
        ("sub.float(float a, float b) -> float", PURE),
        ("rsub.Scalar(Tensor self, Scalar other) -> Tensor", POINTWISE),
        ("mul.Tensor(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("mul.Scalar(Tensor self, Scalar other) -> Tensor", POINTWISE),
        ("mul.int(int a, int b) -> int", PURE),
        ("mul.float(float a, float b) -> float", PURE),
        ("div.Tensor(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("div.Scalar(Tensor self, Scalar other) -> Tensor", POINTWISE),
        ("div.int(int a, int b) -> float", PURE),
        ("div.float(float a, float b) -> float", PURE),
        ("floordiv.Tensor(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("floordiv.Scalar(Tensor self, Scalar other) -> Tensor", POINTWISE),
        ("floordiv.int(int a, int b) -> int", PURE),
        ("floordiv.float(float a, float b) -> float", PURE),
        ("remainder.Tensor(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("remainder.Scalar(Tensor self, Scalar other) -> Tensor", POINTWISE),
        ("remainder.int(int a, int b) -> int", PURE),
        ("remainder.float(float a, float b) -> float", PURE),
        ("pow.Scalar(Tensor self, Scalar exponent) -> Tensor", POINTWISE),
        ("pow.int(int a, int b) -> int", PURE),
        ("pow.float(float a, float b) -> float", PURE),
        ("maximum(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("minimum(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("neg(Tensor self) -> Tensor", POINTWISE),
        ("neg.int(int a) -> int", PURE),
        ("neg.float(float a) -> float", PURE),
        // Legacy integer division, selected by the archive upgrader
        ("_div_legacy.Tensor(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("_div_legacy.Scalar(Tensor self, Scalar other) -> Tensor", POINTWISE),
        // Activations and unary math
        ("relu(Tensor self) -> Tensor", POINTWISE),
        ("sigmoid(Tensor self) -> Tensor", POINTWISE),
        ("tanh(Tensor self) -> Tensor", POINTWISE),
        ("exp(Tensor self) -> Tensor", POINTWISE),
        ("log(Tensor self) -> Tensor", POINTWISE),
        ("sqrt(Tensor self) -> Tensor", POINTWISE),
        ("abs(Tensor self) -> Tensor", POINTWISE),
        ("gelu(Tensor self) -> Tensor", POINTWISE),
        ("elu(Tensor self, float alpha=1.0) -> Tensor", POINTWISE),
        // In-place
        ("relu_(Tensor self) -> Tensor", INPLACE),
        ("elu_(Tensor self, float alpha=1.0) -> Tensor", INPLACE),
        ("add_.Tensor(Tensor self, Tensor other) -> Tensor", INPLACE),
        ("add_.Scalar(Tensor self, Scalar other) -> Tensor", INPLACE),
        ("mul_.Tensor(Tensor self, Tensor other) -> Tensor", INPLACE),
        ("mul_.Scalar(Tensor self, Scalar other) -> Tensor", INPLACE),
        ("fill_(Tensor self, Scalar value) -> Tensor", INPLACE),
        ("copy_(Tensor self, Tensor src) -> Tensor", INPLACE),
        // Reductions and linear algebra
        ("matmul(Tensor self, Tensor other) -> Tensor", PURE),
        ("sum(Tensor self) -> Tensor", PURE),
        ("sum.dim(Tensor self, int dim, bool keepdim=False) -> Tensor", PURE),
        ("mean(Tensor self) -> Tensor", PURE),
        ("max(Tensor self) -> Tensor", PURE),
        // Shapes and views
        ("reshape(Tensor self, int[] shape) -> Tensor", VIEW),
        ("view(Tensor self, int[] size) -> Tensor", VIEW),
        ("transpose(Tensor self, int dim0, int dim1) -> Tensor", VIEW),
        ("t(Tensor self) -> Tensor", VIEW),
        ("select(Tensor self, int dim, int index) -> Tensor", VIEW),
        ("unsqueeze(Tensor self, int dim) -> Tensor", VIEW),
        ("detach(Tensor self) -> Tensor", VIEW),
        ("clone(Tensor self) -> Tensor", PURE),
        ("size(Tensor self) -> int[]", PURE),
        ("size.int(Tensor self, int dim) -> int", PURE),
        ("dim(Tensor self) -> int", PURE),
        ("numel(Tensor self) -> int", PURE),
        ("item(Tensor self) -> Scalar", PURE),
        // Comparisons
        ("eq.Tensor(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("eq.Scalar(Tensor self, Scalar other) -> Tensor", POINTWISE),
        ("eq.int(int a, int b) -> bool", PURE),
        ("eq.float(float a, float b) -> bool", PURE),
        ("eq.bool(bool a, bool b) -> bool", PURE),
        ("eq.str(str a, str b) -> bool", PURE),
        ("ne.Tensor(Tensor self, Tensor other) -> Tensor", POINTWISE),
        ("ne.Scalar(Tensor self, Scalar other) -> Tensor", POINTWISE),
        ("ne.int(int a, int b) -> bool", PURE),
        ("ne.float(float a, float b) -> bool", PURE),
        ("ne.bool(bool a, bool b) -> bool", PURE),
        ("ne.str(str a, str b) -> bool", PURE),
    ];
    let mut sigs: Vec<(String, OpFlags)> = sigs.into_iter().map(|(s, f)| (s.to_string(), f)).collect();
    for op in ["lt", "le", "gt", "ge"] {
        sigs.push((format!("{op}.Tensor(Tensor self, Tensor other) -> Tensor"), POINTWISE));
        sigs.push((format!("{op}.Scalar(Tensor self, Scalar other) -> Tensor"), POINTWISE));
        sigs.push((format!("{op}.int(int a, int b) -> bool"), PURE));
        sigs.push((format!("{op}.float(float a, float b) -> bool"), PURE));
    }
    let rest: [(&str, OpFlags); 28] = [
        ("__not__(bool a) -> bool", PURE),
        ("__and__(bool a, bool b) -> bool", PURE),
        ("__or__(bool a, bool b) -> bool", PURE),
        // Creation
        ("zeros(int[] size) -> Tensor", PURE),
        ("ones(int[] size) -> Tensor", PURE),
        ("full(int[] size, Scalar fill_value) -> Tensor", PURE),
        ("arange(int end) -> Tensor", PURE),
        ("rand(int[] size) -> Tensor", EFFECT),
        ("tensor.int_list(int[] data) -> Tensor", PURE),
        ("tensor.float_list(float[] data) -> Tensor", PURE),
        ("tensor.float(float data) -> Tensor", PURE),
        ("scalar_tensor(Scalar s) -> Tensor", PURE),
        // Conversions
        ("Int.Tensor(Tensor a) -> int", PURE),
        ("Int.float(float a) -> int", PURE),
        ("Int.bool(bool a) -> int", PURE),
        ("Float.Tensor(Tensor a) -> float", PURE),
        ("Float.int(int a) -> float", PURE),
        ("Float.bool(bool a) -> float", PURE),
        ("Bool.Tensor(Tensor a) -> bool", PURE),
        ("Bool.int(int a) -> bool", PURE),
        ("Bool.float(float a) -> bool", PURE),
        ("str(Any a) -> str", PURE),
        // Containers and loop support
        ("len.Tensor(Tensor self) -> int", PURE),
        ("len.t(Any[] a) -> int", PURE),
        ("len.str(str s) -> int", PURE),
        ("__range_length(int lo, int hi, int step) -> int", PURE),
        ("__derive_index(int index, int start, int step) -> int", PURE),
        // Optional override of an integer list
        ("_test_optional_intlist(Tensor values, int[]? incr) -> Tensor", VIEW),
    ];
    sigs.extend(rest.into_iter().map(|(s, f)| (s.to_string(), f)));
    // Numbers of unknown kind, e.g. from `item()`. Declared last so int and
    // float operands keep their exact overloads.
    for op in ["add", "sub", "mul", "div", "floordiv", "remainder", "pow"] {
        sigs.push((format!("{op}.Scalar_Scalar(Scalar a, Scalar b) -> Scalar"), PURE));
    }
    for op in ["eq", "ne", "lt", "le", "gt", "ge"] {
        sigs.push((format!("{op}.Scalar_Scalar(Scalar a, Scalar b) -> bool"), PURE));
    }
    for sig in [
        "neg.Scalar(Scalar a) -> Scalar",
        "Int.Scalar(Scalar a) -> int",
        "Float.Scalar(Scalar a) -> float",
        "Bool.Scalar(Scalar a) -> bool",
    ] {
        sigs.push((sig.to_string(), PURE));
    }
    sigs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schema() {
        let s = FunctionSchema::parse("sum.dim(Tensor self, int dim, bool keepdim=False) -> Tensor")
            .unwrap();
        assert_eq!(s.qualified_name(), "sum.dim");
        assert_eq!(s.arguments.len(), 3);
        assert_eq!(s.arguments[2].default.as_ref().and_then(Constant::as_bool), Some(false));
        assert_eq!(
            s.to_string(),
            "sum.dim(Tensor self, int dim, bool keepdim=False) -> Tensor"
        );
    }

    #[test]
    fn test_parse_optional_list() {
        let s = FunctionSchema::parse("_test_optional_intlist(Tensor values, int[]? incr) -> Tensor")
            .unwrap();
        assert_eq!(s.arguments[1].ty.to_string(), "Optional[List[int]]");
    }

    #[test]
    fn test_bind_int_to_float() {
        let s = FunctionSchema::parse("elu(Tensor self, float alpha=1.0) -> Tensor").unwrap();
        assert!(s.bind(&[Type::tensor(), Type::Int], &[]).is_ok());
        let b = s.bind(&[Type::tensor()], &[]).unwrap();
        assert!(matches!(b[1], Binding::Default(Constant::Float(v)) if v == 1.0));
    }

    #[test]
    fn test_bind_rejects_float_list_for_int_list() {
        let s = FunctionSchema::parse("_test_optional_intlist(Tensor values, int[]? incr) -> Tensor")
            .unwrap();
        let err = s
            .bind(&[Type::tensor(), Type::list(Type::Float)], &[])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Expected a value of type 'Optional[List[int]]' for argument 'incr' but instead found type 'List[float]'."
        );
    }

    #[test]
    fn test_bind_keywords() {
        let s = FunctionSchema::parse("sum.dim(Tensor self, int dim, bool keepdim=False) -> Tensor")
            .unwrap();
        let b = s
            .bind(&[Type::tensor()], &[("dim".into(), Type::Int), ("keepdim".into(), Type::Bool)])
            .unwrap();
        assert!(matches!(b[1], Binding::Keyword(0)));
        let err = s.bind(&[Type::tensor(), Type::Int], &[("bogus".into(), Type::Int)]);
        assert_eq!(err.unwrap_err(), MatchFailure::UnknownKeyword("bogus".into()));
    }

    #[test]
    fn test_registry_overloads() {
        let reg = OperatorRegistry::builtin();
        let adds = reg.overloads("add");
        assert!(adds.len() >= 4);
        assert_eq!(adds[0].qualified_name(), "add.Tensor");
        assert!(reg.find("lt.int").is_some());
        assert!(reg.find("relu").unwrap().flags.pointwise);
        assert_eq!(reg.find("add_.Tensor").unwrap().flags.mutates, Some(0));
    }

    #[test]
    fn test_number_overloads_come_last() {
        let reg = OperatorRegistry::builtin();
        for op in ["add", "gt", "neg", "Float"] {
            let overloads = reg.overloads(op);
            let last = overloads.last().unwrap();
            assert!(last.overload.starts_with("Scalar"), "{}", last.qualified_name());
        }
        let gt = reg.find("gt.Scalar_Scalar").unwrap();
        assert_eq!(gt.returns, Type::Bool);
        assert_eq!(gt.arguments[0].ty, Type::Number);
    }
}
