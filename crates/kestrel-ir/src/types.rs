// Types: the static type system of compiled code
//
// Every IR value carries one of these types. The lattice:
//
//                         Any
//          ┌───────┬───────┼────────┬─────────┬──────────┐
//       Tensor   number   str   Optional[T]  List[T]  Tuple[..] ...
//                 ┌─┴─┐              │
//                int float       T, NoneType
//
//   - Tensor may be refined with dtype / sizes / device / requires_grad.
//     A refined tensor type is a subtype of any less refined one.
//   - Optional[T] admits T and NoneType.
//   - List, Tuple and Future are covariant in their element types.
//   - NamedTuple types have an explicit field schema and are subtypes of the
//     plain tuple of their field types.
//   - Class types are nominal: equal names, equal types.
//
// `unify` computes the type a variable must have after control flow merges
// two definitions. It is total and deterministic: it either finds the least
// common supertype from the rules below or fails (no silent fallback to Any).

use std::fmt;
use std::sync::Arc;

use kestrel_core::{DType, Device, Tensor};

use crate::ast::TypeExpr;
use crate::error::{Error, ErrorKind, Result};

/// Optional refinement of a tensor type. `None` fields mean "unknown".
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct TensorType {
    pub dtype: Option<DType>,
    /// Known rank with per-dimension sizes (each possibly unknown).
    pub sizes: Option<Vec<Option<usize>>>,
    pub device: Option<Device>,
    pub requires_grad: Option<bool>,
}

impl TensorType {
    /// Fully refined type of a concrete tensor.
    pub fn of(t: &Tensor) -> Self {
        TensorType {
            dtype: Some(t.dtype()),
            sizes: Some(t.dims().iter().map(|&d| Some(d)).collect()),
            device: Some(t.device()),
            requires_grad: Some(t.requires_grad()),
        }
    }

    pub fn is_refined(&self) -> bool {
        self.dtype.is_some()
            || self.sizes.is_some()
            || self.device.is_some()
            || self.requires_grad.is_some()
    }

    pub fn rank(&self) -> Option<usize> {
        self.sizes.as_ref().map(Vec::len)
    }

    /// All sizes known.
    pub fn concrete_sizes(&self) -> Option<Vec<usize>> {
        self.sizes.as_ref()?.iter().copied().collect()
    }

    /// Every field known in `other` is known and equal here.
    pub fn is_subtype_of(&self, other: &TensorType) -> bool {
        fn field<T: PartialEq>(mine: &Option<T>, theirs: &Option<T>) -> bool {
            match theirs {
                None => true,
                Some(t) => mine.as_ref() == Some(t),
            }
        }
        let sizes_ok = match (&self.sizes, &other.sizes) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| y.is_none() || x == y)
            }
        };
        field(&self.dtype, &other.dtype)
            && sizes_ok
            && field(&self.device, &other.device)
            && field(&self.requires_grad, &other.requires_grad)
    }

    /// Least refinement covering both.
    pub fn merge(&self, other: &TensorType) -> TensorType {
        fn keep<T: PartialEq + Clone>(a: &Option<T>, b: &Option<T>) -> Option<T> {
            if a == b {
                a.clone()
            } else {
                None
            }
        }
        let sizes = match (&self.sizes, &other.sizes) {
            (Some(a), Some(b)) if a.len() == b.len() => Some(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| if x == y { *x } else { None })
                    .collect(),
            ),
            _ => None,
        };
        TensorType {
            dtype: keep(&self.dtype, &other.dtype),
            sizes,
            device: keep(&self.device, &other.device),
            requires_grad: keep(&self.requires_grad, &other.requires_grad),
        }
    }
}

/// A named tuple with an explicit field schema.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTupleType {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

impl NamedTupleType {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    pub fn field_types(&self) -> Vec<Type> {
        self.fields.iter().map(|(_, t)| t.clone()).collect()
    }
}

/// How a class attribute participates in module state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Parameter,
    Buffer,
    Attribute,
    Module,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassAttribute {
    pub name: String,
    pub ty: Type,
    pub kind: AttributeKind,
}

/// A user class: ordered attribute slots plus method names. Methods live in
/// the compilation unit under `Class.method`.
#[derive(Debug, Clone)]
pub struct ClassType {
    pub name: String,
    pub attributes: Vec<ClassAttribute>,
    pub methods: Vec<String>,
}

impl ClassType {
    pub fn new(name: impl Into<String>) -> Self {
        ClassType {
            name: name.into(),
            attributes: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&ClassAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m == name)
    }

    /// Qualified name of a method in the compilation unit.
    pub fn method_qualname(&self, method: &str) -> String {
        format!("{}.{}", self.name, method)
    }
}

// Classes are nominal.
impl PartialEq for ClassType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Static type of an IR value.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Tensor(TensorType),
    Int,
    Float,
    Bool,
    Str,
    NoneType,
    Number,
    Device,
    Any,
    Optional(Box<Type>),
    List(Box<Type>),
    Tuple(Vec<Type>),
    NamedTuple(Arc<NamedTupleType>),
    Future(Box<Type>),
    Class(Arc<ClassType>),
}

impl Type {
    /// Unrefined tensor type.
    pub fn tensor() -> Type {
        Type::Tensor(TensorType::default())
    }

    pub fn optional(inner: Type) -> Type {
        match inner {
            Type::Optional(_) | Type::NoneType | Type::Any => inner,
            other => Type::Optional(Box::new(other)),
        }
    }

    pub fn list(elem: Type) -> Type {
        Type::List(Box::new(elem))
    }

    pub fn future(elem: Type) -> Type {
        Type::Future(Box::new(elem))
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, Type::Tensor(_))
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, Type::Optional(_))
    }

    /// Whether a value of this type may be None at runtime.
    pub fn may_be_none(&self) -> bool {
        matches!(self, Type::Optional(_) | Type::NoneType | Type::Any)
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            Type::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&Arc<ClassType>> {
        match self {
            Type::Class(c) => Some(c),
            _ => None,
        }
    }

    /// The `T` of `Optional[T]`; other types return themselves.
    pub fn unwrap_optional(&self) -> &Type {
        match self {
            Type::Optional(inner) => inner,
            other => other,
        }
    }

    /// Element type of a list.
    pub fn element_type(&self) -> Option<&Type> {
        match self {
            Type::List(e) => Some(e),
            _ => None,
        }
    }

    /// Element types of a tuple or named tuple.
    pub fn tuple_elements(&self) -> Option<Vec<Type>> {
        match self {
            Type::Tuple(items) => Some(items.clone()),
            Type::NamedTuple(nt) => Some(nt.field_types()),
            _ => None,
        }
    }

    /// Whether any tensor appears in this type.
    pub fn contains_tensor(&self) -> bool {
        match self {
            Type::Tensor(_) => true,
            Type::Optional(t) | Type::List(t) | Type::Future(t) => t.contains_tensor(),
            Type::Tuple(items) => items.iter().any(Type::contains_tensor),
            Type::NamedTuple(nt) => nt.fields.iter().any(|(_, t)| t.contains_tensor()),
            _ => false,
        }
    }

    /// Drop tensor refinements everywhere in this type.
    pub fn erase_refinements(&self) -> Type {
        match self {
            Type::Tensor(_) => Type::tensor(),
            Type::Optional(t) => Type::Optional(Box::new(t.erase_refinements())),
            Type::List(t) => Type::list(t.erase_refinements()),
            Type::Future(t) => Type::future(t.erase_refinements()),
            Type::Tuple(items) => Type::Tuple(items.iter().map(Type::erase_refinements).collect()),
            other => other.clone(),
        }
    }

    /// Subtyping: can a value of `self` flow where `other` is expected?
    pub fn is_subtype_of(&self, other: &Type) -> bool {
        match (self, other) {
            (_, Type::Any) => true,
            (Type::Tensor(a), Type::Tensor(b)) => a.is_subtype_of(b),
            (Type::Int, Type::Number) | (Type::Float, Type::Number) => true,
            (Type::NoneType, Type::Optional(_)) => true,
            (Type::Optional(a), Type::Optional(b)) => a.is_subtype_of(b),
            (a, Type::Optional(b)) => a.is_subtype_of(b),
            (Type::List(a), Type::List(b)) => a.is_subtype_of(b),
            (Type::Future(a), Type::Future(b)) => a.is_subtype_of(b),
            (Type::Tuple(a), Type::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_subtype_of(y))
            }
            (Type::NamedTuple(a), Type::NamedTuple(b)) => a == b,
            (Type::NamedTuple(a), Type::Tuple(b)) => {
                a.fields.len() == b.len()
                    && a.fields.iter().zip(b).all(|((_, x), y)| x.is_subtype_of(y))
            }
            (Type::Class(a), Type::Class(b)) => a.name == b.name,
            (a, b) => a == b,
        }
    }

    /// Least common supertype of two types, if one exists.
    pub fn unify(a: &Type, b: &Type) -> Option<Type> {
        if a.is_subtype_of(b) {
            return Some(b.clone());
        }
        if b.is_subtype_of(a) {
            return Some(a.clone());
        }
        match (a, b) {
            (Type::Tensor(x), Type::Tensor(y)) => Some(Type::Tensor(x.merge(y))),
            (Type::Int, Type::Float) | (Type::Float, Type::Int) => Some(Type::Number),
            (Type::NoneType, other) | (other, Type::NoneType) => Some(Type::optional(other.clone())),
            (Type::Optional(x), Type::Optional(y)) => {
                Type::unify(x, y).map(Type::optional)
            }
            (Type::Optional(x), other) | (other, Type::Optional(x)) => {
                Type::unify(x, other).map(Type::optional)
            }
            (Type::List(x), Type::List(y)) => Type::unify(x, y).map(Type::list),
            (Type::Future(x), Type::Future(y)) => Type::unify(x, y).map(Type::future),
            (Type::Tuple(x), Type::Tuple(y)) if x.len() == y.len() => x
                .iter()
                .zip(y)
                .map(|(p, q)| Type::unify(p, q))
                .collect::<Option<Vec<_>>>()
                .map(Type::Tuple),
            _ => None,
        }
    }

    /// Fold `unify` over a non-empty sequence.
    pub fn unify_all<'a>(types: impl IntoIterator<Item = &'a Type>) -> Option<Type> {
        let mut iter = types.into_iter();
        let first = iter.next()?.clone();
        iter.try_fold(first, |acc, t| Type::unify(&acc, t))
    }

    /// Resolve a syntactic annotation. `lookup` resolves user class and
    /// named-tuple names.
    pub fn from_type_expr(expr: &TypeExpr, lookup: &dyn Fn(&str) -> Option<Type>) -> Result<Type> {
        let arity = |n: usize| -> Result<()> {
            if expr.args.len() == n {
                Ok(())
            } else {
                Err(Error::type_error(
                    format!(
                        "type '{}' expects {} type argument(s), got {}",
                        expr.name,
                        n,
                        expr.args.len()
                    ),
                    expr.span,
                ))
            }
        };
        let resolve = |e: &TypeExpr| Type::from_type_expr(e, lookup);
        let ty = match expr.name.as_str() {
            "Tensor" => Type::tensor(),
            "int" => Type::Int,
            "float" => Type::Float,
            "bool" => Type::Bool,
            "str" => Type::Str,
            "None" | "NoneType" => Type::NoneType,
            "number" => Type::Number,
            "Device" => Type::Device,
            "Any" => Type::Any,
            "Optional" => {
                arity(1)?;
                Type::optional(resolve(&expr.args[0])?)
            }
            "List" => {
                arity(1)?;
                Type::list(resolve(&expr.args[0])?)
            }
            "Future" => {
                arity(1)?;
                Type::future(resolve(&expr.args[0])?)
            }
            "Tuple" => Type::Tuple(expr.args.iter().map(resolve).collect::<Result<_>>()?),
            other => {
                if !expr.args.is_empty() {
                    return Err(Error::type_error(
                        format!("type '{other}' does not take type arguments"),
                        expr.span,
                    ));
                }
                lookup(other).ok_or_else(|| {
                    Error::new(
                        ErrorKind::UndefinedName(format!("unknown type name '{other}'")),
                        expr.span,
                    )
                })?
            }
        };
        Ok(ty)
    }

    /// Parse and resolve a type string such as `Optional[List[int]]`.
    pub fn parse(text: &str, lookup: &dyn Fn(&str) -> Option<Type>) -> Result<Type> {
        let expr = crate::parser::parse_type_str(text)?;
        Type::from_type_expr(&expr, lookup)
    }

    /// Parse a type string with only builtin names.
    pub fn parse_builtin(text: &str) -> Result<Type> {
        Type::parse(text, &|_| None)
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor")?;
        if !self.is_refined() {
            return Ok(());
        }
        let mut parts = Vec::new();
        if let Some(d) = self.dtype {
            parts.push(format!("dtype={d}"));
        }
        if let Some(sizes) = &self.sizes {
            let dims: Vec<String> = sizes
                .iter()
                .map(|s| s.map_or("*".to_string(), |v| v.to_string()))
                .collect();
            parts.push(format!("sizes=[{}]", dims.join(", ")));
        }
        if let Some(d) = self.device {
            parts.push(format!("device={d}"));
        }
        if let Some(r) = self.requires_grad {
            parts.push(format!("requires_grad={r}"));
        }
        write!(f, "({})", parts.join(", "))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Tensor(t) => write!(f, "{t}"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Bool => write!(f, "bool"),
            Type::Str => write!(f, "str"),
            Type::NoneType => write!(f, "NoneType"),
            Type::Number => write!(f, "number"),
            Type::Device => write!(f, "Device"),
            Type::Any => write!(f, "Any"),
            Type::Optional(t) => write!(f, "Optional[{t}]"),
            Type::List(t) => write!(f, "List[{t}]"),
            Type::Future(t) => write!(f, "Future[{t}]"),
            Type::Tuple(items) => {
                if items.is_empty() {
                    return write!(f, "Tuple[()]");
                }
                let parts: Vec<String> = items.iter().map(|t| t.to_string()).collect();
                write!(f, "Tuple[{}]", parts.join(", "))
            }
            Type::NamedTuple(nt) => write!(f, "{}", nt.name),
            Type::Class(c) => write!(f, "{}", c.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(s: &str) -> Type {
        Type::parse_builtin(s).unwrap()
    }

    #[test]
    fn test_subtyping_rules() {
        assert!(Type::Int.is_subtype_of(&Type::Number));
        assert!(Type::NoneType.is_subtype_of(&ty("Optional[int]")));
        assert!(Type::Int.is_subtype_of(&ty("Optional[int]")));
        assert!(ty("List[int]").is_subtype_of(&ty("List[number]")));
        assert!(!ty("List[float]").is_subtype_of(&ty("List[int]")));
        assert!(ty("Tuple[int, Tensor]").is_subtype_of(&ty("Tuple[number, Any]")));
        assert!(ty("Tensor").is_subtype_of(&Type::Any));
    }

    #[test]
    fn test_refined_tensor_is_subtype() {
        let refined = Type::Tensor(TensorType {
            dtype: Some(DType::F32),
            sizes: Some(vec![Some(2), Some(3)]),
            ..Default::default()
        });
        assert!(refined.is_subtype_of(&Type::tensor()));
        assert!(!Type::tensor().is_subtype_of(&refined));
    }

    #[test]
    fn test_unify() {
        assert_eq!(Type::unify(&Type::Int, &Type::Int), Some(Type::Int));
        assert_eq!(
            Type::unify(&Type::NoneType, &Type::tensor()),
            Some(ty("Optional[Tensor]"))
        );
        assert_eq!(Type::unify(&Type::Int, &Type::Float), Some(Type::Number));
        assert_eq!(Type::unify(&Type::tensor(), &ty("Tuple[int]")), None);
        assert_eq!(
            Type::unify(&ty("Optional[int]"), &Type::NoneType),
            Some(ty("Optional[int]"))
        );
    }

    #[test]
    fn test_unify_merges_refinements() {
        let a = Type::Tensor(TensorType {
            dtype: Some(DType::F32),
            sizes: Some(vec![Some(2)]),
            ..Default::default()
        });
        let b = Type::Tensor(TensorType {
            dtype: Some(DType::F32),
            sizes: Some(vec![Some(3)]),
            ..Default::default()
        });
        let Some(Type::Tensor(u)) = Type::unify(&a, &b) else {
            panic!("expected tensor");
        };
        assert_eq!(u.dtype, Some(DType::F32));
        assert_eq!(u.sizes, Some(vec![None]));
    }

    #[test]
    fn test_display() {
        assert_eq!(ty("Optional[List[int]]").to_string(), "Optional[List[int]]");
        assert_eq!(ty("Tuple[Tensor, float]").to_string(), "Tuple[Tensor, float]");
    }

    #[test]
    fn test_unknown_type_name() {
        let err = Type::parse_builtin("Frobnicator").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UndefinedName(_)));
    }
}
