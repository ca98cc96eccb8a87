// Runtime values
//
// IValue is what flows through the interpreter: scalars, strings, tensors,
// containers, module objects and futures. Tensors and objects are handles;
// cloning an IValue never copies tensor storage or object state.
//
// Objects are instances of a ClassType. Their attribute slots follow the
// order of the class's attribute list and are shared by every handle to the
// object, so a SetAttr through one handle is visible through all of them.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kestrel_core::{Device, Tensor};
use kestrel_ir::schema::MatchFailure;
use kestrel_ir::{ClassType, Constant, FunctionSchema, NamedTupleType, TensorType, Type};

use crate::error::{Error, Result};
use crate::fork::Future;

/// A value at runtime.
#[derive(Debug, Clone)]
pub enum IValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Device(Device),
    Tensor(Tensor),
    List(Vec<IValue>),
    Tuple(Vec<IValue>),
    NamedTuple(Arc<NamedTupleType>, Vec<IValue>),
    Object(Object),
    Future(Future),
}

impl IValue {
    /// Dynamic type of the value. Tensors report the unrefined `Tensor`
    /// type; lists report the unified type of their elements.
    pub fn type_of(&self) -> Type {
        match self {
            IValue::None => Type::NoneType,
            IValue::Bool(_) => Type::Bool,
            IValue::Int(_) => Type::Int,
            IValue::Float(_) => Type::Float,
            IValue::Str(_) => Type::Str,
            IValue::Device(_) => Type::Device,
            IValue::Tensor(_) => Type::tensor(),
            IValue::List(items) => {
                let types: Vec<Type> = items.iter().map(IValue::type_of).collect();
                Type::list(Type::unify_all(&types).unwrap_or(Type::Any))
            }
            IValue::Tuple(items) => Type::Tuple(items.iter().map(IValue::type_of).collect()),
            IValue::NamedTuple(nt, _) => Type::NamedTuple(nt.clone()),
            IValue::Object(o) => Type::Class(o.class().clone()),
            IValue::Future(f) => Type::future(f.peek().map_or(Type::Any, |v| v.type_of())),
        }
    }

    /// Whether the value is an instance of `ty`. Ints are accepted where a
    /// number is expected but not where a float is; see [`IValue::coerce`].
    pub fn matches(&self, ty: &Type) -> bool {
        match (self, ty) {
            (_, Type::Any) => true,
            (IValue::None, t) => t.may_be_none(),
            (v, Type::Optional(inner)) => v.matches(inner),
            (IValue::Bool(_), Type::Bool) => true,
            (IValue::Int(_), Type::Int | Type::Number) => true,
            (IValue::Float(_), Type::Float | Type::Number) => true,
            (IValue::Str(_), Type::Str) => true,
            (IValue::Device(_), Type::Device) => true,
            (IValue::Tensor(t), Type::Tensor(expected)) => TensorType::of(t).is_subtype_of(expected),
            (IValue::List(items), Type::List(elem)) => items.iter().all(|v| v.matches(elem)),
            (IValue::Tuple(items), Type::Tuple(types)) => {
                items.len() == types.len() && items.iter().zip(types).all(|(v, t)| v.matches(t))
            }
            (IValue::NamedTuple(nt, _), Type::NamedTuple(expected)) => nt.name == expected.name,
            (IValue::NamedTuple(_, items), Type::Tuple(types)) => {
                items.len() == types.len() && items.iter().zip(types).all(|(v, t)| v.matches(t))
            }
            (IValue::Object(o), Type::Class(c)) => o.class().name == c.name,
            (IValue::Future(_), Type::Future(_)) => true,
            _ => false,
        }
    }

    /// The value as an instance of `ty`, converting an int to a float where
    /// a float is expected. `None` if it does not fit.
    pub fn coerce(self, ty: &Type) -> Option<IValue> {
        if self.matches(ty) {
            return Some(self);
        }
        match (self, ty.unwrap_optional()) {
            (IValue::Int(n), Type::Float) => Some(IValue::Float(n as f64)),
            _ => None,
        }
    }

    pub fn from_constant(c: &Constant) -> IValue {
        match c {
            Constant::None => IValue::None,
            Constant::Bool(b) => IValue::Bool(*b),
            Constant::Int(n) => IValue::Int(*n),
            Constant::Float(v) => IValue::Float(*v),
            Constant::Str(s) => IValue::Str(s.clone()),
            Constant::IntList(v) => IValue::List(v.iter().map(|&n| IValue::Int(n)).collect()),
            Constant::FloatList(v) => IValue::List(v.iter().map(|&x| IValue::Float(x)).collect()),
            Constant::BoolList(v) => IValue::List(v.iter().map(|&b| IValue::Bool(b)).collect()),
            Constant::Tensor(t) => IValue::Tensor(t.clone()),
            Constant::Tuple(items) => IValue::Tuple(items.iter().map(IValue::from_constant).collect()),
        }
    }

    /// The value as a graph literal, if it has one. Lists must be
    /// homogeneous ints, floats or bools; an empty list becomes an int list.
    pub fn to_constant(&self) -> Option<Constant> {
        let c = match self {
            IValue::None => Constant::None,
            IValue::Bool(b) => Constant::Bool(*b),
            IValue::Int(n) => Constant::Int(*n),
            IValue::Float(v) => Constant::Float(*v),
            IValue::Str(s) => Constant::Str(s.clone()),
            IValue::Tensor(t) => Constant::Tensor(t.clone()),
            IValue::List(items) => list_constant(items)?,
            IValue::Tuple(items) => {
                Constant::Tuple(items.iter().map(IValue::to_constant).collect::<Option<_>>()?)
            }
            IValue::Device(_) | IValue::NamedTuple(..) | IValue::Object(_) | IValue::Future(_) => {
                return None
            }
        };
        Some(c)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, IValue::None)
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            IValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            IValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Floats, and ints widened to float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            IValue::Float(v) => Some(*v),
            IValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            IValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            IValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[IValue]> {
        match self {
            IValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Elements of a tuple or named tuple.
    pub fn as_tuple(&self) -> Option<&[IValue]> {
        match self {
            IValue::Tuple(items) | IValue::NamedTuple(_, items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            IValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_future(&self) -> Option<&Future> {
        match self {
            IValue::Future(f) => Some(f),
            _ => None,
        }
    }

    /// The tensor inside, or a runtime error naming what was found.
    pub fn to_tensor(&self) -> Result<Tensor> {
        self.as_tensor()
            .cloned()
            .ok_or_else(|| Error::runtime(format!("expected a Tensor but found {}", self.type_of())))
    }

    /// Every tensor reachable from this value, containers included.
    pub fn tensors(&self) -> Vec<Tensor> {
        let mut out = Vec::new();
        self.collect_tensors(&mut out);
        out
    }

    fn collect_tensors(&self, out: &mut Vec<Tensor>) {
        match self {
            IValue::Tensor(t) => out.push(t.clone()),
            IValue::List(items) | IValue::Tuple(items) | IValue::NamedTuple(_, items) => {
                for v in items {
                    v.collect_tensors(out);
                }
            }
            _ => {}
        }
    }
}

fn list_constant(items: &[IValue]) -> Option<Constant> {
    if items.iter().all(|v| matches!(v, IValue::Int(_))) {
        return Some(Constant::IntList(items.iter().filter_map(IValue::as_int).collect()));
    }
    if items.iter().all(|v| matches!(v, IValue::Float(_))) {
        return Some(Constant::FloatList(items.iter().filter_map(IValue::as_float).collect()));
    }
    if items.iter().all(|v| matches!(v, IValue::Bool(_))) {
        return Some(Constant::BoolList(items.iter().filter_map(IValue::as_bool).collect()));
    }
    None
}

impl From<Tensor> for IValue {
    fn from(t: Tensor) -> Self {
        IValue::Tensor(t)
    }
}

impl From<i64> for IValue {
    fn from(n: i64) -> Self {
        IValue::Int(n)
    }
}

impl From<f64> for IValue {
    fn from(v: f64) -> Self {
        IValue::Float(v)
    }
}

impl From<bool> for IValue {
    fn from(b: bool) -> Self {
        IValue::Bool(b)
    }
}

impl From<&str> for IValue {
    fn from(s: &str) -> Self {
        IValue::Str(s.to_string())
    }
}

impl From<String> for IValue {
    fn from(s: String) -> Self {
        IValue::Str(s)
    }
}

impl From<Device> for IValue {
    fn from(d: Device) -> Self {
        IValue::Device(d)
    }
}

impl From<Vec<i64>> for IValue {
    fn from(v: Vec<i64>) -> Self {
        IValue::List(v.into_iter().map(IValue::Int).collect())
    }
}

impl From<Vec<f64>> for IValue {
    fn from(v: Vec<f64>) -> Self {
        IValue::List(v.into_iter().map(IValue::Float).collect())
    }
}

impl From<Vec<IValue>> for IValue {
    fn from(v: Vec<IValue>) -> Self {
        IValue::List(v)
    }
}

impl<T: Into<IValue>> From<Option<T>> for IValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(IValue::None, Into::into)
    }
}

impl fmt::Display for IValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn seq(f: &mut fmt::Formatter<'_>, items: &[IValue], open: &str, close: &str) -> fmt::Result {
            write!(f, "{open}")?;
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{v}")?;
            }
            write!(f, "{close}")
        }
        match self {
            IValue::None => write!(f, "None"),
            IValue::Bool(true) => write!(f, "True"),
            IValue::Bool(false) => write!(f, "False"),
            IValue::Int(n) => write!(f, "{n}"),
            IValue::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            IValue::Float(v) => write!(f, "{v}"),
            IValue::Str(s) => write!(f, "{s}"),
            IValue::Device(d) => write!(f, "{d}"),
            IValue::Tensor(t) => write!(f, "{t}"),
            IValue::List(items) => seq(f, items, "[", "]"),
            IValue::Tuple(items) => seq(f, items, "(", ")"),
            IValue::NamedTuple(nt, items) => seq(f, items, &format!("{}(", nt.name), ")"),
            IValue::Object(o) => write!(f, "<{} object>", o.class().name),
            IValue::Future(_) => write!(f, "<Future>"),
        }
    }
}

// Argument binding

/// Match runtime arguments against `schema`, filling defaults and widening
/// ints passed for floats. Returns the full positional argument list.
pub fn bind_arguments(
    schema: &FunctionSchema,
    args: Vec<IValue>,
    kwargs: Vec<(String, IValue)>,
) -> std::result::Result<Vec<IValue>, MatchFailure> {
    let positional = schema.arguments.iter().filter(|a| !a.kwarg_only).count();
    if args.len() > positional {
        return Err(MatchFailure::TooManyArguments {
            expected: positional,
            found: args.len(),
        });
    }
    for (name, _) in &kwargs {
        match schema.argument_index(name) {
            None => return Err(MatchFailure::UnknownKeyword(name.clone())),
            Some(i) if i < args.len() => return Err(MatchFailure::DuplicateArgument(name.clone())),
            Some(_) => {}
        }
    }
    let mut args = args.into_iter();
    let mut kwargs: Vec<Option<(String, IValue)>> = kwargs.into_iter().map(Some).collect();
    let mut bound = Vec::with_capacity(schema.arguments.len());
    for param in &schema.arguments {
        let supplied = match args.next() {
            Some(v) => Some(v),
            None => kwargs
                .iter_mut()
                .find(|kw| kw.as_ref().is_some_and(|(n, _)| *n == param.name))
                .and_then(Option::take)
                .map(|(_, v)| v),
        };
        let value = match (supplied, &param.default) {
            (Some(v), _) => {
                let found = v.type_of();
                v.coerce(&param.ty).ok_or_else(|| MatchFailure::ArgumentType {
                    name: param.name.clone(),
                    expected: param.ty.clone(),
                    found,
                })?
            }
            (None, Some(d)) => IValue::from_constant(d),
            (None, None) => return Err(MatchFailure::MissingArgument(param.name.clone())),
        };
        bound.push(value);
    }
    Ok(bound)
}

// Objects

struct ObjectInner {
    class: Arc<ClassType>,
    slots: RwLock<Vec<IValue>>,
}

/// Handle to an instance of a user class.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({} @ {:#x})", self.inner.class.name, self.id())
    }
}

impl Object {
    /// A new instance with every attribute set to None.
    pub fn new(class: Arc<ClassType>) -> Self {
        let slots = vec![IValue::None; class.attributes.len()];
        Self::with_slots(class, slots)
    }

    pub fn with_slots(class: Arc<ClassType>, slots: Vec<IValue>) -> Self {
        Object {
            inner: Arc::new(ObjectInner {
                class,
                slots: RwLock::new(slots),
            }),
        }
    }

    pub fn class(&self) -> &Arc<ClassType> {
        &self.inner.class
    }

    /// Identity of the instance.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn same_object(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<IValue>>> {
        self.inner
            .slots
            .read()
            .map_err(|_| Error::runtime("object state lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<IValue>>> {
        self.inner
            .slots
            .write()
            .map_err(|_| Error::runtime("object state lock poisoned"))
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.inner.class.attribute_index(name).ok_or_else(|| {
            Error::attribute(format!(
                "'{}' object has no attribute '{name}'",
                self.inner.class.name
            ))
        })
    }

    pub fn get(&self, name: &str) -> Result<IValue> {
        let i = self.index_of(name)?;
        Ok(self.read()?[i].clone())
    }

    pub fn set(&self, name: &str, value: IValue) -> Result<()> {
        let i = self.index_of(name)?;
        self.write()?[i] = value;
        Ok(())
    }

    /// Snapshot of all slots in attribute order.
    pub fn slots(&self) -> Result<Vec<IValue>> {
        Ok(self.read()?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::DType;
    use kestrel_ir::schema::Argument;

    fn schema() -> FunctionSchema {
        FunctionSchema::new(
            "f",
            vec![
                Argument {
                    name: "x".into(),
                    ty: Type::Float,
                    default: None,
                    kwarg_only: false,
                },
                Argument {
                    name: "incr".into(),
                    ty: Type::optional(Type::list(Type::Int)),
                    default: Some(Constant::None),
                    kwarg_only: false,
                },
            ],
            Type::Float,
        )
    }

    #[test]
    fn test_int_widens_to_float() {
        let bound = bind_arguments(&schema(), vec![IValue::Int(2)], vec![]).unwrap();
        assert!(matches!(bound[0], IValue::Float(v) if v == 2.0));
        assert!(bound[1].is_none());
    }

    #[test]
    fn test_float_list_rejected_for_int_list() {
        let err = bind_arguments(
            &schema(),
            vec![IValue::Float(1.0), IValue::from(vec![1.5, 2.0])],
            vec![],
        )
        .unwrap_err();
        assert!(err.to_string().contains("for argument 'incr'"));
        assert!(err.to_string().contains("List[float]"));
    }

    #[test]
    fn test_keyword_binding() {
        let bound = bind_arguments(
            &schema(),
            vec![IValue::Float(1.0)],
            vec![("incr".into(), IValue::from(vec![1i64, 2]))],
        )
        .unwrap();
        assert_eq!(bound[1].as_list().unwrap().len(), 2);
        let err = bind_arguments(&schema(), vec![IValue::Float(1.0)], vec![("nope".into(), IValue::None)])
            .unwrap_err();
        assert_eq!(err, MatchFailure::UnknownKeyword("nope".into()));
    }

    #[test]
    fn test_tensor_matches_refined_type() {
        let t = Tensor::zeros((2, 3), DType::F32);
        let v = IValue::Tensor(t);
        assert!(v.matches(&Type::tensor()));
        assert!(!v.matches(&Type::list(Type::Int)));
        let wrong = Type::Tensor(TensorType {
            dtype: Some(DType::I64),
            ..TensorType::default()
        });
        assert!(!v.matches(&wrong));
    }

    #[test]
    fn test_object_slots_are_shared() {
        let mut class = ClassType::new("Counter");
        class.attributes.push(kestrel_ir::types::ClassAttribute {
            name: "n".into(),
            ty: Type::Int,
            kind: kestrel_ir::AttributeKind::Attribute,
        });
        let a = Object::new(Arc::new(class));
        let b = a.clone();
        a.set("n", IValue::Int(3)).unwrap();
        assert_eq!(b.get("n").unwrap().as_int(), Some(3));
        assert!(a.same_object(&b));
        assert!(matches!(a.get("missing"), Err(Error::Attribute(_))));
    }

    #[test]
    fn test_display_is_script_like() {
        let v = IValue::Tuple(vec![IValue::Bool(true), IValue::Float(2.0), IValue::None]);
        assert_eq!(v.to_string(), "(True, 2.0, None)");
    }
}
