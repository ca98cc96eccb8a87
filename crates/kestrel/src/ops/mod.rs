// Operators: eager calls and graph dispatch
//
// `call` is what host code uses to run a builtin by name. It picks the
// first overload whose signature accepts the runtime values, the same way
// the compiler picks one from static types, and reports a type error in
// the call style of the script language when none does.
//
// `dispatch` is the path taken by Op nodes: the overload is already fixed
// by the graph, so it only runs the kernel and lets the tracer see it.

mod kernels;

use std::sync::Arc;

use kestrel_ir::schema::MatchFailure;
use kestrel_ir::{FunctionSchema, OperatorRegistry};

use crate::error::{Error, Result};
use crate::tracer;
use crate::value::{bind_arguments, IValue};

pub use kernels::{div_legacy, run_op, scalar_tensor};

/// Run builtin `name` eagerly on host values.
///
/// ```ignore
/// let y = kestrel::ops::call("add", vec![x.into(), 2i64.into()], vec![])?;
/// ```
pub fn call(name: &str, args: Vec<IValue>, kwargs: Vec<(String, IValue)>) -> Result<IValue> {
    let overloads = OperatorRegistry::builtin().overloads(name);
    if overloads.is_empty() {
        return Err(Error::attribute(format!("unknown builtin operator '{name}'")));
    }
    let mut first_failure: Option<MatchFailure> = None;
    for schema in overloads {
        match bind_arguments(schema, args.clone(), kwargs.clone()) {
            Ok(bound) => return dispatch(schema, bound),
            Err(failure) => {
                // Overloads are tried in declaration order; the first
                // failure is the one that names the most general signature.
                first_failure.get_or_insert(failure);
            }
        }
    }
    Err(type_error(name, first_failure))
}

fn type_error(name: &str, failure: Option<MatchFailure>) -> Error {
    match failure {
        Some(MatchFailure::ArgumentType {
            name: arg,
            expected,
            found,
        }) => Error::Type(format!(
            "{name}(): argument '{arg}' must be {expected}, but found {found}"
        )),
        Some(other) => Error::Type(format!("{name}(): {other}")),
        None => Error::Type(format!("{name}(): no matching overload")),
    }
}

/// Run a schema-resolved operator on bound arguments.
pub(crate) fn dispatch(schema: &Arc<FunctionSchema>, args: Vec<IValue>) -> Result<IValue> {
    let output = run_op(schema, &args)?;
    tracer::record_op(schema, &args, &output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{DType, Tensor};

    #[test]
    fn test_call_picks_overload_from_values() {
        let r = call("add", vec![IValue::Int(2), IValue::Int(3)], vec![]).unwrap();
        assert_eq!(r.as_int(), Some(5));
        let x = Tensor::ones(2, DType::F32);
        let r = call("add", vec![x.into(), IValue::Float(0.5)], vec![]).unwrap();
        assert_eq!(r.as_tensor().unwrap().to_vec().unwrap(), vec![1.5, 1.5]);
    }

    #[test]
    fn test_call_with_keyword_default() {
        let x = Tensor::from_vec(vec![-1.0, 1.0], 2, DType::F32).unwrap();
        let r = call("elu", vec![x.into()], vec![("alpha".into(), IValue::Float(2.0))]).unwrap();
        let v = r.as_tensor().unwrap().to_vec().unwrap();
        assert!((v[0] - 2.0 * ((-1f64).exp() - 1.0)).abs() < 1e-6);
        assert_eq!(v[1], 1.0);
    }

    #[test]
    fn test_call_rejects_float_list() {
        let x = Tensor::from_vec(vec![1.0, 2.0], 2, DType::I64).unwrap();
        let err = call(
            "_test_optional_intlist",
            vec![x.into(), IValue::from(vec![1.0f64, 2.0])],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Type(_)));
        let msg = err.to_string();
        assert!(msg.contains("_test_optional_intlist"));
        assert!(msg.contains("incr"));
    }

    #[test]
    fn test_unknown_operator() {
        let err = call("no_such_op", vec![], vec![]).unwrap_err();
        assert!(matches!(err, Error::Attribute(_)));
    }
}
