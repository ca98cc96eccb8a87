// Kernels: the implementation behind every builtin operator schema
//
// Operators on ints, floats, bools and strings go through the same scalar
// evaluator that constant propagation uses, so folding and execution always
// agree. Everything that touches a tensor is dispatched here by schema
// name to a kestrel-core kernel.
//
// Creation defaults: float-producing builtins make f32 tensors, integer
// ones make i64 tensors.

use kestrel_core::{DType, Error as CoreError, Result as CoreResult, Scalar, Tensor};
use kestrel_ir::scalar::eval_scalar;
use kestrel_ir::FunctionSchema;

use crate::error::{Error, Result};
use crate::value::IValue;

/// Execute the operator `schema` on already bound arguments.
pub fn run_op(schema: &FunctionSchema, args: &[IValue]) -> Result<IValue> {
    if let Some(result) = run_scalar(&schema.name, args) {
        return result.map_err(|msg| Error::op(schema.qualified_name(), CoreError::Msg(msg)));
    }
    run_kernel(schema, args).map_err(|e| Error::op(schema.qualified_name(), e))
}

fn run_scalar(name: &str, args: &[IValue]) -> Option<std::result::Result<IValue, String>> {
    if args.iter().any(|a| !a.tensors().is_empty()) {
        return None;
    }
    let consts = args.iter().map(IValue::to_constant).collect::<Option<Vec<_>>>()?;
    eval_scalar(name, &consts).map(|r| r.map(|c| IValue::from_constant(&c)))
}

// Argument accessors

fn arg(args: &[IValue], i: usize) -> CoreResult<&IValue> {
    args.get(i)
        .ok_or_else(|| CoreError::msg(format!("missing argument {i}")))
}

fn tensor(args: &[IValue], i: usize) -> CoreResult<&Tensor> {
    match arg(args, i)? {
        IValue::Tensor(t) => Ok(t),
        other => Err(CoreError::msg(format!(
            "argument {i} must be a Tensor, found {}",
            other.type_of()
        ))),
    }
}

fn scalar(args: &[IValue], i: usize) -> CoreResult<Scalar> {
    match arg(args, i)? {
        IValue::Int(n) => Ok(Scalar::Int(*n)),
        IValue::Float(v) => Ok(Scalar::Float(*v)),
        IValue::Bool(b) => Ok(Scalar::Bool(*b)),
        other => Err(CoreError::msg(format!(
            "argument {i} must be a number, found {}",
            other.type_of()
        ))),
    }
}

fn int(args: &[IValue], i: usize) -> CoreResult<i64> {
    arg(args, i)?
        .as_int()
        .ok_or_else(|| CoreError::msg(format!("argument {i} must be an int")))
}

fn float(args: &[IValue], i: usize) -> CoreResult<f64> {
    arg(args, i)?
        .as_float()
        .ok_or_else(|| CoreError::msg(format!("argument {i} must be a float")))
}

fn boolean(args: &[IValue], i: usize) -> CoreResult<bool> {
    arg(args, i)?
        .as_bool()
        .ok_or_else(|| CoreError::msg(format!("argument {i} must be a bool")))
}

fn int_list(args: &[IValue], i: usize) -> CoreResult<Vec<i64>> {
    let items = arg(args, i)?
        .as_list()
        .ok_or_else(|| CoreError::msg(format!("argument {i} must be a list of ints")))?;
    items
        .iter()
        .map(|v| {
            v.as_int()
                .ok_or_else(|| CoreError::msg(format!("argument {i} must be a list of ints")))
        })
        .collect()
}

fn float_list(args: &[IValue], i: usize) -> CoreResult<Vec<f64>> {
    let items = arg(args, i)?
        .as_list()
        .ok_or_else(|| CoreError::msg(format!("argument {i} must be a list of floats")))?;
    items
        .iter()
        .map(|v| {
            v.as_float()
                .ok_or_else(|| CoreError::msg(format!("argument {i} must be a list of floats")))
        })
        .collect()
}

fn sizes(list: &[i64]) -> CoreResult<Vec<usize>> {
    list.iter()
        .map(|&d| {
            usize::try_from(d).map_err(|_| CoreError::msg(format!("negative dimension {d}")))
        })
        .collect()
}

/// 0-dim tensor for a scalar operand meeting a tensor of dtype `like`.
pub fn scalar_tensor(s: Scalar, like: DType) -> Tensor {
    Tensor::scalar(s.to_f64(), s.result_dtype(like))
}

fn scalar_dtype(s: Scalar) -> DType {
    match s {
        Scalar::Bool(_) => DType::Bool,
        Scalar::Int(_) => DType::I64,
        Scalar::Float(_) => DType::F32,
    }
}

/// Second operand of a Tensor/Scalar overload as a tensor.
fn other(args: &[IValue], lhs: &Tensor) -> CoreResult<Tensor> {
    match arg(args, 1)? {
        IValue::Tensor(t) => Ok(t.clone()),
        _ => Ok(scalar_tensor(scalar(args, 1)?, lhs.dtype())),
    }
}

/// Division as archives older than the div upgrade meant it: integer
/// tensors divide with floor semantics.
pub fn div_legacy(a: &Tensor, b: &Tensor) -> CoreResult<Tensor> {
    if a.dtype().is_integral() && b.dtype().is_integral() {
        a.floor_div(b)
    } else {
        a.div(b)
    }
}

fn item(t: &Tensor) -> CoreResult<IValue> {
    let v = t.item()?;
    Ok(if t.dtype().is_integral() || t.dtype() == DType::Bool {
        IValue::Int(v as i64)
    } else {
        IValue::Float(v)
    })
}

fn run_kernel(schema: &FunctionSchema, args: &[IValue]) -> CoreResult<IValue> {
    let name = schema.name.as_str();
    let out = match name {
        // Binary arithmetic
        "add" | "sub" | "mul" | "div" if !matches!(arg(args, 1)?, IValue::Tensor(_)) => {
            let (a, s) = (tensor(args, 0)?, scalar(args, 1)?);
            match name {
                "add" => a.add_scalar(s)?,
                "sub" => a.sub_scalar(s)?,
                "mul" => a.mul_scalar(s)?,
                _ => a.div_scalar(s)?,
            }
        }
        "add" | "sub" | "mul" | "div" | "floordiv" | "remainder" | "_div_legacy" | "maximum"
        | "minimum" | "eq" | "ne" | "lt" | "le" | "gt" | "ge" => {
            let a = tensor(args, 0)?;
            let b = other(args, a)?;
            match name {
                "add" => a.add(&b)?,
                "sub" => a.sub(&b)?,
                "mul" => a.mul(&b)?,
                "div" => a.div(&b)?,
                "floordiv" => a.floor_div(&b)?,
                "remainder" => a.remainder(&b)?,
                "_div_legacy" => div_legacy(a, &b)?,
                "maximum" => a.maximum(&b)?,
                "minimum" => a.minimum(&b)?,
                "eq" => a.eq(&b)?,
                "ne" => a.ne(&b)?,
                "lt" => a.lt(&b)?,
                "le" => a.le(&b)?,
                "gt" => a.gt(&b)?,
                _ => a.ge(&b)?,
            }
        }
        "rsub" => tensor(args, 0)?.rsub_scalar(scalar(args, 1)?)?,
        "pow" => tensor(args, 0)?.pow(scalar(args, 1)?)?,

        // Unary
        "neg" => tensor(args, 0)?.neg()?,
        "relu" => tensor(args, 0)?.relu()?,
        "sigmoid" => tensor(args, 0)?.sigmoid()?,
        "tanh" => tensor(args, 0)?.tanh()?,
        "exp" => tensor(args, 0)?.exp()?,
        "log" => tensor(args, 0)?.log()?,
        "sqrt" => tensor(args, 0)?.sqrt()?,
        "abs" => tensor(args, 0)?.abs()?,
        "gelu" => tensor(args, 0)?.gelu()?,
        "elu" => tensor(args, 0)?.elu(float(args, 1)?)?,

        // In place: the result is the input handle
        "relu_" | "elu_" | "add_" | "mul_" | "fill_" | "copy_" => {
            let a = tensor(args, 0)?;
            match name {
                "relu_" => a.relu_()?,
                "elu_" => a.elu_(float(args, 1)?)?,
                "add_" => a.add_(&other(args, a)?)?,
                "mul_" => a.mul_(&other(args, a)?)?,
                "fill_" => a.fill_(scalar(args, 1)?)?,
                _ => a.copy_(tensor(args, 1)?)?,
            }
            a.clone()
        }

        // Reductions and linear algebra
        "matmul" => tensor(args, 0)?.matmul(tensor(args, 1)?)?,
        "sum" if schema.overload == "dim" => {
            tensor(args, 0)?.sum_dim(int(args, 1)?, boolean(args, 2)?)?
        }
        "sum" => tensor(args, 0)?.sum_all()?,
        "mean" => tensor(args, 0)?.mean_all()?,
        "max" => tensor(args, 0)?.max_all()?,

        // Shapes and views
        "reshape" => tensor(args, 0)?.reshape(&int_list(args, 1)?)?,
        "view" => tensor(args, 0)?.view(&int_list(args, 1)?)?,
        "transpose" => tensor(args, 0)?.transpose(int(args, 1)?, int(args, 2)?)?,
        "t" => tensor(args, 0)?.t()?,
        "select" => tensor(args, 0)?.select(int(args, 1)?, int(args, 2)?)?,
        "unsqueeze" => tensor(args, 0)?.unsqueeze(int(args, 1)?)?,
        "detach" => tensor(args, 0)?.detach(),
        "clone" => tensor(args, 0)?.deep_clone()?,
        "size" if schema.overload == "int" => {
            let t = tensor(args, 0)?;
            let d = t.shape().normalize_dim(int(args, 1)?)?;
            return Ok(IValue::Int(t.dims()[d] as i64));
        }
        "size" => {
            let dims = tensor(args, 0)?.dims().iter().map(|&d| d as i64).collect::<Vec<_>>();
            return Ok(IValue::from(dims));
        }
        "dim" => return Ok(IValue::Int(tensor(args, 0)?.rank() as i64)),
        "numel" => return Ok(IValue::Int(tensor(args, 0)?.elem_count() as i64)),
        "item" => return item(tensor(args, 0)?),

        // Creation
        "zeros" => Tensor::zeros(sizes(&int_list(args, 0)?)?, DType::F32),
        "ones" => Tensor::ones(sizes(&int_list(args, 0)?)?, DType::F32),
        "full" => {
            let fill = scalar(args, 1)?;
            Tensor::full(sizes(&int_list(args, 0)?)?, fill.to_f64(), scalar_dtype(fill))
        }
        "arange" => {
            let end = int(args, 0)?;
            let n = usize::try_from(end).unwrap_or(0);
            Tensor::arange(n, DType::I64)
        }
        "rand" => Tensor::rand(sizes(&int_list(args, 0)?)?, DType::F32),
        "tensor" => match schema.overload.as_str() {
            "int_list" => {
                let data = int_list(args, 0)?;
                let n = data.len();
                Tensor::from_vec(data.into_iter().map(|v| v as f64).collect(), n, DType::I64)?
            }
            "float_list" => {
                let data = float_list(args, 0)?;
                let n = data.len();
                Tensor::from_vec(data, n, DType::F32)?
            }
            _ => Tensor::scalar(float(args, 0)?, DType::F32),
        },
        "scalar_tensor" => {
            let s = scalar(args, 0)?;
            Tensor::scalar(s.to_f64(), scalar_dtype(s))
        }

        // Conversions out of tensors
        "Int" => return Ok(IValue::Int(tensor(args, 0)?.item()?.trunc() as i64)),
        "Float" => return Ok(IValue::Float(tensor(args, 0)?.item()?)),
        "Bool" => return Ok(IValue::Bool(tensor(args, 0)?.item()? != 0.0)),
        "str" => return Ok(IValue::Str(arg(args, 0)?.to_string())),
        "len" => {
            return match arg(args, 0)? {
                IValue::Tensor(t) => match t.dims().first() {
                    Some(&n) => Ok(IValue::Int(n as i64)),
                    None => Err(CoreError::msg("len() of a 0-d tensor")),
                },
                IValue::List(items) => Ok(IValue::Int(items.len() as i64)),
                other => Err(CoreError::msg(format!("object of type {} has no len()", other.type_of()))),
            }
        }

        // Alias of `values` when no override is given, a fresh tensor
        // `values + incr` otherwise.
        "_test_optional_intlist" => {
            let values = tensor(args, 0)?;
            match arg(args, 1)? {
                IValue::None => values.alias(),
                _ => {
                    let incr = int_list(args, 1)?;
                    let n = incr.len();
                    let incr = Tensor::from_vec(
                        incr.into_iter().map(|v| v as f64).collect(),
                        n,
                        values.dtype(),
                    )?;
                    values.add(&incr)?
                }
            }
        }
        other => {
            return Err(CoreError::msg(format!(
                "no kernel for operator '{other}' with arguments ({})",
                args.iter().map(|a| a.type_of().to_string()).collect::<Vec<_>>().join(", ")
            )))
        }
    };
    Ok(IValue::Tensor(out))
}
