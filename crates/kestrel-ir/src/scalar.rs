// Scalar semantics of the builtin int / float / bool / str operators
//
// Shared by constant propagation (compile time) and the interpreter
// (run time) so a folded expression always agrees with its executed form.
// Integer arithmetic follows the script language: `/` produces a float,
// `//` and `%` round toward negative infinity, overflow is an error.

use crate::graph::Constant;

/// Outcome of evaluating a scalar operator.
pub type ScalarResult = std::result::Result<Constant, String>;

fn zero_division() -> String {
    "ZeroDivisionError: integer division or modulo by zero".to_string()
}

fn overflow(op: &str) -> String {
    format!("integer overflow in '{op}'")
}

fn num(c: &Constant) -> Option<f64> {
    match c {
        Constant::Int(n) => Some(*n as f64),
        Constant::Float(v) => Some(*v),
        Constant::Bool(b) => Some(f64::from(u8::from(*b))),
        _ => None,
    }
}

fn floor_div_i64(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn rem_i64(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && ((r < 0) != (b < 0)) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn rem_f64(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        r + b
    } else {
        r
    }
}

/// Number of iterations of `range(lo, hi, step)`.
pub fn range_length(lo: i64, hi: i64, step: i64) -> std::result::Result<i64, String> {
    if step == 0 {
        return Err("range() arg 3 must not be zero".into());
    }
    let (lo, hi, step) = (i128::from(lo), i128::from(hi), i128::from(step));
    let n = if step > 0 && lo < hi {
        (hi - lo + step - 1) / step
    } else if step < 0 && lo > hi {
        (lo - hi - step - 1) / (-step)
    } else {
        0
    };
    i64::try_from(n).map_err(|_| overflow("range"))
}

/// Text produced by `str(c)`.
pub fn to_display_string(c: &Constant) -> String {
    match c {
        Constant::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate operator `name` on scalar arguments. Returns `None` when the
/// operator or the argument kinds are not scalar.
pub fn eval_scalar(name: &str, args: &[Constant]) -> Option<ScalarResult> {
    use Constant::{Bool, BoolList, Float, FloatList, Int, IntList, Str};
    let r = match (name, args) {
        ("add", [Int(a), Int(b)]) => a.checked_add(*b).map(Int).ok_or_else(|| overflow(name)),
        ("sub", [Int(a), Int(b)]) => a.checked_sub(*b).map(Int).ok_or_else(|| overflow(name)),
        ("mul", [Int(a), Int(b)]) => a.checked_mul(*b).map(Int).ok_or_else(|| overflow(name)),
        ("floordiv", [Int(a), Int(b)]) => {
            if *b == 0 {
                Err(zero_division())
            } else {
                floor_div_i64(*a, *b).map(Int).ok_or_else(|| overflow(name))
            }
        }
        ("remainder", [Int(a), Int(b)]) => {
            if *b == 0 {
                Err(zero_division())
            } else {
                rem_i64(*a, *b).map(Int).ok_or_else(|| overflow(name))
            }
        }
        ("pow", [Int(a), Int(b)]) if *b >= 0 => u32::try_from(*b)
            .ok()
            .and_then(|e| a.checked_pow(e))
            .map(Int)
            .ok_or_else(|| overflow(name)),
        ("add", [Str(a), Str(b)]) => Ok(Str(format!("{a}{b}"))),
        ("add" | "sub" | "mul" | "div" | "floordiv" | "remainder" | "pow", [a, b]) => {
            let (x, y) = (num(a)?, num(b)?);
            match name {
                "add" => Ok(Float(x + y)),
                "sub" => Ok(Float(x - y)),
                "mul" => Ok(Float(x * y)),
                "div" if y == 0.0 => Err("ZeroDivisionError: float division by zero".into()),
                "div" => Ok(Float(x / y)),
                "floordiv" if y == 0.0 => Err("ZeroDivisionError: float floor division by zero".into()),
                "floordiv" => Ok(Float((x / y).floor())),
                "remainder" if y == 0.0 => Err("ZeroDivisionError: float modulo".into()),
                "remainder" => Ok(Float(rem_f64(x, y))),
                _ => Ok(Float(x.powf(y))),
            }
        }
        ("neg", [Int(a)]) => a.checked_neg().map(Int).ok_or_else(|| overflow(name)),
        ("neg", [Float(a)]) => Ok(Float(-a)),
        ("eq" | "ne", [Str(a), Str(b)]) => Ok(Bool((a == b) == (name == "eq"))),
        ("eq" | "ne", [Bool(a), Bool(b)]) => Ok(Bool((a == b) == (name == "eq"))),
        ("eq" | "ne" | "lt" | "le" | "gt" | "ge", [Int(a), Int(b)]) => Ok(Bool(match name {
            "eq" => a == b,
            "ne" => a != b,
            "lt" => a < b,
            "le" => a <= b,
            "gt" => a > b,
            _ => a >= b,
        })),
        ("eq" | "ne" | "lt" | "le" | "gt" | "ge", [a, b]) => {
            let (x, y) = (num(a)?, num(b)?);
            Ok(Bool(match name {
                "eq" => x == y,
                "ne" => x != y,
                "lt" => x < y,
                "le" => x <= y,
                "gt" => x > y,
                _ => x >= y,
            }))
        }
        ("__not__", [Bool(a)]) => Ok(Bool(!a)),
        ("__and__", [Bool(a), Bool(b)]) => Ok(Bool(*a && *b)),
        ("__or__", [Bool(a), Bool(b)]) => Ok(Bool(*a || *b)),
        ("Int", [Int(a)]) => Ok(Int(*a)),
        ("Int", [Bool(a)]) => Ok(Int(i64::from(*a))),
        ("Int", [Float(a)]) => {
            if a.is_finite() && a.trunc().abs() < 9.2e18 {
                Ok(Int(a.trunc() as i64))
            } else {
                Err(format!("cannot convert float {a} to integer"))
            }
        }
        ("Float", [a]) if !matches!(a, Str(_)) => Ok(Float(num(a)?)),
        ("Bool", [Bool(a)]) => Ok(Bool(*a)),
        ("Bool", [a]) if !matches!(a, Str(_)) => Ok(Bool(num(a)? != 0.0)),
        ("str", [a]) if !matches!(a, Constant::Tensor(_)) => Ok(Str(to_display_string(a))),
        ("len", [Str(s)]) => Ok(Int(s.chars().count() as i64)),
        ("len", [IntList(v)]) => Ok(Int(v.len() as i64)),
        ("len", [FloatList(v)]) => Ok(Int(v.len() as i64)),
        ("len", [BoolList(v)]) => Ok(Int(v.len() as i64)),
        ("__range_length", [Int(lo), Int(hi), Int(step)]) => range_length(*lo, *hi, *step).map(Int),
        ("__derive_index", [Int(index), Int(start), Int(step)]) => index
            .checked_mul(*step)
            .and_then(|d| start.checked_add(d))
            .map(Int)
            .ok_or_else(|| overflow(name)),
        _ => return None,
    };
    Some(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(name: &str, args: &[Constant]) -> Constant {
        eval_scalar(name, args).unwrap().unwrap()
    }

    #[test]
    fn test_integer_division_rounds_down() {
        assert_eq!(eval("floordiv", &[Constant::Int(-7), Constant::Int(2)]).as_int(), Some(-4));
        assert_eq!(eval("remainder", &[Constant::Int(-7), Constant::Int(2)]).as_int(), Some(1));
        assert_eq!(eval("div", &[Constant::Int(7), Constant::Int(2)]).as_float(), Some(3.5));
    }

    #[test]
    fn test_zero_division_is_an_error() {
        let r = eval_scalar("floordiv", &[Constant::Int(1), Constant::Int(0)]).unwrap();
        assert!(r.unwrap_err().contains("ZeroDivisionError"));
    }

    #[test]
    fn test_mixed_numbers_promote_to_float() {
        assert_eq!(eval("add", &[Constant::Int(1), Constant::Float(0.5)]).as_float(), Some(1.5));
        assert_eq!(eval("lt", &[Constant::Int(1), Constant::Float(1.5)]).as_bool(), Some(true));
    }

    #[test]
    fn test_range_length() {
        assert_eq!(range_length(0, 10, 3), Ok(4));
        assert_eq!(range_length(10, 0, -3), Ok(4));
        assert_eq!(range_length(5, 5, 1), Ok(0));
        assert!(range_length(0, 1, 0).is_err());
    }

    #[test]
    fn test_range_length_near_integer_limits() {
        assert_eq!(range_length(0, i64::MAX, 2), Ok(i64::MAX / 2 + 1));
        assert_eq!(range_length(i64::MAX, i64::MIN, -1 << 62), Ok(4));
        assert_eq!(range_length(i64::MIN, i64::MAX, 1), Err(overflow("range")));
    }

    #[test]
    fn test_str_of_scalars() {
        assert_eq!(to_display_string(&Constant::Bool(true)), "True");
        assert_eq!(to_display_string(&Constant::Float(2.0)), "2.0");
        assert_eq!(to_display_string(&Constant::Str("a".into())), "a");
    }

    #[test]
    fn test_tensor_ops_are_not_scalar() {
        assert!(eval_scalar("relu", &[Constant::Int(1)]).is_none());
    }
}
