// Input profile fingerprints
//
// A plan is specialized for what the executor can observe about its
// arguments: for tensors dtype, sizes, device and requires_grad; for
// optional arguments whether they are None. Other values do not take part
// in specialization, only their kind does.

use std::fmt;

use kestrel_core::{DType, Device};
use kestrel_ir::{TensorType, Type};

use crate::value::IValue;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Tensor {
        dtype: DType,
        sizes: Vec<usize>,
        device: Device,
        requires_grad: bool,
    },
    None,
    /// Any other value.
    Value,
}

/// Fingerprint of one call's arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgumentSpec {
    args: Vec<ArgKind>,
}

impl ArgumentSpec {
    pub fn new(args: &[IValue]) -> Self {
        let args = args
            .iter()
            .map(|v| match v {
                IValue::Tensor(t) => ArgKind::Tensor {
                    dtype: t.dtype(),
                    sizes: t.dims().to_vec(),
                    device: t.device(),
                    requires_grad: t.requires_grad(),
                },
                IValue::None => ArgKind::None,
                _ => ArgKind::Value,
            })
            .collect();
        ArgumentSpec { args }
    }

    pub fn args(&self) -> &[ArgKind] {
        &self.args
    }

    /// Input types to specialize a graph declared with `declared` for.
    pub fn to_types(&self, declared: &[Type]) -> Vec<Type> {
        self.args
            .iter()
            .zip(declared)
            .map(|(kind, ty)| match kind {
                ArgKind::Tensor {
                    dtype,
                    sizes,
                    device,
                    requires_grad,
                } if ty.unwrap_optional().is_tensor() => Type::Tensor(TensorType {
                    dtype: Some(*dtype),
                    sizes: Some(sizes.iter().map(|&d| Some(d)).collect()),
                    device: Some(*device),
                    requires_grad: Some(*requires_grad),
                }),
                ArgKind::None if ty.may_be_none() => Type::NoneType,
                _ => ty.clone(),
            })
            .collect()
    }

    pub fn any_requires_grad(&self) -> bool {
        self.args.iter().any(|a| {
            matches!(
                a,
                ArgKind::Tensor {
                    requires_grad: true,
                    ..
                }
            )
        })
    }
}

impl fmt::Display for ArgumentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .args
            .iter()
            .map(|a| match a {
                ArgKind::Tensor {
                    dtype,
                    sizes,
                    device,
                    requires_grad,
                } => format!(
                    "{dtype}{sizes:?}@{device}{}",
                    if *requires_grad { "+grad" } else { "" }
                ),
                ArgKind::None => "None".into(),
                ArgKind::Value => "_".into(),
            })
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::Tensor;

    #[test]
    fn test_spec_distinguishes_shapes_and_none() {
        let a = IValue::Tensor(Tensor::zeros((2, 3), DType::F32));
        let b = IValue::Tensor(Tensor::zeros((3, 2), DType::F32));
        assert_ne!(ArgumentSpec::new(&[a.clone()]), ArgumentSpec::new(&[b]));
        assert_eq!(
            ArgumentSpec::new(&[a.clone(), IValue::Int(1)]),
            ArgumentSpec::new(&[a.clone(), IValue::Int(2)])
        );
        assert_ne!(
            ArgumentSpec::new(&[a.clone(), IValue::None]),
            ArgumentSpec::new(&[a, IValue::from(vec![1i64])])
        );
    }

    #[test]
    fn test_to_types_refines_tensors() {
        let spec = ArgumentSpec::new(&[IValue::Tensor(Tensor::zeros(4, DType::I64)), IValue::None]);
        let types = spec.to_types(&[Type::tensor(), Type::optional(Type::list(Type::Int))]);
        let t = types[0].as_tensor().unwrap();
        assert_eq!(t.dtype, Some(DType::I64));
        assert_eq!(t.concrete_sizes(), Some(vec![4]));
        assert_eq!(types[1], Type::NoneType);
    }
}
