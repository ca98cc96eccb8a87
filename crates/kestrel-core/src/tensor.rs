use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::{Rng, SeedableRng};

use crate::device::Device;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Tensor: the value type that flows through compiled graphs
//
// MEMORY MODEL:
//
//   Tensor is a cheap handle: Arc<TensorInner>. The inner struct holds the
//   layout, dtype, device and a shared storage buffer:
//
//     Tensor ──Arc──> TensorInner { layout, dtype, device }
//                          │
//                          └──Arc<RwLock<Vec<f64>>>──> storage
//
//   Views (alias, transpose, select, reshape of a contiguous tensor) share
//   the storage Arc, so in-place writes through one handle are visible
//   through every view. Aliasing is observable through `shares_storage`.
//
// NUMERICS:
//
//   Storage cells are f64. Every kernel rounds its results through the output
//   dtype (`DType::cast`) so integer tensors truncate, f16 tensors lose
//   precision, and bool tensors only ever hold 0 and 1.

/// Unique identity of a tensor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    /// Generate a new unique tensor ID from a global counter.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

/// A scalar operand for tensor-scalar kernels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    pub fn to_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => f64::from(u8::from(b)),
            Scalar::Int(i) => i as f64,
            Scalar::Float(f) => f,
        }
    }

    /// Result dtype when this scalar meets a tensor of dtype `tensor`.
    /// A float scalar lifts an integral tensor to the default float type; an
    /// int scalar lifts a bool tensor to i64; otherwise the tensor wins.
    pub fn result_dtype(self, tensor: DType) -> DType {
        match self {
            Scalar::Float(_) if tensor.is_integral() => DType::F32,
            Scalar::Int(_) if tensor == DType::Bool => DType::I64,
            _ => tensor,
        }
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

struct TensorInner {
    id: TensorId,
    storage: Arc<RwLock<Vec<f64>>>,
    layout: Layout,
    dtype: DType,
    device: Device,
    requires_grad: bool,
}

/// An n-dimensional strided array.
///
/// # Example
/// ```
/// use kestrel_core::{DType, Tensor};
///
/// let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (2, 2), DType::F32)?;
/// let b = Tensor::ones((2, 2), DType::F32);
/// let c = a.add(&b)?;
/// assert_eq!(c.to_vec()?, vec![2.0, 3.0, 4.0, 5.0]);
/// # Ok::<(), kestrel_core::Error>(())
/// ```
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.to_vec().map_err(|_| fmt::Error)?;
        write!(f, "tensor(")?;
        if self.rank() == 0 {
            write!(f, "{}", values.first().copied().unwrap_or_default())?;
        } else {
            write!(f, "{:?}, shape={}", values, self.shape())?;
        }
        write!(f, ", dtype={}", self.dtype())?;
        if self.device() != Device::Cpu {
            write!(f, ", device={}", self.device())?;
        }
        write!(f, ")")
    }
}

impl Tensor {
    // Internal constructors

    fn from_parts(data: Vec<f64>, layout: Layout, dtype: DType, device: Device) -> Self {
        let data = data.into_iter().map(|v| dtype.cast(v)).collect();
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(data)),
                layout,
                dtype,
                device,
                requires_grad: false,
            }),
        }
    }

    fn contiguous_result(&self, data: Vec<f64>, shape: Shape, dtype: DType) -> Self {
        Self::from_parts(data, Layout::contiguous(shape), dtype, self.device())
    }

    fn view_with_layout(&self, layout: Layout) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device,
                requires_grad: self.inner.requires_grad,
            }),
        }
    }

    fn read_storage(&self) -> Result<RwLockReadGuard<'_, Vec<f64>>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("tensor storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<'_, Vec<f64>>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("tensor storage lock poisoned"))
    }

    fn read_with_layout(&self, layout: &Layout) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        layout
            .strided_indices()
            .map(|i| {
                storage
                    .get(i)
                    .copied()
                    .ok_or_else(|| Error::msg("strided index past end of storage"))
            })
            .collect()
    }

    // Creation

    /// Create a tensor from row-major values.
    pub fn from_vec(data: Vec<f64>, shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self::from_parts(
            data,
            Layout::contiguous(shape),
            dtype,
            Device::Cpu,
        ))
    }

    /// Create a tensor from a typed slice; the dtype follows the element type.
    pub fn from_slice<T: WithDType>(data: &[T], shape: impl Into<Shape>) -> Result<Self> {
        let values = data.iter().map(|v| v.to_f64()).collect();
        Self::from_vec(values, shape, T::DTYPE)
    }

    /// A zero-dimensional tensor.
    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self::from_parts(
            vec![value],
            Layout::contiguous(Shape::from(())),
            dtype,
            Device::Cpu,
        )
    }

    /// A tensor with every element set to `value`.
    pub fn full(shape: impl Into<Shape>, value: f64, dtype: DType) -> Self {
        let shape = shape.into();
        let data = vec![value; shape.elem_count()];
        Self::from_parts(data, Layout::contiguous(shape), dtype, Device::Cpu)
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self::full(shape, 0.0, dtype)
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType) -> Self {
        Self::full(shape, 1.0, dtype)
    }

    /// `[0, 1, ..., n-1]`.
    pub fn arange(n: usize, dtype: DType) -> Self {
        let data = (0..n).map(|i| i as f64).collect();
        Self::from_parts(data, Layout::contiguous(Shape::from(n)), dtype, Device::Cpu)
    }

    /// Uniform samples in `[0, 1)`.
    pub fn rand(shape: impl Into<Shape>, dtype: DType) -> Self {
        let shape = shape.into();
        let mut rng = rand::thread_rng();
        let data = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Self::from_parts(data, Layout::contiguous(shape), dtype, Device::Cpu)
    }

    /// Uniform samples in `[0, 1)` from a seeded generator.
    pub fn rand_seeded(shape: impl Into<Shape>, dtype: DType, seed: u64) -> Self {
        let shape = shape.into();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let data = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Self::from_parts(data, Layout::contiguous(shape), dtype, Device::Cpu)
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    /// A handle over the same storage with the requires-grad flag set.
    pub fn set_requires_grad(&self, requires_grad: bool) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device,
                requires_grad,
            }),
        }
    }

    /// Identity of the underlying storage buffer.
    pub fn storage_id(&self) -> usize {
        Arc::as_ptr(&self.inner.storage) as usize
    }

    /// Whether two handles read and write the same storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    /// Whether two handles are the same tensor object.
    pub fn same_handle(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // Reading

    /// Elements in logical (row-major) order.
    pub fn to_vec(&self) -> Result<Vec<f64>> {
        self.read_with_layout(&self.inner.layout)
    }

    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        Ok(self.to_vec()?.into_iter().map(|v| v as i64).collect())
    }

    /// The single element of a one-element tensor.
    pub fn item(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.to_vec()?[0])
    }

    /// Equal shape, dtype and values.
    pub fn equal(&self, other: &Tensor) -> bool {
        self.shape() == other.shape()
            && self.dtype() == other.dtype()
            && matches!((self.to_vec(), other.to_vec()), (Ok(a), Ok(b)) if a == b)
    }

    /// Element-wise `|a - b| <= atol + rtol * |b|` with broadcasting.
    pub fn allclose(&self, other: &Tensor, rtol: f64, atol: f64) -> Result<bool> {
        let (a, b, _) = self.broadcast_pair(other)?;
        Ok(a
            .iter()
            .zip(&b)
            .all(|(x, y)| (x - y).abs() <= atol + rtol * y.abs() || x == y))
    }

    // Copies and views

    /// A new handle over the same storage and layout.
    pub fn alias(&self) -> Self {
        self.view_with_layout(self.inner.layout.clone())
    }

    /// A contiguous copy with its own storage.
    pub fn deep_clone(&self) -> Result<Self> {
        let data = self.to_vec()?;
        let t = self.contiguous_result(data, self.shape().clone(), self.dtype());
        Ok(if self.requires_grad() {
            t.set_requires_grad(true)
        } else {
            t
        })
    }

    /// A handle that does not require grad, sharing storage.
    pub fn detach(&self) -> Self {
        self.set_requires_grad(false)
    }

    pub fn transpose(&self, dim0: i64, dim1: i64) -> Result<Self> {
        let d0 = self.shape().normalize_dim(dim0)?;
        let d1 = self.shape().normalize_dim(dim1)?;
        Ok(self.view_with_layout(self.inner.layout.transpose(d0, d1)?))
    }

    /// Transpose of a matrix; identity for rank < 2.
    pub fn t(&self) -> Result<Self> {
        if self.rank() < 2 {
            return Ok(self.alias());
        }
        self.transpose(0, 1)
    }

    /// Index along `dim`, returning a view with that dimension removed.
    pub fn select(&self, dim: i64, index: i64) -> Result<Self> {
        let d = self.shape().normalize_dim(dim)?;
        let size = self.dims()[d];
        let idx = if index < 0 { index + size as i64 } else { index };
        if idx < 0 || idx as usize >= size {
            return Err(Error::IndexOutOfBounds { index, size });
        }
        Ok(self.view_with_layout(self.inner.layout.select(d, idx as usize)?))
    }

    fn resolve_shape(&self, shape: &[i64]) -> Result<Shape> {
        let total = self.elem_count();
        let mut infer = None;
        let mut known = 1usize;
        let mut dims = Vec::with_capacity(shape.len());
        for (i, &d) in shape.iter().enumerate() {
            if d == -1 {
                if infer.is_some() {
                    return Err(Error::msg("only one dimension can be inferred"));
                }
                infer = Some(i);
                dims.push(1);
            } else if d < 0 {
                return Err(Error::msg(format!("invalid shape dimension {d}")));
            } else {
                known *= d as usize;
                dims.push(d as usize);
            }
        }
        if let Some(i) = infer {
            if known == 0 || total % known != 0 {
                return Err(Error::ReshapeElementMismatch {
                    src: total,
                    dst: known,
                    dst_shape: Shape::new(dims),
                });
            }
            dims[i] = total / known;
        }
        let shape = Shape::new(dims);
        if shape.elem_count() != total {
            return Err(Error::ReshapeElementMismatch {
                src: total,
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        Ok(shape)
    }

    /// Reshape; a view when contiguous, otherwise a copy. `-1` infers a dim.
    pub fn reshape(&self, shape: &[i64]) -> Result<Self> {
        let shape = self.resolve_shape(shape)?;
        if self.is_contiguous() {
            return Ok(self.view_with_layout(Layout::contiguous(shape)));
        }
        let data = self.to_vec()?;
        Ok(self.contiguous_result(data, shape, self.dtype()))
    }

    /// Reshape that must not copy.
    pub fn view(&self, shape: &[i64]) -> Result<Self> {
        if !self.is_contiguous() {
            return Err(Error::NonContiguousView);
        }
        self.reshape(shape)
    }

    pub fn unsqueeze(&self, dim: i64) -> Result<Self> {
        let rank = self.rank() as i64;
        let d = if dim < 0 { dim + rank + 1 } else { dim };
        if d < 0 || d > rank {
            return Err(Error::DimOutOfRange {
                dim,
                rank: self.rank(),
            });
        }
        let mut dims: Vec<i64> = self.dims().iter().map(|&x| x as i64).collect();
        dims.insert(d as usize, 1);
        self.reshape(&dims)
    }

    // Conversions

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype() {
            return Ok(self.clone());
        }
        let data = self.to_vec()?;
        Ok(self.contiguous_result(data, self.shape().clone(), dtype))
    }

    /// Copy to another device. Errors if the device is unavailable.
    pub fn to_device(&self, device: Device) -> Result<Self> {
        device.ensure_available()?;
        if device == self.device() {
            return Ok(self.clone());
        }
        let data = self.to_vec()?;
        let t = Self::from_parts(
            data,
            Layout::contiguous(self.shape().clone()),
            self.dtype(),
            device,
        );
        Ok(if self.requires_grad() {
            t.set_requires_grad(true)
        } else {
            t
        })
    }

    /// Retag the device without an availability check (archive loading).
    pub fn with_device_unchecked(&self, device: Device) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device,
                requires_grad: self.inner.requires_grad,
            }),
        }
    }

    // Element-wise kernels

    fn broadcast_pair(&self, rhs: &Tensor) -> Result<(Vec<f64>, Vec<f64>, Shape)> {
        if self.device() != rhs.device() && self.rank() > 0 && rhs.rank() > 0 {
            return Err(Error::DeviceMismatch {
                lhs: self.device(),
                rhs: rhs.device(),
            });
        }
        let shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs = self.read_with_layout(&self.inner.layout.broadcast_as(&shape)?)?;
        let rhs = rhs.read_with_layout(&rhs.inner.layout.broadcast_as(&shape)?)?;
        Ok((lhs, rhs, shape))
    }

    fn zip_map(&self, rhs: &Tensor, dtype: DType, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        let (a, b, shape) = self.broadcast_pair(rhs)?;
        let data = a.iter().zip(&b).map(|(&x, &y)| f(x, y)).collect();
        Ok(self.contiguous_result(data, shape, dtype))
    }

    fn map(&self, dtype: DType, f: impl Fn(f64) -> f64) -> Result<Self> {
        let data = self.to_vec()?.into_iter().map(f).collect();
        Ok(self.contiguous_result(data, self.shape().clone(), dtype))
    }

    fn scalar_operand(&self, s: Scalar) -> Tensor {
        Self::from_parts(
            vec![s.to_f64()],
            Layout::contiguous(Shape::from(())),
            s.result_dtype(self.dtype()),
            self.device(),
        )
    }

    pub fn add(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, self.dtype().promote(rhs.dtype()), |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, self.dtype().promote(rhs.dtype()), |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, self.dtype().promote(rhs.dtype()), |a, b| a * b)
    }

    /// True division; integral inputs produce the default float type.
    pub fn div(&self, rhs: &Tensor) -> Result<Self> {
        let dtype = self.dtype().promote(rhs.dtype()).to_float();
        self.zip_map(rhs, dtype, |a, b| a / b)
    }

    /// Floor division; integral inputs stay integral.
    pub fn floor_div(&self, rhs: &Tensor) -> Result<Self> {
        let dtype = self.dtype().promote(rhs.dtype());
        if dtype.is_integral() && rhs.to_vec()?.iter().any(|&v| v == 0.0) {
            return Err(Error::msg("ZeroDivisionError: integer division by zero"));
        }
        self.zip_map(rhs, dtype, |a, b| (a / b).floor())
    }

    /// Remainder with the sign of the divisor.
    pub fn remainder(&self, rhs: &Tensor) -> Result<Self> {
        let dtype = self.dtype().promote(rhs.dtype());
        if dtype.is_integral() && rhs.to_vec()?.iter().any(|&v| v == 0.0) {
            return Err(Error::msg("ZeroDivisionError: integer modulo by zero"));
        }
        self.zip_map(rhs, dtype, |a, b| a - (a / b).floor() * b)
    }

    pub fn maximum(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, self.dtype().promote(rhs.dtype()), f64::max)
    }

    pub fn minimum(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, self.dtype().promote(rhs.dtype()), f64::min)
    }

    pub fn pow(&self, exponent: Scalar) -> Result<Self> {
        let e = exponent.to_f64();
        self.map(exponent.result_dtype(self.dtype()), |v| v.powf(e))
    }

    pub fn add_scalar(&self, s: Scalar) -> Result<Self> {
        self.add(&self.scalar_operand(s))
    }

    pub fn sub_scalar(&self, s: Scalar) -> Result<Self> {
        self.sub(&self.scalar_operand(s))
    }

    /// `s - self`.
    pub fn rsub_scalar(&self, s: Scalar) -> Result<Self> {
        self.scalar_operand(s).sub(self)
    }

    pub fn mul_scalar(&self, s: Scalar) -> Result<Self> {
        self.mul(&self.scalar_operand(s))
    }

    pub fn div_scalar(&self, s: Scalar) -> Result<Self> {
        self.div(&self.scalar_operand(s))
    }

    /// `self * mul + add`, keeping the dtype.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        self.map(self.dtype(), |v| v * mul + add)
    }

    // Comparisons produce bool tensors.

    pub fn eq(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, DType::Bool, |a, b| f64::from(u8::from(a == b)))
    }

    pub fn ne(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, DType::Bool, |a, b| f64::from(u8::from(a != b)))
    }

    pub fn lt(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, DType::Bool, |a, b| f64::from(u8::from(a < b)))
    }

    pub fn le(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, DType::Bool, |a, b| f64::from(u8::from(a <= b)))
    }

    pub fn gt(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, DType::Bool, |a, b| f64::from(u8::from(a > b)))
    }

    pub fn ge(&self, rhs: &Tensor) -> Result<Self> {
        self.zip_map(rhs, DType::Bool, |a, b| f64::from(u8::from(a >= b)))
    }

    // Unary

    pub fn neg(&self) -> Result<Self> {
        self.map(self.dtype(), |v| -v)
    }

    pub fn abs(&self) -> Result<Self> {
        self.map(self.dtype(), f64::abs)
    }

    pub fn exp(&self) -> Result<Self> {
        self.map(self.dtype().to_float(), f64::exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.map(self.dtype().to_float(), f64::ln)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.map(self.dtype().to_float(), f64::sqrt)
    }

    pub fn relu(&self) -> Result<Self> {
        self.map(self.dtype(), |v| v.max(0.0))
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.map(self.dtype().to_float(), |v| 1.0 / (1.0 + (-v).exp()))
    }

    pub fn tanh(&self) -> Result<Self> {
        self.map(self.dtype().to_float(), f64::tanh)
    }

    /// GELU, tanh approximation.
    pub fn gelu(&self) -> Result<Self> {
        let c = (2.0 / std::f64::consts::PI).sqrt();
        self.map(self.dtype().to_float(), move |x| {
            0.5 * x * (1.0 + (c * (x + 0.044715 * x * x * x)).tanh())
        })
    }

    /// ELU: `x` for x > 0, `alpha * (exp(x) - 1)` otherwise.
    pub fn elu(&self, alpha: f64) -> Result<Self> {
        self.map(self.dtype().to_float(), move |x| {
            if x > 0.0 {
                x
            } else {
                alpha * (x.exp() - 1.0)
            }
        })
    }

    // Reductions

    /// Sum of all elements; integral inputs accumulate as i64.
    pub fn sum_all(&self) -> Result<Self> {
        let dtype = if self.dtype().is_integral() {
            DType::I64
        } else {
            self.dtype()
        };
        let total = self.to_vec()?.iter().sum();
        Ok(self.contiguous_result(vec![total], Shape::from(()), dtype))
    }

    pub fn mean_all(&self) -> Result<Self> {
        if self.dtype().is_integral() {
            return Err(Error::msg(format!(
                "mean(): input dtype must be a floating point type, got {}",
                self.dtype()
            )));
        }
        let data = self.to_vec()?;
        let mean = data.iter().sum::<f64>() / data.len().max(1) as f64;
        Ok(self.contiguous_result(vec![mean], Shape::from(()), self.dtype()))
    }

    pub fn max_all(&self) -> Result<Self> {
        let data = self.to_vec()?;
        let max = data
            .iter()
            .copied()
            .reduce(f64::max)
            .ok_or_else(|| Error::msg("max(): expected a non-empty tensor"))?;
        Ok(self.contiguous_result(vec![max], Shape::from(()), self.dtype()))
    }

    /// Sum along one dimension.
    pub fn sum_dim(&self, dim: i64, keepdim: bool) -> Result<Self> {
        let d = self.shape().normalize_dim(dim)?;
        if self.rank() == 0 {
            return self.sum_all();
        }
        let dims = self.dims();
        let outer: usize = dims[..d].iter().product();
        let size = dims[d];
        let inner: usize = dims[d + 1..].iter().product();
        let data = self.to_vec()?;
        let mut out = vec![0.0; outer * inner];
        for o in 0..outer {
            for k in 0..size {
                for i in 0..inner {
                    out[o * inner + i] += data[(o * size + k) * inner + i];
                }
            }
        }
        let mut out_dims = dims.to_vec();
        if keepdim {
            out_dims[d] = 1;
        } else {
            out_dims.remove(d);
        }
        let dtype = if self.dtype().is_integral() {
            DType::I64
        } else {
            self.dtype()
        };
        Ok(self.contiguous_result(out, Shape::new(out_dims), dtype))
    }

    // Linear algebra

    /// Matrix product for 1-D and 2-D operands and equal-batch 3-D operands.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Self> {
        let lhs2 = if self.rank() == 1 {
            self.unsqueeze(0)?
        } else {
            self.clone()
        };
        let rhs2 = if rhs.rank() == 1 {
            rhs.unsqueeze(1)?
        } else {
            rhs.clone()
        };
        if lhs2.rank() < 2 || rhs2.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank().min(rhs.rank()),
            });
        }
        let ld = lhs2.dims().to_vec();
        let rd = rhs2.dims().to_vec();
        let (m, k1) = (ld[ld.len() - 2], ld[ld.len() - 1]);
        let (k2, n) = (rd[rd.len() - 2], rd[rd.len() - 1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let batch_l = &ld[..ld.len() - 2];
        let batch_r = &rd[..rd.len() - 2];
        let batch = if batch_l.is_empty() {
            batch_r.to_vec()
        } else if batch_r.is_empty() || batch_l == batch_r {
            batch_l.to_vec()
        } else {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(batch_l),
                got: Shape::from(batch_r),
            });
        };
        let nb: usize = batch.iter().product();
        let a = lhs2.to_vec()?;
        let b = rhs2.to_vec()?;
        let a_step = if batch_l.is_empty() { 0 } else { m * k1 };
        let b_step = if batch_r.is_empty() { 0 } else { k2 * n };
        let mut out = vec![0.0; nb * m * n];
        for bi in 0..nb {
            let (ao, bo, oo) = (bi * a_step, bi * b_step, bi * m * n);
            for i in 0..m {
                for k in 0..k1 {
                    let av = a[ao + i * k1 + k];
                    for j in 0..n {
                        out[oo + i * n + j] += av * b[bo + k * n + j];
                    }
                }
            }
        }
        let mut dims = batch;
        if self.rank() != 1 {
            dims.push(m);
        }
        if rhs.rank() != 1 {
            dims.push(n);
        }
        let dtype = self.dtype().promote(rhs.dtype());
        Ok(self.contiguous_result(out, Shape::new(dims), dtype))
    }

    // In-place mutation
    //
    // These write through the storage shared with every view of `self`.

    fn write_values(&self, values: Vec<f64>) -> Result<()> {
        let layout = self.inner.layout.clone();
        let dtype = self.dtype();
        let mut storage = self.write_storage()?;
        for (idx, v) in layout.strided_indices().zip(values) {
            let cell = storage
                .get_mut(idx)
                .ok_or_else(|| Error::msg("strided index past end of storage"))?;
            *cell = dtype.cast(v);
        }
        Ok(())
    }

    fn broadcast_into_self(&self, src: &Tensor) -> Result<Vec<f64>> {
        let layout = src.inner.layout.broadcast_as(self.shape())?;
        src.read_with_layout(&layout)
    }

    /// Fill every element with `value`.
    pub fn fill_(&self, value: Scalar) -> Result<()> {
        self.write_values(vec![value.to_f64(); self.elem_count()])
    }

    /// `self += other`, broadcasting `other` to `self`'s shape.
    pub fn add_(&self, other: &Tensor) -> Result<()> {
        let rhs = self.broadcast_into_self(other)?;
        let lhs = self.to_vec()?;
        self.write_values(lhs.iter().zip(&rhs).map(|(a, b)| a + b).collect())
    }

    /// `self *= other`, broadcasting `other` to `self`'s shape.
    pub fn mul_(&self, other: &Tensor) -> Result<()> {
        let rhs = self.broadcast_into_self(other)?;
        let lhs = self.to_vec()?;
        self.write_values(lhs.iter().zip(&rhs).map(|(a, b)| a * b).collect())
    }

    /// Overwrite with `src`, broadcasting to `self`'s shape.
    pub fn copy_(&self, src: &Tensor) -> Result<()> {
        let values = self.broadcast_into_self(src)?;
        self.write_values(values)
    }

    pub fn relu_(&self) -> Result<()> {
        let values = self.to_vec()?.into_iter().map(|v| v.max(0.0)).collect();
        self.write_values(values)
    }

    pub fn elu_(&self, alpha: f64) -> Result<()> {
        let values = self.elu(alpha)?.to_vec()?;
        self.write_values(values)
    }

    /// Write one element addressed by a full multi-dimensional index.
    pub fn set_item(&self, index: &[usize], value: f64) -> Result<()> {
        if index.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        for (&i, &size) in index.iter().zip(self.dims()) {
            if i >= size {
                return Err(Error::IndexOutOfBounds {
                    index: i as i64,
                    size,
                });
            }
        }
        let flat = self.inner.layout.flat_index(index);
        let dtype = self.dtype();
        let mut storage = self.write_storage()?;
        let cell = storage
            .get_mut(flat)
            .ok_or_else(|| Error::msg("strided index past end of storage"))?;
        *cell = dtype.cast(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f64], shape: &[usize]) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, DType::F32).unwrap()
    }

    #[test]
    fn test_from_vec_checks_count() {
        assert!(Tensor::from_vec(vec![1.0, 2.0], 3, DType::F32).is_err());
    }

    #[test]
    fn test_broadcast_add() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = t(&[10.0, 20.0, 30.0], &[3]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.dims(), &[2, 3]);
        assert_eq!(c.to_vec().unwrap(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_integer_add_stays_integral() {
        let a = Tensor::from_slice(&[3i32, 2], 2).unwrap();
        let b = Tensor::from_slice(&[5i32, 4], 2).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.dtype(), DType::I32);
        assert_eq!(c.to_i64_vec().unwrap(), vec![8, 6]);
    }

    #[test]
    fn test_int_true_div_promotes() {
        let a = Tensor::from_slice(&[7i64], 1).unwrap();
        let b = Tensor::from_slice(&[2i64], 1).unwrap();
        let c = a.div(&b).unwrap();
        assert_eq!(c.dtype(), DType::F32);
        assert_eq!(c.to_vec().unwrap(), vec![3.5]);
        assert_eq!(a.floor_div(&b).unwrap().to_vec().unwrap(), vec![3.0]);
    }

    #[test]
    fn test_int_floor_div_by_zero() {
        let a = Tensor::from_slice(&[7i64], 1).unwrap();
        let z = Tensor::from_slice(&[0i64], 1).unwrap();
        assert!(a.floor_div(&z).is_err());
    }

    #[test]
    fn test_transpose_shares_storage() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = a.transpose(0, 1).unwrap();
        assert!(b.shares_storage(&a));
        assert_eq!(b.to_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_inplace_visible_through_alias() {
        let a = Tensor::zeros((2, 2), DType::F32);
        let b = a.alias();
        b.add_(&Tensor::scalar(1.5, DType::F32)).unwrap();
        assert_eq!(a.to_vec().unwrap(), vec![1.5; 4]);
    }

    #[test]
    fn test_set_item_through_transposed_view() {
        let a = Tensor::zeros((2, 3), DType::F32);
        let view = a.transpose(0, 1).unwrap();
        view.set_item(&[2, 1], 9.0).unwrap();
        assert_eq!(a.to_vec().unwrap()[5], 9.0);
    }

    #[test]
    fn test_reshape_infers_dim() {
        let a = Tensor::arange(6, DType::I64);
        let b = a.reshape(&[2, -1]).unwrap();
        assert_eq!(b.dims(), &[2, 3]);
        assert!(b.shares_storage(&a));
    }

    #[test]
    fn test_view_requires_contiguous() {
        let a = Tensor::arange(6, DType::F32).reshape(&[2, 3]).unwrap();
        let at = a.t().unwrap();
        assert!(at.view(&[6]).is_err());
        assert!(!at.reshape(&[6]).unwrap().shares_storage(&a));
    }

    #[test]
    fn test_matmul() {
        let a = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let b = t(&[5.0, 6.0, 7.0, 8.0], &[2, 2]);
        assert_eq!(a.matmul(&b).unwrap().to_vec().unwrap(), vec![19.0, 22.0, 43.0, 50.0]);
        let v = t(&[1.0, 1.0], &[2]);
        let mv = a.matmul(&v).unwrap();
        assert_eq!(mv.dims(), &[2]);
        assert_eq!(mv.to_vec().unwrap(), vec![3.0, 7.0]);
    }

    #[test]
    fn test_elu() {
        let a = t(&[-1.0, 2.0], &[2]);
        let out = a.elu(1.0).unwrap().to_vec().unwrap();
        assert!((out[0] - ((-1.0f64).exp() - 1.0)).abs() < 1e-6);
        assert_eq!(out[1], 2.0);
    }

    #[test]
    fn test_sum_dim() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(a.sum_dim(0, false).unwrap().to_vec().unwrap(), vec![5.0, 7.0, 9.0]);
        assert_eq!(a.sum_dim(-1, true).unwrap().dims(), &[2, 1]);
    }

    #[test]
    fn test_mean_rejects_ints() {
        assert!(Tensor::arange(3, DType::I64).mean_all().is_err());
    }

    #[test]
    fn test_f16_rounding() {
        let a = Tensor::from_vec(vec![0.1], 1, DType::F16).unwrap();
        assert_eq!(a.to_vec().unwrap()[0], half::f16::from_f64(0.1).to_f64());
    }

    #[test]
    fn test_to_unavailable_device_fails() {
        let a = Tensor::ones(2, DType::F32);
        assert!(a.to_device(Device::Cuda(64)).is_err());
    }

    #[test]
    fn test_scalar_result_dtype() {
        let a = Tensor::from_slice(&[1i32, 2], 2).unwrap();
        assert_eq!(a.add_scalar(Scalar::Float(0.5)).unwrap().dtype(), DType::F32);
        assert_eq!(a.add_scalar(Scalar::Int(1)).unwrap().dtype(), DType::I32);
    }
}
