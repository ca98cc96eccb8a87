//! # kestrel-core
//!
//! Tensor substrate for the Kestrel script runtime.
//!
//! This crate provides:
//! - [`Tensor`]: strided n-dimensional array with shared storage and views
//! - [`Shape`] / [`Layout`]: shape, strides and offset
//! - [`DType`]: element types with promotion and rounding
//! - [`Device`]: placement tags with availability checks

pub mod device;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod shape;
pub mod tensor;

pub use device::{accelerator_count, set_accelerator_count, Device};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use shape::Shape;
pub use tensor::{Scalar, Tensor, TensorId};
