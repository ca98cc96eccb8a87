use crate::device::Device;
use crate::shape::Shape;

/// All errors raised by tensor kernels and tensor construction.
///
/// The runtime wraps these in its own operator-execution error so that a
/// failing kernel surfaces with the operator name attached.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Two shapes cannot be broadcast together.
    #[error("shapes {lhs} and {rhs} are not broadcast-compatible")]
    BroadcastMismatch { lhs: Shape, rhs: Shape },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: i64, rank: usize },

    /// Element index out of range along a dimension.
    #[error("index {index} is out of bounds for dimension of size {size}")]
    IndexOutOfBounds { index: i64, size: usize },

    /// Tried to read a scalar from a tensor with more than one element.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// A view was requested on a tensor whose strides do not allow it.
    #[error("view size is not compatible with input tensor's size and stride; use reshape instead")]
    NonContiguousView,

    /// The requested device has no backing accelerator in this process.
    #[error("device {device} is not available")]
    DeviceUnavailable { device: Device },

    /// A device string did not parse.
    #[error("invalid device string: '{0}'")]
    InvalidDevice(String),

    /// Binary operation across two devices.
    #[error("expected all tensors to be on the same device, found {lhs} and {rhs}")]
    DeviceMismatch { lhs: Device, rhs: Device },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout kestrel-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("integer division by zero in {}", op)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
