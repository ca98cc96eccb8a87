// Runtime errors
//
// Compile-time problems come from kestrel-ir with a source span and stay
// wrapped as `Compile`. Everything that goes wrong while running code is
// one of the other variants. Kernel failures keep the operator name so a
// broadcast error inside a fused loop still says which op raised it.

use std::sync::Arc;

/// All errors raised by the Kestrel runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Parse, type or schema error while compiling source.
    #[error(transparent)]
    Compile(#[from] kestrel_ir::Error),

    /// An eager builtin call received an argument of the wrong type.
    #[error("{0}")]
    Type(String),

    /// A compiled function was called with a value its signature rejects.
    #[error("{0}")]
    ValueType(String),

    /// Raised by running code: exceptions, failed asserts, bad indices.
    #[error("{0}")]
    Runtime(String),

    /// A tensor kernel failed.
    #[error("{op}: {source}")]
    OperatorExecution {
        op: String,
        #[source]
        source: kestrel_core::Error,
    },

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// Lookup of a missing function, method or attribute.
    #[error("{0}")]
    Attribute(String),
}

impl Error {
    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }

    pub fn attribute(msg: impl Into<String>) -> Self {
        Error::Attribute(msg.into())
    }

    /// Attach an operator name to a kernel error.
    pub fn op(op: impl Into<String>, source: kestrel_core::Error) -> Self {
        Error::OperatorExecution {
            op: op.into(),
            source,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

/// Convenience Result type used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted runtime error.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Runtime(format!($($arg)*)))
    };
}
