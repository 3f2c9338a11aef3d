use thiserror::Error;

pub type CapCheckResult<T> = Result<T, CapCheckError>;

/// Errors that abort a check. Findings about the checked program are
/// diagnostics, never errors.
#[derive(Debug, Error)]
pub enum CapCheckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid program JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Input the checker cannot interpret at all: a contract naming a
    /// parameter that does not exist, a CFG edge to a missing block.
    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

impl CapCheckError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Return early with [`CapCheckError::Malformed`].
#[macro_export]
macro_rules! capcheck_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::CapCheckError::malformed(format!($($arg)*)));
    };
}

/// Bail with [`CapCheckError::Malformed`] unless `$cond` holds.
#[macro_export]
macro_rules! capcheck_ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::capcheck_bail!($($arg)*);
        }
    };
}
