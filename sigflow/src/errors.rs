//! Error kinds surfaced by the runtime.

/// Any error the runtime or a block can produce.
///
/// Variants carry the owning block's identifier and the port name where one
/// is meaningful; messages are intended to be readable as-is in logs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad configuration input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Data type or domain incompatibility discovered at connect time.
    #[error("type mismatch connecting {src} -> {dst}: {reason}")]
    TypeMismatch {
        /// Source `block[port]` description.
        src: String,
        /// Destination `block[port]` description.
        dst: String,
        /// What failed to line up.
        reason: String,
    },

    /// A named port does not exist on the addressed block.
    #[error("block {block} has no port named '{port}'")]
    PortNotFound {
        /// The addressed block.
        block: String,
        /// The missing port name.
        port: String,
    },

    /// A named callable does not exist on the addressed block.
    #[error("block {block} has no callable named '{call}'")]
    CallNotFound {
        /// The addressed block.
        block: String,
        /// The missing call name.
        call: String,
    },

    /// The operation requires an active block.
    #[error("block {0} is not active")]
    NotActive(String),

    /// The operation requires an inactive block.
    #[error("block {0} is already active")]
    AlreadyActive(String),

    /// The runtime is shutting down; waiting callers are released with this.
    #[error("operation cancelled")]
    Cancelled,

    /// A buffer manager was exhausted and cannot grow.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A block broke its contract (consumed or produced beyond its
    /// declaration). Fatal for the offending block.
    #[error("contract violation in block {block}: {message}")]
    ContractViolation {
        /// The offending block.
        block: String,
        /// What went wrong.
        message: String,
    },

    /// An opaque error from an external collaborator.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The `Result` alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attributes a bare [`Error::CallNotFound`] to a block by name.
    pub(crate) fn attribute(self, block: &str) -> Error {
        match self {
            Error::CallNotFound { call, .. } => Error::CallNotFound { block: block.to_owned(), call },
            other => other,
        }
    }
}
