//! Error taxonomy shared by the loader, registry and DMA layers.

use thiserror::Error;

/// Errors surfaced by the executable registry.
///
/// `InvalidState` indicates an internal invariant violation (for example a
/// task reference count underflow). It is logged at error level before being
/// returned and must be treated as a programming error by the caller, not a
/// retryable condition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoaderError {
    /// Malformed caller input: empty buffer, out-of-range executable id.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Structurally invalid executable image: bad magic, truncated segment
    /// table, duplicate symbol names.
    #[error("invalid executable format: {0}")]
    InvalidFormat(String),

    /// No free image slot, too many symbols, or DMA window exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Unregistered executable id or unknown symbol.
    #[error("not found: {0}")]
    NotFound(String),

    /// Re-registration of an already-registered executable.
    #[error("executable {0} is already registered")]
    AlreadyExists(u16),

    /// Unload attempted while task references are outstanding. The caller
    /// must retry after the referencing tasks complete.
    #[error("executable {id} busy: {refs} task reference(s) outstanding")]
    ResourceBusy { id: u16, refs: u32 },

    /// Internal invariant violation.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, LoaderError>;
