//! Error kinds for the storage core (spec.md §7).
//!
//! `TuxError` covers the five kinds the core itself can raise. It implements
//! `std::error::Error`, so a host embedding this crate under its own
//! `anyhow`-based command layer (the way the teacher crate's `src/commands/*.rs`
//! flattens lower-level errors) can still propagate it with a plain `?` —
//! this crate itself has no use for `anyhow` and doesn't depend on it.

use std::fmt;

/// Error kinds raised by the B-tree substrate, cache, and file-map.
///
/// `OutOfSpace` is a bug in this core: frontends are expected to pre-reserve
/// space before calling in, so seeing it here means a caller skipped that
/// reservation. `Invariant` marks a violated structural invariant; see
/// [`abort_on_invariant`] for the release-build policy around it.
#[derive(Debug)]
pub enum TuxError {
    /// Cache or cursor allocation failed.
    OutOfMemory,
    /// The allocator returned less space than the caller reserved.
    OutOfSpace,
    /// A block read or write failed.
    Io(std::io::Error),
    /// A leaf failed `sniff`, or a structural invariant was violated on read.
    Corruption(String),
    /// A structural invariant was violated by this process's own mutation.
    Invariant(String),
}

impl fmt::Display for TuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TuxError::OutOfMemory => write!(f, "out of memory"),
            TuxError::OutOfSpace => write!(f, "out of space (frontend reservation bug)"),
            TuxError::Io(e) => write!(f, "i/o error: {e}"),
            TuxError::Corruption(msg) => write!(f, "corruption: {msg}"),
            TuxError::Invariant(msg) => write!(f, "invariant violated: {msg}"),
        }
    }
}

impl std::error::Error for TuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TuxError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TuxError {
    fn from(e: std::io::Error) -> Self {
        TuxError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, TuxError>;

/// `Corruption` terminates the current mount read-only in the full system;
/// the core only surfaces the error. Embedders that want the original
/// abort-on-invariant-violation behavior of the C core call this instead of
/// propagating `TuxError::Invariant`.
pub fn abort_on_invariant(err: &TuxError) -> ! {
    panic!("tux3-core: fatal invariant violation: {err}");
}
