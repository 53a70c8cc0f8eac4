use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the public API.
///
/// Transient conditions (`EAGAIN`, `EINTR`) are handled internally and never
/// reach callers; peer-initiated close is a normal state transition, not an
/// error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("prepend of {0} bytes exceeds the reserved header space")]
    PrependOverflow(usize),

    #[error("event loop worker thread failed to start: {0}")]
    ThreadStart(String),
}
