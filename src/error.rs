use std::io;

use thiserror::Error;

/// Error kinds surfaced to the host through the error callback.
///
/// The `Display` form is the human-readable error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("out of memory")]
    NoMem,
    #[error("accept() error")]
    Accept,
    #[error("listen() error")]
    Listen,
    #[error("socket error")]
    Socket,
    #[error("bind() error")]
    Bind,
    #[error("close() error")]
    Close,
    #[error("header too big")]
    HeaderTooBig,
    #[error("select() error")]
    Select,
    #[error("write() error")]
    Write,
}

/// Internal failure: the host-visible kind plus the OS-level cause.
#[derive(Debug, Error)]
#[error("{kind}: {source}")]
pub(crate) struct SysError {
    pub kind: ErrorKind,
    #[source]
    pub source: io::Error,
}

impl SysError {
    pub fn new(kind: ErrorKind, source: io::Error) -> Self {
        Self { kind, source }
    }

    pub fn last_os(kind: ErrorKind) -> Self {
        Self::new(kind, io::Error::last_os_error())
    }
}
