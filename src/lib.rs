// src/lib.rs
mod error;
mod headers;
mod parser;
mod response;
mod router;
mod server;
mod session;
mod syscalls;

// Re-exports for users
pub use error::ErrorKind;
pub use router::{Handler, RouteStats};
pub use server::{DebugLevel, ErrorCallback, LogCallback, Server};
pub use session::{Session, SharedBody};
