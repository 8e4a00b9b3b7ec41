//! Warden - non-blocking HTTP server core
//!
//! A single-threaded reactor (`io`) with timers, deferred callbacks and
//! buffered sockets, and a resumable HTTP/1.x request parser (`http`) that
//! assembles requests across any number of partial reads.

pub mod config;
pub mod error;
pub mod http;
pub mod io;
pub mod server;

pub use error::{ParseError, SocketError};
