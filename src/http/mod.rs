//! HTTP/1.x protocol implementation.
//!
//! # Architecture
//!
//! - **`lexer`**: resumable tokenizer; one token per call
//! - **`context`**: parse state that survives between partial reads
//! - **`parser`**: folds tokens into an [`request::HttpRequest`], reads bodies
//! - **`request`**: parsed request and its accessors
//! - **`response`**: status codes, responses and the builder
//! - **`writer`**: response serialization
//! - **`handler`**: the request handler seam
//! - **`protocol`**: connection handling on top of the event loop
//!
//! # Request assembly
//!
//! ```text
//!   bytes ──► lexer ──► token ──► parser ──► HttpRequest
//!               ▲                    │
//!               └──── Partial ◄──────┤ (wait for the next read)
//!                                    └──► Finished(consumed)
//! ```

pub mod context;
pub mod handler;
pub mod lexer;
pub mod parser;
pub mod protocol;
pub mod request;
pub mod response;
pub mod writer;

pub use handler::RequestHandler;
pub use parser::{Status, parse_http_request, parse_request};
pub use protocol::{HttpProtocol, ProtocolSettings};
pub use request::{HttpRequest, Method};
pub use response::{HttpError, Response, ResponseBuilder, StatusCode};
