use std::io;

use thiserror::Error;

use crate::http::context::TokenType;

/// Transport failures surfaced through socket callbacks.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("end of stream reached before the read completed")]
    EndOfStream,

    #[error("could not resolve {host}")]
    Unresolvable { host: String },

    #[error("socket is closed")]
    Closed,
}

/// Reasons a request could not be parsed.
///
/// Everything except [`ParseError::Incomplete`] marks the request as
/// malformed; the bytes are not retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("request is incomplete")]
    Incomplete,

    #[error("unrecognized method {0:?}")]
    InvalidMethod(String),

    #[error("malformed request line")]
    InvalidRequestLine,

    #[error("malformed header")]
    InvalidHeader,

    #[error("{token:?} token longer than {limit} bytes")]
    TokenTooLong { token: TokenType, limit: usize },

    #[error("invalid chunk size {0:?}")]
    InvalidChunkSize(String),

    #[error("invalid content length")]
    InvalidContentLength,
}

impl ParseError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Incomplete)
    }
}
