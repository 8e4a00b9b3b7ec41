//! Incremental request parser.
//!
//! Feeds bytes through the lexer and folds each completed token into an
//! [`HttpRequest`]. A request may arrive in any number of pieces: call
//! [`parse_request`] with each new piece and the same request value until it
//! reports [`Status::Finished`].

use tracing::debug;

use crate::error::ParseError;
use crate::http::context::TokenType;
use crate::http::lexer::{self, Cursor, Lexed};
use crate::http::request::{HttpRequest, Method};

/// Progress after feeding one piece of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Every byte was consumed and more are needed.
    Partial,
    /// The request is complete after consuming this many bytes. Anything
    /// past that belongs to the next request on the connection.
    Finished(usize),
}

/// Advances `request` with the bytes in `buf`.
///
/// An error means the request is malformed; the caller must not feed it any
/// more input.
pub fn parse_request(buf: &[u8], request: &mut HttpRequest) -> Result<Status, ParseError> {
    if request.finished {
        return Ok(Status::Finished(0));
    }

    let mut cursor = Cursor::new(buf);
    loop {
        match request.context.current {
            TokenType::Body => {
                if request.context.chunked || fill_body(&mut cursor, request) {
                    request.finished = true;
                    request.context.complete = true;
                    return Ok(Status::Finished(cursor.position()));
                }
                return Ok(Status::Partial);
            }
            TokenType::Chunk => {
                if !fill_chunk(&mut cursor, request) {
                    return Ok(Status::Partial);
                }
                request.context.current = TokenType::ChunkOctet;
                continue;
            }
            _ => {}
        }

        match lexer::next_token(&mut request.context, &mut cursor)? {
            Lexed::Incomplete => return Ok(Status::Partial),
            Lexed::Complete => apply_token(request)?,
        }
    }
}

/// Parses a complete request held in one buffer.
///
/// Returns the request and the number of bytes it spans, or
/// [`ParseError::Incomplete`] when `buf` ends before the request does.
pub fn parse_http_request(buf: &[u8]) -> Result<(HttpRequest, usize), ParseError> {
    let mut request = HttpRequest::new();
    match parse_request(buf, &mut request)? {
        Status::Finished(consumed) => Ok((request, consumed)),
        Status::Partial => Err(ParseError::Incomplete),
    }
}

fn apply_token(request: &mut HttpRequest) -> Result<(), ParseError> {
    let token = request.context.take_token();

    match request.context.current {
        TokenType::RequestMethod => {
            request.method = Method::from_str(&token).ok_or(ParseError::InvalidMethod(token))?;
        }
        TokenType::RequestUri => request.set_uri(token),
        TokenType::HttpVersion => request.version = token,
        TokenType::HeaderName => {
            request.context.last_header = Some(token.trim().to_ascii_lowercase());
        }
        TokenType::HeaderValue => {
            let continuation = std::mem::take(&mut request.context.continuation);
            if let Some(name) = request.context.last_header.clone() {
                if continuation {
                    request.fold_header(&name, token.trim());
                } else {
                    request.push_header(name, token.trim());
                }
            }
        }
        TokenType::Body => start_body(request)?,
        TokenType::ChunkOctet => start_chunk(request, &token)?,
        _ => {}
    }
    Ok(())
}

fn start_body(request: &mut HttpRequest) -> Result<(), ParseError> {
    // Trailers after the last chunk end the same way the header block does.
    if request.context.chunked {
        return Ok(());
    }

    let length = match request.header("content-length") {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?,
        None => 0,
    };

    if length == 0 && request.is_chunked() {
        debug!(uri = %request.uri, "reading chunked body");
        request.context.chunked = true;
        request.context.current = TokenType::ChunkOctet;
    }
    Ok(())
}

fn start_chunk(request: &mut HttpRequest, line: &str) -> Result<(), ParseError> {
    let size = line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size, 16)
        .map_err(|_| ParseError::InvalidChunkSize(line.to_string()))?;

    let ctx = &mut request.context;
    if size == 0 {
        ctx.current = TokenType::NoChunk;
    } else {
        ctx.chunk_remaining = size;
        ctx.await_lf = ctx.separator == b'\r';
        ctx.current = TokenType::Chunk;
    }
    Ok(())
}

/// Copies body bytes up to `Content-Length`. Returns `true` once satisfied.
fn fill_body(cursor: &mut Cursor<'_>, request: &mut HttpRequest) -> bool {
    let length = request.content_length();
    let missing = length.saturating_sub(request.body.len());
    if missing > 0 {
        let bytes = cursor.take(missing);
        request.body.put(bytes);
    }
    request.body.len() >= length
}

/// Copies chunk data. Returns `true` once the current chunk is complete.
fn fill_chunk(cursor: &mut Cursor<'_>, request: &mut HttpRequest) -> bool {
    let ctx = &mut request.context;
    if ctx.await_lf {
        match cursor.peek() {
            None => return false,
            Some(b'\n') => {
                cursor.take(1);
            }
            Some(_) => {}
        }
        ctx.await_lf = false;
    }

    let bytes = cursor.take(ctx.chunk_remaining);
    ctx.chunk_remaining -= bytes.len();
    request.body.put(bytes);
    ctx.chunk_remaining == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (parsed, consumed) = parse_http_request(req).unwrap();

        assert_eq!(parsed.path, "/");
        assert_eq!(parsed.header("Host"), Some("example.com"));
        assert_eq!(consumed, req.len());
    }

    #[test]
    fn chunk_size_lf_may_arrive_separately() {
        let mut request = HttpRequest::new();
        let head = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r";

        assert_eq!(parse_request(head, &mut request), Ok(Status::Partial));
        assert!(request.context.await_lf);
        assert_eq!(parse_request(b"\nabc\r\n0\r\n\r\n", &mut request), Ok(Status::Finished(11)));
        assert_eq!(request.body(), b"abc");
    }

    #[test]
    fn leading_blank_lines_are_skipped() {
        let (parsed, _) = parse_http_request(b"\r\n\r\nGET /x HTTP/1.0\r\n\r\n").unwrap();

        assert_eq!(parsed.path, "/x");
        assert!(!parsed.keep_alive());
    }
}
