//! Resumable tokenizer for HTTP/1.x request heads and chunk-size lines.
//!
//! Each call to [`next_token`] reads at most one token. State lives in the
//! [`ParsingContext`], so a token may be split across any number of reads:
//!
//! ```text
//!   state            separator   forbidden   completes as
//!   ─────────────────────────────────────────────────────────
//!   (start)          SP          CR LF       RequestMethod
//!   RequestMethod    SP          CR LF       RequestUri
//!   RequestUri       CR | LF     -           HttpVersion
//!   HttpVersion      line start              HeaderName | Body
//!   HeaderName       ':'         CR LF       HeaderValue
//!   HeaderValue      line start              HeaderName | HeaderValue (folded) | Body
//!   ChunkOctet       CR | LF     -           ChunkOctet
//!   NoChunk          line start              HeaderName | Body
//! ```
//!
//! A second LF at a line start ends the header block.

use crate::error::ParseError;
use crate::http::context::{ParsingContext, TokenType};

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const SP: u8 = b' ';
const TAB: u8 = b'\t';
const COLON: u8 = b':';

/// Outcome of a successful lexer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lexed {
    /// The input ran out before a token ended; call again with more bytes.
    Incomplete,
    /// A token ended; its kind is `ctx.current()`.
    Complete,
}

/// Read position over one inbound chunk of bytes.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    /// Takes up to `n` bytes.
    pub fn take(&mut self, n: usize) -> &'a [u8] {
        let end = (self.pos + n).min(self.buf.len());
        let taken = &self.buf[self.pos..end];
        self.pos = end;
        taken
    }

    fn next_byte(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }
}

/// Reads the next token from `cursor` into `ctx`.
pub fn next_token(ctx: &mut ParsingContext, cursor: &mut Cursor<'_>) -> Result<Lexed, ParseError> {
    if let Some(kind) = ctx.pending {
        return next_word(ctx, cursor, kind);
    }
    ctx.token.clear();

    match ctx.current {
        TokenType::RequestLine => {
            if skip_leading_whitespace(cursor) {
                next_word(ctx, cursor, TokenType::RequestMethod)
            } else {
                Ok(Lexed::Incomplete)
            }
        }
        TokenType::RequestMethod => next_word(ctx, cursor, TokenType::RequestUri),
        TokenType::RequestUri => next_word(ctx, cursor, TokenType::HttpVersion),
        TokenType::HeaderName => next_word(ctx, cursor, TokenType::HeaderValue),
        TokenType::HttpVersion | TokenType::HeaderValue | TokenType::NoChunk => line_start(ctx, cursor),
        TokenType::ChunkOctet => {
            while matches!(cursor.peek(), Some(CR | LF)) {
                cursor.next_byte();
            }
            if cursor.remaining() == 0 {
                return Ok(Lexed::Incomplete);
            }
            next_word(ctx, cursor, TokenType::ChunkOctet)
        }
        TokenType::Body | TokenType::Chunk => Ok(Lexed::Incomplete),
    }
}

fn skip_leading_whitespace(cursor: &mut Cursor<'_>) -> bool {
    while let Some(byte) = cursor.peek() {
        if !matches!(byte, CR | LF | SP) {
            return true;
        }
        cursor.next_byte();
    }
    false
}

/// Handles the bytes that follow a line-terminated token.
fn line_start(ctx: &mut ParsingContext, cursor: &mut Cursor<'_>) -> Result<Lexed, ParseError> {
    while let Some(byte) = cursor.peek() {
        match byte {
            LF => {
                cursor.next_byte();
                ctx.line_breaks += 1;
                if ctx.line_breaks >= 2 {
                    ctx.current = TokenType::Body;
                    ctx.line_breaks = 0;
                    return Ok(Lexed::Complete);
                }
            }
            CR => {
                cursor.next_byte();
            }
            SP | TAB if ctx.current == TokenType::HeaderValue && ctx.line_breaks >= 1 => {
                cursor.next_byte();
                ctx.continuation = true;
                return next_word(ctx, cursor, TokenType::HeaderValue);
            }
            _ => return next_word(ctx, cursor, TokenType::HeaderName),
        }
    }
    Ok(Lexed::Incomplete)
}

fn next_word(ctx: &mut ParsingContext, cursor: &mut Cursor<'_>, kind: TokenType) -> Result<Lexed, ParseError> {
    let limit = kind.max_length();
    ctx.pending = None;

    while let Some(byte) = cursor.next_byte() {
        if is_forbidden(kind, byte) {
            return Err(match kind {
                TokenType::HeaderName => ParseError::InvalidHeader,
                _ => ParseError::InvalidRequestLine,
            });
        }
        if is_separator(kind, byte) {
            ctx.current = kind;
            ctx.separator = byte;
            ctx.line_breaks = usize::from(byte == LF);
            return Ok(Lexed::Complete);
        }
        ctx.token.push(byte);
        if ctx.token.len() > limit {
            return Err(ParseError::TokenTooLong { token: kind, limit });
        }
    }

    ctx.pending = Some(kind);
    Ok(Lexed::Incomplete)
}

fn is_separator(kind: TokenType, byte: u8) -> bool {
    match kind {
        TokenType::RequestMethod | TokenType::RequestUri => byte == SP,
        TokenType::HeaderName => byte == COLON,
        _ => byte == CR || byte == LF,
    }
}

fn is_forbidden(kind: TokenType, byte: u8) -> bool {
    match kind {
        TokenType::RequestMethod | TokenType::RequestUri | TokenType::HeaderName => {
            byte == CR || byte == LF
        }
        _ => false,
    }
}
