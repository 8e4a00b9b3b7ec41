/// Kind of the last token the lexer completed.
///
/// The parser also moves the context into `Body`, `ChunkOctet`, `Chunk` and
/// `NoChunk` directly while it reads a message body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TokenType {
    /// Nothing read yet; leading blank lines and spaces are skipped.
    #[default]
    RequestLine,
    RequestMethod,
    RequestUri,
    HttpVersion,
    HeaderName,
    HeaderValue,
    /// Header block finished.
    Body,
    /// A chunk-size line (or waiting for the next one).
    ChunkOctet,
    /// Inside chunk data.
    Chunk,
    /// Last chunk read; trailers may follow.
    NoChunk,
}

impl TokenType {
    /// Longest accepted text for tokens of this kind.
    pub fn max_length(self) -> usize {
        match self {
            TokenType::RequestMethod => 7,
            TokenType::RequestUri => 255,
            TokenType::HttpVersion => 10,
            TokenType::HeaderName => 30,
            TokenType::HeaderValue | TokenType::ChunkOctet => 300,
            _ => 0,
        }
    }
}

/// Parse state carried by a request between partial reads.
#[derive(Debug, Default)]
pub struct ParsingContext {
    pub(crate) current: TokenType,
    /// Kind of the word whose text is still being accumulated.
    pub(crate) pending: Option<TokenType>,
    pub(crate) token: Vec<u8>,
    /// Byte that ended the last completed token.
    pub(crate) separator: u8,
    /// LFs seen since the last line-terminated token.
    pub(crate) line_breaks: usize,
    pub(crate) last_header: Option<String>,
    /// The pending header value continues a folded line.
    pub(crate) continuation: bool,
    pub(crate) chunk_remaining: usize,
    pub(crate) chunked: bool,
    /// An LF may still follow the CR that ended a chunk-size line.
    pub(crate) await_lf: bool,
    pub(crate) complete: bool,
}

impl ParsingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> TokenType {
        self.current
    }

    /// Whether the lexer is in the middle of a token.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn last_header(&self) -> Option<&str> {
        self.last_header.as_deref()
    }

    /// Takes the accumulated token text, decoded as ISO-8859-1.
    pub(crate) fn take_token(&mut self) -> String {
        let text = self.token.iter().map(|&b| b as char).collect();
        self.token.clear();
        text
    }
}
