use std::cell::OnceCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::net::SocketAddr;

use url::form_urlencoded;

use crate::http::context::ParsingContext;
use crate::io::buffer::GrowableBuffer;

const BODY_CAPACITY: usize = 64;

/// HTTP request methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    #[default]
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// TRACE - Loop the request back
    TRACE,
    /// CONNECT - Open a tunnel
    CONNECT,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// Matching is case-sensitive.
    ///
    /// ```
    /// # use warden::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "TRACE" => Some(Method::TRACE),
            "CONNECT" => Some(Method::CONNECT),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::TRACE => "TRACE",
            Method::CONNECT => "CONNECT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request under construction or fully parsed.
///
/// The parser fills it in incrementally; once [`HttpRequest::is_finished`]
/// returns `true` nothing changes it anymore. Header names are stored
/// lowercased.
#[derive(Debug, Default)]
pub struct HttpRequest {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Request target as sent, including any query string
    pub uri: String,
    /// Path part of the target
    pub path: String,
    /// HTTP version (typically "HTTP/1.1")
    pub version: String,
    /// Request headers, keyed by lowercased name
    pub headers: HashMap<String, String>,
    /// Decoded query parameters
    pub params: HashMap<String, Vec<String>>,
    pub remote_addr: Option<SocketAddr>,
    pub(crate) body: GrowableBuffer,
    pub(crate) context: ParsingContext,
    pub(crate) finished: bool,
    cookies: OnceCell<HashMap<String, String>>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            body: GrowableBuffer::allocate(BODY_CAPACITY),
            ..Default::default()
        }
    }

    /// `METHOD URI VERSION`, as received.
    pub fn request_line(&self) -> String {
        format!("{} {} {}", self.method, self.uri, self.version)
    }

    /// Looks a header up by name, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    /// First value of a query parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .and_then(|values| values.first())
            .map(|v| v.as_str())
    }

    pub fn parameter_values(&self, name: &str) -> &[String] {
        self.params.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Cookies from the `Cookie` header, parsed on first access.
    pub fn cookies(&self) -> &HashMap<String, String> {
        self.cookies.get_or_init(|| {
            self.header("cookie")
                .map(parse_cookies)
                .unwrap_or_default()
        })
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().get(name).map(|v| v.as_str())
    }

    pub fn body(&self) -> &[u8] {
        self.body.as_slice()
    }

    /// The `Content-Length` header value, or 0 when missing or invalid.
    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Whether the connection should stay open after the response.
    ///
    /// An explicit `Connection` header decides; otherwise HTTP/1.1 keeps the
    /// connection alive and older versions close it.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version == "HTTP/1.1",
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The client is waiting for `100 Continue` before sending the body.
    pub fn expect_continue(&self) -> bool {
        self.header("expect").is_some() && self.body.is_empty()
    }

    pub fn context(&self) -> &ParsingContext {
        &self.context
    }

    pub(crate) fn set_uri(&mut self, uri: String) {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (uri.clone(), None),
        };
        self.path = path;
        if let Some(query) = query {
            for (name, value) in parse_query(&query) {
                self.params.entry(name).or_default().push(value);
            }
        }
        self.uri = uri;
    }

    /// Adds a header, joining repeated names with `;`.
    pub(crate) fn push_header(&mut self, name: String, value: &str) {
        match self.headers.entry(name) {
            Entry::Occupied(mut entry) => {
                let joined = entry.get_mut();
                joined.push(';');
                joined.push_str(value);
            }
            Entry::Vacant(entry) => {
                entry.insert(value.to_string());
            }
        }
    }

    /// Appends a folded continuation line to the last header.
    pub(crate) fn fold_header(&mut self, name: &str, value: &str) {
        if let Some(existing) = self.headers.get_mut(name) {
            if !value.is_empty() {
                existing.push(' ');
                existing.push_str(value);
            }
        } else {
            self.push_header(name.to_string(), value);
        }
    }
}

/// Decodes a query string. `&` and `;` both separate pairs; pairs without a
/// value are dropped.
fn parse_query(query: &str) -> Vec<(String, String)> {
    let normalized = query.replace(';', "&");
    form_urlencoded::parse(normalized.as_bytes())
        .filter(|(name, value)| !name.is_empty() && !value.is_empty())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}

fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .collect()
}
