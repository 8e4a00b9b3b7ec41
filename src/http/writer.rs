use crate::http::response::{Response, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Value of the `Server` header on every response.
pub const SERVER_NAME: &str = concat!("warden/", env!("CARGO_PKG_VERSION"));

/// Serializes `resp` into wire format.
///
/// `Server` and `Connection` headers are added unless the response already
/// carries them. With `head_only` the body is left out while
/// `Content-Length` still describes it.
pub fn serialize_response(resp: &Response, keep_alive: bool, head_only: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128 + resp.body.len());

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    let has = |name: &str| resp.headers.keys().any(|k| k.eq_ignore_ascii_case(name));
    if !has("Server") {
        push_header(&mut buf, "Server", SERVER_NAME);
    }
    if !has("Connection") {
        push_header(&mut buf, "Connection", if keep_alive { "Keep-Alive" } else { "Close" });
    }
    for (k, v) in &resp.headers {
        push_header(&mut buf, k, v);
    }

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    if !head_only {
        buf.extend_from_slice(&resp.body);
    }
    buf
}

/// The interim response sent before reading an expected body.
pub fn serialize_continue() -> Vec<u8> {
    format!(
        "{} {} {}\r\n\r\n",
        HTTP_VERSION,
        StatusCode::Continue.as_u16(),
        StatusCode::Continue.reason_phrase()
    )
    .into_bytes()
}

fn push_header(buf: &mut Vec<u8>, name: &str, value: &str) {
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
}
