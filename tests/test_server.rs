use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use warden::config::ServerConfig;
use warden::http::request::HttpRequest;
use warden::http::response::{HttpError, Response};
use warden::server::HttpServer;

const LARGE_BODY: usize = 16 << 20;

fn routes(req: &HttpRequest) -> Result<Response, HttpError> {
    match req.path.as_str() {
        "/" => Ok(Response::ok("hello")),
        "/echo" => Ok(Response::ok(req.body().to_vec())),
        "/greet" => Ok(Response::ok(format!(
            "hi {}",
            req.parameter("name").unwrap_or("stranger")
        ))),
        "/large" => Ok(Response::ok(vec![b'x'; LARGE_BODY])),
        "/panic" => panic!("handler failure"),
        _ => Err(HttpError::not_found("no route")),
    }
}

fn start_server(config: ServerConfig) -> (HttpServer, SocketAddr) {
    let mut server = HttpServer::new(config, routes);
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        poll_timeout_ms: 20,
        ..ServerConfig::default()
    }
}

struct Client {
    reader: BufReader<TcpStream>,
}

#[derive(Debug)]
struct Reply {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self {
            reader: BufReader::new(stream),
        }
    }

    fn send(&mut self, raw: &[u8]) {
        self.reader.get_mut().write_all(raw).unwrap();
    }

    /// Reads one response. `head` skips the body even if a length is given.
    fn read_reply(&mut self, head: bool) -> Reply {
        let mut status_line = String::new();
        self.reader.read_line(&mut status_line).unwrap();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap_or_else(|| panic!("bad status line {status_line:?}"));

        let mut headers = HashMap::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').unwrap();
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        let length = if head {
            0
        } else {
            headers
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };
        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).unwrap();
        Reply {
            status,
            headers,
            body,
        }
    }

    fn request(&mut self, raw: &[u8]) -> Reply {
        self.send(raw);
        self.read_reply(false)
    }

    /// True when the server closed the connection.
    fn is_closed(&mut self) -> bool {
        let mut rest = Vec::new();
        matches!(self.reader.read_to_end(&mut rest), Ok(0))
    }
}

#[test]
fn test_get_root() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    let reply = client.request(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"hello");
    assert_eq!(reply.header("Content-Length"), Some("5"));
    assert_eq!(reply.header("Connection"), Some("Keep-Alive"));
    assert!(reply.header("Server").unwrap().starts_with("warden/"));

    server.stop();
    assert!(!server.is_running());
}

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    let first = client.request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    let second = client.request(b"GET /greet?name=ada HTTP/1.1\r\nHost: h\r\n\r\n");
    let third = client.request(b"GET /missing HTTP/1.1\r\nHost: h\r\n\r\n");

    assert_eq!(first.body, b"hello");
    assert_eq!(second.body, b"hi ada");
    assert_eq!(third.status, 404);
    assert_eq!(third.body, b"no route");

    server.stop();
}

#[test]
fn test_pipelined_requests_in_one_segment() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    client.send(
        b"GET /greet?name=one HTTP/1.1\r\nHost: h\r\n\r\n\
          POST /echo HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\ntwo\
          GET /greet?name=three HTTP/1.1\r\nHost: h\r\n\r\n",
    );

    assert_eq!(client.read_reply(false).body, b"hi one");
    assert_eq!(client.read_reply(false).body, b"two");
    assert_eq!(client.read_reply(false).body, b"hi three");

    server.stop();
}

#[test]
fn test_request_split_across_writes() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    for piece in [&b"PO"[..], b"ST /ec", b"ho HTTP/1.1\r\nContent-Le", b"ngth: 6\r\n\r", b"\nabc", b"def"] {
        client.send(piece);
        std::thread::sleep(Duration::from_millis(10));
    }

    let reply = client.read_reply(false);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"abcdef");

    server.stop();
}

#[test]
fn test_http10_closes_after_response() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    let reply = client.request(b"GET / HTTP/1.0\r\n\r\n");

    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Connection"), Some("Close"));
    assert!(client.is_closed());

    server.stop();
}

#[test]
fn test_connection_close_header() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    let reply = client.request(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");

    assert_eq!(reply.header("Connection"), Some("Close"));
    assert!(client.is_closed());

    server.stop();
}

#[test]
fn test_malformed_request_gets_400_and_close() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    let reply = client.request(b"BREW /pot HTTP/1.1\r\n\r\n");

    assert_eq!(reply.status, 400);
    assert_eq!(reply.body, b"400 Bad Request");
    assert!(client.is_closed());

    server.stop();
}

#[test]
fn test_expect_continue() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    client.send(b"POST /echo HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n");
    let interim = client.read_reply(false);
    assert_eq!(interim.status, 100);
    assert!(interim.headers.is_empty());

    let reply = client.request(b"hello");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"hello");

    server.stop();
}

#[test]
fn test_chunked_post_is_echoed() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    let reply = client.request(
        b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
          4\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n",
    );

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"Wikipedia in\r\n\r\nchunks.");

    server.stop();
}

#[test]
fn test_head_has_no_body() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    client.send(b"HEAD / HTTP/1.1\r\nHost: h\r\n\r\n");
    let head = client.read_reply(true);
    assert_eq!(head.status, 200);
    assert_eq!(head.header("Content-Length"), Some("5"));

    // Any stray body bytes would corrupt the next status line.
    let next = client.request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    assert_eq!(next.status, 200);
    assert_eq!(next.body, b"hello");

    server.stop();
}

#[test]
fn test_handler_panic_becomes_500() {
    let (mut server, addr) = start_server(test_config());
    let mut client = Client::connect(addr);

    let reply = client.request(b"GET /panic HTTP/1.1\r\nHost: h\r\n\r\n");
    assert_eq!(reply.status, 500);

    let next = client.request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    assert_eq!(next.status, 200);

    server.stop();
}

#[test]
fn test_idle_connection_closed_by_keep_alive_timeout() {
    let config = ServerConfig {
        keep_alive_timeout_ms: 100,
        ..test_config()
    };
    let (mut server, addr) = start_server(config);
    let mut client = Client::connect(addr);

    let reply = client.request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    assert_eq!(reply.status, 200);

    let idle_since = Instant::now();
    assert!(client.is_closed());
    assert!(idle_since.elapsed() >= Duration::from_millis(50));

    server.stop();
}

#[test]
fn test_slow_reader_receives_whole_response() {
    let config = ServerConfig {
        keep_alive_timeout_ms: 300,
        ..test_config()
    };
    let (mut server, addr) = start_server(config);
    let mut client = Client::connect(addr);

    client.send(b"GET /large HTTP/1.1\r\nHost: h\r\n\r\n");
    let head = client.read_reply(true);
    assert_eq!(head.status, 200);
    let length: usize = head.header("Content-Length").unwrap().parse().unwrap();
    assert_eq!(length, LARGE_BODY);

    // Draining takes several keep-alive periods.
    let mut chunk = vec![0u8; 512 << 10];
    let mut received = 0;
    while received < length {
        let want = chunk.len().min(length - received);
        match client.reader.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(e) => panic!("read failed after {received} bytes: {e}"),
        }
        std::thread::sleep(Duration::from_millis(40));
    }
    assert_eq!(received, length);

    let next = client.request(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
    assert_eq!(next.body, b"hello");

    server.stop();
}

#[test]
fn test_multiple_io_loops() {
    let config = ServerConfig {
        io_loops: 3,
        ..test_config()
    };
    let (mut server, addr) = start_server(config);
    assert_eq!(server.loops().len(), 3);

    let mut clients: Vec<Client> = (0..6).map(|_| Client::connect(addr)).collect();
    for (i, client) in clients.iter_mut().enumerate() {
        let raw = format!("GET /greet?name=c{i} HTTP/1.1\r\nHost: h\r\n\r\n");
        let reply = client.request(raw.as_bytes());
        assert_eq!(reply.body, format!("hi c{i}").into_bytes());
    }

    server.stop();
    assert!(server.loops().is_empty());
}

#[test]
fn test_start_twice_is_an_error() {
    let (mut server, _) = start_server(test_config());

    assert!(server.start().is_err());

    server.stop();
}
