//! HTTP/1.x over the event loop.
//!
//! [`HttpProtocol`] accepts connections on a listener, feeds inbound bytes to
//! the request parser, hands finished requests to a [`RequestHandler`] and
//! writes the responses back, all on the loop thread.
//!
//! # Connection lifecycle
//!
//! ```text
//!   accept ──► reading ◄──────────────┐
//!                 │ request finished   │ keep-alive (timer re-armed)
//!                 ▼                    │
//!              handler ──► writing ────┤
//!                                      │ close / HTTP/1.0 / malformed
//!                                      ▼
//!                                   closed
//! ```
//!
//! An idle connection is closed when its keep-alive timer fires. The timer
//! is re-armed on accept, after every partial flush and once a response has
//! been fully written.
//!
//! Connections are driven on the raw `mio` stream rather than through
//! [`AsyncSocket`](crate::io::socket::AsyncSocket): pipelined requests need
//! every byte of a read, not one delimiter at a time. Writes still drain
//! through the socket layer's [`flush_buffer`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use mio::Token;
use mio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::ParseError;
use crate::http::handler::RequestHandler;
use crate::http::parser::{Status, parse_request};
use crate::http::request::{HttpRequest, Method};
use crate::http::response::Response;
use crate::http::writer::{serialize_continue, serialize_response};
use crate::io::buffer::GrowableBuffer;
use crate::io::event_loop::{EventLoop, IoHandler, Ops};
use crate::io::socket::{DEFAULT_BUFFER_SIZE, flush_buffer};
use crate::io::timeout::Timeout;

/// Per-loop protocol settings.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub keep_alive_timeout: Duration,
    pub read_buffer_size: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    request: Option<HttpRequest>,
    write_buffer: GrowableBuffer,
    close_after_write: bool,
    continue_sent: bool,
    ops: Ops,
}

enum Step {
    Wait,
    SendContinue,
    Dispatch(HttpRequest),
    Malformed(ParseError),
}

pub struct HttpProtocol {
    this: Weak<HttpProtocol>,
    event_loop: EventLoop,
    handler: Arc<dyn RequestHandler>,
    settings: ProtocolSettings,
    listener: RefCell<Option<(TcpListener, Token)>>,
    connections: RefCell<HashMap<Token, Connection>>,
}

impl HttpProtocol {
    pub fn new(
        event_loop: &EventLoop,
        handler: Arc<dyn RequestHandler>,
        settings: ProtocolSettings,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            event_loop: event_loop.clone(),
            handler,
            settings,
            listener: RefCell::new(None),
            connections: RefCell::new(HashMap::new()),
        })
    }

    /// Starts accepting connections from `listener` on this loop.
    pub fn listen(&self, mut listener: TcpListener) -> io::Result<Token> {
        let token = self
            .event_loop
            .register(&mut listener, self.as_handler()?, Ops::ACCEPT)
            .ok_or_else(|| io::Error::other("could not register listener"))?;
        if let Ok(addr) = listener.local_addr() {
            debug!(loop_id = self.event_loop.id(), %addr, "accepting connections");
        }
        *self.listener.borrow_mut() = Some((listener, token));
        Ok(token)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.borrow().len()
    }

    fn as_handler(&self) -> io::Result<Rc<dyn IoHandler>> {
        let this = self
            .this
            .upgrade()
            .ok_or_else(|| io::Error::other("protocol handler dropped"))?;
        Ok(this as Rc<dyn IoHandler>)
    }

    fn accept(&self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let Some(token) = self
            .event_loop
            .register(&mut stream, self.as_handler()?, Ops::READ)
        else {
            return Ok(());
        };
        info!(loop_id = self.event_loop.id(), %peer, "accepted connection");

        self.connections.borrow_mut().insert(
            token,
            Connection {
                stream,
                peer,
                request: None,
                write_buffer: GrowableBuffer::allocate(DEFAULT_BUFFER_SIZE),
                close_after_write: false,
                continue_sent: false,
                ops: Ops::READ,
            },
        );
        self.arm_keep_alive(token);
        Ok(())
    }

    fn process(&self, token: Token, data: &[u8]) {
        let mut offset = 0;
        while offset < data.len() {
            let step = {
                let mut connections = self.connections.borrow_mut();
                let Some(conn) = connections.get_mut(&token) else {
                    return;
                };
                if conn.close_after_write {
                    return;
                }
                let peer = conn.peer;
                let request = conn.request.get_or_insert_with(|| {
                    let mut request = HttpRequest::new();
                    request.remote_addr = Some(peer);
                    request
                });

                match parse_request(&data[offset..], request) {
                    Ok(Status::Partial) => {
                        offset = data.len();
                        if request.expect_continue() && !conn.continue_sent {
                            conn.continue_sent = true;
                            Step::SendContinue
                        } else {
                            Step::Wait
                        }
                    }
                    Ok(Status::Finished(consumed)) => {
                        offset += consumed;
                        conn.continue_sent = false;
                        match conn.request.take() {
                            Some(request) => Step::Dispatch(request),
                            None => Step::Wait,
                        }
                    }
                    Err(e) => {
                        conn.request = None;
                        Step::Malformed(e)
                    }
                }
            };

            match step {
                Step::Wait => {}
                Step::SendContinue => self.queue(token, &serialize_continue(), false),
                Step::Dispatch(request) => self.dispatch(token, request),
                Step::Malformed(e) => {
                    debug!(token = token.0, error = %e, "malformed request");
                    let bytes = serialize_response(&Response::bad_request(), false, false);
                    self.queue(token, &bytes, true);
                    return;
                }
            }
        }
    }

    fn dispatch(&self, token: Token, request: HttpRequest) {
        let keep_alive = request.keep_alive();
        let head_only = request.method == Method::HEAD;

        let response = match panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(&request))) {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                debug!(error = %err, "handler returned an error");
                Response::from(err)
            }
            Err(_) => {
                error!(path = %request.path, "request handler panicked");
                Response::internal_error()
            }
        };

        info!(
            method = %request.method,
            path = %request.path,
            status = response.status.as_u16(),
            "request handled"
        );
        let bytes = serialize_response(&response, keep_alive, head_only);
        self.queue(token, &bytes, !keep_alive);
    }

    fn queue(&self, token: Token, bytes: &[u8], close_after_write: bool) {
        {
            let mut connections = self.connections.borrow_mut();
            let Some(conn) = connections.get_mut(&token) else {
                return;
            };
            conn.write_buffer.put(bytes);
            conn.close_after_write |= close_after_write;
        }
        self.flush(token);
    }

    fn flush(&self, token: Token) {
        let result = {
            let mut connections = self.connections.borrow_mut();
            let Some(conn) = connections.get_mut(&token) else {
                return;
            };
            flush_buffer(&mut conn.stream, &mut conn.write_buffer).map(|done| (done, conn.close_after_write))
        };

        match result {
            Ok((true, true)) => self.close(token),
            Ok((true, false)) => {
                self.set_interest(token, Ops::READ);
                self.arm_keep_alive(token);
            }
            Ok((false, closing)) => {
                let ops = if closing { Ops::WRITE } else { Ops::READ | Ops::WRITE };
                self.set_interest(token, ops);
                // A client still draining the response is not idle.
                self.arm_keep_alive(token);
            }
            Err(e) => {
                debug!(token = token.0, error = %e, "write failed");
                self.close(token);
            }
        }
    }

    fn set_interest(&self, token: Token, ops: Ops) {
        let mut connections = self.connections.borrow_mut();
        if let Some(conn) = connections.get_mut(&token) {
            if conn.ops != ops {
                self.event_loop.update_interest(&mut conn.stream, token, ops);
                conn.ops = ops;
            }
        }
    }

    fn arm_keep_alive(&self, token: Token) {
        let this = self.this.clone();
        self.event_loop.add_keep_alive_timeout(
            token,
            Timeout::after(self.settings.keep_alive_timeout, move || {
                if let Some(protocol) = this.upgrade() {
                    debug!(token = token.0, "keep-alive timeout expired");
                    protocol.close(token);
                }
            }),
        );
    }

    fn close(&self, token: Token) {
        let removed = self.connections.borrow_mut().remove(&token);
        if let Some(mut conn) = removed {
            self.event_loop.deregister(&mut conn.stream, token);
            self.event_loop.cancel_keep_alive_timeout(token);
            debug!(token = token.0, peer = %conn.peer, "connection closed");
        }
    }
}

impl IoHandler for HttpProtocol {
    fn on_acceptable(&self, token: Token) -> io::Result<()> {
        loop {
            let accepted = {
                let listener = self.listener.borrow();
                match listener.as_ref() {
                    Some((listener, listening)) if *listening == token => listener.accept(),
                    _ => return Ok(()),
                }
            };
            match accepted {
                Ok((stream, peer)) => self.accept(stream, peer)?,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return Err(e);
                }
            }
        }
    }

    fn on_readable(&self, token: Token) -> io::Result<()> {
        let read = {
            let mut connections = self.connections.borrow_mut();
            let Some(conn) = connections.get_mut(&token) else {
                return Ok(());
            };
            read_available(&mut conn.stream, self.settings.read_buffer_size)
        };

        let (data, eof) = match read {
            Ok(read) => read,
            Err(e) => {
                self.close(token);
                return Err(e);
            }
        };

        if !data.is_empty() {
            self.process(token, &data);
        }

        if eof {
            let idle = self
                .connections
                .borrow()
                .get(&token)
                .is_some_and(|conn| conn.write_buffer.is_empty());
            if idle {
                self.close(token);
            } else {
                if let Some(conn) = self.connections.borrow_mut().get_mut(&token) {
                    conn.close_after_write = true;
                }
                self.set_interest(token, Ops::WRITE);
            }
        }
        Ok(())
    }

    fn on_writable(&self, token: Token) -> io::Result<()> {
        self.flush(token);
        Ok(())
    }
}

/// Reads until the stream would block. The flag reports end of stream.
fn read_available(stream: &mut TcpStream, chunk_size: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut data = Vec::new();
    let mut chunk = vec![0u8; chunk_size.max(1)];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok((data, true)),
            Ok(n) => data.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((data, false)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
