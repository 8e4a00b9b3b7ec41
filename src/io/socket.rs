//! Buffered non-blocking TCP socket driven by an [`EventLoop`].
//!
//! At most one read, one write and one connect may be outstanding at a time;
//! starting another replaces the pending callback. Completion callbacks run
//! on the loop thread and may freely start the next operation.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;
use mio::Token;
use mio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::SocketError;
use crate::io::buffer::GrowableBuffer;
use crate::io::event_loop::{EventLoop, IoHandler, Ops};

/// Initial capacity of the per-socket read and write buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 1536;

const READ_CHUNK: usize = 4096;

pub type ReadCallback = Box<dyn FnOnce(Result<Bytes, SocketError>)>;
pub type ConnectCallback = Box<dyn FnOnce(Result<(), SocketError>)>;
pub type WriteCallback = Box<dyn FnOnce()>;
pub type CloseCallback = Box<dyn FnOnce()>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadCondition {
    Idle,
    Until(Vec<u8>),
    Exactly(usize),
}

struct SocketState {
    stream: Option<TcpStream>,
    token: Option<Token>,
    ops: Ops,
    read_buffer: GrowableBuffer,
    write_buffer: GrowableBuffer,
    condition: ReadCondition,
    reached_eof: bool,
    connected_at: Option<Instant>,
}

#[derive(Default)]
struct Callbacks {
    connect: Option<ConnectCallback>,
    read: Option<ReadCallback>,
    write: Option<WriteCallback>,
    close: Option<CloseCallback>,
}

struct SocketInner {
    event_loop: EventLoop,
    state: RefCell<SocketState>,
    callbacks: RefCell<Callbacks>,
}

enum ReadOutcome {
    Drained,
    Eof,
    Failed(io::Error),
}

/// Handle to an asynchronous socket. Clones refer to the same connection.
#[derive(Clone)]
pub struct AsyncSocket {
    inner: Rc<SocketInner>,
}

impl AsyncSocket {
    /// An unconnected socket; see [`AsyncSocket::connect`].
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_state(event_loop, None, None)
    }

    /// Wraps an already connected stream and starts watching it for reads.
    pub fn from_stream(event_loop: &EventLoop, stream: TcpStream) -> Self {
        let socket = Self::with_state(event_loop, Some(stream), Some(Instant::now()));
        socket.inner.attach(Ops::READ);
        socket
    }

    fn with_state(event_loop: &EventLoop, stream: Option<TcpStream>, connected_at: Option<Instant>) -> Self {
        Self {
            inner: Rc::new(SocketInner {
                event_loop: event_loop.clone(),
                state: RefCell::new(SocketState {
                    stream,
                    token: None,
                    ops: Ops::NONE,
                    read_buffer: GrowableBuffer::allocate(DEFAULT_BUFFER_SIZE),
                    write_buffer: GrowableBuffer::allocate(DEFAULT_BUFFER_SIZE),
                    condition: ReadCondition::Idle,
                    reached_eof: false,
                    connected_at,
                }),
                callbacks: RefCell::new(Callbacks::default()),
            }),
        }
    }

    /// Starts connecting to `host:port`.
    ///
    /// Resolution failures and refused connections are reported through
    /// `callback`; the socket is closed after a failed attempt.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        callback: impl FnOnce(Result<(), SocketError>) + 'static,
    ) {
        let addr = match (host, port).to_socket_addrs().map(|mut addrs| addrs.next()) {
            Ok(Some(addr)) => addr,
            Ok(None) | Err(_) => {
                warn!(host, port, "could not resolve address");
                callback(Err(SocketError::Unresolvable {
                    host: host.to_string(),
                }));
                return;
            }
        };

        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                callback(Err(SocketError::Io(e)));
                return;
            }
        };

        debug!(%addr, "connecting");
        {
            let mut state = self.inner.state.borrow_mut();
            state.stream = Some(stream);
            state.connected_at = None;
            state.reached_eof = false;
        }
        self.inner.callbacks.borrow_mut().connect = Some(Box::new(callback));

        if !self.inner.attach(Ops::CONNECT) {
            let callback = self.inner.callbacks.borrow_mut().connect.take();
            if let Some(callback) = callback {
                callback(Err(SocketError::Closed));
            }
            self.close();
        }
    }

    /// Delivers everything before the next occurrence of `delimiter`.
    ///
    /// The delimiter itself is consumed and not delivered. An empty
    /// delimiter never matches.
    pub fn read_until(
        &self,
        delimiter: &[u8],
        callback: impl FnOnce(Result<Bytes, SocketError>) + 'static,
    ) {
        self.inner.callbacks.borrow_mut().read = Some(Box::new(callback));
        self.inner.state.borrow_mut().condition = ReadCondition::Until(delimiter.to_vec());
        self.inner.check_read_state();
    }

    /// Delivers exactly `n` bytes.
    pub fn read_bytes(&self, n: usize, callback: impl FnOnce(Result<Bytes, SocketError>) + 'static) {
        self.inner.callbacks.borrow_mut().read = Some(Box::new(callback));
        self.inner.state.borrow_mut().condition = ReadCondition::Exactly(n);
        self.inner.check_read_state();
    }

    /// Queues `data` and flushes as much as the kernel accepts.
    ///
    /// `callback` runs once the write buffer is fully drained.
    pub fn write(&self, data: &[u8], callback: impl FnOnce() + 'static) {
        self.inner.state.borrow_mut().write_buffer.put(data);
        self.inner.callbacks.borrow_mut().write = Some(Box::new(callback));
        self.inner.do_write();
    }

    pub fn set_close_callback(&self, callback: impl FnOnce() + 'static) {
        self.inner.callbacks.borrow_mut().close = Some(Box::new(callback));
    }

    /// Deregisters and closes the connection, then runs the close callback.
    ///
    /// Pending read and write callbacks are dropped. Closing twice is a no-op.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().stream.is_none()
    }

    pub fn is_connected(&self) -> bool {
        let state = self.inner.state.borrow();
        state.stream.is_some() && state.connected_at.is_some()
    }

    /// When the connection was established, if it has been.
    pub fn connected_at(&self) -> Option<Instant> {
        self.inner.state.borrow().connected_at
    }

    pub fn token(&self) -> Option<Token> {
        self.inner.state.borrow().token
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let state = self.inner.state.borrow();
        state.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Bytes queued for writing but not yet accepted by the kernel.
    pub fn pending_write(&self) -> usize {
        self.inner.state.borrow().write_buffer.len()
    }
}

impl fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("AsyncSocket")
            .field("token", &state.token)
            .field("ops", &state.ops)
            .field("condition", &state.condition)
            .field("buffered", &state.read_buffer.len())
            .field("pending_write", &state.write_buffer.len())
            .field("reached_eof", &state.reached_eof)
            .finish()
    }
}

impl SocketInner {
    fn attach(self: &Rc<Self>, ops: Ops) -> bool {
        let handler: Rc<dyn IoHandler> = Rc::clone(self) as Rc<dyn IoHandler>;
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let Some(stream) = state.stream.as_mut() else {
            return false;
        };
        match self.event_loop.register(stream, handler, ops) {
            Some(token) => {
                state.token = Some(token);
                state.ops = ops;
                true
            }
            None => false,
        }
    }

    fn set_interest(&self, ops: Ops) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.ops == ops {
            return;
        }
        state.ops = ops;
        if let (Some(stream), Some(token)) = (state.stream.as_mut(), state.token) {
            self.event_loop.update_interest(stream, token, ops);
        }
    }

    fn interest(&self) -> Ops {
        self.state.borrow().ops
    }

    fn check_read_state(&self) {
        let result = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let ready = match &state.condition {
                ReadCondition::Idle => return,
                ReadCondition::Until(delimiter) => state.read_buffer.find(delimiter).map(|at| {
                    let data = state.read_buffer.split_to(at);
                    state.read_buffer.advance(delimiter.len());
                    data
                }),
                ReadCondition::Exactly(n) => {
                    let n = *n;
                    (state.read_buffer.len() >= n).then(|| state.read_buffer.split_to(n))
                }
            };
            let result = match ready {
                Some(data) => Ok(data),
                None if state.reached_eof => Err(SocketError::EndOfStream),
                None => return,
            };
            state.condition = ReadCondition::Idle;
            result
        };

        let callback = self.callbacks.borrow_mut().read.take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    fn do_write(&self) {
        let result = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            if state.connected_at.is_none() {
                return;
            }
            let Some(stream) = state.stream.as_mut() else {
                return;
            };
            flush_buffer(stream, &mut state.write_buffer)
        };

        match result {
            Ok(true) => {
                self.set_interest(self.interest().without(Ops::WRITE));
                let callback = self.callbacks.borrow_mut().write.take();
                if let Some(callback) = callback {
                    callback();
                }
                if self.state.borrow().reached_eof {
                    self.close();
                }
            }
            Ok(false) => self.set_interest(self.interest() | Ops::WRITE),
            Err(e) => {
                warn!(error = %e, "write failed, closing socket");
                self.close();
            }
        }
    }

    fn close(&self) {
        let detached = {
            let mut state = self.state.borrow_mut();
            let token = state.token.take();
            state.ops = Ops::NONE;
            state.stream.take().map(|stream| (stream, token))
        };
        if let Some((mut stream, token)) = detached {
            if let Some(token) = token {
                self.event_loop.deregister(&mut stream, token);
            }
            debug!(token = ?token, "socket closed");
        }

        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        if let Some(callback) = callbacks.close {
            callback();
        }
    }
}

impl IoHandler for SocketInner {
    fn on_connectable(&self, _token: Token) -> io::Result<()> {
        let status = {
            let state = self.state.borrow();
            let Some(stream) = state.stream.as_ref() else {
                return Ok(());
            };
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(e) => Err(e),
                },
            }
        };

        match status {
            Ok(false) => Ok(()),
            Ok(true) => {
                let pending_write = {
                    let mut state = self.state.borrow_mut();
                    state.connected_at = Some(Instant::now());
                    !state.write_buffer.is_empty()
                };
                debug!("connected");
                self.set_interest(Ops::READ);
                let callback = self.callbacks.borrow_mut().connect.take();
                if let Some(callback) = callback {
                    callback(Ok(()));
                }
                if pending_write {
                    self.do_write();
                }
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "connect failed");
                let callback = self.callbacks.borrow_mut().connect.take();
                if let Some(callback) = callback {
                    callback(Err(SocketError::Io(e)));
                }
                self.close();
                Ok(())
            }
        }
    }

    fn on_readable(&self, _token: Token) -> io::Result<()> {
        let outcome = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(stream) = state.stream.as_mut() else {
                return Ok(());
            };
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break ReadOutcome::Eof,
                    Ok(n) => state.read_buffer.put(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break ReadOutcome::Drained,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break ReadOutcome::Failed(e),
                }
            }
        };

        match outcome {
            ReadOutcome::Drained => self.check_read_state(),
            ReadOutcome::Eof => {
                debug!("end of stream");
                self.state.borrow_mut().reached_eof = true;
                self.set_interest(self.interest().without(Ops::READ));
                self.check_read_state();
                if self.state.borrow().write_buffer.is_empty() {
                    self.close();
                }
            }
            ReadOutcome::Failed(e) => {
                self.close();
                return Err(e);
            }
        }
        Ok(())
    }

    fn on_writable(&self, _token: Token) -> io::Result<()> {
        self.do_write();
        Ok(())
    }
}

/// Writes `buffer` to `writer` until it is empty or the writer would block.
///
/// Returns `Ok(true)` once everything was written. Written bytes are removed
/// from the front of the buffer.
pub(crate) fn flush_buffer<W: Write>(writer: &mut W, buffer: &mut GrowableBuffer) -> io::Result<bool> {
    while !buffer.is_empty() {
        match writer.write(buffer.as_slice()) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "connection closed while writing",
                ));
            }
            Ok(n) => buffer.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
