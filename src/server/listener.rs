use std::net::{self, SocketAddr};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::http::handler::RequestHandler;
use crate::http::protocol::{HttpProtocol, ProtocolSettings};
use crate::io::event_loop::{EventLoop, LoopObserver, LoopRemote};

/// How long start and stop wait for every loop to report in.
const LATCH_TIMEOUT: Duration = Duration::from_millis(500);

enum LoopEvent {
    Started(LoopRemote),
    Stopped(usize),
    Failed(String),
}

struct LatchObserver {
    events: Sender<LoopEvent>,
}

impl LoopObserver for LatchObserver {
    fn on_start(&self, event_loop: &EventLoop) {
        let _ = self.events.send(LoopEvent::Started(event_loop.remote()));
    }

    fn on_stop(&self, event_loop: &EventLoop) {
        let _ = self.events.send(LoopEvent::Stopped(event_loop.id()));
    }
}

/// HTTP server running `io_loops` event loops that share one listener.
///
/// Each loop owns its thread and the connections it accepted; the server
/// only coordinates start and stop.
pub struct HttpServer {
    config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
    listener: Option<net::TcpListener>,
    remotes: Vec<LoopRemote>,
    threads: Vec<JoinHandle<()>>,
    events: Option<Receiver<LoopEvent>>,
}

impl HttpServer {
    pub fn new(config: ServerConfig, handler: impl RequestHandler + 'static) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            listener: None,
            remotes: Vec::new(),
            threads: Vec::new(),
            events: None,
        }
    }

    /// Binds the listening socket. Called by [`HttpServer::start`] if needed.
    pub fn bind(&mut self) -> anyhow::Result<SocketAddr> {
        let listener = net::TcpListener::bind(&self.config.listen_addr)
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        info!("Listening on {}", addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn is_running(&self) -> bool {
        !self.remotes.is_empty()
    }

    /// Remotes of the running loops.
    pub fn loops(&self) -> &[LoopRemote] {
        &self.remotes
    }

    /// Spawns the event loops and waits until all of them run.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.is_running() {
            bail!("server already started");
        }
        if self.listener.is_none() {
            self.bind()?;
        }
        let loops = self.config.io_loops.max(1);
        let listener = self.listener.as_ref().context("listener not bound")?;
        let listeners = (0..loops)
            .map(|_| listener.try_clone())
            .collect::<Result<Vec<_>, _>>()
            .context("cloning listener")?;

        let (tx, rx) = mpsc::channel();
        for (index, listener) in listeners.into_iter().enumerate() {
            let handler = Arc::clone(&self.handler);
            let settings = self.config.protocol_settings();
            let poll_timeout = self.config.poll_timeout();
            let events = tx.clone();
            let thread = thread::Builder::new()
                .name(format!("warden-loop-{index}"))
                .spawn(move || run_loop(listener, handler, settings, poll_timeout, events))
                .context("spawning event loop thread")?;
            self.threads.push(thread);
        }
        drop(tx);

        let deadline = Instant::now() + LATCH_TIMEOUT;
        while self.remotes.len() < loops {
            let wait = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(LoopEvent::Started(remote)) => {
                    debug!(loop_id = remote.id(), "event loop running");
                    self.remotes.push(remote);
                }
                Ok(LoopEvent::Stopped(_)) => {}
                Ok(LoopEvent::Failed(reason)) => {
                    self.abort(rx);
                    bail!("event loop failed to start: {reason}");
                }
                Err(_) => {
                    self.abort(rx);
                    bail!("timed out waiting for {loops} event loops to start");
                }
            }
        }

        self.events = Some(rx);
        info!(loops, "server started");
        Ok(())
    }

    /// Stops every loop through its callback queue and joins the threads.
    pub fn stop(&mut self) {
        let running = self.remotes.len();
        for remote in self.remotes.drain(..) {
            remote.stop();
        }

        if let Some(events) = self.events.take() {
            let deadline = Instant::now() + LATCH_TIMEOUT;
            let mut stopped = 0;
            while stopped < running {
                match events.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                    Ok(LoopEvent::Stopped(id)) => {
                        debug!(loop_id = id, "event loop stopped");
                        stopped += 1;
                    }
                    Ok(_) => {}
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(stopped, running, "event loops slow to stop");
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        self.join();
        if running > 0 {
            info!("server stopped");
        }
    }

    // Loops that came up after a failure still have to be stopped before
    // their threads can be joined.
    fn abort(&mut self, events: Receiver<LoopEvent>) {
        while let Ok(event) = events.recv_timeout(LATCH_TIMEOUT) {
            if let LoopEvent::Started(remote) = event {
                self.remotes.push(remote);
            }
        }
        self.events = Some(events);
        self.stop();
    }

    /// Blocks until every loop thread has exited.
    pub fn join(&mut self) {
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("event loop thread panicked");
            }
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn run_loop(
    listener: net::TcpListener,
    handler: Arc<dyn RequestHandler>,
    settings: ProtocolSettings,
    poll_timeout: Duration,
    events: Sender<LoopEvent>,
) {
    let event_loop = match EventLoop::with_poll_timeout(poll_timeout) {
        Ok(event_loop) => event_loop,
        Err(e) => {
            error!(error = %e, "could not create event loop");
            let _ = events.send(LoopEvent::Failed(e.to_string()));
            return;
        }
    };

    let protocol = HttpProtocol::new(&event_loop, handler, settings);
    if let Err(e) = protocol.listen(mio::net::TcpListener::from_std(listener)) {
        error!(error = %e, "could not listen");
        let _ = events.send(LoopEvent::Failed(e.to_string()));
        return;
    }

    event_loop.set_observer(Box::new(LatchObserver { events }));
    event_loop.run();
}
