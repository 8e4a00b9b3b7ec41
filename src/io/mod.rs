//! Non-blocking I/O core.
//!
//! - **`event_loop`**: the reactor: poll, dispatch, timeouts, deferred callbacks
//! - **`timeout`**: ordered timers and per-connection keep-alive timers
//! - **`callback`**: cross-thread callback queue and periodic callbacks
//! - **`socket`**: buffered asynchronous TCP socket
//! - **`buffer`**: growable byte buffer
//! - **`kmp`**: substring search used to find read delimiters

pub mod buffer;
pub mod callback;
pub mod event_loop;
pub mod kmp;
pub mod socket;
pub mod timeout;

pub use buffer::GrowableBuffer;
pub use callback::{CallbackQueue, PeriodicCallback};
pub use event_loop::{EventLoop, IoHandler, LoopObserver, LoopRemote, LoopStats, Ops};
pub use socket::AsyncSocket;
pub use timeout::{Timeout, TimeoutHandle, TimeoutQueue};
