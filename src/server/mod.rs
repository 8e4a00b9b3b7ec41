//! Multi-loop server bootstrap.

pub mod listener;

pub use listener::HttpServer;
