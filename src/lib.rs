//! # muxio
//! A reactor-style TCP networking core for Rust that provides efficient
//! non-blocking I/O without relying on heavyweight async runtimes like Tokio.
//! muxio follows the one-loop-per-thread model: every file descriptor belongs
//! to exactly one [`EventLoop`] for its whole life, so per-connection state
//! needs no locking on the hot path.
//!
//! ## Core Philosophy
//! muxio was designed for applications that require:
//! - **Predictable performance** with minimal runtime overhead
//! - **Runtime-agnostic architecture** that doesn't force async/await patterns
//! - **Direct control** over threads, buffers and connection lifetimes
//!
//! ## Architecture Overview
//! ```text
//! ┌────────────┐   ready channels   ┌───────────┐
//! │ EventLoop  │◀──────────────────│ Selector  │ (epoll)
//! └────────────┘                    └───────────┘
//!       │ dispatch
//!       ▼
//! ┌────────────┐    ┌────────────┐    ┌───────────────┐
//! │  Channel   │───▶│ Acceptor / │───▶│ TcpConnection │
//! │ callbacks  │    │ Connector  │    └───────────────┘
//! └────────────┘    └────────────┘
//! ```
//!
//! A [`TcpServer`] accepts on its base loop and parks each connection on a
//! worker loop from an [`EventLoopThreadPool`]; a [`TcpClient`] keeps one
//! connection on one loop, re-established with backoff when enabled.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use muxio::{EventLoop, TcpServer};
//! use std::sync::Arc;
//!
//! fn main() -> muxio::Result<()> {
//!     let base_loop = EventLoop::new()?;
//!     let server = TcpServer::new(
//!         base_loop.clone(),
//!         "127.0.0.1:8080".parse().unwrap(),
//!         "echo",
//!         2,     // two I/O worker loops
//!         false, // no SO_REUSEPORT
//!     )?;
//!
//!     server.set_message_callback(Arc::new(|conn, input| {
//!         let bytes = input.retrieve_all_as_bytes();
//!         conn.send(&bytes);
//!     }));
//!
//!     server.start()?;
//!     base_loop.run() // blocks until base_loop.quit()
//! }
//! ```
//!
//! - [`EventLoop`]: poll, dispatch, cross-thread task queue and timers
//! - [`Channel`]: binds one fd to its event callbacks
//! - [`Buffer`]: the byte buffer behind every connection
//! - [`net`]: acceptor, connector, connection, server and client
//! - [`error`]: error types and result handling

pub mod buffer;
pub mod channel;
pub mod error;
pub mod event_loop;
pub mod net;
pub mod poll;
pub mod thread_pool;
pub mod timer;


pub use buffer::Buffer;
pub use channel::Channel;
pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use net::{TcpClient, TcpConnection, TcpServer};
pub use thread_pool::{EventLoopThread, EventLoopThreadPool};
pub use timer::TimerId;
