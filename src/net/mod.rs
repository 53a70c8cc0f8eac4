//! TCP building blocks on top of the event loop.
//!
//! The pieces compose the same way on both sides of a connection:
//!
//! ```text
//! ┌───────────┐  accepted socket   ┌───────────────┐
//! │ Acceptor  │──────────────────▶│               │
//! └───────────┘                    │ TcpConnection │──▶ user callbacks
//! ┌───────────┐  connected socket  │               │
//! │ Connector │──────────────────▶│               │
//! └───────────┘                    └───────────────┘
//! ```
//!
//! [`TcpServer`] bundles an acceptor with a loop pool and a connection table;
//! [`TcpClient`] bundles a connector with a single connection slot.

pub mod acceptor;
pub mod client;
pub mod connection;
pub mod connector;
pub mod server;
pub(crate) mod socket;

pub use client::TcpClient;
pub use connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, ConnectionState,
    MessageCallback, TcpConnection, WriteCompleteCallback,
};
pub use connector::Connector;
pub use server::TcpServer;
