//! Single-connection TCP client.
//!
//! Wraps a [`Connector`] and keeps at most one live [`TcpConnection`] at a
//! time. With retry enabled, a dropped connection is re-established through
//! the connector with its backoff reset.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::info;
use socket2::Socket;

use crate::event_loop::EventLoop;
use crate::net::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback,
};
use crate::net::connector::Connector;
use crate::net::socket;

pub struct TcpClient {
    event_loop: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    /// Re-establish after an established connection drops.
    retry: AtomicBool,
    /// The user wants the connection up.
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<Arc<TcpConnection>>>,

    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,

    self_weak: Weak<TcpClient>,
}

impl TcpClient {
    pub fn new(
        event_loop: Arc<EventLoop>,
        server_addr: SocketAddr,
        name: impl Into<String>,
    ) -> Arc<TcpClient> {
        let connector = Connector::new(event_loop.clone(), server_addr);
        let client = Arc::new_cyclic(|weak| TcpClient {
            event_loop,
            connector,
            name: name.into(),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            self_weak: weak.clone(),
        });

        let weak = client.self_weak.clone();
        client
            .connector
            .set_new_connection_callback(Arc::new(move |sock| {
                if let Some(client) = weak.upgrade() {
                    client.new_connection(sock);
                }
            }));
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The live connection, when established.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.lock().unwrap().clone()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    /// Starts connecting (with backoff until the server answers).
    pub fn connect(&self) {
        info!("client {} connecting to {}", self.name, self.connector.server_addr());
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Graceful close: shuts down the write side of the live connection.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    /// Abandons connecting without touching an established connection.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    /// Runs on the loop thread with the freshly connected socket.
    fn new_connection(&self, sock: Socket) {
        self.event_loop.assert_in_loop_thread();

        let peer = socket::peer_addr_of(&sock);
        let local = socket::local_addr_of(&sock);
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, peer, id);

        let conn = TcpConnection::new(self.event_loop.clone(), conn_name, sock, local, peer);
        conn.set_connection_callback(
            self.connection_cb
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Arc::new(default_connection_callback)),
        );
        conn.set_message_callback(
            self.message_cb
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Arc::new(default_message_callback)),
        );
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        {
            let weak = self.self_weak.clone();
            conn.set_close_callback(Arc::new(move |conn| {
                if let Some(client) = weak.upgrade() {
                    client.remove_connection(conn);
                }
            }));
        }

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.establish();
    }

    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        self.event_loop.assert_in_loop_thread();
        *self.connection.lock().unwrap() = None;

        {
            let conn = conn.clone();
            self.event_loop.queue_in_loop(move || conn.connect_destroyed());
        }

        if self.retry.load(Ordering::Acquire) && self.connect.load(Ordering::Acquire) {
            info!(
                "client {} reconnecting to {}",
                self.name,
                self.connector.server_addr()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        // a connection still alive now outlives this client; rewire its
        // close path to plain teardown and force it shut on its loop
        if let Some(conn) = self.connection.lock().unwrap().take() {
            conn.set_close_callback(Arc::new(|conn| {
                let io_loop = conn.event_loop();
                let conn = conn.clone();
                io_loop.queue_in_loop(move || conn.connect_destroyed());
            }));
            conn.force_close();
        }
    }
}
