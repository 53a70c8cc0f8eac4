//! Multi-reactor TCP server.
//!
//! The base loop runs the acceptor; each accepted connection is pinned to a
//! pool loop picked round-robin and stays there for its whole life. The
//! connection table lives on the base loop, so removals are marshalled back
//! to it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info};
use socket2::Socket;

use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::net::acceptor::Acceptor;
use crate::net::connection::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback,
};
use crate::net::socket;
use crate::thread_pool::EventLoopThreadPool;

pub struct TcpServer {
    base_loop: Arc<EventLoop>,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: EventLoopThreadPool,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,

    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,

    self_weak: Weak<TcpServer>,
}

impl TcpServer {
    /// Binds to `listen_addr` immediately; listening starts with
    /// [`TcpServer::start`]. `num_threads` pool loops handle I/O; with zero
    /// the base loop handles everything.
    pub fn new(
        base_loop: Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        num_threads: usize,
        reuse_port: bool,
    ) -> Result<Arc<TcpServer>> {
        let name = name.into();
        let acceptor = Acceptor::new(base_loop.clone(), listen_addr, reuse_port)?;
        let pool = EventLoopThreadPool::new(base_loop.clone(), name.clone(), num_threads);

        let server = Arc::new_cyclic(|weak| TcpServer {
            base_loop,
            name,
            acceptor,
            pool,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            self_weak: weak.clone(),
        });

        let weak = server.self_weak.clone();
        server
            .acceptor
            .set_new_connection_callback(Arc::new(move |sock, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(sock, peer);
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Actual listening address, useful after binding port 0.
    pub fn listen_addr(&self) -> SocketAddr {
        self.acceptor.listen_addr()
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

    /// Spawns the pool and starts listening. Idempotent; does not run the
    /// base loop, the caller drives that.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.start()?;

        let acceptor = self.acceptor.clone();
        self.base_loop.run_in_loop(move || {
            if let Err(e) = acceptor.listen() {
                error!("listen failed: {}", e);
            }
        });
        info!("server {} listening on {}", self.name, self.listen_addr());
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Runs on the base loop when the acceptor hands over a socket.
    fn new_connection(&self, sock: Socket, peer: SocketAddr) {
        self.base_loop.assert_in_loop_thread();

        let io_loop = self.pool.next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, peer, id);
        let local = socket::local_addr_of(&sock);
        debug!("server {}: new connection {} from {}", self.name, conn_name, peer);

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), sock, local, peer);
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
                if let Some(server) = weak.upgrade() {
                    server.remove_connection(conn);
                }
            }));
        }

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || conn.establish());
    }

    /// May run on any pool loop; hops to the base loop to touch the table,
    /// then back to the connection's loop for the final teardown step.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let weak = self.self_weak.clone();
        let conn = conn.clone();
        self.base_loop.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server
                    .connections
                    .lock()
                    .unwrap()
                    .remove(conn.name());
                debug!("server {}: removed {}", server.name, conn.name());
            }
            let io_loop = conn.event_loop();
            io_loop.queue_in_loop(move || conn.connect_destroyed());
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections = std::mem::take(&mut *self.connections.lock().unwrap());
        for (_, conn) in connections {
            let io_loop = conn.event_loop();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
