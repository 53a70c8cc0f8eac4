//! One established TCP connection.
//!
//! The connection lives on exactly one loop and moves through
//! `Connecting → Connected → Disconnecting → Disconnected`. Sends try the
//! socket directly when nothing is queued and fall back to the output buffer
//! plus write interest; reads drain into the input buffer and surface through
//! the message callback.

use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use socket2::Socket;

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    /// Half-closed on request; the write side shuts once the output buffer
    /// drains.
    Disconnecting = 2,
    Disconnected = 3,
}

pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,

    input: Mutex<Buffer>,
    output: Mutex<Buffer>,

    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,

    self_weak: Weak<TcpConnection>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        use std::os::fd::AsRawFd;

        let channel = Channel::new(Arc::downgrade(&event_loop), socket.as_raw_fd());
        if let Err(e) = socket.set_keepalive(true) {
            warn!("{}: SO_KEEPALIVE failed: {}", name, e);
        }

        Arc::new_cyclic(|weak| TcpConnection {
            event_loop,
            name,
            socket,
            channel,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn event_loop(&self) -> Arc<EventLoop> {
        self.event_loop.clone()
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
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

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = self.socket.set_nodelay(on) {
            warn!("{}: TCP_NODELAY failed: {}", self.name, e);
        }
    }

    /// Finishes setup on the owning loop: wires the channel callbacks,
    /// registers read interest and announces the connection.
    pub(crate) fn establish(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);

        {
            let weak = self.self_weak.clone();
            self.channel.set_read_callback(Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read();
                }
            }));
        }
        {
            let weak = self.self_weak.clone();
            self.channel.set_write_callback(Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }));
        }
        {
            let weak = self.self_weak.clone();
            self.channel.set_error_callback(Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_error();
                }
            }));
        }
        {
            let weak = self.self_weak.clone();
            self.channel.set_close_callback(Arc::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }));
        }

        self.channel.enable_read();
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(self);
        }
    }

    /// Queues `data` for delivery. Safe from any thread; off-thread callers
    /// pay one copy to move the bytes onto the loop.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            warn!("{}: send on non-connected connection dropped", self.name);
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let weak = self.self_weak.clone();
            let owned = data.to_vec();
            self.event_loop.queue_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.send_in_loop(&owned);
                }
            });
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            warn!("{}: disconnected, dropping {} bytes", self.name, data.len());
            return;
        }

        let mut written = 0usize;
        let mut fault = false;

        // direct write only when nothing is already queued, to keep bytes
        // in order
        if !self.channel.is_writing() && self.output.lock().unwrap().is_empty() {
            match self.write_socket(data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(Errno::EAGAIN) => {}
                Err(e) => {
                    warn!("{}: write failed: {}", self.name, e);
                    if e == Errno::EPIPE || e == Errno::ECONNRESET {
                        fault = true;
                    }
                }
            }
        }

        if !fault && written < data.len() {
            self.output.lock().unwrap().append(&data[written..]);
            if !self.channel.is_writing() {
                self.channel.enable_write();
            }
        }
    }

    /// Closes the write side once pending output drains; reads continue until
    /// the peer closes its own side.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        self.set_state(ConnectionState::Disconnecting);
        let weak = self.self_weak.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(conn) = weak.upgrade() {
                conn.shutdown_in_loop();
            }
        });
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        // with output still queued, handle_write finishes the shutdown
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown(Shutdown::Write) {
                warn!("{}: shutdown(WR) failed: {}", self.name, e);
            }
        }
    }

    /// Immediate teardown regardless of queued output.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.set_state(ConnectionState::Disconnecting);
            let weak = self.self_weak.clone();
            self.event_loop.queue_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
        }
    }

    fn handle_read(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let result = {
            let mut input = self.input.lock().unwrap();
            input.read_from_fd(self.socket.as_fd())
        };
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                trace!("{}: {} bytes in", self.name, n);
                let cb = self.message_cb.lock().unwrap().clone();
                let mut input = self.input.lock().unwrap();
                match cb {
                    Some(cb) => cb(self, &mut *input),
                    None => input.retrieve_all(),
                }
            }
            Err(Errno::EAGAIN) => {}
            Err(e) => {
                error!("{}: read failed: {}", self.name, e);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("{}: write event with interest already gone", self.name);
            return;
        }

        let drained = {
            let mut output = self.output.lock().unwrap();
            match self.write_socket(output.peek()) {
                Ok(n) => {
                    output.retrieve(n);
                    output.is_empty()
                }
                Err(Errno::EAGAIN) => false,
                Err(e) => {
                    warn!("{}: write failed: {}", self.name, e);
                    false
                }
            }
        };

        if drained {
            self.channel.disable_write();
            self.queue_write_complete();
            if self.state() == ConnectionState::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    /// `MSG_NOSIGNAL` so a send after peer close surfaces as `EPIPE` instead
    /// of raising `SIGPIPE`.
    fn write_socket(&self, data: &[u8]) -> std::result::Result<usize, Errno> {
        self.socket
            .send_with_flags(data, nix::libc::MSG_NOSIGNAL)
            .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(0)))
    }

    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        info!("{}: closing (state {:?})", self.name, self.state());
        self.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();

        // hold an extra Arc so the owner's close callback may drop its
        // reference while we are still running
        let guard = self.clone();
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(&guard);
        }
        if let Some(cb) = self.close_cb.lock().unwrap().clone() {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!("{}: SO_ERROR = {}", self.name, e),
            Ok(None) => {}
            Err(e) => error!("{}: could not read SO_ERROR: {}", self.name, e),
        }
    }

    /// Last step of teardown, run by the owner on this connection's loop
    /// after it has dropped the connection from its table.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if !self.is_disconnected() {
            // owner destroyed us without a close event first
            self.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                cb(self);
            }
        }
        self.channel.remove();
        debug!("{}: destroyed", self.name);
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("local", &self.local_addr)
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl TcpConnection {
    fn queue_write_complete(&self) {
        let Some(cb) = self.write_complete_cb.lock().unwrap().clone() else {
            return;
        };
        let weak = self.self_weak.clone();
        self.event_loop.queue_in_loop(move || {
            if let Some(conn) = weak.upgrade() {
                cb(&conn);
            }
        });
    }
}

/// Logs connection up/down; used when the owner sets no connection callback.
pub fn default_connection_callback(conn: &Arc<TcpConnection>) {
    info!(
        "{} {} -> {} is {}",
        conn.name(),
        conn.local_addr(),
        conn.peer_addr(),
        if conn.is_connected() { "up" } else { "down" }
    );
}

/// Discards incoming bytes; used when the owner sets no message callback.
pub fn default_message_callback(_conn: &Arc<TcpConnection>, buffer: &mut Buffer) {
    buffer.retrieve_all();
}
