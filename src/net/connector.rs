//! Outbound connection establishment with retry backoff.
//!
//! A connector owns the in-flight socket until the three-way handshake
//! settles, then hands the connected socket to its callback and steps aside.
//! Transient failures reschedule a fresh attempt with doubling delay;
//! permanent failures stop the attempt and leave the connector disconnected.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{error, info, warn};
use nix::errno::Errno;
use socket2::Socket;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::socket;
use crate::timer::TimerId;

pub type NewConnectionCallback = Arc<dyn Fn(Socket) + Send + Sync>;

const INIT_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

pub struct Connector {
    event_loop: Arc<EventLoop>,
    server_addr: SocketAddr,
    state: AtomicU8,
    /// Standing intent: cleared by [`Connector::stop`], which also cancels
    /// any scheduled retry when it fires.
    connect_requested: AtomicBool,
    retry_delay_ms: AtomicU64,
    /// Handle of the backoff timer scheduled by [`Connector::retry`];
    /// cancelled by [`Connector::stop`] so a later restart cannot be raced
    /// by a stale attempt.
    retry_timer: Mutex<Option<TimerId>>,
    socket: Mutex<Option<Socket>>,
    channel: Mutex<Option<Arc<Channel>>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    self_weak: Weak<Connector>,
}

impl Connector {
    pub fn new(event_loop: Arc<EventLoop>, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|weak| Connector {
            event_loop,
            server_addr,
            state: AtomicU8::new(State::Disconnected as u8),
            connect_requested: AtomicBool::new(false),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY_MS),
            retry_timer: Mutex::new(None),
            socket: Mutex::new(None),
            channel: Mutex::new(None),
            new_connection_cb: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Begins connecting. Safe from any thread.
    pub fn start(&self) {
        self.connect_requested.store(true, Ordering::Release);
        let weak = self.self_weak.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        });
    }

    /// Abandons the current attempt and suppresses pending retries.
    pub fn stop(&self) {
        self.connect_requested.store(false, Ordering::Release);
        let weak = self.self_weak.clone();
        self.event_loop.queue_in_loop(move || {
            let Some(connector) = weak.upgrade() else {
                return;
            };
            if let Some(id) = connector.retry_timer.lock().unwrap().take() {
                connector.event_loop.cancel_timer(id);
            }
            if connector.state() == State::Connecting {
                connector.set_state(State::Disconnected);
                drop(connector.detach_socket());
            }
        });
    }

    /// Starts over after an established connection dropped, with the backoff
    /// delay reset.
    pub fn restart(&self) {
        self.set_state(State::Disconnected);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY_MS, Ordering::Relaxed);
        self.start();
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Disconnected,
            1 => State::Connecting,
            _ => State::Connected,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn start_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.connect_requested.load(Ordering::Acquire) {
            return;
        }
        if self.state() != State::Disconnected {
            return;
        }
        self.connect();
    }

    fn connect(&self) {
        let sock = match socket::new_stream_socket(&self.server_addr) {
            Ok(sock) => sock,
            Err(e) => {
                error!("connector: socket creation failed: {}", e);
                return;
            }
        };

        let errno = match sock.connect(&self.server_addr.into()) {
            Ok(()) => Errno::UnknownErrno,
            Err(e) => Errno::from_raw(e.raw_os_error().unwrap_or(0)),
        };
        match errno {
            Errno::UnknownErrno | Errno::EINPROGRESS | Errno::EINTR | Errno::EISCONN => {
                self.connecting(sock);
            }
            Errno::EAGAIN
            | Errno::EADDRINUSE
            | Errno::EADDRNOTAVAIL
            | Errno::ECONNREFUSED
            | Errno::ENETUNREACH => {
                self.retry(sock);
            }
            Errno::EACCES
            | Errno::EPERM
            | Errno::EAFNOSUPPORT
            | Errno::EALREADY
            | Errno::EBADF
            | Errno::EFAULT
            | Errno::ENOTSOCK => {
                error!("connector: connect to {} refused permanently: {}", self.server_addr, errno);
                self.set_state(State::Disconnected);
            }
            other => {
                error!("connector: unexpected connect error to {}: {}", self.server_addr, other);
                self.set_state(State::Disconnected);
            }
        }
    }

    /// Handshake in flight: watch the socket for writability.
    fn connecting(&self, sock: Socket) {
        use std::os::fd::AsRawFd;

        self.set_state(State::Connecting);
        let channel = Channel::new(Arc::downgrade(&self.event_loop), sock.as_raw_fd());
        *self.socket.lock().unwrap() = Some(sock);

        {
            let weak = self.self_weak.clone();
            channel.set_write_callback(Arc::new(move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_write();
                }
            }));
        }
        {
            let weak = self.self_weak.clone();
            channel.set_error_callback(Arc::new(move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_error();
                }
            }));
        }

        *self.channel.lock().unwrap() = Some(channel.clone());
        channel.enable_write();
    }

    fn handle_write(&self) {
        if self.state() != State::Connecting {
            return;
        }
        let Some(sock) = self.detach_socket() else {
            return;
        };

        match sock.take_error() {
            Ok(Some(e)) => {
                warn!("connector: SO_ERROR after handshake with {}: {}", self.server_addr, e);
                self.retry(sock);
            }
            Err(e) => {
                warn!("connector: could not read SO_ERROR: {}", e);
                self.retry(sock);
            }
            Ok(None) if socket::is_self_connect(&sock) => {
                warn!("connector: self-connect on {}, retrying", self.server_addr);
                self.retry(sock);
            }
            Ok(None) => {
                self.set_state(State::Connected);
                if self.connect_requested.load(Ordering::Acquire) {
                    let cb = self.new_connection_cb.lock().unwrap().clone();
                    match cb {
                        Some(cb) => cb(sock),
                        None => drop(sock),
                    }
                } else {
                    // stop() raced the handshake
                    drop(sock);
                }
            }
        }
    }

    fn handle_error(&self) {
        if self.state() != State::Connecting {
            return;
        }
        let Some(sock) = self.detach_socket() else {
            return;
        };
        match sock.take_error() {
            Ok(Some(e)) => warn!("connector: handshake with {} failed: {}", self.server_addr, e),
            _ => warn!("connector: handshake with {} failed", self.server_addr),
        }
        self.retry(sock);
    }

    /// Unregisters the watch channel and takes back the in-flight socket.
    /// The channel `Arc` is parked on the task queue so it outlives the
    /// dispatch round currently running its callback.
    fn detach_socket(&self) -> Option<Socket> {
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.disable_all();
            channel.remove();
            self.event_loop.queue_in_loop(move || drop(channel));
        }
        self.socket.lock().unwrap().take()
    }

    fn retry(&self, sock: Socket) {
        drop(sock);
        self.set_state(State::Disconnected);
        if !self.connect_requested.load(Ordering::Acquire) {
            return;
        }

        let delay = self.retry_delay_ms.load(Ordering::Relaxed);
        info!(
            "connector: retrying {} in {}ms",
            self.server_addr, delay
        );
        self.retry_delay_ms
            .store((delay * 2).min(MAX_RETRY_DELAY_MS), Ordering::Relaxed);

        let weak = self.self_weak.clone();
        let id = self
            .event_loop
            .run_after(Duration::from_millis(delay), move || {
                if let Some(connector) = weak.upgrade() {
                    connector.start_in_loop();
                }
            });
        *self.retry_timer.lock().unwrap() = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_pool::EventLoopThread;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn connects_to_a_listening_peer() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let worker = EventLoopThread::start("connector-test").unwrap();
        let connector = Connector::new(worker.event_loop(), addr);

        let (tx, rx) = mpsc::channel();
        connector.set_new_connection_callback(Arc::new(move |sock| {
            let _ = tx.send(sock.peer_addr().unwrap().as_socket().unwrap());
        }));
        connector.start();

        let (_peer_side, _) = listener.accept().unwrap();
        let peer = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(peer, addr);
    }

    #[test]
    fn refused_connect_schedules_a_retry() {
        // bind then drop to get a port that refuses connections
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let worker = EventLoopThread::start("connector-retry").unwrap();
        let connector = Connector::new(worker.event_loop(), addr);
        connector.start();

        let start = std::time::Instant::now();
        while connector.retry_delay_ms.load(Ordering::Relaxed) == INIT_RETRY_DELAY_MS
            && start.elapsed() < Duration::from_secs(2)
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        // the first failure doubled the delay
        assert_eq!(
            connector.retry_delay_ms.load(Ordering::Relaxed),
            INIT_RETRY_DELAY_MS * 2
        );

        connector.stop();
    }

    #[test]
    fn stop_cancels_the_scheduled_retry() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let worker = EventLoopThread::start("connector-stale").unwrap();
        let connector = Connector::new(worker.event_loop(), addr);
        connector.start();

        // the first attempt fails straight away and schedules a retry in 500ms
        let start = std::time::Instant::now();
        while connector.retry_delay_ms.load(Ordering::Relaxed) == INIT_RETRY_DELAY_MS
            && start.elapsed() < Duration::from_secs(2)
        {
            std::thread::sleep(Duration::from_millis(10));
        }

        std::thread::sleep(Duration::from_millis(300));
        connector.stop();
        connector.restart();

        // restart resets the backoff and its immediate attempt doubles it back
        // to 1000; the retry scheduled before stop() would come due during
        // this window, and had it survived it would double the delay again
        std::thread::sleep(Duration::from_millis(350));
        assert_eq!(
            connector.retry_delay_ms.load(Ordering::Relaxed),
            INIT_RETRY_DELAY_MS * 2
        );

        connector.stop();
    }
}
