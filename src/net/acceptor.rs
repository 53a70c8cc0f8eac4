//! Listening-socket owner.
//!
//! The acceptor binds at construction, starts listening on request and hands
//! each accepted socket to the server through a callback. It runs entirely on
//! its loop's thread.

use std::fs::File;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, warn};
use nix::errno::Errno;
use socket2::Socket;

use crate::channel::Channel;
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::net::socket;

pub type NewConnectionCallback = Arc<dyn Fn(Socket, SocketAddr) + Send + Sync>;

const BACKLOG: i32 = 1024;

pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    /// Shared so teardown can keep the fd open until the channel has left
    /// the selector.
    listen_socket: Arc<Socket>,
    channel: Arc<Channel>,
    /// Reserved fd spent to accept-and-close when the process runs out of
    /// descriptors, then reopened.
    idle_fd: Mutex<Option<OwnedFd>>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
}

impl Acceptor {
    pub fn new(
        event_loop: Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>> {
        let listen_socket = Arc::new(socket::bind_listener(listen_addr, reuse_port)?);
        let channel = Channel::new(Arc::downgrade(&event_loop), listen_socket.as_raw_fd());

        let acceptor = Arc::new(Acceptor {
            event_loop,
            listen_socket,
            channel,
            idle_fd: Mutex::new(open_idle_fd()),
            new_connection_cb: Mutex::new(None),
            listening: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(Arc::new(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));
        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn listen_addr(&self) -> SocketAddr {
        socket::local_addr_of(&self.listen_socket)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Starts listening and registers read interest. Must run on the loop
    /// thread.
    pub fn listen(self: &Arc<Self>) -> Result<()> {
        self.event_loop.assert_in_loop_thread();
        self.listen_socket.listen(BACKLOG)?;
        self.listening.store(true, Ordering::Release);
        self.channel.enable_read();
        Ok(())
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        match self.listen_socket.accept() {
            Ok((connection, peer)) => {
                let Some(peer) = peer.as_socket() else {
                    warn!("accepted peer with non-inet address, dropping");
                    return;
                };
                configure_accepted(&connection);
                let cb = self.new_connection_cb.lock().unwrap().clone();
                match cb {
                    Some(cb) => cb(connection, peer),
                    // no taker: closing is the only sane fallback
                    None => drop(connection),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) if e.raw_os_error() == Some(Errno::EMFILE as i32) => {
                // out of fds: burn the reserve fd to accept and immediately
                // close the pending connection, so the peer sees a clean
                // close instead of an endless level-triggered busy loop
                error!("accept: file descriptor table full");
                let mut idle = self.idle_fd.lock().unwrap();
                if let Some(reserve) = idle.take() {
                    drop(reserve);
                    if let Ok((connection, _)) = self.listen_socket.accept() {
                        drop(connection);
                    }
                    *idle = open_idle_fd();
                }
            }
            Err(e) => error!("accept failed: {}", e),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        let channel = self.channel.clone();
        let listen_socket = self.listen_socket.clone();
        self.event_loop.run_in_loop(move || {
            channel.disable_all();
            channel.remove();
            drop(listen_socket);
        });
    }
}

/// Accepted sockets inherit neither flag, so both are set per connection.
fn configure_accepted(socket: &Socket) {
    if let Err(e) = socket.set_nonblocking(true) {
        warn!("failed to make accepted socket non-blocking: {}", e);
    }
    if let Err(e) = socket.set_cloexec(true) {
        warn!("failed to set cloexec on accepted socket: {}", e);
    }
}

fn open_idle_fd() -> Option<OwnedFd> {
    match File::open("/dev/null") {
        Ok(file) => Some(OwnedFd::from(file)),
        Err(e) => {
            warn!("could not reserve idle fd: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_pool::EventLoopThread;
    use std::io::Read;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn accepted_socket_reaches_the_callback() {
        let worker = EventLoopThread::start("acceptor-test").unwrap();
        let lp = worker.event_loop();

        let acceptor =
            Acceptor::new(lp.clone(), "127.0.0.1:0".parse().unwrap(), false).unwrap();
        let (tx, rx) = mpsc::channel();
        acceptor.set_new_connection_callback(Arc::new(move |socket, peer| {
            let _ = tx.send(peer);
            // answer with one byte so the client can observe the accept
            let _ = socket.send(b"k");
        }));

        {
            let acceptor = acceptor.clone();
            lp.run_in_loop(move || {
                acceptor.listen().unwrap();
            });
        }
        let addr = acceptor.listen_addr();
        let start = std::time::Instant::now();
        while !acceptor.is_listening() && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let peer = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(peer.ip(), addr.ip());

        let mut byte = [0u8; 1];
        client.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"k");
    }

    #[test]
    fn fd_exhaustion_burns_the_idle_fd_and_closes_the_peer() {
        use socket2::{Domain, Type};
        use std::mem::MaybeUninit;

        let worker = EventLoopThread::start("acceptor-full").unwrap();
        let lp = worker.event_loop();

        let acceptor =
            Acceptor::new(lp.clone(), "127.0.0.1:0".parse().unwrap(), false).unwrap();
        {
            let acceptor = acceptor.clone();
            lp.run_in_loop(move || {
                acceptor.listen().unwrap();
            });
        }
        let start = std::time::Instant::now();
        while !acceptor.is_listening() && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        let addr = acceptor.listen_addr();

        // created up front: connect() on an existing socket needs no new fd
        let client = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        crate::test_util::with_fd_table_full(|| {
            client.connect(&addr.into()).unwrap();
            // accept hits EMFILE, spends the reserve fd on accept-and-close
            // and the peer sees a clean close instead of hanging
            let mut byte = [MaybeUninit::<u8>::uninit(); 1];
            let n = client.recv(&mut byte).unwrap();
            assert_eq!(n, 0);
        });

        // the reserve fd was reopened from the slot the closed connection freed
        assert!(acceptor.idle_fd.lock().unwrap().is_some());
    }
}
