//! Per-fd event-interest record.
//!
//! A `Channel` binds one file descriptor to up to four callbacks (read,
//! write, error, close) and tracks the interest set registered with the
//! owning loop's selector. A `Channel` never owns its fd; the component that
//! created it (connection, acceptor, timer queue, ...) does.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use nix::sys::epoll::EpollFlags;

use crate::event_loop::EventLoop;

/// Callback invoked from the loop thread when the matching event fires.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

pub(crate) const EVENT_NONE: i32 = 0;
pub(crate) const EVENT_READ: i32 = EpollFlags::EPOLLIN.bits() | EpollFlags::EPOLLPRI.bits();
pub(crate) const EVENT_WRITE: i32 = EpollFlags::EPOLLOUT.bits();

const EVENT_ERROR: i32 = EpollFlags::EPOLLERR.bits();
const EVENT_HUP: i32 = EpollFlags::EPOLLHUP.bits();
const EVENT_IN: i32 = EpollFlags::EPOLLIN.bits();
const EVENT_CLOSE_PEER: i32 = EpollFlags::EPOLLRDHUP.bits();

/// Registration state of a channel inside the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollerState {
    /// Never registered (or fully removed).
    New = 0,
    /// Currently registered with epoll.
    Added = 1,
    /// Registered once, currently detached because all interest was cleared.
    Deleted = 2,
}

pub struct Channel {
    fd: RawFd,
    event_loop: Weak<EventLoop>,
    /// Requested interest bitmask (epoll event bits).
    events: AtomicI32,
    /// Events reported by the last `epoll_wait`, latched before dispatch.
    revents: AtomicI32,
    state: AtomicU8,

    read_cb: Mutex<Option<EventCallback>>,
    write_cb: Mutex<Option<EventCallback>>,
    error_cb: Mutex<Option<EventCallback>>,
    close_cb: Mutex<Option<EventCallback>>,
}

impl Channel {
    pub fn new(event_loop: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            fd,
            event_loop,
            events: AtomicI32::new(EVENT_NONE),
            revents: AtomicI32::new(EVENT_NONE),
            state: AtomicU8::new(PollerState::New as u8),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> i32 {
        self.events.load(Ordering::Relaxed)
    }

    pub(crate) fn set_revents(&self, revents: i32) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    pub fn is_none_event(&self) -> bool {
        self.events() == EVENT_NONE
    }

    pub fn is_reading(&self) -> bool {
        self.events() & EVENT_READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events() & EVENT_WRITE != 0
    }

    pub(crate) fn poller_state(&self) -> PollerState {
        match self.state.load(Ordering::Relaxed) {
            0 => PollerState::New,
            1 => PollerState::Added,
            _ => PollerState::Deleted,
        }
    }

    pub(crate) fn set_poller_state(&self, state: PollerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn set_read_callback(&self, cb: EventCallback) {
        *self.read_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        *self.write_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        *self.error_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    pub fn enable_read(self: &Arc<Self>) {
        self.events.fetch_or(EVENT_READ, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_read(self: &Arc<Self>) {
        self.events.fetch_and(!EVENT_READ, Ordering::Relaxed);
        self.update();
    }

    pub fn enable_write(self: &Arc<Self>) {
        self.events.fetch_or(EVENT_WRITE, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_write(self: &Arc<Self>) {
        self.events.fetch_and(!EVENT_WRITE, Ordering::Relaxed);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.events.store(EVENT_NONE, Ordering::Relaxed);
        self.update();
    }

    /// Deregisters the channel from the selector. All interest must already
    /// be disabled.
    pub fn remove(self: &Arc<Self>) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    fn update(self: &Arc<Self>) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.update_channel(self);
        }
    }

    /// Invokes the callbacks matching the latched returned events, in order
    /// write → error → read → close. Close fires only when the peer hung up
    /// and no readable input is pending, so final in-flight data drains
    /// through the read path first.
    ///
    /// Each callback is cloned out of its slot before the call, so a callback
    /// may freely mutate this channel (including replacing callbacks or
    /// disabling interest).
    pub(crate) fn dispatch(&self) {
        let revents = self.revents.load(Ordering::Relaxed);

        if revents & EVENT_WRITE != 0 {
            if let Some(cb) = self.clone_cb(&self.write_cb) {
                cb();
            }
        }
        if revents & EVENT_ERROR != 0 {
            if let Some(cb) = self.clone_cb(&self.error_cb) {
                cb();
            }
        }
        if revents & (EVENT_READ | EVENT_CLOSE_PEER) != 0 {
            if let Some(cb) = self.clone_cb(&self.read_cb) {
                cb();
            }
        }
        if revents & EVENT_HUP != 0 && revents & EVENT_IN == 0 {
            if let Some(cb) = self.clone_cb(&self.close_cb) {
                cb();
            }
        }
    }

    fn clone_cb(&self, slot: &Mutex<Option<EventCallback>>) -> Option<EventCallback> {
        slot.lock().unwrap().clone()
    }
}
