//! Monotonic timer facility.
//!
//! All timers of a loop live in one [`TimerQueue`] driven by a single
//! timerfd, whose readable events arrive through a regular [`Channel`] on
//! the owning loop. Timers are ordered by absolute expiration with insertion
//! order (the monotone id) breaking ties.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{trace, warn};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{Expiration, TimerFd, TimerSetTimeFlags};
use nix::unistd::read;

use crate::channel::Channel;

/// Callback run on the loop thread when a timer expires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for cancellation. Ids are process-unique and never reused,
/// so a stale handle can never cancel a newer timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub(crate) fn next() -> TimerId {
        TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct Timer {
    id: TimerId,
    expiration: Instant,
    /// `Some` for periodic timers; a non-positive requested interval is
    /// normalized to a one-shot before construction.
    interval: Option<Duration>,
    callback: TimerCallback,
}

impl Timer {
    pub(crate) fn new(
        id: TimerId,
        expiration: Instant,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> Timer {
        let interval = interval.filter(|d| !d.is_zero());
        Timer {
            id,
            expiration,
            interval,
            callback,
        }
    }

    fn run(&self) {
        (self.callback)();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    when: Instant,
    id: TimerId,
}

/// Time-ordered timer set plus an id index for cancellation.
///
/// Touched only from the loop thread; the loop marshals cross-thread timer
/// API calls through its task queue before reaching here.
pub(crate) struct TimerQueue {
    timerfd: TimerFd,
    channel: Arc<Channel>,
    timers: BTreeMap<TimerKey, Timer>,
    /// id → expiration, same size as `timers` at every quiescent point.
    active: HashMap<TimerId, Instant>,
    /// True while expired callbacks of the current batch are running.
    calling_expired: bool,
    /// Timers cancelled from within the current batch; suppresses re-arming.
    cancelling: HashSet<TimerId>,
}

impl TimerQueue {
    pub(crate) fn new(channel: Arc<Channel>, timerfd: TimerFd) -> TimerQueue {
        TimerQueue {
            timerfd,
            channel,
            timers: BTreeMap::new(),
            active: HashMap::new(),
            calling_expired: false,
            cancelling: HashSet::new(),
        }
    }

    pub(crate) fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    /// Adds a timer and reprograms the timerfd only when the new timer
    /// becomes the earliest.
    pub(crate) fn insert(&mut self, timer: Timer) {
        let when = timer.expiration;
        if self.insert_entry(timer) {
            self.reset_timerfd(when);
        }
    }

    /// Removes a timer before it fires. A timer already popped in the batch
    /// currently running is remembered so it is not re-armed afterwards.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some(when) = self.active.remove(&id) {
            let removed = self.timers.remove(&TimerKey { when, id });
            debug_assert!(removed.is_some());
        } else if self.calling_expired {
            self.cancelling.insert(id);
        }
        debug_assert_eq!(self.timers.len(), self.active.len());
    }

    /// Drains the timerfd counter and pops every timer due at `now`, marking
    /// the batch as in progress. The caller runs the callbacks without
    /// holding the queue lock, then hands the batch back to
    /// [`Self::restart_expired`].
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        self.read_timerfd();

        let mut expired = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().when > now {
                break;
            }
            let timer = entry.remove();
            self.active.remove(&timer.id);
            expired.push(timer);
        }
        debug_assert_eq!(self.timers.len(), self.active.len());

        self.calling_expired = true;
        self.cancelling.clear();
        expired
    }

    /// Re-arms the periodic timers of a finished batch (skipping any
    /// cancelled mid-batch) and reprograms the timerfd for the next earliest
    /// expiration, disarming when none remain.
    pub(crate) fn restart_expired(&mut self, expired: Vec<Timer>) {
        self.calling_expired = false;
        for mut timer in expired {
            let Some(interval) = timer.interval else {
                continue;
            };
            if self.cancelling.contains(&timer.id) {
                continue;
            }
            // advance from the previous expiration, not from "now", so a
            // periodic timer does not drift under dispatch latency
            timer.expiration += interval;
            self.insert_entry(timer);
        }
        self.cancelling.clear();

        match self.timers.keys().next() {
            Some(key) => self.reset_timerfd(key.when),
            None => {
                if let Err(e) = self.timerfd.unset() {
                    warn!("failed to disarm timerfd: {}", e);
                }
            }
        }
    }

    pub(crate) fn run_expired_batch(expired: &[Timer]) {
        for timer in expired {
            timer.run();
        }
    }

    fn insert_entry(&mut self, timer: Timer) -> bool {
        let earliest = self
            .timers
            .keys()
            .next()
            .is_none_or(|first| timer.expiration < first.when);
        self.active.insert(timer.id, timer.expiration);
        self.timers.insert(
            TimerKey {
                when: timer.expiration,
                id: timer.id,
            },
            timer,
        );
        debug_assert_eq!(self.timers.len(), self.active.len());
        earliest
    }

    fn reset_timerfd(&self, when: Instant) {
        // a zero timespec would disarm the fd, so clamp to one microsecond
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(Duration::from_micros(1));
        trace!("timerfd armed for {:?}", delay);
        if let Err(e) = self
            .timerfd
            .set(
                Expiration::OneShot(TimeSpec::from_duration(delay)),
                TimerSetTimeFlags::empty(),
            )
        {
            warn!("timerfd_settime failed: {}", e);
        }
    }

    fn read_timerfd(&self) {
        let mut buf = [0u8; 8];
        match read(self.timerfd.as_fd().as_raw_fd(), &mut buf) {
            Ok(n) if n != buf.len() => {
                warn!("timerfd read returned {} bytes instead of 8", n);
            }
            Err(e) if e != nix::errno::Errno::EAGAIN => {
                warn!("timerfd read failed: {}", e);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::timerfd::{ClockId, TimerFlags};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Mutex, Weak};

    fn queue() -> TimerQueue {
        let timerfd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .unwrap();
        let fd = timerfd.as_fd().as_raw_fd();
        TimerQueue::new(Channel::new(Weak::new(), fd), timerfd)
    }

    fn noop() -> TimerCallback {
        Arc::new(|| {})
    }

    fn recording(order: &Arc<Mutex<Vec<u32>>>, tag: u32) -> TimerCallback {
        let order = order.clone();
        Arc::new(move || order.lock().unwrap().push(tag))
    }

    #[test]
    fn expired_prefix_pops_in_ascending_order() {
        let mut q = queue();
        let now = Instant::now();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (tag, offset_ms) in [(3u32, 30u64), (1, 10), (2, 20), (4, 500)] {
            q.insert(Timer::new(
                TimerId::next(),
                now + Duration::from_millis(offset_ms),
                None,
                recording(&order, tag),
            ));
        }

        let expired = q.take_expired(now + Duration::from_millis(100));
        assert_eq!(expired.len(), 3);
        TimerQueue::run_expired_batch(&expired);
        q.restart_expired(expired);

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        // the 500ms timer is still pending
        assert_eq!(q.timers.len(), 1);
        assert_eq!(q.active.len(), 1);
    }

    #[test]
    fn equal_expirations_fire_in_insertion_order() {
        let mut q = queue();
        let when = Instant::now() + Duration::from_millis(5);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in [10u32, 20, 30] {
            q.insert(Timer::new(TimerId::next(), when, None, recording(&order, tag)));
        }

        let expired = q.take_expired(when);
        TimerQueue::run_expired_batch(&expired);
        q.restart_expired(expired);
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn cancel_before_expiry_suppresses_callback() {
        let mut q = queue();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = TimerId::next();
        {
            let fired = fired.clone();
            q.insert(Timer::new(
                id,
                Instant::now() + Duration::from_millis(10),
                None,
                Arc::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }

        q.cancel(id);
        let expired = q.take_expired(Instant::now() + Duration::from_secs(1));
        assert!(expired.is_empty());
        q.restart_expired(expired);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_mid_batch_prevents_rearm() {
        let mut q = queue();
        let now = Instant::now();
        let id = TimerId::next();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            q.insert(Timer::new(
                id,
                now,
                Some(Duration::from_millis(10)),
                Arc::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }

        let expired = q.take_expired(now);
        assert_eq!(expired.len(), 1);
        TimerQueue::run_expired_batch(&expired);
        // a sibling callback cancels the periodic timer while the batch runs
        q.cancel(id);
        q.restart_expired(expired);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(q.timers.is_empty());
        assert!(q.active.is_empty());
    }

    #[test]
    fn periodic_rearm_advances_from_previous_expiration() {
        let mut q = queue();
        let first = Instant::now();
        let interval = Duration::from_millis(50);
        q.insert(Timer::new(TimerId::next(), first, Some(interval), noop()));

        // fire well past the nominal expiration
        let late = first + Duration::from_millis(40);
        let expired = q.take_expired(late);
        assert_eq!(expired.len(), 1);
        q.restart_expired(expired);

        let key = q.timers.keys().next().unwrap();
        assert_eq!(key.when, first + interval);
    }

    #[test]
    fn zero_interval_means_one_shot() {
        let mut q = queue();
        let now = Instant::now();
        q.insert(Timer::new(
            TimerId::next(),
            now,
            Some(Duration::ZERO),
            noop(),
        ));

        let expired = q.take_expired(now);
        assert_eq!(expired.len(), 1);
        q.restart_expired(expired);
        assert!(q.timers.is_empty());
    }
}
