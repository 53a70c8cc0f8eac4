//! The reactor: one loop per thread.
//!
//! An [`EventLoop`] owns a selector, a timer queue and a wakeup eventfd. All
//! channel dispatch happens on the thread that created the loop; other
//! threads hand work over with [`EventLoop::run_in_loop`] or
//! [`EventLoop::queue_in_loop`] and the loop is nudged out of `epoll_wait`
//! through the eventfd.

use std::cell::Cell;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::timerfd::{ClockId, TimerFd, TimerFlags};

use crate::channel::Channel;
use crate::error::Result;
use crate::poll::{EpollSelector, Selector};
use crate::timer::{Timer, TimerCallback, TimerId, TimerQueue};

const POLL_TIMEOUT_MS: u16 = 5000;

type Task = Box<dyn FnOnce() + Send>;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the loop owned by this thread, 0 when none.
    static CURRENT_LOOP: Cell<u64> = const { Cell::new(0) };
}

pub struct EventLoop {
    id: u64,
    self_weak: Weak<EventLoop>,

    /// Locked only from the loop thread, except through the public channel
    /// update path which asserts loop-thread affinity first.
    selector: Mutex<Box<dyn Selector>>,
    timers: Mutex<TimerQueue>,

    wakeup: EventFd,
    wakeup_channel: Arc<Channel>,

    pending: Mutex<Vec<Task>>,
    running: AtomicBool,
    /// Latched by [`EventLoop::quit`] and never cleared, so a quit that lands
    /// before [`EventLoop::run`] begins still stops the loop.
    quit: AtomicBool,
    calling_pending: AtomicBool,
}

impl EventLoop {
    /// Creates the loop owned by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics when this thread already owns a loop; one loop per thread is a
    /// hard invariant, not a recoverable condition.
    pub fn new() -> Result<Arc<EventLoop>> {
        let selector = EpollSelector::new()?;
        let wakeup = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC,
        )?;
        let timerfd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;

        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        CURRENT_LOOP.with(|current| {
            if current.get() != 0 {
                error!(
                    "thread {:?} already owns event loop {}",
                    thread::current().id(),
                    current.get()
                );
                panic!("one event loop per thread");
            }
            current.set(id);
        });

        let wakeup_fd = wakeup.as_fd().as_raw_fd();
        let timer_fd = timerfd.as_fd().as_raw_fd();

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| {
            let wakeup_channel = Channel::new(weak.clone(), wakeup_fd);
            let timer_channel = Channel::new(weak.clone(), timer_fd);
            EventLoop {
                id,
                self_weak: weak.clone(),
                selector: Mutex::new(Box::new(selector)),
                timers: Mutex::new(TimerQueue::new(timer_channel, timerfd)),
                wakeup,
                wakeup_channel,
                pending: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                calling_pending: AtomicBool::new(false),
            }
        });

        {
            let weak = event_loop.self_weak.clone();
            event_loop.wakeup_channel.set_read_callback(Arc::new(move || {
                if let Some(lp) = weak.upgrade() {
                    lp.handle_wakeup();
                }
            }));
            event_loop.wakeup_channel.enable_read();
        }
        {
            let timer_channel = event_loop.timers.lock().unwrap().channel();
            let weak = event_loop.self_weak.clone();
            timer_channel.set_read_callback(Arc::new(move || {
                if let Some(lp) = weak.upgrade() {
                    lp.handle_timer_expiry();
                }
            }));
            timer_channel.enable_read();
        }

        debug!("event loop {} created on {:?}", id, thread::current().id());
        Ok(event_loop)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        CURRENT_LOOP.with(|current| current.get() == self.id)
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            error!(
                "event loop {} touched from foreign thread {:?}",
                self.id,
                thread::current().id()
            );
            panic!("event loop used off its owning thread");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs the loop on the owning thread until [`Self::quit`] is called.
    ///
    /// Each round: poll, dispatch every ready channel, then drain the
    /// cross-thread task queue.
    pub fn run(&self) -> Result<()> {
        self.assert_in_loop_thread();
        self.running.store(true, Ordering::Release);
        debug!("event loop {} running", self.id);

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            {
                let mut selector = self.selector.lock().unwrap();
                selector.select(POLL_TIMEOUT_MS, &mut active)?;
            }
            trace!("loop {}: {} channels ready", self.id, active.len());
            for channel in &active {
                channel.dispatch();
            }
            self.run_pending_tasks();
        }

        self.running.store(false, Ordering::Release);
        debug!("event loop {} stopped", self.id);
        Ok(())
    }

    /// Stops the loop after the current round. Safe from any thread, and
    /// sticky: issued before [`Self::run`] it keeps the loop from starting.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    /// Runs `task` now when called from the loop thread, otherwise queues it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` for the end of a loop round, never running it inline.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().unwrap().push(Box::new(task));
        // mid-drain tasks would otherwise wait out a full poll timeout
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wake();
        }
    }

    /// Schedules `callback` for `when`. Safe from any thread.
    pub fn run_at(&self, when: Instant, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.schedule(when, None, Arc::new(callback))
    }

    /// Schedules `callback` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.schedule(Instant::now() + delay, None, Arc::new(callback))
    }

    /// Schedules `callback` every `interval`, first firing one interval from
    /// now. A zero interval degenerates to a one-shot.
    pub fn run_every(&self, interval: Duration, callback: impl Fn() + Send + Sync + 'static) -> TimerId {
        self.schedule(Instant::now() + interval, Some(interval), Arc::new(callback))
    }

    /// Cancels a pending timer. A no-op when the timer already fired (for
    /// periodic timers: also suppresses re-arming when called from inside the
    /// expiry batch).
    pub fn cancel_timer(&self, id: TimerId) {
        let weak = self.self_weak.clone();
        self.run_in_loop(move || {
            if let Some(lp) = weak.upgrade() {
                lp.timers.lock().unwrap().cancel(id);
            }
        });
    }

    fn schedule(&self, when: Instant, interval: Option<Duration>, callback: TimerCallback) -> TimerId {
        let id = TimerId::next();
        let timer = Timer::new(id, when, interval, callback);
        let weak = self.self_weak.clone();
        self.run_in_loop(move || {
            if let Some(lp) = weak.upgrade() {
                lp.timers.lock().unwrap().insert(timer);
            }
        });
        id
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.selector.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.selector.lock().unwrap().remove_channel(channel);
    }

    fn wake(&self) {
        if let Err(e) = self.wakeup.arm() {
            warn!("loop {} wakeup write failed: {}", self.id, e);
        }
    }

    fn handle_wakeup(&self) {
        let mut buf = [0u8; 8];
        if let Err(e) = nix::unistd::read(self.wakeup.as_fd().as_raw_fd(), &mut buf) {
            if e != nix::errno::Errno::EAGAIN {
                warn!("loop {} wakeup read failed: {}", self.id, e);
            }
        }
    }

    fn handle_timer_expiry(&self) {
        // callbacks run between the two lock scopes so they may schedule or
        // cancel timers on this same loop
        let expired = self.timers.lock().unwrap().take_expired(Instant::now());
        TimerQueue::run_expired_batch(&expired);
        self.timers.lock().unwrap().restart_expired(expired);
    }

    fn run_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.pending.lock().unwrap());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // free the thread slot, but only when dropped on the owning thread;
        // a foreign-thread drop must not clobber that thread's own loop
        CURRENT_LOOP.with(|current| {
            if current.get() == self.id {
                current.set(0);
            }
        });
        debug!("event loop {} dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    fn spawn_loop() -> (Arc<EventLoop>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let lp = EventLoop::new().unwrap();
            tx.send(lp.clone()).unwrap();
            lp.run().unwrap();
        });
        (rx.recv().unwrap(), handle)
    }

    fn wait_until(deadline: Duration, pred: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        pred()
    }

    #[test]
    fn queued_task_runs_on_loop_thread() {
        let (lp, handle) = spawn_loop();
        let loop_thread = handle.thread().id();

        let observed = Arc::new(Mutex::new(None));
        {
            let observed = observed.clone();
            lp.queue_in_loop(move || {
                *observed.lock().unwrap() = Some(thread::current().id());
            });
        }

        assert!(wait_until(Duration::from_secs(2), || {
            observed.lock().unwrap().is_some()
        }));
        assert_eq!(observed.lock().unwrap().unwrap(), loop_thread);

        lp.quit();
        handle.join().unwrap();
    }

    #[test]
    fn run_in_loop_is_synchronous_on_the_loop_thread() {
        let (lp, handle) = spawn_loop();

        let inner_ran = Arc::new(AtomicBool::new(false));
        let ordered = Arc::new(AtomicBool::new(false));
        {
            let lp2 = lp.clone();
            let inner_ran = inner_ran.clone();
            let ordered = ordered.clone();
            lp.queue_in_loop(move || {
                let inner = inner_ran.clone();
                lp2.run_in_loop(move || {
                    inner.store(true, Ordering::SeqCst);
                });
                // on the owning thread run_in_loop must not defer
                ordered.store(inner_ran.load(Ordering::SeqCst), Ordering::SeqCst);
            });
        }

        assert!(wait_until(Duration::from_secs(2), || {
            ordered.load(Ordering::SeqCst)
        }));

        lp.quit();
        handle.join().unwrap();
    }

    #[test]
    fn task_queued_mid_drain_runs_without_full_poll_wait() {
        let (lp, handle) = spawn_loop();

        let second_ran = Arc::new(AtomicBool::new(false));
        {
            let lp2 = lp.clone();
            let second_ran = second_ran.clone();
            lp.queue_in_loop(move || {
                let second_ran = second_ran.clone();
                lp2.queue_in_loop(move || {
                    second_ran.store(true, Ordering::SeqCst);
                });
            });
        }

        // well under the 5s poll timeout
        let start = Instant::now();
        assert!(wait_until(Duration::from_secs(2), || {
            second_ran.load(Ordering::SeqCst)
        }));
        assert!(start.elapsed() < Duration::from_secs(2));

        lp.quit();
        handle.join().unwrap();
    }

    #[test]
    fn run_after_fires_once() {
        let (lp, handle) = spawn_loop();

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            lp.run_after(Duration::from_millis(20), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(wait_until(Duration::from_secs(2), || {
            fired.load(Ordering::SeqCst) == 1
        }));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        lp.quit();
        handle.join().unwrap();
    }

    #[test]
    fn run_every_repeats_until_cancelled() {
        let (lp, handle) = spawn_loop();

        let fired = Arc::new(AtomicUsize::new(0));
        let id = {
            let fired = fired.clone();
            lp.run_every(Duration::from_millis(10), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(wait_until(Duration::from_secs(2), || {
            fired.load(Ordering::SeqCst) >= 3
        }));

        lp.cancel_timer(id);
        // wait for the cancel to land, then verify the count stops moving
        thread::sleep(Duration::from_millis(50));
        let count = fired.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), count);

        lp.quit();
        handle.join().unwrap();
    }

    #[test]
    fn cancel_before_expiry_suppresses_the_timer() {
        let (lp, handle) = spawn_loop();

        let fired = Arc::new(AtomicUsize::new(0));
        let id = {
            let fired = fired.clone();
            lp.run_after(Duration::from_millis(200), move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        lp.cancel_timer(id);

        thread::sleep(Duration::from_millis(400));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        lp.quit();
        handle.join().unwrap();
    }

    #[test]
    fn quit_issued_before_run_is_not_lost() {
        let (tx, rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let finished = Arc::new(AtomicBool::new(false));
        let handle = {
            let finished = finished.clone();
            thread::spawn(move || {
                let lp = EventLoop::new().unwrap();
                tx.send(lp.clone()).unwrap();
                // the handle is published; run() starts only on the signal
                go_rx.recv().unwrap();
                lp.run().unwrap();
                finished.store(true, Ordering::SeqCst);
            })
        };

        let lp = rx.recv().unwrap();
        lp.quit();
        go_tx.send(()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            finished.load(Ordering::SeqCst)
        }));
        handle.join().unwrap();
    }

    #[test]
    fn quit_from_another_thread_stops_the_loop() {
        let (lp, handle) = spawn_loop();
        assert!(wait_until(Duration::from_secs(2), || lp.is_running()));
        lp.quit();
        handle.join().unwrap();
        assert!(!lp.is_running());
    }
}
