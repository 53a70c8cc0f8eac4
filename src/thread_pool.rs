//! Loop-per-thread workers.
//!
//! [`EventLoopThread`] spawns a named thread, builds an [`EventLoop`] on it
//! and hands the `Arc` back over a channel before the thread enters `run()`.
//! [`EventLoopThreadPool`] keeps a fixed set of such workers and deals loops
//! out round-robin; with zero workers every caller gets the base loop, which
//! collapses the pool into a single-threaded setup.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::error::{Error, Result};
use crate::event_loop::EventLoop;

pub struct EventLoopThread {
    event_loop: Arc<EventLoop>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawns a thread named `name` and blocks until its loop is constructed
    /// and ready to accept work.
    pub fn start(name: &str) -> Result<EventLoopThread> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || match EventLoop::new() {
                Ok(event_loop) => {
                    if tx.send(Ok(event_loop.clone())).is_err() {
                        return;
                    }
                    if let Err(e) = event_loop.run() {
                        error!("event loop thread exited with error: {}", e);
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                }
            })
            .map_err(|e| Error::ThreadStart(e.to_string()))?;

        let event_loop = rx
            .recv()
            .map_err(|_| Error::ThreadStart("worker exited before handshake".into()))??;
        debug!("event loop thread {:?} started", handle.thread().name());
        Ok(EventLoopThread {
            event_loop,
            handle: Some(handle),
        })
    }

    pub fn event_loop(&self) -> Arc<EventLoop> {
        self.event_loop.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("event loop thread panicked");
            }
        }
    }
}

pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    num_threads: usize,
    workers: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
    next: AtomicUsize,
    started: AtomicBool,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>, num_threads: usize) -> Self {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            num_threads,
            workers: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the worker threads. Idempotent on success; a failed start tears
    /// down any partial set of workers and may be retried.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.spawn_workers() {
            self.loops.lock().unwrap().clear();
            self.workers.lock().unwrap().clear();
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        debug!("pool {} started {} workers", self.name, self.num_threads);
        Ok(())
    }

    fn spawn_workers(&self) -> Result<()> {
        for i in 0..self.num_threads {
            let worker = EventLoopThread::start(&format!("{}-worker-{}", self.name, i))?;
            self.loops.lock().unwrap().push(worker.event_loop());
            self.workers.lock().unwrap().push(worker);
        }
        Ok(())
    }

    /// Next loop in round-robin order; the base loop when the pool is empty.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[i].clone()
    }

    pub fn base_loop(&self) -> Arc<EventLoop> {
        self.base_loop.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn worker_loop_accepts_cross_thread_tasks() {
        let worker = EventLoopThread::start("test-worker").unwrap();
        let lp = worker.event_loop();

        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            lp.queue_in_loop(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        let start = std::time::Instant::now();
        while ran.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // Drop joins the worker
    }

    #[test]
    fn empty_pool_hands_out_the_base_loop() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base.clone(), "empty", 0);
        pool.start().unwrap();

        for _ in 0..3 {
            assert!(Arc::ptr_eq(&pool.next_loop(), &base));
        }
    }

    #[test]
    fn pool_round_robins_across_workers() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base.clone(), "rr", 2);
        pool.start().unwrap();

        let a = pool.next_loop();
        let b = pool.next_loop();
        let c = pool.next_loop();

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &base));
        assert!(!Arc::ptr_eq(&b, &base));
        // wrapped around
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn failed_start_can_be_retried() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base.clone(), "retry", 1);

        crate::test_util::with_fd_table_full(|| {
            // the worker cannot build its epoll/eventfd/timerfd triple
            assert!(pool.start().is_err());
        });
        assert!(pool.loops.lock().unwrap().is_empty());

        pool.start().unwrap();
        assert_eq!(pool.loops.lock().unwrap().len(), 1);
        assert!(!Arc::ptr_eq(&pool.next_loop(), &base));
    }

    #[test]
    fn start_is_idempotent() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base, "once", 1);
        pool.start().unwrap();
        pool.start().unwrap();
        assert_eq!(pool.loops.lock().unwrap().len(), 1);
    }
}
