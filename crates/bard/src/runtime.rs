//! Thread plumbing: start gate, worker handles and ordered locks.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

/// A one-shot gate that holds worker threads spawned during bootstrap until
/// everything is wired up, so startup ordering is deterministic.
#[derive(Debug, Default)]
pub struct StartGate {
    released: Mutex<bool>,
    cv: Condvar,
}

impl StartGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until the gate is released. Returns immediately afterwards.
    pub fn wait(&self) {
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.cv.wait(released).unwrap();
        }
    }

    /// Release every waiting thread. Idempotent.
    pub fn release(&self) {
        let mut released = self.released.lock().unwrap();
        if !*released {
            debug!("releasing thread start gate");
            *released = true;
            self.cv.notify_all();
        }
    }
}

/// Shared stop/stopped flags for a worker thread.
#[derive(Debug, Default)]
pub struct StopFlag {
    should_stop: AtomicBool,
    stopped: AtomicBool,
}

impl StopFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    pub fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// A joinable worker thread with cooperative shutdown.
///
/// The closure receives the stop flag and must poll it between units of
/// work; [`Worker::shutdown`] requests the stop and joins.
pub struct Worker {
    name: String,
    flag: Arc<StopFlag>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: &str, gate: Arc<StartGate>, body: F) -> Self
    where
        F: FnOnce(Arc<StopFlag>) + Send + 'static,
    {
        let flag = StopFlag::new();
        let thread_flag = flag.clone();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                gate.wait();
                body(thread_flag.clone());
                thread_flag.mark_stopped();
                debug!("worker {thread_name} stopped");
            })
            .expect("spawning worker thread");

        Self {
            name: name.to_string(),
            flag,
            handle: Some(handle),
        }
    }

    pub fn stop_flag(&self) -> Arc<StopFlag> {
        self.flag.clone()
    }

    pub fn request_stop(&self) {
        self.flag.request_stop();
    }

    /// Request the stop and join the thread.
    pub fn shutdown(&mut self) {
        self.flag.request_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("worker {} panicked during shutdown", self.name);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleep in small slices so a stop request is honored promptly.
pub fn interruptible_sleep(flag: &StopFlag, total: Duration) {
    let slice = Duration::from_millis(20);
    let mut remaining = total;
    while !flag.should_stop() && remaining > Duration::ZERO {
        let d = remaining.min(slice);
        std::thread::sleep(d);
        remaining = remaining.saturating_sub(d);
    }
}

thread_local! {
    static HELD_RANKS: RefCell<Vec<(u8, &'static str)>> = const { RefCell::new(Vec::new()) };
}

/// A mutex with a fixed position in the global lock order.
///
/// Debug builds assert that locks are only taken in increasing rank order
/// per thread, which makes an ordering cycle a loud failure instead of a
/// rare deadlock. Release builds compile the checking away.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    name: &'static str,
    rank: u8,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(name: &'static str, rank: u8, value: T) -> Self {
        Self {
            name,
            rank,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedGuard<'_, T> {
        #[cfg(debug_assertions)]
        HELD_RANKS.with(|held| {
            let held = held.borrow();
            if let Some((rank, name)) = held.last() {
                assert!(
                    *rank < self.rank,
                    "lock order violation: acquiring {} (rank {}) while holding {} (rank {})",
                    self.name,
                    self.rank,
                    name,
                    rank
                );
            }
        });

        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        #[cfg(debug_assertions)]
        HELD_RANKS.with(|held| held.borrow_mut().push((self.rank, self.name)));

        OrderedGuard {
            rank: self.rank,
            guard,
        }
    }
}

/// Guard for [`OrderedMutex`]; pops the rank record on drop.
pub struct OrderedGuard<'a, T> {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    rank: u8,
    guard: MutexGuard<'a, T>,
}

impl<T> std::ops::Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        HELD_RANKS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|(r, _)| *r == self.rank) {
                held.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn start_gate_holds_workers() {
        let gate = StartGate::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for i in 0..3 {
            let counter = counter.clone();
            workers.push(Worker::spawn(
                &format!("gated-{i}"),
                gate.clone(),
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        gate.release();
        for w in &mut workers {
            w.shutdown();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn worker_honors_stop_request() {
        let gate = StartGate::new();
        gate.release();

        let mut worker = Worker::spawn("looper", gate, |flag| {
            while !flag.should_stop() {
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        worker.shutdown();
        assert!(worker.stop_flag().is_stopped());
    }

    #[test]
    fn ordered_locks_allow_increasing_ranks() {
        let a = OrderedMutex::new("a", 1, 0u32);
        let b = OrderedMutex::new("b", 2, 0u32);

        let _ga = a.lock();
        let _gb = b.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "lock order violation")]
    fn ordered_locks_reject_decreasing_ranks() {
        let a = OrderedMutex::new("a", 1, 0u32);
        let b = OrderedMutex::new("b", 2, 0u32);

        let _gb = b.lock();
        let _ga = a.lock();
    }
}
