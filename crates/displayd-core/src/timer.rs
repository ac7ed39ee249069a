//! Delay/cancel timer facility.
//!
//! One background thread per [`TimerManager`] sleeps until the earliest
//! expiry and runs due callbacks after releasing its lock, so a callback
//! may freely add or remove timers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Identifier handed out by [`TimerManager::add_timer`]. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer:{}", self.0)
    }
}

type TimerCallback = Box<dyn FnOnce(TimerId) + Send>;

#[derive(Default)]
struct Timers {
    /// Ordered by (expiry, id) so equal deadlines fire in creation order.
    queue: BTreeMap<(Instant, TimerId), TimerCallback>,
    expiry: HashMap<TimerId, Instant>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    timers: Mutex<Timers>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the timer thread. Dropping the manager stops the thread; pending
/// timers are discarded without firing.
pub struct TimerManager {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TimerManager {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            timers: Mutex::new(Timers::default()),
            wakeup: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("displayd-timer".into())
            .spawn(move || run(&thread_shared))
            .map_err(|e| warn!("[Timer] failed to spawn timer thread: {e}"))
            .ok();
        Self { shared, worker }
    }

    /// Schedule `callback` to run once after `delay`.
    pub fn add_timer<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce(TimerId) + Send + 'static,
    {
        let mut timers = self.shared.lock();
        let id = TimerId(timers.next_id);
        timers.next_id += 1;
        let deadline = Instant::now() + delay;
        timers.queue.insert((deadline, id), Box::new(callback));
        timers.expiry.insert(id, deadline);
        drop(timers);
        self.shared.wakeup.notify_one();
        debug!("[Timer] armed {id} in {delay:?}");
        id
    }

    /// Cancel a pending timer. Returns `false` if the id is unknown, already
    /// fired or already removed.
    pub fn remove_timer(&self, id: TimerId) -> bool {
        let mut timers = self.shared.lock();
        let Some(deadline) = timers.expiry.remove(&id) else {
            return false;
        };
        timers.queue.remove(&(deadline, id));
        debug!("[Timer] removed {id}");
        true
    }

    /// Number of timers that have not fired yet.
    pub fn pending(&self) -> usize {
        self.shared.lock().expiry.len()
    }

    /// Time until the earliest pending timer, if any.
    pub fn next_delay(&self) -> Option<Duration> {
        let timers = self.shared.lock();
        timers
            .queue
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(Instant::now()))
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            // A callback may drop the last handle from the timer thread itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run(shared: &Shared) {
    let mut timers = shared.lock();
    loop {
        if timers.shutdown {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(entry) = timers.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), callback) = entry.remove_entry();
            timers.expiry.remove(&id);
            due.push((id, callback));
        }

        if !due.is_empty() {
            drop(timers);
            for (id, callback) in due {
                debug!("[Timer] firing {id}");
                callback(id);
            }
            timers = shared.lock();
            continue;
        }

        timers = match timers.queue.keys().next() {
            Some(&(deadline, _)) => {
                let wait = deadline.saturating_duration_since(now);
                shared
                    .wakeup
                    .wait_timeout(timers, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            },
            None => shared
                .wakeup
                .wait(timers)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}
