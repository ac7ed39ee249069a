//! Thread-driven vsync source for hosts without a compositor.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{
    FrameRateLinker, FrameRateLinkerId, FrameRateRange, HardwareVsyncFn, NodeId, VsyncError,
    VsyncReceiver, VsyncSource,
};

struct Ticker {
    period: Duration,
    pending: Mutex<Vec<HardwareVsyncFn>>,
    frame_count: AtomicI64,
    shutdown: AtomicBool,
}

impl Ticker {
    fn run(&self) {
        let start = Instant::now();
        let mut next = start + self.period;
        while !self.shutdown.load(Ordering::Acquire) {
            let now = Instant::now();
            if now < next {
                thread::sleep(next - now);
            }
            next += self.period;

            let due = std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
            let frame = self.frame_count.fetch_add(1, Ordering::AcqRel) + 1;
            if due.is_empty() {
                continue;
            }
            let timestamp = i64::try_from(start.elapsed().as_nanos()).unwrap_or(i64::MAX);
            for callback in due {
                callback(timestamp, frame);
            }
        }
    }
}

/// Ticks at a fixed rate on its own thread. Every receiver it hands out
/// shares the same tick.
pub struct SoftwareVsyncSource {
    ticker: Arc<Ticker>,
    worker: Option<JoinHandle<()>>,
    next_linker_id: AtomicU64,
}

impl SoftwareVsyncSource {
    pub fn new(refresh_rate_hz: u32) -> Self {
        let hz = u64::from(refresh_rate_hz.max(1));
        let ticker = Arc::new(Ticker {
            period: Duration::from_nanos(1_000_000_000 / hz),
            pending: Mutex::new(Vec::new()),
            frame_count: AtomicI64::new(0),
            shutdown: AtomicBool::new(false),
        });
        let thread_ticker = Arc::clone(&ticker);
        let worker = thread::Builder::new()
            .name("displayd-vsync".into())
            .spawn(move || thread_ticker.run())
            .map_err(|e| warn!("[Vsync] failed to spawn software vsync thread: {e}"))
            .ok();
        Self {
            ticker,
            worker,
            next_linker_id: AtomicU64::new(1),
        }
    }

    pub fn period(&self) -> Duration {
        self.ticker.period
    }
}

impl Drop for SoftwareVsyncSource {
    fn drop(&mut self) {
        self.ticker.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl VsyncSource for SoftwareVsyncSource {
    fn create_receiver(
        &self,
        name: &str,
        linker: FrameRateLinkerId,
        node: NodeId,
    ) -> Result<Arc<dyn VsyncReceiver>, VsyncError> {
        if self.worker.is_none() {
            return Err(VsyncError::ReceiverUnavailable(node));
        }
        debug!("[Vsync] software receiver {name} for node {node}, linker {linker}");
        Ok(Arc::new(SoftwareReceiver {
            ticker: Arc::clone(&self.ticker),
        }))
    }

    fn create_frame_rate_linker(&self) -> Arc<dyn FrameRateLinker> {
        Arc::new(SoftwareFrameRateLinker {
            id: self.next_linker_id.fetch_add(1, Ordering::Relaxed),
            enabled: AtomicBool::new(true),
            vote: Mutex::new(None),
        })
    }
}

struct SoftwareReceiver {
    ticker: Arc<Ticker>,
}

impl VsyncReceiver for SoftwareReceiver {
    fn init(&self) -> Result<(), VsyncError> {
        Ok(())
    }

    fn request_next_vsync(&self, callback: HardwareVsyncFn) {
        self.ticker
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn vsync_period(&self) -> Option<i64> {
        i64::try_from(self.ticker.period.as_nanos()).ok()
    }
}

/// Remembers the last vote; there is no rate to actually change.
struct SoftwareFrameRateLinker {
    id: FrameRateLinkerId,
    enabled: AtomicBool,
    vote: Mutex<Option<(FrameRateRange, i32)>>,
}

impl FrameRateLinker for SoftwareFrameRateLinker {
    fn id(&self) -> FrameRateLinkerId {
        self.id
    }

    fn update_frame_rate_range(&self, range: FrameRateRange, animator_expected_frame_rate: i32) {
        debug!("[Vsync] linker {} vote {range:?}", self.id);
        *self.vote.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((range, animator_expected_frame_rate));
    }

    fn update_frame_rate_range_imme(&self, range: FrameRateRange) {
        self.update_frame_rate_range(range, super::DEFAULT_ANIMATOR_EXPECTED_FRAME_RATE);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}
