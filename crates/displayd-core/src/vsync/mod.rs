//! Per-node vsync coordination.
//!
//! Many "call me on the next frame" requests for one render node collapse
//! into a single hardware request. The one hardware callback is then fanned
//! out to every waiter. A timeout guard clears the outstanding flag if the
//! hardware never answers, so the next request can try again.

pub mod software;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::timer::{TimerId, TimerManager};

pub use software::SoftwareVsyncSource;

pub type NodeId = u64;
pub type FrameRateLinkerId = u64;

pub const RANGE_MAX_REFRESHRATE: i32 = 144;
pub const DEFAULT_ANIMATOR_EXPECTED_FRAME_RATE: i32 = -1;
const NS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VsyncError {
    #[error("vsync receiver unavailable for node {0}")]
    ReceiverUnavailable(NodeId),

    #[error("vsync receiver init failed with {0}")]
    InitFailed(i32),

    #[error("vsync station for node {0} is destroyed")]
    Destroyed(NodeId),

    #[error("delay must be at least one vsync")]
    InvalidDelay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameRateRange {
    pub min: i32,
    pub max: i32,
    pub preferred: i32,
    pub kind: u32,
}

impl FrameRateRange {
    pub const fn new(min: i32, max: i32, preferred: i32, kind: u32) -> Self {
        Self {
            min,
            max,
            preferred,
            kind,
        }
    }
}

// ── External collaborators ──────────────────────────────────────────

/// One-shot hardware delivery: `(timestamp_ns, frame_count)`.
pub type HardwareVsyncFn = Box<dyn FnOnce(i64, i64) + Send>;

pub trait VsyncReceiver: Send + Sync {
    fn init(&self) -> Result<(), VsyncError>;
    fn request_next_vsync(&self, callback: HardwareVsyncFn);
    /// Refresh period in nanoseconds, if known.
    fn vsync_period(&self) -> Option<i64>;
}

pub trait FrameRateLinker: Send + Sync {
    fn id(&self) -> FrameRateLinkerId;
    fn update_frame_rate_range(&self, range: FrameRateRange, animator_expected_frame_rate: i32);
    /// Apply immediately instead of with the next frame.
    fn update_frame_rate_range_imme(&self, range: FrameRateRange);
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
}

pub trait VsyncSource: Send + Sync {
    fn create_receiver(
        &self,
        name: &str,
        linker: FrameRateLinkerId,
        node: NodeId,
    ) -> Result<Arc<dyn VsyncReceiver>, VsyncError>;

    fn create_frame_rate_linker(&self) -> Arc<dyn FrameRateLinker>;
}

// ── Callbacks ───────────────────────────────────────────────────────

type OnCallback = Box<dyn FnMut(i64, i64) + Send>;

/// A waiter. Pending membership is by identity of the `Arc`.
pub struct VsyncCallback {
    on_callback: Mutex<OnCallback>,
}

impl VsyncCallback {
    pub fn new<F>(f: F) -> Arc<Self>
    where
        F: FnMut(i64, i64) + Send + 'static,
    {
        Arc::new(Self::from_fn(f))
    }

    fn from_fn<F>(f: F) -> Self
    where
        F: FnMut(i64, i64) + Send + 'static,
    {
        Self {
            on_callback: Mutex::new(Box::new(f)),
        }
    }

    fn invoke(&self, timestamp: i64, frame_count: i64) {
        let mut f = self.on_callback.lock().unwrap_or_else(PoisonError::into_inner);
        f(timestamp, frame_count);
    }

    fn key(this: &Arc<Self>) -> usize {
        Arc::as_ptr(this) as usize
    }
}

// ── Station ─────────────────────────────────────────────────────────

struct StationState {
    destroyed: bool,
    receiver: Option<Arc<dyn VsyncReceiver>>,
    frame_rate_linker: Option<Arc<dyn FrameRateLinker>>,
    callbacks: IndexMap<usize, Arc<VsyncCallback>>,
    has_requested_vsync: bool,
    timeout_task: Option<TimerId>,
    is_first_vsync_request: bool,
    is_first_vsync_back: bool,
    last_frame_rate_range: Option<FrameRateRange>,
    last_animator_expected_frame_rate: i32,
}

pub struct VsyncStation {
    node_id: NodeId,
    weak_self: Weak<VsyncStation>,
    source: Arc<dyn VsyncSource>,
    timers: Arc<TimerManager>,
    timeout: Duration,
    request_vsync_times: AtomicI32,
    state: Mutex<StationState>,
}

impl VsyncStation {
    pub fn new(
        node_id: NodeId,
        source: Arc<dyn VsyncSource>,
        timers: Arc<TimerManager>,
        timeout: Duration,
    ) -> Arc<Self> {
        let linker = source.create_frame_rate_linker();
        info!("[Vsync] id {node_id} created");
        Arc::new_cyclic(|weak_self| Self {
            node_id,
            weak_self: weak_self.clone(),
            source,
            timers,
            timeout,
            request_vsync_times: AtomicI32::new(0),
            state: Mutex::new(StationState {
                destroyed: false,
                receiver: None,
                frame_rate_linker: Some(linker),
                callbacks: IndexMap::new(),
                has_requested_vsync: false,
                timeout_task: None,
                is_first_vsync_request: true,
                is_first_vsync_back: true,
                last_frame_rate_range: None,
                last_animator_expected_frame_rate: 0,
            }),
        })
    }

    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn lock(&self) -> MutexGuard<'_, StationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idempotent. Later operations do nothing and never reconnect.
    pub fn destroy(&self) {
        info!("[Vsync] id {} destroyed", self.node_id);
        let mut state = self.lock();
        state.destroyed = true;
        state.receiver = None;
        state.frame_rate_linker = None;
        state.callbacks.clear();
        state.has_requested_vsync = false;
        if let Some(id) = state.timeout_task.take() {
            self.timers.remove_timer(id);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    fn get_or_create_receiver_locked(
        &self,
        state: &mut StationState,
    ) -> Result<Arc<dyn VsyncReceiver>, VsyncError> {
        if state.destroyed {
            warn!("[Vsync] station {} has been destroyed", self.node_id);
            return Err(VsyncError::Destroyed(self.node_id));
        }
        if let Some(receiver) = &state.receiver {
            return Ok(Arc::clone(receiver));
        }
        let linker_id = state.frame_rate_linker.as_ref().map_or(0, |l| l.id());
        let name = format!("WM_{}", std::process::id());
        let receiver = self
            .source
            .create_receiver(&name, linker_id, self.node_id)
            .map_err(|e| {
                error!("[Vsync] fail to create vsync receiver, node {}: {e}", self.node_id);
                e
            })?;
        receiver.init().map_err(|e| {
            error!("[Vsync] fail to init vsync receiver, node {}: {e}", self.node_id);
            e
        })?;
        state.receiver = Some(Arc::clone(&receiver));
        Ok(receiver)
    }

    fn get_or_create_receiver(&self) -> Option<Arc<dyn VsyncReceiver>> {
        let mut state = self.lock();
        self.get_or_create_receiver_locked(&mut state).ok()
    }

    pub fn is_vsync_receiver_created(&self) -> bool {
        self.get_or_create_receiver().is_some()
    }

    /// Queue `callback` for the next vsync. Returns `false` if no receiver
    /// could be obtained; the callback is not queued in that case.
    pub fn request_vsync(&self, callback: Arc<VsyncCallback>) -> bool {
        let receiver = {
            let mut state = self.lock();
            let Ok(receiver) = self.get_or_create_receiver_locked(&mut state) else {
                return false;
            };

            state.callbacks.insert(VsyncCallback::key(&callback), callback);

            if state.has_requested_vsync {
                debug!("[Vsync] vsync already requested, node {}", self.node_id);
                return true;
            }
            state.has_requested_vsync = true;

            if state.is_first_vsync_request {
                state.is_first_vsync_request = false;
                info!("[Vsync] first vsync has requested, node {}", self.node_id);
            }

            if let Some(id) = state.timeout_task.take() {
                self.timers.remove_timer(id);
            }
            let weak = self.weak_self.clone();
            state.timeout_task = Some(self.timers.add_timer(self.timeout, move |id| {
                if let Some(station) = weak.upgrade() {
                    station.on_vsync_timeout(id);
                }
            }));
            receiver
        };

        self.request_vsync_times.fetch_add(1, Ordering::AcqRel);
        let weak = self.weak_self.clone();
        receiver.request_next_vsync(Box::new(move |timestamp, frame_count| {
            if let Some(station) = weak.upgrade() {
                station.vsync_callback_inner(timestamp, frame_count);
            }
        }));
        true
    }

    pub fn run_once_on_next_vsync<F>(&self, callback: F) -> bool
    where
        F: FnOnce(i64, i64) + Send + 'static,
    {
        let mut callback = Some(callback);
        self.request_vsync(VsyncCallback::new(move |timestamp, frame_count| {
            if let Some(f) = callback.take() {
                f(timestamp, frame_count);
            }
        }))
    }

    /// Run `callback` on the `delay`-th vsync from now.
    pub fn run_once_after_n_vsyncs<F>(&self, delay: u32, callback: F) -> Result<(), VsyncError>
    where
        F: FnOnce(i64, i64) + Send + 'static,
    {
        match delay {
            0 => {
                error!("[Vsync] delay vsync count must be >= 1");
                Err(VsyncError::InvalidDelay)
            },
            1 => self
                .run_once_on_next_vsync(callback)
                .then_some(())
                .ok_or(VsyncError::ReceiverUnavailable(self.node_id)),
            _ => {
                let station = self.weak_self.clone();
                let mut callback = Some(callback);
                let mut remaining = delay;
                let wrapper = Arc::new_cyclic(|me: &Weak<VsyncCallback>| {
                    let me = me.clone();
                    VsyncCallback::from_fn(move |timestamp, frame_count| {
                        remaining -= 1;
                        if remaining == 0 {
                            if let Some(f) = callback.take() {
                                f(timestamp, frame_count);
                            }
                            return;
                        }
                        if let (Some(station), Some(me)) = (station.upgrade(), me.upgrade()) {
                            station.request_vsync(me);
                        }
                    })
                });
                self.request_vsync(wrapper)
                    .then_some(())
                    .ok_or(VsyncError::ReceiverUnavailable(self.node_id))
            },
        }
    }

    fn vsync_callback_inner(&self, timestamp: i64, frame_count: i64) {
        let callbacks = {
            let mut state = self.lock();
            if state.destroyed {
                debug!("[Vsync] late vsync on destroyed station, node {}", self.node_id);
                return;
            }
            state.has_requested_vsync = false;
            let callbacks = std::mem::take(&mut state.callbacks);
            if let Some(id) = state.timeout_task.take() {
                self.timers.remove_timer(id);
            }
            if state.is_first_vsync_back {
                state.is_first_vsync_back = false;
                info!("[Vsync] first vsync has come back, node {}", self.node_id);
            }
            callbacks
        };
        for callback in callbacks.values() {
            callback.invoke(timestamp, frame_count);
        }
    }

    fn on_vsync_timeout(&self, id: TimerId) {
        let mut state = self.lock();
        if state.timeout_task != Some(id) {
            return;
        }
        warn!("[Vsync] request timed out, node {}", self.node_id);
        state.timeout_task = None;
        state.has_requested_vsync = false;
    }

    /// Whether a hardware request is outstanding.
    pub fn has_requested_vsync(&self) -> bool {
        self.lock().has_requested_vsync
    }

    pub fn pending_callbacks(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// Refresh period in nanoseconds; `0` if unknown.
    pub fn get_vsync_period(&self) -> i64 {
        self.get_or_create_receiver()
            .and_then(|receiver| receiver.vsync_period())
            .unwrap_or(0)
    }

    /// Refresh rate rounded to the nearest integer.
    pub fn get_fps(&self) -> Option<u32> {
        let period = self.get_vsync_period();
        if period <= 0 {
            return None;
        }
        Some(((NS_PER_SEC + period / 2) / period) as u32)
    }

    pub fn remove_callback(&self) {
        info!("[Vsync] remove callbacks, node {}", self.node_id);
        self.lock().callbacks.clear();
    }

    pub fn request_vsync_times(&self) -> i32 {
        self.request_vsync_times.load(Ordering::Acquire)
    }

    /// Saturates at zero.
    pub fn decrease_request_vsync_times(&self) {
        let _ = self
            .request_vsync_times
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then(|| current - 1)
            });
    }

    fn frame_rate_linker_locked(&self, state: &StationState) -> Option<Arc<dyn FrameRateLinker>> {
        if state.destroyed {
            warn!("[Vsync] station {} has been destroyed", self.node_id);
            return None;
        }
        state.frame_rate_linker.clone()
    }

    /// `0` once destroyed.
    pub fn get_frame_rate_linker_id(&self) -> FrameRateLinkerId {
        let state = self.lock();
        self.frame_rate_linker_locked(&state).map_or(0, |linker| linker.id())
    }

    /// Record the caller's rate vote and apply it if the linker is enabled.
    pub fn flush_frame_rate(&self, rate: i32, animator_expected_frame_rate: i32, rate_type: u32) {
        let mut state = self.lock();
        let Some(linker) = self.frame_rate_linker_locked(&state) else {
            return;
        };
        let range = FrameRateRange::new(0, RANGE_MAX_REFRESHRATE, rate, rate_type);
        state.last_frame_rate_range = Some(range);
        state.last_animator_expected_frame_rate = animator_expected_frame_rate;
        if linker.is_enabled() {
            debug!("[Vsync] rate {rate}, linker {}", linker.id());
            linker.update_frame_rate_range(range, animator_expected_frame_rate);
        }
    }

    /// Disabling clears the vote; enabling restores the last one.
    pub fn set_frame_rate_linker_enable(&self, enabled: bool) {
        let state = self.lock();
        let Some(linker) = self.frame_rate_linker_locked(&state) else {
            return;
        };
        if !enabled {
            let range = FrameRateRange::new(0, RANGE_MAX_REFRESHRATE, 0, 0);
            info!("[Vsync] clear rate vote, linker {}", linker.id());
            linker.update_frame_rate_range(range, DEFAULT_ANIMATOR_EXPECTED_FRAME_RATE);
            linker.update_frame_rate_range_imme(range);
        } else if let Some(range) = state.last_frame_rate_range {
            linker.update_frame_rate_range(range, state.last_animator_expected_frame_rate);
        }
        linker.set_enabled(enabled);
    }
}

impl Drop for VsyncStation {
    fn drop(&mut self) {
        debug!("[Vsync] id {} destructed", self.node_id);
    }
}
