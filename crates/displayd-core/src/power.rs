//! Screen power state machine.
//!
//! Table driven: `(state, event) -> Transition`. An event with no entry for
//! the current state is rejected and changes nothing. A transition may arm
//! a timeout keyed by its target state; if no follow-up event cancels it,
//! the timeout action runs and the machine moves to the timeout target on
//! its own.
//!
//! Actions run with the machine lock held and call out to a
//! [`ScreenPowerActions`] implementation, which must never call back into
//! the machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::PowerConfig;
use crate::display::{
    power_status_for, wire_enum, DisplayState, PowerStateChangeReason, ScreenId,
    ScreenPowerState, ScreenPowerStatus, MAIN_SCREEN_ID,
};
use crate::timer::{TimerId, TimerManager};

wire_enum! {
    pub enum ScreenTransitionState {
        Init = 0,
        ScreenOn = 1,
        ScreenOff = 2,
        WaitScreenOnReady = 3,
        WaitLockScreenInd = 4,
        WaitScreenCtrlRsp = 5,
        ScreenAod = 6,
        ScreenAdvancedOn = 7,
        ScreenDoze = 8,
        ScreenDozeSuspend = 9,
        WaitScreenAdvancedOnReady = 10,
    }
}

impl ScreenTransitionState {
    pub const ALL: [Self; 11] = [
        Self::Init,
        Self::ScreenOn,
        Self::ScreenOff,
        Self::WaitScreenOnReady,
        Self::WaitLockScreenInd,
        Self::WaitScreenCtrlRsp,
        Self::ScreenAod,
        Self::ScreenAdvancedOn,
        Self::ScreenDoze,
        Self::ScreenDozeSuspend,
        Self::WaitScreenAdvancedOnReady,
    ];
}

wire_enum! {
    pub enum ScreenPowerEvent {
        PowerOn = 0,
        PowerOff = 1,
        PowerOnDirectly = 2,
        PowerOffDirectly = 3,
        SetDisplayState = 4,
        SetDisplayStateDoze = 5,
        SetDisplayStateDozeSuspend = 6,
        Suspend = 7,
        SuspendBegin = 8,
        WakeUpBegin = 9,
        WakeUpBeginAdvanced = 10,
        SyncPowerOn = 11,
        DmsPowerCbEnd = 12,
        AodEnterSuccess = 13,
        AodEnterFail = 14,
        AdvancedOn = 15,
        AdvancedOff = 16,
        Doze = 17,
        DozeSuspend = 18,
        SetScreenPowerForAllPowerOn = 19,
        SetScreenPowerForAllPowerOff = 20,
    }
}

impl ScreenPowerEvent {
    pub const ALL: [Self; 21] = [
        Self::PowerOn,
        Self::PowerOff,
        Self::PowerOnDirectly,
        Self::PowerOffDirectly,
        Self::SetDisplayState,
        Self::SetDisplayStateDoze,
        Self::SetDisplayStateDozeSuspend,
        Self::Suspend,
        Self::SuspendBegin,
        Self::WakeUpBegin,
        Self::WakeUpBeginAdvanced,
        Self::SyncPowerOn,
        Self::DmsPowerCbEnd,
        Self::AodEnterSuccess,
        Self::AodEnterFail,
        Self::AdvancedOn,
        Self::AdvancedOff,
        Self::Doze,
        Self::DozeSuspend,
        Self::SetScreenPowerForAllPowerOn,
        Self::SetScreenPowerForAllPowerOff,
    ];
}

/// Argument carried by a power event to its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerPayload {
    Reason(PowerStateChangeReason),
    DisplayState(DisplayState),
    ScreenPower {
        screen: ScreenId,
        status: ScreenPowerStatus,
    },
    ForAll {
        state: ScreenPowerState,
        reason: PowerStateChangeReason,
    },
}

impl PowerPayload {
    pub const fn reason(self) -> Option<PowerStateChangeReason> {
        match self {
            Self::Reason(reason) | Self::ForAll { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub const fn display_state(self) -> Option<DisplayState> {
        match self {
            Self::DisplayState(state) => Some(state),
            _ => None,
        }
    }

    /// `ForAll` resolves to the main screen.
    pub const fn screen_power(self) -> Option<(ScreenId, ScreenPowerStatus)> {
        match self {
            Self::ScreenPower { screen, status } => Some((screen, status)),
            Self::ForAll { state, reason } => match power_status_for(state, reason) {
                Some(status) => Some((MAIN_SCREEN_ID, status)),
                None => None,
            },
            _ => None,
        }
    }

    pub const fn power_for_all(self) -> Option<(ScreenPowerState, PowerStateChangeReason)> {
        match self {
            Self::ForAll { state, reason } => Some((state, reason)),
            _ => None,
        }
    }
}

/// Effect bound to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerAction {
    WakeUpBegin,
    SuspendBegin,
    SetDisplayState,
    SetScreenPower,
    /// Power the payload's screen on, or the main screen if the payload
    /// names none.
    ScreenPowerOn,
    RecordTransNormal,
    SetScreenPowerForAll,
    AodExitAndSetPowerOn,
    AodExitAndSetPowerOff,
    /// Leave AOD, power every screen off and pin `ScreenOff`.
    AodExitAndSetPowerAllOff,
    /// Set power; stay in the current state while the main screen is on.
    ScreenPowerOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionTimeout {
    pub after: Duration,
    pub action: PowerAction,
    pub target: ScreenTransitionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub target: ScreenTransitionState,
    pub action: PowerAction,
    pub timeout: Option<TransitionTimeout>,
}

const fn to(target: ScreenTransitionState, action: PowerAction) -> Transition {
    Transition {
        target,
        action,
        timeout: None,
    }
}

/// Effects the machine drives. Implemented by the screen manager's power
/// controller; tests use a recorder.
pub trait ScreenPowerActions: Send + Sync {
    fn wake_up_begin(&self, reason: PowerStateChangeReason) -> bool;
    fn suspend_begin(&self, reason: PowerStateChangeReason) -> bool;
    fn set_display_state(&self, state: DisplayState) -> bool;
    fn set_screen_power_status(&self, screen: ScreenId, status: ScreenPowerStatus) -> bool;
    fn set_screen_power_for_all(
        &self,
        state: ScreenPowerState,
        reason: PowerStateChangeReason,
    ) -> bool;
    fn aod_exit_and_set_power(&self, screen: ScreenId, status: ScreenPowerStatus);
    fn aod_exit_and_set_power_all_off(&self);
    /// Power of the main screen right now.
    fn main_screen_power(&self) -> ScreenPowerState;
}

type Key = (ScreenTransitionState, ScreenPowerEvent);

fn build_table(config: &PowerConfig) -> HashMap<Key, Transition> {
    use PowerAction as A;
    use ScreenPowerEvent as E;
    use ScreenTransitionState as S;

    let normal = Duration::from_millis(config.normal_timeout_ms);
    let aod = Duration::from_millis(config.aod_timeout_ms);
    let doze_wake = Transition {
        target: S::WaitScreenOnReady,
        action: A::WakeUpBegin,
        timeout: Some(TransitionTimeout {
            after: normal,
            action: A::ScreenPowerOn,
            target: S::ScreenOn,
        }),
    };

    HashMap::from([
        ((S::Init, E::PowerOnDirectly), to(S::Init, A::SetScreenPower)),
        ((S::Init, E::PowerOffDirectly), to(S::Init, A::SetScreenPower)),
        // ── SCREEN_OFF ──
        ((S::ScreenOff, E::WakeUpBegin), to(S::WaitScreenOnReady, A::WakeUpBegin)),
        ((S::ScreenOff, E::PowerOn), to(S::WaitScreenOnReady, A::WakeUpBegin)),
        ((S::ScreenOff, E::PowerOnDirectly), to(S::ScreenOn, A::SetScreenPower)),
        ((S::ScreenOff, E::PowerOffDirectly), to(S::ScreenOff, A::SetScreenPower)),
        ((S::ScreenOff, E::AdvancedOn), to(S::ScreenAdvancedOn, A::SetScreenPower)),
        ((S::ScreenOff, E::SetDisplayStateDoze), to(S::ScreenDoze, A::SetDisplayState)),
        (
            (S::ScreenOff, E::SetDisplayStateDozeSuspend),
            to(S::ScreenDozeSuspend, A::SetDisplayState),
        ),
        ((S::ScreenOff, E::SuspendBegin), to(S::ScreenOff, A::RecordTransNormal)),
        ((S::ScreenOff, E::SetDisplayState), to(S::ScreenOff, A::RecordTransNormal)),
        // ── WAIT_SCREEN_ON_READY ──
        (
            (S::WaitScreenOnReady, E::SetDisplayState),
            to(S::WaitScreenOnReady, A::SetDisplayState),
        ),
        ((S::WaitScreenOnReady, E::PowerOn), to(S::ScreenOn, A::SetScreenPower)),
        ((S::WaitScreenOnReady, E::SyncPowerOn), to(S::ScreenOn, A::RecordTransNormal)),
        // ── SCREEN_ON ──
        ((S::ScreenOn, E::WakeUpBegin), to(S::WaitScreenOnReady, A::WakeUpBegin)),
        ((S::ScreenOn, E::SuspendBegin), to(S::ScreenOn, A::SuspendBegin)),
        ((S::ScreenOn, E::SetDisplayState), to(S::WaitLockScreenInd, A::SetDisplayState)),
        (
            (S::ScreenOn, E::SetDisplayStateDoze),
            to(S::WaitLockScreenInd, A::SetDisplayState),
        ),
        (
            (S::ScreenOn, E::SetDisplayStateDozeSuspend),
            to(S::WaitLockScreenInd, A::SetDisplayState),
        ),
        ((S::ScreenOn, E::PowerOffDirectly), to(S::ScreenOff, A::ScreenPowerOff)),
        ((S::ScreenOn, E::PowerOnDirectly), to(S::ScreenOn, A::SetScreenPower)),
        // ── WAIT_LOCK_SCREEN_IND ──
        ((S::WaitLockScreenInd, E::PowerOff), to(S::ScreenOff, A::SetScreenPower)),
        ((S::WaitLockScreenInd, E::Doze), to(S::ScreenDoze, A::SetScreenPower)),
        ((S::WaitLockScreenInd, E::Suspend), to(S::WaitLockScreenInd, A::SetScreenPower)),
        (
            (S::WaitLockScreenInd, E::DmsPowerCbEnd),
            Transition {
                target: S::WaitScreenCtrlRsp,
                action: A::RecordTransNormal,
                timeout: Some(TransitionTimeout {
                    after: aod,
                    action: A::AodExitAndSetPowerAllOff,
                    target: S::ScreenOff,
                }),
            },
        ),
        // ── WAIT_SCREEN_CTRL_RSP ──
        (
            (S::WaitScreenCtrlRsp, E::PowerOnDirectly),
            to(S::ScreenOn, A::AodExitAndSetPowerOn),
        ),
        ((S::WaitScreenCtrlRsp, E::AodEnterFail), to(S::ScreenOff, A::AodExitAndSetPowerOff)),
        (
            (S::WaitScreenCtrlRsp, E::PowerOffDirectly),
            to(S::ScreenOff, A::AodExitAndSetPowerOff),
        ),
        ((S::WaitScreenCtrlRsp, E::AdvancedOn), to(S::ScreenAdvancedOn, A::SetScreenPower)),
        ((S::WaitScreenCtrlRsp, E::AodEnterSuccess), to(S::ScreenAod, A::RecordTransNormal)),
        ((S::WaitScreenCtrlRsp, E::WakeUpBegin), to(S::WaitScreenOnReady, A::WakeUpBegin)),
        // ── SCREEN_AOD ──
        ((S::ScreenAod, E::WakeUpBegin), to(S::WaitScreenOnReady, A::WakeUpBegin)),
        ((S::ScreenAod, E::AdvancedOn), to(S::ScreenAdvancedOn, A::SetScreenPower)),
        ((S::ScreenAod, E::PowerOff), to(S::ScreenOff, A::SetScreenPower)),
        ((S::ScreenAod, E::PowerOffDirectly), to(S::ScreenOff, A::SetScreenPower)),
        // ── SCREEN_ADVANCED_ON ──
        (
            (S::ScreenAdvancedOn, E::WakeUpBegin),
            to(S::WaitScreenAdvancedOnReady, A::WakeUpBegin),
        ),
        (
            (S::ScreenAdvancedOn, E::WakeUpBeginAdvanced),
            to(S::WaitScreenAdvancedOnReady, A::WakeUpBegin),
        ),
        ((S::ScreenAdvancedOn, E::AdvancedOff), to(S::ScreenOff, A::SetScreenPower)),
        ((S::ScreenAdvancedOn, E::PowerOffDirectly), to(S::ScreenOff, A::SetScreenPower)),
        ((S::ScreenAdvancedOn, E::PowerOnDirectly), to(S::ScreenOn, A::ScreenPowerOn)),
        ((S::ScreenAdvancedOn, E::SuspendBegin), to(S::ScreenAdvancedOn, A::SuspendBegin)),
        (
            (S::ScreenAdvancedOn, E::SetDisplayState),
            to(S::WaitLockScreenInd, A::SetDisplayState),
        ),
        // ── SCREEN_DOZE ──
        ((S::ScreenDoze, E::WakeUpBegin), doze_wake),
        ((S::ScreenDoze, E::PowerOn), doze_wake),
        ((S::ScreenDoze, E::PowerOff), to(S::ScreenOff, A::SetScreenPower)),
        ((S::ScreenDoze, E::DozeSuspend), to(S::ScreenDozeSuspend, A::SetScreenPower)),
        ((S::ScreenDoze, E::SetDisplayState), to(S::ScreenOff, A::SetDisplayState)),
        (
            (S::ScreenDoze, E::SetDisplayStateDozeSuspend),
            to(S::ScreenDozeSuspend, A::SetDisplayState),
        ),
        // ── SCREEN_DOZE_SUSPEND ──
        ((S::ScreenDozeSuspend, E::Doze), to(S::ScreenDoze, A::SetScreenPower)),
        ((S::ScreenDozeSuspend, E::WakeUpBegin), doze_wake),
        ((S::ScreenDozeSuspend, E::PowerOn), doze_wake),
        ((S::ScreenDozeSuspend, E::SetDisplayState), to(S::ScreenOff, A::SetDisplayState)),
        (
            (S::ScreenDozeSuspend, E::SetDisplayStateDoze),
            to(S::ScreenDoze, A::SetDisplayState),
        ),
        // ── WAIT_SCREEN_ADVANCED_ON_READY ──
        (
            (S::WaitScreenAdvancedOnReady, E::SetScreenPowerForAllPowerOn),
            to(S::ScreenOn, A::SetScreenPowerForAll),
        ),
        (
            (S::WaitScreenAdvancedOnReady, E::SetScreenPowerForAllPowerOff),
            to(S::ScreenOff, A::SetScreenPowerForAll),
        ),
    ])
}

// ── Machine ──────────────────────────────────────────────────────────

struct Core {
    state: ScreenTransitionState,
    power_status: ScreenPowerStatus,
    /// Set by an action that already chose the next state.
    forced: bool,
    /// Timeout guards, keyed by the state they watch.
    armed: HashMap<ScreenTransitionState, TimerId>,
    init_ref_cnt: u32,
    init_ref: u32,
}

impl Core {
    fn set_state(&mut self, state: ScreenTransitionState) {
        info!(
            "[ScreenPower FSM] from {:?} to {:?}",
            self.state, state
        );
        self.state = state;
    }

    fn force(&mut self, state: ScreenTransitionState) {
        self.forced = true;
        self.set_state(state);
    }
}

struct Inner {
    core: Mutex<Core>,
    table: HashMap<Key, Transition>,
    actions: Arc<dyn ScreenPowerActions>,
    timers: Arc<TimerManager>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop_timer(&self, core: &mut Core, state: ScreenTransitionState) {
        if let Some(id) = core.armed.remove(&state) {
            debug!("[ScreenPower FSM] stop {id} for {state:?}");
            self.timers.remove_timer(id);
        }
    }

    fn run_action(
        &self,
        core: &mut Core,
        action: PowerAction,
        event: ScreenPowerEvent,
        payload: PowerPayload,
    ) -> bool {
        debug!("[ScreenPower FSM] {action:?} for {event:?}");
        let actions = &*self.actions;
        let missing = |what: &str| {
            warn!("[ScreenPower FSM] {action:?}: payload {payload:?} carries no {what}");
            false
        };
        match action {
            PowerAction::WakeUpBegin => match payload.reason() {
                Some(reason) => actions.wake_up_begin(reason),
                None => missing("reason"),
            },
            PowerAction::SuspendBegin => match payload.reason() {
                Some(reason) => actions.suspend_begin(reason),
                None => missing("reason"),
            },
            PowerAction::SetDisplayState => match payload.display_state() {
                Some(state) => actions.set_display_state(state),
                None => missing("display state"),
            },
            PowerAction::SetScreenPower => match payload.screen_power() {
                Some((screen, status)) => Self::set_screen_power(actions, core, screen, status),
                None => missing("screen power"),
            },
            PowerAction::ScreenPowerOn => {
                let (screen, status) = payload
                    .screen_power()
                    .unwrap_or((MAIN_SCREEN_ID, ScreenPowerStatus::On));
                actions.set_screen_power_status(screen, status);
                true
            },
            PowerAction::RecordTransNormal => true,
            PowerAction::SetScreenPowerForAll => match payload.power_for_all() {
                Some((state, reason)) => actions.set_screen_power_for_all(state, reason),
                None => missing("power-for-all request"),
            },
            PowerAction::AodExitAndSetPowerOn => {
                let screen = payload.screen_power().map_or(MAIN_SCREEN_ID, |(s, _)| s);
                actions.aod_exit_and_set_power(screen, ScreenPowerStatus::On);
                true
            },
            PowerAction::AodExitAndSetPowerOff => match payload.screen_power() {
                Some((screen, status)) => {
                    actions.aod_exit_and_set_power(screen, status);
                    true
                },
                None => missing("screen power"),
            },
            PowerAction::AodExitAndSetPowerAllOff => {
                actions.aod_exit_and_set_power_all_off();
                core.force(ScreenTransitionState::ScreenOff);
                true
            },
            PowerAction::ScreenPowerOff => {
                let Some((screen, status)) = payload.screen_power() else {
                    return missing("screen power");
                };
                if !Self::set_screen_power(actions, core, screen, status) {
                    return false;
                }
                if actions.main_screen_power() != ScreenPowerState::Off {
                    info!(
                        "[ScreenPower FSM] main screen is on, stay in {:?} for {event:?}",
                        core.state
                    );
                    let current = core.state;
                    core.force(current);
                }
                true
            },
        }
    }

    fn set_screen_power(
        actions: &dyn ScreenPowerActions,
        core: &mut Core,
        screen: ScreenId,
        status: ScreenPowerStatus,
    ) -> bool {
        if !actions.set_screen_power_status(screen, status) {
            warn!("[ScreenPower FSM] set screen {screen} power {status:?} failed");
            return false;
        }
        core.power_status = status;
        true
    }

    fn on_timeout(
        &self,
        id: TimerId,
        key: Key,
        watched: ScreenTransitionState,
        payload: PowerPayload,
    ) {
        let mut core = self.lock();
        if core.armed.get(&watched) != Some(&id) {
            debug!("[ScreenPower FSM] stale {id} for {watched:?}");
            return;
        }
        core.armed.remove(&watched);
        let Some(timeout) = self.table.get(&key).and_then(|t| t.timeout) else {
            return;
        };
        warn!(
            "[ScreenPower FSM] timeout after {:?} in {:?}, running {:?}",
            timeout.after, core.state, timeout.action
        );
        core.forced = false;
        self.run_action(&mut core, timeout.action, key.1, payload);
        if !core.forced {
            core.set_state(timeout.target);
        }
        core.forced = false;
    }
}

/// The device-wide screen power machine. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct ScreenStateMachine {
    inner: Arc<Inner>,
}

impl ScreenStateMachine {
    /// A machine in `Init`. Call [`init_state_machine`](Self::init_state_machine)
    /// once screens are known.
    pub fn new(
        actions: Arc<dyn ScreenPowerActions>,
        timers: Arc<TimerManager>,
        config: &PowerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state: ScreenTransitionState::Init,
                    power_status: ScreenPowerStatus::On,
                    forced: false,
                    armed: HashMap::new(),
                    init_ref_cnt: 0,
                    init_ref: 0,
                }),
                table: build_table(config),
                actions,
                timers,
            }),
        }
    }

    /// With `ref_cnt == 0` the machine goes straight to `ScreenOn`;
    /// otherwise it waits for that many
    /// [`inc_screen_state_init_ref`](Self::inc_screen_state_init_ref) calls.
    pub fn init_state_machine(&self, ref_cnt: u32) {
        let mut core = self.inner.lock();
        core.init_ref_cnt = ref_cnt;
        core.init_ref = 0;
        if ref_cnt == 0 {
            info!("[ScreenPower FSM] init end, set transition state to ScreenOn");
            core.set_state(ScreenTransitionState::ScreenOn);
        }
    }

    pub fn inc_screen_state_init_ref(&self) {
        let mut core = self.inner.lock();
        core.init_ref += 1;
        debug!(
            "[ScreenPower FSM] init ref {}/{}",
            core.init_ref, core.init_ref_cnt
        );
        if core.init_ref == core.init_ref_cnt && core.state == ScreenTransitionState::Init {
            info!("[ScreenPower FSM] init end, set transition state to ScreenOn");
            core.set_state(ScreenTransitionState::ScreenOn);
        }
    }

    /// Apply `event`. Returns `false` if the event is illegal in the
    /// current state (nothing changes) or if the bound action failed (the
    /// transition still happened).
    pub fn handle_power_state_change(&self, event: ScreenPowerEvent, payload: PowerPayload) -> bool {
        let mut core = self.inner.lock();
        let origin = core.state;
        info!("[ScreenPower FSM] enter, current {origin:?}, event {event:?}");

        let Some(transition) = self.inner.table.get(&(origin, event)).copied() else {
            info!("[ScreenPower FSM] invalid transition {origin:?} + {event:?}");
            return false;
        };

        self.inner.stop_timer(&mut core, origin);
        core.forced = false;
        let ret = self.inner.run_action(&mut core, transition.action, event, payload);

        match transition.timeout {
            Some(timeout) => {
                // A self-transition stopped this guard above; re-arm it.
                self.inner.stop_timer(&mut core, transition.target);
                let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                let key = (origin, event);
                let watched = transition.target;
                let id = self.inner.timers.add_timer(timeout.after, move |id| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_timeout(id, key, watched, payload);
                    }
                });
                core.armed.insert(watched, id);
            },
            None => self.inner.stop_timer(&mut core, transition.target),
        }

        if !core.forced && core.state == origin {
            core.set_state(transition.target);
        }
        core.forced = false;
        ret
    }

    pub fn transition_state(&self) -> ScreenTransitionState {
        self.inner.lock().state
    }

    /// Overwrite the state without running any action.
    pub fn set_transition_state(&self, state: ScreenTransitionState) {
        self.inner.lock().set_state(state);
    }

    pub fn current_power_status(&self) -> ScreenPowerStatus {
        self.inner.lock().power_status
    }

    pub fn transition(
        &self,
        state: ScreenTransitionState,
        event: ScreenPowerEvent,
    ) -> Option<Transition> {
        self.inner.table.get(&(state, event)).copied()
    }

    /// Whether a timeout guard is armed for `state`.
    pub fn has_pending_timeout(&self, state: ScreenTransitionState) -> bool {
        self.inner.lock().armed.contains_key(&state)
    }
}
