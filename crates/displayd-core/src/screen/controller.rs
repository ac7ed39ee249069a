//! Effects behind the power and fold machines.
//!
//! [`PowerController`] programs the renderer through [`RenderService`] and
//! tells the registered screen client what happened. It runs with the
//! power machine's lock held, so it only ever posts one-way notifications.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use super::client::ScreenClientProxy;
use crate::display::{
    power_status_for, DisplayPowerEvent, DisplayState, EventStatus, PowerStateChangeReason,
    ScreenEvent, ScreenId, ScreenPowerState, ScreenPowerStatus, MAIN_SCREEN_ID,
};
use crate::fold::{FoldAction, FoldTransitionHandler, SuperFoldStatus};
use crate::power::ScreenPowerActions;

/// The compositor/renderer the daemon drives.
pub trait RenderService: Send + Sync {
    fn set_screen_power_status(&self, screen: ScreenId, status: ScreenPowerStatus) -> bool;

    /// Leave always-on-display mode ahead of a power change.
    fn exit_aod(&self);
}

/// Renderer stand-in for hosts without one: remembers what it was told.
#[derive(Debug, Default)]
pub struct LoggingRenderService {
    statuses: Mutex<HashMap<ScreenId, ScreenPowerStatus>>,
}

impl LoggingRenderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, screen: ScreenId) -> Option<ScreenPowerStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&screen)
            .copied()
    }
}

impl RenderService for LoggingRenderService {
    fn set_screen_power_status(&self, screen: ScreenId, status: ScreenPowerStatus) -> bool {
        info!("[Render] screen {screen} power {status:?}");
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(screen, status);
        true
    }

    fn exit_aod(&self) {
        info!("[Render] exit AOD");
    }
}

struct ControllerState {
    screens: IndexMap<ScreenId, ScreenPowerStatus>,
    display_state: DisplayState,
    last_reason: PowerStateChangeReason,
    client: Option<ScreenClientProxy>,
}

pub struct PowerController {
    render: Arc<dyn RenderService>,
    state: Mutex<ControllerState>,
}

impl PowerController {
    pub fn new(render: Arc<dyn RenderService>) -> Self {
        Self {
            render,
            state: Mutex::new(ControllerState {
                screens: IndexMap::new(),
                display_state: DisplayState::Unknown,
                last_reason: PowerStateChangeReason::Init,
                client: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_client(&self, client: Option<ScreenClientProxy>) {
        self.lock().client = client;
    }

    fn client(&self) -> Option<ScreenClientProxy> {
        self.lock().client.clone()
    }

    /// Register a screen. Returns `false` if it was already known.
    pub fn add_screen(&self, screen: ScreenId) -> bool {
        let client = {
            let mut state = self.lock();
            if state.screens.contains_key(&screen) {
                return false;
            }
            state.screens.insert(screen, ScreenPowerStatus::On);
            state.client.clone()
        };
        info!("[Screen] {screen} connected");
        if let Some(client) = client {
            if let Err(e) = client.on_screen_connection_changed(screen, ScreenEvent::Connected) {
                debug!("[Screen] {screen} connect notify dropped: {e}");
            }
        }
        true
    }

    pub fn remove_screen(&self, screen: ScreenId) -> bool {
        let client = {
            let mut state = self.lock();
            if state.screens.shift_remove(&screen).is_none() {
                return false;
            }
            state.client.clone()
        };
        info!("[Screen] {screen} disconnected");
        if let Some(client) = client {
            if let Err(e) = client.on_screen_connection_changed(screen, ScreenEvent::Disconnected) {
                debug!("[Screen] {screen} disconnect notify dropped: {e}");
            }
        }
        true
    }

    pub fn screen_ids(&self) -> Vec<ScreenId> {
        self.lock().screens.keys().copied().collect()
    }

    pub fn screen_power_status(&self, screen: ScreenId) -> Option<ScreenPowerStatus> {
        self.lock().screens.get(&screen).copied()
    }

    pub fn display_state(&self) -> DisplayState {
        self.lock().display_state
    }

    fn notify_power_event(&self, event: DisplayPowerEvent, status: EventStatus) {
        let (client, reason) = {
            let state = self.lock();
            (state.client.clone(), state.last_reason)
        };
        debug!("[Screen] power event {event:?} {status:?} ({reason:?})");
        if let Some(client) = client {
            if let Err(e) = client.on_power_status_changed(event, status, reason) {
                debug!("[Screen] power event {event:?} notify dropped: {e}");
            }
        }
    }

    fn program(&self, screen: ScreenId, status: ScreenPowerStatus) -> bool {
        if !self.lock().screens.contains_key(&screen) {
            warn!("[Screen] set power on unknown screen {screen}");
            return false;
        }
        if !self.render.set_screen_power_status(screen, status) {
            warn!("[Screen] renderer refused {status:?} for screen {screen}");
            return false;
        }
        self.lock().screens.insert(screen, status);
        true
    }

    fn program_all(&self, status: ScreenPowerStatus) -> bool {
        let mut ok = true;
        for screen in self.screen_ids() {
            ok &= self.program(screen, status);
        }
        let event = if status.is_on() {
            DisplayPowerEvent::DisplayOn
        } else {
            DisplayPowerEvent::DisplayOff
        };
        self.notify_power_event(event, EventStatus::End);
        ok
    }
}

impl ScreenPowerActions for PowerController {
    fn wake_up_begin(&self, reason: PowerStateChangeReason) -> bool {
        self.lock().last_reason = reason;
        self.notify_power_event(DisplayPowerEvent::WakeUp, EventStatus::Begin);
        true
    }

    fn suspend_begin(&self, reason: PowerStateChangeReason) -> bool {
        self.lock().last_reason = reason;
        self.notify_power_event(DisplayPowerEvent::Sleep, EventStatus::Begin);
        true
    }

    fn set_display_state(&self, display_state: DisplayState) -> bool {
        let client = {
            let mut state = self.lock();
            state.display_state = display_state;
            state.client.clone()
        };
        if let Some(client) = client {
            if let Err(e) = client.on_display_state_changed(MAIN_SCREEN_ID, display_state) {
                debug!("[Screen] display state notify dropped: {e}");
            }
        }
        true
    }

    fn set_screen_power_status(&self, screen: ScreenId, status: ScreenPowerStatus) -> bool {
        if !self.program(screen, status) {
            return false;
        }
        let event = if status.is_on() {
            DisplayPowerEvent::DisplayOn
        } else {
            DisplayPowerEvent::DisplayOff
        };
        self.notify_power_event(event, EventStatus::End);
        true
    }

    fn set_screen_power_for_all(
        &self,
        state: ScreenPowerState,
        reason: PowerStateChangeReason,
    ) -> bool {
        let Some(status) = power_status_for(state, reason) else {
            warn!("[Screen] no renderer status for {state:?}");
            return false;
        };
        self.lock().last_reason = reason;
        self.program_all(status)
    }

    fn aod_exit_and_set_power(&self, screen: ScreenId, status: ScreenPowerStatus) {
        self.render.exit_aod();
        self.set_screen_power_status(screen, status);
    }

    fn aod_exit_and_set_power_all_off(&self) {
        self.render.exit_aod();
        self.program_all(ScreenPowerStatus::Off);
    }

    fn main_screen_power(&self) -> ScreenPowerState {
        match self.screen_power_status(MAIN_SCREEN_ID) {
            Some(ScreenPowerStatus::On | ScreenPowerStatus::OnAdvanced) => ScreenPowerState::On,
            Some(ScreenPowerStatus::Doze) => ScreenPowerState::StandBy,
            Some(ScreenPowerStatus::Suspend | ScreenPowerStatus::DozeSuspend) => {
                ScreenPowerState::Suspend
            },
            Some(ScreenPowerStatus::Off | ScreenPowerStatus::OffAdvanced) | None => {
                ScreenPowerState::Off
            },
        }
    }
}

impl FoldTransitionHandler for PowerController {
    fn on_fold_transition(&self, action: FoldAction, from: SuperFoldStatus, to: SuperFoldStatus) {
        debug!("[Fold] {action:?}: {from:?} -> {to:?}");
        if let Some(client) = self.client() {
            if let Err(e) = client.on_super_fold_status_changed(MAIN_SCREEN_ID, to) {
                debug!("[Fold] status notify dropped: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::client::testing::{ClientEvent, FakeScreenClient};
    use super::*;
    use pretty_assertions::assert_eq;

    fn controller() -> (PowerController, Arc<LoggingRenderService>) {
        let render = Arc::new(LoggingRenderService::new());
        let controller = PowerController::new(render.clone());
        controller.add_screen(MAIN_SCREEN_ID);
        (controller, render)
    }

    #[test]
    fn test_unknown_screen_refused() {
        let (controller, render) = controller();
        assert!(!controller.set_screen_power_status(9, ScreenPowerStatus::Off));
        assert_eq!(render.status(9), None);
    }

    #[test]
    fn test_power_for_all_programs_every_screen() {
        let (controller, render) = controller();
        controller.add_screen(1);
        assert!(controller.set_screen_power_for_all(
            ScreenPowerState::Off,
            PowerStateChangeReason::PowerKey
        ));
        assert_eq!(render.status(0), Some(ScreenPowerStatus::Off));
        assert_eq!(render.status(1), Some(ScreenPowerStatus::Off));
        assert_eq!(controller.main_screen_power(), ScreenPowerState::Off);

        assert!(!controller.set_screen_power_for_all(
            ScreenPowerState::StandBy,
            PowerStateChangeReason::PowerKey
        ));
    }

    #[test]
    fn test_notifications_carry_last_reason() {
        let (controller, _) = controller();
        let client = FakeScreenClient::new();
        controller.set_client(Some(client.proxy()));

        controller.wake_up_begin(PowerStateChangeReason::Application);
        controller.set_screen_power_status(MAIN_SCREEN_ID, ScreenPowerStatus::On);
        controller.add_screen(4);

        assert_eq!(
            client.drain(),
            vec![
                ClientEvent::Power(
                    DisplayPowerEvent::WakeUp,
                    EventStatus::Begin,
                    PowerStateChangeReason::Application
                ),
                ClientEvent::Power(
                    DisplayPowerEvent::DisplayOn,
                    EventStatus::End,
                    PowerStateChangeReason::Application
                ),
                ClientEvent::Connection(4, ScreenEvent::Connected),
            ]
        );
    }

    #[test]
    fn test_dead_client_does_not_fail_effects() {
        let (controller, render) = controller();
        let client = FakeScreenClient::new();
        controller.set_client(Some(client.proxy()));
        client.binder.kill();

        assert!(controller.add_screen(2));
        assert!(controller.set_screen_power_status(2, ScreenPowerStatus::Off));
        assert!(controller.set_display_state(DisplayState::Off));
        assert!(controller.remove_screen(2));
        assert_eq!(render.status(2), Some(ScreenPowerStatus::Off));
        assert!(client.drain().is_empty());
    }

    #[test]
    fn test_add_remove_screen() {
        let (controller, _) = controller();
        assert!(!controller.add_screen(MAIN_SCREEN_ID));
        assert!(controller.remove_screen(MAIN_SCREEN_ID));
        assert!(!controller.remove_screen(MAIN_SCREEN_ID));
        assert_eq!(controller.main_screen_power(), ScreenPowerState::Off);
    }
}
