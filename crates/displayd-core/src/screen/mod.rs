//! Screen session manager.
//!
//! Turns privileged power and fold requests into machine events. The power
//! machine and fold manager are owned here, one per device.

pub mod client;
pub mod controller;
mod stub;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::PowerConfig;
use crate::display::{
    DisplayState, PowerStateChangeReason, ScreenId, ScreenPowerState, ScreenPowerStatus,
};
use crate::error::{WsError, WsResult};
use crate::fold::{SuperFoldStateManager, SuperFoldStatus, SuperFoldStatusChangeEvent};
use crate::ipc::CallerInfo;
use crate::permission::PermissionService;
use crate::power::{PowerPayload, ScreenPowerEvent, ScreenStateMachine, ScreenTransitionState};
use crate::timer::TimerManager;

pub use client::{ScreenClientCode, ScreenClientListener, ScreenClientProxy, ScreenClientStub};
pub use controller::{LoggingRenderService, PowerController, RenderService};
pub use stub::{
    ScreenSessionManagerCode, ScreenSessionManagerProxy, ScreenSessionManagerStub,
    SCREEN_SESSION_MANAGER_DESCRIPTOR,
};

pub struct ScreenSessionManager {
    power: ScreenStateMachine,
    fold: SuperFoldStateManager,
    controller: Arc<PowerController>,
    permissions: Arc<dyn PermissionService>,
}

impl ScreenSessionManager {
    /// The main screen is registered up front.
    pub fn new(
        render: Arc<dyn RenderService>,
        timers: Arc<TimerManager>,
        config: &PowerConfig,
        permissions: Arc<dyn PermissionService>,
    ) -> Self {
        let controller = Arc::new(PowerController::new(render));
        controller.add_screen(crate::display::MAIN_SCREEN_ID);
        let power = ScreenStateMachine::new(controller.clone(), timers, config);
        power.init_state_machine(config.init_ref_count);
        let fold = SuperFoldStateManager::new(controller.clone());
        Self {
            power,
            fold,
            controller,
            permissions,
        }
    }

    fn check_system(&self, caller: &CallerInfo) -> WsResult {
        if self.permissions.is_system_calling(caller) {
            Ok(())
        } else {
            Err(WsError::InvalidPermission)
        }
    }

    fn drive(&self, event: ScreenPowerEvent, payload: PowerPayload) -> bool {
        self.power.handle_power_state_change(event, payload)
    }

    // ── Power ───────────────────────────────────────────────────────

    pub fn wake_up_begin(&self, reason: PowerStateChangeReason, caller: &CallerInfo) -> WsResult<bool> {
        self.check_system(caller)?;
        info!("[Screen] wake up begin, reason {reason:?}");
        let event = if reason == PowerStateChangeReason::PreBright {
            ScreenPowerEvent::WakeUpBeginAdvanced
        } else {
            ScreenPowerEvent::WakeUpBegin
        };
        Ok(self.drive(event, PowerPayload::Reason(reason)))
    }

    pub fn suspend_begin(&self, reason: PowerStateChangeReason, caller: &CallerInfo) -> WsResult<bool> {
        self.check_system(caller)?;
        info!("[Screen] suspend begin, reason {reason:?}");
        Ok(self.drive(ScreenPowerEvent::SuspendBegin, PowerPayload::Reason(reason)))
    }

    pub fn set_display_state(&self, state: DisplayState, caller: &CallerInfo) -> WsResult<bool> {
        self.check_system(caller)?;
        let event = match state {
            DisplayState::Doze => ScreenPowerEvent::SetDisplayStateDoze,
            DisplayState::DozeSuspend => ScreenPowerEvent::SetDisplayStateDozeSuspend,
            _ => ScreenPowerEvent::SetDisplayState,
        };
        Ok(self.drive(event, PowerPayload::DisplayState(state)))
    }

    pub fn set_screen_power_for_all(
        &self,
        state: ScreenPowerState,
        reason: PowerStateChangeReason,
        caller: &CallerInfo,
    ) -> WsResult<bool> {
        self.check_system(caller)?;
        let advanced = self.power.transition_state() == ScreenTransitionState::WaitScreenAdvancedOnReady;
        let event = match state {
            ScreenPowerState::On if advanced => ScreenPowerEvent::SetScreenPowerForAllPowerOn,
            ScreenPowerState::On => ScreenPowerEvent::PowerOn,
            ScreenPowerState::Off if advanced => ScreenPowerEvent::SetScreenPowerForAllPowerOff,
            ScreenPowerState::Off => ScreenPowerEvent::PowerOff,
            ScreenPowerState::Suspend => ScreenPowerEvent::Suspend,
            ScreenPowerState::StandBy => {
                warn!("[Screen] set power for all: {state:?} unsupported");
                return Err(WsError::InvalidParam);
            },
        };
        Ok(self.drive(event, PowerPayload::ForAll { state, reason }))
    }

    pub fn set_screen_power_status(
        &self,
        screen: ScreenId,
        status: ScreenPowerStatus,
        caller: &CallerInfo,
    ) -> WsResult<bool> {
        self.check_system(caller)?;
        let event = match status {
            ScreenPowerStatus::On => ScreenPowerEvent::PowerOnDirectly,
            ScreenPowerStatus::Off => ScreenPowerEvent::PowerOffDirectly,
            ScreenPowerStatus::Suspend => ScreenPowerEvent::Suspend,
            ScreenPowerStatus::OnAdvanced => ScreenPowerEvent::AdvancedOn,
            ScreenPowerStatus::OffAdvanced => ScreenPowerEvent::AdvancedOff,
            ScreenPowerStatus::Doze => ScreenPowerEvent::Doze,
            ScreenPowerStatus::DozeSuspend => ScreenPowerEvent::DozeSuspend,
        };
        Ok(self.drive(event, PowerPayload::ScreenPower { screen, status }))
    }

    /// Result of an always-on-display entry attempt.
    pub fn notify_aod_result(&self, success: bool, caller: &CallerInfo) -> WsResult<bool> {
        self.check_system(caller)?;
        let event = if success {
            ScreenPowerEvent::AodEnterSuccess
        } else {
            ScreenPowerEvent::AodEnterFail
        };
        let payload = PowerPayload::ScreenPower {
            screen: crate::display::MAIN_SCREEN_ID,
            status: ScreenPowerStatus::Off,
        };
        Ok(self.drive(event, payload))
    }

    /// The power manager finished its own callbacks for this power change.
    pub fn notify_dms_power_callback_end(&self, caller: &CallerInfo) -> WsResult<bool> {
        self.check_system(caller)?;
        Ok(self.drive(
            ScreenPowerEvent::DmsPowerCbEnd,
            PowerPayload::Reason(PowerStateChangeReason::Init),
        ))
    }

    pub fn power_state(&self) -> ScreenTransitionState {
        self.power.transition_state()
    }

    pub fn current_power_status(&self) -> ScreenPowerStatus {
        self.power.current_power_status()
    }

    pub const fn power_machine(&self) -> &ScreenStateMachine {
        &self.power
    }

    // ── Fold ────────────────────────────────────────────────────────

    pub fn handle_fold_event(
        &self,
        event: SuperFoldStatusChangeEvent,
        caller: &CallerInfo,
    ) -> WsResult<SuperFoldStatus> {
        self.check_system(caller)?;
        Ok(self.fold.handle_super_fold_status_change(event))
    }

    pub fn fold_status(&self) -> SuperFoldStatus {
        self.fold.current_status()
    }

    // ── Screens and client ──────────────────────────────────────────

    pub fn set_client(&self, client: ScreenClientProxy, caller: &CallerInfo) -> WsResult {
        self.check_system(caller)?;
        info!("[Screen] client registered by pid {}", caller.pid);
        self.controller.set_client(Some(client));
        Ok(())
    }

    /// A new physical screen. Counts toward leaving `Init`.
    pub fn add_screen(&self, screen: ScreenId) {
        if self.controller.add_screen(screen) {
            self.power.inc_screen_state_init_ref();
        }
    }

    pub fn remove_screen(&self, screen: ScreenId) -> bool {
        self.controller.remove_screen(screen)
    }

    pub fn controller(&self) -> &Arc<PowerController> {
        &self.controller
    }
}
