//! Wire side of [`ScreenSessionManager`](super::ScreenSessionManager).

use std::sync::Arc;

use tracing::warn;

use super::client::ScreenClientProxy;
use super::ScreenSessionManager;
use crate::display::{
    DisplayState, PowerStateChangeReason, ScreenId, ScreenPowerState, ScreenPowerStatus,
};
use crate::error::{status_of, WsResult};
use crate::fold::{SuperFoldStatus, SuperFoldStatusChangeEvent};
use crate::ipc::{
    read_status, transaction_codes, DispatchStatus, Parcel, ProxyBase, ProxyResult, RemoteHandle,
    RequestContext, Stub,
};
use crate::power::ScreenTransitionState;

pub const SCREEN_SESSION_MANAGER_DESCRIPTOR: &str = "displayd.IScreenSessionManager";

transaction_codes! {
    pub enum ScreenSessionManagerCode {
        WakeUpBegin = 0,
        SuspendBegin = 1,
        SetDisplayState = 2,
        SetScreenPowerForAll = 3,
        SetScreenPowerStatus = 4,
        NotifyAodResult = 5,
        NotifyDmsPowerCallbackEnd = 6,
        HandleFoldEvent = 7,
        GetPowerState = 8,
        GetFoldStatus = 9,
        SetClient = 10,
    }
}

pub struct ScreenSessionManagerStub {
    manager: Arc<ScreenSessionManager>,
}

impl ScreenSessionManagerStub {
    pub fn new(manager: Arc<ScreenSessionManager>) -> Self {
        Self { manager }
    }
}

/// Reply shape for the power requests: the machine's verdict, then status.
fn write_bool_result(reply: &mut Parcel, result: &WsResult<bool>) {
    reply.write_bool(matches!(result, Ok(true)));
    reply.write_i32(status_of(&result.map(drop)));
}

impl Stub for ScreenSessionManagerStub {
    const DESCRIPTOR: &'static str = SCREEN_SESSION_MANAGER_DESCRIPTOR;
    type Code = ScreenSessionManagerCode;

    fn handle(
        &self,
        code: ScreenSessionManagerCode,
        data: &mut Parcel,
        reply: &mut Parcel,
        ctx: &RequestContext,
    ) -> Result<(), DispatchStatus> {
        use ScreenSessionManagerCode as C;

        let caller = &ctx.caller;
        match code {
            C::WakeUpBegin => {
                let reason = PowerStateChangeReason::read_from(data)?;
                write_bool_result(reply, &self.manager.wake_up_begin(reason, caller));
            },
            C::SuspendBegin => {
                let reason = PowerStateChangeReason::read_from(data)?;
                write_bool_result(reply, &self.manager.suspend_begin(reason, caller));
            },
            C::SetDisplayState => {
                let state = DisplayState::read_from(data)?;
                write_bool_result(reply, &self.manager.set_display_state(state, caller));
            },
            C::SetScreenPowerForAll => {
                let state = ScreenPowerState::read_from(data)?;
                let reason = PowerStateChangeReason::read_from(data)?;
                let result = self.manager.set_screen_power_for_all(state, reason, caller);
                write_bool_result(reply, &result);
            },
            C::SetScreenPowerStatus => {
                let screen = data.read_u64()?;
                let status = ScreenPowerStatus::read_from(data)?;
                let result = self.manager.set_screen_power_status(screen, status, caller);
                write_bool_result(reply, &result);
            },
            C::NotifyAodResult => {
                let success = data.read_bool()?;
                write_bool_result(reply, &self.manager.notify_aod_result(success, caller));
            },
            C::NotifyDmsPowerCallbackEnd => {
                write_bool_result(reply, &self.manager.notify_dms_power_callback_end(caller));
            },
            C::HandleFoldEvent => {
                let event = SuperFoldStatusChangeEvent::read_from(data)?;
                let result = self.manager.handle_fold_event(event, caller);
                result
                    .unwrap_or_else(|_| self.manager.fold_status())
                    .write_to(reply);
                reply.write_i32(status_of(&result.map(drop)));
            },
            C::GetPowerState => {
                self.manager.power_state().write_to(reply);
                reply.write_i32(0);
            },
            C::GetFoldStatus => {
                self.manager.fold_status().write_to(reply);
                reply.write_i32(0);
            },
            C::SetClient => {
                let remote = data.read_required_object("screen client")?;
                let Some(client) = ScreenClientProxy::new(remote) else {
                    warn!("[Screen] client handle of the wrong interface");
                    return Err(DispatchStatus::InvalidData);
                };
                reply.write_i32(status_of(&self.manager.set_client(client, caller)));
            },
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ScreenSessionManagerProxy {
    base: ProxyBase,
}

impl ScreenSessionManagerProxy {
    pub fn new(remote: RemoteHandle) -> Option<Self> {
        ProxyBase::new(remote, SCREEN_SESSION_MANAGER_DESCRIPTOR).map(|base| Self { base })
    }

    fn call_bool(&self, code: ScreenSessionManagerCode, data: Parcel) -> ProxyResult<bool> {
        let mut reply = self.base.call(code.into(), data)?;
        let accepted = reply.read_bool()?;
        read_status(&mut reply)?;
        Ok(accepted)
    }

    pub fn wake_up_begin(&self, reason: PowerStateChangeReason) -> ProxyResult<bool> {
        let mut data = self.base.request();
        reason.write_to(&mut data);
        self.call_bool(ScreenSessionManagerCode::WakeUpBegin, data)
    }

    pub fn suspend_begin(&self, reason: PowerStateChangeReason) -> ProxyResult<bool> {
        let mut data = self.base.request();
        reason.write_to(&mut data);
        self.call_bool(ScreenSessionManagerCode::SuspendBegin, data)
    }

    pub fn set_display_state(&self, state: DisplayState) -> ProxyResult<bool> {
        let mut data = self.base.request();
        state.write_to(&mut data);
        self.call_bool(ScreenSessionManagerCode::SetDisplayState, data)
    }

    pub fn set_screen_power_for_all(
        &self,
        state: ScreenPowerState,
        reason: PowerStateChangeReason,
    ) -> ProxyResult<bool> {
        let mut data = self.base.request();
        state.write_to(&mut data);
        reason.write_to(&mut data);
        self.call_bool(ScreenSessionManagerCode::SetScreenPowerForAll, data)
    }

    pub fn set_screen_power_status(
        &self,
        screen: ScreenId,
        status: ScreenPowerStatus,
    ) -> ProxyResult<bool> {
        let mut data = self.base.request();
        data.write_u64(screen);
        status.write_to(&mut data);
        self.call_bool(ScreenSessionManagerCode::SetScreenPowerStatus, data)
    }

    pub fn notify_aod_result(&self, success: bool) -> ProxyResult<bool> {
        let mut data = self.base.request();
        data.write_bool(success);
        self.call_bool(ScreenSessionManagerCode::NotifyAodResult, data)
    }

    pub fn notify_dms_power_callback_end(&self) -> ProxyResult<bool> {
        self.call_bool(
            ScreenSessionManagerCode::NotifyDmsPowerCallbackEnd,
            self.base.request(),
        )
    }

    pub fn handle_fold_event(&self, event: SuperFoldStatusChangeEvent) -> ProxyResult<SuperFoldStatus> {
        let mut data = self.base.request();
        event.write_to(&mut data);
        let mut reply = self
            .base
            .call(ScreenSessionManagerCode::HandleFoldEvent.into(), data)?;
        let status = SuperFoldStatus::read_from(&mut reply)?;
        read_status(&mut reply)?;
        Ok(status)
    }

    pub fn power_state(&self) -> ProxyResult<ScreenTransitionState> {
        let mut reply = self
            .base
            .call(ScreenSessionManagerCode::GetPowerState.into(), self.base.request())?;
        let state = ScreenTransitionState::read_from(&mut reply)?;
        read_status(&mut reply)?;
        Ok(state)
    }

    pub fn fold_status(&self) -> ProxyResult<SuperFoldStatus> {
        let mut reply = self
            .base
            .call(ScreenSessionManagerCode::GetFoldStatus.into(), self.base.request())?;
        let status = SuperFoldStatus::read_from(&mut reply)?;
        read_status(&mut reply)?;
        Ok(status)
    }

    pub fn set_client(&self, client: &ScreenClientProxy) -> ProxyResult {
        let mut data = self.base.request();
        data.write_remote_object(Some(client.remote()));
        let mut reply = self
            .base
            .call(ScreenSessionManagerCode::SetClient.into(), data)?;
        read_status(&mut reply)
    }
}
