//! Notifications from the screen manager to its client.

use std::sync::Arc;

use crate::display::{
    DisplayPowerEvent, DisplayState, EventStatus, PowerStateChangeReason, ScreenEvent, ScreenId,
};
use crate::fold::SuperFoldStatus;
use crate::ipc::{
    transaction_codes, DispatchStatus, Parcel, ProxyBase, ProxyResult, RemoteHandle,
    RequestContext, Stub,
};

pub const SCREEN_CLIENT_DESCRIPTOR: &str = "displayd.IScreenSessionManagerClient";

transaction_codes! {
    pub enum ScreenClientCode {
        OnScreenConnectionChanged = 0,
        OnPowerStatusChanged = 1,
        OnDisplayStateChanged = 2,
        OnSuperFoldStatusChanged = 3,
    }
}

/// Receives screen notifications on the client side.
pub trait ScreenClientListener: Send + Sync {
    fn on_screen_connection_changed(&self, screen: ScreenId, event: ScreenEvent);
    fn on_power_status_changed(
        &self,
        event: DisplayPowerEvent,
        status: EventStatus,
        reason: PowerStateChangeReason,
    );
    fn on_display_state_changed(&self, screen: ScreenId, state: DisplayState);
    fn on_super_fold_status_changed(&self, screen: ScreenId, status: SuperFoldStatus);
}

pub struct ScreenClientStub {
    listener: Arc<dyn ScreenClientListener>,
}

impl ScreenClientStub {
    pub fn new(listener: Arc<dyn ScreenClientListener>) -> Self {
        Self { listener }
    }
}

impl Stub for ScreenClientStub {
    const DESCRIPTOR: &'static str = SCREEN_CLIENT_DESCRIPTOR;
    type Code = ScreenClientCode;

    fn handle(
        &self,
        code: ScreenClientCode,
        data: &mut Parcel,
        _reply: &mut Parcel,
        _ctx: &RequestContext,
    ) -> Result<(), DispatchStatus> {
        match code {
            ScreenClientCode::OnScreenConnectionChanged => {
                let screen = data.read_u64()?;
                let event = ScreenEvent::read_from(data)?;
                self.listener.on_screen_connection_changed(screen, event);
            },
            ScreenClientCode::OnPowerStatusChanged => {
                let event = DisplayPowerEvent::read_from(data)?;
                let status = EventStatus::read_from(data)?;
                let reason = PowerStateChangeReason::read_from(data)?;
                self.listener.on_power_status_changed(event, status, reason);
            },
            ScreenClientCode::OnDisplayStateChanged => {
                let screen = data.read_u64()?;
                let state = DisplayState::read_from(data)?;
                self.listener.on_display_state_changed(screen, state);
            },
            ScreenClientCode::OnSuperFoldStatusChanged => {
                let screen = data.read_u64()?;
                let status = SuperFoldStatus::read_from(data)?;
                self.listener.on_super_fold_status_changed(screen, status);
            },
        }
        Ok(())
    }
}

/// Sending side used by the screen manager. Every call is one-way.
#[derive(Debug, Clone)]
pub struct ScreenClientProxy {
    base: ProxyBase,
}

impl ScreenClientProxy {
    pub fn new(remote: RemoteHandle) -> Option<Self> {
        ProxyBase::new(remote, SCREEN_CLIENT_DESCRIPTOR).map(|base| Self { base })
    }

    pub const fn remote(&self) -> &RemoteHandle {
        self.base.remote()
    }

    pub fn on_screen_connection_changed(&self, screen: ScreenId, event: ScreenEvent) -> ProxyResult {
        let mut data = self.base.request();
        data.write_u64(screen);
        event.write_to(&mut data);
        self.base
            .post(ScreenClientCode::OnScreenConnectionChanged.into(), data)
    }

    pub fn on_power_status_changed(
        &self,
        event: DisplayPowerEvent,
        status: EventStatus,
        reason: PowerStateChangeReason,
    ) -> ProxyResult {
        let mut data = self.base.request();
        event.write_to(&mut data);
        status.write_to(&mut data);
        reason.write_to(&mut data);
        self.base
            .post(ScreenClientCode::OnPowerStatusChanged.into(), data)
    }

    pub fn on_display_state_changed(&self, screen: ScreenId, state: DisplayState) -> ProxyResult {
        let mut data = self.base.request();
        data.write_u64(screen);
        state.write_to(&mut data);
        self.base
            .post(ScreenClientCode::OnDisplayStateChanged.into(), data)
    }

    pub fn on_super_fold_status_changed(
        &self,
        screen: ScreenId,
        status: SuperFoldStatus,
    ) -> ProxyResult {
        let mut data = self.base.request();
        data.write_u64(screen);
        status.write_to(&mut data);
        self.base
            .post(ScreenClientCode::OnSuperFoldStatusChanged.into(), data)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::ipc::LocalBinder;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ClientEvent {
        Connection(ScreenId, ScreenEvent),
        Power(DisplayPowerEvent, EventStatus, PowerStateChangeReason),
        DisplayState(ScreenId, DisplayState),
        Fold(ScreenId, SuperFoldStatus),
    }

    struct Recorder(Mutex<Sender<ClientEvent>>);

    impl Recorder {
        fn send(&self, event: ClientEvent) {
            let _ = self.0.lock().unwrap().send(event);
        }
    }

    impl ScreenClientListener for Recorder {
        fn on_screen_connection_changed(&self, screen: ScreenId, event: ScreenEvent) {
            self.send(ClientEvent::Connection(screen, event));
        }

        fn on_power_status_changed(
            &self,
            event: DisplayPowerEvent,
            status: EventStatus,
            reason: PowerStateChangeReason,
        ) {
            self.send(ClientEvent::Power(event, status, reason));
        }

        fn on_display_state_changed(&self, screen: ScreenId, state: DisplayState) {
            self.send(ClientEvent::DisplayState(screen, state));
        }

        fn on_super_fold_status_changed(&self, screen: ScreenId, status: SuperFoldStatus) {
            self.send(ClientEvent::Fold(screen, status));
        }
    }

    pub struct FakeScreenClient {
        pub binder: LocalBinder,
        events: Receiver<ClientEvent>,
    }

    impl FakeScreenClient {
        pub fn new() -> Self {
            let (tx, events) = mpsc::channel();
            let recorder = Arc::new(Recorder(Mutex::new(tx)));
            Self {
                binder: LocalBinder::new(Arc::new(ScreenClientStub::new(recorder))),
                events,
            }
        }

        pub fn proxy(&self) -> ScreenClientProxy {
            ScreenClientProxy::new(self.binder.as_remote()).unwrap()
        }

        pub fn next(&self) -> Option<ClientEvent> {
            self.events.recv_timeout(Duration::from_secs(2)).ok()
        }

        /// Everything delivered so far, waiting briefly for stragglers.
        pub fn drain(&self) -> Vec<ClientEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.recv_timeout(Duration::from_millis(100)) {
                out.push(event);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ClientEvent, FakeScreenClient};
    use super::*;
    use crate::ipc::RemoteObject;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_notifications_delivered_in_order() {
        let client = FakeScreenClient::new();
        let proxy = client.proxy();
        proxy
            .on_screen_connection_changed(3, ScreenEvent::Connected)
            .unwrap();
        proxy
            .on_power_status_changed(
                DisplayPowerEvent::WakeUp,
                EventStatus::Begin,
                PowerStateChangeReason::PowerKey,
            )
            .unwrap();
        proxy.on_display_state_changed(0, DisplayState::On).unwrap();

        assert_eq!(
            client.next(),
            Some(ClientEvent::Connection(3, ScreenEvent::Connected))
        );
        assert_eq!(
            client.next(),
            Some(ClientEvent::Power(
                DisplayPowerEvent::WakeUp,
                EventStatus::Begin,
                PowerStateChangeReason::PowerKey
            ))
        );
        assert_eq!(
            client.next(),
            Some(ClientEvent::DisplayState(0, DisplayState::On))
        );
    }

    #[test]
    fn test_bad_enum_rejected_without_delivery() {
        let client = FakeScreenClient::new();
        let mut data = Parcel::new();
        data.write_interface_token(SCREEN_CLIENT_DESCRIPTOR);
        data.write_u64(0);
        data.write_u32(99);
        let result = client.binder.as_remote().send_request(
            ScreenClientCode::OnDisplayStateChanged.into(),
            data,
            crate::ipc::MessageOption::SYNC,
        );
        assert!(result.is_err());
        assert!(client.drain().is_empty());
    }
}
