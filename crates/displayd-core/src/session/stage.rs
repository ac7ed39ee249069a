//! Interfaces a session uses to call back into its owning client.
//!
//! Both are one-way: the session never waits on a client.

use std::sync::Arc;

use crate::error::WsError;
use crate::ipc::{
    transaction_codes, DispatchStatus, Parcel, ProxyBase, ProxyResult, RemoteHandle,
    RequestContext, Stub,
};

// ── SessionStage ────────────────────────────────────────────────────

pub const SESSION_STAGE_DESCRIPTOR: &str = "displayd.ISessionStage";

transaction_codes! {
    pub enum SessionStageCode {
        NotifyForeground = 1,
        NotifyBackground = 2,
        UpdateActiveStatus = 3,
        NotifyDestroy = 4,
    }
}

/// Client side of a session: the window that owns it.
pub trait SessionStage: Send + Sync {
    fn notify_foreground(&self);
    fn notify_background(&self);
    fn update_active_status(&self, active: bool);
    fn notify_destroy(&self);
}

pub struct SessionStageStub {
    stage: Arc<dyn SessionStage>,
}

impl SessionStageStub {
    pub fn new(stage: Arc<dyn SessionStage>) -> Self {
        Self { stage }
    }
}

impl Stub for SessionStageStub {
    const DESCRIPTOR: &'static str = SESSION_STAGE_DESCRIPTOR;
    type Code = SessionStageCode;

    fn handle(
        &self,
        code: SessionStageCode,
        data: &mut Parcel,
        _reply: &mut Parcel,
        _ctx: &RequestContext,
    ) -> Result<(), DispatchStatus> {
        match code {
            SessionStageCode::NotifyForeground => self.stage.notify_foreground(),
            SessionStageCode::NotifyBackground => self.stage.notify_background(),
            SessionStageCode::UpdateActiveStatus => {
                let active = data.read_bool()?;
                self.stage.update_active_status(active);
            },
            SessionStageCode::NotifyDestroy => self.stage.notify_destroy(),
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionStageProxy {
    base: ProxyBase,
}

impl SessionStageProxy {
    pub fn new(remote: RemoteHandle) -> Option<Self> {
        ProxyBase::new(remote, SESSION_STAGE_DESCRIPTOR).map(|base| Self { base })
    }

    pub const fn remote(&self) -> &RemoteHandle {
        self.base.remote()
    }

    pub fn notify_foreground(&self) -> ProxyResult {
        self.base
            .post(SessionStageCode::NotifyForeground.into(), self.base.request())
    }

    pub fn notify_background(&self) -> ProxyResult {
        self.base
            .post(SessionStageCode::NotifyBackground.into(), self.base.request())
    }

    pub fn update_active_status(&self, active: bool) -> ProxyResult {
        let mut data = self.base.request();
        data.write_bool(active);
        self.base
            .post(SessionStageCode::UpdateActiveStatus.into(), data)
    }

    pub fn notify_destroy(&self) -> ProxyResult {
        self.base
            .post(SessionStageCode::NotifyDestroy.into(), self.base.request())
    }
}

// ── WindowEventChannel ──────────────────────────────────────────────

pub const WINDOW_EVENT_CHANNEL_DESCRIPTOR: &str = "displayd.IWindowEventChannel";

transaction_codes! {
    pub enum WindowEventChannelCode {
        TransferFocusActiveEvent = 0,
        TransferFocusState = 1,
    }
}

/// Input-side channel into the client window.
pub trait WindowEventChannel: Send + Sync {
    fn transfer_focus_active_event(&self, active: bool) -> Result<(), WsError>;
    fn transfer_focus_state(&self, focused: bool) -> Result<(), WsError>;
}

pub struct WindowEventChannelStub {
    channel: Arc<dyn WindowEventChannel>,
}

impl WindowEventChannelStub {
    pub fn new(channel: Arc<dyn WindowEventChannel>) -> Self {
        Self { channel }
    }
}

impl Stub for WindowEventChannelStub {
    const DESCRIPTOR: &'static str = WINDOW_EVENT_CHANNEL_DESCRIPTOR;
    type Code = WindowEventChannelCode;

    fn handle(
        &self,
        code: WindowEventChannelCode,
        data: &mut Parcel,
        _reply: &mut Parcel,
        _ctx: &RequestContext,
    ) -> Result<(), DispatchStatus> {
        let flag = data.read_bool()?;
        // One-way: nobody reads a status back.
        let _ = match code {
            WindowEventChannelCode::TransferFocusActiveEvent => {
                self.channel.transfer_focus_active_event(flag)
            },
            WindowEventChannelCode::TransferFocusState => self.channel.transfer_focus_state(flag),
        };
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WindowEventChannelProxy {
    base: ProxyBase,
}

impl WindowEventChannelProxy {
    pub fn new(remote: RemoteHandle) -> Option<Self> {
        ProxyBase::new(remote, WINDOW_EVENT_CHANNEL_DESCRIPTOR).map(|base| Self { base })
    }

    pub const fn remote(&self) -> &RemoteHandle {
        self.base.remote()
    }

    pub fn transfer_focus_active_event(&self, active: bool) -> ProxyResult {
        let mut data = self.base.request();
        data.write_bool(active);
        self.base
            .post(WindowEventChannelCode::TransferFocusActiveEvent.into(), data)
    }

    pub fn transfer_focus_state(&self, focused: bool) -> ProxyResult {
        let mut data = self.base.request();
        data.write_bool(focused);
        self.base
            .post(WindowEventChannelCode::TransferFocusState.into(), data)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording client-side fakes shared by session and scene tests.

    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::ipc::LocalBinder;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum StageCall {
        Foreground,
        Background,
        Active(bool),
        Destroy,
        FocusActive(bool),
        FocusState(bool),
    }

    pub struct RecordingStage {
        tx: Mutex<Sender<StageCall>>,
    }

    impl RecordingStage {
        fn send(&self, call: StageCall) {
            let _ = self.tx.lock().unwrap().send(call);
        }
    }

    impl SessionStage for RecordingStage {
        fn notify_foreground(&self) {
            self.send(StageCall::Foreground);
        }

        fn notify_background(&self) {
            self.send(StageCall::Background);
        }

        fn update_active_status(&self, active: bool) {
            self.send(StageCall::Active(active));
        }

        fn notify_destroy(&self) {
            self.send(StageCall::Destroy);
        }
    }

    impl WindowEventChannel for RecordingStage {
        fn transfer_focus_active_event(&self, active: bool) -> Result<(), WsError> {
            self.send(StageCall::FocusActive(active));
            Ok(())
        }

        fn transfer_focus_state(&self, focused: bool) -> Result<(), WsError> {
            self.send(StageCall::FocusState(focused));
            Ok(())
        }
    }

    /// A hosted stage plus event channel and the receiver of their calls.
    pub struct FakeClient {
        pub stage: LocalBinder,
        pub channel: LocalBinder,
        pub calls: Receiver<StageCall>,
    }

    impl FakeClient {
        pub fn new() -> Self {
            let (tx, calls) = mpsc::channel();
            let recorder = Arc::new(RecordingStage { tx: Mutex::new(tx) });
            Self {
                stage: LocalBinder::new(Arc::new(SessionStageStub::new(recorder.clone()))),
                channel: LocalBinder::new(Arc::new(WindowEventChannelStub::new(recorder))),
                calls,
            }
        }

        pub fn next_call(&self) -> Option<StageCall> {
            self.calls.recv_timeout(Duration::from_secs(2)).ok()
        }

        pub fn no_more_calls(&self) -> bool {
            self.calls.recv_timeout(Duration::from_millis(50)).is_err()
        }
    }
}
