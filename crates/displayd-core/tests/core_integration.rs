//! Core-only integration tests.
//!
//! These drive displayd-core through its public surface the way a client
//! process would: everything goes through proxies and the in-process
//! binder, nothing touches module internals.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use displayd_core::config::Config;
use displayd_core::display::{
    DisplayState, PowerStateChangeReason, ScreenPowerState, ScreenPowerStatus,
};
use displayd_core::error::WsError;
use displayd_core::ipc::{
    CallerInfo, DispatchStatus, LocalBinder, MessageOption, Parcel, ProxyError, RemoteObject,
    TransportError,
};
use displayd_core::manager_service::{
    value_id, SessionManagerServiceCode, SESSION_MANAGER_SERVICE_DESCRIPTOR,
};
use displayd_core::screen::LoggingRenderService;
use displayd_core::session::{
    SessionInfo, SessionStage, SessionStageProxy, SessionStageStub, SessionState, SurfaceNode,
    WindowEventChannel, WindowEventChannelProxy, WindowEventChannelStub, WindowSessionProperty,
};
use displayd_core::vsync::SoftwareVsyncSource;
use displayd_core::{
    DisplayContext, ScreenTransitionState, SessionManagerServiceProxy, SuperFoldStatus,
    SuperFoldStatusChangeEvent,
};
use pretty_assertions::assert_eq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientCall {
    Foreground,
    Background,
    Active(bool),
    Destroy,
    FocusActive(bool),
}

struct Recorder(Mutex<Sender<ClientCall>>);

impl Recorder {
    fn send(&self, call: ClientCall) {
        let _ = self.0.lock().unwrap().send(call);
    }
}

impl SessionStage for Recorder {
    fn notify_foreground(&self) {
        self.send(ClientCall::Foreground);
    }

    fn notify_background(&self) {
        self.send(ClientCall::Background);
    }

    fn update_active_status(&self, active: bool) {
        self.send(ClientCall::Active(active));
    }

    fn notify_destroy(&self) {
        self.send(ClientCall::Destroy);
    }
}

impl WindowEventChannel for Recorder {
    fn transfer_focus_active_event(&self, active: bool) -> Result<(), WsError> {
        self.send(ClientCall::FocusActive(active));
        Ok(())
    }

    fn transfer_focus_state(&self, _focused: bool) -> Result<(), WsError> {
        Ok(())
    }
}

/// The client side of one window: its stage, its event channel and what
/// they were told.
struct WindowClient {
    stage: LocalBinder,
    channel: LocalBinder,
    calls: Receiver<ClientCall>,
}

impl WindowClient {
    fn new() -> Self {
        let (tx, calls) = mpsc::channel();
        let recorder = Arc::new(Recorder(Mutex::new(tx)));
        Self {
            stage: LocalBinder::new(Arc::new(SessionStageStub::new(recorder.clone()))),
            channel: LocalBinder::new(Arc::new(WindowEventChannelStub::new(recorder))),
            calls,
        }
    }

    fn proxies(&self) -> (SessionStageProxy, WindowEventChannelProxy) {
        (
            SessionStageProxy::new(self.stage.as_remote()).unwrap(),
            WindowEventChannelProxy::new(self.channel.as_remote()).unwrap(),
        )
    }

    /// Calls delivered within a short window, in arrival order.
    fn drain(&self) -> Vec<ClientCall> {
        let mut out = Vec::new();
        while let Ok(call) = self.calls.recv_timeout(Duration::from_millis(100)) {
            out.push(call);
        }
        out
    }
}

/// Helper: a context with the logging renderer and a fast software vsync.
fn test_context(config: &Config) -> (DisplayContext, Arc<LoggingRenderService>) {
    let render = Arc::new(LoggingRenderService::new());
    let context = DisplayContext::new(
        config,
        render.clone(),
        Arc::new(SoftwareVsyncSource::new(240)),
    );
    (context, render)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn notes_app() -> SessionInfo {
    SessionInfo {
        bundle_name: "com.example.notes".into(),
        module_name: "entry".into(),
        ability_name: "MainAbility".into(),
        ..SessionInfo::default()
    }
}

// ── Test 1: full session lifecycle through the service ───────────

#[test]
fn session_lifecycle_through_service() {
    let (context, _) = test_context(&Config::default());
    let service = SessionManagerServiceProxy::new(context.service_handle()).unwrap();
    let scene = service.get_scene_session_manager().unwrap();

    let (session, persistent_id, token) = scene.create_session(&notes_app()).unwrap();
    assert!(persistent_id > 0);
    assert!(!token.is_empty());

    let client = WindowClient::new();
    let (stage, channel) = client.proxies();
    let property = WindowSessionProperty {
        window_name: "notes".into(),
        ..WindowSessionProperty::default()
    };
    let surface = SurfaceNode {
        id: 77,
        name: "notes-surface".into(),
    };
    let reply = session
        .connect(&stage, &channel, &surface, Some(&property), &token)
        .unwrap();
    assert_eq!(reply.persistent_id, persistent_id);
    assert_eq!(reply.display_id, 0);
    assert!(reply.system_config.is_system_decor_enable);

    session.foreground(true, &token).unwrap();
    // Sync call; the serial worker has applied the foreground by now.
    session.update_active_status(true).unwrap();

    let server_side = context.scene().get_session(persistent_id).unwrap();
    assert_eq!(server_side.state(), SessionState::Foreground);
    assert!(server_side.is_active());

    let calls = client.drain();
    assert!(calls.contains(&ClientCall::Active(true)), "got {calls:?}");
    assert!(calls.contains(&ClientCall::FocusActive(true)), "got {calls:?}");
    assert!(!calls.contains(&ClientCall::Foreground), "client-initiated foreground echoed");

    // Server-initiated background is pushed to the stage; only the state moves.
    session.background(false, &token).unwrap();
    assert!(wait_until(|| server_side.state() == SessionState::Background));
    assert!(server_side.is_active());
    let calls = client.drain();
    assert!(calls.contains(&ClientCall::Background), "got {calls:?}");
    assert!(!calls.contains(&ClientCall::Active(false)), "got {calls:?}");

    session.update_active_status(false).unwrap();
    assert!(!server_side.is_active());
    let calls = client.drain();
    assert!(calls.contains(&ClientCall::Active(false)), "got {calls:?}");

    session.disconnect(true, &token).unwrap();
    assert!(wait_until(|| context.scene().session_count() == 0));
    assert!(server_side.is_destroyed());
}

// ── Test 2: lifecycle errors come back in-band ───────────────────

#[test]
fn lifecycle_errors_are_in_band() {
    let (context, _) = test_context(&Config::default());
    let scene = SessionManagerServiceProxy::new(context.service_handle())
        .unwrap()
        .get_scene_session_manager()
        .unwrap();
    let (session, _, token) = scene.create_session(&notes_app()).unwrap();
    let client = WindowClient::new();
    let (stage, channel) = client.proxies();
    let surface = SurfaceNode {
        id: 5,
        name: "s".into(),
    };

    let err = session
        .connect(&stage, &channel, &surface, None, "not-the-token")
        .unwrap_err();
    assert!(matches!(err, ProxyError::Remote(WsError::InvalidPermission)));

    session.connect(&stage, &channel, &surface, None, &token).unwrap();
    let err = session
        .connect(&stage, &channel, &surface, None, &token)
        .unwrap_err();
    assert!(matches!(err, ProxyError::Remote(WsError::RepeatOperation)));

    // Activation needs the foreground.
    let err = session.update_active_status(true).unwrap_err();
    assert_eq!(err.as_ws_error(), WsError::InvalidSession);
}

// ── Test 3: a dying client takes its session with it ─────────────

#[test]
fn stage_death_removes_session() {
    let (context, _) = test_context(&Config::default());
    let scene = SessionManagerServiceProxy::new(context.service_handle())
        .unwrap()
        .get_scene_session_manager()
        .unwrap();
    let (session, persistent_id, token) = scene.create_session(&notes_app()).unwrap();
    let client = WindowClient::new();
    let (stage, channel) = client.proxies();
    session
        .connect(
            &stage,
            &channel,
            &SurfaceNode {
                id: 9,
                name: "s".into(),
            },
            None,
            &token,
        )
        .unwrap();
    assert_eq!(scene.session_count().unwrap(), 1);

    client.stage.kill();

    assert!(wait_until(|| context.scene().get_session(persistent_id).is_none()));
    assert_eq!(scene.session_count().unwrap(), 0);
    assert!(wait_until(|| !session.remote().is_alive()));
}

// ── Test 4: sleep and wake through the screen manager ────────────

#[test]
fn sleep_and_wake_through_service() {
    let (context, render) = test_context(&Config::default());
    let screen = SessionManagerServiceProxy::new(context.service_handle())
        .unwrap()
        .get_screen_session_manager()
        .unwrap();
    let reason = PowerStateChangeReason::PowerKey;

    assert!(screen.suspend_begin(reason).unwrap());
    assert!(screen.set_display_state(DisplayState::Off).unwrap());
    assert_eq!(screen.power_state().unwrap(), ScreenTransitionState::WaitLockScreenInd);
    assert!(screen.set_screen_power_for_all(ScreenPowerState::Off, reason).unwrap());
    assert_eq!(screen.power_state().unwrap(), ScreenTransitionState::ScreenOff);
    assert_eq!(render.status(0), Some(ScreenPowerStatus::Off));

    assert!(screen.wake_up_begin(reason).unwrap());
    assert_eq!(screen.power_state().unwrap(), ScreenTransitionState::WaitScreenOnReady);
    assert!(screen.set_screen_power_for_all(ScreenPowerState::On, reason).unwrap());
    assert_eq!(screen.power_state().unwrap(), ScreenTransitionState::ScreenOn);
    assert_eq!(render.status(0), Some(ScreenPowerStatus::On));

    // Illegal in ScreenOn: refused, state untouched.
    assert!(!screen.notify_aod_result(true).unwrap());
    assert_eq!(screen.power_state().unwrap(), ScreenTransitionState::ScreenOn);
}

// ── Test 5: an unanswered AOD entry times out to screen off ──────

#[test]
fn aod_wait_times_out_to_screen_off() {
    let mut config = Config::default();
    config.power.aod_timeout_ms = 40;
    let (context, render) = test_context(&config);
    let screen = context.screen();
    let system = CallerInfo::local();

    assert!(screen.set_display_state(DisplayState::Off, &system).unwrap());
    assert!(screen.notify_dms_power_callback_end(&system).unwrap());
    assert_eq!(screen.power_state(), ScreenTransitionState::WaitScreenCtrlRsp);

    assert!(wait_until(|| screen.power_state() == ScreenTransitionState::ScreenOff));
    assert_eq!(render.status(0), Some(ScreenPowerStatus::Off));
}

// ── Test 6: fold readings, privileged callers only ───────────────

#[test]
fn fold_events_follow_the_table() {
    let (context, _) = test_context(&Config::default());
    let screen = context.screen();
    let system = CallerInfo::local();
    let app = CallerInfo {
        pid: 4242,
        uid: 20_010_042,
    };

    assert_eq!(
        screen.handle_fold_event(SuperFoldStatusChangeEvent::AngleChangeFolded, &app),
        Err(WsError::InvalidPermission)
    );

    let steps = [
        (SuperFoldStatusChangeEvent::AngleChangeHalfFolded, SuperFoldStatus::HalfFolded),
        // Not mapped from HalfFolded: ignored quietly.
        (SuperFoldStatusChangeEvent::KeyboardOff, SuperFoldStatus::HalfFolded),
        (SuperFoldStatusChangeEvent::KeyboardOn, SuperFoldStatus::Keyboard),
        (SuperFoldStatusChangeEvent::KeyboardOff, SuperFoldStatus::HalfFolded),
        (SuperFoldStatusChangeEvent::AngleChangeExpanded, SuperFoldStatus::Expanded),
    ];
    for (event, expected) in steps {
        assert_eq!(screen.handle_fold_event(event, &system), Ok(expected), "{event:?}");
    }
    assert_eq!(
        context
            .service()
            .get_value_by_id(value_id::FOLD_STATUS)
            .unwrap(),
        "Expanded"
    );
}

// ── Test 7: a connected session paces frames off its station ─────

#[test]
fn connected_session_gets_vsync() {
    let (context, _) = test_context(&Config::default());
    let created = context
        .scene()
        .create_session(notes_app(), CallerInfo::local())
        .unwrap();
    let session = context.scene().get_session(created.persistent_id).unwrap();
    assert!(session.vsync_station().is_none());

    let client = WindowClient::new();
    let (stage, channel) = client.proxies();
    session
        .connect(
            stage,
            channel,
            SurfaceNode {
                id: 31,
                name: "paced".into(),
            },
            None,
            &created.identity_token,
        )
        .unwrap();
    let station = session.vsync_station().unwrap();
    assert_eq!(station.node_id(), 31);

    let (tx, rx) = mpsc::channel();
    assert!(station.run_once_on_next_vsync(move |timestamp, frame_count| {
        let _ = tx.send((timestamp, frame_count));
    }));
    let (_, frame_count) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(frame_count >= 0);

    session.disconnect(false, &created.identity_token).unwrap();
    assert!(station.is_destroyed());
    assert!(!station.run_once_on_next_vsync(|_, _| {}));
    assert!(client.drain().contains(&ClientCall::Destroy));
}

// ── Test 8: the dispatch boundary rejects bad transactions ───────

#[test]
fn dispatch_rejects_bad_token_and_unknown_code() {
    let (context, _) = test_context(&Config::default());
    let handle = context.service_handle();

    let mut data = Parcel::new();
    data.write_interface_token("displayd.ISomethingElse");
    data.write_i32(value_id::VERSION);
    let result = handle.send_request(
        SessionManagerServiceCode::GetValueById.into(),
        data,
        MessageOption::SYNC,
    );
    assert!(matches!(
        result,
        Err(TransportError::Rejected(DispatchStatus::InvalidState))
    ));

    let mut data = Parcel::new();
    data.write_interface_token(SESSION_MANAGER_SERVICE_DESCRIPTOR);
    let result = handle.send_request(999, data, MessageOption::SYNC);
    assert!(matches!(
        result,
        Err(TransportError::Rejected(DispatchStatus::UnknownTransaction))
    ));

    // Truncated payload.
    let mut data = Parcel::new();
    data.write_interface_token(SESSION_MANAGER_SERVICE_DESCRIPTOR);
    let result = handle.send_request(
        SessionManagerServiceCode::GetValueById.into(),
        data,
        MessageOption::SYNC,
    );
    assert!(matches!(
        result,
        Err(TransportError::Rejected(DispatchStatus::InvalidData))
    ));

    // The service is still fine afterwards.
    let service = SessionManagerServiceProxy::new(handle).unwrap();
    assert_eq!(service.get_value_by_id(value_id::SESSION_COUNT).unwrap(), "0");
}

// ── Test 9: configuration from a file shapes the context ─────────

#[test]
fn config_file_drives_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[general]
service_name = "displayd-it"

[power]
init_ref_count = 1

[session]
default_display_id = 3
system_decor_enabled = false

[permissions]
system_uids = [1000]
"#,
    )
    .unwrap();
    let config = Config::load(Some(&path)).unwrap();
    let (context, _) = test_context(&config);

    // One screen still has to report in.
    assert_eq!(context.screen().power_state(), ScreenTransitionState::Init);
    context.screen().add_screen(1);
    assert_eq!(context.screen().power_state(), ScreenTransitionState::ScreenOn);

    let service = SessionManagerServiceProxy::new(context.service_handle()).unwrap();
    assert!(service
        .get_value_by_id(value_id::VERSION)
        .unwrap()
        .starts_with("displayd-it "));

    // Root is no longer privileged.
    let root_handle = context.service_handle_for(CallerInfo { pid: 1, uid: 0 });
    let root = SessionManagerServiceProxy::new(root_handle)
        .unwrap()
        .get_screen_session_manager()
        .unwrap();
    let err = root.wake_up_begin(PowerStateChangeReason::PowerKey).unwrap_err();
    assert_eq!(err.as_ws_error(), WsError::InvalidPermission);

    let scene = service.get_scene_session_manager().unwrap();
    let (session, _, token) = scene.create_session(&notes_app()).unwrap();
    let client = WindowClient::new();
    let (stage, channel) = client.proxies();
    let reply = session
        .connect(
            &stage,
            &channel,
            &SurfaceNode {
                id: 1,
                name: "s".into(),
            },
            None,
            &token,
        )
        .unwrap();
    assert_eq!(reply.display_id, 3);
    assert!(!reply.system_config.is_system_decor_enable);
}
