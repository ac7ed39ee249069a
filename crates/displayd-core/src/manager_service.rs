//! Top-level service object.
//!
//! The one handle a client starts from. It answers small queries by id and
//! hands out the scene and screen managers, each hosted on its own binder.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{status_of, WsError, WsResult};
use crate::fold::SuperFoldStatus;
use crate::ipc::{
    read_status, transaction_codes, CallerInfo, DispatchStatus, LocalBinder, Parcel, ParcelError,
    ProxyBase, ProxyError, ProxyResult, RemoteHandle, RequestContext, Stub,
};
use crate::power::ScreenTransitionState;
use crate::scene::{
    SceneSessionManager, SceneSessionManagerProxy, SceneSessionManagerStub, SessionSnapshot,
};
use crate::screen::{ScreenSessionManager, ScreenSessionManagerProxy, ScreenSessionManagerStub};

pub const SESSION_MANAGER_SERVICE_DESCRIPTOR: &str = "displayd.ISessionManagerService";

/// Ids understood by [`SessionManagerService::get_value_by_id`].
pub mod value_id {
    pub const VERSION: i32 = 0;
    pub const POWER_STATE: i32 = 1;
    pub const FOLD_STATUS: i32 = 2;
    pub const SESSION_COUNT: i32 = 3;
    pub const DUMP: i32 = 4;
}

#[derive(Debug, Serialize)]
struct ServiceDump<'a> {
    service: &'a str,
    version: &'a str,
    power_state: ScreenTransitionState,
    fold_status: SuperFoldStatus,
    sessions: Vec<SessionSnapshot>,
}

pub struct SessionManagerService {
    service_name: String,
    scene: Arc<SceneSessionManager>,
    screen: Arc<ScreenSessionManager>,
    scene_binder: LocalBinder,
    screen_binder: LocalBinder,
}

impl SessionManagerService {
    pub fn new(
        service_name: impl Into<String>,
        scene: Arc<SceneSessionManager>,
        screen: Arc<ScreenSessionManager>,
    ) -> Self {
        let scene_binder = LocalBinder::new(Arc::new(SceneSessionManagerStub::new(scene.clone())));
        let screen_binder =
            LocalBinder::new(Arc::new(ScreenSessionManagerStub::new(screen.clone())));
        Self {
            service_name: service_name.into(),
            scene,
            screen,
            scene_binder,
            screen_binder,
        }
    }

    pub fn scene(&self) -> &Arc<SceneSessionManager> {
        &self.scene
    }

    pub fn screen(&self) -> &Arc<ScreenSessionManager> {
        &self.screen
    }

    /// Look up a value by numeric id. Unknown ids are `InvalidParam`.
    pub fn get_value_by_id(&self, id: i32) -> WsResult<String> {
        let value = match id {
            value_id::VERSION => format!("{} {}", self.service_name, env!("CARGO_PKG_VERSION")),
            value_id::POWER_STATE => format!("{:?}", self.screen.power_state()),
            value_id::FOLD_STATUS => format!("{:?}", self.screen.fold_status()),
            value_id::SESSION_COUNT => self.scene.session_count().to_string(),
            value_id::DUMP => self.dump_json()?,
            other => {
                warn!("[Session] GetValueById with unknown id {other}");
                return Err(WsError::InvalidParam);
            },
        };
        debug!("[Session] GetValueById({id}) -> {value}");
        Ok(value)
    }

    fn dump_json(&self) -> WsResult<String> {
        let dump = ServiceDump {
            service: &self.service_name,
            version: env!("CARGO_PKG_VERSION"),
            power_state: self.screen.power_state(),
            fold_status: self.screen.fold_status(),
            sessions: self.scene.dump(),
        };
        serde_json::to_string_pretty(&dump).map_err(|e| {
            warn!("[Session] dump serialization failed: {e}");
            WsError::InvalidParam
        })
    }

    /// Handle on the scene manager, stamped with `caller`.
    pub fn scene_session_manager(&self, caller: CallerInfo) -> RemoteHandle {
        self.scene_binder.connect(caller)
    }

    /// Handle on the screen manager, stamped with `caller`.
    pub fn screen_session_manager(&self, caller: CallerInfo) -> RemoteHandle {
        self.screen_binder.connect(caller)
    }
}

transaction_codes! {
    pub enum SessionManagerServiceCode {
        GetSceneSessionManager = 0,
        GetScreenSessionManagerService = 1,
        GetValueById = 2,
    }
}

pub struct SessionManagerServiceStub {
    service: Arc<SessionManagerService>,
}

impl SessionManagerServiceStub {
    pub fn new(service: Arc<SessionManagerService>) -> Self {
        Self { service }
    }
}

impl Stub for SessionManagerServiceStub {
    const DESCRIPTOR: &'static str = SESSION_MANAGER_SERVICE_DESCRIPTOR;
    type Code = SessionManagerServiceCode;

    fn handle(
        &self,
        code: SessionManagerServiceCode,
        data: &mut Parcel,
        reply: &mut Parcel,
        ctx: &RequestContext,
    ) -> Result<(), DispatchStatus> {
        match code {
            SessionManagerServiceCode::GetSceneSessionManager => {
                let handle = self.service.scene_session_manager(ctx.caller);
                reply.write_remote_object(Some(&handle));
                reply.write_i32(0);
            },
            SessionManagerServiceCode::GetScreenSessionManagerService => {
                let handle = self.service.screen_session_manager(ctx.caller);
                reply.write_remote_object(Some(&handle));
                reply.write_i32(0);
            },
            SessionManagerServiceCode::GetValueById => {
                let id = data.read_i32()?;
                let result = self.service.get_value_by_id(id);
                reply.write_string(result.as_deref().unwrap_or_default());
                reply.write_i32(status_of(&result.map(drop)));
            },
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionManagerServiceProxy {
    base: ProxyBase,
}

impl SessionManagerServiceProxy {
    pub fn new(remote: RemoteHandle) -> Option<Self> {
        ProxyBase::new(remote, SESSION_MANAGER_SERVICE_DESCRIPTOR).map(|base| Self { base })
    }

    pub fn get_value_by_id(&self, id: i32) -> ProxyResult<String> {
        let mut data = self.base.request();
        data.write_i32(id);
        let mut reply = self
            .base
            .call(SessionManagerServiceCode::GetValueById.into(), data)?;
        let value = reply.read_string()?;
        read_status(&mut reply)?;
        Ok(value)
    }

    fn get_object(&self, code: SessionManagerServiceCode) -> ProxyResult<RemoteHandle> {
        let mut reply = self.base.call(code.into(), self.base.request())?;
        let handle = reply.read_remote_object()?;
        read_status(&mut reply)?;
        handle.ok_or(ProxyError::Reply(ParcelError::NullField("manager")))
    }

    pub fn get_scene_session_manager(&self) -> ProxyResult<SceneSessionManagerProxy> {
        let handle = self.get_object(SessionManagerServiceCode::GetSceneSessionManager)?;
        SceneSessionManagerProxy::new(handle)
            .ok_or(ProxyError::Reply(ParcelError::NullField("scene session manager")))
    }

    pub fn get_screen_session_manager(&self) -> ProxyResult<ScreenSessionManagerProxy> {
        let handle = self.get_object(SessionManagerServiceCode::GetScreenSessionManagerService)?;
        ScreenSessionManagerProxy::new(handle)
            .ok_or(ProxyError::Reply(ParcelError::NullField("screen session manager")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PermissionConfig, PowerConfig};
    use crate::display::PowerStateChangeReason;
    use crate::permission::StaticPermissions;
    use crate::screen::LoggingRenderService;
    use crate::session::testing::env;
    use crate::session::SessionInfo;
    use pretty_assertions::assert_eq;

    fn service() -> Arc<SessionManagerService> {
        let session_env = env();
        let screen = Arc::new(ScreenSessionManager::new(
            Arc::new(LoggingRenderService::new()),
            session_env.timers.clone(),
            &PowerConfig::default(),
            Arc::new(StaticPermissions::new(&PermissionConfig::default())),
        ));
        Arc::new(SessionManagerService::new(
            "displayd-test",
            SceneSessionManager::new(session_env),
            screen,
        ))
    }

    fn hosted(service: &Arc<SessionManagerService>) -> (LocalBinder, SessionManagerServiceProxy) {
        let binder = LocalBinder::new(Arc::new(SessionManagerServiceStub::new(service.clone())));
        let proxy = SessionManagerServiceProxy::new(binder.as_remote()).unwrap();
        (binder, proxy)
    }

    #[test]
    fn test_values_by_id() {
        let service = service();
        let (_binder, proxy) = hosted(&service);
        assert!(proxy
            .get_value_by_id(value_id::VERSION)
            .unwrap()
            .starts_with("displayd-test "));
        assert_eq!(proxy.get_value_by_id(value_id::POWER_STATE).unwrap(), "ScreenOn");
        assert_eq!(proxy.get_value_by_id(value_id::FOLD_STATUS).unwrap(), "Unknown");
        assert_eq!(proxy.get_value_by_id(value_id::SESSION_COUNT).unwrap(), "0");
    }

    #[test]
    fn test_unknown_value_id() {
        let service = service();
        let (_binder, proxy) = hosted(&service);
        let err = proxy.get_value_by_id(42).unwrap_err();
        assert!(matches!(err, ProxyError::Remote(WsError::InvalidParam)));
    }

    #[test]
    fn test_dump_is_json() {
        let service = service();
        service
            .scene()
            .create_session(
                SessionInfo {
                    bundle_name: "com.example.notes".into(),
                    ability_name: "MainAbility".into(),
                    ..SessionInfo::default()
                },
                CallerInfo::local(),
            )
            .unwrap();
        let dump = service.get_value_by_id(value_id::DUMP).unwrap();
        let json: serde_json::Value = serde_json::from_str(&dump).unwrap();
        assert_eq!(json["service"], "displayd-test");
        assert_eq!(json["sessions"][0]["bundle_name"], "com.example.notes");
        assert_eq!(json["sessions"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn test_managers_reached_through_service() {
        let service = service();
        let (_binder, proxy) = hosted(&service);

        let scene = proxy.get_scene_session_manager().unwrap();
        let (_session, id, _token) = scene.create_session(&SessionInfo::default()).unwrap();
        assert!(id > 0);
        assert_eq!(scene.session_count().unwrap(), 1);

        let screen = proxy.get_screen_session_manager().unwrap();
        assert!(screen
            .suspend_begin(PowerStateChangeReason::PowerKey)
            .unwrap());
        assert_eq!(screen.power_state().unwrap(), ScreenTransitionState::ScreenOn);
    }
}
