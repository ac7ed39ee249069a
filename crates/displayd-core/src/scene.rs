//! Session registry.
//!
//! [`SceneSessionManager`] creates sessions, hosts each one on its own
//! [`LocalBinder`] and forgets it once it disconnects.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{status_of, WsError, WsResult};
use crate::ipc::{
    read_status, transaction_codes, CallerInfo, DispatchStatus, LocalBinder, Parcel, ParcelError,
    ProxyBase, ProxyError, ProxyResult, RemoteHandle, RequestContext, Stub,
};
use crate::session::{
    PendingActivationHandler, PersistentIdAllocator, Session, SessionEnv, SessionInfo,
    SessionListener, SessionProxy, SessionState, SessionStub,
};

pub const SCENE_SESSION_MANAGER_DESCRIPTOR: &str = "displayd.ISceneSessionManager";

/// What a creator gets back: a handle on the new session, its id and the
/// identity token lifecycle calls must present.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session: RemoteHandle,
    pub persistent_id: i32,
    pub identity_token: String,
}

/// Row of the state dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub persistent_id: i32,
    pub bundle_name: String,
    pub ability_name: String,
    pub state: SessionState,
    pub active: bool,
}

struct Entry {
    session: Arc<Session>,
    binder: LocalBinder,
    owner_uid: u32,
}

pub struct SceneSessionManager {
    env: SessionEnv,
    ids: PersistentIdAllocator,
    weak_self: Weak<SceneSessionManager>,
    sessions: Mutex<IndexMap<i32, Entry>>,
}

impl SceneSessionManager {
    pub fn new(env: SessionEnv) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            env,
            ids: PersistentIdAllocator::new(),
            weak_self: weak_self.clone(),
            sessions: Mutex::new(IndexMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<i32, Entry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a session, or hand back the existing one when `info` names a
    /// live persistent id. Only the creating uid or a system caller may
    /// reuse a session; the identity token goes with it.
    pub fn create_session(&self, info: SessionInfo, caller: CallerInfo) -> WsResult<CreatedSession> {
        if info.persistent_id != 0 {
            let sessions = self.lock();
            let Some(entry) = sessions.get(&info.persistent_id) else {
                warn!("[Scene] no session with id {}", info.persistent_id);
                return Err(WsError::InvalidSession);
            };
            if entry.owner_uid != caller.uid && !self.env.permissions.is_system_calling(&caller) {
                warn!(
                    "[Scene] uid {} may not reuse session {} of uid {}",
                    caller.uid, info.persistent_id, entry.owner_uid
                );
                return Err(WsError::InvalidPermission);
            }
            debug!("[Scene] reusing session {}", info.persistent_id);
            return Ok(CreatedSession {
                session: entry.binder.connect(caller),
                persistent_id: info.persistent_id,
                identity_token: entry.session.identity_token().to_owned(),
            });
        }

        let persistent_id = self.ids.allocate();
        let session = Session::new(self.env.clone(), info, persistent_id);
        let listener: Weak<dyn SessionListener> = self.weak_self.clone();
        session.register_listener(listener);
        let handler: Weak<dyn PendingActivationHandler> = self.weak_self.clone();
        session.set_pending_activation_handler(handler);

        let binder = LocalBinder::new(Arc::new(SessionStub::new(Arc::clone(&session))));
        let created = CreatedSession {
            session: binder.connect(caller),
            persistent_id,
            identity_token: session.identity_token().to_owned(),
        };
        self.lock().insert(
            persistent_id,
            Entry {
                session,
                binder,
                owner_uid: caller.uid,
            },
        );
        info!("[Scene] session {persistent_id} created for pid {}", caller.pid);
        Ok(created)
    }

    /// Tear a session down from the server side. Privileged.
    pub fn destroy_session(&self, persistent_id: i32, caller: &CallerInfo) -> WsResult {
        if !self.env.permissions.is_system_calling(caller) {
            return Err(WsError::InvalidPermission);
        }
        let entry = self.lock().shift_remove(&persistent_id);
        let Some(entry) = entry else {
            return Err(WsError::InvalidSession);
        };
        let token = entry.session.identity_token().to_owned();
        match entry.session.disconnect(false, &token) {
            Ok(()) | Err(WsError::DestroyedObject) => {},
            Err(e) => return Err(e),
        }
        entry.binder.kill();
        info!("[Scene] session {persistent_id} destroyed");
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    pub fn get_session(&self, persistent_id: i32) -> Option<Arc<Session>> {
        self.lock().get(&persistent_id).map(|e| Arc::clone(&e.session))
    }

    /// Snapshot in creation order.
    pub fn dump(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = self.lock().values().map(|e| Arc::clone(&e.session)).collect();
        sessions
            .iter()
            .map(|s| SessionSnapshot {
                persistent_id: s.persistent_id(),
                bundle_name: s.info().bundle_name.clone(),
                ability_name: s.info().ability_name.clone(),
                state: s.state(),
                active: s.is_active(),
            })
            .collect()
    }
}

impl SessionListener for SceneSessionManager {
    fn on_session_state_change(&self, persistent_id: i32, state: SessionState) {
        debug!("[Scene] session {persistent_id} -> {state:?}");
    }

    fn on_disconnect(&self, persistent_id: i32) {
        let entry = self.lock().shift_remove(&persistent_id);
        if let Some(entry) = entry {
            entry.binder.kill();
            info!("[Scene] session {persistent_id} removed");
        }
    }
}

impl PendingActivationHandler for SceneSessionManager {
    fn on_pending_session_activation(&self, info: SessionInfo) -> WsResult {
        self.create_session(info, CallerInfo::local()).map(drop)
    }
}

// ── Wire ────────────────────────────────────────────────────────────

transaction_codes! {
    pub enum SceneSessionManagerCode {
        CreateSession = 0,
        DestroySession = 1,
        GetSessionCount = 2,
    }
}

pub struct SceneSessionManagerStub {
    manager: Arc<SceneSessionManager>,
}

impl SceneSessionManagerStub {
    pub fn new(manager: Arc<SceneSessionManager>) -> Self {
        Self { manager }
    }
}

impl Stub for SceneSessionManagerStub {
    const DESCRIPTOR: &'static str = SCENE_SESSION_MANAGER_DESCRIPTOR;
    type Code = SceneSessionManagerCode;

    fn handle(
        &self,
        code: SceneSessionManagerCode,
        data: &mut Parcel,
        reply: &mut Parcel,
        ctx: &RequestContext,
    ) -> Result<(), DispatchStatus> {
        match code {
            SceneSessionManagerCode::CreateSession => {
                let info = data
                    .read_parcelable::<SessionInfo>()?
                    .ok_or(ParcelError::NullField("session info"))?;
                let result = self.manager.create_session(info, ctx.caller);
                match &result {
                    Ok(created) => {
                        reply.write_remote_object(Some(&created.session));
                        reply.write_i32(created.persistent_id);
                        reply.write_string(&created.identity_token);
                    },
                    Err(_) => {
                        reply.write_remote_object(None);
                        reply.write_i32(0);
                        reply.write_string("");
                    },
                }
                reply.write_i32(status_of(&result.map(drop)));
            },
            SceneSessionManagerCode::DestroySession => {
                let persistent_id = data.read_i32()?;
                let result = self.manager.destroy_session(persistent_id, &ctx.caller);
                reply.write_i32(status_of(&result));
            },
            SceneSessionManagerCode::GetSessionCount => {
                reply.write_u32(self.manager.session_count() as u32);
                reply.write_i32(0);
            },
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SceneSessionManagerProxy {
    base: ProxyBase,
}

impl SceneSessionManagerProxy {
    pub fn new(remote: RemoteHandle) -> Option<Self> {
        ProxyBase::new(remote, SCENE_SESSION_MANAGER_DESCRIPTOR).map(|base| Self { base })
    }

    /// Returns the session proxy, its persistent id and identity token.
    pub fn create_session(&self, info: &SessionInfo) -> ProxyResult<(SessionProxy, i32, String)> {
        let mut data = self.base.request();
        data.write_parcelable(Some(info));
        let mut reply = self
            .base
            .call(SceneSessionManagerCode::CreateSession.into(), data)?;
        let handle = reply.read_remote_object()?;
        let persistent_id = reply.read_i32()?;
        let identity_token = reply.read_string()?;
        read_status(&mut reply)?;
        let session = handle
            .and_then(SessionProxy::new)
            .ok_or(ProxyError::Reply(ParcelError::NullField("session")))?;
        Ok((session, persistent_id, identity_token))
    }

    pub fn destroy_session(&self, persistent_id: i32) -> ProxyResult {
        let mut data = self.base.request();
        data.write_i32(persistent_id);
        let mut reply = self
            .base
            .call(SceneSessionManagerCode::DestroySession.into(), data)?;
        read_status(&mut reply)
    }

    pub fn session_count(&self) -> ProxyResult<u32> {
        let mut reply = self
            .base
            .call(SceneSessionManagerCode::GetSessionCount.into(), self.base.request())?;
        let count = reply.read_u32()?;
        read_status(&mut reply)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::stage::testing::{FakeClient, StageCall};
    use crate::session::testing::{env, surface};
    use crate::ipc::RemoteObject;
    use crate::session::{
        client_channels, SessionInfo, SessionStageProxy, WindowEventChannelProxy,
    };
    use pretty_assertions::assert_eq;

    fn channels(client: &FakeClient) -> (SessionStageProxy, WindowEventChannelProxy) {
        client_channels(client.stage.as_remote(), client.channel.as_remote()).unwrap()
    }

    fn info(name: &str) -> SessionInfo {
        SessionInfo {
            bundle_name: name.into(),
            ability_name: "MainAbility".into(),
            ..SessionInfo::default()
        }
    }

    fn hosted() -> (Arc<SceneSessionManager>, SceneSessionManagerProxy) {
        let manager = SceneSessionManager::new(env());
        let binder = LocalBinder::new(Arc::new(SceneSessionManagerStub::new(Arc::clone(&manager))));
        let proxy = SceneSessionManagerProxy::new(binder.as_remote()).unwrap();
        (manager, proxy)
    }

    #[test]
    fn test_create_assigns_distinct_ids() {
        let (manager, proxy) = hosted();
        let (_, a, token_a) = proxy.create_session(&info("a")).unwrap();
        let (_, b, token_b) = proxy.create_session(&info("b")).unwrap();
        assert_ne!(a, b);
        assert_ne!(token_a, token_b);
        assert_eq!(proxy.session_count().unwrap(), 2);
        assert_eq!(manager.dump()[1].bundle_name, "b");
    }

    #[test]
    fn test_create_with_unknown_id_fails() {
        let (_manager, proxy) = hosted();
        let mut request = info("a");
        request.persistent_id = 99;
        let err = proxy.create_session(&request).unwrap_err();
        assert_eq!(err.as_ws_error(), WsError::InvalidSession);
    }

    #[test]
    fn test_reuse_by_owner_keeps_token() {
        let (manager, _proxy) = hosted();
        let owner = CallerInfo { pid: 9, uid: 20010 };
        let created = manager.create_session(info("a"), owner).unwrap();
        let mut request = info("a");
        request.persistent_id = created.persistent_id;

        let again = manager.create_session(request, owner).unwrap();
        assert_eq!(again.persistent_id, created.persistent_id);
        assert_eq!(again.identity_token, created.identity_token);
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn test_reuse_by_other_uid_is_refused() {
        let (manager, _proxy) = hosted();
        let owner = CallerInfo { pid: 9, uid: 20010 };
        let other = CallerInfo { pid: 12, uid: 20066 };
        let created = manager.create_session(info("a"), owner).unwrap();
        let mut request = info("a");
        request.persistent_id = created.persistent_id;

        let err = manager.create_session(request, other).err();
        assert_eq!(err, Some(WsError::InvalidPermission));
        let session = manager.get_session(created.persistent_id).unwrap();
        assert!(!session.is_destroyed());
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn test_client_disconnect_unregisters() {
        let (manager, proxy) = hosted();
        let (session, id, token) = proxy.create_session(&info("a")).unwrap();
        let client = FakeClient::new();
        let (stage, channel) = channels(&client);
        session.connect(&stage, &channel, &surface(4), None, &token).unwrap();
        assert_eq!(manager.get_session(id).unwrap().state(), SessionState::Connect);

        session.disconnect(true, &token).unwrap();
        // One-way; the registry drops the entry and then kills the object.
        for _ in 0..200 {
            if !session.remote().is_alive() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!session.remote().is_alive());
        assert_eq!(manager.session_count(), 0);
    }

    #[test]
    fn test_destroy_session_is_privileged() {
        let (manager, _proxy) = hosted();
        let created = manager
            .create_session(info("a"), CallerInfo::local())
            .unwrap();
        let app = CallerInfo { pid: 9, uid: 20010 };
        assert_eq!(
            manager.destroy_session(created.persistent_id, &app),
            Err(WsError::InvalidPermission)
        );
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn test_destroy_notifies_stage() {
        let (manager, proxy) = hosted();
        let (session, id, token) = proxy.create_session(&info("a")).unwrap();
        let client = FakeClient::new();
        let (stage, channel) = channels(&client);
        session.connect(&stage, &channel, &surface(4), None, &token).unwrap();

        proxy.destroy_session(id).unwrap();
        assert_eq!(client.next_call(), Some(StageCall::Destroy));
        assert_eq!(manager.session_count(), 0);
        assert!(proxy.destroy_session(id).is_err());
    }

    #[test]
    fn test_pending_activation_creates_session() {
        let (manager, proxy) = hosted();
        let (session, _, _) = proxy.create_session(&info("launcher")).unwrap();
        session.pending_session_activation(&info("settings")).unwrap();
        for _ in 0..100 {
            if manager.session_count() == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let names: Vec<String> = manager.dump().into_iter().map(|s| s.bundle_name).collect();
        assert_eq!(names, vec!["launcher".to_string(), "settings".to_string()]);
    }
}
