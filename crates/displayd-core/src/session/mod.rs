//! Session lifecycle.
//!
//! A [`Session`] is the server-side half of one client window. It starts
//! in `Disconnect`, becomes usable on `Connect`, moves between
//! `Foreground` and `Background`, and is dead for good after `Disconnect`.
//! Active/inactive is a separate flag that only a foreground session can
//! raise.

pub mod stage;
mod stub;
pub mod types;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::display::ScreenId;
use crate::error::{WsError, WsResult};
use crate::ipc::{CallerInfo, DeathRecipient, RemoteHandle};
use crate::permission::PermissionService;
use crate::timer::TimerManager;
use crate::vsync::{VsyncSource, VsyncStation};

pub use stage::{
    SessionStage, SessionStageCode, SessionStageProxy, SessionStageStub, WindowEventChannel,
    WindowEventChannelCode, WindowEventChannelProxy, WindowEventChannelStub,
    SESSION_STAGE_DESCRIPTOR, WINDOW_EVENT_CHANNEL_DESCRIPTOR,
};
pub use stub::{SessionCode, SessionProxy, SessionStub, SESSION_DESCRIPTOR};
pub use types::{
    ConnectReply, Rect, SessionInfo, SessionState, SurfaceNode, SystemSessionConfig, WindowMode,
    WindowSessionProperty,
};

/// Observes a session from inside the daemon. Held weakly.
pub trait SessionListener: Send + Sync {
    fn on_session_state_change(&self, persistent_id: i32, state: SessionState);

    fn on_disconnect(&self, _persistent_id: i32) {}
}

/// Receives `PendingSessionActivation` requests after the permission check.
pub trait PendingActivationHandler: Send + Sync {
    fn on_pending_session_activation(&self, info: SessionInfo) -> WsResult;
}

/// Hands out persistent ids. Ids are never reused by one allocator.
#[derive(Debug)]
pub struct PersistentIdAllocator {
    next: AtomicI32,
}

impl PersistentIdAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicI32::new(1),
        }
    }

    pub fn allocate(&self) -> i32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for PersistentIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared collaborators every session is created with.
#[derive(Clone)]
pub struct SessionEnv {
    pub system_config: SystemSessionConfig,
    pub default_display_id: ScreenId,
    pub vsync_source: Arc<dyn VsyncSource>,
    pub timers: Arc<TimerManager>,
    pub vsync_timeout: Duration,
    pub permissions: Arc<dyn PermissionService>,
}

struct Channels {
    stage: SessionStageProxy,
    event_channel: WindowEventChannelProxy,
}

struct SessionInner {
    state: SessionState,
    active: bool,
    destroyed: bool,
    channels: Option<Channels>,
    surface_node: Option<SurfaceNode>,
    property: WindowSessionProperty,
    vsync_station: Option<Arc<VsyncStation>>,
    death_recipient: Option<Arc<StageDeathRecipient>>,
}

pub struct Session {
    persistent_id: i32,
    info: SessionInfo,
    identity_token: String,
    weak_self: Weak<Session>,
    env: SessionEnv,
    inner: Mutex<SessionInner>,
    listeners: Mutex<Vec<Weak<dyn SessionListener>>>,
    pending_handler: Mutex<Option<Weak<dyn PendingActivationHandler>>>,
}

impl Session {
    pub fn new(env: SessionEnv, info: SessionInfo, persistent_id: i32) -> Arc<Self> {
        info!(
            "[Session] id {persistent_id} created for {}/{}",
            info.bundle_name, info.ability_name
        );
        Arc::new_cyclic(|weak_self| Self {
            persistent_id,
            info,
            identity_token: Uuid::new_v4().to_string(),
            weak_self: weak_self.clone(),
            env,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnect,
                active: false,
                destroyed: false,
                channels: None,
                surface_node: None,
                property: WindowSessionProperty::default(),
                vsync_station: None,
                death_recipient: None,
            }),
            listeners: Mutex::new(Vec::new()),
            pending_handler: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn persistent_id(&self) -> i32 {
        self.persistent_id
    }

    pub const fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Secret the owning client must present on lifecycle calls.
    pub fn identity_token(&self) -> &str {
        &self.identity_token
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    pub fn property(&self) -> WindowSessionProperty {
        self.lock().property.clone()
    }

    pub fn vsync_station(&self) -> Option<Arc<VsyncStation>> {
        self.lock().vsync_station.clone()
    }

    pub fn register_listener(&self, listener: Weak<dyn SessionListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    pub fn set_pending_activation_handler(&self, handler: Weak<dyn PendingActivationHandler>) {
        *self
            .pending_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn check_identity_token(&self, token: &str) -> WsResult {
        if token == self.identity_token {
            Ok(())
        } else {
            warn!("[Session] id {} identity token mismatch", self.persistent_id);
            Err(WsError::InvalidPermission)
        }
    }

    fn live_listeners(&self) -> Vec<Arc<dyn SessionListener>> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    fn notify_state_change(&self, state: SessionState) {
        for listener in self.live_listeners() {
            listener.on_session_state_change(self.persistent_id, state);
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Attach the client's callback channels and negotiate configuration.
    ///
    /// A second connect on a live session reports `RepeatOperation` and
    /// leaves the id and channels untouched.
    pub fn connect(
        &self,
        stage: SessionStageProxy,
        event_channel: WindowEventChannelProxy,
        surface_node: SurfaceNode,
        property: Option<WindowSessionProperty>,
        identity_token: &str,
    ) -> WsResult<ConnectReply> {
        self.check_identity_token(identity_token)?;
        {
            let inner = self.lock();
            if inner.destroyed {
                return Err(WsError::DestroyedObject);
            }
            if inner.state != SessionState::Disconnect {
                warn!("[Session] id {} already connected", self.persistent_id);
                return Err(WsError::RepeatOperation);
            }
        }

        let station = VsyncStation::new(
            surface_node.id,
            Arc::clone(&self.env.vsync_source),
            Arc::clone(&self.env.timers),
            self.env.vsync_timeout,
        );
        let recipient = Arc::new(StageDeathRecipient {
            session: self.weak_self.clone(),
        });
        let watched: Weak<dyn DeathRecipient> = Arc::downgrade(&recipient) as Weak<dyn DeathRecipient>;
        if !stage.remote().add_death_recipient(watched) {
            warn!("[Session] id {} stage already dead at connect", self.persistent_id);
            station.destroy();
            return Err(WsError::NullPtr);
        }

        let mut property = property.unwrap_or_default();
        if property.display_id == 0 {
            property.display_id = self.env.default_display_id;
        }

        // Another connect or a disconnect may have won while unlocked.
        let mut inner = self.lock();
        if inner.destroyed || inner.state != SessionState::Disconnect {
            let err = if inner.destroyed {
                WsError::DestroyedObject
            } else {
                WsError::RepeatOperation
            };
            drop(inner);
            station.destroy();
            return Err(err);
        }

        let reply = ConnectReply {
            system_config: self.env.system_config,
            persistent_id: self.persistent_id,
            display_id: property.display_id,
        };
        inner.state = SessionState::Connect;
        inner.channels = Some(Channels {
            stage,
            event_channel,
        });
        inner.surface_node = Some(surface_node);
        inner.property = property;
        inner.vsync_station = Some(station);
        inner.death_recipient = Some(recipient);
        drop(inner);

        info!("[Session] id {} connected", self.persistent_id);
        self.notify_state_change(SessionState::Connect);
        Ok(reply)
    }

    pub fn foreground(&self, is_from_client: bool, identity_token: &str) -> WsResult {
        self.check_identity_token(identity_token)?;
        let stage = {
            let mut inner = self.lock();
            if inner.destroyed {
                return Err(WsError::DestroyedObject);
            }
            if !matches!(inner.state, SessionState::Connect | SessionState::Background) {
                warn!(
                    "[Session] id {} foreground rejected in {:?}",
                    self.persistent_id, inner.state
                );
                return Err(WsError::InvalidSession);
            }
            inner.state = SessionState::Foreground;
            inner.channels.as_ref().map(|c| c.stage.clone())
        };

        debug!("[Session] id {} foreground", self.persistent_id);
        if !is_from_client {
            if let Some(stage) = stage {
                if let Err(e) = stage.notify_foreground() {
                    debug!("[Session] id {} foreground notify dropped: {e}", self.persistent_id);
                }
            }
        }
        self.notify_state_change(SessionState::Foreground);
        Ok(())
    }

    pub fn background(&self, is_from_client: bool, identity_token: &str) -> WsResult {
        self.check_identity_token(identity_token)?;
        let stage = {
            let mut inner = self.lock();
            if inner.destroyed {
                return Err(WsError::DestroyedObject);
            }
            if inner.state != SessionState::Foreground {
                warn!(
                    "[Session] id {} background rejected in {:?}",
                    self.persistent_id, inner.state
                );
                return Err(WsError::InvalidSession);
            }
            inner.state = SessionState::Background;
            inner.channels.as_ref().map(|c| c.stage.clone())
        };

        debug!("[Session] id {} background", self.persistent_id);
        if !is_from_client {
            if let Some(stage) = stage {
                if let Err(e) = stage.notify_background() {
                    debug!("[Session] id {} background notify dropped: {e}", self.persistent_id);
                }
            }
        }
        self.notify_state_change(SessionState::Background);
        Ok(())
    }

    pub fn disconnect(&self, is_from_client: bool, identity_token: &str) -> WsResult {
        self.check_identity_token(identity_token)?;
        self.teardown(!is_from_client)
    }

    fn teardown(&self, notify_stage: bool) -> WsResult {
        let (channels, station) = {
            let mut inner = self.lock();
            if inner.destroyed {
                return Err(WsError::DestroyedObject);
            }
            inner.destroyed = true;
            inner.state = SessionState::Disconnect;
            inner.active = false;
            inner.surface_node = None;
            inner.death_recipient = None;
            (inner.channels.take(), inner.vsync_station.take())
        };

        info!("[Session] id {} disconnected", self.persistent_id);
        if let Some(station) = station {
            station.destroy();
        }
        if notify_stage {
            if let Some(channels) = channels {
                if let Err(e) = channels.stage.notify_destroy() {
                    debug!("[Session] id {} destroy notify dropped: {e}", self.persistent_id);
                }
            }
        }
        self.notify_state_change(SessionState::Disconnect);
        for listener in self.live_listeners() {
            listener.on_disconnect(self.persistent_id);
        }
        Ok(())
    }

    /// `SetActive`. Only a foreground session may become active.
    pub fn update_active_status(&self, active: bool) -> WsResult {
        let channels = {
            let mut inner = self.lock();
            if inner.destroyed || inner.state == SessionState::Disconnect {
                return Err(WsError::InvalidSession);
            }
            if active == inner.active {
                return Err(WsError::DoNothing);
            }
            if active && inner.state != SessionState::Foreground {
                warn!(
                    "[Session] id {} cannot activate in {:?}",
                    self.persistent_id, inner.state
                );
                return Err(WsError::InvalidSession);
            }
            inner.active = active;
            inner
                .channels
                .as_ref()
                .map(|c| (c.stage.clone(), c.event_channel.clone()))
        };

        debug!("[Session] id {} active={active}", self.persistent_id);
        if let Some((stage, event_channel)) = channels {
            if let Err(e) = stage.update_active_status(active) {
                debug!("[Session] id {} active notify dropped: {e}", self.persistent_id);
            }
            if let Err(e) = event_channel.transfer_focus_active_event(active) {
                debug!("[Session] id {} focus event dropped: {e}", self.persistent_id);
            }
        }
        Ok(())
    }

    /// Ask for another session to be started. Privileged.
    pub fn pending_session_activation(&self, info: SessionInfo, caller: &CallerInfo) -> WsResult {
        if !self.env.permissions.is_system_calling(caller) {
            return Err(WsError::InvalidPermission);
        }
        if self.is_destroyed() {
            return Err(WsError::DestroyedObject);
        }
        let handler = self
            .pending_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        let Some(handler) = handler else {
            warn!("[Session] id {} no activation handler", self.persistent_id);
            return Err(WsError::InvalidSession);
        };
        info!(
            "[Session] id {} requests activation of {}/{}",
            self.persistent_id, info.bundle_name, info.ability_name
        );
        handler.on_pending_session_activation(info)
    }

    fn on_stage_died(&self) {
        warn!("[Session] id {} stage died", self.persistent_id);
        let _ = self.teardown(false);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(station) = inner.vsync_station.take() {
            station.destroy();
        }
    }
}

struct StageDeathRecipient {
    session: Weak<Session>,
}

impl DeathRecipient for StageDeathRecipient {
    fn on_remote_died(&self) {
        if let Some(session) = self.session.upgrade() {
            session.on_stage_died();
        }
    }
}

/// Resolve a stage and event channel from handles read off the wire.
pub(crate) fn client_channels(
    stage: RemoteHandle,
    event_channel: RemoteHandle,
) -> Option<(SessionStageProxy, WindowEventChannelProxy)> {
    Some((
        SessionStageProxy::new(stage)?,
        WindowEventChannelProxy::new(event_channel)?,
    ))
}
