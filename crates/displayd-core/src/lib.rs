//! displayd core: the display control plane without any transport or CLI.
//!
//! Everything that decides something lives here: the screen power machine
//! and its timeouts, the fold manager, the window session lifecycle, the
//! per-session vsync station and the binder-style dispatch that carries
//! requests to them. Transports (the in-process [`ipc::LocalBinder`], the
//! local socket in `displayd-socket`) only move parcels.
//!
//! # Quick Start
//! ```
//! use displayd_core::config::Config;
//! use displayd_core::manager_service::{value_id, SessionManagerServiceProxy};
//! use displayd_core::DisplayContext;
//!
//! let context = DisplayContext::with_defaults(&Config::default());
//! let service = SessionManagerServiceProxy::new(context.service_handle()).unwrap();
//! assert_eq!(service.get_value_by_id(value_id::POWER_STATE).unwrap(), "ScreenOn");
//! ```

pub mod config;
pub mod display;
pub mod error;
pub mod fold;
pub mod ipc;
pub mod manager_service;
pub mod permission;
pub mod power;
pub mod scene;
pub mod screen;
pub mod session;
pub mod timer;
pub mod vsync;

// Re-export primary API types at crate root
pub use error::{WsError, WsResult};
pub use fold::{SuperFoldStatus, SuperFoldStatusChangeEvent};
pub use ipc::{CallerInfo, LocalBinder, Parcel, RemoteHandle, RemoteObject};
pub use manager_service::{SessionManagerService, SessionManagerServiceProxy};
pub use power::{ScreenPowerEvent, ScreenStateMachine, ScreenTransitionState};
pub use session::{Session, SessionState};

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use config::Config;
use manager_service::SessionManagerServiceStub;
use permission::{PermissionService, StaticPermissions};
use scene::SceneSessionManager;
use screen::{LoggingRenderService, RenderService, ScreenSessionManager};
use session::{SessionEnv, SystemSessionConfig};
use timer::TimerManager;
use vsync::{SoftwareVsyncSource, VsyncSource};

/// Everything one daemon instance runs, wired together.
///
/// Owns the shared timer thread, both managers and the binder that hosts
/// the top-level service. Dropping it tears all of that down.
pub struct DisplayContext {
    config: Config,
    timers: Arc<TimerManager>,
    service: Arc<SessionManagerService>,
    service_binder: LocalBinder,
}

impl DisplayContext {
    /// Build against the given renderer and vsync source.
    pub fn new(
        config: &Config,
        render: Arc<dyn RenderService>,
        vsync_source: Arc<dyn VsyncSource>,
    ) -> Self {
        let timers = Arc::new(TimerManager::new());
        let permissions: Arc<dyn PermissionService> =
            Arc::new(StaticPermissions::new(&config.permissions));

        let screen = Arc::new(ScreenSessionManager::new(
            render,
            timers.clone(),
            &config.power,
            permissions.clone(),
        ));
        let scene = SceneSessionManager::new(SessionEnv {
            system_config: SystemSessionConfig::from_config(&config.session),
            default_display_id: config.session.default_display_id,
            vsync_source,
            timers: timers.clone(),
            vsync_timeout: Duration::from_millis(config.vsync.timeout_ms),
            permissions,
        });

        let service = Arc::new(SessionManagerService::new(
            config.general.service_name.clone(),
            scene,
            screen,
        ));
        let service_binder =
            LocalBinder::new(Arc::new(SessionManagerServiceStub::new(service.clone())));

        info!(
            "[Session] {} ready, power state {:?}",
            config.general.service_name,
            service.screen().power_state()
        );
        Self {
            config: config.clone(),
            timers,
            service,
            service_binder,
        }
    }

    /// Logging renderer and a thread-driven vsync at the configured rate.
    pub fn with_defaults(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(LoggingRenderService::new()),
            Arc::new(SoftwareVsyncSource::new(config.vsync.refresh_rate_hz)),
        )
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    pub const fn service(&self) -> &Arc<SessionManagerService> {
        &self.service
    }

    pub fn scene(&self) -> &Arc<SceneSessionManager> {
        self.service.scene()
    }

    pub fn screen(&self) -> &Arc<ScreenSessionManager> {
        self.service.screen()
    }

    /// Handle on the top-level service for calls made by the daemon itself.
    pub fn service_handle(&self) -> RemoteHandle {
        self.service_binder.as_remote()
    }

    /// Handle on the top-level service that stamps `caller` on every call.
    pub fn service_handle_for(&self, caller: CallerInfo) -> RemoteHandle {
        self.service_binder.connect(caller)
    }

    /// The binder hosting the top-level service, for transports.
    pub const fn service_binder(&self) -> &LocalBinder {
        &self.service_binder
    }
}
