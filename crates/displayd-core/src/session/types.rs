//! Data carried by session transactions.

use serde::Serialize;

use crate::config::SessionConfig;
use crate::display::{wire_enum, ScreenId};
use crate::ipc::{Parcel, ParcelError, Parcelable};
use crate::vsync::NodeId;

wire_enum! {
    pub enum SessionState {
        Disconnect = 0,
        Connect = 1,
        Foreground = 2,
        Background = 3,
    }
}

wire_enum! {
    pub enum WindowMode {
        Undefined = 0,
        Fullscreen = 1,
        SplitPrimary = 2,
        SplitSecondary = 3,
        Floating = 4,
        Pip = 5,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Parcelable for Rect {
    fn marshal(&self, parcel: &mut Parcel) {
        parcel.write_i32(self.x);
        parcel.write_i32(self.y);
        parcel.write_u32(self.width);
        parcel.write_u32(self.height);
    }

    fn unmarshal(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        Ok(Self {
            x: parcel.read_i32()?,
            y: parcel.read_i32()?,
            width: parcel.read_u32()?,
            height: parcel.read_u32()?,
        })
    }
}

/// Render node backing a session's window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SurfaceNode {
    pub id: NodeId,
    pub name: String,
}

impl Parcelable for SurfaceNode {
    fn marshal(&self, parcel: &mut Parcel) {
        parcel.write_u64(self.id);
        parcel.write_string(&self.name);
    }

    fn unmarshal(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        Ok(Self {
            id: parcel.read_u64()?,
            name: parcel.read_string()?,
        })
    }
}

/// Who the session is for, as supplied by the creator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub bundle_name: String,
    pub module_name: String,
    pub ability_name: String,
    /// `0` asks for a new session.
    pub persistent_id: i32,
    pub can_start_ability_from_background: bool,
    pub is_atomic_service: bool,
    pub instance_key: String,
}

impl Parcelable for SessionInfo {
    fn marshal(&self, parcel: &mut Parcel) {
        parcel.write_string(&self.bundle_name);
        parcel.write_string(&self.module_name);
        parcel.write_string(&self.ability_name);
        parcel.write_i32(self.persistent_id);
        parcel.write_bool(self.can_start_ability_from_background);
        parcel.write_bool(self.is_atomic_service);
        parcel.write_string(&self.instance_key);
    }

    fn unmarshal(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        Ok(Self {
            bundle_name: parcel.read_string()?,
            module_name: parcel.read_string()?,
            ability_name: parcel.read_string()?,
            persistent_id: parcel.read_i32()?,
            can_start_ability_from_background: parcel.read_bool()?,
            is_atomic_service: parcel.read_bool()?,
            instance_key: parcel.read_string()?,
        })
    }
}

/// Window attributes a client proposes at connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSessionProperty {
    pub window_name: String,
    pub window_mode: WindowMode,
    pub display_id: ScreenId,
    pub request_rect: Rect,
}

impl Default for WindowSessionProperty {
    fn default() -> Self {
        Self {
            window_name: String::new(),
            window_mode: WindowMode::Undefined,
            display_id: 0,
            request_rect: Rect::default(),
        }
    }
}

impl Parcelable for WindowSessionProperty {
    fn marshal(&self, parcel: &mut Parcel) {
        parcel.write_string(&self.window_name);
        self.window_mode.write_to(parcel);
        parcel.write_u64(self.display_id);
        self.request_rect.marshal(parcel);
    }

    fn unmarshal(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        Ok(Self {
            window_name: parcel.read_string()?,
            window_mode: WindowMode::read_from(parcel)?,
            display_id: parcel.read_u64()?,
            request_rect: Rect::unmarshal(parcel)?,
        })
    }
}

/// Negotiated system configuration returned by `Connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemSessionConfig {
    pub is_system_decor_enable: bool,
    pub default_window_mode: WindowMode,
    pub max_floating_window_size: u32,
}

impl SystemSessionConfig {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            is_system_decor_enable: config.system_decor_enabled,
            default_window_mode: WindowMode::from_u32(config.default_window_mode)
                .unwrap_or(WindowMode::Fullscreen),
            max_floating_window_size: config.max_floating_window_size,
        }
    }
}

impl Parcelable for SystemSessionConfig {
    fn marshal(&self, parcel: &mut Parcel) {
        parcel.write_bool(self.is_system_decor_enable);
        self.default_window_mode.write_to(parcel);
        parcel.write_u32(self.max_floating_window_size);
    }

    fn unmarshal(parcel: &mut Parcel) -> Result<Self, ParcelError> {
        Ok(Self {
            is_system_decor_enable: parcel.read_bool()?,
            default_window_mode: WindowMode::read_from(parcel)?,
            max_floating_window_size: parcel.read_u32()?,
        })
    }
}

/// What `Connect` hands back on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReply {
    pub system_config: SystemSessionConfig,
    pub persistent_id: i32,
    pub display_id: ScreenId,
}
