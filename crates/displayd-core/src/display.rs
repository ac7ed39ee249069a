//! Screen and power vocabulary shared by the power machine, the screen
//! manager and its client notifications.

pub type ScreenId = u64;

/// The built-in panel.
pub const MAIN_SCREEN_ID: ScreenId = 0;

/// Closed `u32`-backed enum with a checked decoder and parcel helpers.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize)]
        #[repr(u32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl $name {
            pub const fn from_u32(value: u32) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn read_from(
                parcel: &mut $crate::ipc::Parcel,
            ) -> Result<Self, $crate::ipc::ParcelError> {
                let value = parcel.read_u32()?;
                Self::from_u32(value).ok_or($crate::ipc::ParcelError::InvalidEnum {
                    name: stringify!($name),
                    value,
                })
            }

            pub fn write_to(self, parcel: &mut $crate::ipc::Parcel) {
                parcel.write_u32(self as u32);
            }
        }
    };
}

pub(crate) use wire_enum;

wire_enum! {
    /// Power level of one physical screen as programmed into the renderer.
    pub enum ScreenPowerStatus {
        On = 0,
        Off = 1,
        Suspend = 2,
        OnAdvanced = 3,
        OffAdvanced = 4,
        Doze = 5,
        DozeSuspend = 6,
    }
}

impl ScreenPowerStatus {
    pub const fn is_on(self) -> bool {
        matches!(self, Self::On | Self::OnAdvanced)
    }
}

wire_enum! {
    /// Coarse power request applied to every screen at once.
    pub enum ScreenPowerState {
        On = 0,
        StandBy = 1,
        Suspend = 2,
        Off = 3,
    }
}

wire_enum! {
    pub enum DisplayState {
        Unknown = 0,
        Off = 1,
        On = 2,
        Doze = 3,
        DozeSuspend = 4,
        OnSuspend = 5,
    }
}

wire_enum! {
    /// Why power is changing. Passed through to clients untouched.
    pub enum PowerStateChangeReason {
        Init = 0,
        PowerKey = 1,
        Application = 2,
        Timeout = 3,
        Collaboration = 4,
        PreBright = 5,
        PreBrightAuthSuccess = 6,
        PreBrightAuthFailScreenOn = 7,
        PreBrightAuthFailScreenOff = 8,
        DisplaySwitch = 9,
    }
}

wire_enum! {
    pub enum DisplayPowerEvent {
        WakeUp = 0,
        Sleep = 1,
        DisplayOn = 2,
        DisplayOff = 3,
    }
}

wire_enum! {
    pub enum EventStatus {
        Begin = 0,
        End = 1,
    }
}

wire_enum! {
    pub enum ScreenEvent {
        Connected = 0,
        Disconnected = 1,
    }
}

/// Renderer power status that a coarse request maps to. `None` for
/// states the renderer has no status for.
pub const fn power_status_for(
    state: ScreenPowerState,
    reason: PowerStateChangeReason,
) -> Option<ScreenPowerStatus> {
    match (state, reason) {
        (ScreenPowerState::On, PowerStateChangeReason::PreBright) => {
            Some(ScreenPowerStatus::OnAdvanced)
        },
        (ScreenPowerState::On, _) => Some(ScreenPowerStatus::On),
        (ScreenPowerState::Off, PowerStateChangeReason::PreBrightAuthFailScreenOff) => {
            Some(ScreenPowerStatus::OffAdvanced)
        },
        (ScreenPowerState::Off, _) => Some(ScreenPowerStatus::Off),
        (ScreenPowerState::Suspend, _) => Some(ScreenPowerStatus::Suspend),
        (ScreenPowerState::StandBy, _) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Parcel, ParcelError};

    #[test]
    fn test_unknown_value_rejected() {
        let mut p = Parcel::new();
        p.write_u32(42);
        assert_eq!(
            DisplayState::read_from(&mut p),
            Err(ParcelError::InvalidEnum {
                name: "DisplayState",
                value: 42
            })
        );
    }

    #[test]
    fn test_power_status_mapping() {
        assert_eq!(
            power_status_for(ScreenPowerState::On, PowerStateChangeReason::PreBright),
            Some(ScreenPowerStatus::OnAdvanced)
        );
        assert_eq!(
            power_status_for(ScreenPowerState::Off, PowerStateChangeReason::PowerKey),
            Some(ScreenPowerStatus::Off)
        );
        assert_eq!(
            power_status_for(ScreenPowerState::StandBy, PowerStateChangeReason::Init),
            None
        );
    }
}
