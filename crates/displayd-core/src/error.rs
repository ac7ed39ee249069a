//! Application-level status codes.
//!
//! [`WsError`] travels inside a successful reply as a trailing `i32`.
//! It never describes a transport failure; those are
//! [`TransportError`](crate::ipc::TransportError)s.

/// Result alias for operations that answer with a [`WsError`] on failure.
pub type WsResult<T = ()> = Result<T, WsError>;

/// Window-service errors with stable wire values. `0` means success and is
/// not a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum WsError {
    #[error("nothing to do")]
    DoNothing,

    #[error("out of memory")]
    NoMem,

    #[error("object already destroyed")]
    DestroyedObject,

    #[error("invalid session")]
    InvalidSession,

    #[error("invalid parameter")]
    InvalidParam,

    #[error("caller lacks permission")]
    InvalidPermission,

    #[error("ipc failed")]
    IpcFailed,

    #[error("required argument missing")]
    NullPtr,

    #[error("operation already performed")]
    RepeatOperation,

    #[error("operation not valid in current state")]
    InvalidOperation,

    #[error("unknown status code {0}")]
    Unknown(i32),
}

impl WsError {
    /// The wire value.
    pub const fn code(self) -> i32 {
        match self {
            Self::DoNothing => 1,
            Self::NoMem => 2,
            Self::DestroyedObject => 3,
            Self::InvalidSession => 4,
            Self::InvalidParam => 5,
            Self::InvalidPermission => 6,
            Self::IpcFailed => 7,
            Self::NullPtr => 8,
            Self::RepeatOperation => 9,
            Self::InvalidOperation => 10,
            Self::Unknown(code) => code,
        }
    }

    /// Decode a wire status. `0` is success.
    pub const fn from_code(code: i32) -> WsResult {
        Err(match code {
            0 => return Ok(()),
            1 => Self::DoNothing,
            2 => Self::NoMem,
            3 => Self::DestroyedObject,
            4 => Self::InvalidSession,
            5 => Self::InvalidParam,
            6 => Self::InvalidPermission,
            7 => Self::IpcFailed,
            8 => Self::NullPtr,
            9 => Self::RepeatOperation,
            10 => Self::InvalidOperation,
            other => Self::Unknown(other),
        })
    }
}

/// Encode a result as its wire status.
pub const fn status_of(result: &WsResult) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_roundtrip() {
        for err in [
            WsError::DoNothing,
            WsError::InvalidSession,
            WsError::InvalidPermission,
            WsError::RepeatOperation,
        ] {
            assert_eq!(WsError::from_code(err.code()), Err(err));
        }
        assert_eq!(WsError::from_code(0), Ok(()));
        assert_eq!(WsError::from_code(4242), Err(WsError::Unknown(4242)));
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of(&Ok(())), 0);
        assert_eq!(status_of(&Err(WsError::NullPtr)), 8);
    }
}
