//! Sending side of the call protocol.

use tracing::warn;

use super::{MessageOption, Parcel, ParcelError, RemoteHandle, TransportError};
use crate::error::WsError;

/// Caller-side failure. `Transport` means the peer was never reached or
/// refused the message; `Remote` means it answered with an error status.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("remote returned {0}")]
    Remote(#[from] WsError),

    #[error("malformed reply: {0}")]
    Reply(#[from] ParcelError),
}

impl ProxyError {
    /// Collapse into an application status, for callers that only report
    /// a code.
    pub const fn as_ws_error(&self) -> WsError {
        match self {
            Self::Transport(_) => WsError::IpcFailed,
            Self::Remote(e) => *e,
            Self::Reply(_) => WsError::IpcFailed,
        }
    }
}

pub type ProxyResult<T = ()> = Result<T, ProxyError>;

/// Shared plumbing for typed proxies.
#[derive(Debug, Clone)]
pub struct ProxyBase {
    remote: RemoteHandle,
    descriptor: &'static str,
}

impl ProxyBase {
    /// Wrap `remote` if it speaks `descriptor`.
    pub fn new(remote: RemoteHandle, descriptor: &'static str) -> Option<Self> {
        if remote.descriptor() == descriptor {
            Some(Self { remote, descriptor })
        } else {
            warn!(
                "[Ipc] expected {descriptor}, remote is {}",
                remote.descriptor()
            );
            None
        }
    }

    pub const fn remote(&self) -> &RemoteHandle {
        &self.remote
    }

    /// A request parcel with the interface token already written.
    pub fn request(&self) -> Parcel {
        let mut data = Parcel::new();
        data.write_interface_token(self.descriptor);
        data
    }

    /// Sync send. The reply is positioned at its first field.
    pub fn call(&self, code: u32, data: Parcel) -> ProxyResult<Parcel> {
        self.remote
            .send_request(code, data, MessageOption::SYNC)
            .map_err(|e| {
                warn!("[Ipc] {} code {code} failed: {e}", self.descriptor);
                ProxyError::from(e)
            })
    }

    /// One-way send.
    pub fn post(&self, code: u32, data: Parcel) -> ProxyResult {
        self.remote
            .send_request(code, data, MessageOption::ASYNC)
            .map(drop)
            .map_err(|e| {
                warn!("[Ipc] {} one-way code {code} failed: {e}", self.descriptor);
                ProxyError::from(e)
            })
    }
}

/// Read the trailing `i32` result of a reply after its fields.
pub(crate) fn read_status(reply: &mut Parcel) -> ProxyResult {
    let code = reply.read_i32()?;
    WsError::from_code(code).map_err(ProxyError::Remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_status_distinguishes_remote_error() {
        let mut reply = Parcel::new();
        reply.write_i32(WsError::InvalidSession.code());
        assert!(matches!(
            read_status(&mut reply),
            Err(ProxyError::Remote(WsError::InvalidSession))
        ));
    }

    #[test]
    fn test_missing_status_is_reply_error() {
        let mut reply = Parcel::new();
        let err = read_status(&mut reply).unwrap_err();
        assert!(matches!(err, ProxyError::Reply(_)));
        assert_eq!(err.as_ws_error(), WsError::IpcFailed);
    }
}
