//! Transaction dispatch layer.
//!
//! A transaction is `(code, parcel)` where the parcel starts with the
//! target's interface token. The receiving side is a [`Stub`]; the sending
//! side is a typed proxy built on [`ProxyBase`]. Transports implement
//! [`RemoteObject`]; [`LocalBinder`] is the in-process one.

mod binder;
mod parcel;
mod proxy;
mod stub;

use std::fmt;
use std::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::error::WsError;

pub use binder::LocalBinder;
pub use parcel::{Parcel, ParcelError, Parcelable};
pub use proxy::{ProxyBase, ProxyError, ProxyResult};
pub(crate) use proxy::read_status;
pub use stub::{default_on_remote_request, dispatch, RemoteStub, Stub};
pub(crate) use stub::transaction_codes;

/// Uid assigned to calls that originate inside the daemon.
pub const SYSTEM_UID: u32 = 1000;

bitflags! {
    /// Send mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageOption: u32 {
        /// One-way: the sender does not wait and no reply is read.
        const ASYNC = 1 << 0;
    }
}

impl MessageOption {
    /// Blocking send. This is the empty flag set.
    pub const SYNC: Self = Self::empty();

    pub const fn is_async(self) -> bool {
        self.contains(Self::ASYNC)
    }
}

impl Default for MessageOption {
    fn default() -> Self {
        Self::SYNC
    }
}

/// Identity of the process on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerInfo {
    pub pid: u32,
    pub uid: u32,
}

impl CallerInfo {
    /// The daemon itself.
    pub fn local() -> Self {
        Self {
            pid: std::process::id(),
            uid: SYSTEM_UID,
        }
    }
}

/// Per-call information handed to a stub.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub caller: CallerInfo,
    pub option: MessageOption,
}

/// Protocol-level rejection produced by the dispatch layer before or
/// instead of running business logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum DispatchStatus {
    #[error("interface token mismatch")]
    InvalidState,

    #[error("malformed transaction payload")]
    InvalidData,

    #[error("unknown transaction code")]
    UnknownTransaction,
}

impl DispatchStatus {
    pub const fn code(self) -> i32 {
        match self {
            Self::InvalidState => -1,
            Self::InvalidData => -2,
            Self::UnknownTransaction => -3,
        }
    }

    /// Decode a wire status; `0` is success and yields `None`.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::InvalidState),
            -3 => Some(Self::UnknownTransaction),
            0 => None,
            _ => Some(Self::InvalidData),
        }
    }
}

impl From<ParcelError> for DispatchStatus {
    fn from(_: ParcelError) -> Self {
        Self::InvalidData
    }
}

/// The send itself failed. Never carries an application status.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("remote object is dead")]
    DeadObject,

    #[error("transaction rejected by remote: {0}")]
    Rejected(DispatchStatus),

    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("parcel carries object handles this transport cannot move")]
    ObjectsUnsupported,
}

impl TransportError {
    /// Application status reported when a call could not be delivered.
    pub const fn as_ws_error(&self) -> WsError {
        WsError::IpcFailed
    }
}

/// Notified once when the process that owns a remote object goes away.
pub trait DeathRecipient: Send + Sync {
    fn on_remote_died(&self);
}

/// A handle on an object that lives behind some transport.
pub trait RemoteObject: Send + Sync {
    /// Interface descriptor of the object behind this handle.
    fn descriptor(&self) -> &str;

    /// Deliver a transaction. For [`MessageOption::ASYNC`] the returned
    /// parcel is empty and must not be read.
    fn send_request(
        &self,
        code: u32,
        data: Parcel,
        option: MessageOption,
    ) -> Result<Parcel, TransportError>;

    fn is_alive(&self) -> bool;

    /// Returns `false` if the object is already dead; the recipient is not
    /// stored in that case.
    fn add_death_recipient(&self, recipient: Weak<dyn DeathRecipient>) -> bool;
}

/// Shared handle to a remote object.
pub type RemoteHandle = Arc<dyn RemoteObject>;

impl fmt::Debug for dyn RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("descriptor", &self.descriptor())
            .field("alive", &self.is_alive())
            .finish()
    }
}
