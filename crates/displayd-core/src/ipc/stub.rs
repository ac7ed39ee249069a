//! Receiving side of the call protocol.

use std::fmt;

use tracing::{trace, warn};

use super::{DispatchStatus, Parcel, RequestContext};

/// Closed set of transaction codes for one interface, decodable from the
/// wire `u32`.
macro_rules! transaction_codes {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl TryFrom<u32> for $name {
            type Error = u32;

            fn try_from(code: u32) -> Result<Self, u32> {
                match code {
                    $($value => Ok(Self::$variant),)+
                    other => Err(other),
                }
            }
        }

        impl From<$name> for u32 {
            fn from(code: $name) -> u32 {
                code as u32
            }
        }
    };
}

pub(crate) use transaction_codes;

/// Object-safe entry point used by transports.
pub trait RemoteStub: Send + Sync {
    fn descriptor(&self) -> &'static str;

    fn on_remote_request(
        &self,
        code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        ctx: &RequestContext,
    ) -> Result<(), DispatchStatus>;
}

/// An interface implementation. The code set is a closed enum, so every
/// handled operation is visible in one `match` in [`Stub::handle`].
pub trait Stub: Send + Sync {
    const DESCRIPTOR: &'static str;

    type Code: TryFrom<u32> + Copy + fmt::Debug;

    /// Run one decoded operation. Field reads must follow the wire order;
    /// a read failure is returned as-is and becomes `InvalidData`.
    fn handle(
        &self,
        code: Self::Code,
        data: &mut Parcel,
        reply: &mut Parcel,
        ctx: &RequestContext,
    ) -> Result<(), DispatchStatus>;
}

impl<S: Stub> RemoteStub for S {
    fn descriptor(&self) -> &'static str {
        S::DESCRIPTOR
    }

    fn on_remote_request(
        &self,
        code: u32,
        data: &mut Parcel,
        reply: &mut Parcel,
        ctx: &RequestContext,
    ) -> Result<(), DispatchStatus> {
        dispatch(self, code, data, reply, ctx)
    }
}

/// Token check, then code resolution, then the handler.
///
/// The token is the first field; on mismatch nothing else is read and no
/// handler runs.
pub fn dispatch<S: Stub + ?Sized>(
    stub: &S,
    code: u32,
    data: &mut Parcel,
    reply: &mut Parcel,
    ctx: &RequestContext,
) -> Result<(), DispatchStatus> {
    match data.read_interface_token() {
        Ok(token) if token == S::DESCRIPTOR => {},
        Ok(token) => {
            warn!(
                "[Ipc] token mismatch on {}: got {token:?}, code {code}",
                S::DESCRIPTOR
            );
            return Err(DispatchStatus::InvalidState);
        },
        Err(e) => {
            warn!("[Ipc] unreadable token on {}: {e}", S::DESCRIPTOR);
            return Err(DispatchStatus::InvalidState);
        },
    }

    let Ok(op) = S::Code::try_from(code) else {
        return default_on_remote_request(S::DESCRIPTOR, code);
    };
    trace!("[Ipc] {} <- {op:?} from pid {}", S::DESCRIPTOR, ctx.caller.pid);
    stub.handle(op, data, reply, ctx).map_err(|status| {
        warn!("[Ipc] {} {op:?} rejected: {status}", S::DESCRIPTOR);
        status
    })
}

/// Fallback for codes an interface does not define.
pub fn default_on_remote_request(descriptor: &str, code: u32) -> Result<(), DispatchStatus> {
    warn!("[Ipc] {descriptor}: unknown transaction code {code}");
    Err(DispatchStatus::UnknownTransaction)
}
