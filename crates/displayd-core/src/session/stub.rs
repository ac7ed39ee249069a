//! Wire side of [`Session`](super::Session).

use std::sync::Arc;

use tracing::warn;

use super::types::{ConnectReply, SessionInfo, SurfaceNode, SystemSessionConfig, WindowSessionProperty};
use super::{client_channels, Session, SessionStageProxy, WindowEventChannelProxy};
use crate::error::status_of;
use crate::ipc::{
    read_status, transaction_codes, DispatchStatus, Parcel, ParcelError, ProxyBase, ProxyResult,
    RemoteHandle, RequestContext, Stub,
};

pub const SESSION_DESCRIPTOR: &str = "displayd.ISession";

transaction_codes! {
    pub enum SessionCode {
        Connect = 0,
        Foreground = 1,
        Background = 2,
        Disconnect = 3,
        PendingSessionActivation = 4,
        UpdateActiveStatus = 5,
    }
}

pub struct SessionStub {
    session: Arc<Session>,
}

impl SessionStub {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    fn handle_connect(&self, data: &mut Parcel, reply: &mut Parcel) -> Result<(), DispatchStatus> {
        let stage = data.read_required_object("session stage")?;
        let event_channel = data.read_required_object("event channel")?;
        let surface_node = data
            .read_parcelable::<SurfaceNode>()?
            .ok_or(ParcelError::NullField("surface node"))?;
        let property = data.read_parcelable::<WindowSessionProperty>()?;
        let identity_token = data.read_string()?;
        let Some((stage, event_channel)) = client_channels(stage, event_channel) else {
            warn!("[Session] connect with handles of the wrong interface");
            return Err(DispatchStatus::InvalidData);
        };

        let result = self
            .session
            .connect(stage, event_channel, surface_node, property, &identity_token);
        let fields = result.unwrap_or_else(|_| ConnectReply {
            system_config: self.session.env.system_config,
            persistent_id: self.session.persistent_id(),
            display_id: self.session.property().display_id,
        });
        reply.write_parcelable(Some(&fields.system_config));
        reply.write_i32(fields.persistent_id);
        reply.write_u64(fields.display_id);
        reply.write_i32(status_of(&result.map(drop)));
        Ok(())
    }
}

impl Stub for SessionStub {
    const DESCRIPTOR: &'static str = SESSION_DESCRIPTOR;
    type Code = SessionCode;

    fn handle(
        &self,
        code: SessionCode,
        data: &mut Parcel,
        reply: &mut Parcel,
        ctx: &RequestContext,
    ) -> Result<(), DispatchStatus> {
        let result = match code {
            SessionCode::Connect => return self.handle_connect(data, reply),
            SessionCode::Foreground | SessionCode::Background | SessionCode::Disconnect => {
                let is_from_client = data.read_bool()?;
                let identity_token = data.read_string()?;
                match code {
                    SessionCode::Foreground => self.session.foreground(is_from_client, &identity_token),
                    SessionCode::Background => self.session.background(is_from_client, &identity_token),
                    _ => self.session.disconnect(is_from_client, &identity_token),
                }
            },
            SessionCode::PendingSessionActivation => {
                let info = data
                    .read_parcelable::<SessionInfo>()?
                    .ok_or(ParcelError::NullField("session info"))?;
                self.session.pending_session_activation(info, &ctx.caller)
            },
            SessionCode::UpdateActiveStatus => {
                let active = data.read_bool()?;
                self.session.update_active_status(active)
            },
        };
        reply.write_i32(status_of(&result));
        Ok(())
    }
}

/// Client handle on a remote session.
#[derive(Debug, Clone)]
pub struct SessionProxy {
    base: ProxyBase,
}

impl SessionProxy {
    pub fn new(remote: RemoteHandle) -> Option<Self> {
        ProxyBase::new(remote, SESSION_DESCRIPTOR).map(|base| Self { base })
    }

    pub const fn remote(&self) -> &RemoteHandle {
        self.base.remote()
    }

    pub fn connect(
        &self,
        stage: &SessionStageProxy,
        event_channel: &WindowEventChannelProxy,
        surface_node: &SurfaceNode,
        property: Option<&WindowSessionProperty>,
        identity_token: &str,
    ) -> ProxyResult<ConnectReply> {
        let mut data = self.base.request();
        data.write_remote_object(Some(stage.remote()));
        data.write_remote_object(Some(event_channel.remote()));
        data.write_parcelable(Some(surface_node));
        data.write_parcelable(property);
        data.write_string(identity_token);

        let mut reply = self.base.call(SessionCode::Connect.into(), data)?;
        let system_config = reply
            .read_parcelable::<SystemSessionConfig>()?
            .ok_or(ParcelError::NullField("system config"))?;
        let persistent_id = reply.read_i32()?;
        let display_id = reply.read_u64()?;
        read_status(&mut reply)?;
        Ok(ConnectReply {
            system_config,
            persistent_id,
            display_id,
        })
    }

    fn lifecycle(&self, code: SessionCode, is_from_client: bool, identity_token: &str) -> ProxyResult {
        let mut data = self.base.request();
        data.write_bool(is_from_client);
        data.write_string(identity_token);
        self.base.post(code.into(), data)
    }

    pub fn foreground(&self, is_from_client: bool, identity_token: &str) -> ProxyResult {
        self.lifecycle(SessionCode::Foreground, is_from_client, identity_token)
    }

    pub fn background(&self, is_from_client: bool, identity_token: &str) -> ProxyResult {
        self.lifecycle(SessionCode::Background, is_from_client, identity_token)
    }

    pub fn disconnect(&self, is_from_client: bool, identity_token: &str) -> ProxyResult {
        self.lifecycle(SessionCode::Disconnect, is_from_client, identity_token)
    }

    pub fn pending_session_activation(&self, info: &SessionInfo) -> ProxyResult {
        let mut data = self.base.request();
        data.write_parcelable(Some(info));
        self.base
            .post(SessionCode::PendingSessionActivation.into(), data)
    }

    pub fn update_active_status(&self, active: bool) -> ProxyResult {
        let mut data = self.base.request();
        data.write_bool(active);
        let mut reply = self.base.call(SessionCode::UpdateActiveStatus.into(), data)?;
        read_status(&mut reply)
    }
}
