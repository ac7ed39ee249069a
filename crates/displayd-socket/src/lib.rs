//! Local-socket transport for displayd transactions.
//!
//! Carries the same parcels the in-process binder does, between processes.
//! Only data travels: object handles have no meaning outside the daemon, so
//! a parcel carrying one is refused before it is sent.
//!
//! Request frame: magic, `u32` payload length, `u32` code, `u32` flags,
//! payload. Reply frame: magic, `u32` payload length, `i32` status,
//! payload. One-way requests get no reply frame. All integers are
//! little-endian.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use displayd_core::ipc::{
    CallerInfo, DeathRecipient, DispatchStatus, MessageOption, Parcel, RemoteHandle,
    RemoteObject, TransportError,
};
use interprocess::local_socket::{LocalSocketListener, LocalSocketStream};
use tracing::{debug, error, info, warn};

/// Frame magic
pub const IPC_MAGIC: &[u8; 7] = b"dsp-ipc";

/// Largest payload either side accepts.
pub const MAX_PAYLOAD: usize = 1 << 20;

/// Reply status for a request whose target object has died.
pub const DEAD_OBJECT_STATUS: i32 = -32;

/// Identity stamped on every socket connection. The transport cannot
/// vouch for the peer, so it never passes a privilege check.
pub const SOCKET_CALLER: CallerInfo = CallerInfo {
    pid: 0,
    uid: u32::MAX,
};

// ── Frames ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub code: u32,
    pub flags: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub status: i32,
    pub payload: Vec<u8>,
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_header(reader: &mut impl Read) -> io::Result<usize> {
    let mut magic = [0u8; 7];
    reader.read_exact(&mut magic)?;
    if &magic != IPC_MAGIC {
        return Err(invalid(format!("invalid IPC magic: {magic:?}")));
    }
    let length = read_u32(reader)? as usize;
    if length > MAX_PAYLOAD {
        return Err(invalid(format!("payload of {length} bytes exceeds {MAX_PAYLOAD}")));
    }
    Ok(length)
}

fn read_payload(reader: &mut impl Read, length: usize) -> io::Result<Vec<u8>> {
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

impl RequestFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(19 + self.payload.len());
        bytes.extend_from_slice(IPC_MAGIC);
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.code.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// `Ok(None)` on a clean end of stream before the first byte.
    pub fn from_reader(reader: &mut impl Read) -> io::Result<Option<Self>> {
        let length = match read_header(reader) {
            Ok(length) => length,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let code = read_u32(reader)?;
        let flags = read_u32(reader)?;
        let payload = read_payload(reader, length)?;
        Ok(Some(Self {
            code,
            flags,
            payload,
        }))
    }
}

impl ReplyFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(15 + self.payload.len());
        bytes.extend_from_slice(IPC_MAGIC);
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.status.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_reader(reader: &mut impl Read) -> io::Result<Self> {
        let length = read_header(reader)?;
        let status = read_u32(reader)? as i32;
        let payload = read_payload(reader, length)?;
        Ok(Self { status, payload })
    }
}

// ── Server ───────────────────────────────────────────────────────────

/// Serves one object over a local socket.
pub struct SocketServer {
    socket_path: PathBuf,
    listener: LocalSocketListener,
    target: RemoteHandle,
}

impl SocketServer {
    /// Bind `socket_path`, replacing a stale socket file. Every request is
    /// delivered to `target`.
    pub fn bind(socket_path: impl AsRef<Path>, target: RemoteHandle) -> Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("Failed to remove stale socket: {socket_path:?}"))?;
        }
        let listener = LocalSocketListener::bind(socket_path.as_path())
            .with_context(|| format!("Failed to bind IPC socket: {socket_path:?}"))?;
        info!("[Ipc] serving {} on {socket_path:?}", target.descriptor());
        Ok(Self {
            socket_path,
            listener,
            target,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until the listener fails. One thread per client.
    pub fn serve(self) -> Result<()> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let target = self.target.clone();
                    thread::Builder::new()
                        .name("ipc-client".into())
                        .spawn(move || {
                            if let Err(e) = handle_client(stream, &target) {
                                debug!("[Ipc] client disconnected: {e:#}");
                            }
                        })
                        .context("Failed to spawn IPC client thread")?;
                },
                Err(e) => {
                    error!("[Ipc] failed to accept connection: {e}");
                },
            }
        }
        Ok(())
    }

    /// Run [`serve`](Self::serve) on a background thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("ipc-accept".into())
            .spawn(move || {
                if let Err(e) = self.serve() {
                    error!("[Ipc] socket server stopped: {e:#}");
                }
            })
            .context("Failed to spawn IPC accept thread")
    }
}

/// Deliver one decoded request and build the reply frame, if any.
pub fn dispatch_frame(target: &RemoteHandle, frame: RequestFrame) -> Option<ReplyFrame> {
    let option = MessageOption::from_bits_truncate(frame.flags);
    let result = target.send_request(frame.code, Parcel::from_bytes(frame.payload), option);
    if option.is_async() {
        if let Err(e) = result {
            warn!("[Ipc] one-way code {} failed: {e}", frame.code);
        }
        return None;
    }
    let reply = match result {
        Ok(reply) if reply.has_objects() => {
            warn!("[Ipc] reply to code {} carries object handles", frame.code);
            ReplyFrame {
                status: DispatchStatus::InvalidData.code(),
                payload: Vec::new(),
            }
        },
        Ok(reply) => ReplyFrame {
            status: 0,
            payload: reply.as_bytes().to_vec(),
        },
        Err(TransportError::Rejected(status)) => ReplyFrame {
            status: status.code(),
            payload: Vec::new(),
        },
        Err(e) => {
            warn!("[Ipc] code {} failed: {e}", frame.code);
            ReplyFrame {
                status: DEAD_OBJECT_STATUS,
                payload: Vec::new(),
            }
        },
    };
    Some(reply)
}

fn handle_client(mut stream: LocalSocketStream, target: &RemoteHandle) -> Result<()> {
    while let Some(frame) =
        RequestFrame::from_reader(&mut stream).context("Failed to read request frame")?
    {
        debug!("[Ipc] request code {} flags {:#x}", frame.code, frame.flags);
        if let Some(reply) = dispatch_frame(target, frame) {
            stream
                .write_all(&reply.to_bytes())
                .context("Failed to write reply frame")?;
        }
    }
    Ok(())
}

// ── Client ───────────────────────────────────────────────────────────

/// Client end: a [`RemoteObject`] whose transactions go over the socket.
pub struct SocketRemote {
    descriptor: String,
    stream: Mutex<LocalSocketStream>,
    alive: AtomicBool,
    recipients: Mutex<Vec<Weak<dyn DeathRecipient>>>,
}

impl SocketRemote {
    /// Connect to a daemon serving an object that speaks `descriptor`.
    pub fn connect(socket_path: impl AsRef<Path>, descriptor: &str) -> Result<Self> {
        let socket_path = socket_path.as_ref();
        let stream = LocalSocketStream::connect(socket_path)
            .with_context(|| format!("Failed to connect to {socket_path:?}"))?;
        Ok(Self {
            descriptor: descriptor.to_string(),
            stream: Mutex::new(stream),
            alive: AtomicBool::new(true),
            recipients: Mutex::new(Vec::new()),
        })
    }

    fn mark_dead(&self) {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("[Ipc] connection for {} lost", self.descriptor);
        let recipients = std::mem::take(
            &mut *self.recipients.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for recipient in recipients.iter().filter_map(Weak::upgrade) {
            recipient.on_remote_died();
        }
    }

    fn exchange(
        &self,
        request: &RequestFrame,
        option: MessageOption,
    ) -> io::Result<Option<ReplyFrame>> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(&request.to_bytes())?;
        if option.is_async() {
            return Ok(None);
        }
        ReplyFrame::from_reader(&mut *stream).map(Some)
    }
}

impl RemoteObject for SocketRemote {
    fn descriptor(&self) -> &str {
        &self.descriptor
    }

    fn send_request(
        &self,
        code: u32,
        data: Parcel,
        option: MessageOption,
    ) -> Result<Parcel, TransportError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(TransportError::DeadObject);
        }
        if data.has_objects() {
            warn!("[Ipc] code {code} carries object handles, not sent");
            return Err(TransportError::ObjectsUnsupported);
        }
        let request = RequestFrame {
            code,
            flags: option.bits(),
            payload: data.as_bytes().to_vec(),
        };
        let reply = match self.exchange(&request, option) {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(Parcel::new()),
            Err(e) => {
                self.mark_dead();
                return Err(TransportError::Io(e));
            },
        };
        match reply.status {
            0 => Ok(Parcel::from_bytes(reply.payload)),
            DEAD_OBJECT_STATUS => Err(TransportError::DeadObject),
            status => Err(TransportError::Rejected(
                DispatchStatus::from_code(status).unwrap_or(DispatchStatus::InvalidData),
            )),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn add_death_recipient(&self, recipient: Weak<dyn DeathRecipient>) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.recipients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(recipient);
        true
    }
}
