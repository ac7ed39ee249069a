//! In-process transport.
//!
//! Each [`LocalBinder`] owns one worker thread that applies transactions
//! for its stub strictly in receipt order, whichever connection sent them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, info, warn};

use super::{
    CallerInfo, DeathRecipient, MessageOption, Parcel, RemoteHandle, RemoteObject,
    RemoteStub, RequestContext, TransportError,
};

type ReplySender = Sender<Result<Parcel, TransportError>>;

struct Job {
    code: u32,
    data: Parcel,
    ctx: RequestContext,
    reply: Option<ReplySender>,
}

struct Node {
    stub: Arc<dyn RemoteStub>,
    queue: Mutex<Option<Sender<Job>>>,
    worker: Option<ThreadId>,
    dead: Arc<AtomicBool>,
    recipients: Mutex<Vec<Weak<dyn DeathRecipient>>>,
}

impl Node {
    fn send(&self, caller: CallerInfo, code: u32, data: Parcel, option: MessageOption) -> Result<Parcel, TransportError> {
        if self.dead.load(Ordering::Acquire) {
            return Err(TransportError::DeadObject);
        }
        let ctx = RequestContext { caller, option };

        // A sync call from the worker into its own object would wait on
        // itself; run it in place.
        if !option.is_async() && self.worker == Some(thread::current().id()) {
            let mut data = data;
            let mut reply = Parcel::new();
            return self
                .stub
                .on_remote_request(code, &mut data, &mut reply, &ctx)
                .map(|()| reply)
                .map_err(TransportError::Rejected);
        }

        let (reply_tx, reply_rx) = if option.is_async() {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel();
            (Some(tx), Some(rx))
        };

        {
            let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(queue) = queue.as_ref() else {
                return Err(TransportError::DeadObject);
            };
            queue
                .send(Job {
                    code,
                    data,
                    ctx,
                    reply: reply_tx,
                })
                .map_err(|_| TransportError::DeadObject)?;
        }

        match reply_rx {
            None => Ok(Parcel::new()),
            Some(rx) => rx.recv().map_err(|_| TransportError::DeadObject)?,
        }
    }
}

fn serve(stub: &Arc<dyn RemoteStub>, dead: &AtomicBool, jobs: &Receiver<Job>) {
    for job in jobs {
        if dead.load(Ordering::Acquire) {
            if let Some(reply) = job.reply {
                let _ = reply.send(Err(TransportError::DeadObject));
            }
            continue;
        }
        let Job {
            code,
            mut data,
            ctx,
            reply,
        } = job;
        let mut out = Parcel::new();
        let result = stub
            .on_remote_request(code, &mut data, &mut out, &ctx)
            .map(|()| out)
            .map_err(TransportError::Rejected);
        if let Some(reply) = reply {
            // Caller may have given up; nothing to do then.
            let _ = reply.send(result);
        }
    }
    debug!("[Ipc] {} worker exiting", stub.descriptor());
}

/// Hosts a stub in this process.
///
/// Cloning shares the same object. The worker exits once the binder and
/// every connection to it are dropped, or after [`kill`](Self::kill).
#[derive(Clone)]
pub struct LocalBinder {
    node: Arc<Node>,
}

impl LocalBinder {
    pub fn new(stub: Arc<dyn RemoteStub>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let dead = Arc::new(AtomicBool::new(false));
        let worker_stub = Arc::clone(&stub);
        let worker_dead = Arc::clone(&dead);
        let worker = thread::Builder::new()
            .name(format!("ipc:{}", stub.descriptor()))
            .spawn(move || serve(&worker_stub, &worker_dead, &rx))
            .map_err(|e| warn!("[Ipc] failed to spawn worker for {}: {e}", stub.descriptor()))
            .ok();

        let node = Node {
            queue: Mutex::new(worker.as_ref().map(|_| tx)),
            worker: worker.map(|handle| handle.thread().id()),
            stub,
            dead,
            recipients: Mutex::new(Vec::new()),
        };
        Self {
            node: Arc::new(node),
        }
    }

    pub fn descriptor(&self) -> &'static str {
        self.node.stub.descriptor()
    }

    /// A handle that stamps `caller` on every transaction it sends.
    pub fn connect(&self, caller: CallerInfo) -> RemoteHandle {
        Arc::new(Connection {
            node: Arc::clone(&self.node),
            caller,
        })
    }

    /// A handle for calls made by the daemon itself.
    pub fn as_remote(&self) -> RemoteHandle {
        self.connect(CallerInfo::local())
    }

    /// Tear the object down as if its process had exited. Queued
    /// transactions are dropped, later sends fail with
    /// [`TransportError::DeadObject`] and death recipients run once.
    pub fn kill(&self) {
        if self.node.dead.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("[Ipc] {} died", self.descriptor());
        self.node
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let recipients = std::mem::take(
            &mut *self
                .node
                .recipients
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for recipient in recipients.iter().filter_map(Weak::upgrade) {
            recipient.on_remote_died();
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.node.dead.load(Ordering::Acquire)
    }
}

struct Connection {
    node: Arc<Node>,
    caller: CallerInfo,
}

impl RemoteObject for Connection {
    fn descriptor(&self) -> &str {
        self.node.stub.descriptor()
    }

    fn send_request(
        &self,
        code: u32,
        data: Parcel,
        option: MessageOption,
    ) -> Result<Parcel, TransportError> {
        self.node.send(self.caller, code, data, option)
    }

    fn is_alive(&self) -> bool {
        !self.node.dead.load(Ordering::Acquire)
    }

    fn add_death_recipient(&self, recipient: Weak<dyn DeathRecipient>) -> bool {
        let mut recipients = self
            .node
            .recipients
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Checked under the lock so a concurrent kill cannot miss it.
        if self.node.dead.load(Ordering::Acquire) {
            return false;
        }
        recipients.push(recipient);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{DispatchStatus, Stub};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy)]
    enum CounterCode {
        Add,
        Get,
        AddViaSelf,
    }

    impl TryFrom<u32> for CounterCode {
        type Error = u32;

        fn try_from(code: u32) -> Result<Self, u32> {
            match code {
                1 => Ok(Self::Add),
                2 => Ok(Self::Get),
                3 => Ok(Self::AddViaSelf),
                other => Err(other),
            }
        }
    }

    #[derive(Default)]
    struct Counter {
        log: Mutex<Vec<i32>>,
        me: Mutex<Option<RemoteHandle>>,
    }

    impl Stub for Counter {
        const DESCRIPTOR: &'static str = "test.ICounter";
        type Code = CounterCode;

        fn handle(
            &self,
            code: CounterCode,
            data: &mut Parcel,
            reply: &mut Parcel,
            ctx: &RequestContext,
        ) -> Result<(), DispatchStatus> {
            match code {
                CounterCode::Add => {
                    let v = data.read_i32()?;
                    self.log.lock().unwrap().push(v);
                },
                CounterCode::Get => {
                    let log = self.log.lock().unwrap().clone();
                    reply.write_i32_vec(&log);
                    reply.write_u32(ctx.caller.uid);
                },
                CounterCode::AddViaSelf => {
                    let me = self.me.lock().unwrap().clone().unwrap();
                    reply.write_bool(add(&me, 99, MessageOption::SYNC).is_ok());
                },
            }
            Ok(())
        }
    }

    fn add(remote: &RemoteHandle, v: i32, option: MessageOption) -> Result<Parcel, TransportError> {
        let mut p = Parcel::new();
        p.write_interface_token(Counter::DESCRIPTOR);
        p.write_i32(v);
        remote.send_request(1, p, option)
    }

    fn get(remote: &RemoteHandle) -> (Vec<i32>, u32) {
        let mut p = Parcel::new();
        p.write_interface_token(Counter::DESCRIPTOR);
        let mut reply = remote.send_request(2, p, MessageOption::SYNC).unwrap();
        (reply.read_i32_vec(1024).unwrap(), reply.read_u32().unwrap())
    }

    struct Flag(AtomicUsize);

    impl DeathRecipient for Flag {
        fn on_remote_died(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_async_sends_applied_in_order() {
        let binder = LocalBinder::new(Arc::new(Counter::default()));
        let remote = binder.as_remote();
        for v in 0..50 {
            add(&remote, v, MessageOption::ASYNC).unwrap();
        }
        let (log, _) = get(&remote);
        assert_eq!(log, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_caller_info_stamped_per_connection() {
        let binder = LocalBinder::new(Arc::new(Counter::default()));
        let remote = binder.connect(CallerInfo { pid: 42, uid: 20010 });
        assert_eq!(get(&remote).1, 20010);
    }

    #[test]
    fn test_rejection_is_transport_error() {
        let binder = LocalBinder::new(Arc::new(Counter::default()));
        let remote = binder.as_remote();
        let mut p = Parcel::new();
        p.write_interface_token("test.IWrong");
        let err = remote.send_request(2, p, MessageOption::SYNC).unwrap_err();
        assert!(matches!(err, TransportError::Rejected(DispatchStatus::InvalidState)));
    }

    #[test]
    fn test_reentrant_sync_call_runs_inline() {
        let counter = Arc::new(Counter::default());
        let binder = LocalBinder::new(counter.clone());
        *counter.me.lock().unwrap() = Some(binder.as_remote());

        let mut p = Parcel::new();
        p.write_interface_token(Counter::DESCRIPTOR);
        let mut reply = binder
            .as_remote()
            .send_request(3, p, MessageOption::SYNC)
            .unwrap();
        assert!(reply.read_bool().unwrap());
        assert_eq!(*counter.log.lock().unwrap(), vec![99]);
        // Break the self-reference so the worker can exit.
        counter.me.lock().unwrap().take();
    }

    #[test]
    fn test_kill_notifies_once_and_fails_later_sends() {
        let binder = LocalBinder::new(Arc::new(Counter::default()));
        let remote = binder.as_remote();
        let flag = Arc::new(Flag(AtomicUsize::new(0)));
        let weak: Weak<dyn DeathRecipient> = Arc::downgrade(&flag) as Weak<dyn DeathRecipient>;
        assert!(remote.add_death_recipient(weak.clone()));

        binder.kill();
        binder.kill();
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);
        assert!(!remote.is_alive());
        assert!(matches!(
            add(&remote, 1, MessageOption::ASYNC),
            Err(TransportError::DeadObject)
        ));
        assert!(!remote.add_death_recipient(weak));
    }

    #[test]
    fn test_dropped_recipient_is_skipped() {
        let binder = LocalBinder::new(Arc::new(Counter::default()));
        let remote = binder.as_remote();
        let flag = Arc::new(Flag(AtomicUsize::new(0)));
        remote.add_death_recipient(Arc::downgrade(&flag) as Weak<dyn DeathRecipient>);
        drop(flag);
        binder.kill();
        thread::sleep(Duration::from_millis(10));
        assert!(!binder.is_alive());
    }
}
