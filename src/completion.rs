use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Waker},
    time::Duration,
};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    dualstack::{address::Endpoint, pktinfo::PacketInfo, socket::DualStackSocket},
    error::SocketError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Accept,
    Connect,
    Send,
    Receive,
    SendTo,
    ReceiveFrom,
    ReceiveMessageFrom,
}

/// An operation to run in the background. Buffers are owned by the request
/// and handed back through the [`Completion`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Accept,
    Connect(Endpoint),
    Send(Vec<u8>),
    /// Receive up to this many bytes.
    Receive(usize),
    SendTo(Vec<u8>, Endpoint),
    ReceiveFrom(usize, Endpoint),
    ReceiveMessageFrom(usize, Endpoint),
}

impl Request {
    pub fn kind(&self) -> OperationKind {
        match self {
            Request::Accept => OperationKind::Accept,
            Request::Connect(_) => OperationKind::Connect,
            Request::Send(_) => OperationKind::Send,
            Request::Receive(_) => OperationKind::Receive,
            Request::SendTo(..) => OperationKind::SendTo,
            Request::ReceiveFrom(..) => OperationKind::ReceiveFrom,
            Request::ReceiveMessageFrom(..) => OperationKind::ReceiveMessageFrom,
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Accepted(DualStackSocket),
    Connected(Option<SocketAddr>),
    Sent(usize),
    Received {
        data: Vec<u8>,
        remote: Option<SocketAddr>,
        packet_info: Option<PacketInfo>,
    },
}

#[derive(Debug)]
pub struct Completion {
    pub id: Uuid,
    pub kind: OperationKind,
    pub result: Result<Outcome, SocketError>,
}

impl Completion {
    pub(crate) fn disposed(id: Uuid, kind: OperationKind) -> Completion {
        Completion {
            id,
            kind,
            result: Err(SocketError::Disposed),
        }
    }

    pub fn bytes_transferred(&self) -> Option<usize> {
        match &self.result {
            Ok(Outcome::Sent(n)) => Some(*n),
            Ok(Outcome::Received { data, .. }) => Some(data.len()),
            _ => None,
        }
    }

    /// The peer the operation talked to, when it has one.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        match &self.result {
            Ok(Outcome::Accepted(socket)) => socket.remote_addr().ok(),
            Ok(Outcome::Connected(remote)) => *remote,
            Ok(Outcome::Received { remote, .. }) => *remote,
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SocketError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<Outcome, SocketError> {
        self.result
    }
}

/// Receives the one [`Completion`] of a submitted operation.
pub struct CompletionSink(Box<dyn FnOnce(Completion) + Send>);

impl CompletionSink {
    pub fn new<F>(f: F) -> CompletionSink
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        CompletionSink(Box::new(f))
    }

    pub fn channel(sender: Sender<Completion>) -> CompletionSink {
        CompletionSink::new(move |completion| {
            if let Err(e) = sender.send(completion) {
                log::warn!("dropping completion {}: receiver is gone", e.0.id);
            }
        })
    }

    pub(crate) fn complete(self, completion: Completion) {
        (self.0)(completion)
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionSink")
    }
}

type WakerSlot = Arc<Mutex<Option<Waker>>>;

struct Notifier {
    sender: Sender<Completion>,
    waker: WakerSlot,
}

impl Notifier {
    fn deliver(self, completion: Completion) {
        let _ = self.sender.send(completion);
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let waker = self.waker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Handle to an operation started with [`DualStackSocket::start`]. It can be
/// polled, waited on from a plain thread, or awaited.
pub struct PendingOperation {
    id: Uuid,
    kind: OperationKind,
    receiver: Receiver<Completion>,
    waker: WakerSlot,
    ready: Option<Completion>,
}

impl PendingOperation {
    pub(crate) fn new(id: Uuid, kind: OperationKind) -> (PendingOperation, CompletionSink) {
        let (sender, receiver) = bounded(1);
        let waker: WakerSlot = Arc::new(Mutex::new(None));
        let notifier = Notifier {
            sender,
            waker: waker.clone(),
        };
        let pending = PendingOperation {
            id,
            kind,
            receiver,
            waker,
            ready: None,
        };
        (pending, CompletionSink::new(move |completion| notifier.deliver(completion)))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Takes the completion if it has arrived.
    pub fn try_complete(&mut self) -> Option<Completion> {
        if let Some(completion) = self.ready.take() {
            return Some(completion);
        }
        match self.receiver.try_recv() {
            Ok(completion) => Some(completion),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Completion::disposed(self.id, self.kind)),
        }
    }

    pub fn is_completed(&mut self) -> bool {
        if self.ready.is_none() {
            self.ready = self.try_complete();
        }
        self.ready.is_some()
    }

    pub fn wait(mut self) -> Completion {
        if let Some(completion) = self.ready.take() {
            return completion;
        }
        self.receiver
            .recv()
            .unwrap_or_else(|_| Completion::disposed(self.id, self.kind))
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Completion> {
        if let Some(completion) = self.ready.take() {
            return Some(completion);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(completion) => Some(completion),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Completion::disposed(self.id, self.kind)),
        }
    }
}

impl Future for PendingOperation {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Completion> {
        if let Some(completion) = self.try_complete() {
            return Poll::Ready(completion);
        }
        *self.waker.lock().unwrap_or_else(PoisonError::into_inner) = Some(cx.waker().clone());
        // The completion may have landed between the check and the registration.
        match self.try_complete() {
            Some(completion) => Poll::Ready(completion),
            None => Poll::Pending,
        }
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
