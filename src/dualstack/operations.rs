use std::sync::Arc;

use uuid::Uuid;

use crate::{
    completion::{Completion, CompletionSink, OperationKind, Outcome, PendingOperation, Request},
    error::SocketError,
};

use super::socket::{DualStackSocket, SocketCore};

async fn execute(core: &SocketCore, request: Request) -> Result<Outcome, SocketError> {
    match request {
        Request::Accept => core.accept().await.map(Outcome::Accepted),
        Request::Connect(endpoint) => {
            core.connect(endpoint).await?;
            Ok(Outcome::Connected(core.peer()))
        }
        Request::Send(data) => core.send(&data).await.map(Outcome::Sent),
        Request::Receive(max) => {
            let mut data = vec![0u8; max];
            let n = core.receive(&mut data).await?;
            data.truncate(n);
            Ok(Outcome::Received {
                data,
                remote: core.peer(),
                packet_info: None,
            })
        }
        Request::SendTo(data, endpoint) => core.send_to(&data, &endpoint).await.map(Outcome::Sent),
        Request::ReceiveFrom(max, placeholder) => {
            let mut data = vec![0u8; max];
            let (n, remote) = core.receive_from(&mut data, &placeholder).await?;
            data.truncate(n);
            Ok(Outcome::Received {
                data,
                remote: Some(remote),
                packet_info: None,
            })
        }
        Request::ReceiveMessageFrom(max, placeholder) => {
            let mut data = vec![0u8; max];
            let message = core.receive_from_with_packet_info(&mut data, &placeholder).await?;
            data.truncate(message.len);
            Ok(Outcome::Received {
                data,
                remote: Some(message.remote),
                packet_info: message.packet_info,
            })
        }
    }
}

/// Owns a tracked operation's sink. Dropped without a result (the runtime shut
/// down under the task), it still untracks the operation and reports `Disposed`.
struct Delivery {
    core: Arc<SocketCore>,
    id: Uuid,
    kind: OperationKind,
    sink: Option<CompletionSink>,
}

impl Delivery {
    fn finish(mut self, result: Result<Outcome, SocketError>) {
        if let Err(e) = &result {
            log::debug!("{:?} operation {} failed: {}", self.kind, self.id, e);
        }
        if let Some(sink) = self.sink.take() {
            self.core.untrack(self.id);
            sink.complete(Completion {
                id: self.id,
                kind: self.kind,
                result,
            });
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            self.core.untrack(self.id);
            log::debug!("{:?} operation {} abandoned", self.kind, self.id);
            sink.complete(Completion::disposed(self.id, self.kind));
        }
    }
}

impl DualStackSocket {
    /// Runs `request` in the background and hands its result to `sink` exactly
    /// once. Closing the socket completes it with `Disposed`.
    pub fn submit(&self, request: Request, sink: CompletionSink) -> Uuid {
        let id = Uuid::new_v4();
        self.spawn(id, request, sink);
        id
    }

    /// Like [`submit`](Self::submit), but the completion is collected through
    /// the returned handle.
    pub fn start(&self, request: Request) -> PendingOperation {
        let id = Uuid::new_v4();
        let (pending, sink) = PendingOperation::new(id, request.kind());
        self.spawn(id, request, sink);
        pending
    }

    fn spawn(&self, id: Uuid, request: Request, sink: CompletionSink) {
        let kind = request.kind();
        self.core.track(id, kind);
        log::trace!("submitted {:?} operation {}", kind, id);
        let delivery = Delivery {
            core: Arc::clone(&self.core),
            id,
            kind,
            sink: Some(sink),
        };
        self.core.runtime().spawn(async move {
            let result = execute(&delivery.core, request).await;
            delivery.finish(result);
        });
    }
}
