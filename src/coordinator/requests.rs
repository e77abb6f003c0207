//! The requests the [`CoordinatorService`] serves, and the channel carrying them.
//!
//! [`CoordinatorService`]: crate::coordinator::CoordinatorService

use derive_more::From;
use displaydoc::Display;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use super::{
    directory::HandshakeError,
    models::{RunState, TaskSpec, TaskStatus},
    sessions::Outbound,
};
use crate::{
    common::{CollaborationId, NodeId, RunId, TaskId},
    crypto::{Signature, UnknownKeyError},
    protocol::ControlMessage,
};

/// Error that occurs when a request is sent after the [`CoordinatorService`] shut down.
///
/// [`CoordinatorService`]: crate::coordinator::CoordinatorService
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the coordinator service shut down")]
pub struct ServiceShutdown;

#[derive(Debug, Display, Error, PartialEq, Eq)]
/// A task cannot be created for the requested targets.
pub enum InvalidTargetError {
    /// a task needs at least one target node
    NoTargets,
    /// node {0} is targeted more than once
    Duplicate(NodeId),
    /// node {node} is not a member of collaboration {collaboration}
    NotAMember {
        node: NodeId,
        collaboration: CollaborationId,
    },
    /// the initiator {node} is not a member of collaboration {collaboration}
    InitiatorNotMember {
        node: NodeId,
        collaboration: CollaborationId,
    },
    /// no sealed input for node {0}
    MissingInput(NodeId),
}

#[derive(Debug, Display, Error)]
/// Task creation failed. No state was created.
pub enum SubmitError {
    /// {0}
    InvalidTarget(#[from] InvalidTargetError),
    /// {0}
    UnknownKey(#[from] UnknownKeyError),
    /// {0}
    Shutdown(#[from] ServiceShutdown),
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum TaskError {
    /// unknown task {0}
    UnknownTask(TaskId),
    /// {0}
    Shutdown(#[from] ServiceShutdown),
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ResultError {
    /// unknown run {0}
    UnknownRun(RunId),
    /// the run is {0}, its result is not ready
    NotReady(RunState),
    /// the run failed: {0}
    Failed(String),
    /// {0}
    Shutdown(#[from] ServiceShutdown),
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum KillError {
    /// unknown run {0}
    UnknownRun(RunId),
    /// the run already reached the terminal state {0}
    AlreadyTerminal(RunState),
    /// {0}
    Shutdown(#[from] ServiceShutdown),
}

/// A task submission.
pub struct SubmitRequest {
    pub spec: TaskSpec,
    pub targets: Vec<NodeId>,
}

/// A node that answered the handshake challenge.
pub struct ConnectRequest {
    pub node_id: NodeId,
    pub collaborations: Vec<CollaborationId>,
    pub nonce: Vec<u8>,
    pub signature: Signature,
    /// Where the messages for this node are to be queued.
    pub outbound: Outbound,
}

/// A message received on an authenticated connection.
pub struct NodeMessage {
    pub node_id: NodeId,
    pub generation: u64,
    pub message: ControlMessage,
}

/// An authenticated connection went away.
pub struct DisconnectRequest {
    pub node_id: NodeId,
    pub generation: u64,
}

pub type SubmitResponse = Result<TaskId, SubmitError>;
/// The session generation to tag the connection's messages with.
pub type ConnectResponse = Result<u64, HandshakeError>;
pub type StatusResponse = Result<TaskStatus, TaskError>;
pub type SubscribeResponse = Result<watch::Receiver<TaskStatus>, TaskError>;
pub type RunResultResponse = Result<Vec<u8>, ResultError>;
pub type KillResponse = Result<(), KillError>;

/// A [`CoordinatorService`] request.
///
/// [`CoordinatorService`]: crate::coordinator::CoordinatorService
pub enum Request {
    Submit((SubmitRequest, oneshot::Sender<SubmitResponse>)),
    Connect((ConnectRequest, oneshot::Sender<ConnectResponse>)),
    Message(NodeMessage),
    Disconnect(DisconnectRequest),
    Status((TaskId, oneshot::Sender<StatusResponse>)),
    Subscribe((TaskId, oneshot::Sender<SubscribeResponse>)),
    Result((RunId, oneshot::Sender<RunResultResponse>)),
    Kill((RunId, oneshot::Sender<KillResponse>)),
}

/// A handle to send requests to the [`CoordinatorService`].
///
/// [`CoordinatorService`]: crate::coordinator::CoordinatorService
#[derive(From, Clone)]
pub struct RequestSender(mpsc::UnboundedSender<Request>);

impl RequestSender {
    /// Sends a request to the [`CoordinatorService`].
    ///
    /// # Errors
    /// Fails if the service has already shut down and the request channel has been closed as a
    /// result.
    ///
    /// [`CoordinatorService`]: crate::coordinator::CoordinatorService
    pub fn send(&self, req: Request) -> Result<(), ServiceShutdown> {
        self.0.send(req).map_err(|_| ServiceShutdown)
    }

    /// Sends a request and waits for the response.
    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, ServiceShutdown> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| ServiceShutdown)
    }
}

/// The receiver half of the request channel.
#[derive(From)]
pub struct RequestReceiver(mpsc::UnboundedReceiver<Request>);

impl RequestReceiver {
    /// Creates a new request channel and returns the [`RequestReceiver`] as well as the
    /// [`RequestSender`] half.
    pub fn new() -> (Self, RequestSender) {
        let (tx, rx) = mpsc::unbounded_channel::<Request>();
        (RequestReceiver::from(rx), RequestSender::from(tx))
    }

    /// Receives the next request.
    pub async fn recv(&mut self) -> Option<Request> {
        self.0.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel() {
        let (mut recv, snd) = RequestReceiver::new();
        snd.send(Request::Disconnect(DisconnectRequest {
            node_id: NodeId::from(1),
            generation: 1,
        }))
        .unwrap();
        assert!(matches!(recv.recv().await, Some(Request::Disconnect(_))));
        drop(snd);
        assert!(recv.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_request_after_shutdown() {
        let (recv, snd) = RequestReceiver::new();
        drop(recv);
        let response = snd.request(|tx| Request::Status((TaskId::new(), tx))).await;
        assert_eq!(response.err(), Some(ServiceShutdown));
    }
}
