use tokio::sync::watch;

use super::{
    models::{TaskSpec, TaskStatus},
    requests::{
        ConnectRequest,
        ConnectResponse,
        DisconnectRequest,
        KillError,
        NodeMessage,
        Request,
        RequestSender,
        ResultError,
        ServiceShutdown,
        SubmitError,
        SubmitRequest,
        TaskError,
    },
};
use crate::common::{NodeId, RunId, TaskId};

#[derive(Clone)]
/// A handle to the [`CoordinatorService`]. This is the task API of the coordinator, and the way
/// the control channel server feeds it node traffic.
///
/// [`CoordinatorService`]: crate::coordinator::CoordinatorService
pub struct CoordinatorHandle(RequestSender);

impl CoordinatorHandle {
    pub(super) fn new(requests_tx: RequestSender) -> Self {
        Self(requests_tx)
    }

    /// Creates a task with one run per target node.
    ///
    /// # Errors
    /// Fails if a target is not a known member of the collaboration or has no registered key. No
    /// state is created then.
    pub async fn create_task(
        &self,
        spec: TaskSpec,
        targets: Vec<NodeId>,
    ) -> Result<TaskId, SubmitError> {
        self.0
            .request(|tx| Request::Submit((SubmitRequest { spec, targets }, tx)))
            .await?
    }

    /// The current status of a task, with a breakdown per run.
    pub async fn task_status(&self, task_id: TaskId) -> Result<TaskStatus, TaskError> {
        self.0
            .request(|tx| Request::Status((task_id, tx)))
            .await?
    }

    /// The result of a completed run, sealed for the task initiator.
    ///
    /// # Errors
    /// Fails with [`ResultError::NotReady`] as long as the run is not terminal.
    pub async fn result(&self, run_id: RunId) -> Result<Vec<u8>, ResultError> {
        self.0
            .request(|tx| Request::Result((run_id, tx)))
            .await?
    }

    /// Kills a run on behalf of a user. The run ends up failed with the reason
    /// `killed_by:user`.
    pub async fn kill_run(&self, run_id: RunId) -> Result<(), KillError> {
        self.0.request(|tx| Request::Kill((run_id, tx))).await?
    }

    /// Watches the status of a task.
    pub async fn subscribe(&self, task_id: TaskId) -> Result<watch::Receiver<TaskStatus>, TaskError> {
        self.0
            .request(|tx| Request::Subscribe((task_id, tx)))
            .await?
    }

    /// Waits until the task reaches a terminal state and returns its final status.
    pub async fn wait_until_ready(&self, task_id: TaskId) -> Result<TaskStatus, TaskError> {
        let mut status = self.subscribe(task_id).await?;
        loop {
            if status.borrow_and_update().is_ready() {
                break;
            }
            if status.changed().await.is_err() {
                // the last value sent before the watcher went away is the terminal one, unless
                // the service shut down
                if status.borrow().is_ready() {
                    break;
                }
                return Err(TaskError::Shutdown(ServiceShutdown));
            }
        }
        let status = status.borrow().clone();
        Ok(status)
    }

    pub(crate) async fn connect(
        &self,
        request: ConnectRequest,
    ) -> Result<ConnectResponse, ServiceShutdown> {
        self.0.request(|tx| Request::Connect((request, tx))).await
    }

    pub(crate) fn node_message(&self, message: NodeMessage) -> Result<(), ServiceShutdown> {
        self.0.send(Request::Message(message))
    }

    pub(crate) fn disconnect(&self, request: DisconnectRequest) -> Result<(), ServiceShutdown> {
        self.0.send(Request::Disconnect(request))
    }
}
