use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};

use super::{
    directory::NodeDirectory,
    handle::CoordinatorHandle,
    models::TaskStatus,
    requests::{
        ConnectRequest,
        DisconnectRequest,
        NodeMessage,
        Request,
        RequestReceiver,
        SubmitRequest,
        TaskError,
    },
    scheduler::{Event, Scheduler},
};
use crate::{
    common::TaskId,
    crypto::{KeyRegistry, SecureEnvelope},
    settings::SchedulerSettings,
};

/// The single writer of the coordinator state.
///
/// Every mutation of tasks, runs and node sessions goes through the requests this service
/// receives from its [`CoordinatorHandle`]s, one at a time.
pub struct CoordinatorService {
    requests_rx: RequestReceiver,
    scheduler: Scheduler,
    settings: SchedulerSettings,
    watchers: HashMap<TaskId, watch::Sender<TaskStatus>>,
}

impl CoordinatorService {
    /// Creates the service along with the handle to talk to it.
    ///
    /// The coordinator only ever holds public keys: inputs are sealed with `registry` for the
    /// node each run targets.
    pub fn new(
        directory: NodeDirectory,
        registry: Arc<dyn KeyRegistry>,
        settings: SchedulerSettings,
    ) -> (Self, CoordinatorHandle) {
        let (requests_rx, requests_tx) = RequestReceiver::new();
        let service = Self {
            requests_rx,
            scheduler: Scheduler::new(
                directory,
                SecureEnvelope::new(registry),
                settings.task_timeout(),
            ),
            settings,
            watchers: HashMap::new(),
        };
        (service, CoordinatorHandle::new(requests_tx))
    }

    /// Serves requests until every handle is dropped.
    ///
    /// Pending runs are also dispatched periodically, and stale tasks expired, every
    /// `dispatch_interval`.
    pub async fn run(mut self) {
        let mut ticks = interval(self.settings.dispatch_interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                request = self.requests_rx.recv() => match request {
                    Some(request) => self.dispatch_request(request),
                    None => break,
                },
                _ = ticks.tick() => {
                    self.scheduler.expire_stale_tasks(Utc::now());
                    self.scheduler.dispatch_ready_runs();
                }
            }
            self.handle_events();
        }
        info!("all coordinator handles dropped, shutting down");
    }

    fn dispatch_request(&mut self, request: Request) {
        match request {
            Request::Submit((SubmitRequest { spec, targets }, tx)) => {
                let _ = tx.send(self.scheduler.submit(spec, targets));
            }
            Request::Connect((
                ConnectRequest {
                    node_id,
                    collaborations,
                    nonce,
                    signature,
                    outbound,
                },
                tx,
            )) => {
                let response =
                    self.scheduler
                        .connect(node_id, &collaborations, &nonce, &signature, outbound);
                if let Err(error) = &response {
                    warn!(node_id = %node_id, error = %error, "node authentication failed");
                }
                let _ = tx.send(response);
            }
            Request::Message(NodeMessage {
                node_id,
                generation,
                message,
            }) => {
                // rejections are logged by the scheduler and never reach the node
                let _ = self.scheduler.on_node_message(node_id, generation, message);
            }
            Request::Disconnect(DisconnectRequest {
                node_id,
                generation,
            }) => self.scheduler.disconnect(node_id, generation),
            Request::Status((task_id, tx)) => {
                let _ = tx.send(
                    self.scheduler
                        .task_status(task_id)
                        .ok_or(TaskError::UnknownTask(task_id)),
                );
            }
            Request::Subscribe((task_id, tx)) => {
                let _ = tx.send(self.subscribe(task_id));
            }
            Request::Result((run_id, tx)) => {
                let _ = tx.send(self.scheduler.result(run_id));
            }
            Request::Kill((run_id, tx)) => {
                let _ = tx.send(self.scheduler.kill_run(run_id));
            }
        }
    }

    fn subscribe(
        &mut self,
        task_id: TaskId,
    ) -> Result<watch::Receiver<TaskStatus>, TaskError> {
        let status = self
            .scheduler
            .task_status(task_id)
            .ok_or(TaskError::UnknownTask(task_id))?;
        if let Some(watcher) = self.watchers.get(&task_id) {
            return Ok(watcher.subscribe());
        }
        let ready = status.is_ready();
        let (tx, rx) = watch::channel(status);
        // a ready task does not change anymore, the receiver keeps the last value
        if !ready {
            self.watchers.insert(task_id, tx);
        }
        Ok(rx)
    }

    /// Performs the side effects queued by the scheduler.
    fn handle_events(&mut self) {
        while let Some(event) = self.scheduler.next_event() {
            match event {
                Event::Send { node_id, message } => {
                    let sent = self
                        .scheduler
                        .session(node_id)
                        .map_or(false, |session| session.send(message));
                    if !sent {
                        // the disconnect request is on its way and will revert the run
                        debug!(node_id = %node_id, "connection gone, message dropped");
                    }
                }
                Event::TaskUpdated(task_id) => self.notify(task_id),
            }
        }
    }

    fn notify(&mut self, task_id: TaskId) {
        let status = match self.scheduler.task_status(task_id) {
            Some(status) => status,
            None => return,
        };
        let ready = status.is_ready();
        if let Some(watcher) = self.watchers.get(&task_id) {
            let changed = *watcher.borrow() != status;
            if changed && watcher.send(status).is_err() {
                // nobody is watching anymore
                self.watchers.remove(&task_id);
            }
        }
        if ready {
            info!(task_id = %task_id, "task ready");
            self.watchers.remove(&task_id);
        }
    }
}
