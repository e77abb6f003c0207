//! The node executor.
//!
//! Turns the assignments received over the control channel into container jobs and reports
//! their progress. Each job is supervised by its own task, so the control loop never waits on a
//! container. A job reports `RunStarted` once its container is up, then exactly one of
//! `RunCompleted` or `RunFailed`, all through the same outbox, in that order. A job killed while
//! it still waits for a run slot or its image never creates a container and only reports the
//! failure.

use std::{collections::HashMap, sync::Arc};

use derive_more::Display;
use futures::future::join_all;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{error_span, Instrument};

use super::{
    network::{NetworkHandle, PeerNetworkBridge},
    sandbox::{ExitOutcome, RunRequest, RunSlot, Sandbox, SandboxHandle, StartFailure},
};
use crate::{
    common::{CollaborationId, NodeId, RunId},
    crypto::SecureEnvelope,
    protocol::{Assignment, ControlMessage},
};

/// Where the messages for the coordinator are queued.
pub type Outbox = mpsc::UnboundedSender<ControlMessage>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
/// Who asked for a job to be killed.
pub enum KillInitiator {
    /// The coordinator, on behalf of a user.
    #[display(fmt = "user")]
    User,
    /// The node itself, shutting down.
    #[display(fmt = "shutdown")]
    Shutdown,
    /// The control channel dropped. The coordinator already put the run back to pending.
    #[display(fmt = "disconnect")]
    Disconnect,
    /// A new assignment of the same run arrived.
    #[display(fmt = "replaced")]
    Replaced,
}

impl KillInitiator {
    /// Whether the coordinator expects the kill to be confirmed with a failure report.
    pub fn is_reported(self) -> bool {
        matches!(self, Self::User | Self::Shutdown)
    }

    /// The failure reason reported for a killed run.
    pub fn reason(self) -> String {
        format!("killed_by:{}", self)
    }
}

struct Job {
    kill_tx: Option<oneshot::Sender<KillInitiator>>,
    task: JoinHandle<()>,
}

impl Job {
    fn kill(&mut self, initiator: KillInitiator) -> bool {
        match self.kill_tx.take() {
            Some(kill_tx) => kill_tx.send(initiator).is_ok(),
            None => false,
        }
    }
}

/// Executes the runs assigned to this node.
pub struct Executor {
    sandbox: Arc<Sandbox>,
    bridge: Arc<PeerNetworkBridge>,
    envelope: SecureEnvelope,
    outbox: Option<Outbox>,
    jobs: HashMap<RunId, Job>,
}

impl Executor {
    /// Creates an executor. `envelope` must hold the node's keyring.
    pub fn new(
        sandbox: Arc<Sandbox>,
        bridge: Arc<PeerNetworkBridge>,
        envelope: SecureEnvelope,
    ) -> Self {
        Self {
            sandbox,
            bridge,
            envelope,
            outbox: None,
            jobs: HashMap::new(),
        }
    }

    /// Sets the outbox of a freshly authenticated control channel.
    pub fn attach(&mut self, outbox: Outbox) {
        self.outbox = Some(outbox);
    }

    /// Forgets the outbox of a lost control channel and kills all jobs without reporting them.
    pub async fn detach(&mut self) {
        self.outbox = None;
        let killed = self.kill_all(KillInitiator::Disconnect).await;
        if killed > 0 {
            info!(killed, "killed the jobs of the lost control channel");
        }
    }

    /// Kills all jobs and reports them, then forgets the outbox.
    pub async fn shutdown(&mut self) {
        let killed = self.kill_all(KillInitiator::Shutdown).await;
        info!(killed, "executor shut down");
        self.outbox = None;
    }

    /// The number of jobs not finished yet.
    pub fn active_jobs(&mut self) -> usize {
        self.reap();
        self.jobs.len()
    }

    /// Handles a message received from the coordinator.
    pub fn on_message(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Assign(assignment) => self.on_assignment(assignment),
            ControlMessage::Kill { run_id } => self.kill_run(run_id, KillInitiator::User),
            ControlMessage::Error { reason } => warn!(reason = %reason, "coordinator error"),
            ControlMessage::Challenge { .. }
            | ControlMessage::Hello { .. }
            | ControlMessage::RunStarted { .. }
            | ControlMessage::RunCompleted { .. }
            | ControlMessage::RunFailed { .. } => {
                warn!(message = ?message, "ignoring unexpected message")
            }
        }
    }

    /// Starts the container job of a run.
    ///
    /// An input that does not decrypt fails the run for good. A job already running for the same
    /// run is killed first: there is never more than one job per run.
    pub fn on_assignment(&mut self, assignment: Assignment) {
        self.reap();
        let outbox = match &self.outbox {
            Some(outbox) => outbox.clone(),
            None => {
                warn!(run_id = %assignment.run_id, "no control channel, dropping assignment");
                return;
            }
        };
        let Assignment {
            run_id,
            collaboration_id,
            encrypted_input,
            image,
            initiator,
            ..
        } = assignment;

        let input = match self.envelope.decrypt(collaboration_id, &encrypted_input) {
            Ok(input) => input,
            Err(error) => {
                warn!(run_id = %run_id, error = %error, "cannot open the run input");
                let _ = outbox.send(ControlMessage::RunFailed {
                    run_id,
                    reason: error.to_string(),
                    retriable: false,
                });
                return;
            }
        };

        let previous = self.jobs.remove(&run_id).map(|mut job| {
            info!(run_id = %run_id, "replacing the job of a reassigned run");
            job.kill(KillInitiator::Replaced);
            job.task
        });
        let (kill_tx, kill_rx) = oneshot::channel();
        let context = JobContext {
            run_id,
            collaboration_id,
            image,
            initiator,
            input,
            sandbox: self.sandbox.clone(),
            bridge: self.bridge.clone(),
            envelope: self.envelope.clone(),
            outbox,
        };
        let task = tokio::spawn(
            async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                context.run(kill_rx).await
            }
            .instrument(error_span!("job", run_id = %run_id)),
        );
        self.jobs.insert(
            run_id,
            Job {
                kill_tx: Some(kill_tx),
                task,
            },
        );
    }

    /// Kills the job of a run.
    ///
    /// A user kill of a run without a job is confirmed right away, so that the coordinator can
    /// settle the run.
    pub fn kill_run(&mut self, run_id: RunId, initiator: KillInitiator) {
        match self.jobs.get_mut(&run_id) {
            Some(job) => {
                if job.kill(initiator) {
                    info!(run_id = %run_id, initiator = %initiator, "killing job");
                }
            }
            None if initiator.is_reported() => {
                debug!(run_id = %run_id, "no job to kill");
                if let Some(outbox) = &self.outbox {
                    let _ = outbox.send(ControlMessage::RunFailed {
                        run_id,
                        reason: initiator.reason(),
                        retriable: false,
                    });
                }
            }
            None => {}
        }
    }

    /// Kills every job and waits until they are all gone. Returns the number of jobs killed.
    async fn kill_all(&mut self, initiator: KillInitiator) -> usize {
        let mut killed = 0;
        let mut tasks = Vec::with_capacity(self.jobs.len());
        for (_, mut job) in self.jobs.drain() {
            if job.kill(initiator) {
                killed += 1;
            }
            tasks.push(job.task);
        }
        for result in join_all(tasks).await {
            if let Err(error) = result {
                error!(error = %error, "job task failed");
            }
        }
        killed
    }

    fn reap(&mut self) {
        self.jobs.retain(|_, job| !job.task.is_finished());
    }
}

/// How a started container job ended.
enum Finished {
    Exited(ExitOutcome),
    Killed(KillInitiator),
}

/// Everything a container job needs, moved into its task.
struct JobContext {
    run_id: RunId,
    collaboration_id: CollaborationId,
    image: String,
    initiator: NodeId,
    input: Vec<u8>,
    sandbox: Arc<Sandbox>,
    bridge: Arc<PeerNetworkBridge>,
    envelope: SecureEnvelope,
    outbox: Outbox,
}

impl JobContext {
    async fn run(self, mut kill_rx: oneshot::Receiver<KillInitiator>) {
        let prepared = tokio::select! {
            prepared = self.prepare() => prepared,
            initiator = &mut kill_rx => {
                self.killed_before_start(initiator.unwrap_or(KillInitiator::Disconnect));
                return;
            }
        };
        let slot = match prepared {
            Ok(slot) => slot,
            Err(failure) => {
                self.report_failure(failure.to_string(), failure.is_retriable());
                return;
            }
        };

        let network = match self.bridge.acquire_network(self.collaboration_id).await {
            Ok(network) => network,
            Err(error) => {
                warn!(error = %error, "no collaboration network");
                self.report_failure(format!("network: {}", error), true);
                return;
            }
        };
        self.execute(slot, &network, &mut kill_rx).await;
        self.bridge.release(&network).await;
    }

    /// Waits for a run slot and the image of the run.
    async fn prepare(&self) -> Result<RunSlot, StartFailure> {
        let slot = self.sandbox.reserve().await?;
        self.sandbox.pull(&self.image).await?;
        Ok(slot)
    }

    async fn execute(
        &self,
        slot: RunSlot,
        network: &NetworkHandle,
        kill_rx: &mut oneshot::Receiver<KillInitiator>,
    ) {
        let peers = self.bridge.peer_addresses(self.collaboration_id).await;
        let request = RunRequest {
            run_id: self.run_id,
            image: &self.image,
            input: &self.input,
            network,
            peers: &peers,
        };
        let mut handle = match self.sandbox.start(slot, request).await {
            Ok(handle) => handle,
            Err(failure) => {
                self.report_failure(failure.to_string(), failure.is_retriable());
                return;
            }
        };
        // killed while the container was being started
        if let Ok(initiator) = kill_rx.try_recv() {
            self.killed(&mut handle, initiator).await;
            return;
        }
        self.send(ControlMessage::RunStarted {
            run_id: self.run_id,
        });

        let finished = tokio::select! {
            outcome = self.sandbox.await_completion(&mut handle) => Finished::Exited(outcome),
            initiator = &mut *kill_rx => {
                // the executor is gone along with the control channel
                Finished::Killed(initiator.unwrap_or(KillInitiator::Disconnect))
            }
        };
        match finished {
            Finished::Exited(outcome) => self.report_outcome(outcome),
            Finished::Killed(initiator) => self.killed(&mut handle, initiator).await,
        }
    }

    async fn killed(&self, handle: &mut SandboxHandle, initiator: KillInitiator) {
        self.sandbox.kill(handle).await;
        info!(initiator = %initiator, "job killed");
        if initiator.is_reported() {
            self.report_failure(initiator.reason(), false);
        }
    }

    fn killed_before_start(&self, initiator: KillInitiator) {
        info!(initiator = %initiator, "job killed before its container started");
        if initiator.is_reported() {
            self.report_failure(initiator.reason(), false);
        }
    }

    fn report_outcome(&self, outcome: ExitOutcome) {
        match outcome {
            ExitOutcome::Success(output) => {
                match self
                    .envelope
                    .encrypt(self.collaboration_id, self.initiator, &output)
                {
                    Ok(encrypted_output) => {
                        info!("run completed");
                        self.send(ControlMessage::RunCompleted {
                            run_id: self.run_id,
                            encrypted_output,
                        });
                    }
                    Err(error) => {
                        warn!(error = %error, "cannot seal the run output");
                        self.report_failure(error.to_string(), false);
                    }
                }
            }
            ExitOutcome::Transient(reason) => self.report_failure(reason, true),
            ExitOutcome::Permanent(reason) => self.report_failure(reason, false),
        }
    }

    fn report_failure(&self, reason: String, retriable: bool) {
        info!(reason = %reason, retriable, "run failed");
        self.send(ControlMessage::RunFailed {
            run_id: self.run_id,
            reason,
            retriable,
        });
    }

    fn send(&self, message: ControlMessage) {
        if self.outbox.send(message).is_err() {
            debug!("control channel gone, report dropped");
        }
    }
}
