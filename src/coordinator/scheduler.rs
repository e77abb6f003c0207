//! The task and run state of the coordinator.
//!
//! The [`Scheduler`] is a plain state machine: it never performs I/O itself but queues
//! [`Event`]s, which the [`CoordinatorService`] drains after every request it hands over.
//!
//! [`CoordinatorService`]: crate::coordinator::CoordinatorService

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::Duration,
};

use chrono::{DateTime, Utc};

use super::{
    directory::{HandshakeError, NodeDirectory},
    models::{
        Run,
        RunState,
        RunStatus,
        Task,
        TaskInput,
        TaskSpec,
        TaskState,
        TaskStatus,
        KILLED_BY_USER,
        TIMED_OUT,
    },
    requests::{InvalidTargetError, KillError, ResultError, SubmitError},
    sessions::{Outbound, Session, Sessions},
};
use crate::{
    common::{CollaborationId, NodeId, RunId, TaskId},
    crypto::{SecureEnvelope, Signature},
    protocol::{Assignment, ControlMessage},
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// Side effects requested by the [`Scheduler`].
pub enum Event {
    /// A message must be queued on the connection of a node.
    Send {
        node_id: NodeId,
        message: ControlMessage,
    },
    /// The status of a task changed.
    TaskUpdated(TaskId),
}

#[derive(Debug, PartialEq, Eq)]
/// Why a node message was not applied.
pub enum Rejection {
    UnknownRun,
    NotOwner,
    InvalidTransition(RunState),
    Unexpected,
}

pub struct Scheduler {
    directory: NodeDirectory,
    envelope: SecureEnvelope,
    sessions: Sessions,
    tasks: HashMap<TaskId, Task>,
    runs: HashMap<RunId, Run>,
    /// Runs in the `PENDING` state, in submission order.
    pending: VecDeque<RunId>,
    task_timeout: Option<Duration>,
    events: VecDeque<Event>,
}

impl Scheduler {
    pub fn new(
        directory: NodeDirectory,
        envelope: SecureEnvelope,
        task_timeout: Option<Duration>,
    ) -> Self {
        Self {
            directory,
            envelope,
            sessions: Sessions::default(),
            tasks: HashMap::new(),
            runs: HashMap::new(),
            pending: VecDeque::new(),
            task_timeout,
            events: VecDeque::new(),
        }
    }

    /// Pops the next side effect to perform.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn session(&self, node_id: NodeId) -> Option<&Session> {
        self.sessions.get(node_id)
    }

    pub fn run(&self, run_id: RunId) -> Option<&Run> {
        self.runs.get(&run_id)
    }

    pub fn task(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    fn emit(&mut self, event: Event) {
        self.events.push_back(event);
    }

    fn send(&mut self, node_id: NodeId, message: ControlMessage) {
        self.emit(Event::Send { node_id, message });
    }
}

// task API
impl Scheduler {
    /// Creates a task and one pending run per target node, then dispatches what it can.
    ///
    /// # Errors
    /// Fails if a target is not a member of the task's collaboration, if there is no key to seal
    /// a target's input with, or if an already sealed input is missing. Nothing is created then.
    pub fn submit(&mut self, spec: TaskSpec, targets: Vec<NodeId>) -> Result<TaskId, SubmitError> {
        let TaskSpec {
            collaboration_id,
            image,
            initiator,
            input,
        } = spec;
        self.validate_targets(collaboration_id, initiator, &targets)?;

        let mut inputs = Vec::with_capacity(targets.len());
        match input {
            TaskInput::Plaintext(plaintext) => {
                for node in &targets {
                    inputs.push(self.envelope.encrypt(collaboration_id, *node, &plaintext)?);
                }
            }
            TaskInput::Sealed(mut sealed) => {
                for node in &targets {
                    inputs.push(
                        sealed
                            .remove(node)
                            .ok_or(InvalidTargetError::MissingInput(*node))?,
                    );
                }
            }
        }

        let task_id = TaskId::new();
        let mut task = Task {
            id: task_id,
            collaboration_id,
            image,
            initiator,
            created_at: Utc::now(),
            runs: Vec::with_capacity(targets.len()),
        };
        for (node_id, encrypted_input) in targets.into_iter().zip(inputs) {
            let run = Run::new(task_id, node_id, encrypted_input);
            debug!(task_id = %task_id, run_id = %run.id, node_id = %node_id, "run created");
            task.runs.push(run.id);
            self.pending.push_back(run.id);
            self.runs.insert(run.id, run);
        }
        info!(
            task_id = %task_id,
            collaboration_id = %collaboration_id,
            runs = task.runs.len(),
            "task created"
        );
        self.tasks.insert(task_id, task);
        self.emit(Event::TaskUpdated(task_id));

        self.dispatch_ready_runs();
        Ok(task_id)
    }

    fn validate_targets(
        &self,
        collaboration: CollaborationId,
        initiator: NodeId,
        targets: &[NodeId],
    ) -> Result<(), InvalidTargetError> {
        if targets.is_empty() {
            return Err(InvalidTargetError::NoTargets);
        }
        if !self.directory.is_member(collaboration, initiator) {
            return Err(InvalidTargetError::InitiatorNotMember {
                node: initiator,
                collaboration,
            });
        }
        let mut seen = HashSet::new();
        for node in targets {
            if !seen.insert(*node) {
                return Err(InvalidTargetError::Duplicate(*node));
            }
            if !self.directory.is_member(collaboration, *node) {
                return Err(InvalidTargetError::NotAMember {
                    node: *node,
                    collaboration,
                });
            }
        }
        Ok(())
    }

    pub fn task_status(&self, task_id: TaskId) -> Option<TaskStatus> {
        let task = self.tasks.get(&task_id)?;
        let runs: Vec<RunStatus> = task
            .runs
            .iter()
            .filter_map(|run_id| self.runs.get(run_id))
            .map(RunStatus::from)
            .collect();
        Some(TaskStatus {
            task_id,
            collaboration_id: task.collaboration_id,
            image: task.image.clone(),
            initiator: task.initiator,
            created_at: task.created_at,
            state: TaskState::from_runs(runs.iter().map(|run| &run.state)),
            runs,
        })
    }

    /// The sealed result of a completed run.
    pub fn result(&self, run_id: RunId) -> Result<Vec<u8>, ResultError> {
        let run = self
            .runs
            .get(&run_id)
            .ok_or(ResultError::UnknownRun(run_id))?;
        match (run.state, &run.encrypted_result) {
            (RunState::Completed, Some(result)) => Ok(result.clone()),
            (RunState::Failed, _) => Err(ResultError::Failed(
                run.failure_reason.clone().unwrap_or_default(),
            )),
            (state, _) => Err(ResultError::NotReady(state)),
        }
    }

    /// Stops a run on behalf of a user.
    ///
    /// A pending run fails right away. An assigned or running run is killed by its node, which
    /// then reports the failure.
    pub fn kill_run(&mut self, run_id: RunId) -> Result<(), KillError> {
        let run = self
            .runs
            .get_mut(&run_id)
            .ok_or(KillError::UnknownRun(run_id))?;
        match run.state {
            RunState::Pending => {
                self.fail(run_id, KILLED_BY_USER.to_string());
            }
            RunState::Assigned | RunState::Running => {
                run.kill_requested = true;
                let node_id = run.node_id;
                info!(run_id = %run_id, node_id = %node_id, "killing run");
                self.send(node_id, ControlMessage::Kill { run_id });
            }
            state @ (RunState::Completed | RunState::Failed) => {
                return Err(KillError::AlreadyTerminal(state));
            }
        }
        Ok(())
    }

    /// Fails the pending runs of tasks older than the staleness timeout.
    pub fn expire_stale_tasks(&mut self, now: DateTime<Utc>) {
        let timeout = match self.task_timeout {
            Some(timeout) => timeout,
            None => return,
        };
        let stale: Vec<RunId> = self
            .pending
            .iter()
            .filter(|run_id| {
                self.runs
                    .get(run_id)
                    .and_then(|run| self.tasks.get(&run.task_id))
                    .and_then(|task| (now - task.created_at).to_std().ok())
                    .map_or(false, |age| age >= timeout)
            })
            .copied()
            .collect();
        for run_id in stale {
            warn!(run_id = %run_id, "run timed out while pending");
            self.fail(run_id, TIMED_OUT.to_string());
        }
    }

    /// Fails a pending run without involving its node.
    fn fail(&mut self, run_id: RunId, reason: String) {
        if let Some(run) = self.runs.get_mut(&run_id) {
            if run.transition(RunState::Failed).is_ok() {
                run.failure_reason = Some(reason);
                let task_id = run.task_id;
                self.pending.retain(|id| *id != run_id);
                self.emit(Event::TaskUpdated(task_id));
            }
        }
    }
}

// node API
impl Scheduler {
    /// Admits an authenticated node and dispatches its pending runs.
    ///
    /// A node that already has a session gets the new one; the runs of the replaced session go
    /// back to pending first and are assigned anew.
    ///
    /// # Errors
    /// Fails if the handshake answer does not check out against the directory.
    pub fn connect(
        &mut self,
        node_id: NodeId,
        collaborations: &[CollaborationId],
        nonce: &[u8],
        signature: &Signature,
        outbound: Outbound,
    ) -> Result<u64, HandshakeError> {
        let memberships = self
            .directory
            .authenticate(node_id, collaborations, nonce, signature)?;
        let (generation, replaced) = self.sessions.open(node_id, memberships, outbound);
        if let Some(replaced) = replaced {
            warn!(
                node_id = %node_id,
                generation = replaced.generation,
                "node reconnected, replacing its previous session"
            );
            self.revert_runs_of(node_id);
        }
        info!(
            node_id = %node_id,
            generation,
            connected = self.sessions.connected(),
            "node connected"
        );
        self.dispatch_ready_runs();
        Ok(generation)
    }

    /// Destroys the session of a node and puts its assigned and running runs back to pending.
    ///
    /// Stale generations are ignored: the node already has a newer session.
    pub fn disconnect(&mut self, node_id: NodeId, generation: u64) {
        if self.sessions.close(node_id, generation).is_some() {
            info!(node_id = %node_id, generation, "node disconnected");
            self.revert_runs_of(node_id);
        } else {
            debug!(node_id = %node_id, generation, "ignoring stale disconnect");
        }
    }

    fn revert_runs_of(&mut self, node_id: NodeId) {
        let affected: Vec<RunId> = self
            .runs
            .values()
            .filter(|run| {
                run.node_id == node_id
                    && matches!(run.state, RunState::Assigned | RunState::Running)
            })
            .map(|run| run.id)
            .collect();
        for run_id in affected {
            // checked above
            let run = match self.runs.get_mut(&run_id) {
                Some(run) => run,
                None => continue,
            };
            let task_id = run.task_id;
            if run.kill_requested {
                // the kill can no longer be confirmed by the node
                let _ = run.transition(RunState::Failed);
                run.failure_reason = Some(KILLED_BY_USER.to_string());
                info!(run_id = %run_id, "killed run failed on disconnect");
            } else {
                let _ = run.transition(RunState::Pending);
                self.pending.push_back(run_id);
                info!(run_id = %run_id, node_id = %node_id, "run reverted to pending");
            }
            self.emit(Event::TaskUpdated(task_id));
        }
    }

    /// Assigns every pending run whose node is connected and admitted to the run's
    /// collaboration. Returns the number of runs assigned.
    pub fn dispatch_ready_runs(&mut self) -> usize {
        let mut dispatched = 0;
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        while let Some(run_id) = self.pending.pop_front() {
            let (assignment, node_id) = match self.assignment_for(run_id) {
                Some(ready) => ready,
                None => {
                    waiting.push_back(run_id);
                    continue;
                }
            };
            if let Some(session) = self.sessions.get_mut(node_id) {
                session.outstanding.insert(run_id);
            }
            if let Some(run) = self.runs.get_mut(&run_id) {
                let _ = run.transition(RunState::Assigned);
                debug!(
                    run_id = %run_id,
                    node_id = %node_id,
                    attempt = run.attempts,
                    "run assigned"
                );
                let task_id = run.task_id;
                self.emit(Event::TaskUpdated(task_id));
            }
            self.send(node_id, ControlMessage::Assign(assignment));
            dispatched += 1;
        }
        self.pending = waiting;
        if dispatched > 0 {
            info!(dispatched, "dispatched pending runs");
        }
        dispatched
    }

    fn assignment_for(&self, run_id: RunId) -> Option<(Assignment, NodeId)> {
        let run = self.runs.get(&run_id)?;
        let task = self.tasks.get(&run.task_id)?;
        let session = self.sessions.get(run.node_id)?;
        if run.state != RunState::Pending || !session.collaborations.contains(&task.collaboration_id)
        {
            return None;
        }
        let assignment = Assignment {
            run_id,
            task_id: task.id,
            collaboration_id: task.collaboration_id,
            encrypted_input: run.encrypted_input.clone(),
            image: task.image.clone(),
            initiator: task.initiator,
        };
        Some((assignment, run.node_id))
    }

    /// Applies a status report of a node to the run it is about.
    ///
    /// # Errors
    /// Reports about runs the node does not own, and reports that do not follow the run state
    /// machine, are rejected without any effect.
    pub fn on_node_message(
        &mut self,
        node_id: NodeId,
        generation: u64,
        message: ControlMessage,
    ) -> Result<(), Rejection> {
        match self.sessions.current_mut(node_id, generation) {
            Some(session) => session.last_seen = Utc::now(),
            None => {
                debug!(node_id = %node_id, generation, "dropping message of a stale session");
                return Ok(());
            }
        }
        let result = match message {
            ControlMessage::RunStarted { run_id } => {
                self.apply(node_id, run_id, RunState::Running, |_| {})
            }
            ControlMessage::RunCompleted {
                run_id,
                encrypted_output,
            } => self.apply(node_id, run_id, RunState::Completed, |run| {
                run.encrypted_result = Some(encrypted_output)
            }),
            ControlMessage::RunFailed {
                run_id,
                reason,
                retriable,
            } => {
                let next = if retriable && !self.kill_requested(run_id) {
                    RunState::Pending
                } else {
                    RunState::Failed
                };
                self.apply(node_id, run_id, next, |run| {
                    run.failure_reason = Some(reason)
                })
            }
            ControlMessage::Challenge { .. }
            | ControlMessage::Hello { .. }
            | ControlMessage::Assign(_)
            | ControlMessage::Kill { .. }
            | ControlMessage::Error { .. } => Err(Rejection::Unexpected),
        };
        if let Err(rejection) = &result {
            warn!(node_id = %node_id, rejection = ?rejection, "rejected node message");
        }
        result
    }

    fn kill_requested(&self, run_id: RunId) -> bool {
        self.runs.get(&run_id).map_or(false, |run| run.kill_requested)
    }

    fn apply(
        &mut self,
        node_id: NodeId,
        run_id: RunId,
        next: RunState,
        update: impl FnOnce(&mut Run),
    ) -> Result<(), Rejection> {
        let run = self.runs.get_mut(&run_id).ok_or(Rejection::UnknownRun)?;
        if run.node_id != node_id {
            return Err(Rejection::NotOwner);
        }
        // nodes only report on runs they hold
        if !matches!(run.state, RunState::Assigned | RunState::Running) {
            return Err(Rejection::InvalidTransition(run.state));
        }
        run.transition(next)
            .map_err(|e| Rejection::InvalidTransition(e.from))?;
        update(run);
        info!(run_id = %run_id, node_id = %node_id, state = %next, "run updated");

        let task_id = run.task_id;
        if next != RunState::Running {
            if let Some(session) = self.sessions.get_mut(node_id) {
                session.outstanding.remove(&run_id);
            }
        }
        if next == RunState::Pending {
            self.pending.push_back(run_id);
        }
        self.emit(Event::TaskUpdated(task_id));
        Ok(())
    }
}
