//! Tasks, runs and their externally visible status.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use derive_more::Display;
use displaydoc::Display as DocDisplay;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{CollaborationId, NodeId, RunId, TaskId};

/// The failure reason of runs killed on behalf of a user.
pub const KILLED_BY_USER: &str = "killed_by:user";
/// The failure reason of runs whose task went stale while they were still pending.
pub const TIMED_OUT: &str = "timed_out";

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// The state of a run.
///
/// ```text
/// PENDING ──▶ ASSIGNED ──▶ RUNNING ──▶ COMPLETED
///    ▲  │        │ │          │ │
///    │  │        │ └──────────┼─┴──▶ FAILED
///    │  └────────┼────────────┼──────▶ FAILED   (user kill, staleness timeout)
///    └───────────┴────────────┘                 (disconnect, retriable failure)
/// ```
pub enum RunState {
    #[display(fmt = "PENDING")]
    Pending,
    #[display(fmt = "ASSIGNED")]
    Assigned,
    #[display(fmt = "RUNNING")]
    Running,
    #[display(fmt = "COMPLETED")]
    Completed,
    #[display(fmt = "FAILED")]
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Failed)
                | (Assigned, Running)
                | (Assigned, Failed)
                | (Assigned, Pending)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
        )
    }
}

#[derive(Debug, DocDisplay, Error, PartialEq, Eq)]
/// invalid transition from {from} to {to}
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

#[derive(Debug, Clone)]
/// The input of a task, one ciphertext per target node in the end.
pub enum TaskInput {
    /// The same plaintext for every target. It is sealed for each node on submission and
    /// dropped right after.
    Plaintext(Vec<u8>),
    /// Inputs already sealed by the submitter, keyed by target node.
    Sealed(HashMap<NodeId, Vec<u8>>),
}

#[derive(Debug, Clone)]
/// A task as submitted through the task API.
pub struct TaskSpec {
    pub collaboration_id: CollaborationId,
    /// The algorithm image every target runs.
    pub image: String,
    /// The node results are sealed for. It must be a member of the collaboration.
    pub initiator: NodeId,
    pub input: TaskInput,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub collaboration_id: CollaborationId,
    pub image: String,
    pub initiator: NodeId,
    pub created_at: DateTime<Utc>,
    /// The runs of the task, in the order of the submitted targets.
    pub runs: Vec<RunId>,
}

#[derive(Debug, Clone)]
/// The execution of a task on one node.
pub struct Run {
    pub id: RunId,
    pub task_id: TaskId,
    pub node_id: NodeId,
    /// The input sealed for `node_id`.
    pub encrypted_input: Vec<u8>,
    pub state: RunState,
    /// The result sealed for the task initiator.
    pub encrypted_result: Option<Vec<u8>>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// How many times the run has been assigned.
    pub attempts: u32,
    /// Every state the run went through, starting with `PENDING`.
    pub history: Vec<RunState>,
    /// Set once a user asked for the run to be killed. A killed run never goes back to pending.
    pub kill_requested: bool,
}

impl Run {
    pub fn new(task_id: TaskId, node_id: NodeId, encrypted_input: Vec<u8>) -> Self {
        Self {
            id: RunId::new(),
            task_id,
            node_id,
            encrypted_input,
            state: RunState::Pending,
            encrypted_result: None,
            assigned_at: None,
            started_at: None,
            finished_at: None,
            failure_reason: None,
            attempts: 0,
            history: vec![RunState::Pending],
            kill_requested: false,
        }
    }

    /// Moves the run to `next`, recording the timestamps of the new state.
    ///
    /// # Errors
    /// Fails without touching the run when the state machine has no such edge.
    pub fn transition(&mut self, next: RunState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            RunState::Pending => {
                self.assigned_at = None;
                self.started_at = None;
            }
            RunState::Assigned => {
                self.attempts += 1;
                self.assigned_at = Some(now);
            }
            RunState::Running => self.started_at = Some(now),
            RunState::Completed | RunState::Failed => self.finished_at = Some(now),
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The aggregate state of a task, derived from its runs.
pub enum TaskState {
    /// No run has been assigned yet.
    #[display(fmt = "PENDING")]
    Pending,
    /// Some runs are not terminal yet.
    #[display(fmt = "ACTIVE")]
    Active,
    /// Every run is terminal and at least one of them completed.
    #[display(fmt = "COMPLETED")]
    Completed,
    /// Every run failed.
    #[display(fmt = "FAILED")]
    Failed,
}

impl TaskState {
    pub fn from_runs<'a>(states: impl IntoIterator<Item = &'a RunState>) -> Self {
        let (mut pending, mut terminal, mut completed, mut total) = (0, 0, 0, 0);
        for state in states {
            total += 1;
            match state {
                RunState::Pending => pending += 1,
                RunState::Completed => {
                    terminal += 1;
                    completed += 1;
                }
                RunState::Failed => terminal += 1,
                RunState::Assigned | RunState::Running => {}
            }
        }
        if terminal == total {
            if completed > 0 {
                TaskState::Completed
            } else {
                TaskState::Failed
            }
        } else if pending == total {
            TaskState::Pending
        } else {
            TaskState::Active
        }
    }

    /// Whether the task reached a terminal state. Results can be collected from then on.
    pub fn is_ready(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub state: RunState,
    pub attempts: u32,
    pub failure_reason: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Run> for RunStatus {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id,
            node_id: run.node_id,
            state: run.state,
            attempts: run.attempts,
            failure_reason: run.failure_reason.clone(),
            assigned_at: run.assigned_at,
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The status of a task, with a breakdown per run.
pub struct TaskStatus {
    pub task_id: TaskId,
    pub collaboration_id: CollaborationId,
    pub image: String,
    pub initiator: NodeId,
    pub created_at: DateTime<Utc>,
    pub state: TaskState,
    pub runs: Vec<RunStatus>,
}

impl TaskStatus {
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Whether the task completed on some nodes but failed on others.
    pub fn is_partial(&self) -> bool {
        self.state == TaskState::Completed
            && self.runs.iter().any(|run| run.state == RunState::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunState::*;

    #[test]
    fn test_run_transitions() {
        let mut run = Run::new(TaskId::new(), NodeId::from(1), vec![]);
        assert_eq!(
            run.transition(Running),
            Err(InvalidTransition {
                from: Pending,
                to: Running
            })
        );
        run.transition(Assigned).unwrap();
        run.transition(Pending).unwrap();
        run.transition(Assigned).unwrap();
        run.transition(Running).unwrap();
        assert!(run.transition(Assigned).is_err());
        run.transition(Completed).unwrap();
        assert!(run.transition(Failed).is_err());
        assert!(run.transition(Pending).is_err());

        assert_eq!(run.attempts, 2);
        assert_eq!(
            run.history,
            vec![Pending, Assigned, Pending, Assigned, Running, Completed]
        );
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_task_state() {
        assert_eq!(TaskState::from_runs(&[Pending, Pending]), TaskState::Pending);
        assert_eq!(TaskState::from_runs(&[Pending, Assigned]), TaskState::Active);
        assert_eq!(TaskState::from_runs(&[Completed, Pending]), TaskState::Active);
        assert_eq!(TaskState::from_runs(&[Completed, Failed]), TaskState::Completed);
        assert_eq!(TaskState::from_runs(&[Failed, Failed]), TaskState::Failed);
        assert!(!TaskState::Active.is_ready());
        assert!(TaskState::Failed.is_ready());
    }

    #[test]
    fn test_display() {
        assert_eq!(Pending.to_string(), "PENDING");
        assert_eq!(TaskState::Active.to_string(), "ACTIVE");
    }
}
