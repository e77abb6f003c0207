//! The coordinator: tracks tasks and their runs, dispatches sealed inputs to the nodes over the
//! control channel and collects their sealed results.
//!
//! The state lives in a single [`CoordinatorService`] task. Everything else talks to it through
//! a [`CoordinatorHandle`]:
//!
//! - the task API ([`CoordinatorHandle::create_task`], [`CoordinatorHandle::task_status`],
//!   [`CoordinatorHandle::result`], [`CoordinatorHandle::kill_run`],
//!   [`CoordinatorHandle::subscribe`]),
//! - the control channel [`server`], which authenticates nodes and relays their reports.
//!
//! The coordinator never sees a plaintext input or result: plaintext inputs are sealed for each
//! target node right when the task is created, and only ciphertext is stored.

mod directory;
mod handle;
pub mod models;
mod requests;
mod scheduler;
pub mod server;
mod service;
mod sessions;

#[cfg(test)]
mod tests;

pub use self::{
    directory::{HandshakeError, MemberRecord, NodeDirectory},
    handle::CoordinatorHandle,
    models::{RunState, RunStatus, TaskInput, TaskSpec, TaskState, TaskStatus},
    requests::{
        InvalidTargetError,
        KillError,
        ResultError,
        ServiceShutdown,
        SubmitError,
        TaskError,
    },
    scheduler::{Event, Rejection, Scheduler},
    service::CoordinatorService,
};
