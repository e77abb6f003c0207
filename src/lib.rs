//! `federa` distributes analysis tasks to the nodes of a collaboration and runs them there in
//! sandboxed containers, without the coordinator ever seeing an input or a result in the clear.
//!
//! - [`coordinator`]: the scheduler of tasks and runs, and the control channel server,
//! - [`node`]: the node agent, executing runs in containers,
//! - [`crypto`]: the secure envelope sealing inputs and results, and the key material,
//! - [`protocol`]: the messages exchanged over the control channel,
//! - [`settings`]: the configuration of both binaries.

#[macro_use]
extern crate tracing;

pub mod common;
pub mod coordinator;
pub mod crypto;
pub mod node;
pub mod protocol;
pub mod settings;
