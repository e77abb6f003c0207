use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display, Serialize, Deserialize)]
/// A unique random task identifier
pub struct TaskId(Uuid);

impl TaskId {
    /// Return a new random task identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display, Serialize, Deserialize)]
/// A unique random run identifier
pub struct RunId(Uuid);

impl RunId {
    /// Return a new random run identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Copy,
    Clone,
    Display,
    From,
    Into,
    Serialize,
    Deserialize,
)]
/// The identifier of a node, assigned by the administrative layer when the organization joins.
pub struct NodeId(u64);

#[derive(
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Copy,
    Clone,
    Display,
    From,
    Into,
    Serialize,
    Deserialize,
)]
/// The identifier of a collaboration, the trust and encryption boundary of a task.
pub struct CollaborationId(u64);
