use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::{
    common::{CollaborationId, NodeId, RunId},
    protocol::ControlMessage,
};

/// The sending half of a node connection.
pub type Outbound = mpsc::UnboundedSender<ControlMessage>;

#[derive(Debug)]
/// An authenticated connection of a node.
pub struct Session {
    pub node_id: NodeId,
    /// Distinguishes successive sessions of the same node, so that the teardown of a replaced
    /// connection cannot destroy the session that replaced it.
    pub generation: u64,
    pub collaborations: BTreeSet<CollaborationId>,
    pub last_seen: DateTime<Utc>,
    /// Runs assigned to the node and not terminal yet.
    pub outstanding: HashSet<RunId>,
    outbound: Outbound,
}

impl Session {
    /// Queues a message on the connection. Returns `false` if the connection is gone.
    pub fn send(&self, message: ControlMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct Sessions {
    sessions: HashMap<NodeId, Session>,
    next_generation: u64,
}

impl Sessions {
    /// Registers a new session for `node_id` and returns its generation along with the session
    /// it replaced, if any.
    pub fn open(
        &mut self,
        node_id: NodeId,
        collaborations: BTreeSet<CollaborationId>,
        outbound: Outbound,
    ) -> (u64, Option<Session>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let session = Session {
            node_id,
            generation,
            collaborations,
            last_seen: Utc::now(),
            outstanding: HashSet::new(),
            outbound,
        };
        (generation, self.sessions.insert(node_id, session))
    }

    /// Removes the session of `node_id`, provided it is still the given generation.
    pub fn close(&mut self, node_id: NodeId, generation: u64) -> Option<Session> {
        match self.sessions.get(&node_id) {
            Some(session) if session.generation == generation => self.sessions.remove(&node_id),
            _ => None,
        }
    }

    pub fn get(&self, node_id: NodeId) -> Option<&Session> {
        self.sessions.get(&node_id)
    }

    /// The session of `node_id` if it is still the given generation.
    pub fn current_mut(&mut self, node_id: NodeId, generation: u64) -> Option<&mut Session> {
        self.sessions
            .get_mut(&node_id)
            .filter(|session| session.generation == generation)
    }

    pub fn get_mut(&mut self, node_id: NodeId) -> Option<&mut Session> {
        self.sessions.get_mut(&node_id)
    }

    /// The number of connected nodes.
    pub fn connected(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_close_is_ignored() {
        let mut sessions = Sessions::default();
        let node = NodeId::from(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (first, replaced) = sessions.open(node, BTreeSet::new(), tx.clone());
        assert!(replaced.is_none());
        let (second, replaced) = sessions.open(node, BTreeSet::new(), tx);
        assert_eq!(replaced.map(|s| s.generation), Some(first));

        assert!(sessions.close(node, first).is_none());
        assert!(sessions.get(node).is_some());
        assert!(sessions.current_mut(node, first).is_none());
        assert!(sessions.close(node, second).is_some());
        assert_eq!(sessions.connected(), 0);
    }

    #[test]
    fn test_send_fails_once_the_connection_is_gone() {
        let mut sessions = Sessions::default();
        let (tx, rx) = mpsc::unbounded_channel();
        sessions.open(NodeId::from(1), BTreeSet::new(), tx);
        let session = sessions.get(NodeId::from(1)).unwrap();
        assert!(session.send(ControlMessage::Kill { run_id: RunId::new() }));
        drop(rx);
        assert!(!session.send(ControlMessage::Kill { run_id: RunId::new() }));
    }
}
