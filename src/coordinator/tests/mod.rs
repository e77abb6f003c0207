
use std::{collections::BTreeSet, sync::Arc};

use tokio::sync::mpsc;

use super::{Event, MemberRecord, NodeDirectory, Scheduler, TaskInput, TaskSpec};
use crate::{
    common::{CollaborationId, NodeId},
    crypto::{EncryptKeyPair, Keyring, SecureEnvelope, SigningKeyPair, StaticKeyRegistry},
    protocol::{hello_payload, Assignment, ControlMessage, NONCE_LENGTH},
};

pub const COLLABORATION: u64 = 1;

/// A member node, with all its keys.
pub struct Member {
    pub node_id: NodeId,
    pub signing: SigningKeyPair,
    pub encrypt: EncryptKeyPair,
}

impl Member {
    pub fn new(id: u64) -> Self {
        Self {
            node_id: NodeId::from(id),
            signing: SigningKeyPair::generate(),
            encrypt: EncryptKeyPair::generate(),
        }
    }

    /// The envelope of the node process, able to open what is sealed for this member.
    pub fn envelope(&self, registry: &StaticKeyRegistry) -> SecureEnvelope {
        let mut keyring = Keyring::new(self.node_id);
        keyring.insert(collaboration(), self.encrypt.clone());
        SecureEnvelope::new(Arc::new(registry.clone())).with_keyring(keyring)
    }

    pub fn hello(&self, nonce: &[u8]) -> ControlMessage {
        ControlMessage::Hello {
            node_id: self.node_id,
            collaborations: vec![collaboration()],
            signature: self
                .signing
                .secret
                .sign_detached(&hello_payload(nonce, self.node_id)),
        }
    }
}

pub fn collaboration() -> CollaborationId {
    CollaborationId::from(COLLABORATION)
}

/// A single collaboration with the given members.
pub struct Fixture {
    pub members: Vec<Member>,
    pub directory: NodeDirectory,
    pub registry: StaticKeyRegistry,
}

impl Fixture {
    pub fn new(ids: &[u64]) -> Self {
        let members: Vec<Member> = ids.iter().copied().map(Member::new).collect();
        let mut directory = NodeDirectory::default();
        let mut registry = StaticKeyRegistry::default();
        for member in &members {
            directory.insert(
                collaboration(),
                member.node_id,
                MemberRecord {
                    signing_key: member.signing.public,
                },
            );
            registry.insert(collaboration(), member.node_id, member.encrypt.public);
        }
        Self {
            members,
            directory,
            registry,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.directory.clone(),
            SecureEnvelope::new(Arc::new(self.registry.clone())),
            None,
        )
    }

    pub fn node(&self, index: usize) -> NodeId {
        self.members[index].node_id
    }

    /// A task on every member, initiated by the first one.
    pub fn spec(&self, input: &[u8]) -> TaskSpec {
        TaskSpec {
            collaboration_id: collaboration(),
            image: "registry.local/count:1".into(),
            initiator: self.node(0),
            input: TaskInput::Plaintext(input.to_vec()),
        }
    }

    pub fn targets(&self) -> Vec<NodeId> {
        self.members.iter().map(|member| member.node_id).collect()
    }

    /// Runs the handshake of a member against the scheduler.
    pub fn connect(
        &self,
        scheduler: &mut Scheduler,
        index: usize,
    ) -> (u64, mpsc::UnboundedReceiver<ControlMessage>) {
        let member = &self.members[index];
        let nonce = [index as u8; NONCE_LENGTH];
        let signature = member
            .signing
            .secret
            .sign_detached(&hello_payload(&nonce, member.node_id));
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = scheduler
            .connect(member.node_id, &[collaboration()], &nonce, &signature, tx)
            .unwrap();
        (generation, rx)
    }
}

/// Drains the scheduler events and returns the assignments it sent, per node.
pub fn assignments(scheduler: &mut Scheduler) -> Vec<(NodeId, Assignment)> {
    let mut sent = Vec::new();
    while let Some(event) = scheduler.next_event() {
        if let Event::Send {
            node_id,
            message: ControlMessage::Assign(assignment),
        } = event
        {
            sent.push((node_id, assignment));
        }
    }
    sent
}

/// Drains the scheduler events and returns the messages it sent, per node.
pub fn sent(scheduler: &mut Scheduler) -> Vec<(NodeId, ControlMessage)> {
    let mut sent = Vec::new();
    while let Some(event) = scheduler.next_event() {
        if let Event::Send { node_id, message } = event {
            sent.push((node_id, message));
        }
    }
    sent
}

pub fn memberships() -> BTreeSet<CollaborationId> {
    vec![collaboration()].into_iter().collect()
}
