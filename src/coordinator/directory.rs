use std::collections::{BTreeSet, HashMap};

use displaydoc::Display;
use thiserror::Error;

use crate::{
    common::{CollaborationId, NodeId},
    crypto::{PublicSigningKey, Signature},
    protocol::hello_payload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What the coordinator knows about a member node.
pub struct MemberRecord {
    /// The key the node signs handshake challenges with.
    pub signing_key: PublicSigningKey,
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
/// A node failed to authenticate.
pub enum HandshakeError {
    /// unknown node {0}
    UnknownNode(NodeId),
    /// invalid handshake signature for node {0}
    InvalidSignature(NodeId),
    /// node {node} is not a member of collaboration {collaboration}
    NotAMember {
        node: NodeId,
        collaboration: CollaborationId,
    },
}

#[derive(Debug, Default, Clone)]
/// The collaborations and their member nodes.
pub struct NodeDirectory {
    members: HashMap<CollaborationId, HashMap<NodeId, MemberRecord>>,
}

impl NodeDirectory {
    pub fn insert(&mut self, collaboration: CollaborationId, node: NodeId, record: MemberRecord) {
        self.members
            .entry(collaboration)
            .or_default()
            .insert(node, record);
    }

    pub fn is_member(&self, collaboration: CollaborationId, node: NodeId) -> bool {
        self.members
            .get(&collaboration)
            .map_or(false, |members| members.contains_key(&node))
    }

    /// The signing key of `node`, if it is a member of any collaboration.
    pub fn signing_key(&self, node: NodeId) -> Option<PublicSigningKey> {
        self.members
            .values()
            .find_map(|members| members.get(&node))
            .map(|record| record.signing_key)
    }

    /// The collaborations `node` is a member of.
    pub fn collaborations_of(&self, node: NodeId) -> BTreeSet<CollaborationId> {
        self.members
            .iter()
            .filter(|(_, members)| members.contains_key(&node))
            .map(|(collaboration, _)| *collaboration)
            .collect()
    }

    /// Checks a handshake answer.
    ///
    /// The signature must be made with the node's registered key over the challenge nonce and
    /// the node identifier, and every claimed collaboration must list the node as a member.
    ///
    /// # Errors
    /// Fails with the first check that did not pass.
    pub fn authenticate(
        &self,
        node: NodeId,
        claimed: &[CollaborationId],
        nonce: &[u8],
        signature: &Signature,
    ) -> Result<BTreeSet<CollaborationId>, HandshakeError> {
        let key = self
            .signing_key(node)
            .ok_or(HandshakeError::UnknownNode(node))?;
        if !key.verify_detached(signature, &hello_payload(nonce, node)) {
            return Err(HandshakeError::InvalidSignature(node));
        }
        if let Some(collaboration) = claimed.iter().find(|c| !self.is_member(**c, node)) {
            return Err(HandshakeError::NotAMember {
                node,
                collaboration: *collaboration,
            });
        }
        Ok(claimed.iter().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeyPair;

    #[test]
    fn test_authenticate() {
        let keys = SigningKeyPair::generate();
        let node = NodeId::from(10);
        let collaboration = CollaborationId::from(1);
        let mut directory = NodeDirectory::default();
        directory.insert(
            collaboration,
            node,
            MemberRecord {
                signing_key: keys.public,
            },
        );

        let nonce = [3_u8; 32];
        let signature = keys.secret.sign_detached(&hello_payload(&nonce, node));
        assert_eq!(
            directory.authenticate(node, &[collaboration], &nonce, &signature),
            Ok(vec![collaboration].into_iter().collect())
        );
        assert_eq!(
            directory.authenticate(node, &[], &nonce, &signature),
            Ok(BTreeSet::new())
        );

        // replayed signature over another nonce
        assert_eq!(
            directory.authenticate(node, &[collaboration], &[4_u8; 32], &signature),
            Err(HandshakeError::InvalidSignature(node))
        );
        assert_eq!(
            directory.authenticate(NodeId::from(11), &[collaboration], &nonce, &signature),
            Err(HandshakeError::UnknownNode(NodeId::from(11)))
        );
        assert_eq!(
            directory.authenticate(node, &[CollaborationId::from(2)], &nonce, &signature),
            Err(HandshakeError::NotAMember {
                node,
                collaboration: CollaborationId::from(2)
            })
        );
    }

    #[test]
    fn test_collaborations_of() {
        let keys = SigningKeyPair::generate();
        let record = MemberRecord {
            signing_key: keys.public,
        };
        let mut directory = NodeDirectory::default();
        directory.insert(CollaborationId::from(1), NodeId::from(10), record);
        directory.insert(CollaborationId::from(2), NodeId::from(10), record);
        directory.insert(CollaborationId::from(2), NodeId::from(11), record);

        assert_eq!(
            directory.collaborations_of(NodeId::from(10)),
            vec![CollaborationId::from(1), CollaborationId::from(2)]
                .into_iter()
                .collect()
        );
        assert!(directory.collaborations_of(NodeId::from(12)).is_empty());
        assert_eq!(directory.signing_key(NodeId::from(11)), Some(keys.public));
    }
}
