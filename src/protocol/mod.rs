//! The control channel between the coordinator and the nodes.
//!
//! Every connection carries a stream of [`ControlMessage`]s in both directions, encoded as
//! length-delimited `bincode` frames (see [`framed`]).
//!
//! # Handshake
//!
//! 1. coordinator → node: [`ControlMessage::Challenge`] with a random nonce,
//! 2. node → coordinator: [`ControlMessage::Hello`] with the node identifier, the collaborations
//!    it takes part in and an `Ed25519` signature over [`hello_payload`],
//! 3. the coordinator either registers a node session, or answers with
//!    [`ControlMessage::Error`] and closes the connection.
//!
//! After the handshake the coordinator pushes [`ControlMessage::Assign`] and
//! [`ControlMessage::Kill`], and the node reports with [`ControlMessage::RunStarted`],
//! [`ControlMessage::RunCompleted`] and [`ControlMessage::RunFailed`]. For a given run, the
//! node always sends `RunStarted` before `RunCompleted`. A run that fails before its container
//! is up is reported with `RunFailed` alone.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serde::formats::SymmetricalBincode;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{
    common::{CollaborationId, NodeId, RunId, TaskId},
    crypto::Signature,
};

/// Length of the handshake nonce, in bytes.
pub const NONCE_LENGTH: usize = 32;

/// A run handed to a node for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub collaboration_id: CollaborationId,
    /// The run input, sealed for the receiving node.
    pub encrypted_input: Vec<u8>,
    /// The algorithm image to run.
    pub image: String,
    /// The node that submitted the task. Results are sealed for this node.
    pub initiator: NodeId,
}

/// A message exchanged over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Challenge {
        nonce: Vec<u8>,
    },
    Hello {
        node_id: NodeId,
        collaborations: Vec<CollaborationId>,
        signature: Signature,
    },
    Assign(Assignment),
    RunStarted {
        run_id: RunId,
    },
    RunCompleted {
        run_id: RunId,
        /// The result, sealed for the task initiator.
        encrypted_output: Vec<u8>,
    },
    RunFailed {
        run_id: RunId,
        reason: String,
        retriable: bool,
    },
    Kill {
        run_id: RunId,
    },
    /// Sent by the coordinator right before it closes a connection it refuses to serve.
    Error {
        reason: String,
    },
}

impl ControlMessage {
    /// The run this message is about, if any.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            ControlMessage::Assign(assignment) => Some(assignment.run_id),
            ControlMessage::RunStarted { run_id }
            | ControlMessage::RunCompleted { run_id, .. }
            | ControlMessage::RunFailed { run_id, .. }
            | ControlMessage::Kill { run_id } => Some(*run_id),
            ControlMessage::Challenge { .. }
            | ControlMessage::Hello { .. }
            | ControlMessage::Error { .. } => None,
        }
    }
}

/// The bytes a node signs to answer a handshake challenge.
pub fn hello_payload(nonce: &[u8], node_id: NodeId) -> Vec<u8> {
    let mut payload = Vec::with_capacity(nonce.len() + 8);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&u64::from(node_id).to_le_bytes());
    payload
}

/// A framed control channel over `T`.
pub type Transport<T> = tokio_serde::SymmetricallyFramed<
    Framed<T, LengthDelimitedCodec>,
    ControlMessage,
    SymmetricalBincode<ControlMessage>,
>;

/// Wraps a byte stream into a control channel. Frames longer than `max_frame_length` are
/// rejected.
pub fn framed<T>(io: T, max_frame_length: usize) -> Transport<T>
where
    T: AsyncRead + AsyncWrite,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec();
    tokio_serde::SymmetricallyFramed::new(
        Framed::new(io, codec),
        SymmetricalBincode::<ControlMessage>::default(),
    )
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};

    use super::*;
    use crate::crypto::SigningKeyPair;

    #[tokio::test]
    async fn test_messages_cross_the_channel() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut a = framed(a, 1024 * 1024);
        let mut b = framed(b, 1024 * 1024);

        let keys = SigningKeyPair::generate();
        let node_id = NodeId::from(3);
        let nonce = vec![7_u8; NONCE_LENGTH];
        let hello = ControlMessage::Hello {
            node_id,
            collaborations: vec![CollaborationId::from(1)],
            signature: keys.secret.sign_detached(&hello_payload(&nonce, node_id)),
        };
        let assign = ControlMessage::Assign(Assignment {
            run_id: RunId::new(),
            task_id: TaskId::new(),
            collaboration_id: CollaborationId::from(1),
            encrypted_input: vec![1, 2, 3],
            image: "registry.local/algorithm:1".into(),
            initiator: NodeId::from(4),
        });

        a.send(hello.clone()).await.unwrap();
        a.send(assign.clone()).await.unwrap();
        assert_eq!(b.next().await.unwrap().unwrap(), hello);
        assert_eq!(b.next().await.unwrap().unwrap(), assign);

        if let ControlMessage::Hello { signature, .. } = hello {
            assert!(keys
                .public
                .verify_detached(&signature, &hello_payload(&nonce, node_id)));
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut a = framed(a, 1024 * 1024);
        let mut b = framed(b, 64);

        a.send(ControlMessage::RunCompleted {
            run_id: RunId::new(),
            encrypted_output: vec![0; 1024],
        })
        .await
        .unwrap();
        assert!(b.next().await.unwrap().is_err());
    }

    #[test]
    fn test_run_id() {
        let run_id = RunId::new();
        assert_eq!(ControlMessage::Kill { run_id }.run_id(), Some(run_id));
        assert_eq!(
            ControlMessage::Error {
                reason: "nope".into()
            }
            .run_id(),
            None
        );
    }
}
