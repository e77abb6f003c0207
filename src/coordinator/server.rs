//! The control channel server.
//!
//! Every accepted connection is served by its own task. The task runs the handshake, then pumps
//! the node's reports into the [`CoordinatorService`] and the messages queued for the node onto
//! the socket, until either side goes away.
//!
//! [`CoordinatorService`]: crate::coordinator::CoordinatorService

use std::{io, time::Duration};

use displaydoc::Display;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tracing::{error_span, Instrument};

use super::{
    directory::HandshakeError,
    handle::CoordinatorHandle,
    requests::{ConnectRequest, DisconnectRequest, NodeMessage, ServiceShutdown},
};
use crate::{
    common::NodeId,
    protocol::{framed, ControlMessage, Transport, NONCE_LENGTH},
    settings::ApiSettings,
};

#[derive(Debug, Display, Error)]
/// Why a connection was closed.
pub enum ConnectionError {
    /// control channel error: {0}
    Io(#[from] io::Error),
    /// the node did not answer the challenge in time
    HandshakeTimeout,
    /// the node closed the connection
    Closed,
    /// unexpected message: {0}
    Unexpected(&'static str),
    /// authentication failed: {0}
    Authentication(#[from] HandshakeError),
    /// {0}
    Shutdown(#[from] ServiceShutdown),
}

/// Accepts node connections on `listener` and serves each of them on its own task.
///
/// # Errors
/// Fails if accepting connections fails.
pub async fn serve(
    listener: TcpListener,
    handle: CoordinatorHandle,
    settings: ApiSettings,
) -> io::Result<()> {
    info!(address = %listener.local_addr()?, "control channel listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let handle = handle.clone();
        let settings = settings.clone();
        tokio::spawn(
            async move {
                if let Err(error) = serve_connection(stream, handle, &settings).await {
                    info!(error = %error, "connection closed");
                }
            }
            .instrument(error_span!("connection", peer = %peer)),
        );
    }
}

async fn serve_connection(
    stream: TcpStream,
    handle: CoordinatorHandle,
    settings: &ApiSettings,
) -> Result<(), ConnectionError> {
    let mut transport = framed(stream, settings.max_message_size);
    let (node_id, generation, outbound_rx) =
        match handshake(&mut transport, &handle, settings.handshake_timeout()).await {
            Ok(session) => session,
            Err(error) => {
                let reason = error.to_string();
                let _ = transport.send(ControlMessage::Error { reason }).await;
                return Err(error);
            }
        };

    let span = error_span!("session", node_id = %node_id, generation);
    let result = pump(transport, &handle, node_id, generation, outbound_rx)
        .instrument(span)
        .await;
    let _ = handle.disconnect(DisconnectRequest {
        node_id,
        generation,
    });
    result
}

async fn handshake(
    transport: &mut Transport<TcpStream>,
    handle: &CoordinatorHandle,
    limit: Duration,
) -> Result<(NodeId, u64, mpsc::UnboundedReceiver<ControlMessage>), ConnectionError> {
    let mut nonce = vec![0_u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);
    transport
        .send(ControlMessage::Challenge {
            nonce: nonce.clone(),
        })
        .await?;

    let hello = timeout(limit, transport.next())
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)?
        .ok_or(ConnectionError::Closed)??;
    let (node_id, collaborations, signature) = match hello {
        ControlMessage::Hello {
            node_id,
            collaborations,
            signature,
        } => (node_id, collaborations, signature),
        _ => return Err(ConnectionError::Unexpected("expected HELLO")),
    };

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let generation = handle
        .connect(ConnectRequest {
            node_id,
            collaborations,
            nonce,
            signature,
            outbound,
        })
        .await??;
    Ok((node_id, generation, outbound_rx))
}

/// Forwards messages both ways until the node disconnects or its session is replaced.
async fn pump(
    transport: Transport<TcpStream>,
    handle: &CoordinatorHandle,
    node_id: NodeId,
    generation: u64,
    mut outbound_rx: mpsc::UnboundedReceiver<ControlMessage>,
) -> Result<(), ConnectionError> {
    let (mut sink, mut stream) = transport.split();
    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(message) => sink.send(message).await?,
                // the session was replaced or the service stopped
                None => {
                    debug!("session superseded, closing connection");
                    return Ok(());
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(message @ ControlMessage::RunStarted { .. }))
                | Some(Ok(message @ ControlMessage::RunCompleted { .. }))
                | Some(Ok(message @ ControlMessage::RunFailed { .. })) => {
                    trace!(run_id = ?message.run_id(), "node report");
                    handle.node_message(NodeMessage {
                        node_id,
                        generation,
                        message,
                    })?;
                }
                Some(Ok(_)) => {
                    let error = ConnectionError::Unexpected("only run reports are accepted");
                    let _ = sink.send(ControlMessage::Error { reason: error.to_string() }).await;
                    return Err(error);
                }
                Some(Err(error)) => return Err(error.into()),
                None => return Err(ConnectionError::Closed),
            },
        }
    }
}
