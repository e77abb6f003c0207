//! The node side of the control channel.

use std::{future::Future, io, pin::Pin, time::Duration};

use displaydoc::Display;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc, time::sleep};

use super::executor::Executor;
use crate::{
    common::{CollaborationId, NodeId},
    crypto::SigningKeyPair,
    protocol::{framed, hello_payload, ControlMessage, Transport},
    settings::ChannelSettings,
};

#[derive(Debug, Display, Error)]
/// Why the control channel was lost.
pub enum ClientError {
    /// control channel error: {0}
    Io(#[from] io::Error),
    /// the coordinator closed the connection
    Closed,
    /// the coordinator refused the connection: {0}
    Rejected(String),
    /// unexpected message: {0}
    Unexpected(&'static str),
}

/// How serving a connection ended.
enum Served {
    Shutdown,
    Lost(ClientError),
}

/// Keeps the node connected to the coordinator and feeds the executor.
pub struct NodeClient {
    settings: ChannelSettings,
    node_id: NodeId,
    signing: SigningKeyPair,
    collaborations: Vec<CollaborationId>,
    executor: Executor,
}

impl NodeClient {
    pub fn new(
        settings: ChannelSettings,
        node_id: NodeId,
        signing: SigningKeyPair,
        collaborations: Vec<CollaborationId>,
        executor: Executor,
    ) -> Self {
        Self {
            settings,
            node_id,
            signing,
            collaborations,
            executor,
        }
    }

    /// Serves the control channel until `shutdown` resolves.
    ///
    /// A lost connection is reestablished with an exponential backoff. On shutdown, all jobs are
    /// killed and their failures reported before the connection is closed.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut backoff = self.settings.initial_backoff();
        loop {
            let connected = tokio::select! {
                _ = &mut shutdown => break,
                connected = self.connect() => connected,
            };
            match connected {
                Ok(transport) => {
                    info!(address = %self.settings.address, "connected to the coordinator");
                    backoff = self.settings.initial_backoff();
                    match self.serve(transport, shutdown.as_mut()).await {
                        Served::Shutdown => return,
                        Served::Lost(ClientError::Rejected(reason)) => {
                            error!(reason = %reason, "the coordinator refused this node")
                        }
                        Served::Lost(error) => warn!(error = %error, "control channel lost"),
                    }
                }
                Err(error) => warn!(error = %error, "failed to connect to the coordinator"),
            }

            info!(delay = ?backoff, "reconnecting");
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, self.settings.max_backoff());
        }
        self.executor.shutdown().await;
    }

    /// Opens a connection and answers the coordinator's challenge.
    async fn connect(&self) -> Result<Transport<TcpStream>, ClientError> {
        let stream = TcpStream::connect(&self.settings.address).await?;
        let mut transport = framed(stream, self.settings.max_message_size);
        let nonce = match transport.next().await {
            Some(Ok(ControlMessage::Challenge { nonce })) => nonce,
            Some(Ok(ControlMessage::Error { reason })) => return Err(ClientError::Rejected(reason)),
            Some(Ok(_)) => return Err(ClientError::Unexpected("expected CHALLENGE")),
            Some(Err(error)) => return Err(error.into()),
            None => return Err(ClientError::Closed),
        };
        let signature = self
            .signing
            .secret
            .sign_detached(&hello_payload(&nonce, self.node_id));
        transport
            .send(ControlMessage::Hello {
                node_id: self.node_id,
                collaborations: self.collaborations.clone(),
                signature,
            })
            .await?;
        Ok(transport)
    }

    async fn serve<F>(
        &mut self,
        transport: Transport<TcpStream>,
        mut shutdown: Pin<&mut F>,
    ) -> Served
    where
        F: Future<Output = ()>,
    {
        let (mut sink, mut stream) = transport.split();
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel();
        self.executor.attach(outbox);

        let error = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.executor.shutdown().await;
                    // the kill reports of the shutdown
                    while let Ok(message) = outbox_rx.try_recv() {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.close().await;
                    return Served::Shutdown;
                }
                Some(message) = outbox_rx.recv() => {
                    if let Err(error) = sink.send(message).await {
                        break error.into();
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(ControlMessage::Error { reason })) => break ClientError::Rejected(reason),
                    Some(Ok(message)) => {
                        trace!(run_id = ?message.run_id(), "coordinator message");
                        self.executor.on_message(message);
                    }
                    Some(Err(error)) => break error.into(),
                    None => break ClientError::Closed,
                },
            }
        };
        self.executor.detach().await;
        Served::Lost(error)
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_backoff() {
        let max = Duration::from_secs(4);
        assert_eq!(next_backoff(Duration::from_secs(1), max), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(3), max), max);
        assert_eq!(next_backoff(max, max), max);
    }
}
