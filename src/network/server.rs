//! Coordination Server
//!
//! TCP server accepting probe and election traffic from other nodes.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use super::{read_message, write_message, ErrorCode, Message};
use crate::error::{Error, Result};

/// Computes the immediate response to a request
pub type MessageHandler = Arc<dyn Fn(SocketAddr, &Message) -> Option<Message> + Send + Sync>;

/// Network server for the coordination channel
pub struct CoordinationServer {
    /// Bound listener
    listener: TcpListener,
    /// Immediate response handler
    handler: MessageHandler,
    /// Channel for incoming messages
    incoming_tx: mpsc::Sender<(SocketAddr, Message)>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl CoordinationServer {
    /// Bind the server. Bind failures are startup errors.
    pub async fn bind(
        address: SocketAddr,
        handler: MessageHandler,
        incoming_tx: mpsc::Sender<(SocketAddr, Message)>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            Error::Network(format!("failed to bind coordination channel {}: {}", address, e))
        })?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            handler,
            incoming_tx,
            shutdown,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle that stops the server when sent `true`
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    /// Run the accept loop until shut down
    pub async fn serve(self) -> Result<()> {
        tracing::info!(
            "Coordination server listening on {}",
            self.listener.local_addr()?
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        // Dropping the set aborts open connections along with the server
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            let incoming_tx = self.incoming_tx.clone();
                            let handler = Arc::clone(&self.handler);

                            connections.spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr, incoming_tx, handler).await {
                                    tracing::debug!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Coordination server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    incoming_tx: mpsc::Sender<(SocketAddr, Message)>,
    handler: MessageHandler,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

                let response = handler(peer_addr, &message).unwrap_or_else(|| Message::Error {
                    code: ErrorCode::Unsupported,
                    message: format!("{} is not a request", message.type_name()),
                });
                write_message(&mut writer, &response).await?;

                if matches!(response, Message::Error { .. }) {
                    continue;
                }

                // Forward to channel for async processing
                if incoming_tx.send((peer_addr, message)).await.is_err() {
                    break;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::debug!("Dropping connection from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}
