//! scadalink WebSocket server implementation.
//!
//! This module provides the client-facing WebSocket server that handles:
//! - Client connections and their hello message
//! - Datapoint registration through the subscription router
//! - Delivery of queued updates to each client
//! - Select/operate requests, published to the RTU's command channel

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scadalink_core::{Command, CommandKind, PointId, PointValue, RtuAddress};
use scadalink_protocol::{
    decode_client_message, encode_server_message, ClientMessage, CodecError, HelloMessage,
    ServerMessage,
};

use crate::backend::FastStore;
use crate::error::ServerError;
use crate::registry::ClientId;
use crate::router::SubscriptionRouter;

/// Configuration for the WebSocket server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server name sent in the hello message.
    pub name: String,
    /// Version sent in the hello message.
    pub version: String,
    /// Address to bind to.
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "scadalink".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
        }
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The client WebSocket server.
pub struct ScadaServer {
    config: ServerConfig,
    router: Arc<SubscriptionRouter>,
    fast: Arc<dyn FastStore>,
}

impl ScadaServer {
    pub fn new(config: ServerConfig, router: Arc<SubscriptionRouter>, fast: Arc<dyn FastStore>) -> Self {
        Self {
            config,
            router,
            fast,
        }
    }

    /// Accept connections until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "scadalink server listening");

        let server = Arc::new(self);
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let server = server.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr, cancel).await {
                            error!(%addr, error = %e, "Connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("scadalink server stopped");
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        info!(%addr, "New connection");
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let client_id: ClientId = Uuid::new_v4();
        let mut outbound = self.router.connect(client_id).await;

        let result = async {
            let hello = HelloMessage::new(&self.config.name, &self.config.version, client_id.to_string());
            send(&mut ws_tx, &ServerMessage::Hello(hello)).await?;
            debug!(client = %client_id, %addr, "Sent hello");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }

                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(reply) = self.handle_client_message(&client_id, &text).await {
                                    send(&mut ws_tx, &reply).await?;
                                }
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let reply = ServerMessage::error(CodecError::BinaryFrame.to_string());
                                send(&mut ws_tx, &reply).await?;
                            }
                            Some(Ok(Message::Close(_))) => {
                                info!(client = %client_id, %addr, "Client closed connection");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_tx.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                error!(client = %client_id, %addr, error = %e, "WebSocket error");
                                break;
                            }
                            None => {
                                info!(client = %client_id, %addr, "Client disconnected");
                                break;
                            }
                            _ => {} // Ignore other message types
                        }
                    }

                    queued = outbound.recv() => {
                        match queued {
                            Some(message) => send(&mut ws_tx, &message).await?,
                            None => break,
                        }
                    }
                }
            }
            Ok::<(), ServerError>(())
        }
        .await;

        self.router.on_disconnect(&client_id).await;
        result
    }

    /// Handle a message received from a client, returning the direct reply.
    async fn handle_client_message(&self, client: &ClientId, text: &str) -> Option<ServerMessage> {
        let msg = match decode_client_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client = %client, error = %e, "Bad client message");
                return Some(ServerMessage::error(e.to_string()));
            }
        };

        match msg {
            ClientMessage::RegisterDatapoint { point } => {
                match self.router.register(client, &point).await {
                    Ok(mode) => Some(ServerMessage::Registered { point, mode }),
                    Err(e) => {
                        warn!(client = %client, point = %point, error = %e, "Registration failed");
                        Some(ServerMessage::error(e.to_string()))
                    }
                }
            }
            ClientMessage::UnregisterDatapoint { point } => {
                self.router.unregister(client, &point).await;
                None
            }
            ClientMessage::Select { point, value } => {
                Some(self.publish_command(client, CommandKind::Select, point, value).await)
            }
            ClientMessage::Operate { point, value } => {
                Some(self.publish_command(client, CommandKind::Operate, point, value).await)
            }
        }
    }

    async fn publish_command(
        &self,
        client: &ClientId,
        kind: CommandKind,
        point: PointId,
        value: serde_json::Value,
    ) -> ServerMessage {
        let rtu: RtuAddress = match point.rtu().parse() {
            Ok(rtu) => rtu,
            Err(e) => return ServerMessage::error(format!("{point}: {e}")),
        };
        let command = Command::new(kind, point.ioa(), PointValue::from(value).to_raw());
        let channel = kind.channel_for(&rtu);

        match self.fast.publish(&channel, &command.encode()).await {
            Ok(()) => {
                info!(client = %client, point = %point, %kind, "Command published");
                ServerMessage::CommandPublished { point, kind }
            }
            Err(e) => {
                warn!(client = %client, point = %point, error = %e, "Cannot publish command");
                ServerMessage::error(e.to_string())
            }
        }
    }
}

async fn send(ws_tx: &mut WsSink, message: &ServerMessage) -> Result<(), ServerError> {
    let text = encode_server_message(message)?;
    ws_tx.send(Message::Text(text)).await?;
    Ok(())
}
