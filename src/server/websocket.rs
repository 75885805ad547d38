//! WebSocket server implementation
//!
//! Listens on a configurable port and bridges UI clients to the terminal
//! session: control messages as JSON text frames, terminal output as binary
//! frames.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{validate_input_length, ClientMessage, ServerMessage};
use crate::events::{EventBus, TERMINAL_DATA};
use crate::terminal::SessionManager;

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self { bind, port }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server for UI client connections
pub struct WebSocketServer {
    config: ServerConfig,
    manager: Arc<SessionManager>,
    bus: EventBus,
    shutdown: CancellationToken,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(
        config: ServerConfig,
        manager: Arc<SessionManager>,
        bus: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            manager,
            bus,
            shutdown,
        }
    }

    /// Bind the configured address and run the server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}/ws", addr);
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    ///
    /// The active session is stopped before this returns.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let connection = Connection {
                                peer_addr,
                                manager: Arc::clone(&self.manager),
                                bus: self.bus.clone(),
                                shutdown: self.shutdown.clone(),
                            };

                            tokio::spawn(async move {
                                if let Err(e) = connection.handle(stream).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        if self.manager.is_active().await {
            info!("Stopping active terminal session...");
            if let Err(e) = self.manager.stop().await {
                warn!("Failed to stop terminal session: {}", e);
            }
        }
        if let Some(exit) = self.manager.wait_pump().await {
            debug!("Output pump finished: {:?}", exit);
        }

        Ok(())
    }
}

/// State shared by one client connection
struct Connection {
    peer_addr: SocketAddr,
    manager: Arc<SessionManager>,
    bus: EventBus,
    shutdown: CancellationToken,
}

impl Connection {
    async fn handle(self, stream: TcpStream) -> anyhow::Result<()> {
        let peer_addr = self.peer_addr;
        info!("New connection from {}", peer_addr);

        // Subscribe before the handshake so no output after the welcome is missed
        let mut output = self.bus.subscribe(TERMINAL_DATA);
        let mut state_rx = self.manager.subscribe_state();

        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let welcome = ServerMessage::welcome(*state_rx.borrow_and_update());
        ws_sender.send(Message::Text(welcome.to_json()?)).await?;
        debug!("Sent welcome message to {}", peer_addr);

        let mut streaming = None;
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received message from {}: {}", peer_addr, text);
                            let response = self.handle_text(&text).await;
                            ws_sender.send(Message::Text(response.to_json()?)).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if let Err(e) = validate_input_length(data.len()) {
                                warn!("Rejected binary input from {}: {}", peer_addr, e);
                                let response = ServerMessage::from(e);
                                ws_sender.send(Message::Text(response.to_json()?)).await?;
                                continue;
                            }
                            self.bus.emit_input(data);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            info!("Client {} requested close", peer_addr);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error from {}: {}", peer_addr, e);
                            break;
                        }
                        None => {
                            info!("Connection closed by {}", peer_addr);
                            break;
                        }
                    }
                }
                event = output.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    if event.session_id != streaming {
                        streaming = event.session_id;
                        debug!("Streaming output of session {:?} to {}", streaming, peer_addr);
                    }
                    ws_sender.send(Message::Binary(event.payload)).await?;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    let message = ServerMessage::SessionState { state };
                    ws_sender.send(Message::Text(message.to_json()?)).await?;
                }
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received, closing connection to {}", peer_addr);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        info!("Connection from {} closed", peer_addr);
        Ok(())
    }

    /// Parse a text frame and run it
    async fn handle_text(&self, text: &str) -> ServerMessage {
        match ClientMessage::from_json(text) {
            Ok(message) => handle_message(message, &self.manager, &self.shutdown).await,
            Err(e) => {
                warn!("Rejected message from {}: {}", self.peer_addr, e);
                e.into()
            }
        }
    }
}

/// Handle a validated client message and return the response
///
/// Sessions are scoped to the server, not to the connection that started them.
/// Text input is written directly so write failures reach the client; binary
/// frames go through the bus.
async fn handle_message(
    message: ClientMessage,
    manager: &SessionManager,
    scope: &CancellationToken,
) -> ServerMessage {
    match message {
        ClientMessage::Ping { seq } => ServerMessage::Pong { seq },
        ClientMessage::StartSession { target } => match manager.start(&target, scope.clone()).await {
            Ok(info) => ServerMessage::session_started(info),
            Err(e) => e.into(),
        },
        ClientMessage::Input { data } => match manager.write(data.as_bytes()).await {
            Ok(()) => ServerMessage::Ack,
            Err(e) => e.into(),
        },
        ClientMessage::StopSession => match manager.stop().await {
            Ok(()) => ServerMessage::SessionStopped,
            Err(e) => e.into(),
        },
        ClientMessage::Resize { cols, rows } => match manager.resize(cols, rows).await {
            Ok(()) => ServerMessage::Resized { cols, rows },
            Err(e) => e.into(),
        },
        ClientMessage::GetStatus => ServerMessage::status(manager.status().await),
    }
}
