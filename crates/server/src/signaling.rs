use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use tracing::debug;

use crate::session::Session;
use crate::video::{TestPatternSource, VideoSourceFactory};
use crate::web::AppState;

/// Bidirectional text-message channel carrying signaling frames.
///
/// The production implementation wraps an axum WebSocket; tests substitute
/// a channel-backed one.
#[async_trait::async_trait]
pub trait SignalingTransport: Send {
    /// Complete the channel handshake. A no-op for transports that are
    /// already accepted when handed over.
    async fn accept(&mut self) -> Result<()> {
        Ok(())
    }

    /// Receive the next text frame. `Ok(None)` means the peer closed the
    /// channel cleanly.
    async fn recv_text(&mut self) -> Result<Option<String>>;

    /// Send one text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Close the channel, ignoring already-closed errors.
    async fn close(&mut self);
}

/// Production transport over an axum WebSocket. The socket is already
/// accepted by the time the upgrade callback hands it over.
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait::async_trait]
impl SignalingTransport for WsTransport {
    async fn recv_text(&mut self) -> Result<Option<String>> {
        while let Some(message) = self.socket.recv().await {
            match message? {
                Message::Text(text) => return Ok(Some(text.to_string())),
                Message::Close(_) => return Ok(None),
                Message::Binary(_) => {
                    debug!("Ignoring binary frame on signaling channel");
                }
                // Keepalive pings are answered by axum itself.
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        Ok(None)
    }

    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.socket.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

/// Entry point for an incoming signaling WebSocket: bind it to a fresh
/// session with the bundled test-pattern video source and run the session
/// to completion.
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let video = state.config.video.clone();
    let factory: VideoSourceFactory =
        Box::new(move || Box::new(TestPatternSource::new(video.width, video.height, video.fps)));

    Session::new(WsTransport::new(socket), Arc::clone(&state.registry), factory)
        .run()
        .await;
}
