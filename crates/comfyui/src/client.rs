//! WebSocket client for ComfyUI progress messages.
//!
//! [`ProgressClient`] holds the WebSocket URL and the client id that
//! jobs are submitted under, so the server addresses progress frames for
//! those jobs to this socket. Call [`ProgressClient::connect`] to open a
//! live [`ProgressConnection`].

use tokio_tungstenite::{connect_async, MaybeTlsStream};

pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection settings for the progress socket of one backend.
#[derive(Debug, Clone)]
pub struct ProgressClient {
    ws_url: String,
    client_id: String,
}

/// A live WebSocket connection.
pub struct ProgressConnection {
    pub client_id: String,
    pub ws_stream: WsStream,
}

impl ProgressClient {
    /// * `api_url`   - HTTP base URL, e.g. `http://host:8188`.
    /// * `client_id` - id also passed with every `POST /prompt`.
    pub fn new(api_url: &str, client_id: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url_for(api_url),
            client_id: client_id.into(),
        }
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn connect(&self) -> Result<ProgressConnection, ProgressClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, self.client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ProgressClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %self.client_id,
            ws_url = %self.ws_url,
            "Connected to ComfyUI progress socket",
        );

        Ok(ProgressConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

/// `http://` -> `ws://`, `https://` -> `wss://`.
pub fn ws_url_for(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{trimmed}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressClientError {
    #[error("Connection error: {0}")]
    Connection(String),
}
