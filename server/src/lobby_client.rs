//! Reconnecting duplex client to the lobby.
//!
//! One connection attempt is: discover the OAuth2 authorization server,
//! fetch a client-credentials token, then open the authenticated websocket
//! to `/tachyon` with the subprotocol pinning the wire version. The
//! connection speaks JSON text frames only; a binary frame or an
//! unparseable frame closes it with a protocol error.
//!
//! The reconnect policy itself lives in the supervisor; this module only
//! knows how to connect once and pump frames.

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use shared::lobby::{parse_envelope, Envelope};

use crate::config::Config;

/// Subprotocol selector pinning the lobby wire version.
pub const TACHYON_SUBPROTOCOL: &str = "v0.tachyon";

/// OAuth2 scope requested for the lobby channel.
const TOKEN_SCOPE: &str = "tachyon.lobby";

/// Outbound frames queued ahead of the socket flush.
const SEND_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid authorization server metadata: {0}")]
    Metadata(String),
    #[error("token request failed: {0}")]
    OAuth(String),
    #[error("unexpected token type {0:?}")]
    BadTokenType(String),
    #[error("websocket connect failed: {0}")]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// What the reader surfaces to the supervisor.
#[derive(Debug)]
pub enum ClientEvent {
    Frame(Envelope),
    Closed { reason: String },
}

/// One live lobby connection.
pub struct LobbyClient {
    /// Bounded send path; the writer task awaits the socket flush, so a
    /// slow lobby backpressures into this channel.
    pub sender: mpsc::Sender<Value>,
    pub events: mpsc::Receiver<ClientEvent>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Base URL for HTTP calls against the lobby host.
fn http_base(config: &Config) -> String {
    let scheme = if config.secure_connection() {
        "https"
    } else {
        "http"
    };
    match config.tachyon_server_port {
        Some(port) => format!("{scheme}://{}:{port}", config.tachyon_server),
        None => format!("{scheme}://{}", config.tachyon_server),
    }
}

/// URL of the duplex channel.
fn ws_url(config: &Config) -> String {
    let scheme = if config.secure_connection() {
        "wss"
    } else {
        "ws"
    };
    match config.tachyon_server_port {
        Some(port) => format!("{scheme}://{}:{port}/tachyon", config.tachyon_server),
        None => format!("{scheme}://{}/tachyon", config.tachyon_server),
    }
}

fn form_encode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

/// Checks the discovery document and extracts the token endpoint.
fn validate_metadata(metadata: &Value) -> Result<String, ConnectError> {
    let token_endpoint = metadata
        .get("token_endpoint")
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectError::Metadata("missing token_endpoint".to_string()))?;
    let supports_token = metadata
        .get("response_types_supported")
        .and_then(Value::as_array)
        .is_some_and(|types| types.iter().any(|t| t.as_str() == Some("token")));
    if !supports_token {
        return Err(ConnectError::Metadata(
            "token response type is not supported".to_string(),
        ));
    }
    Ok(token_endpoint.to_string())
}

/// Renders a failed token response as `error[: error_description]`, falling
/// back to the HTTP status when the body is not an OAuth2 error.
fn oauth_error_message(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(err) => match err.error_description {
            Some(description) => format!("{}: {description}", err.error),
            None => err.error,
        },
        Err(_) => format!("token endpoint returned {status}"),
    }
}

async fn fetch_token(config: &Config, http: &reqwest::Client) -> Result<String, ConnectError> {
    let metadata_url = format!(
        "{}/.well-known/oauth-authorization-server",
        http_base(config)
    );
    let metadata: Value = http
        .get(&metadata_url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let token_endpoint = validate_metadata(&metadata)?;

    // RFC 6749 2.3.1: credentials are form-urlencoded before Basic auth.
    let response = http
        .post(&token_endpoint)
        .basic_auth(
            form_encode(&config.auth_client_id),
            Some(form_encode(&config.auth_client_secret)),
        )
        .form(&[("grant_type", "client_credentials"), ("scope", TOKEN_SCOPE)])
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ConnectError::OAuth(oauth_error_message(status, &body)));
    }
    let token: TokenResponse = response.json().await?;
    if !token.token_type.eq_ignore_ascii_case("bearer") {
        return Err(ConnectError::BadTokenType(token.token_type));
    }
    Ok(token.access_token)
}

impl LobbyClient {
    /// Performs one full connection attempt: OAuth handshake plus websocket
    /// open. On success the returned client is live and pumping frames.
    pub async fn connect(config: &Config, http: &reqwest::Client) -> Result<Self, ConnectError> {
        let token = fetch_token(config, http).await?;

        let mut request = ws_url(config)
            .into_client_request()
            .map_err(ConnectError::Websocket)?;
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ConnectError::OAuth("token is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", auth);
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(TACHYON_SUBPROTOCOL),
        );
        let (socket, _response) = connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();

        let (sender, mut out_rx) = mpsc::channel::<Value>(SEND_QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
                    warn!("lobby send failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (event_tx, events) = mpsc::channel::<ClientEvent>(SEND_QUEUE_DEPTH);
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => match parse_envelope(&text) {
                        Ok(envelope) => {
                            if event_tx.send(ClientEvent::Frame(envelope)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => break format!("parse error: {e}"),
                    },
                    Some(Ok(Message::Binary(_))) => {
                        break "protocol error: binary frame".to_string()
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!("closed by lobby: {}", frame.reason),
                            None => "closed by lobby".to_string(),
                        }
                    }
                    Some(Ok(other)) => {
                        // Ping/pong and fragments are handled by the stack.
                        debug!("ignoring control frame: {other:?}");
                    }
                    Some(Err(e)) => break format!("connection error: {e}"),
                    None => break "connection closed".to_string(),
                }
            };
            let _ = event_tx.send(ClientEvent::Closed { reason }).await;
        });

        Ok(Self { sender, events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host: &str, port: Option<u16>, secure: Option<bool>) -> Config {
        let mut raw = serde_json::json!({
            "tachyonServer": host,
            "authClientId": "id",
            "authClientSecret": "secret",
            "hostingIP": "203.0.113.7",
        });
        if let Some(port) = port {
            raw["tachyonServerPort"] = serde_json::json!(port);
        }
        if let Some(secure) = secure {
            raw["useSecureConnection"] = serde_json::json!(secure);
        }
        Config::from_json(&raw.to_string()).unwrap()
    }

    #[test]
    fn urls_use_tls_by_default() {
        let cfg = config("lobby.example.com", None, None);
        assert_eq!(http_base(&cfg), "https://lobby.example.com");
        assert_eq!(ws_url(&cfg), "wss://lobby.example.com/tachyon");
    }

    #[test]
    fn localhost_is_plain_unless_overridden() {
        let cfg = config("localhost", Some(8080), None);
        assert_eq!(http_base(&cfg), "http://localhost:8080");
        assert_eq!(ws_url(&cfg), "ws://localhost:8080/tachyon");

        let cfg = config("localhost", Some(8080), Some(true));
        assert_eq!(ws_url(&cfg), "wss://localhost:8080/tachyon");
    }

    #[test]
    fn explicit_insecure_connection() {
        let cfg = config("lobby.example.com", None, Some(false));
        assert_eq!(http_base(&cfg), "http://lobby.example.com");
    }

    #[test]
    fn metadata_requires_token_endpoint_and_response_type() {
        let ok = serde_json::json!({
            "token_endpoint": "https://lobby/token",
            "response_types_supported": ["code", "token"],
        });
        assert_eq!(validate_metadata(&ok).unwrap(), "https://lobby/token");

        let missing_endpoint = serde_json::json!({
            "response_types_supported": ["token"],
        });
        assert!(matches!(
            validate_metadata(&missing_endpoint),
            Err(ConnectError::Metadata(_))
        ));

        let no_token_type = serde_json::json!({
            "token_endpoint": "https://lobby/token",
            "response_types_supported": ["code"],
        });
        assert!(matches!(
            validate_metadata(&no_token_type),
            Err(ConnectError::Metadata(_))
        ));
    }

    #[test]
    fn oauth_errors_render_error_and_description() {
        let status = reqwest::StatusCode::BAD_REQUEST;
        assert_eq!(
            oauth_error_message(status, r#"{"error":"invalid_client"}"#),
            "invalid_client"
        );
        assert_eq!(
            oauth_error_message(
                status,
                r#"{"error":"invalid_client","error_description":"unknown client"}"#
            ),
            "invalid_client: unknown client"
        );
        assert_eq!(
            oauth_error_message(status, "<html>nope</html>"),
            "token endpoint returned 400 Bad Request"
        );
    }

    #[test]
    fn credentials_are_form_encoded() {
        assert_eq!(form_encode("plain"), "plain");
        assert_eq!(form_encode("with space&amp"), "with+space%26amp");
    }
}
