use crate::config::{ClientConfig, PersonaParams};
use crate::error::{DuplexError, Result};
use crate::protocol::{self, FrameKind};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection target. Query parameters are opaque and passed through as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(DuplexError::InvalidEndpoint(format!(
                "unsupported scheme '{}' (expected ws or wss)",
                other
            ))),
        }
    }

    /// The configured endpoint with the persona parameters appended.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let endpoint = Self::parse(config.endpoint()?)?;
        Ok(endpoint.with_persona(&config.persona))
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(key, value);
        self
    }

    pub fn with_persona(self, persona: &PersonaParams) -> Self {
        persona
            .query_pairs()
            .into_iter()
            .fold(self, |endpoint, (key, value)| endpoint.with_param(key, value))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

impl std::str::FromStr for Endpoint {
    type Err = DuplexError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Open the WebSocket, bounded by `config.connect_timeout`.
pub async fn connect(endpoint: &Endpoint, config: &ClientConfig) -> Result<WsStream> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| DuplexError::InvalidEndpoint(e.to_string()))?;

    if let Some(user_agent) = &config.user_agent {
        request
            .headers_mut()
            .insert(header::USER_AGENT, header_value("User-Agent", user_agent)?);
    }
    if let Some(origin) = &config.origin {
        request
            .headers_mut()
            .insert(header::ORIGIN, header_value("Origin", origin)?);
    }

    let connector = if endpoint.is_secure() && config.accept_invalid_certs {
        log::warn!("TLS certificate verification disabled for {}", endpoint.url().host_str().unwrap_or("?"));
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| DuplexError::Connect(format!("TLS setup failed: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let attempt = connect_async_tls_with_config(request, None, true, connector);
    match tokio::time::timeout(config.connect_timeout, attempt).await {
        Ok(Ok((stream, response))) => {
            log::debug!("WebSocket upgrade complete: HTTP {}", response.status());
            Ok(stream)
        }
        Ok(Err(e)) => Err(DuplexError::Connect(e.to_string())),
        Err(_) => Err(DuplexError::Connect(format!(
            "timed out after {:?}",
            config.connect_timeout
        ))),
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| DuplexError::InvalidEndpoint(format!("invalid {} header: {}", name, e)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The first message was a handshake frame.
    Ready { status: Option<u8> },
    /// The server spoke first, but not with a handshake.
    Unexpected(String),
    /// The server closed before sending anything.
    Closed,
    TimedOut,
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeOutcome::Ready { .. })
    }
}

/// Connect once and wait for the service's first message.
///
/// Connection failures are returned as errors; anything after the upgrade is
/// reported as an outcome.
pub async fn probe(endpoint: &Endpoint, config: &ClientConfig, wait: Duration) -> Result<ProbeOutcome> {
    let mut stream = connect(endpoint, config).await?;

    if config.send_handshake {
        let frame = protocol::encode(FrameKind::Handshake, &[]);
        stream
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| DuplexError::SendFailure(e.to_string()))?;
    }

    let outcome = match tokio::time::timeout(wait, stream.next()).await {
        Err(_) => ProbeOutcome::TimedOut,
        Ok(None) | Ok(Some(Ok(Message::Close(_)))) => ProbeOutcome::Closed,
        Ok(Some(Err(e))) => ProbeOutcome::Unexpected(format!("transport error: {}", e)),
        Ok(Some(Ok(Message::Binary(data)))) => match protocol::decode(data.as_slice()) {
            Ok(frame) if frame.kind == FrameKind::Handshake => ProbeOutcome::Ready {
                status: frame.handshake_status(),
            },
            Ok(frame) => ProbeOutcome::Unexpected(format!(
                "{:?} frame with {} payload bytes",
                frame.kind,
                frame.payload.len()
            )),
            Err(e) => ProbeOutcome::Unexpected(e.to_string()),
        },
        Ok(Some(Ok(Message::Text(text)))) => {
            ProbeOutcome::Unexpected(format!("text message: {}", text.as_str()))
        }
        Ok(Some(Ok(other))) => ProbeOutcome::Unexpected(format!("{:?}", other)),
    };

    let _ = stream.close(None).await;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_requires_ws_scheme() {
        assert!(Endpoint::parse("wss://pod-8998.proxy.example/api/chat").is_ok());
        assert!(Endpoint::parse("ws://127.0.0.1:8998/api/chat").is_ok());
        assert!(matches!(
            Endpoint::parse("https://example.test/api/chat"),
            Err(DuplexError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            Endpoint::parse("not a url"),
            Err(DuplexError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_persona_params_are_url_encoded() {
        let persona = PersonaParams {
            text_prompt: Some("You are Tom & strict".to_string()),
            voice_prompt: Some("voice_1.pt".to_string()),
            seed: Some("42".to_string()),
        };
        let endpoint = Endpoint::parse("wss://example.test/api/chat")
            .unwrap()
            .with_persona(&persona);

        assert_eq!(
            endpoint.as_str(),
            "wss://example.test/api/chat?text_prompt=You+are+Tom+%26+strict&voice_prompt=voice_1.pt&seed=42"
        );
        let pairs: Vec<(String, String)> = endpoint.url().query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("text_prompt".to_string(), "You are Tom & strict".to_string()));
    }

    #[test]
    fn test_existing_query_is_preserved() {
        let endpoint = Endpoint::parse("ws://localhost/api/chat?token=abc")
            .unwrap()
            .with_param("seed", "7");
        assert_eq!(endpoint.as_str(), "ws://localhost/api/chat?token=abc&seed=7");
        assert!(!endpoint.is_secure());
    }

    #[test]
    fn test_endpoint_from_config() {
        let mut config = ClientConfig::default();
        assert!(matches!(
            Endpoint::from_config(&config),
            Err(DuplexError::Config(crate::config::ConfigError::MissingEndpoint))
        ));

        config.endpoint = Some("ws://127.0.0.1:8998/api/chat".to_string());
        config.persona.seed = Some("7".to_string());
        let endpoint = Endpoint::from_config(&config).unwrap();
        assert_eq!(endpoint.as_str(), "ws://127.0.0.1:8998/api/chat?seed=7");
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::parse(&format!("ws://127.0.0.1:{}/api/chat", port)).unwrap();
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        };
        let err = connect(&endpoint, &config).await.unwrap_err();
        assert!(matches!(err, DuplexError::Connect(_)), "got {:?}", err);
    }
}
