use crate::audio::AudioError;
use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DuplexError>;

#[derive(Error, Debug)]
pub enum DuplexError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error(transparent)]
    MalformedFrame(#[from] ProtocolError),

    #[error("Text decode error: {0}")]
    Decode(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Device(#[from] AudioError),

    #[error("Peer closed connection")]
    PeerClosed,

    #[error("Send failure: {0}")]
    SendFailure(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Gave up after {0} failed connection attempts")]
    RetriesExhausted(u32),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<tokio_tungstenite::tungstenite::Error> for DuplexError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        DuplexError::Connect(err.to_string())
    }
}

impl From<url::ParseError> for DuplexError {
    fn from(err: url::ParseError) -> Self {
        DuplexError::InvalidEndpoint(err.to_string())
    }
}

impl DuplexError {
    /// Whether the session controller should retry after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DuplexError::Connect(_)
                | DuplexError::PeerClosed
                | DuplexError::SendFailure(_)
                | DuplexError::MalformedFrame(_)
                | DuplexError::Decode(_)
                | DuplexError::Device(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(DuplexError::Connect("refused".into()).is_recoverable());
        assert!(DuplexError::PeerClosed.is_recoverable());
        assert!(DuplexError::SendFailure("broken pipe".into()).is_recoverable());
        assert!(DuplexError::from(ProtocolError::MalformedFrame).is_recoverable());
        let bad_text = String::from_utf8(vec![0xff, 0xfe]).unwrap_err();
        assert!(DuplexError::from(bad_text).is_recoverable());
        assert!(DuplexError::from(AudioError::Stream("underrun".into())).is_recoverable());
        assert!(!DuplexError::RetriesExhausted(3).is_recoverable());
        assert!(!DuplexError::InvalidEndpoint("no scheme".into()).is_recoverable());
        assert!(!DuplexError::from(ConfigError::MissingEndpoint).is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = DuplexError::from(ProtocolError::MalformedFrame);
        assert_eq!(err.to_string(), "Malformed frame: message has no kind byte");
        assert_eq!(
            DuplexError::RetriesExhausted(3).to_string(),
            "Gave up after 3 failed connection attempts"
        );
    }
}
