pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;

pub use config::ClientConfig;
pub use error::{DuplexError, Result};
pub use session::{DuplexClient, Endpoint, SessionEvent, SessionHandle, SessionState};
