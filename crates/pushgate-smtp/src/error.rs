//! Error types for the SMTP server.

use std::io;

/// Result type alias for SMTP server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP server error types.
///
/// These are connection-fatal conditions. Recoverable protocol violations
/// (bad sequencing, unknown commands, bad addresses) are expressed as
/// numeric replies by the session state machine, not as errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// A protocol phase exceeded its idle timeout.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Invalid listener configuration.
    #[error("Listener configuration error: {0}")]
    Config(String),
}
