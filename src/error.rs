//! Error types for the listener.

use std::io;
use std::path::PathBuf;

/// Errors that end the listener, or a single connection.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The listening socket could not be created or bound. Fatal.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Accepting an inbound connection failed.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// Writing decoded text to the output failed. Fatal.
    #[error("failed to write output: {0}")]
    Output(#[source] io::Error),
}

/// Invalid UTF-8 received from a peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A byte that cannot start or continue a UTF-8 sequence.
    #[error("invalid UTF-8 byte 0x{byte:02x} at stream offset {offset}")]
    Invalid { offset: u64, byte: u8 },

    /// The stream ended in the middle of a multi-byte character.
    #[error("stream ended inside a multi-byte character ({pending} byte(s) pending)")]
    Truncated { pending: usize },
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
