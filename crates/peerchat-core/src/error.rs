//! Error types for peerchat

use thiserror::Error;

/// Main error type for session and dispatch operations
#[derive(Error, Debug)]
pub enum ChatError {
    /// Address string is not a valid peer multiaddr
    #[error("Address parse error: {0}")]
    AddressParse(String),

    /// Transport could not connect to the peer
    #[error("Dial error: {0}")]
    Dial(String),

    /// Chat protocol stream could not be negotiated
    #[error("Stream open error: {0}")]
    StreamOpen(String),

    /// Relay refused or never answered the reservation request
    #[error("Reservation error: {0}")]
    Reservation(String),

    /// Read or write failed on an established contact stream
    #[error("Stream I/O error: {0}")]
    StreamIo(String),

    /// Control command was malformed or unknown
    #[error("Command parse error: {0}")]
    CommandParse(String),

    /// Outbound command queue is full or closed
    #[error("Queue error: {0}")]
    Queue(String),

    /// Transport-level failure outside a specific dial/stream operation
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid node configuration
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using ChatError
pub type ChatResult<T> = Result<T, ChatError>;
