use std::net::SocketAddr;

use thiserror::Error;

/// Violations of the wire protocol by the remote end
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Invalid frame format: {0}")]
    InvalidFrameFormat(String),

    #[error("Invalid packet format: {0}")]
    InvalidPacketFormat(String),

    #[error("Invalid stream ID: {0}")]
    InvalidStreamId(String),

    #[error("Flow control violation: {0}")]
    FlowControlViolation(String),

    #[error("Final size error: {0}")]
    FinalSize(String),

    #[error("Stream limit exceeded: {0}")]
    StreamLimit(String),

    #[error("Unsupported version: {0:#010x}")]
    UnsupportedVersion(u32),
}

#[derive(Error, Debug, Clone)]
pub enum QuicError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Packet processing error: {0}")]
    Packet(#[from] PacketError),

    #[error("Event loop error: {0}")]
    Loop(#[from] LoopError),

    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    #[error("Stale handle: {0}")]
    StaleHandle(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String), // String instead of std::io::Error for Clone
}

impl From<std::io::Error> for QuicError {
    fn from(err: std::io::Error) -> Self {
        QuicError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for QuicError {
    fn from(err: config::ConfigError) -> Self {
        QuicError::Config(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Idle timeout")]
    IdleTimeout,

    #[error("Closed by peer (code {code}): {reason}")]
    ClosedByPeer { code: u64, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Write on stream {0} after write_close")]
    WriteAfterClose(u64),

    #[error("No peer-initiated stream is waiting to be accepted")]
    NoPendingStream,

    #[error("Stream not found")]
    NotFound,
}

#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

#[derive(Error, Debug, Clone)]
pub enum PacketError {
    #[error("Packet too small: {size} bytes")]
    TooSmall { size: usize },

    #[error("Packet too large: {size} bytes, max: {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid header")]
    InvalidHeader,

    #[error("Unsupported packet type: {0:#04x}")]
    UnsupportedType(u8),

    #[error("Incomplete packet data")]
    IncompleteData,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    #[error("Event loop already initialized")]
    AlreadyInitialized,

    #[error("Built-in event loop not initialized")]
    NotBuiltin,

    #[error("Event loop entered from inside a callback")]
    Reentrant,
}

/// Broad classification of an error, by who is expected to act on it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A resource the caller asked for is already taken
    ResourceConflict,
    /// The caller violated the API contract
    Misuse,
    /// The remote end or the network misbehaved
    Transport,
    /// The operating system or configuration refused the request
    Environment,
}

impl QuicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuicError::AddressInUse(_) => ErrorKind::ResourceConflict,
            QuicError::Stream(_) | QuicError::Loop(_) | QuicError::StaleHandle(_) => ErrorKind::Misuse,
            QuicError::Connection(ConnectionError::Closed) => ErrorKind::Misuse,
            QuicError::Connection(_)
            | QuicError::Protocol(_)
            | QuicError::Packet(_)
            | QuicError::Crypto(CryptoError::Decryption(_)) => ErrorKind::Transport,
            QuicError::Crypto(_) | QuicError::Config(_) | QuicError::Io(_) => ErrorKind::Environment,
        }
    }

    /// Whether the error was caused by something the remote sent
    pub fn is_remote(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

pub type Result<T> = std::result::Result<T, QuicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(QuicError::AddressInUse(addr).kind(), ErrorKind::ResourceConflict);
        assert_eq!(QuicError::from(StreamError::NoPendingStream).kind(), ErrorKind::Misuse);
        assert_eq!(QuicError::from(LoopError::AlreadyInitialized).kind(), ErrorKind::Misuse);
        assert!(QuicError::from(PacketError::InvalidHeader).is_remote());
        assert!(!QuicError::Config("bad".into()).is_remote());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: QuicError = std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken").into();
        assert!(matches!(err, QuicError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Environment);
    }
}
