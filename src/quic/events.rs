use crate::quic::stream::StreamId;

/// Notifications a connection raises for the engine to turn into callbacks.
///
/// Events are only raised on edge transitions; the engine never has to
/// filter duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A peer-initiated stream is waiting in the accept queue
    IncomingStream,
    /// An accepted or locally opened stream has data (or its end) to read
    StreamReadable(StreamId),
    /// A stream freed send capacity or its write side was closed remotely
    StreamWritable(StreamId),
    /// The connection reached its terminal state
    Closed,
}
