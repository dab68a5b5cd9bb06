// ABOUTME: Error types for the SPDY connection engine, split into connection-fatal and stream-fatal kinds
// ABOUTME: Connection-fatal errors tear down every live stream; stream-fatal errors reach one request's delegate

use std::io;
use thiserror::Error;

/// Errors that are fatal to an entire `Connection`.
///
/// Per spec §7, any of these close the connection: every still-live request
/// receives one `on_error` followed by one `on_end`, and the application's
/// connection delegate receives one `on_connection_error`.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The underlying transport returned an I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer closed the connection (end of stream on read).
    #[error("connection closed by peer")]
    ConnectionEnd,

    /// The framer failed to parse inbound bytes, or a frame referenced a
    /// stream id this connection never issued.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The header codec's zlib stream reported an error, or a decoded
    /// header block was malformed.
    #[error("header compression error: {0}")]
    HeaderCompression(String),

    /// `next_stream_id` wrapped past the 31-bit stream id space.
    #[error("stream id space exhausted")]
    StreamIdExhausted,
}

/// Errors delivered to a single request's delegate; the connection remains
/// healthy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The peer sent `RST_STREAM` for this stream.
    #[error("stream reset by peer: {0:?}")]
    RstStream(crate::frame::control::RstStatusCode),

    /// A second `SYN_REPLY` arrived on a stream that already saw one.
    #[error("duplicate SYN_REPLY on stream")]
    DoubleResponse,

    /// The application called `Request::close()`.
    #[error("stream cancelled locally")]
    Cancelled,

    /// The connection this stream belonged to was torn down.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
}

/// Per-call misuse errors that do not affect the connection or any other
/// stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// `Connection::send` was called with a `Request` that is already bound
    /// to a connection.
    #[error("request has already been sent")]
    AlreadySent,
}

/// Result alias for connection-engine operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;
