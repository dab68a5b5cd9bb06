//! The transport contract the connection engine requires (spec §6):
//! a duplex byte stream, opened and torn down by the caller. Dialing the
//! TCP socket and negotiating TLS are both out of scope (spec §1) — this
//! crate consumes an already-connected transport rather than creating one.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that can be read from and written to asynchronously satisfies
/// the transport contract. `TcpStream` and any TLS wrapper around one
/// (`tokio_rustls::TlsStream`, `tokio_native_tls::TlsStream`, ...) already
/// implement both halves, so no adapter is needed in the common case.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
