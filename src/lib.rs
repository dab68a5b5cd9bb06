//! A client-side implementation of the SPDY protocol, versions 2 and 3: a
//! multiplexed, compressed, binary request/response protocol over a single
//! connection to one server.
//!
//! The crate owns the connection-level multiplexer — frame codec, write
//! scheduler, stream lifecycle, and per-stream flow control — and treats
//! the transport, TLS, and header-block compression dictionary as the only
//! things it needs from outside (see [`transport`] and [`header_codec`]).
//!
//! ```rust,no_run
//! use spdy_client::{Connection, ProtocolVersion, Request};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let socket = TcpStream::connect("example.com:443").await?;
//!     let (delegate_tx, mut delegate_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let connection = Connection::open(ProtocolVersion::V3, socket, delegate_tx).await;
//!
//!     let (request_tx, mut request_rx) = tokio::sync::mpsc::unbounded_channel();
//!     let request = Request::new("GET", "https://example.com/", vec![]);
//!     request.set_delegate(request_tx);
//!     connection.send(request.clone()).await.ok();
//!     request.end();
//!
//!     while let Some(event) = request_rx.recv().await {
//!         println!("{event:?}");
//!     }
//!     let _ = delegate_rx;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod delegate;
pub mod error;
pub mod frame;
pub mod header_codec;
pub mod request;
pub mod stream_table;
pub mod transport;
pub mod version;

pub use connection::Connection;
pub use delegate::{ConnectionDelegate, ConnectionEvent, RequestDelegate, RequestEvent};
pub use error::{ConnectionError, ConnectionResult, RequestError, StreamError};
pub use frame::HeaderList;
pub use request::Request;
pub use transport::Transport;
pub use version::ProtocolVersion;
