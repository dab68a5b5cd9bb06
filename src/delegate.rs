//! The callback surface applications use to receive connection- and
//! stream-level events (spec §6). Both traits are plain synchronous
//! dispatch — "post an event somewhere", not "run application logic
//! in-line" — so that the connection executor (spec §5) is never blocked
//! waiting on application code. An implementation that does real work in
//! response to a callback should hand it off (to a channel, a task) rather
//! than doing it on the call itself.
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{ConnectionError, StreamError};
use crate::frame::HeaderList;

/// One event delivered to a single stream's delegate, in the order the
/// engine observed the underlying frames (spec §5: "response headers
/// before any data payload before end").
#[derive(Debug, Clone)]
pub enum RequestEvent {
    Response(HeaderList),
    Data(Bytes),
    Error(StreamError),
    End,
}

/// One event delivered to a connection's delegate.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Error(ConnectionError),
}

/// Receives events for one stream.
pub trait RequestDelegate: Send + Sync + 'static {
    fn on_response(&self, headers: HeaderList);
    fn on_data(&self, data: Bytes);
    fn on_error(&self, error: StreamError);
    fn on_end(&self);
}

/// Receives connection-level events.
pub trait ConnectionDelegate: Send + Sync + 'static {
    fn on_connection_error(&self, error: ConnectionError);
}

/// An `UnboundedSender` is itself a valid delegate: each callback becomes
/// one enqueued event, exactly matching "any async notification channel
/// suffices" (spec §1). A dropped receiver just means nobody is listening
/// any more, which is not this crate's problem to report.
impl RequestDelegate for UnboundedSender<RequestEvent> {
    fn on_response(&self, headers: HeaderList) {
        let _ = self.send(RequestEvent::Response(headers));
    }

    fn on_data(&self, data: Bytes) {
        let _ = self.send(RequestEvent::Data(data));
    }

    fn on_error(&self, error: StreamError) {
        let _ = self.send(RequestEvent::Error(error));
    }

    fn on_end(&self) {
        let _ = self.send(RequestEvent::End);
    }
}

impl ConnectionDelegate for UnboundedSender<ConnectionEvent> {
    fn on_connection_error(&self, error: ConnectionError) {
        let _ = self.send(ConnectionEvent::Error(error));
    }
}
