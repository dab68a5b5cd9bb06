//! The application-facing handle for one logical stream (spec §3
//! "Request"). A `Request` is constructed inert — no stream id, no
//! connection — and only becomes live once handed to
//! [`crate::connection::Connection::send`].

use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::connection::EngineCommand;
use crate::delegate::RequestDelegate;
use crate::error::RequestError;
use crate::frame::HeaderList;

struct Binding {
    stream_id: u32,
    commands: tokio::sync::mpsc::UnboundedSender<EngineCommand>,
}

/// One HTTP-ish request/response exchange multiplexed over a `Connection`.
///
/// Held by the application as an `Arc<Request>` so that both the
/// application and the connection engine's stream table can refer to the
/// same object; the engine's half of that reference is non-owning in
/// spirit (spec §9 "weak back-reference") even though it is technically an
/// `Arc` clone, because what actually matters — whether calls on this
/// handle still reach a live stream — is governed by `binding`, which the
/// engine clears at teardown.
pub struct Request {
    pub method: String,
    pub url: String,
    pub headers: HeaderList,
    binding: RwLock<Option<Binding>>,
    delegate: RwLock<Option<Box<dyn RequestDelegate>>>,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>, headers: HeaderList) -> Arc<Request> {
        Arc::new(Request {
            method: method.into(),
            url: url.into(),
            headers,
            binding: RwLock::new(None),
            delegate: RwLock::new(None),
        })
    }

    pub fn set_delegate(&self, delegate: impl RequestDelegate) {
        *self.delegate.write().unwrap() = Some(Box::new(delegate));
    }

    /// The stream id assigned by `send`, if this request is currently
    /// live. `None` both before `send` and after teardown.
    pub fn stream_id(&self) -> Option<u32> {
        self.binding.read().unwrap().as_ref().map(|b| b.stream_id)
    }

    /// Queues `data` for this stream. A no-op if the request has not been
    /// sent yet, or has already been torn down.
    pub fn write(&self, data: impl Into<Bytes>) {
        let data = data.into();
        self.send_command(|stream_id| EngineCommand::WriteData { stream_id, data });
    }

    /// Requests a graceful half-close from our side (spec §4.E `end`). A
    /// no-op if unbound.
    pub fn end(&self) {
        self.send_command(|stream_id| EngineCommand::End { stream_id });
    }

    /// Unilaterally aborts the stream (spec §4.E `close`). A no-op if
    /// unbound; idempotent if called more than once.
    pub fn close(&self) {
        self.send_command(|stream_id| EngineCommand::Close { stream_id });
    }

    fn send_command(&self, make: impl FnOnce(u32) -> EngineCommand) {
        let guard = self.binding.read().unwrap();
        if let Some(binding) = guard.as_ref() {
            let _ = binding.commands.send(make(binding.stream_id));
        }
    }

    /// Binds this request to a connection. Returns `AlreadySent` if it is
    /// already bound; only the engine calls this, and only once per
    /// `send`.
    pub(crate) fn bind(&self, stream_id: u32, commands: tokio::sync::mpsc::UnboundedSender<EngineCommand>) -> Result<(), RequestError> {
        let mut guard = self.binding.write().unwrap();
        if guard.is_some() {
            return Err(RequestError::AlreadySent);
        }
        *guard = Some(Binding { stream_id, commands });
        Ok(())
    }

    /// Clears the back-reference at stream teardown (spec §9). Idempotent.
    pub(crate) fn unbind(&self) {
        *self.binding.write().unwrap() = None;
    }

    pub(crate) fn notify_response(&self, headers: HeaderList) {
        if let Some(delegate) = self.delegate.read().unwrap().as_ref() {
            delegate.on_response(headers);
        }
    }

    pub(crate) fn notify_data(&self, data: Bytes) {
        if let Some(delegate) = self.delegate.read().unwrap().as_ref() {
            delegate.on_data(data);
        }
    }

    pub(crate) fn notify_error(&self, error: crate::error::StreamError) {
        if let Some(delegate) = self.delegate.read().unwrap().as_ref() {
            delegate.on_error(error);
        }
    }

    pub(crate) fn notify_end(&self) {
        if let Some(delegate) = self.delegate.read().unwrap().as_ref() {
            delegate.on_end();
        }
    }
}
