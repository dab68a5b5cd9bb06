//! The connection engine: the state machine that owns the header codec,
//! framer, write buffer and stream table, and drives them from both
//! application calls and inbound frames (spec §4.E).
//!
//! Everything here runs on one task — the "connection executor" of spec
//! §5 — reached only through [`EngineCommand`]s sent over a channel.
//! `Connection` itself is just a thin handle wrapping the sending half.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::delegate::ConnectionDelegate;
use crate::error::{ConnectionError, ConnectionResult, RequestError, StreamError};
use crate::frame::control::RstStatusCode;
use crate::frame::data::MAX_PAYLOAD_LEN;
use crate::frame::{FrameEvent, FrameParser, Framer, HeaderList};
use crate::header_codec::HeaderCodec;
use crate::request::Request;
use crate::stream_table::{StreamState, StreamTable, DEFAULT_WINDOW};
use crate::transport::Transport;
use crate::version::ProtocolVersion;

/// Commands the application-facing [`Connection`]/[`Request`] handles send
/// to the engine task. Everything here "enqueues onto the serial executor"
/// (spec §5) rather than mutating engine state directly.
pub(crate) enum EngineCommand {
    Send { request: Arc<Request>, reply: oneshot::Sender<Result<(), RequestError>> },
    WriteData { stream_id: u32, data: Bytes },
    End { stream_id: u32 },
    Close { stream_id: u32 },
    LiveStreamCount(oneshot::Sender<usize>),
    Shutdown,
}

/// Application handle for one SPDY connection.
///
/// Cloning is cheap (it's a channel sender); every clone reaches the same
/// underlying engine task.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl Connection {
    /// Starts the connection engine over an already-open `transport` and
    /// returns a handle to it. If `version` is SPDY/3, advertises our
    /// initial window via SETTINGS before processing anything else (spec
    /// §4.E `connect`).
    pub async fn open<T, D>(version: ProtocolVersion, transport: T, delegate: D) -> Connection
    where
        T: Transport,
        D: ConnectionDelegate,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine {
            version,
            transport,
            header_codec: HeaderCodec::new(version),
            framer: Framer::new(version),
            parser: FrameParser::new(version),
            write_buffer: crate::write_buffer::WriteBuffer::new(),
            streams: StreamTable::new(),
            next_stream_id: 1,
            initial_peer_window: DEFAULT_WINDOW,
            closed: false,
            delegate,
            commands: rx,
            command_sender: tx.clone(),
            read_buf: BytesMut::with_capacity(4096),
        };
        tokio::spawn(engine.run());
        Connection { commands: tx }
    }

    /// Binds `request` to this connection, assigns it a stream id, and
    /// emits `SYN_STREAM`. Fails with `AlreadySent` if `request` is already
    /// bound to a connection (this one or another).
    pub async fn send(&self, request: Arc<Request>) -> Result<(), RequestError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(EngineCommand::Send { request, reply: reply_tx }).is_err() {
            // The engine task has already exited (connection closed). There
            // is no dedicated error for that in this client's vocabulary
            // (spec §7 only defines `AlreadySent` as a per-call error), and
            // the practical effect is identical: the request never got
            // bound to anything.
            return Err(RequestError::AlreadySent);
        }
        reply_rx.await.unwrap_or(Err(RequestError::AlreadySent))
    }

    /// Number of streams currently tracked by the engine. Meant for
    /// diagnostics/tests, not for driving protocol decisions from the
    /// application side (the engine's view can be stale the instant it is
    /// read).
    pub async fn live_stream_count(&self) -> Option<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(EngineCommand::LiveStreamCount(reply_tx)).is_err() {
            return None;
        }
        reply_rx.await.ok()
    }

    /// Proactively closes the connection: every live stream sees one error
    /// followed by one end, the connection delegate sees one error, and the
    /// transport is shut down. A convenience wrapper over the same fatal
    /// teardown path a transport error or parse failure would trigger.
    pub fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
    }
}

struct Engine<T, D> {
    version: ProtocolVersion,
    transport: T,
    header_codec: HeaderCodec,
    framer: Framer,
    parser: FrameParser,
    write_buffer: crate::write_buffer::WriteBuffer,
    streams: StreamTable,
    next_stream_id: u32,
    initial_peer_window: i64,
    closed: bool,
    delegate: D,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    command_sender: mpsc::UnboundedSender<EngineCommand>,
    read_buf: BytesMut,
}

impl<T, D> Engine<T, D>
where
    T: Transport,
    D: ConnectionDelegate,
{
    async fn run(mut self) {
        if self.version.has_flow_control() {
            if let Err(err) = self.advertise_initial_window().await {
                self.fatal(err).await;
                return;
            }
        }

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if let Err(err) = self.handle_command(cmd).await {
                                self.fatal(err).await;
                                return;
                            }
                        }
                        None => {
                            // Every Connection/Request handle has been
                            // dropped; there is nobody left to notify, so
                            // this is a quiet shutdown rather than a fatal
                            // error delivered to a delegate nobody is
                            // reading any more.
                            debug!("all connection handles dropped, shutting down");
                            let _ = self.transport.shutdown().await;
                            return;
                        }
                    }
                }
                result = self.read_frame_events() => {
                    match result {
                        Ok(Some(events)) => {
                            for event in events {
                                if let Err(err) = self.dispatch(event).await {
                                    self.fatal(err).await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            self.fatal(ConnectionError::ConnectionEnd).await;
                            return;
                        }
                        Err(err) => {
                            self.fatal(err).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn advertise_initial_window(&mut self) -> ConnectionResult<()> {
        self.framer.clear();
        self.framer.settings_initial_window(DEFAULT_WINDOW as u32);
        self.flush_framer().await
    }

    async fn read_frame_events(&mut self) -> ConnectionResult<Option<Vec<FrameEvent>>> {
        let n = self.transport.read_buf(&mut self.read_buf).await.map_err(ConnectionError::Transport)?;
        if n == 0 {
            return Ok(None);
        }
        let events = self.parser.execute(&mut self.read_buf)?;
        Ok(Some(events))
    }

    async fn handle_command(&mut self, cmd: EngineCommand) -> ConnectionResult<()> {
        match cmd {
            EngineCommand::Send { request, reply } => {
                let result = self.do_send(request).await?;
                let _ = reply.send(result);
                Ok(())
            }
            EngineCommand::WriteData { stream_id, data } => self.outbound_data(stream_id, data).await,
            EngineCommand::End { stream_id } => self.end_stream(stream_id).await,
            EngineCommand::Close { stream_id } => self.close_stream(stream_id).await,
            EngineCommand::LiveStreamCount(reply) => {
                let _ = reply.send(self.streams.len());
                Ok(())
            }
            EngineCommand::Shutdown => Err(ConnectionError::ConnectionEnd),
        }
    }

    async fn do_send(&mut self, request: Arc<Request>) -> ConnectionResult<Result<(), RequestError>> {
        let stream_id = self.next_stream_id;
        // Checked before binding: if the id space is exhausted this send
        // never happens at all, rather than leaving `request` bound to a
        // stream id that was never inserted into the table (and so would
        // never be notified by `fatal`'s teardown sweep).
        let next = self.next_stream_id.checked_add(2).ok_or(ConnectionError::StreamIdExhausted)?;
        if let Err(err) = request.bind(stream_id, self.command_sender.clone()) {
            return Ok(Err(err));
        }
        self.next_stream_id = next;

        let headers = build_syn_stream_headers(self.version, &request);
        let compressed = self.header_codec.encode(&headers)?;
        self.framer.clear();
        self.framer.syn_stream(stream_id, &compressed);
        self.flush_framer().await?;

        debug!(stream_id, method = %request.method, url = %request.url, "SYN_STREAM sent");
        self.streams.insert(stream_id, StreamState::new(request, self.initial_peer_window));
        Ok(Ok(()))
    }

    /// Outbound data and flow control (spec §4.E). SPDY/2 has no windows:
    /// every write goes straight out as one or more DATA frames.
    async fn outbound_data(&mut self, stream_id: u32, data: Bytes) -> ConnectionResult<()> {
        let closed = match self.streams.get(stream_id) {
            Some(s) => s.closed_by_us || s.pending_closed_by_us,
            None => return Ok(()),
        };
        // Invariant §3.4: no DATA frame after `closed_by_us`. A half-close
        // already requested (even if deferred behind flow control) means
        // the same thing: nothing more is meant to go out on this stream.
        if closed {
            return Ok(());
        }
        if !self.version.has_flow_control() {
            return self.emit_data_frame(stream_id, false, &data).await;
        }
        self.send_v3_data(stream_id, data).await?;
        self.maybe_fire_pending_end(stream_id).await
    }

    /// Sends as much of `bytes` as the current send window allows,
    /// queueing any remainder on the back of `data_queue` (this is a fresh
    /// write, not a drain, so FIFO order puts it after anything already
    /// queued).
    async fn send_v3_data(&mut self, stream_id: u32, mut bytes: Bytes) -> ConnectionResult<()> {
        let window_out = match self.streams.get(stream_id) {
            Some(s) => s.window_out,
            None => return Ok(()),
        };
        if window_out <= 0 {
            if let Some(s) = self.streams.get_mut(stream_id) {
                s.data_queue.push_back(bytes);
            }
            return Ok(());
        }
        let send_len = (window_out as usize).min(bytes.len());
        let to_send = bytes.split_to(send_len);
        self.emit_data_frame(stream_id, false, &to_send).await?;
        if let Some(s) = self.streams.get_mut(stream_id) {
            s.window_out -= send_len as i64;
        }
        if !bytes.is_empty() {
            if let Some(s) = self.streams.get_mut(stream_id) {
                s.data_queue.push_back(bytes);
            }
        }
        Ok(())
    }

    /// Drains `data_queue` in FIFO order until either it is empty or the
    /// window returns to zero (spec §4.E: fires whenever `window_out`
    /// transitions positive). Any leftover remainder goes back on the
    /// *front* of the queue, since it is the head of what's left to send.
    async fn drain_data_queue(&mut self, stream_id: u32) -> ConnectionResult<()> {
        loop {
            let (window_out, front) = match self.streams.get_mut(stream_id) {
                Some(s) => (s.window_out, s.data_queue.pop_front()),
                None => return Ok(()),
            };
            let Some(mut bytes) = front else { break };
            if window_out <= 0 {
                if let Some(s) = self.streams.get_mut(stream_id) {
                    s.data_queue.push_front(bytes);
                }
                break;
            }
            let send_len = (window_out as usize).min(bytes.len());
            let to_send = bytes.split_to(send_len);
            self.emit_data_frame(stream_id, false, &to_send).await?;
            if let Some(s) = self.streams.get_mut(stream_id) {
                s.window_out -= send_len as i64;
            }
            if !bytes.is_empty() {
                if let Some(s) = self.streams.get_mut(stream_id) {
                    s.data_queue.push_front(bytes);
                }
                break;
            }
        }
        self.maybe_fire_pending_end(stream_id).await
    }

    async fn maybe_fire_pending_end(&mut self, stream_id: u32) -> ConnectionResult<()> {
        let should_fire = match self.streams.get(stream_id) {
            Some(s) => s.pending_closed_by_us && s.data_queue.is_empty(),
            None => false,
        };
        if should_fire {
            if let Some(s) = self.streams.get_mut(stream_id) {
                s.pending_closed_by_us = false;
            }
            self.end_stream(stream_id).await?;
        }
        Ok(())
    }

    /// Graceful half-close (spec §4.E `end`).
    async fn end_stream(&mut self, stream_id: u32) -> ConnectionResult<()> {
        let (closed_by_us, pending, queue_empty) = match self.streams.get(stream_id) {
            Some(s) => (s.closed_by_us, s.pending_closed_by_us, s.data_queue.is_empty()),
            None => return Ok(()),
        };
        if closed_by_us || pending {
            return Ok(());
        }
        if !queue_empty {
            if let Some(s) = self.streams.get_mut(stream_id) {
                s.pending_closed_by_us = true;
            }
            return Ok(());
        }
        self.emit_data_frame(stream_id, true, &[]).await?;
        if let Some(s) = self.streams.get_mut(stream_id) {
            s.closed_by_us = true;
        }
        self.maybe_teardown(stream_id);
        Ok(())
    }

    /// Unilateral abort (spec §4.E `close`). Idempotent: a second call
    /// finds nothing left in the table and does nothing.
    async fn close_stream(&mut self, stream_id: u32) -> ConnectionResult<()> {
        let closed_by_us = match self.streams.get(stream_id) {
            Some(s) => s.closed_by_us,
            None => return Ok(()),
        };
        if !closed_by_us {
            self.framer.clear();
            self.framer.rst_stream(stream_id, RstStatusCode::Cancel);
            self.flush_framer().await?;
        }
        if let Some(state) = self.streams.remove(stream_id) {
            state.request.notify_error(StreamError::Cancelled);
            state.request.notify_end();
            state.request.unbind();
        }
        Ok(())
    }

    /// Tears down a stream once both sides have half-closed. Safe to call
    /// when that isn't yet true; it simply does nothing.
    /// Tears down once the peer is done (`closed_by_them`) and our side has
    /// nothing left outstanding: either we already half-closed explicitly
    /// (`closed_by_us`), or we never had anything queued and no half-close
    /// is pending, in which case a finished response closes the stream the
    /// same way an explicit `end()` would have (spec §8 scenario 1: a
    /// request with no body never calls `end()` itself). A deferred
    /// half-close (`pending_closed_by_us`) or a non-empty `data_queue`
    /// means we still intend to send more, so teardown waits.
    fn maybe_teardown(&mut self, stream_id: u32) {
        let should = matches!(
            self.streams.get(stream_id),
            Some(s) if s.closed_by_them && (s.closed_by_us || (!s.pending_closed_by_us && s.data_queue.is_empty()))
        );
        if should {
            if let Some(state) = self.streams.remove(stream_id) {
                state.request.notify_end();
                state.request.unbind();
            }
        }
    }

    async fn dispatch(&mut self, event: FrameEvent) -> ConnectionResult<()> {
        match event {
            FrameEvent::SynReply { stream_id, is_fin, compressed_headers } => {
                self.dispatch_syn_reply(stream_id, is_fin, compressed_headers).await
            }
            FrameEvent::Data { stream_id, is_fin, payload } => {
                self.dispatch_data(stream_id, is_fin, payload).await
            }
            FrameEvent::RstStream { stream_id, status } => {
                trace!(stream_id, ?status, "RST_STREAM received");
                if let Some(state) = self.streams.remove(stream_id) {
                    state.request.notify_error(StreamError::RstStream(status));
                    state.request.notify_end();
                    state.request.unbind();
                }
                Ok(())
            }
            FrameEvent::WindowUpdate { stream_id, delta } => {
                if let Some(s) = self.streams.get_mut(stream_id) {
                    s.window_out += delta as i64;
                }
                self.drain_data_queue(stream_id).await
            }
            FrameEvent::Settings { initial_window } => self.apply_settings(initial_window).await,
        }
    }

    async fn dispatch_syn_reply(&mut self, stream_id: u32, is_fin: bool, compressed_headers: Bytes) -> ConnectionResult<()> {
        if !self.streams.contains(stream_id) {
            self.reject_unknown_stream(stream_id).await?;
            return Err(ConnectionError::Protocol(format!("SYN_REPLY for unknown stream {stream_id}")));
        }
        let headers = self.header_codec.decode(&compressed_headers)?;
        let seen_response = self.streams.get(stream_id).map(|s| s.seen_response).unwrap_or(false);
        if seen_response {
            self.framer.clear();
            self.framer.rst_stream(stream_id, RstStatusCode::ProtocolError);
            self.flush_framer().await?;
            if let Some(state) = self.streams.remove(stream_id) {
                state.request.notify_error(StreamError::DoubleResponse);
                state.request.notify_end();
                state.request.unbind();
            }
            return Ok(());
        }
        if let Some(s) = self.streams.get_mut(stream_id) {
            s.seen_response = true;
        }
        if let Some(s) = self.streams.get(stream_id) {
            s.request.notify_response(headers);
        }
        self.drain_data_queue(stream_id).await?;
        self.apply_fin(stream_id, is_fin);
        Ok(())
    }

    async fn dispatch_data(&mut self, stream_id: u32, is_fin: bool, payload: Bytes) -> ConnectionResult<()> {
        if !self.streams.contains(stream_id) {
            self.reject_unknown_stream(stream_id).await?;
            return Err(ConnectionError::Protocol(format!("DATA for unknown stream {stream_id}")));
        }
        if self.version.has_flow_control() {
            self.account_inbound_data(stream_id, payload.len()).await?;
        }
        if let Some(s) = self.streams.get(stream_id) {
            s.request.notify_data(payload);
        }
        self.apply_fin(stream_id, is_fin);
        Ok(())
    }

    async fn apply_settings(&mut self, initial_window: Option<u32>) -> ConnectionResult<()> {
        let Some(new_initial) = initial_window else { return Ok(()) };
        let delta = new_initial as i64 - self.initial_peer_window;
        self.initial_peer_window = new_initial as i64;
        let ids: Vec<u32> = self.streams.iter_mut().map(|(id, _)| *id).collect();
        for (_, state) in self.streams.iter_mut() {
            state.window_out += delta;
        }
        for id in ids {
            self.drain_data_queue(id).await?;
        }
        Ok(())
    }

    async fn account_inbound_data(&mut self, stream_id: u32, len: usize) -> ConnectionResult<()> {
        let window_in = match self.streams.get_mut(stream_id) {
            Some(s) => {
                s.window_in -= len as i64;
                s.window_in
            }
            None => return Ok(()),
        };
        if window_in <= 0 {
            let delta = (DEFAULT_WINDOW - window_in) as u32;
            self.framer.clear();
            self.framer.window_update(stream_id, delta);
            self.flush_framer().await?;
            if let Some(s) = self.streams.get_mut(stream_id) {
                s.window_in += delta as i64;
            }
        }
        Ok(())
    }

    fn apply_fin(&mut self, stream_id: u32, is_fin: bool) {
        if !is_fin {
            return;
        }
        if let Some(s) = self.streams.get_mut(stream_id) {
            s.closed_by_them = true;
        }
        self.maybe_teardown(stream_id);
    }

    async fn reject_unknown_stream(&mut self, stream_id: u32) -> ConnectionResult<()> {
        warn!(stream_id, "frame for unknown stream, resetting");
        self.framer.clear();
        self.framer.rst_stream(stream_id, RstStatusCode::ProtocolError);
        self.flush_framer().await
    }

    /// Emits `payload` as one DATA frame, or — if it doesn't fit the
    /// wire's 24-bit length field — as a run of frames each capped at
    /// `data::MAX_PAYLOAD_LEN`, with `fin` only on the last one. Nothing
    /// upstream of this (flow control, the pending-end queue) needs to
    /// know frames have a size limit; this is the one place that does.
    async fn emit_data_frame(&mut self, stream_id: u32, fin: bool, payload: &[u8]) -> ConnectionResult<()> {
        if payload.len() <= MAX_PAYLOAD_LEN {
            self.framer.clear();
            self.framer.data(stream_id, fin, payload);
            return self.flush_framer().await;
        }
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + MAX_PAYLOAD_LEN).min(payload.len());
            let is_last_chunk = end == payload.len();
            self.framer.clear();
            self.framer.data(stream_id, fin && is_last_chunk, &payload[offset..end]);
            self.flush_framer().await?;
            offset = end;
        }
        Ok(())
    }

    async fn flush_framer(&mut self) -> ConnectionResult<()> {
        let bytes = Bytes::copy_from_slice(self.framer.output());
        self.write_buffer.enqueue(bytes);
        self.write_buffer.drain(&mut self.transport).await.map_err(ConnectionError::Transport)
    }

    async fn fatal(&mut self, error: ConnectionError) {
        if self.closed {
            return;
        }
        self.closed = true;
        warn!(error = %error, "connection closed");
        for (_, state) in self.streams.drain() {
            state.request.notify_error(StreamError::ConnectionClosed(error.to_string()));
            state.request.notify_end();
            state.request.unbind();
        }
        self.delegate.on_connection_error(error);
        let _ = self.transport.shutdown().await;
    }
}

/// Builds the pseudo-header set SYN_STREAM carries for `request`, per
/// version (spec §4.B): SPDY/3 splits the URL into `:scheme`/`:host`/
/// `:path`; SPDY/2 keeps a flat `url`.
fn build_syn_stream_headers(version: ProtocolVersion, request: &Request) -> HeaderList {
    let url = ParsedUrl::parse(&request.url);
    let mut headers = Vec::with_capacity(request.headers.len() + 5);
    match version {
        ProtocolVersion::V3 => {
            headers.push((":method".to_string(), request.method.clone()));
            headers.push((":scheme".to_string(), url.scheme));
            headers.push((":host".to_string(), url.host));
            headers.push((":path".to_string(), url.path));
            headers.push((":version".to_string(), "HTTP/1.1".to_string()));
        }
        ProtocolVersion::V2 => {
            headers.push(("method".to_string(), request.method.clone()));
            headers.push(("url".to_string(), request.url.clone()));
            headers.push(("version".to_string(), "HTTP/1.1".to_string()));
            headers.push(("scheme".to_string(), url.scheme));
            headers.push(("host".to_string(), url.host));
        }
    }
    headers.extend(request.headers.iter().cloned());
    headers
}

struct ParsedUrl {
    scheme: String,
    host: String,
    path: String,
}

impl ParsedUrl {
    fn parse(url: &str) -> ParsedUrl {
        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (scheme.to_string(), rest),
            None => (String::new(), url),
        };
        let (host, path) = match rest.find('/') {
            Some(idx) => (rest[..idx].to_string(), rest[idx..].to_string()),
            None => (rest.to_string(), "/".to_string()),
        };
        ParsedUrl { scheme, host, path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_https_url() {
        let parsed = ParsedUrl::parse("https://example.com/a/b?c=1");
        assert_eq!(parsed.scheme, "https");
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.path, "/a/b?c=1");
    }

    #[test]
    fn defaults_to_root_path_when_url_has_no_path() {
        let parsed = ParsedUrl::parse("https://example.com");
        assert_eq!(parsed.path, "/");
    }

    #[test]
    fn v3_headers_use_pseudo_header_names() {
        let req = Request::new("GET", "https://h/x", vec![("accept".to_string(), "*/*".to_string())]);
        let headers = build_syn_stream_headers(ProtocolVersion::V3, &req);
        assert!(headers.contains(&(":method".to_string(), "GET".to_string())));
        assert!(headers.contains(&(":path".to_string(), "/x".to_string())));
        assert!(headers.contains(&("accept".to_string(), "*/*".to_string())));
    }

    #[test]
    fn v2_headers_use_flat_names() {
        let req = Request::new("GET", "https://h/x", vec![]);
        let headers = build_syn_stream_headers(ProtocolVersion::V2, &req);
        assert!(headers.contains(&("url".to_string(), "https://h/x".to_string())));
        assert!(headers.contains(&("method".to_string(), "GET".to_string())));
    }
}

/// End-to-end scenarios against the live engine, using `tokio::io::duplex`
/// in place of the TLS/TCP transport (spec §8). Each test plays the "peer"
/// side by hand: it reads the raw bytes the engine writes and asserts on
/// them directly (frame headers are fixed-width, so there is no need to
/// route them back through `FrameParser`), and injects frames using either
/// a standalone `Framer` or, for SYN_REPLY, a hand-rolled encoder (the real
/// `Framer` never builds one — a client never sends its own response).
#[cfg(test)]
mod engine_tests {
    use super::*;
    use crate::delegate::{ConnectionEvent, RequestEvent};
    use crate::frame::control::ControlFrameType;
    use crate::frame::data::FLAG_FIN;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// One raw frame off the wire: `(word0, word1, body)`, matching spec
    /// §4.B's 8-byte header layout for both control and data frames.
    async fn read_raw_frame(io: &mut DuplexStream) -> (u32, u32, Vec<u8>) {
        let mut header = [0u8; 8];
        io.read_exact(&mut header).await.expect("frame header");
        let word0 = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let word1 = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let length = (word1 & 0x00ff_ffff) as usize;
        let mut body = vec![0u8; length];
        io.read_exact(&mut body).await.expect("frame body");
        (word0, word1, body)
    }

    fn is_control(word0: u32) -> bool {
        word0 & 0x8000_0000 != 0
    }

    fn control_type(word0: u32) -> u32 {
        word0 & 0xffff
    }

    fn flags_of(word1: u32) -> u8 {
        (word1 >> 24) as u8
    }

    /// Hand-builds a SYN_REPLY frame: not something the engine's own
    /// `Framer` ever needs to do (a client never sends its own response),
    /// but the test's stand-in for the peer does.
    fn encode_syn_reply(version: ProtocolVersion, stream_id: u32, fin: bool, compressed_headers: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
        if version == ProtocolVersion::V2 {
            body.extend_from_slice(&[0, 0]); // unused, per the V2 header_start=6 layout
        }
        body.extend_from_slice(compressed_headers);
        let flags: u8 = if fin { FLAG_FIN } else { 0 };
        let word0 = 0x8000_0000u32 | ((version.wire_version() as u32) << 16) | (ControlFrameType::SynReply as u16 as u32);
        let word1 = ((flags as u32) << 24) | (body.len() as u32 & 0x00ff_ffff);
        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&word0.to_be_bytes());
        frame.extend_from_slice(&word1.to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    struct Harness {
        connection: Connection,
        peer: DuplexStream,
        peer_codec: HeaderCodec,
        conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    async fn setup(version: ProtocolVersion) -> Harness {
        let (client_io, peer) = duplex(1 << 20);
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let connection = Connection::open(version, client_io, conn_tx).await;
        Harness { connection, peer, peer_codec: HeaderCodec::new(version), conn_rx }
    }

    impl Harness {
        /// Reads and sanity-checks the SETTINGS frame SPDY/3 advertises on
        /// connect (spec §4.E `connect`); a no-op for SPDY/2.
        async fn drain_initial_settings(&mut self, version: ProtocolVersion) {
            if !version.has_flow_control() {
                return;
            }
            let (word0, _word1, body) = read_raw_frame(&mut self.peer).await;
            assert!(is_control(word0));
            assert_eq!(control_type(word0), ControlFrameType::Settings as u16 as u32);
            assert_eq!(u32::from_be_bytes(body[4..8].try_into().unwrap()), 65536);
        }

        fn new_request(&self) -> (Arc<Request>, mpsc::UnboundedReceiver<RequestEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let request = Request::new("GET", "https://h/x", vec![]);
            request.set_delegate(tx);
            (request, rx)
        }

        async fn expect_syn_stream(&mut self, expected_stream_id: u32, expected_fin: bool) {
            let (word0, word1, body) = read_raw_frame(&mut self.peer).await;
            assert!(is_control(word0));
            assert_eq!(control_type(word0), ControlFrameType::SynStream as u16 as u32);
            assert_eq!(flags_of(word1) & FLAG_FIN != 0, expected_fin);
            let stream_id = u32::from_be_bytes(body[0..4].try_into().unwrap()) & 0x7fff_ffff;
            assert_eq!(stream_id, expected_stream_id);
        }

        /// Reads one raw frame and asserts it is a DATA frame for
        /// `expected_stream_id`, returning `(payload_len, fin)`.
        async fn expect_data(&mut self, expected_stream_id: u32) -> (usize, bool) {
            let (word0, word1, body) = read_raw_frame(&mut self.peer).await;
            assert!(!is_control(word0), "expected a DATA frame, got a control frame");
            assert_eq!(word0 & 0x7fff_ffff, expected_stream_id);
            (body.len(), flags_of(word1) & FLAG_FIN != 0)
        }

        async fn expect_rst_stream(&mut self, expected_stream_id: u32, expected_status: RstStatusCode) {
            let (word0, _word1, body) = read_raw_frame(&mut self.peer).await;
            assert!(is_control(word0));
            assert_eq!(control_type(word0), ControlFrameType::RstStream as u16 as u32);
            let stream_id = u32::from_be_bytes(body[0..4].try_into().unwrap()) & 0x7fff_ffff;
            assert_eq!(stream_id, expected_stream_id);
            let status = RstStatusCode::from_u32(u32::from_be_bytes(body[4..8].try_into().unwrap()));
            assert_eq!(status, expected_status);
        }

        /// Asserts that the peer has nothing more to read within a short
        /// window — used to show a frame was *not* emitted (e.g. a deferred
        /// half-close).
        async fn expect_silence(&mut self) {
            let mut buf = [0u8; 1];
            let result = tokio::time::timeout(Duration::from_millis(50), self.peer.read(&mut buf)).await;
            assert!(result.is_err(), "expected no bytes on the wire, but got some");
        }

        async fn inject(&mut self, bytes: &[u8]) {
            self.peer.write_all(bytes).await.unwrap();
        }

        async fn inject_syn_reply(&mut self, version: ProtocolVersion, stream_id: u32, fin: bool, headers: &HeaderList) {
            let compressed = self.peer_codec.encode(headers).unwrap();
            let frame = encode_syn_reply(version, stream_id, fin, &compressed);
            self.inject(&frame).await;
        }

        async fn inject_data(&mut self, version: ProtocolVersion, stream_id: u32, fin: bool, payload: &[u8]) {
            let mut framer = Framer::new(version);
            framer.data(stream_id, fin, payload);
            let bytes = framer.output().to_vec();
            self.inject(&bytes).await;
        }

        async fn inject_rst_stream(&mut self, version: ProtocolVersion, stream_id: u32, status: RstStatusCode) {
            let mut framer = Framer::new(version);
            framer.rst_stream(stream_id, status);
            let bytes = framer.output().to_vec();
            self.inject(&bytes).await;
        }

        async fn inject_window_update(&mut self, version: ProtocolVersion, stream_id: u32, delta: u32) {
            let mut framer = Framer::new(version);
            framer.window_update(stream_id, delta);
            let bytes = framer.output().to_vec();
            self.inject(&bytes).await;
        }

        async fn inject_settings_initial_window(&mut self, version: ProtocolVersion, initial_window: u32) {
            let mut framer = Framer::new(version);
            framer.settings_initial_window(initial_window);
            let bytes = framer.output().to_vec();
            self.inject(&bytes).await;
        }
    }

    // Scenario 1 (spec §8): V3 GET, inline response.
    #[tokio::test]
    async fn scenario_v3_get_inline_response() {
        let mut h = setup(ProtocolVersion::V3).await;
        h.drain_initial_settings(ProtocolVersion::V3).await;

        let (request, mut events) = h.new_request();
        h.connection.send(request).await.unwrap();
        h.expect_syn_stream(1, false).await;

        let headers: HeaderList = vec![(":status".to_string(), "200".to_string())];
        h.inject_syn_reply(ProtocolVersion::V3, 1, false, &headers).await;
        h.inject_data(ProtocolVersion::V3, 1, true, b"hi").await;

        match events.recv().await {
            Some(RequestEvent::Response(got)) => assert_eq!(got, headers),
            other => panic!("expected Response, got {other:?}"),
        }
        match events.recv().await {
            Some(RequestEvent::Data(d)) => assert_eq!(&d[..], b"hi"),
            other => panic!("expected Data, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(RequestEvent::End)));

        assert_eq!(h.connection.live_stream_count().await, Some(0));
    }

    // Scenario 2 (spec §8): V3 flow control across two writes and a partial
    // WINDOW_UPDATE.
    #[tokio::test]
    async fn scenario_v3_flow_control_across_writes() {
        let mut h = setup(ProtocolVersion::V3).await;
        h.drain_initial_settings(ProtocolVersion::V3).await;

        let (request, _events) = h.new_request();
        h.connection.send(request.clone()).await.unwrap();
        h.expect_syn_stream(1, false).await;

        request.write(vec![0u8; 40000]);
        let (len, fin) = h.expect_data(1).await;
        assert_eq!((len, fin), (40000, false));

        request.write(vec![0u8; 40000]);
        let (len, fin) = h.expect_data(1).await;
        assert_eq!((len, fin), (25536, false));

        h.inject_window_update(ProtocolVersion::V3, 1, 20000).await;
        let (len, fin) = h.expect_data(1).await;
        assert_eq!((len, fin), (14464, false));

        // window_out is now 5536: one more write proves it, by splitting
        // exactly there.
        request.write(vec![0u8; 6000]);
        let (len, fin) = h.expect_data(1).await;
        assert_eq!((len, fin), (5536, false));
    }

    // Scenario 3 (spec §8): a graceful half-close deferred behind flow
    // control, then released by a WINDOW_UPDATE.
    #[tokio::test]
    async fn scenario_v3_pending_end_released_by_window_update() {
        let mut h = setup(ProtocolVersion::V3).await;
        h.drain_initial_settings(ProtocolVersion::V3).await;

        // Force window_out to 0 for streams created from here on.
        h.inject_settings_initial_window(ProtocolVersion::V3, 0).await;

        let (request, _events) = h.new_request();
        h.connection.send(request.clone()).await.unwrap();
        h.expect_syn_stream(1, false).await;

        request.write(vec![0u8; 10000]);
        request.end();
        h.expect_silence().await;

        h.inject_window_update(ProtocolVersion::V3, 1, 10000).await;
        let (len, fin) = h.expect_data(1).await;
        assert_eq!((len, fin), (10000, false));
        let (len, fin) = h.expect_data(1).await;
        assert_eq!((len, fin), (0, true));
    }

    // Scenario 4 (spec §8): RST from the peer.
    #[tokio::test]
    async fn scenario_rst_from_peer() {
        let mut h = setup(ProtocolVersion::V3).await;
        h.drain_initial_settings(ProtocolVersion::V3).await;

        let (request, mut events) = h.new_request();
        h.connection.send(request.clone()).await.unwrap();
        h.expect_syn_stream(1, false).await;

        request.write(Bytes::from_static(b"in flight"));
        h.expect_data(1).await;

        h.inject_rst_stream(ProtocolVersion::V3, 1, RstStatusCode::Cancel).await;

        assert!(matches!(events.recv().await, Some(RequestEvent::Error(StreamError::RstStream(RstStatusCode::Cancel)))));
        assert!(matches!(events.recv().await, Some(RequestEvent::End)));

        // No RST is sent in reply, and the stream is gone.
        h.expect_silence().await;
        assert_eq!(h.connection.live_stream_count().await, Some(0));

        // A write after RST is a no-op: nothing more appears on the wire.
        request.write(Bytes::from_static(b"too late"));
        h.expect_silence().await;
    }

    // Scenario 5 (spec §8): a second SYN_REPLY on the same stream.
    #[tokio::test]
    async fn scenario_double_response() {
        let mut h = setup(ProtocolVersion::V3).await;
        h.drain_initial_settings(ProtocolVersion::V3).await;

        let (request, mut events) = h.new_request();
        h.connection.send(request).await.unwrap();
        h.expect_syn_stream(1, false).await;

        let first: HeaderList = vec![(":status".to_string(), "200".to_string())];
        h.inject_syn_reply(ProtocolVersion::V3, 1, false, &first).await;
        assert!(matches!(events.recv().await, Some(RequestEvent::Response(_))));

        let second: HeaderList = vec![(":status".to_string(), "404".to_string())];
        h.inject_syn_reply(ProtocolVersion::V3, 1, false, &second).await;

        h.expect_rst_stream(1, RstStatusCode::ProtocolError).await;
        assert!(matches!(events.recv().await, Some(RequestEvent::Error(StreamError::DoubleResponse))));
        assert!(matches!(events.recv().await, Some(RequestEvent::End)));
    }

    // Scenario 6 (spec §8): a SETTINGS delta adjusts every live stream's
    // window_out, and seeds the window for streams created afterward.
    #[tokio::test]
    async fn scenario_settings_delta_applies_to_live_and_future_streams() {
        let mut h = setup(ProtocolVersion::V3).await;
        h.drain_initial_settings(ProtocolVersion::V3).await;

        let (s1, _s1_events) = h.new_request();
        h.connection.send(s1.clone()).await.unwrap();
        h.expect_syn_stream(1, false).await;

        h.inject_settings_initial_window(ProtocolVersion::V3, 32768).await;

        s1.write(vec![0u8; 40000]);
        let (len, _fin) = h.expect_data(1).await;
        assert_eq!(len, 32768, "s1.window_out should have been adjusted by the SETTINGS delta");

        let (s2, _s2_events) = h.new_request();
        h.connection.send(s2.clone()).await.unwrap();
        h.expect_syn_stream(3, false).await;

        s2.write(vec![0u8; 40000]);
        let (len, _fin) = h.expect_data(3).await;
        assert_eq!(len, 32768, "s2 should start at the new initial window, not the original default");
    }

    // spec §8 idempotence: close() called twice produces at most one
    // RST_STREAM, and end() after close() is a no-op.
    #[tokio::test]
    async fn close_is_idempotent_and_end_after_close_is_a_no_op() {
        let mut h = setup(ProtocolVersion::V3).await;
        h.drain_initial_settings(ProtocolVersion::V3).await;

        let (request, mut events) = h.new_request();
        h.connection.send(request.clone()).await.unwrap();
        h.expect_syn_stream(1, false).await;

        request.close();
        h.expect_rst_stream(1, RstStatusCode::Cancel).await;
        assert!(matches!(events.recv().await, Some(RequestEvent::Error(StreamError::Cancelled))));
        assert!(matches!(events.recv().await, Some(RequestEvent::End)));

        request.close();
        request.end();
        h.expect_silence().await;
    }

    // V2 has no flow control at all: every write is flushed as one DATA
    // frame and there is no WINDOW_UPDATE frame type to speak of.
    #[tokio::test]
    async fn scenario_v2_has_no_flow_control() {
        let mut h = setup(ProtocolVersion::V2).await;
        h.drain_initial_settings(ProtocolVersion::V2).await; // no-op for V2

        let (request, _events) = h.new_request();
        h.connection.send(request.clone()).await.unwrap();
        h.expect_syn_stream(1, false).await;

        request.write(vec![0u8; 100000]);
        let (len, fin) = h.expect_data(1).await;
        assert_eq!((len, fin), (100000, false));

        request.end();
        let (len, fin) = h.expect_data(1).await;
        assert_eq!((len, fin), (0, true));
    }

    // invariant §3.4: no DATA frame after `closed_by_us`. A write queued
    // after `end()` (even one that raced the engine and landed after the
    // fin=1 frame was already on the wire) must be dropped, not emitted.
    #[tokio::test]
    async fn write_after_end_is_dropped() {
        let mut h = setup(ProtocolVersion::V3).await;
        h.drain_initial_settings(ProtocolVersion::V3).await;

        let (request, _events) = h.new_request();
        h.connection.send(request.clone()).await.unwrap();
        h.expect_syn_stream(1, false).await;

        request.end();
        let (len, fin) = h.expect_data(1).await;
        assert_eq!((len, fin), (0, true));

        request.write(Bytes::from_static(b"too late"));
        h.expect_silence().await;
    }

    // A DATA frame's length field is only 24 bits wide; a write bigger than
    // that has to be split across multiple frames, with `fin` only on the
    // last one, or it would silently wrap the length the peer reads.
    #[tokio::test]
    async fn oversized_write_is_split_across_frames() {
        let mut h = setup(ProtocolVersion::V2).await;
        h.drain_initial_settings(ProtocolVersion::V2).await;

        let (request, _events) = h.new_request();
        h.connection.send(request.clone()).await.unwrap();
        h.expect_syn_stream(1, false).await;

        let total = MAX_PAYLOAD_LEN + 1000;
        request.write(vec![0u8; total]);

        let (first_len, first_fin) = h.expect_data(1).await;
        assert_eq!(first_len, MAX_PAYLOAD_LEN);
        assert!(!first_fin);

        let (second_len, second_fin) = h.expect_data(1).await;
        assert_eq!(second_len, 1000);
        assert!(!second_fin);
    }

    // spec §8 scenario 1's own premise: a request that never calls `end()`
    // still tears down once the response finishes and nothing of ours is
    // outstanding (see `Engine::maybe_teardown`).
    #[tokio::test]
    async fn response_complete_tears_down_a_request_that_never_called_end() {
        let mut h = setup(ProtocolVersion::V3).await;
        h.drain_initial_settings(ProtocolVersion::V3).await;

        let (request, mut events) = h.new_request();
        h.connection.send(request).await.unwrap();
        h.expect_syn_stream(1, false).await;

        let headers: HeaderList = vec![(":status".to_string(), "200".to_string())];
        h.inject_syn_reply(ProtocolVersion::V3, 1, true, &headers).await;

        assert!(matches!(events.recv().await, Some(RequestEvent::Response(_))));
        assert!(matches!(events.recv().await, Some(RequestEvent::End)));
        assert_eq!(h.connection.live_stream_count().await, Some(0));
    }

    // spec §4.E "Fatal errors": transport EOF tears down every live stream
    // with one error + one end each, then delivers one connection-level
    // error to the connection delegate.
    #[tokio::test]
    async fn transport_eof_tears_down_every_live_stream() {
        let mut h = setup(ProtocolVersion::V3).await;
        h.drain_initial_settings(ProtocolVersion::V3).await;

        let (s1, mut s1_events) = h.new_request();
        h.connection.send(s1).await.unwrap();
        h.expect_syn_stream(1, false).await;

        let (s2, mut s2_events) = h.new_request();
        h.connection.send(s2).await.unwrap();
        h.expect_syn_stream(3, false).await;

        drop(h.peer);

        for events in [&mut s1_events, &mut s2_events] {
            assert!(matches!(events.recv().await, Some(RequestEvent::Error(StreamError::ConnectionClosed(_)))));
            assert!(matches!(events.recv().await, Some(RequestEvent::End)));
        }
        assert!(matches!(h.conn_rx.recv().await, Some(ConnectionEvent::Error(ConnectionError::ConnectionEnd))));
    }
}
