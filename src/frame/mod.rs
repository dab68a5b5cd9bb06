//! Frame serialization and parsing (spec component B).
//!
//! [`Framer`] builds outbound frames into a reusable scratch buffer.
//! [`FrameParser`] is the inbound half: a resumable, byte-driven state
//! machine that turns arbitrary chunks of inbound bytes into a stream of
//! [`FrameEvent`]s, buffering only as much as a frame boundary in flight
//! requires.

pub mod control;
pub mod data;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ConnectionError;
use crate::version::ProtocolVersion;
pub use control::{ControlFrameType, HeaderList, RstStatusCode, SETTINGS_ID_INITIAL_WINDOW_SIZE};

fn protocol_err(msg: impl Into<String>) -> ConnectionError {
    ConnectionError::Protocol(msg.into())
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// One parsed inbound frame, in the shape the connection engine dispatches
/// on (spec §4.B, "Frame event payloads"). Frame types the engine never
/// acts on (PING, GOAWAY, NOOP, SYN_STREAM, HEADERS, CREDENTIAL) are
/// dropped by the parser rather than represented here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// `compressed_headers` is still zlib-compressed; decoding it is the
    /// header codec's job, not the framer's.
    SynReply {
        stream_id: u32,
        is_fin: bool,
        compressed_headers: Bytes,
    },
    Data {
        stream_id: u32,
        is_fin: bool,
        payload: Bytes,
    },
    RstStream {
        stream_id: u32,
        status: RstStatusCode,
    },
    WindowUpdate {
        stream_id: u32,
        delta: u32,
    },
    /// `initial_window` is `None` unless the peer's SETTINGS frame included
    /// an `INITIAL_WINDOW_SIZE` entry; no other setting id is of interest.
    Settings { initial_window: Option<u32> },
}

/// Builds outbound frames into a reusable scratch buffer.
///
/// Callers call one of the builder methods, then [`Framer::output`] to get
/// the bytes to hand to the write buffer, then [`Framer::clear`] before the
/// next frame. Reusing the buffer avoids an allocation per frame on what is
/// usually the hottest path in the engine.
pub struct Framer {
    version: ProtocolVersion,
    scratch: BytesMut,
}

impl Framer {
    pub fn new(version: ProtocolVersion) -> Self {
        Framer {
            version,
            scratch: BytesMut::with_capacity(4096),
        }
    }

    pub fn clear(&mut self) {
        self.scratch.clear();
    }

    pub fn output(&self) -> &[u8] {
        &self.scratch
    }

    /// `compressed_headers` must already have been produced by the header
    /// codec; this only assembles the envelope around it. Priority is
    /// always encoded as zero (spec §1 Non-goals: "request prioritization
    /// beyond sending priority zero").
    pub fn syn_stream(&mut self, stream_id: u32, compressed_headers: &[u8]) {
        let version = self.version;
        push_control_frame(&mut self.scratch, version, ControlFrameType::SynStream, 0, |buf| {
            buf.put_u32(stream_id & 0x7fff_ffff);
            buf.put_u32(0); // no associated stream
            buf.put_u8(0); // priority 0
            buf.put_u8(0); // unused
            buf.put_slice(compressed_headers);
        });
    }

    pub fn data(&mut self, stream_id: u32, fin: bool, payload: &[u8]) {
        data::encode_data(&mut self.scratch, stream_id, fin, payload);
    }

    pub fn rst_stream(&mut self, stream_id: u32, status: RstStatusCode) {
        let version = self.version;
        push_control_frame(&mut self.scratch, version, ControlFrameType::RstStream, 0, |buf| {
            buf.put_u32(stream_id & 0x7fff_ffff);
            buf.put_u32(status.as_u32());
        });
    }

    /// SPDY/2 has no WINDOW_UPDATE frame; callers must check
    /// `ProtocolVersion::has_flow_control` before reaching here.
    pub fn window_update(&mut self, stream_id: u32, delta: u32) {
        let version = self.version;
        push_control_frame(&mut self.scratch, version, ControlFrameType::WindowUpdate, 0, |buf| {
            buf.put_u32(stream_id & 0x7fff_ffff);
            buf.put_u32(delta & 0x7fff_ffff);
        });
    }

    /// Builds a SETTINGS frame carrying a single `INITIAL_WINDOW_SIZE`
    /// entry; this client never advertises any other setting.
    pub fn settings_initial_window(&mut self, initial_window: u32) {
        let version = self.version;
        push_control_frame(&mut self.scratch, version, ControlFrameType::Settings, 0, |buf| {
            buf.put_u32(1); // one entry
            buf.put_u32(SETTINGS_ID_INITIAL_WINDOW_SIZE & 0x00ff_ffff);
            buf.put_u32(initial_window);
        });
    }
}

/// Writes an 8-byte placeholder header, runs `body`, then patches the
/// header's length field in place once the body's size is known. Mirrors
/// the patch-the-length-after-the-fact pattern used for fixed-header binary
/// protocols elsewhere in this codebase.
fn push_control_frame(
    scratch: &mut BytesMut,
    version: ProtocolVersion,
    frame_type: ControlFrameType,
    flags: u8,
    body: impl FnOnce(&mut BytesMut),
) {
    let start = scratch.len();
    scratch.put_u32(0);
    scratch.put_u32(0);
    body(scratch);
    let body_len = (scratch.len() - start - 8) as u32;
    let word0 = 0x8000_0000u32 | ((version.wire_version() as u32) << 16) | (frame_type as u16 as u32);
    let word1 = ((flags as u32) << 24) | (body_len & 0x00ff_ffff);
    scratch[start..start + 4].copy_from_slice(&word0.to_be_bytes());
    scratch[start + 4..start + 8].copy_from_slice(&word1.to_be_bytes());
}

/// The three states the parser cycles through per spec §4.B. `Header`
/// isn't represented explicitly: it's simply "no partial frame in
/// progress", i.e. `header_buf` is empty.
enum ParseState {
    Header {
        buf: Vec<u8>,
    },
    ControlBody {
        frame_type: ControlFrameType,
        flags: u8,
        length: usize,
        buf: Vec<u8>,
    },
    /// An unrecognized control frame type: skipped by length, with no body
    /// ever buffered.
    UnknownControlBody {
        remaining: usize,
    },
    DataBody {
        stream_id: u32,
        flags: u8,
        remaining: usize,
    },
}

fn fresh_header_state() -> ParseState {
    ParseState::Header { buf: Vec::with_capacity(8) }
}

/// Resumable, byte-driven inbound frame parser (spec §4.B).
///
/// `execute` may be called with any chunk size, including one byte at a
/// time; the parser carries partial frame state across calls so callers
/// never need to reassemble frames themselves.
pub struct FrameParser {
    version: ProtocolVersion,
    state: ParseState,
}

impl FrameParser {
    pub fn new(version: ProtocolVersion) -> Self {
        FrameParser { version, state: fresh_header_state() }
    }

    /// Drains as many complete frames as `input` currently contains,
    /// leaving any trailing partial frame's bytes consumed into internal
    /// state (never left sitting in `input`).
    pub fn execute(&mut self, input: &mut BytesMut) -> Result<Vec<FrameEvent>, ConnectionError> {
        let mut events = Vec::new();
        loop {
            match &mut self.state {
                ParseState::Header { buf } => {
                    let need = 8 - buf.len();
                    let take = need.min(input.len());
                    if take == 0 {
                        break;
                    }
                    buf.extend_from_slice(&input.split_to(take));
                    if buf.len() < 8 {
                        break;
                    }
                    let header = std::mem::take(buf);
                    self.state = parse_frame_header(&header)?;
                }
                ParseState::ControlBody { frame_type, flags, length, buf } => {
                    let need = *length - buf.len();
                    let take = need.min(input.len());
                    if take > 0 {
                        buf.extend_from_slice(&input.split_to(take));
                    }
                    if buf.len() < *length {
                        break;
                    }
                    let frame_type = *frame_type;
                    let flags = *flags;
                    let body = std::mem::take(buf);
                    if let Some(event) = parse_control_body(self.version, frame_type, flags, &body)? {
                        events.push(event);
                    }
                    self.state = fresh_header_state();
                }
                ParseState::UnknownControlBody { remaining } => {
                    let take = (*remaining).min(input.len());
                    input.advance(take);
                    *remaining -= take;
                    if *remaining > 0 {
                        break;
                    }
                    self.state = fresh_header_state();
                }
                ParseState::DataBody { stream_id, flags, remaining } => {
                    if input.is_empty() {
                        break;
                    }
                    let take = (*remaining).min(input.len());
                    let chunk = input.split_to(take).freeze();
                    *remaining -= take;
                    let is_fin = *remaining == 0 && (*flags & data::FLAG_FIN != 0);
                    events.push(FrameEvent::Data { stream_id: *stream_id, is_fin, payload: chunk });
                    if *remaining == 0 {
                        self.state = fresh_header_state();
                    } else {
                        break;
                    }
                }
            }
        }
        Ok(events)
    }
}

fn parse_frame_header(header: &[u8]) -> Result<ParseState, ConnectionError> {
    let word0 = be_u32(&header[0..4]);
    let word1 = be_u32(&header[4..8]);
    let flags = (word1 >> 24) as u8;
    let length = (word1 & 0x00ff_ffff) as usize;

    if word0 & 0x8000_0000 == 0 {
        let stream_id = word0 & 0x7fff_ffff;
        return Ok(ParseState::DataBody { stream_id, flags, remaining: length });
    }

    let frame_type_raw = (word0 & 0xffff) as u16;
    match ControlFrameType::try_from(frame_type_raw) {
        Ok(frame_type) => Ok(ParseState::ControlBody {
            frame_type,
            flags,
            length,
            buf: Vec::with_capacity(length),
        }),
        Err(_) => Ok(ParseState::UnknownControlBody { remaining: length }),
    }
}

fn parse_control_body(
    version: ProtocolVersion,
    frame_type: ControlFrameType,
    flags: u8,
    body: &[u8],
) -> Result<Option<FrameEvent>, ConnectionError> {
    match frame_type {
        ControlFrameType::SynReply => {
            let header_start = if version == ProtocolVersion::V2 { 6 } else { 4 };
            if body.len() < header_start {
                return Err(protocol_err("truncated SYN_REPLY"));
            }
            let stream_id = be_u32(&body[0..4]) & 0x7fff_ffff;
            let compressed_headers = Bytes::copy_from_slice(&body[header_start..]);
            Ok(Some(FrameEvent::SynReply {
                stream_id,
                is_fin: flags & data::FLAG_FIN != 0,
                compressed_headers,
            }))
        }
        ControlFrameType::RstStream => {
            if body.len() < 8 {
                return Err(protocol_err("truncated RST_STREAM"));
            }
            let stream_id = be_u32(&body[0..4]) & 0x7fff_ffff;
            let status = RstStatusCode::from_u32(be_u32(&body[4..8]));
            Ok(Some(FrameEvent::RstStream { stream_id, status }))
        }
        ControlFrameType::WindowUpdate => {
            if body.len() < 8 {
                return Err(protocol_err("truncated WINDOW_UPDATE"));
            }
            let stream_id = be_u32(&body[0..4]) & 0x7fff_ffff;
            let delta = be_u32(&body[4..8]) & 0x7fff_ffff;
            Ok(Some(FrameEvent::WindowUpdate { stream_id, delta }))
        }
        ControlFrameType::Settings => {
            if body.len() < 4 {
                return Err(protocol_err("truncated SETTINGS"));
            }
            let count = be_u32(&body[0..4]) as usize;
            let mut initial_window = None;
            let mut offset = 4;
            for _ in 0..count {
                if body.len() < offset + 8 {
                    return Err(protocol_err("truncated SETTINGS entry"));
                }
                let id = be_u32(&body[offset..offset + 4]) & 0x00ff_ffff;
                let value = be_u32(&body[offset + 4..offset + 8]);
                if id == SETTINGS_ID_INITIAL_WINDOW_SIZE {
                    initial_window = Some(value);
                }
                offset += 8;
            }
            Ok(Some(FrameEvent::Settings { initial_window }))
        }
        // PING, GOAWAY, NOOP, SYN_STREAM, HEADERS, CREDENTIAL: a client
        // never acts on any of these (spec §4.E dispatch table).
        ControlFrameType::Ping
        | ControlFrameType::Goaway
        | ControlFrameType::Noop
        | ControlFrameType::SynStream
        | ControlFrameType::Headers
        | ControlFrameType::Credential => Ok(None),
    }
}
