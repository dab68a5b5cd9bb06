//! Control-frame payload types for SPDY (SYN_STREAM, SYN_REPLY, RST_STREAM,
//! WINDOW_UPDATE, SETTINGS). Each type knows how to encode itself into a
//! scratch buffer and, where inbound, how to decode from one.

use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::version::ProtocolVersion;

/// SPDY control-frame type ids (the low 16 bits of the first header word).
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum ControlFrameType {
    SynStream = 1,
    SynReply = 2,
    RstStream = 3,
    Settings = 4,
    Noop = 5,
    Ping = 6,
    Goaway = 7,
    Headers = 8,
    WindowUpdate = 9,
    Credential = 10,
}

/// RST_STREAM status codes.
///
/// Only `ProtocolError` and `Cancel` are ever emitted by this client (spec
/// §6), but a peer's RST_STREAM may carry any of the codes the wire format
/// defines, so parsing preserves the full space via `Other`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RstStatusCode {
    ProtocolError,
    InvalidStream,
    RefusedStream,
    UnsupportedVersion,
    Cancel,
    InternalError,
    FlowControlError,
    StreamInUse,
    StreamAlreadyClosed,
    Other(u32),
}

impl RstStatusCode {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => RstStatusCode::ProtocolError,
            2 => RstStatusCode::InvalidStream,
            3 => RstStatusCode::RefusedStream,
            4 => RstStatusCode::UnsupportedVersion,
            5 => RstStatusCode::Cancel,
            6 => RstStatusCode::InternalError,
            7 => RstStatusCode::FlowControlError,
            8 => RstStatusCode::StreamInUse,
            9 => RstStatusCode::StreamAlreadyClosed,
            other => RstStatusCode::Other(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            RstStatusCode::ProtocolError => 1,
            RstStatusCode::InvalidStream => 2,
            RstStatusCode::RefusedStream => 3,
            RstStatusCode::UnsupportedVersion => 4,
            RstStatusCode::Cancel => 5,
            RstStatusCode::InternalError => 6,
            RstStatusCode::FlowControlError => 7,
            RstStatusCode::StreamInUse => 8,
            RstStatusCode::StreamAlreadyClosed => 9,
            RstStatusCode::Other(v) => *v,
        }
    }
}

/// An ordered sequence of header name/value pairs as they are handed to or
/// received from the header codec (spec §4.A). Duplicate names are allowed;
/// values may themselves contain embedded NUL separators per the SPDY wire
/// format, so this is a flat `Vec` rather than a `HashMap`.
pub type HeaderList = Vec<(String, String)>;

/// Packs a `HeaderList` into the SPDY "name/value block" payload (the bytes
/// that get fed to the zlib compressor), using the count/length field widths
/// `version` specifies.
pub fn encode_header_block(version: ProtocolVersion, headers: &HeaderList) -> BytesMut {
    let mut buf = BytesMut::new();
    put_count(&mut buf, version, headers.len() as u32);
    for (name, value) in headers {
        put_length_prefixed(&mut buf, version, name.as_bytes());
        put_length_prefixed(&mut buf, version, value.as_bytes());
    }
    buf
}

/// The inverse of [`encode_header_block`]; used by the header codec after
/// zlib inflation to recover the name/value pairs.
pub fn decode_header_block(
    version: ProtocolVersion,
    mut block: &[u8],
) -> Result<HeaderList, &'static str> {
    let count = get_count(&mut block, version).ok_or("truncated header count")?;
    let mut headers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = get_length_prefixed(&mut block, version).ok_or("truncated header name")?;
        let value = get_length_prefixed(&mut block, version).ok_or("truncated header value")?;
        headers.push((
            String::from_utf8(name).map_err(|_| "header name is not utf-8")?,
            String::from_utf8(value).map_err(|_| "header value is not utf-8")?,
        ));
    }
    Ok(headers)
}

fn put_count(buf: &mut BytesMut, version: ProtocolVersion, count: u32) {
    match version.header_block_field_width() {
        2 => buf.put_u16(count as u16),
        _ => buf.put_u32(count),
    }
}

fn get_count(block: &mut &[u8], version: ProtocolVersion) -> Option<u32> {
    match version.header_block_field_width() {
        2 => {
            if block.remaining() < 2 {
                return None;
            }
            Some(block.get_u16() as u32)
        }
        _ => {
            if block.remaining() < 4 {
                return None;
            }
            Some(block.get_u32())
        }
    }
}

fn put_length_prefixed(buf: &mut BytesMut, version: ProtocolVersion, data: &[u8]) {
    match version.header_block_field_width() {
        2 => buf.put_u16(data.len() as u16),
        _ => buf.put_u32(data.len() as u32),
    }
    buf.put_slice(data);
}

fn get_length_prefixed(block: &mut &[u8], version: ProtocolVersion) -> Option<Vec<u8>> {
    let len = get_count(block, version)? as usize;
    if block.remaining() < len {
        return None;
    }
    let data = block[..len].to_vec();
    block.advance(len);
    Some(data)
}

/// SETTINGS ids this client cares about on receive (spec §4.B). The wire
/// format defines more; anything else is simply not looked for.
pub const SETTINGS_ID_INITIAL_WINDOW_SIZE: u32 = 7;
