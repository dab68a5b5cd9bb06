//! The SPDY protocol version negotiated for a connection.
//!
//! SPDY/2 and SPDY/3 share most of the wire format but differ in a few
//! load-bearing ways: SPDY/2 has no flow control, uses 16-bit counts and
//! lengths in the header block, and names URL components differently in
//! `SYN_STREAM`. SPDY/3 adds flow control, widens those fields to 32 bits,
//! and splits the URL into `:scheme`/`:host`/`:path` pseudo-headers.

/// Which revision of the SPDY wire format a `Connection` speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V2,
    V3,
}

impl ProtocolVersion {
    /// Whether this version performs per-stream byte-credit flow control.
    ///
    /// SPDY/2 has no WINDOW_UPDATE frame and no notion of a send window;
    /// every write is simply flushed to the wire.
    pub fn has_flow_control(&self) -> bool {
        matches!(self, ProtocolVersion::V3)
    }

    /// The width, in bytes, of the header-block count and length fields.
    pub fn header_block_field_width(&self) -> usize {
        match self {
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 4,
        }
    }

    /// The numeric version field control frames carry in their header.
    pub fn wire_version(&self) -> u16 {
        match self {
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
        }
    }

    /// The inverse of [`Self::wire_version`]; used when parsing an inbound
    /// control frame header.
    pub fn from_wire_version(value: u16) -> Option<ProtocolVersion> {
        match value {
            2 => Some(ProtocolVersion::V2),
            3 => Some(ProtocolVersion::V3),
            _ => None,
        }
    }

    /// Maps an ALPN/NPN protocol id negotiated by the transport to a
    /// `ProtocolVersion`.
    ///
    /// The transport (out of scope for this crate, see spec §1) is
    /// responsible for the actual negotiation; this is just the lookup
    /// table callers use once they have the negotiated string in hand.
    pub fn negotiate(protocol_id: &str) -> Option<ProtocolVersion> {
        match protocol_id {
            "spdy/2" => Some(ProtocolVersion::V2),
            "spdy/3" => Some(ProtocolVersion::V3),
            _ => None,
        }
    }
}
