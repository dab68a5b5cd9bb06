//! The one data-frame type SPDY has: a stream id, a fin flag, and a payload.
//! Unlike control frames there is no subtype and no header-block encoding
//! involved, so this module is much smaller than [`super::control`].

use bytes::{BufMut, BytesMut};

/// The single flag bit DATA frames define.
pub const FLAG_FIN: u8 = 0x01;

/// The largest payload one DATA frame can carry: the wire length field is
/// 24 bits. Callers that have more than this to send must split across
/// multiple frames (only the last of which may carry `fin`); this function
/// itself just encodes whatever it's given.
pub const MAX_PAYLOAD_LEN: usize = 0x00ff_ffff;

/// Appends one DATA frame (8-byte header plus `payload`) to `out`.
///
/// `stream_id` must fit in 31 bits; callers never construct a `Request`
/// whose id could violate that, so this does not validate it. `payload`
/// must be no longer than [`MAX_PAYLOAD_LEN`]; longer payloads silently
/// wrap the length field, so splitting is the caller's job (see
/// `Engine::emit_data_frame` in `connection.rs`).
pub fn encode_data(out: &mut BytesMut, stream_id: u32, fin: bool, payload: &[u8]) {
    let flags: u8 = if fin { FLAG_FIN } else { 0 };
    out.reserve(8 + payload.len());
    // The control bit (the high bit of the first word) is implicitly 0 here
    // because `stream_id` is always < 2^31.
    out.put_u32(stream_id & 0x7fff_ffff);
    out.put_u32(((flags as u32) << 24) | (payload.len() as u32 & 0x00ff_ffff));
    out.put_slice(payload);
}
