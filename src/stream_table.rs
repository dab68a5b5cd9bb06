//! The engine's private map from stream id to live stream state (spec
//! §4.D). Distinct from [`crate::request::Request`], which is the
//! application-facing handle: `StreamState` is the bookkeeping the
//! connection executor alone mutates.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::request::Request;

/// Initial and reset-to value for both flow-control windows (spec §3).
pub const DEFAULT_WINDOW: i64 = 65536;

/// Per-stream state the engine owns exclusively (spec §3 "Request" fields
/// other than the immutable `method`/`url`/`headers`, which live on
/// [`Request`] itself).
pub struct StreamState {
    pub request: Arc<Request>,
    /// Bytes we still permit the peer to send before we must emit
    /// WINDOW_UPDATE. Unused for SPDY/2.
    pub window_in: i64,
    /// Bytes we may still send without waiting on a WINDOW_UPDATE. Signed:
    /// a SETTINGS-driven reduction in the peer's advertised initial window
    /// can drive this negative. Unused for SPDY/2.
    pub window_out: i64,
    pub closed_by_us: bool,
    pub closed_by_them: bool,
    pub pending_closed_by_us: bool,
    pub seen_response: bool,
    pub data_queue: VecDeque<Bytes>,
}

impl StreamState {
    pub fn new(request: Arc<Request>, initial_peer_window: i64) -> Self {
        StreamState {
            request,
            window_in: DEFAULT_WINDOW,
            window_out: initial_peer_window,
            closed_by_us: false,
            closed_by_them: false,
            pending_closed_by_us: false,
            seen_response: false,
            data_queue: VecDeque::new(),
        }
    }
}

/// Keyed lookup by stream id (spec §4.D). Insertion and removal are only
/// ever performed by the connection engine, under its own serial executor
/// (spec §5); there is no internal locking here because nothing else ever
/// touches this map.
#[derive(Default)]
pub struct StreamTable {
    streams: HashMap<u32, StreamState>,
}

impl StreamTable {
    pub fn new() -> Self {
        StreamTable { streams: HashMap::new() }
    }

    pub fn insert(&mut self, stream_id: u32, state: StreamState) {
        self.streams.insert(stream_id, state);
    }

    pub fn get(&self, stream_id: u32) -> Option<&StreamState> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: u32) -> Option<&mut StreamState> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove(&mut self, stream_id: u32) -> Option<StreamState> {
        self.streams.remove(&stream_id)
    }

    pub fn contains(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u32, &mut StreamState)> {
        self.streams.iter_mut()
    }

    /// Drains every entry, handing each `(stream_id, StreamState)` pair to
    /// `f`. Used when the connection tears down and every live stream must
    /// be notified (spec §4.E "Fatal errors").
    pub fn drain(&mut self) -> std::collections::hash_map::IntoIter<u32, StreamState> {
        std::mem::take(&mut self.streams).into_iter()
    }
}
