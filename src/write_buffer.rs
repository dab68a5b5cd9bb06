//! The FIFO byte queue between the framer and the transport (spec §4.C).
//!
//! Every frame the engine emits is pushed here as one opaque chunk and
//! drained strictly in order. Because each chunk is one complete frame's
//! bytes, draining the queue can never interleave one frame's bytes into
//! another's: a given `write_all` call either finishes a chunk or the whole
//! drain stops (transport error), but it never starts writing the next
//! chunk before the current one is fully on the wire.

use std::collections::VecDeque;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Outbound byte queue for one connection.
///
/// There is no separate "is the transport writable right now" fast path
/// here the way a callback-driven design needs one (spec §4.C describes
/// one): under `tokio`, `AsyncWrite::write_all` already does the
/// write-what-you-can-then-await dance internally, so enqueue-then-drain is
/// the whole of it.
#[derive(Default)]
pub struct WriteBuffer {
    queue: VecDeque<Bytes>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        WriteBuffer { queue: VecDeque::new() }
    }

    /// Appends one frame's worth of bytes to the tail of the queue.
    pub fn enqueue(&mut self, bytes: impl Into<Bytes>) {
        self.queue.push_back(bytes.into());
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Writes every queued chunk to `transport`, in FIFO order, popping
    /// each as it completes. On error the queue retains whatever chunk was
    /// in flight and everything behind it is left queued; the caller is
    /// expected to treat any error here as connection-fatal (spec §4.C,
    /// §4.E) and not attempt to resume the drain.
    pub async fn drain<W: AsyncWrite + Unpin>(&mut self, transport: &mut W) -> io::Result<()> {
        while let Some(chunk) = self.queue.front() {
            transport.write_all(chunk).await?;
            self.queue.pop_front();
        }
        Ok(())
    }
}
