//! Reference-counted PCM buffers.
//!
//! One `Buffer` holds one decoded, converted frame of interleaved PCM. Every
//! sink in a format class receives a clone of the same `Arc<Buffer>`, so the
//! audio data is shared rather than copied; the last drop frees it exactly
//! once. The producer holds the construction reference, adds one clone per
//! successful enqueue, and drops its own at the end of fan-out — a buffer no
//! sink accepted dies right there.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::format::AudioFormat;
use crate::item::ItemId;

/// One immutable frame of decoded, converted PCM.
pub struct Buffer {
    data: Box<[u8]>,
    frame_count: usize,
    format: AudioFormat,
    item: Option<ItemId>,
    pos: f64,
}

impl Buffer {
    pub(crate) fn new(
        data: Box<[u8]>,
        frame_count: usize,
        format: AudioFormat,
        item: ItemId,
        pos: f64,
    ) -> Arc<Buffer> {
        Arc::new(Buffer {
            data,
            frame_count,
            format,
            item: Some(item),
            pos,
        })
    }

    /// Interleaved PCM bytes in [`Buffer::format`].
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size of the PCM payload in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// The PCM format of [`Buffer::data`].
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// The playlist item this audio was decoded from.
    ///
    /// `None` only for the end-of-queue sentinel, which consumers never see.
    pub fn item(&self) -> Option<ItemId> {
        self.item
    }

    /// Position of this buffer within its item, in seconds.
    pub fn pos(&self) -> f64 {
        self.pos
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("bytes", &self.data.len())
            .field("frame_count", &self.frame_count)
            .field("format", &self.format)
            .field("item", &self.item)
            .field("pos", &self.pos)
            .finish()
    }
}

/// The process-wide end-of-queue sentinel.
///
/// Distinguishes "the playlist ran out" from a transient underrun. It is
/// compared by identity and never escapes [`crate::sink::SinkPoll`] mapping.
pub(crate) fn end_of_queue() -> Arc<Buffer> {
    static SENTINEL: OnceLock<Arc<Buffer>> = OnceLock::new();
    Arc::clone(SENTINEL.get_or_init(|| {
        Arc::new(Buffer {
            data: Vec::new().into_boxed_slice(),
            frame_count: 0,
            format: AudioFormat::default(),
            item: None,
            pos: 0.0,
        })
    }))
}

pub(crate) fn is_end_of_queue(buffer: &Arc<Buffer>) -> bool {
    Arc::ptr_eq(buffer, &end_of_queue())
}
