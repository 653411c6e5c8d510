//! Sinks: consumer endpoints with a declared output format and a bounded queue.
//!
//! A sink is created standalone, attached to a playlist, and drained from any
//! number of consumer threads via [`Sink::get_buffer`]. Attached sinks are
//! grouped into format-equivalence classes (the [`SinkMap`]); every sink in a
//! class receives clones of the same buffers.
//!
//! Backpressure: each sink accounts the bytes sitting in its queue; once every
//! attached sink holds at least its own threshold, the decode worker backs
//! off. The queue itself never rejects a put except while detaching.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::info;

use crate::buffer::{Buffer, end_of_queue, is_end_of_queue};
use crate::engine::Shared;
use crate::error::{Error, Result};
use crate::format::AudioFormat;
use crate::item::ItemId;
use crate::playlist::Playlist;
use crate::queue::{Queue, QueueHooks};

/// Result of polling a sink for its next buffer.
#[derive(Debug)]
pub enum SinkPoll {
    /// A buffer of PCM in the sink's declared format.
    Buffer(Arc<Buffer>),
    /// The playlist ran out of items; no more data is coming until one is
    /// inserted. Delivered exactly once per drain-out.
    End,
    /// Nothing queued right now (non-blocking poll), or the sink is detached.
    Empty,
}

/// Construction-time sink parameters.
///
/// The `flush` and `purge` hooks are invoked while the engine lock is held
/// (during seek flushes and item removal). They must not call back into any
/// `Playlist` or `Sink` attach/detach API; doing so deadlocks.
pub struct SinkConfig {
    /// The exact PCM format this sink wants. No negotiation happens; the
    /// engine converts.
    pub format: AudioFormat,
    /// How many frames of queued audio this sink wants buffered before the
    /// engine stops decoding ahead.
    pub buffer_size: usize,
    /// Called after the sink's queue is flushed on a seek.
    pub flush: Option<Box<dyn Fn() + Send + Sync>>,
    /// Called after buffers referencing a removed item are purged.
    pub purge: Option<Box<dyn Fn(ItemId) + Send + Sync>>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            format: AudioFormat::default(),
            buffer_size: 8192,
            flush: None,
            purge: None,
        }
    }
}

struct Counters {
    buf_count: AtomicUsize,
    byte_size: AtomicUsize,
}

struct CounterHooks {
    counters: Arc<Counters>,
}

impl QueueHooks<Arc<Buffer>> for CounterHooks {
    fn on_put(&self, buffer: &Arc<Buffer>) {
        if is_end_of_queue(buffer) {
            return;
        }
        self.counters.buf_count.fetch_add(1, Ordering::SeqCst);
        self.counters
            .byte_size
            .fetch_add(buffer.size(), Ordering::SeqCst);
    }

    fn on_get(&self, buffer: &Arc<Buffer>) {
        if is_end_of_queue(buffer) {
            return;
        }
        self.counters.buf_count.fetch_sub(1, Ordering::SeqCst);
        self.counters
            .byte_size
            .fetch_sub(buffer.size(), Ordering::SeqCst);
    }

    fn on_cleanup(&self, buffer: Arc<Buffer>) {
        if !is_end_of_queue(&buffer) {
            self.counters.buf_count.fetch_sub(1, Ordering::SeqCst);
            self.counters
                .byte_size
                .fetch_sub(buffer.size(), Ordering::SeqCst);
        }
        // Dropping the Arc releases this queue's reference.
        drop(buffer);
    }
}

/// A consumer endpoint.
pub struct Sink {
    format: AudioFormat,
    buffer_size: usize,
    bytes_per_sec: AtomicUsize,
    min_queue_size: AtomicUsize,
    counters: Arc<Counters>,
    queue: Queue<Arc<Buffer>, CounterHooks>,
    playlist: Mutex<Option<Weak<Shared>>>,
    flush_hook: Option<Box<dyn Fn() + Send + Sync>>,
    purge_hook: Option<Box<dyn Fn(ItemId) + Send + Sync>>,
}

impl Sink {
    pub fn new(config: SinkConfig) -> Arc<Sink> {
        let counters = Arc::new(Counters {
            buf_count: AtomicUsize::new(0),
            byte_size: AtomicUsize::new(0),
        });
        Arc::new(Sink {
            format: config.format,
            buffer_size: config.buffer_size,
            bytes_per_sec: AtomicUsize::new(0),
            min_queue_size: AtomicUsize::new(0),
            counters: Arc::clone(&counters),
            queue: Queue::new(CounterHooks { counters }),
            playlist: Mutex::new(None),
            flush_hook: config.flush,
            purge_hook: config.purge,
        })
    }

    /// The PCM format every buffer from this sink will carry.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// The frame threshold this sink was configured with.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes of PCM per second of audio in this sink's format. Computed at
    /// attach time; zero before the first attach.
    pub fn bytes_per_sec(&self) -> usize {
        self.bytes_per_sec.load(Ordering::SeqCst)
    }

    /// Attach this sink to a playlist. The decode worker starts converting
    /// into this sink's format on its next iteration.
    pub fn attach(self: &Arc<Self>, playlist: &Playlist) -> Result<()> {
        let channel_count = self.format.channel_layout.count();
        let bytes_per_sample = self.format.sample_format.bytes_per_sample();

        self.bytes_per_sec
            .store(self.format.bytes_per_sec(), Ordering::SeqCst);
        let min_queue_size = self.buffer_size * channel_count * bytes_per_sample;
        self.min_queue_size.store(min_queue_size, Ordering::SeqCst);
        info!(min_queue_size, "audio queue size");

        {
            let mut back_ref = self.back_ref();
            if back_ref.is_some() {
                return Err(Error::AlreadyAttached);
            }

            let shared = playlist.shared();
            let mut engine = shared.lock_engine();
            engine.add_sink(Arc::clone(self));
            drop(engine);

            // In case abort was called on the queue by an earlier detach.
            self.queue.reset();

            *back_ref = Some(Arc::downgrade(shared));
        }

        Ok(())
    }

    /// Detach this sink. Blocked [`Sink::get_buffer`] calls return
    /// [`SinkPoll::Empty`] immediately; queued buffers are released.
    pub fn detach(&self) -> Result<()> {
        let weak = self.back_ref().take().ok_or(Error::NotAttached)?;

        self.queue.abort();
        self.queue.flush();

        if let Some(shared) = weak.upgrade() {
            let mut engine = shared.lock_engine();
            engine.remove_sink(self);
        }

        Ok(())
    }

    /// Pull the next buffer.
    ///
    /// With `block` set, waits until a buffer arrives, the playlist signals
    /// end-of-queue, or the sink is detached.
    pub fn get_buffer(&self, block: bool) -> SinkPoll {
        match self.queue.get(block) {
            Some(buffer) if is_end_of_queue(&buffer) => SinkPoll::End,
            Some(buffer) => SinkPoll::Buffer(buffer),
            None => SinkPoll::Empty,
        }
    }

    fn back_ref(&self) -> std::sync::MutexGuard<'_, Option<Weak<Shared>>> {
        self.playlist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.counters.byte_size.load(Ordering::SeqCst) >= self.min_queue_size.load(Ordering::SeqCst)
    }

    /// Enqueue a buffer clone. Returns `false` when the queue is aborted
    /// (sink mid-detach); the clone is dropped.
    pub(crate) fn enqueue(&self, buffer: Arc<Buffer>) -> bool {
        self.queue.put(buffer)
    }

    pub(crate) fn signal_end(&self) {
        self.queue.put(end_of_queue());
    }

    pub(crate) fn flush_queue(&self) {
        self.queue.flush();
        if let Some(hook) = &self.flush_hook {
            hook();
        }
    }

    pub(crate) fn purge(&self, item: ItemId) {
        self.queue.purge(|buffer| buffer.item() == Some(item));
        if let Some(hook) = &self.purge_hook {
            hook(item);
        }
    }
}

/// One equivalence class of sinks sharing an output format.
pub(crate) struct SinkClass {
    format: AudioFormat,
    // A stack: the newest attachment sits at the head and serves as the
    // class's example sink.
    sinks: Vec<Arc<Sink>>,
}

impl SinkClass {
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn sinks(&self) -> impl Iterator<Item = &Arc<Sink>> {
        self.sinks.iter()
    }
}

/// Attached sinks, grouped by identical format.
///
/// Class order is the order the graph assigns output ports; both attach and
/// class creation prepend, so traversal order is newest-first.
pub(crate) struct SinkMap {
    classes: Vec<SinkClass>,
}

impl SinkMap {
    pub fn new() -> SinkMap {
        SinkMap {
            classes: Vec::new(),
        }
    }

    /// Insert a sink, joining the class with its format or founding a new one.
    pub fn add(&mut self, sink: Arc<Sink>) {
        for class in &mut self.classes {
            if class.format == sink.format() {
                class.sinks.insert(0, sink);
                return;
            }
        }
        self.classes.insert(
            0,
            SinkClass {
                format: sink.format(),
                sinks: vec![sink],
            },
        );
    }

    /// Unlink a sink by identity. An emptied class is dropped.
    pub fn remove(&mut self, sink: &Sink) -> bool {
        for (class_index, class) in self.classes.iter_mut().enumerate() {
            if let Some(sink_index) = class
                .sinks
                .iter()
                .position(|s| std::ptr::eq(Arc::as_ptr(s), sink))
            {
                class.sinks.remove(sink_index);
                if class.sinks.is_empty() {
                    self.classes.remove(class_index);
                }
                return true;
            }
        }
        false
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> impl Iterator<Item = &SinkClass> {
        self.classes.iter()
    }

    /// Every attached sink, in class order.
    pub fn sinks(&self) -> impl Iterator<Item = &Arc<Sink>> {
        self.classes.iter().flat_map(|c| c.sinks.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChannelLayout, SampleFormat};

    fn sink(rate: u32, channels: usize, sample_format: SampleFormat) -> Arc<Sink> {
        Sink::new(SinkConfig {
            format: AudioFormat {
                sample_rate: rate,
                channel_layout: ChannelLayout::from_count(channels),
                sample_format,
            },
            buffer_size: 1024,
            ..SinkConfig::default()
        })
    }

    #[test]
    fn classes_partition_by_format() {
        let s1 = sink(44_100, 2, SampleFormat::S16);
        let s2 = sink(44_100, 2, SampleFormat::S16);
        let s3 = sink(48_000, 1, SampleFormat::F32);

        let mut map = SinkMap::new();
        map.add(Arc::clone(&s1));
        map.add(Arc::clone(&s2));
        map.add(Arc::clone(&s3));

        assert_eq!(map.class_count(), 2);
        for class in map.classes() {
            for s in class.sinks() {
                assert_eq!(s.format(), class.format());
            }
        }
        assert_eq!(map.sinks().count(), 3);
    }

    #[test]
    fn removing_the_last_sink_drops_the_class() {
        let s1 = sink(44_100, 2, SampleFormat::S16);
        let s2 = sink(48_000, 1, SampleFormat::F32);

        let mut map = SinkMap::new();
        map.add(Arc::clone(&s1));
        map.add(Arc::clone(&s2));
        assert_eq!(map.class_count(), 2);

        assert!(map.remove(&s2));
        assert_eq!(map.class_count(), 1);
        assert!(!map.remove(&s2));
        assert!(map.remove(&s1));
        assert_eq!(map.class_count(), 0);
    }

    #[test]
    fn attach_order_is_newest_first() {
        let s1 = sink(44_100, 2, SampleFormat::S16);
        let s2 = sink(48_000, 1, SampleFormat::F32);
        let s3 = sink(44_100, 2, SampleFormat::S16);

        let mut map = SinkMap::new();
        map.add(Arc::clone(&s1));
        map.add(Arc::clone(&s2));
        map.add(Arc::clone(&s3));

        // s3 joined s1's class, which stays where it was founded; s2's class
        // was prepended after it.
        let formats: Vec<AudioFormat> = map.classes().map(|c| c.format()).collect();
        assert_eq!(formats[0], s2.format());
        assert_eq!(formats[1], s1.format());

        // Within the class, the newest attachment is the example.
        let class = map
            .classes()
            .find(|c| c.format() == s1.format())
            .expect("class exists");
        assert!(Arc::ptr_eq(class.sinks().next().expect("head"), &s3));
    }

    #[test]
    fn queue_counters_track_contents() {
        let s = sink(44_100, 2, SampleFormat::S16);

        // min_queue_size is only computed at attach; set it directly here.
        s.min_queue_size.store(8, Ordering::SeqCst);

        let mut list = crate::item::ItemList::new();
        let id = list.insert(crate::file::test_support::dummy_file(), 1.0, None);
        let buffer = Buffer::new(vec![0u8; 8].into_boxed_slice(), 2, s.format(), id, 0.0);

        assert!(s.enqueue(Arc::clone(&buffer)));
        assert!(s.is_full());
        assert_eq!(s.counters.byte_size.load(Ordering::SeqCst), 8);

        match s.get_buffer(false) {
            SinkPoll::Buffer(b) => assert!(Arc::ptr_eq(&b, &buffer)),
            other => panic!("expected buffer, got {other:?}"),
        }
        assert_eq!(s.counters.byte_size.load(Ordering::SeqCst), 0);
        assert!(!s.is_full());
    }

    #[test]
    fn sentinel_bypasses_counters_and_maps_to_end() {
        let s = sink(44_100, 2, SampleFormat::S16);
        s.signal_end();
        assert_eq!(s.counters.buf_count.load(Ordering::SeqCst), 0);
        assert!(matches!(s.get_buffer(false), SinkPoll::End));
        assert!(matches!(s.get_buffer(false), SinkPoll::Empty));
    }

    #[test]
    fn purge_removes_only_matching_items() {
        let s = sink(44_100, 2, SampleFormat::S16);
        let mut list = crate::item::ItemList::new();
        let a = list.insert(crate::file::test_support::dummy_file(), 1.0, None);
        let b = list.insert(crate::file::test_support::dummy_file(), 1.0, None);

        let buf = |item| Buffer::new(vec![0u8; 4].into_boxed_slice(), 1, s.format(), item, 0.0);
        s.enqueue(buf(a));
        s.enqueue(buf(b));
        s.enqueue(buf(a));
        assert_eq!(s.counters.buf_count.load(Ordering::SeqCst), 3);

        s.purge(a);
        assert_eq!(s.counters.buf_count.load(Ordering::SeqCst), 1);
        match s.get_buffer(false) {
            SinkPoll::Buffer(kept) => assert_eq!(kept.item(), Some(b)),
            other => panic!("expected buffer, got {other:?}"),
        }
    }
}
