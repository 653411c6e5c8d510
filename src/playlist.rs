//! The playlist: the public face of the engine.
//!
//! A `Playlist` owns the ordered items, the engine state, and the decode
//! worker. All mutation funnels through one lock, which is also what the
//! worker holds while it decodes — so every API call observes a consistent
//! engine, and ordering guarantees (seek-before-produce, purge-before-free)
//! fall out of the locking rather than careful signaling.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use crate::engine::{self, Shared};
use crate::error::{Error, Result};
use crate::file::File;
use crate::item::ItemId;
use crate::sink::Sink;

/// An ordered list of audio files decoded continuously, gaplessly, into every
/// attached sink.
///
/// Dropping the playlist clears it, stops the decode worker, and detaches all
/// sinks.
pub struct Playlist {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Playlist {
    /// Create an empty playlist and start its decode worker.
    ///
    /// Playback is initially un-paused; decoding begins as soon as both an
    /// item and a sink exist.
    pub fn new() -> Playlist {
        let shared = Arc::new(Shared::new());
        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || engine::run(shared))
        };
        Playlist {
            shared,
            worker: Some(worker),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Insert a file before `before`, or append when `before` is `None`.
    ///
    /// The first item inserted into an empty playlist becomes the decode head
    /// and its file is armed to start from the beginning.
    pub fn insert(&self, file: Arc<File>, gain: f64, before: Option<ItemId>) -> Result<ItemId> {
        let mut engine = self.shared.lock_engine();

        if let Some(before) = before {
            if !engine.list.contains(before) {
                return Err(Error::InvalidItem);
            }
        }

        let was_empty = engine.list.is_empty();
        let id = engine.list.insert(Arc::clone(&file), gain, before);

        if was_empty {
            engine.decode_head = Some(id);
            file.request_seek(0, false);
        }

        Ok(id)
    }

    /// Remove an item.
    ///
    /// If it is currently being decoded, the decode head advances to the next
    /// item. Buffers referencing the item are purged from every sink queue
    /// (and each sink's purge hook runs) before the item is freed.
    pub fn remove(&self, id: ItemId) -> Result<()> {
        let mut engine = self.shared.lock_engine();

        if !engine.list.contains(id) {
            return Err(Error::InvalidItem);
        }

        if engine.decode_head == Some(id) {
            engine.decode_head = engine.list.next_of(id);
        }

        let removed = engine.list.remove(id);
        engine.purge_sinks(id);

        drop(engine);
        // The file reference drops outside the lock.
        drop(removed);
        Ok(())
    }

    /// Remove every item.
    pub fn clear(&self) {
        // Collect first: handles go stale as soon as their item is removed.
        let ids = self.items();
        for id in ids {
            let _ = self.remove(id);
        }
    }

    /// Number of items in the playlist.
    pub fn count(&self) -> usize {
        self.shared.lock_engine().list.len()
    }

    /// Item handles in play order.
    pub fn items(&self) -> Vec<ItemId> {
        self.shared.lock_engine().list.ids()
    }

    /// Seek within an item and make it the decode head.
    ///
    /// Sink queues are flushed when the worker honors the request, so no
    /// pre-seek audio is delivered after this call takes effect.
    pub fn seek(&self, id: ItemId, seconds: f64) -> Result<()> {
        let mut engine = self.shared.lock_engine();

        let Some(item) = engine.list.get(id) else {
            return Err(Error::InvalidItem);
        };
        let file = Arc::clone(&item.file);

        file.request_seek(file.timestamp_for(seconds), true);
        engine.decode_head = Some(id);
        Ok(())
    }

    /// Update an item's gain (linear, 1.0 = unity). Takes effect within one
    /// decode iteration when the item is currently playing.
    pub fn set_gain(&self, id: ItemId, gain: f64) -> Result<()> {
        let mut engine = self.shared.lock_engine();
        if !engine.list.set_gain(id, gain) {
            return Err(Error::InvalidItem);
        }
        if engine.decode_head == Some(id) {
            engine.refresh_volume();
        }
        Ok(())
    }

    /// Set the playlist-wide volume (linear; clamped to [0, 1] when the
    /// conversion graph applies it).
    pub fn set_volume(&self, volume: f64) {
        let mut engine = self.shared.lock_engine();
        engine.global_volume = volume;
        engine.refresh_volume();
    }

    /// The playlist-wide volume.
    pub fn volume(&self) -> f64 {
        self.shared.lock_engine().global_volume
    }

    /// The item currently being decoded and its position in seconds.
    pub fn position(&self) -> Option<(ItemId, f64)> {
        let engine = self.shared.lock_engine();
        let head = engine.decode_head?;
        let seconds = engine
            .list
            .get(head)
            .map(|item| item.file.clock())
            .unwrap_or(0.0);
        Some((head, seconds))
    }

    /// Resume playback. A single-word flag; no lock is taken.
    pub fn play(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    /// Pause playback. A single-word flag; no lock is taken.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Whether playback is un-paused.
    pub fn playing(&self) -> bool {
        !self.shared.paused.load(Ordering::SeqCst)
    }
}

impl Default for Playlist {
    fn default() -> Self {
        Playlist::new()
    }
}

impl Drop for Playlist {
    fn drop(&mut self) {
        self.clear();

        // Wait for the decode worker to finish its iteration and exit.
        self.shared.abort.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        // Detach every sink so blocked consumers wake up and queued buffers
        // are released. Collected under the lock, detached outside it.
        let sinks: Vec<Arc<Sink>> = {
            let engine = self.shared.lock_engine();
            engine.sink_map.sinks().cloned().collect()
        };
        for sink in sinks {
            let _ = sink.detach();
        }
    }
}
