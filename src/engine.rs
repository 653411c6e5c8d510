//! The decode engine: shared state and the background worker.
//!
//! One long-lived thread drives everything: it advances the decode head,
//! pulls packets, pushes decoded frames through the conversion graph, and
//! multicasts finished buffers into every sink queue. API threads mutate the
//! same state under the engine lock; the worker picks changes up on its next
//! iteration.
//!
//! Failure policy: nothing thrown inside the worker escapes it. A file that
//! cannot build a graph, that errors out, or that simply ends, advances the
//! decode head; bad packets are skipped; enqueue failures are logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use symphonia::core::formats::Packet;
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::file::File;
use crate::graph::{Graph, InputSpec};
use crate::item::{ItemId, ItemList};
use crate::sink::{Sink, SinkMap};

/// How long to wait between iterations when there is nothing to decode, or
/// when every sink is full.
pub(crate) const NOOP_DELAY: Duration = Duration::from_millis(5);

/// State shared between the playlist handle and the decode worker.
pub(crate) struct Shared {
    pub engine: Mutex<Engine>,
    pub paused: AtomicBool,
    pub abort: AtomicBool,
}

impl Shared {
    pub fn new() -> Shared {
        Shared {
            engine: Mutex::new(Engine::new()),
            paused: AtomicBool::new(false),
            abort: AtomicBool::new(false),
        }
    }

    pub fn lock_engine(&self) -> MutexGuard<'_, Engine> {
        // A poisoned engine lock means a thread panicked mid-mutation; the
        // remaining state is still structurally sound.
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a decode iteration decided about the current item.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    /// Keep decoding this item.
    Continue,
    /// This item is finished (or failed); move to the next one.
    Advance,
}

/// Everything guarded by the engine lock.
pub(crate) struct Engine {
    pub list: ItemList,
    pub decode_head: Option<ItemId>,
    /// The playlist-wide volume.
    pub global_volume: f64,
    /// The effective volume: current item gain × global volume.
    pub volume: f64,
    /// One-shot request from API threads to rebuild the graph.
    pub rebuild_flag: bool,
    pub sink_map: SinkMap,
    pub sent_end_of_q: bool,
    pub graph: Option<Graph>,
    last_paused: bool,
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            list: ItemList::new(),
            decode_head: None,
            global_volume: 1.0,
            volume: 1.0,
            rebuild_flag: false,
            sink_map: SinkMap::new(),
            sent_end_of_q: false,
            graph: None,
            last_paused: false,
        }
    }

    pub fn add_sink(&mut self, sink: Arc<Sink>) {
        self.sink_map.add(sink);
        self.rebuild_flag = true;
    }

    pub fn remove_sink(&mut self, sink: &Sink) {
        if self.sink_map.remove(sink) {
            self.rebuild_flag = true;
        }
    }

    /// Recompute the effective volume from the decode head's gain.
    pub fn refresh_volume(&mut self) {
        let gain = self
            .decode_head
            .and_then(|id| self.list.get(id))
            .map(|item| item.gain);
        self.volume = match gain {
            Some(gain) => self.global_volume * gain,
            None => self.global_volume,
        };
    }

    pub fn every_sink_full(&self) -> bool {
        self.sink_map.sinks().all(|sink| sink.is_full())
    }

    pub fn signal_end_to_all(&self) {
        for sink in self.sink_map.sinks() {
            sink.signal_end();
        }
    }

    pub fn flush_sinks(&self) {
        for sink in self.sink_map.sinks() {
            sink.flush_queue();
        }
    }

    pub fn purge_sinks(&self, item: ItemId) {
        for sink in self.sink_map.sinks() {
            sink.purge(item);
        }
    }

    fn maybe_rebuild(&mut self, file: &File) -> anyhow::Result<()> {
        let input = InputSpec::of(file);
        let up_to_date = !self.rebuild_flag
            && self
                .graph
                .as_ref()
                .is_some_and(|g| g.matches(&input, self.volume));
        if up_to_date {
            return Ok(());
        }

        // Tear down first so a failed build leaves no stale graph installed.
        self.graph = None;
        let graph = Graph::build(input, self.volume, &self.sink_map)?;
        debug!(
            filter_volume = graph.filter_volume(),
            volume_stage = graph.has_volume_stage(),
            split = graph.has_split(),
            outputs = graph.class_count(),
            "conversion graph rebuilt",
        );
        self.graph = Some(graph);
        self.rebuild_flag = false;
        Ok(())
    }

    /// Run one decode step for the item at the decode head.
    pub fn decode_one_frame(&mut self, paused: bool, item: ItemId, file: &Arc<File>) -> Step {
        if let Err(err) = self.maybe_rebuild(file) {
            warn!("failed to build conversion graph: {err:#}");
            return Step::Advance;
        }

        // Set while the file is being torn down elsewhere.
        if file.aborted() {
            return Step::Advance;
        }

        if paused != self.last_paused {
            self.last_paused = paused;
            file.set_reading_paused(paused);
        }

        let eof = {
            let mut seek = file.seek_state();
            if let Some(ts) = seek.pos {
                match file.seek_to(ts) {
                    Ok(()) => {
                        if seek.flush {
                            self.flush_sinks();
                        }
                    }
                    Err(err) => warn!("{err:#}"),
                }
                seek.pos = None;
                seek.eof = false;
            }
            seek.eof
        };

        if eof {
            // End of file: flush conversion latency out of the graph. Output
            // means keep flushing; silence means the item is complete.
            return match self.drain_graph(item, file) {
                Ok(bytes) if bytes > 0 => Step::Continue,
                Ok(_) => Step::Advance,
                Err(err) => {
                    warn!("error draining graph: {err:#}");
                    Step::Advance
                }
            };
        }

        let Some(packet) = file.read_packet() else {
            file.set_eof();
            return Step::Continue;
        };

        // We're only interested in the one selected audio stream.
        if !file.is_audio_packet(&packet) {
            return Step::Continue;
        }

        if let Err(err) = self.audio_decode_frame(item, file, &packet) {
            debug!("decode error; skipping packet: {err:#}");
        }
        Step::Continue
    }

    /// Decode one packet, write it into the graph, and fan the class outputs
    /// out to their sinks. Returns the largest per-class byte total.
    fn audio_decode_frame(
        &mut self,
        item: ItemId,
        file: &Arc<File>,
        packet: &Packet,
    ) -> anyhow::Result<usize> {
        // Update the audio clock with the pts if we can.
        let pts_clock = file.clock_from_ts(packet.ts());
        if let Some(seconds) = pts_clock {
            file.set_clock(seconds);
        }

        let Some(frame) = file.decode_packet(packet)? else {
            return Ok(0);
        };

        let graph = self
            .graph
            .as_mut()
            .ok_or_else(|| anyhow!("no conversion graph"))?;
        graph.push_frame(&frame.samples, frame.channels)?;

        Ok(self.fan_out(item, file, pts_clock.is_some()))
    }

    /// Flush every tail's conversion latency and deliver whatever comes out.
    fn drain_graph(&mut self, item: ItemId, file: &File) -> anyhow::Result<usize> {
        let Some(graph) = self.graph.as_mut() else {
            return Ok(0);
        };
        graph.drain()?;
        Ok(self.fan_out(item, file, false))
    }

    /// Harvest every class output port and multicast into the class's sinks.
    ///
    /// Without a packet pts, the audio clock advances by the biggest class's
    /// bytes over that class's byte rate.
    fn fan_out(&mut self, item: ItemId, file: &File, have_pts: bool) -> usize {
        let Engine {
            graph, sink_map, ..
        } = self;
        let Some(graph) = graph.as_mut() else {
            return 0;
        };

        let mut max_bytes = 0usize;
        let mut clock_adjustment = 0.0f64;

        for (class_index, class) in sink_map.classes().enumerate() {
            // Tails were built from this map in this order.
            debug_assert_eq!(graph.class_format(class_index), Some(class.format()));
            let mut class_bytes = 0usize;

            while let Some(pcm) = graph.pull(class_index) {
                let buffer = Buffer::new(
                    pcm.data,
                    pcm.frame_count,
                    class.format(),
                    item,
                    file.clock(),
                );
                class_bytes += buffer.size();

                for sink in class.sinks() {
                    if !sink.enqueue(Arc::clone(&buffer)) {
                        warn!("unable to put buffer in queue");
                    }
                }
                // `buffer` drops here: the producer reference goes away, and a
                // buffer no sink accepted is freed on the spot.
            }

            if class_bytes > max_bytes {
                max_bytes = class_bytes;
                let bytes_per_sec = class.format().bytes_per_sec();
                if bytes_per_sec > 0 {
                    clock_adjustment = class_bytes as f64 / bytes_per_sec as f64;
                }
            }
        }

        if !have_pts && max_bytes > 0 {
            file.add_clock(clock_adjustment);
        }
        max_bytes
    }
}

/// The decode worker: decodes and inserts buffers of converted audio into
/// each sink until asked to abort.
pub(crate) fn run(shared: Arc<Shared>) {
    while !shared.abort.load(Ordering::SeqCst) {
        let mut engine = shared.lock_engine();

        // If we don't have anything to decode, wait until we do.
        let Some(head) = engine.decode_head else {
            if !engine.sent_end_of_q {
                engine.signal_end_to_all();
                engine.sent_end_of_q = true;
            }
            drop(engine);
            thread::sleep(NOOP_DELAY);
            continue;
        };
        engine.sent_end_of_q = false;

        // If all sinks are filled up, no need to read more.
        if engine.every_sink_full() {
            drop(engine);
            thread::sleep(NOOP_DELAY);
            continue;
        }

        let Some((file, gain)) = engine
            .list
            .get(head)
            .map(|item| (Arc::clone(&item.file), item.gain))
        else {
            engine.decode_head = None;
            continue;
        };

        engine.volume = gain * engine.global_volume;

        let paused = shared.paused.load(Ordering::SeqCst);
        if engine.decode_one_frame(paused, head, &file) == Step::Advance {
            engine.decode_head = engine.list.next_of(head);
            // Start the next song from its beginning.
            if let Some(next) = engine.decode_head {
                if let Some(next_item) = engine.list.get(next) {
                    next_item.file.request_seek(0, false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::test_support::dummy_file;
    use crate::format::{AudioFormat, ChannelLayout, SampleFormat};
    use crate::sink::{SinkConfig, SinkPoll};

    fn attached_sink(engine: &mut Engine, format: AudioFormat) -> Arc<Sink> {
        let sink = Sink::new(SinkConfig {
            format,
            buffer_size: 512,
            ..SinkConfig::default()
        });
        // Engine-level tests skip the playlist handle; insert directly.
        engine.add_sink(Arc::clone(&sink));
        sink
    }

    fn s16_stereo(rate: u32) -> AudioFormat {
        AudioFormat {
            sample_rate: rate,
            channel_layout: ChannelLayout::STEREO,
            sample_format: SampleFormat::S16,
        }
    }

    #[test]
    fn sink_changes_set_the_rebuild_flag() {
        let mut engine = Engine::new();
        let sink = attached_sink(&mut engine, s16_stereo(44_100));
        assert!(engine.rebuild_flag);
        engine.rebuild_flag = false;
        engine.remove_sink(&sink);
        assert!(engine.rebuild_flag);
    }

    #[test]
    fn effective_volume_tracks_head_gain() {
        let mut engine = Engine::new();
        let id = engine.list.insert(dummy_file(), 0.5, None);
        engine.global_volume = 0.5;
        engine.refresh_volume();
        assert_eq!(engine.volume, 0.5); // no head yet

        engine.decode_head = Some(id);
        engine.refresh_volume();
        assert_eq!(engine.volume, 0.25);
    }

    #[test]
    fn no_sinks_counts_as_every_sink_full() {
        let engine = Engine::new();
        assert!(engine.every_sink_full());
    }

    #[test]
    fn decodes_a_file_end_to_end_into_a_sink() {
        let mut engine = Engine::new();
        let sink = attached_sink(&mut engine, s16_stereo(44_100));

        let file = dummy_file();
        let id = engine.list.insert(Arc::clone(&file), 1.0, None);
        engine.decode_head = Some(id);
        file.request_seek(0, false);

        let mut produced = Vec::new();
        for _ in 0..10_000 {
            let step = engine.decode_one_frame(false, id, &file);
            while let SinkPoll::Buffer(buffer) = sink.get_buffer(false) {
                produced.push(buffer);
            }
            if step == Step::Advance {
                break;
            }
        }

        assert!(!produced.is_empty());
        for buffer in &produced {
            assert_eq!(buffer.format(), s16_stereo(44_100));
            assert_eq!(buffer.item(), Some(id));
            assert!(buffer.size() > 0);
        }

        // Positions never run backwards across the item.
        let positions: Vec<f64> = produced.iter().map(|b| b.pos()).collect();
        for pair in positions.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn resampling_class_gets_converted_audio() {
        let mut engine = Engine::new();
        let sink = attached_sink(&mut engine, s16_stereo(22_050));

        let file = dummy_file(); // 44.1 kHz source
        let id = engine.list.insert(Arc::clone(&file), 1.0, None);
        engine.decode_head = Some(id);
        file.request_seek(0, false);

        let mut frames_out = 0usize;
        for _ in 0..10_000 {
            let step = engine.decode_one_frame(false, id, &file);
            while let SinkPoll::Buffer(buffer) = sink.get_buffer(false) {
                assert_eq!(buffer.format().sample_rate, 22_050);
                frames_out += buffer.frame_count();
            }
            if step == Step::Advance {
                break;
            }
        }

        // 0.05s at 22.05 kHz is ~1102 frames; the drain path must have
        // flushed the resampler remainder, so expect most of it.
        assert!(frames_out > 800, "got {frames_out}");
    }
}
