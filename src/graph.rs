//! The conversion graph: source → optional volume → fan-out → per-class tails.
//!
//! The graph is rebuilt from scratch whenever its shape or parameters go
//! stale: a different input format, a changed effective volume, or a changed
//! set of sink-format classes. The rebuild predicate sits on the decode hot
//! path, so the graph keeps a snapshot of everything it was built from and
//! compares cheaply.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use tracing::debug;

use crate::convert::{FormatConverter, PcmFrame};
use crate::file::File;
use crate::format::{AudioFormat, ChannelLayout, SampleFormat};
use crate::sink::SinkMap;

/// Input-side parameters the graph was built against.
///
/// Any field changing forces a rebuild before the next frame is written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct InputSpec {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
    pub time_base: Option<(u32, u32)>,
}

impl InputSpec {
    pub fn of(file: &File) -> InputSpec {
        let info = file.stream_info();
        InputSpec {
            sample_rate: info.sample_rate,
            channel_layout: info.channel_layout,
            sample_format: info.sample_format,
            time_base: info.time_base.map(|tb| (tb.numer, tb.denom)),
        }
    }
}

struct ClassTail {
    format: AudioFormat,
    converter: FormatConverter,
    // The class's output port: finished frames awaiting harvest.
    output: VecDeque<PcmFrame>,
}

pub(crate) struct Graph {
    input: InputSpec,
    /// The effective volume this graph was built from, unclamped. Compared
    /// against the engine's current volume by the rebuild predicate.
    filter_volume: f64,
    /// The volume stage: present only when the clamped volume is not unity.
    gain: Option<f64>,
    /// Whether a fan-out stage exists (two or more classes).
    split: bool,
    tails: Vec<ClassTail>,
    // Scratch for the volume-applied copy of the current frame.
    scratch: Vec<f32>,
}

impl Graph {
    /// Build a graph for the current input format, volume, and sink classes.
    ///
    /// On failure nothing is installed; the caller retries (or advances) with
    /// no graph in place.
    pub fn build(input: InputSpec, volume: f64, sink_map: &SinkMap) -> Result<Graph> {
        debug!(
            sample_rate = input.sample_rate,
            channel_layout = %input.channel_layout,
            sample_format = %input.sample_format,
            time_base = ?input.time_base,
            "graph source",
        );

        let clamped = volume.clamp(0.0, 1.0);
        let gain = (clamped != 1.0).then_some(clamped);
        if let Some(gain) = gain {
            debug!(gain, "graph volume stage");
        }

        let split = sink_map.class_count() >= 2;
        if split {
            debug!(outputs = sink_map.class_count(), "graph split stage");
        }

        let mut tails = Vec::with_capacity(sink_map.class_count());
        for class in sink_map.classes() {
            let format = class.format();
            debug!(format = %format, "graph output tail");
            let converter = FormatConverter::new(input.sample_rate, format)
                .with_context(|| format!("failed to create conversion tail for {format}"))?;
            tails.push(ClassTail {
                format,
                converter,
                output: VecDeque::new(),
            });
        }

        Ok(Graph {
            input,
            filter_volume: volume,
            gain,
            split,
            tails,
            scratch: Vec::new(),
        })
    }

    /// True when this graph still matches the input parameters and volume.
    pub fn matches(&self, input: &InputSpec, volume: f64) -> bool {
        self.input == *input && self.filter_volume == volume
    }

    /// Write one decoded frame into the graph; every class tail converts it
    /// and queues finished output frames on its port.
    pub fn push_frame(&mut self, samples: &[f32], channels: usize) -> Result<()> {
        let samples: &[f32] = match self.gain {
            Some(gain) => {
                let gain = gain as f32;
                self.scratch.clear();
                self.scratch.extend(samples.iter().map(|s| s * gain));
                &self.scratch
            }
            None => samples,
        };

        for tail in &mut self.tails {
            let produced = tail
                .converter
                .push(samples, channels)
                .context("error writing frame into conversion tail")?;
            tail.output.extend(produced);
        }
        Ok(())
    }

    /// Flush conversion latency out of every tail (end of the current file).
    pub fn drain(&mut self) -> Result<()> {
        for tail in &mut self.tails {
            let produced = tail.converter.drain().context("error draining tail")?;
            tail.output.extend(produced);
        }
        Ok(())
    }

    /// Pull the next finished frame from a class's output port.
    pub fn pull(&mut self, class: usize) -> Option<PcmFrame> {
        self.tails.get_mut(class)?.output.pop_front()
    }

    pub fn class_count(&self) -> usize {
        self.tails.len()
    }

    pub fn class_format(&self, class: usize) -> Option<AudioFormat> {
        self.tails.get(class).map(|t| t.format)
    }

    pub fn filter_volume(&self) -> f64 {
        self.filter_volume
    }

    pub fn has_volume_stage(&self) -> bool {
        self.gain.is_some()
    }

    pub fn has_split(&self) -> bool {
        self.split
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::format::{ChannelLayout, SampleFormat};
    use crate::sink::{Sink, SinkConfig, SinkMap};

    fn spec(rate: u32) -> InputSpec {
        InputSpec {
            sample_rate: rate,
            channel_layout: ChannelLayout::STEREO,
            sample_format: SampleFormat::F32,
            time_base: Some((1, rate)),
        }
    }

    fn sink(rate: u32, channels: usize, sample_format: SampleFormat) -> Arc<Sink> {
        Sink::new(SinkConfig {
            format: AudioFormat {
                sample_rate: rate,
                channel_layout: ChannelLayout::from_count(channels),
                sample_format,
            },
            ..SinkConfig::default()
        })
    }

    fn map_of(sinks: &[Arc<Sink>]) -> SinkMap {
        let mut map = SinkMap::new();
        for s in sinks {
            map.add(Arc::clone(s));
        }
        map
    }

    #[test]
    fn unity_volume_omits_the_volume_stage() {
        let map = map_of(&[sink(48_000, 2, SampleFormat::F32)]);
        let graph = Graph::build(spec(48_000), 1.0, &map).unwrap();
        assert!(!graph.has_volume_stage());
        assert_eq!(graph.filter_volume(), 1.0);
    }

    #[test]
    fn volume_is_clamped_but_filter_volume_is_not() {
        let map = map_of(&[sink(48_000, 2, SampleFormat::F32)]);
        let graph = Graph::build(spec(48_000), 1.5, &map).unwrap();
        // Clamped to unity: no stage, but the snapshot remembers 1.5 so a
        // later change back to 1.0 still triggers a rebuild.
        assert!(!graph.has_volume_stage());
        assert_eq!(graph.filter_volume(), 1.5);
        assert!(!graph.matches(&spec(48_000), 1.0));
    }

    #[test]
    fn split_appears_with_two_classes() {
        let one = map_of(&[
            sink(48_000, 2, SampleFormat::F32),
            sink(48_000, 2, SampleFormat::F32),
        ]);
        let graph = Graph::build(spec(48_000), 1.0, &one).unwrap();
        assert_eq!(graph.class_count(), 1);
        assert!(!graph.has_split());

        let two = map_of(&[
            sink(48_000, 2, SampleFormat::F32),
            sink(44_100, 1, SampleFormat::S16),
        ]);
        let graph = Graph::build(spec(48_000), 1.0, &two).unwrap();
        assert_eq!(graph.class_count(), 2);
        assert!(graph.has_split());
    }

    #[test]
    fn rebuild_predicate_tracks_input_and_volume() {
        let map = map_of(&[sink(48_000, 2, SampleFormat::F32)]);
        let graph = Graph::build(spec(48_000), 0.5, &map).unwrap();
        assert!(graph.matches(&spec(48_000), 0.5));
        assert!(!graph.matches(&spec(44_100), 0.5));
        assert!(!graph.matches(&spec(48_000), 0.25));

        let mut other = spec(48_000);
        other.time_base = Some((1, 90_000));
        assert!(!graph.matches(&other, 0.5));
    }

    #[test]
    fn volume_stage_scales_output() {
        let map = map_of(&[sink(48_000, 2, SampleFormat::F32)]);
        let mut graph = Graph::build(spec(48_000), 0.5, &map).unwrap();
        assert!(graph.has_volume_stage());

        graph.push_frame(&[0.8, -0.8], 2).unwrap();
        let frame = graph.pull(0).expect("one frame out");
        let out: Vec<f32> = frame
            .data
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(out, vec![0.4, -0.4]);
        assert!(graph.pull(0).is_none());
    }

    #[test]
    fn each_class_converts_to_its_own_format() {
        let map = map_of(&[
            sink(48_000, 2, SampleFormat::F32),
            sink(48_000, 1, SampleFormat::S16),
        ]);
        let mut graph = Graph::build(spec(48_000), 1.0, &map).unwrap();
        graph.push_frame(&[0.5, -0.5], 2).unwrap();

        // Classes are prepended on add, so the mono class is index 0.
        let mono = graph.pull(0).expect("mono frame");
        let stereo = graph.pull(1).expect("stereo frame");
        assert_eq!(graph.class_format(0).unwrap().channel_layout.count(), 1);
        assert_eq!(mono.data.len(), 2);
        assert_eq!(stereo.data.len(), 8);
    }
}
