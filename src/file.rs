// src/file.rs

//! Opened media files: probing, packet reading, decoding, and seeking.
//!
//! This module keeps container and codec concerns isolated from the engine:
//! - probe a path and select a reasonable default audio track
//! - read packets, folding end-of-stream into `None`
//! - decode packets into interleaved `f32` with a reusable scratch buffer
//! - carry the per-file control state the engine reads under its lock:
//!   the seek request cell, the EOF flag, the audio clock, and the abort flag
//!
//! A `File` is shared (`Arc`) between playlist items and the decode worker;
//! all interior state is independently synchronized, and the engine is the
//! only writer of the demux side.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result as AnyResult, anyhow};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::format::{AudioFormat, ChannelLayout, SampleFormat};

/// One decoded frame of audio, normalized to interleaved `f32`.
///
/// This is the engine's intermediate representation; per-sink formats are
/// produced later by the conversion graph.
pub(crate) struct DecodedFrame {
    pub samples: Vec<f32>,
    pub channels: usize,
}

/// Declared parameters of the selected audio stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamInfo {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
    pub time_base: Option<TimeBase>,
    pub start_ts: u64,
    pub n_frames: Option<u64>,
}

/// Pending seek request plus the end-of-stream flag, guarded together.
pub(crate) struct SeekState {
    /// Target timestamp in track time-base units; `None` when no seek is pending.
    pub pos: Option<u64>,
    /// Whether sink queues should be flushed when the seek is honored.
    pub flush: bool,
    pub eof: bool,
}

struct Demux {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    // Reusable scratch for interleaved f32 copies of decoded frames.
    sample_buf: Option<SampleBuffer<f32>>,
    buf_spec: Option<SignalSpec>,
    reading_paused: bool,
}

/// An opened, decodable media file.
pub struct File {
    path: PathBuf,
    track_id: u32,
    info: StreamInfo,
    demux: Mutex<Demux>,
    seek: Mutex<SeekState>,
    clock: Mutex<f64>,
    abort: AtomicBool,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("track_id", &self.track_id)
            .finish()
    }
}

impl File {
    /// Open a media file and prepare its default audio track for decoding.
    ///
    /// Track selection policy:
    /// - choose the first track that looks decodable (codec != NULL)
    /// - and has a known sample rate (required for conversion decisions downstream)
    pub fn open(path: impl AsRef<Path>) -> Result<File> {
        let path = path.as_ref().to_path_buf();

        let source = std::fs::File::open(&path)?;

        let mss_opts = MediaSourceStreamOptions {
            // The probe wants a power-of-two buffer > 32KiB for good behavior.
            buffer_len: 256 * 1024,
        };
        let mss = MediaSourceStream::new(Box::new(source), mss_opts);

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| anyhow!(e))
            .with_context(|| format!("failed to probe {}", path.display()))
            .map_err(Error::from)?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
            .cloned()
            .ok_or(Error::NoAudioTrack)?;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| anyhow!(e))
            .context("failed to create decoder for audio track")
            .map_err(Error::from)?;

        let params = &track.codec_params;
        let sample_rate = params.sample_rate.ok_or(Error::NoAudioTrack)?;
        let channel_layout = params
            .channels
            .map(|c| ChannelLayout::from_bits(u64::from(c.bits())))
            .unwrap_or(ChannelLayout::STEREO);
        let sample_format = params
            .sample_format
            .map(map_sample_format)
            .unwrap_or(SampleFormat::F32);

        let info = StreamInfo {
            sample_rate,
            channel_layout,
            sample_format,
            time_base: params.time_base,
            start_ts: params.start_ts,
            n_frames: params.n_frames,
        };

        Ok(File {
            path,
            track_id: track.id,
            info,
            demux: Mutex::new(Demux {
                format,
                decoder,
                sample_buf: None,
                buf_spec: None,
                reading_paused: false,
            }),
            seek: Mutex::new(SeekState {
                pos: None,
                flush: false,
                eof: false,
            }),
            clock: Mutex::new(0.0),
            abort: AtomicBool::new(false),
        })
    }

    /// The path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declared format of the audio stream (what the conversion graph's input
    /// side is parameterized with).
    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.info.sample_rate,
            channel_layout: self.info.channel_layout,
            sample_format: self.info.sample_format,
        }
    }

    /// Total duration in seconds, when the container declares a frame count.
    pub fn duration(&self) -> Option<f64> {
        let frames = self.info.n_frames?;
        Some(frames as f64 / f64::from(self.info.sample_rate))
    }

    /// Ask the decode worker to stop touching this file. The worker treats an
    /// aborted file as complete and moves on to the next playlist item.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub(crate) fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn demux(&self) -> MutexGuard<'_, Demux> {
        self.demux.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn seek_state(&self) -> MutexGuard<'_, SeekState> {
        self.seek.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm a seek request. The decode worker honors it before producing any
    /// further audio from this file.
    pub(crate) fn request_seek(&self, ts: u64, flush: bool) {
        let mut seek = self.seek_state();
        seek.pos = Some(ts);
        seek.flush = flush;
    }

    pub(crate) fn set_eof(&self) {
        self.seek_state().eof = true;
    }

    /// Current audio clock, in seconds from the start of the stream.
    pub(crate) fn clock(&self) -> f64 {
        *self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_clock(&self, seconds: f64) {
        *self.clock.lock().unwrap_or_else(PoisonError::into_inner) = seconds;
    }

    pub(crate) fn add_clock(&self, seconds: f64) {
        *self.clock.lock().unwrap_or_else(PoisonError::into_inner) += seconds;
    }

    /// Convert a position in seconds to a track timestamp, including the
    /// container's start offset.
    pub(crate) fn timestamp_for(&self, seconds: f64) -> u64 {
        let ts = match self.info.time_base {
            Some(tb) => {
                let time = Time {
                    seconds: seconds.trunc() as u64,
                    frac: seconds.fract(),
                };
                tb.calc_timestamp(time)
            }
            None => (seconds * f64::from(self.info.sample_rate)) as u64,
        };
        ts + self.info.start_ts
    }

    /// Convert a packet timestamp to seconds, when the track carries a time base.
    pub(crate) fn clock_from_ts(&self, ts: u64) -> Option<f64> {
        self.info.time_base.map(|tb| {
            let time = tb.calc_time(ts);
            time.seconds as f64 + time.frac
        })
    }

    /// Read-side pause bookkeeping. Only network-backed sources would suspend
    /// reads here; for local media the demuxer keeps serving packets and pause
    /// is enforced by the consumers.
    pub(crate) fn set_reading_paused(&self, paused: bool) {
        let mut demux = self.demux();
        demux.reading_paused = paused;
        debug!(file = %self.path.display(), paused, "read pause transition");
    }

    /// Read the next packet, treating end-of-stream (and any other read
    /// failure) as EOF. Non-EOF errors are logged.
    pub(crate) fn read_packet(&self) -> Option<Packet> {
        let mut demux = self.demux();
        match demux.format.next_packet() {
            Ok(packet) => Some(packet),
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                None
            }
            Err(err) => {
                warn!(file = %self.path.display(), error = %err, "error reading frames");
                None
            }
        }
    }

    /// Seek the container to `ts` and reset the decoder. The decoder reset
    /// happens regardless of seek success, matching the drop-codec-state
    /// behavior expected after any seek attempt.
    pub(crate) fn seek_to(&self, ts: u64) -> AnyResult<()> {
        let mut demux = self.demux();
        let result = demux.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts,
                track_id: self.track_id,
            },
        );
        demux.decoder.reset();
        result
            .map(|_| ())
            .map_err(|e| anyhow!(e))
            .with_context(|| format!("{}: error while seeking", self.path.display()))
    }

    /// True when the packet belongs to the selected audio track.
    pub(crate) fn is_audio_packet(&self, packet: &Packet) -> bool {
        packet.track_id() == self.track_id
    }

    /// Decode one packet into interleaved `f32`.
    ///
    /// Error handling policy:
    /// - decode errors skip the bad frame (common with some codecs)
    /// - IO errors are treated as a graceful end of stream
    /// - anything else bubbles up with context
    pub(crate) fn decode_packet(&self, packet: &Packet) -> AnyResult<Option<DecodedFrame>> {
        let mut demux = self.demux();
        let demux = &mut *demux;

        let decoded = match demux.decoder.decode(packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(err)) => {
                debug!(file = %self.path.display(), error = %err, "skipping undecodable frame");
                return Ok(None);
            }
            Err(SymphoniaError::IoError(_)) => return Ok(None),
            Err(err) => return Err(anyhow!(err)).context("decoder failure"),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if channels == 0 {
            return Ok(None);
        }

        let needed = decoded.capacity() * channels;
        let reusable = match (&demux.sample_buf, &demux.buf_spec) {
            (Some(buf), Some(prev)) => *prev == spec && buf.capacity() >= needed,
            _ => false,
        };
        if !reusable {
            demux.sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            demux.buf_spec = Some(spec);
        }

        let Some(buf) = demux.sample_buf.as_mut() else {
            return Ok(None);
        };
        buf.copy_interleaved_ref(decoded);

        Ok(Some(DecodedFrame {
            samples: buf.samples().to_vec(),
            channels,
        }))
    }
}

fn map_sample_format(fmt: symphonia::core::sample::SampleFormat) -> SampleFormat {
    use symphonia::core::sample::SampleFormat as Sym;
    match fmt {
        Sym::U8 | Sym::S8 => SampleFormat::U8,
        Sym::U16 | Sym::S16 => SampleFormat::S16,
        Sym::U24 | Sym::S24 | Sym::U32 | Sym::S32 => SampleFormat::S32,
        Sym::F32 => SampleFormat::F32,
        Sym::F64 => SampleFormat::F64,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{dummy_file, write_sine_wav};
    use super::*;

    #[test]
    fn open_reports_missing_file() {
        let err = File::open("/nonexistent/audio.flac").unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn open_selects_audio_track_and_format() {
        let file = dummy_file();
        let fmt = file.audio_format();
        assert_eq!(fmt.sample_rate, 44_100);
        assert_eq!(fmt.channel_layout.count(), 2);
    }

    #[test]
    fn duration_reflects_written_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half-second.wav");
        write_sine_wav(&path, 48_000, 0.5);
        let file = File::open(&path).unwrap();
        let duration = file.duration().expect("wav declares frame count");
        assert!((duration - 0.5).abs() < 0.01, "duration was {duration}");
    }

    #[test]
    fn packets_decode_to_interleaved_f32() {
        let file = dummy_file();
        let packet = file.read_packet().expect("first packet");
        assert!(file.is_audio_packet(&packet));
        let frame = file
            .decode_packet(&packet)
            .expect("decode")
            .expect("audio frame");
        assert_eq!(frame.channels, 2);
        assert!(!frame.samples.is_empty());
        assert_eq!(frame.samples.len() % frame.channels, 0);
    }

    #[test]
    fn reads_fold_end_of_stream_into_none() {
        let file = dummy_file();
        let mut packets = 0;
        while file.read_packet().is_some() {
            packets += 1;
            assert!(packets < 10_000, "runaway read loop");
        }
        assert!(packets > 0);
    }

    #[test]
    fn seek_rewinds_the_stream() {
        let file = dummy_file();
        while file.read_packet().is_some() {}
        file.seek_to(0).expect("seek to start");
        assert!(file.read_packet().is_some());
    }

    #[test]
    fn timestamp_round_trip_is_consistent() {
        let file = dummy_file();
        let ts = file.timestamp_for(0.02);
        if let Some(seconds) = file.clock_from_ts(ts) {
            assert!((seconds - 0.02).abs() < 0.005, "got {seconds}");
        }
    }
}
