//! Per-class PCM conversion: channel remix, resampling, and sample rendering.
//!
//! Each sink-format class owns one `FormatConverter` — the tail of the
//! conversion graph for that class. Input is the engine's interleaved `f32`
//! intermediate; output is finished PCM frames in the class format.
//!
//! Notes:
//! - The resampler only exists when the rates differ; the equal-rate path
//!   emits one output frame per input frame with no rechunking.
//! - rubato wants fixed-size input blocks, so the resampling path accumulates
//!   source frames and `drain()` zero-pads the remainder at end of stream.

use std::borrow::Cow;

use anyhow::{Context, Result, anyhow, bail};
use rubato::{Resampler, SincFixedIn, WindowFunction};

use crate::format::{AudioFormat, SampleFormat};

/// How many source frames we feed rubato per `process()` call.
/// Tradeoff: larger blocks = better throughput; smaller blocks = lower latency.
const RESAMPLE_BLOCK_FRAMES: usize = 2048;

/// One finished PCM frame in a class's output format.
pub(crate) struct PcmFrame {
    pub data: Box<[u8]>,
    pub frame_count: usize,
}

/// Converts the engine's interleaved `f32` stream into one class format.
pub(crate) struct FormatConverter {
    target: AudioFormat,
    resampler: Option<SincFixedIn<f32>>,
    // Accumulator for remixed source frames awaiting a full resampler block.
    // Interleaved at the target channel count, still at the source rate.
    acc: Vec<f32>,
}

impl FormatConverter {
    pub fn new(in_rate: u32, target: AudioFormat) -> Result<FormatConverter> {
        let resampler = if in_rate == target.sample_rate {
            None
        } else {
            let rs = SincFixedIn::<f32>::new(
                f64::from(target.sample_rate) / f64::from(in_rate),
                2.0,
                rubato::SincInterpolationParameters {
                    sinc_len: 256,
                    f_cutoff: 0.95,
                    interpolation: rubato::SincInterpolationType::Linear,
                    oversampling_factor: 256,
                    window: WindowFunction::BlackmanHarris2,
                },
                RESAMPLE_BLOCK_FRAMES,
                target.channel_layout.count(),
            )
            .map_err(|e| anyhow!(e))
            .context("failed to init resampler")?;
            Some(rs)
        };

        Ok(FormatConverter {
            target,
            resampler,
            acc: Vec::new(),
        })
    }

    /// Feed one interleaved `f32` frame; returns any finished output frames.
    pub fn push(&mut self, samples: &[f32], channels: usize) -> Result<Vec<PcmFrame>> {
        if channels == 0 || samples.is_empty() {
            return Ok(Vec::new());
        }

        let out_channels = self.target.channel_layout.count();
        let remixed = remix(samples, channels, out_channels);

        if self.resampler.is_none() {
            // Same rate: render straight through, one output frame per input.
            return Ok(vec![render(&remixed, out_channels, self.target.sample_format)]);
        }

        self.acc.extend_from_slice(&remixed);
        self.process_full_blocks()
    }

    /// Flush remaining buffered samples at end of stream.
    ///
    /// If resampling was never needed, this is a no-op.
    pub fn drain(&mut self) -> Result<Vec<PcmFrame>> {
        if self.resampler.is_none() || self.acc.is_empty() {
            return Ok(Vec::new());
        }

        // rubato expects exact block sizes; pad the remainder with zeros.
        let block = self.block_samples()?;
        let rem = self.acc.len() % block;
        if rem != 0 {
            self.acc.resize(self.acc.len() + (block - rem), 0.0);
        }

        let mut out = self.process_full_blocks()?;
        debug_assert!(self.acc.is_empty());
        out.retain(|f| f.frame_count > 0);
        Ok(out)
    }

    fn block_samples(&self) -> Result<usize> {
        let rs = self
            .resampler
            .as_ref()
            .ok_or_else(|| anyhow!("resampler not initialized"))?;
        Ok(rs.input_frames_max() * self.target.channel_layout.count())
    }

    fn process_full_blocks(&mut self) -> Result<Vec<PcmFrame>> {
        let out_channels = self.target.channel_layout.count();
        let block = self.block_samples()?;
        let mut out = Vec::new();

        while self.acc.len() >= block {
            let chunk: Vec<f32> = self.acc.drain(..block).collect();

            let rs = self
                .resampler
                .as_mut()
                .ok_or_else(|| anyhow!("resampler not initialized"))?;

            // Build rubato's expected per-channel input.
            let mut input: Vec<Vec<f32>> = vec![Vec::with_capacity(chunk.len() / out_channels); out_channels];
            for frame in chunk.chunks_exact(out_channels) {
                for (ch, sample) in frame.iter().enumerate() {
                    input[ch].push(*sample);
                }
            }

            let resampled = rs
                .process(&input, None)
                .map_err(|e| anyhow!(e))
                .context("resampler process failed")?;

            if resampled.len() != out_channels {
                bail!("resampler produced unexpected channel count");
            }

            let frames = resampled.first().map(Vec::len).unwrap_or(0);
            let mut interleaved = Vec::with_capacity(frames * out_channels);
            for n in 0..frames {
                for chan in &resampled {
                    interleaved.push(chan[n]);
                }
            }

            out.push(render(&interleaved, out_channels, self.target.sample_format));
        }

        Ok(out)
    }
}

/// Remap interleaved samples from `in_channels` to `out_channels`.
///
/// Policy: passthrough when equal; replicate a mono source; average down to
/// mono; anything wider-to-wider folds to mono first (simple, predictable).
fn remix(samples: &[f32], in_channels: usize, out_channels: usize) -> Cow<'_, [f32]> {
    if in_channels == out_channels {
        return Cow::Borrowed(samples);
    }

    let frames = samples.len() / in_channels;
    let mut out = Vec::with_capacity(frames * out_channels);

    for frame in samples.chunks_exact(in_channels) {
        let fill = if in_channels == 1 {
            frame[0]
        } else {
            frame.iter().sum::<f32>() / in_channels as f32
        };
        for _ in 0..out_channels {
            out.push(fill);
        }
    }

    Cow::Owned(out)
}

/// Render interleaved `f32` into the target sample encoding.
fn render(samples: &[f32], channels: usize, format: SampleFormat) -> PcmFrame {
    let mut data = Vec::with_capacity(samples.len() * format.bytes_per_sample());

    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        match format {
            SampleFormat::U8 => data.push((s * 127.0 + 128.0) as u8),
            SampleFormat::S16 => data.extend_from_slice(&((s * 32_767.0) as i16).to_ne_bytes()),
            SampleFormat::S32 => {
                data.extend_from_slice(&((f64::from(s) * 2_147_483_647.0) as i32).to_ne_bytes())
            }
            SampleFormat::F32 => data.extend_from_slice(&s.to_ne_bytes()),
            SampleFormat::F64 => data.extend_from_slice(&f64::from(s).to_ne_bytes()),
        }
    }

    PcmFrame {
        data: data.into_boxed_slice(),
        frame_count: samples.len() / channels,
    }
}
