//! PCM format descriptors.
//!
//! A sink declares exactly one [`AudioFormat`]; the engine groups sinks into
//! equivalence classes by full-format equality and gives each class its own
//! conversion tail. Nothing here negotiates — formats either match or they
//! don't.

use std::fmt;

/// Interleaved PCM sample encodings supported at sink outputs.
///
/// The engine's internal processing format is `f32`; rendering to one of these
/// happens in the per-class conversion tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Unsigned 8-bit.
    U8,
    /// Signed 16-bit, native endian.
    S16,
    /// Signed 32-bit, native endian.
    S32,
    /// 32-bit float, native endian.
    F32,
    /// 64-bit float, native endian.
    F64,
}

impl SampleFormat {
    /// Size of one sample of this format, in bytes.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S32 => 4,
            SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }

    /// Short lowercase name, used in graph build logging.
    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16 => "s16",
            SampleFormat::S32 => "s32",
            SampleFormat::F32 => "f32",
            SampleFormat::F64 => "f64",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of speaker positions, stored as a bitmask.
///
/// Bit assignments follow the conventional front-left = 0x1, front-right = 0x2,
/// front-center = 0x4 layout, so masks translate directly to and from the
/// decoder library's channel flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelLayout(u64);

impl ChannelLayout {
    /// Front center only.
    pub const MONO: ChannelLayout = ChannelLayout(0x4);
    /// Front left + front right.
    pub const STEREO: ChannelLayout = ChannelLayout(0x3);

    /// Build a layout from a raw position bitmask.
    pub fn from_bits(bits: u64) -> ChannelLayout {
        ChannelLayout(bits)
    }

    /// The raw position bitmask.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// A default layout for a channel count: mono, stereo, or the first
    /// `count` positions for anything wider.
    pub fn from_count(count: usize) -> ChannelLayout {
        match count {
            1 => ChannelLayout::MONO,
            2 => ChannelLayout::STEREO,
            n if n < 64 => ChannelLayout((1u64 << n) - 1),
            _ => ChannelLayout(u64::MAX),
        }
    }

    /// Number of channels in this layout.
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A complete PCM output format: encoding, rate, and channel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    /// Bytes occupied by one frame (one sample per channel).
    pub fn bytes_per_frame(&self) -> usize {
        self.channel_layout.count() * self.sample_format.bytes_per_sample()
    }

    /// Bytes of PCM produced per second of audio in this format.
    pub fn bytes_per_sec(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }
}

impl Default for AudioFormat {
    /// The engine's native intermediate shape: stereo float at 44.1 kHz.
    fn default() -> Self {
        AudioFormat {
            sample_rate: 44_100,
            channel_layout: ChannelLayout::STEREO,
            sample_format: SampleFormat::F32,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}ch {}Hz {}",
            self.channel_layout.count(),
            self.sample_rate,
            self.sample_format
        )
    }
}
