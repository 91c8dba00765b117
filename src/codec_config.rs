//! Immutable per-stream codec parameters and the source-config
//! compatibility rules used to decide whether two outputs can share one
//! capture source (spec.md §3, §4.8).

use crate::frame::SampleFormat;

/// Audio mime-types this crate understands as codec-config targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AudioMime {
    Aac,
    Opus,
}

/// Video mime-types this crate understands as codec-config targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VideoMime {
    Avc,
    Hevc,
    Vp9,
    Av1,
}

/// Mono/stereo (or future multichannel) layout mask, matching the spec's
/// "channel layout (mono/stereo mask)" wording; kept as a small bitmask
/// rather than a plain channel count so callers can express layouts beyond
/// a simple count (e.g. dual-mono vs. true stereo) without a breaking change.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelLayout(u32);

impl ChannelLayout {
    pub const MONO: ChannelLayout = ChannelLayout(0b01);
    pub const STEREO: ChannelLayout = ChannelLayout(0b11);

    pub fn channel_count(self) -> u8 {
        self.0.count_ones() as u8
    }

    pub fn is_stereo(self) -> bool {
        self == ChannelLayout::STEREO
    }
}

/// Dynamic-range profile of a video stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DynamicRange {
    Sdr,
    Hlg,
    Hdr10,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Immutable audio codec configuration for one output's encoder.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioCodecConfig {
    pub mime: AudioMime,
    pub start_bitrate_bps: u32,
    pub sample_rate_hz: u32,
    pub channel_layout: ChannelLayout,
    pub sample_format: SampleFormat,
    pub profile: Option<u8>,
}

impl AudioCodecConfig {
    pub fn builder() -> AudioCodecConfigBuilder {
        AudioCodecConfigBuilder::default()
    }

    /// Two configs can share one audio source iff sample-rate, channel
    /// layout, and byte-format all match (spec.md §3).
    pub fn compatible_for_sharing(&self, other: &AudioCodecConfig) -> bool {
        self.sample_rate_hz == other.sample_rate_hz
            && self.channel_layout == other.channel_layout
            && self.sample_format == other.sample_format
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig::Audio {
            sample_rate_hz: self.sample_rate_hz,
            channel_layout: self.channel_layout,
            sample_format: self.sample_format,
        }
    }
}

#[derive(Default)]
pub struct AudioCodecConfigBuilder {
    mime: Option<AudioMime>,
    start_bitrate_bps: Option<u32>,
    sample_rate_hz: Option<u32>,
    channel_layout: Option<ChannelLayout>,
    sample_format: Option<SampleFormat>,
    profile: Option<u8>,
}

impl AudioCodecConfigBuilder {
    pub fn mime(mut self, mime: AudioMime) -> Self {
        self.mime = Some(mime);
        self
    }

    pub fn start_bitrate_bps(mut self, v: u32) -> Self {
        self.start_bitrate_bps = Some(v);
        self
    }

    pub fn sample_rate_hz(mut self, v: u32) -> Self {
        self.sample_rate_hz = Some(v);
        self
    }

    pub fn channel_layout(mut self, v: ChannelLayout) -> Self {
        self.channel_layout = Some(v);
        self
    }

    pub fn sample_format(mut self, v: SampleFormat) -> Self {
        self.sample_format = Some(v);
        self
    }

    pub fn profile(mut self, v: u8) -> Self {
        self.profile = Some(v);
        self
    }

    pub fn build(self) -> AudioCodecConfig {
        AudioCodecConfig {
            mime: self.mime.unwrap_or(AudioMime::Aac),
            start_bitrate_bps: self.start_bitrate_bps.unwrap_or(128_000),
            sample_rate_hz: self.sample_rate_hz.unwrap_or(44_100),
            channel_layout: self.channel_layout.unwrap_or(ChannelLayout::STEREO),
            sample_format: self.sample_format.unwrap_or(crate::frame::SampleFormat::S16),
            profile: self.profile,
        }
    }
}

/// Immutable video codec configuration for one output's encoder. Default
/// constants documented per spec.md §9: 1280x720 30fps 2 Mbps AVC.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoCodecConfig {
    pub mime: VideoMime,
    pub start_bitrate_bps: u32,
    pub resolution: Resolution,
    pub fps: u32,
    pub profile: Option<u8>,
    pub level: Option<u8>,
    pub gop_duration_secs: f32,
    pub dynamic_range: DynamicRange,
}

pub const DEFAULT_VIDEO_WIDTH: u32 = 1280;
pub const DEFAULT_VIDEO_HEIGHT: u32 = 720;
pub const DEFAULT_VIDEO_FPS: u32 = 30;
pub const DEFAULT_VIDEO_BITRATE_BPS: u32 = 2_000_000;

impl VideoCodecConfig {
    pub fn builder() -> VideoCodecConfigBuilder {
        VideoCodecConfigBuilder::default()
    }

    /// Two configs can share one video source iff fps and dynamic-range
    /// match; resolution mismatches are handled by the compositor
    /// downscaling per output (spec.md §3, §4.8).
    pub fn compatible_for_sharing(&self, other: &VideoCodecConfig) -> bool {
        self.fps == other.fps && self.dynamic_range == other.dynamic_range
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig::Video {
            resolution: self.resolution,
            fps: self.fps,
            dynamic_range: self.dynamic_range,
        }
    }
}

pub struct VideoCodecConfigBuilder {
    mime: VideoMime,
    start_bitrate_bps: u32,
    resolution: Resolution,
    fps: u32,
    profile: Option<u8>,
    level: Option<u8>,
    gop_duration_secs: f32,
    dynamic_range: DynamicRange,
}

impl Default for VideoCodecConfigBuilder {
    fn default() -> Self {
        VideoCodecConfigBuilder {
            mime: VideoMime::Avc,
            start_bitrate_bps: DEFAULT_VIDEO_BITRATE_BPS,
            resolution: Resolution { width: DEFAULT_VIDEO_WIDTH, height: DEFAULT_VIDEO_HEIGHT },
            fps: DEFAULT_VIDEO_FPS,
            profile: None,
            level: None,
            gop_duration_secs: 2.0,
            dynamic_range: DynamicRange::Sdr,
        }
    }
}

impl VideoCodecConfigBuilder {
    pub fn mime(mut self, v: VideoMime) -> Self {
        self.mime = v;
        self
    }

    pub fn start_bitrate_bps(mut self, v: u32) -> Self {
        self.start_bitrate_bps = v;
        self
    }

    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution { width, height };
        self
    }

    pub fn fps(mut self, v: u32) -> Self {
        self.fps = v;
        self
    }

    pub fn profile(mut self, v: u8) -> Self {
        self.profile = Some(v);
        self
    }

    pub fn level(mut self, v: u8) -> Self {
        self.level = Some(v);
        self
    }

    pub fn gop_duration_secs(mut self, v: f32) -> Self {
        self.gop_duration_secs = v;
        self
    }

    pub fn dynamic_range(mut self, v: DynamicRange) -> Self {
        self.dynamic_range = v;
        self
    }

    pub fn build(self) -> VideoCodecConfig {
        VideoCodecConfig {
            mime: self.mime,
            start_bitrate_bps: self.start_bitrate_bps,
            resolution: self.resolution,
            fps: self.fps,
            profile: self.profile,
            level: self.level,
            gop_duration_secs: self.gop_duration_secs,
            dynamic_range: self.dynamic_range,
        }
    }
}

/// The subset of a codec config that constrains the capture device, derived
/// per spec.md §3.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SourceConfig {
    Audio { sample_rate_hz: u32, channel_layout: ChannelLayout, sample_format: SampleFormat },
    Video { resolution: Resolution, fps: u32, dynamic_range: DynamicRange },
}
