//! The raw/compressed frame and muxed packet types that flow through the
//! pipeline, plus the media-format descriptor attached to the first frame of
//! a stream.

use bytes::Bytes;
use pretty_hex::PrettyHex;

/// Sample-rate-independent audio byte layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16,
    F32,
}

/// Format metadata carried on the first frame (or whenever it changes) of a
/// stream, per spec.md §3 ("Frame ... optional format descriptor").
#[derive(Clone, Debug, PartialEq)]
pub enum FormatDescriptor {
    Audio { mime: &'static str, sample_rate: u32, channels: u8 },
    Video { mime: &'static str, width: u32, height: u32 },
}

/// An immutable raw or compressed media buffer with timing metadata.
///
/// `pts` is non-negative after normalization (spec.md §3 invariant); a
/// codec-config frame (`is_codec_config`) carries codec-specific out-of-band
/// data and must never be forwarded to the wire as a normal sample (spec.md
/// §4.3.1, invariant 7).
#[derive(Clone)]
pub struct Frame {
    payload: Bytes,
    pts_us: i64,
    dts_us: Option<i64>,
    is_key_frame: bool,
    is_codec_config: bool,
    is_end_of_stream: bool,
    format: Option<FormatDescriptor>,
}

impl Frame {
    pub fn new(payload: Bytes, pts_us: i64) -> Self {
        Frame {
            payload,
            pts_us,
            dts_us: None,
            is_key_frame: false,
            is_codec_config: false,
            is_end_of_stream: false,
            format: None,
        }
    }

    pub fn with_dts(mut self, dts_us: i64) -> Self {
        self.dts_us = Some(dts_us);
        self
    }

    pub fn with_key_frame(mut self, is_key_frame: bool) -> Self {
        self.is_key_frame = is_key_frame;
        self
    }

    pub fn with_codec_config(mut self, is_codec_config: bool) -> Self {
        self.is_codec_config = is_codec_config;
        self
    }

    pub fn with_end_of_stream(mut self, is_end_of_stream: bool) -> Self {
        self.is_end_of_stream = is_end_of_stream;
        self
    }

    pub fn with_format(mut self, format: FormatDescriptor) -> Self {
        self.format = Some(format);
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn pts_us(&self) -> i64 {
        self.pts_us
    }

    /// Rebases this frame's timestamps by subtracting `startup_us`, per the
    /// muxer startup-time rule (spec.md §4.3.1). Panics if the caller hasn't
    /// already checked `pts_us >= startup_us` — callers drop such frames
    /// instead of rebasing them negative.
    pub fn rebase(&self, startup_us: i64) -> Frame {
        assert!(self.pts_us >= startup_us, "rebase would produce a negative pts");
        let mut f = self.clone();
        f.pts_us -= startup_us;
        f.dts_us = f.dts_us.map(|d| d - startup_us);
        f
    }

    pub fn dts_us(&self) -> i64 {
        self.dts_us.unwrap_or(self.pts_us)
    }

    pub fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }

    pub fn is_codec_config(&self) -> bool {
        self.is_codec_config
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.is_end_of_stream
    }

    pub fn format(&self) -> Option<&FormatDescriptor> {
        self.format.as_ref()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("pts_us", &self.pts_us)
            .field("dts_us", &self.dts_us)
            .field("is_key_frame", &self.is_key_frame)
            .field("is_codec_config", &self.is_codec_config)
            .field("is_end_of_stream", &self.is_end_of_stream)
            .field("format", &self.format)
            .field("payload_len", &self.payload.len())
            .field("payload", &self.payload.hex_dump())
            .finish()
    }
}

/// A container-framed byte buffer emitted by a muxer. The muxer guarantees
/// this buffer is self-framing enough for its container (a TS packet, an FLV
/// tag, ...); a [`crate::sink::Sink`] just writes the bytes.
#[derive(Clone)]
pub struct Packet {
    data: Bytes,
    timestamp_us: i64,
}

impl Packet {
    pub fn new(data: Bytes, timestamp_us: i64) -> Self {
        Packet { data, timestamp_us }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn timestamp_us(&self) -> i64 {
        self.timestamp_us
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("timestamp_us", &self.timestamp_us)
            .field("len", &self.data.len())
            .field("data", &self.data.hex_dump())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_subtracts_startup_time() {
        let f = Frame::new(Bytes::from_static(b"abc"), 1_000).with_dts(900);
        let r = f.rebase(200);
        assert_eq!(r.pts_us(), 800);
        assert_eq!(r.dts_us(), 700);
    }

    #[test]
    #[should_panic(expected = "negative pts")]
    fn rebase_below_startup_panics() {
        let f = Frame::new(Bytes::from_static(b"abc"), 100);
        let _ = f.rebase(200);
    }
}
