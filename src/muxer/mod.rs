//! Muxer contract (spec.md §4.3): turns encoded frames into container
//! packets without doing any I/O itself. A muxer is handed frames per
//! stream id and emits packets to a [`PacketListener`]; something else (an
//! endpoint's sink) writes the resulting bytes.

pub mod amf;
pub mod flv;
pub mod ts;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec_config::{AudioCodecConfig, VideoCodecConfig};
use crate::error::Result;
use crate::frame::{Frame, Packet};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

#[derive(Clone, Debug, PartialEq)]
pub enum StreamConfig {
    Audio(AudioCodecConfig),
    Video(VideoCodecConfig),
}

impl StreamConfig {
    pub fn is_video(&self) -> bool {
        matches!(self, StreamConfig::Video(_))
    }
}

pub trait PacketListener: Send + Sync {
    fn on_packet(&self, packet: Packet);
}

/// Shared contract every container muxer implements.
///
/// `write` is thread-safe and consumes each frame exactly once; encoder
/// threads for distinct stream ids may call it concurrently (spec.md §5).
pub trait Muxer: Send + Sync {
    fn add_streams(&self, configs: &[StreamConfig]) -> Result<Vec<StreamId>>;

    fn add_stream(&self, config: StreamConfig) -> Result<StreamId> {
        Ok(self.add_streams(&[config])?[0])
    }

    /// Emits any container header and resets per-session framing state.
    fn start_stream(&self) -> Result<()>;

    fn write(&self, stream_id: StreamId, frame: Frame) -> Result<()>;

    /// Flushes trailers. Idempotent with `start_stream` for restart (spec.md
    /// §8 invariant 9).
    fn stop_stream(&self) -> Result<()>;

    fn release(&self) -> Result<()>;

    fn set_listener(&self, listener: Arc<dyn PacketListener>);
}

/// Tracks the pts of the first accepted frame and rebases every subsequent
/// frame to a zero-based session clock (spec.md §4.3.1's "startup_time"
/// rule). Frames that arrive before the startup frame is established are
/// dropped by returning `None`; this is shared between the FLV and MPEG-TS
/// muxers rather than duplicated (spec.md §3 supplement).
pub(crate) struct StartupClock {
    startup_us: Mutex<Option<i64>>,
}

impl StartupClock {
    pub fn new() -> Self {
        StartupClock { startup_us: Mutex::new(None) }
    }

    /// Establishes `frame` as the startup frame if none has been accepted
    /// yet. Returns the rebased frame, or `None` if `frame.pts_us()` is
    /// before the established startup time.
    pub fn accept(&self, frame: &Frame) -> Option<Frame> {
        let mut startup = self.startup_us.lock();
        match *startup {
            None => {
                *startup = Some(frame.pts_us());
                Some(frame.rebase(frame.pts_us()))
            }
            Some(t) => {
                if frame.pts_us() < t {
                    None
                } else {
                    Some(frame.rebase(t))
                }
            }
        }
    }

    /// True once a startup frame has been established.
    pub fn is_started(&self) -> bool {
        self.startup_us.lock().is_some()
    }

    /// Clears the established startup time, so the next `accept` starts a
    /// fresh session (used by `start_stream` on restart).
    pub fn reset(&self) {
        *self.startup_us.lock() = None;
    }
}
