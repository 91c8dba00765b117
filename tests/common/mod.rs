//! Shared test doubles for the integration tests in this directory.
//!
//! The library's own `#[cfg(test)]` test doubles (`source::test_support`,
//! `encoder::test_support`, `endpoint::platform::test_support`) only compile
//! when the crate itself is built as the test target, so they are not
//! reachable from here; this module re-implements the small subset needed
//! against the crate's public API, the same doubles an external caller of
//! this crate would have to write.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;

use castpipe::codec_config::SourceConfig;
use castpipe::encoder::CodecBackend;
use castpipe::endpoint::platform::PlatformMuxer;
use castpipe::error::{Error, Result};
use castpipe::frame::Frame;
use castpipe::media_descriptor::MediaDescriptor;
use castpipe::muxer::{StreamConfig, StreamId};
use castpipe::source::{FrameSource, Lifecycle, Source, SourceFactory};
use castpipe::state::{new_throwable_cell, Observable, ThrowableCell};

/// A [`FrameSource`] double that hands back synthetic frames at a fixed
/// cadence, purely driven by calls to `read_frame`.
pub struct FakeFrameSource {
    streaming: Observable<bool>,
    throwable: ThrowableCell,
    next_pts_us: AtomicI64,
    period_us: i64,
    configured: StdMutex<Option<SourceConfig>>,
}

impl FakeFrameSource {
    pub fn new(period_us: i64) -> Self {
        FakeFrameSource {
            streaming: Observable::new(false),
            throwable: new_throwable_cell(),
            next_pts_us: AtomicI64::new(0),
            period_us,
            configured: StdMutex::new(None),
        }
    }

    pub fn configured_config(&self) -> Option<SourceConfig> {
        *self.configured.lock().unwrap()
    }
}

#[async_trait]
impl Lifecycle for FakeFrameSource {
    async fn configure(&self, config: SourceConfig) -> Result<()> {
        if self.streaming.get() {
            return Err(Error::invalid_state("configure while streaming"));
        }
        *self.configured.lock().unwrap() = Some(config);
        Ok(())
    }

    async fn start_stream(&self) -> Result<()> {
        self.streaming.set(true);
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        self.streaming.set(false);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.streaming.set(false);
        Ok(())
    }

    fn is_streaming(&self) -> Observable<bool> {
        self.streaming.clone()
    }

    fn throwable(&self) -> ThrowableCell {
        self.throwable.clone()
    }
}

impl FrameSource for FakeFrameSource {
    fn read_frame(&self) -> Result<Frame> {
        if !self.streaming.get() {
            return Err(Error::invalid_state("read_frame while not streaming"));
        }
        let pts = self.next_pts_us.fetch_add(self.period_us, Ordering::SeqCst);
        Ok(Frame::new(Bytes::from_static(b"\x00\x01\x02\x03"), pts).with_key_frame(true))
    }
}

/// Builds a [`Source::Frame`] from a fixed identity, so repeated calls to
/// `Pipeline::set_audio_source`/`set_video_source` with the same factory are
/// recognized as the same logical device.
pub struct FakeSourceFactory {
    pub id: String,
    pub period_us: i64,
}

impl SourceFactory for FakeSourceFactory {
    fn identity(&self) -> String {
        self.id.clone()
    }

    fn create(&self) -> Source {
        Source::Frame(Box::new(FakeFrameSource::new(self.period_us)))
    }
}

/// A [`CodecBackend`] double that passes raw payloads through unchanged,
/// marking every frame a key frame, emitting a fixed codec-config blob once.
pub struct PassthroughBackend {
    pub config_bytes: Option<Bytes>,
    pub fail_next: Arc<AtomicBool>,
}

impl CodecBackend for PassthroughBackend {
    fn codec_config(&mut self) -> Option<Bytes> {
        self.config_bytes.take()
    }

    fn push_input(&mut self, raw: Frame) -> Result<Vec<Frame>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::new(castpipe::error::ErrorKind::Codec, "synthetic failure"));
        }
        Ok(vec![raw])
    }
}

pub fn passthrough_backend<C>() -> castpipe::output::BackendFactory<C> {
    Arc::new(|_cfg: &C| Ok(Box::new(PassthroughBackend { config_bytes: None, fail_next: Arc::new(AtomicBool::new(false)) }) as Box<dyn CodecBackend>))
}

/// A [`PlatformMuxer`] double standing in for an OS-provided MP4/WebM muxer,
/// recording every write so scenario tests can assert on fan-out and
/// ordering.
pub struct FakePlatformMuxer {
    is_open: Observable<bool>,
    pub writes: StdMutex<Vec<(StreamId, Frame)>>,
    next_id: AtomicU32,
}

impl FakePlatformMuxer {
    pub fn new() -> Self {
        FakePlatformMuxer { is_open: Observable::new(false), writes: StdMutex::new(Vec::new()), next_id: AtomicU32::new(0) }
    }
}

#[async_trait]
impl PlatformMuxer for FakePlatformMuxer {
    async fn open(&self, _descriptor: &MediaDescriptor) -> Result<()> {
        self.is_open.set(true);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.is_open.set(false);
        Ok(())
    }

    fn add_streams(&self, configs: &[StreamConfig]) -> Result<Vec<StreamId>> {
        Ok(configs.iter().map(|_| StreamId(self.next_id.fetch_add(1, Ordering::SeqCst))).collect())
    }

    fn write(&self, stream_id: StreamId, frame: Frame) -> Result<()> {
        self.writes.lock().unwrap().push((stream_id, frame));
        Ok(())
    }

    async fn start_stream(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_stream(&self) -> Result<()> {
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> Observable<bool> {
        self.is_open.clone()
    }
}

/// Reads a u24 big-endian field, the width FLV uses for tag `DataSize` and
/// the low 24 bits of its extended timestamp.
pub fn u24_be(b: &[u8]) -> u32 {
    (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2])
}
