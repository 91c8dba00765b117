//! Output (spec.md §4.7): one destination end-to-end pipe — zero-or-one
//! audio encoder, zero-or-one video encoder, and the endpoint they feed.
//! Cross-output codec compatibility (spec.md §4.8, §8 invariant 8) is
//! enforced by [`crate::pipeline::Pipeline`], which is the only component
//! that can see every output at once; `Output` itself only refuses
//! `set_*_codec_config` while streaming.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::codec_config::{AudioCodecConfig, VideoCodecConfig};
use crate::encoder::{AudioEncoder, CodecBackend, EncoderListener, VideoEncoder};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind, Result};
use crate::frame::Frame;
use crate::media_descriptor::MediaDescriptor;
use crate::muxer::{StreamConfig, StreamId};
use crate::state::{new_throwable_cell, Observable, ThrowableCell};

pub type BackendFactory<C> = Arc<dyn Fn(&C) -> Result<Box<dyn CodecBackend>> + Send + Sync>;

/// Forwards an encoder's compressed frames to the endpoint stream id
/// assigned at the first successful `start_stream` (spec.md §4.7). A
/// sustained codec error flips the output's `is_streaming` to false and
/// records the cause in `throwable` (spec.md §5 back-pressure policy, §7).
struct EncoderToEndpoint {
    endpoint: Arc<dyn Endpoint>,
    stream_id: StreamId,
    throwable: ThrowableCell,
    is_streaming: Observable<bool>,
}

impl EncoderListener for EncoderToEndpoint {
    fn on_frame(&self, frame: Frame) {
        if let Err(e) = self.endpoint.write(self.stream_id, frame) {
            log::warn!("output: endpoint write failed: {}", e);
        }
    }

    fn on_error(&self, err: &Error) {
        self.throwable.set(Some(err.into()));
        self.is_streaming.set(false);
        log::error!("output: encoder error, stopping stream: {}", err);
    }
}

struct StreamIds {
    audio: Option<StreamId>,
    video: Option<StreamId>,
}

/// One destination: audio/video encoders plus the endpoint they feed
/// (spec.md §4.7).
pub struct Output {
    endpoint: Arc<dyn Endpoint>,
    audio: Mutex<Option<AudioEncoder>>,
    video: Mutex<Option<VideoEncoder>>,
    audio_backend: Option<BackendFactory<AudioCodecConfig>>,
    video_backend: Option<BackendFactory<VideoCodecConfig>>,
    /// Display rotation applied to the video encoder's declared resolution
    /// at configure time (spec.md §4.2, §4.8's `add_output(..., default_rotation)`).
    rotation_degrees: Observable<u32>,
    is_open: Observable<bool>,
    is_streaming: Observable<bool>,
    throwable: ThrowableCell,
    stream_ids: Mutex<StreamIds>,
    streams_added: AtomicBool,
}

impl Output {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        audio_backend: Option<BackendFactory<AudioCodecConfig>>,
        video_backend: Option<BackendFactory<VideoCodecConfig>>,
        default_rotation_degrees: u32,
    ) -> Arc<Self> {
        Arc::new(Output {
            endpoint,
            audio: Mutex::new(None),
            video: Mutex::new(None),
            audio_backend,
            video_backend,
            rotation_degrees: Observable::new(default_rotation_degrees),
            is_open: Observable::new(false),
            is_streaming: Observable::new(false),
            throwable: new_throwable_cell(),
            stream_ids: Mutex::new(StreamIds { audio: None, video: None }),
            streams_added: AtomicBool::new(false),
        })
    }

    pub fn is_open(&self) -> Observable<bool> {
        self.is_open.clone()
    }

    pub fn is_streaming(&self) -> Observable<bool> {
        self.is_streaming.clone()
    }

    pub fn throwable(&self) -> ThrowableCell {
        self.throwable.clone()
    }

    pub fn set_rotation_degrees(&self, degrees: u32) {
        self.rotation_degrees.set(degrees);
    }

    /// Binds (or rebuilds) the audio encoder. Fails with
    /// [`ErrorKind::InvalidState`] while streaming. Cross-output
    /// `IncompatibleConfig` validation is the caller's (the pipeline's)
    /// responsibility (spec.md §4.8).
    pub async fn set_audio_codec_config(self: &Arc<Self>, cfg: AudioCodecConfig) -> Result<()> {
        if self.is_streaming.get() {
            return Err(Error::invalid_state("set_audio_codec_config while streaming"));
        }
        let make = self
            .audio_backend
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::UnsupportedCodec, "output has no audio backend"))?;
        let enc = AudioEncoder::new(move |c| make(c));
        enc.configure(cfg)?;
        *self.audio.lock().await = Some(enc);
        Ok(())
    }

    pub async fn set_video_codec_config(self: &Arc<Self>, cfg: VideoCodecConfig) -> Result<()> {
        if self.is_streaming.get() {
            return Err(Error::invalid_state("set_video_codec_config while streaming"));
        }
        let make = self
            .video_backend
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::UnsupportedCodec, "output has no video backend"))?;
        let enc = VideoEncoder::new(move |c| make(c));
        enc.configure(cfg, self.rotation_degrees.get())?;
        *self.video.lock().await = Some(enc);
        Ok(())
    }

    pub async fn open(&self, descriptor: &MediaDescriptor) -> Result<()> {
        self.endpoint.open(descriptor).await?;
        self.is_open.set(true);
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.endpoint.close().await?;
        self.is_open.set(false);
        Ok(())
    }

    /// Requires at least one configured encoder; starts the endpoint then
    /// the encoders (spec.md §4.7). Stream ids are assigned from
    /// `endpoint.add_streams` only on the very first successful start of
    /// this output's lifetime.
    pub async fn start_stream(self: &Arc<Self>) -> Result<()> {
        let audio = self.audio.lock().await;
        let video = self.video.lock().await;
        if audio.is_none() && video.is_none() {
            return Err(Error::not_configured("start_stream with no configured encoder"));
        }

        if !self.streams_added.load(Ordering::SeqCst) {
            let mut configs = Vec::new();
            if let Some(a) = audio.as_ref() {
                configs.push(StreamConfig::Audio(a.config().expect("configured")));
            }
            if let Some(v) = video.as_ref() {
                configs.push(StreamConfig::Video(v.config().expect("configured")));
            }
            let ids = self.endpoint.add_streams(&configs)?;
            let mut idx = 0;
            let mut stream_ids = self.stream_ids.lock().await;
            if audio.is_some() {
                stream_ids.audio = Some(ids[idx]);
                idx += 1;
            }
            if video.is_some() {
                stream_ids.video = Some(ids[idx]);
            }
            drop(stream_ids);
            self.streams_added.store(true, Ordering::SeqCst);
        }

        self.endpoint.start_stream().await?;

        let stream_ids = self.stream_ids.lock().await;
        if let Some(a) = audio.as_ref() {
            a.set_listener(Arc::new(EncoderToEndpoint {
                endpoint: Arc::clone(&self.endpoint),
                stream_id: stream_ids.audio.expect("audio stream id assigned"),
                throwable: self.throwable.clone(),
                is_streaming: self.is_streaming.clone(),
            }));
            a.start()?;
        }
        if let Some(v) = video.as_ref() {
            v.set_listener(Arc::new(EncoderToEndpoint {
                endpoint: Arc::clone(&self.endpoint),
                stream_id: stream_ids.video.expect("video stream id assigned"),
                throwable: self.throwable.clone(),
                is_streaming: self.is_streaming.clone(),
            }));
            v.start()?;
        }

        self.is_streaming.set(true);
        Ok(())
    }

    /// Stops encoders then signals the muxer trailer (spec.md §4.7).
    /// Idempotent, and never throws: failures are aggregated into
    /// `throwable` (spec.md §7).
    pub async fn stop_stream(&self) {
        if !self.is_streaming.get() {
            return;
        }
        if let Some(a) = self.audio.lock().await.as_ref() {
            if let Err(e) = a.stop() {
                self.throwable.set(Some((&e).into()));
            }
        }
        if let Some(v) = self.video.lock().await.as_ref() {
            if let Err(e) = v.stop() {
                self.throwable.set(Some((&e).into()));
            }
        }
        if let Err(e) = self.endpoint.stop_stream().await {
            self.throwable.set(Some((&e).into()));
        }
        self.is_streaming.set(false);
    }

    pub fn push_audio_frame(&self, frame: Frame) {
        if let Ok(guard) = self.audio.try_lock() {
            if let Some(a) = guard.as_ref() {
                a.push_input(frame);
            }
        }
    }

    pub fn push_video_frame(&self, frame: Frame) {
        if let Ok(guard) = self.video.try_lock() {
            if let Some(v) = guard.as_ref() {
                v.push_input(frame);
            }
        }
    }

    pub async fn audio_config(&self) -> Option<AudioCodecConfig> {
        self.audio.lock().await.as_ref().and_then(|a| a.config())
    }

    pub async fn video_config(&self) -> Option<VideoCodecConfig> {
        self.video.lock().await.as_ref().and_then(|v| v.config())
    }

    pub async fn release(&self) -> Result<()> {
        self.stop_stream().await;
        if let Some(a) = self.audio.lock().await.as_ref() {
            a.release()?;
        }
        if let Some(v) = self.video.lock().await.as_ref() {
            v.release()?;
        }
        self.endpoint.release().await
    }
}
