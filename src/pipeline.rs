//! Pipeline core (spec.md §4.8): the top-level coordinator owning one
//! optional audio source, one optional video source, and the ordered list
//! of outputs they fan out to. Mirrors the rest of this crate's pattern of
//! one fair control-plane mutex per component (spec.md §5) plus dedicated
//! threads (compositor, audio pump) for the data plane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::audio_pump::{AudioOutputMode, AudioPump, IdentityEffectsChain};
use crate::codec_config::{AudioCodecConfig, SourceConfig, VideoCodecConfig};
use crate::compositor::{Compositor, PassthroughTransform, VideoSourcePump};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::output::{BackendFactory, Output};
use crate::rotation::RotationProvider;
use crate::source::{FrameSource, Lifecycle, Source, SourceFactory, SurfaceSource};
use crate::state::{new_throwable_cell, Observable, ThrowableCell};

/// `{with_audio, with_video, audio_output_mode}` (spec.md §4.8).
#[derive(Clone)]
pub struct PipelineConfig {
    pub with_audio: bool,
    pub with_video: bool,
    pub audio_output_mode: AudioOutputMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig { with_audio: true, with_video: true, audio_output_mode: AudioOutputMode::Push }
    }
}

struct AudioSourceSlot {
    identity: String,
    source: Arc<dyn FrameSource>,
}

/// A bound video source. The `Frame` variant holds a shareable handle so a
/// [`VideoSourcePump`] can read from it on its own thread while the pipeline
/// still calls `Lifecycle` methods through the same handle.
enum VideoSourceHandle {
    Frame(Arc<dyn FrameSource>),
    Surface(Box<dyn SurfaceSource>),
}

impl VideoSourceHandle {
    fn lifecycle(&self) -> &dyn Lifecycle {
        match self {
            VideoSourceHandle::Frame(s) => s.as_ref(),
            VideoSourceHandle::Surface(s) => s.as_ref(),
        }
    }
}

struct VideoSourceSlot {
    identity: String,
    handle: VideoSourceHandle,
    /// Present only for the `Frame` variant; drives frames into the
    /// compositor on its own thread (spec.md §4.8).
    pump: Option<VideoSourcePump>,
}

struct OutputEntry {
    output: Arc<Output>,
    watcher: tokio::task::JoinHandle<()>,
    has_video: bool,
}

/// The top-level coordinator (spec.md §4.8, glossary "Pipeline").
pub struct Pipeline {
    config: PipelineConfig,
    /// Serializes every public control-plane call, per spec.md §5's "single
    /// fair mutex" rule.
    control: Mutex<()>,
    audio_source: Mutex<Option<AudioSourceSlot>>,
    video_source: Mutex<Option<VideoSourceSlot>>,
    audio_source_config: Mutex<Option<SourceConfig>>,
    video_source_config: Mutex<Option<SourceConfig>>,
    outputs: Mutex<HashMap<u64, OutputEntry>>,
    next_output_id: AtomicU64,
    streaming_outputs: AtomicUsize,
    compositor: Arc<Compositor>,
    audio_pump: Arc<AudioPump>,
    rotation: Arc<RotationProvider>,
    is_streaming: Observable<bool>,
    throwable: ThrowableCell,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Arc<Self> {
        let audio_pump = AudioPump::new(config.audio_output_mode, Arc::new(IdentityEffectsChain));
        let compositor = Compositor::new(Arc::new(PassthroughTransform));
        Arc::new(Pipeline {
            config,
            control: Mutex::new(()),
            audio_source: Mutex::new(None),
            video_source: Mutex::new(None),
            audio_source_config: Mutex::new(None),
            video_source_config: Mutex::new(None),
            outputs: Mutex::new(HashMap::new()),
            next_output_id: AtomicU64::new(0),
            streaming_outputs: AtomicUsize::new(0),
            compositor,
            audio_pump,
            rotation: Arc::new(RotationProvider::default()),
            is_streaming: Observable::new(false),
            throwable: new_throwable_cell(),
        })
    }

    pub fn is_streaming(&self) -> Observable<bool> {
        self.is_streaming.clone()
    }

    pub fn throwable(&self) -> ThrowableCell {
        self.throwable.clone()
    }

    pub fn rotation_degrees(&self) -> Observable<u32> {
        self.rotation.degrees()
    }

    /// Propagates a display-rotation change to the compositor's projection
    /// and to every registered output's next encoder `configure` call
    /// (spec.md §4.8, §9).
    pub async fn notify_rotation(&self, degrees: u32) {
        self.rotation.notify(degrees);
        self.compositor.set_rotation(degrees);
        for entry in self.outputs.lock().await.values() {
            entry.output.set_rotation_degrees(degrees);
        }
    }

    /// Idempotent if `factory` describes the same logical source already
    /// bound; otherwise hot-swaps (spec.md §4.8): the new source is created,
    /// configured with the current union source config, and — if the
    /// pipeline is streaming — started before the old one is stopped and
    /// released.
    pub async fn set_audio_source(self: &Arc<Self>, factory: Arc<dyn SourceFactory>) -> Result<()> {
        if !self.config.with_audio {
            return Err(Error::unsupported_codec("pipeline configured without audio"));
        }
        let _guard = self.control.lock().await;
        let mut slot = self.audio_source.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.identity == factory.identity() {
                return Ok(());
            }
        }

        let new_source = match factory.create() {
            Source::Frame(f) => Arc::<dyn FrameSource>::from(f),
            Source::Surface(_) => return Err(Error::invalid_state("audio source must be a FrameSource")),
        };

        if let Some(cfg) = *self.audio_source_config.lock().await {
            new_source.configure(cfg).await?;
        }

        let was_streaming = self.is_streaming.get();
        if was_streaming {
            new_source.start_stream().await?;
        }
        self.audio_pump.set_source(Some(Arc::clone(&new_source)));

        if let Some(old) = slot.take() {
            if was_streaming {
                old.source.stop_stream().await?;
            }
            old.source.release().await?;
        }
        *slot = Some(AudioSourceSlot { identity: factory.identity(), source: new_source });
        Ok(())
    }

    /// As [`Pipeline::set_audio_source`], except for the camera-specific
    /// constraint noted in spec.md §4.8: the previous video source is
    /// released before the new one is created, since this crate cannot tell
    /// whether a given factory is camera-backed and only one camera session
    /// may exist at a time.
    pub async fn set_video_source(self: &Arc<Self>, factory: Arc<dyn SourceFactory>) -> Result<()> {
        if !self.config.with_video {
            return Err(Error::unsupported_codec("pipeline configured without video"));
        }
        let _guard = self.control.lock().await;
        let mut slot = self.video_source.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.identity == factory.identity() {
                return Ok(());
            }
        }

        let was_streaming = self.is_streaming.get();
        if let Some(old) = slot.take() {
            if let Some(pump) = old.pump {
                pump.stop();
            }
            if was_streaming {
                old.handle.lifecycle().stop_stream().await?;
            }
            old.handle.lifecycle().release().await?;
        }

        let handle = match factory.create() {
            Source::Frame(f) => VideoSourceHandle::Frame(Arc::<dyn FrameSource>::from(f)),
            Source::Surface(s) => VideoSourceHandle::Surface(s),
        };
        if let Some(cfg) = *self.video_source_config.lock().await {
            handle.lifecycle().configure(cfg).await?;
        }
        if was_streaming {
            handle.lifecycle().start_stream().await?;
        }

        let pump = match &handle {
            VideoSourceHandle::Frame(src) => Some(VideoSourcePump::spawn(Arc::clone(src), Arc::clone(&self.compositor))),
            VideoSourceHandle::Surface(s) => {
                let target = self.compositor.create_input_surface();
                s.set_output(target).await?;
                None
            }
        };

        *slot = Some(VideoSourceSlot { identity: factory.identity(), handle, pump });
        Ok(())
    }

    /// Builds an output around a caller-assembled endpoint (e.g. one
    /// returned by [`crate::endpoint::dynamic::DynamicEndpoint`]) and
    /// subscribes to its `is_streaming` so pipeline sources are started when
    /// the first output begins streaming and stopped when the last stops
    /// (spec.md §4.8).
    pub async fn add_output(
        self: &Arc<Self>,
        endpoint: Arc<dyn Endpoint>,
        audio_backend: Option<BackendFactory<AudioCodecConfig>>,
        video_backend: Option<BackendFactory<VideoCodecConfig>>,
        default_rotation_degrees: u32,
    ) -> Arc<Output> {
        let has_video = video_backend.is_some();
        let output = Output::new(endpoint, audio_backend, video_backend, default_rotation_degrees);
        let id = self.next_output_id.fetch_add(1, Ordering::SeqCst);

        self.audio_pump.register_output(id, Arc::clone(&output));
        if has_video {
            let default_resolution = crate::codec_config::Resolution {
                width: crate::codec_config::DEFAULT_VIDEO_WIDTH,
                height: crate::codec_config::DEFAULT_VIDEO_HEIGHT,
            };
            self.compositor.register_output(id, Arc::clone(&output), default_resolution);
        }

        let pipeline = Arc::clone(self);
        let output_for_watch = Arc::clone(&output);
        let mut rx = output.is_streaming().subscribe();
        let watcher = tokio::spawn(async move {
            loop {
                let streaming = *rx.borrow();
                pipeline.on_output_streaming_changed(id, &output_for_watch, streaming).await;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });

        self.outputs.lock().await.insert(id, OutputEntry { output: Arc::clone(&output), watcher, has_video });
        output
    }

    async fn find_output_id(&self, output: &Arc<Output>) -> Option<u64> {
        self.outputs.lock().await.iter().find(|(_, e)| Arc::ptr_eq(&e.output, output)).map(|(id, _)| *id)
    }

    async fn on_output_streaming_changed(&self, _id: u64, _output: &Arc<Output>, streaming: bool) {
        let prev = self.streaming_outputs.load(Ordering::SeqCst);
        let next = if streaming {
            self.streaming_outputs.fetch_add(1, Ordering::SeqCst) + 1
        } else if prev > 0 {
            self.streaming_outputs.fetch_sub(1, Ordering::SeqCst) - 1
        } else {
            0
        };
        self.is_streaming.set(next > 0);

        if prev == 0 && next > 0 {
            let _ = self.start_sources().await;
        } else if prev > 0 && next == 0 {
            self.stop_sources().await;
        }
    }

    /// Stops the output and, if it was the pipeline's only streaming
    /// output, stops the sources (spec.md §4.8).
    pub async fn remove_output(&self, output: &Arc<Output>) -> Result<()> {
        let _guard = self.control.lock().await;
        let mut outputs = self.outputs.lock().await;
        let id = outputs
            .iter()
            .find(|(_, e)| Arc::ptr_eq(&e.output, output))
            .map(|(id, _)| *id);
        if let Some(id) = id {
            if let Some(entry) = outputs.remove(&id) {
                entry.watcher.abort();
                self.audio_pump.unregister_output(id);
                if entry.has_video {
                    self.compositor.unregister_output(id);
                }
            }
        }
        drop(outputs);
        output.stop_stream().await;
        Ok(())
    }

    async fn start_sources(&self) -> Result<()> {
        if let Some(slot) = self.audio_source.lock().await.as_ref() {
            slot.source.start_stream().await?;
        }
        if let Some(slot) = self.video_source.lock().await.as_ref() {
            slot.handle.lifecycle().start_stream().await?;
        }
        Ok(())
    }

    async fn stop_sources(&self) {
        if let Some(slot) = self.audio_source.lock().await.as_ref() {
            let _ = slot.source.stop_stream().await;
        }
        if let Some(slot) = self.video_source.lock().await.as_ref() {
            let _ = slot.handle.lifecycle().stop_stream().await;
        }
    }

    /// Starts every registered output (spec.md §4.8). Fails with
    /// [`crate::error::ErrorKind::NoOutput`] if none are registered (S5).
    pub async fn start_stream(self: &Arc<Self>) -> Result<()> {
        let _guard = self.control.lock().await;
        let outputs: Vec<Arc<Output>> = self.outputs.lock().await.values().map(|e| Arc::clone(&e.output)).collect();
        if outputs.is_empty() {
            return Err(Error::no_output("start_stream with no registered outputs"));
        }
        for output in &outputs {
            output.start_stream().await?;
        }
        Ok(())
    }

    pub async fn stop_stream(&self) {
        let _guard = self.control.lock().await;
        let outputs: Vec<Arc<Output>> = self.outputs.lock().await.values().map(|e| Arc::clone(&e.output)).collect();
        for output in &outputs {
            output.stop_stream().await;
        }
    }

    /// Validates a prospective audio codec config against every other
    /// output's already-pinned audio config (spec.md §4.8, §8 invariant 8),
    /// reconfigures the shared source to the resulting union, and only then
    /// applies it to `output`.
    pub async fn set_output_audio_codec_config(&self, output: &Arc<Output>, cfg: AudioCodecConfig) -> Result<()> {
        let _guard = self.control.lock().await;
        let outputs = self.outputs.lock().await;
        for entry in outputs.values() {
            if Arc::ptr_eq(&entry.output, output) {
                continue;
            }
            if let Some(existing) = entry.output.audio_config().await {
                if !existing.compatible_for_sharing(&cfg) {
                    return Err(Error::incompatible_config("audio codec config conflicts with another output's pinned config"));
                }
            }
        }
        drop(outputs);

        let union_config = cfg.source_config();
        let mut current = self.audio_source_config.lock().await;
        if let Some(existing) = *current {
            if existing != union_config {
                if let Some(slot) = self.audio_source.lock().await.as_ref() {
                    if slot.source.is_streaming().get() {
                        return Err(Error::incompatible_config("audio source is streaming at a different config"));
                    }
                }
            }
        }
        if let Some(slot) = self.audio_source.lock().await.as_ref() {
            slot.source.configure(union_config).await?;
        }
        *current = Some(union_config);
        drop(current);

        output.set_audio_codec_config(cfg).await
    }

    /// As [`Pipeline::set_output_audio_codec_config`], but video
    /// compatibility ignores resolution (it is taken as the max across
    /// outputs, spec.md §4.8) and only fps/dynamic-range must match.
    pub async fn set_output_video_codec_config(&self, output: &Arc<Output>, cfg: VideoCodecConfig) -> Result<()> {
        let _guard = self.control.lock().await;
        let outputs = self.outputs.lock().await;
        let mut max_width = cfg.resolution.width;
        let mut max_height = cfg.resolution.height;
        for entry in outputs.values() {
            if Arc::ptr_eq(&entry.output, output) {
                continue;
            }
            if let Some(existing) = entry.output.video_config().await {
                if !existing.compatible_for_sharing(&cfg) {
                    return Err(Error::incompatible_config("video codec config conflicts with another output's pinned config"));
                }
                max_width = max_width.max(existing.resolution.width);
                max_height = max_height.max(existing.resolution.height);
            }
        }
        drop(outputs);

        let union_config = SourceConfig::Video {
            resolution: crate::codec_config::Resolution { width: max_width, height: max_height },
            fps: cfg.fps,
            dynamic_range: cfg.dynamic_range,
        };
        let mut current = self.video_source_config.lock().await;
        if let Some(existing) = *current {
            if existing != union_config {
                if let Some(slot) = self.video_source.lock().await.as_ref() {
                    if slot.handle.lifecycle().is_streaming().get() {
                        return Err(Error::incompatible_config("video source is streaming at a different config"));
                    }
                }
            }
        }
        if let Some(slot) = self.video_source.lock().await.as_ref() {
            slot.handle.lifecycle().configure(union_config).await?;
        }
        *current = Some(union_config);
        drop(current);

        let resolution = cfg.resolution;
        output.set_video_codec_config(cfg).await?;
        if let Some(id) = self.find_output_id(output).await {
            self.compositor.register_output(id, Arc::clone(output), resolution);
        }
        Ok(())
    }

    pub async fn release(self: &Arc<Self>) -> Result<()> {
        let _guard = self.control.lock().await;
        let outputs: Vec<OutputEntry> = self.outputs.lock().await.drain().map(|(_, e)| e).collect();
        for entry in outputs {
            entry.watcher.abort();
            entry.output.release().await?;
        }
        if let Some(slot) = self.audio_source.lock().await.take() {
            slot.source.release().await?;
        }
        if let Some(slot) = self.video_source.lock().await.take() {
            if let Some(pump) = slot.pump {
                pump.stop();
            }
            slot.handle.lifecycle().release().await?;
        }
        self.audio_pump.release();
        self.compositor.release();
        Ok(())
    }
}
