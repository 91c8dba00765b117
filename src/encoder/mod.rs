//! Encoder contract and state machine (spec.md §4.2).
//!
//! `Idle → Configured → (PendingStart → Started ⇄ Paused) → PendingStop →
//! Stopped → PendingRelease → Released`, plus a terminal `Error` reachable
//! from any running state. The actual raw→compressed transform is a
//! caller-supplied [`CodecBackend`] (concrete hardware encoders are an
//! external collaborator per spec.md §1); this module owns the state
//! machine, the codec-config-frame-once-per-session rule, and the
//! dual-executor dispatch described in spec.md §5.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, ErrorKind, Result};
use crate::frame::Frame;
use crate::state::{new_throwable_cell, Observable, ThrowableCell};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncoderState {
    Idle,
    Configured,
    PendingStart,
    Started,
    Paused,
    PendingStop,
    Stopped,
    PendingRelease,
    Released,
    Error,
}

/// The caller-supplied compression backend. Concrete hardware/software
/// codecs are out of this crate's scope (spec.md §1); this trait is the
/// contract an encoder built elsewhere must satisfy.
pub trait CodecBackend: Send + 'static {
    /// Returns the codec-specific out-of-band data (e.g. an
    /// AVCDecoderConfigurationRecord or AudioSpecificConfig) once per
    /// session, before the first compressed sample.
    fn codec_config(&mut self) -> Option<bytes::Bytes>;

    /// Compresses one raw input frame, returning zero or more compressed
    /// frames (codecs may buffer ahead a few frames before emitting).
    fn push_input(&mut self, raw: Frame) -> Result<Vec<Frame>>;

    /// Hints that the next push should produce a key frame. Audio backends
    /// may ignore this.
    fn request_key_frame(&mut self) {}

    /// Applies a live bitrate change. Only called on video encoders (audio
    /// bitrate is immutable per spec.md §4.2).
    fn set_bitrate(&mut self, _bps: u32) {}

    /// Flushes any buffered frames at `stop_stream`.
    fn flush(&mut self) -> Vec<Frame> {
        Vec::new()
    }
}

/// Receives frames and errors from an encoder, dispatched on a dedicated
/// listener executor distinct from the codec thread (spec.md §4.2, §5).
pub trait EncoderListener: Send + Sync + 'static {
    fn on_frame(&self, frame: Frame);
    fn on_error(&self, err: &Error);
}

enum CodecCmd {
    Push(Frame),
    RequestKeyFrame,
    SetBitrate(u32),
    Stop,
}

struct Threads {
    cmd_tx: crossbeam_channel::Sender<CodecCmd>,
    codec_join: std::thread::JoinHandle<()>,
    listener_join: std::thread::JoinHandle<()>,
}

/// Shared machinery behind [`AudioEncoder`] and [`VideoEncoder`]. Generic
/// over the immutable codec config type so both share one state machine and
/// threading implementation rather than duplicating it (spec.md §9: prefer
/// small shared traits/structs over parallel inheritance trees).
pub struct EncoderCore<C: Clone + Send + Sync + 'static> {
    state: Observable<EncoderState>,
    throwable: ThrowableCell,
    config: Mutex<Option<C>>,
    listener: Mutex<Option<Arc<dyn EncoderListener>>>,
    threads: Mutex<Option<Threads>>,
    make_backend: Box<dyn Fn(&C) -> Result<Box<dyn CodecBackend>> + Send + Sync>,
}

impl<C: Clone + Send + Sync + 'static> EncoderCore<C> {
    pub fn new(make_backend: impl Fn(&C) -> Result<Box<dyn CodecBackend>> + Send + Sync + 'static) -> Self {
        EncoderCore {
            state: Observable::new(EncoderState::Idle),
            throwable: new_throwable_cell(),
            config: Mutex::new(None),
            listener: Mutex::new(None),
            threads: Mutex::new(None),
            make_backend: Box::new(make_backend),
        }
    }

    pub fn state(&self) -> Observable<EncoderState> {
        self.state.clone()
    }

    pub fn throwable(&self) -> ThrowableCell {
        self.throwable.clone()
    }

    pub fn set_listener(&self, listener: Arc<dyn EncoderListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub fn config(&self) -> Option<C> {
        self.config.lock().clone()
    }

    /// Binds the codec config and allocates resources. Idempotent while not
    /// streaming; fails with [`ErrorKind::InvalidState`] if streaming.
    pub fn configure(&self, cfg: C) -> Result<()> {
        let state = self.state.get();
        if matches!(state, EncoderState::PendingStart | EncoderState::Started | EncoderState::Paused | EncoderState::PendingStop) {
            return Err(Error::invalid_state("configure called while streaming"));
        }
        *self.config.lock() = Some(cfg);
        self.state.set(EncoderState::Configured);
        Ok(())
    }

    /// Starts the codec thread and listener thread. Requires `Configured` or
    /// `Stopped` (restart of a previously-stopped session). If the backend
    /// fails to allocate, this is an error detected while still
    /// `Configured`: per spec.md §4.2 the encoder self-resets back to
    /// `Configured` rather than landing in `Stopped`.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let state = self.state.get();
        if !matches!(state, EncoderState::Configured | EncoderState::Stopped) {
            return Err(Error::invalid_state(format!("start_stream called in state {:?}", state)));
        }
        let cfg = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| Error::not_configured("start_stream before configure"))?;
        self.state.set(EncoderState::PendingStart);

        let backend = match (self.make_backend)(&cfg) {
            Ok(b) => b,
            Err(e) => {
                let reported = Error::new(e.kind(), e.to_string());
                self.handle_failure(EncoderState::Configured, reported);
                return Err(e);
            }
        };

        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<CodecCmd>();
        let (frame_tx, frame_rx) = crossbeam_channel::unbounded::<FrameOrError>();

        let codec_join = std::thread::Builder::new()
            .name("castpipe-encoder-codec".into())
            .spawn(move || codec_thread_main(backend, cmd_rx, frame_tx))
            .expect("spawn encoder codec thread");

        let this_for_listener = Arc::clone(self);
        let listener_join = std::thread::Builder::new()
            .name("castpipe-encoder-listener".into())
            .spawn(move || listener_thread_main(this_for_listener, frame_rx))
            .expect("spawn encoder listener thread");

        *self.threads.lock() = Some(Threads { cmd_tx, codec_join, listener_join });
        self.state.set(EncoderState::Started);
        Ok(())
    }

    /// Shared error path for both configure-time allocation failures and
    /// mid-stream codec failures reported by the listener thread (spec.md
    /// §4.2: "attempts a self-reset if the error occurred in `Configured`;
    /// otherwise stops the stream before notifying").
    fn handle_failure(&self, prior_state: EncoderState, err: Error) {
        self.throwable.set(Some((&err).into()));
        self.state.set(EncoderState::Error);
        if prior_state == EncoderState::Configured {
            if let Some(l) = self.listener.lock().clone() {
                l.on_error(&err);
            }
            self.reset_to_configured();
            log::warn!("encoder self-reset after error in Configured state: {}", err);
        } else {
            self.state.set(EncoderState::Stopped);
            if let Some(l) = self.listener.lock().clone() {
                l.on_error(&err);
            }
            log::error!("encoder stream stopped after error: {}", err);
        }
    }

    pub fn pause(&self) -> Result<()> {
        if self.state.get() != EncoderState::Started {
            return Err(Error::invalid_state("pause called while not started"));
        }
        self.state.set(EncoderState::Paused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        if self.state.get() != EncoderState::Paused {
            return Err(Error::invalid_state("resume called while not paused"));
        }
        self.state.set(EncoderState::Started);
        Ok(())
    }

    /// Pushes one raw input frame to the codec thread. Silently dropped (per
    /// spec.md §5 back-pressure policy) if not currently accepting input.
    pub fn push_input(&self, frame: Frame) {
        if !matches!(self.state.get(), EncoderState::Started) {
            return;
        }
        if let Some(t) = self.threads.lock().as_ref() {
            let _ = t.cmd_tx.send(CodecCmd::Push(frame));
        }
    }

    pub fn request_key_frame(&self) {
        if let Some(t) = self.threads.lock().as_ref() {
            let _ = t.cmd_tx.send(CodecCmd::RequestKeyFrame);
        }
    }

    pub fn set_bitrate(&self, bps: u32) {
        if let Some(t) = self.threads.lock().as_ref() {
            let _ = t.cmd_tx.send(CodecCmd::SetBitrate(bps));
        }
    }

    /// Stops the codec thread (flushing buffered frames) and joins both
    /// threads. Valid from `Started`, `Paused`, or `Error`.
    pub fn stop(&self) -> Result<()> {
        let state = self.state.get();
        if !matches!(state, EncoderState::Started | EncoderState::Paused | EncoderState::Error) {
            return Err(Error::invalid_state(format!("stop_stream called in state {:?}", state)));
        }
        self.stop_inner();
        Ok(())
    }

    fn stop_inner(&self) {
        self.state.set(EncoderState::PendingStop);
        if let Some(t) = self.threads.lock().take() {
            let _ = t.cmd_tx.send(CodecCmd::Stop);
            let _ = t.codec_join.join();
            let _ = t.listener_join.join();
        }
        self.state.set(EncoderState::Stopped);
    }

    /// Terminal; releases resources. Idempotent.
    pub fn release(&self) -> Result<()> {
        if self.state.get() == EncoderState::Released {
            return Ok(());
        }
        if matches!(self.state.get(), EncoderState::Started | EncoderState::Paused) {
            self.stop_inner();
        }
        self.state.set(EncoderState::PendingRelease);
        self.state.set(EncoderState::Released);
        Ok(())
    }

    /// Moves back to `Configured`, preserving the bound config.
    pub fn reset(&self) -> Result<()> {
        if matches!(self.state.get(), EncoderState::Started | EncoderState::Paused) {
            self.stop_inner();
        }
        self.reset_to_configured();
        Ok(())
    }

    fn reset_to_configured(&self) {
        if self.config.lock().is_some() {
            self.state.set(EncoderState::Configured);
        } else {
            self.state.set(EncoderState::Idle);
        }
    }
}

enum FrameOrError {
    Frame(Frame),
    Error(Error),
}

fn codec_thread_main(
    mut backend: Box<dyn CodecBackend>,
    cmd_rx: crossbeam_channel::Receiver<CodecCmd>,
    frame_tx: crossbeam_channel::Sender<FrameOrError>,
) {
    let mut codec_config_sent = false;
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            CodecCmd::Stop => {
                for f in backend.flush() {
                    let _ = frame_tx.send(FrameOrError::Frame(f));
                }
                break;
            }
            CodecCmd::RequestKeyFrame => backend.request_key_frame(),
            CodecCmd::SetBitrate(bps) => backend.set_bitrate(bps),
            CodecCmd::Push(raw) => {
                if !codec_config_sent {
                    if let Some(cfg_bytes) = backend.codec_config() {
                        let cfg_frame = Frame::new(cfg_bytes, raw.pts_us()).with_codec_config(true);
                        let _ = frame_tx.send(FrameOrError::Frame(cfg_frame));
                    }
                    codec_config_sent = true;
                }
                match backend.push_input(raw) {
                    Ok(frames) => {
                        for f in frames {
                            let _ = frame_tx.send(FrameOrError::Frame(f));
                        }
                    }
                    Err(e) => {
                        // The listener thread owns the Error state transition
                        // and the Configured-vs-running self-reset decision;
                        // this thread just reports the failure and exits.
                        let _ = frame_tx.send(FrameOrError::Error(e));
                        break;
                    }
                }
            }
        }
    }
}

fn listener_thread_main<C: Clone + Send + Sync + 'static>(
    core: Arc<EncoderCore<C>>,
    frame_rx: crossbeam_channel::Receiver<FrameOrError>,
) {
    while let Ok(item) = frame_rx.recv() {
        match item {
            FrameOrError::Frame(f) => {
                if let Some(l) = core.listener.lock().clone() {
                    l.on_frame(f);
                }
            }
            FrameOrError::Error(e) => {
                let prior_state = core.state.get();
                core.handle_failure(prior_state, e);
            }
        }
    }
}

/// An output's audio encoder.
pub struct AudioEncoder {
    core: Arc<EncoderCore<crate::codec_config::AudioCodecConfig>>,
}

impl AudioEncoder {
    pub fn new(make_backend: impl Fn(&crate::codec_config::AudioCodecConfig) -> Result<Box<dyn CodecBackend>> + Send + Sync + 'static) -> Self {
        AudioEncoder { core: Arc::new(EncoderCore::new(make_backend)) }
    }

    pub fn state(&self) -> Observable<EncoderState> {
        self.core.state()
    }

    pub fn throwable(&self) -> ThrowableCell {
        self.core.throwable()
    }

    pub fn set_listener(&self, listener: Arc<dyn EncoderListener>) {
        self.core.set_listener(listener)
    }

    pub fn config(&self) -> Option<crate::codec_config::AudioCodecConfig> {
        self.core.config()
    }

    pub fn configure(&self, cfg: crate::codec_config::AudioCodecConfig) -> Result<()> {
        self.core.configure(cfg)
    }

    pub fn start(&self) -> Result<()> {
        self.core.start()
    }

    pub fn push_input(&self, frame: Frame) {
        self.core.push_input(frame)
    }

    pub fn stop(&self) -> Result<()> {
        self.core.stop()
    }

    pub fn release(&self) -> Result<()> {
        self.core.release()
    }

    pub fn reset(&self) -> Result<()> {
        self.core.reset()
    }
}

/// An output's video encoder.
pub struct VideoEncoder {
    core: Arc<EncoderCore<crate::codec_config::VideoCodecConfig>>,
}

impl VideoEncoder {
    pub fn new(make_backend: impl Fn(&crate::codec_config::VideoCodecConfig) -> Result<Box<dyn CodecBackend>> + Send + Sync + 'static) -> Self {
        VideoEncoder { core: Arc::new(EncoderCore::new(make_backend)) }
    }

    pub fn state(&self) -> Observable<EncoderState> {
        self.core.state()
    }

    pub fn throwable(&self) -> ThrowableCell {
        self.core.throwable()
    }

    pub fn set_listener(&self, listener: Arc<dyn EncoderListener>) {
        self.core.set_listener(listener)
    }

    pub fn config(&self) -> Option<crate::codec_config::VideoCodecConfig> {
        self.core.config()
    }

    /// Rotates the declared resolution to the natural sensor orientation at
    /// configure time (spec.md §4.2) — a workaround for devices that reject
    /// portrait dimensions at codec selection. `rotation_degrees` is one of
    /// 0/90/180/270; 90 and 270 swap width/height.
    pub fn configure(&self, mut cfg: crate::codec_config::VideoCodecConfig, rotation_degrees: u32) -> Result<()> {
        if rotation_degrees % 180 == 90 {
            let crate::codec_config::Resolution { width, height } = cfg.resolution;
            cfg.resolution = crate::codec_config::Resolution { width: height, height: width };
        }
        self.core.configure(cfg)
    }

    pub fn start(&self) -> Result<()> {
        self.core.start()
    }

    pub fn push_input(&self, frame: Frame) {
        self.core.push_input(frame)
    }

    pub fn request_key_frame(&self) {
        self.core.request_key_frame()
    }

    /// Live bitrate update, applied via a parameter update to the backend
    /// (spec.md §4.2: "video only"; there is no audio equivalent).
    pub fn set_bitrate(&self, bps: u32) {
        self.core.set_bitrate(bps)
    }

    pub fn stop(&self) -> Result<()> {
        self.core.stop()
    }

    pub fn release(&self) -> Result<()> {
        self.core.release()
    }

    pub fn reset(&self) -> Result<()> {
        self.core.reset()
    }
}

/// Returns [`ErrorKind::UnsupportedCodec`] for a mime this crate's built-in
/// muxers cannot carry; used by `Output::set_*_codec_config` validation.
pub fn unsupported_codec(mime: impl std::fmt::Debug) -> Error {
    Error::unsupported_codec(format!("{:?}", mime))
}
