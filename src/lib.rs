//! Core runtime for a multi-destination live audio/video streaming pipeline:
//! one audio source and one video source fanned out to N independently
//! configured, started, and stopped [`output::Output`]s.
//!
//! The module layout mirrors the data it models:
//!
//! *   [`source`] — the two source contracts (`FrameSource`/`SurfaceSource`)
//!     a capture device implements.
//! *   [`compositor`]/[`audio_pump`] — the dedicated-thread fan-out that
//!     copies each source's frames into every registered output's encoder.
//! *   [`encoder`] — the per-output audio/video encoder state machine.
//! *   [`muxer`] — container packetization (FLV, MPEG-TS) with no I/O of its
//!     own.
//! *   [`sink`] — where a muxer's packets (or a platform muxer's raw bytes)
//!     actually go: a file, an in-process content resolver, or a network
//!     socket.
//! *   [`endpoint`] — wires a muxer to a sink, or wraps a platform muxer,
//!     behind one small trait; [`endpoint::dynamic::DynamicEndpoint`] picks
//!     the concrete shape from a [`media_descriptor::MediaDescriptor`].
//! *   [`output`] — one destination's encoders plus the endpoint they feed.
//! *   [`pipeline`] — the top-level coordinator.

pub mod audio_pump;
pub mod codec_config;
pub mod compositor;
pub mod encoder;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod media_descriptor;
pub mod muxer;
pub mod output;
pub mod pipeline;
pub mod rotation;
pub mod sink;
pub mod source;
pub mod state;

pub use error::{Error, ErrorKind, Result};
pub use media_descriptor::MediaDescriptor;
pub use output::Output;
pub use pipeline::{Pipeline, PipelineConfig};
