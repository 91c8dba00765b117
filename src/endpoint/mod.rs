//! Endpoint contracts (spec.md §4.5, §4.6): a muxer+sink pair, or a
//! pass-through to a platform muxer, exposed behind one small trait so
//! [`crate::output::Output`] never needs to know which concrete shape it
//! holds.

pub mod composite;
pub mod dynamic;
pub mod platform;

use async_trait::async_trait;

use crate::error::Result;
use crate::frame::Frame;
use crate::media_descriptor::MediaDescriptor;
use crate::muxer::{StreamConfig, StreamId};
use crate::state::Observable;

/// Shared contract for anything an [`crate::output::Output`] can push encoded
/// frames through. `add_streams`/`write` are synchronous because they are
/// called directly from an encoder's listener thread (spec.md §5); `open`,
/// `close`, `start_stream`, `stop_stream`, and `release` are control-plane
/// suspension points (spec.md §5) and may await I/O.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn add_streams(&self, configs: &[StreamConfig]) -> Result<Vec<StreamId>>;

    fn write(&self, stream_id: StreamId, frame: Frame) -> Result<()>;

    async fn start_stream(&self) -> Result<()>;

    async fn stop_stream(&self) -> Result<()>;

    /// Terminal; idempotent.
    async fn release(&self) -> Result<()>;

    fn is_open(&self) -> Observable<bool>;
}
