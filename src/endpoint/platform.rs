//! Platform-muxer pass-through endpoint (spec.md §1 Non-goals: "a thin
//! pass-through to a platform muxer for MP4/WebM/3GP/Ogg"). This crate does
//! not reimplement box-level MP4/WebM muxing; [`PlatformMuxer`] is the seam
//! a host application plugs its own (e.g. OS-provided) muxer into.

use std::sync::Arc;

use async_trait::async_trait;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::frame::Frame;
use crate::media_descriptor::MediaDescriptor;
use crate::muxer::{StreamConfig, StreamId};
use crate::state::Observable;

/// The contract a host-supplied platform muxer satisfies. Unlike
/// [`crate::muxer::Muxer`], a platform muxer owns its own output (it opens
/// and writes to the descriptor directly) since this crate treats it as an
/// opaque box-muxing collaborator, not something whose bytes this crate
/// composes with a separate [`crate::sink::Sink`].
#[async_trait]
pub trait PlatformMuxer: Send + Sync {
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn add_streams(&self, configs: &[StreamConfig]) -> Result<Vec<StreamId>>;

    fn write(&self, stream_id: StreamId, frame: Frame) -> Result<()>;

    async fn start_stream(&self) -> Result<()>;

    async fn stop_stream(&self) -> Result<()>;

    async fn release(&self) -> Result<()>;

    fn is_open(&self) -> Observable<bool>;
}

/// Adapts a [`PlatformMuxer`] to the [`Endpoint`] contract so
/// [`crate::output::Output`] and [`crate::endpoint::dynamic::DynamicEndpoint`]
/// never need to special-case it.
pub struct PlatformEndpoint<P> {
    inner: Arc<P>,
}

impl<P: PlatformMuxer> PlatformEndpoint<P> {
    pub fn new(inner: Arc<P>) -> Self {
        PlatformEndpoint { inner }
    }
}

#[async_trait]
impl<P: PlatformMuxer + 'static> Endpoint for PlatformEndpoint<P> {
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<()> {
        self.inner.open(descriptor).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn add_streams(&self, configs: &[StreamConfig]) -> Result<Vec<StreamId>> {
        self.inner.add_streams(configs)
    }

    fn write(&self, stream_id: StreamId, frame: Frame) -> Result<()> {
        self.inner.write(stream_id, frame)
    }

    async fn start_stream(&self) -> Result<()> {
        self.inner.start_stream().await
    }

    async fn stop_stream(&self) -> Result<()> {
        self.inner.stop_stream().await
    }

    async fn release(&self) -> Result<()> {
        self.inner.release().await
    }

    fn is_open(&self) -> Observable<bool> {
        self.inner.is_open()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// A [`PlatformMuxer`] test double standing in for an OS-provided
    /// MP4/WebM/3GP/Ogg muxer (spec.md §1 excludes implementing one here).
    pub struct FakePlatformMuxer {
        is_open: Observable<bool>,
        pub writes: StdMutex<Vec<(StreamId, Frame)>>,
        next_id: std::sync::atomic::AtomicU32,
    }

    impl FakePlatformMuxer {
        pub fn new() -> Self {
            FakePlatformMuxer { is_open: Observable::new(false), writes: StdMutex::new(Vec::new()), next_id: std::sync::atomic::AtomicU32::new(0) }
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
            Ok(configs
                .iter()
                .map(|_| StreamId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst)))
                .collect())
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
}
