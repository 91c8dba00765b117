//! Source contract (spec.md §4.1): a pull/push raw-frame producer owned by
//! the pipeline. Audio is always a [`FrameSource`]; video may be either a
//! [`FrameSource`] or a [`SurfaceSource`] that renders into a
//! pipeline-supplied compositing target.

use async_trait::async_trait;

use crate::codec_config::SourceConfig;
use crate::error::Result;
use crate::frame::Frame;
use crate::state::{Observable, ThrowableCell};

/// A compositing render target handed to a [`SurfaceSource`] by the
/// pipeline's video compositor (spec.md §4.8). The concrete surface type is
/// a platform/GPU concern outside this crate's scope (spec.md §1); it is
/// represented here only by an opaque identifier so the pipeline can track
/// which source is bound to which compositor input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceTarget(pub u64);

/// Shared lifecycle every source variant implements.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Idempotent; fails with [`crate::error::ErrorKind::InvalidState`] if
    /// called while streaming.
    async fn configure(&self, config: SourceConfig) -> Result<()>;

    async fn start_stream(&self) -> Result<()>;

    async fn stop_stream(&self) -> Result<()>;

    /// Terminal; frees any OS handles. Idempotent.
    async fn release(&self) -> Result<()>;

    fn is_streaming(&self) -> Observable<bool>;

    fn throwable(&self) -> ThrowableCell;
}

/// Produces raw samples into a caller-supplied buffer (spec.md §4.1). Used
/// for audio always, and for video when no compositor surface is available.
#[async_trait]
pub trait FrameSource: Lifecycle {
    /// Blocking; returns a captured sample timestamped from a monotonic
    /// clock. Fails with [`crate::error::ErrorKind::InvalidState`] when not
    /// started.
    fn read_frame(&self) -> Result<Frame>;
}

/// Writes video frames into a caller-supplied compositing target rather than
/// handing back buffers (spec.md §4.1).
#[async_trait]
pub trait SurfaceSource: Lifecycle {
    async fn set_output(&self, target: SurfaceTarget) -> Result<()>;

    async fn reset_output(&self) -> Result<()>;
}

/// Tagged union over the two source variants a pipeline can hold, avoiding a
/// deep inheritance hierarchy per spec.md §9.
pub enum Source {
    Frame(Box<dyn FrameSource>),
    Surface(Box<dyn SurfaceSource>),
}

impl Source {
    pub fn lifecycle(&self) -> &dyn Lifecycle {
        match self {
            Source::Frame(s) => s.as_ref(),
            Source::Surface(s) => s.as_ref(),
        }
    }
}

/// Builds a [`Source`], matching spec.md §4.8's "created via a `Factory`".
/// Two factories are considered to describe the same logical source when
/// [`SourceFactory::identity`] returns equal values; `set_*_source` is then a
/// no-op rather than a hot-swap (spec.md §4.8).
pub trait SourceFactory: Send + Sync {
    /// An opaque identity token (e.g. a camera device id) used to detect
    /// idempotent `set_*_source` calls.
    fn identity(&self) -> String;

    fn create(&self) -> Source;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;
    use bytes::Bytes;

    /// A [`FrameSource`] test double that hands back synthetic frames at a
    /// fixed cadence, driven purely by calls to `read_frame` (no real clock
    /// or thread), so pipeline/output tests are deterministic.
    pub struct FakeFrameSource {
        streaming: Observable<bool>,
        throwable: ThrowableCell,
        next_pts_us: AtomicI64,
        period_us: i64,
        configured: Mutex<Option<SourceConfig>>,
    }

    impl FakeFrameSource {
        pub fn new(period_us: i64) -> Self {
            FakeFrameSource {
                streaming: Observable::new(false),
                throwable: crate::state::new_throwable_cell(),
                next_pts_us: AtomicI64::new(0),
                period_us,
                configured: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Lifecycle for FakeFrameSource {
        async fn configure(&self, config: SourceConfig) -> Result<()> {
            if self.streaming.get() {
                return Err(crate::error::Error::invalid_state("configure while streaming"));
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
                return Err(crate::error::Error::invalid_state("read_frame while not streaming"));
            }
            let pts = self.next_pts_us.fetch_add(self.period_us, Ordering::SeqCst);
            Ok(Frame::new(Bytes::from_static(b"\x00\x01\x02\x03"), pts).with_key_frame(true))
        }
    }

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
}
