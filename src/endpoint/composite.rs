//! CompositeEndpoint (spec.md §4.5): binds a [`Muxer`] to a [`Sink`],
//! wiring the muxer's packet emission to the sink's I/O executor so encoder
//! listener threads never await a blocking write directly.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::frame::{Frame, Packet};
use crate::media_descriptor::MediaDescriptor;
use crate::muxer::{Muxer, PacketListener, StreamConfig, StreamId};
use crate::sink::Sink;
use crate::state::Observable;

/// Bridges a muxer's synchronous [`PacketListener::on_packet`] (called from
/// an encoder's listener thread) to the sink's async `write` (run on a
/// dedicated per-sink `tokio::task`, spec.md §5). `blocking_send` applies
/// the spec's back-pressure policy directly: if the sink's task can't keep
/// up, this call blocks the caller rather than buffering unboundedly.
struct SinkForwarder {
    tx: tokio::sync::mpsc::Sender<Packet>,
}

impl PacketListener for SinkForwarder {
    fn on_packet(&self, packet: Packet) {
        if self.tx.blocking_send(packet).is_err() {
            log::warn!("composite endpoint: packet dropped, sink i/o task is gone");
        }
    }
}

struct IoTask {
    tx: tokio::sync::mpsc::Sender<Packet>,
    join: tokio::task::JoinHandle<()>,
}

/// Bounded to apply back-pressure promptly; sized generously enough that a
/// brief scheduling hiccup doesn't immediately stall the codec thread.
const CHANNEL_CAPACITY: usize = 64;

pub struct CompositeEndpoint<M, S> {
    muxer: Arc<M>,
    sink: Arc<S>,
    is_open: Observable<bool>,
    io: Mutex<Option<IoTask>>,
    /// Invoked with the muxer and the open descriptor just before the sink
    /// is opened, e.g. to seed an MPEG-TS service from
    /// `descriptor.custom_data` (spec.md §4.6).
    before_open: Option<Arc<dyn Fn(&M, &MediaDescriptor) + Send + Sync>>,
}

impl<M, S> CompositeEndpoint<M, S>
where
    M: Muxer + 'static,
    S: Sink + 'static,
{
    pub fn new(muxer: Arc<M>, sink: Arc<S>) -> Self {
        CompositeEndpoint { muxer, sink, is_open: Observable::new(false), io: Mutex::new(None), before_open: None }
    }

    pub fn with_before_open(mut self, hook: Arc<dyn Fn(&M, &MediaDescriptor) + Send + Sync>) -> Self {
        self.before_open = Some(hook);
        self
    }

    pub fn muxer(&self) -> &Arc<M> {
        &self.muxer
    }
}

#[async_trait]
impl<M, S> Endpoint for CompositeEndpoint<M, S>
where
    M: Muxer + 'static,
    S: Sink + 'static,
{
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<()> {
        if let Some(hook) = &self.before_open {
            hook(&self.muxer, descriptor);
        }
        // Sink first for open (spec.md §4.5).
        self.sink.open(descriptor).await?;

        let (tx, mut rx) = tokio::sync::mpsc::channel::<Packet>(CHANNEL_CAPACITY);
        self.muxer.set_listener(Arc::new(SinkForwarder { tx: tx.clone() }));

        let sink = Arc::clone(&self.sink);
        let join = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if let Err(e) = sink.write(packet).await {
                    log::error!("composite endpoint: sink write failed: {}", e);
                    break;
                }
            }
        });

        *self.io.lock().await = Some(IoTask { tx, join });
        self.is_open.set(true);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.io.lock().await.take() {
            drop(task.tx);
            let _ = task.join.await;
        }
        self.sink.close().await?;
        self.is_open.set(false);
        Ok(())
    }

    fn add_streams(&self, configs: &[StreamConfig]) -> Result<Vec<StreamId>> {
        if !self.is_open.get() {
            return Err(Error::not_configured("endpoint not opened"));
        }
        self.muxer.add_streams(configs)
    }

    fn write(&self, stream_id: StreamId, frame: Frame) -> Result<()> {
        if !self.is_open.get() {
            return Err(Error::not_configured("endpoint not opened"));
        }
        self.muxer.write(stream_id, frame)
    }

    async fn start_stream(&self) -> Result<()> {
        // Muxer first for start (spec.md §4.5); the sink contract (spec.md
        // §4.4) has no separate start hook of its own.
        self.muxer.start_stream()
    }

    async fn stop_stream(&self) -> Result<()> {
        self.muxer.stop_stream()
    }

    async fn release(&self) -> Result<()> {
        self.close().await?;
        self.muxer.release()?;
        self.sink.release().await
    }

    fn is_open(&self) -> Observable<bool> {
        self.is_open.clone()
    }
}
