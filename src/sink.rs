//! Sink contract (spec.md §4.4): pure I/O, the only place blocking network/
//! file writes happen. A sink is opened against a [`crate::media_descriptor::MediaDescriptor`]
//! and then fed [`Packet`]s by its endpoint; it never interprets container
//! bytes.

use async_trait::async_trait;

use crate::error::Result;
use crate::frame::Packet;
use crate::media_descriptor::MediaDescriptor;
use crate::state::Observable;

/// Shared contract every sink implements. All methods run on the endpoint's
/// I/O executor (spec.md §5): one task per sink, writes serialized in order.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<()>;

    /// Writes one muxed packet. Must preserve call order; a sink that
    /// reorders would violate the "writes serialized per sink" guarantee
    /// (spec.md §5).
    async fn write(&self, packet: Packet) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Terminal; idempotent.
    async fn release(&self) -> Result<()>;

    fn is_open(&self) -> Observable<bool>;
}

/// Writes packets to a local file, truncating on open. Grounded on the
/// "file" case of spec.md §6's media descriptor URI grammar.
pub struct FileSink {
    is_open: Observable<bool>,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl FileSink {
    pub fn new() -> Self {
        FileSink { is_open: Observable::new(false), file: tokio::sync::Mutex::new(None) }
    }
}

impl Default for FileSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<()> {
        let path = descriptor
            .uri
            .to_file_path()
            .map_err(|_| crate::error::Error::invalid_state(format!("not a file uri: {}", descriptor.uri)))?;
        let f = tokio::fs::File::create(&path).await?;
        *self.file.lock().await = Some(f);
        self.is_open.set(true);
        Ok(())
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut guard = self.file.lock().await;
        let f = guard.as_mut().ok_or_else(|| crate::error::Error::closed("file sink not open"))?;
        f.write_all(packet.data()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        if let Some(mut f) = self.file.lock().await.take() {
            f.flush().await?;
        }
        self.is_open.set(false);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.close().await
    }

    fn is_open(&self) -> Observable<bool> {
        self.is_open.clone()
    }
}

/// Writes packets to a platform content-resolver output stream. The actual
/// `content://` stream handle is a platform collaborator outside this
/// crate's scope (spec.md §1); this sink is a thin wrapper around an
/// injected writer so the endpoint plumbing is identical to [`FileSink`].
pub struct ContentSink<W> {
    is_open: Observable<bool>,
    writer: tokio::sync::Mutex<Option<W>>,
    open_writer: Box<dyn Fn(&MediaDescriptor) -> Result<W> + Send + Sync>,
}

impl<W> ContentSink<W> {
    pub fn new(open_writer: impl Fn(&MediaDescriptor) -> Result<W> + Send + Sync + 'static) -> Self {
        ContentSink { is_open: Observable::new(false), writer: tokio::sync::Mutex::new(None), open_writer: Box::new(open_writer) }
    }
}

#[async_trait]
impl<W> Sink for ContentSink<W>
where
    W: tokio::io::AsyncWrite + Unpin + Send + Sync,
{
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<()> {
        let w = (self.open_writer)(descriptor)?;
        *self.writer.lock().await = Some(w);
        self.is_open.set(true);
        Ok(())
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or_else(|| crate::error::Error::closed("content sink not open"))?;
        w.write_all(packet.data()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        if let Some(mut w) = self.writer.lock().await.take() {
            w.flush().await?;
        }
        self.is_open.set(false);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.close().await
    }

    fn is_open(&self) -> Observable<bool> {
        self.is_open.clone()
    }
}

/// A network sink's wire protocol is an external collaborator (spec.md §1:
/// "RTMP/SRT wire protocols (only their sink contract)"); this trait lets a
/// caller plug in a concrete connection while [`crate::endpoint::dynamic::DynamicEndpoint`]
/// only depends on [`Sink`].
#[async_trait]
pub trait NetworkConnector: Send + Sync {
    async fn connect(&self, descriptor: &MediaDescriptor) -> Result<Box<dyn RawConnection>>;
}

#[async_trait]
pub trait RawConnection: Send + Sync {
    async fn send(&mut self, data: &[u8]) -> Result<()>;
    async fn shutdown(&mut self) -> Result<()>;
}

/// A sink backed by an injected [`NetworkConnector`] (RTMP or SRT). Kept
/// generic over the connector so this crate never links an actual RTMP/SRT
/// client (spec.md §1 excludes the wire protocols themselves).
pub struct NetworkSink {
    is_open: Observable<bool>,
    connector: std::sync::Arc<dyn NetworkConnector>,
    conn: tokio::sync::Mutex<Option<Box<dyn RawConnection>>>,
}

impl NetworkSink {
    pub fn new(connector: std::sync::Arc<dyn NetworkConnector>) -> Self {
        NetworkSink { is_open: Observable::new(false), connector, conn: tokio::sync::Mutex::new(None) }
    }
}

#[async_trait]
impl Sink for NetworkSink {
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<()> {
        let conn = self.connector.connect(descriptor).await?;
        *self.conn.lock().await = Some(conn);
        self.is_open.set(true);
        Ok(())
    }

    async fn write(&self, packet: Packet) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| crate::error::Error::closed("network sink not open"))?;
        conn.send(packet.data()).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut conn) = self.conn.lock().await.take() {
            conn.shutdown().await?;
        }
        self.is_open.set(false);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        self.close().await
    }

    fn is_open(&self) -> Observable<bool> {
        self.is_open.clone()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// An in-memory [`Sink`] test double used by endpoint/output/pipeline
    /// tests instead of touching the filesystem.
    pub struct MemorySink {
        is_open: Observable<bool>,
        pub packets: StdMutex<Vec<Packet>>,
        pub opened_with: StdMutex<Option<MediaDescriptor>>,
    }

    impl MemorySink {
        pub fn new() -> Self {
            MemorySink { is_open: Observable::new(false), packets: StdMutex::new(Vec::new()), opened_with: StdMutex::new(None) }
        }
    }

    impl Default for MemorySink {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Sink for MemorySink {
        async fn open(&self, descriptor: &MediaDescriptor) -> Result<()> {
            *self.opened_with.lock().unwrap() = Some(descriptor.clone());
            self.is_open.set(true);
            Ok(())
        }

        async fn write(&self, packet: Packet) -> Result<()> {
            if !self.is_open.get() {
                return Err(crate::error::Error::closed("memory sink not open"));
            }
            self.packets.lock().unwrap().push(packet);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.is_open.set(false);
            Ok(())
        }

        async fn release(&self) -> Result<()> {
            self.close().await
        }

        fn is_open(&self) -> Observable<bool> {
            self.is_open.clone()
        }
    }
}
