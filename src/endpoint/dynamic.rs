//! DynamicEndpoint (spec.md §4.6): selects a concrete endpoint from a media
//! descriptor's `{sink-kind, container}` pair and exposes it behind one
//! `Endpoint`. The dispatch table is exactly spec.md §4.6's:
//!
//! | sink-kind | container -> endpoint |
//! |---|---|
//! | FILE    | MP4/WebM/3GP/Ogg -> platform; TS -> composite(Ts, File); FLV -> composite(Flv, File) |
//! | CONTENT | analogous with a content sink |
//! | SRT     | composite(Ts, Srt) |
//! | RTMP    | composite(Flv, Rtmp) |

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::endpoint::composite::CompositeEndpoint;
use crate::endpoint::platform::{PlatformEndpoint, PlatformMuxer};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::media_descriptor::{Container, MediaDescriptor, SinkKind};
use crate::muxer::flv::FlvMuxer;
use crate::muxer::ts::{Service, TsMuxer};
use crate::muxer::{StreamConfig, StreamId};
use crate::sink::{NetworkConnector, NetworkSink, Sink};
use crate::state::Observable;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct EndpointKey(SinkKind, Container);

/// Factories a host application supplies so `DynamicEndpoint` never
/// hardcodes a concrete file-system, content-resolver, or network type
/// (spec.md §1 treats all three as external collaborators beyond the sink
/// *contract*).
pub struct DynamicEndpointFactories {
    pub file_sink: Arc<dyn Fn() -> Arc<dyn Sink> + Send + Sync>,
    pub content_sink: Arc<dyn Fn() -> Arc<dyn Sink> + Send + Sync>,
    pub srt_connector: Arc<dyn NetworkConnector>,
    pub rtmp_connector: Arc<dyn NetworkConnector>,
    pub platform_muxer: Arc<dyn Fn(Container) -> Result<Arc<dyn PlatformMuxer>> + Send + Sync>,
}

/// Reads MPEG-TS service identification out of `descriptor.custom_data`
/// (spec.md §4.6: "TS services installed from `descriptor.custom_data` if
/// present"), falling back to [`Service::default`] for any missing field.
fn ts_service_from_descriptor(descriptor: &MediaDescriptor) -> Service {
    let d = Service::default();
    Service {
        transport_stream_id: descriptor.custom_data.get("transport_stream_id").and_then(|v| v.parse().ok()).unwrap_or(d.transport_stream_id),
        original_network_id: descriptor.custom_data.get("original_network_id").and_then(|v| v.parse().ok()).unwrap_or(d.original_network_id),
        service_id: descriptor.custom_data.get("service_id").and_then(|v| v.parse().ok()).unwrap_or(d.service_id),
        service_name: descriptor.custom_data.get("service_name").map(str::to_string).unwrap_or(d.service_name),
        provider_name: descriptor.custom_data.get("provider_name").map(str::to_string).unwrap_or(d.provider_name),
    }
}

fn build_endpoint(key: EndpointKey, factories: &DynamicEndpointFactories) -> Result<Arc<dyn Endpoint>> {
    use Container::*;
    use SinkKind::*;
    let EndpointKey(sink_kind, container) = key;
    match (sink_kind, container) {
        (File, Mp4) | (File, WebM) | (File, ThreeGp) | (File, Ogg) => {
            Ok(Arc::new(PlatformEndpoint::new((factories.platform_muxer)(container)?)))
        }
        (Content, Mp4) | (Content, WebM) | (Content, ThreeGp) | (Content, Ogg) => {
            Ok(Arc::new(PlatformEndpoint::new((factories.platform_muxer)(container)?)))
        }
        (File, Ts) => Ok(Arc::new(
            CompositeEndpoint::new(Arc::new(TsMuxer::new()), dyn_sink((factories.file_sink)()))
                .with_before_open(Arc::new(|m: &TsMuxer, d: &MediaDescriptor| m.set_service(ts_service_from_descriptor(d)))),
        )),
        (File, Flv) => Ok(Arc::new(CompositeEndpoint::new(Arc::new(FlvMuxer::new()), dyn_sink((factories.file_sink)())))),
        (Content, Ts) => Ok(Arc::new(
            CompositeEndpoint::new(Arc::new(TsMuxer::new()), dyn_sink((factories.content_sink)()))
                .with_before_open(Arc::new(|m: &TsMuxer, d: &MediaDescriptor| m.set_service(ts_service_from_descriptor(d)))),
        )),
        (Content, Flv) => Ok(Arc::new(CompositeEndpoint::new(Arc::new(FlvMuxer::new()), dyn_sink((factories.content_sink)())))),
        (Srt, Ts) => Ok(Arc::new(
            CompositeEndpoint::new(Arc::new(TsMuxer::new()), Arc::new(NetworkSink::new(factories.srt_connector.clone())))
                .with_before_open(Arc::new(|m: &TsMuxer, d: &MediaDescriptor| m.set_service(ts_service_from_descriptor(d)))),
        )),
        (Rtmp, Flv) => Ok(Arc::new(CompositeEndpoint::new(Arc::new(FlvMuxer::new()), Arc::new(NetworkSink::new(factories.rtmp_connector.clone()))))),
        _ => Err(Error::unsupported_container(format!("{:?} over {:?}", container, sink_kind))),
    }
}

/// Wraps an `Arc<dyn Sink>` so it can be stored behind `CompositeEndpoint`'s
/// generic `S: Sink` parameter without losing dynamic dispatch.
fn dyn_sink(sink: Arc<dyn Sink>) -> Arc<DynSink> {
    Arc::new(DynSink(sink))
}

struct DynSink(Arc<dyn Sink>);

#[async_trait]
impl Sink for DynSink {
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<()> {
        self.0.open(descriptor).await
    }

    async fn write(&self, packet: crate::frame::Packet) -> Result<()> {
        self.0.write(packet).await
    }

    async fn close(&self) -> Result<()> {
        self.0.close().await
    }

    async fn release(&self) -> Result<()> {
        self.0.release().await
    }

    fn is_open(&self) -> Observable<bool> {
        self.0.is_open()
    }
}

/// Owns a lazily-created set of concrete endpoints keyed by `(sink-kind,
/// container)` (spec.md §4.6). `open` is serialized via a mutex and
/// idempotent while already open on the same descriptor's key.
pub struct DynamicEndpoint {
    factories: DynamicEndpointFactories,
    endpoints: Mutex<HashMap<EndpointKey, Arc<dyn Endpoint>>>,
    current: Mutex<Option<(EndpointKey, Arc<dyn Endpoint>)>>,
}

impl DynamicEndpoint {
    pub fn new(factories: DynamicEndpointFactories) -> Self {
        DynamicEndpoint { factories, endpoints: Mutex::new(HashMap::new()), current: Mutex::new(None) }
    }

    async fn current_endpoint(&self) -> Result<Arc<dyn Endpoint>> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|(_, e)| Arc::clone(e))
            .ok_or_else(|| Error::not_configured("dynamic endpoint not opened"))
    }
}

#[async_trait]
impl Endpoint for DynamicEndpoint {
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<()> {
        let key = EndpointKey(descriptor.sink_kind, descriptor.container);
        let mut current = self.current.lock().await;
        if let Some((open_key, _)) = current.as_ref() {
            if *open_key == key {
                return Ok(()); // idempotent while open on the same kind/container
            }
            return Err(Error::invalid_state("dynamic endpoint already open on a different descriptor"));
        }

        let endpoint = {
            let mut endpoints = self.endpoints.lock().await;
            match endpoints.get(&key) {
                Some(e) => Arc::clone(e),
                None => {
                    let e = build_endpoint(key, &self.factories)?;
                    endpoints.insert(key, Arc::clone(&e));
                    e
                }
            }
        };
        endpoint.open(descriptor).await?;
        *current = Some((key, endpoint));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some((_, endpoint)) = self.current.lock().await.take() {
            endpoint.close().await?;
        }
        Ok(())
    }

    fn add_streams(&self, configs: &[StreamConfig]) -> Result<Vec<StreamId>> {
        let current = self.current.try_lock().map_err(|_| Error::invalid_state("dynamic endpoint busy"))?;
        match current.as_ref() {
            Some((_, e)) => e.add_streams(configs),
            None => Err(Error::not_configured("not opened")),
        }
    }

    fn write(&self, stream_id: StreamId, frame: Frame) -> Result<()> {
        let current = self.current.try_lock().map_err(|_| Error::invalid_state("dynamic endpoint busy"))?;
        match current.as_ref() {
            Some((_, e)) => e.write(stream_id, frame),
            None => Err(Error::not_configured("not opened")),
        }
    }

    async fn start_stream(&self) -> Result<()> {
        self.current_endpoint().await?.start_stream().await
    }

    async fn stop_stream(&self) -> Result<()> {
        self.current_endpoint().await?.stop_stream().await
    }

    async fn release(&self) -> Result<()> {
        self.close().await?;
        let endpoints: Vec<Arc<dyn Endpoint>> = self.endpoints.lock().await.drain().map(|(_, e)| e).collect();
        for e in endpoints {
            e.release().await?;
        }
        Ok(())
    }

    fn is_open(&self) -> Observable<bool> {
        // Best-effort snapshot: `DynamicEndpoint` has no single stable
        // `is_open` cell of its own since the concrete endpoint changes
        // across (sink-kind, container) switches; expose a fresh cell
        // reflecting whatever is open right now.
        let is_open = Observable::new(false);
        if let Ok(current) = self.current.try_lock() {
            if let Some((_, e)) = current.as_ref() {
                is_open.set(e.is_open().get());
            }
        }
        is_open
    }
}
