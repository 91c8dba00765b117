//! Video fan-out (spec.md §4.8, §5): a single compositor owns the video
//! source's output target and dispatches every frame, downscaled and
//! orientation-corrected, to each registered output's video encoder. Runs on
//! one dedicated thread, mirroring the encoder module's codec-thread
//! pattern (`src/encoder/mod.rs`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec_config::Resolution;
use crate::frame::Frame;
use crate::output::Output;
use crate::source::{FrameSource, SurfaceTarget};

/// Applies downscaling/rotation to a raw frame before it reaches an output's
/// encoder. The actual pixel transform is a GPU surface-composition concern
/// outside this crate's scope (spec.md §1); this trait is the seam a host
/// application's renderer plugs into. The default [`PassthroughTransform`]
/// forwards frames unchanged, which is sufficient for outputs that share the
/// source's native resolution and orientation.
pub trait FrameTransform: Send + Sync {
    fn transform(&self, frame: &Frame, target: Resolution, rotation_degrees: u32) -> Frame;
}

pub struct PassthroughTransform;

impl FrameTransform for PassthroughTransform {
    fn transform(&self, frame: &Frame, _target: Resolution, _rotation_degrees: u32) -> Frame {
        frame.clone()
    }
}

enum CompositorCmd {
    Frame(Frame),
    Register(u64, Arc<Output>, Resolution),
    Unregister(u64),
    SetRotation(u32),
    Stop,
}

struct RegisteredOutput {
    output: Arc<Output>,
    target: Resolution,
}

/// Owns the video source's output target and the registration of every
/// output's encoder (spec.md §4.8: "Each output's video encoder registers
/// its input surface with the compositor").
pub struct Compositor {
    tx: crossbeam_channel::Sender<CompositorCmd>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
    next_surface_id: AtomicU64,
}

impl Compositor {
    pub fn new(transform: Arc<dyn FrameTransform>) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<CompositorCmd>();
        let join = std::thread::Builder::new()
            .name("castpipe-compositor".into())
            .spawn(move || compositor_thread_main(rx, transform))
            .expect("spawn compositor thread");
        Arc::new(Compositor { tx, join: Mutex::new(Some(join)), next_surface_id: AtomicU64::new(1) })
    }

    /// Allocates an opaque input surface for a [`crate::source::SurfaceSource`]
    /// to render into (spec.md §4.1). The actual surface lives on the
    /// platform/GPU side; this crate only needs a stable identifier.
    pub fn create_input_surface(&self) -> SurfaceTarget {
        SurfaceTarget(self.next_surface_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Submits one raw video frame, either pumped from a
    /// [`crate::source::FrameSource`] via [`VideoSourcePump`] or rendered in
    /// by a surface-based source's GPU callback.
    pub fn submit_frame(&self, frame: Frame) {
        let _ = self.tx.send(CompositorCmd::Frame(frame));
    }

    pub fn register_output(&self, output_id: u64, output: Arc<Output>, target: Resolution) {
        let _ = self.tx.send(CompositorCmd::Register(output_id, output, target));
    }

    pub fn unregister_output(&self, output_id: u64) {
        let _ = self.tx.send(CompositorCmd::Unregister(output_id));
    }

    /// Adjusts the compositor's projection for the current display rotation
    /// (spec.md §4.8). Existing registrations keep their target resolution;
    /// only the orientation correction changes.
    pub fn set_rotation(&self, degrees: u32) {
        let _ = self.tx.send(CompositorCmd::SetRotation(degrees));
    }

    pub fn release(&self) {
        let _ = self.tx.send(CompositorCmd::Stop);
        if let Some(j) = self.join.lock().take() {
            let _ = j.join();
        }
    }
}

fn compositor_thread_main(rx: crossbeam_channel::Receiver<CompositorCmd>, transform: Arc<dyn FrameTransform>) {
    let mut outputs: HashMap<u64, RegisteredOutput> = HashMap::new();
    let mut rotation_degrees: u32 = 0;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            CompositorCmd::Stop => break,
            CompositorCmd::SetRotation(d) => rotation_degrees = d,
            CompositorCmd::Register(id, output, target) => {
                outputs.insert(id, RegisteredOutput { output, target });
            }
            CompositorCmd::Unregister(id) => {
                outputs.remove(&id);
            }
            CompositorCmd::Frame(frame) => {
                for reg in outputs.values() {
                    let out_frame = transform.transform(&frame, reg.target, rotation_degrees);
                    reg.output.push_video_frame(out_frame);
                }
            }
        }
    }
}

/// Drives a [`crate::source::FrameSource`]-backed video source into the
/// compositor on its own thread, the same blocking-read-loop shape as
/// [`crate::audio_pump::AudioPump`]. Only needed when the pipeline's video
/// source is the `FrameSource` variant; a `SurfaceSource` renders directly
/// into its assigned [`SurfaceTarget`] instead.
pub struct VideoSourcePump {
    stop: Arc<AtomicBool>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl VideoSourcePump {
    pub fn spawn(source: Arc<dyn FrameSource>, compositor: Arc<Compositor>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name("castpipe-video-pump".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    match source.read_frame() {
                        Ok(frame) => compositor.submit_frame(frame),
                        Err(_) => std::thread::sleep(Duration::from_millis(5)),
                    }
                }
            })
            .expect("spawn video source pump thread");
        VideoSourcePump { stop, join: Mutex::new(Some(join)) }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(j) = self.join.lock().take() {
            let _ = j.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::platform::test_support::FakePlatformMuxer;
    use crate::endpoint::platform::PlatformEndpoint;
    use crate::encoder::test_support::PassthroughBackend;
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    fn output_with_video() -> (Arc<Output>, Arc<FakePlatformMuxer>) {
        let platform = Arc::new(FakePlatformMuxer::new());
        let endpoint = Arc::new(PlatformEndpoint::new(platform.clone()));
        let make: crate::output::BackendFactory<crate::codec_config::VideoCodecConfig> = Arc::new(|_cfg| {
            Ok(Box::new(PassthroughBackend { config_bytes: None, fail_next: Arc::new(StdAtomicBool::new(false)) })
                as Box<dyn crate::encoder::CodecBackend>)
        });
        (Output::new(endpoint, None, Some(make), 0), platform)
    }

    #[tokio::test]
    async fn frames_fan_out_to_every_registered_output() {
        let compositor = Compositor::new(Arc::new(PassthroughTransform));
        let (out_a, platform_a) = output_with_video();
        let (out_b, platform_b) = output_with_video();
        out_a.set_video_codec_config(crate::codec_config::VideoCodecConfig::builder().build()).await.unwrap();
        out_b.set_video_codec_config(crate::codec_config::VideoCodecConfig::builder().build()).await.unwrap();
        let d = crate::media_descriptor::MediaDescriptor::parse("file:///tmp/a.mp4").unwrap();
        out_a.open(&d).await.unwrap();
        out_b.open(&d).await.unwrap();
        out_a.start_stream().await.unwrap();
        out_b.start_stream().await.unwrap();

        compositor.register_output(1, out_a.clone(), Resolution { width: 1280, height: 720 });
        compositor.register_output(2, out_b.clone(), Resolution { width: 640, height: 360 });

        compositor.submit_frame(Frame::new(Bytes::from_static(b"f0"), 0).with_key_frame(true));
        std::thread::sleep(std::time::Duration::from_millis(50));

        compositor.unregister_output(1);
        compositor.submit_frame(Frame::new(Bytes::from_static(b"f1"), 1000).with_key_frame(true));
        std::thread::sleep(std::time::Duration::from_millis(50));

        compositor.release();
        out_a.stop_stream().await;
        out_b.stop_stream().await;

        // out_a saw only the first frame before being unregistered; out_b saw
        // both, each preceded by its codec-config frame.
        assert_eq!(platform_a.writes.lock().unwrap().len(), 2);
        assert_eq!(platform_b.writes.lock().unwrap().len(), 3);
    }
}
