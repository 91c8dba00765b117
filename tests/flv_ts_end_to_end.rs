//! S1/S2 (spec.md §8): a full `Output` wired to a real `FlvMuxer`/`TsMuxer`
//! over a `FileSink` produces a well-formed container on disk, exercising
//! the encoder → endpoint → muxer → sink path this crate owns end to end
//! (the codec itself is the test double from `tests/common`).

mod common;

use std::sync::Arc;

use castpipe::codec_config::{AudioCodecConfig, AudioMime, ChannelLayout, VideoCodecConfig, VideoMime};
use castpipe::endpoint::composite::CompositeEndpoint;
use castpipe::media_descriptor::MediaDescriptor;
use castpipe::muxer::flv::FlvMuxer;
use castpipe::muxer::ts::TsMuxer;
use castpipe::output::Output;
use castpipe::sink::FileSink;

use common::passthrough_backend;

fn descriptor_for(path: &std::path::Path) -> MediaDescriptor {
    let uri = format!("file://{}", path.display());
    MediaDescriptor::parse(&uri).unwrap()
}

#[tokio::test]
async fn flv_output_writes_a_well_formed_header_and_metadata_tag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.flv");

    let endpoint = Arc::new(CompositeEndpoint::new(Arc::new(FlvMuxer::new()), Arc::new(FileSink::new())));
    let output = Output::new(endpoint, Some(passthrough_backend()), Some(passthrough_backend()), 0);

    output
        .set_audio_codec_config(AudioCodecConfig::builder().mime(AudioMime::Aac).sample_rate_hz(44_100).channel_layout(ChannelLayout::STEREO).build())
        .await
        .unwrap();
    output.set_video_codec_config(VideoCodecConfig::builder().mime(VideoMime::Avc).resolution(1280, 720).fps(30).build()).await.unwrap();

    output.open(&descriptor_for(&path)).await.unwrap();
    output.start_stream().await.unwrap();

    output.push_video_frame(castpipe::frame::Frame::new(bytes::Bytes::from_static(b"keyframe"), 0).with_key_frame(true));
    output.push_audio_frame(castpipe::frame::Frame::new(bytes::Bytes::from_static(b"sample"), 0));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    output.stop_stream().await;
    output.close().await.unwrap();

    let bytes = tokio::fs::read(&path).await.unwrap();
    assert!(bytes.len() > 13, "expected at least a file header to have been written");
    assert_eq!(&bytes[0..3], b"FLV");
    assert_eq!(bytes[3], 1, "FLV version");
    assert_eq!(bytes[4] & 0b0000_0101, 0b0000_0101, "audio and video flags both set");
    assert_eq!(&bytes[5..9], &[0, 0, 0, 9], "header size");
    assert_eq!(&bytes[9..13], &[0, 0, 0, 0], "PreviousTagSize0 is always zero");

    // The first tag after the 13-byte header is the onMetaData script tag.
    assert_eq!(bytes[13], 18, "script data tag type");
}

#[tokio::test]
async fn ts_output_writes_188_byte_packets_starting_with_pat() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.ts");

    let endpoint = Arc::new(CompositeEndpoint::new(Arc::new(TsMuxer::new()), Arc::new(FileSink::new())));
    let output = Output::new(endpoint, None, Some(passthrough_backend()), 0);

    output.set_video_codec_config(VideoCodecConfig::builder().mime(VideoMime::Avc).resolution(1920, 1080).fps(30).build()).await.unwrap();
    output.open(&descriptor_for(&path)).await.unwrap();
    output.start_stream().await.unwrap();

    for i in 0..5i64 {
        output.push_video_frame(castpipe::frame::Frame::new(bytes::Bytes::from_static(b"0123456789abcdef"), i * 33_333).with_key_frame(true));
    }
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    output.stop_stream().await;
    output.close().await.unwrap();

    let bytes = tokio::fs::read(&path).await.unwrap();
    assert!(!bytes.is_empty());
    assert_eq!(bytes.len() % 188, 0, "a well-formed TS file is a whole number of 188-byte packets");
    for chunk in bytes.chunks(188) {
        assert_eq!(chunk[0], 0x47, "every TS packet starts with the sync byte");
    }
    // PAT (PID 0) must be the very first packet written.
    assert_eq!(bytes[1] & 0x1F, 0);
    assert_eq!(bytes[2], 0);
}
