//! Bit-exact FLV muxer (spec.md §4.3.1).
//!
//! Tag framing follows the Adobe FLV spec directly: `TagType(1) |
//! DataSize(u24) | Timestamp(u24) | TimestampExtended(1) | StreamID(u24=0) |
//! TagData | PreviousTagSize(u32)`. Byte-level construction style (manual
//! `BytesMut`/`BufMut` pushes) follows `rtsp::client::video::h264::Parameters`
//! in the teacher pack, which builds an AVCDecoderConfigurationRecord the
//! same way.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::codec_config::{AudioCodecConfig, AudioMime, VideoCodecConfig, VideoMime};
use crate::error::{Error, Result};
use crate::frame::{Frame, Packet};
use crate::muxer::amf::{encode_on_metadata, AmfValue};
use crate::muxer::{Muxer, PacketListener, StartupClock, StreamConfig, StreamId};

const TAG_AUDIO: u8 = 8;
const TAG_VIDEO: u8 = 9;
const TAG_SCRIPT: u8 = 18;

struct Streams {
    audio: Option<(StreamId, AudioCodecConfig)>,
    video: Option<(StreamId, VideoCodecConfig)>,
}

/// Emits a bit-exact FLV stream: file header, `onMetaData` script tag, then
/// per-frame audio/video tags (spec.md §4.3.1).
pub struct FlvMuxer {
    listener: Mutex<Option<Arc<dyn PacketListener>>>,
    streams: Mutex<Streams>,
    clock: StartupClock,
    /// Gate satisfied once a video key frame has been forwarded, or
    /// trivially true when there's no video stream (audio-only session).
    video_started: AtomicBool,
    next_id: AtomicU32,
}

impl FlvMuxer {
    pub fn new() -> Self {
        FlvMuxer {
            listener: Mutex::new(None),
            streams: Mutex::new(Streams { audio: None, video: None }),
            clock: StartupClock::new(),
            video_started: AtomicBool::new(true),
            next_id: AtomicU32::new(0),
        }
    }

    fn emit(&self, packet: Bytes, timestamp_us: i64) {
        if let Some(l) = self.listener.lock().clone() {
            l.on_packet(Packet::new(packet, timestamp_us));
        }
    }

    fn audio_cfg(&self, id: StreamId) -> Option<AudioCodecConfig> {
        let s = self.streams.lock();
        s.audio.as_ref().filter(|(sid, _)| *sid == id).map(|(_, c)| c.clone())
    }

    fn video_cfg(&self, id: StreamId) -> Option<VideoCodecConfig> {
        let s = self.streams.lock();
        s.video.as_ref().filter(|(sid, _)| *sid == id).map(|(_, c)| c.clone())
    }
}

impl Default for FlvMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Muxer for FlvMuxer {
    fn add_streams(&self, configs: &[StreamConfig]) -> Result<Vec<StreamId>> {
        let mut streams = self.streams.lock();
        let mut ids = Vec::with_capacity(configs.len());
        for cfg in configs {
            match cfg {
                StreamConfig::Audio(a) => {
                    if streams.audio.is_some() {
                        return Err(Error::invalid_state("FLV muxer already has an audio stream"));
                    }
                    if a.mime != AudioMime::Aac {
                        return Err(Error::unsupported_codec(format!("{:?} in FLV", a.mime)));
                    }
                    let id = StreamId(self.next_id.fetch_add(1, Ordering::SeqCst));
                    streams.audio = Some((id, a.clone()));
                    ids.push(id);
                }
                StreamConfig::Video(v) => {
                    if streams.video.is_some() {
                        return Err(Error::invalid_state("FLV muxer already has a video stream"));
                    }
                    if !matches!(v.mime, VideoMime::Avc | VideoMime::Hevc) {
                        return Err(Error::unsupported_codec(format!("{:?} in FLV", v.mime)));
                    }
                    let id = StreamId(self.next_id.fetch_add(1, Ordering::SeqCst));
                    streams.video = Some((id, v.clone()));
                    ids.push(id);
                }
            }
        }
        self.video_started.store(streams.video.is_none(), Ordering::SeqCst);
        Ok(ids)
    }

    fn start_stream(&self) -> Result<()> {
        self.clock.reset();
        let streams = self.streams.lock();
        self.video_started.store(streams.video.is_none(), Ordering::SeqCst);

        let has_audio = streams.audio.is_some();
        let has_video = streams.video.is_some();
        let mut flags = 0u8;
        if has_audio {
            flags |= 0b0000_0100;
        }
        if has_video {
            flags |= 0b0000_0001;
        }

        let mut header = BytesMut::with_capacity(13);
        header.put_slice(b"FLV");
        header.put_u8(1);
        header.put_u8(flags);
        header.put_u32(9);
        header.put_u32(0); // PreviousTagSize0
        self.emit(header.freeze(), 0);

        let entries = build_metadata_entries(streams.audio.as_ref().map(|(_, c)| c), streams.video.as_ref().map(|(_, c)| c));
        drop(streams);
        let data = encode_on_metadata(&entries);
        self.emit(build_tag(TAG_SCRIPT, 0, &data), 0);
        Ok(())
    }

    fn write(&self, stream_id: StreamId, frame: Frame) -> Result<()> {
        if let Some(audio) = self.audio_cfg(stream_id) {
            return self.write_audio(&audio, frame);
        }
        if let Some(video) = self.video_cfg(stream_id) {
            return self.write_video(&video, frame);
        }
        Err(Error::invalid_state("write to unknown FLV stream id"))
    }

    fn stop_stream(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) -> Result<()> {
        *self.listener.lock() = None;
        Ok(())
    }

    fn set_listener(&self, listener: Arc<dyn PacketListener>) {
        *self.listener.lock() = Some(listener);
    }
}

impl FlvMuxer {
    fn write_audio(&self, cfg: &AudioCodecConfig, frame: Frame) -> Result<()> {
        if frame.is_codec_config() {
            let data = audio_tag_data(cfg, true, frame.payload())?;
            self.emit(build_tag(TAG_AUDIO, 0, &data), 0);
            return Ok(());
        }
        if self.streams.lock().video.is_some() && !self.video_started.load(Ordering::SeqCst) {
            return Ok(()); // dropped: waiting for the first video key frame
        }
        let rebased = match self.clock.accept(&frame) {
            Some(f) => f,
            None => return Ok(()), // dropped: pts before startup_time
        };
        let data = audio_tag_data(cfg, false, rebased.payload())?;
        self.emit(build_tag(TAG_AUDIO, rebased.pts_us(), &data), rebased.pts_us());
        Ok(())
    }

    fn write_video(&self, cfg: &VideoCodecConfig, frame: Frame) -> Result<()> {
        if frame.is_codec_config() {
            let data = video_tag_data(cfg, true, true, 0, frame.payload())?;
            self.emit(build_tag(TAG_VIDEO, 0, &data), 0);
            return Ok(());
        }
        if !self.video_started.load(Ordering::SeqCst) {
            if !frame.is_key_frame() {
                return Ok(()); // dropped: not yet past the first key frame
            }
            self.video_started.store(true, Ordering::SeqCst);
        }
        let rebased = match self.clock.accept(&frame) {
            Some(f) => f,
            None => return Ok(()),
        };
        let cts_us = rebased.pts_us() - rebased.dts_us();
        let data = video_tag_data(cfg, false, rebased.is_key_frame(), cts_us, rebased.payload())?;
        self.emit(build_tag(TAG_VIDEO, rebased.dts_us(), &data), rebased.dts_us());
        Ok(())
    }
}

fn build_metadata_entries<'a>(audio: Option<&'a AudioCodecConfig>, video: Option<&'a VideoCodecConfig>) -> Vec<(&'static str, AmfValue)> {
    let mut entries = vec![("duration", AmfValue::Number(0.0))];
    if let Some(a) = audio {
        let codec_id = match a.mime {
            AudioMime::Aac => 10.0,
            AudioMime::Opus => 0.0,
        };
        entries.push(("audiocodecid", AmfValue::Number(codec_id)));
        entries.push(("audiodatarate", AmfValue::Number(f64::from(a.start_bitrate_bps) / 1000.0)));
        entries.push(("audiosamplerate", AmfValue::Number(f64::from(a.sample_rate_hz))));
        entries.push(("audiosamplesize", AmfValue::Number(16.0)));
        entries.push(("stereo", AmfValue::Boolean(a.channel_layout.is_stereo())));
    }
    if let Some(v) = video {
        let codec_id = match v.mime {
            VideoMime::Avc => 7.0,
            VideoMime::Hevc => 12.0, // non-standard; enhanced-RTMP FourCC metadata isn't implemented
            VideoMime::Vp9 | VideoMime::Av1 => 0.0,
        };
        entries.push(("videocodecid", AmfValue::Number(codec_id)));
        entries.push(("videodatarate", AmfValue::Number(f64::from(v.start_bitrate_bps) / 1000.0)));
        entries.push(("width", AmfValue::Number(f64::from(v.resolution.width))));
        entries.push(("height", AmfValue::Number(f64::from(v.resolution.height))));
        entries.push(("framerate", AmfValue::Number(f64::from(v.fps))));
    }
    entries
}

fn audio_tag_data(cfg: &AudioCodecConfig, is_config: bool, payload: &Bytes) -> Result<Bytes> {
    let sound_format = match cfg.mime {
        AudioMime::Aac => 10u8,
        AudioMime::Opus => return Err(Error::unsupported_codec("Opus in FLV")),
    };
    let sound_rate = 3u8; // AAC's sample rate is carried in AudioSpecificConfig; this flag is fixed at 44 kHz per convention
    let sound_size = 1u8; // 16-bit
    let sound_type = if cfg.channel_layout.is_stereo() { 1u8 } else { 0u8 };
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u8((sound_format << 4) | (sound_rate << 2) | (sound_size << 1) | sound_type);
    buf.put_u8(if is_config { 0 } else { 1 }); // AACPacketType
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn video_tag_data(cfg: &VideoCodecConfig, is_config: bool, is_key_frame: bool, cts_us: i64, payload: &Bytes) -> Result<Bytes> {
    match cfg.mime {
        VideoMime::Avc => Ok(avc_tag_data(is_config, is_key_frame, cts_us, payload)),
        VideoMime::Hevc => Ok(hevc_tag_data(is_config, is_key_frame, payload)),
        other => Err(Error::unsupported_codec(format!("{:?} in FLV", other))),
    }
}

fn avc_tag_data(is_config: bool, is_key_frame: bool, cts_us: i64, payload: &Bytes) -> Bytes {
    let frame_type = if is_key_frame { 1u8 } else { 2u8 };
    let codec_id = 7u8;
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8((frame_type << 4) | codec_id);
    buf.put_u8(if is_config { 0 } else { 1 }); // AVCPacketType
    let cts_ms: i32 = if is_config { 0 } else { (cts_us / 1000) as i32 };
    buf.put_uint((cts_ms as u32 as u64) & 0x00FF_FFFF, 3);
    buf.put_slice(payload);
    buf.freeze()
}

/// Enhanced-RTMP extended video tag for HEVC: `IsExHeader(1) | FrameType(3) |
/// PacketType(4)` then a 4-byte FourCC, no composition-time offset
/// (`CodedFramesX`).
fn hevc_tag_data(is_config: bool, is_key_frame: bool, payload: &Bytes) -> Bytes {
    let frame_type = if is_key_frame { 1u8 } else { 2u8 };
    let packet_type = if is_config { 0u8 } else { 3u8 };
    let mut buf = BytesMut::with_capacity(9 + payload.len());
    buf.put_u8(0x80 | (frame_type << 4) | packet_type);
    buf.put_slice(b"hvc1");
    buf.put_slice(payload);
    buf.freeze()
}

fn build_tag(tag_type: u8, timestamp_us: i64, data: &[u8]) -> Bytes {
    let ts_ms = (timestamp_us.max(0) / 1000) as u32;
    let mut tag = BytesMut::with_capacity(11 + data.len() + 4);
    tag.put_u8(tag_type);
    tag.put_uint(data.len() as u64, 3);
    tag.put_uint(u64::from(ts_ms & 0x00FF_FFFF), 3);
    tag.put_u8((ts_ms >> 24) as u8);
    tag.put_uint(0, 3); // StreamID, always 0
    tag.put_slice(data);
    let tag_len = tag.len() as u32;
    tag.put_u32(tag_len);
    tag.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec_config::ChannelLayout;
    use std::sync::Mutex as StdMutex;

    struct CollectingListener {
        packets: StdMutex<Vec<Packet>>,
    }

    impl PacketListener for CollectingListener {
        fn on_packet(&self, packet: Packet) {
            self.packets.lock().unwrap().push(packet);
        }
    }

    fn audio_cfg() -> AudioCodecConfig {
        AudioCodecConfig::builder().mime(AudioMime::Aac).sample_rate_hz(44_100).channel_layout(ChannelLayout::STEREO).build()
    }

    fn video_cfg() -> VideoCodecConfig {
        VideoCodecConfig::builder().mime(VideoMime::Avc).resolution(1280, 720).fps(30).build()
    }

    #[test]
    fn file_header_matches_scenario_bytes() {
        let muxer = FlvMuxer::new();
        let listener = Arc::new(CollectingListener { packets: StdMutex::new(Vec::new()) });
        muxer.set_listener(listener.clone());
        let ids = muxer.add_streams(&[StreamConfig::Audio(audio_cfg()), StreamConfig::Video(video_cfg())]).unwrap();
        muxer.start_stream().unwrap();

        let packets = listener.packets.lock().unwrap();
        let header = packets[0].data();
        assert_eq!(&header[..13], &[0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00]);
        drop(packets);
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn on_metadata_precedes_first_media_tag() {
        let muxer = FlvMuxer::new();
        let listener = Arc::new(CollectingListener { packets: StdMutex::new(Vec::new()) });
        muxer.set_listener(listener.clone());
        let ids = muxer.add_streams(&[StreamConfig::Video(video_cfg())]).unwrap();
        muxer.start_stream().unwrap();
        muxer
            .write(ids[0], Frame::new(Bytes::from_static(b"keyframe"), 0).with_key_frame(true))
            .unwrap();

        let packets = listener.packets.lock().unwrap();
        assert_eq!(packets.len(), 3); // header, onMetaData, first video tag
        assert_eq!(packets[1].data()[0], TAG_SCRIPT);
        assert_eq!(packets[2].data()[0], TAG_VIDEO);
    }

    #[test]
    fn video_keyframe_wait_drops_audio_and_non_key_video() {
        let muxer = FlvMuxer::new();
        let listener = Arc::new(CollectingListener { packets: StdMutex::new(Vec::new()) });
        muxer.set_listener(listener.clone());
        let ids = muxer.add_streams(&[StreamConfig::Audio(audio_cfg()), StreamConfig::Video(video_cfg())]).unwrap();
        let (audio_id, video_id) = (ids[0], ids[1]);
        muxer.start_stream().unwrap();

        muxer.write(audio_id, Frame::new(Bytes::from_static(b"a0"), 0)).unwrap();
        muxer.write(video_id, Frame::new(Bytes::from_static(b"p0"), 10_000).with_key_frame(false)).unwrap();
        let pre_key_count = listener.packets.lock().unwrap().len();
        assert_eq!(pre_key_count, 2); // header + onMetaData only

        muxer.write(video_id, Frame::new(Bytes::from_static(b"k0"), 20_000).with_key_frame(true)).unwrap();
        muxer.write(audio_id, Frame::new(Bytes::from_static(b"a1"), 25_000)).unwrap();

        let packets = listener.packets.lock().unwrap();
        assert_eq!(packets.len(), 4); // + keyframe tag + post-keyframe audio tag
    }

    #[test]
    fn audio_only_session_has_no_keyframe_wait() {
        let muxer = FlvMuxer::new();
        let listener = Arc::new(CollectingListener { packets: StdMutex::new(Vec::new()) });
        muxer.set_listener(listener.clone());
        let ids = muxer.add_streams(&[StreamConfig::Audio(audio_cfg())]).unwrap();
        muxer.start_stream().unwrap();
        muxer.write(ids[0], Frame::new(Bytes::from_static(b"a0"), 1_000)).unwrap();

        let packets = listener.packets.lock().unwrap();
        assert_eq!(packets.len(), 3); // header + onMetaData + first audio tag
        assert_eq!(packets[2].data()[0], TAG_AUDIO);
    }

    #[test]
    fn timestamps_are_rebased_and_monotonic() {
        let muxer = FlvMuxer::new();
        let listener = Arc::new(CollectingListener { packets: StdMutex::new(Vec::new()) });
        muxer.set_listener(listener.clone());
        let ids = muxer.add_streams(&[StreamConfig::Video(video_cfg())]).unwrap();
        muxer.start_stream().unwrap();
        muxer.write(ids[0], Frame::new(Bytes::from_static(b"k0"), 5_000).with_key_frame(true)).unwrap();
        muxer.write(ids[0], Frame::new(Bytes::from_static(b"p0"), 38_333).with_key_frame(false)).unwrap();

        let packets = listener.packets.lock().unwrap();
        let ts = |p: &Packet| -> u32 {
            let d = p.data();
            (u32::from(d[4]) << 16) | (u32::from(d[5]) << 8) | u32::from(d[6]) | (u32::from(d[7]) << 24)
        };
        assert_eq!(ts(&packets[2]), 0);
        assert_eq!(ts(&packets[3]), 33);
    }
}
