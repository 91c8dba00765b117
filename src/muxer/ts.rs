//! Bit-exact MPEG-TS muxer (spec.md §4.3.2): 188-byte packets carrying a
//! PAT (PID 0), one PMT, an SDT (PID 0x0011), and PES-wrapped elementary
//! streams. Single-service only — the dynamic endpoint only ever seeds one
//! service per session (spec.md §4.5, §4.6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::codec_config::{AudioMime, VideoMime};
use crate::error::{Error, Result};
use crate::frame::{Frame, Packet};
use crate::muxer::{Muxer, PacketListener, StartupClock, StreamConfig, StreamId};

const PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const SDT_PID: u16 = 0x0011;
const ES_PID_START: u16 = 0x0100;
const DEFAULT_PMT_PID: u16 = 0x1000;

/// Re-emission cadence for PAT/PMT/SDT, per spec.md §9 Open Question 1.
const PSI_REPEAT_INTERVAL_US: i64 = 100_000;
/// PCR is carried at most this often, per spec.md §4.3.2.
const PCR_MIN_INTERVAL_US: i64 = 40_000;

#[derive(Clone, Debug, PartialEq)]
pub struct Service {
    pub transport_stream_id: u16,
    pub original_network_id: u16,
    pub service_id: u16,
    pub service_name: String,
    pub provider_name: String,
}

impl Default for Service {
    fn default() -> Self {
        Service {
            transport_stream_id: 1,
            original_network_id: 1,
            service_id: 1,
            service_name: "castpipe".to_string(),
            provider_name: "castpipe".to_string(),
        }
    }
}

struct EsStream {
    stream_id: StreamId,
    pid: u16,
    stream_type: u8,
    is_video: bool,
    is_opus: bool,
}

struct State {
    service: Service,
    pmt_pid: u16,
    streams: Vec<EsStream>,
    stream_ids: HashMap<StreamId, usize>,
    pending_config: HashMap<usize, Bytes>,
    continuity: HashMap<u16, u8>,
    next_pid: u16,
    last_psi_emit_us: Option<i64>,
    last_pcr_emit_us: Option<i64>,
    version: u8,
}

impl State {
    fn pcr_pid(&self) -> Option<u16> {
        self.streams.iter().find(|s| s.is_video).or_else(|| self.streams.first()).map(|s| s.pid)
    }
}

/// Emits a bit-exact MPEG-TS stream (spec.md §4.3.2).
pub struct TsMuxer {
    listener: Mutex<Option<Arc<dyn PacketListener>>>,
    state: Mutex<State>,
    clock: StartupClock,
    next_stream_id: AtomicU32,
}

impl TsMuxer {
    pub fn new() -> Self {
        Self::with_service(Service::default())
    }

    pub fn with_service(service: Service) -> Self {
        TsMuxer {
            listener: Mutex::new(None),
            state: Mutex::new(State {
                service,
                pmt_pid: DEFAULT_PMT_PID,
                streams: Vec::new(),
                stream_ids: HashMap::new(),
                pending_config: HashMap::new(),
                continuity: HashMap::new(),
                next_pid: ES_PID_START,
                last_psi_emit_us: None,
                last_pcr_emit_us: None,
                version: 0,
            }),
            clock: StartupClock::new(),
            next_stream_id: AtomicU32::new(0),
        }
    }

    /// Installs the service descriptor used for the PAT program entry and
    /// the SDT; only effective before `start_stream` (spec.md §4.6: "TS
    /// services installed from `descriptor.custom_data` if present").
    pub fn set_service(&self, service: Service) {
        self.state.lock().service = service;
    }

    fn emit(&self, packet: Bytes, timestamp_us: i64) {
        if let Some(l) = self.listener.lock().clone() {
            l.on_packet(Packet::new(packet, timestamp_us));
        }
    }

    fn emit_psi(&self, state: &mut State, now_us: i64) {
        let program_number = state.service.service_id;
        let pat = build_pat(state.service.transport_stream_id, program_number, state.pmt_pid, state.version);
        let pcr_pid = state.pcr_pid().unwrap_or(ES_PID_START);
        let pmt = build_pmt(program_number, pcr_pid, &state.streams, state.version);
        let sdt = build_sdt(&state.service, state.version);

        let pmt_pid = state.pmt_pid;
        for (pid, section) in [(PAT_PID, pat), (pmt_pid, pmt), (SDT_PID, sdt)] {
            for pkt in packetize_section(pid, &section, &mut state.continuity) {
                self.emit(pkt, now_us);
            }
        }
    }

    fn maybe_emit_psi(&self, state: &mut State, now_us: i64) {
        let due = match state.last_psi_emit_us {
            None => true,
            Some(last) => now_us - last >= PSI_REPEAT_INTERVAL_US,
        };
        if due {
            self.emit_psi(state, now_us);
            state.last_psi_emit_us = Some(now_us);
        }
    }
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Muxer for TsMuxer {
    fn add_streams(&self, configs: &[StreamConfig]) -> Result<Vec<StreamId>> {
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(configs.len());
        for cfg in configs {
            let (stream_type, is_video, is_opus) = match cfg {
                StreamConfig::Video(v) => match v.mime {
                    VideoMime::Avc => (0x1Bu8, true, false),
                    VideoMime::Hevc => (0x24u8, true, false),
                    other => return Err(Error::unsupported_codec(format!("{:?} in MPEG-TS", other))),
                },
                StreamConfig::Audio(a) => match a.mime {
                    AudioMime::Aac => (0x0Fu8, false, false),
                    AudioMime::Opus => (0x06u8, false, true),
                },
            };
            let id = StreamId(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
            let pid = state.next_pid;
            state.next_pid += 1;
            let idx = state.streams.len();
            state.streams.push(EsStream { stream_id: id, pid, stream_type, is_video, is_opus });
            state.stream_ids.insert(id, idx);
            ids.push(id);
        }
        Ok(ids)
    }

    fn start_stream(&self) -> Result<()> {
        self.clock.reset();
        let mut state = self.state.lock();
        state.continuity.clear();
        state.last_psi_emit_us = None;
        state.last_pcr_emit_us = None;
        self.emit_psi(&mut state, 0);
        state.last_psi_emit_us = Some(0);
        Ok(())
    }

    fn write(&self, stream_id: StreamId, frame: Frame) -> Result<()> {
        let idx = {
            let state = self.state.lock();
            *state.stream_ids.get(&stream_id).ok_or_else(|| Error::invalid_state("write to unknown TS stream id"))?
        };

        if frame.is_codec_config() {
            self.state.lock().pending_config.insert(idx, frame.payload().clone());
            return Ok(());
        }

        let rebased = match self.clock.accept(&frame) {
            Some(f) => f,
            None => return Ok(()),
        };

        let mut state = self.state.lock();
        self.maybe_emit_psi(&mut state, rebased.pts_us());

        let mut payload = BytesMut::new();
        if let Some(cfg) = state.pending_config.remove(&idx) {
            payload.put_slice(&cfg);
        }
        payload.put_slice(rebased.payload());

        let (pid, is_video) = {
            let s = &state.streams[idx];
            (s.pid, s.is_video)
        };
        let stream_id_byte = if is_video { 0xE0u8 } else { 0xC0u8 };
        let pts_90k = us_to_90khz(rebased.pts_us());
        let dts_90k = if rebased.dts_us() != rebased.pts_us() { Some(us_to_90khz(rebased.dts_us())) } else { None };
        let pes = build_pes(is_video, stream_id_byte, pts_90k, dts_90k, &payload);

        let want_pcr = if state.pcr_pid() == Some(pid) {
            let due = match state.last_pcr_emit_us {
                None => true,
                Some(last) => rebased.pts_us() - last >= PCR_MIN_INTERVAL_US,
            };
            if due {
                state.last_pcr_emit_us = Some(rebased.pts_us());
                Some(pts_90k)
            } else {
                None
            }
        } else {
            None
        };

        let mut remaining: &[u8] = &pes;
        let mut first = true;
        loop {
            let cc = next_cc(&mut state.continuity, pid);
            let pcr_for_this = if first { want_pcr } else { None };
            let (pkt, consumed) = build_ts_packet(pid, first, cc, pcr_for_this, remaining);
            self.emit(pkt, rebased.pts_us());
            remaining = &remaining[consumed..];
            first = false;
            if remaining.is_empty() {
                break;
            }
        }
        Ok(())
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

fn next_cc(continuity: &mut HashMap<u16, u8>, pid: u16) -> u8 {
    let cc = continuity.entry(pid).or_insert(0);
    let v = *cc;
    *cc = (*cc + 1) % 16;
    v
}

fn us_to_90khz(us: i64) -> u64 {
    ((i128::from(us) * 90) / 1000) as u64
}

fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &b in data {
        crc ^= u32::from(b) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ 0x04C1_1DB7 } else { crc << 1 };
        }
    }
    crc
}

fn wrap_section(table_id: u8, body: BytesMut) -> Bytes {
    let section_length = body.len() as u16 + 4; // + CRC32
    let mut section = BytesMut::with_capacity(3 + body.len() + 4);
    section.put_u8(table_id);
    section.put_u16(0xB000 | (section_length & 0x0FFF));
    section.put(body);
    let crc = crc32_mpeg2(&section);
    section.put_u32(crc);
    section.freeze()
}

fn build_pat(transport_stream_id: u16, program_number: u16, pmt_pid: u16, version: u8) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(transport_stream_id);
    body.put_u8(0xC1 | ((version & 0x1F) << 1));
    body.put_u8(0); // section_number
    body.put_u8(0); // last_section_number
    body.put_u16(program_number);
    body.put_u16(0xE000 | (pmt_pid & 0x1FFF));
    wrap_section(0x00, body)
}

fn build_pmt(program_number: u16, pcr_pid: u16, streams: &[EsStream], version: u8) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(program_number);
    body.put_u8(0xC1 | ((version & 0x1F) << 1));
    body.put_u8(0);
    body.put_u8(0);
    body.put_u16(0xE000 | (pcr_pid & 0x1FFF));
    body.put_u16(0xF000); // program_info_length = 0, no program-level descriptors
    for s in streams {
        body.put_u8(s.stream_type);
        body.put_u16(0xE000 | (s.pid & 0x1FFF));
        if s.is_opus {
            let desc = opus_registration_descriptor();
            body.put_u16(0xF000 | (desc.len() as u16));
            body.put_slice(&desc);
        } else {
            body.put_u16(0xF000);
        }
    }
    wrap_section(0x02, body)
}

/// The `Opus` registration descriptor (tag 0x05) used to signal an Opus
/// elementary stream, per the informal convention shared by OBS/ffmpeg TS
/// muxers (no formal DVB descriptor for Opus exists).
fn opus_registration_descriptor() -> Vec<u8> {
    vec![0x05, 0x04, b'O', b'p', b'u', b's']
}

fn build_sdt(service: &Service, version: u8) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u16(service.transport_stream_id);
    body.put_u8(0xC1 | ((version & 0x1F) << 1));
    body.put_u8(0);
    body.put_u8(0);
    body.put_u16(service.original_network_id);
    body.put_u8(0xFF); // reserved_future_use

    let mut descriptor_body = BytesMut::new();
    descriptor_body.put_u8(0x01); // service_type: digital television service
    descriptor_body.put_u8(service.provider_name.len() as u8);
    descriptor_body.put_slice(service.provider_name.as_bytes());
    descriptor_body.put_u8(service.service_name.len() as u8);
    descriptor_body.put_slice(service.service_name.as_bytes());

    let mut descriptor = BytesMut::new();
    descriptor.put_u8(0x48); // service_descriptor tag
    descriptor.put_u8(descriptor_body.len() as u8);
    descriptor.put(descriptor_body);

    body.put_u16(service.service_id);
    body.put_u8(0b1111_1100); // reserved(6) + EIT_schedule(0) + EIT_present_following(0)
    body.put_u16(0x8000 | (descriptor.len() as u16 & 0x0FFF)); // running_status=4 + free_CA=0 + loop length
    body.put(descriptor);
    wrap_section(0x42, body)
}

fn packetize_section(pid: u16, section: &[u8], continuity: &mut HashMap<u16, u8>) -> Vec<Bytes> {
    let mut payload = Vec::with_capacity(section.len() + 1);
    payload.push(0x00); // pointer_field
    payload.extend_from_slice(section);

    let mut remaining: &[u8] = &payload;
    let mut first = true;
    let mut out = Vec::new();
    loop {
        let cc = next_cc(continuity, pid);
        let (pkt, consumed) = build_ts_packet(pid, first, cc, None, remaining);
        out.push(pkt);
        remaining = &remaining[consumed..];
        first = false;
        if remaining.is_empty() {
            break;
        }
    }
    out
}

fn encode_pcr(base_90k: u64) -> [u8; 6] {
    let base = base_90k & 0x1_FFFF_FFFF;
    let mut b = [0u8; 6];
    b[0] = (base >> 25) as u8;
    b[1] = (base >> 17) as u8;
    b[2] = (base >> 9) as u8;
    b[3] = (base >> 1) as u8;
    b[4] = (((base & 1) as u8) << 7) | 0b0111_1110;
    b[5] = 0x00;
    b
}

const STUFFING: [u8; 184] = [0xFF; 184];

/// Builds one 188-byte TS packet starting at `payload`, returning the packet
/// and how many payload bytes it consumed. `pcr_90khz` requests a PCR-bearing
/// adaptation field on this packet (only meaningful when `pusi` is also the
/// first packet of a PES).
fn build_ts_packet(pid: u16, pusi: bool, cc: u8, pcr_90khz: Option<u64>, payload: &[u8]) -> (Bytes, usize) {
    let mut pkt = BytesMut::with_capacity(PACKET_SIZE);
    pkt.put_u8(SYNC_BYTE);
    let mut pid_field = pid & 0x1FFF;
    if pusi {
        pid_field |= 0x4000;
    }
    pkt.put_u16(pid_field);

    let budget = PACKET_SIZE - 4;
    let min_af_len = if pcr_90khz.is_some() { 8 } else { 0 }; // length byte + flags byte + 6-byte PCR
    let payload_take = payload.len().min(budget.saturating_sub(min_af_len));
    let non_payload = budget - payload_take;

    if non_payload == 0 {
        pkt.put_u8(0x10 | (cc & 0x0F)); // adaptation_field_control = payload only
        pkt.put_slice(&payload[..payload_take]);
    } else {
        pkt.put_u8(0x30 | (cc & 0x0F)); // adaptation_field_control = adaptation + payload
        let af_len = non_payload - 1;
        pkt.put_u8(af_len as u8);
        if af_len > 0 {
            if let Some(pcr) = pcr_90khz {
                pkt.put_u8(0x10); // PCR_flag
                pkt.put_slice(&encode_pcr(pcr));
                pkt.put_slice(&STUFFING[..af_len - 7]);
            } else {
                pkt.put_u8(0x00);
                pkt.put_slice(&STUFFING[..af_len - 1]);
            }
        }
        pkt.put_slice(&payload[..payload_take]);
    }
    (pkt.freeze(), payload_take)
}

fn put_timestamp(buf: &mut BytesMut, prefix: u8, value_90k: u64) {
    let v = value_90k & 0x1_FFFF_FFFF;
    buf.put_u8((prefix << 4) | (((v >> 30) & 0x07) as u8) << 1 | 1);
    buf.put_u8(((v >> 22) & 0xFF) as u8);
    buf.put_u8(((((v >> 15) & 0x7F) as u8) << 1) | 1);
    buf.put_u8(((v >> 7) & 0xFF) as u8);
    buf.put_u8((((v & 0x7F) as u8) << 1) | 1);
}

fn build_pes(is_video: bool, stream_id_byte: u8, pts_90k: u64, dts_90k: Option<u64>, payload: &[u8]) -> Bytes {
    let has_dts = dts_90k.is_some();
    let header_data_len: u8 = if has_dts { 10 } else { 5 };
    let content_after_length_field = 2 + 1 + usize::from(header_data_len) + payload.len();
    // Video PES length is left unbounded (0) per spec.md §4.3.2; audio is bounded when it fits.
    let pes_len: u16 = if is_video {
        0
    } else if content_after_length_field <= 0xFFFF {
        content_after_length_field as u16
    } else {
        0
    };

    let mut pes = BytesMut::with_capacity(9 + usize::from(header_data_len) + payload.len());
    pes.put_u8(0x00);
    pes.put_u8(0x00);
    pes.put_u8(0x01);
    pes.put_u8(stream_id_byte);
    pes.put_u16(pes_len);
    pes.put_u8(0x80); // '10' + no scrambling/priority/alignment/copyright flags
    pes.put_u8(if has_dts { 0b1100_0000 } else { 0b1000_0000 }); // PTS_DTS_flags
    pes.put_u8(header_data_len);
    put_timestamp(&mut pes, if has_dts { 0b0011 } else { 0b0010 }, pts_90k);
    if let Some(dts) = dts_90k {
        put_timestamp(&mut pes, 0b0001, dts);
    }
    pes.put_slice(payload);
    pes.freeze()
}
