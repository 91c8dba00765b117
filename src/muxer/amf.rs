//! AMF0 value encoding (spec.md glossary: "the value-encoding used inside
//! FLV script tags"), just enough of it to build an `onMetaData` ECMA array.

use bytes::{BufMut, Bytes, BytesMut};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const OBJECT_END_MARKER: [u8; 3] = [0x00, 0x00, 0x09];

#[derive(Clone, Debug, PartialEq)]
pub enum AmfValue {
    Number(f64),
    Boolean(bool),
    String(String),
}

impl AmfValue {
    fn write(&self, buf: &mut BytesMut) {
        match self {
            AmfValue::Number(n) => {
                buf.put_u8(MARKER_NUMBER);
                buf.put_f64(*n);
            }
            AmfValue::Boolean(b) => {
                buf.put_u8(MARKER_BOOLEAN);
                buf.put_u8(if *b { 1 } else { 0 });
            }
            AmfValue::String(s) => write_short_string(buf, s),
        }
    }
}

fn write_short_string(buf: &mut BytesMut, s: &str) {
    buf.put_u8(MARKER_STRING);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Encodes an AMF0 ECMA array: `u32` element count, then `{name, value}`
/// pairs (name encoded as a raw UTF-8 string with no leading type marker,
/// per the AMF0 spec's object-property encoding), then the standard
/// object-end marker `00 00 09`.
pub fn encode_ecma_array(entries: &[(&str, AmfValue)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(MARKER_ECMA_ARRAY);
    buf.put_u32(entries.len() as u32);
    for (name, value) in entries {
        buf.put_u16(name.len() as u16);
        buf.put_slice(name.as_bytes());
        value.write(&mut buf);
    }
    buf.put_slice(&OBJECT_END_MARKER);
    buf.freeze()
}

/// Builds the full AMF0 payload of a `onMetaData` script data tag: the
/// `"onMetaData"` string marker followed by the ECMA array.
pub fn encode_on_metadata(entries: &[(&str, AmfValue)]) -> Bytes {
    let mut buf = BytesMut::new();
    write_short_string(&mut buf, "onMetaData");
    buf.put(encode_ecma_array(entries));
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_short_string() {
        let mut buf = BytesMut::new();
        write_short_string(&mut buf, "hi");
        assert_eq!(&buf[..], &[0x02, 0x00, 0x02, b'h', b'i']);
    }

    #[test]
    fn ecma_array_has_count_and_end_marker() {
        let bytes = encode_ecma_array(&[("duration", AmfValue::Number(2.0))]);
        assert_eq!(bytes[0], MARKER_ECMA_ARRAY);
        assert_eq!(&bytes[1..5], &1u32.to_be_bytes());
        assert_eq!(&bytes[bytes.len() - 3..], &OBJECT_END_MARKER);
    }

    #[test]
    fn on_metadata_starts_with_event_name() {
        let bytes = encode_on_metadata(&[("duration", AmfValue::Number(0.0))]);
        assert_eq!(bytes[0], MARKER_STRING);
        assert_eq!(&bytes[3..13], b"onMetaData");
    }
}
