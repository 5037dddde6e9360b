//! CASTv2 wire framing: 4-byte big-endian length prefix followed by a
//! protobuf `CastMessage` envelope carrying a UTF-8 JSON payload.

use std::io::{self, Read, Write};

use crate::error::CastError;

/// Upper bound on a single frame body. Receiver status payloads are a few
/// kilobytes; anything near this size is a corrupt length prefix.
pub(crate) const MAX_FRAME_LEN: usize = 1024 * 1024;

const PAYLOAD_TYPE_STRING: u64 = 0;

/// Decoded CASTv2 envelope. Only STRING payloads exist on this protocol.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CastMessage {
    pub source_id: String,
    pub destination_id: String,
    pub namespace: String,
    pub payload: String,
}

/// Encodes the protobuf envelope body (without the length prefix).
pub fn encode_message(msg: &CastMessage) -> Vec<u8> {
    let mut body = Vec::with_capacity(
        32 + msg.source_id.len() + msg.destination_id.len() + msg.namespace.len() + msg.payload.len(),
    );
    write_varint_field(&mut body, 1, 0); // protocol_version CASTV2_1_0
    write_string_field(&mut body, 2, &msg.source_id);
    write_string_field(&mut body, 3, &msg.destination_id);
    write_string_field(&mut body, 4, &msg.namespace);
    write_varint_field(&mut body, 5, PAYLOAD_TYPE_STRING);
    write_string_field(&mut body, 6, &msg.payload);
    body
}

/// Encodes a complete frame: length prefix plus envelope body.
pub fn encode_frame(msg: &CastMessage) -> Result<Vec<u8>, CastError> {
    let body = encode_message(msg);
    let len = u32::try_from(body.len())
        .map_err(|_| CastError::Protocol("frame too large".to_string()))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes a protobuf envelope body into a [`CastMessage`].
pub fn decode_message(bytes: &[u8]) -> Result<CastMessage, CastError> {
    let mut cursor = 0usize;
    let mut msg = CastMessage::default();

    while cursor < bytes.len() {
        let key = read_varint(bytes, &mut cursor)
            .ok_or_else(|| CastError::Protocol("invalid protobuf key".to_string()))?;
        let field_number = (key >> 3) as u32;
        let wire_type = (key & 0x07) as u8;
        match wire_type {
            0 => {
                let value = read_varint(bytes, &mut cursor)
                    .ok_or_else(|| CastError::Protocol("invalid varint field".to_string()))?;
                if field_number == 5 && value != PAYLOAD_TYPE_STRING {
                    return Err(CastError::Protocol("binary payload not supported".to_string()));
                }
            }
            2 => {
                let len = read_varint(bytes, &mut cursor)
                    .ok_or_else(|| CastError::Protocol("invalid length prefix".to_string()))?
                    as usize;
                if cursor + len > bytes.len() {
                    return Err(CastError::Protocol("field out of bounds".to_string()));
                }
                match field_number {
                    2 | 3 | 4 | 6 => {
                        let value = std::str::from_utf8(&bytes[cursor..cursor + len])
                            .map_err(|_| CastError::Protocol("invalid utf-8 field".to_string()))?
                            .to_string();
                        match field_number {
                            2 => msg.source_id = value,
                            3 => msg.destination_id = value,
                            4 => msg.namespace = value,
                            6 => msg.payload = value,
                            _ => unreachable!(),
                        }
                    }
                    _ => {}
                }
                cursor += len;
            }
            other => {
                return Err(CastError::Protocol(format!("unsupported wire type {other}")));
            }
        }
    }

    Ok(msg)
}

/// Writes a length-prefixed frame.
pub(crate) fn write_frame_to<W: Write + ?Sized>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(body)
}

/// Reads one length-prefixed frame body. Returns `Ok(None)` when the read
/// deadline expires before a length prefix arrives; a zero-length frame is a
/// valid (empty) body.
pub(crate) fn read_frame_from<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.kind() == io::ErrorKind::TimedOut =>
        {
            return Ok(None);
        }
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

pub(crate) fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub(crate) fn write_varint_field(out: &mut Vec<u8>, field_number: u32, value: u64) {
    write_varint(out, (field_number as u64) << 3);
    write_varint(out, value);
}

pub(crate) fn write_string_field(out: &mut Vec<u8>, field_number: u32, value: &str) {
    write_bytes_field(out, field_number, value.as_bytes());
}

pub(crate) fn write_bytes_field(out: &mut Vec<u8>, field_number: u32, value: &[u8]) {
    write_varint(out, ((field_number as u64) << 3) | 2);
    write_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

pub(crate) fn read_varint(bytes: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut shift = 0u32;
    let mut value = 0u64;
    while *cursor < bytes.len() && shift <= 63 {
        let byte = bytes[*cursor];
        *cursor += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{
        decode_message, encode_frame, encode_message, read_frame_from, read_varint, write_varint,
        CastMessage,
    };

    fn sample_message() -> CastMessage {
        CastMessage {
            source_id: "sender-0".to_string(),
            destination_id: "receiver-0".to_string(),
            namespace: "urn:x-cast:com.google.cast.tp.heartbeat".to_string(),
            payload: r#"{"type":"PING"}"#.to_string(),
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = sample_message();
        let decoded = decode_message(&encode_message(&msg)).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_frame_carries_big_endian_length() {
        let msg = sample_message();
        let frame = encode_frame(&msg).expect("encode");
        let body_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(body_len, frame.len() - 4);
    }

    #[test]
    fn test_frame_roundtrip_through_reader() {
        let msg = sample_message();
        let frame = encode_frame(&msg).expect("encode");
        let mut reader = std::io::Cursor::new(frame);
        let body = read_frame_from(&mut reader).expect("read").expect("frame");
        assert_eq!(decode_message(&body).expect("decode"), msg);
    }

    #[test]
    fn test_decode_rejects_unknown_wire_type() {
        // Field 1 with wire type 5 (fixed32) is not part of the envelope.
        let bytes = [0x0d, 0x00, 0x00, 0x00, 0x00];
        assert!(decode_message(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_binary_payload() {
        let mut body = Vec::new();
        super::write_varint_field(&mut body, 5, 1); // payload_type BINARY
        assert!(decode_message(&body).is_err());
    }

    #[test]
    fn test_varint_multibyte_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 99_999, u64::from(u32::MAX)] {
            let mut out = Vec::new();
            write_varint(&mut out, value);
            let mut cursor = 0;
            assert_eq!(read_varint(&out, &mut cursor), Some(value));
            assert_eq!(cursor, out.len());
        }
    }

    #[test]
    fn test_decode_skips_unknown_string_fields() {
        let mut body = encode_message(&sample_message());
        super::write_string_field(&mut body, 9, "ignored");
        let decoded = decode_message(&body).expect("decode");
        assert_eq!(decoded, sample_message());
    }
}
