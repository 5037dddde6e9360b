//! Wire schema for the RPC adapter: device snapshots and events, encoded
//! with the same hand-rolled protobuf primitives as the device channel.

use crate::codec::{read_varint, write_bytes_field, write_string_field, write_varint_field};
use crate::device::CastDevice;
use crate::error::CastError;
use crate::event::{CastEvent, EventKind};

/// Device snapshot as marshalled to remote consumers: exactly the five
/// canonical attributes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RpcDevice {
    pub id: String,
    pub name: String,
    pub model: String,
    pub service: String,
    pub state: u32,
}

impl From<&CastDevice> for RpcDevice {
    fn from(device: &CastDevice) -> Self {
        Self {
            id: device.id().to_string(),
            name: device.name().to_string(),
            model: device.model().to_string(),
            service: device.service().to_string(),
            state: device.state(),
        }
    }
}

/// Event as marshalled to remote consumers. The zero value (kind `None`, no
/// device) doubles as the stream keepalive and encodes to an empty body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RpcEvent {
    pub kind: EventKind,
    pub device: Option<RpcDevice>,
}

impl RpcEvent {
    pub fn keepalive() -> Self {
        Self::default()
    }
}

impl From<&CastEvent> for RpcEvent {
    fn from(event: &CastEvent) -> Self {
        Self {
            kind: event.kind(),
            device: Some(RpcDevice::from(event.device())),
        }
    }
}

/// RPC surface exposed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    Ping = 1,
    Devices = 2,
    StreamEvents = 3,
}

pub fn encode_device(device: &RpcDevice) -> Vec<u8> {
    let mut body = Vec::new();
    if !device.id.is_empty() {
        write_string_field(&mut body, 1, &device.id);
    }
    if !device.name.is_empty() {
        write_string_field(&mut body, 2, &device.name);
    }
    if !device.model.is_empty() {
        write_string_field(&mut body, 3, &device.model);
    }
    if !device.service.is_empty() {
        write_string_field(&mut body, 4, &device.service);
    }
    if device.state != 0 {
        write_varint_field(&mut body, 5, u64::from(device.state));
    }
    body
}

pub fn decode_device(bytes: &[u8]) -> Result<RpcDevice, CastError> {
    let mut cursor = 0usize;
    let mut device = RpcDevice::default();
    while cursor < bytes.len() {
        let (field_number, wire_type) = read_key(bytes, &mut cursor)?;
        match (field_number, wire_type) {
            (5, 0) => {
                let value = read_varint(bytes, &mut cursor)
                    .ok_or_else(|| CastError::Protocol("invalid state field".to_string()))?;
                device.state = u32::try_from(value)
                    .map_err(|_| CastError::Protocol("state out of range".to_string()))?;
            }
            (1..=4, 2) => {
                let value = read_string(bytes, &mut cursor)?;
                match field_number {
                    1 => device.id = value,
                    2 => device.name = value,
                    3 => device.model = value,
                    4 => device.service = value,
                    _ => unreachable!(),
                }
            }
            (_, wire_type) => skip_field(wire_type, bytes, &mut cursor)?,
        }
    }
    Ok(device)
}

pub fn encode_event(event: &RpcEvent) -> Vec<u8> {
    let mut body = Vec::new();
    if event.kind != EventKind::None {
        write_varint_field(&mut body, 1, event.kind as u64);
    }
    if let Some(device) = &event.device {
        write_bytes_field(&mut body, 2, &encode_device(device));
    }
    body
}

pub fn decode_event(bytes: &[u8]) -> Result<RpcEvent, CastError> {
    let mut cursor = 0usize;
    let mut event = RpcEvent::default();
    while cursor < bytes.len() {
        let (field_number, wire_type) = read_key(bytes, &mut cursor)?;
        match (field_number, wire_type) {
            (1, 0) => {
                let value = read_varint(bytes, &mut cursor)
                    .ok_or_else(|| CastError::Protocol("invalid event type".to_string()))?;
                event.kind = EventKind::from_u64(value)
                    .ok_or_else(|| CastError::Protocol(format!("unknown event type {value}")))?;
            }
            (2, 2) => {
                let nested = read_bytes(bytes, &mut cursor)?;
                event.device = Some(decode_device(nested)?);
            }
            (_, wire_type) => skip_field(wire_type, bytes, &mut cursor)?,
        }
    }
    Ok(event)
}

pub fn encode_devices_reply(devices: &[RpcDevice]) -> Vec<u8> {
    let mut body = Vec::new();
    for device in devices {
        write_bytes_field(&mut body, 1, &encode_device(device));
    }
    body
}

pub fn decode_devices_reply(bytes: &[u8]) -> Result<Vec<RpcDevice>, CastError> {
    let mut cursor = 0usize;
    let mut devices = Vec::new();
    while cursor < bytes.len() {
        let (field_number, wire_type) = read_key(bytes, &mut cursor)?;
        match (field_number, wire_type) {
            (1, 2) => {
                let nested = read_bytes(bytes, &mut cursor)?;
                devices.push(decode_device(nested)?);
            }
            (_, wire_type) => skip_field(wire_type, bytes, &mut cursor)?,
        }
    }
    Ok(devices)
}

pub fn encode_request(method: RpcMethod) -> Vec<u8> {
    let mut body = Vec::new();
    write_varint_field(&mut body, 1, method as u64);
    body
}

pub fn decode_request(bytes: &[u8]) -> Result<RpcMethod, CastError> {
    let mut cursor = 0usize;
    let mut method = None;
    while cursor < bytes.len() {
        let (field_number, wire_type) = read_key(bytes, &mut cursor)?;
        match (field_number, wire_type) {
            (1, 0) => {
                let value = read_varint(bytes, &mut cursor)
                    .ok_or_else(|| CastError::Protocol("invalid method field".to_string()))?;
                method = Some(match value {
                    1 => RpcMethod::Ping,
                    2 => RpcMethod::Devices,
                    3 => RpcMethod::StreamEvents,
                    other => {
                        return Err(CastError::Protocol(format!("unknown method {other}")))
                    }
                });
            }
            (_, wire_type) => skip_field(wire_type, bytes, &mut cursor)?,
        }
    }
    method.ok_or_else(|| CastError::Protocol("request without method".to_string()))
}

fn read_key(bytes: &[u8], cursor: &mut usize) -> Result<(u32, u8), CastError> {
    let key = read_varint(bytes, cursor)
        .ok_or_else(|| CastError::Protocol("invalid protobuf key".to_string()))?;
    Ok(((key >> 3) as u32, (key & 0x07) as u8))
}

fn read_bytes<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], CastError> {
    let len = read_varint(bytes, cursor)
        .ok_or_else(|| CastError::Protocol("invalid length prefix".to_string()))? as usize;
    if *cursor + len > bytes.len() {
        return Err(CastError::Protocol("field out of bounds".to_string()));
    }
    let slice = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok(slice)
}

fn read_string(bytes: &[u8], cursor: &mut usize) -> Result<String, CastError> {
    let slice = read_bytes(bytes, cursor)?;
    std::str::from_utf8(slice)
        .map(ToString::to_string)
        .map_err(|_| CastError::Protocol("invalid utf-8 field".to_string()))
}

fn skip_field(wire_type: u8, bytes: &[u8], cursor: &mut usize) -> Result<(), CastError> {
    match wire_type {
        0 => {
            read_varint(bytes, cursor)
                .ok_or_else(|| CastError::Protocol("invalid varint field".to_string()))?;
            Ok(())
        }
        2 => read_bytes(bytes, cursor).map(|_| ()),
        other => Err(CastError::Protocol(format!("unsupported wire type {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        decode_device, decode_devices_reply, decode_event, decode_request, encode_device,
        encode_devices_reply, encode_event, encode_request, RpcDevice, RpcEvent, RpcMethod,
    };
    use crate::event::EventKind;

    fn sample_device() -> RpcDevice {
        RpcDevice {
            id: "abc123".to_string(),
            name: "Kitchen".to_string(),
            model: "Chromecast".to_string(),
            service: "Netflix".to_string(),
            state: 1,
        }
    }

    #[test]
    fn test_device_roundtrip() {
        let device = sample_device();
        let decoded = decode_device(&encode_device(&device)).expect("decode");
        assert_eq!(decoded, device);
    }

    #[test]
    fn test_empty_device_encodes_to_nothing() {
        let device = RpcDevice::default();
        assert!(encode_device(&device).is_empty());
        assert_eq!(decode_device(&[]).expect("decode"), device);
    }

    #[test]
    fn test_event_roundtrip() {
        let event = RpcEvent {
            kind: EventKind::DeviceAdded,
            device: Some(sample_device()),
        };
        let decoded = decode_event(&encode_event(&event)).expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_keepalive_event_is_the_empty_body() {
        let keepalive = RpcEvent::keepalive();
        assert!(encode_event(&keepalive).is_empty());
        let decoded = decode_event(&[]).expect("decode");
        assert_eq!(decoded.kind, EventKind::None);
        assert!(decoded.device.is_none());
    }

    #[test]
    fn test_unknown_event_kind_is_rejected() {
        let mut body = Vec::new();
        crate::codec::write_varint_field(&mut body, 1, 99);
        assert!(decode_event(&body).is_err());
    }

    #[test]
    fn test_devices_reply_roundtrip() {
        let devices = vec![
            sample_device(),
            RpcDevice {
                id: "def456".to_string(),
                ..Default::default()
            },
        ];
        let decoded = decode_devices_reply(&encode_devices_reply(&devices)).expect("decode");
        assert_eq!(decoded, devices);
    }

    #[test]
    fn test_request_roundtrip() {
        for method in [RpcMethod::Ping, RpcMethod::Devices, RpcMethod::StreamEvents] {
            assert_eq!(decode_request(&encode_request(method)).expect("decode"), method);
        }
        assert!(decode_request(&[]).is_err());
    }
}
