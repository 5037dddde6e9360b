//! Event model: per-channel events and the device-stamped stream the
//! manager publishes.

use crate::device::CastDevice;
use crate::status::{Application, MediaSession, Volume};

/// Discriminant shared by the in-process stream and the RPC wire schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventKind {
    #[default]
    None = 0,
    DeviceAdded = 1,
    DeviceUpdated = 2,
    DeviceRemoved = 3,
    ChannelConnect = 4,
    ChannelDisconnect = 5,
    VolumeUpdated = 6,
    ApplicationUpdated = 7,
    MediaUpdated = 8,
}

impl EventKind {
    pub(crate) fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::DeviceAdded),
            2 => Some(Self::DeviceUpdated),
            3 => Some(Self::DeviceRemoved),
            4 => Some(Self::ChannelConnect),
            5 => Some(Self::ChannelDisconnect),
            6 => Some(Self::VolumeUpdated),
            7 => Some(Self::ApplicationUpdated),
            8 => Some(Self::MediaUpdated),
            _ => None,
        }
    }
}

/// Event emitted by a single channel, before the manager stamps it with the
/// originating device. `Disconnect` is terminal: it is emitted exactly once
/// per channel and nothing follows it.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Connect,
    Disconnect,
    VolumeUpdated {
        volume: Volume,
        request_id: i32,
    },
    ApplicationUpdated {
        application: Option<Application>,
        request_id: i32,
    },
    MediaUpdated {
        media: Option<Vec<MediaSession>>,
        request_id: i32,
    },
}

/// Event on the manager's stream. Every variant carries a snapshot of the
/// originating device; channel-level variants also carry the remote address
/// identifying the channel. Consumers never receive shared mutable state.
#[derive(Debug, Clone)]
pub enum CastEvent {
    DeviceAdded {
        device: CastDevice,
    },
    DeviceUpdated {
        device: CastDevice,
    },
    DeviceRemoved {
        device: CastDevice,
    },
    ChannelConnect {
        device: CastDevice,
        remote_addr: String,
    },
    ChannelDisconnect {
        device: CastDevice,
        remote_addr: String,
    },
    VolumeUpdated {
        device: CastDevice,
        remote_addr: String,
        volume: Volume,
        request_id: i32,
    },
    ApplicationUpdated {
        device: CastDevice,
        remote_addr: String,
        application: Option<Application>,
        request_id: i32,
    },
    MediaUpdated {
        device: CastDevice,
        remote_addr: String,
        media: Option<Vec<MediaSession>>,
        request_id: i32,
    },
}

impl CastEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DeviceAdded { .. } => EventKind::DeviceAdded,
            Self::DeviceUpdated { .. } => EventKind::DeviceUpdated,
            Self::DeviceRemoved { .. } => EventKind::DeviceRemoved,
            Self::ChannelConnect { .. } => EventKind::ChannelConnect,
            Self::ChannelDisconnect { .. } => EventKind::ChannelDisconnect,
            Self::VolumeUpdated { .. } => EventKind::VolumeUpdated,
            Self::ApplicationUpdated { .. } => EventKind::ApplicationUpdated,
            Self::MediaUpdated { .. } => EventKind::MediaUpdated,
        }
    }

    pub fn device(&self) -> &CastDevice {
        match self {
            Self::DeviceAdded { device }
            | Self::DeviceUpdated { device }
            | Self::DeviceRemoved { device }
            | Self::ChannelConnect { device, .. }
            | Self::ChannelDisconnect { device, .. }
            | Self::VolumeUpdated { device, .. }
            | Self::ApplicationUpdated { device, .. }
            | Self::MediaUpdated { device, .. } => device,
        }
    }

    /// Stamps a channel event with its originating device.
    pub(crate) fn from_channel(
        device: &CastDevice,
        remote_addr: &str,
        event: ChannelEvent,
    ) -> Self {
        let device = device.clone();
        let remote_addr = remote_addr.to_string();
        match event {
            ChannelEvent::Connect => Self::ChannelConnect { device, remote_addr },
            ChannelEvent::Disconnect => Self::ChannelDisconnect { device, remote_addr },
            ChannelEvent::VolumeUpdated { volume, request_id } => Self::VolumeUpdated {
                device,
                remote_addr,
                volume,
                request_id,
            },
            ChannelEvent::ApplicationUpdated {
                application,
                request_id,
            } => Self::ApplicationUpdated {
                device,
                remote_addr,
                application,
                request_id,
            },
            ChannelEvent::MediaUpdated { media, request_id } => Self::MediaUpdated {
                device,
                remote_addr,
                media,
                request_id,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CastEvent, ChannelEvent, EventKind};
    use crate::device::CastDevice;
    use crate::discovery::ServiceRecord;
    use crate::status::Volume;

    fn device() -> CastDevice {
        CastDevice::new(ServiceRecord::new(
            "kitchen".to_string(),
            "_googlecast._tcp".to_string(),
            8009,
            vec!["id=abc".to_string()],
            Vec::new(),
            Vec::new(),
        ))
    }

    #[test]
    fn test_kind_discriminants_match_wire_values() {
        assert!(matches!(EventKind::from_u64(0), Some(EventKind::None)));
        assert!(matches!(
            EventKind::from_u64(EventKind::MediaUpdated as u64),
            Some(EventKind::MediaUpdated)
        ));
        assert!(EventKind::from_u64(9).is_none());
    }

    #[test]
    fn test_channel_event_is_stamped_with_device() {
        let event = CastEvent::from_channel(
            &device(),
            "192.168.1.10:8009",
            ChannelEvent::VolumeUpdated {
                volume: Volume { level: 0.5, muted: false },
                request_id: 2,
            },
        );
        assert_eq!(event.kind(), EventKind::VolumeUpdated);
        assert_eq!(event.device().id(), "abc");
        match event {
            CastEvent::VolumeUpdated { remote_addr, volume, request_id, .. } => {
                assert_eq!(remote_addr, "192.168.1.10:8009");
                assert!((volume.level - 0.5).abs() < f32::EPSILON);
                assert_eq!(request_id, 2);
            }
            other => panic!("unexpected event {:?}", other.kind()),
        }
    }
}
