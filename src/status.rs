//! Receiver, application and media state value types, plus the JSON payload
//! shapes they arrive in on the receiver and media namespaces.

use serde::{Deserialize, Serialize};

/// A running receiver application as reported by RECEIVER_STATUS.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Application {
    pub app_id: String,
    pub session_id: String,
    pub display_name: String,
    pub status_text: String,
    /// Session-specific destination id for media-namespace traffic.
    pub transport_id: String,
    pub namespaces: Vec<Namespace>,
}

/// Namespace entry inside an application record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Namespace {
    pub name: String,
}

/// Device volume. The first value observed on a channel always produces an
/// update, even `{0.0, false}`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Volume {
    pub level: f32,
    pub muted: bool,
}

/// One media session from a MEDIA_STATUS payload. Sessions are replaced
/// wholesale on every status, never field-diffed.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaSession {
    pub media_session_id: i64,
    pub player_state: String,
    pub current_time: f64,
    pub idle_reason: Option<String>,
    pub media: Option<MediaInformation>,
}

/// Media item descriptor inside a session.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaInformation {
    pub content_id: String,
    pub content_type: String,
    pub stream_type: String,
    pub duration: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

/// Minimal header present in every JSON payload.
#[derive(Debug, Deserialize)]
pub(crate) struct PayloadHeader {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(rename = "requestId", default)]
    #[allow(dead_code)]
    pub request_id: i32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReceiverStatusResponse {
    #[serde(rename = "requestId", default)]
    pub request_id: i32,
    #[serde(default)]
    pub status: ReceiverStatus,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ReceiverStatus {
    #[serde(default)]
    pub applications: Vec<Application>,
    pub volume: Option<Volume>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MediaStatusResponse {
    #[serde(rename = "requestId", default)]
    pub request_id: i32,
    #[serde(default)]
    pub status: Vec<MediaSession>,
}

#[cfg(test)]
mod tests {
    use super::{MediaStatusResponse, ReceiverStatusResponse, Volume};

    const RECEIVER_STATUS: &str = r#"{
        "type": "RECEIVER_STATUS",
        "requestId": 7,
        "status": {
            "applications": [{
                "appId": "CC1AD845",
                "sessionId": "s1",
                "displayName": "Default Media Receiver",
                "statusText": "Ready",
                "transportId": "t1",
                "namespaces": [{"name": "urn:x-cast:com.google.cast.media"}]
            }],
            "volume": {"level": 0.5, "muted": false}
        }
    }"#;

    #[test]
    fn test_receiver_status_parses_application_and_volume() {
        let parsed: ReceiverStatusResponse = serde_json::from_str(RECEIVER_STATUS).expect("parse");
        assert_eq!(parsed.request_id, 7);
        let app = parsed.status.applications.first().expect("application");
        assert_eq!(app.app_id, "CC1AD845");
        assert_eq!(app.transport_id, "t1");
        assert_eq!(app.namespaces[0].name, "urn:x-cast:com.google.cast.media");
        let volume = parsed.status.volume.expect("volume");
        assert!((volume.level - 0.5).abs() < f32::EPSILON);
        assert!(!volume.muted);
    }

    #[test]
    fn test_receiver_status_tolerates_missing_fields() {
        let parsed: ReceiverStatusResponse =
            serde_json::from_str(r#"{"type":"RECEIVER_STATUS","status":{}}"#).expect("parse");
        assert_eq!(parsed.request_id, 0);
        assert!(parsed.status.applications.is_empty());
        assert!(parsed.status.volume.is_none());
    }

    #[test]
    fn test_media_status_parses_sessions() {
        let parsed: MediaStatusResponse = serde_json::from_str(
            r#"{
                "type": "MEDIA_STATUS",
                "requestId": 3,
                "status": [{
                    "mediaSessionId": 1,
                    "playerState": "PLAYING",
                    "currentTime": 12.5,
                    "media": {
                        "contentId": "http://example/a.mp3",
                        "contentType": "audio/mpeg",
                        "streamType": "BUFFERED",
                        "duration": 180.0
                    }
                }]
            }"#,
        )
        .expect("parse");
        let session = parsed.status.first().expect("session");
        assert_eq!(session.media_session_id, 1);
        assert_eq!(session.player_state, "PLAYING");
        let media = session.media.as_ref().expect("media");
        assert_eq!(media.content_type, "audio/mpeg");
        assert_eq!(media.duration, Some(180.0));
    }

    #[test]
    fn test_volume_structural_equality() {
        let a = Volume { level: 0.5, muted: false };
        let b = Volume { level: 0.5, muted: false };
        let c = Volume { level: 0.5, muted: true };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
