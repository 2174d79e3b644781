use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Payload tag carried in the `content_type` field.
///
/// The wire form is the bare string; anything outside the known set passes
/// through untouched so new tags do not break older peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Files,
    Other(String),
}

impl ContentKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Files => "files",
            Self::Other(tag) => tag.as_str(),
        }
    }

    /// True when the payload references an attachment that must be uploaded
    /// to the file service before persistence.
    pub fn is_files(&self) -> bool {
        matches!(self, Self::Files)
    }
}

impl From<&str> for ContentKind {
    fn from(tag: &str) -> Self {
        match tag {
            "text" => Self::Text,
            "files" => Self::Files,
            other => Self::Other(other.to_string()),
        }
    }
}

impl Display for ContentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContentKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::from(tag.as_str()))
    }
}

/// Delivery status recorded once at persistence time.
///
/// `1` means the receiver held a presence mark when the row was written,
/// `2` means the message was stored for an offline peer. The value is
/// advisory and never re-updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    DeliveredOnline,
    StoredOffline,
}

impl DeliveryStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::DeliveredOnline => 1,
            Self::StoredOffline => 2,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::DeliveredOnline),
            2 => Some(Self::StoredOffline),
            _ => None,
        }
    }

    /// Status for a message persisted while the receiver's presence query
    /// returned `present`.
    pub fn for_presence(present: bool) -> Self {
        if present {
            Self::DeliveredOnline
        } else {
            Self::StoredOffline
        }
    }
}

impl Serialize for DeliveryStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

impl<'de> Deserialize<'de> for DeliveryStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i32::deserialize(deserializer)?;
        Self::from_i32(value)
            .ok_or_else(|| de::Error::custom(format!("unknown delivery status {value}")))
    }
}

/// A direct message as persisted and as streamed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub content_type: ContentKind,
    pub file_path: String,
    pub status: DeliveryStatus,
    pub created_at: i64,
}

/// A client-authored frame read off the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessageInput {
    pub content_type: ContentKind,
    pub content: String,
}

/// Identity returned by the auth service for a valid bearer credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub uid: String,
    pub username: String,
}

/// Structured error frame emitted immediately before closing a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({ "error": self.error }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_kind_wire_forms() {
        assert_eq!(ContentKind::Text.as_str(), "text");
        assert_eq!(ContentKind::Files.as_str(), "files");
        assert_eq!(
            ContentKind::from("voice"),
            ContentKind::Other("voice".to_string())
        );
        let encoded = serde_json::to_string(&ContentKind::Files).unwrap();
        assert_eq!(encoded, "\"files\"");
        let decoded: ContentKind = serde_json::from_str("\"text\"").unwrap();
        assert_eq!(decoded, ContentKind::Text);
    }

    #[test]
    fn delivery_status_roundtrip() {
        assert_eq!(DeliveryStatus::DeliveredOnline.as_i32(), 1);
        assert_eq!(DeliveryStatus::StoredOffline.as_i32(), 2);
        assert_eq!(DeliveryStatus::from_i32(2), Some(DeliveryStatus::StoredOffline));
        assert_eq!(DeliveryStatus::from_i32(7), None);
        assert_eq!(
            DeliveryStatus::for_presence(true),
            DeliveryStatus::DeliveredOnline
        );
        assert_eq!(
            DeliveryStatus::for_presence(false),
            DeliveryStatus::StoredOffline
        );
    }

    #[test]
    fn delivery_status_rejects_unknown_wire_value() {
        let err = serde_json::from_str::<DeliveryStatus>("3").unwrap_err();
        assert!(err.to_string().contains("unknown delivery status"));
    }

    #[test]
    fn direct_message_field_names() {
        let message = DirectMessage {
            sender_id: "a".to_string(),
            receiver_id: "b".to_string(),
            content: "hi".to_string(),
            content_type: ContentKind::Text,
            file_path: String::new(),
            status: DeliveryStatus::StoredOffline,
            created_at: 1_700_000_000,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["sender_id"], "a");
        assert_eq!(value["receiver_id"], "b");
        assert_eq!(value["content"], "hi");
        assert_eq!(value["content_type"], "text");
        assert_eq!(value["file_path"], "");
        assert_eq!(value["status"], 2);
        assert_eq!(value["created_at"], 1_700_000_000_i64);
        let back: DirectMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn input_frame_parses() {
        let input: DirectMessageInput =
            serde_json::from_str("{\"content_type\":\"files\",\"content\":\"/tmp/x.png\"}")
                .unwrap();
        assert!(input.content_type.is_files());
        assert_eq!(input.content, "/tmp/x.png");
        assert!(serde_json::from_str::<DirectMessageInput>("{\"content\":1}").is_err());
    }

    #[test]
    fn error_frame_shape() {
        let frame = ErrorFrame::new("Receiver ID is required");
        assert_eq!(frame.to_json(), "{\"error\":\"Receiver ID is required\"}");
    }

    #[test]
    fn client_identity_parses_auth_response() {
        let identity: ClientIdentity =
            serde_json::from_str("{\"uid\":\"u1\",\"username\":\"mona\"}").unwrap();
        assert_eq!(identity.uid, "u1");
        assert_eq!(identity.username, "mona");
    }
}
