//! RamPipe control socket schema
//!
//! A client sends one newline-free UTF-8 JSON request per connection, the
//! daemon replies with exactly one JSON response, then both sides close.

use rampipe_common::Backend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Requested operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Pin,
    Unpin,
    Status,
    Sync,
}

/// Explicit pinning strategy chosen by the client
///
/// Clients pick between the copy-based strategies; the snapshot backend is
/// reserved for automatic promotion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    #[default]
    Move,
    Overlay,
}

impl From<PinMode> for Backend {
    fn from(mode: PinMode) -> Self {
        match mode {
            PinMode::Move => Self::Move,
            PinMode::Overlay => Self::Overlay,
        }
    }
}

/// One client request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PinMode>,
}

impl Request {
    /// Build a pin request
    #[must_use]
    pub fn pin(path: impl Into<PathBuf>, mode: PinMode) -> Self {
        Self {
            action: Action::Pin,
            path: Some(path.into()),
            mode: Some(mode),
        }
    }

    /// Build an unpin request
    #[must_use]
    pub fn unpin(path: impl Into<PathBuf>) -> Self {
        Self {
            action: Action::Unpin,
            path: Some(path.into()),
            mode: None,
        }
    }

    /// Build a status request
    #[must_use]
    pub fn status() -> Self {
        Self {
            action: Action::Status,
            path: None,
            mode: None,
        }
    }

    /// Build a sync request
    #[must_use]
    pub fn sync() -> Self {
        Self {
            action: Action::Sync,
            path: None,
            mode: None,
        }
    }

    /// Decode a request from raw socket bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("malformed request: {e}"))
    }

    /// Encode for the wire (single line, no trailing newline)
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("request serialization cannot fail")
    }
}

/// Response status tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Per-item figures reported by `status`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatus {
    /// Backend holding the pin
    pub backend: Backend,
    /// Measured RAM usage in bytes (best effort)
    pub bytes: u64,
}

/// Payload of a successful `status` response
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusData {
    /// Pinned items keyed by canonical path
    pub items: BTreeMap<String, ItemStatus>,
    /// Sum of all per-item figures
    pub total_bytes: u64,
}

/// One daemon response
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_data: Option<StatusData>,
}

impl Response {
    /// Build a success response
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            status_data: None,
        }
    }

    /// Build an error response
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
            status_data: None,
        }
    }

    /// Build a success response carrying status data
    #[must_use]
    pub fn with_status_data(data: StatusData) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: format!("{} item(s) pinned", data.items.len()),
            status_data: Some(data),
        }
    }

    /// True if the daemon reported success
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Decode a response from raw socket bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(bytes).map_err(|e| format!("malformed response: {e}"))
    }

    /// Encode for the wire (single line, no trailing newline)
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("response serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = Request::pin("/srv/db", PinMode::Overlay);
        let bytes = req.encode();
        assert!(!bytes.contains(&b'\n'));
        let parsed = Request::decode(&bytes).unwrap();
        assert_eq!(parsed.action, Action::Pin);
        assert_eq!(parsed.path.as_deref(), Some(std::path::Path::new("/srv/db")));
        assert_eq!(parsed.mode, Some(PinMode::Overlay));
    }

    #[test]
    fn test_request_accepts_python_style_json() {
        // The historical client sent exactly this shape
        let req =
            Request::decode(br#"{"action": "pin", "path": "/var/log/app", "mode": "move"}"#)
                .unwrap();
        assert_eq!(req.action, Action::Pin);
        assert_eq!(req.mode, Some(PinMode::Move));
    }

    #[test]
    fn test_unknown_action_rejected() {
        let err = Request::decode(br#"{"action": "defrag"}"#).unwrap_err();
        assert!(err.contains("malformed request"));
    }

    #[test]
    fn test_status_response_payload() {
        let mut data = StatusData::default();
        data.items.insert(
            "/srv/db".to_string(),
            ItemStatus {
                backend: Backend::Move,
                bytes: 10 * 1024 * 1024,
            },
        );
        data.total_bytes = 10 * 1024 * 1024;
        let resp = Response::with_status_data(data);
        let bytes = resp.encode();
        let parsed = Response::decode(&bytes).unwrap();
        assert!(parsed.is_success());
        let parsed_data = parsed.status_data.unwrap();
        assert_eq!(parsed_data.total_bytes, 10 * 1024 * 1024);
        assert_eq!(parsed_data.items["/srv/db"].backend, Backend::Move);
    }
}
