//! Observer feed protocol
//!
//! Push-only: the gateway sends one JSON message per poll tick and expects
//! nothing back. Each message is either a state snapshot or an error notice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages pushed to observer connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Latest printer state, exactly as the upstream server returned it
    PrinterStatus {
        state: serde_json::Value,
        polled_at: DateTime<Utc>,
    },

    /// The poll for this tick failed
    Error { message: String },
}

impl FeedMessage {
    pub fn snapshot(state: serde_json::Value) -> Self {
        FeedMessage::PrinterStatus {
            state,
            polled_at: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        FeedMessage::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, FeedMessage::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_serialization() {
        let msg = FeedMessage::snapshot(json!([{ "job": "benchy.gcode", "done": 42.5 }]));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "printer_status");
        assert_eq!(json["state"][0]["job"], "benchy.gcode");
        assert!(json["polled_at"].is_string());
    }

    #[test]
    fn test_error_serialization() {
        let msg = FeedMessage::error("Request timed out after 10000ms");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(msg.is_error());

        let parsed: FeedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }
}
