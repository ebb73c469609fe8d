//! WebSocket frame types.
//!
//! Every frame is a JSON object tagged by `type`; server frames always
//! carry a `timestamp`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use px_core::bus::Event;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Pong {
        timestamp: DateTime<Utc>,
    },
    Event {
        payload: Event,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerFrame {
    pub fn pong() -> Self {
        ServerFrame::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn event(event: Event) -> Self {
        ServerFrame::Event {
            timestamp: event.timestamp,
            payload: event,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","topics":["experiment.*"]}"#).unwrap();
        match frame {
            ClientFrame::Subscribe { topics } => assert_eq!(topics, vec!["experiment.*"]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"ping"}"#).is_ok());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"nonsense"}"#).is_err());
    }

    #[test]
    fn server_frames_carry_timestamp_and_tag() {
        let json = serde_json::to_value(ServerFrame::event(Event::new(
            "experiment.created",
            serde_json::json!({"experiment_id": "exp-1"}),
        )))
        .unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["payload"]["type"], "experiment.created");
        assert!(json["timestamp"].is_string());

        let json = serde_json::to_value(ServerFrame::pong()).unwrap();
        assert_eq!(json["type"], "pong");
        assert!(json["timestamp"].is_string());
    }
}
