//! Live event envelopes

use crate::persistence::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload of the synthetic event sent when a channel opens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub timestamp: DateTime<Utc>,
}

/// Envelope delivered to browser observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LiveEvent {
    ConnectionStatus(ConnectionStatus),
    MqttMessage(Message),
}

impl LiveEvent {
    /// "Link up, no data yet"
    pub fn connection_established() -> Self {
        LiveEvent::ConnectionStatus(ConnectionStatus {
            connected: true,
            timestamp: Utc::now(),
        })
    }

    pub fn mqtt_message(message: Message) -> Self {
        LiveEvent::MqttMessage(message)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;

    fn sample_message() -> Message {
        Message {
            id: 42,
            connection_id: 7,
            topic: "sensors/temp".to_string(),
            payload: r#"{"t":22.5}"#.to_string(),
            qos: 1,
            retain: false,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            extracted_keys: None,
            latitude: None,
            longitude: None,
            device_id: None,
        }
    }

    #[test]
    fn test_connection_status_envelope() {
        let json: Value =
            serde_json::from_str(&LiveEvent::connection_established().to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "connection_status");
        assert_eq!(json["data"]["connected"], true);
        assert!(json["data"]["timestamp"].is_string());
    }

    #[test]
    fn test_mqtt_message_envelope() {
        let json: Value =
            serde_json::from_str(&LiveEvent::mqtt_message(sample_message()).to_json().unwrap())
                .unwrap();
        assert_eq!(json["type"], "mqtt_message");
        assert_eq!(json["data"]["connectionId"], 7);
        assert_eq!(json["data"]["topic"], "sensors/temp");
        assert_eq!(json["data"]["timestamp"], "2024-03-01T12:00:00Z");
    }
}
