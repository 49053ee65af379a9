//! Message envelope: JSON payload plus string headers and a send timestamp.
//!
//! On the wire the payload is the message body and `sentAt` travels as a
//! header alongside the caller's own headers.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{BrokerError, Result};

/// Header carrying the RFC 3339 send timestamp.
pub const SENT_AT_HEADER: &str = "sentAt";

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub payload: Value,
    /// Caller headers (without `sentAt`).
    pub headers: BTreeMap<String, String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Wrap a serializable message, stamping `sent_at` with the current time.
    pub fn wrap<T: Serialize + ?Sized>(
        message: &T,
        headers: BTreeMap<String, String>,
    ) -> Result<Self> {
        let payload = serde_json::to_value(message)
            .map_err(|e| BrokerError::Publish(format!("Failed to serialize message: {}", e)))?;

        // Millisecond precision so the stamp survives the header round trip.
        let sent_at = DateTime::from_timestamp_millis(Utc::now().timestamp_millis());

        let mut headers = headers;
        headers.remove(SENT_AT_HEADER);

        Ok(Self {
            payload,
            headers,
            sent_at,
        })
    }

    /// Body bytes and wire headers.
    pub fn encode(&self) -> Result<(Vec<u8>, BTreeMap<String, String>)> {
        let body = serde_json::to_vec(&self.payload)
            .map_err(|e| BrokerError::Publish(format!("Failed to serialize payload: {}", e)))?;

        let mut headers = self.headers.clone();
        if let Some(sent_at) = self.sent_at {
            headers.insert(
                SENT_AT_HEADER.to_string(),
                sent_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        }

        Ok((body, headers))
    }

    /// Rebuild an envelope from a delivery. Malformed JSON is a `Decode` error.
    pub fn decode(body: &[u8], mut headers: BTreeMap<String, String>) -> Result<Self> {
        let payload: Value =
            serde_json::from_slice(body).map_err(|e| BrokerError::Decode(e.to_string()))?;

        let sent_at = headers
            .remove(SENT_AT_HEADER)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Ok(Self {
            payload,
            headers,
            sent_at,
        })
    }

    /// Deserialize the payload into a business type. Unknown fields are ignored.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.payload).map_err(|e| BrokerError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CompetitionCreated {
        id: String,
        city: String,
        max_score: i64,
        radius_km: f64,
        tags: Vec<String>,
    }

    fn competition() -> CompetitionCreated {
        CompetitionCreated {
            id: "c-42".to_string(),
            city: "Zürich".to_string(),
            max_score: i64::MAX,
            radius_km: 2.75,
            tags: vec!["night".to_string(), "street".to_string()],
        }
    }

    #[test]
    fn test_wrap_and_decode_preserves_message() {
        let mut headers = BTreeMap::new();
        headers.insert("correlationId".to_string(), "abc".to_string());

        let envelope = Envelope::wrap(&competition(), headers).unwrap();
        let (body, wire_headers) = envelope.encode().unwrap();
        assert!(wire_headers.contains_key(SENT_AT_HEADER));

        let decoded = Envelope::decode(&body, wire_headers).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.payload_as::<CompetitionCreated>().unwrap(), competition());
        assert_eq!(decoded.headers.get("correlationId").unwrap(), "abc");
    }

    #[test]
    fn test_floats_survive_the_wire_exactly() {
        let mut checked = 0;
        while checked < 20_000 {
            let value = f64::from_bits(rand::random::<u64>());
            if !value.is_finite() {
                continue;
            }
            checked += 1;

            let envelope = Envelope::wrap(&value, BTreeMap::new()).unwrap();
            let (body, headers) = envelope.encode().unwrap();
            let decoded: f64 = Envelope::decode(&body, headers)
                .unwrap()
                .payload_as()
                .unwrap();

            assert_eq!(
                decoded.to_bits(),
                value.to_bits(),
                "{} came back as {}",
                value,
                decoded
            );
        }
    }

    #[test]
    fn test_caller_sent_at_is_replaced() {
        let mut headers = BTreeMap::new();
        headers.insert(SENT_AT_HEADER.to_string(), "yesterday".to_string());

        let envelope = Envelope::wrap(&serde_json::json!({"city": "Paris"}), headers).unwrap();
        assert!(envelope.headers.is_empty());
        assert!(envelope.sent_at.is_some());
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let err = Envelope::decode(b"{not json", BTreeMap::new()).unwrap_err();
        assert!(matches!(err, BrokerError::Decode(_)));
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        #[derive(Deserialize)]
        struct Narrow {
            city: String,
        }

        let body = br#"{"city":"Paris","introducedLater":{"nested":true}}"#;
        let envelope = Envelope::decode(body, BTreeMap::new()).unwrap();
        assert_eq!(envelope.payload_as::<Narrow>().unwrap().city, "Paris");
        assert!(envelope.sent_at.is_none());
    }
}
