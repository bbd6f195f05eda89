// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Envelope
//!
//! Every message on the application exchange is a JSON object
//! `{"ownerId": "...", "data": "<base64>"}`. The backbone never looks inside
//! `data`; it only carries the bytes from publisher to handler unchanged.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Transport wrapper around an application-defined payload.
///
/// `owner_id` is advisory metadata used for tracing and logging; routing is
/// driven by the routing key alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "ownerId")]
    pub owner_id: String,
    #[serde(with = "data_serde")]
    pub data: Vec<u8>,
}

impl Envelope {
    pub fn new(owner_id: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Envelope {
            owner_id: owner_id.into(),
            data: data.into(),
        }
    }

    /// Builds an envelope whose data is the JSON encoding of `event`.
    pub fn from_event<T: Serialize>(
        owner_id: impl Into<String>,
        event: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Envelope::new(owner_id, serde_json::to_vec(event)?))
    }

    /// Decodes the data as a JSON-encoded event.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }

    /// Wire encoding used as the AMQP message body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

mod data_serde {
    use super::*;
    use serde::{Deserializer, Serializer};
    use serde_json::value::RawValue;

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(data).serialize(serializer)
    }

    /// Accepts the canonical base64 string, or a raw JSON value whose exact
    /// bytes become the data.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Box<RawValue> = Deserialize::deserialize(deserializer)?;
        let text = raw.get();

        if text.starts_with('"') {
            let encoded: String = serde_json::from_str(text).map_err(serde::de::Error::custom)?;
            return STANDARD.decode(encoded).map_err(serde::de::Error::custom);
        }

        if text == "null" {
            return Ok(vec![]);
        }

        Ok(text.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
        amount: f64,
    }

    #[test]
    fn encodes_data_as_base64() {
        let envelope = Envelope::new("user-1", br#"{"x":1}"#.to_vec());

        let value: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(value, json!({"ownerId": "user-1", "data": "eyJ4IjoxfQ=="}));
    }

    #[test]
    fn wire_bytes_decode_to_identical_envelope() {
        let envelope = Envelope::new("user-1", br#"{"x":1}"#.to_vec());

        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.owner_id, "user-1");
        assert_eq!(decoded.data, br#"{"x":1}"#);
    }

    #[test]
    fn accepts_raw_json_data() {
        let body = br#"{"ownerId":"user-2","data":{"x":1}}"#;

        let envelope = Envelope::from_bytes(body).unwrap();

        assert_eq!(envelope.owner_id, "user-2");
        assert_eq!(envelope.data, br#"{"x":1}"#);
    }

    #[test]
    fn null_data_is_empty() {
        let envelope = Envelope::from_bytes(br#"{"ownerId":"u","data":null}"#).unwrap();
        assert!(envelope.data.is_empty());
    }

    #[test]
    fn typed_events() {
        let event = OrderCreated {
            order_id: "o-1".to_owned(),
            amount: 42.5,
        };

        let envelope = Envelope::from_event("customer-9", &event).unwrap();

        assert_eq!(envelope.decode::<OrderCreated>().unwrap(), event);
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(Envelope::from_bytes(br#"{"ownerId":"u","data":"!!not base64"}"#).is_err());
    }
}
