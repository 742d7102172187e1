//! Payload codec: encodes `{jobName, payload}` to opaque bytes and back.
//!
//! Drivers never interpret the payload; they store whatever the codec
//! produces and hand it back unchanged at reserve time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A codec contract pluggable per queue. The default is [`JsonCodec`].
pub trait PayloadCodec: Send + Sync + 'static {
    /// Encode a job name and a serializable payload into opaque bytes.
    fn encode(&self, name: &str, payload: &serde_json::Value) -> Result<Vec<u8>>;

    /// Decode previously-encoded bytes back into name and payload.
    fn decode(&self, bytes: &[u8]) -> Result<(String, serde_json::Value)>;
}

/// Wire shape for the default codec: `{"name": <string>, "payload": <json>}`.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    name: String,
    payload: serde_json::Value,
}

/// Default codec: a UTF-8 JSON object `{"name": ..., "payload": ...}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, name: &str, payload: &serde_json::Value) -> Result<Vec<u8>> {
        let envelope = Envelope {
            name: name.to_string(),
            payload: payload.clone(),
        };
        serde_json::to_vec(&envelope).context("encoding job envelope as JSON")
    }

    fn decode(&self, bytes: &[u8]) -> Result<(String, serde_json::Value)> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).context("decoding job envelope from JSON")?;
        Ok((envelope.name, envelope.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_name_and_payload() {
        let codec = JsonCodec;
        let payload = serde_json::json!({"m": "hi"});
        let bytes = codec.encode("greet", &payload).unwrap();
        let (name, decoded) = codec.decode(&bytes).unwrap();
        assert_eq!(name, "greet");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn rejects_garbage_bytes() {
        let codec = JsonCodec;
        assert!(codec.decode(b"not json").is_err());
    }
}
