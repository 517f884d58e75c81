use std::time::Duration;

use crate::directory::types::{RelayListResponse, RelayRecord};
use crate::directory::RelayNodeInfo;
use crate::VeilError;

/// Where relay lists come from.
///
/// In production: [`HttpDirectorySource`].
/// In tests: a fixture returning canned JSON.
#[async_trait::async_trait]
pub trait DirectorySource: Send + Sync {
    /// Fetch the raw JSON body published at `endpoint`.
    async fn fetch(&self, endpoint: &str) -> Result<String, VeilError>;
}

/// HTTP GET against a directory endpoint.
#[derive(Debug, Clone)]
pub struct HttpDirectorySource {
    client: reqwest::Client,
}

impl HttpDirectorySource {
    pub fn new(timeout: Duration) -> Result<Self, VeilError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl DirectorySource for HttpDirectorySource {
    async fn fetch(&self, endpoint: &str) -> Result<String, VeilError> {
        let response = self
            .client
            .get(endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(VeilError::Directory(format!("{endpoint} returned {status}")));
        }
        Ok(response.text().await?)
    }
}

/// Parse a `{ "relays": [...] }` body.
///
/// A body that is not such an object is an error. Individual records that
/// fail validation are skipped.
pub fn parse_relay_list(body: &str) -> Result<Vec<RelayNodeInfo>, VeilError> {
    let response: RelayListResponse = serde_json::from_str(body)?;

    let mut relays = Vec::with_capacity(response.relays.len());
    for value in response.relays {
        let parsed = serde_json::from_value::<RelayRecord>(value)
            .map_err(|e| VeilError::InvalidRelayRecord(e.to_string()))
            .and_then(RelayNodeInfo::try_from);
        match parsed {
            Ok(relay) => relays.push(relay),
            Err(e) => tracing::debug!("skipping relay record: {e}"),
        }
    }
    Ok(relays)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RelayId;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn record_json(seed: u8) -> serde_json::Value {
        let key = vec![seed; 32];
        serde_json::json!({
            "id": RelayId::from_public_key(&key).to_string(),
            "publicKey": BASE64.encode(&key),
            "endpoint": format!("wss://relay-{seed}.test"),
            "roles": ["middle"],
            "region": "eu-west",
            "trustScore": 0.7,
            "bandwidth": 1_000_000,
            "latency": 80,
            "online": true,
            "lastSeen": 123,
            "version": "1.2.0"
        })
    }

    #[test]
    fn parses_well_formed_list() {
        let body = serde_json::json!({ "relays": [record_json(1), record_json(2)] }).to_string();
        let relays = parse_relay_list(&body).unwrap();
        assert_eq!(relays.len(), 2);
        assert_eq!(relays[0].version, "1.2.0");
    }

    #[test]
    fn skips_bad_records_individually() {
        let mut missing_field = record_json(3);
        missing_field.as_object_mut().unwrap().remove("endpoint");
        let mut bad_role = record_json(4);
        bad_role["roles"] = serde_json::json!(["gateway"]);

        let body = serde_json::json!({
            "relays": [record_json(1), missing_field, bad_role, "garbage"]
        })
        .to_string();

        let relays = parse_relay_list(&body).unwrap();
        assert_eq!(relays.len(), 1);
    }

    #[test]
    fn malformed_body_is_error() {
        assert!(parse_relay_list("<html>").is_err());
        assert!(parse_relay_list(r#"{"nodes": []}"#).is_err());
    }
}
