//! On-disk encodings for credential records.

use thiserror::Error;

use crate::token::Credential;

/// Error raised by a [`RecordCodec`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CodecError(String);

/// Strategy for encoding credential records.
///
/// One codec is active per store; records are never mixed.
pub trait RecordCodec: Send + Sync {
    /// File extension for records written with this codec.
    fn extension(&self) -> &'static str;

    fn encode(&self, credential: &Credential) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Credential, CodecError>;
}

/// Human-readable pretty-printed JSON records.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl RecordCodec for JsonCodec {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn encode(&self, credential: &Credential) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec_pretty(credential).map_err(|e| CodecError(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Credential, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError(e.to_string()))
    }
}

/// Compact binary records via `bincode`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl RecordCodec for BincodeCodec {
    fn extension(&self) -> &'static str {
        "bin"
    }

    fn encode(&self, credential: &Credential) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(credential).map_err(|e| CodecError(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Credential, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DomainName, ScopeSet};
    use chrono::{TimeZone, Utc};

    fn sample() -> Credential {
        Credential::service_account(
            DomainName::parse("example.com").unwrap(),
            "ya29.token",
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            ScopeSet::parse(["scope.b", "scope.a"]).unwrap(),
            "robot@project.iam.gserviceaccount.com",
            Some("admin@example.com".to_string()),
        )
    }

    #[test]
    fn test_json_is_human_readable() {
        let bytes = JsonCodec.encode(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"domain\": \"example.com\""));
        assert!(text.contains("\"kind\": \"service_account\""));
    }

    #[test]
    fn test_bincode_decodes_what_it_encodes() {
        let original = sample();
        let bytes = BincodeCodec.encode(&original).unwrap();
        assert_eq!(BincodeCodec.decode(&bytes).unwrap(), original);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(JsonCodec.decode(b"{not json").is_err());
        assert!(BincodeCodec.decode(&[0xff, 0x01]).is_err());
    }
}
