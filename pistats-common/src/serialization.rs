use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Encode a value as a compact JSON text frame.
pub fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Error::from)
}

/// Decode a JSON text frame.
pub fn decode<T: DeserializeOwned>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::TelemetrySnapshot;

    #[test]
    fn test_error_snapshot_roundtrip() {
        let snapshot = TelemetrySnapshot::error("collection timed out");

        let encoded = encode(&snapshot).unwrap();
        let decoded: TelemetrySnapshot = decode(&encoded).unwrap();

        assert_eq!(snapshot, decoded);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<TelemetrySnapshot> = decode("not json");
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_decode_rejects_unknown_shape() {
        let result: Result<TelemetrySnapshot> = decode(r#"{"hello": "world"}"#);
        assert!(result.is_err());
    }
}
