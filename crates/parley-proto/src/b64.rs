//! Serde helpers for binary fields carried as standard base64 strings.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Record {
//!     #[serde(with = "parley_proto::b64")]
//!     signature: Vec<u8>,
//!     #[serde(with = "parley_proto::b64::array")]
//!     iv: [u8; 12],
//! }
//! ```

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serializer, de::Error};

/// Encode bytes as standard (padded) base64.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard (padded) base64.
pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

/// Serialize a byte buffer as a base64 string
pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&encode(bytes))
}

/// Deserialize a byte buffer from a base64 string
pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    decode(&text).map_err(D::Error::custom)
}

/// Fixed-size arrays as base64. Length is checked on decode.
pub mod array {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    /// Serialize a fixed-size array as a base64 string
    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::encode(bytes))
    }

    /// Deserialize a fixed-size array from a base64 string
    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let bytes = super::decode(&text).map_err(D::Error::custom)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| D::Error::custom(format!("expected {N} bytes, got {len}")))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Container {
        #[serde(with = "crate::b64")]
        data: Vec<u8>,
        #[serde(with = "crate::b64::array")]
        iv: [u8; 4],
    }

    #[test]
    fn fields_encode_as_base64_strings() {
        let value = Container { data: b"hello".to_vec(), iv: [1, 2, 3, 4] };
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"data":"aGVsbG8=","iv":"AQIDBA=="}"#);
    }

    #[test]
    fn array_length_is_checked() {
        let result: Result<Container, _> = serde_json::from_str(r#"{"data":"","iv":"AQID"}"#);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("expected 4 bytes, got 3"), "{err}");
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let result: Result<Container, _> = serde_json::from_str(r#"{"data":"@@@","iv":"AQIDBA=="}"#);
        assert!(result.is_err());
    }
}
