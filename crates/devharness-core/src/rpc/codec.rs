//! Wire encoding for RPC payloads.
//!
//! The harness treats payloads as opaque bytes produced and consumed by
//! this pair of functions; everything else goes through them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub fn marshal<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn unmarshal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// A single optional string; the answer type of the local pseudo-calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl StringValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }

    /// The value, or `""` when unset.
    pub fn as_str(&self) -> &str {
        self.value.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;

    #[test]
    fn string_value_wire_shape() {
        assert_eq!(marshal(&StringValue::new("ns1")).unwrap(), br#"{"value":"ns1"}"#);
        assert_eq!(marshal(&StringValue::default()).unwrap(), b"{}");
        let decoded: StringValue = unmarshal(b"{}").unwrap();
        assert_eq!(decoded.as_str(), "");
    }

    #[test]
    fn unmarshal_failure_is_a_codec_error() {
        let err = unmarshal::<StringValue>(b"not json").unwrap_err();
        assert!(matches!(err, HarnessError::RpcCodec(_)), "got {err:?}");
    }
}
