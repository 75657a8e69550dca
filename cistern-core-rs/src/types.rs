//! Wire frames for device RPC
//!
//! Requests and responses are JSON objects. A request names the method and
//! carries `src`, the topic prefix the device replies to (`<src>/rpc`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation identifier linking a request to its reply
pub type RequestId = u64;

/// Suffix appended to a destination to form its RPC topic
pub const RPC_SUFFIX: &str = "rpc";

/// Topic a request for `destination` is published on
pub fn rpc_topic(destination: &str) -> String {
    format!("{}/{}", destination, RPC_SUFFIX)
}

/// Outbound RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
    pub src: String,
}

impl RequestFrame {
    /// Build a request, substituting `{}` for empty params
    pub fn new(id: RequestId, method: impl Into<String>, params: Value, src: impl Into<String>) -> Self {
        let params = if params.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            params
        };

        Self {
            id,
            method: method.into(),
            params,
            src: src.into(),
        }
    }

    /// Serialize request to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize request from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Application error reported by a device inside a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Inbound RPC response
///
/// `T` is the shape of `result`. The correlator only needs `id`, so it
/// parses with [`serde::de::IgnoredAny`] and leaves the result to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame<T = Value> {
    pub id: RequestId,
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

impl<T> ResponseFrame<T> {
    /// Successful response
    pub fn success(id: RequestId, src: impl Into<String>, dst: Option<String>, result: T) -> Self {
        Self {
            id,
            src: src.into(),
            dst,
            error: None,
            result: Some(result),
        }
    }

    /// Response carrying a device-side error
    pub fn failure(id: RequestId, src: impl Into<String>, dst: Option<String>, error: ErrorBody) -> Self {
        Self {
            id,
            src: src.into(),
            dst,
            error: Some(error),
            result: None,
        }
    }

    /// Translate the embedded device error into a `Result`
    ///
    /// A response with neither `error` nor `result` yields `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, ErrorBody> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}

impl<T: Serialize> ResponseFrame<T> {
    /// Serialize response to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
