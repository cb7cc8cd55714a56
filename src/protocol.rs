//! JSON-RPC wire types.
//!
//! The daemon speaks bitcoind-style JSON-RPC over HTTP POST:
//!
//! ```text
//! --> {"jsonrpc":"1.0","id":7,"method":"getblockhash","params":[1000]}
//! <-- {"result":"00000000a1...","error":null,"id":7}
//! ```
//!
//! Responses to void methods carry `"result": null` with `"error": null`,
//! so a null result is only an error when the `error` member is set.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Protocol version string sent with every request.
pub const JSONRPC_VERSION: &str = "1.0";

/// Request parameters.
///
/// The wire format carries either a positional array or a single
/// named-parameters object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Params {
    /// An empty positional list.
    pub fn none() -> Self {
        Params::Positional(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::Positional(v) => v.is_empty(),
            Params::Named(m) => m.is_empty(),
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::none()
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::none()
    }
}

impl From<Vec<Value>> for Params {
    fn from(v: Vec<Value>) -> Self {
        Params::Positional(v)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(m: Map<String, Value>) -> Self {
        Params::Named(m)
    }
}

impl From<Value> for Params {
    fn from(v: Value) -> Self {
        match v {
            Value::Array(items) => Params::Positional(items),
            Value::Object(map) => Params::Named(map),
            other => Params::Positional(vec![other]),
        }
    }
}

/// A single JSON-RPC request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Params,
}

impl RpcRequest {
    /// Build a request. The method name is kept exactly as given.
    pub fn new(method: impl Into<String>, params: Params, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

/// Structured error object returned by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A single JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
    #[serde(default)]
    pub id: Value,
}

impl RpcResponse {
    /// The numeric response id, if the daemon echoed one.
    pub fn id_u64(&self) -> Option<u64> {
        self.id.as_u64()
    }

    /// Check correlation with `expected_id` and extract the result.
    ///
    /// # Errors
    ///
    /// - `Error::Rpc` when the daemon set the error member
    /// - `Error::Protocol` when both members are set, or the id does not
    ///   match the request
    pub fn into_result(self, expected_id: u64) -> Result<Value> {
        match self.error {
            Some(err) if !self.result.is_null() => Err(Error::Protocol(format!(
                "Response {} carries both result and error ({})",
                expected_id, err.message
            ))),
            Some(err) => {
                // Daemons answer some parse failures with a null id.
                if !self.id.is_null() && self.id.as_u64() != Some(expected_id) {
                    return Err(id_mismatch(expected_id, &self.id));
                }
                Err(err.into())
            }
            None => {
                if self.id.as_u64() != Some(expected_id) {
                    return Err(id_mismatch(expected_id, &self.id));
                }
                Ok(self.result)
            }
        }
    }
}

fn id_mismatch(expected: u64, got: &Value) -> Error {
    Error::Protocol(format!(
        "Response id {} does not match request id {}",
        got, expected
    ))
}
