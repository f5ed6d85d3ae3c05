//! Control-plane RPC carried over control streams.
//!
//! A message is a 4-byte big-endian length followed by that many bytes of
//! JSON. One request and one response travel over each control stream.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;
use crate::frame::ClientInit;

const LEN_PREFIX: usize = 4;

/// Functions the forwarder exposes on its control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "function", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCall {
    RegisterPort(PortParams),
    DeregisterPort(PortParams),
    RegisterServer(String),
    DeregisterServer(String),
    ClientInit(ClientInit),
    ExternalAddr,
}

impl RpcCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterPort(_) => "REGISTER_PORT",
            Self::DeregisterPort(_) => "DEREGISTER_PORT",
            Self::RegisterServer(_) => "REGISTER_SERVER",
            Self::DeregisterServer(_) => "DEREGISTER_SERVER",
            Self::ClientInit(_) => "CLIENT_INIT",
            Self::ExternalAddr => "EXTERNAL_ADDR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortParams {
    pub server: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub call: RpcCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub status: bool,
    #[serde(default)]
    pub result: Value,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            status: true,
            result,
        }
    }

    pub fn failed(id: u64) -> Self {
        Self {
            id,
            status: false,
            result: Value::Null,
        }
    }
}

/// Result payload of `EXTERNAL_ADDR`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAddr {
    pub ip: String,
    pub port: u16,
}

impl From<SocketAddr> for ExternalAddr {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Length-prefix and serialize a message.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, RpcError> {
    let body = serde_json::to_vec(msg)?;
    let mut out = Vec::with_capacity(LEN_PREFIX + body.len());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one length-prefixed message. Trailing bytes are ignored.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, RpcError> {
    if data.len() < LEN_PREFIX {
        return Err(RpcError::Truncated {
            expected: LEN_PREFIX,
            actual: data.len(),
        });
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let body = &data[LEN_PREFIX..];
    if body.len() < len {
        return Err(RpcError::Truncated {
            expected: len,
            actual: body.len(),
        });
    }
    Ok(serde_json::from_slice(&body[..len])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_wire_shape() {
        let req = RpcRequest {
            id: 3,
            call: RpcCall::RegisterPort(PortParams {
                server: "srv-A".into(),
                port: 80,
            }),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({"id": 3, "call": {"function": "REGISTER_PORT", "params": {"server": "srv-A", "port": 80}}})
        );
    }

    #[test]
    fn test_unit_call_has_no_params() {
        let bytes = encode(&RpcRequest {
            id: 1,
            call: RpcCall::ExternalAddr,
        })
        .unwrap();
        let req: RpcRequest = decode(&bytes).unwrap();
        assert_eq!(req.call, RpcCall::ExternalAddr);
        let raw: Value = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(raw["call"], json!({"function": "EXTERNAL_ADDR"}));
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = encode(&RpcResponse::ok(9, json!("CONFIRMED"))).unwrap();
        let err = decode::<RpcResponse>(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, RpcError::Truncated { .. }));
        let err = decode::<RpcResponse>(&bytes[..2]).unwrap_err();
        assert!(matches!(err, RpcError::Truncated { expected: 4, .. }));
    }

    #[test]
    fn test_unknown_function_rejected() {
        let body = br#"{"id":1,"call":{"function":"REBOOT"}}"#;
        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(body);
        assert!(matches!(
            decode::<RpcRequest>(&bytes),
            Err(RpcError::Json(_))
        ));
    }

    #[test]
    fn test_response_result_defaults_to_null() {
        let body = br#"{"id":4,"status":false}"#;
        let mut bytes = (body.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(body);
        let resp: RpcResponse = decode(&bytes).unwrap();
        assert_eq!(resp, RpcResponse::failed(4));
    }
}
