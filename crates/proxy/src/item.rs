//! Cached-item model: the tagged record stored behind every cache key
//!
//! An item holds exactly one of an RPC result, an RPC error, or a raw HTTP
//! response. The wire form is compact JSON with single-letter field tags to
//! keep cache pressure low; the populated field implies the variant.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

use crate::jsonrpc::{RpcError, RpcResponse};

/// One cached outcome for a `method(params)` key.
#[derive(Debug, Clone)]
pub enum CachedItem {
    /// Raw JSON of a successful `result` field.
    Result(Box<RawValue>),
    /// A full RPC error record.
    Error(RpcError),
    /// A raw HTTP response, used when the upstream reply could not be
    /// interpreted as JSON-RPC but is still worth caching as an error
    /// outcome.
    Http(CachedHttpResponse),
}

/// The HTTP variant payload: enough of the upstream reply to replay it
/// verbatim to a later client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedHttpResponse {
    /// HTTP status code.
    #[serde(rename = "c")]
    pub code: u16,
    /// `Content-Type` header value.
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// `Content-Encoding` header value.
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    /// Response body, base64 on the wire since it may be compressed binary.
    #[serde(rename = "b", default, with = "body_base64", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(de)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Wire shape: three optional fields, at most one populated. A record with
/// none of them present deserializes to no item at all, which readers treat
/// as a cache miss.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ItemWire {
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    result: Option<Box<RawValue>>,
    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    http: Option<CachedHttpResponse>,
}

impl CachedItem {
    /// Serializes the item for storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        let wire = match self {
            Self::Result(r) => ItemWire { result: Some(r.clone()), ..Default::default() },
            Self::Error(e) => ItemWire { error: Some(e.clone()), ..Default::default() },
            Self::Http(h) => ItemWire { http: Some(h.clone()), ..Default::default() },
        };
        serde_json::to_vec(&wire).unwrap_or_default()
    }

    /// Decodes stored bytes back into an item.
    ///
    /// Returns `None` for undecodable bytes and for empty records; the error
    /// field wins if a record ever carries more than one.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let wire: ItemWire = serde_json::from_slice(bytes).ok()?;
        if let Some(e) = wire.error {
            Some(Self::Error(e))
        } else if let Some(r) = wire.result {
            Some(Self::Result(r))
        } else {
            wire.http.map(Self::Http)
        }
    }

    /// True for the raw-HTTP variant.
    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http(_))
    }

    /// Builds the RPC response replaying this item for the given request id.
    ///
    /// Must not be called on the HTTP variant, which has no per-request RPC
    /// representation; callers branch on [`CachedItem::is_http`] first.
    pub fn to_rpc_response(&self, id: Option<Value>) -> RpcResponse {
        match self {
            Self::Error(e) => RpcResponse::from_error(e.clone(), id),
            Self::Result(r) => RpcResponse::from_result(r.clone(), id),
            Self::Http(h) => RpcResponse::from_error(
                RpcError::internal_error().with_data(&format!("cached HTTP {}", h.code)),
                id,
            ),
        }
    }
}
