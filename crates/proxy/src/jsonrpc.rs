//! JSON-RPC 2.0 request/response model, batch parsing and cache-key derivation
//!
//! Reference: <https://www.jsonrpc.org/specification>

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;

/// The only protocol version accepted by the proxy.
pub const JSONRPC_VERSION: &str = "2.0";

/// Length of the minimum well-formed request, `{"jsonrpc":"2.0","method":"1","id":1}`.
pub const MIN_REQUEST_LEN: usize = 37;

/// Deserializes a JSON value while keeping `null` distinguishable from an
/// absent field. Used for `id`, where `"id": null` is a present, valid id
/// and a missing `id` marks a notification.
fn de_opt_value<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(de).map(Some)
}

/// A single JSON-RPC request as received from a client.
///
/// Structurally malformed batch elements deserialize into the default value,
/// which fails [`RpcRequest::validate`] without aborting the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version; must be exactly `"2.0"` to validate.
    #[serde(default)]
    pub jsonrpc: String,
    /// Request id. `None` means the field was absent (a notification).
    #[serde(
        default,
        deserialize_with = "de_opt_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Value>,
    /// Method name; must be non-empty to validate.
    #[serde(default)]
    pub method: String,
    /// Call parameters; `null` and an absent field are equivalent here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Creates a request, mainly for tests and health probes.
    pub fn new(id: i64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(Value::from(id)),
            method: method.to_string(),
            params: Some(params),
        }
    }

    /// A request is valid iff the version matches, the method is non-empty
    /// and the id, when present, is a string, a number or `null`.
    pub fn validate(&self) -> bool {
        let id_ok = match &self.id {
            None => true,
            Some(Value::String(_)) | Some(Value::Number(_)) | Some(Value::Null) => true,
            Some(_) => false,
        };
        id_ok && self.jsonrpc == JSONRPC_VERSION && !self.method.is_empty()
    }

    /// A notification carries no id and must never elicit a response body.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Derives the cache key, `method(<canonical-params>)`.
    ///
    /// Two requests with structurally equal method and params map to the
    /// same key regardless of object key order, whitespace or number
    /// spelling (`1.23e1` vs `12.3`).
    pub fn cache_key(&self) -> String {
        let params = self.params.as_ref().unwrap_or(&Value::Null);
        format!("{}({})", self.method, canonical_params(params))
    }
}

/// A JSON-RPC response, ours or an upstream's.
///
/// A well-formed response carries exactly one of `result`/`error`; both
/// absent indicates a malformed upstream reply and is never cached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version.
    #[serde(default)]
    pub jsonrpc: String,
    /// Mirrors the request id. `None` skips the field entirely.
    #[serde(
        default,
        deserialize_with = "de_opt_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<Value>,
    /// Error outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Success outcome, kept as raw JSON so upstream bytes pass through
    /// untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
}

impl RpcResponse {
    /// Builds an error response mirroring the given id; an unknown id is
    /// reported as an explicit `"id": null`.
    pub fn from_error(error: RpcError, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.unwrap_or(Value::Null)),
            error: Some(error),
            result: None,
        }
    }

    /// Builds a success response from raw result JSON.
    pub fn from_result(result: Box<RawValue>, id: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: None,
            result: Some(result),
        }
    }

    /// True when the response carries a result and no error.
    pub fn success(&self) -> bool {
        self.result.is_some() && self.error.is_none()
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("RpcError({code} {message})")]
pub struct RpcError {
    #[serde(skip)]
    name: &'static str,
    /// Error code; the -32700..-32600 range is reserved by the spec.
    pub code: i64,
    /// Short error description.
    pub message: String,
    /// Optional structured detail, kept as raw JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl RpcError {
    fn predefined(name: &'static str, code: i64, message: &str) -> Self {
        Self { name, code, message: message.to_string(), data: None }
    }

    /// -32700, invalid JSON was received.
    pub fn parse_error() -> Self {
        Self::predefined("ParseError", -32700, "Parse error")
    }

    /// -32600, the request object is not a valid JSON-RPC 2.0 request.
    pub fn invalid_request() -> Self {
        Self::predefined("InvalidRequest", -32600, "Invalid Request")
    }

    /// -32601, the method does not exist.
    pub fn method_not_found() -> Self {
        Self::predefined("MethodNotFound", -32601, "Method not found")
    }

    /// -32602, invalid method parameters.
    pub fn invalid_params() -> Self {
        Self::predefined("InvalidParams", -32602, "Invalid params")
    }

    /// -32603, internal JSON-RPC error.
    pub fn internal_error() -> Self {
        Self::predefined("InternalError", -32603, "Internal error")
    }

    /// Attaches serialized detail to the error. Serialization failures drop
    /// the data rather than the response.
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        self.data = serde_json::value::to_raw_value(data).ok();
        self
    }

    /// The symbolic name for predefined errors, or the code for upstream
    /// errors that arrived over the wire.
    pub fn name(&self) -> String {
        if self.name.is_empty() {
            self.code.to_string()
        } else {
            self.name.to_string()
        }
    }

    /// Whether this error shares the code of [`RpcError::invalid_request`].
    pub fn is_invalid_request(&self) -> bool {
        self.code == -32600
    }
}

/// Maps an optional RPC error to the HTTP status of the response carrying it.
///
/// Follows <https://www.jsonrpc.org/historical/json-rpc-over-http.html#errors>.
pub fn status_code_of(error: Option<&RpcError>) -> u16 {
    let Some(e) = error else { return 200 };
    match e.code {
        -32700 => 500,
        -32600 => 400,
        -32601 => 404,
        -32602 => 500,
        -32603 => 500,
        c if -32099 < c && c < -32000 => 500,
        _ => 200,
    }
}

/// Parses a request body into a list of requests plus the envelope shape.
///
/// Returns `(requests, is_singleton)`. A leading `{` marks a singleton, which
/// is wrapped in a one-element list; anything else is parsed as a batch
/// array. An empty array parses successfully; the caller distinguishes that
/// case (InvalidRequest) from undecodable input (ParseError).
pub fn parse_requests(body: &[u8]) -> Result<(Vec<RpcRequest>, bool), RpcError> {
    let body = body.trim_ascii();
    if body.is_empty() {
        return Err(RpcError::parse_error());
    }
    if body[0] == b'{' {
        let req: RpcRequest =
            serde_json::from_slice(body).map_err(|_| RpcError::parse_error())?;
        Ok((vec![req], true))
    } else {
        let elements: Vec<Value> =
            serde_json::from_slice(body).map_err(|_| RpcError::parse_error())?;
        let reqs = elements
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .collect();
        Ok((reqs, false))
    }
}

/// Serializes params into the canonical form used for cache keys.
///
/// Object keys are emitted in lexicographic order at every depth, strings use
/// HTML-safe escaping (`<`, `>`, `&` become `<`, `>`, `&`) and
/// numbers keep serde_json's minimal rendering. The output of this function
/// is a stability contract; see the property tests below.
pub fn canonical_params(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, value);
    out
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_canonical_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_string(out, key);
                out.push(':');
                write_canonical(out, &map[key]);
            }
            out.push('}');
        }
    }
}

fn write_canonical_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_batch_with_invalid_element() {
        let data = br#"[{"jsonrpc": "2.0", "method": "z", "id": 1},{}]"#;
        let (reqs, singleton) = parse_requests(data).unwrap();
        assert!(!singleton);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].id, Some(Value::from(1)));
        assert_eq!(reqs[1].id, None);
        assert!(reqs[0].validate());
        assert!(!reqs[1].validate());
    }

    #[test]
    fn test_parse_singleton() {
        let data = br#"  {"jsonrpc":"2.0","method":"m","params":[1],"id":1}  "#;
        let (reqs, singleton) = parse_requests(data).unwrap();
        assert!(singleton);
        assert_eq!(reqs.len(), 1);
        assert!(reqs[0].validate());
        assert_eq!(reqs[0].method, "m");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_requests(b"not json").is_err());
        assert!(parse_requests(b"").is_err());
        assert!(parse_requests(b"   ").is_err());
        assert!(parse_requests(b"{\"method\": ").is_err());
        assert!(parse_requests(b"42").is_err());
    }

    #[test]
    fn test_parse_empty_batch_is_not_a_parse_error() {
        let (reqs, singleton) = parse_requests(b"[]").unwrap();
        assert!(!singleton);
        assert!(reqs.is_empty());
    }

    #[test]
    fn test_parse_batch_with_non_object_element() {
        let (reqs, _) = parse_requests(br#"[{"jsonrpc":"2.0","method":"m","id":1}, 5]"#).unwrap();
        assert_eq!(reqs.len(), 2);
        assert!(reqs[0].validate());
        assert!(!reqs[1].validate());
    }

    #[test]
    fn test_validate() {
        let mut req = RpcRequest::new(1, "m", Value::Null);
        assert!(req.validate());

        req.id = Some(Value::Null);
        assert!(req.validate());
        req.id = Some(Value::String("abc".into()));
        assert!(req.validate());
        req.id = None;
        assert!(req.validate());
        assert!(req.is_notification());
        req.id = Some(Value::Array(vec![]));
        assert!(!req.validate());

        let mut req = RpcRequest::new(1, "m", Value::Null);
        req.jsonrpc = "1.0".into();
        assert!(!req.validate());

        let mut req = RpcRequest::new(1, "m", Value::Null);
        req.method.clear();
        assert!(!req.validate());
    }

    #[test]
    fn test_cache_key_sorts_object_keys() {
        let a: RpcRequest = serde_json::from_str(
            r#"{"jsonrpc": "2.0", "id": 1, "method": "m", "params": { "foo": 1.23e1, "bar": { "baz": true, "abc": 12 }}}"#,
        )
        .unwrap();
        let b: RpcRequest = serde_json::from_str(
            r#"{"jsonrpc": "2.0", "id": 2, "method": "m", "params": {"bar":{"abc":12,"baz":true},"foo":12.3}}"#,
        )
        .unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_eq!(a.cache_key(), r#"m({"bar":{"abc":12,"baz":true},"foo":12.3})"#);
    }

    #[test]
    fn test_cache_key_without_params() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"z","id":1}"#).unwrap();
        assert_eq!(req.cache_key(), "z(null)");
        // explicit null params take the same key
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"z","params":null,"id":1}"#)
                .unwrap();
        assert_eq!(req.cache_key(), "z(null)");
    }

    #[test]
    fn test_canonical_number_forms() {
        // float spellings collapse; integer and float stay distinct
        let f1: Value = serde_json::from_str(r#"[1.23e1]"#).unwrap();
        let f2: Value = serde_json::from_str(r#"[12.3]"#).unwrap();
        assert_eq!(canonical_params(&f1), canonical_params(&f2));

        let int: Value = serde_json::from_str("[12]").unwrap();
        let float: Value = serde_json::from_str("[12.0]").unwrap();
        assert_ne!(canonical_params(&int), canonical_params(&float));
        assert_eq!(canonical_params(&int), "[12]");
        assert_eq!(canonical_params(&float), "[12.0]");
    }

    #[test]
    fn test_canonical_html_escaping() {
        let v = Value::String("<b>&amp;</b>".into());
        assert_eq!(
            canonical_params(&v),
            r#""\u003cb\u003e\u0026amp;\u003c/b\u003e""#
        );
        let v = Value::String("line\nbreak\"quote\"".into());
        assert_eq!(canonical_params(&v), r#""line\nbreak\"quote\"""#);
    }

    #[test]
    fn test_response_success() {
        let ok = RpcResponse::from_result(
            serde_json::value::to_raw_value(&1).unwrap(),
            Some(Value::from(1)),
        );
        assert!(ok.success());
        let err = RpcResponse::from_error(RpcError::parse_error(), None);
        assert!(!err.success());
    }

    #[test]
    fn test_error_response_explicit_null_id() {
        let resp = RpcResponse::from_error(RpcError::invalid_request(), None);
        let body = serde_json::to_value(&resp).unwrap();
        assert_eq!(body["id"], Value::Null);
        assert_eq!(body["error"]["code"], -32600);
        assert_eq!(body["jsonrpc"], "2.0");
        assert!(body.get("result").is_none());
    }

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(status_code_of(None), 200);
        assert_eq!(status_code_of(Some(&RpcError::parse_error())), 500);
        assert_eq!(status_code_of(Some(&RpcError::invalid_request())), 400);
        assert_eq!(status_code_of(Some(&RpcError::method_not_found())), 404);
        assert_eq!(status_code_of(Some(&RpcError::invalid_params())), 500);
        assert_eq!(status_code_of(Some(&RpcError::internal_error())), 500);
        let reserved = RpcError { name: "", code: -32050, message: "server error".into(), data: None };
        assert_eq!(status_code_of(Some(&reserved)), 500);
        let app = RpcError { name: "", code: 1234, message: "app error".into(), data: None };
        assert_eq!(status_code_of(Some(&app)), 200);
    }

    #[test]
    fn test_error_with_data() {
        let e = RpcError::internal_error().with_data(&"connection refused");
        let body = serde_json::to_value(&e).unwrap();
        assert_eq!(body["data"], "connection refused");
        assert_eq!(e.name(), "InternalError");
    }

    // Re-serializes a value with object keys in reverse order, so the parser
    // sees a genuinely different key order for the same structure.
    fn write_reversed(out: &mut String, value: &Value) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort_unstable();
                keys.reverse();
                out.push('{');
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap());
                    out.push(':');
                    write_reversed(out, &map[key]);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_reversed(out, item);
                }
                out.push(']');
            }
            v => out.push_str(&serde_json::to_string(v).unwrap()),
        }
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| Value::Number(n.into())),
            "[a-zA-Z0-9<>& \"\\\\]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonical_params_is_key_order_invariant(params in arb_json()) {
            let sorted_text = serde_json::to_string(&params).unwrap();
            let mut reversed_text = String::new();
            write_reversed(&mut reversed_text, &params);

            let a: Value = serde_json::from_str(&sorted_text).unwrap();
            let b: Value = serde_json::from_str(&reversed_text).unwrap();
            prop_assert_eq!(canonical_params(&a), canonical_params(&b));
        }

        #[test]
        fn canonical_params_round_trips(params in arb_json()) {
            // the canonical form is itself valid JSON describing the same value
            let canonical = canonical_params(&params);
            let reparsed: Value = serde_json::from_str(&canonical).unwrap();
            prop_assert_eq!(canonical_params(&reparsed), canonical);
        }
    }
}
