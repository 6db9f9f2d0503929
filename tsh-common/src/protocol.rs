//! JSON-RPC 2.0 wire contract for the protocol probe.
//!
//! The probe sends exactly one request shape (`tools/list` with empty
//! params) and validates the response envelope field by field, so the
//! response side is inspected as raw [`serde_json::Value`] rather than
//! deserialized into a rigid struct.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Protocol version sent and required in responses.
pub const JSONRPC_VERSION: &str = "2.0";

/// The single method the probe issues.
pub const TOOLS_LIST_METHOD: &str = "tools/list";

/// Outbound `tools/list` request envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ToolsListRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: &'static str,
    pub params: serde_json::Map<String, Value>,
}

impl ToolsListRequest {
    /// Build a request with a fresh unique id.
    pub fn new() -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Uuid::new_v4().to_string(),
            method: TOOLS_LIST_METHOD,
            params: serde_json::Map::new(),
        }
    }
}

impl Default for ToolsListRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of validating a parsed response body against the envelope rules.
#[derive(Debug, Clone)]
pub enum EnvelopeCheck {
    /// Envelope is valid; `result.tools` entries with non-empty names.
    Tools {
        /// Tool names in wire order (duplicates preserved).
        names: Vec<String>,
        /// Non-fatal findings (e.g. duplicate names).
        warnings: Vec<String>,
    },
    /// Well-formed JSON-RPC error object.
    RpcError { code: i64, message: String },
    /// Envelope or `result.tools` shape violation.
    Invalid {
        /// Findings explaining the violation.
        errors: Vec<String>,
        /// Whether the `id` field still echoed the request id.
        id_echoed: bool,
    },
}

/// Validate a parsed JSON-RPC response against the sent request id.
///
/// Rules, in order: top-level `jsonrpc == "2.0"`, `id` echoes `sent_id`,
/// then either an `error` object or `result.tools` as a list whose entries
/// carry a non-empty `name`. Duplicate names are flagged but tolerated.
pub fn check_envelope(body: &Value, sent_id: &str) -> EnvelopeCheck {
    let mut errors = Vec::new();

    let obj = match body.as_object() {
        Some(o) => o,
        None => {
            return EnvelopeCheck::Invalid {
                errors: vec!["response body is not a JSON object".to_string()],
                id_echoed: false,
            };
        }
    };

    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(other) => errors.push(format!("jsonrpc version is '{other}', expected '2.0'")),
        None => errors.push("missing jsonrpc version field".to_string()),
    }

    let id_echoed = matches!(obj.get("id"), Some(Value::String(id)) if id == sent_id);
    if !id_echoed {
        errors.push("response id does not echo the request id".to_string());
    }

    if !errors.is_empty() {
        return EnvelopeCheck::Invalid { errors, id_echoed };
    }

    if let Some(err) = obj.get("error") {
        let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unspecified error")
            .to_string();
        return EnvelopeCheck::RpcError { code, message };
    }

    let tools = match obj.get("result").and_then(|r| r.get("tools")) {
        Some(Value::Array(tools)) => tools,
        Some(_) => {
            return EnvelopeCheck::Invalid {
                errors: vec!["result.tools is not a list".to_string()],
                id_echoed,
            };
        }
        None => {
            return EnvelopeCheck::Invalid {
                errors: vec!["missing result.tools".to_string()],
                id_echoed,
            };
        }
    };

    let mut names = Vec::with_capacity(tools.len());
    for (idx, tool) in tools.iter().enumerate() {
        match tool.get("name").and_then(Value::as_str) {
            Some(name) if !name.is_empty() => names.push(name.to_string()),
            Some(_) => errors.push(format!("tool at index {idx} has an empty name")),
            None => errors.push(format!("tool at index {idx} has no name")),
        }
    }
    if !errors.is_empty() {
        return EnvelopeCheck::Invalid { errors, id_echoed };
    }

    let mut warnings = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for name in &names {
        if !seen.insert(name.as_str()) {
            warnings.push(format!("duplicate tool name '{name}'"));
        }
    }

    EnvelopeCheck::Tools { names, warnings }
}
