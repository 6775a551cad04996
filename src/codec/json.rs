//! JSON translator.
//!
//! Encodes parameter maps and decodes reply objects with `serde_json`.
//! Parameterless requests map to empty payloads; empty payloads decode to
//! empty replies (Ping, Del and friends have bodyless responses).
//!
//! Map-reduce responses get one extra normalization step: the fragment's
//! `response` field is a JSON-encoded array of result rows, which is also
//! materialized under the fragment's phase number so that merging
//! multi-fragment responses accumulates rows per phase instead of
//! overwriting them.

use serde_json::Value;

use super::Translator;
use crate::error::{Error, Result};
use crate::reply::Reply;

/// Field carrying the JSON-encoded row batch in a map-reduce fragment.
pub const MAPRED_RESPONSE_FIELD: &str = "response";

/// Field carrying the phase number in a map-reduce fragment.
pub const MAPRED_PHASE_FIELD: &str = "phase";

/// Default schema-driven JSON codec.
#[derive(Debug, Default, Clone)]
pub struct JsonTranslator;

impl JsonTranslator {
    /// Create a new JSON translator.
    pub fn new() -> Self {
        Self
    }
}

impl Translator for JsonTranslator {
    fn encode(&self, _name: &str, params: Option<&Value>) -> Result<Vec<u8>> {
        match params {
            Some(value) => Ok(serde_json::to_vec(value)?),
            None => Ok(Vec::new()),
        }
    }

    fn decode(&self, name: &str, payload: &[u8]) -> Result<Reply> {
        if payload.is_empty() {
            return Ok(Reply::new());
        }

        let value: Value = serde_json::from_slice(payload)?;
        let reply = match value {
            Value::Object(map) => Reply::from_map(map),
            other => {
                return Err(Error::Protocol(format!(
                    "Expected object payload for {}, got {}",
                    name, other
                )))
            }
        };

        if name == "RpbMapRedResp" {
            return normalize_mapred(reply);
        }
        Ok(reply)
    }
}

/// Materialize a map-reduce fragment's row batch under its phase number.
///
/// The raw `response` string is kept for the streaming row adapter.
fn normalize_mapred(mut reply: Reply) -> Result<Reply> {
    let raw = match reply.get(MAPRED_RESPONSE_FIELD) {
        Some(Value::String(s)) => s.clone(),
        _ => return Ok(reply),
    };

    let rows: Value = serde_json::from_str(&raw)?;
    if !rows.is_array() {
        return Err(Error::Protocol(
            "Map-reduce response is not a JSON array".to_string(),
        ));
    }

    let phase = reply
        .get(MAPRED_PHASE_FIELD)
        .and_then(Value::as_u64)
        .unwrap_or(0);
    reply.insert(phase.to_string(), rows);
    Ok(reply)
}
