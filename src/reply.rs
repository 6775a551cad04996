//! Logical reply model and fragment merging.
//!
//! A multi-frame response arrives as a sequence of partially-decoded
//! fragments. [`Reply`] is the structured representation of one fragment
//! (or of the running accumulation): field name mapped to a tagged value,
//! where `Value::Array` marks repeated fields and everything else is a
//! scalar.
//!
//! [`Reply::merge`] folds fragments left-to-right: repeated fields are
//! concatenated in arrival order, scalar fields are overwritten by the
//! latest fragment.

use serde_json::{Map, Value};

/// Field name of the logical-completion flag in a decoded fragment.
pub const DONE_FIELD: &str = "done";

/// Field name of an embedded error message.
pub const ERRMSG_FIELD: &str = "errmsg";

/// Field name of an embedded error code.
pub const ERRCODE_FIELD: &str = "errcode";

/// One decoded reply fragment, or the accumulation of several.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    fields: Map<String, Value>,
}

impl Reply {
    /// Create an empty reply.
    pub fn new() -> Self {
        Self { fields: Map::new() }
    }

    /// Build a reply from a decoded JSON object.
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Get a field value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set a field value.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Whether the reply carries no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether this fragment signals logical completion of the response.
    pub fn is_done(&self) -> bool {
        matches!(self.fields.get(DONE_FIELD), Some(Value::Bool(true)))
    }

    /// Embedded error, if the fragment carries an `errmsg` field.
    ///
    /// Returns the message together with the error code (0 when the server
    /// sent none).
    pub fn embedded_error(&self) -> Option<(String, u32)> {
        let message = match self.fields.get(ERRMSG_FIELD) {
            Some(Value::String(s)) => s.clone(),
            _ => return None,
        };
        let code = self
            .fields
            .get(ERRCODE_FIELD)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        Some((message, code))
    }

    /// Iterate over fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Consume the reply, yielding the underlying field map.
    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }

    /// Merge a later fragment into this accumulation.
    ///
    /// For each field of `fragment`:
    /// - if the field is array-typed in either operand, the result is the
    ///   left operand's elements (if any) followed by the right operand's
    ///   (if any);
    /// - otherwise the fragment's scalar value overwrites.
    ///
    /// Fields only present in `self` are kept. Folding an ordered fragment
    /// sequence with this operation is associative.
    pub fn merge(&mut self, fragment: Reply) {
        for (name, incoming) in fragment.fields {
            match (self.fields.get_mut(&name), incoming) {
                (Some(Value::Array(left)), Value::Array(right)) => {
                    left.extend(right);
                }
                // Left is repeated, fragment has no array for it: the
                // fragment contributes nothing.
                (Some(Value::Array(_)), _) => {}
                (_, incoming) => {
                    self.fields.insert(name, incoming);
                }
            }
        }
    }
}

impl From<Map<String, Value>> for Reply {
    fn from(fields: Map<String, Value>) -> Self {
        Self::from_map(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(value: Value) -> Reply {
        match value {
            Value::Object(map) => Reply::from_map(map),
            _ => panic!("test replies must be objects"),
        }
    }

    #[test]
    fn test_arrays_concatenate_in_order() {
        let mut acc = reply(json!({ "keys": ["a"] }));
        acc.merge(reply(json!({ "keys": ["b", "c"] })));
        acc.merge(reply(json!({ "keys": ["d"] })));

        assert_eq!(acc.get("keys"), Some(&json!(["a", "b", "c", "d"])));
    }

    #[test]
    fn test_scalars_overwrite() {
        let mut acc = reply(json!({ "vclock": "v1", "n_val": 3 }));
        acc.merge(reply(json!({ "vclock": "v2" })));

        assert_eq!(acc.get("vclock"), Some(&json!("v2")));
        assert_eq!(acc.get("n_val"), Some(&json!(3)));
    }

    #[test]
    fn test_mixed_fields() {
        let mut acc = reply(json!({ "a": [1] }));
        acc.merge(reply(json!({ "a": [2] })));
        acc.merge(reply(json!({ "b": "x" })));

        assert_eq!(acc.get("a"), Some(&json!([1, 2])));
        assert_eq!(acc.get("b"), Some(&json!("x")));
    }

    #[test]
    fn test_fold_is_associative() {
        let fragments = [
            json!({ "a": [1] }),
            json!({ "a": [2] }),
            json!({ "b": "x" }),
        ];

        // All at once.
        let mut left_fold = Reply::new();
        for f in &fragments {
            left_fold.merge(reply(f.clone()));
        }

        // First two, then the third.
        let mut pair = reply(fragments[0].clone());
        pair.merge(reply(fragments[1].clone()));
        pair.merge(reply(fragments[2].clone()));

        assert_eq!(left_fold, pair);
    }

    #[test]
    fn test_array_on_one_side_only() {
        // Fragment introduces an array where nothing existed.
        let mut acc = Reply::new();
        acc.merge(reply(json!({ "keys": ["a"] })));
        assert_eq!(acc.get("keys"), Some(&json!(["a"])));

        // Fragment carries a scalar where the accumulation holds an array:
        // the fragment has no array elements to contribute.
        let mut acc = reply(json!({ "keys": ["a"] }));
        acc.merge(reply(json!({ "keys": "b" })));
        assert_eq!(acc.get("keys"), Some(&json!(["a"])));
    }

    #[test]
    fn test_done_flag() {
        assert!(reply(json!({ "done": true })).is_done());
        assert!(!reply(json!({ "done": false })).is_done());
        assert!(!reply(json!({ "keys": [] })).is_done());
    }

    #[test]
    fn test_embedded_error() {
        let r = reply(json!({ "errmsg": "overload", "errcode": 5 }));
        assert_eq!(r.embedded_error(), Some(("overload".to_string(), 5)));

        let r = reply(json!({ "errmsg": "bad request" }));
        assert_eq!(r.embedded_error(), Some(("bad request".to_string(), 0)));

        assert_eq!(reply(json!({ "ok": true })).embedded_error(), None);
    }
}
