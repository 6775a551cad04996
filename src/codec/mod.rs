//! Codec module - payload encoding/decoding behind the [`Translator`] seam.
//!
//! The protocol engine never inspects payload bytes itself: every payload
//! is encoded and decoded by a translator keyed by the canonical message
//! name from the catalog. A deployment talking the full protobuf schema
//! plugs its own [`Translator`] in through the client builder; the bundled
//! [`JsonTranslator`] covers testing and JSON-speaking servers.

mod json;

use serde_json::Value;

pub use json::{JsonTranslator, MAPRED_PHASE_FIELD, MAPRED_RESPONSE_FIELD};

use crate::error::Result;
use crate::reply::Reply;

/// Schema-driven payload codec keyed by message name.
///
/// Failures are opaque to the engine and resolve the active task the same
/// way a server-side error does.
pub trait Translator: Send + Sync {
    /// Encode a parameter structure into a payload for `name`.
    ///
    /// `None` means a parameterless request and must produce an empty
    /// payload.
    fn encode(&self, name: &str, params: Option<&Value>) -> Result<Vec<u8>>;

    /// Decode a payload for `name` into a structured reply.
    fn decode(&self, name: &str, payload: &[u8]) -> Result<Reply>;
}
