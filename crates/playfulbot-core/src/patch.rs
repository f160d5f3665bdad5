//! Strict JSON Patch (RFC 6902) on a `serde_json::Value` document.
//!
//! A failed `test`, or any operation on a path that does not resolve, rejects
//! the whole patch and leaves the document as it was.

use serde_json::Value;

use crate::errors::PatchError;

pub use json_patch::PatchOperation;

/// Decode a serialized operation list.
pub fn parse_patch(raw: &str) -> Result<Vec<PatchOperation>, PatchError> {
    serde_json::from_str::<json_patch::Patch>(raw)
        .map(|patch| patch.0)
        .map_err(|e| PatchError::Malformed(e.to_string()))
}

/// Apply every operation to `doc` in order.
pub fn apply_patch(doc: &mut Value, operations: &[PatchOperation]) -> Result<(), PatchError> {
    json_patch::patch(doc, operations).map_err(|e| {
        let path = e.path.to_string();
        match e.kind {
            json_patch::PatchErrorKind::TestFailed => PatchError::TestFailed(path),
            _ => PatchError::InvalidPointer(path),
        }
    })
}
