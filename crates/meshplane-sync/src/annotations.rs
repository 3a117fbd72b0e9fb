use std::collections::BTreeMap;

/// Annotation carrying a dispatched object's record version, shared with agents.
pub const RECORD_VERSION_ANNOTATION: &str = "meshplane.io/record-version";

/// The record version an object was dispatched with, if present and numeric.
pub fn record_version_of(annotations: &BTreeMap<String, String>) -> Option<u64> {
    annotations
        .get(RECORD_VERSION_ANNOTATION)
        .and_then(|v| v.trim().parse().ok())
}

pub fn set_record_version(annotations: &mut BTreeMap<String, String>, version: u64) {
    annotations.insert(RECORD_VERSION_ANNOTATION.to_string(), version.to_string());
}
