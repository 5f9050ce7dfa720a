//! Content fingerprints for receiver and group definitions.
//!
//! The digest input is `v1 {action} {description} {name} {tags...} {version}`
//! joined by single spaces. Both the field order and the separator are part of
//! the stored identity of every receiver; do not reorder them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version tag leading every fingerprint input.
pub const FINGERPRINT_VERSION: &str = "v1";

const SEPARATOR: &str = " ";

/// The definition fields a fingerprint is computed over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSeed {
    pub action: String,
    pub description: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub version: String,
}

/// Computes the lowercase hex SHA-256 fingerprint of a seed.
pub fn fingerprint(seed: &FingerprintSeed) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(seed.tags.len() + 5);
    parts.push(FINGERPRINT_VERSION);
    parts.push(&seed.action);
    parts.push(&seed.description);
    parts.push(&seed.name);
    parts.extend(seed.tags.iter().map(String::as_str));
    parts.push(&seed.version);

    hex::encode(Sha256::digest(parts.join(SEPARATOR).as_bytes()))
}
