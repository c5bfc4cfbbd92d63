//! Hashing System - SHA-256 fingerprints for compiled views
//!
//! A fingerprint changes whenever anything that shapes the compiled output
//! changes: the spliced source text, a modification stamp, the compile mode
//! or the engine build. Cache keys embed it, so entries never go stale in place.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Compute the fingerprint of one view revision
///
/// fingerprint = sha256(engine_version : mode : stamp* : spliced_text)
pub fn compute_fingerprint(
    spliced_text: &str,
    stamps: &[Option<DateTime<Utc>>],
    debug: bool,
    engine_version: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(engine_version.as_bytes());
    hasher.update(if debug { b":debug:".as_slice() } else { b":production:".as_slice() });
    for stamp in stamps {
        match stamp.as_ref().and_then(|t| t.timestamp_nanos_opt()) {
            Some(nanos) => hasher.update(nanos.to_string().as_bytes()),
            None => hasher.update(b"-"),
        }
        hasher.update(b":");
    }
    hasher.update(spliced_text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable, filesystem-safe prefix shared by every cache entry of a view
pub fn view_key(view: &str) -> String {
    sha256_hex(view.as_bytes())[..16].to_string()
}

/// Cache key of a compiled fragment
pub fn fragment_key(view: &str, fingerprint: &str) -> String {
    format!("{}-{}", view_key(view), fingerprint)
}

/// Cache key of one extracted block
pub fn block_key(view: &str, block: &str, fingerprint: &str) -> String {
    format!(
        "{}-{}",
        fragment_key(view, fingerprint),
        &sha256_hex(block.as_bytes())[..12]
    )
}

// We need hex encoding
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
