pub mod config;

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a password.
///
/// Clients hash before transmission and the server stores and compares only
/// the hex digest, so plaintext never crosses the wire or touches disk.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
