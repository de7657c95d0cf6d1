//! Correlation identity — stable, unguessable per-(tenant,user) tokens.
//!
//! The id joins affiliate postbacks back to a user without exposing the
//! Telegram user id. It is a keyed hash: without the process-wide salt a
//! third party cannot derive valid ids and spoof conversion credit.

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Hex characters kept from the digest. Short enough for affiliate query
/// strings, long enough that collisions are not a practical concern.
const DIGEST_LEN: usize = 24;

/// Derive the correlation id for a (tenant, user) pair.
///
/// Deterministic: same inputs always yield the same id. The tenant id is
/// prefixed in the clear for human debuggability; the hash half is keyed
/// SHA-256 over `tenant_id:user_id`, truncated.
pub fn derive_id(salt: &SecretString, tenant_id: i64, user_id: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.expose_secret().as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{tenant_id}:{user_id}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{tenant_id}-{}", &digest[..DIGEST_LEN])
}

/// Read the cleartext tenant prefix back out of a correlation id. Works
/// on ids we never issued too, for attributing audit rows.
pub fn tenant_prefix(correlation_id: &str) -> Option<i64> {
    correlation_id.split_once('-')?.0.parse().ok()
}
