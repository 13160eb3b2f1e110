use sha2::{Digest, Sha256};

use crate::model::{fold_natural_key, EntityKind, Scope};

/// Hex digest prefix length. 64 bits of digest keeps the key short while
/// making accidental collisions across natural keys negligible.
const DIGEST_PREFIX_LEN: usize = 16;

/// Derives the deterministic name of the exclusive lock serializing
/// conflicting mutations on one (scope, natural key) pair.
///
/// The natural key is case-folded before hashing, so "HQ" and "hq" contend
/// for the same lock. The key is handed to the store's transaction-scoped
/// zero-wait lock primitive (a Postgres advisory lock in production).
pub fn build_lock_key(kind: EntityKind, scope: &Scope, natural_key: &str) -> String {
    let folded = fold_natural_key(natural_key);
    let mut hasher = Sha256::new();
    hasher.update(folded.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!(
        "{}:{}:{}",
        kind.label(),
        scope.lock_part(),
        &digest[..DIGEST_PREFIX_LEN]
    )
}
