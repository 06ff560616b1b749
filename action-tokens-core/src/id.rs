use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::Instant;

use crate::types::TokenId;

/// Length of generated ids (hex characters).
pub const GENERATED_ID_LEN: usize = 32;

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a token id from wall-clock time, a monotonic clock and a
/// process-wide sequence number.
///
/// Not checked against storage; collisions are treated as negligible.
pub fn generate_token_id() -> TokenId {
    let epoch_ms = chrono::Utc::now().timestamp_millis();
    let mono_ns = EPOCH.elapsed().as_nanos();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(format!("{epoch_ms}.{mono_ns}.{seq}").as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(GENERATED_ID_LEN);
    TokenId::from(hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_hex_and_fixed_length() {
        let id = generate_token_id();
        assert_eq!(id.as_str().len(), GENERATED_ID_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generated_ids_do_not_repeat_in_tight_loop() {
        let ids: HashSet<_> = (0..1000).map(|_| generate_token_id()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
