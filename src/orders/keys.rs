//! Idempotency keys.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Exchange limit on client order id length is 36; keys stay at 32.
const KEY_LEN: usize = 32;

/// Fresh random key for a new logical request.
pub fn new_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Stable key for closing `position_id` because of `reason`, so repeated
/// exit attempts for the same trigger collapse into one exchange order.
pub fn exit_key(position_id: &str, reason: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", position_id, reason).as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(KEY_LEN);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_keys_are_unique_and_sized() {
        let a = new_key();
        let b = new_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), KEY_LEN);
    }

    #[test]
    fn test_exit_key_is_deterministic() {
        assert_eq!(exit_key("pos-1", "stop_loss"), "2e3438685eab15bdae4367aa580cc873");
        assert_eq!(exit_key("pos-1", "stop_loss"), exit_key("pos-1", "stop_loss"));
        assert_ne!(exit_key("pos-1", "stop_loss"), exit_key("pos-1", "take_profit"));
    }
}
