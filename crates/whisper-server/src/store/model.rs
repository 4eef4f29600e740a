use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A stored secret. `ciphertext` and `iv` are opaque client-encrypted fields;
/// the store never holds anything that could decrypt them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub ciphertext: String,
    pub iv: String,
    /// Unix timestamp (milliseconds) when the record was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) from which the record is gone.
    pub expires_at: i64,
    pub views_remaining: u32,
}

impl SecretRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Retrievable right now: unexpired and with views left.
    pub fn is_visible(&self, now: i64) -> bool {
        !self.is_expired(now) && self.views_remaining > 0
    }

    pub fn remaining_ttl(&self, now: i64) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now).max(0) as u64)
    }

    pub fn payload(&self) -> SecretPayload {
        SecretPayload {
            ciphertext: self.ciphertext.clone(),
            iv: self.iv.clone(),
        }
    }
}

/// What a recipient gets back: the envelope minus everything server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretPayload {
    pub ciphertext: String,
    pub iv: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_at: i64, views_remaining: u32) -> SecretRecord {
        SecretRecord {
            id: "0".repeat(32),
            ciphertext: "Y3Q=".into(),
            iv: "aXY=".into(),
            created_at: 0,
            expires_at,
            views_remaining,
        }
    }

    #[test]
    fn visibility_requires_time_and_views() {
        assert!(record(1_000, 1).is_visible(999));
        assert!(!record(1_000, 1).is_visible(1_000));
        assert!(!record(1_000, 0).is_visible(0));
    }

    #[test]
    fn remaining_ttl_never_negative() {
        assert_eq!(record(1_500, 1).remaining_ttl(1_000), Duration::from_millis(500));
        assert_eq!(record(1_000, 1).remaining_ttl(5_000), Duration::ZERO);
    }
}
