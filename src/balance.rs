use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::warn;
use sha2::{Digest, Sha256};

/// Per-account quota lists, keyed by a stable account key. Ordered maps
/// keep the digest independent of iteration order.
pub type BalanceMap = BTreeMap<String, Vec<f64>>;

/// Digest of the balance snapshot; a change between runs means a balance
/// moved and the summary is worth pushing.
pub fn generate_balance_hash(balances: &BalanceMap) -> String {
    let canonical = serde_json::to_string(balances).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub fn load_balance_hash(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        }
        Err(_) => None,
    }
}

pub fn save_balance_hash(path: &Path, hash: &str) {
    if let Err(e) = fs::write(path, hash) {
        warn!("failed to save balance hash: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_for_equal_balances() {
        let mut a = BalanceMap::new();
        a.insert("account_1".to_string(), vec![2000.0, 1.5]);
        let mut b = BalanceMap::new();
        b.insert("account_1".to_string(), vec![2000.0, 1.5]);
        assert_eq!(generate_balance_hash(&a), generate_balance_hash(&b));
        assert_eq!(generate_balance_hash(&a).len(), 16);
    }

    #[test]
    fn hash_changes_when_a_balance_moves() {
        let mut before = BalanceMap::new();
        before.insert("account_1".to_string(), vec![2000.0]);
        let mut after = BalanceMap::new();
        after.insert("account_1".to_string(), vec![2000.5]);
        assert_ne!(generate_balance_hash(&before), generate_balance_hash(&after));
    }

    #[test]
    fn round_trips_through_the_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("balance_hash.txt");
        assert_eq!(load_balance_hash(&path), None);
        save_balance_hash(&path, "abcdef0123456789");
        assert_eq!(load_balance_hash(&path), Some("abcdef0123456789".to_string()));
    }
}
