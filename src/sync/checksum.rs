//! Collection fingerprints
//!
//! A fingerprint is a hex SHA-256 over one canonical line per entity. Lines
//! are sorted before hashing, so reordering a collection never changes its
//! fingerprint while any field edit does.

use super::models::SyncEntity;
use sha2::{Digest, Sha256};

/// Canonical line for one entity: every component is length-prefixed so
/// that `("ab", "c")` and `("a", "bc")` never collide.
fn canonical_line<E: SyncEntity>(entity: &E) -> String {
    let mut line = String::new();
    let key = entity.key();
    line.push_str(&format!("{}:{}", key.len(), key));
    for field in entity.fingerprint_fields() {
        line.push_str(&format!("|{}:{}", field.len(), field));
    }
    line
}

/// Deterministic, order-independent fingerprint of a collection
pub fn fingerprint<E: SyncEntity>(items: &[E]) -> String {
    let mut lines: Vec<String> = items.iter().map(canonical_line).collect();
    lines.sort_unstable();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{Account, UnsubscribedEntry};
    use chrono::{TimeZone, Utc};

    fn account(id: &str, name: &str) -> Account {
        Account {
            id: id.to_string(),
            name: name.to_string(),
            email: id.to_string(),
            server: "imap.example.com:993".to_string(),
            password: "blob".to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            updated_at: None,
        }
    }

    #[test]
    fn test_fingerprint_ignores_order() {
        let a = vec![account("a@x.com", "A"), account("b@x.com", "B")];
        let b = vec![account("b@x.com", "B"), account("a@x.com", "A")];
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_detects_field_edit() {
        let before = vec![account("a@x.com", "A")];
        let mut after = before.clone();
        after[0].server = "imap.other.com:993".to_string();
        assert_ne!(fingerprint(&before), fingerprint(&after));

        let mut rotated = before.clone();
        rotated[0].password = "other-blob".to_string();
        assert_ne!(fingerprint(&before), fingerprint(&rotated));
    }

    #[test]
    fn test_fingerprint_ignores_touch_only() {
        let before = vec![account("a@x.com", "A")];
        let mut after = before.clone();
        after[0].touch();
        assert_eq!(fingerprint(&before), fingerprint(&after));
    }

    #[test]
    fn test_fingerprint_unsubscribed_timestamp() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let a = vec![UnsubscribedEntry { sender: "s".into(), unsubscribed_at: at }];
        let b = vec![UnsubscribedEntry {
            sender: "s".into(),
            unsubscribed_at: at + chrono::Duration::seconds(1),
        }];
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        let mut a = account("a@x.com", "ab");
        a.email = "c".to_string();
        let mut b = account("a@x.com", "a");
        b.email = "bc".to_string();
        assert_ne!(fingerprint(&[a]), fingerprint(&[b]));
    }

    #[test]
    fn test_empty_collection_is_stable() {
        let empty: Vec<Account> = Vec::new();
        assert_eq!(fingerprint(&empty), fingerprint(&empty));
        assert_eq!(fingerprint(&empty).len(), 64);
    }
}
