//! Three-way merge of synchronized collections
//!
//! `three_way_merge(local, remote, base)` reconciles two replicas of the same
//! collection. It is a pure function: inputs are never mutated, every input
//! produces an output, and conflicts are returned as data alongside an
//! already-resolved result.
//!
//! Resolution rules per identity:
//! - present on one side only: taken as-is
//! - present on both sides, absent from base: later modification wins, ties go local
//! - present in base: whichever side changed wins; if both changed, local wins
//!   and every disagreeing field is reported as a conflict
//!
//! Unsubscribed entries override the pair rule: the earlier unsubscribe wins,
//! and only a gap of more than 24 hours is reported.

use super::models::{Account, SyncConflict, SyncEntity, UnsubscribedEntry};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Conflict values shown in place of credential blobs
const MASKED: &str = "********";

/// Timestamp gap above which two unsubscribe times are reported
const UNSUBSCRIBE_CONFLICT_THRESHOLD_HOURS: i64 = 24;

// ============================================================================
// Mergeable Entities
// ============================================================================

/// Merge behavior for one entity type
pub trait Mergeable: SyncEntity {
    /// Fields whose conflict values must never be reported verbatim
    const SENSITIVE_FIELDS: &'static [&'static str] = &[];

    /// Timestamp used when no base is available
    fn modified_at(&self) -> DateTime<Utc>;

    /// Named synced fields, compared against base and across replicas
    fn merge_fields(&self) -> Vec<(&'static str, Value)>;

    /// Resolve one identity present on both sides
    fn resolve(local: &Self, remote: &Self, base: Option<&Self>) -> Resolution<Self> {
        resolve_by_fields(local, remote, base)
    }
}

/// Outcome of resolving one identity present on both sides
#[derive(Debug, Clone)]
pub struct Resolution<E> {
    pub merged: E,
    pub conflicts: Vec<SyncConflict>,
}

impl Mergeable for Account {
    const SENSITIVE_FIELDS: &'static [&'static str] = &["password"];

    fn modified_at(&self) -> DateTime<Utc> {
        self.last_modified()
    }

    fn merge_fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("name", Value::String(self.name.clone())),
            ("email", Value::String(self.email.clone())),
            ("server", Value::String(self.server.clone())),
            ("password", Value::String(self.password.clone())),
        ]
    }
}

impl Mergeable for UnsubscribedEntry {
    fn modified_at(&self) -> DateTime<Utc> {
        self.unsubscribed_at
    }

    fn merge_fields(&self) -> Vec<(&'static str, Value)> {
        vec![(
            "unsubscribed_at",
            Value::String(self.unsubscribed_at.to_rfc3339()),
        )]
    }

    fn resolve(local: &Self, remote: &Self, _base: Option<&Self>) -> Resolution<Self> {
        let merged = if remote.unsubscribed_at < local.unsubscribed_at {
            remote.clone()
        } else {
            local.clone()
        };

        let gap = (local.unsubscribed_at - remote.unsubscribed_at).abs();
        let conflicts = if gap > Duration::hours(UNSUBSCRIBE_CONFLICT_THRESHOLD_HOURS) {
            field_conflicts(local, remote)
        } else {
            Vec::new()
        };

        Resolution { merged, conflicts }
    }
}

/// Default pair rule shared by entities without special semantics
fn resolve_by_fields<E: Mergeable>(local: &E, remote: &E, base: Option<&E>) -> Resolution<E> {
    let Some(base) = base else {
        let merged = if remote.modified_at() > local.modified_at() {
            remote.clone()
        } else {
            local.clone()
        };
        return Resolution {
            merged,
            conflicts: Vec::new(),
        };
    };

    let base_fields = base.merge_fields();
    let local_changed = local.merge_fields() != base_fields;
    let remote_changed = remote.merge_fields() != base_fields;

    match (local_changed, remote_changed) {
        (true, true) => Resolution {
            merged: local.clone(),
            conflicts: field_conflicts(local, remote),
        },
        (false, true) => Resolution {
            merged: remote.clone(),
            conflicts: Vec::new(),
        },
        _ => Resolution {
            merged: local.clone(),
            conflicts: Vec::new(),
        },
    }
}

/// One conflict per field whose values disagree
fn field_conflicts<E: Mergeable>(local: &E, remote: &E) -> Vec<SyncConflict> {
    let local_time = local.modified_at();
    let remote_time = remote.modified_at();

    local
        .merge_fields()
        .into_iter()
        .zip(remote.merge_fields())
        .filter(|((_, l), (_, r))| l != r)
        .map(|((field, l), (_, r))| {
            let (l, r) = if E::SENSITIVE_FIELDS.contains(&field) {
                (Value::String(MASKED.to_string()), Value::String(MASKED.to_string()))
            } else {
                (l, r)
            };
            SyncConflict {
                entity: E::KIND.entity().to_string(),
                id: local.key().to_string(),
                field: field.to_string(),
                local: l,
                remote: r,
                local_time,
                remote_time,
            }
        })
        .collect()
}

// ============================================================================
// Collection Merge
// ============================================================================

/// Result of merging two replicas
#[derive(Debug, Clone)]
pub struct MergeOutcome<E> {
    pub merged: Vec<E>,
    pub conflicts: Vec<SyncConflict>,
    /// Identities that only existed remotely
    pub added_from_remote: usize,
    /// Identities where the remote version replaced a differing local one
    pub updated_from_remote: usize,
}

/// Index a collection by identity; the first occurrence of a duplicate wins.
fn index_by_key<E: SyncEntity>(items: &[E]) -> HashMap<&str, &E> {
    let mut map = HashMap::with_capacity(items.len());
    for item in items {
        map.entry(item.key()).or_insert(item);
    }
    map
}

/// Merge `local` and `remote` against their last agreed `base`.
///
/// Output order is local order followed by remote-only entries in remote
/// order, so repeated merges are stable.
pub fn three_way_merge<E: Mergeable>(local: &[E], remote: &[E], base: &[E]) -> MergeOutcome<E> {
    let remote_map = index_by_key(remote);
    let base_map = index_by_key(base);

    let mut outcome = MergeOutcome {
        merged: Vec::with_capacity(local.len().max(remote.len())),
        conflicts: Vec::new(),
        added_from_remote: 0,
        updated_from_remote: 0,
    };
    let mut seen: HashSet<&str> = HashSet::new();

    for item in local {
        let key = item.key();
        if !seen.insert(key) {
            continue;
        }

        match remote_map.get(key) {
            None => outcome.merged.push(item.clone()),
            Some(remote_item) => {
                let resolution = E::resolve(item, remote_item, base_map.get(key).copied());
                if &resolution.merged != item {
                    outcome.updated_from_remote += 1;
                }
                outcome.conflicts.extend(resolution.conflicts);
                outcome.merged.push(resolution.merged);
            }
        }
    }

    for item in remote {
        let key = item.key();
        if !seen.insert(key) {
            continue;
        }
        outcome.added_from_remote += 1;
        outcome.merged.push(item.clone());
    }

    outcome
}

/// Identities that are empty, which the merge cannot address.
///
/// Callers drop or reject these before merging.
pub fn validate_ids<E: SyncEntity>(items: &[E]) -> Result<(), Vec<usize>> {
    let invalid: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.key().trim().is_empty())
        .map(|(idx, _)| idx)
        .collect();

    if invalid.is_empty() {
        Ok(())
    } else {
        Err(invalid)
    }
}

/// Copy of `items` without entries that have an empty identity
pub fn drop_invalid<E: SyncEntity>(items: Vec<E>) -> (Vec<E>, usize) {
    let before = items.len();
    let kept: Vec<E> = items
        .into_iter()
        .filter(|item| !item.key().trim().is_empty())
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 0, 0, 0).unwrap()
    }

    fn account(id: &str, name: &str, server: &str) -> Account {
        Account {
            id: id.to_string(),
            name: name.to_string(),
            email: id.to_string(),
            server: server.to_string(),
            password: "blob".to_string(),
            created_at: ts(1),
            updated_at: None,
        }
    }

    fn unsub(sender: &str, at: DateTime<Utc>) -> UnsubscribedEntry {
        UnsubscribedEntry {
            sender: sender.to_string(),
            unsubscribed_at: at,
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let x = vec![account("a@x.com", "A", "s1"), account("b@x.com", "B", "s2")];
        let out = three_way_merge(&x, &x, &x);
        assert_eq!(out.merged, x);
        assert!(out.conflicts.is_empty());
        assert_eq!(out.added_from_remote, 0);
        assert_eq!(out.updated_from_remote, 0);
    }

    #[test]
    fn test_unsubscribed_merge_is_idempotent() {
        let x = vec![unsub("a@shop.com", ts(1)), unsub("b@shop.com", ts(4))];
        let out = three_way_merge(&x, &x, &x);
        assert_eq!(out.merged, x);
        assert!(out.conflicts.is_empty());
        assert_eq!(out.added_from_remote, 0);
        assert_eq!(out.updated_from_remote, 0);
    }

    #[test]
    fn test_disjoint_union_keeps_order() {
        let local = vec![account("a@x.com", "A", "s1")];
        let remote = vec![account("c@x.com", "C", "s3"), account("b@x.com", "B", "s2")];

        let out = three_way_merge(&local, &remote, &[]);
        let ids: Vec<&str> = out.merged.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a@x.com", "c@x.com", "b@x.com"]);
        assert!(out.conflicts.is_empty());
        assert_eq!(out.added_from_remote, 2);
    }

    #[test]
    fn test_one_sided_remote_change_wins() {
        let base = vec![account("a@x.com", "Old", "s1")];
        let local = base.clone();
        let remote = vec![account("a@x.com", "New", "s1")];

        let out = three_way_merge(&local, &remote, &base);
        assert_eq!(out.merged[0].name, "New");
        assert!(out.conflicts.is_empty());
        assert_eq!(out.updated_from_remote, 1);
    }

    #[test]
    fn test_one_sided_local_change_wins() {
        let base = vec![account("a@x.com", "Old", "s1")];
        let local = vec![account("a@x.com", "Mine", "s1")];
        let remote = base.clone();

        let out = three_way_merge(&local, &remote, &base);
        assert_eq!(out.merged[0].name, "Mine");
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_both_changed_reports_conflict_keeps_local() {
        let base = vec![account("a@x.com", "Old", "s1")];
        let local = vec![account("a@x.com", "Local", "s1")];
        let remote = vec![account("a@x.com", "Remote", "s2")];

        let out = three_way_merge(&local, &remote, &base);
        assert_eq!(out.merged, local);
        assert_eq!(out.conflicts.len(), 2);

        let name = out.conflicts.iter().find(|c| c.field == "name").unwrap();
        assert_eq!(name.entity, "account");
        assert_eq!(name.id, "a@x.com");
        assert_eq!(name.local, Value::String("Local".into()));
        assert_eq!(name.remote, Value::String("Remote".into()));
        assert!(out.conflicts.iter().any(|c| c.field == "server"));
    }

    #[test]
    fn test_credential_conflict_is_masked() {
        let base = vec![account("a@x.com", "A", "s1")];
        let mut local = base.clone();
        local[0].password = "local-blob".into();
        let mut remote = base.clone();
        remote[0].password = "remote-blob".into();

        let out = three_way_merge(&local, &remote, &base);
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].field, "password");
        assert_eq!(out.conflicts[0].local, Value::String(MASKED.into()));
        assert_eq!(out.conflicts[0].remote, Value::String(MASKED.into()));
        assert_eq!(out.merged[0].password, "local-blob");
    }

    #[test]
    fn test_no_base_later_timestamp_wins() {
        let local = vec![account("a@x.com", "Local", "s1")];
        let mut remote = vec![account("a@x.com", "Remote", "s1")];
        remote[0].updated_at = Some(ts(5));

        let out = three_way_merge(&local, &remote, &[]);
        assert_eq!(out.merged[0].name, "Remote");
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_no_base_tie_goes_local() {
        let local = vec![account("a@x.com", "Local", "s1")];
        let remote = vec![account("a@x.com", "Remote", "s1")];

        let out = three_way_merge(&local, &remote, &[]);
        assert_eq!(out.merged[0].name, "Local");
        assert_eq!(out.updated_from_remote, 0);
    }

    #[test]
    fn test_unsubscribed_keeps_earlier_without_conflict() {
        let local = vec![unsub("s", ts(1) + Duration::hours(2))];
        let remote = vec![unsub("s", ts(1))];

        let out = three_way_merge(&local, &remote, &[]);
        assert_eq!(out.merged[0].unsubscribed_at, ts(1));
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_unsubscribed_large_gap_reports_conflict() {
        let local = vec![unsub("s", ts(1))];
        let remote = vec![unsub("s", ts(3))];

        let out = three_way_merge(&local, &remote, &[]);
        assert_eq!(out.merged[0].unsubscribed_at, ts(1));
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].entity, "unsubscribed");
        assert_eq!(out.conflicts[0].field, "unsubscribed_at");
    }

    #[test]
    fn test_unsubscribed_exact_threshold_is_not_conflict() {
        let local = vec![unsub("s", ts(1))];
        let remote = vec![unsub("s", ts(2))];

        let out = three_way_merge(&local, &remote, &[]);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_duplicate_ids_first_occurrence_wins() {
        let local = vec![account("a@x.com", "First", "s1"), account("a@x.com", "Second", "s1")];
        let out = three_way_merge(&local, &[], &[]);
        assert_eq!(out.merged.len(), 1);
        assert_eq!(out.merged[0].name, "First");
    }

    #[test]
    fn test_merge_does_not_mutate_inputs() {
        let local = vec![account("a@x.com", "A", "s1")];
        let remote = vec![account("b@x.com", "B", "s2")];
        let local_copy = local.clone();
        let remote_copy = remote.clone();

        let _ = three_way_merge(&local, &remote, &[]);
        assert_eq!(local, local_copy);
        assert_eq!(remote, remote_copy);
    }

    #[test]
    fn test_validate_ids() {
        let items = vec![account("a@x.com", "A", "s1"), account("", "Blank", "s2")];
        assert_eq!(validate_ids(&items), Err(vec![1]));

        let (kept, dropped) = drop_invalid(items);
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped, 1);
        assert!(validate_ids(&kept).is_ok());
    }
}
