//! Bulk mutator: one patch or one deletion applied across a set of ids.
//!
//! Both entry points return a new collection. Records outside the id set
//! are carried over as the same `Arc`, so callers can detect change with
//! `Arc::ptr_eq`. A failed update leaves the input untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CrmError;
use crate::types::{FieldValue, Record};
use crate::util::advance_timestamp;

/// Partial field map. Only listed fields are overwritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordPatch(BTreeMap<String, FieldValue>);

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Apply every field to one record and stamp `updated_at`.
    pub fn apply_to<R: Record>(&self, record: &R, now: DateTime<Utc>) -> Result<R, CrmError> {
        if self.is_empty() {
            return Err(CrmError::EmptyPatch);
        }
        let mut next = record.clone();
        for (field, value) in self.fields() {
            next.set_field(field, value.clone())?;
        }
        next.set_updated_at(advance_timestamp(record.updated_at(), now));
        Ok(next)
    }
}

/// A bulk action over the current selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BulkOperation {
    Update { fields: RecordPatch },
    Delete,
}

impl BulkOperation {
    pub fn label(&self) -> &'static str {
        match self {
            BulkOperation::Update { .. } => "update",
            BulkOperation::Delete => "delete",
        }
    }
}

/// Overwrite `patch` fields on every record whose id is in `ids`.
///
/// The patch is applied to every target before anything is returned; the
/// first validation error aborts the whole batch.
pub fn apply_bulk_update<R: Record>(
    records: &[Arc<R>],
    ids: &BTreeSet<String>,
    patch: &RecordPatch,
    now: DateTime<Utc>,
) -> Result<Vec<Arc<R>>, CrmError> {
    if ids.is_empty() {
        return Err(CrmError::EmptySelection);
    }
    if patch.is_empty() {
        return Err(CrmError::EmptyPatch);
    }

    records
        .iter()
        .map(|record| {
            if ids.contains(record.id()) {
                patch
                    .apply_to(record.as_ref(), now)
                    .map(Arc::new)
                    .map_err(|e| {
                        log::debug!("Bulk update rejected on {}: {}", record.id(), e);
                        e
                    })
            } else {
                Ok(Arc::clone(record))
            }
        })
        .collect()
}

/// Remove every record whose id is in `ids`. Unknown ids are ignored.
pub fn apply_bulk_delete<R: Record>(records: &[Arc<R>], ids: &BTreeSet<String>) -> Vec<Arc<R>> {
    records
        .iter()
        .filter(|r| !ids.contains(r.id()))
        .cloned()
        .collect()
}

/// Outcome of [`apply_bulk`]: the new collection and how many records it touched.
#[derive(Debug, Clone)]
pub struct BulkOutcome<R> {
    pub records: Vec<Arc<R>>,
    pub affected: usize,
}

/// Dispatch a [`BulkOperation`].
pub fn apply_bulk<R: Record>(
    records: &[Arc<R>],
    ids: &BTreeSet<String>,
    op: &BulkOperation,
    now: DateTime<Utc>,
) -> Result<BulkOutcome<R>, CrmError> {
    if ids.is_empty() {
        return Err(CrmError::EmptySelection);
    }
    let affected = records.iter().filter(|r| ids.contains(r.id())).count();
    let records = match op {
        BulkOperation::Update { fields } => apply_bulk_update(records, ids, fields, now)?,
        BulkOperation::Delete => apply_bulk_delete(records, ids),
    };
    Ok(BulkOutcome { records, affected })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{arcs, lead, ts};
    use crate::types::{Lead, LeadStatus};

    fn five_leads() -> Vec<Arc<Lead>> {
        arcs(
            (1..=5)
                .map(|i| lead(&format!("l{}", i), "First", "Last", 10 * i as u8, ts(2026, 1, i)))
                .collect(),
        )
    }

    fn id_set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bulk_update_patches_only_selected() {
        let records = five_leads();
        let ids = id_set(&["l2", "l4"]);
        let patch = RecordPatch::new()
            .set("status", "contacted")
            .set("owner", "sam");
        let now = ts(2026, 3, 1);

        let out = apply_bulk_update(&records, &ids, &patch, now).expect("update");
        assert_eq!(out.len(), records.len());
        for (before, after) in records.iter().zip(out.iter()) {
            if ids.contains(&before.id) {
                assert!(!Arc::ptr_eq(before, after));
                assert_eq!(after.status, LeadStatus::Contacted);
                assert_eq!(after.owner.as_deref(), Some("sam"));
                assert_eq!(after.updated_at, now);
                assert!(after.updated_at > before.updated_at);
                assert_eq!(after.first_name, before.first_name);
            } else {
                assert!(Arc::ptr_eq(before, after));
            }
        }
    }

    #[test]
    fn test_bulk_update_is_atomic_on_validation_error() {
        let records = five_leads();
        let ids = id_set(&["l1", "l2"]);
        let patch = RecordPatch::new().set("score", 55.0).set("rating", "lukewarm");

        let err = apply_bulk_update(&records, &ids, &patch, ts(2026, 3, 1)).unwrap_err();
        assert!(matches!(err, CrmError::InvalidValue { .. }));
        assert_eq!(records[0].score, 10);
        assert_eq!(records[1].score, 20);
    }

    #[test]
    fn test_bulk_update_never_moves_updated_at_backwards() {
        let mut future = lead("l1", "First", "Last", 10, ts(2026, 1, 1));
        future.updated_at = ts(2027, 1, 1);
        let records = arcs(vec![future]);
        let patch = RecordPatch::new().set("notes", "called");
        let out = apply_bulk_update(&records, &id_set(&["l1"]), &patch, ts(2026, 6, 1))
            .expect("update");
        assert_eq!(out[0].updated_at, ts(2027, 1, 1));
    }

    #[test]
    fn test_bulk_update_guards() {
        let records = five_leads();
        assert!(matches!(
            apply_bulk_update(&records, &BTreeSet::new(), &RecordPatch::new().set("notes", "x"), ts(2026, 3, 1)),
            Err(CrmError::EmptySelection)
        ));
        assert!(matches!(
            apply_bulk_update(&records, &id_set(&["l1"]), &RecordPatch::new(), ts(2026, 3, 1)),
            Err(CrmError::EmptyPatch)
        ));
    }

    #[test]
    fn test_bulk_delete_counts() {
        let records = five_leads();
        let ids = id_set(&["l1", "l3", "ghost-1", "ghost-2", "ghost-3"]);
        let out = apply_bulk_delete(&records, &ids);
        assert_eq!(out.len(), records.len() - 2);
        assert!(out.iter().all(|r| !ids.contains(&r.id)));
        for r in &out {
            let original = records.iter().find(|o| o.id == r.id).expect("kept");
            assert!(Arc::ptr_eq(original, r));
        }
    }

    #[test]
    fn test_apply_bulk_dispatch() {
        let records = five_leads();
        let ids = id_set(&["l5", "missing"]);
        let outcome = apply_bulk(&records, &ids, &BulkOperation::Delete, ts(2026, 3, 1))
            .expect("delete");
        assert_eq!(outcome.affected, 1);
        assert_eq!(outcome.records.len(), 4);

        let update = BulkOperation::Update {
            fields: RecordPatch::new().set("tags", vec!["q3".to_string(), "q3".to_string()]),
        };
        let outcome = apply_bulk(&records, &ids, &update, ts(2026, 3, 1)).expect("update");
        assert_eq!(outcome.affected, 1);
        let patched = outcome.records.iter().find(|r| r.id == "l5").expect("l5");
        assert_eq!(patched.tags, vec!["q3", "q3"]);
    }

    #[test]
    fn test_bulk_operation_json_shape() {
        let op: BulkOperation =
            serde_json::from_str(r#"{"op": "update", "fields": {"status": "qualified", "score": 70}}"#)
                .expect("deserialize");
        match op {
            BulkOperation::Update { fields } => {
                assert_eq!(fields.fields().count(), 2);
            }
            BulkOperation::Delete => panic!("expected update"),
        }
        let delete: BulkOperation = serde_json::from_str(r#"{"op": "delete"}"#).expect("delete");
        assert_eq!(delete, BulkOperation::Delete);
    }
}
