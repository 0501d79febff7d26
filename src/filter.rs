//! Filter/sort engine producing the ordered view of a record collection.
//!
//! `view()` is pure: it never mutates the input and returns the same order
//! for the same input, so it is safe to call on every render.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CrmError;
use crate::types::{FieldValue, Record, CUSTOM_FIELD_PREFIX};

/// Exact-match option. Serialized as `"all"` or the value itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Choice {
    #[default]
    All,
    Exact(String),
}

impl Choice {
    pub fn exact(value: &str) -> Self {
        Choice::Exact(value.to_string())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Choice::All)
    }
}

impl From<String> for Choice {
    fn from(value: String) -> Self {
        if value.is_empty() || value.eq_ignore_ascii_case("all") {
            Choice::All
        } else {
            Choice::Exact(value)
        }
    }
}

impl From<Choice> for String {
    fn from(value: Choice) -> Self {
        match value {
            Choice::All => "all".to_string(),
            Choice::Exact(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// Inclusive numeric bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
}

/// Inclusive bound on the creation timestamp. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DateRange {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

/// Filter and sort configuration for a record list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Criteria {
    pub text_query: String,
    pub status_equals: Choice,
    pub rating_equals: Choice,
    pub source_equals: Choice,
    pub stage_equals: Choice,
    pub score_range: Option<ScoreRange>,
    pub date_range: Option<DateRange>,
    pub sort_field: String,
    pub sort_direction: SortDirection,
}

pub const DEFAULT_SORT_FIELD: &str = "created_at";

impl Default for Criteria {
    fn default() -> Self {
        Self {
            text_query: String::new(),
            status_equals: Choice::All,
            rating_equals: Choice::All,
            source_equals: Choice::All,
            stage_equals: Choice::All,
            score_range: None,
            date_range: None,
            sort_field: DEFAULT_SORT_FIELD.to_string(),
            sort_direction: SortDirection::Desc,
        }
    }
}

impl Criteria {
    pub fn sorted_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.sort_field = field.to_string();
        self.sort_direction = direction;
        self
    }

    /// Number of active predicates (sorting not included).
    pub fn active_filter_count(&self) -> usize {
        let choices = [
            &self.status_equals,
            &self.rating_equals,
            &self.source_equals,
            &self.stage_equals,
        ];
        choices.iter().filter(|c| !c.is_all()).count()
            + usize::from(!self.text_query.trim().is_empty())
            + usize::from(self.score_range.is_some())
            + usize::from(self.date_range.is_some())
    }

    /// Reject criteria that can never be satisfied or sort on nothing.
    pub fn validate<R: Record>(&self) -> Result<(), CrmError> {
        if let Some(range) = self.score_range {
            if !range.min.is_finite() || !range.max.is_finite() {
                return Err(CrmError::InvalidCriteria(
                    "score range bounds must be numbers".to_string(),
                ));
            }
            if range.min > range.max {
                return Err(CrmError::InvalidCriteria(format!(
                    "score range min {} is above max {}",
                    range.min, range.max
                )));
            }
        }
        if let Some(DateRange {
            start: Some(start),
            end: Some(end),
        }) = self.date_range
        {
            if start > end {
                return Err(CrmError::InvalidCriteria(
                    "date range starts after it ends".to_string(),
                ));
            }
        }
        let custom = self
            .sort_field
            .strip_prefix(CUSTOM_FIELD_PREFIX)
            .map(|key| !key.is_empty())
            .unwrap_or(false);
        if !custom && R::field_spec(&self.sort_field).is_none() {
            return Err(CrmError::InvalidCriteria(format!(
                "cannot sort by '{}'",
                self.sort_field
            )));
        }
        Ok(())
    }

    /// True when the record satisfies every active predicate.
    pub fn matches<R: Record>(&self, record: &R) -> bool {
        let needle = self.text_query.trim().to_lowercase();
        self.matches_with_needle(record, &needle)
    }

    fn matches_with_needle<R: Record>(&self, record: &R, needle: &str) -> bool {
        if !needle.is_empty()
            && !R::SEARCHABLE_FIELDS
                .iter()
                .filter_map(|name| record.field(name))
                .any(|value| value.contains_text(needle))
        {
            return false;
        }

        let choices = [
            ("status", &self.status_equals),
            ("rating", &self.rating_equals),
            ("source", &self.source_equals),
            ("stage", &self.stage_equals),
        ];
        for (field, choice) in choices {
            if let Choice::Exact(expected) = choice {
                match record.field(field) {
                    Some(value) if value.to_display_string() == *expected => {}
                    _ => return false,
                }
            }
        }

        if let Some(range) = self.score_range {
            match record.field(R::SCORE_FIELD).and_then(|v| v.as_number()) {
                Some(score) if score >= range.min && score <= range.max => {}
                _ => return false,
            }
        }

        if let Some(range) = self.date_range {
            let created = record.created_at();
            if range.start.map(|s| created < s).unwrap_or(false)
                || range.end.map(|e| created > e).unwrap_or(false)
            {
                return false;
            }
        }

        true
    }
}

/// Filter and sort `records` by `criteria`.
pub fn view<R: Record>(records: &[Arc<R>], criteria: &Criteria) -> Vec<Arc<R>> {
    let needle = criteria.text_query.trim().to_lowercase();
    let mut keyed: Vec<(Option<FieldValue>, &Arc<R>)> = records
        .iter()
        .filter(|r| criteria.matches_with_needle(r.as_ref(), &needle))
        .map(|r| (r.field(&criteria.sort_field), r))
        .collect();

    keyed.sort_by(|(ka, a), (kb, b)| {
        compare_keys(ka.as_ref(), kb.as_ref(), criteria.sort_direction)
            .then_with(|| a.id().cmp(b.id()))
    });

    keyed.into_iter().map(|(_, r)| Arc::clone(r)).collect()
}

/// Ids of the records in a view, in view order.
pub fn visible_ids<R: Record>(view: &[Arc<R>]) -> Vec<String> {
    view.iter().map(|r| r.id().to_string()).collect()
}

// Missing values sort last in both directions.
fn compare_keys(a: Option<&FieldValue>, b: Option<&FieldValue>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match direction {
            SortDirection::Asc => a.compare(b),
            SortDirection::Desc => b.compare(a),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
