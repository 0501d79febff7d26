//! Record types shared by the filter, bulk, pipeline and storage layers.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::error::CrmError;
use crate::util::parse_timestamp;

/// Prefix addressing an entry of a record's custom-fields map.
pub const CUSTOM_FIELD_PREFIX: &str = "custom.";

/// Stage ids with a fixed meaning for a deal's derived status.
pub const WON_STAGE: &str = "closed_won";
pub const LOST_STAGE: &str = "closed_lost";

// =============================================================================
// Field values
// =============================================================================

/// A typed scalar stored on a record or in its custom-fields map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Number(_) => "number",
            FieldValue::Timestamp(_) => "timestamp",
            FieldValue::Text(_) => "text",
            FieldValue::List(_) => "list",
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            FieldValue::Bool(_) => 0,
            FieldValue::Number(_) => 1,
            FieldValue::Timestamp(_) => 2,
            FieldValue::Text(_) => 3,
            FieldValue::List(_) => 4,
            FieldValue::Null => 5,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Total order used by the sort engine.
    ///
    /// Same-kind values compare naturally (text through [`collate_text`]);
    /// mixed kinds fall back to a fixed kind order.
    pub fn compare(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::Number(a), FieldValue::Number(b)) => a.total_cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => collate_text(a, b),
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => a.cmp(b),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::List(a), FieldValue::List(b)) => a.cmp(b),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }

    /// Case-insensitive substring match. `needle` must already be lowercase.
    pub fn contains_text(&self, needle: &str) -> bool {
        match self {
            FieldValue::Text(s) => s.to_lowercase().contains(needle),
            FieldValue::List(items) => items.iter().any(|s| s.to_lowercase().contains(needle)),
            _ => false,
        }
    }

    /// Plain-text rendering used for exact-match filters and CSV export.
    pub fn to_display_string(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Number(n) if n.is_finite() && n.fract() == 0.0 => format!("{:.0}", n),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Timestamp(t) => t.to_rfc3339(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::List(items) => items.join(";"),
        }
    }
}

/// Dictionary order for text. Letters compare without accents or case
/// first; accents break ties next, then case with lowercase first.
/// Canonically equivalent strings compare equal.
pub fn collate_text(a: &str, b: &str) -> Ordering {
    fn base(s: &str) -> impl Iterator<Item = char> + '_ {
        s.nfd().filter(|c| !is_combining_mark(*c)).flat_map(char::to_lowercase)
    }
    fn accented(s: &str) -> impl Iterator<Item = char> + '_ {
        s.nfd().flat_map(char::to_lowercase)
    }
    fn cased(s: &str) -> impl Iterator<Item = (bool, char)> + '_ {
        s.nfd().map(|c| (c.is_uppercase(), c))
    }
    base(a)
        .cmp(base(b))
        .then_with(|| accented(a).cmp(accented(b)))
        .then_with(|| cased(a).cmp(cased(b)))
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Number(value as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

// =============================================================================
// Field schema
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    Bool,
    Timestamp,
    List,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::Timestamp => "timestamp",
            FieldKind::List => "list",
        }
    }
}

/// Static description of one built-in record field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub nullable: bool,
    pub editable: bool,
}

const fn spec(name: &'static str, kind: FieldKind, nullable: bool, editable: bool) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        nullable,
        editable,
    }
}

/// Check a value against a field spec, coercing date strings into timestamps.
pub fn coerce_value(spec: &FieldSpec, value: FieldValue) -> Result<FieldValue, CrmError> {
    let mismatch = |found: &'static str| CrmError::TypeMismatch {
        field: spec.name.to_string(),
        expected: spec.kind.as_str(),
        found,
    };
    match (spec.kind, value) {
        (_, FieldValue::Null) if spec.nullable => Ok(FieldValue::Null),
        (_, FieldValue::Null) => Err(mismatch("null")),
        (FieldKind::Text, v @ FieldValue::Text(_)) => Ok(v),
        (FieldKind::Number, FieldValue::Number(n)) if n.is_finite() => Ok(FieldValue::Number(n)),
        (FieldKind::Bool, v @ FieldValue::Bool(_)) => Ok(v),
        (FieldKind::Timestamp, v @ FieldValue::Timestamp(_)) => Ok(v),
        (FieldKind::Timestamp, FieldValue::Text(raw)) => parse_timestamp(&raw)
            .map(FieldValue::Timestamp)
            .ok_or_else(|| CrmError::InvalidValue {
                field: spec.name.to_string(),
                reason: format!("'{}' is not a date", raw),
            }),
        (FieldKind::List, v @ FieldValue::List(_)) => Ok(v),
        (_, other) => Err(mismatch(other.kind_name())),
    }
}

// =============================================================================
// Record trait
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Lead,
    Deal,
}

impl RecordKind {
    /// Collection name used in storage keys.
    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::Lead => "leads",
            RecordKind::Deal => "deals",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Lead => write!(f, "lead"),
            RecordKind::Deal => write!(f, "deal"),
        }
    }
}

/// Common interface of every record held in a collection.
///
/// Fields are addressed by name so the filter engine and bulk mutator can
/// work over leads and deals alike. Names starting with `custom.` address
/// the custom-fields map.
pub trait Record:
    Clone + std::fmt::Debug + Serialize + serde::de::DeserializeOwned + Send + Sync + 'static
{
    const KIND: RecordKind;
    const FIELDS: &'static [FieldSpec];
    const SEARCHABLE_FIELDS: &'static [&'static str];
    /// Numeric field the score-range filter applies to.
    const SCORE_FIELD: &'static str;

    fn id(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
    fn set_updated_at(&mut self, at: DateTime<Utc>);
    fn custom_fields(&self) -> &BTreeMap<String, FieldValue>;
    fn custom_fields_mut(&mut self) -> &mut BTreeMap<String, FieldValue>;

    /// Read a built-in field. `None` when the field is unknown or unset.
    fn builtin_field(&self, name: &str) -> Option<FieldValue>;

    /// Write a built-in field. The value has already been coerced to the
    /// field's kind by [`Record::set_field`].
    fn set_builtin_field(&mut self, name: &str, value: FieldValue) -> Result<(), CrmError>;

    fn field_spec(name: &str) -> Option<&'static FieldSpec> {
        Self::FIELDS.iter().find(|f| f.name == name)
    }

    fn field(&self, name: &str) -> Option<FieldValue> {
        match name.strip_prefix(CUSTOM_FIELD_PREFIX) {
            Some(key) => self
                .custom_fields()
                .get(key)
                .filter(|v| !v.is_null())
                .cloned(),
            None => self.builtin_field(name).filter(|v| !v.is_null()),
        }
    }

    /// Validate and assign one field. Does not touch `updated_at`.
    fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), CrmError> {
        if let Some(key) = name.strip_prefix(CUSTOM_FIELD_PREFIX) {
            if key.is_empty() {
                return Err(CrmError::UnknownField(name.to_string()));
            }
            if let FieldValue::List(_) = value {
                return Err(CrmError::TypeMismatch {
                    field: name.to_string(),
                    expected: "scalar",
                    found: "list",
                });
            }
            if value.is_null() {
                self.custom_fields_mut().remove(key);
            } else {
                self.custom_fields_mut().insert(key.to_string(), value);
            }
            return Ok(());
        }
        let spec = Self::field_spec(name).ok_or_else(|| CrmError::UnknownField(name.to_string()))?;
        if !spec.editable {
            return Err(CrmError::ImmutableField(name.to_string()));
        }
        let value = coerce_value(spec, value)?;
        self.set_builtin_field(name, value)
    }
}

// --- assignment helpers used by the record impls ---

fn text(field: &str, value: FieldValue) -> Result<String, CrmError> {
    match value {
        FieldValue::Text(s) => Ok(s),
        other => Err(CrmError::TypeMismatch {
            field: field.to_string(),
            expected: "text",
            found: other.kind_name(),
        }),
    }
}

fn opt_text(field: &str, value: FieldValue) -> Result<Option<String>, CrmError> {
    match value {
        FieldValue::Null => Ok(None),
        other => text(field, other).map(Some),
    }
}

fn number(field: &str, value: FieldValue) -> Result<f64, CrmError> {
    value.as_number().ok_or_else(|| CrmError::TypeMismatch {
        field: field.to_string(),
        expected: "number",
        found: value.kind_name(),
    })
}

fn opt_number(field: &str, value: FieldValue) -> Result<Option<f64>, CrmError> {
    match value {
        FieldValue::Null => Ok(None),
        other => number(field, other).map(Some),
    }
}

fn percent(field: &str, value: FieldValue) -> Result<u8, CrmError> {
    let n = number(field, value)?;
    if !(0.0..=100.0).contains(&n) {
        return Err(CrmError::InvalidValue {
            field: field.to_string(),
            reason: format!("{} is outside 0-100", n),
        });
    }
    Ok(n.round() as u8)
}

fn opt_timestamp(field: &str, value: FieldValue) -> Result<Option<DateTime<Utc>>, CrmError> {
    match value {
        FieldValue::Null => Ok(None),
        FieldValue::Timestamp(t) => Ok(Some(t)),
        other => Err(CrmError::TypeMismatch {
            field: field.to_string(),
            expected: "timestamp",
            found: other.kind_name(),
        }),
    }
}

fn list(field: &str, value: FieldValue) -> Result<Vec<String>, CrmError> {
    match value {
        FieldValue::List(items) => Ok(items),
        other => Err(CrmError::TypeMismatch {
            field: field.to_string(),
            expected: "list",
            found: other.kind_name(),
        }),
    }
}

fn parse_enum<T: std::str::FromStr<Err = String>>(field: &str, value: FieldValue) -> Result<T, CrmError> {
    let raw = text(field, value)?;
    raw.parse().map_err(|reason| CrmError::InvalidValue {
        field: field.to_string(),
        reason,
    })
}

// =============================================================================
// Leads
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    #[default]
    New,
    Contacted,
    Qualified,
    Unqualified,
    Converted,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 5] = [
        LeadStatus::New,
        LeadStatus::Contacted,
        LeadStatus::Qualified,
        LeadStatus::Unqualified,
        LeadStatus::Converted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Qualified => "qualified",
            LeadStatus::Unqualified => "unqualified",
            LeadStatus::Converted => "converted",
        }
    }
}

impl std::str::FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "new" => Ok(LeadStatus::New),
            "contacted" => Ok(LeadStatus::Contacted),
            "qualified" => Ok(LeadStatus::Qualified),
            "unqualified" => Ok(LeadStatus::Unqualified),
            "converted" => Ok(LeadStatus::Converted),
            _ => Err(format!("Unknown lead status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Hot,
    #[default]
    Warm,
    Cold,
}

impl Rating {
    pub const ALL: [Rating; 3] = [Rating::Hot, Rating::Warm, Rating::Cold];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Hot => "hot",
            Rating::Warm => "warm",
            Rating::Cold => "cold",
        }
    }

    /// Rating bucket implied by a 0-100 lead score.
    pub fn from_score(score: u8) -> Self {
        match score {
            70..=u8::MAX => Rating::Hot,
            40..=69 => Rating::Warm,
            _ => Rating::Cold,
        }
    }
}

impl std::str::FromStr for Rating {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hot" => Ok(Rating::Hot),
            "warm" => Ok(Rating::Warm),
            "cold" => Ok(Rating::Cold),
            _ => Err(format!("Unknown rating: {}", s)),
        }
    }
}

/// A prospective customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_title: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub status: LeadStatus,
    #[serde(default)]
    pub rating: Rating,
    #[serde(default)]
    pub score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contacted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, FieldValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_source() -> String {
    "manual".to_string()
}

impl Lead {
    /// New lead with default status/rating and a fresh id.
    pub fn new(first_name: &str, last_name: &str, email: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            email: email.to_string(),
            phone: None,
            company: None,
            job_title: None,
            source: default_source(),
            status: LeadStatus::New,
            rating: Rating::Warm,
            score: 0,
            estimated_value: None,
            owner: None,
            notes: None,
            last_contacted_at: None,
            tags: Vec::new(),
            custom_fields: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

impl Record for Lead {
    const KIND: RecordKind = RecordKind::Lead;
    const FIELDS: &'static [FieldSpec] = &[
        spec("id", FieldKind::Text, false, false),
        spec("first_name", FieldKind::Text, false, true),
        spec("last_name", FieldKind::Text, false, true),
        spec("full_name", FieldKind::Text, false, false),
        spec("email", FieldKind::Text, false, true),
        spec("phone", FieldKind::Text, true, true),
        spec("company", FieldKind::Text, true, true),
        spec("job_title", FieldKind::Text, true, true),
        spec("source", FieldKind::Text, false, true),
        spec("status", FieldKind::Text, false, true),
        spec("rating", FieldKind::Text, false, true),
        spec("score", FieldKind::Number, false, true),
        spec("estimated_value", FieldKind::Number, true, true),
        spec("owner", FieldKind::Text, true, true),
        spec("notes", FieldKind::Text, true, true),
        spec("last_contacted_at", FieldKind::Timestamp, true, true),
        spec("tags", FieldKind::List, false, true),
        spec("created_at", FieldKind::Timestamp, false, false),
        spec("updated_at", FieldKind::Timestamp, false, false),
    ];
    const SEARCHABLE_FIELDS: &'static [&'static str] = &[
        "first_name",
        "last_name",
        "full_name",
        "email",
        "company",
        "job_title",
        "phone",
    ];
    const SCORE_FIELD: &'static str = "score";

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn custom_fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.custom_fields
    }

    fn custom_fields_mut(&mut self) -> &mut BTreeMap<String, FieldValue> {
        &mut self.custom_fields
    }

    fn builtin_field(&self, name: &str) -> Option<FieldValue> {
        let value = match name {
            "id" => self.id.as_str().into(),
            "first_name" => self.first_name.as_str().into(),
            "last_name" => self.last_name.as_str().into(),
            "full_name" => self.full_name().into(),
            "email" => self.email.as_str().into(),
            "phone" => self.phone.clone().into(),
            "company" => self.company.clone().into(),
            "job_title" => self.job_title.clone().into(),
            "source" => self.source.as_str().into(),
            "status" => self.status.as_str().into(),
            "rating" => self.rating.as_str().into(),
            "score" => FieldValue::Number(self.score as f64),
            "estimated_value" => self.estimated_value.into(),
            "owner" => self.owner.clone().into(),
            "notes" => self.notes.clone().into(),
            "last_contacted_at" => self.last_contacted_at.into(),
            "tags" => self.tags.clone().into(),
            "created_at" => self.created_at.into(),
            "updated_at" => self.updated_at.into(),
            _ => return None,
        };
        Some(value)
    }

    fn set_builtin_field(&mut self, name: &str, value: FieldValue) -> Result<(), CrmError> {
        match name {
            "first_name" => self.first_name = text(name, value)?,
            "last_name" => self.last_name = text(name, value)?,
            "email" => self.email = text(name, value)?,
            "phone" => self.phone = opt_text(name, value)?,
            "company" => self.company = opt_text(name, value)?,
            "job_title" => self.job_title = opt_text(name, value)?,
            "source" => self.source = text(name, value)?,
            "status" => self.status = parse_enum(name, value)?,
            "rating" => self.rating = parse_enum(name, value)?,
            "score" => self.score = percent(name, value)?,
            "estimated_value" => self.estimated_value = opt_number(name, value)?,
            "owner" => self.owner = opt_text(name, value)?,
            "notes" => self.notes = opt_text(name, value)?,
            "last_contacted_at" => self.last_contacted_at = opt_timestamp(name, value)?,
            "tags" => self.tags = list(name, value)?,
            _ => return Err(CrmError::UnknownField(name.to_string())),
        }
        Ok(())
    }
}

// =============================================================================
// Deals
// =============================================================================

/// An opportunity moving through the stage pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    pub value: f64,
    pub stage: String,
    pub probability: u8,
    #[serde(default)]
    pub days_in_stage: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_close_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Lead this deal was converted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, FieldValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn new(title: &str, value: f64, stage: &str, probability: u8, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            company: None,
            contact_name: None,
            contact_email: None,
            value,
            stage: stage.to_string(),
            probability,
            days_in_stage: 0,
            expected_close_date: None,
            owner: None,
            source: None,
            lead_id: None,
            notes: None,
            tags: Vec::new(),
            custom_fields: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// `won`, `lost` or `open`, derived from the current stage.
    pub fn status(&self) -> &'static str {
        match self.stage.as_str() {
            WON_STAGE => "won",
            LOST_STAGE => "lost",
            _ => "open",
        }
    }
}

impl Record for Deal {
    const KIND: RecordKind = RecordKind::Deal;
    // stage and probability move only through the pipeline.
    const FIELDS: &'static [FieldSpec] = &[
        spec("id", FieldKind::Text, false, false),
        spec("title", FieldKind::Text, false, true),
        spec("company", FieldKind::Text, true, true),
        spec("contact_name", FieldKind::Text, true, true),
        spec("contact_email", FieldKind::Text, true, true),
        spec("value", FieldKind::Number, false, true),
        spec("stage", FieldKind::Text, false, false),
        spec("status", FieldKind::Text, false, false),
        spec("probability", FieldKind::Number, false, false),
        spec("days_in_stage", FieldKind::Number, false, false),
        spec("expected_close_date", FieldKind::Timestamp, true, true),
        spec("owner", FieldKind::Text, true, true),
        spec("source", FieldKind::Text, true, true),
        spec("lead_id", FieldKind::Text, true, false),
        spec("notes", FieldKind::Text, true, true),
        spec("tags", FieldKind::List, false, true),
        spec("created_at", FieldKind::Timestamp, false, false),
        spec("updated_at", FieldKind::Timestamp, false, false),
    ];
    const SEARCHABLE_FIELDS: &'static [&'static str] =
        &["title", "company", "contact_name", "contact_email"];
    const SCORE_FIELD: &'static str = "probability";

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn custom_fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.custom_fields
    }

    fn custom_fields_mut(&mut self) -> &mut BTreeMap<String, FieldValue> {
        &mut self.custom_fields
    }

    fn builtin_field(&self, name: &str) -> Option<FieldValue> {
        let value = match name {
            "id" => self.id.as_str().into(),
            "title" => self.title.as_str().into(),
            "company" => self.company.clone().into(),
            "contact_name" => self.contact_name.clone().into(),
            "contact_email" => self.contact_email.clone().into(),
            "value" => FieldValue::Number(self.value),
            "stage" => self.stage.as_str().into(),
            "status" => self.status().into(),
            "probability" => FieldValue::Number(self.probability as f64),
            "days_in_stage" => self.days_in_stage.into(),
            "expected_close_date" => self.expected_close_date.into(),
            "owner" => self.owner.clone().into(),
            "source" => self.source.clone().into(),
            "lead_id" => self.lead_id.clone().into(),
            "notes" => self.notes.clone().into(),
            "tags" => self.tags.clone().into(),
            "created_at" => self.created_at.into(),
            "updated_at" => self.updated_at.into(),
            _ => return None,
        };
        Some(value)
    }

    fn set_builtin_field(&mut self, name: &str, value: FieldValue) -> Result<(), CrmError> {
        match name {
            "title" => self.title = text(name, value)?,
            "company" => self.company = opt_text(name, value)?,
            "contact_name" => self.contact_name = opt_text(name, value)?,
            "contact_email" => self.contact_email = opt_text(name, value)?,
            "value" => {
                let v = number(name, value)?;
                if v < 0.0 {
                    return Err(CrmError::InvalidValue {
                        field: name.to_string(),
                        reason: "deal value cannot be negative".to_string(),
                    });
                }
                self.value = v;
            }
            "expected_close_date" => self.expected_close_date = opt_timestamp(name, value)?,
            "owner" => self.owner = opt_text(name, value)?,
            "source" => self.source = opt_text(name, value)?,
            "notes" => self.notes = opt_text(name, value)?,
            "tags" => self.tags = list(name, value)?,
            _ => return Err(CrmError::UnknownField(name.to_string())),
        }
        Ok(())
    }
}
