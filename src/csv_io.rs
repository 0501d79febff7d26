//! CSV import, export and template generation for leads and deals.
//!
//! Import is row-tolerant: a bad row becomes a [`RowError`] and the rest of
//! the file still imports. Only a missing or unusable header fails the call.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::CrmError;
use crate::pipeline::StagePipeline;
use crate::types::{Deal, FieldValue, Lead, LeadStatus, Rating, Record};
use crate::util::{is_valid_email, normalize_email, parse_timestamp};

/// Separator for list values (tags) inside one CSV cell.
const LIST_SEPARATOR: &str = ";";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    /// 1-based line number in the source text (the header is line 1).
    pub line: u64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ImportedRow<R> {
    pub line: u64,
    pub record: R,
}

#[derive(Debug, Clone)]
pub struct ImportReport<R> {
    pub imported: Vec<ImportedRow<R>>,
    pub errors: Vec<RowError>,
}

impl<R> Default for ImportReport<R> {
    fn default() -> Self {
        Self {
            imported: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<R> ImportReport<R> {
    pub fn success_count(&self) -> usize {
        self.imported.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn into_records(self) -> Vec<R> {
        self.imported.into_iter().map(|row| row.record).collect()
    }

    /// One-line summary for a notification.
    pub fn summary(&self) -> String {
        match (self.success_count(), self.error_count()) {
            (0, 0) => "No rows to import".to_string(),
            (ok, 0) => format!("Imported {} record{}", ok, plural(ok)),
            (ok, bad) => format!(
                "Imported {} record{}, {} row{} failed",
                ok,
                plural(ok),
                bad,
                plural(bad)
            ),
        }
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Inputs a row conversion may need besides the row itself.
pub struct ImportContext<'a> {
    pub now: DateTime<Utc>,
    pub pipeline: &'a StagePipeline,
}

/// A record type with a CSV shape.
pub trait CsvRecord: Record {
    /// Known columns, in export order.
    const COLUMNS: &'static [&'static str];
    /// Columns that must be present in the header and non-empty in each row.
    const REQUIRED: &'static [&'static str];

    fn from_row(row: &CsvRow<'_>, ctx: &ImportContext<'_>) -> Result<Self, String>;
    fn to_row(&self) -> Vec<String>;
    fn example_row() -> &'static [&'static str];

    /// Key used to reject duplicates on import, if the type has one.
    fn dedupe_key(&self) -> Option<String> {
        None
    }
}

/// Header-addressed view of one data row.
pub struct CsvRow<'a> {
    cells: HashMap<&'a str, &'a str>,
}

impl<'a> CsvRow<'a> {
    /// Trimmed, non-empty cell value.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        self.cells
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn required(&self, column: &str) -> Result<&'a str, String> {
        self.get(column)
            .ok_or_else(|| format!("missing required field '{}'", column))
    }

    fn number(&self, column: &str) -> Result<Option<f64>, String> {
        match self.get(column) {
            None => Ok(None),
            Some(raw) => raw
                .replace(['$', '_'], "")
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(Some)
                .ok_or_else(|| format!("'{}' is not a number in column '{}'", raw, column)),
        }
    }

    fn timestamp(&self, column: &str) -> Result<Option<DateTime<Utc>>, String> {
        match self.get(column) {
            None => Ok(None),
            Some(raw) => parse_timestamp(raw)
                .map(Some)
                .ok_or_else(|| format!("'{}' is not a date in column '{}'", raw, column)),
        }
    }

    fn list(&self, column: &str) -> Vec<String> {
        self.get(column)
            .map(|raw| {
                raw.split(LIST_SEPARATOR)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn text(&self, column: &str) -> Option<String> {
        self.get(column).map(String::from)
    }

    /// Non-empty cells in columns the record type does not know.
    fn extra_cells(&self, known: &[&str]) -> Vec<(&'a str, &'a str)> {
        let mut extra: Vec<(&'a str, &'a str)> = self
            .cells
            .iter()
            .map(|(k, v)| (*k, v.trim()))
            .filter(|(k, v)| !v.is_empty() && !known.contains(k))
            .collect();
        extra.sort();
        extra
    }
}

fn email_cell(row: &CsvRow<'_>, column: &str, required: bool) -> Result<Option<String>, String> {
    let value = if required {
        Some(row.required(column)?)
    } else {
        row.get(column)
    };
    match value {
        Some(email) if !is_valid_email(email) => {
            Err(format!("'{}' is not a valid email address", email))
        }
        other => Ok(other.map(String::from)),
    }
}

fn percent_cell(row: &CsvRow<'_>, column: &str) -> Result<Option<u8>, String> {
    match row.number(column)? {
        None => Ok(None),
        Some(n) if (0.0..=100.0).contains(&n) => Ok(Some(n.round() as u8)),
        Some(n) => Err(format!("{} in column '{}' is outside 0-100", n, column)),
    }
}

/// Typed value for a custom-field cell. A cell becomes a bool, number or
/// timestamp only when that value renders back to the same text, so
/// `02139` stays text. List values come back as text.
fn custom_cell(raw: &str) -> FieldValue {
    let candidates = [
        raw.parse::<bool>().ok().map(FieldValue::Bool),
        raw.parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(FieldValue::Number),
        parse_timestamp(raw).map(FieldValue::Timestamp),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|value| value.to_display_string() == raw)
        .unwrap_or_else(|| FieldValue::Text(raw.to_string()))
}

fn attach_extras<R: Record>(record: &mut R, row: &CsvRow<'_>, known: &[&str]) {
    for (column, value) in row.extra_cells(known) {
        record
            .custom_fields_mut()
            .insert(column.to_string(), custom_cell(value));
    }
}

// =============================================================================
// Record shapes
// =============================================================================

impl CsvRecord for Lead {
    const COLUMNS: &'static [&'static str] = &[
        "first_name",
        "last_name",
        "email",
        "phone",
        "company",
        "job_title",
        "source",
        "status",
        "rating",
        "score",
        "estimated_value",
        "owner",
        "notes",
        "tags",
    ];
    const REQUIRED: &'static [&'static str] = &["first_name", "last_name", "email"];

    fn from_row(row: &CsvRow<'_>, ctx: &ImportContext<'_>) -> Result<Self, String> {
        let first_name = row.required("first_name")?;
        let last_name = row.required("last_name")?;
        let email = email_cell(row, "email", true)?.unwrap_or_default();

        let mut lead = Lead::new(first_name, last_name, &email, ctx.now);
        lead.phone = row.text("phone");
        lead.company = row.text("company");
        lead.job_title = row.text("job_title");
        lead.source = row.text("source").unwrap_or_else(|| "import".to_string());
        if let Some(status) = row.get("status") {
            lead.status = status.parse::<LeadStatus>()?;
        }
        if let Some(score) = percent_cell(row, "score")? {
            lead.score = score;
            lead.rating = Rating::from_score(score);
        }
        if let Some(rating) = row.get("rating") {
            lead.rating = rating.parse::<Rating>()?;
        }
        lead.estimated_value = row.number("estimated_value")?;
        lead.owner = row.text("owner");
        lead.notes = row.text("notes");
        lead.tags = row.list("tags");
        attach_extras(&mut lead, row, Self::COLUMNS);
        Ok(lead)
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.first_name.clone(),
            self.last_name.clone(),
            self.email.clone(),
            self.phone.clone().unwrap_or_default(),
            self.company.clone().unwrap_or_default(),
            self.job_title.clone().unwrap_or_default(),
            self.source.clone(),
            self.status.as_str().to_string(),
            self.rating.as_str().to_string(),
            self.score.to_string(),
            FieldValue::from(self.estimated_value).to_display_string(),
            self.owner.clone().unwrap_or_default(),
            self.notes.clone().unwrap_or_default(),
            self.tags.join(LIST_SEPARATOR),
        ]
    }

    fn example_row() -> &'static [&'static str] {
        &[
            "Sarah",
            "Chen",
            "sarah.chen@acme.com",
            "+1 555 0100",
            "Acme, Inc.",
            "VP Operations",
            "website",
            "new",
            "warm",
            "50",
            "25000",
            "alex",
            "Met at trade show",
            "enterprise;q3",
        ]
    }

    fn dedupe_key(&self) -> Option<String> {
        Some(normalize_email(&self.email))
    }
}

impl CsvRecord for Deal {
    const COLUMNS: &'static [&'static str] = &[
        "title",
        "value",
        "stage",
        "company",
        "contact_name",
        "contact_email",
        "expected_close_date",
        "owner",
        "source",
        "notes",
        "tags",
    ];
    const REQUIRED: &'static [&'static str] = &["title", "value"];

    fn from_row(row: &CsvRow<'_>, ctx: &ImportContext<'_>) -> Result<Self, String> {
        let title = row.required("title")?;
        row.required("value")?;
        let value = row.number("value")?.unwrap_or_default();
        if value < 0.0 {
            return Err("deal value cannot be negative".to_string());
        }
        let stage = match row.get("stage") {
            Some(id) => ctx
                .pipeline
                .stage(id)
                .ok_or_else(|| format!("unknown stage '{}'", id))?,
            None => ctx.pipeline.first_stage(),
        };

        let mut deal = Deal::new(title, value, &stage.id, stage.probability, ctx.now);
        deal.company = row.text("company");
        deal.contact_name = row.text("contact_name");
        deal.contact_email = email_cell(row, "contact_email", false)?;
        deal.expected_close_date = row.timestamp("expected_close_date")?;
        deal.owner = row.text("owner");
        deal.source = row.text("source");
        deal.notes = row.text("notes");
        deal.tags = row.list("tags");
        attach_extras(&mut deal, row, Self::COLUMNS);
        Ok(deal)
    }

    fn to_row(&self) -> Vec<String> {
        vec![
            self.title.clone(),
            FieldValue::Number(self.value).to_display_string(),
            self.stage.clone(),
            self.company.clone().unwrap_or_default(),
            self.contact_name.clone().unwrap_or_default(),
            self.contact_email.clone().unwrap_or_default(),
            self.expected_close_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            self.owner.clone().unwrap_or_default(),
            self.source.clone().unwrap_or_default(),
            self.notes.clone().unwrap_or_default(),
            self.tags.join(LIST_SEPARATOR),
        ]
    }

    fn example_row() -> &'static [&'static str] {
        &[
            "Acme platform renewal",
            "48000",
            "proposal",
            "Acme, Inc.",
            "Sarah Chen",
            "sarah.chen@acme.com",
            "2026-09-30",
            "alex",
            "referral",
            "Multi-year option on the table",
            "renewal",
        ]
    }
}

// =============================================================================
// Import
// =============================================================================

/// Parse `text` into records of type `R`.
pub fn import_csv<R: CsvRecord>(text: &str, ctx: &ImportContext<'_>) -> Result<ImportReport<R>, CrmError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let header: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    if header.iter().all(|h| h.is_empty()) {
        return Err(CrmError::Csv("missing header row".to_string()));
    }
    let mut seen = HashSet::new();
    for column in &header {
        if !column.is_empty() && !seen.insert(column.as_str()) {
            return Err(CrmError::Csv(format!("duplicate column '{}'", column)));
        }
    }
    let missing: Vec<&str> = R::REQUIRED
        .iter()
        .copied()
        .filter(|col| !header.iter().any(|h| h == col))
        .collect();
    if !missing.is_empty() {
        return Err(CrmError::Csv(format!(
            "missing required column{}: {}",
            plural(missing.len()),
            missing.join(", ")
        )));
    }

    let mut report = ImportReport::default();
    for (idx, result) in reader.records().enumerate() {
        // Header occupies line 1.
        let fallback_line = idx as u64 + 2;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                let line = e
                    .position()
                    .map(|p| p.line())
                    .unwrap_or(fallback_line);
                report.errors.push(RowError {
                    line,
                    message: e.to_string(),
                });
                continue;
            }
        };
        let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);

        if record.len() != header.len() {
            report.errors.push(RowError {
                line,
                message: format!(
                    "expected {} columns, found {}",
                    header.len(),
                    record.len()
                ),
            });
            continue;
        }

        let row = CsvRow {
            cells: header
                .iter()
                .map(String::as_str)
                .zip(record.iter())
                .filter(|(h, _)| !h.is_empty())
                .collect(),
        };
        match R::from_row(&row, ctx) {
            Ok(parsed) => report.imported.push(ImportedRow {
                line,
                record: parsed,
            }),
            Err(message) => report.errors.push(RowError { line, message }),
        }
    }

    log::info!(
        "CSV import ({}): {} ok, {} rejected",
        R::KIND,
        report.success_count(),
        report.error_count()
    );
    Ok(report)
}

/// Move imported rows that duplicate an existing record (or an earlier row)
/// into the error list.
pub fn reject_duplicates<R: CsvRecord>(existing: &[Arc<R>], report: &mut ImportReport<R>) {
    let mut keys: BTreeSet<String> = existing.iter().filter_map(|r| r.dedupe_key()).collect();
    let rows = std::mem::take(&mut report.imported);
    for row in rows {
        match row.record.dedupe_key() {
            Some(key) if !keys.insert(key.clone()) => report.errors.push(RowError {
                line: row.line,
                message: format!("duplicate of an existing record ({})", key),
            }),
            _ => report.imported.push(row),
        }
    }
    report.errors.sort_by_key(|e| e.line);
}

// =============================================================================
// Export
// =============================================================================

/// Render records as CSV. Custom fields become extra columns after the
/// known ones; fields containing commas, quotes or newlines are quoted.
pub fn export_csv<R: CsvRecord>(records: &[Arc<R>]) -> Result<String, CrmError> {
    let custom_columns: Vec<String> = records
        .iter()
        .flat_map(|r| r.custom_fields().keys().cloned())
        .filter(|k| !R::COLUMNS.contains(&k.as_str()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    let header: Vec<&str> = R::COLUMNS
        .iter()
        .copied()
        .chain(custom_columns.iter().map(String::as_str))
        .collect();
    writer.write_record(&header)?;

    for record in records {
        let mut row = record.to_row();
        for key in &custom_columns {
            row.push(
                record
                    .custom_fields()
                    .get(key)
                    .map(FieldValue::to_display_string)
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&row)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| CrmError::Csv(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| CrmError::Csv(e.to_string()))
}

/// Header row plus one example row.
pub fn template_csv<R: CsvRecord>() -> Result<String, CrmError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(R::COLUMNS)?;
    writer.write_record(R::example_row())?;
    let bytes = writer
        .into_inner()
        .map_err(|e| CrmError::Csv(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| CrmError::Csv(e.to_string()))
}
