//! Application state: the record collections and everything the views
//! derive from them.
//!
//! [`CrmState`] is a plain reducer. Every change goes through
//! [`CrmState::reduce`], which returns what must be persisted and what the
//! user should be told. [`AppState`] wraps it in a mutex together with the
//! injected collaborators (storage, notifications, insight provider, bulk
//! backend) and runs the async operations.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bulk::{apply_bulk, apply_bulk_update, BulkOperation, RecordPatch};
use crate::config::Config;
use crate::csv_io::{import_csv, reject_duplicates, CsvRecord, ImportContext, RowError};
use crate::error::{CrmError, ErrorClass};
use crate::filter::{view, visible_ids, Criteria};
use crate::insights::{
    assess_scores, build_deal_prompt, build_lead_prompt, build_pipeline_prompt, generate_insights,
    parse_insights, InsightBatch, InsightProvider, ParsedInsights, UnavailableProvider,
};
use crate::notification::{notify_bulk_complete, notify_failure, NoticeLevel, Notifier};
use crate::pipeline::{Stage, StagePipeline};
use crate::selection::SelectionSet;
use crate::store::{load_json, save_json, storage_key, KeyValueStore, RecordStore};
use crate::tasks::{BulkBackend, LocalBackend, ProgressSender, SingleFlight};
use crate::types::{Deal, Lead, LeadStatus, Record, RecordKind};

const STAGES_COLLECTION: &str = "stages";

// =============================================================================
// Reducer
// =============================================================================

/// A state change requested by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    SetCriteria { kind: RecordKind, criteria: Criteria },
    /// Run a text search. An empty query is rejected; clear the search
    /// through `SetCriteria` instead.
    Search { kind: RecordKind, query: String },
    ToggleSelection { kind: RecordKind, id: String },
    SelectAllVisible { kind: RecordKind },
    ClearSelection { kind: RecordKind },
    AddLead { lead: Lead },
    AddDeal { deal: Deal },
    EditRecord { kind: RecordKind, id: String, patch: RecordPatch },
    MoveDeal { deal_id: String, stage_id: String },
    ConvertLead { lead_id: String, value: f64 },
    /// Apply a bulk operation to the current selection synchronously.
    ApplyBulk { kind: RecordKind, op: BulkOperation },
    ImportCsv { kind: RecordKind, text: String },
    AdvanceDwell { days: u32 },
    SetStageProbability { stage_id: String, probability: u8 },
}

/// Message for the user produced by a reduction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
    /// Per-item problems, e.g. rejected CSV rows.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.to_string(),
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Notice for a guard that rejected a request before any work.
    fn from_guard(err: &CrmError) -> Self {
        Notice::new(NoticeLevel::Info, &err.to_string(), err.recovery_suggestion())
    }
}

/// Collections touched by a reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dirty {
    pub leads: bool,
    pub deals: bool,
    pub stages: bool,
}

impl Dirty {
    pub fn of(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Lead => Dirty {
                leads: true,
                ..Dirty::default()
            },
            RecordKind::Deal => Dirty {
                deals: true,
                ..Dirty::default()
            },
        }
    }

    pub fn is_clean(&self) -> bool {
        !(self.leads || self.deals || self.stages)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reduced {
    pub dirty: Dirty,
    pub notice: Option<Notice>,
}

impl Reduced {
    fn clean() -> Self {
        Self::default()
    }

    fn dirty(dirty: Dirty) -> Self {
        Self {
            dirty,
            notice: None,
        }
    }

    fn with_notice(mut self, notice: Notice) -> Self {
        self.notice = Some(notice);
        self
    }
}

/// Leads, deals, pipeline and the per-collection view state.
#[derive(Debug, Clone)]
pub struct CrmState {
    tenant_id: String,
    pub leads: RecordStore<Lead>,
    pub deals: RecordStore<Deal>,
    pub pipeline: StagePipeline,
    lead_criteria: Criteria,
    deal_criteria: Criteria,
    lead_selection: SelectionSet,
    deal_selection: SelectionSet,
}

impl CrmState {
    pub fn new(tenant_id: &str, pipeline: StagePipeline) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            leads: RecordStore::new(tenant_id),
            deals: RecordStore::new(tenant_id),
            pipeline,
            lead_criteria: Criteria::default(),
            deal_criteria: Criteria::default(),
            lead_selection: SelectionSet::new(),
            deal_selection: SelectionSet::new(),
        }
    }

    /// Load the tenant's collections. Stored stages win over `pipeline`;
    /// unusable stored stages are logged and ignored. Storage errors fail
    /// the load.
    pub fn load(kv: &dyn KeyValueStore, tenant_id: &str, pipeline: StagePipeline) -> Result<Self, CrmError> {
        let stored: Option<Vec<Stage>> = load_json(kv, &storage_key(tenant_id, STAGES_COLLECTION))?;
        let pipeline = match stored.map(StagePipeline::new) {
            Some(Ok(stored)) => stored,
            Some(Err(e)) => {
                log::warn!("Ignoring stored stages for {}: {}", tenant_id, e);
                pipeline
            }
            None => pipeline,
        };
        Ok(Self {
            leads: RecordStore::load(kv, tenant_id)?,
            deals: RecordStore::load(kv, tenant_id)?,
            pipeline,
            ..Self::new(tenant_id, StagePipeline::default_stages())
        })
    }

    pub fn persist(&self, kv: &dyn KeyValueStore, dirty: Dirty) -> Result<(), CrmError> {
        if dirty.leads {
            self.leads.persist(kv)?;
        }
        if dirty.deals {
            self.deals.persist(kv)?;
        }
        if dirty.stages {
            save_json(
                kv,
                &storage_key(&self.tenant_id, STAGES_COLLECTION),
                self.pipeline.stages(),
            )?;
        }
        Ok(())
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn criteria(&self, kind: RecordKind) -> &Criteria {
        match kind {
            RecordKind::Lead => &self.lead_criteria,
            RecordKind::Deal => &self.deal_criteria,
        }
    }

    pub fn selection(&self, kind: RecordKind) -> &SelectionSet {
        match kind {
            RecordKind::Lead => &self.lead_selection,
            RecordKind::Deal => &self.deal_selection,
        }
    }

    pub fn lead_view(&self) -> Vec<Arc<Lead>> {
        view(self.leads.records(), &self.lead_criteria)
    }

    pub fn deal_view(&self) -> Vec<Arc<Deal>> {
        view(self.deals.records(), &self.deal_criteria)
    }

    pub fn visible_ids(&self, kind: RecordKind) -> Vec<String> {
        match kind {
            RecordKind::Lead => visible_ids(&self.lead_view()),
            RecordKind::Deal => visible_ids(&self.deal_view()),
        }
    }

    /// Apply one action. No-op guards (empty selection, empty patch, empty
    /// search) come back as an info [`Notice`], not an error; the state is
    /// left untouched either way when something is rejected.
    pub fn reduce(&mut self, action: Action, now: DateTime<Utc>) -> Result<Reduced, CrmError> {
        match self.apply(action, now) {
            Err(e) if e.class() == ErrorClass::NoOp => {
                log::debug!("Guard rejected action: {}", e);
                Ok(Reduced::clean().with_notice(Notice::from_guard(&e)))
            }
            other => other,
        }
    }

    fn apply(&mut self, action: Action, now: DateTime<Utc>) -> Result<Reduced, CrmError> {
        match action {
            Action::SetCriteria { kind, criteria } => {
                match kind {
                    RecordKind::Lead => criteria.validate::<Lead>()?,
                    RecordKind::Deal => criteria.validate::<Deal>()?,
                }
                *self.criteria_mut(kind) = criteria;
                Ok(Reduced::clean())
            }
            Action::Search { kind, query } => {
                let query = query.trim();
                if query.is_empty() {
                    return Err(CrmError::EmptySearch);
                }
                self.criteria_mut(kind).text_query = query.to_string();
                Ok(Reduced::clean())
            }
            Action::ToggleSelection { kind, id } => {
                self.selection_mut(kind).toggle(&id);
                Ok(Reduced::clean())
            }
            Action::SelectAllVisible { kind } => {
                let visible = self.visible_ids(kind);
                self.selection_mut(kind).select_all(visible);
                Ok(Reduced::clean())
            }
            Action::ClearSelection { kind } => {
                self.selection_mut(kind).clear();
                Ok(Reduced::clean())
            }
            Action::AddLead { lead } => {
                self.leads.insert(lead)?;
                Ok(Reduced::dirty(Dirty::of(RecordKind::Lead)))
            }
            Action::AddDeal { deal } => {
                if self.pipeline.stage(&deal.stage).is_none() {
                    return Err(CrmError::StageNotFound(deal.stage));
                }
                self.deals.insert(deal)?;
                Ok(Reduced::dirty(Dirty::of(RecordKind::Deal)))
            }
            Action::EditRecord { kind, id, patch } => {
                match kind {
                    RecordKind::Lead => self.leads.update(&id, &patch, now).map(|_| ())?,
                    RecordKind::Deal => self.deals.update(&id, &patch, now).map(|_| ())?,
                }
                Ok(Reduced::dirty(Dirty::of(kind)))
            }
            Action::MoveDeal { deal_id, stage_id } => {
                let moved = self
                    .pipeline
                    .move_deal(self.deals.records(), &deal_id, &stage_id, now)?;
                self.deals.replace(moved);
                Ok(Reduced::dirty(Dirty::of(RecordKind::Deal)))
            }
            Action::ConvertLead { lead_id, value } => self.convert_lead(&lead_id, value, now),
            Action::ApplyBulk { kind, op } => {
                let ids = self.selection(kind).ids().clone();
                let affected = self.apply_bulk_ids(kind, &ids, &op, now)?;
                Ok(Reduced::dirty(Dirty::of(kind)).with_notice(bulk_notice(kind, &op, affected)))
            }
            Action::ImportCsv { kind, text } => {
                let notice = match kind {
                    RecordKind::Lead => import_into(&mut self.leads, &self.pipeline, &text, now)?,
                    RecordKind::Deal => import_into(&mut self.deals, &self.pipeline, &text, now)?,
                };
                Ok(Reduced::dirty(Dirty::of(kind)).with_notice(notice))
            }
            Action::AdvanceDwell { days } => {
                let next = self.pipeline.advance_dwell(self.deals.records(), days);
                self.deals.replace(next);
                Ok(Reduced::dirty(Dirty::of(RecordKind::Deal)))
            }
            Action::SetStageProbability {
                stage_id,
                probability,
            } => {
                self.pipeline.set_stage_probability(&stage_id, probability)?;
                Ok(Reduced::dirty(Dirty {
                    stages: true,
                    ..Dirty::default()
                }))
            }
        }
    }

    fn criteria_mut(&mut self, kind: RecordKind) -> &mut Criteria {
        match kind {
            RecordKind::Lead => &mut self.lead_criteria,
            RecordKind::Deal => &mut self.deal_criteria,
        }
    }

    fn selection_mut(&mut self, kind: RecordKind) -> &mut SelectionSet {
        match kind {
            RecordKind::Lead => &mut self.lead_selection,
            RecordKind::Deal => &mut self.deal_selection,
        }
    }

    /// Apply `op` to `ids` against the current collection and clear the
    /// selection. On error nothing changes.
    pub fn apply_bulk_ids(
        &mut self,
        kind: RecordKind,
        ids: &BTreeSet<String>,
        op: &BulkOperation,
        now: DateTime<Utc>,
    ) -> Result<usize, CrmError> {
        let affected = match kind {
            RecordKind::Lead => bulk_into(&mut self.leads, ids, op, now)?,
            RecordKind::Deal => bulk_into(&mut self.deals, ids, op, now)?,
        };
        self.selection_mut(kind).clear();
        log::info!("Bulk {} applied to {} {}", op.label(), affected, kind.collection());
        Ok(affected)
    }

    /// Check `op` would apply to `ids` without changing anything.
    fn dry_run_bulk(
        &self,
        kind: RecordKind,
        ids: &BTreeSet<String>,
        op: &BulkOperation,
        now: DateTime<Utc>,
    ) -> Result<(), CrmError> {
        match kind {
            RecordKind::Lead => apply_bulk(self.leads.records(), ids, op, now).map(|_| ()),
            RecordKind::Deal => apply_bulk(self.deals.records(), ids, op, now).map(|_| ()),
        }
    }

    /// Open a deal from a lead and mark the lead converted.
    fn convert_lead(&mut self, lead_id: &str, value: f64, now: DateTime<Utc>) -> Result<Reduced, CrmError> {
        let lead = self
            .leads
            .get(lead_id)
            .cloned()
            .ok_or_else(|| CrmError::RecordNotFound(lead_id.to_string()))?;
        if value < 0.0 {
            return Err(CrmError::InvalidValue {
                field: "value".to_string(),
                reason: "deal value cannot be negative".to_string(),
            });
        }
        let deal = self.pipeline.deal_from_lead(&lead, value, now);
        let title = deal.title.clone();
        self.deals.insert(deal)?;
        let patch = RecordPatch::new().set("status", LeadStatus::Converted.as_str());
        self.leads.update(lead_id, &patch, now)?;
        log::info!("Converted lead {} into deal '{}'", lead_id, title);
        Ok(Reduced::dirty(Dirty {
            leads: true,
            deals: true,
            stages: false,
        })
        .with_notice(Notice::new(
            NoticeLevel::Success,
            "Lead converted",
            format!("Created deal '{}'", title),
        )))
    }

    /// Write per-lead patches (AI scores). Leads deleted in the meantime
    /// are skipped. Returns how many leads changed.
    pub fn apply_lead_patches(&mut self, patches: &[(String, RecordPatch)], now: DateTime<Utc>) -> usize {
        let mut records = self.leads.records().to_vec();
        let mut updated = 0;
        for (id, patch) in patches {
            if self.leads.get(id).is_none() {
                log::debug!("Lead {} disappeared before its score landed", id);
                continue;
            }
            let ids: BTreeSet<String> = std::iter::once(id.clone()).collect();
            match apply_bulk_update(&records, &ids, patch, now) {
                Ok(next) => {
                    records = next;
                    updated += 1;
                }
                Err(e) => log::warn!("Score patch for lead {} rejected: {}", id, e),
            }
        }
        self.leads.replace(records);
        updated
    }
}

fn bulk_into<R: Record>(
    store: &mut RecordStore<R>,
    ids: &BTreeSet<String>,
    op: &BulkOperation,
    now: DateTime<Utc>,
) -> Result<usize, CrmError> {
    let outcome = apply_bulk(store.records(), ids, op, now)?;
    store.replace(outcome.records);
    Ok(outcome.affected)
}

fn bulk_notice(kind: RecordKind, op: &BulkOperation, affected: usize) -> Notice {
    let verb = match op {
        BulkOperation::Update { .. } => "updated",
        BulkOperation::Delete => "deleted",
    };
    Notice::new(
        NoticeLevel::Success,
        "Bulk action complete",
        format!("{} {} {}", affected, kind.collection(), verb),
    )
}

/// Import CSV rows into `store`. Row problems land in the notice details.
fn import_into<R: CsvRecord>(
    store: &mut RecordStore<R>,
    pipeline: &StagePipeline,
    text: &str,
    now: DateTime<Utc>,
) -> Result<Notice, CrmError> {
    let ctx = ImportContext { now, pipeline };
    let mut report = import_csv::<R>(text, &ctx)?;
    reject_duplicates(store.records(), &mut report);

    let mut errors: Vec<RowError> = std::mem::take(&mut report.errors);
    let mut imported = 0;
    for row in report.imported {
        match store.insert(row.record) {
            Ok(_) => imported += 1,
            Err(e) => errors.push(RowError {
                line: row.line,
                message: e.to_string(),
            }),
        }
    }
    errors.sort_by_key(|e| e.line);

    let level = if imported == 0 && !errors.is_empty() {
        NoticeLevel::Error
    } else {
        NoticeLevel::Success
    };
    let mut notice = Notice::new(
        level,
        "Import finished",
        format!("Imported {} {}, {} rejected", imported, R::KIND.collection(), errors.len()),
    );
    notice.details = errors
        .iter()
        .map(|e| format!("line {}: {}", e.line, e.message))
        .collect();
    Ok(notice)
}

// =============================================================================
// Application container
// =============================================================================

/// Outcome of an AI score recalculation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRecalculation {
    pub updated: usize,
    pub failed: usize,
}

/// Shared application state with its injected collaborators.
pub struct AppState {
    state: Mutex<CrmState>,
    kv: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    provider: Arc<dyn InsightProvider>,
    backend: Arc<dyn BulkBackend>,
    bulk_flight: SingleFlight,
    scoring_flight: SingleFlight,
    max_batch: usize,
}

impl AppState {
    /// Load the configured tenant from `kv`. The insight provider defaults
    /// to [`UnavailableProvider`] and the backend to [`LocalBackend`].
    pub fn new(config: &Config, kv: Arc<dyn KeyValueStore>, notifier: Arc<dyn Notifier>) -> Result<Self, CrmError> {
        let pipeline = config.pipeline().map_err(CrmError::InvalidStages)?;
        let state = CrmState::load(kv.as_ref(), &config.tenant_id, pipeline)?;
        Ok(Self {
            state: Mutex::new(state),
            kv,
            notifier,
            provider: Arc::new(UnavailableProvider),
            backend: Arc::new(LocalBackend::new(&config.bulk)),
            bulk_flight: SingleFlight::new("bulk operation"),
            scoring_flight: SingleFlight::new("score recalculation"),
            max_batch: config.insights.max_batch,
        })
    }

    pub fn with_provider(mut self, provider: Arc<dyn InsightProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn BulkBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Read the state under the lock.
    pub fn read<T>(&self, f: impl FnOnce(&CrmState) -> T) -> T {
        f(&self.state.lock())
    }

    pub fn is_bulk_running(&self) -> bool {
        self.bulk_flight.is_busy()
    }

    /// Persist `next` and make it the live state. On a storage error the
    /// live state stays as it was and its collections are written back over
    /// anything the failed persist got through.
    fn commit(&self, live: &mut CrmState, next: CrmState, dirty: Dirty) -> Result<(), CrmError> {
        if !dirty.is_clean() {
            if let Err(e) = next.persist(self.kv.as_ref(), dirty) {
                log::error!("Failed to persist state: {}", e);
                if let Err(restore) = live.persist(self.kv.as_ref(), dirty) {
                    log::error!("Failed to restore stored state: {}", restore);
                }
                return Err(e);
            }
        }
        *live = next;
        Ok(())
    }

    /// Reduce, persist what changed, and surface the notice. The reduction
    /// runs on a copy, so a failed save leaves the state untouched.
    pub fn dispatch(&self, action: Action) -> Result<Reduced, CrmError> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let reduced = match next.reduce(action, Utc::now()) {
            Ok(reduced) => reduced,
            Err(e) => {
                drop(state);
                notify_failure(self.notifier.as_ref(), "action", &e);
                return Err(e);
            }
        };
        if let Err(e) = self.commit(&mut state, next, reduced.dirty) {
            drop(state);
            notify_failure(self.notifier.as_ref(), "save", &e);
            return Err(e);
        }
        drop(state);
        if let Some(notice) = &reduced.notice {
            self.notifier.notify(notice.level, &notice.title, &notice.message);
        }
        Ok(reduced)
    }

    /// Commit a bulk operation on the current selection through the backend,
    /// then apply it to the collection as it stands at completion.
    ///
    /// Returns the number of records affected; 0 when a guard rejected the
    /// request. On failure nothing changes and the selection is kept.
    pub async fn run_bulk(
        &self,
        kind: RecordKind,
        op: BulkOperation,
        progress: Option<ProgressSender>,
    ) -> Result<usize, CrmError> {
        let _flight = match self.bulk_flight.try_start() {
            Ok(guard) => guard,
            Err(e) => {
                self.notifier.info("Please wait", e.recovery_suggestion());
                return Err(e);
            }
        };

        let ids: BTreeSet<String> = {
            let state = self.state.lock();
            let ids = state.selection(kind).ids().clone();
            if let Err(e) = state.dry_run_bulk(kind, &ids, &op, Utc::now()) {
                drop(state);
                if e.class() == ErrorClass::NoOp {
                    let notice = Notice::from_guard(&e);
                    self.notifier.notify(notice.level, &notice.title, &notice.message);
                    return Ok(0);
                }
                notify_failure(self.notifier.as_ref(), op.label(), &e);
                return Err(e);
            }
            ids
        };

        let id_list: Vec<String> = ids.iter().cloned().collect();
        log::info!("Starting bulk {} of {} {}", op.label(), id_list.len(), kind.collection());
        if let Err(e) = self
            .backend
            .commit(kind, &op, &id_list, progress.as_ref())
            .await
        {
            log::warn!("Bulk {} failed: {}", op.label(), e);
            notify_failure(self.notifier.as_ref(), op.label(), &e);
            return Err(e);
        }

        let applied = {
            let mut state = self.state.lock();
            let mut next = state.clone();
            match next.apply_bulk_ids(kind, &ids, &op, Utc::now()) {
                Ok(affected) => self
                    .commit(&mut state, next, Dirty::of(kind))
                    .map(|()| affected),
                Err(e) => Err(e),
            }
        };
        let affected = match applied {
            Ok(affected) => affected,
            Err(e) => {
                log::warn!("Bulk {} could not be applied: {}", op.label(), e);
                notify_failure(self.notifier.as_ref(), op.label(), &e);
                return Err(e);
            }
        };
        notify_bulk_complete(self.notifier.as_ref(), op.label(), kind.collection(), affected);
        Ok(affected)
    }

    /// Rescore leads through the insight provider. Leads that fail are
    /// skipped; the rest are patched.
    pub async fn recalculate_scores(&self) -> Result<ScoreRecalculation, CrmError> {
        let _flight = self.scoring_flight.try_start()?;
        let leads = self.read(|s| s.leads.records().to_vec());
        let batch = assess_scores(self.provider.as_ref(), &leads, self.max_batch).await;

        let applied = {
            let mut state = self.state.lock();
            let mut next = state.clone();
            let updated = next.apply_lead_patches(&batch.patches, Utc::now());
            let dirty = if updated > 0 {
                Dirty::of(RecordKind::Lead)
            } else {
                Dirty::default()
            };
            self.commit(&mut state, next, dirty).map(|()| updated)
        };
        let updated = match applied {
            Ok(updated) => updated,
            Err(e) => {
                notify_failure(self.notifier.as_ref(), "score recalculation", &e);
                return Err(e);
            }
        };
        let result = ScoreRecalculation {
            updated,
            failed: batch.failures.len(),
        };
        if result.failed > 0 && result.updated == 0 {
            self.notifier.error(
                "Score recalculation failed",
                &format!("{} leads could not be scored", result.failed),
            );
        } else {
            self.notifier.success(
                "Scores updated",
                &format!("{} updated, {} skipped", result.updated, result.failed),
            );
        }
        Ok(result)
    }

    /// Insights for the leads in the current view.
    pub async fn lead_insights(&self) -> InsightBatch {
        let leads = self.read(|s| s.lead_view());
        generate_insights(self.provider.as_ref(), &leads, self.max_batch, |l: &Lead| {
            build_lead_prompt(l)
        })
        .await
    }

    /// Insights for the deals in the current view.
    pub async fn deal_insights(&self) -> InsightBatch {
        let (deals, pipeline) = self.read(|s| (s.deal_view(), s.pipeline.clone()));
        generate_insights(self.provider.as_ref(), &deals, self.max_batch, |d: &Deal| {
            build_deal_prompt(d, pipeline.stage(&d.stage))
        })
        .await
    }

    /// Insights over the whole pipeline.
    pub async fn pipeline_insights(&self) -> Result<ParsedInsights, CrmError> {
        let prompt = self.read(|s| build_pipeline_prompt(&s.pipeline, s.deals.records()));
        let response = self.provider.complete(&prompt).await?;
        parse_insights(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ScoreRange;
    use crate::insights::mock::ScriptedProvider;
    use crate::notification::recording::RecordingNotifier;
    use crate::store::testing::FlakyStore;
    use crate::store::MemoryStore;
    use crate::tasks::testing::{FailingBackend, GatedBackend};
    use crate::test_utils::{deal, lead, ts};
    use crate::types::WON_STAGE;

    fn seeded() -> CrmState {
        let mut state = CrmState::new("Acme", StagePipeline::default_stages());
        for i in 1..=5u32 {
            state
                .leads
                .insert(lead(&format!("l{}", i), "First", "Last", (i * 10) as u8, ts(2026, 1, i)))
                .expect("insert");
        }
        state
            .deals
            .insert(deal("d1", "lead", 1000.0, ts(2026, 1, 1)))
            .expect("insert");
        state
    }

    fn select(state: &mut CrmState, kind: RecordKind, ids: &[&str]) {
        for id in ids {
            state
                .reduce(
                    Action::ToggleSelection {
                        kind,
                        id: id.to_string(),
                    },
                    ts(2026, 2, 1),
                )
                .expect("toggle");
        }
    }

    #[test]
    fn test_bulk_delete_clears_selection() {
        let mut state = seeded();
        select(&mut state, RecordKind::Lead, &["l1", "l3", "ghost-a", "ghost-b"]);
        let reduced = state
            .reduce(
                Action::ApplyBulk {
                    kind: RecordKind::Lead,
                    op: BulkOperation::Delete,
                },
                ts(2026, 2, 1),
            )
            .expect("bulk");
        assert_eq!(state.leads.len(), 3);
        assert!(state.selection(RecordKind::Lead).is_empty());
        assert!(reduced.dirty.leads);
        assert_eq!(reduced.notice.expect("notice").message, "2 leads deleted");
    }

    #[test]
    fn test_empty_selection_is_a_notice_not_an_error() {
        let mut state = seeded();
        let reduced = state
            .reduce(
                Action::ApplyBulk {
                    kind: RecordKind::Lead,
                    op: BulkOperation::Delete,
                },
                ts(2026, 2, 1),
            )
            .expect("guard");
        assert!(reduced.dirty.is_clean());
        assert_eq!(reduced.notice.expect("notice").level, NoticeLevel::Info);
        assert_eq!(state.leads.len(), 5);
    }

    #[test]
    fn test_empty_search_is_rejected_before_work() {
        let mut state = seeded();
        let reduced = state
            .reduce(
                Action::Search {
                    kind: RecordKind::Lead,
                    query: "   ".to_string(),
                },
                ts(2026, 2, 1),
            )
            .expect("guard");
        assert!(reduced.notice.is_some());
        assert_eq!(state.criteria(RecordKind::Lead).text_query, "");
    }

    #[test]
    fn test_failed_bulk_update_keeps_selection() {
        let mut state = seeded();
        select(&mut state, RecordKind::Lead, &["l1", "l2"]);
        let err = state
            .reduce(
                Action::ApplyBulk {
                    kind: RecordKind::Lead,
                    op: BulkOperation::Update {
                        fields: RecordPatch::new().set("created_at", "2020-01-01"),
                    },
                },
                ts(2026, 2, 1),
            )
            .unwrap_err();
        assert!(matches!(err, CrmError::ImmutableField(_)));
        assert_eq!(state.selection(RecordKind::Lead).len(), 2);
    }

    #[test]
    fn test_select_all_uses_current_view_and_survives_refilter() {
        let mut state = seeded();
        state
            .reduce(
                Action::SetCriteria {
                    kind: RecordKind::Lead,
                    criteria: Criteria {
                        score_range: Some(ScoreRange { min: 30.0, max: 100.0 }),
                        ..Criteria::default()
                    },
                },
                ts(2026, 2, 1),
            )
            .expect("criteria");
        state
            .reduce(Action::SelectAllVisible { kind: RecordKind::Lead }, ts(2026, 2, 1))
            .expect("select all");
        assert_eq!(state.selection(RecordKind::Lead).len(), 3);

        state
            .reduce(
                Action::SetCriteria {
                    kind: RecordKind::Lead,
                    criteria: Criteria {
                        score_range: Some(ScoreRange { min: 50.0, max: 100.0 }),
                        ..Criteria::default()
                    },
                },
                ts(2026, 2, 1),
            )
            .expect("criteria");
        assert_eq!(state.lead_view().len(), 1);
        assert_eq!(state.selection(RecordKind::Lead).len(), 3);
    }

    #[test]
    fn test_invalid_criteria_rejected() {
        let mut state = seeded();
        let err = state
            .reduce(
                Action::SetCriteria {
                    kind: RecordKind::Lead,
                    criteria: Criteria {
                        score_range: Some(ScoreRange { min: 90.0, max: 10.0 }),
                        ..Criteria::default()
                    },
                },
                ts(2026, 2, 1),
            )
            .unwrap_err();
        assert!(matches!(err, CrmError::InvalidCriteria(_)));
    }

    #[test]
    fn test_move_deal_and_aggregates() {
        let mut state = seeded();
        state
            .reduce(
                Action::MoveDeal {
                    deal_id: "d1".to_string(),
                    stage_id: WON_STAGE.to_string(),
                },
                ts(2026, 2, 1),
            )
            .expect("move");
        let d1 = state.deals.get("d1").expect("d1");
        assert_eq!(d1.probability, 100);
        let metrics = state.pipeline.aggregates(state.deals.records());
        let won = metrics.iter().find(|m| m.stage_id == WON_STAGE).expect("won");
        assert_eq!(won.deal_count, 1);
        let origin = metrics.iter().find(|m| m.stage_id == "lead").expect("lead");
        assert_eq!(origin.deal_count, 0);
    }

    #[test]
    fn test_convert_lead() {
        let mut state = seeded();
        let reduced = state
            .reduce(
                Action::ConvertLead {
                    lead_id: "l2".to_string(),
                    value: 5000.0,
                },
                ts(2026, 2, 1),
            )
            .expect("convert");
        assert!(reduced.dirty.leads && reduced.dirty.deals);
        assert_eq!(state.leads.get("l2").expect("l2").status, LeadStatus::Converted);
        assert_eq!(state.deals.len(), 2);
        assert!(state
            .deals
            .records()
            .iter()
            .any(|d| d.lead_id.as_deref() == Some("l2")));
    }

    #[test]
    fn test_import_csv_row_errors_do_not_change_collection() {
        let mut state = seeded();
        let reduced = state
            .reduce(
                Action::ImportCsv {
                    kind: RecordKind::Lead,
                    text: "first_name,last_name,email\nAda,Lovelace,\n".to_string(),
                },
                ts(2026, 2, 1),
            )
            .expect("import");
        assert_eq!(state.leads.len(), 5);
        let notice = reduced.notice.expect("notice");
        assert_eq!(notice.level, NoticeLevel::Error);
        assert_eq!(notice.details.len(), 1);
    }

    #[test]
    fn test_import_csv_rejects_existing_email() {
        let mut state = seeded();
        let reduced = state
            .reduce(
                Action::ImportCsv {
                    kind: RecordKind::Lead,
                    text: "first_name,last_name,email\nDup,Licate,L1@example.com\nNew,Person,new@example.com\n"
                        .to_string(),
                },
                ts(2026, 2, 1),
            )
            .expect("import");
        assert_eq!(state.leads.len(), 6);
        assert_eq!(reduced.notice.expect("notice").details.len(), 1);
    }

    #[test]
    fn test_stage_probability_change_persists_and_reloads() {
        let kv = MemoryStore::new();
        let mut state = seeded();
        let reduced = state
            .reduce(
                Action::SetStageProbability {
                    stage_id: "lead".to_string(),
                    probability: 15,
                },
                ts(2026, 2, 1),
            )
            .expect("probability");
        assert!(reduced.dirty.stages);
        assert_eq!(state.deals.get("d1").expect("d1").probability, 10);
        state
            .persist(&kv, Dirty { leads: true, deals: true, stages: true })
            .expect("persist");

        let reloaded = CrmState::load(&kv, "Acme", StagePipeline::default_stages()).expect("load");
        assert_eq!(reloaded.pipeline.stage("lead").expect("lead").probability, 15);
        assert_eq!(reloaded.leads.len(), 5);
        assert_eq!(reloaded.deals.len(), 1);
    }

    // --- AppState ---

    fn app(backend: Arc<dyn BulkBackend>) -> (AppState, Arc<RecordingNotifier>, Arc<MemoryStore>) {
        let kv = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let config = Config {
            tenant_id: "Acme".to_string(),
            ..Config::default()
        };
        let app = AppState::new(&config, kv.clone(), notifier.clone())
            .expect("app")
            .with_backend(backend);
        {
            let mut state = app.state.lock();
            *state = seeded();
        }
        (app, notifier, kv)
    }

    fn flaky_app(kv: Arc<FlakyStore>) -> (AppState, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let config = Config {
            tenant_id: "Acme".to_string(),
            ..Config::default()
        };
        let app = AppState::new(&config, kv, notifier.clone()).expect("app");
        {
            let mut state = app.state.lock();
            *state = seeded();
        }
        (app, notifier)
    }

    fn select_in(app: &AppState, ids: &[&str]) {
        for id in ids {
            app.dispatch(Action::ToggleSelection {
                kind: RecordKind::Lead,
                id: id.to_string(),
            })
            .expect("toggle");
        }
    }

    #[tokio::test]
    async fn test_run_bulk_applies_to_state_at_completion() {
        let backend = Arc::new(GatedBackend::default());
        let started = backend.started.clone();
        let release = backend.release.clone();
        let (app, notifier, kv) = app(backend);
        select_in(&app, &["l1", "l2"]);

        let (result, _) = tokio::join!(
            app.run_bulk(RecordKind::Lead, BulkOperation::Delete, None),
            async {
                started.notified().await;
                // Edits made while the commit is in flight.
                app.dispatch(Action::AddLead {
                    lead: lead("l9", "Late", "Arrival", 70, ts(2026, 2, 1)),
                })
                .expect("add");
                app.dispatch(Action::EditRecord {
                    kind: RecordKind::Lead,
                    id: "l3".to_string(),
                    patch: RecordPatch::new().set("notes", "called"),
                })
                .expect("edit");
                assert!(app.is_bulk_running());
                release.notify_one();
            }
        );

        assert_eq!(result.expect("bulk"), 2);
        app.read(|s| {
            assert_eq!(s.leads.len(), 4);
            assert!(s.leads.get("l9").is_some());
            assert_eq!(s.leads.get("l3").and_then(|l| l.notes.clone()).as_deref(), Some("called"));
            assert!(s.leads.get("l1").is_none());
            assert!(s.selection(RecordKind::Lead).is_empty());
        });
        assert_eq!(notifier.levels().last(), Some(&NoticeLevel::Success));
        let stored = kv.load("acme.leads").expect("load").expect("persisted");
        assert!(stored.contains("\"l9\""));
        assert!(!app.is_bulk_running());
    }

    #[tokio::test]
    async fn test_run_bulk_rejects_second_start_while_busy() {
        let backend = Arc::new(GatedBackend::default());
        let started = backend.started.clone();
        let release = backend.release.clone();
        let (app, _notifier, _kv) = app(backend);
        select_in(&app, &["l1"]);

        let (first, second) = tokio::join!(
            app.run_bulk(RecordKind::Lead, BulkOperation::Delete, None),
            async {
                started.notified().await;
                let second = app.run_bulk(RecordKind::Lead, BulkOperation::Delete, None).await;
                release.notify_one();
                second
            }
        );
        assert_eq!(first.expect("first"), 1);
        assert!(matches!(second, Err(CrmError::Busy)));
    }

    #[tokio::test]
    async fn test_run_bulk_failure_changes_nothing() {
        let (app, notifier, kv) = app(Arc::new(FailingBackend));
        select_in(&app, &["l1", "l2"]);

        let err = app
            .run_bulk(RecordKind::Lead, BulkOperation::Delete, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::BulkFailed(_)));
        app.read(|s| {
            assert_eq!(s.leads.len(), 5);
            assert_eq!(s.selection(RecordKind::Lead).len(), 2);
        });
        let (level, title, _) = notifier.last().expect("notified");
        assert_eq!(level, NoticeLevel::Error);
        assert_eq!(title, "Delete failed");
        assert_eq!(kv.load("acme.leads").expect("load"), None);
    }

    #[tokio::test]
    async fn test_run_bulk_empty_selection_is_noop() {
        let (app, notifier, _kv) = app(Arc::new(LocalBackend::default()));
        let affected = app
            .run_bulk(RecordKind::Lead, BulkOperation::Delete, None)
            .await
            .expect("guard");
        assert_eq!(affected, 0);
        assert_eq!(notifier.levels(), vec![NoticeLevel::Info]);
    }

    #[tokio::test]
    async fn test_run_bulk_update_reports_progress() {
        let (app, _notifier, _kv) = app(Arc::new(LocalBackend::default()));
        select_in(&app, &["l4", "l5"]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let op = BulkOperation::Update {
            fields: RecordPatch::new().set("status", "qualified"),
        };
        assert_eq!(app.run_bulk(RecordKind::Lead, op, Some(tx)).await.expect("bulk"), 2);

        let mut last = None;
        while let Some(p) = rx.recv().await {
            last = Some(p);
        }
        let last = last.expect("progress");
        assert_eq!(last.completed, 2);
        assert_eq!(last.fraction(), 1.0);
        app.read(|s| {
            assert_eq!(s.leads.get("l4").expect("l4").status, LeadStatus::Qualified);
            assert_eq!(s.leads.get("l1").expect("l1").status, LeadStatus::New);
        });
    }

    #[tokio::test]
    async fn test_recalculate_scores_skips_failures() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(r#"{"score": 88, "rating": "hot", "reasoning": "budget approved"}"#.to_string()),
            Err(CrmError::ProviderUnavailable("timeout".to_string())),
            Ok("no idea".to_string()),
        ]));
        let (app, notifier, _kv) = app(Arc::new(LocalBackend::default()));
        let app = app.with_provider(provider);

        let result = app.recalculate_scores().await.expect("recalculate");
        assert_eq!(result.updated, 1);
        // two explicit failures plus two leads the exhausted script rejects
        assert_eq!(result.failed, 4);
        app.read(|s| {
            let l1 = s.leads.get("l1").expect("l1");
            assert_eq!(l1.score, 88);
            assert_eq!(s.leads.get("l2").expect("l2").score, 20);
        });
        assert_eq!(notifier.levels().last(), Some(&NoticeLevel::Success));
    }

    #[test]
    fn test_load_failure_does_not_overwrite_stored_leads() {
        let kv = Arc::new(FlakyStore::default());
        let mut stored = CrmState::new("Acme", StagePipeline::default_stages());
        for id in ["l1", "l2", "l3"] {
            stored.leads.insert(lead(id, "First", "Last", 50, ts(2026, 1, 1))).expect("insert");
        }
        stored.persist(kv.as_ref(), Dirty::of(RecordKind::Lead)).expect("persist");

        let config = Config {
            tenant_id: "Acme".to_string(),
            ..Config::default()
        };
        kv.set_fail_loads(true);
        let notifier = Arc::new(RecordingNotifier::default());
        let err = AppState::new(&config, kv.clone(), notifier.clone()).err().expect("load error");
        assert!(matches!(err, CrmError::Storage(_)));

        kv.set_fail_loads(false);
        let app = AppState::new(&config, kv.clone(), notifier).expect("app");
        app.dispatch(Action::AddLead {
            lead: lead("l4", "New", "Lead", 40, ts(2026, 2, 1)),
        })
        .expect("add");
        let raw = kv.load("acme.leads").expect("load").expect("stored");
        let leads: Vec<Lead> = serde_json::from_str(&raw).expect("decode");
        assert_eq!(leads.len(), 4);
    }

    #[tokio::test]
    async fn test_run_bulk_save_failure_keeps_state_and_selection() {
        let kv = Arc::new(FlakyStore::default());
        let (app, notifier) = flaky_app(kv.clone());
        select_in(&app, &["l1", "l2"]);
        kv.set_fail_saves(true);

        let err = app
            .run_bulk(RecordKind::Lead, BulkOperation::Delete, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::Storage(_)));
        app.read(|s| {
            assert_eq!(s.leads.len(), 5);
            assert_eq!(s.selection(RecordKind::Lead).len(), 2);
        });
        let (level, title, _) = notifier.last().expect("notified");
        assert_eq!(level, NoticeLevel::Error);
        assert_eq!(title, "Delete failed");
        assert!(!app.is_bulk_running());
    }

    #[test]
    fn test_dispatch_save_failure_leaves_state_untouched() {
        let kv = Arc::new(FlakyStore::default());
        let (app, notifier) = flaky_app(kv.clone());
        kv.set_fail_saves(true);

        let err = app
            .dispatch(Action::EditRecord {
                kind: RecordKind::Lead,
                id: "l1".to_string(),
                patch: RecordPatch::new().set("company", "Globex"),
            })
            .unwrap_err();
        assert!(matches!(err, CrmError::Storage(_)));
        app.read(|s| assert_eq!(s.leads.get("l1").expect("l1").company, None));
        let (level, title, _) = notifier.last().expect("notified");
        assert_eq!(level, NoticeLevel::Error);
        assert_eq!(title, "Save failed");
    }

    #[tokio::test]
    async fn test_pipeline_insights_without_provider() {
        let (app, _notifier, _kv) = app(Arc::new(LocalBackend::default()));
        let err = app.pipeline_insights().await.unwrap_err();
        assert!(matches!(err, CrmError::ProviderUnavailable(_)));
        let batch = app.lead_insights().await;
        assert_eq!(batch.failures.len(), 5);
    }
}
