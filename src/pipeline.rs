//! Deal stage pipeline: ordered stages, stage moves and per-stage aggregates.
//!
//! A move is allowed between any two stages, terminal ones included. The
//! target stage's probability always overwrites the deal's probability and
//! the dwell counter restarts at zero.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CrmError;
use crate::types::{Deal, Lead, LOST_STAGE, WON_STAGE};
use crate::util::advance_timestamp;

/// A named, ordered bucket of the deal pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: String,
    pub name: String,
    pub rank: i32,
    pub probability: u8,
    #[serde(default)]
    pub is_won: bool,
    #[serde(default)]
    pub is_lost: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Stage {
    pub fn new(id: &str, name: &str, rank: i32, probability: u8) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            rank,
            probability,
            is_won: id == WON_STAGE,
            is_lost: id == LOST_STAGE,
            color: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.is_won || self.is_lost
    }
}

/// Aggregates recomputed from current stage membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMetrics {
    pub stage_id: String,
    pub deal_count: usize,
    pub total_value: f64,
    pub avg_days_in_stage: f64,
    /// Σ value × deal probability / 100.
    pub weighted_value: f64,
}

/// One Kanban column.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageColumn {
    pub stage: Stage,
    pub metrics: StageMetrics,
    pub deals: Vec<Arc<Deal>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineForecast {
    pub open_deals: usize,
    pub open_value: f64,
    pub weighted_value: f64,
    pub won_deals: usize,
    pub won_value: f64,
    pub lost_deals: usize,
    pub lost_value: f64,
    /// won / (won + lost); 0 when nothing has closed.
    pub win_rate: f64,
    /// Deals whose stage is not part of this pipeline.
    pub unstaged_deals: usize,
}

/// Ranked stages. Serialized as the bare stage list; deserializing goes
/// through [`StagePipeline::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Stage>", into = "Vec<Stage>")]
pub struct StagePipeline {
    stages: Vec<Stage>,
}

impl TryFrom<Vec<Stage>> for StagePipeline {
    type Error = CrmError;

    fn try_from(stages: Vec<Stage>) -> Result<Self, Self::Error> {
        Self::new(stages)
    }
}

impl From<StagePipeline> for Vec<Stage> {
    fn from(pipeline: StagePipeline) -> Self {
        pipeline.stages
    }
}

impl StagePipeline {
    /// Build a pipeline from stages in any order.
    ///
    /// Ids and ranks must be unique, probabilities within 0-100, and a stage
    /// cannot be both won and lost.
    pub fn new(mut stages: Vec<Stage>) -> Result<Self, CrmError> {
        if stages.is_empty() {
            return Err(CrmError::InvalidStages("at least one stage is required".to_string()));
        }
        let mut ids = HashSet::new();
        let mut ranks = HashSet::new();
        for stage in &stages {
            if stage.id.trim().is_empty() {
                return Err(CrmError::InvalidStages("stage id cannot be empty".to_string()));
            }
            if !ids.insert(stage.id.as_str()) {
                return Err(CrmError::InvalidStages(format!("duplicate stage id '{}'", stage.id)));
            }
            if !ranks.insert(stage.rank) {
                return Err(CrmError::InvalidStages(format!("duplicate stage rank {}", stage.rank)));
            }
            if stage.probability > 100 {
                return Err(CrmError::InvalidStages(format!(
                    "stage '{}' probability {} is above 100",
                    stage.id, stage.probability
                )));
            }
            if stage.is_won && stage.is_lost {
                return Err(CrmError::InvalidStages(format!(
                    "stage '{}' cannot be both won and lost",
                    stage.id
                )));
            }
        }
        stages.sort_by_key(|s| s.rank);
        Ok(Self { stages })
    }

    pub fn default_stages() -> Self {
        Self {
            stages: vec![
                Stage::new("lead", "Lead", 1, 10),
                Stage::new("qualified", "Qualified", 2, 25),
                Stage::new("proposal", "Proposal", 3, 50),
                Stage::new("negotiation", "Negotiation", 4, 75),
                Stage::new(WON_STAGE, "Closed Won", 5, 100),
                Stage::new(LOST_STAGE, "Closed Lost", 6, 0),
            ],
        }
    }

    /// Stages in rank order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn first_stage(&self) -> &Stage {
        // new() rejects an empty stage list
        &self.stages[0]
    }

    /// Move one deal into `target` and reflect the stage's weight on it.
    pub fn transition(&self, deal: &Deal, target: &str, now: DateTime<Utc>) -> Result<Deal, CrmError> {
        let stage = self
            .stage(target)
            .ok_or_else(|| CrmError::StageNotFound(target.to_string()))?;
        let mut next = deal.clone();
        next.stage = stage.id.clone();
        next.probability = stage.probability;
        next.days_in_stage = 0;
        next.updated_at = advance_timestamp(deal.updated_at, now);
        Ok(next)
    }

    /// Move the deal `deal_id` into `target`. Other deals are carried over
    /// as the same `Arc`.
    pub fn move_deal(
        &self,
        deals: &[Arc<Deal>],
        deal_id: &str,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Arc<Deal>>, CrmError> {
        let idx = deals
            .iter()
            .position(|d| d.id == deal_id)
            .ok_or_else(|| CrmError::RecordNotFound(deal_id.to_string()))?;
        let moved = self.transition(&deals[idx], target, now)?;
        log::info!(
            "Deal {} moved {} -> {} (probability {})",
            deal_id,
            deals[idx].stage,
            moved.stage,
            moved.probability
        );

        let mut next = deals.to_vec();
        next[idx] = Arc::new(moved);
        Ok(next)
    }

    /// Metrics for one stage. Unknown stage ids yield empty metrics.
    pub fn metrics_for(&self, deals: &[Arc<Deal>], stage_id: &str) -> StageMetrics {
        let members: Vec<&Deal> = deals
            .iter()
            .map(|d| d.as_ref())
            .filter(|d| d.stage == stage_id)
            .collect();
        let deal_count = members.len();
        let total_value: f64 = members.iter().map(|d| d.value).sum();
        let weighted_value: f64 = members
            .iter()
            .map(|d| d.value * d.probability as f64 / 100.0)
            .sum();
        let avg_days_in_stage = if deal_count == 0 {
            0.0
        } else {
            members.iter().map(|d| d.days_in_stage as f64).sum::<f64>() / deal_count as f64
        };
        StageMetrics {
            stage_id: stage_id.to_string(),
            deal_count,
            total_value,
            avg_days_in_stage,
            weighted_value,
        }
    }

    /// Metrics for every stage, in rank order.
    pub fn aggregates(&self, deals: &[Arc<Deal>]) -> Vec<StageMetrics> {
        self.stages
            .iter()
            .map(|s| self.metrics_for(deals, &s.id))
            .collect()
    }

    /// Kanban columns: each stage with its metrics and deals, largest value first.
    pub fn board(&self, deals: &[Arc<Deal>]) -> Vec<StageColumn> {
        self.stages
            .iter()
            .map(|stage| {
                let mut members: Vec<Arc<Deal>> = deals
                    .iter()
                    .filter(|d| d.stage == stage.id)
                    .cloned()
                    .collect();
                members.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.id.cmp(&b.id)));
                StageColumn {
                    stage: stage.clone(),
                    metrics: self.metrics_for(deals, &stage.id),
                    deals: members,
                }
            })
            .collect()
    }

    pub fn forecast(&self, deals: &[Arc<Deal>]) -> PipelineForecast {
        let mut f = PipelineForecast::default();
        for deal in deals {
            match self.stage(&deal.stage) {
                None => f.unstaged_deals += 1,
                Some(stage) if stage.is_won => {
                    f.won_deals += 1;
                    f.won_value += deal.value;
                }
                Some(stage) if stage.is_lost => {
                    f.lost_deals += 1;
                    f.lost_value += deal.value;
                }
                Some(_) => {
                    f.open_deals += 1;
                    f.open_value += deal.value;
                    f.weighted_value += deal.value * deal.probability as f64 / 100.0;
                }
            }
        }
        let closed = f.won_deals + f.lost_deals;
        if closed > 0 {
            f.win_rate = f.won_deals as f64 / closed as f64;
        }
        f
    }

    /// Add `days` to every deal's dwell counter. Not an edit: `updated_at`
    /// is left alone.
    pub fn advance_dwell(&self, deals: &[Arc<Deal>], days: u32) -> Vec<Arc<Deal>> {
        if days == 0 {
            return deals.to_vec();
        }
        deals
            .iter()
            .map(|d| {
                let mut next = (**d).clone();
                next.days_in_stage = next.days_in_stage.saturating_add(days);
                Arc::new(next)
            })
            .collect()
    }

    /// Change a stage's weight. Deals already in the stage keep their
    /// probability until their next move.
    pub fn set_stage_probability(&mut self, stage_id: &str, probability: u8) -> Result<(), CrmError> {
        if probability > 100 {
            return Err(CrmError::InvalidStages(format!(
                "probability {} is above 100",
                probability
            )));
        }
        let stage = self
            .stages
            .iter_mut()
            .find(|s| s.id == stage_id)
            .ok_or_else(|| CrmError::StageNotFound(stage_id.to_string()))?;
        stage.probability = probability;
        Ok(())
    }

    /// Open a deal in the first stage from a lead.
    pub fn deal_from_lead(&self, lead: &Lead, value: f64, now: DateTime<Utc>) -> Deal {
        let stage = self.first_stage();
        let title = match lead.company.as_deref() {
            Some(company) if !company.trim().is_empty() => format!("{} - {}", company, lead.full_name()),
            _ => lead.full_name(),
        };
        let mut deal = Deal::new(&title, value, &stage.id, stage.probability, now);
        deal.company = lead.company.clone();
        deal.contact_name = Some(lead.full_name());
        deal.contact_email = Some(lead.email.clone());
        deal.owner = lead.owner.clone();
        deal.source = Some(lead.source.clone());
        deal.lead_id = Some(lead.id.clone());
        deal.tags = lead.tags.clone();
        deal
    }
}

impl Default for StagePipeline {
    fn default() -> Self {
        Self::default_stages()
    }
}
