//! Summary statistics for the lead and deal dashboards.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::pipeline::{PipelineForecast, StageMetrics, StagePipeline};
use crate::types::{Deal, Lead, LeadStatus, Rating};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadSummary {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_rating: BTreeMap<String, usize>,
    pub by_source: BTreeMap<String, usize>,
    /// 0 for an empty collection.
    pub average_score: f64,
    pub hot_leads: usize,
    pub pipeline_value: f64,
    /// Share of leads converted to deals, 0-1.
    pub conversion_rate: f64,
}

pub fn lead_summary(leads: &[Arc<Lead>]) -> LeadSummary {
    let mut summary = LeadSummary {
        total: leads.len(),
        ..Default::default()
    };
    // Every known status and rating is listed even with a zero count.
    for status in LeadStatus::ALL {
        summary.by_status.insert(status.as_str().to_string(), 0);
    }
    for rating in Rating::ALL {
        summary.by_rating.insert(rating.as_str().to_string(), 0);
    }

    let mut score_total = 0u64;
    for lead in leads {
        *summary.by_status.entry(lead.status.as_str().to_string()).or_default() += 1;
        *summary.by_rating.entry(lead.rating.as_str().to_string()).or_default() += 1;
        *summary.by_source.entry(lead.source.clone()).or_default() += 1;
        score_total += lead.score as u64;
        summary.pipeline_value += lead.estimated_value.unwrap_or(0.0);
        if lead.rating == Rating::Hot {
            summary.hot_leads += 1;
        }
    }

    if !leads.is_empty() {
        summary.average_score = score_total as f64 / leads.len() as f64;
        let converted = summary
            .by_status
            .get(LeadStatus::Converted.as_str())
            .copied()
            .unwrap_or(0);
        summary.conversion_rate = converted as f64 / leads.len() as f64;
    }
    summary
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DealSummary {
    pub total: usize,
    pub forecast: PipelineForecast,
    pub stages: Vec<StageMetrics>,
    /// Mean value over every deal, 0 when there are none.
    pub average_deal_value: f64,
}

pub fn deal_summary(pipeline: &StagePipeline, deals: &[Arc<Deal>]) -> DealSummary {
    let average_deal_value = if deals.is_empty() {
        0.0
    } else {
        deals.iter().map(|d| d.value).sum::<f64>() / deals.len() as f64
    };
    DealSummary {
        total: deals.len(),
        forecast: pipeline.forecast(deals),
        stages: pipeline.aggregates(deals),
        average_deal_value,
    }
}
