//! AI insight and lead-scoring layer.
//!
//! Prompts are plain string templates over one record (or the pipeline
//! totals). The completion backend is injected through [`InsightProvider`];
//! responses are expected to carry a JSON object, possibly wrapped in prose
//! or a code fence. Parsing is per item: one malformed insight never sinks
//! the rest of the response, and one failed record never sinks the batch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bulk::RecordPatch;
use crate::error::CrmError;
use crate::pipeline::{Stage, StagePipeline};
use crate::types::{Deal, Lead, Rating, Record};

/// Custom field the score reasoning is written to.
pub const SCORE_REASONING_FIELD: &str = "custom.score_reasoning";

// =============================================================================
// Provider
// =============================================================================

/// Text-completion backend.
#[async_trait]
pub trait InsightProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CrmError>;
}

/// Default provider when no model is configured. Every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableProvider;

#[async_trait]
impl InsightProvider for UnavailableProvider {
    async fn complete(&self, _prompt: &str) -> Result<String, CrmError> {
        Err(CrmError::ProviderUnavailable(
            "no insight provider is configured".to_string(),
        ))
    }
}

// =============================================================================
// Insight payload
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightPriority {
    High,
    Medium,
    Low,
}

impl InsightPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightPriority::High => "high",
            InsightPriority::Medium => "medium",
            InsightPriority::Low => "low",
        }
    }
}

/// One element of the `insights` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub insight_type: String,
    pub title: String,
    pub description: String,
    pub confidence_score: f64,
    pub priority: InsightPriority,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    #[serde(default)]
    pub potential_impact: String,
    #[serde(default)]
    pub timeline: String,
}

impl Insight {
    fn check(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title is empty".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(format!(
                "confidence_score {} is outside 0-1",
                self.confidence_score
            ));
        }
        Ok(())
    }
}

/// Insights recovered from one response.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedInsights {
    pub insights: Vec<Insight>,
    /// Elements that were present but malformed.
    pub skipped: usize,
}

// =============================================================================
// Prompts
// =============================================================================

fn push_line(prompt: &mut String, label: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
        prompt.push_str(&format!("- {}: {}\n", label, v));
    }
}

const INSIGHT_FORMAT: &str = r#"## Output Format
Respond with a single JSON object and nothing else:
{
  "insights": [
    {
      "insight_type": "opportunity | risk | next_step | engagement",
      "title": "short headline",
      "description": "one or two sentences",
      "confidence_score": 0.0,
      "priority": "high | medium | low",
      "suggested_actions": ["ordered", "list"],
      "potential_impact": "free text",
      "timeline": "free text"
    }
  ]
}
"#;

/// Insight prompt for one lead.
pub fn build_lead_prompt(lead: &Lead) -> String {
    let mut prompt = String::from(
        "You are a sales analyst. Review this lead and suggest how to move it forward.\n\n",
    );
    prompt.push_str("## Lead\n");
    push_line(&mut prompt, "Name", Some(&lead.full_name()));
    push_line(&mut prompt, "Email", Some(&lead.email));
    push_line(&mut prompt, "Company", lead.company.as_deref());
    push_line(&mut prompt, "Job title", lead.job_title.as_deref());
    push_line(&mut prompt, "Source", Some(&lead.source));
    push_line(&mut prompt, "Status", Some(lead.status.as_str()));
    push_line(&mut prompt, "Rating", Some(lead.rating.as_str()));
    prompt.push_str(&format!("- Score: {}/100\n", lead.score));
    if let Some(value) = lead.estimated_value {
        prompt.push_str(&format!("- Estimated value: {:.2}\n", value));
    }
    if let Some(at) = lead.last_contacted_at {
        prompt.push_str(&format!("- Last contacted: {}\n", at.format("%Y-%m-%d")));
    }
    if !lead.tags.is_empty() {
        prompt.push_str(&format!("- Tags: {}\n", lead.tags.join(", ")));
    }
    if let Some(notes) = lead.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        prompt.push_str("\n## Notes\n");
        prompt.push_str(notes.trim());
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(INSIGHT_FORMAT);
    prompt
}

/// Insight prompt for one deal and the stage it sits in.
pub fn build_deal_prompt(deal: &Deal, stage: Option<&Stage>) -> String {
    let mut prompt = String::from(
        "You are a sales analyst. Review this deal and identify risks and next steps.\n\n",
    );
    prompt.push_str("## Deal\n");
    push_line(&mut prompt, "Title", Some(&deal.title));
    push_line(&mut prompt, "Company", deal.company.as_deref());
    push_line(&mut prompt, "Contact", deal.contact_name.as_deref());
    prompt.push_str(&format!("- Value: {:.2}\n", deal.value));
    prompt.push_str(&format!("- Probability: {}%\n", deal.probability));
    prompt.push_str(&format!("- Days in stage: {}\n", deal.days_in_stage));
    if let Some(close) = deal.expected_close_date {
        prompt.push_str(&format!("- Expected close: {}\n", close.format("%Y-%m-%d")));
    }

    prompt.push_str("\n## Stage\n");
    match stage {
        Some(stage) => {
            prompt.push_str(&format!(
                "- {} (rank {}, default probability {}%)\n",
                stage.name, stage.rank, stage.probability
            ));
        }
        None => prompt.push_str(&format!("- {} (not a configured stage)\n", deal.stage)),
    }

    if let Some(notes) = deal.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        prompt.push_str("\n## Notes\n");
        prompt.push_str(notes.trim());
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(INSIGHT_FORMAT);
    prompt
}

/// Insight prompt over the whole pipeline's per-stage totals.
pub fn build_pipeline_prompt(pipeline: &StagePipeline, deals: &[Arc<Deal>]) -> String {
    let forecast = pipeline.forecast(deals);
    let mut prompt = String::from(
        "You are a sales operations analyst. Review the pipeline and flag bottlenecks.\n\n",
    );
    prompt.push_str("## Stages\n");
    for (stage, metrics) in pipeline.stages().iter().zip(pipeline.aggregates(deals)) {
        prompt.push_str(&format!(
            "- {}: {} deals, total {:.2}, weighted {:.2}, avg {:.1} days in stage\n",
            stage.name,
            metrics.deal_count,
            metrics.total_value,
            metrics.weighted_value,
            metrics.avg_days_in_stage
        ));
    }
    prompt.push_str("\n## Forecast\n");
    prompt.push_str(&format!(
        "- Open: {} deals worth {:.2} (weighted {:.2})\n",
        forecast.open_deals, forecast.open_value, forecast.weighted_value
    ));
    prompt.push_str(&format!(
        "- Won: {} deals worth {:.2}\n- Lost: {} deals worth {:.2}\n- Win rate: {:.0}%\n",
        forecast.won_deals,
        forecast.won_value,
        forecast.lost_deals,
        forecast.lost_value,
        forecast.win_rate * 100.0
    ));
    prompt.push('\n');
    prompt.push_str(INSIGHT_FORMAT);
    prompt
}

/// Scoring prompt for one lead.
pub fn build_score_prompt(lead: &Lead) -> String {
    let mut prompt = String::from(
        "You are a sales analyst. Score this lead from 0 (no fit) to 100 (ready to buy).\n\n",
    );
    prompt.push_str("## Lead\n");
    push_line(&mut prompt, "Name", Some(&lead.full_name()));
    push_line(&mut prompt, "Company", lead.company.as_deref());
    push_line(&mut prompt, "Job title", lead.job_title.as_deref());
    push_line(&mut prompt, "Source", Some(&lead.source));
    push_line(&mut prompt, "Status", Some(lead.status.as_str()));
    prompt.push_str(&format!("- Current score: {}\n", lead.score));
    if let Some(value) = lead.estimated_value {
        prompt.push_str(&format!("- Estimated value: {:.2}\n", value));
    }
    prompt.push_str(
        "\n## Output Format\nRespond with a single JSON object:\n\
         {\"score\": 0, \"rating\": \"hot | warm | cold\", \"reasoning\": \"one sentence\"}\n",
    );
    prompt
}

// =============================================================================
// Response parsing
// =============================================================================

/// Locate the JSON object in a model response: the first fenced block
/// whose body is an object, otherwise the first `{` in the text that opens
/// a complete JSON value.
pub fn extract_json_from_response(response: &str) -> Option<&str> {
    fenced_blocks(response)
        .find(|body| body.starts_with('{'))
        .or_else(|| first_json_object(response))
}

/// Bodies of ``` fences, without the info string line (`json`, ...).
fn fenced_blocks(text: &str) -> impl Iterator<Item = &str> {
    text.split("```").skip(1).step_by(2).map(|block| match block.split_once('\n') {
        Some((_info, body)) => body.trim(),
        None => block.trim(),
    })
}

fn first_json_object(text: &str) -> Option<&str> {
    text.match_indices('{').find_map(|(start, _)| {
        let rest = &text[start..];
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<serde::de::IgnoredAny>();
        match stream.next() {
            Some(Ok(_)) => Some(&rest[..stream.byte_offset()]),
            _ => None,
        }
    })
}

fn response_object(response: &str) -> Result<serde_json::Value, CrmError> {
    let json = extract_json_from_response(response)
        .ok_or_else(|| CrmError::ResponseParse("no JSON object in response".to_string()))?;
    serde_json::from_str(json).map_err(|e| CrmError::ResponseParse(e.to_string()))
}

/// Parse an insight response. The `insights` array is required; each of its
/// elements is decoded on its own and malformed ones are skipped.
pub fn parse_insights(response: &str) -> Result<ParsedInsights, CrmError> {
    let value = response_object(response)?;
    let items = value
        .get("insights")
        .and_then(|v| v.as_array())
        .ok_or_else(|| CrmError::ResponseParse("missing insights array".to_string()))?;

    let mut parsed = ParsedInsights::default();
    for (idx, item) in items.iter().enumerate() {
        let insight = serde_json::from_value::<Insight>(item.clone())
            .map_err(|e| e.to_string())
            .and_then(|insight| insight.check().map(|_| insight));
        match insight {
            Ok(insight) => parsed.insights.push(insight),
            Err(reason) => {
                log::warn!("Skipping insight #{}: {}", idx, reason);
                parsed.skipped += 1;
            }
        }
    }
    Ok(parsed)
}

// =============================================================================
// Batch generation
// =============================================================================

/// Insights produced for one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordInsights {
    pub record_id: String,
    pub insights: Vec<Insight>,
    pub skipped: usize,
}

/// A record the batch could not process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub record_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InsightBatch {
    pub results: Vec<RecordInsights>,
    pub failures: Vec<RecordFailure>,
}

/// Run one prompt per record, at most `max_batch` records, in order.
pub async fn generate_insights<R, F>(
    provider: &dyn InsightProvider,
    records: &[Arc<R>],
    max_batch: usize,
    build_prompt: F,
) -> InsightBatch
where
    R: Record,
    F: Fn(&R) -> String,
{
    let mut batch = InsightBatch::default();
    for record in records.iter().take(max_batch) {
        let prompt = build_prompt(record);
        let outcome = match provider.complete(&prompt).await {
            Ok(response) => parse_insights(&response),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(parsed) => batch.results.push(RecordInsights {
                record_id: record.id().to_string(),
                insights: parsed.insights,
                skipped: parsed.skipped,
            }),
            Err(e) => {
                log::warn!("Insights for {} {} failed: {}", R::KIND, record.id(), e);
                batch.failures.push(RecordFailure {
                    record_id: record.id().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
    log::info!(
        "Generated insights for {} {} ({} failed)",
        batch.results.len(),
        R::KIND.collection(),
        batch.failures.len()
    );
    batch
}

// =============================================================================
// Lead scoring
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreAssessment {
    pub score: u8,
    pub rating: Rating,
    pub reasoning: String,
}

impl ScoreAssessment {
    /// Patch writing this assessment onto a lead.
    pub fn to_patch(&self) -> RecordPatch {
        let patch = RecordPatch::new()
            .set("score", self.score as f64)
            .set("rating", self.rating.as_str());
        if self.reasoning.is_empty() {
            patch
        } else {
            patch.set(SCORE_REASONING_FIELD, self.reasoning.as_str())
        }
    }
}

#[derive(Deserialize)]
struct RawScore {
    score: f64,
    #[serde(default)]
    rating: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Parse a scoring response. A missing rating is derived from the score.
pub fn parse_score_response(response: &str) -> Result<ScoreAssessment, CrmError> {
    let value = response_object(response)?;
    let raw: RawScore =
        serde_json::from_value(value).map_err(|e| CrmError::ResponseParse(e.to_string()))?;
    if !(0.0..=100.0).contains(&raw.score) {
        return Err(CrmError::ResponseParse(format!(
            "score {} is outside 0-100",
            raw.score
        )));
    }
    let score = raw.score.round() as u8;
    let rating = match raw.rating.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(r) => r
            .to_lowercase()
            .parse::<Rating>()
            .map_err(CrmError::ResponseParse)?,
        None => Rating::from_score(score),
    };
    Ok(ScoreAssessment {
        score,
        rating,
        reasoning: raw.reasoning.unwrap_or_default().trim().to_string(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct ScoreBatch {
    /// Lead id and the patch to apply to it.
    pub patches: Vec<(String, RecordPatch)>,
    pub failures: Vec<RecordFailure>,
}

/// Ask the provider to rescore up to `max_batch` leads.
pub async fn assess_scores(
    provider: &dyn InsightProvider,
    leads: &[Arc<Lead>],
    max_batch: usize,
) -> ScoreBatch {
    let mut batch = ScoreBatch::default();
    for lead in leads.iter().take(max_batch) {
        let outcome = match provider.complete(&build_score_prompt(lead)).await {
            Ok(response) => parse_score_response(&response),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(assessment) => {
                log::debug!("Lead {} scored {}", lead.id, assessment.score);
                batch.patches.push((lead.id.clone(), assessment.to_patch()));
            }
            Err(e) => {
                log::warn!("Scoring lead {} failed: {}", lead.id, e);
                batch.failures.push(RecordFailure {
                    record_id: lead.id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    batch
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    /// Replays canned responses in order; prompts are recorded.
    pub struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<String, CrmError>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        pub fn new(responses: Vec<Result<String, CrmError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl InsightProvider for ScriptedProvider {
        async fn complete(&self, prompt: &str) -> Result<String, CrmError> {
            self.prompts.lock().push(prompt.to_string());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(CrmError::ProviderUnavailable("script exhausted".to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedProvider;
    use super::*;
    use crate::test_utils::{arcs, deal, lead, ts};

    const TWO_GOOD_ONE_BAD: &str = r#"Here is my analysis:
```json
{
  "insights": [
    {"insight_type": "risk", "title": "Stalled", "description": "No reply in 3 weeks",
     "confidence_score": 0.8, "priority": "high",
     "suggested_actions": ["Call", "Email {summary}"], "potential_impact": "high", "timeline": "this week"},
    {"insight_type": "risk", "title": "Bad", "description": "x", "confidence_score": 1.7, "priority": "low"},
    {"insight_type": "next_step", "title": "Demo", "description": "Book a demo",
     "confidence_score": 0.5, "priority": "medium"}
  ]
}
```"#;

    #[test]
    fn test_extract_json_from_fenced_response() {
        let json = extract_json_from_response(TWO_GOOD_ONE_BAD).expect("json");
        assert!(json.starts_with('{'));
        assert!(json.ends_with('}'));
    }

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let text = r#"Sure! {"insights": [{"title": "brace } in string"}]} Hope that helps {"#;
        assert_eq!(
            extract_json_from_response(text),
            Some(r#"{"insights": [{"title": "brace } in string"}]}"#)
        );
        assert_eq!(extract_json_from_response("no json here"), None);
    }

    #[test]
    fn test_extract_json_skips_braces_that_are_not_json() {
        let text = r#"Replace {name} first, then: {"score": 70, "rating": "warm"}"#;
        assert_eq!(
            extract_json_from_response(text),
            Some(r#"{"score": 70, "rating": "warm"}"#)
        );
        let bare_fence = "```\n{\"score\": 12}\n```";
        assert_eq!(extract_json_from_response(bare_fence), Some("{\"score\": 12}"));
    }

    #[test]
    fn test_parse_insights_skips_malformed_items() {
        let parsed = parse_insights(TWO_GOOD_ONE_BAD).expect("parse");
        assert_eq!(parsed.insights.len(), 2);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.insights[0].priority, InsightPriority::High);
        assert_eq!(parsed.insights[0].suggested_actions, vec!["Call", "Email {summary}"]);
        assert_eq!(parsed.insights[1].timeline, "");
    }

    #[test]
    fn test_parse_insights_requires_array() {
        let err = parse_insights(r#"{"summary": "fine"}"#).unwrap_err();
        assert!(matches!(err, CrmError::ResponseParse(_)));
        let err = parse_insights("I cannot help with that").unwrap_err();
        assert!(matches!(err, CrmError::ResponseParse(_)));
    }

    #[test]
    fn test_parse_insights_rejects_unknown_priority_per_item() {
        let parsed = parse_insights(
            r#"{"insights": [{"insight_type": "risk", "title": "t", "description": "d",
                "confidence_score": 0.3, "priority": "urgent"}]}"#,
        )
        .expect("parse");
        assert!(parsed.insights.is_empty());
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_prompts_include_record_context() {
        let mut l = lead("l1", "Ada", "Lovelace", 42, ts(2026, 1, 1));
        l.company = Some("Analytical Engines".to_string());
        let prompt = build_lead_prompt(&l);
        assert!(prompt.contains("## Lead"));
        assert!(prompt.contains("Ada Lovelace"));
        assert!(prompt.contains("Analytical Engines"));
        assert!(prompt.contains("\"insights\""));

        let pipeline = StagePipeline::default_stages();
        let d = deal("d1", "proposal", 5000.0, ts(2026, 1, 1));
        let prompt = build_deal_prompt(&d, pipeline.stage("proposal"));
        assert!(prompt.contains("Proposal (rank 3, default probability 50%)"));

        let prompt = build_pipeline_prompt(&pipeline, &arcs(vec![d]));
        assert!(prompt.contains("- Proposal: 1 deals, total 5000.00"));
    }

    #[tokio::test]
    async fn test_generate_insights_continues_past_failures() {
        let provider = ScriptedProvider::new(vec![
            Ok(TWO_GOOD_ONE_BAD.to_string()),
            Err(CrmError::ProviderUnavailable("timeout".to_string())),
            Ok("not json".to_string()),
        ]);
        let leads = arcs(vec![
            lead("l1", "A", "One", 10, ts(2026, 1, 1)),
            lead("l2", "B", "Two", 20, ts(2026, 1, 2)),
            lead("l3", "C", "Three", 30, ts(2026, 1, 3)),
            lead("l4", "D", "Four", 40, ts(2026, 1, 4)),
        ]);

        let batch = generate_insights(&provider, &leads, 3, |l: &Lead| build_lead_prompt(l)).await;
        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.results[0].record_id, "l1");
        assert_eq!(batch.results[0].insights.len(), 2);
        let failed: Vec<&str> = batch.failures.iter().map(|f| f.record_id.as_str()).collect();
        assert_eq!(failed, vec!["l2", "l3"]);
        assert_eq!(provider.prompts.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_provider_fails_every_record() {
        let deals = arcs(vec![deal("d1", "lead", 100.0, ts(2026, 1, 1))]);
        let pipeline = StagePipeline::default_stages();
        let batch = generate_insights(&UnavailableProvider, &deals, 10, |d: &Deal| {
            build_deal_prompt(d, pipeline.stage(&d.stage))
        })
        .await;
        assert!(batch.results.is_empty());
        assert_eq!(batch.failures.len(), 1);
    }

    #[test]
    fn test_parse_score_response() {
        let a = parse_score_response(r#"{"score": 82, "rating": "Hot", "reasoning": " VP, big budget "}"#)
            .expect("parse");
        assert_eq!(a.score, 82);
        assert_eq!(a.rating, Rating::Hot);
        assert_eq!(a.reasoning, "VP, big budget");

        let a = parse_score_response(r#"Score: {"score": 45.4}"#).expect("parse");
        assert_eq!(a.score, 45);
        assert_eq!(a.rating, Rating::Warm);

        assert!(parse_score_response(r#"{"score": 140}"#).is_err());
        assert!(parse_score_response(r#"{"score": 50, "rating": "tepid"}"#).is_err());
    }

    #[tokio::test]
    async fn test_assess_scores_builds_patches() {
        let provider = ScriptedProvider::new(vec![
            Ok(r#"{"score": 91, "reasoning": "ready"}"#.to_string()),
            Ok(r#"{"rating": "cold"}"#.to_string()),
        ]);
        let leads = arcs(vec![
            lead("l1", "A", "One", 10, ts(2026, 1, 1)),
            lead("l2", "B", "Two", 20, ts(2026, 1, 2)),
        ]);
        let batch = assess_scores(&provider, &leads, 10).await;
        assert_eq!(batch.patches.len(), 1);
        assert_eq!(batch.failures.len(), 1);
        let (id, patch) = &batch.patches[0];
        assert_eq!(id, "l1");
        let patched = patch.apply_to(leads[0].as_ref(), ts(2026, 2, 1)).expect("apply");
        assert_eq!(patched.score, 91);
        assert_eq!(patched.rating, Rating::Hot);
        assert_eq!(
            patched.field(SCORE_REASONING_FIELD).and_then(|v| v.as_text().map(String::from)),
            Some("ready".to_string())
        );
    }
}
