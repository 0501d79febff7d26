//! `leadflow` command-line front-end.
//!
//! Usage:
//!   leadflow summary
//!   leadflow pipeline
//!   leadflow import-leads <file.csv>
//!   leadflow export-leads <file.csv>
//!   leadflow template <leads|deals> <file.csv>
//!   leadflow move <deal-id> <stage-id>

use std::fs;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};

use leadflow_lib::config::load_config;
use leadflow_lib::csv_io::{export_csv, template_csv};
use leadflow_lib::dashboard::{deal_summary, lead_summary};
use leadflow_lib::notification::LogNotifier;
use leadflow_lib::state::{Action, AppState};
use leadflow_lib::types::{Deal, Lead, RecordKind};

const USAGE: &str = "usage: leadflow <summary|pipeline|import-leads FILE|export-leads FILE|template leads|deals FILE|move DEAL STAGE>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).ok_or_else(|| anyhow!(USAGE))?;

    let config = load_config().map_err(|e| anyhow!("Failed to load leadflow config: {e}"))?;
    let kv = config.open_store().map_err(|e| anyhow!(e))?;
    let app = AppState::new(&config, kv, Arc::new(LogNotifier))?;

    match (command, &args[1..]) {
        ("summary", []) => {
            let (leads, deals) = app.read(|s| {
                (
                    lead_summary(s.leads.records()),
                    deal_summary(&s.pipeline, s.deals.records()),
                )
            });
            println!("{}", serde_json::to_string_pretty(&leads)?);
            println!("{}", serde_json::to_string_pretty(&deals)?);
        }
        ("pipeline", []) => {
            let board = app.read(|s| s.pipeline.board(s.deals.records()));
            for column in board {
                println!(
                    "{:<14} {:>3} deals  total {:>12.2}  weighted {:>12.2}  avg {:>5.1} days",
                    column.stage.name,
                    column.metrics.deal_count,
                    column.metrics.total_value,
                    column.metrics.weighted_value,
                    column.metrics.avg_days_in_stage
                );
                for deal in &column.deals {
                    println!("    {:<36} {:>12.2}  {}", deal.title, deal.value, deal.id);
                }
            }
        }
        ("import-leads", [path]) => {
            let text = fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
            let reduced = app.dispatch(Action::ImportCsv {
                kind: RecordKind::Lead,
                text,
            })?;
            if let Some(notice) = reduced.notice {
                println!("{}", notice.message);
                for detail in notice.details {
                    println!("  {detail}");
                }
            }
        }
        ("export-leads", [path]) => {
            let csv = app.read(|s| export_csv(s.leads.records()))?;
            fs::write(path, csv).with_context(|| format!("Failed to write {path}"))?;
            println!("Wrote {path}");
        }
        ("template", [kind, path]) => {
            let csv = match kind.as_str() {
                "leads" => template_csv::<Lead>()?,
                "deals" => template_csv::<Deal>()?,
                other => bail!("unknown template '{other}', expected leads or deals"),
            };
            fs::write(path, csv).with_context(|| format!("Failed to write {path}"))?;
            println!("Wrote {path}");
        }
        ("move", [deal_id, stage_id]) => {
            app.dispatch(Action::MoveDeal {
                deal_id: deal_id.clone(),
                stage_id: stage_id.clone(),
            })?;
            println!("Moved {deal_id} to {stage_id}");
        }
        _ => bail!(USAGE),
    }
    Ok(())
}
