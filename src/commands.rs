use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::PublicAppConfig;
use crate::engine::{SaleAction, SyncHandle};
use crate::errors::{AppError, AppResult};
use crate::reconciler::SyncPhase;
use crate::snapshot::MetricsSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct SyncHealth {
    pub phase: SyncPhase,
    pub published: MetricsSnapshot,
    pub pending_deltas: usize,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pull_in_flight: bool,
    pub pulls_issued: u64,
    pub consecutive_failures: u32,
    pub journal_path: Option<String>,
    pub journal_queue_depth: usize,
    pub journal_dropped_events: u64,
    pub config: PublicAppConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Refresh,
    Sale(SaleAction),
    Status,
    Quit,
}

/// Parses `refresh`, `status`, `quit` or `sale <product> <sales_delta> <profit_delta>`.
/// Blank lines parse to `None`.
pub fn parse_command(line: &str) -> AppResult<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "refresh" | "r" => ConsoleCommand::Refresh,
        "status" | "s" => ConsoleCommand::Status,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        "sale" => {
            let product = words
                .next()
                .ok_or_else(|| AppError::InvalidCommand("sale needs a product".into()))?;
            let sales = parse_amount(words.next(), "sales delta")?;
            let profit = parse_amount(words.next(), "profit delta")?;
            ConsoleCommand::Sale(SaleAction::new(product, sales, profit))
        }
        other => return Err(AppError::InvalidCommand(other.to_string())),
    };

    if words.next().is_some() {
        return Err(AppError::InvalidCommand(format!(
            "unexpected trailing input in {line:?}"
        )));
    }
    Ok(Some(command))
}

pub async fn dispatch(handle: &SyncHandle, command: ConsoleCommand) -> AppResult<Option<String>> {
    let reply = match command {
        ConsoleCommand::Refresh => {
            handle.refresh()?;
            serde_json::json!({ "refresh": "requested" }).to_string()
        }
        ConsoleCommand::Sale(action) => serde_json::to_string(&handle.record_sale(action).await?)?,
        ConsoleCommand::Status => serde_json::to_string(&handle.health().await?)?,
        ConsoleCommand::Quit => return Ok(None),
    };
    Ok(Some(reply))
}

fn parse_amount(word: Option<&str>, what: &str) -> AppResult<f64> {
    word.and_then(|w| w.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or_else(|| AppError::InvalidCommand(format!("sale needs a numeric {what}")))
}
