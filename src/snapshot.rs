use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cleaner::clean;
use crate::errors::{AppError, AppResult};
use crate::feed::{parse_rows, take_row, RawRow};

/// Business state for the current reporting period, as read from the feed.
///
/// Every field is finite. `gross_profit_ratio` is a fraction in `[0, 1]`.
/// The monetary fields keep the sign of the feed cell, so a loss-making
/// period reads as a negative `profit` rather than `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sales: f64,
    pub cost: f64,
    pub labour: f64,
    pub profit: f64,
    pub gross_profit_ratio: f64,
}

/// A change of column order upstream is a new schema version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedSchema {
    #[default]
    V1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub totals_row: usize,
    pub sales: usize,
    pub cost: usize,
    pub gross_profit_ratio: usize,
    pub labour: usize,
    pub profit: usize,
}

impl ColumnLayout {
    pub fn width(&self) -> usize {
        [
            self.sales,
            self.cost,
            self.gross_profit_ratio,
            self.labour,
            self.profit,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
            + 1
    }
}

impl FeedSchema {
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(FeedSchema::V1),
            other => Err(AppError::Config(format!("unknown feed schema: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedSchema::V1 => "v1",
        }
    }

    pub fn layout(&self) -> ColumnLayout {
        match self {
            FeedSchema::V1 => ColumnLayout {
                totals_row: 1,
                sales: 9,
                cost: 10,
                gross_profit_ratio: 11,
                labour: 12,
                profit: 13,
            },
        }
    }
}

pub fn build_snapshot(row: &RawRow, layout: &ColumnLayout) -> MetricsSnapshot {
    let cell = |index: usize| clean(row.field(index));
    MetricsSnapshot {
        sales: cell(layout.sales),
        cost: cell(layout.cost),
        labour: cell(layout.labour),
        profit: cell(layout.profit),
        gross_profit_ratio: ratio(row.field(layout.gross_profit_ratio)),
    }
}

pub fn extract_snapshot(text: &str, schema: FeedSchema) -> AppResult<MetricsSnapshot> {
    let layout = schema.layout();
    let row = take_row(parse_rows(text), layout.totals_row)?;
    if row.len() < layout.width() {
        return Err(AppError::Parse(format!(
            "totals row has {} fields; schema {} needs {}",
            row.len(),
            schema.as_str(),
            layout.width()
        )));
    }
    Ok(build_snapshot(&row, &layout))
}

fn ratio(raw: Option<&str>) -> f64 {
    let value = clean(raw);
    let fraction = if raw.is_some_and(|cell| cell.contains('%')) {
        value / 100.0
    } else {
        value
    };
    let clamped = fraction.clamp(0.0, 1.0);
    if clamped != fraction {
        debug!(
            cell = raw.unwrap_or_default(),
            fraction,
            clamped,
            "gross profit ratio out of range; clamped"
        );
    }
    clamped
}
