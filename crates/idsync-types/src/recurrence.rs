//! Recurrence definitions attached to job definitions.
//!
//! Anchors and instants are wall-clock times interpreted in the resolver's
//! configured timezone. Weekdays use ISO numbering (Monday = 1 .. Sunday = 7).

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

fn default_interval() -> u32 {
    1
}

/// One recurrence rule for a job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceDefinition {
    pub id: u64,
    pub jobdef_id: String,

    /// Higher wins on collision; also bounds what a CANCEL removes
    #[serde(default)]
    pub priority: i32,

    #[serde(flatten)]
    pub rule: RecurrenceRule,
}

/// Rule payload, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecurrenceRule {
    /// Every `interval` days from the anchor
    Daily {
        anchor: NaiveDateTime,
        #[serde(default = "default_interval")]
        interval: u32,
    },
    /// Listed weekdays of every `interval`-th calendar week from the anchor
    Weekly {
        anchor: NaiveDateTime,
        #[serde(default = "default_interval")]
        interval: u32,
        weekdays: Vec<u32>,
    },
    /// Listed days of listed months
    MonthlyDays {
        anchor: NaiveDateTime,
        months: Vec<u32>,
        days: Vec<u32>,
    },
    /// Listed weekdays in listed ISO weeks-of-month of listed months
    MonthlyWeekdays {
        anchor: NaiveDateTime,
        months: Vec<u32>,
        weekdays: Vec<u32>,
        weeks: Vec<u32>,
    },
    /// A single instant
    Once { at: NaiveDateTime },
    /// Removes occurrences in `[from, to]` at or below this rule's priority
    Cancel {
        from: NaiveDateTime,
        to: NaiveDateTime,
    },
}

impl RecurrenceRule {
    /// Wire names accepted for the `kind` tag.
    pub const KINDS: [&'static str; 6] = [
        "DAILY",
        "WEEKLY",
        "MONTHLY_DAYS",
        "MONTHLY_WEEKDAYS",
        "ONCE",
        "CANCEL",
    ];

    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Daily { .. } => "DAILY",
            Self::Weekly { .. } => "WEEKLY",
            Self::MonthlyDays { .. } => "MONTHLY_DAYS",
            Self::MonthlyWeekdays { .. } => "MONTHLY_WEEKDAYS",
            Self::Once { .. } => "ONCE",
            Self::Cancel { .. } => "CANCEL",
        }
    }
}
