pub mod aggregator;
pub mod prompt;

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// A single logged activity. Timestamps use the warehouse text format
/// (`YYYY-MM-DD HH:MM:SS.mmm`), which sorts lexicographically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    #[serde(default)]
    pub id: i64,
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
    pub duration_minutes: u32,
    #[serde(default = "default_bucket")]
    pub category: String,
    #[serde(default = "default_bucket")]
    pub group: String,
    #[serde(default)]
    pub description: String,
}

impl ActivityEntry {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }
}

fn default_bucket() -> String {
    "others".to_string()
}

pub mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

    pub fn serialize<S: Serializer>(dt: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(d)?;
        // Accept both millisecond and bare-seconds timestamps.
        NaiveDateTime::parse_from_str(&s, FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

/// Locally computed numeric roll-up plus the model-authored narrative.
/// `time_by_category` maps category name to a per-group minute breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutiveSummary {
    pub total_time: u64,
    #[serde(default)]
    pub time_by_group: BTreeMap<String, u64>,
    #[serde(default)]
    pub time_by_category: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    pub progress_report: String,
}

/// Per-sub-period slice inside a roll-up document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubPeriodBreakdown {
    pub total_time: u64,
    #[serde(default)]
    pub time_by_group: BTreeMap<String, u64>,
}

/// The supporting material behind a report: raw entries for daily reports,
/// child documents for roll-ups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReportDetails {
    // Entries must be tried first: every field of ReportDocument has a
    // default, so a document value matches any JSON object, while an entry
    // requires `timestamp` and `duration_minutes`.
    Entries(Vec<ActivityEntry>),
    Reports(Vec<ReportDocument>),
}

impl Default for ReportDetails {
    fn default() -> Self {
        ReportDetails::Entries(Vec::new())
    }
}

impl ReportDetails {
    pub fn is_empty(&self) -> bool {
        match self {
            ReportDetails::Entries(e) => e.is_empty(),
            ReportDetails::Reports(r) => r.is_empty(),
        }
    }
}

/// A generated report. Exactly one of the breakdown maps is present depending
/// on granularity: weekly and monthly reports carry `daily_breakdown`,
/// quarterly reports carry `monthly_breakdown`, annual reports carry
/// `quarterly_breakdown`, and daily reports carry none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub executive_summary: ExecutiveSummary,
    #[serde(default)]
    pub details: ReportDetails,
    #[serde(default)]
    pub markdown_report: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_breakdown: Option<BTreeMap<String, SubPeriodBreakdown>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_breakdown: Option<BTreeMap<String, SubPeriodBreakdown>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarterly_breakdown: Option<BTreeMap<String, SubPeriodBreakdown>>,
}

pub const EMPTY_REPORT_TEXT: &str = "No data available";

impl ReportDocument {
    /// The canonical document for a period with no recorded activity.
    pub fn empty() -> Self {
        ReportDocument {
            markdown_report: EMPTY_REPORT_TEXT.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.executive_summary.total_time == 0 && self.details.is_empty()
    }
}

/// User-managed category configuration. Groups not listed under any category
/// fall into the `others` bucket at report time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    #[serde(default)]
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl CategoryConfig {
    /// The category a group belongs to, defaulting to `others`.
    pub fn category_for(&self, group: &str) -> &str {
        self.categories
            .iter()
            .find(|c| c.groups.iter().any(|g| g == group))
            .map(|c| c.name.as_str())
            .unwrap_or("others")
    }
}
