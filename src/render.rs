//! Local markdown rendering and on-disk report artifacts. The rendered text
//! is the fallback body when the model omits `markdown_report`, and the
//! artifact store mirrors whatever body a report ends up with.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::period::{Granularity, Period};
use crate::report::{ReportDocument, SubPeriodBreakdown};

/// "5h 45m" style duration, minutes-only under an hour.
pub fn format_minutes(minutes: u64) -> String {
    if minutes < 60 {
        format!("{minutes}m")
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}

fn title_for(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Daily => "Daily Report",
        Granularity::Weekly => "Weekly Report",
        Granularity::Monthly => "Monthly Report",
        Granularity::Quarterly => "Quarterly Report",
        Granularity::Annual => "Annual Report",
    }
}

/// Render a document to markdown from its locally computed numbers.
pub fn render_markdown(period: Period, doc: &ReportDocument) -> String {
    let summary = &doc.executive_summary;
    let mut out = String::new();
    out.push_str(&format!(
        "# {}: {}\n\n",
        title_for(period.granularity()),
        period.to_key()
    ));
    out.push_str(&format!(
        "**Total time:** {}\n\n",
        format_minutes(summary.total_time)
    ));

    if !summary.time_by_group.is_empty() {
        out.push_str("## Time by Group\n\n| Group | Time |\n|---|---|\n");
        for (group, minutes) in &summary.time_by_group {
            out.push_str(&format!("| {group} | {} |\n", format_minutes(*minutes)));
        }
        out.push('\n');
    }

    if !summary.time_by_category.is_empty() {
        out.push_str("## Time by Category\n\n");
        for (category, groups) in &summary.time_by_category {
            let total: u64 = groups.values().sum();
            out.push_str(&format!("- **{category}**: {}\n", format_minutes(total)));
            for (group, minutes) in groups {
                out.push_str(&format!("  - {group}: {}\n", format_minutes(*minutes)));
            }
        }
        out.push('\n');
    }

    let breakdown_section = doc
        .daily_breakdown
        .as_ref()
        .map(|b| ("Daily Breakdown", b))
        .or(doc.monthly_breakdown.as_ref().map(|b| ("Monthly Breakdown", b)))
        .or(doc
            .quarterly_breakdown
            .as_ref()
            .map(|b| ("Quarterly Breakdown", b)));
    if let Some((heading, breakdown)) = breakdown_section {
        render_breakdown(&mut out, heading, breakdown);
    }

    if !summary.progress_report.is_empty() {
        out.push_str("## Progress\n\n");
        out.push_str(&summary.progress_report);
        out.push('\n');
    }

    out
}

fn render_breakdown(
    out: &mut String,
    heading: &str,
    breakdown: &BTreeMap<String, SubPeriodBreakdown>,
) {
    out.push_str(&format!("## {heading}\n\n| Period | Time |\n|---|---|\n"));
    for (key, slice) in breakdown {
        out.push_str(&format!("| {key} | {} |\n", format_minutes(slice.total_time)));
    }
    out.push('\n');
}

/// Writes report bodies under `<base>/reports/<granularity>/<key>.md`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base: PathBuf,
}

impl ArtifactStore {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, period: Period) -> PathBuf {
        self.base
            .join("reports")
            .join(period.granularity().as_str())
            .join(format!("{}.md", period.to_key()))
    }

    pub async fn write(&self, period: Period, body: &str) -> Result<PathBuf> {
        let path = self.path_for(period);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}
