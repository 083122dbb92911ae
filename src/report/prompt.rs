//! Prompt construction. The model is only ever asked for narrative text;
//! every number it sees was computed locally and is provided as context.

use serde_json::json;

use crate::period::Granularity;
use crate::report::{ActivityEntry, CategoryConfig, ExecutiveSummary, ReportDocument};

const RESPONSE_CONTRACT: &str = r#"Respond with ONLY a JSON object (no markdown, no code fences):
{"progress_report": "<2-4 sentence assessment of progress and balance>", "markdown_report": "<a well-structured markdown report for the period>"}"#;

pub fn daily_prompt(
    period_key: &str,
    entries: &[ActivityEntry],
    summary: &ExecutiveSummary,
    categories: &CategoryConfig,
) -> String {
    let entries_json = serde_json::to_string_pretty(entries).unwrap_or_default();
    let totals = totals_context(summary);
    let categories_json = serde_json::to_string(categories).unwrap_or_default();
    format!(
        "Write the narrative for a daily activity report covering {period_key}.\n\n\
         Category configuration:\n{categories_json}\n\n\
         Computed totals (minutes, already verified, do not recalculate):\n{totals}\n\n\
         Logged activities:\n{entries_json}\n\n\
         Summarize how the day was spent, call out the dominant groups, and note \
         anything unusual in the log.\n\n{RESPONSE_CONTRACT}"
    )
}

pub fn rollup_prompt(
    granularity: Granularity,
    period_key: &str,
    summary: &ExecutiveSummary,
    children: &[(String, ReportDocument)],
    categories: &CategoryConfig,
) -> String {
    // Child narratives and totals, without their raw entry payloads.
    let child_context: Vec<_> = children
        .iter()
        .map(|(key, doc)| {
            json!({
                "period": key,
                "total_time": doc.executive_summary.total_time,
                "time_by_group": doc.executive_summary.time_by_group,
                "progress_report": doc.executive_summary.progress_report,
            })
        })
        .collect();
    let children_json = serde_json::to_string_pretty(&child_context).unwrap_or_default();
    let totals = totals_context(summary);
    let categories_json = serde_json::to_string(categories).unwrap_or_default();
    let span = match granularity {
        Granularity::Weekly => "week",
        Granularity::Monthly => "month",
        Granularity::Quarterly => "quarter",
        Granularity::Annual => "year",
        Granularity::Daily => "day",
    };
    format!(
        "Write the narrative for a {granularity} activity report covering the {span} {period_key}.\n\n\
         Category configuration:\n{categories_json}\n\n\
         Computed totals (minutes, already verified, do not recalculate):\n{totals}\n\n\
         Sub-period summaries:\n{children_json}\n\n\
         Describe the arc of the {span}: trends across sub-periods, shifts in \
         balance between groups, and progress worth carrying forward.\n\n{RESPONSE_CONTRACT}"
    )
}

fn totals_context(summary: &ExecutiveSummary) -> String {
    serde_json::to_string_pretty(&json!({
        "total_time": summary.total_time,
        "time_by_group": summary.time_by_group,
        "time_by_category": summary.time_by_category,
    }))
    .unwrap_or_default()
}
