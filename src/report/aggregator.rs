//! The report engine: cache-first, force-refresh-aware generation of daily
//! reports and their weekly/monthly/quarterly/annual roll-ups. All numbers
//! come from local aggregation; the model contributes narrative text only.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::llm::{normalize, Gateway};
use crate::period::{Granularity, Period};
use crate::render::{render_markdown, ArtifactStore};
use crate::report::prompt;
use crate::report::{
    ActivityEntry, CategoryConfig, ExecutiveSummary, ReportDetails, ReportDocument,
    SubPeriodBreakdown,
};
use crate::storage::{repository, Database};

pub struct ReportEngine {
    db: Database,
    gateway: Arc<dyn Gateway>,
    artifacts: Option<ArtifactStore>,
    // One guard per (granularity, period_key) so concurrent requests for the
    // same report produce a single generation.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Narrative fields the model is allowed to author.
struct Narrative {
    progress: Option<String>,
    markdown: Option<String>,
}

impl ReportEngine {
    pub fn new(db: Database, gateway: Arc<dyn Gateway>, artifacts: Option<ArtifactStore>) -> Self {
        Self {
            db,
            gateway,
            artifacts,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Generate (or fetch from cache) the report for a period.
    ///
    /// Unless `force_refresh` is set, a cached document is returned as-is.
    /// Roll-ups recurse into their sub-periods first, generating any that are
    /// missing; sub-periods are never force-refreshed by a forced parent. A
    /// second caller arriving while the same key is generating waits and is
    /// then satisfied from the cache.
    pub fn generate(
        &self,
        period: Period,
        force_refresh: bool,
    ) -> BoxFuture<'_, Result<ReportDocument>> {
        async move {
            let granularity = period.granularity();
            let key = period.to_key();

            let lock = {
                let mut locks = self.locks.lock().await;
                locks
                    .entry(format!("{granularity}:{key}"))
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            };
            let _guard = lock.lock().await;

            if !force_refresh {
                if let Some(record) = self.cached(period).await? {
                    log::debug!("cache hit for {granularity} report {key}");
                    return Ok(record.document);
                }
            }

            log::info!("generating {granularity} report for {key}");
            let doc = match granularity {
                Granularity::Daily => self.build_daily(period).await?,
                _ => self.build_rollup(period).await?,
            };
            self.persist(period, doc).await
        }
        .boxed()
    }

    pub async fn cached(&self, period: Period) -> Result<Option<repository::CacheRecord>> {
        let granularity = period.granularity();
        let key = period.to_key();
        let record = self
            .db
            .reader()
            .call(move |conn| repository::get_cached_report(conn, granularity, &key))
            .await?;
        Ok(record)
    }

    pub async fn invalidate(&self, period: Period) -> Result<bool> {
        let granularity = period.granularity();
        let key = period.to_key();
        let removed = self
            .db
            .writer()
            .call(move |conn| repository::invalidate_report(conn, granularity, &key))
            .await?;
        Ok(removed)
    }

    async fn build_daily(&self, period: Period) -> Result<ReportDocument> {
        let (start, end) = period.date_range();
        let (entries, categories) = self
            .db
            .reader()
            .call(move |conn| {
                let entries = repository::query_entries(conn, start, end)?;
                let categories = repository::get_categories(conn)?;
                Ok::<_, rusqlite::Error>((entries, categories))
            })
            .await?;

        if entries.is_empty() {
            log::debug!("no activity on {}, emitting empty report", period.to_key());
            return Ok(ReportDocument::empty());
        }

        let summary = aggregate_entries(&entries, &categories);
        let request = prompt::daily_prompt(&period.to_key(), &entries, &summary, &categories);
        let narrative = self.narrative(&request).await?;

        let mut doc = ReportDocument {
            executive_summary: summary,
            details: ReportDetails::Entries(entries),
            ..Default::default()
        };
        apply_narrative(&mut doc, period, narrative);
        Ok(doc)
    }

    async fn build_rollup(&self, period: Period) -> Result<ReportDocument> {
        let granularity = period.granularity();
        let mut children: Vec<(Period, ReportDocument)> = Vec::new();
        for child in period.children() {
            let doc = self.generate(child, false).await?;
            children.push((child, doc));
        }

        if children.iter().all(|(_, doc)| doc.is_empty()) {
            log::debug!(
                "no activity across {}, emitting empty report",
                period.to_key()
            );
            return Ok(ReportDocument::empty());
        }

        let categories = self
            .db
            .reader()
            .call(|conn| repository::get_categories(conn))
            .await?;

        let summary = merge_children(&children);
        let breakdown = build_breakdown(period, &children);
        let child_pairs: Vec<(String, ReportDocument)> = children
            .iter()
            .map(|(p, d)| (p.to_key(), d.clone()))
            .collect();

        let request = prompt::rollup_prompt(
            granularity,
            &period.to_key(),
            &summary,
            &child_pairs,
            &categories,
        );
        let narrative = self.narrative(&request).await?;

        let mut doc = ReportDocument {
            executive_summary: summary,
            details: ReportDetails::Reports(child_pairs.into_iter().map(|(_, d)| d).collect()),
            ..Default::default()
        };
        match granularity {
            Granularity::Weekly | Granularity::Monthly => doc.daily_breakdown = Some(breakdown),
            Granularity::Quarterly => doc.monthly_breakdown = Some(breakdown),
            Granularity::Annual => doc.quarterly_breakdown = Some(breakdown),
            Granularity::Daily => unreachable!("daily reports do not roll up"),
        }
        apply_narrative(&mut doc, period, narrative);
        Ok(doc)
    }

    async fn narrative(&self, request: &str) -> Result<Narrative> {
        let completion = self.gateway.complete(request).await?;
        let (value, repairs) = normalize::extract_json(&completion.text)?;
        if !repairs.is_empty() {
            log::info!("model response required repairs: {repairs:?}");
        }
        Ok(Narrative {
            progress: string_field(&value, "progress_report"),
            markdown: string_field(&value, "markdown_report"),
        })
    }

    /// Write the artifact (best effort) and upsert the cache row. A cache
    /// write failure is logged and the freshly generated document is still
    /// returned to the caller.
    async fn persist(&self, period: Period, doc: ReportDocument) -> Result<ReportDocument> {
        let artifact_path = match &self.artifacts {
            Some(store) => match store.write(period, &doc.markdown_report).await {
                Ok(path) => Some(path.to_string_lossy().into_owned()),
                Err(e) => {
                    log::warn!("artifact write failed for {period}: {e}");
                    None
                }
            },
            None => None,
        };

        let granularity = period.granularity();
        let key = period.to_key();
        let to_store = doc.clone();
        let stored = self
            .db
            .writer()
            .call(move |conn| {
                repository::put_cached_report(
                    conn,
                    granularity,
                    &key,
                    &to_store,
                    artifact_path.as_deref(),
                )
            })
            .await;
        if let Err(e) = stored {
            let err = Error::CacheWrite(e.to_string());
            log::error!(
                "{granularity} report {} generated but not cached: {err}",
                period.to_key()
            );
        }
        Ok(doc)
    }
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn apply_narrative(doc: &mut ReportDocument, period: Period, narrative: Narrative) {
    if let Some(progress) = narrative.progress {
        doc.executive_summary.progress_report = progress;
    }
    doc.markdown_report = match narrative.markdown {
        Some(markdown) => markdown,
        None => render_markdown(period, doc),
    };
}

/// Roll entries up into totals. Categories come from the configuration
/// snapshot, not from whatever category the entry was stored with.
fn aggregate_entries(entries: &[ActivityEntry], categories: &CategoryConfig) -> ExecutiveSummary {
    let mut summary = ExecutiveSummary::default();
    for entry in entries {
        let minutes = entry.duration_minutes as u64;
        summary.total_time += minutes;
        *summary.time_by_group.entry(entry.group.clone()).or_default() += minutes;
        let category = categories.category_for(&entry.group).to_string();
        *summary
            .time_by_category
            .entry(category)
            .or_default()
            .entry(entry.group.clone())
            .or_default() += minutes;
    }
    summary
}

fn merge_children(children: &[(Period, ReportDocument)]) -> ExecutiveSummary {
    let mut summary = ExecutiveSummary::default();
    for (_, doc) in children {
        let child = &doc.executive_summary;
        summary.total_time += child.total_time;
        for (group, minutes) in &child.time_by_group {
            *summary.time_by_group.entry(group.clone()).or_default() += minutes;
        }
        for (category, groups) in &child.time_by_category {
            let bucket = summary.time_by_category.entry(category.clone()).or_default();
            for (group, minutes) in groups {
                *bucket.entry(group.clone()).or_default() += minutes;
            }
        }
    }
    summary
}

/// One breakdown key per child, zero-activity children included. Months merge
/// their weeks' per-day maps so the monthly breakdown stays keyed by date.
fn build_breakdown(
    period: Period,
    children: &[(Period, ReportDocument)],
) -> BTreeMap<String, SubPeriodBreakdown> {
    let mut breakdown = BTreeMap::new();
    match period.granularity() {
        Granularity::Monthly => {
            for (child, doc) in children {
                match &doc.daily_breakdown {
                    Some(days) => breakdown.extend(days.clone()),
                    None => {
                        // Empty week: synthesize its seven zero days.
                        let (start, end) = child.date_range();
                        let mut day = start;
                        while day <= end {
                            breakdown.insert(
                                day.format("%Y-%m-%d").to_string(),
                                SubPeriodBreakdown::default(),
                            );
                            day += chrono::Duration::days(1);
                        }
                    }
                }
            }
        }
        _ => {
            for (child, doc) in children {
                breakdown.insert(
                    child.to_key(),
                    SubPeriodBreakdown {
                        total_time: doc.executive_summary.total_time,
                        time_by_group: doc.executive_summary.time_by_group.clone(),
                    },
                );
            }
        }
    }
    breakdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Completion;
    use crate::report::{Category, EMPTY_REPORT_TEXT};
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeGateway {
        calls: AtomicUsize,
        response: String,
    }

    impl FakeGateway {
        fn new() -> Self {
            Self::with_response(
                r##"{"progress_report": "steady progress", "markdown_report": "# Narrative"}"##,
            )
        }

        fn with_response(response: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: response.to_string(),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Gateway for FakeGateway {
        async fn complete(&self, _prompt: &str) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Completion {
                text: self.response.clone(),
                truncated: false,
            })
        }
    }

    struct FailingGateway;

    #[async_trait]
    impl Gateway for FailingGateway {
        async fn complete(&self, _prompt: &str) -> Result<Completion> {
            Err(Error::GatewayUnavailable("connection refused".into()))
        }
    }

    async fn seed(db: &Database, date: NaiveDate, minutes: u32, group: &str) {
        let ts = NaiveDateTime::new(date, chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        let entry = ActivityEntry {
            id: 0,
            timestamp: ts,
            duration_minutes: minutes,
            category: "unset".into(),
            group: group.into(),
            description: format!("{minutes}m of {group}"),
        };
        db.writer()
            .call(move |conn| repository::insert_activity(conn, &entry))
            .await
            .unwrap();
    }

    async fn seed_categories(db: &Database) {
        let config = CategoryConfig {
            categories: vec![Category {
                name: "work".into(),
                groups: vec!["coding".into(), "meetings".into()],
            }],
        };
        db.writer()
            .call(move |conn| repository::set_categories(conn, &config))
            .await
            .unwrap();
    }

    async fn setup() -> (Database, Arc<ReportEngine>, Arc<FakeGateway>) {
        let db = Database::open_memory().await.unwrap();
        seed_categories(&db).await;
        let gateway = Arc::new(FakeGateway::new());
        let engine = Arc::new(ReportEngine::new(db.clone(), gateway.clone(), None));
        (db, engine, gateway)
    }

    fn day(y: i32, m: u32, d: u32) -> Period {
        Period::Day(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    #[tokio::test]
    async fn test_empty_day_skips_gateway_and_caches_empty_doc() {
        let (_db, engine, gateway) = setup().await;
        let doc = engine.generate(day(2024, 7, 27), false).await.unwrap();
        assert!(doc.is_empty());
        assert_eq!(doc.markdown_report, EMPTY_REPORT_TEXT);
        assert_eq!(gateway.call_count(), 0);

        let cached = engine.cached(day(2024, 7, 27)).await.unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn test_daily_totals_computed_locally() {
        let (db, engine, gateway) = setup().await;
        let date = NaiveDate::from_ymd_opt(2024, 7, 27).unwrap();
        seed(&db, date, 60, "coding").await;
        seed(&db, date, 30, "walking").await;

        let doc = engine.generate(day(2024, 7, 27), false).await.unwrap();
        let summary = &doc.executive_summary;
        assert_eq!(summary.total_time, 90);
        assert_eq!(summary.time_by_group["coding"], 60);
        assert_eq!(summary.time_by_group["walking"], 30);
        // Categories come from the config snapshot, not the stored column.
        assert_eq!(summary.time_by_category["work"]["coding"], 60);
        assert_eq!(summary.time_by_category["others"]["walking"], 30);
        assert_eq!(summary.progress_report, "steady progress");
        assert_eq!(doc.markdown_report, "# Narrative");
        match &doc.details {
            ReportDetails::Entries(entries) => assert_eq!(entries.len(), 2),
            other => panic!("expected entries, got {other:?}"),
        }
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn test_weekly_rollup_totals_and_breakdown() {
        let (db, engine, gateway) = setup().await;
        // Week 2024-W30 runs Mon Jul 22 through Sun Jul 28.
        let minutes = [60, 0, 120, 45, 0, 30, 90];
        for (offset, m) in minutes.iter().enumerate() {
            if *m > 0 {
                let date = NaiveDate::from_ymd_opt(2024, 7, 22 + offset as u32).unwrap();
                seed(&db, date, *m, "coding").await;
            }
        }

        let doc = engine.generate(Period::Week(2024, 30), false).await.unwrap();
        assert_eq!(doc.executive_summary.total_time, 345);

        let breakdown = doc.daily_breakdown.as_ref().unwrap();
        assert_eq!(breakdown.len(), 7);
        assert_eq!(breakdown["2024-07-22"].total_time, 60);
        assert_eq!(breakdown["2024-07-23"].total_time, 0);
        assert_eq!(breakdown["2024-07-28"].total_time, 90);

        // Five non-empty days plus the weekly narrative itself.
        assert_eq!(gateway.call_count(), 6);

        match &doc.details {
            ReportDetails::Reports(reports) => assert_eq!(reports.len(), 7),
            other => panic!("expected child reports, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generation_is_idempotent() {
        let (db, engine, gateway) = setup().await;
        let date = NaiveDate::from_ymd_opt(2024, 7, 27).unwrap();
        seed(&db, date, 60, "coding").await;

        let first = engine.generate(day(2024, 7, 27), false).await.unwrap();
        let calls_after_first = gateway.call_count();
        let second = engine.generate(day(2024, 7, 27), false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let (db, engine, gateway) = setup().await;
        let date = NaiveDate::from_ymd_opt(2024, 7, 27).unwrap();
        seed(&db, date, 60, "coding").await;

        engine.generate(day(2024, 7, 27), false).await.unwrap();
        assert_eq!(gateway.call_count(), 1);
        engine.generate(day(2024, 7, 27), true).await.unwrap();
        assert_eq!(gateway.call_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_generation_leaves_prior_cache_intact() {
        let (db, engine, _gateway) = setup().await;
        let date = NaiveDate::from_ymd_opt(2024, 7, 27).unwrap();
        seed(&db, date, 60, "coding").await;

        let original = engine.generate(day(2024, 7, 27), false).await.unwrap();

        let failing = Arc::new(ReportEngine::new(db.clone(), Arc::new(FailingGateway), None));
        let err = failing.generate(day(2024, 7, 27), true).await.unwrap_err();
        assert!(matches!(err, Error::GatewayUnavailable(_)), "{err:?}");

        // The earlier document is still served.
        let cached = engine.generate(day(2024, 7, 27), false).await.unwrap();
        assert_eq!(cached, original);
    }

    #[tokio::test]
    async fn test_unparseable_response_is_not_cached() {
        let db = Database::open_memory().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 7, 27).unwrap();
        seed(&db, date, 60, "coding").await;
        let gateway = Arc::new(FakeGateway::with_response("I refuse to answer in JSON."));
        let engine = ReportEngine::new(db.clone(), gateway, None);

        let err = engine.generate(day(2024, 7, 27), false).await.unwrap_err();
        assert!(matches!(err, Error::UnparseableResponse { .. }), "{err:?}");
        assert!(engine.cached(day(2024, 7, 27)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_generation() {
        let (db, engine, gateway) = setup().await;
        let date = NaiveDate::from_ymd_opt(2024, 7, 27).unwrap();
        seed(&db, date, 60, "coding").await;

        let a = engine.clone();
        let b = engine.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.generate(day(2024, 7, 27), false).await }),
            tokio::spawn(async move { b.generate(day(2024, 7, 27), false).await }),
        );
        let doc_a = ra.unwrap().unwrap();
        let doc_b = rb.unwrap().unwrap();
        assert_eq!(doc_a, doc_b);
        assert_eq!(gateway.call_count(), 1);
    }

    #[tokio::test]
    async fn test_monthly_breakdown_merges_week_days() {
        let (db, engine, _gateway) = setup().await;
        // July 2024 owns weeks 27-31 (Mondays Jul 1, 8, 15, 22, 29).
        seed(&db, NaiveDate::from_ymd_opt(2024, 7, 3).unwrap(), 60, "coding").await;
        seed(&db, NaiveDate::from_ymd_opt(2024, 7, 25).unwrap(), 40, "coding").await;

        let doc = engine.generate(Period::Month(2024, 7), false).await.unwrap();
        assert_eq!(doc.executive_summary.total_time, 100);

        let breakdown = doc.daily_breakdown.as_ref().unwrap();
        // Five owned weeks of seven days each, keyed by date.
        assert_eq!(breakdown.len(), 35);
        assert_eq!(breakdown["2024-07-03"].total_time, 60);
        assert_eq!(breakdown["2024-07-25"].total_time, 40);
        assert_eq!(breakdown["2024-07-10"].total_time, 0);
        // The last owned week spills into August; its days still belong here.
        assert!(breakdown.contains_key("2024-08-04"));
    }

    #[tokio::test]
    async fn test_quarterly_and_annual_breakdown_keys() {
        let (db, engine, _gateway) = setup().await;
        seed(&db, NaiveDate::from_ymd_opt(2024, 8, 14).unwrap(), 75, "coding").await;

        let quarter = engine
            .generate(Period::Quarter(2024, 3), false)
            .await
            .unwrap();
        assert_eq!(quarter.executive_summary.total_time, 75);
        let breakdown = quarter.monthly_breakdown.as_ref().unwrap();
        assert_eq!(
            breakdown.keys().cloned().collect::<Vec<_>>(),
            vec!["2024-07", "2024-08", "2024-09"]
        );
        assert_eq!(breakdown["2024-08"].total_time, 75);

        let year = engine.generate(Period::Year(2024), false).await.unwrap();
        assert_eq!(year.executive_summary.total_time, 75);
        let breakdown = year.quarterly_breakdown.as_ref().unwrap();
        assert_eq!(
            breakdown.keys().cloned().collect::<Vec<_>>(),
            vec!["2024-Q1", "2024-Q2", "2024-Q3", "2024-Q4"]
        );
        assert_eq!(breakdown["2024-Q3"].total_time, 75);
        assert_eq!(breakdown["2024-Q1"].total_time, 0);
    }

    #[tokio::test]
    async fn test_artifact_written_alongside_cache() {
        let db = Database::open_memory().await.unwrap();
        seed_categories(&db).await;
        let date = NaiveDate::from_ymd_opt(2024, 7, 27).unwrap();
        seed(&db, date, 60, "coding").await;

        let dir = tempfile::tempdir().unwrap();
        let engine = ReportEngine::new(
            db.clone(),
            Arc::new(FakeGateway::new()),
            Some(ArtifactStore::new(dir.path())),
        );
        engine.generate(day(2024, 7, 27), false).await.unwrap();

        let record = engine.cached(day(2024, 7, 27)).await.unwrap().unwrap();
        let path = record.artifact_path.unwrap();
        assert!(path.ends_with("2024-07-27.md"));
        let body = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(body, "# Narrative");
    }

    #[tokio::test]
    async fn test_missing_narrative_fields_fall_back_to_local_rendering() {
        let db = Database::open_memory().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 7, 27).unwrap();
        seed(&db, date, 60, "coding").await;
        let gateway = Arc::new(FakeGateway::with_response(r#"{"progress_report": "fine"}"#));
        let engine = ReportEngine::new(db.clone(), gateway, None);

        let doc = engine.generate(day(2024, 7, 27), false).await.unwrap();
        assert_eq!(doc.executive_summary.progress_report, "fine");
        assert!(doc.markdown_report.starts_with("# Daily Report: 2024-07-27"));
    }
}
