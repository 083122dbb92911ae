pub mod date_util;
pub mod error;
pub mod llm;
pub mod period;
pub mod render;
pub mod report;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

pub use error::{Error, Result};
pub use llm::{ChatGateway, Completion, Gateway, GatewayConfig};
pub use period::{Granularity, Period};
pub use render::ArtifactStore;
pub use report::aggregator::ReportEngine;
pub use report::{ActivityEntry, Category, CategoryConfig, ExecutiveSummary, ReportDocument};
pub use scheduler::{JobStatus, ReportScheduler};
pub use storage::repository::CacheRecord;
pub use storage::Database;

use storage::repository;

/// Point-in-time snapshot of the warehouse for status displays.
#[derive(Debug, Clone)]
pub struct WarehouseStatus {
    pub activity_count: i64,
    /// (granularity, period_key, generated_at) per cached report.
    pub cached_reports: Vec<(String, String, String)>,
}

/// Main entry point for the activity data warehouse.
pub struct ActivityDW {
    db: Database,
    engine: Arc<ReportEngine>,
}

impl ActivityDW {
    /// Wire the warehouse against the production gateway, configured from
    /// `app_config`.
    pub async fn connect(db: Database, artifacts: Option<ArtifactStore>) -> Result<Self> {
        let gateway = Arc::new(llm::create_gateway(&db).await?);
        Ok(Self::with_gateway(db, gateway, artifacts))
    }

    /// Wire the warehouse against an explicit gateway (tests, other hosts).
    pub fn with_gateway(
        db: Database,
        gateway: Arc<dyn Gateway>,
        artifacts: Option<ArtifactStore>,
    ) -> Self {
        let engine = Arc::new(ReportEngine::new(db.clone(), gateway, artifacts));
        Self { db, engine }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn engine(&self) -> Arc<ReportEngine> {
        self.engine.clone()
    }

    // ── Reports ────────────────────────────────────────────────────

    pub async fn generate_report(
        &self,
        period: Period,
        force_refresh: bool,
    ) -> Result<ReportDocument> {
        self.engine.generate(period, force_refresh).await
    }

    pub async fn cached_report(&self, period: Period) -> Result<Option<CacheRecord>> {
        self.engine.cached(period).await
    }

    pub async fn invalidate_report(&self, period: Period) -> Result<bool> {
        self.engine.invalidate(period).await
    }

    // ── Activity log ───────────────────────────────────────────────

    pub async fn log_activity(&self, entry: ActivityEntry) -> Result<i64> {
        self.db
            .writer()
            .call(move |conn| repository::insert_activity(conn, &entry))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn recent_activities(&self, limit: u32) -> Result<Vec<ActivityEntry>> {
        self.db
            .reader()
            .call(move |conn| repository::list_activities(conn, limit))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn remove_activity(&self, id: i64) -> Result<bool> {
        self.db
            .writer()
            .call(move |conn| repository::delete_activity(conn, id))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Categories ─────────────────────────────────────────────────

    pub async fn categories(&self) -> Result<CategoryConfig> {
        self.db
            .reader()
            .call(|conn| repository::get_categories(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn set_categories(&self, config: CategoryConfig) -> Result<()> {
        self.db
            .writer()
            .call(move |conn| repository::set_categories(conn, &config))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Status ─────────────────────────────────────────────────────

    pub async fn status(&self) -> Result<WarehouseStatus> {
        self.db
            .reader()
            .call(|conn| {
                let activity_count = repository::count_activities(conn)?;
                let cached_reports = repository::list_cached_reports(conn)?;
                Ok::<_, rusqlite::Error>(WarehouseStatus {
                    activity_count,
                    cached_reports,
                })
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}
