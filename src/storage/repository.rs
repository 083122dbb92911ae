use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};

use crate::period::Granularity;
use crate::report::{timestamp_format, ActivityEntry, CategoryConfig, ReportDocument};

/// A cached report row. `generated_at` is UTC warehouse text
/// (`datetime('now')` format).
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub granularity: Granularity,
    pub period_key: String,
    pub generated_at: String,
    pub document: ReportDocument,
    pub artifact_path: Option<String>,
}

fn json_to_sql_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(e))
}

fn json_from_sql_err(e: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

// ── Activity log ───────────────────────────────────────────────────

pub fn insert_activity(conn: &Connection, entry: &ActivityEntry) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO activity_logs (timestamp, duration_minutes, category, \"group\", description)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.timestamp.format(timestamp_format::FORMAT).to_string(),
            entry.duration_minutes,
            entry.category,
            entry.group,
            entry.description,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_activity_row(row: &rusqlite::Row<'_>) -> Result<ActivityEntry, rusqlite::Error> {
    let ts: String = row.get(1)?;
    let timestamp = NaiveDateTime::parse_from_str(&ts, timestamp_format::FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(&ts, "%Y-%m-%d %H:%M:%S"))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(ActivityEntry {
        id: row.get(0)?,
        timestamp,
        duration_minutes: row.get(2)?,
        category: row.get(3)?,
        group: row.get(4)?,
        description: row.get(5)?,
    })
}

/// Entries whose timestamp falls on a date in `[start, end]`, ordered by
/// timestamp. Relies on the warehouse text format sorting lexicographically.
pub fn query_entries(
    conn: &Connection,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<ActivityEntry>, rusqlite::Error> {
    let lower = start.format("%Y-%m-%d").to_string();
    let upper = (end + chrono::Duration::days(1))
        .format("%Y-%m-%d")
        .to_string();
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, duration_minutes, category, \"group\", description
         FROM activity_logs
         WHERE timestamp >= ?1 AND timestamp < ?2
         ORDER BY timestamp",
    )?;
    let rows = stmt.query_map(params![lower, upper], map_activity_row)?;
    rows.collect()
}

pub fn list_activities(
    conn: &Connection,
    limit: u32,
) -> Result<Vec<ActivityEntry>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, duration_minutes, category, \"group\", description
         FROM activity_logs
         ORDER BY timestamp DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], map_activity_row)?;
    rows.collect()
}

pub fn update_activity(conn: &Connection, entry: &ActivityEntry) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "UPDATE activity_logs
         SET timestamp = ?2, duration_minutes = ?3, category = ?4, \"group\" = ?5, description = ?6
         WHERE id = ?1",
        params![
            entry.id,
            entry.timestamp.format(timestamp_format::FORMAT).to_string(),
            entry.duration_minutes,
            entry.category,
            entry.group,
            entry.description,
        ],
    )?;
    Ok(changed > 0)
}

pub fn delete_activity(conn: &Connection, id: i64) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute("DELETE FROM activity_logs WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}

pub fn count_activities(conn: &Connection) -> Result<i64, rusqlite::Error> {
    conn.query_row("SELECT COUNT(*) FROM activity_logs", [], |row| row.get(0))
}

// ── Report cache ───────────────────────────────────────────────────

pub fn get_cached_report(
    conn: &Connection,
    granularity: Granularity,
    period_key: &str,
) -> Result<Option<CacheRecord>, rusqlite::Error> {
    conn.query_row(
        "SELECT generated_at, document, artifact_path FROM report_cache
         WHERE granularity = ?1 AND period_key = ?2",
        params![granularity.as_str(), period_key],
        |row| {
            let document_json: String = row.get(1)?;
            let document = serde_json::from_str(&document_json).map_err(json_from_sql_err)?;
            Ok(CacheRecord {
                granularity,
                period_key: period_key.to_string(),
                generated_at: row.get(0)?,
                document,
                artifact_path: row.get(2)?,
            })
        },
    )
    .optional()
}

/// Store a generated report. A single `INSERT OR REPLACE` so a prior row is
/// only ever replaced by a complete new one.
pub fn put_cached_report(
    conn: &Connection,
    granularity: Granularity,
    period_key: &str,
    document: &ReportDocument,
    artifact_path: Option<&str>,
) -> Result<(), rusqlite::Error> {
    let document_json = serde_json::to_string(document).map_err(json_to_sql_err)?;
    conn.execute(
        "INSERT OR REPLACE INTO report_cache
         (granularity, period_key, generated_at, document, artifact_path)
         VALUES (?1, ?2, datetime('now'), ?3, ?4)",
        params![granularity.as_str(), period_key, document_json, artifact_path],
    )?;
    Ok(())
}

pub fn invalidate_report(
    conn: &Connection,
    granularity: Granularity,
    period_key: &str,
) -> Result<bool, rusqlite::Error> {
    let changed = conn.execute(
        "DELETE FROM report_cache WHERE granularity = ?1 AND period_key = ?2",
        params![granularity.as_str(), period_key],
    )?;
    Ok(changed > 0)
}

/// (granularity, period_key, generated_at) for every cached report.
pub fn list_cached_reports(
    conn: &Connection,
) -> Result<Vec<(String, String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT granularity, period_key, generated_at FROM report_cache
         ORDER BY granularity, period_key",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
    rows.collect()
}

// ── App config ─────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Categories ─────────────────────────────────────────────────────

const CATEGORIES_KEY: &str = "categories";

pub fn get_categories(conn: &Connection) -> Result<CategoryConfig, rusqlite::Error> {
    match get_config(conn, CATEGORIES_KEY)? {
        Some(json) => serde_json::from_str(&json).map_err(json_from_sql_err),
        None => Ok(CategoryConfig::default()),
    }
}

pub fn set_categories(conn: &Connection, config: &CategoryConfig) -> Result<(), rusqlite::Error> {
    let json = serde_json::to_string(config).map_err(json_to_sql_err)?;
    set_config(conn, CATEGORIES_KEY, &json)
}
