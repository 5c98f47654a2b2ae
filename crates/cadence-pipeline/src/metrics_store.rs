use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use cadence_core::error::{CadenceError, Result};
use cadence_core::metrics::HandoffMetrics;
use cadence_core::types::{CampaignId, Stage};

/// Append-only handoff metrics backed by SQLite.
///
/// Rows are only ever inserted, so concurrent writers from different
/// campaigns never conflict.
pub struct MetricsStore {
    conn: Mutex<Connection>,
}

impl MetricsStore {
    /// Open or create the metrics database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CadenceError::Metrics(format!("Failed to create metrics directory: {}", e))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| CadenceError::Metrics(format!("Failed to open metrics store: {}", e)))?;
        Self::init(conn)
    }

    /// A throwaway store, used when no database path is configured.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CadenceError::Metrics(format!("Failed to open metrics store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS handoff_metrics (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 handoff_id TEXT NOT NULL,
                 campaign_id TEXT NOT NULL,
                 source_stage TEXT NOT NULL,
                 target_stage TEXT,
                 start_time TEXT NOT NULL,
                 end_time TEXT NOT NULL,
                 duration_ms INTEGER NOT NULL,
                 data_size_bytes INTEGER NOT NULL DEFAULT 0,
                 validation_duration_ms INTEGER NOT NULL DEFAULT 0,
                 success INTEGER NOT NULL,
                 error TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_hm_campaign
                 ON handoff_metrics(campaign_id, id);",
        )
        .map_err(|e| CadenceError::Metrics(format!("Failed to initialize metrics schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one handoff record.
    pub fn record(&self, m: &HandoffMetrics) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CadenceError::Metrics(e.to_string()))?;
        conn.execute(
            "INSERT INTO handoff_metrics (handoff_id, campaign_id, source_stage, target_stage, start_time, end_time,
                 duration_ms, data_size_bytes, validation_duration_ms, success, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                m.handoff_id,
                m.campaign_id.as_str(),
                m.source_stage.as_str(),
                m.target_stage.map(Stage::as_str),
                m.start_time.to_rfc3339(),
                m.end_time.to_rfc3339(),
                m.duration_ms as i64,
                m.data_size_bytes as i64,
                m.validation_duration_ms as i64,
                m.success as i32,
                m.error,
            ],
        )
        .map_err(|e| CadenceError::Metrics(format!("Failed to record handoff metrics: {}", e)))?;
        Ok(())
    }

    /// Every record for a campaign, in insertion order.
    pub fn for_campaign(&self, campaign_id: &CampaignId) -> Result<Vec<HandoffMetrics>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CadenceError::Metrics(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT handoff_id, campaign_id, source_stage, target_stage, start_time, end_time,
                        duration_ms, data_size_bytes, validation_duration_ms, success, error
                 FROM handoff_metrics
                 WHERE campaign_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(|e| CadenceError::Metrics(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![campaign_id.as_str()], |row| {
                let source: String = row.get(2)?;
                let target: Option<String> = row.get(3)?;
                let start: String = row.get(4)?;
                let end: String = row.get(5)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    source,
                    target,
                    start,
                    end,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i32>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            })
            .map_err(|e| CadenceError::Metrics(format!("Failed to query metrics: {}", e)))?;

        let mut out = Vec::new();
        for row in rows {
            let (handoff_id, campaign, source, target, start, end, dur, bytes, val, ok, error) =
                row.map_err(|e| CadenceError::Metrics(e.to_string()))?;
            out.push(HandoffMetrics {
                handoff_id,
                campaign_id: CampaignId(campaign),
                source_stage: source.parse()?,
                target_stage: target.map(|t| t.parse::<Stage>()).transpose()?,
                start_time: parse_time(&start),
                end_time: parse_time(&end),
                duration_ms: dur.max(0) as u64,
                data_size_bytes: bytes.max(0) as u64,
                validation_duration_ms: val.max(0) as u64,
                success: ok != 0,
                error,
            });
        }
        Ok(out)
    }

    /// Campaign ids with at least one record.
    pub fn campaigns(&self) -> Result<Vec<CampaignId>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CadenceError::Metrics(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT campaign_id FROM handoff_metrics ORDER BY campaign_id")
            .map_err(|e| CadenceError::Metrics(format!("Failed to prepare query: {}", e)))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| CadenceError::Metrics(format!("Failed to query campaigns: {}", e)))?
            .filter_map(|r| r.ok())
            .map(CampaignId)
            .collect();
        Ok(ids)
    }

    /// Total number of records.
    pub fn count(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CadenceError::Metrics(e.to_string()))?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM handoff_metrics", [], |row| row.get(0))
            .map_err(|e| CadenceError::Metrics(e.to_string()))?;
        Ok(n as usize)
    }
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
