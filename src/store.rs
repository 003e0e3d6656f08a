//! Event & Anomaly Store
//!
//! Single SQLite database behind a mutex. All transactions are short: the
//! retention sweep and concurrent ingestion share this store and nothing
//! here holds the lock across I/O that is not the database itself.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{PipelineError, PipelineResult};
use crate::model::{Anomaly, AnomalyStatus, Explanation, LogEvent, LogType, Severity};

// ============================================================================
// SCHEMA
// ============================================================================

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS log_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT NOT NULL,
    endpoint_id TEXT NOT NULL,
    log_type    TEXT NOT NULL,
    source      TEXT NOT NULL,
    severity    TEXT NOT NULL,
    message     TEXT NOT NULL,
    raw_data    TEXT
);

CREATE TABLE IF NOT EXISTS anomalies (
    id               TEXT PRIMARY KEY,
    type             TEXT NOT NULL,
    status           TEXT NOT NULL DEFAULT 'active',
    risk_score       INTEGER NOT NULL,
    source           TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    resolved_at      TEXT,
    explanation_json TEXT NOT NULL
);

-- Join table carrying the composite dedup key: one anomaly per
-- (rule_id, log_id). Event deletion cascades to links, never to anomalies.
CREATE TABLE IF NOT EXISTS anomaly_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    anomaly_id TEXT NOT NULL REFERENCES anomalies(id) ON DELETE CASCADE,
    log_id     INTEGER NOT NULL REFERENCES log_events(id) ON DELETE CASCADE,
    rule_id    TEXT NOT NULL,
    UNIQUE(rule_id, log_id)
);

CREATE INDEX IF NOT EXISTS idx_events_endpoint ON log_events(endpoint_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_type ON log_events(log_type, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON log_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_anomalies_status ON anomalies(status);
CREATE INDEX IF NOT EXISTS idx_links_anomaly ON anomaly_events(anomaly_id);
"#;

// ============================================================================
// TIMESTAMP ENCODING
// ============================================================================

// RFC3339 with a fixed `+00:00` offset sorts lexicographically, so TEXT
// comparisons in SQL agree with chronological order.
fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(s: &str) -> PipelineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Decode(format!("bad timestamp '{}': {}", s, e)))
}

// ============================================================================
// STORE
// ============================================================================

/// Shared handle to the event/anomaly database.
pub struct Store {
    conn: Mutex<Connection>,
}

/// Aggregate anomaly counters for the operator dashboard.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct AnomalyStats {
    pub active: u64,
    pub investigating: u64,
    pub resolved: u64,
    pub avg_risk: u32,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> PipelineResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> PipelineResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> PipelineResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ------------------------------------------------------------------
    // LOG EVENTS
    // ------------------------------------------------------------------

    /// Append one event. The stored timestamp is the one passed in, which
    /// the pipeline sets server-side at write time.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_event(
        &self,
        timestamp: DateTime<Utc>,
        endpoint_id: &str,
        log_type: &LogType,
        source: &str,
        severity: Severity,
        message: &str,
        raw_data: Option<&str>,
    ) -> PipelineResult<LogEvent> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO log_events (timestamp, endpoint_id, log_type, source, severity, message, raw_data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ts_to_sql(&timestamp),
                endpoint_id,
                log_type.as_str(),
                source,
                severity.as_str(),
                message,
                raw_data,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(LogEvent {
            id,
            timestamp,
            endpoint_id: endpoint_id.to_string(),
            log_type: log_type.clone(),
            source: source.to_string(),
            severity,
            message: message.to_string(),
            raw_data: raw_data.map(|s| s.to_string()),
        })
    }

    pub fn event_by_id(&self, id: i64) -> PipelineResult<Option<LogEvent>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, timestamp, endpoint_id, log_type, source, severity, message, raw_data
             FROM log_events WHERE id = ?1",
            params![id],
            row_to_event,
        )
        .optional()
        .map_err(PipelineError::from)
    }

    /// Count events of one type for an endpoint within a trailing time
    /// window ending at `now`. When `src_ip` is given, only events whose
    /// raw payload carries that source IP are counted; the payload filter
    /// runs in Rust because raw_data schemas vary per log_type.
    pub fn count_recent(
        &self,
        log_type: Option<&LogType>,
        endpoint_id: &str,
        src_ip: Option<&str>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> PipelineResult<u64> {
        let since = ts_to_sql(&(now - window));
        let until = ts_to_sql(&now);
        let conn = self.conn.lock();

        let mut sql = String::from(
            "SELECT id, timestamp, endpoint_id, log_type, source, severity, message, raw_data
             FROM log_events WHERE endpoint_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3",
        );
        if log_type.is_some() {
            sql.push_str(" AND log_type = ?4");
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<LogEvent> = match log_type {
            Some(t) => stmt
                .query_map(params![endpoint_id, since, until, t.as_str()], row_to_event)?
                .collect::<Result<_, _>>()?,
            None => stmt
                .query_map(params![endpoint_id, since, until], row_to_event)?
                .collect::<Result<_, _>>()?,
        };

        let count = match src_ip {
            Some(ip) => rows.iter().filter(|e| e.src_ip().as_deref() == Some(ip)).count(),
            None => rows.len(),
        };
        Ok(count as u64)
    }

    /// Most recent events for an endpoint, newest first, messages truncated
    /// to `max_len` characters. Used to build explanation context.
    pub fn recent_excerpts(
        &self,
        endpoint_id: &str,
        limit: usize,
        max_len: usize,
    ) -> PipelineResult<Vec<LogExcerpt>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, source, message FROM log_events
             WHERE endpoint_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![endpoint_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut excerpts = Vec::new();
        for row in rows {
            let (ts, source, message) = row?;
            excerpts.push(LogExcerpt {
                timestamp: ts_from_sql(&ts)?,
                source,
                message: truncate_chars(&message, max_len),
            });
        }
        Ok(excerpts)
    }

    /// Events explorer (operator surface): newest first with optional
    /// filters, capped at `limit`.
    pub fn list_events(
        &self,
        endpoint_id: Option<&str>,
        log_type: Option<&LogType>,
        severity: Option<Severity>,
        limit: usize,
    ) -> PipelineResult<Vec<LogEvent>> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, endpoint_id, log_type, source, severity, message, raw_data
             FROM log_events WHERE 1=1",
        );
        let mut binds: Vec<String> = Vec::new();
        if let Some(ep) = endpoint_id {
            binds.push(ep.to_string());
            sql.push_str(&format!(" AND endpoint_id = ?{}", binds.len()));
        }
        if let Some(t) = log_type {
            binds.push(t.as_str().to_string());
            sql.push_str(&format!(" AND log_type = ?{}", binds.len()));
        }
        if let Some(s) = severity {
            binds.push(s.as_str().to_string());
            sql.push_str(&format!(" AND severity = ?{}", binds.len()));
        }
        binds.push(limit.to_string());
        sql.push_str(&format!(" ORDER BY timestamp DESC, id DESC LIMIT ?{}", binds.len()));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter()), row_to_event)?;
        rows.collect::<Result<_, _>>().map_err(PipelineError::from)
    }

    /// All events strictly older than the cutoff, oldest first.
    pub fn events_older_than(&self, cutoff: DateTime<Utc>) -> PipelineResult<Vec<LogEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, endpoint_id, log_type, source, severity, message, raw_data
             FROM log_events WHERE timestamp < ?1 ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![ts_to_sql(&cutoff)], row_to_event)?;
        rows.collect::<Result<_, _>>().map_err(PipelineError::from)
    }

    /// Delete events older than the cutoff. The cutoff is re-applied here
    /// rather than deleting by collected ids, so rows written after the
    /// selection are never touched.
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> PipelineResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM log_events WHERE timestamp < ?1",
            params![ts_to_sql(&cutoff)],
        )?;
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // ANOMALIES
    // ------------------------------------------------------------------

    /// Is there already an anomaly for this (rule, event) pair?
    pub fn anomaly_exists(&self, rule_id: &str, log_id: i64) -> PipelineResult<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM anomaly_events WHERE rule_id = ?1 AND log_id = ?2",
                params![rule_id, log_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Persist an anomaly and its event link as one transaction.
    ///
    /// Returns `false` without writing anything when the (rule_id, log_id)
    /// link already exists; the composite key makes duplicate submissions
    /// a no-op even when two evaluations race past `anomaly_exists`.
    pub fn insert_anomaly(
        &self,
        anomaly: &Anomaly,
        rule_id: &str,
        log_id: i64,
    ) -> PipelineResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO anomalies (id, type, status, risk_score, source, created_at, resolved_at, explanation_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                anomaly.id,
                anomaly.anomaly_type,
                anomaly.status.as_str(),
                anomaly.risk_score as i64,
                anomaly.source,
                ts_to_sql(&anomaly.created_at),
                anomaly.resolved_at.as_ref().map(ts_to_sql),
                serde_json::to_string(&anomaly.explanation)?,
            ],
        )?;

        let linked = tx.execute(
            "INSERT OR IGNORE INTO anomaly_events (anomaly_id, log_id, rule_id)
             VALUES (?1, ?2, ?3)",
            params![anomaly.id, log_id, rule_id],
        )?;
        if linked == 0 {
            // Lost the race: another evaluation already owns this pair.
            // Dropping the transaction rolls the anomaly row back.
            return Ok(false);
        }

        tx.commit()?;
        Ok(true)
    }

    pub fn anomaly_by_id(&self, id: &str) -> PipelineResult<Option<Anomaly>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, type, status, risk_score, source, created_at, resolved_at, explanation_json
             FROM anomalies WHERE id = ?1",
            params![id],
            row_to_anomaly,
        )
        .optional()
        .map_err(PipelineError::from)
    }

    /// All anomalies, newest first.
    pub fn list_anomalies(&self) -> PipelineResult<Vec<Anomaly>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, type, status, risk_score, source, created_at, resolved_at, explanation_json
             FROM anomalies ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_anomaly)?;
        rows.collect::<Result<_, _>>().map_err(PipelineError::from)
    }

    /// Event ids linked to an anomaly.
    pub fn linked_event_ids(&self, anomaly_id: &str) -> PipelineResult<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT log_id FROM anomaly_events WHERE anomaly_id = ?1 ORDER BY log_id")?;
        let rows = stmt.query_map(params![anomaly_id], |row| row.get::<_, i64>(0))?;
        rows.collect::<Result<_, _>>().map_err(PipelineError::from)
    }

    /// Status counters + average risk across all anomalies.
    pub fn anomaly_stats(&self) -> PipelineResult<AnomalyStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, risk_score FROM anomalies")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = AnomalyStats::default();
        let mut total_risk: i64 = 0;
        let mut count: i64 = 0;
        for row in rows {
            let (status, risk) = row?;
            match status.as_str() {
                "investigating" => stats.investigating += 1,
                "resolved" => stats.resolved += 1,
                _ => stats.active += 1,
            }
            total_risk += risk;
            count += 1;
        }
        if count > 0 {
            stats.avg_risk = ((total_risk as f64 / count as f64).round()) as u32;
        }
        Ok(stats)
    }

    /// Operator status transition. `resolved_at` is stamped only on the
    /// transition into `resolved`.
    pub fn update_anomaly_status(
        &self,
        anomaly_id: &str,
        status: AnomalyStatus,
        now: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let conn = self.conn.lock();
        let resolved_at = match status {
            AnomalyStatus::Resolved => Some(ts_to_sql(&now)),
            _ => None,
        };
        let updated = conn.execute(
            "UPDATE anomalies SET status = ?2,
                    resolved_at = CASE WHEN ?2 = 'resolved' THEN COALESCE(resolved_at, ?3) ELSE resolved_at END
             WHERE id = ?1",
            params![anomaly_id, status.as_str(), resolved_at],
        )?;
        if updated == 0 {
            return Err(PipelineError::NotFound(format!("anomaly {}", anomaly_id)));
        }
        Ok(())
    }
}

/// One sanitized log excerpt for explanation context.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogExcerpt {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub message: String,
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEvent> {
    let ts: String = row.get(1)?;
    let log_type: String = row.get(3)?;
    let severity: String = row.get(5)?;
    Ok(LogEvent {
        id: row.get(0)?,
        timestamp: ts_from_sql(&ts).map_err(|_| rusqlite::Error::InvalidQuery)?,
        endpoint_id: row.get(2)?,
        log_type: LogType::parse(&log_type),
        source: row.get(4)?,
        severity: Severity::normalize(&severity),
        message: row.get(6)?,
        raw_data: row.get(7)?,
    })
}

fn row_to_anomaly(row: &rusqlite::Row<'_>) -> rusqlite::Result<Anomaly> {
    let status: String = row.get(2)?;
    let created: String = row.get(5)?;
    let resolved: Option<String> = row.get(6)?;
    let explanation_json: String = row.get(7)?;
    Ok(Anomaly {
        id: row.get(0)?,
        anomaly_type: row.get(1)?,
        status: AnomalyStatus::parse(&status).unwrap_or(AnomalyStatus::Active),
        risk_score: row.get::<_, i64>(3)? as u8,
        source: row.get(4)?,
        created_at: ts_from_sql(&created).map_err(|_| rusqlite::Error::InvalidQuery)?,
        resolved_at: match resolved {
            Some(s) => Some(ts_from_sql(&s).map_err(|_| rusqlite::Error::InvalidQuery)?),
            None => None,
        },
        explanation: serde_json::from_str::<Explanation>(&explanation_json).unwrap_or_default(),
    })
}

fn truncate_chars(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
