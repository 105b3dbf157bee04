//! SQLite backend.
//!
//! One connection per operation, opened inside `spawn_blocking`. Instants
//! stamped by this process are stored as epoch milliseconds.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::task;

use super::{ExcursionStore, PolicyStore, ReadingStore, RiskScoreStore, ShipmentStore, StoreError};
use crate::audit::{AuditEntry, AuditLogger, AuditRecord};
use crate::model::{Excursion, Policy, PolicyRules, Reading, RiskFactor, RiskScore, Shipment};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS shipments (
    id TEXT PRIMARY KEY,
    facility_id TEXT,
    product_type TEXT NOT NULL,
    policy_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS policies (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    rules TEXT NOT NULL,
    active INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    shipment_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    temperature REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_readings_shipment_ts ON readings(shipment_id, timestamp);
CREATE TABLE IF NOT EXISTS excursions (
    id TEXT PRIMARY KEY,
    shipment_id TEXT NOT NULL,
    policy_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    duration_minutes REAL NOT NULL,
    rule_violated TEXT NOT NULL,
    temperature REAL,
    detected_at INTEGER NOT NULL,
    resolved_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_excursions_shipment_start ON excursions(shipment_id, start_time);
CREATE TABLE IF NOT EXISTS risk_scores (
    shipment_id TEXT PRIMARY KEY,
    score TEXT NOT NULL,
    score_value INTEGER NOT NULL,
    factors TEXT NOT NULL,
    computed_at INTEGER NOT NULL,
    ai_summary TEXT
);
CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    shipment_id TEXT,
    facility_id TEXT,
    event_type TEXT NOT NULL,
    rule_violated TEXT,
    severity TEXT,
    corrective_action TEXT,
    details TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_shipment ON audit_log(shipment_id, timestamp);
CREATE TABLE IF NOT EXISTS audit_narratives (
    audit_id TEXT PRIMARY KEY,
    narrative TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

const EXCURSION_COLUMNS: &str = "id, shipment_id, policy_id, kind, severity, start_time, end_time, \
     duration_minutes, rule_violated, temperature, detected_at, resolved_at";

const AUDIT_SELECT: &str = "SELECT a.id, a.timestamp, a.shipment_id, a.facility_id, a.event_type, \
     a.rule_violated, a.severity, a.corrective_action, a.details, n.narrative \
     FROM audit_log a LEFT JOIN audit_narratives n ON n.audit_id = a.id";

pub(crate) fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("Failed to open database {:?}", path))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn parse_col<T: FromStr>(column: &'static str, value: String) -> Result<T> {
    match value.parse::<T>() {
        Ok(parsed) => Ok(parsed),
        Err(_) => Err(StoreError::Corrupt { column, value }.into()),
    }
}

fn instant(column: &'static str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        StoreError::Corrupt {
            column,
            value: millis.to_string(),
        }
        .into()
    })
}

struct ExcursionRow {
    id: String,
    shipment_id: String,
    policy_id: String,
    kind: String,
    severity: String,
    start_time: i64,
    end_time: i64,
    duration_minutes: f64,
    rule_violated: String,
    temperature: Option<f64>,
    detected_at: i64,
    resolved_at: Option<i64>,
}

impl ExcursionRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            shipment_id: row.get(1)?,
            policy_id: row.get(2)?,
            kind: row.get(3)?,
            severity: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            duration_minutes: row.get(7)?,
            rule_violated: row.get(8)?,
            temperature: row.get(9)?,
            detected_at: row.get(10)?,
            resolved_at: row.get(11)?,
        })
    }

    fn into_excursion(self) -> Result<Excursion> {
        Ok(Excursion {
            id: self.id,
            shipment_id: self.shipment_id,
            policy_id: self.policy_id,
            kind: parse_col("kind", self.kind)?,
            severity: parse_col("severity", self.severity)?,
            start_time: self.start_time,
            end_time: self.end_time,
            duration_minutes: self.duration_minutes,
            rule_violated: self.rule_violated,
            temperature: self.temperature,
            detected_at: instant("detected_at", self.detected_at)?,
            resolved_at: self.resolved_at.map(|ms| instant("resolved_at", ms)).transpose()?,
        })
    }
}

struct AuditRow {
    id: String,
    timestamp: i64,
    shipment_id: Option<String>,
    facility_id: Option<String>,
    event_type: String,
    rule_violated: Option<String>,
    severity: Option<String>,
    corrective_action: Option<String>,
    details: String,
    narrative: Option<String>,
}

impl AuditRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            shipment_id: row.get(2)?,
            facility_id: row.get(3)?,
            event_type: row.get(4)?,
            rule_violated: row.get(5)?,
            severity: row.get(6)?,
            corrective_action: row.get(7)?,
            details: row.get(8)?,
            narrative: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<AuditRecord> {
        Ok(AuditRecord {
            entry: AuditEntry {
                id: self.id,
                timestamp: instant("timestamp", self.timestamp)?,
                shipment_id: self.shipment_id,
                facility_id: self.facility_id,
                event_type: parse_col("event_type", self.event_type)?,
                rule_violated: self.rule_violated,
                severity: self.severity.map(|s| parse_col("severity", s)).transpose()?,
                corrective_action: self.corrective_action,
                details: serde_json::from_str(&self.details).context("Failed to decode audit details")?,
            },
            narrative: self.narrative,
        })
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = connect(&path_clone)?;
            conn.execute_batch(SCHEMA).context("Failed to create schema")?;
            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }

    /// Run a blocking closure against a fresh connection.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl ShipmentStore for SqliteStore {
    async fn get_shipment(&self, shipment_id: &str) -> Result<Option<Shipment>> {
        let id = shipment_id.to_string();
        self.with_conn(move |conn| {
            let shipment = conn
                .query_row(
                    "SELECT id, facility_id, product_type, policy_id FROM shipments WHERE id = ?1",
                    params![&id],
                    |row| {
                        Ok(Shipment {
                            id: row.get(0)?,
                            facility_id: row.get(1)?,
                            product_type: row.get(2)?,
                            policy_id: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(shipment)
        })
        .await
    }

    async fn put_shipment(&self, shipment: &Shipment) -> Result<()> {
        let s = shipment.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO shipments (id, facility_id, product_type, policy_id) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET facility_id = excluded.facility_id,
                     product_type = excluded.product_type, policy_id = excluded.policy_id",
                params![&s.id, &s.facility_id, &s.product_type, &s.policy_id],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl PolicyStore for SqliteStore {
    async fn get_policy(&self, policy_id: &str) -> Result<Option<Policy>> {
        let id = policy_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, String, String, bool, i64)> = conn
                .query_row(
                    "SELECT id, name, rules, active, updated_at FROM policies WHERE id = ?1",
                    params![&id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()?;

            let Some((id, name, rules, active, updated_at)) = row else {
                return Ok(None);
            };
            let rules: serde_json::Value = serde_json::from_str(&rules).context("Failed to decode policy rules")?;
            Ok(Some(Policy {
                id,
                name,
                rules: PolicyRules::from_json(rules)?,
                active,
                updated_at: instant("updated_at", updated_at)?,
            }))
        })
        .await
    }

    async fn put_policy(&self, policy: &Policy) -> Result<()> {
        policy.rules.validate()?;
        let p = policy.clone();
        let rules = serde_json::to_string(&p.rules)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO policies (id, name, type, rules, active, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, type = excluded.type,
                     rules = excluded.rules, active = excluded.active, updated_at = excluded.updated_at",
                params![
                    &p.id,
                    &p.name,
                    p.policy_type().as_str(),
                    &rules,
                    p.active,
                    p.updated_at.timestamp_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ReadingStore for SqliteStore {
    async fn readings_for(&self, shipment_id: &str) -> Result<Vec<Reading>> {
        let id = shipment_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, temperature FROM readings WHERE shipment_id = ?1 ORDER BY timestamp ASC, id ASC",
            )?;
            let readings = stmt
                .query_map(params![&id], |row| Ok(Reading::new(row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(readings)
        })
        .await
    }

    async fn append_readings(&self, shipment_id: &str, readings: &[Reading]) -> Result<()> {
        let id = shipment_id.to_string();
        let batch = readings.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare("INSERT INTO readings (shipment_id, timestamp, temperature) VALUES (?1, ?2, ?3)")?;
                for r in &batch {
                    stmt.execute(params![&id, r.timestamp, r.temperature])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ExcursionStore for SqliteStore {
    async fn find_in_window(&self, shipment_id: &str, from: i64, to: i64) -> Result<Option<Excursion>> {
        let id = shipment_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM excursions WHERE shipment_id = ?1
                         AND start_time BETWEEN ?2 AND ?3 LIMIT 1",
                        EXCURSION_COLUMNS
                    ),
                    params![&id, from, to],
                    ExcursionRow::read,
                )
                .optional()?;
            row.map(ExcursionRow::into_excursion).transpose()
        })
        .await
    }

    async fn insert(&self, excursion: &Excursion) -> Result<()> {
        let e = excursion.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO excursions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    EXCURSION_COLUMNS
                ),
                params![
                    &e.id,
                    &e.shipment_id,
                    &e.policy_id,
                    e.kind.as_str(),
                    e.severity.as_str(),
                    e.start_time,
                    e.end_time,
                    e.duration_minutes,
                    &e.rule_violated,
                    e.temperature,
                    e.detected_at.timestamp_millis(),
                    e.resolved_at.map(|t| t.timestamp_millis()),
                ],
            )
            .context("Failed to insert excursion")?;
            Ok(())
        })
        .await
    }

    async fn discard(&self, excursion_id: &str) -> Result<bool> {
        let id = excursion_id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM excursions WHERE id = ?1", params![&id])?;
            Ok(removed == 1)
        })
        .await
    }

    async fn list_for_shipment(&self, shipment_id: &str) -> Result<Vec<Excursion>> {
        let id = shipment_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM excursions WHERE shipment_id = ?1 ORDER BY start_time ASC",
                EXCURSION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![&id], ExcursionRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ExcursionRow::into_excursion).collect()
        })
        .await
    }

    async fn get_excursion(&self, excursion_id: &str) -> Result<Option<Excursion>> {
        let id = excursion_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM excursions WHERE id = ?1", EXCURSION_COLUMNS),
                    params![&id],
                    ExcursionRow::read,
                )
                .optional()?;
            row.map(ExcursionRow::into_excursion).transpose()
        })
        .await
    }

    async fn resolve(&self, excursion_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let id = excursion_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE excursions SET resolved_at = ?1 WHERE id = ?2 AND resolved_at IS NULL",
                params![at.timestamp_millis(), &id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn count_open(&self, shipment_id: &str) -> Result<usize> {
        let id = shipment_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM excursions WHERE shipment_id = ?1 AND resolved_at IS NULL",
                params![&id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }
}

#[async_trait]
impl RiskScoreStore for SqliteStore {
    async fn latest(&self, shipment_id: &str) -> Result<Option<RiskScore>> {
        let id = shipment_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, String, i64, String, i64, Option<String>)> = conn
                .query_row(
                    "SELECT shipment_id, score, score_value, factors, computed_at, ai_summary
                     FROM risk_scores WHERE shipment_id = ?1",
                    params![&id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
                )
                .optional()?;

            let Some((shipment_id, score, score_value, factors, computed_at, ai_summary)) = row else {
                return Ok(None);
            };
            let factors: BTreeSet<RiskFactor> =
                serde_json::from_str(&factors).context("Failed to decode risk factors")?;
            let score_value = u8::try_from(score_value).map_err(|_| StoreError::Corrupt {
                column: "score_value",
                value: score_value.to_string(),
            })?;
            Ok(Some(RiskScore {
                shipment_id,
                score: parse_col("score", score)?,
                score_value,
                factors,
                computed_at: instant("computed_at", computed_at)?,
                ai_summary,
            }))
        })
        .await
    }

    async fn upsert(&self, score: &RiskScore) -> Result<()> {
        let s = score.clone();
        let factors = serde_json::to_string(&s.factors)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO risk_scores (shipment_id, score, score_value, factors, computed_at, ai_summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(shipment_id) DO UPDATE SET score = excluded.score,
                     score_value = excluded.score_value, factors = excluded.factors,
                     computed_at = excluded.computed_at, ai_summary = excluded.ai_summary",
                params![
                    &s.shipment_id,
                    s.score.as_str(),
                    s.score_value as i64,
                    &factors,
                    s.computed_at.timestamp_millis(),
                    &s.ai_summary
                ],
            )
            .context("Failed to upsert risk score")?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl AuditLogger for SqliteStore {
    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let e = entry.clone();
        let details = serde_json::to_string(&e.details)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO audit_log (id, timestamp, shipment_id, facility_id, event_type, rule_violated,
                     severity, corrective_action, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    &e.id,
                    e.timestamp.timestamp_millis(),
                    &e.shipment_id,
                    &e.facility_id,
                    e.event_type.as_str(),
                    &e.rule_violated,
                    e.severity.map(|s| s.as_str()),
                    &e.corrective_action,
                    &details
                ],
            )
            .context("Failed to append audit entry")?;
            Ok(())
        })
        .await
    }

    async fn annotate_narrative(&self, audit_id: &str, text: &str) -> Result<()> {
        let id = audit_id.to_string();
        let text = text.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let exists: Option<i64> = tx
                .query_row("SELECT 1 FROM audit_log WHERE id = ?1", params![&id], |row| row.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::UnknownAuditEntry(id).into());
            }
            tx.execute(
                "INSERT INTO audit_narratives (audit_id, narrative, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(audit_id) DO UPDATE SET narrative = excluded.narrative, updated_at = excluded.updated_at",
                params![&id, &text, Utc::now().timestamp_millis()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, audit_id: &str) -> Result<Option<AuditRecord>> {
        let id = audit_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(&format!("{} WHERE a.id = ?1", AUDIT_SELECT), params![&id], AuditRow::read)
                .optional()?;
            row.map(AuditRow::into_record).transpose()
        })
        .await
    }

    async fn list_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE a.timestamp BETWEEN ?1 AND ?2 ORDER BY a.timestamp ASC",
                AUDIT_SELECT
            ))?;
            let rows = stmt
                .query_map(params![from.timestamp_millis(), to.timestamp_millis()], AuditRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(AuditRow::into_record).collect()
        })
        .await
    }

    async fn list_for_shipment(&self, shipment_id: &str) -> Result<Vec<AuditRecord>> {
        let id = shipment_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE a.shipment_id = ?1 ORDER BY a.timestamp ASC",
                AUDIT_SELECT
            ))?;
            let rows = stmt
                .query_map(params![&id], AuditRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(AuditRow::into_record).collect()
        })
        .await
    }
}
