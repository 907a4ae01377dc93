//! SQLite-backed persistence for the fraud pipeline.
//!
//! Single connection behind a fast mutex, WAL mode for concurrent reads
//! during writes, prepared statement caching, and all multi-row writes
//! inside explicit transactions. Every piece of SQL in the service lives in
//! this module.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::CoreResult;
use crate::models::{
    fmt_ts, parse_ts, AgentDecision, Case, CaseStatus, Channel, DecisionSource, DecisionType,
    DetectionRule, Label, LabelDecision, MetricSnapshot, Metadata, PatternCard, PatternStatus,
    PatternType, Priority, RiskResult, Transaction, TxnType, VelocityContext,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -32000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS transactions (
    txn_id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    amount REAL NOT NULL,
    currency TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    txn_type TEXT NOT NULL,
    channel TEXT NOT NULL,
    ip_address TEXT,
    device_id TEXT,
    is_fraud_ground_truth INTEGER,
    metadata TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS risk_results (
    txn_id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    risk_score REAL NOT NULL,
    flagged INTEGER NOT NULL,
    decision TEXT NOT NULL,
    threshold_used REAL NOT NULL,
    model_version TEXT NOT NULL,
    uncertainty REAL NOT NULL,
    features TEXT,
    reasons TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS cases (
    case_id TEXT PRIMARY KEY,
    txn_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    created_at TEXT NOT NULL,
    updated_at TEXT,
    closed_at TEXT,
    assigned_to TEXT,
    priority TEXT NOT NULL DEFAULT 'medium',
    risk_score REAL NOT NULL,
    explanation TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS analyst_labels (
    label_id TEXT PRIMARY KEY,
    case_id TEXT NOT NULL,
    txn_id TEXT NOT NULL,
    decision TEXT NOT NULL,
    confidence TEXT NOT NULL DEFAULT 'medium',
    labeled_at TEXT NOT NULL,
    labeled_by TEXT,
    fraud_type TEXT,
    notes TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS pattern_cards (
    pattern_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    discovered_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    pattern_type TEXT NOT NULL,
    confidence REAL NOT NULL,
    detection_rule TEXT NOT NULL,
    stats TEXT,
    related_txn_ids TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS metric_snapshots (
    snapshot_id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    model_version TEXT NOT NULL,
    metrics TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS agent_decisions (
    decision_id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    decision_type TEXT NOT NULL,
    reasoning TEXT,
    context TEXT NOT NULL,
    outcome TEXT,
    model_version_before TEXT,
    model_version_after TEXT,
    source TEXT NOT NULL DEFAULT 'deterministic'
) WITHOUT ROWID;

-- Indexes for velocity queries (critical for scoring latency)
CREATE INDEX IF NOT EXISTS idx_txn_sender_ts
    ON transactions(sender_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_txn_receiver_ts
    ON transactions(receiver_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_txn_sender_receiver
    ON transactions(sender_id, receiver_id);
CREATE INDEX IF NOT EXISTS idx_txn_device_ts
    ON transactions(device_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_txn_ip_ts
    ON transactions(ip_address, timestamp);
CREATE INDEX IF NOT EXISTS idx_txn_ts
    ON transactions(timestamp);
CREATE INDEX IF NOT EXISTS idx_cases_status
    ON cases(status, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_risk_results_flagged
    ON risk_results(flagged);
CREATE INDEX IF NOT EXISTS idx_risk_results_ts
    ON risk_results(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_labels_decision
    ON analyst_labels(decision, labeled_at);
CREATE INDEX IF NOT EXISTS idx_agent_decisions_ts
    ON agent_decisions(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_pattern_cards_status
    ON pattern_cards(status, discovered_at DESC);
"#;

/// Transaction summary joined with its risk result, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionSummary {
    pub txn_id: String,
    pub timestamp: String,
    pub amount: f64,
    pub currency: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub txn_type: String,
    pub channel: String,
    pub risk_score: Option<f64>,
    pub decision: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SuggestedCase {
    pub case_id: String,
    pub txn_id: String,
    pub status: String,
    pub created_at: String,
    pub priority: String,
    pub risk_score: f64,
    pub uncertainty: f64,
}

/// Minimal transaction view for graph mining.
#[derive(Debug, Clone)]
pub struct TxnLite {
    pub txn_id: String,
    pub timestamp: String,
    pub amount: f64,
    pub sender_id: String,
    pub receiver_id: String,
}

/// One labeled sample for training. Stored scoring-time features are
/// preferred; amount/type/channel allow recomputation when absent.
#[derive(Debug, Clone)]
pub struct TrainingRow {
    pub features_json: Option<String>,
    pub amount: f64,
    pub txn_type: String,
    pub channel: String,
    pub is_fraud: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_txns: i64,
    pub flagged_txns: i64,
    pub cases_open: i64,
    pub cases_closed: i64,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn new(db_path: &str) -> CoreResult<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // locking handled by our mutex

        let conn = Connection::open_with_flags(db_path, flags)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))
            .unwrap_or(0);
        info!(path = db_path, transactions = count, "database initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Throwaway in-memory store for tests.
    pub fn in_memory() -> CoreResult<Self> {
        Self::new(":memory:")
    }

    // --- Ingestion ---

    /// Persist a scored transaction atomically: transaction row, risk
    /// result row, and the case row when flagged. All or nothing.
    pub fn insert_scored_transaction(
        &self,
        txn: &Transaction,
        risk: &RiskResult,
        case: Option<&Case>,
    ) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO transactions
             (txn_id, timestamp, amount, currency, sender_id, receiver_id, txn_type, channel,
              ip_address, device_id, is_fraud_ground_truth, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                txn.txn_id,
                txn.timestamp,
                txn.amount,
                txn.currency,
                txn.sender_id,
                txn.receiver_id,
                txn.txn_type.as_str(),
                txn.channel.as_str(),
                txn.ip_address,
                txn.device_id,
                txn.is_fraud_ground_truth.map(i64::from),
                txn.metadata
                    .as_ref()
                    .map(|m| serde_json::to_string(m).unwrap_or_default()),
            ],
        )?;

        tx.execute(
            "INSERT INTO risk_results
             (txn_id, timestamp, risk_score, flagged, decision, threshold_used, model_version,
              uncertainty, features, reasons)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                risk.txn_id,
                risk.computed_at,
                risk.score,
                i64::from(risk.flagged),
                risk.decision.as_str(),
                risk.threshold_used,
                risk.model_version,
                risk.uncertainty,
                serde_json::to_string(&risk.features).unwrap_or_default(),
                serde_json::to_string(&risk.reasons).unwrap_or_default(),
            ],
        )?;

        if let Some(case) = case {
            tx.execute(
                "INSERT INTO cases
                 (case_id, txn_id, status, created_at, priority, risk_score)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    case.case_id,
                    case.txn_id,
                    case.status.as_str(),
                    case.created_at,
                    case.priority.as_str(),
                    case.risk_score,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    // --- Velocity query service ---

    /// Rolling-window velocity features for one transaction, computed as of
    /// `now`. Conditional aggregation collapses the per-sender and
    /// per-receiver windows into single scans; DISTINCT counts stay in
    /// their own queries because SQLite's COUNT(DISTINCT CASE WHEN ...)
    /// counts non-NULL CASE results rather than distinct values.
    pub fn velocity_context(
        &self,
        sender_id: &str,
        receiver_id: &str,
        device_id: Option<&str>,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<VelocityContext> {
        let cutoff_1h = fmt_ts(now - Duration::hours(1));
        let cutoff_24h = fmt_ts(now - Duration::hours(24));
        let cutoff_90d = fmt_ts(now - Duration::days(90));

        let conn = self.conn.lock();

        // Sender window stats in one scan.
        let mut stmt = conn.prepare_cached(
            "SELECT
                 COUNT(CASE WHEN timestamp >= ?2 THEN 1 END),
                 COUNT(CASE WHEN timestamp >= ?3 THEN 1 END),
                 COALESCE(SUM(CASE WHEN timestamp >= ?2 THEN amount END), 0.0),
                 MAX(timestamp)
             FROM transactions WHERE sender_id = ?1",
        )?;
        let (count_1h, count_24h, amount_sum_1h, last_ts): (i64, i64, f64, Option<String>) = stmt
            .query_row(params![sender_id, cutoff_1h, cutoff_24h], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;

        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(DISTINCT receiver_id) FROM transactions
             WHERE sender_id = ?1 AND timestamp >= ?2",
        )?;
        let unique_receivers_24h: i64 =
            stmt.query_row(params![sender_id, cutoff_24h], |row| row.get(0))?;

        // Receiver window stats in one scan.
        let mut stmt = conn.prepare_cached(
            "SELECT
                 COUNT(CASE WHEN timestamp >= ?2 THEN 1 END),
                 COALESCE(SUM(CASE WHEN timestamp >= ?2 THEN amount END), 0.0)
             FROM transactions WHERE receiver_id = ?1",
        )?;
        let (receiver_count_24h, receiver_sum_24h): (i64, f64) = stmt
            .query_row(params![receiver_id, cutoff_24h], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;

        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(DISTINCT sender_id) FROM transactions
             WHERE receiver_id = ?1 AND timestamp >= ?2",
        )?;
        let receiver_unique_senders_24h: i64 =
            stmt.query_row(params![receiver_id, cutoff_24h], |row| row.get(0))?;

        // First-time counterparty over a 90-day horizon.
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*) FROM transactions
             WHERE sender_id = ?1 AND receiver_id = ?2 AND timestamp >= ?3",
        )?;
        let prior_pair_count: i64 =
            stmt.query_row(params![sender_id, receiver_id, cutoff_90d], |row| {
                row.get(0)
            })?;

        let device_reuse_count_24h = match device_id {
            Some(device) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT COUNT(DISTINCT sender_id) FROM transactions
                     WHERE device_id = ?1 AND timestamp >= ?2 AND sender_id != ?3",
                )?;
                stmt.query_row(params![device, cutoff_24h, sender_id], |row| row.get(0))?
            }
            None => 0,
        };

        let ip_reuse_count_24h = match ip_address {
            Some(ip) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT COUNT(DISTINCT sender_id) FROM transactions
                     WHERE ip_address = ?1 AND timestamp >= ?2 AND sender_id != ?3",
                )?;
                stmt.query_row(params![ip, cutoff_24h, sender_id], |row| row.get(0))?
            }
            None => 0,
        };

        // Gap since the sender's most recent prior transaction, capped at a
        // day; unparseable timestamps fall back to a one-hour default.
        let time_since_last_txn_minutes = match last_ts.as_deref().and_then(parse_ts) {
            Some(last) => {
                let minutes = (now - last).num_seconds() as f64 / 60.0;
                minutes.clamp(0.0, 1440.0)
            }
            None => 60.0,
        };

        Ok(VelocityContext {
            sender_txn_count_1h: count_1h,
            sender_txn_count_24h: count_24h,
            sender_amount_sum_1h: amount_sum_1h,
            sender_unique_receivers_24h: unique_receivers_24h,
            time_since_last_txn_minutes,
            receiver_txn_count_24h: receiver_count_24h,
            receiver_amount_sum_24h: receiver_sum_24h,
            receiver_unique_senders_24h,
            first_time_counterparty: prior_pair_count == 0,
            device_reuse_count_24h,
            ip_reuse_count_24h,
        })
    }

    // --- Transactions ---

    pub fn list_transactions(&self, limit: usize) -> CoreResult<Vec<TransactionSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT t.txn_id, t.timestamp, t.amount, t.currency, t.sender_id, t.receiver_id,
                    t.txn_type, t.channel, r.risk_score, r.decision
             FROM transactions t
             LEFT JOIN risk_results r ON t.txn_id = r.txn_id
             ORDER BY t.timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(TransactionSummary {
                    txn_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    amount: row.get(2)?,
                    currency: row.get(3)?,
                    sender_id: row.get(4)?,
                    receiver_id: row.get(5)?,
                    txn_type: row.get(6)?,
                    channel: row.get(7)?,
                    risk_score: row.get(8)?,
                    decision: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_transaction(&self, txn_id: &str) -> CoreResult<Option<Transaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT txn_id, timestamp, amount, currency, sender_id, receiver_id, txn_type,
                    channel, ip_address, device_id, is_fraud_ground_truth, metadata
             FROM transactions WHERE txn_id = ?1",
        )?;
        let row = stmt
            .query_row(params![txn_id], |row| {
                let txn_type: String = row.get(6)?;
                let channel: String = row.get(7)?;
                let ground_truth: Option<i64> = row.get(10)?;
                let metadata_json: Option<String> = row.get(11)?;
                Ok(Transaction {
                    txn_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    amount: row.get(2)?,
                    currency: row.get(3)?,
                    sender_id: row.get(4)?,
                    receiver_id: row.get(5)?,
                    txn_type: TxnType::parse(&txn_type).unwrap_or(TxnType::Transfer),
                    channel: Channel::parse(&channel).unwrap_or(Channel::Web),
                    ip_address: row.get(8)?,
                    device_id: row.get(9)?,
                    is_fraud_ground_truth: ground_truth.map(|v| v != 0),
                    metadata: metadata_json
                        .and_then(|raw| serde_json::from_str::<Metadata>(&raw).ok()),
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Risk fields needed by the explainer: score, features, reasons,
    /// model version.
    pub fn get_risk_fields(
        &self,
        txn_id: &str,
    ) -> CoreResult<Option<(f64, String, String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT risk_score, COALESCE(features, '{}'), COALESCE(reasons, '[]'), model_version
             FROM risk_results WHERE txn_id = ?1",
        )?;
        let row = stmt
            .query_row(params![txn_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .optional()?;
        Ok(row)
    }

    /// Transactions in the recent mining window, newest first.
    pub fn transactions_since(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<TxnLite>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT txn_id, timestamp, amount, sender_id, receiver_id
             FROM transactions WHERE timestamp >= ?1
             ORDER BY timestamp DESC",
        )?;
        let rows = stmt
            .query_map(params![fmt_ts(cutoff)], |row| {
                Ok(TxnLite {
                    txn_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    amount: row.get(2)?,
                    sender_id: row.get(3)?,
                    receiver_id: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn transactions_count_since(&self, cutoff: &str) -> CoreResult<i64> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT COUNT(*) FROM transactions WHERE timestamp >= ?1")?;
        Ok(stmt.query_row(params![cutoff], |row| row.get(0))?)
    }

    pub fn total_transactions(&self) -> CoreResult<i64> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM transactions")?;
        Ok(stmt.query_row([], |row| row.get(0))?)
    }

    /// Most recent risk scores, newest first. Feeds the guardian's drift
    /// estimate.
    pub fn recent_scores(&self, limit: usize) -> CoreResult<Vec<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT risk_score FROM risk_results ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<f64>, _>>()?;
        Ok(rows)
    }

    // --- Cases ---

    pub fn get_case(&self, case_id: &str) -> CoreResult<Option<Case>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT case_id, txn_id, status, created_at, updated_at, closed_at, assigned_to,
                    priority, risk_score
             FROM cases WHERE case_id = ?1",
        )?;
        let row = stmt
            .query_row(params![case_id], |row| {
                let status: String = row.get(2)?;
                let priority: String = row.get(7)?;
                Ok(Case {
                    case_id: row.get(0)?,
                    txn_id: row.get(1)?,
                    status: CaseStatus::parse(&status).unwrap_or(CaseStatus::Open),
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                    closed_at: row.get(5)?,
                    assigned_to: row.get(6)?,
                    priority: Priority::parse(&priority).unwrap_or(Priority::Medium),
                    risk_score: row.get(8)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn get_case_for_txn(&self, txn_id: &str) -> CoreResult<Option<Case>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT case_id, txn_id, status, created_at, updated_at, closed_at, assigned_to,
                    priority, risk_score
             FROM cases WHERE txn_id = ?1",
        )?;
        let row = stmt
            .query_row(params![txn_id], |row| {
                let status: String = row.get(2)?;
                let priority: String = row.get(7)?;
                Ok(Case {
                    case_id: row.get(0)?,
                    txn_id: row.get(1)?,
                    status: CaseStatus::parse(&status).unwrap_or(CaseStatus::Open),
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                    closed_at: row.get(5)?,
                    assigned_to: row.get(6)?,
                    priority: Priority::parse(&priority).unwrap_or(Priority::Medium),
                    risk_score: row.get(8)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn list_cases(&self, status: Option<CaseStatus>, limit: usize) -> CoreResult<Vec<Case>> {
        let conn = self.conn.lock();
        let map_row = |row: &rusqlite::Row<'_>| {
            let status: String = row.get(2)?;
            let priority: String = row.get(7)?;
            Ok(Case {
                case_id: row.get(0)?,
                txn_id: row.get(1)?,
                status: CaseStatus::parse(&status).unwrap_or(CaseStatus::Open),
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
                closed_at: row.get(5)?,
                assigned_to: row.get(6)?,
                priority: Priority::parse(&priority).unwrap_or(Priority::Medium),
                risk_score: row.get(8)?,
            })
        };

        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT case_id, txn_id, status, created_at, updated_at, closed_at,
                            assigned_to, priority, risk_score
                     FROM cases WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
                )?;
                let result = stmt
                    .query_map(params![status.as_str(), limit as i64], map_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT case_id, txn_id, status, created_at, updated_at, closed_at,
                            assigned_to, priority, risk_score
                     FROM cases ORDER BY created_at DESC LIMIT ?1",
                )?;
                let result = stmt
                    .query_map(params![limit as i64], map_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                result
            }
        };
        Ok(rows)
    }

    /// Open/in-review cases ordered by ascending distance from the decision
    /// boundary: the uncertainty sampler behind the analyst work queue.
    pub fn suggested_cases(&self, limit: usize) -> CoreResult<Vec<SuggestedCase>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT case_id, txn_id, status, created_at, priority, risk_score,
                    ABS(risk_score - 0.5) AS uncertainty
             FROM cases
             WHERE status IN ('open', 'in_review')
             ORDER BY uncertainty ASC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let uncertainty: f64 = row.get(6)?;
                Ok(SuggestedCase {
                    case_id: row.get(0)?,
                    txn_id: row.get(1)?,
                    status: row.get(2)?,
                    created_at: row.get(3)?,
                    priority: row.get(4)?,
                    risk_score: row.get(5)?,
                    uncertainty: (uncertainty * 10_000.0).round() / 10_000.0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Insert the label and move the case in one transaction.
    pub fn apply_label(&self, label: &Label, new_status: CaseStatus) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO analyst_labels
             (label_id, case_id, txn_id, decision, confidence, labeled_at, labeled_by,
              fraud_type, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                label.label_id,
                label.case_id,
                label.txn_id,
                label.decision.as_str(),
                label.confidence,
                label.labeled_at,
                label.labeled_by,
                label.fraud_type,
                label.notes,
            ],
        )?;

        let closed_at = (new_status == CaseStatus::Closed).then(|| label.labeled_at.clone());
        tx.execute(
            "UPDATE cases SET status = ?1, updated_at = ?2, closed_at = ?3 WHERE case_id = ?4",
            params![new_status.as_str(), label.labeled_at, closed_at, label.case_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn set_case_explanation(&self, case_id: &str, explanation_json: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE cases SET explanation = ?1 WHERE case_id = ?2",
            params![explanation_json, case_id],
        )?;
        Ok(())
    }

    pub fn get_case_explanation(&self, case_id: &str) -> CoreResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT explanation FROM cases WHERE case_id = ?1")?;
        let row: Option<Option<String>> = stmt
            .query_row(params![case_id], |row| row.get(0))
            .optional()?;
        Ok(row.flatten())
    }

    // --- Labels & training data ---

    pub fn label_class_counts(&self) -> CoreResult<(i64, i64)> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT
                 SUM(CASE WHEN decision = 'fraud' THEN 1 ELSE 0 END),
                 SUM(CASE WHEN decision = 'not_fraud' THEN 1 ELSE 0 END)
             FROM analyst_labels",
        )?;
        let (fraud, legit): (Option<i64>, Option<i64>) =
            stmt.query_row([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok((fraud.unwrap_or(0), legit.unwrap_or(0)))
    }

    pub fn total_labels(&self) -> CoreResult<i64> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM analyst_labels")?;
        Ok(stmt.query_row([], |row| row.get(0))?)
    }

    pub fn labels_count_since(&self, cutoff: &str) -> CoreResult<i64> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT COUNT(*) FROM analyst_labels WHERE labeled_at >= ?1")?;
        Ok(stmt.query_row(params![cutoff], |row| row.get(0))?)
    }

    /// Terminal-labeled transactions joined with their scoring-time
    /// features for trainer consumption.
    pub fn training_rows(&self) -> CoreResult<Vec<TrainingRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT t.amount, t.txn_type, t.channel, al.decision, r.features
             FROM analyst_labels al
             JOIN transactions t ON al.txn_id = t.txn_id
             LEFT JOIN risk_results r ON t.txn_id = r.txn_id
             WHERE al.decision IN ('fraud', 'not_fraud')",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let decision: String = row.get(3)?;
                Ok(TrainingRow {
                    amount: row.get(0)?,
                    txn_type: row.get(1)?,
                    channel: row.get(2)?,
                    is_fraud: decision == LabelDecision::Fraud.as_str(),
                    features_json: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- Pattern cards ---

    pub fn insert_pattern_card(&self, card: &PatternCard) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pattern_cards
             (pattern_id, name, description, discovered_at, status, pattern_type, confidence,
              detection_rule, stats, related_txn_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                card.pattern_id,
                card.name,
                card.description,
                card.discovered_at,
                card.status.as_str(),
                card.pattern_type.as_str(),
                card.confidence,
                serde_json::to_string(&card.detection_rule).unwrap_or_default(),
                serde_json::to_string(&card.stats).unwrap_or_default(),
                serde_json::to_string(&card.related_txn_ids).unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    pub fn active_pattern_cards(&self) -> CoreResult<Vec<PatternCard>> {
        self.pattern_cards_where("WHERE status = 'active'", usize::MAX)
    }

    pub fn list_pattern_cards(&self, limit: usize) -> CoreResult<Vec<PatternCard>> {
        self.pattern_cards_where("", limit)
    }

    fn pattern_cards_where(&self, clause: &str, limit: usize) -> CoreResult<Vec<PatternCard>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT pattern_id, name, description, discovered_at, status, pattern_type,
                    confidence, detection_rule, stats, related_txn_ids
             FROM pattern_cards {clause} ORDER BY discovered_at DESC LIMIT {}",
            limit.min(i64::MAX as usize)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(4)?;
                let pattern_type: String = row.get(5)?;
                let rule_json: String = row.get(7)?;
                let stats_json: Option<String> = row.get(8)?;
                let txn_ids_json: Option<String> = row.get(9)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    status,
                    pattern_type,
                    row.get::<_, f64>(6)?,
                    rule_json,
                    stats_json,
                    txn_ids_json,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut cards = Vec::with_capacity(rows.len());
        for (
            pattern_id,
            name,
            description,
            discovered_at,
            status,
            pattern_type,
            confidence,
            rule_json,
            stats_json,
            txn_ids_json,
        ) in rows
        {
            let Ok(detection_rule) = serde_json::from_str::<DetectionRule>(&rule_json) else {
                warn!(pattern_id = %pattern_id, "skipping pattern card with unreadable detection rule");
                continue;
            };
            cards.push(PatternCard {
                pattern_id,
                name,
                description: description.unwrap_or_default(),
                discovered_at,
                status: PatternStatus::parse(&status).unwrap_or(PatternStatus::Active),
                pattern_type: PatternType::parse(&pattern_type).unwrap_or(PatternType::Graph),
                confidence,
                detection_rule,
                stats: stats_json
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or_default(),
                related_txn_ids: txn_ids_json
                    .and_then(|raw| serde_json::from_str(&raw).ok())
                    .unwrap_or_default(),
            });
        }
        Ok(cards)
    }

    pub fn delete_pattern_cards(&self, pattern_ids: &[String]) -> CoreResult<usize> {
        if pattern_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0usize;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM pattern_cards WHERE pattern_id = ?1")?;
            for id in pattern_ids {
                deleted += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    // --- Metric snapshots ---

    pub fn insert_metric_snapshot(&self, snapshot: &MetricSnapshot) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metric_snapshots (snapshot_id, timestamp, model_version, metrics)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.snapshot_id,
                snapshot.timestamp,
                snapshot.model_version,
                snapshot.metrics.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn list_metric_snapshots(&self, limit: usize) -> CoreResult<Vec<MetricSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT snapshot_id, timestamp, model_version, metrics
             FROM metric_snapshots ORDER BY timestamp ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let metrics_json: String = row.get(3)?;
                Ok(MetricSnapshot {
                    snapshot_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    model_version: row.get(2)?,
                    metrics: serde_json::from_str(&metrics_json)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn latest_snapshot_timestamp(&self) -> CoreResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT MAX(timestamp) FROM metric_snapshots")?;
        let ts: Option<String> = stmt.query_row([], |row| row.get(0))?;
        Ok(ts)
    }

    // --- Agent decisions ---

    pub fn insert_agent_decision(&self, decision: &AgentDecision) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_decisions
             (decision_id, timestamp, decision_type, reasoning, context, outcome,
              model_version_before, model_version_after, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                decision.decision_id,
                decision.timestamp,
                decision.decision_type.as_str(),
                decision.reasoning,
                decision.context.to_string(),
                decision.outcome,
                decision.model_version_before,
                decision.model_version_after,
                decision.source.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn list_agent_decisions(&self, limit: usize) -> CoreResult<Vec<AgentDecision>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT decision_id, timestamp, decision_type, reasoning, context, outcome,
                    model_version_before, model_version_after, source
             FROM agent_decisions ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let decision_type: String = row.get(2)?;
                let context_json: String = row.get(4)?;
                let source: String = row.get(8)?;
                Ok(AgentDecision {
                    decision_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    decision_type: match decision_type.as_str() {
                        "retrain_triggered" => DecisionType::RetrainTriggered,
                        "model_kept" => DecisionType::ModelKept,
                        "model_rolled_back" => DecisionType::ModelRolledBack,
                        _ => DecisionType::RetrainSkipped,
                    },
                    reasoning: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    context: serde_json::from_str(&context_json)
                        .unwrap_or(serde_json::Value::Null),
                    outcome: row.get(5)?,
                    model_version_before: row.get(6)?,
                    model_version_after: row.get(7)?,
                    source: if source == "llm" {
                        DecisionSource::Llm
                    } else {
                        DecisionSource::Deterministic
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // --- System metrics ---

    /// Labeled precision/recall/F1 plus headline counts, computed in one
    /// conditional-aggregation pass over the label/risk join.
    pub fn metrics_summary(&self) -> CoreResult<MetricsSummary> {
        let conn = self.conn.lock();

        let total_txns: i64 =
            conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
        let flagged_txns: i64 = conn.query_row(
            "SELECT COUNT(*) FROM risk_results WHERE flagged = 1",
            [],
            |row| row.get(0),
        )?;
        let cases_open: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cases WHERE status IN ('open', 'in_review')",
            [],
            |row| row.get(0),
        )?;
        let cases_closed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cases WHERE status = 'closed'",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare_cached(
            "SELECT
                 SUM(CASE WHEN al.decision = 'fraud' AND r.flagged = 1 THEN 1 ELSE 0 END),
                 SUM(CASE WHEN al.decision = 'not_fraud' AND r.flagged = 1 THEN 1 ELSE 0 END),
                 SUM(CASE WHEN al.decision = 'fraud' AND r.flagged = 0 THEN 1 ELSE 0 END),
                 COUNT(*)
             FROM analyst_labels al
             JOIN risk_results r ON al.txn_id = r.txn_id
             WHERE al.decision IN ('fraud', 'not_fraud')",
        )?;
        let (tp, fp, fnc, labeled): (Option<i64>, Option<i64>, Option<i64>, i64) =
            stmt.query_row([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;

        let mut precision = None;
        let mut recall = None;
        let mut f1 = None;
        if labeled > 0 {
            let tp = tp.unwrap_or(0) as f64;
            let fp = fp.unwrap_or(0) as f64;
            let fnc = fnc.unwrap_or(0) as f64;
            if tp + fp > 0.0 {
                precision = Some(((tp / (tp + fp)) * 10_000.0).round() / 10_000.0);
            }
            if tp + fnc > 0.0 {
                recall = Some(((tp / (tp + fnc)) * 10_000.0).round() / 10_000.0);
            }
            if let (Some(p), Some(r)) = (precision, recall) {
                if p + r > 0.0 {
                    f1 = Some(((2.0 * p * r / (p + r)) * 10_000.0).round() / 10_000.0);
                }
            }
        }

        Ok(MetricsSummary {
            total_txns,
            flagged_txns,
            cases_open,
            cases_closed,
            precision,
            recall,
            f1,
        })
    }

    /// Cheap connectivity probe for the readiness endpoint.
    pub fn ping(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Decision, Features, RuleType};

    fn store() -> Store {
        Store::in_memory().unwrap()
    }

    fn txn_at(
        id: &str,
        sender: &str,
        receiver: &str,
        amount: f64,
        ts: DateTime<Utc>,
    ) -> Transaction {
        Transaction {
            txn_id: id.to_string(),
            timestamp: fmt_ts(ts),
            amount,
            currency: "USD".to_string(),
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            txn_type: TxnType::Transfer,
            channel: Channel::Web,
            ip_address: Some("10.0.0.1".to_string()),
            device_id: Some("dev-1".to_string()),
            is_fraud_ground_truth: None,
            metadata: None,
        }
    }

    fn risk_for(txn: &Transaction, score: f64, flagged: bool) -> RiskResult {
        RiskResult {
            txn_id: txn.txn_id.clone(),
            score,
            flagged,
            decision: if flagged {
                Decision::Review
            } else {
                Decision::Approve
            },
            threshold_used: 0.5,
            features: Features::new(),
            reasons: vec![],
            model_version: "v0.0.0-rules".to_string(),
            uncertainty: (score - 0.5).abs(),
            computed_at: txn.timestamp.clone(),
        }
    }

    #[test]
    fn test_velocity_counts_within_windows() {
        let store = store();
        let now = Utc::now();

        for i in 0..5 {
            let t = txn_at(
                &format!("t{i}"),
                "S",
                &format!("r{i}"),
                100.0,
                now - Duration::seconds(10 * (i as i64 + 1)),
            );
            store
                .insert_scored_transaction(&t, &risk_for(&t, 0.1, false), None)
                .unwrap();
        }
        // One stale transaction outside both windows.
        let old = txn_at("told", "S", "r9", 100.0, now - Duration::days(2));
        store
            .insert_scored_transaction(&old, &risk_for(&old, 0.1, false), None)
            .unwrap();

        let ctx = store
            .velocity_context("S", "r0", Some("dev-1"), Some("10.0.0.1"), now)
            .unwrap();
        assert_eq!(ctx.sender_txn_count_1h, 5);
        assert_eq!(ctx.sender_txn_count_24h, 5);
        assert_eq!(ctx.sender_amount_sum_1h, 500.0);
        assert_eq!(ctx.sender_unique_receivers_24h, 5);
        assert!(!ctx.first_time_counterparty, "S->r0 already seen");
        assert!(ctx.time_since_last_txn_minutes < 1.0);
    }

    #[test]
    fn test_velocity_first_time_counterparty_and_cold_start() {
        let store = store();
        let ctx = store
            .velocity_context("nobody", "nobody-else", None, None, Utc::now())
            .unwrap();
        assert!(ctx.first_time_counterparty);
        assert_eq!(ctx.sender_txn_count_1h, 0);
        assert_eq!(ctx.time_since_last_txn_minutes, 60.0);
    }

    #[test]
    fn test_velocity_device_reuse_excludes_self() {
        let store = store();
        let now = Utc::now();
        // Two other senders on the same device, plus the sender itself.
        for (i, sender) in ["S", "other1", "other2"].iter().enumerate() {
            let t = txn_at(
                &format!("d{i}"),
                sender,
                "r",
                50.0,
                now - Duration::minutes(5),
            );
            store
                .insert_scored_transaction(&t, &risk_for(&t, 0.1, false), None)
                .unwrap();
        }

        let ctx = store
            .velocity_context("S", "r", Some("dev-1"), Some("10.0.0.1"), now)
            .unwrap();
        assert_eq!(ctx.device_reuse_count_24h, 2);
        assert_eq!(ctx.ip_reuse_count_24h, 2);
    }

    #[test]
    fn test_atomic_insert_with_case() {
        let store = store();
        let now = Utc::now();
        let t = txn_at("t1", "S", "R", 9000.0, now);
        let risk = risk_for(&t, 0.7, true);
        let case = Case::for_flagged(&t.txn_id, Decision::Review, 0.7, &t.timestamp);
        store
            .insert_scored_transaction(&t, &risk, Some(&case))
            .unwrap();

        let cases = store.list_cases(Some(CaseStatus::Open), 10).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].txn_id, "t1");

        // Duplicate insert must fail and leave no partial state behind.
        let dup_risk = risk_for(&t, 0.7, true);
        let dup_case = Case::for_flagged(&t.txn_id, Decision::Review, 0.7, &t.timestamp);
        assert!(store
            .insert_scored_transaction(&t, &dup_risk, Some(&dup_case))
            .is_err());
        assert_eq!(store.list_cases(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_suggested_cases_order_by_uncertainty() {
        let store = store();
        let now = Utc::now();
        for (i, score) in [0.92f64, 0.52, 0.71].iter().enumerate() {
            let t = txn_at(&format!("t{i}"), "S", "R", 100.0, now);
            let risk = risk_for(&t, *score, true);
            let case = Case::for_flagged(&t.txn_id, Decision::Review, *score, &t.timestamp);
            store
                .insert_scored_transaction(&t, &risk, Some(&case))
                .unwrap();
        }

        let suggested = store.suggested_cases(10).unwrap();
        assert_eq!(suggested.len(), 3);
        // 0.52 is closest to the boundary, then 0.71, then 0.92.
        assert_eq!(suggested[0].risk_score, 0.52);
        assert_eq!(suggested[1].risk_score, 0.71);
        assert_eq!(suggested[2].risk_score, 0.92);
    }

    #[test]
    fn test_label_apply_and_counts() {
        let store = store();
        let now = Utc::now();
        let t = txn_at("t1", "S", "R", 100.0, now);
        let risk = risk_for(&t, 0.6, true);
        let case = Case::for_flagged(&t.txn_id, Decision::Review, 0.6, &t.timestamp);
        store
            .insert_scored_transaction(&t, &risk, Some(&case))
            .unwrap();

        let label = Label {
            label_id: "l1".to_string(),
            case_id: case.case_id.clone(),
            txn_id: t.txn_id.clone(),
            decision: LabelDecision::Fraud,
            confidence: "high".to_string(),
            labeled_at: fmt_ts(now),
            labeled_by: "analyst_1".to_string(),
            fraud_type: None,
            notes: None,
        };
        store.apply_label(&label, CaseStatus::Closed).unwrap();

        let stored = store.get_case(&case.case_id).unwrap().unwrap();
        assert_eq!(stored.status, CaseStatus::Closed);
        assert!(stored.closed_at.is_some());

        let (fraud, legit) = store.label_class_counts().unwrap();
        assert_eq!((fraud, legit), (1, 0));
        assert_eq!(store.total_labels().unwrap(), 1);
    }

    #[test]
    fn test_metrics_summary_precision_recall() {
        let store = store();
        let now = Utc::now();

        // Two flagged (one true fraud, one false positive), one missed fraud.
        let specs = [
            ("a", 0.9, true, LabelDecision::Fraud),
            ("b", 0.6, true, LabelDecision::NotFraud),
            ("c", 0.2, false, LabelDecision::Fraud),
        ];
        for (id, score, flagged, decision) in specs {
            let t = txn_at(id, "S", "R", 100.0, now);
            let risk = risk_for(&t, score, flagged);
            let case = flagged
                .then(|| Case::for_flagged(&t.txn_id, Decision::Review, score, &t.timestamp));
            store
                .insert_scored_transaction(&t, &risk, case.as_ref())
                .unwrap();
            let label = Label {
                label_id: format!("l-{id}"),
                case_id: format!("c-{id}"),
                txn_id: id.to_string(),
                decision,
                confidence: "medium".to_string(),
                labeled_at: fmt_ts(now),
                labeled_by: "analyst_1".to_string(),
                fraud_type: None,
                notes: None,
            };
            store.apply_label(&label, CaseStatus::Closed).unwrap();
        }

        let summary = store.metrics_summary().unwrap();
        assert_eq!(summary.total_txns, 3);
        assert_eq!(summary.flagged_txns, 2);
        assert_eq!(summary.precision, Some(0.5));
        assert_eq!(summary.recall, Some(0.5));
    }

    #[test]
    fn test_pattern_card_round_trip() {
        let store = store();
        let mut rule = DetectionRule::new(
            RuleType::Cycle,
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
        );
        rule.cycle_length = Some(3);
        let card = PatternCard {
            pattern_id: "p1".to_string(),
            name: "Circular Flow Ring (3 members)".to_string(),
            description: "test ring".to_string(),
            discovered_at: fmt_ts(Utc::now()),
            status: PatternStatus::Active,
            pattern_type: PatternType::Graph,
            confidence: 0.95,
            detection_rule: rule,
            stats: serde_json::Map::new(),
            related_txn_ids: vec!["t1".to_string()],
        };
        store.insert_pattern_card(&card).unwrap();

        let cards = store.active_pattern_cards().unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].detection_rule.rule_type, RuleType::Cycle);
        assert_eq!(cards[0].detection_rule.member_ids, vec!["a", "b", "c"]);

        assert_eq!(
            store
                .delete_pattern_cards(&["p1".to_string()])
                .unwrap(),
            1
        );
        assert!(store.active_pattern_cards().unwrap().is_empty());
    }
}
