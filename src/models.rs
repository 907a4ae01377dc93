//! Domain model types shared across the service.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Canonical timestamp format used for every persisted/emitted timestamp.
/// Fixed precision keeps stored strings lexicographically ordered, which the
/// windowed velocity queries rely on.
pub fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    fmt_ts(Utc::now())
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// --- Transactions ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnType {
    Transfer,
    Deposit,
    Withdrawal,
    Payment,
}

impl TxnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnType::Transfer => "transfer",
            TxnType::Deposit => "deposit",
            TxnType::Withdrawal => "withdrawal",
            TxnType::Payment => "payment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transfer" => Some(TxnType::Transfer),
            "deposit" => Some(TxnType::Deposit),
            "withdrawal" => Some(TxnType::Withdrawal),
            "payment" => Some(TxnType::Payment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Web,
    Mobile,
    Api,
    Branch,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Web => "web",
            Channel::Mobile => "mobile",
            Channel::Api => "api",
            Channel::Branch => "branch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "web" => Some(Channel::Web),
            "mobile" => Some(Channel::Mobile),
            "api" => Some(Channel::Api),
            "branch" => Some(Channel::Branch),
            _ => None,
        }
    }
}

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_id: String,
    pub timestamp: String,
    pub amount: f64,
    pub currency: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub txn_type: TxnType,
    pub channel: Channel,
    pub ip_address: Option<String>,
    pub device_id: Option<String>,
    pub is_fraud_ground_truth: Option<bool>,
    pub metadata: Option<Metadata>,
}

const MAX_AMOUNT: f64 = 1_000_000_000.0;
const MAX_ID_LEN: usize = 512;
const MAX_CURRENCY_LEN: usize = 10;
const MAX_OPAQUE_LEN: usize = 256;

/// Ingress request as the transport hands it over. Validation happens once,
/// here; everything downstream works with the statically shaped
/// [`Transaction`].
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionRequest {
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default = "default_txn_type")]
    pub txn_type: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub is_fraud_ground_truth: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_txn_type() -> String {
    "transfer".to_string()
}

fn default_channel() -> String {
    "web".to_string()
}

impl TransactionRequest {
    /// Validate and assign identity + ingestion timestamp.
    pub fn into_transaction(self, now: DateTime<Utc>) -> Result<Transaction, CoreError> {
        if !self.amount.is_finite() {
            return Err(CoreError::Validation(
                "amount must be a finite number (not NaN or Infinity)".into(),
            ));
        }
        if self.amount < 0.0 || self.amount > MAX_AMOUNT {
            return Err(CoreError::Validation(format!(
                "amount must be in [0, {MAX_AMOUNT}]"
            )));
        }
        if self.sender_id.is_empty() || self.sender_id.len() > MAX_ID_LEN {
            return Err(CoreError::Validation("invalid sender_id".into()));
        }
        if self.receiver_id.is_empty() || self.receiver_id.len() > MAX_ID_LEN {
            return Err(CoreError::Validation("invalid receiver_id".into()));
        }
        if self.currency.is_empty() || self.currency.len() > MAX_CURRENCY_LEN {
            return Err(CoreError::Validation("invalid currency".into()));
        }
        if let Some(ip) = &self.ip_address {
            if ip.len() > MAX_OPAQUE_LEN {
                return Err(CoreError::Validation("ip_address too long".into()));
            }
        }
        if let Some(dev) = &self.device_id {
            if dev.len() > MAX_OPAQUE_LEN {
                return Err(CoreError::Validation("device_id too long".into()));
            }
        }

        let txn_type = TxnType::parse(&self.txn_type)
            .ok_or_else(|| CoreError::Validation(format!("unknown txn_type: {}", self.txn_type)))?;
        let channel = Channel::parse(&self.channel)
            .ok_or_else(|| CoreError::Validation(format!("unknown channel: {}", self.channel)))?;

        Ok(Transaction {
            txn_id: Uuid::new_v4().to_string(),
            timestamp: fmt_ts(now),
            amount: self.amount,
            currency: self.currency,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            txn_type,
            channel,
            ip_address: self.ip_address.filter(|s| !s.is_empty()),
            device_id: self.device_id.filter(|s| !s.is_empty()),
            is_fraud_ground_truth: self.is_fraud_ground_truth,
            metadata: self.metadata,
        })
    }
}

// --- Risk results ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Review,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Review => "review",
            Decision::Block => "block",
        }
    }
}

pub type Features = BTreeMap<String, f64>;

/// One-to-one with a transaction; immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskResult {
    pub txn_id: String,
    pub score: f64,
    pub flagged: bool,
    pub decision: Decision,
    pub threshold_used: f64,
    pub features: Features,
    pub reasons: Vec<String>,
    pub model_version: String,
    pub uncertainty: f64,
    pub computed_at: String,
}

// --- Cases ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Open,
    InReview,
    Closed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Open => "open",
            CaseStatus::InReview => "in_review",
            CaseStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(CaseStatus::Open),
            "in_review" => Some(CaseStatus::InReview),
            "closed" => Some(CaseStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub case_id: String,
    pub txn_id: String,
    pub status: CaseStatus,
    pub created_at: String,
    pub updated_at: Option<String>,
    pub closed_at: Option<String>,
    pub assigned_to: Option<String>,
    pub priority: Priority,
    pub risk_score: f64,
}

impl Case {
    /// Auto-created at ingestion for every flagged transaction.
    pub fn for_flagged(txn_id: &str, decision: Decision, risk_score: f64, timestamp: &str) -> Self {
        let priority = if decision == Decision::Block {
            Priority::High
        } else {
            Priority::Medium
        };
        Self {
            case_id: Uuid::new_v4().to_string(),
            txn_id: txn_id.to_string(),
            status: CaseStatus::Open,
            created_at: timestamp.to_string(),
            updated_at: None,
            closed_at: None,
            assigned_to: None,
            priority,
            risk_score,
        }
    }
}

// --- Labels ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelDecision {
    Fraud,
    NotFraud,
    NeedsInfo,
}

impl LabelDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelDecision::Fraud => "fraud",
            LabelDecision::NotFraud => "not_fraud",
            LabelDecision::NeedsInfo => "needs_info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fraud" => Some(LabelDecision::Fraud),
            "not_fraud" => Some(LabelDecision::NotFraud),
            "needs_info" => Some(LabelDecision::NeedsInfo),
            _ => None,
        }
    }

    /// Terminal decisions close the case and feed the learning loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LabelDecision::Fraud | LabelDecision::NotFraud)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub label_id: String,
    pub case_id: String,
    pub txn_id: String,
    pub decision: LabelDecision,
    pub confidence: String,
    pub labeled_at: String,
    pub labeled_by: String,
    pub fraud_type: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelRequest {
    pub decision: String,
    #[serde(default = "default_label_confidence")]
    pub confidence: String,
    #[serde(default = "default_labeler")]
    pub labeled_by: String,
    #[serde(default)]
    pub fraud_type: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_label_confidence() -> String {
    "medium".to_string()
}

fn default_labeler() -> String {
    "analyst_1".to_string()
}

// --- Pattern cards ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternStatus {
    Active,
    Retired,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::Active => "active",
            PatternStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PatternStatus::Active),
            "retired" => Some(PatternStatus::Retired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Graph,
    Velocity,
    Behavioral,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Graph => "graph",
            PatternType::Velocity => "velocity",
            PatternType::Behavioral => "behavioral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "graph" => Some(PatternType::Graph),
            "velocity" => Some(PatternType::Velocity),
            "behavioral" => Some(PatternType::Behavioral),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Cycle,
    HubOut,
    HubIn,
    Velocity,
    DenseSubgraph,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Cycle => "cycle",
            RuleType::HubOut => "hub_out",
            RuleType::HubIn => "hub_in",
            RuleType::Velocity => "velocity",
            RuleType::DenseSubgraph => "dense_subgraph",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cycle" => Some(RuleType::Cycle),
            "hub_out" => Some(RuleType::HubOut),
            "hub_in" => Some(RuleType::HubIn),
            "velocity" => Some(RuleType::Velocity),
            "dense_subgraph" => Some(RuleType::DenseSubgraph),
            _ => None,
        }
    }
}

/// Structured detection rule carried by every pattern card. `member_ids` is
/// the ordered list of involved entities and, together with the rule type,
/// forms the card's structural identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub member_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degree: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<f64>,
}

impl DetectionRule {
    pub fn new(rule_type: RuleType, member_ids: Vec<String>) -> Self {
        Self {
            rule_type,
            member_ids,
            cycle_length: None,
            degree: None,
            window_minutes: None,
            threshold: None,
            density: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternCard {
    pub pattern_id: String,
    pub name: String,
    pub description: String,
    pub discovered_at: String,
    pub status: PatternStatus,
    pub pattern_type: PatternType,
    pub confidence: f64,
    pub detection_rule: DetectionRule,
    pub stats: serde_json::Map<String, serde_json::Value>,
    pub related_txn_ids: Vec<String>,
}

// --- Snapshots & agent decisions ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub snapshot_id: String,
    pub timestamp: String,
    pub model_version: String,
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    RetrainSkipped,
    RetrainTriggered,
    ModelKept,
    ModelRolledBack,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::RetrainSkipped => "retrain_skipped",
            DecisionType::RetrainTriggered => "retrain_triggered",
            DecisionType::ModelKept => "model_kept",
            DecisionType::ModelRolledBack => "model_rolled_back",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Deterministic,
    Llm,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Deterministic => "deterministic",
            DecisionSource::Llm => "llm",
        }
    }
}

/// Append-only audit trail of guardian choices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecision {
    pub decision_id: String,
    pub timestamp: String,
    pub decision_type: DecisionType,
    pub reasoning: String,
    pub context: serde_json::Value,
    pub outcome: Option<String>,
    pub model_version_before: Option<String>,
    pub model_version_after: Option<String>,
    pub source: DecisionSource,
}

// --- Velocity / pattern context ---

/// Rolling-window aggregates over a participant's recent activity, as of a
/// single `now`. Raw counts; normalization happens in the feature engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityContext {
    pub sender_txn_count_1h: i64,
    pub sender_txn_count_24h: i64,
    pub sender_amount_sum_1h: f64,
    pub sender_unique_receivers_24h: i64,
    pub time_since_last_txn_minutes: f64,
    pub receiver_txn_count_24h: i64,
    pub receiver_amount_sum_24h: f64,
    pub receiver_unique_senders_24h: i64,
    pub first_time_counterparty: bool,
    pub device_reuse_count_24h: i64,
    pub ip_reuse_count_24h: i64,
}

impl Default for VelocityContext {
    fn default() -> Self {
        Self {
            sender_txn_count_1h: 0,
            sender_txn_count_24h: 0,
            sender_amount_sum_1h: 0.0,
            sender_unique_receivers_24h: 0,
            // Cold start: treat as a comfortable one-hour gap.
            time_since_last_txn_minutes: 60.0,
            receiver_txn_count_24h: 0,
            receiver_amount_sum_24h: 0.0,
            receiver_unique_senders_24h: 0,
            first_time_counterparty: true,
            device_reuse_count_24h: 0,
            ip_reuse_count_24h: 0,
        }
    }
}

/// Pattern-derived features answered by the inverted card index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternFeatures {
    pub sender_in_ring: f64,
    pub sender_is_hub: f64,
    pub sender_in_velocity_cluster: f64,
    pub sender_in_dense_cluster: f64,
    pub receiver_in_ring: f64,
    pub receiver_is_hub: f64,
    pub pattern_count_sender: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> TransactionRequest {
        TransactionRequest {
            amount: 100.0,
            currency: "USD".to_string(),
            sender_id: "s1".to_string(),
            receiver_id: "r1".to_string(),
            txn_type: "transfer".to_string(),
            channel: "web".to_string(),
            ip_address: None,
            device_id: None,
            is_fraud_ground_truth: None,
            metadata: None,
        }
    }

    #[test]
    fn test_request_validation_accepts_normal() {
        let txn = base_request().into_transaction(Utc::now()).unwrap();
        assert_eq!(txn.txn_type, TxnType::Transfer);
        assert_eq!(txn.channel, Channel::Web);
        assert!(!txn.txn_id.is_empty());
    }

    #[test]
    fn test_request_validation_rejects_non_finite_amount() {
        let mut req = base_request();
        req.amount = f64::NAN;
        assert!(matches!(
            req.into_transaction(Utc::now()),
            Err(CoreError::Validation(_))
        ));

        let mut req = base_request();
        req.amount = f64::INFINITY;
        assert!(req.into_transaction(Utc::now()).is_err());
    }

    #[test]
    fn test_request_validation_rejects_bad_enum() {
        let mut req = base_request();
        req.txn_type = "wire".to_string();
        assert!(matches!(
            req.into_transaction(Utc::now()),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_block_decision_makes_high_priority_case() {
        let case = Case::for_flagged("t1", Decision::Block, 0.9, "2026-01-01T00:00:00Z");
        assert_eq!(case.priority, Priority::High);
        let case = Case::for_flagged("t1", Decision::Review, 0.6, "2026-01-01T00:00:00Z");
        assert_eq!(case.priority, Priority::Medium);
    }

    #[test]
    fn test_timestamp_format_sorts_lexicographically() {
        let a = fmt_ts(Utc::now());
        let b = fmt_ts(Utc::now() + chrono::Duration::seconds(1));
        assert!(a < b);
        assert!(parse_ts(&a).is_some());
    }
}
