//! Retrain Guardian: autonomous model lifecycle management.
//!
//! Periodically gathers system state, decides whether to retrain, evaluates
//! the freshly trained model against the incumbent, and rolls back
//! regressions. An LLM may reason about the decision; the deterministic
//! rule set always stands behind it and is total over every input context.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::events::{Event, EventBus};
use crate::llm::OllamaClient;
use crate::models::{
    now_ts, parse_ts, AgentDecision, DecisionSource, DecisionType, MetricSnapshot,
};
use crate::risk::registry::{ModelRegistry, MISSING_VERSION};
use crate::risk::scorer::CurrentModel;
use crate::risk::trainer::{retrain_from_labels, TrainMetrics, TrainOutcome};
use crate::storage::Store;

const FAILURE_BACKOFF_THRESHOLD: u32 = 3;
const FAILURE_BACKOFF: Duration = Duration::from_secs(300);
const DRIFT_SAMPLE: usize = 50;
const MIN_TOTAL_LABELS: i64 = 20;

#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub check_interval: Duration,
    pub warmup: Duration,
    pub min_labels: i64,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            warmup: Duration::from_secs(60),
            min_labels: 5,
        }
    }
}

/// System state gathered at the top of every tick.
#[derive(Debug, Clone, Serialize)]
pub struct GuardianContext {
    pub labels_since: i64,
    pub total_labels: i64,
    pub txns_since: i64,
    pub model_version: String,
    pub current_f1: Option<f64>,
    pub current_precision: Option<f64>,
    pub drift: f64,
    pub minutes_since_snapshot: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrainDecision {
    Retrain,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalDecision {
    Keep,
    Rollback,
}

/// Deterministic retrain rule set. Total: every context maps to exactly one
/// decision.
pub fn deterministic_decide(
    ctx: &GuardianContext,
    min_labels: i64,
) -> (RetrainDecision, String) {
    if ctx.total_labels < MIN_TOTAL_LABELS {
        return (
            RetrainDecision::Skip,
            format!(
                "Only {} total labels; training data insufficient",
                ctx.total_labels
            ),
        );
    }
    if ctx.labels_since >= min_labels {
        return (
            RetrainDecision::Retrain,
            format!("{} new labels accumulated since last snapshot", ctx.labels_since),
        );
    }
    if ctx.drift > 0.05 && ctx.txns_since > 50 {
        return (
            RetrainDecision::Retrain,
            format!(
                "Score drift {:.4} with {} transactions suggests a stale model",
                ctx.drift, ctx.txns_since
            ),
        );
    }
    if ctx.txns_since > 200 && ctx.minutes_since_snapshot > 5.0 {
        return (
            RetrainDecision::Retrain,
            format!(
                "{} transactions and {:.1} minutes since last snapshot",
                ctx.txns_since, ctx.minutes_since_snapshot
            ),
        );
    }
    (
        RetrainDecision::Skip,
        "No retrain condition met".to_string(),
    )
}

/// Deterministic evaluation of the new model against the incumbent.
/// ROLLBACK iff F1 dropped more than 10% or precision more than 15%.
pub fn deterministic_evaluate(
    old_f1: Option<f64>,
    old_precision: Option<f64>,
    new_f1: f64,
    new_precision: f64,
) -> (EvalDecision, String) {
    if let Some(old_f1) = old_f1 {
        if new_f1 < 0.9 * old_f1 {
            return (
                EvalDecision::Rollback,
                format!("F1 regressed from {old_f1:.4} to {new_f1:.4} (>10% drop)"),
            );
        }
    }
    if let Some(old_precision) = old_precision {
        if new_precision < 0.85 * old_precision {
            return (
                EvalDecision::Rollback,
                format!(
                    "Precision regressed from {old_precision:.4} to {new_precision:.4} (>15% drop)"
                ),
            );
        }
    }
    (
        EvalDecision::Keep,
        "New model within tolerance of incumbent".to_string(),
    )
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(|x| format!("{x:.4}")).unwrap_or_else(|| "n/a".to_string())
}

fn build_guardian_prompt(ctx: &GuardianContext) -> String {
    format!(
        "You are the Retrain Guardian for an autonomous fraud detection system.\n\
         Your job: decide whether the model should be retrained NOW based on system state.\n\
         \n\
         SYSTEM STATE:\n\
         - Labels since last retrain: {labels_since}\n\
         - Total analyst labels: {total_labels}\n\
         - Transactions since last retrain: {txns_since}\n\
         - Current model version: {model_version}\n\
         - Current model F1: {current_f1}\n\
         - Current model precision: {current_precision}\n\
         - Score drift (recent vs older): {drift:.4}\n\
         - Minutes since last retrain: {minutes:.1}\n\
         \n\
         RULES:\n\
         - If fewer than 20 total labels exist, training data is insufficient - SKIP.\n\
         - If 5+ new labels accumulated since last retrain, retraining is warranted.\n\
         - If score drift > 0.05 with 50+ transactions, the model may be stale.\n\
         - If 200+ transactions processed and >5 min since last retrain, consider staleness.\n\
         \n\
         Respond in EXACTLY this format:\n\
         DECISION: RETRAIN or SKIP\n\
         REASONING: [1-2 sentences explaining why]\n\
         CONFIDENCE: HIGH or MEDIUM or LOW\n",
        labels_since = ctx.labels_since,
        total_labels = ctx.total_labels,
        txns_since = ctx.txns_since,
        model_version = ctx.model_version,
        current_f1 = fmt_opt(ctx.current_f1),
        current_precision = fmt_opt(ctx.current_precision),
        drift = ctx.drift,
        minutes = ctx.minutes_since_snapshot,
    )
}

fn build_eval_prompt(
    old_version: &str,
    old_f1: Option<f64>,
    old_precision: Option<f64>,
    old_recall: Option<f64>,
    new_version: &str,
    metrics: &TrainMetrics,
) -> String {
    format!(
        "You are the Model Evaluator for an autonomous fraud detection system.\n\
         Compare the old model vs the newly trained model and decide: KEEP or ROLLBACK.\n\
         \n\
         OLD MODEL: {old_version}\n\
         - Precision: {old_precision}\n\
         - Recall: {old_recall}\n\
         - F1: {old_f1}\n\
         \n\
         NEW MODEL: {new_version}\n\
         - Precision: {new_precision:.4}\n\
         - Recall: {new_recall:.4}\n\
         - F1: {new_f1:.4}\n\
         \n\
         RULES:\n\
         - If F1 dropped by more than 10%, ROLLBACK.\n\
         - If precision dropped by more than 15%, ROLLBACK (false positives hurt trust).\n\
         - Otherwise, KEEP the new model.\n\
         \n\
         Respond in EXACTLY this format:\n\
         DECISION: KEEP or ROLLBACK\n\
         REASONING: [1-2 sentences explaining why]\n",
        old_precision = fmt_opt(old_precision),
        old_recall = fmt_opt(old_recall),
        old_f1 = fmt_opt(old_f1),
        new_precision = metrics.precision,
        new_recall = metrics.recall,
        new_f1 = metrics.f1,
    )
}

/// Parse a `DECISION/REASONING/CONFIDENCE` reply. Returns `None` unless a
/// decision from `valid` is present, which sends the caller to the
/// deterministic path.
pub fn parse_decision_reply(raw: &str, valid: &[&str]) -> Option<(String, String)> {
    let mut decision: Option<String> = None;
    let mut reasoning = String::new();

    for line in raw.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim().to_ascii_uppercase().as_str() {
            "DECISION" => {
                let v = value.trim().to_ascii_uppercase();
                if valid.iter().any(|&ok| v.starts_with(ok)) {
                    decision = Some(
                        valid
                            .iter()
                            .find(|&&ok| v.starts_with(ok))
                            .map(|s| s.to_string())
                            .unwrap_or(v),
                    );
                }
            }
            "REASONING" => reasoning = value.trim().chars().take(500).collect(),
            "CONFIDENCE" => {}
            _ => {}
        }
    }

    decision.map(|d| (d, reasoning))
}

pub struct Guardian {
    store: Arc<Store>,
    registry: Arc<ModelRegistry>,
    current: Arc<CurrentModel>,
    bus: EventBus,
    llm: Option<OllamaClient>,
    retrain_lock: Arc<tokio::sync::Mutex<()>>,
    cfg: GuardianConfig,
    consecutive_failures: AtomicU32,
    running: AtomicBool,
}

impl Guardian {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ModelRegistry>,
        current: Arc<CurrentModel>,
        bus: EventBus,
        llm: Option<OllamaClient>,
        retrain_lock: Arc<tokio::sync::Mutex<()>>,
        cfg: GuardianConfig,
    ) -> Self {
        Self {
            store,
            registry,
            current,
            bus,
            llm,
            retrain_lock,
            cfg,
            consecutive_failures: AtomicU32::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn check_interval(&self) -> Duration {
        self.cfg.check_interval
    }

    /// Start the periodic loop. Exits promptly on the shutdown signal.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.warmup) => {}
                _ = shutdown.changed() => return,
            }

            self.running.store(true, Ordering::Relaxed);
            info!(interval_secs = self.cfg.check_interval.as_secs(), "guardian started");

            loop {
                match self.tick().await {
                    Ok(()) => {
                        self.consecutive_failures.store(0, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let failures =
                            self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(error = %e, failures, "guardian tick failed");
                    }
                }

                let delay = if self.consecutive_failures() >= FAILURE_BACKOFF_THRESHOLD {
                    FAILURE_BACKOFF
                } else {
                    self.cfg.check_interval
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }

            self.running.store(false, Ordering::Relaxed);
            info!("guardian stopped");
        })
    }

    fn gather_context(&self) -> CoreResult<GuardianContext> {
        let last_snapshot = self.store.latest_snapshot_timestamp()?;
        let total_labels = self.store.total_labels()?;

        let (labels_since, txns_since, minutes_since_snapshot) = match &last_snapshot {
            Some(ts) => {
                let labels = self.store.labels_count_since(ts)?;
                let txns = self.store.transactions_count_since(ts)?;
                let minutes = parse_ts(ts)
                    .map(|dt| (chrono::Utc::now() - dt).num_seconds() as f64 / 60.0)
                    .unwrap_or(999_999.0);
                (labels, txns, minutes)
            }
            None => {
                let txns = self.store.total_transactions()?;
                (total_labels, txns, 999_999.0)
            }
        };

        // Drift: recent window of scores vs the window before it.
        let scores = self.store.recent_scores(DRIFT_SAMPLE * 2)?;
        let drift = if scores.len() >= DRIFT_SAMPLE * 2 {
            let recent: f64 =
                scores[..DRIFT_SAMPLE].iter().sum::<f64>() / DRIFT_SAMPLE as f64;
            let prior: f64 =
                scores[DRIFT_SAMPLE..].iter().sum::<f64>() / DRIFT_SAMPLE as f64;
            (recent - prior).abs()
        } else {
            0.0
        };

        let model_version = self.current.version();
        let (current_f1, current_precision) = if model_version == MISSING_VERSION {
            (None, None)
        } else {
            match self.registry.load_metrics(&model_version) {
                Some(doc) => (
                    doc.get("f1").and_then(|v| v.as_f64()),
                    doc.get("precision").and_then(|v| v.as_f64()),
                ),
                None => (None, None),
            }
        };

        Ok(GuardianContext {
            labels_since,
            total_labels,
            txns_since,
            model_version,
            current_f1,
            current_precision,
            drift,
            minutes_since_snapshot,
        })
    }

    async fn decide(&self, ctx: &GuardianContext) -> (RetrainDecision, String, DecisionSource) {
        if let Some(llm) = &self.llm {
            let prompt = build_guardian_prompt(ctx);
            if let Some(reply) = llm.generate(&prompt).await {
                if let Some((decision, reasoning)) =
                    parse_decision_reply(&reply, &["RETRAIN", "SKIP"])
                {
                    let decision = if decision == "RETRAIN" {
                        RetrainDecision::Retrain
                    } else {
                        RetrainDecision::Skip
                    };
                    return (decision, reasoning, DecisionSource::Llm);
                }
                debug!("guardian LLM reply unparseable, using deterministic rules");
            }
        }
        let (decision, reasoning) = deterministic_decide(ctx, self.cfg.min_labels);
        (decision, reasoning, DecisionSource::Deterministic)
    }

    async fn evaluate(
        &self,
        old_version: &str,
        old_f1: Option<f64>,
        old_precision: Option<f64>,
        old_recall: Option<f64>,
        new_version: &str,
        metrics: &TrainMetrics,
    ) -> (EvalDecision, String, DecisionSource) {
        if let Some(llm) = &self.llm {
            let prompt = build_eval_prompt(
                old_version,
                old_f1,
                old_precision,
                old_recall,
                new_version,
                metrics,
            );
            if let Some(reply) = llm.generate(&prompt).await {
                if let Some((decision, reasoning)) =
                    parse_decision_reply(&reply, &["KEEP", "ROLLBACK"])
                {
                    let decision = if decision == "ROLLBACK" {
                        EvalDecision::Rollback
                    } else {
                        EvalDecision::Keep
                    };
                    return (decision, reasoning, DecisionSource::Llm);
                }
                debug!("evaluator LLM reply unparseable, using deterministic rules");
            }
        }
        let (decision, reasoning) =
            deterministic_evaluate(old_f1, old_precision, metrics.f1, metrics.precision);
        (decision, reasoning, DecisionSource::Deterministic)
    }

    fn log_decision(
        &self,
        decision_type: DecisionType,
        reasoning: &str,
        context: serde_json::Value,
        outcome: Option<&str>,
        before: Option<&str>,
        after: Option<&str>,
        source: DecisionSource,
    ) -> CoreResult<()> {
        self.store.insert_agent_decision(&AgentDecision {
            decision_id: Uuid::new_v4().to_string(),
            timestamp: now_ts(),
            decision_type,
            reasoning: reasoning.to_string(),
            context,
            outcome: outcome.map(|s| s.to_string()),
            model_version_before: before.map(|s| s.to_string()),
            model_version_after: after.map(|s| s.to_string()),
            source,
        })
    }

    /// One control-loop pass: gather, decide, retrain, evaluate, apply.
    pub async fn tick(&self) -> anyhow::Result<()> {
        let ctx = self.gather_context()?;
        let ctx_json = serde_json::to_value(&ctx)?;
        let (decision, reasoning, source) = self.decide(&ctx).await;
        let version_before = ctx.model_version.clone();

        if decision == RetrainDecision::Skip {
            debug!(reason = %reasoning, "guardian skip");
            self.log_decision(
                DecisionType::RetrainSkipped,
                &reasoning,
                ctx_json,
                Some("skipped"),
                Some(&version_before),
                Some(&version_before),
                source,
            )?;
            return Ok(());
        }

        info!(reason = %reasoning, "guardian retrain triggered");
        self.log_decision(
            DecisionType::RetrainTriggered,
            &reasoning,
            ctx_json.clone(),
            None,
            Some(&version_before),
            None,
            source,
        )?;
        self.bus.publish(Event::AgentDecision {
            decision_type: DecisionType::RetrainTriggered.as_str().to_string(),
            reasoning: reasoning.clone(),
            model_version: Some(version_before.clone()),
            timestamp: now_ts(),
        });

        // Train without writing a snapshot; the guardian owns
        // snapshot-writing only after a KEEP verdict.
        let outcome = {
            let _guard = self.retrain_lock.lock().await;
            retrain_from_labels(
                &self.store,
                &self.registry,
                &self.current,
                &self.bus,
                false,
            )?
        };

        match outcome {
            TrainOutcome::Refused { error } => {
                warn!(error = %error, "guardian retrain refused");
                Ok(())
            }
            TrainOutcome::Trained { version, metrics } => {
                self.apply_eval(&version_before, &version, &metrics).await
            }
        }
    }

    /// Evaluate the freshly trained model against the incumbent and either
    /// promote it (snapshot + reload) or roll it back.
    pub async fn apply_eval(
        &self,
        version_before: &str,
        new_version: &str,
        metrics: &TrainMetrics,
    ) -> anyhow::Result<()> {
        let old_doc = (version_before != MISSING_VERSION)
            .then(|| self.registry.load_metrics(version_before))
            .flatten();
        let old_f1 = old_doc.as_ref().and_then(|d| d.get("f1")).and_then(|v| v.as_f64());
        let old_precision = old_doc
            .as_ref()
            .and_then(|d| d.get("precision"))
            .and_then(|v| v.as_f64());
        let old_recall = old_doc
            .as_ref()
            .and_then(|d| d.get("recall"))
            .and_then(|v| v.as_f64());

        let (eval, eval_reasoning, eval_source) = self
            .evaluate(
                version_before,
                old_f1,
                old_precision,
                old_recall,
                new_version,
                metrics,
            )
            .await;

        let eval_context = json!({
            "old_version": version_before,
            "old_f1": old_f1,
            "old_precision": old_precision,
            "new_version": new_version,
            "new_f1": metrics.f1,
            "new_precision": metrics.precision,
        });

        match eval {
            EvalDecision::Keep => {
                self.current.reload(&self.registry)?;
                self.store.insert_metric_snapshot(&MetricSnapshot {
                    snapshot_id: Uuid::new_v4().to_string(),
                    timestamp: now_ts(),
                    model_version: new_version.to_string(),
                    metrics: serde_json::to_value(metrics)?,
                })?;
                info!(version = new_version, reason = %eval_reasoning, "new model kept");
                self.log_decision(
                    DecisionType::ModelKept,
                    &eval_reasoning,
                    eval_context,
                    Some("kept"),
                    Some(version_before),
                    Some(new_version),
                    eval_source,
                )?;
                self.bus.publish(Event::Retrain {
                    model_version: new_version.to_string(),
                    metrics: serde_json::to_value(metrics)?,
                    timestamp: now_ts(),
                });
            }
            EvalDecision::Rollback => {
                let rolled = self.registry.rollback(new_version)?;
                let restored = self.current.reload(&self.registry)?;
                warn!(
                    rolled_back = new_version,
                    restored = %restored,
                    reason = %eval_reasoning,
                    rename_applied = rolled,
                    "new model rolled back"
                );
                self.log_decision(
                    DecisionType::ModelRolledBack,
                    &eval_reasoning,
                    eval_context,
                    Some("rolled_back"),
                    Some(new_version),
                    Some(&restored),
                    eval_source,
                )?;
                self.bus.publish(Event::AgentDecision {
                    decision_type: DecisionType::ModelRolledBack.as_str().to_string(),
                    reasoning: eval_reasoning,
                    model_version: Some(restored),
                    timestamp: now_ts(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::gbm::{Gbm, GbmParams};
    use crate::risk::registry::VersionBump;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn ctx(
        labels_since: i64,
        total_labels: i64,
        txns_since: i64,
        drift: f64,
        minutes: f64,
    ) -> GuardianContext {
        GuardianContext {
            labels_since,
            total_labels,
            txns_since,
            model_version: "v0.1.0".to_string(),
            current_f1: Some(0.8),
            current_precision: Some(0.8),
            drift,
            minutes_since_snapshot: minutes,
        }
    }

    #[test]
    fn test_decide_skips_below_total_label_floor() {
        let (d, _) = deterministic_decide(&ctx(100, 19, 1000, 0.5, 100.0), 5);
        assert_eq!(d, RetrainDecision::Skip);
    }

    #[test]
    fn test_decide_retrains_on_new_labels() {
        let (d, _) = deterministic_decide(&ctx(5, 50, 0, 0.0, 0.0), 5);
        assert_eq!(d, RetrainDecision::Retrain);
    }

    #[test]
    fn test_decide_retrains_on_drift_with_traffic() {
        let (d, _) = deterministic_decide(&ctx(0, 50, 51, 0.06, 0.0), 5);
        assert_eq!(d, RetrainDecision::Retrain);
        // Drift without traffic is not enough.
        let (d, _) = deterministic_decide(&ctx(0, 50, 10, 0.06, 0.0), 5);
        assert_eq!(d, RetrainDecision::Skip);
    }

    #[test]
    fn test_decide_retrains_on_staleness() {
        let (d, _) = deterministic_decide(&ctx(0, 50, 201, 0.0, 6.0), 5);
        assert_eq!(d, RetrainDecision::Retrain);
        let (d, _) = deterministic_decide(&ctx(0, 50, 201, 0.0, 4.0), 5);
        assert_eq!(d, RetrainDecision::Skip);
    }

    #[test]
    fn test_decide_is_total_over_a_grid() {
        // Every combination maps to exactly one decision without panicking.
        for labels_since in [0, 4, 5, 100] {
            for total in [0, 19, 20, 500] {
                for txns in [0, 50, 51, 200, 201] {
                    for drift in [0.0, 0.05, 0.051] {
                        for minutes in [0.0, 5.0, 5.1, 999.0] {
                            let _ = deterministic_decide(
                                &ctx(labels_since, total, txns, drift, minutes),
                                5,
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_evaluate_rolls_back_on_f1_regression() {
        let (d, _) = deterministic_evaluate(Some(0.8), Some(0.8), 0.4, 0.8);
        assert_eq!(d, EvalDecision::Rollback);
    }

    #[test]
    fn test_evaluate_rolls_back_on_precision_regression() {
        let (d, _) = deterministic_evaluate(Some(0.8), Some(0.8), 0.79, 0.5);
        assert_eq!(d, EvalDecision::Rollback);
    }

    #[test]
    fn test_evaluate_keeps_within_tolerance() {
        let (d, _) = deterministic_evaluate(Some(0.8), Some(0.8), 0.75, 0.75);
        assert_eq!(d, EvalDecision::Keep);
        // No incumbent: always keep.
        let (d, _) = deterministic_evaluate(None, None, 0.1, 0.1);
        assert_eq!(d, EvalDecision::Keep);
    }

    #[test]
    fn test_parse_decision_reply() {
        let reply = "DECISION: RETRAIN\nREASONING: Plenty of new labels.\nCONFIDENCE: HIGH\n";
        let (decision, reasoning) = parse_decision_reply(reply, &["RETRAIN", "SKIP"]).unwrap();
        assert_eq!(decision, "RETRAIN");
        assert_eq!(reasoning, "Plenty of new labels.");

        assert!(parse_decision_reply("total garbage", &["RETRAIN", "SKIP"]).is_none());
        assert!(parse_decision_reply("DECISION: MAYBE", &["KEEP", "ROLLBACK"]).is_none());
    }

    fn toy_model() -> Gbm {
        let x = vec![vec![0.1], vec![0.2], vec![0.8], vec![0.9]];
        let y = vec![0u8, 0, 1, 1];
        Gbm::fit(
            &x,
            &y,
            &GbmParams {
                n_estimators: 3,
                min_child_weight: 0.0,
                ..GbmParams::default()
            },
        )
    }

    fn metrics_with(f1: f64, precision: f64) -> TrainMetrics {
        TrainMetrics {
            precision,
            recall: 0.8,
            f1,
            auc_roc: Some(0.9),
            cv_f1_mean: f1,
            cv_f1_std: 0.01,
            cv_folds: 5,
            train_samples: 60,
            fraud_samples: 30,
            legit_samples: 30,
            feature_importance: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_apply_eval_rolls_back_regressed_model() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(ModelRegistry::new(dir.path()).unwrap());
        let store = Arc::new(Store::in_memory().unwrap());
        let current = Arc::new(CurrentModel::empty());
        let bus = EventBus::new();

        let model = toy_model();
        let v1 = registry
            .publish(
                &model,
                &serde_json::json!({"f1": 0.8, "precision": 0.8, "recall": 0.8}),
                VersionBump::Minor,
            )
            .unwrap();
        let v2 = registry
            .publish(
                &model,
                &serde_json::json!({"f1": 0.4, "precision": 0.8, "recall": 0.8}),
                VersionBump::Minor,
            )
            .unwrap();
        current.reload(&registry).unwrap();
        assert_eq!(current.version(), v2);

        let guardian = Guardian::new(
            store.clone(),
            registry.clone(),
            current.clone(),
            bus,
            None,
            Arc::new(tokio::sync::Mutex::new(())),
            GuardianConfig::default(),
        );

        // new_f1 0.4 against old 0.8: ROLLBACK, file renamed, current reverts.
        guardian
            .apply_eval(&v1, &v2, &metrics_with(0.4, 0.8))
            .await
            .unwrap();

        assert_eq!(registry.current_version(), v1);
        assert_eq!(current.version(), v1);
        let retired = dir.path().join(format!("model_{v2}.json.rolledback"));
        assert!(retired.exists());

        let decisions = store.list_agent_decisions(10).unwrap();
        assert_eq!(decisions[0].decision_type, DecisionType::ModelRolledBack);
    }

    #[tokio::test]
    async fn test_apply_eval_keeps_and_snapshots_good_model() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(ModelRegistry::new(dir.path()).unwrap());
        let store = Arc::new(Store::in_memory().unwrap());
        let current = Arc::new(CurrentModel::empty());
        let bus = EventBus::new();
        let mut sub = bus.subscribe().unwrap();

        let model = toy_model();
        let v1 = registry
            .publish(
                &model,
                &serde_json::json!({"f1": 0.8, "precision": 0.8, "recall": 0.8}),
                VersionBump::Minor,
            )
            .unwrap();
        let v2 = registry
            .publish(
                &model,
                &serde_json::json!({"f1": 0.82, "precision": 0.8, "recall": 0.8}),
                VersionBump::Minor,
            )
            .unwrap();

        let guardian = Guardian::new(
            store.clone(),
            registry.clone(),
            current.clone(),
            bus,
            None,
            Arc::new(tokio::sync::Mutex::new(())),
            GuardianConfig::default(),
        );

        guardian
            .apply_eval(&v1, &v2, &metrics_with(0.82, 0.8))
            .await
            .unwrap();

        assert_eq!(current.version(), v2);
        let snapshots = store.list_metric_snapshots(10).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].model_version, v2);

        let decisions = store.list_agent_decisions(10).unwrap();
        assert_eq!(decisions[0].decision_type, DecisionType::ModelKept);

        // A retrain event went out to subscribers.
        let mut saw_retrain = false;
        while let Some(event) = sub.try_recv() {
            if matches!(event, Event::Retrain { .. }) {
                saw_retrain = true;
            }
        }
        assert!(saw_retrain);
    }
}
