//! Model training from analyst-labeled transactions.
//!
//! Builds the training matrix from scoring-time feature rows (the same
//! feature function serves both paths), trains the boosted classifier with
//! class-imbalance weighting, reports stratified cross-validated F1 as the
//! primary quality metric, and persists through the model registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use statrs::statistics::Statistics;
use tracing::info;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::events::{Event, EventBus};
use crate::features::{compute_features, feature_vector, FEATURE_NAMES};
use crate::models::{
    now_ts, Channel, Features, MetricSnapshot, PatternFeatures, Transaction, TxnType,
    VelocityContext,
};
use crate::risk::gbm::{Gbm, GbmParams};
use crate::risk::registry::{ModelRegistry, VersionBump};
use crate::risk::scorer::CurrentModel;
use crate::storage::{Store, TrainingRow};

/// Minimum labeled samples per class before training is allowed.
pub const MIN_SAMPLES_PER_CLASS: usize = 30;

const MAX_CV_FOLDS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub auc_roc: Option<f64>,
    pub cv_f1_mean: f64,
    pub cv_f1_std: f64,
    pub cv_folds: usize,
    pub train_samples: usize,
    pub fraud_samples: usize,
    pub legit_samples: usize,
    pub feature_importance: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
pub enum TrainOutcome {
    Trained {
        version: String,
        metrics: TrainMetrics,
    },
    Refused {
        error: String,
    },
}

impl TrainOutcome {
    pub fn trained(&self) -> bool {
        matches!(self, TrainOutcome::Trained { .. })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TrainOutcome::Trained { version, metrics } => json!({
                "trained": true,
                "version": version,
                "metrics": metrics,
            }),
            TrainOutcome::Refused { error } => json!({
                "trained": false,
                "error": error,
            }),
        }
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn precision_recall_f1(y_true: &[u8], y_pred: &[u8]) -> (f64, f64, f64) {
    let mut tp = 0.0;
    let mut fp = 0.0;
    let mut fn_ = 0.0;
    for (&truth, &pred) in y_true.iter().zip(y_pred) {
        match (truth, pred) {
            (1, 1) => tp += 1.0,
            (0, 1) => fp += 1.0,
            (1, 0) => fn_ += 1.0,
            _ => {}
        }
    }
    let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
    let recall = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    (precision, recall, f1)
}

/// Rank-based AUC-ROC (Mann-Whitney), with midrank handling for ties.
fn auc_roc(y_true: &[u8], scores: &[f64]) -> Option<f64> {
    let n_pos = y_true.iter().filter(|&&y| y == 1).count();
    let n_neg = y_true.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ranks = vec![0.0f64; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let midrank = ((i + 1 + j + 1) as f64) / 2.0;
        for &idx in &order[i..=j] {
            ranks[idx] = midrank;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = y_true
        .iter()
        .zip(&ranks)
        .filter(|(&y, _)| y == 1)
        .map(|(_, &r)| r)
        .sum();
    let u = pos_rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Some(u / (n_pos as f64 * n_neg as f64))
}

/// Round-robin stratified folds: each fold keeps the class ratio.
fn stratified_folds(y: &[u8], k: usize) -> Vec<Vec<usize>> {
    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); k];
    let mut pos_seen = 0usize;
    let mut neg_seen = 0usize;
    for (i, &label) in y.iter().enumerate() {
        if label == 1 {
            folds[pos_seen % k].push(i);
            pos_seen += 1;
        } else {
            folds[neg_seen % k].push(i);
            neg_seen += 1;
        }
    }
    folds
}

fn cross_validated_f1(
    x: &[Vec<f64>],
    y: &[u8],
    params: &GbmParams,
    k: usize,
) -> (f64, f64, usize) {
    let folds = stratified_folds(y, k);
    let mut fold_scores: Vec<f64> = Vec::with_capacity(k);

    for fold in &folds {
        let holdout: std::collections::HashSet<usize> = fold.iter().copied().collect();
        let mut train_x = Vec::with_capacity(x.len() - fold.len());
        let mut train_y = Vec::with_capacity(x.len() - fold.len());
        for i in 0..x.len() {
            if !holdout.contains(&i) {
                train_x.push(x[i].clone());
                train_y.push(y[i]);
            }
        }

        let model = Gbm::fit(&train_x, &train_y, params);
        let mut y_true = Vec::with_capacity(fold.len());
        let mut y_pred = Vec::with_capacity(fold.len());
        for &i in fold {
            y_true.push(y[i]);
            let p = model.predict_proba(&x[i]).unwrap_or(0.0);
            y_pred.push(u8::from(p >= 0.5));
        }
        let (_, _, f1) = precision_recall_f1(&y_true, &y_pred);
        fold_scores.push(f1);
    }

    let mean = fold_scores.iter().mean();
    let std = if fold_scores.len() > 1 {
        fold_scores.iter().std_dev()
    } else {
        0.0
    };
    (mean, std, k)
}

/// Train on a labeled matrix and publish the artifact. Refuses when either
/// class is under the per-class minimum.
pub fn train(
    x: &[Vec<f64>],
    y: &[u8],
    registry: &ModelRegistry,
    bump: VersionBump,
) -> CoreResult<TrainOutcome> {
    let fraud_count = y.iter().filter(|&&v| v == 1).count();
    let legit_count = y.len() - fraud_count;

    if fraud_count < MIN_SAMPLES_PER_CLASS || legit_count < MIN_SAMPLES_PER_CLASS {
        return Ok(TrainOutcome::Refused {
            error: format!(
                "Insufficient labeled data: {fraud_count} fraud, {legit_count} legit. \
                 Need at least {MIN_SAMPLES_PER_CLASS} of each."
            ),
        });
    }

    let params = GbmParams {
        scale_pos_weight: legit_count as f64 / fraud_count.max(1) as f64,
        ..GbmParams::default()
    };

    // Primary quality metric: stratified k-fold cross-validated F1.
    let k = MAX_CV_FOLDS.min(fraud_count.min(legit_count));
    let (cv_f1_mean, cv_f1_std, cv_folds) = cross_validated_f1(x, y, &params, k);

    // Final model on the full data, with full-data diagnostics.
    let model = Gbm::fit(x, y, &params);
    let scores: Vec<f64> = x
        .iter()
        .map(|row| model.predict_proba(row).unwrap_or(0.0))
        .collect();
    let preds: Vec<u8> = scores.iter().map(|&p| u8::from(p >= 0.5)).collect();
    let (precision, recall, f1) = precision_recall_f1(y, &preds);

    let feature_importance: BTreeMap<String, f64> = FEATURE_NAMES
        .iter()
        .zip(model.feature_importance())
        .map(|(name, gain)| (name.to_string(), round4(gain)))
        .collect();

    let metrics = TrainMetrics {
        precision: round4(precision),
        recall: round4(recall),
        f1: round4(f1),
        auc_roc: auc_roc(y, &scores).map(round4),
        cv_f1_mean: round4(cv_f1_mean),
        cv_f1_std: round4(cv_f1_std),
        cv_folds,
        train_samples: y.len(),
        fraud_samples: fraud_count,
        legit_samples: legit_count,
        feature_importance,
    };

    let version = registry.publish(&model, &serde_json::to_value(&metrics)?, bump)?;
    info!(
        version,
        cv_f1_mean = metrics.cv_f1_mean,
        f1 = metrics.f1,
        samples = y.len(),
        "model trained"
    );

    Ok(TrainOutcome::Trained { version, metrics })
}

/// Neutral feature row for legacy labels that lack stored scoring-time
/// features: amount/type/channel encodings with velocity and temporal
/// context at cold-start defaults.
fn fallback_features(amount: f64, txn_type: &str, channel: &str) -> Features {
    let txn = Transaction {
        txn_id: String::new(),
        timestamp: String::new(),
        amount,
        currency: "USD".to_string(),
        sender_id: String::new(),
        receiver_id: String::new(),
        txn_type: TxnType::parse(txn_type).unwrap_or(TxnType::Transfer),
        channel: Channel::parse(channel).unwrap_or(Channel::Web),
        ip_address: None,
        device_id: None,
        is_fraud_ground_truth: None,
        metadata: None,
    };
    let mut features = compute_features(
        &txn,
        &VelocityContext::default(),
        &PatternFeatures::default(),
        chrono::Utc::now(),
    );
    features.insert("hour_of_day".to_string(), 0.5);
    features.insert("is_weekend".to_string(), 0.0);
    features.insert("hour_risky".to_string(), 0.0);
    features
}

/// Assemble the training matrix from labeled store rows. Stored features
/// win; rows without them are recomputed from the transaction basics.
pub fn training_set_from_rows(rows: &[TrainingRow]) -> (Vec<Vec<f64>>, Vec<u8>) {
    let mut x = Vec::with_capacity(rows.len());
    let mut y = Vec::with_capacity(rows.len());

    for row in rows {
        let features = row
            .features_json
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Features>(raw).ok())
            .unwrap_or_else(|| fallback_features(row.amount, &row.txn_type, &row.channel));
        x.push(feature_vector(&features));
        y.push(u8::from(row.is_fraud));
    }
    (x, y)
}

/// Shared retrain path used by the label-debounce trigger, the manual
/// retrain endpoint, and the guardian. The guardian passes
/// `write_snapshot = false`: it owns snapshot-writing only after its KEEP
/// verdict.
pub fn retrain_from_labels(
    store: &Store,
    registry: &ModelRegistry,
    current: &CurrentModel,
    bus: &EventBus,
    write_snapshot: bool,
) -> CoreResult<TrainOutcome> {
    let rows = store.training_rows()?;
    if rows.len() < MIN_SAMPLES_PER_CLASS * 2 {
        return Ok(TrainOutcome::Refused {
            error: format!(
                "Need at least {} labeled samples, have {}",
                MIN_SAMPLES_PER_CLASS * 2,
                rows.len()
            ),
        });
    }

    let (x, y) = training_set_from_rows(&rows);
    let outcome = train(&x, &y, registry, VersionBump::Minor)?;

    if write_snapshot {
        if let TrainOutcome::Trained { version, metrics } = &outcome {
            current.reload(registry)?;
            store.insert_metric_snapshot(&MetricSnapshot {
                snapshot_id: Uuid::new_v4().to_string(),
                timestamp: now_ts(),
                model_version: version.clone(),
                metrics: serde_json::to_value(metrics)?,
            })?;
            bus.publish(Event::Retrain {
                model_version: version.clone(),
                metrics: serde_json::to_value(metrics)?,
                timestamp: now_ts(),
            });
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Labeled samples shaped like the real feature space: fraud rows have
    /// saturated amount/velocity features, legit rows stay small.
    fn labeled_matrix(per_class: usize) -> (Vec<Vec<f64>>, Vec<u8>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        let width = FEATURE_NAMES.len();
        for i in 0..per_class {
            let jitter = (i % 10) as f64 / 100.0;

            let mut legit = vec![0.0; width];
            legit[0] = 0.01 + jitter; // amount_normalized
            legit[1] = 0.3 + jitter; // amount_log
            legit[9] = 1.0; // channel_web
            x.push(legit);
            y.push(0u8);

            let mut fraud = vec![0.0; width];
            fraud[0] = 0.9 - jitter;
            fraud[1] = 0.95 - jitter;
            fraud[2] = 1.0; // amount_high
            fraud[14] = 0.4 + jitter; // sender_txn_count_1h
            x.push(fraud);
            y.push(1u8);
        }
        (x, y)
    }

    #[test]
    fn test_refuses_below_min_samples_per_class() {
        let dir = tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path()).unwrap();
        let (x, y) = labeled_matrix(MIN_SAMPLES_PER_CLASS - 1);

        let outcome = train(&x, &y, &registry, VersionBump::Minor).unwrap();
        match outcome {
            TrainOutcome::Refused { error } => {
                assert!(error.contains("29 fraud"), "error was: {error}");
                assert!(error.contains("29 legit"));
            }
            TrainOutcome::Trained { .. } => panic!("should have refused"),
        }
        // Nothing published on refusal.
        assert_eq!(registry.current_version(), "missing");
    }

    #[test]
    fn test_trains_at_exact_minimum() {
        let dir = tempdir().unwrap();
        let registry = ModelRegistry::new(dir.path()).unwrap();
        let (x, y) = labeled_matrix(MIN_SAMPLES_PER_CLASS);

        let outcome = train(&x, &y, &registry, VersionBump::Minor).unwrap();
        match outcome {
            TrainOutcome::Trained { version, metrics } => {
                assert_eq!(version, "v0.1.0");
                assert_eq!(metrics.cv_folds, 5);
                assert!(metrics.cv_f1_mean > 0.8, "cv f1 {}", metrics.cv_f1_mean);
                assert!(metrics.f1 > 0.9);
                assert_eq!(metrics.fraud_samples, MIN_SAMPLES_PER_CLASS);
                assert!(metrics.auc_roc.unwrap() > 0.9);
                assert_eq!(metrics.feature_importance.len(), FEATURE_NAMES.len());
            }
            TrainOutcome::Refused { error } => panic!("refused: {error}"),
        }
        assert_eq!(registry.current_version(), "v0.1.0");
    }

    #[test]
    fn test_training_set_prefers_stored_features() {
        // A row with stored scoring-time features must reproduce exactly
        // the vector the scorer saw (zero training/serving skew).
        let mut features = Features::new();
        for (i, name) in FEATURE_NAMES.iter().enumerate() {
            features.insert(name.to_string(), i as f64 / 100.0);
        }
        let row = TrainingRow {
            features_json: Some(serde_json::to_string(&features).unwrap()),
            amount: 999.0,
            txn_type: "transfer".to_string(),
            channel: "api".to_string(),
            is_fraud: true,
        };

        let (x, y) = training_set_from_rows(&[row]);
        assert_eq!(x[0], feature_vector(&features));
        assert_eq!(y[0], 1);
    }

    #[test]
    fn test_training_set_falls_back_to_recomputed_features() {
        let row = TrainingRow {
            features_json: None,
            amount: 45_000.0,
            txn_type: "transfer".to_string(),
            channel: "api".to_string(),
            is_fraud: false,
        };
        let (x, y) = training_set_from_rows(&[row]);
        assert_eq!(y[0], 0);
        // amount_normalized saturates, is_transfer and channel_api one-hot.
        assert_eq!(x[0][0], 1.0);
        assert_eq!(x[0][4], 1.0);
        assert_eq!(x[0][10], 1.0);
        // Neutral temporal defaults.
        assert_eq!(x[0][11], 0.5);
        assert_eq!(x[0][13], 0.0);
    }

    #[test]
    fn test_auc_roc_perfect_and_random() {
        let y = vec![0u8, 0, 1, 1];
        assert_eq!(auc_roc(&y, &[0.1, 0.2, 0.8, 0.9]), Some(1.0));
        assert_eq!(auc_roc(&y, &[0.9, 0.8, 0.2, 0.1]), Some(0.0));
        assert_eq!(auc_roc(&y, &[0.5, 0.5, 0.5, 0.5]), Some(0.5));
        assert_eq!(auc_roc(&[0, 0], &[0.5, 0.5]), None);
    }

    #[test]
    fn test_stratified_folds_keep_both_classes() {
        let y: Vec<u8> = (0..60).map(|i| u8::from(i % 2 == 0)).collect();
        let folds = stratified_folds(&y, 5);
        assert_eq!(folds.len(), 5);
        for fold in &folds {
            let pos = fold.iter().filter(|&&i| y[i] == 1).count();
            let neg = fold.len() - pos;
            assert!(pos > 0 && neg > 0);
        }
        let total: usize = folds.iter().map(|f| f.len()).sum();
        assert_eq!(total, 60);
    }
}
