//! Dual-mode risk scoring.
//!
//! Classifier mode reads P(fraud) from the current model; rules mode is a
//! weighted feature sum used before enough labels exist or when the
//! classifier cannot answer. Both paths share one feature vector and one
//! decision ladder.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::features::{feature_vector, round4};
use crate::models::{now_ts, Decision, Features, RiskResult};
use crate::risk::gbm::Gbm;
use crate::risk::registry::{ModelRegistry, MISSING_VERSION};

/// score >= REVIEW -> review, score >= BLOCK -> block.
pub const REVIEW_THRESHOLD: f64 = 0.5;
pub const BLOCK_THRESHOLD: f64 = 0.8;

/// Version tag reported when the weighted-rules path produced the score.
pub const RULES_VERSION: &str = "v0.0.0-rules";

/// Weights for rule-based scoring. Rewriting an entry changes scoring
/// behavior visibly; the table is the documented contract of rules mode.
pub const FEATURE_WEIGHTS: &[(&str, f64)] = &[
    ("amount_normalized", 0.18),
    ("amount_log", 0.04),
    ("amount_high", 0.14),
    ("amount_small", 0.06),
    ("is_small_deposit", 0.12),
    ("is_transfer", 0.08),
    ("is_withdrawal", 0.04),
    ("is_deposit", -0.04),
    ("channel_api", 0.08),
    ("hour_risky", 0.04),
    ("is_weekend", 0.02),
    ("sender_txn_count_1h", 0.08),
    ("sender_txn_count_24h", 0.05),
    ("sender_amount_sum_1h", 0.06),
    ("sender_unique_receivers_24h", 0.05),
    ("time_since_last_txn_minutes", 0.06),
    ("device_reuse_count_24h", 0.14),
    ("ip_reuse_count_24h", 0.12),
    ("receiver_txn_count_24h", 0.04),
    ("receiver_amount_sum_24h", 0.04),
    ("receiver_unique_senders_24h", 0.04),
    ("first_time_counterparty", 0.03),
    ("ip_country_risk", 0.06),
    ("card_bin_risk", 0.05),
    // Pattern-derived features (from graph mining feedback loop)
    ("sender_in_ring", 0.15),
    ("sender_is_hub", 0.08),
    ("sender_in_velocity_cluster", 0.10),
    ("sender_in_dense_cluster", 0.08),
    ("receiver_in_ring", 0.12),
    ("receiver_is_hub", 0.06),
    ("pattern_count_sender", 0.10),
];

#[derive(Debug)]
pub struct LoadedModel {
    pub model: Gbm,
    pub version: String,
}

/// Atomically swappable handle on the current classifier. Serving readers
/// observe either the old or the new artifact, never a torn state; reload
/// is an explicit operation after publish or rollback.
pub struct CurrentModel {
    slot: ArcSwapOption<LoadedModel>,
}

impl Default for CurrentModel {
    fn default() -> Self {
        Self::empty()
    }
}

impl CurrentModel {
    pub fn empty() -> Self {
        Self {
            slot: ArcSwapOption::from(None),
        }
    }

    pub fn get(&self) -> Option<Arc<LoadedModel>> {
        self.slot.load_full()
    }

    pub fn version(&self) -> String {
        self.get()
            .map(|m| m.version.clone())
            .unwrap_or_else(|| MISSING_VERSION.to_string())
    }

    /// Re-resolve "current" from the registry and swap the handle. Clears
    /// the slot when no live artifact remains.
    pub fn reload(&self, registry: &ModelRegistry) -> CoreResult<String> {
        match registry.load_current()? {
            Some((model, version)) => {
                self.slot
                    .store(Some(Arc::new(LoadedModel {
                        model,
                        version: version.clone(),
                    })));
                debug!(version, "current model reloaded");
                Ok(version)
            }
            None => {
                self.slot.store(None);
                debug!("no live model artifact, rules mode");
                Ok(MISSING_VERSION.to_string())
            }
        }
    }
}

pub fn rule_based_score(features: &Features) -> f64 {
    FEATURE_WEIGHTS
        .iter()
        .map(|(name, weight)| features.get(*name).copied().unwrap_or(0.0) * weight)
        .sum()
}

/// Deterministic reason ladder, appended in declared order. Every reason is
/// derived from a feature the table exposes.
fn build_reasons(features: &Features) -> Vec<String> {
    let get = |name: &str| features.get(name).copied().unwrap_or(0.0);
    let mut reasons = Vec::new();

    if get("amount_normalized") > 0.5 {
        reasons.push("High transaction amount".to_string());
    }
    if get("is_transfer") > 0.0 && get("amount_normalized") > 0.3 {
        reasons.push("Large transfer".to_string());
    }
    if get("sender_txn_count_1h") > 0.3 {
        reasons.push("High sender velocity (1h)".to_string());
    }
    if get("sender_txn_count_24h") > 0.3 {
        reasons.push("High sender activity (24h)".to_string());
    }
    if get("sender_amount_sum_1h") > 0.4 {
        reasons.push("High cumulative amount (1h)".to_string());
    }
    if get("sender_unique_receivers_24h") > 0.3 {
        reasons.push("Many unique receivers (24h)".to_string());
    }
    if get("device_reuse_count_24h") > 0.2 {
        reasons.push("Shared device across multiple accounts".to_string());
    }
    if get("ip_reuse_count_24h") > 0.2 {
        reasons.push("Shared IP across multiple accounts".to_string());
    }
    if get("is_small_deposit") > 0.0
        && (get("device_reuse_count_24h") > 0.1 || get("ip_reuse_count_24h") > 0.1)
    {
        reasons.push("Small deposit with shared device/IP".to_string());
    }
    if get("ip_country_risk") > 0.5 {
        reasons.push("Higher-risk IP geography".to_string());
    }
    if get("card_bin_risk") > 0.5 {
        reasons.push("Higher-risk card BIN".to_string());
    }
    if get("channel_api") > 0.0 && get("amount_normalized") > 0.2 {
        reasons.push("API channel with notable amount".to_string());
    }
    if get("hour_risky") > 0.0 {
        reasons.push("Transaction during risky hours".to_string());
    }
    if get("sender_in_ring") > 0.0 {
        reasons.push("Sender appears in circular fund flow pattern".to_string());
    }
    if get("sender_is_hub") > 0.0 {
        reasons.push("Sender is a high-activity hub account".to_string());
    }
    if get("sender_in_velocity_cluster") > 0.0 {
        reasons.push("Sender flagged in velocity spike pattern".to_string());
    }
    if get("receiver_in_ring") > 0.0 {
        reasons.push("Receiver appears in circular fund flow pattern".to_string());
    }

    reasons
}

pub struct Scorer {
    current: Arc<CurrentModel>,
}

impl Scorer {
    pub fn new(current: Arc<CurrentModel>) -> Self {
        Self { current }
    }

    pub fn model_version(&self) -> String {
        self.current.version()
    }

    /// Score one transaction's features. Classifier first; rules on absence
    /// or failure. The error variant is reserved for the unreachable case
    /// where neither path can answer.
    pub fn score(&self, txn_id: &str, features: &Features) -> CoreResult<RiskResult> {
        let (raw_score, model_version) = match self.current.get() {
            Some(loaded) => {
                let vector = feature_vector(features);
                match loaded.model.predict_proba(&vector) {
                    Some(p) => (p, loaded.version.clone()),
                    None => {
                        warn!(
                            version = loaded.version,
                            "classifier rejected feature vector, falling back to rules"
                        );
                        (rule_based_score(features), RULES_VERSION.to_string())
                    }
                }
            }
            None => (rule_based_score(features), RULES_VERSION.to_string()),
        };

        if !raw_score.is_finite() {
            return Err(CoreError::ScorerUnavailable(
                "neither classifier nor rules produced a finite score".into(),
            ));
        }

        let score = round4(raw_score.clamp(0.0, 1.0));
        let decision = if score >= BLOCK_THRESHOLD {
            Decision::Block
        } else if score >= REVIEW_THRESHOLD {
            Decision::Review
        } else {
            Decision::Approve
        };

        Ok(RiskResult {
            txn_id: txn_id.to_string(),
            score,
            flagged: decision != Decision::Approve,
            decision,
            threshold_used: REVIEW_THRESHOLD,
            features: features.clone(),
            reasons: build_reasons(features),
            model_version,
            uncertainty: round4((score - 0.5).abs()),
            computed_at: now_ts(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{compute_features, FEATURE_NAMES};
    use crate::models::{
        Channel, PatternFeatures, Transaction, TxnType, VelocityContext,
    };
    use chrono::{TimeZone, Utc};

    fn scorer() -> Scorer {
        Scorer::new(Arc::new(CurrentModel::empty()))
    }

    fn features_for(amount: f64, txn_type: TxnType, channel: Channel) -> Features {
        let txn = Transaction {
            txn_id: "t1".to_string(),
            timestamp: "2026-01-05T12:00:00.000000Z".to_string(),
            amount,
            currency: "USD".to_string(),
            sender_id: "fraud_sender".to_string(),
            receiver_id: "r1".to_string(),
            txn_type,
            channel,
            ip_address: None,
            device_id: None,
            is_fraud_ground_truth: None,
            metadata: None,
        };
        let noon = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        compute_features(
            &txn,
            &VelocityContext::default(),
            &PatternFeatures::default(),
            noon,
        )
    }

    #[test]
    fn test_weights_table_matches_feature_names() {
        for (name, _) in FEATURE_WEIGHTS {
            assert!(FEATURE_NAMES.contains(name), "unknown weighted feature {name}");
        }
    }

    #[test]
    fn test_rules_mode_flags_large_api_transfer() {
        // Untrained registry: a $45k transfer over the API channel must at
        // least reach review, with the amount and channel called out.
        let scorer = scorer();
        let features = features_for(45_000.0, TxnType::Transfer, Channel::Api);
        let result = scorer.score("t1", &features).unwrap();

        assert!(result.score >= 0.5, "score was {}", result.score);
        assert_ne!(result.decision, Decision::Approve);
        assert_eq!(result.model_version, RULES_VERSION);
        assert!(result
            .reasons
            .iter()
            .any(|r| r == "High transaction amount"));
        assert!(result
            .reasons
            .iter()
            .any(|r| r == "API channel with notable amount"));
    }

    #[test]
    fn test_small_web_payment_approved() {
        let scorer = scorer();
        let features = features_for(25.0, TxnType::Payment, Channel::Web);
        let result = scorer.score("t1", &features).unwrap();
        assert_eq!(result.decision, Decision::Approve);
        assert!(!result.flagged);
    }

    #[test]
    fn test_uncertainty_is_distance_from_half() {
        let scorer = scorer();
        for (amount, txn_type, channel) in [
            (45_000.0, TxnType::Transfer, Channel::Api),
            (25.0, TxnType::Payment, Channel::Web),
            (6_000.0, TxnType::Withdrawal, Channel::Mobile),
        ] {
            let features = features_for(amount, txn_type, channel);
            let result = scorer.score("t1", &features).unwrap();
            assert_eq!(result.uncertainty, round4((result.score - 0.5).abs()));
        }
    }

    #[test]
    fn test_score_clamped_to_unit_interval() {
        let scorer = scorer();
        let mut features = features_for(45_000.0, TxnType::Transfer, Channel::Api);
        // Saturate every weighted feature.
        for name in FEATURE_NAMES {
            features.insert(name.to_string(), 1.0);
        }
        let result = scorer.score("t1", &features).unwrap();
        assert!(result.score <= 1.0);
        assert_eq!(result.decision, Decision::Block);
    }

    #[test]
    fn test_pattern_reasons_fire_on_pattern_bits() {
        let scorer = scorer();
        let mut features = features_for(100.0, TxnType::Transfer, Channel::Web);
        features.insert("sender_in_ring".to_string(), 1.0);
        features.insert("receiver_in_ring".to_string(), 1.0);
        let result = scorer.score("t1", &features).unwrap();
        assert!(result
            .reasons
            .iter()
            .any(|r| r == "Sender appears in circular fund flow pattern"));
        assert!(result
            .reasons
            .iter()
            .any(|r| r == "Receiver appears in circular fund flow pattern"));
    }

    #[test]
    fn test_reason_order_is_declared_order() {
        let scorer = scorer();
        let features = features_for(45_000.0, TxnType::Transfer, Channel::Api);
        let result = scorer.score("t1", &features).unwrap();
        let amount_pos = result
            .reasons
            .iter()
            .position(|r| r == "High transaction amount");
        let api_pos = result
            .reasons
            .iter()
            .position(|r| r == "API channel with notable amount");
        assert!(amount_pos.unwrap() < api_pos.unwrap());
    }
}
