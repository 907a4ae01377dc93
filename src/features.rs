//! Deterministic feature engineering for risk scoring.
//!
//! One pure function turns a transaction plus its velocity and pattern
//! context into a fixed-order vector of named floats. Training uses the
//! exact same function: any divergence between training and serving
//! features is a correctness bug, so there is exactly one implementation.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::models::{Channel, Features, Metadata, PatternFeatures, Transaction, TxnType, VelocityContext};

/// Feature names in scoring order. This array is the single ordering
/// authority shared by the scorer and the trainer.
pub const FEATURE_NAMES: [&str; 34] = [
    "amount_normalized",
    "amount_log",
    "amount_high",
    "amount_small",
    "is_transfer",
    "is_withdrawal",
    "is_deposit",
    "is_payment",
    "is_small_deposit",
    "channel_web",
    "channel_api",
    "hour_of_day",
    "is_weekend",
    "hour_risky",
    "sender_txn_count_1h",
    "sender_txn_count_24h",
    "sender_amount_sum_1h",
    "sender_unique_receivers_24h",
    "time_since_last_txn_minutes",
    "device_reuse_count_24h",
    "ip_reuse_count_24h",
    "receiver_txn_count_24h",
    "receiver_amount_sum_24h",
    "receiver_unique_senders_24h",
    "first_time_counterparty",
    "ip_country_risk",
    "card_bin_risk",
    // Pattern-derived features (from graph mining feedback loop)
    "sender_in_ring",
    "sender_is_hub",
    "sender_in_velocity_cluster",
    "sender_in_dense_cluster",
    "receiver_in_ring",
    "receiver_is_hub",
    "pattern_count_sender",
];

pub fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

fn flag(condition: bool) -> f64 {
    if condition {
        1.0
    } else {
        0.0
    }
}

pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn ip_country_risk(metadata: Option<&Metadata>) -> f64 {
    let country = metadata
        .and_then(|m| m.get("ip_country"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_uppercase())
        .unwrap_or_default();

    match country.as_str() {
        "NG" => 1.0,
        "BR" => 0.8,
        "SG" => 0.6,
        "FR" => 0.3,
        "DE" => 0.2,
        "GB" => 0.1,
        "US" => 0.1,
        "" => 0.0,
        _ => 0.4,
    }
}

fn card_bin_risk(metadata: Option<&Metadata>) -> f64 {
    let raw = metadata.and_then(|m| m.get("card_bin"));
    let bin = match raw {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    match bin {
        Some(b) if (460_000..=499_999).contains(&b) => 0.7,
        Some(b) if (430_000..=459_999).contains(&b) => 0.4,
        Some(_) => 0.1,
        None => 0.0,
    }
}

/// Compute the full feature mapping for one transaction.
///
/// `now` drives the temporal features; callers pass the current UTC clock.
/// Velocity fields arrive raw from the store and are normalized here with
/// fixed denominators; pattern fields pass through untouched.
pub fn compute_features(
    txn: &Transaction,
    velocity: &VelocityContext,
    patterns: &PatternFeatures,
    now: DateTime<Utc>,
) -> Features {
    let amount = txn.amount;
    let metadata = txn.metadata.as_ref();

    // Amount features
    let amount_normalized = (amount / 10_000.0).min(1.0);
    let amount_log = ((amount + 1.0).ln() / 50_001f64.ln()).min(1.0);
    let amount_high = if amount > 5_000.0 {
        1.0
    } else if amount > 2_000.0 {
        amount / 5_000.0
    } else {
        0.0
    };
    let amount_small = if amount < 100.0 {
        1.0
    } else if amount < 500.0 {
        ((500.0 - amount) / 400.0).max(0.0)
    } else {
        0.0
    };

    // Transaction type one-hot
    let is_transfer = flag(txn.txn_type == TxnType::Transfer);
    let is_withdrawal = flag(txn.txn_type == TxnType::Withdrawal);
    let is_deposit = flag(txn.txn_type == TxnType::Deposit);
    let is_payment = flag(txn.txn_type == TxnType::Payment);
    let is_small_deposit = flag(txn.txn_type == TxnType::Deposit && amount <= 100.0);

    // Channel features
    let channel_web = flag(txn.channel == Channel::Web);
    let channel_api = flag(txn.channel == Channel::Api);

    // Temporal features
    let hour = now.hour();
    let hour_of_day = f64::from(hour) / 23.0;
    let is_weekend = flag(now.weekday().num_days_from_monday() >= 5);
    let hour_risky = flag(hour < 5);

    // Velocity features, normalized by fixed denominators
    let sender_txn_count_1h = (velocity.sender_txn_count_1h as f64 / 20.0).min(1.0);
    let sender_txn_count_24h = (velocity.sender_txn_count_24h as f64 / 100.0).min(1.0);
    let sender_amount_sum_1h = (velocity.sender_amount_sum_1h / 50_000.0).min(1.0);
    let sender_unique_receivers_24h =
        (velocity.sender_unique_receivers_24h as f64 / 20.0).min(1.0);
    let device_reuse_count_24h = (velocity.device_reuse_count_24h as f64 / 5.0).min(1.0);
    let ip_reuse_count_24h = (velocity.ip_reuse_count_24h as f64 / 10.0).min(1.0);
    let receiver_txn_count_24h = (velocity.receiver_txn_count_24h as f64 / 200.0).min(1.0);
    let receiver_amount_sum_24h = (velocity.receiver_amount_sum_24h / 100_000.0).min(1.0);
    let receiver_unique_senders_24h =
        (velocity.receiver_unique_senders_24h as f64 / 40.0).min(1.0);
    let first_time_counterparty = flag(velocity.first_time_counterparty);

    // Inverted gap: shorter time since the last transaction = higher value.
    let time_since_last_txn_minutes =
        (1.0 - velocity.time_since_last_txn_minutes / 60.0).max(0.0);

    let mut features = Features::new();
    features.insert("amount_normalized".into(), round6(amount_normalized));
    features.insert("amount_log".into(), round6(amount_log));
    features.insert("amount_high".into(), round6(amount_high));
    features.insert("amount_small".into(), round6(amount_small));
    features.insert("is_transfer".into(), is_transfer);
    features.insert("is_withdrawal".into(), is_withdrawal);
    features.insert("is_deposit".into(), is_deposit);
    features.insert("is_payment".into(), is_payment);
    features.insert("is_small_deposit".into(), is_small_deposit);
    features.insert("channel_web".into(), channel_web);
    features.insert("channel_api".into(), channel_api);
    features.insert("hour_of_day".into(), round4(hour_of_day));
    features.insert("is_weekend".into(), is_weekend);
    features.insert("hour_risky".into(), hour_risky);
    features.insert("sender_txn_count_1h".into(), round6(sender_txn_count_1h));
    features.insert("sender_txn_count_24h".into(), round6(sender_txn_count_24h));
    features.insert("sender_amount_sum_1h".into(), round6(sender_amount_sum_1h));
    features.insert(
        "sender_unique_receivers_24h".into(),
        round6(sender_unique_receivers_24h),
    );
    features.insert(
        "time_since_last_txn_minutes".into(),
        round6(time_since_last_txn_minutes),
    );
    features.insert(
        "device_reuse_count_24h".into(),
        round6(device_reuse_count_24h),
    );
    features.insert("ip_reuse_count_24h".into(), round6(ip_reuse_count_24h));
    features.insert(
        "receiver_txn_count_24h".into(),
        round6(receiver_txn_count_24h),
    );
    features.insert(
        "receiver_amount_sum_24h".into(),
        round6(receiver_amount_sum_24h),
    );
    features.insert(
        "receiver_unique_senders_24h".into(),
        round6(receiver_unique_senders_24h),
    );
    features.insert("first_time_counterparty".into(), first_time_counterparty);
    features.insert("ip_country_risk".into(), round4(ip_country_risk(metadata)));
    features.insert("card_bin_risk".into(), round4(card_bin_risk(metadata)));

    // Pattern-derived features: pass-through from the card index
    features.insert("sender_in_ring".into(), patterns.sender_in_ring);
    features.insert("sender_is_hub".into(), patterns.sender_is_hub);
    features.insert(
        "sender_in_velocity_cluster".into(),
        patterns.sender_in_velocity_cluster,
    );
    features.insert(
        "sender_in_dense_cluster".into(),
        patterns.sender_in_dense_cluster,
    );
    features.insert("receiver_in_ring".into(), patterns.receiver_in_ring);
    features.insert("receiver_is_hub".into(), patterns.receiver_is_hub);
    features.insert(
        "pattern_count_sender".into(),
        patterns.pattern_count_sender,
    );

    features
}

/// Project a named mapping into the fixed scoring order. Missing names
/// default to 0.0 so vectors from older stored rows stay usable.
pub fn feature_vector(features: &Features) -> Vec<f64> {
    FEATURE_NAMES
        .iter()
        .map(|name| features.get(*name).copied().unwrap_or(0.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, Transaction, TxnType};
    use chrono::TimeZone;

    fn txn(amount: f64, txn_type: TxnType, channel: Channel) -> Transaction {
        Transaction {
            txn_id: "t1".to_string(),
            timestamp: "2026-01-05T12:00:00.000000Z".to_string(),
            amount,
            currency: "USD".to_string(),
            sender_id: "s1".to_string(),
            receiver_id: "r1".to_string(),
            txn_type,
            channel,
            ip_address: None,
            device_id: None,
            is_fraud_ground_truth: None,
            metadata: None,
        }
    }

    fn noon() -> DateTime<Utc> {
        // A Monday at 12:00 UTC
        Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_every_feature_name_is_produced() {
        let f = compute_features(
            &txn(100.0, TxnType::Transfer, Channel::Web),
            &VelocityContext::default(),
            &PatternFeatures::default(),
            noon(),
        );
        for name in FEATURE_NAMES {
            assert!(f.contains_key(name), "missing feature {name}");
        }
        assert_eq!(f.len(), FEATURE_NAMES.len());
    }

    #[test]
    fn test_all_features_finite_and_bounded() {
        let mut velocity = VelocityContext::default();
        velocity.sender_txn_count_1h = 500;
        velocity.sender_amount_sum_1h = 9_000_000.0;
        velocity.device_reuse_count_24h = 99;
        velocity.time_since_last_txn_minutes = 0.0;

        let f = compute_features(
            &txn(999_999_999.0, TxnType::Deposit, Channel::Api),
            &velocity,
            &PatternFeatures::default(),
            noon(),
        );
        for (name, v) in &f {
            assert!(v.is_finite(), "{name} not finite");
            assert!((0.0..=1.0).contains(v), "{name} out of range: {v}");
        }
    }

    #[test]
    fn test_amount_encodings() {
        let f = compute_features(
            &txn(45_000.0, TxnType::Transfer, Channel::Api),
            &VelocityContext::default(),
            &PatternFeatures::default(),
            noon(),
        );
        assert_eq!(f["amount_normalized"], 1.0);
        assert_eq!(f["amount_high"], 1.0);
        assert_eq!(f["amount_small"], 0.0);
        assert_eq!(f["is_transfer"], 1.0);
        assert_eq!(f["channel_api"], 1.0);

        let f = compute_features(
            &txn(3_000.0, TxnType::Payment, Channel::Web),
            &VelocityContext::default(),
            &PatternFeatures::default(),
            noon(),
        );
        assert_eq!(f["amount_high"], 0.6);

        let f = compute_features(
            &txn(300.0, TxnType::Payment, Channel::Web),
            &VelocityContext::default(),
            &PatternFeatures::default(),
            noon(),
        );
        assert_eq!(f["amount_small"], 0.5);
    }

    #[test]
    fn test_small_deposit_indicator() {
        let f = compute_features(
            &txn(80.0, TxnType::Deposit, Channel::Web),
            &VelocityContext::default(),
            &PatternFeatures::default(),
            noon(),
        );
        assert_eq!(f["is_small_deposit"], 1.0);

        let f = compute_features(
            &txn(80.0, TxnType::Transfer, Channel::Web),
            &VelocityContext::default(),
            &PatternFeatures::default(),
            noon(),
        );
        assert_eq!(f["is_small_deposit"], 0.0);
    }

    #[test]
    fn test_time_since_last_inversion_is_monotone() {
        // Shorter gap must never produce a smaller feature value.
        let mut prev = f64::INFINITY;
        for minutes in [0.0, 5.0, 15.0, 30.0, 59.0, 60.0, 120.0, 1440.0] {
            let mut velocity = VelocityContext::default();
            velocity.time_since_last_txn_minutes = minutes;
            let f = compute_features(
                &txn(10.0, TxnType::Payment, Channel::Web),
                &velocity,
                &PatternFeatures::default(),
                noon(),
            );
            let v = f["time_since_last_txn_minutes"];
            assert!(v <= prev, "inversion violated at {minutes} minutes");
            prev = v;
        }
        // Fully saturated at zero gap, floored at zero past an hour.
        let mut velocity = VelocityContext::default();
        velocity.time_since_last_txn_minutes = 0.0;
        let f = compute_features(
            &txn(10.0, TxnType::Payment, Channel::Web),
            &velocity,
            &PatternFeatures::default(),
            noon(),
        );
        assert_eq!(f["time_since_last_txn_minutes"], 1.0);
    }

    #[test]
    fn test_geography_risk_table() {
        let mut t = txn(10.0, TxnType::Payment, Channel::Web);
        for (country, expected) in [
            ("NG", 1.0),
            ("BR", 0.8),
            ("SG", 0.6),
            ("FR", 0.3),
            ("DE", 0.2),
            ("GB", 0.1),
            ("US", 0.1),
            ("XX", 0.4),
        ] {
            let mut meta = crate::models::Metadata::new();
            meta.insert("ip_country".into(), serde_json::json!(country));
            t.metadata = Some(meta);
            let f = compute_features(
                &t,
                &VelocityContext::default(),
                &PatternFeatures::default(),
                noon(),
            );
            assert_eq!(f["ip_country_risk"], expected, "country {country}");
        }

        t.metadata = None;
        let f = compute_features(
            &t,
            &VelocityContext::default(),
            &PatternFeatures::default(),
            noon(),
        );
        assert_eq!(f["ip_country_risk"], 0.0);
    }

    #[test]
    fn test_card_bin_ranges() {
        let mut t = txn(10.0, TxnType::Deposit, Channel::Web);
        for (bin, expected) in [(470000, 0.7), (440000, 0.4), (510000, 0.1)] {
            let mut meta = crate::models::Metadata::new();
            meta.insert("card_bin".into(), serde_json::json!(bin));
            t.metadata = Some(meta);
            let f = compute_features(
                &t,
                &VelocityContext::default(),
                &PatternFeatures::default(),
                noon(),
            );
            assert_eq!(f["card_bin_risk"], expected, "bin {bin}");
        }
    }

    #[test]
    fn test_hour_risky_window() {
        let t = txn(10.0, TxnType::Payment, Channel::Web);
        let late = Utc.with_ymd_and_hms(2026, 1, 5, 3, 0, 0).unwrap();
        let f = compute_features(
            &t,
            &VelocityContext::default(),
            &PatternFeatures::default(),
            late,
        );
        assert_eq!(f["hour_risky"], 1.0);

        let f = compute_features(
            &t,
            &VelocityContext::default(),
            &PatternFeatures::default(),
            noon(),
        );
        assert_eq!(f["hour_risky"], 0.0);
    }

    #[test]
    fn test_feature_vector_order_matches_names() {
        let f = compute_features(
            &txn(100.0, TxnType::Transfer, Channel::Web),
            &VelocityContext::default(),
            &PatternFeatures::default(),
            noon(),
        );
        let v = feature_vector(&f);
        assert_eq!(v.len(), FEATURE_NAMES.len());
        assert_eq!(v[0], f["amount_normalized"]);
        assert_eq!(v[4], f["is_transfer"]);
        assert_eq!(v[33], f["pattern_count_sender"]);
    }
}
