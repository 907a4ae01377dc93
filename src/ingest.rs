//! Per-transaction ingestion pipeline.
//!
//! Orchestrates context gathering, scoring, atomic persistence, event
//! publication, and the fire-and-forget explain job. Events only go out
//! after the store commit; a failed commit leaves no partial state and
//! publishes nothing.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::features::compute_features;
use crate::llm::OllamaClient;
use crate::models::{now_ts, Case, RiskResult, Transaction, TransactionRequest};
use crate::patterns::features::PatternFeatureIndex;
use crate::risk::explainer::{explain_case, ExplainInput, PatternSummary};
use crate::risk::scorer::Scorer;
use crate::storage::Store;

#[derive(Debug, Clone, Serialize)]
pub struct ScoredTransaction {
    #[serde(flatten)]
    pub txn: Transaction,
    pub risk_score: f64,
    pub decision: String,
    pub case_id: Option<String>,
}

pub struct IngestionPipeline {
    store: Arc<Store>,
    scorer: Arc<Scorer>,
    bus: EventBus,
    llm: Option<OllamaClient>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<Store>,
        scorer: Arc<Scorer>,
        bus: EventBus,
        llm: Option<OllamaClient>,
    ) -> Self {
        Self {
            store,
            scorer,
            bus,
            llm,
        }
    }

    /// Ingest one transaction: validate, gather context, score, persist
    /// atomically, publish, schedule the explainer when flagged.
    pub async fn ingest(&self, request: TransactionRequest) -> CoreResult<ScoredTransaction> {
        let now = Utc::now();
        let txn = request.into_transaction(now)?;

        // Velocity and pattern context over the current snapshot.
        let (velocity, pattern_feats) = tokio::join!(
            async {
                self.store.velocity_context(
                    &txn.sender_id,
                    &txn.receiver_id,
                    txn.device_id.as_deref(),
                    txn.ip_address.as_deref(),
                    now,
                )
            },
            async {
                let cards = self.store.active_pattern_cards()?;
                Ok::<_, CoreError>(
                    PatternFeatureIndex::build(&cards)
                        .lookup(&txn.sender_id, &txn.receiver_id),
                )
            }
        );
        let velocity = velocity?;
        let pattern_feats = pattern_feats?;

        let features = compute_features(&txn, &velocity, &pattern_feats, now);
        let risk = self.scorer.score(&txn.txn_id, &features)?;

        let case = risk
            .flagged
            .then(|| Case::for_flagged(&txn.txn_id, risk.decision, risk.score, &txn.timestamp));

        // All three rows land in one store transaction.
        self.store
            .insert_scored_transaction(&txn, &risk, case.as_ref())?;

        // Events strictly after the commit.
        self.bus.publish(Event::Transaction {
            txn_id: txn.txn_id.clone(),
            amount: txn.amount,
            currency: txn.currency.clone(),
            sender_id: txn.sender_id.clone(),
            receiver_id: txn.receiver_id.clone(),
            txn_type: txn.txn_type.as_str().to_string(),
            risk_score: risk.score,
            decision: risk.decision.as_str().to_string(),
            is_fraud_ground_truth: txn.is_fraud_ground_truth,
            fraud_type: txn
                .metadata
                .as_ref()
                .and_then(|m| m.get("fraud_type"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            timestamp: txn.timestamp.clone(),
        });

        if let Some(case) = &case {
            self.bus.publish(Event::CaseCreated {
                case_id: case.case_id.clone(),
                txn_id: txn.txn_id.clone(),
                risk_score: risk.score,
                decision: risk.decision.as_str().to_string(),
                timestamp: txn.timestamp.clone(),
            });
            self.spawn_auto_explain(case, &txn, &risk);
        }

        Ok(ScoredTransaction {
            risk_score: risk.score,
            decision: risk.decision.as_str().to_string(),
            case_id: case.map(|c| c.case_id),
            txn,
        })
    }

    /// Fire-and-forget: the explainer must never sit on the scoring path,
    /// and its failure leaves the case without a cached explanation.
    fn spawn_auto_explain(
        &self,
        case: &Case,
        txn: &Transaction,
        risk: &RiskResult,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let bus = self.bus.clone();
        let llm = self.llm.clone();
        let case_id = case.case_id.clone();
        let txn = txn.clone();
        let risk = risk.clone();

        tokio::spawn(async move {
            match auto_explain(&store, &bus, llm.as_ref(), &case_id, &txn, &risk).await {
                Ok(()) => debug!(case_id = %case_id, "auto-explain completed"),
                Err(e) => warn!(case_id = %case_id, error = %e, "auto-explain failed"),
            }
        })
    }
}

/// Related patterns are the active cards whose member list names the
/// transaction's sender or receiver.
pub fn related_patterns(
    store: &Store,
    sender_id: &str,
    receiver_id: &str,
) -> CoreResult<Vec<PatternSummary>> {
    let cards = store.active_pattern_cards()?;
    Ok(cards
        .into_iter()
        .filter(|card| {
            card.detection_rule
                .member_ids
                .iter()
                .any(|m| m == sender_id || m == receiver_id)
        })
        .map(|card| PatternSummary {
            name: card.name,
            confidence: card.confidence,
            description: card.description,
        })
        .collect())
}

async fn auto_explain(
    store: &Store,
    bus: &EventBus,
    llm: Option<&OllamaClient>,
    case_id: &str,
    txn: &Transaction,
    risk: &RiskResult,
) -> CoreResult<()> {
    let patterns = related_patterns(store, &txn.sender_id, &txn.receiver_id)?;

    let input = ExplainInput {
        txn_id: txn.txn_id.clone(),
        amount: txn.amount,
        currency: txn.currency.clone(),
        sender_id: txn.sender_id.clone(),
        receiver_id: txn.receiver_id.clone(),
        txn_type: txn.txn_type.as_str().to_string(),
        channel: txn.channel.as_str().to_string(),
        metadata: txn.metadata.clone(),
        risk_score: risk.score,
        decision: risk.decision,
        features: risk.features.clone(),
        reasons: risk.reasons.clone(),
        patterns,
        model_version: risk.model_version.clone(),
    };

    let explanation = explain_case(llm, &input).await;
    store.set_case_explanation(case_id, &serde_json::to_string(&explanation)?)?;

    bus.publish(Event::CaseExplained {
        case_id: case_id.to_string(),
        txn_id: txn.txn_id.clone(),
        agent: explanation.agent.clone(),
        summary: explanation.summary.chars().take(200).collect(),
        recommendation: explanation.recommendation.chars().take(200).collect(),
        timestamp: now_ts(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CaseStatus;
    use crate::risk::scorer::CurrentModel;

    fn pipeline() -> (IngestionPipeline, Arc<Store>, EventBus) {
        let store = Arc::new(Store::in_memory().unwrap());
        let bus = EventBus::new();
        let scorer = Arc::new(Scorer::new(Arc::new(CurrentModel::empty())));
        let pipeline = IngestionPipeline::new(store.clone(), scorer, bus.clone(), None);
        (pipeline, store, bus)
    }

    fn request(amount: f64, sender: &str, txn_type: &str, channel: &str) -> TransactionRequest {
        TransactionRequest {
            amount,
            currency: "USD".to_string(),
            sender_id: sender.to_string(),
            receiver_id: "r1".to_string(),
            txn_type: txn_type.to_string(),
            channel: channel.to_string(),
            ip_address: None,
            device_id: None,
            is_fraud_ground_truth: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_large_api_transfer_creates_case_and_events() {
        let (pipeline, store, bus) = pipeline();
        let mut sub = bus.subscribe().unwrap();

        let scored = pipeline
            .ingest(request(45_000.0, "fraud_sender", "transfer", "api"))
            .await
            .unwrap();

        assert!(scored.risk_score >= 0.5);
        assert!(scored.case_id.is_some());

        // Rows are all present.
        assert!(store.get_transaction(&scored.txn.txn_id).unwrap().is_some());
        let cases = store.list_cases(Some(CaseStatus::Open), 10).unwrap();
        assert_eq!(cases.len(), 1);

        // Transaction event then case_created event, in order.
        let first = sub.recv().await.unwrap();
        assert!(matches!(first, Event::Transaction { .. }));
        let second = sub.recv().await.unwrap();
        assert!(matches!(second, Event::CaseCreated { .. }));
    }

    #[tokio::test]
    async fn test_small_payment_approves_without_case() {
        let (pipeline, store, _bus) = pipeline();
        let scored = pipeline
            .ingest(request(20.0, "s1", "payment", "web"))
            .await
            .unwrap();
        assert_eq!(scored.decision, "approve");
        assert!(scored.case_id.is_none());
        assert!(store.list_cases(None, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_persists_nothing() {
        let (pipeline, store, bus) = pipeline();
        let mut sub = bus.subscribe().unwrap();

        let result = pipeline
            .ingest(request(f64::NAN, "s1", "transfer", "web"))
            .await;
        assert!(matches!(result, Err(CoreError::Validation(_))));
        assert_eq!(store.total_transactions().unwrap(), 0);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_velocity_features_accumulate_across_ingests() {
        let (pipeline, store, _bus) = pipeline();

        // Five rapid transfers from the same sender, then a sixth that
        // observes them in its velocity window.
        for _ in 0..5 {
            pipeline
                .ingest(request(45_000.0, "S", "transfer", "api"))
                .await
                .unwrap();
        }
        let sixth = pipeline
            .ingest(request(45_000.0, "S", "transfer", "api"))
            .await
            .unwrap();

        let (_, features_json, _, _) = store
            .get_risk_fields(&sixth.txn.txn_id)
            .unwrap()
            .unwrap();
        let features: crate::models::Features =
            serde_json::from_str(&features_json).unwrap();
        assert!(
            features["sender_txn_count_1h"] >= 5.0 / 20.0,
            "velocity feature was {}",
            features["sender_txn_count_1h"]
        );

        // Flagged transactions created cases along the way.
        assert!(!store.list_cases(None, 50).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_explain_caches_on_case() {
        let (pipeline, store, _bus) = pipeline();
        let scored = pipeline
            .ingest(request(45_000.0, "fraud_sender", "transfer", "api"))
            .await
            .unwrap();
        let case_id = scored.case_id.unwrap();

        // Give the fire-and-forget job a moment; template path is instant.
        for _ in 0..50 {
            if store.get_case_explanation(&case_id).unwrap().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let cached = store.get_case_explanation(&case_id).unwrap().unwrap();
        let explanation: serde_json::Value = serde_json::from_str(&cached).unwrap();
        assert!(explanation["summary"].is_string());
        assert!(explanation["recommendation"].is_string());
    }
}
