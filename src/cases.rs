//! Case lifecycle and the analyst feedback loop.
//!
//! Labels drive status transitions (terminal labels close the case) and,
//! once both classes clear the per-class minimum, a debounced background
//! retrain through the shared retrain lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::events::{Event, EventBus};
use crate::ingest::related_patterns;
use crate::llm::OllamaClient;
use crate::models::{
    now_ts, Case, CaseStatus, Label, LabelDecision, LabelRequest,
};
use crate::risk::explainer::{explain_case, ExplainInput};
use crate::risk::registry::ModelRegistry;
use crate::risk::scorer::{CurrentModel, BLOCK_THRESHOLD, REVIEW_THRESHOLD};
use crate::risk::trainer::{retrain_from_labels, TrainOutcome, MIN_SAMPLES_PER_CLASS};
use crate::storage::{Store, SuggestedCase};

/// Minimum spacing between label-driven auto-retrains.
pub const RETRAIN_DEBOUNCE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, serde::Serialize)]
pub struct LabelOutcome {
    pub label_id: String,
    pub case_id: String,
    pub new_status: CaseStatus,
}

pub struct CaseService {
    store: Arc<Store>,
    registry: Arc<ModelRegistry>,
    current: Arc<CurrentModel>,
    bus: EventBus,
    llm: Option<OllamaClient>,
    retrain_lock: Arc<tokio::sync::Mutex<()>>,
    last_auto_retrain: Mutex<Option<Instant>>,
}

impl CaseService {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ModelRegistry>,
        current: Arc<CurrentModel>,
        bus: EventBus,
        llm: Option<OllamaClient>,
        retrain_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            store,
            registry,
            current,
            bus,
            llm,
            retrain_lock,
            last_auto_retrain: Mutex::new(None),
        }
    }

    pub fn list(&self, status: Option<CaseStatus>, limit: usize) -> CoreResult<Vec<Case>> {
        self.store.list_cases(status, limit)
    }

    /// Active-learning work queue: open cases closest to the decision
    /// boundary first.
    pub fn suggested(&self, limit: usize) -> CoreResult<Vec<SuggestedCase>> {
        self.store.suggested_cases(limit)
    }

    /// Apply an analyst label. Missing cases 404; closed cases admit no
    /// further labels. Terminal labels close the case and may trigger the
    /// debounced retrain.
    pub async fn label(
        self: &Arc<Self>,
        case_id: &str,
        request: LabelRequest,
    ) -> CoreResult<LabelOutcome> {
        let decision = LabelDecision::parse(&request.decision).ok_or_else(|| {
            CoreError::Validation(format!("unknown label decision: {}", request.decision))
        })?;

        let case = self
            .store
            .get_case(case_id)?
            .ok_or_else(|| CoreError::NotFound("case".to_string()))?;
        if case.status == CaseStatus::Closed {
            return Err(CoreError::CaseClosed);
        }

        let new_status = if decision.is_terminal() {
            CaseStatus::Closed
        } else {
            CaseStatus::InReview
        };

        let label = Label {
            label_id: Uuid::new_v4().to_string(),
            case_id: case_id.to_string(),
            txn_id: case.txn_id.clone(),
            decision,
            confidence: request.confidence,
            labeled_at: now_ts(),
            labeled_by: request.labeled_by,
            fraud_type: request.fraud_type,
            notes: request.notes,
        };
        self.store.apply_label(&label, new_status)?;

        self.bus.publish(Event::CaseLabeled {
            case_id: case_id.to_string(),
            txn_id: case.txn_id.clone(),
            decision: decision.as_str().to_string(),
            new_status: new_status.as_str().to_string(),
            timestamp: label.labeled_at.clone(),
        });

        if decision.is_terminal() {
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(e) = service.run_auto_retrain_check().await {
                    warn!(error = %e, "label-triggered retrain check failed");
                }
            });
        }

        Ok(LabelOutcome {
            label_id: label.label_id,
            case_id: case_id.to_string(),
            new_status,
        })
    }

    /// Debounced label-driven retrain: at least a minute since the last
    /// auto-retrain and both classes past the per-class minimum.
    pub async fn run_auto_retrain_check(&self) -> CoreResult<()> {
        {
            let last = self.last_auto_retrain.lock();
            if let Some(at) = *last {
                if at.elapsed() < RETRAIN_DEBOUNCE {
                    debug!("auto-retrain debounced (< 60s since last)");
                    return Ok(());
                }
            }
        }

        let (fraud, legit) = self.store.label_class_counts()?;
        if (fraud as usize) < MIN_SAMPLES_PER_CLASS || (legit as usize) < MIN_SAMPLES_PER_CLASS {
            debug!(fraud, legit, "auto-retrain skipped: class minimum not met");
            return Ok(());
        }

        let outcome = {
            let _guard = self.retrain_lock.lock().await;
            retrain_from_labels(&self.store, &self.registry, &self.current, &self.bus, true)?
        };

        match outcome {
            TrainOutcome::Trained { version, .. } => {
                *self.last_auto_retrain.lock() = Some(Instant::now());
                info!(version = %version, "auto-retrain completed after label threshold reached");
            }
            TrainOutcome::Refused { error } => {
                debug!(error = %error, "auto-retrain refused by trainer");
            }
        }
        Ok(())
    }

    /// Cached explanation if the background job finished; otherwise an
    /// on-demand generation with the template fallback.
    pub async fn get_explanation(&self, case_id: &str) -> CoreResult<serde_json::Value> {
        let case = self
            .store
            .get_case(case_id)?
            .ok_or_else(|| CoreError::NotFound("case".to_string()))?;

        if let Some(cached) = self.store.get_case_explanation(case_id)? {
            if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&cached) {
                return Ok(json!({
                    "case_id": case_id,
                    "txn_id": case.txn_id,
                    "explanation": parsed,
                }));
            }
        }

        let txn = self
            .store
            .get_transaction(&case.txn_id)?
            .ok_or_else(|| CoreError::NotFound("transaction".to_string()))?;

        let (risk_score, features, reasons, model_version) =
            match self.store.get_risk_fields(&case.txn_id)? {
                Some((score, features_json, reasons_json, version)) => (
                    score,
                    serde_json::from_str(&features_json).unwrap_or_default(),
                    serde_json::from_str(&reasons_json).unwrap_or_default(),
                    version,
                ),
                None => (case.risk_score, Default::default(), Vec::new(), "missing".to_string()),
            };

        let decision = if risk_score >= BLOCK_THRESHOLD {
            crate::models::Decision::Block
        } else if risk_score >= REVIEW_THRESHOLD {
            crate::models::Decision::Review
        } else {
            crate::models::Decision::Approve
        };

        let patterns = related_patterns(&self.store, &txn.sender_id, &txn.receiver_id)?;
        let input = ExplainInput {
            txn_id: txn.txn_id.clone(),
            amount: txn.amount,
            currency: txn.currency.clone(),
            sender_id: txn.sender_id.clone(),
            receiver_id: txn.receiver_id.clone(),
            txn_type: txn.txn_type.as_str().to_string(),
            channel: txn.channel.as_str().to_string(),
            metadata: txn.metadata.clone(),
            risk_score,
            decision,
            features,
            reasons,
            patterns,
            model_version,
        };
        let explanation = explain_case(self.llm.as_ref(), &input).await;

        Ok(json!({
            "case_id": case_id,
            "txn_id": case.txn_id,
            "explanation": serde_json::to_value(&explanation)?,
        }))
    }
}
