//! Pattern-derived features for risk scoring.
//!
//! Builds an inverted index over active pattern cards keyed by entity id,
//! then answers per-transaction lookups with seven features. Membership
//! comes from the card's `member_ids`, and the rule type alone decides
//! which feature bit lights up, never the description text.

use std::collections::HashMap;

use crate::models::{PatternCard, PatternFeatures, PatternStatus, RuleType};

const HUB_DEGREE_DENOMINATOR: f64 = 20.0;
const PATTERN_COUNT_CAP: f64 = 5.0;

#[derive(Debug, Clone)]
struct CardRef {
    rule_type: RuleType,
    degree: Option<usize>,
}

/// Inverted index: entity id -> cards whose member list contains it.
#[derive(Debug, Default)]
pub struct PatternFeatureIndex {
    by_entity: HashMap<String, Vec<CardRef>>,
}

impl PatternFeatureIndex {
    pub fn build(cards: &[PatternCard]) -> Self {
        let mut by_entity: HashMap<String, Vec<CardRef>> = HashMap::new();

        for card in cards {
            if card.status != PatternStatus::Active {
                continue;
            }
            let degree = card.detection_rule.degree.or_else(|| {
                card.stats
                    .get("out_degree")
                    .or_else(|| card.stats.get("in_degree"))
                    .and_then(|v| v.as_u64())
                    .map(|v| v as usize)
            });
            for member in &card.detection_rule.member_ids {
                by_entity.entry(member.clone()).or_default().push(CardRef {
                    rule_type: card.detection_rule.rule_type,
                    degree,
                });
            }
        }

        Self { by_entity }
    }

    pub fn is_empty(&self) -> bool {
        self.by_entity.is_empty()
    }

    /// Answer the seven pattern features for one sender/receiver pair.
    pub fn lookup(&self, sender_id: &str, receiver_id: &str) -> PatternFeatures {
        let mut features = PatternFeatures::default();

        if let Some(cards) = self.by_entity.get(sender_id) {
            features.pattern_count_sender =
                (cards.len() as f64 / PATTERN_COUNT_CAP).min(1.0);
            for card in cards {
                match card.rule_type {
                    RuleType::Cycle => features.sender_in_ring = 1.0,
                    RuleType::HubOut | RuleType::HubIn => {
                        let strength = hub_strength(card.degree);
                        features.sender_is_hub = features.sender_is_hub.max(strength);
                    }
                    RuleType::Velocity => features.sender_in_velocity_cluster = 1.0,
                    RuleType::DenseSubgraph => features.sender_in_dense_cluster = 1.0,
                }
            }
        }

        if let Some(cards) = self.by_entity.get(receiver_id) {
            for card in cards {
                match card.rule_type {
                    RuleType::Cycle => features.receiver_in_ring = 1.0,
                    RuleType::HubOut | RuleType::HubIn => {
                        let strength = hub_strength(card.degree);
                        features.receiver_is_hub = features.receiver_is_hub.max(strength);
                    }
                    RuleType::Velocity | RuleType::DenseSubgraph => {}
                }
            }
        }

        features
    }
}

fn hub_strength(degree: Option<usize>) -> f64 {
    (degree.unwrap_or(0) as f64 / HUB_DEGREE_DENOMINATOR).min(1.0)
}
