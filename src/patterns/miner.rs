//! Graph mining over recent transactions.
//!
//! Four detectors over a 24h window: wash-trading rings from strongly
//! connected components, hub accounts from HITS scores plus degree
//! z-scores, velocity bursts from a sliding window per sender, and dense
//! subgraphs from SCC density. New cards are deduplicated against active
//! cards by structural signature before any typology renaming, so renames
//! cannot spoof new signatures.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use statrs::statistics::Statistics;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::events::{Event, EventBus};
use crate::models::{
    fmt_ts, parse_ts, DetectionRule, PatternCard, PatternStatus, PatternType, RuleType,
};
use crate::patterns::graph::TxnGraph;
use crate::storage::{Store, TxnLite};

pub const RING_MIN_SIZE: usize = 3;
pub const RING_MAX_SIZE: usize = 20;
/// Active cycle/dense cards larger than this are pruned as false
/// positives. Hub cards are exempt: legitimate hubs have many members.
pub const MEMBER_CAP: usize = 20;

const MAX_CYCLE_LEN: usize = 6;
const TOP_RINGS: usize = 5;
const TOP_HUBS: usize = 3;
const HUB_MIN_DEGREE: usize = 2;
const HITS_MAX_ITER: usize = 100;
const HITS_TOL: f64 = 1e-6;
const VELOCITY_WINDOW_MINUTES: i64 = 60;
const VELOCITY_THRESHOLD: usize = 5;
const TOP_VELOCITY: usize = 5;
const MIN_DENSITY: f64 = 0.5;
const TOP_DENSE: usize = 5;
const RELATED_TXN_CAP: usize = 20;

fn short(id: &str) -> String {
    id.chars().take(12).collect()
}

/// SHA-256 over the sorted member list and the rule type. Rule type is part
/// of the signature so two detectors over identical members stay distinct.
pub fn structural_signature(member_ids: &[String], rule_type: RuleType) -> String {
    let mut sorted: Vec<&str> = member_ids.iter().map(|s| s.as_str()).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for member in &sorted {
        hasher.update(member.as_bytes());
        hasher.update(b"|");
    }
    hasher.update(b":");
    hasher.update(rule_type.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Fraud typology inferred from the structural shape of a pattern.
pub fn fraud_typology(rule_type: RuleType, avg_amount: f64) -> &'static str {
    match rule_type {
        RuleType::Cycle => "wash_trading",
        RuleType::HubOut => {
            if avg_amount < 5_000.0 {
                "structuring"
            } else {
                "fund_distribution"
            }
        }
        RuleType::HubIn => "money_mule",
        RuleType::Velocity => "velocity_abuse",
        RuleType::DenseSubgraph => "coordinated_fraud",
    }
}

fn new_card(
    name: String,
    description: String,
    pattern_type: PatternType,
    confidence: f64,
    rule: DetectionRule,
    stats: serde_json::Map<String, serde_json::Value>,
    related_txn_ids: Vec<String>,
    now: DateTime<Utc>,
) -> PatternCard {
    PatternCard {
        pattern_id: Uuid::new_v4().to_string(),
        name,
        description,
        discovered_at: fmt_ts(now),
        status: PatternStatus::Active,
        pattern_type,
        confidence,
        detection_rule: rule,
        stats,
        related_txn_ids,
    }
}

/// Rings: strongly connected components of size [3, 20], one representative
/// cycle each, ranked by total internal edge weight.
fn detect_rings(graph: &TxnGraph, now: DateTime<Utc>) -> Vec<PatternCard> {
    let mut sccs: Vec<Vec<usize>> = graph
        .strongly_connected_components()
        .into_iter()
        .filter(|scc| (RING_MIN_SIZE..=RING_MAX_SIZE).contains(&scc.len()))
        .collect();

    sccs.sort_by(|a, b| {
        graph
            .subgraph_flow(b)
            .partial_cmp(&graph.subgraph_flow(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cards = Vec::new();
    for scc in sccs.into_iter().take(TOP_RINGS) {
        let bound = MAX_CYCLE_LEN.min(scc.len());
        let Some(cycle) = graph.representative_cycle(&scc, bound) else {
            debug!(scc_size = scc.len(), "no bounded cycle found in component");
            continue;
        };

        let mut txn_ids = Vec::new();
        let mut total_amount = 0.0;
        for i in 0..cycle.len() {
            let src = cycle[i];
            let dst = cycle[(i + 1) % cycle.len()];
            if let Some(edge) = graph.edge(src, dst) {
                total_amount += edge.weight;
                txn_ids.extend(edge.txn_ids.iter().cloned());
            }
        }
        txn_ids.truncate(RELATED_TXN_CAP);

        let mut member_ids: Vec<String> =
            cycle.iter().map(|&n| graph.node_name(n).to_string()).collect();
        let path = member_ids
            .iter()
            .map(|m| short(m))
            .collect::<Vec<_>>()
            .join(" -> ");
        member_ids.sort_unstable();

        let confidence = (0.95 - 0.1 * (cycle.len() as f64 - 3.0)).clamp(0.4, 0.95);

        let mut rule = DetectionRule::new(RuleType::Cycle, member_ids);
        rule.cycle_length = Some(cycle.len());

        let mut stats = serde_json::Map::new();
        stats.insert("members".to_string(), json!(cycle.len()));
        stats.insert(
            "total_amount".to_string(),
            json!((total_amount * 100.0).round() / 100.0),
        );
        stats.insert("txn_count".to_string(), json!(txn_ids.len()));

        cards.push(new_card(
            format!("Circular Flow Ring ({} members)", cycle.len()),
            format!(
                "Circular fund flow detected: {path} -> {}. Total amount: ${total_amount:.2}. \
                 Possible wash trading or layering.",
                short(graph.node_name(cycle[0]))
            ),
            PatternType::Graph,
            confidence,
            rule,
            stats,
            txn_ids,
            now,
        ));
    }
    cards
}

/// Hubs: HITS power iteration plus degree z-scores. An entity is flagged
/// when its degree is at least two and at least two standard deviations
/// above the mean.
fn detect_hubs(graph: &TxnGraph, now: DateTime<Utc>) -> Vec<PatternCard> {
    let n = graph.node_count();
    if n == 0 {
        return Vec::new();
    }
    let (hub_scores, authority_scores) = graph.hits(HITS_MAX_ITER, HITS_TOL);

    let out_degrees: Vec<f64> = (0..n).map(|i| graph.out_degree(i) as f64).collect();
    let in_degrees: Vec<f64> = (0..n).map(|i| graph.in_degree(i) as f64).collect();

    let mut cards = Vec::new();
    cards.extend(hub_cards_for(
        graph,
        &out_degrees,
        &hub_scores,
        RuleType::HubOut,
        now,
    ));
    cards.extend(hub_cards_for(
        graph,
        &in_degrees,
        &authority_scores,
        RuleType::HubIn,
        now,
    ));
    cards
}

fn hub_cards_for(
    graph: &TxnGraph,
    degrees: &[f64],
    scores: &[f64],
    rule_type: RuleType,
    now: DateTime<Utc>,
) -> Vec<PatternCard> {
    let mean = degrees.iter().mean();
    let std = if degrees.len() > 1 {
        degrees.iter().std_dev()
    } else {
        0.0
    };
    let threshold = mean + 2.0 * std;

    let mut flagged: Vec<usize> = (0..degrees.len())
        .filter(|&i| degrees[i] >= threshold && degrees[i] >= HUB_MIN_DEGREE as f64)
        .collect();
    flagged.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cards = Vec::new();
    for &node in flagged.iter().take(TOP_HUBS) {
        let degree = degrees[node] as usize;
        let confidence = (0.4 + 5.0 * scores[node]).min(0.95);

        let (txn_ids, total_amount, counterparties): (Vec<String>, f64, Vec<String>) =
            match rule_type {
                RuleType::HubOut => {
                    let mut ids = Vec::new();
                    let mut total = 0.0;
                    let mut peers = Vec::new();
                    for (dst, edge) in graph.out_edges(node) {
                        ids.extend(edge.txn_ids.iter().cloned());
                        total += edge.weight;
                        peers.push(graph.node_name(dst).to_string());
                    }
                    (ids, total, peers)
                }
                _ => {
                    let mut ids = Vec::new();
                    let mut total = 0.0;
                    let mut peers = Vec::new();
                    for (src, edge) in graph.in_edges(node) {
                        ids.extend(edge.txn_ids.iter().cloned());
                        total += edge.weight;
                        peers.push(graph.node_name(src).to_string());
                    }
                    (ids, total, peers)
                }
            };

        let hub_name = graph.node_name(node).to_string();
        let txn_count = txn_ids.len().max(1);
        let avg_amount = total_amount / txn_count as f64;

        // Hub first, counterparties after: the whole neighborhood is part
        // of the structure.
        let mut member_ids = vec![hub_name.clone()];
        member_ids.extend(counterparties);

        let mut rule = DetectionRule::new(rule_type, member_ids);
        rule.degree = Some(degree);

        let mut stats = serde_json::Map::new();
        let degree_key = if rule_type == RuleType::HubOut {
            "out_degree"
        } else {
            "in_degree"
        };
        stats.insert(degree_key.to_string(), json!(degree));
        stats.insert(
            "total_amount".to_string(),
            json!((total_amount * 100.0).round() / 100.0),
        );
        stats.insert(
            "avg_amount".to_string(),
            json!((avg_amount * 100.0).round() / 100.0),
        );
        stats.insert("hub_score".to_string(), json!(scores[node]));

        let (name, description) = if rule_type == RuleType::HubOut {
            (
                format!("High-Activity Sender: {}", short(&hub_name)),
                format!(
                    "Account {} sent to {degree} unique receivers. Total outflow: \
                     ${total_amount:.2}. Possible structuring or fund distribution.",
                    short(&hub_name)
                ),
            )
        } else {
            (
                format!("High-Activity Receiver: {}", short(&hub_name)),
                format!(
                    "Account {} received from {degree} unique senders. Total inflow: \
                     ${total_amount:.2}. Possible money mule or collection point.",
                    short(&hub_name)
                ),
            )
        };

        let mut ids = txn_ids;
        ids.truncate(RELATED_TXN_CAP);
        cards.push(new_card(
            name,
            description,
            PatternType::Graph,
            confidence,
            rule,
            stats,
            ids,
            now,
        ));
    }
    cards
}

/// Velocity bursts: two-pointer sliding window over each sender's
/// chronologically sorted transactions.
fn detect_velocity_clusters(transactions: &[TxnLite], now: DateTime<Utc>) -> Vec<PatternCard> {
    let mut by_sender: HashMap<&str, Vec<&TxnLite>> = HashMap::new();
    for txn in transactions {
        if !txn.sender_id.is_empty() {
            by_sender.entry(txn.sender_id.as_str()).or_default().push(txn);
        }
    }

    let window = Duration::minutes(VELOCITY_WINDOW_MINUTES);
    let mut cards = Vec::new();

    for (sender, txns) in by_sender {
        if txns.len() < VELOCITY_THRESHOLD {
            continue;
        }

        let mut timed: Vec<(DateTime<Utc>, &TxnLite)> = txns
            .iter()
            .filter_map(|t| match parse_ts(&t.timestamp) {
                Some(ts) => Some((ts, *t)),
                None => {
                    debug!(txn_id = %t.txn_id, "skipping transaction with bad timestamp");
                    None
                }
            })
            .collect();
        timed.sort_by_key(|(ts, _)| *ts);

        // Two pointers: widest window of transactions within the bound.
        let mut max_count = 0usize;
        let mut max_range = (0usize, 0usize);
        let mut left = 0usize;
        for right in 0..timed.len() {
            while timed[right].0 - timed[left].0 > window {
                left += 1;
            }
            let count = right - left + 1;
            if count > max_count {
                max_count = count;
                max_range = (left, right);
            }
        }

        if max_count < VELOCITY_THRESHOLD {
            continue;
        }

        let burst = &timed[max_range.0..=max_range.1];
        let total_amount: f64 = burst.iter().map(|(_, t)| t.amount).sum();
        let avg_amount = total_amount / burst.len() as f64;
        let confidence = (0.3 + 0.05 * max_count as f64).min(0.85);

        let mut rule = DetectionRule::new(RuleType::Velocity, vec![sender.to_string()]);
        rule.window_minutes = Some(VELOCITY_WINDOW_MINUTES);
        rule.threshold = Some(VELOCITY_THRESHOLD);

        let mut stats = serde_json::Map::new();
        stats.insert("txn_count".to_string(), json!(max_count));
        stats.insert(
            "total_amount".to_string(),
            json!((total_amount * 100.0).round() / 100.0),
        );
        stats.insert(
            "avg_amount".to_string(),
            json!((avg_amount * 100.0).round() / 100.0),
        );

        let txn_ids: Vec<String> = burst
            .iter()
            .take(RELATED_TXN_CAP)
            .map(|(_, t)| t.txn_id.clone())
            .collect();

        cards.push(new_card(
            format!("Velocity Spike: {}", short(sender)),
            format!(
                "Account {} made {max_count} transactions inside {VELOCITY_WINDOW_MINUTES} \
                 minutes (avg ${avg_amount:.2} each, total ${total_amount:.2}). High-frequency \
                 activity detected.",
                short(sender)
            ),
            PatternType::Velocity,
            confidence,
            rule,
            stats,
            txn_ids,
            now,
        ));
    }

    cards.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    cards.truncate(TOP_VELOCITY);
    cards
}

/// Dense subgraphs: SCCs of size [3, 20] with directed density >= 0.5,
/// ranked by density * ln(1 + total flow).
fn detect_dense_subgraphs(graph: &TxnGraph, now: DateTime<Utc>) -> Vec<PatternCard> {
    let mut candidates: Vec<(Vec<usize>, f64, f64)> = graph
        .strongly_connected_components()
        .into_iter()
        .filter(|scc| (RING_MIN_SIZE..=RING_MAX_SIZE).contains(&scc.len()))
        .filter_map(|scc| {
            let density = graph.directed_density(&scc);
            if density >= MIN_DENSITY {
                let flow = graph.subgraph_flow(&scc);
                Some((scc, density, flow))
            } else {
                None
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        let rank_a = a.1 * (1.0 + a.2).ln();
        let rank_b = b.1 * (1.0 + b.2).ln();
        rank_b
            .partial_cmp(&rank_a)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cards = Vec::new();
    for (scc, density, flow) in candidates.into_iter().take(TOP_DENSE) {
        let mut member_ids: Vec<String> =
            scc.iter().map(|&n| graph.node_name(n).to_string()).collect();
        member_ids.sort_unstable();
        let sample = member_ids
            .iter()
            .take(8)
            .map(|m| short(m))
            .collect::<Vec<_>>()
            .join(", ");

        let txn_ids = graph.subgraph_txn_ids(&scc, RELATED_TXN_CAP);
        let confidence = density.min(0.95);

        let mut rule = DetectionRule::new(RuleType::DenseSubgraph, member_ids);
        rule.density = Some((density * 10_000.0).round() / 10_000.0);

        let mut stats = serde_json::Map::new();
        stats.insert("members".to_string(), json!(scc.len()));
        stats.insert(
            "density".to_string(),
            json!((density * 10_000.0).round() / 10_000.0),
        );
        stats.insert(
            "total_amount".to_string(),
            json!((flow * 100.0).round() / 100.0),
        );

        cards.push(new_card(
            format!("Dense Cluster ({} accounts)", scc.len()),
            format!(
                "Tightly connected group of {} accounts with density {density:.2}. Members: \
                 {sample}. Total flow: ${flow:.2}. Possible coordinated activity.",
                scc.len()
            ),
            PatternType::Graph,
            confidence,
            rule,
            stats,
            txn_ids,
            now,
        ));
    }
    cards
}

/// Run every detector over the window. A detector that fails is logged and
/// skipped; the others still run.
pub fn mine(transactions: &[TxnLite], now: DateTime<Utc>) -> Vec<PatternCard> {
    if transactions.len() < 3 {
        return Vec::new();
    }

    let graph = TxnGraph::build(transactions);
    let mut cards = Vec::new();

    let detectors: [(&str, Box<dyn Fn() -> Vec<PatternCard> + '_>); 4] = [
        ("rings", Box::new(|| detect_rings(&graph, now))),
        ("hubs", Box::new(|| detect_hubs(&graph, now))),
        (
            "velocity",
            Box::new(|| detect_velocity_clusters(transactions, now)),
        ),
        ("dense", Box::new(|| detect_dense_subgraphs(&graph, now))),
    ];

    for (name, detector) in &detectors {
        match catch_unwind(AssertUnwindSafe(|| detector())) {
            Ok(found) => {
                if !found.is_empty() {
                    debug!(detector = *name, count = found.len(), "detector produced cards");
                }
                cards.extend(found);
            }
            Err(_) => warn!(detector = *name, "detector failed, skipping"),
        }
    }

    cards
}

/// One mining pass: prune oversized stale cards, mine the window, dedup by
/// structural signature, apply typology labels, persist, publish.
pub fn run_mining_job(
    store: &Store,
    bus: &EventBus,
    window: Duration,
    now: DateTime<Utc>,
) -> CoreResult<Vec<PatternCard>> {
    // Pre-step: drop oversized cycle/dense cards accumulated earlier.
    let active = store.active_pattern_cards()?;
    let oversized: Vec<String> = active
        .iter()
        .filter(|card| {
            matches!(
                card.detection_rule.rule_type,
                RuleType::Cycle | RuleType::DenseSubgraph
            ) && card.detection_rule.member_ids.len() > MEMBER_CAP
        })
        .map(|card| card.pattern_id.clone())
        .collect();
    if !oversized.is_empty() {
        let deleted = store.delete_pattern_cards(&oversized)?;
        info!(deleted, "pruned oversized pattern cards");
    }

    let transactions = store.transactions_since(now - window)?;
    let mined = mine(&transactions, now);
    if mined.is_empty() {
        return Ok(Vec::new());
    }

    // Signatures of surviving active cards. Computed before any renaming so
    // typology labels cannot spoof new structures.
    let active = store.active_pattern_cards()?;
    let mut seen: HashSet<String> = active
        .iter()
        .map(|card| {
            structural_signature(
                &card.detection_rule.member_ids,
                card.detection_rule.rule_type,
            )
        })
        .collect();

    let mut persisted = Vec::new();
    for mut card in mined {
        let signature = structural_signature(
            &card.detection_rule.member_ids,
            card.detection_rule.rule_type,
        );
        if !seen.insert(signature) {
            continue;
        }

        // Typology labeling happens after dedup.
        let avg_amount = card
            .stats
            .get("avg_amount")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let typology = fraud_typology(card.detection_rule.rule_type, avg_amount);
        card.stats
            .insert("fraud_type".to_string(), json!(typology));

        store.insert_pattern_card(&card)?;
        bus.publish(Event::Pattern {
            name: card.name.clone(),
            pattern_type: card.pattern_type.as_str().to_string(),
            confidence: card.confidence,
            timestamp: fmt_ts(now),
        });
        persisted.push(card);
    }

    if !persisted.is_empty() {
        info!(count = persisted.len(), "mining pass persisted new patterns");
    }
    Ok(persisted)
}

/// Periodic mining worker. Single task, so two executions never overlap.
pub fn spawn_miner(
    store: Arc<Store>,
    bus: EventBus,
    interval: StdDuration,
    window: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Initial delay so seed data lands first.
        tokio::select! {
            _ = tokio::time::sleep(StdDuration::from_secs(30)) => {}
            _ = shutdown.changed() => return,
        }

        info!(interval_secs = interval.as_secs(), "pattern miner started");
        loop {
            match run_mining_job(&store, &bus, window, Utc::now()) {
                Ok(cards) if !cards.is_empty() => {
                    info!(count = cards.len(), "periodic mining found patterns");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "periodic mining pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("pattern miner stopped");
    })
}
