//! Edge decay and reinforcement
//!
//! Pure functions over edge state. Nothing here touches the store; callers
//! persist whatever they decide to keep.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::DecayConfig;
use crate::node::Edge;

/// `1 + boost * ln(reinforcements + 1)`
pub fn stability(reinforcement_count: u32, boost: f64) -> f64 {
    1.0 + boost.max(0.0) * (reinforcement_count as f64 + 1.0).ln()
}

/// Whole days between two instants, regardless of order
pub fn days_elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_days().abs()
}

/// Decayed weight of `edge` at `now`, always within `[0, base_weight]`
pub fn current_weight(edge: &Edge, now: DateTime<Utc>, config: &DecayConfig) -> f64 {
    let days = days_elapsed(edge.last_reinforced, now) as f64;
    let stability = edge.stability.max(1.0);
    let weight = edge.base_weight * (-config.decay_rate * days / stability).exp();
    if weight.is_finite() {
        weight.clamp(0.0, edge.base_weight.max(0.0))
    } else {
        0.0
    }
}

/// True if the edge has decayed below the visibility threshold
pub fn is_dormant(edge: &Edge, now: DateTime<Utc>, config: &DecayConfig) -> bool {
    current_weight(edge, now, config) < config.visibility_threshold
}

/// Apply one reinforcement event: bumps the count, recomputes stability and
/// restores full base weight.
///
/// `last_reinforced` never moves backwards, so a backdated source still
/// resets the weight without rewinding the clock.
pub fn reinforce(edge: &mut Edge, evidence: Option<&str>, now: DateTime<Utc>, config: &DecayConfig) {
    edge.reinforcement_count += 1;
    edge.stability = stability(edge.reinforcement_count, config.stability_boost);
    edge.last_reinforced = edge.last_reinforced.max(now);
    edge.weight = edge.base_weight;
    if let Some(evidence) = evidence {
        edge.push_evidence(evidence);
    }
}

/// Outcome of recomputing one edge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeDecay {
    pub previous: f64,
    pub current: f64,
    pub dormant: bool,
}

impl EdgeDecay {
    pub fn decreased(&self) -> bool {
        self.current < self.previous
    }
}

/// Recompute `edge.weight` in place
pub fn refresh(edge: &mut Edge, now: DateTime<Utc>, config: &DecayConfig) -> EdgeDecay {
    let previous = edge.weight;
    let current = current_weight(edge, now, config);
    edge.weight = current;
    EdgeDecay {
        previous,
        current,
        dormant: current < config.visibility_threshold,
    }
}

/// Aggregate result of a sweep over all edges
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecayReport {
    pub edges_scanned: usize,
    pub decayed: usize,
    pub dormant: usize,
}

impl DecayReport {
    pub fn record(&mut self, outcome: &EdgeDecay) {
        self.edges_scanned += 1;
        if outcome.decreased() {
            self.decayed += 1;
        }
        if outcome.dormant {
            self.dormant += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::EdgeType;
    use chrono::Duration;

    fn edge_at(last: DateTime<Utc>) -> Edge {
        Edge::new("n_a", "n_b", EdgeType::CoOccurrence, last)
    }

    #[test]
    fn test_stability_grows_logarithmically() {
        assert_eq!(stability(0, 0.5), 1.0);
        let s1 = stability(1, 0.5);
        let s10 = stability(10, 0.5);
        let s100 = stability(100, 0.5);
        assert!(s1 > 1.0 && s10 > s1 && s100 > s10);
        assert!(s100 - s10 < s10 - s1 + 1.0);
    }

    #[test]
    fn test_zero_elapsed_is_base_weight() {
        let now = Utc::now();
        let edge = edge_at(now);
        let config = DecayConfig::default();
        assert_eq!(current_weight(&edge, now, &config), edge.base_weight);
    }

    #[test]
    fn test_decay_is_monotone_in_elapsed_days() {
        let now = Utc::now();
        let edge = edge_at(now);
        let config = DecayConfig::default();
        let mut previous = f64::MAX;
        for days in 0..400 {
            let w = current_weight(&edge, now + Duration::days(days), &config);
            assert!(w <= previous, "weight rose at day {}", days);
            assert!(w >= 0.0 && w <= edge.base_weight);
            previous = w;
        }
    }

    #[test]
    fn test_elapsed_is_direction_agnostic() {
        let now = Utc::now();
        assert_eq!(days_elapsed(now, now + Duration::days(3)), 3);
        assert_eq!(days_elapsed(now + Duration::days(3), now), 3);
        assert_eq!(days_elapsed(now, now + Duration::hours(23)), 0);
    }

    #[test]
    fn test_stability_slows_decay() {
        let now = Utc::now();
        let config = DecayConfig::default();
        let fresh = edge_at(now);
        let mut sturdy = edge_at(now);
        for _ in 0..20 {
            reinforce(&mut sturdy, None, now, &config);
        }
        let later = now + Duration::days(60);
        assert!(current_weight(&sturdy, later, &config) > current_weight(&fresh, later, &config));
    }

    #[test]
    fn test_extreme_values_stay_bounded() {
        let now = Utc::now();
        let edge = edge_at(now - Duration::days(1_000_000));
        let config = DecayConfig {
            decay_rate: 1e9,
            ..Default::default()
        };
        let w = current_weight(&edge, now, &config);
        assert!(w >= 0.0 && w <= edge.base_weight);
    }

    #[test]
    fn test_reinforce_restores_base_weight() {
        let config = DecayConfig::default();
        let start = Utc::now() - Duration::days(90);
        let mut edge = edge_at(start);
        let outcome = refresh(&mut edge, Utc::now(), &config);
        assert!(outcome.decreased());
        assert!(edge.weight < edge.base_weight);

        reinforce(&mut edge, Some("seen again"), Utc::now(), &config);
        assert_eq!(edge.weight, edge.base_weight);
        assert_eq!(edge.reinforcement_count, 1);
        assert_eq!(edge.evidence.len(), 1);
    }

    #[test]
    fn test_backdated_reinforcement_keeps_latest_timestamp() {
        let config = DecayConfig::default();
        let latest = Utc::now();
        let mut edge = edge_at(latest);

        reinforce(&mut edge, None, latest - Duration::days(30), &config);

        assert_eq!(edge.weight, edge.base_weight);
        assert_eq!(edge.last_reinforced, latest);
        assert_eq!(edge.reinforcement_count, 1);
        assert_eq!(current_weight(&edge, latest, &config), edge.base_weight);
    }

    #[test]
    fn test_report_counts_dormant() {
        let config = DecayConfig::default();
        let now = Utc::now();
        let mut report = DecayReport::default();

        let mut stale = edge_at(now - Duration::days(365));
        report.record(&refresh(&mut stale, now, &config));
        let mut fresh = edge_at(now);
        report.record(&refresh(&mut fresh, now, &config));

        assert_eq!(report.edges_scanned, 2);
        assert_eq!(report.decayed, 1);
        assert_eq!(report.dormant, 1);
    }
}
