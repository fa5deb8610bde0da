//! Deterministic rule gate: packet in, ordered list of fired rules out.

pub mod threshold;
pub mod rate;

use smallvec::SmallVec;

use crate::config::RuleThresholds;
use crate::types::{FiredRule, Packet, RuleSeverity, RuleVerdict};

/// Result of evaluating one rule against one packet.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Fired(String),
    Clear,
    /// A field the rule needs is missing or malformed
    Skipped,
}

/// Trait for threshold rules.
///
/// Rules are pure: the same packet and history always produce the same
/// outcome, and evaluation never panics.
pub trait Rule: Send + Sync {
    /// Stable identifier reported in verdicts
    fn id(&self) -> &'static str;

    fn severity(&self) -> RuleSeverity;

    /// Evaluate against a packet and its trailing history (oldest first,
    /// not including the packet itself)
    fn evaluate(&self, packet: &Packet, history: &[Packet]) -> RuleOutcome;
}

/// Evaluates a fixed, ordered rule set.
pub struct RuleGate {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleGate {
    /// Build the standard rule set in declaration order
    pub fn new(thresholds: &RuleThresholds) -> Self {
        Self::with_rules(threshold::standard_rules(thresholds))
    }

    pub fn with_rules(rules: Vec<Box<dyn Rule>>) -> Self {
        tracing::info!(count = rules.len(), "Initialized rule gate");
        Self { rules }
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    /// Fired rules are reported in declaration order regardless of severity.
    pub fn evaluate(&self, packet: &Packet, history: &[Packet]) -> RuleVerdict {
        let mut fired: SmallVec<[FiredRule; 4]> = SmallVec::new();

        for rule in &self.rules {
            match rule.evaluate(packet, history) {
                RuleOutcome::Fired(message) => fired.push(FiredRule {
                    rule_id: rule.id().to_string(),
                    message,
                    severity: rule.severity(),
                }),
                RuleOutcome::Clear => {}
                RuleOutcome::Skipped => {
                    tracing::trace!(rule = rule.id(), sequence = packet.sequence, "Rule skipped");
                }
            }
        }

        RuleVerdict::from_fired(fired)
    }
}

/// Treat non-finite readings as absent.
pub(crate) fn reading(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anomalous_packet() -> Packet {
        let mut p = Packet::default();
        // battery_cell_imbalance
        p.battery_sensors.battery_cell_max_voltage_v = Some(4.10);
        p.battery_sensors.battery_cell_min_voltage_v = Some(4.00);
        p.battery_sensors.battery_pack_current_a = Some(130.0);
        // electrical_stress
        p.battery_sensors.battery_pack_voltage_v = Some(360.0);
        // thermal_aging
        p.component_aging.thermal_cycle_count = Some(1000.0);
        p.battery_sensors.battery_temperature_avg_c = Some(35.0);
        p
    }

    #[test]
    fn fired_rules_follow_declaration_order() {
        let gate = RuleGate::new(&RuleThresholds::default());
        let verdict = gate.evaluate(&anomalous_packet(), &[]);

        assert!(verdict.is_anomalous);
        assert_eq!(
            verdict.rule_ids(),
            vec!["battery_cell_imbalance", "electrical_stress", "thermal_aging"]
        );
        assert_eq!(verdict.fired_rules[0].severity, RuleSeverity::Critical);
        assert_eq!(verdict.fired_rules[1].severity, RuleSeverity::Warn);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let gate = RuleGate::new(&RuleThresholds::default());
        let packet = anomalous_packet();
        let first = gate.evaluate(&packet, &[]);
        for _ in 0..10 {
            assert_eq!(gate.evaluate(&packet, &[]), first);
        }
    }

    #[test]
    fn empty_packet_is_healthy() {
        let gate = RuleGate::new(&RuleThresholds::default());
        let verdict = gate.evaluate(&Packet::default(), &[]);
        assert!(!verdict.is_anomalous);
        assert!(verdict.fired_rules.is_empty());
    }

    #[test]
    fn nan_readings_skip_the_rule() {
        let gate = RuleGate::new(&RuleThresholds::default());
        let mut packet = anomalous_packet();
        packet.battery_sensors.battery_pack_current_a = Some(f64::NAN);
        let verdict = gate.evaluate(&packet, &[]);
        assert_eq!(verdict.rule_ids(), vec!["thermal_aging"]);
    }

    #[test]
    fn standard_rule_set_order() {
        let gate = RuleGate::new(&RuleThresholds::default());
        assert_eq!(
            gate.rule_ids(),
            vec![
                "battery_cell_imbalance",
                "thermal_stress",
                "electrical_stress",
                "signal_inconsistency",
                "thermal_aging",
                "environmental_load",
            ]
        );
    }
}
