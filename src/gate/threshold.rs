use crate::config::RuleThresholds;
use crate::types::{Packet, RuleSeverity};
use super::{rate, reading, Rule, RuleOutcome};

/// The standard rule set, in declaration order.
pub fn standard_rules(t: &RuleThresholds) -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(BatteryCellImbalance {
            max_delta_v: t.cell_delta_v,
            min_current_a: t.imbalance_current_a,
        }),
        Box::new(ThermalStress {
            min_rpm: t.motor_rpm,
            max_inverter_c: t.inverter_temp_c,
            max_rise_c_per_min: t.battery_temp_rise_c_per_min,
        }),
        Box::new(ElectricalStress {
            min_voltage_v: t.pack_voltage_floor_v,
            max_current_a: t.stress_current_a,
        }),
        Box::new(SignalInconsistency {
            max_gps_delta: t.gps_wheel_delta,
            max_variance_ratio: t.wheel_variance_ratio,
        }),
        Box::new(ThermalAging {
            max_cycles: t.thermal_cycle_count,
            max_battery_c: t.aging_battery_temp_c,
        }),
        Box::new(EnvironmentalLoad {
            max_ambient_c: t.ambient_temp_c,
            max_load_kg: t.vehicle_load_kg,
            max_current_a: t.load_current_a,
        }),
    ]
}

/// Cell voltage spread under load.
pub struct BatteryCellImbalance {
    max_delta_v: f64,
    min_current_a: f64,
}

impl Rule for BatteryCellImbalance {
    fn id(&self) -> &'static str { "battery_cell_imbalance" }

    fn severity(&self) -> RuleSeverity { RuleSeverity::Critical }

    fn evaluate(&self, packet: &Packet, _history: &[Packet]) -> RuleOutcome {
        let b = &packet.battery_sensors;
        let (Some(max_v), Some(min_v), Some(current)) = (
            reading(b.battery_cell_max_voltage_v),
            reading(b.battery_cell_min_voltage_v),
            reading(b.battery_pack_current_a),
        ) else {
            return RuleOutcome::Skipped;
        };

        let delta = max_v - min_v;
        if delta > self.max_delta_v && current > self.min_current_a {
            RuleOutcome::Fired(format!(
                "cell voltage spread {:.3} V exceeds {:.3} V at {:.1} A (load threshold {:.1} A)",
                delta, self.max_delta_v, current, self.min_current_a
            ))
        } else {
            RuleOutcome::Clear
        }
    }
}

/// High motor speed with a hot inverter and a battery heating up quickly.
pub struct ThermalStress {
    min_rpm: f64,
    max_inverter_c: f64,
    max_rise_c_per_min: f64,
}

impl Rule for ThermalStress {
    fn id(&self) -> &'static str { "thermal_stress" }

    fn severity(&self) -> RuleSeverity { RuleSeverity::Critical }

    fn evaluate(&self, packet: &Packet, history: &[Packet]) -> RuleOutcome {
        let m = &packet.motor_inverter_sensors;
        let (Some(rpm), Some(inverter_c)) = (reading(m.motor_rpm), reading(m.inverter_temperature_c)) else {
            return RuleOutcome::Skipped;
        };
        let Some(rise) = rate::battery_temp_rise_rate(packet, history) else {
            return RuleOutcome::Skipped;
        };

        if rpm > self.min_rpm && inverter_c > self.max_inverter_c && rise > self.max_rise_c_per_min {
            RuleOutcome::Fired(format!(
                "motor {:.0} rpm with inverter at {:.1} °C and battery rising {:.2} °C/min (limits {:.0} rpm, {:.1} °C, {:.2} °C/min)",
                rpm, inverter_c, rise, self.min_rpm, self.max_inverter_c, self.max_rise_c_per_min
            ))
        } else {
            RuleOutcome::Clear
        }
    }
}

/// Pack voltage sagging while drawing high current.
pub struct ElectricalStress {
    min_voltage_v: f64,
    max_current_a: f64,
}

impl Rule for ElectricalStress {
    fn id(&self) -> &'static str { "electrical_stress" }

    fn severity(&self) -> RuleSeverity { RuleSeverity::Warn }

    fn evaluate(&self, packet: &Packet, _history: &[Packet]) -> RuleOutcome {
        let b = &packet.battery_sensors;
        let (Some(voltage), Some(current)) = (reading(b.battery_pack_voltage_v), reading(b.battery_pack_current_a)) else {
            return RuleOutcome::Skipped;
        };

        if voltage < self.min_voltage_v && current > self.max_current_a {
            RuleOutcome::Fired(format!(
                "pack voltage {:.1} V below {:.1} V while drawing {:.1} A (limit {:.1} A)",
                voltage, self.min_voltage_v, current, self.max_current_a
            ))
        } else {
            RuleOutcome::Clear
        }
    }
}

/// Positional fix disagreeing with wheel speed.
pub struct SignalInconsistency {
    max_gps_delta: f64,
    max_variance_ratio: f64,
}

impl Rule for SignalInconsistency {
    fn id(&self) -> &'static str { "signal_inconsistency" }

    fn severity(&self) -> RuleSeverity { RuleSeverity::Warn }

    fn evaluate(&self, packet: &Packet, _history: &[Packet]) -> RuleOutcome {
        let s = &packet.signal_consistency;
        let (Some(delta), Some(ratio)) = (reading(s.gps_vs_wheel_speed_delta), reading(s.wheel_speed_variance_ratio)) else {
            return RuleOutcome::Skipped;
        };

        if delta > self.max_gps_delta && ratio > self.max_variance_ratio {
            RuleOutcome::Fired(format!(
                "gps/wheel speed delta {:.2} exceeds {:.2} with variance ratio {:.3} (limit {:.3})",
                delta, self.max_gps_delta, ratio, self.max_variance_ratio
            ))
        } else {
            RuleOutcome::Clear
        }
    }
}

/// Many thermal cycles on a warm pack.
pub struct ThermalAging {
    max_cycles: f64,
    max_battery_c: f64,
}

impl Rule for ThermalAging {
    fn id(&self) -> &'static str { "thermal_aging" }

    fn severity(&self) -> RuleSeverity { RuleSeverity::Warn }

    fn evaluate(&self, packet: &Packet, _history: &[Packet]) -> RuleOutcome {
        let (Some(cycles), Some(temp_c)) = (
            reading(packet.component_aging.thermal_cycle_count),
            reading(packet.battery_sensors.battery_temperature_avg_c),
        ) else {
            return RuleOutcome::Skipped;
        };

        if cycles > self.max_cycles && temp_c > self.max_battery_c {
            RuleOutcome::Fired(format!(
                "{:.0} thermal cycles (limit {:.0}) with battery at {:.1} °C (limit {:.1} °C)",
                cycles, self.max_cycles, temp_c, self.max_battery_c
            ))
        } else {
            RuleOutcome::Clear
        }
    }
}

/// Hot weather, heavy load and high current together.
pub struct EnvironmentalLoad {
    max_ambient_c: f64,
    max_load_kg: f64,
    max_current_a: f64,
}

impl Rule for EnvironmentalLoad {
    fn id(&self) -> &'static str { "environmental_load" }

    fn severity(&self) -> RuleSeverity { RuleSeverity::Warn }

    fn evaluate(&self, packet: &Packet, _history: &[Packet]) -> RuleOutcome {
        let (Some(ambient_c), Some(load_kg), Some(current)) = (
            reading(packet.environmental_sensors.ambient_air_temperature_c),
            reading(packet.operational_context.vehicle_load_estimated_kg),
            reading(packet.battery_sensors.battery_pack_current_a),
        ) else {
            return RuleOutcome::Skipped;
        };

        if ambient_c > self.max_ambient_c && load_kg > self.max_load_kg && current > self.max_current_a {
            RuleOutcome::Fired(format!(
                "ambient {:.1} °C, load {:.0} kg and current {:.1} A exceed {:.1} °C / {:.0} kg / {:.1} A",
                ambient_c, load_kg, current, self.max_ambient_c, self.max_load_kg, self.max_current_a
            ))
        } else {
            RuleOutcome::Clear
        }
    }
}
