pub mod config;
pub mod gate;
pub mod window;
pub mod router;
pub mod extract;
pub mod sink;
pub mod ingest;
pub mod pipeline;

/// Common types used across modules
pub mod types {
    use serde::de::DeserializeOwned;
    use serde::{Deserialize, Deserializer, Serialize};
    use smallvec::SmallVec;

    /// One telemetry snapshot for a vehicle
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Packet {
        /// Position in the ingested stream, assigned by the ingestor when absent
        #[serde(default)]
        pub sequence: u64,
        #[serde(default, deserialize_with = "lenient_group")]
        pub vehicle: VehicleInfo,
        #[serde(default, deserialize_with = "lenient_group")]
        pub battery_sensors: BatterySensors,
        #[serde(default, deserialize_with = "lenient_group")]
        pub motor_inverter_sensors: MotorInverterSensors,
        #[serde(default, deserialize_with = "lenient_group")]
        pub rate_of_change: RateOfChange,
        #[serde(default, deserialize_with = "lenient_group")]
        pub signal_consistency: SignalConsistency,
        #[serde(default, deserialize_with = "lenient_group")]
        pub component_aging: ComponentAging,
        #[serde(default, deserialize_with = "lenient_group")]
        pub environmental_sensors: EnvironmentalSensors,
        #[serde(default, deserialize_with = "lenient_group")]
        pub operational_context: OperationalContext,
        /// Measurement groups no rule reads; kept so analysis context is complete
        #[serde(flatten)]
        pub extra: serde_json::Map<String, serde_json::Value>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct VehicleInfo {
        #[serde(default, deserialize_with = "lenient_string")]
        pub vehicle_id: Option<String>,
        #[serde(default, deserialize_with = "lenient_string")]
        pub timestamp_utc: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct BatterySensors {
        #[serde(default, deserialize_with = "lenient_f64")]
        pub battery_cell_max_voltage_v: Option<f64>,
        #[serde(default, deserialize_with = "lenient_f64")]
        pub battery_cell_min_voltage_v: Option<f64>,
        #[serde(default, deserialize_with = "lenient_f64")]
        pub battery_pack_current_a: Option<f64>,
        #[serde(default, deserialize_with = "lenient_f64")]
        pub battery_pack_voltage_v: Option<f64>,
        #[serde(default, deserialize_with = "lenient_f64")]
        pub battery_temperature_avg_c: Option<f64>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct MotorInverterSensors {
        #[serde(default, deserialize_with = "lenient_f64")]
        pub motor_rpm: Option<f64>,
        #[serde(default, deserialize_with = "lenient_f64")]
        pub inverter_temperature_c: Option<f64>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct RateOfChange {
        #[serde(default, deserialize_with = "lenient_f64")]
        pub battery_temp_rise_rate_c_per_min: Option<f64>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct SignalConsistency {
        #[serde(default, deserialize_with = "lenient_f64")]
        pub gps_vs_wheel_speed_delta: Option<f64>,
        #[serde(default, deserialize_with = "lenient_f64")]
        pub wheel_speed_variance_ratio: Option<f64>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ComponentAging {
        #[serde(default, deserialize_with = "lenient_f64")]
        pub thermal_cycle_count: Option<f64>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct EnvironmentalSensors {
        #[serde(default, deserialize_with = "lenient_f64")]
        pub ambient_air_temperature_c: Option<f64>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct OperationalContext {
        #[serde(default, deserialize_with = "lenient_f64")]
        pub vehicle_load_estimated_kg: Option<f64>,
    }

    /// Accepts numbers and numeric strings; anything else becomes `None` so the
    /// rules reading the field are skipped instead of the packet being rejected.
    fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let parsed = match value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        Ok(parsed.filter(|v| v.is_finite()))
    }

    /// A group that is not an object, or does not decode, reads as an empty
    /// group so only the rules depending on it are skipped.
    fn lenient_group<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned + Default,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        if !value.is_object() {
            return Ok(T::default());
        }
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    /// Strings pass through, numbers are rendered, anything else is `None`.
    fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    /// Severity attached to a fired rule
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum RuleSeverity {
        Info,
        Warn,
        Critical,
    }

    impl std::fmt::Display for RuleSeverity {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                RuleSeverity::Info => write!(f, "INFO"),
                RuleSeverity::Warn => write!(f, "WARN"),
                RuleSeverity::Critical => write!(f, "CRITICAL"),
            }
        }
    }

    /// A rule that fired for a packet
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct FiredRule {
        pub rule_id: String,
        pub message: String,
        pub severity: RuleSeverity,
    }

    /// Outcome of running the rule gate over one packet
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct RuleVerdict {
        pub is_anomalous: bool,
        pub fired_rules: SmallVec<[FiredRule; 4]>,
    }

    impl RuleVerdict {
        pub fn from_fired(fired_rules: SmallVec<[FiredRule; 4]>) -> Self {
            Self {
                is_anomalous: !fired_rules.is_empty(),
                fired_rules,
            }
        }

        pub fn rule_ids(&self) -> Vec<&str> {
            self.fired_rules.iter().map(|r| r.rule_id.as_str()).collect()
        }
    }

    impl Packet {
        /// Vehicle identifier carried by the packet, if any
        pub fn vehicle_id(&self) -> Option<&str> {
            self.vehicle
                .vehicle_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn malformed_fields_deserialize_as_missing() {
            let packet: Packet = serde_json::from_value(serde_json::json!({
                "battery_sensors": {
                    "battery_pack_current_a": "130.5",
                    "battery_pack_voltage_v": "n/a",
                    "battery_cell_max_voltage_v": null
                },
                "brake_sensors": { "pad_wear_percent": 72 }
            }))
            .unwrap();

            assert_eq!(packet.battery_sensors.battery_pack_current_a, Some(130.5));
            assert_eq!(packet.battery_sensors.battery_pack_voltage_v, None);
            assert_eq!(packet.battery_sensors.battery_cell_max_voltage_v, None);
            assert!(packet.extra.contains_key("brake_sensors"));
        }

        #[test]
        fn malformed_groups_deserialize_as_empty() {
            let packet: Packet = serde_json::from_value(serde_json::json!({
                "vehicle": { "vehicle_id": 204, "timestamp_utc": ["x"] },
                "battery_sensors": "oops",
                "motor_inverter_sensors": [1, 2],
                "rate_of_change": null,
                "environmental_sensors": { "ambient_air_temperature_c": 41 }
            }))
            .unwrap();

            assert_eq!(packet.vehicle_id(), Some("204"));
            assert_eq!(packet.vehicle.timestamp_utc, None);
            assert_eq!(packet.battery_sensors.battery_pack_voltage_v, None);
            assert_eq!(packet.motor_inverter_sensors.motor_rpm, None);
            assert_eq!(packet.rate_of_change.battery_temp_rise_rate_c_per_min, None);
            assert_eq!(packet.environmental_sensors.ambient_air_temperature_c, Some(41.0));
        }

        #[test]
        fn blank_vehicle_id_is_none() {
            let mut packet = Packet::default();
            packet.vehicle.vehicle_id = Some("  ".into());
            assert_eq!(packet.vehicle_id(), None);
            packet.vehicle.vehicle_id = Some("VH001".into());
            assert_eq!(packet.vehicle_id(), Some("VH001"));
        }
    }
}
