use chrono::DateTime;

use crate::types::Packet;
use super::reading;

/// Battery temperature rise in °C per minute.
///
/// Uses the packet's own `rate_of_change` reading when present, otherwise the
/// least-squares slope of average battery temperature over the history plus
/// the packet. Time comes from `timestamp_utc` when every point has one and
/// from the sequence index (one packet per second) otherwise. Walking back
/// from the packet, history points that are not strictly earlier than the
/// last kept point are dropped, so a replay restart or out-of-order packet
/// never contributes a backwards step.
pub fn battery_temp_rise_rate(packet: &Packet, history: &[Packet]) -> Option<f64> {
    if let Some(rate) = reading(packet.rate_of_change.battery_temp_rise_rate_c_per_min) {
        return Some(rate);
    }

    let points: Vec<&Packet> = history
        .iter()
        .chain(std::iter::once(packet))
        .filter(|p| reading(p.battery_sensors.battery_temperature_avg_c).is_some())
        .collect();
    if points.len() < 2 {
        return None;
    }

    let xs = minutes_axis(&points);
    let mut series: Vec<(f64, f64)> = Vec::with_capacity(points.len());
    for (x, p) in xs.iter().zip(&points).rev() {
        if series.last().is_some_and(|&(later, _)| *x >= later) {
            continue;
        }
        if let Some(y) = reading(p.battery_sensors.battery_temperature_avg_c) {
            series.push((*x, y));
        }
    }

    let slope = slope(&series)?;
    slope.is_finite().then_some(slope)
}

fn minutes_axis(points: &[&Packet]) -> Vec<f64> {
    let stamps: Option<Vec<i64>> = points
        .iter()
        .map(|p| {
            let raw = p.vehicle.timestamp_utc.as_deref()?;
            Some(DateTime::parse_from_rfc3339(raw).ok()?.timestamp_millis())
        })
        .collect();

    // offsets from the first point keep the axis exact before the f64 cast
    match stamps {
        Some(ms) => {
            let origin = ms.first().copied().unwrap_or_default();
            ms.iter().map(|m| (m - origin) as f64 / 60_000.0).collect()
        }
        None => {
            let origin = points.first().map_or(0, |p| p.sequence) as i128;
            points
                .iter()
                .map(|p| (p.sequence as i128 - origin) as f64 / 60.0)
                .collect()
        }
    }
}

/// Least-squares slope of y over x, with x centered on its mean.
fn slope(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 { return None; }
    let n = points.len() as f64;

    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (x, y) in points {
        let dx = x - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }
    if sxx < 1e-12 { return None; }

    Some(sxy / sxx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(sequence: u64, temp_c: f64, timestamp: Option<&str>) -> Packet {
        let mut p = Packet::default();
        p.sequence = sequence;
        p.battery_sensors.battery_temperature_avg_c = Some(temp_c);
        p.vehicle.timestamp_utc = timestamp.map(String::from);
        p
    }

    #[test]
    fn reported_rate_wins() {
        let mut p = at(5, 30.0, None);
        p.rate_of_change.battery_temp_rise_rate_c_per_min = Some(0.9);
        let history = vec![at(0, 10.0, None)];
        assert_eq!(battery_temp_rise_rate(&p, &history), Some(0.9));
    }

    #[test]
    fn derived_from_sequence_index() {
        // 1 °C over 60 packets at one packet per second
        let history = vec![at(0, 30.0, None), at(30, 30.5, None)];
        let rate = battery_temp_rise_rate(&at(60, 31.0, None), &history).unwrap();
        assert!((rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn derived_from_timestamps() {
        let history = vec![at(0, 30.0, Some("2024-01-15T10:00:00Z"))];
        let p = at(1, 32.0, Some("2024-01-15T10:04:00Z"));
        let rate = battery_temp_rise_rate(&p, &history).unwrap();
        assert!((rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn one_second_spacing_at_current_dates() {
        // 0.01 °C per second is 0.6 °C per minute
        let points: Vec<Packet> = (0..11)
            .map(|i| {
                let ts = format!("2024-05-01T12:00:{:02}Z", i);
                at(i + 1, 30.0 + 0.01 * i as f64, Some(ts.as_str()))
            })
            .collect();
        let (packet, history) = points.split_last().unwrap();
        let rate = battery_temp_rise_rate(packet, history).unwrap();
        assert!((rate - 0.6).abs() < 1e-6, "rate was {}", rate);
    }

    #[test]
    fn replay_restart_ignores_later_history() {
        let history = vec![at(9, 40.0, None), at(10, 39.0, None)];
        assert_eq!(battery_temp_rise_rate(&at(1, 38.0, None), &history), None);
    }

    #[test]
    fn out_of_order_point_is_dropped() {
        // seq 50 arrived between seq 0 and seq 30
        let history = vec![at(0, 30.0, None), at(50, 90.0, None), at(30, 30.5, None)];
        let rate = battery_temp_rise_rate(&at(60, 31.0, None), &history).unwrap();
        assert!((rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn single_point_is_unknown() {
        assert_eq!(battery_temp_rise_rate(&at(0, 30.0, None), &[]), None);
    }

    #[test]
    fn identical_instants_are_unknown() {
        let history = vec![at(3, 30.0, None)];
        assert_eq!(battery_temp_rise_rate(&at(3, 31.0, None), &history), None);
    }
}
