//! Packet source: a JSON array or newline-delimited JSON file.

use std::path::Path;

use anyhow::{Context, Result};

use crate::types::Packet;

/// Load packets from `path`, assigning stream positions to any that lack one.
pub async fn load_packets(path: impl AsRef<Path>) -> Result<Vec<Packet>> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read packet file: {}", path.display()))?;

    let packets = parse_packets(&content)
        .with_context(|| format!("Failed to parse packet file: {}", path.display()))?;

    tracing::info!(path = %path.display(), packets = packets.len(), "Loaded telemetry packets");
    Ok(packets)
}

/// Parse a JSON array, or one JSON object per line. Blank lines are skipped.
pub fn parse_packets(content: &str) -> Result<Vec<Packet>> {
    let trimmed = content.trim_start();

    let mut packets: Vec<Packet> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("Invalid JSON array")?
    } else {
        trimmed
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).with_context(|| format!("Invalid packet on line {}", n + 1))
            })
            .collect::<Result<_>>()?
    };

    for (i, packet) in packets.iter_mut().enumerate() {
        if packet.sequence == 0 {
            packet.sequence = i as u64 + 1;
        }
    }

    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_array_and_assigns_sequence() {
        let packets = parse_packets(
            r#"[
                {"vehicle": {"vehicle_id": "VH001"}, "battery_sensors": {"battery_pack_current_a": 130}},
                {"sequence": 42, "vehicle": {"vehicle_id": "VH001"}}
            ]"#,
        )
        .unwrap();

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].sequence, 1);
        assert_eq!(packets[1].sequence, 42);
        assert_eq!(packets[0].battery_sensors.battery_pack_current_a, Some(130.0));
    }

    #[test]
    fn parses_ndjson_skipping_blank_lines() {
        let packets = parse_packets("{\"vehicle\":{\"vehicle_id\":\"A\"}}\n\n{\"vehicle\":{\"vehicle_id\":\"B\"}}\n").unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].vehicle_id(), Some("B"));
        assert_eq!(packets[1].sequence, 2);
    }

    #[test]
    fn malformed_group_does_not_drop_the_packet() {
        let packets = parse_packets(
            "{\"vehicle\":{\"vehicle_id\":\"VH001\"},\"battery_sensors\":\"oops\"}\n\
             {\"vehicle\":{\"vehicle_id\":\"VH001\"},\"battery_sensors\":{\"battery_pack_current_a\":131}}\n",
        )
        .unwrap();

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].vehicle_id(), Some("VH001"));
        assert_eq!(packets[0].battery_sensors.battery_pack_current_a, None);
        assert_eq!(packets[1].battery_sensors.battery_pack_current_a, Some(131.0));
    }

    #[test]
    fn bad_line_is_reported_with_its_number() {
        let err = parse_packets("{}\nnot json\n").unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[tokio::test]
    async fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[{{\"vehicle\": {{\"vehicle_id\": \"VH009\"}}}}]").unwrap();

        let packets = load_packets(file.path()).await.unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].vehicle_id(), Some("VH009"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        assert!(load_packets("/nonexistent/packets.json").await.is_err());
    }
}
