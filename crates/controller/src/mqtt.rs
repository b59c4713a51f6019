//! MQTT topic and payload shapes.
//!
//! Inbound: `<namespace>/<device>/<zone>/set` with an exact `ON`/`OFF`
//! payload — anything else is a no-op, deliberately: a lenient parser would
//! turn a typo in an automation rule into an unattended valve opening.
//! Outbound: one flat JSON status object on `<namespace>/<device>/state`.

use serde_json::{Map, Value};

use crate::overrides::ZoneCommand;

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Subscription filter for this device's zone commands.
pub(crate) fn command_topic_filter(namespace: &str, device: &str) -> String {
    format!("{namespace}/{device}/+/set")
}

pub(crate) fn state_topic(namespace: &str, device: &str) -> String {
    format!("{namespace}/{device}/state")
}

/// Extract the zone name from "<namespace>/<device>/<zone>/set".
pub(crate) fn extract_zone<'a>(topic: &'a str, namespace: &str, device: &str) -> Option<&'a str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 4 && parts[0] == namespace && parts[1] == device && parts[3] == "set" {
        Some(parts[2])
    } else {
        None
    }
}

/// Parse a command payload. Exact, case-sensitive match; anything else is
/// ignored by the caller.
pub(crate) fn parse_zone_command(payload: &[u8]) -> Option<ZoneCommand> {
    match payload {
        b"ON" => Some(ZoneCommand::On),
        b"OFF" => Some(ZoneCommand::Off),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Everything one publish says about the installation. Optional fields are
/// omitted from the JSON entirely when the matching hardware is not
/// configured.
#[derive(Debug, Clone)]
pub(crate) struct StatusSnapshot {
    pub(crate) rain: bool,
    pub(crate) low_water: bool,
    pub(crate) high_water: bool,
    pub(crate) storage_l: Option<i64>,
    pub(crate) flow_lpm: Option<i64>,
    pub(crate) input_water_on: Option<bool>,
    /// Zone name -> logical state, in configuration order.
    pub(crate) zones: Vec<(String, bool)>,
}

fn yes_no(v: bool) -> Value {
    Value::from(if v { "Yes" } else { "No" })
}

fn on_off(v: bool) -> Value {
    Value::from(if v { "ON" } else { "OFF" })
}

impl StatusSnapshot {
    pub(crate) fn to_payload(&self) -> Vec<u8> {
        let mut doc = Map::new();
        doc.insert("rain_state".into(), yes_no(self.rain));
        doc.insert("low_water_state".into(), yes_no(self.low_water));
        doc.insert("high_water_state".into(), yes_no(self.high_water));
        if let Some(volume) = self.storage_l {
            doc.insert("storage_state".into(), Value::from(volume));
        }
        if let Some(flow) = self.flow_lpm {
            doc.insert("flow_state".into(), Value::from(flow));
        }
        if let Some(on) = self.input_water_on {
            doc.insert("input_water_state".into(), on_off(on));
        }
        for (zone, on) in &self.zones {
            doc.insert(format!("{zone}_state"), on_off(*on));
        }
        Value::Object(doc).to_string().into_bytes()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- extract_zone -------------------------------------------------------

    #[test]
    fn extract_zone_valid_topic() {
        assert_eq!(
            extract_zone("watering/garden/zone1/set", "watering", "garden"),
            Some("zone1")
        );
    }

    #[test]
    fn extract_zone_wrong_namespace() {
        assert_eq!(
            extract_zone("other/garden/zone1/set", "watering", "garden"),
            None
        );
    }

    #[test]
    fn extract_zone_wrong_device() {
        assert_eq!(
            extract_zone("watering/balcony/zone1/set", "watering", "garden"),
            None
        );
    }

    #[test]
    fn extract_zone_wrong_suffix() {
        assert_eq!(
            extract_zone("watering/garden/zone1/get", "watering", "garden"),
            None
        );
    }

    #[test]
    fn extract_zone_too_few_segments() {
        assert_eq!(extract_zone("watering/garden/set", "watering", "garden"), None);
    }

    #[test]
    fn extract_zone_empty_topic() {
        assert_eq!(extract_zone("", "watering", "garden"), None);
    }

    // -- parse_zone_command -------------------------------------------------

    #[test]
    fn parse_on() {
        assert_eq!(parse_zone_command(b"ON"), Some(ZoneCommand::On));
    }

    #[test]
    fn parse_off() {
        assert_eq!(parse_zone_command(b"OFF"), Some(ZoneCommand::Off));
    }

    #[test]
    fn parse_is_case_sensitive() {
        assert_eq!(parse_zone_command(b"on"), None);
        assert_eq!(parse_zone_command(b"Off"), None);
    }

    #[test]
    fn parse_rejects_whitespace_and_garbage() {
        assert_eq!(parse_zone_command(b" ON"), None);
        assert_eq!(parse_zone_command(b"ON\n"), None);
        assert_eq!(parse_zone_command(b"TOGGLE"), None);
        assert_eq!(parse_zone_command(b""), None);
    }

    // -- Topic builders -----------------------------------------------------

    #[test]
    fn topics_are_namespaced_per_device() {
        assert_eq!(
            command_topic_filter("watering", "garden"),
            "watering/garden/+/set"
        );
        assert_eq!(state_topic("watering", "garden"), "watering/garden/state");
    }

    // -- StatusSnapshot -----------------------------------------------------

    fn full_snapshot() -> StatusSnapshot {
        StatusSnapshot {
            rain: false,
            low_water: true,
            high_water: false,
            storage_l: Some(456),
            flow_lpm: Some(-3),
            input_water_on: Some(true),
            zones: vec![("zone1".to_string(), true), ("zone2".to_string(), false)],
        }
    }

    #[test]
    fn snapshot_serializes_all_fields() {
        let json: Value = serde_json::from_slice(&full_snapshot().to_payload()).unwrap();
        assert_eq!(json["rain_state"], "No");
        assert_eq!(json["low_water_state"], "Yes");
        assert_eq!(json["high_water_state"], "No");
        assert_eq!(json["storage_state"], 456);
        assert_eq!(json["flow_state"], -3);
        assert_eq!(json["input_water_state"], "ON");
        assert_eq!(json["zone1_state"], "ON");
        assert_eq!(json["zone2_state"], "OFF");
    }

    #[test]
    fn snapshot_omits_unconfigured_fields() {
        let snapshot = StatusSnapshot {
            storage_l: None,
            flow_lpm: None,
            input_water_on: None,
            ..full_snapshot()
        };
        let json: Value = serde_json::from_slice(&snapshot.to_payload()).unwrap();
        let doc = json.as_object().unwrap();
        assert!(!doc.contains_key("storage_state"));
        assert!(!doc.contains_key("flow_state"));
        assert!(!doc.contains_key("input_water_state"));
        assert!(doc.contains_key("rain_state"));
    }
}
