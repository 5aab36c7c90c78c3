//! Shared voltage / battery decoder.

use serde_json::Value;

use aqara_protocol::Payload;

/// Fully discharged CR2032 / CR1632, in millivolts.
pub const MIN_VOLT: u32 = 2800;
/// Fresh cell, in millivolts.
pub const MAX_VOLT: u32 = 3300;

/// Keys a sub-device may report its cell voltage under.
const VOLTAGE_KEYS: [&str; 2] = ["voltage", "battery_voltage"];

/// Battery attributes derived from a report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Battery {
    /// Volts, rounded to two decimals.
    pub voltage: f64,
    /// Percent, rounded to one decimal.
    pub level: f64,
}

/// Decodes the battery from `voltage` or `battery_voltage` (millivolts).
///
/// Returns `None` if neither key is present or the value is not numeric.
pub fn parse_battery(data: &Payload) -> Option<Battery> {
    let raw = VOLTAGE_KEYS
        .iter()
        .find_map(|key| data.get(*key))
        .and_then(millivolts)?;

    Some(Battery {
        voltage: round_to(raw / 1000.0, 2),
        level: battery_percent(raw),
    })
}

/// Maps millivolts onto 0–100 %, clamped to the cell's usable range.
pub fn battery_percent(millivolts: f64) -> f64 {
    let (min, max) = (f64::from(MIN_VOLT), f64::from(MAX_VOLT));
    let clamped = millivolts.clamp(min, max);
    round_to((clamped - min) / (max - min) * 100.0, 1)
}

fn millivolts(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn decodes_voltage_key() {
        let b = parse_battery(&payload(json!({"voltage": 3050}))).unwrap();
        assert_eq!(b.voltage, 3.05);
        assert_eq!(b.level, 50.0);
    }

    #[test]
    fn decodes_alternate_key_and_string_value() {
        let b = parse_battery(&payload(json!({"battery_voltage": "2900"}))).unwrap();
        assert_eq!(b.voltage, 2.9);
        assert_eq!(b.level, 20.0);
    }

    #[test]
    fn clamps_out_of_range() {
        assert_eq!(battery_percent(2500.0), 0.0);
        assert_eq!(battery_percent(2800.0), 0.0);
        assert_eq!(battery_percent(3300.0), 100.0);
        assert_eq!(battery_percent(3600.0), 100.0);

        let b = parse_battery(&payload(json!({"voltage": 3600}))).unwrap();
        assert_eq!(b.voltage, 3.6);
        assert_eq!(b.level, 100.0);
    }

    #[test]
    fn percent_is_monotonic() {
        let mut last = -1.0;
        for mv in (2600..=3500).step_by(7) {
            let p = battery_percent(f64::from(mv));
            assert!(p >= last, "{mv} mV gave {p} after {last}");
            assert!((0.0..=100.0).contains(&p));
            last = p;
        }
    }

    #[test]
    fn missing_or_bogus_voltage() {
        assert!(parse_battery(&payload(json!({"status": "open"}))).is_none());
        assert!(parse_battery(&payload(json!({"voltage": "n/a"}))).is_none());
    }
}
