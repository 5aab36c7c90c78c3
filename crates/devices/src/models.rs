//! Model table: which vendor models exist, how their reports decode and
//! how commands encode into write fields.

use serde::Serialize;
use serde_json::Value;

use aqara_protocol::{Payload, ProtoVersion};

use crate::battery::round_to;

/// Broad device category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Switch,
    Sensor,
    BinarySensor,
    Gateway,
    Cover,
    Lock,
}

/// Decoded functional state, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceState {
    Switch(SwitchState),
    Sensor(SensorState),
    BinarySensor(BinaryState),
    Gateway(GatewayState),
    Cover(CoverState),
    Lock(LockState),
}

impl DeviceState {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceState::Switch(_) => DeviceKind::Switch,
            DeviceState::Sensor(_) => DeviceKind::Sensor,
            DeviceState::BinarySensor(_) => DeviceKind::BinarySensor,
            DeviceState::Gateway(_) => DeviceKind::Gateway,
            DeviceState::Cover(_) => DeviceKind::Cover,
            DeviceState::Lock(_) => DeviceKind::Lock,
        }
    }
}

/// One switchable output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    /// Field the hub reports and accepts (`status`, `channel_0`, ...).
    pub data_key: String,
    pub on: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SwitchState {
    pub channels: Vec<Channel>,
    /// Plugs report consumption; wall switches do not.
    pub metering: bool,
    pub in_use: Option<bool>,
    pub load_power: Option<f64>,
    pub power_consumed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SensorState {
    /// °C
    pub temperature: Option<f64>,
    /// %
    pub humidity: Option<f64>,
    /// hPa
    pub pressure: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BinaryState {
    /// Report field carrying the state.
    pub data_key: String,
    pub on: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GatewayState {
    pub illumination: Option<u64>,
    /// Light colour as `0xBBRRGGBB`, brightness in the top byte.
    pub rgb: Option<u32>,
}

impl GatewayState {
    pub fn brightness(&self) -> Option<u8> {
        self.rgb.map(|rgb| (rgb >> 24) as u8)
    }

    pub fn light_on(&self) -> bool {
        self.brightness().is_some_and(|b| b > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CoverState {
    /// 0 = closed, 100 = open.
    pub position: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct LockState {
    /// Field of the last verification event (`fing_verified`, ...).
    pub last_method: Option<String>,
    pub last_user: Option<u64>,
}

/// Command a host may issue to a sub-device.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TurnOn { channel: usize },
    TurnOff { channel: usize },
    OpenCover,
    CloseCover,
    StopCover,
    SetCoverPosition(u8),
    /// Hub light; `brightness` 0 switches it off.
    SetLight { rgb: u32, brightness: u8 },
}

/// Builds the initial state for a model and protocol version.
pub type InitFn = fn(model: &str, proto: ProtoVersion) -> DeviceState;
/// Applies a report to the state. Returns `true` if a functional field changed.
pub type DecodeFn = fn(state: &mut DeviceState, data: &Payload) -> bool;
/// Turns a command into write fields, `None` if not applicable.
pub type EncodeFn = fn(state: &DeviceState, command: &Command) -> Option<Payload>;

/// Registration entry for a family of models.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub models: &'static [&'static str],
    pub kind: DeviceKind,
    pub init: InitFn,
    pub decode: DecodeFn,
    pub encode_command: EncodeFn,
    /// Needs periodic `read` because the device does not push everything.
    pub polled: bool,
}

/// Lookup table of known models.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    descriptors: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            descriptors: Vec::new(),
        }
    }

    /// Registry with every built-in family.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for descriptor in builtin_descriptors() {
            registry.register(descriptor);
        }
        registry
    }

    /// Adds a family. Later registrations win for overlapping models.
    pub fn register(&mut self, descriptor: ModelDescriptor) {
        self.descriptors.insert(0, descriptor);
    }

    pub fn lookup(&self, model: &str) -> Option<&ModelDescriptor> {
        self.descriptors.iter().find(|d| d.models.contains(&model))
    }

    pub fn is_supported(&self, model: &str) -> bool {
        self.lookup(model).is_some()
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_descriptors() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            models: &["plug", "86plug", "ctrl_86plug", "ctrl_86plug.aq1"],
            kind: DeviceKind::Switch,
            init: init_plug,
            decode: decode_switch,
            encode_command: encode_switch,
            polled: true,
        },
        ModelDescriptor {
            models: &[
                "ctrl_neutral1",
                "ctrl_neutral1.aq1",
                "ctrl_ln1",
                "ctrl_ln1.aq1",
            ],
            kind: DeviceKind::Switch,
            init: init_single_switch,
            decode: decode_switch,
            encode_command: encode_switch,
            polled: false,
        },
        ModelDescriptor {
            models: &[
                "ctrl_neutral2",
                "ctrl_neutral2.aq1",
                "ctrl_ln2",
                "ctrl_ln2.aq1",
            ],
            kind: DeviceKind::Switch,
            init: init_double_switch,
            decode: decode_switch,
            encode_command: encode_switch,
            polled: false,
        },
        ModelDescriptor {
            models: &["sensor_ht", "weather", "weather.v1"],
            kind: DeviceKind::Sensor,
            init: init_sensor,
            decode: decode_sensor,
            encode_command: encode_nothing,
            polled: false,
        },
        ModelDescriptor {
            models: &[
                "magnet",
                "sensor_magnet",
                "sensor_magnet.aq2",
                "motion",
                "sensor_motion",
                "sensor_motion.aq2",
                "sensor_wleak.aq1",
                "smoke",
                "natgas",
            ],
            kind: DeviceKind::BinarySensor,
            init: init_binary,
            decode: decode_binary,
            encode_command: encode_nothing,
            polled: false,
        },
        ModelDescriptor {
            models: &["gateway", "gateway.v3", "acpartner.v3"],
            kind: DeviceKind::Gateway,
            init: init_gateway,
            decode: decode_gateway,
            encode_command: encode_gateway,
            polled: false,
        },
        ModelDescriptor {
            models: &["curtain", "curtain.aq2", "curtain.hagl04"],
            kind: DeviceKind::Cover,
            init: init_cover,
            decode: decode_cover,
            encode_command: encode_cover,
            polled: false,
        },
        ModelDescriptor {
            models: &["lock.aq1", "lock.acn02"],
            kind: DeviceKind::Lock,
            init: init_lock,
            decode: decode_lock,
            encode_command: encode_nothing,
            polled: false,
        },
    ]
}

// -- switches ---------------------------------------------------------------

const IN_USE: &str = "inuse";
const LOAD_POWER: &str = "load_power";
const CONSUMPTION_KEYS: [&str; 2] = ["power_consumed", "energy_consumed"];

fn switch_state(keys: &[&str], metering: bool) -> DeviceState {
    DeviceState::Switch(SwitchState {
        channels: keys
            .iter()
            .map(|k| Channel {
                data_key: (*k).to_string(),
                on: None,
            })
            .collect(),
        metering,
        ..SwitchState::default()
    })
}

fn init_plug(_model: &str, proto: ProtoVersion) -> DeviceState {
    let key = match proto {
        ProtoVersion::V1 => "status",
        ProtoVersion::V2 => "channel_0",
    };
    switch_state(&[key], true)
}

fn init_single_switch(_model: &str, _proto: ProtoVersion) -> DeviceState {
    switch_state(&["channel_0"], false)
}

fn init_double_switch(_model: &str, _proto: ProtoVersion) -> DeviceState {
    switch_state(&["channel_0", "channel_1"], false)
}

fn decode_switch(state: &mut DeviceState, data: &Payload) -> bool {
    let DeviceState::Switch(s) = state else {
        return false;
    };
    let mut changed = false;

    if s.metering {
        if let Some(in_use) = data.get(IN_USE).and_then(number) {
            let in_use = in_use != 0.0;
            changed |= s.in_use != Some(in_use);
            s.in_use = Some(in_use);
            if !in_use {
                s.load_power = Some(0.0);
            }
        }
        if let Some(consumed) = CONSUMPTION_KEYS
            .iter()
            .find_map(|k| data.get(*k))
            .and_then(number)
        {
            let consumed = round_to(consumed, 2);
            changed |= s.power_consumed != Some(consumed);
            s.power_consumed = Some(consumed);
        }
        if let Some(power) = data.get(LOAD_POWER).and_then(number) {
            let power = round_to(power, 2);
            changed |= s.load_power != Some(power);
            s.load_power = Some(power);
        }
    }

    for channel in &mut s.channels {
        let on = match data.get(&channel.data_key).and_then(Value::as_str) {
            Some("on") => true,
            Some("off") => false,
            _ => continue,
        };
        changed |= channel.on != Some(on);
        channel.on = Some(on);
    }

    changed
}

fn encode_switch(state: &DeviceState, command: &Command) -> Option<Payload> {
    let DeviceState::Switch(s) = state else {
        return None;
    };
    let (channel, value) = match command {
        Command::TurnOn { channel } => (*channel, "on"),
        Command::TurnOff { channel } => (*channel, "off"),
        _ => return None,
    };
    let key = &s.channels.get(channel)?.data_key;
    Some(fields([(key.as_str(), Value::from(value))]))
}

// -- sensors ----------------------------------------------------------------

fn init_sensor(_model: &str, _proto: ProtoVersion) -> DeviceState {
    DeviceState::Sensor(SensorState::default())
}

fn decode_sensor(state: &mut DeviceState, data: &Payload) -> bool {
    let DeviceState::Sensor(s) = state else {
        return false;
    };
    let mut changed = false;

    for (key, slot) in [
        ("temperature", &mut s.temperature),
        ("humidity", &mut s.humidity),
        ("pressure", &mut s.pressure),
    ] {
        let Some(raw) = data.get(key).and_then(number) else {
            continue;
        };
        // 10000 °C / % is the firmware's "no reading" marker.
        if key != "pressure" && raw.abs() >= 10000.0 {
            continue;
        }
        let value = round_to(raw / 100.0, 2);
        changed |= *slot != Some(value);
        *slot = Some(value);
    }

    changed
}

// -- binary sensors ---------------------------------------------------------

fn init_binary(model: &str, _proto: ProtoVersion) -> DeviceState {
    let data_key = match model {
        "smoke" | "natgas" => "alarm",
        _ => "status",
    };
    DeviceState::BinarySensor(BinaryState {
        data_key: data_key.to_string(),
        on: None,
    })
}

fn decode_binary(state: &mut DeviceState, data: &Payload) -> bool {
    let DeviceState::BinarySensor(s) = state else {
        return false;
    };

    // Motion sensors clear with a separate `no_motion` field.
    let on = if data.contains_key("no_motion") {
        false
    } else {
        match data.get(&s.data_key) {
            Some(Value::String(v)) => match v.as_str() {
                "open" | "motion" | "leak" => true,
                "close" | "no_leak" => false,
                "0" => false,
                "1" | "2" => true,
                _ => return false,
            },
            Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            _ => return false,
        }
    };

    let changed = s.on != Some(on);
    s.on = Some(on);
    changed
}

// -- hub --------------------------------------------------------------------

fn init_gateway(_model: &str, _proto: ProtoVersion) -> DeviceState {
    DeviceState::Gateway(GatewayState::default())
}

fn decode_gateway(state: &mut DeviceState, data: &Payload) -> bool {
    let DeviceState::Gateway(s) = state else {
        return false;
    };
    let mut changed = false;

    if let Some(lux) = data.get("illumination").and_then(number) {
        let lux = lux.max(0.0) as u64;
        changed |= s.illumination != Some(lux);
        s.illumination = Some(lux);
    }
    if let Some(rgb) = data.get("rgb").and_then(number) {
        let rgb = rgb as u32;
        changed |= s.rgb != Some(rgb);
        s.rgb = Some(rgb);
    }

    changed
}

fn encode_gateway(state: &DeviceState, command: &Command) -> Option<Payload> {
    if !matches!(state, DeviceState::Gateway(_)) {
        return None;
    }
    let Command::SetLight { rgb, brightness } = command else {
        return None;
    };
    let brightness = (*brightness).min(100);
    let value = if brightness == 0 {
        0
    } else {
        (u32::from(brightness) << 24) | (rgb & 0x00ff_ffff)
    };
    Some(fields([("rgb", Value::from(value))]))
}

// -- covers -----------------------------------------------------------------

fn init_cover(_model: &str, _proto: ProtoVersion) -> DeviceState {
    DeviceState::Cover(CoverState::default())
}

fn decode_cover(state: &mut DeviceState, data: &Payload) -> bool {
    let DeviceState::Cover(s) = state else {
        return false;
    };
    let Some(level) = data.get("curtain_level").and_then(number) else {
        return false;
    };
    let position = level.clamp(0.0, 100.0) as u8;
    let changed = s.position != Some(position);
    s.position = Some(position);
    changed
}

fn encode_cover(state: &DeviceState, command: &Command) -> Option<Payload> {
    if !matches!(state, DeviceState::Cover(_)) {
        return None;
    }
    let (key, value) = match command {
        Command::OpenCover => ("curtain_status", Value::from("open")),
        Command::CloseCover => ("curtain_status", Value::from("close")),
        Command::StopCover => ("curtain_status", Value::from("stop")),
        Command::SetCoverPosition(p) => ("curtain_level", Value::from((*p).min(100).to_string())),
        _ => return None,
    };
    Some(fields([(key, value)]))
}

// -- locks ------------------------------------------------------------------

const LOCK_KEYS: [&str; 4] = [
    "fing_verified",
    "psw_verified",
    "card_verified",
    "verified_wrong",
];

fn init_lock(_model: &str, _proto: ProtoVersion) -> DeviceState {
    DeviceState::Lock(LockState::default())
}

fn decode_lock(state: &mut DeviceState, data: &Payload) -> bool {
    let DeviceState::Lock(s) = state else {
        return false;
    };
    let Some((key, value)) = LOCK_KEYS
        .iter()
        .find_map(|k| data.get(*k).map(|v| (*k, v)))
    else {
        return false;
    };

    let user = number(value).map(|u| u as u64);
    let changed = s.last_method.as_deref() != Some(key) || s.last_user != user;
    s.last_method = Some(key.to_string());
    s.last_user = user;
    changed
}

fn encode_nothing(_state: &DeviceState, _command: &Command) -> Option<Payload> {
    None
}

// -- helpers ----------------------------------------------------------------

/// Numeric value sent either as a JSON number or a numeric string.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Payload {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
