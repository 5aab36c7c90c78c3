use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::constants::INVALID_KEY_ERROR;

/// Decoded attribute map of a sub-device (`{"status":"on","voltage":3015}`).
pub type Payload = serde_json::Map<String, Value>;

/// Errors decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// A single JSON datagram of the gateway LAN protocol.
///
/// Every frame carries `cmd`; the remaining fields depend on the command.
/// Protocol v1 hubs put attributes in `data` as a JSON *string*, v2 hubs
/// use a `params` list of single-key objects. Outgoing writes put `data`
/// as an object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_list: Option<Vec<Value>>,
}

/// Hubs send the port as a string (`"9898"`), some firmware as a number.
fn lenient_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

impl Frame {
    /// Creates a frame with only `cmd` set.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    /// Creates a frame addressed to a (sub-)device.
    pub fn for_sid(cmd: impl Into<String>, sid: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            sid: Some(sid.into()),
            ..Self::default()
        }
    }

    /// Parses a received datagram.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let frame: Frame = serde_json::from_slice(bytes)?;
        if frame.cmd.is_empty() {
            return Err(FrameError::Malformed("empty cmd".into()));
        }
        Ok(frame)
    }

    /// Serializes the frame for sending.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Key used to match a reply to the command that caused it.
    pub fn correlation_id(&self) -> String {
        correlation_id(&self.cmd, self.sid.as_deref().unwrap_or(""))
    }

    /// Decodes the attribute map carried in `data` or `params`.
    ///
    /// Returns `Ok(None)` when the frame carries neither.
    pub fn payload(&self) -> Result<Option<Payload>, FrameError> {
        if let Some(data) = &self.data {
            return match data {
                Value::String(s) => match serde_json::from_str::<Value>(s)? {
                    Value::Object(map) => Ok(Some(map)),
                    other => Err(FrameError::Malformed(format!(
                        "data is not an object: {other}"
                    ))),
                },
                Value::Object(map) => Ok(Some(map.clone())),
                other => Err(FrameError::Malformed(format!(
                    "unexpected data type: {other}"
                ))),
            };
        }

        if let Some(params) = &self.params {
            let mut merged = Payload::new();
            for param in params {
                let Value::Object(obj) = param else {
                    return Err(FrameError::Malformed(format!(
                        "param is not an object: {param}"
                    )));
                };
                for (k, v) in obj {
                    merged.insert(k.clone(), v.clone());
                }
            }
            return Ok(Some(merged));
        }

        Ok(None)
    }

    /// Returns the hub's error message if the reply reports one.
    pub fn error(&self) -> Option<String> {
        match self.payload() {
            Ok(Some(map)) => map.get("error").map(|e| match e {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    /// Returns `true` if the hub rejected the write signature.
    pub fn is_invalid_key(&self) -> bool {
        self.error()
            .is_some_and(|e| e.contains(INVALID_KEY_ERROR))
    }

    /// Sub-device ids listed in a `get_id_list_ack` / `discovery_rsp`.
    pub fn id_list(&self) -> Result<Vec<String>, FrameError> {
        if let Some(devices) = &self.dev_list {
            return Ok(devices
                .iter()
                .filter_map(|d| d.get("sid").and_then(Value::as_str))
                .map(str::to_string)
                .collect());
        }

        let ids = match &self.data {
            Some(Value::String(s)) => serde_json::from_str::<Value>(s)?,
            Some(other) => other.clone(),
            None => return Err(FrameError::Malformed("missing device list".into())),
        };
        match ids {
            Value::Array(items) => Ok(items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()),
            other => Err(FrameError::Malformed(format!(
                "device list is not an array: {other}"
            ))),
        }
    }

    /// `short_id` as a number, as hubs echo it back on writes.
    pub fn short_id_value(&self) -> u64 {
        match &self.short_id {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }
}

/// Builds the correlation key for a reply command and sid.
pub fn correlation_id(cmd: &str, sid: &str) -> String {
    format!("{cmd}:{sid}")
}
