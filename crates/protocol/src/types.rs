use std::fmt;

use crate::constants::GATEWAY_MODELS;

/// LAN protocol generation spoken by a hub.
///
/// Firmware reporting `1.x` uses `get_id_list`/`*_ack` commands with a
/// JSON-string `data` field; anything newer uses `discovery`/`*_rsp` with a
/// `params` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtoVersion {
    #[default]
    V1,
    V2,
}

impl ProtoVersion {
    /// Parses the hub's `proto_version` string (e.g. `"1.1.2"`, `"2.0.1"`).
    pub fn parse(version: &str) -> Self {
        match version.trim().chars().next().and_then(|c| c.to_digit(10)) {
            Some(0) | Some(1) | None => ProtoVersion::V1,
            Some(_) => ProtoVersion::V2,
        }
    }

    /// Command that lists the sub-devices of a hub.
    pub fn id_list_cmd(self) -> &'static str {
        match self {
            ProtoVersion::V1 => "get_id_list",
            ProtoVersion::V2 => "discovery",
        }
    }

    /// Reply to [`id_list_cmd`](Self::id_list_cmd).
    pub fn id_list_ack(self) -> &'static str {
        match self {
            ProtoVersion::V1 => "get_id_list_ack",
            ProtoVersion::V2 => "discovery_rsp",
        }
    }

    pub fn read_ack(self) -> &'static str {
        match self {
            ProtoVersion::V1 => "read_ack",
            ProtoVersion::V2 => "read_rsp",
        }
    }

    pub fn write_ack(self) -> &'static str {
        match self {
            ProtoVersion::V1 => "write_ack",
            ProtoVersion::V2 => "write_rsp",
        }
    }
}

impl fmt::Display for ProtoVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoVersion::V1 => write!(f, "v1"),
            ProtoVersion::V2 => write!(f, "v2"),
        }
    }
}

/// Returns `true` if `model` is one of the recognized hub models.
pub fn is_gateway_model(model: &str) -> bool {
    GATEWAY_MODELS.contains(&model)
}

/// Normalizes a serial id or MAC: strips `:` separators and lowercases.
pub fn normalize_sid(sid: &str) -> String {
    sid.chars()
        .filter(|c| *c != ':')
        .flat_map(char::to_lowercase)
        .collect()
}
