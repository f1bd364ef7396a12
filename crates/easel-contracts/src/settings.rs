use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CHANNEL_MIN: i64 = 0;
pub const CHANNEL_MAX: i64 = 255;

/// Per-image mask tuning stored in the `<basename>.json` sidecar.
///
/// Every field is optional: absent means "unset", never zero.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub softness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl MaskSettings {
    /// Keeps only recognised fields, clamping channels and dropping
    /// malformed colours. Returns `None` when `raw` is not a JSON object.
    pub fn sanitize(raw: &Value) -> Option<Self> {
        let object = raw.as_object()?;
        Some(Self::from_object(object))
    }

    fn from_object(object: &Map<String, Value>) -> Self {
        Self {
            tolerance: object.get("tolerance").and_then(clamp_channel),
            softness: object.get("softness").and_then(clamp_channel),
            key_color: object.get("keyColor").and_then(normalize_key_color),
            updated_at: object
                .get("updatedAt")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// Fresh write copy: same recognised fields, new `updatedAt`.
    pub fn stamped(&self) -> Self {
        Self {
            updated_at: Some(now_utc_iso()),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MaskLookup {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<MaskSettings>,
}

impl MaskLookup {
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Integer-truncates numbers and numeric strings, then clamps to 0..=255.
pub fn clamp_channel(value: &Value) -> Option<u8> {
    let number = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float.trunc() as i64))?,
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>()
                .ok()
                .or_else(|| text.parse::<f64>().ok().map(|float| float.trunc() as i64))?
        }
        Value::Bool(flag) => i64::from(*flag),
        _ => return None,
    };
    Some(number.clamp(CHANNEL_MIN, CHANNEL_MAX) as u8)
}

/// Accepts `#rrggbb` or bare `rrggbb`; always yields the `#` form.
pub fn normalize_key_color(value: &Value) -> Option<String> {
    let raw = value.as_str()?.trim();
    let hex = raw.strip_prefix('#').unwrap_or(raw);
    if hex.len() != 6 || !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("#{hex}"))
}

pub fn read_mask_settings(path: &Path) -> MaskLookup {
    if !path.is_file() {
        return MaskLookup::missing();
    }
    MaskLookup {
        exists: true,
        settings: read_json_value(path).as_ref().and_then(MaskSettings::sanitize),
    }
}

pub fn write_mask_settings(path: &Path, settings: &MaskSettings) -> anyhow::Result<()> {
    write_json_value(path, &serde_json::to_value(settings)?)
}

pub fn read_json_value(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

pub fn write_json_value(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string(payload)?)?;
    Ok(())
}

pub fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}
