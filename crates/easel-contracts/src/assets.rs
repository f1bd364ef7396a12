use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::requests::{AssetCategory, CacheKey, GenerationRequest};
use crate::settings::{now_utc_iso, read_json_value, write_json_value};

pub const SETTINGS_EXTENSION: &str = "json";
pub const PROVENANCE_SUFFIX: &str = ".meta.json";

/// Written beside every generated asset so that a short-hash collision on
/// the fallback scan can be told apart from a genuine hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetProvenance {
    pub digest: String,
    pub category: AssetCategory,
    pub prompt: String,
    pub aspect_ratio: String,
    pub created_at: String,
}

impl AssetProvenance {
    pub fn for_request(request: &GenerationRequest, key: &CacheKey) -> Self {
        Self {
            digest: key.digest.clone(),
            category: request.category(),
            prompt: request.prompt().to_string(),
            aspect_ratio: request.aspect_ratio().to_string(),
            created_at: now_utc_iso(),
        }
    }

    pub fn load(asset_path: &Path) -> Option<Self> {
        let value = read_json_value(&provenance_path(asset_path))?;
        serde_json::from_value(value).ok()
    }

    pub fn save(&self, asset_path: &Path) -> anyhow::Result<()> {
        write_json_value(&provenance_path(asset_path), &serde_json::to_value(self)?)
    }
}

/// `foo--abc.png` -> `foo--abc.json`
pub fn settings_path(asset_path: &Path) -> PathBuf {
    asset_path.with_extension(SETTINGS_EXTENSION)
}

/// `foo--abc.png` -> `foo--abc.meta.json`
pub fn provenance_path(asset_path: &Path) -> PathBuf {
    let stem = asset_path
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_default();
    asset_path.with_file_name(format!("{stem}{PROVENANCE_SUFFIX}"))
}
