use std::path::PathBuf;

use easel_contracts::sources::Routes;
use serde::{Deserialize, Serialize};

pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-image-preview";

/// Everything the engine needs, handed over at construction. The engine never
/// consults the process environment on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub asset_root: PathBuf,
    /// Relative paths are taken against `asset_root`.
    pub cache_dir: PathBuf,
    /// Absolute origin of this service, used for self-referential fetches.
    pub public_base_url: String,
    pub mount_path: String,
    pub image_endpoint: String,
    pub gemini: GeminiConfig,
    pub proxy_client_id: Option<String>,
    pub connect_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Total timeout for self-referential fetches, which may wait on a full
    /// generation.
    pub internal_timeout_secs: u64,
    pub max_proxy_bytes: u64,
    pub max_reference_bytes: u64,
    pub max_forward_depth: u32,
    pub thumbnail_max_width: u32,
    /// Asset-root relative prefixes whose images may carry mask settings.
    /// The cache directory is always included.
    pub settings_prefixes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            asset_root: PathBuf::from("."),
            cache_dir: PathBuf::from("img/gemini"),
            public_base_url: "http://127.0.0.1:8080".to_string(),
            mount_path: "/".to_string(),
            image_endpoint: "image".to_string(),
            gemini: GeminiConfig::default(),
            proxy_client_id: None,
            connect_timeout_secs: 5,
            fetch_timeout_secs: 25,
            internal_timeout_secs: 150,
            max_proxy_bytes: 4 * 1024 * 1024,
            max_reference_bytes: 16 * 1024 * 1024,
            max_forward_depth: 4,
            thumbnail_max_width: 256,
            settings_prefixes: vec!["img/poses/".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn routes(&self) -> Routes {
        Routes::new(&self.mount_path, &self.image_endpoint)
    }

    pub fn cache_root(&self) -> PathBuf {
        if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            self.asset_root.join(&self.cache_dir)
        }
    }

    pub fn local_settings_prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self
            .settings_prefixes
            .iter()
            .map(|prefix| normalize_prefix(prefix))
            .filter(|prefix| !prefix.is_empty())
            .collect();
        if let Ok(relative) = self.cache_root().strip_prefix(&self.asset_root) {
            let cache_prefix = normalize_prefix(&relative.to_string_lossy());
            if !cache_prefix.is_empty() && !prefixes.contains(&cache_prefix) {
                prefixes.push(cache_prefix);
            }
        }
        prefixes
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            connect_timeout_secs: 5,
            timeout_secs: 120,
        }
    }
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().replace('\\', "/");
    let trimmed = trimmed.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}
