use std::path::PathBuf;
use std::sync::Arc;

use easel_contracts::settings::{read_mask_settings, write_mask_settings, MaskLookup, MaskSettings};
use easel_contracts::sources::Routes;
use easel_contracts::targets::{parse_settings_target, SettingsTarget};
use serde_json::Value;

use crate::error::SettingsError;
use crate::store::AssetStore;

/// Locates the `<basename>.json` mask sidecar for an image target, using the
/// same key derivation as the generation cache.
pub struct SidecarPathResolver {
    store: Arc<dyn AssetStore>,
    routes: Routes,
    local_prefixes: Vec<String>,
}

impl SidecarPathResolver {
    pub fn new(store: Arc<dyn AssetStore>, routes: Routes, local_prefixes: Vec<String>) -> Self {
        Self {
            store,
            routes,
            local_prefixes,
        }
    }

    pub fn target(&self, raw: &str) -> Option<SettingsTarget> {
        parse_settings_target(raw, &self.routes, &self.local_prefixes)
    }

    pub fn resolve(&self, raw: &str) -> Option<PathBuf> {
        let target = self.target(raw)?;
        self.store.settings_path(&target)
    }

    pub fn read(&self, raw: &str) -> MaskLookup {
        match self.resolve(raw) {
            Some(path) => read_mask_settings(&path),
            None => MaskLookup::missing(),
        }
    }

    /// The whole sidecar is replaced with the sanitised fields plus a fresh
    /// `updatedAt`.
    pub fn write(&self, raw: &str, settings: &Value) -> Result<PathBuf, SettingsError> {
        let sanitized = MaskSettings::sanitize(settings).ok_or(SettingsError::InvalidSettings)?;
        let path = self.resolve(raw).ok_or(SettingsError::UnsupportedTarget)?;
        write_mask_settings(&path, &sanitized.stamped())?;
        tracing::info!(path = %path.display(), "wrote mask settings");
        Ok(path)
    }
}
