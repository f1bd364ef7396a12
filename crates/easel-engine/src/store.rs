use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use easel_contracts::assets::{settings_path, AssetProvenance};
use easel_contracts::requests::{AssetCategory, CacheKey};
use easel_contracts::targets::SettingsTarget;
use image::imageops::FilterType;
use image::ImageFormat;
use tempfile::NamedTempFile;

use crate::error::{FetchError, FetchResult};

/// Where generated images and their sidecars live.
pub trait AssetStore: Send + Sync {
    /// Existing asset for `key`, by exact name first and then by hash suffix.
    fn probe(&self, category: AssetCategory, key: &CacheKey) -> Option<PathBuf>;

    /// Persists `bytes` atomically and returns the final path.
    fn store(
        &self,
        category: AssetCategory,
        key: &CacheKey,
        bytes: &[u8],
        provenance: &AssetProvenance,
    ) -> FetchResult<PathBuf>;

    /// Settings sidecar for `target`, when one can be located with certainty.
    fn settings_path(&self, target: &SettingsTarget) -> Option<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct FsAssetStore {
    asset_root: PathBuf,
    cache_root: PathBuf,
    thumbnail_max_width: u32,
}

impl FsAssetStore {
    pub fn new(asset_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            asset_root: asset_root.into(),
            cache_root: cache_root.into(),
            thumbnail_max_width: 256,
        }
    }

    pub fn with_thumbnail_max_width(mut self, width: u32) -> Self {
        self.thumbnail_max_width = width.max(1);
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn category_dir(&self, category: AssetCategory) -> PathBuf {
        self.cache_root.join(category.dir_name())
    }

    pub fn thumbs_dir(&self, category: AssetCategory) -> PathBuf {
        self.cache_root.join(category.thumbs_dir_name())
    }

    fn scan_for_suffix(&self, dir: &Path, key: &CacheKey) -> Option<PathBuf> {
        let suffix = key.hash_suffix();
        let entries = fs::read_dir(dir).ok()?;
        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .filter(|path| path.is_file())
            .collect();
        candidates.sort();
        candidates.into_iter().find(|path| {
            match AssetProvenance::load(path) {
                Some(record) if record.digest != key.digest => {
                    tracing::warn!(
                        path = %path.display(),
                        "hash prefix collision; skipping cached asset"
                    );
                    false
                }
                _ => true,
            }
        })
    }

    fn write_thumbnail(&self, category: AssetCategory, file_name: &str, bytes: &[u8]) -> Result<()> {
        let image = image::load_from_memory(bytes).context("failed to decode generated image")?;
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            anyhow::bail!("generated image has no pixels");
        }
        let target_width = width.min(self.thumbnail_max_width);
        let target_height =
            ((u64::from(target_width) * u64::from(height)) as f64 / f64::from(width)).round() as u32;
        let thumb = image.resize_exact(target_width, target_height.max(1), FilterType::Triangle);
        let mut encoded = Cursor::new(Vec::new());
        thumb
            .write_to(&mut encoded, ImageFormat::Png)
            .context("failed to encode thumbnail")?;
        let dir = self.thumbs_dir(category);
        write_atomic(&dir, &dir.join(file_name), encoded.get_ref())
    }
}

impl AssetStore for FsAssetStore {
    fn probe(&self, category: AssetCategory, key: &CacheKey) -> Option<PathBuf> {
        let dir = self.category_dir(category);
        let exact = dir.join(key.file_name());
        if exact.is_file() {
            return Some(exact);
        }
        self.scan_for_suffix(&dir, key)
    }

    fn store(
        &self,
        category: AssetCategory,
        key: &CacheKey,
        bytes: &[u8],
        provenance: &AssetProvenance,
    ) -> FetchResult<PathBuf> {
        let dir = self.category_dir(category);
        let file_name = key.file_name();
        let path = dir.join(&file_name);
        write_atomic(&dir, &path, bytes)
            .map_err(|err| FetchError::Storage(format!("{err:#}")))?;

        if let Err(err) = provenance.save(&path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to write provenance record");
        }
        if let Err(err) = self.write_thumbnail(category, &file_name, bytes) {
            tracing::warn!(path = %path.display(), error = %err, "thumbnail skipped");
        }
        tracing::info!(path = %path.display(), bytes = bytes.len(), "stored generated asset");
        Ok(path)
    }

    fn settings_path(&self, target: &SettingsTarget) -> Option<PathBuf> {
        match target {
            SettingsTarget::LocalAsset(relative) => {
                Some(settings_path(&self.asset_root.join(relative)))
            }
            // Only an asset that already exists can carry settings.
            SettingsTarget::Generation(request) => self
                .probe(request.category(), &request.cache_key())
                .map(|asset| settings_path(&asset)),
        }
    }
}

/// Temp file in the destination directory, then rename, so readers only ever
/// see complete files.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let mut temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    temp.write_all(bytes)
        .with_context(|| format!("failed to write {}", path.display()))?;
    temp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move asset into {}", path.display()))?;
    Ok(())
}
