pub mod config;
pub mod error;
pub mod generator;
pub mod render;
pub mod resolver;
pub mod sidecar;
pub mod store;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use easel_contracts::assets::AssetProvenance;
use easel_contracts::requests::{FetchTarget, GenerationRequest, ImageParams};
use easel_contracts::settings::MaskLookup;
use easel_contracts::sources::{Routes, DEFAULT_REFERENCE_MIME};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::{FetchError, FetchResult, SettingsError};
use crate::generator::{GeminiGenerator, GenerationInputs, ImageGenerator};
use crate::render::ErrorImageRenderer;
use crate::resolver::{sniff_mime, ByteSourceResolver, RequestContext};
use crate::sidecar::SidecarPathResolver;
use crate::store::{AssetStore, FsAssetStore};

pub use crate::resolver::{API_KEY_OVERRIDE_HEADER, FORWARD_DEPTH_HEADER};

pub const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
pub const CACHE_STATUS_HEADER: &str = "x-cache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOrigin {
    CacheHit(PathBuf),
    Generated(PathBuf),
    Proxied,
}

#[derive(Debug, Clone)]
pub struct AssetReply {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub origin: AssetOrigin,
}

/// What goes back on the wire. `status` is 200 or 304; failures are carried
/// by the body and the diagnostic headers, never by the status.
#[derive(Debug, Clone)]
pub struct ImageReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ImageReply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_error(&self) -> bool {
        self.header(render::ERROR_FLAG_HEADER) == Some("true")
    }
}

pub struct AssetEngine {
    config: EngineConfig,
    routes: Routes,
    resolver: ByteSourceResolver,
    store: Arc<dyn AssetStore>,
    generator: Box<dyn ImageGenerator>,
    sidecars: SidecarPathResolver,
    renderer: ErrorImageRenderer,
}

impl AssetEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let store = FsAssetStore::new(config.asset_root.clone(), config.cache_root())
            .with_thumbnail_max_width(config.thumbnail_max_width);
        let generator = GeminiGenerator::new(config.gemini.clone())?;
        Self::with_parts(config, Arc::new(store), Box::new(generator))
    }

    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn AssetStore>,
        generator: Box<dyn ImageGenerator>,
    ) -> Result<Self> {
        let routes = config.routes();
        let resolver = ByteSourceResolver::new(&config)?;
        let sidecars = SidecarPathResolver::new(
            store.clone(),
            routes.clone(),
            config.local_settings_prefixes(),
        );
        Ok(Self {
            config,
            routes,
            resolver,
            store,
            generator,
            sidecars,
            renderer: ErrorImageRenderer,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The entry point. Never fails: every error becomes an error image.
    pub fn handle(&self, params: &ImageParams, ctx: &RequestContext) -> ImageReply {
        let target = match params.target(&self.routes) {
            Ok(target) => target,
            Err(err) => return self.error_reply(&FetchError::invalid_input(err)),
        };
        if ctx.conditional {
            tracing::debug!("client holds a copy; answering not modified");
            return ImageReply {
                status: 304,
                headers: Vec::new(),
                body: Vec::new(),
            };
        }
        match self.fetch_target(target, ctx) {
            Ok(reply) => {
                let mut headers = vec![("content-type".to_string(), reply.content_type)];
                headers.extend(reply.headers);
                ImageReply {
                    status: 200,
                    headers,
                    body: reply.bytes,
                }
            }
            Err(err) => self.error_reply(&err),
        }
    }

    pub fn fetch(&self, params: &ImageParams, ctx: &RequestContext) -> FetchResult<AssetReply> {
        let target = params
            .target(&self.routes)
            .map_err(FetchError::invalid_input)?;
        self.fetch_target(target, ctx)
    }

    fn fetch_target(&self, target: FetchTarget, ctx: &RequestContext) -> FetchResult<AssetReply> {
        match target {
            FetchTarget::Proxy(url) => self.proxy(&url),
            FetchTarget::Generate(request) => self.generate(&request, ctx),
        }
    }

    pub fn proxy(&self, url: &str) -> FetchResult<AssetReply> {
        let proxied = self.resolver.fetch_proxy(url)?;
        let headers = proxied
            .headers
            .into_iter()
            .filter(|(name, _)| name != "content-type" && name != "content-length")
            .collect();
        Ok(AssetReply {
            bytes: proxied.bytes,
            content_type: proxied.content_type,
            headers,
            origin: AssetOrigin::Proxied,
        })
    }

    /// Cache-or-generate. All sources are checked before any of them is
    /// fetched, and nothing is written unless generation succeeds.
    pub fn generate(
        &self,
        request: &GenerationRequest,
        ctx: &RequestContext,
    ) -> FetchResult<AssetReply> {
        let key = request.cache_key();
        let category = request.category();

        if let Some(path) = self.store.probe(category, &key) {
            match fs::read(&path) {
                Ok(bytes) => {
                    tracing::debug!(path = %path.display(), "cache hit");
                    return Ok(cached_reply(bytes, None, AssetOrigin::CacheHit(path), "hit"));
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "cached asset unreadable; regenerating");
                }
            }
        }

        if let Some(pose) = request.pose_reference() {
            self.resolver.precheck(pose, ctx)?;
        }
        for (_, source) in request.references() {
            self.resolver.precheck(source, ctx)?;
        }

        let mut inputs = GenerationInputs::default();
        for (role, source) in request.references() {
            let resolved = self.resolver.resolve_reference(source, ctx)?;
            inputs.references.push((role, resolved));
        }
        if let Some(pose) = request.pose_reference() {
            inputs.pose = Some(self.resolver.resolve_reference(pose, ctx)?);
        }

        tracing::info!(
            generator = self.generator.name(),
            file = %key.file_name(),
            "cache miss; generating"
        );
        let image = self
            .generator
            .generate(request, &inputs, ctx.api_key_override())?;
        if image.bytes.is_empty() {
            return Err(FetchError::Upstream("generator returned an empty image".to_string()));
        }
        let provenance = AssetProvenance::for_request(request, &key);
        let path = self.store.store(category, &key, &image.bytes, &provenance)?;
        Ok(cached_reply(
            image.bytes,
            image.mime.as_deref(),
            AssetOrigin::Generated(path),
            "miss",
        ))
    }

    pub fn credentials_configured(&self, api_key_override: Option<&str>) -> bool {
        self.generator.has_credentials(api_key_override)
    }

    pub fn read_mask_settings(&self, target: &str) -> MaskLookup {
        self.sidecars.read(target)
    }

    pub fn write_mask_settings(&self, target: &str, settings: &Value) -> Result<PathBuf, SettingsError> {
        self.sidecars.write(target, settings)
    }

    fn error_reply(&self, err: &FetchError) -> ImageReply {
        tracing::warn!(kind = err.kind(), status = err.status_code(), error = %err, "rendering error image");
        let image = self.renderer.render_error(err);
        let mut headers = vec![("content-type".to_string(), image.content_type.to_string())];
        headers.extend(
            image
                .headers()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value)),
        );
        ImageReply {
            status: 200,
            headers,
            body: image.bytes,
        }
    }
}

fn cached_reply(bytes: Vec<u8>, mime: Option<&str>, origin: AssetOrigin, cache: &str) -> AssetReply {
    let content_type = sniff_mime(&bytes)
        .or(mime)
        .unwrap_or(DEFAULT_REFERENCE_MIME)
        .to_string();
    AssetReply {
        bytes,
        content_type,
        headers: vec![
            ("cache-control".to_string(), IMMUTABLE_CACHE_CONTROL.to_string()),
            (CACHE_STATUS_HEADER.to_string(), cache.to_string()),
        ],
        origin,
    }
}
