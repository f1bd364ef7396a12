use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use easel_contracts::sources::{
    base_mime, is_image_mime, is_proxy_allowed_mime, Routes, SourceRef, DEFAULT_REFERENCE_MIME,
};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::redirect::Policy;

use crate::config::EngineConfig;
use crate::error::{FetchError, FetchResult};
use crate::render::ERROR_FLAG_HEADER;
use crate::render::ERROR_MESSAGE_HEADER;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/96.0.4664.110 Safari/537.36";
pub const FORWARD_DEPTH_HEADER: &str = "x-easel-forward-depth";
pub const API_KEY_OVERRIDE_HEADER: &str = "x-gemini-api-key";
pub const PASSTHROUGH_HEADERS: [&str; 5] = [
    "content-type",
    "content-length",
    "expires",
    "cache-control",
    "last-modified",
];

const MAX_REDIRECTS: usize = 10;

/// Per-inbound-request facts that outbound calls may need to carry along.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub authorization: Option<String>,
    pub api_key_override: Option<String>,
    pub forward_depth: u32,
    /// The client already holds a copy (`If-Modified-Since`/`If-None-Match`).
    pub conditional: bool,
}

impl RequestContext {
    pub fn api_key_override(&self) -> Option<&str> {
        self.api_key_override
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBytes {
    pub bytes: Vec<u8>,
    pub mime: String,
}

#[derive(Debug, Clone)]
pub struct ProxiedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// Relayed verbatim, lower-cased names.
    pub headers: Vec<(String, String)>,
}

pub struct ByteSourceResolver {
    http: HttpClient,
    asset_root: PathBuf,
    routes: Routes,
    public_base_url: String,
    max_forward_depth: u32,
    proxy_client_id: Option<String>,
    internal_timeout: Duration,
    max_proxy_bytes: u64,
    max_reference_bytes: u64,
}

impl ByteSourceResolver {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .redirect(Policy::limited(MAX_REDIRECTS))
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .context("failed to build source HTTP client")?;
        Ok(Self {
            http,
            asset_root: config.asset_root.clone(),
            routes: config.routes(),
            public_base_url: config.public_base_url.trim().trim_end_matches('/').to_string(),
            max_forward_depth: config.max_forward_depth,
            proxy_client_id: config
                .proxy_client_id
                .clone()
                .filter(|value| !value.trim().is_empty()),
            internal_timeout: Duration::from_secs(config.internal_timeout_secs),
            max_proxy_bytes: config.max_proxy_bytes,
            max_reference_bytes: config.max_reference_bytes,
        })
    }

    /// Fetches the bytes behind `source`. Never returns partial data.
    pub fn resolve(
        &self,
        source: &SourceRef,
        default_mime: &str,
        ctx: &RequestContext,
    ) -> FetchResult<ResolvedBytes> {
        tracing::debug!(kind = source.kind(), "resolving source");
        match source {
            SourceRef::RemoteUrl(url) => {
                let response = self.get(url, |request| request)?;
                read_resolved(response, url, default_mime, self.max_reference_bytes)
            }
            SourceRef::InternalRequest(relative) => self.resolve_internal(relative, default_mime, ctx),
            SourceRef::LocalPath(raw) => {
                let path = self.local_path(raw)?;
                let bytes = fs::read(&path).map_err(|err| {
                    FetchError::Unavailable(format!("cannot read {}: {err}", path.display()))
                })?;
                let mime = sniff_mime(&bytes)
                    .or_else(|| mime_for_path(&path))
                    .unwrap_or(default_mime)
                    .to_string();
                Ok(ResolvedBytes { bytes, mime })
            }
            SourceRef::InlineData { bytes, mime } => Ok(ResolvedBytes {
                bytes: bytes.clone(),
                mime: mime.clone(),
            }),
        }
    }

    /// Checks that need no I/O, run for every slot before anything is fetched.
    pub fn precheck(&self, source: &SourceRef, ctx: &RequestContext) -> FetchResult<()> {
        match source {
            SourceRef::InlineData { mime, .. } if !is_image_mime(mime) => Err(
                FetchError::InvalidReference(format!("inline reference has type {mime}")),
            ),
            SourceRef::LocalPath(raw) => self.local_path(raw).map(|_| ()),
            SourceRef::InternalRequest(relative) => {
                self.check_depth(ctx)?;
                self.internal_url(relative).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Resolves a reference that feeds a generation; non-image content is
    /// rejected.
    pub fn resolve_reference(
        &self,
        source: &SourceRef,
        ctx: &RequestContext,
    ) -> FetchResult<ResolvedBytes> {
        self.precheck(source, ctx)?;
        let resolved = self.resolve(source, DEFAULT_REFERENCE_MIME, ctx)?;
        if !is_image_mime(&resolved.mime) {
            return Err(FetchError::InvalidReference(format!(
                "{} reference resolved to {}",
                source.kind(),
                resolved.mime
            )));
        }
        Ok(resolved)
    }

    /// Top-level proxy fetch with the restricted image allow-list and header
    /// passthrough.
    pub fn fetch_proxy(&self, url: &str) -> FetchResult<ProxiedImage> {
        let response = self.get(url, |request| match &self.proxy_client_id {
            Some(client_id) => request.query(&[("client_id", client_id.as_str())]),
            None => request,
        })?;

        let mut headers = Vec::new();
        for name in PASSTHROUGH_HEADERS {
            if let Some(value) = response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
            {
                headers.push((name.to_string(), value.to_string()));
            }
        }
        let Some(content_type) = header_value(&headers, "content-type") else {
            return Err(FetchError::InvalidReference(format!(
                "{url} returned no content-type"
            )));
        };
        if !is_proxy_allowed_mime(&content_type) {
            return Err(FetchError::InvalidReference(format!(
                "{url} returned disallowed content-type {content_type}"
            )));
        }

        let bytes = read_capped(response, url, self.max_proxy_bytes)?;
        Ok(ProxiedImage {
            bytes,
            content_type,
            headers,
        })
    }

    fn get(
        &self,
        url: &str,
        customize: impl FnOnce(reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder,
    ) -> FetchResult<HttpResponse> {
        let request = customize(self.http.get(url).header(ACCEPT, "image/*"));
        let response = request
            .send()
            .map_err(|err| FetchError::Unavailable(format!("GET {url} failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Unavailable(format!(
                "GET {url} returned {}",
                status.as_u16()
            )));
        }
        Ok(response)
    }

    fn resolve_internal(
        &self,
        relative: &str,
        default_mime: &str,
        ctx: &RequestContext,
    ) -> FetchResult<ResolvedBytes> {
        self.check_depth(ctx)?;
        let url = self.internal_url(relative)?;
        let depth = (ctx.forward_depth + 1).to_string();
        let response = self.get(&url, |mut request| {
            request = request
                .timeout(self.internal_timeout)
                .header(FORWARD_DEPTH_HEADER, depth.as_str());
            if let Some(authorization) = ctx.authorization.as_deref() {
                request = request.header(AUTHORIZATION, authorization);
            }
            if let Some(api_key) = ctx.api_key_override() {
                request = request.header(API_KEY_OVERRIDE_HEADER, api_key);
            }
            request
        })?;

        // The service answers failures with an error image; surface those as
        // unavailable rather than feeding them to a generation.
        let flagged = response
            .headers()
            .get(ERROR_FLAG_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if flagged {
            let message = response
                .headers()
                .get(ERROR_MESSAGE_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("internal request failed")
                .to_string();
            return Err(FetchError::Unavailable(format!("{relative}: {message}")));
        }
        read_resolved(response, &url, default_mime, self.max_reference_bytes)
    }

    fn check_depth(&self, ctx: &RequestContext) -> FetchResult<()> {
        if ctx.forward_depth >= self.max_forward_depth {
            return Err(FetchError::InvalidInput(format!(
                "internal reference chain exceeds {} hops",
                self.max_forward_depth
            )));
        }
        Ok(())
    }

    /// `image?…`, `./image?…` and `/<mount>/image?…` become absolute URLs on
    /// this service.
    pub fn internal_url(&self, relative: &str) -> FetchResult<String> {
        let trimmed = relative.trim();
        let path = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            let rest = trimmed.strip_prefix("./").unwrap_or(trimmed);
            format!("{}{rest}", self.routes.mount_path)
        };
        if self.public_base_url.is_empty() {
            return Err(FetchError::InvalidInput(
                "internal references need a public base URL".to_string(),
            ));
        }
        Ok(format!("{}{path}", self.public_base_url))
    }

    /// Relative paths hang off the asset root; web-rooted ones must sit under
    /// the mount path.
    pub fn local_path(&self, raw: &str) -> FetchResult<PathBuf> {
        let trimmed = raw.trim();
        let relative = if trimmed.starts_with('/') {
            self.routes.strip_mount(trimmed).ok_or_else(|| {
                FetchError::InvalidInput(format!("{trimmed} is outside the service mount"))
            })?
        } else {
            trimmed.strip_prefix("./").unwrap_or(trimmed)
        };
        if relative.is_empty()
            || relative.contains(['?', '#'])
            || relative.split(['/', '\\']).any(|part| part == "..")
        {
            return Err(FetchError::InvalidInput(format!(
                "unsupported local reference {trimmed}"
            )));
        }
        Ok(self.asset_root.join(relative))
    }
}

fn read_resolved(
    response: HttpResponse,
    url: &str,
    default_mime: &str,
    max_bytes: u64,
) -> FetchResult<ResolvedBytes> {
    let mime = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(base_mime)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_mime.to_string());
    let bytes = read_capped(response, url, max_bytes)?;
    Ok(ResolvedBytes { bytes, mime })
}

/// Reads at most `max_bytes`; anything longer is refused, not truncated.
fn read_capped(response: HttpResponse, url: &str, max_bytes: u64) -> FetchResult<Vec<u8>> {
    let mut bytes = Vec::new();
    response
        .take(max_bytes + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| FetchError::Unavailable(format!("reading {url} failed: {err}")))?;
    if bytes.len() as u64 > max_bytes {
        return Err(FetchError::Unavailable(format!(
            "{url} exceeds the {max_bytes} byte limit"
        )));
    }
    Ok(bytes)
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    image::guess_format(bytes)
        .ok()
        .map(|format| format.to_mime_type())
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        "ico" => Some("image/x-icon"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use easel_contracts::sources::SourceRef;
    use mockito::{Matcher, Server};

    use crate::config::EngineConfig;
    use crate::error::FetchError;
    use crate::test_support::tiny_png;

    use super::{ByteSourceResolver, RequestContext, FORWARD_DEPTH_HEADER};

    fn resolver(asset_root: PathBuf, base_url: &str) -> anyhow::Result<ByteSourceResolver> {
        ByteSourceResolver::new(&EngineConfig {
            asset_root,
            public_base_url: base_url.to_string(),
            ..EngineConfig::default()
        })
    }

    #[test]
    fn remote_mime_comes_from_content_type() -> anyhow::Result<()> {
        let mut server = Server::new();
        let mock = server
            .mock("GET", "/a.webp")
            .match_header("accept", "image/*")
            .match_header("user-agent", Matcher::Regex("Mozilla/5.0".to_string()))
            .with_header("content-type", "image/webp; charset=binary")
            .with_body("webp-bytes")
            .create();
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path().to_path_buf(), "http://unused.test")?;
        let url = format!("{}/a.webp", server.url());
        let resolved = resolver.resolve(
            &SourceRef::RemoteUrl(url),
            "image/png",
            &RequestContext::default(),
        )?;
        assert_eq!(resolved.mime, "image/webp");
        assert_eq!(resolved.bytes, b"webp-bytes");
        mock.assert();
        Ok(())
    }

    #[test]
    fn remote_failure_status_is_unavailable() -> anyhow::Result<()> {
        let mut server = Server::new();
        let _mock = server.mock("GET", "/gone.png").with_status(404).create();
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path().to_path_buf(), "http://unused.test")?;
        let result = resolver.resolve(
            &SourceRef::RemoteUrl(format!("{}/gone.png", server.url())),
            "image/png",
            &RequestContext::default(),
        );
        assert!(matches!(result, Err(FetchError::Unavailable(_))));
        Ok(())
    }

    #[test]
    fn remote_non_image_reference_is_invalid() -> anyhow::Result<()> {
        let mut server = Server::new();
        let _mock = server
            .mock("GET", "/page")
            .with_header("content-type", "text/html")
            .with_body("<html></html>")
            .create();
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path().to_path_buf(), "http://unused.test")?;
        let result = resolver.resolve_reference(
            &SourceRef::RemoteUrl(format!("{}/page", server.url())),
            &RequestContext::default(),
        );
        assert!(matches!(result, Err(FetchError::InvalidReference(_))));
        Ok(())
    }

    #[test]
    fn local_paths_are_sniffed_and_mapped() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let poses = temp.path().join("img").join("poses");
        std::fs::create_dir_all(&poses)?;
        std::fs::write(poses.join("3.dat"), tiny_png([1, 2, 3, 255]))?;
        let resolver = resolver(temp.path().to_path_buf(), "http://unused.test")?;
        let ctx = RequestContext::default();

        let relative = resolver.resolve(
            &SourceRef::LocalPath("img/poses/3.dat".to_string()),
            "image/jpeg",
            &ctx,
        )?;
        assert_eq!(relative.mime, "image/png");

        let rooted = resolver.resolve(
            &SourceRef::LocalPath("/img/poses/3.dat".to_string()),
            "image/jpeg",
            &ctx,
        )?;
        assert_eq!(rooted.bytes, relative.bytes);

        let missing = resolver.resolve(
            &SourceRef::LocalPath("img/poses/404.png".to_string()),
            "image/png",
            &ctx,
        );
        assert!(matches!(missing, Err(FetchError::Unavailable(_))));
        Ok(())
    }

    #[test]
    fn web_rooted_paths_outside_the_mount_are_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = ByteSourceResolver::new(&EngineConfig {
            asset_root: temp.path().to_path_buf(),
            mount_path: "/studio".to_string(),
            ..EngineConfig::default()
        })?;
        assert_eq!(
            resolver.local_path("/studio/img/a.png")?,
            temp.path().join("img/a.png")
        );
        assert!(matches!(
            resolver.local_path("/elsewhere/img/a.png"),
            Err(FetchError::InvalidInput(_))
        ));
        Ok(())
    }

    #[test]
    fn inline_non_image_fails_without_io() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path().to_path_buf(), "http://unused.test")?;
        let inline = SourceRef::InlineData {
            bytes: b"hello".to_vec(),
            mime: "text/plain".to_string(),
        };
        assert!(matches!(
            resolver.resolve_reference(&inline, &RequestContext::default()),
            Err(FetchError::InvalidReference(_))
        ));
        Ok(())
    }

    #[test]
    fn internal_requests_forward_credentials_and_depth() -> anyhow::Result<()> {
        let mut server = Server::new();
        let mock = server
            .mock("GET", Matcher::Regex("^/image".to_string()))
            .match_query(Matcher::UrlEncoded("url".to_string(), "gen://cat".to_string()))
            .match_header("authorization", "Bearer abc")
            .match_header(FORWARD_DEPTH_HEADER, "2")
            .with_header("content-type", "image/png")
            .with_body(tiny_png([0, 0, 0, 255]))
            .create();
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path().to_path_buf(), &server.url())?;
        let ctx = RequestContext {
            authorization: Some("Bearer abc".to_string()),
            forward_depth: 1,
            ..RequestContext::default()
        };
        let resolved = resolver.resolve_reference(
            &SourceRef::InternalRequest("image?url=gen://cat".to_string()),
            &ctx,
        )?;
        assert_eq!(resolved.mime, "image/png");
        mock.assert();
        Ok(())
    }

    #[test]
    fn internal_error_images_are_unavailable() -> anyhow::Result<()> {
        let mut server = Server::new();
        let _mock = server
            .mock("GET", Matcher::Regex("^/image".to_string()))
            .with_header("content-type", "image/png")
            .with_header("x-error", "true")
            .with_header("x-error-message", "upstream down")
            .with_body(tiny_png([255, 0, 0, 255]))
            .create();
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path().to_path_buf(), &server.url())?;
        let result = resolver.resolve_reference(
            &SourceRef::InternalRequest("/image?url=gen://cat".to_string()),
            &RequestContext::default(),
        );
        match result {
            Err(FetchError::Unavailable(message)) => assert!(message.contains("upstream down")),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn internal_chain_depth_is_capped() -> anyhow::Result<()> {
        let mut server = Server::new();
        let mock = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create();
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path().to_path_buf(), &server.url())?;
        let ctx = RequestContext {
            forward_depth: EngineConfig::default().max_forward_depth,
            ..RequestContext::default()
        };
        let result = resolver.resolve_reference(
            &SourceRef::InternalRequest("image?url=gen://cat".to_string()),
            &ctx,
        );
        match result {
            Err(FetchError::InvalidInput(message)) => assert!(message.contains("exceeds 4 hops")),
            other => panic!("unexpected {other:?}"),
        }
        mock.assert();
        Ok(())
    }

    #[test]
    fn internal_requests_wait_past_the_source_timeout() -> anyhow::Result<()> {
        let mut server = Server::new();
        let png = tiny_png([9, 9, 9, 255]);
        let _mock = server
            .mock("GET", Matcher::Regex("^/image".to_string()))
            .with_header("content-type", "image/png")
            .with_chunked_body(move |writer| {
                std::thread::sleep(std::time::Duration::from_secs(2));
                writer.write_all(&png)
            })
            .create();
        let temp = tempfile::tempdir()?;
        let resolver = ByteSourceResolver::new(&EngineConfig {
            asset_root: temp.path().to_path_buf(),
            public_base_url: server.url(),
            fetch_timeout_secs: 1,
            internal_timeout_secs: 10,
            ..EngineConfig::default()
        })?;
        let resolved = resolver.resolve_reference(
            &SourceRef::InternalRequest("image?url=gen://cat".to_string()),
            &RequestContext::default(),
        )?;
        assert_eq!(resolved.bytes, tiny_png([9, 9, 9, 255]));
        Ok(())
    }

    #[test]
    fn oversized_reference_bodies_are_refused() -> anyhow::Result<()> {
        let mut server = Server::new();
        let _mock = server
            .mock("GET", "/huge.png")
            .with_header("content-type", "image/png")
            .with_body(vec![1u8; 128])
            .create();
        let temp = tempfile::tempdir()?;
        let resolver = ByteSourceResolver::new(&EngineConfig {
            asset_root: temp.path().to_path_buf(),
            max_reference_bytes: 64,
            ..EngineConfig::default()
        })?;
        let result = resolver.resolve_reference(
            &SourceRef::RemoteUrl(format!("{}/huge.png", server.url())),
            &RequestContext::default(),
        );
        match result {
            Err(FetchError::Unavailable(message)) => assert!(message.contains("64 byte limit")),
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn internal_url_rewrites_against_mount() -> anyhow::Result<()> {
        let resolver = ByteSourceResolver::new(&EngineConfig {
            public_base_url: "https://studio.test/".to_string(),
            mount_path: "app".to_string(),
            ..EngineConfig::default()
        })?;
        assert_eq!(
            resolver.internal_url("./image?url=gen://a")?,
            "https://studio.test/app/image?url=gen://a"
        );
        assert_eq!(
            resolver.internal_url("/app/image?url=gen://a")?,
            "https://studio.test/app/image?url=gen://a"
        );
        Ok(())
    }

    #[test]
    fn proxy_relays_headers_and_appends_client_id() -> anyhow::Result<()> {
        let mut server = Server::new();
        let mock = server
            .mock("GET", Matcher::Regex("^/photo".to_string()))
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("w".to_string(), "400".to_string()),
                Matcher::UrlEncoded("client_id".to_string(), "abc".to_string()),
            ]))
            .with_header("content-type", "image/jpeg")
            .with_header("cache-control", "max-age=60")
            .with_header("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT")
            .with_header("x-internal", "dropped")
            .with_body("jpeg-bytes")
            .create();
        let temp = tempfile::tempdir()?;
        let resolver = ByteSourceResolver::new(&EngineConfig {
            asset_root: temp.path().to_path_buf(),
            proxy_client_id: Some("abc".to_string()),
            ..EngineConfig::default()
        })?;
        let proxied = resolver.fetch_proxy(&format!("{}/photo?w=400", server.url()))?;
        assert_eq!(proxied.content_type, "image/jpeg");
        assert_eq!(proxied.bytes, b"jpeg-bytes");
        let names: Vec<&str> = proxied.headers.iter().map(|(name, _)| name.as_str()).collect();
        assert!(names.contains(&"cache-control"));
        assert!(names.contains(&"last-modified"));
        assert!(!names.contains(&"x-internal"));
        mock.assert();
        Ok(())
    }

    #[test]
    fn proxy_rejects_disallowed_or_missing_types() -> anyhow::Result<()> {
        let mut server = Server::new();
        let _html = server
            .mock("GET", "/page")
            .with_header("content-type", "text/html")
            .with_body("<html>")
            .create();
        let _tiff = server
            .mock("GET", "/scan")
            .with_header("content-type", "image/tiff")
            .with_body("tiff")
            .create();
        let temp = tempfile::tempdir()?;
        let resolver = resolver(temp.path().to_path_buf(), "http://unused.test")?;
        for path in ["/page", "/scan"] {
            let result = resolver.fetch_proxy(&format!("{}{path}", server.url()));
            assert!(matches!(result, Err(FetchError::InvalidReference(_))), "{path}");
        }
        Ok(())
    }

    #[test]
    fn proxy_enforces_size_cap() -> anyhow::Result<()> {
        let mut server = Server::new();
        let _mock = server
            .mock("GET", "/big.png")
            .with_header("content-type", "image/png")
            .with_body(vec![7u8; 64])
            .create();
        let temp = tempfile::tempdir()?;
        let resolver = ByteSourceResolver::new(&EngineConfig {
            asset_root: temp.path().to_path_buf(),
            max_proxy_bytes: 32,
            ..EngineConfig::default()
        })?;
        let result = resolver.fetch_proxy(&format!("{}/big.png", server.url()));
        assert!(matches!(result, Err(FetchError::Unavailable(_))));
        Ok(())
    }
}
