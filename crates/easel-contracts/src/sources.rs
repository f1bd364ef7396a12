use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub const DEFAULT_REFERENCE_MIME: &str = "image/png";

const PROXY_ALLOWED_MIMES: [&str; 6] = [
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/gif",
    "image/webp",
    "image/svg+xml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceRole {
    Background,
    Pose,
    Second,
    Third,
}

impl ReferenceRole {
    pub const ORDERED: [ReferenceRole; 4] = [
        ReferenceRole::Background,
        ReferenceRole::Pose,
        ReferenceRole::Second,
        ReferenceRole::Third,
    ];

    pub fn param_key(self) -> &'static str {
        match self {
            ReferenceRole::Background => "ref_background",
            ReferenceRole::Pose => "ref_pose",
            ReferenceRole::Second => "ref_second",
            ReferenceRole::Third => "ref_third",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ReferenceRole::Background => "background",
            ReferenceRole::Pose => "pose",
            ReferenceRole::Second => "second",
            ReferenceRole::Third => "third",
        }
    }

    pub fn index(self) -> usize {
        match self {
            ReferenceRole::Background => 0,
            ReferenceRole::Pose => 1,
            ReferenceRole::Second => 2,
            ReferenceRole::Third => 3,
        }
    }
}

/// Where the service itself is reachable, used to tell self-referential
/// requests apart from plain local paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routes {
    pub mount_path: String,
    pub image_endpoint: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            mount_path: "/".to_string(),
            image_endpoint: "image".to_string(),
        }
    }
}

impl Routes {
    pub fn new(mount_path: &str, image_endpoint: &str) -> Self {
        let trimmed = mount_path.trim().trim_matches('/');
        let mount_path = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        };
        Self {
            mount_path,
            image_endpoint: image_endpoint.trim().trim_matches('/').to_string(),
        }
    }

    /// Strips the mount prefix from a web-rooted path. Returns `None` when the
    /// path lives outside the mount.
    pub fn strip_mount<'a>(&self, web_path: &'a str) -> Option<&'a str> {
        if self.mount_path == "/" {
            return web_path.strip_prefix('/');
        }
        web_path.strip_prefix(self.mount_path.as_str())
    }

    pub fn is_internal_request(&self, raw: &str) -> bool {
        let needle = format!("{}?", self.image_endpoint);
        let candidate = raw.strip_prefix("./").unwrap_or(raw);
        if candidate.starts_with(&needle) {
            return true;
        }
        if candidate.starts_with('/') {
            return self
                .strip_mount(candidate)
                .map(|rest| rest.starts_with(&needle))
                .unwrap_or(false);
        }
        false
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum SourceRef {
    RemoteUrl(String),
    InternalRequest(String),
    LocalPath(String),
    InlineData { bytes: Vec<u8>, mime: String },
}

impl std::fmt::Debug for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceRef::RemoteUrl(url) => f.debug_tuple("RemoteUrl").field(url).finish(),
            SourceRef::InternalRequest(url) => {
                f.debug_tuple("InternalRequest").field(url).finish()
            }
            SourceRef::LocalPath(path) => f.debug_tuple("LocalPath").field(path).finish(),
            SourceRef::InlineData { bytes, mime } => f
                .debug_struct("InlineData")
                .field("mime", mime)
                .field("len", &bytes.len())
                .finish(),
        }
    }
}

impl SourceRef {
    /// Classifies a caller-supplied reference string.
    /// Trailing whitespace is kept for `data:` URLs, where it is a `+` that
    /// query decoding turned into a space.
    pub fn parse(raw: &str, routes: &Routes) -> Result<Self> {
        let leading = raw.trim_start();
        let trimmed = leading.trim_end();
        if trimmed.is_empty() {
            bail!("empty reference");
        }
        let lowered = trimmed.to_ascii_lowercase();
        if lowered.starts_with("data:") {
            return Self::from_data_url(leading);
        }
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            return Ok(SourceRef::RemoteUrl(trimmed.to_string()));
        }
        if routes.is_internal_request(trimmed) {
            return Ok(SourceRef::InternalRequest(trimmed.to_string()));
        }
        // Only the path part can carry a scheme; query values such as
        // `url=gen://…` are opaque here.
        let path = trimmed.split(['?', '#']).next().unwrap_or_default();
        if path.contains("://") {
            bail!("unsupported reference scheme: {}", scheme_of(path));
        }
        if has_parent_component(trimmed) {
            bail!("reference path escapes the asset root: {trimmed}");
        }
        Ok(SourceRef::LocalPath(trimmed.to_string()))
    }

    /// Builds an inline reference from a base64 payload. Query-string decoding
    /// turns `+` into spaces, so those are restored first.
    pub fn inline(data: &str, mime: Option<&str>) -> Result<Self> {
        let cleaned: String = data
            .chars()
            .map(|ch| if ch == ' ' { '+' } else { ch })
            .filter(|ch| !ch.is_ascii_whitespace())
            .collect();
        let bytes = BASE64
            .decode(cleaned.as_bytes())
            .context("inline reference is not valid base64")?;
        if bytes.is_empty() {
            bail!("inline reference is empty");
        }
        let mime = mime
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_REFERENCE_MIME)
            .to_ascii_lowercase();
        Ok(SourceRef::InlineData { bytes, mime })
    }

    pub fn from_data_url(raw: &str) -> Result<Self> {
        let body = raw
            .get(5..)
            .ok_or_else(|| anyhow!("malformed data URL"))?;
        let (header, payload) = body
            .split_once(',')
            .ok_or_else(|| anyhow!("malformed data URL"))?;
        let Some(mime) = header.strip_suffix(";base64") else {
            bail!("data URL must be base64 encoded");
        };
        Self::inline(payload, Some(mime))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceRef::RemoteUrl(_) => "remote",
            SourceRef::InternalRequest(_) => "internal",
            SourceRef::LocalPath(_) => "local",
            SourceRef::InlineData { .. } => "inline",
        }
    }

    /// The string the caller used, for anything but inline payloads.
    pub fn reference(&self) -> Option<&str> {
        match self {
            SourceRef::RemoteUrl(value)
            | SourceRef::InternalRequest(value)
            | SourceRef::LocalPath(value) => Some(value.as_str()),
            SourceRef::InlineData { .. } => None,
        }
    }

    /// `(value-or-mime, payload-or-empty)` as it enters the cache key.
    pub fn identity(&self) -> (String, String) {
        match self {
            SourceRef::InlineData { bytes, mime } => (mime.clone(), BASE64.encode(bytes)),
            other => (other.reference().unwrap_or_default().to_string(), String::new()),
        }
    }

    /// Single-field identity used for the pose slot of the cache key.
    pub fn pose_identity(&self) -> String {
        match self {
            SourceRef::InlineData { bytes, mime } => {
                format!("data:{mime};base64,{}", BASE64.encode(bytes))
            }
            other => other.reference().unwrap_or_default().to_string(),
        }
    }
}

pub fn base_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn is_image_mime(content_type: &str) -> bool {
    let base = base_mime(content_type);
    base.starts_with("image/") && base.len() > "image/".len()
}

pub fn is_proxy_allowed_mime(content_type: &str) -> bool {
    let base = base_mime(content_type);
    if PROXY_ALLOWED_MIMES.contains(&base.as_str()) {
        return true;
    }
    base.starts_with("image/") && base.contains("icon")
}

fn scheme_of(raw: &str) -> &str {
    raw.split("://").next().unwrap_or_default()
}

fn has_parent_component(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split(['/', '\\']).any(|segment| segment == "..")
}
