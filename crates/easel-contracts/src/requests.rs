use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::sources::{ReferenceRole, Routes, SourceRef};

pub const SLUG_MAX_CHARS: usize = 80;
pub const HASH_PREFIX_LEN: usize = 10;
pub const ASSET_EXTENSION: &str = "png";

const GENERATION_SCHEMES: [&str; 2] = ["gen://", "gemini://"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetCategory {
    Background,
    Pose,
    Object,
}

impl AssetCategory {
    pub const ALL: [AssetCategory; 3] = [
        AssetCategory::Background,
        AssetCategory::Pose,
        AssetCategory::Object,
    ];

    /// A pose reference always wins; otherwise `kind=object(s)` selects
    /// objects and everything else lands in backgrounds.
    pub fn derive(has_pose: bool, kind: Option<&str>) -> Self {
        if has_pose {
            return AssetCategory::Pose;
        }
        let kind = kind.map(|value| value.trim().to_ascii_lowercase());
        match kind.as_deref() {
            Some("object") | Some("objects") => AssetCategory::Object,
            _ => AssetCategory::Background,
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            AssetCategory::Background => "backgrounds",
            AssetCategory::Pose => "poses",
            AssetCategory::Object => "objects",
        }
    }

    pub fn thumbs_dir_name(self) -> &'static str {
        match self {
            AssetCategory::Background => "backgrounds_thumbs",
            AssetCategory::Pose => "poses_thumbs",
            AssetCategory::Object => "objects_thumbs",
        }
    }

    pub fn default_aspect_ratio(self) -> &'static str {
        match self {
            AssetCategory::Pose => "9:16",
            AssetCategory::Background | AssetCategory::Object => "16:9",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    prompt: String,
    pose_reference: Option<SourceRef>,
    references: [Option<SourceRef>; 4],
    category: AssetCategory,
    aspect_ratio: String,
}

impl GenerationRequest {
    pub fn new(
        prompt: impl Into<String>,
        pose_reference: Option<SourceRef>,
        references: impl IntoIterator<Item = (ReferenceRole, SourceRef)>,
        kind: Option<&str>,
        aspect_override: Option<&str>,
    ) -> Self {
        let mut slots: [Option<SourceRef>; 4] = Default::default();
        for (role, source) in references {
            slots[role.index()] = Some(source);
        }
        let category = AssetCategory::derive(pose_reference.is_some(), kind);
        let aspect_ratio = aspect_override
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(category.default_aspect_ratio())
            .to_string();
        Self {
            prompt: prompt.into(),
            pose_reference,
            references: slots,
            category,
            aspect_ratio,
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn pose_reference(&self) -> Option<&SourceRef> {
        self.pose_reference.as_ref()
    }

    pub fn reference(&self, role: ReferenceRole) -> Option<&SourceRef> {
        self.references[role.index()].as_ref()
    }

    /// Present auxiliary references in fixed role order.
    pub fn references(&self) -> impl Iterator<Item = (ReferenceRole, &SourceRef)> + '_ {
        ReferenceRole::ORDERED
            .into_iter()
            .filter_map(move |role| self.reference(role).map(|source| (role, source)))
    }

    pub fn category(&self) -> AssetCategory {
        self.category
    }

    pub fn aspect_ratio(&self) -> &str {
        &self.aspect_ratio
    }

    pub fn is_pose_generation(&self) -> bool {
        self.pose_reference.is_some()
    }

    /// `prompt|pose|bg_value|bg_data|pose_value|pose_data|...`, hash input only.
    pub fn canonical_serialization(&self) -> String {
        let mut parts = vec![
            self.prompt.clone(),
            self.pose_reference
                .as_ref()
                .map(SourceRef::pose_identity)
                .unwrap_or_default(),
        ];
        for role in ReferenceRole::ORDERED {
            let (value, data) = self
                .reference(role)
                .map(SourceRef::identity)
                .unwrap_or_default();
            parts.push(format!("{value}|{data}"));
        }
        parts.join("|")
    }

    pub fn slug(&self) -> String {
        let prefix = self
            .pose_reference
            .as_ref()
            .and_then(pose_slug_prefix)
            .unwrap_or_default();
        format!("{prefix}{}", slugify(&self.prompt))
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::derive(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub digest: String,
    pub hash10: String,
    pub slug: String,
}

impl CacheKey {
    pub fn derive(request: &GenerationRequest) -> Self {
        let digest = sha1_hex(&request.canonical_serialization());
        Self {
            hash10: digest[..HASH_PREFIX_LEN].to_string(),
            digest,
            slug: request.slug(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}--{}.{ASSET_EXTENSION}", self.slug, self.hash10)
    }

    pub fn hash_suffix(&self) -> String {
        format!("--{}.{ASSET_EXTENSION}", self.hash10)
    }
}

pub fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.to_lowercase().chars() {
        let keep = ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '-' | '_' | '.');
        let next = if keep { ch } else { '-' };
        if next == '-' && out.ends_with('-') {
            continue;
        }
        out.push(next);
    }
    let trimmed = trim_slug(&out);
    let truncated: String = trimmed.chars().take(SLUG_MAX_CHARS).collect();
    let slug = trim_slug(&truncated);
    if slug.is_empty() {
        "image".to_string()
    } else {
        slug.to_string()
    }
}

fn trim_slug(value: &str) -> &str {
    value.trim_matches(|ch| matches!(ch, '-' | '.' | '_'))
}

/// `pose<N>-` for references to numbered library poses such as
/// `img/poses/12.png`.
pub fn pose_slug_prefix(pose: &SourceRef) -> Option<String> {
    let raw = pose.reference()?;
    let path = raw.split(['?', '#']).next().unwrap_or_default();
    let mut segments = path.rsplit('/');
    let file = segments.next()?;
    if segments.next()? != "poses" {
        return None;
    }
    let (stem, ext) = file.rsplit_once('.')?;
    if !ext.eq_ignore_ascii_case(ASSET_EXTENSION) {
        return None;
    }
    if stem.is_empty() || !stem.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    Some(format!("pose{stem}-"))
}

#[derive(Debug)]
pub enum FetchTarget {
    Proxy(String),
    Generate(GenerationRequest),
}

/// Raw entry-point parameters as received on the query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageParams {
    params: BTreeMap<String, String>,
}

impl ImageParams {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let params = pairs
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        Self { params }
    }

    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        Self::from_pairs(
            query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                    (form_decode(key), form_decode(value))
                }),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Untrimmed value; base64 payloads may legitimately start or end with
    /// what query decoding turned into a space.
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn target(&self, routes: &Routes) -> Result<FetchTarget> {
        let Some(url) = self.get("url") else {
            bail!("missing url parameter");
        };
        let lowered = url.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            return Ok(FetchTarget::Proxy(url.to_string()));
        }
        match generation_prompt(url) {
            Some(prompt) => Ok(FetchTarget::Generate(
                self.generation_request(prompt, routes)?,
            )),
            None => bail!("unsupported url scheme"),
        }
    }

    pub fn generation_request(&self, prompt: String, routes: &Routes) -> Result<GenerationRequest> {
        if prompt.trim().is_empty() {
            bail!("empty generation prompt");
        }
        let pose = self.source_for("pose", routes)?;
        let mut references = Vec::new();
        for role in ReferenceRole::ORDERED {
            if let Some(source) = self.source_for(role.param_key(), routes)? {
                references.push((role, source));
            }
        }
        let aspect = self.get("aspect").or_else(|| self.get("aspect_ratio"));
        Ok(GenerationRequest::new(
            prompt,
            pose,
            references,
            self.get("kind"),
            aspect,
        ))
    }

    fn source_for(&self, key: &str, routes: &Routes) -> Result<Option<SourceRef>> {
        if let Some(raw) = self.get_raw(key) {
            return SourceRef::parse(raw, routes).map(Some);
        }
        let data_key = format!("{key}_data");
        let mime_key = format!("{key}_mime");
        match self.get_raw(&data_key) {
            Some(data) => SourceRef::inline(data, self.get(&mime_key)).map(Some),
            None => Ok(None),
        }
    }
}

/// Extracts the prompt from `gen://…` (or the legacy `gemini://…`).
pub fn generation_prompt(url: &str) -> Option<String> {
    let lowered = url.to_ascii_lowercase();
    let scheme = GENERATION_SCHEMES
        .iter()
        .find(|scheme| lowered.starts_with(*scheme))?;
    Some(form_decode(&url[scheme.len()..]))
}

fn form_decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned()
}
