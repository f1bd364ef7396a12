use crate::requests::{generation_prompt, GenerationRequest, ImageParams, ASSET_EXTENSION};
use crate::sources::Routes;

/// What a mask-settings read or write refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsTarget {
    /// Asset-root relative path of an existing image.
    LocalAsset(String),
    /// An entry-point request whose cached output carries the settings.
    Generation(GenerationRequest),
}

/// Maps a caller-supplied target onto a [`SettingsTarget`]. Anything that
/// cannot be mapped with certainty yields `None`.
pub fn parse_settings_target(
    raw: &str,
    routes: &Routes,
    local_prefixes: &[String],
) -> Option<SettingsTarget> {
    let target = raw.trim();
    if target.is_empty() {
        return None;
    }
    let target = target.strip_prefix("./").unwrap_or(target);

    if let Some(local) = local_asset(target, routes, local_prefixes) {
        return Some(SettingsTarget::LocalAsset(local));
    }

    let query = endpoint_query(target, &routes.image_endpoint)?;
    let params = ImageParams::from_query(query);
    let prompt = generation_prompt(params.get("url")?)?;
    params
        .generation_request(prompt, routes)
        .ok()
        .map(SettingsTarget::Generation)
}

fn local_asset(target: &str, routes: &Routes, local_prefixes: &[String]) -> Option<String> {
    let relative = if target.starts_with('/') {
        routes.strip_mount(target)?
    } else {
        target
    };
    let allowed = local_prefixes
        .iter()
        .any(|prefix| relative.starts_with(prefix.as_str()));
    if !allowed {
        return None;
    }
    if relative.contains(['?', '#', '\\']) || relative.split('/').any(|part| part == "..") {
        return None;
    }
    let (_, ext) = relative.rsplit_once('.')?;
    if !ext.eq_ignore_ascii_case(ASSET_EXTENSION) {
        return None;
    }
    Some(relative.to_string())
}

fn endpoint_query<'a>(target: &'a str, endpoint: &str) -> Option<&'a str> {
    let needle = format!("{endpoint}?");
    target.match_indices(&needle).find_map(|(idx, _)| {
        let at_boundary = idx == 0 || target[..idx].ends_with('/');
        at_boundary.then(|| &target[idx + needle.len()..])
    })
}
