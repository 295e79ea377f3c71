//! Return URL handling.
//!
//! Return URLs travel in the `r` query parameter as unpadded base64url so they survive
//! any further URL encoding. They are checked against the site origin before use.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use url::Url;

pub const MAX_RETURN_URL_LEN: usize = 2048;

pub fn encode_return_param(return_url: &str) -> String {
    URL_SAFE_NO_PAD.encode(return_url.as_bytes())
}

/// Decode an `r` parameter. Empty, non-base64url or non-UTF-8 input yields `None`.
pub fn decode_return_param(param: &str) -> Option<String> {
    let param = param.trim().trim_end_matches('=');
    if param.is_empty() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(param).ok()?;
    String::from_utf8(bytes).ok().filter(|url| !url.is_empty())
}

/// Accept `candidate` only if it points back into the site.
///
/// Allowed are absolute paths (`/account`, not `//host`) and absolute URLs with the
/// same origin as `site_url`. Fragments are dropped.
pub fn sanitize_return_url(site_url: &str, candidate: &str) -> Option<String> {
    let candidate = candidate
        .split_once('#')
        .map(|(head, _)| head)
        .unwrap_or(candidate)
        .trim();

    if candidate.is_empty() || candidate.len() > MAX_RETURN_URL_LEN || candidate.contains('\\')
    {
        return None;
    }

    if candidate.starts_with('/') {
        if candidate.starts_with("//") || candidate.contains("://") {
            return None;
        }
        return Some(candidate.to_string());
    }

    let site = Url::parse(site_url).ok()?;
    let target = Url::parse(candidate).ok()?;
    (target.origin() == site.origin()).then(|| candidate.to_string())
}

/// URL of the logout endpoint, optionally carrying where to go afterwards.
pub fn logout_url(site_url: &str, return_url: Option<&str>) -> String {
    let mut url = format!("{}/vipps/logout", site_url.trim_end_matches('/'));
    if let Some(return_url) = return_url.filter(|r| !r.is_empty()) {
        url.push_str("?r=");
        url.push_str(&encode_return_param(return_url));
    }
    url
}
