//! Detection of anti-bot interstitials (Cloudflare, DDoS-Guard)

use reqwest::header::{HeaderMap, SERVER, SET_COOKIE};

/// Which protection served the challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Cloudflare,
    DdosGuard,
}

const CLOUDFLARE_BODY_MARKERS: &[&str] = &[
    "Just a moment...",
    "cf-browser-verification",
    "Attention Required! | Cloudflare",
    "Attention Required",
    "cf_chl_opt",
];

const DDOS_GUARD_BODY_MARKERS: &[&str] = &["DDoS-Guard", "ddos-guard.net"];

/// Inspect a response for a challenge page.
///
/// Only 403 and 503 responses qualify; the body or headers must also carry
/// a known marker.
pub fn detect(status: u16, headers: &HeaderMap, body: &[u8]) -> Option<ChallengeKind> {
    if status != 403 && status != 503 {
        return None;
    }

    let server = headers
        .get(SERVER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    // Only the head of the page carries the markers
    let head = &body[..body.len().min(64 * 1024)];
    let text = String::from_utf8_lossy(head);

    if server.contains("ddos-guard") || DDOS_GUARD_BODY_MARKERS.iter().any(|m| text.contains(m)) {
        return Some(ChallengeKind::DdosGuard);
    }

    let cf_header = headers.keys().any(|k| k.as_str().starts_with("cf-"));
    let cf_cookie = headers.get_all(SET_COOKIE).iter().any(|v| {
        v.to_str()
            .map(|s| s.starts_with("__cf") || s.starts_with("cf_"))
            .unwrap_or(false)
    });
    let cf_body = CLOUDFLARE_BODY_MARKERS.iter().any(|m| text.contains(m));

    if cf_body || ((cf_header || cf_cookie) && server.contains("cloudflare")) {
        return Some(ChallengeKind::Cloudflare);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn cf_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(SERVER, HeaderValue::from_static("cloudflare"));
        h.insert("cf-ray", HeaderValue::from_static("abc-LHR"));
        h
    }

    #[test]
    fn test_cloudflare_body_marker() {
        let body = b"<html><title>Just a moment...</title></html>";
        assert_eq!(
            detect(503, &HeaderMap::new(), body),
            Some(ChallengeKind::Cloudflare)
        );
    }

    #[test]
    fn test_cloudflare_headers_without_marker() {
        assert_eq!(
            detect(403, &cf_headers(), b"denied"),
            Some(ChallengeKind::Cloudflare)
        );
    }

    #[test]
    fn test_ddos_guard() {
        let mut h = HeaderMap::new();
        h.insert(SERVER, HeaderValue::from_static("ddos-guard"));
        assert_eq!(detect(403, &h, b""), Some(ChallengeKind::DdosGuard));
    }

    #[test]
    fn test_ordinary_responses_not_flagged() {
        let body = b"<html><title>Just a moment...</title></html>";
        assert_eq!(detect(200, &cf_headers(), body), None);
        assert_eq!(detect(503, &HeaderMap::new(), b"Service Unavailable"), None);
        assert_eq!(detect(404, &cf_headers(), b""), None);
    }
}
