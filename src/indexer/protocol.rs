//! Protocol-specific behaviour
//!
//! Each [`Protocol`] has a handler that knows how to rank, reject and describe
//! releases of that kind.

use super::types::{Protocol, ProtocolInfo, ReleaseInfo};

pub trait ProtocolHandler: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Additive ranking adjustment for a release
    fn score_adjustment(&self, release: &ReleaseInfo) -> i32;

    /// Reason to drop the release, if any
    fn should_reject(&self, release: &ReleaseInfo) -> Option<String>;

    /// Short human-readable summary (e.g. "42 seeders, freeleech")
    fn display_info(&self, release: &ReleaseInfo) -> String;
}

pub struct TorrentHandler;
pub struct UsenetHandler;
pub struct StreamingHandler;

static TORRENT: TorrentHandler = TorrentHandler;
static USENET: UsenetHandler = UsenetHandler;
static STREAMING: StreamingHandler = StreamingHandler;

/// Handler for a protocol tag
pub fn handler_for(protocol: Protocol) -> &'static dyn ProtocolHandler {
    match protocol {
        Protocol::Torrent => &TORRENT,
        Protocol::Usenet => &USENET,
        Protocol::Streaming => &STREAMING,
    }
}

impl ProtocolHandler for TorrentHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Torrent
    }

    fn score_adjustment(&self, release: &ReleaseInfo) -> i32 {
        let Some(t) = release.torrent() else {
            return 0;
        };
        let mut score = match t.seeders.unwrap_or(0) {
            0 => -50,
            1..=4 => -10,
            5..=49 => 0,
            50..=499 => 10,
            _ => 20,
        };
        if t.download_volume_factor == 0.0 {
            score += 15;
        } else if t.download_volume_factor < 1.0 {
            score += 5;
        }
        if t.upload_volume_factor > 1.0 {
            score += 5;
        }
        score
    }

    fn should_reject(&self, release: &ReleaseInfo) -> Option<String> {
        if release.link.is_none() && release.magnet_uri.is_none() {
            return Some("no download link or magnet".to_string());
        }
        match release.torrent() {
            Some(t) if t.seeders == Some(0) => Some("no seeders".to_string()),
            _ => None,
        }
    }

    fn display_info(&self, release: &ReleaseInfo) -> String {
        let Some(t) = release.torrent() else {
            return String::new();
        };
        let mut parts = vec![format!("{} seeders", t.seeders.unwrap_or(0))];
        if let Some(l) = t.leechers {
            parts.push(format!("{} leechers", l));
        }
        if t.download_volume_factor == 0.0 {
            parts.push("freeleech".to_string());
        }
        parts.join(", ")
    }
}

impl ProtocolHandler for UsenetHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Usenet
    }

    fn score_adjustment(&self, release: &ReleaseInfo) -> i32 {
        let Some(u) = release.usenet() else {
            return 0;
        };
        let mut score = 0;
        match u.completion {
            Some(c) if c >= 100.0 => score += 10,
            Some(c) if c < 95.0 => score -= 30,
            _ => {}
        }
        if u.password_protected {
            score -= 100;
        }
        score
    }

    fn should_reject(&self, release: &ReleaseInfo) -> Option<String> {
        if release.link.is_none() {
            return Some("no nzb link".to_string());
        }
        match release.usenet() {
            Some(u) if u.password_protected => Some("password protected".to_string()),
            _ => None,
        }
    }

    fn display_info(&self, release: &ReleaseInfo) -> String {
        let Some(u) = release.usenet() else {
            return String::new();
        };
        let mut parts = Vec::new();
        if let Some(ref g) = u.group {
            parts.push(g.clone());
        }
        if let Some(c) = u.completion {
            parts.push(format!("{:.0}% complete", c));
        }
        if u.password_protected {
            parts.push("passworded".to_string());
        }
        parts.join(", ")
    }
}

impl ProtocolHandler for StreamingHandler {
    fn protocol(&self) -> Protocol {
        Protocol::Streaming
    }

    fn score_adjustment(&self, release: &ReleaseInfo) -> i32 {
        match &release.protocol_info {
            ProtocolInfo::Streaming(s) => match s.quality.as_deref().map(str::to_lowercase) {
                Some(q) if q.contains("2160") || q.contains("4k") => 20,
                Some(q) if q.contains("1080") => 10,
                Some(q) if q.contains("480") || q.contains("cam") => -20,
                _ => 0,
            },
            _ => 0,
        }
    }

    fn should_reject(&self, release: &ReleaseInfo) -> Option<String> {
        if release.link.is_none() && release.details.is_none() {
            return Some("no stream link".to_string());
        }
        None
    }

    fn display_info(&self, release: &ReleaseInfo) -> String {
        match &release.protocol_info {
            ProtocolInfo::Streaming(s) => [s.quality.as_deref(), s.provider.as_deref()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" via "),
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_torrent_handler() {
        let mut r = ReleaseInfo::default();
        r.link = Some("http://x/dl".into());
        let t = r.torrent_mut().unwrap();
        t.seeders = Some(100);
        t.download_volume_factor = 0.0;
        let h = handler_for(Protocol::Torrent);
        assert_eq!(h.score_adjustment(&r), 25);
        assert_eq!(h.should_reject(&r), None);
        assert_eq!(h.display_info(&r), "100 seeders, freeleech");

        r.torrent_mut().unwrap().seeders = Some(0);
        assert_eq!(h.should_reject(&r).as_deref(), Some("no seeders"));
    }

    #[test]
    fn test_usenet_rejects_passworded() {
        let mut r = ReleaseInfo::for_protocol(Protocol::Usenet, "t".into(), "g".into(), Utc::now());
        r.link = Some("http://x/nzb".into());
        r.usenet_mut().unwrap().password_protected = true;
        let h = handler_for(Protocol::Usenet);
        assert!(h.should_reject(&r).is_some());
        assert!(h.score_adjustment(&r) < 0);
    }

    #[test]
    fn test_streaming_display() {
        let mut r =
            ReleaseInfo::for_protocol(Protocol::Streaming, "t".into(), "g".into(), Utc::now());
        let s = r.streaming_mut().unwrap();
        s.quality = Some("1080p".into());
        s.provider = Some("Example".into());
        let h = handler_for(Protocol::Streaming);
        assert_eq!(h.display_info(&r), "1080p via Example");
        assert_eq!(h.score_adjustment(&r), 10);
    }
}
