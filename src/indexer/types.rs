//! Core types for the indexer system
//!
//! These types follow Torznab conventions as used by Jackett and Prowlarr.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::categories::CategoryMapping;

/// The content protocol a definition serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Torrent,
    Usenet,
    Streaming,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Torrent => write!(f, "torrent"),
            Protocol::Usenet => write!(f, "usenet"),
            Protocol::Streaming => write!(f, "streaming"),
        }
    }
}

/// Privacy level of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TrackerType {
    #[default]
    Public,
    SemiPrivate,
    Private,
}

impl TrackerType {
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(|s| s.to_lowercase()).as_deref() {
            Some("private") => TrackerType::Private,
            Some("semi-private") | Some("semiprivate") => TrackerType::SemiPrivate,
            _ => TrackerType::Public,
        }
    }
}

impl std::fmt::Display for TrackerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerType::Public => write!(f, "public"),
            TrackerType::SemiPrivate => write!(f, "semi-private"),
            TrackerType::Private => write!(f, "private"),
        }
    }
}

/// Type of search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// General text search
    #[default]
    Basic,
    Movie,
    /// TV show search (supports season/episode)
    Tv,
    Music,
    Book,
}

impl SearchType {
    /// Name of the `caps.modes` entry that governs this search type
    pub fn mode_name(&self) -> &'static str {
        match self {
            SearchType::Basic => "search",
            SearchType::Movie => "movie-search",
            SearchType::Tv => "tv-search",
            SearchType::Music => "music-search",
            SearchType::Book => "book-search",
        }
    }

    /// Torznab `t=` value
    pub fn torznab_name(&self) -> &'static str {
        match self {
            SearchType::Basic => "search",
            SearchType::Movie => "movie",
            SearchType::Tv => "tvsearch",
            SearchType::Music => "music",
            SearchType::Book => "book",
        }
    }
}

impl std::fmt::Display for SearchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.torznab_name())
    }
}

impl std::str::FromStr for SearchType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "search" | "basic" | "q" => Ok(SearchType::Basic),
            "tvsearch" | "tv-search" | "tv" => Ok(SearchType::Tv),
            "movie" | "movie-search" | "moviesearch" => Ok(SearchType::Movie),
            "music" | "music-search" | "musicsearch" | "audio" => Ok(SearchType::Music),
            "book" | "book-search" | "booksearch" => Ok(SearchType::Book),
            _ => Err(anyhow::anyhow!("Unknown search type: {}", s)),
        }
    }
}

/// How season/episode numbers are rendered into keywords
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeFormat {
    /// `S01E05`
    #[default]
    Standard,
    /// `1x05`
    Compact,
    /// `S01`
    SeasonOnly,
}

/// Capabilities advertised by a definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexerCapabilities {
    /// Maximum results per page
    pub limits_max: Option<i32>,
    /// Default results per page
    pub limits_default: Option<i32>,

    /// Whether basic search is available
    pub search_available: bool,
    /// Whether raw search is supported
    pub supports_raw_search: bool,

    pub search_params: Vec<String>,
    pub tv_search_params: Vec<String>,
    pub movie_search_params: Vec<String>,
    pub music_search_params: Vec<String>,
    pub book_search_params: Vec<String>,

    /// Category mappings (tracker category -> Torznab category)
    pub categories: Vec<CategoryMapping>,
}

impl IndexerCapabilities {
    /// Create default capabilities (search only)
    pub fn new() -> Self {
        Self {
            search_available: true,
            limits_default: Some(100),
            limits_max: Some(100),
            search_params: vec!["q".to_string()],
            ..Default::default()
        }
    }

    pub fn params_for(&self, search_type: SearchType) -> &[String] {
        match search_type {
            SearchType::Basic => &self.search_params,
            SearchType::Movie => &self.movie_search_params,
            SearchType::Tv => &self.tv_search_params,
            SearchType::Music => &self.music_search_params,
            SearchType::Book => &self.book_search_params,
        }
    }

    /// Whether a search type is available at all
    pub fn supports(&self, search_type: SearchType) -> bool {
        match search_type {
            SearchType::Basic => self.search_available,
            other => !self.params_for(other).is_empty(),
        }
    }

    /// Check if a specific param is supported for a search type
    pub fn has_param(&self, search_type: SearchType, param: &str) -> bool {
        self.params_for(search_type)
            .iter()
            .any(|p| p.eq_ignore_ascii_case(param))
    }
}

/// A search request, independent of any one site
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub search_type: SearchType,

    /// Free-text search term
    pub query: Option<String>,

    /// Categories to search in (Torznab category IDs)
    pub categories: Vec<i32>,

    /// Maximum number of results
    pub limit: Option<i32>,

    /// Offset for pagination
    pub offset: Option<i32>,

    /// Whether to use caching
    pub cache: bool,

    // External ids
    /// IMDB ID (e.g., "tt1234567")
    pub imdb_id: Option<String>,
    pub tmdb_id: Option<i32>,
    pub tvdb_id: Option<i32>,
    pub tvmaze_id: Option<i32>,
    pub trakt_id: Option<i32>,

    // TV-specific fields
    pub season: Option<i32>,
    /// Episode number/identifier
    pub episode: Option<String>,
    pub preferred_episode_format: EpisodeFormat,

    // Music-specific fields
    pub artist: Option<String>,
    pub album: Option<String>,
    pub label: Option<String>,
    pub track: Option<String>,

    // Book-specific fields
    pub author: Option<String>,
    pub title: Option<String>,
    pub publisher: Option<String>,

    // Common fields
    pub year: Option<i32>,
    pub genre: Option<String>,
}

impl SearchCriteria {
    /// Create a new search query
    pub fn search(term: &str) -> Self {
        Self {
            search_type: SearchType::Basic,
            query: Some(term.to_string()),
            cache: true,
            ..Default::default()
        }
    }

    /// Create a TV search query
    pub fn tv_search(term: &str) -> Self {
        Self {
            search_type: SearchType::Tv,
            query: Some(term.to_string()),
            cache: true,
            ..Default::default()
        }
    }

    /// Create a movie search query
    pub fn movie_search(term: &str) -> Self {
        Self {
            search_type: SearchType::Movie,
            query: Some(term.to_string()),
            cache: true,
            ..Default::default()
        }
    }

    /// Add season/episode to a TV search
    pub fn with_season_episode(mut self, season: i32, episode: Option<&str>) -> Self {
        self.season = Some(season);
        self.episode = episode.map(|s| s.to_string());
        self
    }

    pub fn with_episode_format(mut self, format: EpisodeFormat) -> Self {
        self.preferred_episode_format = format;
        self
    }

    /// Add IMDB ID to the query
    pub fn with_imdb(mut self, imdb_id: &str) -> Self {
        self.imdb_id = Some(imdb_id.to_string());
        self
    }

    /// Add categories to the query
    pub fn with_categories(mut self, cats: Vec<i32>) -> Self {
        self.categories = cats;
        self
    }

    /// Copy with every field that does not belong to the active search type cleared
    pub fn normalized(&self) -> Self {
        let mut c = self.clone();
        let t = c.search_type;
        let ids_allowed = matches!(t, SearchType::Movie | SearchType::Tv);
        let common_allowed = t != SearchType::Basic;

        if !ids_allowed {
            c.imdb_id = None;
            c.tmdb_id = None;
            c.trakt_id = None;
        }
        if t != SearchType::Tv {
            c.tvdb_id = None;
            c.tvmaze_id = None;
            c.season = None;
            c.episode = None;
            c.preferred_episode_format = EpisodeFormat::default();
        }
        if t != SearchType::Music {
            c.artist = None;
            c.album = None;
            c.label = None;
            c.track = None;
        }
        if t != SearchType::Book {
            c.author = None;
            c.title = None;
            c.publisher = None;
        }
        if !common_allowed {
            c.year = None;
            c.genre = None;
        }
        c.query = c
            .query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());
        c
    }

    /// Season/episode token in the preferred format (e.g., "S01E05")
    pub fn episode_string(&self) -> Option<String> {
        let season = self.season?;
        let episode = self
            .episode
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty());

        Some(match (self.preferred_episode_format, episode) {
            (EpisodeFormat::SeasonOnly, _) | (_, None) => format!("S{:02}", season),
            (EpisodeFormat::Standard, Some(ep)) => match ep.parse::<u32>() {
                Ok(n) => format!("S{:02}E{:02}", season, n),
                Err(_) => format!("S{:02}E{}", season, ep),
            },
            (EpisodeFormat::Compact, Some(ep)) => match ep.parse::<u32>() {
                Ok(n) => format!("{}x{:02}", season, n),
                Err(_) => format!("{}x{}", season, ep),
            },
        })
    }

    /// Keywords sent to a site: the free-text term followed by the episode token
    pub fn keywords(&self) -> String {
        let mut parts = vec![];

        if let Some(term) = self.query.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            parts.push(term.to_string());
        }

        if self.search_type == SearchType::Tv {
            if let Some(ep) = self.episode_string() {
                parts.push(ep);
            }
        }

        parts.join(" ")
    }

    /// Check if this is an ID-based search (IMDB, TVDB, etc.)
    pub fn is_id_search(&self) -> bool {
        self.imdb_id.is_some()
            || self.tvdb_id.is_some()
            || self.tmdb_id.is_some()
            || self.tvmaze_id.is_some()
            || self.trakt_id.is_some()
    }

    /// Get IMDB ID without the "tt" prefix
    pub fn imdb_id_short(&self) -> Option<String> {
        self.imdb_id
            .as_ref()
            .map(|id| id.trim_start_matches("tt").to_string())
    }

    /// Page number derived from limit/offset, starting at 1
    pub fn page(&self) -> i32 {
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) if limit > 0 && offset > 0 => offset / limit + 1,
            _ => 1,
        }
    }

    /// Create a cache key hash for this query
    pub fn cache_key(&self) -> String {
        use sha2::{Digest, Sha256};
        let json = serde_json::to_string(&self.normalized()).unwrap_or_default();
        let hash = Sha256::digest(json.as_bytes());
        format!("{:x}", hash)
    }
}

/// Torrent-specific release details
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TorrentInfo {
    pub seeders: Option<i32>,
    pub leechers: Option<i32>,
    /// Number of times snatched/downloaded
    pub grabs: Option<i32>,
    pub files: Option<i32>,
    pub info_hash: Option<String>,
    /// Download volume factor (0 = freeleech, 1 = normal)
    pub download_volume_factor: f64,
    /// Upload volume factor (usually 1, can be 2 for double upload)
    pub upload_volume_factor: f64,
    pub minimum_ratio: Option<f64>,
    /// Minimum seed time in seconds
    pub minimum_seed_time: Option<i64>,
}

impl Default for TorrentInfo {
    fn default() -> Self {
        Self {
            seeders: None,
            leechers: None,
            grabs: None,
            files: None,
            info_hash: None,
            download_volume_factor: 1.0,
            upload_volume_factor: 1.0,
            minimum_ratio: None,
            minimum_seed_time: None,
        }
    }
}

/// Usenet-specific release details
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsenetInfo {
    pub group: Option<String>,
    /// Completion percentage (0-100)
    pub completion: Option<f64>,
    pub password_protected: bool,
    pub poster: Option<String>,
    pub grabs: Option<i32>,
    pub files: Option<i32>,
}

/// Streaming-specific release details
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamingInfo {
    pub quality: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolInfo {
    Torrent(TorrentInfo),
    Usenet(UsenetInfo),
    Streaming(StreamingInfo),
}

impl ProtocolInfo {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Torrent => ProtocolInfo::Torrent(TorrentInfo::default()),
            Protocol::Usenet => ProtocolInfo::Usenet(UsenetInfo::default()),
            Protocol::Streaming => ProtocolInfo::Streaming(StreamingInfo::default()),
        }
    }
}

/// A single search result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Release title
    pub title: String,

    /// Unique identifier (usually the details URL)
    pub guid: String,

    /// Download link
    pub link: Option<String>,

    pub magnet_uri: Option<String>,

    /// Details page URL
    pub details: Option<String>,

    pub publish_date: DateTime<Utc>,

    /// Torznab category IDs
    pub categories: Vec<i32>,

    /// Size in bytes
    pub size: Option<i64>,

    pub description: Option<String>,

    /// Poster/cover image URL
    pub poster: Option<String>,

    // Metadata IDs
    pub imdb: Option<i64>,
    pub tmdb: Option<i64>,
    pub tvdb_id: Option<i64>,
    pub year: Option<i32>,
    pub genres: Vec<String>,

    pub protocol: Protocol,
    pub protocol_info: ProtocolInfo,

    /// The indexer that found this release
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexer_name: Option<String>,
}

impl ReleaseInfo {
    /// Create a new release with minimal info
    pub fn new(title: String, guid: String, publish_date: DateTime<Utc>) -> Self {
        Self::for_protocol(Protocol::Torrent, title, guid, publish_date)
    }

    pub fn for_protocol(
        protocol: Protocol,
        title: String,
        guid: String,
        publish_date: DateTime<Utc>,
    ) -> Self {
        Self {
            title,
            guid,
            publish_date,
            link: None,
            magnet_uri: None,
            details: None,
            categories: vec![],
            size: None,
            description: None,
            poster: None,
            imdb: None,
            tmdb: None,
            tvdb_id: None,
            year: None,
            genres: vec![],
            protocol,
            protocol_info: ProtocolInfo::for_protocol(protocol),
            indexer_id: None,
            indexer_name: None,
        }
    }

    pub fn torrent(&self) -> Option<&TorrentInfo> {
        match self.protocol_info {
            ProtocolInfo::Torrent(ref t) => Some(t),
            _ => None,
        }
    }

    pub fn torrent_mut(&mut self) -> Option<&mut TorrentInfo> {
        match self.protocol_info {
            ProtocolInfo::Torrent(ref mut t) => Some(t),
            _ => None,
        }
    }

    pub fn usenet(&self) -> Option<&UsenetInfo> {
        match self.protocol_info {
            ProtocolInfo::Usenet(ref u) => Some(u),
            _ => None,
        }
    }

    pub fn usenet_mut(&mut self) -> Option<&mut UsenetInfo> {
        match self.protocol_info {
            ProtocolInfo::Usenet(ref mut u) => Some(u),
            _ => None,
        }
    }

    pub fn streaming_mut(&mut self) -> Option<&mut StreamingInfo> {
        match self.protocol_info {
            ProtocolInfo::Streaming(ref mut s) => Some(s),
            _ => None,
        }
    }

    /// Check if this is a freeleech release
    pub fn is_freeleech(&self) -> bool {
        self.torrent()
            .is_some_and(|t| t.download_volume_factor == 0.0)
    }

    /// Calculate a "gain" score (seeders * size in GB)
    pub fn gain(&self) -> Option<f64> {
        let seeders = self.torrent()?.seeders?;
        let size = self.size?;
        let gb = size as f64 / (1024.0 * 1024.0 * 1024.0);
        Some(seeders as f64 * gb)
    }
}

impl Default for ReleaseInfo {
    fn default() -> Self {
        Self::new(String::new(), String::new(), Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_formats() {
        let base = SearchCriteria::tv_search("My Show").with_season_episode(1, Some("5"));
        assert_eq!(base.keywords(), "My Show S01E05");
        assert_eq!(
            base.clone().with_episode_format(EpisodeFormat::Compact).keywords(),
            "My Show 1x05"
        );
        assert_eq!(
            base.with_episode_format(EpisodeFormat::SeasonOnly).keywords(),
            "My Show S01"
        );
        let season_only = SearchCriteria::tv_search("My Show").with_season_episode(2, None);
        assert_eq!(season_only.episode_string().as_deref(), Some("S02"));
    }

    #[test]
    fn test_normalized_clears_foreign_fields() {
        let mut c = SearchCriteria::movie_search("Heat").with_season_episode(1, Some("2"));
        c.artist = Some("x".into());
        c.imdb_id = Some("tt0113277".into());
        let n = c.normalized();
        assert_eq!(n.season, None);
        assert_eq!(n.episode, None);
        assert_eq!(n.artist, None);
        assert_eq!(n.imdb_id.as_deref(), Some("tt0113277"));
        assert_eq!(n.keywords(), "Heat");
    }

    #[test]
    fn test_cache_key_ignores_inactive_fields() {
        let a = SearchCriteria::search("abc");
        let mut b = SearchCriteria::search("abc");
        b.season = Some(3);
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), SearchCriteria::search("abd").cache_key());
    }

    #[test]
    fn test_page_from_offset() {
        let mut c = SearchCriteria::search("x");
        assert_eq!(c.page(), 1);
        c.limit = Some(50);
        c.offset = Some(100);
        assert_eq!(c.page(), 3);
    }

    #[test]
    fn test_freeleech() {
        let mut r = ReleaseInfo::default();
        assert!(!r.is_freeleech());
        r.torrent_mut().unwrap().download_volume_factor = 0.0;
        assert!(r.is_freeleech());
        let u = ReleaseInfo::for_protocol(Protocol::Usenet, "t".into(), "g".into(), Utc::now());
        assert!(!u.is_freeleech());
        assert!(u.usenet().is_some());
    }
}
