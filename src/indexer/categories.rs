//! Torznab category definitions and mappings
//!
//! Standard Torznab categories follow the Newznab numbering scheme.
//! Main categories are in thousands (1000, 2000, etc.) and subcategories
//! add tens (2010, 2020, etc.).

use serde::{Deserialize, Serialize};

use super::definitions::CapabilitiesBlock;

/// A mapping from tracker-specific category to Torznab standard category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryMapping {
    /// The tracker's internal category ID (as string for flexibility)
    pub tracker_id: String,
    /// The Torznab standard category ID
    pub torznab_cat: i32,
    /// Description of the category
    pub description: Option<String>,
    /// Used when a search names no categories, or a result's category is unknown
    #[serde(default)]
    pub default: bool,
}

impl CategoryMapping {
    pub fn new(tracker_id: impl Into<String>, torznab_cat: i32, desc: impl Into<String>) -> Self {
        Self {
            tracker_id: tracker_id.into(),
            torznab_cat,
            description: Some(desc.into()),
            default: false,
        }
    }
}

/// A Torznab category definition
#[derive(Debug, Clone)]
pub struct TorznabCategory {
    pub id: i32,
    pub name: &'static str,
    pub parent_id: Option<i32>,
}

impl TorznabCategory {
    pub const fn new(id: i32, name: &'static str, parent_id: Option<i32>) -> Self {
        Self {
            id,
            name,
            parent_id,
        }
    }

    /// Check if this is a parent category
    pub fn is_parent(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Standard Torznab categories (Newznab numbering)
pub static TORZNAB_CATEGORIES: &[TorznabCategory] = &[
    // Console (1000)
    TorznabCategory::new(1000, "Console", None),
    TorznabCategory::new(1010, "Console/NDS", Some(1000)),
    TorznabCategory::new(1020, "Console/PSP", Some(1000)),
    TorznabCategory::new(1030, "Console/Wii", Some(1000)),
    TorznabCategory::new(1040, "Console/Xbox", Some(1000)),
    TorznabCategory::new(1050, "Console/Xbox 360", Some(1000)),
    TorznabCategory::new(1060, "Console/WiiWare", Some(1000)),
    TorznabCategory::new(1070, "Console/Xbox 360 DLC", Some(1000)),
    TorznabCategory::new(1080, "Console/PS3", Some(1000)),
    TorznabCategory::new(1090, "Console/Other", Some(1000)),
    TorznabCategory::new(1110, "Console/3DS", Some(1000)),
    TorznabCategory::new(1120, "Console/PS Vita", Some(1000)),
    TorznabCategory::new(1130, "Console/WiiU", Some(1000)),
    TorznabCategory::new(1140, "Console/Xbox One", Some(1000)),
    TorznabCategory::new(1150, "Console/PS4", Some(1000)),
    TorznabCategory::new(1180, "Console/Switch", Some(1000)),
    // Movies (2000)
    TorznabCategory::new(2000, "Movies", None),
    TorznabCategory::new(2010, "Movies/Foreign", Some(2000)),
    TorznabCategory::new(2020, "Movies/Other", Some(2000)),
    TorznabCategory::new(2030, "Movies/SD", Some(2000)),
    TorznabCategory::new(2040, "Movies/HD", Some(2000)),
    TorznabCategory::new(2045, "Movies/UHD", Some(2000)),
    TorznabCategory::new(2050, "Movies/BluRay", Some(2000)),
    TorznabCategory::new(2060, "Movies/3D", Some(2000)),
    TorznabCategory::new(2070, "Movies/DVD", Some(2000)),
    TorznabCategory::new(2080, "Movies/WEB-DL", Some(2000)),
    // Audio (3000)
    TorznabCategory::new(3000, "Audio", None),
    TorznabCategory::new(3010, "Audio/MP3", Some(3000)),
    TorznabCategory::new(3020, "Audio/Video", Some(3000)),
    TorznabCategory::new(3030, "Audio/Audiobook", Some(3000)),
    TorznabCategory::new(3040, "Audio/Lossless", Some(3000)),
    TorznabCategory::new(3050, "Audio/Other", Some(3000)),
    TorznabCategory::new(3060, "Audio/Foreign", Some(3000)),
    // PC (4000)
    TorznabCategory::new(4000, "PC", None),
    TorznabCategory::new(4010, "PC/0day", Some(4000)),
    TorznabCategory::new(4020, "PC/ISO", Some(4000)),
    TorznabCategory::new(4030, "PC/Mac", Some(4000)),
    TorznabCategory::new(4040, "PC/Mobile-Other", Some(4000)),
    TorznabCategory::new(4050, "PC/Games", Some(4000)),
    TorznabCategory::new(4060, "PC/Mobile-iOS", Some(4000)),
    TorznabCategory::new(4070, "PC/Mobile-Android", Some(4000)),
    // TV (5000)
    TorznabCategory::new(5000, "TV", None),
    TorznabCategory::new(5010, "TV/WEB-DL", Some(5000)),
    TorznabCategory::new(5020, "TV/Foreign", Some(5000)),
    TorznabCategory::new(5030, "TV/SD", Some(5000)),
    TorznabCategory::new(5040, "TV/HD", Some(5000)),
    TorznabCategory::new(5045, "TV/UHD", Some(5000)),
    TorznabCategory::new(5050, "TV/Other", Some(5000)),
    TorznabCategory::new(5060, "TV/Sport", Some(5000)),
    TorznabCategory::new(5070, "TV/Anime", Some(5000)),
    TorznabCategory::new(5080, "TV/Documentary", Some(5000)),
    // XXX (6000) - Adult content
    TorznabCategory::new(6000, "XXX", None),
    TorznabCategory::new(6010, "XXX/DVD", Some(6000)),
    TorznabCategory::new(6020, "XXX/WMV", Some(6000)),
    TorznabCategory::new(6030, "XXX/XviD", Some(6000)),
    TorznabCategory::new(6040, "XXX/x264", Some(6000)),
    TorznabCategory::new(6050, "XXX/Pack", Some(6000)),
    TorznabCategory::new(6060, "XXX/ImageSet", Some(6000)),
    TorznabCategory::new(6070, "XXX/Other", Some(6000)),
    TorznabCategory::new(6080, "XXX/SD", Some(6000)),
    TorznabCategory::new(6090, "XXX/WEB-DL", Some(6000)),
    // Books (7000)
    TorznabCategory::new(7000, "Books", None),
    TorznabCategory::new(7010, "Books/Mags", Some(7000)),
    TorznabCategory::new(7020, "Books/EBook", Some(7000)),
    TorznabCategory::new(7030, "Books/Comics", Some(7000)),
    TorznabCategory::new(7040, "Books/Technical", Some(7000)),
    TorznabCategory::new(7050, "Books/Other", Some(7000)),
    TorznabCategory::new(7060, "Books/Foreign", Some(7000)),
    // Other (8000)
    TorznabCategory::new(8000, "Other", None),
    TorznabCategory::new(8010, "Other/Misc", Some(8000)),
    TorznabCategory::new(8020, "Other/Hashed", Some(8000)),
];

/// Top-level category ids
pub mod cats {
    pub const CONSOLE: i32 = 1000;
    pub const MOVIES: i32 = 2000;
    pub const AUDIO: i32 = 3000;
    pub const PC: i32 = 4000;
    pub const TV: i32 = 5000;
    pub const XXX: i32 = 6000;
    pub const BOOKS: i32 = 7000;
    pub const OTHER: i32 = 8000;
}

/// Get a category by ID
pub fn get_category(id: i32) -> Option<&'static TorznabCategory> {
    TORZNAB_CATEGORIES.iter().find(|c| c.id == id)
}

/// Whether two category ids belong to the same top-level family
pub fn same_family(a: i32, b: i32) -> bool {
    a / 1000 == b / 1000
}

/// `cat` is `wanted` itself or, when `wanted` is a parent id, one of its
/// subcategories
pub fn covers(wanted: i32, cat: i32) -> bool {
    cat == wanted || (wanted % 1000 == 0 && same_family(cat, wanted))
}

/// Resolve a category name (e.g. `Movies/HD`) to its Torznab id.
///
/// Unknown names resolve to [`cats::OTHER`].
pub fn parse_category_string(cat_str: &str) -> i32 {
    let name = cat_str.trim();
    if let Some(c) = TORZNAB_CATEGORIES
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
    {
        return c.id;
    }

    match name.to_lowercase().as_str() {
        "movies/4k" => 2045,
        "tv/4k" => 5045,
        "tv/documentaries" => 5080,
        "sports" => 5060,
        "music" => cats::AUDIO,
        "audio/flac" => 3040,
        "audiobook" | "audiobooks" => 3030,
        "ebooks" => 7020,
        "comics" => 7030,
        "magazines" => 7010,
        "apps" | "applications" => cats::PC,
        "games" => cats::CONSOLE,
        _ => cats::OTHER,
    }
}

/// Two-way translation between Torznab ids and a site's native category ids
#[derive(Debug, Clone, Default)]
pub struct CategoryMapper {
    mappings: Vec<CategoryMapping>,
}

impl CategoryMapper {
    pub fn new(mappings: Vec<CategoryMapping>) -> Self {
        Self { mappings }
    }

    /// Build from a definition's `caps` block
    pub fn from_caps(caps: &CapabilitiesBlock) -> Self {
        let mut mappings = Vec::new();

        for (id, name) in &caps.categories {
            mappings.push(CategoryMapping {
                tracker_id: id.clone(),
                torznab_cat: parse_category_string(name),
                description: Some(name.clone()),
                default: false,
            });
        }

        for m in &caps.categorymappings {
            let torznab_cat = m
                .cat
                .as_deref()
                .map(parse_category_string)
                .unwrap_or(cats::OTHER);
            mappings.push(CategoryMapping {
                tracker_id: m.id.clone(),
                torznab_cat,
                description: m.desc.clone().or_else(|| m.cat.clone()),
                default: m.default,
            });
        }

        Self { mappings }
    }

    pub fn mappings(&self) -> &[CategoryMapping] {
        &self.mappings
    }

    fn default_tracker_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for m in self.mappings.iter().filter(|m| m.default) {
            if !out.contains(&m.tracker_id) {
                out.push(m.tracker_id.clone());
            }
        }
        out
    }

    /// Native ids for the requested Torznab categories, in declaration order.
    ///
    /// A mapping matches when its category equals a requested id. A parent id
    /// (`2000`) also matches every subcategory in its family, a subcategory
    /// only itself. When nothing matches, the definition's default categories
    /// apply.
    pub fn map_to_tracker(&self, requested: &[i32]) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for m in &self.mappings {
            let hit = requested.iter().any(|&r| covers(r, m.torznab_cat));
            if hit && !out.contains(&m.tracker_id) {
                out.push(m.tracker_id.clone());
            }
        }
        if out.is_empty() {
            return self.default_tracker_ids();
        }
        out
    }

    /// Torznab ids for a native category. Unknown ids fall back to the
    /// default categories, or `Other` when none are declared.
    pub fn map_from_tracker(&self, native: &str) -> Vec<i32> {
        let native = native.trim();
        let mut out: Vec<i32> = Vec::new();
        for m in &self.mappings {
            let hit = m.tracker_id == native
                || m.description
                    .as_deref()
                    .is_some_and(|d| d.eq_ignore_ascii_case(native));
            if hit && !out.contains(&m.torznab_cat) {
                out.push(m.torznab_cat);
            }
        }
        if out.is_empty() {
            for m in self.mappings.iter().filter(|m| m.default) {
                if !out.contains(&m.torznab_cat) {
                    out.push(m.torznab_cat);
                }
            }
        }
        if out.is_empty() {
            out.push(cats::OTHER);
        }
        out
    }

    /// Whether a path's `categories` list applies to the requested categories.
    ///
    /// Entries may be native ids, Torznab ids or category names.
    pub fn matches_path_categories(&self, path_categories: &[String], requested: &[i32]) -> bool {
        path_categories.iter().any(|entry| {
            self.resolve_entry(entry)
                .iter()
                .any(|&cat| requested.iter().any(|&r| covers(r, cat) || covers(cat, r)))
        })
    }

    fn resolve_entry(&self, entry: &str) -> Vec<i32> {
        let entry = entry.trim();
        let native: Vec<i32> = self
            .mappings
            .iter()
            .filter(|m| m.tracker_id == entry)
            .map(|m| m.torznab_cat)
            .collect();
        if !native.is_empty() {
            return native;
        }
        if let Ok(id) = entry.parse::<i32>() {
            return vec![id];
        }
        vec![parse_category_string(entry)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> CategoryMapper {
        let caps: CapabilitiesBlock = serde_yaml::from_str(
            r#"
categorymappings:
  - {id: 1, cat: Movies/HD, desc: "HD Movies"}
  - {id: 2, cat: Movies/SD}
  - {id: 5, cat: TV/HD, default: true}
  - {id: 9, cat: Audio}
"#,
        )
        .unwrap();
        CategoryMapper::from_caps(&caps)
    }

    #[test]
    fn test_parse_category_string() {
        assert_eq!(parse_category_string("Movies/HD"), 2040);
        assert_eq!(parse_category_string("tv/uhd"), 5045);
        assert_eq!(parse_category_string("audiobooks"), 3030);
        assert_eq!(parse_category_string("Knitting"), 8000);
    }

    #[test]
    fn test_map_to_tracker_family() {
        let m = mapper();
        assert_eq!(m.map_to_tracker(&[2000]), vec!["1", "2"]);
        assert_eq!(m.map_to_tracker(&[2040]), vec!["1"]);
        assert_eq!(m.map_to_tracker(&[2030]), vec!["2"]);
        assert_eq!(m.map_to_tracker(&[2030, 5000]), vec!["2", "5"]);
        // No sibling fallback for an unmapped subcategory
        assert_eq!(m.map_to_tracker(&[2045]), vec!["5"]);
        assert_eq!(m.map_to_tracker(&[7000]), vec!["5"]);
        assert_eq!(m.map_to_tracker(&[]), vec!["5"]);
    }

    #[test]
    fn test_map_from_tracker_unknown_uses_defaults() {
        let m = mapper();
        assert_eq!(m.map_from_tracker("1"), vec![2040]);
        assert_eq!(m.map_from_tracker("HD Movies"), vec![2040]);
        assert_eq!(m.map_from_tracker("404"), vec![5040]);
        assert_eq!(CategoryMapper::default().map_from_tracker("x"), vec![8000]);
    }

    #[test]
    fn test_round_trip_stays_in_family() {
        let m = mapper();
        for id in [2000, 2040, 5040, 3000] {
            let back: Vec<i32> = m
                .map_to_tracker(&[id])
                .iter()
                .flat_map(|n| m.map_from_tracker(n))
                .collect();
            assert!(back.iter().any(|&c| same_family(c, id)), "id {}", id);
        }
    }

    #[test]
    fn test_matches_path_categories() {
        let m = mapper();
        assert!(m.matches_path_categories(&["1".to_string()], &[2000]));
        assert!(m.matches_path_categories(&["TV".to_string()], &[5040]));
        assert!(!m.matches_path_categories(&["9".to_string()], &[2000]));
        // Movies/SD path, Movies/HD request
        assert!(!m.matches_path_categories(&["2".to_string()], &[2040]));
    }
}
