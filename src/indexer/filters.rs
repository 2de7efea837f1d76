//! Named string transforms applied to extracted values
//!
//! Filters are listed in definitions as `{name, args}` and applied in order.
//! Unknown filters leave the value untouched.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use encoding_rs::Encoding;

use super::definitions::FilterDef;
use super::regex_cache;

/// Environment shared by every filter in one evaluation
#[derive(Debug, Clone, Copy)]
pub struct FilterContext {
    pub encoding: &'static Encoding,
    pub now: DateTime<Utc>,
}

impl Default for FilterContext {
    fn default() -> Self {
        Self {
            encoding: encoding_rs::UTF_8,
            now: Utc::now(),
        }
    }
}

impl FilterContext {
    pub fn with_encoding(encoding: &'static Encoding) -> Self {
        Self {
            encoding,
            ..Default::default()
        }
    }
}

/// Whether a filter name is known
pub fn is_filter(name: &str) -> bool {
    matches!(
        name,
        "append"
            | "prepend"
            | "trim"
            | "replace"
            | "re_replace"
            | "regexp"
            | "split"
            | "slice"
            | "tolower"
            | "toupper"
            | "urldecode"
            | "urlencode"
            | "htmldecode"
            | "htmlencode"
            | "querystring"
            | "timeago"
            | "reltime"
            | "fuzzytime"
            | "dateparse"
            | "timeparse"
            | "diacritics"
            | "validfilename"
            | "validate"
            | "strdump"
    )
}

/// Apply one filter. Returns `None` when the filter name is unknown.
pub fn apply_filter(name: &str, args: &[String], value: &str, ctx: &FilterContext) -> Option<String> {
    let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("");

    let out = match name {
        "append" => format!("{}{}", value, arg(0)),
        "prepend" => format!("{}{}", arg(0), value),
        "trim" => {
            if args.is_empty() || arg(0).is_empty() {
                value.trim().to_string()
            } else {
                let cutset: Vec<char> = arg(0).chars().collect();
                value.trim_matches(|c| cutset.contains(&c)).to_string()
            }
        }
        "replace" => value.replace(arg(0), arg(1)),
        "re_replace" => re_replace(value, arg(0), arg(1)),
        "regexp" => match regex_cache::compile(arg(0)) {
            Some(re) => re
                .captures(value)
                .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            None => value.to_string(),
        },
        "split" => split(value, arg(0), arg(1)),
        "slice" => slice(value, arg(0), arg(1)),
        "tolower" => value.to_lowercase(),
        "toupper" => value.to_uppercase(),
        "urldecode" => urlencoding::decode(&value.replace('+', " "))
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| value.to_string()),
        "urlencode" => form_urlencode(value, ctx.encoding),
        "htmldecode" => html_escape::decode_html_entities(value).into_owned(),
        "htmlencode" => html_escape::encode_text(value).into_owned(),
        "querystring" => querystring(value, arg(0)),
        "timeago" | "reltime" => parse_time_ago(value, ctx.now)
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| value.to_string()),
        "fuzzytime" => parse_fuzzy_date(value, ctx.now)
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| value.to_string()),
        "dateparse" | "timeparse" => parse_with_layout(value, arg(0))
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| {
                tracing::debug!(value = %value, layout = %arg(0), "dateparse did not match");
                value.to_string()
            }),
        "diacritics" => strip_diacritics(value),
        "validfilename" => sanitize_filename::sanitize(value),
        "validate" => validate(value, arg(0)),
        "strdump" => {
            tracing::debug!(tag = %arg(0), value = %value, "strdump");
            value.to_string()
        }
        _ => return None,
    };
    Some(out)
}

/// Apply a filter chain. `expand` resolves templates inside filter arguments.
pub fn apply_filters<F>(filters: &[FilterDef], value: String, ctx: &FilterContext, expand: F) -> String
where
    F: Fn(&str) -> String,
{
    let mut value = value;
    for filter in filters {
        let args: Vec<String> = filter.arg_list().iter().map(|a| expand(a)).collect();
        match apply_filter(&filter.name, &args, &value, ctx) {
            Some(v) => value = v,
            None => {
                tracing::warn!(filter = %filter.name, "Unknown filter, value passed through");
            }
        }
    }
    value
}

pub fn re_replace(value: &str, pattern: &str, replacement: &str) -> String {
    match regex_cache::compile(pattern) {
        Some(re) => re.replace_all(value, replacement).into_owned(),
        None => value.to_string(),
    }
}

fn split(value: &str, sep: &str, index: &str) -> String {
    if sep.is_empty() {
        return value.to_string();
    }
    let parts: Vec<&str> = value.split(sep).collect();
    let Ok(idx) = index.trim().parse::<i64>() else {
        return value.to_string();
    };
    let resolved = if idx < 0 {
        parts.len() as i64 + idx
    } else {
        idx
    };
    if resolved < 0 {
        return String::new();
    }
    parts
        .get(resolved as usize)
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// Characters `start..end`. Negative indices count from the end, an empty
/// `end` runs to the end and out-of-range indices are clamped.
fn slice(value: &str, start: &str, end: &str) -> String {
    let len = value.chars().count() as i64;
    let resolve = |raw: &str, default: i64| -> Option<i64> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Some(default);
        }
        let idx = raw.parse::<i64>().ok()?;
        Some(if idx < 0 { len + idx } else { idx }.clamp(0, len))
    };
    let (Some(start), Some(end)) = (resolve(start, 0), resolve(end, len)) else {
        return value.to_string();
    };
    if start >= end {
        return String::new();
    }
    value
        .chars()
        .skip(start as usize)
        .take((end - start) as usize)
        .collect()
}

/// Form-style percent encoding (`' '` → `+`) in the site's charset
pub fn form_urlencode(value: &str, encoding: &'static Encoding) -> String {
    let (bytes, _, _) = encoding.encode(value);
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes.iter() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'*' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn querystring(value: &str, param: &str) -> String {
    let parsed = url::Url::parse(value).or_else(|_| {
        url::Url::parse("http://localhost/").and_then(|base| base.join(value))
    });
    match parsed {
        Ok(u) => u
            .query_pairs()
            .find(|(k, _)| k == param)
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

fn validate(value: &str, allowed: &str) -> String {
    let allowed: Vec<String> = allowed
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    let words = value
        .split(|c: char| {
            matches!(c, ',' | ' ' | '/' | ')' | '(' | '.' | ';' | '[' | ']' | '"' | '|' | ':')
        })
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .filter(|w| allowed.contains(&w.to_lowercase()));
    let mut kept: Vec<&str> = Vec::new();
    for w in words {
        if !kept.iter().any(|k| k.eq_ignore_ascii_case(w)) {
            kept.push(w);
        }
    }
    kept.join(",")
}

/// Parse relative times like "2 hours ago", "1 day, 3 hours", "5m"
pub fn parse_time_ago(time_str: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let text = time_str.trim().to_lowercase();
    if matches!(text.as_str(), "now" | "just now" | "right now") {
        return Some(now);
    }
    let text = match regex_cache::compile(r"\ban?\s+(sec|min|hour|day|week|month|year)") {
        Some(article) => article.replace_all(&text, "1 $1").into_owned(),
        None => text,
    };

    let re = regex_cache::compile(r"(\d+(?:\.\d+)?)\s*([a-z]+)")?;
    let mut total = Duration::zero();
    let mut matched = false;

    for caps in re.captures_iter(&text) {
        let Ok(num) = caps[1].parse::<f64>() else {
            continue;
        };
        let unit = &caps[2];
        let seconds = if unit.starts_with("mo") {
            30.0 * 86400.0
        } else if unit.starts_with("mi") || unit == "m" {
            60.0
        } else if unit.starts_with('s') {
            1.0
        } else if unit.starts_with('h') {
            3600.0
        } else if unit.starts_with('d') {
            86400.0
        } else if unit.starts_with('w') {
            7.0 * 86400.0
        } else if unit.starts_with('y') {
            365.0 * 86400.0
        } else {
            continue;
        };
        total += Duration::seconds((num * seconds) as i64);
        matched = true;
    }

    matched.then(|| now - total)
}

const FALLBACK_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M",
    "%d.%m.%Y %H:%M",
    "%b %d %Y %H:%M",
    "%d %b %Y %H:%M",
    "%B %d, %Y %H:%M",
];

const FALLBACK_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%b %d %Y",
    "%b %d, %Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%d %B %Y",
];

/// Best-effort date parsing for free-form site dates
pub fn parse_fuzzy_date(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Some(d.with_timezone(&Utc));
    }
    if let Ok(d) = DateTime::parse_from_rfc2822(s) {
        return Some(d.with_timezone(&Utc));
    }
    if let Ok(ts) = s.parse::<i64>() {
        // Unix timestamp, seconds or milliseconds
        let secs = if ts > 100_000_000_000 { ts / 1000 } else { ts };
        return Utc.timestamp_opt(secs, 0).single();
    }

    let lower = s.to_lowercase();
    for (word, days_back) in [("today", 0), ("yesterday", 1)] {
        if let Some(rest) = lower.strip_prefix(word) {
            let date = (now - Duration::days(days_back)).date_naive();
            let time = parse_clock(rest.trim().trim_start_matches("at").trim())
                .unwrap_or(NaiveTime::MIN);
            return Some(Utc.from_utc_datetime(&date.and_time(time)));
        }
    }
    if lower.contains("ago") || lower == "now" || lower == "just now" {
        return parse_time_ago(&lower.replace("ago", ""), now);
    }

    for fmt in FALLBACK_FORMATS {
        if let Ok(d) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&d));
        }
    }
    for fmt in FALLBACK_DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)));
        }
    }

    // "Mar 05" style dates without a year
    let with_year = format!("{} {}", s, now.year());
    for fmt in ["%b %d %Y", "%d %b %Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(&with_year, fmt) {
            return Some(Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)));
        }
    }

    parse_time_ago(s, now)
}

fn parse_clock(s: &str) -> Option<NaiveTime> {
    if s.is_empty() {
        return None;
    }
    ["%H:%M:%S", "%H:%M", "%I:%M %p", "%I:%M%p"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&s.to_uppercase(), fmt).ok())
}

/// Translate a Go reference layout ("2006-01-02 15:04") to a chrono format
pub fn go_layout_to_chrono(layout: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        ("January", "%B"),
        ("Monday", "%A"),
        ("Z07:00", "%:z"),
        ("-07:00", "%:z"),
        ("-0700", "%z"),
        ("2006", "%Y"),
        (".000", "%.3f"),
        ("Jan", "%b"),
        ("Mon", "%a"),
        ("MST", ""),
        ("_2", "%e"),
        ("01", "%m"),
        ("02", "%d"),
        ("03", "%I"),
        ("04", "%M"),
        ("05", "%S"),
        ("06", "%y"),
        ("15", "%H"),
        ("PM", "%p"),
        ("pm", "%P"),
        ("1", "%m"),
        ("2", "%d"),
        ("3", "%I"),
        ("4", "%M"),
        ("5", "%S"),
    ];

    let mut out = String::new();
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (go, chrono_fmt) in TOKENS {
            if let Some(tail) = rest.strip_prefix(go) {
                out.push_str(chrono_fmt);
                rest = tail;
                continue 'outer;
            }
        }
        let Some(c) = rest.chars().next() else {
            break;
        };
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    out.trim().to_string()
}

/// Parse a value with a Go reference layout
pub fn parse_with_layout(value: &str, layout: &str) -> Option<DateTime<Utc>> {
    let fmt = go_layout_to_chrono(layout);
    let value = value.trim();
    if fmt.contains("%z") || fmt.contains("%:z") {
        if let Ok(d) = DateTime::parse_from_str(value, &fmt) {
            return Some(d.with_timezone(&Utc));
        }
    }
    if let Ok(d) = NaiveDateTime::parse_from_str(value, &fmt) {
        return Some(Utc.from_utc_datetime(&d));
    }
    NaiveDate::parse_from_str(value, &fmt)
        .ok()
        .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)))
}

/// Fold accented Latin letters to their ASCII base letter
pub fn strip_diacritics(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
            'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => 'A',
            'ç' | 'ć' | 'č' | 'ĉ' | 'ċ' => 'c',
            'Ç' | 'Ć' | 'Č' | 'Ĉ' | 'Ċ' => 'C',
            'ď' | 'đ' => 'd',
            'Ď' | 'Đ' => 'D',
            'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => 'e',
            'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => 'E',
            'ğ' | 'ģ' => 'g',
            'Ğ' | 'Ģ' => 'G',
            'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => 'i',
            'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Į' | 'İ' => 'I',
            'ķ' => 'k',
            'Ķ' => 'K',
            'ł' | 'ľ' | 'ļ' | 'ĺ' => 'l',
            'Ł' | 'Ľ' | 'Ļ' | 'Ĺ' => 'L',
            'ñ' | 'ń' | 'ň' | 'ņ' => 'n',
            'Ñ' | 'Ń' | 'Ň' | 'Ņ' => 'N',
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => 'o',
            'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => 'O',
            'ř' | 'ŕ' => 'r',
            'Ř' | 'Ŕ' => 'R',
            'ś' | 'š' | 'ş' | 'ș' => 's',
            'Ś' | 'Š' | 'Ş' | 'Ș' => 'S',
            'ť' | 'ţ' | 'ț' => 't',
            'Ť' | 'Ţ' | 'Ț' => 'T',
            'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => 'u',
            'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' | 'Ų' => 'U',
            'ý' | 'ÿ' => 'y',
            'Ý' | 'Ÿ' => 'Y',
            'ź' | 'ż' | 'ž' => 'z',
            'Ź' | 'Ż' | 'Ž' => 'Z',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn run(name: &str, args: &[&str], value: &str) -> String {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        apply_filter(name, &args, value, &FilterContext::default()).unwrap()
    }

    #[test]
    fn test_string_filters() {
        assert_eq!(run("append", &["!"], "hi"), "hi!");
        assert_eq!(run("prepend", &["> "], "hi"), "> hi");
        assert_eq!(run("trim", &[], "  hi "), "hi");
        assert_eq!(run("trim", &["-"], "--hi-"), "hi");
        assert_eq!(run("replace", &[",", ""], "1,234"), "1234");
        assert_eq!(run("tolower", &[], "AbC"), "abc");
        assert_eq!(run("toupper", &[], "AbC"), "ABC");
    }

    #[test]
    fn test_regex_filters() {
        assert_eq!(run("re_replace", &[r"\s+", " "], "a   b"), "a b");
        assert_eq!(run("regexp", &[r"id=(\d+)"], "x?id=42&y"), "42");
        assert_eq!(run("regexp", &[r"zzz(\d+)"], "x"), "");
        // Rejected pattern leaves the value alone
        assert_eq!(run("re_replace", &["(", "x"], "a(b"), "a(b");
    }

    #[test]
    fn test_slice() {
        let ctx = FilterContext::default();
        let slice = |args: &[&str], value: &str| {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            apply_filter("slice", &args, value, &ctx).unwrap()
        };
        assert!(is_filter("slice"));
        assert_eq!(slice(&["0", "3"], "abcdef"), "abc");
        assert_eq!(slice(&["2"], "abcdef"), "cdef");
        assert_eq!(slice(&["-3"], "abcdef"), "def");
        assert_eq!(slice(&["1", "-1"], "abcdef"), "bcde");
        assert_eq!(slice(&["0", "100"], "abc"), "abc");
        assert_eq!(slice(&["-100", "2"], "abc"), "ab");
        assert_eq!(slice(&["4", "2"], "abcdef"), "");
        assert_eq!(slice(&["1", "3"], "Ünïcode"), "nï");
        assert_eq!(slice(&["x"], "abc"), "abc");
    }

    #[test]
    fn test_split() {
        assert_eq!(run("split", &["/", "2"], "a/b/c"), "c");
        assert_eq!(run("split", &["/", "-1"], "a/b/c"), "c");
        assert_eq!(run("split", &["/", "9"], "a/b/c"), "");
    }

    #[test]
    fn test_encoding_filters() {
        assert_eq!(run("urlencode", &[], "a b&c"), "a+b%26c");
        assert_eq!(run("urldecode", &[], "a+b%26c"), "a b&c");
        assert_eq!(run("htmldecode", &[], "a &amp; b"), "a & b");
        assert_eq!(run("htmlencode", &[], "<b>"), "&lt;b&gt;");
        let latin1 = encoding_rs::Encoding::for_label(b"windows-1252").unwrap();
        assert_eq!(form_urlencode("é", latin1), "%E9");
    }

    #[test]
    fn test_querystring() {
        assert_eq!(run("querystring", &["id"], "details.php?id=77&x=1"), "77");
        assert_eq!(run("querystring", &["id"], "https://a/b?x=1"), "");
    }

    #[test]
    fn test_validate_and_misc() {
        assert_eq!(run("validate", &["Movies, TV"], "tv / movies / cats"), "tv,movies");
        assert_eq!(run("diacritics", &["replace"], "Amélie Poulain"), "Amelie Poulain");
        assert_eq!(run("validfilename", &[], "a/b:c"), "abc");
        assert_eq!(run("strdump", &[], "x"), "x");
        assert!(apply_filter("nope", &[], "x", &FilterContext::default()).is_none());
    }

    #[test]
    fn test_time_ago() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let d = parse_time_ago("2 hours ago", now).unwrap();
        assert_eq!(d.hour(), 10);
        let d = parse_time_ago("1 day, 3 hours", now).unwrap();
        assert_eq!(d, now - Duration::hours(27));
        assert_eq!(parse_time_ago("an hour ago", now).unwrap(), now - Duration::hours(1));
        assert!(parse_time_ago("whenever", now).is_none());
    }

    #[test]
    fn test_fuzzy_date() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let d = parse_fuzzy_date("yesterday at 10:30", now).unwrap();
        assert_eq!((d.day(), d.hour(), d.minute()), (31, 10, 30));
        let d = parse_fuzzy_date("2023-01-15 08:00:00", now).unwrap();
        assert_eq!((d.year(), d.month(), d.day()), (2023, 1, 15));
        let d = parse_fuzzy_date("1700000000", now).unwrap();
        assert_eq!(d.year(), 2023);
        assert!(parse_fuzzy_date("not a date", now).is_none());
    }

    #[test]
    fn test_dateparse_go_layout() {
        assert_eq!(go_layout_to_chrono("2006-01-02 15:04:05"), "%Y-%m-%d %H:%M:%S");
        assert_eq!(go_layout_to_chrono("Jan 2, 2006"), "%b %d, %Y");
        let d = parse_with_layout("15/03/2022 18:45", "02/01/2006 15:04").unwrap();
        assert_eq!((d.year(), d.month(), d.day(), d.hour()), (2022, 3, 15, 18));
        let d = parse_with_layout("2022-03-15", "2006-01-02").unwrap();
        assert_eq!(d.day(), 15);
    }

    #[test]
    fn test_apply_filters_chain_expands_args() {
        let filters = vec![
            FilterDef::new("replace", vec!["X", "{{ .Y }}"]),
            FilterDef::new("unknownfilter", vec![]),
            FilterDef::new("toupper", vec![]),
        ];
        let out = apply_filters(&filters, "aXb".to_string(), &FilterContext::default(), |a| {
            a.replace("{{ .Y }}", "y")
        });
        assert_eq!(out, "AYB");
    }
}
