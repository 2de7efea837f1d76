//! Session cookie records and the sentinel entries used for non-cookie auth
//!
//! Indexer sessions are stored as a flat `name -> value` map. `basic` and
//! `apikey` logins reuse that map with reserved entry names that the HTTP
//! client turns into an `Authorization` header, an API key header or a query
//! parameter instead of a `Cookie` header.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// `user:password` for HTTP basic auth
pub const BASIC_AUTH_SENTINEL: &str = "__cardigann_basic_auth";
/// `Header-Name=value` sent as a request header
pub const API_KEY_HEADER_SENTINEL: &str = "__cardigann_apikey_header";
/// `param=value` appended to the query string
pub const API_KEY_QUERY_SENTINEL: &str = "__cardigann_apikey_query";

pub fn is_sentinel(name: &str) -> bool {
    name.starts_with("__cardigann_")
}

/// One parsed `Set-Cookie` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub expires: Option<DateTime<Utc>>,
}

impl SetCookie {
    /// Record a cookie parsed by reqwest. `Max-Age` wins over `Expires`.
    pub fn from_response(cookie: &reqwest::cookie::Cookie<'_>, now: DateTime<Utc>) -> Self {
        let expires = match cookie.max_age() {
            Some(age) => ChronoDuration::from_std(age)
                .ok()
                .and_then(|age| now.checked_add_signed(age)),
            None => cookie.expires().map(DateTime::<Utc>::from),
        };
        Self {
            name: cookie.name().to_string(),
            value: cookie.value().to_string(),
            expires,
        }
    }

    /// Servers delete cookies by re-sending them already expired
    pub fn is_deletion(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e <= now)
    }
}

/// Parse a `Cookie` style string (`a=1; b=2`) into pairs
pub fn parse_cookie_string(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                None
            } else {
                Some((name.to_string(), value.trim().to_string()))
            }
        })
        .collect()
}

/// Apply a batch of `Set-Cookie` results to a cookie map
pub fn merge_set_cookies(
    cookies: &mut HashMap<String, String>,
    set: &[SetCookie],
    now: DateTime<Utc>,
) {
    for c in set {
        if c.is_deletion(now) {
            cookies.remove(&c.name);
        } else {
            cookies.insert(c.name.clone(), c.value.clone());
        }
    }
}

/// Mask cookie values for logging
pub fn redact(cookies: &HashMap<String, String>) -> String {
    let mut names: Vec<&str> = cookies
        .keys()
        .filter(|n| !is_sentinel(n))
        .map(|n| n.as_str())
        .collect();
    names.sort_unstable();
    names
        .into_iter()
        .map(|n| format!("{}=[REDACTED]", n))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn set(name: &str, value: &str, expires: Option<DateTime<Utc>>) -> SetCookie {
        SetCookie {
            name: name.to_string(),
            value: value.to_string(),
            expires,
        }
    }

    #[test]
    fn test_deletion_removes_cookie() {
        let mut jar = HashMap::from([("a".to_string(), "1".to_string())]);
        let batch = vec![set("a", "deleted", Some(now())), set("b", "2", None)];
        merge_set_cookies(&mut jar, &batch, now());
        assert!(!jar.contains_key("a"));
        assert_eq!(jar.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_redact_hides_values_and_sentinels() {
        let jar = HashMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
            (BASIC_AUTH_SENTINEL.to_string(), "u:p".to_string()),
        ]);
        assert_eq!(redact(&jar), "a=[REDACTED]; b=[REDACTED]");
    }

    #[test]
    fn test_parse_cookie_string() {
        assert_eq!(
            parse_cookie_string("uid=1; pass=x=y ;  ; bad"),
            vec![
                ("uid".to_string(), "1".to_string()),
                ("pass".to_string(), "x=y".to_string())
            ]
        );
    }
}
