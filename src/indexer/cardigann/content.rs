//! Fetching the payload behind a resolved download link

use serde_bencode::value::Value as Bencode;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::http::{IndexerHttpClient, RequestOptions};
use crate::indexer::error::{IndexerError, IndexerResult};
use crate::indexer::types::Protocol;

/// What a download link turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadContent {
    Magnet { uri: String, info_hash: Option<String> },
    Torrent { data: Vec<u8>, info_hash: String },
    File { data: Vec<u8>, content_type: Option<String> },
    Stream { url: String },
}

/// Lowercase hex info hash from a magnet's `xt=urn:btih:` parameter
pub fn magnet_info_hash(uri: &str) -> Option<String> {
    let query = uri.strip_prefix("magnet:?")?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.eq_ignore_ascii_case("xt"))
        .and_then(|(_, v)| {
            let v = urlencoding::decode(v).ok()?;
            let lower = v.to_ascii_lowercase();
            lower.strip_prefix("urn:btih:").map(str::to_string)
        })
        .filter(|h| !h.is_empty())
}

/// SHA-1 over the `info` dictionary exactly as it appears in the file
pub fn torrent_info_hash(data: &[u8]) -> IndexerResult<String> {
    let parsed: Bencode = serde_bencode::from_bytes(data)
        .map_err(|e| IndexerError::Parse(format!("invalid torrent file: {}", e)))?;
    if !matches!(parsed, Bencode::Dict(_)) {
        return Err(IndexerError::Parse("torrent is not a dictionary".to_string()));
    }
    let info = info_span(data)
        .ok_or_else(|| IndexerError::Parse("torrent has no info dictionary".to_string()))?;
    let digest = Sha1::digest(info);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Raw bytes of the top-level `info` value
fn info_span(data: &[u8]) -> Option<&[u8]> {
    if data.first() != Some(&b'd') {
        return None;
    }
    let mut pos = 1;
    while data.get(pos) != Some(&b'e') {
        let key_end = skip_value(data, pos)?;
        let key = string_payload(&data[pos..key_end])?;
        let value_end = skip_value(data, key_end)?;
        if key == b"info" {
            return Some(&data[key_end..value_end]);
        }
        pos = value_end;
    }
    None
}

/// Offset just past the value starting at `start`
fn skip_value(data: &[u8], start: usize) -> Option<usize> {
    let mut pos = start;
    let mut depth = 0usize;
    loop {
        match *data.get(pos)? {
            b'i' => pos += data[pos..].iter().position(|&b| b == b'e')? + 1,
            b'l' | b'd' => {
                depth += 1;
                pos += 1;
            }
            b'e' => {
                depth = depth.checked_sub(1)?;
                pos += 1;
            }
            b'0'..=b'9' => {
                let colon = pos + data[pos..].iter().position(|&b| b == b':')?;
                let len: usize = std::str::from_utf8(&data[pos..colon]).ok()?.parse().ok()?;
                pos = colon.checked_add(1)?.checked_add(len)?;
                if pos > data.len() {
                    return None;
                }
            }
            _ => return None,
        }
        if depth == 0 {
            return Some(pos);
        }
    }
}

fn string_payload(token: &[u8]) -> Option<&[u8]> {
    let colon = token.iter().position(|&b| b == b':')?;
    Some(&token[colon + 1..])
}

/// Fetch `url` and classify the result.
///
/// Magnets and streaming links pass through untouched. Redirects are followed
/// by the client; a redirect whose `Location` is a magnet ends the chain.
pub async fn fetch_content(
    http: &IndexerHttpClient,
    url: &str,
    opts: &RequestOptions,
    protocol: Protocol,
) -> IndexerResult<DownloadContent> {
    if url.starts_with("magnet:") {
        return Ok(DownloadContent::Magnet {
            uri: url.to_string(),
            info_hash: magnet_info_hash(url),
        });
    }
    if protocol == Protocol::Streaming || !(url.starts_with("http://") || url.starts_with("https://")) {
        return Ok(DownloadContent::Stream { url: url.to_string() });
    }

    let mut opts = opts.clone();
    opts.follow_redirects = true;
    let response = http.request(url, &opts).await?;

    if response.is_redirect() {
        if let Some(location) = response.location().filter(|l| l.starts_with("magnet:")) {
            debug!(host = %response.host(), "Download redirected to a magnet");
            return Ok(DownloadContent::Magnet {
                uri: location.to_string(),
                info_hash: magnet_info_hash(location),
            });
        }
    }
    if !response.is_success() {
        return Err(IndexerError::Http {
            status: response.status,
            host: response.host(),
            retry_after: None,
        });
    }

    let content_type = response.header("content-type").map(str::to_string);
    let looks_like_torrent = response.body.first() == Some(&b'd')
        || content_type
            .as_deref()
            .is_some_and(|c| c.contains("bittorrent"));

    if protocol == Protocol::Torrent || looks_like_torrent {
        match torrent_info_hash(&response.body) {
            Ok(info_hash) => {
                return Ok(DownloadContent::Torrent {
                    data: response.body,
                    info_hash,
                });
            }
            Err(e) if protocol == Protocol::Torrent => return Err(e),
            Err(_) => {}
        }
    }

    Ok(DownloadContent::File {
        data: response.body,
        content_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magnet_info_hash() {
        assert_eq!(
            magnet_info_hash("magnet:?xt=urn:btih:ABCDEF&dn=x").as_deref(),
            Some("abcdef")
        );
        assert_eq!(
            magnet_info_hash("magnet:?dn=x&xt=urn%3Abtih%3A0123").as_deref(),
            Some("0123")
        );
        assert_eq!(magnet_info_hash("magnet:?dn=x"), None);
        assert_eq!(magnet_info_hash("https://x/y.torrent"), None);
    }

    #[test]
    fn test_torrent_info_hash() {
        let info = b"d6:lengthi12e4:name8:file.txt12:piece lengthi16384e6:pieces0:e";
        let mut torrent = b"d8:announce9:udp://x:14:info".to_vec();
        torrent.extend_from_slice(info);
        torrent.push(b'e');

        let expected: String = Sha1::digest(info).iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(torrent_info_hash(&torrent).unwrap(), expected);

        assert!(torrent_info_hash(b"<html>not a torrent</html>").is_err());
        assert!(torrent_info_hash(b"li1ee").is_err());
    }

    #[test]
    fn test_info_hash_uses_original_key_order() {
        // `name` before `length` is not canonical order
        let info = b"d4:name1:a6:lengthi1ee";
        let mut torrent = b"d4:info".to_vec();
        torrent.extend_from_slice(info);
        torrent.extend_from_slice(b"8:announce3:urle");

        assert_eq!(
            torrent_info_hash(&torrent).unwrap(),
            "85a3a9249062df75b75ada08228c85924add19df"
        );
    }

    #[test]
    fn test_info_span_skips_nested_values() {
        let torrent = b"d4:listli1el1:xee4:infod5:filesld6:lengthi3eeee1:zi0ee";
        assert_eq!(info_span(torrent), Some(b"d5:filesld6:lengthi3eeee".as_slice()));
        assert_eq!(info_span(b"d4:info"), None);
        assert_eq!(info_span(b"d3:abc9:shorte"), None);
    }
}
