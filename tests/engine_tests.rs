//! End-to-end tests against a mock tracker

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use cardigann::http::{HostRateLimitConfig, HttpClientConfig, IndexerHttpClient, RetryConfig};
use cardigann::indexer::cardigann::torrent_info_hash;
use cardigann::indexer::{
    DefinitionCatalog, DownloadContent, IndexerContext, IndexerInstanceConfig, IndexerManager,
    SearchCriteria, parse_definition,
};
use cardigann::session::HealthStore;

const PRIVATE_TRACKER: &str = r#"
id: mocktracker
name: Mock Tracker
type: private
links:
  - SITE_URL/
settings:
  - name: username
    type: text
  - name: password
    type: password
caps:
  categorymappings:
    - {id: 1, cat: Movies, desc: Movies}
    - {id: 5, cat: TV, desc: TV}
  modes:
    search: [q]
    tv-search: [q, season, ep]
login:
  path: login.php
  method: post
  inputs:
    username: "{{ .Config.username }}"
    password: "{{ .Config.password }}"
  test:
    path: index.php
    selector: a.logout
search:
  path: browse.php
  inputs:
    q: "{{ .Keywords }}"
  rows:
    selector: table#torrents tr.row
  fields:
    title:
      selector: a.title
    details:
      selector: a.title
      attribute: href
    download:
      selector: a.dl
      attribute: href
    size:
      selector: td.size
    seeders:
      selector: td.seeders
    grabs:
      selector: td.grabs
      optional: true
      default: "0"
    category:
      selector: td.cat
"#;

const PUBLIC_TRACKER: &str = r#"
id: mockpublic
name: Mock Public
type: public
links:
  - SITE_URL/
  - MIRROR_URL/
caps:
  categorymappings:
    - {id: 1, cat: Movies, desc: Movies}
  modes:
    search: [q]
search:
  path: search
  inputs:
    q: "{{ .Keywords }}"
  rows:
    selector: li.result
  fields:
    title:
      selector: span.name
    details:
      selector: a.details
      attribute: href
    download:
      selector: a.details
      attribute: href
    seeders:
      selector: span.seeds
download:
  selectors:
    - selector: a[href^="magnet:"]
      attribute: href
    - selector: a.torrent
      attribute: href
"#;

const LOGGED_IN_PAGE: &str = r#"<html><body><a class="logout" href="/logout.php">Logout</a></body></html>"#;

const BROWSE_ROWS: &str = r#"
<table id="torrents">
  <tr class="row">
    <td class="cat">5</td>
    <td><a class="title" href="/details.php?id=1">My Show S01E05 720p</a></td>
    <td><a class="dl" href="/download.php?id=1">DL</a></td>
    <td class="size">1.5 GB</td>
    <td class="seeders">12</td>
  </tr>
  <tr class="row">
    <td class="cat">5</td>
    <td><a class="title" href="/details.php?id=2">My Show S01E05 1080p</a></td>
    <td><a class="dl" href="/download.php?id=2">DL</a></td>
    <td class="size">3 GB</td>
    <td class="seeders">4</td>
    <td class="grabs">77</td>
  </tr>
  <tr class="row">
    <td class="cat">5</td>
    <td><a class="title" href="/details.php?id=3">My Show S01E05 dead</a></td>
    <td><a class="dl" href="/download.php?id=3">DL</a></td>
    <td class="size">700 MB</td>
    <td class="seeders">0</td>
  </tr>
</table>"#;

fn http_client() -> Arc<IndexerHttpClient> {
    let config = HttpClientConfig {
        host_rate_limit: HostRateLimitConfig {
            requests_per_second: 100,
            burst_size: 100,
        },
        retry: RetryConfig {
            max_retries: 2,
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(20),
            multiplier: 2.0,
        },
        mirror_failover_delay: Duration::from_millis(10),
        ..HttpClientConfig::default()
    };
    Arc::new(IndexerHttpClient::new(config).unwrap())
}

fn manager(yaml: &str, site: &str, mirror: &str) -> IndexerManager {
    let yaml = yaml.replace("SITE_URL", site).replace("MIRROR_URL", mirror);
    let mut catalog = DefinitionCatalog::new();
    catalog.insert(parse_definition(&yaml).unwrap());
    IndexerManager::new(catalog, IndexerContext::new(http_client()))
}

fn instance(definition_id: &str, settings: &[(&str, &str)]) -> IndexerInstanceConfig {
    IndexerInstanceConfig {
        id: definition_id.to_string(),
        definition_id: definition_id.to_string(),
        name: definition_id.to_string(),
        enabled: true,
        settings: settings
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    }
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_string(body)
}

fn has_session_cookie(req: &Request) -> bool {
    req.headers
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|c| c.contains("uid=42"))
}

async fn mount_login(server: &MockServer, expected_logins: u64) {
    Mock::given(method("POST"))
        .and(path("/login.php"))
        .and(|req: &Request| {
            let body = String::from_utf8_lossy(&req.body);
            body.contains("username=alice") && body.contains("password=hunter2")
        })
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("location", "/index.php")
                .insert_header("set-cookie", "uid=42; Path=/"),
        )
        .expect(expected_logins)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/index.php"))
        .and(has_session_cookie)
        .respond_with(html(LOGGED_IN_PAGE))
        .mount(server)
        .await;
}

#[tokio::test]
async fn login_then_tv_search() {
    let server = MockServer::start().await;
    mount_login(&server, 1).await;

    Mock::given(method("GET"))
        .and(path("/browse.php"))
        .and(query_param("q", "My Show S01E05"))
        .and(has_session_cookie)
        .respond_with(html(&format!("<html><body>{}{}</body></html>", LOGGED_IN_PAGE, BROWSE_ROWS)))
        .expect(1)
        .mount(&server)
        .await;

    let manager = manager(PRIVATE_TRACKER, &server.uri(), &server.uri());
    manager
        .load_indexer(instance("mocktracker", &[("username", "alice"), ("password", "hunter2")]))
        .unwrap();

    let criteria = SearchCriteria::tv_search("My Show").with_season_episode(1, Some("5"));
    let results = manager.search_all(&criteria).await;
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.error, None);
    assert!(!result.from_cache);

    // The zero-seeder row is rejected
    let titles: Vec<&str> = result.releases.iter().map(|r| r.title.as_str()).collect();
    assert_eq!(titles, vec!["My Show S01E05 720p", "My Show S01E05 1080p"]);

    let first = &result.releases[0];
    assert_eq!(first.link.as_deref(), Some(format!("{}/download.php?id=1", server.uri()).as_str()));
    assert_eq!(first.details.as_deref(), Some(format!("{}/details.php?id=1", server.uri()).as_str()));
    assert_eq!(first.guid, format!("{}/details.php?id=1", server.uri()));
    assert_eq!(first.size, Some(1_610_612_736));
    assert_eq!(first.categories, vec![5000]);
    assert_eq!(first.indexer_id.as_deref(), Some("mocktracker"));
    assert_eq!(first.torrent().and_then(|t| t.seeders), Some(12));
    assert_eq!(first.torrent().and_then(|t| t.grabs), Some(0));
    assert_eq!(result.releases[1].torrent().and_then(|t| t.grabs), Some(77));

    let health = manager
        .context()
        .health
        .load_health("mocktracker")
        .await
        .unwrap()
        .unwrap();
    assert!(health.last_success_at.is_some());
    assert_eq!(health.error_count, 0);

    // Second identical search is served from cache without touching the site
    let cached = manager.search_all(&criteria).await;
    assert!(cached[0].from_cache);
    assert_eq!(cached[0].releases.len(), 2);
}

#[tokio::test]
async fn expired_session_logs_in_exactly_once_more() {
    let server = MockServer::start().await;
    mount_login(&server, 2).await;

    // The browse page never shows the logged-in marker
    Mock::given(method("GET"))
        .and(path("/browse.php"))
        .respond_with(html(&format!("<html><body>{}</body></html>", BROWSE_ROWS)))
        .expect(2)
        .mount(&server)
        .await;

    let manager = manager(PRIVATE_TRACKER, &server.uri(), &server.uri());
    manager
        .load_indexer(instance("mocktracker", &[("username", "alice"), ("password", "hunter2")]))
        .unwrap();

    let mut criteria = SearchCriteria::search("My Show");
    criteria.cache = false;
    let results = manager.search_all(&criteria).await;
    assert_eq!(results[0].error, None);
    assert_eq!(results[0].releases.len(), 2);
}

#[tokio::test]
async fn rejected_login_fails_connection_test() {
    let server = MockServer::start().await;
    mount_login(&server, 0).await;
    Mock::given(method("POST"))
        .and(path("/login.php"))
        .respond_with(html("<html><body><div class=\"error\">Wrong password</div></body></html>"))
        .mount(&server)
        .await;

    let manager = manager(PRIVATE_TRACKER, &server.uri(), &server.uri());
    manager
        .load_indexer(instance("mocktracker", &[("username", "alice"), ("password", "wrong")]))
        .unwrap();

    let err = manager.test_indexer("mocktracker").await.unwrap_err();
    assert_eq!(err.to_string(), "Authentication failed; check your credentials");

    let health = manager
        .context()
        .health
        .load_health("mocktracker")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.error_count, 1);
}

#[tokio::test]
async fn search_fails_over_to_mirror() {
    let primary = MockServer::start().await;
    let mirror = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&primary)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "ubuntu"))
        .respond_with(html(
            r#"<ul><li class="result"><span class="name">ubuntu-24.04.iso</span>
               <a class="details" href="/t/99">x</a><span class="seeds">300</span></li></ul>"#,
        ))
        .expect(1)
        .mount(&mirror)
        .await;

    let manager = manager(PUBLIC_TRACKER, &primary.uri(), &mirror.uri());
    manager.load_indexer(instance("mockpublic", &[])).unwrap();

    let results = manager.search_all(&SearchCriteria::search("ubuntu")).await;
    assert_eq!(results[0].error, None);
    assert_eq!(results[0].releases.len(), 1);
    assert_eq!(results[0].releases[0].title, "ubuntu-24.04.iso");
}

#[tokio::test]
async fn http_error_is_recorded_as_health_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let manager = manager(PUBLIC_TRACKER, &server.uri(), &server.uri());
    manager.load_indexer(instance("mockpublic", &[])).unwrap();

    let results = manager.search_all(&SearchCriteria::search("anything")).await;
    assert_eq!(results[0].error.as_deref(), Some("The indexer returned an HTTP 404 error"));
    assert!(results[0].releases.is_empty());

    let health = manager
        .context()
        .health
        .load_health("mockpublic")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.error_count, 1);
    assert_eq!(health.last_error.as_deref(), Some("The indexer returned an HTTP 404 error"));
}

#[tokio::test]
async fn challenge_without_browser_is_blocked() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(
            ResponseTemplate::new(503)
                .insert_header("server", "cloudflare")
                .set_body_string("<html><title>Just a moment...</title></html>"),
        )
        .mount(&server)
        .await;

    let manager = manager(PUBLIC_TRACKER, &server.uri(), &server.uri());
    manager.load_indexer(instance("mockpublic", &[])).unwrap();

    let results = manager.search_all(&SearchCriteria::search("anything")).await;
    assert_eq!(
        results[0].error.as_deref(),
        Some("The indexer is blocking automated access (anti-bot protection)")
    );
}

#[tokio::test]
async fn download_resolves_magnet_from_details_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/t/7"))
        .respond_with(html(
            r#"<html><body>
               <a href="magnet:?xt=urn:btih:0123456789ABCDEF0123456789ABCDEF01234567&amp;dn=Test">Magnet</a>
               </body></html>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;

    let manager = manager(PUBLIC_TRACKER, &server.uri(), &server.uri());
    manager.load_indexer(instance("mockpublic", &[])).unwrap();

    let content = manager
        .download("mockpublic", &format!("{}/t/7", server.uri()))
        .await
        .unwrap();
    match content {
        DownloadContent::Magnet { uri, info_hash } => {
            assert!(uri.starts_with("magnet:?xt=urn:btih:0123456789ABCDEF"));
            assert_eq!(info_hash.as_deref(), Some("0123456789abcdef0123456789abcdef01234567"));
        }
        other => panic!("expected magnet, got {:?}", other),
    }
}

#[tokio::test]
async fn download_checks_and_fetches_torrent() {
    let server = MockServer::start().await;
    let mut torrent = b"d8:announce13:udp://tracker4:info".to_vec();
    torrent.extend_from_slice(b"d6:lengthi42e4:name5:a.iso12:piece lengthi16384e6:pieces0:e");
    torrent.push(b'e');

    Mock::given(method("GET"))
        .and(path("/t/8"))
        .respond_with(html(r#"<html><body><a class="torrent" href="/get/8.torrent">Get</a></body></html>"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/get/8.torrent"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/x-bittorrent")
                .set_body_bytes(torrent.clone()),
        )
        .mount(&server)
        .await;

    let manager = manager(PUBLIC_TRACKER, &server.uri(), &server.uri());
    manager.load_indexer(instance("mockpublic", &[])).unwrap();

    let indexer = manager.get_indexer("mockpublic").unwrap();
    let resolved = indexer
        .download_url(&format!("{}/t/8", server.uri()))
        .await
        .unwrap();
    assert_eq!(resolved.as_str(), format!("{}/get/8.torrent", server.uri()));

    let content = indexer
        .download_content(&format!("{}/t/8", server.uri()))
        .await
        .unwrap();
    assert_eq!(
        content,
        DownloadContent::Torrent {
            info_hash: torrent_info_hash(&torrent).unwrap(),
            data: torrent,
        }
    );
}
