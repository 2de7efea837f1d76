//! `headless_chrome` backed browser workers

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use headless_chrome::{Browser, LaunchOptions};

use super::{BrowserLauncher, BrowserWorker, ChallengeSolution};

/// How long a challenge page may take to clear
const SOLVE_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

const CHALLENGE_MARKERS: &[&str] = &[
    "Just a moment...",
    "cf-browser-verification",
    "cf_chl_opt",
    "DDoS-Guard",
];

#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    pub chrome_path: Option<std::path::PathBuf>,
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserWorker>> {
        let path = self.chrome_path.clone();
        let browser = tokio::task::spawn_blocking(move || -> Result<Browser> {
            let options = LaunchOptions::default_builder()
                .headless(true)
                .path(path)
                .window_size(Some((1920, 1080)))
                .args(vec![OsStr::new("--disable-blink-features=AutomationControlled")])
                .build()
                .map_err(|e| anyhow::anyhow!("invalid launch options: {}", e))?;
            Browser::new(options).context("Failed to start Chrome")
        })
        .await
        .context("Browser launch task panicked")??;

        Ok(Box::new(ChromeWorker {
            browser: Arc::new(browser),
        }))
    }
}

pub struct ChromeWorker {
    browser: Arc<Browser>,
}

fn still_challenged(html: &str) -> bool {
    CHALLENGE_MARKERS.iter().any(|m| html.contains(m))
}

#[async_trait]
impl BrowserWorker for ChromeWorker {
    async fn solve(&mut self, url: &str, user_agent: &str) -> Result<ChallengeSolution> {
        let browser = self.browser.clone();
        let url = url.to_string();
        let user_agent = user_agent.to_string();

        tokio::task::spawn_blocking(move || -> Result<ChallengeSolution> {
            let tab = browser.new_tab().context("Failed to open tab")?;
            tab.set_user_agent(&user_agent, None, None)?;
            tab.enable_stealth_mode()?;
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;

            let started = Instant::now();
            let mut body = tab.get_content()?;
            while still_challenged(&body) {
                if started.elapsed() > SOLVE_TIMEOUT {
                    let _ = tab.close(true);
                    anyhow::bail!("challenge did not clear within {:?}", SOLVE_TIMEOUT);
                }
                std::thread::sleep(POLL_INTERVAL);
                body = tab.get_content()?;
            }

            let mut cookies = HashMap::new();
            let mut cookie_expiry = HashMap::new();
            for cookie in tab.get_cookies()? {
                if cookie.expires > 0.0
                    && let Some(at) = DateTime::<Utc>::from_timestamp(cookie.expires as i64, 0)
                {
                    cookie_expiry.insert(cookie.name.clone(), at);
                }
                cookies.insert(cookie.name, cookie.value);
            }
            let final_url = tab.get_url();
            let _ = tab.close(true);

            Ok(ChallengeSolution {
                cookies,
                cookie_expiry,
                body,
                final_url,
            })
        })
        .await
        .context("Browser solve task panicked")?
    }

    async fn reset(&mut self) -> Result<()> {
        let browser = self.browser.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let tabs = browser.get_tabs().lock().map_err(|_| anyhow::anyhow!("tab list poisoned"))?.clone();
            for tab in tabs.iter().skip(1) {
                let _ = tab.close(true);
            }
            Ok(())
        })
        .await
        .context("Browser reset task panicked")?
    }

    async fn close(&mut self) {
        // Chrome exits when the last handle to the browser is dropped
        let browser = self.browser.clone();
        let _ = tokio::task::spawn_blocking(move || drop(browser)).await;
    }
}
