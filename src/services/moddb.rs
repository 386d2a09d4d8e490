use regex::Regex;
use reqwest::cookie::Jar;
use reqwest::redirect::Policy;
use reqwest::Client;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

use crate::utils::download::{retry_delay, ByteProgress, DownloadError, DownloadManager};

pub const MODDB_BASE_URL: &str = "https://www.moddb.com";

/// A browser-like identity keeps the distributor's anti-bot screen happy;
/// the shared cookie jar carries whatever challenge tokens it hands out.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const MAX_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum ModDbError {
    #[error("Failed to scrape page {url}: {reason}")]
    ScrapeFailed { url: String, reason: String },
    #[error("Could not resolve mirror page {0} to a download URL")]
    MirrorResolutionFailed(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// Metadata lifted from a mod's info page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedPage {
    pub download_url: String,
    pub filename: Option<String>,
    pub md5: Option<String>,
}

fn download_button_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<a\s[^>]*buttondownload[^>]*>"#).expect("invalid download button regex")
    })
}

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"href="([^"]*)""#).expect("invalid href regex"))
}

fn metadata_row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<span[^>]*>([^<]+)</span>\s*<span[^>]*>([^<]+)</span>"#)
            .expect("invalid metadata regex")
    })
}

fn meta_refresh_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<meta[^>]*http-equiv="refresh"[^>]*content="[^"]*url=([^"]+)""#)
            .expect("invalid meta refresh regex")
    })
}

fn script_location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)(?:window\.)?location(?:\.href)?\s*=\s*['"]([^'"]+)['"]"#)
            .expect("invalid location regex")
    })
}

fn resolve_url(href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{}", MODDB_BASE_URL, href)
    } else {
        format!("{}/{}", MODDB_BASE_URL, href)
    }
}

/// Download-button target from an info page, resolved against the site root.
pub fn parse_download_link(html: &str) -> Option<String> {
    let tag = download_button_re().find(html)?;
    let href = href_re().captures(tag.as_str())?.get(1)?.as_str();
    if href.is_empty() {
        return None;
    }
    Some(resolve_url(href))
}

/// Filename and MD5 digest from the labelled metadata rows of an info page.
pub fn parse_file_metadata(html: &str) -> (Option<String>, Option<String>) {
    let mut filename = None;
    let mut md5 = None;

    for captures in metadata_row_re().captures_iter(html) {
        let label = captures[1].trim().to_lowercase();
        let value = captures[2].trim().to_string();
        if value.is_empty() {
            continue;
        }
        if label.contains("filename") && filename.is_none() {
            filename = Some(value);
        } else if label.contains("md5") && md5.is_none() {
            md5 = Some(value.to_lowercase());
        }
    }

    (filename, md5)
}

/// Redirect target embedded in a mirror page body (meta refresh first, then
/// an inline script assigning `location`).
pub fn parse_mirror_redirect(html: &str) -> Option<String> {
    if let Some(captures) = meta_refresh_re().captures(html) {
        return Some(resolve_url(captures[1].trim()));
    }
    if let Some(captures) = script_location_re().captures(html) {
        return Some(resolve_url(captures[1].trim()));
    }
    None
}

/// Turns a mod's info/download page pair into a verified local file, through
/// the anti-bot screen and the mirror indirection.
pub struct ModDbClient {
    client: Client,
    no_redirect_client: Client,
    downloader: DownloadManager,
}

impl ModDbClient {
    pub fn new(timeout: Duration, check_hashes: bool) -> Self {
        let jar = Arc::new(Jar::default());

        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .cookie_provider(jar.clone())
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        // Mirror pages answer with a 3xx we must observe, not follow.
        let no_redirect_client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .cookie_provider(jar)
            .redirect(Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        let downloader = DownloadManager::with_client(client.clone(), check_hashes);

        Self {
            client,
            no_redirect_client,
            downloader,
        }
    }

    /// Scrapes an info page for the download-button URL plus filename/MD5
    /// metadata, retrying transient fetch failures.
    pub async fn scrape_download_page(&self, info_url: &str) -> Result<ScrapedPage, ModDbError> {
        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.scrape_once(info_url).await {
                Ok(page) => return Ok(page),
                Err(e) => {
                    log::warn!(
                        "Scrape of {} failed (attempt {}/{}): {}",
                        info_url,
                        attempt,
                        MAX_ATTEMPTS,
                        e
                    );
                    last_error = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(retry_delay(attempt)).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ModDbError::ScrapeFailed {
            url: info_url.to_string(),
            reason: "no attempts made".to_string(),
        }))
    }

    async fn scrape_once(&self, info_url: &str) -> Result<ScrapedPage, ModDbError> {
        let html = self
            .client
            .get(info_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let download_url =
            parse_download_link(&html).ok_or_else(|| ModDbError::ScrapeFailed {
                url: info_url.to_string(),
                reason: "download button not found".to_string(),
            })?;

        let (filename, md5) = parse_file_metadata(&html);
        if filename.is_none() && md5.is_none() {
            log::warn!("No file metadata found on {}", info_url);
        }

        log::debug!(
            "Scraped {} -> {} (file: {:?}, md5: {:?})",
            info_url,
            download_url,
            filename,
            md5
        );
        Ok(ScrapedPage {
            download_url,
            filename,
            md5,
        })
    }

    /// Follows the mirror indirection one step: an HTTP redirect, a meta
    /// refresh, or an inline script, in that order.
    pub async fn resolve_mirror(&self, download_url: &str) -> Result<String, ModDbError> {
        let response = self.no_redirect_client.get(download_url).send().await?;

        if response.status().is_redirection() {
            if let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|value| value.to_str().ok())
            {
                return Ok(resolve_url(location));
            }
        }

        let html = response.error_for_status()?.text().await?;
        parse_mirror_redirect(&html)
            .ok_or_else(|| ModDbError::MirrorResolutionFailed(download_url.to_string()))
    }

    /// Full fetch workflow: cache check, metadata scrape when no digest is
    /// known, mirror resolution with direct-URL fallback, streaming download
    /// with retry and verification.
    pub async fn fetch_mod(
        &self,
        info_url: Option<&str>,
        download_url: &str,
        dest: &Path,
        expected_md5: Option<&str>,
        progress: Option<&ByteProgress>,
    ) -> Result<(), ModDbError> {
        if self.downloader.cached_file_valid(dest, expected_md5).await? {
            log::info!("Using cached file: {}", dest.display());
            return Ok(());
        }

        let mut expected = expected_md5.map(|hash| hash.to_string());
        if expected.is_none() {
            if let Some(info_url) = info_url.filter(|url| !url.is_empty()) {
                match self.scrape_download_page(info_url).await {
                    Ok(page) => expected = page.md5,
                    Err(e) => log::warn!("Could not scrape digest for {}: {}", info_url, e),
                }
            }
        }

        let final_url = match self.resolve_mirror(download_url).await {
            Ok(url) => url,
            Err(e) => {
                log::warn!(
                    "Mirror resolution failed ({}), trying direct download",
                    e
                );
                download_url.to_string()
            }
        };

        self.downloader
            .fetch(&final_url, dest, expected.as_deref(), progress)
            .await?;
        Ok(())
    }
}
