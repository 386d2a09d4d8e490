use futures::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use super::hash;

const USER_AGENT: &str = "GAMMA-Installer/0.3";
const WRITE_BUFFER_BYTES: usize = 1024 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Progress observer fed with `(bytes_downloaded, total_bytes_or_zero)`.
pub type ByteProgress = dyn Fn(u64, u64) + Send + Sync;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("Download failed after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },
}

/// Backoff before retrying `attempt` (1-based): 2s, 4s, 8s, capped at 10s.
pub fn retry_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_mul(1 << (attempt.saturating_sub(1)).min(3));
    Duration::from_secs(secs.min(10))
}

/// Streams a GET response into `dest`, reporting throttled byte progress.
/// Any failure removes the partial file so a retry starts clean.
pub async fn stream_to_file(
    client: &Client,
    url: &str,
    dest: &Path,
    progress: Option<&ByteProgress>,
) -> Result<u64, DownloadError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let result = stream_to_file_inner(client, url, dest, progress).await;
    if result.is_err() && dest.exists() {
        let _ = tokio::fs::remove_file(dest).await;
    }
    result
}

async fn stream_to_file_inner(
    client: &Client,
    url: &str,
    dest: &Path,
    progress: Option<&ByteProgress>,
) -> Result<u64, DownloadError> {
    let response = client.get(url).send().await?.error_for_status()?;
    let total = response.content_length().unwrap_or(0);

    let file = File::create(dest).await?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, file);
    let mut stream = response.bytes_stream();

    let mut downloaded: u64 = 0;
    let mut last_emit = Instant::now();
    if let Some(progress) = progress {
        progress(0, total);
    }

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        writer.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if let Some(progress) = progress {
            let now = Instant::now();
            if now.duration_since(last_emit) >= PROGRESS_INTERVAL {
                last_emit = now;
                progress(downloaded, total);
            }
        }
    }

    writer.flush().await?;
    if let Some(progress) = progress {
        progress(downloaded, total);
    }
    Ok(downloaded)
}

/// Fetcher for stable URLs (code-hosting archives, release binaries).
/// Checks the cache before touching the network, retries with backoff and
/// verifies MD5 when a digest is known.
pub struct DownloadManager {
    client: Client,
    max_retries: u32,
    check_hashes: bool,
}

impl DownloadManager {
    pub fn new(timeout: Duration, check_hashes: bool) -> Self {
        Self {
            client: Client::builder()
                .user_agent(USER_AGENT)
                // Avoid hanging forever on bad networks / proxies.
                .connect_timeout(Duration::from_secs(10))
                .timeout(timeout)
                .build()
                .expect("Failed to create HTTP client"),
            max_retries: 3,
            check_hashes,
        }
    }

    /// Wraps an existing client (e.g. one carrying a cookie session) in the
    /// same cache/retry/verify flow.
    pub fn with_client(client: Client, check_hashes: bool) -> Self {
        Self {
            client,
            max_retries: 3,
            check_hashes,
        }
    }

    /// True when `dest` exists and can stand in for a fresh download. A
    /// cached file with a mismatched digest is deleted so the caller
    /// re-downloads it.
    pub async fn cached_file_valid(
        &self,
        dest: &Path,
        expected_md5: Option<&str>,
    ) -> Result<bool, DownloadError> {
        if !dest.exists() {
            return Ok(false);
        }
        let Some(expected) = expected_md5.filter(|_| self.check_hashes) else {
            // No digest to check against; accept the cached file as-is.
            return Ok(true);
        };
        if hash::verify_md5(dest, expected).await? {
            Ok(true)
        } else {
            log::warn!(
                "Cached file {} failed hash check, re-downloading",
                dest.display()
            );
            tokio::fs::remove_file(dest).await?;
            Ok(false)
        }
    }

    /// Downloads `url` to `dest` unless a valid cached copy exists.
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected_md5: Option<&str>,
        progress: Option<&ByteProgress>,
    ) -> Result<(), DownloadError> {
        if self.cached_file_valid(dest, expected_md5).await? {
            log::debug!("Using cached file: {}", dest.display());
            return Ok(());
        }

        let mut last_error: Option<DownloadError> = None;
        for attempt in 1..=self.max_retries {
            match stream_to_file(&self.client, url, dest, progress).await {
                Ok(bytes) => {
                    if let Some(expected) = expected_md5.filter(|_| self.check_hashes) {
                        let actual = hash::compute_md5(dest).await?;
                        if !actual.eq_ignore_ascii_case(expected) {
                            tokio::fs::remove_file(dest).await?;
                            last_error = Some(DownloadError::HashMismatch {
                                expected: expected.to_string(),
                                actual,
                            });
                            log::warn!(
                                "Hash mismatch for {} (attempt {}/{})",
                                dest.display(),
                                attempt,
                                self.max_retries
                            );
                            if attempt < self.max_retries {
                                tokio::time::sleep(retry_delay(attempt)).await;
                            }
                            continue;
                        }
                    }
                    log::debug!("Downloaded {} ({} bytes)", dest.display(), bytes);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Download of {} failed (attempt {}/{}): {}",
                        url,
                        attempt,
                        self.max_retries,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(retry_delay(attempt)).await;
                    }
                }
            }
        }

        Err(DownloadError::RetryExhausted {
            attempts: self.max_retries,
            message: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}
