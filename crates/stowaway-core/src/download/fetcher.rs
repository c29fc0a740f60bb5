//! Content transport for the download manager.
//!
//! A fetch streams into `<destination>.part` and is renamed into place only
//! once every byte is on disk, so a destination path never holds a partial
//! file. Cancellation is checked between chunks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::util::compact_text;

/// How a fetch ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Content is at the destination
    Completed { bytes: u64 },
    /// The token fired; nothing was left on disk
    Cancelled,
}

/// Receives byte counters while a fetch streams.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, downloaded: u64, total: Option<u64>);
}

/// Streams remote content to a local path.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome>;
}

/// Temporary path a fetch writes to before it is renamed into place.
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Remove a leftover partial file, logging instead of failing.
pub async fn remove_partial(destination: &Path) {
    let part = part_path(destination);
    match fs::remove_file(&part).await {
        Ok(()) => tracing::debug!("Removed partial download {}", part.display()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!(
            "Failed to remove partial download {}: {}",
            part.display(),
            error
        ),
    }
}

/// HTTP(S) transport built on `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpContentFetcher {
    client: reqwest::Client,
}

impl HttpContentFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| Error::Download(format!("Failed to construct HTTP client: {error}")))?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (proxies, timeouts, TLS roots).
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn stream_to_part(
        &self,
        url: &str,
        part: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>> {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            response = self.client.get(url).send() => response
                .map_err(|error| Error::Download(format!("Download request failed: {error}")))?,
        };
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Download(format!(
                "Download request failed with HTTP {status}: {}",
                compact_text(&body)
            )));
        }

        let total = response.content_length();
        let mut file = fs::File::create(part).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0_u64;

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(None),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|error| {
                Error::Download(format!("Failed to read content bytes: {error}"))
            })?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress.report(downloaded, total).await;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(Some(downloaded))
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        let part = part_path(destination);

        match self.stream_to_part(url, &part, progress, cancel).await {
            Ok(Some(bytes)) => {
                fs::rename(&part, destination).await?;
                Ok(FetchOutcome::Completed { bytes })
            }
            Ok(None) => {
                remove_partial(destination).await;
                Ok(FetchOutcome::Cancelled)
            }
            Err(error) => {
                remove_partial(destination).await;
                Err(error)
            }
        }
    }
}
