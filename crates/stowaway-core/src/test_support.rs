//! Fakes shared by unit tests across modules.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::download::{part_path, remove_partial, ContentFetcher, FetchOutcome, ProgressSink};
use crate::error::{Error, Result};
use crate::models::ResourceType;
use crate::remote::{ContentLocation, RemoteApi, RemoteError, RemoteOutcome, RemoteRequest};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` every 10ms for up to 5s.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

type Scripted = std::result::Result<RemoteOutcome, RemoteError>;

/// Remote API that applies everything unless a reply is scripted for a resource.
#[derive(Default)]
pub struct FakeRemote {
    replies: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<RemoteRequest>>,
    content: Mutex<HashMap<String, ContentLocation>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the next reply for calls about `resource_id`.
    pub fn respond(&self, resource_id: &str, reply: Scripted) {
        self.replies
            .lock()
            .unwrap()
            .entry(resource_id.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn serve_content(&self, resource_id: &str, size: Option<u64>) {
        self.content.lock().unwrap().insert(
            resource_id.to_string(),
            ContentLocation {
                url: format!("https://cdn.test/{resource_id}"),
                resource_type: ResourceType::MediaAttachment,
                expected_size: size,
            },
        );
    }

    pub fn calls(&self) -> Vec<RemoteRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn reply(&self, request: &RemoteRequest) -> Scripted {
        self.calls.lock().unwrap().push(request.clone());
        let key = request.resource_id.clone().unwrap_or_default();
        self.replies
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(RemoteOutcome::applied()))
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn create(&self, request: &RemoteRequest) -> Scripted {
        self.reply(request)
    }

    async fn update(&self, request: &RemoteRequest) -> Scripted {
        self.reply(request)
    }

    async fn delete(&self, request: &RemoteRequest) -> Scripted {
        self.reply(request)
    }

    async fn upload(&self, request: &RemoteRequest) -> Scripted {
        self.reply(request)
    }

    async fn download(&self, request: &RemoteRequest) -> Scripted {
        self.reply(request)
    }

    async fn resolve_content(
        &self,
        resource_id: &str,
    ) -> std::result::Result<ContentLocation, RemoteError> {
        self.content
            .lock()
            .unwrap()
            .get(resource_id)
            .cloned()
            .ok_or_else(|| RemoteError::with_status(404, format!("no content for {resource_id}")))
    }
}

/// Writes `size` bytes per fetch; can hold fetches open or fail chosen URLs.
pub struct FakeFetcher {
    size: u64,
    held: AtomicBool,
    failing: Mutex<HashSet<String>>,
    started: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeFetcher {
    pub fn new(size: u64) -> Arc<Self> {
        Arc::new(Self {
            size,
            held: AtomicBool::new(false),
            failing: Mutex::new(HashSet::new()),
            started: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Keep fetches open after their first chunk until [`FakeFetcher::release`].
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    /// URLs in the order their fetches started.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn write(
        &self,
        url: &str,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = part_path(destination);
        let half = usize::try_from(self.size / 2).unwrap_or(0);
        tokio::fs::write(&part, vec![b'x'; half]).await?;
        progress.report(self.size / 2, Some(self.size)).await;

        while self.held.load(Ordering::SeqCst) {
            tokio::select! {
                () = cancel.cancelled() => {
                    remove_partial(destination).await;
                    return Ok(FetchOutcome::Cancelled);
                }
                () = tokio::time::sleep(Duration::from_millis(5)) => {}
            }
        }
        if cancel.is_cancelled() {
            remove_partial(destination).await;
            return Ok(FetchOutcome::Cancelled);
        }
        if self.failing.lock().unwrap().contains(url) {
            remove_partial(destination).await;
            return Err(Error::Download(format!("Download request failed with HTTP 500: {url}")));
        }

        let full = usize::try_from(self.size).unwrap_or(0);
        tokio::fs::write(&part, vec![b'x'; full]).await?;
        tokio::fs::rename(&part, destination).await?;
        progress.report(self.size, Some(self.size)).await;
        Ok(FetchOutcome::Completed { bytes: self.size })
    }
}

#[async_trait]
impl ContentFetcher for FakeFetcher {
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        self.started.lock().unwrap().push(url.to_string());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        let outcome = self.write(url, destination, progress, cancel).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}
