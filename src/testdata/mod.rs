use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use futures_util::future;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    io::AsyncWriteExt,
    sync::{oneshot, Semaphore},
    time::timeout,
};
use tracing::{debug, instrument, warn};

use crate::{conf, shared, shared::Cancelled};

type DownloadResult = Result<(), String>;
type WaiterMap = HashMap<String, Vec<oneshot::Sender<DownloadResult>>>;

/// Content-addressed testdata files on local disk, keyed by their sha-256.
/// Each file is written through a temp-file rename, so concurrent readers
/// never observe a partial file.
///
/// Downloads are deduplicated per content id: the first requester spawns a
/// detached driver task and everyone (the first requester included) parks a
/// waiter on it. The driver outlives any single submission, so a canceled
/// task never starves the other subscribers, and its result fans out to
/// every waiter registered while it ran.
pub struct TestdataStore {
    root: PathBuf,
    client: Client,
    download_slots: Arc<Semaphore>,
    waiters: Arc<Mutex<WaiterMap>>,
}

impl TestdataStore {
    pub fn new(root: PathBuf, client: Client) -> Self {
        Self {
            root,
            client,
            download_slots: Arc::new(Semaphore::new(conf::CONFIG.max_concurrent_downloads)),
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn path_of(&self, content_id: &str) -> PathBuf {
        self.root.join(content_id)
    }

    pub async fn missing<'a>(
        &self,
        content_ids: impl IntoIterator<Item = &'a String>,
    ) -> Vec<String> {
        let mut missing = vec![];
        for content_id in content_ids {
            if fs::metadata(self.path_of(content_id)).await.is_err() {
                missing.push(content_id.clone());
            }
        }
        missing
    }

    /// Downloads `(content id, url)` pairs, sharing in-flight downloads with
    /// other submissions. Exhausted retries fail the whole batch.
    #[instrument(skip_all, fields(count = files.len()))]
    pub async fn download_all(
        &self,
        files: &[(String, String)],
        abort: triggered::Listener,
    ) -> Result<()> {
        let results = future::join_all(
            files.iter().map(|(content_id, url)| self.fetch_one(content_id, url, abort.clone())),
        )
        .await;

        results.into_iter().collect()
    }

    async fn fetch_one(
        &self,
        content_id: &str,
        url: &str,
        abort: triggered::Listener,
    ) -> Result<()> {
        let waiter = {
            let (waiter_tx, waiter_rx) = oneshot::channel();
            let mut waiters = self.waiters.lock().unwrap();
            match waiters.get_mut(content_id) {
                Some(pending) => pending.push(waiter_tx),
                None => {
                    waiters.insert(content_id.to_string(), vec![waiter_tx]);
                    tokio::spawn(drive_download(
                        self.client.clone(),
                        self.download_slots.clone(),
                        self.root.clone(),
                        self.waiters.clone(),
                        content_id.to_string(),
                        url.to_string(),
                    ));
                }
            }
            waiter_rx
        };

        tokio::select! {
            _ = abort => bail!(Cancelled),
            result = waiter => match result {
                Err(_) => bail!("The download of {content_id} was dropped"),
                Ok(Err(message)) => bail!("Testdata {content_id} is unavailable: {message}"),
                Ok(Ok(())) => Ok(()),
            },
        }
    }
}

/// Runs the retrying download for one content id and fans the result out to
/// every waiter that subscribed in the meantime.
async fn drive_download(
    client: Client,
    download_slots: Arc<Semaphore>,
    root: PathBuf,
    waiters: Arc<Mutex<WaiterMap>>,
    content_id: String,
    url: String,
) {
    let result = download_with_retries(&client, &download_slots, &root, &content_id, &url).await;

    let pending = waiters.lock().unwrap().remove(&content_id).unwrap_or_default();
    debug!(content_id, waiters = pending.len(), ok = result.is_ok(), "Download settled");
    for waiter in pending {
        _ = waiter.send(result.clone());
    }
}

async fn download_with_retries(
    client: &Client,
    download_slots: &Semaphore,
    root: &PathBuf,
    content_id: &str,
    url: &str,
) -> DownloadResult {
    // Another submission may have finished this file between the caller's
    // missing-check and this driver starting.
    if fs::metadata(root.join(content_id)).await.is_ok() {
        return Ok(());
    }

    let _permit = match download_slots.acquire().await {
        Err(err) => return Err(format!("{err:#}")),
        Ok(permit) => permit,
    };

    let mut last_error = "No download attempt was made".to_string();
    for attempt in 0..conf::CONFIG.download_retry.max(1) {
        let result = timeout(
            Duration::from_millis(conf::CONFIG.download_timeout_ms),
            download_once(client, root, content_id, url),
        )
        .await;

        match result {
            Err(_) => {
                last_error = "The download timed out".to_string();
            }
            Ok(Err(err)) => {
                last_error = format!("{err:#}");
            }
            Ok(Ok(())) => return Ok(()),
        }

        debug!(content_id, attempt, "Download attempt failed: {last_error}");
    }

    Err(last_error)
}

async fn download_once(
    client: &Client,
    root: &PathBuf,
    content_id: &str,
    url: &str,
) -> Result<()> {
    let mut response = client
        .get(url)
        .send()
        .await
        .context("Error sending the request")?
        .error_for_status()
        .context("Got a non-ok response")?;

    let temp_path = root.join(format!(".download-{}", shared::random_scratch_id()));
    let result = async {
        let mut file =
            fs::File::create(&temp_path).await.context("Error creating the temp file")?;
        let mut hasher = Sha256::new();

        while let Some(chunk) = response.chunk().await.context("Error reading the body")? {
            hasher.update(&chunk);
            file.write_all(&chunk).await.context("Error writing the temp file")?;
        }
        file.flush().await.context("Error flushing the temp file")?;

        let digest = hex::encode(hasher.finalize());
        if digest != content_id {
            bail!("Content digest mismatch: expected {content_id}, got {digest}");
        }

        fs::rename(&temp_path, root.join(content_id))
            .await
            .context("Error moving the file into the store")?;
        Ok(())
    }
    .await;

    if result.is_err() {
        if let Err(err) = fs::remove_file(&temp_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %temp_path.display(), "Error removing the temp file: {err:#}");
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::{fs, sync::oneshot};

    use super::TestdataStore;
    use crate::shared;

    fn make_store(root: &std::path::Path) -> TestdataStore {
        TestdataStore {
            root: root.to_path_buf(),
            client: shared::http::build_http_client(),
            download_slots: Arc::new(tokio::sync::Semaphore::new(2)),
            waiters: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        }
    }

    #[tokio::test]
    async fn test_missing_skips_present_files() {
        let root = tempfile::tempdir().unwrap();
        let store = make_store(root.path());

        let present = "a".repeat(64);
        let absent = "b".repeat(64);
        fs::write(store.path_of(&present), b"data").await.unwrap();

        let wanted = [present, absent.clone()];
        assert_eq!(store.missing(wanted.iter()).await, vec![absent]);
    }

    #[tokio::test]
    async fn test_waiters_share_one_download() {
        let root = tempfile::tempdir().unwrap();
        let store = make_store(root.path());
        let content_id = "c".repeat(64);

        // Occupy the driver slot by hand: later requesters must subscribe
        // instead of spawning a second download.
        let (first_tx, _first_rx) = oneshot::channel();
        store.waiters.lock().unwrap().insert(content_id.clone(), vec![first_tx]);

        let (_abort_tx, abort) = triggered::trigger();
        let fetch = store.fetch_one(&content_id, "http://unused.invalid/file", abort);

        // Settle the download from the driver's side.
        let settle = async {
            loop {
                let pending = {
                    let mut waiters = store.waiters.lock().unwrap();
                    if waiters.get(&content_id).map(Vec::len) == Some(2) {
                        waiters.remove(&content_id)
                    } else {
                        None
                    }
                };
                match pending {
                    Some(pending) => {
                        for waiter in pending {
                            _ = waiter.send(Ok(()));
                        }
                        break;
                    }
                    None => tokio::task::yield_now().await,
                }
            }
        };

        let (result, ()) = tokio::join!(fetch, settle);
        result.unwrap();
        assert!(store.waiters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aborted_waiter_leaves_quietly() {
        let root = tempfile::tempdir().unwrap();
        let store = make_store(root.path());
        let content_id = "d".repeat(64);

        let (driver_tx, _driver_rx) = oneshot::channel();
        store.waiters.lock().unwrap().insert(content_id.clone(), vec![driver_tx]);

        let (abort_tx, abort) = triggered::trigger();
        abort_tx.trigger();

        let result = store.fetch_one(&content_id, "http://unused.invalid/file", abort).await;
        assert!(shared::is_cancelled(&result.unwrap_err()));

        // The abandoned waiter is still parked for the in-flight download.
        assert_eq!(store.waiters.lock().unwrap().get(&content_id).map(Vec::len), Some(2));
    }
}
