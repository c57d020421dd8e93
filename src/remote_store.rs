//! Remote document store backend.
//!
//! Talks JSON over HTTP to a document service:
//!
//! * `GET  {base}/health` answers 2xx when the service is up
//! * `GET  {base}/collections/{name}` returns `{ id: document, ... }`
//! * `POST {base}/batch` applies a [`WriteBatch`] atomically
//!
//! Reads are served from a local mirror. Writes land in the mirror at once and
//! are queued; the queue is flushed in order whenever the service is
//! reachable. Mirror and queue are kept in a cache file so nothing accepted
//! offline is lost across restarts. Conflicts resolve as last write wins.
//!
//! The cache also keeps the service's last known state. A batch the service
//! refuses is taken out of the queue and the mirror is rebuilt from that
//! state plus whatever is still queued.
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;

use crate::{
    changed_collections, ensure_dir, read_json_file, write_json_atomic, BackendKind,
    ChangeListener, Collection, DocumentStore, Documents, Listeners, OmniError, Result,
    StoreSnapshot, Subscription, SyncStatusReporter, WriteBatch,
};

const CACHE_FILE: &str = "remote-cache.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedBatch {
    seq: u64,
    batch: WriteBatch,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RemoteCache {
    /// `confirmed` with every pending batch applied on top.
    mirror: StoreSnapshot,
    /// The service's state as of the last pull plus every batch it accepted since.
    confirmed: StoreSnapshot,
    pending: VecDeque<QueuedBatch>,
    next_seq: u64,
}

impl RemoteCache {
    fn enqueue(&mut self, batch: WriteBatch) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        batch.apply_to(&mut self.mirror);
        self.pending.push_back(QueuedBatch { seq, batch });
        seq
    }

    fn rebuild_mirror(&mut self) {
        let mut mirror = self.confirmed.clone();
        for queued in &self.pending {
            queued.batch.apply_to(&mut mirror);
        }
        self.mirror = mirror;
    }
}

enum Delivery {
    Delivered,
    Offline(OmniError),
    Rejected(OmniError),
}

/// A queued batch the service refused.
struct Rejection {
    seq: u64,
    error: OmniError,
}

pub struct RemoteStore {
    base_url: String,
    token: Option<String>,
    http: Client,
    /// How long `apply` waits on the service before leaving batches queued.
    flush_budget: Duration,
    cache_path: PathBuf,
    cache: TokioMutex<RemoteCache>,
    status: Arc<SyncStatusReporter>,
    listeners: Listeners<Collection>,
}

impl RemoteStore {
    /// Builds the client, restores the cache file and attempts a first sync.
    ///
    /// An unreachable service is not an error here: the store starts offline
    /// and serves the cached mirror.
    pub async fn connect(
        base_url: &str,
        token: Option<String>,
        cache_dir: &Path,
        timeout: Duration,
        status: Arc<SyncStatusReporter>,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build().map_err(|e| {
            OmniError::unavailable(format!("Failed to build HTTP client: {}", e))
        })?;

        ensure_dir(cache_dir)?;
        let cache_path = cache_dir.join(CACHE_FILE);
        let cache = read_json_file::<RemoteCache>(&cache_path)?.unwrap_or_default();
        if !cache.pending.is_empty() {
            info!(
                "Restored {} queued change batches from {}",
                cache.pending.len(),
                cache_path.display()
            );
        }
        status.set_pending(cache.pending.len());

        let store = RemoteStore {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
            flush_budget: timeout / 2,
            cache_path,
            cache: TokioMutex::new(cache),
            status,
            listeners: Listeners::new(),
        };

        if let Err(e) = store.sync().await {
            if e.is_connectivity() {
                warn!("Remote store unreachable, starting offline: {}", e);
            } else {
                return Err(e);
            }
        }
        Ok(store)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn save_cache(&self, cache: &RemoteCache) -> Result<()> {
        write_json_atomic(&self.cache_path, cache)
    }

    async fn send_batch(&self, batch: &WriteBatch) -> Delivery {
        let request = self.authorize(self.http.post(self.url("batch")).json(batch));
        match request.send().await {
            Ok(resp) if resp.status().is_success() => Delivery::Delivered,
            Ok(resp) if resp.status().is_server_error() => {
                Delivery::Offline(OmniError::unavailable(format!(
                    "batch returned {}",
                    resp.status()
                )))
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                Delivery::Rejected(OmniError::ApplicationError {
                    message: format!("batch rejected with {}: {}", status, body),
                })
            }
            Err(e) => Delivery::Offline(OmniError::Http(e)),
        }
    }

    async fn fetch_collection(&self, collection: Collection) -> Result<Documents> {
        let url = self.url(&format!("collections/{}", collection.name()));
        let resp = self.authorize(self.http.get(&url)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(Documents::new()),
            s if s.is_success() => Ok(resp.json::<Documents>().await?),
            s if s.is_server_error() => Err(OmniError::unavailable(format!(
                "GET {} returned {}",
                collection, s
            ))),
            s => Err(OmniError::ApplicationError {
                message: format!("GET {} returned {}", collection, s),
            }),
        }
    }

    /// Sends queued batches in order until the queue is empty or the service
    /// becomes unreachable. Refused batches leave the queue and are returned;
    /// the mirror is rebuilt without them.
    async fn flush(&self, cache: &mut RemoteCache) -> Result<Vec<Rejection>> {
        let mut rejected = Vec::new();
        let outcome = loop {
            let Some(queued) = cache.pending.front().cloned() else {
                break Ok(());
            };
            match self.send_batch(&queued.batch).await {
                Delivery::Delivered => {
                    queued.batch.apply_to(&mut cache.confirmed);
                    cache.pending.pop_front();
                    self.status.update(|s| {
                        s.is_online = true;
                        s.pending_changes = cache.pending.len();
                    });
                }
                Delivery::Rejected(error) => {
                    error!("Dropping queued batch of {} ops: {}", queued.batch.len(), error);
                    cache.pending.pop_front();
                    self.status.update(|s| {
                        s.is_online = true;
                        s.pending_changes = cache.pending.len();
                    });
                    rejected.push(Rejection {
                        seq: queued.seq,
                        error,
                    });
                }
                Delivery::Offline(e) => {
                    self.status.set_online(false);
                    break Err(e);
                }
            }
        };

        if !rejected.is_empty() {
            cache.rebuild_mirror();
        }
        self.save_cache(cache)?;
        outcome.map(|()| rejected)
    }

    /// Flushes on behalf of `apply`. A service that does not answer within
    /// the budget is treated as offline; the batches stay queued.
    async fn flush_within_budget(&self, cache: &mut RemoteCache) -> Result<Vec<Rejection>> {
        match tokio::time::timeout(self.flush_budget, self.flush(cache)).await {
            Ok(result) => result,
            Err(_) => {
                // an interrupted flush may have dropped a refused batch without rebuilding
                cache.rebuild_mirror();
                self.save_cache(cache)?;
                self.status.update(|s| {
                    s.is_online = false;
                    s.pending_changes = cache.pending.len();
                });
                Err(OmniError::unavailable(format!(
                    "no answer from {} within {:?}",
                    self.base_url, self.flush_budget
                )))
            }
        }
    }

    pub async fn pending_batches(&self) -> usize {
        self.cache.lock().await.pending.len()
    }
}

#[async_trait]
impl DocumentStore for RemoteStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn list(&self, collection: Collection) -> Result<Documents> {
        let cache = self.cache.lock().await;
        Ok(cache.mirror.get(&collection).cloned().unwrap_or_default())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>> {
        let cache = self.cache.lock().await;
        Ok(cache
            .mirror
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    /// Queues the batch and tries to deliver it. Returns `Ok` once the batch
    /// is durably queued, even if the service is unreachable or slow; fails
    /// when the service explicitly refuses this batch.
    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let (changed, result) = {
            let mut cache = self.cache.lock().await;
            batch.check(&cache.mirror)?;
            let before = cache.mirror.clone();
            let seq = cache.enqueue(batch);
            self.save_cache(&cache)?;
            self.status.set_pending(cache.pending.len());

            let result = match self.flush_within_budget(&mut cache).await {
                Ok(rejected) => match rejected.into_iter().find(|r| r.seq == seq) {
                    Some(rejection) => Err(rejection.error),
                    None => Ok(()),
                },
                Err(e) if e.is_connectivity() => {
                    warn!(
                        "Remote store offline, {} change batches queued: {}",
                        cache.pending.len(),
                        e
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            };
            (changed_collections(&before, &cache.mirror), result)
        };

        for collection in changed {
            self.listeners.emit(&collection);
        }
        result
    }

    async fn snapshot(&self) -> Result<StoreSnapshot> {
        Ok(self.cache.lock().await.mirror.clone())
    }

    fn subscribe(&self, listener: ChangeListener) -> Option<Subscription> {
        Some(self.listeners.subscribe(listener))
    }

    /// Calls the health endpoint and records the result.
    async fn check_connection(&self) -> bool {
        let online = match self.authorize(self.http.get(self.url("health"))).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        };
        self.status.set_online(online);
        online
    }

    /// Flushes the queue, then replaces the mirror with the service's copy.
    async fn sync(&self) -> Result<()> {
        self.status.set_syncing(true);
        let result = async {
            let mut cache = self.cache.lock().await;
            self.flush(&mut cache).await?;

            let mut fresh = StoreSnapshot::new();
            for collection in Collection::ALL {
                let docs = self.fetch_collection(collection).await?;
                if !docs.is_empty() {
                    fresh.insert(collection, docs);
                }
            }

            let changed = changed_collections(&cache.mirror, &fresh);
            cache.confirmed = fresh.clone();
            cache.mirror = fresh;
            self.save_cache(&cache)?;
            Ok::<_, OmniError>(changed)
        }
        .await;

        match result {
            Ok(changed) => {
                self.status.update(|s| s.is_online = true);
                self.status.mark_synced(Utc::now());
                info!("Synced with {} ({} collections changed)", self.base_url, changed.len());
                for collection in changed {
                    self.listeners.emit(&collection);
                }
                Ok(())
            }
            Err(e) => {
                self.status.set_syncing(false);
                if e.is_connectivity() {
                    self.status.set_online(false);
                }
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let cache = self.cache.lock().await;
        self.save_cache(&cache)?;
        self.listeners.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    // nothing listens on the discard port in test environments
    const UNREACHABLE: &str = "http://127.0.0.1:9";

    type Handler = Arc<dyn Fn(&str, &str) -> (u16, String) + Send + Sync>;

    /// Minimal HTTP/1.1 service answering each request through `handler`,
    /// which receives the method and the path. One request per connection.
    async fn stub_service(handler: Handler) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handler = Arc::clone(&handler);
                tokio::spawn(answer(socket, handler));
            }
        });
        format!("http://{}", addr)
    }

    async fn answer(mut socket: TcpStream, handler: Handler) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }

        let mut request_line = head.split_whitespace();
        let method = request_line.next().unwrap_or_default();
        let path = request_line.next().unwrap_or_default();
        let (code, body) = handler(method, path);
        let response = format!(
            "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            code,
            body.len(),
            body
        );
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
    }

    /// Accepts connections and never answers.
    async fn silent_service() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{}", addr)
    }

    /// Stub state: the tasks collection it serves and how it answers batches.
    /// Scripted statuses are used first, then `batch_status`.
    struct Service {
        tasks: Mutex<Value>,
        batch_status: Mutex<u16>,
        script: Mutex<VecDeque<u16>>,
        batches: Mutex<usize>,
    }

    impl Service {
        fn new(batch_status: u16) -> Arc<Self> {
            Arc::new(Service {
                tasks: Mutex::new(json!({})),
                batch_status: Mutex::new(batch_status),
                script: Mutex::new(VecDeque::new()),
                batches: Mutex::new(0),
            })
        }

        fn handler(self: &Arc<Self>) -> Handler {
            let service = Arc::clone(self);
            Arc::new(move |method: &str, path: &str| match (method, path) {
                ("GET", "/health") => (200, "{}".to_string()),
                ("GET", "/collections/tasks") => (200, service.tasks.lock().unwrap().to_string()),
                ("GET", _) => (404, String::new()),
                ("POST", "/batch") => {
                    let scripted = service.script.lock().unwrap().pop_front();
                    let status = scripted.unwrap_or(*service.batch_status.lock().unwrap());
                    if status == 200 {
                        *service.batches.lock().unwrap() += 1;
                    }
                    (status, "{}".to_string())
                }
                _ => (405, String::new()),
            })
        }
    }

    async fn offline_store(dir: &Path, status: Arc<SyncStatusReporter>) -> RemoteStore {
        RemoteStore::connect(UNREACHABLE, None, dir, Duration::from_secs(2), status)
            .await
            .expect("offline connect still yields a store")
    }

    async fn store_at(url: &str, dir: &Path, status: Arc<SyncStatusReporter>) -> RemoteStore {
        RemoteStore::connect(url, None, dir, Duration::from_secs(2), status)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn starts_offline_when_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(SyncStatusReporter::new());
        let store = offline_store(dir.path(), Arc::clone(&status)).await;

        let s = status.status();
        assert!(!s.is_online);
        assert!(!s.is_syncing);
        assert!(!store.check_connection().await);
    }

    #[tokio::test]
    async fn offline_writes_are_queued_and_visible() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(SyncStatusReporter::new());
        let store = offline_store(dir.path(), Arc::clone(&status)).await;

        store
            .apply(WriteBatch::new().put(Collection::Tasks, "t1", json!({"id": "t1"})))
            .await
            .unwrap();
        store
            .apply(WriteBatch::new().delete(Collection::Tasks, "t1"))
            .await
            .unwrap();

        assert_eq!(store.pending_batches().await, 2);
        assert_eq!(status.status().pending_changes, 2);
        assert!(store.get(Collection::Tasks, "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let status = Arc::new(SyncStatusReporter::new());
            let store = offline_store(dir.path(), status).await;
            store
                .apply(WriteBatch::new().put(Collection::Ideas, "i1", json!({"id": "i1"})))
                .await
                .unwrap();
            store.close().await.unwrap();
        }

        let status = Arc::new(SyncStatusReporter::new());
        let store = offline_store(dir.path(), Arc::clone(&status)).await;
        assert_eq!(store.pending_batches().await, 1);
        assert_eq!(status.status().pending_changes, 1);
        assert!(store.get(Collection::Ideas, "i1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sync_reports_offline_error() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(SyncStatusReporter::new());
        let store = offline_store(dir.path(), Arc::clone(&status)).await;
        store
            .apply(WriteBatch::new().put(Collection::Tasks, "t", json!({})))
            .await
            .unwrap();

        let err = store.sync().await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(!status.status().is_syncing);
        assert_eq!(store.pending_batches().await, 1);
    }

    #[tokio::test]
    async fn queued_batches_flush_once_service_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(SyncStatusReporter::new());
        let service = Service::new(503);
        let url = stub_service(service.handler()).await;
        let store = store_at(&url, dir.path(), Arc::clone(&status)).await;
        assert!(status.status().is_online);

        store
            .apply(WriteBatch::new().put(Collection::Tasks, "t1", json!({"id": "t1"})))
            .await
            .unwrap();
        assert_eq!(store.pending_batches().await, 1);
        assert!(!status.status().is_online);

        *service.batch_status.lock().unwrap() = 200;
        *service.tasks.lock().unwrap() = json!({"t1": {"id": "t1"}});
        store.sync().await.unwrap();

        let s = status.status();
        assert!(s.is_online);
        assert_eq!(s.pending_changes, 0);
        assert!(s.last_synced_at.is_some());
        assert_eq!(store.pending_batches().await, 0);
        assert_eq!(*service.batches.lock().unwrap(), 1);
        assert!(store.get(Collection::Tasks, "t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn refused_batch_is_reported_and_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(SyncStatusReporter::new());
        let service = Service::new(400);
        let url = stub_service(service.handler()).await;
        let store = store_at(&url, dir.path(), Arc::clone(&status)).await;

        let err = store
            .apply(WriteBatch::new().put(Collection::Tasks, "t1", json!({"id": "t1"})))
            .await
            .unwrap_err();
        assert!(!err.is_connectivity());
        assert!(store.get(Collection::Tasks, "t1").await.unwrap().is_none());
        assert_eq!(store.pending_batches().await, 0);
        assert_eq!(status.status().pending_changes, 0);
    }

    #[tokio::test]
    async fn refused_earlier_batch_drops_only_its_own_writes() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(SyncStatusReporter::new());
        let service = Service::new(503);
        let url = stub_service(service.handler()).await;
        let store = store_at(&url, dir.path(), Arc::clone(&status)).await;

        store
            .apply(WriteBatch::new().put(Collection::Tasks, "early", json!({})))
            .await
            .unwrap();
        assert_eq!(store.pending_batches().await, 1);

        // the queued batch is refused, the new one goes through
        service.script.lock().unwrap().push_back(400);
        *service.batch_status.lock().unwrap() = 200;
        store
            .apply(WriteBatch::new().put(Collection::Ideas, "late", json!({})))
            .await
            .unwrap();

        assert!(store.get(Collection::Tasks, "early").await.unwrap().is_none());
        assert!(store.get(Collection::Ideas, "late").await.unwrap().is_some());
        assert_eq!(store.pending_batches().await, 0);
        assert_eq!(*service.batches.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn sync_replaces_mirror_and_announces_changes() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(SyncStatusReporter::new());
        let service = Service::new(200);
        *service.tasks.lock().unwrap() = json!({"a": {"id": "a"}});
        let url = stub_service(service.handler()).await;
        let store = store_at(&url, dir.path(), Arc::clone(&status)).await;
        assert!(store.get(Collection::Tasks, "a").await.unwrap().is_some());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = store
            .subscribe(Box::new(move |c: &Collection| sink.lock().unwrap().push(*c)))
            .unwrap();

        *service.tasks.lock().unwrap() = json!({"b": {"id": "b"}});
        store.sync().await.unwrap();

        assert!(store.get(Collection::Tasks, "a").await.unwrap().is_none());
        assert!(store.get(Collection::Tasks, "b").await.unwrap().is_some());
        assert_eq!(*seen.lock().unwrap(), vec![Collection::Tasks]);
        assert!(status.status().last_synced_at.is_some());
        assert!(store.check_connection().await);
    }

    #[tokio::test]
    async fn silent_service_leaves_batch_queued_within_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let status = Arc::new(SyncStatusReporter::new());
        let url = silent_service().await;
        let store = RemoteStore::connect(&url, None, dir.path(), Duration::from_secs(1), status)
            .await
            .unwrap();

        let applied = tokio::time::timeout(
            Duration::from_millis(900),
            store.apply(WriteBatch::new().put(Collection::Tasks, "t1", json!({"id": "t1"}))),
        )
        .await;
        assert!(matches!(applied, Ok(Ok(()))));
        assert_eq!(store.pending_batches().await, 1);
        assert!(store.get(Collection::Tasks, "t1").await.unwrap().is_some());
    }
}
