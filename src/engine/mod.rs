pub mod naming;

mod bandwidth;
mod executor;
mod segment;

use crate::{
  error::EngineError,
  events::{EngineEvent, EventHub},
  model::{now_rfc3339, PrivacyMode, Transfer, TransferSnapshot, TransferStatus},
  postprocess::{ArchiveExtractor, HashVerifier, Sha256Verifier},
  privacy::PrivacyProvider,
  settings::{EngineConfig, SettingsStore},
  transport::Transport,
};
use self::bandwidth::BandwidthLimiter;
use self::naming::ConflictResolver;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

/// A submission: URL plus where to put the result. `filename` overrides the
/// URL-derived name; the server's Content-Disposition can still rename it
/// during the probe.
#[derive(Debug, Clone)]
pub struct AddRequest {
  pub url: String,
  pub target_dir: PathBuf,
  pub filename: Option<String>,
  pub privacy_mode: PrivacyMode,
  pub expected_sha256: Option<String>,
}

impl AddRequest {
  pub fn new(url: impl Into<String>, target_dir: impl Into<PathBuf>) -> Self {
    Self {
      url: url.into(),
      target_dir: target_dir.into(),
      filename: None,
      privacy_mode: PrivacyMode::Normal,
      expected_sha256: None,
    }
  }

  pub fn filename(mut self, name: impl Into<String>) -> Self {
    self.filename = Some(name.into());
    self
  }

  pub fn privacy_mode(mut self, mode: PrivacyMode) -> Self {
    self.privacy_mode = mode;
    self
  }

  pub fn expected_sha256(mut self, digest: impl Into<String>) -> Self {
    self.expected_sha256 = Some(digest.into());
    self
  }
}

pub(crate) struct TransferEntry {
  pub state: Mutex<Transfer>,
}

/// What a cooperative checkpoint sees for a transfer id.
pub(crate) enum Liveness {
  /// Still Downloading; keep going.
  Active,
  /// Paused (or re-queued); stop writing but leave part files for the next
  /// run to truncate.
  Paused,
  /// Canceled, terminal, or deleted from the registry; stop and clean up.
  Stopped,
}

/// The id -> transfer map: sole authority on transfer existence. Workers
/// re-look ids up here at every cooperative checkpoint instead of trusting
/// a cached reference, so a deleted id is unobservable past its next check.
#[derive(Clone)]
pub(crate) struct TransferRegistry {
  map: Arc<DashMap<String, Arc<TransferEntry>>>,
}

impl TransferRegistry {
  fn new() -> Self {
    Self { map: Arc::new(DashMap::new()) }
  }

  fn insert(&self, transfer: Transfer) -> Arc<TransferEntry> {
    let id = transfer.id.clone();
    let entry = Arc::new(TransferEntry { state: Mutex::new(transfer) });
    self.map.insert(id, entry.clone());
    entry
  }

  pub(crate) fn get(&self, id: &str) -> Option<Arc<TransferEntry>> {
    self.map.get(id).map(|e| e.clone())
  }

  fn remove(&self, id: &str) {
    self.map.remove(id);
  }

  /// Runs `f` under the entry lock; `None` when the id is gone.
  pub(crate) fn with_state<R>(&self, id: &str, f: impl FnOnce(&mut Transfer) -> R) -> Option<R> {
    let entry = self.get(id)?;
    let mut state = entry.state.lock();
    Some(f(&mut state))
  }

  pub(crate) fn liveness(&self, id: &str) -> Liveness {
    match self.with_state(id, |t| t.status) {
      Some(TransferStatus::Downloading) => Liveness::Active,
      Some(TransferStatus::Paused) | Some(TransferStatus::Waiting) => Liveness::Paused,
      _ => Liveness::Stopped,
    }
  }

  fn snapshots(&self) -> Vec<TransferSnapshot> {
    let mut all: Vec<TransferSnapshot> =
      self.map.iter().map(|e| e.state.lock().snapshot()).collect();
    all.sort_by(|a, b| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id)));
    all
  }

  fn clear_completed(&self) {
    self
      .map
      .retain(|_, entry| entry.state.lock().status != TransferStatus::Completed);
  }
}

struct EngineInner {
  config: Arc<EngineConfig>,
  registry: TransferRegistry,
  events: EventHub,
  transport: Transport,
  provider: Arc<dyn PrivacyProvider>,
  limiter: BandwidthLimiter,
  queue_tx: mpsc::UnboundedSender<String>,
  verifier: RwLock<Option<Arc<dyn HashVerifier>>>,
  extractor: RwLock<Option<Arc<dyn ArchiveExtractor>>>,
  resolver: RwLock<Option<Arc<dyn ConflictResolver>>>,
}

/// The download engine: a FIFO queue of transfer ids drained by a fixed
/// pool of `max_downloads` workers, each driving one transfer at a time.
pub struct DownloadEngine {
  inner: Arc<EngineInner>,
  queue_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl DownloadEngine {
  pub fn new(
    settings: &SettingsStore,
    provider: Arc<dyn PrivacyProvider>,
    events: EventHub,
  ) -> anyhow::Result<Self> {
    let config = Arc::new(EngineConfig::from_settings(settings));
    let transport = Transport::new(&config, provider.clone())?;
    // speed_limit is KiB/s in settings; the bucket runs on bytes.
    let limiter = BandwidthLimiter::new(config.speed_limit.max(0) * 1024);
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let default_verifier: Arc<dyn HashVerifier> = Arc::new(Sha256Verifier);

    let inner = Arc::new(EngineInner {
      config,
      registry: TransferRegistry::new(),
      events,
      transport,
      provider,
      limiter,
      queue_tx,
      verifier: RwLock::new(Some(default_verifier)),
      extractor: RwLock::new(None),
      resolver: RwLock::new(None),
    });

    Ok(Self {
      inner,
      queue_rx: Mutex::new(Some(queue_rx)),
    })
  }

  /// Spawns the worker pool. Must be called once, from within a Tokio
  /// runtime, before submitted transfers make progress.
  pub fn start(&self) {
    let rx = self
      .queue_rx
      .lock()
      .take()
      .expect("engine started twice");
    let shared_rx = Arc::new(tokio::sync::Mutex::new(rx));

    self.inner.limiter.spawn_refill();

    for worker in 0..self.inner.config.max_downloads {
      let inner = self.inner.clone();
      let shared_rx = shared_rx.clone();
      tokio::spawn(async move {
        loop {
          let id = {
            let mut rx = shared_rx.lock().await;
            match rx.recv().await {
              Some(id) => id,
              None => break,
            }
          };
          inner.run_one(&id).await;
        }
        tracing::debug!(worker, "download worker stopped");
      });
    }
  }

  /// Validates routing availability up front: a `Relay` submission with the
  /// relay down fails here, not at network time.
  pub fn add_download(&self, req: AddRequest) -> Result<String, EngineError> {
    let url = Url::parse(req.url.trim()).map_err(|e| EngineError::InvalidUrl(e.to_string()))?;
    self.inner.transport.validate(req.privacy_mode)?;

    let filename = match req.filename {
      Some(name) if !name.trim().is_empty() => name,
      _ => naming::derive_filename(&url),
    };

    let id = Uuid::new_v4().to_string();
    self.inner.registry.insert(Transfer {
      id: id.clone(),
      url: url.to_string(),
      target_dir: req.target_dir,
      filename,
      privacy_mode: req.privacy_mode,
      expected_sha256: req.expected_sha256,
      size: -1,
      downloaded: 0,
      speed: 0.0,
      eta: -1.0,
      status: TransferStatus::Waiting,
      error: None,
      segments: Vec::new(),
      single_part_path: None,
      started_at: None,
      created_at: now_rfc3339(),
    });

    self.inner.events.emit(EngineEvent::Added { id: id.clone() });
    let _ = self.inner.queue_tx.send(id.clone());
    Ok(id)
  }

  /// Downloading -> Paused. The owning executor observes the change at its
  /// next cooperative checkpoint and stops writing.
  pub fn pause(&self, id: &str) -> bool {
    let Some(entry) = self.inner.registry.get(id) else { return false };
    let mut state = entry.state.lock();
    if state.status != TransferStatus::Downloading {
      return false;
    }
    state.status = TransferStatus::Paused;
    self.inner.events.emit(EngineEvent::Paused { id: id.to_string() });
    true
  }

  /// Paused -> Waiting, re-enqueued at the back of the FIFO.
  pub fn resume(&self, id: &str) -> bool {
    let Some(entry) = self.inner.registry.get(id) else { return false };
    let mut state = entry.state.lock();
    if state.status != TransferStatus::Paused {
      return false;
    }
    state.status = TransferStatus::Waiting;
    self.inner.events.emit(EngineEvent::Resumed { id: id.to_string() });
    let _ = self.inner.queue_tx.send(id.to_string());
    true
  }

  /// Any non-terminal -> Canceled. A running executor notices at its next
  /// cooperative checkpoint and removes its part files; for idle transfers
  /// the cleanup happens right here.
  pub fn cancel(&self, id: &str) -> bool {
    let Some(entry) = self.inner.registry.get(id) else { return false };
    let mut state = entry.state.lock();
    if state.status.is_terminal() {
      return false;
    }
    let was_running = state.status == TransferStatus::Downloading;
    state.status = TransferStatus::Canceled;
    self.inner.events.emit(EngineEvent::Canceled { id: id.to_string() });
    if !was_running {
      remove_part_files(&state);
    }
    true
  }

  /// Cancels if active, then removes the registry entry. In-flight workers
  /// discover the removal at their next lookup and bail.
  pub fn delete(&self, id: &str) -> bool {
    let Some(entry) = self.inner.registry.get(id) else { return false };
    {
      let mut state = entry.state.lock();
      if !state.status.is_terminal() {
        let was_running = state.status == TransferStatus::Downloading;
        state.status = TransferStatus::Canceled;
        self.inner.events.emit(EngineEvent::Canceled { id: id.to_string() });
        if !was_running {
          remove_part_files(&state);
        }
      }
    }
    self.inner.registry.remove(id);
    true
  }

  /// Drops every Completed transfer. Idempotent.
  pub fn clear_completed(&self) {
    self.inner.registry.clear_completed();
  }

  pub fn get(&self, id: &str) -> Option<TransferSnapshot> {
    self.inner.registry.with_state(id, |t| t.snapshot())
  }

  pub fn list_all(&self) -> Vec<TransferSnapshot> {
    self.inner.registry.snapshots()
  }

  /// The configured download folder, created on demand.
  pub fn default_save_path(&self) -> PathBuf {
    let path = self.inner.config.download_folder.clone();
    let _ = std::fs::create_dir_all(&path);
    path
  }

  pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
    self.inner.events.subscribe()
  }

  pub fn events(&self) -> EventHub {
    self.inner.events.clone()
  }

  /// Forwards a "new circuit" request to the privacy provider. Whether it
  /// is honored depends entirely on the provider.
  pub fn request_new_circuit(&self) -> bool {
    self.inner.provider.request_new_circuit()
  }

  pub fn set_conflict_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
    *self.inner.resolver.write() = Some(resolver);
  }

  pub fn set_hash_verifier(&self, verifier: Arc<dyn HashVerifier>) {
    *self.inner.verifier.write() = Some(verifier);
  }

  pub fn set_archive_extractor(&self, extractor: Arc<dyn ArchiveExtractor>) {
    *self.inner.extractor.write() = Some(extractor);
  }
}

impl EngineInner {
  async fn run_one(&self, id: &str) {
    let Some(entry) = self.registry.get(id) else { return };
    {
      let mut state = entry.state.lock();
      // Terminal, paused, or already-claimed ids are dropped; the queue may
      // hold stale entries for transfers canceled while Waiting.
      if state.status != TransferStatus::Waiting {
        return;
      }
      state.status = TransferStatus::Downloading;
      // Emitted under the lock so a racing cancel cannot publish its
      // terminal event ahead of Started.
      self.events.emit(EngineEvent::Started { id: id.to_string() });
    }

    let ctx = executor::TransferCtx {
      registry: self.registry.clone(),
      events: self.events.clone(),
      config: self.config.clone(),
      transport: self.transport.clone(),
      limiter: self.limiter.clone(),
      verifier: self.verifier.read().clone(),
      extractor: self.extractor.read().clone(),
      resolver: self.resolver.read().clone(),
    };

    let outcome = executor::run_transfer(&ctx, id).await;

    // Commit the terminal status unless someone else (pause/cancel/delete)
    // already moved the transfer while we were finishing up.
    let Some(entry) = self.registry.get(id) else { return };
    let completed_path = {
      let mut state = entry.state.lock();
      if state.status != TransferStatus::Downloading {
        return;
      }
      match outcome {
        executor::Outcome::Completed { run_hooks } => {
          state.status = TransferStatus::Completed;
          self.events.emit(EngineEvent::Completed { id: id.to_string() });
          tracing::info!(transfer_id = %id, file = %state.filename, "transfer completed");
          run_hooks.then(|| state.target_path())
        }
        executor::Outcome::Failed(err) => {
          let message = err.to_string();
          state.status = TransferStatus::Failed;
          state.error = Some(message.clone());
          self.events.emit(EngineEvent::Failed { id: id.to_string(), error: message.clone() });
          tracing::warn!(transfer_id = %id, error = %message, "transfer failed");
          None
        }
        executor::Outcome::Interrupted => None,
      }
    };

    if let Some(path) = completed_path {
      executor::post_process(&ctx, id, &path).await;
    }
  }
}

fn remove_part_files(state: &Transfer) {
  for seg in &state.segments {
    let _ = std::fs::remove_file(&seg.part_path);
  }
  if let Some(part) = &state.single_part_path {
    let _ = std::fs::remove_file(part);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::privacy::SettingsPrivacyProvider;
  use serde_json::json;

  fn engine_with(settings: serde_json::Value) -> DownloadEngine {
    let store = SettingsStore::from_value(settings);
    let provider = Arc::new(SettingsPrivacyProvider::new(store.clone()));
    DownloadEngine::new(&store, provider, EventHub::new()).unwrap()
  }

  #[tokio::test]
  async fn add_rejects_invalid_urls() {
    let engine = engine_with(json!({}));
    let err = engine
      .add_download(AddRequest::new("not a url", "/tmp"))
      .unwrap_err();
    assert!(matches!(err, EngineError::InvalidUrl(_)));
  }

  #[tokio::test]
  async fn relay_submission_fails_fast_when_relay_is_down() {
    let engine = engine_with(json!({}));
    let err = engine
      .add_download(
        AddRequest::new("http://example.com/f.bin", "/tmp").privacy_mode(PrivacyMode::Relay),
      )
      .unwrap_err();
    assert!(matches!(err, EngineError::TransportUnavailable(_)));
    assert!(engine.list_all().is_empty());
  }

  #[tokio::test]
  async fn added_transfer_waits_with_derived_filename() {
    let engine = engine_with(json!({}));
    let id = engine
      .add_download(AddRequest::new("http://example.com/path/data%20set.bin", "/tmp"))
      .unwrap();
    let snap = engine.get(&id).unwrap();
    assert_eq!(snap.status, TransferStatus::Waiting);
    assert_eq!(snap.filename, "data set.bin");
    assert_eq!(snap.size, -1);
  }

  #[tokio::test]
  async fn pause_only_applies_to_downloading() {
    let engine = engine_with(json!({}));
    let id = engine
      .add_download(AddRequest::new("http://example.com/f.bin", "/tmp"))
      .unwrap();
    // Still Waiting: pause refuses, cancel succeeds.
    assert!(!engine.pause(&id));
    assert!(engine.cancel(&id));
    assert_eq!(engine.get(&id).unwrap().status, TransferStatus::Canceled);
    // Terminal: cancel is now a no-op.
    assert!(!engine.cancel(&id));
  }

  #[tokio::test]
  async fn resume_requires_paused() {
    let engine = engine_with(json!({}));
    let id = engine
      .add_download(AddRequest::new("http://example.com/f.bin", "/tmp"))
      .unwrap();
    assert!(!engine.resume(&id));
    engine.inner.registry.with_state(&id, |t| t.status = TransferStatus::Paused);
    assert!(engine.resume(&id));
    assert_eq!(engine.get(&id).unwrap().status, TransferStatus::Waiting);
  }

  #[tokio::test]
  async fn delete_makes_the_id_unobservable() {
    let engine = engine_with(json!({}));
    let id = engine
      .add_download(AddRequest::new("http://example.com/f.bin", "/tmp"))
      .unwrap();
    assert!(engine.delete(&id));
    assert!(engine.get(&id).is_none());
    assert!(!engine.delete(&id));
  }

  #[tokio::test]
  async fn clear_completed_is_idempotent() {
    let engine = engine_with(json!({}));
    let done = engine
      .add_download(AddRequest::new("http://example.com/a.bin", "/tmp"))
      .unwrap();
    let pending = engine
      .add_download(AddRequest::new("http://example.com/b.bin", "/tmp"))
      .unwrap();
    engine
      .inner
      .registry
      .with_state(&done, |t| t.status = TransferStatus::Completed);

    engine.clear_completed();
    assert!(engine.get(&done).is_none());
    assert!(engine.get(&pending).is_some());

    engine.clear_completed();
    assert!(engine.get(&pending).is_some());
    assert_eq!(engine.list_all().len(), 1);
  }

  #[tokio::test]
  async fn worker_drops_stale_queue_entries() {
    let engine = engine_with(json!({}));
    let id = engine
      .add_download(AddRequest::new("http://example.com/f.bin", "/tmp"))
      .unwrap();
    engine.cancel(&id);
    // Simulate the worker picking the stale id out of the queue.
    engine.inner.run_one(&id).await;
    assert_eq!(engine.get(&id).unwrap().status, TransferStatus::Canceled);
  }
}
