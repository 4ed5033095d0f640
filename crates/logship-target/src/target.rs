//! Webhook delivery target.
//!
//! The target is the facade producers talk to. Entries are accepted without
//! blocking: in the default mode they land in a bounded in-memory channel
//! drained by an elastic pool of delivery workers; in durable mode they are
//! persisted to a file-backed store and replayed until the remote
//! acknowledges them.
//!
//! Status runs Offline → Online → Closed. A target that cannot reach its
//! endpoint at init time registers a revive task that promotes it to Online
//! once the remote becomes reachable. After [`WebhookTarget::cancel`] the
//! target is permanently closed and sends become no-ops.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, Once, RwLock,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use logship_core::{
    Clock, DedupLogger, DirStore, EntryStore, LogEntry, LogOnce, RealClock, StoreError,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, mpsc::error::TrySendError, Mutex as AsyncMutex, OnceCell};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

use crate::{
    client::WebhookClient,
    config::TargetConfig,
    error::{Result, TargetError},
    replay, HTTP_LOG_EXTENSION, MAX_SEND_RETRIES, MAX_WORKERS, WEBHOOK_CALL_TIMEOUT,
};

const STATUS_OFFLINE: u8 = 0;
const STATUS_ONLINE: u8 = 1;
const STATUS_CLOSED: u8 = 2;

/// Minimum spacing between worker spawns.
const WORKER_SPAWN_INTERVAL: Duration = Duration::from_secs(1);

/// Counters snapshot returned by [`WebhookTarget::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetStats {
    /// Entries handed to the delivery machinery, including dropped ones.
    pub total_messages: u64,
    /// Failed delivery attempts plus dropped entries.
    pub failed_messages: u64,
    /// Entries currently buffered (channel backlog, or store backlog in
    /// durable mode).
    pub queue_length: usize,
}

pub(crate) struct Shared<E> {
    pub(crate) config: TargetConfig,
    pub(crate) client: WebhookClient,
    pub(crate) log_once: Arc<dyn LogOnce>,
    pub(crate) clock: Arc<dyn Clock>,

    status: AtomicU8,
    pub(crate) total_messages: AtomicU64,
    pub(crate) failed_messages: AtomicU64,

    // Worker control: the counter is CAS-incremented before a spawn and
    // decremented by the worker on exit; `worker_start` rate-limits spawns.
    workers: AtomicUsize,
    worker_start: Mutex<Option<Instant>>,

    // Senders take the read side so the channel cannot be torn down under
    // them; cancel takes the write side exclusively.
    tx: RwLock<Option<mpsc::Sender<E>>>,
    rx: Option<Arc<AsyncMutex<mpsc::Receiver<E>>>>,

    tracker: TaskTracker,
    revive: Once,

    store: OnceCell<Arc<dyn EntryStore<E>>>,
    store_cancel: CancellationToken,
}

impl<E> Shared<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn status(&self) -> u8 {
        self.status.load(Ordering::SeqCst)
    }

    pub(crate) fn target_name(&self) -> String {
        format!("logship-webhook-{}", self.config.name)
    }

    /// Delivers one entry, retrying transient failures with quadratic
    /// backoff. Gives up after [`MAX_SEND_RETRIES`] attempts or as soon as
    /// the target closes; every failed attempt is counted and reported
    /// through the de-duplicating sink.
    async fn log_entry(&self, entry: &E) {
        let payload = match serde_json::to_vec(entry) {
            Ok(payload) => Bytes::from(payload),
            Err(_) => {
                self.failed_messages.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        let mut tries = 0;
        loop {
            if tries > 0 {
                if tries >= MAX_SEND_RETRIES || self.status() == STATUS_CLOSED {
                    return;
                }
                self.clock.sleep(retry_backoff(tries)).await;
            }
            tries += 1;

            match self.client.send(payload.clone(), WEBHOOK_CALL_TIMEOUT).await {
                Ok(()) => return,
                Err(err) => {
                    self.log_once.log_once(self.client.endpoint().as_str(), &err);
                    self.failed_messages.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Reads the entry under `key` from the store and delivers it, deleting
    /// the entry on success. `StoreError::NotConnected` tells the replay loop
    /// to back off without touching the entry.
    pub(crate) async fn send_from_store(
        &self,
        store: &dyn EntryStore<E>,
        key: &str,
    ) -> Result<()> {
        let entry = match store.get(key) {
            Ok(entry) => entry,
            // Already delivered by an earlier pass.
            Err(StoreError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        self.total_messages.fetch_add(1, Ordering::SeqCst);

        let payload = match serde_json::to_vec(&entry) {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                self.failed_messages.fetch_add(1, Ordering::SeqCst);
                return Err(TargetError::serialization(err));
            }
        };

        if let Err(err) = self.client.send(payload, WEBHOOK_CALL_TIMEOUT).await {
            self.failed_messages.fetch_add(1, Ordering::SeqCst);
            if err.is_network_or_host_down() {
                return Err(TargetError::Store(StoreError::NotConnected));
            }
            return Err(err);
        }

        store.del(key)?;
        Ok(())
    }
}

/// Quadratic retry backoff: `(tries + 2)²` milliseconds, capped at one
/// second.
fn retry_backoff(tries: u32) -> Duration {
    let ms = u64::from(tries + 2).pow(2).min(1000);
    Duration::from_millis(ms)
}

/// Starts one delivery worker draining the shared channel.
///
/// The caller has already accounted for the worker in the spawn counter.
fn spawn_worker<E>(shared: &Arc<Shared<E>>)
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let Some(rx) = shared.rx.clone() else {
        // Durable mode has no channel to drain.
        shared.workers.fetch_sub(1, Ordering::SeqCst);
        return;
    };

    let shared = Arc::clone(shared);
    let tracker = shared.tracker.clone();
    tracker.spawn(async move {
        loop {
            let entry = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(entry) = entry else { break };

            shared.total_messages.fetch_add(1, Ordering::SeqCst);
            shared.log_entry(&entry).await;
        }
        shared.workers.fetch_sub(1, Ordering::SeqCst);
        debug!(target_name = %shared.target_name(), "delivery worker stopped");
    });
}

/// Promotes an offline target to online and starts its first worker.
fn promote_online<E>(shared: &Arc<Shared<E>>)
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    if shared
        .status
        .compare_exchange(STATUS_OFFLINE, STATUS_ONLINE, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        {
            let mut last = lock_unpoisoned(&shared.worker_start);
            *last = Some(shared.clock.now());
        }
        shared.workers.fetch_add(1, Ordering::SeqCst);
        spawn_worker(shared);
        info!(target_name = %shared.target_name(), endpoint = %shared.client.endpoint(), "webhook target online");
    }
}

/// Registers the one-shot revive task: probe the remote every second and
/// promote the target once it answers. The task self-exits as soon as the
/// status leaves Offline.
fn spawn_revive<E>(shared: &Arc<Shared<E>>)
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let task_shared = Arc::clone(shared);
    shared.revive.call_once(move || {
        tokio::spawn(async move {
            loop {
                task_shared.clock.sleep(Duration::from_secs(1)).await;
                if task_shared.status() != STATUS_OFFLINE {
                    return;
                }
                if task_shared.client.is_online().await {
                    promote_online(&task_shared);
                    return;
                }
            }
        });
    });
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Delivery target forwarding JSON-encoded entries to a webhook endpoint.
///
/// Cheap to clone; all clones share the same state. Producers call
/// [`send`](Self::send), which never blocks on the network.
pub struct WebhookTarget<E = LogEntry> {
    shared: Arc<Shared<E>>,
}

impl<E> Clone for WebhookTarget<E> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<E> WebhookTarget<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a target from its configuration.
    ///
    /// Validates the configuration and builds the HTTP transport, but never
    /// contacts the network; call [`init`](Self::init) to bring the target
    /// online.
    ///
    /// # Errors
    ///
    /// Returns `TargetError::Config` for an unusable configuration.
    pub fn new(config: TargetConfig) -> Result<Self> {
        Self::with_diagnostics(config, DedupLogger::shared(), Arc::new(RealClock::new()))
    }

    /// Creates a target with explicit diagnostic sink and clock, the shape
    /// tests use to observe error reporting and control timing.
    ///
    /// # Errors
    ///
    /// Returns `TargetError::Config` for an unusable configuration.
    pub fn with_diagnostics(
        config: TargetConfig,
        log_once: Arc<dyn LogOnce>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let client = WebhookClient::from_config(&config)?;

        // Durable mode routes through the store; the channel exists only in
        // memory-buffer mode.
        let (tx, rx) = if config.queue_dir.is_some() {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel(config.queue_size);
            (Some(tx), Some(Arc::new(AsyncMutex::new(rx))))
        };

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                client,
                log_once,
                clock,
                status: AtomicU8::new(STATUS_OFFLINE),
                total_messages: AtomicU64::new(0),
                failed_messages: AtomicU64::new(0),
                workers: AtomicUsize::new(0),
                worker_start: Mutex::new(None),
                tx: RwLock::new(tx),
                rx,
                tracker: TaskTracker::new(),
                revive: Once::new(),
                store: OnceCell::new(),
                store_cancel: CancellationToken::new(),
            }),
        })
    }

    /// Name of this target, also used as its queue subdirectory.
    pub fn name(&self) -> String {
        self.shared.target_name()
    }

    /// Endpoint this target delivers to.
    pub fn endpoint(&self) -> &reqwest::Url {
        self.shared.client.endpoint()
    }

    /// Whether the remote currently answers the liveness probe.
    pub async fn is_online(&self) -> bool {
        self.shared.client.is_online().await
    }

    /// Initializes the target. Idempotent.
    ///
    /// In durable mode this opens the queue store and starts the replay loop
    /// (at most once per target lifetime). Otherwise it probes the remote:
    /// when reachable the target goes online with one worker; when not, a
    /// revive task is registered and init still succeeds.
    ///
    /// # Errors
    ///
    /// Returns `TargetError::Config` when the queue store cannot be opened
    /// and `TargetError::Closed` after [`cancel`](Self::cancel).
    pub async fn init(&self) -> Result<()> {
        if let Some(queue_dir) = self.shared.config.queue_dir.clone() {
            self.init_store(&queue_dir).await
        } else {
            self.init_channel().await
        }
    }

    async fn init_store(&self, queue_dir: &std::path::Path) -> Result<()> {
        self.shared
            .store
            .get_or_try_init(|| async {
                let dir = queue_dir.join(self.shared.target_name());

                let store: DirStore<E> = DirStore::new(
                    dir,
                    self.shared.config.queue_size as u64,
                    HTTP_LOG_EXTENSION,
                );
                store.open().map_err(|e| {
                    TargetError::configuration(format!(
                        "unable to initialize the queue store of {}: {e}",
                        self.shared.target_name()
                    ))
                })?;

                let store: Arc<dyn EntryStore<E>> = Arc::new(store);
                self.shared.tracker.spawn(replay::run(
                    Arc::clone(&self.shared),
                    Arc::clone(&store),
                    self.shared.store_cancel.clone(),
                ));

                info!(target_name = %self.shared.target_name(), "queue store replay started");
                Ok::<_, TargetError>(store)
            })
            .await?;
        Ok(())
    }

    async fn init_channel(&self) -> Result<()> {
        match self.shared.status() {
            STATUS_ONLINE => return Ok(()),
            STATUS_CLOSED => return Err(TargetError::Closed),
            _ => {}
        }

        if !self.shared.client.is_online().await {
            // Keep probing in the background; init itself succeeds.
            spawn_revive(&self.shared);
            return Ok(());
        }

        promote_online(&self.shared);
        Ok(())
    }

    /// Accepts an entry for delivery. Never blocks on the network.
    ///
    /// Routing: durable mode persists to the store; otherwise the entry is
    /// enqueued without blocking. On a full buffer the target drops the entry
    /// when offline or saturated, or spawns another worker (at most
    /// [`MAX_WORKERS`], at most one per second) and enqueues while the new
    /// worker drains. After [`cancel`](Self::cancel) sends succeed and the
    /// entry is discarded.
    ///
    /// # Errors
    ///
    /// `TargetError::BufferFull` when the entry was dropped,
    /// `TargetError::Store` when durable persistence fails.
    pub async fn send(&self, entry: E) -> Result<()> {
        if self.shared.config.queue_dir.is_some() {
            let store = self
                .shared
                .store
                .get()
                .ok_or_else(|| TargetError::configuration("target is not initialized"))?;
            store.put(&entry)?;
            return Ok(());
        }

        if self.shared.status() == STATUS_CLOSED {
            return Ok(());
        }

        let Some(tx) = lock_read_unpoisoned(&self.shared.tx).clone() else {
            // Cancel already tore the channel down.
            return Ok(());
        };

        match tx.try_send(entry) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(entry)) => self.send_full(&tx, entry).await,
        }
    }

    /// Slow path once the buffer is full: drop when offline or saturated,
    /// otherwise grow the worker pool and enqueue.
    async fn send_full(&self, tx: &mpsc::Sender<E>, entry: E) -> Result<()> {
        if !self.shared.client.is_online().await {
            self.shared.total_messages.fetch_add(1, Ordering::SeqCst);
            self.shared.failed_messages.fetch_add(1, Ordering::SeqCst);
            return Err(TargetError::buffer_full_offline());
        }

        let workers = self.shared.workers.load(Ordering::SeqCst);
        if workers < MAX_WORKERS {
            {
                let mut last = lock_unpoisoned(&self.shared.worker_start);
                let due = last
                    .map_or(true, |t| self.shared.clock.now().duration_since(t) > WORKER_SPAWN_INTERVAL);
                if due
                    && self
                        .shared
                        .workers
                        .compare_exchange(workers, workers + 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    *last = Some(self.shared.clock.now());
                    spawn_worker(&self.shared);
                }
            }
            // The pool is still allowed to grow, so the channel will drain;
            // wait for a slot. A concurrent cancel closes the channel and the
            // entry is discarded.
            let _ = tx.send(entry).await;
            return Ok(());
        }

        self.shared.total_messages.fetch_add(1, Ordering::SeqCst);
        self.shared.failed_messages.fetch_add(1, Ordering::SeqCst);
        Err(TargetError::buffer_full_saturated())
    }

    /// Delivers the stored entry under `key`, deleting it on success.
    ///
    /// # Errors
    ///
    /// `TargetError::Store(StoreError::NotConnected)` when the remote is
    /// unreachable (the entry is kept), any other delivery or store error
    /// otherwise.
    pub async fn send_from_store(&self, key: &str) -> Result<()> {
        let store = self
            .shared
            .store
            .get()
            .ok_or_else(|| TargetError::configuration("target is not initialized"))?
            .clone();
        self.shared.send_from_store(store.as_ref(), key).await
    }

    /// Cancels the target.
    ///
    /// Entries already buffered are flushed before this returns; entries sent
    /// afterwards are discarded. Safe to call more than once.
    pub async fn cancel(&self) {
        self.shared.status.store(STATUS_CLOSED, Ordering::SeqCst);

        // Stop the store replay loop, if durable mode started one.
        self.shared.store_cancel.cancel();

        // Drop the sender under the write lock: in-flight sends finish
        // against their clone, everything afterwards sees a closed channel.
        {
            let mut tx = self
                .shared
                .tx
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *tx = None;
        }

        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        info!(target_name = %self.shared.target_name(), "webhook target closed");
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> TargetStats {
        let queue_length = if let Some(store) = self.shared.store.get() {
            store.len()
        } else {
            lock_read_unpoisoned(&self.shared.tx)
                .as_ref()
                .map_or(0, |tx| tx.max_capacity() - tx.capacity())
        };

        TargetStats {
            total_messages: self.shared.total_messages.load(Ordering::SeqCst),
            failed_messages: self.shared.failed_messages.load(Ordering::SeqCst),
            queue_length,
        }
    }
}

fn lock_read_unpoisoned<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}
