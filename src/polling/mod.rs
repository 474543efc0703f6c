//! Polling engine
//!
//! Owns every live polling loop. Each task gets one worker; workers are
//! cancelled through a watch channel and drained on stop, so a stopped
//! task never delivers another event. Lifecycle transitions serialize
//! on an async mutex, which keeps concurrent resume/stop calls from
//! double-starting a loop.
//!
//! Interactsh tasks are special: the client runs its own decrypting
//! loop, so the engine worker is a ticker that records poll times and
//! notices when that loop dies.

pub mod health;
pub mod task;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{OasthubError, ProviderError, StoreError};
use crate::provider::{
    InteractshClient, Interaction, OastService, Provider, ProviderKind, ProviderRegistry,
};
use crate::sink::EventSink;
use crate::store::Store;

pub use health::HealthMonitor;
pub use task::{HealthStatus, NewTask, PollingTask, TaskFilter};

/// Per-tab index of event ids already delivered. Seeded from the store
/// so restarts do not replay persisted interactions.
#[derive(Default)]
struct DedupIndex {
    seen: Mutex<HashMap<String, HashSet<String>>>,
}

impl DedupIndex {
    /// true when the id is new for the tab
    fn insert(&self, tab_id: &str, event_id: &str) -> bool {
        self.seen
            .lock()
            .entry(tab_id.to_string())
            .or_default()
            .insert(event_id.to_string())
    }
}

struct Worker {
    quit: watch::Sender<bool>,
    handle: JoinHandle<()>,
    /// held for Interactsh so stop can deregister the session
    client: Option<Arc<InteractshClient>>,
}

type WorkerMap = Arc<RwLock<HashMap<String, Worker>>>;

pub struct PollingEngine {
    store: Arc<Store>,
    registry: Arc<ProviderRegistry>,
    sink: Arc<dyn EventSink>,
    dedup: Arc<DedupIndex>,
    workers: WorkerMap,
    /// serializes start/stop transitions
    lifecycle: tokio::sync::Mutex<()>,
}

impl PollingEngine {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ProviderRegistry>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let dedup = DedupIndex::default();
        for stored in store.interactions(None) {
            dedup.insert(&stored.tab_id, &stored.event.id);
        }

        Self {
            store,
            registry,
            sink,
            dedup: Arc::new(dedup),
            workers: Arc::new(RwLock::new(HashMap::new())),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    // ---- queries ----

    pub fn is_running(&self, task_id: &str) -> bool {
        self.workers.read().contains_key(task_id)
    }

    pub fn task(&self, task_id: &str) -> Option<PollingTask> {
        self.store.task(task_id)
    }

    pub fn tasks(&self, filter: &TaskFilter) -> Vec<PollingTask> {
        self.store.tasks(filter)
    }

    // ---- lifecycle ----

    /// Persist a new task and start its loop. The record stays behind
    /// if the loop fails to start, so a later resume can retry it.
    pub async fn create_task(&self, new: NewTask) -> Result<PollingTask, OasthubError> {
        new.validate()?;
        let provider =
            self.registry
                .get(&new.provider_id)
                .ok_or_else(|| StoreError::NotFound {
                    what: "provider",
                    id: new.provider_id.clone(),
                })?;
        if !provider.enabled {
            return Err(ProviderError::Invalid {
                field: "provider".to_string(),
                reason: format!("'{}' is disabled", provider.name),
            }
            .into());
        }

        let task = new.into_task();
        self.store.insert_task(task.clone())?;
        info!(
            task = %task.id,
            tab = %task.tab_name,
            provider = %task.provider_name,
            "polling task created"
        );

        self.resume(&task.id).await?;
        Ok(self.store.task(&task.id).unwrap_or(task))
    }

    /// Start the loop for a persisted task, reactivating the record if
    /// it was stopped. Returns false when the loop was already running.
    pub async fn resume(&self, task_id: &str) -> Result<bool, OasthubError> {
        let _guard = self.lifecycle.lock().await;
        if self.workers.read().contains_key(task_id) {
            return Ok(false);
        }

        let task = self.store.task(task_id).ok_or_else(|| StoreError::NotFound {
            what: "polling task",
            id: task_id.to_string(),
        })?;
        if !task.is_active {
            self.store.set_task_active(task_id, true)?;
        }

        // a saved interactsh session carries server url and credentials,
        // so those tasks resume without touching the provider table
        match task.provider_kind {
            ProviderKind::Interactsh => self.spawn_interactsh(&task).await?,
            _ => {
                let provider = self.provider_for(&task)?;
                self.spawn_generic(&task, &provider).await?;
            }
        }
        debug!(task = %task.id, provider = %task.provider_name, "polling task running");
        Ok(true)
    }

    /// Resolve a task's provider by id, falling back to the stored name
    /// so tasks survive a provider record being deleted and re-added.
    fn provider_for(&self, task: &PollingTask) -> Result<Provider, StoreError> {
        self.registry
            .get(&task.provider_id)
            .or_else(|| self.registry.get_by_name(&task.provider_name))
            .ok_or_else(|| StoreError::NotFound {
                what: "provider",
                id: task.provider_id.clone(),
            })
    }

    /// Stop a task's loop; the record stays active so `resume` and
    /// startup recovery pick it back up. Returns false when no loop
    /// was running.
    pub async fn stop(&self, task_id: &str) -> bool {
        let _guard = self.lifecycle.lock().await;
        self.stop_worker(task_id).await
    }

    /// Stop the loop and mark the record inactive so restarts skip it.
    pub async fn deactivate(&self, task_id: &str) -> Result<PollingTask, OasthubError> {
        let _guard = self.lifecycle.lock().await;
        self.stop_worker(task_id).await;
        Ok(self.store.set_task_active(task_id, false)?)
    }

    /// Stop the loop and delete the record.
    pub async fn delete(&self, task_id: &str) -> Result<bool, OasthubError> {
        let _guard = self.lifecycle.lock().await;
        self.stop_worker(task_id).await;
        Ok(self.store.remove_task(task_id)?)
    }

    /// Resume every active task that is not already running. Failures
    /// are isolated; one broken task never blocks the rest.
    pub async fn resume_all(&self) -> (usize, usize) {
        let mut resumed = 0;
        let mut failed = 0;
        for task in self.store.tasks(&TaskFilter::active()) {
            if self.is_running(&task.id) {
                continue;
            }
            match self.resume(&task.id).await {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(
                        task = %task.id,
                        provider = %task.provider_name,
                        error = %e,
                        "could not resume task"
                    );
                    failed += 1;
                }
            }
        }
        if resumed > 0 || failed > 0 {
            info!(resumed, failed, "task recovery finished");
        }
        (resumed, failed)
    }

    /// Stop every running loop, draining each worker.
    pub async fn stop_all(&self) -> usize {
        let _guard = self.lifecycle.lock().await;
        let ids: Vec<String> = self.workers.read().keys().cloned().collect();
        let mut stopped = 0;
        for id in ids {
            if self.stop_worker(&id).await {
                stopped += 1;
            }
        }
        stopped
    }

    // ---- workers ----

    async fn stop_worker(&self, task_id: &str) -> bool {
        let Some(worker) = self.workers.write().remove(task_id) else {
            return false;
        };

        let _ = worker.quit.send(true);
        if let Err(e) = worker.handle.await {
            if e.is_panic() {
                warn!(task = task_id, "polling worker panicked");
            }
        }
        if let Some(client) = worker.client {
            // deregistration is best effort on shutdown
            if let Err(e) = client.stop().await {
                debug!(task = task_id, error = %e, "interactsh session close reported an error");
            }
        }
        debug!(task = task_id, "polling worker stopped");
        true
    }

    async fn spawn_generic(
        &self,
        task: &PollingTask,
        provider: &Provider,
    ) -> Result<(), OasthubError> {
        let service = self
            .registry
            .service_for_payload(provider, Some(&task.payload))
            .ok_or_else(|| ProviderError::Invalid {
                field: "provider".to_string(),
                reason: format!("could not build an adapter for '{}'", provider.name),
            })?;

        // webhook.site and postbin derive their identity from the payload
        // URL; when that parse came up empty the loop would poll nothing,
        // so register once and persist the replacement payload
        if service.id().is_none()
            && matches!(
                task.provider_kind,
                ProviderKind::Webhooksite | ProviderKind::Postbin
            )
        {
            let payload = service.register_and_get_payload().await?.ok_or_else(|| {
                ProviderError::Registration {
                    provider: provider.name.clone(),
                    reason: "registration did not produce a payload".to_string(),
                }
            })?;
            warn!(
                task = %task.id,
                old = %task.payload,
                new = %payload.payload_url,
                "stored payload was unusable; registered a replacement"
            );
            let new_url = payload.payload_url;
            self.store.update_task(&task.id, |t| t.payload = new_url)?;
        }

        let (quit_tx, quit_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::poll_loop(
            Arc::from(service),
            task.clone(),
            self.store.clone(),
            self.sink.clone(),
            self.dedup.clone(),
            quit_rx,
        ));
        self.workers.write().insert(
            task.id.clone(),
            Worker {
                quit: quit_tx,
                handle,
                client: None,
            },
        );
        Ok(())
    }

    /// The standard worker: poll immediately, then on every interval.
    /// The quit channel is checked both while a poll is in flight and
    /// while sleeping.
    async fn poll_loop(
        service: Arc<dyn OastService>,
        task: PollingTask,
        store: Arc<Store>,
        sink: Arc<dyn EventSink>,
        dedup: Arc<DedupIndex>,
        mut quit: watch::Receiver<bool>,
    ) {
        let interval = Duration::from_millis(task.interval_ms);
        debug!(task = %task.id, provider = %task.provider_name, "polling loop started");
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                events = service.events() => {
                    let mut fresh = 0;
                    for event in events {
                        if dedup.insert(&task.tab_id, &event.id) {
                            fresh += 1;
                            sink.add_interaction(&task.tab_id, event);
                        }
                    }
                    if fresh > 0 {
                        info!(task = %task.id, tab = %task.tab_name, count = fresh, "new interactions");
                    }
                    if let Err(e) = store.update_last_polled(&task.id, Utc::now().timestamp_millis()) {
                        warn!(task = %task.id, error = %e, "could not record poll time");
                    }
                }
            }
            tokio::select! {
                _ = quit.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!(task = %task.id, "polling loop stopped");
    }

    async fn spawn_interactsh(&self, task: &PollingTask) -> Result<(), OasthubError> {
        let had_session = task.session.is_some();
        let interval = Duration::from_millis(task.interval_ms);
        let client = Arc::new(match task.session.clone() {
            Some(session) => self
                .registry
                .interactsh_client_from_session(session, Some(interval))?,
            None => {
                let provider = self.provider_for(task)?;
                self.registry
                    .interactsh_client(&provider, None, Some(interval))?
            }
        });

        let sink = self.sink.clone();
        let dedup = self.dedup.clone();
        let tab_id = task.tab_id.clone();
        let tab_name = task.tab_name.clone();
        // registration always goes to the server, refreshing the
        // correlation even when a saved session was restored
        client
            .start(move |interaction: Interaction| {
                let event = interaction.into_event();
                if dedup.insert(&tab_id, &event.id) {
                    debug!(tab = %tab_name, id = %event.id, "interactsh interaction");
                    sink.add_interaction(&tab_id, event);
                }
            })
            .await?;

        if !had_session {
            // fresh registration minted new identity; persist it with a
            // payload so the task survives restarts
            let payload = client.next_url();
            if let Some(payload) = &payload {
                info!(task = %task.id, url = %payload.payload_url, "interactsh payload ready");
            }
            self.store.update_task_session(
                &task.id,
                client.session_info(),
                payload.as_ref().map(|p| p.payload_url.clone()),
            )?;
        }

        let (quit_tx, quit_rx) = watch::channel(false);
        let handle = tokio::spawn(Self::interactsh_ticker(
            task.id.clone(),
            client.clone(),
            self.store.clone(),
            self.workers.clone(),
            quit_rx,
            interval,
        ));
        self.workers.write().insert(
            task.id.clone(),
            Worker {
                quit: quit_tx,
                handle,
                client: Some(client),
            },
        );
        Ok(())
    }

    /// Companion to the client's own polling loop: records poll times
    /// and, when the loop has died (credentials rejected), removes the
    /// worker entry so the task shows up as stopped instead of lingering
    /// as a healthy-looking zombie.
    async fn interactsh_ticker(
        task_id: String,
        client: Arc<InteractshClient>,
        store: Arc<Store>,
        workers: WorkerMap,
        mut quit: watch::Receiver<bool>,
        interval: Duration,
    ) {
        loop {
            tokio::select! {
                _ = quit.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if !client.is_polling() {
                warn!(task = %task_id, "interactsh loop ended, detaching worker");
                workers.write().remove(&task_id);
                break;
            }
            if let Err(e) = store.update_last_polled(&task_id, Utc::now().timestamp_millis()) {
                warn!(task = %task_id, error = %e, "could not record poll time");
            }
        }
    }
}
