//! JSON-file persistence
//!
//! Everything the tool must survive a restart with lives in one
//! `store.json`: provider records, polling tasks, captured interactions
//! and user settings. Reads go through a [`parking_lot::RwLock`]; every
//! mutation rewrites the file while the write lock is held so
//! concurrent writers serialize.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::polling::task::{HealthStatus, PollingTask, TaskFilter};
use crate::provider::{OastEvent, Provider, SessionInfo};

fn default_poll_interval() -> u64 {
    30
}

/// User-tunable settings persisted alongside the data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default poll interval in seconds for new tasks
    pub poll_interval_secs: u64,
    /// Path suffix appended to freshly minted HTTP payload URLs
    pub payload_prefix: String,
    /// Resume active tasks automatically on startup
    pub persistent_polling: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            payload_prefix: String::new(),
            persistent_polling: false,
        }
    }
}

/// One captured event, tagged with the tab that owns it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredInteraction {
    pub tab_id: String,
    #[serde(flatten)]
    pub event: OastEvent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreData {
    providers: Vec<Provider>,
    tasks: Vec<PollingTask>,
    interactions: Vec<StoredInteraction>,
    settings: Settings,
}

pub struct Store {
    /// `None` keeps the store purely in memory
    path: Option<PathBuf>,
    data: RwLock<StoreData>,
}

impl Store {
    /// Open a store file, creating an empty one lazily on first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = if path.exists() {
            let file = File::open(&path).map_err(|source| StoreError::Read {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| StoreError::Serialize(e.to_string()))?
        } else {
            StoreData::default()
        };
        debug!(
            path = %path.display(),
            providers = data.providers.len(),
            tasks = data.tasks.len(),
            interactions = data.interactions.len(),
            "store opened"
        );
        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    /// In-memory store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(StoreData::default()),
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let file = File::create(path).map_err(|source| StoreError::Write {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), data)
            .map_err(|e| StoreError::Serialize(e.to_string()))?;
        Ok(())
    }

    /// Apply a mutation and rewrite the file under the write lock.
    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut StoreData) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut data = self.data.write();
        let result = apply(&mut data)?;
        self.persist(&data)?;
        Ok(result)
    }

    // ---- providers ----

    pub fn providers(&self) -> Vec<Provider> {
        self.data.read().providers.clone()
    }

    pub fn provider(&self, id: &str) -> Option<Provider> {
        self.data.read().providers.iter().find(|p| p.id == id).cloned()
    }

    pub fn provider_by_name(&self, name: &str) -> Option<Provider> {
        self.data
            .read()
            .providers
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub fn insert_provider(&self, provider: Provider) -> Result<(), StoreError> {
        self.mutate(|data| {
            if data.providers.iter().any(|p| p.name == provider.name) {
                return Err(StoreError::Validation {
                    field: "name".to_string(),
                    reason: format!("a provider named '{}' already exists", provider.name),
                });
            }
            data.providers.push(provider);
            Ok(())
        })
    }

    pub fn update_provider(&self, provider: Provider) -> Result<(), StoreError> {
        self.mutate(|data| {
            if data
                .providers
                .iter()
                .any(|p| p.id != provider.id && p.name == provider.name)
            {
                return Err(StoreError::Validation {
                    field: "name".to_string(),
                    reason: format!("a provider named '{}' already exists", provider.name),
                });
            }
            let slot = data
                .providers
                .iter_mut()
                .find(|p| p.id == provider.id)
                .ok_or_else(|| StoreError::NotFound {
                    what: "provider",
                    id: provider.id.clone(),
                })?;
            *slot = provider;
            Ok(())
        })
    }

    pub fn remove_provider(&self, id: &str) -> Result<bool, StoreError> {
        self.mutate(|data| {
            let before = data.providers.len();
            data.providers.retain(|p| p.id != id);
            Ok(data.providers.len() != before)
        })
    }

    // ---- polling tasks ----

    pub fn tasks(&self, filter: &TaskFilter) -> Vec<PollingTask> {
        self.data
            .read()
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    pub fn task(&self, id: &str) -> Option<PollingTask> {
        self.data.read().tasks.iter().find(|t| t.id == id).cloned()
    }

    /// Insert a task. At most one active task may exist per
    /// (tab, payload) pair; a second insert for the same pair fails.
    pub fn insert_task(&self, task: PollingTask) -> Result<(), StoreError> {
        self.mutate(|data| {
            if task.is_active
                && data
                    .tasks
                    .iter()
                    .any(|t| t.is_active && t.tab_id == task.tab_id && t.payload == task.payload)
            {
                return Err(StoreError::DuplicateTask {
                    tab_id: task.tab_id.clone(),
                    payload: task.payload.clone(),
                });
            }
            data.tasks.push(task);
            Ok(())
        })
    }

    pub fn remove_task(&self, id: &str) -> Result<bool, StoreError> {
        self.mutate(|data| {
            let before = data.tasks.len();
            data.tasks.retain(|t| t.id != id);
            Ok(data.tasks.len() != before)
        })
    }

    /// Apply an in-place edit to a task and touch `updated_at`.
    pub fn update_task(
        &self,
        id: &str,
        edit: impl FnOnce(&mut PollingTask),
    ) -> Result<PollingTask, StoreError> {
        self.mutate(|data| {
            let task = data
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| StoreError::NotFound {
                    what: "polling task",
                    id: id.to_string(),
                })?;
            edit(task);
            task.updated_at = Utc::now().timestamp_millis();
            Ok(task.clone())
        })
    }

    pub fn update_last_polled(&self, id: &str, at_ms: i64) -> Result<(), StoreError> {
        self.update_task(id, |t| t.last_polled = at_ms).map(|_| ())
    }

    pub fn update_health(
        &self,
        id: &str,
        status: HealthStatus,
        checked_at_ms: i64,
    ) -> Result<(), StoreError> {
        self.update_task(id, |t| {
            t.health_status = status;
            t.last_health_check = Some(checked_at_ms);
        })
        .map(|_| ())
    }

    /// Flip `is_active`. Reactivation re-checks the one-active-task-per
    /// (tab, payload) rule, same as insert.
    pub fn set_task_active(&self, id: &str, active: bool) -> Result<PollingTask, StoreError> {
        self.mutate(|data| {
            let position = data
                .tasks
                .iter()
                .position(|t| t.id == id)
                .ok_or_else(|| StoreError::NotFound {
                    what: "polling task",
                    id: id.to_string(),
                })?;
            if active {
                let target = &data.tasks[position];
                if data
                    .tasks
                    .iter()
                    .any(|t| t.id != id && t.is_active && t.tab_id == target.tab_id && t.payload == target.payload)
                {
                    return Err(StoreError::DuplicateTask {
                        tab_id: target.tab_id.clone(),
                        payload: target.payload.clone(),
                    });
                }
            }
            let task = &mut data.tasks[position];
            task.is_active = active;
            task.updated_at = Utc::now().timestamp_millis();
            Ok(task.clone())
        })
    }

    /// Store a refreshed Interactsh session and, when registration
    /// minted a new payload, the payload that replaces the stale one.
    pub fn update_task_session(
        &self,
        id: &str,
        session: Option<SessionInfo>,
        payload: Option<String>,
    ) -> Result<(), StoreError> {
        self.update_task(id, |t| {
            t.session = session;
            if let Some(payload) = payload {
                t.payload = payload;
            }
        })
        .map(|_| ())
    }

    // ---- interactions ----

    pub fn append_interaction(&self, tab_id: &str, event: &OastEvent) -> Result<(), StoreError> {
        self.mutate(|data| {
            data.interactions.push(StoredInteraction {
                tab_id: tab_id.to_string(),
                event: event.clone(),
            });
            Ok(())
        })
    }

    pub fn interactions(&self, tab_id: Option<&str>) -> Vec<StoredInteraction> {
        self.data
            .read()
            .interactions
            .iter()
            .filter(|i| tab_id.map_or(true, |t| i.tab_id == t))
            .cloned()
            .collect()
    }

    pub fn clear_interactions(&self, tab_id: &str) -> Result<usize, StoreError> {
        self.mutate(|data| {
            let before = data.interactions.len();
            data.interactions.retain(|i| i.tab_id != tab_id);
            Ok(before - data.interactions.len())
        })
    }

    // ---- settings ----

    pub fn settings(&self) -> Settings {
        self.data.read().settings.clone()
    }

    pub fn update_settings(&self, edit: impl FnOnce(&mut Settings)) -> Result<Settings, StoreError> {
        self.mutate(|data| {
            edit(&mut data.settings);
            Ok(data.settings.clone())
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}
