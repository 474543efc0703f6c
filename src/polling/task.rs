//! Polling task records
//!
//! A task ties a tab to one provider payload and carries everything
//! needed to resume it after a restart: the payload, the interval, the
//! health bookkeeping and, for Interactsh, the saved session material.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::provider::{ProviderKind, SessionInfo};

/// Health verdict recorded by the monitor. `Unknown` until the first
/// audit after creation or resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

fn default_active() -> bool {
    true
}

/// A persisted polling task. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingTask {
    pub id: String,
    pub tab_id: String,
    pub tab_name: String,
    pub provider_id: String,
    pub provider_name: String,
    pub provider_kind: ProviderKind,
    pub payload: String,
    pub interval_ms: u64,
    pub last_polled: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub last_health_check: Option<i64>,
    #[serde(default)]
    pub health_status: HealthStatus,
    /// Interactsh session material; `None` for every other kind
    #[serde(default)]
    pub session: Option<SessionInfo>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating a task. `session` carries pre-minted Interactsh
/// identity so the payload in `payload` stays reachable on resume.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub tab_id: String,
    pub tab_name: String,
    pub provider_id: String,
    pub provider_name: String,
    pub provider_kind: ProviderKind,
    pub payload: String,
    pub interval_ms: u64,
    pub session: Option<SessionInfo>,
}

impl NewTask {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.tab_id.trim().is_empty() {
            return Err(StoreError::Validation {
                field: "tab_id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.payload.trim().is_empty() {
            return Err(StoreError::Validation {
                field: "payload".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.interval_ms == 0 {
            return Err(StoreError::Validation {
                field: "interval_ms".to_string(),
                reason: "must be a positive number of milliseconds".to_string(),
            });
        }
        Ok(())
    }

    pub fn into_task(self) -> PollingTask {
        let now = Utc::now().timestamp_millis();
        PollingTask {
            id: Uuid::new_v4().to_string(),
            tab_id: self.tab_id,
            tab_name: self.tab_name,
            provider_id: self.provider_id,
            provider_name: self.provider_name,
            provider_kind: self.provider_kind,
            payload: self.payload,
            interval_ms: self.interval_ms,
            last_polled: now,
            is_active: true,
            last_health_check: None,
            health_status: HealthStatus::Unknown,
            session: self.session,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Listing filter; empty filter matches everything
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub tab_id: Option<String>,
    pub provider_id: Option<String>,
    pub active_only: bool,
}

impl TaskFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    pub fn for_tab(tab_id: impl Into<String>) -> Self {
        Self {
            tab_id: Some(tab_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &PollingTask) -> bool {
        if let Some(tab_id) = &self.tab_id {
            if &task.tab_id != tab_id {
                return false;
            }
        }
        if let Some(provider_id) = &self.provider_id {
            if &task.provider_id != provider_id {
                return false;
            }
        }
        if self.active_only && !task.is_active {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task() -> NewTask {
        NewTask {
            tab_id: "tab-1".to_string(),
            tab_name: "Recon".to_string(),
            provider_id: "prov-1".to_string(),
            provider_name: "main boast".to_string(),
            provider_kind: ProviderKind::Boast,
            payload: "c4n4ry.boast.example.com".to_string(),
            interval_ms: 30_000,
            session: None,
        }
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut task = new_task();
        task.interval_ms = 0;
        assert!(task.validate().is_err());

        let mut task = new_task();
        task.payload = "  ".to_string();
        assert!(task.validate().is_err());

        assert!(new_task().validate().is_ok());
    }

    #[test]
    fn test_into_task_fills_defaults() {
        let task = new_task().into_task();
        assert!(!task.id.is_empty());
        assert!(task.is_active);
        assert_eq!(task.health_status, HealthStatus::Unknown);
        assert!(task.session.is_none());
        assert_eq!(task.created_at, task.updated_at);
        assert_eq!(task.last_polled, task.created_at);
    }

    #[test]
    fn test_filter_matches_on_tab_provider_and_active() {
        let mut task = new_task().into_task();

        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::for_tab("tab-1").matches(&task));
        assert!(!TaskFilter::for_tab("tab-2").matches(&task));

        let by_provider = TaskFilter {
            provider_id: Some("prov-1".to_string()),
            ..TaskFilter::default()
        };
        assert!(by_provider.matches(&task));

        task.is_active = false;
        assert!(!TaskFilter::active().matches(&task));
        assert!(TaskFilter::default().matches(&task));
    }

    #[test]
    fn test_health_status_serde_round_trip() {
        let json = serde_json::to_string(&HealthStatus::Unhealthy).unwrap();
        assert_eq!(json, r#""unhealthy""#);
        let parsed: HealthStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_missing_health_fields_default_on_read() {
        let task = new_task().into_task();
        let mut value = serde_json::to_value(&task).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("health_status");
        object.remove("last_health_check");
        object.remove("is_active");
        object.remove("session");

        let parsed: PollingTask = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.health_status, HealthStatus::Unknown);
        assert!(parsed.is_active);
        assert!(parsed.last_health_check.is_none());
    }
}
