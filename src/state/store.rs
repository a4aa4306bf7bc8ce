//! State persistence targets and stores.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::StateError;

/// Resource a state snapshot is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTarget {
    Configuration {
        branch_id: String,
        component_id: String,
        config_id: String,
    },
    Row {
        branch_id: String,
        component_id: String,
        config_id: String,
        row_id: String,
    },
}

impl StateTarget {
    /// Row-scoped when a row id is given, configuration-scoped otherwise.
    pub fn new(
        branch_id: impl Into<String>,
        component_id: impl Into<String>,
        config_id: impl Into<String>,
        row_id: Option<String>,
    ) -> Self {
        let branch_id = branch_id.into();
        let component_id = component_id.into();
        let config_id = config_id.into();
        match row_id {
            Some(row_id) => StateTarget::Row {
                branch_id,
                component_id,
                config_id,
                row_id,
            },
            None => StateTarget::Configuration {
                branch_id,
                component_id,
                config_id,
            },
        }
    }

    /// Storage API path of the state resource.
    pub fn path(&self) -> String {
        match self {
            StateTarget::Configuration {
                branch_id,
                component_id,
                config_id,
            } => format!(
                "v2/storage/branch/{}/components/{}/configs/{}/state",
                urlencoding::encode(branch_id),
                urlencoding::encode(component_id),
                urlencoding::encode(config_id)
            ),
            StateTarget::Row {
                branch_id,
                component_id,
                config_id,
                row_id,
            } => format!(
                "v2/storage/branch/{}/components/{}/configs/{}/rows/{}/state",
                urlencoding::encode(branch_id),
                urlencoding::encode(component_id),
                urlencoding::encode(config_id),
                urlencoding::encode(row_id)
            ),
        }
    }
}

/// Durable storage for state snapshots.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Writes the full snapshot.
    ///
    /// # Errors
    ///
    /// Returns `StateError::NotFound` when the target does not exist.
    async fn save(&self, target: &StateTarget, state: &Value) -> Result<(), StateError>;
}

/// [`StateStore`] backed by the Storage API.
pub struct HttpStateStore {
    http_client: Client,
    base_url: String,
    token: String,
}

impl HttpStateStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, StateError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| StateError::RequestFailed(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn url(&self, target: &StateTarget) -> String {
        format!("{}/{}", self.base_url, target.path())
    }
}

#[async_trait]
impl StateStore for HttpStateStore {
    async fn save(&self, target: &StateTarget, state: &Value) -> Result<(), StateError> {
        let url = self.url(target);
        let body = serde_json::to_string(state)?;
        debug!(url = %url, "Storing state");

        let response = self
            .http_client
            .put(&url)
            .header("X-StorageApi-Token", &self.token)
            .form(&[("state", body.as_str())])
            .send()
            .await
            .map_err(|e| StateError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error response".to_string());
        if status.as_u16() == 404 {
            return Err(StateError::NotFound(error_text));
        }
        Err(StateError::RequestFailed(format!(
            "{} responded {}: {}",
            url,
            status.as_u16(),
            error_text
        )))
    }
}

/// [`StateStore`] keeping writes in memory.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    writes: Mutex<Vec<(StateTarget, Value)>>,
    missing: bool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose every target reports "not found".
    pub fn missing() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            missing: true,
        }
    }

    pub fn writes(&self) -> Vec<(StateTarget, Value)> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, target: &StateTarget, state: &Value) -> Result<(), StateError> {
        if self.missing {
            return Err(StateError::NotFound(format!(
                "Configuration not found: {}",
                target.path()
            )));
        }
        self.writes
            .lock()
            .map_err(|_| StateError::RequestFailed("state store poisoned".to_string()))?
            .push((target.clone(), state.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_configuration_and_row_paths_differ() {
        let config = StateTarget::new("default", "keboola.ex-db", "123", None);
        let row = StateTarget::new("default", "keboola.ex-db", "123", Some("456".to_string()));

        assert_eq!(
            config.path(),
            "v2/storage/branch/default/components/keboola.ex-db/configs/123/state"
        );
        assert_eq!(
            row.path(),
            "v2/storage/branch/default/components/keboola.ex-db/configs/123/rows/456/state"
        );
    }

    #[test]
    fn test_path_segments_are_encoded() {
        let target = StateTarget::new("default", "my component", "a/b", None);
        assert!(target.path().contains("my%20component"));
        assert!(target.path().contains("a%2Fb"));
    }

    #[test]
    fn test_http_store_url() {
        let store = HttpStateStore::new("https://connection.example.com/", "token").unwrap();
        let target = StateTarget::new("42", "c", "1", None);
        assert_eq!(
            store.url(&target),
            "https://connection.example.com/v2/storage/branch/42/components/c/configs/1/state"
        );
    }

    #[tokio::test]
    async fn test_http_store_connection_error() {
        let store = HttpStateStore::new("http://127.0.0.1:1", "token").unwrap();
        let target = StateTarget::new("default", "c", "1", None);
        let err = store.save(&target, &json!({})).await.unwrap_err();
        assert!(matches!(err, StateError::RequestFailed(_)));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStateStore::new();
        let target = StateTarget::new("default", "c", "1", None);
        store.save(&target, &json!({"a": 1})).await.unwrap();
        assert_eq!(store.writes(), vec![(target.clone(), json!({"a": 1}))]);

        let missing = InMemoryStateStore::missing();
        let err = missing.save(&target, &json!({})).await.unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }
}
