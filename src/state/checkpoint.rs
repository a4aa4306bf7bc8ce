//! State checkpoint of one job row.
//!
//! Lifecycle: created from the row's prior snapshot, the main stage's
//! `out/state.json` is read with [`StateCheckpoint::load_from_file`] and
//! stashed, and [`StateCheckpoint::persist`] writes the composed snapshot
//! once after all stages finished.

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::StateError;
use crate::state::encryptor::{encrypt_secrets, EncryptionScope, SecretEncryptor};
use crate::state::snapshot::{InputState, StateSnapshot};
use crate::state::store::{StateStore, StateTarget};

pub struct StateCheckpoint {
    target: Option<StateTarget>,
    scope: EncryptionScope,
    loaded: StateSnapshot,
    stashed: Option<Value>,
    store: Arc<dyn StateStore>,
    encryptor: Arc<dyn SecretEncryptor>,
}

impl std::fmt::Debug for StateCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCheckpoint")
            .field("target", &self.target)
            .field("loaded", &self.loaded)
            .field("stashed", &self.stashed)
            .finish()
    }
}

impl StateCheckpoint {
    /// `target` is `None` for rows without a configuration; such a
    /// checkpoint never writes.
    pub fn new(
        target: Option<StateTarget>,
        scope: EncryptionScope,
        prior: StateSnapshot,
        store: Arc<dyn StateStore>,
        encryptor: Arc<dyn SecretEncryptor>,
    ) -> Self {
        Self {
            target,
            scope,
            loaded: prior,
            stashed: None,
            store,
            encryptor,
        }
    }

    /// Snapshot the next persist is compared against.
    pub fn loaded(&self) -> &StateSnapshot {
        &self.loaded
    }

    pub fn stashed(&self) -> Option<&Value> {
        self.stashed.as_ref()
    }

    /// Component state to hand to the main stage.
    pub fn component_state(&self) -> &Value {
        &self.loaded.component
    }

    /// Reads and deletes the state file written by the main stage.
    ///
    /// A missing file yields an empty object.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidStateFile` if the file is not a JSON object.
    pub async fn load_from_file(&self, path: &Path) -> Result<Value, StateError> {
        let body = match tokio::fs::read(path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file produced");
                return Ok(Value::Object(Map::new()));
            }
            Err(e) => return Err(e.into()),
        };
        tokio::fs::remove_file(path).await?;

        let invalid = |reason: String| StateError::InvalidStateFile {
            path: path.display().to_string(),
            reason,
        };
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Object(Map::new()));
        }
        match serde_json::from_slice::<Value>(&body) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(Value::Array(items)) if items.is_empty() => Ok(Value::Object(Map::new())),
            Ok(_) => Err(invalid("state must be a JSON object".to_string())),
            Err(e) => Err(invalid(e.to_string())),
        }
    }

    /// Records the new component state. No external call is made.
    pub fn stash(&mut self, component: Value) {
        self.stashed = Some(component);
    }

    /// Snapshot `persist` would write for the given input state.
    pub fn compose(&self, input: InputState) -> StateSnapshot {
        StateSnapshot {
            component: self
                .stashed
                .clone()
                .unwrap_or_else(|| self.loaded.component.clone()),
            storage: input,
        }
    }

    /// Writes the composed snapshot if it differs from the loaded one.
    ///
    /// Returns whether a write happened. At most one write is issued per call.
    pub async fn persist(&mut self, input: InputState) -> Result<bool, StateError> {
        let composed = self.compose(input);
        if composed == self.loaded {
            debug!("State unchanged, nothing to store");
            return Ok(false);
        }
        let Some(target) = &self.target else {
            debug!("No configuration to store state for");
            return Ok(false);
        };

        let encrypted = encrypt_secrets(self.encryptor.as_ref(), &self.scope, composed.to_value()).await?;
        self.store.save(target, &encrypted).await?;
        info!(target = %target.path(), "State stored");

        self.loaded = composed;
        self.stashed = None;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::encryptor::tests::{scope, PrefixEncryptor};
    use crate::state::store::InMemoryStateStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn checkpoint(prior: Value, store: Arc<InMemoryStateStore>) -> StateCheckpoint {
        StateCheckpoint::new(
            Some(StateTarget::new("default", "keboola.ex-db", "cfg", None)),
            scope(),
            StateSnapshot::from_value(&prior),
            store,
            Arc::new(PrefixEncryptor::default()),
        )
    }

    #[tokio::test]
    async fn test_unchanged_state_is_not_written() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut cp = checkpoint(json!({"component": {"a": 1}}), Arc::clone(&store));

        cp.stash(json!({"a": 1}));
        assert!(!cp.persist(InputState::default()).await.unwrap());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_empty_to_non_empty_writes_once() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut cp = checkpoint(json!({}), Arc::clone(&store));

        cp.stash(json!({"cursor": 5}));
        assert!(cp.persist(InputState::default()).await.unwrap());
        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1["component"], json!({"cursor": 5}));

        assert!(!cp.persist(InputState::default()).await.unwrap());
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_non_empty_to_empty_writes_once() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut cp = checkpoint(json!({"component": {"cursor": 5}}), Arc::clone(&store));

        cp.stash(json!({}));
        assert!(cp.persist(InputState::default()).await.unwrap());
        assert_eq!(store.writes()[0].1["component"], json!({}));
    }

    #[tokio::test]
    async fn test_storage_namespace_change_writes() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut cp = checkpoint(json!({}), Arc::clone(&store));

        let input = InputState {
            tables: vec![json!({"source": "in.c-main.t", "lastImportDate": "2024-01-01"})],
            files: vec![],
        };
        assert!(cp.persist(input).await.unwrap());
        assert_eq!(
            store.writes()[0].1["storage"]["input"]["tables"][0]["source"],
            "in.c-main.t"
        );
    }

    #[tokio::test]
    async fn test_replaces_rather_than_merges() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut cp = checkpoint(json!({"component": {"foo": "bar"}}), Arc::clone(&store));

        cp.stash(json!({"baz": "fooBar"}));
        cp.persist(InputState::default()).await.unwrap();
        assert_eq!(store.writes()[0].1["component"], json!({"baz": "fooBar"}));
    }

    #[tokio::test]
    async fn test_secrets_are_encrypted() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut cp = checkpoint(json!({}), Arc::clone(&store));

        cp.stash(json!({"#token": "secret", "page": 2}));
        cp.persist(InputState::default()).await.unwrap();
        let written = &store.writes()[0].1;
        assert_eq!(written["component"]["#token"], "KBC::Test::secret");
        assert_eq!(written["component"]["page"], 2);
    }

    #[tokio::test]
    async fn test_not_found_is_reported() {
        let store = Arc::new(InMemoryStateStore::missing());
        let mut cp = checkpoint(json!({}), store);
        cp.stash(json!({"a": 1}));
        let err = cp.persist(InputState::default()).await.unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
        assert!(err.to_string().starts_with("Failed to store state"));
    }

    #[tokio::test]
    async fn test_without_target_never_writes() {
        let store = Arc::new(InMemoryStateStore::new());
        let mut cp = StateCheckpoint::new(
            None,
            scope(),
            StateSnapshot::default(),
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::new(PrefixEncryptor::default()),
        );
        cp.stash(json!({"a": 1}));
        assert!(!cp.persist(InputState::default()).await.unwrap());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_load_from_file_consumes_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, r#"{"baz": "fooBar"}"#).unwrap();
        let cp = checkpoint(json!({}), Arc::new(InMemoryStateStore::new()));

        assert_eq!(cp.load_from_file(&path).await.unwrap(), json!({"baz": "fooBar"}));
        assert!(!path.exists());
        assert_eq!(cp.load_from_file(&path).await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_load_from_file_rejects_invalid_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let cp = checkpoint(json!({}), Arc::new(InMemoryStateStore::new()));

        let err = cp.load_from_file(&path).await.unwrap_err();
        assert!(matches!(err, StateError::InvalidStateFile { .. }));
        assert!(!path.exists());
    }
}
