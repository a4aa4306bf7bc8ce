//! Encryption of secret state values.
//!
//! Keys starting with `#` hold secrets. Their string values are encrypted
//! before the state leaves the runner, unless they already carry the
//! `KBC::` cipher prefix.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use serde_json::Value;

use crate::error::StateError;

/// Prefix marking a secret key.
pub const SECRET_KEY_PREFIX: char = '#';
/// Prefix of already encrypted values.
pub const CIPHER_PREFIX: &str = "KBC::";

/// Identifiers the encryption is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionScope {
    pub project_id: String,
    pub component_id: String,
    pub config_id: Option<String>,
}

/// Turns one plaintext secret into ciphertext.
#[async_trait]
pub trait SecretEncryptor: Send + Sync {
    async fn encrypt(&self, scope: &EncryptionScope, plain: &str) -> Result<String, StateError>;
}

/// [`SecretEncryptor`] backed by the encryption API.
pub struct HttpEncryptor {
    http_client: Client,
    base_url: String,
}

impl HttpEncryptor {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StateError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StateError::EncryptionFailed(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, scope: &EncryptionScope) -> String {
        let mut url = format!(
            "{}/encrypt?componentId={}&projectId={}",
            self.base_url,
            urlencoding::encode(&scope.component_id),
            urlencoding::encode(&scope.project_id)
        );
        if let Some(config_id) = &scope.config_id {
            url.push_str(&format!("&configId={}", urlencoding::encode(config_id)));
        }
        url
    }
}

#[async_trait]
impl SecretEncryptor for HttpEncryptor {
    async fn encrypt(&self, scope: &EncryptionScope, plain: &str) -> Result<String, StateError> {
        let response = self
            .http_client
            .post(self.url(scope))
            .header("Content-Type", "text/plain")
            .body(plain.to_string())
            .send()
            .await
            .map_err(|e| StateError::EncryptionFailed(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StateError::EncryptionFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(StateError::EncryptionFailed(format!(
                "encryption API responded {}: {}",
                status.as_u16(),
                text
            )));
        }
        Ok(text)
    }
}

/// Encrypts every secret value in `value`, recursing into objects and arrays.
pub fn encrypt_secrets<'a>(
    encryptor: &'a dyn SecretEncryptor,
    scope: &'a EncryptionScope,
    value: Value,
) -> BoxFuture<'a, Result<Value, StateError>> {
    async move {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    let item = match item {
                        Value::String(s)
                            if key.starts_with(SECRET_KEY_PREFIX) && !s.starts_with(CIPHER_PREFIX) =>
                        {
                            Value::String(encryptor.encrypt(scope, &s).await?)
                        }
                        other => encrypt_secrets(encryptor, scope, other).await?,
                    };
                    out.insert(key, item);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(encrypt_secrets(encryptor, scope, item).await?);
                }
                Ok(Value::Array(out))
            }
            other => Ok(other),
        }
    }
    .boxed()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Encryptor that prefixes values and records what it saw.
    #[derive(Default)]
    pub(crate) struct PrefixEncryptor {
        pub(crate) seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SecretEncryptor for PrefixEncryptor {
        async fn encrypt(&self, _scope: &EncryptionScope, plain: &str) -> Result<String, StateError> {
            self.seen.lock().unwrap().push(plain.to_string());
            Ok(format!("KBC::Test::{}", plain))
        }
    }

    pub(crate) fn scope() -> EncryptionScope {
        EncryptionScope {
            project_id: "123".to_string(),
            component_id: "keboola.ex-db".to_string(),
            config_id: Some("cfg".to_string()),
        }
    }

    #[tokio::test]
    async fn test_encrypts_nested_secrets_only() {
        let encryptor = PrefixEncryptor::default();
        let state = json!({
            "#token": "abc",
            "plain": "visible",
            "nested": {"#password": "pwd", "list": [{"#key": "k"}]},
            "#done": "KBC::ProjectSecure::xyz",
            "#number": 5
        });

        let encrypted = encrypt_secrets(&encryptor, &scope(), state).await.unwrap();

        assert_eq!(encrypted["#token"], "KBC::Test::abc");
        assert_eq!(encrypted["plain"], "visible");
        assert_eq!(encrypted["nested"]["#password"], "KBC::Test::pwd");
        assert_eq!(encrypted["nested"]["list"][0]["#key"], "KBC::Test::k");
        assert_eq!(encrypted["#done"], "KBC::ProjectSecure::xyz");
        assert_eq!(encrypted["#number"], 5);
        assert_eq!(encryptor.seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_http_encryptor_url() {
        let encryptor = HttpEncryptor::new("https://encryption.example.com/").unwrap();
        assert_eq!(
            encryptor.url(&scope()),
            "https://encryption.example.com/encrypt?componentId=keboola.ex-db&projectId=123&configId=cfg"
        );
    }
}
