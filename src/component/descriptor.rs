//! Component descriptors and their resolved capability set.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execution::resources::NetworkMode;

/// Feature flag: run the container as root instead of the configured uid:gid.
pub const FEATURE_ROOT_USER: &str = "container-root-user";
/// Feature flag: do not set a swap limit.
pub const FEATURE_NO_SWAP: &str = "no-swap";
/// Feature flag: report every non-zero exit code as a user error.
pub const FEATURE_NO_APPLICATION_ERRORS: &str = "no-application-errors";
/// Feature flag: refuse to run on a non-default branch.
pub const FEATURE_DEV_BRANCH_BLOCKED: &str = "dev-branch-job-blocked";
/// Feature flag: expose scalar parameters as `KBC_PARAMETER_*` variables.
pub const FEATURE_INJECT_ENVIRONMENT: &str = "inject-environment";

/// Credentials and location details for private registries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryOptions {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, rename = "#password")]
    pub password: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Where the component image lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDefinition {
    /// Registry kind: `dockerhub`, `quay` or `aws-ecr`.
    #[serde(rename = "type")]
    pub registry: String,
    pub uri: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Expected content digest, if pinned.
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub repository: Option<RepositoryOptions>,
}

fn default_tag() -> String {
    "latest".to_string()
}

/// How the component reports its log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    /// Plain stdout/stderr capture.
    #[default]
    Standard,
    /// Structured events streamed to a local listener.
    Gelf,
}

/// Declarative description of a runnable component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    pub id: String,
    pub image: ImageDefinition,
    /// Memory limit as a Docker size string (e.g. `256m`, `2g`).
    #[serde(default)]
    pub memory: Option<String>,
    /// Hard process timeout in seconds.
    #[serde(default)]
    pub process_timeout: Option<u64>,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default)]
    pub forward_token: bool,
    #[serde(default)]
    pub forward_token_details: bool,
    #[serde(default)]
    pub logging: LoggingMode,
    #[serde(default)]
    pub features: Vec<String>,
    /// Component-level parameters rendered into every config file.
    #[serde(default)]
    pub image_parameters: Map<String, Value>,
}

impl ComponentDescriptor {
    pub fn new(id: impl Into<String>, image: ImageDefinition) -> Self {
        Self {
            id: id.into(),
            image,
            memory: None,
            process_timeout: None,
            network: NetworkMode::default(),
            forward_token: false,
            forward_token_details: false,
            logging: LoggingMode::default(),
            features: Vec::new(),
            image_parameters: Map::new(),
        }
    }

    pub fn with_memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    pub fn with_process_timeout(mut self, seconds: u64) -> Self {
        self.process_timeout = Some(seconds);
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    pub fn with_logging(mut self, logging: LoggingMode) -> Self {
        self.logging = logging;
        self
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    /// Resolves the flags scattered across the descriptor into one value.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            run_as_root: self.has_feature(FEATURE_ROOT_USER),
            disable_swap: self.has_feature(FEATURE_NO_SWAP),
            disable_application_errors: self.has_feature(FEATURE_NO_APPLICATION_ERRORS),
            block_branch_jobs: self.has_feature(FEATURE_DEV_BRANCH_BLOCKED),
            inject_environment: self.has_feature(FEATURE_INJECT_ENVIRONMENT),
            forward_token: self.forward_token,
            forward_token_details: self.forward_token_details,
            structured_logging: self.logging == LoggingMode::Gelf,
        }
    }
}

/// Immutable capability set resolved once per descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub run_as_root: bool,
    pub disable_swap: bool,
    pub disable_application_errors: bool,
    pub block_branch_jobs: bool,
    pub inject_environment: bool,
    pub forward_token: bool,
    pub forward_token_details: bool,
    pub structured_logging: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_descriptor() {
        let json = r##"{
            "id": "keboola.ex-http",
            "image": {
                "type": "aws-ecr",
                "uri": "123.dkr.ecr.us-east-1.amazonaws.com/ex-http",
                "tag": "1.4.0",
                "repository": {"username": "AWS", "#password": "secret", "region": "us-east-1"}
            },
            "memory": "512m",
            "process_timeout": 600,
            "network": "none",
            "logging": "gelf",
            "features": ["no-swap", "container-root-user"]
        }"##;

        let descriptor: ComponentDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.image.tag, "1.4.0");
        assert_eq!(descriptor.network, NetworkMode::None);
        assert_eq!(
            descriptor.image.repository.as_ref().and_then(|r| r.password.as_deref()),
            Some("secret")
        );

        let caps = descriptor.capabilities();
        assert!(caps.run_as_root);
        assert!(caps.disable_swap);
        assert!(caps.structured_logging);
        assert!(!caps.disable_application_errors);
        assert!(!caps.inject_environment);
    }

    #[test]
    fn test_defaults() {
        let json = r#"{"id": "a", "image": {"type": "dockerhub", "uri": "keboola/a"}}"#;
        let descriptor: ComponentDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.image.tag, "latest");
        assert_eq!(descriptor.network, NetworkMode::Bridge);
        assert_eq!(descriptor.logging, LoggingMode::Standard);
        assert_eq!(descriptor.capabilities(), Capabilities::default());
    }

    #[test]
    fn test_unknown_network_is_rejected() {
        let json = r#"{"id": "a", "image": {"type": "dockerhub", "uri": "a"}, "network": "host"}"#;
        assert!(serde_json::from_str::<ComponentDescriptor>(json).is_err());
    }
}
