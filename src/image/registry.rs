//! Registry kinds and their pull parameters.

use crate::component::{ImageDefinition, RepositoryOptions};
use crate::error::ImageError;
use crate::execution::docker_client::RegistryCredentials;

const QUAY_HOST: &str = "quay.io";
const DEFAULT_ECR_REGION: &str = "us-east-1";

/// Registry an image is pulled from, with only the parameters its pull needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryKind {
    DockerHub {
        credentials: Option<RegistryCredentials>,
    },
    Quay {
        credentials: Option<RegistryCredentials>,
    },
    /// Authentication is delegated to the engine's credential helper.
    Ecr { region: String },
}

impl RegistryKind {
    /// Selects the registry for an image definition.
    ///
    /// # Errors
    ///
    /// Returns `ImageError::UnknownRegistry` for an unrecognised `type`.
    pub fn from_definition(definition: &ImageDefinition) -> Result<Self, ImageError> {
        let repository = definition.repository.as_ref();
        match definition.registry.as_str() {
            "dockerhub" | "dockerhub-private" => Ok(RegistryKind::DockerHub {
                credentials: repository.and_then(credentials),
            }),
            "quay" | "quay-private" => Ok(RegistryKind::Quay {
                credentials: repository.and_then(credentials).map(|mut c| {
                    c.server.get_or_insert_with(|| QUAY_HOST.to_string());
                    c
                }),
            }),
            "aws-ecr" => Ok(RegistryKind::Ecr {
                region: repository
                    .and_then(|r| r.region.clone())
                    .unwrap_or_else(|| DEFAULT_ECR_REGION.to_string()),
            }),
            other => Err(ImageError::UnknownRegistry(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RegistryKind::DockerHub { .. } => "dockerhub",
            RegistryKind::Quay { .. } => "quay",
            RegistryKind::Ecr { .. } => "aws-ecr",
        }
    }

    /// Full `repository:tag` reference for the engine.
    pub fn reference(&self, uri: &str, tag: &str) -> String {
        let repository = match self {
            RegistryKind::Quay { .. } if !uri.starts_with(QUAY_HOST) => {
                format!("{}/{}", QUAY_HOST, uri.trim_start_matches('/'))
            }
            _ => uri.to_string(),
        };
        format!("{}:{}", repository, tag)
    }

    pub fn credentials(&self) -> Option<&RegistryCredentials> {
        match self {
            RegistryKind::DockerHub { credentials } | RegistryKind::Quay { credentials } => {
                credentials.as_ref()
            }
            RegistryKind::Ecr { .. } => None,
        }
    }
}

fn credentials(options: &RepositoryOptions) -> Option<RegistryCredentials> {
    match (&options.username, &options.password) {
        (Some(username), Some(password)) => Some(RegistryCredentials {
            username: username.clone(),
            password: password.clone(),
            server: options.server.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(registry: &str, uri: &str) -> ImageDefinition {
        ImageDefinition {
            registry: registry.to_string(),
            uri: uri.to_string(),
            tag: "1.2.3".to_string(),
            digest: None,
            repository: None,
        }
    }

    #[test]
    fn test_dockerhub_reference() {
        let kind = RegistryKind::from_definition(&definition("dockerhub", "keboola/python")).unwrap();
        assert_eq!(kind.name(), "dockerhub");
        assert_eq!(kind.reference("keboola/python", "1.2.3"), "keboola/python:1.2.3");
        assert!(kind.credentials().is_none());
    }

    #[test]
    fn test_quay_prefixes_host_and_defaults_server() {
        let mut def = definition("quay", "keboola/ex-db");
        def.repository = Some(RepositoryOptions {
            username: Some("robot".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        });
        let kind = RegistryKind::from_definition(&def).unwrap();
        assert_eq!(kind.reference("keboola/ex-db", "latest"), "quay.io/keboola/ex-db:latest");
        assert_eq!(kind.reference("quay.io/keboola/ex-db", "1"), "quay.io/keboola/ex-db:1");
        assert_eq!(kind.credentials().unwrap().server.as_deref(), Some("quay.io"));
    }

    #[test]
    fn test_ecr_region() {
        let mut def = definition("aws-ecr", "123.dkr.ecr.eu-central-1.amazonaws.com/app");
        def.repository = Some(RepositoryOptions {
            region: Some("eu-central-1".to_string()),
            ..Default::default()
        });
        let kind = RegistryKind::from_definition(&def).unwrap();
        assert_eq!(
            kind,
            RegistryKind::Ecr {
                region: "eu-central-1".to_string()
            }
        );
        assert!(kind.credentials().is_none());
    }

    #[test]
    fn test_partial_credentials_are_ignored() {
        let mut def = definition("dockerhub", "keboola/private");
        def.repository = Some(RepositoryOptions {
            username: Some("user".to_string()),
            ..Default::default()
        });
        let kind = RegistryKind::from_definition(&def).unwrap();
        assert!(kind.credentials().is_none());
    }

    #[test]
    fn test_unknown_registry() {
        let err = RegistryKind::from_definition(&definition("gcr", "x/y")).unwrap_err();
        assert!(matches!(err, ImageError::UnknownRegistry(ref k) if k == "gcr"));
    }
}
