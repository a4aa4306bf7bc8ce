//! Job rows and their configuration.
//!
//! A [`JobRow`] is the immutable unit of work handed to the pipeline. Its
//! `configuration` is kept as raw JSON and parsed into a
//! [`JobConfiguration`] right before execution so that schema problems
//! surface as user errors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::component::ComponentDescriptor;
use crate::error::RunnerError;

/// Storage token forwarded to components that request it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub token: String,
}

/// Identifiers and project settings shared by every row of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub job_id: String,
    pub run_id: String,
    pub project_id: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default = "default_branch_id")]
    pub branch_id: String,
    #[serde(default = "default_true")]
    pub branch_is_default: bool,
    #[serde(default)]
    pub token: Option<TokenInfo>,
    /// Project feature flags.
    #[serde(default)]
    pub project_features: Vec<String>,
    /// Project limits keyed by limit name (e.g. `runner.cpuParallelism`).
    #[serde(default)]
    pub project_limits: HashMap<String, Value>,
}

fn default_branch_id() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        Self {
            run_id: job_id.clone(),
            job_id,
            project_id: project_id.into(),
            project_name: String::new(),
            branch_id: default_branch_id(),
            branch_is_default: true,
            token: None,
            project_features: Vec::new(),
            project_limits: HashMap::new(),
        }
    }
}

/// One execution unit: a component run against one configuration (row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    pub component: ComponentDescriptor,
    #[serde(default = "empty_object")]
    pub configuration: Value,
    #[serde(default)]
    pub config_id: Option<String>,
    #[serde(default)]
    pub row_id: Option<String>,
    #[serde(default)]
    pub config_version: Option<String>,
    /// Prior state snapshot as persisted by the previous run.
    #[serde(default = "empty_object")]
    pub state: Value,
    #[serde(default)]
    pub disabled: bool,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl JobRow {
    pub fn new(component: ComponentDescriptor, configuration: Value) -> Self {
        Self {
            component,
            configuration,
            config_id: None,
            row_id: None,
            config_version: None,
            state: empty_object(),
            disabled: false,
        }
    }

    pub fn with_config_id(mut self, id: impl Into<String>) -> Self {
        self.config_id = Some(id.into());
        self
    }

    pub fn with_row_id(mut self, id: impl Into<String>) -> Self {
        self.row_id = Some(id.into());
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Human readable identifier used in logs.
    pub fn label(&self) -> String {
        match (&self.config_id, &self.row_id) {
            (Some(config), Some(row)) => format!("{}/{}/{}", self.component.id, config, row),
            (Some(config), None) => format!("{}/{}", self.component.id, config),
            _ => self.component.id.clone(),
        }
    }
}

/// Reference to a processor component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorDefinition {
    pub component: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// One processor entry of `processors.before` or `processors.after`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorSpec {
    pub definition: ProcessorDefinition,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Processors {
    #[serde(default)]
    pub before: Vec<ProcessorSpec>,
    #[serde(default)]
    pub after: Vec<ProcessorSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub backend: Option<BackendSettings>,
    #[serde(default)]
    pub process_timeout: Option<u64>,
    #[serde(default)]
    pub image_tag: Option<String>,
}

/// Parsed job configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfiguration {
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub storage: Map<String, Value>,
    #[serde(default)]
    pub processors: Processors,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub authorization: Map<String, Value>,
    #[serde(default)]
    pub action: Option<String>,
    // Resolved upstream by templating; accepted so valid trees still parse.
    #[serde(default)]
    pub variables_id: Option<Value>,
    #[serde(default)]
    pub variables_values_id: Option<Value>,
    #[serde(default)]
    pub shared_code_id: Option<Value>,
    #[serde(default)]
    pub shared_code_row_ids: Option<Value>,
}

impl JobConfiguration {
    /// Parses and validates a raw configuration tree.
    pub fn parse(raw: &Value) -> Result<Self, RunnerError> {
        if raw.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(raw.clone())
            .map_err(|e| RunnerError::user(format!("Configuration is invalid: {}", e)))
    }

    /// Backend size hint requested for this run, if any.
    pub fn backend_size(&self) -> Option<&str> {
        self.runtime
            .backend
            .as_ref()
            .and_then(|b| b.size.as_deref())
    }
}
