//! Resource limits for container execution.
//!
//! Computes the effective CPU, memory, swap and network limits for one
//! container launch from four inputs: instance defaults, project limit
//! overrides, project feature flags and an optional backend size hint.
//!
//! Precedence:
//! - A backend size hint replaces memory and CPU entirely.
//! - Memory: the project override for the component replaces the declared
//!   value; without an override the declared (or instance default) memory
//!   applies.
//! - CPU: the smaller of the instance limit and the project override; the
//!   instance limit applies unmodified when no override exists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::component::ComponentDescriptor;
use crate::error::LimitsError;

/// Project limit holding the CPU count available to containers.
pub const CPU_LIMIT_NAME: &str = "runner.cpuParallelism";
/// Project feature forcing containers onto the `none` network.
pub const FEATURE_NETWORK_NONE: &str = "container-network-none";

const MEMORY_LIMIT_MB_RANGE: (u64, u64) = (1, 64_000);
const CPU_LIMIT_RANGE: (u64, u64) = (1, 96);

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Network isolation mode for containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// No network access at all.
    None,
    /// Default Docker bridge network.
    #[default]
    Bridge,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::None => write!(f, "none"),
            NetworkMode::Bridge => write!(f, "bridge"),
        }
    }
}

/// Resource limits computed for one container launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Number of CPU cores (e.g., 1.0, 2.0, 4.0).
    pub cpu_count: f64,
    /// Memory limit in bytes.
    pub memory_bytes: u64,
    /// Memory + swap limit in bytes; `None` leaves swap unrestricted.
    pub memory_swap_bytes: Option<u64>,
    /// Network isolation mode.
    pub network: NetworkMode,
}

impl ResourceLimits {
    /// Memory limit in Docker's size notation.
    pub fn memory_string(&self) -> String {
        format_memory(self.memory_bytes)
    }

    pub fn memory_swap_string(&self) -> Option<String> {
        self.memory_swap_bytes.map(format_memory)
    }

    /// CPU count without a trailing `.0` for whole numbers.
    pub fn cpu_string(&self) -> String {
        if self.cpu_count.fract() == 0.0 {
            format!("{}", self.cpu_count as u64)
        } else {
            format!("{}", self.cpu_count)
        }
    }
}

/// Memory and CPU selected by a backend size hint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendSize {
    pub memory_bytes: u64,
    pub cpu_count: f64,
}

/// Looks up the fixed size → (memory, cpu) table.
pub fn backend_size(size: &str) -> Result<BackendSize, LimitsError> {
    let (memory_mb, cpu_count) = match size.to_lowercase().as_str() {
        "xsmall" => (4_000, 1.0),
        "small" => (8_000, 2.0),
        "medium" => (16_000, 4.0),
        "large" => (32_000, 8.0),
        other => return Err(LimitsError::UnknownBackendSize(other.to_string())),
    };
    Ok(BackendSize {
        memory_bytes: memory_mb * MB,
        cpu_count,
    })
}

/// Parses a Docker size string (`512m`, `2g`, `1024k`, `1048576`).
pub fn parse_memory(value: &str) -> Result<u64, LimitsError> {
    let trimmed = value.trim().to_lowercase();
    let trimmed = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('m') => (&trimmed[..trimmed.len() - 1], MB),
        Some('g') => (&trimmed[..trimmed.len() - 1], GB),
        Some(c) if c.is_ascii_digit() => (trimmed, 1),
        _ => return Err(LimitsError::InvalidMemory(value.to_string())),
    };
    let number: u64 = digits
        .parse()
        .map_err(|_| LimitsError::InvalidMemory(value.to_string()))?;
    if number == 0 {
        return Err(LimitsError::InvalidMemory(value.to_string()));
    }
    number
        .checked_mul(multiplier)
        .ok_or_else(|| LimitsError::InvalidMemory(value.to_string()))
}

/// Formats bytes in the largest exact Docker unit.
pub fn format_memory(bytes: u64) -> String {
    if bytes % GB == 0 {
        format!("{}g", bytes / GB)
    } else if bytes % MB == 0 {
        format!("{}m", bytes / MB)
    } else if bytes % 1024 == 0 {
        format!("{}k", bytes / 1024)
    } else {
        bytes.to_string()
    }
}

/// Limit computation for the containers of one job row.
#[derive(Debug, Clone)]
pub struct LimitsPolicy {
    instance_cpu_limit: f64,
    default_memory: String,
    project_features: Vec<String>,
    project_limits: HashMap<String, Value>,
    backend_size: Option<String>,
}

impl LimitsPolicy {
    pub fn new(instance_cpu_limit: f64, default_memory: impl Into<String>) -> Self {
        Self {
            instance_cpu_limit,
            default_memory: default_memory.into(),
            project_features: Vec::new(),
            project_limits: HashMap::new(),
            backend_size: None,
        }
    }

    pub fn with_project_features(mut self, features: Vec<String>) -> Self {
        self.project_features = features;
        self
    }

    pub fn with_project_limits(mut self, limits: HashMap<String, Value>) -> Self {
        self.project_limits = limits;
        self
    }

    pub fn with_backend_size(mut self, size: Option<String>) -> Self {
        self.backend_size = size;
        self
    }

    fn dynamic_size(&self) -> Result<Option<BackendSize>, LimitsError> {
        self.backend_size.as_deref().map(backend_size).transpose()
    }

    /// Effective CPU count for the component.
    pub fn cpu_limit(&self, component: &ComponentDescriptor) -> Result<f64, LimitsError> {
        if let Some(size) = self.dynamic_size()? {
            info!(
                component = %component.id,
                backend_size = self.backend_size.as_deref().unwrap_or_default(),
                cpu = size.cpu_count,
                "Using backend size CPU limit"
            );
            return Ok(size.cpu_count);
        }

        let project = self.project_limit(CPU_LIMIT_NAME, CPU_LIMIT_RANGE)?;
        let effective = match project {
            Some(limit) => self.instance_cpu_limit.min(limit as f64),
            None => self.instance_cpu_limit,
        };
        info!(
            component = %component.id,
            instance = self.instance_cpu_limit,
            project = ?project,
            effective,
            "CPU limit"
        );
        Ok(effective)
    }

    /// Effective memory limit in bytes.
    pub fn memory_limit(&self, component: &ComponentDescriptor) -> Result<u64, LimitsError> {
        if let Some(size) = self.dynamic_size()? {
            info!(
                component = %component.id,
                backend_size = self.backend_size.as_deref().unwrap_or_default(),
                memory = %format_memory(size.memory_bytes),
                "Using backend size memory limit"
            );
            return Ok(size.memory_bytes);
        }

        let declared_raw = component.memory.as_deref().unwrap_or(&self.default_memory);
        let declared = parse_memory(declared_raw)?;
        let name = memory_limit_name(&component.id);
        let project = self.project_limit(&name, MEMORY_LIMIT_MB_RANGE)?;
        let effective = project.map(|mb| mb * MB).unwrap_or(declared);

        info!(
            component = %component.id,
            declared = %format_memory(declared),
            project = %project.map(|mb| format_memory(mb * MB)).unwrap_or_else(|| "not set".to_string()),
            effective = %format_memory(effective),
            "Memory limit"
        );
        Ok(effective)
    }

    /// Swap limit; `None` when the component opts out of swap accounting.
    pub fn memory_swap_limit(
        &self,
        component: &ComponentDescriptor,
    ) -> Result<Option<u64>, LimitsError> {
        if component.capabilities().disable_swap {
            return Ok(None);
        }
        self.memory_limit(component).map(Some)
    }

    /// Network mode; a project feature can force `none`.
    pub fn network_limit(&self, component: &ComponentDescriptor) -> NetworkMode {
        let forced = self.project_features.iter().any(|f| f == FEATURE_NETWORK_NONE);
        let effective = if forced {
            NetworkMode::None
        } else {
            component.network
        };
        info!(
            component = %component.id,
            declared = %component.network,
            effective = %effective,
            "Network limit"
        );
        effective
    }

    /// Computes the full limit snapshot for one launch.
    pub fn limits_for(&self, component: &ComponentDescriptor) -> Result<ResourceLimits, LimitsError> {
        Ok(ResourceLimits {
            cpu_count: self.cpu_limit(component)?,
            memory_bytes: self.memory_limit(component)?,
            memory_swap_bytes: self.memory_swap_limit(component)?,
            network: self.network_limit(component),
        })
    }

    fn project_limit(&self, name: &str, range: (u64, u64)) -> Result<Option<u64>, LimitsError> {
        let Some(raw) = self.project_limits.get(name) else {
            return Ok(None);
        };
        // Limits are delivered either bare or wrapped as {"name": .., "value": ..}.
        let value = raw.get("value").unwrap_or(raw);
        let invalid = |reason: &str| LimitsError::InvalidProjectLimit {
            name: name.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let number = match value {
            Value::Number(n) => n.as_u64().ok_or_else(|| invalid("not a positive integer"))?,
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| invalid("not a positive integer"))?,
            _ => return Err(invalid("not a number")),
        };
        if number < range.0 || number > range.1 {
            return Err(invalid(&format!(
                "must be between {} and {}",
                range.0, range.1
            )));
        }
        Ok(Some(number))
    }
}

/// Project limit name carrying the memory override for a component.
pub fn memory_limit_name(component_id: &str) -> String {
    format!("runner.{}.memoryLimitMBs", component_id)
}
