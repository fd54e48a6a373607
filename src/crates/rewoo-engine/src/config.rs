//! Fleet configuration
//!
//! Declares the agent fleet the engine dispatches to: one entry per agent
//! with a description (surfaced to the planner), the intent prefixes it
//! serves, and its endpoint. Loaded from YAML or built programmatically;
//! local callables are registered directly on the
//! [`AgentRegistry`](crate::registry::AgentRegistry).

use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::fs;

/// Agent endpoint declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointConfig {
    /// HTTP endpoint, used for both plain and streaming dispatch
    Http {
        url: String,
        /// Request timeout in seconds
        #[serde(default = "default_timeout_secs")]
        timeout: u64,
        /// Header values may reference `${ENV_VARS}`
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

fn default_timeout_secs() -> u64 {
    20
}

/// One agent of the fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub description: String,
    /// Intent prefixes for legacy intent dispatch
    #[serde(default)]
    pub intent_space: Vec<String>,
    pub endpoint: EndpointConfig,
}

/// Full fleet declaration
///
/// Agents are kept in a sorted map so registry construction (and with it
/// intent-prefix selection order) is deterministic across loads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

impl FleetConfig {
    /// Parse fleet configuration from a YAML document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| EngineError::Configuration(format!("invalid fleet config: {e}")))
    }

    /// Load fleet configuration from a YAML file
    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content)
    }
}
