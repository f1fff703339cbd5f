//! Permission configuration.
//!
//! Ordered approval chains keyed by `(node, content type)`, defined in YAML
//! and loaded at startup. Read-only to the engine; absence of a rule at a
//! node means the chain is inherited from the nearest configured ancestor.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::WorkflowError;

/// One configured approval chain: the ordered groups that must approve
/// changes to a node of the given content type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub node_id: i32,
    pub content_type_id: i32,
    /// Approval group ids, in approval order.
    pub groups: Vec<i32>,
}

/// YAML document shape for permission configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionConfig {
    #[serde(default)]
    pub rules: Vec<PermissionRule>,
}

/// Lookup table over the configured rules.
#[derive(Debug, Clone, Default)]
pub struct PermissionTable {
    rules: HashMap<(i32, i32), Vec<i32>>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule. Duplicate `(node, content type)` keys are a
    /// configuration error.
    pub fn insert(
        &mut self,
        node_id: i32,
        content_type_id: i32,
        groups: Vec<i32>,
    ) -> Result<(), WorkflowError> {
        if self
            .rules
            .insert((node_id, content_type_id), groups)
            .is_some()
        {
            return Err(WorkflowError::Config {
                reason: format!(
                    "duplicate permission rule for node {node_id}, content type {content_type_id}"
                ),
            });
        }
        Ok(())
    }

    /// The configured approval chain for `(node, content type)`, or an empty
    /// slice when no explicit rule exists.
    pub fn lookup(&self, node_id: i32, content_type_id: i32) -> &[i32] {
        self.rules
            .get(&(node_id, content_type_id))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn from_config(config: PermissionConfig) -> Result<Self, WorkflowError> {
        let mut table = Self::new();
        for rule in config.rules {
            table.insert(rule.node_id, rule.content_type_id, rule.groups)?;
        }
        Ok(table)
    }

    /// Load permission configuration from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self, WorkflowError> {
        let content = std::fs::read_to_string(path).map_err(|e| WorkflowError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::load_from_str(&content)
    }

    /// Load permission configuration from a YAML string.
    pub fn load_from_str(yaml: &str) -> Result<Self, WorkflowError> {
        let config: PermissionConfig =
            serde_yaml::from_str(yaml).map_err(|e| WorkflowError::Config {
                reason: format!("failed to parse permission configuration: {e}"),
            })?;
        Self::from_config(config)
    }
}
