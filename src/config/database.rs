//! Target database configuration

use serde::{Deserialize, Serialize};

/// Name of the default (unversioned) workspace
pub const DEFAULT_WORKSPACE: &str = "LIVE";

/// Target database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Workspace the import writes into
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Maximum concurrent connections handed out to workers
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_workspace() -> String {
    DEFAULT_WORKSPACE.to_string()
}

fn default_max_connections() -> usize {
    64
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_default_workspace(&self) -> bool {
        self.workspace.eq_ignore_ascii_case(DEFAULT_WORKSPACE)
    }
}
