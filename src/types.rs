use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdraftSettings {
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub workspace_root: Option<String>,
    #[serde(default = "default_artifact_extension")]
    pub artifact_extension: String,
    #[serde(default = "default_version_arg")]
    pub version_arg: String,
    /// Run the application with `version_arg` when it has no version resource.
    #[serde(default)]
    pub version_from_exec: bool,
    #[serde(default = "default_termination_grace_secs")]
    pub termination_grace_secs: u64,
    #[serde(default = "default_stale_workspace_hours")]
    pub stale_workspace_hours: u64,
}

fn default_network_timeout_secs() -> u64 {
    30
}
fn default_chunk_size() -> usize {
    2 * 1024 * 1024
}
fn default_user_agent() -> String {
    format!("updraft/{}", env!("CARGO_PKG_VERSION"))
}
fn default_artifact_extension() -> String {
    std::env::consts::EXE_SUFFIX.to_string()
}
fn default_version_arg() -> String {
    "--version".to_string()
}
fn default_termination_grace_secs() -> u64 {
    10
}
fn default_stale_workspace_hours() -> u64 {
    24
}

impl Default for UpdraftSettings {
    fn default() -> Self {
        Self {
            network_timeout_secs: default_network_timeout_secs(),
            chunk_size: default_chunk_size(),
            user_agent: default_user_agent(),
            endpoints: Vec::new(),
            workspace_root: None,
            artifact_extension: default_artifact_extension(),
            version_arg: default_version_arg(),
            version_from_exec: false,
            termination_grace_secs: default_termination_grace_secs(),
            stale_workspace_hours: default_stale_workspace_hours(),
        }
    }
}

impl UpdraftSettings {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .as_deref()
            .filter(|root| !root.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }
}
