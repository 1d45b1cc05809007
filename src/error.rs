//! Error types shared by the update pipeline

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid version '{input}': {reason}")]
    VersionParse { input: String, reason: String },

    #[error("malformed release metadata from {endpoint}: {reason}")]
    MetadataParse { endpoint: String, reason: String },

    #[error("no update endpoint could be reached ({})", .attempts.join("; "))]
    Unreachable { attempts: Vec<String> },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("workspace error at {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("local version unavailable: {0}")]
    NoLocalVersion(String),

    #[error("failed to launch installer: {0}")]
    Launch(String),

    #[error("another update task is already running")]
    Busy,

    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },
}

pub type Result<T> = std::result::Result<T, UpdateError>;
