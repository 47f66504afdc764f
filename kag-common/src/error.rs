//! Error taxonomy shared by every layer of the tool.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KagError>;

#[derive(Error, Debug)]
pub enum KagError {
    /// Malformed or missing config; reported before any remote action.
    #[error("config error: {0}")]
    Config(String),

    /// State file exists but cannot be trusted. Never silently discarded:
    /// losing it orphans a billable droplet.
    #[error("state file {} is unreadable or corrupt: {reason}", path.display())]
    StateCorrupt { path: PathBuf, reason: String },

    #[error(
        "droplet {droplet_id} did not settle within {waited_secs}s (last status: {last_status}); \
         it may still exist and be billing, check the DigitalOcean console"
    )]
    ProvisionTimeout {
        droplet_id: String,
        waited_secs: u64,
        last_status: String,
    },

    #[error(
        "found droplet(s) named '{name}' with ids [{}] that this state file does not track; \
         refusing to guess, remove or rename them manually",
        ids.join(", ")
    )]
    AmbiguousResource { name: String, ids: Vec<String> },

    /// SSH unreachable after retries. State is unaffected; rerun the command.
    #[error("could not connect to {ip} after {attempts} attempts: {reason}")]
    RemoteConnect {
        ip: String,
        attempts: u32,
        reason: String,
    },

    #[error("remote command `{command}` failed with exit code {code:?}")]
    RemoteCommand { command: String, code: Option<i32> },

    #[error("key error: {0}")]
    Key(String),

    #[error("cloud provider error: {0:#}")]
    Provider(anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for KagError {
    fn from(e: anyhow::Error) -> Self {
        KagError::Provider(e)
    }
}

impl KagError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    pub fn state_corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::StateCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// The command may have left a billable resource behind.
    pub fn may_be_billing(&self) -> bool {
        matches!(self, KagError::ProvisionTimeout { .. })
    }
}
