use kag_common::{KagError, PersistedState, Result, STATE_VERSION};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

pub const DEFAULT_STATE_PATH: &str = "state.json";

/// Where the reconciler checkpoints state after every cloud mutation.
/// Keeps file I/O out of the reconciliation logic.
pub trait StateSink {
    fn persist(&self, state: &PersistedState) -> Result<()>;
}

/// File-backed state: JSON, replaced atomically on every save.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory next to the state file; SSH keys live under it.
    pub fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// A missing file is a fresh start. A file that exists but can't be read
    /// or parsed is an error: throwing it away would orphan a real droplet.
    pub fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            info!("[state] No state at {}, starting fresh", self.path.display());
            return Ok(PersistedState::default());
        }
        info!("[state] Loading state from {}", self.path.display());
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| KagError::state_corrupt(&self.path, e))?;
        let state: PersistedState =
            serde_json::from_str(&text).map_err(|e| KagError::state_corrupt(&self.path, e))?;
        if state.version != STATE_VERSION {
            return Err(KagError::state_corrupt(
                &self.path,
                format!("unsupported state version {} (expected {})", state.version, STATE_VERSION),
            ));
        }
        Ok(state)
    }

    /// Write to a temp file in the same directory, fsync, then rename over the
    /// old file. A crash leaves either the old or the new state, never a torn one.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let dir = self.dir();
        std::fs::create_dir_all(&dir)?;
        let body = serde_json::to_vec_pretty(state).map_err(std::io::Error::from)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        info!("[state] Saved state to {}", self.path.display());
        Ok(())
    }
}

impl StateSink for StateStore {
    fn persist(&self, state: &PersistedState) -> Result<()> {
        self.save(state)
    }
}
