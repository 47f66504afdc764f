use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{KagError, Result};

/// Current on-disk layout of [`PersistedState`]. Bump when the shape changes.
pub const STATE_VERSION: u32 = 1;

// --- Enums ---

/// Lifecycle of the managed droplet, as seen by the reconciler.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MachinePhase {
    Absent,     // No record, or the recorded droplet no longer exists
    Creating,   // Create request sent, waiting for an address + active status
    Active,     // Has id + reachable IP
    Destroying, // Destroy request sent, waiting for removal
}

impl MachinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachinePhase::Absent => "absent",
            MachinePhase::Creating => "creating",
            MachinePhase::Active => "active",
            MachinePhase::Destroying => "destroying",
        }
    }
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Persisted records ---

/// A droplet the tool created. An id without an address cannot be represented.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MachineRecord {
    pub id: String,
    pub ip: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Local key pair plus its registration on the cloud account.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct KeyRecord {
    pub name: String,
    pub remote_id: String,
    pub fingerprint: String,
    pub private_key_path: String,
    pub public_key_path: String,
}

/// Last-known remote resources. The only durable link between the desired
/// config and what actually exists on the cloud account.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PersistedState {
    pub version: u32,
    #[serde(default)]
    pub ssh_key: Option<KeyRecord>,
    #[serde(default)]
    pub machine: Option<MachineRecord>,
    /// Droplet whose create request was accepted but which never became ready.
    /// Kept apart from `machine` so a record without an address can't exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_droplet_id: Option<String>,
    /// The one-time host bootstrap script already ran on `machine`.
    #[serde(default)]
    pub droplet_setup_done: bool,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            ssh_key: None,
            machine: None,
            pending_droplet_id: None,
            droplet_setup_done: false,
        }
    }
}

impl PersistedState {
    pub fn machine_id(&self) -> Option<&str> {
        self.machine.as_ref().map(|m| m.id.as_str())
    }

    pub fn ip(&self) -> Option<&str> {
        self.machine.as_ref().map(|m| m.ip.as_str())
    }

    /// Phase implied by the record alone (no cloud query).
    pub fn recorded_phase(&self) -> MachinePhase {
        if self.machine.is_some() {
            MachinePhase::Active
        } else if self.pending_droplet_id.is_some() {
            MachinePhase::Creating
        } else {
            MachinePhase::Absent
        }
    }

    /// The droplet `down` has to remove, ready or not.
    pub fn owned_droplet_id(&self) -> Option<&str> {
        self.machine_id().or(self.pending_droplet_id.as_deref())
    }

    /// Forget the machine and everything that only made sense for it.
    /// The key registration survives: it can be reused by the next machine.
    pub fn clear_machine(&mut self) {
        self.machine = None;
        self.pending_droplet_id = None;
        self.droplet_setup_done = false;
    }

    pub fn set_machine(&mut self, machine: MachineRecord) {
        self.machine = Some(machine);
        self.pending_droplet_id = None;
        self.droplet_setup_done = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> MachineRecord {
        MachineRecord {
            id: "123".to_string(),
            ip: "1.2.3.4".to_string(),
            name: "kag-server".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn default_state_is_absent() {
        let state = PersistedState::default();
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.machine_id(), None);
        assert_eq!(state.ip(), None);
        assert_eq!(state.recorded_phase(), MachinePhase::Absent);
    }

    #[test]
    fn clear_machine_keeps_key() {
        let mut state = PersistedState {
            ssh_key: Some(KeyRecord {
                name: "k".to_string(),
                remote_id: "42".to_string(),
                fingerprint: "SHA256:abc".to_string(),
                private_key_path: "ssh_keys/k".to_string(),
                public_key_path: "ssh_keys/k.pub".to_string(),
            }),
            ..PersistedState::default()
        };
        state.set_machine(machine());
        state.droplet_setup_done = true;
        assert_eq!(state.recorded_phase(), MachinePhase::Active);

        state.clear_machine();
        assert!(state.machine.is_none());
        assert!(!state.droplet_setup_done);
        assert!(state.ssh_key.is_some());
    }

    #[test]
    fn pending_droplet_is_creating_until_recorded() {
        let mut state = PersistedState {
            pending_droplet_id: Some("123".to_string()),
            ..PersistedState::default()
        };
        assert_eq!(state.recorded_phase(), MachinePhase::Creating);
        assert_eq!(state.owned_droplet_id(), Some("123"));
        assert_eq!(state.ip(), None);

        state.set_machine(machine());
        assert_eq!(state.pending_droplet_id, None);
        assert_eq!(state.recorded_phase(), MachinePhase::Active);

        state.pending_droplet_id = Some("124".to_string());
        state.clear_machine();
        assert_eq!(state.owned_droplet_id(), None);
    }

    #[test]
    fn state_without_pending_field_still_loads() {
        let raw = r#"{"version":1,"machine":null,"droplet_setup_done":false}"#;
        let state: PersistedState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.pending_droplet_id, None);
        assert!(!serde_json::to_string(&state).unwrap().contains("pending_droplet_id"));
    }

    #[test]
    fn id_without_ip_does_not_deserialize() {
        let raw = r#"{"version":1,"machine":{"id":"123","name":"x","created_at":"2024-01-01T00:00:00Z"}}"#;
        assert!(serde_json::from_str::<PersistedState>(raw).is_err());
    }

    #[test]
    fn phase_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&MachinePhase::Destroying).unwrap(),
            "\"destroying\""
        );
        assert_eq!(MachinePhase::Creating.to_string(), "creating");
    }
}
