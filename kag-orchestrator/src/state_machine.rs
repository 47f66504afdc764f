use kag_common::MachinePhase;
use tracing::{info, warn};

/// Allowed moves of the managed droplet:
/// ABSENT -> CREATING -> ACTIVE -> DESTROYING -> ABSENT,
/// plus ACTIVE -> ABSENT when the droplet vanished out-of-band.
pub fn can_transition(from: MachinePhase, to: MachinePhase) -> bool {
    use MachinePhase::*;
    matches!(
        (from, to),
        (Absent, Creating)
            | (Creating, Active)
            | (Active, Destroying)
            | (Active, Absent)
            | (Destroying, Absent)
    )
}

/// Tracks the current phase during one reconciler operation.
#[derive(Debug)]
pub struct PhaseTracker {
    subject: String,
    phase: MachinePhase,
}

impl PhaseTracker {
    pub fn new(subject: impl Into<String>, phase: MachinePhase) -> Self {
        Self {
            subject: subject.into(),
            phase,
        }
    }

    pub fn phase(&self) -> MachinePhase {
        self.phase
    }

    /// Move to `to`, logging the transition. Returns false (and logs) for a
    /// move outside the lifecycle; the phase still changes so the log reflects
    /// what actually happened remotely.
    pub fn transition(&mut self, to: MachinePhase, reason: &str) -> bool {
        let from = self.phase;
        if from == to {
            return true;
        }
        let ok = can_transition(from, to);
        log_state_transition(&self.subject, from, to, reason, ok);
        self.phase = to;
        ok
    }
}

/// Record a state transition.
fn log_state_transition(subject: &str, from: MachinePhase, to: MachinePhase, reason: &str, valid: bool) {
    if valid {
        info!("📊 [state_machine] {}: {} -> {} ({})", subject, from, to, reason);
    } else {
        warn!(
            "⚠️ [state_machine] {}: unexpected transition {} -> {} ({})",
            subject, from, to, reason
        );
    }
}
