use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// An action that has started and will be completed with a status + duration.
#[derive(Debug)]
pub struct ActionLog {
    pub id: Uuid,
    pub action_type: &'static str,
    started: Instant,
}

impl ActionLog {
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// Simple action logger: one structured line when an action starts.
pub fn log_event(action_type: &'static str, subject: &str) -> ActionLog {
    log_event_with_metadata(action_type, subject, None)
}

/// Log event with metadata (context info)
pub fn log_event_with_metadata(
    action_type: &'static str,
    subject: &str,
    metadata: Option<serde_json::Value>,
) -> ActionLog {
    let id = Uuid::new_v4();
    let metadata = metadata.map(|m| m.to_string()).unwrap_or_default();
    info!(
        action_id = %id,
        action = action_type,
        status = "in_progress",
        "📝 {} {} {}",
        action_type,
        subject,
        metadata
    );
    ActionLog {
        id,
        action_type,
        started: Instant::now(),
    }
}

/// Log event completion with duration
pub fn log_event_complete(log: &ActionLog, status: &str, error_message: Option<&str>) {
    log_event_complete_with_metadata(log, status, error_message, None)
}

/// Log event completion with metadata
pub fn log_event_complete_with_metadata(
    log: &ActionLog,
    status: &str,
    error_message: Option<&str>,
    metadata: Option<serde_json::Value>,
) {
    let duration_ms = log.elapsed_ms();
    let metadata = metadata.map(|m| m.to_string()).unwrap_or_default();
    match error_message {
        Some(msg) => error!(
            action_id = %log.id,
            action = log.action_type,
            status,
            duration_ms = duration_ms as u64,
            "❌ {} {}: {} {}",
            log.action_type,
            status,
            msg,
            metadata
        ),
        None => info!(
            action_id = %log.id,
            action = log.action_type,
            status,
            duration_ms = duration_ms as u64,
            "✅ {} {} ({}ms) {}",
            log.action_type,
            status,
            duration_ms,
            metadata
        ),
    }
}

/// Run `f`, logging start and completion (success or failure) around it.
pub async fn logged<T, E, F>(action_type: &'static str, subject: &str, metadata: Option<serde_json::Value>, f: F) -> Result<T, E>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let log = log_event_with_metadata(action_type, subject, metadata);
    let out = f.await;
    match &out {
        Ok(_) => log_event_complete(&log, "success", None),
        Err(e) => log_event_complete(&log, "failed", Some(&e.to_string())),
    }
    out
}
