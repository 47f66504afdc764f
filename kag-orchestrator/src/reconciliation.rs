//! Converges the recorded droplet toward the desired config.
//!
//! The reconciler is idempotent, not transactional: every cloud mutation is
//! checkpointed through the [`StateSink`] straight away, so an interrupted run
//! can simply be repeated.

use chrono::Utc;
use kag_common::{KagError, MachinePhase, MachineRecord, PersistedState, Result};
use kag_providers::inventory::{Droplet, DropletRequest, DropletStatus};
use kag_providers::CloudProvider;
use tracing::{info, warn};

use crate::config::DesiredConfig;
use crate::keys::SshKeyPair;
use crate::logger;
use crate::retry::{self, Attempt, PollError, RetryPolicy};
use crate::state_machine::PhaseTracker;
use crate::state_store::StateSink;

pub const DROPLET_TAG: &str = "one-click-kag";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpAction {
    /// The recorded droplet exists; nothing was created.
    Reused,
    Created,
    /// The recorded droplet had vanished; a new one replaced it.
    Recreated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownAction {
    /// Nothing recorded; destroying something absent is success.
    Noop,
    Destroyed,
    /// Recorded, but the provider no longer knew it.
    AlreadyGone,
}

pub struct Reconciler<'a> {
    provider: &'a dyn CloudProvider,
    sink: &'a dyn StateSink,
    policy: RetryPolicy,
}

impl<'a> Reconciler<'a> {
    pub fn new(provider: &'a dyn CloudProvider, sink: &'a dyn StateSink, policy: RetryPolicy) -> Self {
        Self { provider, sink, policy }
    }

    /// Make sure exactly one ready droplet backs `state`, creating it if needed.
    pub async fn up(
        &self,
        config: &DesiredConfig,
        key: &SshKeyPair,
        mut state: PersistedState,
    ) -> Result<(PersistedState, UpAction)> {
        let mut discarded: Option<String> = None;

        if let Some(record) = state.machine.clone() {
            let mut tracker = PhaseTracker::new(format!("droplet {}", record.id), MachinePhase::Active);
            match self.provider.get_droplet(&record.id).await? {
                Some(d) if d.status == DropletStatus::Archive => {
                    warn!(
                        "[reconciler] Droplet {} is archived; it will be replaced. Remove it manually once the new server is up.",
                        d.id
                    );
                    tracker.transition(MachinePhase::Absent, "droplet archived");
                    discarded = Some(record.id.clone());
                }
                Some(d) => {
                    info!("[reconciler] Droplet already exists (id={}, status={}), will not create a new one.", d.id, d.status.as_str());
                    let ready = self.bring_up_existing(d).await?;
                    let ip = ready.ip_address.clone().unwrap_or_default();
                    if ip != record.ip {
                        info!("[reconciler] Droplet {} address changed {} -> {}", record.id, record.ip, ip);
                        if let Some(m) = state.machine.as_mut() {
                            m.ip = ip;
                        }
                        self.sink.persist(&state)?;
                    }
                    return Ok((state, UpAction::Reused));
                }
                None => {
                    warn!(
                        "[reconciler] Droplet {} recorded in state no longer exists (deleted out-of-band?), re-creating",
                        record.id
                    );
                    tracker.transition(MachinePhase::Absent, "droplet vanished");
                    discarded = Some(record.id.clone());
                }
            }
            state.clear_machine();
            self.sink.persist(&state)?;
        }

        if let Some(pending) = state.pending_droplet_id.clone() {
            match self.provider.get_droplet(&pending).await? {
                Some(d) if d.status != DropletStatus::Archive => {
                    info!(
                        "[reconciler] Resuming droplet {} from an earlier run (status={})",
                        d.id,
                        d.status.as_str()
                    );
                    let mut tracker = PhaseTracker::new(format!("droplet {}", d.id), MachinePhase::Creating);
                    let ready = self.bring_up_existing(d).await?;
                    tracker.transition(MachinePhase::Active, "droplet active with address");
                    let machine = machine_record(ready);
                    info!("[reconciler] Droplet {} is active at {}", machine.id, machine.ip);
                    state.set_machine(machine);
                    self.sink.persist(&state)?;
                    return Ok((state, UpAction::Created));
                }
                _ => {
                    warn!(
                        "[reconciler] Droplet {} from an earlier run is gone, creating a new one",
                        pending
                    );
                    state.pending_droplet_id = None;
                    self.sink.persist(&state)?;
                    discarded = Some(pending);
                }
            }
        }

        self.ensure_no_untracked(&config.droplet.name, discarded.as_deref())
            .await?;

        let machine = self.create(config, key, &mut state).await?;
        info!("[reconciler] Droplet {} is active at {}", machine.id, machine.ip);
        state.set_machine(machine);
        // Checkpoint before any remote configuration: a later failure must not orphan the droplet.
        self.sink.persist(&state)?;

        let action = if discarded.is_some() {
            UpAction::Recreated
        } else {
            UpAction::Created
        };
        Ok((state, action))
    }

    /// Destroy the recorded droplet (or the one still booting), if any.
    /// Leaves the key registration alone.
    pub async fn down(&self, mut state: PersistedState) -> Result<(PersistedState, DownAction)> {
        let Some(droplet_id) = state.owned_droplet_id().map(|id| id.to_string()) else {
            info!("[reconciler] No droplet recorded in state, nothing to destroy");
            return Ok((state, DownAction::Noop));
        };

        let mut tracker = PhaseTracker::new(format!("droplet {}", droplet_id), MachinePhase::Active);
        tracker.transition(MachinePhase::Destroying, "destroy requested");

        let metadata = state
            .machine
            .as_ref()
            .map(|m| serde_json::json!({ "name": m.name, "ip": m.ip }));
        let existed = logger::logged(
            "DROPLET_DESTROY",
            &droplet_id,
            metadata,
            self.provider.destroy_droplet(&droplet_id),
        )
        .await?;

        if existed {
            self.wait_gone(&droplet_id).await?;
        } else {
            info!("[reconciler] Droplet {} was already gone", droplet_id);
        }

        tracker.transition(MachinePhase::Absent, "droplet removed");
        state.clear_machine();
        self.sink.persist(&state)?;

        let action = if existed {
            DownAction::Destroyed
        } else {
            DownAction::AlreadyGone
        };
        Ok((state, action))
    }

    /// A droplet carrying our name that the state does not track is never adopted
    /// or replaced silently: it may be someone's billable server.
    async fn ensure_no_untracked(&self, name: &str, discarded: Option<&str>) -> Result<()> {
        let mut ids: Vec<String> = self
            .provider
            .list_droplets_by_name(name)
            .await?
            .into_iter()
            .map(|d| d.id)
            .filter(|id| Some(id.as_str()) != discarded)
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        ids.sort();
        Err(KagError::AmbiguousResource {
            name: name.to_string(),
            ids,
        })
    }

    async fn create(
        &self,
        config: &DesiredConfig,
        key: &SshKeyPair,
        state: &mut PersistedState,
    ) -> Result<MachineRecord> {
        let mut tracker = PhaseTracker::new(format!("droplet {}", config.droplet.name), MachinePhase::Absent);
        let request = DropletRequest {
            name: config.droplet.name.clone(),
            region: config.droplet.region.clone(),
            size_slug: config.droplet.size_slug.clone(),
            image: config.droplet.image.clone(),
            backups: config.droplet.backups,
            ssh_key_ids: vec![key.remote_id.clone()],
            tags: vec![DROPLET_TAG.to_string()],
        };

        info!("[reconciler] Creating droplet...");
        let droplet_id = logger::logged(
            "DROPLET_CREATE",
            &request.name,
            Some(serde_json::json!({
                "region": request.region,
                "size": request.size_slug,
                "image": request.image,
                "backups": request.backups,
                "ssh_key_id": key.remote_id,
            })),
            self.provider.create_droplet(&request),
        )
        .await?;
        tracker.transition(MachinePhase::Creating, "create request accepted");
        state.pending_droplet_id = Some(droplet_id.clone());
        self.sink.persist(state)?;

        let droplet = self.wait_ready(&droplet_id).await?;
        tracker.transition(MachinePhase::Active, "droplet active with address");

        Ok(machine_record(droplet))
    }

    /// The recorded droplet exists: power it on if stopped, wait if still booting.
    async fn bring_up_existing(&self, droplet: Droplet) -> Result<Droplet> {
        if droplet.is_ready() {
            return Ok(droplet);
        }
        if droplet.status == DropletStatus::Off {
            info!("[reconciler] Droplet {} is off, powering on", droplet.id);
            if !self.provider.power_on_droplet(&droplet.id).await? {
                return Err(KagError::Provider(anyhow::anyhow!(
                    "droplet {} is off and the provider cannot power it on",
                    droplet.id
                )));
            }
        }
        self.wait_ready(&droplet.id).await
    }

    /// Block until the droplet is active and has a public address.
    async fn wait_ready(&self, droplet_id: &str) -> Result<Droplet> {
        info!("[reconciler] Waiting for droplet {} to be active...", droplet_id);
        let polled = retry::poll(&self.policy, "droplet ready", || async move {
            match self.provider.get_droplet(droplet_id).await? {
                Some(d) if d.is_ready() => Ok::<_, KagError>(Attempt::Ready(d)),
                Some(d) => Ok(Attempt::Pending(d.status.as_str().to_string())),
                None => Err(KagError::Provider(anyhow::anyhow!(
                    "droplet {} disappeared while waiting for it to become active",
                    droplet_id
                ))),
            }
        })
        .await;

        match polled {
            Ok(d) => Ok(d),
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::TimedOut { waited, last, .. }) => Err(KagError::ProvisionTimeout {
                droplet_id: droplet_id.to_string(),
                waited_secs: waited.as_secs(),
                last_status: last,
            }),
        }
    }

    async fn wait_gone(&self, droplet_id: &str) -> Result<()> {
        info!("[reconciler] Waiting for droplet {} to be removed...", droplet_id);
        let polled = retry::poll(&self.policy, "droplet removed", || async move {
            match self.provider.get_droplet(droplet_id).await? {
                None => Ok::<_, KagError>(Attempt::Ready(())),
                Some(d) => Ok(Attempt::Pending(d.status.as_str().to_string())),
            }
        })
        .await;

        match polled {
            Ok(()) => Ok(()),
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::TimedOut { waited, last, .. }) => Err(KagError::ProvisionTimeout {
                droplet_id: droplet_id.to_string(),
                waited_secs: waited.as_secs(),
                last_status: format!("still present ({})", last),
            }),
        }
    }
}

fn machine_record(droplet: Droplet) -> MachineRecord {
    MachineRecord {
        id: droplet.id,
        ip: droplet.ip_address.unwrap_or_default(),
        name: droplet.name,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use kag_providers::mock::MockProvider;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MemorySink(RefCell<Vec<PersistedState>>);

    impl StateSink for MemorySink {
        fn persist(&self, state: &PersistedState) -> Result<()> {
            self.0.borrow_mut().push(state.clone());
            Ok(())
        }
    }

    const CONFIG: &str = r#"
secrets:
  digitalocean_key: "t"
droplet:
  name: kag-server
  region: nyc1
  image: ubuntu-22-04-x64
  size_slug: s-1vcpu-1gb
kag: {}
"#;

    fn key() -> SshKeyPair {
        SshKeyPair {
            name: "one_click_kag_server_0badf00d".into(),
            private_key_path: PathBuf::from("ssh_keys/k"),
            public_key_path: PathBuf::from("ssh_keys/k.pub"),
            public_key: "ssh-ed25519 AAAA".into(),
            fingerprint: "SHA256:x".into(),
            remote_id: "k1".into(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_secs(1), Duration::from_millis(1))
    }

    #[test]
    fn created_droplet_is_checkpointed_with_tag_and_key() {
        let dir = TempDir::new().unwrap();
        let cfg = config::parse(CONFIG, dir.path(), None).unwrap();
        let mock = MockProvider::new().with_boot_polls(3);
        let sink = MemorySink::default();
        let reconciler = Reconciler::new(&mock, &sink, policy());

        let (state, action) =
            tokio_test::block_on(reconciler.up(&cfg, &key(), PersistedState::default())).unwrap();

        assert_eq!(action, UpAction::Created);
        assert_eq!(state.machine_id(), Some("123"));
        let persisted = sink.0.borrow();
        assert_eq!(persisted.last(), Some(&state));
        let req = &mock.create_requests()[0];
        assert_eq!(req.tags, vec![DROPLET_TAG.to_string()]);
        assert_eq!(req.ssh_key_ids, vec!["k1".to_string()]);
    }

    #[test]
    fn archived_droplet_is_replaced_not_ambiguous() {
        let dir = TempDir::new().unwrap();
        let cfg = config::parse(CONFIG, dir.path(), None).unwrap();
        let mock = MockProvider::new();
        let archived = mock.seed_droplet("kag-server", DropletStatus::Archive);
        let mut state = PersistedState::default();
        state.set_machine(MachineRecord {
            id: archived.clone(),
            ip: "1.2.3.4".into(),
            name: "kag-server".into(),
            created_at: Utc::now(),
        });
        state.droplet_setup_done = true;

        let sink = MemorySink::default();
        let reconciler = Reconciler::new(&mock, &sink, policy());
        let (state, action) = tokio_test::block_on(reconciler.up(&cfg, &key(), state)).unwrap();

        assert_eq!(action, UpAction::Recreated);
        assert_ne!(state.machine_id(), Some(archived.as_str()));
        assert!(!state.droplet_setup_done);
        // the stale record is dropped before anything new is created
        assert!(sink.0.borrow()[0].machine.is_none());
    }

    #[test]
    fn down_of_vanished_droplet_clears_record() {
        let mock = MockProvider::new();
        let mut state = PersistedState::default();
        state.set_machine(MachineRecord {
            id: "777".into(),
            ip: "1.2.3.4".into(),
            name: "kag-server".into(),
            created_at: Utc::now(),
        });

        let sink = MemorySink::default();
        let reconciler = Reconciler::new(&mock, &sink, policy());
        let (state, action) = tokio_test::block_on(reconciler.down(state)).unwrap();

        assert_eq!(action, DownAction::AlreadyGone);
        assert!(state.machine.is_none());
        assert_eq!(sink.0.borrow().len(), 1);
    }

    #[test]
    fn destroy_timeout_keeps_record() {
        let mock = MockProvider::new().with_destroy_polls(u32::MAX);
        let id = mock.seed_droplet("kag-server", DropletStatus::Active);
        let mut state = PersistedState::default();
        state.set_machine(MachineRecord {
            id: id.clone(),
            ip: "1.2.3.4".into(),
            name: "kag-server".into(),
            created_at: Utc::now(),
        });

        let sink = MemorySink::default();
        let quick = RetryPolicy::fixed(Duration::from_millis(10), Duration::from_millis(2));
        let reconciler = Reconciler::new(&mock, &sink, quick);
        let err = tokio_test::block_on(reconciler.down(state)).unwrap_err();

        assert!(matches!(err, KagError::ProvisionTimeout { .. }));
        assert!(sink.0.borrow().is_empty());
    }

    /// Delegates to the mock but keeps the trait's default power-on.
    struct NoPowerOn(MockProvider);

    #[async_trait::async_trait]
    impl CloudProvider for NoPowerOn {
        async fn create_droplet(&self, request: &DropletRequest) -> anyhow::Result<String> {
            self.0.create_droplet(request).await
        }
        async fn get_droplet(&self, droplet_id: &str) -> anyhow::Result<Option<Droplet>> {
            self.0.get_droplet(droplet_id).await
        }
        async fn list_droplets_by_name(&self, name: &str) -> anyhow::Result<Vec<Droplet>> {
            self.0.list_droplets_by_name(name).await
        }
        async fn destroy_droplet(&self, droplet_id: &str) -> anyhow::Result<bool> {
            self.0.destroy_droplet(droplet_id).await
        }
        async fn list_ssh_keys(&self) -> anyhow::Result<Vec<kag_providers::inventory::RegisteredKey>> {
            self.0.list_ssh_keys().await
        }
        async fn register_ssh_key(
            &self,
            name: &str,
            public_key: &str,
        ) -> anyhow::Result<kag_providers::inventory::RegisteredKey> {
            self.0.register_ssh_key(name, public_key).await
        }
    }

    #[test]
    fn off_droplet_without_power_on_support_fails_fast() {
        let dir = TempDir::new().unwrap();
        let cfg = config::parse(CONFIG, dir.path(), None).unwrap();
        let provider = NoPowerOn(MockProvider::new());
        let id = provider.0.seed_droplet("kag-server", DropletStatus::Off);
        let mut state = PersistedState::default();
        state.set_machine(MachineRecord {
            id: id.clone(),
            ip: "1.2.3.4".into(),
            name: "kag-server".into(),
            created_at: Utc::now(),
        });

        let sink = MemorySink::default();
        // a long policy: the error must not come from waiting out the deadline
        let slow = RetryPolicy::fixed(Duration::from_secs(30), Duration::from_millis(500));
        let reconciler = Reconciler::new(&provider, &sink, slow);
        let started = std::time::Instant::now();
        let err = tokio_test::block_on(reconciler.up(&cfg, &key(), state)).unwrap_err();

        assert!(matches!(err, KagError::Provider(_)), "got {err:?}");
        assert!(err.to_string().contains(&id));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(provider.0.get_calls(), 1);
        assert!(sink.0.borrow().is_empty());
    }

    #[test]
    fn create_checkpoints_pending_droplet_before_waiting() {
        let dir = TempDir::new().unwrap();
        let cfg = config::parse(CONFIG, dir.path(), None).unwrap();
        let mock = MockProvider::new().never_ready();
        let sink = MemorySink::default();
        let quick = RetryPolicy::fixed(Duration::from_millis(10), Duration::from_millis(2));
        let reconciler = Reconciler::new(&mock, &sink, quick);

        let err = tokio_test::block_on(reconciler.up(&cfg, &key(), PersistedState::default())).unwrap_err();

        assert!(matches!(err, KagError::ProvisionTimeout { .. }));
        let persisted = sink.0.borrow();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].pending_droplet_id.as_deref(), Some("123"));
        assert!(persisted[0].machine.is_none());
    }

    #[test]
    fn down_destroys_droplet_that_never_became_ready() {
        let mock = MockProvider::new();
        let id = mock.seed_droplet("kag-server", DropletStatus::New);
        let state = PersistedState {
            pending_droplet_id: Some(id.clone()),
            ..PersistedState::default()
        };

        let sink = MemorySink::default();
        let reconciler = Reconciler::new(&mock, &sink, policy());
        let (state, action) = tokio_test::block_on(reconciler.down(state)).unwrap();

        assert_eq!(action, DownAction::Destroyed);
        assert_eq!(mock.destroy_requests(), vec![id]);
        assert!(state.pending_droplet_id.is_none());
        assert_eq!(mock.droplet_count(), 0);
    }
}
