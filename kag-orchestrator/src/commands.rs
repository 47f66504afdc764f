//! The user-facing command flows, wired from the building blocks.

use kag_common::{KagError, MachineRecord, PersistedState, Result};
use kag_providers::CloudProvider;
use tokio::io::BufReader;
use tracing::{info, warn};

use crate::config::DesiredConfig;
use crate::configurator::{ConfigureMode, Configurator};
use crate::keys::{KeyManager, SshKeyPair, KEYS_DIR};
use crate::rcon;
use crate::reconciliation::{DownAction, Reconciler, UpAction};
use crate::remote::{Connector, SshShell};
use crate::retry::RetryPolicy;
use crate::state_store::StateStore;

/// Collaborators shared by every command.
pub struct Context<'a> {
    pub provider: &'a dyn CloudProvider,
    pub connector: &'a dyn Connector,
    pub store: &'a StateStore,
    pub cloud_policy: RetryPolicy,
    pub ssh_policy: RetryPolicy,
}

impl<'a> Context<'a> {
    pub fn new(provider: &'a dyn CloudProvider, connector: &'a dyn Connector, store: &'a StateStore) -> Self {
        Self {
            provider,
            connector,
            store,
            cloud_policy: RetryPolicy::cloud_default(),
            ssh_policy: RetryPolicy::ssh_default(),
        }
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(self.provider, self.store, self.cloud_policy)
    }
}

pub async fn up(ctx: &Context<'_>, config: &DesiredConfig) -> Result<PersistedState> {
    let mut state = ctx.store.load()?;

    let keys = KeyManager::new(ctx.provider, ctx.store.dir().join(KEYS_DIR));
    let key = keys.ensure_key_pair(state.ssh_key.as_ref()).await?;
    let record = key.to_record();
    if state.ssh_key.as_ref() != Some(&record) {
        state.ssh_key = Some(record);
        ctx.store.save(&state)?;
    }

    let (mut state, action) = ctx.reconciler().up(config, &key, state).await?;
    let machine = recorded_machine(&state)?;
    match action {
        UpAction::Reused => info!("[up] Reusing droplet {} at {}", machine.id, machine.ip),
        UpAction::Created | UpAction::Recreated => {
            info!("[up] Droplet {} created at {}", machine.id, machine.ip)
        }
    }

    let shell = ctx.connector.open(&machine.ip, &key);
    let configurator = Configurator::new(shell.as_ref(), &machine.ip);
    configurator.wait_until_reachable(&ctx.ssh_policy).await?;

    if !state.droplet_setup_done {
        configurator.setup_droplet().await?;
        state.droplet_setup_done = true;
        ctx.store.save(&state)?;
    }

    configurator.configure(config, ConfigureMode::Fresh).await?;
    ctx.store.save(&state)?;

    println!("KAG server is up at {}", machine.ip);
    Ok(state)
}

pub async fn down(ctx: &Context<'_>, config: &DesiredConfig, skip_cache: bool) -> Result<PersistedState> {
    let state = ctx.store.load()?;

    if config.kag.cache && !skip_cache {
        if let Some(machine) = state.machine.clone() {
            match ctx.provider.get_droplet(&machine.id).await? {
                Some(d) if d.is_ready() => {
                    let key = recorded_key(&state)?;
                    let shell = ctx.connector.open(&machine.ip, &key);
                    let configurator = Configurator::new(shell.as_ref(), &machine.ip);
                    configurator.wait_until_reachable(&ctx.ssh_policy).await?;
                    configurator.save_cache(config).await?;
                }
                Some(d) => warn!(
                    "[down] Droplet {} is {}, skipping cache save",
                    machine.id,
                    d.status.as_str()
                ),
                None => warn!("[down] Droplet {} no longer exists, skipping cache save", machine.id),
            }
        }
    }

    let (state, action) = ctx.reconciler().down(state).await?;
    match action {
        DownAction::Noop => println!("No droplet recorded, nothing to do"),
        DownAction::Destroyed | DownAction::AlreadyGone => println!("Droplet destroyed"),
    }
    Ok(state)
}

pub async fn restart_kag(ctx: &Context<'_>, config: &DesiredConfig) -> Result<()> {
    let state = ctx.store.load()?;
    let (machine, key) = require_active(&state)?;
    let shell = ctx.connector.open(&machine.ip, &key);
    let configurator = Configurator::new(shell.as_ref(), &machine.ip);
    configurator.wait_until_reachable(&ctx.ssh_policy).await?;
    configurator.configure(config, ConfigureMode::Restart).await
}

pub async fn kag_logs(store: &StateStore, connector: &dyn Connector) -> Result<()> {
    let state = store.load()?;
    let (machine, key) = require_active(&state)?;
    let shell = connector.open(&machine.ip, &key);
    Configurator::new(shell.as_ref(), &machine.ip).follow_logs().await
}

/// Interactive login; always the real `ssh` binary.
pub async fn ssh(store: &StateStore) -> Result<()> {
    let state = store.load()?;
    let (machine, key) = require_active(&state)?;
    let code = SshShell::new(&machine.ip, &key.private_key_path).interactive().await?;
    match code {
        Some(0) | Some(130) => Ok(()),
        code => Err(KagError::RemoteCommand {
            command: "ssh".to_string(),
            code,
        }),
    }
}

pub async fn rcon(store: &StateStore, config: &DesiredConfig) -> Result<()> {
    let password = config.rcon_password()?;
    let state = store.load()?;
    let machine = recorded_machine(&state)?;
    let addr = format!("{}:{}", machine.ip, rcon::TCPR_PORT);
    rcon::run_session(
        &addr,
        &password,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

fn recorded_machine(state: &PersistedState) -> Result<MachineRecord> {
    state
        .machine
        .clone()
        .ok_or_else(|| KagError::config("no droplet recorded in state; run `up` first"))
}

fn recorded_key(state: &PersistedState) -> Result<SshKeyPair> {
    let record = state
        .ssh_key
        .as_ref()
        .ok_or_else(|| KagError::key("no ssh key recorded in state; run `up` first"))?;
    SshKeyPair::from_record(record)
}

fn require_active(state: &PersistedState) -> Result<(MachineRecord, SshKeyPair)> {
    let machine = recorded_machine(state)?;
    let key = recorded_key(state)?;
    Ok((machine, key))
}
