//! Puts the game server onto a reachable droplet.
//!
//! Everything here is re-applied in full on every run: files are overwritten,
//! never diffed. Nothing in this module touches `PersistedState`.

use kag_common::{KagError, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::config::{DesiredConfig, CACHE_DIR, MODS_DIR, SECURITY_DIR};
use crate::logger;
use crate::remote::RemoteShell;
use crate::retry::{self, Attempt, PollError, RetryPolicy};

const SETUP_SCRIPT: &str = include_str!("../assets/droplet_setup.sh");
const COMPOSE_FILE: &str = include_str!("../assets/docker-compose.yaml");
const DOCKERFILE: &str = include_str!("../assets/Dockerfile.kag");

/// Embedded `Security/` templates; `$USERS` is substituted where present.
const SECURITY_TEMPLATES: [(&str, &str); 4] = [
    ("seclevs.cfg", include_str!("../assets/Security/seclevs.cfg")),
    ("normal.cfg", include_str!("../assets/Security/normal.cfg")),
    ("admin.cfg", include_str!("../assets/Security/admin.cfg")),
    ("superadmin.cfg", include_str!("../assets/Security/superadmin.cfg")),
];

const USERS_PLACEHOLDER: &str = "$USERS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureMode {
    /// First configuration after `up`; seeds the remote cache.
    Fresh,
    /// `restart-kag`: the remote cache is newer than ours, leave it alone.
    Restart,
}

pub struct Configurator<'a> {
    shell: &'a dyn RemoteShell,
    ip: String,
}

impl<'a> Configurator<'a> {
    pub fn new(shell: &'a dyn RemoteShell, ip: &str) -> Self {
        Self {
            shell,
            ip: ip.to_string(),
        }
    }

    /// Retry the SSH probe until it succeeds or the policy gives up.
    pub async fn wait_until_reachable(&self, policy: &RetryPolicy) -> Result<()> {
        info!("[configurator] Connecting to {} over ssh...", self.ip);
        let polled = retry::poll(policy, "ssh", || async move {
            match self.shell.probe().await {
                Ok(()) => Ok::<_, KagError>(Attempt::Ready(())),
                Err(reason) => Ok(Attempt::Pending(reason)),
            }
        })
        .await;

        match polled {
            Ok(()) => {
                info!("[configurator] ssh to {} is up", self.ip);
                Ok(())
            }
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::TimedOut { attempts, last, .. }) => Err(KagError::RemoteConnect {
                ip: self.ip.clone(),
                attempts,
                reason: last,
            }),
        }
    }

    /// One-time host bootstrap: docker, firewall, image build.
    pub async fn setup_droplet(&self) -> Result<()> {
        info!("[configurator] Setting up droplet {}", self.ip);
        self.shell.put_file(SETUP_SCRIPT.as_bytes(), "droplet_setup.sh").await?;
        self.shell.put_file(COMPOSE_FILE.as_bytes(), "docker-compose.yaml").await?;
        self.shell.put_file(DOCKERFILE.as_bytes(), "Dockerfile.kag").await?;

        let command = "bash droplet_setup.sh";
        let code = logger::logged(
            "DROPLET_SETUP",
            &self.ip,
            None,
            self.shell.exec_streaming(command),
        )
        .await?;
        check_code(command, code)
    }

    pub async fn configure(&self, config: &DesiredConfig, mode: ConfigureMode) -> Result<()> {
        info!("[configurator] Configuring KAG on {} ({:?})", self.ip, mode);
        self.shell.put_file(COMPOSE_FILE.as_bytes(), "docker-compose.yaml").await?;

        self.exec_checked(&format!("mkdir -p {}", MODS_DIR)).await?;
        let mods_dir = config.mods_dir();
        if mods_dir.is_dir() {
            self.shell.put_dir(&mods_dir, MODS_DIR).await?;
        }

        if config.kag.cache && mode == ConfigureMode::Fresh {
            let cache_dir = config.cache_dir();
            if cache_dir.is_dir() {
                info!("[configurator] Uploading {}/", CACHE_DIR);
                self.shell.put_dir(&cache_dir, CACHE_DIR).await?;
            } else {
                warn!("[configurator] Cache enabled but {} does not exist, skipping upload", cache_dir.display());
            }
        }

        self.shell
            .put_file(render_autoconfig(config).as_bytes(), "autoconfig.cfg")
            .await?;
        self.shell.put_file(render_mods(config).as_bytes(), "mods.cfg").await?;

        self.exec_checked(&format!("mkdir -p {}", SECURITY_DIR)).await?;
        for (name, contents) in render_security(config, &config.security_dir())? {
            self.shell
                .put_file(contents.as_bytes(), &format!("{}/{}", SECURITY_DIR, name))
                .await?;
        }

        // `down` failing just means nothing was running yet.
        let down = self.shell.exec_streaming("docker-compose down").await?;
        if down != Some(0) {
            warn!("[configurator] docker-compose down exited with {:?}", down);
        }

        let up = "docker-compose up -d";
        let code = logger::logged("KAG_START", &self.ip, None, self.shell.exec_streaming(up)).await?;
        check_code(up, code)?;
        info!("[configurator] KAG is running on {}", self.ip);
        Ok(())
    }

    /// Pull the remote `Cache/` into the local one.
    pub async fn save_cache(&self, config: &DesiredConfig) -> Result<()> {
        info!("[configurator] Saving {}/ from {}", CACHE_DIR, self.ip);
        let local = config.cache_dir();
        logger::logged(
            "CACHE_SAVE",
            &self.ip,
            None,
            self.shell.get_dir(CACHE_DIR, &local),
        )
        .await
    }

    pub async fn follow_logs(&self) -> Result<()> {
        let command = "docker-compose logs -f kag";
        let code = self.shell.exec_streaming(command).await?;
        check_code(command, code)
    }

    async fn exec_checked(&self, command: &str) -> Result<()> {
        let out = self.shell.exec(command).await?;
        if !out.success() {
            warn!("[configurator] `{}` failed: {}", command, out.stderr.trim());
            return Err(KagError::RemoteCommand {
                command: command.to_string(),
                code: out.code,
            });
        }
        Ok(())
    }
}

fn check_code(command: &str, code: Option<i32>) -> Result<()> {
    if code == Some(0) {
        Ok(())
    } else {
        Err(KagError::RemoteCommand {
            command: command.to_string(),
            code,
        })
    }
}

/// `key = value` per autoconfig entry, in key order.
pub fn render_autoconfig(config: &DesiredConfig) -> String {
    config
        .kag
        .autoconfig
        .iter()
        .map(|(k, v)| format!("{} = {}\n", k, v))
        .collect()
}

pub fn render_mods(config: &DesiredConfig) -> String {
    config.kag.mods.iter().map(|m| format!("{}\n", m)).collect()
}

/// Render the `Security/` files. A template in `local_dir` replaces the embedded one.
pub fn render_security(config: &DesiredConfig, local_dir: &Path) -> Result<Vec<(String, String)>> {
    let mut files = Vec::with_capacity(SECURITY_TEMPLATES.len());
    for (name, embedded) in SECURITY_TEMPLATES {
        let override_path = local_dir.join(name);
        let template = if override_path.is_file() {
            std::fs::read_to_string(&override_path)?
        } else {
            embedded.to_string()
        };
        let users = match name {
            "admin.cfg" => Some(&config.kag.admins),
            "superadmin.cfg" => Some(&config.kag.superadmins),
            _ => None,
        };
        let contents = match users {
            Some(users) => template.replace(USERS_PLACEHOLDER, &users.join("; ")),
            None => template,
        };
        files.push((name.to_string(), contents));
    }
    Ok(files)
}
