//! Remote execution over the local OpenSSH client.
//!
//! The configurator only talks to [`RemoteShell`]; `SshShell` is the real
//! implementation (spawns `ssh` / `tar`), tests swap in a recording fake.

use async_trait::async_trait;
use kag_common::{KagError, Result};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::keys::SshKeyPair;

pub const SSH_USER: &str = "root";

const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Cheap "can we log in at all" check. `Err` carries the reason.
    async fn probe(&self) -> std::result::Result<(), String>;

    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Run `command`, echoing its combined output line by line. Returns the exit code.
    async fn exec_streaming(&self, command: &str) -> Result<Option<i32>>;

    /// Write `contents` to `remote_path`, replacing any existing file.
    async fn put_file(&self, contents: &[u8], remote_path: &str) -> Result<()>;

    /// Copy the contents of `local_dir` into `remote_dir` (created if needed).
    async fn put_dir(&self, local_dir: &Path, remote_dir: &str) -> Result<()>;

    /// Copy the contents of `remote_dir` into `local_dir` (created if needed).
    async fn get_dir(&self, remote_dir: &str, local_dir: &Path) -> Result<()>;
}

/// Opens shells to a given address. Lets commands stay agnostic of the transport.
pub trait Connector: Send + Sync {
    fn open(&self, ip: &str, key: &SshKeyPair) -> Box<dyn RemoteShell>;
}

pub struct SshConnector;

impl Connector for SshConnector {
    fn open(&self, ip: &str, key: &SshKeyPair) -> Box<dyn RemoteShell> {
        Box::new(SshShell::new(ip, &key.private_key_path))
    }
}

pub struct SshShell {
    target: String,
    key_path: PathBuf,
}

impl SshShell {
    pub fn new(ip: &str, key_path: &Path) -> Self {
        // Strip CIDR suffix if present (e.g. "1.2.3.4/32" -> "1.2.3.4")
        let clean_ip = ip.split('/').next().unwrap_or(ip);
        Self {
            target: format!("{}@{}", SSH_USER, clean_ip),
            key_path: key_path.to_path_buf(),
        }
    }

    fn ssh(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.key_path)
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "ConnectTimeout=10"])
            .args(["-o", "LogLevel=ERROR"])
            .kill_on_drop(true);
        cmd
    }

    /// Hand the terminal over to an interactive `ssh` session.
    pub async fn interactive(&self) -> Result<Option<i32>> {
        let status = self
            .ssh()
            .arg("-t")
            .arg(&self.target)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        Ok(status.code())
    }

    async fn ssh_with_input(&self, command: &str, input: &[u8]) -> Result<Output> {
        let mut cmd = self.ssh();
        cmd.arg("-o").arg("BatchMode=yes").arg(&self.target).arg(command);
        run_with_input(cmd, input).await
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn probe(&self) -> std::result::Result<(), String> {
        let mut cmd = self.ssh();
        cmd.args(["-o", "BatchMode=yes"])
            .arg(&self.target)
            .arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(out)) if out.status.success() => Ok(()),
            Ok(Ok(out)) => Err(format!(
                "ssh exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )),
            Ok(Err(e)) => Err(format!("failed to spawn ssh: {}", e)),
            Err(_) => Err(format!("ssh probe timed out after {:?}", PROBE_TIMEOUT)),
        }
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        debug!("[remote] {} $ {}", self.target, command);
        let out = self
            .ssh()
            .args(["-o", "BatchMode=yes"])
            .arg(&self.target)
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(ExecOutput {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    async fn exec_streaming(&self, command: &str) -> Result<Option<i32>> {
        debug!("[remote] {} $ {} (streaming)", self.target, command);
        let mut child = self
            .ssh()
            .args(["-o", "BatchMode=yes"])
            .arg(&self.target)
            .arg(format!("{} 2>&1", command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                println!("{}", line.trim_end());
            }
        }
        let status = child.wait().await?;
        Ok(status.code())
    }

    async fn put_file(&self, contents: &[u8], remote_path: &str) -> Result<()> {
        let command = format!("cat > {}", sh_escape_single(remote_path));
        let out = self.ssh_with_input(&command, contents).await?;
        check_output(&command, &out)
    }

    async fn put_dir(&self, local_dir: &Path, remote_dir: &str) -> Result<()> {
        let tar = Command::new("tar")
            .arg("-C")
            .arg(local_dir)
            .args(["-cf", "-", "."])
            .stdin(Stdio::null())
            .output()
            .await?;
        check_output(&format!("tar -C {} -cf - .", local_dir.display()), &tar)?;

        let dir = sh_escape_single(remote_dir);
        let command = format!("mkdir -p {dir} && tar -C {dir} -xf -", dir = dir);
        let out = self.ssh_with_input(&command, &tar.stdout).await?;
        check_output(&command, &out)
    }

    async fn get_dir(&self, remote_dir: &str, local_dir: &Path) -> Result<()> {
        let command = format!("tar -C {} -cf - .", sh_escape_single(remote_dir));
        let out = self.ssh_with_input(&command, &[]).await?;
        check_output(&command, &out)?;

        std::fs::create_dir_all(local_dir)?;
        let mut untar = Command::new("tar");
        untar.arg("-C").arg(local_dir).args(["-xf", "-"]);
        let extracted = run_with_input(untar, &out.stdout).await?;
        check_output(&format!("tar -C {} -xf -", local_dir.display()), &extracted)
    }
}

async fn run_with_input(mut cmd: Command, input: &[u8]) -> Result<Output> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdin = child.stdin.take();
    let write = async move {
        if let Some(mut stdin) = stdin {
            if let Err(e) = stdin.write_all(input).await {
                warn!("[remote] failed to write to child stdin: {}", e);
            }
            // stdin dropped here so the child sees EOF
        }
    };
    let (_, out) = tokio::join!(write, child.wait_with_output());
    Ok(out?)
}

fn check_output(command: &str, out: &Output) -> Result<()> {
    if out.status.success() {
        return Ok(());
    }
    warn!(
        "[remote] `{}` failed: {}",
        command,
        String::from_utf8_lossy(&out.stderr).trim()
    );
    Err(KagError::RemoteCommand {
        command: command.to_string(),
        code: out.status.code(),
    })
}

pub fn sh_escape_single(s: &str) -> String {
    // Safe single-quote escape for bash: wrap with '...' and escape internal quotes.
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}
