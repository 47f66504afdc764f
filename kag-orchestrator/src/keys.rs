//! SSH key pair lifecycle: one local pair, registered once on the cloud account.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use kag_common::{KagError, KeyRecord, Result};
use kag_providers::CloudProvider;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use crate::logger;

pub const KEYS_DIR: &str = "ssh_keys";
pub const KEY_NAME_PREFIX: &str = "one_click_kag_server";

#[derive(Debug, Clone, PartialEq)]
pub struct SshKeyPair {
    pub name: String,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    pub public_key: String,
    pub fingerprint: String,
    /// Id of the registration on the cloud account.
    pub remote_id: String,
}

impl SshKeyPair {
    pub fn to_record(&self) -> KeyRecord {
        KeyRecord {
            name: self.name.clone(),
            remote_id: self.remote_id.clone(),
            fingerprint: self.fingerprint.clone(),
            private_key_path: self.private_key_path.to_string_lossy().into_owned(),
            public_key_path: self.public_key_path.to_string_lossy().into_owned(),
        }
    }

    /// Rebuild from state without touching the cloud (interactive commands).
    pub fn from_record(record: &KeyRecord) -> Result<Self> {
        let public_key_path = PathBuf::from(&record.public_key_path);
        let public_key = std::fs::read_to_string(&public_key_path).map_err(|e| {
            KagError::key(format!("read {}: {}", public_key_path.display(), e))
        })?;
        Ok(Self {
            name: record.name.clone(),
            private_key_path: PathBuf::from(&record.private_key_path),
            public_key_path,
            public_key: public_key.trim().to_string(),
            fingerprint: record.fingerprint.clone(),
            remote_id: record.remote_id.clone(),
        })
    }
}

struct LocalKey {
    name: String,
    private_key_path: PathBuf,
    public_key_path: PathBuf,
    public_key: String,
}

pub struct KeyManager<'a> {
    provider: &'a dyn CloudProvider,
    keys_dir: PathBuf,
}

impl<'a> KeyManager<'a> {
    pub fn new(provider: &'a dyn CloudProvider, keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            keys_dir: keys_dir.into(),
        }
    }

    /// Reuse the local pair if there is one (generate otherwise), then reuse
    /// the matching remote registration if there is one (register otherwise).
    /// Calling this repeatedly never registers the same key twice.
    pub async fn ensure_key_pair(&self, recorded: Option<&KeyRecord>) -> Result<SshKeyPair> {
        let local = match self.find_local(recorded)? {
            Some(k) => {
                info!("[keys] Reusing local key pair {}", k.private_key_path.display());
                k
            }
            None => self.generate().await?,
        };
        restrict_permissions(&local.private_key_path)?;

        let fingerprint = fingerprint(&local.public_key)?;
        let remote_id = self.ensure_registered(&local, &fingerprint, recorded).await?;

        Ok(SshKeyPair {
            name: local.name,
            private_key_path: local.private_key_path,
            public_key_path: local.public_key_path,
            public_key: local.public_key,
            fingerprint,
            remote_id,
        })
    }

    fn find_local(&self, recorded: Option<&KeyRecord>) -> Result<Option<LocalKey>> {
        if let Some(rec) = recorded {
            let private = PathBuf::from(&rec.private_key_path);
            let public = PathBuf::from(&rec.public_key_path);
            if private.is_file() && public.is_file() {
                return Ok(Some(read_local(rec.name.clone(), private, public)?));
            }
            warn!(
                "[keys] Key pair {} recorded in state is missing locally, looking for another",
                rec.name
            );
        }

        if !self.keys_dir.is_dir() {
            return Ok(None);
        }
        let mut names: Vec<String> = std::fs::read_dir(&self.keys_dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .filter(|n| n.starts_with(KEY_NAME_PREFIX) && !n.ends_with(".pub"))
            .filter(|n| self.keys_dir.join(format!("{}.pub", n)).is_file())
            .collect();
        names.sort();

        match names.into_iter().next() {
            Some(name) => {
                let private = self.keys_dir.join(&name);
                let public = self.keys_dir.join(format!("{}.pub", name));
                Ok(Some(read_local(name, private, public)?))
            }
            None => Ok(None),
        }
    }

    async fn generate(&self) -> Result<LocalKey> {
        std::fs::create_dir_all(&self.keys_dir)?;
        let name = format!("{}_{}", KEY_NAME_PREFIX, unique_suffix());
        let private = self.keys_dir.join(&name);
        let public = self.keys_dir.join(format!("{}.pub", name));
        info!("[keys] Creating ssh keypair in {}", private.display());

        let output = Command::new("ssh-keygen")
            .arg("-q")
            .args(["-t", "ed25519"])
            .args(["-N", ""])
            .args(["-C", &name])
            .arg("-f")
            .arg(&private)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| KagError::key(format!("failed to run ssh-keygen (is OpenSSH installed?): {}", e)))?;
        if !output.status.success() {
            return Err(KagError::key(format!(
                "ssh-keygen failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        read_local(name, private, public)
    }

    async fn ensure_registered(
        &self,
        local: &LocalKey,
        fingerprint_local: &str,
        recorded: Option<&KeyRecord>,
    ) -> Result<String> {
        let remote = self.provider.list_ssh_keys().await?;
        let mut matches: Vec<_> = remote
            .iter()
            .filter(|k| fingerprint(&k.public_key).ok().as_deref() == Some(fingerprint_local))
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));

        if let Some(rec) = recorded {
            if let Some(k) = matches.iter().find(|k| k.id == rec.remote_id) {
                info!("[keys] Key {} already registered (id={})", local.name, k.id);
                return Ok(k.id.clone());
            }
        }
        if let Some(k) = matches.first() {
            info!("[keys] Found existing registration for {} (id={})", local.name, k.id);
            return Ok(k.id.clone());
        }

        let key = logger::logged(
            "SSH_KEY_REGISTER",
            &local.name,
            Some(serde_json::json!({ "fingerprint": fingerprint_local })),
            self.provider.register_ssh_key(&local.name, &local.public_key),
        )
        .await?;
        info!("[keys] Key {} uploaded successfully (id={})", local.name, key.id);
        Ok(key.id)
    }
}

fn read_local(name: String, private_key_path: PathBuf, public_key_path: PathBuf) -> Result<LocalKey> {
    let public_key = std::fs::read_to_string(&public_key_path)
        .map_err(|e| KagError::key(format!("read {}: {}", public_key_path.display(), e)))?;
    Ok(LocalKey {
        name,
        private_key_path,
        public_key_path,
        public_key: public_key.trim().to_string(),
    })
}

/// Random 8 hex chars, enough to keep key names apart on one account.
fn unique_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// OpenSSH-style `SHA256:<base64>` fingerprint of an authorized_keys line.
pub fn fingerprint(public_key: &str) -> Result<String> {
    let mut parts = public_key.split_whitespace();
    let (Some(_kind), Some(blob)) = (parts.next(), parts.next()) else {
        return Err(KagError::key("public key is not in 'type base64 [comment]' form"));
    };
    let raw = STANDARD
        .decode(blob)
        .map_err(|e| KagError::key(format!("public key is not valid base64: {}", e)))?;
    let digest = Sha256::digest(&raw);
    Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(digest)))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pubkey(material: &[u8], comment: &str) -> String {
        format!("ssh-ed25519 {} {}", STANDARD.encode(material), comment)
    }

    #[test]
    fn fingerprint_ignores_comment() {
        let a = fingerprint(&pubkey(b"key-material-1", "alice@host")).unwrap();
        let b = fingerprint(&pubkey(b"key-material-1", "other")).unwrap();
        let c = fingerprint(&pubkey(b"key-material-2", "alice@host")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("SHA256:"));
        assert!(!a.ends_with('='));
    }

    #[test]
    fn fingerprint_rejects_garbage() {
        assert!(fingerprint("").is_err());
        assert!(fingerprint("ssh-ed25519").is_err());
        assert!(fingerprint("ssh-ed25519 !!!notbase64!!!").is_err());
    }

    #[test]
    fn suffix_is_eight_hex_chars() {
        let s = unique_suffix();
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
