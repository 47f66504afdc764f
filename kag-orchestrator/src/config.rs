//! Desired-state config: loaded from YAML, validated eagerly into an immutable
//! [`DesiredConfig`]. Nothing downstream ever sees the loose document.

use kag_common::{KagError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const TOKEN_ENV: &str = "DIGITALOCEAN_TOKEN";
pub const MODS_DIR: &str = "Mods";
pub const SECURITY_DIR: &str = "Security";
pub const CACHE_DIR: &str = "Cache";

// --- Raw document (serde) ---

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    secrets: RawSecrets,
    droplet: RawDroplet,
    kag: RawKag,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawSecrets {
    digitalocean_key: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RawDroplet {
    name: String,
    region: String,
    image: String,
    size_slug: String,
    #[serde(default)]
    backups: bool,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RawKag {
    #[serde(default)]
    cache: bool,
    #[serde(default)]
    mods: Vec<String>,
    #[serde(default)]
    security: RawSecurity,
    #[serde(default)]
    autoconfig: BTreeMap<String, AutoconfigValue>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawSecurity {
    #[serde(default)]
    admins: Vec<String>,
    #[serde(default)]
    superadmins: Vec<String>,
}

// --- Validated model ---

/// A scalar game-server option, forwarded verbatim into `autoconfig.cfg`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum AutoconfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for AutoconfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // KAG reads flags as 0/1
            AutoconfigValue::Bool(b) => write!(f, "{}", if *b { 1 } else { 0 }),
            AutoconfigValue::Int(n) => write!(f, "{}", n),
            AutoconfigValue::Float(x) => write!(f, "{}", x),
            AutoconfigValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropletSpec {
    pub name: String,
    pub region: String,
    pub image: String,
    pub size_slug: String,
    pub backups: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KagSpec {
    pub cache: bool,
    pub mods: Vec<String>,
    pub admins: Vec<String>,
    pub superadmins: Vec<String>,
    pub autoconfig: BTreeMap<String, AutoconfigValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredConfig {
    pub droplet: DropletSpec,
    pub kag: KagSpec,
    api_token: String,
    /// Directory holding `Mods/`, `Security/` and `Cache/`.
    pub base_dir: PathBuf,
}

impl DesiredConfig {
    pub fn api_token(&self) -> &str {
        &self.api_token
    }

    pub fn mods_dir(&self) -> PathBuf {
        self.base_dir.join(MODS_DIR)
    }

    pub fn security_dir(&self) -> PathBuf {
        self.base_dir.join(SECURITY_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join(CACHE_DIR)
    }

    /// RCON needs TCPR enabled and a password set in autoconfig.
    /// A numeric password (`sv_rconpassword: 1234`) is accepted as the text
    /// written to autoconfig.cfg; zero, false and blank count as unset.
    pub fn rcon_password(&self) -> Result<String> {
        let tcpr_on = matches!(
            self.kag.autoconfig.get("sv_tcpr"),
            Some(AutoconfigValue::Int(1)) | Some(AutoconfigValue::Bool(true))
        );
        if !tcpr_on {
            return Err(KagError::config(
                "sv_tcpr is not set in autoconfig. Set it to 1 to use RCON.",
            ));
        }
        let set = match self.kag.autoconfig.get("sv_rconpassword") {
            Some(v @ AutoconfigValue::Text(s)) if !s.trim().is_empty() => Some(v),
            Some(v @ AutoconfigValue::Int(n)) if *n != 0 => Some(v),
            Some(v @ AutoconfigValue::Float(x)) if *x != 0.0 => Some(v),
            Some(v @ AutoconfigValue::Bool(true)) => Some(v),
            _ => None,
        };
        match set {
            Some(v) => Ok(v.to_string()),
            None => Err(KagError::config(
                "sv_rconpassword is not set in autoconfig. Set it to use RCON.",
            )),
        }
    }
}

/// Load and validate the config file. The env token (if any) wins over the file.
pub fn load(path: &Path) -> Result<DesiredConfig> {
    info!("[config] Loading config from {}", path.display());
    if !path.exists() {
        return Err(KagError::config(format!("config file {} does not exist", path.display())));
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| KagError::config(format!("read {}: {}", path.display(), e)))?;
    let base_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let env_token = std::env::var(TOKEN_ENV).ok();
    parse(&text, &base_dir, env_token.as_deref())
}

/// Parse + validate a YAML document. Split from [`load`] so tests don't touch the environment.
pub fn parse(text: &str, base_dir: &Path, env_token: Option<&str>) -> Result<DesiredConfig> {
    let raw: RawConfig =
        serde_yaml::from_str(text).map_err(|e| KagError::config(format!("parse config: {}", e)))?;
    validate(raw, base_dir, env_token)
}

fn validate(raw: RawConfig, base_dir: &Path, env_token: Option<&str>) -> Result<DesiredConfig> {
    let api_token = env_token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .or_else(|| {
            raw.secrets
                .digitalocean_key
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        })
        .ok_or_else(|| {
            KagError::config(format!(
                "config is missing secrets.digitalocean_key (or set {})",
                TOKEN_ENV
            ))
        })?;

    let droplet = DropletSpec {
        name: required("droplet.name", raw.droplet.name)?,
        region: required("droplet.region", raw.droplet.region)?,
        image: required("droplet.image", raw.droplet.image)?,
        size_slug: required("droplet.size_slug", raw.droplet.size_slug)?,
        backups: raw.droplet.backups,
    };
    if !droplet
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(KagError::config(format!(
            "droplet.name '{}' may only contain letters, digits, '.' and '-'",
            droplet.name
        )));
    }

    let mods_dir = base_dir.join(MODS_DIR);
    let mut mods = Vec::with_capacity(raw.kag.mods.len());
    for m in raw.kag.mods {
        let m = m.trim().to_string();
        if m.is_empty() || m.contains('/') || m.contains('\\') || m == ".." {
            return Err(KagError::config(format!("invalid mod name '{}'", m)));
        }
        if !mods_dir.join(&m).is_dir() {
            return Err(KagError::config(format!(
                "Mod {} is listed in config but was not found in the {}/ directory.",
                m, MODS_DIR
            )));
        }
        mods.push(m);
    }

    let admins = user_list("kag.security.admins", raw.kag.security.admins)?;
    let superadmins = user_list("kag.security.superadmins", raw.kag.security.superadmins)?;

    for key in raw.kag.autoconfig.keys() {
        if key.trim().is_empty() || key.contains('=') || key.contains('\n') {
            return Err(KagError::config(format!("invalid autoconfig key '{}'", key)));
        }
    }

    Ok(DesiredConfig {
        droplet,
        kag: KagSpec {
            cache: raw.kag.cache,
            mods,
            admins,
            superadmins,
            autoconfig: raw.kag.autoconfig,
        },
        api_token,
        base_dir: base_dir.to_path_buf(),
    })
}

fn required(field: &str, value: String) -> Result<String> {
    let v = value.trim().to_string();
    if v.is_empty() {
        return Err(KagError::config(format!("{} must not be empty", field)));
    }
    Ok(v)
}

fn user_list(field: &str, users: Vec<String>) -> Result<Vec<String>> {
    users
        .into_iter()
        .map(|u| {
            let u = u.trim().to_string();
            if u.is_empty() || u.contains(';') || u.contains('\n') {
                Err(KagError::config(format!("{} contains an invalid user name '{}'", field, u)))
            } else {
                Ok(u)
            }
        })
        .collect()
}
