use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Issue a create request. Returns the provider's droplet id; the droplet
    /// is usually still booting and has no address yet.
    async fn create_droplet(&self, request: &inventory::DropletRequest) -> Result<String>;

    /// Current view of a droplet, or `None` when the provider does not know it
    /// (deleted out-of-band, or destroy completed).
    async fn get_droplet(&self, droplet_id: &str) -> Result<Option<inventory::Droplet>>;

    /// All droplets on the account carrying exactly `name`.
    async fn list_droplets_by_name(&self, name: &str) -> Result<Vec<inventory::Droplet>>;

    /// Returns false when the droplet was already gone.
    async fn destroy_droplet(&self, droplet_id: &str) -> Result<bool>;

    // Optional: power on a stopped droplet.
    // Default implementation returns Ok(false) (not supported).
    async fn power_on_droplet(&self, _droplet_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn list_ssh_keys(&self) -> Result<Vec<inventory::RegisteredKey>>;

    async fn register_ssh_key(&self, name: &str, public_key: &str) -> Result<inventory::RegisteredKey>;
}

pub mod inventory {
    #[derive(Clone, Debug, PartialEq)]
    pub struct DropletRequest {
        pub name: String,
        pub region: String,
        pub size_slug: String,
        pub image: String,
        pub backups: bool,
        pub ssh_key_ids: Vec<String>,
        pub tags: Vec<String>,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct Droplet {
        pub id: String,
        pub name: String,
        pub status: DropletStatus,
        pub ip_address: Option<String>,
    }

    impl Droplet {
        /// Active with a public address: ready for SSH.
        pub fn is_ready(&self) -> bool {
            self.status == DropletStatus::Active && self.ip_address.is_some()
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum DropletStatus {
        New,
        Active,
        Off,
        Archive,
        Other(String),
    }

    impl DropletStatus {
        pub fn parse(s: &str) -> Self {
            match s.trim().to_ascii_lowercase().as_str() {
                "new" => DropletStatus::New,
                "active" => DropletStatus::Active,
                "off" => DropletStatus::Off,
                "archive" => DropletStatus::Archive,
                other => DropletStatus::Other(other.to_string()),
            }
        }

        pub fn as_str(&self) -> &str {
            match self {
                DropletStatus::New => "new",
                DropletStatus::Active => "active",
                DropletStatus::Off => "off",
                DropletStatus::Archive => "archive",
                DropletStatus::Other(s) => s.as_str(),
            }
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct RegisteredKey {
        pub id: String,
        pub name: String,
        pub public_key: String,
        /// As reported by the provider (DigitalOcean uses MD5 hex).
        pub fingerprint: String,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "digitalocean")]
pub mod digitalocean;
