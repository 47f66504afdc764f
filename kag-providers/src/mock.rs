//! In-memory provider that faithfully tracks the droplets and keys it was asked
//! to create. Used by tests and by `PROVIDER=mock` dry runs.

use crate::{inventory, CloudProvider};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

pub const FIRST_DROPLET_ID: u64 = 123;

#[derive(Debug, Clone)]
struct MockDroplet {
    droplet: inventory::Droplet,
    /// `get_droplet` calls left before a booting droplet turns active.
    boot_polls_left: u32,
    /// `get_droplet` calls left before a destroyed droplet disappears.
    destroy_polls_left: Option<u32>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    droplets: BTreeMap<String, MockDroplet>,
    keys: Vec<inventory::RegisteredKey>,
    create_requests: Vec<inventory::DropletRequest>,
    destroy_requests: Vec<String>,
    power_on_requests: Vec<String>,
    get_calls: u32,
}

pub struct MockProvider {
    inner: Mutex<MockState>,
    boot_polls: u32,
    destroy_polls: u32,
    never_ready: bool,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockState {
                next_id: FIRST_DROPLET_ID,
                ..MockState::default()
            }),
            boot_polls: 1,
            destroy_polls: 0,
            never_ready: false,
        }
    }

    /// Number of status polls a new droplet spends in `new` before going active.
    pub fn with_boot_polls(mut self, polls: u32) -> Self {
        self.boot_polls = polls;
        self
    }

    /// Number of status polls a destroyed droplet stays visible.
    pub fn with_destroy_polls(mut self, polls: u32) -> Self {
        self.destroy_polls = polls;
        self
    }

    /// Created droplets stay in `new` forever.
    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only means another test thread panicked.
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Address handed to the droplet with numeric id `id`: 123 -> 1.2.3.4.
    fn ip_for(id: u64) -> String {
        let n = id.saturating_sub(FIRST_DROPLET_ID) + 4;
        format!("1.2.{}.{}", 3 + n / 256, n % 256)
    }

    fn alloc_id(state: &mut MockState) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Simulate a droplet created outside of this tool (e.g. in the console).
    pub fn seed_droplet(&self, name: &str, status: inventory::DropletStatus) -> String {
        let mut state = self.lock();
        let id = Self::alloc_id(&mut state);
        let ip_address = match status {
            inventory::DropletStatus::Active | inventory::DropletStatus::Off => Some(Self::ip_for(id)),
            _ => None,
        };
        let droplet = inventory::Droplet {
            id: id.to_string(),
            name: name.to_string(),
            status,
            ip_address,
        };
        state.droplets.insert(
            droplet.id.clone(),
            MockDroplet {
                droplet,
                boot_polls_left: 0,
                destroy_polls_left: None,
            },
        );
        id.to_string()
    }

    /// Simulate an out-of-band status change, e.g. a shutdown from the console.
    pub fn set_status(&self, droplet_id: &str, status: inventory::DropletStatus) -> bool {
        match self.lock().droplets.get_mut(droplet_id) {
            Some(entry) => {
                entry.droplet.status = status;
                true
            }
            None => false,
        }
    }

    /// Simulate an out-of-band deletion.
    pub fn vanish(&self, droplet_id: &str) -> bool {
        self.lock().droplets.remove(droplet_id).is_some()
    }

    /// Let a booting droplet go active on its next poll, even one created by a
    /// `never_ready` provider.
    pub fn boot_now(&self, droplet_id: &str) -> bool {
        match self.lock().droplets.get_mut(droplet_id) {
            Some(entry) => {
                entry.boot_polls_left = 0;
                true
            }
            None => false,
        }
    }

    /// Simulate a key registered by hand on the account.
    pub fn seed_key(&self, name: &str, public_key: &str) -> String {
        let mut state = self.lock();
        let id = format!("k{}", state.keys.len() + 1);
        state.keys.push(inventory::RegisteredKey {
            id: id.clone(),
            name: name.to_string(),
            public_key: public_key.trim().to_string(),
            fingerprint: String::new(),
        });
        id
    }

    pub fn create_requests(&self) -> Vec<inventory::DropletRequest> {
        self.lock().create_requests.clone()
    }

    pub fn destroy_requests(&self) -> Vec<String> {
        self.lock().destroy_requests.clone()
    }

    pub fn power_on_requests(&self) -> Vec<String> {
        self.lock().power_on_requests.clone()
    }

    pub fn registered_keys(&self) -> Vec<inventory::RegisteredKey> {
        self.lock().keys.clone()
    }

    pub fn droplet_count(&self) -> usize {
        self.lock().droplets.len()
    }

    pub fn get_calls(&self) -> u32 {
        self.lock().get_calls
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    async fn create_droplet(&self, request: &inventory::DropletRequest) -> Result<String> {
        let mut state = self.lock();
        state.create_requests.push(request.clone());
        let id = Self::alloc_id(&mut state);
        let droplet = inventory::Droplet {
            id: id.to_string(),
            name: request.name.clone(),
            status: inventory::DropletStatus::New,
            ip_address: None,
        };
        state.droplets.insert(
            droplet.id.clone(),
            MockDroplet {
                droplet,
                boot_polls_left: if self.never_ready { u32::MAX } else { self.boot_polls },
                destroy_polls_left: None,
            },
        );
        Ok(id.to_string())
    }

    async fn get_droplet(&self, droplet_id: &str) -> Result<Option<inventory::Droplet>> {
        let mut state = self.lock();
        state.get_calls += 1;

        let gone = match state.droplets.get_mut(droplet_id) {
            None => return Ok(None),
            Some(entry) => match entry.destroy_polls_left {
                Some(0) => true,
                Some(ref mut n) => {
                    *n -= 1;
                    false
                }
                None => false,
            },
        };
        if gone {
            state.droplets.remove(droplet_id);
            return Ok(None);
        }

        let Some(entry) = state.droplets.get_mut(droplet_id) else {
            return Ok(None);
        };
        if entry.droplet.status == inventory::DropletStatus::New {
            if entry.boot_polls_left == 0 {
                entry.droplet.status = inventory::DropletStatus::Active;
            } else if entry.boot_polls_left != u32::MAX {
                entry.boot_polls_left -= 1;
            }
        }
        if entry.droplet.status == inventory::DropletStatus::Active && entry.droplet.ip_address.is_none() {
            let numeric: u64 = entry.droplet.id.parse().unwrap_or(FIRST_DROPLET_ID);
            entry.droplet.ip_address = Some(Self::ip_for(numeric));
        }
        Ok(Some(entry.droplet.clone()))
    }

    async fn list_droplets_by_name(&self, name: &str) -> Result<Vec<inventory::Droplet>> {
        Ok(self
            .lock()
            .droplets
            .values()
            .filter(|d| d.droplet.name == name && d.destroy_polls_left.is_none())
            .map(|d| d.droplet.clone())
            .collect())
    }

    async fn destroy_droplet(&self, droplet_id: &str) -> Result<bool> {
        let mut state = self.lock();
        state.destroy_requests.push(droplet_id.to_string());
        let destroy_polls = self.destroy_polls;
        match state.droplets.get_mut(droplet_id) {
            Some(entry) => {
                entry.destroy_polls_left = Some(destroy_polls);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn power_on_droplet(&self, droplet_id: &str) -> Result<bool> {
        let mut state = self.lock();
        state.power_on_requests.push(droplet_id.to_string());
        match state.droplets.get_mut(droplet_id) {
            Some(entry) => {
                entry.droplet.status = inventory::DropletStatus::Active;
                Ok(true)
            }
            None => Err(anyhow!("MockProvider: droplet {} not found", droplet_id)),
        }
    }

    async fn list_ssh_keys(&self) -> Result<Vec<inventory::RegisteredKey>> {
        Ok(self.lock().keys.clone())
    }

    async fn register_ssh_key(&self, name: &str, public_key: &str) -> Result<inventory::RegisteredKey> {
        let mut state = self.lock();
        let key = inventory::RegisteredKey {
            id: format!("k{}", state.keys.len() + 1),
            name: name.to_string(),
            public_key: public_key.trim().to_string(),
            fingerprint: String::new(),
        };
        state.keys.push(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{DropletRequest, DropletStatus};

    fn request() -> DropletRequest {
        DropletRequest {
            name: "kag-server".to_string(),
            region: "nyc1".to_string(),
            size_slug: "s-1vcpu-1gb".to_string(),
            image: "ubuntu-22-04-x64".to_string(),
            backups: false,
            ssh_key_ids: vec!["k1".to_string()],
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn droplet_boots_after_polls() {
        let p = MockProvider::new().with_boot_polls(2);
        let id = p.create_droplet(&request()).await.unwrap();
        assert_eq!(id, "123");

        let first = p.get_droplet(&id).await.unwrap().unwrap();
        assert_eq!(first.status, DropletStatus::New);
        let second = p.get_droplet(&id).await.unwrap().unwrap();
        assert_eq!(second.status, DropletStatus::New);
        let third = p.get_droplet(&id).await.unwrap().unwrap();
        assert_eq!(third.status, DropletStatus::Active);
        assert_eq!(third.ip_address.as_deref(), Some("1.2.3.4"));
    }

    #[tokio::test]
    async fn destroy_is_recorded_and_removes() {
        let p = MockProvider::new().with_boot_polls(0).with_destroy_polls(1);
        let id = p.create_droplet(&request()).await.unwrap();
        assert!(p.destroy_droplet(&id).await.unwrap());
        assert!(p.get_droplet(&id).await.unwrap().is_some());
        assert!(p.get_droplet(&id).await.unwrap().is_none());
        assert!(!p.destroy_droplet(&id).await.unwrap());
        assert_eq!(p.destroy_requests(), vec![id.clone(), id]);
    }

    #[tokio::test]
    async fn lists_by_exact_name() {
        let p = MockProvider::new();
        p.seed_droplet("kag-server", DropletStatus::Active);
        p.seed_droplet("other", DropletStatus::Active);
        let found = p.list_droplets_by_name("kag-server").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ip_address.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn ip_sequence() {
        assert_eq!(MockProvider::ip_for(123), "1.2.3.4");
        assert_eq!(MockProvider::ip_for(124), "1.2.3.5");
    }

    #[test]
    fn power_on_unknown_droplet_fails() {
        let p = MockProvider::new();
        let id = p.seed_droplet("kag-server", DropletStatus::Off);
        assert!(tokio_test::block_on(p.power_on_droplet(&id)).unwrap());
        assert!(tokio_test::block_on(p.power_on_droplet("999")).is_err());
        assert_eq!(p.power_on_requests(), vec![id, "999".to_string()]);
    }
}
