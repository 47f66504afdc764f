use crate::{inventory, CloudProvider};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_API_BASE: &str = "https://api.digitalocean.com/v2";

const PAGE_SIZE: &str = "200";

pub struct DigitalOceanProvider {
    client: Client,
    api_base: String,
    token: String,
}

impl DigitalOceanProvider {
    pub fn new(token: String) -> Result<Self> {
        Self::with_api_base(token, DEFAULT_API_BASE.to_string())
    }

    pub fn with_api_base(token: String, api_base: String) -> Result<Self> {
        // Default reqwest client has no overall timeout. If the API stalls, a poll loop can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("building HTTP client")?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(anyhow!("DigitalOcean API token is empty"));
        }
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn get_json(&self, url: &str) -> Result<(StatusCode, Value)> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok((status, Value::Null));
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!("[DigitalOcean API] GET {} failed: status={}, response={}", url, status.as_u16(), text);
            return Err(anyhow!(
                "DigitalOcean GET {} failed: status={} body={}",
                url,
                status.as_u16(),
                text
            ));
        }
        Ok((status, resp.json().await?))
    }

    /// Follow `links.pages.next` until exhausted, collecting `items_key` arrays.
    async fn get_paginated(&self, first_url: String, items_key: &str) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        let mut next = Some(first_url);
        while let Some(url) = next {
            let (_, body) = self.get_json(&url).await?;
            if let Some(items) = body[items_key].as_array() {
                out.extend(items.iter().cloned());
            }
            next = body["links"]["pages"]["next"].as_str().map(|s| s.to_string());
        }
        Ok(out)
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    async fn create_droplet(&self, request: &inventory::DropletRequest) -> Result<String> {
        let url = self.url("/droplets");
        let ssh_keys: Vec<Value> = request
            .ssh_key_ids
            .iter()
            .map(|id| match id.parse::<u64>() {
                Ok(n) => json!(n),
                Err(_) => json!(id),
            })
            .collect();
        let body = json!({
            "name": request.name,
            "region": request.region,
            "size": request.size_slug,
            "image": request.image,
            "backups": request.backups,
            "ssh_keys": ssh_keys,
            "tags": request.tags,
        });

        info!(
            "[DigitalOcean API] POST {} - Creating droplet: name={}, region={}, size={}, image={}",
            url, request.name, request.region, request.size_slug, request.image
        );
        debug!(
            "[DigitalOcean API] Request payload: {}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!("[DigitalOcean API] POST {} failed: status={}, response={}", url, status.as_u16(), text);
            return Err(anyhow!(
                "DigitalOcean create_droplet failed: status={} body={}",
                status.as_u16(),
                text
            ));
        }

        let json_resp: Value = resp.json().await?;
        let droplet = parse_droplet(&json_resp["droplet"])?;
        info!(
            "[DigitalOcean API] Droplet created: id={}, status={}",
            droplet.id,
            droplet.status.as_str()
        );
        Ok(droplet.id)
    }

    async fn get_droplet(&self, droplet_id: &str) -> Result<Option<inventory::Droplet>> {
        let url = self.url(&format!("/droplets/{}", droplet_id));
        debug!("[DigitalOcean API] GET {}", url);
        let (status, body) = self.get_json(&url).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse_droplet(&body["droplet"]).map(Some)
    }

    async fn list_droplets_by_name(&self, name: &str) -> Result<Vec<inventory::Droplet>> {
        let url = format!("{}?per_page={}", self.url("/droplets"), PAGE_SIZE);
        let raw = self.get_paginated(url, "droplets").await?;
        let mut out = Vec::new();
        for item in &raw {
            let d = parse_droplet(item)?;
            if d.name == name {
                out.push(d);
            }
        }
        Ok(out)
    }

    async fn destroy_droplet(&self, droplet_id: &str) -> Result<bool> {
        let url = self.url(&format!("/droplets/{}", droplet_id));
        info!("[DigitalOcean API] DELETE {} - Destroying droplet {}", url, droplet_id);

        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            info!("[DigitalOcean API] Droplet {} already gone", droplet_id);
            return Ok(false);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!("[DigitalOcean API] DELETE {} failed: status={}, response={}", url, status.as_u16(), text);
            return Err(anyhow!(
                "DigitalOcean destroy_droplet failed: status={} body={}",
                status.as_u16(),
                text
            ));
        }
        Ok(true)
    }

    async fn power_on_droplet(&self, droplet_id: &str) -> Result<bool> {
        let url = self.url(&format!("/droplets/{}/actions", droplet_id));
        info!("[DigitalOcean API] POST {} - power_on", url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "type": "power_on" }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "DigitalOcean power_on failed: status={} body={}",
                status.as_u16(),
                text
            ));
        }
        Ok(true)
    }

    async fn list_ssh_keys(&self) -> Result<Vec<inventory::RegisteredKey>> {
        let url = format!("{}?per_page={}", self.url("/account/keys"), PAGE_SIZE);
        let raw = self.get_paginated(url, "ssh_keys").await?;
        raw.iter().map(parse_key).collect()
    }

    async fn register_ssh_key(&self, name: &str, public_key: &str) -> Result<inventory::RegisteredKey> {
        let url = self.url("/account/keys");
        info!("[DigitalOcean API] POST {} - Registering ssh key {}", url, name);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "name": name, "public_key": public_key.trim() }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!("[DigitalOcean API] POST {} failed: status={}, response={}", url, status.as_u16(), text);
            return Err(anyhow!(
                "DigitalOcean register_ssh_key failed: status={} body={}",
                status.as_u16(),
                text
            ));
        }
        let json_resp: Value = resp.json().await?;
        parse_key(&json_resp["ssh_key"])
    }
}

/// Ids come back as JSON numbers; we carry them as strings.
fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

pub fn parse_droplet(v: &Value) -> Result<inventory::Droplet> {
    let id = id_string(&v["id"]).ok_or_else(|| anyhow!("droplet without id: {}", v))?;
    let name = v["name"].as_str().unwrap_or_default().to_string();
    let status = inventory::DropletStatus::parse(v["status"].as_str().unwrap_or("unknown"));
    let ip_address = v["networks"]["v4"].as_array().and_then(|nets| {
        nets.iter()
            .find(|n| n["type"].as_str() == Some("public"))
            .and_then(|n| n["ip_address"].as_str())
            .map(|s| s.to_string())
    });
    Ok(inventory::Droplet {
        id,
        name,
        status,
        ip_address,
    })
}

pub fn parse_key(v: &Value) -> Result<inventory::RegisteredKey> {
    let id = id_string(&v["id"]).ok_or_else(|| anyhow!("ssh key without id: {}", v))?;
    Ok(inventory::RegisteredKey {
        id,
        name: v["name"].as_str().unwrap_or_default().to_string(),
        public_key: v["public_key"].as_str().unwrap_or_default().to_string(),
        fingerprint: v["fingerprint"].as_str().unwrap_or_default().to_string(),
    })
}
