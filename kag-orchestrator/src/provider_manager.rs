use kag_common::{KagError, Result};
use kag_providers::CloudProvider;
use std::env;

use crate::config::DesiredConfig;

pub struct ProviderManager;

impl ProviderManager {
    pub fn current_provider_name() -> String {
        env::var("PROVIDER").unwrap_or_else(|_| "digitalocean".to_string())
    }

    pub fn get_provider(provider_name: &str, config: &DesiredConfig) -> Result<Box<dyn CloudProvider>> {
        match provider_name.trim().to_lowercase().as_str() {
            #[cfg(feature = "provider-digitalocean")]
            "digitalocean" => {
                let provider =
                    kag_providers::digitalocean::DigitalOceanProvider::new(config.api_token().to_string())?;
                Ok(Box::new(provider))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => {
                let _ = config; // the mock needs no credentials
                Ok(Box::new(kag_providers::mock::MockProvider::new()))
            }
            other => {
                let _ = config;
                Err(KagError::config(format!(
                    "unknown or disabled provider '{}' (set PROVIDER, or build with the matching feature)",
                    other
                )))
            }
        }
    }
}
