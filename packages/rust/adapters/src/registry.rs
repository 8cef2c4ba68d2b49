//! Config-driven adapter registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_shared::{AppConfig, CourierError, Result, RetryPolicy};
use tracing::debug;

use crate::{
    DestinationAdapter, HttpCapability, JsonFeedSource, SourceAdapter, StageCapability,
    WebhookDestination,
};

/// A destination together with its delivery policy.
#[derive(Clone)]
pub struct BoundDestination {
    pub adapter: Arc<dyn DestinationAdapter>,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

/// Every adapter the pipeline runs with: sources in config order,
/// capabilities keyed by stage name, destinations in config order.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    sources: Vec<Arc<dyn SourceAdapter>>,
    capabilities: HashMap<String, Arc<dyn StageCapability>>,
    destinations: Vec<BoundDestination>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the bundled adapters named by `config`. Unknown kinds are a
    /// config error; sources marked inactive are left out.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut registry = Self::new();

        for source in &config.sources {
            if !source.active {
                debug!(source = %source.name, "source inactive in config, skipping");
                continue;
            }
            let adapter: Arc<dyn SourceAdapter> = match source.kind.as_str() {
                "json_feed" => Arc::new(JsonFeedSource::new(&source.name, &source.url)?),
                other => {
                    return Err(CourierError::config(format!(
                        "source '{}': unknown kind '{other}'",
                        source.name
                    )));
                }
            };
            registry = registry.with_source(adapter);
        }

        for stage in &config.stages {
            let def = stage.definition();
            let capability: Arc<dyn StageCapability> = match stage.capability.kind.as_str() {
                "http" => Arc::new(HttpCapability::new(
                    &stage.name,
                    &stage.capability.url,
                    def.timeout,
                )?),
                other => {
                    return Err(CourierError::config(format!(
                        "stage '{}': unknown capability kind '{other}'",
                        stage.name
                    )));
                }
            };
            registry = registry.with_capability(&def.capability, capability);
        }

        for dest in &config.destinations {
            let adapter: Arc<dyn DestinationAdapter> = match dest.kind.as_str() {
                "webhook" => Arc::new(WebhookDestination::new(
                    &dest.id,
                    &dest.url,
                    dest.timeout(),
                )?),
                other => {
                    return Err(CourierError::config(format!(
                        "destination '{}': unknown kind '{other}'",
                        dest.id
                    )));
                }
            };
            registry = registry.with_destination(adapter, dest.retry(), dest.timeout());
        }

        Ok(registry)
    }

    pub fn with_source(mut self, source: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_capability(
        mut self,
        name: impl Into<String>,
        capability: Arc<dyn StageCapability>,
    ) -> Self {
        self.capabilities.insert(name.into(), capability);
        self
    }

    pub fn with_destination(
        mut self,
        adapter: Arc<dyn DestinationAdapter>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        self.destinations.push(BoundDestination {
            adapter,
            retry,
            timeout,
        });
        self
    }

    pub fn sources(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.sources
    }

    pub fn capability(&self, name: &str) -> Option<Arc<dyn StageCapability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn destinations(&self) -> &[BoundDestination] {
        &self.destinations
    }

    pub fn destination(&self, id: &str) -> Option<&BoundDestination> {
        self.destinations.iter().find(|d| d.adapter.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[[sources]]
name = "twitter"
kind = "json_feed"
url = "https://feeds.example.com/twitter.json"

[[sources]]
name = "paused"
kind = "json_feed"
url = "https://feeds.example.com/paused.json"
active = false

[[stages]]
name = "translate"
ordinal = 1
capability = { kind = "http", url = "https://llm.example.com/translate" }

[[destinations]]
id = "chat-a"
kind = "webhook"
url = "https://bot.example.com/send"
max_attempts = 7
"#;

    #[test]
    fn builds_bundled_adapters() {
        let config: AppConfig = toml_config(CONFIG);
        let registry = AdapterRegistry::from_config(&config).expect("registry");

        assert_eq!(registry.sources().len(), 1);
        assert_eq!(registry.sources()[0].name(), "twitter");
        assert!(registry.capability("translate").is_some());
        let dest = registry.destination("chat-a").expect("destination");
        assert_eq!(dest.retry.max_attempts, 7);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut config: AppConfig = toml_config(CONFIG);
        config.destinations[0].kind = "carrier-pigeon".into();
        let err = AdapterRegistry::from_config(&config).err().expect("error");
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    fn toml_config(s: &str) -> AppConfig {
        let config: AppConfig = toml::from_str(s).expect("parse config");
        config.validate().expect("valid config");
        config
    }
}
