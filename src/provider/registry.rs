//! Immutable provider id → client registry built once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use super::config::{ProviderConfig, ProviderKind};
use super::standard::StandardOAuth2Client;
use super::ProviderClient;
use crate::errors::{ConfigError, ConnectError};

type ProviderConstructor = fn(ProviderConfig) -> Result<Arc<dyn ProviderClient>, ConfigError>;

/// Constructor for each provider kind
const PROVIDER_CONSTRUCTORS: &[(ProviderKind, ProviderConstructor)] = &[
    (ProviderKind::Github, build_non_refreshable),
    (ProviderKind::Gitee, build_standard),
    (ProviderKind::Gitlab, build_standard),
    (ProviderKind::Google, build_standard),
    (ProviderKind::Generic, build_standard),
];

fn build_standard(config: ProviderConfig) -> Result<Arc<dyn ProviderClient>, ConfigError> {
    Ok(Arc::new(StandardOAuth2Client::new(config)?))
}

// OAuth app tokens issued by GitHub do not expire and cannot be refreshed.
fn build_non_refreshable(config: ProviderConfig) -> Result<Arc<dyn ProviderClient>, ConfigError> {
    Ok(Arc::new(StandardOAuth2Client::new(config)?.without_refresh()))
}

fn constructor_for(kind: ProviderKind) -> ProviderConstructor {
    PROVIDER_CONSTRUCTORS
        .iter()
        .find(|(candidate, _)| *candidate == kind)
        .map(|(_, constructor)| *constructor)
        .unwrap_or(build_standard)
}

/// Registry of configured provider clients
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    /// Build clients for every provider that has credentials. Providers
    /// without credentials are skipped; invalid endpoints are fatal.
    pub fn from_configs(configs: Vec<ProviderConfig>) -> Result<Self, ConfigError> {
        let mut clients = HashMap::new();
        for config in configs {
            if !config.has_credentials() {
                tracing::info!(provider_id = %config.id, "provider has no credentials, skipping");
                continue;
            }
            config.validate()?;

            let provider_id = config.id.clone();
            let kind = config.kind;
            let client = constructor_for(kind)(config)?;
            tracing::info!(%provider_id, %kind, "registered provider");
            clients.insert(provider_id, client);
        }
        Ok(Self { clients })
    }

    /// Registry over pre-built clients
    pub fn from_clients(clients: impl IntoIterator<Item = Arc<dyn ProviderClient>>) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|client| (client.provider_id().to_string(), client))
                .collect(),
        }
    }

    pub fn resolve(&self, provider_id: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(provider_id).cloned()
    }

    /// Like [`Self::resolve`], mapping absence to a configuration error
    pub fn require(&self, provider_id: &str) -> Result<Arc<dyn ProviderClient>, ConnectError> {
        self.resolve(provider_id)
            .ok_or_else(|| ConnectError::Configuration(provider_id.to_string()))
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(id: &str, kind: ProviderKind) -> ProviderConfig {
        ProviderConfig::new(id, kind)
            .with_credentials("client", "secret")
            .with_redirect_uri(format!("https://app.example.com/callback/{id}"))
    }

    #[test]
    fn test_missing_credentials_are_absent() {
        let registry = ProviderRegistry::from_configs(vec![
            configured("github", ProviderKind::Github),
            ProviderConfig::new("gitee", ProviderKind::Gitee),
        ])
        .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("github").is_some());
        assert!(registry.resolve("gitee").is_none());
        assert!(matches!(
            registry.require("gitee"),
            Err(ConnectError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_endpoint_is_fatal() {
        let result = ProviderRegistry::from_configs(vec![configured("corp", ProviderKind::Generic)]);
        assert!(matches!(
            result,
            Err(ConfigError::InvalidProviderEndpoint(ref id, _)) if id == "corp"
        ));
    }

    #[test]
    fn test_provider_ids_sorted() {
        let registry = ProviderRegistry::from_configs(vec![
            configured("gitlab", ProviderKind::Gitlab),
            configured("github", ProviderKind::Github),
            configured("google", ProviderKind::Google),
        ])
        .unwrap();
        assert_eq!(registry.provider_ids(), vec!["github", "gitlab", "google"]);
    }

    #[test]
    fn test_every_kind_has_constructor() {
        for kind in [
            ProviderKind::Github,
            ProviderKind::Gitee,
            ProviderKind::Gitlab,
            ProviderKind::Google,
            ProviderKind::Generic,
        ] {
            assert!(PROVIDER_CONSTRUCTORS.iter().any(|(k, _)| *k == kind));
        }
    }
}
