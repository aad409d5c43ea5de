//! Environment-based configuration types for social-connect runtime settings.

use anyhow::Result;
use std::str::FromStr;
use std::time::Duration;

use crate::connect::ConnectSettings;
use crate::errors::ConfigError;
use crate::provider::{ProviderConfig, ProviderKind};
use crate::refresh::RefreshSettings;
use crate::state::StateKeyStrategy;

/// HTTP server port configuration
#[derive(Clone)]
pub struct HttpPort(u16);

/// Certificate bundles for HTTPS connections
#[derive(Clone)]
pub struct CertificateBundles(Vec<String>);

/// Timeout applied to provider HTTP calls
#[derive(Clone)]
pub struct HttpClientTimeout(Duration);

/// Boolean switch accepting true/false/1/0/yes/no/on/off
#[derive(Clone, Copy)]
pub struct Toggle(bool);

/// Strictly positive count (batch sizes, pool sizes)
#[derive(Clone, Copy)]
pub struct PositiveCount(usize);

/// Comma-separated list of authorities or provider ids
#[derive(Clone, Default)]
pub struct CommaList(Vec<String>);

/// Cron expression driving the refresh scheduler
#[derive(Clone)]
pub struct RefreshCron(cron::Schedule);

/// Main application configuration
#[derive(Clone)]
pub struct Config {
    pub version: String,
    pub http_port: HttpPort,
    pub external_base: String,
    pub certificate_bundles: CertificateBundles,
    pub user_agent: String,
    pub http_client_timeout: HttpClientTimeout,
    pub http_client_foreign_timeout: HttpClientTimeout,
    pub storage_backend: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,

    pub connect_providers: CommaList,

    pub state_key_strategy: StateKeyStrategy,
    pub state_ttl: HttpClientTimeout,
    pub state_validation: Toggle,
    pub authorization_context_ttl: HttpClientTimeout,
    pub state_redirect_coder: Toggle,
    pub auto_sign_up: Toggle,
    pub default_authorities: CommaList,
    pub temporary_authorities: CommaList,
    pub temporary_user_password: Option<String>,
    pub sign_up_url: String,
    pub default_target_url: String,

    pub token_table_enabled: Toggle,
    pub token_encryption_secret: String,
    pub refresh_cron: RefreshCron,
    pub refresh_batch_count: PositiveCount,
    pub refresh_remaining_window: HttpClientTimeout,
    pub refresh_pool_size: PositiveCount,
    pub refresh_lock_ttl: HttpClientTimeout,
    pub refresh_lock_key: String,
    pub binding_pool_size: PositiveCount,
}

impl Config {
    /// Create a new configuration from environment variables
    pub fn new() -> Result<Self> {
        let certificate_bundles: CertificateBundles =
            optional_env("CERTIFICATE_BUNDLES").try_into()?;
        let default_user_agent = format!("social-connect/{}", version()?);
        let external_base = require_env("EXTERNAL_BASE")?;
        let http_client_timeout: HttpClientTimeout =
            default_env("HTTP_CLIENT_TIMEOUT", "5s").try_into()?;
        let http_client_foreign_timeout: HttpClientTimeout =
            default_env("HTTP_CLIENT_FOREIGN_TIMEOUT", "15s").try_into()?;
        let http_port: HttpPort = default_env("HTTP_PORT", "8080").try_into()?;
        let storage_backend = default_env("STORAGE_BACKEND", "memory");
        let database_url = optional_env("DATABASE_URL");
        let redis_url = optional_env("REDIS_URL").filter(|v| !v.is_empty());
        let user_agent = default_env("USER_AGENT", &default_user_agent);

        let connect_providers: CommaList = optional_env("CONNECT_PROVIDERS").try_into()?;

        let state_key_strategy = parse_state_strategy(&default_env("STATE_KEY_STRATEGY", "random"))?;
        let state_ttl: HttpClientTimeout = default_env("STATE_TTL", "3m").try_into()?;
        let state_validation: Toggle = default_env("STATE_VALIDATION", "true").try_into()?;
        let authorization_context_ttl: HttpClientTimeout =
            default_env("AUTHORIZATION_CONTEXT_TTL", "3m").try_into()?;
        let state_redirect_coder: Toggle =
            default_env("STATE_REDIRECT_CODER", "true").try_into()?;
        let auto_sign_up: Toggle = default_env("AUTO_SIGN_UP", "true").try_into()?;
        let default_authorities: CommaList =
            default_env("DEFAULT_AUTHORITIES", "ROLE_USER").try_into()?;
        let temporary_authorities: CommaList =
            default_env("TEMPORARY_AUTHORITIES", "ROLE_TEMPORARY_USER").try_into()?;
        let temporary_user_password =
            optional_env("TEMPORARY_USER_PASSWORD").filter(|v| !v.is_empty());
        let sign_up_url = default_env("SIGN_UP_URL", "/signup");
        let default_target_url = default_env("DEFAULT_TARGET_URL", "/");

        let token_table_enabled: Toggle = default_env("TOKEN_TABLE_ENABLED", "true").try_into()?;
        let token_encryption_secret = require_env("TOKEN_ENCRYPTION_SECRET")?;
        let refresh_cron: RefreshCron = default_env("REFRESH_CRON", "0 0 2 * * *").try_into()?;
        let refresh_batch_count =
            PositiveCount::parse("REFRESH_BATCH_COUNT", &default_env("REFRESH_BATCH_COUNT", "1000"))?;
        let refresh_remaining_window: HttpClientTimeout =
            default_env("REFRESH_REMAINING_WINDOW", "24h").try_into()?;
        let refresh_pool_size =
            PositiveCount::parse("REFRESH_POOL_SIZE", &default_env("REFRESH_POOL_SIZE", "8"))?;
        let refresh_lock_ttl: HttpClientTimeout =
            default_env("REFRESH_LOCK_TTL", "6h").try_into()?;
        let refresh_lock_key = default_env("REFRESH_LOCK_KEY", "social-connect:refresh");
        let binding_pool_size =
            PositiveCount::parse("BINDING_POOL_SIZE", &default_env("BINDING_POOL_SIZE", "4"))?;

        Ok(Self {
            version: version()?,
            http_port,
            external_base,
            certificate_bundles,
            user_agent,
            http_client_timeout,
            http_client_foreign_timeout,
            storage_backend,
            database_url,
            redis_url,
            connect_providers,
            state_key_strategy,
            state_ttl,
            state_validation,
            authorization_context_ttl,
            state_redirect_coder,
            auto_sign_up,
            default_authorities,
            temporary_authorities,
            temporary_user_password,
            sign_up_url,
            default_target_url,
            token_table_enabled,
            token_encryption_secret,
            refresh_cron,
            refresh_batch_count,
            refresh_remaining_window,
            refresh_pool_size,
            refresh_lock_ttl,
            refresh_lock_key,
            binding_pool_size,
        })
    }

    /// Settings for the authorization round trip
    pub fn connect_settings(&self) -> ConnectSettings {
        let defaults = ConnectSettings::default();
        ConnectSettings {
            state_strategy: self.state_key_strategy,
            state_ttl: *self.state_ttl.as_ref(),
            state_validation: *self.state_validation.as_ref(),
            context_ttl: *self.authorization_context_ttl.as_ref(),
            auto_sign_up: *self.auto_sign_up.as_ref(),
            default_authorities: self.default_authorities.as_ref().clone(),
            temporary_authorities: self.temporary_authorities.as_ref().clone(),
            temporary_password: self
                .temporary_user_password
                .clone()
                .unwrap_or(defaults.temporary_password),
            sign_up_url: self.sign_up_url.clone(),
            default_target_url: self.default_target_url.clone(),
        }
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            enabled: *self.token_table_enabled.as_ref(),
            schedule: self.refresh_cron.as_ref().clone(),
            batch_count: *self.refresh_batch_count.as_ref() as i64,
            remaining_window: *self.refresh_remaining_window.as_ref(),
            pool_size: *self.refresh_pool_size.as_ref(),
            lock_ttl: *self.refresh_lock_ttl.as_ref(),
            lock_key_prefix: self.refresh_lock_key.clone(),
        }
    }

    /// Provider configurations for every id listed in `CONNECT_PROVIDERS`
    pub fn provider_configs(&self) -> Result<Vec<ProviderConfig>> {
        self.connect_providers
            .as_ref()
            .iter()
            .map(|provider_id| self.provider_config(provider_id, optional_env))
            .collect()
    }

    fn provider_config<F>(&self, provider_id: &str, lookup: F) -> Result<ProviderConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = provider_env_prefix(provider_id);
        let get = |suffix: &str| lookup(&format!("{prefix}_{suffix}")).filter(|v| !v.is_empty());

        let kind = match get("KIND") {
            Some(kind) => ProviderKind::from_str(&kind).map_err(|kind| {
                ConfigError::UnknownProviderKind {
                    provider_id: provider_id.to_string(),
                    kind,
                }
            })?,
            None => ProviderKind::from_provider_id(provider_id),
        };

        let mut config = ProviderConfig::new(provider_id, kind)
            .with_credentials(
                get("CLIENT_ID").unwrap_or_default(),
                get("CLIENT_SECRET").unwrap_or_default(),
            )
            .with_redirect_uri(get("REDIRECT_URI").unwrap_or_else(|| {
                format!(
                    "{}/callback/{}",
                    self.external_base.trim_end_matches('/'),
                    provider_id
                )
            }));

        if let Some(scopes) = get("SCOPES") {
            config.scopes = split_scopes(&scopes);
        }
        if let Some(url) = get("AUTHORIZE_URL") {
            config.authorize_url = url;
        }
        if let Some(url) = get("TOKEN_URL") {
            config.token_url = url;
        }
        if let Some(url) = get("USER_INFO_URL") {
            config.user_info_url = url;
        }

        config.timeout = match get("TIMEOUT") {
            Some(value) => *HttpClientTimeout::try_from(value)?.as_ref(),
            None if kind.is_foreign() => *self.http_client_foreign_timeout.as_ref(),
            None => *self.http_client_timeout.as_ref(),
        };
        config.proxy = get("PROXY");
        config.user_agent = self.user_agent.clone();
        config.ca_bundles = self.certificate_bundles.as_ref().clone();

        Ok(config)
    }
}

/// Get application version from build environment
pub fn version() -> Result<String> {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .map(|val| val.to_string())
        .ok_or(ConfigError::VersionNotSet.into())
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| ConfigError::EnvVarRequired(name.to_string()).into())
}

pub(crate) fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn default_env(name: &str, default_value: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default_value.to_string())
}

/// `corp-sso` becomes `PROVIDER_CORP_SSO`
fn provider_env_prefix(provider_id: &str) -> String {
    let normalized: String = provider_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("PROVIDER_{normalized}")
}

// Scopes may be separated by commas or whitespace.
fn split_scopes(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_state_strategy(value: &str) -> Result<StateKeyStrategy, ConfigError> {
    StateKeyStrategy::from_str(value).map_err(ConfigError::UnknownStateStrategy)
}

impl TryFrom<String> for HttpPort {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Ok(Self(8080))
        } else {
            value
                .parse::<u16>()
                .map(Self)
                .map_err(|err| ConfigError::PortParsingFailed(err).into())
        }
    }
}

impl AsRef<u16> for HttpPort {
    fn as_ref(&self) -> &u16 {
        &self.0
    }
}

impl TryFrom<Option<String>> for CertificateBundles {
    type Error = anyhow::Error;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        let value = value.unwrap_or_default();
        Ok(Self(
            value
                .split(';')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

impl AsRef<Vec<String>> for CertificateBundles {
    fn as_ref(&self) -> &Vec<String> {
        &self.0
    }
}

impl TryFrom<String> for HttpClientTimeout {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        duration_str::parse(&value)
            .map(Self)
            .map_err(|e| ConfigError::DurationParsingFailed(value, e.to_string()))
    }
}

impl AsRef<Duration> for HttpClientTimeout {
    fn as_ref(&self) -> &Duration {
        &self.0
    }
}

impl TryFrom<String> for Toggle {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Self(true)),
            "false" | "0" | "no" | "off" => Ok(Self(false)),
            _ => Err(ConfigError::BoolParsingFailed(value)),
        }
    }
}

impl AsRef<bool> for Toggle {
    fn as_ref(&self) -> &bool {
        &self.0
    }
}

impl PositiveCount {
    fn parse(name: &str, value: &str) -> Result<Self, ConfigError> {
        let parsed = value
            .trim()
            .parse::<usize>()
            .map_err(|e| ConfigError::NumberParsingFailed(value.to_string(), e))?;
        if parsed == 0 {
            return Err(ConfigError::MustBePositive(name.to_string()));
        }
        Ok(Self(parsed))
    }
}

impl AsRef<usize> for PositiveCount {
    fn as_ref(&self) -> &usize {
        &self.0
    }
}

impl TryFrom<Option<String>> for CommaList {
    type Error = anyhow::Error;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        let value = value.unwrap_or_default();
        Ok(Self(
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        ))
    }
}

impl TryFrom<String> for CommaList {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(Some(value))
    }
}

impl AsRef<Vec<String>> for CommaList {
    fn as_ref(&self) -> &Vec<String> {
        &self.0
    }
}

impl TryFrom<String> for RefreshCron {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        cron::Schedule::from_str(&value)
            .map(Self)
            .map_err(|e| ConfigError::InvalidCronExpression(value, e.to_string()))
    }
}

impl AsRef<cron::Schedule> for RefreshCron {
    fn as_ref(&self) -> &cron::Schedule {
        &self.0
    }
}
