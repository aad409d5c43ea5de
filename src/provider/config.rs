//! Normalized provider configuration and per-kind defaults.

use crate::errors::ConfigError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Supported provider families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Github,
    Gitee,
    Gitlab,
    Google,
    /// Any standards-following OAuth2 provider with explicit endpoints
    Generic,
}

/// JSON field names used to build an [`crate::provider::ExternalProfile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserFieldMapping {
    pub id: &'static str,
    pub username: &'static str,
    pub nickname: &'static str,
    pub avatar: &'static str,
    pub profile_url: &'static str,
    pub email: &'static str,
}

struct KindDefaults {
    authorize_url: &'static str,
    token_url: &'static str,
    user_info_url: &'static str,
    scopes: &'static [&'static str],
    fields: UserFieldMapping,
    foreign: bool,
}

const OIDC_FIELDS: UserFieldMapping = UserFieldMapping {
    id: "sub",
    username: "preferred_username",
    nickname: "name",
    avatar: "picture",
    profile_url: "profile",
    email: "email",
};

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitee => "gitee",
            Self::Gitlab => "gitlab",
            Self::Google => "google",
            Self::Generic => "generic",
        }
    }

    /// Kind implied by a well-known provider id, falling back to generic
    pub fn from_provider_id(provider_id: &str) -> Self {
        provider_id.parse().unwrap_or(Self::Generic)
    }

    /// Cross-border providers get the longer default timeout
    pub fn is_foreign(&self) -> bool {
        self.defaults().foreign
    }

    pub fn fields(&self) -> UserFieldMapping {
        self.defaults().fields
    }

    fn defaults(&self) -> KindDefaults {
        match self {
            Self::Github => KindDefaults {
                authorize_url: "https://github.com/login/oauth/authorize",
                token_url: "https://github.com/login/oauth/access_token",
                user_info_url: "https://api.github.com/user",
                scopes: &["read:user", "user:email"],
                fields: UserFieldMapping {
                    id: "id",
                    username: "login",
                    nickname: "name",
                    avatar: "avatar_url",
                    profile_url: "html_url",
                    email: "email",
                },
                foreign: true,
            },
            Self::Gitee => KindDefaults {
                authorize_url: "https://gitee.com/oauth/authorize",
                token_url: "https://gitee.com/oauth/token",
                user_info_url: "https://gitee.com/api/v5/user",
                scopes: &["user_info"],
                fields: UserFieldMapping {
                    id: "id",
                    username: "login",
                    nickname: "name",
                    avatar: "avatar_url",
                    profile_url: "html_url",
                    email: "email",
                },
                foreign: false,
            },
            Self::Gitlab => KindDefaults {
                authorize_url: "https://gitlab.com/oauth/authorize",
                token_url: "https://gitlab.com/oauth/token",
                user_info_url: "https://gitlab.com/api/v4/user",
                scopes: &["read_user"],
                fields: UserFieldMapping {
                    id: "id",
                    username: "username",
                    nickname: "name",
                    avatar: "avatar_url",
                    profile_url: "web_url",
                    email: "email",
                },
                foreign: true,
            },
            Self::Google => KindDefaults {
                authorize_url: "https://accounts.google.com/o/oauth2/v2/auth",
                token_url: "https://oauth2.googleapis.com/token",
                user_info_url: "https://openidconnect.googleapis.com/v1/userinfo",
                scopes: &["openid", "profile", "email"],
                fields: UserFieldMapping {
                    username: "email",
                    ..OIDC_FIELDS
                },
                foreign: true,
            },
            Self::Generic => KindDefaults {
                authorize_url: "",
                token_url: "",
                user_info_url: "",
                scopes: &[],
                fields: OIDC_FIELDS,
                foreign: false,
            },
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "gitee" => Ok(Self::Gitee),
            "gitlab" => Ok(Self::Gitlab),
            "google" => Ok(Self::Google),
            "generic" | "oauth2" => Ok(Self::Generic),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable per-provider settings owned by the registry
#[derive(Clone)]
#[cfg_attr(any(debug_assertions, test), derive(Debug))]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,
    pub authorize_url: String,
    pub token_url: String,
    pub user_info_url: String,
    pub redirect_uri: String,
    pub timeout: Duration,
    pub proxy: Option<String>,
    pub user_agent: String,
    /// PEM files added as extra trust roots
    pub ca_bundles: Vec<String>,
}

impl ProviderConfig {
    /// Configuration pre-filled with the kind's endpoints and scopes
    pub fn new(id: impl Into<String>, kind: ProviderKind) -> Self {
        let defaults = kind.defaults();
        Self {
            id: id.into(),
            kind,
            client_id: String::new(),
            client_secret: String::new(),
            scopes: defaults.scopes.iter().map(|s| s.to_string()).collect(),
            authorize_url: defaults.authorize_url.to_string(),
            token_url: defaults.token_url.to_string(),
            user_info_url: defaults.user_info_url.to_string(),
            redirect_uri: String::new(),
            timeout: if defaults.foreign {
                Duration::from_secs(15)
            } else {
                Duration::from_secs(5)
            },
            proxy: None,
            user_agent: format!("social-connect/{}", env!("CARGO_PKG_VERSION")),
            ca_bundles: Vec::new(),
        }
    }

    pub fn with_credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        self.client_id = client_id.into();
        self.client_secret = client_secret.into();
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = redirect_uri.into();
        self
    }

    pub fn with_endpoints(
        mut self,
        authorize_url: impl Into<String>,
        token_url: impl Into<String>,
        user_info_url: impl Into<String>,
    ) -> Self {
        self.authorize_url = authorize_url.into();
        self.token_url = token_url.into();
        self.user_info_url = user_info_url.into();
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.trim().is_empty()
    }

    /// Ensure every endpoint is an absolute http(s) URL
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("authorize_url", &self.authorize_url),
            ("token_url", &self.token_url),
            ("user_info_url", &self.user_info_url),
            ("redirect_uri", &self.redirect_uri),
        ] {
            let parsed = url::Url::parse(value).map_err(|e| {
                ConfigError::InvalidProviderEndpoint(self.id.clone(), format!("{name}: {e}"))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidProviderEndpoint(
                    self.id.clone(),
                    format!("{name} must use http or https"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_provider_id() {
        assert_eq!(ProviderKind::from_provider_id("github"), ProviderKind::Github);
        assert_eq!(ProviderKind::from_provider_id("GitLab"), ProviderKind::Gitlab);
        assert_eq!(ProviderKind::from_provider_id("corp-sso"), ProviderKind::Generic);
    }

    #[test]
    fn test_defaults_and_timeouts() {
        let github = ProviderConfig::new("github", ProviderKind::Github);
        assert!(github.authorize_url.starts_with("https://github.com"));
        assert_eq!(github.timeout, Duration::from_secs(15));

        let gitee = ProviderConfig::new("gitee", ProviderKind::Gitee);
        assert_eq!(gitee.timeout, Duration::from_secs(5));
        assert_eq!(gitee.scopes, vec!["user_info".to_string()]);
    }

    #[test]
    fn test_credentials_and_validation() {
        let config = ProviderConfig::new("gitee", ProviderKind::Gitee);
        assert!(!config.has_credentials());

        let config = config
            .with_credentials("id", "secret")
            .with_redirect_uri("https://app.example.com/callback/gitee");
        assert!(config.has_credentials());
        assert!(config.validate().is_ok());

        let generic = ProviderConfig::new("corp", ProviderKind::Generic)
            .with_credentials("id", "secret")
            .with_redirect_uri("https://app.example.com/callback/corp");
        assert!(generic.validate().is_err());
    }
}
