//! Standards-following OAuth2 authorization code client.

use async_trait::async_trait;
use chrono::Utc;
use http::header::ACCEPT;
use serde_json::Value;

use super::config::{ProviderConfig, UserFieldMapping};
use super::{ExternalProfile, ProviderClient, ProviderToken};
use crate::errors::{ConfigError, ConnectError, RefreshError};
use crate::storage::traits::TokenRecord;

/// OAuth2 client driven entirely by a [`ProviderConfig`]
pub struct StandardOAuth2Client {
    config: ProviderConfig,
    http_client: reqwest::Client,
    fields: UserFieldMapping,
    refresh_supported: bool,
}

impl StandardOAuth2Client {
    pub fn new(config: ProviderConfig) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone());

        if let Some(proxy) = config.proxy.as_deref() {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| ConfigError::HttpClientBuildFailed(config.id.clone(), e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        for ca_bundle in &config.ca_bundles {
            let pem = std::fs::read(ca_bundle).map_err(|e| {
                ConfigError::HttpClientBuildFailed(config.id.clone(), format!("{ca_bundle}: {e}"))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ConfigError::HttpClientBuildFailed(config.id.clone(), format!("{ca_bundle}: {e}"))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        let http_client = builder
            .build()
            .map_err(|e| ConfigError::HttpClientBuildFailed(config.id.clone(), e.to_string()))?;

        Ok(Self {
            fields: config.kind.fields(),
            config,
            http_client,
            refresh_supported: true,
        })
    }

    /// Mark this provider as issuing non-refreshable tokens
    pub fn without_refresh(mut self) -> Self {
        self.refresh_supported = false;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn post_token_form(
        &self,
        form: &[(&str, &str)],
    ) -> Result<(reqwest::StatusCode, Value), reqwest::Error> {
        let response = self
            .http_client
            .post(&self.config.token_url)
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    fn parse_token(&self, body: &Value) -> Result<ProviderToken, String> {
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or(error);
            return Err(format!("{error}: {description}"));
        }

        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| "token response has no access_token".to_string())?;

        Ok(ProviderToken {
            access_token: access_token.to_string(),
            refresh_token: string_field(body, "refresh_token"),
            expires_in: body.get("expires_in").and_then(|value| {
                value
                    .as_i64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            }),
            token_type: string_field(body, "token_type"),
            scope: string_field(body, "scope"),
        })
    }

    fn parse_profile(&self, raw: Value, token: &ProviderToken) -> Result<ExternalProfile, String> {
        let provider_user_id = string_field(&raw, self.fields.id)
            .ok_or_else(|| format!("user info has no '{}' field", self.fields.id))?;
        let username = string_field(&raw, self.fields.username)
            .unwrap_or_else(|| provider_user_id.clone());

        Ok(ExternalProfile {
            provider_id: self.config.id.clone(),
            nickname: string_field(&raw, self.fields.nickname),
            avatar: string_field(&raw, self.fields.avatar),
            profile_url: string_field(&raw, self.fields.profile_url),
            email: string_field(&raw, self.fields.email),
            provider_user_id,
            username,
            raw,
            token: token.clone(),
        })
    }
}

/// Read a field as a string, accepting JSON numbers as well
fn string_field(value: &Value, name: &str) -> Option<String> {
    match value.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl ProviderClient for StandardOAuth2Client {
    fn provider_id(&self) -> &str {
        &self.config.id
    }

    fn authorize_url(&self, state: &str) -> Result<String, ConnectError> {
        let mut url = url::Url::parse(&self.config.authorize_url)
            .map_err(|e| ConnectError::Configuration(format!("{}: {}", self.config.id, e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state);
        Ok(url.to_string())
    }

    async fn exchange_token(&self, code: &str) -> Result<ProviderToken, ConnectError> {
        let (status, body) = self
            .post_token_form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
                ("redirect_uri", &self.config.redirect_uri),
            ])
            .await
            .map_err(|e| {
                ConnectError::ProviderProtocol(format!("{} token request failed: {}", self.config.id, e))
            })?;

        if !status.is_success() {
            return Err(ConnectError::ProviderProtocol(format!(
                "{} token endpoint returned {}: {}",
                self.config.id, status, body
            )));
        }

        self.parse_token(&body)
            .map_err(|e| ConnectError::ProviderProtocol(format!("{}: {}", self.config.id, e)))
    }

    async fn fetch_user_info(&self, token: &ProviderToken) -> Result<ExternalProfile, ConnectError> {
        let response = self
            .http_client
            .get(&self.config.user_info_url)
            .header(ACCEPT, "application/json")
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| {
                ConnectError::ProviderProtocol(format!("{} user info request failed: {}", self.config.id, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectError::ProviderProtocol(format!(
                "{} user info endpoint returned {}",
                self.config.id, status
            )));
        }

        let raw = response.json::<Value>().await.map_err(|e| {
            ConnectError::ProviderProtocol(format!("{} user info is not JSON: {}", self.config.id, e))
        })?;

        self.parse_profile(raw, token)
            .map_err(|e| ConnectError::ProviderProtocol(format!("{}: {}", self.config.id, e)))
    }

    async fn refresh_token(&self, token: &TokenRecord) -> Result<TokenRecord, RefreshError> {
        if !self.refresh_supported {
            return Err(RefreshError::Unsupported(self.config.id.clone()));
        }
        let Some(refresh_token) = token.refresh_token.as_deref() else {
            return Err(RefreshError::Unsupported(self.config.id.clone()));
        };

        let (status, body) = self
            .post_token_form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ])
            .await
            .map_err(|e| RefreshError::Transient(format!("{}: {}", self.config.id, e)))?;

        let error_code = body.get("error").and_then(Value::as_str);
        if matches!(error_code, Some("unsupported_grant_type")) {
            return Err(RefreshError::Unsupported(self.config.id.clone()));
        }
        if !status.is_success() {
            return Err(RefreshError::Transient(format!(
                "{} token endpoint returned {}: {}",
                self.config.id, status, body
            )));
        }

        let refreshed = self
            .parse_token(&body)
            .map_err(|e| RefreshError::Transient(format!("{}: {}", self.config.id, e)))?;

        let now = Utc::now();
        Ok(TokenRecord {
            id: token.id,
            provider_id: token.provider_id.clone(),
            expire_time: refreshed.expire_time_from(now),
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token.or_else(|| token.refresh_token.clone()),
            token_type: refreshed.token_type.or_else(|| token.token_type.clone()),
            scope: refreshed.scope.or_else(|| token.scope.clone()),
            enable_refresh: true,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, kind: ProviderKind) -> StandardOAuth2Client {
        let config = ProviderConfig::new("gitee", kind)
            .with_credentials("client-id", "client-secret")
            .with_redirect_uri("https://app.example.com/callback/gitee")
            .with_endpoints(
                format!("{}/oauth/authorize", server.uri()),
                format!("{}/oauth/token", server.uri()),
                format!("{}/api/user", server.uri()),
            );
        StandardOAuth2Client::new(config).unwrap()
    }

    fn stored_token() -> TokenRecord {
        TokenRecord {
            id: 7,
            provider_id: "gitee".to_string(),
            access_token: "old-access".to_string(),
            refresh_token: Some("old-refresh".to_string()),
            token_type: Some("bearer".to_string()),
            scope: Some("user_info".to_string()),
            expire_time: 1,
            enable_refresh: true,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_authorize_url_parameters() {
        let server = MockServer::start().await;
        let client = client_for(&server, ProviderKind::Gitee);

        let url = url::Url::parse(&client.authorize_url("abc").unwrap()).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs.get("client_id").map(String::as_str), Some("client-id"));
        assert_eq!(pairs.get("state").map(String::as_str), Some("abc"));
        assert_eq!(pairs.get("scope").map(String::as_str), Some("user_info"));
        assert_eq!(
            pairs.get("redirect_uri").map(String::as_str),
            Some("https://app.example.com/callback/gitee")
        );
    }

    #[tokio::test]
    async fn test_exchange_and_fetch_profile() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "refresh_token": "refresh-1",
                "expires_in": 86400,
                "token_type": "bearer"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/user"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 1024,
                "login": "octo",
                "name": "Octo Cat",
                "avatar_url": "https://img.example.com/octo.png"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, ProviderKind::Gitee);
        let token = client.exchange_token("code-1").await.unwrap();
        assert_eq!(token.access_token, "access-1");
        assert_eq!(token.expires_in, Some(86400));

        let profile = client.fetch_user_info(&token).await.unwrap();
        assert_eq!(profile.provider_user_id, "1024");
        assert_eq!(profile.username, "octo");
        assert_eq!(profile.nickname.as_deref(), Some("Octo Cat"));
        assert_eq!(profile.provider_id, "gitee");
    }

    #[tokio::test]
    async fn test_exchange_error_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "code expired"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, ProviderKind::Gitee);
        let result = client.exchange_token("stale").await;
        assert!(matches!(result, Err(ConnectError::ProviderProtocol(ref m)) if m.contains("code expired")));
    }

    #[tokio::test]
    async fn test_refresh_keeps_previous_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, ProviderKind::Gitee);
        let refreshed = client.refresh_token(&stored_token()).await.unwrap();
        assert_eq!(refreshed.id, 7);
        assert_eq!(refreshed.access_token, "new-access");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("old-refresh"));
        assert!(refreshed.expire_time > Utc::now().timestamp_millis());
    }

    #[tokio::test]
    async fn test_refresh_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server, ProviderKind::Gitee);
        let result = client.refresh_token(&stored_token()).await;
        assert!(matches!(result, Err(RefreshError::Transient(_))));
    }

    #[tokio::test]
    async fn test_refresh_unsupported() {
        let server = MockServer::start().await;
        let client = client_for(&server, ProviderKind::Github).without_refresh();
        let result = client.refresh_token(&stored_token()).await;
        assert!(matches!(result, Err(RefreshError::Unsupported(_))));

        let client = client_for(&server, ProviderKind::Gitee);
        let mut token = stored_token();
        token.refresh_token = None;
        let result = client.refresh_token(&token).await;
        assert!(matches!(result, Err(RefreshError::Unsupported(_))));
    }
}
