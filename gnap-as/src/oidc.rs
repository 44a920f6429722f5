//! Upstream identity providers.
//!
//! The interaction flow treats the OIDC provider as a consent oracle: send
//! the resource owner there, get subject claims back. [`OidcProvider`] is
//! that seam; [`RemoteOidcProvider`] is the standard implementation over
//! discovery, authorization-code redirect and code exchange.

use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

/// Configuration for one upstream identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Issuer URL, hosting `/.well-known/openid-configuration`
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub name: String,
    /// Extra scopes beside `openid`; defaults to `profile email`
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub sign_up_icon_url: Option<String>,
    #[serde(default)]
    pub sign_in_icon_url: Option<String>,
    #[serde(default)]
    pub order: i32,
}

/// Catalog entry returned by the providers endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProvider {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_up_icon_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_in_icon_url: Option<String>,
    pub order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthProviders {
    pub providers: Vec<AuthProvider>,
}

/// Subject claims extracted from a verified `id_token`.
#[derive(Debug, Clone)]
pub struct IdClaims {
    pub sub: String,
}

/// One ready-to-use identity provider.
#[async_trait]
pub trait OidcProvider: Send + Sync {
    /// Authorization URL the resource owner's browser is sent to
    fn auth_url(&self, state: &str) -> String;

    /// Exchange the callback code and return the subject claims
    async fn exchange(&self, code: &str) -> Result<IdClaims>;
}

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDoc {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    id_token: Option<String>,
}

/// Standard OIDC provider client.
pub struct RemoteOidcProvider {
    config: ProviderConfig,
    discovery: DiscoveryDoc,
    callback_url: String,
    scopes: String,
    http: reqwest::Client,
}

impl RemoteOidcProvider {
    /// Fetch the provider's discovery document, retrying with a constant
    /// one-second backoff for slow-starting providers.
    pub async fn discover(
        provider_id: &str,
        config: ProviderConfig,
        callback_url: String,
        max_attempts: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::new();
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            config.url.trim_end_matches('/')
        );

        let mut attempt: u64 = 0;
        let discovery = loop {
            match fetch_discovery(&http, &discovery_url).await {
                Ok(doc) => break doc,
                Err(e) if attempt + 1 < max_attempts => {
                    attempt += 1;
                    tracing::warn!(
                        "failed to connect to the [{}] OIDC provider, will retry: {}",
                        provider_id,
                        e
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                Err(e) => {
                    return Err(Error::Network(format!(
                        "failed to init oidc provider [{}] with url [{}]: {}",
                        provider_id, config.url, e
                    )));
                }
            }
        };

        let mut scopes = vec!["openid".to_string()];
        if config.scopes.is_empty() {
            scopes.push("profile".to_string());
            scopes.push("email".to_string());
        } else {
            scopes.extend(config.scopes.iter().cloned());
        }

        Ok(Self {
            config,
            discovery,
            callback_url,
            scopes: scopes.join(" "),
            http,
        })
    }
}

async fn fetch_discovery(http: &reqwest::Client, url: &str) -> Result<DiscoveryDoc> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    if !response.status().is_success() {
        return Err(Error::Network(format!(
            "discovery returned {}",
            response.status()
        )));
    }

    response
        .json::<DiscoveryDoc>()
        .await
        .map_err(|e| Error::Network(e.to_string()))
}

#[async_trait]
impl OidcProvider for RemoteOidcProvider {
    fn auth_url(&self, state: &str) -> String {
        let mut url = match Url::parse(&self.discovery.authorization_endpoint) {
            Ok(url) => url,
            Err(_) => return self.discovery.authorization_endpoint.clone(),
        };

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.callback_url)
            .append_pair("scope", &self.scopes)
            .append_pair("state", state);

        url.to_string()
    }

    async fn exchange(&self, code: &str) -> Result<IdClaims> {
        let response = self
            .http
            .post(&self.discovery.token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.callback_url.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let tokens: TokenEndpointResponse = response
            .json()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let id_token = tokens
            .id_token
            .ok_or_else(|| Error::Network("token response missing id_token".to_string()))?;

        id_token_claims(&id_token, &self.discovery.issuer, &self.config.client_id)
    }
}

/// Extract and validate the claims of an `id_token` received directly from
/// the provider's token endpoint: issuer, audience and expiry must check
/// out and `sub` must be present.
fn id_token_claims(id_token: &str, issuer: &str, client_id: &str) -> Result<IdClaims> {
    let parts: Vec<&str> = id_token.split('.').collect();
    if parts.len() != 3 {
        return Err(Error::Network("invalid id_token format".to_string()));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| Error::Network(format!("invalid id_token payload encoding: {}", e)))?;

    let claims: Value = serde_json::from_slice(&payload)
        .map_err(|e| Error::Network(format!("invalid id_token claims: {}", e)))?;

    if claims.get("iss").and_then(Value::as_str) != Some(issuer) {
        return Err(Error::Network("id_token issuer mismatch".to_string()));
    }

    let aud_ok = match claims.get("aud") {
        Some(Value::String(aud)) => aud == client_id,
        Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(client_id)),
        _ => false,
    };
    if !aud_ok {
        return Err(Error::Network("id_token audience mismatch".to_string()));
    }

    let exp = claims
        .get("exp")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Network("id_token missing exp".to_string()))?;
    if exp <= Utc::now().timestamp() {
        return Err(Error::Network("id_token expired".to_string()));
    }

    let sub = claims
        .get("sub")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Network("id_token missing sub".to_string()))?;

    Ok(IdClaims {
        sub: sub.to_string(),
    })
}

/// Process-wide map of initialized providers.
///
/// Lookups take the shared read lock; first-time initialization is a
/// retrying network call, so it runs with no lock held and the result is
/// inserted under the write lock with a re-check, keeping whichever
/// instance got there first.
pub struct ProviderCache {
    configs: HashMap<String, ProviderConfig>,
    cached: RwLock<HashMap<String, Arc<dyn OidcProvider>>>,
    callback_url: String,
    startup_timeout: u64,
}

impl ProviderCache {
    pub fn new(
        configs: HashMap<String, ProviderConfig>,
        callback_url: String,
        startup_timeout: u64,
    ) -> Self {
        Self {
            configs,
            cached: RwLock::new(HashMap::new()),
            callback_url,
            startup_timeout,
        }
    }

    /// Install an already-initialized provider, e.g. one with static
    /// endpoints. Deployments normally let [`Self::get`] initialize lazily.
    pub async fn preload(&self, provider_id: &str, provider: Arc<dyn OidcProvider>) {
        let mut cached = self.cached.write().await;
        cached.insert(provider_id.to_string(), provider);
    }

    /// The providers catalog, in configured order.
    pub fn catalog(&self) -> AuthProviders {
        let mut providers: Vec<AuthProvider> = self
            .configs
            .iter()
            .map(|(id, config)| AuthProvider {
                id: id.clone(),
                name: if config.name.is_empty() {
                    id.clone()
                } else {
                    config.name.clone()
                },
                sign_up_icon_url: config.sign_up_icon_url.clone(),
                sign_in_icon_url: config.sign_in_icon_url.clone(),
                order: config.order,
            })
            .collect();

        providers.sort_by_key(|provider| provider.order);

        AuthProviders { providers }
    }

    pub fn is_configured(&self, provider_id: &str) -> bool {
        self.configs.contains_key(provider_id)
    }

    /// Get an initialized provider, initializing it on first use.
    pub async fn get(&self, provider_id: &str) -> Result<Arc<dyn OidcProvider>> {
        {
            let cached = self.cached.read().await;
            if let Some(provider) = cached.get(provider_id) {
                return Ok(provider.clone());
            }
        }

        let config = self
            .configs
            .get(provider_id)
            .ok_or_else(|| {
                Error::InvalidRequest(format!("provider not supported: {}", provider_id))
            })?
            .clone();

        // Network initialization happens with no lock held.
        let provider = RemoteOidcProvider::discover(
            provider_id,
            config,
            self.callback_url.clone(),
            self.startup_timeout.max(1),
        )
        .await?;

        let mut cached = self.cached.write().await;
        let provider = cached
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(provider))
            .clone();

        Ok(provider)
    }
}
