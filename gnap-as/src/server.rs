//! HTTP adapter: decodes JSON bodies, binds them to the auth handler, and
//! emits JSON responses. All GNAP failures collapse to the protocol's
//! two-code error alphabet on the way out.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gnap::{AuthRequest, ContinueRequest, IntrospectRequest, IntrospectResponse};
use crate::handler::AuthHandler;
use crate::interact::{ConsentResult, InteractionHandler, RedirectInteractionHandler};
use crate::oidc::{ProviderCache, ProviderConfig};
use crate::policy::{AccessPolicy, PolicyConfig};
use crate::proof::{HttpSigVerifier, InternalVerifier, RequestContext};
use crate::session::new_handle;
use crate::store::{OidcTransient, TokenStore, TransactionStore, TransientStore};
use axum::{
    Json, Router,
    extract::{Query, State},
    extract::rejection::StringRejection,
    http::{HeaderMap, Method, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// Endpoint for GNAP authorization requests.
pub const AUTH_REQUEST_PATH: &str = "/gnap/auth";
/// Endpoint for GNAP authorization continuation.
pub const AUTH_CONTINUE_PATH: &str = "/gnap/continue";
/// Endpoint for GNAP token introspection.
pub const AUTH_INTROSPECT_PATH: &str = "/gnap/introspect";
/// Endpoint the interaction redirect points the resource owner at.
pub const INTERACT_PATH: &str = "/gnap/interact";
/// Catalog of configured identity providers.
pub const AUTH_PROVIDERS_PATH: &str = "/oidc/providers";
/// Starts the identity provider round-trip for a transaction.
pub const OIDC_LOGIN_PATH: &str = "/oidc/login";
/// Identity provider callback.
pub const OIDC_CALLBACK_PATH: &str = "/oidc/callback";

const PROVIDER_QUERY_PARAM: &str = "provider";
const TXN_QUERY_PARAM: &str = "txnID";
const INTERACT_REF_QUERY_PARAM: &str = "interact_ref";
const RESPONSE_HASH_QUERY_PARAM: &str = "hash";

/// GNAP authorization server over HTTP.
#[derive(Clone)]
pub struct GnapServer {
    config: Arc<Config>,
    handler: Arc<AuthHandler>,
    interaction: Arc<dyn InteractionHandler>,
    providers: Arc<ProviderCache>,
    transient_store: Arc<dyn TransientStore>,
}

impl GnapServer {
    /// Create a new server builder.
    pub fn builder() -> GnapServerBuilder {
        GnapServerBuilder::default()
    }

    /// Create the axum router with all GNAP and OIDC endpoints.
    pub fn router(&self) -> Router {
        Router::new()
            .route(AUTH_REQUEST_PATH, post(handle_auth))
            .route(AUTH_CONTINUE_PATH, post(handle_continue))
            .route(AUTH_INTROSPECT_PATH, post(handle_introspect))
            .route(INTERACT_PATH, get(handle_interact))
            .route(AUTH_PROVIDERS_PATH, get(handle_providers))
            .route(OIDC_LOGIN_PATH, get(handle_oidc_login))
            .route(OIDC_CALLBACK_PATH, get(handle_oidc_callback))
            .with_state(self.clone())
    }

    /// Introspect a token with this server acting as both AS and RS, for
    /// in-process callers. The only path that skips proof verification.
    pub async fn introspect_internal(
        &self,
        req: &IntrospectRequest,
    ) -> Result<IntrospectResponse> {
        self.handler.handle_introspection(req, &InternalVerifier).await
    }

    fn verifier(&self, path: &str, headers: &HeaderMap, body: Vec<u8>) -> HttpSigVerifier {
        HttpSigVerifier::new(RequestContext {
            method: Method::POST,
            target_uri: format!(
                "{}{}",
                self.config.base_url.as_str().trim_end_matches('/'),
                path
            ),
            headers: headers.clone(),
            body,
        })
    }
}

async fn handle_auth(
    State(server): State<GnapServer>,
    headers: HeaderMap,
    body: std::result::Result<String, StringRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("error reading request body: {}", e);
            return Error::Internal("unreadable request body".to_string()).into_response();
        }
    };

    let req: AuthRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::error!("failed to parse gnap auth request: {}", e);
            return Error::InvalidRequest(e.to_string()).into_response();
        }
    };

    let verifier = server.verifier(AUTH_REQUEST_PATH, &headers, body.into_bytes());

    match server
        .handler
        .handle_access_request(&req, &verifier, None)
        .await
    {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            tracing::error!("failed to handle access request: {}", e);
            e.into_response()
        }
    }
}

async fn handle_continue(
    State(server): State<GnapServer>,
    headers: HeaderMap,
    body: std::result::Result<String, StringRejection>,
) -> Response {
    let Some(token) = gnap_token(&headers) else {
        tracing::error!("GNAP continuation endpoint requires GNAP token");
        return Error::RequestDenied("missing GNAP authorization".to_string()).into_response();
    };

    let body = match body {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("error reading request body: {}", e);
            return Error::Internal("unreadable request body".to_string()).into_response();
        }
    };

    let req: ContinueRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::error!("failed to parse gnap continue request: {}", e);
            return Error::InvalidRequest(e.to_string()).into_response();
        }
    };

    let verifier = server.verifier(AUTH_CONTINUE_PATH, &headers, body.into_bytes());

    match server
        .handler
        .handle_continue_request(&req, &token, &verifier)
        .await
    {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            tracing::error!("failed to handle continue request: {}", e);
            e.into_response()
        }
    }
}

async fn handle_introspect(
    State(server): State<GnapServer>,
    headers: HeaderMap,
    body: std::result::Result<String, StringRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("error reading request body: {}", e);
            return Error::Internal("unreadable request body".to_string()).into_response();
        }
    };

    let req: IntrospectRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::error!("failed to parse gnap introspection request: {}", e);
            return Error::InvalidRequest(e.to_string()).into_response();
        }
    };

    let verifier = server.verifier(AUTH_INTROSPECT_PATH, &headers, body.into_bytes());

    match server.handler.handle_introspection(&req, &verifier).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            tracing::error!("failed to handle introspection request: {}", e);
            e.into_response()
        }
    }
}

// TODO: validate txnID against the transaction store before redirecting.
async fn handle_interact(
    State(server): State<GnapServer>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let txn_id = params.get(TXN_QUERY_PARAM).cloned().unwrap_or_default();

    let redirect = format!(
        "{}/sign-up?{}={}",
        server.config.ui_endpoint.as_str().trim_end_matches('/'),
        TXN_QUERY_PARAM,
        urlencoding::encode(&txn_id)
    );

    Redirect::to(&redirect).into_response()
}

async fn handle_providers(State(server): State<GnapServer>) -> Response {
    Json(server.providers.catalog()).into_response()
}

async fn handle_oidc_login(
    State(server): State<GnapServer>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(provider_id) = params.get(PROVIDER_QUERY_PARAM) else {
        return error_page(StatusCode::BAD_REQUEST, "missing provider");
    };
    let Some(txn_id) = params.get(TXN_QUERY_PARAM) else {
        return error_page(StatusCode::BAD_REQUEST, "missing transaction ID");
    };

    let provider = match server.providers.get(provider_id).await {
        Ok(provider) => provider,
        Err(e) => {
            return error_page(StatusCode::BAD_REQUEST, &format!("get provider: {}", e));
        }
    };

    let state = new_handle();
    let transient = OidcTransient {
        provider_id: provider_id.clone(),
        txn_id: txn_id.clone(),
        expires_at: Utc::now() + Duration::seconds(server.config.transient_ttl_seconds),
    };

    if let Err(e) = server.transient_store.put(&state, transient).await {
        return error_page(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to write state data to transient store: {}", e),
        );
    }

    let redirect = provider.auth_url(&state);
    tracing::debug!("redirecting to: {}", redirect);

    Redirect::to(&redirect).into_response()
}

async fn handle_oidc_callback(
    State(server): State<GnapServer>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(state) = params.get("state") else {
        return error_page(StatusCode::BAD_REQUEST, "missing state");
    };
    let Some(code) = params.get("code") else {
        return error_page(StatusCode::BAD_REQUEST, "missing code");
    };

    let transient = match server.transient_store.consume(state).await {
        Ok(Some(transient)) => transient,
        Ok(None) => {
            return error_page(StatusCode::BAD_REQUEST, "unknown or expired state");
        }
        Err(e) => {
            return error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to get state data from transient store: {}", e),
            );
        }
    };

    let provider = match server.providers.get(&transient.provider_id).await {
        Ok(provider) => provider,
        Err(e) => {
            return error_page(StatusCode::BAD_REQUEST, &format!("get provider: {}", e));
        }
    };

    let claims = match provider.exchange(code).await {
        Ok(claims) => claims,
        Err(e) => {
            return error_page(
                StatusCode::BAD_GATEWAY,
                &format!("failed to exchange oauth2 code for token: {}", e),
            );
        }
    };

    let mut subject_data = HashMap::new();
    subject_data.insert("sub".to_string(), claims.sub);

    let outcome = match server
        .interaction
        .complete_interaction(&transient.txn_id, ConsentResult { subject_data })
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            return error_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("failed to complete GNAP interaction: {}", e),
            );
        }
    };

    let mut client_uri = match Url::parse(&outcome.finish.uri) {
        Ok(uri) => uri,
        Err(e) => {
            return error_page(
                StatusCode::BAD_REQUEST,
                &format!("client provided invalid redirect URI: {}", e),
            );
        }
    };

    client_uri
        .query_pairs_mut()
        .append_pair(INTERACT_REF_QUERY_PARAM, &outcome.interact_ref)
        .append_pair(RESPONSE_HASH_QUERY_PARAM, &outcome.response_hash);

    let html = server
        .config
        .close_popup_html
        .replace("{{redirect_uri}}", client_uri.as_str());

    Html(html).into_response()
}

fn error_page(status: StatusCode, msg: &str) -> Response {
    tracing::error!("{}", msg);
    (status, msg.to_string()).into_response()
}

/// Extract the token from an `Authorization: GNAP <token>` header.
fn gnap_token(headers: &HeaderMap) -> Option<String> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;

    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();

    (scheme == "GNAP" && !token.is_empty()).then(|| token.to_string())
}

/// Builder for [`GnapServer`].
#[derive(Default)]
pub struct GnapServerBuilder {
    config: Option<Config>,
    policy: Option<PolicyConfig>,
    txn_store: Option<Arc<dyn TransactionStore>>,
    token_store: Option<Arc<dyn TokenStore>>,
    transient_store: Option<Arc<dyn TransientStore>>,
    oidc_providers: HashMap<String, ProviderConfig>,
    provider_cache: Option<Arc<ProviderCache>>,
}

impl GnapServerBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn txn_store(mut self, store: Arc<dyn TransactionStore>) -> Self {
        self.txn_store = Some(store);
        self
    }

    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    pub fn transient_store(mut self, store: Arc<dyn TransientStore>) -> Self {
        self.transient_store = Some(store);
        self
    }

    pub fn oidc_providers(mut self, providers: HashMap<String, ProviderConfig>) -> Self {
        self.oidc_providers = providers;
        self
    }

    /// Use a pre-assembled provider cache instead of building one from
    /// configuration.
    pub fn provider_cache(mut self, cache: Arc<ProviderCache>) -> Self {
        self.provider_cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<GnapServer> {
        let config = self
            .config
            .ok_or_else(|| Error::Internal("config required".to_string()))?;
        let txn_store = self
            .txn_store
            .ok_or_else(|| Error::Internal("txn_store required".to_string()))?;
        let token_store = self
            .token_store
            .ok_or_else(|| Error::Internal("token_store required".to_string()))?;
        let transient_store = self
            .transient_store
            .ok_or_else(|| Error::Internal("transient_store required".to_string()))?;

        let interaction: Arc<dyn InteractionHandler> = Arc::new(RedirectInteractionHandler::new(
            &config.base_url,
            txn_store.clone(),
        ));

        let handler = Arc::new(AuthHandler::new(
            config.clone(),
            AccessPolicy::new(self.policy.unwrap_or_default()),
            txn_store,
            token_store,
            interaction.clone(),
        ));

        let callback_url = format!(
            "{}{}",
            config.base_url.as_str().trim_end_matches('/'),
            OIDC_CALLBACK_PATH
        );

        let providers = self.provider_cache.unwrap_or_else(|| {
            Arc::new(ProviderCache::new(
                self.oidc_providers,
                callback_url,
                config.startup_timeout,
            ))
        });

        Ok(GnapServer {
            config: Arc::new(config),
            handler,
            interaction,
            providers,
            transient_store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn gnap_token_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert_eq!(gnap_token(&headers), None);

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc"),
        );
        assert_eq!(gnap_token(&headers), None);

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("GNAP"),
        );
        assert_eq!(gnap_token(&headers), None);

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("GNAP abc123"),
        );
        assert_eq!(gnap_token(&headers).as_deref(), Some("abc123"));

        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("GNAP  abc123"),
        );
        assert_eq!(gnap_token(&headers).as_deref(), Some("abc123"));
    }
}
