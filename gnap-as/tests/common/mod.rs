#![allow(dead_code)]

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::Utc;
use gnap_as::config::Config;
use gnap_as::error::Result;
use gnap_as::gnap::{ClientKey, Jwk};
use gnap_as::oidc::{IdClaims, OidcProvider, ProviderCache};
use gnap_as::policy::PolicyConfig;
use gnap_as::server::GnapServer;
use gnap_as::store::{MemoryTokenStore, MemoryTransactionStore, MemoryTransientStore};
use http::{HeaderMap, HeaderValue};
use p256::ecdsa::SigningKey;
use p256::ecdsa::signature::Signer;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use url::Url;

pub const AS_BASE: &str = "https://as.example.com";

/// A GNAP client (or resource server) with an httpsig signing key.
pub struct TestClient {
    signing_key: SigningKey,
    pub key: ClientKey,
}

impl TestClient {
    pub fn new() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let point = signing_key.verifying_key().to_encoded_point(false);

        let key = ClientKey {
            proof: "httpsig".to_string(),
            jwk: Jwk {
                kty: "EC".to_string(),
                crv: Some("P-256".to_string()),
                x: Some(URL_SAFE_NO_PAD.encode(point.x().unwrap())),
                y: Some(URL_SAFE_NO_PAD.encode(point.y().unwrap())),
                n: None,
                e: None,
                alg: None,
                kid: None,
            },
        };

        Self { signing_key, key }
    }

    pub fn fingerprint(&self) -> String {
        self.key.jwk.fingerprint().unwrap()
    }

    /// Produce the signature headers for a POST of `body` to `path`.
    pub fn sign(&self, path: &str, body: &[u8], authorization: Option<&str>) -> HeaderMap {
        let target_uri = format!("{}{}", AS_BASE, path);
        let mut headers = HeaderMap::new();

        let digest = format!("sha-256=:{}:", STANDARD.encode(Sha256::digest(body)));
        headers.insert("content-digest", HeaderValue::from_str(&digest).unwrap());

        let mut components = vec!["@method", "@target-uri", "content-digest"];
        if let Some(authz) = authorization {
            headers.insert(
                http::header::AUTHORIZATION,
                HeaderValue::from_str(authz).unwrap(),
            );
            components.push("authorization");
        }

        let quoted: Vec<String> = components.iter().map(|c| format!("\"{}\"", c)).collect();
        let params = format!(
            "({});created={};keyid=\"{}\";alg=\"ecdsa-p256-sha256\"",
            quoted.join(" "),
            Utc::now().timestamp(),
            self.fingerprint(),
        );

        let mut base = String::new();
        for component in &components {
            let value = match *component {
                "@method" => "POST".to_string(),
                "@target-uri" => target_uri.clone(),
                name => headers.get(name).unwrap().to_str().unwrap().to_string(),
            };
            base.push_str(&format!("\"{}\": {}\n", component, value));
        }
        base.push_str(&format!("\"@signature-params\": {}", params));

        let signature: p256::ecdsa::Signature = self.signing_key.sign(base.as_bytes());

        headers.insert(
            "signature-input",
            HeaderValue::from_str(&format!("sig1={}", params)).unwrap(),
        );
        headers.insert(
            "signature",
            HeaderValue::from_str(&format!("sig1=:{}:", STANDARD.encode(signature.to_bytes())))
                .unwrap(),
        );

        headers
    }
}

/// Identity provider stub that consents as a fixed subject.
pub struct StubIdp {
    pub sub: String,
}

#[async_trait::async_trait]
impl OidcProvider for StubIdp {
    fn auth_url(&self, state: &str) -> String {
        format!("https://idp.example.com/authorize?state={}", state)
    }

    async fn exchange(&self, _code: &str) -> Result<IdClaims> {
        Ok(IdClaims {
            sub: self.sub.clone(),
        })
    }
}

pub fn build_server(
    policy: PolicyConfig,
    token_expiry: i64,
    provider_cache: Option<Arc<ProviderCache>>,
) -> GnapServer {
    let config = Config::new(Url::parse(AS_BASE).unwrap()).with_token_expiry(token_expiry);

    let mut builder = GnapServer::builder()
        .config(config)
        .policy(policy)
        .txn_store(Arc::new(MemoryTransactionStore::new()))
        .token_store(Arc::new(MemoryTokenStore::new()))
        .transient_store(Arc::new(MemoryTransientStore::new()));

    if let Some(cache) = provider_cache {
        builder = builder.provider_cache(cache);
    }

    builder.build().unwrap()
}

/// A provider cache holding only the consent stub.
pub async fn stub_provider_cache(provider_id: &str, sub: &str) -> Arc<ProviderCache> {
    let cache = Arc::new(ProviderCache::new(
        Default::default(),
        format!("{}/oidc/callback", AS_BASE),
        1,
    ));
    cache
        .preload(
            provider_id,
            Arc::new(StubIdp {
                sub: sub.to_string(),
            }),
        )
        .await;
    cache
}

pub fn post_request(
    path: &str,
    headers: HeaderMap,
    body: String,
) -> http::Request<axum::body::Body> {
    let mut request = http::Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body))
        .unwrap();
    request.headers_mut().extend(headers);
    request
}

pub fn get_request(uri: &str) -> http::Request<axum::body::Body> {
    http::Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    use http_body_util::BodyExt;
    BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
