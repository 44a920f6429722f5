//! End-to-end grant scenarios over the HTTP adapter: pre-authorized
//! issuance, the interactive consent round-trip, continuation replay,
//! signature tampering, introspection narrowing and token expiry.

mod common;

use common::*;
use gnap_as::interact::response_hash;
use gnap_as::policy::{AccessRule, PolicyConfig};
use gnap_as::server::{
    AUTH_CONTINUE_PATH, AUTH_INTROSPECT_PATH, AUTH_REQUEST_PATH, OIDC_CALLBACK_PATH,
    OIDC_LOGIN_PATH,
};
use http::StatusCode;
use std::collections::HashMap;
use tower::ServiceExt;
use url::Url;

const CLIENT_FINISH_URI: &str = "https://client.example.com/cb";

fn policy_for(client_fp: &str, preauthorized: &[&str], interactive: &[&str]) -> PolicyConfig {
    let mut policy = PolicyConfig::default();
    for right in preauthorized {
        policy.reference_rules.insert(
            right.to_string(),
            AccessRule {
                preauthorized_keys: [client_fp.to_string()].into_iter().collect(),
            },
        );
    }
    for right in interactive {
        policy
            .reference_rules
            .insert(right.to_string(), AccessRule::default());
    }
    policy.sub_id_formats = vec!["opaque".to_string()];
    policy
}

fn auth_body(
    client: &TestClient,
    access: &[&str],
    flags: &[&str],
    finish_nonce: Option<&str>,
) -> String {
    let mut req = serde_json::json!({
        "access_token": {"access": access, "flags": flags},
        "client": {"key": serde_json::to_value(&client.key).unwrap()},
    });

    if let Some(nonce) = finish_nonce {
        req["interact"] = serde_json::json!({
            "start": ["redirect"],
            "finish": {
                "method": "redirect",
                "uri": CLIENT_FINISH_URI,
                "nonce": nonce,
            },
        });
    }

    req.to_string()
}

fn introspect_body(rs: &TestClient, token: &str, access: Option<&[&str]>) -> String {
    let mut req = serde_json::json!({
        "access_token": token,
        "proof": "httpsig",
        "resource_server": {"key": serde_json::to_value(&rs.key).unwrap()},
    });
    if let Some(access) = access {
        req["access"] = serde_json::json!(access);
    }
    req.to_string()
}

fn query_param(url: &str, name: &str) -> String {
    let url = Url::parse(url).unwrap();
    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    params
        .get(name)
        .unwrap_or_else(|| panic!("missing query param {} in {}", name, url))
        .clone()
}

/// Pull the client redirect URI out of the rendered close-popup page.
fn popup_redirect_uri(html: &str) -> String {
    let start = html.find("url=").expect("popup html carries redirect") + "url=".len();
    let end = html[start..].find('"').unwrap();
    html[start..start + end].to_string()
}

#[tokio::test]
async fn preauthorized_grant_issues_bearer_token() {
    let client = TestClient::new();
    let policy = policy_for(&client.fingerprint(), &["read:profile"], &[]);
    let server = build_server(policy, 300, None);
    let app = server.router();

    let body = auth_body(&client, &["read:profile"], &["bearer"], None);
    let headers = client.sign(AUTH_REQUEST_PATH, body.as_bytes(), None);
    let response = app
        .clone()
        .oneshot(post_request(AUTH_REQUEST_PATH, headers, body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;

    assert!(json.get("interact").is_none());
    let token = &json["access_token"][0];
    assert_eq!(token["access"], serde_json::json!(["read:profile"]));
    assert_eq!(token["key"], "bearer");
    assert_eq!(token["expires_in"], 300);
    let value = token["value"].as_str().unwrap();
    assert!(value.len() >= 32);

    // The resource server can introspect the token.
    let rs = TestClient::new();
    let body = introspect_body(&rs, value, None);
    let headers = rs.sign(AUTH_INTROSPECT_PATH, body.as_bytes(), None);
    let response = app
        .oneshot(post_request(AUTH_INTROSPECT_PATH, headers, body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["active"], true);
    assert_eq!(json["access"], serde_json::json!(["read:profile"]));
}

#[tokio::test]
async fn interactive_grant_round_trip() {
    let client = TestClient::new();
    let policy = policy_for(&client.fingerprint(), &["read:profile"], &["write:vault"]);
    let cache = stub_provider_cache("test-idp", "alice").await;
    let server = build_server(policy, 300, Some(cache));
    let app = server.router();

    let client_nonce = "VJLO6A4CAYLBXHTR0KRO";
    let body = auth_body(
        &client,
        &["read:profile", "write:vault"],
        &[],
        Some(client_nonce),
    );
    let headers = client.sign(AUTH_REQUEST_PATH, body.as_bytes(), None);
    let response = app
        .clone()
        .oneshot(post_request(AUTH_REQUEST_PATH, headers, body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;

    // No tokens yet; the client is pointed at the interact endpoint.
    assert!(json.get("access_token").is_none());
    let redirect = json["interact"]["redirect"].as_str().unwrap();
    assert!(redirect.starts_with("https://as.example.com/gnap/interact?txnID="));
    let as_nonce = json["interact"]["finish"].as_str().unwrap().to_string();
    let continue_token = json["continue"]["access_token"]["value"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(json["continue"]["uri"], "https://as.example.com/gnap/continue");

    let txn_id = query_param(redirect, "txnID");

    // Resource owner picks a provider and signs in.
    let response = app
        .clone()
        .oneshot(get_request(&format!(
            "{}?provider=test-idp&txnID={}",
            OIDC_LOGIN_PATH, txn_id
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response
        .headers()
        .get(http::header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let state = query_param(&location, "state");

    // Provider calls back; the popup page carries the client redirect.
    let response = app
        .clone()
        .oneshot(get_request(&format!(
            "{}?state={}&code=dummy-code",
            OIDC_CALLBACK_PATH, state
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = String::from_utf8(body_bytes(response).await).unwrap();

    let client_redirect = popup_redirect_uri(&html);
    assert!(client_redirect.starts_with(CLIENT_FINISH_URI));
    let interact_ref = query_param(&client_redirect, "interact_ref");
    let hash = query_param(&client_redirect, "hash");

    // The anti-phishing hash binds both nonces, the ref and the finish URI.
    assert_eq!(
        hash,
        response_hash(client_nonce, &as_nonce, &interact_ref, CLIENT_FINISH_URI)
    );

    // Continuation with the interact_ref yields tokens and the subject.
    let body = serde_json::json!({"interact_ref": interact_ref}).to_string();
    let authz = format!("GNAP {}", continue_token);
    let headers = client.sign(AUTH_CONTINUE_PATH, body.as_bytes(), Some(&authz));
    let response = app
        .clone()
        .oneshot(post_request(AUTH_CONTINUE_PATH, headers, body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;

    let token = &json["access_token"][0];
    assert_eq!(token["key"], "httpsig");
    let granted = token["access"].as_array().unwrap();
    assert!(granted.contains(&serde_json::json!("read:profile")));
    assert!(granted.contains(&serde_json::json!("write:vault")));

    assert_eq!(
        json["subject"]["sub_ids"],
        serde_json::json!([{"id": "alice", "format": "opaque"}])
    );

    // Replaying the continuation is refused and issues nothing new.
    let body = serde_json::json!({"interact_ref": interact_ref}).to_string();
    let headers = client.sign(AUTH_CONTINUE_PATH, body.as_bytes(), Some(&authz));
    let response = app
        .oneshot(post_request(AUTH_CONTINUE_PATH, headers, body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"], "request_denied");
}

#[tokio::test]
async fn tampered_signature_is_denied() {
    let client = TestClient::new();
    let policy = policy_for(&client.fingerprint(), &["read:profile"], &[]);
    let server = build_server(policy, 300, None);
    let app = server.router();

    let body = auth_body(&client, &["read:profile"], &["bearer"], None);
    let headers = client.sign(AUTH_REQUEST_PATH, body.as_bytes(), None);

    // Body modified after signing
    let tampered = format!("{} ", body);
    let response = app
        .oneshot(post_request(AUTH_REQUEST_PATH, headers, tampered))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"], "request_denied");
}

#[tokio::test]
async fn introspection_narrows_by_access_subset() {
    let client = TestClient::new();
    let policy = policy_for(&client.fingerprint(), &["a", "b"], &[]);
    let server = build_server(policy, 300, None);
    let app = server.router();

    let body = auth_body(&client, &["a", "b"], &["bearer"], None);
    let headers = client.sign(AUTH_REQUEST_PATH, body.as_bytes(), None);
    let response = app
        .clone()
        .oneshot(post_request(AUTH_REQUEST_PATH, headers, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let value = json["access_token"][0]["value"].as_str().unwrap().to_string();

    let rs = TestClient::new();

    let body = introspect_body(&rs, &value, Some(&["a"]));
    let headers = rs.sign(AUTH_INTROSPECT_PATH, body.as_bytes(), None);
    let response = app
        .clone()
        .oneshot(post_request(AUTH_INTROSPECT_PATH, headers, body))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["active"], true);

    let body = introspect_body(&rs, &value, Some(&["c"]));
    let headers = rs.sign(AUTH_INTROSPECT_PATH, body.as_bytes(), None);
    let response = app
        .oneshot(post_request(AUTH_INTROSPECT_PATH, headers, body))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["active"], false);
}

#[tokio::test]
async fn expired_token_introspects_inactive() {
    let client = TestClient::new();
    let policy = policy_for(&client.fingerprint(), &["read:profile"], &[]);
    let server = build_server(policy, 1, None);
    let app = server.router();

    let body = auth_body(&client, &["read:profile"], &["bearer"], None);
    let headers = client.sign(AUTH_REQUEST_PATH, body.as_bytes(), None);
    let response = app
        .clone()
        .oneshot(post_request(AUTH_REQUEST_PATH, headers, body))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["access_token"][0]["expires_in"], 1);
    let value = json["access_token"][0]["value"].as_str().unwrap().to_string();

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let rs = TestClient::new();
    let body = introspect_body(&rs, &value, None);
    let headers = rs.sign(AUTH_INTROSPECT_PATH, body.as_bytes(), None);
    let response = app
        .oneshot(post_request(AUTH_INTROSPECT_PATH, headers, body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["active"], false);
}
