use crate::gnap::ClientKey;
use std::collections::HashMap;
use url::Url;

/// Fallback page served at the end of the consent popup. The
/// `{{redirect_uri}}` placeholder receives the client's finish URI with
/// `interact_ref` and `hash` appended.
pub const DEFAULT_CLOSE_POPUP_HTML: &str = r#"<!DOCTYPE html>
<html>
  <head><meta http-equiv="refresh" content="0;url={{redirect_uri}}"></head>
  <body><script>window.location.replace("{{redirect_uri}}");</script></body>
</html>
"#;

/// Configuration for the authorization server core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Public HTTPS address of this server
    pub base_url: Url,

    /// Base address of the consent UI the interact endpoint redirects to
    pub ui_endpoint: Url,

    /// HTML rendered when the OIDC popup closes, with a `{{redirect_uri}}`
    /// placeholder
    pub close_popup_html: String,

    /// Access token lifetime in seconds (default: 300)
    pub token_expiry_seconds: i64,

    /// Grant transaction lifetime in seconds (default: 900)
    pub txn_ttl_seconds: i64,

    /// OIDC state record lifetime in seconds (default: 600, must stay short)
    pub transient_ttl_seconds: i64,

    /// Suggested client polling interval for continuation, in seconds
    pub continue_wait_seconds: u32,

    /// Attempts when connecting to an identity provider at first use
    pub startup_timeout: u64,

    /// Keys for clients that identify themselves by instance reference.
    /// Unregistered references are denied.
    pub client_key_registry: HashMap<String, ClientKey>,
}

impl Config {
    /// Create a new configuration with sensible defaults
    pub fn new(base_url: Url) -> Self {
        Self {
            ui_endpoint: base_url.clone(),
            base_url,
            close_popup_html: DEFAULT_CLOSE_POPUP_HTML.to_string(),
            token_expiry_seconds: 300,
            txn_ttl_seconds: 900,
            transient_ttl_seconds: 600,
            continue_wait_seconds: 5,
            startup_timeout: 30,
            client_key_registry: HashMap::new(),
        }
    }

    /// Set the consent UI base address
    pub fn with_ui_endpoint(mut self, ui_endpoint: Url) -> Self {
        self.ui_endpoint = ui_endpoint;
        self
    }

    /// Set the close-popup HTML template
    pub fn with_close_popup_html(mut self, html: impl Into<String>) -> Self {
        self.close_popup_html = html.into();
        self
    }

    /// Set access token expiry in seconds
    pub fn with_token_expiry(mut self, seconds: i64) -> Self {
        self.token_expiry_seconds = seconds;
        self
    }

    /// Set grant transaction TTL in seconds
    pub fn with_txn_ttl(mut self, seconds: i64) -> Self {
        self.txn_ttl_seconds = seconds;
        self
    }

    /// Set provider startup retry budget
    pub fn with_startup_timeout(mut self, attempts: u64) -> Self {
        self.startup_timeout = attempts;
        self
    }

    /// Register the key a client instance reference resolves to
    pub fn with_registered_client(mut self, reference: impl Into<String>, key: ClientKey) -> Self {
        self.client_key_registry.insert(reference.into(), key);
        self
    }
}
