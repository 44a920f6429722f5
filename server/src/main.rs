use gnap_as::config::Config;
use gnap_as::oidc::ProviderConfig;
use gnap_as::policy::PolicyConfig;
use gnap_as::server::GnapServer;
use gnap_as::store::{MemoryTokenStore, MemoryTransactionStore, MemoryTransientStore};
use miette::{IntoDiagnostic, Result, miette};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

fn load_json_file<T: serde::de::DeserializeOwned + Default>(var: &str) -> Result<T> {
    match std::env::var(var) {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path).into_diagnostic()?;
            serde_json::from_str(&raw).into_diagnostic()
        }
        Err(_) => Ok(T::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let base_url =
        std::env::var("GNAP_BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let base_url = Url::parse(&base_url).into_diagnostic()?;

    let ui_endpoint = match std::env::var("GNAP_UI_ENDPOINT") {
        Ok(ui) => Url::parse(&ui).into_diagnostic()?,
        Err(_) => base_url.clone(),
    };

    let listen = std::env::var("GNAP_LISTEN").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let mut config = Config::new(base_url).with_ui_endpoint(ui_endpoint);

    if let Ok(path) = std::env::var("GNAP_CLOSE_POPUP_HTML") {
        config = config.with_close_popup_html(std::fs::read_to_string(path).into_diagnostic()?);
    }

    if let Ok(expiry) = std::env::var("GNAP_TOKEN_EXPIRY_SECONDS") {
        config = config.with_token_expiry(expiry.parse().into_diagnostic()?);
    }

    let policy: PolicyConfig = load_json_file("GNAP_POLICY_FILE")?;
    let providers: HashMap<String, ProviderConfig> = load_json_file("GNAP_OIDC_PROVIDERS_FILE")?;

    let server = GnapServer::builder()
        .config(config)
        .policy(policy)
        .txn_store(Arc::new(MemoryTransactionStore::new()))
        .token_store(Arc::new(MemoryTokenStore::new()))
        .transient_store(Arc::new(MemoryTransientStore::new()))
        .oidc_providers(providers)
        .build()
        .map_err(|e| miette!("failed to build GNAP server: {}", e))?;

    let app = server.router();

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .into_diagnostic()?;

    tracing::info!("GNAP authorization server listening on {}", listen);

    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}
