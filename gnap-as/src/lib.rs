//! # gnap-as
//!
//! A GNAP (Grant Negotiation and Authorization Protocol,
//! draft-ietf-gnap-core-protocol-09) authorization server core.
//!
//! This crate implements the GNAP request state machine: it validates grant
//! requests and their HTTP message signature proofs, partitions requested
//! access into pre-authorized and consent-requiring rights, carries the
//! transaction across the identity-provider consent round-trip, and issues
//! access tokens a resource server can introspect.
//!
//! ## Features
//!
//! - **Grant state machine**: auth request, crypto-bound continuation and
//!   introspection endpoints
//! - **HTTP message signatures**: `httpsig` key proofing with body digest
//!   checks
//! - **Policy-driven authorization**: per-right catalog with key
//!   pre-authorization
//! - **Redirect interaction**: consent via configured OIDC providers, with
//!   GNAP response-hash protection on the way back
//! - **Pluggable storage**: abstract traits for transactions, tokens and
//!   OIDC transients, with in-memory implementations
//!
//! ## Example
//!
//! ```rust,no_run
//! use gnap_as::prelude::*;
//! use std::sync::Arc;
//!
//! # fn example() -> gnap_as::error::Result<()> {
//! let config = Config::new("https://auth.example.com".parse().unwrap());
//!
//! let server = GnapServer::builder()
//!     .config(config)
//!     .txn_store(Arc::new(MemoryTransactionStore::new()))
//!     .token_store(Arc::new(MemoryTokenStore::new()))
//!     .transient_store(Arc::new(MemoryTransientStore::new()))
//!     .build()?;
//!
//! let app = server.router();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod gnap;
pub mod handler;
pub mod interact;
pub mod oidc;
pub mod policy;
pub mod proof;
pub mod server;
pub mod session;
pub mod store;

pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::gnap::{
        AccessFlag, AccessToken, AuthRequest, AuthResponse, ClientKey, ContinueRequest,
        IntrospectRequest, IntrospectResponse, Jwk, RequestClient, TokenAccess, TokenRequest,
    };
    pub use crate::handler::AuthHandler;
    pub use crate::interact::{InteractionHandler, RedirectInteractionHandler};
    pub use crate::oidc::{OidcProvider, ProviderCache, ProviderConfig};
    pub use crate::policy::{AccessPolicy, AccessRule, PolicyConfig};
    pub use crate::proof::{HttpSigVerifier, RequestContext, RequestVerifier};
    pub use crate::server::{GnapServer, GnapServerBuilder};
    pub use crate::session::{GrantTransaction, TxnState};
    pub use crate::store::{
        MemoryTokenStore, MemoryTransactionStore, MemoryTransientStore, TokenStore,
        TransactionStore, TransientStore,
    };
}
