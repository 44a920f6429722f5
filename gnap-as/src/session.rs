use crate::gnap::{ClientKey, RequestFinish, TokenAccess, TokenRequest};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a grant transaction.
pub type TxnId = String;

/// State of a grant transaction through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    /// Interaction offered to the client, awaiting resource owner consent
    AwaitingInteraction,
    /// Consent collected, awaiting the client's continuation call
    ReadyToContinue,
    /// Tokens issued
    Issued,
    /// Policy refused the grant
    Denied,
    /// TTL elapsed
    Expired,
}

/// Server-side record of one in-flight grant.
///
/// A transaction is referenced by several independently unguessable handles
/// (`txn_id`, `request_handle`, `continue_token`, `interact_ref`); the
/// secondary handles rotate on every state transition that discloses them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantTransaction {
    /// Primary key
    pub txn_id: TxnId,

    /// Handle named in continuation requests, rotated on each continue
    pub request_handle: String,

    /// Bearer value for `Authorization: GNAP <token>` on continuation,
    /// bound to `client_key`
    pub continue_token: String,

    /// The requester's key, immutable once bound
    pub client_key: ClientKey,

    /// The token requests exactly as the client sent them
    pub token_requests: Vec<TokenRequest>,

    /// Union of all requested access descriptors
    pub requested_access: Vec<TokenAccess>,

    /// Subset granted by policy, grows as interactions complete
    pub authorized_access: Vec<TokenAccess>,

    /// Subset awaiting resource owner consent
    pub pending_access: Vec<TokenAccess>,

    pub state: TxnState,

    /// Client-supplied finish spec (`method`, `uri`, client nonce)
    pub finish: Option<RequestFinish>,

    /// AS-side finish nonce, folded into the response hash
    pub finish_nonce: Option<String>,

    /// One-shot handle proving the resource owner completed consent
    pub interact_ref: Option<String>,

    /// Claims gathered during interaction (e.g. `sub`)
    pub subject_data: HashMap<String, String>,

    /// Subject ID formats policy allows this server to disclose
    pub sub_id_formats: Vec<String>,

    /// Stable client instance identifier (the key fingerprint)
    pub instance_id: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Optimistic-concurrency counter, bumped by every store update
    pub revision: u64,
}

impl GrantTransaction {
    pub fn new(
        client_key: ClientKey,
        token_requests: Vec<TokenRequest>,
        instance_id: String,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();

        let mut requested_access = Vec::new();
        for request in &token_requests {
            for access in &request.access {
                if !requested_access.contains(access) {
                    requested_access.push(access.clone());
                }
            }
        }

        Self {
            txn_id: new_handle(),
            request_handle: new_handle(),
            continue_token: new_handle(),
            client_key,
            token_requests,
            requested_access,
            authorized_access: Vec::new(),
            pending_access: Vec::new(),
            state: TxnState::AwaitingInteraction,
            finish: None,
            finish_nonce: None,
            interact_ref: None,
            subject_data: HashMap::new(),
            sub_id_formats: Vec::new(),
            instance_id,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            revision: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.state == TxnState::Expired || self.expires_at <= Utc::now()
    }

    /// Mint a fresh `continue_token` and `request_handle`. The store's
    /// update drops the indexes for the previous values in the same
    /// critical section, invalidating them atomically.
    pub fn rotate_handles(&mut self) {
        self.request_handle = new_handle();
        self.continue_token = new_handle();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Generate an opaque handle: 32 random bytes, hex-encoded.
pub fn new_handle() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.r#gen();
    hex::encode(bytes)
}
