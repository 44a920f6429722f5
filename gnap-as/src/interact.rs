//! Resource owner interaction, redirect mode.
//!
//! `prepare_interaction` points the client's browser at this server's
//! interact endpoint; `complete_interaction` runs after the identity
//! provider callback and produces the one-shot `interact_ref` plus the
//! response hash the client uses to confirm the redirect is genuine.

use crate::error::{Error, Result};
use crate::gnap::{RequestFinish, ResponseInteract};
use crate::session::{GrantTransaction, TxnState, new_handle};
use crate::store::TransactionStore;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

/// What the identity provider learned about the resource owner.
#[derive(Debug, Clone, Default)]
pub struct ConsentResult {
    pub subject_data: HashMap<String, String>,
}

/// Result of a completed interaction.
#[derive(Debug, Clone)]
pub struct InteractionOutcome {
    pub interact_ref: String,
    pub response_hash: String,
    /// The client's finish spec, for building the redirect back
    pub finish: RequestFinish,
}

/// Drives the user-facing consent round-trip.
#[async_trait]
pub trait InteractionHandler: Send + Sync {
    /// Stamp fresh interaction handles onto `txn` and produce the
    /// interaction block for the response. The caller persists `txn`.
    async fn prepare_interaction(&self, txn: &mut GrantTransaction) -> Result<ResponseInteract>;

    /// Complete consent for `txn_id`: merge subject data, promote pending
    /// access, mint the one-shot `interact_ref` and compute the response
    /// hash. Advances the transaction to `ready_to_continue`.
    async fn complete_interaction(
        &self,
        txn_id: &str,
        consent: ConsentResult,
    ) -> Result<InteractionOutcome>;
}

/// Interaction over browser redirects, the only start mode this server
/// implements.
pub struct RedirectInteractionHandler {
    interact_uri: String,
    txn_store: Arc<dyn TransactionStore>,
}

impl RedirectInteractionHandler {
    pub fn new(base_url: &Url, txn_store: Arc<dyn TransactionStore>) -> Self {
        Self {
            interact_uri: format!(
                "{}{}",
                base_url.as_str().trim_end_matches('/'),
                crate::server::INTERACT_PATH
            ),
            txn_store,
        }
    }
}

#[async_trait]
impl InteractionHandler for RedirectInteractionHandler {
    async fn prepare_interaction(&self, txn: &mut GrantTransaction) -> Result<ResponseInteract> {
        let finish_nonce = new_handle();

        let redirect = format!(
            "{}?txnID={}",
            self.interact_uri,
            urlencoding::encode(&txn.txn_id)
        );

        txn.finish_nonce = Some(finish_nonce.clone());
        txn.touch();

        tracing::debug!("prepared interaction for txn {}", txn.txn_id);

        Ok(ResponseInteract {
            redirect,
            finish: finish_nonce,
        })
    }

    async fn complete_interaction(
        &self,
        txn_id: &str,
        consent: ConsentResult,
    ) -> Result<InteractionOutcome> {
        let mut txn = self
            .txn_store
            .by_id(txn_id)
            .await?
            .ok_or(Error::UnknownTxn)?;

        if txn.is_expired() {
            return Err(Error::InteractionExpired);
        }

        if txn.state != TxnState::AwaitingInteraction {
            return Err(Error::WrongState);
        }

        let finish = txn.finish.clone().ok_or(Error::WrongState)?;
        let finish_nonce = txn.finish_nonce.clone().ok_or(Error::WrongState)?;

        txn.subject_data.extend(consent.subject_data);

        // Consent covers everything that was pending.
        let pending = std::mem::take(&mut txn.pending_access);
        for access in pending {
            if !txn.authorized_access.contains(&access) {
                txn.authorized_access.push(access);
            }
        }

        let interact_ref = new_handle();
        let response_hash =
            response_hash(&finish.nonce, &finish_nonce, &interact_ref, &finish.uri);

        txn.interact_ref = Some(interact_ref.clone());
        txn.state = TxnState::ReadyToContinue;
        txn.touch();

        self.txn_store.update(txn).await?;

        tracing::info!("interaction complete for txn {}", txn_id);

        Ok(InteractionOutcome {
            interact_ref,
            response_hash,
            finish,
        })
    }
}

/// GNAP section 4.2.3 response hash:
/// `BASE64URL(SHA-256(client_nonce LF as_nonce LF interact_ref LF finish_uri))`
/// without padding.
pub fn response_hash(
    client_nonce: &str,
    as_nonce: &str,
    interact_ref: &str,
    finish_uri: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_nonce.as_bytes());
    hasher.update(b"\n");
    hasher.update(as_nonce.as_bytes());
    hasher.update(b"\n");
    hasher.update(interact_ref.as_bytes());
    hasher.update(b"\n");
    hasher.update(finish_uri.as_bytes());

    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
