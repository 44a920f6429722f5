//! The grant request state machine.
//!
//! Composes the proof verifier, access policy, interaction handler and
//! stores into the three GNAP entry points: access request, continuation
//! and introspection.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gnap::{
    AccessFlag, AccessToken, AuthRequest, AuthResponse, ClientKey, ContinueRequest,
    IntrospectRequest, IntrospectResponse, RequestClient, ResponseContinue, Subject, SubjectId,
    TokenAccess,
};
use crate::interact::InteractionHandler;
use crate::policy::AccessPolicy;
use crate::proof::RequestVerifier;
use crate::session::{GrantTransaction, TxnState, new_handle};
use crate::store::{StoredToken, TokenStore, TransactionStore};
use chrono::{Duration, Utc};
use std::sync::Arc;

const STORE_RETRY_ATTEMPTS: u32 = 3;
const STORE_RETRY_BASE_MILLIS: u64 = 50;

pub struct AuthHandler {
    config: Config,
    policy: AccessPolicy,
    txn_store: Arc<dyn TransactionStore>,
    token_store: Arc<dyn TokenStore>,
    interaction: Arc<dyn InteractionHandler>,
    continue_uri: String,
}

impl AuthHandler {
    pub fn new(
        config: Config,
        policy: AccessPolicy,
        txn_store: Arc<dyn TransactionStore>,
        token_store: Arc<dyn TokenStore>,
        interaction: Arc<dyn InteractionHandler>,
    ) -> Self {
        let continue_uri = format!(
            "{}{}",
            config.base_url.as_str().trim_end_matches('/'),
            crate::server::AUTH_CONTINUE_PATH
        );

        Self {
            config,
            policy,
            txn_store,
            token_store,
            interaction,
            continue_uri,
        }
    }

    /// Handle a grant request. A `continue_token` resumes an existing
    /// transaction with an additional request; otherwise a new transaction
    /// is started.
    pub async fn handle_access_request(
        &self,
        req: &AuthRequest,
        verifier: &dyn RequestVerifier,
        continue_token: Option<&str>,
    ) -> Result<AuthResponse> {
        let prior = match continue_token.filter(|token| !token.is_empty()) {
            Some(token) => Some(self.live_txn_by_continue_token(token).await?),
            None => None,
        };
        let is_new = prior.is_none();

        let client_key = match &prior {
            Some(txn) => txn.client_key.clone(),
            None => self.resolve_client_key(req.client.as_ref())?,
        };

        verifier.verify(Some(&client_key))?;

        let fingerprint = client_key.jwk.fingerprint()?;

        if req.access_token.iter().all(|t| t.access.is_empty()) {
            return Err(Error::InvalidRequest("no access requested".to_string()));
        }

        let requested: Vec<TokenAccess> = req
            .access_token
            .iter()
            .flat_map(|t| t.access.iter().cloned())
            .collect();

        let partition = self.policy.partition(&requested, Some(&fingerprint));

        if !partition.denied.is_empty() {
            tracing::info!(
                "denying grant request: {} of {} rights not grantable",
                partition.denied.len(),
                requested.len()
            );

            if let Some(mut txn) = prior {
                txn.state = TxnState::Denied;
                txn.touch();
                let _ = self.txn_store.update(txn).await;
            }

            return Err(Error::RequestDenied(
                "requested access not grantable".to_string(),
            ));
        }

        let mut txn = match prior {
            Some(mut txn) => {
                for request in &req.access_token {
                    txn.token_requests.push(request.clone());
                }
                for access in &requested {
                    if !txn.requested_access.contains(access) {
                        txn.requested_access.push(access.clone());
                    }
                }
                for access in partition.authorized {
                    if !txn.authorized_access.contains(&access) {
                        txn.authorized_access.push(access);
                    }
                }
                // Consent already requested for earlier rights stays
                // outstanding; the new call's pending rights join it.
                let mut pending = std::mem::take(&mut txn.pending_access);
                for access in partition.pending {
                    if !pending.contains(&access) {
                        pending.push(access);
                    }
                }
                txn.pending_access = pending
                    .into_iter()
                    .filter(|access| !txn.authorized_access.contains(access))
                    .collect();
                txn.rotate_handles();
                txn
            }
            None => {
                let mut txn = GrantTransaction::new(
                    client_key,
                    req.access_token.clone(),
                    fingerprint,
                    Duration::seconds(self.config.txn_ttl_seconds),
                );
                txn.authorized_access = partition.authorized;
                txn.pending_access = partition.pending;
                txn
            }
        };

        txn.sub_id_formats = self.policy.sub_id_formats().to_vec();

        if txn.pending_access.is_empty() {
            return self.issue_and_respond(txn, is_new).await;
        }

        // Interaction is needed; the client must have offered a redirect
        // with a finish spec we can hash against.
        let interact = req
            .interact
            .as_ref()
            .ok_or_else(|| Error::RequestDenied("interaction required".to_string()))?;

        if !interact.start.iter().any(|mode| mode == "redirect") {
            return Err(Error::RequestDenied(
                "no supported interaction start mode".to_string(),
            ));
        }

        let finish = interact
            .finish
            .clone()
            .ok_or_else(|| Error::RequestDenied("interaction finish required".to_string()))?;
        if finish.method != "redirect" {
            return Err(Error::RequestDenied(format!(
                "unsupported finish method: {}",
                finish.method
            )));
        }

        txn.finish = Some(finish);
        txn.state = TxnState::AwaitingInteraction;

        let interact_response = self.interaction.prepare_interaction(&mut txn).await?;

        let continue_block = self.continue_block(&txn);
        let instance_id = txn.instance_id.clone();

        if is_new {
            self.txn_store.create(txn).await?;
        } else {
            self.txn_store.update(txn).await?;
        }

        Ok(AuthResponse {
            continue_: Some(continue_block),
            interact: Some(interact_response),
            instance_id: Some(instance_id),
            ..AuthResponse::default()
        })
    }

    /// Handle a continuation request after consent.
    pub async fn handle_continue_request(
        &self,
        req: &ContinueRequest,
        continue_token: &str,
        verifier: &dyn RequestVerifier,
    ) -> Result<AuthResponse> {
        let mut txn = self.live_txn_by_continue_token(continue_token).await?;

        verifier.verify(Some(&txn.client_key))?;

        if req.interact_ref.is_empty() {
            return Err(Error::RequestDenied("missing interact_ref".to_string()));
        }
        if txn.interact_ref.as_deref() != Some(req.interact_ref.as_str()) {
            return Err(Error::RequestDenied("unknown interact_ref".to_string()));
        }
        if txn.state != TxnState::ReadyToContinue {
            return Err(Error::WrongState);
        }
        if !txn.pending_access.is_empty() {
            return Err(Error::WrongState);
        }

        txn.interact_ref = None;
        txn.rotate_handles();
        txn.state = TxnState::Issued;
        txn.touch();

        let minted = self.mint_tokens(&txn)?;

        // The compare-and-swap consumes the interact_ref: of two racing
        // continuations at most one update lands, and the loser never sees
        // a token value.
        let txn = self.txn_store.update(txn).await.map_err(|e| match e {
            Error::StoreConflict | Error::UnknownTxn => {
                Error::RequestDenied("continuation no longer valid".to_string())
            }
            other => other,
        })?;

        self.commit_tokens(&minted).await?;

        tracing::info!("issued {} token(s) for txn {}", minted.len(), txn.txn_id);

        Ok(AuthResponse {
            continue_: Some(self.continue_block(&txn)),
            access_token: minted.into_iter().map(|stored| stored.token).collect(),
            instance_id: Some(txn.instance_id.clone()),
            subject: self.subject_for(&txn),
            ..AuthResponse::default()
        })
    }

    /// Handle a resource server's token introspection request.
    pub async fn handle_introspection(
        &self,
        req: &IntrospectRequest,
        verifier: &dyn RequestVerifier,
    ) -> Result<IntrospectResponse> {
        let rs_key = match &req.resource_server {
            Some(client) => Some(self.resolve_rs_key(client)?),
            None => None,
        };

        if let (Some(proof), Some(key)) = (&req.proof, &rs_key) {
            if *proof != key.proof {
                return Err(Error::RequestDenied(
                    "proof method does not match key".to_string(),
                ));
            }
        }

        verifier.verify(rs_key.as_ref())?;

        let Some(stored) = self.token_store.get(&req.access_token).await? else {
            return Ok(IntrospectResponse::inactive());
        };

        if !req.access.is_empty()
            && !req
                .access
                .iter()
                .all(|access| stored.token.access.contains(access))
        {
            return Ok(IntrospectResponse::inactive());
        }

        Ok(IntrospectResponse {
            active: true,
            access: stored.token.access,
            key: stored.client_key,
            flags: stored.token.flags,
            subject_data: stored.subject_data,
        })
    }

    /// Drop a transaction and every non-durable token it issued.
    pub async fn expire_transaction(&self, txn_id: &str) -> Result<()> {
        self.token_store.delete_for_txn(txn_id).await?;
        self.txn_store.delete(txn_id).await
    }

    async fn issue_and_respond(&self, mut txn: GrantTransaction, is_new: bool) -> Result<AuthResponse> {
        txn.state = TxnState::Issued;
        txn.touch();

        let minted = self.mint_tokens(&txn)?;

        let txn = if is_new {
            self.txn_store.create(txn.clone()).await?;
            txn
        } else {
            self.txn_store.update(txn).await?
        };

        self.commit_tokens(&minted).await?;

        tracing::info!("issued {} token(s) for txn {}", minted.len(), txn.txn_id);

        Ok(AuthResponse {
            access_token: minted.into_iter().map(|stored| stored.token).collect(),
            instance_id: Some(txn.instance_id.clone()),
            subject: self.subject_for(&txn),
            ..AuthResponse::default()
        })
    }

    /// Build the stored tokens for a transaction's authorized access. Values
    /// only reach the client after [`Self::commit_tokens`] succeeds.
    fn mint_tokens(&self, txn: &GrantTransaction) -> Result<Vec<StoredToken>> {
        let now = Utc::now();
        let expires_in = self.config.token_expiry_seconds;
        let mut minted = Vec::new();

        for request in &txn.token_requests {
            let granted: Vec<TokenAccess> = request
                .access
                .iter()
                .filter(|access| txn.authorized_access.contains(access))
                .cloned()
                .collect();
            if granted.is_empty() {
                continue;
            }

            let bearer = request.flags.contains(&AccessFlag::Bearer);
            let durable = request.flags.contains(&AccessFlag::Durable);
            let split = request.flags.contains(&AccessFlag::Split);

            let groups: Vec<Vec<TokenAccess>> = if split {
                granted.into_iter().map(|access| vec![access]).collect()
            } else {
                vec![granted]
            };
            let multiple = groups.len() > 1;

            for (i, access) in groups.into_iter().enumerate() {
                let label = request.label.as_ref().map(|label| {
                    if multiple {
                        format!("{}-{}", label, i + 1)
                    } else {
                        label.clone()
                    }
                });

                let key = if bearer {
                    "bearer".to_string()
                } else {
                    txn.client_key.proof.clone()
                };

                minted.push(StoredToken {
                    token: AccessToken {
                        value: new_handle(),
                        label,
                        manage: None,
                        access,
                        expires_in: Some(expires_in),
                        key: Some(key),
                        flags: request.flags.clone(),
                    },
                    client_key: (!bearer).then(|| txn.client_key.clone()),
                    subject_data: txn.subject_data.clone(),
                    txn_id: txn.txn_id.clone(),
                    durable,
                    expires_at: now + Duration::seconds(expires_in),
                });
            }
        }

        Ok(minted)
    }

    async fn commit_tokens(&self, tokens: &[StoredToken]) -> Result<()> {
        for token in tokens {
            self.put_with_retry(token).await?;
        }
        Ok(())
    }

    async fn put_with_retry(&self, token: &StoredToken) -> Result<()> {
        let mut delay_millis = STORE_RETRY_BASE_MILLIS;
        let mut last_err = None;

        for attempt in 1..=STORE_RETRY_ATTEMPTS {
            match self.token_store.put(token.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!("token store put failed (attempt {}): {}", attempt, e);
                    last_err = Some(e);
                }
            }

            if attempt < STORE_RETRY_ATTEMPTS {
                tokio::time::sleep(std::time::Duration::from_millis(delay_millis)).await;
                delay_millis *= 2;
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Storage("token commit failed".to_string())))
    }

    async fn live_txn_by_continue_token(&self, token: &str) -> Result<GrantTransaction> {
        let Some(txn) = self.txn_store.by_continue_token(token).await? else {
            return Err(Error::RequestDenied("unknown continuation".to_string()));
        };

        if txn.is_expired() {
            // Opportunistic cleanup; the client learns nothing beyond the
            // usual denial.
            let _ = self.expire_transaction(&txn.txn_id).await;
            return Err(Error::RequestDenied("unknown continuation".to_string()));
        }

        Ok(txn)
    }

    fn resolve_client_key(&self, client: Option<&RequestClient>) -> Result<ClientKey> {
        match client {
            None => Err(Error::RequestDenied("request missing client".to_string())),
            Some(RequestClient::Key(key)) => Ok(key.clone()),
            Some(RequestClient::Reference(reference)) => self
                .config
                .client_key_registry
                .get(reference)
                .cloned()
                .ok_or_else(|| {
                    Error::RequestDenied("unknown client reference".to_string())
                }),
        }
    }

    fn resolve_rs_key(&self, client: &RequestClient) -> Result<ClientKey> {
        self.resolve_client_key(Some(client))
    }

    fn continue_block(&self, txn: &GrantTransaction) -> ResponseContinue {
        ResponseContinue {
            uri: self.continue_uri.clone(),
            access_token: AccessToken {
                value: txn.continue_token.clone(),
                ..AccessToken::default()
            },
            wait: self.config.continue_wait_seconds,
        }
    }

    fn subject_for(&self, txn: &GrantTransaction) -> Option<Subject> {
        let sub = txn.subject_data.get("sub")?;

        let mut formats = txn.sub_id_formats.clone();
        if formats.is_empty() {
            formats.push("opaque".to_string());
        }

        Some(Subject {
            sub_ids: formats
                .into_iter()
                .map(|format| SubjectId {
                    id: sub.clone(),
                    format,
                })
                .collect(),
            assertions: Vec::new(),
        })
    }
}
