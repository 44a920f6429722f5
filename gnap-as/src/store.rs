use crate::error::{Error, Result};
use crate::gnap::{AccessToken, ClientKey};
use crate::session::{GrantTransaction, TxnId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// An issued token as the token store holds it: the wire token plus the
/// bindings introspection discloses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: AccessToken,
    /// Key the token is bound to; `None` for bearer tokens
    pub client_key: Option<ClientKey>,
    pub subject_data: HashMap<String, String>,
    /// The transaction that issued this token
    pub txn_id: TxnId,
    /// Durable tokens survive deletion of their parent transaction
    pub durable: bool,
    pub expires_at: DateTime<Utc>,
}

impl StoredToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// OIDC round-trip record, keyed by the freshly minted `state` parameter.
/// One-shot: consumed by the callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcTransient {
    pub provider_id: String,
    pub txn_id: TxnId,
    pub expires_at: DateTime<Utc>,
}

/// Storage abstraction for issued access tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist an issued token, keyed by its opaque value
    async fn put(&self, token: StoredToken) -> Result<()>;

    /// Look up a token by value. Expired entries read as absent.
    async fn get(&self, value: &str) -> Result<Option<StoredToken>>;

    /// Delete a token
    async fn delete(&self, value: &str) -> Result<()>;

    /// Delete a transaction's tokens, sparing durable ones
    async fn delete_for_txn(&self, txn_id: &str) -> Result<()>;
}

/// Storage abstraction for grant transactions.
///
/// One logical transaction is referenced by several handles; the secondary
/// lookups must stay consistent with the primary record, so implementations
/// maintain the indexes in the same atomic step as the record write.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Create a new transaction
    async fn create(&self, txn: GrantTransaction) -> Result<()>;

    /// Get a transaction by its ID
    async fn by_id(&self, txn_id: &str) -> Result<Option<GrantTransaction>>;

    /// Get a transaction by its current continuation token
    async fn by_continue_token(&self, token: &str) -> Result<Option<GrantTransaction>>;

    /// Get a transaction by its outstanding interaction reference
    async fn by_interact_ref(&self, interact_ref: &str) -> Result<Option<GrantTransaction>>;

    /// Compare-and-swap update on the transaction's `revision`. A stale
    /// writer gets [`Error::StoreConflict`]. Returns the stored record with
    /// the bumped revision.
    async fn update(&self, txn: GrantTransaction) -> Result<GrantTransaction>;

    /// Delete a transaction and its handle indexes
    async fn delete(&self, txn_id: &str) -> Result<()>;
}

/// Storage abstraction for the short-lived `gnap_transient` namespace.
#[async_trait]
pub trait TransientStore: Send + Sync {
    /// Store a record under an opaque key
    async fn put(&self, key: &str, data: OidcTransient) -> Result<()>;

    /// Get and remove a record. Expired entries read as absent.
    async fn consume(&self, key: &str) -> Result<Option<OidcTransient>>;
}

/// In-memory token store.
#[derive(Clone, Default)]
pub struct MemoryTokenStore {
    inner: Arc<RwLock<HashMap<String, StoredToken>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn put(&self, token: StoredToken) -> Result<()> {
        let mut tokens = self.inner.write().await;
        tokens.insert(token.token.value.clone(), token);
        Ok(())
    }

    async fn get(&self, value: &str) -> Result<Option<StoredToken>> {
        {
            let tokens = self.inner.read().await;
            match tokens.get(value) {
                Some(token) if !token.is_expired() => return Ok(Some(token.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Lazy reaping of the expired entry
        let mut tokens = self.inner.write().await;
        if tokens.get(value).is_some_and(StoredToken::is_expired) {
            tokens.remove(value);
        }

        Ok(None)
    }

    async fn delete(&self, value: &str) -> Result<()> {
        let mut tokens = self.inner.write().await;
        tokens.remove(value);
        Ok(())
    }

    async fn delete_for_txn(&self, txn_id: &str) -> Result<()> {
        let mut tokens = self.inner.write().await;
        tokens.retain(|_, token| token.durable || token.txn_id != txn_id);
        Ok(())
    }
}

#[derive(Default)]
struct TxnIndex {
    by_id: HashMap<TxnId, GrantTransaction>,
    continue_tokens: HashMap<String, TxnId>,
    interact_refs: HashMap<String, TxnId>,
}

impl TxnIndex {
    fn link(&mut self, txn: &GrantTransaction) {
        self.continue_tokens
            .insert(txn.continue_token.clone(), txn.txn_id.clone());
        if let Some(interact_ref) = &txn.interact_ref {
            self.interact_refs
                .insert(interact_ref.clone(), txn.txn_id.clone());
        }
    }

    fn unlink(&mut self, txn: &GrantTransaction) {
        self.continue_tokens.remove(&txn.continue_token);
        if let Some(interact_ref) = &txn.interact_ref {
            self.interact_refs.remove(interact_ref);
        }
    }
}

/// In-memory transaction store. All handle indexes are maintained under a
/// single writer lock, so an update that rotates a handle invalidates the
/// previous value atomically.
#[derive(Clone, Default)]
pub struct MemoryTransactionStore {
    inner: Arc<RwLock<TxnIndex>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn create(&self, txn: GrantTransaction) -> Result<()> {
        let mut index = self.inner.write().await;
        if index.by_id.contains_key(&txn.txn_id) {
            return Err(Error::Storage(format!(
                "transaction already exists: {}",
                txn.txn_id
            )));
        }

        index.link(&txn);
        index.by_id.insert(txn.txn_id.clone(), txn);
        Ok(())
    }

    async fn by_id(&self, txn_id: &str) -> Result<Option<GrantTransaction>> {
        let index = self.inner.read().await;
        Ok(index.by_id.get(txn_id).cloned())
    }

    async fn by_continue_token(&self, token: &str) -> Result<Option<GrantTransaction>> {
        let index = self.inner.read().await;
        Ok(index
            .continue_tokens
            .get(token)
            .and_then(|id| index.by_id.get(id))
            .cloned())
    }

    async fn by_interact_ref(&self, interact_ref: &str) -> Result<Option<GrantTransaction>> {
        let index = self.inner.read().await;
        Ok(index
            .interact_refs
            .get(interact_ref)
            .and_then(|id| index.by_id.get(id))
            .cloned())
    }

    async fn update(&self, mut txn: GrantTransaction) -> Result<GrantTransaction> {
        let mut index = self.inner.write().await;

        let current = index
            .by_id
            .get(&txn.txn_id)
            .ok_or(Error::UnknownTxn)?
            .clone();

        if current.revision != txn.revision {
            return Err(Error::StoreConflict);
        }

        txn.revision += 1;
        index.unlink(&current);
        index.link(&txn);
        index.by_id.insert(txn.txn_id.clone(), txn.clone());

        Ok(txn)
    }

    async fn delete(&self, txn_id: &str) -> Result<()> {
        let mut index = self.inner.write().await;
        if let Some(txn) = index.by_id.remove(txn_id) {
            index.unlink(&txn);
        }
        Ok(())
    }
}

/// In-memory transient store for OIDC states.
#[derive(Clone, Default)]
pub struct MemoryTransientStore {
    inner: Arc<RwLock<HashMap<String, OidcTransient>>>,
}

impl MemoryTransientStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransientStore for MemoryTransientStore {
    async fn put(&self, key: &str, data: OidcTransient) -> Result<()> {
        let mut records = self.inner.write().await;
        records.insert(key.to_string(), data);
        Ok(())
    }

    async fn consume(&self, key: &str) -> Result<Option<OidcTransient>> {
        let mut records = self.inner.write().await;
        Ok(records
            .remove(key)
            .filter(|record| record.expires_at > Utc::now()))
    }
}
