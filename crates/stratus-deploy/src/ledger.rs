//! Resource ledger: cached view of one kind of remote resource.
//!
//! A [`Ledger`] lists every record of its kind once and serves lookups from
//! that snapshot until a mutation marks it stale. `ensure` and `delete` are
//! idempotent: an existing record is reused, an absent one is skipped, and a
//! racing create answered with "already exists" counts as success.
//!
//! The algorithm is written once against [`ResourceKind`]; each resource kind
//! supplies its listing, create and delete calls plus an explicit record type.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};
use crate::retry::RetryPolicy;

/// Decode a provider record, reporting missing or mistyped fields loudly.
pub fn decode<T: DeserializeOwned>(kind: &'static str, value: &Value) -> DeployResult<T> {
    T::deserialize(value).map_err(|e| DeployError::schema(kind, e.to_string()))
}

/// A record as returned by a provider listing.
pub trait RemoteRecord: DeserializeOwned + Clone + fmt::Debug + Send + Sync {
    /// Kind label used in errors.
    const KIND: &'static str;

    /// Identifier the ledger is keyed by.
    fn ident(&self) -> String;

    /// Map a raw provider record.
    fn from_remote(value: &Value) -> DeployResult<Self> {
        decode(Self::KIND, value)
    }
}

/// Remote operations for one kind of resource.
#[async_trait]
pub trait ResourceKind: Send + Sync {
    /// Record type produced by `list`.
    type Record: RemoteRecord;
    /// Arguments for `create`.
    type CreateArgs: Send + Sync + ?Sized;
    /// Arguments for `delete`.
    type DeleteArgs: Send + Sync + ?Sized;

    /// Label used in log lines, e.g. `Role`.
    const LABEL: &'static str;

    /// Whether listings lag behind a successful create.
    const LAGS_AFTER_CREATE: bool = false;

    /// Fetch every record of this kind.
    async fn list(&self) -> DeployResult<Vec<Self::Record>>;

    /// Create the resource named `ident`.
    async fn create(&self, ident: &str, args: &Self::CreateArgs) -> DeployResult<()>;

    /// Delete an existing resource.
    async fn delete(&self, record: &Self::Record, args: &Self::DeleteArgs) -> DeployResult<()>;
}

/// Whether a cache reflects the remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Never fetched.
    Unloaded,
    /// Fetched and not mutated since.
    Loaded,
    /// A mutation happened after the last fetch.
    Stale,
}

/// Snapshot of remote records keyed by identifier.
#[derive(Debug)]
pub struct RecordCache<R> {
    records: BTreeMap<String, R>,
    freshness: Freshness,
}

impl<R> Default for RecordCache<R> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            freshness: Freshness::Unloaded,
        }
    }
}

impl<R> RecordCache<R> {
    /// Current freshness.
    #[must_use]
    pub const fn freshness(&self) -> Freshness {
        self.freshness
    }

    /// Whether the snapshot can be served without a fetch.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.freshness == Freshness::Loaded
    }

    /// Replace the snapshot with freshly listed records.
    pub fn replace(&mut self, records: impl IntoIterator<Item = (String, R)>) {
        self.records = records.into_iter().collect();
        self.freshness = Freshness::Loaded;
    }

    /// Mark the snapshot stale.
    pub fn invalidate(&mut self) {
        if self.freshness == Freshness::Loaded {
            self.freshness = Freshness::Stale;
        }
    }

    /// Cached records.
    #[must_use]
    pub const fn records(&self) -> &BTreeMap<String, R> {
        &self.records
    }
}

/// Outcome of [`Ledger::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensured<R> {
    /// The record was created by this call.
    Created(R),
    /// The record was already there.
    Existed(R),
}

impl<R> Ensured<R> {
    /// Whether this call created the record.
    #[must_use]
    pub const fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// The resolved record.
    #[must_use]
    pub const fn record(&self) -> &R {
        match self {
            Self::Created(r) | Self::Existed(r) => r,
        }
    }

    /// Take the resolved record.
    #[must_use]
    pub fn into_record(self) -> R {
        match self {
            Self::Created(r) | Self::Existed(r) => r,
        }
    }
}

/// Cached, idempotent view over one resource kind.
pub struct Ledger<K: ResourceKind> {
    kind: K,
    cache: RecordCache<K::Record>,
    retry: RetryPolicy,
}

impl<K: ResourceKind> fmt::Debug for Ledger<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("kind", &K::LABEL)
            .field("freshness", &self.cache.freshness())
            .field("records", &self.cache.records().len())
            .finish()
    }
}

impl<K: ResourceKind> Ledger<K> {
    /// Create an unloaded ledger.
    #[must_use]
    pub fn new(kind: K, retry: RetryPolicy) -> Self {
        Self {
            kind,
            cache: RecordCache::default(),
            retry,
        }
    }

    /// The underlying resource kind.
    #[must_use]
    pub const fn kind(&self) -> &K {
        &self.kind
    }

    /// Cache freshness.
    #[must_use]
    pub const fn freshness(&self) -> Freshness {
        self.cache.freshness()
    }

    /// Mark the cache stale so the next read re-fetches.
    pub fn invalidate(&mut self) {
        self.cache.invalidate();
    }

    /// All records, fetched on first use or after a mutation.
    pub async fn list(&mut self) -> DeployResult<&BTreeMap<String, K::Record>> {
        if !self.cache.is_loaded() {
            let records = self.kind.list().await?;
            debug!(kind = K::LABEL, count = records.len(), "Listed records");
            self.cache
                .replace(records.into_iter().map(|r| (r.ident(), r)));
        }
        Ok(self.cache.records())
    }

    /// Cached lookup.
    pub async fn get(&mut self, ident: &str) -> DeployResult<Option<K::Record>> {
        Ok(self.list().await?.get(ident).cloned())
    }

    /// Re-fetch with backoff until `ident` shows up in the listing.
    pub async fn get_wait(&mut self, ident: &str) -> DeployResult<K::Record> {
        let mut backoff = self.retry.backoff(format!("{} {ident}", K::LABEL));
        loop {
            self.invalidate();
            if let Some(record) = self.get(ident).await? {
                return Ok(record);
            }
            if backoff.pause("not listed").await.is_err() {
                return Err(DeployError::NotFoundAfterWait {
                    kind: K::LABEL,
                    ident: ident.to_owned(),
                    attempts: backoff.probes(),
                });
            }
        }
    }

    /// Make sure `ident` exists, creating it when absent.
    pub async fn ensure(
        &mut self,
        ident: &str,
        args: &K::CreateArgs,
    ) -> DeployResult<Ensured<K::Record>> {
        if let Some(existing) = self.get(ident).await? {
            info!(ident, "{} ensure: record existed", K::LABEL);
            return Ok(Ensured::Existed(existing));
        }

        self.invalidate();
        match self.kind.create(ident, args).await {
            Ok(()) => {
                info!(ident, "{} ensure: record created", K::LABEL);
                Ok(Ensured::Created(self.resolve(ident).await?))
            }
            Err(DeployError::AlreadyExists { .. }) => {
                info!(ident, "{} ensure: record existed", K::LABEL);
                Ok(Ensured::Existed(self.resolve(ident).await?))
            }
            Err(e) => Err(e),
        }
    }

    /// Delete `ident` if present. Returns whether anything was deleted.
    pub async fn delete(&mut self, ident: &str, args: &K::DeleteArgs) -> DeployResult<bool> {
        let Some(record) = self.get(ident).await? else {
            debug!(ident, "{} delete: record absent", K::LABEL);
            return Ok(false);
        };

        self.invalidate();
        match self.kind.delete(&record, args).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(ident, "{} delete: record already gone", K::LABEL);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
        info!(ident, "{} delete: record deleted", K::LABEL);
        Ok(true)
    }

    async fn resolve(&mut self, ident: &str) -> DeployResult<K::Record> {
        if K::LAGS_AFTER_CREATE {
            return self.get_wait(ident).await;
        }
        self.get(ident)
            .await?
            .ok_or_else(|| DeployError::NotFoundAfterWait {
                kind: K::LABEL,
                ident: ident.to_owned(),
                attempts: 1,
            })
    }
}
