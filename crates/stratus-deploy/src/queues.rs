//! Message queues owned by the function and the mappings that feed them to it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::DeployResult;
use crate::ledger::{Ensured, Ledger, RemoteRecord, ResourceKind};
use crate::retry::RetryPolicy;
use crate::transport::{CreateMappingRequest, FunctionClient, QueueClient};

/// A declared queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueSpec {
    /// Seconds a received message stays invisible to other consumers.
    #[serde(default)]
    pub visibility_timeout: Option<u32>,
    /// Seconds a message is kept.
    #[serde(default)]
    pub message_retention: Option<u32>,
    /// First-in-first-out delivery.
    #[serde(default)]
    pub fifo: bool,
    /// Messages delivered to the function per invocation.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

const fn default_batch_size() -> u32 {
    10
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self {
            visibility_timeout: None,
            message_retention: None,
            fifo: false,
            batch_size: default_batch_size(),
        }
    }
}

impl QueueSpec {
    /// Provider queue name for `{resource_ident}-{ident}`.
    #[must_use]
    pub fn queue_name(&self, resource_ident: &str, ident: &str) -> String {
        if self.fifo {
            format!("{resource_ident}-{ident}.fifo")
        } else {
            format!("{resource_ident}-{ident}")
        }
    }

    /// Provider attributes.
    #[must_use]
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        if let Some(timeout) = self.visibility_timeout {
            attributes.insert("VisibilityTimeout".to_owned(), timeout.to_string());
        }
        if let Some(retention) = self.message_retention {
            attributes.insert("MessageRetentionPeriod".to_owned(), retention.to_string());
        }
        if self.fifo {
            attributes.insert("FifoQueue".to_owned(), "true".to_owned());
        }
        attributes
    }
}

/// A queue as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueRecord {
    /// Queue name.
    pub queue_name: String,
    /// Queue URL, used to address it.
    pub queue_url: String,
    /// Queue ARN.
    pub queue_arn: String,
    /// Current attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl RemoteRecord for QueueRecord {
    const KIND: &'static str = "queue";

    fn ident(&self) -> String {
        self.queue_name.clone()
    }
}

/// Ledger operations for queues under one name prefix.
pub struct QueueKind {
    queues: Arc<dyn QueueClient>,
    prefix: String,
}

#[async_trait]
impl ResourceKind for QueueKind {
    type Record = QueueRecord;
    type CreateArgs = BTreeMap<String, String>;
    type DeleteArgs = ();

    const LABEL: &'static str = "Queue";
    const LAGS_AFTER_CREATE: bool = true;

    async fn list(&self) -> DeployResult<Vec<QueueRecord>> {
        self.queues
            .list_queues(&self.prefix)
            .await?
            .iter()
            .map(QueueRecord::from_remote)
            .collect()
    }

    async fn create(&self, ident: &str, attributes: &BTreeMap<String, String>) -> DeployResult<()> {
        self.queues.create_queue(ident, attributes).await?;
        Ok(())
    }

    async fn delete(&self, record: &QueueRecord, _args: &()) -> DeployResult<()> {
        Ok(self.queues.delete_queue(&record.queue_url).await?)
    }
}

/// Keeps the function's queues in line with their declarations.
pub struct Queues {
    ledger: Ledger<QueueKind>,
    resource_ident: String,
}

impl std::fmt::Debug for Queues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queues")
            .field("resource_ident", &self.resource_ident)
            .field("ledger", &self.ledger)
            .finish()
    }
}

impl Queues {
    /// Manage queues named `{resource_ident}-{queue}`.
    #[must_use]
    pub fn new(
        queues: Arc<dyn QueueClient>,
        resource_ident: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        let resource_ident = resource_ident.into();
        Self {
            ledger: Ledger::new(
                QueueKind {
                    queues,
                    prefix: format!("{resource_ident}-"),
                },
                retry,
            ),
            resource_ident,
        }
    }

    /// Ensure every declared queue exists with its attributes.
    ///
    /// With nothing declared, every queue under the prefix is deleted.
    /// Returns the declared queues with their batch sizes.
    pub async fn sync(
        &mut self,
        declared: &BTreeMap<String, QueueSpec>,
    ) -> DeployResult<Vec<(QueueRecord, u32)>> {
        if declared.is_empty() {
            self.delete_all().await?;
            return Ok(Vec::new());
        }

        let queues = self.ledger.kind().queues.clone();
        let mut synced = Vec::with_capacity(declared.len());
        for (ident, spec) in declared {
            let name = spec.queue_name(&self.resource_ident, ident);
            let desired = spec.attributes();
            let record = match self.ledger.ensure(&name, &desired).await? {
                Ensured::Created(record) => {
                    info!(queue = %name, "Queue created: {name}");
                    record
                }
                Ensured::Existed(record) => {
                    let drifted: BTreeMap<String, String> = desired
                        .iter()
                        .filter(|(key, value)| record.attributes.get(*key) != Some(*value))
                        .map(|(key, value)| (key.clone(), value.clone()))
                        .collect();
                    if drifted.is_empty() {
                        info!(queue = %name, "Queue existed: {name}");
                    } else {
                        queues.set_queue_attributes(&record.queue_url, &drifted).await?;
                        self.ledger.invalidate();
                        info!(queue = %name, "Queue updated: {name}");
                    }
                    record
                }
            };
            synced.push((record, spec.batch_size));
        }

        let names: Vec<&str> = synced.iter().map(|(r, _)| r.queue_name.as_str()).collect();
        for orphan in self
            .ledger
            .list()
            .await?
            .keys()
            .filter(|name| !names.contains(&name.as_str()))
        {
            warn!(queue = %orphan, "Queue not declared, leaving in place: {orphan}");
        }

        Ok(synced)
    }

    /// Delete every queue under the prefix.
    pub async fn delete_all(&mut self) -> DeployResult<()> {
        let names: Vec<String> = self.ledger.list().await?.keys().cloned().collect();
        for name in names {
            if self.ledger.delete(&name, &()).await? {
                info!(queue = %name, "Queue deleted: {name}");
            }
        }
        Ok(())
    }
}

/// An event source mapping as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappingRecord {
    /// Mapping identifier.
    #[serde(rename = "UUID")]
    pub uuid: String,
    /// Source queue ARN.
    pub event_source_arn: String,
    /// Messages per invocation.
    #[serde(default)]
    pub batch_size: Option<u32>,
}

impl RemoteRecord for MappingRecord {
    const KIND: &'static str = "event source mapping";

    fn ident(&self) -> String {
        self.event_source_arn.clone()
    }
}

/// Ledger operations for one function's event source mappings, keyed by
/// source ARN.
pub struct MappingKind {
    functions: Arc<dyn FunctionClient>,
    function: String,
}

#[async_trait]
impl ResourceKind for MappingKind {
    type Record = MappingRecord;
    type CreateArgs = u32;
    type DeleteArgs = ();

    const LABEL: &'static str = "Event source mapping";
    const LAGS_AFTER_CREATE: bool = true;

    async fn list(&self) -> DeployResult<Vec<MappingRecord>> {
        self.functions
            .list_event_source_mappings(&self.function)
            .await?
            .iter()
            .map(MappingRecord::from_remote)
            .collect()
    }

    async fn create(&self, source_arn: &str, batch_size: &u32) -> DeployResult<()> {
        let request = CreateMappingRequest {
            function: self.function.clone(),
            event_source_arn: source_arn.to_owned(),
            batch_size: *batch_size,
        };
        self.functions.create_event_source_mapping(&request).await?;
        Ok(())
    }

    async fn delete(&self, record: &MappingRecord, _args: &()) -> DeployResult<()> {
        Ok(self
            .functions
            .delete_event_source_mapping(&record.uuid)
            .await?)
    }
}

/// Connects queues to the function.
pub struct Mappings {
    ledger: Ledger<MappingKind>,
}

impl std::fmt::Debug for Mappings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mappings")
            .field("ledger", &self.ledger)
            .finish()
    }
}

impl Mappings {
    /// Manage the mappings of `function`.
    #[must_use]
    pub fn new(
        functions: Arc<dyn FunctionClient>,
        function: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger: Ledger::new(
                MappingKind {
                    functions,
                    function: function.into(),
                },
                retry,
            ),
        }
    }

    /// Ensure one mapping per `(queue ARN, batch size)`, correct drifted
    /// batch sizes and drop mappings from sources no longer declared.
    pub async fn sync(&mut self, sources: &[(String, u32)]) -> DeployResult<()> {
        for (source_arn, batch_size) in sources {
            match self.ledger.ensure(source_arn, batch_size).await? {
                Ensured::Created(_) => info!(source = %source_arn, "Event source mapping created"),
                Ensured::Existed(record) if record.batch_size != Some(*batch_size) => {
                    self.ledger
                        .kind()
                        .functions
                        .update_event_source_mapping(&record.uuid, *batch_size)
                        .await?;
                    self.ledger.invalidate();
                    info!(
                        source = %source_arn,
                        batch_size = *batch_size,
                        "Event source mapping updated"
                    );
                }
                Ensured::Existed(_) => info!(source = %source_arn, "Event source mapping existed"),
            }
        }

        let stale: Vec<String> = self
            .ledger
            .list()
            .await?
            .keys()
            .filter(|arn| !sources.iter().any(|(declared, _)| declared == *arn))
            .cloned()
            .collect();
        for source_arn in stale {
            if self.ledger.delete(&source_arn, &()).await? {
                info!(source = %source_arn, "Event source mapping removed");
            }
        }
        Ok(())
    }

    /// Delete every mapping of the function.
    pub async fn delete_all(&mut self) -> DeployResult<()> {
        self.sync(&[]).await
    }
}
