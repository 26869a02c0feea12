#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod config;
pub mod deployer;
pub mod error;
pub mod function;
pub mod iam;
pub mod ledger;
pub mod logs;
pub mod queues;
pub mod registry;
pub mod retry;
pub mod rules;
pub mod transport;

#[cfg(test)]
pub mod test_fixtures;

pub use config::DeployConfig;
pub use deployer::{DeploySummary, Deployer, ProvisionSummary};
pub use error::{DeployError, DeployResult};
pub use function::{DeployOutcome, FunctionSpec};
pub use logs::{LogDirection, LogLines};
pub use retry::RetryPolicy;
pub use transport::{Cloud, MemoryCloud, RemoteError, RemoteErrorKind};
