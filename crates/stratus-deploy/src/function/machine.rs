//! Create-or-update of the function, with replacement on shape conflicts.

use std::sync::Arc;

use tracing::{error, info};

use super::spec::{FunctionRecord, FunctionSpec};
use super::state::{Absent, FunctionDeployment, Updating};
use crate::error::{DeployError, DeployResult};
use crate::retry::{retry_until, Probe, RetryPolicy};
use crate::transport::{CreateFunctionRequest, FunctionClient, PackageType, RemoteErrorKind};

/// What `ensure_func` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The function did not exist and was created.
    Created,
    /// Configuration or code was changed in place.
    Updated,
    /// Nothing differed.
    Current,
    /// The function was deleted and recreated.
    Replaced,
}

/// A settled function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedFunction {
    /// Function name.
    pub name: String,
    /// Function ARN.
    pub arn: String,
    /// What happened.
    pub outcome: DeployOutcome,
}

/// Drives a function to the desired image and configuration.
pub struct FunctionDeployer {
    functions: Arc<dyn FunctionClient>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for FunctionDeployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionDeployer")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl FunctionDeployer {
    /// Create a deployer.
    #[must_use]
    pub fn new(functions: Arc<dyn FunctionClient>, retry: RetryPolicy) -> Self {
        Self { functions, retry }
    }

    /// Create or update the function so it runs `image_uri` with `spec`.
    ///
    /// An existing function whose packaging cannot run an image is deleted
    /// and recreated, at most once per call. If the recreate fails the
    /// function stays deleted and [`DeployError::ReplaceFailed`] is returned.
    pub async fn ensure_func(
        &self,
        spec: &FunctionSpec,
        image_uri: &str,
    ) -> DeployResult<DeployedFunction> {
        let name = spec.name.as_str();
        info!(function = %name, image = %image_uri, "Deploying function");

        let mut absent = FunctionDeployment::<Absent>::new(name, image_uri);
        loop {
            let creating = absent.start_create();
            let replacing = creating.replacements() > 0;

            let updating = match self.create(spec, image_uri).await {
                Ok(()) => {
                    let record = self.wait_updated(name).await?;
                    info!(function = %name, "Function created");
                    let active = creating.created(record.function_arn);
                    return Ok(DeployedFunction {
                        name: name.to_owned(),
                        arn: active.arn().to_owned(),
                        outcome: if replacing {
                            DeployOutcome::Replaced
                        } else {
                            DeployOutcome::Created
                        },
                    });
                }
                Err(e) if replacing => {
                    error!(
                        function = %name,
                        error = %e,
                        "Function was deleted for replacement but could not be recreated"
                    );
                    return Err(DeployError::ReplaceFailed {
                        function: name.to_owned(),
                        source: Box::new(e),
                    });
                }
                Err(DeployError::AlreadyExists { .. }) => creating.exists(),
                Err(e) => return Err(e),
            };

            match self.update(&updating, spec).await {
                Ok((arn, outcome)) => {
                    let active = updating.updated(arn);
                    return Ok(DeployedFunction {
                        name: name.to_owned(),
                        arn: active.arn().to_owned(),
                        outcome,
                    });
                }
                Err(DeployError::ShapeConflict { message, .. }) if updating.replacements() == 0 => {
                    info!(function = %name, reason = %message, "Function shape conflict");
                    let deleting = updating.start_replace();
                    self.functions.delete_function(name).await?;
                    self.wait_gone(name).await?;
                    info!(function = %name, "Function deleted, replacing");
                    absent = deleting.deleted();
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create(&self, spec: &FunctionSpec, image_uri: &str) -> DeployResult<()> {
        let request = CreateFunctionRequest {
            configuration: spec.to_update(),
            package_type: PackageType::Image,
            image_uri: image_uri.to_owned(),
        };
        self.functions.create_function(&request).await?;
        Ok(())
    }

    async fn update(
        &self,
        deployment: &FunctionDeployment<Updating>,
        spec: &FunctionSpec,
    ) -> DeployResult<(String, DeployOutcome)> {
        let name = deployment.name();
        let image_uri = deployment.image_uri();

        let actual = self.describe(name).await?;
        check_shape(&actual)?;

        let mut changed = false;
        let drift = spec.drift(&actual);
        if drift.is_empty() {
            info!(function = %name, "Function configuration current");
        } else {
            info!(function = %name, fields = %drift.join(","), "Function configuration drifted");
            self.functions
                .update_function_configuration(&spec.to_update())
                .await?;
            self.wait_updated(name).await?;
            changed = true;
        }

        if actual.image_uri.as_deref() != Some(image_uri) {
            match self.functions.update_function_code(name, image_uri).await {
                Ok(_) => changed = true,
                Err(e) if e.kind == RemoteErrorKind::InvalidParameter => {
                    check_shape(&self.describe(name).await?)?;
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let record = self.wait_updated(name).await?;
        if changed {
            info!(function = %name, "Function updated");
            Ok((record.function_arn, DeployOutcome::Updated))
        } else {
            Ok((record.function_arn, DeployOutcome::Current))
        }
    }

    /// Current record of a function.
    pub async fn describe(&self, name: &str) -> DeployResult<FunctionRecord> {
        FunctionRecord::from_get_function(&self.functions.get_function(name).await?)
    }

    /// Poll until the last update settled.
    ///
    /// A `Failed` update is [`DeployError::UpdateFailed`]; running out of
    /// attempts is [`DeployError::WaitExhausted`] with the last status seen.
    pub async fn wait_updated(&self, name: &str) -> DeployResult<FunctionRecord> {
        info!(function = %name, "Waiting for function to be updated...");
        retry_until(&self.retry, &format!("function {name} update"), || async move {
            let record = self.describe(name).await?;
            match record.last_update_status.as_deref() {
                Some("Failed") => Err(DeployError::UpdateFailed {
                    function: name.to_owned(),
                    reason: record.last_update_status_reason.unwrap_or_default(),
                }),
                Some(status @ ("InProgress" | "Pending")) => Ok(Probe::Pending(status.to_owned())),
                _ => Ok(Probe::Ready(record)),
            }
        })
        .await
    }

    async fn wait_gone(&self, name: &str) -> DeployResult<()> {
        retry_until(&self.retry, &format!("function {name} deletion"), || async move {
            match self.functions.get_function(name).await {
                Ok(_) => Ok(Probe::Pending("still present".to_owned())),
                Err(e) if e.kind == RemoteErrorKind::NotFound => Ok(Probe::Ready(())),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}

fn check_shape(actual: &FunctionRecord) -> DeployResult<()> {
    if actual.package_type == PackageType::Image {
        return Ok(());
    }
    Err(DeployError::ShapeConflict {
        ident: actual.function_name.clone(),
        message: format!(
            "existing function is packaged as {}, not {}",
            actual.package_type,
            PackageType::Image
        ),
    })
}
