//! Container image repositories and content-derived image tags.
//!
//! Tags are `{image}-{created}` where `created` is the local image's creation
//! time in UTC at second precision. Repositories reject re-pushing an existing
//! tag, so an image whose tag is already the newest in the repository is not
//! pushed again.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{DeployError, DeployResult};
use crate::iam::{policy_doc, PolicyScope};
use crate::ledger::{decode, Ensured, Ledger, RemoteRecord, ResourceKind};
use crate::retry::RetryPolicy;
use crate::transport::{
    ContainerEngine, CreateRepositoryRequest, RegistryClient, RegistryCredentials,
};

/// Actions the execution role needs to pull images.
pub const PULL_ACTIONS: [&str; 3] = [
    "ecr:GetDownloadUrlForLayer",
    "ecr:BatchGetImage",
    "ecr:BatchCheckLayerAvailability",
];

/// Format of the creation-time tag suffix.
pub const TAG_TIME_FORMAT: &str = "%Y-%m-%dT%H.%M.%S";

const DEFAULT_TAG_LIMIT: usize = 20;

/// A repository as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RepositoryRecord {
    /// Repository name.
    pub repository_name: String,
    /// Registry URI images are pushed to.
    pub repository_uri: String,
    /// Repository ARN.
    pub repository_arn: String,
}

impl RemoteRecord for RepositoryRecord {
    const KIND: &'static str = "repository";

    fn ident(&self) -> String {
        self.repository_name.clone()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageDetail {
    #[serde(default)]
    image_tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthorizationData {
    authorization_token: String,
    proxy_endpoint: String,
}

/// Ledger operations for repositories.
pub struct RepositoryKind {
    registry: Arc<dyn RegistryClient>,
}

#[async_trait]
impl ResourceKind for RepositoryKind {
    type Record = RepositoryRecord;
    type CreateArgs = ();
    /// Whether to delete a repository that still holds images.
    type DeleteArgs = bool;

    const LABEL: &'static str = "Repository";
    const LAGS_AFTER_CREATE: bool = true;

    async fn list(&self) -> DeployResult<Vec<RepositoryRecord>> {
        self.registry
            .list_repositories()
            .await?
            .iter()
            .map(RepositoryRecord::from_remote)
            .collect()
    }

    async fn create(&self, ident: &str, _args: &()) -> DeployResult<()> {
        let request = CreateRepositoryRequest {
            name: ident.to_owned(),
            immutable_tags: true,
            encryption: "AES256".to_owned(),
        };
        self.registry.create_repository(&request).await?;
        Ok(())
    }

    async fn delete(&self, record: &RepositoryRecord, force: &bool) -> DeployResult<()> {
        self.registry
            .delete_repository(&record.repository_name, *force)
            .await?;
        Ok(())
    }
}

/// All repositories in the account.
pub struct Repositories {
    ledger: Ledger<RepositoryKind>,
    engine: Arc<dyn ContainerEngine>,
    account_id: String,
    region: String,
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories")
            .field("ledger", &self.ledger)
            .field("account_id", &self.account_id)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl Repositories {
    /// Create a view over the account's repositories.
    #[must_use]
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        engine: Arc<dyn ContainerEngine>,
        account_id: impl Into<String>,
        region: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger: Ledger::new(RepositoryKind { registry }, retry),
            engine,
            account_id: account_id.into(),
            region: region.into(),
        }
    }

    /// ARN of a repository in this account and region.
    #[must_use]
    pub fn arn(&self, name: &str) -> String {
        format!(
            "arn:aws:ecr:{}:{}:repository/{name}",
            self.region, self.account_id
        )
    }

    fn open(&self, record: RepositoryRecord) -> ImageRepository {
        ImageRepository {
            record,
            registry: self.ledger.kind().registry.clone(),
            engine: self.engine.clone(),
            images: None,
        }
    }

    /// Ensure the repository exists and `role_arn` may pull from it.
    pub async fn ensure(&mut self, name: &str, role_arn: &str) -> DeployResult<ImageRepository> {
        let record = match self.ledger.ensure(name, &()).await? {
            Ensured::Created(record) => {
                info!(repository = %name, "Repository created: {name}");
                record
            }
            Ensured::Existed(record) => {
                info!(repository = %name, "Repository existed: {name}");
                record
            }
        };

        let policy = policy_doc(
            &PULL_ACTIONS,
            PolicyScope::Principal(json!({ "AWS": role_arn })),
        );
        self.ledger
            .kind()
            .registry
            .set_repository_policy(name, &policy)
            .await?;

        Ok(self.open(record))
    }

    /// Open an existing repository.
    pub async fn get(&mut self, name: &str) -> DeployResult<Option<ImageRepository>> {
        Ok(self.ledger.get(name).await?.map(|record| self.open(record)))
    }

    /// Delete repositories. Without `force`, a repository holding images is an error.
    pub async fn delete(&mut self, names: &[&str], force: bool) -> DeployResult<()> {
        for name in names {
            if !self.ledger.delete(name, &force).await? {
                info!(repository = %name, "Repository not found: {name}");
            }
        }
        Ok(())
    }
}

/// One repository and the tags stored in it.
pub struct ImageRepository {
    record: RepositoryRecord,
    registry: Arc<dyn RegistryClient>,
    engine: Arc<dyn ContainerEngine>,
    images: Option<Vec<ImageDetail>>,
}

impl std::fmt::Debug for ImageRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRepository")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl ImageRepository {
    /// Repository name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.record.repository_name
    }

    /// Registry URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.record.repository_uri
    }

    /// Repository ARN.
    #[must_use]
    pub fn arn(&self) -> &str {
        &self.record.repository_arn
    }

    /// Full image reference for a tag.
    #[must_use]
    pub fn image_uri(&self, tag: &str) -> String {
        format!("{}:{tag}", self.uri())
    }

    async fn images(&mut self) -> DeployResult<&[ImageDetail]> {
        if self.images.is_none() {
            let details = self
                .registry
                .describe_images(self.name())
                .await?
                .iter()
                .map(|raw| decode("image", raw))
                .collect::<DeployResult<Vec<ImageDetail>>>()?;
            self.images = Some(details);
        }
        Ok(self.images.as_deref().unwrap_or_default())
    }

    /// Tags starting with `prefix`, newest first, at most `limit`.
    pub async fn tags(&mut self, prefix: &str, limit: usize) -> DeployResult<Vec<String>> {
        let mut tags: Vec<String> = self
            .images()
            .await?
            .iter()
            .flat_map(|image| image.image_tags.iter())
            .filter(|tag| tag.starts_with(prefix))
            .cloned()
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        tags.truncate(limit);
        Ok(tags)
    }

    /// Most recent tag starting with `prefix`.
    pub async fn latest_tag(&mut self, prefix: &str) -> DeployResult<Option<String>> {
        Ok(self.tags(prefix, 1).await?.into_iter().next())
    }

    /// All tags, newest first, using the default limit.
    pub async fn recent_tags(&mut self) -> DeployResult<Vec<String>> {
        self.tags("", DEFAULT_TAG_LIMIT).await
    }

    /// Tag the local image for this repository and return the tag.
    ///
    /// Without `suffix` the image's creation time is used.
    pub async fn tag_local(&self, image: &str, suffix: Option<&str>) -> DeployResult<String> {
        let suffix = match suffix {
            Some(suffix) => suffix.to_owned(),
            None => self
                .engine
                .image_created(image)
                .await?
                .format(TAG_TIME_FORMAT)
                .to_string(),
        };
        let tag = format!("{image}-{suffix}");
        self.engine.tag_image(image, self.uri(), &tag).await?;
        Ok(tag)
    }

    /// Push the local image unless the repository already has its tag.
    ///
    /// Returns the tag the function should run.
    pub async fn push(&mut self, image: &str, suffix: Option<&str>) -> DeployResult<String> {
        let tag = self.tag_local(image, suffix).await?;
        let latest = self.latest_tag(&format!("{image}-")).await?;

        if latest.as_deref() == Some(tag.as_str()) {
            info!(repository = %self.name(), tag = %tag, "Repository tag: {tag}");
            warn!(
                repository = %self.name(),
                "Local and registry tags match, not pushing image"
            );
            return Ok(tag);
        }

        let raw = self.registry.get_authorization_token().await?;
        let auth: AuthorizationData = decode("authorization token", &raw)?;
        let credentials = decode_credentials(&auth)?;
        self.engine.login(&credentials).await?;

        info!(repository = %self.name(), tag = %tag, "Tagged, pushing...");
        self.engine.push_image(self.uri(), &tag).await?;
        info!(repository = %self.name(), "Tagged and pushed: {} {tag}", self.uri());

        self.images = None;
        Ok(tag)
    }

    /// Store the manifest of `existing` under the additional tag `new`.
    pub async fn tag_remote(&mut self, existing: &str, new: &str) -> DeployResult<()> {
        let manifest = self.registry.get_image_manifest(self.name(), existing).await?;
        self.registry.put_image(self.name(), new, &manifest).await?;
        debug!(repository = %self.name(), existing, new, "Tagged remote image");
        self.images = None;
        Ok(())
    }
}

fn decode_credentials(auth: &AuthorizationData) -> DeployResult<RegistryCredentials> {
    let bytes = STANDARD
        .decode(&auth.authorization_token)
        .map_err(|e| DeployError::schema("authorization token", e.to_string()))?;
    let token = String::from_utf8(bytes)
        .map_err(|e| DeployError::schema("authorization token", e.to_string()))?;
    let (username, password) = token
        .split_once(':')
        .ok_or_else(|| DeployError::schema("authorization token", "expected user:password"))?;

    Ok(RegistryCredentials {
        username: username.to_owned(),
        password: password.to_owned(),
        registry: auth.proxy_endpoint.clone(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    use super::*;
    use crate::test_fixtures::{capture_logs, cloud, fast_retry};
    use crate::transport::{MemoryCloud, RemoteErrorKind};

    const ROLE_ARN: &str = "arn:aws:iam::123456789012:role/app-role";

    fn repositories(cloud: &Arc<MemoryCloud>) -> Repositories {
        Repositories::new(
            cloud.clone(),
            cloud.clone(),
            "123456789012",
            "eu-west-1",
            fast_retry(),
        )
    }

    fn built(cloud: &MemoryCloud) {
        let created = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        cloud.add_local_image("app", created);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn ensure_creates_locked_down_repository(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        let mut repos = repositories(&cloud);

        let repo = repos.ensure("app-repo", ROLE_ARN).await.unwrap();
        repos.ensure("app-repo", ROLE_ARN).await.unwrap();

        assert_eq!(
            repo.uri(),
            "123456789012.dkr.ecr.eu-west-1.amazonaws.com/app-repo"
        );
        assert_eq!(repo.arn(), repos.arn("app-repo"));
        assert_eq!(cloud.calls("create_repository"), 1);
        assert!(logs.contains("Repository created: app-repo"));
        assert!(logs.contains("Repository existed: app-repo"));

        let policy = cloud.get_repository_policy("app-repo").await.unwrap();
        let statement = &policy["Statement"][0];
        assert_eq!(statement["Principal"]["AWS"], ROLE_ARN);
        assert_eq!(statement["Action"], json!(PULL_ACTIONS));
    }

    #[rstest]
    fn debug_output_names_account_and_region(cloud: Arc<MemoryCloud>) {
        let rendered = format!("{:?}", repositories(&cloud));

        assert!(rendered.starts_with("Repositories {"));
        assert!(rendered.contains("\"123456789012\""));
        assert!(rendered.contains("\"eu-west-1\""));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn tag_is_derived_from_image_creation_time(cloud: Arc<MemoryCloud>) {
        built(&cloud);
        let mut repos = repositories(&cloud);
        let repo = repos.ensure("app-repo", ROLE_ARN).await.unwrap();

        assert_eq!(
            repo.tag_local("app", None).await.unwrap(),
            "app-2024-03-05T14.07.09"
        );
        assert_eq!(repo.tag_local("app", Some("hotfix")).await.unwrap(), "app-hotfix");
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn same_image_is_pushed_once(cloud: Arc<MemoryCloud>) {
        let logs = capture_logs();
        built(&cloud);
        let mut repos = repositories(&cloud);
        let mut repo = repos.ensure("app-repo", ROLE_ARN).await.unwrap();

        let first = repo.push("app", None).await.unwrap();
        let second = repo.push("app", None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cloud.calls("push_image"), 1);
        assert_eq!(cloud.calls("login"), 1);
        assert!(logs.contains("Local and registry tags match, not pushing image"));
        assert_eq!(
            repo.image_uri(&first),
            "123456789012.dkr.ecr.eu-west-1.amazonaws.com/app-repo:app-2024-03-05T14.07.09"
        );
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn push_failures_are_fatal(cloud: Arc<MemoryCloud>) {
        built(&cloud);
        let mut repos = repositories(&cloud);
        let mut repo = repos.ensure("app-repo", ROLE_ARN).await.unwrap();
        cloud.fail_next("push_image", RemoteErrorKind::Other, "denied");

        let err = repo.push("app", None).await.unwrap_err();

        assert!(matches!(err, DeployError::Remote { operation: "push_image", .. }));
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn tags_are_newest_first_and_limited(cloud: Arc<MemoryCloud>) {
        let mut repos = repositories(&cloud);
        let mut repo = repos.ensure("app-repo", ROLE_ARN).await.unwrap();
        for (tag, manifest) in [
            ("app-2024-01-01T00.00.00", "m1"),
            ("app-2024-03-01T00.00.00", "m2"),
            ("other-2025-01-01T00.00.00", "m3"),
            ("app-2024-02-01T00.00.00", "m4"),
        ] {
            cloud.put_image("app-repo", tag, manifest).await.unwrap();
        }

        assert_eq!(
            repo.tags("app-", 2).await.unwrap(),
            vec!["app-2024-03-01T00.00.00", "app-2024-02-01T00.00.00"]
        );
        assert_eq!(
            repo.latest_tag("other-").await.unwrap().as_deref(),
            Some("other-2025-01-01T00.00.00")
        );
        assert_eq!(repo.recent_tags().await.unwrap().len(), 4);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn tag_remote_copies_manifest(cloud: Arc<MemoryCloud>) {
        let mut repos = repositories(&cloud);
        let mut repo = repos.ensure("app-repo", ROLE_ARN).await.unwrap();
        cloud.put_image("app-repo", "app-1", "m1").await.unwrap();

        repo.tag_remote("app-1", "live").await.unwrap();

        assert_eq!(repo.latest_tag("live").await.unwrap().as_deref(), Some("live"));
        assert_eq!(
            cloud.get_image_manifest("app-repo", "live").await.unwrap(),
            "m1"
        );
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn delete_requires_force_for_non_empty(cloud: Arc<MemoryCloud>) {
        let mut repos = repositories(&cloud);
        repos.ensure("app-repo", ROLE_ARN).await.unwrap();
        cloud.put_image("app-repo", "app-1", "m1").await.unwrap();

        assert!(repos.delete(&["app-repo"], false).await.is_err());
        repos.delete(&["app-repo", "missing"], true).await.unwrap();

        assert!(!cloud.has_repository("app-repo"));
    }

    #[test]
    fn malformed_token_is_a_schema_error() {
        let auth = AuthorizationData {
            authorization_token: STANDARD.encode("no-separator"),
            proxy_endpoint: "https://registry".to_owned(),
        };
        assert!(matches!(
            decode_credentials(&auth),
            Err(DeployError::Schema { .. })
        ));
    }
}
