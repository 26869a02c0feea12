//! End-to-end provision, deploy, inspect and delete against the in-memory provider.

mod common;

use serde_json::json;
use stratus_deploy::{DeployError, DeployOutcome, LogDirection};

use common::{TestDeploy, ACCOUNT_ID, FUNCTION, IMAGE, RESOURCE};

#[tokio::test(start_paused = true)]
async fn provision_creates_role_repository_and_queues() {
    let test = TestDeploy::new().await;

    let summary = test.deployer.provision().await.unwrap();

    assert_eq!(
        summary.role_arn,
        format!("arn:aws:iam::{ACCOUNT_ID}:role/{RESOURCE}")
    );
    assert_eq!(summary.queues, vec![format!("{RESOURCE}-jobs")]);
    assert!(test.cloud.has_role(RESOURCE));
    assert!(test.cloud.has_repository(RESOURCE));
    assert_eq!(
        test.cloud.attached_policies(RESOURCE).len(),
        3,
        "logs, ecr-repo and sqs-queues policies"
    );
    assert_eq!(
        test.cloud.queue_attributes(&format!("{RESOURCE}-jobs"))["VisibilityTimeout"],
        "120"
    );
}

#[tokio::test(start_paused = true)]
async fn deploy_before_provision_is_not_found() {
    let test = TestDeploy::new().await;
    test.build_image();

    let err = test.deployer.deploy(IMAGE).await.unwrap_err();

    assert!(matches!(err, DeployError::NotFound { .. }), "got {err:?}");
    assert!(!test.cloud.has_function(FUNCTION));
}

#[tokio::test(start_paused = true)]
async fn first_deploy_wires_every_trigger() {
    let test = TestDeploy::new().await;
    test.build_image();
    test.deployer.provision().await.unwrap();

    let summary = test.deployer.deploy(IMAGE).await.unwrap();

    assert_eq!(summary.outcome, DeployOutcome::Created);
    assert_eq!(summary.function_name, FUNCTION);
    assert_eq!(summary.repository, RESOURCE);
    assert!(summary.image_uri.ends_with(":mu-2024-05-01T10.00.00"));
    assert_eq!(
        test.cloud.function_image(FUNCTION).and_then(|(_, uri)| uri),
        Some(summary.image_uri.clone())
    );
    assert_eq!(test.cloud.function_url(FUNCTION), Some(summary.function_url));

    let rule = format!("{RESOURCE}-nightly");
    assert_eq!(summary.rules, vec![rule.clone()]);
    let targets = test.cloud.rule_targets(&rule);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].arn, summary.function_arn);
    assert_eq!(
        serde_json::from_str::<serde_json::Value>(&targets[0].input).unwrap(),
        json!({ "do-action": "cleanup" })
    );

    assert_eq!(test.cloud.mapping_sources(FUNCTION).len(), 1);
    let permissions = test.cloud.function_permissions(FUNCTION);
    assert!(permissions.contains(&rule));
    assert!(permissions.contains(&"AllowPublicAccessFunctionUrl".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn redeploying_the_same_image_changes_nothing() {
    let test = TestDeploy::new().await;
    test.build_image();
    test.deployer.provision().await.unwrap();
    let first = test.deployer.deploy(IMAGE).await.unwrap();

    let second = test.deployer.deploy(IMAGE).await.unwrap();

    assert_eq!(second.outcome, DeployOutcome::Current);
    assert_eq!(second.image_uri, first.image_uri);
    assert_eq!(second.function_url, first.function_url);
    assert_eq!(test.cloud.calls("push_image"), 1);
    // every deploy attempts a create first; the second one finds the function
    assert_eq!(test.cloud.calls("create_function"), 2);
    assert_eq!(test.cloud.calls("update_function_configuration"), 0);
    assert_eq!(test.cloud.calls("update_function_code"), 0);
    assert_eq!(test.cloud.calls("put_rule"), 1);
    assert_eq!(test.cloud.calls("create_event_source_mapping"), 1);
    assert_eq!(test.cloud.calls("create_function_url_config"), 2);
    assert_eq!(test.cloud.function_permissions(FUNCTION).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn logs_and_invoke_reach_the_deployed_function() {
    let test = TestDeploy::new().await;
    test.build_image();
    test.deployer.provision().await.unwrap();
    test.deployer.deploy(IMAGE).await.unwrap();

    let group = format!("/aws/lambda/{FUNCTION}");
    test.cloud.put_log_events(
        &group,
        "2024/05/01/[$LATEST]a",
        &[(1, "START RequestId: r-1"), (3, "END RequestId: r-1")],
    );
    test.cloud
        .put_log_events(&group, "2024/05/01/[$LATEST]b", &[(2, "hello from b")]);

    let lines: Vec<String> = test
        .deployer
        .logs(10, LogDirection::OldestFirst)
        .await
        .unwrap()
        .collect();
    assert_eq!(
        lines,
        vec!["START RequestId: r-1", "hello from b", "END RequestId: r-1"]
    );

    let response = test
        .deployer
        .invoke("ping", json!({ "n": 1 }))
        .await
        .unwrap();
    assert_eq!(response["statusCode"], 200);
    assert_eq!(
        test.cloud.invocations(),
        vec![(
            FUNCTION.to_owned(),
            json!({ "do-action": "ping", "action-args": { "n": 1 } })
        )]
    );
}

#[tokio::test(start_paused = true)]
async fn delete_removes_everything_and_can_run_twice() {
    let test = TestDeploy::new().await;
    test.build_image();
    test.deployer.provision().await.unwrap();
    test.deployer.deploy(IMAGE).await.unwrap();

    test.deployer.delete(true).await.unwrap();

    assert!(!test.cloud.has_function(FUNCTION));
    assert!(!test.cloud.has_role(RESOURCE));
    assert!(!test.cloud.has_repository(RESOURCE));
    assert!(test.cloud.rule_names().is_empty());
    assert!(test.cloud.queue_names().is_empty());
    assert!(test.cloud.mapping_sources(FUNCTION).is_empty());
    for purpose in ["logs", "ecr-repo", "sqs-queues"] {
        assert_eq!(
            test.cloud.policy_version_count(&format!("{RESOURCE}-{purpose}")),
            0
        );
    }

    test.deployer.delete(true).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn delete_keeps_a_non_empty_repository_without_force() {
    let test = TestDeploy::new().await;
    test.build_image();
    test.deployer.provision().await.unwrap();
    test.deployer.deploy(IMAGE).await.unwrap();

    assert!(test.deployer.delete(false).await.is_err());

    assert!(!test.cloud.has_function(FUNCTION));
    assert!(test.cloud.has_repository(RESOURCE));
}
