//! End-to-end scenarios through [`ControlPlane`], with a mock executor and mock drivers.

use crate::ControlPlane;
use crate::api::models::deployments::{DeploymentRequest, DeploymentRequestImage, DeploymentState};
use crate::api::models::projects::{ComputeTier, ProjectCreateRequest, ProjectUpdateRequest};
use crate::api::models::resources::{ProvisionResourceRequest, ResourceState, ResourceType};
use crate::api::models::teams::{AddTeamMemberRequest, TeamCreateRequest, TeamRole};
use crate::api::models::telemetry::{DatadogConfig, TelemetrySink, TelemetrySinkConfig};
use crate::api::models::usage::BillingCycle;
use crate::api::models::users::{AccountTier, SubscriptionRequest, SubscriptionType};
use crate::deployment::executor::MockExecutor;
use crate::errors::Error;
use crate::provisioning::drivers::{DriverRegistry, JobKind, MockDriver, MockOutcome};
use crate::test_utils::{fast_config, wait_for};
use crate::types::{Capability, ProjectId, UserId};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Barrier;
use std::time::Duration;

struct Harness {
    cp: ControlPlane,
    executor: Arc<MockExecutor>,
    driver: Arc<MockDriver>,
}

fn harness_with(driver: MockDriver) -> Harness {
    let executor = Arc::new(MockExecutor::new());
    let driver = Arc::new(driver);
    let cp = ControlPlane::new(fast_config(), executor.clone(), DriverRegistry::new().with_all(driver.clone())).unwrap();
    Harness { cp, executor, driver }
}

fn harness() -> Harness {
    harness_with(MockDriver::new())
}

/// A control plane that can be shared across spawned tasks.
fn shared() -> Arc<ControlPlane> {
    let driver = Arc::new(MockDriver::new());
    let executor = Arc::new(MockExecutor::new());
    Arc::new(ControlPlane::new(fast_config(), executor, DriverRegistry::new().with_all(driver)).unwrap())
}

impl Harness {
    fn account(&self, name: &str, tier: AccountTier) -> UserId {
        self.cp.accounts().create_account(name, tier).unwrap().id
    }

    async fn project(&self, owner: UserId, name: &str) -> ProjectId {
        self.cp
            .create_project(owner, ProjectCreateRequest { name: name.to_string() }, None)
            .await
            .unwrap()
            .id
    }
}

fn image(reference: &str) -> DeploymentRequest {
    DeploymentRequest::Image(DeploymentRequestImage {
        image: reference.to_string(),
        secrets: None,
    })
}

fn resource(ty: ResourceType) -> ProvisionResourceRequest {
    ProvisionResourceRequest {
        r#type: ty,
        config: json!({}),
    }
}

const WAIT: Duration = Duration::from_secs(5);

#[test_log::test(tokio::test)]
async fn test_image_deploy_supersedes_running_deployment() {
    let h = harness();
    let user = h.account("alice", AccountTier::Pro);
    let project = h.project(user, "web").await;

    let first = h.cp.submit_deployment(user, project, image("reg/app:v0")).await.unwrap();
    h.cp.claim_deployment(first.id).await.unwrap();
    h.cp.report_ready(first.id, None, vec!["https://web.example.app".to_string()])
        .await
        .unwrap();
    assert_eq!(h.cp.get_deployment(user, first.id).await.unwrap().state, DeploymentState::Running);

    let second = h.cp.submit_deployment(user, project, image("reg/app:v1")).await.unwrap();
    assert_eq!(second.state, DeploymentState::Pending);
    assert_eq!(h.cp.get_deployment(user, first.id).await.unwrap().state, DeploymentState::Stopping);
    assert_eq!(h.executor.torn_down(), vec![first.id]);

    // Image deploys skip the build phase
    let claimed = h.cp.claim_deployment(second.id).await.unwrap();
    assert_eq!(claimed.state, DeploymentState::InProgress);

    // Ready while the predecessor drains: promotion waits
    let reported = h
        .cp
        .report_ready(second.id, None, vec!["https://web.example.app".to_string()])
        .await
        .unwrap();
    assert_eq!(reported.state, DeploymentState::InProgress);

    let stopped = h.cp.confirm_stopped(first.id).await.unwrap();
    assert_eq!(stopped.state, DeploymentState::Stopped);

    let running = h.cp.get_deployment(user, second.id).await.unwrap();
    assert_eq!(running.state, DeploymentState::Running);
    assert!(!running.uris.is_empty());

    let overview = h.cp.get_project(user, project).await.unwrap();
    assert_eq!(overview.deployment_state, Some(DeploymentState::Running));
    assert_eq!(overview.uris, vec!["https://web.example.app".to_string()]);

    let active = h
        .cp
        .list_deployments(user, project)
        .await
        .unwrap()
        .deployments
        .iter()
        .filter(|d| d.state.is_active())
        .count();
    assert_eq!(active, 1);
}

#[test_log::test(tokio::test)]
async fn test_basic_tier_rds_rejected_before_provisioning() {
    let h = harness();
    let user = h.account("bob", AccountTier::Basic);
    let project = h.project(user, "api").await;

    let err = h
        .cp
        .provision_resource(user, project, resource(ResourceType::DatabaseAwsRdsPostgres))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { .. }));
    assert!(matches!(
        h.cp.get_resource(user, project, ResourceType::DatabaseAwsRdsPostgres).await,
        Err(Error::NotFound { .. })
    ));
    assert!(h.driver.calls().is_empty());

    // Shared postgres is available on every tier
    let shared = h
        .cp
        .provision_resource(user, project, resource(ResourceType::DatabaseSharedPostgres))
        .await
        .unwrap();
    assert_eq!(shared.state, ResourceState::Provisioning);
}

#[test_log::test(tokio::test)]
async fn test_transient_failures_within_budget_reach_ready() {
    let driver = MockDriver::new();
    driver.script((1..=3).map(|i| MockOutcome::Transient(format!("capacity {i}"))));
    let h = harness_with(driver);
    let user = h.account("carol", AccountTier::Pro);
    let project = h.project(user, "jobs").await;

    h.cp.provision_resource(user, project, resource(ResourceType::DatabaseSharedPostgres))
        .await
        .unwrap();
    let status = h
        .cp
        .wait_for_resource(user, project, ResourceType::DatabaseSharedPostgres, WAIT)
        .await
        .unwrap();

    assert_eq!(status.resource.state, ResourceState::Ready);
    assert_eq!(status.attempts, 4);
    assert_eq!(status.resource.output["hostname"], "db.mock.internal");
}

#[test_log::test(tokio::test)]
async fn test_exhausted_budget_surfaces_provisioning_error() {
    let driver = MockDriver::new();
    driver.script((1..=4).map(|i| MockOutcome::Transient(format!("capacity {i}"))));
    let h = harness_with(driver);
    let user = h.account("dan", AccountTier::Pro);
    let project = h.project(user, "jobs").await;

    h.cp.provision_resource(user, project, resource(ResourceType::DatabaseSharedPostgres))
        .await
        .unwrap();
    let err = h
        .cp
        .wait_for_resource(user, project, ResourceType::DatabaseSharedPostgres, WAIT)
        .await
        .unwrap_err();
    match err {
        Error::Provisioning { message, .. } => assert_eq!(message, "capacity 4"),
        other => panic!("expected a provisioning error, got {other:?}"),
    }

    let status = h
        .cp
        .resource_status(user, project, ResourceType::DatabaseSharedPostgres)
        .await
        .unwrap();
    assert_eq!(status.resource.state, ResourceState::Failed);
    assert!(status.resource.output.is_null());
    assert_eq!(h.driver.call_count(JobKind::Provision), 4);
}

#[test_log::test(tokio::test)]
async fn test_rds_allowance_spans_owner_projects() {
    let h = harness();
    let user = h.account("erin", AccountTier::Pro);
    let first = h.project(user, "first").await;
    let second = h.project(user, "second").await;

    h.cp.provision_resource(user, first, resource(ResourceType::DatabaseAwsRdsPostgres))
        .await
        .unwrap();
    let err = h
        .cp
        .provision_resource(user, second, resource(ResourceType::DatabaseAwsRdsMySql))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { .. }));

    h.cp.accounts()
        .add_subscription(
            user,
            SubscriptionRequest {
                id: "sub_rds".to_string(),
                r#type: SubscriptionType::Rds,
                quantity: 1,
            },
            None,
        )
        .unwrap();
    h.cp.provision_resource(user, second, resource(ResourceType::DatabaseAwsRdsMySql))
        .await
        .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_team_roles_gate_project_operations() {
    let h = harness();
    let owner = h.account("owner", AccountTier::Pro);
    let member = h.account("member", AccountTier::Basic);
    let stranger = h.account("stranger", AccountTier::Growth);
    let employee = h.account("employee", AccountTier::Employee);

    let team = h
        .cp
        .create_team(owner, TeamCreateRequest { name: "Platform".to_string() })
        .unwrap();
    h.cp.accounts()
        .add_member(
            owner,
            team.id,
            AddTeamMemberRequest {
                user_id: Some(member),
                role: Some(TeamRole::Member),
                ..Default::default()
            },
        )
        .unwrap();
    let project = h
        .cp
        .create_project(owner, ProjectCreateRequest { name: "shared".to_string() }, Some(team.id))
        .await
        .unwrap();
    assert_eq!(project.team_id, Some(team.id));
    assert_eq!(project.user_id, owner);

    // Members deploy but cannot manage billing
    h.cp.submit_deployment(member, project.id, image("reg/shared:v1")).await.unwrap();
    let err = h.cp.delete_project(member, project.id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientPermissions {
            required: Capability::ManageBilling,
            ..
        }
    ));
    assert_eq!(h.cp.list_projects(member).await.unwrap().projects.len(), 1);

    // Strangers see nothing
    assert!(matches!(
        h.cp.get_project(stranger, project.id).await,
        Err(Error::InsufficientPermissions { .. })
    ));
    assert!(h.cp.list_projects(stranger).await.unwrap().projects.is_empty());

    // Employees read everything and change nothing
    h.cp.get_project(employee, project.id).await.unwrap();
    assert!(matches!(
        h.cp.submit_deployment(employee, project.id, image("reg/shared:v2")).await,
        Err(Error::InsufficientPermissions { .. })
    ));

    // Basic accounts cannot create teams
    assert!(matches!(
        h.cp.create_team(member, TeamCreateRequest { name: "Side".to_string() }),
        Err(Error::QuotaExceeded { .. })
    ));
}

#[test_log::test(tokio::test)]
async fn test_project_quota_and_compute_tier() {
    let h = harness();
    let user = h.account("frank", AccountTier::Basic);
    for name in ["one", "two", "three"] {
        h.project(user, name).await;
    }
    let err = h
        .cp
        .create_project(user, ProjectCreateRequest { name: "four".to_string() }, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded { .. }));

    let project = h.cp.list_projects(user).await.unwrap().projects[0].id;
    let too_big = ProjectUpdateRequest {
        compute_tier: Some(ComputeTier::M),
        ..Default::default()
    };
    assert!(matches!(
        h.cp.update_project(user, project, too_big).await,
        Err(Error::QuotaExceeded { .. })
    ));
    assert_eq!(h.cp.get_project(user, project).await.unwrap().compute_tier, None);

    h.cp.accounts().set_tier(user, AccountTier::Pro).unwrap();
    let resized = h
        .cp
        .update_project(
            user,
            project,
            ProjectUpdateRequest {
                compute_tier: Some(ComputeTier::M),
                name: Some("renamed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(resized.compute_tier, Some(ComputeTier::M));
    assert_eq!(resized.name, "renamed");

    let deployment = h.cp.submit_deployment(user, project, image("reg/app:v1")).await.unwrap();
    assert_eq!(h.executor.dispatched()[0].compute_tier, ComputeTier::M);
    assert_eq!(h.executor.dispatched()[0].deployment_id, deployment.id);
}

#[test_log::test(tokio::test)]
async fn test_project_transfer_to_team() {
    let h = harness();
    let owner = h.account("gina", AccountTier::Pro);
    let outsider = h.account("hank", AccountTier::Pro);
    let project = h.project(owner, "tools").await;
    let team = h
        .cp
        .create_team(owner, TeamCreateRequest { name: "Tools".to_string() })
        .unwrap();
    let foreign_team = h
        .cp
        .create_team(outsider, TeamCreateRequest { name: "Elsewhere".to_string() })
        .unwrap();

    let into_foreign = ProjectUpdateRequest {
        team_id: Some(foreign_team.id),
        ..Default::default()
    };
    assert!(matches!(
        h.cp.update_project(owner, project, into_foreign).await,
        Err(Error::InsufficientPermissions { .. })
    ));

    let moved = h
        .cp
        .update_project(
            owner,
            project,
            ProjectUpdateRequest {
                team_id: Some(team.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.team_id, Some(team.id));

    let back = h
        .cp
        .update_project(
            owner,
            project,
            ProjectUpdateRequest {
                remove_from_team: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(back.team_id, None);
    assert_eq!(back.user_id, owner);
}

#[test_log::test(tokio::test)]
async fn test_delete_project_waits_for_deployments_and_resources() {
    let h = harness();
    let user = h.account("ivy", AccountTier::Pro);
    let project = h.project(user, "batch").await;

    let deployment = h.cp.submit_deployment(user, project, image("reg/batch:v1")).await.unwrap();
    assert!(matches!(h.cp.delete_project(user, project).await, Err(Error::Conflict { .. })));
    let stopped = h.cp.stop_deployment(user, deployment.id).await.unwrap();
    assert_eq!(stopped.state, DeploymentState::Stopped);

    h.cp.provision_resource(
        user,
        project,
        ProvisionResourceRequest {
            r#type: ResourceType::Secrets,
            config: json!({ "API_KEY": "s3cr3t" }),
        },
    )
    .await
    .unwrap();
    h.cp.wait_for_resource(user, project, ResourceType::Secrets, WAIT).await.unwrap();
    assert!(matches!(h.cp.delete_project(user, project).await, Err(Error::Conflict { .. })));

    h.cp.delete_resource(user, project, ResourceType::Secrets).await.unwrap();
    let deleted = h
        .cp
        .wait_for_resource(user, project, ResourceType::Secrets, WAIT)
        .await
        .unwrap();
    assert_eq!(deleted.resource.state, ResourceState::Deleted);

    // Deleting again changes nothing
    let again = h.cp.delete_resource(user, project, ResourceType::Secrets).await.unwrap();
    assert_eq!(again.state, ResourceState::Deleted);
    let status = h.cp.resource_status(user, project, ResourceType::Secrets).await.unwrap();
    assert_eq!(status.updated_at, deleted.updated_at);

    h.cp.delete_project(user, project).await.unwrap();
    assert!(matches!(h.cp.get_project(user, project).await, Err(Error::NotFound { .. })));
}

#[test_log::test(tokio::test)]
async fn test_telemetry_credentials_never_returned() {
    let h = harness();
    let user = h.account("jane", AccountTier::Pro);
    let project = h.project(user, "metrics").await;

    let status = h
        .cp
        .set_telemetry_sink(
            user,
            project,
            TelemetrySinkConfig::Datadog(DatadogConfig {
                api_key: "dd-live-key".to_string(),
            }),
        )
        .unwrap();
    let body = serde_json::to_string(&status).unwrap();
    assert_eq!(body, r#"{"datadog":{"enabled":true}}"#);
    assert_eq!(h.cp.telemetry_config(user, project).unwrap(), status);

    let cleared = h.cp.remove_telemetry_sink(user, project, TelemetrySink::Datadog).unwrap();
    assert!(cleared.datadog.is_none());
}

#[test_log::test(tokio::test)]
async fn test_usage_covers_billed_projects() {
    let h = harness();
    let user = h.account("kim", AccountTier::Pro);
    let project = h.project(user, "usage").await;

    let deployment = h.cp.submit_deployment(user, project, image("reg/usage:v1")).await.unwrap();
    h.cp.claim_deployment(deployment.id).await.unwrap();
    h.cp.report_ready(deployment.id, None, vec!["https://usage.example.app".to_string()])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cycle = BillingCycle {
        start: Utc::now() - chrono::Duration::hours(1),
        end: Utc::now() + chrono::Duration::hours(1),
    };
    let usage = h.cp.user_usage(user, cycle).await.unwrap();
    assert_eq!(usage.projects.len(), 1);
    assert!(usage.vcpu.reserved_hours > 0.0);
    assert_eq!(usage.vcpu.billable_hours, usage.vcpu.reserved_hours);

    let project_usage = h.cp.project_usage(user, project, cycle).await.unwrap();
    assert_eq!(project_usage.project_id, project);
    assert!(!project_usage.daily.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_shutdown_drains_daemon() {
    let h = harness();
    let user = h.account("lee", AccountTier::Pro);
    let project = h.project(user, "short").await;
    h.cp.provision_resource(user, project, resource(ResourceType::DatabaseSharedPostgres))
        .await
        .unwrap();
    h.cp.wait_for_resource(user, project, ResourceType::DatabaseSharedPostgres, WAIT)
        .await
        .unwrap();

    tokio::time::timeout(WAIT, h.cp.shutdown()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rds_requests_respect_allowance() {
    let cp = shared();
    let user = cp.accounts().create_account("mia", AccountTier::Pro).unwrap().id;
    let mut projects = Vec::new();
    for i in 0..8 {
        let request = ProjectCreateRequest { name: format!("svc-{i}") };
        projects.push(cp.create_project(user, request, None).await.unwrap().id);
    }

    let barrier = Arc::new(Barrier::new(projects.len()));
    let mut tasks = tokio::task::JoinSet::new();
    for project in projects {
        let (cp, barrier) = (cp.clone(), barrier.clone());
        tasks.spawn(async move {
            barrier.wait().await;
            cp.provision_resource(user, project, resource(ResourceType::DatabaseAwsRdsPostgres))
                .await
        });
    }

    let mut accepted = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => accepted += 1,
            Err(Error::QuotaExceeded { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(accepted, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_project_creation_respects_tier_limit() {
    let cp = shared();
    let user = cp.accounts().create_account("noah", AccountTier::Basic).unwrap().id;

    let barrier = Arc::new(Barrier::new(8));
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..8 {
        let (cp, barrier) = (cp.clone(), barrier.clone());
        tasks.spawn(async move {
            barrier.wait().await;
            cp.create_project(user, ProjectCreateRequest { name: format!("site-{i}") }, None)
                .await
        });
    }

    let mut accepted = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => accepted += 1,
            Err(Error::QuotaExceeded { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(cp.list_projects(user).await.unwrap().projects.len(), 3);
}

#[test_log::test(tokio::test)]
async fn test_failure_reason_visible_to_callers() {
    let h = harness();
    let user = h.account("olga", AccountTier::Pro);
    let project = h.project(user, "worker").await;

    let first = h.cp.submit_deployment(user, project, image("reg/worker:v1")).await.unwrap();
    h.cp.claim_deployment(first.id).await.unwrap();
    h.cp.fail_deployment(first.id, "node lost".to_string()).await.unwrap();
    let failed = h.cp.get_deployment(user, first.id).await.unwrap();
    assert_eq!(failed.state, DeploymentState::Failed);
    assert_eq!(failed.reason.as_deref(), Some("node lost"));

    h.executor.refuse_dispatch(true);
    let refused = h.cp.submit_deployment(user, project, image("reg/worker:v2")).await.unwrap();
    let refused = h.cp.get_deployment(user, refused.id).await.unwrap();
    assert_eq!(refused.state, DeploymentState::Failed);
    assert_eq!(
        refused.reason.as_deref(),
        Some("Failed to dispatch deployment: executor unavailable")
    );
}

#[test_log::test(tokio::test)]
async fn test_refused_teardown_does_not_block_redeploy() {
    let h = harness();
    let user = h.account("pia", AccountTier::Pro);
    let project = h.project(user, "queue").await;
    let first = h.cp.submit_deployment(user, project, image("reg/queue:v1")).await.unwrap();
    h.cp.claim_deployment(first.id).await.unwrap();
    h.cp.report_ready(first.id, None, vec!["https://queue.example.app".to_string()])
        .await
        .unwrap();

    h.executor.refuse_teardown(true);
    let second = h.cp.submit_deployment(user, project, image("reg/queue:v2")).await.unwrap();
    let old = h.cp.get_deployment(user, first.id).await.unwrap();
    assert_eq!(old.state, DeploymentState::Failed);
    assert_eq!(old.reason.as_deref(), Some("Teardown failed: executor unavailable"));

    h.cp.claim_deployment(second.id).await.unwrap();
    let running = h
        .cp
        .report_ready(second.id, None, vec!["https://queue.example.app".to_string()])
        .await
        .unwrap();
    assert_eq!(running.state, DeploymentState::Running);
}

#[test_log::test(tokio::test)]
async fn test_failed_resource_can_be_deleted_and_requested_again() {
    let driver = MockDriver::new();
    driver.script([MockOutcome::Permanent("bad credentials".to_string())]);
    let h = harness_with(driver);
    let user = h.account("quinn", AccountTier::Pro);
    let project = h.project(user, "ledger").await;
    let ty = ResourceType::DatabaseSharedPostgres;

    h.cp.provision_resource(user, project, resource(ty)).await.unwrap();
    assert!(h.cp.wait_for_resource(user, project, ty, WAIT).await.is_err());

    let deleting = h.cp.delete_resource(user, project, ty).await.unwrap();
    assert_eq!(deleting.state, ResourceState::Deleting);
    wait_for(|| async {
        let status = h.cp.resource_status(user, project, ty).await.ok()?;
        (status.resource.state == ResourceState::Deleted).then_some(())
    })
    .await;

    h.cp.provision_resource(user, project, resource(ty)).await.unwrap();
    let status = h.cp.wait_for_resource(user, project, ty, WAIT).await.unwrap();
    assert_eq!(status.resource.state, ResourceState::Ready);
    assert_eq!(h.driver.call_count(JobKind::Provision), 2);
    assert_eq!(h.driver.call_count(JobKind::Deprovision), 1);
}

#[test_log::test(tokio::test)]
async fn test_override_tiers_list_every_project() {
    let h = harness();
    let alice = h.account("alice", AccountTier::Basic);
    let bob = h.account("bob", AccountTier::Pro);
    let employee = h.account("employee", AccountTier::Employee);
    let admin = h.account("admin", AccountTier::Admin);
    let a = h.project(alice, "alpha").await;
    let b = h.project(bob, "beta").await;

    for viewer in [employee, admin] {
        let ids: Vec<ProjectId> = h.cp.list_projects(viewer).await.unwrap().projects.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![a, b]);
    }
    let own: Vec<ProjectId> = h.cp.list_projects(alice).await.unwrap().projects.iter().map(|p| p.id).collect();
    assert_eq!(own, vec![a]);
}

#[test_log::test(tokio::test)]
async fn test_gc_stops_idle_free_tier_projects() {
    let h = harness();
    let admin = h.account("admin", AccountTier::Admin);
    let free = h.account("free", AccountTier::Basic);
    let paid = h.account("paid", AccountTier::Pro);

    let idle = h.project(free, "idle").await;
    let quiet = h.project(free, "quiet").await;
    let busy = h.project(paid, "busy").await;
    let deployment = h.cp.submit_deployment(free, idle, image("reg/idle:v1")).await.unwrap();
    h.cp.submit_deployment(paid, busy, image("reg/busy:v1")).await.unwrap();

    assert!(matches!(
        h.cp.gc_idle_projects(free, chrono::Duration::zero(), true, 100).await,
        Err(Error::InsufficientPermissions { .. })
    ));

    // Nothing is older than a day
    let recent = h.cp.gc_idle_projects(admin, chrono::Duration::days(1), true, 100).await.unwrap();
    assert!(recent.is_empty());

    // A dry run only reports
    let candidates = h.cp.gc_idle_projects(admin, chrono::Duration::zero(), false, 100).await.unwrap();
    assert_eq!(candidates, vec![idle]);
    assert_eq!(
        h.cp.get_deployment(free, deployment.id).await.unwrap().state,
        DeploymentState::Pending
    );

    let collected = h.cp.gc_idle_projects(admin, chrono::Duration::zero(), true, 100).await.unwrap();
    assert_eq!(collected, vec![idle]);
    assert!(!h.cp.get_deployment(free, deployment.id).await.unwrap().state.is_active());
    assert!(h.cp.get_project(free, quiet).await.unwrap().deployment_state.is_none());
    assert!(h.cp.gc_idle_projects(admin, chrono::Duration::zero(), true, 0).await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_delete_user_cascades_to_owned_projects() {
    let h = harness();
    let admin = h.account("admin", AccountTier::Admin);
    let owner = h.account("owner", AccountTier::Pro);
    let leaving = h.account("leaving", AccountTier::Pro);

    let team = h
        .cp
        .create_team(owner, TeamCreateRequest { name: "Ops".to_string() })
        .unwrap();
    h.cp.accounts()
        .add_member(
            owner,
            team.id,
            AddTeamMemberRequest {
                user_id: Some(leaving),
                role: Some(TeamRole::Admin),
                ..Default::default()
            },
        )
        .unwrap();
    let team_project = h
        .cp
        .create_project(owner, ProjectCreateRequest { name: "shared".to_string() }, Some(team.id))
        .await
        .unwrap();

    let own = h.project(leaving, "own").await;
    let deployment = h.cp.submit_deployment(leaving, own, image("reg/own:v1")).await.unwrap();
    h.cp.claim_deployment(deployment.id).await.unwrap();
    h.cp.report_ready(deployment.id, None, vec!["https://own.example.app".to_string()])
        .await
        .unwrap();
    h.cp.provision_resource(leaving, own, resource(ResourceType::Secrets))
        .await
        .unwrap();
    h.cp.wait_for_resource(leaving, own, ResourceType::Secrets, WAIT).await.unwrap();

    assert!(matches!(
        h.cp.delete_user(owner, leaving).await,
        Err(Error::InsufficientPermissions { .. })
    ));
    // The sole team Owner must hand the team over first
    assert!(matches!(h.cp.delete_user(admin, owner).await, Err(Error::Conflict { .. })));

    let removed = h.cp.delete_user(admin, leaving).await.unwrap();
    assert_eq!(removed, vec![own]);
    assert!(matches!(h.cp.current_user(leaving), Err(Error::NotFound { .. })));
    assert!(matches!(h.cp.get_project(admin, own).await, Err(Error::NotFound { .. })));
    assert_eq!(h.cp.accounts().team_role(team.id, leaving), None);
    assert_eq!(h.executor.torn_down(), vec![deployment.id]);
    h.cp.get_project(owner, team_project.id).await.unwrap();
    wait_for(|| async { (h.driver.call_count(JobKind::Deprovision) == 1).then_some(()) }).await;
    assert!(h.cp.current_user(owner).is_ok());
}

