//! # deckhand: project, deployment and resource lifecycle engine
//!
//! `deckhand` is the state engine of a platform-as-a-service control plane. It owns projects,
//! deployments, provisioned resources, teams and accounts, and decides which transitions a
//! caller may drive and when.
//!
//! ## Overview
//!
//! Every operation enters through [`ControlPlane`]. The facade resolves the target project,
//! asks the account registry whether the caller holds the required [`types::Capability`],
//! builds a usage snapshot and asks the tier policy for a decision, and only then hands the
//! request to one of the two state machines:
//!
//! - the **deployment state machine** ([`deployment`]) keeps at most one active deployment per
//!   project. A new submission supersedes the previous one, which drains through `Stopping`
//!   before its successor may start `Running`.
//! - the **resource provisioning state machine** ([`provisioning`]) places a resource in
//!   `Provisioning` and returns immediately. A background daemon drives the external driver
//!   call with bounded retries and reports the outcome back as a completion.
//!
//! Both machines store entities in arenas keyed by id, each behind its own lock, with a
//! project-level lock for the rules that span entities. No lock is held across a call to the
//! build executor or a provisioning driver; a stop or delete that arrives while such a call is
//! in flight is recorded and applied once the call resolves.
//!
//! ## External collaborators
//!
//! The HTTP surface, the build executor and the cloud provisioning drivers live outside this
//! crate. The executor implements [`deployment::executor::BuildExecutor`] and reports progress
//! through [`ControlPlane::claim_deployment`], [`ControlPlane::report_ready`],
//! [`ControlPlane::report_build_failed`], [`ControlPlane::confirm_stopped`] and
//! [`ControlPlane::fail_deployment`]. Drivers implement
//! [`provisioning::drivers::ProvisioningDriver`]. Errors implement
//! `axum::response::IntoResponse`, so the API layer can return them as they are.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use deckhand::{ControlPlane, Config};
//! use deckhand::deployment::executor::MockExecutor;
//! use deckhand::provisioning::drivers::DriverRegistry;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = deckhand::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     deckhand::telemetry::init_telemetry(&config.telemetry)?;
//!
//!     let control_plane = ControlPlane::new(config, Arc::new(MockExecutor::new()), DriverRegistry::with_builtin())?;
//!     // ... serve requests ...
//!     control_plane.shutdown().await;
//!     deckhand::telemetry::shutdown_telemetry();
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod accounts;
pub mod api;
pub mod config;
pub mod deployment;
pub mod errors;
pub mod events;
pub mod openapi;
pub mod policy;
pub mod projects;
pub mod provisioning;
pub mod telemetry;
pub mod types;
pub mod usage;

#[cfg(test)]
mod test;
#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use errors::{Error, Result};

use crate::accounts::{AccountRegistry, Owner};
use crate::api::models::deployments::{DeploymentListResponse, DeploymentRequest, DeploymentResponse};
use crate::api::models::projects::{ProjectCreateRequest, ProjectListResponse, ProjectResponse, ProjectUpdateRequest};
use crate::api::models::resources::{ProvisionResourceRequest, ResourceListResponse, ResourceResponse, ResourceState, ResourceType};
use crate::api::models::teams::{TeamCreateRequest, TeamResponse};
use crate::api::models::telemetry::{TelemetryConfigResponse, TelemetrySink, TelemetrySinkConfig};
use crate::api::models::usage::{BillingCycle, ProjectUsageResponse, UserUsageResponse};
use crate::api::models::users::{AccountTier, UserResponse};
use crate::deployment::DeploymentMachine;
use crate::deployment::executor::BuildExecutor;
use crate::events::{EventBus, StateEvent};
use crate::policy::{Operation, TierPolicy, UsageSnapshot};
use crate::projects::{Project, ProjectRegistry};
use crate::provisioning::daemon::ProvisioningDaemon;
use crate::provisioning::drivers::DriverRegistry;
use crate::provisioning::{ResourceMachine, ResourceStatus};
use crate::types::{Capability, DeploymentId, ProjectId, TeamId, UserId, abbrev_uuid};
use chrono::Utc;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, instrument};

/// The control plane: the five components wired together, plus the provisioning daemon.
///
/// # Lifecycle
///
/// 1. **Create**: [`ControlPlane::new`] validates the config and starts the provisioning
///    daemon. It must be called from within a Tokio runtime.
/// 2. **Operate**: every public method is safe to call concurrently.
/// 3. **Shutdown**: [`ControlPlane::shutdown`] stops the daemon after in-flight driver calls
///    resolve. Dropping the control plane cancels the daemon without waiting.
pub struct ControlPlane {
    config: Config,
    accounts: AccountRegistry,
    projects: ProjectRegistry,
    deployments: DeploymentMachine,
    resources: Arc<ResourceMachine>,
    policy: TierPolicy,
    /// Held from a quota count until the insert it allows, per owner scope
    quota_locks: DashMap<Owner, Arc<Mutex<()>>>,
    events: EventBus,
    daemon: Arc<ProvisioningDaemon>,
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
    _drop_guard: DropGuard,
}

impl ControlPlane {
    pub fn new(config: Config, executor: Arc<dyn BuildExecutor>, drivers: DriverRegistry) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.deployments.event_buffer);
        let (machine, jobs) = ResourceMachine::new(events.clone());
        let resources = Arc::new(machine);
        let daemon = Arc::new(ProvisioningDaemon::new(
            resources.clone(),
            jobs,
            drivers,
            config.provisioning.clone(),
        ));

        let shutdown_token = CancellationToken::new();
        let drop_guard = shutdown_token.clone().drop_guard();
        let background_tasks = vec![tokio::spawn(daemon.clone().run(shutdown_token.clone()))];

        info!(
            max_retries = config.provisioning.max_retries,
            tier_overrides = config.tiers.len(),
            "Control plane started"
        );

        Ok(Self {
            accounts: AccountRegistry::new(config.teams.invite_ttl),
            projects: ProjectRegistry::new(),
            deployments: DeploymentMachine::new(executor, events.clone()),
            resources,
            policy: TierPolicy::new(config.tiers.clone()),
            quota_locks: DashMap::new(),
            events,
            daemon,
            background_tasks,
            shutdown_token,
            _drop_guard: drop_guard,
            config,
        })
    }

    /// Gracefully stop background tasks.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
        info!("Control plane stopped");
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Driver jobs currently queued on a permit or running.
    pub fn provisioning_jobs_in_flight(&self) -> usize {
        self.daemon.jobs_in_flight()
    }

    fn authorize(&self, caller: UserId, project: &Project, required: Capability) -> Result<()> {
        self.accounts
            .authorize(caller, &project.owner, required, &format!("project {}", project.name))
    }

    /// Load a project and check the caller may act on it.
    fn project_for(&self, caller: UserId, project_id: ProjectId, required: Capability) -> Result<Project> {
        let project = self.projects.get(project_id)?;
        self.authorize(caller, &project, required)?;
        Ok(project)
    }

    fn require_admin(&self, caller: UserId, operation: &str) -> Result<()> {
        if self.accounts.tier(caller)? == AccountTier::Admin {
            Ok(())
        } else {
            Err(Error::InsufficientPermissions {
                required: Capability::ManageBilling,
                resource: operation.to_string(),
            })
        }
    }

    async fn quota_guard(&self, scope: Owner) -> OwnedMutexGuard<()> {
        let lock = self.quota_locks.entry(scope).or_default().clone();
        lock.lock_owned().await
    }

    async fn project_response(&self, project: &Project) -> ProjectResponse {
        let current = self.deployments.current(project.id).await;
        project.to_response(current.as_ref())
    }

    // ------------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------------

    /// Create a project owned by the caller, or by `team_id` when given. Team projects need
    /// billing rights over the team.
    #[instrument(skip_all, fields(caller = %abbrev_uuid(&caller)), err)]
    pub async fn create_project(
        &self,
        caller: UserId,
        request: ProjectCreateRequest,
        team_id: Option<TeamId>,
    ) -> Result<ProjectResponse> {
        let tier = self.accounts.tier(caller)?;
        let owner = match team_id {
            Some(team_id) => {
                if !self.accounts.team_exists(team_id) {
                    return Err(Error::not_found("Team", team_id));
                }
                let owner = Owner::Team(team_id);
                self.accounts
                    .authorize(caller, &owner, Capability::ManageBilling, &format!("team {team_id}"))?;
                owner
            }
            None => Owner::User(caller),
        };

        // Projects count against their creator
        let _quota = self.quota_guard(Owner::User(caller)).await;
        let usage = UsageSnapshot {
            projects: self.projects.count_for(caller),
            ..Default::default()
        };
        self.policy.evaluate(tier, &usage, &Operation::CreateProject).into_result()?;

        let project = self.projects.create(owner, caller, &request.name)?;
        Ok(project.to_response(None))
    }

    pub async fn get_project(&self, caller: UserId, project_id: ProjectId) -> Result<ProjectResponse> {
        let project = self.project_for(caller, project_id, Capability::Read)?;
        Ok(self.project_response(&project).await)
    }

    /// Projects the caller owns directly or through a team, oldest first. Override tiers see
    /// every project.
    pub async fn list_projects(&self, caller: UserId) -> Result<ProjectListResponse> {
        let visible = if self.accounts.tier(caller)?.is_override() {
            self.projects.list_all()
        } else {
            let teams: Vec<TeamId> = self.accounts.teams_for(caller).teams.iter().map(|t| t.id).collect();
            self.projects.list_for(caller, &teams)
        };

        let mut projects = Vec::new();
        for project in visible {
            projects.push(self.project_response(&project).await);
        }
        Ok(ProjectListResponse { projects })
    }

    /// Rename, transfer or resize a project. Renames need resource rights; transfers and
    /// compute tier changes need billing rights, over the target owner as well.
    #[instrument(skip_all, fields(caller = %abbrev_uuid(&caller), project_id = %abbrev_uuid(&project_id)), err)]
    pub async fn update_project(
        &self,
        caller: UserId,
        project_id: ProjectId,
        request: ProjectUpdateRequest,
    ) -> Result<ProjectResponse> {
        let project = self.project_for(caller, project_id, Capability::Read)?;
        let update = projects::plan_update(&project, caller, request)?;

        let required = if update.changes_billing() {
            Capability::ManageBilling
        } else {
            Capability::ManageResources
        };
        self.authorize(caller, &project, required)?;

        match update.owner {
            Some(Owner::User(user)) => {
                self.accounts.account(user)?;
            }
            Some(Owner::Team(team_id)) => {
                if !self.accounts.team_exists(team_id) {
                    return Err(Error::not_found("Team", team_id));
                }
                self.accounts.authorize(
                    caller,
                    &Owner::Team(team_id),
                    Capability::ManageBilling,
                    &format!("team {team_id}"),
                )?;
            }
            None => {}
        }

        if let Some(compute_tier) = update.compute_tier {
            let tier = self.accounts.tier(caller)?;
            self.policy
                .evaluate(tier, &UsageSnapshot::default(), &Operation::SetComputeTier(compute_tier))
                .into_result()?;
        }

        let project = self.projects.apply(project_id, update)?;
        Ok(self.project_response(&project).await)
    }

    /// Delete a project. Refused while it has an active deployment or any resource that
    /// still holds infrastructure.
    #[instrument(skip_all, fields(caller = %abbrev_uuid(&caller), project_id = %abbrev_uuid(&project_id)), err)]
    pub async fn delete_project(&self, caller: UserId, project_id: ProjectId) -> Result<()> {
        self.project_for(caller, project_id, Capability::ManageBilling)?;
        if self.deployments.has_active(project_id).await {
            return Err(Error::conflict("Project has an active deployment; stop it first"));
        }
        if self.resources.has_live(project_id).await {
            return Err(Error::conflict("Project still has resources; delete them first"));
        }
        self.projects.delete(project_id)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Deployments
    // ------------------------------------------------------------------------

    /// Submit a deployment on the project's compute tier. Supersedes any active deployment.
    #[instrument(skip_all, fields(caller = %abbrev_uuid(&caller), project_id = %abbrev_uuid(&project_id)), err)]
    pub async fn submit_deployment(
        &self,
        caller: UserId,
        project_id: ProjectId,
        request: DeploymentRequest,
    ) -> Result<DeploymentResponse> {
        let project = self.project_for(caller, project_id, Capability::Deploy)?;
        let tier = self.accounts.tier(caller)?;
        let compute_tier = project.effective_compute_tier();
        self.policy
            .evaluate(tier, &UsageSnapshot::default(), &Operation::SubmitDeployment { compute_tier })
            .into_result()?;

        self.deployments.submit(project_id, request, compute_tier).await
    }

    fn deployment_project(&self, caller: UserId, id: DeploymentId, required: Capability) -> Result<Project> {
        let project_id = self.deployments.project_of(id)?;
        self.project_for(caller, project_id, required)
    }

    pub async fn get_deployment(&self, caller: UserId, id: DeploymentId) -> Result<DeploymentResponse> {
        self.deployment_project(caller, id, Capability::Read)?;
        self.deployments.get(id).await
    }

    /// Deployments of a project, newest first.
    pub async fn list_deployments(&self, caller: UserId, project_id: ProjectId) -> Result<DeploymentListResponse> {
        self.project_for(caller, project_id, Capability::Read)?;
        Ok(self.deployments.list(project_id).await)
    }

    pub async fn stop_deployment(&self, caller: UserId, id: DeploymentId) -> Result<DeploymentResponse> {
        self.deployment_project(caller, id, Capability::Deploy)?;
        self.deployments.stop(id).await
    }

    /// The executor picked up a deployment.
    pub async fn claim_deployment(&self, id: DeploymentId) -> Result<DeploymentResponse> {
        self.deployments.claim(id).await
    }

    /// The deployment is built and healthy at `uris`.
    pub async fn report_ready(
        &self,
        id: DeploymentId,
        build_id: Option<String>,
        uris: Vec<String>,
    ) -> Result<DeploymentResponse> {
        self.deployments.report_ready(id, build_id, uris).await
    }

    pub async fn report_build_failed(&self, id: DeploymentId, reason: String) -> Result<DeploymentResponse> {
        self.deployments.report_build_failed(id, reason).await
    }

    /// Teardown of a stopping deployment finished.
    pub async fn confirm_stopped(&self, id: DeploymentId) -> Result<DeploymentResponse> {
        self.deployments.confirm_stopped(id).await
    }

    /// Unrecoverable infrastructure fault.
    pub async fn fail_deployment(&self, id: DeploymentId, reason: String) -> Result<DeploymentResponse> {
        self.deployments.fail(id, reason).await
    }

    // ------------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------------

    /// Request a resource. Dedicated databases are counted across every project of the
    /// target project's owner, against the caller's tier and RDS subscriptions.
    #[instrument(
        skip_all,
        fields(caller = %abbrev_uuid(&caller), project_id = %abbrev_uuid(&project_id), resource_type = %request.r#type),
        err
    )]
    pub async fn provision_resource(
        &self,
        caller: UserId,
        project_id: ProjectId,
        request: ProvisionResourceRequest,
    ) -> Result<ResourceResponse> {
        let project = self.project_for(caller, project_id, Capability::ManageResources)?;
        let account = self.accounts.account(caller)?;

        let ty = request.r#type;
        if !ty.is_rds() {
            let decision = self
                .policy
                .evaluate(account.tier, &UsageSnapshot::default(), &Operation::ProvisionResource(ty));
            return self.resources.request(project_id, request, decision).await;
        }

        // Dedicated databases count across the owner's projects
        let _quota = self.quota_guard(project.owner).await;
        let owned = self.projects.projects_of(project.owner);
        let usage = UsageSnapshot {
            rds_instances: self.resources.count_live_rds(&owned).await,
            rds_subscription: account.rds_quantity(Utc::now()),
            ..Default::default()
        };
        let decision = self
            .policy
            .evaluate(account.tier, &usage, &Operation::ProvisionResource(ty));
        self.resources.request(project_id, request, decision).await
    }

    pub async fn delete_resource(
        &self,
        caller: UserId,
        project_id: ProjectId,
        resource_type: ResourceType,
    ) -> Result<ResourceResponse> {
        self.project_for(caller, project_id, Capability::ManageResources)?;
        self.resources.delete(project_id, resource_type).await
    }

    pub async fn get_resource(
        &self,
        caller: UserId,
        project_id: ProjectId,
        resource_type: ResourceType,
    ) -> Result<ResourceResponse> {
        self.project_for(caller, project_id, Capability::Read)?;
        self.resources.get(project_id, resource_type).await
    }

    /// Resource with its last provisioning error and attempt count.
    pub async fn resource_status(
        &self,
        caller: UserId,
        project_id: ProjectId,
        resource_type: ResourceType,
    ) -> Result<ResourceStatus> {
        self.project_for(caller, project_id, Capability::Read)?;
        self.resources.status(project_id, resource_type).await
    }

    pub async fn list_resources(&self, caller: UserId, project_id: ProjectId) -> Result<ResourceListResponse> {
        self.project_for(caller, project_id, Capability::Read)?;
        Ok(self.resources.list(project_id).await)
    }

    /// Wait until a resource settles. A resource that ends up `Failed` is reported as
    /// [`Error::Provisioning`] carrying the last driver error. After `timeout` the current,
    /// still unsettled status is returned.
    pub async fn wait_for_resource(
        &self,
        caller: UserId,
        project_id: ProjectId,
        resource_type: ResourceType,
        timeout: Duration,
    ) -> Result<ResourceStatus> {
        self.project_for(caller, project_id, Capability::Read)?;
        // Subscribe before the first read so no transition falls in between
        let events = self.events.project_stream(project_id);
        match tokio::time::timeout(timeout, self.settle(events, project_id, resource_type)).await {
            Ok(result) => result,
            Err(_) => self.resources.status(project_id, resource_type).await,
        }
    }

    async fn settle(
        &self,
        events: impl Stream<Item = StateEvent>,
        project_id: ProjectId,
        resource_type: ResourceType,
    ) -> Result<ResourceStatus> {
        tokio::pin!(events);
        loop {
            let status = self.resources.status(project_id, resource_type).await?;
            match status.resource.state {
                ResourceState::Ready | ResourceState::Deleted => return Ok(status),
                ResourceState::Failed => {
                    return Err(Error::Provisioning {
                        resource: resource_type.to_string(),
                        message: status.last_error.unwrap_or_else(|| "unknown error".to_string()),
                    });
                }
                _ => {}
            }

            loop {
                match events.next().await {
                    Some(StateEvent::Resource { resource_type: ty, .. }) if ty == resource_type => break,
                    Some(_) => {}
                    None => return Err(Error::invariant("wait for resource: event stream closed")),
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------------

    pub fn current_user(&self, caller: UserId) -> Result<UserResponse> {
        self.accounts.user_response(caller)
    }

    /// Stop deployments of free tier projects whose latest deployment is older than `idle` and
    /// still active. Oldest projects first, at most `limit` of them. With `stop` unset nothing
    /// is changed and the candidates are only reported.
    #[instrument(skip_all, fields(caller = %abbrev_uuid(&caller), idle_days = idle.num_days(), stop = stop), err)]
    pub async fn gc_idle_projects(
        &self,
        caller: UserId,
        idle: chrono::Duration,
        stop: bool,
        limit: usize,
    ) -> Result<Vec<ProjectId>> {
        self.require_admin(caller, "idle project collection")?;
        let cutoff = Utc::now() - idle;

        let mut idle_projects = Vec::new();
        for project in self.projects.list_all() {
            if idle_projects.len() >= limit {
                break;
            }
            if !matches!(self.accounts.tier(project.user_id()), Ok(AccountTier::Basic)) {
                continue;
            }
            let Some(current) = self.deployments.current(project.id).await else {
                continue;
            };
            if current.state.is_active() && current.created_at < cutoff {
                idle_projects.push(project.id);
            }
        }

        if stop {
            for project_id in &idle_projects {
                let stopped = self.deployments.stop_project(*project_id).await;
                info!(project_id = %abbrev_uuid(project_id), stopped = stopped.len(), "Idle project stopped");
            }
        }
        metrics::counter!("deckhand_idle_projects_collected_total").increment(idle_projects.len() as u64);
        Ok(idle_projects)
    }

    /// Remove an account. Its own projects have their deployments stopped, their resources
    /// deleted and their records removed; team projects it created stay with the team.
    /// Refused while the account is the last Owner of a team. Returns the removed projects.
    #[instrument(skip_all, fields(caller = %abbrev_uuid(&caller), user_id = %abbrev_uuid(&user)), err)]
    pub async fn delete_user(&self, caller: UserId, user: UserId) -> Result<Vec<ProjectId>> {
        self.require_admin(caller, "account deletion")?;
        self.accounts.remove_account(user)?;

        let owned = self.projects.projects_of(Owner::User(user));
        for project_id in &owned {
            self.deployments.stop_project(*project_id).await;
            self.resources.delete_all(*project_id).await;
            if let Err(e) = self.projects.delete(*project_id) {
                tracing::warn!(project_id = %abbrev_uuid(project_id), error = %e, "Project already gone");
            }
        }
        self.quota_locks.remove(&Owner::User(user));
        info!(projects = owned.len(), "User deleted");
        Ok(owned)
    }

    // ------------------------------------------------------------------------
    // Teams
    // ------------------------------------------------------------------------

    /// Create a team with the caller as Owner. Other team operations go through [`Self::accounts`].
    pub fn create_team(&self, caller: UserId, request: TeamCreateRequest) -> Result<TeamResponse> {
        let tier = self.accounts.tier(caller)?;
        self.policy
            .evaluate(tier, &UsageSnapshot::default(), &Operation::CreateTeam)
            .into_result()?;
        self.accounts.create_team(caller, request)
    }

    // ------------------------------------------------------------------------
    // Telemetry sinks
    // ------------------------------------------------------------------------

    pub fn set_telemetry_sink(
        &self,
        caller: UserId,
        project_id: ProjectId,
        config: TelemetrySinkConfig,
    ) -> Result<TelemetryConfigResponse> {
        self.project_for(caller, project_id, Capability::ManageResources)?;
        self.projects.set_telemetry(project_id, config)
    }

    pub fn remove_telemetry_sink(
        &self,
        caller: UserId,
        project_id: ProjectId,
        sink: TelemetrySink,
    ) -> Result<TelemetryConfigResponse> {
        self.project_for(caller, project_id, Capability::ManageResources)?;
        self.projects.remove_telemetry(project_id, sink)
    }

    pub fn telemetry_config(&self, caller: UserId, project_id: ProjectId) -> Result<TelemetryConfigResponse> {
        self.project_for(caller, project_id, Capability::Read)?;
        self.projects.telemetry(project_id)
    }

    // ------------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------------

    pub async fn project_usage(
        &self,
        caller: UserId,
        project_id: ProjectId,
        cycle: BillingCycle,
    ) -> Result<ProjectUsageResponse> {
        self.project_for(caller, project_id, Capability::Read)?;
        let history = self.deployments.history(project_id).await;
        Ok(usage::project_usage(project_id, &history, cycle, Utc::now()))
    }

    /// Usage of every project billed to the caller.
    pub async fn user_usage(&self, caller: UserId, cycle: BillingCycle) -> Result<UserUsageResponse> {
        self.accounts.account(caller)?;
        let mut projects = Vec::new();
        for project_id in self.projects.billed_to(caller) {
            projects.push((project_id, self.deployments.history(project_id).await));
        }
        Ok(usage::user_usage(
            caller,
            &projects,
            cycle,
            self.config.usage.included_vcpu_hours,
            Utc::now(),
        ))
    }
}
