//! Deployment state machine.
//!
//! Each deployment sits behind its own mutex. Every project also has a mutex over its
//! ordered deployment list; it is taken before any deployment lock by every operation that
//! looks at more than one deployment (submission, ready reports, anything that can end a
//! predecessor's draining). That lock is what keeps at most one active deployment per project.
//!
//! Executor calls are made after all locks are released.

pub mod executor;
pub mod states;

use crate::api::models::deployments::{BuildArgs, DeploymentListResponse, DeploymentRequest, DeploymentResponse, DeploymentState};
use crate::api::models::projects::ComputeTier;
use crate::errors::{Error, Result};
use crate::events::EventBus;
use crate::types::{DeploymentId, ProjectId, abbrev_uuid};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use executor::{BuildExecutor, DeploymentJob};
use states::{AnyDeployment, Awaiting, Deployment, ReadyReport};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

/// Lifecycle of one deployment, as consumed by usage aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentHistory {
    pub deployment_id: DeploymentId,
    pub project_id: ProjectId,
    pub compute_tier: ComputeTier,
    pub image: bool,
    pub transitions: Vec<(DeploymentState, DateTime<Utc>)>,
}

#[derive(Clone)]
struct Slot {
    project_id: ProjectId,
    entity: Arc<Mutex<AnyDeployment>>,
}

type Teardowns = Vec<(ProjectId, DeploymentId)>;

fn validate(request: &DeploymentRequest) -> Result<()> {
    match request {
        DeploymentRequest::BuildArchive(archive) => {
            if archive.archive_version_id.trim().is_empty() {
                return Err(Error::validation("archive_version_id must not be empty"));
            }
            if matches!(archive.build_args, Some(BuildArgs::Unknown)) {
                return Err(Error::validation("Unsupported build args type"));
            }
        }
        DeploymentRequest::Image(image) => {
            if image.image.trim().is_empty() {
                return Err(Error::validation("image must not be empty"));
            }
        }
    }
    Ok(())
}

pub struct DeploymentMachine {
    deployments: DashMap<DeploymentId, Slot>,
    projects: DashMap<ProjectId, Arc<Mutex<Vec<DeploymentId>>>>,
    executor: Arc<dyn BuildExecutor>,
    events: EventBus,
}

impl DeploymentMachine {
    pub fn new(executor: Arc<dyn BuildExecutor>, events: EventBus) -> Self {
        Self {
            deployments: DashMap::new(),
            projects: DashMap::new(),
            executor,
            events,
        }
    }

    fn project(&self, project_id: ProjectId) -> Arc<Mutex<Vec<DeploymentId>>> {
        self.projects.entry(project_id).or_default().clone()
    }

    fn slot(&self, id: DeploymentId) -> Result<Slot> {
        self.deployments
            .get(&id)
            .map(|slot| slot.clone())
            .ok_or_else(|| Error::not_found("Deployment", id))
    }

    fn emit(&self, deployment: &AnyDeployment, from: Option<DeploymentState>) {
        let data = deployment.data();
        let to = deployment.state();
        tracing::info!(
            deployment_id = %abbrev_uuid(&data.id),
            project_id = %abbrev_uuid(&data.project_id),
            from = ?from,
            to = %to,
            "Deployment transition"
        );
        self.events.deployment(data.project_id, data.id, from, to);
    }

    fn replace(&self, current: &mut AnyDeployment, next: impl Into<AnyDeployment>) {
        let from = current.state();
        *current = next.into();
        self.emit(current, Some(from));
    }

    /// Move a deployment towards Stopped. Caller holds the project lock.
    fn stop_locked(&self, current: &mut AnyDeployment, teardowns: &mut Teardowns) {
        match current.clone() {
            AnyDeployment::Pending(d) => {
                let (stopping, stopped) = d.stop();
                self.replace(current, stopping);
                self.replace(current, stopped);
            }
            AnyDeployment::Building(d) => {
                let stopping = d.stop();
                if stopping.state.awaiting == Awaiting::Teardown {
                    teardowns.push((stopping.data.project_id, stopping.data.id));
                }
                self.replace(current, stopping);
            }
            AnyDeployment::InProgress(d) => {
                let stopping = d.stop();
                if stopping.state.awaiting == Awaiting::Teardown {
                    teardowns.push((stopping.data.project_id, stopping.data.id));
                }
                self.replace(current, stopping);
            }
            AnyDeployment::Running(d) => {
                teardowns.push((d.data.project_id, d.data.id));
                self.replace(current, d.stop());
            }
            AnyDeployment::Stopping(_) | AnyDeployment::Stopped(_) | AnyDeployment::Failed(_) => {}
        }
    }

    /// Promote deployments whose ready report waited on a draining predecessor. Caller holds
    /// the project lock and no deployment lock.
    async fn promote_deferred(&self, ids: &[DeploymentId]) {
        let mut predecessor_stopping = false;
        for id in ids {
            let Ok(slot) = self.slot(*id) else { continue };
            let mut current = slot.entity.lock().await;
            let report = current.data().deferred_ready.clone();
            match (current.clone(), report) {
                (AnyDeployment::Stopping(_), _) => predecessor_stopping = true,
                (AnyDeployment::Building(d), Some(report)) if !predecessor_stopping => {
                    tracing::info!(deployment_id = %abbrev_uuid(id), "Predecessors stopped, promoting deferred deployment");
                    self.replace(&mut current, d.ready(report));
                }
                (AnyDeployment::InProgress(d), Some(report)) if !predecessor_stopping => {
                    tracing::info!(deployment_id = %abbrev_uuid(id), "Predecessors stopped, promoting deferred deployment");
                    self.replace(&mut current, d.ready(report));
                }
                _ => {}
            }
        }
    }

    /// Hand teardowns to the executor. Caller holds no lock. A refused teardown fails the
    /// deployment, which releases any successor waiting on it.
    async fn teardown(&self, teardowns: Teardowns) {
        for (project_id, deployment_id) in teardowns {
            if let Err(e) = self.executor.teardown(project_id, deployment_id).await {
                tracing::warn!(
                    deployment_id = %abbrev_uuid(&deployment_id),
                    error = %e,
                    "Teardown request failed"
                );
                if let Err(e) = self.fail(deployment_id, format!("Teardown failed: {e}")).await {
                    tracing::error!(deployment_id = %abbrev_uuid(&deployment_id), error = %e, "Could not fail deployment after teardown error");
                }
            }
        }
    }

    /// Submit a deployment. Every active deployment of the project is superseded; the new one
    /// starts Pending and is handed to the executor once the project lock is released.
    #[instrument(skip_all, fields(project_id = %abbrev_uuid(&project_id), image = request.is_image()), err)]
    pub async fn submit(&self, project_id: ProjectId, request: DeploymentRequest, compute_tier: ComputeTier) -> Result<DeploymentResponse> {
        validate(&request)?;

        let project = self.project(project_id);
        let mut teardowns = Teardowns::new();
        let (response, job) = {
            let mut ids = project.lock().await;

            // Supersede before inserting so no observer sees two active deployments
            for id in ids.iter() {
                let Ok(slot) = self.slot(*id) else { continue };
                let mut current = slot.entity.lock().await;
                if current.state().is_active() {
                    tracing::info!(superseded = %abbrev_uuid(id), "Superseding active deployment");
                    self.stop_locked(&mut current, &mut teardowns);
                }
            }

            let deployment = Deployment::new(project_id, request.clone(), compute_tier);
            let job = DeploymentJob {
                deployment_id: deployment.data.id,
                project_id,
                request,
                compute_tier,
            };
            let deployment = AnyDeployment::from(deployment);
            let response = deployment.to_response();
            self.emit(&deployment, None);
            self.deployments.insert(
                response.id,
                Slot {
                    project_id,
                    entity: Arc::new(Mutex::new(deployment)),
                },
            );
            ids.push(response.id);
            (response, job)
        };

        self.teardown(teardowns).await;

        let id = response.id;
        if let Err(e) = self.executor.dispatch(job).await {
            tracing::error!(deployment_id = %abbrev_uuid(&id), error = %e, "Failed to dispatch deployment");
            return self.fail(id, format!("Failed to dispatch deployment: {e}")).await;
        }
        Ok(response)
    }

    /// The executor picked the deployment up. Claiming twice is a no-op.
    #[instrument(skip_all, fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn claim(&self, id: DeploymentId) -> Result<DeploymentResponse> {
        let slot = self.slot(id)?;
        let mut current = slot.entity.lock().await;
        match current.clone() {
            AnyDeployment::Pending(d) if d.data.request.is_image() => self.replace(&mut current, d.start()),
            AnyDeployment::Pending(d) => self.replace(&mut current, d.build()),
            AnyDeployment::Building(_) | AnyDeployment::InProgress(_) => {}
            AnyDeployment::Stopping(_) | AnyDeployment::Stopped(_) => {
                return Err(Error::conflict(format!("Deployment {id} has been told to stop")));
            }
            other => {
                return Err(Error::conflict(format!(
                    "Deployment {id} cannot be claimed while {}",
                    other.state()
                )));
            }
        }
        Ok(current.to_response())
    }

    /// The build succeeded and the container is healthy. Promotion waits while a predecessor
    /// is still stopping.
    #[instrument(skip_all, fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn report_ready(&self, id: DeploymentId, build_id: Option<String>, uris: Vec<String>) -> Result<DeploymentResponse> {
        if uris.is_empty() || uris.iter().any(|u| u.trim().is_empty()) {
            return Err(Error::validation("A running deployment needs at least one non-empty URI"));
        }

        let slot = self.slot(id)?;
        let project = self.project(slot.project_id);
        let ids = project.lock().await;

        let mut predecessor_stopping = false;
        for other in ids.iter().take_while(|other| **other != id) {
            let Ok(other) = self.slot(*other) else { continue };
            if other.entity.lock().await.state() == DeploymentState::Stopping {
                predecessor_stopping = true;
                break;
            }
        }

        let report = ReadyReport { build_id, uris };
        let mut teardowns = Teardowns::new();
        let response = {
            let mut current = slot.entity.lock().await;
            match current.clone() {
                AnyDeployment::Building(mut d) if predecessor_stopping => {
                    tracing::info!("Predecessor still stopping, deferring promotion");
                    d.defer_ready(report);
                    *current = d.into();
                }
                AnyDeployment::InProgress(mut d) if predecessor_stopping => {
                    tracing::info!("Predecessor still stopping, deferring promotion");
                    d.defer_ready(report);
                    *current = d.into();
                }
                AnyDeployment::Building(d) => self.replace(&mut current, d.ready(report)),
                AnyDeployment::InProgress(d) => self.replace(&mut current, d.ready(report)),
                AnyDeployment::Running(_) => {}
                AnyDeployment::Stopping(d) if d.state.awaiting == Awaiting::Build => {
                    // Stopped while building: what the build started has to come down again
                    teardowns.push((d.data.project_id, d.data.id));
                    *current = d.build_finished(report.build_id).into();
                }
                AnyDeployment::Stopping(_) => {}
                AnyDeployment::Pending(_) => {
                    return Err(Error::conflict(format!("Deployment {id} has not been claimed")));
                }
                other => {
                    return Err(Error::conflict(format!("Deployment {id} is already {}", other.state())));
                }
            }
            current.to_response()
        };
        drop(ids);

        self.teardown(teardowns).await;
        Ok(response)
    }

    #[instrument(skip_all, fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn report_build_failed(&self, id: DeploymentId, reason: String) -> Result<DeploymentResponse> {
        let slot = self.slot(id)?;
        let project = self.project(slot.project_id);
        let ids = project.lock().await;
        let response = {
            let mut current = slot.entity.lock().await;
            match current.clone() {
                AnyDeployment::Building(d) => self.replace(&mut current, d.build_failed(reason)),
                AnyDeployment::InProgress(d) => self.replace(&mut current, d.build_failed(reason)),
                // The pending stop is applied now that the build resolved
                AnyDeployment::Stopping(d) if d.state.awaiting == Awaiting::Build => self.replace(&mut current, d.confirm()),
                AnyDeployment::Stopping(_) | AnyDeployment::Failed(_) => {}
                other => {
                    return Err(Error::conflict(format!(
                        "Deployment {id} is not building (currently {})",
                        other.state()
                    )));
                }
            }
            current.to_response()
        };
        self.promote_deferred(&ids).await;
        Ok(response)
    }

    /// Stop a deployment. Stopping a deployment that is already stopping or finished is a no-op.
    #[instrument(skip_all, fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn stop(&self, id: DeploymentId) -> Result<DeploymentResponse> {
        let slot = self.slot(id)?;
        let project = self.project(slot.project_id);
        let ids = project.lock().await;
        let mut teardowns = Teardowns::new();
        let response = {
            let mut current = slot.entity.lock().await;
            self.stop_locked(&mut current, &mut teardowns);
            current.to_response()
        };
        self.promote_deferred(&ids).await;
        drop(ids);

        self.teardown(teardowns).await;
        Ok(response)
    }

    /// The executor finished tearing the deployment down.
    #[instrument(skip_all, fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn confirm_stopped(&self, id: DeploymentId) -> Result<DeploymentResponse> {
        let slot = self.slot(id)?;
        let project = self.project(slot.project_id);
        let ids = project.lock().await;
        let response = {
            let mut current = slot.entity.lock().await;
            match current.clone() {
                AnyDeployment::Stopping(d) => self.replace(&mut current, d.confirm()),
                AnyDeployment::Stopped(_) => {}
                other => {
                    return Err(Error::conflict(format!("Deployment {id} is not stopping (currently {})", other.state())));
                }
            }
            current.to_response()
        };
        self.promote_deferred(&ids).await;
        Ok(response)
    }

    /// Unrecoverable infrastructure fault. Finished deployments are left alone.
    #[instrument(skip_all, fields(deployment_id = %abbrev_uuid(&id)), err)]
    pub async fn fail(&self, id: DeploymentId, reason: String) -> Result<DeploymentResponse> {
        let slot = self.slot(id)?;
        let project = self.project(slot.project_id);
        let ids = project.lock().await;
        let response = {
            let mut current = slot.entity.lock().await;
            tracing::warn!(reason = %reason, "Deployment failed");
            match current.clone() {
                AnyDeployment::Pending(d) => self.replace(&mut current, d.fail(reason)),
                AnyDeployment::Building(d) => self.replace(&mut current, d.fail(reason)),
                AnyDeployment::InProgress(d) => self.replace(&mut current, d.fail(reason)),
                AnyDeployment::Running(d) => self.replace(&mut current, d.fail(reason)),
                AnyDeployment::Stopping(d) => self.replace(&mut current, d.fail(reason)),
                AnyDeployment::Stopped(_) | AnyDeployment::Failed(_) => {}
            }
            current.to_response()
        };
        self.promote_deferred(&ids).await;
        Ok(response)
    }

    /// Stop every active deployment of a project. Returns the deployments that were stopped.
    #[instrument(skip_all, fields(project_id = %abbrev_uuid(&project_id)))]
    pub async fn stop_project(&self, project_id: ProjectId) -> Vec<DeploymentId> {
        let mut stopped = Vec::new();
        for id in self.ids(project_id).await {
            let Ok(slot) = self.slot(id) else { continue };
            let active = slot.entity.lock().await.state().is_active();
            if active && self.stop(id).await.is_ok() {
                stopped.push(id);
            }
        }
        stopped
    }

    pub async fn get(&self, id: DeploymentId) -> Result<DeploymentResponse> {
        let slot = self.slot(id)?;
        let current = slot.entity.lock().await;
        Ok(current.to_response())
    }

    /// Project the deployment belongs to.
    pub fn project_of(&self, id: DeploymentId) -> Result<ProjectId> {
        self.slot(id).map(|slot| slot.project_id)
    }

    async fn ids(&self, project_id: ProjectId) -> Vec<DeploymentId> {
        match self.projects.get(&project_id).map(|p| p.clone()) {
            Some(project) => project.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Deployments of a project, newest first.
    pub async fn list(&self, project_id: ProjectId) -> DeploymentListResponse {
        let mut deployments = Vec::new();
        for id in self.ids(project_id).await.into_iter().rev() {
            if let Ok(slot) = self.slot(id) {
                deployments.push(slot.entity.lock().await.to_response());
            }
        }
        DeploymentListResponse { deployments }
    }

    /// The most recent deployment of a project.
    pub async fn current(&self, project_id: ProjectId) -> Option<DeploymentResponse> {
        let id = self.ids(project_id).await.last().copied()?;
        let slot = self.slot(id).ok()?;
        let current = slot.entity.lock().await;
        Some(current.to_response())
    }

    pub async fn has_active(&self, project_id: ProjectId) -> bool {
        for id in self.ids(project_id).await {
            let Ok(slot) = self.slot(id) else { continue };
            if slot.entity.lock().await.state().is_active() {
                return true;
            }
        }
        false
    }

    pub async fn history(&self, project_id: ProjectId) -> Vec<DeploymentHistory> {
        let mut history = Vec::new();
        for id in self.ids(project_id).await {
            if let Ok(slot) = self.slot(id) {
                let current = slot.entity.lock().await;
                let data = current.data();
                history.push(DeploymentHistory {
                    deployment_id: data.id,
                    project_id: data.project_id,
                    compute_tier: data.compute_tier,
                    image: data.request.is_image(),
                    transitions: data.transitions.clone(),
                });
            }
        }
        history
    }
}
