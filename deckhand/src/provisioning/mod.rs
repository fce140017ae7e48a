//! Resource provisioning state machine.
//!
//! Resources are keyed by `(project, type)`: a project has at most one resource of each type.
//! Every resource lives behind its own mutex so transitions of one resource are serialized
//! while different resources, even in the same project, move independently.
//!
//! A request that needs a driver puts the resource in an in-flight state, queues a
//! [`ProvisionJob`] for the [`daemon::ProvisioningDaemon`] and returns. The daemon reports back
//! through [`ResourceMachine::complete_provision`] / [`ResourceMachine::complete_deprovision`].
//! Each in-flight phase carries a generation token; completions for an older generation are
//! dropped.

pub mod daemon;
pub mod drivers;
pub mod registry;
pub mod states;

use crate::api::models::resources::{ProvisionResourceRequest, ResourceListResponse, ResourceResponse, ResourceState, ResourceType};
use crate::errors::{Error, Result};
use crate::events::EventBus;
use crate::policy::Decision;
use crate::types::{ProjectId, abbrev_uuid};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use drivers::{JobKind, ProvisionJob};
use registry::{ResourceConfig, ResourceOutput};
use serde::Serialize;
use states::{AnyResource, Resource, ResourceData};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::instrument;

pub type ResourceKey = (ProjectId, ResourceType);

/// Operator view of a resource: the contract response plus retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStatus {
    #[serde(flatten)]
    pub resource: ResourceResponse,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub pending_delete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the daemon should do before its next driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptCheck {
    Proceed,
    /// The resource moved on; drop the job
    Stale,
    /// A delete arrived during provisioning; stop retrying and resolve now
    DeleteRequested,
}

fn job_for(kind: JobKind, data: &ResourceData, output: Option<ResourceOutput>) -> ProvisionJob {
    ProvisionJob {
        kind,
        project_id: data.project_id,
        resource_type: data.r#type,
        config: data.config.clone(),
        output,
        generation: data.generation,
        attempt: 0,
    }
}

pub struct ResourceMachine {
    resources: DashMap<ResourceKey, Arc<Mutex<AnyResource>>>,
    jobs: mpsc::UnboundedSender<ProvisionJob>,
    events: EventBus,
}

impl ResourceMachine {
    /// Create the machine and the job queue its daemon consumes.
    pub fn new(events: EventBus) -> (Self, mpsc::UnboundedReceiver<ProvisionJob>) {
        let (jobs, rx) = mpsc::unbounded_channel();
        (
            Self {
                resources: DashMap::new(),
                jobs,
                events,
            },
            rx,
        )
    }

    /// Queue the job for a resource that was just moved in flight. Without a daemon to pick
    /// it up the resource fails at once.
    fn enqueue(&self, resource: &mut AnyResource, job: ProvisionJob) {
        let (project_id, ty, kind) = (job.project_id, job.resource_type, job.kind);
        if self.jobs.send(job).is_ok() {
            return;
        }
        tracing::error!(
            project_id = %abbrev_uuid(&project_id),
            resource_type = %ty,
            ?kind,
            "Provisioning daemon is not running, job dropped"
        );
        let error = "Provisioning daemon is not running".to_string();
        let from = resource.state();
        *resource = match resource.clone() {
            AnyResource::Provisioning(r) => r.fail(error).into(),
            AnyResource::Deleting(r) => r.fail(error).into(),
            _ => return,
        };
        self.emit(project_id, ty, Some(from), resource.state());
    }

    fn emit(&self, project_id: ProjectId, ty: ResourceType, from: Option<ResourceState>, to: ResourceState) {
        tracing::info!(
            project_id = %abbrev_uuid(&project_id),
            resource_type = %ty,
            from = ?from,
            to = %to,
            "Resource transition"
        );
        self.events.resource(project_id, ty, from, to);
    }

    fn slot(&self, project_id: ProjectId, ty: ResourceType) -> Result<Arc<Mutex<AnyResource>>> {
        self.resources
            .get(&(project_id, ty))
            .map(|slot| slot.clone())
            .ok_or_else(|| Error::not_found("Resource", ty))
    }

    /// Request a resource. The quota `decision` was made by the caller against a usage
    /// snapshot; a denial leaves everything untouched.
    #[instrument(skip_all, fields(project_id = %abbrev_uuid(&project_id), resource_type = %request.r#type))]
    pub async fn request(&self, project_id: ProjectId, request: ProvisionResourceRequest, decision: Decision) -> Result<ResourceResponse> {
        let ty = request.r#type;
        let config = ResourceConfig::parse(ty, &request.config)?;

        let slot = match self.resources.entry((project_id, ty)) {
            Entry::Vacant(entry) => {
                let resource = Resource::new(project_id, ty, config).authorize(decision)?;
                let job = job_for(JobKind::Provision, &resource.data, None);
                let mut any = AnyResource::from(resource);
                self.emit(project_id, ty, None, ResourceState::Provisioning);
                self.enqueue(&mut any, job);
                let response = any.to_response();
                entry.insert(Arc::new(Mutex::new(any)));
                return Ok(response);
            }
            Entry::Occupied(entry) => entry.get().clone(),
        };

        let mut guard = slot.lock().await;
        let from = guard.state();
        match &*guard {
            AnyResource::Ready(_) => return Ok(guard.to_response()),
            AnyResource::Provisioning(_) | AnyResource::Deleting(_) => {
                return Err(Error::conflict(format!("{ty} is currently {from}")));
            }
            AnyResource::Failed(_) | AnyResource::Deleted(_) => {}
        }

        // Replace the terminal record, keeping the generation monotonic
        let mut fresh = Resource::new(project_id, ty, config);
        fresh.data.generation = guard.data().generation;
        let resource = fresh.authorize(decision)?;
        let job = job_for(JobKind::Provision, &resource.data, None);
        *guard = resource.into();
        self.emit(project_id, ty, Some(from), ResourceState::Provisioning);
        self.enqueue(&mut guard, job);
        Ok(guard.to_response())
    }

    /// Delete a resource. Deleting an already deleted resource succeeds without touching it;
    /// deleting one whose provisioning is still in flight is recorded and applied when the
    /// driver call resolves.
    #[instrument(skip_all, fields(project_id = %abbrev_uuid(&project_id), resource_type = %resource_type))]
    pub async fn delete(&self, project_id: ProjectId, resource_type: ResourceType) -> Result<ResourceResponse> {
        let slot = self.slot(project_id, resource_type)?;
        let mut guard = slot.lock().await;
        self.begin_delete(&mut guard);
        Ok(guard.to_response())
    }

    /// Delete every resource of a project. Returns how many deletions were started or deferred.
    #[instrument(skip_all, fields(project_id = %abbrev_uuid(&project_id)))]
    pub async fn delete_all(&self, project_id: ProjectId) -> usize {
        let mut started = 0;
        for (_, slot) in self.project_slots(project_id) {
            let mut guard = slot.lock().await;
            if matches!(
                guard.state(),
                ResourceState::Provisioning | ResourceState::Ready | ResourceState::Failed
            ) {
                self.begin_delete(&mut guard);
                started += 1;
            }
        }
        started
    }

    fn begin_delete(&self, resource: &mut AnyResource) {
        let from = resource.state();
        let (deleting, output) = match resource.clone() {
            AnyResource::Ready(r) => {
                let output = r.state.output.clone();
                (r.delete(), Some(output))
            }
            AnyResource::Failed(r) => (r.delete(), None),
            AnyResource::Provisioning(_) => {
                tracing::info!("Delete requested during provisioning, deferring");
                resource.data_mut().pending_delete = true;
                return;
            }
            AnyResource::Deleting(_) | AnyResource::Deleted(_) => return,
        };
        let data = &deleting.data;
        let job = job_for(JobKind::Deprovision, data, output);
        let (project_id, ty) = (data.project_id, data.r#type);
        *resource = deleting.into();
        self.emit(project_id, ty, Some(from), ResourceState::Deleting);
        self.enqueue(resource, job);
    }

    /// Called by the daemon before each driver call.
    pub async fn begin_attempt(&self, job: &ProvisionJob, attempt: u32) -> AttemptCheck {
        let Ok(slot) = self.slot(job.project_id, job.resource_type) else {
            return AttemptCheck::Stale;
        };
        let mut guard = slot.lock().await;
        let expected = match job.kind {
            JobKind::Provision => matches!(*guard, AnyResource::Provisioning(_)),
            JobKind::Deprovision => matches!(*guard, AnyResource::Deleting(_)),
        };
        if !expected || guard.data().generation != job.generation {
            return AttemptCheck::Stale;
        }
        let data = guard.data_mut();
        if job.kind == JobKind::Provision && data.pending_delete {
            return AttemptCheck::DeleteRequested;
        }
        data.attempts = attempt + 1;
        AttemptCheck::Proceed
    }

    /// Record a failed attempt that will be retried.
    pub async fn record_error(&self, job: &ProvisionJob, error: &str) {
        if let Ok(slot) = self.slot(job.project_id, job.resource_type) {
            let mut guard = slot.lock().await;
            if guard.is_in_flight() && guard.data().generation == job.generation {
                guard.data_mut().last_error = Some(error.to_string());
            }
        }
    }

    /// Resolve a provisioning phase. A pending delete is applied straight after.
    #[instrument(skip_all, fields(project_id = %abbrev_uuid(&job.project_id), resource_type = %job.resource_type, generation = job.generation))]
    pub async fn complete_provision(&self, job: &ProvisionJob, result: std::result::Result<ResourceOutput, String>) {
        let Ok(slot) = self.slot(job.project_id, job.resource_type) else {
            return;
        };
        let mut guard = slot.lock().await;
        let resource = match &*guard {
            AnyResource::Provisioning(r) if r.data.generation == job.generation => r.clone(),
            _ => {
                tracing::debug!("Ignoring stale provisioning completion");
                return;
            }
        };

        let result = result.and_then(|output| {
            if output.matches(job.resource_type) {
                Ok(output)
            } else {
                tracing::error!(?output, "Driver returned output of the wrong shape");
                Err(format!("Driver returned output of the wrong shape for {}", job.resource_type))
            }
        });

        let pending_delete = resource.data.pending_delete;
        *guard = match result {
            Ok(output) => resource.complete(output).into(),
            Err(error) => {
                tracing::warn!(error = %error, "Provisioning failed");
                resource.fail(error).into()
            }
        };
        self.emit(job.project_id, job.resource_type, Some(ResourceState::Provisioning), guard.state());

        if pending_delete {
            self.begin_delete(&mut guard);
        }
    }

    /// Resolve a deprovisioning phase.
    #[instrument(skip_all, fields(project_id = %abbrev_uuid(&job.project_id), resource_type = %job.resource_type, generation = job.generation))]
    pub async fn complete_deprovision(&self, job: &ProvisionJob, result: std::result::Result<(), String>) {
        let Ok(slot) = self.slot(job.project_id, job.resource_type) else {
            return;
        };
        let mut guard = slot.lock().await;
        let resource = match &*guard {
            AnyResource::Deleting(r) if r.data.generation == job.generation => r.clone(),
            _ => {
                tracing::debug!("Ignoring stale deprovisioning completion");
                return;
            }
        };
        *guard = match result {
            Ok(()) => resource.complete().into(),
            Err(error) => {
                tracing::warn!(error = %error, "Deprovisioning failed");
                resource.fail(error).into()
            }
        };
        self.emit(job.project_id, job.resource_type, Some(ResourceState::Deleting), guard.state());
    }

    pub async fn get(&self, project_id: ProjectId, resource_type: ResourceType) -> Result<ResourceResponse> {
        let slot = self.slot(project_id, resource_type)?;
        let guard = slot.lock().await;
        Ok(guard.to_response())
    }

    pub async fn status(&self, project_id: ProjectId, resource_type: ResourceType) -> Result<ResourceStatus> {
        let slot = self.slot(project_id, resource_type)?;
        let guard = slot.lock().await;
        let data = guard.data();
        Ok(ResourceStatus {
            resource: guard.to_response(),
            last_error: data.last_error.clone(),
            attempts: data.attempts,
            pending_delete: data.pending_delete,
            created_at: data.created_at,
            updated_at: data.updated_at,
        })
    }

    fn project_slots(&self, project_id: ProjectId) -> Vec<(ResourceType, Arc<Mutex<AnyResource>>)> {
        let mut slots: Vec<_> = self
            .resources
            .iter()
            .filter(|entry| entry.key().0 == project_id)
            .map(|entry| (entry.key().1, entry.value().clone()))
            .collect();
        slots.sort_by_key(|(ty, _)| *ty);
        slots
    }

    /// Resources of a project, excluding deleted ones.
    pub async fn list(&self, project_id: ProjectId) -> ResourceListResponse {
        let mut resources = Vec::new();
        for (_, slot) in self.project_slots(project_id) {
            let guard = slot.lock().await;
            if guard.state() != ResourceState::Deleted {
                resources.push(guard.to_response());
            }
        }
        ResourceListResponse { resources }
    }

    /// Whether any resource of the project still holds, or may hold, infrastructure.
    pub async fn has_live(&self, project_id: ProjectId) -> bool {
        for (_, slot) in self.project_slots(project_id) {
            if slot.lock().await.state() != ResourceState::Deleted {
                return true;
            }
        }
        false
    }

    /// Dedicated database instances across `projects` that count against an RDS allowance.
    pub async fn count_live_rds(&self, projects: &[ProjectId]) -> u32 {
        let slots: Vec<_> = self
            .resources
            .iter()
            .filter(|entry| entry.key().1.is_rds() && projects.contains(&entry.key().0))
            .map(|entry| entry.value().clone())
            .collect();
        let mut count = 0;
        for slot in slots {
            let state = slot.lock().await.state();
            if matches!(state, ResourceState::Provisioning | ResourceState::Ready | ResourceState::Deleting) {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use uuid::Uuid;

    fn machine() -> (ResourceMachine, mpsc::UnboundedReceiver<ProvisionJob>) {
        ResourceMachine::new(EventBus::new(64))
    }

    fn request(ty: ResourceType) -> ProvisionResourceRequest {
        ProvisionResourceRequest {
            r#type: ty,
            config: Value::Null,
        }
    }

    async fn provisioned(machine: &ResourceMachine, rx: &mut mpsc::UnboundedReceiver<ProvisionJob>, project: ProjectId) -> ProvisionJob {
        machine
            .request(project, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap();
        let job = rx.recv().await.unwrap();
        machine
            .complete_provision(&job, Ok(drivers::MockDriver::default_output(ResourceType::DatabaseSharedPostgres)))
            .await;
        job
    }

    #[tokio::test]
    async fn test_request_queues_job_and_returns_immediately() {
        let (machine, mut rx) = machine();
        let project = Uuid::new_v4();
        let response = machine
            .request(project, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap();
        assert_eq!(response.state, ResourceState::Provisioning);
        assert!(response.output.is_null());

        let job = rx.try_recv().unwrap();
        assert_eq!(job.kind, JobKind::Provision);
        assert_eq!(job.generation, 1);
    }

    #[tokio::test]
    async fn test_request_without_daemon_fails_at_once() {
        let (machine, rx) = machine();
        drop(rx);
        let project = Uuid::new_v4();
        let response = machine
            .request(project, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap();
        assert_eq!(response.state, ResourceState::Failed);

        let status = machine.status(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        assert_eq!(status.last_error.as_deref(), Some("Provisioning daemon is not running"));

        let deleted = machine.delete(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        assert_eq!(deleted.state, ResourceState::Failed);
    }

    #[tokio::test]
    async fn test_denied_request_stores_nothing() {
        let (machine, mut rx) = machine();
        let project = Uuid::new_v4();
        let err = machine
            .request(
                project,
                request(ResourceType::DatabaseAwsRdsPostgres),
                Decision::Deny {
                    reason: "not on this tier".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            machine.get(project, ResourceType::DatabaseAwsRdsPostgres).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_state_change() {
        let (machine, mut rx) = machine();
        let project = Uuid::new_v4();
        let err = machine
            .request(
                project,
                ProvisionResourceRequest {
                    r#type: ResourceType::DatabaseSharedPostgres,
                    config: json!({ "unknown": true }),
                },
                Decision::Allow,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(rx.try_recv().is_err());
        assert!(machine.list(project).await.resources.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_requests() {
        let (machine, mut rx) = machine();
        let project = Uuid::new_v4();
        machine
            .request(project, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap();
        let err = machine
            .request(project, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let job = rx.recv().await.unwrap();
        machine
            .complete_provision(&job, Ok(drivers::MockDriver::default_output(ResourceType::DatabaseSharedPostgres)))
            .await;

        // Ready resources are returned as they are
        let response = machine
            .request(project, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap();
        assert_eq!(response.state, ResourceState::Ready);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_output_populated_iff_ready() {
        let (machine, mut rx) = machine();
        let project = Uuid::new_v4();
        provisioned(&machine, &mut rx, project).await;
        let ready = machine.get(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        assert_eq!(ready.state, ResourceState::Ready);
        assert_eq!(ready.output["hostname"], "db.mock.internal");

        let deleting = machine.delete(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        assert_eq!(deleting.state, ResourceState::Deleting);
        assert!(deleting.output.is_null());

        let job = rx.recv().await.unwrap();
        assert_eq!(job.kind, JobKind::Deprovision);
        assert!(job.output.is_some());
        machine.complete_deprovision(&job, Ok(())).await;
        let deleted = machine.get(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        assert_eq!(deleted.state, ResourceState::Deleted);
        assert!(deleted.output.is_null());
    }

    #[tokio::test]
    async fn test_repeated_delete_of_deleted_resource_is_noop() {
        let (machine, mut rx) = machine();
        let project = Uuid::new_v4();
        provisioned(&machine, &mut rx, project).await;
        machine.delete(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        let job = rx.recv().await.unwrap();
        machine.complete_deprovision(&job, Ok(())).await;

        let before = machine.status(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        for _ in 0..3 {
            let response = machine.delete(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
            assert_eq!(response.state, ResourceState::Deleted);
        }
        let after = machine.status(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        assert_eq!(before.updated_at, after.updated_at);
        assert!(rx.try_recv().is_err());
        assert!(machine.list(project).await.resources.is_empty());
    }

    #[tokio::test]
    async fn test_delete_during_provisioning_is_deferred() {
        let (machine, mut rx) = machine();
        let project = Uuid::new_v4();
        machine
            .request(project, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap();
        let job = rx.recv().await.unwrap();

        let response = machine.delete(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        assert_eq!(response.state, ResourceState::Provisioning);
        assert!(machine.status(project, ResourceType::DatabaseSharedPostgres).await.unwrap().pending_delete);
        assert_eq!(machine.begin_attempt(&job, 1).await, AttemptCheck::DeleteRequested);

        // The in-flight call resolves, then the delete is applied
        machine
            .complete_provision(&job, Ok(drivers::MockDriver::default_output(ResourceType::DatabaseSharedPostgres)))
            .await;
        let status = machine.status(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        assert_eq!(status.resource.state, ResourceState::Deleting);
        assert!(!status.pending_delete);
        let deprovision = rx.recv().await.unwrap();
        assert_eq!(deprovision.kind, JobKind::Deprovision);
    }

    #[tokio::test]
    async fn test_stale_completion_ignored() {
        let (machine, mut rx) = machine();
        let project = Uuid::new_v4();
        machine
            .request(project, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        machine.complete_provision(&first, Err("boom".into())).await;

        // Fresh request replaces the failed record under a new generation
        machine
            .request(project, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.generation > first.generation);

        machine
            .complete_provision(&first, Ok(drivers::MockDriver::default_output(ResourceType::DatabaseSharedPostgres)))
            .await;
        let status = machine.status(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        assert_eq!(status.resource.state, ResourceState::Provisioning);
        assert_eq!(machine.begin_attempt(&first, 0).await, AttemptCheck::Stale);
        assert_eq!(machine.begin_attempt(&second, 0).await, AttemptCheck::Proceed);
    }

    #[tokio::test]
    async fn test_wrong_output_shape_fails_resource() {
        let (machine, mut rx) = machine();
        let project = Uuid::new_v4();
        machine
            .request(project, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap();
        let job = rx.recv().await.unwrap();
        machine
            .complete_provision(&job, Ok(drivers::MockDriver::default_output(ResourceType::Container)))
            .await;
        let status = machine.status(project, ResourceType::DatabaseSharedPostgres).await.unwrap();
        assert_eq!(status.resource.state, ResourceState::Failed);
        assert!(status.resource.output.is_null());
        assert!(status.last_error.unwrap().contains("wrong shape"));
    }

    #[tokio::test]
    async fn test_count_live_rds() {
        let (machine, mut rx) = machine();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for project in [a, b] {
            machine
                .request(project, request(ResourceType::DatabaseAwsRdsPostgres), Decision::Allow)
                .await
                .unwrap();
        }
        machine
            .request(a, request(ResourceType::DatabaseSharedPostgres), Decision::Allow)
            .await
            .unwrap();
        assert_eq!(machine.count_live_rds(&[a]).await, 1);
        assert_eq!(machine.count_live_rds(&[a, b]).await, 2);

        let job = rx.recv().await.unwrap();
        machine.complete_provision(&job, Err("quota at provider".into())).await;
        assert_eq!(machine.count_live_rds(&[a, b]).await, 1);
    }

    #[tokio::test]
    async fn test_delete_all_covers_every_live_resource() {
        let (machine, mut rx) = machine();
        let project = Uuid::new_v4();
        let ready = provisioned(&machine, &mut rx, project).await;
        machine
            .request(project, request(ResourceType::Secrets), Decision::Allow)
            .await
            .unwrap();
        let secrets = rx.recv().await.unwrap();
        machine
            .request(project, request(ResourceType::DatabaseAwsRdsPostgres), Decision::Allow)
            .await
            .unwrap();
        let rds = rx.recv().await.unwrap();
        machine.complete_provision(&rds, Err("no capacity".into())).await;

        assert_eq!(machine.delete_all(project).await, 3);
        let deprovision = rx.recv().await.unwrap();
        assert_eq!(deprovision.kind, JobKind::Deprovision);
        assert_eq!(deprovision.resource_type, ready.resource_type);
        assert_eq!(machine.begin_attempt(&secrets, 1).await, AttemptCheck::DeleteRequested);
        let rds_state = machine.get(project, ResourceType::DatabaseAwsRdsPostgres).await.unwrap().state;
        assert_eq!(rds_state, ResourceState::Deleting);

        // Deferred deletes are recorded again, resources already deleting are left alone
        assert_eq!(machine.delete_all(project).await, 1);
        assert_eq!(machine.delete_all(Uuid::new_v4()).await, 0);
    }
}
