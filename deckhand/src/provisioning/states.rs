//! Resource lifecycle using the typestate pattern.
//!
//! ```text
//! Authorizing -> Provisioning -> Ready -> Deleting -> Deleted
//!                     |                      |
//!                     +------> Failed <------+
//!                                |
//!                                +-> Deleting
//! ```
//!
//! Transitions consume the resource and return it in its next state, so an invalid transition
//! does not compile. [`AnyResource`] is the storage form.

use super::registry::{ResourceConfig, ResourceOutput};
use crate::api::models::resources::{ResourceResponse, ResourceState, ResourceType};
use crate::errors::Result;
use crate::policy::Decision;
use crate::types::ProjectId;
use chrono::{DateTime, Utc};

pub trait LifecycleState: Send + Sync {}

#[derive(Debug, Clone)]
pub struct Resource<S: LifecycleState> {
    pub state: S,
    pub data: ResourceData,
}

#[derive(Debug, Clone)]
pub struct ResourceData {
    pub project_id: ProjectId,
    pub r#type: ResourceType,
    pub config: ResourceConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped whenever a driver call is dispatched; completions carrying an older value are stale
    pub generation: u64,
    /// Driver attempts in the current in-flight phase
    pub attempts: u32,
    pub last_error: Option<String>,
    /// A delete arrived while a driver call was in flight
    pub pending_delete: bool,
}

#[derive(Debug, Clone)]
pub struct Authorizing {}
impl LifecycleState for Authorizing {}

#[derive(Debug, Clone)]
pub struct Provisioning {
    pub started_at: DateTime<Utc>,
}
impl LifecycleState for Provisioning {}

#[derive(Debug, Clone)]
pub struct Ready {
    pub output: ResourceOutput,
    pub ready_at: DateTime<Utc>,
}
impl LifecycleState for Ready {}

#[derive(Debug, Clone)]
pub struct Failed {
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
impl LifecycleState for Failed {}

#[derive(Debug, Clone)]
pub struct Deleting {
    pub started_at: DateTime<Utc>,
}
impl LifecycleState for Deleting {}

#[derive(Debug, Clone)]
pub struct Deleted {
    pub deleted_at: DateTime<Utc>,
}
impl LifecycleState for Deleted {}

impl<S: LifecycleState> Resource<S> {
    fn transition<T: LifecycleState>(mut self, state: T, f: impl FnOnce(&mut ResourceData)) -> Resource<T> {
        f(&mut self.data);
        self.data.updated_at = Utc::now();
        Resource { state, data: self.data }
    }
}

impl Resource<Authorizing> {
    pub fn new(project_id: ProjectId, r#type: ResourceType, config: ResourceConfig) -> Self {
        let now = Utc::now();
        Resource {
            state: Authorizing {},
            data: ResourceData {
                project_id,
                r#type,
                config,
                created_at: now,
                updated_at: now,
                generation: 0,
                attempts: 0,
                last_error: None,
                pending_delete: false,
            },
        }
    }

    /// Apply the quota decision. A denial consumes the resource without it ever provisioning.
    pub fn authorize(self, decision: Decision) -> Result<Resource<Provisioning>> {
        decision.into_result()?;
        Ok(self.transition(Provisioning { started_at: Utc::now() }, |data| {
            data.generation += 1;
        }))
    }
}

impl Resource<Provisioning> {
    pub fn complete(self, output: ResourceOutput) -> Resource<Ready> {
        self.transition(
            Ready {
                output,
                ready_at: Utc::now(),
            },
            |data| data.last_error = None,
        )
    }

    pub fn fail(self, error: String) -> Resource<Failed> {
        self.transition(
            Failed {
                error: error.clone(),
                failed_at: Utc::now(),
            },
            |data| data.last_error = Some(error),
        )
    }
}

fn begin_delete(data: &mut ResourceData) {
    data.generation += 1;
    data.attempts = 0;
    data.pending_delete = false;
}

impl Resource<Ready> {
    pub fn delete(self) -> Resource<Deleting> {
        self.transition(Deleting { started_at: Utc::now() }, begin_delete)
    }
}

impl Resource<Failed> {
    pub fn delete(self) -> Resource<Deleting> {
        self.transition(Deleting { started_at: Utc::now() }, begin_delete)
    }
}

impl Resource<Deleting> {
    pub fn complete(self) -> Resource<Deleted> {
        self.transition(Deleted { deleted_at: Utc::now() }, |data| data.last_error = None)
    }

    pub fn fail(self, error: String) -> Resource<Failed> {
        self.transition(
            Failed {
                error: error.clone(),
                failed_at: Utc::now(),
            },
            |data| data.last_error = Some(error),
        )
    }
}

#[derive(Debug, Clone)]
pub enum AnyResource {
    Provisioning(Resource<Provisioning>),
    Ready(Resource<Ready>),
    Failed(Resource<Failed>),
    Deleting(Resource<Deleting>),
    Deleted(Resource<Deleted>),
}

impl AnyResource {
    pub fn data(&self) -> &ResourceData {
        match self {
            AnyResource::Provisioning(r) => &r.data,
            AnyResource::Ready(r) => &r.data,
            AnyResource::Failed(r) => &r.data,
            AnyResource::Deleting(r) => &r.data,
            AnyResource::Deleted(r) => &r.data,
        }
    }

    pub fn data_mut(&mut self) -> &mut ResourceData {
        match self {
            AnyResource::Provisioning(r) => &mut r.data,
            AnyResource::Ready(r) => &mut r.data,
            AnyResource::Failed(r) => &mut r.data,
            AnyResource::Deleting(r) => &mut r.data,
            AnyResource::Deleted(r) => &mut r.data,
        }
    }

    pub fn state(&self) -> ResourceState {
        match self {
            AnyResource::Provisioning(_) => ResourceState::Provisioning,
            AnyResource::Ready(_) => ResourceState::Ready,
            AnyResource::Failed(_) => ResourceState::Failed,
            AnyResource::Deleting(_) => ResourceState::Deleting,
            AnyResource::Deleted(_) => ResourceState::Deleted,
        }
    }

    /// A driver call is outstanding for this resource.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, AnyResource::Provisioning(_) | AnyResource::Deleting(_))
    }

    /// Output is only ever exposed in the Ready state.
    pub fn output(&self) -> Option<&ResourceOutput> {
        match self {
            AnyResource::Ready(r) => Some(&r.state.output),
            _ => None,
        }
    }

    pub fn to_response(&self) -> ResourceResponse {
        let data = self.data();
        ResourceResponse {
            r#type: data.r#type,
            state: self.state(),
            config: data.config.to_value(),
            output: self.output().map(ResourceOutput::to_value).unwrap_or(serde_json::Value::Null),
        }
    }
}

impl From<Resource<Provisioning>> for AnyResource {
    fn from(r: Resource<Provisioning>) -> Self {
        AnyResource::Provisioning(r)
    }
}

impl From<Resource<Ready>> for AnyResource {
    fn from(r: Resource<Ready>) -> Self {
        AnyResource::Ready(r)
    }
}

impl From<Resource<Failed>> for AnyResource {
    fn from(r: Resource<Failed>) -> Self {
        AnyResource::Failed(r)
    }
}

impl From<Resource<Deleting>> for AnyResource {
    fn from(r: Resource<Deleting>) -> Self {
        AnyResource::Deleting(r)
    }
}

impl From<Resource<Deleted>> for AnyResource {
    fn from(r: Resource<Deleted>) -> Self {
        AnyResource::Deleted(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::resources::{ContainerOutput, DatabaseConfig};
    use crate::errors::Error;
    use uuid::Uuid;

    fn authorizing(ty: ResourceType) -> Resource<Authorizing> {
        Resource::new(Uuid::new_v4(), ty, ResourceConfig::Database(DatabaseConfig::default()))
    }

    #[test]
    fn test_denied_authorization_never_provisions() {
        let result = authorizing(ResourceType::DatabaseAwsRdsPostgres).authorize(Decision::Deny {
            reason: "not on this tier".to_string(),
        });
        assert!(matches!(result, Err(Error::QuotaExceeded { .. })));
    }

    #[test]
    fn test_output_only_when_ready() {
        let provisioning = authorizing(ResourceType::Container).authorize(Decision::Allow).unwrap();
        assert_eq!(provisioning.data.generation, 1);
        let any: AnyResource = provisioning.clone().into();
        assert!(any.output().is_none());
        assert!(any.to_response().output.is_null());

        let ready = provisioning.complete(ResourceOutput::Container(ContainerOutput {
            host_port: "49153".to_string(),
        }));
        let any: AnyResource = ready.clone().into();
        assert_eq!(any.to_response().output["host_port"], "49153");

        let deleting = ready.delete();
        assert_eq!(deleting.data.generation, 2);
        let any: AnyResource = deleting.clone().into();
        assert!(any.to_response().output.is_null());

        let any: AnyResource = deleting.complete().into();
        assert_eq!(any.state(), ResourceState::Deleted);
        assert!(any.to_response().output.is_null());
    }

    #[test]
    fn test_failure_records_last_error() {
        let provisioning = authorizing(ResourceType::DatabaseSharedPostgres).authorize(Decision::Allow).unwrap();
        let failed = provisioning.fail("connection refused".to_string());
        assert_eq!(failed.data.last_error.as_deref(), Some("connection refused"));
        let deleting = failed.delete();
        assert_eq!(deleting.data.attempts, 0);
    }
}
