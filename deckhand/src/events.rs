//! State change notifications.
//!
//! Every committed deployment or resource transition is published on a broadcast channel.
//! Callers waiting on an asynchronous outcome (a resource becoming ready, a superseded
//! deployment finishing teardown) subscribe instead of polling. Slow subscribers lag and
//! lose events; the entity state itself is always authoritative.

use crate::api::models::deployments::DeploymentState;
use crate::api::models::resources::{ResourceState, ResourceType};
use crate::types::{DeploymentId, ProjectId};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateEvent {
    Deployment {
        project_id: ProjectId,
        deployment_id: DeploymentId,
        from: Option<DeploymentState>,
        to: DeploymentState,
        at: DateTime<Utc>,
    },
    Resource {
        project_id: ProjectId,
        resource_type: ResourceType,
        from: Option<ResourceState>,
        to: ResourceState,
        at: DateTime<Utc>,
    },
}

impl StateEvent {
    pub fn project_id(&self) -> ProjectId {
        match self {
            StateEvent::Deployment { project_id, .. } | StateEvent::Resource { project_id, .. } => *project_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StateEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn deployment(&self, project_id: ProjectId, deployment_id: DeploymentId, from: Option<DeploymentState>, to: DeploymentState) {
        metrics::counter!("deckhand_deployment_transitions_total", "to" => to.to_string()).increment(1);
        self.publish(StateEvent::Deployment {
            project_id,
            deployment_id,
            from,
            to,
            at: Utc::now(),
        });
    }

    pub fn resource(&self, project_id: ProjectId, resource_type: ResourceType, from: Option<ResourceState>, to: ResourceState) {
        metrics::counter!(
            "deckhand_resource_transitions_total",
            "type" => resource_type.as_str(),
            "to" => to.to_string()
        )
        .increment(1);
        self.publish(StateEvent::Resource {
            project_id,
            resource_type,
            from,
            to,
            at: Utc::now(),
        });
    }

    fn publish(&self, event: StateEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    /// Stream of events for one project. Lagged events are skipped.
    pub fn project_stream(&self, project_id: ProjectId) -> impl Stream<Item = StateEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |event| async move {
            match event {
                Ok(event) if event.project_id() == project_id => Some(event),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "State event subscriber lagged");
                    None
                }
            }
        })
    }
}
