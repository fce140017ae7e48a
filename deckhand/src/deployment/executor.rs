//! The build executor boundary.
//!
//! The executor turns a deployment job into a running container. It acknowledges work
//! through the control plane (`claim`, `report_ready`, `report_build_failed`,
//! `confirm_stopped`) rather than through return values, so both calls here only hand work
//! over and return.

use crate::api::models::deployments::DeploymentRequest;
use crate::api::models::projects::ComputeTier;
use crate::types::{DeploymentId, ProjectId};
use async_trait::async_trait;

/// Work handed to the executor for one deployment. Carries the injected secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentJob {
    pub deployment_id: DeploymentId,
    pub project_id: ProjectId,
    pub request: DeploymentRequest,
    pub compute_tier: ComputeTier,
}

#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn dispatch(&self, job: DeploymentJob) -> anyhow::Result<()>;

    async fn teardown(&self, project_id: ProjectId, deployment_id: DeploymentId) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
    Dispatch(DeploymentJob),
    Teardown(DeploymentId),
}

/// Executor for tests: records every call and can be told to refuse dispatches or teardowns.
#[derive(Debug, Default)]
pub struct MockExecutor {
    calls: parking_lot::Mutex<Vec<ExecutorCall>>,
    refuse_dispatch: std::sync::atomic::AtomicBool,
    refuse_teardown: std::sync::atomic::AtomicBool,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse_dispatch(&self, refuse: bool) {
        self.refuse_dispatch.store(refuse, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn refuse_teardown(&self, refuse: bool) {
        self.refuse_teardown.store(refuse, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().clone()
    }

    pub fn dispatched(&self) -> Vec<DeploymentJob> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ExecutorCall::Dispatch(job) => Some(job.clone()),
                ExecutorCall::Teardown(_) => None,
            })
            .collect()
    }

    pub fn torn_down(&self) -> Vec<DeploymentId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ExecutorCall::Teardown(id) => Some(*id),
                ExecutorCall::Dispatch(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl BuildExecutor for MockExecutor {
    async fn dispatch(&self, job: DeploymentJob) -> anyhow::Result<()> {
        if self.refuse_dispatch.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("executor unavailable");
        }
        self.calls.lock().push(ExecutorCall::Dispatch(job));
        Ok(())
    }

    async fn teardown(&self, _project_id: ProjectId, deployment_id: DeploymentId) -> anyhow::Result<()> {
        if self.refuse_teardown.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("executor unavailable");
        }
        self.calls.lock().push(ExecutorCall::Teardown(deployment_id));
        Ok(())
    }
}
