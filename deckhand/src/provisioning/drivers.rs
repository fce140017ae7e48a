//! Provisioning drivers: the external systems that create and remove infrastructure.
//!
//! The daemon calls a driver with no lock held. Drivers classify their own errors: a
//! [`DriverError::Transient`] is retried with backoff, a [`DriverError::Permanent`] fails the
//! resource at once.

use super::registry::{ResourceConfig, ResourceOutput};
use crate::api::models::resources::{ContainerOutput, DatabaseInfo, ResourceType};
use crate::types::ProjectId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Provision,
    Deprovision,
}

/// One unit of work for a driver.
#[derive(Debug, Clone)]
pub struct ProvisionJob {
    pub kind: JobKind,
    pub project_id: ProjectId,
    pub resource_type: ResourceType,
    pub config: ResourceConfig,
    /// Output of the resource being removed, for deprovision jobs
    pub output: Option<ResourceOutput>,
    /// Token identifying the in-flight phase this job belongs to
    pub generation: u64,
    /// Zero-based attempt number, set by the daemon before each call
    pub attempt: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("transient driver error: {0}")]
    Transient(String),
    #[error("permanent driver error: {0}")]
    Permanent(String),
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            DriverError::Transient(m) | DriverError::Permanent(m) => m,
        }
    }
}

#[async_trait]
pub trait ProvisioningDriver: Send + Sync {
    async fn provision(&self, job: &ProvisionJob) -> Result<ResourceOutput, DriverError>;

    /// Remove the infrastructure. Removing something that is already gone must succeed.
    async fn deprovision(&self, job: &ProvisionJob) -> Result<(), DriverError>;
}

/// Drivers keyed by the resource type they handle.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<ResourceType, Arc<dyn ProvisioningDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in secrets driver and nothing else.
    pub fn with_builtin() -> Self {
        Self::new().with(ResourceType::Secrets, Arc::new(InMemorySecretsDriver::default()))
    }

    pub fn with(mut self, ty: ResourceType, driver: Arc<dyn ProvisioningDriver>) -> Self {
        self.drivers.insert(ty, driver);
        self
    }

    /// Register one driver for every resource type.
    pub fn with_all(mut self, driver: Arc<dyn ProvisioningDriver>) -> Self {
        for ty in ResourceType::ALL {
            self.drivers.insert(ty, driver.clone());
        }
        self
    }

    pub fn get(&self, ty: ResourceType) -> Option<Arc<dyn ProvisioningDriver>> {
        self.drivers.get(&ty).cloned()
    }
}

/// Stores secret maps in process memory, keyed by project.
#[derive(Debug, Default)]
pub struct InMemorySecretsDriver {
    store: DashMap<ProjectId, HashMap<String, String>>,
}

impl InMemorySecretsDriver {
    pub fn secrets(&self, project_id: ProjectId) -> Option<HashMap<String, String>> {
        self.store.get(&project_id).map(|s| s.clone())
    }
}

#[async_trait]
impl ProvisioningDriver for InMemorySecretsDriver {
    async fn provision(&self, job: &ProvisionJob) -> Result<ResourceOutput, DriverError> {
        let ResourceConfig::Secrets(config) = &job.config else {
            return Err(DriverError::Permanent(format!("secrets driver cannot provision {}", job.resource_type)));
        };
        self.store.insert(job.project_id, config.secrets.clone());
        Ok(ResourceOutput::None)
    }

    async fn deprovision(&self, job: &ProvisionJob) -> Result<(), DriverError> {
        self.store.remove(&job.project_id);
        Ok(())
    }
}

/// Scripted outcome for one [`MockDriver`] call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed,
    SucceedWith(ResourceOutput),
    Transient(String),
    Permanent(String),
    /// Never returns; exercises the attempt timeout
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub kind: JobKind,
    pub project_id: ProjectId,
    pub resource_type: ResourceType,
    pub generation: u64,
    pub attempt: u32,
}

/// Driver for tests. Outcomes are consumed from a queue; an empty queue succeeds with a
/// plausible output for the resource type. A gated driver blocks every call until
/// [`MockDriver::release`] hands out a permit.
#[derive(Debug, Default)]
pub struct MockDriver {
    outcomes: parking_lot::Mutex<VecDeque<MockOutcome>>,
    calls: parking_lot::Mutex<Vec<MockCall>>,
    gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        self.outcomes.lock().extend(outcomes);
    }

    /// Let `n` gated calls proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, kind: JobKind) -> usize {
        self.calls.lock().iter().filter(|c| c.kind == kind).count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn default_output(ty: ResourceType) -> ResourceOutput {
        match ty {
            ResourceType::Secrets => ResourceOutput::None,
            ResourceType::Container => ResourceOutput::Container(ContainerOutput {
                host_port: "49152".to_string(),
            }),
            _ => {
                let engine = match ty {
                    ResourceType::DatabaseAwsRdsMySql => "mysql",
                    ResourceType::DatabaseAwsRdsMariaDB => "mariadb",
                    _ => "postgres",
                };
                ResourceOutput::Database(DatabaseInfo {
                    engine: engine.to_string(),
                    role_name: "user-mock".to_string(),
                    role_password: "mock-password".to_string(),
                    database_name: "db-mock".to_string(),
                    port: "5432".to_string(),
                    hostname: "db.mock.internal".to_string(),
                    instance_name: ty.is_rds().then(|| "mock-instance".to_string()),
                })
            }
        }
    }

    async fn call(&self, job: &ProvisionJob) -> Result<ResourceOutput, DriverError> {
        self.calls.lock().push(MockCall {
            kind: job.kind,
            project_id: job.project_id,
            resource_type: job.resource_type,
            generation: job.generation,
            attempt: job.attempt,
        });

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = scopeguard::guard(&self.in_flight, |in_flight| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(DriverError::Permanent("mock gate closed".to_string())),
            }
        }

        let outcome = self.outcomes.lock().pop_front().unwrap_or(MockOutcome::Succeed);
        match outcome {
            MockOutcome::Succeed => Ok(Self::default_output(job.resource_type)),
            MockOutcome::SucceedWith(output) => Ok(output),
            MockOutcome::Transient(e) => Err(DriverError::Transient(e)),
            MockOutcome::Permanent(e) => Err(DriverError::Permanent(e)),
            MockOutcome::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(DriverError::Transient("mock hang elapsed".to_string()))
            }
        }
    }
}

#[async_trait]
impl ProvisioningDriver for MockDriver {
    async fn provision(&self, job: &ProvisionJob) -> Result<ResourceOutput, DriverError> {
        self.call(job).await
    }

    async fn deprovision(&self, job: &ProvisionJob) -> Result<(), DriverError> {
        self.call(job).await.map(|_| ())
    }
}
