//! Daemon that drives provisioning jobs through their drivers with per-type concurrency control.
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::drivers::{DriverError, DriverRegistry, JobKind, ProvisionJob};
use super::{AttemptCheck, ResourceMachine};
use crate::api::models::resources::ResourceType;
use crate::config::ProvisioningConfig;
use crate::types::abbrev_uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_factor: u32,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl From<&ProvisioningConfig> for RetryPolicy {
    fn from(config: &ProvisioningConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            backoff: config.backoff,
            backoff_factor: config.backoff_factor,
            max_backoff: config.max_backoff,
            attempt_timeout: config.attempt_timeout,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows `attempt`: `backoff * factor^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self.backoff.saturating_mul(self.backoff_factor.saturating_pow(attempt));
        exponential.min(self.max_backoff)
    }
}

fn interrupted(last_error: &str) -> String {
    if last_error.is_empty() {
        "Provisioning interrupted by shutdown".to_string()
    } else {
        format!("Provisioning interrupted by shutdown: {last_error}")
    }
}

pub struct ProvisioningDaemon {
    machine: Arc<ResourceMachine>,
    drivers: DriverRegistry,
    config: ProvisioningConfig,
    retry: RetryPolicy,
    jobs: Mutex<mpsc::UnboundedReceiver<ProvisionJob>>,
    semaphores: HashMap<ResourceType, Arc<Semaphore>>,
    jobs_in_flight: Arc<AtomicUsize>,
}

impl ProvisioningDaemon {
    pub fn new(
        machine: Arc<ResourceMachine>,
        jobs: mpsc::UnboundedReceiver<ProvisionJob>,
        drivers: DriverRegistry,
        config: ProvisioningConfig,
    ) -> Self {
        let semaphores = ResourceType::ALL
            .into_iter()
            .map(|ty| {
                let limit = config.concurrency.get(&ty).copied().unwrap_or(config.default_concurrency);
                (ty, Arc::new(Semaphore::new(limit)))
            })
            .collect();
        Self {
            machine,
            drivers,
            retry: RetryPolicy::from(&config),
            config,
            jobs: Mutex::new(jobs),
            semaphores,
            jobs_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.jobs_in_flight.load(Ordering::Relaxed)
    }

    /// Run the daemon loop until `cancel` fires or the job queue closes.
    ///
    /// Jobs already started finish their current driver call; retries still ahead of them are
    /// abandoned and the resource fails with the last error seen.
    #[tracing::instrument(skip_all)]
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            default_concurrency = self.config.default_concurrency,
            max_retries = self.retry.max_retries,
            "Provisioning daemon starting"
        );

        let mut jobs = self.jobs.lock().await;
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished tasks
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "Provisioning task panicked");
                }
            }

            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let Some(semaphore) = self.semaphores.get(&job.resource_type).cloned() else {
                tracing::error!(resource_type = %job.resource_type, "No semaphore for resource type");
                continue;
            };

            let daemon = self.clone();
            let cancel = cancel.clone();
            self.jobs_in_flight.fetch_add(1, Ordering::Relaxed);
            let jobs_in_flight = self.jobs_in_flight.clone();

            join_set.spawn(async move {
                let _guard = scopeguard::guard((), |_| {
                    jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
                });

                // Waiting here rather than in the loop keeps one busy type from blocking others
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                daemon.process(job, &cancel).await;
            });
        }

        tracing::info!(in_flight = join_set.len(), "Provisioning daemon stopping, draining tasks");
        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Provisioning task panicked");
            }
        }
    }

    #[tracing::instrument(skip_all, fields(
        project_id = %abbrev_uuid(&job.project_id),
        resource_type = %job.resource_type,
        kind = ?job.kind,
        generation = job.generation
    ))]
    async fn process(&self, mut job: ProvisionJob, cancel: &CancellationToken) {
        let Some(driver) = self.drivers.get(job.resource_type) else {
            let error = format!("No provisioning driver registered for {}", job.resource_type);
            tracing::error!("{error}");
            self.resolve(&job, Err(error)).await;
            return;
        };

        let mut last_error = String::new();
        for attempt in 0..=self.retry.max_retries {
            if cancel.is_cancelled() {
                last_error = interrupted(&last_error);
                break;
            }
            match self.machine.begin_attempt(&job, attempt).await {
                AttemptCheck::Proceed => {}
                AttemptCheck::Stale => {
                    tracing::debug!("Job is stale, dropping");
                    return;
                }
                AttemptCheck::DeleteRequested => {
                    if last_error.is_empty() {
                        last_error = "Provisioning abandoned: delete requested".to_string();
                    }
                    break;
                }
            }

            job.attempt = attempt;
            let kind = match job.kind {
                JobKind::Provision => "provision",
                JobKind::Deprovision => "deprovision",
            };
            metrics::counter!(
                "deckhand_provisioning_attempts_total",
                "type" => job.resource_type.as_str(),
                "kind" => kind
            )
            .increment(1);

            let call = async {
                match job.kind {
                    JobKind::Provision => driver.provision(&job).await.map(Some),
                    JobKind::Deprovision => driver.deprovision(&job).await.map(|_| None),
                }
            };
            let result = match tokio::time::timeout(self.retry.attempt_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(DriverError::Transient(format!(
                    "Driver call timed out after {:?}",
                    self.retry.attempt_timeout
                ))),
            };

            match result {
                Ok(output) => {
                    tracing::info!(attempt, "Driver call succeeded");
                    match (job.kind, output) {
                        (JobKind::Provision, Some(output)) => self.machine.complete_provision(&job, Ok(output)).await,
                        (JobKind::Deprovision, _) => self.machine.complete_deprovision(&job, Ok(())).await,
                        (JobKind::Provision, None) => {
                            self.machine
                                .complete_provision(&job, Err("Driver returned no output".to_string()))
                                .await
                        }
                    }
                    return;
                }
                Err(e) => {
                    last_error = e.message().to_string();
                    if !e.is_transient() {
                        tracing::warn!(attempt, error = %e, "Driver call failed permanently");
                        break;
                    }
                    if attempt == self.retry.max_retries {
                        tracing::warn!(attempt, error = %e, "Driver call failed, no retries remaining");
                        break;
                    }
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        attempt,
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        "Driver call failed, retrying with backoff"
                    );
                    self.machine.record_error(&job, &last_error).await;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!(attempt, "Shutting down, abandoning retries");
                            last_error = interrupted(&last_error);
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.resolve(&job, Err(last_error)).await;
    }

    async fn resolve(&self, job: &ProvisionJob, result: Result<(), String>) {
        match (job.kind, result) {
            (JobKind::Provision, Err(e)) => self.machine.complete_provision(job, Err(e)).await,
            (JobKind::Deprovision, result) => self.machine.complete_deprovision(job, result).await,
            (JobKind::Provision, Ok(())) => {}
        }
    }
}
