//! Typestate encoding of the deployment lifecycle.
//!
//! ```text
//! Pending --claim--> Building (archive) / InProgress (image) --ready--> Running
//!    |                    |                                               |
//!    |                    +--build failed--> Failed                       |
//!    +--stop--> Stopping <-------------- stop / supersede ----------------+
//!                  |
//!                  +--> Stopped
//! ```
//!
//! Any non-terminal state may also move to `Failed` on an infrastructure fault.

use crate::api::models::deployments::{DeploymentRequest, DeploymentResponse, DeploymentState};
use crate::api::models::projects::ComputeTier;
use crate::types::{DeploymentId, ProjectId};
use chrono::{DateTime, Utc};

/// Marker trait for deployment states.
pub trait Phase: private::Sealed + Send + Sync {
    fn observed(&self) -> DeploymentState;
}

mod private {
    pub trait Sealed {}
}

#[derive(Debug, Clone)]
pub struct Pending;

#[derive(Debug, Clone)]
pub struct Building {
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InProgress {
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Running {
    pub uris: Vec<String>,
    pub running_at: DateTime<Utc>,
}

/// What a stopping deployment is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    /// The build was in flight when the stop arrived; applied once it resolves
    Build,
    /// Teardown was requested from the executor
    Teardown,
}

#[derive(Debug, Clone)]
pub struct Stopping {
    pub awaiting: Awaiting,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Stopped {
    pub stopped_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Failed {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl private::Sealed for Pending {}
impl private::Sealed for Building {}
impl private::Sealed for InProgress {}
impl private::Sealed for Running {}
impl private::Sealed for Stopping {}
impl private::Sealed for Stopped {}
impl private::Sealed for Failed {}

impl Phase for Pending {
    fn observed(&self) -> DeploymentState {
        DeploymentState::Pending
    }
}

impl Phase for Building {
    fn observed(&self) -> DeploymentState {
        DeploymentState::Building
    }
}

impl Phase for InProgress {
    fn observed(&self) -> DeploymentState {
        DeploymentState::InProgress
    }
}

impl Phase for Running {
    fn observed(&self) -> DeploymentState {
        DeploymentState::Running
    }
}

impl Phase for Stopping {
    fn observed(&self) -> DeploymentState {
        DeploymentState::Stopping
    }
}

impl Phase for Stopped {
    fn observed(&self) -> DeploymentState {
        DeploymentState::Stopped
    }
}

impl Phase for Failed {
    fn observed(&self) -> DeploymentState {
        DeploymentState::Failed
    }
}

/// A successful build reported while a predecessor was still stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyReport {
    pub build_id: Option<String>,
    pub uris: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DeploymentData {
    pub id: DeploymentId,
    pub project_id: ProjectId,
    pub request: DeploymentRequest,
    pub compute_tier: ComputeTier,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub build_id: Option<String>,
    pub deferred_ready: Option<ReadyReport>,
    /// Every state entered, in order
    pub transitions: Vec<(DeploymentState, DateTime<Utc>)>,
}

#[derive(Debug, Clone)]
pub struct Deployment<S: Phase> {
    pub state: S,
    pub data: DeploymentData,
}

impl<S: Phase> Deployment<S> {
    fn transition_with<T: Phase>(mut self, state: T, f: impl FnOnce(&mut DeploymentData)) -> Deployment<T> {
        let now = Utc::now();
        f(&mut self.data);
        self.data.updated_at = now;
        self.data.transitions.push((state.observed(), now));
        Deployment { state, data: self.data }
    }

    fn stopping(self, awaiting: Awaiting) -> Deployment<Stopping> {
        self.transition_with(
            Stopping {
                awaiting,
                requested_at: Utc::now(),
            },
            |_| {},
        )
    }

    /// Infrastructure fault. Only non-terminal states expose this.
    fn fault(self, reason: String) -> Deployment<Failed> {
        self.transition_with(
            Failed {
                reason,
                failed_at: Utc::now(),
            },
            |data| data.deferred_ready = None,
        )
    }
}

impl Deployment<Pending> {
    pub fn new(project_id: ProjectId, request: DeploymentRequest, compute_tier: ComputeTier) -> Self {
        let now = Utc::now();
        Deployment {
            state: Pending,
            data: DeploymentData {
                id: uuid::Uuid::new_v4(),
                project_id,
                request,
                compute_tier,
                created_at: now,
                updated_at: now,
                build_id: None,
                deferred_ready: None,
                transitions: vec![(DeploymentState::Pending, now)],
            },
        }
    }

    pub fn build(self) -> Deployment<Building> {
        self.transition_with(Building { claimed_at: Utc::now() }, |_| {})
    }

    pub fn start(self) -> Deployment<InProgress> {
        self.transition_with(InProgress { claimed_at: Utc::now() }, |_| {})
    }

    /// Nothing is in flight for a pending deployment, so its stop completes at once.
    pub fn stop(self) -> (Deployment<Stopping>, Deployment<Stopped>) {
        let stopping = self.stopping(Awaiting::Teardown);
        let stopped = stopping.clone().confirm();
        (stopping, stopped)
    }

    pub fn fail(self, reason: String) -> Deployment<Failed> {
        self.fault(reason)
    }
}

macro_rules! in_flight_transitions {
    ($state:ty) => {
        impl Deployment<$state> {
            pub fn ready(self, report: ReadyReport) -> Deployment<Running> {
                self.transition_with(
                    Running {
                        uris: report.uris,
                        running_at: Utc::now(),
                    },
                    |data| {
                        data.build_id = report.build_id;
                        data.deferred_ready = None;
                    },
                )
            }

            pub fn defer_ready(&mut self, report: ReadyReport) {
                self.data.deferred_ready = Some(report);
                self.data.updated_at = Utc::now();
            }

            pub fn build_failed(self, reason: String) -> Deployment<Failed> {
                self.fault(reason)
            }

            /// A deployment whose ready report was deferred is already up and needs teardown.
            pub fn stop(self) -> Deployment<Stopping> {
                let awaiting = if self.data.deferred_ready.is_some() {
                    Awaiting::Teardown
                } else {
                    Awaiting::Build
                };
                self.stopping(awaiting)
            }

            pub fn fail(self, reason: String) -> Deployment<Failed> {
                self.fault(reason)
            }
        }
    };
}

in_flight_transitions!(Building);
in_flight_transitions!(InProgress);

impl Deployment<Running> {
    pub fn stop(self) -> Deployment<Stopping> {
        self.stopping(Awaiting::Teardown)
    }

    pub fn fail(self, reason: String) -> Deployment<Failed> {
        self.fault(reason)
    }
}

impl Deployment<Stopping> {
    /// The in-flight build finished successfully after the stop; what it started must be torn down.
    pub fn build_finished(mut self, build_id: Option<String>) -> Deployment<Stopping> {
        self.state.awaiting = Awaiting::Teardown;
        self.data.build_id = build_id;
        self.data.updated_at = Utc::now();
        self
    }

    pub fn confirm(self) -> Deployment<Stopped> {
        self.transition_with(Stopped { stopped_at: Utc::now() }, |data| data.deferred_ready = None)
    }

    pub fn fail(self, reason: String) -> Deployment<Failed> {
        self.fault(reason)
    }
}

#[derive(Debug, Clone)]
pub enum AnyDeployment {
    Pending(Deployment<Pending>),
    Building(Deployment<Building>),
    InProgress(Deployment<InProgress>),
    Running(Deployment<Running>),
    Stopping(Deployment<Stopping>),
    Stopped(Deployment<Stopped>),
    Failed(Deployment<Failed>),
}

impl AnyDeployment {
    pub fn data(&self) -> &DeploymentData {
        match self {
            AnyDeployment::Pending(d) => &d.data,
            AnyDeployment::Building(d) => &d.data,
            AnyDeployment::InProgress(d) => &d.data,
            AnyDeployment::Running(d) => &d.data,
            AnyDeployment::Stopping(d) => &d.data,
            AnyDeployment::Stopped(d) => &d.data,
            AnyDeployment::Failed(d) => &d.data,
        }
    }

    pub fn state(&self) -> DeploymentState {
        match self {
            AnyDeployment::Pending(d) => d.state.observed(),
            AnyDeployment::Building(d) => d.state.observed(),
            AnyDeployment::InProgress(d) => d.state.observed(),
            AnyDeployment::Running(d) => d.state.observed(),
            AnyDeployment::Stopping(d) => d.state.observed(),
            AnyDeployment::Stopped(d) => d.state.observed(),
            AnyDeployment::Failed(d) => d.state.observed(),
        }
    }

    /// URIs are only reported while running.
    pub fn uris(&self) -> &[String] {
        match self {
            AnyDeployment::Running(d) => &d.state.uris,
            _ => &[],
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            AnyDeployment::Failed(d) => Some(&d.state.reason),
            _ => None,
        }
    }

    pub fn to_response(&self) -> DeploymentResponse {
        let data = self.data();
        DeploymentResponse {
            id: data.id,
            state: self.state(),
            created_at: data.created_at,
            updated_at: data.updated_at,
            uris: self.uris().to_vec(),
            build_id: data.build_id.clone(),
            build_meta: data.request.build_meta().cloned(),
            reason: self.failure_reason().map(str::to_string),
        }
    }
}

macro_rules! into_any {
    ($($state:ident),*) => {
        $(
            impl From<Deployment<$state>> for AnyDeployment {
                fn from(d: Deployment<$state>) -> Self {
                    AnyDeployment::$state(d)
                }
            }
        )*
    };
}

into_any!(Pending, Building, InProgress, Running, Stopping, Stopped, Failed);
