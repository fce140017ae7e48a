//! Quota & tier policy.
//!
//! [`TierPolicy::evaluate`] is a pure function of (account tier, usage snapshot, requested
//! operation). It has no side effects, so a denied operation leaves every entity unchanged.
//! Employee and Admin tiers bypass numeric limits. Structural invariants, such as a team keeping
//! an Owner, are enforced by the owning component and never consulted here.

use crate::api::models::projects::ComputeTier;
use crate::api::models::resources::ResourceType;
use crate::api::models::users::AccountTier;
use crate::config::TierLimits;
use crate::errors::{Error, Result};
use std::collections::HashMap;
use std::fmt;

/// Usage the caller's request is counted against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    /// Projects owned by the caller
    pub projects: u32,
    /// Live dedicated database instances in the target project's owner scope
    pub rds_instances: u32,
    /// Extra instances bought through RDS subscriptions
    pub rds_subscription: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateProject,
    CreateTeam,
    SubmitDeployment { compute_tier: ComputeTier },
    SetComputeTier(ComputeTier),
    ProvisionResource(ResourceType),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateProject => write!(f, "create project"),
            Operation::CreateTeam => write!(f, "create team"),
            Operation::SubmitDeployment { compute_tier } => write!(f, "deploy on compute tier {compute_tier:?}"),
            Operation::SetComputeTier(tier) => write!(f, "set compute tier {tier:?}"),
            Operation::ProvisionResource(ty) => write!(f, "provision {ty}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny { reason: reason.into() }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny { reason } => Err(Error::QuotaExceeded { reason }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TierPolicy {
    overrides: HashMap<AccountTier, TierLimits>,
}

impl TierPolicy {
    pub fn new(overrides: HashMap<AccountTier, TierLimits>) -> Self {
        Self { overrides }
    }

    pub fn limits(&self, tier: AccountTier) -> TierLimits {
        self.overrides.get(&tier).cloned().unwrap_or_else(|| TierLimits::builtin(tier))
    }

    pub fn evaluate(&self, tier: AccountTier, usage: &UsageSnapshot, operation: &Operation) -> Decision {
        if tier.is_override() {
            return Decision::Allow;
        }
        let decision = evaluate(tier, &self.limits(tier), usage, operation);
        if !decision.is_allowed() {
            tracing::debug!(tier = %tier, operation = %operation, "Policy denied operation");
        }
        decision
    }
}

/// Evaluate `operation` against explicit limits. Override tiers are handled by [`TierPolicy`].
pub fn evaluate(tier: AccountTier, limits: &TierLimits, usage: &UsageSnapshot, operation: &Operation) -> Decision {
    match operation {
        Operation::CreateProject => match limits.max_projects {
            Some(max) if usage.projects >= max => {
                Decision::deny(format!("The {tier} tier allows at most {max} projects"))
            }
            _ => Decision::Allow,
        },
        Operation::CreateTeam if !limits.teams => Decision::deny(format!("Teams are not available on the {tier} tier")),
        Operation::CreateTeam => Decision::Allow,
        Operation::SubmitDeployment { compute_tier } | Operation::SetComputeTier(compute_tier) => {
            if *compute_tier > limits.max_compute_tier {
                Decision::deny(format!(
                    "Compute tier {compute_tier:?} is not available on the {tier} tier (maximum {:?})",
                    limits.max_compute_tier
                ))
            } else {
                Decision::Allow
            }
        }
        Operation::ProvisionResource(ty) if ty.is_rds() => match limits.rds_instances {
            None => Decision::Allow,
            Some(included) => {
                let allowance = included.saturating_add(usage.rds_subscription);
                if allowance == 0 {
                    Decision::deny(format!("{ty} is not available on the {tier} tier"))
                } else if usage.rds_instances >= allowance {
                    Decision::deny(format!("Dedicated database limit of {allowance} reached"))
                } else {
                    Decision::Allow
                }
            }
        },
        Operation::ProvisionResource(_) => Decision::Allow,
    }
}
