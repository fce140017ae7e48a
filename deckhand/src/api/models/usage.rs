//! Usage reports derived from deployment history.

use crate::types::{ProjectId, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Half-open `[start, end)` billing window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BillingCycle {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VcpuUsage {
    /// vCPU hours reserved by running deployments
    pub reserved_hours: f64,
    /// Reserved hours beyond the included allowance
    pub billable_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub build_minutes: f64,
    pub reserved_vcpu_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProjectUsageResponse {
    #[schema(value_type = String, format = "uuid")]
    pub project_id: ProjectId,
    pub billing_cycle: BillingCycle,
    pub build_minutes: f64,
    pub vcpu: VcpuUsage,
    /// One sample per day with any activity, ordered by date
    pub daily: Vec<DailyUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UserUsageResponse {
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    pub billing_cycle: BillingCycle,
    pub build_minutes: f64,
    pub vcpu: VcpuUsage,
    pub projects: Vec<ProjectUsageResponse>,
}
