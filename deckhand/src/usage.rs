//! Usage derived from deployment history.
//!
//! Nothing here is stored: reports are recomputed from the transition log every deployment
//! keeps. Time spent `Building` or `InProgress` counts as build minutes; time spent `Running`
//! reserves the compute tier's vCPUs. Open intervals run until `now`, and every interval is
//! clipped to the billing cycle.

use crate::api::models::deployments::DeploymentState;
use crate::api::models::usage::{BillingCycle, DailyUsage, ProjectUsageResponse, UserUsageResponse, VcpuUsage};
use crate::deployment::DeploymentHistory;
use crate::types::{ProjectId, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Activity {
    Build,
    Reserved { vcpu: f64 },
}

fn activity(state: DeploymentState, vcpu: f64) -> Option<Activity> {
    match state {
        DeploymentState::Building | DeploymentState::InProgress => Some(Activity::Build),
        DeploymentState::Running => Some(Activity::Reserved { vcpu }),
        _ => None,
    }
}

fn next_midnight(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    at.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

#[derive(Default)]
struct Totals {
    build_minutes: f64,
    reserved_hours: f64,
    daily: BTreeMap<NaiveDate, (f64, f64)>,
}

impl Totals {
    /// Add `[start, end)`, split at UTC midnights.
    fn add(&mut self, activity: Activity, start: DateTime<Utc>, end: DateTime<Utc>) {
        let mut cursor = start;
        while cursor < end {
            let segment_end = next_midnight(cursor).map_or(end, |midnight| midnight.min(end));
            let seconds = (segment_end - cursor).num_milliseconds() as f64 / 1000.0;
            let day = self.daily.entry(cursor.date_naive()).or_default();
            match activity {
                Activity::Build => {
                    self.build_minutes += seconds / 60.0;
                    day.0 += seconds / 60.0;
                }
                Activity::Reserved { vcpu } => {
                    self.reserved_hours += vcpu * seconds / 3600.0;
                    day.1 += vcpu * seconds / 3600.0;
                }
            }
            cursor = segment_end;
        }
    }

    fn record(&mut self, deployment: &DeploymentHistory, cycle: &BillingCycle, now: DateTime<Utc>) {
        let horizon = cycle.end.min(now);
        let vcpu = deployment.compute_tier.vcpu();
        for (i, (state, entered)) in deployment.transitions.iter().enumerate() {
            let Some(activity) = activity(*state, vcpu) else { continue };
            let left = deployment.transitions.get(i + 1).map_or(horizon, |(_, at)| *at);
            let start = (*entered).max(cycle.start);
            let end = left.min(horizon);
            if start < end {
                self.add(activity, start, end);
            }
        }
    }
}

/// Usage of one project over `cycle`. Projects have no allowance, so billable hours equal
/// reserved hours.
pub fn project_usage(
    project_id: ProjectId,
    history: &[DeploymentHistory],
    cycle: BillingCycle,
    now: DateTime<Utc>,
) -> ProjectUsageResponse {
    let mut totals = Totals::default();
    for deployment in history.iter().filter(|d| d.project_id == project_id) {
        totals.record(deployment, &cycle, now);
    }

    ProjectUsageResponse {
        project_id,
        billing_cycle: cycle,
        build_minutes: totals.build_minutes,
        vcpu: VcpuUsage {
            reserved_hours: totals.reserved_hours,
            billable_hours: totals.reserved_hours,
        },
        daily: totals
            .daily
            .into_iter()
            .map(|(date, (build_minutes, reserved_vcpu_hours))| DailyUsage {
                date,
                build_minutes,
                reserved_vcpu_hours,
            })
            .collect(),
    }
}

/// Usage of every project a user is billed for. `included_vcpu_hours` is subtracted from
/// the summed reservation before it becomes billable.
pub fn user_usage(
    user_id: UserId,
    projects: &[(ProjectId, Vec<DeploymentHistory>)],
    cycle: BillingCycle,
    included_vcpu_hours: f64,
    now: DateTime<Utc>,
) -> UserUsageResponse {
    let projects: Vec<ProjectUsageResponse> = projects
        .iter()
        .map(|(project_id, history)| project_usage(*project_id, history, cycle, now))
        .collect();
    let build_minutes = projects.iter().map(|p| p.build_minutes).sum();
    let reserved_hours: f64 = projects.iter().map(|p| p.vcpu.reserved_hours).sum();

    UserUsageResponse {
        user_id,
        billing_cycle: cycle,
        build_minutes,
        vcpu: VcpuUsage {
            reserved_hours,
            billable_hours: (reserved_hours - included_vcpu_hours).max(0.0),
        },
        projects,
    }
}
