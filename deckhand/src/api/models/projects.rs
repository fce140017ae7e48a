//! API request/response models for projects.

use super::deployments::DeploymentState;
use crate::types::{ProjectId, TeamId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Size of the container a project's deployments run on. Ordered from smallest to largest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ComputeTier {
    #[default]
    XS,
    S,
    M,
    L,
    XL,
    XXL,
}

impl ComputeTier {
    /// Reserved vCPUs for a container of this size.
    pub fn vcpu(&self) -> f64 {
        match self {
            ComputeTier::XS => 0.25,
            ComputeTier::S => 0.5,
            ComputeTier::M => 1.0,
            ComputeTier::L => 2.0,
            ComputeTier::XL => 4.0,
            ComputeTier::XXL => 8.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProjectCreateRequest {
    #[schema(example = "my-project")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProjectResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: ProjectId,
    /// Display name
    pub name: String,
    /// Project owner
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    /// Team project belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub team_id: Option<TeamId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_tier: Option<ComputeTier>,
    /// State of the current deployment if one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_state: Option<DeploymentState>,
    /// URIs where running deployments can be reached
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProjectListResponse {
    pub projects: Vec<ProjectResponse>,
}

/// Set wanted field(s) to update those parts of the project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProjectUpdateRequest {
    /// Change display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Transfer to other user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,
    /// Transfer to a team
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub team_id: Option<TeamId>,
    /// Transfer away from current team
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_from_team: Option<bool>,
    /// Change compute tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_tier: Option<ComputeTier>,
}
