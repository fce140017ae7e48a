//! API request/response models for teams, memberships and invites.

use crate::types::{InviteId, TeamId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Role of a user within a team. Privilege is ordered Owner > Admin > Member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    Owner,
    Admin,
    Member,
}

impl TeamRole {
    pub fn rank(&self) -> u8 {
        match self {
            TeamRole::Owner => 2,
            TeamRole::Admin => 1,
            TeamRole::Member => 0,
        }
    }
}

impl fmt::Display for TeamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TeamRole::Owner => "owner",
            TeamRole::Admin => "admin",
            TeamRole::Member => "member",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TeamCreateRequest {
    #[schema(example = "Platform Team")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TeamMembership {
    #[schema(value_type = String, format = "uuid")]
    pub user_id: UserId,
    /// Role of the user in the team
    pub role: TeamRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TeamResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: TeamId,
    /// Display name
    pub name: String,
    /// Membership info of the calling user
    pub membership: TeamMembership,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TeamListResponse {
    pub teams: Vec<TeamResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TeamMembersResponse {
    pub members: Vec<TeamMembership>,
}

/// Provide a user id to add a user directly, or an email address to invite them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AddTeamMemberRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Role of the user in the team
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<TeamRole>,
}

/// A pending, time-bounded invitation to join a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TeamInviteResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: InviteId,
    #[schema(value_type = String, format = "uuid")]
    pub team_id: TeamId,
    pub email: String,
    pub role: TeamRole,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of [`AddTeamMemberRequest`]: either the member was added, or an invite was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum AddTeamMemberResponse {
    Added(TeamMembership),
    Invited(TeamInviteResponse),
}
