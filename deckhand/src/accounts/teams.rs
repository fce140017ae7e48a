use super::{Account, AccountRegistry};
use crate::api::models::teams::{
    AddTeamMemberRequest, AddTeamMemberResponse, TeamCreateRequest, TeamInviteResponse, TeamListResponse, TeamMembersResponse,
    TeamMembership, TeamResponse, TeamRole,
};
use crate::api::models::users::AccountTier;
use crate::errors::{Error, Result};
use crate::types::{Capabilities, Capability, InviteId, TeamId, UserId, abbrev_uuid, all_capabilities};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TeamInvite {
    pub id: InviteId,
    pub team_id: TeamId,
    pub email: String,
    pub role: TeamRole,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set once, when the invite is converted into a membership
    pub accepted_by: Option<UserId>,
}

impl TeamInvite {
    /// Expired and consumed invites are inert.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.accepted_by.is_none() && now < self.expires_at
    }

    fn to_response(&self) -> TeamInviteResponse {
        TeamInviteResponse {
            id: self.id,
            team_id: self.team_id,
            email: self.email.clone(),
            role: self.role,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    /// In join order. A user appears at most once.
    pub members: Vec<TeamMembership>,
    pub invites: HashMap<InviteId, TeamInvite>,
}

impl Team {
    pub fn role_of(&self, user: UserId) -> Option<TeamRole> {
        self.members.iter().find(|m| m.user_id == user).map(|m| m.role)
    }

    fn owner_count(&self) -> usize {
        self.members.iter().filter(|m| m.role == TeamRole::Owner).count()
    }

    fn response_for(&self, user: UserId) -> Option<TeamResponse> {
        let role = self.role_of(user)?;
        Some(TeamResponse {
            id: self.id,
            name: self.name.clone(),
            membership: TeamMembership { user_id: user, role },
        })
    }
}

pub(crate) fn role_capabilities(role: TeamRole) -> Capabilities {
    match role {
        TeamRole::Owner => all_capabilities(),
        TeamRole::Admin => [
            Capability::Read,
            Capability::Deploy,
            Capability::ManageResources,
            Capability::ManageMembers,
        ]
        .into_iter()
        .collect(),
        TeamRole::Member => [Capability::Read, Capability::Deploy, Capability::ManageResources]
            .into_iter()
            .collect(),
    }
}

/// How much authority a caller has over a team's membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberAuthority {
    None,
    /// May manage Admins and Members
    NonOwners,
    /// May manage everyone, including other Owners
    All,
}

impl AccountRegistry {
    pub(crate) fn team(&self, team_id: TeamId) -> Result<Arc<Mutex<Team>>> {
        self.teams
            .get(&team_id)
            .map(|t| t.clone())
            .ok_or_else(|| Error::not_found("Team", team_id))
    }

    pub fn team_role(&self, team_id: TeamId, user: UserId) -> Option<TeamRole> {
        let team = self.teams.get(&team_id).map(|t| t.clone())?;
        let role = team.lock().role_of(user);
        role
    }

    pub fn team_exists(&self, team_id: TeamId) -> bool {
        self.teams.contains_key(&team_id)
    }

    fn member_authority(&self, caller: UserId, team: &Team) -> Result<MemberAuthority> {
        // Full API access override acts as a team Owner, but never bypasses the last-Owner rule
        if self.tier(caller)? == AccountTier::Admin {
            return Ok(MemberAuthority::All);
        }
        Ok(match team.role_of(caller) {
            Some(TeamRole::Owner) => MemberAuthority::All,
            Some(TeamRole::Admin) => MemberAuthority::NonOwners,
            _ => MemberAuthority::None,
        })
    }

    fn require_authority(&self, caller: UserId, team: &Team, touches_owner: bool) -> Result<()> {
        let allowed = match self.member_authority(caller, team)? {
            MemberAuthority::All => true,
            MemberAuthority::NonOwners => !touches_owner,
            MemberAuthority::None => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::InsufficientPermissions {
                required: Capability::ManageMembers,
                resource: format!("team {}", team.name),
            })
        }
    }

    /// Create a team with `creator` as its first Owner.
    #[instrument(skip_all, fields(creator = %abbrev_uuid(&creator)), err)]
    pub fn create_team(&self, creator: UserId, request: TeamCreateRequest) -> Result<TeamResponse> {
        if !self.exists(creator) {
            return Err(Error::not_found("Account", creator));
        }
        let name = request.name.trim();
        if name.is_empty() {
            return Err(Error::validation("Team name must not be empty"));
        }

        let team = Team {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_by: creator,
            created_at: Utc::now(),
            members: vec![TeamMembership {
                user_id: creator,
                role: TeamRole::Owner,
            }],
            invites: HashMap::new(),
        };
        let response = team
            .response_for(creator)
            .ok_or_else(|| Error::invariant("create team: creator missing from membership"))?;
        self.teams.insert(team.id, Arc::new(Mutex::new(team)));

        tracing::info!(team_id = %abbrev_uuid(&response.id), "Team created");
        Ok(response)
    }

    pub fn teams_for(&self, user: UserId) -> TeamListResponse {
        let mut teams: Vec<(DateTime<Utc>, TeamResponse)> = self
            .teams
            .iter()
            .filter_map(|t| {
                let team = t.lock();
                team.response_for(user).map(|r| (team.created_at, r))
            })
            .collect();
        teams.sort_by_key(|(created_at, _)| *created_at);
        TeamListResponse {
            teams: teams.into_iter().map(|(_, r)| r).collect(),
        }
    }

    /// Members of a team, visible to its members and to override tiers.
    pub fn members(&self, caller: UserId, team_id: TeamId) -> Result<TeamMembersResponse> {
        let team = self.team(team_id)?;
        let team = team.lock();
        if team.role_of(caller).is_none() && !self.tier(caller)?.is_override() {
            return Err(Error::InsufficientPermissions {
                required: Capability::Read,
                resource: format!("team {}", team.name),
            });
        }
        Ok(TeamMembersResponse {
            members: team.members.clone(),
        })
    }

    /// Add an existing account directly, or invite an email address.
    #[instrument(skip_all, fields(caller = %abbrev_uuid(&caller), team_id = %abbrev_uuid(&team_id)), err)]
    pub fn add_member(&self, caller: UserId, team_id: TeamId, request: AddTeamMemberRequest) -> Result<AddTeamMemberResponse> {
        let role = request.role.unwrap_or(TeamRole::Member);
        match (request.user_id, request.email) {
            (Some(user), None) => self.add_existing_member(caller, team_id, user, role).map(AddTeamMemberResponse::Added),
            (None, Some(email)) => self.invite(caller, team_id, &email, role).map(AddTeamMemberResponse::Invited),
            _ => Err(Error::validation("Provide exactly one of user_id or email")),
        }
    }

    fn add_existing_member(&self, caller: UserId, team_id: TeamId, user: UserId, role: TeamRole) -> Result<TeamMembership> {
        if !self.exists(user) {
            return Err(Error::not_found("Account", user));
        }
        let team = self.team(team_id)?;
        let mut team = team.lock();
        self.require_authority(caller, &team, role == TeamRole::Owner)?;

        if team.role_of(user).is_some() {
            return Err(Error::conflict(format!("User {user} is already a member of team {}", team.name)));
        }
        let membership = TeamMembership { user_id: user, role };
        team.members.push(membership.clone());
        tracing::info!(user_id = %abbrev_uuid(&user), role = %role, "Team member added");
        Ok(membership)
    }

    /// Create a pending invite that expires after the configured TTL.
    pub fn invite(&self, caller: UserId, team_id: TeamId, email: &str, role: TeamRole) -> Result<TeamInviteResponse> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::validation(format!("Invalid email address: {email}")));
        }

        let team = self.team(team_id)?;
        let mut team = team.lock();
        self.require_authority(caller, &team, role == TeamRole::Owner)?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.invite_ttl)
            .map_err(|e| Error::Other(anyhow::anyhow!("invite ttl out of range: {e}")))?;
        let invite = TeamInvite {
            id: Uuid::new_v4(),
            team_id,
            email,
            role,
            created_at: now,
            expires_at: now + ttl,
            accepted_by: None,
        };
        let response = invite.to_response();
        self.invite_index.insert(invite.id, team_id);
        team.invites.insert(invite.id, invite);

        tracing::info!(invite_id = %abbrev_uuid(&response.id), role = %role, "Team invite created");
        Ok(response)
    }

    /// Convert an invite into a membership, exactly once.
    ///
    /// Accepting again as the same user returns the membership unchanged. Expired invites and
    /// invites consumed by someone else are treated as absent.
    pub fn accept_invite(&self, user: UserId, invite_id: InviteId) -> Result<TeamMembership> {
        self.accept_invite_at(user, invite_id, Utc::now())
    }

    #[instrument(skip_all, fields(user_id = %abbrev_uuid(&user), invite_id = %abbrev_uuid(&invite_id)), err)]
    pub(crate) fn accept_invite_at(&self, user: UserId, invite_id: InviteId, now: DateTime<Utc>) -> Result<TeamMembership> {
        if !self.exists(user) {
            return Err(Error::not_found("Account", user));
        }
        let team_id = self
            .invite_index
            .get(&invite_id)
            .map(|t| *t)
            .ok_or_else(|| Error::not_found("Invite", invite_id))?;
        let team = self.team(team_id)?;
        let mut team = team.lock();

        let (accepted_by, live, role) = {
            let invite = team.invites.get(&invite_id).ok_or_else(|| Error::not_found("Invite", invite_id))?;
            (invite.accepted_by, invite.is_live(now), invite.role)
        };

        match accepted_by {
            Some(by) if by == user => {
                let role = team
                    .role_of(user)
                    .ok_or_else(|| Error::invariant("accept invite: consumed invite without membership"))?;
                return Ok(TeamMembership { user_id: user, role });
            }
            Some(_) => return Err(Error::not_found("Invite", invite_id)),
            None if !live => return Err(Error::not_found("Invite", invite_id)),
            None => {}
        }

        let membership = match team.role_of(user) {
            Some(existing) => TeamMembership {
                user_id: user,
                role: existing,
            },
            None => {
                let membership = TeamMembership { user_id: user, role };
                team.members.push(membership.clone());
                membership
            }
        };
        if let Some(invite) = team.invites.get_mut(&invite_id) {
            invite.accepted_by = Some(user);
        }

        tracing::info!(role = %membership.role, "Team invite accepted");
        Ok(membership)
    }

    #[instrument(skip(self, caller, team_id, target), fields(caller = %abbrev_uuid(&caller), team_id = %abbrev_uuid(&team_id), target = %abbrev_uuid(&target)), err)]
    pub fn update_member_role(&self, caller: UserId, team_id: TeamId, target: UserId, role: TeamRole) -> Result<TeamMembership> {
        let team = self.team(team_id)?;
        let mut team = team.lock();
        let current = team.role_of(target).ok_or_else(|| Error::not_found("Team member", target))?;
        self.require_authority(caller, &team, current == TeamRole::Owner || role == TeamRole::Owner)?;

        if current == TeamRole::Owner && role != TeamRole::Owner && team.owner_count() == 1 {
            return Err(Error::validation("A team must keep at least one owner"));
        }

        for member in team.members.iter_mut().filter(|m| m.user_id == target) {
            member.role = role;
        }
        tracing::info!(from = %current, to = %role, "Team member role changed");
        Ok(TeamMembership { user_id: target, role })
    }

    /// Remove a member. Anyone may remove themselves; the last Owner can never leave.
    #[instrument(skip(self, caller, team_id, target), fields(caller = %abbrev_uuid(&caller), team_id = %abbrev_uuid(&team_id), target = %abbrev_uuid(&target)), err)]
    pub fn remove_member(&self, caller: UserId, team_id: TeamId, target: UserId) -> Result<()> {
        let team = self.team(team_id)?;
        let mut team = team.lock();
        let current = team.role_of(target).ok_or_else(|| Error::not_found("Team member", target))?;
        if caller != target {
            self.require_authority(caller, &team, current == TeamRole::Owner)?;
        }

        if current == TeamRole::Owner && team.owner_count() == 1 {
            return Err(Error::validation("Cannot remove the last owner of a team"));
        }

        team.members.retain(|m| m.user_id != target);
        tracing::info!("Team member removed");
        Ok(())
    }

    /// Remove an account and all of its team memberships. Refused while the account is the
    /// last Owner of any team. Every affected team is locked, in id order, for the check and
    /// the removal.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user)), err)]
    pub fn remove_account(&self, user: UserId) -> Result<Account> {
        if !self.exists(user) {
            return Err(Error::not_found("Account", user));
        }

        let mut teams: Vec<(TeamId, Arc<Mutex<Team>>)> =
            self.teams.iter().map(|t| (*t.key(), t.value().clone())).collect();
        teams.sort_by_key(|(id, _)| *id);
        let mut guards: Vec<_> = teams
            .iter()
            .map(|(_, t)| t.lock())
            .filter(|team| team.role_of(user).is_some())
            .collect();

        if let Some(team) = guards
            .iter()
            .find(|team| team.role_of(user) == Some(TeamRole::Owner) && team.owner_count() == 1)
        {
            return Err(Error::conflict(format!(
                "Account is the last owner of team {}; transfer ownership first",
                team.name
            )));
        }
        for team in guards.iter_mut() {
            team.members.retain(|m| m.user_id != user);
        }
        drop(guards);

        let (_, account) = self.accounts.remove(&user).ok_or_else(|| Error::not_found("Account", user))?;
        self.keys.remove(&account.key);
        tracing::info!("Account removed");
        Ok(account)
    }
}
