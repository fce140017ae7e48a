//! Project registry.
//!
//! Projects bind a name to exactly one [`Owner`]. Names are unique per owner: the
//! `(owner, name)` index is claimed through the map's entry API before a project is inserted
//! or renamed, so two concurrent creates of the same name cannot both succeed.
//!
//! Lock order inside the registry is project entry, then name index.

pub mod telemetry;

use crate::accounts::Owner;
use crate::api::models::deployments::{DeploymentResponse, DeploymentState};
use crate::api::models::projects::{ComputeTier, ProjectResponse, ProjectUpdateRequest};
use crate::api::models::telemetry::{TelemetryConfigResponse, TelemetrySink, TelemetrySinkConfig};
use crate::errors::{Error, Result};
use crate::types::{ProjectId, TeamId, UserId, abbrev_uuid};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use telemetry::TelemetrySinks;
use tracing::instrument;
use uuid::Uuid;

/// Longest accepted project name; names double as DNS labels.
pub const MAX_NAME_LEN: usize = 63;

/// Check that `input` is a lowercase `a-z0-9-` name with no leading, trailing or doubled dash.
pub fn validate_name(input: &str) -> Result<String> {
    let name = input.trim();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::validation(format!(
            "Project name must be between 1 and {MAX_NAME_LEN} characters"
        )));
    }
    let charset_ok = name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !charset_ok || name.starts_with('-') || name.ends_with('-') || name.contains("--") {
        return Err(Error::validation(format!(
            "Invalid project name '{name}': use lowercase letters, digits and single dashes"
        )));
    }
    Ok(name.to_string())
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub owner: Owner,
    /// User who created the project; reported as the user of team-owned projects
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub compute_tier: Option<ComputeTier>,
    pub telemetry: TelemetrySinks,
}

impl Project {
    pub fn user_id(&self) -> UserId {
        match self.owner {
            Owner::User(user) => user,
            Owner::Team(_) => self.created_by,
        }
    }

    pub fn team_id(&self) -> Option<TeamId> {
        match self.owner {
            Owner::Team(team) => Some(team),
            Owner::User(_) => None,
        }
    }

    /// Compute tier deployments of this project run on.
    pub fn effective_compute_tier(&self) -> ComputeTier {
        self.compute_tier.unwrap_or_default()
    }

    /// Response shape, aggregating the project's most recent deployment.
    pub fn to_response(&self, current: Option<&DeploymentResponse>) -> ProjectResponse {
        let uris = current
            .filter(|d| d.state == DeploymentState::Running)
            .map(|d| d.uris.clone())
            .unwrap_or_default();
        ProjectResponse {
            id: self.id,
            name: self.name.clone(),
            user_id: self.user_id(),
            team_id: self.team_id(),
            created_at: self.created_at,
            compute_tier: self.compute_tier,
            deployment_state: current.map(|d| d.state),
            uris,
        }
    }
}

/// A validated project update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub owner: Option<Owner>,
    pub compute_tier: Option<ComputeTier>,
}

impl ProjectUpdate {
    /// Ownership and compute tier changes need billing rights over the project.
    pub fn changes_billing(&self) -> bool {
        self.owner.is_some() || self.compute_tier.is_some()
    }
}

/// Validate `request` against the project's current state. `remove_from_team` hands the
/// project to `caller`.
pub fn plan_update(project: &Project, caller: UserId, request: ProjectUpdateRequest) -> Result<ProjectUpdate> {
    let remove_from_team = request.remove_from_team.unwrap_or(false);
    let transfers = [request.user_id.is_some(), request.team_id.is_some(), remove_from_team]
        .into_iter()
        .filter(|t| *t)
        .count();
    if transfers > 1 {
        return Err(Error::validation(
            "Only one of user_id, team_id and remove_from_team may be set",
        ));
    }
    if request.name.is_none() && request.compute_tier.is_none() && transfers == 0 {
        return Err(Error::validation("Update request does not change anything"));
    }

    let owner = match (request.user_id, request.team_id) {
        (Some(user), _) => Some(Owner::User(user)),
        (_, Some(team)) => Some(Owner::Team(team)),
        (None, None) if remove_from_team => match project.owner {
            Owner::Team(_) => Some(Owner::User(caller)),
            Owner::User(_) => return Err(Error::validation("Project is not owned by a team")),
        },
        (None, None) => None,
    };

    Ok(ProjectUpdate {
        name: request.name.as_deref().map(validate_name).transpose()?,
        owner: owner.filter(|o| *o != project.owner),
        compute_tier: request.compute_tier,
    })
}

#[derive(Default)]
pub struct ProjectRegistry {
    projects: DashMap<ProjectId, Project>,
    names: DashMap<(Owner, String), ProjectId>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim_name(&self, owner: Owner, name: &str, id: ProjectId) -> Result<()> {
        match self.names.entry((owner, name.to_string())) {
            Entry::Occupied(existing) if *existing.get() != id => {
                Err(Error::conflict(format!("A project named '{name}' already exists for this owner")))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
        }
    }

    #[instrument(skip_all, fields(created_by = %abbrev_uuid(&created_by), owner = ?owner), err)]
    pub fn create(&self, owner: Owner, created_by: UserId, name: &str) -> Result<Project> {
        let name = validate_name(name)?;
        let project = Project {
            id: Uuid::new_v4(),
            name,
            owner,
            created_by,
            created_at: Utc::now(),
            compute_tier: None,
            telemetry: TelemetrySinks::default(),
        };
        self.claim_name(owner, &project.name, project.id)?;
        self.projects.insert(project.id, project.clone());

        tracing::info!(project_id = %abbrev_uuid(&project.id), name = %project.name, "Project created");
        Ok(project)
    }

    pub fn get(&self, id: ProjectId) -> Result<Project> {
        self.projects
            .get(&id)
            .map(|p| p.clone())
            .ok_or_else(|| Error::not_found("Project", id))
    }

    /// Projects directly owned by `owner`, oldest first.
    pub fn projects_of(&self, owner: Owner) -> Vec<ProjectId> {
        let mut projects: Vec<(DateTime<Utc>, ProjectId)> = self
            .projects
            .iter()
            .filter(|p| p.owner == owner)
            .map(|p| (p.created_at, p.id))
            .collect();
        projects.sort();
        projects.into_iter().map(|(_, id)| id).collect()
    }

    /// Projects billed to `user`: the ones they own plus team projects they created. Oldest first.
    pub fn billed_to(&self, user: UserId) -> Vec<ProjectId> {
        let mut projects: Vec<(DateTime<Utc>, ProjectId)> = self
            .projects
            .iter()
            .filter(|p| match p.owner {
                Owner::User(owner) => owner == user,
                Owner::Team(_) => p.created_by == user,
            })
            .map(|p| (p.created_at, p.id))
            .collect();
        projects.sort();
        projects.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of projects counted against `user`'s tier.
    pub fn count_for(&self, user: UserId) -> u32 {
        u32::try_from(self.billed_to(user).len()).unwrap_or(u32::MAX)
    }

    /// Projects visible to `user` through direct ownership or membership of `teams`, oldest first.
    pub fn list_for(&self, user: UserId, teams: &[TeamId]) -> Vec<Project> {
        let mut projects: Vec<Project> = self
            .projects
            .iter()
            .filter(|p| match p.owner {
                Owner::User(owner) => owner == user,
                Owner::Team(team) => teams.contains(&team),
            })
            .map(|p| p.clone())
            .collect();
        projects.sort_by_key(|p| (p.created_at, p.id));
        projects
    }

    /// Every project, oldest first. Override tiers list through this.
    pub fn list_all(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self.projects.iter().map(|p| p.clone()).collect();
        projects.sort_by_key(|p| (p.created_at, p.id));
        projects
    }

    #[instrument(skip_all, fields(project_id = %abbrev_uuid(&id)), err)]
    pub fn apply(&self, id: ProjectId, update: ProjectUpdate) -> Result<Project> {
        let mut project = self.projects.get_mut(&id).ok_or_else(|| Error::not_found("Project", id))?;

        let owner = update.owner.unwrap_or(project.owner);
        let name = update.name.clone().unwrap_or_else(|| project.name.clone());
        if owner != project.owner || name != project.name {
            self.claim_name(owner, &name, id)?;
            self.names.remove(&(project.owner, project.name.clone()));
        }

        if owner != project.owner {
            tracing::info!(from = ?project.owner, to = ?owner, "Project ownership transferred");
        }
        if name != project.name {
            tracing::info!(from = %project.name, to = %name, "Project renamed");
        }
        if let Some(tier) = update.compute_tier {
            tracing::info!(compute_tier = ?tier, "Project compute tier changed");
            project.compute_tier = Some(tier);
        }
        project.owner = owner;
        project.name = name;
        Ok(project.clone())
    }

    #[instrument(skip_all, fields(project_id = %abbrev_uuid(&id)), err)]
    pub fn delete(&self, id: ProjectId) -> Result<Project> {
        let (_, project) = self.projects.remove(&id).ok_or_else(|| Error::not_found("Project", id))?;
        self.names.remove(&(project.owner, project.name.clone()));
        tracing::info!(name = %project.name, "Project deleted");
        Ok(project)
    }

    #[instrument(skip_all, fields(project_id = %abbrev_uuid(&id), sink = ?config.sink()), err)]
    pub fn set_telemetry(&self, id: ProjectId, config: TelemetrySinkConfig) -> Result<TelemetryConfigResponse> {
        let mut project = self.projects.get_mut(&id).ok_or_else(|| Error::not_found("Project", id))?;
        project.telemetry.set(config)?;
        Ok(project.telemetry.status())
    }

    /// Removing a sink that is not configured succeeds.
    #[instrument(skip(self), fields(project_id = %abbrev_uuid(&id)), err)]
    pub fn remove_telemetry(&self, id: ProjectId, sink: TelemetrySink) -> Result<TelemetryConfigResponse> {
        let mut project = self.projects.get_mut(&id).ok_or_else(|| Error::not_found("Project", id))?;
        if project.telemetry.remove(sink) {
            tracing::info!("Telemetry sink removed");
        }
        Ok(project.telemetry.status())
    }

    pub fn telemetry(&self, id: ProjectId) -> Result<TelemetryConfigResponse> {
        Ok(self.get(id)?.telemetry.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::telemetry::DatadogConfig;

    fn user() -> UserId {
        Uuid::new_v4()
    }

    #[test]
    fn test_name_validation() {
        assert_eq!(validate_name(" my-app-2 ").unwrap(), "my-app-2");
        let too_long = "a".repeat(64);
        for bad in ["", "My-App", "my_app", "-app", "app-", "a--b", "app.io", too_long.as_str()] {
            assert!(matches!(validate_name(bad), Err(Error::Validation { .. })), "{bad:?} accepted");
        }
        assert!(validate_name(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_names_unique_per_owner() {
        let registry = ProjectRegistry::new();
        let alice = user();
        let bob = user();

        registry.create(Owner::User(alice), alice, "web").unwrap();
        let err = registry.create(Owner::User(alice), alice, "web").unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        // Same name under another owner is fine
        registry.create(Owner::User(bob), bob, "web").unwrap();
        assert_eq!(registry.list_all().len(), 2);
    }

    #[test]
    fn test_team_project_reports_creator() {
        let registry = ProjectRegistry::new();
        let creator = user();
        let team = Uuid::new_v4();
        let project = registry.create(Owner::Team(team), creator, "shared").unwrap();

        let response = project.to_response(None);
        assert_eq!(response.user_id, creator);
        assert_eq!(response.team_id, Some(team));
        assert!(response.deployment_state.is_none());
        assert!(response.uris.is_empty());

        assert_eq!(registry.list_for(user(), &[team]).len(), 1);
        assert!(registry.list_for(user(), &[]).is_empty());
        assert_eq!(registry.count_for(creator), 1);
    }

    #[test]
    fn test_uris_only_from_running_deployment() {
        let owner = user();
        let project = ProjectRegistry::new().create(Owner::User(owner), owner, "api").unwrap();
        let mut deployment = DeploymentResponse {
            id: Uuid::new_v4(),
            state: DeploymentState::Stopping,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            uris: vec!["https://api.example.app".to_string()],
            build_id: None,
            build_meta: None,
            reason: None,
        };
        let response = project.to_response(Some(&deployment));
        assert_eq!(response.deployment_state, Some(DeploymentState::Stopping));
        assert!(response.uris.is_empty());

        deployment.state = DeploymentState::Running;
        assert_eq!(project.to_response(Some(&deployment)).uris.len(), 1);
    }

    #[test]
    fn test_plan_update_rejects_contradictions() {
        let owner = user();
        let project = ProjectRegistry::new().create(Owner::User(owner), owner, "app").unwrap();

        let empty = plan_update(&project, owner, ProjectUpdateRequest::default());
        assert!(matches!(empty, Err(Error::Validation { .. })));

        let both = ProjectUpdateRequest {
            user_id: Some(user()),
            team_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        assert!(matches!(plan_update(&project, owner, both), Err(Error::Validation { .. })));

        let team_and_leave = ProjectUpdateRequest {
            team_id: Some(Uuid::new_v4()),
            remove_from_team: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            plan_update(&project, owner, team_and_leave),
            Err(Error::Validation { .. })
        ));

        let leave_without_team = ProjectUpdateRequest {
            remove_from_team: Some(true),
            ..Default::default()
        };
        assert!(matches!(
            plan_update(&project, owner, leave_without_team),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_remove_from_team_hands_project_to_caller() {
        let registry = ProjectRegistry::new();
        let creator = user();
        let caller = user();
        let team = Uuid::new_v4();
        let project = registry.create(Owner::Team(team), creator, "tooling").unwrap();

        let update = plan_update(
            &project,
            caller,
            ProjectUpdateRequest {
                remove_from_team: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(update.owner, Some(Owner::User(caller)));
        assert!(update.changes_billing());

        let moved = registry.apply(project.id, update).unwrap();
        assert_eq!(moved.owner, Owner::User(caller));
        assert!(registry.projects_of(Owner::Team(team)).is_empty());
        assert_eq!(registry.projects_of(Owner::User(caller)), vec![project.id]);
    }

    #[test]
    fn test_rename_frees_old_name() {
        let registry = ProjectRegistry::new();
        let owner = user();
        let first = registry.create(Owner::User(owner), owner, "alpha").unwrap();
        registry.create(Owner::User(owner), owner, "beta").unwrap();

        let taken = ProjectUpdate {
            name: Some("beta".to_string()),
            ..Default::default()
        };
        assert!(matches!(registry.apply(first.id, taken), Err(Error::Conflict { .. })));
        assert_eq!(registry.get(first.id).unwrap().name, "alpha");

        let rename = ProjectUpdate {
            name: Some("gamma".to_string()),
            compute_tier: Some(ComputeTier::S),
            ..Default::default()
        };
        let renamed = registry.apply(first.id, rename).unwrap();
        assert_eq!(renamed.name, "gamma");
        assert_eq!(renamed.effective_compute_tier(), ComputeTier::S);
        registry.create(Owner::User(owner), owner, "alpha").unwrap();
    }

    #[test]
    fn test_delete_and_telemetry() {
        let registry = ProjectRegistry::new();
        let owner = user();
        let project = registry.create(Owner::User(owner), owner, "svc").unwrap();

        let status = registry
            .set_telemetry(
                project.id,
                TelemetrySinkConfig::Datadog(DatadogConfig {
                    api_key: "key".to_string(),
                }),
            )
            .unwrap();
        assert!(status.datadog.is_some());
        let status = registry.remove_telemetry(project.id, TelemetrySink::Datadog).unwrap();
        assert_eq!(status, TelemetryConfigResponse::default());
        assert!(registry.remove_telemetry(project.id, TelemetrySink::Datadog).is_ok());

        registry.delete(project.id).unwrap();
        assert!(matches!(registry.get(project.id), Err(Error::NotFound { .. })));
        assert!(matches!(registry.delete(project.id), Err(Error::NotFound { .. })));
        registry.create(Owner::User(owner), owner, "svc").unwrap();
    }
}
