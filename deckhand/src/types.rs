//! Common type definitions and capability types.
//!
//! # ID Types
//!
//! All entity IDs are UUIDs wrapped in type aliases:
//!
//! - [`UserId`]: account identifier
//! - [`ProjectId`]: project identifier
//! - [`DeploymentId`]: deployment identifier
//! - [`TeamId`]: team identifier
//! - [`InviteId`]: pending team invite identifier
//!
//! # Capabilities
//!
//! Access to a project is expressed as a set of [`Capability`] values, resolved per
//! (user, project) pair by [`crate::accounts::AccountRegistry::capabilities`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

pub type UserId = Uuid;
pub type ProjectId = Uuid;
pub type DeploymentId = Uuid;
pub type TeamId = Uuid;
pub type InviteId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Something a caller may do to a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Read,
    Deploy,
    ManageResources,
    ManageMembers,
    ManageBilling,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Read,
        Capability::Deploy,
        Capability::ManageResources,
        Capability::ManageMembers,
        Capability::ManageBilling,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::Read => "read",
            Capability::Deploy => "deploy",
            Capability::ManageResources => "manage resources of",
            Capability::ManageMembers => "manage members of",
            Capability::ManageBilling => "manage billing of",
        };
        f.write_str(s)
    }
}

pub type Capabilities = BTreeSet<Capability>;

/// Every capability.
pub fn all_capabilities() -> Capabilities {
    Capability::ALL.into_iter().collect()
}
