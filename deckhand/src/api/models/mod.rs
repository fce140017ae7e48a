//! API request and response data models.
//!
//! These models define the public contract of the control plane. Field names, enum
//! spellings and tagged-union layouts are fixed by existing clients and must stay
//! wire compatible; new enum values may only be added.
//!
//! # Model Categories
//!
//! - [`deployments`]: deployment requests, build arguments and deployment state
//! - [`resources`]: provisioning requests, resource types and typed config/output payloads
//! - [`projects`]: project create/update requests and aggregated project views
//! - [`teams`]: teams, memberships and invites
//! - [`users`]: accounts, tiers and subscriptions
//! - [`telemetry`]: per-project telemetry sink configuration (credentials are write-only)
//! - [`usage`]: derived usage reports
//! - [`errors`]: the error body every failure maps to
//!
//! List responses always wrap the plural entity in a single named field.

pub mod deployments;
pub mod errors;
pub mod projects;
pub mod resources;
pub mod teams;
pub mod telemetry;
pub mod usage;
pub mod users;
