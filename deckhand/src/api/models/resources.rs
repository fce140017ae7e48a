//! API request/response models for provisioned resources.
//!
//! `config` and `output` travel as opaque JSON on the wire. Their shape is selected by
//! [`ResourceType`]; the typed payloads below are what the provisioning registry parses
//! them into.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub enum ResourceType {
    #[serde(rename = "database::shared::postgres")]
    DatabaseSharedPostgres,
    #[serde(rename = "database::aws_rds::postgres")]
    DatabaseAwsRdsPostgres,
    #[serde(rename = "database::aws_rds::mysql")]
    DatabaseAwsRdsMySql,
    #[serde(rename = "database::aws_rds::mariadb")]
    DatabaseAwsRdsMariaDB,
    #[serde(rename = "secrets")]
    Secrets,
    /// Local provisioner only
    #[serde(rename = "container")]
    Container,
}

impl ResourceType {
    pub const ALL: [ResourceType; 6] = [
        ResourceType::DatabaseSharedPostgres,
        ResourceType::DatabaseAwsRdsPostgres,
        ResourceType::DatabaseAwsRdsMySql,
        ResourceType::DatabaseAwsRdsMariaDB,
        ResourceType::Secrets,
        ResourceType::Container,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::DatabaseSharedPostgres => "database::shared::postgres",
            ResourceType::DatabaseAwsRdsPostgres => "database::aws_rds::postgres",
            ResourceType::DatabaseAwsRdsMySql => "database::aws_rds::mysql",
            ResourceType::DatabaseAwsRdsMariaDB => "database::aws_rds::mariadb",
            ResourceType::Secrets => "secrets",
            ResourceType::Container => "container",
        }
    }

    /// Dedicated database instances, gated by tier and counted against the RDS allowance.
    pub fn is_rds(&self) -> bool {
        matches!(
            self,
            ResourceType::DatabaseAwsRdsPostgres | ResourceType::DatabaseAwsRdsMySql | ResourceType::DatabaseAwsRdsMariaDB
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stage of the provisioning process a resource is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Authorizing,
    Provisioning,
    Failed,
    Ready,
    Deleting,
    Deleted,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Authorizing => "authorizing",
            ResourceState::Provisioning => "provisioning",
            ResourceState::Failed => "failed",
            ResourceState::Ready => "ready",
            ResourceState::Deleting => "deleting",
            ResourceState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProvisionResourceRequest {
    /// The type of this resource
    #[serde(rename = "type")]
    pub r#type: ResourceType,
    /// The config used when creating this resource. Its shape is selected by `type`.
    #[schema(value_type = Object)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResourceResponse {
    #[serde(rename = "type")]
    pub r#type: ResourceType,
    pub state: ResourceState,
    /// The config used when creating this resource
    #[schema(value_type = Object)]
    pub config: serde_json::Value,
    /// The output for this resource, only present when the state is Ready
    #[schema(value_type = Object)]
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResourceListResponse {
    pub resources: Vec<ResourceResponse>,
}

/// Config for every database resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Override the database name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
    /// Connection string to use instead of provisioning (local runs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_uri: Option<String>,
}

/// Holds the data for building a database connection string.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct DatabaseInfo {
    pub engine: String,
    pub role_name: String,
    pub role_password: String,
    pub database_name: String,
    pub port: String,
    pub hostname: String,
    /// The instance name, required for deleting dedicated instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

impl fmt::Debug for DatabaseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseInfo")
            .field("engine", &self.engine)
            .field("role_name", &self.role_name)
            .field("role_password", &"********")
            .field("database_name", &self.database_name)
            .field("port", &self.port)
            .field("hostname", &self.hostname)
            .field("instance_name", &self.instance_name)
            .finish()
    }
}

/// Config for the secrets resource: the secret values themselves.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretStoreConfig {
    pub secrets: HashMap<String, String>,
}

impl fmt::Debug for SecretStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStoreConfig").field("count", &self.secrets.len()).finish_non_exhaustive()
    }
}

/// Config for a local container resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    pub project_name: String,
    pub container_name: String,
    pub image: String,
    /// Container port to expose, e.g. "6379/tcp"
    pub port: String,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ContainerOutput {
    pub host_port: String,
}
