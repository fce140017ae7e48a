//! Resource type registry: which config and output schema belongs to each [`ResourceType`].
//!
//! Configs arrive as opaque JSON and are parsed into [`ResourceConfig`] exactly once, at the
//! boundary, and rejected if their shape does not belong to the resource type. Drivers hand
//! back a typed [`ResourceOutput`], checked against the type before it is stored. Output
//! schemas deny unknown fields so no data from one resource kind can leak through another.

use crate::api::models::resources::{ContainerConfig, ContainerOutput, DatabaseConfig, DatabaseInfo, ResourceType, SecretStoreConfig};
use crate::errors::{Error, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceConfig {
    Database(DatabaseConfig),
    Secrets(SecretStoreConfig),
    Container(ContainerConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOutput {
    Database(DatabaseInfo),
    Container(ContainerOutput),
    /// Types that produce no output, such as secrets
    None,
}

fn parse<T: serde::de::DeserializeOwned>(ty: ResourceType, what: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::validation(format!("Invalid {what} for {ty}: {e}")))
}

impl ResourceConfig {
    pub fn parse(ty: ResourceType, value: &Value) -> Result<Self> {
        // An absent config means "defaults" for the types that have them
        let value = match value {
            Value::Null if ty != ResourceType::Container => Value::Object(Default::default()),
            v => v.clone(),
        };

        match ty {
            ResourceType::DatabaseSharedPostgres
            | ResourceType::DatabaseAwsRdsPostgres
            | ResourceType::DatabaseAwsRdsMySql
            | ResourceType::DatabaseAwsRdsMariaDB => Ok(ResourceConfig::Database(parse(ty, "config", value)?)),
            ResourceType::Secrets => Ok(ResourceConfig::Secrets(parse(ty, "config", value)?)),
            ResourceType::Container => {
                let config: ContainerConfig = parse(ty, "config", value)?;
                if config.image.trim().is_empty() {
                    return Err(Error::validation("Container image must not be empty"));
                }
                Ok(ResourceConfig::Container(config))
            }
        }
    }

    pub fn to_value(&self) -> Value {
        let value = match self {
            ResourceConfig::Database(c) => serde_json::to_value(c),
            ResourceConfig::Secrets(c) => serde_json::to_value(c),
            ResourceConfig::Container(c) => serde_json::to_value(c),
        };
        value.unwrap_or(Value::Null)
    }
}

impl ResourceOutput {
    /// Whether this output belongs to the schema registered for `ty`.
    pub fn matches(&self, ty: ResourceType) -> bool {
        match self {
            ResourceOutput::Database(_) => matches!(
                ty,
                ResourceType::DatabaseSharedPostgres
                    | ResourceType::DatabaseAwsRdsPostgres
                    | ResourceType::DatabaseAwsRdsMySql
                    | ResourceType::DatabaseAwsRdsMariaDB
            ),
            ResourceOutput::Container(_) => ty == ResourceType::Container,
            ResourceOutput::None => ty == ResourceType::Secrets,
        }
    }

    pub fn to_value(&self) -> Value {
        let value = match self {
            ResourceOutput::Database(o) => serde_json::to_value(o),
            ResourceOutput::Container(o) => serde_json::to_value(o),
            ResourceOutput::None => Ok(Value::Null),
        };
        value.unwrap_or(Value::Null)
    }
}
