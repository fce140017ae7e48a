//! Per-project telemetry sink configuration.
//!
//! Sink credentials are write-only: they are accepted in [`TelemetrySinkConfig`] and only
//! ever reported back as [`TelemetryConfigResponse`] booleans.

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

const REDACTED: &str = "********";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BetterstackConfig {
    pub ingesting_host: String,
    pub source_token: String,
}

impl fmt::Debug for BetterstackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BetterstackConfig")
            .field("ingesting_host", &self.ingesting_host)
            .field("source_token", &REDACTED)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DatadogConfig {
    pub api_key: String,
}

impl fmt::Debug for DatadogConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatadogConfig").field("api_key", &REDACTED).finish()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct GrafanaCloudConfig {
    pub token: String,
    pub endpoint: String,
    pub instance_id: String,
}

impl fmt::Debug for GrafanaCloudConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrafanaCloudConfig")
            .field("token", &REDACTED)
            .field("endpoint", &self.endpoint)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

/// The user-supplied config required to export telemetry to a given external sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum TelemetrySinkConfig {
    Betterstack(BetterstackConfig),
    Datadog(DatadogConfig),
    GrafanaCloud(GrafanaCloudConfig),
}

/// Sink discriminant, without credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TelemetrySink {
    Betterstack,
    Datadog,
    GrafanaCloud,
}

impl TelemetrySinkConfig {
    pub fn sink(&self) -> TelemetrySink {
        match self {
            TelemetrySinkConfig::Betterstack(_) => TelemetrySink::Betterstack,
            TelemetrySinkConfig::Datadog(_) => TelemetrySink::Datadog,
            TelemetrySinkConfig::GrafanaCloud(_) => TelemetrySink::GrafanaCloud,
        }
    }
}

/// Status of a telemetry export configuration for an external sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TelemetrySinkStatus {
    /// The project is configured to export telemetry data to this sink
    pub enabled: bool,
}

/// A safe-for-display representation of a project's telemetry export configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TelemetryConfigResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub betterstack: Option<TelemetrySinkStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datadog: Option<TelemetrySinkStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grafana_cloud: Option<TelemetrySinkStatus>,
}
