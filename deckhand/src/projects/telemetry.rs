use crate::api::models::telemetry::{TelemetryConfigResponse, TelemetrySink, TelemetrySinkConfig, TelemetrySinkStatus};
use crate::errors::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Telemetry export targets configured for one project, at most one per sink.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TelemetrySinks {
    sinks: BTreeMap<TelemetrySink, TelemetrySinkConfig>,
}

// Credentials never reach logs: only the configured sink names are printed.
impl fmt::Debug for TelemetrySinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.sinks.keys()).finish()
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("Telemetry sink field {field} must not be empty")));
    }
    Ok(())
}

fn validate(config: &TelemetrySinkConfig) -> Result<()> {
    match config {
        TelemetrySinkConfig::Betterstack(c) => {
            require("ingesting_host", &c.ingesting_host)?;
            require("source_token", &c.source_token)
        }
        TelemetrySinkConfig::Datadog(c) => require("api_key", &c.api_key),
        TelemetrySinkConfig::GrafanaCloud(c) => {
            require("token", &c.token)?;
            require("instance_id", &c.instance_id)?;
            if !(c.endpoint.starts_with("https://") || c.endpoint.starts_with("http://")) {
                return Err(Error::validation("Grafana Cloud endpoint must be an http(s) URL"));
            }
            Ok(())
        }
    }
}

impl TelemetrySinks {
    /// Configure a sink, replacing any earlier config for the same sink.
    pub fn set(&mut self, config: TelemetrySinkConfig) -> Result<()> {
        validate(&config)?;
        self.sinks.insert(config.sink(), config);
        Ok(())
    }

    /// Returns whether the sink was configured.
    pub fn remove(&mut self, sink: TelemetrySink) -> bool {
        self.sinks.remove(&sink).is_some()
    }

    /// Credentials for an exporter. Never part of a response.
    pub fn config(&self, sink: TelemetrySink) -> Option<&TelemetrySinkConfig> {
        self.sinks.get(&sink)
    }

    pub fn status(&self) -> TelemetryConfigResponse {
        let enabled = |sink: TelemetrySink| self.sinks.contains_key(&sink).then_some(TelemetrySinkStatus { enabled: true });
        TelemetryConfigResponse {
            betterstack: enabled(TelemetrySink::Betterstack),
            datadog: enabled(TelemetrySink::Datadog),
            grafana_cloud: enabled(TelemetrySink::GrafanaCloud),
        }
    }
}
