//! Control plane configuration.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `deckhand.yaml` but can be specified via the `-f` flag or the `DECKHAND_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration
//! 2. **Environment variables** - Variables prefixed with `DECKHAND_` override YAML values
//!
//! For nested values, use double underscores: `DECKHAND_PROVISIONING__MAX_RETRIES=5` sets
//! `provisioning.max_retries`.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use deckhand::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Structure
//!
//! - **Telemetry**: `telemetry.enable_otel_export`, `telemetry.log_format`
//! - **Provisioning**: `provisioning.max_retries`, `provisioning.backoff`, ... - driver retry budget and concurrency
//! - **Deployments**: `deployments.event_buffer` - capacity of the state change broadcast
//! - **Teams**: `teams.invite_ttl` - how long an invite stays acceptable
//! - **Usage**: `usage.included_vcpu_hours` - reserved vCPU hours per cycle that are not billed
//! - **Tiers**: `tiers.<tier>` - quota limits per account tier

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

use crate::api::models::projects::ComputeTier;
use crate::api::models::resources::ResourceType;
use crate::api::models::users::AccountTier;
use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "DECKHAND_CONFIG", default_value = "deckhand.yaml")]
    pub config: String,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub telemetry: TelemetryConfig,
    pub provisioning: ProvisioningConfig,
    pub deployments: DeploymentsConfig,
    pub teams: TeamsConfig,
    pub usage: UsageConfig,
    /// Per-tier quota overrides. Tiers not listed use the built-in limits.
    pub tiers: HashMap<AccountTier, TierLimits>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
    pub log_format: LogFormat,
}

/// Provisioning driver retry and concurrency settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisioningConfig {
    /// Retries after the first attempt before a resource is marked failed
    pub max_retries: u32,
    /// Base backoff, multiplied by `backoff_factor` for every further retry
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    pub backoff_factor: u32,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Timeout for a single driver call
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Duration,
    /// Concurrent driver calls per resource type
    pub default_concurrency: usize,
    /// Per-type overrides of `default_concurrency`
    pub concurrency: HashMap<ResourceType, usize>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(1),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(300),
            default_concurrency: 4,
            concurrency: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploymentsConfig {
    /// Capacity of the state change broadcast channel
    pub event_buffer: usize,
}

impl Default for DeploymentsConfig {
    fn default() -> Self {
        Self { event_buffer: 1024 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TeamsConfig {
    #[serde(with = "humantime_serde")]
    pub invite_ttl: Duration,
}

impl Default for TeamsConfig {
    fn default() -> Self {
        Self {
            invite_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UsageConfig {
    /// vCPU hours per billing cycle included before usage becomes billable
    pub included_vcpu_hours: f64,
}

/// Quota limits for one account tier. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TierLimits {
    pub max_projects: Option<u32>,
    /// Whether accounts on this tier may create teams
    pub teams: bool,
    /// Dedicated database instances included in the tier, before RDS subscription quantity
    pub rds_instances: Option<u32>,
    pub max_compute_tier: ComputeTier,
}

impl TierLimits {
    pub fn builtin(tier: AccountTier) -> Self {
        match tier {
            AccountTier::Basic | AccountTier::PendingPaymentPro | AccountTier::CancelledPro => TierLimits {
                max_projects: Some(3),
                teams: false,
                rds_instances: Some(0),
                max_compute_tier: ComputeTier::XS,
            },
            AccountTier::ProTrial => TierLimits {
                max_projects: Some(5),
                teams: false,
                rds_instances: Some(0),
                max_compute_tier: ComputeTier::S,
            },
            AccountTier::Pro => TierLimits {
                max_projects: Some(25),
                teams: true,
                rds_instances: Some(1),
                max_compute_tier: ComputeTier::L,
            },
            AccountTier::Growth => TierLimits {
                max_projects: Some(100),
                teams: true,
                rds_instances: Some(5),
                max_compute_tier: ComputeTier::XXL,
            },
            AccountTier::Employee | AccountTier::Admin => TierLimits {
                max_projects: None,
                teams: true,
                rds_instances: None,
                max_compute_tier: ComputeTier::XXL,
            },
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        Self::figment(args).extract()
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // DECKHAND_CONFIG names the file itself
            .merge(Env::prefixed("DECKHAND_").split("__").ignore(&["config"]))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let p = &self.provisioning;
        if p.backoff_factor < 1 {
            return Err(Error::Internal {
                operation: "Config validation: provisioning.backoff_factor must be at least 1".to_string(),
            });
        }
        if p.max_backoff < p.backoff {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: provisioning.max_backoff ({:?}) cannot be shorter than provisioning.backoff ({:?})",
                    p.max_backoff, p.backoff
                ),
            });
        }
        if p.attempt_timeout.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: provisioning.attempt_timeout must be non-zero".to_string(),
            });
        }
        if p.default_concurrency == 0 {
            return Err(Error::Internal {
                operation: "Config validation: provisioning.default_concurrency must be at least 1".to_string(),
            });
        }
        if let Some((ty, _)) = p.concurrency.iter().find(|(_, limit)| **limit == 0) {
            return Err(Error::Internal {
                operation: format!("Config validation: provisioning.concurrency for {ty} must be at least 1"),
            });
        }
        if self.deployments.event_buffer == 0 {
            return Err(Error::Internal {
                operation: "Config validation: deployments.event_buffer must be at least 1".to_string(),
            });
        }
        if !self.usage.included_vcpu_hours.is_finite() || self.usage.included_vcpu_hours < 0.0 {
            return Err(Error::Internal {
                operation: "Config validation: usage.included_vcpu_hours must be a non-negative number".to_string(),
            });
        }
        if self.teams.invite_ttl.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: teams.invite_ttl must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}
