//! API request/response models for deployments.

use crate::types::DeploymentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use utoipa::ToSchema;

/// Observable state of a deployment.
///
/// `Unknown` is never assigned by the control plane; it only absorbs values added by
/// newer servers so older readers keep deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    Pending,
    Building,
    Running,
    #[serde(rename = "inprogress")]
    InProgress,
    Stopped,
    Stopping,
    Failed,
    #[serde(other)]
    Unknown,
}

impl DeploymentState {
    /// Pending, Building, InProgress and Running deployments count against the
    /// one-active-deployment-per-project rule. Stopping deployments are draining.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DeploymentState::Pending | DeploymentState::Building | DeploymentState::InProgress | DeploymentState::Running
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentState::Stopped | DeploymentState::Failed)
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentState::Pending => "pending",
            DeploymentState::Building => "building",
            DeploymentState::Running => "running",
            DeploymentState::InProgress => "inprogress",
            DeploymentState::Stopped => "stopped",
            DeploymentState::Stopping => "stopping",
            DeploymentState::Failed => "failed",
            DeploymentState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Secrets injected into a deployment. Never echoed back and redacted from debug output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretMap(pub HashMap<String, String>);

impl fmt::Debug for SecretMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.0.keys().collect();
        keys.sort();
        f.debug_struct("SecretMap").field("keys", &keys).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BuildArgsRust {
    /// Version of shuttle-runtime used by this crate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuttle_runtime_version: Option<String>,
    /// Use the built in cargo chef setup for caching
    pub cargo_chef: bool,
    /// Build with the built in `cargo build` setup
    pub cargo_build: bool,
    /// The cargo package name to compile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    /// The cargo binary name to compile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_name: Option<String>,
    /// Comma-separated list of features to activate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<String>,
    /// Passed on to `cargo build`
    pub no_default_features: bool,
    /// Use the mold linker
    pub mold: bool,
}

impl Default for BuildArgsRust {
    fn default() -> Self {
        Self {
            shuttle_runtime_version: None,
            cargo_chef: true,
            cargo_build: true,
            package_name: None,
            binary_name: None,
            features: None,
            no_default_features: false,
            mold: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "content")]
pub enum BuildArgs {
    Rust(BuildArgsRust),
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BuildMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_dirty: Option<bool>,
}

/// Build an image from the source code in a previously uploaded archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeploymentRequestBuildArchive {
    /// Object version ID of the archive to use
    pub archive_version_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_args: Option<BuildArgs>,
    /// Secrets to add before this deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<HashMap<String, String>>)]
    pub secrets: Option<SecretMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_meta: Option<BuildMeta>,
    /// Why the deployment failed (only present in the Failed state)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Run an existing image, skipping the build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeploymentRequestImage {
    #[schema(example = "registry.example.com/app:v1")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<HashMap<String, String>>)]
    pub secrets: Option<SecretMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "content")]
pub enum DeploymentRequest {
    BuildArchive(DeploymentRequestBuildArchive),
    Image(DeploymentRequestImage),
}

impl DeploymentRequest {
    pub fn is_image(&self) -> bool {
        matches!(self, DeploymentRequest::Image(_))
    }

    pub fn build_meta(&self) -> Option<&BuildMeta> {
        match self {
            DeploymentRequest::BuildArchive(b) => b.build_meta.as_ref(),
            DeploymentRequest::Image(_) => None,
        }
    }

    pub fn secrets(&self) -> Option<&SecretMap> {
        match self {
            DeploymentRequest::BuildArchive(b) => b.secrets.as_ref(),
            DeploymentRequest::Image(i) => i.secrets.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeploymentResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: DeploymentId,
    pub state: DeploymentState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// URIs where this deployment can currently be reached (only relevant for Running state)
    pub uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_meta: Option<BuildMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeploymentListResponse {
    pub deployments: Vec<DeploymentResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deployment_state_spelling_and_fallback() {
        assert_eq!(serde_json::to_value(DeploymentState::InProgress).unwrap(), json!("inprogress"));
        assert_eq!(serde_json::to_value(DeploymentState::Stopping).unwrap(), json!("stopping"));
        let parsed: DeploymentState = serde_json::from_value(json!("hibernating")).unwrap();
        assert_eq!(parsed, DeploymentState::Unknown);
    }

    #[test]
    fn test_deployment_request_tagging() {
        let request: DeploymentRequest = serde_json::from_value(json!({
            "type": "Image",
            "content": { "image": "reg/app:v1" }
        }))
        .unwrap();
        assert!(request.is_image());

        let request: DeploymentRequest = serde_json::from_value(json!({
            "type": "BuildArchive",
            "content": {
                "archive_version_id": "v42",
                "build_args": { "type": "Unknown" },
                "secrets": { "API_KEY": "hunter2" }
            }
        }))
        .unwrap();
        match &request {
            DeploymentRequest::BuildArchive(b) => {
                assert_eq!(b.build_args, Some(BuildArgs::Unknown));
                assert!(!format!("{:?}", b).contains("hunter2"));
            }
            DeploymentRequest::Image(_) => panic!("expected build archive"),
        }
    }

    #[test]
    fn test_unknown_discriminant_is_rejected() {
        let result: Result<DeploymentRequest, _> = serde_json::from_value(json!({
            "type": "Dockerfile",
            "content": {}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_response_skips_absent_optionals() {
        let response = DeploymentResponse {
            id: uuid::Uuid::nil(),
            state: DeploymentState::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            uris: vec![],
            build_id: None,
            build_meta: None,
            reason: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("build_id").is_none());
        assert!(value.get("build_meta").is_none());
        assert!(value.get("reason").is_none());
        assert_eq!(value["uris"], json!([]));
    }
}
