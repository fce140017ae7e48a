//! OpenAPI document for the control plane contract.
//!
//! The HTTP surface lives outside this crate, so the document carries no paths: it publishes
//! the component schemas every client and the API layer agree on, plus the API key scheme.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::api::models::{deployments, errors, projects, resources, teams, telemetry, usage, users};
use crate::types::Capability;

struct ApiKeyAddon;

impl Modify for ApiKeyAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "BearerAuth".to_string(),
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("API Key")
                        .description(Some("Account API key, sent as `Authorization: Bearer <key>`."))
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&ApiKeyAddon),
    components(schemas(
        deployments::DeploymentState,
        deployments::BuildArgs,
        deployments::BuildArgsRust,
        deployments::BuildMeta,
        deployments::DeploymentRequest,
        deployments::DeploymentRequestBuildArchive,
        deployments::DeploymentRequestImage,
        deployments::DeploymentResponse,
        deployments::DeploymentListResponse,
        resources::ResourceType,
        resources::ResourceState,
        resources::ProvisionResourceRequest,
        resources::ResourceResponse,
        resources::ResourceListResponse,
        resources::DatabaseConfig,
        resources::DatabaseInfo,
        resources::ContainerConfig,
        resources::ContainerOutput,
        projects::ComputeTier,
        projects::ProjectCreateRequest,
        projects::ProjectResponse,
        projects::ProjectListResponse,
        projects::ProjectUpdateRequest,
        teams::TeamRole,
        teams::TeamCreateRequest,
        teams::TeamMembership,
        teams::TeamResponse,
        teams::TeamListResponse,
        teams::TeamMembersResponse,
        teams::AddTeamMemberRequest,
        teams::AddTeamMemberResponse,
        teams::TeamInviteResponse,
        users::AccountTier,
        users::SubscriptionType,
        users::Subscription,
        users::SubscriptionRequest,
        users::UserResponse,
        telemetry::TelemetrySinkConfig,
        telemetry::BetterstackConfig,
        telemetry::DatadogConfig,
        telemetry::GrafanaCloudConfig,
        telemetry::TelemetrySink,
        telemetry::TelemetrySinkStatus,
        telemetry::TelemetryConfigResponse,
        usage::BillingCycle,
        usage::VcpuUsage,
        usage::DailyUsage,
        usage::ProjectUsageResponse,
        usage::UserUsageResponse,
        errors::ApiError,
        Capability,
    )),
    tags(
        (name = "deployments", description = "Deployment requests and lifecycle states."),
        (name = "resources", description = "Provisioned databases, secrets and containers."),
        (name = "projects", description = "Projects and their aggregated deployment state."),
        (name = "teams", description = "Teams, memberships and invites."),
        (name = "users", description = "Accounts, tiers and subscriptions."),
    ),
    info(
        title = "Deckhand control plane",
        version = "1.0.0",
        description = "Contract shapes of the control plane. Every failure is reported as an `ApiError` body.",
    ),
)]
pub struct ContractDoc;
