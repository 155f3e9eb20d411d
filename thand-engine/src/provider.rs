//! Named interfaces for the engine's external collaborators.
//!
//! Identity providers, notification providers, and the narrative validator
//! are plugins; the engine only depends on the traits below.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thand_model::ElevationRequest;

/// Represents a request to authorize an identity into a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizeRoleRequest {
    /// The name of the provider the role is granted through.
    pub provider: String,
    /// The identity being elevated.
    pub identity: String,
    /// The role granted.
    pub role: String,
    /// The duration of the grant, as an ISO-8601 string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// The reason for the grant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Represents a provider's response to an authorization.
///
/// The response is stored in the instance context and handed back verbatim
/// for revocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizeRoleResponse {
    /// The name of the provider.
    pub provider: String,
    /// The authorized identity.
    pub identity: String,
    /// The granted role.
    pub role: String,
    /// The provider-assigned grant identifier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<String>,
    /// Provider-specific detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Represents a request to revoke a previously granted role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeRoleRequest {
    /// The authorization being revoked.
    pub authorization: AuthorizeRoleResponse,
}

/// Represents an identity provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Gets the name of the provider.
    fn name(&self) -> &str;

    /// Validates that the given role exists under the provider.
    async fn validate_role(&self, role: &str) -> anyhow::Result<()>;

    /// Grants the requested role.
    async fn authorize_role(
        &self,
        request: AuthorizeRoleRequest,
    ) -> anyhow::Result<AuthorizeRoleResponse>;

    /// Revokes a previously granted role.
    ///
    /// Revocation must be idempotent: revoking an already revoked grant
    /// succeeds.
    async fn revoke_role(&self, request: RevokeRoleRequest) -> anyhow::Result<()>;
}

/// Represents a rendered notification.
///
/// Rendering (Slack blocks, HTML bodies) is the notifier plugin's concern;
/// the engine passes the subject and payload through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// The recipient of the notification.
    pub recipient: String,
    /// The subject of the notification.
    pub subject: String,
    /// The payload of the notification.
    pub body: Value,
}

/// Represents a notification provider.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Gets the name of the notifier.
    fn name(&self) -> &str;

    /// Sends a notification.
    async fn notify(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Represents the optional narrative validator a `validate` task may
/// delegate to.
#[async_trait]
pub trait NarrativeValidator: Send + Sync {
    /// Validates the narrative of an elevation request.
    async fn validate(
        &self,
        request: &ElevationRequest,
        prompt: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Represents the explicit maps of registered collaborators.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    /// The identity providers, keyed by name.
    providers: HashMap<String, Arc<dyn Provider>>,
    /// The notification providers, keyed by name.
    notifiers: HashMap<String, Arc<dyn Notifier>>,
    /// The narrative validator, if one is registered.
    narrative: Option<Arc<dyn NarrativeValidator>>,
}

impl ProviderRegistry {
    /// Constructs an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an identity provider.
    pub fn register_provider(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Registers a notification provider.
    pub fn register_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(notifier.name().to_string(), notifier);
    }

    /// Sets the narrative validator.
    pub fn set_narrative_validator(&mut self, validator: Arc<dyn NarrativeValidator>) {
        self.narrative = Some(validator);
    }

    /// Gets the identity provider registered under the given name.
    pub fn provider(&self, name: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(name)
    }

    /// Gets the notification provider registered under the given name.
    pub fn notifier(&self, name: &str) -> Option<&Arc<dyn Notifier>> {
        self.notifiers.get(name)
    }

    /// Gets the narrative validator, if one is registered.
    pub fn narrative_validator(&self) -> Option<&Arc<dyn NarrativeValidator>> {
        self.narrative.as_ref()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("notifiers", &self.notifiers.keys().collect::<Vec<_>>())
            .field("narrative", &self.narrative.is_some())
            .finish()
    }
}
