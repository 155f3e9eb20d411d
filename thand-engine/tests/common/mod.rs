//! Shared fixtures for the integration tests.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use thand_engine::AuthorizeRoleRequest;
use thand_engine::AuthorizeRoleResponse;
use thand_engine::Notification;
use thand_engine::Notifier;
use thand_engine::Provider;
use thand_engine::RevokeRoleRequest;
use thand_engine::ScheduledCallback;
use thand_engine::Scheduler;
use thand_model::APPROVAL_EVENT_TYPE;
use thand_model::CloudEvent;
use thand_model::WorkflowDocument;

/// Parses a workflow document from YAML.
///
/// Also installs the test subscriber so `RUST_LOG` works while debugging.
pub fn document(yaml: &str) -> Arc<WorkflowDocument> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    Arc::new(serde_yaml_ng::from_str(yaml).expect("document should parse"))
}

/// Builds the canonical elevation request input.
pub fn elevation_input(user: &str, duration: &str) -> Value {
    json!({
        "user": user,
        "role": "admin",
        "providers": ["mock"],
        "identities": [format!("{user}/cloud"), "svc-ops/cloud"],
        "duration": duration,
        "reason": "incident response",
    })
}

/// Builds an approval event from the given approver.
pub fn approval_event(user: &str, approved: bool) -> CloudEvent {
    CloudEvent::new("https://thand.io/test", APPROVAL_EVENT_TYPE)
        .with_data(json!({ "approved": approved }))
        .with_extension("user", json!(user))
}

/// An identity provider that records grants in memory.
///
/// Authorize-then-revoke for the same grant leaves the provider in its
/// pre-authorize state, which the round-trip tests assert on.
pub struct MockProvider {
    /// The name of the provider.
    name: String,
    /// The currently active grants, keyed `identity/role`.
    active: Mutex<Vec<String>>,
    /// The number of authorize calls.
    granted: Mutex<u32>,
    /// The number of revoke calls.
    revoked: Mutex<u32>,
    /// Whether authorize calls fail.
    fail_authorize: bool,
}

impl MockProvider {
    /// Constructs a provider with the given name.
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            active: Mutex::new(Vec::new()),
            granted: Mutex::new(0),
            revoked: Mutex::new(0),
            fail_authorize: false,
        })
    }

    /// Constructs a provider whose authorize calls fail.
    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            active: Mutex::new(Vec::new()),
            granted: Mutex::new(0),
            revoked: Mutex::new(0),
            fail_authorize: true,
        })
    }

    /// Gets the currently active grants.
    pub fn active(&self) -> Vec<String> {
        self.active.lock().expect("lock poisoned").clone()
    }

    /// Gets the number of authorize calls.
    pub fn granted(&self) -> u32 {
        *self.granted.lock().expect("lock poisoned")
    }

    /// Gets the number of revoke calls.
    pub fn revoked(&self) -> u32 {
        *self.revoked.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate_role(&self, role: &str) -> anyhow::Result<()> {
        if role == "forbidden" {
            anyhow::bail!("role `{role}` does not exist");
        }
        Ok(())
    }

    async fn authorize_role(
        &self,
        request: AuthorizeRoleRequest,
    ) -> anyhow::Result<AuthorizeRoleResponse> {
        if self.fail_authorize {
            anyhow::bail!("provider `{name}` is unavailable", name = self.name);
        }

        let grant = format!("{identity}/{role}", identity = request.identity, role = request.role);
        self.active.lock().expect("lock poisoned").push(grant.clone());
        *self.granted.lock().expect("lock poisoned") += 1;

        Ok(AuthorizeRoleResponse {
            provider: request.provider,
            identity: request.identity,
            role: request.role,
            grant_id: Some(grant),
            detail: None,
        })
    }

    async fn revoke_role(&self, request: RevokeRoleRequest) -> anyhow::Result<()> {
        let grant = format!(
            "{identity}/{role}",
            identity = request.authorization.identity,
            role = request.authorization.role
        );

        // Idempotent: revoking an absent grant succeeds.
        self.active.lock().expect("lock poisoned").retain(|g| g != &grant);
        *self.revoked.lock().expect("lock poisoned") += 1;
        Ok(())
    }
}

/// A notifier that records every delivery.
pub struct RecordingNotifier {
    /// The name of the notifier.
    name: String,
    /// The recorded deliveries.
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Constructs a notifier with the given name.
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Gets the recorded deliveries.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        self.sent.lock().expect("lock poisoned").push(notification);
        Ok(())
    }
}

/// A scheduler that records callbacks instead of posting them.
#[derive(Default)]
pub struct RecordingScheduler {
    /// The recorded schedules.
    scheduled: Mutex<Vec<(chrono::DateTime<chrono::Utc>, ScheduledCallback)>>,
}

impl RecordingScheduler {
    /// Constructs a new scheduler.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Gets the recorded schedules.
    pub fn scheduled(&self) -> Vec<(chrono::DateTime<chrono::Utc>, ScheduledCallback)> {
        self.scheduled.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn schedule(
        &self,
        at: chrono::DateTime<chrono::Utc>,
        callback: ScheduledCallback,
    ) -> anyhow::Result<()> {
        self.scheduled.lock().expect("lock poisoned").push((at, callback));
        Ok(())
    }
}

/// The canonical elevation workflow document.
pub const ELEVATION_DOC: &str = r#"
document:
  dsl: "1.0.0"
  namespace: thand
  name: elevate
  version: "0.1.0"
do:
  - validate:
      thand:
        validate: {}
  - approvals:
      thand:
        approvals: 2
        selfApprove: false
        on:
          approved: authorize
          denied: denied
  - authorize:
      thand:
        authorize:
          on:
            revoke: revoke
  - revoke:
      then: end
      thand:
        revoke: {}
  - denied:
      then: end
      set:
        denied: true
"#;
