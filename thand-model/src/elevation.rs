//! Implementation of the elevation request domain object.

use serde::Deserialize;
use serde::Serialize;

use crate::DurationError;
use crate::parse_iso8601;

/// Represents an elevation request: the domain object under approval.
///
/// The request is validated by an early `validate` task and stored in the
/// instance context, where the approval, authorization, and revocation tasks
/// read it back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElevationRequest {
    /// The user requesting the elevation.
    pub user: String,
    /// The role the user is elevated into.
    pub role: String,
    /// The providers the role is granted through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<String>,
    /// The identities being elevated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<String>,
    /// The duration of the elevation, as an ISO-8601 string.
    pub duration: String,
    /// The reason given for the elevation.
    #[serde(default)]
    pub reason: String,
}

impl ElevationRequest {
    /// Parses the elevation duration.
    pub fn duration(&self) -> Result<std::time::Duration, DurationError> {
        parse_iso8601(&self.duration)
    }

    /// Returns `true` if the given identity is the requester or one of the
    /// identities being elevated.
    pub fn involves(&self, identity: &str) -> bool {
        self.user == identity || self.identities.iter().any(|i| i == identity)
    }
}

/// The instance context key the elevation request is stored under.
pub const ELEVATION_CONTEXT_KEY: &str = "elevation";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn involvement_covers_requester_and_identities() {
        let request = ElevationRequest {
            user: "alice@example.com".to_string(),
            role: "admin".to_string(),
            providers: vec!["aws".to_string()],
            identities: vec!["alice@aws".to_string(), "svc-alice@aws".to_string()],
            duration: "PT1H".to_string(),
            reason: "incident".to_string(),
        };

        assert!(request.involves("alice@example.com"));
        assert!(request.involves("svc-alice@aws"));
        assert!(!request.involves("bob@example.com"));
    }
}
