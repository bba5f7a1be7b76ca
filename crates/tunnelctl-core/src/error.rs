use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed tagged set of everything the classifier can recognize (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthMissingCert,
    AuthExpiredCert,
    AuthPermissionDenied,
    DnsRecordExists,
    DnsZoneNotFound,
    DnsPermissionDenied,
    DnsInvalidDomain,
    TunnelAlreadyExists,
    TunnelNotFound,
    TunnelDeletionFailed,
    TunnelConnectionFailed,
    NetworkTimeout,
    NetworkConnectionFailed,
    ConfigFileMissing,
    ConfigFileInvalid,
    ProcessStartupFailed,
    ProcessUnexpectedExit,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    ResolveDnsConflict,
    RunLogin,
    Retry,
    GenerateConfig,
    Manual,
}

/// The result of classifying one chunk of stdout/stderr (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub recommended_action: RecommendedAction,
    pub raw: String,
}

impl ClassifiedError {
    pub fn unknown(raw: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            severity: Severity::Error,
            recommended_action: RecommendedAction::Manual,
            raw: raw.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::NetworkTimeout | ErrorKind::NetworkConnectionFailed
        )
    }
}

/// Phase in which an orchestrator-surfaced error occurred (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Auth,
    Config,
    Create,
    Dns,
    Start,
    Verify,
    E2e,
}

/// Structured, user-facing error the orchestrator returns on a failed `start`.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{title} ({phase:?}/{kind:?}): {description}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub phase: Phase,
    pub cause: String,
    pub suggestions: Vec<String>,
    pub transaction_id: Option<uuid::Uuid>,
    pub title: String,
    pub description: String,
}

impl CoreError {
    pub fn from_classified(phase: Phase, classified: ClassifiedError) -> Self {
        let (title, description) = describe(classified.kind);
        Self {
            kind: classified.kind,
            severity: classified.severity,
            phase,
            cause: classified.raw,
            suggestions: suggestions_for(classified.kind),
            transaction_id: None,
            title: title.to_string(),
            description: description.to_string(),
        }
    }

    pub fn with_transaction(mut self, id: uuid::Uuid) -> Self {
        self.transaction_id = Some(id);
        self
    }

    pub fn validation(description: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::DnsInvalidDomain,
            severity: Severity::Error,
            phase: Phase::Config,
            cause: String::new(),
            suggestions: vec!["Check the port and domain arguments.".to_string()],
            transaction_id: None,
            title: "Invalid input".to_string(),
            description: description.into(),
        }
    }

    /// Exit code mapping for a CLI shim (spec §6).
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::AuthMissingCert | ErrorKind::AuthExpiredCert | ErrorKind::AuthPermissionDenied => 2,
            ErrorKind::NetworkTimeout
            | ErrorKind::NetworkConnectionFailed
            | ErrorKind::DnsPermissionDenied
            | ErrorKind::DnsZoneNotFound => 3,
            ErrorKind::DnsInvalidDomain => 4,
            _ => 1,
        }
    }
}

fn describe(kind: ErrorKind) -> (&'static str, &'static str) {
    match kind {
        ErrorKind::AuthMissingCert => (
            "No Cloudflare certificate found",
            "A named tunnel requires a credential file that does not exist yet.",
        ),
        ErrorKind::AuthExpiredCert => (
            "Cloudflare certificate expired",
            "The stored credential file is no longer accepted by the provider.",
        ),
        ErrorKind::AuthPermissionDenied => (
            "Authentication rejected",
            "The provider rejected the supplied credentials.",
        ),
        ErrorKind::DnsRecordExists => (
            "DNS record already exists",
            "A conflicting record was found for this hostname.",
        ),
        ErrorKind::DnsZoneNotFound => (
            "Zone not found",
            "No zone in this account matches the requested hostname.",
        ),
        ErrorKind::DnsPermissionDenied => (
            "DNS permission denied",
            "The API token lacks permission to modify this zone's records.",
        ),
        ErrorKind::DnsInvalidDomain => (
            "Invalid domain",
            "The hostname is not a valid DNS name for this zone.",
        ),
        ErrorKind::TunnelAlreadyExists => (
            "Tunnel already exists",
            "A tunnel with this name is already registered on the account.",
        ),
        ErrorKind::TunnelNotFound => (
            "Tunnel not found",
            "No tunnel with this id or name exists.",
        ),
        ErrorKind::TunnelDeletionFailed => (
            "Tunnel deletion failed",
            "The provider refused to delete the tunnel.",
        ),
        ErrorKind::TunnelConnectionFailed => (
            "Tunnel connection failed",
            "The tunnel process could not establish a connection to the edge.",
        ),
        ErrorKind::NetworkTimeout => (
            "Network timeout",
            "A call to the provider did not complete in time.",
        ),
        ErrorKind::NetworkConnectionFailed => (
            "Network connection failed",
            "A call to the provider could not reach the network.",
        ),
        ErrorKind::ConfigFileMissing => (
            "Configuration file missing",
            "The expected ingress configuration file was not found.",
        ),
        ErrorKind::ConfigFileInvalid => (
            "Configuration file invalid",
            "The stored configuration could not be parsed.",
        ),
        ErrorKind::ProcessStartupFailed => (
            "Process failed to start",
            "The external tunnel binary did not reach a ready state.",
        ),
        ErrorKind::ProcessUnexpectedExit => (
            "Process exited unexpectedly",
            "The external tunnel binary exited while it should have been running.",
        ),
        ErrorKind::Unknown => (
            "Unknown error",
            "The output of the external tunnel binary did not match any known pattern.",
        ),
    }
}

fn suggestions_for(kind: ErrorKind) -> Vec<String> {
    let raw: &[&str] = match kind {
        ErrorKind::AuthMissingCert | ErrorKind::AuthExpiredCert => {
            &["Run `cloudflared tunnel login` and retry."]
        }
        ErrorKind::AuthPermissionDenied => &[
            "Verify the stored API token is still valid.",
            "Re-authenticate and retry.",
        ],
        ErrorKind::DnsRecordExists => &[
            "Let the reconciler update the existing record.",
            "Delete the conflicting record manually and retry.",
        ],
        ErrorKind::DnsZoneNotFound => &["Confirm the domain is registered in this Cloudflare account."],
        ErrorKind::DnsPermissionDenied => &["Grant the API token DNS edit permission on this zone."],
        ErrorKind::DnsInvalidDomain => &["Use a fully-qualified domain name under a zone you own."],
        ErrorKind::TunnelAlreadyExists => &["Reuse the existing tunnel or choose a different name."],
        ErrorKind::TunnelNotFound => &["Recreate the tunnel before routing or running it."],
        ErrorKind::TunnelDeletionFailed => &["Retry the delete or remove it from the dashboard."],
        ErrorKind::TunnelConnectionFailed => &["Check outbound network access and retry."],
        ErrorKind::NetworkTimeout | ErrorKind::NetworkConnectionFailed => {
            &["Check your network connection and retry."]
        }
        ErrorKind::ConfigFileMissing | ErrorKind::ConfigFileInvalid => {
            &["Let the controller regenerate the ingress configuration."]
        }
        ErrorKind::ProcessStartupFailed | ErrorKind::ProcessUnexpectedExit => {
            &["Inspect the raw output and retry the start."]
        }
        ErrorKind::Unknown => &["Re-run with debug output enabled and inspect the raw output."],
    };
    raw.iter().take(4).map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_spec_table() {
        let auth = CoreError::from_classified(
            Phase::Auth,
            ClassifiedError {
                kind: ErrorKind::AuthMissingCert,
                severity: Severity::Error,
                recommended_action: RecommendedAction::RunLogin,
                raw: String::new(),
            },
        );
        assert_eq!(auth.exit_code(), 2);

        let net = CoreError::from_classified(
            Phase::Dns,
            ClassifiedError {
                kind: ErrorKind::NetworkTimeout,
                severity: Severity::Warning,
                recommended_action: RecommendedAction::Retry,
                raw: String::new(),
            },
        );
        assert_eq!(net.exit_code(), 3);

        let validation = CoreError::validation("bad port");
        assert_eq!(validation.exit_code(), 4);
    }

    #[test]
    fn suggestions_are_bounded_to_four() {
        for kind in [
            ErrorKind::AuthMissingCert,
            ErrorKind::DnsRecordExists,
            ErrorKind::Unknown,
        ] {
            assert!(suggestions_for(kind).len() <= 4);
            assert!(!suggestions_for(kind).is_empty());
        }
    }
}
