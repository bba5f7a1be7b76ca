//! C1: pattern-matches stdout/stderr from the external tunnel binary (or a
//! provider API error envelope) into a closed [`ErrorKind`]. Pure and
//! stateless apart from a recognition-rate counter used only for tests.

use crate::error::{ClassifiedError, ErrorKind, RecommendedAction, Severity};
use std::sync::atomic::{AtomicU64, Ordering};

/// Context carried alongside the raw text, for future-proofing callers that
/// want to disambiguate by operation; the current rule set does not need it
/// but the classifier interface takes it to avoid a breaking change later.
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub operation: Option<String>,
    pub hostname: Option<String>,
    pub tunnel_id: Option<String>,
}

struct Rule {
    kind: ErrorKind,
    severity: Severity,
    action: RecommendedAction,
    patterns: &'static [&'static str],
}

/// Ordered rules; first match wins. More specific patterns must precede
/// broader ones — see spec §4.1.
const RULES: &[Rule] = &[
    Rule {
        kind: ErrorKind::DnsRecordExists,
        severity: Severity::Warning,
        action: RecommendedAction::ResolveDnsConflict,
        patterns: &[
            "an a, aaaa, or cname record with that host already exists",
            "record with that host already exists",
        ],
    },
    Rule {
        kind: ErrorKind::TunnelAlreadyExists,
        severity: Severity::Warning,
        action: RecommendedAction::Manual,
        patterns: &["tunnel with name", "tunnel already exists"],
    },
    Rule {
        kind: ErrorKind::DnsRecordExists,
        severity: Severity::Warning,
        action: RecommendedAction::ResolveDnsConflict,
        patterns: &["already exists"],
    },
    Rule {
        kind: ErrorKind::AuthExpiredCert,
        severity: Severity::Error,
        action: RecommendedAction::RunLogin,
        patterns: &["certificate has expired", "cert has expired", "expired certificate"],
    },
    Rule {
        kind: ErrorKind::AuthMissingCert,
        severity: Severity::Error,
        action: RecommendedAction::RunLogin,
        patterns: &[
            "cannot determine default origin certificate path",
            "no such file or directory: cert.pem",
            "missing certificate",
            "cert.pem",
            "you need to login",
        ],
    },
    Rule {
        kind: ErrorKind::AuthPermissionDenied,
        severity: Severity::Error,
        action: RecommendedAction::RunLogin,
        patterns: &["authentication failed", "invalid api token", "unauthorized", "401"],
    },
    Rule {
        kind: ErrorKind::DnsZoneNotFound,
        severity: Severity::Error,
        action: RecommendedAction::Manual,
        patterns: &["zone not found", "could not find zone", "zone_not_found"],
    },
    Rule {
        kind: ErrorKind::DnsPermissionDenied,
        severity: Severity::Error,
        action: RecommendedAction::RunLogin,
        patterns: &["permission denied", "insufficient permission", "not authorized to"],
    },
    Rule {
        kind: ErrorKind::DnsInvalidDomain,
        severity: Severity::Error,
        action: RecommendedAction::Manual,
        patterns: &["invalid dns record", "hostname is not valid", "invalid domain"],
    },
    Rule {
        kind: ErrorKind::TunnelNotFound,
        severity: Severity::Error,
        action: RecommendedAction::Manual,
        patterns: &["tunnel not found", "no tunnel found", "couldn't find tunnel"],
    },
    Rule {
        kind: ErrorKind::TunnelDeletionFailed,
        severity: Severity::Error,
        action: RecommendedAction::Manual,
        patterns: &["failed to delete tunnel", "cannot delete tunnel"],
    },
    Rule {
        kind: ErrorKind::NetworkTimeout,
        severity: Severity::Warning,
        action: RecommendedAction::Retry,
        patterns: &["timed out", "timeout", "deadline exceeded"],
    },
    Rule {
        kind: ErrorKind::NetworkConnectionFailed,
        severity: Severity::Warning,
        action: RecommendedAction::Retry,
        patterns: &["connection refused", "could not connect", "network is unreachable", "dns error"],
    },
    Rule {
        kind: ErrorKind::TunnelConnectionFailed,
        severity: Severity::Error,
        action: RecommendedAction::Retry,
        patterns: &["unable to reach the origin", "edge connection", "failed to connect to the edge"],
    },
    Rule {
        kind: ErrorKind::ConfigFileMissing,
        severity: Severity::Error,
        action: RecommendedAction::GenerateConfig,
        patterns: &["cannot find config file", "no such file or directory: config", "config file not found"],
    },
    Rule {
        kind: ErrorKind::ConfigFileInvalid,
        severity: Severity::Error,
        action: RecommendedAction::GenerateConfig,
        patterns: &["error parsing config", "invalid configuration", "yaml: "],
    },
    Rule {
        kind: ErrorKind::ProcessStartupFailed,
        severity: Severity::Error,
        action: RecommendedAction::Retry,
        patterns: &["failed to start tunnel", "could not start", "failed to initialize"],
    },
];

static TOTAL: AtomicU64 = AtomicU64::new(0);
static RECOGNIZED: AtomicU64 = AtomicU64::new(0);

/// Classify one chunk of stdout/stderr (or an API error message). Pure:
/// same input always yields the same output (spec I5); the only mutable
/// state is a pair of counters used for the recognition-rate statistic.
pub fn classify(text: &str, _ctx: &ClassifyContext) -> ClassifiedError {
    TOTAL.fetch_add(1, Ordering::Relaxed);
    let lower = text.to_lowercase();
    for rule in RULES {
        if rule.patterns.iter().any(|p| lower.contains(p)) {
            RECOGNIZED.fetch_add(1, Ordering::Relaxed);
            return ClassifiedError {
                kind: rule.kind,
                severity: rule.severity,
                recommended_action: rule.action,
                raw: text.to_string(),
            };
        }
    }
    ClassifiedError::unknown(text)
}

/// `(total classified, recognized)` — used to assert the I6 recognition-rate
/// invariant against a known corpus of provider messages.
pub fn stats() -> (u64, u64) {
    (TOTAL.load(Ordering::Relaxed), RECOGNIZED.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ClassifyContext {
        ClassifyContext::default()
    }

    #[test]
    fn classification_is_pure() {
        let a = classify("Connection refused", &ctx());
        let b = classify("Connection refused", &ctx());
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.severity, b.severity);
    }

    #[test]
    fn specific_dns_exists_pattern_wins_over_generic_already_exists() {
        let c = classify(
            "An A, AAAA, or CNAME record with that host already exists.",
            &ctx(),
        );
        assert_eq!(c.kind, ErrorKind::DnsRecordExists);
    }

    #[test]
    fn tunnel_already_exists_is_distinguished_from_dns_conflict() {
        let c = classify("tunnel with name 'prod' already exists", &ctx());
        assert_eq!(c.kind, ErrorKind::TunnelAlreadyExists);
    }

    #[test]
    fn missing_cert_is_recognized() {
        let c = classify(
            "cannot determine default origin certificate path",
            &ctx(),
        );
        assert_eq!(c.kind, ErrorKind::AuthMissingCert);
        assert_eq!(c.recommended_action, RecommendedAction::RunLogin);
    }

    #[test]
    fn unrecognized_text_falls_back_to_unknown() {
        let c = classify("the quick brown fox jumps", &ctx());
        assert_eq!(c.kind, ErrorKind::Unknown);
    }

    #[test]
    fn case_insensitive_matching() {
        let c = classify("CONNECTION REFUSED", &ctx());
        assert_eq!(c.kind, ErrorKind::NetworkConnectionFailed);
    }

    /// I6: the rule set must recognize 100% of a small corpus modeled on
    /// the exact strings the external binary / API emit (spec §4.1, §6).
    #[test]
    fn recognizes_known_corpus_at_full_rate() {
        let corpus = [
            "An A, AAAA, or CNAME record with that host already exists.",
            "Error: tunnel with name 'prod' already exists",
            "failed to find certificate, please run 'cloudflared tunnel login'. no such file or directory: cert.pem",
            "API error: authentication failed: invalid API token",
            "could not find zone for hostname",
            "permission denied: insufficient permission to edit DNS records",
            "invalid DNS record: hostname is not valid for this zone",
            "tunnel not found: no tunnel found with that ID",
            "failed to delete tunnel: in use by active connections",
            "context deadline exceeded while dialing",
            "dial tcp: connection refused",
            "failed to connect to the edge: network is unreachable",
            "cannot find config file at /home/user/.cloudflared/config.yml",
            "error parsing config file: yaml: line 4: mapping values not allowed",
            "failed to start tunnel: could not start tunnel connection",
        ];
        for msg in corpus {
            let c = classify(msg, &ctx());
            assert_ne!(c.kind, ErrorKind::Unknown, "failed to classify: {msg}");
        }
    }
}
