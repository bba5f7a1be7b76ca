use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Kind of tunnel a [`TunnelHandle`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Named,
    Quick,
}

/// A live or recently-live tunnel. Owned exclusively by the
/// [`crate::orchestrator::LifecycleOrchestrator`] for the duration of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelHandle {
    pub id: String,
    pub name: String,
    pub kind: TunnelKind,
    pub local_port: u16,
    pub hostname: Option<String>,
    pub config_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl TunnelHandle {
    pub fn new_named(
        id: String,
        name: String,
        local_port: u16,
        hostname: String,
        config_path: PathBuf,
    ) -> Self {
        Self {
            id,
            name,
            kind: TunnelKind::Named,
            local_port,
            hostname: Some(hostname),
            config_path: Some(config_path),
            created_at: Utc::now(),
        }
    }

    pub fn new_quick(name: String, local_port: u16) -> Self {
        Self {
            id: String::new(),
            name,
            kind: TunnelKind::Quick,
            local_port,
            hostname: None,
            config_path: None,
            created_at: Utc::now(),
        }
    }

    /// Invariant: `kind = quick <=> hostname = None`.
    pub fn invariant_holds(&self) -> bool {
        matches!(
            (self.kind, &self.hostname),
            (TunnelKind::Quick, None) | (TunnelKind::Named, Some(_))
        )
    }
}

/// Three-valued authentication state, read-only once returned by [`crate::auth_gate::AuthGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthLevel {
    None,
    CertOnly,
    ApiOnly,
    Full,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AuthState {
    pub has_cert: bool,
    pub has_api_token: bool,
    pub level: AuthLevel,
}

impl AuthState {
    pub fn from_flags(has_cert: bool, has_api_token: bool) -> Self {
        let level = match (has_cert, has_api_token) {
            (true, true) => AuthLevel::Full,
            (true, false) => AuthLevel::CertOnly,
            (false, true) => AuthLevel::ApiOnly,
            (false, false) => AuthLevel::None,
        };
        Self {
            has_cert,
            has_api_token,
            level,
        }
    }
}

/// A DNS resource record as modeled by the Cloudflare v4 API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub zone_id: String,
    #[serde(rename = "type")]
    pub record_type: DnsRecordType,
    pub name: String,
    pub content: String,
    pub ttl: u32,
    pub proxied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnsRecordType {
    A,
    AAAA,
    CNAME,
}

impl DnsRecord {
    /// Whether this record satisfies the core tunnel-routing invariant:
    /// `type = CNAME && content = "<id>.cfargotunnel.com" && proxied = false`.
    pub fn routes_tunnel(&self, tunnel_id: &str) -> bool {
        self.record_type == DnsRecordType::CNAME
            && self.content.trim_end_matches('.') == format!("{tunnel_id}.cfargotunnel.com")
            && !self.proxied
    }
}

/// Ordered sequence of forward actions with their inverses, owned by the
/// orchestrator for one `start` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: uuid::Uuid,
    pub kind: String,
    pub status: TransactionStatus,
    pub steps: Vec<TransactionStep>,
    #[serde(skip)]
    pub rollback_stack: Vec<RollbackAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStep {
    pub action_tag: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

/// One entry of the LIFO rollback stack. `payload` carries whatever the
/// inverse action needs (a tunnel id, a record id, a path) serialized as a
/// plain string to keep the stack homogeneous and easy to log.
///
/// `DeleteDnsRecord` carries only the hostname rather than a `(zone_id,
/// record_id)` pair: the zone may not have been looked up yet when the
/// rollback entry is pushed (Layer 1 of the reconciler needs no zone id at
/// all), so the inverse re-resolves the zone and matching record by
/// hostname at rollback time, same as a best-effort teardown would.
#[derive(Debug, Clone)]
pub enum RollbackAction {
    DeleteConfigFile(PathBuf),
    DeleteTunnel { id: String },
    DeleteDnsRecord { hostname: String },
    StopSupervisor,
}

impl Transaction {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            kind: kind.into(),
            status: TransactionStatus::Active,
            steps: Vec::new(),
            rollback_stack: Vec::new(),
        }
    }

    pub fn record_step(&mut self, action_tag: impl Into<String>, payload: impl Into<String>) {
        self.steps.push(TransactionStep {
            action_tag: action_tag.into(),
            payload: payload.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn push_rollback(&mut self, action: RollbackAction) {
        self.rollback_stack.push(action);
    }

    pub fn commit(&mut self) {
        self.status = TransactionStatus::Committed;
        self.rollback_stack.clear();
    }

    pub fn fail(&mut self) {
        self.status = TransactionStatus::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_handle_satisfies_invariant() {
        let h = TunnelHandle::new_named(
            "abc".into(),
            "my-tunnel".into(),
            8080,
            "app.example.com".into(),
            PathBuf::from("/tmp/config.yml"),
        );
        assert!(h.invariant_holds());
    }

    #[test]
    fn quick_handle_satisfies_invariant() {
        let h = TunnelHandle::new_quick("quick".into(), 8080);
        assert!(h.invariant_holds());
    }

    #[test]
    fn auth_level_derivation_matches_truth_table() {
        assert_eq!(AuthState::from_flags(true, true).level, AuthLevel::Full);
        assert_eq!(AuthState::from_flags(true, false).level, AuthLevel::CertOnly);
        assert_eq!(AuthState::from_flags(false, true).level, AuthLevel::ApiOnly);
        assert_eq!(AuthState::from_flags(false, false).level, AuthLevel::None);
    }

    #[test]
    fn dns_record_routes_tunnel_is_suffix_tolerant_on_trailing_dot() {
        let rec = DnsRecord {
            id: "1".into(),
            zone_id: "z".into(),
            record_type: DnsRecordType::CNAME,
            name: "app.example.com".into(),
            content: "11111111-1111-1111-1111-111111111111.cfargotunnel.com.".into(),
            ttl: 300,
            proxied: false,
        };
        assert!(rec.routes_tunnel("11111111-1111-1111-1111-111111111111"));
    }

    #[test]
    fn dns_record_proxied_violates_invariant() {
        let rec = DnsRecord {
            id: "1".into(),
            zone_id: "z".into(),
            record_type: DnsRecordType::CNAME,
            name: "app.example.com".into(),
            content: "abc.cfargotunnel.com".into(),
            ttl: 300,
            proxied: true,
        };
        assert!(!rec.routes_tunnel("abc"));
    }

    #[test]
    fn transaction_commit_clears_rollback_stack() {
        let mut tx = Transaction::new("named-start");
        tx.push_rollback(RollbackAction::StopSupervisor);
        tx.commit();
        assert!(tx.rollback_stack.is_empty());
        assert_eq!(tx.status, TransactionStatus::Committed);
    }
}
