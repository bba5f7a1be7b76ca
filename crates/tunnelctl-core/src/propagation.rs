//! C6: polls DNS resolvers until a CNAME points at the expected tunnel
//! target, with exponential backoff and an authoritative-then-public
//! resolver order.

use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::{debug, warn};

const PUBLIC_RESOLVERS: [Ipv4Addr; 3] = [
    Ipv4Addr::new(1, 1, 1, 1),
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(8, 8, 4, 4),
];

#[derive(Debug, Clone, Copy)]
pub struct VerifyPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub max_total_wait: Duration,
    pub use_authoritative: bool,
}

impl VerifyPolicy {
    /// Full policy used after a direct API create/update.
    pub fn standard() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_retries: 8,
            max_total_wait: Duration::from_secs(120),
            use_authoritative: true,
        }
    }

    /// Short policy used after `cloudflared tunnel route dns`, which already
    /// writes through Cloudflare's own authoritative servers.
    pub fn short() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            max_retries: 3,
            max_total_wait: Duration::from_secs(30),
            use_authoritative: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Propagated,
    TimedOut { attempts: u32 },
}

pub struct PropagationVerifier;

impl PropagationVerifier {
    /// Polls public resolvers (and, when the policy asks for it, the zone's
    /// own authoritative servers) until `hostname`'s CNAME target matches
    /// `expected_target`, suffix-tolerant on the trailing dot.
    pub async fn verify(hostname: &str, expected_target: &str, policy: VerifyPolicy) -> VerifyOutcome {
        let deadline = tokio::time::Instant::now() + policy.max_total_wait;
        let mut delay = policy.initial_delay;
        let mut resolvers = Self::build_resolvers(hostname, policy.use_authoritative).await;

        for attempt in 1..=policy.max_retries {
            for resolver in &resolvers {
                if Self::cname_matches(resolver, hostname, expected_target).await {
                    debug!(hostname, attempt, "propagation confirmed");
                    return VerifyOutcome::Propagated;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let wait = delay.min(remaining);
            if wait.is_zero() {
                break;
            }
            debug!(hostname, attempt, wait_secs = wait.as_secs(), "not yet propagated, backing off");
            tokio::time::sleep(wait).await;
            delay = (delay * 2).min(policy.max_delay);
        }
        resolvers.clear();
        VerifyOutcome::TimedOut {
            attempts: policy.max_retries,
        }
    }

    async fn build_resolvers(hostname: &str, use_authoritative: bool) -> Vec<TokioAsyncResolver> {
        let mut resolvers = Vec::new();
        if use_authoritative {
            if let Some(auth) = Self::authoritative_resolvers(hostname).await {
                resolvers.extend(auth);
            }
        }
        for ip in PUBLIC_RESOLVERS {
            resolvers.push(Self::resolver_for(IpAddr::V4(ip)));
        }
        resolvers
    }

    /// Looks up the registrable parent's NS records through a public
    /// resolver, then builds resolvers pinned to the first two name servers.
    async fn authoritative_resolvers(hostname: &str) -> Option<Vec<TokioAsyncResolver>> {
        let parent = registrable_parent(hostname);
        let bootstrap = Self::resolver_for(IpAddr::V4(PUBLIC_RESOLVERS[0]));
        let ns_lookup = bootstrap.ns_lookup(format!("{parent}.")).await.ok()?;

        let mut out = Vec::new();
        for ns in ns_lookup.iter().take(2) {
            let ns_name = ns.to_utf8();
            if let Ok(lookup) = bootstrap.lookup_ip(ns_name).await {
                if let Some(ip) = lookup.iter().next() {
                    out.push(Self::resolver_for(ip));
                }
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn resolver_for(ip: IpAddr) -> TokioAsyncResolver {
        let group = NameServerConfigGroup::from_ips_clear(&[ip], 53, true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(4);
        opts.attempts = 1;
        TokioAsyncResolver::tokio(config, opts)
    }

    async fn cname_matches(resolver: &TokioAsyncResolver, hostname: &str, expected_target: &str) -> bool {
        let lookup = match resolver.lookup(hostname, hickory_resolver::proto::rr::RecordType::CNAME).await {
            Ok(l) => l,
            Err(e) => {
                warn!(hostname, "lookup failed: {e}");
                return false;
            }
        };
        lookup.iter().any(|rdata| {
            rdata
                .as_cname()
                .map(|name| suffix_tolerant_eq(&name.to_utf8(), expected_target))
                .unwrap_or(false)
        })
    }
}

/// Equal up to a trailing dot on either side — the wire form of a CNAME is
/// always fully qualified, the configured target usually isn't — and
/// tolerant of either side being a substring of the other, since an
/// authoritative server and a recursor can return the apex and a
/// recursor-canonical form of the same target.
fn suffix_tolerant_eq(a: &str, b: &str) -> bool {
    let a = a.trim_end_matches('.');
    let b = b.trim_end_matches('.');
    a == b || a.contains(b) || b.contains(a)
}

/// Naive two-label registrable-domain heuristic (good enough for the public
/// suffixes this tool deals with: `*.com`, `*.org`, `*.co.uk` are not
/// special-cased, matching spec §4.6's stated scope).
fn registrable_parent(hostname: &str) -> String {
    let labels: Vec<&str> = hostname.trim_end_matches('.').split('.').collect();
    if labels.len() <= 2 {
        labels.join(".")
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_tolerant_eq_ignores_trailing_dot() {
        assert!(suffix_tolerant_eq("abc.cfargotunnel.com.", "abc.cfargotunnel.com"));
        assert!(suffix_tolerant_eq("abc.cfargotunnel.com", "abc.cfargotunnel.com."));
        assert!(!suffix_tolerant_eq("abc.cfargotunnel.com", "def.cfargotunnel.com"));
    }

    #[test]
    fn suffix_tolerant_eq_matches_either_direction_of_containment() {
        assert!(suffix_tolerant_eq(
            "abc.cfargotunnel.com",
            "www.abc.cfargotunnel.com"
        ));
        assert!(suffix_tolerant_eq(
            "www.abc.cfargotunnel.com.",
            "abc.cfargotunnel.com"
        ));
    }

    #[test]
    fn registrable_parent_strips_subdomains() {
        assert_eq!(registrable_parent("app.staging.example.com"), "example.com");
        assert_eq!(registrable_parent("example.com"), "example.com");
    }

    #[test]
    fn short_policy_skips_authoritative_hop() {
        let policy = VerifyPolicy::short();
        assert!(!policy.use_authoritative);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_total_wait, Duration::from_secs(30));
    }

    #[test]
    fn standard_policy_matches_spec_defaults() {
        let policy = VerifyPolicy::standard();
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.max_retries, 8);
        assert_eq!(policy.max_total_wait, Duration::from_secs(120));
    }
}
