//! C9: the top-level transaction. Gathers auth, picks a tunnel mode, drives
//! C3-C8 in order, records rollback actions, commits or rolls back
//! atomically.

use crate::auth_gate::AuthGate;
use crate::classifier::{self, ClassifyContext};
use crate::command_builder::CommandBuilder;
use crate::config_store::ConfigStore;
use crate::dns_client::DnsClient;
use crate::error::{ClassifiedError, CoreError, ErrorKind, Phase, RecommendedAction, Severity};
use crate::propagation::{PropagationVerifier, VerifyPolicy};
use crate::reconciler::{DnsReconciler, RouteMethod};
use crate::supervisor::{RestartPolicy, SupervisorHandle, SupervisorState, TunnelSupervisor};
use crate::types::{AuthLevel, AuthState, RollbackAction, Transaction, TunnelHandle};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub domain: Option<String>,
    pub skip_auth: bool,
    pub interactive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Quick,
    Named,
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub url: String,
    pub handle: TunnelHandle,
    pub method_used: Option<RouteMethod>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub state: SupervisorState,
    pub url: Option<String>,
    pub last_health_check: Option<chrono::DateTime<chrono::Utc>>,
    pub restart_attempts: u32,
}

pub struct LifecycleOrchestrator {
    cloudflared_bin: String,
    config_dir: PathBuf,
    config_store: ConfigStore,
    auth: AuthGate,
    supervisor: TunnelSupervisor,
}

/// Owned together so `stop`/`status` have something to act on without the
/// orchestrator tracking global mutable state across calls.
pub struct ActiveTunnel {
    pub handle: TunnelHandle,
    pub supervisor_handle: SupervisorHandle,
}

impl LifecycleOrchestrator {
    pub fn new(cloudflared_bin: impl Into<String>, config_dir: PathBuf, config_store: ConfigStore) -> Self {
        let cloudflared_bin = cloudflared_bin.into();
        let supervisor = TunnelSupervisor::new(cloudflared_bin.clone(), RestartPolicy::default());
        Self {
            cloudflared_bin,
            config_dir,
            config_store,
            auth: AuthGate::new(),
            supervisor,
        }
    }

    fn choose_mode(&self, state: AuthState, options: &StartOptions) -> Mode {
        if options.skip_auth || state.level == AuthLevel::None {
            return Mode::Quick;
        }
        match state.level {
            AuthLevel::CertOnly | AuthLevel::Full if options.domain.is_some() => Mode::Named,
            _ => Mode::Quick,
        }
    }

    pub async fn start(&self, local_port: u16, options: StartOptions) -> Result<(StartOutcome, ActiveTunnel), CoreError> {
        if local_port == 0 {
            return Err(CoreError::validation("port must be in 1..=65535, got 0"));
        }

        let cert_path = ConfigStore::credential_file_path();
        let state = self
            .auth
            .resolve(&self.config_store, &cert_path)
            .await
            .map_err(|e| CoreError::validation(e.to_string()))?;

        match self.choose_mode(state, &options) {
            Mode::Quick => self.start_quick(local_port).await,
            Mode::Named => {
                let domain = options.domain.clone().expect("choose_mode guarantees Some");
                self.start_named(local_port, &domain, options.interactive).await
            }
        }
    }

    async fn start_quick(&self, local_port: u16) -> Result<(StartOutcome, ActiveTunnel), CoreError> {
        let mut tx = Transaction::new("quick-start");
        let name = format!("quick-{local_port}");
        let config_path = self.config_dir.join("config.yml");
        let builder = CommandBuilder::new(config_path);

        info!(local_port, "starting quick tunnel");
        let mut supervisor_handle = self.supervisor.start_quick(&builder, local_port).await?;
        tx.record_step("supervisor-start", &name);
        tx.push_rollback(RollbackAction::StopSupervisor);

        let url = match supervisor_handle.events.recv().await {
            Some(crate::supervisor::SupervisorEvent::Ready { quick_url: Some(url) }) => url,
            _ => {
                supervisor_handle.stop().await;
                tx.fail();
                return Err(quick_url_not_scraped());
            }
        };

        tx.commit();
        let handle = TunnelHandle::new_quick(name, local_port);
        Ok((
            StartOutcome {
                url,
                handle: handle.clone(),
                method_used: None,
            },
            ActiveTunnel {
                handle,
                supervisor_handle,
            },
        ))
    }

    async fn start_named(
        &self,
        local_port: u16,
        hostname: &str,
        interactive: bool,
    ) -> Result<(StartOutcome, ActiveTunnel), CoreError> {
        let mut tx = Transaction::new("named-start");
        let name = format!("tunnelctl-{local_port}");
        let config_path = self.config_dir.join(format!("{name}.yml"));
        let builder = CommandBuilder::new(config_path.clone());

        let stored = self
            .config_store
            .read()
            .map_err(|e| e.with_transaction(tx.id))?;
        let token = stored.cloudflare.api_token.clone().unwrap_or_default();
        let dns = DnsClient::new(token);

        // Step 1: AuthGate already checked by the caller's choose_mode; no inverse.
        tx.record_step("auth-gate", "cert-present");

        // Step 3 happens before step 2 writes ingress (needs the tunnel id for
        // the credentials-file path), but the transaction semantics are
        // unaffected: create first, rollback still runs in reverse order.
        let tunnel_id = match self.create_tunnel(&builder, &name).await {
            Ok(id) => {
                tx.record_step("create-tunnel", &id);
                tx.push_rollback(RollbackAction::DeleteTunnel { id: id.clone() });
                id
            }
            Err(e) => {
                tx.fail();
                return Err(e.with_transaction(tx.id));
            }
        };

        // Step 2: write ingress config now that the tunnel id is known.
        let credentials_file = self
            .config_dir
            .join(format!("{tunnel_id}.json"));
        let ingress = CommandBuilder::build_ingress(&tunnel_id, credentials_file, Some(hostname), local_port);
        if let Err(e) = builder.write_ingress(&ingress).await {
            self.rollback(&mut tx).await;
            return Err(CoreError::validation(e.to_string()).with_transaction(tx.id));
        }
        tx.record_step("write-ingress", config_path.display().to_string());
        tx.push_rollback(RollbackAction::DeleteConfigFile(config_path.clone()));

        // Step 4: reconcile the DNS record. Layer 1 (the external binary's own
        // `route dns`) needs no zone lookup at all, so the zone id is only
        // resolved lazily when Layer 1 fails and Layers 2/3 need it — a
        // transient zone-lookup failure must not skip trying Layer 1 first.
        let reconciler = DnsReconciler::new(&dns, &builder, &self.cloudflared_bin, interactive);
        let method = match reconciler.route_via_cli(&tunnel_id, hostname).await {
            Ok(method) => method,
            Err(_) => {
                let zone_id = match dns.zone_id(hostname).await {
                    Ok(z) => z,
                    Err(e) => {
                        self.rollback(&mut tx).await;
                        return Err(e.with_transaction(tx.id));
                    }
                };
                match reconciler.reconcile_via_api(&zone_id, hostname, &tunnel_id).await {
                    Ok(method) => method,
                    Err(e) => {
                        self.rollback(&mut tx).await;
                        return Err(e.with_transaction(tx.id));
                    }
                }
            }
        };
        tx.record_step("reconcile-dns", format!("{method:?}"));
        tx.push_rollback(RollbackAction::DeleteDnsRecord {
            hostname: hostname.to_string(),
        });

        // Step 5: start the supervisor.
        let mut supervisor_handle = match self.supervisor.start_named(&builder, &tunnel_id).await {
            Ok(h) => h,
            Err(e) => {
                self.rollback(&mut tx).await;
                return Err(e.with_transaction(tx.id));
            }
        };
        tx.record_step("supervisor-start", &tunnel_id);
        tx.push_rollback(RollbackAction::StopSupervisor);

        match supervisor_handle.events.recv().await {
            Some(crate::supervisor::SupervisorEvent::Ready { .. }) => {}
            _ => {
                supervisor_handle.stop().await;
                self.rollback(&mut tx).await;
                return Err(startup_failed().with_transaction(tx.id));
            }
        }

        // Step 6: verify propagation.
        let policy = if method == RouteMethod::Cli {
            VerifyPolicy::short()
        } else {
            VerifyPolicy::standard()
        };
        let target = format!("{tunnel_id}.cfargotunnel.com");
        let outcome = PropagationVerifier::verify(hostname, &target, policy).await;
        if let crate::propagation::VerifyOutcome::TimedOut { attempts } = outcome {
            warn!(hostname, attempts, "propagation did not confirm within budget, continuing anyway");
        }

        // Step 7: best-effort end-to-end check, never fails the transaction.
        self.end_to_end_check(hostname).await;

        tx.commit();
        let handle = TunnelHandle::new_named(tunnel_id, name, local_port, hostname.to_string(), config_path);
        Ok((
            StartOutcome {
                url: format!("https://{hostname}"),
                handle: handle.clone(),
                method_used: Some(method),
            },
            ActiveTunnel {
                handle,
                supervisor_handle,
            },
        ))
    }

    async fn create_tunnel(&self, builder: &CommandBuilder, name: &str) -> Result<String, CoreError> {
        let args = builder.create(name);
        let output = Command::new(&self.cloudflared_bin)
            .args(&args)
            .output()
            .await
            .map_err(|e| process_error(&e.to_string()))?;

        if !output.status.success() {
            let text = String::from_utf8_lossy(&output.stderr);
            let classified = classifier::classify(&text, &ClassifyContext::default());
            return Err(CoreError::from_classified(Phase::Create, classified));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_tunnel_id(&stdout).ok_or_else(|| unparseable_create_output(&stdout))
    }

    async fn end_to_end_check(&self, hostname: &str) {
        let client = reqwest::Client::new();
        let url = format!("https://{hostname}/__health__");
        match client
            .head(&url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
        {
            Ok(resp) => info!(hostname, status = %resp.status(), "end-to-end check reached the origin"),
            Err(e) => warn!(hostname, "end-to-end check failed, not failing the transaction: {e}"),
        }
    }

    async fn rollback(&self, tx: &mut Transaction) {
        while let Some(action) = tx.rollback_stack.pop() {
            if let Err(e) = self.undo(action).await {
                warn!("rollback step failed, continuing: {e}");
            }
        }
        tx.fail();
    }

    async fn undo(&self, action: RollbackAction) -> anyhow::Result<()> {
        match action {
            RollbackAction::DeleteConfigFile(path) => {
                let _ = tokio::fs::remove_file(&path).await;
                Ok(())
            }
            RollbackAction::DeleteTunnel { id } => {
                let config_path = self.config_dir.join("rollback.yml");
                let builder = CommandBuilder::new(config_path);
                let args = builder.delete(&id);
                Command::new(&self.cloudflared_bin).args(&args).output().await?;
                Ok(())
            }
            RollbackAction::DeleteDnsRecord { hostname } => {
                let stored = self.config_store.read()?;
                let token = stored.cloudflare.api_token.unwrap_or_default();
                let dns = DnsClient::new(token);
                let zone_id = dns.zone_id(&hostname).await?;
                for record in dns.list_records(&zone_id, Some(&hostname)).await? {
                    dns.delete_record(&zone_id, &record.id).await?;
                }
                Ok(())
            }
            RollbackAction::StopSupervisor => Ok(()),
        }
    }

    pub async fn stop(&self, active: &mut ActiveTunnel, tear_down: bool) -> Result<(), CoreError> {
        active.supervisor_handle.stop().await;
        if tear_down {
            if let Some(hostname) = &active.handle.hostname {
                if let Ok(stored) = self.config_store.read() {
                    let token = stored.cloudflare.api_token.unwrap_or_default();
                    let dns = DnsClient::new(token);
                    if let Ok(zone_id) = dns.zone_id(hostname).await {
                        if let Ok(records) = dns.list_records(&zone_id, Some(hostname)).await {
                            for record in records {
                                let _ = dns.delete_record(&zone_id, &record.id).await;
                            }
                        }
                    }
                }
            }
            let config_path = self.config_dir.join("rollback.yml");
            let builder = CommandBuilder::new(config_path);
            let args = builder.delete(&active.handle.id);
            let _ = Command::new(&self.cloudflared_bin).args(&args).output().await;
        }
        Ok(())
    }

    pub async fn status(&self, active: &ActiveTunnel) -> StatusReport {
        StatusReport {
            state: active.supervisor_handle.state().await,
            url: active.handle.hostname.clone(),
            last_health_check: active.supervisor_handle.last_health_check().await,
            restart_attempts: active.supervisor_handle.restart_attempts(),
        }
    }
}

fn parse_tunnel_id(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .find_map(|line| line.split("with id ").nth(1))
        .map(|tail| tail.trim().to_string())
        .filter(|id| id.len() == 36)
}

fn process_error(detail: &str) -> CoreError {
    CoreError::from_classified(
        Phase::Create,
        ClassifiedError {
            kind: ErrorKind::ProcessStartupFailed,
            severity: Severity::Error,
            recommended_action: RecommendedAction::Retry,
            raw: detail.to_string(),
        },
    )
}

fn unparseable_create_output(stdout: &str) -> CoreError {
    CoreError::from_classified(
        Phase::Create,
        ClassifiedError {
            kind: ErrorKind::Unknown,
            severity: Severity::Error,
            recommended_action: RecommendedAction::Manual,
            raw: stdout.to_string(),
        },
    )
}

fn startup_failed() -> CoreError {
    CoreError::from_classified(
        Phase::Start,
        ClassifiedError {
            kind: ErrorKind::ProcessStartupFailed,
            severity: Severity::Error,
            recommended_action: RecommendedAction::Retry,
            raw: "supervisor did not report readiness".to_string(),
        },
    )
}

fn quick_url_not_scraped() -> CoreError {
    CoreError::from_classified(
        Phase::Start,
        ClassifiedError {
            kind: ErrorKind::ProcessStartupFailed,
            severity: Severity::Error,
            recommended_action: RecommendedAction::Retry,
            raw: "no trycloudflare.com URL observed in process output".to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> LifecycleOrchestrator {
        LifecycleOrchestrator::new(
            "cloudflared",
            PathBuf::from("/tmp/tunnelctl-test"),
            ConfigStore::at(PathBuf::from("/tmp/tunnelctl-test/config.json")),
        )
    }

    #[test]
    fn choose_mode_quick_when_skip_auth() {
        let orch = orchestrator();
        let state = AuthState::from_flags(true, true);
        let opts = StartOptions {
            domain: Some("app.example.com".to_string()),
            skip_auth: true,
            interactive: false,
        };
        assert_eq!(orch.choose_mode(state, &opts), Mode::Quick);
    }

    #[test]
    fn choose_mode_named_when_cert_and_domain() {
        let orch = orchestrator();
        let state = AuthState::from_flags(true, false);
        let opts = StartOptions {
            domain: Some("app.example.com".to_string()),
            skip_auth: false,
            interactive: false,
        };
        assert_eq!(orch.choose_mode(state, &opts), Mode::Named);
    }

    #[test]
    fn choose_mode_quick_when_api_only() {
        let orch = orchestrator();
        let state = AuthState::from_flags(false, true);
        let opts = StartOptions {
            domain: Some("app.example.com".to_string()),
            skip_auth: false,
            interactive: false,
        };
        assert_eq!(orch.choose_mode(state, &opts), Mode::Quick);
    }

    #[test]
    fn choose_mode_quick_when_no_domain_even_with_cert() {
        let orch = orchestrator();
        let state = AuthState::from_flags(true, true);
        let opts = StartOptions {
            domain: None,
            skip_auth: false,
            interactive: false,
        };
        assert_eq!(orch.choose_mode(state, &opts), Mode::Quick);
    }

    #[test]
    fn parse_tunnel_id_extracts_uuid() {
        let stdout = "Created tunnel my-tunnel with id 11111111-1111-1111-1111-111111111111\n";
        assert_eq!(
            parse_tunnel_id(stdout).as_deref(),
            Some("11111111-1111-1111-1111-111111111111")
        );
    }

    #[test]
    fn parse_tunnel_id_rejects_malformed_output() {
        assert_eq!(parse_tunnel_id("no id here"), None);
    }
}
