//! C8: owns the external `cloudflared` child process for the lifetime of
//! one tunnel. Scans its combined stdout/stderr for a first-wins readiness
//! signal, then watches for exit and restarts within a bounded budget.

use crate::classifier::{self, ClassifyContext};
use crate::command_builder::CommandBuilder;
use crate::error::{CoreError, ErrorKind, Phase};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

const READY_DEADLINE_NAMED: Duration = Duration::from_secs(45);
const READY_DEADLINE_QUICK: Duration = Duration::from_secs(30);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    RestartPending,
    Error,
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Starting,
    Ready { quick_url: Option<String> },
    Exited { code: Option<i32> },
    RestartScheduled { attempt: u32, delay: Duration },
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub restart_delay: Duration,
    pub max_restart_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(5),
            max_restart_attempts: 3,
        }
    }
}

enum ReadyOutcome {
    Ready { quick_url: Option<String> },
    Rejected(CoreError),
}

/// What the caller gets back from a `start_*` call: a live event feed and
/// a handle to ask for a clean shutdown.
pub struct SupervisorHandle {
    pub events: mpsc::Receiver<SupervisorEvent>,
    state: Arc<Mutex<SupervisorState>>,
    pid: Arc<std::sync::atomic::AtomicU32>,
    restart_attempts: Arc<AtomicU32>,
    last_health_check: Arc<Mutex<Option<DateTime<Utc>>>>,
    stop: Option<oneshot::Sender<()>>,
}

impl SupervisorHandle {
    pub async fn state(&self) -> SupervisorState {
        *self.state.lock().await
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts.load(Ordering::Relaxed)
    }

    pub async fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.lock().await
    }

    /// Idempotent: a second call on an already-stopped handle is a no-op.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        let pid = self.pid.load(Ordering::Relaxed);
        if pid != 0 {
            terminate_pid(pid).await;
        }
        *self.state.lock().await = SupervisorState::Stopped;
    }
}

pub struct TunnelSupervisor {
    cloudflared_bin: String,
    policy: RestartPolicy,
}

impl TunnelSupervisor {
    pub fn new(cloudflared_bin: impl Into<String>, policy: RestartPolicy) -> Self {
        Self {
            cloudflared_bin: cloudflared_bin.into(),
            policy,
        }
    }

    pub async fn start_named(&self, builder: &CommandBuilder, tunnel_id: &str) -> Result<SupervisorHandle, CoreError> {
        let args = builder.run(Some(tunnel_id));
        self.start(args, None, READY_DEADLINE_NAMED).await
    }

    /// Displaces any existing config file so the external binary's quick
    /// mode doesn't refuse to start, restoring it once the supervisor stops.
    pub async fn start_quick(&self, builder: &CommandBuilder, local_port: u16) -> Result<SupervisorHandle, CoreError> {
        let config_path = builder.config_path().to_path_buf();
        let displaced = displace_config(&config_path).await;
        let args = builder.run_quick(local_port);
        self.start(args, displaced, READY_DEADLINE_QUICK).await
    }

    async fn start(
        &self,
        args: Vec<String>,
        displaced_config: Option<(PathBuf, PathBuf)>,
        ready_deadline: Duration,
    ) -> Result<SupervisorHandle, CoreError> {
        let (event_tx, event_rx) = mpsc::channel(32);
        let state = Arc::new(Mutex::new(SupervisorState::Starting));
        let pid = Arc::new(AtomicU32::new(0));
        let restart_attempts = Arc::new(AtomicU32::new(0));
        let last_health_check: Arc<Mutex<Option<DateTime<Utc>>>> = Arc::new(Mutex::new(None));
        let (stop_tx, stop_rx) = oneshot::channel();

        let mut child = spawn(&self.cloudflared_bin, &args)?;
        pid.store(child.id().unwrap_or(0), Ordering::Relaxed);
        let _ = event_tx.send(SupervisorEvent::Starting).await;

        let outcome = wait_for_ready(&mut child, ready_deadline).await;
        match outcome {
            ReadyOutcome::Rejected(e) => {
                let _ = child.start_kill();
                restore_config(displaced_config).await;
                *state.lock().await = SupervisorState::Error;
                return Err(e);
            }
            ReadyOutcome::Ready { quick_url } => {
                *state.lock().await = SupervisorState::Running;
                let _ = event_tx
                    .send(SupervisorEvent::Ready {
                        quick_url: quick_url.clone(),
                    })
                    .await;
            }
        }

        let cloudflared_bin = self.cloudflared_bin.clone();
        let policy = self.policy;
        let state_task = state.clone();
        let pid_task = pid.clone();
        let restart_attempts_task = restart_attempts.clone();
        let last_health_check_task = last_health_check.clone();
        let args_for_restart = args.clone();

        tokio::spawn(async move {
            supervise_loop(
                child,
                cloudflared_bin,
                args_for_restart,
                policy,
                ready_deadline,
                state_task,
                pid_task,
                restart_attempts_task,
                last_health_check_task,
                event_tx,
                stop_rx,
                displaced_config,
            )
            .await;
        });

        Ok(SupervisorHandle {
            events: event_rx,
            state,
            pid,
            restart_attempts,
            last_health_check,
            stop: Some(stop_tx),
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise_loop(
    mut child: Child,
    cloudflared_bin: String,
    args: Vec<String>,
    policy: RestartPolicy,
    ready_deadline: Duration,
    state: Arc<Mutex<SupervisorState>>,
    pid: Arc<AtomicU32>,
    restart_attempts: Arc<AtomicU32>,
    last_health_check: Arc<Mutex<Option<DateTime<Utc>>>>,
    events: mpsc::Sender<SupervisorEvent>,
    mut stop_rx: oneshot::Receiver<()>,
    mut displaced_config: Option<(PathBuf, PathBuf)>,
) {
    let mut attempt = 0u32;
    let mut health_tick = tokio::time::interval(HEALTH_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                let _ = child.start_kill();
                break;
            }
            _ = health_tick.tick() => {
                let current_pid = pid.load(Ordering::Relaxed);
                let alive = current_pid != 0 && process_alive(current_pid).await;
                *last_health_check.lock().await = Some(Utc::now());

                if alive {
                    debug!(pid = current_pid, "health check tick: process alive");
                    continue;
                }

                warn!(pid = current_pid, "health check found the process gone, treating as a crash");
                let _ = events.send(SupervisorEvent::Exited { code: None }).await;
                if !restart(
                    &mut child,
                    &cloudflared_bin,
                    &args,
                    policy,
                    ready_deadline,
                    &mut attempt,
                    &restart_attempts,
                    &state,
                    &pid,
                    &events,
                )
                .await
                {
                    break;
                }
            }
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                let _ = events.send(SupervisorEvent::Exited { code }).await;

                if !restart(
                    &mut child,
                    &cloudflared_bin,
                    &args,
                    policy,
                    ready_deadline,
                    &mut attempt,
                    &restart_attempts,
                    &state,
                    &pid,
                    &events,
                )
                .await
                {
                    break;
                }
            }
        }
    }

    restore_config(displaced_config.take()).await;
}

/// Respawns the child and re-enters the same readiness path used on initial
/// start, retrying within the restart budget if the new process never
/// becomes ready. Returns `false` once the loop above should stop.
#[allow(clippy::too_many_arguments)]
async fn restart(
    child: &mut Child,
    cloudflared_bin: &str,
    args: &[String],
    policy: RestartPolicy,
    ready_deadline: Duration,
    attempt: &mut u32,
    restart_attempts: &Arc<AtomicU32>,
    state: &Arc<Mutex<SupervisorState>>,
    pid: &Arc<AtomicU32>,
    events: &mpsc::Sender<SupervisorEvent>,
) -> bool {
    loop {
        if *attempt >= policy.max_restart_attempts {
            warn!(attempt, "restart budget exhausted, giving up");
            *state.lock().await = SupervisorState::Error;
            let _ = events
                .send(SupervisorEvent::Error("restart budget exhausted".to_string()))
                .await;
            return false;
        }

        *attempt += 1;
        restart_attempts.store(*attempt, Ordering::Relaxed);
        let delay = policy.restart_delay * *attempt;
        *state.lock().await = SupervisorState::RestartPending;
        let _ = events
            .send(SupervisorEvent::RestartScheduled { attempt: *attempt, delay })
            .await;
        tokio::time::sleep(delay).await;

        let mut new_child = match spawn(cloudflared_bin, args) {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to respawn: {e}");
                *state.lock().await = SupervisorState::Error;
                let _ = events.send(SupervisorEvent::Error(e.to_string())).await;
                return false;
            }
        };
        pid.store(new_child.id().unwrap_or(0), Ordering::Relaxed);

        match wait_for_ready(&mut new_child, ready_deadline).await {
            ReadyOutcome::Ready { quick_url } => {
                *child = new_child;
                *state.lock().await = SupervisorState::Running;
                let _ = events.send(SupervisorEvent::Ready { quick_url }).await;
                return true;
            }
            ReadyOutcome::Rejected(e) => {
                warn!("restarted process failed to become ready, retrying if budget remains: {e}");
                let _ = new_child.start_kill();
                let _ = events.send(SupervisorEvent::Exited { code: None }).await;
                continue;
            }
        }
    }
}

fn spawn(cloudflared_bin: &str, args: &[String]) -> Result<Child, CoreError> {
    Command::new(cloudflared_bin)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            CoreError::from_classified(
                Phase::Start,
                crate::error::ClassifiedError {
                    kind: ErrorKind::ProcessStartupFailed,
                    severity: crate::error::Severity::Error,
                    recommended_action: crate::error::RecommendedAction::Retry,
                    raw: e.to_string(),
                },
            )
        })
}

/// Reads stdout and stderr concurrently; whichever line first looks like a
/// readiness signal or a classifiable rejection wins, the other reader is
/// dropped when the oneshot fires.
async fn wait_for_ready(child: &mut Child, deadline: Duration) -> ReadyOutcome {
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let tx_out = tx.clone();
    tokio::spawn(scan_lines(stdout, tx_out));
    let tx_err = tx.clone();
    tokio::spawn(scan_lines(stderr, tx_err));

    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => ReadyOutcome::Rejected(startup_timeout("readiness channel closed unexpectedly")),
        Err(_) => ReadyOutcome::Rejected(startup_timeout("no readiness signal within deadline")),
    }
}

async fn scan_lines<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    tx: Arc<Mutex<Option<oneshot::Sender<ReadyOutcome>>>>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if looks_ready(&line) {
            if let Some(sender) = tx.lock().await.take() {
                let quick_url = extract_quick_url(&line);
                let _ = sender.send(ReadyOutcome::Ready { quick_url });
            }
            return;
        }
        if looks_fatal(&line) {
            let classified = classifier::classify(&line, &ClassifyContext::default());
            if classified.kind != ErrorKind::Unknown {
                if let Some(sender) = tx.lock().await.take() {
                    let _ = sender.send(ReadyOutcome::Rejected(CoreError::from_classified(Phase::Start, classified)));
                }
                return;
            }
        }
    }
}

/// Substrings checked case-insensitively; `"connection.*registered"` is
/// checked separately as a regex since it needs to match across wording the
/// external binary has used across versions ("connection registered",
/// "connection is now registered", ...).
const READY_PATTERNS: &[&str] = &[
    "registered tunnel connection",
    "starting tunnel",
    ".trycloudflare.com",
];

static CONNECTION_REGISTERED: OnceLock<Regex> = OnceLock::new();

fn connection_registered_regex() -> &'static Regex {
    CONNECTION_REGISTERED.get_or_init(|| Regex::new(r"connection.*registered").expect("valid regex"))
}

fn looks_ready(line: &str) -> bool {
    let lower = line.to_lowercase();
    READY_PATTERNS.iter().any(|pattern| lower.contains(pattern)) || connection_registered_regex().is_match(&lower)
}

fn looks_fatal(line: &str) -> bool {
    let lower = line.to_lowercase();
    lower.contains("error") || lower.contains("failed") || lower.contains("fatal")
}

fn extract_quick_url(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|tok| tok.contains(".trycloudflare.com"))
        .map(|tok| tok.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != ':' && c != '/').to_string())
}

fn startup_timeout(detail: &str) -> CoreError {
    CoreError::from_classified(
        Phase::Start,
        crate::error::ClassifiedError {
            kind: ErrorKind::ProcessStartupFailed,
            severity: crate::error::Severity::Error,
            recommended_action: crate::error::RecommendedAction::Retry,
            raw: detail.to_string(),
        },
    )
}

/// Renames an existing ingress config out of the way; the external binary's
/// quick mode refuses to start while one is present.
async fn displace_config(path: &PathBuf) -> Option<(PathBuf, PathBuf)> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return None;
    }
    let backup = path.with_extension("yml.bak");
    match tokio::fs::rename(path, &backup).await {
        Ok(()) => Some((backup, path.clone())),
        Err(e) => {
            warn!("failed to displace existing config: {e}");
            None
        }
    }
}

async fn restore_config(displaced: Option<(PathBuf, PathBuf)>) {
    if let Some((backup, original)) = displaced {
        if let Err(e) = tokio::fs::rename(&backup, &original).await {
            warn!("failed to restore displaced config: {e}");
        }
    }
}

/// SIGTERM, wait, SIGKILL if still alive. Shelled out like the rest of the
/// external-process integration in this codebase rather than pulling in a
/// signals crate for one call site.
async fn terminate_pid(pid: u32) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill").args(["-TERM", &pid.to_string()]).output().await;
        tokio::time::sleep(GRACEFUL_STOP_TIMEOUT).await;
        if process_alive(pid).await {
            let _ = Command::new("kill").args(["-KILL", &pid.to_string()]).output().await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = Command::new("taskkill").args(["/PID", &pid.to_string(), "/F"]).output().await;
    }
}

#[cfg(unix)]
async fn process_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// No cheap signal-0 equivalent is wired up for non-Unix targets yet; assume
/// alive rather than flapping the supervisor into spurious restarts.
#[cfg(not(unix))]
async fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_ready_recognizes_named_and_quick_signals() {
        assert!(looks_ready("2024-01-01T00:00:00Z INF Registered tunnel connection connIndex=0"));
        assert!(looks_ready("https://random-words-here.trycloudflare.com"));
        assert!(looks_ready("INF Starting tunnel tunnelID=abc"));
        assert!(looks_ready("INF connection is now registered with the edge"));
        assert!(!looks_ready("INF waiting for origin"));
    }

    #[test]
    fn extract_quick_url_strips_surrounding_punctuation() {
        let line = "INF |  https://giant-words.trycloudflare.com  |";
        assert_eq!(
            extract_quick_url(line).as_deref(),
            Some("https://giant-words.trycloudflare.com")
        );
    }

    #[test]
    fn looks_fatal_matches_error_keywords() {
        assert!(looks_fatal("ERR failed to connect to the edge"));
        assert!(!looks_fatal("INF connection established"));
    }

    #[test]
    fn restart_policy_defaults_match_spec() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.restart_delay, Duration::from_secs(5));
        assert_eq!(policy.max_restart_attempts, 3);
    }
}
