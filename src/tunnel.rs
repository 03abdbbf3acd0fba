//! Tunnel supervision: spawn, watch and stop the single port-forwarding
//! subprocess that exposes the remote viewer on `localhost`.
//!
//! Each subprocess is owned by one task. That task scans the diagnostic
//! stream for the readiness marker, reports readiness over a oneshot, and
//! reports death back to the supervisor tagged with the generation it was
//! spawned under. Anything tagged with an older generation is ignored, so a
//! process killed during cleanup can never touch state that belongs to its
//! replacement.

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::{CloudVmConfig, Provider, TunnelStatus};

pub const IAP_READY_MARKER: &str = "Listening on port";
pub const SSH_READY_MARKER: &str = "Local forwarding listening on";

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const TERM_GRACE: Duration = Duration::from_secs(3);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

// ── Command construction ──────────────────────────────────────────────────────

/// A fully resolved tunnel invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Substring on stderr that means the local port is being forwarded.
    pub ready_marker: String,
    pub local_port: u16,
}

impl TunnelCommand {
    /// `gcloud compute start-iap-tunnel`
    pub fn iap(config: &CloudVmConfig) -> Result<Self> {
        let id = config
            .server_id()
            .ok_or_else(|| AppError::NotConfigured("no serverId set".into()))?;
        let zone = config.zone.as_deref().unwrap_or_default();
        let project = config.project_id.as_deref().unwrap_or_default();
        let local_port = config.tunnel_port();
        Ok(Self {
            program: "gcloud".into(),
            args: vec![
                "compute".into(),
                "start-iap-tunnel".into(),
                id.to_string(),
                config.remote_port().to_string(),
                format!("--local-host-port=localhost:{}", local_port),
                format!("--zone={}", zone),
                format!("--project={}", project),
            ],
            ready_marker: IAP_READY_MARKER.into(),
            local_port,
        })
    }

    /// `ssh -N -L` local forward; `-v` makes ssh announce the listener.
    pub fn ssh(config: &CloudVmConfig, ip: &str) -> Self {
        let local_port = config.tunnel_port();
        Self {
            program: "ssh".into(),
            args: vec![
                "-v".into(),
                "-N".into(),
                "-o".into(),
                "ExitOnForwardFailure=yes".into(),
                "-o".into(),
                "ServerAliveInterval=30".into(),
                "-o".into(),
                "StrictHostKeyChecking=accept-new".into(),
                "-L".into(),
                format!("localhost:{}:localhost:{}", local_port, config.remote_port()),
                format!("root@{}", ip),
            ],
            ready_marker: SSH_READY_MARKER.into(),
            local_port,
        }
    }
}

/// Turns configuration into a tunnel invocation.
pub trait TunnelLauncher: Send + Sync {
    fn command(&self, config: &CloudVmConfig, ip: Option<&str>) -> Result<TunnelCommand>;
}

/// IAP for Compute Engine, SSH forwarding for Hetzner.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProviderTunnelLauncher;

impl TunnelLauncher for ProviderTunnelLauncher {
    fn command(&self, config: &CloudVmConfig, ip: Option<&str>) -> Result<TunnelCommand> {
        match config.provider {
            Provider::Gcp => TunnelCommand::iap(config),
            Provider::Hetzner => {
                let ip = ip.ok_or_else(|| {
                    AppError::TunnelProcess("instance has no public address yet".into())
                })?;
                Ok(TunnelCommand::ssh(config, ip))
            }
        }
    }
}

// ── Health probe ──────────────────────────────────────────────────────────────

/// One HTTP GET against the local end of the tunnel. Any HTTP response counts,
/// including errors: it proves bytes made it to the remote side and back.
pub async fn probe_http(port: u16) -> bool {
    let client = match reqwest::Client::builder().timeout(PROBE_REQUEST_TIMEOUT).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    client
        .get(format!("http://localhost:{}/", port))
        .send()
        .await
        .is_ok()
}

/// Retry [`probe_http`] until it answers or `timeout` runs out.
pub async fn probe_until(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if probe_http(port).await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(PROBE_INTERVAL.min(deadline - now)).await;
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub ready_timeout: Duration,
    pub probe_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

struct Tracked {
    generation: u64,
    pid: Option<u32>,
    command: TunnelCommand,
    /// Spawned by the automatic reconnect; its death is not retried.
    reconnected: bool,
    kill: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Tracked {
    /// Ask the owner task to terminate the process without waiting.
    fn kill(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Terminate the process and wait for the owner task to finish.
    async fn shutdown(mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        if tokio::time::timeout(SHUTDOWN_WAIT, &mut self.task).await.is_err() {
            warn!(pid = ?self.pid, "Tunnel owner task did not finish in time");
            self.task.abort();
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Bumped on every spawn and every stop; events from older values are stale.
    generation: u64,
    current: Option<Tracked>,
    reconnect: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

struct Shared {
    inner: Mutex<Inner>,
    status: watch::Sender<TunnelStatus>,
    settings: TunnelSettings,
}

/// Supervises at most one tunnel subprocess. Cheap to clone.
#[derive(Clone)]
pub struct TunnelSupervisor {
    shared: Arc<Shared>,
}

impl TunnelSupervisor {
    pub fn new(settings: TunnelSettings) -> Self {
        let (status, _) = watch::channel(TunnelStatus::Off);
        Self {
            shared: Arc::new(Shared { inner: Mutex::new(Inner::default()), status, settings }),
        }
    }

    pub fn status(&self) -> TunnelStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.shared.status.subscribe()
    }

    /// True while a subprocess is tracked (starting or running).
    pub fn has_process(&self) -> bool {
        self.shared.lock().current.is_some()
    }

    /// Failure reported by the last spawn, readiness wait or reconnect.
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Start the tunnel and wait for its readiness marker.
    ///
    /// Succeeds immediately when a tracked tunnel is already running. Also
    /// succeeds when a later `start` or `stop` cuts this attempt short; read
    /// [`status`](Self::status) for the outcome that counts. The HTTP probe
    /// after readiness is informational; its failure is only logged.
    pub async fn start(&self, command: TunnelCommand) -> Result<()> {
        {
            let inner = self.shared.lock();
            if inner.current.is_some() && self.status() == TunnelStatus::Running {
                debug!(local_port = command.local_port, "Tunnel already running");
                return Ok(());
            }
        }
        self.stop().await;
        Shared::launch(&self.shared, command, false).await
    }

    /// Cancel any pending reconnect, terminate the tracked process and go `off`.
    /// Safe to call at any time.
    pub async fn stop(&self) {
        let (reconnect, tracked) = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.last_error = None;
            (inner.reconnect.take(), inner.current.take())
        };
        if let Some(handle) = reconnect {
            debug!("Cancelled pending tunnel reconnect");
            handle.abort();
        }
        if let Some(tracked) = tracked {
            info!(pid = ?tracked.pid, "Stopping tunnel");
            tracked.shutdown().await;
        }
        self.shared.set_status(TunnelStatus::Off);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: TunnelStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(from = %previous, to = %status, "Tunnel status changed");
        }
    }

    async fn launch(self: &Arc<Self>, command: TunnelCommand, reconnected: bool) -> Result<()> {
        // Spawn and registration happen under one lock so a concurrent stop()
        // either sees the new process or invalidates it by generation.
        let (generation, ready_rx) = {
            let mut inner = self.lock();
            inner.generation += 1;
            let generation = inner.generation;

            let mut cmd = Command::new(&command.program);
            cmd.args(&command.args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    let msg = format!("failed to spawn {}: {}", command.program, e);
                    warn!(program = %command.program, error = %e, "Tunnel spawn failed");
                    inner.last_error = Some(msg.clone());
                    self.set_status(TunnelStatus::Error);
                    return Err(AppError::TunnelProcess(msg));
                }
            };

            let pid = child.id();
            let stderr = child.stderr.take();
            let (ready_tx, ready_rx) = oneshot::channel();
            let (kill_tx, kill_rx) = oneshot::channel();
            let task = tokio::spawn(own_process(
                Arc::downgrade(self),
                generation,
                child,
                stderr,
                command.ready_marker.clone(),
                ready_tx,
                kill_rx,
            ));
            info!(pid = ?pid, local_port = command.local_port, reconnected, "Tunnel process spawned");
            inner.current = Some(Tracked {
                generation,
                pid,
                command: command.clone(),
                reconnected,
                kill: Some(kill_tx),
                task,
            });
            inner.last_error = None;
            self.set_status(TunnelStatus::Starting);
            (generation, ready_rx)
        };

        match tokio::time::timeout(self.settings.ready_timeout, ready_rx).await {
            Ok(Ok(())) => {
                {
                    let inner = self.lock();
                    let still_tracked = inner.current.as_ref().is_some_and(|t| t.generation == generation);
                    if !still_tracked {
                        drop(inner);
                        return self.fail(generation, AppError::TunnelProcess(
                            "tunnel process exited right after becoming ready".into(),
                        ));
                    }
                    self.set_status(TunnelStatus::Running);
                }
                info!(local_port = command.local_port, "Tunnel ready");
                if probe_until(command.local_port, self.settings.probe_timeout).await {
                    info!(local_port = command.local_port, "Tunnel answers HTTP");
                } else {
                    warn!(
                        local_port = command.local_port,
                        "Tunnel is up but the remote viewer did not answer yet"
                    );
                }
                Ok(())
            }
            Ok(Err(_)) => self.fail(
                generation,
                AppError::TunnelProcess("tunnel process exited before it was ready".into()),
            ),
            Err(_) => self.fail(
                generation,
                AppError::Timeout(format!(
                    "tunnel not ready after {:?}",
                    self.settings.ready_timeout
                )),
            ),
        }
    }

    /// Mark a failed start. An attempt superseded by a newer start or a stop
    /// is not a failure: the newer request owns the status and reports its
    /// own outcome.
    fn fail(&self, generation: u64, err: AppError) -> Result<()> {
        let tracked = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(generation, error = %err, "Tunnel start superseded");
                return Ok(());
            }
            inner.last_error = Some(err.to_string());
            self.set_status(TunnelStatus::Error);
            inner.current.take()
        };
        warn!(error = %err, "Tunnel start failed");
        if let Some(tracked) = tracked {
            tracked.kill();
        }
        Err(err)
    }

    /// Exit report from an owner task.
    fn on_process_exit(self: &Arc<Self>, generation: u64, detail: String) {
        let mut inner = self.lock();
        let is_current = inner.generation == generation
            && inner.current.as_ref().is_some_and(|t| t.generation == generation);
        if !is_current {
            debug!(generation, %detail, "Ignoring exit of superseded tunnel process");
            return;
        }
        let Some(tracked) = inner.current.take() else { return };

        if *self.status.borrow() != TunnelStatus::Running {
            // still starting: the waiting start() call reports it
            debug!(generation, %detail, "Tunnel process exited during startup");
            return;
        }

        if tracked.reconnected {
            let msg = format!("tunnel process exited again after reconnect ({})", detail);
            warn!(generation, %detail, "Reconnected tunnel died, giving up");
            inner.last_error = Some(msg);
            self.set_status(TunnelStatus::Error);
            return;
        }

        warn!(
            generation,
            %detail,
            delay = ?self.settings.reconnect_delay,
            "Tunnel process exited unexpectedly, scheduling reconnect"
        );
        self.set_status(TunnelStatus::Off);
        inner.reconnect = Some(tokio::spawn(reconnect_after(
            Arc::downgrade(self),
            self.settings.reconnect_delay,
            tracked.command,
        )));
    }
}

async fn reconnect_after(shared: Weak<Shared>, delay: Duration, command: TunnelCommand) {
    tokio::time::sleep(delay).await;
    let Some(shared) = shared.upgrade() else { return };
    shared.lock().reconnect = None;
    info!(local_port = command.local_port, "Reconnecting tunnel");
    if let Err(e) = Shared::launch(&shared, command, true).await {
        warn!(error = %e, "Tunnel reconnect failed, not retrying");
    }
}

// ── Owner task ────────────────────────────────────────────────────────────────

async fn own_process(
    shared: Weak<Shared>,
    generation: u64,
    mut child: Child,
    stderr: Option<ChildStderr>,
    marker: String,
    ready_tx: oneshot::Sender<()>,
    mut kill_rx: oneshot::Receiver<()>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = stderr.map(|s| BufReader::new(s).lines());

    let exit = loop {
        tokio::select! {
            // a dropped sender means the supervisor is gone: kill as well
            _ = &mut kill_rx => {
                terminate(&mut child).await;
                debug!(generation, "Tunnel process terminated on request");
                return;
            }
            line = next_line(&mut lines) => match line {
                Some(line) => {
                    debug!(generation, line = %line, "tunnel");
                    if line.contains(&marker) {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                }
                None => lines = None,
            },
            status = child.wait() => break status,
        }
    };

    drop(ready_tx);
    let detail = match exit {
        Ok(status) => status.to_string(),
        Err(e) => e.to_string(),
    };
    if let Some(shared) = shared.upgrade() {
        shared.on_process_exit(generation, detail);
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStderr>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// SIGTERM first so the forwarder can close its session, SIGKILL after a grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}
