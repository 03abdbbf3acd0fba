//! Lifecycle controller: power the instance on and off, keep the cached
//! [`CloudVmState`] current, and drive the tunnel supervisor.
//!
//! ```text
//! start_vm()
//!   ├─► publish status=starting                 (optimistic)
//!   ├─► CredentialRefresher → ComputeApi::power(Start)
//!   ├─► every 3 s: ComputeApi::get_status       (publish each observation)
//!   │       until running, or 60 s → Timeout    (publish unknown + error)
//!   └─► TunnelSupervisor::start                 (failure → tunnelStatus=error)
//! ```
//!
//! The cached state lives in a `watch` channel. Every update builds a new
//! record and swaps it in whole, and every swap is a `state-changed` event.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::compute::{ComputeApi, PowerAction, RemoteInstance};
use crate::config::ConfigStore;
use crate::credential::{CredentialRefresher, TokenSource};
use crate::error::{AppError, Result};
use crate::models::{build_remote_view_url, CloudVmConfig, CloudVmState, TunnelStatus, VmStatus};
use crate::poller::{Poller, DEFAULT_BACKOFF_CAP};
use crate::tunnel::{self, TunnelLauncher, TunnelSettings, TunnelSupervisor};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Hard limit for the instance to reach the target power state.
    pub convergence_timeout: Duration,
    /// Pause between status checks while converging.
    pub convergence_interval: Duration,
    pub poll_backoff_cap: Duration,
    pub tunnel: TunnelSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            convergence_timeout: Duration::from_secs(60),
            convergence_interval: Duration::from_secs(3),
            poll_backoff_cap: DEFAULT_BACKOFF_CAP,
            tunnel: TunnelSettings::default(),
        }
    }
}

/// Power operation currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Idle,
    Starting,
    Stopping,
}

/// Collaborators the controller is built from.
pub struct Collaborators {
    pub config: Arc<dyn ConfigStore>,
    pub compute: Arc<dyn ComputeApi>,
    pub tokens: Arc<dyn TokenSource>,
    pub launcher: Arc<dyn TunnelLauncher>,
}

struct Shared {
    config: Arc<dyn ConfigStore>,
    compute: Arc<dyn ComputeApi>,
    credentials: CredentialRefresher,
    launcher: Arc<dyn TunnelLauncher>,
    tunnel: TunnelSupervisor,
    state: watch::Sender<CloudVmState>,
    operation: Mutex<Operation>,
    poller: Mutex<Option<Poller>>,
    settings: ControllerSettings,
}

/// Resets the operation slot when a start/stop sequence ends, however it ends.
struct OperationGuard<'a> {
    slot: &'a Mutex<Operation>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Operation::Idle;
    }
}

/// Owns the cached state, the tunnel, and the poll loop for one instance.
///
/// Must be created inside a Tokio runtime: construction spawns the tasks that
/// follow tunnel status and `config-updated` notifications. Those tasks end
/// when the controller is dropped.
pub struct VmController {
    shared: Arc<Shared>,
}

impl VmController {
    pub fn new(parts: Collaborators, settings: ControllerSettings) -> Self {
        let (state, _) = watch::channel(CloudVmState::default());
        let shared = Arc::new(Shared {
            credentials: CredentialRefresher::new(parts.tokens, parts.config.clone()),
            config: parts.config,
            compute: parts.compute,
            launcher: parts.launcher,
            tunnel: TunnelSupervisor::new(settings.tunnel.clone()),
            state,
            operation: Mutex::new(Operation::Idle),
            poller: Mutex::new(None),
            settings,
        });
        spawn_tunnel_follower(&shared);
        spawn_config_follower(&shared);
        Self { shared }
    }

    /// Receiver for `state-changed` events. Intermediate states may be skipped
    /// by a slow reader; the latest one is always observable.
    pub fn subscribe(&self) -> watch::Receiver<CloudVmState> {
        self.shared.state.subscribe()
    }

    /// The cached state without any remote call.
    pub fn snapshot(&self) -> CloudVmState {
        self.shared.snapshot()
    }

    pub fn operation(&self) -> Operation {
        *self.shared.operation.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refresh from the provider and return the new state. Never fails:
    /// errors end up in `state.error` with `status = unknown`.
    pub async fn get_state(&self) -> CloudVmState {
        match self.shared.refresh().await {
            Ok(state) => state,
            Err(_) => self.shared.snapshot(),
        }
    }

    /// Power the instance on, wait for it to run, then open the tunnel.
    ///
    /// Returns the cached state untouched if another start/stop is in flight.
    /// A tunnel failure after a successful boot is reported through
    /// `tunnel_status = error` and does not fail the call.
    pub async fn start_vm(&self) -> Result<CloudVmState> {
        let shared = &self.shared;
        let Some(_guard) = shared.begin(Operation::Starting) else {
            return Ok(shared.snapshot());
        };
        let config = shared.require_config()?;

        shared.publish(|s| {
            s.status = VmStatus::Starting;
            s.error = None;
            s.remote_view_url = None;
        });

        let remote = match shared.power_and_wait(&config, PowerAction::Start, VmStatus::Running).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(error = %e, "Start failed");
                shared.publish_failure(&e);
                return Err(e);
            }
        };
        info!(ip = ?remote.ip, "Instance running, opening tunnel");

        match shared.start_tunnel(&config, remote.ip.as_deref()).await {
            Ok(()) => shared.publish_tunnel(true),
            Err(e) => {
                warn!(error = %e, "Instance is running but the tunnel failed");
                shared.publish(|s| {
                    s.tunnel_status = TunnelStatus::Error;
                    s.error = Some(format!("VM is running, but the tunnel failed to start: {}", e));
                });
            }
        }
        Ok(shared.snapshot())
    }

    /// Close the tunnel, power the instance off and wait for it to stop.
    pub async fn stop_vm(&self) -> Result<CloudVmState> {
        let shared = &self.shared;
        let Some(_guard) = shared.begin(Operation::Stopping) else {
            return Ok(shared.snapshot());
        };

        // no viewer may keep pointing at a machine that is powering off,
        // whatever state the configuration is in
        shared.tunnel.stop().await;
        shared.publish(|s| {
            s.tunnel_status = TunnelStatus::Off;
            s.remote_view_url = None;
        });
        let config = shared.require_config()?;

        shared.publish(|s| {
            s.status = VmStatus::Stopping;
            s.error = None;
        });

        match shared.power_and_wait(&config, PowerAction::Stop, VmStatus::Off).await {
            Ok(_) => Ok(shared.snapshot()),
            Err(e) => {
                warn!(error = %e, "Stop failed");
                shared.publish_failure(&e);
                Err(e)
            }
        }
    }

    /// Open (or reopen) the tunnel without touching the instance.
    pub async fn start_tunnel(&self) -> Result<CloudVmState> {
        let shared = &self.shared;
        let config = shared.require_config()?;
        let ip = shared.snapshot().ip;
        match shared.start_tunnel(&config, ip.as_deref()).await {
            Ok(()) => {
                shared.publish_tunnel(true);
                Ok(shared.snapshot())
            }
            Err(e) => {
                shared.publish(|s| {
                    s.tunnel_status = TunnelStatus::Error;
                    s.error = Some(format!("Tunnel failed to start: {}", e));
                });
                Err(e)
            }
        }
    }

    pub async fn stop_tunnel(&self) -> CloudVmState {
        self.shared.tunnel.stop().await;
        self.shared.publish(|s| s.tunnel_status = TunnelStatus::Off);
        self.shared.snapshot()
    }

    /// Start (or restart) the background refresh loop.
    pub fn start_polling(&self, interval: Duration) {
        self.stop_polling();
        let weak = Arc::downgrade(&self.shared);
        let poller = Poller::spawn(interval, self.shared.settings.poll_backoff_cap, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(shared) => shared.refresh().await.is_ok(),
                    None => true,
                }
            }
        });
        info!(interval = ?interval, "Polling started");
        *self.shared.poller.lock().unwrap_or_else(|e| e.into_inner()) = Some(poller);
    }

    pub fn stop_polling(&self) {
        if let Some(poller) = self.shared.poller.lock().unwrap_or_else(|e| e.into_inner()).take() {
            poller.stop();
            info!("Polling stopped");
        }
    }

    /// Stop polling and close the tunnel. Call once at application exit.
    pub async fn shutdown(&self) {
        self.stop_polling();
        self.shared.tunnel.stop().await;
        self.shared.publish(|s| s.tunnel_status = TunnelStatus::Off);
    }

    /// Run the credential refresher once. Returns whether the stored token changed.
    pub async fn refresh_credential(&self) -> Result<bool> {
        let config = self.shared.require_config()?;
        let token = self.shared.credentials.refresh(&config).await?;
        Ok(token != config.api_token)
    }
}

impl Shared {
    fn snapshot(&self) -> CloudVmState {
        self.state.borrow().clone()
    }

    /// Derive the next state from the current one under the channel lock, so
    /// the tunnel follower and an operation cannot overwrite each other.
    fn publish(&self, update: impl FnOnce(&mut CloudVmState)) {
        self.state.send_modify(|state| {
            update(state);
            debug!(status = %state.status, tunnel = %state.tunnel_status, error = ?state.error, "state-changed");
        });
    }

    fn replace(&self, next: CloudVmState) {
        debug!(status = %next.status, tunnel = %next.tunnel_status, error = ?next.error, "state-changed");
        self.state.send_replace(next);
    }

    /// Roll an optimistic update back to `unknown` with the failure attached.
    fn publish_failure(&self, err: &AppError) {
        self.publish(|s| {
            s.status = VmStatus::Unknown;
            s.remote_view_url = None;
            s.error = Some(err.to_string());
            s.last_checked = Some(Utc::now());
        });
    }

    /// Cause of a latched tunnel failure, worded so it is not mistaken for an
    /// instance failure. `None` unless `status` is `error`.
    fn tunnel_failure(&self, status: TunnelStatus) -> Option<String> {
        (status == TunnelStatus::Error).then(|| {
            let detail = self
                .tunnel
                .last_error()
                .unwrap_or_else(|| "tunnel process exited".into());
            format!("Tunnel failed, the VM itself is unaffected: {}", detail)
        })
    }

    /// Copy the supervisor's status into the snapshot. A failure always
    /// carries its cause; `clear_error` drops a stale message otherwise.
    fn publish_tunnel(&self, clear_error: bool) {
        let status = self.tunnel.status();
        let failure = self.tunnel_failure(status);
        self.publish(|s| {
            s.tunnel_status = status;
            if failure.is_some() || clear_error {
                s.error = failure;
            }
        });
    }

    fn begin(&self, op: Operation) -> Option<OperationGuard<'_>> {
        let mut slot = self.operation.lock().unwrap_or_else(|e| e.into_inner());
        if *slot != Operation::Idle {
            info!(requested = ?op, in_flight = ?*slot, "Ignoring request, operation already in progress");
            return None;
        }
        *slot = op;
        Some(OperationGuard { slot: &self.operation })
    }

    fn require_config(&self) -> Result<CloudVmConfig> {
        let config = self
            .config
            .load()?
            .ok_or_else(|| AppError::NotConfigured("no cloud VM configured".into()))?;
        if let Some(field) = config.missing_field() {
            return Err(AppError::NotConfigured(format!("{} is not set", field)));
        }
        Ok(config)
    }

    async fn fetch(&self, config: &CloudVmConfig) -> Result<RemoteInstance> {
        let token = self.credentials.refresh(config).await?;
        self.compute.get_status(config, &token).await
    }

    /// Fetch remote status and rebuild the cached state from it.
    async fn refresh(&self) -> Result<CloudVmState> {
        let config = match self.config.load() {
            Ok(Some(config)) if config.is_valid() => config,
            Ok(_) => {
                let mut state = self.snapshot();
                state.status = VmStatus::NotProvisioned;
                state.remote_view_url = None;
                return Ok(state);
            }
            Err(e) => {
                let mut state = self.snapshot();
                state.status = VmStatus::NotProvisioned;
                state.remote_view_url = None;
                state.error = Some(e.to_string());
                return Ok(state);
            }
        };

        match self.fetch(&config).await {
            Ok(remote) => {
                let tunnel_status = self.observe_tunnel(&config, remote.status).await;
                let mut state = observed_state(&config, &remote, tunnel_status);
                state.error = self.tunnel_failure(tunnel_status);
                self.replace(state.clone());
                Ok(state)
            }
            Err(e) => {
                debug!(error = %e, "Status refresh failed");
                let previous = self.snapshot();
                self.replace(CloudVmState {
                    status: VmStatus::Unknown,
                    ip: previous.ip,
                    remote_view_url: None,
                    provider: Some(config.provider),
                    server_id: config.server_id().map(str::to_string),
                    last_checked: Some(Utc::now()),
                    error: Some(e.to_string()),
                    tunnel_status: self.tunnel.status(),
                });
                Err(e)
            }
        }
    }

    /// Supervisor state wins while it owns a process or has latched an error;
    /// otherwise an externally started tunnel is detected with one probe.
    async fn observe_tunnel(&self, config: &CloudVmConfig, status: VmStatus) -> TunnelStatus {
        let supervised = self.tunnel.status();
        if self.tunnel.has_process() || supervised == TunnelStatus::Error {
            return supervised;
        }
        if status != VmStatus::Running {
            return TunnelStatus::Off;
        }
        if tunnel::probe_http(config.tunnel_port()).await {
            TunnelStatus::Running
        } else {
            TunnelStatus::Off
        }
    }

    async fn start_tunnel(&self, config: &CloudVmConfig, ip: Option<&str>) -> Result<()> {
        let command = self.launcher.command(config, ip)?;
        self.tunnel.start(command).await
    }

    /// Issue `action`, then poll until the instance reports `target`.
    async fn power_and_wait(
        &self,
        config: &CloudVmConfig,
        action: PowerAction,
        target: VmStatus,
    ) -> Result<RemoteInstance> {
        let token = self.credentials.refresh(config).await?;
        self.compute.power(config, &token, action).await?;
        info!(action = action.as_str(), target = %target, "Power action accepted, waiting");

        let deadline = Instant::now() + self.settings.convergence_timeout;
        loop {
            tokio::time::sleep(self.settings.convergence_interval).await;

            let remote = self.fetch(config).await?;
            debug!(status = %remote.status, target = %target, "Convergence poll");
            let reached = remote.status == target;
            self.publish(|s| {
                s.status = remote.status;
                s.ip = remote.ip.clone();
                s.provider = Some(config.provider);
                s.server_id = config.server_id().map(str::to_string);
                s.last_checked = Some(Utc::now());
                s.remote_view_url = if reached && target == VmStatus::Running {
                    Some(build_remote_view_url(config.tunnel_port(), config.vnc_password.as_deref()))
                } else {
                    None
                };
            });
            if reached {
                return Ok(remote);
            }
            if Instant::now() >= deadline {
                return Err(AppError::Timeout(format!(
                    "instance did not reach {} within {:?} (last seen: {})",
                    target, self.settings.convergence_timeout, remote.status
                )));
            }
        }
    }
}

fn observed_state(config: &CloudVmConfig, remote: &RemoteInstance, tunnel_status: TunnelStatus) -> CloudVmState {
    let remote_view_url = (remote.status == VmStatus::Running)
        .then(|| build_remote_view_url(config.tunnel_port(), config.vnc_password.as_deref()));
    CloudVmState {
        status: remote.status,
        ip: remote.ip.clone(),
        remote_view_url,
        provider: Some(config.provider),
        server_id: config.server_id().map(str::to_string),
        last_checked: Some(Utc::now()),
        error: None,
        tunnel_status,
    }
}

/// Mirror supervisor status changes (crash, reconnect) into the cached state.
fn spawn_tunnel_follower(shared: &Arc<Shared>) {
    let mut rx = shared.tunnel.subscribe();
    let weak: Weak<Shared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = *rx.borrow_and_update();
            let Some(shared) = weak.upgrade() else { break };
            let current = shared.snapshot();
            let unexplained = status == TunnelStatus::Error && current.error.is_none();
            if current.tunnel_status != status || unexplained {
                shared.publish_tunnel(false);
            }
        }
    });
}

/// `config-updated` → refresh, unless the update is our own token write-back.
fn spawn_config_follower(shared: &Arc<Shared>) {
    let mut rx = shared.config.subscribe();
    let weak: Weak<Shared> = Arc::downgrade(shared);
    tokio::spawn(async move {
        loop {
            let update = match rx.recv().await {
                Ok(update) => update,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(shared) = weak.upgrade() else { break };
            if shared.credentials.is_refreshing() || shared.credentials.is_own_write(update.revision) {
                debug!(revision = update.revision, "Skipping refresh for credential write-back");
                continue;
            }
            info!(revision = update.revision, "Config updated, refreshing state");
            if let Err(e) = shared.refresh().await {
                debug!(error = %e, "Refresh after config update failed");
            }
        }
    });
}
