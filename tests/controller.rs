//! End-to-end behaviour of `VmController` against scripted collaborators.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use cloudvm::compute::{ComputeApi, PowerAction, RemoteInstance};
use cloudvm::config::{ConfigStore, MemoryConfigStore};
use cloudvm::controller::{Collaborators, ControllerSettings, Operation, VmController};
use cloudvm::credential::StaticTokenSource;
use cloudvm::models::{CloudVmConfig, Provider, TunnelStatus, VmStatus};
use cloudvm::tunnel::{TunnelCommand, TunnelLauncher, TunnelSettings};
use cloudvm::{AppError, Result};

// ── Fakes ─────────────────────────────────────────────────────────────────────

/// Provider that flips to `after_start` / `off` once the matching power action lands.
struct FakeCompute {
    status: Mutex<VmStatus>,
    after_start: VmStatus,
    fail_status: AtomicBool,
    /// When set, `power` blocks until notified.
    gate: Option<Arc<Notify>>,
    starts: AtomicU32,
    stops: AtomicU32,
    status_calls: AtomicU32,
}

impl FakeCompute {
    fn new(initial: VmStatus) -> Self {
        Self {
            status: Mutex::new(initial),
            after_start: VmStatus::Running,
            fail_status: AtomicBool::new(false),
            gate: None,
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
        }
    }

    fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn power(&self, _config: &CloudVmConfig, token: &str, action: PowerAction) -> Result<()> {
        assert_eq!(token, "tok");
        match action {
            PowerAction::Start => self.starts.fetch_add(1, Ordering::SeqCst),
            PowerAction::Stop => self.stops.fetch_add(1, Ordering::SeqCst),
        };
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        *self.status.lock().unwrap() = match action {
            PowerAction::Start => self.after_start,
            PowerAction::Stop => VmStatus::Off,
        };
        Ok(())
    }

    async fn get_status(&self, _config: &CloudVmConfig, _token: &str) -> Result<RemoteInstance> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(AppError::api(503, "backend unavailable"));
        }
        Ok(RemoteInstance {
            status: *self.status.lock().unwrap(),
            ip: Some("10.0.0.5".into()),
        })
    }
}

/// Points at a program that does not exist, so every tunnel start fails at spawn.
struct BrokenLauncher;

impl TunnelLauncher for BrokenLauncher {
    fn command(&self, config: &CloudVmConfig, _ip: Option<&str>) -> Result<TunnelCommand> {
        Ok(TunnelCommand {
            program: "/nonexistent/cloudvm-tunnel".into(),
            args: vec![],
            ready_marker: "Listening on port".into(),
            local_port: config.tunnel_port(),
        })
    }
}

/// Runs a shell script as the tunnel.
struct ScriptLauncher(&'static str);

impl TunnelLauncher for ScriptLauncher {
    fn command(&self, config: &CloudVmConfig, _ip: Option<&str>) -> Result<TunnelCommand> {
        Ok(TunnelCommand {
            program: "sh".into(),
            args: vec!["-c".into(), self.0.into()],
            ready_marker: "Listening on port".into(),
            local_port: config.tunnel_port(),
        })
    }
}

fn config() -> CloudVmConfig {
    CloudVmConfig {
        provider: Provider::Gcp,
        api_token: "tok".into(),
        server_id: Some("workstation".into()),
        project_id: Some("proj".into()),
        zone: Some("europe-west4-a".into()),
        // nothing listens on port 1, so probes are refused straight away
        tunnel_port: Some(1),
        vnc_password: Some("pw".into()),
        ..Default::default()
    }
}

fn settings() -> ControllerSettings {
    ControllerSettings {
        convergence_timeout: Duration::from_secs(60),
        convergence_interval: Duration::from_millis(10),
        poll_backoff_cap: Duration::from_secs(300),
        tunnel: TunnelSettings {
            ready_timeout: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(50),
        },
    }
}

fn controller_with(
    store: Arc<MemoryConfigStore>,
    compute: Arc<FakeCompute>,
    settings: ControllerSettings,
) -> VmController {
    controller_with_launcher(store, compute, settings, Arc::new(BrokenLauncher))
}

fn controller_with_launcher(
    store: Arc<MemoryConfigStore>,
    compute: Arc<FakeCompute>,
    settings: ControllerSettings,
    launcher: Arc<dyn TunnelLauncher>,
) -> VmController {
    VmController::new(
        Collaborators {
            config: store,
            compute,
            tokens: Arc::new(StaticTokenSource("tok".into())),
            launcher,
        },
        settings,
    )
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ── getState ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_state_without_config_is_not_provisioned() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Running));
    let store = Arc::new(MemoryConfigStore::new(Some(CloudVmConfig {
        server_id: Some("workstation".into()),
        ..Default::default()
    })));
    let controller = controller_with(store, compute.clone(), settings());

    let state = controller.get_state().await;
    assert_eq!(state.status, VmStatus::NotProvisioned);
    assert_eq!(compute.status_calls(), 0);
}

#[tokio::test]
async fn get_state_reports_running_with_viewer_url() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Running));
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let controller = controller_with(store, compute, settings());

    let state = controller.get_state().await;
    assert_eq!(state.status, VmStatus::Running);
    assert_eq!(state.ip.as_deref(), Some("10.0.0.5"));
    assert_eq!(state.server_id.as_deref(), Some("workstation"));
    assert_eq!(state.provider, Some(Provider::Gcp));
    // probe refused and no managed process: off, never error
    assert_eq!(state.tunnel_status, TunnelStatus::Off);
    let url = state.remote_view_url.unwrap();
    assert!(url.starts_with("http://localhost:1/vnc.html?"), "{url}");
    assert!(url.ends_with("&password=pw"), "{url}");
    assert!(state.last_checked.is_some());
    assert!(state.error.is_none());
}

#[tokio::test]
async fn get_state_folds_failures_into_the_state() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Off));
    compute.fail_status.store(true, Ordering::SeqCst);
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let controller = controller_with(store, compute.clone(), settings());

    let state = controller.get_state().await;
    assert_eq!(state.status, VmStatus::Unknown);
    assert!(state.error.as_deref().unwrap().contains("503"));
    assert!(state.remote_view_url.is_none());

    compute.fail_status.store(false, Ordering::SeqCst);
    let state = controller.get_state().await;
    assert_eq!(state.status, VmStatus::Off);
    assert!(state.error.is_none());
}

// ── startVm / stopVm ──────────────────────────────────────────────────────────

#[tokio::test]
async fn start_publishes_starting_before_the_api_answers() {
    let gate = Arc::new(Notify::new());
    let compute = Arc::new(FakeCompute { gate: Some(gate.clone()), ..FakeCompute::new(VmStatus::Off) });
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let controller = Arc::new(controller_with(store, compute.clone(), settings()));

    let first = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start_vm().await })
    };
    wait_until(|| compute.starts() == 1).await;
    assert_eq!(controller.snapshot().status, VmStatus::Starting);
    assert_eq!(controller.operation(), Operation::Starting);

    // concurrent start and stop return the cached state and issue nothing
    let second = controller.start_vm().await.unwrap();
    assert_eq!(second.status, VmStatus::Starting);
    let stop = controller.stop_vm().await.unwrap();
    assert_eq!(stop.status, VmStatus::Starting);
    assert_eq!(compute.starts(), 1);
    assert_eq!(compute.stops(), 0);

    gate.notify_one();
    let state = first.await.unwrap().unwrap();
    assert_eq!(state.status, VmStatus::Running);
    assert_eq!(compute.starts(), 1);
    assert_eq!(controller.operation(), Operation::Idle);
}

#[tokio::test]
async fn tunnel_failure_does_not_fail_start() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Off));
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let controller = controller_with(store, compute, settings());

    let state = controller.start_vm().await.unwrap();
    assert_eq!(state.status, VmStatus::Running);
    assert_eq!(state.tunnel_status, TunnelStatus::Error);
    assert!(state.remote_view_url.is_some());
    let err = state.error.unwrap();
    assert!(err.contains("VM is running"), "{err}");
    assert!(err.contains("tunnel failed"), "{err}");

    // the supervisor latched the failure, a refresh keeps reporting it
    let state = controller.get_state().await;
    assert_eq!(state.status, VmStatus::Running);
    assert_eq!(state.tunnel_status, TunnelStatus::Error);
    let err = state.error.unwrap();
    assert!(err.contains("VM itself is unaffected"), "{err}");
    assert!(err.contains("failed to spawn"), "{err}");
}

#[cfg(unix)]
#[tokio::test]
async fn tunnel_dying_after_reconnect_is_explained() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Off));
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let launcher = Arc::new(ScriptLauncher("echo 'Listening on port [1].' >&2; sleep 0.2"));
    let controller = controller_with_launcher(store, compute, settings(), launcher);

    let state = controller.start_vm().await.unwrap();
    assert_eq!(state.tunnel_status, TunnelStatus::Running);
    assert!(state.error.is_none());

    // dies, is relaunched once, dies again
    wait_until(|| controller.snapshot().tunnel_status == TunnelStatus::Error).await;
    wait_until(|| controller.snapshot().error.is_some()).await;
    let state = controller.snapshot();
    assert_eq!(state.status, VmStatus::Running);
    let err = state.error.unwrap();
    assert!(err.contains("Tunnel failed"), "{err}");
    assert!(err.contains("after reconnect"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn start_times_out_and_rolls_back() {
    let compute = Arc::new(FakeCompute { after_start: VmStatus::Starting, ..FakeCompute::new(VmStatus::Off) });
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let settings = ControllerSettings { convergence_interval: Duration::from_secs(3), ..settings() };
    let controller = controller_with(store, compute.clone(), settings);

    let started = tokio::time::Instant::now();
    let err = controller.start_vm().await.unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert_eq!(started.elapsed(), Duration::from_secs(60));
    // one status check every 3 s for 60 s
    assert_eq!(compute.status_calls(), 20);

    let state = controller.snapshot();
    assert_eq!(state.status, VmStatus::Unknown);
    assert!(state.error.is_some());
    assert!(state.remote_view_url.is_none());
    assert_eq!(controller.operation(), Operation::Idle);
}

#[tokio::test]
async fn api_failure_propagates_and_clears_the_guard() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Off));
    compute.fail_status.store(true, Ordering::SeqCst);
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let controller = controller_with(store, compute.clone(), settings());

    let err = controller.start_vm().await.unwrap_err();
    assert!(matches!(err, AppError::Api { status: 503, .. }), "{err}");
    assert_eq!(controller.snapshot().status, VmStatus::Unknown);
    assert_eq!(controller.operation(), Operation::Idle);

    compute.fail_status.store(false, Ordering::SeqCst);
    controller.start_vm().await.unwrap();
    assert_eq!(compute.starts(), 2);
}

#[tokio::test]
async fn stop_closes_tunnel_and_waits_for_off() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Running));
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let controller = controller_with(store, compute.clone(), settings());
    controller.get_state().await;

    let state = controller.stop_vm().await.unwrap();
    assert_eq!(compute.stops(), 1);
    assert_eq!(state.status, VmStatus::Off);
    assert_eq!(state.tunnel_status, TunnelStatus::Off);
    assert!(state.remote_view_url.is_none());
    assert!(state.error.is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn stop_closes_tunnel_even_when_config_went_bad() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Running));
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let launcher = Arc::new(ScriptLauncher("echo 'Listening on port [1].' >&2; exec sleep 30"));
    let controller = controller_with_launcher(store.clone(), compute.clone(), settings(), launcher);

    let state = controller.start_tunnel().await.unwrap();
    assert_eq!(state.tunnel_status, TunnelStatus::Running);

    store.set_external(Some(CloudVmConfig { server_id: None, ..config() }));
    let err = controller.stop_vm().await.unwrap_err();
    assert!(matches!(err, AppError::NotConfigured(_)), "{err}");
    assert_eq!(compute.stops(), 0);

    let state = controller.snapshot();
    assert_eq!(state.tunnel_status, TunnelStatus::Off);
    assert!(state.remote_view_url.is_none());
    assert_eq!(controller.operation(), Operation::Idle);
}

#[tokio::test]
async fn unconfigured_start_makes_no_calls() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Off));
    let store = Arc::new(MemoryConfigStore::new(None));
    let controller = controller_with(store, compute.clone(), settings());

    let err = controller.start_vm().await.unwrap_err();
    assert!(matches!(err, AppError::NotConfigured(_)), "{err}");
    assert_eq!(compute.starts(), 0);
    assert_eq!(controller.snapshot().status, VmStatus::Unknown);
    assert_eq!(controller.operation(), Operation::Idle);
}

#[tokio::test]
async fn stop_tunnel_twice_is_harmless() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Off));
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let controller = controller_with(store, compute, settings());

    assert_eq!(controller.stop_tunnel().await.tunnel_status, TunnelStatus::Off);
    assert_eq!(controller.stop_tunnel().await.tunnel_status, TunnelStatus::Off);
}

// ── Notifications ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn state_changes_are_published() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Off));
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let controller = controller_with(store, compute, settings());
    let mut rx = controller.subscribe();

    controller.get_state().await;
    assert!(rx.has_changed().unwrap());
    assert_eq!(rx.borrow_and_update().status, VmStatus::Off);
}

#[tokio::test]
async fn external_config_edit_triggers_refresh() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Off));
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let controller = controller_with(store.clone(), compute.clone(), settings());

    let mut edited = config();
    edited.zone = Some("us-east1-b".into());
    store.set_external(Some(edited));

    wait_until(|| compute.status_calls() >= 1).await;
    wait_until(|| controller.snapshot().status == VmStatus::Off).await;
}

#[tokio::test]
async fn credential_write_back_does_not_trigger_refresh() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Off));
    let store = Arc::new(MemoryConfigStore::new(Some(CloudVmConfig { api_token: "stale".into(), ..config() })));
    let controller = controller_with(store.clone(), compute.clone(), settings());

    assert!(controller.refresh_credential().await.unwrap());
    assert_eq!(store.load().unwrap().unwrap().api_token, "tok");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(compute.status_calls(), 0);
}

// ── Polling ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn polling_backs_off_while_failing() {
    let compute = Arc::new(FakeCompute::new(VmStatus::Off));
    compute.fail_status.store(true, Ordering::SeqCst);
    let store = Arc::new(MemoryConfigStore::new(Some(config())));
    let controller = controller_with(store, compute.clone(), settings());

    controller.start_polling(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(95)).await;
    // t=0, t=30, t=90
    assert_eq!(compute.status_calls(), 3);

    compute.fail_status.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(150)).await;
    // t=210 succeeds, back to the base interval: t=240
    assert_eq!(compute.status_calls(), 5);

    controller.stop_polling();
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(compute.status_calls(), 5);
}
