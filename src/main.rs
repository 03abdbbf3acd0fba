//! cloudvm: power a cloud workstation on and off and keep a local tunnel to
//! its remote viewer.
//!
//! Every subcommand maps onto one `VmController` operation. Long-running
//! commands (`tunnel`, `watch`) run until Ctrl-C and tear down on exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use cloudvm::compute::ComputeClient;
use cloudvm::config::{default_config_path, ConfigStore, FileConfigStore};
use cloudvm::controller::{Collaborators, ControllerSettings, VmController};
use cloudvm::credential::CliTokenSource;
use cloudvm::logging;
use cloudvm::models::{CloudVmConfig, CloudVmState, TunnelStatus};
use cloudvm::poller::DEFAULT_POLL_INTERVAL;
use cloudvm::tunnel::ProviderTunnelLauncher;

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "cloudvm", about = "Cloud workstation power control and viewer tunnel", version)]
struct Cli {
    /// Config file (defaults to <config dir>/cloudvm/config.json)
    #[arg(long, global = true, env = "CLOUDVM_CONFIG")]
    config: Option<PathBuf>,
    /// Debug-level logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show instance and tunnel status
    Status,
    /// Power the instance on and open the tunnel
    Start,
    /// Close the tunnel and power the instance off
    Stop,
    /// Open the tunnel and keep it up until Ctrl-C
    Tunnel,
    /// Poll status and print every change until Ctrl-C
    Watch {
        /// Poll interval in seconds
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
        interval: u64,
    },
    /// Refresh the provider credential and store it
    Login,
    /// Show or edit the stored configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the stored configuration (token masked)
    Show,
    /// Update one or more fields
    Set(ConfigSetArgs),
}

#[derive(Args)]
struct ConfigSetArgs {
    /// "gcp" or "hetzner"
    #[arg(long)]
    provider: Option<String>,
    /// Instance name (GCP) or server id (Hetzner)
    #[arg(long)]
    server_id: Option<String>,
    #[arg(long)]
    project_id: Option<String>,
    #[arg(long)]
    zone: Option<String>,
    #[arg(long)]
    region: Option<String>,
    /// Hetzner API token
    #[arg(long)]
    api_token: Option<String>,
    /// Local port the tunnel listens on
    #[arg(long)]
    tunnel_port: Option<u16>,
    /// Viewer port on the instance
    #[arg(long)]
    remote_port: Option<u16>,
    /// Pre-shared VNC password embedded in the viewer URL
    #[arg(long)]
    vnc_password: Option<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log = logging::init(cli.verbose);
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let path = cli.config.unwrap_or_else(default_config_path);
    let store = Arc::new(
        FileConfigStore::open(&path).with_context(|| format!("opening {}", path.display()))?,
    );

    match cli.command {
        Cmd::Config { action } => run_config(&store, action),

        Cmd::Status => {
            let controller = build_controller(&store)?;
            let state = controller.get_state().await;
            print_state(&state);
            controller.shutdown().await;
            Ok(())
        }

        Cmd::Start => {
            let controller = build_controller(&store)?;
            println!("Starting instance...");
            let result = controller.start_vm().await;
            let state = controller.snapshot();
            print_state(&state);
            result?;
            if state.tunnel_status == TunnelStatus::Running {
                println!("\nTunnel is up. Press Ctrl-C to close it.");
                tokio::signal::ctrl_c().await?;
            }
            controller.shutdown().await;
            Ok(())
        }

        Cmd::Stop => {
            let controller = build_controller(&store)?;
            println!("Stopping instance...");
            let result = controller.stop_vm().await;
            print_state(&controller.snapshot());
            controller.shutdown().await;
            result?;
            Ok(())
        }

        Cmd::Tunnel => {
            let controller = build_controller(&store)?;
            // the address is needed for SSH forwarding
            controller.get_state().await;
            let state = controller.start_tunnel().await?;
            println!("Tunnel active on localhost:{}", tunnel_port(&store));
            if let Some(url) = &state.remote_view_url {
                println!("  Viewer: {}", url);
            }
            println!("Press Ctrl-C to close it.");
            tokio::signal::ctrl_c().await?;
            controller.shutdown().await;
            println!("Tunnel closed.");
            Ok(())
        }

        Cmd::Watch { interval } => {
            let controller = build_controller(&store)?;
            let _watcher = store.watch().context("watching config file")?;
            let mut rx = controller.subscribe();
            controller.start_polling(Duration::from_secs(interval.max(1)));
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = rx.borrow_and_update().clone();
                        print_state(&state);
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            controller.shutdown().await;
            Ok(())
        }

        Cmd::Login => {
            let controller = build_controller(&store)?;
            let changed = controller.refresh_credential().await?;
            if changed {
                println!("Credential refreshed and saved to {}", store.path().display());
            } else {
                println!("Credential is current.");
            }
            Ok(())
        }
    }
}

fn build_controller(store: &Arc<FileConfigStore>) -> anyhow::Result<VmController> {
    let compute = ComputeClient::new().context("building HTTP client")?;
    Ok(VmController::new(
        Collaborators {
            config: store.clone(),
            compute: Arc::new(compute),
            tokens: Arc::new(CliTokenSource::gcloud()),
            launcher: Arc::new(ProviderTunnelLauncher),
        },
        ControllerSettings::default(),
    ))
}

fn tunnel_port(store: &FileConfigStore) -> u16 {
    store
        .load()
        .ok()
        .flatten()
        .map(|c| c.tunnel_port())
        .unwrap_or(cloudvm::models::DEFAULT_TUNNEL_PORT)
}

// ── Config subcommands ────────────────────────────────────────────────────────

fn run_config(store: &FileConfigStore, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let Some(config) = store.load()? else {
                println!("No configuration at {}", store.path().display());
                println!("Use 'cloudvm config set --server-id ...' to create one.");
                return Ok(());
            };
            print_config(&config);
            if let Some(field) = config.missing_field() {
                println!("\nIncomplete: {} is not set.", field);
            }
        }
        ConfigAction::Set(args) => {
            let mut config = store.load()?.unwrap_or_default();
            if let Some(p) = args.provider {
                config.provider = p.parse()?;
            }
            if let Some(v) = args.server_id { config.server_id = Some(v); }
            if let Some(v) = args.project_id { config.project_id = Some(v); }
            if let Some(v) = args.zone { config.zone = Some(v); }
            if let Some(v) = args.region { config.region = Some(v); }
            if let Some(v) = args.api_token { config.api_token = v; }
            if let Some(v) = args.tunnel_port { config.tunnel_port = Some(v); }
            if let Some(v) = args.remote_port { config.remote_port = Some(v); }
            if let Some(v) = args.vnc_password { config.vnc_password = Some(v); }
            store.save(&config)?;
            println!("Config saved to {}", store.path().display());
            print_config(&config);
        }
    }
    Ok(())
}

// ── Output ────────────────────────────────────────────────────────────────────

fn print_state(state: &CloudVmState) {
    println!("-------------------------------------");
    println!("  Status:     {}", state.status);
    println!("  Tunnel:     {}", state.tunnel_status);
    println!("  Provider:   {}", state.provider.map(|p| p.as_str()).unwrap_or("N/A"));
    println!("  Server:     {}", state.server_id.as_deref().unwrap_or("N/A"));
    println!("  IP:         {}", state.ip.as_deref().unwrap_or("N/A"));
    if let Some(url) = &state.remote_view_url {
        println!("  Viewer:     {}", url);
    }
    if let Some(at) = state.last_checked {
        println!("  Checked:    {}", at.with_timezone(&chrono::Local).format("%H:%M:%S"));
    }
    if let Some(err) = &state.error {
        println!("  Error:      {}", err);
    }
    println!("-------------------------------------");
}

fn print_config(config: &CloudVmConfig) {
    let dash = |v: Option<&str>| v.filter(|s| !s.is_empty()).unwrap_or("-").to_string();
    println!("  Provider:    {}", config.provider);
    println!("  Server:      {}", dash(config.server_id.as_deref()));
    println!("  Project:     {}", dash(config.project_id.as_deref()));
    println!("  Zone:        {}", dash(config.zone.as_deref()));
    println!("  Region:      {}", dash(config.region.as_deref()));
    println!("  Token:       {}", mask(&config.api_token));
    println!("  Tunnel port: {}", config.tunnel_port());
    println!("  Remote port: {}", config.remote_port());
    println!("  VNC pass:    {}", if config.vnc_password.is_some() { "set" } else { "-" });
}

fn mask(token: &str) -> String {
    let token = token.trim();
    if token.is_empty() {
        return "-".into();
    }
    let tail: String = token.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("****{}", tail)
}
