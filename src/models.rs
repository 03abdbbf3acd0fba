//! Domain models and raw provider JSON deserialization types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const DEFAULT_TUNNEL_PORT: u16 = 8080;
/// noVNC websockify port on the remote workstation.
pub const DEFAULT_REMOTE_PORT: u16 = 6080;
pub const REMOTE_VIEW_PATH: &str = "vnc.html";

// ── Status enums ──────────────────────────────────────────────────────────────

/// Power state of the remote instance as understood by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Off,
    Starting,
    Running,
    Stopping,
    Unknown,
    Initializing,
    /// Local sentinel for "no usable configuration". Never reported by a provider.
    NotProvisioned,
}

impl VmStatus {
    /// Compute Engine `status` field.
    pub fn from_gce(s: &str) -> Self {
        match s {
            "RUNNING"                    => Self::Running,
            "TERMINATED" | "STOPPED"     => Self::Off,
            "STAGING" | "PROVISIONING"   => Self::Starting,
            "STOPPING" | "SUSPENDING"    => Self::Stopping,
            _                            => Self::Unknown,
        }
    }

    /// Hetzner Cloud `server.status` field.
    pub fn from_hetzner(s: &str) -> Self {
        match s {
            "running"      => Self::Running,
            "off"          => Self::Off,
            "starting"     => Self::Starting,
            "stopping"     => Self::Stopping,
            "initializing" => Self::Initializing,
            _              => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off            => "off",
            Self::Starting       => "starting",
            Self::Running        => "running",
            Self::Stopping       => "stopping",
            Self::Unknown        => "unknown",
            Self::Initializing   => "initializing",
            Self::NotProvisioned => "not_provisioned",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the local tunnel subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    #[default]
    Off,
    Starting,
    Running,
    /// Reported by the supervisor only, never by a health probe.
    Error,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off      => "off",
            Self::Starting => "starting",
            Self::Running  => "running",
            Self::Error    => "error",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Gcp,
    Hetzner,
}

impl FromStr for Provider {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gcp" | "gce" | "google" => Ok(Self::Gcp),
            "hetzner"                => Ok(Self::Hetzner),
            other => Err(AppError::Config(format!(
                "unknown provider '{}', use 'gcp' or 'hetzner'",
                other
            ))),
        }
    }
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gcp     => "gcp",
            Self::Hetzner => "hetzner",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Configuration record ──────────────────────────────────────────────────────

/// The persisted configuration record. Keys follow the shared camelCase contract
/// so the file can be edited by the desktop shell as well.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudVmConfig {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub api_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

impl CloudVmConfig {
    pub fn tunnel_port(&self) -> u16 {
        self.tunnel_port.unwrap_or(DEFAULT_TUNNEL_PORT)
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port.unwrap_or(DEFAULT_REMOTE_PORT)
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Returns the reason the record cannot drive the controller, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.server_id().is_none() {
            return Some("serverId");
        }
        match self.provider {
            Provider::Gcp => {
                if self.project_id.as_deref().map_or(true, str::is_empty) {
                    return Some("projectId");
                }
                if self.zone.as_deref().map_or(true, str::is_empty) {
                    return Some("zone");
                }
            }
            Provider::Hetzner => {
                if self.api_token.trim().is_empty() {
                    return Some("apiToken");
                }
            }
        }
        None
    }

    pub fn is_valid(&self) -> bool {
        self.missing_field().is_none()
    }
}

// ── Cached state ──────────────────────────────────────────────────────────────

/// Snapshot published to observers. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudVmState {
    pub status: VmStatus,
    pub ip: Option<String>,
    pub remote_view_url: Option<String>,
    pub provider: Option<Provider>,
    pub server_id: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub tunnel_status: TunnelStatus,
}

impl Default for CloudVmState {
    fn default() -> Self {
        Self {
            status: VmStatus::Unknown,
            ip: None,
            remote_view_url: None,
            provider: None,
            server_id: None,
            last_checked: None,
            error: None,
            tunnel_status: TunnelStatus::Off,
        }
    }
}

/// Local noVNC URL served through the tunnel.
pub fn build_remote_view_url(tunnel_port: u16, password: Option<&str>) -> String {
    let mut url = format!(
        "http://localhost:{}/{}?autoconnect=true&resize=scale&reconnect=true&reconnect_delay=1000",
        tunnel_port, REMOTE_VIEW_PATH
    );
    if let Some(pw) = password.filter(|p| !p.is_empty()) {
        // form encoding turns spaces into '+', the viewer expects %20
        let encoded: String = url::form_urlencoded::byte_serialize(pw.as_bytes()).collect();
        url.push_str("&password=");
        url.push_str(&encoded.replace('+', "%20"));
    }
    url
}

// ── Raw JSON deserialization structs (provider APIs) ──────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GceInstance {
    pub status: String,
    #[serde(default)]
    pub network_interfaces: Vec<GceNetworkInterface>,
}

#[derive(Debug, Deserialize)]
pub struct GceNetworkInterface {
    #[serde(rename = "networkIP")]
    pub network_ip: Option<String>,
    #[serde(rename = "accessConfigs", default)]
    pub access_configs: Vec<GceAccessConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GceAccessConfig {
    #[serde(rename = "natIP")]
    pub nat_ip: Option<String>,
}

impl GceInstance {
    /// External NAT address if present, else the internal address.
    pub fn ip(&self) -> Option<String> {
        let nic = self.network_interfaces.first()?;
        nic.access_configs
            .iter()
            .find_map(|ac| ac.nat_ip.clone())
            .or_else(|| nic.network_ip.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct HetznerServerResponse {
    pub server: HetznerServer,
}

#[derive(Debug, Deserialize)]
pub struct HetznerServer {
    pub status: String,
    pub public_net: Option<HetznerPublicNet>,
}

#[derive(Debug, Deserialize)]
pub struct HetznerPublicNet {
    pub ipv4: Option<HetznerIpv4>,
}

#[derive(Debug, Deserialize)]
pub struct HetznerIpv4 {
    pub ip: String,
}

impl HetznerServer {
    pub fn ip(&self) -> Option<String> {
        self.public_net.as_ref()?.ipv4.as_ref().map(|v4| v4.ip.clone())
    }
}
