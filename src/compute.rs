//! Compute control-plane client. Each call is a single bearer-authenticated
//! HTTP request; no state is kept between calls.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::{CloudVmConfig, GceInstance, HetznerServerResponse, Provider, VmStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const GCE_BASE: &str = "https://compute.googleapis.com/compute/v1";
const HETZNER_BASE: &str = "https://api.hetzner.cloud/v1";

/// What the provider reports about the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInstance {
    pub status: VmStatus,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop  => "stop",
        }
    }
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn power(&self, config: &CloudVmConfig, token: &str, action: PowerAction) -> Result<()>;
    async fn get_status(&self, config: &CloudVmConfig, token: &str) -> Result<RemoteInstance>;
}

pub struct ComputeClient {
    http: reqwest::Client,
    gce_base: String,
    hetzner_base: String,
}

impl ComputeClient {
    pub fn new() -> Result<Self> {
        Self::with_base_urls(GCE_BASE, HETZNER_BASE)
    }

    pub fn with_base_urls(gce_base: &str, hetzner_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("cloudvm/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            gce_base: gce_base.trim_end_matches('/').to_string(),
            hetzner_base: hetzner_base.trim_end_matches('/').to_string(),
        })
    }

    fn instance_url(&self, config: &CloudVmConfig) -> Result<String> {
        let id = config
            .server_id()
            .ok_or_else(|| AppError::NotConfigured("no serverId set".into()))?;
        match config.provider {
            Provider::Gcp => {
                let project = required(config.project_id.as_deref(), "projectId")?;
                let zone = required(config.zone.as_deref(), "zone")?;
                Ok(format!("{}/projects/{}/zones/{}/instances/{}", self.gce_base, project, zone, id))
            }
            Provider::Hetzner => Ok(format!("{}/servers/{}", self.hetzner_base, id)),
        }
    }

    fn action_url(&self, config: &CloudVmConfig, action: PowerAction) -> Result<String> {
        let base = self.instance_url(config)?;
        Ok(match (config.provider, action) {
            (Provider::Gcp, PowerAction::Start)     => format!("{}/start", base),
            (Provider::Gcp, PowerAction::Stop)      => format!("{}/stop", base),
            (Provider::Hetzner, PowerAction::Start) => format!("{}/actions/poweron", base),
            (Provider::Hetzner, PowerAction::Stop)  => format!("{}/actions/shutdown", base),
        })
    }

    async fn send(&self, method: Method, url: &str, token: &str) -> Result<String> {
        let mut req = self.http.request(method.clone(), url).bearer_auth(token);
        if method == Method::POST {
            // Compute Engine answers 411 to a bodiless POST without it
            req = req.header(reqwest::header::CONTENT_LENGTH, 0);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(format!("{} {} exceeded {:?}", method, url, REQUEST_TIMEOUT))
                } else {
                    AppError::Http(e)
                }
            })?;
        let status = resp.status();
        let body = resp.text().await?;
        debug!(%method, url, status = status.as_u16(), "Compute API response");
        check_status(status, &body)?;
        Ok(body)
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::NotConfigured(format!("no {} set", field)))
}

fn check_status(status: StatusCode, body: &str) -> Result<()> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AppError::Auth(format!(
            "compute API rejected the credential (HTTP {})",
            status.as_u16()
        )));
    }
    if !status.is_success() {
        return Err(AppError::api(status.as_u16(), body));
    }
    Ok(())
}

pub fn parse_status(provider: Provider, body: &str) -> Result<RemoteInstance> {
    match provider {
        Provider::Gcp => {
            let inst: GceInstance = serde_json::from_str(body)?;
            Ok(RemoteInstance { status: VmStatus::from_gce(&inst.status), ip: inst.ip() })
        }
        Provider::Hetzner => {
            let resp: HetznerServerResponse = serde_json::from_str(body)?;
            Ok(RemoteInstance {
                status: VmStatus::from_hetzner(&resp.server.status),
                ip: resp.server.ip(),
            })
        }
    }
}

#[async_trait]
impl ComputeApi for ComputeClient {
    async fn power(&self, config: &CloudVmConfig, token: &str, action: PowerAction) -> Result<()> {
        let url = self.action_url(config, action)?;
        info!(provider = %config.provider, action = action.as_str(), "Sending power action");
        self.send(Method::POST, &url, token).await?;
        Ok(())
    }

    async fn get_status(&self, config: &CloudVmConfig, token: &str) -> Result<RemoteInstance> {
        let url = self.instance_url(config)?;
        let body = self.send(Method::GET, &url, token).await?;
        parse_status(config.provider, &body)
    }
}
