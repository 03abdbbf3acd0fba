//! Bearer credential refresh. GCP tokens are minted by shelling out to the
//! provider CLI; Hetzner uses the static API token from the config record.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::models::{CloudVmConfig, Provider};

const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that can mint a bearer credential.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, config: &CloudVmConfig) -> Result<String>;
}

/// Runs an external CLI and takes its trimmed stdout as the token.
#[derive(Debug, Clone)]
pub struct CliTokenSource {
    program: String,
    args: Vec<String>,
}

impl CliTokenSource {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// `gcloud auth print-access-token`
    pub fn gcloud() -> Self {
        Self::new("gcloud", &["auth", "print-access-token"])
    }
}

#[async_trait]
impl TokenSource for CliTokenSource {
    async fn fetch(&self, _config: &CloudVmConfig) -> Result<String> {
        let run = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(TOOL_TIMEOUT, run)
            .await
            .map_err(|_| AppError::Auth(format!("{} did not finish within {:?}", self.program, TOOL_TIMEOUT)))?
            .map_err(|e| AppError::Auth(format!("could not run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(AppError::Auth(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(AppError::Auth(format!("{} printed no token", self.program)));
        }
        Ok(token)
    }
}

/// Clears the refreshing flag however the write-back ends.
struct RefreshingFlag<'a>(&'a AtomicBool);

impl<'a> RefreshingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RefreshingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Fetches a fresh credential before every compute call and writes it back
/// to the config store when it rotated.
pub struct CredentialRefresher {
    source: Arc<dyn TokenSource>,
    store: Arc<dyn ConfigStore>,
    refreshing: AtomicBool,
    /// Revision produced by the last token write-back.
    own_revision: AtomicU64,
}

impl CredentialRefresher {
    pub fn new(source: Arc<dyn TokenSource>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            source,
            store,
            refreshing: AtomicBool::new(false),
            own_revision: AtomicU64::new(0),
        }
    }

    pub async fn refresh(&self, config: &CloudVmConfig) -> Result<String> {
        if config.provider == Provider::Hetzner {
            let token = config.api_token.trim();
            if token.is_empty() {
                return Err(AppError::Auth("no Hetzner API token configured".into()));
            }
            return Ok(token.to_string());
        }

        let token = self.source.fetch(config).await?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(AppError::Auth("credential tool returned an empty token".into()));
        }
        if token == config.api_token {
            return Ok(token);
        }

        // Re-read so a concurrent edit to other fields is not clobbered.
        let mut latest = self.store.load()?.unwrap_or_else(|| config.clone());
        if latest.api_token != token {
            let _flag = RefreshingFlag::raise(&self.refreshing);
            latest.api_token = token.clone();
            let revision = self.store.save(&latest)?;
            self.own_revision.store(revision, Ordering::SeqCst);
            info!(revision, "Credential rotated and saved");
        } else {
            debug!("Credential already up to date in store");
        }
        Ok(token)
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// True when `revision` was produced by this refresher's own write-back.
    pub fn is_own_write(&self, revision: u64) -> bool {
        revision != 0 && self.own_revision.load(Ordering::SeqCst) == revision
    }
}

/// Token source that always returns the same value.
#[derive(Debug, Clone)]
pub struct StaticTokenSource(pub String);

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self, _config: &CloudVmConfig) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;

    fn gcp_config(token: &str) -> CloudVmConfig {
        CloudVmConfig {
            provider: Provider::Gcp,
            api_token: token.into(),
            server_id: Some("ws".into()),
            project_id: Some("p".into()),
            zone: Some("z".into()),
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_source_reads_stdout() {
        let source = CliTokenSource::new("sh", &["-c", "echo '  tok-123  '"]);
        assert_eq!(source.fetch(&gcp_config("")).await.unwrap(), "tok-123");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_source_fails_on_nonzero_exit() {
        let source = CliTokenSource::new("sh", &["-c", "echo denied >&2; exit 1"]);
        let err = source.fetch(&gcp_config("")).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(ref m) if m.contains("denied")), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_source_fails_on_empty_output() {
        let source = CliTokenSource::new("sh", &["-c", "true"]);
        assert!(matches!(source.fetch(&gcp_config("")).await, Err(AppError::Auth(_))));
    }

    #[tokio::test]
    async fn missing_tool_is_an_auth_error() {
        let source = CliTokenSource::new("/nonexistent/cloudvm-token-tool", &[]);
        assert!(matches!(source.fetch(&gcp_config("")).await, Err(AppError::Auth(_))));
    }

    #[tokio::test]
    async fn rotated_token_is_written_back() {
        let store = Arc::new(MemoryConfigStore::new(Some(gcp_config("old"))));
        let mut rx = store.subscribe();
        let refresher = CredentialRefresher::new(Arc::new(StaticTokenSource("new".into())), store.clone());

        let token = refresher.refresh(&gcp_config("old")).await.unwrap();
        assert_eq!(token, "new");
        assert_eq!(store.load().unwrap().unwrap().api_token, "new");
        assert!(!refresher.is_refreshing());

        let update = rx.try_recv().unwrap();
        assert!(refresher.is_own_write(update.revision));
    }

    #[tokio::test]
    async fn unchanged_token_skips_write() {
        let store = Arc::new(MemoryConfigStore::new(Some(gcp_config("same"))));
        let mut rx = store.subscribe();
        let refresher = CredentialRefresher::new(Arc::new(StaticTokenSource("same".into())), store.clone());

        refresher.refresh(&gcp_config("same")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hetzner_uses_configured_token() {
        let store = Arc::new(MemoryConfigStore::new(None));
        let refresher = CredentialRefresher::new(Arc::new(StaticTokenSource("ignored".into())), store);
        let cfg = CloudVmConfig { provider: Provider::Hetzner, api_token: "hz".into(), ..Default::default() };
        assert_eq!(refresher.refresh(&cfg).await.unwrap(), "hz");
    }

    #[tokio::test]
    async fn empty_token_is_rejected() {
        let store = Arc::new(MemoryConfigStore::new(None));
        let refresher = CredentialRefresher::new(Arc::new(StaticTokenSource("   ".into())), store);
        assert!(matches!(refresher.refresh(&gcp_config("x")).await, Err(AppError::Auth(_))));
    }
}
