//! Process identity resolved once at startup.

use std::time::Duration;

use tracing::warn;

/// Sentinel used when the hostname or project id cannot be resolved.
pub const UNKNOWN: &str = "unknown";

const METADATA_PROJECT_ID_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/project/project-id";

/// The metadata server answers from the local network; anything slower
/// means we are not running on it.
const METADATA_TIMEOUT: Duration = Duration::from_millis(100);

/// Identity of the running process, attached to every server-side span.
#[derive(Clone, Debug)]
pub struct Identity {
    hostname: String,
    project_id: String,
}

impl Identity {
    /// Create an identity from values the caller already knows.
    pub fn new(hostname: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            project_id: project_id.into(),
        }
    }

    /// Resolve the identity of the running process.
    ///
    /// The hostname is read from the environment or the system, the
    /// project id from the cloud metadata server. Both fall back to
    /// [`UNKNOWN`] instead of failing, resolution never aborts startup.
    pub async fn resolve() -> Self {
        Self::resolve_from(METADATA_PROJECT_ID_URL).await
    }

    async fn resolve_from(metadata_url: &str) -> Self {
        let project_id = match fetch_project_id(metadata_url).await {
            Ok(project_id) => project_id,
            Err(err) => {
                warn!("project id lookup failed: {err}");
                UNKNOWN.to_owned()
            }
        };

        Self {
            hostname: local_hostname(),
            project_id,
        }
    }

    /// Hostname of the running process.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Cloud project id, [`UNKNOWN`] outside the cloud.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

async fn fetch_project_id(metadata_url: &str) -> reqwest::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .build()?;
    client
        .get(metadata_url)
        .header("Metadata-Flavor", "Google")
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}

fn local_hostname() -> String {
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return hostname;
        }
    }

    match nix::unistd::gethostname() {
        Ok(hostname) => match hostname.to_str() {
            Some(hostname) if !hostname.is_empty() => hostname.to_owned(),
            _ => UNKNOWN.to_owned(),
        },
        Err(err) => {
            warn!("failed to read system hostname: {err}");
            UNKNOWN.to_owned()
        }
    }
}
