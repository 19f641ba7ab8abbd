// ABOUTME: Host identity: the instance this agent runs on and the bearer token it presents.
// ABOUTME: MetadataServer reads both from the GCE metadata server over plain HTTP.

use async_trait::async_trait;

use crate::error::SessionError;

/// Audience requested for the identity token.
pub const TOKEN_AUDIENCE: &str = "agentcommunication.googleapis.com";

/// Default metadata server host.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Environment variable overriding the metadata server host.
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

/// Where the agent is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    /// Zone name, e.g. `us-central1-a`.
    pub zone: String,
    /// Numeric project id.
    pub project_number: String,
    pub instance_id: String,
}

impl InstanceIdentity {
    /// Resource id bound to the session: `projects/{num}/zones/{zone}/instances/{id}`.
    pub fn resource_id(&self) -> String {
        format!(
            "projects/{}/zones/{}/instances/{}",
            self.project_number, self.zone, self.instance_id
        )
    }

    /// Location used for endpoint selection: the zone, or its region when `regional`.
    pub fn location(&self, regional: bool) -> String {
        if !regional {
            return self.zone.clone();
        }
        // Zones are "<region>-<letter>"; drop the "-<letter>".
        let cut = self.zone.len().saturating_sub(2);
        match self.zone.get(..cut) {
            Some(region) => region.to_string(),
            None => self.zone.clone(),
        }
    }
}

/// Source of host identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Bearer token for `audience`.
    async fn token(&self, audience: &str) -> Result<String, SessionError>;

    /// Identity of the instance.
    async fn instance(&self) -> Result<InstanceIdentity, SessionError>;
}

/// [`IdentityProvider`] backed by the GCE metadata server.
#[derive(Debug, Clone)]
pub struct MetadataServer {
    client: reqwest::Client,
    host: String,
}

impl MetadataServer {
    /// Use `GCE_METADATA_HOST` if set, else the default host.
    pub fn new() -> Self {
        let host = std::env::var(METADATA_HOST_ENV)
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
        Self::with_host(host)
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: host.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}/computeMetadata/v1/{}", self.host, path)
    }

    async fn get(&self, path: &str) -> Result<String, SessionError> {
        let response = self
            .client
            .get(self.url(path))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| SessionError::IdentityUnavailable(format!("{}: {}", path, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::IdentityUnavailable(format!(
                "{}: metadata server returned {}",
                path, status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SessionError::IdentityUnavailable(format!("{}: {}", path, e)))?;
        Ok(body.trim().to_string())
    }
}

impl Default for MetadataServer {
    fn default() -> Self {
        Self::new()
    }
}

/// The metadata server reports the zone as `projects/<num>/zones/<zone>`.
fn zone_from_path(value: &str) -> &str {
    value.rsplit('/').next().unwrap_or(value)
}

#[async_trait]
impl IdentityProvider for MetadataServer {
    async fn token(&self, audience: &str) -> Result<String, SessionError> {
        let path = format!(
            "instance/service-accounts/default/identity?audience={}&format=full",
            audience
        );
        let token = self.get(&path).await?;
        tracing::debug!(audience, "fetched identity token");
        Ok(token)
    }

    async fn instance(&self) -> Result<InstanceIdentity, SessionError> {
        let zone = self.get("instance/zone").await?;
        let project_number = self.get("project/numeric-project-id").await?;
        let instance_id = self.get("instance/id").await?;
        Ok(InstanceIdentity {
            zone: zone_from_path(&zone).to_string(),
            project_number,
            instance_id,
        })
    }
}
