use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::resources::{ResourceModifierConfig, Resources};
use crate::security::Security;
use crate::standby::StandbyConfig;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("No upstreams configured")]
    NoUpstreams,

    #[error("Upstream {0:?} has no registration token")]
    MissingToken(String),

    #[error("Upstream {0:?} is configured more than once")]
    DuplicateUpstream(String),
}

/// TLS settings for upstream channels.
///
/// Without any paths set, the platform's native roots verify the control
/// plane and no client certificate is presented.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to a CA certificate (PEM format) trusted for upstreams.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to a client certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to the client certificate's private key (PEM format).
    pub key_path: Option<PathBuf>,

    /// Override the name verified against the server certificate.
    pub domain_name: Option<String>,
}

/// One control-plane endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub name: String,
    pub url: String,
    /// Registration token, defaults to the worker-wide token
    pub token: String,
    /// Plaintext transport, for loopback testing only
    pub insecure: bool,
    /// Endpoint agents report to, defaults to `url`
    pub agent_endpoint: String,
    /// Endpoint agents inside containers report to, defaults to
    /// `agent_endpoint`
    pub container_endpoint: String,
}

impl UpstreamConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker name, defaults to the host name
    pub name: Option<String>,
    /// Registration token used by upstreams that don't set their own
    pub token: String,
    pub labels: HashMap<String, String>,
    /// Total capacity of this worker
    pub resources: Resources,
    pub upstreams: Vec<UpstreamConfig>,
    /// Absent means every isolation is allowed without restriction
    pub security: Option<Security>,
    pub standby: Option<StandbyConfig>,
    pub resource_modifiers: Vec<ResourceModifierConfig>,
    pub agent: AgentConfig,
    pub tls: TlsConfig,
    /// Used until an upstream asks for a different interval
    pub poll_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            token: String::new(),
            labels: HashMap::new(),
            resources: Resources::new(),
            upstreams: Vec::new(),
            security: None,
            standby: None,
            resource_modifiers: Vec::new(),
            agent: AgentConfig::default(),
            tls: TlsConfig::default(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl WorkerConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.upstreams.push(upstream);
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_security(mut self, security: Security) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_standby(mut self, standby: StandbyConfig) -> Self {
        self.standby = Some(standby);
        self
    }

    pub fn with_resource_modifier(mut self, modifier: ResourceModifierConfig) -> Self {
        self.resource_modifiers.push(modifier);
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agent = agent;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn worker_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => hostname::get()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|_| "persistent-worker".to_string()),
        }
    }

    pub fn security(&self) -> Security {
        self.security.clone().unwrap_or_else(Security::permissive)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Upstreams with the worker-wide token filled in.
    pub fn resolved_upstreams(&self) -> Result<Vec<UpstreamConfig>, ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::NoUpstreams);
        }

        self.upstreams
            .iter()
            .enumerate()
            .map(|(i, upstream)| {
                let mut upstream = upstream.clone();
                if upstream.name.is_empty() {
                    upstream.name = format!("upstream-{}", i);
                }
                if upstream.token.is_empty() {
                    upstream.token = self.token.clone();
                }
                if upstream.token.is_empty() {
                    return Err(ConfigError::MissingToken(upstream.name));
                }
                Ok(upstream)
            })
            .collect()
    }
}
