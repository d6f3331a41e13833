//! Local cache of the supervisory agent binary.
//!
//! Binaries are keyed by `(version, os, architecture)` and stored under the
//! per-user cache directory. A miss downloads the release asset into a
//! temporary file next to the destination and renames it into place, so a
//! concurrently running worker installing the same path is harmless.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const RELEASE_BASE_URL: &str = "https://github.com/cirruslabs/cirrus-ci-agent/releases/download";

pub const DEFAULT_AGENT_VERSION: &str = "0.137.0";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no cache directory available on this system")]
    NoCacheDir,

    #[error("failed to download agent from {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to install agent to {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent release to install into isolated environments
    pub version: Option<String>,
    /// Use this binary for every platform instead of downloading releases
    pub binary: Option<PathBuf>,
    /// Override the cache location
    pub cache_dir: Option<PathBuf>,
}

/// Resolves agent binaries for a given guest platform.
#[derive(Debug, Clone)]
pub struct AgentCache {
    dir: PathBuf,
    base_url: String,
    version: String,
    binary_override: Option<PathBuf>,
}

impl AgentCache {
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let dir = match &config.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .ok_or(AgentError::NoCacheDir)?
                .join("persistent-worker")
                .join("agent"),
        };

        Ok(Self {
            dir,
            base_url: RELEASE_BASE_URL.to_string(),
            version: config
                .version
                .clone()
                .unwrap_or_else(|| DEFAULT_AGENT_VERSION.to_string()),
            binary_override: config.binary.clone(),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn cache_dir(&self) -> &Path {
        &self.dir
    }

    /// Path the binary for this platform is cached at.
    pub fn cached_path(&self, version: &str, os: &str, arch: &str) -> PathBuf {
        self.dir.join(format!("cirrus-ci-agent-v{}-{}-{}", version, os, arch))
    }

    /// Return a local path to the agent for `os`/`arch`, downloading it on a
    /// cache miss.
    pub async fn get(&self, version: &str, os: &str, arch: &str) -> Result<PathBuf, AgentError> {
        if let Some(binary) = &self.binary_override {
            return Ok(binary.clone());
        }

        let path = self.cached_path(version, os, arch);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }

        let url = format!(
            "{}/v{}/agent-{}-{}",
            self.base_url.trim_end_matches('/'),
            version,
            os,
            arch
        );
        tracing::info!(url = %url, path = %path.display(), "Downloading agent binary");

        let bytes = download(&url).await?;

        let dir = self.dir.clone();
        let target = path.clone();
        tokio::task::spawn_blocking(move || install(&dir, &target, &bytes))
            .await
            .map_err(|e| AgentError::Install {
                path: path.clone(),
                source: std::io::Error::other(e),
            })??;

        Ok(path)
    }
}

/// Atomically place `contents` at `path`, an executable inside `dir`.
fn install(dir: &Path, path: &Path, contents: &[u8]) -> Result<(), AgentError> {
    let install_err = |source| AgentError::Install {
        path: path.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(install_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(install_err)?;
    std::io::Write::write_all(&mut tmp, contents).map_err(install_err)?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o755))
        .map_err(install_err)?;

    if let Err(e) = tmp.persist(path) {
        // Another worker may have installed the same binary in the meantime
        if path.exists() {
            tracing::debug!(path = %path.display(), "Agent binary installed concurrently");
            return Ok(());
        }
        return Err(install_err(e.error));
    }

    Ok(())
}

async fn download(url: &str) -> Result<Vec<u8>, AgentError> {
    let download_err = |source| AgentError::Download {
        url: url.to_string(),
        source,
    };

    let response = reqwest::get(url)
        .await
        .and_then(|response| response.error_for_status())
        .map_err(download_err)?;
    let bytes = response.bytes().await.map_err(download_err)?;

    Ok(bytes.to_vec())
}

/// Agent platform names for the host this worker runs on.
pub fn host_platform() -> (&'static str, &'static str) {
    (agent_os(std::env::consts::OS), agent_arch(std::env::consts::ARCH))
}

pub fn agent_os(os: &str) -> &'static str {
    match os {
        "macos" => "darwin",
        "windows" => "windows",
        "freebsd" => "freebsd",
        _ => "linux",
    }
}

pub fn agent_arch(arch: &str) -> &'static str {
    match arch {
        "aarch64" => "arm64",
        "x86" => "386",
        "arm" => "arm",
        _ => "amd64",
    }
}
