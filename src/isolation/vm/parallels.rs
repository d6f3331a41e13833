use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Child;

use super::{cli, Hypervisor, Share};
use crate::isolation::{IsolationError, IsolationSpec};

const PRLCTL_BINARY: &str = "prlctl";

/// Driver for Parallels Desktop through `prlctl`.
///
/// Images are existing VMs on the host, cloned as linked clones, so there is
/// nothing to pull and the image name is already fully qualified.
#[derive(Debug, Default)]
pub struct Parallels;

#[derive(Debug, Deserialize)]
struct VmListEntry {
    #[serde(default)]
    ip_configured: String,
}

/// Extract the IP from `prlctl list --full --json <name>` output.
pub fn parse_ip(output: &str) -> Result<String, IsolationError> {
    let entries: Vec<VmListEntry> = serde_json::from_str(output)
        .map_err(|e| IsolationError::backend(PRLCTL_BINARY, format!("unexpected list output: {}", e)))?;

    entries
        .into_iter()
        .map(|entry| entry.ip_configured)
        .find(|ip| !ip.is_empty() && ip != "-")
        .ok_or_else(|| IsolationError::backend(PRLCTL_BINARY, "VM has no IP address yet"))
}

#[async_trait]
impl Hypervisor for Parallels {
    fn tool(&self) -> &'static str {
        PRLCTL_BINARY
    }

    async fn pull(&self, _image: &str) -> Result<(), IsolationError> {
        Ok(())
    }

    async fn fqn(&self, image: &str) -> Result<String, IsolationError> {
        Ok(image.to_string())
    }

    async fn clone_vm(&self, image: &str, name: &str) -> Result<(), IsolationError> {
        cli(
            PRLCTL_BINARY,
            &[
                "clone".to_string(),
                image.to_string(),
                "--name".to_string(),
                name.to_string(),
                "--linked".to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn configure(&self, _name: &str, _spec: &IsolationSpec) -> Result<(), IsolationError> {
        Ok(())
    }

    async fn start(
        &self,
        name: &str,
        _spec: &IsolationSpec,
        _shares: &[Share],
        extra_args: &[String],
    ) -> Result<Option<Child>, IsolationError> {
        let mut args = vec!["start".to_string(), name.to_string()];
        args.extend(extra_args.iter().cloned());
        cli(PRLCTL_BINARY, &args).await?;
        Ok(None)
    }

    async fn ip(&self, name: &str) -> Result<String, IsolationError> {
        let output = cli(
            PRLCTL_BINARY,
            &[
                "list".to_string(),
                "--full".to_string(),
                "--json".to_string(),
                name.to_string(),
            ],
        )
        .await?;
        parse_ip(&output)
    }

    async fn stop(&self, name: &str) -> Result<(), IsolationError> {
        cli(
            PRLCTL_BINARY,
            &["stop".to_string(), name.to_string(), "--kill".to_string()],
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), IsolationError> {
        cli(PRLCTL_BINARY, &["delete".to_string(), name.to_string()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ip_reads_configured_address() {
        let output = r#"[{"uuid":"{abc}","status":"running","ip_configured":"10.211.55.4","name":"vm"}]"#;
        assert_eq!(parse_ip(output).unwrap(), "10.211.55.4");
    }

    #[test]
    fn parse_ip_rejects_placeholder() {
        let output = r#"[{"uuid":"{abc}","status":"starting","ip_configured":"-","name":"vm"}]"#;
        assert!(parse_ip(output).is_err());
    }

    #[tokio::test]
    async fn fqn_is_image_name() {
        assert_eq!(Parallels.fqn("macos-base").await.unwrap(), "macos-base");
    }
}
