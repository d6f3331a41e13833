use async_trait::async_trait;
use tokio::process::Child;

use super::{cli, spawn, Hypervisor, Share};
use crate::isolation::{IsolationError, IsolationSpec};

const TART_BINARY: &str = "tart";

/// Driver for the `tart` CLI on Apple Silicon hosts.
#[derive(Debug, Default)]
pub struct Tart;

impl Tart {
    pub fn set_args(name: &str, spec: &IsolationSpec) -> Vec<String> {
        let mut args = vec!["set".to_string(), name.to_string()];
        if let IsolationSpec::Tart(spec) = spec {
            if spec.cpu > 0 {
                args.push(format!("--cpu={}", spec.cpu));
            }
            if spec.memory > 0 {
                args.push(format!("--memory={}", spec.memory));
            }
            if spec.disk_size > 0 {
                args.push(format!("--disk-size={}", spec.disk_size));
            }
            if !spec.display.is_empty() {
                args.push(format!("--display={}", spec.display));
            }
        }
        args
    }

    pub fn run_args(
        name: &str,
        spec: &IsolationSpec,
        shares: &[Share],
        extra_args: &[String],
    ) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--no-graphics".to_string()];
        if let IsolationSpec::Tart(spec) = spec {
            if spec.softnet {
                args.push("--net-softnet".to_string());
            }
        }
        for share in shares {
            let mut dir = format!("--dir={}:{}", share.name, share.source);
            if share.read_only {
                dir.push_str(":ro");
            }
            args.push(dir);
        }
        args.extend(extra_args.iter().cloned());
        args.push(name.to_string());
        args
    }
}

#[async_trait]
impl Hypervisor for Tart {
    fn tool(&self) -> &'static str {
        TART_BINARY
    }

    async fn pull(&self, image: &str) -> Result<(), IsolationError> {
        tracing::info!(image = %image, "Pulling Tart image");
        cli(TART_BINARY, &["pull".to_string(), image.to_string()]).await?;
        Ok(())
    }

    async fn fqn(&self, image: &str) -> Result<String, IsolationError> {
        cli(TART_BINARY, &["fqn".to_string(), image.to_string()]).await
    }

    async fn clone_vm(&self, image: &str, name: &str) -> Result<(), IsolationError> {
        cli(
            TART_BINARY,
            &["clone".to_string(), image.to_string(), name.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn configure(&self, name: &str, spec: &IsolationSpec) -> Result<(), IsolationError> {
        let args = Self::set_args(name, spec);
        if args.len() > 2 {
            cli(TART_BINARY, &args).await?;
        }
        Ok(())
    }

    async fn start(
        &self,
        name: &str,
        spec: &IsolationSpec,
        shares: &[Share],
        extra_args: &[String],
    ) -> Result<Option<Child>, IsolationError> {
        let args = Self::run_args(name, spec, shares, extra_args);
        tracing::debug!(vm = %name, args = ?args, "Starting Tart VM");
        spawn(TART_BINARY, &args, name).map(Some)
    }

    async fn ip(&self, name: &str) -> Result<String, IsolationError> {
        cli(
            TART_BINARY,
            &["ip".to_string(), "--wait=5".to_string(), name.to_string()],
        )
        .await
    }

    async fn stop(&self, name: &str) -> Result<(), IsolationError> {
        cli(TART_BINARY, &["stop".to_string(), name.to_string()]).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), IsolationError> {
        cli(TART_BINARY, &["delete".to_string(), name.to_string()]).await?;
        Ok(())
    }
}
