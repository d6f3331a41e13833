use async_trait::async_trait;
use tokio::process::Child;

use super::{cli, spawn, Hypervisor, Share};
use crate::isolation::{IsolationError, IsolationSpec, VetuNetworking};

const VETU_BINARY: &str = "vetu";

/// Driver for the `vetu` CLI on Linux hosts.
#[derive(Debug, Default)]
pub struct Vetu;

impl Vetu {
    pub fn set_args(name: &str, spec: &IsolationSpec) -> Vec<String> {
        let mut args = vec!["set".to_string(), name.to_string()];
        if let IsolationSpec::Vetu(spec) = spec {
            if spec.cpu > 0 {
                args.push(format!("--cpu={}", spec.cpu));
            }
            if spec.memory > 0 {
                args.push(format!("--memory={}", spec.memory));
            }
            if spec.disk_size > 0 {
                args.push(format!("--disk-size={}", spec.disk_size));
            }
        }
        args
    }

    pub fn run_args(name: &str, spec: &IsolationSpec, extra_args: &[String]) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if let IsolationSpec::Vetu(spec) = spec {
            match &spec.networking {
                VetuNetworking::Default => {}
                VetuNetworking::Bridged { interface } => {
                    args.push(format!("--net-bridged={}", interface));
                }
                VetuNetworking::Host => args.push("--net-host".to_string()),
            }
        }
        args.extend(extra_args.iter().cloned());
        args.push(name.to_string());
        args
    }
}

#[async_trait]
impl Hypervisor for Vetu {
    fn tool(&self) -> &'static str {
        VETU_BINARY
    }

    async fn pull(&self, image: &str) -> Result<(), IsolationError> {
        tracing::info!(image = %image, "Pulling Vetu image");
        cli(VETU_BINARY, &["pull".to_string(), image.to_string()]).await?;
        Ok(())
    }

    async fn fqn(&self, image: &str) -> Result<String, IsolationError> {
        cli(VETU_BINARY, &["fqn".to_string(), image.to_string()]).await
    }

    async fn clone_vm(&self, image: &str, name: &str) -> Result<(), IsolationError> {
        cli(
            VETU_BINARY,
            &["clone".to_string(), image.to_string(), name.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn configure(&self, name: &str, spec: &IsolationSpec) -> Result<(), IsolationError> {
        let args = Self::set_args(name, spec);
        if args.len() > 2 {
            cli(VETU_BINARY, &args).await?;
        }
        Ok(())
    }

    async fn start(
        &self,
        name: &str,
        spec: &IsolationSpec,
        _shares: &[Share],
        extra_args: &[String],
    ) -> Result<Option<Child>, IsolationError> {
        let args = Self::run_args(name, spec, extra_args);
        tracing::debug!(vm = %name, args = ?args, "Starting Vetu VM");
        spawn(VETU_BINARY, &args, name).map(Some)
    }

    async fn ip(&self, name: &str) -> Result<String, IsolationError> {
        cli(
            VETU_BINARY,
            &["ip".to_string(), "--wait=5".to_string(), name.to_string()],
        )
        .await
    }

    async fn stop(&self, name: &str) -> Result<(), IsolationError> {
        cli(VETU_BINARY, &["stop".to_string(), name.to_string()]).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), IsolationError> {
        cli(VETU_BINARY, &["delete".to_string(), name.to_string()]).await?;
        Ok(())
    }
}
