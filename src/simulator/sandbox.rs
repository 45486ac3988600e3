//! Sandbox lifecycle behind a trait.
//!
//! The production runtime drives the Docker CLI. Simulations execute
//! attacker-supplied SDK code, so the sandbox constraints are a safety
//! invariant, not tuning: no network, hard memory cap without swap, half a
//! CPU, no privilege escalation. A spec asking for network access is
//! refused outright.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;

pub const MEMORY_LIMIT_MB: u64 = 256;
pub const CPU_QUOTA: &str = "0.5";

#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: String,
    /// Host directory mounted read-write at `/work`.
    pub workspace: PathBuf,
    pub env: Vec<(String, String)>,
    /// Must be false. Present so the refusal is explicit and testable.
    pub network_enabled: bool,
}

/// Refuse any spec that could reach the network.
pub fn ensure_network_denied(spec: &SandboxSpec) -> Result<()> {
    if spec.network_enabled {
        bail!("sandbox spec requests network access; simulations must run network-denied");
    }
    Ok(())
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    async fn create(&self, spec: &SandboxSpec) -> Result<String>;
    async fn start(&self, container_id: &str) -> Result<()>;
    /// Block until the sandbox exits; returns the exit code.
    async fn wait(&self, container_id: &str) -> Result<i64>;
    async fn kill(&self, container_id: &str) -> Result<()>;
    async fn logs(&self, container_id: &str) -> Result<String>;
    async fn remove(&self, container_id: &str) -> Result<()>;
}

/// Shells out to the `docker` CLI.
pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self { binary: "docker".to_string() }
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawning `{} {}`", self.binary, args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "`{} {}` failed: {}",
                self.binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        ensure_network_denied(spec)?;

        let memory = format!("{MEMORY_LIMIT_MB}m");
        let mount = format!("{}:/work", spec.workspace.display());

        let mut args: Vec<String> = vec![
            "create".into(),
            "--network".into(),
            "none".into(),
            "--memory".into(),
            memory.clone(),
            "--memory-swap".into(),
            // equal to --memory: no swap headroom
            memory,
            "--cpus".into(),
            CPU_QUOTA.into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "-v".into(),
            mount,
        ];
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.docker(&arg_refs).await
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker(&["start", container_id]).await?;
        Ok(())
    }

    async fn wait(&self, container_id: &str) -> Result<i64> {
        let out = self.docker(&["wait", container_id]).await?;
        out.trim()
            .parse::<i64>()
            .with_context(|| format!("parsing docker wait output `{out}`"))
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        self.docker(&["kill", container_id]).await?;
        Ok(())
    }

    async fn logs(&self, container_id: &str) -> Result<String> {
        // stderr is interleaved into the capture; harness output is stdout only
        let output = Command::new(&self.binary)
            .args(["logs", container_id])
            .stdin(Stdio::null())
            .output()
            .await
            .context("spawning docker logs")?;
        if !output.status.success() {
            bail!(
                "docker logs failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.docker(&["rm", "-f", container_id]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_enabled_spec_is_refused() {
        let spec = SandboxSpec {
            image: "generic".into(),
            workspace: "/tmp/w".into(),
            env: vec![],
            network_enabled: true,
        };
        assert!(ensure_network_denied(&spec).is_err());
    }
}
