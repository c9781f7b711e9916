//! Container control for NLU runtime instances.
//!
//! [`ContainerRuntime`] is the seam the lifecycle manager drives; [`DockerCli`] implements it by
//! shelling out to the container CLI (`docker` by default) with `tokio::process`.

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("container command timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Command(String),
    #[error("spawning container cli: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything needed to create one runtime container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host port bound to the NLU runtime's container port.
    pub host_port: u16,
    pub container_port: u16,
    /// Host port bound to the action server's container port.
    pub action_host_port: u16,
    pub action_container_port: u16,
    pub restart_policy: String,
    /// Overrides the image command when non-empty.
    pub command: Vec<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (not start) a container; returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError>;

    async fn start(&self, id: &str) -> Result<(), ContainerError>;

    /// Graceful stop: the runtime kills the process once `grace` elapses.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), ContainerError>;

    /// Forced removal.
    async fn remove(&self, id: &str) -> Result<(), ContainerError>;
}

pub struct DockerCli {
    cli: String,
    command_timeout: Duration,
}

impl DockerCli {
    pub fn new(cli: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            cli: cli.into(),
            command_timeout,
        }
    }

    /// Run one CLI invocation and return trimmed stdout.
    async fn run(&self, target: &str, args: &[String], limit: Duration) -> Result<String, ContainerError> {
        log::debug!("{} {}", self.cli, args.join(" "));
        let child = tokio::process::Command::new(&self.cli)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => return Err(ContainerError::Timeout(limit)),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.contains("No such container") {
                return Err(ContainerError::NotFound(target.to_string()));
            }
            return Err(ContainerError::Command(format!(
                "{} {} failed: {}",
                self.cli,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// `docker create` arguments for a runtime container.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--restart".to_string(),
        spec.restart_policy.clone(),
        "-p".to_string(),
        format!("{}:{}", spec.host_port, spec.container_port),
        "-p".to_string(),
        format!("{}:{}", spec.action_host_port, spec.action_container_port),
        spec.image.clone(),
    ];
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let id = self
            .run(&spec.name, &create_args(spec), self.command_timeout)
            .await?;
        if id.is_empty() {
            return Err(ContainerError::Command(format!(
                "{} create returned no container id",
                self.cli
            )));
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.run(id, &["start".to_string(), id.to_string()], self.command_timeout)
            .await
            .map(|_| ())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), ContainerError> {
        let args = [
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            id.to_string(),
        ];
        self.run(id, &args, grace + self.command_timeout)
            .await
            .map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        self.run(id, &["rm".to_string(), "-f".to_string(), id.to_string()], self.command_timeout)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "rasa_acme".into(),
            image: "docubot-rasa:latest".into(),
            host_port: 6001,
            container_port: 5005,
            action_host_port: 6051,
            action_container_port: 5055,
            restart_policy: "unless-stopped".into(),
            command: vec!["bash".into(), "-c".into(), "rasa run --enable-api".into()],
        }
    }

    #[test]
    fn create_args_bind_both_ports() {
        let args = create_args(&spec());
        assert_eq!(args[0], "create");
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "6001:5005"));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "6051:5055"));
        assert!(args.windows(2).any(|w| w[0] == "--name" && w[1] == "rasa_acme"));
        let image = args.iter().position(|a| a == "docubot-rasa:latest").unwrap();
        assert_eq!(args[image + 1..], ["bash", "-c", "rasa run --enable-api"]);
    }

    #[test]
    fn empty_command_ends_with_image() {
        let mut spec = spec();
        spec.command.clear();
        let args = create_args(&spec);
        assert_eq!(args.last().map(String::as_str), Some("docubot-rasa:latest"));
    }

    #[tokio::test]
    async fn missing_cli_is_io_error() {
        let docker = DockerCli::new("botrelay-no-such-cli", Duration::from_secs(1));
        let err = docker.start("abc").await.unwrap_err();
        assert!(matches!(err, ContainerError::Io(_)));
    }
}
