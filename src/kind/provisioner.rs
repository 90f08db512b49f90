//! The external provisioning tool
//!
//! [`Provisioner`] is the whole surface required from the tool. The real
//! implementation shells out to `kind` (and `docker`/`kubectl` for
//! prerequisite and readiness checks).

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::args;
use super::{ClusterHandle, ProvisioningError, ToolError};
use crate::config::Settings;
use crate::streaming::{LogLevel, LogStreamer};

/// Timeout for short tool invocations (version checks, list, export)
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between readiness probes
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long to wait for the output pipes to drain after the tool exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Operations required from the cluster provisioning tool
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Create the cluster described by `handle` and return its kubeconfig path
    async fn create_cluster(&self, handle: &ClusterHandle) -> Result<PathBuf, ProvisioningError>;

    /// Delete a cluster by name
    async fn delete_cluster(&self, name: &str) -> Result<(), ToolError>;

    /// Names of currently live clusters
    async fn list_clusters(&self) -> Result<Vec<String>, ToolError>;
}

/// Provisioner backed by the kind CLI
#[derive(Debug, Clone)]
pub struct KindProvisioner {
    kind_binary: PathBuf,
    docker_binary: PathBuf,
    kubectl_binary: PathBuf,
    kubeconfig_dir: PathBuf,
    streamer: LogStreamer,
    wait: Duration,
}

impl Default for KindProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl KindProvisioner {
    pub fn new() -> Self {
        Self {
            kind_binary: PathBuf::from("kind"),
            docker_binary: PathBuf::from("docker"),
            kubectl_binary: PathBuf::from("kubectl"),
            kubeconfig_dir: std::env::temp_dir().join("kindtest"),
            streamer: LogStreamer::default(),
            wait: args::KIND_WAIT,
        }
    }

    /// Provisioner using the binaries and log settings from `settings`
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new()
            .with_kind_binary(&settings.kind_binary)
            .with_kubectl_binary(&settings.kubectl_binary)
            .with_streamer(LogStreamer::new(settings.logging.clone()))
    }

    pub fn with_kind_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.kind_binary = path.into();
        self
    }

    pub fn with_docker_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.docker_binary = path.into();
        self
    }

    pub fn with_kubectl_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubectl_binary = path.into();
        self
    }

    pub fn with_kubeconfig_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kubeconfig_dir = dir.into();
        self
    }

    pub fn with_streamer(mut self, streamer: LogStreamer) -> Self {
        self.streamer = streamer;
        self
    }

    /// kubeconfig file written for a cluster
    pub fn kubeconfig_path_for(&self, name: &str) -> PathBuf {
        self.kubeconfig_dir.join(format!("kubeconfig-{}.yaml", name))
    }

    /// Both kind and docker must respond before anything is created
    pub async fn check_prerequisites(&self) -> Result<(), ProvisioningError> {
        for binary in [&self.kind_binary, &self.docker_binary] {
            run_tool(binary, &["version".to_string()], Duration::from_secs(10))
                .await
                .map_err(|e| ProvisioningError::ToolUnavailable {
                    tool: binary.display().to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn run_create(
        &self,
        handle: &ClusterHandle,
        config_file: Option<&Path>,
    ) -> Result<(), ProvisioningError> {
        let config = handle.config();
        // a generated config already carries the image
        let image = if config.needs_generated_config() {
            None
        } else {
            config.image.as_deref()
        };
        let create_args = args::generate_create_args(handle.name(), config_file, image, self.wait);
        debug!("kind create args: {:?}", create_args);

        let mut child = Command::new(&self.kind_binary)
            .args(&create_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisioningError::ToolUnavailable {
                tool: self.kind_binary.display().to_string(),
                message: e.to_string(),
            })?;

        handle.set_process_id(child.id());
        let mut stream = self.streamer.attach(&mut child);
        handle.attach_log_tail(stream.tail_handle());

        let status = child.wait().await;
        handle.set_process_id(None);

        if timeout(DRAIN_TIMEOUT, stream.finished()).await.is_err() {
            debug!("Output of kind create for '{}' still open", handle.name());
        }
        if stream.dropped() > 0 {
            debug!(
                "Dropped {} log events while creating '{}'",
                stream.dropped(),
                handle.name()
            );
        }

        let status = status?;
        if status.success() {
            return Ok(());
        }

        let log_tail = stream.tail();
        let message = log_tail
            .iter()
            .rev()
            .find(|line| {
                crate::streaming::classify_line(
                    crate::streaming::StreamSource::Stderr,
                    line,
                    self.streamer.config(),
                ) == LogLevel::Error
            })
            .cloned()
            .unwrap_or_else(|| format!("kind exited with {}", status));

        Err(ProvisioningError::Failed {
            name: handle.name().to_string(),
            message,
            log_tail,
        })
    }

    async fn export_kubeconfig(&self, name: &str) -> Result<PathBuf, ProvisioningError> {
        let path = self.kubeconfig_path_for(name);
        let kubeconfig_err = |message: String| ProvisioningError::Kubeconfig {
            name: name.to_string(),
            message,
        };

        tokio::fs::create_dir_all(&self.kubeconfig_dir)
            .await
            .map_err(|e| kubeconfig_err(e.to_string()))?;

        run_tool(
            &self.kind_binary,
            &args::generate_export_kubeconfig_args(name, &path),
            TOOL_TIMEOUT,
        )
        .await
        .map_err(|e| kubeconfig_err(e.to_string()))?;

        info!("Kubeconfig for '{}' exported to {}", name, path.display());
        Ok(path)
    }

    /// Poll `kubectl get nodes` until the API server answers
    ///
    /// Runs until it succeeds; the caller bounds it with the creation timeout.
    async fn wait_for_ready(&self, name: &str, kubeconfig: &Path) {
        let probe_args = args::generate_probe_args(kubeconfig);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match run_tool(&self.kubectl_binary, &probe_args, Duration::from_secs(10)).await {
                Ok(_) => {
                    info!("Cluster '{}' is ready after {} probe(s)", name, attempt);
                    return;
                }
                Err(ToolError::Spawn { message, .. }) => {
                    debug!(
                        "kubectl unavailable ({}), relying on kind's own readiness wait",
                        message
                    );
                    return;
                }
                Err(e) => debug!("Cluster '{}' not ready yet: {}", name, e),
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Provisioner for KindProvisioner {
    async fn create_cluster(&self, handle: &ClusterHandle) -> Result<PathBuf, ProvisioningError> {
        self.check_prerequisites().await?;

        let existing = self.list_clusters().await.map_err(|e| {
            ProvisioningError::ToolUnavailable {
                tool: self.kind_binary.display().to_string(),
                message: e.to_string(),
            }
        })?;
        if existing.iter().any(|c| c == handle.name()) {
            return Err(ProvisioningError::AlreadyExists(handle.name().to_string()));
        }

        info!("Creating kind cluster: {}", handle.name());

        // kept alive until kind has read it
        let generated = if handle.config().needs_generated_config() {
            let yaml = args::generate_node_config(handle.config())
                .map_err(|e| ProvisioningError::Config(e.to_string()))?;
            let mut file = tempfile::Builder::new()
                .prefix("kind-config-")
                .suffix(".yaml")
                .tempfile()?;
            std::io::Write::write_all(&mut file, yaml.as_bytes())?;
            Some(file)
        } else {
            None
        };

        let config_file = handle
            .config()
            .config_path
            .as_deref()
            .or_else(|| generated.as_ref().map(|f| f.path()));

        self.run_create(handle, config_file).await?;
        drop(generated);

        let kubeconfig = self.export_kubeconfig(handle.name()).await?;
        self.wait_for_ready(handle.name(), &kubeconfig).await;

        info!("Kind cluster '{}' created", handle.name());
        Ok(kubeconfig)
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), ToolError> {
        if !self.list_clusters().await?.iter().any(|c| c == name) {
            debug!("Cluster '{}' already absent", name);
            return Ok(());
        }

        info!("Deleting kind cluster: {}", name);
        run_tool(&self.kind_binary, &args::generate_delete_args(name), TOOL_TIMEOUT * 4).await?;
        info!("Kind cluster '{}' deleted", name);
        Ok(())
    }

    async fn list_clusters(&self) -> Result<Vec<String>, ToolError> {
        let output = run_tool(&self.kind_binary, &args::generate_list_args(), TOOL_TIMEOUT).await?;
        Ok(args::parse_cluster_list(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// Run a tool to completion with a timeout, capturing its output
pub async fn run_tool(
    binary: &Path,
    args: &[String],
    limit: Duration,
) -> Result<Output, ToolError> {
    let command = format!("{} {}", binary.display(), args.join(" "));
    debug!("Running command: {}", command);

    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::Spawn {
            command: command.clone(),
            message: e.to_string(),
        })?;

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ToolError::Spawn {
            command: command.clone(),
            message: e.to_string(),
        })?,
        Err(_) => {
            warn!("Command timed out: {}", command);
            return Err(ToolError::Timeout {
                command,
                timeout: limit,
            });
        }
    };

    if !output.status.success() {
        return Err(ToolError::Failed {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}
