//! tfsidecar - runs terraform inside a Kubernetes pod and mirrors its
//! configuration and state between the cluster and the local filesystem.
//!
//! The binary is a thin shell: it parses flags, sets up logging, builds
//! the API client and hands control to the supervisor in
//! `tfsidecar-core`. On a terraform failure the process exits with
//! terraform's own exit code so the pod status reflects it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tfsidecar_core::client::http::{ClientConfig, HttpClient};
use tfsidecar_core::{Command, Config, Supervisor, SupervisorError};

const EXAMPLE: &str = "Example:
  tfsidecar apply \\
    --configuration-configmap-name=example.infra.tf-config \\
    --state-configmap-name=example.infra.tf-state \\
    --variables-secret-name=example.infra.tf-vars";

/// Runs terraform commands inside a Kubernetes cluster and handles pod
/// lifecycle events (e.g. shutdown signals). Reads and stores terraform
/// config and state from/to ConfigMaps and Secrets, and continuously
/// mirrors the state file into the state ConfigMap while terraform runs.
#[derive(Parser, Debug)]
#[command(name = "tfsidecar", version, about, after_help = EXAMPLE)]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Args, Debug)]
struct Options {
    /// Name of the ConfigMap that holds the main.tf and variables.tf files
    #[arg(long, global = true)]
    configuration_configmap_name: Option<String>,

    /// Name of the ConfigMap that the terraform.tfstate file should be stored in
    #[arg(long, global = true)]
    state_configmap_name: Option<String>,

    /// Name of the Secret that holds the terraform.tfvars file
    #[arg(long, global = true)]
    variables_secret_name: Option<String>,

    /// Namespace to store the configuration resources in. If unset, the
    /// NAMESPACE env var or the in-cluster config will be used
    #[arg(long, short = 'n', global = true, env = "NAMESPACE")]
    namespace: Option<String>,

    /// Path to a kubeconfig. If unset, the KUBECONFIG env var or the
    /// in-cluster config will be used
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Base directory to be used for all terraform files (defaults to '/')
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum CliCommand {
    /// Execute `terraform apply`
    Apply,
    /// Execute `terraform destroy`
    Destroy,
    /// Execute `terraform validate` (followed by `terraform plan`)
    Validate,
}

impl From<CliCommand> for Command {
    fn from(command: CliCommand) -> Self {
        match command {
            CliCommand::Apply => Self::Apply,
            CliCommand::Destroy => Self::Destroy,
            CliCommand::Validate => Self::Validate,
        }
    }
}

impl Options {
    /// Validate the required flags, mirroring their exact flag names in
    /// the error message.
    fn validated(&self) -> anyhow::Result<(String, String, String)> {
        let require = |value: &Option<String>, flag: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .with_context(|| format!("flag --{flag} was not set"))
        };

        Ok((
            require(&self.configuration_configmap_name, "configuration-configmap-name")?,
            require(&self.state_configmap_name, "state-configmap-name")?,
            require(&self.variables_secret_name, "variables-secret-name")?,
        ))
    }
}

fn init_tracing(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Refuse to start when terraform is not executable; nothing useful can
/// happen without it.
fn ensure_terraform_on_path() -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join("terraform");
        if let Ok(metadata) = candidate.metadata() {
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                return Ok(());
            }
        }
    }

    bail!("terraform is not installed or not on PATH, cannot start tfsidecar")
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    info!(version = tfsidecar_core::VERSION, "starting tfsidecar");
    info!(options = ?cli.options, command = ?cli.command, "effective options");

    let (configuration_config_map_name, state_config_map_name, variables_secret_name) =
        cli.options.validated()?;

    ensure_terraform_on_path()?;

    let client_config = ClientConfig::resolve(cli.options.kubeconfig.as_deref())
        .context("failed to create kubernetes client")?;

    let namespace = cli
        .options
        .namespace
        .clone()
        .or_else(|| client_config.default_namespace.clone())
        .unwrap_or_else(|| "default".to_owned());

    let client =
        HttpClient::new(client_config).context("failed to create kubernetes client")?;

    let config = Config {
        configuration_config_map_name,
        state_config_map_name,
        variables_secret_name,
        namespace,
        base_dir: cli.options.base_dir.clone(),
    };

    let supervisor = Arc::new(Supervisor::new(config, Arc::new(client)));
    supervisor.run(cli.command.into()).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.options.log_level);

    if let Err(err) = run(cli).await {
        error!("error running tfsidecar: {err:#}");

        let exit_code = err
            .downcast_ref::<SupervisorError>()
            .map_or(1, SupervisorError::exit_code);
        std::process::exit(exit_code);
    }
}
