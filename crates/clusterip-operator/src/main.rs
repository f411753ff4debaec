//! cluster-ip - publishes the external IP of every node group on ClusterIP resources

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;

use clusterip_common::crd::ClusterIP;
use clusterip_common::kube_utils::create_client;
use clusterip_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use clusterip_common::{DEFAULT_MIN_AGREE, DEFAULT_SYSTEM_NAMESPACE};
use clusterip_controller::controller::DEFAULT_PROBE_SERVICE_ACCOUNT;
use clusterip_controller::ProbeConfig;
use clusterip_operator::controller_runner::{
    build_convergence_controllers, build_probe_controllers, ControllerFuture, ConvergenceSettings,
};
use clusterip_operator::startup::{discover_probe_image, ensure_crd_installed};
use clusterip_resolver::{default_sources, HttpIpSource, QuorumResolver, SourceSpec};

/// cluster-ip - reports the external IPv4 address of each node group
#[derive(Parser, Debug)]
#[command(name = "cluster-ip", version, about, long_about = None)]
struct Cli {
    /// Print the ClusterIP CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log line format
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormatArg::Json, global = true)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the convergence controller (default mode)
    ///
    /// Watches ClusterIPs and Nodes, keeps one probe agent per node group
    /// until that group's IP is confirmed, and maintains the aggregate state.
    Controller(ControllerArgs),

    /// Run a probe agent for one node group
    ///
    /// Resolves the external IP seen from this node and records it on every
    /// ClusterIP that groups nodes by the same label.
    Probe(ProbeArgs),
}

#[derive(Parser, Debug, Clone, PartialEq)]
struct ControllerArgs {
    /// Namespace probe agents are created in
    #[arg(long, env = "POD_NAMESPACE", default_value = DEFAULT_SYSTEM_NAMESPACE)]
    namespace: String,

    /// Image for probe agents; read from this pod when unset
    #[arg(long, env = "PROBE_IMAGE")]
    probe_image: Option<String>,

    /// Service account probe agents run as
    #[arg(long, env = "PROBE_SERVICE_ACCOUNT", default_value = DEFAULT_PROBE_SERVICE_ACCOUNT)]
    probe_service_account: String,

    /// Do not install or update the ClusterIP CRD on startup
    #[arg(long)]
    skip_crd_install: bool,
}

#[derive(Args, Debug, Clone, PartialEq)]
struct ProbeArgs {
    /// Node label key that defines node groups
    #[arg(long)]
    node_spread_label: String,

    /// Value of that label on this probe's node
    #[arg(long)]
    node_label: String,

    /// Number of IP sources that must agree
    #[arg(long, env = "MIN_AGREE", default_value_t = DEFAULT_MIN_AGREE)]
    min_agree: usize,

    /// Per-source request timeout in seconds
    #[arg(long, env = "SOURCE_TIMEOUT_SECS", default_value_t = 5)]
    source_timeout_secs: u64,

    /// IP source as name=url#field (repeatable; defaults to public services)
    #[arg(long = "ip-source", env = "IP_SOURCES", value_delimiter = ',')]
    ip_sources: Vec<SourceSpec>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and reqwest both link rustls; pin the process-wide provider.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install the aws-lc-rs crypto provider: {:?}. \
             TLS connections to the API server and IP sources cannot be made.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", serde_yaml::to_string(&ClusterIP::crd())?);
        return Ok(());
    }

    let service_name = match cli.command {
        Some(Commands::Probe(_)) => "cluster-ip-probe",
        _ => "cluster-ip-controller",
    };
    init_telemetry(TelemetryConfig::for_service(service_name).with_log_format(cli.log_format.into()))
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {}", e))?;

    let controllers = match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await?,
        Some(Commands::Probe(args)) => run_probe(args).await?,
        None => run_controller(ControllerArgs::parse_from(["cluster-ip"])).await?,
    };

    futures::future::join_all(controllers).await;
    tracing::info!("Shutting down");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<Vec<ControllerFuture>> {
    let client = create_client().await?;

    if args.skip_crd_install {
        tracing::info!("Skipping CRD installation");
    } else {
        ensure_crd_installed(&client).await?;
    }

    let probe_image = discover_probe_image(&client, args.probe_image).await?;
    tracing::info!(
        namespace = %args.namespace,
        image = %probe_image,
        "Starting cluster-ip controller"
    );

    Ok(build_convergence_controllers(
        client,
        ConvergenceSettings {
            namespace: args.namespace,
            service_account: args.probe_service_account,
            probe_image,
        },
    ))
}

async fn run_probe(args: ProbeArgs) -> anyhow::Result<Vec<ControllerFuture>> {
    let specs = if args.ip_sources.is_empty() {
        default_sources()
    } else {
        args.ip_sources
    };
    anyhow::ensure!(
        args.min_agree >= 1 && args.min_agree <= specs.len(),
        "--min-agree must be between 1 and the number of IP sources ({}), got {}",
        specs.len(),
        args.min_agree
    );
    for spec in &specs {
        tracing::info!(source = %spec.name, url = %spec.url, field = %spec.field_path, "IP source");
    }

    let sources = HttpIpSource::build_all(specs, Duration::from_secs(args.source_timeout_secs))?;
    let resolver = Arc::new(QuorumResolver::new(sources));
    let client = create_client().await?;
    tracing::info!(
        label = %args.node_spread_label,
        group = %args.node_label,
        "Starting cluster-ip probe agent"
    );

    Ok(build_probe_controllers(
        client,
        resolver,
        ProbeConfig::new(args.node_spread_label, args.node_label).with_min_agree(args.min_agree),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn probe_mode_matches_agent_arguments() {
        let cli = Cli::try_parse_from([
            "cluster-ip",
            "probe",
            "--node-spread-label",
            "topology.kubernetes.io/zone",
            "--node-label",
            "eu-west-1a",
        ])
        .expect("probe args parse");

        let Some(Commands::Probe(args)) = cli.command else {
            panic!("expected probe mode");
        };
        assert_eq!(args.node_spread_label, "topology.kubernetes.io/zone");
        assert_eq!(args.node_label, "eu-west-1a");
        assert!(args.ip_sources.is_empty());
    }

    #[test]
    fn ip_sources_are_parsed_and_repeatable() {
        let cli = Cli::try_parse_from([
            "cluster-ip",
            "probe",
            "--node-spread-label",
            "zone",
            "--node-label",
            "a",
            "--min-agree",
            "1",
            "--ip-source",
            "one=https://one.example/json#ip",
            "--ip-source",
            "two=https://two.example/all.json#data.addr",
        ])
        .expect("probe args parse");

        let Some(Commands::Probe(args)) = cli.command else {
            panic!("expected probe mode");
        };
        assert_eq!(args.min_agree, 1);
        assert_eq!(
            args.ip_sources,
            vec![
                SourceSpec::new("one", "https://one.example/json", "ip"),
                SourceSpec::new("two", "https://two.example/all.json", "data.addr"),
            ]
        );
    }

    #[test]
    fn malformed_ip_source_is_rejected() {
        let result = Cli::try_parse_from([
            "cluster-ip",
            "probe",
            "--node-spread-label",
            "zone",
            "--node-label",
            "a",
            "--ip-source",
            "ftp://nope",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn probe_requires_its_group() {
        assert!(Cli::try_parse_from(["cluster-ip", "probe", "--node-label", "a"]).is_err());
    }

    #[test]
    fn crd_flag_without_subcommand() {
        let cli = Cli::try_parse_from(["cluster-ip", "--crd"]).expect("crd flag parses");
        assert!(cli.crd);
        assert!(cli.command.is_none());
    }

    #[test]
    fn controller_flags_parse() {
        let cli = Cli::try_parse_from([
            "cluster-ip",
            "--log-format",
            "text",
            "controller",
            "--namespace",
            "ops",
            "--probe-image",
            "registry/cluster-ip:1.0",
            "--skip-crd-install",
        ])
        .expect("controller args parse");

        assert_eq!(cli.log_format, LogFormatArg::Text);
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller mode");
        };
        assert_eq!(args.namespace, "ops");
        assert_eq!(args.probe_image.as_deref(), Some("registry/cluster-ip:1.0"));
        assert!(args.skip_crd_install);
    }
}
