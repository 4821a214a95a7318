use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vertica_k8s::controller::{self, NamespacedName, OperatorConfig, PodFact};
use vertica_k8s::Error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Collect the pod facts of one VerticaDB and print them as JSON
    Collect(CollectArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace to watch; all namespaces when empty
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "")]
    namespace: String,

    /// Seconds between reconciles of a healthy VerticaDB
    #[arg(long, env = "REQUEUE_SECS", default_value_t = 30)]
    requeue_secs: u64,

    /// Free bytes on the local data volume under which a pod is reported
    #[arg(long, env = "LOW_DISK_THRESHOLD", default_value_t = 1024 * 1024 * 1024)]
    low_disk_threshold: u64,
}

#[derive(Parser, Debug)]
struct CollectArgs {
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Name of the VerticaDB
    #[arg(long)]
    name: String,

    /// Sandbox to collect; the main cluster when empty
    #[arg(long, default_value = "")]
    sandbox: String,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);
    // Logs go to stderr so `collect` output stays parseable
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("VerticaDB Operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Collect(collect_args) => {
            init_tracing(args.log_json);
            run_collect(collect_args).await
        }
        Commands::Run(run_args) => {
            init_tracing(args.log_json);
            run_operator(run_args).await
        }
    }
}

async fn run_collect(args: CollectArgs) -> Result<(), Error> {
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    let vdb = NamespacedName::new(args.namespace, args.name);
    let facts = controller::collect_once(client, &vdb, &args.sandbox).await?;
    let pods: Vec<&PodFact> = facts.iter().collect();
    println!("{}", serde_json::to_string_pretty(&pods)?);
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    info!(
        "Starting VerticaDB Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let config = OperatorConfig {
        namespace: args.namespace,
        requeue_secs: args.requeue_secs,
        low_disk_threshold: args.low_disk_threshold,
    };
    let state = Arc::new(controller::ControllerState::new(client, config));
    controller::run_controller(state).await
}
