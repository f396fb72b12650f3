use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube::{CustomResourceExt, ResourceExt};
use tracing::info;

use rset_apply::{apply_common_metadata, normalize, set_owner_labels};
use rset_controller::{KubeEventSink, Reconciler, ReconcilerConfig};
use rset_core::crd::{ResourceSet, ResourceSetInputProvider};
use rset_core::digest::{digest_objects, objects_to_yaml};
use rset_core::Json;
use rset_kubehub::{KubeStoreFactory, MemoryStore};
use rset_template::{Builder, CelLite, TemplateBuilder};

#[derive(Parser, Debug)]
#[command(name = "rsetctl", version, about = "ResourceSet operator")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Yaml)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Yaml, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the ResourceSet controller against the current kube context
    Run {
        /// Field manager used for server-side apply
        #[arg(long, env = "RSET_FIELD_MANAGER", default_value = "flux-operator")]
        field_manager: String,
        /// Service account impersonated when a ResourceSet names none
        #[arg(long, env = "RSET_DEFAULT_SERVICE_ACCOUNT")]
        default_service_account: Option<String>,
        /// Requeue delay while dependencies are not ready
        #[arg(long, env = "RSET_REQUEUE_DEPENDENCY", default_value = "5s", value_parser = parse_duration)]
        requeue_dependency: Duration,
        /// Distinct digests kept in status.history
        #[arg(long, env = "RSET_HISTORY_LIMIT", default_value_t = 5)]
        history_limit: usize,
        /// Prometheus listener, e.g. 0.0.0.0:8080
        #[arg(long, env = "RSET_METRICS_ADDR")]
        metrics_addr: Option<String>,
    },
    /// Print the CustomResourceDefinitions
    Crds,
    /// Render a ResourceSet from a file using its inline inputs
    Build {
        /// ResourceSet manifest
        #[arg(short = 'f', long = "file")]
        file: String,
        /// Namespace when the manifest has none
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    rset_core::duration::parse(s).map_err(|e| e.to_string())
}

fn init_tracing() {
    let env = std::env::var("RSET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<&str>) {
    let Some(addr) = addr else { return };
    if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        }
    } else {
        tracing::warn!(addr = %addr, "invalid metrics address; expected host:port");
    }
}

/// Objects a ResourceSet would apply, shaped as the controller shapes them
/// (minus `copyFrom`), and their digest.
async fn render(rs: &ResourceSet, builder: &dyn Builder) -> Result<(Vec<Json>, String)> {
    if !rs.spec.inputs_from.is_empty() {
        bail!("inputsFrom needs a cluster; only inline inputs are rendered offline");
    }
    let inputs = rset_inputs::resolve_inputs(&MemoryStore::new(), rs).await?;
    let mut objects = builder.build(rs.spec.resources_template.as_deref(), &rs.spec.resources, &inputs)?;
    set_owner_labels(&mut objects, &rs.name_any(), &rs.namespace().unwrap_or_default());
    normalize(&mut objects)?;
    if let Some(common) = &rs.spec.common_metadata {
        apply_common_metadata(&mut objects, common);
    }
    let digest = digest_objects(&objects)?;
    Ok((objects, digest))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { field_manager, default_service_account, requeue_dependency, history_limit, metrics_addr } => {
            init_metrics(metrics_addr.as_deref());
            let config = ReconcilerConfig {
                field_manager: field_manager.clone(),
                default_service_account,
                requeue_dependency,
                history_limit,
                ..ReconcilerConfig::default()
            };
            let factory = KubeStoreFactory::infer().await?;
            let client = factory.client();
            let events = Arc::new(KubeEventSink::new(client.clone(), &field_manager));
            let reconciler = Reconciler::new(Arc::new(factory), Arc::new(TemplateBuilder::default()), Arc::new(CelLite), events, config);
            rset_controller::run(client, Arc::new(reconciler)).await?;
        }
        Commands::Crds => {
            let crds = [ResourceSet::crd(), ResourceSetInputProvider::crd()];
            match cli.output {
                Output::Yaml => {
                    for crd in &crds {
                        println!("---\n{}", serde_yaml::to_string(crd)?.trim_end());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&crds)?),
            }
        }
        Commands::Build { file, namespace } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file))?;
            let mut rs: ResourceSet = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", file))?;
            if rs.metadata.namespace.as_deref().map_or(true, str::is_empty) {
                rs.metadata.namespace = Some(namespace);
            }
            let (objects, digest) = render(&rs, &TemplateBuilder::default()).await?;
            info!(objects = objects.len(), digest = %digest, "built");
            match cli.output {
                Output::Yaml => print!("{}", objects_to_yaml(&objects)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&objects)?),
            }
            eprintln!("digest: {}", digest);
        }
    }
    Ok(())
}
