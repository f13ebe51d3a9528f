use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use tether_api::{ClusterEvent, ClusterId, ClusterStatusReport, ListOptions, ResourceRequest, Tether};
use tether_kubehub::kubeconfig;

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig file (default: $KUBECONFIG or ~/.kube/config)
    #[arg(long = "kubeconfig", env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register and connect every context, then print their status
    Clusters,
    /// Get one object or list a kind through the interceptor chain
    Get {
        /// Kind, plural or CRD kind, e.g. "Pod", "deployments", "Certificate"
        kind: String,
        /// Object name; omit to list
        name: Option<String>,
        /// API group when a kind is served by several groups
        #[arg(long = "group")]
        group: Option<String>,
        /// Context to use (default: current-context)
        #[arg(long = "context")]
        context: Option<String>,
        /// Namespace
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// List across all namespaces
        #[arg(short = 'A', long = "all-namespaces", action = ArgAction::SetTrue)]
        all_namespaces: bool,
        /// Label selector
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Create or update every document of a YAML file
    Apply {
        #[arg(short = 'f', long = "filename")]
        file: PathBuf,
        #[arg(long = "context")]
        context: Option<String>,
    },
    /// Connect every context and stream connectivity events until Ctrl-C
    Watch,
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

fn kubeconfig_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(p) = flag {
        return Ok(p);
    }
    let home = std::env::var("HOME").context("HOME not set and no --kubeconfig given")?;
    Ok(Path::new(&home).join(".kube").join("config"))
}

/// Reads the kubeconfig and registers all of its contexts. Returns the file label and content.
fn load(tether: &Tether, path: &Path) -> Result<(String, String)> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let label = path.file_name().and_then(|n| n.to_str()).unwrap_or("kubeconfig").to_string();
    tether.register_kubeconfig(&label, &content)?;
    Ok((label, content))
}

fn pick_context(label: &str, content: &str, requested: Option<String>) -> Result<ClusterId> {
    let ctx = match requested {
        Some(c) => c,
        None => kubeconfig::current_context(content)?.ok_or_else(|| anyhow!("no current-context; pass --context"))?,
    };
    Ok(ClusterId::new(label, ctx))
}

fn print_value(output: Output, v: &Value) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(v)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(v)?),
        Output::Human => {
            let ns = v.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or("-");
            let name = v.pointer("/metadata/name").and_then(Value::as_str).unwrap_or("?");
            let age = v.pointer("/metadata/creationTimestamp").and_then(Value::as_str).unwrap_or("");
            println!("{:<24} {:<48} {}", ns, name, age);
        }
    }
    Ok(())
}

fn print_clusters(output: Output, clusters: &[ClusterStatusReport]) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(clusters)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(clusters)?),
        Output::Human => {
            for c in clusters {
                let version = c.server_version.as_deref().unwrap_or("-");
                let endpoint = c.endpoint.as_deref().unwrap_or("-");
                println!("{} • {} • {} • {}", c.id, c.status, version, endpoint);
                if let Some(err) = &c.last_error {
                    println!("    last error: {}", err);
                }
            }
        }
    }
    Ok(())
}

fn describe_event(ev: &ClusterEvent) -> String {
    match ev {
        ClusterEvent::StatusChanged { id, from, to } => format!("{} {} -> {}", id, from, to),
        ClusterEvent::HeartbeatFailed { id, consecutive } => format!("{} heartbeat failed ({} in a row)", id, consecutive),
        ClusterEvent::ReconnectStarted { id } => format!("{} reconnecting", id),
        ClusterEvent::ReconnectSucceeded { id, attempt } => format!("{} reconnected on attempt {}", id, attempt),
        ClusterEvent::ReconnectExhausted { id, attempts } => format!("{} gave up after {} attempts", id, attempts),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let path = kubeconfig_path(cli.kubeconfig)?;
    let tether = Tether::with_kube();
    let (label, content) = load(&tether, &path)?;

    match cli.command {
        Commands::Clusters => {
            let t0 = Instant::now();
            for (id, res) in tether.connect_all().await {
                if let Err(e) = res {
                    warn!(cluster = %id, error = %e, "connect failed");
                }
            }
            info!(took_ms = %t0.elapsed().as_millis(), "clusters connected");
            print_clusters(cli.output, &tether.list_clusters())?;
        }
        Commands::Get { kind, name, group, context, namespace, all_namespaces, selector } => {
            let id = pick_context(&label, &content, context)?;
            tether.connect(&id).await?;
            let mut req = match name {
                Some(n) => ResourceRequest::get(id.clone(), kind, n),
                None => {
                    let mut opts = ListOptions::default();
                    if let Some(sel) = selector {
                        opts = opts.labels(sel);
                    }
                    if all_namespaces {
                        opts = opts.all_namespaces();
                    }
                    ResourceRequest::list(id.clone(), kind).list_options(opts)
                }
            };
            if let Some(g) = group {
                req = req.group(g);
            }
            if let Some(ns) = namespace {
                req = req.namespace(ns);
            }
            let out = tether.execute(req).await?;
            match (cli.output, out.into_value()) {
                (Output::Human, Value::Array(items)) => {
                    for item in &items {
                        print_value(Output::Human, item)?;
                    }
                    info!(count = items.len(), "listed");
                }
                (fmt, v) => print_value(fmt, &v)?,
            }
        }
        Commands::Apply { file, context } => {
            let id = pick_context(&label, &content, context)?;
            let yaml = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            tether.connect(&id).await?;
            for out in tether.apply_yaml(&id, &yaml).await? {
                print_value(cli.output, &out.into_value())?;
            }
        }
        Commands::Watch => {
            let mut rx = tether.subscribe();
            for (id, res) in tether.connect_all().await {
                if let Err(e) = res {
                    warn!(cluster = %id, error = %e, "connect failed; reconnecting in background");
                    if let Err(e) = tether.registry().start_reconnect(&id) {
                        warn!(cluster = %id, error = %e, "could not start reconnect");
                    }
                }
            }
            print_clusters(cli.output, &tether.list_clusters())?;
            loop {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("received Ctrl-C; shutting down");
                        break;
                    }
                    ev = rx.recv() => match ev {
                        Ok(ev) => match cli.output {
                            Output::Human => println!("{}", describe_event(&ev)),
                            Output::Json => println!("{}", serde_json::to_string(&ev)?),
                            Output::Yaml => print!("---\n{}", serde_yaml::to_string(&ev)?),
                        },
                        Err(RecvError::Lagged(n)) => warn!(skipped = n, "event stream lagged"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }
    }
    tether.shutdown();
    Ok(())
}
