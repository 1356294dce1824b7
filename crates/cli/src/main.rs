use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use skerry_core::{Config, ObjectRef, ResourceIdentity, TypedObject};
use skerry_kubehub::{parse_gvk_key, DiscoveredResource, KubeTransport, Transport};
use skerry_registry::{guess_plural, Registry};
use skerry_store::{LoadOptions, ObjectStore, WatchConfig, WatchCoordinator};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "skerryctl", version, about = "Skerry CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to scope ls/watch to, or of the referenced object for link
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// List objects for a group/version/kind key
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Watch objects for a GVK and print +/- events
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
    },
    /// Resolve an object reference to an API URL
    Link {
        #[arg(long)]
        kind: String,
        #[arg(long = "api-version")]
        api_version: String,
        #[arg(long)]
        name: String,
        /// Namespace of the referring object, used when the reference has none
        #[arg(long = "parent-ns")]
        parent_namespace: Option<String>,
        /// Skip discovery and resolve against an empty registry
        #[arg(long, action = ArgAction::SetTrue)]
        offline: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("SKERRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SKERRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SKERRY_METRICS_ADDR; expected host:port");
        }
    }
}

/// Resolve a GVK key through discovery, guessing the plural when discovery does not know it.
fn resolve_gvk(gvk: &str, discovered: &[DiscoveredResource]) -> Result<DiscoveredResource> {
    let (group, version, kind) = parse_gvk_key(gvk).ok_or_else(|| anyhow!("invalid gvk key: {gvk}"))?;
    if let Some(found) = discovered.iter().find(|r| r.group == group && r.version == version && r.kind == kind) {
        return Ok(found.clone());
    }
    warn!(gvk = %gvk, "not found in discovery; guessing plural");
    let identity = ResourceIdentity::new(&kind, &group, &version, &guess_plural(&kind));
    Ok(DiscoveredResource {
        group: identity.group,
        version: identity.version,
        kind: identity.kind,
        plural: identity.plural,
        namespaced: true,
    })
}

async fn store_for_gvk(gvk: &str, cfg: &Config) -> Result<Arc<ObjectStore>> {
    let kube_client = kube::Client::try_default().await.context("connecting to cluster")?;
    let discovered = skerry_kubehub::discover(kube_client.clone()).await.unwrap_or_else(|e| {
        warn!(error = %e, "discovery failed");
        Vec::new()
    });
    let resource = resolve_gvk(gvk, &discovered)?;
    let transport: Arc<dyn Transport> = Arc::new(KubeTransport::new(kube_client));
    Ok(ObjectStore::new(Arc::new(resource.client(transport, cfg.request_timeout))))
}

fn load_options(ns: Option<&str>) -> LoadOptions {
    match ns {
        Some(ns) => LoadOptions::namespaces([ns]),
        None => LoadOptions::default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = Config::from_env();

    match cli.command {
        Commands::Discover => {
            info!("discover invoked");
            let client = kube::Client::try_default().await.context("connecting to cluster")?;
            match skerry_kubehub::discover(client).await {
                Ok(resources) => match cli.output {
                    Output::Human => {
                        for r in resources {
                            let scope = if r.namespaced { "namespaced" } else { "cluster" };
                            println!("{} • {} • {} • {}", r.identity().api_version_with_group(), r.kind, r.plural, scope);
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
                },
                Err(e) => {
                    error!(error = ?e, "discover failed");
                    eprintln!("discover error: {}", e);
                }
            }
        }
        Commands::Ls { gvk } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, "ls invoked");
            let store = store_for_gvk(&gvk, &cfg).await?;
            store.load_all(load_options(ns)).await.with_context(|| format!("listing {gvk}"))?;
            let items = store.items();
            match cli.output {
                Output::Human => {
                    println!("{:<24} {:<48} {:>8}", "NAMESPACE", "NAME", "AGE");
                    for obj in &items {
                        println!("{:<24} {:<48} {:>8}", obj.namespace().unwrap_or("-"), obj.name(), render_age(obj.creation_ts()));
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = items.iter().map(|o| o.to_value()).collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
            eprintln!("{} {} item(s), resourceVersion {}", items.len(), gvk, store.last_resource_version().unwrap_or_default());
        }
        Commands::Watch { gvk } => {
            let ns = cli.namespace.as_deref();
            info!(gvk = %gvk, ns = ?ns, "watch invoked");
            let store = store_for_gvk(&gvk, &cfg).await?;
            let coordinator = WatchCoordinator::new(WatchConfig::from(&cfg));
            let handle = store.load_and_watch(load_options(ns), &coordinator).await.with_context(|| format!("watching {gvk}"))?;

            let mut seen: HashMap<String, (String, String)> = HashMap::new();
            print_changes(&store.items(), &mut seen, cli.output);
            let mut epochs = store.subscribe_epoch();
            loop {
                tokio::select! {
                    changed = epochs.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        print_changes(&store.items(), &mut seen, cli.output);
                        if let Some(e) = store.last_error() {
                            warn!(error = %e, "store reports an error");
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("interrupted; shutting down");
                        break;
                    }
                }
            }
            handle.unsubscribe();
        }
        Commands::Link { kind, api_version, name, parent_namespace, offline } => {
            let registry = Registry::new();
            if !offline {
                let client = kube::Client::try_default().await.context("connecting to cluster")?;
                let transport: Arc<dyn Transport> = Arc::new(KubeTransport::new(client.clone()));
                for resource in skerry_kubehub::discover(client).await? {
                    if let Err(e) = registry.register_client(Arc::new(resource.client(transport.clone(), cfg.request_timeout))) {
                        warn!(gvk = %resource.gvk_key(), error = %e, "skipping resource");
                    }
                }
            }
            let reference = ObjectRef::new(&kind, &api_version, &name, cli.namespace.as_deref());
            let url = registry.lookup_link_from(&reference, parent_namespace.as_deref());
            match cli.output {
                Output::Human => println!("{url}"),
                Output::Json => println!("{}", serde_json::json!({ "ref": reference, "url": url })),
            }
        }
    }

    Ok(())
}

/// Diff the snapshot against what was printed before and emit +/~/- lines.
fn print_changes(items: &[Arc<TypedObject>], seen: &mut HashMap<String, (String, String)>, output: Output) {
    let mut current: HashMap<String, (String, String)> = HashMap::with_capacity(items.len());
    for obj in items {
        let key = object_key(obj);
        let rv = obj.resource_version().to_string();
        match seen.get(obj.uid()) {
            None => emit(output, "+", &key, &rv),
            Some((_, prev_rv)) if *prev_rv != rv => emit(output, "~", &key, &rv),
            Some(_) => {}
        }
        current.insert(obj.uid().to_string(), (key, rv));
    }
    for (uid, (key, rv)) in seen.iter() {
        if !current.contains_key(uid) {
            emit(output, "-", key, rv);
        }
    }
    *seen = current;
}

fn emit(output: Output, sign: &str, key: &str, rv: &str) {
    match output {
        Output::Human => println!("{} {}", sign, key),
        Output::Json => println!("{}", serde_json::json!({ "op": sign, "key": key, "resourceVersion": rv })),
    }
}

fn object_key(obj: &TypedObject) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name()),
        None => obj.name().to_string(),
    }
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 {
        return "-".to_string();
    }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
