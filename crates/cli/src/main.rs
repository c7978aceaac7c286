use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use shoal_core::{key_fn, meta_namespace_key, KeyFn, StoreError};
use shoal_informer::{EventHandler, Informer, InformerConfig, MockSource};
use shoal_queue::WorkQueue;
use shoal_store::ObjectStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod pods;

use pods::Pod;

#[derive(Parser, Debug)]
#[command(name = "shoalctl", version, about = "Shoal cache demos")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Only print objects in this namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fill a work queue with the words of a sentence and drain it
    Queue {
        #[arg(long, default_value = "the quick brown fox jumps over the lazy dog")]
        sentence: String,
        /// Delay before the producer starts, in milliseconds
        #[arg(long = "delay-ms", default_value_t = 500)]
        delay_ms: u64,
    },
    /// Build a store of books keyed by author/title and query it
    Store,
    /// Run an informer over a simulated pod collection until Ctrl-C
    Watch {
        /// Pods present before the informer starts
        #[arg(long, default_value_t = 5)]
        pods: usize,
        /// Interval between simulated changes, in milliseconds
        #[arg(long = "churn-ms", default_value_t = 1000)]
        churn_ms: u64,
        /// Periodic resync interval in seconds; 0 disables
        #[arg(long = "resync-secs", env = "SHOAL_RESYNC_SECS", default_value_t = 30)]
        resync_secs: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("SHOAL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SHOAL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SHOAL_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Queue { sentence, delay_ms } => run_queue(&sentence, Duration::from_millis(delay_ms), cli.output).await,
        Commands::Store => run_store(cli.output),
        Commands::Watch { pods, churn_ms, resync_secs } => {
            let config = InformerConfig::from_env("pods").with_resync(Duration::from_secs(resync_secs));
            run_watch(pods, Duration::from_millis(churn_ms.max(1)), config, cli.namespace, cli.output).await
        }
    }
}

async fn run_queue(sentence: &str, delay: Duration, output: Output) -> Result<()> {
    // Items carry their position so repeated words are not coalesced.
    let queue: Arc<WorkQueue<(usize, String)>> = Arc::new(WorkQueue::named("words"));
    let words: Vec<String> = sentence.split_whitespace().map(str::to_string).collect();
    info!(words = words.len(), delay_ms = delay.as_millis() as u64, "queue demo starting");

    let producer = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move {
            tokio::time::sleep(delay).await;
            for (i, w) in words.into_iter().enumerate() {
                queue.add((i, w));
            }
            queue.shut_down();
        }
    });

    let mut drained = Vec::new();
    while let Some(item) = queue.get().await {
        if output == Output::Human {
            println!("{:>3}  {}", item.0, item.1);
        }
        queue.done(&item);
        drained.push(item.1);
    }
    producer.await.context("producer task")?;

    match output {
        Output::Human => println!("queue shut down; consumer finished after {} item(s)", drained.len()),
        Output::Json => println!("{}", serde_json::to_string_pretty(&drained)?),
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Shelved {
    Book { author: String, title: String },
    Magazine { issue: u32 },
}

fn book(author: &str, title: &str) -> Shelved {
    Shelved::Book { author: author.to_string(), title: title.to_string() }
}

fn shelf_key() -> KeyFn<Shelved> {
    key_fn(|it: &Shelved| match it {
        Shelved::Book { author, title } => Ok(format!("{}/{}", author, title)),
        Shelved::Magazine { .. } => Err(StoreError::InvalidObject("magazines have no author/title".into())),
    })
}

fn run_store(output: Output) -> Result<()> {
    let store = ObjectStore::new(shelf_key());
    let moby = book("Herman Melville", "Moby Dick");
    for b in [moby.clone(), book("Charles Dickens", "David Copperfield"), book("Leo Tolstoy", "War and Peace")] {
        store.add(b)?;
    }
    if let Err(e) = store.add(Shelved::Magazine { issue: 12 }) {
        warn!(error = %e, "rejected");
    }

    let by_obj = store.get(&moby)?;
    let by_key = store.get_by_key("Charles Dickens/David Copperfield");
    let mut keys = store.list_keys();
    keys.sort();

    match output {
        Output::Human => {
            println!("get(Moby Dick)           -> {}", if by_obj.is_some() { "found" } else { "missing" });
            println!("get_by_key(Dickens/...)  -> {}", if by_key.is_some() { "found" } else { "missing" });
            println!("KEY");
            for k in &keys {
                println!("{}", k);
            }
        }
        Output::Json => {
            let mut items: Vec<Shelved> = store.list().iter().map(|b| (**b).clone()).collect();
            items.sort_by_key(|b| serde_json::to_string(b).unwrap_or_default());
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }
    Ok(())
}

struct Printer {
    namespace: Option<String>,
    output: Output,
}

impl Printer {
    fn emit(&self, verb: &str, pod: &Pod) {
        if self.namespace.as_deref().is_some_and(|ns| ns != pod.namespace) {
            return;
        }
        match self.output {
            Output::Human => println!(
                "{:<4}{:<10} {:<10} {:<10} restarts={}",
                verb,
                pod.namespace,
                pod.name,
                format!("{:?}", pod.phase),
                pod.restarts
            ),
            Output::Json => match serde_json::to_string(&serde_json::json!({ "type": verb, "pod": pod })) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to encode event"),
            },
        }
    }
}

impl EventHandler<Pod> for Printer {
    fn on_add(&self, obj: &Pod) {
        self.emit("ADD", obj);
    }

    fn on_update(&self, old: &Pod, new: &Pod) {
        // resync redelivers unchanged objects
        if old != new {
            self.emit("MOD", new);
        }
    }

    fn on_delete(&self, obj: &Pod) {
        self.emit("DEL", obj);
    }
}

async fn run_watch(
    initial: usize,
    churn_every: Duration,
    config: InformerConfig,
    namespace: Option<String>,
    output: Output,
) -> Result<()> {
    let source = MockSource::new(key_fn(meta_namespace_key::<Pod>));
    source.seed(pods::initial(initial))?;
    info!(pods = initial, churn_ms = churn_every.as_millis() as u64, config = ?config.summary(), "watch invoked");

    let informer = Informer::new(source.clone(), key_fn(meta_namespace_key::<Pod>), config);
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let informer = informer.clone();
        let cancel = cancel.clone();
        async move { informer.run(cancel).await }
    });

    tokio::select! {
        res = informer.wait_for_sync(&cancel) => res.context("waiting for cache sync")?,
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received before sync");
            cancel.cancel();
        }
    }
    if cancel.is_cancelled() {
        run.await.context("informer task")??;
        return Ok(());
    }
    info!(objects = informer.lister().len(), version = %informer.last_sync_version(), "cache synced");
    informer.add_handler(Printer { namespace, output });

    let churn = tokio::spawn(pods::churn(source, initial, churn_every, cancel.child_token()));
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
    }
    info!("Ctrl-C received; shutting down watch");
    cancel.cancel();
    if let Err(e) = churn.await {
        warn!(error = %e, "churn task ended abnormally");
    }
    run.await.context("informer task")??;
    Ok(())
}
