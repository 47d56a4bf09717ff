use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use iptracker::config::{CacheArgs, FieldArgs, UpstreamArgs};
use iptracker::lookup::{IpApiClient, ResolutionEngine};
use iptracker::metrics::Metrics;
use iptracker::server::{self, AppState};

/// iptracker: IP geolocation with a local cache
///
/// Resolves geolocation attributes for IP addresses, answering from the
/// local cache when it holds every requested field and asking ip-api.com
/// otherwise.
///
/// Examples:
///   iptracker serve --port 8080 --cache file
///   iptracker lookup 8.8.8.8 1.1.1.1 --fields country,city
#[derive(Parser)]
#[command(name = "iptracker", version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). RUST_LOG overrides.
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service.
    Serve(ServeArgs),
    /// Resolve hosts once and print JSON to stdout.
    Lookup(LookupArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Bind address.
    #[arg(long, env = "APP_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Bind port.
    #[arg(long, env = "APP_PORT", default_value_t = 8080)]
    port: u16,

    #[command(flatten)]
    fields: FieldArgs,

    #[command(flatten)]
    upstream: UpstreamArgs,

    #[command(flatten)]
    cache: CacheArgs,
}

#[derive(Args)]
struct LookupArgs {
    /// IP addresses to resolve.
    #[arg(required = true)]
    hosts: Vec<String>,

    /// Comma-separated fields. `fetched_at` and `data_source` add record metadata.
    #[arg(long, short = 'f')]
    fields: Option<String>,

    /// Ignore cached records.
    #[arg(long)]
    skip_cache: bool,

    #[command(flatten)]
    defaults: FieldArgs,

    #[command(flatten)]
    upstream: UpstreamArgs,

    #[command(flatten)]
    cache: CacheArgs,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Lookup(args) => lookup(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new());
    let client = Arc::new(IpApiClient::new(args.upstream.client_config()));
    let engine = ResolutionEngine::new(client, args.cache.build(), metrics.clone());

    let state = Arc::new(AppState {
        engine: Arc::new(engine),
        metrics,
        collected_fields: args.fields.collected_fields,
    });

    server::start(&args.host, args.port, state).await?;
    Ok(())
}

async fn lookup(args: LookupArgs) -> anyhow::Result<()> {
    let client = Arc::new(IpApiClient::new(args.upstream.client_config()));
    let engine = ResolutionEngine::new(client, args.cache.build(), Arc::new(Metrics::new()));

    let (fields, opts) = args.defaults.select(args.fields.as_deref());

    let hosts = args.hosts;
    let skip_cache = args.skip_cache;
    let output = tokio::task::spawn_blocking(move || -> anyhow::Result<serde_json::Value> {
        if let [host] = hosts.as_slice() {
            Ok(engine.resolve(host, &fields, skip_cache)?.to_json(opts))
        } else {
            let outcomes = engine.resolve_many(&hosts, &fields, skip_cache)?;
            Ok(outcomes.iter().map(|o| o.to_json(opts)).collect())
        }
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
