//! flowguard command-line tool.
//!
//! Loads a configuration, then either validates it, probes the server clock,
//! or performs one read through the full pipeline (gates, retries, micro-cache).

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

use flowguard::cache::DataClass;
use flowguard::clock::ClockSynchronizer;
use flowguard::config::{load_config, FlowguardConfig};
use flowguard::observability::logging::init_logging;
use flowguard::observability::metrics::init_metrics;
use flowguard::observability::{MetricsObserver, NoopObserver, Observer};
use flowguard::transport::{ApiRequest, HttpDispatcher};
use flowguard::{CancelToken, ResilientClient};

#[derive(Parser)]
#[command(name = "flowguard")]
#[command(about = "Rate-limit aware client for trading APIs", long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the effective settings
    CheckConfig,
    /// Probe the server clock once and print the offset
    SyncClock,
    /// Fetch a path through the gates, retries and micro-cache
    Get {
        /// Path relative to the configured base URL
        path: String,

        /// Symbol query parameter
        #[arg(long)]
        symbol: Option<String>,

        /// Freshness class selecting the micro-cache TTL
        #[arg(long, value_enum, default_value_t = ClassArg::Ticker)]
        class: ClassArg,

        /// Identity whose quota the request draws from
        #[arg(long)]
        identity: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ClassArg {
    Ticker,
    OrderBook,
    Reference,
}

impl From<ClassArg> for DataClass {
    fn from(arg: ClassArg) -> Self {
        match arg {
            ClassArg::Ticker => DataClass::Ticker,
            ClassArg::OrderBook => DataClass::OrderBook,
            ClassArg::Reference => DataClass::Reference,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => FlowguardConfig::default(),
    };

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "flowguard starting");

    let observer: Arc<dyn Observer> = if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
        Arc::new(MetricsObserver)
    } else {
        Arc::new(NoopObserver)
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::CheckConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            println!("# configuration is valid");
        }
        Commands::SyncClock => {
            let dispatcher = Arc::new(HttpDispatcher::new(&config.transport)?);
            let clock = ClockSynchronizer::new(dispatcher, config.clock.clone(), observer);
            match clock.sync(&cancel).await {
                Some(sample) => println!(
                    "offset: {} ms (round trip {} ms), corrected now: {}",
                    sample.offset.num_milliseconds(),
                    sample.round_trip.as_millis(),
                    clock.corrected_now().to_rfc3339()
                ),
                None => {
                    eprintln!("clock sync failed; see log for details");
                    std::process::exit(1);
                }
            }
        }
        Commands::Get {
            path,
            symbol,
            class,
            identity,
        } => {
            let client = ResilientClient::from_config(config, observer)?;

            let mut request = ApiRequest::get(path);
            if let Some(symbol) = symbol {
                request = request.with_query("symbol", symbol.to_ascii_uppercase());
            }
            if let Some(identity) = identity {
                request = request.with_identity(identity);
            }

            let result = client.get_cached(request, class.into(), &cancel).await;
            client.shutdown();

            let response = result?;
            println!("HTTP {}", response.status);
            println!("{}", response.body);
        }
    }

    Ok(())
}
